//! Nearcast protocol core.
//! Host-driven: no I/O; the host feeds discovery and session events in and sends the frames it gets back.

pub mod codec;
pub mod core;
pub mod identity;
pub mod protocol;
pub mod view;
pub mod wire;

pub use codec::{decode, encode, DecodeError, Message};
pub use self::core::{fan_out, Broadcast, ConnectError, FanOutReport, Outbox, SendError, SharingCore};
pub use identity::{DeviceId, Keypair, PeerId, PublicKey};
pub use protocol::{ControlMessage, Presence, DEFAULT_SERVICE_TAG, PROTOCOL_VERSION};
pub use view::{ConnectionState, SessionView};
pub use wire::{decode_frame, encode_frame, FrameDecodeError, FrameEncodeError};
