//! Control-plane messages: discovery announcements and the session hello.
//! Encoding is bincode; framing is length-prefix (see wire module).

use serde::{Deserialize, Serialize};

use crate::identity::{DeviceId, PeerId, PublicKey};

/// Current protocol version. Peers with another version are ignored.
pub const PROTOCOL_VERSION: u8 = 1;

/// Service tag advertised by default. Only peers with the same tag see each other.
pub const DEFAULT_SERVICE_TAG: &str = "rm-locations";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum ControlMessage {
    /// Multicast presence beacon.
    Announce(Presence),
    /// Multicast on stop: the sender is no longer advertising.
    Goodbye {
        protocol_version: u8,
        service_tag: String,
        device_id: DeviceId,
    },
    /// First frame on a new session, in both directions.
    Hello(Presence),
}

/// Who a node is and where its session listener lives.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Presence {
    pub protocol_version: u8,
    pub service_tag: String,
    pub device_id: DeviceId,
    pub public_key: PublicKey,
    pub display_name: String,
    pub listen_port: u16,
}

impl Presence {
    pub fn peer_id(&self) -> PeerId {
        PeerId::new(self.device_id, self.display_name.clone())
    }

    /// Same version and service, and the device ID really belongs to the presented key.
    pub fn is_compatible(&self, service_tag: &str) -> bool {
        self.protocol_version == PROTOCOL_VERSION
            && self.service_tag == service_tag
            && DeviceId::from_public_key(&self.public_key) == self.device_id
    }
}
