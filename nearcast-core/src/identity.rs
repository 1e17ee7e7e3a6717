//! Node identity and session crypto: keypairs, device IDs, peer IDs, frame sealing.

use std::fmt;
use std::hash::{Hash, Hasher};

use chacha20poly1305::aead::{Aead, KeyInit};
use chacha20poly1305::ChaCha20Poly1305;
use rand::rngs::OsRng;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use x25519_dalek::{PublicKey as X25519PublicKey, StaticSecret};

/// Node public key (32 bytes, X25519). Carried in announcements and the session hello.
#[derive(Debug, Clone, Eq, PartialEq, Hash, Serialize, Deserialize)]
pub struct PublicKey(#[serde(with = "fixed_bytes")] [u8; 32]);

impl PublicKey {
    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    pub fn from_bytes(bytes: [u8; 32]) -> Self {
        PublicKey(bytes)
    }
}

/// Stable node identifier: first 16 bytes of SHA-256 over the public key.
#[derive(Clone, Copy, Eq, PartialEq, Ord, PartialOrd, Hash, Serialize, Deserialize)]
pub struct DeviceId(#[serde(with = "fixed_bytes")] [u8; 16]);

impl DeviceId {
    pub fn as_bytes(&self) -> &[u8; 16] {
        &self.0
    }

    pub fn from_bytes(bytes: [u8; 16]) -> Self {
        DeviceId(bytes)
    }

    pub fn from_public_key(public: &PublicKey) -> Self {
        let digest = Sha256::digest(public.as_bytes());
        let mut id = [0u8; 16];
        id.copy_from_slice(&digest[..16]);
        DeviceId(id)
    }

    /// Short hex form used in logs and the CLI.
    pub fn short(&self) -> String {
        self.0[..4].iter().map(|b| format!("{b:02x}")).collect()
    }
}

impl fmt::Debug for DeviceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "DeviceId({})", self.short())
    }
}

impl fmt::Display for DeviceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for b in &self.0 {
            write!(f, "{b:02x}")?;
        }
        Ok(())
    }
}

mod fixed_bytes {
    use serde::{Deserialize, Deserializer, Serialize, Serializer};

    pub fn serialize<S: Serializer, const N: usize>(
        v: &[u8; N],
        serializer: S,
    ) -> Result<S::Ok, S::Error> {
        v.as_slice().serialize(serializer)
    }

    pub fn deserialize<'de, D: Deserializer<'de>, const N: usize>(
        d: D,
    ) -> Result<[u8; N], D::Error> {
        let buf: Vec<u8> = Deserialize::deserialize(d)?;
        let len = buf.len();
        buf.try_into()
            .map_err(|_| serde::de::Error::invalid_length(len, &"fixed-size byte array"))
    }
}

/// A peer as seen by the application: unique device ID plus a human-readable name.
///
/// Equality and hashing use the device ID only; two peers may share a display name.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PeerId {
    device_id: DeviceId,
    display_name: String,
}

impl PeerId {
    pub fn new(device_id: DeviceId, display_name: impl Into<String>) -> Self {
        Self {
            device_id,
            display_name: display_name.into(),
        }
    }

    pub fn device_id(&self) -> DeviceId {
        self.device_id
    }

    pub fn display_name(&self) -> &str {
        &self.display_name
    }
}

impl PartialEq for PeerId {
    fn eq(&self, other: &Self) -> bool {
        self.device_id == other.device_id
    }
}

impl Eq for PeerId {}

impl Hash for PeerId {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.device_id.hash(state);
    }
}

impl fmt::Display for PeerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({})", self.display_name, self.device_id.short())
    }
}

/// X25519 keypair for the local node. The secret never leaves this struct.
pub struct Keypair {
    secret: StaticSecret,
    public: PublicKey,
    device_id: DeviceId,
}

impl Keypair {
    pub fn generate() -> Self {
        let secret = StaticSecret::random_from_rng(OsRng);
        let public = PublicKey(X25519PublicKey::from(&secret).to_bytes());
        let device_id = DeviceId::from_public_key(&public);
        Self {
            secret,
            public,
            device_id,
        }
    }

    pub fn public_key(&self) -> &PublicKey {
        &self.public
    }

    pub fn device_id(&self) -> DeviceId {
        self.device_id
    }

    /// Local peer identity under the given display name.
    pub fn peer_id(&self, display_name: impl Into<String>) -> PeerId {
        PeerId::new(self.device_id, display_name)
    }

    pub fn shared_secret(&self, other_public: &PublicKey) -> [u8; 32] {
        let other = X25519PublicKey::from(other_public.0);
        self.secret.diffie_hellman(&other).to_bytes()
    }
}

/// Derive the pairwise session key from an X25519 shared secret.
pub fn derive_session_key(shared_secret: &[u8; 32]) -> [u8; 32] {
    let mut hasher = Sha256::new();
    hasher.update(b"nearcast-session-v1");
    hasher.update(shared_secret);
    hasher.finalize().into()
}

/// Which side of a session dialed. Each direction gets its own nonce space.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Initiator,
    Responder,
}

impl Role {
    fn outbound_lane(self) -> u8 {
        match self {
            Role::Initiator => 0,
            Role::Responder => 1,
        }
    }

    fn inbound_lane(self) -> u8 {
        1 - self.outbound_lane()
    }
}

/// ChaCha20-Poly1305 with a 96-bit nonce: lane byte, 3 zero bytes, 64-bit LE counter.
struct FrameCipher {
    cipher: ChaCha20Poly1305,
    lane: u8,
    counter: u64,
}

impl FrameCipher {
    fn new(key: &[u8; 32], lane: u8) -> Result<Self, WireCryptoError> {
        let cipher = ChaCha20Poly1305::new_from_slice(key).map_err(|_| WireCryptoError::Key)?;
        Ok(Self {
            cipher,
            lane,
            counter: 0,
        })
    }

    fn next_nonce(&mut self) -> Result<[u8; 12], WireCryptoError> {
        let mut nonce = [0u8; 12];
        nonce[0] = self.lane;
        nonce[4..12].copy_from_slice(&self.counter.to_le_bytes());
        self.counter = self
            .counter
            .checked_add(1)
            .ok_or(WireCryptoError::NonceExhausted)?;
        Ok(nonce)
    }
}

/// Encrypts outbound frames for one session.
pub struct Sealer(FrameCipher);

/// Decrypts inbound frames for one session. Frames must be opened in send order.
pub struct Opener(FrameCipher);

impl Sealer {
    pub fn seal(&mut self, plaintext: &[u8]) -> Result<Vec<u8>, WireCryptoError> {
        let nonce = self.0.next_nonce()?;
        self.0
            .cipher
            .encrypt(chacha20poly1305::Nonce::from_slice(&nonce), plaintext)
            .map_err(|_| WireCryptoError::Encrypt)
    }
}

impl Opener {
    pub fn open(&mut self, ciphertext: &[u8]) -> Result<Vec<u8>, WireCryptoError> {
        let nonce = self.0.next_nonce()?;
        self.0
            .cipher
            .decrypt(chacha20poly1305::Nonce::from_slice(&nonce), ciphertext)
            .map_err(|_| WireCryptoError::Decrypt)
    }
}

/// Build the sealer/opener pair for a session from the local keypair and the peer's key.
pub fn session_ciphers(
    keypair: &Keypair,
    peer_public: &PublicKey,
    role: Role,
) -> Result<(Sealer, Opener), WireCryptoError> {
    let key = derive_session_key(&keypair.shared_secret(peer_public));
    Ok((
        Sealer(FrameCipher::new(&key, role.outbound_lane())?),
        Opener(FrameCipher::new(&key, role.inbound_lane())?),
    ))
}

#[derive(Debug, thiserror::Error)]
pub enum WireCryptoError {
    #[error("invalid key")]
    Key,
    #[error("encryption failed")]
    Encrypt,
    #[error("decryption failed")]
    Decrypt,
    #[error("nonce counter exhausted")]
    NonceExhausted,
}
