//! Local identity (display name + service type), peer handles and link keypairs.

use std::fmt;

use rand::rngs::OsRng;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use x25519_dalek::{PublicKey as X25519PublicKey, StaticSecret};

/// Longest display name accepted, in UTF-8 bytes.
pub const MAX_PEER_NAME_LEN: usize = 63;

/// Longest service type accepted, in characters.
pub const MAX_SERVICE_TYPE_LEN: usize = 15;

/// Reason a display name or service type was rejected.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum NameError {
    #[error("display name is empty")]
    EmptyName,
    #[error("display name is {0} bytes, max {}", MAX_PEER_NAME_LEN)]
    NameTooLong(usize),
    #[error("service type is empty")]
    EmptyService,
    #[error("service type is {0} characters, max {}", MAX_SERVICE_TYPE_LEN)]
    ServiceTooLong(usize),
    #[error("service type contains invalid character {0:?}")]
    InvalidServiceChar(char),
    #[error("service type must contain at least one letter")]
    ServiceWithoutLetter,
    #[error("service type has a leading, trailing or doubled hyphen")]
    MisplacedHyphen,
}

/// Human readable peer name shown to other peers.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct PeerName(String);

impl PeerName {
    pub fn new(name: impl Into<String>) -> Result<Self, NameError> {
        let name = name.into();
        if name.is_empty() {
            return Err(NameError::EmptyName);
        }
        if name.len() > MAX_PEER_NAME_LEN {
            return Err(NameError::NameTooLong(name.len()));
        }
        Ok(PeerName(name))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for PeerName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Service identifier peers advertise and browse for. Only peers with equal
/// service types ever link.
///
/// Rules: 1-15 characters of `[a-z0-9-]`, at least one letter, and hyphens only
/// between other characters (never leading, trailing or doubled).
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ServiceType(String);

impl ServiceType {
    pub fn new(service: impl Into<String>) -> Result<Self, NameError> {
        let service = service.into();
        if service.is_empty() {
            return Err(NameError::EmptyService);
        }
        let count = service.chars().count();
        if count > MAX_SERVICE_TYPE_LEN {
            return Err(NameError::ServiceTooLong(count));
        }
        if let Some(c) = service
            .chars()
            .find(|c| !(c.is_ascii_lowercase() || c.is_ascii_digit() || *c == '-'))
        {
            return Err(NameError::InvalidServiceChar(c));
        }
        if !service.chars().any(|c| c.is_ascii_lowercase()) {
            return Err(NameError::ServiceWithoutLetter);
        }
        if service.starts_with('-') || service.ends_with('-') || service.contains("--") {
            return Err(NameError::MisplacedHyphen);
        }
        Ok(ServiceType(service))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ServiceType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Immutable pair set when a session is created.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LocalIdentity {
    pub name: PeerName,
    pub service: ServiceType,
}

impl LocalIdentity {
    pub fn new(name: &str, service: &str) -> Result<Self, NameError> {
        Ok(Self {
            name: PeerName::new(name)?,
            service: ServiceType::new(service)?,
        })
    }
}

/// Opaque 16-byte peer handle.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct PeerId(pub [u8; 16]);

impl PeerId {
    pub fn as_bytes(&self) -> &[u8; 16] {
        &self.0
    }

    /// Derive a peer ID from an X25519 public key: first 16 bytes of its SHA-256.
    pub fn from_public_key(public: &PublicKey) -> Self {
        let digest = Sha256::digest(public.as_bytes());
        let mut id = [0u8; 16];
        id.copy_from_slice(&digest[..16]);
        PeerId(id)
    }

    /// Fresh random handle for transports without key material.
    pub fn random() -> Self {
        PeerId(rand::random())
    }
}

impl fmt::Debug for PeerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "PeerId({self})")
    }
}

impl fmt::Display for PeerId {
    // Short hex prefix; enough to tell peers apart in logs.
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for b in &self.0[..4] {
            write!(f, "{b:02x}")?;
        }
        Ok(())
    }
}

/// X25519 public key carried in beacons and the link handshake.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct PublicKey(pub [u8; 32]);

impl PublicKey {
    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }
}

/// Link keypair. The secret never leaves this struct.
pub struct Keypair {
    secret: StaticSecret,
    public: PublicKey,
    peer_id: PeerId,
}

impl Keypair {
    pub fn generate() -> Self {
        let secret = StaticSecret::random_from_rng(OsRng);
        let public = PublicKey(X25519PublicKey::from(&secret).to_bytes());
        let peer_id = PeerId::from_public_key(&public);
        Self {
            secret,
            public,
            peer_id,
        }
    }

    pub fn public_key(&self) -> &PublicKey {
        &self.public
    }

    pub fn peer_id(&self) -> PeerId {
        self.peer_id
    }

    /// Diffie-Hellman with the remote key; both sides get the same 32 bytes.
    pub fn shared_secret(&self, other: &PublicKey) -> [u8; 32] {
        let other = X25519PublicKey::from(other.0);
        self.secret.diffie_hellman(&other).to_bytes()
    }
}
