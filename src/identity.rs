// Peers identify themselves with a PeerInfo during the link handshake. The
// tracker and the participants trust the id a peer presents; authenticating
// payloads is left to the layers above the overlay.

use std::fmt;

use rkyv::{Archive, Deserialize, Serialize};

use crate::protocol::version::{SUPPORTED_CONTROL_VERSIONS, SUPPORTED_MESSAGE_VERSIONS};

/// Opaque identifier of a tracker or participant, unique for the lifetime of
/// a session.
#[derive(
    Archive, Serialize, Deserialize, Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash,
)]
#[archive(check_bytes)]
pub struct PeerId(String);

impl PeerId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for PeerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for PeerId {
    fn from(id: &str) -> Self {
        Self(id.to_owned())
    }
}

impl From<String> for PeerId {
    fn from(id: String) -> Self {
        Self(id)
    }
}

impl AsRef<str> for PeerId {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

#[derive(Archive, Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq, Hash)]
#[archive(check_bytes)]
pub enum PeerRole {
    Tracker,
    Node,
}

/// Coarse geographic position a participant may report to its tracker.
#[derive(Archive, Serialize, Deserialize, Clone, Debug, PartialEq, Default)]
#[archive(check_bytes)]
pub struct Location {
    pub latitude: f64,
    pub longitude: f64,
}

impl Location {
    pub fn from(latitude: f64, longitude: f64) -> Self {
        Self {
            latitude,
            longitude,
        }
    }
}

/// Identity, role and protocol capabilities of a peer.
#[derive(Archive, Serialize, Deserialize, Clone, Debug, PartialEq)]
#[archive(check_bytes)]
pub struct PeerInfo {
    pub peer_id: PeerId,
    pub role: PeerRole,
    /// Control layer versions this peer speaks, ascending.
    pub control_versions: Vec<u16>,
    /// Message layer versions this peer speaks, ascending.
    pub message_versions: Vec<u16>,
    pub location: Option<Location>,
}

impl PeerInfo {
    pub fn new_tracker(peer_id: impl Into<PeerId>) -> Self {
        Self::with_role(peer_id.into(), PeerRole::Tracker)
    }

    pub fn new_node(peer_id: impl Into<PeerId>) -> Self {
        Self::with_role(peer_id.into(), PeerRole::Node)
    }

    fn with_role(peer_id: PeerId, role: PeerRole) -> Self {
        Self {
            peer_id,
            role,
            control_versions: SUPPORTED_CONTROL_VERSIONS.to_vec(),
            message_versions: SUPPORTED_MESSAGE_VERSIONS.to_vec(),
            location: None,
        }
    }

    pub fn with_location(mut self, location: Option<Location>) -> Self {
        self.location = location;
        self
    }

    pub fn is_tracker(&self) -> bool {
        self.role == PeerRole::Tracker
    }

    pub fn is_node(&self) -> bool {
        self.role == PeerRole::Node
    }
}

impl fmt::Display for PeerInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.role {
            PeerRole::Tracker => write!(f, "tracker {}", self.peer_id),
            PeerRole::Node => write!(f, "node {}", self.peer_id),
        }
    }
}
