use hashbrown::HashMap;
use rkyv::{Archive, Deserialize, Serialize};

use crate::{
    error::Error,
    identity::{PeerId, PeerInfo},
};

pub const SUPPORTED_CONTROL_VERSIONS: &[u16] = &[1, 2];
pub const SUPPORTED_MESSAGE_VERSIONS: &[u16] = &[31, 32];

/// The protocol versions two peers agreed on.
#[derive(Archive, Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq)]
#[archive(check_bytes)]
pub struct NegotiatedVersions {
    pub control: u16,
    pub message: u16,
}

/// Picks the highest control and message versions both peers support.
pub fn negotiate(local: &PeerInfo, remote: &PeerInfo) -> Result<NegotiatedVersions, Error> {
    let control = highest_common(&local.control_versions, &remote.control_versions);
    let message = highest_common(&local.message_versions, &remote.message_versions);
    match (control, message) {
        (Some(control), Some(message)) => Ok(NegotiatedVersions { control, message }),
        _ => Err(Error::VersionMismatch(remote.peer_id.clone())),
    }
}

/// Whether versions chosen by a remote peer are ones `local` speaks.
pub fn supports(local: &PeerInfo, versions: NegotiatedVersions) -> bool {
    local.control_versions.contains(&versions.control)
        && local.message_versions.contains(&versions.message)
}

fn highest_common(ours: &[u16], theirs: &[u16]) -> Option<u16> {
    ours.iter().filter(|v| theirs.contains(v)).max().copied()
}

/// Per-peer record of negotiated versions. Only peers present here may
/// exchange protocol messages with us.
#[derive(Debug)]
pub struct VersionNegotiator {
    local: PeerInfo,
    negotiated: HashMap<PeerId, NegotiatedVersions>,
}

impl VersionNegotiator {
    pub fn new(local: PeerInfo) -> Self {
        Self {
            local,
            negotiated: HashMap::new(),
        }
    }

    /// Negotiates with `remote` and remembers the outcome.
    pub fn negotiate(&mut self, remote: &PeerInfo) -> Result<NegotiatedVersions, Error> {
        let versions = negotiate(&self.local, remote)?;
        self.negotiated.insert(remote.peer_id.clone(), versions);
        Ok(versions)
    }

    /// Accepts versions a remote responder chose, provided we support them.
    pub fn accept(
        &mut self,
        remote: &PeerId,
        versions: NegotiatedVersions,
    ) -> Result<NegotiatedVersions, Error> {
        if !self.supports(versions) {
            return Err(Error::VersionMismatch(remote.clone()));
        }
        self.negotiated.insert(remote.clone(), versions);
        Ok(versions)
    }

    pub fn supports(&self, versions: NegotiatedVersions) -> bool {
        supports(&self.local, versions)
    }

    pub fn get(&self, peer: &PeerId) -> Option<NegotiatedVersions> {
        self.negotiated.get(peer).copied()
    }

    pub fn forget(&mut self, peer: &PeerId) {
        self.negotiated.remove(peer);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn node(id: &str, control: &[u16], message: &[u16]) -> PeerInfo {
        let mut info = PeerInfo::new_node(id);
        info.control_versions = control.to_vec();
        info.message_versions = message.to_vec();
        info
    }

    #[test]
    fn picks_highest_common_versions() {
        let a = node("a", &[1, 2, 3], &[30, 31, 32]);
        let b = node("b", &[1, 2], &[31, 32, 33]);
        assert_eq!(
            negotiate(&a, &b).unwrap(),
            NegotiatedVersions {
                control: 2,
                message: 32
            }
        );
    }

    #[test]
    fn disjoint_versions_are_rejected() {
        let a = node("a", &[1], &[31]);
        let b = node("b", &[2], &[31]);
        assert!(matches!(negotiate(&a, &b), Err(Error::VersionMismatch(peer)) if peer.as_str() == "b"));
    }

    #[test]
    fn negotiator_remembers_and_forgets() {
        let mut negotiator = VersionNegotiator::new(PeerInfo::new_node("a"));
        let remote = PeerInfo::new_node("b");
        let versions = negotiator.negotiate(&remote).unwrap();
        assert_eq!(negotiator.get(&remote.peer_id), Some(versions));
        negotiator.forget(&remote.peer_id);
        assert_eq!(negotiator.get(&remote.peer_id), None);
    }

    #[test]
    fn unsupported_choice_from_responder_is_refused() {
        let mut negotiator = VersionNegotiator::new(PeerInfo::new_node("a"));
        let choice = NegotiatedVersions {
            control: 9,
            message: 31,
        };
        assert!(negotiator.accept(&PeerId::from("b"), choice).is_err());
        assert_eq!(negotiator.get(&PeerId::from("b")), None);
    }
}
