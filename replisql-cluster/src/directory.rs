//! Bidirectional id/address lookup for cluster peers.

use std::collections::HashMap;
use std::fmt;
use std::net::SocketAddr;

use parking_lot::RwLock;
use replisql_core::NodeId;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::errors::{ClusterError, ClusterResult};

/// Metadata tag holding the peer's build string, e.g. `1.4.2:abc123`.
pub const BUILD_TAG: &str = "build";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PeerInfo {
    pub id: NodeId,
    pub address: SocketAddr,
    pub metadata: HashMap<String, String>,
}

impl PeerInfo {
    pub fn new(id: NodeId, address: SocketAddr) -> Self {
        Self {
            id,
            address,
            metadata: HashMap::new(),
        }
    }

    pub fn with_metadata(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.metadata.insert(key.into(), value.into());
        self
    }

    pub fn build_version(&self) -> ClusterResult<BuildVersion> {
        let tag = self
            .metadata
            .get(BUILD_TAG)
            .ok_or_else(|| ClusterError::invalid_build(format!("peer {} has no build tag", self.id)))?;
        BuildVersion::parse(tag)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct BuildVersion {
    pub major: u64,
    pub minor: u64,
    pub patch: u64,
}

impl BuildVersion {
    pub fn new(major: u64, minor: u64, patch: u64) -> Self {
        Self {
            major,
            minor,
            patch,
        }
    }

    /// Extracts the first `major.minor.patch` run from a build string.
    /// Anything around it (a `v` prefix, a `:commit` suffix) is ignored.
    pub fn parse(tag: &str) -> ClusterResult<Self> {
        let invalid = || ClusterError::invalid_build(format!("no version in {:?}", tag));

        let start = tag.find(|c: char| c.is_ascii_digit()).ok_or_else(invalid)?;
        let rest = &tag[start..];
        let end = rest
            .find(|c: char| !(c.is_ascii_digit() || c == '.'))
            .unwrap_or(rest.len());

        let mut parts = rest[..end].split('.').map(|p| p.parse::<u64>());
        match (parts.next(), parts.next(), parts.next()) {
            (Some(Ok(major)), Some(Ok(minor)), Some(Ok(patch))) => {
                Ok(Self::new(major, minor, patch))
            }
            _ => Err(invalid()),
        }
    }
}

impl fmt::Display for BuildVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}.{}", self.major, self.minor, self.patch)
    }
}

#[derive(Debug, Default)]
struct Indexes {
    by_id: HashMap<NodeId, PeerInfo>,
    by_addr: HashMap<SocketAddr, NodeId>,
}

/// Both indexes sit behind one lock, so no reader sees a half-applied
/// add or remove.
#[derive(Debug, Default)]
pub struct PeerDirectory {
    inner: RwLock<Indexes>,
}

impl PeerDirectory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_server(&self, peer: PeerInfo) {
        let mut inner = self.inner.write();
        if let Some(previous) = inner.by_id.get(&peer.id) {
            if previous.address != peer.address {
                let stale = previous.address;
                inner.by_addr.remove(&stale);
                debug!("Peer {} moved from {} to {}", peer.id, stale, peer.address);
            }
        }
        // Another id may have held this address before
        if let Some(owner) = inner.by_addr.insert(peer.address, peer.id) {
            if owner != peer.id {
                inner.by_id.remove(&owner);
            }
        }
        inner.by_id.insert(peer.id, peer);
    }

    pub fn remove_server(&self, peer: &PeerInfo) {
        let mut inner = self.inner.write();
        if let Some(removed) = inner.by_id.remove(&peer.id) {
            inner.by_addr.remove(&removed.address);
            debug!("Removed peer {} at {}", removed.id, removed.address);
        }
    }

    pub fn address_for(&self, id: NodeId) -> ClusterResult<SocketAddr> {
        self.inner
            .read()
            .by_id
            .get(&id)
            .map(|peer| peer.address)
            .ok_or(ClusterError::PeerNotFound { id })
    }

    pub fn server_for(&self, address: SocketAddr) -> Option<PeerInfo> {
        let inner = self.inner.read();
        inner
            .by_addr
            .get(&address)
            .and_then(|id| inner.by_id.get(id))
            .cloned()
    }

    pub fn all_servers(&self) -> Vec<PeerInfo> {
        self.inner.read().by_id.values().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.inner.read().by_id.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.read().by_id.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn addr(port: u16) -> SocketAddr {
        SocketAddr::from(([127, 0, 0, 1], port))
    }

    #[test]
    fn test_add_and_lookup() {
        let directory = PeerDirectory::new();
        let peer = PeerInfo::new(NodeId::from(1), addr(8300));
        directory.add_server(peer.clone());

        assert_eq!(directory.address_for(peer.id), Ok(peer.address));
        assert_eq!(directory.server_for(peer.address), Some(peer));
        assert_eq!(directory.len(), 1);
    }

    #[test]
    fn test_unknown_lookups() {
        let directory = PeerDirectory::new();
        let id = NodeId::from(7);

        assert_eq!(
            directory.address_for(id),
            Err(ClusterError::PeerNotFound { id })
        );
        assert_eq!(directory.server_for(addr(1)), None);
        assert!(directory.is_empty());
    }

    #[test]
    fn test_readd_drops_stale_address() {
        let directory = PeerDirectory::new();
        let id = NodeId::from(1);
        directory.add_server(PeerInfo::new(id, addr(8300)));
        directory.add_server(PeerInfo::new(id, addr(8301)));

        assert_eq!(directory.server_for(addr(8300)), None);
        assert_eq!(directory.address_for(id), Ok(addr(8301)));
        assert_eq!(directory.len(), 1);
    }

    #[test]
    fn test_address_taken_over_by_new_id() {
        let directory = PeerDirectory::new();
        directory.add_server(PeerInfo::new(NodeId::from(1), addr(8300)));
        directory.add_server(PeerInfo::new(NodeId::from(2), addr(8300)));

        assert!(directory.address_for(NodeId::from(1)).is_err());
        assert_eq!(
            directory.server_for(addr(8300)).map(|p| p.id),
            Some(NodeId::from(2))
        );
        assert_eq!(directory.len(), 1);
    }

    #[test]
    fn test_all_servers_is_a_copy() {
        let directory = PeerDirectory::new();
        let peer = PeerInfo::new(NodeId::from(1), addr(8300));
        directory.add_server(peer.clone());

        let servers = directory.all_servers();
        directory.remove_server(&peer);

        assert_eq!(servers, vec![peer]);
        assert!(directory.all_servers().is_empty());
    }

    #[test]
    fn test_build_version() {
        let peer = PeerInfo::new(NodeId::from(1), addr(8300)).with_metadata(BUILD_TAG, "1.4.2:abc123");
        assert_eq!(peer.build_version(), Ok(BuildVersion::new(1, 4, 2)));

        assert_eq!(BuildVersion::parse("v0.9.10"), Ok(BuildVersion::new(0, 9, 10)));
        assert!(BuildVersion::parse("1.4").is_err());
        assert!(BuildVersion::parse("dev").is_err());

        let bare = PeerInfo::new(NodeId::from(2), addr(8301));
        assert!(matches!(
            bare.build_version(),
            Err(ClusterError::InvalidBuild { .. })
        ));
    }

    proptest! {
        #[test]
        fn prop_lookups_stay_consistent(
            ports in proptest::collection::hash_set(1024u16..u16::MAX, 1..32),
            remove_mask in proptest::collection::vec(any::<bool>(), 32),
        ) {
            let directory = PeerDirectory::new();
            let peers: Vec<PeerInfo> = ports
                .iter()
                .enumerate()
                .map(|(i, port)| PeerInfo::new(NodeId::from(i as u64), addr(*port)))
                .collect();
            for peer in &peers {
                directory.add_server(peer.clone());
            }

            for (peer, remove) in peers.iter().zip(&remove_mask) {
                if *remove {
                    directory.remove_server(peer);
                }
            }

            for (peer, removed) in peers.iter().zip(&remove_mask) {
                if *removed {
                    prop_assert!(directory.address_for(peer.id).is_err());
                    prop_assert!(directory.server_for(peer.address).is_none());
                } else {
                    prop_assert_eq!(directory.address_for(peer.id), Ok(peer.address));
                    prop_assert_eq!(directory.server_for(peer.address).map(|p| p.id), Some(peer.id));
                }
            }
            let expected = remove_mask.iter().take(peers.len()).filter(|r| !**r).count();
            prop_assert_eq!(directory.len(), expected);
        }
    }
}
