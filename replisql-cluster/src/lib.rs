//! # Replisql Cluster
//!
//! Peer bookkeeping for the replication transport: a bidirectional directory
//! mapping node ids to network addresses, plus build metadata carried on
//! each peer.
//!
//! ```rust
//! use replisql_cluster::{PeerDirectory, PeerInfo};
//! use replisql_core::NodeId;
//!
//! let directory = PeerDirectory::new();
//! let peer = PeerInfo::new(NodeId::from(1), "10.0.0.1:8300".parse().unwrap());
//! directory.add_server(peer.clone());
//!
//! assert_eq!(directory.address_for(peer.id).unwrap(), peer.address);
//! assert_eq!(directory.server_for(peer.address), Some(peer));
//! ```

pub mod directory;
pub mod errors;

pub use directory::{BuildVersion, PeerDirectory, PeerInfo, BUILD_TAG};
pub use errors::{ClusterError, ClusterResult};
