//! Federation: inter-node replication and cold-tier restore
//!
//! Peer nodes replicate bags to each other over rsync, with a
//! tag-manifest checksum handshake through each peer's REST API. Bags in
//! archival storage come back through the cold-tier restore initiator.

pub mod copier;
pub mod rest_client;
pub mod restore;

pub use copier::{rsync_command, FederationCopier};
pub use rest_client::{FederationBag, FederationClient, ReplicationTransfer};
pub use restore::{RestoreInitiator, RestorePhase, RestoreState};
