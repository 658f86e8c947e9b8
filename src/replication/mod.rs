//! Replication Module
//!
//! Contract between a partition's state machine and the replication engine
//! that orders its log. The engine calls into the [`StateMachine`] once per
//! committed entry; the state machine calls back into the engine through
//! [`ReplicationEngine`] to propose entries and release log prefixes.

mod local;

pub use local::LocalReplicator;

use crate::error::{Error, Result};

/// Encoded snapshot records streamed between replicas
pub type SnapshotIter = Box<dyn Iterator<Item = Result<Vec<u8>>> + Send>;

/// Callbacks the replication engine drives, always from one thread at a time
pub trait StateMachine: Send + 'static {
    /// Per-entry result handed back to the proposer
    type Response: Send + 'static;

    /// Apply one committed entry at `index`
    fn apply(&mut self, data: &[u8], index: u64) -> Result<Self::Response>;

    /// Point-in-time snapshot for a lagging peer
    fn snapshot(&self) -> Result<SnapshotIter>;

    /// Replace the whole state with a snapshot received from a peer
    fn apply_snapshot(&mut self, peers: &[String], records: SnapshotIter) -> Result<()>;

    /// Leadership moved; `leader` is the new leader address, if any
    fn handle_leader_change(&mut self, leader: Option<&str>);

    /// The engine hit an unrecoverable error for this group
    fn handle_fatal(&mut self, err: &Error);

    /// Index of the last applied entry
    fn applied_index(&self) -> u64;
}

/// Calls a state machine makes into its replication engine
#[async_trait::async_trait]
pub trait ReplicationEngine<R>: Send + Sync {
    /// Propose an entry and wait until it is applied locally
    async fn submit(&self, data: Vec<u8>) -> Result<R>;

    /// Entries up to and including `index` are covered by a snapshot
    fn truncate(&self, index: u64);

    /// Check if this node currently leads the group
    fn is_leader(&self) -> bool;

    /// Address of the current leader, if known
    fn leader(&self) -> Option<String>;
}
