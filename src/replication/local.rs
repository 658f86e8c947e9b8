//! Single-node replication engine
//!
//! Every proposal is committed as soon as it is appended, the same way a
//! group whose quorum is one commits, and is applied before `submit`
//! returns. Appended entries stay in memory until a snapshot covers them.

use std::collections::VecDeque;
use std::sync::Arc;

use parking_lot::Mutex;

use super::{ReplicationEngine, StateMachine};
use crate::error::Result;

struct LogState {
    last_index: u64,
    truncated_index: u64,
    entries: VecDeque<(u64, Vec<u8>)>,
}

/// Replication engine for a group of one
pub struct LocalReplicator<S: StateMachine> {
    address: String,
    machine: Arc<Mutex<S>>,
    log: Mutex<LogState>,
}

impl<S: StateMachine> LocalReplicator<S> {
    /// Start a session that continues right after `applied_index`
    pub fn start(address: impl Into<String>, machine: Arc<Mutex<S>>, applied_index: u64) -> Arc<Self> {
        let address = address.into();
        machine.lock().handle_leader_change(Some(&address));
        tracing::debug!("Local replication started at index {} on {}", applied_index, address);

        Arc::new(Self {
            address,
            machine,
            log: Mutex::new(LogState {
                last_index: applied_index,
                truncated_index: applied_index,
                entries: VecDeque::new(),
            }),
        })
    }

    /// Index of the last appended entry
    pub fn last_index(&self) -> u64 {
        self.log.lock().last_index
    }

    /// Index up to which the log has been discarded
    pub fn truncated_index(&self) -> u64 {
        self.log.lock().truncated_index
    }

    /// Number of entries still retained
    pub fn retained(&self) -> usize {
        self.log.lock().entries.len()
    }
}

#[async_trait::async_trait]
impl<S: StateMachine> ReplicationEngine<S::Response> for LocalReplicator<S> {
    async fn submit(&self, data: Vec<u8>) -> Result<S::Response> {
        // the log lock is held through apply so entries apply in index order
        let mut log = self.log.lock();
        let index = log.last_index + 1;
        log.last_index = index;
        log.entries.push_back((index, data));

        let (_, data) = &log.entries[log.entries.len() - 1];
        self.machine.lock().apply(data, index)
    }

    fn truncate(&self, index: u64) {
        let mut log = self.log.lock();
        if index <= log.truncated_index {
            return;
        }
        while log.entries.front().map(|(i, _)| *i <= index).unwrap_or(false) {
            log.entries.pop_front();
        }
        log.truncated_index = index;
        tracing::debug!("Log truncated to index {}", index);
    }

    fn is_leader(&self) -> bool {
        true
    }

    fn leader(&self) -> Option<String> {
        Some(self.address.clone())
    }
}
