//! Cluster-wide committed sequence, recomputed from majority agreement of
//! live logs rather than from any one leader's commit index.

use ahash::{HashMap, HashMapExt};
use tracing::info;

use crate::config::SimConfig;
use crate::events::SimEvent;
use crate::msg::LogEntry;
use crate::node::RaftNode;
use crate::Simulation;

#[derive(Clone, Debug, Default)]
pub struct CommitLedger {
    entries: Vec<LogEntry>,
}

impl CommitLedger {
    pub fn entries(&self) -> &[LogEntry] {
        &self.entries
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Committed-prefix test: does `node` hold every committed entry?
    pub fn is_prefix_of(&self, node: &RaftNode) -> bool {
        node.has_prefix(&self.entries)
    }

    /// Extends the ledger while some value at the next index is held by a
    /// majority of `alive`. Returns the newly committed entries with their
    /// 1-based log indices. Never shrinks or rewrites.
    fn extend_from(&mut self, alive: &[&RaftNode]) -> Vec<(usize, LogEntry)> {
        let mut committed = Vec::new();
        if alive.is_empty() {
            return committed;
        }
        let quorum = SimConfig::quorum(alive.len());
        loop {
            let idx = self.entries.len() + 1;
            let mut tally: HashMap<&LogEntry, usize> = HashMap::new();
            for node in alive {
                if let Some(entry) = node.entry(idx) {
                    *tally.entry(entry).or_insert(0) += 1;
                }
            }
            let Some((entry, _)) = tally.into_iter().find(|(_, count)| *count >= quorum) else {
                break;
            };
            let entry = entry.clone();
            self.entries.push(entry.clone());
            committed.push((idx, entry));
        }
        committed
    }
}

impl Simulation {
    pub(crate) fn recompute_ledger(&mut self) {
        let alive: Vec<&RaftNode> = self.nodes.values().filter(|n| n.is_alive()).collect();
        let committed = self.ledger.extend_from(&alive);
        for (index, entry) in committed {
            info!(index, term = entry.term, command = %entry.command, "committed");
            self.record(SimEvent::Committed {
                index,
                term: entry.term,
                at_ms: self.now_ms,
            });
        }
    }
}
