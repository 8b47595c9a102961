//! Failover, replication-latency and leader-tenure records folded from the
//! engine's event stream. Times are on the simulation's logical clock.

use ahash::HashMap;
use serde::Serialize;

use raftsim_raft::{Millis, NodeId, SimEvent, Term};

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize)]
pub struct FailoverRecord {
    pub old_leader: NodeId,
    pub new_leader: Option<NodeId>,
    pub crash_ms: Millis,
    pub election_start_ms: Option<Millis>,
    pub elected_ms: Option<Millis>,
    pub first_heartbeat_ms: Option<Millis>,
    /// Crash to the new leader's first heartbeat.
    pub failover_ms: Option<Millis>,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct ReplicationRecord {
    pub index: usize,
    pub term: Term,
    pub accepted_ms: Millis,
    pub committed_ms: Millis,
    pub latency_ms: Millis,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct TenureRecord {
    pub leader: NodeId,
    pub term: Term,
    pub start_ms: Millis,
    pub end_ms: Millis,
    pub tenure_ms: Millis,
}

#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct MetricsSummary {
    pub failovers: usize,
    pub mean_failover_ms: Option<f64>,
    pub commits: usize,
    pub mean_commit_latency_ms: Option<f64>,
    pub tenures: usize,
    pub resets: usize,
}

#[derive(Clone, Debug, Default)]
pub struct ClusterMetrics {
    failovers: Vec<FailoverRecord>,
    replication: Vec<ReplicationRecord>,
    tenures: Vec<TenureRecord>,
    resets: usize,
    open_failover: Option<FailoverRecord>,
    /// Accepted but not yet committed: index -> (term, accepted at)
    pending: HashMap<usize, (Term, Millis)>,
    /// (leader, term, since)
    leader: Option<(NodeId, Term, Millis)>,
}

impl ClusterMetrics {
    pub fn observe(&mut self, event: &SimEvent) {
        use SimEvent::*;
        match *event {
            LeaderCrashed { id, at_ms, .. } => {
                if self.leader.is_some_and(|(leader, _, _)| leader == id) {
                    self.end_tenure(at_ms);
                }
                self.open_failover = Some(FailoverRecord {
                    old_leader: id,
                    crash_ms: at_ms,
                    ..FailoverRecord::default()
                });
            }
            ElectionStarted { at_ms } => {
                if let Some(f) = self.open_failover.as_mut() {
                    f.election_start_ms.get_or_insert(at_ms);
                }
            }
            LeaderElected { id, term, at_ms } => {
                self.end_tenure(at_ms);
                self.leader = Some((id, term, at_ms));
                if let Some(f) = self.open_failover.as_mut() {
                    f.new_leader = Some(id);
                    f.elected_ms = Some(at_ms);
                }
            }
            FirstHeartbeat { id, at_ms, .. } => {
                let ready = self
                    .open_failover
                    .as_ref()
                    .is_some_and(|f| f.new_leader == Some(id));
                if ready {
                    if let Some(mut f) = self.open_failover.take() {
                        f.first_heartbeat_ms = Some(at_ms);
                        f.failover_ms = Some(at_ms.saturating_sub(f.crash_ms));
                        self.failovers.push(f);
                    }
                }
            }
            CommandAccepted { index, term, at_ms } => {
                self.pending.insert(index, (term, at_ms));
            }
            Committed { index, term, at_ms } => {
                // An entry overwritten before commit is dropped from the stats.
                if let Some((accepted_term, accepted_ms)) = self.pending.remove(&index) {
                    if accepted_term == term {
                        self.replication.push(ReplicationRecord {
                            index,
                            term,
                            accepted_ms,
                            committed_ms: at_ms,
                            latency_ms: at_ms.saturating_sub(accepted_ms),
                        });
                    }
                }
            }
            AutoReset { .. } => {
                self.resets += 1;
                self.clear_session();
            }
        }
    }

    /// Forgets in-progress records when the cluster is rebuilt.
    pub fn clear_session(&mut self) {
        self.open_failover = None;
        self.pending.clear();
        self.leader = None;
    }

    fn end_tenure(&mut self, end_ms: Millis) {
        if let Some((leader, term, start_ms)) = self.leader.take() {
            self.tenures.push(TenureRecord {
                leader,
                term,
                start_ms,
                end_ms,
                tenure_ms: end_ms.saturating_sub(start_ms),
            });
        }
    }

    pub fn failovers(&self) -> &[FailoverRecord] {
        &self.failovers
    }

    pub fn replication(&self) -> &[ReplicationRecord] {
        &self.replication
    }

    pub fn tenures(&self) -> &[TenureRecord] {
        &self.tenures
    }

    pub fn resets(&self) -> usize {
        self.resets
    }

    pub fn summary(&self) -> MetricsSummary {
        MetricsSummary {
            failovers: self.failovers.len(),
            mean_failover_ms: mean(self.failovers.iter().filter_map(|f| f.failover_ms)),
            commits: self.replication.len(),
            mean_commit_latency_ms: mean(self.replication.iter().map(|r| r.latency_ms)),
            tenures: self.tenures.len(),
            resets: self.resets,
        }
    }
}

fn mean(values: impl Iterator<Item = Millis>) -> Option<f64> {
    let (sum, count) = values.fold((0u64, 0u64), |(s, c), v| (s + v, c + 1));
    (count > 0).then(|| sum as f64 / count as f64)
}
