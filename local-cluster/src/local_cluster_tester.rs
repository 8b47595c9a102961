use color_eyre::eyre::{bail, eyre, Result};
use std::time::Duration;
use tokio::{task::JoinHandle, time::sleep};

use crate::command::{Command, Reply};
use crate::metrics::ClusterMetrics;
use crate::{spawn_cluster, ClusterConfig, ClusterHandle};
use raftsim_raft::msg::{NodeStatus, NodeSummary};
use raftsim_raft::{ClusterSnapshot, LogEntry, NodeId, SimConfig, Term};

/// Polls are this far apart, in driver time.
const POLL_MS: u64 = 100;

/// Drives a cluster through its handle the way an operator would, with
/// polling assertions on top. Meant for paused-clock tokio tests.
pub struct LocalClusterRunner {
    handle: ClusterHandle,
    task: JoinHandle<ClusterMetrics>,
}

impl LocalClusterRunner {
    /// A stopped cluster still in playback.
    pub fn new(config: ClusterConfig) -> Result<Self> {
        let (handle, task) = spawn_cluster(config)?;
        Ok(Self { handle, task })
    }

    /// A running live cluster of `node_count` nodes, taken over at the
    /// playback frame where node 1 leads term 2.
    pub async fn launch(node_count: usize, seed: u64) -> Result<Self> {
        let sim = SimConfig {
            node_count,
            ..SimConfig::with_seed(seed)
        };
        let runner = Self::new(ClusterConfig::new(sim))?;
        runner.send(Command::AdvanceStep).await?;
        runner.send(Command::AdvanceStep).await?;
        // Any fault call ends playback; a zero drop rate changes nothing else.
        runner.set_loss(None, 0.0).await?;
        runner.send(Command::Start).await?;
        Ok(runner)
    }

    pub fn handle(&self) -> &ClusterHandle {
        &self.handle
    }

    pub async fn send(&self, command: Command) -> Result<Reply> {
        Ok(self.handle.send(command).await?)
    }

    pub async fn get_cluster_state(&self) -> Result<ClusterSnapshot> {
        Ok(self.handle.get_state().await?)
    }

    pub async fn sleep(&self, ms: u64) {
        sleep(Duration::from_millis(ms)).await;
    }

    pub async fn crash(&self, node_id: NodeId) -> Result<Reply> {
        self.send(Command::CrashNode { node_id }).await
    }

    pub async fn recover(&self, node_id: NodeId) -> Result<Reply> {
        self.send(Command::RecoverNode { node_id }).await
    }

    pub async fn partition(&self, node_id: NodeId) -> Result<Reply> {
        self.send(Command::PartitionNode { node_id }).await
    }

    pub async fn heal(&self, node_id: NodeId) -> Result<Reply> {
        self.send(Command::HealNode { node_id }).await
    }

    pub async fn force_timeout(&self, node_id: NodeId) -> Result<Reply> {
        self.send(Command::ForceTimeout { node_id }).await
    }

    pub async fn set_loss(&self, node_id: Option<NodeId>, probability: f64) -> Result<Reply> {
        self.send(Command::SetDropProbability {
            node_id,
            probability,
        })
        .await
    }

    pub async fn send_cmd(&self, command: &str, node_id: Option<NodeId>) -> Result<Reply> {
        self.send(Command::ClientCommand {
            command: command.to_string(),
            node_id,
        })
        .await
    }

    // Only one leader at the highest term among connected nodes
    pub async fn check_one_leader(&self) -> Result<NodeSummary> {
        for _ in 0..300 {
            self.sleep(POLL_MS).await;
            let state = self.get_cluster_state().await?;
            let highest = highest_leaders(&state);
            match highest.len() {
                1 => return Ok(highest[0].clone()),
                l if l > 1 => bail!("More than one leader on the same term!"),
                _ => {}
            }
        }
        bail!("No leader elected in time!")
    }

    /// Submits `command` to the current leader and waits for it to reach the
    /// majority ledger. `Ok(false)` if leadership moved before that.
    pub async fn try_to_commit(&self, command: &str) -> Result<bool> {
        let leader = self.check_one_leader().await?;
        let expected = LogEntry::new(leader.term, command);
        let index = self.get_cluster_state().await?.committed.len();
        self.send_cmd(command, Some(leader.id)).await?;
        for _ in 0..100 {
            self.sleep(POLL_MS).await;
            let state = self.get_cluster_state().await?;
            if let Some(entry) = state.committed.get(index) {
                return Ok(*entry == expected);
            }
            let still_leading = highest_leaders(&state)
                .first()
                .is_some_and(|l| l.id == leader.id);
            if !still_leading {
                return Ok(false);
            }
        }
        Ok(false)
    }

    /// How many nodes hold the committed entry at 1-based `index`.
    pub async fn n_replicated(&self, index: usize) -> Result<usize> {
        let state = self.get_cluster_state().await?;
        let Some(entry) = index.checked_sub(1).and_then(|i| state.committed.get(i)) else {
            return Ok(0);
        };
        Ok(state
            .nodes
            .iter()
            .filter(|n| n.log.get(index - 1) == Some(entry))
            .count())
    }

    pub async fn has_no_leader(&self) -> Result<bool> {
        Ok(highest_leaders(&self.get_cluster_state().await?).is_empty())
    }

    pub async fn current_term(&self) -> Result<Term> {
        let state = self.get_cluster_state().await?;
        state
            .nodes
            .iter()
            .map(|n| n.term)
            .max()
            .ok_or_else(|| eyre!("Cluster has no nodes"))
    }

    pub async fn live_term_agreement(&self) -> Result<bool> {
        let state = self.get_cluster_state().await?;
        let mut terms = state
            .nodes
            .iter()
            .filter(|n| n.status == NodeStatus::Healthy)
            .map(|n| n.term);
        let Some(first) = terms.next() else {
            return Ok(true);
        };
        Ok(terms.all(|t| t == first))
    }

    /// Waits until `pred` holds for the snapshot, for up to `ms` of driver time.
    pub async fn wait_for(
        &self,
        ms: u64,
        pred: impl Fn(&ClusterSnapshot) -> bool,
    ) -> Result<ClusterSnapshot> {
        for _ in 0..=ms / POLL_MS {
            let state = self.get_cluster_state().await?;
            if pred(&state) {
                return Ok(state);
            }
            self.sleep(POLL_MS).await;
        }
        bail!("Condition not reached within {ms}ms")
    }

    /// Stops the driver and returns what it measured.
    pub async fn shutdown(self) -> Result<ClusterMetrics> {
        drop(self.handle);
        Ok(self.task.await?)
    }
}

fn highest_leaders(state: &ClusterSnapshot) -> Vec<&NodeSummary> {
    let connected = || {
        state
            .nodes
            .iter()
            .filter(|n| n.status == NodeStatus::Healthy)
    };
    let Some(highest_term) = connected().map(|n| n.term).max() else {
        return Vec::new();
    };
    connected()
        .filter(|n| n.term == highest_term && n.is_leader())
        .collect()
}
