//! Operator-driven faults and client writes. Each call validates before it
//! mutates; the first accepted call of any of them ends static playback.

use tracing::{info, warn};

use crate::election::LeaderSnapshot;
use crate::error::{Result, SimError};
use crate::events::SimEvent;
use crate::msg::{LogEntry, Mode, NodeId, Role};
use crate::node::RaftNode;
use crate::Simulation;

impl Simulation {
    fn check_node(&self, id: NodeId) -> Result<()> {
        if (1..=self.config.node_count).contains(&id) {
            Ok(())
        } else {
            Err(SimError::UnknownNode { id })
        }
    }

    fn live_node(&self, id: NodeId) -> Result<&RaftNode> {
        let node = self.nodes.get(&id).ok_or(SimError::UnknownNode { id })?;
        if node.is_crashed() {
            return Err(SimError::NodeUnavailable { id });
        }
        Ok(node)
    }

    /// Runs `op` on the live cluster, ending playback first if needed. A
    /// call rejected during playback leaves the simulation in playback.
    fn on_live<T>(&mut self, op: impl FnOnce(&mut Self) -> Result<T>) -> Result<T> {
        if self.mode != Mode::Static {
            return op(self);
        }
        let playback = self.clone();
        self.go_live();
        let result = op(self);
        if result.is_err() {
            *self = playback;
        }
        result
    }

    pub fn crash(&mut self, id: NodeId) -> Result<()> {
        self.check_node(id)?;
        self.go_live();
        let Some(node) = self.nodes.get_mut(&id) else {
            return Err(SimError::UnknownNode { id });
        };
        if node.is_crashed() {
            return Ok(());
        }
        node.crashed = true;
        let was_leader = node.is_leader();
        let snapshot = LeaderSnapshot {
            id,
            term: node.term(),
            log: node.entries().to_vec(),
        };
        node.transition_to_follower();
        self.discard_messages_of(id);
        info!(node = id, was_leader, "crashed");

        if was_leader {
            self.record(SimEvent::LeaderCrashed {
                id,
                term: snapshot.term,
                at_ms: self.now_ms,
            });
            self.election.leader_snapshot = Some(snapshot);
            if self.mode == Mode::Dynamic {
                self.enter_election();
            }
        }
        Ok(())
    }

    pub fn recover(&mut self, id: NodeId) -> Result<()> {
        self.check_node(id)?;
        self.go_live();
        let Some(node) = self.nodes.get_mut(&id) else {
            return Err(SimError::UnknownNode { id });
        };
        if !node.is_crashed() {
            return Ok(());
        }
        node.crashed = false;
        node.transition_to_follower();
        self.rearm_election_timer(id);
        if self.current_leader().is_none() {
            let fast = self.now_ms
                + self.config.recovery_fast_track_ms
                + self.rng.jitter(self.config.rearm_jitter_ms);
            if let Some(node) = self.nodes.get_mut(&id) {
                node.election_deadline_ms = fast;
            }
        }
        info!(node = id, "recovered");
        Ok(())
    }

    /// Cuts `id` off from every peer. It keeps running and still counts as
    /// alive for quorum.
    pub fn partition(&mut self, id: NodeId) -> Result<()> {
        self.check_node(id)?;
        self.go_live();
        if let Some(node) = self.nodes.get_mut(&id) {
            node.partitioned = true;
            info!(node = id, "partitioned");
        }
        Ok(())
    }

    pub fn heal(&mut self, id: NodeId) -> Result<()> {
        self.check_node(id)?;
        self.go_live();
        let healed = match self.nodes.get_mut(&id) {
            Some(node) if node.is_partitioned() => {
                node.partitioned = false;
                true
            }
            _ => false,
        };
        if healed {
            self.rearm_election_timer(id);
            info!(node = id, "healed");
        }
        Ok(())
    }

    /// Makes a follower stand for election now instead of waiting out its
    /// randomized timeout.
    pub fn force_timeout(&mut self, id: NodeId) -> Result<()> {
        self.check_node(id)?;
        self.on_live(|sim| {
            let role = sim.live_node(id)?.role();
            if role != Role::Follower {
                return Err(SimError::NotFollower { id, role });
            }
            let leader_term = sim
                .current_leader()
                .and_then(|l| sim.nodes.get(&l))
                .map(|l| l.term());
            if let (Some(term), Some(node)) = (leader_term, sim.nodes.get_mut(&id)) {
                node.adopt_term(term);
            }
            info!(node = id, "forced election timeout");
            sim.campaign(id);
            Ok(())
        })
    }

    /// Outbound loss for one node, or the cluster-wide drop rate when `id`
    /// is `None`. Clamped into `[0, 1]`.
    pub fn set_loss_probability(&mut self, id: Option<NodeId>, p: f64) -> Result<()> {
        if let Some(id) = id {
            self.check_node(id)?;
        }
        self.go_live();
        let p = if p.is_nan() { 0.0 } else { p.clamp(0.0, 1.0) };
        match id {
            Some(id) => {
                if let Some(node) = self.nodes.get_mut(&id) {
                    node.loss_pct = p;
                }
                info!(node = id, loss = p, "loss probability set");
            }
            None => {
                self.drop_rate = p;
                info!(drop_rate = p, "drop rate set");
            }
        }
        Ok(())
    }

    /// Operator truncation of the newest entry of a live node's log. Entries
    /// already committed are never dropped.
    pub fn drop_latest_log(&mut self, id: NodeId) -> Result<LogEntry> {
        self.check_node(id)?;
        self.on_live(|sim| {
            let node = sim.live_node(id)?;
            let committed = sim.ledger.len().max(node.commit_idx());
            if node.last_log_idx() <= committed {
                return Err(SimError::NothingToDrop { id });
            }
            let entry = sim
                .nodes
                .get_mut(&id)
                .and_then(|n| n.pop_entry())
                .ok_or(SimError::NothingToDrop { id })?;
            info!(node = id, term = entry.term, command = %entry.command, "dropped latest entry");
            Ok(entry)
        })
    }

    /// Appends `command` at the leader. `target`, when given, must name a
    /// live node; the entry lands on the current leader either way. Returns
    /// the entry's log index.
    pub fn client_command(
        &mut self,
        command: impl Into<String>,
        target: Option<NodeId>,
    ) -> Result<usize> {
        if let Some(id) = target {
            self.check_node(id)?;
        }
        let command = command.into();
        self.on_live(|sim| {
            if let Some(id) = target {
                sim.live_node(id)?;
            }
            let leader = match target {
                Some(id) if sim.nodes.get(&id).is_some_and(|n| n.is_leader()) => id,
                _ => sim.current_leader().ok_or_else(|| {
                    warn!("client command rejected, no leader");
                    SimError::NoLeader
                })?,
            };
            let node = sim.nodes.get_mut(&leader).ok_or(SimError::NoLeader)?;
            let entry = LogEntry::new(node.term(), command);
            info!(leader, term = entry.term, command = %entry.command, "client command");
            let term = entry.term;
            node.log.push(entry);
            let index = node.last_log_idx();
            sim.record(SimEvent::CommandAccepted {
                index,
                term,
                at_ms: sim.now_ms,
            });
            Ok(index)
        })
    }
}
