//! Heartbeats, AppendEntries handling and leader-local commit advancement.

use ahash::{HashSet, HashSetExt};
use std::cmp;
use tracing::{debug, info};

use crate::config::SimConfig;
use crate::events::SimEvent;
use crate::msg::{LogEntry, NodeId, RaftMsg, Term};
use crate::node::{RaftNode, RaftState};
use crate::Simulation;

impl Simulation {
    /// Runs a replication round for every leader whose heartbeat is due.
    pub(crate) fn run_heartbeats(&mut self) {
        let now = self.now_ms;
        let due: Vec<NodeId> = self
            .nodes
            .values()
            .filter(|n| n.is_alive() && n.is_leader() && n.heartbeat_due_ms() <= now)
            .map(|n| n.id())
            .collect();
        for leader in due {
            self.broadcast_append_entries(leader);
        }
    }

    fn broadcast_append_entries(&mut self, leader: NodeId) {
        let next_heartbeat = self.now_ms + self.config.heartbeat_ms;
        let Some(node) = self.nodes.get_mut(&leader) else {
            return;
        };
        node.heartbeat_due_ms = next_heartbeat;
        let term = node.term();

        // A cut-off leader of an older term keeps heartbeating; only newer
        // terms are announced.
        if self.announced.map_or(true, |(_, announced)| term > announced) {
            self.announced = Some((leader, term));
            self.record(SimEvent::FirstHeartbeat {
                id: leader,
                term,
                at_ms: self.now_ms,
            });
        }

        for peer in self.peer_ids(leader) {
            if !self.reachable(leader, peer) {
                continue;
            }
            let Some(msg) = self.nodes.get(&leader).map(|n| self.append_entries_for(n, peer))
            else {
                continue;
            };
            self.send(leader, peer, msg);
        }
    }

    /// At most one entry per heartbeat: the entry at the peer's cursor, which
    /// walks committed entries the peer is missing before newer ones.
    fn append_entries_for(&self, leader: &RaftNode, peer: NodeId) -> RaftMsg {
        let log_len = leader.log.len();
        let next = leader
            .next_idx(peer)
            .unwrap_or(log_len)
            .clamp(1, log_len);
        let prev_log_idx = next - 1;
        let entry = leader.entry(next).cloned();
        if entry.is_some() && next <= self.ledger.len() {
            debug!(leader = leader.id(), peer, idx = next, "catch-up of committed entry");
        }
        RaftMsg::AppendEntries {
            term: leader.term(),
            leader: leader.id(),
            prev_log_idx,
            prev_log_term: leader.log[prev_log_idx].term,
            entry,
            leader_commit_idx: leader.commit_idx(),
        }
    }

    #[allow(clippy::too_many_arguments)]
    pub(crate) fn receive_append_entries(
        &mut self,
        to: NodeId,
        term: Term,
        leader: NodeId,
        prev_log_idx: usize,
        prev_log_term: Term,
        entry: Option<LogEntry>,
        leader_commit_idx: usize,
    ) {
        let Some(node) = self.nodes.get_mut(&to) else {
            return;
        };
        if term < node.term() {
            debug!(node = to, leader, term, my_term = node.term(), "stale AppendEntries");
            let reply = RaftMsg::AppendEntriesReply {
                term: node.term(),
                replier: to,
                is_success: false,
                match_idx: 0,
                next_idx: 0,
            };
            self.send_reply(to, leader, reply);
            return;
        }

        node.adopt_term(term);
        if !matches!(node.state, RaftState::Follower) {
            info!(node = to, leader, term, "stepping down, heard from leader");
            node.transition_to_follower();
        }

        // Are we ready for this entry?
        let consistent = node
            .log
            .get(prev_log_idx)
            .is_some_and(|e| e.term == prev_log_term);
        let reply = if consistent {
            let match_idx = match entry {
                Some(entry) => {
                    node.write_entry(prev_log_idx + 1, entry);
                    prev_log_idx + 1
                }
                None => prev_log_idx,
            };
            if leader_commit_idx > node.commit_idx {
                node.commit_idx = cmp::min(leader_commit_idx, match_idx);
            }
            RaftMsg::AppendEntriesReply {
                term,
                replier: to,
                is_success: true,
                match_idx,
                next_idx: match_idx + 1,
            }
        } else {
            // Retry from our end of log, or from the conflicting entry.
            let next_idx = cmp::max(1, cmp::min(prev_log_idx, node.log.len()));
            debug!(node = to, leader, prev_log_idx, next_idx, "log mismatch");
            RaftMsg::AppendEntriesReply {
                term,
                replier: to,
                is_success: false,
                match_idx: 0,
                next_idx,
            }
        };

        self.rearm_election_timer(to);
        self.send_reply(to, leader, reply);
    }

    pub(crate) fn receive_append_entries_reply(
        &mut self,
        to: NodeId,
        term: Term,
        replier: NodeId,
        is_success: bool,
        match_idx: usize,
        next_idx: usize,
    ) {
        let Some(node) = self.nodes.get_mut(&to) else {
            return;
        };
        if term > node.term() {
            node.adopt_term(term);
            if node.is_leader() {
                info!(node = to, replier, term, "stepping down, peer has higher term");
                node.transition_to_follower();
                self.rearm_election_timer(to);
            }
            return;
        }
        if term < node.term() {
            return;
        }
        let RaftState::Leader {
            next_idxs,
            match_idxs,
        } = &mut node.state
        else {
            return;
        };
        if is_success {
            let matched = match_idxs.entry(replier).or_insert(0);
            *matched = cmp::max(*matched, match_idx);
            next_idxs.insert(replier, *matched + 1);
        } else {
            // This follower wasn't ready for the entry we sent.
            next_idxs.insert(replier, cmp::max(1, next_idx));
        }
        self.advance_leader_commit(to);
    }

    /// Highest index N in the leader's current term held by a majority of
    /// live nodes. Entries from earlier terms are never committed by
    /// counting alone.
    fn advance_leader_commit(&mut self, leader: NodeId) {
        let mut alive = HashSet::new();
        for n in self.nodes.values().filter(|n| n.is_alive()) {
            alive.insert(n.id());
        }
        let quorum = SimConfig::quorum(alive.len());
        let Some(node) = self.nodes.get_mut(&leader) else {
            return;
        };
        let RaftState::Leader { match_idxs, .. } = &node.state else {
            return;
        };
        let mut new_commit = None;
        for idx in (node.commit_idx + 1..=node.last_log_idx()).rev() {
            if node.log[idx].term != node.term {
                continue;
            }
            // The leader implicitly counts itself
            let acks = 1 + match_idxs
                .iter()
                .filter(|(peer, matched)| alive.contains(*peer) && **matched >= idx)
                .count();
            if acks >= quorum {
                new_commit = Some(idx);
                break;
            }
        }
        if let Some(idx) = new_commit {
            node.commit_idx = idx;
            debug!(leader, commit_idx = idx, "leader commit advanced");
        }
    }

    pub(crate) fn apply_committed(&mut self) {
        for node in self.nodes.values_mut().filter(|n| n.is_alive()) {
            node.apply_committed();
        }
    }
}
