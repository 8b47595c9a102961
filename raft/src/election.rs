//! Candidate selection, RequestVote handling, vote tallying and leader
//! installation.

use tracing::{debug, info};

use crate::config::SimConfig;
use crate::events::SimEvent;
use crate::msg::{LogEntry, Millis, Mode, NodeId, RaftMsg, Role, Term};
use crate::node::RaftState;
use crate::Simulation;

/// Candidates picked per election round.
const CANDIDATES_PER_ROUND: usize = 2;

/// Election bookkeeping, cleared whenever a leader is installed.
#[derive(Clone, Debug, Default)]
pub(crate) struct ElectionState {
    /// The last leader's log and term when it failed. Candidates must match it.
    pub(crate) leader_snapshot: Option<LeaderSnapshot>,
    /// End of the running round, if any.
    pub(crate) round_deadline_ms: Option<Millis>,
}

#[derive(Clone, Debug)]
pub(crate) struct LeaderSnapshot {
    pub(crate) id: NodeId,
    pub(crate) term: Term,
    pub(crate) log: Vec<LogEntry>,
}

impl Simulation {
    pub(crate) fn rearm_election_timer(&mut self, id: NodeId) {
        let jitter = self.rng.jitter(self.config.election_jitter_ms)
            + self.rng.jitter(self.config.rearm_jitter_ms);
        let deadline = self.now_ms + self.config.election_base_ms + jitter;
        if let Some(node) = self.nodes.get_mut(&id) {
            node.election_deadline_ms = deadline;
        }
    }

    pub(crate) fn enter_election(&mut self) {
        self.mode = Mode::Election;
        // Candidates already campaigning get a full round before being replaced.
        let campaigning = self
            .nodes
            .values()
            .any(|n| n.is_alive() && n.role() == Role::Candidate);
        self.election.round_deadline_ms =
            campaigning.then(|| self.now_ms + self.config.election_base_ms);
        if self.election.leader_snapshot.is_none() {
            self.election.leader_snapshot = self
                .last_leader
                .and_then(|id| self.nodes.get(&id))
                .map(|n| LeaderSnapshot {
                    id: n.id(),
                    term: n.term(),
                    log: n.entries().to_vec(),
                });
        }
        let previous = self.election.leader_snapshot.as_ref().map(|s| (s.id, s.term));
        info!(?previous, "no leader, entering election");
        self.record(SimEvent::ElectionStarted { at_ms: self.now_ms });
    }

    /// Election-mode tick: start a new round when none is running or the
    /// current one ran out of time.
    pub(crate) fn run_election(&mut self) {
        match self.election.round_deadline_ms {
            Some(deadline) if self.now_ms < deadline => {}
            _ => self.start_round(),
        }
    }

    fn start_round(&mut self) {
        // A new round supersedes unfinished candidacies.
        let stale: Vec<NodeId> = self
            .nodes
            .values()
            .filter(|n| n.is_alive() && n.role() == Role::Candidate)
            .map(|n| n.id())
            .collect();
        for id in stale {
            if let Some(node) = self.nodes.get_mut(&id) {
                node.transition_to_follower();
            }
        }

        let eligible = self.eligible_candidates();
        let chosen = self.rng.choose(&eligible, CANDIDATES_PER_ROUND);
        debug!(?eligible, ?chosen, "election round");
        let max_term = self.max_alive_term();
        for id in chosen {
            if let Some(node) = self.nodes.get_mut(&id) {
                node.adopt_term(max_term);
            }
            self.campaign(id);
        }
        self.election.round_deadline_ms = Some(self.now_ms + self.config.election_base_ms);
    }

    pub(crate) fn max_alive_term(&self) -> Term {
        self.nodes
            .values()
            .filter(|n| n.is_alive())
            .map(|n| n.term())
            .max()
            .unwrap_or(0)
    }

    /// Nodes allowed to stand this round: connected, holding exactly the
    /// failed leader's log, and at the highest live term. When nobody
    /// qualifies, the connected nodes with the most up-to-date logs that
    /// still contain the committed ledger.
    pub fn eligible_candidates(&self) -> Vec<NodeId> {
        let max_term = self.max_alive_term();
        let connected: Vec<_> = self
            .nodes
            .values()
            .filter(|n| n.is_alive() && !n.is_partitioned())
            .collect();

        let strict: Vec<NodeId> = match &self.election.leader_snapshot {
            Some(snapshot) => connected
                .iter()
                .filter(|n| n.term() >= max_term && n.entries() == snapshot.log.as_slice())
                .map(|n| n.id())
                .collect(),
            None => Vec::new(),
        };
        if !strict.is_empty() {
            return strict;
        }

        let holders: Vec<_> = connected
            .into_iter()
            .filter(|n| self.ledger.is_prefix_of(n))
            .collect();
        let Some(best) = holders.iter().map(|n| n.log_position()).max() else {
            return Vec::new();
        };
        holders
            .iter()
            .filter(|n| n.log_position() == best)
            .map(|n| n.id())
            .collect()
    }

    /// Becomes candidate in the next term and asks every reachable peer for
    /// its vote.
    pub(crate) fn campaign(&mut self, id: NodeId) {
        let Some(node) = self.nodes.get_mut(&id) else {
            return;
        };
        node.transition_to_candidate();
        let term = node.term();
        let msg = RaftMsg::RequestVote {
            term,
            candidate: id,
            last_log_idx: node.last_log_idx(),
            last_log_term: node.last_log_term(),
        };
        info!(node = id, term, "became candidate");
        self.rearm_election_timer(id);
        self.send(id, id, RaftMsg::BecameCandidate { term });
        for peer in self.peer_ids(id) {
            if self.reachable(id, peer) {
                self.send(id, peer, msg.clone());
            }
        }
    }

    pub(crate) fn receive_vote_request(
        &mut self,
        to: NodeId,
        term: Term,
        candidate: NodeId,
        last_log_idx: usize,
        last_log_term: Term,
    ) {
        let holds_committed = self
            .nodes
            .get(&candidate)
            .is_some_and(|c| self.ledger.is_prefix_of(c));
        let Some(node) = self.nodes.get_mut(&to) else {
            return;
        };
        if term < node.term() {
            debug!(node = to, candidate, term, my_term = node.term(), "stale vote request");
            return;
        }
        let mut stepped_down = false;
        if term > node.term() {
            node.adopt_term(term);
            if node.role() != Role::Follower {
                info!(node = to, term, "stepping down for higher term");
                node.transition_to_follower();
                stepped_down = true;
            }
        }

        let up_to_date = (last_log_term, last_log_idx) >= node.log_position();
        let free = node.voted_for().map_or(true, |v| v == candidate);
        if !(holds_committed && up_to_date && free) {
            debug!(
                node = to,
                candidate, term, holds_committed, up_to_date, free, "vote refused"
            );
            if stepped_down {
                self.rearm_election_timer(to);
            }
            return;
        }

        node.voted_for = Some(candidate);
        debug!(node = to, candidate, term, "vote granted");
        self.rearm_election_timer(to);
        self.send_reply(to, candidate, RaftMsg::VoteGranted { term, voter: to });
    }

    pub(crate) fn receive_vote(&mut self, to: NodeId, term: Term, voter: NodeId) {
        let quorum = SimConfig::quorum(self.alive_count());
        let Some(node) = self.nodes.get_mut(&to) else {
            return;
        };
        if term != node.term() {
            return;
        }
        let RaftState::Candidate { votes } = &mut node.state else {
            return;
        };
        votes.insert(voter);
        let count = votes.len();
        debug!(node = to, voter, term, count, quorum, "vote received");
        if count >= quorum {
            self.install_leader(to);
        }
    }

    /// Makes `id` leader of its term and settles the rest of the connected
    /// cluster as its followers.
    pub(crate) fn install_leader(&mut self, id: NodeId) {
        let Some(term) = self.nodes.get(&id).map(|n| n.term()) else {
            return;
        };
        // Quorum follows the alive count, so a cut-off leader may still hold
        // this term.
        let rival = self
            .nodes
            .values()
            .any(|n| n.id() != id && n.is_alive() && n.is_leader() && n.term() == term);
        if rival {
            debug!(node = id, term, "term already has a leader, standing down");
            if let Some(node) = self.nodes.get_mut(&id) {
                node.transition_to_follower();
            }
            self.rearm_election_timer(id);
            return;
        }

        let peers = self.peer_ids(id);
        let first_heartbeat = self.now_ms + self.config.first_heartbeat_ms;
        let Some(node) = self.nodes.get_mut(&id) else {
            return;
        };
        node.transition_to_leader(peers.iter().copied());
        node.heartbeat_due_ms = first_heartbeat;

        for peer in peers {
            let connected = self
                .nodes
                .get(&peer)
                .is_some_and(|n| n.is_alive() && !n.is_partitioned());
            if !connected {
                continue;
            }
            // Nodes already past this term learn of it through messages.
            if let Some(other) = self.nodes.get_mut(&peer).filter(|n| n.term() <= term) {
                other.transition_to_follower();
                // Settled on the winner: no second vote in this term.
                other.term = term;
                other.voted_for = Some(id);
            }
            self.rearm_election_timer(peer);
            self.send(id, peer, RaftMsg::Elected { term });
        }

        info!(node = id, term, "elected leader");
        self.record(SimEvent::LeaderElected {
            id,
            term,
            at_ms: self.now_ms,
        });
        self.last_leader = Some(id);
        self.election = ElectionState::default();
        self.mode = Mode::Dynamic;
    }

    /// Dynamic-mode timers: a follower that has not heard from a leader in
    /// time campaigns; a candidate that ran out of time gives up.
    pub(crate) fn check_election_timeouts(&mut self) {
        let now = self.now_ms;
        let expired: Vec<(NodeId, Role)> = self
            .nodes
            .values()
            .filter(|n| n.is_alive() && !n.is_leader() && n.election_deadline_ms() <= now)
            .map(|n| (n.id(), n.role()))
            .collect();
        for (id, role) in expired {
            match role {
                Role::Follower => {
                    debug!(node = id, "election timeout");
                    self.campaign(id);
                }
                Role::Candidate => {
                    debug!(node = id, "candidacy timed out");
                    if let Some(node) = self.nodes.get_mut(&id) {
                        node.transition_to_follower();
                    }
                    self.rearm_election_timer(id);
                }
                Role::Leader => {}
            }
        }
    }
}
