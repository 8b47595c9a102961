use ahash::{HashMap, HashMapExt, HashSet, HashSetExt};
use std::cmp;

use crate::msg::{LogEntry, Millis, NodeId, NodeStatus, NodeSummary, Role, Term};

#[derive(Clone, Debug)]
pub enum RaftState {
    Candidate {
        votes: HashSet<NodeId>,
    },
    Follower,
    Leader {
        // For each peer, idx of the next log entry to send to that peer
        // initialized to leader last log index + 1
        next_idxs: HashMap<NodeId, usize>,
        // For each peer, idx of highest log entry known to be replicated there
        // initialized to 0, increases monotonically within a term
        match_idxs: HashMap<NodeId, usize>,
    },
}

/// Runtime state of one cluster member.
#[derive(Clone, Debug)]
pub struct RaftNode {
    id: NodeId,
    pub(crate) state: RaftState,
    pub(crate) term: Term,
    pub(crate) voted_for: Option<NodeId>,
    /// Log of client commands with the terms they were created in.
    /// The 0th entry is always a placeholder.
    pub(crate) log: Vec<LogEntry>,
    /// index of highest log entry known to be committed
    pub(crate) commit_idx: usize,
    pub(crate) last_applied: usize,
    /// Leader only: next heartbeat round
    pub(crate) heartbeat_due_ms: Millis,
    /// Non-leaders: when to stand for election
    pub(crate) election_deadline_ms: Millis,
    /// Probability that a message sent by this node is lost
    pub(crate) loss_pct: f64,
    pub(crate) crashed: bool,
    pub(crate) partitioned: bool,
}

impl RaftNode {
    pub fn new(id: NodeId, term: Term) -> Self {
        Self {
            id,
            state: RaftState::Follower,
            term,
            voted_for: None,
            // 0th index is a placeholder
            log: vec![LogEntry::placeholder()],
            commit_idx: 0,
            last_applied: 0,
            heartbeat_due_ms: 0,
            election_deadline_ms: 0,
            loss_pct: 0.0,
            crashed: false,
            partitioned: false,
        }
    }

    /// Node as shown in a playback frame, with an empty log.
    pub(crate) fn from_frame(
        id: NodeId,
        role: Role,
        term: Term,
        peers: impl Iterator<Item = NodeId>,
    ) -> Self {
        let mut node = Self::new(id, term);
        match role {
            Role::Follower => {}
            Role::Candidate => {
                node.voted_for = Some(id);
                let mut votes = HashSet::new();
                votes.insert(id);
                node.state = RaftState::Candidate { votes };
            }
            Role::Leader => {
                node.voted_for = Some(id);
                node.transition_to_leader(peers);
            }
        }
        node
    }

    pub fn id(&self) -> NodeId {
        self.id
    }

    pub fn role(&self) -> Role {
        match self.state {
            RaftState::Follower => Role::Follower,
            RaftState::Candidate { .. } => Role::Candidate,
            RaftState::Leader { .. } => Role::Leader,
        }
    }

    pub fn is_leader(&self) -> bool {
        matches!(self.state, RaftState::Leader { .. })
    }

    pub fn term(&self) -> Term {
        self.term
    }

    pub fn voted_for(&self) -> Option<NodeId> {
        self.voted_for
    }

    /// Log entries without the placeholder; `entries()[i]` has index `i + 1`.
    pub fn entries(&self) -> &[LogEntry] {
        &self.log[1..]
    }

    /// Entry at a 1-based log index.
    pub fn entry(&self, idx: usize) -> Option<&LogEntry> {
        if idx == 0 {
            return None;
        }
        self.log.get(idx)
    }

    pub fn last_log_idx(&self) -> usize {
        self.log.len() - 1
    }

    pub fn last_log_term(&self) -> Term {
        self.log[self.last_log_idx()].term
    }

    pub fn commit_idx(&self) -> usize {
        self.commit_idx
    }

    pub fn last_applied(&self) -> usize {
        self.last_applied
    }

    pub fn election_deadline_ms(&self) -> Millis {
        self.election_deadline_ms
    }

    pub fn heartbeat_due_ms(&self) -> Millis {
        self.heartbeat_due_ms
    }

    pub fn loss_pct(&self) -> f64 {
        self.loss_pct
    }

    pub fn is_alive(&self) -> bool {
        !self.crashed
    }

    pub fn is_crashed(&self) -> bool {
        self.crashed
    }

    pub fn is_partitioned(&self) -> bool {
        self.partitioned
    }

    pub fn votes(&self) -> usize {
        match &self.state {
            RaftState::Candidate { votes } => votes.len(),
            _ => 0,
        }
    }

    pub fn match_idx(&self, peer: NodeId) -> Option<usize> {
        match &self.state {
            RaftState::Leader { match_idxs, .. } => match_idxs.get(&peer).copied(),
            _ => None,
        }
    }

    pub fn next_idx(&self, peer: NodeId) -> Option<usize> {
        match &self.state {
            RaftState::Leader { next_idxs, .. } => next_idxs.get(&peer).copied(),
            _ => None,
        }
    }

    /// (lastLogTerm, lastLogIndex), compared term first.
    pub fn log_position(&self) -> (Term, usize) {
        (self.last_log_term(), self.last_log_idx())
    }

    /// Whether `prefix` is exactly the start of this node's log.
    pub fn has_prefix(&self, prefix: &[LogEntry]) -> bool {
        self.entries().starts_with(prefix)
    }

    /// Moves to a higher term, forgetting the vote cast in the old one.
    pub(crate) fn adopt_term(&mut self, term: Term) {
        if term > self.term {
            self.term = term;
            self.voted_for = None;
        }
    }

    pub(crate) fn transition_to_follower(&mut self) {
        self.state = RaftState::Follower;
    }

    pub(crate) fn transition_to_candidate(&mut self) {
        self.term += 1;
        self.voted_for = Some(self.id);
        let mut votes = HashSet::new();
        votes.insert(self.id);
        self.state = RaftState::Candidate { votes };
    }

    pub(crate) fn transition_to_leader(&mut self, peers: impl Iterator<Item = NodeId>) {
        let mut next_idxs = HashMap::new();
        let mut match_idxs = HashMap::new();
        for id in peers.filter(|p| *p != self.id) {
            next_idxs.insert(id, self.log.len());
            match_idxs.insert(id, 0);
        }
        self.state = RaftState::Leader {
            next_idxs,
            match_idxs,
        };
    }

    /// Writes `entry` at `idx`. A conflicting entry and everything after it
    /// is discarded; an identical entry is left in place with its suffix.
    pub(crate) fn write_entry(&mut self, idx: usize, entry: LogEntry) {
        debug_assert!(idx >= 1 && idx <= self.log.len());
        if idx == self.log.len() {
            self.log.push(entry);
        } else if self.log[idx] != entry {
            self.log.truncate(idx);
            self.log.push(entry);
            self.commit_idx = cmp::min(self.commit_idx, idx - 1);
            self.last_applied = cmp::min(self.last_applied, self.commit_idx);
        }
    }

    /// Removes the newest entry, keeping indices and leader cursors in range.
    pub(crate) fn pop_entry(&mut self) -> Option<LogEntry> {
        if self.log.len() <= 1 {
            return None;
        }
        let entry = self.log.pop();
        let last = self.last_log_idx();
        self.commit_idx = cmp::min(self.commit_idx, last);
        self.last_applied = cmp::min(self.last_applied, last);
        if let RaftState::Leader {
            next_idxs,
            match_idxs,
        } = &mut self.state
        {
            for next in next_idxs.values_mut() {
                *next = cmp::min(*next, last + 1);
            }
            for matched in match_idxs.values_mut() {
                *matched = cmp::min(*matched, last);
            }
        }
        entry
    }

    pub(crate) fn apply_committed(&mut self) {
        self.commit_idx = cmp::min(self.commit_idx, self.last_log_idx());
        self.last_applied = self.commit_idx;
    }

    pub fn status(&self) -> NodeStatus {
        if self.crashed {
            NodeStatus::Crashed
        } else if self.partitioned {
            NodeStatus::Partitioned
        } else {
            NodeStatus::Healthy
        }
    }

    pub fn summary(&self) -> NodeSummary {
        NodeSummary {
            id: self.id,
            role: self.role(),
            term: self.term,
            log: self.entries().to_vec(),
            status: self.status(),
            loss_pct: self.loss_pct,
        }
    }
}
