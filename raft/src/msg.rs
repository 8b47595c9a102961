use serde::Serialize;
use std::fmt;

pub type Term = u64;
pub type NodeId = usize;
/// Milliseconds on the simulation's logical clock.
pub type Millis = u64;

#[derive(Clone, Debug, Eq, PartialEq, Hash, Serialize)]
pub struct LogEntry {
    pub term: Term,
    pub command: String,
}

impl LogEntry {
    pub fn new(term: Term, command: impl Into<String>) -> Self {
        Self {
            term,
            command: command.into(),
        }
    }

    /// Occupies index 0 of every node log so real entries start at 1.
    pub(crate) fn placeholder() -> Self {
        Self::new(0, "")
    }
}

#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash)]
pub enum Role {
    Follower,
    Candidate,
    Leader,
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Role::Follower => "follower",
            Role::Candidate => "candidate",
            Role::Leader => "leader",
        };
        f.write_str(s)
    }
}

impl Serialize for Role {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

#[derive(Clone, Copy, Debug, Eq, PartialEq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Mode {
    /// Scripted playback, before any live fault or write.
    Static,
    /// Steady-state live operation.
    Dynamic,
    /// Live operation with no leader; the election coordinator runs rounds.
    Election,
}

#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum MsgKind {
    AppendEntries,
    AppendEntriesReply,
    RequestVote,
    VoteGranted,
    Elected,
    BecameCandidate,
}

/// Protocol messages. Delivery effects are dispatched on the variant, see
/// `Simulation::deliver`.
#[derive(Clone, Debug, PartialEq)]
pub enum RaftMsg {
    RequestVote {
        term: Term,
        candidate: NodeId,
        last_log_idx: usize,
        last_log_term: Term,
    },
    VoteGranted {
        term: Term,
        voter: NodeId,
    },
    AppendEntries {
        term: Term,
        leader: NodeId,
        prev_log_idx: usize,
        prev_log_term: Term,
        /// At most one entry per heartbeat.
        entry: Option<LogEntry>,
        leader_commit_idx: usize,
    },
    AppendEntriesReply {
        term: Term,
        replier: NodeId,
        is_success: bool,
        /// Highest index known to match the leader (success only)
        match_idx: usize,
        /// Where the leader should resume sending (failure only)
        next_idx: usize,
    },
    /// Observability markers, no delivery effect.
    Elected {
        term: Term,
    },
    BecameCandidate {
        term: Term,
    },
}

impl RaftMsg {
    pub fn kind(&self) -> MsgKind {
        use RaftMsg::*;
        match self {
            RequestVote { .. } => MsgKind::RequestVote,
            VoteGranted { .. } => MsgKind::VoteGranted,
            AppendEntries { .. } => MsgKind::AppendEntries,
            AppendEntriesReply { .. } => MsgKind::AppendEntriesReply,
            Elected { .. } => MsgKind::Elected,
            BecameCandidate { .. } => MsgKind::BecameCandidate,
        }
    }
}

///////////////////////////////////////////////////
// The rest of this module is the observer-facing projection.
///////////////////////////////////////////////////
#[derive(Clone, Copy, Debug, Eq, PartialEq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum NodeStatus {
    Healthy,
    Crashed,
    Partitioned,
}

#[derive(Clone, Debug, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct NodeSummary {
    pub id: NodeId,
    pub role: Role,
    pub term: Term,
    pub log: Vec<LogEntry>,
    pub status: NodeStatus,
    pub loss_pct: f64,
}

impl NodeSummary {
    pub fn is_leader(&self) -> bool {
        self.role == Role::Leader
    }

    pub fn is_crashed(&self) -> bool {
        self.status == NodeStatus::Crashed
    }
}

#[derive(Clone, Debug, Eq, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct MessageSummary {
    pub from_id: NodeId,
    pub to_id: NodeId,
    #[serde(rename = "type")]
    pub kind: MsgKind,
    pub dropped: bool,
}

/// Rebuilt on every read. Consumers get their own copy.
#[derive(Clone, Debug, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ClusterSnapshot {
    pub step: u64,
    pub mode: Mode,
    pub nodes: Vec<NodeSummary>,
    pub messages: Vec<MessageSummary>,
    pub committed: Vec<LogEntry>,
    pub drop_rate: f64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub alert: Option<String>,
}

impl ClusterSnapshot {
    pub fn leaders(&self) -> Vec<&NodeSummary> {
        self.nodes
            .iter()
            .filter(|n| n.is_leader() && !n.is_crashed())
            .collect()
    }

    pub fn node(&self, id: NodeId) -> Option<&NodeSummary> {
        self.nodes.iter().find(|n| n.id == id)
    }
}
