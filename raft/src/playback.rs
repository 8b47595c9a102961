//! Scripted frames shown before the cluster goes live.

use crate::msg::{MessageSummary, MsgKind, NodeId, NodeStatus, NodeSummary, Role, Term};

#[derive(Clone, Debug, PartialEq)]
pub struct Frame {
    pub nodes: Vec<(NodeId, Role, Term)>,
    pub messages: Vec<(NodeId, NodeId, MsgKind)>,
}

impl Frame {
    pub fn node_summaries(&self) -> Vec<NodeSummary> {
        self.nodes
            .iter()
            .map(|&(id, role, term)| NodeSummary {
                id,
                role,
                term,
                log: Vec::new(),
                status: NodeStatus::Healthy,
                loss_pct: 0.0,
            })
            .collect()
    }

    pub fn message_summaries(&self) -> Vec<MessageSummary> {
        self.messages
            .iter()
            .map(|&(from_id, to_id, kind)| MessageSummary {
                from_id,
                to_id,
                kind,
                dropped: false,
            })
            .collect()
    }
}

/// A first election won by node 1 in term 2, then a contested one won by
/// node 4 in term 3. Nodes past the fifth stay followers; arrows touching
/// missing nodes are left out.
pub fn playback_track(node_count: usize) -> Vec<Frame> {
    use MsgKind::*;
    use Role::*;
    // (base term, [(id, role, term)] overrides, messages)
    let script: [(Term, &[(NodeId, Role, Term)], &[(NodeId, NodeId, MsgKind)]); 5] = [
        (1, &[], &[]),
        (
            2,
            &[(1, Candidate, 2)],
            &[(1, 2, RequestVote), (1, 3, RequestVote)],
        ),
        (
            2,
            &[(1, Leader, 2)],
            &[(2, 1, VoteGranted), (3, 1, VoteGranted)],
        ),
        (
            2,
            &[(1, Leader, 2), (2, Candidate, 3), (4, Candidate, 3)],
            &[(4, 5, RequestVote), (4, 3, RequestVote), (2, 3, RequestVote)],
        ),
        (
            3,
            &[(4, Leader, 3)],
            &[(5, 4, VoteGranted), (3, 4, VoteGranted)],
        ),
    ];

    script
        .iter()
        .map(|(base_term, overrides, messages)| Frame {
            nodes: (1..=node_count)
                .map(|id| {
                    overrides
                        .iter()
                        .find(|(o, _, _)| *o == id)
                        .copied()
                        .unwrap_or((id, Follower, *base_term))
                })
                .collect(),
            messages: messages
                .iter()
                .filter(|(from, to, _)| *from <= node_count && *to <= node_count)
                .copied()
                .collect(),
        })
        .collect()
}
