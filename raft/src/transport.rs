//! In-flight message queue with simulated latency and loss.

use tracing::{debug, trace};

use crate::msg::{MessageSummary, Millis, MsgKind, NodeId, RaftMsg};
use crate::Simulation;

#[derive(Clone, Debug)]
pub struct InFlightMessage {
    pub id: u64,
    pub from: NodeId,
    pub to: NodeId,
    pub msg: RaftMsg,
    pub send_at: Millis,
    pub arrive_at: Millis,
    /// Lost in transit: still visible to observers, never delivered.
    pub dropped: bool,
}

impl InFlightMessage {
    pub fn kind(&self) -> MsgKind {
        self.msg.kind()
    }

    pub fn summary(&self) -> MessageSummary {
        MessageSummary {
            from_id: self.from,
            to_id: self.to,
            kind: self.kind(),
            dropped: self.dropped,
        }
    }
}

#[derive(Clone, Debug, Default)]
pub struct Transport {
    queue: Vec<InFlightMessage>,
    next_id: u64,
}

impl Transport {
    pub fn messages(&self) -> &[InFlightMessage] {
        &self.queue
    }

    fn push(
        &mut self,
        from: NodeId,
        to: NodeId,
        msg: RaftMsg,
        send_at: Millis,
        arrive_at: Millis,
        dropped: bool,
    ) -> u64 {
        self.next_id += 1;
        self.queue.push(InFlightMessage {
            id: self.next_id,
            from,
            to,
            msg,
            send_at,
            arrive_at,
            dropped,
        });
        self.next_id
    }

    /// Removes every message due at `now`, earliest arrival first.
    fn take_due(&mut self, now: Millis) -> Vec<InFlightMessage> {
        let (mut due, pending): (Vec<_>, Vec<_>) = self
            .queue
            .drain(..)
            .partition(|m| m.arrive_at <= now);
        self.queue = pending;
        due.sort_by_key(|m| (m.arrive_at, m.id));
        due
    }

    /// Forgets everything sent by or addressed to `id`.
    fn discard_node(&mut self, id: NodeId) -> usize {
        let before = self.queue.len();
        self.queue.retain(|m| m.from != id && m.to != id);
        before - self.queue.len()
    }
}

impl Simulation {
    /// Whether a message from `from` can currently reach `to`. Crash and
    /// partition both isolate a node in both directions.
    pub fn reachable(&self, from: NodeId, to: NodeId) -> bool {
        let connected = |id: NodeId| {
            self.nodes
                .get(&id)
                .is_some_and(|n| n.is_alive() && !n.is_partitioned())
        };
        connected(from) && connected(to)
    }

    pub(crate) fn effective_loss(&self, from: NodeId) -> f64 {
        let node_loss = self.nodes.get(&from).map_or(0.0, |n| n.loss_pct());
        node_loss.max(self.drop_rate)
    }

    /// Request leg: leaves now, arrives after `request_travel_ms`.
    pub(crate) fn send(&mut self, from: NodeId, to: NodeId, msg: RaftMsg) {
        let travel = self.config.request_travel_ms;
        self.schedule_ball(from, to, msg, 0, travel);
    }

    /// Reply leg: leaves slightly after the triggering arrival.
    pub(crate) fn send_reply(&mut self, from: NodeId, to: NodeId, msg: RaftMsg) {
        let depart = self.config.reply_departure_ms;
        let travel = self.config.reply_travel_ms;
        self.schedule_ball(from, to, msg, depart, travel);
    }

    fn schedule_ball(
        &mut self,
        from: NodeId,
        to: NodeId,
        msg: RaftMsg,
        depart_after: Millis,
        travel: Millis,
    ) {
        let loss = self.effective_loss(from);
        let dropped = self.rng.chance(loss);
        let send_at = self.now_ms + depart_after;
        let arrive_at = send_at + travel;
        let kind = msg.kind();
        let id = self
            .transport
            .push(from, to, msg, send_at, arrive_at, dropped);
        trace!(id, from, to, ?kind, arrive_at, dropped, "scheduled");
    }

    pub(crate) fn discard_messages_of(&mut self, id: NodeId) {
        let discarded = self.transport.discard_node(id);
        if discarded > 0 {
            debug!(node = id, discarded, "discarded in-flight messages");
        }
    }

    /// Applies the effect of every message that has arrived.
    pub(crate) fn deliver_due(&mut self) {
        for m in self.transport.take_due(self.now_ms) {
            if m.dropped {
                debug!(from = m.from, to = m.to, kind = ?m.kind(), "message lost");
                continue;
            }
            if !self.reachable(m.from, m.to) {
                debug!(from = m.from, to = m.to, kind = ?m.kind(), "destination unreachable");
                continue;
            }
            self.deliver(m.to, m.msg);
        }
    }

    fn deliver(&mut self, to: NodeId, msg: RaftMsg) {
        use RaftMsg::*;
        match msg {
            RequestVote {
                term,
                candidate,
                last_log_idx,
                last_log_term,
            } => self.receive_vote_request(to, term, candidate, last_log_idx, last_log_term),
            VoteGranted { term, voter } => self.receive_vote(to, term, voter),
            AppendEntries {
                term,
                leader,
                prev_log_idx,
                prev_log_term,
                entry,
                leader_commit_idx,
            } => self.receive_append_entries(
                to,
                term,
                leader,
                prev_log_idx,
                prev_log_term,
                entry,
                leader_commit_idx,
            ),
            AppendEntriesReply {
                term,
                replier,
                is_success,
                match_idx,
                next_idx,
            } => self.receive_append_entries_reply(
                to, term, replier, is_success, match_idx, next_idx,
            ),
            Elected { .. } | BecameCandidate { .. } => {}
        }
    }
}
