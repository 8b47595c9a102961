use std::collections::BTreeMap;
use std::mem;
use tracing::{info, warn};

pub mod config;
pub mod error;
pub mod events;
pub mod msg;
pub mod node;
pub mod playback;
pub mod rng;
pub mod transport;

mod election;
mod faults;
mod ledger;
mod replication;

pub use config::SimConfig;
pub use error::{Result, SimError};
pub use events::SimEvent;
pub use ledger::CommitLedger;
pub use msg::{ClusterSnapshot, LogEntry, Millis, Mode, NodeId, Role, Term};
pub use node::RaftNode;

use election::ElectionState;
use playback::{playback_track, Frame};
use rng::SimRng;
use transport::{InFlightMessage, Transport};

/// Discrete-event simulation of one Raft cluster.
///
/// All engine state lives here and is only changed through `&mut self`,
/// so a tick can never overlap another tick or an operator call.
#[derive(Clone, Debug)]
pub struct Simulation {
    config: SimConfig,
    rng: SimRng,
    track: Vec<Frame>,
    mode: Mode,
    step: u64,
    /// Logical clock, advanced by `tick_ms` on every live tick
    now_ms: Millis,
    /// Empty during static playback
    nodes: BTreeMap<NodeId, RaftNode>,
    transport: Transport,
    election: ElectionState,
    ledger: CommitLedger,
    /// Cluster-wide drop rate, combined with each sender's own loss
    drop_rate: f64,
    alert: Option<String>,
    last_leader: Option<NodeId>,
    /// Leader and term whose first heartbeat has gone out
    announced: Option<(NodeId, Term)>,
    events: Vec<SimEvent>,
}

impl Simulation {
    pub fn new(config: SimConfig) -> Result<Self> {
        config.validate()?;
        Ok(Self {
            rng: SimRng::new(config.seed),
            track: playback_track(config.node_count),
            config,
            mode: Mode::Static,
            step: 0,
            now_ms: 0,
            nodes: BTreeMap::new(),
            transport: Transport::default(),
            election: ElectionState::default(),
            ledger: CommitLedger::default(),
            drop_rate: 0.0,
            alert: None,
            last_leader: None,
            announced: None,
            events: Vec::new(),
        })
    }

    /// Discards all cluster state and returns to the first playback frame.
    pub fn reset(&mut self) {
        self.mode = Mode::Static;
        self.step = 0;
        self.now_ms = 0;
        self.nodes.clear();
        self.transport = Transport::default();
        self.election = ElectionState::default();
        self.ledger = CommitLedger::default();
        self.drop_rate = 0.0;
        self.alert = None;
        self.last_leader = None;
        self.announced = None;
        self.events.clear();
        info!("simulation reset");
    }

    /// Advances one unit of time and returns the resulting snapshot.
    ///
    /// In static mode this moves to the next playback frame. Live ticks
    /// deliver due messages, recompute the commit ledger, evaluate mode
    /// transitions, then run the coordinator for the current mode.
    pub fn tick(&mut self) -> ClusterSnapshot {
        if self.mode == Mode::Static {
            self.step += 1;
            return self.snapshot();
        }

        self.now_ms += self.config.tick_ms;
        self.deliver_due();
        self.recompute_ledger();
        if !self.evaluate_mode() {
            return self.snapshot();
        }
        match self.mode {
            Mode::Dynamic => {
                self.check_election_timeouts();
                self.run_heartbeats();
            }
            Mode::Election => self.run_election(),
            Mode::Static => {}
        }
        self.apply_committed();
        self.step += 1;
        self.snapshot()
    }

    /// Steps the playback track. Live clusters are paced by the driver, so
    /// outside static mode this only reports the current state.
    pub fn advance_step(&mut self) -> ClusterSnapshot {
        if self.mode == Mode::Static {
            self.tick()
        } else {
            self.snapshot()
        }
    }

    /// Returns false when the cluster had too few live nodes and was reset.
    fn evaluate_mode(&mut self) -> bool {
        let alive = self.alive_count();
        if alive < self.config.min_live_nodes {
            let alert = format!(
                "Only {alive} of {} nodes are alive, so no majority can make progress. \
                 The cluster was reset.",
                self.config.node_count
            );
            warn!(alive, "too few live nodes, resetting");
            self.reset();
            self.alert = Some(alert);
            self.record(SimEvent::AutoReset { alive });
            return false;
        }

        let has_leader = self.current_leader().is_some();
        match self.mode {
            Mode::Dynamic if !has_leader => self.enter_election(),
            Mode::Election if has_leader => {
                self.election = ElectionState::default();
                self.mode = Mode::Dynamic;
            }
            _ => {}
        }
        true
    }

    /// Ends static playback, turning the current frame into live nodes with
    /// the same roles and terms.
    fn go_live(&mut self) {
        if self.mode != Mode::Static {
            return;
        }
        let frame = self.frame().clone();
        let ids: Vec<NodeId> = frame.nodes.iter().map(|(id, _, _)| *id).collect();
        self.nodes = frame
            .nodes
            .iter()
            .map(|&(id, role, term)| {
                let node = RaftNode::from_frame(id, role, term, ids.iter().copied());
                (id, node)
            })
            .collect();
        self.mode = Mode::Dynamic;
        self.alert = None;
        self.last_leader = self.current_leader();
        let first_heartbeat = self.now_ms + self.config.first_heartbeat_ms;
        for id in ids {
            self.rearm_election_timer(id);
            if let Some(node) = self.nodes.get_mut(&id).filter(|n| n.is_leader()) {
                node.heartbeat_due_ms = first_heartbeat;
            }
        }
        info!(step = self.step, leader = ?self.last_leader, "playback ended, cluster is live");
    }

    fn frame(&self) -> &Frame {
        &self.track[self.step as usize % self.track.len()]
    }

    pub fn snapshot(&self) -> ClusterSnapshot {
        let (nodes, messages, committed) = if self.mode == Mode::Static {
            let frame = self.frame();
            (frame.node_summaries(), frame.message_summaries(), Vec::new())
        } else {
            (
                self.nodes.values().map(|n| n.summary()).collect(),
                self.transport
                    .messages()
                    .iter()
                    .map(|m| m.summary())
                    .collect(),
                self.ledger.entries().to_vec(),
            )
        };
        ClusterSnapshot {
            step: self.step,
            mode: self.mode,
            nodes,
            messages,
            committed,
            drop_rate: self.drop_rate,
            alert: self.alert.clone(),
        }
    }

    /// The live leader with the highest term, if any.
    pub fn current_leader(&self) -> Option<NodeId> {
        self.nodes
            .values()
            .filter(|n| n.is_alive() && n.is_leader())
            .max_by_key(|n| n.term())
            .map(|n| n.id())
    }

    pub fn alive_count(&self) -> usize {
        self.nodes.values().filter(|n| n.is_alive()).count()
    }

    pub(crate) fn peer_ids(&self, id: NodeId) -> Vec<NodeId> {
        self.nodes.keys().copied().filter(|p| *p != id).collect()
    }

    pub(crate) fn record(&mut self, event: SimEvent) {
        self.events.push(event);
    }

    /// Events recorded since the last call.
    pub fn drain_events(&mut self) -> Vec<SimEvent> {
        mem::take(&mut self.events)
    }

    pub fn config(&self) -> &SimConfig {
        &self.config
    }

    pub fn mode(&self) -> Mode {
        self.mode
    }

    pub fn step(&self) -> u64 {
        self.step
    }

    pub fn now_ms(&self) -> Millis {
        self.now_ms
    }

    pub fn node(&self, id: NodeId) -> Option<&RaftNode> {
        self.nodes.get(&id)
    }

    pub fn nodes(&self) -> impl Iterator<Item = &RaftNode> {
        self.nodes.values()
    }

    pub fn ledger(&self) -> &CommitLedger {
        &self.ledger
    }

    pub fn in_flight(&self) -> &[InFlightMessage] {
        self.transport.messages()
    }

    pub fn drop_rate(&self) -> f64 {
        self.drop_rate
    }

    pub fn alert(&self) -> Option<&str> {
        self.alert.as_deref()
    }
}
