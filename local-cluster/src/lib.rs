use std::time::Duration;
use tokio::{
    sync::{broadcast, mpsc, oneshot},
    task::JoinHandle,
    time::{self, MissedTickBehavior},
};
use tracing::{debug, info, warn};

pub mod command;
pub mod error;
pub mod local_cluster_tester;
pub mod metrics;

use crate::command::{Command, Reply};
use crate::error::{ClusterError, Result};
use crate::metrics::ClusterMetrics;
use raftsim_raft::{ClusterSnapshot, Mode, SimConfig, Simulation};

#[derive(Clone, Debug)]
pub struct ClusterConfig {
    pub sim: SimConfig,
    /// Wall-clock pause between driver ticks while running
    pub tick_interval: Duration,
    /// Static playback moves one frame every this many driver ticks
    pub playback_every: u64,
    /// Tick from the start instead of waiting for `start`
    pub running: bool,
    pub channel_capacity: usize,
}

impl ClusterConfig {
    pub fn new(sim: SimConfig) -> Self {
        Self {
            tick_interval: Duration::from_millis(sim.tick_ms),
            sim,
            playback_every: 10,
            running: false,
            channel_capacity: 1024,
        }
    }

    pub fn from_env() -> Result<Self> {
        Ok(Self::new(SimConfig::from_env()?))
    }
}

impl Default for ClusterConfig {
    fn default() -> Self {
        Self::new(SimConfig::default())
    }
}

/// A command and where to send its reply.
pub struct CtlRequest {
    pub command: Command,
    pub reply_tx: oneshot::Sender<Result<Reply>>,
}

/// Owns the simulation and is the only task that touches it. Ticks and
/// commands are handled one at a time from a single loop.
pub struct Cluster {
    sim: Simulation,
    running: bool,
    tick_interval: Duration,
    playback_every: u64,
    driver_ticks: u64,
    /// Channel for requests from handles
    ctl_requests: mpsc::Receiver<CtlRequest>,
    /// Push channel for fresh snapshots
    state_tx: broadcast::Sender<ClusterSnapshot>,
    metrics: ClusterMetrics,
}

impl Cluster {
    pub fn new(
        config: ClusterConfig,
        ctl_requests: mpsc::Receiver<CtlRequest>,
        state_tx: broadcast::Sender<ClusterSnapshot>,
    ) -> Result<Self> {
        Ok(Self {
            sim: Simulation::new(config.sim)?,
            running: config.running,
            tick_interval: config.tick_interval,
            playback_every: config.playback_every.max(1),
            driver_ticks: 0,
            ctl_requests,
            state_tx,
            metrics: ClusterMetrics::default(),
        })
    }

    /// Runs until every handle is dropped, then returns the collected metrics.
    pub async fn run(mut self) -> ClusterMetrics {
        let mut ticker = time::interval(self.tick_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        loop {
            tokio::select! {
                request = self.ctl_requests.recv() => {
                    let Some(CtlRequest { command, reply_tx }) = request else {
                        break;
                    };
                    debug!(?command, "cluster received command");
                    let reply = self.process_command(command);
                    if reply_tx.send(reply).is_err() {
                        debug!("requester went away before the reply");
                    }
                }
                _ = ticker.tick(), if self.running => {
                    self.drive();
                }
            }
        }
        let summary = self.metrics.summary();
        info!(?summary, "cluster driver stopped");
        self.metrics
    }

    /// One driver tick. Playback frames advance more slowly than live time.
    fn drive(&mut self) {
        self.driver_ticks += 1;
        if self.sim.mode() == Mode::Static && self.driver_ticks % self.playback_every != 0 {
            return;
        }
        let snapshot = self.sim.tick();
        self.collect_events();
        self.broadcast(snapshot);
    }

    /// Applies one command. Successful mutations are followed by a state push.
    fn process_command(&mut self, command: Command) -> Result<Reply> {
        use Command::*;
        let info = match command {
            GetState => return Ok(Reply::State(self.sim.snapshot())),
            AdvanceStep => {
                let snapshot = self.sim.advance_step();
                format!("step {}", snapshot.step)
            }
            Reset => {
                self.sim.reset();
                self.metrics.clear_session();
                "reset".to_string()
            }
            Start => {
                self.running = true;
                return Ok(Reply::ack("started"));
            }
            Pause => {
                self.running = false;
                return Ok(Reply::ack("paused"));
            }
            CrashNode { node_id } => {
                self.sim.crash(node_id)?;
                format!("node {node_id} crashed")
            }
            RecoverNode { node_id } => {
                self.sim.recover(node_id)?;
                format!("node {node_id} recovered")
            }
            PartitionNode { node_id } => {
                self.sim.partition(node_id)?;
                format!("node {node_id} partitioned")
            }
            HealNode { node_id } => {
                self.sim.heal(node_id)?;
                format!("node {node_id} healed")
            }
            ForceTimeout { node_id } => {
                self.sim.force_timeout(node_id)?;
                format!("node {node_id} timed out")
            }
            SetDropProbability {
                node_id,
                probability,
            } => {
                self.sim.set_loss_probability(node_id, probability)?;
                match node_id {
                    Some(id) => format!("node {id} loss set"),
                    None => "drop rate set".to_string(),
                }
            }
            ClientCommand { command, node_id } => {
                let index = self.sim.client_command(command, node_id)?;
                format!("appended at index {index}")
            }
            DropLatestLog { node_id } => {
                let entry = self.sim.drop_latest_log(node_id)?;
                format!("dropped {} from node {node_id}", entry.command)
            }
        };
        self.collect_events();
        self.broadcast(self.sim.snapshot());
        Ok(Reply::ack(info))
    }

    fn collect_events(&mut self) {
        for event in self.sim.drain_events() {
            debug!(?event, "sim event");
            self.metrics.observe(&event);
        }
    }

    fn broadcast(&self, snapshot: ClusterSnapshot) {
        // No subscribers is fine; the state is still readable on request.
        let _ = self.state_tx.send(snapshot);
    }
}

/// Cloneable front door to a running `Cluster`.
#[derive(Clone)]
pub struct ClusterHandle {
    tx: mpsc::Sender<CtlRequest>,
    state_tx: broadcast::Sender<ClusterSnapshot>,
}

impl ClusterHandle {
    pub async fn send(&self, command: Command) -> Result<Reply> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.tx
            .send(CtlRequest { command, reply_tx })
            .await
            .map_err(|_| ClusterError::Closed)?;
        reply_rx.await.map_err(|_| ClusterError::Closed)?
    }

    /// Parses and runs one raw JSON request. Every failure becomes an error
    /// reply.
    pub async fn send_json(&self, raw: &str) -> Reply {
        let result = match Command::parse(raw) {
            Ok(command) => self.send(command).await,
            Err(err) => Err(err),
        };
        result.unwrap_or_else(|err| {
            warn!(%err, "command rejected");
            Reply::error(&err)
        })
    }

    pub async fn get_state(&self) -> Result<ClusterSnapshot> {
        match self.send(Command::GetState).await? {
            Reply::State(snapshot) => Ok(snapshot),
            _ => Err(ClusterError::Closed),
        }
    }

    /// Resets and returns the fresh initial state.
    pub async fn reset(&self) -> Result<ClusterSnapshot> {
        self.send(Command::Reset).await?;
        self.get_state().await
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ClusterSnapshot> {
        self.state_tx.subscribe()
    }
}

/// Starts a cluster driver task.
pub fn spawn_cluster(config: ClusterConfig) -> Result<(ClusterHandle, JoinHandle<ClusterMetrics>)> {
    let (tx, rx) = mpsc::channel(config.channel_capacity);
    let (state_tx, _) = broadcast::channel(config.channel_capacity);
    let cluster = Cluster::new(config, rx, state_tx.clone())?;
    let task = tokio::spawn(cluster.run());
    Ok((ClusterHandle { tx, state_tx }, task))
}
