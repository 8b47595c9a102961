//! Simulation timing and cluster-shape parameters.

use std::{env, str::FromStr};

use crate::error::{Result, SimError};
use crate::msg::Millis;

/// Simulation configuration.
///
/// All durations are on the logical clock, which advances by `tick_ms` on
/// every live tick.
#[derive(Clone, Debug)]
pub struct SimConfig {
    /// Cluster size. Node ids run from 1 to `node_count`.
    pub node_count: usize,

    /// Seed for the simulation's random source.
    pub seed: u64,

    /// Logical time added per live tick.
    pub tick_ms: Millis,

    /// Leader heartbeat period. Must be shorter than `election_base_ms`.
    pub heartbeat_ms: Millis,

    /// Minimum election timeout.
    pub election_base_ms: Millis,

    /// Election timeouts are `election_base_ms + [0, election_jitter_ms)`.
    pub election_jitter_ms: Millis,

    /// Additional jitter whenever an election deadline is re-armed.
    pub rearm_jitter_ms: Millis,

    /// Travel time of AppendEntries, RequestVote and Elected.
    pub request_travel_ms: Millis,

    /// Travel time of AppendEntriesReply and VoteGranted.
    pub reply_travel_ms: Millis,

    /// Replies leave this long after the request arrived.
    pub reply_departure_ms: Millis,

    /// Deadline for a new leader's first heartbeat.
    pub first_heartbeat_ms: Millis,

    /// Election deadline given to a node recovering into a leaderless cluster.
    pub recovery_fast_track_ms: Millis,

    /// Below this many live nodes the simulation resets itself.
    pub min_live_nodes: usize,
}

impl Default for SimConfig {
    fn default() -> Self {
        Self {
            node_count: 5,
            seed: 0,
            tick_ms: 100,
            heartbeat_ms: 2400,
            election_base_ms: 5000,
            election_jitter_ms: 2500,
            rearm_jitter_ms: 500,
            request_travel_ms: 1200,
            reply_travel_ms: 900,
            reply_departure_ms: 100,
            first_heartbeat_ms: 100,
            recovery_fast_track_ms: 300,
            min_live_nodes: 3,
        }
    }
}

impl SimConfig {
    pub fn with_seed(seed: u64) -> Self {
        Self {
            seed,
            ..Self::default()
        }
    }

    /// Defaults, overridden by `RAFTSIM_SEED`, `RAFTSIM_NODES` and
    /// `RAFTSIM_TICK_MS` when set.
    pub fn from_env() -> Result<Self> {
        let mut config = Self::default();
        if let Some(seed) = env_var("RAFTSIM_SEED")? {
            config.seed = seed;
        }
        if let Some(node_count) = env_var("RAFTSIM_NODES")? {
            config.node_count = node_count;
        }
        if let Some(tick_ms) = env_var("RAFTSIM_TICK_MS")? {
            config.tick_ms = tick_ms;
        }
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.min_live_nodes == 0 {
            return Err(invalid("min_live_nodes must be at least 1"));
        }
        if self.node_count < self.min_live_nodes {
            return Err(invalid(format!(
                "node_count {} is below min_live_nodes {}",
                self.node_count, self.min_live_nodes
            )));
        }
        if self.tick_ms == 0 {
            return Err(invalid("tick_ms must be positive"));
        }
        if self.heartbeat_ms >= self.election_base_ms {
            return Err(invalid(format!(
                "heartbeat_ms {} must be below election_base_ms {}",
                self.heartbeat_ms, self.election_base_ms
            )));
        }
        Ok(())
    }

    /// Votes or acknowledgements needed among `alive` nodes.
    pub fn quorum(alive: usize) -> usize {
        alive / 2 + 1
    }
}

fn invalid(reason: impl Into<String>) -> SimError {
    SimError::InvalidConfig {
        reason: reason.into(),
    }
}

fn env_var<T: FromStr>(key: &str) -> Result<Option<T>> {
    match env::var(key) {
        Ok(raw) => raw
            .trim()
            .parse()
            .map(Some)
            .map_err(|_| invalid(format!("{key}={raw} is not a valid value"))),
        Err(_) => Ok(None),
    }
}
