use thiserror::Error;

use crate::msg::{NodeId, Role};

/// Rejections from fault injection and client operations. A rejected call
/// leaves the live cluster state untouched.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SimError {
    #[error("Unknown node {id}")]
    UnknownNode { id: NodeId },

    #[error("Node {id} is unavailable")]
    NodeUnavailable { id: NodeId },

    #[error("No leader available")]
    NoLeader,

    #[error("Node {id} is a {role}, not a follower")]
    NotFollower { id: NodeId, role: Role },

    #[error("Node {id} has no uncommitted entry to drop")]
    NothingToDrop { id: NodeId },

    #[error("Configuration error: {reason}")]
    InvalidConfig { reason: String },
}

pub type Result<T> = std::result::Result<T, SimError>;
