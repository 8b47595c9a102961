use thiserror::Error;

use raftsim_raft::SimError;

#[derive(Error, Debug)]
pub enum ClusterError {
    /// Unparsable request or payload.
    #[error("Malformed command: {source}")]
    Malformed {
        #[from]
        source: serde_json::Error,
    },

    #[error("Unknown command: {name}")]
    UnknownCommand { name: String },

    #[error(transparent)]
    Sim(#[from] SimError),

    #[error("Cluster driver has stopped")]
    Closed,
}

pub type Result<T> = std::result::Result<T, ClusterError>;
