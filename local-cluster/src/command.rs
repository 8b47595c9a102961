//! JSON vocabulary of the command/push channel.
//!
//! Requests are `{"type": <name>, "payload": {...}}`. Replies use the same
//! envelope with `state`, `ack` or `error` as the type.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use raftsim_raft::{ClusterSnapshot, NodeId};

use crate::error::{ClusterError, Result};

#[derive(Clone, Debug, PartialEq)]
pub enum Command {
    GetState,
    AdvanceStep,
    Reset,
    Start,
    Pause,
    CrashNode { node_id: NodeId },
    RecoverNode { node_id: NodeId },
    PartitionNode { node_id: NodeId },
    HealNode { node_id: NodeId },
    ForceTimeout { node_id: NodeId },
    /// `node_id: None` sets the cluster-wide drop rate.
    SetDropProbability {
        node_id: Option<NodeId>,
        probability: f64,
    },
    ClientCommand {
        command: String,
        node_id: Option<NodeId>,
    },
    DropLatestLog { node_id: NodeId },
}

#[derive(Deserialize)]
struct Envelope {
    #[serde(rename = "type")]
    kind: String,
    #[serde(default)]
    payload: Value,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct NodeTarget {
    node_id: NodeId,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct DropProbability {
    #[serde(default)]
    node_id: Option<NodeId>,
    probability: f64,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct ClientWrite {
    command: String,
    #[serde(default)]
    node_id: Option<NodeId>,
}

impl Command {
    /// Parses one request. Unknown names and malformed payloads are errors;
    /// nothing is executed for them.
    pub fn parse(raw: &str) -> Result<Self> {
        let Envelope { kind, payload } = serde_json::from_str(raw)?;
        let node = |payload: Value| -> Result<NodeId> {
            let target: NodeTarget = serde_json::from_value(payload)?;
            Ok(target.node_id)
        };
        use Command::*;
        let command = match kind.as_str() {
            "get_state" => GetState,
            "advance_step" => AdvanceStep,
            "reset" | "reset_simulation" => Reset,
            "start" | "start_simulation" => Start,
            "pause" | "pause_simulation" => Pause,
            "crash_node" => CrashNode {
                node_id: node(payload)?,
            },
            "recover_node" => RecoverNode {
                node_id: node(payload)?,
            },
            "partition_node" => PartitionNode {
                node_id: node(payload)?,
            },
            "heal_node" => HealNode {
                node_id: node(payload)?,
            },
            "force_timeout" => ForceTimeout {
                node_id: node(payload)?,
            },
            "drop_latest_log" => DropLatestLog {
                node_id: node(payload)?,
            },
            "set_drop_probability" | "drop_messages" => {
                let p: DropProbability = serde_json::from_value(payload)?;
                SetDropProbability {
                    node_id: p.node_id,
                    probability: p.probability,
                }
            }
            "client_command" => {
                let w: ClientWrite = serde_json::from_value(payload)?;
                ClientCommand {
                    command: w.command,
                    node_id: w.node_id,
                }
            }
            _ => return Err(ClusterError::UnknownCommand { name: kind }),
        };
        Ok(command)
    }
}

#[derive(Clone, Debug, PartialEq, Serialize)]
#[serde(tag = "type", content = "payload", rename_all = "snake_case")]
pub enum Reply {
    State(ClusterSnapshot),
    Ack(Ack),
    Error(ErrorReply),
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct Ack {
    pub ok: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub info: Option<String>,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct ErrorReply {
    pub message: String,
}

impl Reply {
    pub fn ack(info: impl Into<String>) -> Self {
        Reply::Ack(Ack {
            ok: true,
            info: Some(info.into()),
        })
    }

    pub fn error(err: &ClusterError) -> Self {
        Reply::Error(ErrorReply {
            message: err.to_string(),
        })
    }

    pub fn to_json(&self) -> String {
        // Replies hold only strings, numbers and plain structs.
        serde_json::to_string(self).unwrap_or_else(|err| {
            format!(r#"{{"type":"error","payload":{{"message":"{err}"}}}}"#)
        })
    }
}
