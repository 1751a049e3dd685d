use thiserror::Error;

use crate::registry::NodeStatus;

#[derive(Error, Debug)]
pub enum FleetError {
    #[error("Invalid registration: {0}")]
    InvalidRegistration(String),

    #[error("No eligible compute nodes for task type: {task_type}")]
    NoEligibleNodes {
        task_type: String,
        active_nodes: usize,
    },

    #[error("Dispatch to node {node_id} failed: {reason}")]
    DispatchFailed { node_id: String, reason: String },

    #[error("Unknown node: {0}")]
    NodeUnknown(String),

    #[error("Node {node_id} cannot move from {from} to {to}")]
    InvalidTransition {
        node_id: String,
        from: NodeStatus,
        to: NodeStatus,
    },

    #[error("Transport error: {0}")]
    Transport(String),

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("Configuration error: {0}")]
    Config(String),
}

impl FleetError {
    /// Stable machine-readable code for API responses.
    pub fn code(&self) -> &'static str {
        match self {
            FleetError::InvalidRegistration(_) => "INVALID_REGISTRATION",
            FleetError::NoEligibleNodes { .. } => "NO_ELIGIBLE_NODES",
            FleetError::DispatchFailed { .. } => "DISPATCH_FAILED",
            FleetError::NodeUnknown(_) => "NODE_UNKNOWN",
            FleetError::InvalidTransition { .. } => "INVALID_TRANSITION",
            FleetError::Transport(_) | FleetError::Http(_) => "TRANSPORT_ERROR",
            FleetError::Config(_) => "CONFIG_ERROR",
        }
    }
}

pub type Result<T> = std::result::Result<T, FleetError>;
