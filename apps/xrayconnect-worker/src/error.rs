use std::fmt;

use thiserror::Error;
use xrayconnect_queue::HandlerError;

/// Where a task was when it failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage {
    Received,
    ConnectionLoaded,
    ServerResolved,
    PanelResolved,
    ClientAdded,
    KeyGenerated,
    Persisted,
    TrafficFetched,
    Deactivated,
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Stage::Received => "received",
            Stage::ConnectionLoaded => "connection_loaded",
            Stage::ServerResolved => "server_resolved",
            Stage::PanelResolved => "panel_resolved",
            Stage::ClientAdded => "client_added",
            Stage::KeyGenerated => "key_generated",
            Stage::Persisted => "persisted",
            Stage::TrafficFetched => "traffic_fetched",
            Stage::Deactivated => "deactivated",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Error)]
pub enum TaskError {
    /// Redelivery cannot succeed: a row is missing or an operator must act.
    #[error("{stage}: {error:#}")]
    Terminal { stage: Stage, error: anyhow::Error },
    /// Storage or panel trouble that may clear up on redelivery.
    #[error("{stage}: {error:#}")]
    Retryable { stage: Stage, error: anyhow::Error },
}

impl TaskError {
    pub fn terminal(stage: Stage, error: impl Into<anyhow::Error>) -> Self {
        TaskError::Terminal {
            stage,
            error: error.into(),
        }
    }

    pub fn retryable(stage: Stage, error: impl Into<anyhow::Error>) -> Self {
        TaskError::Retryable {
            stage,
            error: error.into(),
        }
    }

    pub fn stage(&self) -> Stage {
        match self {
            TaskError::Terminal { stage, .. } | TaskError::Retryable { stage, .. } => *stage,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, TaskError::Terminal { .. })
    }
}

impl From<TaskError> for HandlerError {
    fn from(err: TaskError) -> Self {
        if err.is_terminal() {
            HandlerError::Terminal(anyhow::Error::new(err))
        } else {
            HandlerError::Retryable(anyhow::Error::new(err))
        }
    }
}
