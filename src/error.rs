use std::{fmt, path::PathBuf, time::Duration};

use thiserror::Error;

#[derive(Debug, Error)]
pub enum LLMError {
    #[error("http error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("provider error: {0}")]
    Provider(String),

    #[error("missing API key: set the {0} environment variable")]
    MissingApiKey(&'static str),

    #[error("invalid response from provider: {0}")]
    InvalidResponse(&'static str),

    #[error("template error: {0}")]
    Template(#[from] handlebars::RenderError),
}

/// The external service a failed call was made to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Collaborator {
    Simulator,
    Agent,
}

impl fmt::Display for Collaborator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Collaborator::Simulator => f.write_str("user simulator"),
            Collaborator::Agent => f.write_str("agent under test"),
        }
    }
}

#[derive(Debug, Error)]
pub enum EvalError {
    #[error("configuration error: {0}")]
    Config(String),

    #[error("unknown scenario: {0}")]
    UnknownScenario(String),

    #[error("invalid scenario {id}: {reason}")]
    InvalidScenario { id: String, reason: String },

    #[error("{collaborator} call failed on turn {turn}: {source}")]
    ExternalCall {
        collaborator: Collaborator,
        turn: u32,
        #[source]
        source: LLMError,
    },

    #[error("{collaborator} call timed out after {after:?} on turn {turn}")]
    Timeout {
        collaborator: Collaborator,
        turn: u32,
        after: Duration,
    },

    #[error("conversation aborted: {0}")]
    Aborted(String),

    #[error("failed to read {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("yaml error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),
}

impl EvalError {
    pub(crate) fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        EvalError::Io {
            path: path.into(),
            source,
        }
    }

    pub(crate) fn invalid(id: impl Into<String>, reason: impl Into<String>) -> Self {
        EvalError::InvalidScenario {
            id: id.into(),
            reason: reason.into(),
        }
    }

    /// Whether this error stems from configuration rather than a running conversation.
    pub fn is_config(&self) -> bool {
        !matches!(
            self,
            EvalError::ExternalCall { .. } | EvalError::Timeout { .. } | EvalError::Aborted(_)
        )
    }
}
