use std::path::PathBuf;

use thiserror::Error;

/// Why a snapshot fetch or run submission produced no data.
///
/// Never crosses the transport boundary as a failure: `TraceTransport`
/// degrades every variant to "no new data" and reports it on the side channel.
#[derive(Debug, Clone, Error, PartialEq)]
pub enum TransportError {
    #[error("network error: {0}")]
    Network(String),

    #[error("upstream returned {status}: {message}")]
    Status { status: u16, message: String },

    #[error("malformed response: {0}")]
    Decode(String),
}

impl From<reqwest::Error> for TransportError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_decode() {
            TransportError::Decode(err.to_string())
        } else {
            TransportError::Network(err.to_string())
        }
    }
}

impl From<serde_json::Error> for TransportError {
    fn from(err: serde_json::Error) -> Self {
        TransportError::Decode(err.to_string())
    }
}

#[derive(Debug, Error)]
pub enum VisualizerError {
    #[error("unknown workflow: {0}")]
    UnknownWorkflow(String),

    #[error("workflow {workflow} has no scenario {scenario}")]
    UnknownScenario { workflow: String, scenario: String },

    #[error("workflow {0} has no scenario to replay")]
    NoScenario(String),

    #[error("failed to read workflow file {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("invalid workflow file {path}: {message}")]
    Parse { path: PathBuf, message: String },

    #[error(transparent)]
    Transport(#[from] TransportError),
}
