use std::path::PathBuf;
use std::time::Duration;

use crate::protocol::CorrelationId;

#[derive(Debug, thiserror::Error)]
pub enum BridgeError {
    #[error("worker executable '{0}' not found")]
    ExecutableNotFound(String),

    #[error("working directory {} does not exist", .0.display())]
    WorkingDirMissing(PathBuf),

    #[error("failed to launch worker '{program}': {source}")]
    Launch {
        program: String,
        #[source]
        source: std::io::Error,
    },

    #[error("invalid worker command: {0}")]
    InvalidCommand(String),

    #[error("channel input is closed")]
    ChannelClosed,

    #[error("failed reading worker output: {0}")]
    ChannelRead(#[source] std::io::Error),

    #[error("failed writing to worker input: {0}")]
    ChannelWrite(#[source] std::io::Error),

    #[error("failed to encode wire frame: {0}")]
    Encode(#[from] serde_json::Error),

    #[error("{0}")]
    Worker(String),

    #[error("process exited abnormally{}", exit_suffix(.code, .signal, .detail))]
    AbnormalExit {
        code: Option<i32>,
        signal: Option<i32>,
        detail: Option<String>,
    },

    #[error("channel was interrupted")]
    Interrupted,

    #[error("turn did not finish within {0:?}")]
    TurnTimeout(Duration),

    #[error("request {0} is already pending on this channel")]
    DuplicateRequest(CorrelationId),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

impl BridgeError {
    /// Launch-class failures: the worker never started.
    pub fn is_launch_failure(&self) -> bool {
        matches!(
            self,
            Self::ExecutableNotFound(_)
                | Self::WorkingDirMissing(_)
                | Self::Launch { .. }
                | Self::InvalidCommand(_)
        )
    }
}

fn exit_suffix(code: &Option<i32>, signal: &Option<i32>, detail: &Option<String>) -> String {
    let mut out = String::new();
    match (code, signal) {
        (Some(code), _) => out.push_str(&format!(" (code {code})")),
        (None, Some(signal)) => out.push_str(&format!(" (signal {signal})")),
        (None, None) => {}
    }
    if let Some(detail) = detail {
        out.push_str(": ");
        out.push_str(detail);
    }
    out
}
