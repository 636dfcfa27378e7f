use std::path::PathBuf;
use std::time::Duration;

use clap::Parser;

use crate::permission::PermissionMode;

pub const WORKER_ENV: &str = "SESSION_BRIDGE_WORKER";
pub const DEFAULT_TERMINATE_GRACE: Duration = Duration::from_secs(3);
pub const DEFAULT_DIAGNOSTIC_CAPACITY: usize = 200;

/// Library-side settings shared by every channel of a [`BridgeSession`].
///
/// [`BridgeSession`]: crate::session::BridgeSession
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BridgeConfig {
    /// Shell-style worker command line, resolved on every launch.
    pub worker: String,
    pub env: Vec<(String, String)>,
    pub terminate_grace: Duration,
    /// Bounded wait for a consumer decision. `None` leaves cancellation to
    /// the consumer.
    pub decision_timeout: Option<Duration>,
    pub turn_timeout: Option<Duration>,
    pub diagnostic_capacity: usize,
}

impl BridgeConfig {
    pub fn new(worker: impl Into<String>) -> Self {
        Self {
            worker: worker.into(),
            env: Vec::new(),
            terminate_grace: DEFAULT_TERMINATE_GRACE,
            decision_timeout: None,
            turn_timeout: None,
            diagnostic_capacity: DEFAULT_DIAGNOSTIC_CAPACITY,
        }
    }

    pub fn with_env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.push((key.into(), value.into()));
        self
    }

    pub fn with_terminate_grace(mut self, grace: Duration) -> Self {
        self.terminate_grace = grace;
        self
    }

    pub fn with_decision_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.decision_timeout = timeout;
        self
    }

    pub fn with_turn_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.turn_timeout = timeout;
        self
    }
}

#[derive(Debug, Parser, Clone)]
#[command(name = "session-bridge")]
#[command(about = "Runs one agent turn against a line-protocol worker and answers its requests")]
pub struct Config {
    /// Worker command line. Falls back to $SESSION_BRIDGE_WORKER.
    #[arg(long)]
    pub worker: Option<String>,

    #[arg(long)]
    pub cwd: Option<PathBuf>,

    #[arg(long)]
    pub channel: Option<String>,

    #[arg(long, default_value = "default")]
    pub permission_mode: PermissionMode,

    #[arg(long)]
    pub model: Option<String>,

    #[arg(long)]
    pub session_id: Option<String>,

    #[arg(long, default_value_t = 3000)]
    pub grace_ms: u64,

    #[arg(long)]
    pub decision_timeout_secs: Option<u64>,

    #[arg(long)]
    pub turn_timeout_secs: Option<u64>,

    #[arg(long, default_value_t = false)]
    pub no_streaming: bool,

    #[arg(long, default_value = "info")]
    pub log_level: String,

    #[arg(long, default_value_t = false)]
    pub json_output: bool,

    #[arg(required = true)]
    pub message: String,
}

impl Config {
    pub fn worker_command(&self) -> Option<String> {
        self.worker
            .clone()
            .or_else(|| std::env::var(WORKER_ENV).ok())
            .filter(|raw| !raw.trim().is_empty())
    }

    pub fn working_dir(&self) -> std::io::Result<PathBuf> {
        match &self.cwd {
            Some(cwd) => Ok(cwd.clone()),
            None => std::env::current_dir(),
        }
    }

    pub fn channel_id(&self) -> String {
        self.channel
            .clone()
            .unwrap_or_else(|| uuid::Uuid::new_v4().to_string())
    }

    pub fn bridge_config(&self, worker: String) -> BridgeConfig {
        BridgeConfig::new(worker)
            .with_terminate_grace(Duration::from_millis(self.grace_ms))
            .with_decision_timeout(self.decision_timeout_secs.map(Duration::from_secs))
            .with_turn_timeout(self.turn_timeout_secs.map(Duration::from_secs))
    }
}
