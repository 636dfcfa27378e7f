use std::io::{self, Write};

use anyhow::Result;
use chrono::Utc;
use serde::Serialize;
use serde_json::{json, Value};
use tracing_subscriber::{fmt, EnvFilter};

use crate::config::Config;
use crate::session::TurnUpdate;

pub fn init_logging(cfg: &Config) -> Result<()> {
    let filter =
        EnvFilter::try_new(cfg.log_level.clone()).unwrap_or_else(|_| EnvFilter::new("info"));
    let subscriber = fmt::Subscriber::builder()
        .with_env_filter(filter)
        .with_target(true)
        .with_writer(io::stderr)
        .with_ansi(!cfg.json_output)
        .finish();

    tracing::subscriber::set_global_default(subscriber)?;
    Ok(())
}

/// Writes a JSON line per timeline event to stdout when enabled.
#[derive(Clone, Debug)]
pub struct EventEmitter {
    json_output: bool,
}

impl EventEmitter {
    pub fn new(json_output: bool) -> Self {
        Self { json_output }
    }

    pub fn enabled(&self) -> bool {
        self.json_output
    }

    pub fn emit<T: Serialize>(&self, event_type: &str, payload: T) {
        if !self.json_output {
            return;
        }
        let line = event_line(event_type, payload);
        let mut stdout = io::stdout().lock();
        let _ = writeln!(stdout, "{line}");
    }

    pub fn emit_update(&self, update: &TurnUpdate) {
        let (event_type, payload) = update_payload(update);
        self.emit(event_type, payload);
    }
}

fn event_line<T: Serialize>(event_type: &str, payload: T) -> Value {
    json!({
        "ts": Utc::now().to_rfc3339(),
        "type": event_type,
        "payload": payload,
    })
}

fn update_payload(update: &TurnUpdate) -> (&'static str, Value) {
    match update {
        TurnUpdate::SessionId(session_id) => ("session_id", json!({ "sessionId": session_id })),
        TurnUpdate::Message(message) => ("message", json!(message)),
        TurnUpdate::ToolResult(result) => ("tool_result", result.clone()),
        TurnUpdate::Event(event) => ("event", event.clone()),
        TurnUpdate::Decision(resolution) => (
            "decision",
            json!({
                "id": resolution.id,
                "kind": format!("{:?}", resolution.kind),
                "source": format!("{:?}", resolution.source),
                "affirmative": resolution.reply.is_affirmative(),
            }),
        ),
    }
}
