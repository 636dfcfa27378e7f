//! Channel registry and the per-turn read pump.
//!
//! A [`BridgeSession`] maps channel ids to their conversation state and live
//! worker process. Each `send` takes the channel's turn lock, writes one
//! initial command, then pumps the worker's output until `done`, an error,
//! or exit. Decision requests block that pump only; other channels keep
//! running on their own tasks.

use std::collections::HashMap;
use std::path::PathBuf;
use std::process::ExitStatus;
use std::sync::Arc;

use serde_json::Value;
use tokio::sync::{mpsc, Mutex as AsyncMutex};

use crate::broker::{
    DecisionRequest, DecisionResponse, RequestBroker, RequestScope, Resolution,
};
use crate::config::BridgeConfig;
use crate::error::BridgeError;
use crate::notify::{NotificationSink, TracingNotifier};
use crate::permission::PermissionMode;
use crate::process::ChannelProcess;
use crate::protocol::{
    encode_line, Attachment, CorrelationId, InboundLine, InitialCommand, WorkerEvent,
};
use crate::resolver::{resolve_worker_command, ExecutableResolver, PathResolver};
use crate::stream::{AssistantMessage, StreamAssembler};

/// Conversation state kept between turns.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Channel {
    pub id: String,
    pub session_id: Option<String>,
    pub cwd: PathBuf,
    pub mode: PermissionMode,
    pub model: Option<String>,
}

#[derive(Debug, Clone, Default)]
pub struct SendRequest {
    pub message: String,
    pub cwd: PathBuf,
    /// Resume an earlier worker session.
    pub session_id: Option<String>,
    pub permission_mode: Option<PermissionMode>,
    pub model: Option<String>,
    pub opened_files: Option<Vec<String>>,
    pub agent_prompt: Option<String>,
    pub streaming: Option<bool>,
    pub attachments: Vec<Attachment>,
}

impl SendRequest {
    pub fn new(message: impl Into<String>, cwd: impl Into<PathBuf>) -> Self {
        Self {
            message: message.into(),
            cwd: cwd.into(),
            ..Self::default()
        }
    }
}

/// Progress reported while a turn streams.
#[derive(Debug, Clone, PartialEq)]
pub enum TurnUpdate {
    SessionId(String),
    /// Current state of the assistant message.
    Message(AssistantMessage),
    ToolResult(Value),
    Event(Value),
    Decision(Resolution),
}

#[derive(Debug, Clone, PartialEq)]
pub struct TurnOutcome {
    pub channel_id: String,
    pub session_id: Option<String>,
    pub message: AssistantMessage,
    pub resolutions: Vec<Resolution>,
}

struct ChannelEntry {
    channel: Channel,
    process: Option<Arc<ChannelProcess>>,
    turn: Arc<AsyncMutex<()>>,
}

pub struct BridgeSession {
    config: BridgeConfig,
    broker: Arc<RequestBroker>,
    channels: parking_lot::Mutex<HashMap<String, ChannelEntry>>,
    resolver: Arc<dyn ExecutableResolver>,
    notifier: Arc<dyn NotificationSink>,
}

impl BridgeSession {
    pub fn new(config: BridgeConfig, broker: Arc<RequestBroker>) -> Self {
        Self {
            config,
            broker,
            channels: parking_lot::Mutex::new(HashMap::new()),
            resolver: Arc::new(PathResolver::from_env()),
            notifier: Arc::new(TracingNotifier),
        }
    }

    pub fn with_resolver(mut self, resolver: Arc<dyn ExecutableResolver>) -> Self {
        self.resolver = resolver;
        self
    }

    pub fn with_notifier(mut self, notifier: Arc<dyn NotificationSink>) -> Self {
        self.notifier = notifier;
        self
    }

    pub fn broker(&self) -> &Arc<RequestBroker> {
        &self.broker
    }

    pub fn config(&self) -> &BridgeConfig {
        &self.config
    }

    pub fn channel(&self, channel_id: &str) -> Option<Channel> {
        self.channels
            .lock()
            .get(channel_id)
            .map(|entry| entry.channel.clone())
    }

    pub fn channel_ids(&self) -> Vec<String> {
        self.channels.lock().keys().cloned().collect()
    }

    /// True while the channel has a registered worker that has not exited.
    pub fn is_running(&self, channel_id: &str) -> bool {
        self.channels
            .lock()
            .get(channel_id)
            .and_then(|entry| entry.process.clone())
            .is_some_and(|process| !process.has_exited())
    }

    pub fn set_permission_mode(&self, channel_id: &str, mode: PermissionMode) -> bool {
        self.update_channel(channel_id, |channel| channel.mode = mode)
    }

    pub fn set_model(&self, channel_id: &str, model: Option<String>) -> bool {
        self.update_channel(channel_id, |channel| channel.model = model)
    }

    /// Answer a pending request from outside its dialog.
    pub fn respond(
        &self,
        channel_id: &str,
        id: &CorrelationId,
        response: DecisionResponse,
    ) -> bool {
        self.broker.respond(channel_id, id, response)
    }

    /// Run one turn on `channel_id`, creating the channel and its worker as
    /// needed. Turns on the same channel run one at a time.
    pub async fn send(
        &self,
        channel_id: &str,
        request: SendRequest,
        updates: Option<mpsc::UnboundedSender<TurnUpdate>>,
    ) -> Result<TurnOutcome, BridgeError> {
        let turn = self.prepare_channel(channel_id, &request);
        let _turn = turn.lock().await;

        let work = self.run_turn(channel_id, request, updates.as_ref());
        let result = match self.config.turn_timeout {
            Some(limit) => match tokio::time::timeout(limit, work).await {
                Ok(result) => result,
                Err(_) => {
                    tracing::warn!(target = "session_bridge::session", channel = %channel_id, limit = ?limit, "turn timed out");
                    self.stop_process(channel_id).await;
                    Err(BridgeError::TurnTimeout(limit))
                }
            },
            None => work.await,
        };

        if let Err(error) = &result {
            if !matches!(error, BridgeError::Interrupted) {
                self.notifier.notify_error(channel_id, &error.to_string());
            }
        }
        result
    }

    /// Stop the channel's worker, deny everything it is waiting on, release
    /// its scratch directory and forget the channel. Safe while a turn is
    /// pumping; that turn ends with [`BridgeError::Interrupted`].
    pub async fn interrupt(&self, channel_id: &str) -> bool {
        let entry = self.channels.lock().remove(channel_id);
        let cancelled = self.broker.cancel_channel(channel_id);
        let Some(entry) = entry else {
            return cancelled > 0;
        };
        if let Some(process) = entry.process {
            process.interrupt(self.config.terminate_grace).await;
            process.cleanup();
        }
        tracing::info!(target = "session_bridge::session", channel = %channel_id, cancelled, "channel interrupted");
        true
    }

    /// Replace the channel's worker on the next turn while keeping its
    /// conversation state, including the session id used to resume.
    pub async fn restart(&self, channel_id: &str) -> bool {
        if !self.channels.lock().contains_key(channel_id) {
            return false;
        }
        self.stop_process(channel_id).await;
        true
    }

    /// Terminate every channel. Returns how many channels were shut down.
    pub async fn shutdown_all(&self) -> usize {
        let entries: Vec<(String, ChannelEntry)> = self.channels.lock().drain().collect();
        let cancelled = self.broker.cancel_all();
        let count = entries.len();
        for (channel_id, entry) in entries {
            if let Some(process) = entry.process {
                process.shutdown(self.config.terminate_grace).await;
                tracing::debug!(target = "session_bridge::session", channel = %channel_id, "worker shut down");
            }
        }
        tracing::info!(target = "session_bridge::session", channels = count, cancelled, "all channels shut down");
        count
    }

    fn prepare_channel(&self, channel_id: &str, request: &SendRequest) -> Arc<AsyncMutex<()>> {
        let mut channels = self.channels.lock();
        let entry = channels
            .entry(channel_id.to_string())
            .or_insert_with(|| ChannelEntry {
                channel: Channel {
                    id: channel_id.to_string(),
                    session_id: None,
                    cwd: request.cwd.clone(),
                    mode: PermissionMode::Default,
                    model: None,
                },
                process: None,
                turn: Arc::new(AsyncMutex::new(())),
            });
        let channel = &mut entry.channel;
        channel.cwd = request.cwd.clone();
        if let Some(session_id) = &request.session_id {
            channel.session_id = Some(session_id.clone());
        }
        if let Some(mode) = request.permission_mode {
            channel.mode = mode;
        }
        if let Some(model) = &request.model {
            channel.model = Some(model.clone());
        }
        Arc::clone(&entry.turn)
    }

    async fn run_turn(
        &self,
        channel_id: &str,
        request: SendRequest,
        updates: Option<&mpsc::UnboundedSender<TurnUpdate>>,
    ) -> Result<TurnOutcome, BridgeError> {
        let process = self.ensure_process(channel_id).await?;
        let channel = self.channel(channel_id).ok_or(BridgeError::Interrupted)?;

        let command = InitialCommand {
            message: request.message,
            session_id: channel.session_id.clone(),
            cwd: channel.cwd.display().to_string(),
            permission_mode: channel.mode,
            model: channel.model.clone(),
            opened_files: request.opened_files,
            agent_prompt: request.agent_prompt,
            streaming: request.streaming,
            attachments: request.attachments,
        };
        if let Err(error) = process.write_line(&encode_line(&command)?).await {
            if !self.owns(channel_id, &process) || process.is_stopping() {
                return Err(BridgeError::Interrupted);
            }
            self.fail_process(channel_id, &process).await;
            return Err(error);
        }
        tracing::debug!(target = "session_bridge::session", channel = %channel_id, mode = %channel.mode, "initial command written");

        self.pump(channel_id, &process, updates).await
    }

    async fn ensure_process(&self, channel_id: &str) -> Result<Arc<ChannelProcess>, BridgeError> {
        let (existing, cwd) = {
            let channels = self.channels.lock();
            let entry = channels.get(channel_id).ok_or(BridgeError::Interrupted)?;
            (entry.process.clone(), entry.channel.cwd.clone())
        };

        if let Some(process) = existing {
            if !process.has_exited() && !process.is_stopping() {
                return Ok(process);
            }
            tracing::debug!(target = "session_bridge::session", channel = %channel_id, "reaping exited worker");
            self.release_process(channel_id, &process).await;
        }

        let command =
            resolve_worker_command(&*self.resolver, &self.config.worker, self.config.env.clone())?;
        let process = Arc::new(
            ChannelProcess::start(channel_id, &command, &cwd, self.config.diagnostic_capacity)
                .await
                .inspect_err(|error| {
                    tracing::warn!(target = "session_bridge::session", channel = %channel_id, error = %error, "worker launch failed");
                })?,
        );

        let registered = {
            let mut channels = self.channels.lock();
            match channels.get_mut(channel_id) {
                Some(entry) => {
                    entry.process = Some(Arc::clone(&process));
                    true
                }
                None => false,
            }
        };
        if !registered {
            process.shutdown(self.config.terminate_grace).await;
            return Err(BridgeError::Interrupted);
        }
        Ok(process)
    }

    async fn pump(
        &self,
        channel_id: &str,
        process: &Arc<ChannelProcess>,
        updates: Option<&mpsc::UnboundedSender<TurnUpdate>>,
    ) -> Result<TurnOutcome, BridgeError> {
        let mut assembler = StreamAssembler::new();
        let mut resolutions = Vec::new();
        let mut worker_error: Option<String> = None;
        let mut finished = false;
        // Requests raised after an interrupt or restart must not open a dialog.
        let epoch = self.broker.channel_epoch(channel_id);

        let mut lines = process.read_lines().await;
        loop {
            let event = match lines.next().await {
                Ok(Some(InboundLine::Event(event))) => event,
                Ok(Some(InboundLine::Diagnostic(_))) => continue,
                Ok(None) => break,
                Err(error) => {
                    drop(lines);
                    tracing::error!(target = "session_bridge::session", channel = %channel_id, error = %error, "worker output failed");
                    self.fail_process(channel_id, process).await;
                    return Err(error);
                }
            };

            match event {
                WorkerEvent::SessionId { session_id } => {
                    self.update_channel(channel_id, |channel| {
                        channel.session_id = Some(session_id.clone())
                    });
                    emit(updates, TurnUpdate::SessionId(session_id));
                }
                WorkerEvent::ContentDelta { delta } => {
                    assembler.on_text_delta(&delta);
                    emit(updates, TurnUpdate::Message(assembler.snapshot()));
                }
                WorkerEvent::Content { text } => {
                    assembler.on_content_snapshot(&text);
                    emit(updates, TurnUpdate::Message(assembler.snapshot()));
                }
                WorkerEvent::ThinkingDelta { delta } => {
                    assembler.on_thinking_delta(&delta);
                    emit(updates, TurnUpdate::Message(assembler.snapshot()));
                }
                WorkerEvent::Thinking { text } => {
                    assembler.on_thinking_snapshot(&text);
                    emit(updates, TurnUpdate::Message(assembler.snapshot()));
                }
                WorkerEvent::ToolUse { tool } => {
                    assembler.on_tool_use(tool);
                    emit(updates, TurnUpdate::Message(assembler.snapshot()));
                }
                WorkerEvent::ToolResult { result } => emit(updates, TurnUpdate::ToolResult(result)),
                WorkerEvent::Event { event } => emit(updates, TurnUpdate::Event(event)),
                WorkerEvent::Unrecognized(value) => {
                    tracing::debug!(target = "session_bridge::session", channel = %channel_id, frame = %value, "ignoring unknown frame type");
                }
                WorkerEvent::Error { message } => {
                    tracing::warn!(target = "session_bridge::session", channel = %channel_id, message = %message, "worker reported an error");
                    worker_error = Some(message);
                }
                WorkerEvent::Done => {
                    finished = true;
                    break;
                }
                WorkerEvent::PermissionRequest { .. }
                | WorkerEvent::AskUserQuestion { .. }
                | WorkerEvent::PlanApproval { .. } => {
                    let Some(request) = DecisionRequest::from_event(channel_id, &event) else {
                        continue;
                    };
                    let channel = match self.channel(channel_id) {
                        Some(channel) if self.owns(channel_id, process) => channel,
                        // Interrupted or restarted while streaming.
                        _ => break,
                    };
                    let cwd = channel.cwd.display().to_string();
                    let scope = RequestScope {
                        decision_timeout: self.config.decision_timeout,
                        epoch: Some(epoch),
                        ..RequestScope::new(channel_id, &cwd, channel.mode)
                    };
                    let handled = self.broker.handle(scope, process.writer(), request).await;
                    let resolution = match handled {
                        Ok(resolution) => resolution,
                        Err(error) => {
                            if !self.owns(channel_id, process) || process.is_stopping() {
                                break;
                            }
                            drop(lines);
                            self.fail_process(channel_id, process).await;
                            return Err(error);
                        }
                    };
                    if let Some(mode) = resolution.new_mode {
                        tracing::info!(target = "session_bridge::session", channel = %channel_id, mode = %mode, "plan approval changed permission mode");
                        self.update_channel(channel_id, |channel| channel.mode = mode);
                    }
                    emit(updates, TurnUpdate::Decision(resolution.clone()));
                    resolutions.push(resolution);
                }
            }
        }
        drop(lines);

        let message = assembler.on_stream_end();
        let outcome = TurnOutcome {
            channel_id: channel_id.to_string(),
            session_id: self.channel(channel_id).and_then(|channel| channel.session_id),
            message,
            resolutions,
        };

        if finished {
            return match worker_error {
                Some(message) => Err(BridgeError::Worker(message)),
                None => Ok(outcome),
            };
        }

        // Output closed without `done`.
        self.broker.cancel_channel(channel_id);
        if !self.owns(channel_id, process) || process.is_stopping() {
            self.release_process(channel_id, process).await;
            return Err(BridgeError::Interrupted);
        }
        let status = process.wait_exit(self.config.terminate_grace).await;
        let detail = process.last_diagnostic();
        self.release_process(channel_id, process).await;

        if let Some(message) = worker_error {
            return Err(BridgeError::Worker(message));
        }
        match status {
            Some(status) if status.success() => Ok(outcome),
            status => {
                let (code, signal) = exit_parts(status);
                tracing::warn!(target = "session_bridge::session", channel = %channel_id, code = ?code, signal = ?signal, "worker exited abnormally");
                Err(BridgeError::AbnormalExit {
                    code,
                    signal,
                    detail,
                })
            }
        }
    }

    fn update_channel(&self, channel_id: &str, apply: impl FnOnce(&mut Channel)) -> bool {
        match self.channels.lock().get_mut(channel_id) {
            Some(entry) => {
                apply(&mut entry.channel);
                true
            }
            None => false,
        }
    }

    /// Whether `process` is still the registered worker for `channel_id`.
    fn owns(&self, channel_id: &str, process: &Arc<ChannelProcess>) -> bool {
        self.channels
            .lock()
            .get(channel_id)
            .and_then(|entry| entry.process.as_ref())
            .is_some_and(|registered| Arc::ptr_eq(registered, process))
    }

    /// Drop the registration if it still points at `process`, then stop the
    /// process and sweep its scratch directory.
    async fn release_process(&self, channel_id: &str, process: &Arc<ChannelProcess>) {
        {
            let mut channels = self.channels.lock();
            if let Some(entry) = channels.get_mut(channel_id) {
                if entry
                    .process
                    .as_ref()
                    .is_some_and(|registered| Arc::ptr_eq(registered, process))
                {
                    entry.process = None;
                }
            }
        }
        process.shutdown(self.config.terminate_grace).await;
    }

    async fn fail_process(&self, channel_id: &str, process: &Arc<ChannelProcess>) {
        self.broker.cancel_channel(channel_id);
        self.release_process(channel_id, process).await;
    }

    async fn stop_process(&self, channel_id: &str) {
        let process = self
            .channels
            .lock()
            .get_mut(channel_id)
            .and_then(|entry| entry.process.take());
        self.broker.cancel_channel(channel_id);
        if let Some(process) = process {
            process.shutdown(self.config.terminate_grace).await;
        }
    }
}

fn emit(updates: Option<&mpsc::UnboundedSender<TurnUpdate>>, update: TurnUpdate) {
    if let Some(tx) = updates {
        let _ = tx.send(update);
    }
}

fn exit_parts(status: Option<ExitStatus>) -> (Option<i32>, Option<i32>) {
    let Some(status) = status else {
        return (None, None);
    };
    #[cfg(unix)]
    let signal = {
        use std::os::unix::process::ExitStatusExt;
        status.signal()
    };
    #[cfg(not(unix))]
    let signal = None;
    (status.code(), signal)
}
