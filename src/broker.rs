//! Decision request broker.
//!
//! Every `permission_request`, `ask_user_question` and `plan_approval` frame
//! goes through the same path: mode policy, remembered choices, then the
//! consumer chosen by the [`TenantRouter`]. Whatever resolves the request, a
//! response tagged with the original correlation id is written back to the
//! worker. No path leaves a pending request unanswered.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use serde_json::Value;
use tokio::sync::oneshot;

use crate::error::BridgeError;
use crate::permission::mode::ModeVerdict;
use crate::permission::{ModePolicy, PermissionMemory, PermissionMode};
use crate::process::LineWriter;
use crate::protocol::{encode_line, CorrelationId, Reply, ResponseFrame, WorkerEvent};
use crate::routing::TenantRouter;

pub type DecisionFuture = futures_lite::future::Boxed<anyhow::Result<DecisionResponse>>;

const NO_CONSUMER_REASON: &str = "No consumer is available to review this request";
const DIALOG_FAILED_REASON: &str = "The review dialog failed";
const TIMED_OUT_REASON: &str = "No decision was made in time";
const CANCELLED_REASON: &str = "Request cancelled";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RequestKind {
    Permission,
    AskUserQuestion,
    PlanApproval,
}

#[derive(Debug, Clone, PartialEq)]
pub enum RequestPayload {
    Permission { tool_name: String, tool_input: Value },
    AskUserQuestion { questions: Vec<Value> },
    PlanApproval { plan: String, tool_input: Value },
}

/// A decision the worker is blocked on.
#[derive(Debug, Clone, PartialEq)]
pub struct DecisionRequest {
    pub channel_id: String,
    pub id: CorrelationId,
    pub payload: RequestPayload,
}

impl DecisionRequest {
    pub fn from_event(channel_id: &str, event: &WorkerEvent) -> Option<Self> {
        let (id, payload) = match event {
            WorkerEvent::PermissionRequest {
                id,
                tool_name,
                tool_input,
            } => (
                id.clone(),
                RequestPayload::Permission {
                    tool_name: tool_name.clone(),
                    tool_input: tool_input.clone(),
                },
            ),
            WorkerEvent::AskUserQuestion { id, questions } => (
                id.clone(),
                RequestPayload::AskUserQuestion {
                    questions: questions.clone(),
                },
            ),
            WorkerEvent::PlanApproval {
                id,
                plan,
                tool_input,
            } => (
                id.clone(),
                RequestPayload::PlanApproval {
                    plan: plan.clone(),
                    tool_input: tool_input.clone(),
                },
            ),
            _ => return None,
        };
        Some(Self {
            channel_id: channel_id.to_string(),
            id,
            payload,
        })
    }

    pub fn kind(&self) -> RequestKind {
        match self.payload {
            RequestPayload::Permission { .. } => RequestKind::Permission,
            RequestPayload::AskUserQuestion { .. } => RequestKind::AskUserQuestion,
            RequestPayload::PlanApproval { .. } => RequestKind::PlanApproval,
        }
    }

    /// Parameters used for tenant routing.
    pub fn inputs(&self) -> &Value {
        match &self.payload {
            RequestPayload::Permission { tool_input, .. }
            | RequestPayload::PlanApproval { tool_input, .. } => tool_input,
            RequestPayload::AskUserQuestion { .. } => &Value::Null,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum Remember {
    #[default]
    No,
    /// Apply to every future call of this tool.
    Tool,
    /// Apply to future calls of this tool with identical inputs.
    Inputs,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct PermissionDecision {
    pub allow: bool,
    pub remember: Remember,
    pub message: Option<String>,
    pub updated_input: Option<Value>,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct QuestionAnswer {
    /// `None` means the user dismissed the question.
    pub answers: Option<Value>,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct PlanDecision {
    pub approved: bool,
    pub new_mode: Option<PermissionMode>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum DecisionResponse {
    Permission(PermissionDecision),
    AskUserQuestion(QuestionAnswer),
    PlanApproval(PlanDecision),
}

impl DecisionResponse {
    pub fn allow() -> Self {
        Self::Permission(PermissionDecision {
            allow: true,
            ..Default::default()
        })
    }

    pub fn allow_remembered(remember: Remember) -> Self {
        Self::Permission(PermissionDecision {
            allow: true,
            remember,
            ..Default::default()
        })
    }

    pub fn deny(message: impl Into<String>) -> Self {
        Self::Permission(PermissionDecision {
            allow: false,
            message: Some(message.into()),
            ..Default::default()
        })
    }

    pub fn answers(answers: Value) -> Self {
        Self::AskUserQuestion(QuestionAnswer {
            answers: Some(answers),
        })
    }

    pub fn approve_plan(new_mode: Option<PermissionMode>) -> Self {
        Self::PlanApproval(PlanDecision {
            approved: true,
            new_mode,
        })
    }

    pub fn reject_plan() -> Self {
        Self::PlanApproval(PlanDecision::default())
    }

    pub fn kind(&self) -> RequestKind {
        match self {
            Self::Permission(_) => RequestKind::Permission,
            Self::AskUserQuestion(_) => RequestKind::AskUserQuestion,
            Self::PlanApproval(_) => RequestKind::PlanApproval,
        }
    }

    /// Deny for permission and plan approval, no answer for questions.
    pub fn safe_default(kind: RequestKind, reason: &str) -> Self {
        match kind {
            RequestKind::Permission => Self::deny(reason),
            RequestKind::AskUserQuestion => Self::AskUserQuestion(QuestionAnswer::default()),
            RequestKind::PlanApproval => Self::reject_plan(),
        }
    }

    fn into_reply(self) -> Reply {
        match self {
            Self::Permission(decision) => Reply::Permission {
                allow: decision.allow,
                message: decision.message,
                updated_input: decision.updated_input,
            },
            Self::AskUserQuestion(answer) => Reply::Question {
                allow: answer.answers.is_some(),
                answers: answer.answers,
            },
            Self::PlanApproval(decision) => Reply::Plan {
                approved: decision.approved,
                new_mode: decision.new_mode,
            },
        }
    }
}

/// A consumer able to put a decision in front of a human.
pub trait DecisionShower: Send + Sync {
    fn supports(&self, _kind: RequestKind) -> bool {
        true
    }

    fn show(&self, request: DecisionRequest) -> DecisionFuture;
}

struct FnShower<F>(F);

impl<F> DecisionShower for FnShower<F>
where
    F: Fn(DecisionRequest) -> DecisionFuture + Send + Sync,
{
    fn show(&self, request: DecisionRequest) -> DecisionFuture {
        (self.0)(request)
    }
}

/// Wrap a closure as a consumer that handles every request kind.
pub fn shower_fn<F>(f: F) -> Arc<dyn DecisionShower>
where
    F: Fn(DecisionRequest) -> DecisionFuture + Send + Sync + 'static,
{
    Arc::new(FnShower(f))
}

/// Which stage produced the decision.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DecisionSource {
    Mode,
    Memory,
    Consumer,
    /// Answered through [`RequestBroker::respond`] while the dialog was open.
    External,
    NoConsumer,
    DialogFailed,
    TimedOut,
    Cancelled,
    Duplicate,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Resolution {
    pub id: CorrelationId,
    pub kind: RequestKind,
    pub reply: Reply,
    pub source: DecisionSource,
    /// Mode requested by an approved plan.
    pub new_mode: Option<PermissionMode>,
}

/// Channel state a request is evaluated against.
#[derive(Debug, Clone, Copy)]
pub struct RequestScope<'a> {
    pub channel_id: &'a str,
    pub cwd: &'a str,
    pub mode: PermissionMode,
    /// Overrides the broker's own decision timeout when set.
    pub decision_timeout: Option<Duration>,
    /// Cancellation epoch observed by the caller, see
    /// [`RequestBroker::channel_epoch`]. A request whose epoch is stale is
    /// resolved as cancelled instead of opening a dialog.
    pub epoch: Option<u64>,
}

impl<'a> RequestScope<'a> {
    pub fn new(channel_id: &'a str, cwd: &'a str, mode: PermissionMode) -> Self {
        Self {
            channel_id,
            cwd,
            mode,
            decision_timeout: None,
            epoch: None,
        }
    }
}

enum Completion {
    Answered(DecisionResponse),
    Cancelled,
}

struct PendingRequest {
    kind: RequestKind,
    tx: oneshot::Sender<Completion>,
}

/// Waiting side of a tracked request.
pub struct PendingHandle {
    pub channel_id: String,
    pub id: CorrelationId,
    pub kind: RequestKind,
    rx: oneshot::Receiver<Completion>,
}

impl PendingHandle {
    /// Resolves to `None` when the request was cancelled.
    pub async fn wait(self) -> Option<DecisionResponse> {
        match self.rx.await {
            Ok(Completion::Answered(response)) => Some(response),
            Ok(Completion::Cancelled) | Err(_) => None,
        }
    }
}

#[derive(Default)]
struct PendingTable {
    requests: HashMap<String, HashMap<CorrelationId, PendingRequest>>,
    /// Bumped by every `cancel_channel`.
    epochs: HashMap<String, u64>,
    /// Bumped by every `cancel_all`.
    generation: u64,
}

impl PendingTable {
    fn epoch(&self, channel_id: &str) -> u64 {
        self.generation + self.epochs.get(channel_id).copied().unwrap_or(0)
    }
}

/// Removes a tracked request if the resolving future is dropped before the
/// request completes.
struct PendingGuard<'a> {
    broker: &'a RequestBroker,
    channel_id: String,
    id: CorrelationId,
    armed: bool,
}

impl PendingGuard<'_> {
    fn disarm(&mut self) {
        self.armed = false;
    }
}

impl Drop for PendingGuard<'_> {
    fn drop(&mut self) {
        if self.armed && self.broker.take(&self.channel_id, &self.id).is_some() {
            tracing::debug!(
                target = "session_bridge::broker",
                channel = %self.channel_id,
                id = %self.id,
                "abandoned request removed"
            );
        }
    }
}

enum TrackError {
    Duplicate,
    Cancelled,
}

enum DialogOutcome {
    Answered(DecisionResponse),
    Failed(anyhow::Error),
    TimedOut,
}

pub struct RequestBroker {
    memory: Arc<PermissionMemory>,
    router: Arc<TenantRouter>,
    policy: ModePolicy,
    decision_timeout: Option<Duration>,
    pending: Mutex<PendingTable>,
}

impl RequestBroker {
    pub fn new(memory: Arc<PermissionMemory>, router: Arc<TenantRouter>) -> Self {
        Self {
            memory,
            router,
            policy: ModePolicy,
            decision_timeout: None,
            pending: Mutex::new(PendingTable::default()),
        }
    }

    /// Bound the wait on a consumer's dialog. Unset by default: the UI owns
    /// cancellation.
    pub fn with_decision_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.decision_timeout = timeout;
        self
    }

    pub fn memory(&self) -> &Arc<PermissionMemory> {
        &self.memory
    }

    pub fn router(&self) -> &Arc<TenantRouter> {
        &self.router
    }

    /// Resolve `request` and write the correlated response to `writer`.
    pub async fn handle(
        &self,
        scope: RequestScope<'_>,
        writer: &LineWriter,
        request: DecisionRequest,
    ) -> Result<Resolution, BridgeError> {
        let resolution = self.resolve(scope, request).await;
        let frame = ResponseFrame::new(resolution.id.clone(), resolution.reply.clone());
        writer.write_line(&encode_line(&frame)?).await?;
        tracing::debug!(
            target = "session_bridge::broker",
            channel = %scope.channel_id,
            id = %resolution.id,
            kind = ?resolution.kind,
            source = ?resolution.source,
            affirmative = resolution.reply.is_affirmative(),
            "response written"
        );
        Ok(resolution)
    }

    /// Decide a request without writing anything.
    pub async fn resolve(&self, scope: RequestScope<'_>, request: DecisionRequest) -> Resolution {
        let kind = request.kind();
        let id = request.id.clone();

        if let RequestPayload::Permission {
            tool_name,
            tool_input,
        } = &request.payload
        {
            match self.policy.evaluate(scope.mode, tool_name) {
                ModeVerdict::Allow => {
                    return resolution(id, DecisionResponse::allow(), DecisionSource::Mode)
                }
                ModeVerdict::Deny { reason } => {
                    return resolution(id, DecisionResponse::deny(reason), DecisionSource::Mode)
                }
                ModeVerdict::Escalate => {}
            }
            if let Some(allow) = self.memory.lookup(tool_name, tool_input) {
                let response = if allow {
                    DecisionResponse::allow()
                } else {
                    DecisionResponse::deny("Denied by a remembered choice")
                };
                return resolution(id, response, DecisionSource::Memory);
            }
        }

        let handle = match self.track_at(&request, scope.epoch) {
            Ok(handle) => handle,
            Err(TrackError::Duplicate) => {
                tracing::warn!(target = "session_bridge::broker", channel = %scope.channel_id, id = %id, "rejecting duplicate request");
                return resolution(
                    id,
                    DecisionResponse::safe_default(kind, CANCELLED_REASON),
                    DecisionSource::Duplicate,
                );
            }
            Err(TrackError::Cancelled) => {
                tracing::debug!(target = "session_bridge::broker", channel = %scope.channel_id, id = %id, "channel cancelled before the request was tracked");
                return resolution(
                    id,
                    DecisionResponse::safe_default(kind, CANCELLED_REASON),
                    DecisionSource::Cancelled,
                );
            }
        };
        let mut guard = PendingGuard {
            broker: self,
            channel_id: handle.channel_id.clone(),
            id: handle.id.clone(),
            armed: true,
        };

        let Some(registration) = self.router.select(kind, request.inputs(), Some(scope.cwd))
        else {
            self.discard(&handle);
            guard.disarm();
            tracing::info!(target = "session_bridge::broker", channel = %scope.channel_id, id = %id, kind = ?kind, "no consumer registered, applying safe default");
            return resolution(
                id,
                DecisionResponse::safe_default(kind, NO_CONSUMER_REASON),
                DecisionSource::NoConsumer,
            );
        };

        let limit = scope.decision_timeout.or(self.decision_timeout);
        let dialog = registration.shower().show(request.clone());
        let (response, source) = self.await_decision(handle, dialog, limit, &mut guard).await;

        if let (
            DecisionSource::Consumer | DecisionSource::External,
            DecisionResponse::Permission(decision),
        ) = (source, &response)
        {
            if let RequestPayload::Permission {
                tool_name,
                tool_input,
            } = &request.payload
            {
                match decision.remember {
                    Remember::No => {}
                    Remember::Tool => self.memory.remember_always(tool_name, decision.allow),
                    Remember::Inputs => {
                        self.memory
                            .remember_inputs(tool_name, tool_input, decision.allow)
                    }
                }
            }
        }

        resolution(id, response, source)
    }

    async fn await_decision(
        &self,
        handle: PendingHandle,
        dialog: DecisionFuture,
        limit: Option<Duration>,
        guard: &mut PendingGuard<'_>,
    ) -> (DecisionResponse, DecisionSource) {
        let PendingHandle {
            channel_id,
            id,
            kind,
            mut rx,
        } = handle;

        let outcome = tokio::select! {
            completion = &mut rx => {
                guard.disarm();
                return match completion {
                    Ok(Completion::Answered(response)) => {
                        (checked(kind, response), DecisionSource::External)
                    }
                    Ok(Completion::Cancelled) | Err(_) => (
                        DecisionResponse::safe_default(kind, CANCELLED_REASON),
                        DecisionSource::Cancelled,
                    ),
                };
            }
            outcome = run_dialog(dialog, limit) => outcome,
        };

        let (response, source) = match outcome {
            DialogOutcome::Answered(response) => {
                (checked(kind, response), DecisionSource::Consumer)
            }
            DialogOutcome::Failed(error) => {
                tracing::warn!(target = "session_bridge::broker", channel = %channel_id, id = %id, error = %error, "decision dialog failed");
                (
                    DecisionResponse::safe_default(kind, DIALOG_FAILED_REASON),
                    DecisionSource::DialogFailed,
                )
            }
            DialogOutcome::TimedOut => {
                tracing::warn!(target = "session_bridge::broker", channel = %channel_id, id = %id, "decision dialog timed out");
                (
                    DecisionResponse::safe_default(kind, TIMED_OUT_REASON),
                    DecisionSource::TimedOut,
                )
            }
        };

        // The channel may have been cancelled while the dialog was open; the
        // pending entry is authoritative.
        self.respond(&channel_id, &id, response);
        guard.disarm();
        match rx.await {
            Ok(Completion::Answered(response)) => (response, source),
            Ok(Completion::Cancelled) | Err(_) => (
                DecisionResponse::safe_default(kind, CANCELLED_REASON),
                DecisionSource::Cancelled,
            ),
        }
    }

    /// Record `request` as outstanding and return its waiting side.
    pub fn track(&self, request: &DecisionRequest) -> Result<PendingHandle, BridgeError> {
        self.track_at(request, None).map_err(|error| match error {
            TrackError::Duplicate => BridgeError::DuplicateRequest(request.id.clone()),
            TrackError::Cancelled => BridgeError::Interrupted,
        })
    }

    fn track_at(
        &self,
        request: &DecisionRequest,
        epoch: Option<u64>,
    ) -> Result<PendingHandle, TrackError> {
        let (tx, rx) = oneshot::channel();
        let kind = request.kind();
        let mut pending = self.pending.lock();
        if epoch.is_some_and(|epoch| epoch != pending.epoch(&request.channel_id)) {
            return Err(TrackError::Cancelled);
        }
        let channel = pending
            .requests
            .entry(request.channel_id.clone())
            .or_default();
        if channel.contains_key(&request.id) {
            return Err(TrackError::Duplicate);
        }
        channel.insert(request.id.clone(), PendingRequest { kind, tx });
        Ok(PendingHandle {
            channel_id: request.channel_id.clone(),
            id: request.id.clone(),
            kind,
            rx,
        })
    }

    /// Current cancellation epoch of `channel_id`. Every `cancel_channel` or
    /// `cancel_all` moves it forward.
    pub fn channel_epoch(&self, channel_id: &str) -> u64 {
        self.pending.lock().epoch(channel_id)
    }

    /// Complete the pending request `id` on `channel_id`. Returns false when
    /// no such request is outstanding.
    pub fn respond(
        &self,
        channel_id: &str,
        id: &CorrelationId,
        response: DecisionResponse,
    ) -> bool {
        let Some(entry) = self.take(channel_id, id) else {
            return false;
        };
        if entry.kind != response.kind() {
            tracing::warn!(target = "session_bridge::broker", channel = %channel_id, id = %id, expected = ?entry.kind, got = ?response.kind(), "response kind mismatch");
        }
        entry.tx.send(Completion::Answered(response)).is_ok()
    }

    /// Resolve every outstanding request on `channel_id` as cancelled.
    pub fn cancel_channel(&self, channel_id: &str) -> usize {
        let drained = {
            let mut pending = self.pending.lock();
            *pending.epochs.entry(channel_id.to_string()).or_default() += 1;
            pending.requests.remove(channel_id).unwrap_or_default()
        };
        let count = drained.len();
        for (_, entry) in drained {
            let _ = entry.tx.send(Completion::Cancelled);
        }
        if count > 0 {
            tracing::info!(target = "session_bridge::broker", channel = %channel_id, count, "cancelled pending requests");
        }
        count
    }

    pub fn cancel_all(&self) -> usize {
        let drained: Vec<_> = {
            let mut pending = self.pending.lock();
            pending.generation += 1;
            pending.requests.drain().collect()
        };
        let mut count = 0;
        for (_, requests) in drained {
            for (_, entry) in requests {
                count += 1;
                let _ = entry.tx.send(Completion::Cancelled);
            }
        }
        count
    }

    pub fn pending_count(&self, channel_id: &str) -> usize {
        self.pending
            .lock()
            .requests
            .get(channel_id)
            .map_or(0, HashMap::len)
    }

    pub fn pending_ids(&self, channel_id: &str) -> Vec<CorrelationId> {
        self.pending
            .lock()
            .requests
            .get(channel_id)
            .map(|requests| requests.keys().cloned().collect())
            .unwrap_or_default()
    }

    fn take(&self, channel_id: &str, id: &CorrelationId) -> Option<PendingRequest> {
        let mut pending = self.pending.lock();
        let requests = pending.requests.get_mut(channel_id)?;
        let entry = requests.remove(id);
        if requests.is_empty() {
            pending.requests.remove(channel_id);
        }
        entry
    }

    fn discard(&self, handle: &PendingHandle) {
        let _ = self.take(&handle.channel_id, &handle.id);
    }
}

async fn run_dialog(dialog: DecisionFuture, limit: Option<Duration>) -> DialogOutcome {
    let result = match limit {
        Some(limit) => match tokio::time::timeout(limit, dialog).await {
            Ok(result) => result,
            Err(_) => return DialogOutcome::TimedOut,
        },
        None => dialog.await,
    };
    match result {
        Ok(response) => DialogOutcome::Answered(response),
        Err(error) => DialogOutcome::Failed(error),
    }
}

/// Replace a response of the wrong kind with the safe default.
fn checked(kind: RequestKind, response: DecisionResponse) -> DecisionResponse {
    if response.kind() == kind {
        response
    } else {
        DecisionResponse::safe_default(kind, DIALOG_FAILED_REASON)
    }
}

fn resolution(id: CorrelationId, response: DecisionResponse, source: DecisionSource) -> Resolution {
    let kind = response.kind();
    let new_mode = match &response {
        DecisionResponse::PlanApproval(PlanDecision {
            approved: true,
            new_mode,
        }) => *new_mode,
        _ => None,
    };
    Resolution {
        id,
        kind,
        reply: response.into_reply(),
        source,
        new_mode,
    }
}
