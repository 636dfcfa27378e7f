use std::io::Write as _;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use serde_json::{json, Map, Value};
use tokio::{
    io::{AsyncBufReadExt, BufReader, Lines, Stdin},
    sync::{mpsc, Mutex},
};

use session_bridge::{
    broker::{Remember, RequestPayload},
    config::Config,
    events::{init_logging, EventEmitter},
    permission::PermissionMode,
    protocol::question_prompts,
    BridgeError, BridgeSession, DecisionFuture, DecisionRequest, DecisionResponse, DecisionShower,
    PermissionMemory, RequestBroker, SendRequest, TenantRouter,
};

/// Answers decision requests by prompting on stderr and reading stdin.
struct TerminalShower {
    input: Arc<Mutex<Lines<BufReader<Stdin>>>>,
}

impl TerminalShower {
    fn new() -> Self {
        Self {
            input: Arc::new(Mutex::new(BufReader::new(tokio::io::stdin()).lines())),
        }
    }
}

async fn ask(input: &Mutex<Lines<BufReader<Stdin>>>, prompt: &str) -> Result<String> {
    {
        let mut stderr = std::io::stderr().lock();
        write!(stderr, "{prompt}")?;
        stderr.flush()?;
    }
    let line = input
        .lock()
        .await
        .next_line()
        .await?
        .context("stdin closed while waiting for an answer")?;
    Ok(line.trim().to_string())
}

impl DecisionShower for TerminalShower {
    fn show(&self, request: DecisionRequest) -> DecisionFuture {
        let input = Arc::clone(&self.input);
        Box::pin(async move {
            match request.payload {
                RequestPayload::Permission {
                    tool_name,
                    tool_input,
                } => {
                    eprintln!("\n{tool_name} wants to run with {tool_input}");
                    let answer =
                        ask(&input, "allow? [y]es / [n]o / [a]lways / [s]ame inputs: ").await?;
                    Ok(match answer.to_ascii_lowercase().as_str() {
                        "y" | "yes" => DecisionResponse::allow(),
                        "a" | "always" => DecisionResponse::allow_remembered(Remember::Tool),
                        "s" | "same" => DecisionResponse::allow_remembered(Remember::Inputs),
                        _ => DecisionResponse::deny("Denied from the terminal"),
                    })
                }
                RequestPayload::AskUserQuestion { questions } => {
                    let mut answers = Map::new();
                    for prompt in question_prompts(&questions) {
                        let answer = ask(&input, &format!("\n{prompt}\n> ")).await?;
                        answers.insert(prompt, Value::String(answer));
                    }
                    Ok(DecisionResponse::answers(Value::Object(answers)))
                }
                RequestPayload::PlanApproval { plan, .. } => {
                    eprintln!("\nProposed plan:\n{plan}");
                    let answer = ask(
                        &input,
                        "approve? [y]es / [e] yes and accept edits / [n]o: ",
                    )
                    .await?;
                    Ok(match answer.to_ascii_lowercase().as_str() {
                        "y" | "yes" => DecisionResponse::approve_plan(None),
                        "e" => DecisionResponse::approve_plan(Some(PermissionMode::AcceptEdits)),
                        _ => DecisionResponse::reject_plan(),
                    })
                }
            }
        })
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cfg = Config::parse();
    init_logging(&cfg)?;

    let worker = cfg
        .worker_command()
        .context("no worker command: pass --worker or set SESSION_BRIDGE_WORKER")?;
    let cwd = cfg
        .working_dir()
        .context("failed to determine the working directory")?;
    let bridge_cfg = cfg.bridge_config(worker);

    let router = Arc::new(TenantRouter::new());
    router.register(&cwd.display().to_string(), Arc::new(TerminalShower::new()));
    let broker = Arc::new(RequestBroker::new(Arc::new(PermissionMemory::new()), router));
    let session = BridgeSession::new(bridge_cfg, broker);

    let emitter = EventEmitter::new(cfg.json_output);
    let channel_id = cfg.channel_id();
    let mut request = SendRequest::new(cfg.message.clone(), cwd);
    request.permission_mode = Some(cfg.permission_mode);
    request.session_id = cfg.session_id.clone();
    request.model = cfg.model.clone();
    request.streaming = Some(!cfg.no_streaming);

    let (tx, mut rx) = mpsc::unbounded_channel();
    let printer = {
        let emitter = emitter.clone();
        tokio::spawn(async move {
            while let Some(update) = rx.recv().await {
                emitter.emit_update(&update);
            }
        })
    };

    tracing::info!(target = "session_bridge::cli", channel = %channel_id, "starting turn");
    let result = tokio::select! {
        result = session.send(&channel_id, request, Some(tx)) => result,
        _ = tokio::signal::ctrl_c() => {
            session.interrupt(&channel_id).await;
            Err(BridgeError::Interrupted)
        }
    };
    session.shutdown_all().await;
    let _ = printer.await;

    let outcome = result.with_context(|| format!("turn on channel {channel_id} failed"))?;
    if emitter.enabled() {
        emitter.emit(
            "result",
            json!({
                "channelId": outcome.channel_id,
                "sessionId": outcome.session_id,
                "message": outcome.message,
                "decisions": outcome.resolutions.len(),
            }),
        );
    } else {
        println!("{}", outcome.message.text());
        if let Some(session_id) = &outcome.session_id {
            eprintln!("session: {session_id}");
        }
    }
    Ok(())
}
