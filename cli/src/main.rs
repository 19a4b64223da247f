//! Relay CLI - replays a scripted agent session through the orchestrator.
//!
//! # Usage
//!
//! ```text
//! relay replay <script.toml> [--yes | --deny]
//! ```
//!
//! The script supplies the backend's responses, the canned tool results, and
//! the user messages to submit (see [`relay_engine::scripted`]). Approval
//! prompts are answered from stdin unless `--yes` or `--deny` is given.
//! Ctrl-C interrupts the turn in flight.
//!
//! ```text
//! main() -> load config -> Orchestrator::new(scripted collaborators)
//!             |                    |
//!             v                    v
//!      submit each message    print UiEvents
//!             |
//!             v
//!   AwaitingReview? -> ask -> approve / deny / approve always / cancel all
//! ```

use anyhow::{Result, bail};
use clap::{Parser, Subcommand};
use std::{
    env,
    fs::{self, OpenOptions},
    path::{Path, PathBuf},
    sync::{Arc, Mutex},
};
use tokio::io::{AsyncBufReadExt, BufReader, Lines, Stdin};
use tokio::sync::mpsc;
use tracing_subscriber::{EnvFilter, fmt, prelude::*};

use relay_engine::scripted::Script;
use relay_engine::{
    BufferDelta, CapabilityTable, Collaborators, NotifyReason, Orchestrator, OrchestratorSettings,
    RelayConfig, RuleScope, TurnOutcome, UiEvent, format_turn_error,
};

const DEFAULT_LOG_FILTER: &str = "info";

/// `RUST_LOG` directives, or the default filter when unset or invalid.
fn log_filter(directives: Option<String>) -> EnvFilter {
    directives
        .and_then(|directives| EnvFilter::try_new(directives).ok())
        .unwrap_or_else(|| EnvFilter::new(DEFAULT_LOG_FILTER))
}

fn init_tracing() {
    let env_filter = log_filter(env::var(EnvFilter::DEFAULT_ENV).ok());

    let (log_file, init_warnings) = open_relay_log_file();

    if let Some((log_path, file)) = log_file {
        tracing_subscriber::registry()
            .with(fmt::layer().with_ansi(false).with_writer(Mutex::new(file)))
            .with(env_filter)
            .init();

        tracing::info!(path = %log_path.display(), "Logging initialized");
        for warning in init_warnings {
            tracing::warn!("{warning}");
        }
        return;
    }

    // Stdout carries the transcript; without a log file, log nothing.
    tracing_subscriber::registry().with(env_filter).init();
}

fn open_relay_log_file() -> (Option<(PathBuf, fs::File)>, Vec<String>) {
    let mut warnings = Vec::new();

    for candidate in relay_log_file_candidates() {
        if let Some(parent) = candidate.parent()
            && let Err(e) = fs::create_dir_all(parent)
        {
            warnings.push(format!(
                "Failed to create log dir {}: {e}",
                parent.display()
            ));
            continue;
        }

        match OpenOptions::new()
            .create(true)
            .append(true)
            .open(&candidate)
        {
            Ok(file) => return (Some((candidate, file)), warnings),
            Err(e) => {
                warnings.push(format!(
                    "Failed to open log file {}: {e}",
                    candidate.display()
                ));
            }
        }
    }

    (None, warnings)
}

fn relay_log_file_candidates() -> Vec<PathBuf> {
    let mut candidates = Vec::new();

    // Primary: ~/.relay/logs/relay.log
    if let Some(config_path) = RelayConfig::path()
        && let Some(config_dir) = config_path.parent()
    {
        candidates.push(config_dir.join("logs").join("relay.log"));
    }

    // Fallback: ./.relay/logs/relay.log
    candidates.push(PathBuf::from(".relay").join("logs").join("relay.log"));

    candidates
}

// ============================================================================
// Arguments
// ============================================================================

#[derive(Parser)]
#[command(name = "relay")]
#[command(about = "Replay a scripted agent session through the turn orchestrator")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Submit a script's messages and answer its approval prompts
    Replay {
        /// TOML replay script
        script: PathBuf,
        /// Approve every prompt without asking
        #[arg(short = 'y', long, conflicts_with = "deny")]
        yes: bool,
        /// Deny every prompt without asking
        #[arg(long)]
        deny: bool,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ReviewMode {
    Ask,
    ApproveAll,
    DenyAll,
}

impl ReviewMode {
    fn from_flags(yes: bool, deny: bool) -> Self {
        match (yes, deny) {
            (true, _) => Self::ApproveAll,
            (_, true) => Self::DenyAll,
            _ => Self::Ask,
        }
    }
}

// ============================================================================
// Rendering
// ============================================================================

/// Transcript line for an event, if it has one.
fn render_event(event: &UiEvent) -> Option<String> {
    match event {
        UiEvent::BufferUpdated(BufferDelta::Text(text)) => Some(text.clone()),
        UiEvent::BufferUpdated(BufferDelta::Reasoning(text)) => Some(format!("(thinking) {text}")),
        UiEvent::ToolResult(result) => {
            let verb = if result.is_denial() { "denied" } else { "ran" };
            Some(format!("[tool {verb}] {}", result.tool_call_id()))
        }
        UiEvent::ApprovalPrompt(snapshot) => snapshot.active.as_ref().map(|request| {
            format!(
                "[approval {}/{}] {} {}",
                snapshot.active_index + 1,
                snapshot.total,
                request.tool_name,
                request.tool_args_json
            )
        }),
        UiEvent::QueueChanged(queue) if !queue.is_empty() => {
            Some(format!("[queued] {}", queue.join(" | ")))
        }
        UiEvent::Retrying {
            category,
            attempt,
            delay,
        } => Some(format!(
            "[retry {attempt}] {} in {}ms",
            category.as_str(),
            delay.as_millis()
        )),
        UiEvent::Error { text, hint } => Some(match hint {
            Some(hint) => format!("[error] {text} {hint}"),
            None => format!("[error] {text}"),
        }),
        UiEvent::Interrupted => Some("[interrupted]".to_string()),
        UiEvent::RestoreInput(text) => Some(format!("[restored input] {text}")),
        UiEvent::TurnComplete { stop_reason, .. } => Some(format!("[turn {stop_reason}]")),
        UiEvent::Notify(NotifyReason::TurnComplete | NotifyReason::ApprovalNeeded) => {
            Some("\x07".to_string())
        }
        UiEvent::StreamingChanged(_) | UiEvent::Thinking(_) | UiEvent::QueueChanged(_) => None,
    }
}

// ============================================================================
// Replay
// ============================================================================

#[derive(Debug, Clone, PartialEq, Eq)]
enum Answer {
    Approve,
    Always,
    Deny(String),
    CancelAll,
}

fn parse_answer(line: &str) -> Option<Answer> {
    let line = line.trim();
    let (head, rest) = line.split_once(' ').unwrap_or((line, ""));
    match head {
        "y" | "yes" => Some(Answer::Approve),
        "a" | "always" => Some(Answer::Always),
        "n" | "no" => Some(Answer::Deny(if rest.trim().is_empty() {
            "denied by user".to_string()
        } else {
            rest.trim().to_string()
        })),
        "c" | "cancel" => Some(Answer::CancelAll),
        _ => None,
    }
}

async fn ask(lines: &mut Lines<BufReader<Stdin>>) -> Result<Answer> {
    loop {
        println!("  [y]es / [a]lways / [n]o <reason> / [c]ancel all");
        let Some(line) = lines.next_line().await? else {
            return Ok(Answer::CancelAll);
        };
        if let Some(answer) = parse_answer(&line) {
            return Ok(answer);
        }
    }
}

/// Print every event emitted so far.
fn flush_events(events: &mut mpsc::UnboundedReceiver<UiEvent>) {
    while let Ok(event) = events.try_recv() {
        if let Some(line) = render_event(&event) {
            println!("{line}");
        }
    }
}

async fn settle_review(
    orchestrator: &Orchestrator,
    mut outcome: TurnOutcome,
    review: ReviewMode,
    events: &mut mpsc::UnboundedReceiver<UiEvent>,
    lines: &mut Lines<BufReader<Stdin>>,
) -> Result<TurnOutcome> {
    flush_events(events);
    while outcome == TurnOutcome::AwaitingReview {
        let snapshot = orchestrator.review_snapshot();
        let index = snapshot.active_index;
        let answer = match review {
            ReviewMode::ApproveAll => Answer::Approve,
            ReviewMode::DenyAll => Answer::Deny("denied by replay".to_string()),
            ReviewMode::Ask => ask(lines).await?,
        };
        outcome = match answer {
            Answer::Approve => orchestrator.approve(index).await?,
            Answer::Always => {
                orchestrator
                    .approve_always(index, RuleScope::Session)
                    .await?
            }
            Answer::Deny(reason) => orchestrator.deny(index, reason).await?,
            Answer::CancelAll => orchestrator.cancel_all().await?,
        };
        flush_events(events);
    }
    Ok(outcome)
}

async fn replay(script: &Path, review: ReviewMode, config: Option<RelayConfig>) -> Result<()> {
    let script = Script::load(script)?;
    let (messages, backend, tools) = script.into_parts();

    let config = config.unwrap_or_default();
    let settings: OrchestratorSettings = config.settings()?;
    let capabilities: CapabilityTable = config.capability_table();
    let oracle = config.rule_set_oracle(capabilities.clone())?;

    let collaborators = Collaborators {
        backend: Arc::new(backend),
        tools: Arc::new(tools),
        oracle: Arc::new(oracle),
        capabilities,
    };
    let (orchestrator, mut events) = Orchestrator::new(collaborators, settings);

    let interrupter = {
        let orchestrator = orchestrator.clone();
        tokio::spawn(async move {
            while tokio::signal::ctrl_c().await.is_ok() {
                orchestrator.interrupt();
            }
        })
    };

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    for message in messages {
        println!("> {message}");
        let outcome = orchestrator.submit(message).await;
        let outcome =
            settle_review(&orchestrator, outcome, review, &mut events, &mut lines).await?;
        tracing::info!(?outcome, "Message settled");
        if let TurnOutcome::Failed(err) = &outcome {
            tracing::warn!(error = %format_turn_error(err), "Replay turn failed");
        }
    }

    interrupter.abort();
    flush_events(&mut events);
    Ok(())
}

fn load_config() -> Option<RelayConfig> {
    match RelayConfig::load() {
        Ok(config) => config,
        Err(err) => {
            tracing::warn!(error = %err, "Ignoring unreadable config");
            None
        }
    }
}

fn script_exists(path: &Path) -> bool {
    path.is_file()
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();

    match Cli::parse().command {
        Commands::Replay { script, yes, deny } => {
            if !script_exists(&script) {
                bail!("script not found: {}", script.display());
            }
            replay(&script, ReviewMode::from_flags(yes, deny), load_config()).await
        }
    }
}
