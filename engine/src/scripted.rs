//! Scripted collaborators for replays and tests.
//!
//! A [`ScriptedBackend`] answers each `open_stream` with the next scripted
//! response and records every input it was sent. [`ScriptedTools`] returns
//! canned results per tool name. Both can be loaded from a TOML script:
//!
//! ```toml
//! messages = ["list the repo"]
//!
//! [[responses]]
//! kind = "stream"
//! events = [
//!     { type = "text", text = "Looking..." },
//!     { type = "approval", tool_call_id = "call-1", tool_name = "Bash", args = { command = "ls" } },
//!     { type = "stop", reason = "requires_approval" },
//! ]
//!
//! [[responses]]
//! kind = "stream"
//! events = [{ type = "stop", reason = "end_turn" }]
//!
//! [tools.Bash]
//! output = "Cargo.toml\nsrc"
//! ```

use std::collections::{HashMap, VecDeque};
use std::path::Path;
use std::sync::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use relay_types::{
    ApprovalRequest, ConversationId, RunId, StopReason, StreamEvent, ToolExecutionResult,
    TurnInput,
};
use serde::Deserialize;
use serde_json::Value;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::backend::{AgentBackend, BackendError, BackendFut, RunMetadata};
use crate::config::ConfigError;
use crate::executor::{ToolError, ToolExecution, ToolFut};
use crate::permissions::CapabilityTable;
use crate::streaming::{STREAM_EVENT_CHANNEL_CAPACITY, TurnStream};
use crate::util::lock_unpoisoned;

// ============================================================================
// Script file
// ============================================================================

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ScriptedEvent {
    RunStarted {
        run_id: String,
    },
    Text {
        text: String,
    },
    Reasoning {
        text: String,
    },
    Approval {
        tool_call_id: String,
        tool_name: String,
        #[serde(default)]
        args: Value,
    },
    Error {
        detail: String,
    },
    /// Unknown reasons replay as [`StopReason::Error`].
    Stop {
        reason: String,
    },
}

impl ScriptedEvent {
    fn into_stream_event(self) -> StreamEvent {
        match self {
            Self::RunStarted { run_id } => StreamEvent::RunStarted(RunId::new(run_id)),
            Self::Text { text } => StreamEvent::TextDelta(text),
            Self::Reasoning { text } => StreamEvent::ReasoningDelta(text),
            Self::Approval {
                tool_call_id,
                tool_name,
                args,
            } => StreamEvent::ApprovalRequested(scripted_request(tool_call_id, tool_name, &args)),
            Self::Error { detail } => StreamEvent::Error(detail),
            Self::Stop { reason } => StreamEvent::Stop(StopReason::parse(&reason)),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct ScriptedApproval {
    pub tool_call_id: String,
    pub tool_name: String,
    #[serde(default)]
    pub args: Value,
}

impl From<ScriptedApproval> for ApprovalRequest {
    fn from(approval: ScriptedApproval) -> Self {
        scripted_request(approval.tool_call_id, approval.tool_name, &approval.args)
    }
}

fn scripted_request(tool_call_id: String, tool_name: String, args: &Value) -> ApprovalRequest {
    let args_json = if args.is_null() {
        "{}".to_string()
    } else {
        args.to_string()
    };
    ApprovalRequest::new(tool_call_id, tool_name, args_json)
}

/// One answer to `open_stream`.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ScriptedResponse {
    /// Stream these events. A held stream stays open after the last event
    /// until the backend is asked to cancel.
    Stream {
        events: Vec<ScriptedEvent>,
        #[serde(default)]
        hold_open: bool,
    },
    /// Fail before a stream opens.
    Reject {
        #[serde(default)]
        status: Option<u16>,
        message: String,
    },
}

#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct ScriptedToolResult {
    #[serde(default)]
    pub output: String,
    #[serde(default)]
    pub error: bool,
    #[serde(default)]
    pub delay_ms: u64,
}

/// Contents of a replay script.
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(default)]
pub struct Script {
    /// User messages, submitted in order.
    pub messages: Vec<String>,
    pub responses: Vec<ScriptedResponse>,
    /// Successive answers to `pending_approvals`.
    pub pending: Vec<Vec<ScriptedApproval>>,
    /// Error text recorded against runs, keyed by run id.
    pub run_errors: HashMap<String, String>,
    pub tools: HashMap<String, ScriptedToolResult>,
    /// Whether the backend acknowledges cancel requests.
    pub ignore_cancel: bool,
}

impl Script {
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        toml::from_str(&content).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })
    }

    /// Split the script into its collaborators.
    #[must_use]
    pub fn into_parts(self) -> (Vec<String>, ScriptedBackend, ScriptedTools) {
        let mut backend = ScriptedBackend::new();
        for response in self.responses {
            backend.push_response(response);
        }
        for batch in self.pending {
            backend.push_pending(batch.into_iter().map(ApprovalRequest::from).collect());
        }
        for (run_id, error) in self.run_errors {
            backend = backend.with_run_error(run_id, error);
        }
        if self.ignore_cancel {
            backend = backend.ignoring_cancel();
        }

        let mut tools = ScriptedTools::new();
        for (name, result) in self.tools {
            tools = tools.with_result(name, result);
        }
        (self.messages, backend, tools)
    }
}

// ============================================================================
// Backend
// ============================================================================

#[derive(Debug, Default)]
pub struct ScriptedBackend {
    responses: Mutex<VecDeque<ScriptedResponse>>,
    pending: Mutex<VecDeque<Vec<ApprovalRequest>>>,
    run_errors: HashMap<String, String>,
    sent: Mutex<Vec<Vec<TurnInput>>>,
    held: Mutex<Option<mpsc::Sender<StreamEvent>>>,
    cancels: AtomicUsize,
    ignore_cancel: bool,
}

impl ScriptedBackend {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push_response(&mut self, response: ScriptedResponse) {
        lock_unpoisoned(&self.responses).push_back(response);
    }

    pub fn push_pending(&mut self, approvals: Vec<ApprovalRequest>) {
        lock_unpoisoned(&self.pending).push_back(approvals);
    }

    /// Queue a stream that closes after `events`.
    #[must_use]
    pub fn stream(mut self, events: Vec<StreamEvent>) -> Self {
        self.push_events(events, false);
        self
    }

    /// Queue a stream that stays open after `events` until cancelled.
    #[must_use]
    pub fn held_stream(mut self, events: Vec<StreamEvent>) -> Self {
        self.push_events(events, true);
        self
    }

    fn push_events(&mut self, events: Vec<StreamEvent>, hold_open: bool) {
        let events = events.into_iter().map(ScriptedEvent::from).collect();
        self.push_response(ScriptedResponse::Stream { events, hold_open });
    }

    #[must_use]
    pub fn reject(mut self, err: BackendError) -> Self {
        self.push_response(ScriptedResponse::Reject {
            status: err.status,
            message: err.message,
        });
        self
    }

    #[must_use]
    pub fn pending(mut self, approvals: Vec<ApprovalRequest>) -> Self {
        self.push_pending(approvals);
        self
    }

    #[must_use]
    pub fn with_run_error(mut self, run_id: impl Into<String>, error: impl Into<String>) -> Self {
        self.run_errors.insert(run_id.into(), error.into());
        self
    }

    /// Never answer cancel requests.
    #[must_use]
    pub fn ignoring_cancel(mut self) -> Self {
        self.ignore_cancel = true;
        self
    }

    /// Push `event` into the open held stream. A stop event closes it.
    ///
    /// Returns `false` when no held stream is open.
    pub fn send_held(&self, event: StreamEvent) -> bool {
        let mut held = lock_unpoisoned(&self.held);
        let closes = matches!(event, StreamEvent::Stop(_));
        let sent = held.as_ref().is_some_and(|tx| tx.try_send(event).is_ok());
        if closes {
            *held = None;
        }
        sent
    }

    /// Every input sent so far, oldest first.
    #[must_use]
    pub fn sent(&self) -> Vec<Vec<TurnInput>> {
        lock_unpoisoned(&self.sent).clone()
    }

    #[must_use]
    pub fn cancel_count(&self) -> usize {
        self.cancels.load(Ordering::SeqCst)
    }

    #[must_use]
    pub fn remaining_responses(&self) -> usize {
        lock_unpoisoned(&self.responses).len()
    }
}

impl From<StreamEvent> for ScriptedEvent {
    fn from(event: StreamEvent) -> Self {
        match event {
            StreamEvent::RunStarted(run_id) => Self::RunStarted {
                run_id: run_id.as_str().to_string(),
            },
            StreamEvent::TextDelta(text) => Self::Text { text },
            StreamEvent::ReasoningDelta(text) => Self::Reasoning { text },
            StreamEvent::ApprovalRequested(request) => Self::Approval {
                args: request.parsed_args(),
                tool_call_id: request.tool_call_id,
                tool_name: request.tool_name,
            },
            StreamEvent::Error(detail) => Self::Error { detail },
            StreamEvent::Stop(reason) => Self::Stop {
                reason: reason.as_str().to_string(),
            },
        }
    }
}

impl AgentBackend for ScriptedBackend {
    fn open_stream<'a>(
        &'a self,
        _conversation: &'a ConversationId,
        input: Vec<TurnInput>,
    ) -> BackendFut<'a, TurnStream> {
        Box::pin(async move {
            lock_unpoisoned(&self.sent).push(input);
            let response = lock_unpoisoned(&self.responses).pop_front();
            match response {
                None => Err(BackendError::new("script exhausted")),
                Some(ScriptedResponse::Reject { status, message }) => Err(BackendError {
                    status,
                    message,
                }),
                Some(ScriptedResponse::Stream { events, hold_open }) => {
                    let capacity = STREAM_EVENT_CHANNEL_CAPACITY.max(events.len() + 1);
                    let (tx, stream) = TurnStream::with_capacity(capacity);
                    for event in events {
                        if let Err(err) = tx.try_send(event.into_stream_event()) {
                            tracing::debug!(error = %err, "Dropped scripted stream event");
                        }
                    }
                    if hold_open {
                        *lock_unpoisoned(&self.held) = Some(tx);
                    }
                    Ok(stream)
                }
            }
        })
    }

    fn cancel<'a>(&'a self, _conversation: &'a ConversationId) -> BackendFut<'a, ()> {
        Box::pin(async move {
            self.cancels.fetch_add(1, Ordering::SeqCst);
            if self.ignore_cancel {
                return Ok(());
            }
            if let Some(tx) = lock_unpoisoned(&self.held).take()
                && let Err(err) = tx.try_send(StreamEvent::Stop(StopReason::Cancelled))
            {
                tracing::debug!(error = %err, "Held stream closed before cancel");
            }
            Ok(())
        })
    }

    fn retrieve_run<'a>(&'a self, run_id: &'a RunId) -> BackendFut<'a, RunMetadata> {
        Box::pin(async move {
            Ok(RunMetadata {
                stop_reason: Some(StopReason::Error),
                error: self.run_errors.get(run_id.as_str()).cloned(),
            })
        })
    }

    fn pending_approvals<'a>(
        &'a self,
        _conversation: &'a ConversationId,
    ) -> BackendFut<'a, Vec<ApprovalRequest>> {
        Box::pin(async move { Ok(lock_unpoisoned(&self.pending).pop_front().unwrap_or_default()) })
    }
}

// ============================================================================
// Tools
// ============================================================================

/// Canned tool results.
///
/// Every tool in [`CapabilityTable::standard`] answers `"{tool} ok"` unless
/// scripted otherwise. Any other tool name is unknown.
#[derive(Debug)]
pub struct ScriptedTools {
    results: HashMap<String, ScriptedToolResult>,
    calls: Mutex<Vec<(String, Value)>>,
}

impl Default for ScriptedTools {
    fn default() -> Self {
        let results = CapabilityTable::standard()
            .tool_names()
            .map(|name| (name.to_string(), ScriptedToolResult::default()))
            .collect();
        Self {
            results,
            calls: Mutex::default(),
        }
    }
}

impl ScriptedTools {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn with_result(mut self, tool: impl Into<String>, result: ScriptedToolResult) -> Self {
        self.results.insert(tool.into(), result);
        self
    }

    /// Tool name and arguments of every call, in start order.
    #[must_use]
    pub fn calls(&self) -> Vec<(String, Value)> {
        lock_unpoisoned(&self.calls).clone()
    }
}

impl ToolExecution for ScriptedTools {
    fn execute<'a>(
        &'a self,
        tool_name: &'a str,
        args: Value,
        abort: CancellationToken,
    ) -> ToolFut<'a> {
        Box::pin(async move {
            lock_unpoisoned(&self.calls).push((tool_name.to_string(), args));
            let Some(scripted) = self.results.get(tool_name).cloned() else {
                return Err(ToolError::UnknownTool {
                    name: tool_name.to_string(),
                });
            };

            if scripted.delay_ms > 0 {
                tokio::select! {
                    () = abort.cancelled() => {}
                    () = tokio::time::sleep(Duration::from_millis(scripted.delay_ms)) => {}
                }
            }

            let output = if scripted.output.is_empty() {
                format!("{tool_name} ok")
            } else {
                scripted.output
            };
            if scripted.error {
                Ok(ToolExecutionResult::error(output))
            } else {
                Ok(ToolExecutionResult::success(output))
            }
        })
    }
}
