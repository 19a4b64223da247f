//! Shared test utilities and fixtures
//!
//! Builds an orchestrator over the scripted backend and tools.

#![allow(dead_code)]

use std::sync::Arc;
use std::time::Duration;

use relay_engine::scripted::{ScriptedBackend, ScriptedToolResult, ScriptedTools};
use relay_engine::{
    ApprovalRequest, ApprovalResult, CapabilityTable, Collaborators, NonEmptyString, Orchestrator,
    OrchestratorSettings, PermissionRule, RuleScope, RuleSetOracle, StopReason, StreamEvent,
    TurnInput, TurnOutcome, TurnPhase, UiEvent,
};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

pub struct Harness {
    pub orchestrator: Orchestrator,
    pub events: mpsc::UnboundedReceiver<UiEvent>,
    pub backend: Arc<ScriptedBackend>,
    pub tools: Arc<ScriptedTools>,
    pub oracle: Arc<RuleSetOracle>,
}

pub struct HarnessBuilder {
    backend: ScriptedBackend,
    tools: ScriptedTools,
    deny: Vec<&'static str>,
    settings: OrchestratorSettings,
}

impl HarnessBuilder {
    pub fn tool(mut self, name: &str, result: ScriptedToolResult) -> Self {
        self.tools = self.tools.with_result(name, result);
        self
    }

    pub fn deny_rule(mut self, rule: &'static str) -> Self {
        self.deny.push(rule);
        self
    }

    pub fn unattended(mut self) -> Self {
        self.settings.attended = false;
        self
    }

    pub fn settings(mut self, f: impl FnOnce(&mut OrchestratorSettings)) -> Self {
        f(&mut self.settings);
        self
    }

    pub fn build(self) -> Harness {
        let capabilities = CapabilityTable::standard();
        let mut oracle = RuleSetOracle::new(capabilities.clone());
        for rule in self.deny {
            oracle = oracle.with_deny(PermissionRule::parse(rule).unwrap(), RuleScope::Session);
        }

        let backend = Arc::new(self.backend);
        let tools = Arc::new(self.tools);
        let oracle = Arc::new(oracle);
        let collaborators = Collaborators {
            backend: backend.clone(),
            tools: tools.clone(),
            oracle: oracle.clone(),
            capabilities,
        };
        let (orchestrator, events) = Orchestrator::new(collaborators, self.settings);
        Harness {
            orchestrator,
            events,
            backend,
            tools,
            oracle,
        }
    }
}

pub fn harness(backend: ScriptedBackend) -> HarnessBuilder {
    HarnessBuilder {
        backend,
        tools: ScriptedTools::new(),
        deny: Vec::new(),
        settings: OrchestratorSettings::default(),
    }
}

impl Harness {
    /// Every event emitted so far.
    pub fn drain_events(&mut self) -> Vec<UiEvent> {
        let mut events = Vec::new();
        while let Ok(event) = self.events.try_recv() {
            events.push(event);
        }
        events
    }

    /// Submit on a separate task so the test can act while the turn runs.
    pub fn spawn_submit(&self, text: &str) -> JoinHandle<TurnOutcome> {
        let orchestrator = self.orchestrator.clone();
        let text = text.to_string();
        tokio::spawn(async move { orchestrator.submit(text).await })
    }

    /// Yield until the orchestrator reaches `phase`.
    pub async fn wait_for_phase(&self, phase: TurnPhase) {
        for _ in 0..10_000 {
            if self.orchestrator.phase() == phase {
                return;
            }
            tokio::task::yield_now().await;
        }
        panic!(
            "orchestrator never reached {phase:?} (stuck in {:?})",
            self.orchestrator.phase()
        );
    }

    pub fn sent(&self) -> Vec<Vec<TurnInput>> {
        self.backend.sent()
    }

    /// Ids of the approval results in the `n`th send, in order.
    pub fn sent_approval_ids(&self, n: usize) -> Vec<String> {
        self.sent()[n]
            .iter()
            .filter_map(TurnInput::approval)
            .map(|result| result.tool_call_id().to_string())
            .collect()
    }
}

// ============================================================================
// Fixtures
// ============================================================================

pub fn user(text: &str) -> TurnInput {
    TurnInput::UserMessage(NonEmptyString::new(text).unwrap())
}

pub fn approval_input(result: ApprovalResult) -> TurnInput {
    TurnInput::Approval(result)
}

pub fn request(id: &str, tool: &str, args: &str) -> ApprovalRequest {
    ApprovalRequest::new(id, tool, args)
}

pub fn bash(id: &str, command: &str) -> ApprovalRequest {
    request(id, "Bash", &serde_json::json!({ "command": command }).to_string())
}

pub fn read(id: &str, path: &str) -> ApprovalRequest {
    request(id, "Read", &serde_json::json!({ "file_path": path }).to_string())
}

pub fn write(id: &str, path: &str) -> ApprovalRequest {
    request(id, "Write", &serde_json::json!({ "file_path": path }).to_string())
}

/// A stream that says `text` and ends the turn.
pub fn reply(text: &str) -> Vec<StreamEvent> {
    vec![
        StreamEvent::RunStarted(relay_engine::RunId::new("run-reply")),
        StreamEvent::TextDelta(text.to_string()),
        StreamEvent::Stop(StopReason::EndTurn),
    ]
}

/// A stream that asks for `requests`.
pub fn asks(requests: Vec<ApprovalRequest>) -> Vec<StreamEvent> {
    requests
        .into_iter()
        .map(StreamEvent::ApprovalRequested)
        .chain(std::iter::once(StreamEvent::Stop(StopReason::RequiresApproval)))
        .collect()
}

pub fn stop(reason: StopReason) -> Vec<StreamEvent> {
    vec![StreamEvent::Stop(reason)]
}

pub fn slow_tool(delay: Duration) -> ScriptedToolResult {
    ScriptedToolResult {
        output: String::new(),
        error: false,
        delay_ms: delay.as_millis() as u64,
    }
}

pub fn retry_attempts(events: &[UiEvent]) -> Vec<(u32, Duration)> {
    events
        .iter()
        .filter_map(|event| match event {
            UiEvent::Retrying { attempt, delay, .. } => Some((*attempt, *delay)),
            _ => None,
        })
        .collect()
}
