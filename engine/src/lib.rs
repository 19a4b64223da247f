//! Turn and approval orchestration for Relay.
//!
//! The [`Orchestrator`] drives one conversation with a remote agent: it sends
//! user input, drains the response stream, routes tool-call approvals through
//! the permission pipeline and human review, recovers from backend failures,
//! and keeps a queue of messages typed while a turn is in flight.
//!
//! The crate has no terminal dependencies. A UI consumes [`UiEvent`]s from the
//! channel returned by [`Orchestrator::new`] and calls back into the
//! orchestrator for submit, interrupt, and review decisions.

mod backend;
mod cancellation;
mod config;
mod errors;
mod events;
mod executor;
mod orchestrator;
mod permissions;
mod queue;
mod retry;
mod review;
pub mod scripted;
mod streaming;
mod util;

pub use backend::{AgentBackend, BackendError, BackendFut, RunMetadata};
pub use cancellation::{CancellationController, TurnBusy, TurnGuard};
pub use config::{
    CancelConfig, ConfigError, NotificationsConfig, OrchestratorSettings, PermissionsConfig,
    RelayConfig, RetrySection, SessionConfig, expand_env_vars,
};
pub use errors::{FEEDBACK_HINT, TurnError, format_turn_error};
pub use events::{BufferDelta, EventSink, NotifyReason, UiEvent};
pub use executor::{
    ApprovalExecutor, ExecutedApproval, ExecutedBatch, INTERRUPTED_TOOL_RETURN,
    IntegrityViolation, ToolError, ToolExecution, ToolFut, assemble_results,
};
pub use orchestrator::{
    Collaborators, InterruptOutcome, NEW_MESSAGE_DENIAL, Orchestrator, SUPERSEDED_APPROVAL_REASON,
    SubmitRejection, TurnOutcome, TurnPhase,
};
pub use permissions::{
    CapabilityTable, OracleVerdict, PermissionOracle, PermissionPipeline, PermissionRule,
    RuleDecision, RuleParseError, RuleSetOracle, SaveRuleError, ToolAccess, ToolCapability,
};
pub use queue::{Enqueued, MessageQueue};
pub use retry::{
    ErrorCategory, RetryConfig, RetryCounters, RetryDecision, RetryPolicy, RetryStrategy,
    TurnFailure,
};
pub use review::{
    ReviewDecisions, ReviewError, ReviewProgress, ReviewSnapshot, ReviewState,
    USER_CANCELLED_REASON,
};
pub use streaming::{DrainResult, TurnBuffer, TurnStream, drain};
pub use util::truncate_with_ellipsis;

pub use relay_types::{
    ApprovalOutcome, ApprovalRequest, ApprovalResult, ConversationId, Generation,
    NonEmptyStaticStr, NonEmptyString, PermissionDecision, PermissionMode, RuleScope, RunId,
    StopReason, StreamEvent, ToolExecutionResult, ToolStatus, TurnInput,
};
