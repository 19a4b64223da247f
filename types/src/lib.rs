//! Core domain types for Relay.
//!
//! This crate contains pure domain types with no IO, no async, and minimal dependencies.
//! Everything here can be used from any layer of the application.

// Pedantic lint configuration - these are intentional design choices
#![allow(clippy::missing_errors_doc)] // Result-returning functions are self-explanatory
#![allow(clippy::missing_panics_doc)] // Panics are documented in assertions

mod approval;
mod ids;

pub use approval::{
    ApprovalOutcome, ApprovalRequest, ApprovalResult, PermissionDecision, ToolExecutionResult,
    ToolStatus, TurnInput,
};
pub use ids::{ConversationId, Generation, RunId};

use serde::{Deserialize, Serialize};
use thiserror::Error;

// ============================================================================
// NonEmpty String Types
// ============================================================================

/// A string guaranteed to be non-empty (after trimming).
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct NonEmptyString(String);

#[derive(Debug, Error)]
#[error("message content must not be empty")]
pub struct EmptyStringError;

impl NonEmptyString {
    pub fn new(value: impl Into<String>) -> Result<Self, EmptyStringError> {
        let value = value.into();
        if value.trim().is_empty() {
            Err(EmptyStringError)
        } else {
            Ok(Self(value))
        }
    }

    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }

    #[must_use]
    pub fn into_inner(self) -> String {
        self.0
    }
}

impl TryFrom<String> for NonEmptyString {
    type Error = EmptyStringError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::new(value)
    }
}

impl TryFrom<&str> for NonEmptyString {
    type Error = EmptyStringError;

    fn try_from(value: &str) -> Result<Self, Self::Error> {
        Self::new(value)
    }
}

impl From<NonEmptyString> for String {
    fn from(value: NonEmptyString) -> Self {
        value.0
    }
}

impl std::ops::Deref for NonEmptyString {
    type Target = str;

    fn deref(&self) -> &Self::Target {
        self.as_str()
    }
}

impl AsRef<str> for NonEmptyString {
    fn as_ref(&self) -> &str {
        self.as_str()
    }
}

impl std::fmt::Display for NonEmptyString {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// A compile-time checked non-empty static string.
///
/// Construction rejects whitespace-only input, so conversion into
/// [`NonEmptyString`] cannot fail.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct NonEmptyStaticStr(&'static str);

impl NonEmptyStaticStr {
    #[must_use]
    pub const fn new(value: &'static str) -> Self {
        let bytes = value.as_bytes();
        let mut i = 0;
        let mut has_content = false;
        while i < bytes.len() {
            if !bytes[i].is_ascii_whitespace() {
                has_content = true;
            }
            i += 1;
        }
        assert!(has_content, "NonEmptyStaticStr must not be blank");
        Self(value)
    }

    #[must_use]
    pub const fn as_str(self) -> &'static str {
        self.0
    }
}

impl From<NonEmptyStaticStr> for NonEmptyString {
    fn from(value: NonEmptyStaticStr) -> Self {
        Self(value.0.to_string())
    }
}

// ============================================================================
// Permission Types
// ============================================================================

/// Ambient permission mode selected by the user for the session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum PermissionMode {
    /// Ask for anything the rule set does not explicitly cover.
    #[default]
    Default,
    /// File edits are allowed without asking.
    AcceptEdits,
    /// Read-only planning: write tools are refused.
    Plan,
    /// Every tool call is allowed.
    BypassPermissions,
}

impl PermissionMode {
    pub const ALL: [PermissionMode; 4] = [
        PermissionMode::Default,
        PermissionMode::AcceptEdits,
        PermissionMode::Plan,
        PermissionMode::BypassPermissions,
    ];

    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Default => "default",
            Self::AcceptEdits => "acceptEdits",
            Self::Plan => "plan",
            Self::BypassPermissions => "bypassPermissions",
        }
    }

    /// Parse a mode name, accepting both camelCase and snake_case spellings.
    #[must_use]
    pub fn parse(value: &str) -> Option<Self> {
        let normalized: String = value
            .trim()
            .chars()
            .filter(|c| *c != '_' && *c != '-')
            .collect::<String>()
            .to_ascii_lowercase();
        match normalized.as_str() {
            "default" => Some(Self::Default),
            "acceptedits" => Some(Self::AcceptEdits),
            "plan" => Some(Self::Plan),
            "bypasspermissions" | "bypass" => Some(Self::BypassPermissions),
            _ => None,
        }
    }
}

/// Where a persisted permission rule applies.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RuleScope {
    /// Forgotten when the process exits.
    #[default]
    Session,
    /// Stored alongside the project.
    Project,
    /// Stored in the user's global settings.
    User,
}

impl RuleScope {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Session => "session",
            Self::Project => "project",
            Self::User => "user",
        }
    }
}

// ============================================================================
// Streaming Events
// ============================================================================

/// Terminal condition reported by the backend at the end of a stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StopReason {
    /// The agent finished its turn.
    EndTurn,
    /// The run was cancelled (client request or server side).
    Cancelled,
    /// The agent is waiting for tool-call approvals.
    RequiresApproval,
    /// The upstream model provider failed.
    LlmApiError,
    /// Any other failure.
    Error,
}

impl StopReason {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::EndTurn => "end_turn",
            Self::Cancelled => "cancelled",
            Self::RequiresApproval => "requires_approval",
            Self::LlmApiError => "llm_api_error",
            Self::Error => "error",
        }
    }

    /// Map a wire stop-reason string. Unknown reasons are treated as errors.
    #[must_use]
    pub fn parse(value: &str) -> Self {
        match value.trim() {
            "end_turn" => Self::EndTurn,
            "cancelled" => Self::Cancelled,
            "requires_approval" => Self::RequiresApproval,
            "llm_api_error" => Self::LlmApiError,
            _ => Self::Error,
        }
    }
}

impl std::fmt::Display for StopReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Streaming event from the backend.
///
/// A well-formed stream ends with exactly one [`StreamEvent::Stop`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StreamEvent {
    /// The backend assigned a run to this turn.
    RunStarted(RunId),
    /// Assistant text delta.
    TextDelta(String),
    /// Reasoning content delta.
    ReasoningDelta(String),
    /// The agent wants to call a tool that needs a client decision.
    ApprovalRequested(ApprovalRequest),
    /// Error detail attached to the run.
    Error(String),
    /// Terminal stop reason.
    Stop(StopReason),
}

// ============================================================================
// Tests
// ============================================================================
