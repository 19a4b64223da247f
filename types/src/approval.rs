//! Tool-call approval types.
//!
//! ```text
//! ApprovalRequest ──classify──> PermissionDecision
//!        │                          │
//!        │        Allow ────────────┼──> execute ──> ToolExecutionResult ─┐
//!        │        Deny(reason) ─────┼──────────────────────────────────────┤
//!        │        Ask ──> review ───┴──> ApprovalOutcome ─────────────────┤
//!        v                                                                 v
//!   tool_call_id  ════════════════ must match ═════════════════>  ApprovalResult
//! ```

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::NonEmptyString;

/// A pending tool call the backend holds until the client answers it.
///
/// Immutable once created; consumed exactly once, either by the automatic
/// pipeline or by human review.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ApprovalRequest {
    /// Unique per turn; links the request to its result.
    pub tool_call_id: String,
    pub tool_name: String,
    /// Raw JSON arguments as the agent produced them.
    pub tool_args_json: String,
}

impl ApprovalRequest {
    pub fn new(
        tool_call_id: impl Into<String>,
        tool_name: impl Into<String>,
        tool_args_json: impl Into<String>,
    ) -> Self {
        Self {
            tool_call_id: tool_call_id.into(),
            tool_name: tool_name.into(),
            tool_args_json: tool_args_json.into(),
        }
    }

    /// Parse the arguments. Blank arguments are an empty object.
    pub fn try_parse_args(&self) -> Result<Value, serde_json::Error> {
        if self.tool_args_json.trim().is_empty() {
            return Ok(Value::Object(serde_json::Map::new()));
        }
        serde_json::from_str(&self.tool_args_json)
    }

    /// Like [`Self::try_parse_args`], but malformed JSON yields `Value::Null`.
    #[must_use]
    pub fn parsed_args(&self) -> Value {
        self.try_parse_args().unwrap_or(Value::Null)
    }
}

/// Permission pipeline verdict for one request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "decision", rename_all = "snake_case")]
pub enum PermissionDecision {
    Allow,
    Deny { reason: String },
    Ask,
}

impl PermissionDecision {
    pub fn deny(reason: impl Into<String>) -> Self {
        Self::Deny {
            reason: reason.into(),
        }
    }

    #[must_use]
    pub const fn label(&self) -> &'static str {
        match self {
            Self::Allow => "allow",
            Self::Deny { .. } => "deny",
            Self::Ask => "ask",
        }
    }
}

/// A decided approval, produced automatically (Deny) or by the user.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ApprovalOutcome {
    Approved(ApprovalRequest),
    Denied {
        request: ApprovalRequest,
        reason: String,
    },
}

impl ApprovalOutcome {
    pub fn denied(request: ApprovalRequest, reason: impl Into<String>) -> Self {
        Self::Denied {
            request,
            reason: reason.into(),
        }
    }

    #[must_use]
    pub fn request(&self) -> &ApprovalRequest {
        match self {
            Self::Approved(request) | Self::Denied { request, .. } => request,
        }
    }

    #[must_use]
    pub fn tool_call_id(&self) -> &str {
        &self.request().tool_call_id
    }

    #[must_use]
    pub fn is_approved(&self) -> bool {
        matches!(self, Self::Approved(_))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ToolStatus {
    Success,
    Error,
}

/// Output of the tool-execution collaborator for one approved call.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ToolExecutionResult {
    pub tool_return: String,
    pub status: ToolStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stdout: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stderr: Option<String>,
}

impl ToolExecutionResult {
    pub fn success(tool_return: impl Into<String>) -> Self {
        Self {
            tool_return: tool_return.into(),
            status: ToolStatus::Success,
            stdout: None,
            stderr: None,
        }
    }

    pub fn error(tool_return: impl Into<String>) -> Self {
        Self {
            tool_return: tool_return.into(),
            status: ToolStatus::Error,
            stdout: None,
            stderr: None,
        }
    }

    #[must_use]
    pub fn with_output(mut self, stdout: Option<String>, stderr: Option<String>) -> Self {
        self.stdout = stdout;
        self.stderr = stderr;
        self
    }

    #[must_use]
    pub fn is_error(&self) -> bool {
        self.status == ToolStatus::Error
    }
}

/// Wire payload unit sent back to the backend to resume a turn.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ApprovalResult {
    /// The tool ran (or was interrupted) on the client.
    ToolReturn {
        tool_call_id: String,
        tool_return: String,
        status: ToolStatus,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        stdout: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        stderr: Option<String>,
    },
    /// The call was refused; the tool never ran.
    ApprovalReturn {
        tool_call_id: String,
        approve: bool,
        reason: String,
    },
}

impl ApprovalResult {
    pub fn tool_return(tool_call_id: impl Into<String>, result: ToolExecutionResult) -> Self {
        Self::ToolReturn {
            tool_call_id: tool_call_id.into(),
            tool_return: result.tool_return,
            status: result.status,
            stdout: result.stdout,
            stderr: result.stderr,
        }
    }

    pub fn denial(tool_call_id: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::ApprovalReturn {
            tool_call_id: tool_call_id.into(),
            approve: false,
            reason: reason.into(),
        }
    }

    /// Denial result for a decided outcome. Approved outcomes have no result
    /// until they are executed.
    #[must_use]
    pub fn from_denied(outcome: &ApprovalOutcome) -> Option<Self> {
        match outcome {
            ApprovalOutcome::Denied { request, reason } => {
                Some(Self::denial(request.tool_call_id.clone(), reason.clone()))
            }
            ApprovalOutcome::Approved(_) => None,
        }
    }

    #[must_use]
    pub fn tool_call_id(&self) -> &str {
        match self {
            Self::ToolReturn { tool_call_id, .. } | Self::ApprovalReturn { tool_call_id, .. } => {
                tool_call_id
            }
        }
    }

    #[must_use]
    pub fn is_denial(&self) -> bool {
        matches!(self, Self::ApprovalReturn { approve: false, .. })
    }
}

/// One outgoing item of a turn's input.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", content = "payload", rename_all = "snake_case")]
pub enum TurnInput {
    UserMessage(NonEmptyString),
    Approval(ApprovalResult),
}

impl TurnInput {
    #[must_use]
    pub fn is_approval(&self) -> bool {
        matches!(self, Self::Approval(_))
    }

    #[must_use]
    pub fn user_text(&self) -> Option<&str> {
        match self {
            Self::UserMessage(text) => Some(text.as_str()),
            Self::Approval(_) => None,
        }
    }

    #[must_use]
    pub fn approval(&self) -> Option<&ApprovalResult> {
        match self {
            Self::Approval(result) => Some(result),
            Self::UserMessage(_) => None,
        }
    }
}
