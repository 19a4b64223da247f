//! Turn error taxonomy and user-facing formatting.

use relay_types::NonEmptyStaticStr;

use crate::executor::IntegrityViolation;
use crate::retry::ErrorCategory;
use crate::util::truncate_with_ellipsis;

/// Appended to errors the user cannot fix by retrying.
pub const FEEDBACK_HINT: NonEmptyStaticStr =
    NonEmptyStaticStr::new("If this keeps happening, report it with /feedback.");

const MAX_ERROR_DETAIL: usize = 300;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TurnError {
    #[error("LLM provider error (gave up after {retries} retries): {message}")]
    TransientLlm { retries: u32, message: String },
    #[error("Conversation is busy: {message}")]
    ConversationBusy { message: String },
    #[error("Approval state out of sync: {message}")]
    ApprovalDesync { message: String },
    #[error("Invalid tool call ids: {message}")]
    InvalidToolCallIds { message: String },
    #[error("Approvals still pending: {message}")]
    ApprovalPending { message: String },
    #[error("Integrity error: {0}")]
    Integrity(#[from] IntegrityViolation),
    #[error("{message}")]
    Fatal { message: String },
}

impl TurnError {
    /// Build the surfaced error for a category whose recovery gave up.
    #[must_use]
    pub fn from_category(category: ErrorCategory, retries: u32, message: String) -> Self {
        match category {
            ErrorCategory::TransientLlm => Self::TransientLlm { retries, message },
            ErrorCategory::ConversationBusy => Self::ConversationBusy { message },
            ErrorCategory::ApprovalDesync => Self::ApprovalDesync { message },
            ErrorCategory::InvalidToolCallIds => Self::InvalidToolCallIds { message },
            ErrorCategory::ApprovalPending => Self::ApprovalPending { message },
            ErrorCategory::Fatal => Self::Fatal { message },
        }
    }

    /// Feedback hint for errors a retry will not fix.
    #[must_use]
    pub fn hint(&self) -> Option<&'static str> {
        match self {
            Self::ConversationBusy { .. } => None,
            _ => Some(FEEDBACK_HINT.as_str()),
        }
    }
}

/// One transcript line for `err`.
#[must_use]
pub fn format_turn_error(err: &TurnError) -> String {
    let line = err.to_string().replace(['\r', '\n'], " ");
    truncate_with_ellipsis(&line, MAX_ERROR_DETAIL)
}
