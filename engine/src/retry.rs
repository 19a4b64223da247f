//! Turn failure classification and recovery strategy.
//!
//! # Categories
//!
//! | Category | Budget | Strategy |
//! |---|---|---|
//! | Transient LLM error | 3 | backoff 1s, 2s, 4s |
//! | Conversation busy | 1 | fixed 2.5s |
//! | Approval desync | 3 (shared) | keep-alive or strip approvals |
//! | Approval pending | 3 (shared) | deny stale approvals, resend |
//! | Invalid tool call ids | 3 (shared) | refetch approvals, re-enter review |
//! | Anything else | 0 | surface |
//!
//! Counters live in [`RetryCounters`], one per turn. They reset when a turn
//! ends cleanly.

use std::time::Duration;

use relay_types::StopReason;

use crate::backend::BackendError;

/// Backend text reported when approvals are sent but none are outstanding.
const DESYNC_SIGNATURES: &[&str] = &["no tool call is currently awaiting approval"];

const INVALID_IDS_SIGNATURES: &[&str] = &["invalid tool call ids", "invalid tool call id"];

const APPROVAL_PENDING_SIGNATURES: &[&str] = &[
    "waiting for approval",
    "approve or deny the pending request",
];

const BUSY_SIGNATURES: &[&str] = &[
    "another request is currently being processed",
    "conversation is busy",
];

/// Provider failure text found in run metadata of an error stop.
const PROVIDER_ERROR_SIGNATURES: &[&str] = &[
    "overloaded",
    "rate limit",
    "internal server error",
    "upstream",
    "llm_api_error",
    "service unavailable",
];

const STATUS_CONFLICT: u16 = 409;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetryConfig {
    pub llm_max_attempts: u32,
    pub llm_base_delay: Duration,
    pub busy_delay: Duration,
    pub busy_max_retries: u32,
    pub desync_max_attempts: u32,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            llm_max_attempts: 3,
            llm_base_delay: Duration::from_secs(1),
            busy_delay: Duration::from_millis(2500),
            busy_max_retries: 1,
            desync_max_attempts: 3,
        }
    }
}

/// Retries consumed by the current turn.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RetryCounters {
    pub llm_api_error: u32,
    pub conversation_busy: u32,
    pub desync: u32,
}

impl RetryCounters {
    pub fn reset(&mut self) {
        *self = Self::default();
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorCategory {
    TransientLlm,
    ConversationBusy,
    ApprovalDesync,
    InvalidToolCallIds,
    ApprovalPending,
    Fatal,
}

impl ErrorCategory {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::TransientLlm => "transient_llm",
            Self::ConversationBusy => "conversation_busy",
            Self::ApprovalDesync => "approval_desync",
            Self::InvalidToolCallIds => "invalid_tool_call_ids",
            Self::ApprovalPending => "approval_pending",
            Self::Fatal => "fatal",
        }
    }
}

/// A turn that did not end cleanly.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TurnFailure {
    /// The request was rejected before a stream opened.
    PreStream(BackendError),
    /// The stream ended with a failing stop reason.
    Stream {
        stop_reason: StopReason,
        /// Error text attached to the stream.
        detail: Option<String>,
        /// Error text from the run's metadata.
        run_error: Option<String>,
    },
}

impl TurnFailure {
    /// Best text for display.
    #[must_use]
    pub fn message(&self) -> String {
        match self {
            Self::PreStream(err) => err.to_string(),
            Self::Stream {
                stop_reason,
                detail,
                run_error,
            } => run_error
                .as_ref()
                .or(detail.as_ref())
                .cloned()
                .unwrap_or_else(|| format!("stream stopped: {stop_reason}")),
        }
    }

    fn texts(&self) -> Vec<&str> {
        match self {
            Self::PreStream(err) => vec![err.message.as_str()],
            Self::Stream {
                detail, run_error, ..
            } => detail.iter().chain(run_error).map(String::as_str).collect(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryStrategy {
    /// Wait, then resend the same input.
    Backoff { attempt: u32, delay: Duration },
    /// Wait a fixed delay, then resend the same input.
    FixedDelay { attempt: u32, delay: Duration },
    /// Resend with stale approvals removed (keep-alive when nothing remains).
    StripApprovals { attempt: u32 },
    /// Fetch the backend's pending approvals and review them again.
    RefetchApprovals { attempt: u32 },
    /// Fetch pending approvals, deny them, resend prefixed with the denials.
    DenyPendingAndResend { attempt: u32 },
}

impl RetryStrategy {
    #[must_use]
    pub const fn attempt(self) -> u32 {
        match self {
            Self::Backoff { attempt, .. }
            | Self::FixedDelay { attempt, .. }
            | Self::StripApprovals { attempt }
            | Self::RefetchApprovals { attempt }
            | Self::DenyPendingAndResend { attempt } => attempt,
        }
    }

    #[must_use]
    pub const fn delay(self) -> Duration {
        match self {
            Self::Backoff { delay, .. } | Self::FixedDelay { delay, .. } => delay,
            _ => Duration::ZERO,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDecision {
    Retry {
        category: ErrorCategory,
        strategy: RetryStrategy,
    },
    Fatal {
        category: ErrorCategory,
        /// A retriable category ran out of budget.
        exhausted: bool,
    },
}

#[derive(Debug, Clone, Default)]
pub struct RetryPolicy {
    config: RetryConfig,
}

fn matches_any(text: &str, signatures: &[&str]) -> bool {
    let lower = text.to_ascii_lowercase();
    signatures.iter().any(|sig| lower.contains(sig))
}

impl RetryPolicy {
    #[must_use]
    pub fn new(config: RetryConfig) -> Self {
        Self { config }
    }

    #[must_use]
    pub fn config(&self) -> &RetryConfig {
        &self.config
    }

    /// Map a failure to its category. Pure.
    #[must_use]
    pub fn categorize(failure: &TurnFailure) -> ErrorCategory {
        let texts = failure.texts();
        let any = |signatures: &[&str]| texts.iter().any(|t| matches_any(t, signatures));

        if any(DESYNC_SIGNATURES) {
            return ErrorCategory::ApprovalDesync;
        }
        if any(INVALID_IDS_SIGNATURES) {
            return ErrorCategory::InvalidToolCallIds;
        }
        if any(APPROVAL_PENDING_SIGNATURES) {
            return ErrorCategory::ApprovalPending;
        }

        match failure {
            TurnFailure::PreStream(err) => {
                if err.status == Some(STATUS_CONFLICT) || matches_any(&err.message, BUSY_SIGNATURES) {
                    ErrorCategory::ConversationBusy
                } else {
                    ErrorCategory::Fatal
                }
            }
            TurnFailure::Stream {
                stop_reason: StopReason::LlmApiError,
                ..
            } => ErrorCategory::TransientLlm,
            TurnFailure::Stream { run_error, .. }
                if run_error
                    .as_deref()
                    .is_some_and(|t| matches_any(t, PROVIDER_ERROR_SIGNATURES)) =>
            {
                ErrorCategory::TransientLlm
            }
            TurnFailure::Stream { .. } => ErrorCategory::Fatal,
        }
    }

    /// Backoff before LLM retry `attempt` (1-based): base, 2x base, 4x base.
    #[must_use]
    pub fn llm_backoff(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(16);
        self.config.llm_base_delay.saturating_mul(1 << exponent)
    }

    /// Decide and, when retrying, consume one unit of the category's budget.
    pub fn decide(&self, category: ErrorCategory, counters: &mut RetryCounters) -> RetryDecision {
        let exhausted = RetryDecision::Fatal {
            category,
            exhausted: true,
        };
        let strategy = match category {
            ErrorCategory::TransientLlm => {
                if counters.llm_api_error >= self.config.llm_max_attempts {
                    return exhausted;
                }
                counters.llm_api_error += 1;
                let attempt = counters.llm_api_error;
                RetryStrategy::Backoff {
                    attempt,
                    delay: self.llm_backoff(attempt),
                }
            }
            ErrorCategory::ConversationBusy => {
                if counters.conversation_busy >= self.config.busy_max_retries {
                    return exhausted;
                }
                counters.conversation_busy += 1;
                RetryStrategy::FixedDelay {
                    attempt: counters.conversation_busy,
                    delay: self.config.busy_delay,
                }
            }
            ErrorCategory::ApprovalDesync
            | ErrorCategory::InvalidToolCallIds
            | ErrorCategory::ApprovalPending => {
                if counters.desync >= self.config.desync_max_attempts {
                    return exhausted;
                }
                counters.desync += 1;
                let attempt = counters.desync;
                match category {
                    ErrorCategory::ApprovalDesync => RetryStrategy::StripApprovals { attempt },
                    ErrorCategory::InvalidToolCallIds => RetryStrategy::RefetchApprovals { attempt },
                    _ => RetryStrategy::DenyPendingAndResend { attempt },
                }
            }
            ErrorCategory::Fatal => {
                return RetryDecision::Fatal {
                    category,
                    exhausted: false,
                };
            }
        };

        tracing::debug!(
            category = category.as_str(),
            attempt = strategy.attempt(),
            delay_ms = strategy.delay().as_millis() as u64,
            "Retry scheduled"
        );
        RetryDecision::Retry { category, strategy }
    }

    pub fn classify(&self, failure: &TurnFailure, counters: &mut RetryCounters) -> RetryDecision {
        self.decide(Self::categorize(failure), counters)
    }
}
