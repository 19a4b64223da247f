//! Failure recovery: turn a classified failure into the next input.

use std::collections::HashSet;

use relay_types::{ApprovalRequest, ApprovalResult, NonEmptyStaticStr, StopReason, TurnInput};
use tokio_util::sync::CancellationToken;

use super::{Orchestrator, Step, TurnPhase};
use crate::backend::BackendError;
use crate::cancellation::TurnGuard;
use crate::errors::TurnError;
use crate::events::UiEvent;
use crate::retry::{ErrorCategory, RetryCounters, RetryDecision, RetryStrategy, TurnFailure};
use crate::streaming::DrainResult;

/// Sent when stripping stale approvals leaves nothing to resend.
const KEEP_ALIVE_MESSAGE: NonEmptyStaticStr = NonEmptyStaticStr::new("continue");

/// Denial for approvals the backend still holds when a new message goes out.
pub const SUPERSEDED_APPROVAL_REASON: &str = "Auto-denied: superseded by a new message";

/// Drop approval results, keeping user messages.
///
/// Falls back to a keep-alive message so the resend is never empty.
fn strip_approvals(input: Vec<TurnInput>) -> Vec<TurnInput> {
    let kept: Vec<TurnInput> = input.into_iter().filter(|i| !i.is_approval()).collect();
    if kept.is_empty() {
        vec![TurnInput::UserMessage(KEEP_ALIVE_MESSAGE.into())]
    } else {
        kept
    }
}

/// Deny every pending request the input does not already answer, then resend.
fn deny_unanswered(pending: &[ApprovalRequest], input: Vec<TurnInput>) -> Vec<TurnInput> {
    let answered: HashSet<&str> = input
        .iter()
        .filter_map(TurnInput::approval)
        .map(ApprovalResult::tool_call_id)
        .collect();
    let denials: Vec<TurnInput> = pending
        .iter()
        .filter(|request| !answered.contains(request.tool_call_id.as_str()))
        .map(|request| {
            TurnInput::Approval(ApprovalResult::denial(
                request.tool_call_id.clone(),
                SUPERSEDED_APPROVAL_REASON,
            ))
        })
        .collect();
    denials.into_iter().chain(input).collect()
}

impl Orchestrator {
    /// Build a stream failure, pulling the run's own error text when the
    /// stream stopped with a generic error.
    pub(super) async fn stream_failure(
        &self,
        drained: &DrainResult,
        abort: &CancellationToken,
    ) -> TurnFailure {
        let mut run_error = None;
        if drained.stop_reason == StopReason::Error
            && let Some(run_id) = &drained.last_run_id
        {
            let fetched = tokio::select! {
                biased;
                () = abort.cancelled() => None,
                fetched = self.inner.backend.retrieve_run(run_id) => Some(fetched),
            };
            match fetched {
                Some(Ok(metadata)) => run_error = metadata.error,
                Some(Err(err)) => {
                    tracing::warn!(run_id = %run_id, error = %err, "Failed to retrieve run metadata");
                }
                None => {}
            }
        }

        TurnFailure::Stream {
            stop_reason: drained.stop_reason,
            detail: drained.error_detail.clone(),
            run_error,
        }
    }

    /// Pending approvals, or `None` if the turn was aborted while fetching.
    async fn fetch_pending(
        &self,
        guard: &TurnGuard,
    ) -> Option<Result<Vec<ApprovalRequest>, BackendError>> {
        let abort = guard.abort_token().clone();
        tokio::select! {
            biased;
            () = abort.cancelled() => None,
            pending = self.inner.backend.pending_approvals(&self.inner.conversation) => Some(pending),
        }
    }

    pub(super) async fn recover(
        &self,
        guard: &mut TurnGuard,
        failure: TurnFailure,
        counters: &mut RetryCounters,
        input: Vec<TurnInput>,
    ) -> Step {
        let captured = guard.generation();
        if guard.is_stale() {
            return Step::Done(self.superseded(captured));
        }
        // Loop top turns an abort into cancel handling.
        if guard.abort_token().is_cancelled() {
            return Step::Continue(input);
        }

        let (category, strategy) = match self.inner.retry.classify(&failure, counters) {
            RetryDecision::Retry { category, strategy } => (category, strategy),
            RetryDecision::Fatal {
                category,
                exhausted,
            } => {
                let retries = match category {
                    ErrorCategory::TransientLlm => counters.llm_api_error,
                    ErrorCategory::ConversationBusy => counters.conversation_busy,
                    ErrorCategory::Fatal => 0,
                    ErrorCategory::ApprovalDesync
                    | ErrorCategory::InvalidToolCallIds
                    | ErrorCategory::ApprovalPending => counters.desync,
                };
                tracing::warn!(
                    category = category.as_str(),
                    exhausted,
                    retries,
                    "Giving up on turn"
                );
                let err = TurnError::from_category(category, retries, failure.message());
                return Step::Done(self.fail(captured, err));
            }
        };

        // A message queued during a cancel window supersedes the retry.
        {
            let Some(mut state) = self.lock_live(captured) else {
                return Step::Done(self.superseded(captured));
            };
            if state.queue.waiting_for_cancel() {
                if !guard.rearm() {
                    return Step::Done(self.superseded(captured));
                }
                if let Some(next) = self.take_queued_input(&mut state) {
                    tracing::info!(
                        category = category.as_str(),
                        "Dispatching queued message instead of retrying"
                    );
                    counters.reset();
                    // Results the backend never received still answer its batch.
                    let unsent: Vec<TurnInput> = match failure {
                        TurnFailure::PreStream(_) => {
                            input.into_iter().filter(TurnInput::is_approval).collect()
                        }
                        TurnFailure::Stream { .. } => Vec::new(),
                    };
                    return Step::Continue(unsent.into_iter().chain(next).collect());
                }
            }
        }

        tracing::info!(
            category = category.as_str(),
            attempt = strategy.attempt(),
            delay = ?strategy.delay(),
            "Recovering from turn failure"
        );

        match strategy {
            RetryStrategy::Backoff { attempt, delay }
            | RetryStrategy::FixedDelay { attempt, delay } => {
                {
                    let Some(mut state) = self.lock_live(captured) else {
                        return Step::Done(self.superseded(captured));
                    };
                    self.set_phase(&mut state, TurnPhase::Retrying);
                    self.emit(UiEvent::Retrying {
                        category,
                        attempt,
                        delay,
                    });
                }
                let abort = guard.abort_token().clone();
                tokio::select! {
                    biased;
                    () = abort.cancelled() => {}
                    () = tokio::time::sleep(delay) => {}
                }
                Step::Continue(input)
            }
            RetryStrategy::StripApprovals { .. } => Step::Continue(strip_approvals(input)),
            RetryStrategy::RefetchApprovals { .. } => {
                let pending = match self.fetch_pending(guard).await {
                    None => return Step::Continue(input),
                    Some(Ok(pending)) => pending,
                    Some(Err(err)) => {
                        let err = TurnError::InvalidToolCallIds {
                            message: err.to_string(),
                        };
                        return Step::Done(self.fail(captured, err));
                    }
                };
                if pending.is_empty() {
                    return Step::Continue(strip_approvals(input));
                }

                // Messages from the failed send wait behind the re-review.
                {
                    let Some(mut state) = self.lock_live(captured) else {
                        return Step::Done(self.superseded(captured));
                    };
                    let messages: Vec<&str> = input.iter().filter_map(TurnInput::user_text).collect();
                    if !messages.is_empty() {
                        for text in messages.into_iter().rev() {
                            state.queue.restore_last(text);
                        }
                        self.emit(UiEvent::QueueChanged(state.queue.snapshot()));
                    }
                }
                self.handle_approvals(guard, pending).await
            }
            RetryStrategy::DenyPendingAndResend { .. } => {
                let pending = match self.fetch_pending(guard).await {
                    None => return Step::Continue(input),
                    Some(Ok(pending)) => pending,
                    Some(Err(err)) => {
                        let err = TurnError::ApprovalPending {
                            message: err.to_string(),
                        };
                        return Step::Done(self.fail(captured, err));
                    }
                };
                Step::Continue(deny_unanswered(&pending, input))
            }
        }
    }
}
