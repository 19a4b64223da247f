//! Approval batches: auto-execution, human review, and finalize.

use std::time::Duration;

use relay_types::{ApprovalRequest, ApprovalResult, PermissionDecision, RuleScope, TurnInput};

use super::{Orchestrator, Step, SubmitRejection, TurnOutcome, TurnPhase};
use crate::cancellation::TurnGuard;
use crate::errors::TurnError;
use crate::events::{NotifyReason, UiEvent};
use crate::executor::{ExecutedApproval, ExecutedBatch, INTERRUPTED_TOOL_RETURN, assemble_results};
use crate::review::{ReviewDecisions, ReviewError, ReviewProgress, ReviewSnapshot, ReviewState};

/// Denial for calls dropped because the user queued a new message.
pub const NEW_MESSAGE_DENIAL: &str = "The user sent a new message instead of answering";

/// Every auto result plus an interrupted denial for each ask item.
fn superseded_results(executed: &ExecutedBatch) -> Vec<ApprovalResult> {
    let mut results = executed.auto_results();
    results.extend(
        executed
            .needs_user_input
            .iter()
            .map(|request| {
                ApprovalResult::denial(request.tool_call_id.clone(), INTERRUPTED_TOOL_RETURN)
            }),
    );
    results
}

impl Orchestrator {
    /// Handle a `requires_approval` stop.
    ///
    /// Auto-allowed calls run, auto-denied calls get denial results, and the
    /// rest go to review. When nothing needs review the results go straight
    /// back to the backend.
    pub(super) async fn handle_approvals(
        &self,
        guard: &mut TurnGuard,
        approvals: Vec<ApprovalRequest>,
    ) -> Step {
        let captured = guard.generation();

        let approvals = if approvals.is_empty() {
            tracing::debug!("Approval stop without requests; fetching pending approvals");
            let abort = guard.abort_token().clone();
            let fetched = tokio::select! {
                biased;
                () = abort.cancelled() => return self.on_cancelled(guard, false, Duration::ZERO),
                fetched = self.inner.backend.pending_approvals(&self.inner.conversation) => fetched,
            };
            match fetched {
                Ok(pending) if !pending.is_empty() => pending,
                Ok(_) => {
                    let err = TurnError::Fatal {
                        message: "Agent requested approval but no tool calls are pending".into(),
                    };
                    return Step::Done(self.fail(captured, err));
                }
                Err(err) => {
                    let err = TurnError::Fatal {
                        message: err.to_string(),
                    };
                    return Step::Done(self.fail(captured, err));
                }
            }
        } else {
            approvals
        };
        let batch_ids: Vec<String> = approvals.iter().map(|r| r.tool_call_id.clone()).collect();

        {
            let Some(mut state) = self.lock_live(captured) else {
                return Step::Done(self.superseded(captured));
            };
            if state.queue.waiting_for_cancel()
                && let Some(next) = self.take_queued_input(&mut state)
            {
                tracing::info!(
                    count = approvals.len(),
                    "Denying approval batch in favour of queued message"
                );
                let denials = approvals.iter().map(|request| {
                    TurnInput::Approval(ApprovalResult::denial(
                        request.tool_call_id.clone(),
                        NEW_MESSAGE_DENIAL,
                    ))
                });
                return Step::Continue(denials.chain(next).collect());
            }
            self.set_phase(&mut state, TurnPhase::ExecutingTools);
        }

        let classified = self.inner.pipeline.classify_batch(approvals);
        let abort = guard.abort_token().clone();
        let on_result = |result: &ApprovalResult| {
            if let Some(_state) = self.lock_live(captured) {
                self.emit(UiEvent::ToolResult(result.clone()));
            }
        };
        let executed = self.inner.executor.execute(classified, &abort, &on_result).await;

        if guard.is_stale() {
            self.park_if_superseded(captured, superseded_results(&executed));
            return Step::Done(self.superseded(captured));
        }
        if executed.interrupted {
            self.inner
                .cancellation
                .park_cancelled(superseded_results(&executed));
            return self.on_cancelled(guard, false, Duration::ZERO);
        }

        if executed.needs_user_input.is_empty() {
            let results = match assemble_results(&batch_ids, executed.auto_results()) {
                Ok(results) => results,
                Err(violation) => return Step::Done(self.fail(captured, violation.into())),
            };
            let mut next: Vec<TurnInput> = results.into_iter().map(TurnInput::Approval).collect();
            if executed.all_denied() {
                let Some(mut state) = self.lock_live(captured) else {
                    return Step::Done(self.superseded(captured));
                };
                next.extend(self.take_queued_input(&mut state).unwrap_or_default());
            }
            return Step::Continue(next);
        }

        let Some(mut state) = self.lock_live(captured) else {
            self.park_if_superseded(captured, superseded_results(&executed));
            return Step::Done(self.superseded(captured));
        };
        let auto_results = executed.auto_results();
        let review = ReviewState::new(batch_ids, auto_results, executed.needs_user_input);
        let snapshot = review.snapshot();
        tracing::info!(pending = review.len(), "Opening approval review");
        state.review = Some(review);
        self.set_phase(&mut state, TurnPhase::AwaitingReview);
        self.emit(UiEvent::ApprovalPrompt(snapshot));
        self.notify(&state, NotifyReason::ApprovalNeeded);
        Step::Done(TurnOutcome::AwaitingReview)
    }

    // ------------------------------------------------------------------------
    // Review operations
    // ------------------------------------------------------------------------

    /// Approve the active review item.
    pub async fn approve(&self, index: usize) -> Result<TurnOutcome, ReviewError> {
        self.decide(|review| review.approve(index)).await
    }

    /// Deny the active review item.
    pub async fn deny(
        &self,
        index: usize,
        reason: impl Into<String>,
    ) -> Result<TurnOutcome, ReviewError> {
        let reason = reason.into();
        self.decide(move |review| review.deny(index, reason)).await
    }

    /// Approve the active item and save an allow rule for it.
    ///
    /// Pending items are re-checked against the new rule; if every one of
    /// them is now allowed the review completes immediately.
    pub async fn approve_always(
        &self,
        index: usize,
        scope: RuleScope,
    ) -> Result<TurnOutcome, ReviewError> {
        self.decide(|review| {
            let active = review
                .active()
                .filter(|_| review.active_index() == index)
                .cloned()
                .ok_or(ReviewError::NotActive {
                    index,
                    active: review.active_index(),
                })?;
            let rule = self
                .inner
                .pipeline
                .approve_always(&active, scope)
                .map_err(|err| ReviewError::RuleStore(err.to_string()))?;
            tracing::info!(rule = %rule, scope = scope.as_str(), "Saved allow rule");

            let all_allowed = review
                .pending()
                .iter()
                .all(|request| self.inner.pipeline.classify(request) == PermissionDecision::Allow);
            if all_allowed {
                review.approve_remaining(index)
            } else {
                review.approve(index)
            }
        })
        .await
    }

    async fn decide(
        &self,
        record: impl FnOnce(&mut ReviewState) -> Result<ReviewProgress, ReviewError>,
    ) -> Result<TurnOutcome, ReviewError> {
        let (guard, decisions) = {
            let mut state = self.state();
            let progress = {
                let review = state.review.as_mut().ok_or(ReviewError::NoReview)?;
                record(review)?
            };
            state.revision += 1;

            match progress {
                ReviewProgress::Next(_) => {
                    let snapshot = state
                        .review
                        .as_ref()
                        .map_or_else(ReviewSnapshot::closed, ReviewState::snapshot);
                    self.emit(UiEvent::ApprovalPrompt(snapshot));
                    return Ok(TurnOutcome::AwaitingReview);
                }
                ReviewProgress::Complete => {}
            }

            let Some(review) = state.review.take() else {
                return Err(ReviewError::NoReview);
            };
            self.emit(UiEvent::ApprovalPrompt(ReviewSnapshot::closed()));
            let guard = match self.inner.cancellation.begin_turn(true) {
                Ok(guard) => guard,
                Err(busy) => {
                    tracing::warn!(active = busy.active, "Could not resume turn after review");
                    return Ok(TurnOutcome::Rejected(SubmitRejection::Busy));
                }
            };
            self.set_phase(&mut state, TurnPhase::ExecutingTools);
            (guard, review.into_decisions())
        };

        Ok(self.finalize(guard, decisions).await)
    }

    /// Run approved calls, assemble the full batch, and resume the turn.
    async fn finalize(&self, mut guard: TurnGuard, decisions: ReviewDecisions) -> TurnOutcome {
        let captured = guard.generation();
        let abort = guard.abort_token().clone();
        let on_result = |result: &ApprovalResult| {
            if let Some(_state) = self.lock_live(captured) {
                self.emit(UiEvent::ToolResult(result.clone()));
            }
        };
        let ReviewDecisions {
            batch_ids,
            auto_results,
            approved,
            denied,
        } = decisions;
        let (executed, interrupted) = self
            .inner
            .executor
            .run_allowed(approved, &abort, &on_result)
            .await;

        let ran_any = !executed.is_empty();
        let mut results = auto_results;
        results.extend(executed.iter().map(ExecutedApproval::to_result));
        results.extend(denied);

        if guard.is_stale() {
            self.park_if_superseded(captured, results);
            return self.superseded(captured);
        }
        if interrupted {
            self.inner.cancellation.park_cancelled(results);
            return match self.on_cancelled(&mut guard, false, Duration::ZERO) {
                Step::Continue(next) => self.run_turn(guard, next).await,
                Step::Done(outcome) => outcome,
            };
        }

        let results = match assemble_results(&batch_ids, results) {
            Ok(results) => results,
            Err(violation) => return self.fail(captured, violation.into()),
        };
        let all_denied = !ran_any && results.iter().all(ApprovalResult::is_denial);
        let mut input: Vec<TurnInput> = results.into_iter().map(TurnInput::Approval).collect();
        if all_denied {
            let Some(mut state) = self.lock_live(captured) else {
                return self.superseded(captured);
            };
            input.extend(self.take_queued_input(&mut state).unwrap_or_default());
        }

        self.run_turn(guard, input).await
    }

    /// Abandon the open review.
    ///
    /// Undecided items are denied. With a message queued the denials go out
    /// with it right away; otherwise they wait for the next message.
    pub async fn cancel_all(&self) -> Result<TurnOutcome, ReviewError> {
        let (guard, input) = {
            let mut state = self.state();
            let review = state.review.take().ok_or(ReviewError::NoReview)?;
            state.revision += 1;
            self.emit(UiEvent::ApprovalPrompt(ReviewSnapshot::closed()));

            let batch_ids = review.batch_ids().to_vec();
            let results = match assemble_results(&batch_ids, review.cancel_all()) {
                Ok(results) => results,
                Err(violation) => {
                    drop(state);
                    return Ok(self.fail(self.generation(), TurnError::from(violation)));
                }
            };
            tracing::info!(count = results.len(), "Approval review cancelled");
            self.inner.cancellation.park_cancelled(results);

            if state.queue.is_empty() {
                self.set_phase(&mut state, TurnPhase::Idle);
                return Ok(TurnOutcome::Cancelled);
            }
            let guard = match self.inner.cancellation.begin_turn(true) {
                Ok(guard) => guard,
                Err(busy) => {
                    tracing::warn!(active = busy.active, "Could not dispatch queue after review");
                    return Ok(TurnOutcome::Rejected(SubmitRejection::Busy));
                }
            };
            let Some(input) = self.take_queued_input(&mut state) else {
                self.set_phase(&mut state, TurnPhase::Idle);
                return Ok(TurnOutcome::Cancelled);
            };
            self.set_phase(&mut state, TurnPhase::Sending);
            (guard, input)
        };

        Ok(self.run_turn(guard, input).await)
    }

    /// Results parked for the next message.
    #[must_use]
    pub fn parked_results(&self) -> usize {
        self.inner.cancellation.parked_count()
    }
}
