//! Turn/approval orchestrator.
//!
//! # Turn state machine
//!
//! ```text
//!                 submit
//!   Idle ───────────────────> Sending ──stream open──> Streaming
//!    ^                          ^  ^                       │
//!    │                 Retrying ┘  │                       │ stop reason
//!    │                    ^        │ results / queued msg  v
//!    │                    │        └────────────── {EndTurn, Cancelled,
//!    │                    └─ retriable failure ──   RequiresApproval, Error}
//!    │                                                     │
//!    └──────── done / fatal / interrupt ───────────────────┘
//!                                                          │ asks left
//!                                                          v
//!                                                   AwaitingReview
//! ```
//!
//! All mutable session state sits behind one mutex that is never held across
//! an await. Every commit after an await goes through [`Orchestrator::lock_live`],
//! which refuses to hand out the state once the turn's generation is stale.
//! [`Orchestrator::interrupt`] bumps the generation while holding the same
//! lock, so a stale continuation can never interleave a write with it.

mod approvals;
mod recovery;

pub use approvals::NEW_MESSAGE_DENIAL;
pub use recovery::SUPERSEDED_APPROVAL_REASON;

use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use relay_types::{
    ApprovalResult, ConversationId, Generation, NonEmptyString, PermissionMode, StopReason,
    StreamEvent, TurnInput,
};
use tokio::runtime::Handle;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::backend::AgentBackend;
use crate::cancellation::{CancellationController, TurnGuard};
use crate::config::OrchestratorSettings;
use crate::errors::{TurnError, format_turn_error};
use crate::events::{BufferDelta, EventSink, NotifyReason, UiEvent};
use crate::executor::{ApprovalExecutor, ToolExecution};
use crate::permissions::{CapabilityTable, PermissionOracle, PermissionPipeline};
use crate::queue::{Enqueued, MessageQueue};
use crate::retry::{RetryCounters, RetryPolicy, TurnFailure};
use crate::review::{ReviewSnapshot, ReviewState};
use crate::streaming::{self, DrainResult, TurnBuffer, TurnStream};
use crate::util::lock_unpoisoned;

// ============================================================================
// Public types
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TurnPhase {
    Idle,
    Sending,
    Streaming,
    Retrying,
    ExecutingTools,
    AwaitingReview,
}

impl TurnPhase {
    /// A turn task currently owns the session.
    #[must_use]
    pub const fn is_busy(self) -> bool {
        !matches!(self, Self::Idle | Self::AwaitingReview)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubmitRejection {
    /// Blank input.
    Empty,
    /// Another turn holds the re-entrancy guard.
    Busy,
}

/// How a call into the orchestrator ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TurnOutcome {
    /// The agent ended its turn and nothing is queued.
    Completed,
    /// Waiting for the user to decide on tool calls.
    AwaitingReview,
    /// The message was queued behind the turn in flight.
    Queued,
    /// The turn stopped without a user interrupt (server cancel, safety net,
    /// or review cancelled with nothing queued).
    Cancelled,
    /// An interrupt superseded the turn; nothing was committed after it.
    Superseded,
    Failed(TurnError),
    Rejected(SubmitRejection),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InterruptOutcome {
    /// Nothing was in flight; the generation is unchanged.
    AlreadyIdle,
    Interrupted(Generation),
}

/// External services the orchestrator drives.
pub struct Collaborators {
    pub backend: Arc<dyn AgentBackend>,
    pub tools: Arc<dyn ToolExecution>,
    pub oracle: Arc<dyn PermissionOracle>,
    pub capabilities: CapabilityTable,
}

// ============================================================================
// State
// ============================================================================

#[derive(Debug)]
struct SessionState {
    phase: TurnPhase,
    queue: MessageQueue,
    review: Option<ReviewState>,
    attended: bool,
    /// Identifies the current queue-cancel window for the safety net.
    cancel_window: u64,
    /// Bumped by every committed mutation.
    revision: u64,
}

struct Inner {
    backend: Arc<dyn AgentBackend>,
    pipeline: PermissionPipeline,
    executor: ApprovalExecutor,
    retry: RetryPolicy,
    cancellation: Arc<CancellationController>,
    events: EventSink,
    conversation: ConversationId,
    cancel_timeout: Duration,
    bell: bool,
    state: Mutex<SessionState>,
}

/// Drives turns for one conversation. Cheap to clone; clones share state.
#[derive(Clone)]
pub struct Orchestrator {
    inner: Arc<Inner>,
}

impl std::fmt::Debug for Orchestrator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Orchestrator")
            .field("conversation", &self.inner.conversation)
            .field("phase", &self.phase())
            .field("generation", &self.generation())
            .finish_non_exhaustive()
    }
}

/// What the turn loop does next.
enum Step {
    Continue(Vec<TurnInput>),
    Done(TurnOutcome),
}

impl Orchestrator {
    #[must_use]
    pub fn new(
        collaborators: Collaborators,
        settings: OrchestratorSettings,
    ) -> (Self, mpsc::UnboundedReceiver<UiEvent>) {
        let Collaborators {
            backend,
            tools,
            oracle,
            capabilities,
        } = collaborators;
        let capabilities = Arc::new(capabilities);
        let (events, rx) = EventSink::channel();

        let inner = Inner {
            backend,
            pipeline: PermissionPipeline::new(
                oracle,
                Arc::clone(&capabilities),
                settings.permission_mode,
            ),
            executor: ApprovalExecutor::new(tools, capabilities),
            retry: RetryPolicy::new(settings.retry),
            cancellation: CancellationController::new(),
            events,
            conversation: settings.conversation_id,
            cancel_timeout: settings.cancel_timeout,
            bell: settings.bell,
            state: Mutex::new(SessionState {
                phase: TurnPhase::Idle,
                queue: MessageQueue::new(),
                review: None,
                attended: settings.attended,
                cancel_window: 0,
                revision: 0,
            }),
        };
        (
            Self {
                inner: Arc::new(inner),
            },
            rx,
        )
    }

    // ------------------------------------------------------------------------
    // Read-only accessors
    // ------------------------------------------------------------------------

    #[must_use]
    pub fn phase(&self) -> TurnPhase {
        self.state().phase
    }

    #[must_use]
    pub fn queue_snapshot(&self) -> Vec<String> {
        self.state().queue.snapshot()
    }

    #[must_use]
    pub fn review_snapshot(&self) -> ReviewSnapshot {
        self.state()
            .review
            .as_ref()
            .map_or_else(ReviewSnapshot::closed, ReviewState::snapshot)
    }

    #[must_use]
    pub fn generation(&self) -> Generation {
        self.inner.cancellation.current_generation()
    }

    #[must_use]
    pub fn cancellation(&self) -> Arc<CancellationController> {
        Arc::clone(&self.inner.cancellation)
    }

    /// Number of committed state mutations so far.
    #[must_use]
    pub fn state_revision(&self) -> u64 {
        self.state().revision
    }

    #[must_use]
    pub fn permission_mode(&self) -> PermissionMode {
        self.inner.pipeline.mode()
    }

    pub fn set_permission_mode(&self, mode: PermissionMode) {
        tracing::info!(mode = mode.as_str(), "Permission mode changed");
        self.inner.pipeline.set_mode(mode);
    }

    /// Unattended sessions ring the bell when a turn ends or needs approval.
    pub fn set_attended(&self, attended: bool) {
        self.state().attended = attended;
    }

    fn state(&self) -> MutexGuard<'_, SessionState> {
        lock_unpoisoned(&self.inner.state)
    }

    /// Lock session state for a commit on behalf of `captured`.
    ///
    /// Returns `None` once an interrupt has superseded that generation.
    fn lock_live(&self, captured: Generation) -> Option<MutexGuard<'_, SessionState>> {
        let mut state = self.state();
        if self.inner.cancellation.is_stale(captured) {
            return None;
        }
        state.revision += 1;
        Some(state)
    }

    fn emit(&self, event: UiEvent) {
        self.inner.events.emit(event);
    }

    fn set_phase(&self, state: &mut SessionState, phase: TurnPhase) {
        let was_busy = state.phase.is_busy();
        state.phase = phase;
        if was_busy != phase.is_busy() {
            self.emit(UiEvent::StreamingChanged(phase.is_busy()));
        }
    }

    fn notify(&self, state: &SessionState, reason: NotifyReason) {
        if self.inner.bell && !state.attended {
            self.emit(UiEvent::Notify(reason));
        }
    }

    fn superseded(&self, captured: Generation) -> TurnOutcome {
        tracing::debug!(
            generation = %captured,
            current = %self.generation(),
            "Discarding superseded turn"
        );
        TurnOutcome::Superseded
    }

    // ------------------------------------------------------------------------
    // Submit / interrupt
    // ------------------------------------------------------------------------

    /// Submit user input.
    ///
    /// Runs the turn to its next resting point when idle. While a turn is in
    /// flight or a review is open the message is queued instead; the first
    /// message queued during streaming also asks the backend to cancel.
    pub async fn submit(&self, text: impl Into<String>) -> TurnOutcome {
        let Ok(message) = NonEmptyString::new(text) else {
            return TurnOutcome::Rejected(SubmitRejection::Empty);
        };

        let (guard, input) = {
            let mut state = self.state();
            if state.phase != TurnPhase::Idle {
                self.enqueue(&mut state, message);
                return TurnOutcome::Queued;
            }

            let guard = match self.inner.cancellation.begin_turn(false) {
                Ok(guard) => guard,
                Err(busy) => {
                    tracing::warn!(active = busy.active, "Submit rejected: turn in flight");
                    return TurnOutcome::Rejected(SubmitRejection::Busy);
                }
            };
            state.revision += 1;
            state.queue.track_dispatched(message.as_str());
            self.set_phase(&mut state, TurnPhase::Sending);
            (guard, self.with_parked(message))
        };

        self.run_turn(guard, input).await
    }

    fn enqueue(&self, state: &mut SessionState, message: NonEmptyString) {
        state.revision += 1;
        let enqueued = state.queue.enqueue(message.into_inner());
        self.emit(UiEvent::QueueChanged(state.queue.snapshot()));

        if state.phase == TurnPhase::Streaming
            && enqueued == Enqueued::First
            && state.queue.begin_cancel_wait()
        {
            state.cancel_window += 1;
            tracing::info!(
                window = state.cancel_window,
                "Message queued while streaming; requesting cancel"
            );
            self.spawn_backend_cancel();
            self.spawn_cancel_safety_net(state.cancel_window);
        }
    }

    /// Supersede everything in flight.
    ///
    /// A no-op while idle. An open review is cancelled (its denials go out
    /// with the next message). Text the agent never saw and anything queued
    /// is handed back to the input surface.
    pub fn interrupt(&self) -> InterruptOutcome {
        let mut state = self.state();
        let phase = state.phase;
        if phase == TurnPhase::Idle {
            tracing::debug!("Interrupt while idle ignored");
            return InterruptOutcome::AlreadyIdle;
        }

        let generation = self.inner.cancellation.interrupt();
        state.revision += 1;
        tracing::info!(generation = %generation, ?phase, "Turn interrupted");

        let mut restore = Vec::new();
        if phase == TurnPhase::AwaitingReview {
            if let Some(review) = state.review.take() {
                self.inner.cancellation.park_cancelled(review.cancel_all());
                self.emit(UiEvent::ApprovalPrompt(ReviewSnapshot::closed()));
            }
        } else {
            self.spawn_backend_cancel();
            restore.extend(state.queue.take_unconfirmed());
        }

        if state.queue.waiting_for_cancel() {
            tracing::info!("Interrupt during cancel window; returning queued input for editing");
        }
        if let Some(queued) = state.queue.take_for_edit() {
            restore.push(queued);
            self.emit(UiEvent::QueueChanged(Vec::new()));
        }

        self.set_phase(&mut state, TurnPhase::Idle);
        self.emit(UiEvent::Interrupted);
        if !restore.is_empty() {
            self.emit(UiEvent::RestoreInput(restore.join("\n")));
        }
        InterruptOutcome::Interrupted(generation)
    }

    fn spawn_backend_cancel(&self) {
        let Ok(handle) = Handle::try_current() else {
            tracing::debug!("No runtime; skipping backend cancel");
            return;
        };
        let backend = Arc::clone(&self.inner.backend);
        let conversation = self.inner.conversation.clone();
        handle.spawn(async move {
            match backend.cancel(&conversation).await {
                Ok(()) => tracing::debug!(conversation = %conversation, "Backend cancel sent"),
                Err(err) => tracing::warn!(error = %err, "Backend cancel failed"),
            }
        });
    }

    /// Force-abort the turn if the backend ignores a queue cancel.
    fn spawn_cancel_safety_net(&self, window: u64) {
        let Ok(handle) = Handle::try_current() else {
            return;
        };
        let this = self.clone();
        let generation = self.generation();
        let token = self.inner.cancellation.turn_token();
        let timeout = self.inner.cancel_timeout;

        handle.spawn(async move {
            tokio::select! {
                () = token.cancelled() => return,
                () = tokio::time::sleep(timeout) => {}
            }
            let state = this.state();
            if this.inner.cancellation.is_stale(generation)
                || !state.queue.waiting_for_cancel()
                || state.cancel_window != window
            {
                return;
            }
            tracing::warn!(
                timeout_secs = timeout.as_secs(),
                "Backend never acknowledged cancel; force-aborting turn"
            );
            token.cancel();
        });
    }

    // ------------------------------------------------------------------------
    // Turn loop
    // ------------------------------------------------------------------------

    /// Parked results first, then the message.
    fn with_parked(&self, message: NonEmptyString) -> Vec<TurnInput> {
        self.inner
            .cancellation
            .take_parked()
            .into_iter()
            .map(TurnInput::Approval)
            .chain(std::iter::once(TurnInput::UserMessage(message)))
            .collect()
    }

    /// Dequeue the queue as the next turn's input.
    fn take_queued_input(&self, state: &mut SessionState) -> Option<Vec<TurnInput>> {
        let text = state.queue.dequeue_all_concatenated()?;
        self.emit(UiEvent::QueueChanged(Vec::new()));
        let message = NonEmptyString::new(text).ok()?;
        tracing::info!("Dispatching queued input");
        Some(self.with_parked(message))
    }

    async fn run_turn(&self, mut guard: TurnGuard, mut input: Vec<TurnInput>) -> TurnOutcome {
        let captured = guard.generation();
        let mut counters = RetryCounters::default();

        loop {
            if guard.is_stale() {
                return self.superseded(captured);
            }
            if guard.abort_token().is_cancelled() {
                match self.on_cancelled(&mut guard, true, Duration::ZERO) {
                    Step::Continue(next) => {
                        counters.reset();
                        input = next;
                        continue;
                    }
                    Step::Done(outcome) => return outcome,
                }
            }

            {
                let Some(mut state) = self.lock_live(captured) else {
                    return self.superseded(captured);
                };
                self.set_phase(&mut state, TurnPhase::Sending);
            }
            tracing::info!(
                generation = %captured,
                items = input.len(),
                approvals = input.iter().filter(|i| i.is_approval()).count(),
                "Sending turn"
            );

            let abort = guard.abort_token().clone();
            let opened = tokio::select! {
                biased;
                () = abort.cancelled() => None,
                opened = self.inner.backend.open_stream(&self.inner.conversation, input.clone()) => Some(opened),
            };
            if guard.is_stale() {
                return self.superseded(captured);
            }

            let step = match opened {
                // Loop top handles the abort.
                None => continue,
                Some(Err(err)) => Err(TurnFailure::PreStream(err)),
                Some(Ok(stream)) => {
                    let Some(drained) = self.drain_stream(captured, stream, &abort).await else {
                        return self.superseded(captured);
                    };
                    tracing::debug!(
                        stop_reason = %drained.stop_reason,
                        approvals = drained.approvals.len(),
                        api_duration = ?drained.api_duration,
                        "Stream drained"
                    );

                    match drained.stop_reason {
                        StopReason::EndTurn => {
                            counters.reset();
                            Ok(self.on_end_turn(captured, &drained))
                        }
                        StopReason::Cancelled => Ok(self.on_cancelled(
                            &mut guard,
                            drained.premature_interrupt,
                            drained.api_duration,
                        )),
                        StopReason::RequiresApproval => {
                            Ok(self.handle_approvals(&mut guard, drained.approvals).await)
                        }
                        StopReason::LlmApiError | StopReason::Error => {
                            Err(self.stream_failure(&drained, &abort).await)
                        }
                    }
                }
            };

            let step = match step {
                Ok(step) => step,
                Err(failure) => self.recover(&mut guard, failure, &mut counters, input).await,
            };
            match step {
                Step::Continue(next) => input = next,
                Step::Done(outcome) => return outcome,
            }
        }
    }

    /// Drain the stream, publishing progress while the turn is live.
    ///
    /// Returns `None` if the turn was superseded.
    async fn drain_stream(
        &self,
        captured: Generation,
        stream: TurnStream,
        abort: &CancellationToken,
    ) -> Option<DrainResult> {
        {
            let mut state = self.lock_live(captured)?;
            self.set_phase(&mut state, TurnPhase::Streaming);
        }

        let mut buffer = TurnBuffer::new();
        let mut thinking = false;
        let mut confirmed = false;
        let drained = streaming::drain(
            stream,
            &mut buffer,
            |event| {
                let Some(mut state) = self.lock_live(captured) else {
                    return;
                };
                match event {
                    StreamEvent::TextDelta(delta) => {
                        if thinking {
                            thinking = false;
                            self.emit(UiEvent::Thinking(false));
                        }
                        self.emit(UiEvent::BufferUpdated(BufferDelta::Text(delta.clone())));
                    }
                    StreamEvent::ReasoningDelta(delta) => {
                        if !thinking {
                            thinking = true;
                            self.emit(UiEvent::Thinking(true));
                        }
                        self.emit(UiEvent::BufferUpdated(BufferDelta::Reasoning(
                            delta.clone(),
                        )));
                    }
                    StreamEvent::RunStarted(_)
                    | StreamEvent::ApprovalRequested(_)
                    | StreamEvent::Error(_)
                    | StreamEvent::Stop(_) => {}
                }
                let is_content = matches!(
                    event,
                    StreamEvent::TextDelta(_)
                        | StreamEvent::ReasoningDelta(_)
                        | StreamEvent::ApprovalRequested(_)
                );
                if is_content && !confirmed {
                    confirmed = true;
                    state.queue.confirm_dispatched();
                }
            },
            abort,
        )
        .await;

        let _state = self.lock_live(captured)?;
        if thinking {
            self.emit(UiEvent::Thinking(false));
        }
        Some(drained)
    }

    fn on_end_turn(&self, captured: Generation, drained: &DrainResult) -> Step {
        let Some(mut state) = self.lock_live(captured) else {
            return Step::Done(self.superseded(captured));
        };
        state.queue.confirm_dispatched();
        self.emit(UiEvent::TurnComplete {
            stop_reason: StopReason::EndTurn,
            api_duration: drained.api_duration,
        });

        if let Some(next) = self.take_queued_input(&mut state) {
            return Step::Continue(next);
        }
        self.set_phase(&mut state, TurnPhase::Idle);
        self.notify(&state, NotifyReason::TurnComplete);
        Step::Done(TurnOutcome::Completed)
    }

    /// The turn stopped without a user interrupt.
    ///
    /// A pending queue cancel dispatches the queue; otherwise the turn ends
    /// and, if the agent never saw the message, it goes back to the input.
    fn on_cancelled(
        &self,
        guard: &mut TurnGuard,
        premature: bool,
        api_duration: Duration,
    ) -> Step {
        let captured = guard.generation();
        let Some(mut state) = self.lock_live(captured) else {
            return Step::Done(self.superseded(captured));
        };

        if !state.queue.is_empty() {
            if !guard.rearm() {
                return Step::Done(self.superseded(captured));
            }
            if let Some(next) = self.take_queued_input(&mut state) {
                return Step::Continue(next);
            }
        }

        state.queue.clear_cancel_wait();
        self.set_phase(&mut state, TurnPhase::Idle);
        self.emit(UiEvent::TurnComplete {
            stop_reason: StopReason::Cancelled,
            api_duration,
        });
        if premature && let Some(text) = state.queue.take_unconfirmed() {
            self.emit(UiEvent::RestoreInput(text));
        }
        Step::Done(TurnOutcome::Cancelled)
    }

    /// End the turn with an error.
    fn fail(&self, captured: Generation, err: TurnError) -> TurnOutcome {
        let Some(mut state) = self.lock_live(captured) else {
            return self.superseded(captured);
        };
        tracing::warn!(error = %err, "Turn failed");
        self.set_phase(&mut state, TurnPhase::Idle);
        self.emit(UiEvent::Error {
            text: format_turn_error(&err),
            hint: err.hint(),
        });

        let mut restore: Vec<String> = state.queue.take_unconfirmed().into_iter().collect();
        if let Some(queued) = state.queue.take_for_edit() {
            restore.push(queued);
            self.emit(UiEvent::QueueChanged(Vec::new()));
        }
        if !restore.is_empty() {
            self.emit(UiEvent::RestoreInput(restore.join("\n")));
        }
        TurnOutcome::Failed(err)
    }

    /// Park results for the next user message when `captured` is stale.
    fn park_if_superseded(&self, captured: Generation, results: Vec<ApprovalResult>) -> bool {
        self.inner.cancellation.park_results(captured, results)
    }
}
