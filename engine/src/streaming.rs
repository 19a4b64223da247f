//! Turn stream draining.
//!
//! A [`TurnStream`] is the receiving end of an ordered event channel that the
//! backend fills. [`drain`] consumes it into a [`TurnBuffer`] until the stop
//! event arrives, the channel closes, or the abort token fires.

use std::time::Duration;

use relay_types::{ApprovalRequest, RunId, StopReason, StreamEvent};
use tokio::sync::mpsc;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

pub const STREAM_EVENT_CHANNEL_CAPACITY: usize = 1024;

const MISSING_STOP_DETAIL: &str = "stream ended without a stop reason";

#[derive(Debug)]
pub struct TurnStream {
    rx: mpsc::Receiver<StreamEvent>,
}

impl TurnStream {
    #[must_use]
    pub fn new(rx: mpsc::Receiver<StreamEvent>) -> Self {
        Self { rx }
    }

    #[must_use]
    pub fn channel() -> (mpsc::Sender<StreamEvent>, Self) {
        Self::with_capacity(STREAM_EVENT_CHANNEL_CAPACITY)
    }

    #[must_use]
    pub fn with_capacity(capacity: usize) -> (mpsc::Sender<StreamEvent>, Self) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        (tx, Self::new(rx))
    }

    /// A stream pre-filled with `events`, closed after the last one.
    #[must_use]
    pub fn from_events(events: Vec<StreamEvent>) -> Self {
        let (tx, stream) = Self::with_capacity(events.len());
        for event in events {
            if let Err(err) = tx.try_send(event) {
                tracing::debug!(error = %err, "Dropped pre-filled stream event");
            }
        }
        stream
    }

    async fn next(&mut self) -> Option<StreamEvent> {
        self.rx.recv().await
    }
}

/// Per-turn message ledger. Owned by the orchestrator loop.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct TurnBuffer {
    pub text: String,
    pub reasoning: String,
    pub approvals: Vec<ApprovalRequest>,
    pub errors: Vec<String>,
    pub run_id: Option<RunId>,
    content_chunks: usize,
}

impl TurnBuffer {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Content chunks (text, reasoning, approvals) received so far.
    #[must_use]
    pub fn content_chunks(&self) -> usize {
        self.content_chunks
    }

    fn apply(&mut self, event: &StreamEvent) {
        match event {
            StreamEvent::RunStarted(run_id) => self.run_id = Some(run_id.clone()),
            StreamEvent::TextDelta(delta) => {
                self.text.push_str(delta);
                self.content_chunks += 1;
            }
            StreamEvent::ReasoningDelta(delta) => {
                self.reasoning.push_str(delta);
                self.content_chunks += 1;
            }
            StreamEvent::ApprovalRequested(request) => {
                self.approvals.push(request.clone());
                self.content_chunks += 1;
            }
            StreamEvent::Error(detail) => self.errors.push(detail.clone()),
            StreamEvent::Stop(_) => {}
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DrainResult {
    pub stop_reason: StopReason,
    pub approvals: Vec<ApprovalRequest>,
    pub api_duration: Duration,
    pub last_run_id: Option<RunId>,
    /// Aborted before any content chunk arrived.
    pub premature_interrupt: bool,
    /// Last error detail attached to the run, if any.
    pub error_detail: Option<String>,
}

/// Drain `stream` into `buffer`.
///
/// `on_progress` sees every event after it has been applied to the buffer.
/// An abort yields [`StopReason::Cancelled`]; a channel that closes without
/// a stop event yields [`StopReason::Error`].
pub async fn drain(
    mut stream: TurnStream,
    buffer: &mut TurnBuffer,
    mut on_progress: impl FnMut(&StreamEvent),
    abort: &CancellationToken,
) -> DrainResult {
    let started = Instant::now();

    let stop_reason = loop {
        let event = tokio::select! {
            biased;
            () = abort.cancelled() => {
                tracing::debug!(chunks = buffer.content_chunks, "Stream drain aborted");
                break StopReason::Cancelled;
            }
            event = stream.next() => event,
        };

        let Some(event) = event else {
            tracing::warn!(chunks = buffer.content_chunks, "{MISSING_STOP_DETAIL}");
            buffer.errors.push(MISSING_STOP_DETAIL.to_string());
            break StopReason::Error;
        };

        buffer.apply(&event);
        on_progress(&event);
        if let StreamEvent::Stop(reason) = event {
            break reason;
        }
    };

    DrainResult {
        stop_reason,
        approvals: buffer.approvals.clone(),
        api_duration: started.elapsed(),
        last_run_id: buffer.run_id.clone(),
        premature_interrupt: stop_reason == StopReason::Cancelled
            && abort.is_cancelled()
            && buffer.content_chunks == 0,
        error_detail: buffer.errors.last().cloned(),
    }
}
