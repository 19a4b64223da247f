//! Events published to the UI layer.
//!
//! The orchestrator never hands the UI a reference into its state; every
//! event carries an owned snapshot.

use std::time::Duration;

use relay_types::{ApprovalResult, StopReason};
use tokio::sync::mpsc;

use crate::retry::ErrorCategory;
use crate::review::ReviewSnapshot;

/// Why the terminal bell should ring.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NotifyReason {
    TurnComplete,
    ApprovalNeeded,
}

/// Streamed content appended to the turn buffer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BufferDelta {
    Text(String),
    Reasoning(String),
}

#[derive(Debug, Clone, PartialEq)]
pub enum UiEvent {
    /// Streaming indicator on or off.
    StreamingChanged(bool),
    /// Reasoning indicator on or off.
    Thinking(bool),
    BufferUpdated(BufferDelta),
    /// One auto-handled or executed tool call finished.
    ToolResult(ApprovalResult),
    /// Review state changed; `None` active item means review closed.
    ApprovalPrompt(ReviewSnapshot),
    /// Current queue contents, oldest first.
    QueueChanged(Vec<String>),
    /// A recoverable failure is being retried.
    Retrying {
        category: ErrorCategory,
        attempt: u32,
        delay: Duration,
    },
    /// One transcript line, with the feedback hint when applicable.
    Error {
        text: String,
        hint: Option<&'static str>,
    },
    Interrupted,
    /// Put text back into the input field.
    RestoreInput(String),
    TurnComplete {
        stop_reason: StopReason,
        api_duration: Duration,
    },
    Notify(NotifyReason),
}

/// Sending half of the UI channel.
///
/// A closed receiver is not an error: the UI may shut down before the
/// orchestrator does.
#[derive(Debug, Clone)]
pub struct EventSink {
    tx: mpsc::UnboundedSender<UiEvent>,
}

impl EventSink {
    #[must_use]
    pub fn channel() -> (Self, mpsc::UnboundedReceiver<UiEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }

    pub fn emit(&self, event: UiEvent) {
        if self.tx.send(event).is_err() {
            tracing::trace!("UI channel closed; dropping event");
        }
    }
}
