//! Backpressure buffer for user messages submitted while a turn is busy.

use std::collections::VecDeque;

/// What an enqueue changed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Enqueued {
    /// The queue was empty; the caller decides whether to request a cancel.
    First,
    /// Appended behind earlier entries.
    Appended { len: usize },
}

/// FIFO of raw user inputs.
///
/// Dispatch joins every entry with `\n` into one logical message. The most
/// recent dispatched message is held as unconfirmed until the turn carrying
/// it produces output, so it can be handed back to the input surface if the
/// turn fails first.
#[derive(Debug, Default, Clone)]
pub struct MessageQueue {
    entries: VecDeque<String>,
    waiting_for_cancel: bool,
    unconfirmed: Option<String>,
}

impl MessageQueue {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn enqueue(&mut self, text: impl Into<String>) -> Enqueued {
        self.entries.push_back(text.into());
        if self.entries.len() == 1 {
            Enqueued::First
        } else {
            Enqueued::Appended {
                len: self.entries.len(),
            }
        }
    }

    #[must_use]
    pub fn snapshot(&self) -> Vec<String> {
        self.entries.iter().cloned().collect()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Take every entry as one newline-joined message and remember it as
    /// unconfirmed. Clears the cancel-wait flag.
    pub fn dequeue_all_concatenated(&mut self) -> Option<String> {
        let joined = self.join_and_clear()?;
        self.unconfirmed = Some(joined.clone());
        Some(joined)
    }

    /// Take every entry for editing instead of sending. Nothing is marked
    /// unconfirmed.
    pub fn take_for_edit(&mut self) -> Option<String> {
        self.join_and_clear()
    }

    fn join_and_clear(&mut self) -> Option<String> {
        self.waiting_for_cancel = false;
        if self.entries.is_empty() {
            return None;
        }
        let joined = self.entries.drain(..).collect::<Vec<_>>().join("\n");
        Some(joined)
    }

    /// Roll a dequeued message back to the head of the queue.
    pub fn restore_last(&mut self, text: impl Into<String>) {
        let text = text.into();
        if self.unconfirmed.as_deref() == Some(text.as_str()) {
            self.unconfirmed = None;
        }
        self.entries.push_front(text);
    }

    /// Remember a directly submitted message as unconfirmed.
    pub fn track_dispatched(&mut self, text: impl Into<String>) {
        self.unconfirmed = Some(text.into());
    }

    /// The turn carrying the last dispatched message produced output.
    pub fn confirm_dispatched(&mut self) {
        self.unconfirmed = None;
    }

    #[must_use]
    pub fn take_unconfirmed(&mut self) -> Option<String> {
        self.unconfirmed.take()
    }

    #[must_use]
    pub fn has_unconfirmed(&self) -> bool {
        self.unconfirmed.is_some()
    }

    /// Set the cancel-wait flag. Returns `false` if it was already set.
    pub fn begin_cancel_wait(&mut self) -> bool {
        !std::mem::replace(&mut self.waiting_for_cancel, true)
    }

    #[must_use]
    pub fn waiting_for_cancel(&self) -> bool {
        self.waiting_for_cancel
    }

    pub fn clear_cancel_wait(&mut self) {
        self.waiting_for_cancel = false;
    }
}
