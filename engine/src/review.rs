//! Sequential human review of the needs-user-input bucket.
//!
//! # State machine
//!
//! ```text
//!            approve(i) / deny(i)            approve(n-1) / deny(n-1)
//!  index 0 ─────────────────────> i + 1 ... ─────────────────────────> Complete
//!     │                                                                    │
//!     └──────── cancel_all ──> every undecided item denied ─────────────── ┘
//! ```
//!
//! The index is the number of decisions recorded so far: item `index` is the
//! active prompt, items before it are decided, items after it are pending.
//! Only the active item can be decided.

use relay_types::{ApprovalOutcome, ApprovalRequest, ApprovalResult};

/// Denial reason for items dropped by [`ReviewState::cancel_all`].
pub const USER_CANCELLED_REASON: &str = "user cancelled";

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ReviewError {
    #[error("no approval review is open")]
    NoReview,
    #[error("approval {index} is not active (active: {active})")]
    NotActive { index: usize, active: usize },
    #[error("failed to save permission rule: {0}")]
    RuleStore(String),
}

/// What the UI shows for an open review.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReviewSnapshot {
    pub active_index: usize,
    pub total: usize,
    pub active: Option<ApprovalRequest>,
    /// Not yet reached, in review order.
    pub pending: Vec<ApprovalRequest>,
    /// Decided so far, in review order.
    pub decided: Vec<ApprovalOutcome>,
}

impl ReviewSnapshot {
    /// Snapshot of a closed review.
    #[must_use]
    pub fn closed() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn is_open(&self) -> bool {
        self.active.is_some()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReviewProgress {
    /// Show the item at this index next.
    Next(usize),
    /// Every item is decided; finalize the batch.
    Complete,
}

/// Everything a completed review hands to finalize.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReviewDecisions {
    pub batch_ids: Vec<String>,
    /// Results produced before review (auto-allowed and auto-denied).
    pub auto_results: Vec<ApprovalResult>,
    pub approved: Vec<ApprovalRequest>,
    pub denied: Vec<ApprovalResult>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReviewState {
    batch_ids: Vec<String>,
    auto_results: Vec<ApprovalResult>,
    items: Vec<ApprovalRequest>,
    decisions: Vec<ApprovalOutcome>,
}

impl ReviewState {
    /// Open a review over `items`.
    ///
    /// `batch_ids` lists every tool call id of the incoming batch in arrival
    /// order; `auto_results` holds what the executor already produced.
    #[must_use]
    pub fn new(
        batch_ids: Vec<String>,
        auto_results: Vec<ApprovalResult>,
        items: Vec<ApprovalRequest>,
    ) -> Self {
        Self {
            batch_ids,
            auto_results,
            items,
            decisions: Vec::new(),
        }
    }

    #[must_use]
    pub fn active_index(&self) -> usize {
        self.decisions.len()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.items.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    #[must_use]
    pub fn is_complete(&self) -> bool {
        self.decisions.len() >= self.items.len()
    }

    #[must_use]
    pub fn active(&self) -> Option<&ApprovalRequest> {
        self.items.get(self.active_index())
    }

    /// Undecided items after the active one.
    #[must_use]
    pub fn pending(&self) -> &[ApprovalRequest] {
        self.items
            .get(self.active_index() + 1..)
            .unwrap_or_default()
    }

    #[must_use]
    pub fn snapshot(&self) -> ReviewSnapshot {
        ReviewSnapshot {
            active_index: self.active_index(),
            total: self.items.len(),
            active: self.active().cloned(),
            pending: self.pending().to_vec(),
            decided: self.decisions.clone(),
        }
    }

    fn check_active(&self, index: usize) -> Result<(), ReviewError> {
        let active = self.active_index();
        if index != active || self.is_complete() {
            return Err(ReviewError::NotActive { index, active });
        }
        Ok(())
    }

    fn advance(&self) -> ReviewProgress {
        if self.is_complete() {
            ReviewProgress::Complete
        } else {
            ReviewProgress::Next(self.active_index())
        }
    }

    pub fn approve(&mut self, index: usize) -> Result<ReviewProgress, ReviewError> {
        self.check_active(index)?;
        self.decisions
            .push(ApprovalOutcome::Approved(self.items[index].clone()));
        Ok(self.advance())
    }

    pub fn deny(&mut self, index: usize, reason: impl Into<String>) -> Result<ReviewProgress, ReviewError> {
        self.check_active(index)?;
        self.decisions
            .push(ApprovalOutcome::denied(self.items[index].clone(), reason));
        Ok(self.advance())
    }

    /// Approve the active item and every pending one.
    ///
    /// Used when a saved rule turned all remaining items into auto-allows.
    pub fn approve_remaining(&mut self, index: usize) -> Result<ReviewProgress, ReviewError> {
        self.check_active(index)?;
        let start = self.active_index();
        for item in &self.items[start..] {
            self.decisions.push(ApprovalOutcome::Approved(item.clone()));
        }
        Ok(ReviewProgress::Complete)
    }

    /// Split a completed review into what finalize needs.
    #[must_use]
    pub fn into_decisions(self) -> ReviewDecisions {
        let mut approved = Vec::new();
        let mut denied = Vec::new();
        for outcome in self.decisions {
            match outcome {
                ApprovalOutcome::Approved(request) => approved.push(request),
                outcome @ ApprovalOutcome::Denied { .. } => {
                    denied.extend(ApprovalResult::from_denied(&outcome));
                }
            }
        }
        ReviewDecisions {
            batch_ids: self.batch_ids,
            auto_results: self.auto_results,
            approved,
            denied,
        }
    }

    /// Abandon the review.
    ///
    /// Auto-allowed calls already ran and keep their results; recorded
    /// denials keep their reason; everything else is denied with
    /// [`USER_CANCELLED_REASON`].
    #[must_use]
    pub fn cancel_all(self) -> Vec<ApprovalResult> {
        let mut results = self.auto_results;
        for outcome in &self.decisions {
            match outcome {
                ApprovalOutcome::Approved(request) => results.push(ApprovalResult::denial(
                    request.tool_call_id.clone(),
                    USER_CANCELLED_REASON,
                )),
                ApprovalOutcome::Denied { .. } => {
                    results.extend(ApprovalResult::from_denied(outcome));
                }
            }
        }
        for request in self.items.iter().skip(self.decisions.len()) {
            results.push(ApprovalResult::denial(
                request.tool_call_id.clone(),
                USER_CANCELLED_REASON,
            ));
        }
        results
    }

    #[must_use]
    pub fn batch_ids(&self) -> &[String] {
        &self.batch_ids
    }
}
