//! Interrupt generations, per-turn abort tokens and the re-entrancy guard.
//!
//! # Supersession
//!
//! ```text
//!   turn task                         interrupt()
//!   ─────────                         ───────────
//!   captured = current_generation()
//!   await network / tool ...          generation += 1
//!                                     cancel turn token
//!                                     active turns := 0
//!   is_stale(captured)? ── yes ──> exit without touching shared state
//! ```
//!
//! Every continuation that resumes after an await re-checks [`is_stale`]
//! before committing. A stale continuation never decrements the guard: the
//! interrupt already reset it so a new turn can start immediately.
//!
//! [`is_stale`]: CancellationController::is_stale

use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use relay_types::{ApprovalResult, Generation};
use tokio_util::sync::CancellationToken;

use crate::util::lock_unpoisoned;

/// Returned when a turn is already in flight and re-entry was not requested.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
#[error("a turn is already in flight ({active} active)")]
pub struct TurnBusy {
    pub active: usize,
}

/// Owner of the values that define what "superseded" means.
///
/// Shared by `Arc` between the orchestrator and whatever drives the UI.
#[derive(Debug)]
pub struct CancellationController {
    generation: AtomicU64,
    active_turns: AtomicUsize,
    turn_token: Mutex<CancellationToken>,
    /// Results of tool executions that were running when an interrupt landed.
    /// They go out with the next user message instead of the current turn.
    parked: Mutex<Vec<ApprovalResult>>,
}

impl Default for CancellationController {
    fn default() -> Self {
        Self {
            generation: AtomicU64::new(0),
            active_turns: AtomicUsize::new(0),
            turn_token: Mutex::new(CancellationToken::new()),
            parked: Mutex::new(Vec::new()),
        }
    }
}

impl CancellationController {
    #[must_use]
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    #[must_use]
    pub fn current_generation(&self) -> Generation {
        Generation::new(self.generation.load(Ordering::SeqCst))
    }

    #[must_use]
    pub fn is_stale(&self, captured: Generation) -> bool {
        self.current_generation() != captured
    }

    /// Supersede everything in flight.
    ///
    /// Bumps the generation, raises the abort signal of the current turn,
    /// zeroes the re-entrancy guard and installs a fresh token for the next
    /// turn. Returns the new generation.
    pub fn interrupt(&self) -> Generation {
        let next = self.generation.fetch_add(1, Ordering::SeqCst).saturating_add(1);
        {
            let mut token = lock_unpoisoned(&self.turn_token);
            token.cancel();
            *token = CancellationToken::new();
        }
        self.active_turns.store(0, Ordering::SeqCst);
        tracing::debug!(generation = next, "Interrupt raised");
        Generation::new(next)
    }

    /// Abort token of the turn currently in flight.
    #[must_use]
    pub fn turn_token(&self) -> CancellationToken {
        lock_unpoisoned(&self.turn_token).clone()
    }

    #[must_use]
    pub fn active_turns(&self) -> usize {
        self.active_turns.load(Ordering::SeqCst)
    }

    /// Claim the re-entrancy guard.
    ///
    /// A fresh claim (`allow_reentry == false`) succeeds only when no turn is
    /// active. Re-entry is reserved for continuing an existing exchange, e.g.
    /// sending reviewed tool results, and never fails. Either way the guard
    /// gets a live abort token.
    pub fn begin_turn(self: &Arc<Self>, allow_reentry: bool) -> Result<TurnGuard, TurnBusy> {
        if allow_reentry {
            self.active_turns.fetch_add(1, Ordering::SeqCst);
        } else {
            self.active_turns
                .compare_exchange(0, 1, Ordering::SeqCst, Ordering::SeqCst)
                .map_err(|active| TurnBusy { active })?;
        }

        let mut token = lock_unpoisoned(&self.turn_token);
        if token.is_cancelled() {
            *token = CancellationToken::new();
        }
        Ok(TurnGuard {
            controller: Arc::clone(self),
            generation: self.current_generation(),
            token: token.clone(),
        })
    }

    /// Park results produced by work that an interrupt superseded.
    ///
    /// Only accepted from a generation that was actually interrupted; results
    /// from live work belong to the live turn.
    pub fn park_results(&self, captured: Generation, results: Vec<ApprovalResult>) -> bool {
        if !self.is_stale(captured) || results.is_empty() {
            return false;
        }
        tracing::debug!(
            generation = %captured,
            count = results.len(),
            "Parking tool results from superseded turn"
        );
        lock_unpoisoned(&self.parked).extend(results);
        true
    }

    /// Park results without a staleness check (explicit user cancel).
    pub fn park_cancelled(&self, results: Vec<ApprovalResult>) {
        lock_unpoisoned(&self.parked).extend(results);
    }

    #[must_use]
    pub fn take_parked(&self) -> Vec<ApprovalResult> {
        std::mem::take(&mut *lock_unpoisoned(&self.parked))
    }

    #[must_use]
    pub fn parked_count(&self) -> usize {
        lock_unpoisoned(&self.parked).len()
    }
}

/// Proof that the holder owns the active turn.
///
/// Dropping the guard releases the claim unless the turn was superseded, in
/// which case the interrupt already released it.
#[derive(Debug)]
pub struct TurnGuard {
    controller: Arc<CancellationController>,
    generation: Generation,
    token: CancellationToken,
}

impl TurnGuard {
    #[must_use]
    pub fn generation(&self) -> Generation {
        self.generation
    }

    #[must_use]
    pub fn abort_token(&self) -> &CancellationToken {
        &self.token
    }

    #[must_use]
    pub fn is_stale(&self) -> bool {
        self.controller.is_stale(self.generation)
    }

    /// Install a fresh abort token after a non-superseding abort (the cancel
    /// safety net) so the turn can continue. Returns `false` if stale.
    pub fn rearm(&mut self) -> bool {
        let mut token = lock_unpoisoned(&self.controller.turn_token);
        if self.controller.is_stale(self.generation) {
            return false;
        }
        if token.is_cancelled() {
            *token = CancellationToken::new();
        }
        self.token = token.clone();
        true
    }
}

impl Drop for TurnGuard {
    fn drop(&mut self) {
        if self.controller.is_stale(self.generation) {
            return;
        }
        let _ = self
            .controller
            .active_turns
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| {
                Some(n.saturating_sub(1))
            });
    }
}
