//! Small pure helper functions.

use std::sync::{Mutex, MutexGuard};

/// Truncate a string to a maximum length, adding ellipsis if needed.
pub fn truncate_with_ellipsis(raw: &str, max: usize) -> String {
    let max = max.max(3);
    let trimmed = raw.trim();
    if trimmed.chars().count() <= max {
        trimmed.to_string()
    } else {
        let head: String = trimmed.chars().take(max - 3).collect();
        format!("{head}...")
    }
}

/// Lock a mutex, recovering the guard if a previous holder panicked.
///
/// Shared orchestrator state is always left consistent between statements,
/// so a poisoned lock carries no torn writes.
pub(crate) fn lock_unpoisoned<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    match mutex.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}
