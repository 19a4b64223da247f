//! Integration test suites, one per orchestrator concern.

mod approvals;
mod interrupt;
mod queue;
mod script;
mod turns;
