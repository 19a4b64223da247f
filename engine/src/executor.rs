//! Execution of auto-handled approvals and batch result assembly.
//!
//! ```text
//!  batch ──partition──┬── Allow ──┬── reads  ── join_all ──┐
//!                     │           └── writes ── in order ──┼──> auto_allowed
//!                     ├── Deny  ── synthesize denial ──────┼──> auto_denied
//!                     └── Ask   ── untouched ──────────────┴──> needs_user_input
//! ```
//!
//! Reads run concurrently with each other and with the write chain. Writes
//! run one at a time in batch order.

use std::collections::HashSet;
use std::fmt;
use std::sync::Arc;

use futures_util::future::{BoxFuture, join_all};
use relay_types::{
    ApprovalOutcome, ApprovalRequest, ApprovalResult, PermissionDecision, ToolExecutionResult,
};
use serde_json::Value;
use tokio_util::sync::CancellationToken;

use crate::permissions::CapabilityTable;

/// Tool return for calls that never ran because the turn was interrupted.
pub const INTERRUPTED_TOOL_RETURN: &str = "Interrupted by user";

pub type ToolFut<'a> = BoxFuture<'a, Result<ToolExecutionResult, ToolError>>;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ToolError {
    #[error("Bad tool args: {message}")]
    BadArgs { message: String },
    #[error("Unknown tool: {name}")]
    UnknownTool { name: String },
    #[error("Tool execution failed: {tool}: {message}")]
    ExecutionFailed { tool: String, message: String },
}

/// Tool-execution collaborator.
///
/// Must honor `abort` and be safe to call once per tool call id.
pub trait ToolExecution: Send + Sync {
    fn execute<'a>(&'a self, tool_name: &'a str, args: Value, abort: CancellationToken)
    -> ToolFut<'a>;
}

/// An auto-allowed (or human-approved) call and what running it produced.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExecutedApproval {
    pub request: ApprovalRequest,
    pub result: ToolExecutionResult,
}

impl ExecutedApproval {
    #[must_use]
    pub fn to_result(&self) -> ApprovalResult {
        ApprovalResult::tool_return(self.request.tool_call_id.clone(), self.result.clone())
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ExecutedBatch {
    pub auto_allowed: Vec<ExecutedApproval>,
    /// Always [`ApprovalOutcome::Denied`].
    pub auto_denied: Vec<ApprovalOutcome>,
    pub needs_user_input: Vec<ApprovalRequest>,
    /// The abort fired before every allowed call finished.
    pub interrupted: bool,
}

impl ExecutedBatch {
    /// Wire results for every auto-handled item.
    #[must_use]
    pub fn auto_results(&self) -> Vec<ApprovalResult> {
        self.auto_allowed
            .iter()
            .map(ExecutedApproval::to_result)
            .chain(self.auto_denied.iter().filter_map(ApprovalResult::from_denied))
            .collect()
    }

    #[must_use]
    pub fn all_denied(&self) -> bool {
        self.auto_allowed.is_empty()
            && self.needs_user_input.is_empty()
            && !self.auto_denied.is_empty()
    }
}

// ============================================================================
// Integrity
// ============================================================================

/// The outgoing result set does not match the incoming batch.
#[derive(Debug, Clone, Default, PartialEq, Eq, thiserror::Error)]
#[error(
    "approval results do not match the batch (missing: {missing:?}, unexpected: {unexpected:?}, duplicated: {duplicated:?})"
)]
pub struct IntegrityViolation {
    pub missing: Vec<String>,
    pub unexpected: Vec<String>,
    pub duplicated: Vec<String>,
}

/// Order `results` as `batch_ids` and check the id sets are equal.
pub fn assemble_results(
    batch_ids: &[String],
    results: Vec<ApprovalResult>,
) -> Result<Vec<ApprovalResult>, IntegrityViolation> {
    let expected: HashSet<&str> = batch_ids.iter().map(String::as_str).collect();
    let mut seen: HashSet<String> = HashSet::new();
    let mut violation = IntegrityViolation::default();

    for result in &results {
        let id = result.tool_call_id();
        if !expected.contains(id) {
            violation.unexpected.push(id.to_string());
        } else if !seen.insert(id.to_string()) {
            violation.duplicated.push(id.to_string());
        }
    }
    violation.missing = batch_ids
        .iter()
        .filter(|id| !seen.contains(id.as_str()))
        .cloned()
        .collect();

    if violation != IntegrityViolation::default() || batch_ids.len() != expected.len() {
        tracing::error!(
            missing = ?violation.missing,
            unexpected = ?violation.unexpected,
            duplicated = ?violation.duplicated,
            "Approval result integrity check failed"
        );
        return Err(violation);
    }

    let mut ordered = results;
    ordered.sort_by_key(|r| {
        batch_ids
            .iter()
            .position(|id| id == r.tool_call_id())
            .unwrap_or(usize::MAX)
    });
    Ok(ordered)
}

// ============================================================================
// Executor
// ============================================================================

pub struct ApprovalExecutor {
    tools: Arc<dyn ToolExecution>,
    capabilities: Arc<CapabilityTable>,
}

impl fmt::Debug for ApprovalExecutor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ApprovalExecutor")
            .field("capabilities", &self.capabilities)
            .finish_non_exhaustive()
    }
}

impl ApprovalExecutor {
    pub fn new(tools: Arc<dyn ToolExecution>, capabilities: Arc<CapabilityTable>) -> Self {
        Self {
            tools,
            capabilities,
        }
    }

    /// Partition a classified batch and run its auto-allowed calls.
    ///
    /// `on_result` is called once per completed auto-handled item.
    pub async fn execute(
        &self,
        batch: Vec<(ApprovalRequest, PermissionDecision)>,
        abort: &CancellationToken,
        on_result: &(dyn Fn(&ApprovalResult) + Sync),
    ) -> ExecutedBatch {
        let mut allowed = Vec::new();
        let mut executed = ExecutedBatch::default();

        for (request, decision) in batch {
            match decision {
                PermissionDecision::Allow => allowed.push(request),
                PermissionDecision::Deny { reason } => {
                    let outcome = ApprovalOutcome::denied(request, reason);
                    if let Some(result) = ApprovalResult::from_denied(&outcome) {
                        on_result(&result);
                    }
                    executed.auto_denied.push(outcome);
                }
                PermissionDecision::Ask => executed.needs_user_input.push(request),
            }
        }

        let (auto_allowed, interrupted) = self.run_allowed(allowed, abort, on_result).await;
        executed.auto_allowed = auto_allowed;
        executed.interrupted = interrupted;

        tracing::debug!(
            allowed = executed.auto_allowed.len(),
            denied = executed.auto_denied.len(),
            ask = executed.needs_user_input.len(),
            interrupted,
            "Executed approval batch"
        );
        executed
    }

    /// Run approved calls. Returns results in input order and whether the
    /// abort cut the run short. Calls that never started get an
    /// [`INTERRUPTED_TOOL_RETURN`] error result.
    pub async fn run_allowed(
        &self,
        requests: Vec<ApprovalRequest>,
        abort: &CancellationToken,
        on_result: &(dyn Fn(&ApprovalResult) + Sync),
    ) -> (Vec<ExecutedApproval>, bool) {
        let (reads, writes): (Vec<_>, Vec<_>) = requests
            .into_iter()
            .enumerate()
            .partition(|(_, r)| !self.capabilities.access(&r.tool_name).is_write());

        let read_chain = join_all(
            reads
                .into_iter()
                .map(|(index, request)| async move { (index, self.run_one(request, abort, on_result).await) }),
        );
        let write_chain = async {
            let mut done = Vec::with_capacity(writes.len());
            for (index, request) in writes {
                done.push((index, self.run_one(request, abort, on_result).await));
            }
            done
        };

        let (read_done, write_done) = tokio::join!(read_chain, write_chain);
        let mut all: Vec<_> = read_done.into_iter().chain(write_done).collect();
        all.sort_by_key(|(index, _)| *index);

        let interrupted = all.iter().any(|(_, run)| run.interrupted);
        (all.into_iter().map(|(_, run)| run.executed).collect(), interrupted)
    }

    async fn run_one(
        &self,
        request: ApprovalRequest,
        abort: &CancellationToken,
        on_result: &(dyn Fn(&ApprovalResult) + Sync),
    ) -> ToolRun {
        let interrupted_run = |request: ApprovalRequest| ToolRun {
            executed: ExecutedApproval {
                request,
                result: ToolExecutionResult::error(INTERRUPTED_TOOL_RETURN),
            },
            interrupted: true,
        };

        if abort.is_cancelled() {
            return interrupted_run(request);
        }

        let outcome = match request.try_parse_args() {
            Ok(args) => tokio::select! {
                biased;
                () = abort.cancelled() => None,
                outcome = self.tools.execute(&request.tool_name, args, abort.clone()) => Some(outcome),
            },
            Err(err) => Some(Err(ToolError::BadArgs {
                message: err.to_string(),
            })),
        };

        let result = match outcome {
            None => return interrupted_run(request),
            Some(Ok(result)) => result,
            Some(Err(err)) => {
                tracing::warn!(
                    tool = %request.tool_name,
                    tool_call_id = %request.tool_call_id,
                    error = %err,
                    "Tool execution failed"
                );
                ToolExecutionResult::error(err.to_string())
            }
        };

        let executed = ExecutedApproval { request, result };
        on_result(&executed.to_result());
        ToolRun {
            executed,
            interrupted: false,
        }
    }
}

struct ToolRun {
    executed: ExecutedApproval,
    interrupted: bool,
}
