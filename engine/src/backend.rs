//! Agent service collaborator contract.

use futures_util::future::BoxFuture;
use relay_types::{ApprovalRequest, ConversationId, RunId, StopReason, TurnInput};

use crate::streaming::TurnStream;

pub type BackendFut<'a, T> = BoxFuture<'a, Result<T, BackendError>>;

/// Request-level failure reported by the agent service.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("{}", self.describe())]
pub struct BackendError {
    /// HTTP-like status, when the failure came from a response.
    pub status: Option<u16>,
    pub message: String,
}

impl BackendError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            status: None,
            message: message.into(),
        }
    }

    pub fn with_status(status: u16, message: impl Into<String>) -> Self {
        Self {
            status: Some(status),
            message: message.into(),
        }
    }

    fn describe(&self) -> String {
        match self.status {
            Some(status) => format!("API error {status}: {}", self.message),
            None => self.message.clone(),
        }
    }
}

/// Metadata of a finished run, consulted after an error stop.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RunMetadata {
    pub stop_reason: Option<StopReason>,
    /// Provider error text recorded against the run.
    pub error: Option<String>,
}

/// The remote agent service.
///
/// Every method must be cancel-safe: the orchestrator drops the future when
/// the turn is aborted.
pub trait AgentBackend: Send + Sync {
    /// Send a turn's input and open its response stream.
    fn open_stream<'a>(
        &'a self,
        conversation: &'a ConversationId,
        input: Vec<TurnInput>,
    ) -> BackendFut<'a, TurnStream>;

    /// Ask the service to stop the active run. Best effort.
    fn cancel<'a>(&'a self, conversation: &'a ConversationId) -> BackendFut<'a, ()>;

    fn retrieve_run<'a>(&'a self, run_id: &'a RunId) -> BackendFut<'a, RunMetadata>;

    /// Approvals the service currently holds open for the conversation.
    fn pending_approvals<'a>(
        &'a self,
        conversation: &'a ConversationId,
    ) -> BackendFut<'a, Vec<ApprovalRequest>>;
}
