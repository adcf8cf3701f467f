use convoy_client::ClientError;

/// What the engine does with a failed key.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ErrorPolicy {
    /// Re-add with per-key backoff.
    Requeue,
    /// Log and forget; retried only on the next watch event or resync.
    Drop,
}

#[derive(Debug, thiserror::Error)]
pub enum ReconcileError {
    #[error("client error: {0}")]
    Client(#[from] ClientError),

    #[error("cannot decode object: {0}")]
    Decode(String),

    /// The object can never converge as written.
    #[error("terminal: {0}")]
    Terminal(String),

    #[error("internal error: {0}")]
    Internal(String),
}

impl ReconcileError {
    pub fn policy(&self) -> ErrorPolicy {
        match self {
            ReconcileError::Client(_) | ReconcileError::Internal(_) => ErrorPolicy::Requeue,
            ReconcileError::Decode(_) | ReconcileError::Terminal(_) => ErrorPolicy::Drop,
        }
    }
}

pub fn into_internal<E: std::fmt::Display>(e: E) -> ReconcileError {
    ReconcileError::Internal(e.to_string())
}

#[derive(Debug, thiserror::Error)]
pub enum RuntimeError {
    #[error("initial list failed: {0}")]
    InitialList(#[source] ClientError),

    #[error("worker task failed: {0}")]
    Worker(String),
}
