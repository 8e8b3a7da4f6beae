//! Fleet error abstractions.
//!
//! Cloud calls report failures as `CloudError`. Reconciliation code propagates `anyhow::Error`
//! values and marks the ones which should alter retry behavior with a `ReconcileError`, which is
//! found again by walking the error chain in `classify`.

use std::time::Duration;

use thiserror::Error;

/// The retry delay used while a cloud operation is still in flight.
pub const RETRY_OPERATION_NOT_DONE: Duration = Duration::from_secs(15);
/// The retry delay used after a concurrent modification was detected.
pub const RETRY_CONFLICT: Duration = Duration::from_secs(30);
/// The retry delay used for all other unclassified errors.
pub const RETRY_DEFAULT: Duration = Duration::from_secs(10);

/// Errors returned from the cloud compute API.
#[derive(Debug, Error)]
pub enum CloudError {
    /// The requested resource does not exist.
    #[error("resource not found: {0}")]
    NotFound(String),
    /// A long-running operation has been accepted but is not yet complete.
    #[error("operation is not done: {0}")]
    OperationNotDone(String),
    /// A long-running operation reached a definitive failed state.
    #[error("operation failed: {0}")]
    OperationFailed(String),
    /// The resource was concurrently modified.
    #[error("conflict: {0}")]
    Conflict(String),
    /// The API rejected the request.
    #[error("cloud api error (status {status}, code {code}): {message}")]
    Api { status: u16, code: String, message: String },
    /// The request could not be delivered or its response could not be read.
    #[error("transport error: {0}")]
    Transport(String),
}

/// Errors which carry an explicit retry classification.
#[derive(Debug, Error)]
pub enum ReconcileError {
    /// The error will not resolve without a change to the spec. Never retried.
    #[error("{0:#}")]
    Terminal(anyhow::Error),
    /// The error is expected to resolve on its own after the given delay.
    #[error("{error:#}")]
    Transient { error: anyhow::Error, retry_after: Duration },
}

impl ReconcileError {
    /// Build a terminal error from the given message.
    pub fn terminal(msg: impl Into<String>) -> anyhow::Error {
        Self::Terminal(anyhow::Error::msg(msg.into())).into()
    }

    /// Mark the given error as transient with the given retry delay.
    pub fn transient(error: impl Into<anyhow::Error>, retry_after: Duration) -> anyhow::Error {
        Self::Transient {
            error: error.into(),
            retry_after,
        }
        .into()
    }
}

/// Classify the given error, returning the delay after which the work should be retried, or
/// `None` if the error is terminal.
pub fn classify(err: &anyhow::Error) -> Option<Duration> {
    for cause in err.chain() {
        if let Some(reconcile_err) = cause.downcast_ref::<ReconcileError>() {
            return match reconcile_err {
                ReconcileError::Terminal(_) => None,
                ReconcileError::Transient { retry_after, .. } => Some(*retry_after),
            };
        }
    }
    for cause in err.chain() {
        match cause.downcast_ref::<CloudError>() {
            Some(CloudError::OperationNotDone(_)) => return Some(RETRY_OPERATION_NOT_DONE),
            Some(CloudError::Conflict(_)) => return Some(RETRY_CONFLICT),
            _ => continue,
        }
    }
    Some(RETRY_DEFAULT)
}

/// Check if the given error is terminal.
pub fn is_terminal(err: &anyhow::Error) -> bool {
    classify(err).is_none()
}

/// Check if the given error was caused by a missing cloud resource.
pub fn is_not_found(err: &anyhow::Error) -> bool {
    err.chain().any(|cause| matches!(cause.downcast_ref::<CloudError>(), Some(CloudError::NotFound(_))))
}

/// Check if the given error signals that a long-running operation reached a failed state.
pub fn is_operation_failed(err: &anyhow::Error) -> bool {
    err.chain()
        .any(|cause| matches!(cause.downcast_ref::<CloudError>(), Some(CloudError::OperationFailed(_))))
}

/// Check if the given error signals that a long-running operation is still in flight.
pub fn is_operation_not_done(err: &anyhow::Error) -> bool {
    err.chain().any(|cause| {
        matches!(cause.downcast_ref::<CloudError>(), Some(CloudError::OperationNotDone(_)))
            || matches!(
                cause.downcast_ref::<ReconcileError>(),
                Some(ReconcileError::Transient { error, .. }) if matches!(error.downcast_ref::<CloudError>(), Some(CloudError::OperationNotDone(_)))
            )
    })
}
