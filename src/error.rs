//! # Errors
//!
//! Classified error type shared by every component.
//!
//! Lower layers return a classified [`Error`]; only the reconciler decides
//! whether to retry (transient) or abort (everything else).

use std::time::Duration;
use thiserror::Error;

pub type Result<T, E = Error> = std::result::Result<T, E>;

#[derive(Debug, Error)]
pub enum Error {
    /// Invalid or expired credentials against the provider or the cluster
    #[error("authentication failed against {target}: {message}")]
    Auth { target: String, message: String },

    /// Remote state exists but is incompatible with the request
    #[error("conflict: {0}")]
    Conflict(String),

    /// The provider refused the request because a limit was reached
    #[error("quota exceeded: {0}")]
    Quota(String),

    /// Network timeout, rate limit or temporary server error
    #[error("transient failure: {message}")]
    Transient {
        message: String,
        retry_after: Option<Duration>,
    },

    /// Readiness deadline elapsed with the named targets unsatisfied
    #[error("timed out waiting for {}", .targets.join(", "))]
    Timeout { targets: Vec<String> },

    /// A convergence target reported a terminal failure condition
    #[error("{target} reported {condition}: {message}")]
    FatalCondition {
        target: String,
        condition: String,
        message: String,
    },

    /// Malformed bootstrap request, detected before any remote call
    #[error("invalid bootstrap request: {0}")]
    Config(String),

    /// The run was aborted or its deadline elapsed
    #[error("bootstrap cancelled: {0}")]
    Cancelled(String),

    /// The selected provider cannot perform the operation
    #[error("{provider} does not support {operation}")]
    Unsupported {
        provider: &'static str,
        operation: &'static str,
    },

    #[error("kubernetes API error: {0}")]
    Kube(#[source] kube::Error),

    #[error(transparent)]
    Internal(#[from] anyhow::Error),
}

impl Error {
    pub fn auth(target: impl Into<String>, message: impl Into<String>) -> Self {
        Error::Auth {
            target: target.into(),
            message: message.into(),
        }
    }

    pub fn transient(message: impl Into<String>) -> Self {
        Error::Transient {
            message: message.into(),
            retry_after: None,
        }
    }

    pub fn config(message: impl Into<String>) -> Self {
        Error::Config(message.into())
    }

    /// Whether the reconciler may retry the failed call
    #[must_use]
    pub fn is_transient(&self) -> bool {
        matches!(self, Error::Transient { .. })
    }

    /// Server-provided delay before the next attempt, if any
    #[must_use]
    pub fn retry_after(&self) -> Option<Duration> {
        match self {
            Error::Transient { retry_after, .. } => *retry_after,
            _ => None,
        }
    }

    /// Short label used in logs, metrics and the run report
    #[must_use]
    pub fn kind(&self) -> &'static str {
        match self {
            Error::Auth { .. } => "auth",
            Error::Conflict(_) => "conflict",
            Error::Quota(_) => "quota",
            Error::Transient { .. } => "transient",
            Error::Timeout { .. } => "timeout",
            Error::FatalCondition { .. } => "fatal-condition",
            Error::Config(_) => "config",
            Error::Cancelled(_) => "cancelled",
            Error::Unsupported { .. } => "unsupported",
            Error::Kube(_) => "kube",
            Error::Internal(_) => "internal",
        }
    }
}

impl From<kube::Error> for Error {
    fn from(err: kube::Error) -> Self {
        match &err {
            kube::Error::Api(status) => match status.code {
                401 | 403 => Error::auth("kubernetes", status.message.clone()),
                409 => Error::Conflict(status.message.clone()),
                429 | 500..=599 => Error::transient(format!(
                    "kubernetes API returned {}: {}",
                    status.code, status.message
                )),
                _ => Error::Kube(err),
            },
            kube::Error::HyperError(_) | kube::Error::Service(_) => {
                Error::transient(format!("kubernetes API unreachable: {err}"))
            }
            _ => Error::Kube(err),
        }
    }
}

impl From<reqwest::Error> for Error {
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() || err.is_connect() || err.is_request() {
            return Error::transient(format!("provider request failed: {err}"));
        }
        if let Some(status) = err.status() {
            if status.as_u16() == 429 || status.is_server_error() {
                return Error::transient(format!("provider returned {status}"));
            }
        }
        Error::Internal(anyhow::Error::new(err))
    }
}
