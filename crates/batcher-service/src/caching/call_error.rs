use std::any::Any;
use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;

/// An error returned from [`Scheduler::call`](super::Scheduler::call).
///
/// All callers that were coalesced onto the same computation receive a clone of the very same
/// error, which is why producer errors are kept behind an [`Arc`].
#[derive(Debug, Clone, Error)]
pub enum CallError {
    /// The producer returned an error.
    ///
    /// The attached error is exactly the one the producer returned.
    #[error("{0:#}")]
    Producer(Arc<anyhow::Error>),
    /// The producer panicked.
    ///
    /// The attached string contains the panic message, if it had one.
    #[error("producer panicked: {0}")]
    Panicked(String),
    /// The computation was torn down before it could finish.
    ///
    /// This only happens when the runtime driving the scheduler shuts down.
    #[error("call was canceled")]
    Canceled,
}

impl CallError {
    /// Returns the error returned by the producer, if that is what happened.
    pub fn producer_error(&self) -> Option<&anyhow::Error> {
        match self {
            Self::Producer(err) => Some(err),
            _ => None,
        }
    }

    pub(super) fn from_panic(payload: Box<dyn Any + Send>) -> Self {
        let message = if let Some(s) = payload.downcast_ref::<&'static str>() {
            (*s).to_owned()
        } else if let Some(s) = payload.downcast_ref::<String>() {
            s.clone()
        } else {
            "<non-string panic payload>".to_owned()
        };
        Self::Panicked(message)
    }

    /// A short tag for this error, used in metrics.
    pub(super) fn metrics_tag(&self) -> &'static str {
        match self {
            Self::Producer(_) => "error",
            Self::Panicked(_) => "panic",
            Self::Canceled => "canceled",
        }
    }
}

impl From<anyhow::Error> for CallError {
    fn from(err: anyhow::Error) -> Self {
        Self::Producer(Arc::new(err))
    }
}

/// The result of a memoized call, shared between all coalesced callers.
pub type CallResult<T> = Result<T, CallError>;

/// A rejected configuration change.
///
/// The previous configuration stays in effect.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum ConfigError {
    /// The TTL was zero or negative.
    #[error("ttl must be positive, got {0}ms")]
    InvalidTtl(i64),
}

impl ConfigError {
    pub(super) fn check_ttl(ttl: Duration) -> Result<Duration, Self> {
        if ttl.is_zero() {
            Err(Self::InvalidTtl(0))
        } else {
            Ok(ttl)
        }
    }
}
