//! Request lifetime.
//!
//! Every request runs inside a [`Lifetime`]: a cancellation token, linked to
//! the transport, optionally narrowed by the application timeout. The
//! dispatcher watches it and, once it is done, closes the response to new
//! writers; after the chain returns it turns [`Lifetime::err`] into a 500 or
//! 504.

use std::fmt;
use std::sync::OnceLock;
use std::time::Duration;

use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

/// Why a lifetime ended.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum LifetimeError {
    /// The transport went away or the lifetime was released.
    Canceled,
    /// The application timeout elapsed.
    DeadlineExceeded,
}

impl fmt::Display for LifetimeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Canceled => f.write_str("request canceled"),
            Self::DeadlineExceeded => f.write_str("request deadline exceeded"),
        }
    }
}

impl std::error::Error for LifetimeError {}

pub struct Lifetime {
    token: CancellationToken,
    deadline: Option<Instant>,
    cause: OnceLock<LifetimeError>,
}

impl Lifetime {
    /// A fresh root lifetime. A zero `timeout` means no deadline.
    pub fn new(timeout: Option<Duration>) -> Self {
        Self::with_token(CancellationToken::new(), timeout)
    }

    /// A lifetime cancelled whenever `parent` is.
    pub fn child_of(parent: &CancellationToken, timeout: Option<Duration>) -> Self {
        Self::with_token(parent.child_token(), timeout)
    }

    fn with_token(token: CancellationToken, timeout: Option<Duration>) -> Self {
        Self {
            token,
            deadline: timeout.filter(|t| !t.is_zero()).map(|t| Instant::now() + t),
            cause: OnceLock::new(),
        }
    }

    pub fn token(&self) -> &CancellationToken {
        &self.token
    }

    pub fn deadline(&self) -> Option<Instant> {
        self.deadline
    }

    /// Resolves once the lifetime is cancelled or its deadline passes.
    pub async fn done(&self) {
        let cause = match self.deadline {
            Some(deadline) => tokio::select! {
                () = self.token.cancelled() => LifetimeError::Canceled,
                () = tokio::time::sleep_until(deadline) => LifetimeError::DeadlineExceeded,
            },
            None => {
                self.token.cancelled().await;
                LifetimeError::Canceled
            }
        };
        // The first observed cause wins; cancel afterwards so children see it.
        let _ = self.cause.set(cause);
        self.token.cancel();
    }

    /// `None` while the lifetime is live.
    pub fn err(&self) -> Option<LifetimeError> {
        if let Some(cause) = self.cause.get() {
            return Some(*cause);
        }
        if self.token.is_cancelled() {
            return Some(LifetimeError::Canceled);
        }
        match self.deadline {
            Some(deadline) if Instant::now() >= deadline => Some(LifetimeError::DeadlineExceeded),
            _ => None,
        }
    }

    /// Releases the lifetime. Idempotent.
    pub fn cancel(&self) {
        self.token.cancel();
    }
}

impl fmt::Debug for Lifetime {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Lifetime")
            .field("deadline", &self.deadline)
            .field("err", &self.err())
            .finish()
    }
}
