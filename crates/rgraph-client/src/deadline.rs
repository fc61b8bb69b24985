//! Deadlines and cancellation for transactions and single calls.
//!
//! A timeout is a race between the operation and a timer; cancellation is a
//! race against a [`CancellationToken`]. Both surface as errors for which
//! [`GraphError::is_timeout_or_cancel`] holds.

use std::future::Future;
use std::time::Duration;

use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::error::{GraphError, Result};

const FAR_FUTURE: Duration = Duration::from_secs(86_400 * 365 * 30);

/// Absolute point in (tokio) time after which an operation is abandoned.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct Deadline {
    at: Instant,
    timeout: Duration,
}

impl Deadline {
    /// Creates a new deadline from now + timeout. Timeouts too large to
    /// represent end about thirty years out.
    pub fn after(timeout: Duration) -> Self {
        let now = Instant::now();
        let at = now
            .checked_add(timeout)
            .unwrap_or_else(|| now + FAR_FUTURE);
        Self { at, timeout }
    }

    /// Returns `None` once the deadline has passed.
    pub fn remaining(&self) -> Option<Duration> {
        let now = Instant::now();
        if self.at > now {
            Some(self.at - now)
        } else {
            None
        }
    }

    /// True once the deadline has passed.
    pub fn is_expired(&self) -> bool {
        self.remaining().is_none()
    }

    /// The absolute expiry instant.
    pub fn instant(&self) -> Instant {
        self.at
    }

    /// Timeout error reporting the original duration.
    pub fn error(&self) -> GraphError {
        GraphError::Timeout {
            timeout_ms: self.timeout.as_millis() as u64,
        }
    }

    /// Fails fast with a timeout error if the deadline already passed.
    pub fn check(&self) -> Result<()> {
        if self.is_expired() {
            Err(self.error())
        } else {
            Ok(())
        }
    }
}

/// Runs `fut` until it completes, the deadline passes, or `cancel` fires.
pub async fn race<F, T>(
    fut: F,
    deadline: Option<Deadline>,
    cancel: Option<&CancellationToken>,
) -> Result<T>
where
    F: Future<Output = Result<T>>,
{
    let timer = async {
        match deadline {
            Some(d) => {
                tokio::time::sleep_until(d.instant()).await;
                d.error()
            }
            None => std::future::pending().await,
        }
    };
    let cancelled = async {
        match cancel {
            Some(token) => token.cancelled().await,
            None => std::future::pending().await,
        }
    };

    tokio::select! {
        biased;
        _ = cancelled => Err(GraphError::Cancelled),
        err = timer => Err(err),
        out = fut => out,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn test_deadline_expiry() {
        let deadline = Deadline::after(Duration::from_millis(100));
        assert!(!deadline.is_expired());
        assert!(deadline.check().is_ok());
        tokio::time::advance(Duration::from_millis(150)).await;
        assert!(deadline.is_expired());
        assert!(deadline.check().unwrap_err().is_timeout_or_cancel());
    }

    #[tokio::test]
    async fn test_unbounded_timeout_does_not_overflow() {
        let deadline = Deadline::after(Duration::MAX);
        assert!(!deadline.is_expired());
        assert!(deadline.remaining().unwrap() >= FAR_FUTURE - Duration::from_secs(1));
        let out = race(async { Ok(1) }, Some(deadline), None).await.unwrap();
        assert_eq!(out, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_race_times_out() {
        let deadline = Deadline::after(Duration::from_millis(50));
        let result: Result<()> = race(
            async {
                tokio::time::sleep(Duration::from_secs(10)).await;
                Ok(())
            },
            Some(deadline),
            None,
        )
        .await;
        let err = result.unwrap_err();
        assert!(matches!(err, GraphError::Timeout { timeout_ms: 50 }));
        assert!(err.is_timeout_or_cancel());
    }

    #[tokio::test]
    async fn test_race_cancelled() {
        let token = CancellationToken::new();
        token.cancel();
        let result: Result<u32> = race(std::future::pending(), None, Some(&token)).await;
        assert!(matches!(result.unwrap_err(), GraphError::Cancelled));
    }

    #[tokio::test]
    async fn test_race_passes_through_result() {
        let token = CancellationToken::new();
        let out = race(
            async { Ok(7) },
            Some(Deadline::after(Duration::from_secs(5))),
            Some(&token),
        )
        .await
        .unwrap();
        assert_eq!(out, 7);

        let err: Result<u32> = race(async { Err(GraphError::NotInitialized) }, None, None).await;
        assert!(matches!(err.unwrap_err(), GraphError::NotInitialized));
    }
}
