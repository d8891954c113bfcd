use std::future;
use std::time::Duration;

use tokio::time::Instant;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TimeoutError {
    #[error("request timeout must be greater than zero, got {0} ms")]
    Request(i64),
    #[error("idle timeout must be greater than zero, got {0} ms")]
    Idle(i64),
}

/// Longest wait for a complete request once a request cycle has started.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RequestTimeout(Duration);

impl RequestTimeout {
    pub fn from_millis(millis: i64) -> Result<Self, TimeoutError> {
        positive_millis(millis)
            .map(Self)
            .ok_or(TimeoutError::Request(millis))
    }

    pub fn as_duration(&self) -> Duration {
        self.0
    }
}

/// Longest wait for the next request on a persistent connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IdleTimeout(Duration);

impl IdleTimeout {
    pub fn from_millis(millis: i64) -> Result<Self, TimeoutError> {
        positive_millis(millis)
            .map(Self)
            .ok_or(TimeoutError::Idle(millis))
    }

    pub fn as_duration(&self) -> Duration {
        self.0
    }
}

fn positive_millis(millis: i64) -> Option<Duration> {
    u64::try_from(millis)
        .ok()
        .filter(|ms| *ms > 0)
        .map(Duration::from_millis)
}

/// The pair of timeouts a connection runs under.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Timeouts {
    pub request: RequestTimeout,
    pub idle: IdleTimeout,
}

/// One-shot deadline owned by a connection phase.
///
/// The timer is only a deadline; waiting on it does not consume it, so the
/// wait can be rebuilt on every pass through a `select!` loop without
/// pushing the deadline out.
#[derive(Debug, Default)]
pub struct PhaseTimer {
    deadline: Option<Instant>,
}

impl PhaseTimer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn arm(&mut self, after: Duration) {
        self.deadline = Some(Instant::now() + after);
    }

    pub fn cancel(&mut self) {
        self.deadline = None;
    }

    pub fn is_armed(&self) -> bool {
        self.deadline.is_some()
    }

    /// Resolves at the deadline; never resolves while disarmed.
    pub async fn expired(&self) {
        match self.deadline {
            Some(deadline) => tokio::time::sleep_until(deadline).await,
            None => future::pending::<()>().await,
        }
    }
}
