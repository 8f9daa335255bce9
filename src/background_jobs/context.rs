use crate::clock::Clock;
use chrono::{DateTime, Utc};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

/// Context provided to jobs during execution.
///
/// Jobs own their stores; the context carries what every run shares.
#[derive(Clone)]
pub struct JobContext {
    /// Token to check for cancellation/shutdown requests.
    pub cancellation_token: CancellationToken,

    /// Source of `now` for every store call a run makes.
    pub clock: Arc<dyn Clock>,
}

impl JobContext {
    pub fn new(cancellation_token: CancellationToken, clock: Arc<dyn Clock>) -> Self {
        Self {
            cancellation_token,
            clock,
        }
    }

    /// Same clock, different token. Used by the scheduler for per-run tokens.
    pub fn with_token(&self, cancellation_token: CancellationToken) -> Self {
        Self {
            cancellation_token,
            clock: Arc::clone(&self.clock),
        }
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancellation_token.is_cancelled()
    }

    pub fn now(&self) -> DateTime<Utc> {
        self.clock.now()
    }
}
