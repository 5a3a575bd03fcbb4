//! Explicit handle for cache writes that run after the caller already has its value.

use std::fmt;
use std::future::Future;
use tokio::task::JoinHandle;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WriteOutcome {
    Written,
    /// The store rejected the write; the message is the store error.
    Failed(String),
    /// No write was attempted (value came from the cache, caching disabled, circuit open).
    Skipped,
}

impl WriteOutcome {
    pub fn is_written(&self) -> bool {
        matches!(self, WriteOutcome::Written)
    }
}

impl fmt::Display for WriteOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            WriteOutcome::Written => f.write_str("written"),
            WriteOutcome::Failed(reason) => write!(f, "failed: {}", reason),
            WriteOutcome::Skipped => f.write_str("skipped"),
        }
    }
}

enum State {
    Ready(WriteOutcome),
    Pending(JoinHandle<WriteOutcome>),
}

/// A cache write running in the background.
///
/// Dropping the handle detaches the write; it still completes and its failure
/// is still logged and recorded. Await [`WriteBehind::outcome`] to observe it.
pub struct WriteBehind {
    state: State,
}

impl WriteBehind {
    pub fn ready(outcome: WriteOutcome) -> Self {
        Self {
            state: State::Ready(outcome),
        }
    }

    pub fn skipped() -> Self {
        Self::ready(WriteOutcome::Skipped)
    }

    /// Run `write` on the runtime. Must be called from within a tokio runtime.
    pub fn spawn<F>(write: F) -> Self
    where
        F: Future<Output = WriteOutcome> + Send + 'static,
    {
        Self {
            state: State::Pending(tokio::spawn(write)),
        }
    }

    pub fn is_finished(&self) -> bool {
        match &self.state {
            State::Ready(_) => true,
            State::Pending(handle) => handle.is_finished(),
        }
    }

    pub async fn outcome(self) -> WriteOutcome {
        match self.state {
            State::Ready(outcome) => outcome,
            State::Pending(handle) => handle
                .await
                .unwrap_or_else(|e| WriteOutcome::Failed(format!("write task did not complete: {}", e))),
        }
    }
}

impl fmt::Debug for WriteBehind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.state {
            State::Ready(outcome) => f.debug_tuple("WriteBehind").field(outcome).finish(),
            State::Pending(_) => f.write_str("WriteBehind(pending)"),
        }
    }
}
