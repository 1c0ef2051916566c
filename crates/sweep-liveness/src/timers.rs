//! The timer group of one recording attempt.
//!
//! The sampler tick, the countdown and the recorder watch are registered
//! together and torn down together. Every task races the group's token, so a
//! task that outlives its attempt is dropped at its next await point rather
//! than touching shared state.

use std::future::Future;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimerKind {
    Sampler,
    Countdown,
    Recorder,
}

#[derive(Debug)]
pub struct AttemptTimers {
    token: CancellationToken,
    tasks: JoinSet<TimerKind>,
}

impl AttemptTimers {
    /// New group, cancelled with `parent` or on its own shutdown.
    pub fn new(parent: &CancellationToken) -> Self {
        Self {
            token: parent.child_token(),
            tasks: JoinSet::new(),
        }
    }

    pub fn spawn<F>(&mut self, kind: TimerKind, task: F)
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let token = self.token.clone();
        self.tasks.spawn(async move {
            tokio::select! {
                biased;
                _ = token.cancelled() => tracing::trace!(timer = ?kind, "timer cancelled"),
                _ = task => tracing::trace!(timer = ?kind, "timer finished"),
            }
            kind
        });
    }

    /// Token every timer of this group observes.
    pub fn token(&self) -> &CancellationToken {
        &self.token
    }

    /// Timers still running.
    pub fn active(&self) -> usize {
        self.tasks.len()
    }

    /// Cancel every timer and wait until all of them have exited.
    pub async fn shutdown(mut self) {
        self.token.cancel();
        while let Some(joined) = self.tasks.join_next().await {
            if let Err(e) = joined {
                if e.is_panic() {
                    tracing::warn!(error = %e, "attempt timer panicked");
                }
            }
        }
    }
}

impl Drop for AttemptTimers {
    fn drop(&mut self) {
        self.token.cancel();
    }
}
