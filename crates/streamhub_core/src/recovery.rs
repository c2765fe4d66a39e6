//! Resume and reconnect logic.
//!
//! Each collection keeps a [`Cursor`] over the last dispatched position.
//! The cursor decides whether an incoming change advances the checkpoint,
//! is a duplicate to skip, or is a replay to re-deliver without moving the
//! checkpoint. Reconnects are serialized through a [`Reconnector`] so one
//! connection loss triggers a single backoff loop no matter how many
//! collections observe it.

use crate::config::ReconnectConfig;
use crate::error::HubResult;
use crate::event::ResumeToken;
use crate::report::{HubNotice, Reporter};
use parking_lot::RwLock;
use std::collections::HashMap;
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::sync::{watch, Mutex, MutexGuard};

/// How a change relates to the collection's checkpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Admission {
    /// Past the checkpoint: dispatch and advance.
    Advance,
    /// At or below the checkpoint on a gap-free stream: skip.
    Duplicate,
    /// At or below the checkpoint on a stream that may replay: dispatch
    /// again, keep the checkpoint.
    Replay,
}

/// Per-collection position tracker.
#[derive(Debug, Clone, Default)]
pub(crate) struct Cursor {
    last: Option<ResumeToken>,
}

impl Cursor {
    pub(crate) fn new(last: Option<ResumeToken>) -> Self {
        Self { last }
    }

    pub(crate) fn token(&self) -> Option<ResumeToken> {
        self.last
    }

    pub(crate) fn last_sequence(&self) -> Option<u64> {
        self.last.map(|t| t.position())
    }

    pub(crate) fn admit(&self, token: &ResumeToken, gap_free: bool) -> Admission {
        match self.last {
            None => Admission::Advance,
            // A new source generation supersedes the old checkpoint.
            Some(last) if last.generation() != token.generation() => Admission::Advance,
            Some(last) if token.position() > last.position() => Admission::Advance,
            Some(_) if gap_free => Admission::Duplicate,
            Some(_) => Admission::Replay,
        }
    }

    pub(crate) fn advance(&mut self, token: ResumeToken) {
        self.last = Some(token);
    }

    /// Forgets the checkpoint after the source rejected it.
    pub(crate) fn reset(&mut self) {
        self.last = None;
    }
}

/// Last dispatched token per collection, shared across hub restarts.
#[derive(Debug, Default)]
pub(crate) struct Checkpoints {
    tokens: RwLock<HashMap<String, ResumeToken>>,
}

impl Checkpoints {
    pub(crate) fn cursor(&self, collection: &str) -> Cursor {
        Cursor::new(self.get(collection))
    }

    pub(crate) fn get(&self, collection: &str) -> Option<ResumeToken> {
        self.tokens.read().get(collection).copied()
    }

    pub(crate) fn store(&self, collection: &str, token: ResumeToken) {
        self.tokens.write().insert(collection.to_string(), token);
    }

    pub(crate) fn remove(&self, collection: &str) {
        self.tokens.write().remove(collection);
    }
}

/// Result of a reconnect loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum RetryOutcome {
    /// Connected on the given attempt.
    Connected { attempts: u32 },
    /// Every attempt failed.
    Exhausted { attempts: u32 },
    /// Shutdown was requested while waiting.
    Cancelled,
}

/// Retries `connect` with jittered exponential backoff until it succeeds,
/// the attempt ceiling is reached, or shutdown is signalled.
pub(crate) async fn retry_connect<F, Fut>(
    policy: &ReconnectConfig,
    shutdown: &mut watch::Receiver<bool>,
    reporter: &Reporter,
    mut connect: F,
) -> RetryOutcome
where
    F: FnMut() -> Fut,
    Fut: Future<Output = HubResult<()>>,
{
    for attempt in 1..=policy.max_attempts {
        if *shutdown.borrow() {
            return RetryOutcome::Cancelled;
        }

        let delay = policy.delay_for_attempt(attempt);
        tracing::debug!(attempt, delay_ms = delay.as_millis() as u64, "waiting before reconnect");
        tokio::select! {
            _ = tokio::time::sleep(delay) => {}
            _ = shutdown.changed() => return RetryOutcome::Cancelled,
        }

        reporter.count(|s| s.reconnect_attempts += 1);
        match connect().await {
            Ok(()) => return RetryOutcome::Connected { attempts: attempt },
            Err(e) => reporter.notice(HubNotice::ReconnectAttemptFailed {
                attempt,
                message: e.to_string(),
            }),
        }
    }

    RetryOutcome::Exhausted {
        attempts: policy.max_attempts,
    }
}

/// Serializes reconnects and counts connection epochs.
#[derive(Debug, Default)]
pub(crate) struct Reconnector {
    epoch: AtomicU64,
    lock: Mutex<()>,
}

impl Reconnector {
    /// Current connection epoch; bumped after every successful reconnect.
    pub(crate) fn epoch(&self) -> u64 {
        self.epoch.load(Ordering::SeqCst)
    }

    /// Waits for exclusive reconnect rights.
    ///
    /// Returns `None` when another task already reconnected after
    /// `observed` was read; the caller should just reopen its watch.
    pub(crate) async fn begin(&self, observed: u64) -> Option<MutexGuard<'_, ()>> {
        let guard = self.lock.lock().await;
        if self.epoch() != observed {
            return None;
        }
        Some(guard)
    }

    pub(crate) fn complete(&self) {
        self.epoch.fetch_add(1, Ordering::SeqCst);
    }
}
