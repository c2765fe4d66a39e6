//! Observability channel for contained failures.
//!
//! Errors that do not stop the hub (handler failures, malformed events,
//! resume gaps, reconnect attempts, publish failures) are logged with
//! `tracing`, counted in [`HubStats`] and broadcast as [`HubNotice`]s.

use crate::hub::HubState;
use parking_lot::RwLock;
use tokio::sync::broadcast;

/// A contained failure or lifecycle change.
#[derive(Debug, Clone, PartialEq)]
pub enum HubNotice {
    /// A subscriber callback failed.
    HandlerFailure {
        /// Collection being dispatched.
        collection: String,
        /// Registration id of the handler.
        registration: u64,
        /// Sequence position of the event.
        sequence: u64,
        /// Failure message.
        message: String,
    },
    /// A raw change was dropped.
    MalformedEvent {
        /// Collection the change arrived on.
        collection: String,
        /// What was wrong with it.
        reason: String,
    },
    /// A watch could not resume and restarted from the current position.
    ResumeGap {
        /// Collection that restarted.
        collection: String,
        /// Last position dispatched before the gap.
        last_sequence: Option<u64>,
    },
    /// A collection's watch could not be reopened. The hub keeps retrying
    /// with backoff until the attempt ceiling, then fails.
    ReopenFailed {
        /// Collection whose watch is down.
        collection: String,
        /// 1-indexed attempt number.
        attempt: u32,
        /// Failure message.
        message: String,
    },
    /// A reconnect attempt failed.
    ReconnectAttemptFailed {
        /// 1-indexed attempt number.
        attempt: u32,
        /// Failure message.
        message: String,
    },
    /// The cross-instance publish failed.
    PublishFailed {
        /// Topic published to.
        topic: String,
        /// Sequence position of the event.
        sequence: u64,
        /// Failure message.
        message: String,
    },
    /// The hub changed state.
    StateChanged {
        /// Previous state.
        from: HubState,
        /// New state.
        to: HubState,
    },
}

/// Counters describing hub activity.
#[derive(Debug, Clone, Default, PartialEq, Eq, serde::Serialize)]
pub struct HubStats {
    /// Raw changes received from the source.
    pub events_received: u64,
    /// Events passed to the dispatcher.
    pub events_dispatched: u64,
    /// Individual handler deliveries.
    pub deliveries: u64,
    /// Handler failures.
    pub handler_failures: u64,
    /// Raw changes dropped as malformed.
    pub malformed_events: u64,
    /// Events skipped because they were at or below the checkpoint.
    pub duplicates_skipped: u64,
    /// Failed cross-instance publishes.
    pub publish_failures: u64,
    /// Reconnect attempts made.
    pub reconnect_attempts: u64,
    /// Successful reconnects.
    pub reconnects: u64,
    /// Failed attempts to reopen a collection's watch.
    pub reopen_failures: u64,
    /// Watches restarted without a valid resume token.
    pub resume_gaps: u64,
}

/// Shared sink for notices and counters.
pub(crate) struct Reporter {
    notices: broadcast::Sender<HubNotice>,
    stats: RwLock<HubStats>,
}

impl Reporter {
    pub(crate) fn new(capacity: usize) -> Self {
        let (notices, _) = broadcast::channel(capacity.max(1));
        Self {
            notices,
            stats: RwLock::new(HubStats::default()),
        }
    }

    pub(crate) fn subscribe(&self) -> broadcast::Receiver<HubNotice> {
        self.notices.subscribe()
    }

    pub(crate) fn stats(&self) -> HubStats {
        self.stats.read().clone()
    }

    pub(crate) fn count(&self, update: impl FnOnce(&mut HubStats)) {
        update(&mut self.stats.write());
    }

    /// Counts, logs and broadcasts a notice.
    pub(crate) fn notice(&self, notice: HubNotice) {
        {
            let mut stats = self.stats.write();
            match &notice {
                HubNotice::HandlerFailure {
                    collection,
                    registration,
                    sequence,
                    message,
                } => {
                    stats.handler_failures += 1;
                    tracing::warn!(%collection, registration, sequence, %message, "handler failed");
                }
                HubNotice::MalformedEvent { collection, reason } => {
                    stats.malformed_events += 1;
                    tracing::warn!(%collection, %reason, "dropping malformed change");
                }
                HubNotice::ResumeGap {
                    collection,
                    last_sequence,
                } => {
                    stats.resume_gaps += 1;
                    tracing::warn!(
                        %collection,
                        last_sequence = ?last_sequence,
                        "resume token rejected; restarting from current position, events may be missing"
                    );
                }
                HubNotice::ReopenFailed {
                    collection,
                    attempt,
                    message,
                } => {
                    stats.reopen_failures += 1;
                    tracing::warn!(%collection, attempt, %message, "failed to reopen change stream");
                }
                HubNotice::ReconnectAttemptFailed { attempt, message } => {
                    tracing::warn!(attempt, %message, "reconnect attempt failed");
                }
                HubNotice::PublishFailed {
                    topic,
                    sequence,
                    message,
                } => {
                    stats.publish_failures += 1;
                    tracing::warn!(%topic, sequence, %message, "broadcast publish failed");
                }
                HubNotice::StateChanged { from, to } => {
                    tracing::info!(from = ?from, to = ?to, "hub state changed");
                }
            }
        }
        // No receivers is fine.
        let _ = self.notices.send(notice);
    }
}
