//! Hub service lifecycle.
//!
//! A [`Hub`] connects to a [`ChangeSource`], opens one change stream per
//! watched collection, and runs one dispatch task per stream. Each task
//! normalizes raw changes, hands them to the [`Dispatcher`] and advances the
//! collection's checkpoint. When a stream reports connection loss the task
//! goes through the shared reconnect path and reopens from its checkpoint.
//!
//! ```text
//! Stopped ──start──▶ Starting ──streams open──▶ Watching
//!    ▲                  │                        │   ▲
//!    │            connect failed        conn lost│   │reconnected
//!    │                  ▼                        ▼   │
//!    └──────────────  Stopped              Reconnecting ──exhausted──▶ Failed
//! ```
//!
//! `stop` is accepted from every state and always ends in `Stopped`.

use crate::config::HubConfig;
use crate::dispatch::{BroadcastPublisher, Dispatcher};
use crate::error::{HubError, HubResult};
use crate::event::{DomainEvent, ResumeToken};
use crate::normalize::normalize;
use crate::recovery::{retry_connect, Admission, Checkpoints, Cursor, Reconnector, RetryOutcome};
use crate::registry::{Filter, HandlerResult, RegistrationHandle, WatchRegistry};
use crate::report::{HubNotice, HubStats, Reporter};
use crate::source::{ChangeSource, ChangeStream, ConnectOptions, RawChange};
use async_trait::async_trait;
use parking_lot::{Mutex, RwLock};
use std::fmt;
use std::sync::Arc;
use tokio::sync::{broadcast, watch};
use tokio::task::JoinHandle;
use uuid::Uuid;

/// Lifecycle state of a hub.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HubState {
    /// Not running.
    Stopped,
    /// Connecting and opening streams.
    Starting,
    /// All streams are live.
    Watching,
    /// Connection lost; reconnecting with backoff.
    Reconnecting,
    /// Reconnect attempts were exhausted. Must be restarted.
    Failed(String),
}

impl HubState {
    /// Returns true while dispatch tasks are running.
    pub fn is_running(&self) -> bool {
        matches!(self, HubState::Watching | HubState::Reconnecting)
    }

    /// Returns true if `start` may be called.
    pub fn can_start(&self) -> bool {
        matches!(self, HubState::Stopped | HubState::Failed(_))
    }
}

impl fmt::Display for HubState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            HubState::Stopped => f.write_str("stopped"),
            HubState::Starting => f.write_str("starting"),
            HubState::Watching => f.write_str("watching"),
            HubState::Reconnecting => f.write_str("reconnecting"),
            HubState::Failed(reason) => write!(f, "failed ({reason})"),
        }
    }
}

/// A managed service with an explicit lifecycle.
#[async_trait]
pub trait Service: Send + Sync {
    /// Service name.
    fn name(&self) -> &str;

    /// Starts the service. Errors are fatal.
    async fn start(&self) -> HubResult<()>;

    /// Stops the service. Idempotent.
    async fn stop(&self) -> HubResult<()>;
}

/// The change-stream hub.
pub struct Hub {
    inner: Arc<HubInner>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
    lifecycle: tokio::sync::Mutex<()>,
}

struct HubInner {
    instance_id: Uuid,
    config: RwLock<HubConfig>,
    source: Arc<dyn ChangeSource>,
    publisher: Arc<dyn BroadcastPublisher>,
    registry: Arc<WatchRegistry>,
    reporter: Reporter,
    state: RwLock<HubState>,
    checkpoints: Checkpoints,
    reconnector: Reconnector,
    shutdown: Mutex<Option<watch::Sender<bool>>>,
}

impl Hub {
    /// Creates a hub. Nothing is connected until [`Hub::start`].
    pub fn new(
        config: HubConfig,
        source: Arc<dyn ChangeSource>,
        publisher: Arc<dyn BroadcastPublisher>,
    ) -> Self {
        let registry = Arc::new(WatchRegistry::new(config.watched_collections.iter().cloned()));
        let reporter = Reporter::new(config.notice_capacity);
        Self {
            inner: Arc::new(HubInner {
                instance_id: Uuid::new_v4(),
                config: RwLock::new(config),
                source,
                publisher,
                registry,
                reporter,
                state: RwLock::new(HubState::Stopped),
                checkpoints: Checkpoints::default(),
                reconnector: Reconnector::default(),
                shutdown: Mutex::new(None),
            }),
            tasks: Mutex::new(Vec::new()),
            lifecycle: tokio::sync::Mutex::new(()),
        }
    }

    /// Unique id of this hub instance.
    pub fn instance_id(&self) -> Uuid {
        self.inner.instance_id
    }

    /// Gets the current state.
    pub fn state(&self) -> HubState {
        self.inner.state.read().clone()
    }

    /// Gets the current stats.
    pub fn stats(&self) -> HubStats {
        self.inner.reporter.stats()
    }

    /// Gets a copy of the current configuration.
    pub fn config(&self) -> HubConfig {
        self.inner.config.read().clone()
    }

    /// Subscribes to contained failures and state changes.
    pub fn subscribe_notices(&self) -> broadcast::Receiver<HubNotice> {
        self.inner.reporter.subscribe()
    }

    /// Last dispatched position for a collection.
    pub fn checkpoint(&self, collection: &str) -> Option<ResumeToken> {
        self.inner.checkpoints.get(collection)
    }

    /// Number of active registrations on a collection.
    pub fn registration_count(&self, collection: &str) -> usize {
        self.inner.registry.active_count(collection)
    }

    /// Number of registrations waiting for the hub to resume watching.
    pub fn pending_registrations(&self) -> usize {
        self.inner.registry.pending_count()
    }

    /// Registers a handler for changes on `collection`.
    ///
    /// Applied immediately while stopped or watching; queued while starting
    /// or reconnecting and applied once watching resumes. Fails with
    /// `HubNotRunning` after the hub failed, and with `UnknownCollection`
    /// for collections that are not watched.
    pub fn register(
        &self,
        collection: &str,
        filter: Option<Filter>,
        handler: impl Fn(&DomainEvent) -> HandlerResult + Send + Sync + 'static,
    ) -> HubResult<RegistrationHandle> {
        let state = self.inner.state.read();
        match &*state {
            HubState::Failed(_) => Err(HubError::HubNotRunning),
            HubState::Starting | HubState::Reconnecting => {
                self.inner.registry.register_pending(collection, filter, handler)
            }
            HubState::Stopped | HubState::Watching => {
                self.inner.registry.register(collection, filter, handler)
            }
        }
    }

    /// Removes a registration. Repeated calls are no-ops.
    pub fn unregister(&self, handle: &RegistrationHandle) -> bool {
        self.inner.registry.unregister(handle)
    }

    /// Replaces the configuration.
    ///
    /// Reconnect settings apply to the next reconnect. Watched collections
    /// and the topic prefix apply at the next `start`. While the hub is
    /// stopped, registrations on collections the new configuration no
    /// longer watches are dropped.
    pub fn apply_config(&self, config: HubConfig) -> HubResult<()> {
        config.validate()?;
        let state = self.inner.state.read();
        if state.can_start() {
            let dropped = self
                .inner
                .registry
                .set_collections(&config.watched_collections);
            if dropped > 0 {
                tracing::info!(dropped, "dropped registrations on unwatched collections");
            }
        }
        *self.inner.config.write() = config;
        tracing::info!(state = %state.to_string(), "configuration applied");
        Ok(())
    }

    /// Connects, opens every watched collection and begins dispatching.
    ///
    /// Fails without retrying when the source cannot be reached; the state
    /// is then `Stopped` again.
    pub async fn start(&self) -> HubResult<()> {
        let _lifecycle = self.lifecycle.lock().await;
        let inner = &self.inner;

        let current = inner.state();
        if !current.can_start() {
            return Err(HubError::InvalidStateTransition {
                from: current.to_string(),
                to: HubState::Starting.to_string(),
            });
        }

        let config = inner.config.read().clone();
        config.validate()?;
        inner.registry.set_collections(&config.watched_collections);
        inner.transition(HubState::Starting);

        tracing::info!(
            instance = %inner.instance_id,
            collections = config.watched_collections.len(),
            "starting hub"
        );

        if let Err(e) = inner.source.connect(&connect_options(&config)).await {
            tracing::error!(error = %e, "change source unreachable; hub not started");
            inner.transition(HubState::Stopped);
            return Err(e);
        }

        let mut streams = Vec::with_capacity(config.watched_collections.len());
        for collection in &config.watched_collections {
            let mut cursor = inner.checkpoints.cursor(collection);
            match inner.reopen(collection, &mut cursor).await {
                Ok(stream) => streams.push((collection.clone(), cursor, stream)),
                Err(e) => {
                    tracing::error!(%collection, error = %e, "failed to open change stream");
                    if let Err(close) = inner.source.disconnect().await {
                        tracing::warn!(error = %close, "disconnect after failed start");
                    }
                    inner.transition(HubState::Stopped);
                    return Err(e);
                }
            }
        }

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        *inner.shutdown.lock() = Some(shutdown_tx);
        let dispatcher = Arc::new(Dispatcher::new(
            Arc::clone(&inner.registry),
            Arc::clone(&inner.publisher),
            config.topic_prefix.clone(),
        ));

        inner.enter_watching();

        let mut tasks = self.tasks.lock();
        for (collection, cursor, stream) in streams {
            let task = Arc::clone(inner).watch_collection(
                Arc::clone(&dispatcher),
                collection,
                cursor,
                stream,
                shutdown_rx.clone(),
            );
            tasks.push(tokio::spawn(task));
        }

        Ok(())
    }

    /// Stops dispatching, drops all registrations and releases the
    /// connection.
    ///
    /// The event being dispatched when `stop` is called is allowed to
    /// finish. Backoff timers are cancelled. Calling `stop` on a stopped
    /// hub does nothing.
    pub async fn stop(&self) -> HubResult<()> {
        let _lifecycle = self.lifecycle.lock().await;
        let inner = &self.inner;

        let tasks = std::mem::take(&mut *self.tasks.lock());
        if inner.state() == HubState::Stopped && tasks.is_empty() {
            return Ok(());
        }

        tracing::info!(instance = %inner.instance_id, "stopping hub");
        inner.signal_shutdown();
        for task in tasks {
            if let Err(e) = task.await {
                tracing::warn!(error = %e, "dispatch task ended abnormally");
            }
        }
        inner.shutdown.lock().take();

        inner.registry.clear();
        if let Err(e) = inner.source.disconnect().await {
            tracing::warn!(error = %e, "failed to release change source connection");
        }
        inner.transition(HubState::Stopped);
        Ok(())
    }
}

impl Drop for Hub {
    fn drop(&mut self) {
        self.inner.signal_shutdown();
    }
}

#[async_trait]
impl Service for Hub {
    fn name(&self) -> &str {
        "hub"
    }

    async fn start(&self) -> HubResult<()> {
        Hub::start(self).await
    }

    async fn stop(&self) -> HubResult<()> {
        Hub::stop(self).await
    }
}

fn connect_options(config: &HubConfig) -> ConnectOptions {
    ConnectOptions {
        max_connections: config.max_connections,
        stream_buffer: config.stream_buffer,
    }
}

impl HubInner {
    fn state(&self) -> HubState {
        self.state.read().clone()
    }

    fn transition(&self, to: HubState) {
        let from = std::mem::replace(&mut *self.state.write(), to.clone());
        if from != to {
            self.reporter.notice(HubNotice::StateChanged { from, to });
        }
    }

    /// Enters `Watching` and applies queued registrations under the state
    /// lock, so no registration can be queued after the drain.
    fn enter_watching(&self) {
        let (from, applied) = {
            let mut state = self.state.write();
            let from = std::mem::replace(&mut *state, HubState::Watching);
            (from, self.registry.apply_pending())
        };
        if applied > 0 {
            tracing::debug!(applied, "applied queued registrations");
        }
        if from != HubState::Watching {
            self.reporter.notice(HubNotice::StateChanged {
                from,
                to: HubState::Watching,
            });
        }
    }

    fn signal_shutdown(&self) {
        if let Some(tx) = self.shutdown.lock().as_ref() {
            let _ = tx.send(true);
        }
    }

    /// Opens a watch from the cursor's checkpoint. A rejected token is
    /// reported as a gap and the watch restarts from the current position.
    ///
    /// A cursor without a checkpoint is seeded with the stream's start
    /// token, so changes committed before the first dispatch are replayed
    /// after a connection loss instead of skipped.
    async fn reopen(&self, collection: &str, cursor: &mut Cursor) -> HubResult<ChangeStream> {
        let token = cursor.token();
        let stream = match self.source.open_watch(collection, token.as_ref()).await {
            Err(HubError::InvalidResumeToken { .. }) => {
                self.reporter.notice(HubNotice::ResumeGap {
                    collection: collection.to_string(),
                    last_sequence: cursor.last_sequence(),
                });
                cursor.reset();
                self.checkpoints.remove(collection);
                self.source.open_watch(collection, None).await?
            }
            other => other?,
        };

        if cursor.token().is_none() {
            if let Some(start) = stream.start_token() {
                cursor.advance(start);
                self.checkpoints.store(collection, start);
            }
        }
        Ok(stream)
    }

    async fn watch_collection(
        self: Arc<Self>,
        dispatcher: Arc<Dispatcher>,
        collection: String,
        mut cursor: Cursor,
        mut stream: ChangeStream,
        mut shutdown: watch::Receiver<bool>,
    ) {
        tracing::debug!(%collection, resume = ?cursor.last_sequence(), "watching collection");
        loop {
            let interruption = loop {
                let item = tokio::select! {
                    biased;
                    _ = shutdown.changed() => return,
                    item = stream.next() => item,
                };
                match item {
                    Some(Ok(raw)) => {
                        self.handle_change(&dispatcher, &collection, &mut cursor, &raw, stream.is_gap_free())
                            .await
                    }
                    Some(Err(e)) => break e,
                    None => break HubError::connection_lost("change stream ended"),
                }
            };

            tracing::warn!(%collection, error = %interruption, "change stream interrupted");
            match self.recover(&collection, &mut cursor, &mut shutdown).await {
                Some(resumed) => {
                    tracing::info!(%collection, resume = ?cursor.last_sequence(), "change stream resumed");
                    stream = resumed;
                }
                None => return,
            }
        }
    }

    async fn handle_change(
        &self,
        dispatcher: &Dispatcher,
        collection: &str,
        cursor: &mut Cursor,
        raw: &RawChange,
        gap_free: bool,
    ) {
        self.reporter.count(|s| s.events_received += 1);

        let admission = cursor.admit(&raw.token, gap_free);
        if admission == Admission::Duplicate {
            self.reporter.count(|s| s.duplicates_skipped += 1);
            tracing::trace!(%collection, position = raw.token.position(), "skipping duplicate");
            return;
        }

        match normalize(collection, raw) {
            Ok(event) => {
                let report = dispatcher.dispatch(&event).await;
                self.reporter.count(|s| {
                    s.events_dispatched += 1;
                    s.deliveries += report.delivered as u64;
                });
                for failure in report.failures {
                    if let HubError::HandlerFailure {
                        registration,
                        message,
                    } = failure
                    {
                        self.reporter.notice(HubNotice::HandlerFailure {
                            collection: collection.to_string(),
                            registration,
                            sequence: event.sequence,
                            message,
                        });
                    }
                }
                if let Some(e) = report.publish_error {
                    self.reporter.notice(HubNotice::PublishFailed {
                        topic: dispatcher.topic_for(collection),
                        sequence: event.sequence,
                        message: e.to_string(),
                    });
                }
            }
            Err(HubError::MalformedEvent { reason, .. }) => {
                self.reporter.notice(HubNotice::MalformedEvent {
                    collection: collection.to_string(),
                    reason,
                });
            }
            Err(e) => {
                self.reporter.notice(HubNotice::MalformedEvent {
                    collection: collection.to_string(),
                    reason: e.to_string(),
                });
            }
        }

        // Dropped malformed changes advance too, so a resume does not
        // replay them.
        if admission == Admission::Advance {
            cursor.advance(raw.token);
            self.checkpoints.store(collection, raw.token);
        }
    }

    /// Reopens a collection's watch, reconnecting first if needed.
    ///
    /// Connection errors go through the shared reconnect. Any other reopen
    /// error is reported and retried with backoff; once the attempt ceiling
    /// is reached the hub fails. Returns `None` when the hub is stopping or
    /// has failed.
    async fn recover(
        &self,
        collection: &str,
        cursor: &mut Cursor,
        shutdown: &mut watch::Receiver<bool>,
    ) -> Option<ChangeStream> {
        let mut failures = 0u32;
        loop {
            if *shutdown.borrow() {
                return None;
            }

            let observed = self.reconnector.epoch();
            match self.reopen(collection, cursor).await {
                Ok(stream) => return Some(stream),
                Err(e) if e.is_retryable() => {
                    tracing::debug!(%collection, error = %e, "reopen failed; reconnecting");
                    if let Err(e) = self.reconnect(observed, shutdown).await {
                        if e.is_fatal() {
                            tracing::error!(%collection, error = %e, "watch stopped");
                        }
                        return None;
                    }
                }
                Err(e) => {
                    failures += 1;
                    self.reporter.notice(HubNotice::ReopenFailed {
                        collection: collection.to_string(),
                        attempt: failures,
                        message: e.to_string(),
                    });

                    let policy = self.config.read().reconnect.clone();
                    if failures >= policy.max_attempts {
                        let error = HubError::ReconnectExhausted { attempts: failures };
                        tracing::error!(%collection, error = %error, "giving up on change stream");
                        self.fail(&error).await;
                        return None;
                    }
                    tokio::select! {
                        _ = tokio::time::sleep(policy.delay_for_attempt(failures)) => {}
                        _ = shutdown.changed() => return None,
                    }
                }
            }
        }
    }

    /// Enters `Failed`, stops every task and releases the connection.
    async fn fail(&self, error: &HubError) {
        self.transition(HubState::Failed(error.to_string()));
        self.signal_shutdown();
        if let Err(e) = self.source.disconnect().await {
            tracing::warn!(error = %e, "disconnect after failure");
        }
    }

    /// Runs the backoff loop unless another task already reconnected.
    async fn reconnect(
        &self,
        observed: u64,
        shutdown: &mut watch::Receiver<bool>,
    ) -> HubResult<()> {
        let Some(_guard) = self.reconnector.begin(observed).await else {
            return Ok(());
        };
        if matches!(self.state(), HubState::Failed(_)) {
            return Err(HubError::HubNotRunning);
        }

        self.transition(HubState::Reconnecting);
        let (policy, options) = {
            let config = self.config.read();
            (config.reconnect.clone(), connect_options(&config))
        };

        let outcome = retry_connect(&policy, shutdown, &self.reporter, || {
            self.source.connect(&options)
        })
        .await;

        match outcome {
            RetryOutcome::Connected { attempts } => {
                self.reporter.count(|s| s.reconnects += 1);
                self.reconnector.complete();
                tracing::info!(attempts, "reconnected to change source");
                self.enter_watching();
                Ok(())
            }
            RetryOutcome::Exhausted { attempts } => {
                let error = HubError::ReconnectExhausted { attempts };
                tracing::error!(error = %error, "giving up on change source");
                self.fail(&error).await;
                Err(error)
            }
            RetryOutcome::Cancelled => Err(HubError::HubNotRunning),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ReconnectConfig;
    use crate::dispatch::MemoryBroadcast;
    use crate::source::MemoryChangeSource;
    use serde_json::json;
    use std::time::Duration;

    fn hub_with(collections: &[&str]) -> (Hub, Arc<MemoryChangeSource>) {
        let source = Arc::new(MemoryChangeSource::new(collections.iter().copied()));
        let config = HubConfig::new(collections.iter().copied()).with_reconnect(
            ReconnectConfig::new(3)
                .with_backoff_base(Duration::from_millis(1))
                .with_backoff_cap(Duration::from_millis(5)),
        );
        let hub = Hub::new(
            config,
            Arc::clone(&source) as Arc<dyn ChangeSource>,
            Arc::new(MemoryBroadcast::default()),
        );
        (hub, source)
    }

    #[test]
    fn state_checks() {
        assert!(HubState::Stopped.can_start());
        assert!(HubState::Failed("x".into()).can_start());
        assert!(!HubState::Watching.can_start());
        assert!(HubState::Reconnecting.is_running());
        assert!(!HubState::Starting.is_running());
        assert_eq!(HubState::Watching.to_string(), "watching");
    }

    #[tokio::test]
    async fn start_and_stop() {
        let (hub, source) = hub_with(&["rooms", "users"]);
        assert_eq!(hub.state(), HubState::Stopped);
        assert_eq!(Service::name(&hub), "hub");

        hub.start().await.unwrap();
        assert_eq!(hub.state(), HubState::Watching);
        assert!(source.is_connected());
        assert_eq!(source.watches_opened(), 2);

        hub.stop().await.unwrap();
        assert_eq!(hub.state(), HubState::Stopped);
        assert!(!source.is_connected());
        hub.stop().await.unwrap();
        assert_eq!(hub.state(), HubState::Stopped);
    }

    #[tokio::test]
    async fn double_start_is_rejected() {
        let (hub, _source) = hub_with(&["rooms"]);
        hub.start().await.unwrap();
        assert!(matches!(
            hub.start().await,
            Err(HubError::InvalidStateTransition { .. })
        ));
        hub.stop().await.unwrap();
    }

    #[tokio::test]
    async fn invalid_config_does_not_change_state() {
        let (hub, _source) = hub_with(&["rooms"]);
        assert!(hub
            .apply_config(HubConfig::new(["rooms"]).with_max_connections(0))
            .is_err());
        assert_eq!(hub.config().max_connections, 1);
        assert_eq!(hub.state(), HubState::Stopped);
    }

    #[tokio::test]
    async fn apply_config_changes_accepted_collections_while_stopped() {
        let (hub, _source) = hub_with(&["rooms", "users"]);
        assert!(hub.register("users", None, |_| Ok(())).is_ok());

        hub.apply_config(HubConfig::new(["rooms"])).unwrap();
        assert_eq!(hub.registration_count("users"), 0);
        assert!(matches!(
            hub.register("users", None, |_| Ok(())),
            Err(HubError::UnknownCollection { .. })
        ));
    }

    #[tokio::test]
    async fn opening_a_watch_seeds_the_checkpoint() {
        let (hub, source) = hub_with(&["rooms", "users"]);
        source.insert("users", json!({"_id": "u1"})).unwrap();

        hub.start().await.unwrap();
        assert_eq!(hub.checkpoint("rooms"), Some(ResumeToken::new(1, 1)));
        assert_eq!(hub.checkpoint("users"), Some(ResumeToken::new(1, 1)));
        hub.stop().await.unwrap();
    }

    #[tokio::test]
    async fn checkpoint_survives_restart() {
        let (hub, source) = hub_with(&["rooms"]);
        let mut notices = hub.subscribe_notices();
        hub.start().await.unwrap();

        source.insert("rooms", json!({"_id": "r1"})).unwrap();
        let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
        while hub.checkpoint("rooms").map(|t| t.position()) != Some(1) {
            assert!(tokio::time::Instant::now() < deadline, "checkpoint never advanced");
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        hub.stop().await.unwrap();

        hub.start().await.unwrap();
        assert_eq!(hub.checkpoint("rooms").map(|t| t.position()), Some(1));
        hub.stop().await.unwrap();

        let mut saw_watching = false;
        while let Ok(notice) = notices.try_recv() {
            if let HubNotice::StateChanged { to: HubState::Watching, .. } = notice {
                saw_watching = true;
            }
        }
        assert!(saw_watching);
    }
}
