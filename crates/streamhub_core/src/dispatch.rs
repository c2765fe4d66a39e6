//! Broadcast dispatcher.
//!
//! Fans each [`DomainEvent`] out to the local handlers registered on its
//! collection, in registration order, and then publishes it once to the
//! cross-instance channel. A failing handler never stops delivery to the
//! handlers after it or the publish; failures are collected in the
//! returned [`DispatchReport`].

use crate::error::{HubError, HubResult};
use crate::event::DomainEvent;
use crate::registry::{Delivery, WatchRegistry};
use async_trait::async_trait;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::broadcast;

/// Cross-instance publish port.
///
/// Implementations forward events to the other server processes sharing
/// the store. The hub does not implement the transport.
#[async_trait]
pub trait BroadcastPublisher: Send + Sync {
    /// Publishes an event under a topic.
    async fn publish(&self, topic: &str, event: &DomainEvent) -> HubResult<()>;
}

/// An in-process publisher backed by a tokio broadcast channel.
pub struct MemoryBroadcast {
    sender: broadcast::Sender<(String, DomainEvent)>,
    failing: AtomicBool,
    published: AtomicU64,
}

impl MemoryBroadcast {
    /// Creates a publisher buffering up to `capacity` messages per
    /// receiver.
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self {
            sender,
            failing: AtomicBool::new(false),
            published: AtomicU64::new(0),
        }
    }

    /// Subscribes to everything published from now on.
    pub fn subscribe(&self) -> broadcast::Receiver<(String, DomainEvent)> {
        self.sender.subscribe()
    }

    /// Makes every publish fail while set.
    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }

    /// Returns the number of successful publishes.
    pub fn published(&self) -> u64 {
        self.published.load(Ordering::SeqCst)
    }
}

impl Default for MemoryBroadcast {
    fn default() -> Self {
        Self::new(1024)
    }
}

#[async_trait]
impl BroadcastPublisher for MemoryBroadcast {
    async fn publish(&self, topic: &str, event: &DomainEvent) -> HubResult<()> {
        if self.failing.load(Ordering::SeqCst) {
            return Err(HubError::Publish {
                topic: topic.to_string(),
                message: "broadcast channel unavailable".into(),
            });
        }
        // Publishing with no remote listeners is not an error.
        let _ = self.sender.send((topic.to_string(), event.clone()));
        self.published.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

/// What happened while dispatching one event.
#[derive(Debug, Default)]
pub struct DispatchReport {
    /// Handlers that ran successfully.
    pub delivered: usize,
    /// Handlers whose filter rejected the event.
    pub skipped: usize,
    /// Handler failures, as `HubError::HandlerFailure`.
    pub failures: Vec<HubError>,
    /// Publish failure, if any.
    pub publish_error: Option<HubError>,
}

/// Delivers events to local handlers and the broadcast channel.
pub struct Dispatcher {
    registry: Arc<WatchRegistry>,
    publisher: Arc<dyn BroadcastPublisher>,
    topic_prefix: String,
}

impl Dispatcher {
    /// Creates a dispatcher publishing under `<topic_prefix>.<collection>`.
    pub fn new(
        registry: Arc<WatchRegistry>,
        publisher: Arc<dyn BroadcastPublisher>,
        topic_prefix: impl Into<String>,
    ) -> Self {
        Self {
            registry,
            publisher,
            topic_prefix: topic_prefix.into(),
        }
    }

    /// Returns the broadcast topic for a collection.
    pub fn topic_for(&self, collection: &str) -> String {
        format!("{}.{}", self.topic_prefix, collection)
    }

    /// Dispatches one event.
    pub async fn dispatch(&self, event: &DomainEvent) -> DispatchReport {
        let mut report = DispatchReport::default();

        for registration in self.registry.snapshot(&event.collection) {
            match registration.deliver(event) {
                Delivery::Delivered => report.delivered += 1,
                Delivery::Skipped => report.skipped += 1,
                Delivery::Failed(message) => report.failures.push(HubError::HandlerFailure {
                    registration: registration.id(),
                    message,
                }),
            }
        }

        let topic = self.topic_for(&event.collection);
        tracing::trace!(
            %topic,
            sequence = event.sequence,
            delivered = report.delivered,
            "dispatched event"
        );
        if let Err(e) = self.publisher.publish(&topic, event).await {
            report.publish_error = Some(e);
        }

        report
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::{Document, OperationKind};
    use crate::registry::Filter;
    use parking_lot::Mutex;

    fn event(collection: &str, sequence: u64) -> DomainEvent {
        DomainEvent {
            kind: OperationKind::Insert,
            collection: collection.into(),
            document_id: "d".into(),
            before: None,
            after: Some(Document::new()),
            diff: None,
            sequence,
        }
    }

    fn setup(collections: &[&str]) -> (Arc<WatchRegistry>, Arc<MemoryBroadcast>, Dispatcher) {
        let registry = Arc::new(WatchRegistry::new(collections.iter().copied()));
        let broadcast = Arc::new(MemoryBroadcast::new(16));
        let dispatcher = Dispatcher::new(
            Arc::clone(&registry),
            Arc::clone(&broadcast) as Arc<dyn BroadcastPublisher>,
            "watch",
        );
        (registry, broadcast, dispatcher)
    }

    #[tokio::test]
    async fn delivers_in_registration_order_then_publishes() {
        let (registry, broadcast, dispatcher) = setup(&["rooms"]);
        let order = Arc::new(Mutex::new(Vec::new()));
        for name in ["first", "second", "third"] {
            let order = Arc::clone(&order);
            registry
                .register("rooms", None, move |_| {
                    order.lock().push(name);
                    Ok(())
                })
                .unwrap();
        }
        let mut rx = broadcast.subscribe();

        let report = dispatcher.dispatch(&event("rooms", 1)).await;
        assert_eq!(report.delivered, 3);
        assert_eq!(*order.lock(), vec!["first", "second", "third"]);

        let (topic, published) = rx.recv().await.unwrap();
        assert_eq!(topic, "watch.rooms");
        assert_eq!(published.sequence, 1);
        assert_eq!(broadcast.published(), 1);
    }

    #[tokio::test]
    async fn failing_handler_does_not_stop_others() {
        let (registry, broadcast, dispatcher) = setup(&["rooms"]);
        let failing = registry
            .register("rooms", None, |_| Err("boom".into()))
            .unwrap();
        let seen = Arc::new(Mutex::new(0));
        let seen_ref = Arc::clone(&seen);
        registry
            .register("rooms", None, move |_| {
                *seen_ref.lock() += 1;
                Ok(())
            })
            .unwrap();

        let report = dispatcher.dispatch(&event("rooms", 1)).await;
        assert_eq!(*seen.lock(), 1);
        assert_eq!(report.failures.len(), 1);
        assert!(matches!(
            &report.failures[0],
            HubError::HandlerFailure { registration, .. } if *registration == failing.id()
        ));
        assert_eq!(broadcast.published(), 1);
    }

    #[tokio::test]
    async fn publish_failure_is_reported_not_propagated() {
        let (registry, broadcast, dispatcher) = setup(&["users"]);
        registry
            .register("users", Some(Filter::kinds(&[OperationKind::Delete])), |_| Ok(()))
            .unwrap();
        broadcast.set_failing(true);

        let report = dispatcher.dispatch(&event("users", 5)).await;
        assert_eq!(report.skipped, 1);
        assert!(matches!(report.publish_error, Some(HubError::Publish { .. })));
        assert_eq!(broadcast.published(), 0);
    }

    #[tokio::test]
    async fn events_without_handlers_are_still_published() {
        let (_registry, broadcast, dispatcher) = setup(&["settings"]);
        let report = dispatcher.dispatch(&event("settings", 2)).await;
        assert_eq!(report.delivered, 0);
        assert_eq!(broadcast.published(), 1);
    }
}
