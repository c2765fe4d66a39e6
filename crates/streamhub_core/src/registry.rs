//! Collection watch registry.
//!
//! Tracks which handlers observe which collection. The hub opens exactly
//! one change stream per watched collection; registering another handler
//! only attaches it to that stream.
//!
//! Every registration carries an active flag and a gate. The dispatcher
//! checks the flag and runs the handler while holding the gate. Called from
//! outside any handler, `unregister` clears the flag and then takes the
//! gate, so once it returns the handler is never invoked again. Called from
//! inside a handler, it only clears the flag: the in-flight invocation of
//! the other registration may finish, and no later one starts. A handler
//! never blocks on another registration's gate, so handlers on different
//! collections can unregister each other.

use crate::error::{HubError, HubResult};
use crate::event::{DomainEvent, OperationKind};
use parking_lot::{Mutex, RwLock};
use serde_json::Value;
use std::cell::Cell;
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

/// Error type returned by handlers.
pub type HandlerError = Box<dyn std::error::Error + Send + Sync>;

/// Result type returned by handlers.
pub type HandlerResult = Result<(), HandlerError>;

type HandlerFn = dyn Fn(&DomainEvent) -> HandlerResult + Send + Sync;

thread_local! {
    static IN_HANDLER: Cell<bool> = const { Cell::new(false) };
}

/// Marks the current thread as running a handler until dropped.
struct HandlerScope {
    outer: bool,
}

impl HandlerScope {
    fn enter() -> Self {
        Self {
            outer: IN_HANDLER.with(|flag| flag.replace(true)),
        }
    }

    fn active() -> bool {
        IN_HANDLER.with(Cell::get)
    }
}

impl Drop for HandlerScope {
    fn drop(&mut self) {
        IN_HANDLER.with(|flag| flag.set(self.outer));
    }
}

/// Predicate deciding whether a handler sees an event.
#[derive(Clone)]
pub struct Filter(Arc<dyn Fn(&DomainEvent) -> bool + Send + Sync>);

impl Filter {
    /// Creates a filter from a predicate.
    pub fn new(predicate: impl Fn(&DomainEvent) -> bool + Send + Sync + 'static) -> Self {
        Self(Arc::new(predicate))
    }

    /// Accepts events whose document has `field == value`, looking at the
    /// after projection first and the before projection otherwise.
    pub fn field_equals(field: impl Into<String>, value: Value) -> Self {
        let field = field.into();
        Self::new(move |event| event.field(&field) == Some(&value))
    }

    /// Accepts only the given operation kinds.
    pub fn kinds(kinds: &[OperationKind]) -> Self {
        let kinds = kinds.to_vec();
        Self::new(move |event| kinds.contains(&event.kind))
    }

    /// Evaluates the filter.
    pub fn matches(&self, event: &DomainEvent) -> bool {
        (self.0)(event)
    }
}

impl fmt::Debug for Filter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("Filter(..)")
    }
}

/// Handle returned by [`WatchRegistry::register`].
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct RegistrationHandle {
    id: u64,
    collection: String,
}

impl RegistrationHandle {
    /// Registration id; ids increase in registration order.
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Collection the registration watches.
    pub fn collection(&self) -> &str {
        &self.collection
    }
}

/// Outcome of offering an event to one registration.
#[derive(Debug)]
pub(crate) enum Delivery {
    /// The handler ran and succeeded.
    Delivered,
    /// The filter rejected the event or the registration is gone.
    Skipped,
    /// The handler returned an error or panicked.
    Failed(String),
}

pub(crate) struct Registration {
    id: u64,
    collection: String,
    filter: Option<Filter>,
    handler: Box<HandlerFn>,
    active: AtomicBool,
    gate: Mutex<()>,
}

impl Registration {
    pub(crate) fn id(&self) -> u64 {
        self.id
    }

    /// Runs the handler if the registration is still active and the filter
    /// accepts the event.
    pub(crate) fn deliver(&self, event: &DomainEvent) -> Delivery {
        let _gate = self.gate.lock();
        if !self.active.load(Ordering::SeqCst) || event.collection != self.collection {
            return Delivery::Skipped;
        }
        if let Some(filter) = &self.filter {
            if !filter.matches(event) {
                return Delivery::Skipped;
            }
        }

        let _scope = HandlerScope::enter();
        match panic::catch_unwind(AssertUnwindSafe(|| (self.handler)(event))) {
            Ok(Ok(())) => Delivery::Delivered,
            Ok(Err(e)) => Delivery::Failed(e.to_string()),
            Err(payload) => Delivery::Failed(panic_message(payload.as_ref())),
        }
    }

    fn deactivate(&self) {
        self.active.store(false, Ordering::SeqCst);
        if !HandlerScope::active() {
            // Wait out an invocation in progress on another thread.
            drop(self.gate.lock());
        }
    }
}

/// Registry of watch registrations, keyed by collection.
pub struct WatchRegistry {
    collections: RwLock<BTreeSet<String>>,
    next_id: AtomicU64,
    active: RwLock<BTreeMap<String, BTreeMap<u64, Arc<Registration>>>>,
    pending: RwLock<Vec<Arc<Registration>>>,
}

impl WatchRegistry {
    /// Creates a registry accepting the given collections.
    pub fn new<I, S>(collections: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            collections: RwLock::new(collections.into_iter().map(Into::into).collect()),
            next_id: AtomicU64::new(1),
            active: RwLock::new(BTreeMap::new()),
            pending: RwLock::new(Vec::new()),
        }
    }

    /// Registers a handler; it receives events from the next dispatch on.
    pub fn register(
        &self,
        collection: &str,
        filter: Option<Filter>,
        handler: impl Fn(&DomainEvent) -> HandlerResult + Send + Sync + 'static,
    ) -> HubResult<RegistrationHandle> {
        let registration = self.build(collection, filter, Box::new(handler))?;
        let handle = handle_of(&registration);
        self.attach(registration);
        Ok(handle)
    }

    /// Registers a handler that stays inactive until [`apply_pending`] runs.
    ///
    /// [`apply_pending`]: WatchRegistry::apply_pending
    pub(crate) fn register_pending(
        &self,
        collection: &str,
        filter: Option<Filter>,
        handler: impl Fn(&DomainEvent) -> HandlerResult + Send + Sync + 'static,
    ) -> HubResult<RegistrationHandle> {
        let registration = self.build(collection, filter, Box::new(handler))?;
        let handle = handle_of(&registration);
        self.pending.write().push(registration);
        Ok(handle)
    }

    /// Activates queued registrations. Returns how many were applied.
    pub(crate) fn apply_pending(&self) -> usize {
        let pending: Vec<_> = self.pending.write().drain(..).collect();
        let applied = pending.len();
        for registration in pending {
            self.attach(registration);
        }
        applied
    }

    /// Removes a registration. Repeated calls are no-ops.
    ///
    /// Returns true if the registration existed. After this returns the
    /// handler will not be invoked again.
    pub fn unregister(&self, handle: &RegistrationHandle) -> bool {
        let removed = {
            let mut active = self.active.write();
            active
                .get_mut(&handle.collection)
                .and_then(|regs| regs.remove(&handle.id))
        };
        let removed = removed.or_else(|| {
            let mut pending = self.pending.write();
            let index = pending.iter().position(|r| r.id == handle.id)?;
            Some(pending.remove(index))
        });

        match removed {
            Some(registration) => {
                registration.deactivate();
                true
            }
            None => false,
        }
    }

    /// Removes every registration, active and queued.
    pub fn clear(&self) {
        let active: Vec<_> = std::mem::take(&mut *self.active.write())
            .into_values()
            .flat_map(BTreeMap::into_values)
            .collect();
        let pending: Vec<_> = self.pending.write().drain(..).collect();
        for registration in active.iter().chain(pending.iter()) {
            registration.deactivate();
        }
    }

    /// Replaces the set of accepted collections. Registrations on
    /// collections outside the new set are dropped; returns how many.
    pub(crate) fn set_collections(&self, collections: &BTreeSet<String>) -> usize {
        *self.collections.write() = collections.clone();

        let mut dropped: Vec<Arc<Registration>> = {
            let mut active = self.active.write();
            let removed: Vec<String> = active
                .keys()
                .filter(|c| !collections.contains(*c))
                .cloned()
                .collect();
            removed
                .iter()
                .filter_map(|c| active.remove(c))
                .flat_map(BTreeMap::into_values)
                .collect()
        };
        self.pending.write().retain(|r| {
            let keep = collections.contains(&r.collection);
            if !keep {
                dropped.push(Arc::clone(r));
            }
            keep
        });

        for registration in &dropped {
            registration.deactivate();
            tracing::info!(
                collection = %registration.collection,
                registration = registration.id,
                "collection no longer watched; registration dropped"
            );
        }
        dropped.len()
    }

    /// Checks if a collection is accepted.
    pub fn knows(&self, collection: &str) -> bool {
        self.collections.read().contains(collection)
    }

    /// Returns the active registrations for a collection in registration
    /// order.
    pub(crate) fn snapshot(&self, collection: &str) -> Vec<Arc<Registration>> {
        self.active
            .read()
            .get(collection)
            .map(|regs| regs.values().cloned().collect())
            .unwrap_or_default()
    }

    /// Returns the number of active registrations on a collection.
    pub fn active_count(&self, collection: &str) -> usize {
        self.active.read().get(collection).map_or(0, BTreeMap::len)
    }

    /// Returns the number of queued registrations.
    pub fn pending_count(&self) -> usize {
        self.pending.read().len()
    }

    /// Returns the total number of active registrations.
    pub fn len(&self) -> usize {
        self.active.read().values().map(BTreeMap::len).sum()
    }

    /// Returns true if there are no active registrations.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn build(
        &self,
        collection: &str,
        filter: Option<Filter>,
        handler: Box<HandlerFn>,
    ) -> HubResult<Arc<Registration>> {
        if !self.knows(collection) {
            return Err(HubError::unknown_collection(collection));
        }
        Ok(Arc::new(Registration {
            id: self.next_id.fetch_add(1, Ordering::SeqCst),
            collection: collection.to_string(),
            filter,
            handler,
            active: AtomicBool::new(true),
            gate: Mutex::new(()),
        }))
    }

    fn attach(&self, registration: Arc<Registration>) {
        tracing::debug!(
            collection = %registration.collection,
            registration = registration.id,
            "watch registered"
        );
        self.active
            .write()
            .entry(registration.collection.clone())
            .or_default()
            .insert(registration.id, registration);
    }
}

fn handle_of(registration: &Registration) -> RegistrationHandle {
    RegistrationHandle {
        id: registration.id,
        collection: registration.collection.clone(),
    }
}

fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        format!("handler panicked: {s}")
    } else if let Some(s) = payload.downcast_ref::<String>() {
        format!("handler panicked: {s}")
    } else {
        "handler panicked".to_string()
    }
}
