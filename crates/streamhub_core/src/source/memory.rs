//! In-memory change source.

use super::{ChangeSender, ChangeSource, ChangeStream, ConnectOptions, RawChange};
use crate::error::{HubError, HubResult};
use crate::event::{Document, ResumeToken};
use crate::normalize::document_id;
use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::{json, Value};
use std::collections::{BTreeMap, BTreeSet};

/// An in-memory store that records committed mutations and serves them as
/// change streams.
///
/// Positions are global across collections and start at 1. Every mutation
/// is retained in history so watches can resume from a token. The failure
/// hooks (`drop_connection`, `set_reachable`, `fail_next_connects`,
/// `advance_generation`, `truncate_history`, `set_gap_free_resume`) let
/// tests drive the recovery paths of the hub.
pub struct MemoryChangeSource {
    inner: Mutex<MemoryInner>,
}

struct Watcher {
    collection: String,
    sender: ChangeSender,
}

struct MemoryInner {
    collections: BTreeSet<String>,
    generation: u64,
    next_position: u64,
    /// Positions below this were purged from history.
    retained_from: u64,
    history: BTreeMap<String, Vec<RawChange>>,
    documents: BTreeMap<String, BTreeMap<String, Document>>,
    watchers: Vec<Watcher>,
    connected: bool,
    reachable: bool,
    failing_connects: u32,
    gap_free_resume: bool,
    stream_buffer: usize,
    connect_calls: u32,
    watches_opened: u32,
}

impl MemoryChangeSource {
    /// Creates a source that knows the given collections.
    pub fn new<I, S>(collections: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            inner: Mutex::new(MemoryInner {
                collections: collections.into_iter().map(Into::into).collect(),
                generation: 1,
                next_position: 1,
                retained_from: 1,
                history: BTreeMap::new(),
                documents: BTreeMap::new(),
                watchers: Vec::new(),
                connected: false,
                reachable: true,
                failing_connects: 0,
                gap_free_resume: true,
                stream_buffer: ConnectOptions::default().stream_buffer,
                connect_calls: 0,
                watches_opened: 0,
            }),
        }
    }

    /// Inserts a document. The document must carry an `_id`.
    pub fn insert(&self, collection: &str, document: Value) -> HubResult<u64> {
        let mut inner = self.inner.lock();
        inner.check_collection(collection)?;
        let doc = into_document(collection, document)?;
        let id = id_of(collection, &doc)?;
        inner
            .documents
            .entry(collection.to_string())
            .or_default()
            .insert(id.clone(), doc.clone());

        let change = json!({
            "operationType": "insert",
            "ns": { "coll": collection },
            "documentKey": { "_id": doc.get("_id").cloned().unwrap_or(Value::Null) },
            "fullDocument": Value::Object(doc),
        });
        Ok(inner.commit(collection, change))
    }

    /// Sets and removes fields on an existing document.
    pub fn update(
        &self,
        collection: &str,
        id: &str,
        set: Document,
        unset: &[&str],
    ) -> HubResult<u64> {
        let mut inner = self.inner.lock();
        inner.check_collection(collection)?;
        let docs = inner.documents.entry(collection.to_string()).or_default();
        let current = docs
            .get_mut(id)
            .ok_or_else(|| HubError::malformed(collection, format!("no document {id} to update")))?;

        let before = current.clone();
        for (field, value) in &set {
            current.insert(field.clone(), value.clone());
        }
        for field in unset {
            current.remove(*field);
        }
        let after = current.clone();

        let change = json!({
            "operationType": "update",
            "ns": { "coll": collection },
            "documentKey": { "_id": after.get("_id").cloned().unwrap_or(Value::Null) },
            "updateDescription": {
                "updatedFields": Value::Object(set),
                "removedFields": unset,
            },
            "fullDocument": Value::Object(after),
            "fullDocumentBeforeChange": Value::Object(before),
        });
        Ok(inner.commit(collection, change))
    }

    /// Replaces an existing document wholesale.
    pub fn replace(&self, collection: &str, document: Value) -> HubResult<u64> {
        let mut inner = self.inner.lock();
        inner.check_collection(collection)?;
        let doc = into_document(collection, document)?;
        let id = id_of(collection, &doc)?;
        let docs = inner.documents.entry(collection.to_string()).or_default();
        if !docs.contains_key(&id) {
            return Err(HubError::malformed(
                collection,
                format!("no document {id} to replace"),
            ));
        }
        let before = docs.insert(id, doc.clone()).unwrap_or_default();

        let change = json!({
            "operationType": "replace",
            "ns": { "coll": collection },
            "documentKey": { "_id": doc.get("_id").cloned().unwrap_or(Value::Null) },
            "fullDocument": Value::Object(doc),
            "fullDocumentBeforeChange": Value::Object(before),
        });
        Ok(inner.commit(collection, change))
    }

    /// Deletes a document.
    pub fn delete(&self, collection: &str, id: &str) -> HubResult<u64> {
        let mut inner = self.inner.lock();
        inner.check_collection(collection)?;
        let before = inner
            .documents
            .entry(collection.to_string())
            .or_default()
            .remove(id)
            .ok_or_else(|| HubError::malformed(collection, format!("no document {id} to delete")))?;

        let change = json!({
            "operationType": "delete",
            "ns": { "coll": collection },
            "documentKey": { "_id": before.get("_id").cloned().unwrap_or(Value::Null) },
            "fullDocumentBeforeChange": Value::Object(before),
        });
        Ok(inner.commit(collection, change))
    }

    /// Commits an arbitrary change document without interpreting it.
    pub fn emit_raw(&self, collection: &str, document: Value) -> HubResult<u64> {
        let mut inner = self.inner.lock();
        inner.check_collection(collection)?;
        Ok(inner.commit(collection, document))
    }

    /// Simulates connectivity loss: every open stream receives
    /// `ConnectionLost` and the connection is closed.
    pub fn drop_connection(&self) {
        let mut inner = self.inner.lock();
        for watcher in inner.watchers.drain(..) {
            let _ = watcher
                .sender
                .try_send(Err(HubError::connection_lost("connection reset by store")));
        }
        inner.connected = false;
    }

    /// Controls whether `connect` succeeds.
    pub fn set_reachable(&self, reachable: bool) {
        self.inner.lock().reachable = reachable;
    }

    /// Makes the next `count` connect calls fail.
    pub fn fail_next_connects(&self, count: u32) {
        self.inner.lock().failing_connects = count;
    }

    /// Starts a new generation. Tokens from earlier generations become
    /// invalid and retained history is purged.
    pub fn advance_generation(&self) {
        let mut inner = self.inner.lock();
        inner.generation += 1;
        inner.history.clear();
        inner.retained_from = inner.next_position;
    }

    /// Purges history below `position`.
    pub fn truncate_history(&self, position: u64) {
        let mut inner = self.inner.lock();
        for changes in inner.history.values_mut() {
            changes.retain(|c| c.token.position() >= position);
        }
        inner.retained_from = inner.retained_from.max(position);
    }

    /// When false, resumed streams replay all retained history for the
    /// collection and are flagged as not gap-free.
    pub fn set_gap_free_resume(&self, gap_free: bool) {
        self.inner.lock().gap_free_resume = gap_free;
    }

    /// Returns the position of the most recent commit.
    pub fn latest_position(&self) -> u64 {
        self.inner.lock().next_position - 1
    }

    /// Returns the number of `connect` calls made.
    pub fn connect_calls(&self) -> u32 {
        self.inner.lock().connect_calls
    }

    /// Returns the number of watches opened.
    pub fn watches_opened(&self) -> u32 {
        self.inner.lock().watches_opened
    }

    /// Returns the number of streams currently open.
    pub fn open_streams(&self) -> usize {
        let mut inner = self.inner.lock();
        inner.watchers.retain(|w| !w.sender.is_closed());
        inner.watchers.len()
    }
}

impl MemoryInner {
    fn check_collection(&self, collection: &str) -> HubResult<()> {
        if self.collections.contains(collection) {
            Ok(())
        } else {
            Err(HubError::unknown_collection(collection))
        }
    }

    fn commit(&mut self, collection: &str, document: Value) -> u64 {
        let position = self.next_position;
        self.next_position += 1;

        let change = RawChange {
            token: ResumeToken::new(self.generation, position),
            document,
        };
        self.history
            .entry(collection.to_string())
            .or_default()
            .push(change.clone());

        if self.connected {
            // A watcher whose buffer is full is cut off; its stream ends and
            // the consumer resumes from history.
            self.watchers.retain(|w| {
                w.collection != collection || w.sender.try_send(Ok(change.clone())).is_ok()
            });
        }
        position
    }
}

#[async_trait]
impl ChangeSource for MemoryChangeSource {
    async fn connect(&self, options: &ConnectOptions) -> HubResult<()> {
        let mut inner = self.inner.lock();
        inner.connect_calls += 1;
        if options.max_connections == 0 {
            return Err(HubError::InvalidConfig(
                "max_connections must be at least 1".into(),
            ));
        }
        if inner.failing_connects > 0 {
            inner.failing_connects -= 1;
            return Err(HubError::Connect("connection refused".into()));
        }
        if !inner.reachable {
            return Err(HubError::Connect("store unreachable".into()));
        }
        inner.connected = true;
        inner.stream_buffer = options.stream_buffer;
        Ok(())
    }

    async fn open_watch(
        &self,
        collection: &str,
        from: Option<&ResumeToken>,
    ) -> HubResult<ChangeStream> {
        let mut inner = self.inner.lock();
        inner.check_collection(collection)?;
        if !inner.connected {
            return Err(HubError::connection_lost("not connected"));
        }

        let replay: Vec<RawChange> = match from {
            None => Vec::new(),
            Some(token) => {
                let stale = token.generation() != inner.generation
                    || token.position() + 1 < inner.retained_from;
                if stale {
                    return Err(HubError::InvalidResumeToken {
                        collection: collection.to_string(),
                    });
                }
                let history = inner.history.get(collection).map(Vec::as_slice).unwrap_or(&[]);
                if inner.gap_free_resume {
                    history
                        .iter()
                        .filter(|c| c.token.position() > token.position())
                        .cloned()
                        .collect()
                } else {
                    history.to_vec()
                }
            }
        };

        let gap_free = from.is_none() || inner.gap_free_resume;
        let start = from
            .copied()
            .unwrap_or_else(|| ResumeToken::new(inner.generation, inner.next_position - 1));
        let (sender, stream) = ChangeStream::channel(collection, inner.stream_buffer, gap_free);
        let stream = stream.with_start(start);
        let mut overrun = false;
        for change in replay {
            if sender.try_send(Ok(change)).is_err() {
                overrun = true;
                break;
            }
        }
        if !overrun {
            inner.watchers.push(Watcher {
                collection: collection.to_string(),
                sender,
            });
        }
        inner.watches_opened += 1;
        Ok(stream)
    }

    async fn disconnect(&self) -> HubResult<()> {
        let mut inner = self.inner.lock();
        inner.watchers.clear();
        inner.connected = false;
        Ok(())
    }

    fn is_connected(&self) -> bool {
        self.inner.lock().connected
    }
}

fn into_document(collection: &str, value: Value) -> HubResult<Document> {
    match value {
        Value::Object(doc) => Ok(doc),
        _ => Err(HubError::malformed(collection, "document must be an object")),
    }
}

fn id_of(collection: &str, doc: &Document) -> HubResult<String> {
    doc.get("_id")
        .and_then(document_id)
        .ok_or_else(|| HubError::malformed(collection, "document has no _id"))
}
