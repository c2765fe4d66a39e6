//! Normalized change events and resume positions.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::fmt;

/// A JSON document projection.
pub type Document = Map<String, Value>;

/// Kind of committed mutation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OperationKind {
    /// Document was inserted.
    Insert,
    /// Some fields of a document changed.
    Update,
    /// A document was replaced wholesale.
    Replace,
    /// Document was deleted.
    Delete,
}

impl OperationKind {
    /// Parses the store's operation marker.
    pub fn from_marker(marker: &str) -> Option<Self> {
        match marker {
            "insert" => Some(Self::Insert),
            "update" => Some(Self::Update),
            "replace" => Some(Self::Replace),
            "delete" => Some(Self::Delete),
            _ => None,
        }
    }

    /// Returns the store's operation marker.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Insert => "insert",
            Self::Update => "update",
            Self::Replace => "replace",
            Self::Delete => "delete",
        }
    }
}

impl fmt::Display for OperationKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Opaque position in a change stream.
///
/// Only the change source that issued a token interprets it. Tokens from
/// different generations are not comparable.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ResumeToken {
    generation: u64,
    position: u64,
}

impl ResumeToken {
    /// Creates a token. Intended for change source implementations.
    pub fn new(generation: u64, position: u64) -> Self {
        Self {
            generation,
            position,
        }
    }

    /// Source generation that issued this token.
    pub fn generation(&self) -> u64 {
        self.generation
    }

    /// Commit position of the change this token follows.
    pub fn position(&self) -> u64 {
        self.position
    }
}

/// Field-level description of an update, as supplied by the store.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct UpdateDiff {
    /// Fields that were set, with their new values.
    pub updated_fields: Document,
    /// Fields that were removed.
    pub removed_fields: Vec<String>,
}

/// A normalized change event.
///
/// Immutable once built; every event corresponds to exactly one committed
/// mutation in the source store.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DomainEvent {
    /// Kind of mutation.
    pub kind: OperationKind,
    /// Logical collection.
    pub collection: String,
    /// Id of the mutated document.
    pub document_id: String,
    /// Document before the change, when the store supplied it.
    pub before: Option<Document>,
    /// Document after the change, when the store supplied it.
    pub after: Option<Document>,
    /// Update description for `Update` events.
    pub diff: Option<UpdateDiff>,
    /// Commit position; strictly increasing per collection.
    pub sequence: u64,
}

impl DomainEvent {
    /// Returns a top-level field of the after projection, falling back to
    /// the before projection.
    pub fn field(&self, name: &str) -> Option<&Value> {
        self.after
            .as_ref()
            .and_then(|doc| doc.get(name))
            .or_else(|| self.before.as_ref().and_then(|doc| doc.get(name)))
    }
}
