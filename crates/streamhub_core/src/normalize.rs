//! Conversion of raw change documents into [`DomainEvent`]s.
//!
//! The raw shape follows the store's change-stream wire format:
//!
//! ```json
//! {
//!   "operationType": "update",
//!   "ns": { "coll": "rooms" },
//!   "documentKey": { "_id": "GENERAL" },
//!   "updateDescription": { "updatedFields": { "topic": "hi" }, "removedFields": [] },
//!   "fullDocument": { ... },
//!   "fullDocumentBeforeChange": { ... }
//! }
//! ```
//!
//! Projections are built only from what the store supplied. Deletes never
//! carry an after projection and inserts never carry a before projection.

use crate::error::{HubError, HubResult};
use crate::event::{Document, DomainEvent, OperationKind, UpdateDiff};
use crate::source::RawChange;
use serde_json::Value;

/// Normalizes a raw change observed on `collection`.
///
/// Returns `HubError::MalformedEvent` when the operation type or document
/// id is missing or unrecognized, or when the change belongs to a
/// different collection.
pub fn normalize(collection: &str, raw: &RawChange) -> HubResult<DomainEvent> {
    let doc = raw
        .document
        .as_object()
        .ok_or_else(|| HubError::malformed(collection, "change is not an object"))?;

    let marker = doc
        .get("operationType")
        .and_then(Value::as_str)
        .ok_or_else(|| HubError::malformed(collection, "missing operationType"))?;
    let kind = OperationKind::from_marker(marker).ok_or_else(|| {
        HubError::malformed(collection, format!("unsupported operationType {marker}"))
    })?;

    if let Some(ns) = doc.get("ns").and_then(|ns| ns.get("coll")) {
        if ns.as_str() != Some(collection) {
            return Err(HubError::malformed(
                collection,
                format!("namespace mismatch: {ns}"),
            ));
        }
    }

    let document_id = doc
        .get("documentKey")
        .and_then(|key| key.get("_id"))
        .and_then(document_id)
        .ok_or_else(|| HubError::malformed(collection, "missing documentKey._id"))?;

    let full = projection(doc.get("fullDocument"));
    let pre_image = projection(doc.get("fullDocumentBeforeChange"));

    let (before, after, diff) = match kind {
        OperationKind::Insert => (None, full, None),
        OperationKind::Update => (pre_image, full, update_diff(doc.get("updateDescription"))),
        OperationKind::Replace => (pre_image, full, None),
        OperationKind::Delete => (pre_image, None, None),
    };

    Ok(DomainEvent {
        kind,
        collection: collection.to_string(),
        document_id,
        before,
        after,
        diff,
        sequence: raw.token.position(),
    })
}

/// Renders a document id as a string.
///
/// Accepts strings, numbers and extended-JSON object ids (`{"$oid": ...}`).
pub fn document_id(value: &Value) -> Option<String> {
    match value {
        Value::String(s) if !s.is_empty() => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        Value::Object(map) => map.get("$oid").and_then(Value::as_str).map(str::to_string),
        _ => None,
    }
}

fn projection(value: Option<&Value>) -> Option<Document> {
    value.and_then(Value::as_object).cloned()
}

fn update_diff(value: Option<&Value>) -> Option<UpdateDiff> {
    let description = value?.as_object()?;
    let updated_fields = projection(description.get("updatedFields")).unwrap_or_default();
    let removed_fields = description
        .get("removedFields")
        .and_then(Value::as_array)
        .map(|fields| {
            fields
                .iter()
                .filter_map(Value::as_str)
                .map(str::to_string)
                .collect()
        })
        .unwrap_or_default();
    Some(UpdateDiff {
        updated_fields,
        removed_fields,
    })
}
