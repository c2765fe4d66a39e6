//! Benchmark utilities.

use rand::Rng;
use serde_json::{json, Map, Value};
use streamhub_core::{RawChange, ResumeToken};

/// Generate a document with `fields` random string fields and the given id.
pub fn random_document(id: u64, fields: usize) -> Map<String, Value> {
    let mut rng = rand::thread_rng();
    let mut doc = Map::new();
    doc.insert("_id".into(), json!(format!("doc-{id}")));
    for i in 0..fields {
        let len = rng.gen_range(4..32);
        let text: String = (0..len).map(|_| rng.gen_range(b'a'..=b'z') as char).collect();
        doc.insert(format!("field_{i}"), Value::String(text));
    }
    doc
}

/// Raw insert change in the store's wire shape.
pub fn raw_insert(collection: &str, position: u64, fields: usize) -> RawChange {
    let doc = random_document(position, fields);
    RawChange {
        token: ResumeToken::new(1, position),
        document: json!({
            "operationType": "insert",
            "ns": { "coll": collection },
            "documentKey": { "_id": doc["_id"].clone() },
            "fullDocument": Value::Object(doc),
        }),
    }
}

/// Raw update change touching `changed` fields of a `fields`-wide document.
pub fn raw_update(collection: &str, position: u64, fields: usize, changed: usize) -> RawChange {
    let before = random_document(position, fields);
    let mut after = before.clone();
    let mut updated = Map::new();
    for i in 0..changed.min(fields) {
        let value = json!(format!("updated-{i}"));
        after.insert(format!("field_{i}"), value.clone());
        updated.insert(format!("field_{i}"), value);
    }
    RawChange {
        token: ResumeToken::new(1, position),
        document: json!({
            "operationType": "update",
            "ns": { "coll": collection },
            "documentKey": { "_id": before["_id"].clone() },
            "updateDescription": { "updatedFields": updated, "removedFields": [] },
            "fullDocument": Value::Object(after),
            "fullDocumentBeforeChange": Value::Object(before),
        }),
    }
}

/// A mixed batch of inserts and updates.
pub fn generate_changes(collection: &str, count: u64, fields: usize) -> Vec<RawChange> {
    (1..=count)
        .map(|position| {
            if position % 2 == 0 {
                raw_update(collection, position, fields, 2)
            } else {
                raw_insert(collection, position, fields)
            }
        })
        .collect()
}
