use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::dao::change_feed::{DocPath, Document, Fields};

use super::error::CouchDaoError;

pub const ID_SEPARATOR: &str = "::";
pub const END_SUFFIX: &str = "\u{ffff}";

/// CouchDB document id for a logical path (`sessions::<id>`).
pub fn doc_id(path: &DocPath) -> String {
    format!("{}{ID_SEPARATOR}{}", path.collection, path.id)
}

/// Key prefix shared by every document of a collection.
pub fn collection_prefix(collection: &str) -> String {
    format!("{collection}{ID_SEPARATOR}")
}

#[derive(Debug, Deserialize)]
pub struct AllDocsResponse {
    pub rows: Vec<AllDocsRow>,
}

#[derive(Debug, Deserialize)]
pub struct AllDocsRow {
    pub id: String,
    #[serde(default)]
    pub doc: Option<CouchDocument>,
}

#[derive(Debug, Deserialize)]
pub struct DatabaseInfo {
    pub update_seq: Value,
}

#[derive(Debug, Deserialize)]
pub struct ChangesResponse {
    pub results: Vec<ChangeRow>,
    pub last_seq: Value,
}

#[derive(Debug, Deserialize)]
pub struct ChangeRow {
    pub id: String,
    #[serde(default)]
    pub deleted: bool,
}

/// Raw CouchDB document: MVCC metadata plus the flattened body.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CouchDocument {
    #[serde(rename = "_id")]
    pub id: String,
    #[serde(rename = "_rev", default, skip_serializing_if = "Option::is_none")]
    pub rev: Option<String>,
    #[serde(flatten)]
    pub body: Fields,
}

impl CouchDocument {
    pub fn new(path: &DocPath, rev: Option<String>, body: Fields) -> Self {
        Self {
            id: doc_id(path),
            rev,
            body,
        }
    }

    /// Convert into the store-agnostic document, dropping CouchDB bookkeeping keys.
    pub fn into_document(self) -> Result<Document, CouchDaoError> {
        let Some((_, id)) = self.id.split_once(ID_SEPARATOR) else {
            return Err(CouchDaoError::InvalidDocId { doc_id: self.id });
        };
        let revision = self.rev.as_deref().map(revision_number).unwrap_or(0);
        let fields = self
            .body
            .into_iter()
            .filter(|(key, _)| !key.starts_with('_'))
            .collect();
        Ok(Document {
            id: id.to_owned(),
            revision,
            fields,
        })
    }
}

/// Generation counter of a `_rev` token (`"3-a1b2..."` → 3).
pub fn revision_number(rev: &str) -> u64 {
    rev.split_once('-')
        .and_then(|(generation, _)| generation.parse().ok())
        .unwrap_or(0)
}

/// Render an opaque `update_seq` for use as the `since` query parameter.
pub fn seq_param(seq: &Value) -> String {
    match seq {
        Value::String(raw) => raw.clone(),
        other => other.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    #[test]
    fn revision_number_reads_generation_prefix() {
        assert_eq!(revision_number("3-a1b2c3"), 3);
        assert_eq!(revision_number("garbage"), 0);
    }

    #[test]
    fn into_document_strips_couch_metadata() {
        let raw: CouchDocument = serde_json::from_value(json!({
            "_id": "sessions::abc",
            "_rev": "2-ff",
            "_conflicts": [],
            "status": "playing"
        }))
        .unwrap();
        let doc = raw.into_document().unwrap();
        assert_eq!(doc.id, "abc");
        assert_eq!(doc.revision, 2);
        assert_eq!(doc.fields.len(), 1);
        assert_eq!(doc.field("status"), Some(&json!("playing")));
    }

    #[test]
    fn seq_param_keeps_string_sequences_verbatim() {
        assert_eq!(seq_param(&json!("12-g1AAAA")), "12-g1AAAA");
        assert_eq!(seq_param(&json!(42)), "42");
    }
}
