//! Bootstrap snapshots and value escaping.
//!
//! A document checkpoint is the full state of one document at a given
//! versionstamp. List element ids are stored compactly as
//! `counter:actorIndex` and expanded through the `actors` table:
//!
//! ```json
//! {
//!   "id": "doc_123", "index": 7, "api_version": 0, "vs": "AAAAOTKy5nUAAA==",
//!   "actors": { "0": "gst_alice", "1": "gst_bob" },
//!   "lists": { "todo": { "ids": ["0:0", "1:1"], "afters": ["root", "0:0"],
//!                        "values": ["\"milk\"", "\"eggs\""] } },
//!   "maps": { "settings": { "theme": "\"dark\"" } }
//! }
//! ```
//!
//! Scalars travel as JSON text inside strings. In list `values`, `{"t": ""}`
//! marks a tombstone and `{"ref": id}` a cross reference.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::crdt::{Anchor, CrdtError, ListValue, NodeId, ROOT};

/// Errors raised while reading a checkpoint.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum CheckpointError {
    #[error("List '{list}' has mismatched columns: {ids} ids, {afters} afters, {values} values")]
    ColumnMismatch {
        list: String,
        ids: usize,
        afters: usize,
        values: usize,
    },

    #[error(transparent)]
    Crdt(#[from] CrdtError),
}

/// Encode a scalar for the wire.
pub fn escape(value: &Value) -> String {
    value.to_string()
}

/// Decode a scalar from the wire.
///
/// Text that is not valid JSON is kept as a raw string.
pub fn unescape(text: &str) -> Value {
    serde_json::from_str(text).unwrap_or_else(|_| Value::String(text.to_string()))
}

/// Decode a stored checkpoint value: strings are escaped scalars, anything
/// else is taken verbatim.
pub fn decode_stored(value: &Value) -> Value {
    match value {
        Value::String(text) => unescape(text),
        other => other.clone(),
    }
}

/// Full document snapshot.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DocumentCheckpoint {
    pub id: String,
    /// Number of operations folded into this snapshot.
    #[serde(default)]
    pub index: u64,
    #[serde(default)]
    pub api_version: u32,
    #[serde(default)]
    pub vs: Option<String>,
    /// Compact actor index → actor id.
    #[serde(default)]
    pub actors: HashMap<String, String>,
    #[serde(default)]
    pub lists: HashMap<String, ListCheckpoint>,
    #[serde(default)]
    pub maps: HashMap<String, HashMap<String, Value>>,
}

impl DocumentCheckpoint {
    /// Checkpoint of a document nobody has written to yet.
    pub fn empty(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            ..Self::default()
        }
    }

    /// Decoded list elements of `list`, if the checkpoint has it.
    pub fn list_entries(
        &self,
        list: &str,
    ) -> Option<Result<Vec<(NodeId, Anchor, ListValue)>, CheckpointError>> {
        self.lists
            .get(list)
            .map(|columns| columns.entries(list, &self.actors))
    }

    /// Decoded entries of `map`, if the checkpoint has it.
    pub fn map_entries(&self, map: &str) -> Option<Vec<(String, Value)>> {
        self.maps.get(map).map(|entries| {
            entries
                .iter()
                .map(|(key, value)| (key.clone(), decode_stored(value)))
                .collect()
        })
    }
}

/// Column-oriented list snapshot.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ListCheckpoint {
    #[serde(default)]
    pub ids: Vec<String>,
    #[serde(default)]
    pub afters: Vec<String>,
    #[serde(default)]
    pub values: Vec<Value>,
}

impl ListCheckpoint {
    /// Expand the columns into CRDT entries.
    pub fn entries(
        &self,
        list: &str,
        actors: &HashMap<String, String>,
    ) -> Result<Vec<(NodeId, Anchor, ListValue)>, CheckpointError> {
        if self.ids.len() != self.afters.len() || self.ids.len() != self.values.len() {
            return Err(CheckpointError::ColumnMismatch {
                list: list.to_string(),
                ids: self.ids.len(),
                afters: self.afters.len(),
                values: self.values.len(),
            });
        }

        let mut entries = Vec::with_capacity(self.ids.len());
        for ((id, after), value) in self.ids.iter().zip(&self.afters).zip(&self.values) {
            let id = expand_id(id, actors)?;
            let after = if after == ROOT {
                Anchor::Root
            } else {
                Anchor::Node(expand_id(after, actors)?)
            };
            entries.push((id, after, decode_list_value(value)));
        }
        Ok(entries)
    }
}

/// Expand `counter:actorIndex` into a full id.
///
/// Ids whose actor part is not in the table are already full.
fn expand_id(compact: &str, actors: &HashMap<String, String>) -> Result<NodeId, CrdtError> {
    let mut id: NodeId = compact.parse()?;
    if let Some(actor) = actors.get(&id.actor) {
        id.actor = actor.clone();
    }
    Ok(id)
}

fn decode_list_value(value: &Value) -> ListValue {
    match value {
        Value::String(text) => ListValue::Scalar(unescape(text)),
        Value::Object(fields) if fields.contains_key("t") => ListValue::Tombstone,
        Value::Object(fields) => match fields.get("ref").and_then(Value::as_str) {
            Some(target) => ListValue::Ref(target.to_string()),
            None => ListValue::Scalar(value.clone()),
        },
        other => ListValue::Scalar(other.clone()),
    }
}

/// One actor's value for one presence key.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PresenceRecord {
    pub value: Value,
    /// Expiry as Unix seconds.
    #[serde(rename = "expAt")]
    pub exp_at: u64,
}

/// Presence snapshot: key → actor → record.
pub type PresenceCheckpoint = HashMap<String, HashMap<String, PresenceRecord>>;

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn sample() -> DocumentCheckpoint {
        serde_json::from_value(json!({
            "id": "doc_123",
            "index": 7,
            "api_version": 0,
            "vs": "AAAAOTKy5nUAAA==",
            "actors": { "0": "gst_alice", "1": "gst_bob" },
            "lists": {
                "todo": {
                    "ids": ["0:0", "1:1", "2:0"],
                    "afters": ["root", "0:0", "1:1"],
                    "values": ["\"milk\"", {"t": ""}, "3"]
                }
            },
            "maps": { "settings": { "theme": "\"dark\"", "size": "12" } }
        }))
        .unwrap()
    }

    #[test]
    fn test_escape_unescape() {
        assert_eq!(escape(&json!("dogs")), "\"dogs\"");
        assert_eq!(unescape("\"dogs\""), json!("dogs"));
        assert_eq!(unescape("42"), json!(42));
        assert_eq!(unescape("{\"a\":1}"), json!({"a": 1}));
    }

    #[test]
    fn test_unescape_raw_text() {
        assert_eq!(unescape("not json"), json!("not json"));
    }

    #[test]
    fn test_deserialize_document() {
        let cp = sample();
        assert_eq!(cp.id, "doc_123");
        assert_eq!(cp.index, 7);
        assert_eq!(cp.vs.as_deref(), Some("AAAAOTKy5nUAAA=="));
        assert_eq!(cp.actors.len(), 2);
    }

    #[test]
    fn test_list_entries_expand_actors() {
        let cp = sample();
        let entries = cp.list_entries("todo").unwrap().unwrap();

        assert_eq!(entries.len(), 3);
        assert_eq!(entries[0].0, NodeId::new(0, "gst_alice"));
        assert_eq!(entries[0].1, Anchor::Root);
        assert_eq!(entries[0].2, ListValue::Scalar(json!("milk")));

        assert_eq!(entries[1].0, NodeId::new(1, "gst_bob"));
        assert_eq!(entries[1].1, Anchor::Node(NodeId::new(0, "gst_alice")));
        assert_eq!(entries[1].2, ListValue::Tombstone);

        assert_eq!(entries[2].2, ListValue::Scalar(json!(3)));
    }

    #[test]
    fn test_missing_list() {
        assert!(sample().list_entries("nope").is_none());
    }

    #[test]
    fn test_column_mismatch() {
        let cp = ListCheckpoint {
            ids: vec!["0:0".into()],
            afters: vec![],
            values: vec![json!("\"x\"")],
        };
        assert!(matches!(
            cp.entries("broken", &HashMap::new()),
            Err(CheckpointError::ColumnMismatch { .. })
        ));
    }

    #[test]
    fn test_ref_value_decoded() {
        let cp = ListCheckpoint {
            ids: vec!["0:a".into()],
            afters: vec!["root".into()],
            values: vec![json!({"ref": "0:other"})],
        };
        let entries = cp.entries("refs", &HashMap::new()).unwrap();
        assert_eq!(entries[0].2, ListValue::Ref("0:other".into()));
    }

    #[test]
    fn test_full_ids_pass_through() {
        let cp = ListCheckpoint {
            ids: vec!["4:gst_carol".into()],
            afters: vec!["root".into()],
            values: vec![json!("\"x\"")],
        };
        let entries = cp.entries("l", &HashMap::new()).unwrap();
        assert_eq!(entries[0].0, NodeId::new(4, "gst_carol"));
    }

    #[test]
    fn test_map_entries_unescaped() {
        let cp = sample();
        let mut entries = cp.map_entries("settings").unwrap();
        entries.sort_by(|a, b| a.0.cmp(&b.0));
        assert_eq!(
            entries,
            vec![
                ("size".to_string(), json!(12)),
                ("theme".to_string(), json!("dark")),
            ]
        );
    }

    #[test]
    fn test_presence_record_wire_name() {
        let record: PresenceRecord =
            serde_json::from_value(json!({"value": "{\"x\":1}", "expAt": 1700000000})).unwrap();
        assert_eq!(record.exp_at, 1_700_000_000);
    }
}
