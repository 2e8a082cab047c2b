//! Row images and write deltas as supplied by the host framework.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

/// A row image: field name to JSON value. Expanded relationships appear as
/// nested objects (to-one) or arrays of objects (to-many).
pub type Row = serde_json::Map<String, serde_json::Value>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Operation {
    Create,
    Update,
    Delete,
}

/// Before/after images of one written row plus its composition children.
///
/// Produced by the host's diff utility; children are keyed by the name of
/// the composition relationship they were written through.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Delta {
    pub op: Operation,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub old: Option<Row>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub new: Option<Row>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub children: BTreeMap<String, Vec<Delta>>,
}

impl Delta {
    pub fn create(new: Row) -> Self {
        Self {
            op: Operation::Create,
            old: None,
            new: Some(new),
            children: BTreeMap::new(),
        }
    }

    pub fn update(old: Row, new: Row) -> Self {
        Self {
            op: Operation::Update,
            old: Some(old),
            new: Some(new),
            children: BTreeMap::new(),
        }
    }

    pub fn delete(old: Row) -> Self {
        Self {
            op: Operation::Delete,
            old: Some(old),
            new: None,
            children: BTreeMap::new(),
        }
    }

    #[must_use]
    pub fn with_child(mut self, relationship: impl Into<String>, child: Delta) -> Self {
        self.children.entry(relationship.into()).or_default().push(child);
        self
    }

    /// The image that identifies the row: `new` for creates and updates,
    /// `old` for deletes, whichever exists otherwise.
    pub fn identity(&self) -> Option<&Row> {
        match self.op {
            Operation::Delete => self.old.as_ref().or(self.new.as_ref()),
            Operation::Create | Operation::Update => self.new.as_ref().or(self.old.as_ref()),
        }
    }
}

/// Canonical string form of an attribute value.
///
/// Missing and `null` become `"null"`, strings are taken verbatim, and
/// arrays and objects use compact JSON.
pub fn normalize(value: Option<&serde_json::Value>) -> String {
    match value {
        None | Some(serde_json::Value::Null) => "null".to_string(),
        Some(serde_json::Value::String(s)) => s.clone(),
        Some(other) => other.to_string(),
    }
}

/// True if the row is a draft (`IsActiveEntity` explicitly `false`).
pub fn is_inactive(row: &Row) -> bool {
    row.get(crate::schema::IS_ACTIVE_ENTITY)
        .and_then(serde_json::Value::as_bool)
        == Some(false)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use test_case::test_case;

    #[test_case(None, "null" ; "missing")]
    #[test_case(Some(json!(null)), "null" ; "null")]
    #[test_case(Some(json!("a")), "a" ; "string verbatim")]
    #[test_case(Some(json!(42)), "42" ; "number")]
    #[test_case(Some(json!(false)), "false" ; "boolean")]
    #[test_case(Some(json!(["x", 1])), r#"["x",1]"# ; "array compact")]
    #[test_case(Some(json!({"a": 1})), r#"{"a":1}"# ; "object compact")]
    fn normalizes(value: Option<serde_json::Value>, expected: &str) {
        assert_eq!(normalize(value.as_ref()), expected);
    }

    #[test]
    fn deep_delta_from_json() {
        let delta: Delta = serde_json::from_value(json!({
            "op": "delete",
            "old": { "ID": "C1" },
            "children": { "addresses": [ { "op": "delete", "old": { "ID": "A1" } } ] }
        }))
        .expect("parses");
        assert_eq!(delta.identity().and_then(|r| r.get("ID")), Some(&json!("C1")));
        assert_eq!(delta.children["addresses"][0].op, Operation::Delete);
    }

    #[test]
    fn draft_detection() {
        let mut row = Row::new();
        assert!(!is_inactive(&row));
        row.insert("IsActiveEntity".into(), json!(true));
        assert!(!is_inactive(&row));
        row.insert("IsActiveEntity".into(), json!(false));
        assert!(is_inactive(&row));
    }
}
