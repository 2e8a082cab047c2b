//! Audit entries and the records handed to the transport.

use std::collections::HashMap;
use std::fmt::{self, Display};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::delta::Row;

/// Identity of a logical row: hash of the entity type and its key values.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct EntryKey([u8; 32]);

impl EntryKey {
    /// `keys` must be in the entity's key declaration order.
    pub fn new<'a>(entity: &str, keys: impl IntoIterator<Item = (&'a str, &'a serde_json::Value)>) -> Self {
        let mut hasher = blake3::Hasher::new();
        hasher.update(entity.as_bytes());
        for (name, value) in keys {
            hasher.update(&[0]);
            hasher.update(name.as_bytes());
            hasher.update(&[0]);
            hasher.update(value.to_string().as_bytes());
        }
        Self(*hasher.finalize().as_bytes())
    }
}

impl Display for EntryKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for byte in &self.0[..8] {
            write!(f, "{byte:02x}")?;
        }
        Ok(())
    }
}

/// Audit event names produced by this engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum AuditEvent {
    SensitiveDataRead,
    PersonalDataModified,
}

impl Display for AuditEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AuditEvent::SensitiveDataRead => write!(f, "SensitiveDataRead"),
            AuditEvent::PersonalDataModified => write!(f, "PersonalDataModified"),
        }
    }
}

/// A personal attribute. Sensitive attributes never carry values.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Attribute {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub old: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub new: Option<String>,
}

impl Attribute {
    pub fn name_only(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            old: None,
            new: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Attachment {
    pub name: String,
    pub value: String,
}

/// The data-subject identifier of an entry: either read from the row or a
/// reference to the lookup registered for `role`.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum SubjectId {
    Known(Row),
    Pending { pending: String },
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SubjectRef {
    #[serde(rename = "type")]
    pub entity_type: String,
    pub role: String,
    pub id: SubjectId,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ObjectRef {
    #[serde(rename = "type")]
    pub entity_type: String,
    pub id: Row,
}

/// An audit entry under assembly.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AuditEntry {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data_subject: Option<SubjectRef>,
    pub object: ObjectRef,
    pub attributes: Vec<Attribute>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub attachments: Vec<Attachment>,
}

impl AuditEntry {
    fn new(entity: &str) -> Self {
        Self {
            data_subject: None,
            object: ObjectRef {
                entity_type: entity.to_string(),
                id: Row::new(),
            },
            attributes: Vec::new(),
            attachments: Vec::new(),
        }
    }

    /// Adds or replaces the attribute with the same name.
    pub fn set_attribute(&mut self, attribute: Attribute) {
        match self.attributes.iter_mut().find(|a| a.name == attribute.name) {
            Some(existing) => *existing = attribute,
            None => self.attributes.push(attribute),
        }
    }

    pub fn add_attachment(&mut self, name: &str, value: String) {
        if !self.attachments.iter().any(|a| a.name == name) {
            self.attachments.push(Attachment {
                name: name.to_string(),
                value,
            });
        }
    }

    /// The role of a still-pending lookup, if any.
    pub fn pending_role(&self) -> Option<&str> {
        match &self.data_subject {
            Some(SubjectRef {
                id: SubjectId::Pending { pending },
                ..
            }) => Some(pending),
            _ => None,
        }
    }
}

/// Entries of one request, one per logical row, in first-touch order.
#[derive(Debug, Clone, Default)]
pub struct EntrySet {
    entries: Vec<AuditEntry>,
    positions: HashMap<EntryKey, usize>,
}

impl EntrySet {
    pub fn new() -> Self {
        Self::default()
    }

    /// The entry for `key`, created on first touch.
    pub fn entry(&mut self, key: EntryKey, entity: &str) -> &mut AuditEntry {
        let i = *self.positions.entry(key).or_insert_with(|| {
            self.entries.push(AuditEntry::new(entity));
            self.entries.len() - 1
        });
        &mut self.entries[i]
    }

    pub fn get(&self, key: &EntryKey) -> Option<&AuditEntry> {
        self.positions.get(key).map(|&i| &self.entries[i])
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &AuditEntry> {
        self.entries.iter()
    }

    pub fn into_entries(self) -> Vec<AuditEntry> {
        self.entries
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RecordSubject {
    #[serde(rename = "type")]
    pub entity_type: String,
    pub role: String,
    pub id: Row,
}

/// A finalized audit record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuditRecord {
    pub uuid: Uuid,
    pub time: DateTime<Utc>,
    pub request: Uuid,
    pub event: AuditEvent,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data_subject: Option<RecordSubject>,
    pub object: ObjectRef,
    pub attributes: Vec<Attribute>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub attachments: Vec<Attachment>,
}

impl AuditRecord {
    pub fn new(
        request: Uuid,
        event: AuditEvent,
        entry: AuditEntry,
        data_subject: Option<RecordSubject>,
    ) -> Self {
        Self {
            uuid: Uuid::new_v4(),
            time: Utc::now(),
            request,
            event,
            data_subject,
            object: entry.object,
            attributes: entry.attributes,
            attachments: entry.attachments,
        }
    }

    pub fn to_json(&self) -> crate::error::Result<String> {
        Ok(serde_json::to_string(self)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn entry_key_depends_on_entity_and_values() {
        let a = json!("A1");
        let b = json!("A2");
        assert_eq!(EntryKey::new("Address", [("ID", &a)]), EntryKey::new("Address", [("ID", &a)]));
        assert_ne!(EntryKey::new("Address", [("ID", &a)]), EntryKey::new("Address", [("ID", &b)]));
        assert_ne!(EntryKey::new("Address", [("ID", &a)]), EntryKey::new("Order", [("ID", &a)]));
        // "1" and 1 are different key values.
        assert_ne!(
            EntryKey::new("T", [("ID", &json!("1"))]),
            EntryKey::new("T", [("ID", &json!(1))])
        );
    }

    #[test]
    fn entries_merge_by_key() {
        let mut set = EntrySet::new();
        let key = EntryKey::new("Customer", [("ID", &json!("C1"))]);
        set.entry(key, "Customer").set_attribute(Attribute::name_only("email"));
        set.entry(key, "Customer").set_attribute(Attribute {
            name: "email".into(),
            old: Some("a".into()),
            new: Some("b".into()),
        });
        set.entry(key, "Customer").set_attribute(Attribute::name_only("phone"));
        assert_eq!(set.len(), 1);
        let entry = set.get(&key).expect("entry exists");
        assert_eq!(entry.attributes.len(), 2);
        assert_eq!(entry.attributes[0].new.as_deref(), Some("b"));
    }

    #[test]
    fn record_shape() {
        let mut entry = AuditEntry::new("Customer");
        entry.object.id.insert("ID".into(), json!("C1"));
        entry.set_attribute(Attribute {
            name: "email".into(),
            old: None,
            new: Some("x@example.com".into()),
        });
        entry.set_attribute(Attribute::name_only("creditCard"));

        let subject = RecordSubject {
            entity_type: "Customer".into(),
            role: "Customer".into(),
            id: entry.object.id.clone(),
        };
        let record = AuditRecord::new(Uuid::nil(), AuditEvent::PersonalDataModified, entry, Some(subject));
        let value = serde_json::to_value(&record).expect("serializes");

        assert_eq!(value["event"], json!("PersonalDataModified"));
        assert_eq!(value["data_subject"]["type"], json!("Customer"));
        assert_eq!(value["data_subject"]["id"], json!({ "ID": "C1" }));
        assert_eq!(value["object"], json!({ "type": "Customer", "id": { "ID": "C1" } }));
        assert_eq!(
            value["attributes"],
            json!([{ "name": "email", "new": "x@example.com" }, { "name": "creditCard" }])
        );
        assert!(value.get("attachments").is_none());

        let back: AuditRecord = serde_json::from_value(value).expect("deserializes");
        assert_eq!(back, record);
    }

    #[test]
    fn pending_subject_serializes_role() {
        let mut entry = AuditEntry::new("Address");
        entry.data_subject = Some(SubjectRef {
            entity_type: "Customer".into(),
            role: "Customer".into(),
            id: SubjectId::Pending {
                pending: "Customer".into(),
            },
        });
        assert_eq!(entry.pending_role(), Some("Customer"));
        let value = serde_json::to_value(&entry).expect("serializes");
        assert_eq!(value["data_subject"]["id"], json!({ "pending": "Customer" }));
    }
}
