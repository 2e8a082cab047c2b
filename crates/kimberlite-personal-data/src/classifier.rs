//! Row Classifier / Audit Record Assembler.
//!
//! Walks read rows and write deltas (with nested children) against the
//! per-entity templates and folds every field contribution into the entry of
//! its logical row. Faults stay local: a row or entity type that cannot be
//! classified is reported and skipped, and its siblings and children are
//! still walked.

use std::borrow::Cow;
use std::collections::HashMap;

use tracing::{debug, warn};

use crate::annotator::{AccessKind, Annotator, CategorySet, EntityAnnotations, Template};
use crate::cache::ResolutionCache;
use crate::delta::{Delta, Operation, Row, is_inactive, normalize};
use crate::error::{PersonalDataError, Result, SchemaFault};
use crate::index::RelationshipIndex;
use crate::lookup::LookupSynthesizer;
use crate::record::{Attribute, AuditEntry, EntryKey, EntrySet, SubjectId, SubjectRef};
use crate::resolver::SubjectResolver;
use crate::schema::IS_ACTIVE_ENTITY;

/// Pre-write row images captured for updates, by logical row.
pub type Images = HashMap<EntryKey, Row>;

/// Mutable state of one classification pass.
pub struct Pass<'p> {
    pub entries: &'p mut EntrySet,
    pub cache: &'p mut ResolutionCache,
    pub faults: &'p mut Vec<PersonalDataError>,
}

impl Pass<'_> {
    fn fault(&mut self, entity: &str, error: PersonalDataError) {
        warn!(entity = %entity, %error, "skipping row");
        self.faults.push(error);
    }
}

#[derive(Clone, Copy)]
pub struct Classifier<'a> {
    pub index: &'a RelationshipIndex,
    pub annotator: &'a Annotator,
    pub resolver: &'a SubjectResolver,
    pub synthesizer: &'a LookupSynthesizer,
}

impl Classifier<'_> {
    /// Key of `row` as a row of `entity`.
    pub fn entry_key(&self, entity: &str, row: &Row) -> Result<EntryKey> {
        let def = self
            .index
            .entity(entity)
            .ok_or_else(|| SchemaFault::UnknownEntity(entity.to_string()))?;
        let keys = def
            .object_keys()
            .map(|key| {
                row.get(key)
                    .map(|value| (key, value))
                    .ok_or_else(|| PersonalDataError::MissingKeyValue {
                        entity: entity.to_string(),
                        field: key.to_string(),
                    })
            })
            .collect::<Result<Vec<_>>>()?;
        Ok(EntryKey::new(entity, keys))
    }

    /// Classifies rows that were read.
    pub fn classify_rows(&self, entity: &str, rows: &[Row], pass: &mut Pass<'_>) {
        for row in rows {
            self.read_row(entity, row, pass);
        }
    }

    fn read_row(&self, entity: &str, row: &Row, pass: &mut Pass<'_>) {
        if is_inactive(row) {
            return;
        }
        if self.annotator.is_personal_data(entity) {
            match self.read_fields(entity, row, pass) {
                Ok(()) => {}
                Err(error) => pass.fault(entity, error),
            }
        }

        // Expanded relationships arrive inline.
        for (field, value) in row {
            let Some(relationship) = self.index.resolve(entity, field) else {
                continue;
            };
            if !self.annotator.reaches_personal_data(&relationship.target) {
                continue;
            }
            match value {
                serde_json::Value::Object(child) => self.read_row(&relationship.target, child, pass),
                serde_json::Value::Array(children) => {
                    for child in children.iter().filter_map(serde_json::Value::as_object) {
                        self.read_row(&relationship.target, child, pass);
                    }
                }
                _ => {}
            }
        }
    }

    fn read_fields(&self, entity: &str, row: &Row, pass: &mut Pass<'_>) -> Result<()> {
        let template = self.annotator.template(entity, AccessKind::Read)?;
        let key = self.entry_key(entity, row)?;
        let entry = pass.entries.entry(key, entity);

        for field in &template.fields {
            let Some(value) = row.get(&field.name) else {
                continue;
            };
            identify(entry, &template, &field.name, field.categories, value);
            if field.categories.contains(CategorySet::SENSITIVE) {
                entry.set_attribute(Attribute::name_only(&field.name));
            }
        }
        for name in &template.annotations.attachments {
            if let Some(value) = row.get(name) {
                entry.add_attachment(name, normalize(Some(value)));
            }
        }
        share_known_subject(entry, pass.cache);

        self.attach_subject(&template.annotations, key, row, pass);
        Ok(())
    }

    /// Records the rows of an update before it is written.
    pub fn capture_images(&self, entity: &str, rows: &[Row], images: &mut Images, pass: &mut Pass<'_>) {
        for row in rows {
            match self.entry_key(entity, row) {
                Ok(key) => {
                    images.insert(key, row.clone());
                }
                Err(error) => pass.fault(entity, error),
            }
            for (field, value) in row {
                let Some(relationship) = self.index.resolve(entity, field) else {
                    continue;
                };
                if !relationship.composition {
                    continue;
                }
                let children: Vec<Row> = match value {
                    serde_json::Value::Object(child) => vec![child.clone()],
                    serde_json::Value::Array(items) => items
                        .iter()
                        .filter_map(serde_json::Value::as_object)
                        .cloned()
                        .collect(),
                    _ => continue,
                };
                self.capture_images(&relationship.target, &children, images, pass);
            }
        }
    }

    /// Classifies written rows. `images` fills old values the delta lacks.
    pub fn classify_deltas(&self, entity: &str, deltas: &[Delta], images: &Images, pass: &mut Pass<'_>) {
        for delta in deltas {
            self.write_row(entity, delta, images, pass);
        }
    }

    fn write_row(&self, entity: &str, delta: &Delta, images: &Images, pass: &mut Pass<'_>) {
        let Some(identity) = delta.identity() else {
            debug!(entity = %entity, "delta without row images");
            return;
        };
        if is_inactive(identity) {
            return;
        }
        if self.annotator.is_personal_data(entity) {
            match self.write_fields(entity, delta, identity, images, pass) {
                Ok(()) => {}
                Err(error) => pass.fault(entity, error),
            }
        }

        for (name, children) in &delta.children {
            match self.index.resolve(entity, name) {
                Some(relationship) if relationship.composition => {
                    self.classify_deltas(&relationship.target, children, images, pass);
                }
                _ => debug!(entity = %entity, relationship = %name, "not a composition, children skipped"),
            }
        }
    }

    fn write_fields(
        &self,
        entity: &str,
        delta: &Delta,
        identity: &Row,
        images: &Images,
        pass: &mut Pass<'_>,
    ) -> Result<()> {
        let template = self.annotator.template(entity, AccessKind::Write)?;
        let key = self.entry_key(entity, identity)?;
        let old = old_image(delta, images.get(&key));
        let entry = pass.entries.entry(key, entity);

        for field in &template.fields {
            if let Some(value) = identity.get(&field.name) {
                identify(entry, &template, &field.name, field.categories, value);
            }
            let personal = field.categories.contains(CategorySet::PERSONAL)
                || field.categories.contains(CategorySet::SENSITIVE);
            if !personal {
                continue;
            }
            if let Some(mut attribute) =
                diff(delta.op, &field.name, old.as_deref(), delta.new.as_ref())
            {
                if field.categories.contains(CategorySet::SENSITIVE) {
                    attribute = Attribute::name_only(attribute.name);
                }
                entry.set_attribute(attribute);
            }
        }
        share_known_subject(entry, pass.cache);

        self.attach_subject(&template.annotations, key, identity, pass);
        Ok(())
    }

    /// Points the entry at a (possibly shared) data-subject lookup.
    fn attach_subject(&self, annotations: &EntityAnnotations, key: EntryKey, row: &Row, pass: &mut Pass<'_>) {
        if !annotations.semantics.needs_subject_lookup() {
            return;
        }
        let entry = pass.entries.entry(key, &annotations.entity);
        if entry.attributes.is_empty() || entry.data_subject.is_some() {
            return;
        }
        let Some(resolution) = self.resolver.resolve(&annotations.entity) else {
            return;
        };

        if !pass.cache.contains(&resolution.role) {
            match self.synthesizer.synthesize(&resolution, row) {
                Ok(query) => {
                    pass.cache.register(&resolution.role, query);
                }
                Err(error) => {
                    pass.fault(&annotations.entity, error);
                    return;
                }
            }
        }

        let entry = pass.entries.entry(key, &annotations.entity);
        entry.data_subject = Some(SubjectRef {
            entity_type: resolution.subject.clone(),
            role: resolution.role.clone(),
            id: SubjectId::Pending {
                pending: resolution.role.clone(),
            },
        });
    }
}

/// Adds `value` to the object id and, for data subjects, to the entry's own
/// data-subject id.
fn identify(
    entry: &mut AuditEntry,
    template: &Template,
    name: &str,
    categories: CategorySet,
    value: &serde_json::Value,
) {
    if categories.contains(CategorySet::OBJECT_ID) && name != IS_ACTIVE_ENTITY {
        entry.object.id.insert(name.to_string(), value.clone());
    }
    if categories.contains(CategorySet::DATA_SUBJECT_ID) {
        let annotations = &template.annotations;
        let subject = entry.data_subject.get_or_insert_with(|| SubjectRef {
            entity_type: annotations.entity.clone(),
            role: annotations
                .role
                .clone()
                .unwrap_or_else(|| annotations.entity.clone()),
            id: SubjectId::Known(Row::new()),
        });
        if let SubjectId::Known(id) = &mut subject.id {
            id.insert(name.to_string(), value.clone());
        }
    }
}

/// Registers the identifier a data-subject row carries under its role, so
/// detail rows of the same role need no lookup.
fn share_known_subject(entry: &AuditEntry, cache: &mut ResolutionCache) {
    let Some(SubjectRef {
        role,
        id: SubjectId::Known(id),
        ..
    }) = &entry.data_subject
    else {
        return;
    };
    if cache.register_value(role, id.clone()) {
        debug!(role = %role, "data subject identifier known from row");
    }
}

/// Old image of a written row: the delta's own, completed by a captured
/// pre-write image for fields it does not carry.
fn old_image<'d>(delta: &'d Delta, captured: Option<&Row>) -> Option<Cow<'d, Row>> {
    match (delta.old.as_ref(), captured) {
        (old, None) => old.map(Cow::Borrowed),
        (None, Some(captured)) => Some(Cow::Owned(captured.clone())),
        (Some(old), Some(captured)) => {
            let mut merged = old.clone();
            for (name, value) in captured {
                if !merged.contains_key(name) {
                    merged.insert(name.clone(), value.clone());
                }
            }
            Some(Cow::Owned(merged))
        }
    }
}

/// `{old, new}` of one field, or `None` if nothing changed.
pub fn diff(op: Operation, field: &str, old: Option<&Row>, new: Option<&Row>) -> Option<Attribute> {
    match op {
        Operation::Create => {
            let value = new?.get(field)?;
            (!value.is_null()).then(|| Attribute {
                name: field.to_string(),
                old: None,
                new: Some(normalize(Some(value))),
            })
        }
        Operation::Delete => Some(Attribute {
            name: field.to_string(),
            old: Some(normalize(Some(old?.get(field)?))),
            new: None,
        }),
        Operation::Update => {
            let new = normalize(Some(new?.get(field)?));
            let old = normalize(old.and_then(|row| row.get(field)));
            (old != new).then(|| Attribute {
                name: field.to_string(),
                old: Some(old),
                new: Some(new),
            })
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use test_case::test_case;

    fn row(value: serde_json::Value) -> Row {
        value.as_object().cloned().unwrap_or_default()
    }

    fn attr(name: &str, old: Option<&str>, new: Option<&str>) -> Attribute {
        Attribute {
            name: name.into(),
            old: old.map(Into::into),
            new: new.map(Into::into),
        }
    }

    #[test_case(json!({"x": "a"}), json!({"x": "a"}), None ; "unchanged is omitted")]
    #[test_case(json!({"x": "a"}), json!({"x": "b"}), Some(attr("x", Some("a"), Some("b"))) ; "changed")]
    #[test_case(json!({}), json!({"x": "b"}), Some(attr("x", Some("null"), Some("b"))) ; "missing old is null")]
    #[test_case(json!({"x": "a"}), json!({"x": null}), Some(attr("x", Some("a"), Some("null"))) ; "cleared")]
    #[test_case(json!({"x": "a"}), json!({}), None ; "not written")]
    #[test_case(json!({"x": [1, 2]}), json!({"x": [1, 2]}), None ; "equal arrays")]
    fn update_diff(old: serde_json::Value, new: serde_json::Value, expected: Option<Attribute>) {
        assert_eq!(
            diff(Operation::Update, "x", Some(&row(old)), Some(&row(new))),
            expected
        );
    }

    #[test]
    fn create_sets_only_new_and_delete_only_old() {
        let image = row(json!({"x": "a"}));
        assert_eq!(
            diff(Operation::Create, "x", None, Some(&image)),
            Some(attr("x", None, Some("a")))
        );
        assert_eq!(diff(Operation::Create, "y", None, Some(&image)), None);
        assert_eq!(
            diff(Operation::Create, "x", None, Some(&row(json!({"x": null})))),
            None,
            "created null is unchanged"
        );
        assert_eq!(
            diff(Operation::Delete, "x", Some(&image), None),
            Some(attr("x", Some("a"), None))
        );
    }

    #[test]
    fn captured_image_fills_missing_old_values() {
        let delta = Delta::update(row(json!({"ID": 1, "x": "delta"})), row(json!({"ID": 1})));
        let captured = row(json!({"ID": 1, "x": "captured", "y": "captured"}));
        let merged = old_image(&delta, Some(&captured)).expect("has image");
        assert_eq!(merged.get("x"), Some(&json!("delta")));
        assert_eq!(merged.get("y"), Some(&json!("captured")));
    }
}
