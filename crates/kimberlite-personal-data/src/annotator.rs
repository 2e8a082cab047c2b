//! Schema Annotator.
//!
//! Classifies every entity type at most once and keeps the result in a
//! write-once side table. Two threads racing on the same slot compute the
//! same value from the same immutable schema; `OnceLock` keeps exactly one of
//! them, so callers always observe the same `Arc`.

use std::collections::{HashSet, VecDeque};
use std::fmt::{self, Display};
use std::sync::{Arc, OnceLock};

use bitflags::bitflags;
use tracing::warn;

use crate::error::{Result, SchemaFault};
use crate::index::RelationshipIndex;
use crate::schema::{EntityDef, EntitySemantics, FieldSemantics};

/// Audit-relevant category of a field.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Category {
    ObjectId,
    DataSubjectId,
    Personal,
    Sensitive,
}

impl Category {
    const ALL: [Category; 4] = [
        Category::ObjectId,
        Category::DataSubjectId,
        Category::Personal,
        Category::Sensitive,
    ];

    fn flag(self) -> CategorySet {
        match self {
            Category::ObjectId => CategorySet::OBJECT_ID,
            Category::DataSubjectId => CategorySet::DATA_SUBJECT_ID,
            Category::Personal => CategorySet::PERSONAL,
            Category::Sensitive => CategorySet::SENSITIVE,
        }
    }
}

impl Display for Category {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Category::ObjectId => "ObjectID",
            Category::DataSubjectId => "DataSubjectID",
            Category::Personal => "IsPotentiallyPersonal",
            Category::Sensitive => "IsPotentiallySensitive",
        };
        write!(f, "{s}")
    }
}

bitflags! {
    /// A small set of [`Category`] values.
    #[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
    pub struct CategorySet: u8 {
        const OBJECT_ID = 1 << 0;
        const DATA_SUBJECT_ID = 1 << 1;
        const PERSONAL = 1 << 2;
        const SENSITIVE = 1 << 3;
    }
}

impl CategorySet {
    /// The categories in the set, in declaration order.
    pub fn categories(self) -> impl Iterator<Item = Category> {
        Category::ALL.into_iter().filter(move |c| self.contains(c.flag()))
    }
}

impl From<Category> for CategorySet {
    fn from(category: Category) -> Self {
        category.flag()
    }
}

/// Whether rows are being read or written.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AccessKind {
    Read,
    Write,
}

impl AccessKind {
    fn slot(self) -> usize {
        match self {
            AccessKind::Read => 0,
            AccessKind::Write => 1,
        }
    }
}

/// Memoized classification of one entity type.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EntityAnnotations {
    pub entity: String,
    pub semantics: EntitySemantics,
    /// Derived or declared role, for `DataSubject` entities.
    pub role: Option<String>,
    /// True if any field is personal, sensitive, or a data-subject id.
    pub personal: bool,
    /// Write-time categories per field, in declaration order.
    pub fields: Vec<(String, CategorySet)>,
    pub attachments: Vec<String>,
    fault: Option<SchemaFault>,
}

impl EntityAnnotations {
    fn compute(entity: &EntityDef) -> Self {
        let is_subject = entity.semantics == EntitySemantics::DataSubject;
        let mut personal = false;
        let fields = entity
            .fields
            .iter()
            .map(|field| {
                let subject_id = field.semantics == FieldSemantics::DataSubjectId;
                let mut set = CategorySet::empty();
                set.set(CategorySet::OBJECT_ID, field.key);
                set.set(CategorySet::DATA_SUBJECT_ID, subject_id && is_subject);
                set.set(CategorySet::PERSONAL, field.personal);
                set.set(CategorySet::SENSITIVE, field.sensitive);
                personal |= field.personal || field.sensitive || subject_id;
                (field.name.clone(), set)
            })
            .collect();

        let fault = (is_subject && entity.object_keys().next().is_none())
            .then(|| SchemaFault::MissingPrimaryKey(entity.name.clone()));

        Self {
            entity: entity.name.clone(),
            semantics: entity.semantics,
            role: entity.subject_role().map(Into::into),
            personal,
            fields,
            attachments: entity.attachments.clone(),
            fault,
        }
    }

    pub fn fault(&self) -> Option<&SchemaFault> {
        self.fault.as_ref()
    }

    /// Categories of `field` for the given access. Ordinary personal fields
    /// are only reported for writes.
    pub fn categories(&self, field: &str, access: AccessKind) -> CategorySet {
        self.fields
            .iter()
            .find(|(name, _)| name == field)
            .map_or(CategorySet::empty(), |(_, set)| restrict(*set, access))
    }
}

fn restrict(set: CategorySet, access: AccessKind) -> CategorySet {
    match access {
        AccessKind::Read => set - CategorySet::PERSONAL,
        AccessKind::Write => set,
    }
}

/// A field the classifier has to look at, with its categories.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TemplateField {
    pub name: String,
    pub categories: CategorySet,
}

/// Per-entity, per-access classification template.
///
/// Only fields with at least one category are listed, so walking a row
/// touches nothing else.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Template {
    pub annotations: Arc<EntityAnnotations>,
    pub access: AccessKind,
    pub fields: Vec<TemplateField>,
}

#[derive(Debug)]
struct Slots {
    annotations: OnceLock<Arc<EntityAnnotations>>,
    templates: [OnceLock<Arc<Template>>; 2],
    reaches_personal: OnceLock<bool>,
}

#[derive(Debug)]
pub struct Annotator {
    index: Arc<RelationshipIndex>,
    slots: Vec<Slots>,
}

impl Annotator {
    pub fn new(index: Arc<RelationshipIndex>) -> Self {
        let slots = (0..index.len())
            .map(|_| Slots {
                annotations: OnceLock::new(),
                templates: [OnceLock::new(), OnceLock::new()],
                reaches_personal: OnceLock::new(),
            })
            .collect();
        Self { index, slots }
    }

    fn slot(&self, entity: &str) -> std::result::Result<(usize, &Slots), SchemaFault> {
        self.index
            .position(entity)
            .map(|i| (i, &self.slots[i]))
            .ok_or_else(|| SchemaFault::UnknownEntity(entity.to_string()))
    }

    fn memoized(&self, entity: &str) -> std::result::Result<Arc<EntityAnnotations>, SchemaFault> {
        let (i, slots) = self.slot(entity)?;
        Ok(Arc::clone(slots.annotations.get_or_init(|| {
            let annotations = EntityAnnotations::compute(&self.index.schema().entities[i]);
            if let Some(fault) = &annotations.fault {
                warn!(entity = %entity, %fault, "schema fault");
            }
            Arc::new(annotations)
        })))
    }

    /// True if the entity type carries any personal data. Faulted entity
    /// types are answered from their fields; unknown ones never are.
    pub fn is_personal_data(&self, entity: &str) -> bool {
        self.memoized(entity).is_ok_and(|a| a.personal)
    }

    /// True if the entity type, or any entity type reachable from it over
    /// declared relationships, carries personal data.
    pub fn reaches_personal_data(&self, entity: &str) -> bool {
        match self.slot(entity) {
            Ok((_, slots)) => *slots
                .reaches_personal
                .get_or_init(|| self.search_personal_data(entity)),
            Err(_) => false,
        }
    }

    /// Breadth-first walk over outgoing relationships. Entity types whose
    /// answer is already memoized are not walked again.
    fn search_personal_data(&self, entity: &str) -> bool {
        let mut seen = HashSet::from([entity.to_string()]);
        let mut queue = VecDeque::from([entity.to_string()]);
        while let Some(current) = queue.pop_front() {
            if self.is_personal_data(&current) {
                return true;
            }
            for relationship in self.index.outgoing(&current) {
                let Some(target) = self.index.relationship(&relationship).map(|r| &r.target) else {
                    continue;
                };
                if !seen.insert(target.clone()) {
                    continue;
                }
                match self
                    .slot(target)
                    .ok()
                    .and_then(|(_, slots)| slots.reaches_personal.get().copied())
                {
                    Some(true) => return true,
                    Some(false) => {}
                    None => queue.push_back(target.clone()),
                }
            }
        }
        false
    }

    /// The entity's annotations, or the schema fault that prevents
    /// classifying it.
    pub fn annotations(&self, entity: &str) -> Result<Arc<EntityAnnotations>> {
        let annotations = self.memoized(entity)?;
        match annotations.fault() {
            Some(fault) => Err(fault.clone().into()),
            None => Ok(annotations),
        }
    }

    pub fn field_categories(&self, entity: &str, field: &str, access: AccessKind) -> CategorySet {
        self.memoized(entity)
            .map_or(CategorySet::empty(), |a| a.categories(field, access))
    }

    pub fn template(&self, entity: &str, access: AccessKind) -> Result<Arc<Template>> {
        let annotations = self.annotations(entity)?;
        let (_, slots) = self.slot(entity)?;
        Ok(Arc::clone(slots.templates[access.slot()].get_or_init(|| {
            let fields = annotations
                .fields
                .iter()
                .map(|(name, set)| TemplateField {
                    name: name.clone(),
                    categories: restrict(*set, access),
                })
                .filter(|f| !f.categories.is_empty())
                .collect();
            Arc::new(Template {
                annotations: Arc::clone(&annotations),
                access,
                fields,
            })
        })))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::{EntityDef, FieldDef, Relationship, Schema};

    fn annotator() -> Annotator {
        Annotator::new(Arc::new(RelationshipIndex::new(Schema::new([
            EntityDef::new("Customer")
                .with_semantics(EntitySemantics::DataSubject)
                .with_field(FieldDef::key("ID").data_subject_id())
                .with_field(FieldDef::new("email").personal())
                .with_field(FieldDef::new("creditCard").personal().sensitive()),
            EntityDef::new("Address")
                .with_semantics(EntitySemantics::DataSubjectDetails)
                .with_field(FieldDef::key("ID"))
                .with_field(FieldDef::new("customerRef").data_subject_id())
                .with_field(FieldDef::new("street").personal()),
            EntityDef::new("Product").with_field(FieldDef::key("ID")),
            EntityDef::new("Broken")
                .with_semantics(EntitySemantics::DataSubject)
                .with_field(FieldDef::new("name").personal()),
        ]))))
    }

    #[test]
    fn personal_data_detection() {
        let annotator = annotator();
        assert!(annotator.is_personal_data("Customer"));
        assert!(annotator.is_personal_data("Address"));
        assert!(!annotator.is_personal_data("Product"));
        assert!(!annotator.is_personal_data("Unknown"));
        assert!(annotator.is_personal_data("Broken"));
    }

    #[test]
    fn personal_data_reached_through_relationships() {
        let annotator = Annotator::new(Arc::new(RelationshipIndex::new(Schema::new([
            EntityDef::new("Shipment")
                .with_field(FieldDef::key("ID"))
                .with_relationship(Relationship::to_one("order", "Order")),
            EntityDef::new("Order")
                .with_field(FieldDef::key("ID"))
                .with_relationship(Relationship::to_one("customer", "Customer"))
                .with_relationship(Relationship::to_one("shipment", "Shipment")),
            EntityDef::new("Customer")
                .with_semantics(EntitySemantics::DataSubject)
                .with_field(FieldDef::key("ID"))
                .with_field(FieldDef::new("creditCard").sensitive()),
            EntityDef::new("Warehouse")
                .with_field(FieldDef::key("ID"))
                .with_relationship(Relationship::to_one("self", "Warehouse"))
                .with_relationship(Relationship::to_one("ghost", "Missing")),
        ]))));

        assert!(!annotator.is_personal_data("Shipment"));
        assert!(annotator.reaches_personal_data("Shipment"));
        assert!(annotator.reaches_personal_data("Order"));
        assert!(annotator.reaches_personal_data("Customer"));
        assert!(!annotator.reaches_personal_data("Warehouse"));
        assert!(!annotator.reaches_personal_data("Missing"));
    }

    #[test]
    fn data_subject_id_requires_subject_semantics() {
        let annotator = annotator();
        let customer = annotator.field_categories("Customer", "ID", AccessKind::Write);
        assert!(customer.contains(CategorySet::DATA_SUBJECT_ID));
        assert!(customer.contains(CategorySet::OBJECT_ID));

        let address = annotator.field_categories("Address", "customerRef", AccessKind::Write);
        assert!(address.is_empty());
    }

    #[test]
    fn reads_never_report_plain_personal_fields() {
        let annotator = annotator();
        assert!(
            annotator
                .field_categories("Customer", "email", AccessKind::Read)
                .is_empty()
        );
        let card = annotator.field_categories("Customer", "creditCard", AccessKind::Read);
        assert_eq!(card.categories().collect::<Vec<_>>(), vec![Category::Sensitive]);
        assert_eq!(card, CategorySet::from(Category::Sensitive));
        assert!(
            annotator
                .field_categories("Customer", "email", AccessKind::Write)
                .contains(CategorySet::PERSONAL)
        );
    }

    #[test]
    fn memoization_returns_same_instance() {
        let annotator = annotator();
        let first = annotator.annotations("Customer").expect("classifies");
        let second = annotator.annotations("Customer").expect("classifies");
        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(first.role.as_deref(), Some("Customer"));

        let t1 = annotator.template("Customer", AccessKind::Read).expect("template");
        let t2 = annotator.template("Customer", AccessKind::Read).expect("template");
        assert!(Arc::ptr_eq(&t1, &t2));
        assert!(Arc::ptr_eq(&t1.annotations, &first));
    }

    #[test]
    fn template_lists_only_categorized_fields() {
        let annotator = annotator();
        let read = annotator.template("Customer", AccessKind::Read).expect("template");
        let names: Vec<_> = read.fields.iter().map(|f| f.name.as_str()).collect();
        assert_eq!(names, vec!["ID", "creditCard"]);

        let write = annotator.template("Customer", AccessKind::Write).expect("template");
        assert_eq!(write.fields.len(), 3);
    }

    #[test]
    fn subject_without_key_faults_only_itself() {
        let annotator = annotator();
        let err = annotator.annotations("Broken").expect_err("no primary key");
        assert!(err.to_string().contains("Broken"));
        assert!(annotator.template("Customer", AccessKind::Write).is_ok());
        assert!(annotator.annotations("Unknown").is_err());
    }
}
