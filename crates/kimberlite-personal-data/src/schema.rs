//! Schema model: entity types, fields, and relationships.
//!
//! A [`Schema`] is loaded once (from JSON or built in code) and is immutable
//! afterwards. Everything the engine derives from it (annotations, templates,
//! join paths) lives in side tables keyed by entity position, never on the
//! schema nodes themselves.

use std::borrow::Cow;

use kimberlite_query::CompareOp;
use serde::{Deserialize, Serialize};

/// Draft marker field. Rows with `IsActiveEntity = false` are drafts and are
/// never audited; the field itself is never part of an object identifier.
pub const IS_ACTIVE_ENTITY: &str = "IsActiveEntity";

/// What an entity type represents with respect to personal data.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntitySemantics {
    /// Not annotated.
    #[default]
    None,
    /// The entity *is* the data subject (a customer, a patient, an employee).
    DataSubject,
    /// Records that hold details about a data subject (addresses, contacts).
    DataSubjectDetails,
    /// Any other entity carrying personal data (orders, appointments).
    Other,
}

impl EntitySemantics {
    /// True if rows of this entity need a data-subject lookup.
    pub fn needs_subject_lookup(self) -> bool {
        matches!(self, Self::DataSubjectDetails | Self::Other)
    }
}

/// Field-level semantics annotation.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FieldSemantics {
    #[default]
    None,
    /// The field identifies the data subject.
    DataSubjectId,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct FieldDef {
    pub name: String,
    /// Part of the primary key.
    pub key: bool,
    /// `IsPotentiallyPersonal`
    pub personal: bool,
    /// `IsPotentiallySensitive`
    pub sensitive: bool,
    pub semantics: FieldSemantics,
}

impl FieldDef {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Self::default()
        }
    }

    /// A primary-key field.
    pub fn key(name: impl Into<String>) -> Self {
        Self {
            key: true,
            ..Self::new(name)
        }
    }

    #[must_use]
    pub fn personal(mut self) -> Self {
        self.personal = true;
        self
    }

    #[must_use]
    pub fn sensitive(mut self) -> Self {
        self.sensitive = true;
        self
    }

    #[must_use]
    pub fn data_subject_id(mut self) -> Self {
        self.semantics = FieldSemantics::DataSubjectId;
        self
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Cardinality {
    #[default]
    ToOne,
    ToMany,
}

/// One foreign-key pair: `local` on the relationship's source entity
/// references `target` on the related entity.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ForeignKey {
    pub local: String,
    pub target: String,
}

/// An operand in an explicit join condition.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Operand {
    /// A field path. A path whose first segment is the relationship's own
    /// name refers to the related entity (`addresses.customer`); any other
    /// path refers to the entity declaring the relationship. A leading
    /// `$self` segment also refers to the declaring entity.
    Field(Vec<String>),
    /// `$self`: the row currently being joined. Only valid as the partner of
    /// a backlink path (`addresses.customer = $self`).
    #[serde(rename = "self")]
    SelfRef,
    Literal(serde_json::Value),
    /// A process-wide pseudo variable such as `$user` or `$now`.
    Pseudo(String),
}

impl Operand {
    pub fn field<I, S>(path: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self::Field(path.into_iter().map(Into::into).collect())
    }
}

/// Explicit join condition tree.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Condition {
    Compare {
        left: Operand,
        op: CompareOp,
        right: Operand,
    },
    IsNull(Operand),
    IsNotNull(Operand),
    And(Vec<Condition>),
    Or(Vec<Condition>),
    Not(Box<Condition>),
}

impl Condition {
    pub fn eq(left: Operand, right: Operand) -> Self {
        Self::Compare {
            left,
            op: CompareOp::Eq,
            right,
        }
    }

    /// `<relationship>.<backlink> = $self`
    pub fn backlink(relationship: &str, backlink: &str) -> Self {
        Self::eq(Operand::field([relationship, backlink]), Operand::SelfRef)
    }
}

/// A directed edge from the declaring entity to `target`.
///
/// Linked either by foreign keys or by an explicit `on` condition; when
/// `on` is present the foreign keys are ignored.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Relationship {
    pub name: String,
    pub target: String,
    pub cardinality: Cardinality,
    /// The related rows are owned by the declaring row (deep writes).
    pub composition: bool,
    pub foreign_keys: Vec<ForeignKey>,
    pub on: Option<Condition>,
}

impl Relationship {
    pub fn to_one(name: impl Into<String>, target: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            target: target.into(),
            cardinality: Cardinality::ToOne,
            ..Self::default()
        }
    }

    pub fn to_many(name: impl Into<String>, target: impl Into<String>) -> Self {
        Self {
            cardinality: Cardinality::ToMany,
            ..Self::to_one(name, target)
        }
    }

    #[must_use]
    pub fn composition(mut self) -> Self {
        self.composition = true;
        self
    }

    #[must_use]
    pub fn foreign_key(mut self, local: impl Into<String>, target: impl Into<String>) -> Self {
        self.foreign_keys.push(ForeignKey {
            local: local.into(),
            target: target.into(),
        });
        self
    }

    #[must_use]
    pub fn on(mut self, condition: Condition) -> Self {
        self.on = Some(condition);
        self
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EntityDef {
    pub name: String,
    pub semantics: EntitySemantics,
    /// Data-subject role. Only meaningful for `DataSubject` entities.
    pub role: Option<String>,
    pub fields: Vec<FieldDef>,
    pub relationships: Vec<Relationship>,
    /// Non-personal fields copied into read entries for context.
    pub attachments: Vec<String>,
}

impl EntityDef {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Self::default()
        }
    }

    #[must_use]
    pub fn with_semantics(mut self, semantics: EntitySemantics) -> Self {
        self.semantics = semantics;
        self
    }

    #[must_use]
    pub fn with_role(mut self, role: impl Into<String>) -> Self {
        self.role = Some(role.into());
        self
    }

    #[must_use]
    pub fn with_field(mut self, field: FieldDef) -> Self {
        self.fields.push(field);
        self
    }

    #[must_use]
    pub fn with_relationship(mut self, relationship: Relationship) -> Self {
        self.relationships.push(relationship);
        self
    }

    #[must_use]
    pub fn with_attachment(mut self, field: impl Into<String>) -> Self {
        self.attachments.push(field.into());
        self
    }

    pub fn field(&self, name: &str) -> Option<&FieldDef> {
        self.fields.iter().find(|f| f.name == name)
    }

    /// Primary-key field names in declaration order.
    pub fn keys(&self) -> impl Iterator<Item = &str> {
        self.fields.iter().filter(|f| f.key).map(|f| f.name.as_str())
    }

    /// Primary-key fields that identify a row, without the draft marker.
    pub fn object_keys(&self) -> impl Iterator<Item = &str> {
        self.keys().filter(|k| *k != IS_ACTIVE_ENTITY)
    }

    /// The data-subject role, for `DataSubject` entities.
    ///
    /// Falls back to the unqualified entity name (`sales.Customer` ->
    /// `Customer`) when no role is declared.
    pub fn subject_role(&self) -> Option<Cow<'_, str>> {
        if self.semantics != EntitySemantics::DataSubject {
            return None;
        }
        Some(match &self.role {
            Some(role) => Cow::Borrowed(role.as_str()),
            None => Cow::Borrowed(self.name.rsplit('.').next().unwrap_or(&self.name)),
        })
    }
}

/// A complete set of entity types.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Schema {
    pub entities: Vec<EntityDef>,
}

impl Schema {
    pub fn new(entities: impl IntoIterator<Item = EntityDef>) -> Self {
        Self {
            entities: entities.into_iter().collect(),
        }
    }

    pub fn from_json(json: &str) -> serde_json::Result<Self> {
        serde_json::from_str(json)
    }
}
