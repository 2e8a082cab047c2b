//! # kimberlite-personal-data: personal-data audit logging
//!
//! Discovers which rows of a model-driven schema carry personal data, who
//! the data belongs to, and assembles GDPR audit records for reads and
//! writes of those rows.
//!
//! ## Components
//!
//! - [`Annotator`]: per-entity field categories, memoized write-once.
//! - [`RelationshipIndex`] and [`on_condition`]: relationship lookup and the
//!   aliased join conditions between two entity scopes.
//! - [`SubjectResolver`]: nearest data-subject entity and the join path to
//!   it, using [`ExhaustiveSearch`] or [`GreedySearch`].
//! - [`LookupSynthesizer`]: nested-`EXISTS` lookup of a row's data subject.
//! - [`AuditSession`]: per-request classification, the [`ResolutionCache`]
//!   that runs at most one lookup per role, and emission to an
//!   [`AuditSink`].
//!
//! ## Usage
//!
//! ```
//! use kimberlite_config::PersonalDataConfig;
//! use kimberlite_personal_data::{
//!     Delta, EntityDef, EntitySemantics, FieldDef, PersonalDataAudit, Relationship, Schema,
//! };
//!
//! let schema = Schema::new([
//!     EntityDef::new("Customer")
//!         .with_semantics(EntitySemantics::DataSubject)
//!         .with_field(FieldDef::key("ID").data_subject_id()),
//!     EntityDef::new("Order")
//!         .with_semantics(EntitySemantics::Other)
//!         .with_field(FieldDef::key("ID"))
//!         .with_field(FieldDef::new("shippingAddress").personal())
//!         .with_relationship(
//!             Relationship::to_one("customer", "Customer").foreign_key("customer_ID", "ID"),
//!         ),
//! ]);
//! let audit = PersonalDataAudit::new(schema, PersonalDataConfig::default());
//!
//! let mut session = audit.session();
//! let row = serde_json::json!({ "ID": "O1", "customer_ID": "C1", "shippingAddress": "Main St 1" });
//! session.after_create("Order", &[Delta::create(row.as_object().cloned().unwrap_or_default())]);
//!
//! assert_eq!(session.writes().len(), 1);
//! assert_eq!(session.cache().pending(), 1);
//! ```

mod annotator;
mod cache;
mod classifier;
mod delta;
mod engine;
mod error;
mod index;
mod lookup;
mod record;
mod relation;
mod resolver;
mod schema;
mod session;
mod sink;

pub use annotator::{AccessKind, Annotator, Category, CategorySet, EntityAnnotations, Template, TemplateField};
pub use cache::{CacheEntry, LookupExecutor, ResolutionCache};
pub use classifier::diff;
pub use delta::{Delta, Operation, Row, normalize};
pub use engine::{Explanation, PersonalDataAudit};
pub use error::{PersonalDataError, Result, SchemaFault};
pub use index::{RelationshipIndex, RelationshipRef};
pub use lookup::{LookupPlan, LookupQuery, LookupSynthesizer};
pub use record::{
    Attachment, Attribute, AuditEntry, AuditEvent, AuditRecord, EntryKey, EntrySet, ObjectRef,
    RecordSubject, SubjectId, SubjectRef,
};
pub use relation::on_condition;
pub use resolver::{
    Direction, ExhaustiveSearch, GreedySearch, JoinPath, PathStep, SubjectResolution, SubjectResolver,
    SubjectSearch,
};
pub use schema::{
    Cardinality, Condition, EntityDef, EntitySemantics, FieldDef, FieldSemantics, ForeignKey,
    IS_ACTIVE_ENTITY, Operand, Relationship, Schema,
};
pub use session::{AuditSession, FinishSummary};
pub use sink::{AuditSink, MemorySink, TracingSink};
