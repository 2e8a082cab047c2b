//! Process-wide engine: schema plus every memoized side table.

use std::sync::Arc;

use kimberlite_config::{PersonalDataConfig, QuerySynthesisMode, SubjectSearchMode};
use serde::Serialize;
use tracing::info;
use uuid::Uuid;

use crate::annotator::Annotator;
use crate::classifier::Classifier;
use crate::delta::Row;
use crate::error::Result;
use crate::index::RelationshipIndex;
use crate::lookup::{LookupPlan, LookupSynthesizer};
use crate::resolver::{ExhaustiveSearch, GreedySearch, SubjectResolver, SubjectSearch};
use crate::schema::Schema;
use crate::session::AuditSession;

#[derive(Debug)]
struct Inner {
    config: PersonalDataConfig,
    index: Arc<RelationshipIndex>,
    annotator: Annotator,
    resolver: SubjectResolver,
    synthesizer: LookupSynthesizer,
}

/// The personal-data audit engine.
///
/// Cheap to clone; all clones share the same memoized classification and
/// join paths. Per-request state lives in [`AuditSession`].
#[derive(Debug, Clone)]
pub struct PersonalDataAudit {
    inner: Arc<Inner>,
}

/// How an entity type resolves to its data subject.
#[derive(Debug, Clone, Serialize)]
pub struct Explanation {
    pub entity: String,
    pub subject: String,
    pub role: String,
    pub depth: usize,
    pub paths: Vec<String>,
    pub lookup: LookupPlan,
}

impl PersonalDataAudit {
    pub fn new(schema: Schema, config: PersonalDataConfig) -> Self {
        let index = Arc::new(RelationshipIndex::new(schema));
        let strategy: Box<dyn SubjectSearch> = match config.subject_search {
            SubjectSearchMode::Exhaustive => Box::new(ExhaustiveSearch),
            SubjectSearchMode::Greedy => Box::new(GreedySearch),
        };
        info!(
            entities = index.len(),
            subject_search = %config.subject_search,
            query_synthesis = %config.query_synthesis,
            "personal data audit initialized"
        );
        Self {
            inner: Arc::new(Inner {
                config,
                annotator: Annotator::new(Arc::clone(&index)),
                resolver: SubjectResolver::new(Arc::clone(&index), strategy),
                synthesizer: LookupSynthesizer::new(Arc::clone(&index), config.query_synthesis),
                index,
            }),
        }
    }

    pub fn config(&self) -> PersonalDataConfig {
        self.inner.config
    }

    pub fn index(&self) -> &RelationshipIndex {
        &self.inner.index
    }

    pub fn annotator(&self) -> &Annotator {
        &self.inner.annotator
    }

    pub fn resolver(&self) -> &SubjectResolver {
        &self.inner.resolver
    }

    pub fn synthesizer(&self) -> &LookupSynthesizer {
        &self.inner.synthesizer
    }

    pub(crate) fn classifier(&self) -> Classifier<'_> {
        Classifier {
            index: &self.inner.index,
            annotator: &self.inner.annotator,
            resolver: &self.inner.resolver,
            synthesizer: &self.inner.synthesizer,
        }
    }

    /// Starts the audit of one request.
    pub fn session(&self) -> AuditSession {
        self.session_for(Uuid::new_v4())
    }

    pub fn session_for(&self, request: Uuid) -> AuditSession {
        AuditSession::new(self.clone(), request)
    }

    /// Describes how `entity` resolves to its data subject. The lookup is
    /// rendered for a stand-in row whose key values are `:<key>` markers, or
    /// as a `$N` template in placeholder mode. `None` if no data subject is
    /// reachable.
    pub fn explain(&self, entity: &str) -> Result<Option<Explanation>> {
        self.inner.annotator.annotations(entity)?;
        let Some(resolution) = self.inner.resolver.resolve(entity) else {
            return Ok(None);
        };

        let row: Row = self
            .index()
            .entity(entity)
            .into_iter()
            .flat_map(|e| e.object_keys())
            .map(|key| (key.to_string(), serde_json::Value::String(format!(":{key}"))))
            .collect();
        let query = self.inner.synthesizer.synthesize(&resolution, &row)?;

        Ok(Some(Explanation {
            entity: entity.to_string(),
            subject: resolution.subject.clone(),
            role: resolution.role.clone(),
            depth: resolution.depth,
            paths: resolution.paths.iter().map(ToString::to_string).collect(),
            lookup: LookupPlan::from(&query),
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::{EntityDef, EntitySemantics, FieldDef, Relationship};

    fn engine(config: PersonalDataConfig) -> PersonalDataAudit {
        PersonalDataAudit::new(
            Schema::new([
                EntityDef::new("Customer")
                    .with_semantics(EntitySemantics::DataSubject)
                    .with_field(FieldDef::key("ID").data_subject_id()),
                EntityDef::new("Order")
                    .with_semantics(EntitySemantics::Other)
                    .with_field(FieldDef::key("ID"))
                    .with_field(FieldDef::new("note").personal())
                    .with_relationship(
                        Relationship::to_one("customer", "Customer").foreign_key("customer_ID", "ID"),
                    ),
                EntityDef::new("Orphan")
                    .with_semantics(EntitySemantics::Other)
                    .with_field(FieldDef::key("ID"))
                    .with_field(FieldDef::new("note").personal()),
            ]),
            config,
        )
    }

    #[test]
    fn explain_renders_template() {
        let engine = engine(PersonalDataConfig::default());
        let explanation = engine.explain("Order").expect("no fault").expect("resolves");
        assert_eq!(explanation.role, "Customer");
        assert_eq!(explanation.depth, 1);
        assert_eq!(explanation.paths, vec!["Order ->[Order.customer] Customer".to_string()]);
        assert!(explanation.lookup.sql.ends_with(r#"d1."ID" = ':ID')"#));

        assert!(engine.explain("Orphan").expect("no fault").is_none());
        assert!(engine.explain("Nope").is_err());
    }

    #[test]
    fn explain_in_placeholder_mode_renders_template() {
        let engine = engine(PersonalDataConfig {
            query_synthesis: QuerySynthesisMode::Placeholder,
            ..PersonalDataConfig::default()
        });
        let explanation = engine.explain("Order").expect("no fault").expect("resolves");
        assert!(explanation.lookup.sql.ends_with(r#"d1."ID" = $1)"#));
    }

    #[test]
    fn clones_share_memoized_state() {
        let engine = engine(PersonalDataConfig::default());
        let clone = engine.clone();
        let a = engine.resolver().resolve("Order").expect("resolves");
        let b = clone.resolver().resolve("Order").expect("resolves");
        assert!(Arc::ptr_eq(&a, &b));
    }

    #[test]
    fn config_selects_synthesis_mode() {
        let engine = engine(PersonalDataConfig {
            subject_search: SubjectSearchMode::Greedy,
            query_synthesis: QuerySynthesisMode::Placeholder,
        });
        assert_eq!(engine.synthesizer().mode(), QuerySynthesisMode::Placeholder);
        assert_eq!(engine.config().subject_search, SubjectSearchMode::Greedy);
    }
}
