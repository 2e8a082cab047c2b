//! Per-Request Resolution Cache.
//!
//! One instance per logical request. Lookups are registered by data-subject
//! role; the first registration for a role wins and later ones are ignored,
//! so a request issues at most one lookup per role no matter how many rows
//! reference it.

use std::collections::BTreeMap;
use std::future::Future;

use futures::future::join_all;
use tracing::{debug, warn};

use crate::delta::Row;
use crate::error::{PersonalDataError, Result};
use crate::lookup::LookupQuery;

/// Executes lookup queries against the host's database.
pub trait LookupExecutor {
    fn run(&self, query: &LookupQuery) -> impl Future<Output = anyhow::Result<Vec<Row>>> + Send;
}

/// State of one role's resolution.
#[derive(Debug, Clone, PartialEq)]
pub enum CacheEntry {
    Pending(LookupQuery),
    /// `None` if the lookup found no row.
    Resolved(Option<Row>),
    /// The lookup failed; the message of the error.
    Failed(String),
}

#[derive(Debug, Default)]
pub struct ResolutionCache {
    entries: BTreeMap<String, CacheEntry>,
    executed: usize,
}

impl ResolutionCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn contains(&self, role: &str) -> bool {
        self.entries.contains_key(role)
    }

    /// Registers a lookup for `role`. Returns false (and drops `query`) if
    /// the role is already registered.
    pub fn register(&mut self, role: &str, query: LookupQuery) -> bool {
        if self.contains(role) {
            return false;
        }
        debug!(role = %role, depth = query.depth, "registered data subject lookup");
        self.entries.insert(role.to_string(), CacheEntry::Pending(query));
        true
    }

    /// Registers an already known identifier for `role`.
    pub fn register_value(&mut self, role: &str, id: Row) -> bool {
        if self.contains(role) {
            return false;
        }
        self.entries
            .insert(role.to_string(), CacheEntry::Resolved(Some(id)));
        true
    }

    pub fn lookup(&self, role: &str) -> Option<&CacheEntry> {
        self.entries.get(role)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Number of lookup queries executed so far.
    pub fn lookups_executed(&self) -> usize {
        self.executed
    }

    pub fn pending(&self) -> usize {
        self.entries
            .values()
            .filter(|e| matches!(e, CacheEntry::Pending(_)))
            .count()
    }

    /// Runs every pending lookup once, concurrently, and stores the results.
    ///
    /// Failed roles are kept as [`CacheEntry::Failed`] and reported together;
    /// successful roles are stored regardless.
    pub async fn resolve_all<E: LookupExecutor>(&mut self, executor: &E) -> Result<()> {
        let pending: Vec<(String, LookupQuery)> = self
            .entries
            .iter()
            .filter_map(|(role, entry)| match entry {
                CacheEntry::Pending(query) => Some((role.clone(), query.clone())),
                _ => None,
            })
            .collect();
        if pending.is_empty() {
            return Ok(());
        }

        let results = join_all(pending.iter().map(|(_, query)| executor.run(query))).await;
        self.executed += pending.len();

        let mut failed = Vec::new();
        let mut first_error = None;
        for ((role, query), result) in pending.into_iter().zip(results) {
            let entry = match result {
                Ok(rows) => {
                    if rows.len() > 1 {
                        debug!(role = %role, rows = rows.len(), "lookup returned several rows, using the first");
                    }
                    let id = rows.into_iter().next().map(|row| project(row, &query.keys));
                    if id.is_none() {
                        warn!(role = %role, subject = %query.subject, "data subject not found");
                    }
                    CacheEntry::Resolved(id)
                }
                Err(error) => {
                    warn!(role = %role, error = %error, "data subject lookup failed");
                    let message = format!("{error:#}");
                    failed.push(role.clone());
                    first_error.get_or_insert(error);
                    CacheEntry::Failed(message)
                }
            };
            self.entries.insert(role, entry);
        }

        match first_error {
            None => Ok(()),
            Some(source) => Err(PersonalDataError::LookupFailed {
                roles: failed,
                source,
            }),
        }
    }
}

/// Keeps only the subject's key columns, in key order.
fn project(mut row: Row, keys: &[String]) -> Row {
    let mut id = Row::new();
    for key in keys {
        if let Some(value) = row.remove(key) {
            id.insert(key.clone(), value);
        }
    }
    if id.is_empty() { row } else { id }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};

    use kimberlite_config::QuerySynthesisMode;
    use serde_json::json;

    use crate::index::RelationshipIndex;
    use crate::lookup::LookupSynthesizer;
    use crate::resolver::{ExhaustiveSearch, SubjectSearch};
    use crate::schema::{EntityDef, EntitySemantics, FieldDef, Relationship, Schema};

    fn query(entity: &str, id: &str) -> LookupQuery {
        let index = Arc::new(RelationshipIndex::new(Schema::new([
            EntityDef::new("Customer")
                .with_semantics(EntitySemantics::DataSubject)
                .with_field(FieldDef::key("ID")),
            EntityDef::new("Employee")
                .with_semantics(EntitySemantics::DataSubject)
                .with_field(FieldDef::key("ID")),
            EntityDef::new("Order")
                .with_semantics(EntitySemantics::Other)
                .with_field(FieldDef::key("ID"))
                .with_relationship(
                    Relationship::to_one("customer", "Customer").foreign_key("customer_ID", "ID"),
                ),
            EntityDef::new("Timesheet")
                .with_semantics(EntitySemantics::Other)
                .with_field(FieldDef::key("ID"))
                .with_relationship(
                    Relationship::to_one("employee", "Employee").foreign_key("employee_ID", "ID"),
                ),
        ])));
        let resolution = ExhaustiveSearch.search(&index, entity).expect("resolves");
        let mut row = Row::new();
        row.insert("ID".into(), json!(id));
        LookupSynthesizer::new(index, QuerySynthesisMode::Literal)
            .synthesize(&resolution, &row)
            .expect("synthesizes")
    }

    #[derive(Default)]
    struct Counting {
        calls: AtomicUsize,
    }

    impl LookupExecutor for Counting {
        fn run(&self, query: &LookupQuery) -> impl Future<Output = anyhow::Result<Vec<Row>>> + Send {
            self.calls.fetch_add(1, Ordering::SeqCst);
            let subject = query.subject.clone();
            async move {
                match subject.as_str() {
                    "Employee" => anyhow::bail!("connection reset"),
                    _ => {
                        let mut row = Row::new();
                        row.insert("ID".into(), json!("C1"));
                        row.insert("extra".into(), json!(true));
                        Ok(vec![row])
                    }
                }
            }
        }
    }

    #[test]
    fn register_is_first_wins() {
        let mut cache = ResolutionCache::new();
        assert!(cache.register("Customer", query("Order", "O1")));
        assert!(!cache.register("Customer", query("Order", "O2")));
        assert_eq!(cache.len(), 1);
        match cache.lookup("Customer") {
            Some(CacheEntry::Pending(q)) => assert!(q.sql().contains("'O1'")),
            other => panic!("unexpected entry: {other:?}"),
        }
    }

    #[tokio::test]
    async fn resolves_each_role_once() {
        let mut cache = ResolutionCache::new();
        cache.register("Customer", query("Order", "O1"));
        let executor = Counting::default();

        cache.resolve_all(&executor).await.expect("resolves");
        cache.resolve_all(&executor).await.expect("nothing left to do");

        assert_eq!(executor.calls.load(Ordering::SeqCst), 1);
        assert_eq!(cache.lookups_executed(), 1);
        assert_eq!(cache.pending(), 0);
        let mut expected = Row::new();
        expected.insert("ID".into(), json!("C1"));
        assert_eq!(cache.lookup("Customer"), Some(&CacheEntry::Resolved(Some(expected))));
    }

    #[tokio::test]
    async fn failures_propagate_per_role() {
        let mut cache = ResolutionCache::new();
        cache.register("Customer", query("Order", "O1"));
        cache.register("Employee", query("Timesheet", "T1"));

        let err = cache
            .resolve_all(&Counting::default())
            .await
            .expect_err("employee lookup fails");
        match err {
            PersonalDataError::LookupFailed { roles, source } => {
                assert_eq!(roles, vec!["Employee".to_string()]);
                assert!(source.to_string().contains("connection reset"));
            }
            other => panic!("unexpected error: {other}"),
        }
        assert!(matches!(cache.lookup("Customer"), Some(CacheEntry::Resolved(Some(_)))));
        assert!(matches!(cache.lookup("Employee"), Some(CacheEntry::Failed(_))));
    }

    #[test]
    fn known_values_need_no_lookup() {
        let mut cache = ResolutionCache::new();
        let mut id = Row::new();
        id.insert("ID".into(), json!("C9"));
        assert!(cache.register_value("Customer", id));
        assert!(!cache.register("Customer", query("Order", "O1")));
        assert_eq!(cache.pending(), 0);
    }
}
