//! Lookup Query Synthesizer.
//!
//! Turns a [`SubjectResolution`] plus one concrete row into a query that
//! returns the data-subject key of that row. The data-subject entity is the
//! outermost scope (`d0`); every hop back toward the source row nests one
//! `EXISTS` (`d1`, `d2`, ...), and the innermost scope pins the source row by
//! its primary key.

use std::sync::Arc;

use kimberlite_config::QuerySynthesisMode;
use kimberlite_query::{ColumnRef, Expr, ParameterizedQuery, SelectQuery, TableRef, Value};
use serde::Serialize;

use crate::delta::Row;
use crate::error::{PersonalDataError, Result, SchemaFault};
use crate::index::RelationshipIndex;
use crate::relation::on_condition;
use crate::resolver::{Direction, JoinPath, SubjectResolution};

/// A synthesized data-subject lookup.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LookupQuery {
    /// Role the result is cached under.
    pub role: String,
    /// Data-subject entity type the query selects from.
    pub subject: String,
    /// Columns of each result row (the subject's key fields).
    pub keys: Vec<String>,
    pub depth: usize,
    statement: ParameterizedQuery,
}

impl LookupQuery {
    /// The statement as stored; contains `$N` placeholders in placeholder
    /// mode.
    pub fn statement(&self) -> &SelectQuery {
        self.statement.statement()
    }

    pub fn bindings(&self) -> &[Value] {
        self.statement.bindings()
    }

    pub fn is_template(&self) -> bool {
        self.statement.is_template()
    }

    /// SQL text as stored.
    pub fn sql(&self) -> String {
        self.statement.to_sql()
    }

    /// The statement with placeholders substituted.
    pub fn bind(&self) -> Result<SelectQuery> {
        Ok(self.statement.bound()?)
    }
}

/// Serializable description of a lookup, used by diagnostics.
#[derive(Debug, Clone, Serialize)]
pub struct LookupPlan {
    pub role: String,
    pub subject: String,
    pub depth: usize,
    pub sql: String,
}

impl From<&LookupQuery> for LookupPlan {
    fn from(query: &LookupQuery) -> Self {
        Self {
            role: query.role.clone(),
            subject: query.subject.clone(),
            depth: query.depth,
            sql: query.sql(),
        }
    }
}

fn alias(level: usize) -> String {
    format!("d{level}")
}

#[derive(Debug)]
pub struct LookupSynthesizer {
    index: Arc<RelationshipIndex>,
    mode: QuerySynthesisMode,
}

impl LookupSynthesizer {
    pub fn new(index: Arc<RelationshipIndex>, mode: QuerySynthesisMode) -> Self {
        Self { index, mode }
    }

    pub fn mode(&self) -> QuerySynthesisMode {
        self.mode
    }

    /// Synthesizes the lookup of `row`'s data subject.
    ///
    /// `row` is a row of `resolution.source` and must contain all of its key
    /// fields.
    pub fn synthesize(&self, resolution: &SubjectResolution, row: &Row) -> Result<LookupQuery> {
        let source = self
            .index
            .entity(&resolution.source)
            .ok_or_else(|| SchemaFault::UnknownEntity(resolution.source.clone()))?;
        let subject = self
            .index
            .entity(&resolution.subject)
            .ok_or_else(|| SchemaFault::UnknownEntity(resolution.subject.clone()))?;

        let subject_keys: Vec<String> = subject.object_keys().map(str::to_string).collect();
        if subject_keys.is_empty() {
            return Err(SchemaFault::MissingPrimaryKey(subject.name.clone()).into());
        }

        let mut bindings = Vec::new();
        let mut pinned = Vec::new();
        for key in source.object_keys() {
            let value = row
                .get(key)
                .filter(|v| !v.is_null())
                .ok_or_else(|| PersonalDataError::MissingKeyValue {
                    entity: source.name.clone(),
                    field: key.to_string(),
                })?;
            let value = Value::from_json(value);
            let operand = match self.mode {
                QuerySynthesisMode::Literal => value,
                QuerySynthesisMode::Placeholder => {
                    bindings.push(value);
                    Value::Placeholder(bindings.len())
                }
            };
            pinned.push((key.to_string(), operand));
        }

        let mut branches: Vec<Expr> = Vec::new();
        for path in &resolution.paths {
            let branch = self.branch(path, &pinned)?;
            if !branches.contains(&branch) {
                branches.push(branch);
            }
        }

        let statement = SelectQuery::new(TableRef::new(&subject.name, alias(0)), subject_keys.clone())?
            .and_where(Expr::or(branches));
        let depth = statement.exists_depth();

        Ok(LookupQuery {
            role: resolution.role.clone(),
            subject: subject.name.clone(),
            keys: subject_keys,
            depth,
            statement: ParameterizedQuery::new(statement, bindings)?,
        })
    }

    /// Builds the filter contributed by one path to the `d0` scope.
    fn branch(&self, path: &JoinPath, pinned: &[(String, Value)]) -> Result<Expr> {
        let n = path.depth();
        let pin = |level: usize| {
            Expr::and(pinned.iter().map(|(key, value)| {
                Expr::eq(
                    Expr::column(ColumnRef::qualified(alias(level), key)),
                    Expr::Literal(value.clone()),
                )
            }))
        };
        if n == 0 {
            return Ok(pin(0));
        }

        // steps[k] links the entity at level n-k with the one at n-k-1.
        let mut inner: Option<Expr> = None;
        for (k, step) in path.steps.iter().enumerate() {
            let here = alias(n - k);
            let there = alias(n - k - 1);
            let link = match step.direction {
                Direction::Down => on_condition(&self.index, &step.relationship, &here, &there)?,
                Direction::Up => on_condition(&self.index, &step.relationship, &there, &here)?,
            };
            let entity = self
                .index
                .entity(&step.entity)
                .ok_or_else(|| SchemaFault::UnknownEntity(step.entity.clone()))?;
            let mut columns: Vec<String> = entity.object_keys().map(str::to_string).collect();
            if columns.is_empty() {
                columns = entity.fields.iter().take(1).map(|f| f.name.clone()).collect();
            }

            let filter = match inner.take() {
                None => Expr::and([link, pin(n)]),
                Some(nested) => Expr::and([link, nested]),
            };
            let scope = SelectQuery::new(TableRef::new(&entity.name, here), columns)?.and_where(filter);
            inner = Some(Expr::exists(scope));
        }
        Ok(inner.unwrap_or_else(|| pin(0)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::resolver::{ExhaustiveSearch, SubjectSearch};
    use crate::schema::{Condition, EntityDef, EntitySemantics, FieldDef, Relationship, Schema};
    use serde_json::json;

    fn index() -> Arc<RelationshipIndex> {
        Arc::new(RelationshipIndex::new(Schema::new([
            EntityDef::new("Customer")
                .with_semantics(EntitySemantics::DataSubject)
                .with_field(FieldDef::key("ID").data_subject_id())
                .with_relationship(
                    Relationship::to_many("addresses", "Address")
                        .composition()
                        .on(Condition::backlink("addresses", "customer")),
                ),
            EntityDef::new("Address")
                .with_semantics(EntitySemantics::DataSubjectDetails)
                .with_field(FieldDef::key("ID"))
                .with_field(FieldDef::new("street").personal())
                .with_relationship(
                    Relationship::to_one("customer", "Customer").foreign_key("customer_ID", "ID"),
                ),
            EntityDef::new("Order")
                .with_semantics(EntitySemantics::Other)
                .with_field(FieldDef::key("ID"))
                .with_field(FieldDef::key("IsActiveEntity"))
                .with_relationship(
                    Relationship::to_one("customer", "Customer").foreign_key("customer_ID", "ID"),
                ),
            EntityDef::new("OrderItem")
                .with_semantics(EntitySemantics::Other)
                .with_field(FieldDef::key("order_ID"))
                .with_field(FieldDef::key("pos"))
                .with_relationship(
                    Relationship::to_one("order", "Order").foreign_key("order_ID", "ID"),
                ),
        ])))
    }

    fn row(value: serde_json::Value) -> Row {
        match value {
            serde_json::Value::Object(map) => map,
            _ => Row::new(),
        }
    }

    fn synthesize(entity: &str, mode: QuerySynthesisMode, r: &Row) -> Result<LookupQuery> {
        let index = index();
        let resolution = ExhaustiveSearch.search(&index, entity).expect("resolves");
        LookupSynthesizer::new(index, mode).synthesize(&resolution, r)
    }

    #[test]
    fn one_hop_literal() {
        let query = synthesize(
            "Order",
            QuerySynthesisMode::Literal,
            &row(json!({ "ID": "O1", "IsActiveEntity": true })),
        )
        .expect("synthesizes");
        assert_eq!(query.role, "Customer");
        assert_eq!(query.depth, 1);
        assert_eq!(
            query.sql(),
            r#"SELECT d0."ID" FROM "Customer" AS d0 WHERE EXISTS (SELECT d1."ID" FROM "Order" AS d1 WHERE d1."customer_ID" = d0."ID" AND d1."ID" = 'O1')"#
        );
        assert!(!query.is_template());
    }

    #[test]
    fn two_hops_nest_in_order() {
        let query = synthesize(
            "OrderItem",
            QuerySynthesisMode::Literal,
            &row(json!({ "order_ID": "O1", "pos": 2 })),
        )
        .expect("synthesizes");
        assert_eq!(query.depth, 2);
        assert_eq!(
            query.sql(),
            concat!(
                r#"SELECT d0."ID" FROM "Customer" AS d0 WHERE EXISTS ("#,
                r#"SELECT d1."ID" FROM "Order" AS d1 WHERE d1."customer_ID" = d0."ID" AND EXISTS ("#,
                r#"SELECT d2."order_ID", d2."pos" FROM "OrderItem" AS d2 WHERE d2."order_ID" = d1."ID" AND d2."order_ID" = 'O1' AND d2."pos" = 2))"#,
            )
        );
    }

    #[test]
    fn equivalent_branches_collapse() {
        // Address reaches Customer Up and Down with the same condition.
        let query = synthesize(
            "Address",
            QuerySynthesisMode::Literal,
            &row(json!({ "ID": "A1" })),
        )
        .expect("synthesizes");
        assert_eq!(query.depth, 1);
        assert!(!query.sql().contains(" OR "));
    }

    #[test]
    fn placeholder_mode_binds_to_literal_form() {
        let r = row(json!({ "order_ID": "O'1", "pos": 2 }));
        let template = synthesize("OrderItem", QuerySynthesisMode::Placeholder, &r).expect("synthesizes");
        let literal = synthesize("OrderItem", QuerySynthesisMode::Literal, &r).expect("synthesizes");

        assert!(template.is_template());
        assert!(template.sql().contains(r#"d2."order_ID" = $1 AND d2."pos" = $2"#));
        assert_eq!(template.bindings(), &[Value::from("O'1"), Value::BigInt(2)]);
        assert_eq!(template.bind().expect("binds"), *literal.statement());
    }

    #[test]
    fn missing_key_value_is_an_error() {
        let err = synthesize("OrderItem", QuerySynthesisMode::Literal, &row(json!({ "pos": 1 })))
            .expect_err("order_ID missing");
        assert!(matches!(err, PersonalDataError::MissingKeyValue { ref field, .. } if field == "order_ID"));
    }

    #[test]
    fn or_combines_branches_sharing_a_tail() {
        let index = Arc::new(RelationshipIndex::new(Schema::new([
            EntityDef::new("Person")
                .with_semantics(EntitySemantics::DataSubject)
                .with_field(FieldDef::key("ID")),
            EntityDef::new("Mid")
                .with_semantics(EntitySemantics::Other)
                .with_field(FieldDef::key("ID"))
                .with_relationship(Relationship::to_one("person", "Person").foreign_key("person_ID", "ID")),
            EntityDef::new("Item")
                .with_semantics(EntitySemantics::Other)
                .with_field(FieldDef::key("ID"))
                .with_relationship(Relationship::to_one("a", "Mid").foreign_key("a_ID", "ID"))
                .with_relationship(Relationship::to_one("b", "Mid").foreign_key("b_ID", "ID")),
        ])));
        let resolution = ExhaustiveSearch.search(&index, "Item").expect("resolves");
        assert_eq!(resolution.paths.len(), 2);

        let query = LookupSynthesizer::new(index, QuerySynthesisMode::Literal)
            .synthesize(&resolution, &row(json!({ "ID": 7 })))
            .expect("synthesizes");
        assert_eq!(query.depth, 2);
        assert_eq!(
            query.sql(),
            concat!(
                r#"SELECT d0."ID" FROM "Person" AS d0 WHERE "#,
                r#"EXISTS (SELECT d1."ID" FROM "Mid" AS d1 WHERE d1."person_ID" = d0."ID" AND "#,
                r#"EXISTS (SELECT d2."ID" FROM "Item" AS d2 WHERE d2."a_ID" = d1."ID" AND d2."ID" = 7))"#,
                r#" OR EXISTS (SELECT d1."ID" FROM "Mid" AS d1 WHERE d1."person_ID" = d0."ID" AND "#,
                r#"EXISTS (SELECT d2."ID" FROM "Item" AS d2 WHERE d2."b_ID" = d1."ID" AND d2."ID" = 7))"#,
            )
        );
    }

    #[test]
    fn or_combines_distinct_branches() {
        let index = Arc::new(RelationshipIndex::new(Schema::new([
            EntityDef::new("Person")
                .with_semantics(EntitySemantics::DataSubject)
                .with_field(FieldDef::key("ID")),
            EntityDef::new("Contract")
                .with_semantics(EntitySemantics::Other)
                .with_field(FieldDef::key("ID"))
                .with_relationship(Relationship::to_one("holder", "Person").foreign_key("holder_ID", "ID"))
                .with_relationship(Relationship::to_one("payer", "Person").foreign_key("payer_ID", "ID")),
        ])));
        let resolution = ExhaustiveSearch.search(&index, "Contract").expect("resolves");
        assert_eq!(resolution.paths.len(), 2);

        let query = LookupSynthesizer::new(index, QuerySynthesisMode::Literal)
            .synthesize(&resolution, &row(json!({ "ID": 7 })))
            .expect("synthesizes");
        assert_eq!(query.depth, 1);
        assert_eq!(
            query.sql(),
            concat!(
                r#"SELECT d0."ID" FROM "Person" AS d0 WHERE "#,
                r#"EXISTS (SELECT d1."ID" FROM "Contract" AS d1 WHERE d1."holder_ID" = d0."ID" AND d1."ID" = 7)"#,
                r#" OR EXISTS (SELECT d1."ID" FROM "Contract" AS d1 WHERE d1."payer_ID" = d0."ID" AND d1."ID" = 7)"#,
            )
        );
    }
}
