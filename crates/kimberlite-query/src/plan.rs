//! Query intermediate representation.
//!
//! A lookup is always a single-table `SELECT` whose filter may nest further
//! `SELECT`s inside `EXISTS`. Joins are never materialized; every hop between
//! tables is an `EXISTS` correlated through aliases.

use std::fmt::{self, Display};

use crate::error::{QueryError, Result};
use crate::expr::{ColumnRef, Expr, quote_ident};
use crate::value::Value;

/// A table in a FROM clause with its alias.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct TableRef {
    /// Table (entity) name.
    pub name: String,
    /// Alias used by column references in this scope and nested scopes.
    pub alias: String,
}

impl TableRef {
    pub fn new(name: impl Into<String>, alias: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            alias: alias.into(),
        }
    }
}

/// `SELECT columns FROM table AS alias [WHERE filter]`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SelectQuery {
    /// Source table.
    pub from: TableRef,
    /// Projected columns.
    pub columns: Vec<ColumnRef>,
    /// Optional filter.
    pub filter: Option<Expr>,
}

impl SelectQuery {
    /// Creates a query projecting `columns` (qualified by the table alias).
    pub fn new<I, S>(from: TableRef, columns: I) -> Result<Self>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let columns: Vec<ColumnRef> = columns
            .into_iter()
            .map(|c| ColumnRef::qualified(from.alias.clone(), c))
            .collect();
        if columns.is_empty() {
            return Err(QueryError::EmptyProjection(from.name));
        }
        Ok(Self {
            from,
            columns,
            filter: None,
        })
    }

    /// Adds `condition` to the filter with AND.
    pub fn and_where(mut self, condition: Expr) -> Self {
        self.filter = Some(match self.filter.take() {
            Some(existing) => Expr::and([existing, condition]),
            None => condition,
        });
        self
    }

    /// Maximum nesting depth of `EXISTS` subqueries under this query.
    pub fn exists_depth(&self) -> usize {
        self.filter.as_ref().map_or(0, Expr::exists_depth)
    }

    /// Collects placeholder indices used anywhere in this query.
    pub fn collect_placeholders(&self, out: &mut Vec<usize>) {
        if let Some(filter) = &self.filter {
            filter.collect_placeholders(out);
        }
    }

    /// Returns a copy with every placeholder replaced by its bound value.
    pub fn bind(&self, params: &[Value]) -> Result<Self> {
        Ok(Self {
            from: self.from.clone(),
            columns: self.columns.clone(),
            filter: self.filter.as_ref().map(|f| f.bind(params)).transpose()?,
        })
    }
}

impl Display for SelectQuery {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "SELECT ")?;
        for (i, column) in self.columns.iter().enumerate() {
            if i > 0 {
                write!(f, ", ")?;
            }
            write!(f, "{column}")?;
        }
        write!(
            f,
            " FROM {} AS {}",
            quote_ident(&self.from.name),
            self.from.alias
        )?;
        if let Some(filter) = &self.filter {
            write!(f, " WHERE {filter}")?;
        }
        Ok(())
    }
}

/// A statement plus the values for its `$N` placeholders.
///
/// Literal statements carry no bindings. Placeholder statements render to a
/// reusable SQL template and are bound right before execution.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParameterizedQuery {
    statement: SelectQuery,
    bindings: Vec<Value>,
}

impl ParameterizedQuery {
    /// Wraps a statement with its bindings, checking that every placeholder
    /// `$1..$n` has exactly one bound value.
    pub fn new(statement: SelectQuery, bindings: Vec<Value>) -> Result<Self> {
        let mut placeholders = Vec::new();
        statement.collect_placeholders(&mut placeholders);
        let expected = placeholders.iter().copied().max().unwrap_or(0);
        if expected != bindings.len() {
            return Err(QueryError::ParameterCount {
                expected,
                actual: bindings.len(),
            });
        }
        Ok(Self {
            statement,
            bindings,
        })
    }

    /// The statement, possibly containing placeholders.
    pub fn statement(&self) -> &SelectQuery {
        &self.statement
    }

    /// Bound values, in placeholder order.
    pub fn bindings(&self) -> &[Value] {
        &self.bindings
    }

    /// True if the statement still contains placeholders.
    pub fn is_template(&self) -> bool {
        !self.bindings.is_empty()
    }

    /// SQL text as stored (template form if placeholders are present).
    pub fn to_sql(&self) -> String {
        self.statement.to_string()
    }

    /// The statement with all placeholders substituted by literals.
    pub fn bound(&self) -> Result<SelectQuery> {
        if self.bindings.is_empty() {
            Ok(self.statement.clone())
        } else {
            self.statement.bind(&self.bindings)
        }
    }
}
