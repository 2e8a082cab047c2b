//! Boolean condition trees.
//!
//! Conditions are built structurally (never by string concatenation) so the
//! same tree can be rendered to SQL, inspected for nesting depth, or bound
//! against placeholder values.

use std::fmt::{self, Display};

use serde::{Deserialize, Serialize};

use crate::error::{QueryError, Result};
use crate::plan::SelectQuery;
use crate::value::Value;

/// A column reference, optionally qualified by a table alias.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ColumnRef {
    /// Table alias (`None` = unqualified).
    pub qualifier: Option<String>,
    /// Column name.
    pub name: String,
}

impl ColumnRef {
    /// Creates an unqualified column reference.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            qualifier: None,
            name: name.into(),
        }
    }

    /// Creates a column reference qualified by `alias`.
    pub fn qualified(alias: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            qualifier: Some(alias.into()),
            name: name.into(),
        }
    }
}

impl Display for ColumnRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if let Some(qualifier) = &self.qualifier {
            write!(f, "{qualifier}.")?;
        }
        write!(f, "{}", quote_ident(&self.name))
    }
}

/// Process-wide pseudo variables.
///
/// These never belong to a table, so alias rewriting leaves them untouched.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum PseudoVar {
    /// The authenticated user of the current request (`$user`).
    CurrentUser,
    /// The request timestamp (`$now`).
    CurrentTimestamp,
    /// The tenant of the current request (`$tenant`).
    CurrentTenant,
    /// Any other session variable, by name without the `$` sigil.
    Session(String),
}

impl PseudoVar {
    /// Parses a `$name` pseudo variable. Returns `None` without the sigil.
    pub fn from_name(name: &str) -> Option<Self> {
        let bare = name.strip_prefix('$')?;
        Some(match bare {
            "user" => Self::CurrentUser,
            "now" => Self::CurrentTimestamp,
            "tenant" => Self::CurrentTenant,
            other => Self::Session(other.to_string()),
        })
    }
}

impl Display for PseudoVar {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::CurrentUser => write!(f, "CURRENT_USER"),
            Self::CurrentTimestamp => write!(f, "CURRENT_TIMESTAMP"),
            Self::CurrentTenant => write!(f, "SESSION_CONTEXT('tenant')"),
            Self::Session(name) => write!(f, "SESSION_CONTEXT('{}')", name.replace('\'', "''")),
        }
    }
}

/// Comparison operators.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CompareOp {
    /// Equal (=)
    Eq,
    /// Not equal (<>)
    NotEq,
    /// Less than (<)
    Lt,
    /// Less than or equal (<=)
    Le,
    /// Greater than (>)
    Gt,
    /// Greater than or equal (>=)
    Ge,
}

impl CompareOp {
    /// Returns the operator with its operands swapped (`a < b` == `b > a`).
    pub fn flipped(self) -> Self {
        match self {
            Self::Eq => Self::Eq,
            Self::NotEq => Self::NotEq,
            Self::Lt => Self::Gt,
            Self::Le => Self::Ge,
            Self::Gt => Self::Lt,
            Self::Ge => Self::Le,
        }
    }
}

impl Display for CompareOp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Eq => "=",
            Self::NotEq => "<>",
            Self::Lt => "<",
            Self::Le => "<=",
            Self::Gt => ">",
            Self::Ge => ">=",
        };
        write!(f, "{s}")
    }
}

/// A boolean or scalar expression.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Expr {
    /// Column reference.
    Column(ColumnRef),
    /// Literal value (including `$N` placeholders).
    Literal(Value),
    /// Process-wide pseudo variable.
    Pseudo(PseudoVar),
    /// Binary comparison.
    Compare {
        left: Box<Expr>,
        op: CompareOp,
        right: Box<Expr>,
    },
    /// `expr IS NULL`
    IsNull(Box<Expr>),
    /// `expr IS NOT NULL`
    IsNotNull(Box<Expr>),
    /// Conjunction. An empty conjunction is `TRUE`.
    And(Vec<Expr>),
    /// Disjunction. An empty disjunction is `FALSE`.
    Or(Vec<Expr>),
    /// Negation.
    Not(Box<Expr>),
    /// `EXISTS (subquery)`
    Exists(Box<SelectQuery>),
}

impl Expr {
    /// Column reference shorthand.
    pub fn column(column: ColumnRef) -> Self {
        Self::Column(column)
    }

    /// Literal shorthand.
    pub fn literal(value: impl Into<Value>) -> Self {
        Self::Literal(value.into())
    }

    /// Builds `left op right`.
    pub fn compare(left: Expr, op: CompareOp, right: Expr) -> Self {
        Self::Compare {
            left: Box::new(left),
            op,
            right: Box::new(right),
        }
    }

    /// Builds `left = right`.
    pub fn eq(left: Expr, right: Expr) -> Self {
        Self::compare(left, CompareOp::Eq, right)
    }

    /// Builds a conjunction, flattening nested `And`s and collapsing a single
    /// operand to itself.
    pub fn and(operands: impl IntoIterator<Item = Expr>) -> Self {
        let mut flat = Vec::new();
        for operand in operands {
            match operand {
                Self::And(inner) => flat.extend(inner),
                other => flat.push(other),
            }
        }
        if flat.len() == 1 {
            flat.pop().unwrap_or(Self::And(Vec::new()))
        } else {
            Self::And(flat)
        }
    }

    /// Builds a disjunction, flattening nested `Or`s and collapsing a single
    /// operand to itself.
    pub fn or(operands: impl IntoIterator<Item = Expr>) -> Self {
        let mut flat = Vec::new();
        for operand in operands {
            match operand {
                Self::Or(inner) => flat.extend(inner),
                other => flat.push(other),
            }
        }
        if flat.len() == 1 {
            flat.pop().unwrap_or(Self::Or(Vec::new()))
        } else {
            Self::Or(flat)
        }
    }

    /// Builds `EXISTS (subquery)`.
    pub fn exists(subquery: SelectQuery) -> Self {
        Self::Exists(Box::new(subquery))
    }

    /// Maximum nesting depth of `EXISTS` subqueries in this expression.
    pub fn exists_depth(&self) -> usize {
        match self {
            Self::Column(_) | Self::Literal(_) | Self::Pseudo(_) => 0,
            Self::Compare { left, right, .. } => left.exists_depth().max(right.exists_depth()),
            Self::IsNull(inner) | Self::IsNotNull(inner) | Self::Not(inner) => inner.exists_depth(),
            Self::And(operands) | Self::Or(operands) => operands
                .iter()
                .map(Expr::exists_depth)
                .max()
                .unwrap_or(0),
            Self::Exists(subquery) => 1 + subquery.exists_depth(),
        }
    }

    /// Qualifies every unqualified column with `alias`.
    ///
    /// Already-qualified columns and pseudo variables are left alone, so
    /// applying this twice is the same as applying it once. Subqueries are not
    /// entered: their columns belong to their own scope.
    pub fn qualify_unqualified(&self, alias: &str) -> Self {
        match self {
            Self::Column(column) if column.qualifier.is_none() => {
                Self::Column(ColumnRef::qualified(alias, column.name.clone()))
            }
            Self::Column(_) | Self::Literal(_) | Self::Pseudo(_) | Self::Exists(_) => self.clone(),
            Self::Compare { left, op, right } => Self::Compare {
                left: Box::new(left.qualify_unqualified(alias)),
                op: *op,
                right: Box::new(right.qualify_unqualified(alias)),
            },
            Self::IsNull(inner) => Self::IsNull(Box::new(inner.qualify_unqualified(alias))),
            Self::IsNotNull(inner) => Self::IsNotNull(Box::new(inner.qualify_unqualified(alias))),
            Self::Not(inner) => Self::Not(Box::new(inner.qualify_unqualified(alias))),
            Self::And(operands) => {
                Self::And(operands.iter().map(|o| o.qualify_unqualified(alias)).collect())
            }
            Self::Or(operands) => {
                Self::Or(operands.iter().map(|o| o.qualify_unqualified(alias)).collect())
            }
        }
    }

    /// Collects the indices of all placeholders, including those in subqueries.
    pub fn collect_placeholders(&self, out: &mut Vec<usize>) {
        match self {
            Self::Literal(Value::Placeholder(idx)) => out.push(*idx),
            Self::Column(_) | Self::Literal(_) | Self::Pseudo(_) => {}
            Self::Compare { left, right, .. } => {
                left.collect_placeholders(out);
                right.collect_placeholders(out);
            }
            Self::IsNull(inner) | Self::IsNotNull(inner) | Self::Not(inner) => {
                inner.collect_placeholders(out);
            }
            Self::And(operands) | Self::Or(operands) => {
                for operand in operands {
                    operand.collect_placeholders(out);
                }
            }
            Self::Exists(subquery) => subquery.collect_placeholders(out),
        }
    }

    /// Replaces every `$N` placeholder with `params[N - 1]`.
    pub fn bind(&self, params: &[Value]) -> Result<Self> {
        Ok(match self {
            Self::Literal(Value::Placeholder(idx)) => {
                let value = idx
                    .checked_sub(1)
                    .and_then(|i| params.get(i))
                    .ok_or(QueryError::UnboundPlaceholder(*idx))?;
                Self::Literal(value.clone())
            }
            Self::Column(_) | Self::Literal(_) | Self::Pseudo(_) => self.clone(),
            Self::Compare { left, op, right } => Self::Compare {
                left: Box::new(left.bind(params)?),
                op: *op,
                right: Box::new(right.bind(params)?),
            },
            Self::IsNull(inner) => Self::IsNull(Box::new(inner.bind(params)?)),
            Self::IsNotNull(inner) => Self::IsNotNull(Box::new(inner.bind(params)?)),
            Self::Not(inner) => Self::Not(Box::new(inner.bind(params)?)),
            Self::And(operands) => Self::And(
                operands
                    .iter()
                    .map(|o| o.bind(params))
                    .collect::<Result<_>>()?,
            ),
            Self::Or(operands) => Self::Or(
                operands
                    .iter()
                    .map(|o| o.bind(params))
                    .collect::<Result<_>>()?,
            ),
            Self::Exists(subquery) => Self::Exists(Box::new(subquery.bind(params)?)),
        })
    }

    fn needs_parens(&self) -> bool {
        matches!(self, Self::Or(operands) if operands.len() > 1)
            || matches!(self, Self::And(operands) if operands.len() > 1)
    }
}

impl Display for Expr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Column(column) => write!(f, "{column}"),
            Self::Literal(value) => write!(f, "{value}"),
            Self::Pseudo(var) => write!(f, "{var}"),
            Self::Compare { left, op, right } => write!(f, "{left} {op} {right}"),
            Self::IsNull(inner) => write!(f, "{inner} IS NULL"),
            Self::IsNotNull(inner) => write!(f, "{inner} IS NOT NULL"),
            Self::And(operands) if operands.is_empty() => write!(f, "TRUE"),
            Self::Or(operands) if operands.is_empty() => write!(f, "FALSE"),
            Self::And(operands) => write_joined(f, operands, " AND "),
            Self::Or(operands) => write_joined(f, operands, " OR "),
            Self::Not(inner) => write!(f, "NOT ({inner})"),
            Self::Exists(subquery) => write!(f, "EXISTS ({subquery})"),
        }
    }
}

fn write_joined(f: &mut fmt::Formatter<'_>, operands: &[Expr], sep: &str) -> fmt::Result {
    for (i, operand) in operands.iter().enumerate() {
        if i > 0 {
            write!(f, "{sep}")?;
        }
        if operand.needs_parens() {
            write!(f, "({operand})")?;
        } else {
            write!(f, "{operand}")?;
        }
    }
    Ok(())
}

/// Double-quotes an identifier, doubling embedded quotes.
pub fn quote_ident(ident: &str) -> String {
    format!("\"{}\"", ident.replace('"', "\"\""))
}
