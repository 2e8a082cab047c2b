//! # kimberlite-query: lookup queries for personal-data audit logging
//!
//! This crate provides the query representation used to resolve data-subject
//! identifiers for audited rows.
//!
//! ## Shape
//!
//! Every lookup is a single-table `SELECT` whose filter nests one `EXISTS`
//! subquery per relationship hop:
//!
//! ```text
//! SELECT d0."ID" FROM "Customer" AS d0
//!  WHERE EXISTS (SELECT d1."ID" FROM "Order" AS d1
//!                 WHERE d1."customer_ID" = d0."ID" AND d1."ID" = 'O1')
//! ```
//!
//! Queries can be rendered with inline literals or as templates with `$N`
//! placeholders that are bound right before execution.
//!
//! ## Usage
//!
//! ```
//! use kimberlite_query::{ColumnRef, Expr, SelectQuery, TableRef};
//!
//! let query = SelectQuery::new(TableRef::new("Customer", "d0"), ["ID"])
//!     .unwrap()
//!     .and_where(Expr::eq(
//!         Expr::column(ColumnRef::qualified("d0", "ID")),
//!         Expr::literal("C1"),
//!     ));
//!
//! assert_eq!(
//!     query.to_string(),
//!     r#"SELECT d0."ID" FROM "Customer" AS d0 WHERE d0."ID" = 'C1'"#
//! );
//! ```

mod error;
mod expr;
mod plan;
mod value;


// Re-export public types
pub use error::{QueryError, Result};
pub use expr::{ColumnRef, CompareOp, Expr, PseudoVar, quote_ident};
pub use plan::{ParameterizedQuery, SelectQuery, TableRef};
pub use value::Value;
