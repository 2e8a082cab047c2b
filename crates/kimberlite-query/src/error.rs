//! Error types for lookup query construction and binding.

use thiserror::Error;

/// Errors raised while building, binding, or rendering a query.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum QueryError {
    /// A `$N` placeholder has no bound value.
    #[error("placeholder ${0} has no bound value")]
    UnboundPlaceholder(usize),

    /// The number of bound values does not match the placeholders in the query.
    #[error("expected {expected} bound values, got {actual}")]
    ParameterCount { expected: usize, actual: usize },

    /// A SELECT without any projected column.
    #[error("query over {0} projects no columns")]
    EmptyProjection(String),
}

/// Result type for query operations.
pub type Result<T> = std::result::Result<T, QueryError>;
