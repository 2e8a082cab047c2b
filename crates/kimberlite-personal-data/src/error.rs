//! Error types for personal-data classification and resolution.

use thiserror::Error;

/// A defect in the schema metadata of one entity type.
///
/// Faults are memoized with the entity's annotations, so they are cheap to
/// clone and never carry foreign error sources.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SchemaFault {
    #[error("unknown entity type: {0}")]
    UnknownEntity(String),

    #[error("data subject entity {0} declares no primary key")]
    MissingPrimaryKey(String),

    #[error("unknown relationship {entity}.{relationship}")]
    UnknownRelationship {
        entity: String,
        relationship: String,
    },

    #[error("cannot translate condition of {entity}.{relationship}: {reason}")]
    UnsupportedCondition {
        entity: String,
        relationship: String,
        reason: String,
    },
}

#[derive(Debug, Error)]
pub enum PersonalDataError {
    #[error(transparent)]
    Schema(#[from] SchemaFault),

    #[error("row of {entity} has no value for key field {field}")]
    MissingKeyValue { entity: String, field: String },

    #[error("failed to build lookup query: {0}")]
    Query(#[from] kimberlite_query::QueryError),

    #[error("data subject lookup failed for roles {roles:?}: {source}")]
    LookupFailed {
        roles: Vec<String>,
        #[source]
        source: anyhow::Error,
    },

    #[error("audit transport rejected record: {0}")]
    Transport(#[source] anyhow::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, PersonalDataError>;
