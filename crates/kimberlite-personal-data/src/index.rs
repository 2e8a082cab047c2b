//! Relationship lookup table.
//!
//! Built once per schema. Replaces dynamic path resolution with plain map
//! lookups: `resolve("Order", "customer")` answers which relationship a path
//! segment names, and `incoming("Customer")` answers who references an
//! entity type.

use std::collections::HashMap;
use std::fmt::{self, Display};

use serde::{Deserialize, Serialize};

use crate::schema::{EntityDef, Relationship, Schema};

/// Names a relationship by its declaring entity and its name.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct RelationshipRef {
    pub entity: String,
    pub name: String,
}

impl RelationshipRef {
    pub fn new(entity: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            entity: entity.into(),
            name: name.into(),
        }
    }
}

impl Display for RelationshipRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.entity, self.name)
    }
}

#[derive(Debug)]
pub struct RelationshipIndex {
    schema: Schema,
    positions: HashMap<String, usize>,
    outgoing: HashMap<(usize, String), usize>,
    incoming: Vec<Vec<RelationshipRef>>,
}

impl RelationshipIndex {
    pub fn new(schema: Schema) -> Self {
        let positions: HashMap<String, usize> = schema
            .entities
            .iter()
            .enumerate()
            .map(|(i, e)| (e.name.clone(), i))
            .collect();

        let mut outgoing = HashMap::new();
        let mut incoming = vec![Vec::new(); schema.entities.len()];
        for (i, entity) in schema.entities.iter().enumerate() {
            for (j, relationship) in entity.relationships.iter().enumerate() {
                outgoing.insert((i, relationship.name.clone()), j);
                match positions.get(&relationship.target) {
                    Some(&target) => incoming[target]
                        .push(RelationshipRef::new(&entity.name, &relationship.name)),
                    None => tracing::warn!(
                        entity = %entity.name,
                        relationship = %relationship.name,
                        target = %relationship.target,
                        "relationship targets unknown entity type"
                    ),
                }
            }
        }

        Self {
            schema,
            positions,
            outgoing,
            incoming,
        }
    }

    pub fn schema(&self) -> &Schema {
        &self.schema
    }

    /// Number of entity types; side tables are sized by this.
    pub fn len(&self) -> usize {
        self.schema.entities.len()
    }

    pub fn is_empty(&self) -> bool {
        self.schema.entities.is_empty()
    }

    /// Stable position of an entity type, used to address side tables.
    pub fn position(&self, entity: &str) -> Option<usize> {
        self.positions.get(entity).copied()
    }

    pub fn entity(&self, entity: &str) -> Option<&EntityDef> {
        self.position(entity).map(|i| &self.schema.entities[i])
    }

    pub fn entities(&self) -> impl Iterator<Item = &EntityDef> {
        self.schema.entities.iter()
    }

    /// Resolves a path segment on `entity` to the relationship it names.
    pub fn resolve(&self, entity: &str, segment: &str) -> Option<&Relationship> {
        let i = self.position(entity)?;
        let j = *self.outgoing.get(&(i, segment.to_string()))?;
        Some(&self.schema.entities[i].relationships[j])
    }

    pub fn relationship(&self, r: &RelationshipRef) -> Option<&Relationship> {
        self.resolve(&r.entity, &r.name)
    }

    /// Relationships declared on other entity types (or this one) that
    /// target `entity`, in declaration order.
    pub fn incoming(&self, entity: &str) -> &[RelationshipRef] {
        self.position(entity)
            .map_or(&[][..], |i| self.incoming[i].as_slice())
    }

    /// Relationships declared on `entity` whose target is a known entity type.
    pub fn outgoing(&self, entity: &str) -> impl Iterator<Item = RelationshipRef> + '_ {
        self.entity(entity).into_iter().flat_map(move |e| {
            e.relationships
                .iter()
                .filter(|r| self.positions.contains_key(&r.target))
                .map(move |r| RelationshipRef::new(&e.name, &r.name))
        })
    }
}
