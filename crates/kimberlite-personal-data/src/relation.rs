//! Relationship Algebra.
//!
//! Turns a stored relationship into an aliased boolean condition between the
//! declaring side (`select_alias`) and the related side (`join_alias`).
//!
//! - Foreign keys expand to `select.local = join.target` conjunctions.
//! - `<rel>.<backlink> = $self` is replaced by the backlink's own condition
//!   with the aliases swapped, recursively.
//! - Paths starting with the relationship name get the join alias; all other
//!   bare fields are qualified with the select alias last, which is
//!   idempotent and never touches pseudo variables.

use std::collections::HashSet;

use kimberlite_query::{ColumnRef, CompareOp, Expr, PseudoVar, Value};

use crate::error::SchemaFault;
use crate::index::{RelationshipIndex, RelationshipRef};
use crate::schema::{Condition, Operand, Relationship};

type Result<T> = std::result::Result<T, SchemaFault>;

/// Builds the aliased join condition for `relationship`.
pub fn on_condition(
    index: &RelationshipIndex,
    relationship: &RelationshipRef,
    select_alias: &str,
    join_alias: &str,
) -> Result<Expr> {
    let mut expanding = HashSet::new();
    expand(index, relationship, select_alias, join_alias, &mut expanding)
}

fn expand(
    index: &RelationshipIndex,
    r: &RelationshipRef,
    select_alias: &str,
    join_alias: &str,
    expanding: &mut HashSet<RelationshipRef>,
) -> Result<Expr> {
    let relationship = index
        .relationship(r)
        .ok_or_else(|| SchemaFault::UnknownRelationship {
            entity: r.entity.clone(),
            relationship: r.name.clone(),
        })?;

    if !expanding.insert(r.clone()) {
        return Err(unsupported(r, "backlink cycle"));
    }

    let expr = match &relationship.on {
        Some(condition) => {
            let ctx = Translation {
                index,
                r,
                relationship,
                select_alias,
                join_alias,
            };
            ctx.condition(condition, expanding)?
                .qualify_unqualified(select_alias)
        }
        None if relationship.foreign_keys.is_empty() => {
            return Err(unsupported(r, "no foreign keys and no condition"));
        }
        None => Expr::and(relationship.foreign_keys.iter().map(|fk| {
            Expr::eq(
                Expr::column(ColumnRef::qualified(select_alias, &fk.local)),
                Expr::column(ColumnRef::qualified(join_alias, &fk.target)),
            )
        })),
    };

    expanding.remove(r);
    Ok(expr)
}

fn unsupported(r: &RelationshipRef, reason: &str) -> SchemaFault {
    SchemaFault::UnsupportedCondition {
        entity: r.entity.clone(),
        relationship: r.name.clone(),
        reason: reason.to_string(),
    }
}

struct Translation<'a> {
    index: &'a RelationshipIndex,
    r: &'a RelationshipRef,
    relationship: &'a Relationship,
    select_alias: &'a str,
    join_alias: &'a str,
}

impl Translation<'_> {
    fn condition(
        &self,
        condition: &Condition,
        expanding: &mut HashSet<RelationshipRef>,
    ) -> Result<Expr> {
        Ok(match condition {
            Condition::Compare { left, op, right } => {
                match (left, right) {
                    (Operand::Field(path), Operand::SelfRef)
                    | (Operand::SelfRef, Operand::Field(path)) => {
                        if *op != CompareOp::Eq {
                            return Err(unsupported(self.r, "$self compared with non-equality"));
                        }
                        return self.backlink(path, expanding);
                    }
                    _ => {}
                }
                Expr::compare(self.operand(left)?, *op, self.operand(right)?)
            }
            Condition::IsNull(operand) => Expr::IsNull(Box::new(self.operand(operand)?)),
            Condition::IsNotNull(operand) => Expr::IsNotNull(Box::new(self.operand(operand)?)),
            Condition::And(operands) => Expr::and(
                operands
                    .iter()
                    .map(|c| self.condition(c, expanding))
                    .collect::<Result<Vec<_>>>()?,
            ),
            Condition::Or(operands) => Expr::or(
                operands
                    .iter()
                    .map(|c| self.condition(c, expanding))
                    .collect::<Result<Vec<_>>>()?,
            ),
            Condition::Not(inner) => Expr::Not(Box::new(self.condition(inner, expanding)?)),
        })
    }

    /// `<rel>.<backlink> = $self`: the related entity's `backlink` points back
    /// at the declaring entity, so its condition applies with the roles of
    /// the two aliases swapped.
    fn backlink(&self, path: &[String], expanding: &mut HashSet<RelationshipRef>) -> Result<Expr> {
        let [head, backlink] = path else {
            return Err(unsupported(self.r, "$self must be compared with <relationship>.<backlink>"));
        };
        if *head != self.relationship.name {
            return Err(unsupported(self.r, "$self backlink must start at the relationship"));
        }
        let backlink = RelationshipRef::new(&self.relationship.target, backlink);
        if self.index.relationship(&backlink).is_none() {
            return Err(SchemaFault::UnknownRelationship {
                entity: backlink.entity,
                relationship: backlink.name,
            });
        }
        expand(
            self.index,
            &backlink,
            self.join_alias,
            self.select_alias,
            expanding,
        )
    }

    fn operand(&self, operand: &Operand) -> Result<Expr> {
        match operand {
            Operand::Field(path) => Ok(Expr::column(self.column(path)?)),
            Operand::Literal(value) => Ok(Expr::Literal(Value::from_json(value))),
            Operand::Pseudo(name) => PseudoVar::from_name(name)
                .map(Expr::Pseudo)
                .ok_or_else(|| unsupported(self.r, "pseudo variable without `$`")),
            Operand::SelfRef => Err(unsupported(self.r, "bare $self outside a backlink")),
        }
    }

    fn column(&self, path: &[String]) -> Result<ColumnRef> {
        match path {
            [] => Err(unsupported(self.r, "empty field path")),
            [head, rest @ ..] if !rest.is_empty() && *head == self.relationship.name => {
                Ok(ColumnRef::qualified(self.join_alias, rest.join("_")))
            }
            [head, rest @ ..] if !rest.is_empty() && head == "$self" => {
                Ok(ColumnRef::qualified(self.select_alias, rest.join("_")))
            }
            // Left bare; qualified with the select alias once the whole
            // condition is built.
            _ => Ok(ColumnRef::new(path.join("_"))),
        }
    }
}
