//! Data-Subject Resolution Engine.
//!
//! Finds, for an entity type carrying personal data, the nearest entity type
//! with `DataSubject` semantics and the join path to it.
//!
//! Two traversal directions:
//!
//! - **Up** follows relationships pointing *into* the current entity ("who
//!   references me"), e.g. `Address` -> `Customer` via `Customer.addresses`.
//! - **Down** follows the current entity's own relationships, e.g.
//!   `Order` -> `Customer` via `Order.customer`.
//!
//! Every search keeps a per-root, per-direction visited map keyed by
//! relationship. A relationship is only re-entered at a strictly smaller
//! depth, so any cyclic graph terminates.

use std::collections::HashMap;
use std::fmt::{self, Display};
use std::sync::{Arc, OnceLock};

use serde::Serialize;
use tracing::{debug, warn};

use crate::index::{RelationshipIndex, RelationshipRef};
use crate::schema::EntitySemantics;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Direction {
    Up,
    Down,
}

/// One hop of a join path: from `entity` to `next` over `relationship`.
///
/// For `Down` steps the relationship is declared on `entity`; for `Up` steps
/// it is declared on `next` and traversed backwards.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize)]
pub struct PathStep {
    pub entity: String,
    pub relationship: RelationshipRef,
    pub direction: Direction,
    pub next: String,
}

/// Ordered steps from the source entity to a data-subject entity.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, Serialize)]
pub struct JoinPath {
    pub steps: Vec<PathStep>,
}

impl JoinPath {
    /// Number of hops; equals the `EXISTS` nesting of the lookup query.
    pub fn depth(&self) -> usize {
        self.steps.len()
    }

    /// The entity the path ends at, if it has any step.
    pub fn end(&self) -> Option<&str> {
        self.steps.last().map(|s| s.next.as_str())
    }
}

impl Display for JoinPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let Some(first) = self.steps.first() else {
            return write!(f, "(self)");
        };
        write!(f, "{}", first.entity)?;
        for step in &self.steps {
            let arrow = match step.direction {
                Direction::Up => "<-",
                Direction::Down => "->",
            };
            write!(f, " {arrow}[{}] {}", step.relationship, step.next)?;
        }
        Ok(())
    }
}

/// Result of resolving one entity type.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SubjectResolution {
    /// The entity type being resolved.
    pub source: String,
    /// The data-subject entity type.
    pub subject: String,
    pub role: String,
    /// All shortest paths to `subject`. Several paths are OR-combined by the
    /// lookup query.
    pub paths: Vec<JoinPath>,
    pub depth: usize,
}

/// A data-subject search strategy.
pub trait SubjectSearch: Send + Sync + fmt::Debug {
    fn search(&self, index: &RelationshipIndex, entity: &str) -> Option<SubjectResolution>;
}

fn is_subject(index: &RelationshipIndex, entity: &str) -> bool {
    index
        .entity(entity)
        .is_some_and(|e| e.semantics == EntitySemantics::DataSubject)
}

fn resolution(
    index: &RelationshipIndex,
    source: &str,
    subject: &str,
    paths: Vec<JoinPath>,
) -> Option<SubjectResolution> {
    let role = index.entity(subject)?.subject_role()?.into_owned();
    let depth = paths.first().map_or(0, JoinPath::depth);
    Some(SubjectResolution {
        source: source.to_string(),
        subject: subject.to_string(),
        role,
        paths,
        depth,
    })
}

/// Steps available from `entity` in `direction`.
fn neighbours(index: &RelationshipIndex, entity: &str, direction: Direction) -> Vec<PathStep> {
    match direction {
        Direction::Up => index
            .incoming(entity)
            .iter()
            .map(|r| PathStep {
                entity: entity.to_string(),
                relationship: r.clone(),
                direction,
                next: r.entity.clone(),
            })
            .collect(),
        Direction::Down => index
            .outgoing(entity)
            .filter_map(|r| {
                let next = index.relationship(&r)?.target.clone();
                Some(PathStep {
                    entity: entity.to_string(),
                    relationship: r,
                    direction,
                    next,
                })
            })
            .collect(),
    }
}

/// Search state for one root and one direction.
struct Walk<'a> {
    index: &'a RelationshipIndex,
    direction: Direction,
    /// Smallest depth at which each relationship was entered.
    visited: HashMap<RelationshipRef, usize>,
    found: Vec<JoinPath>,
    /// Stop after the first match.
    greedy: bool,
}

impl<'a> Walk<'a> {
    fn new(index: &'a RelationshipIndex, direction: Direction, greedy: bool) -> Self {
        Self {
            index,
            direction,
            visited: HashMap::new(),
            found: Vec::new(),
            greedy,
        }
    }

    fn best_depth(&self) -> Option<usize> {
        self.found.iter().map(JoinPath::depth).min()
    }

    fn done(&self) -> bool {
        self.greedy && !self.found.is_empty()
    }

    /// Marks `step` as entered at `depth`. False if it was already entered
    /// at a smaller depth. An exhaustive walk re-enters at an equal depth so
    /// that equally short paths sharing a tail are all found; depth grows
    /// along a path, so no path repeats a relationship.
    fn enter(&mut self, step: &PathStep, depth: usize) -> bool {
        match self.visited.get(&step.relationship) {
            Some(&seen) if seen < depth || (self.greedy && seen == depth) => false,
            _ => {
                self.visited.insert(step.relationship.clone(), depth);
                true
            }
        }
    }

    fn record(&mut self, path: &[PathStep]) {
        self.found.push(JoinPath {
            steps: path.to_vec(),
        });
    }

    /// Depth-first: follow each neighbour to the end before trying the next.
    fn depth_first(&mut self, entity: &str, path: &mut Vec<PathStep>) {
        for step in neighbours(self.index, entity, self.direction) {
            if self.done() {
                return;
            }
            let depth = path.len() + 1;
            if self.best_depth().is_some_and(|best| depth > best) || !self.enter(&step, depth) {
                continue;
            }
            let next = step.next.clone();
            path.push(step);
            if is_subject(self.index, &next) {
                self.record(path);
            } else {
                self.depth_first(&next, path);
            }
            path.pop();
        }
    }

    /// Breadth-preferring: record every immediate data-subject neighbour
    /// first; only descend when there is none.
    fn breadth_first(&mut self, entity: &str, path: &mut Vec<PathStep>) {
        let depth = path.len() + 1;
        if self.best_depth().is_some_and(|best| depth > best) {
            return;
        }
        let steps = neighbours(self.index, entity, self.direction);

        let mut matched = false;
        for step in &steps {
            if is_subject(self.index, &step.next) && self.enter(step, depth) {
                path.push(step.clone());
                self.record(path);
                path.pop();
                matched = true;
                if self.done() {
                    return;
                }
            }
        }
        if matched {
            return;
        }

        for step in steps {
            if self.done() {
                return;
            }
            if !self.enter(&step, depth) {
                continue;
            }
            let next = step.next.clone();
            path.push(step);
            self.breadth_first(&next, path);
            path.pop();
        }
    }

    fn run(mut self, entity: &str) -> Vec<JoinPath> {
        let mut path = Vec::new();
        match self.direction {
            Direction::Up => self.depth_first(entity, &mut path),
            Direction::Down => self.breadth_first(entity, &mut path),
        }
        self.found
    }
}

/// Runs both directions and keeps the shortest paths.
///
/// On a depth tie the entity found first (Up before Down) wins, and every
/// path of that depth ending at that entity is kept.
#[derive(Debug, Clone, Copy, Default)]
pub struct ExhaustiveSearch;

impl SubjectSearch for ExhaustiveSearch {
    fn search(&self, index: &RelationshipIndex, entity: &str) -> Option<SubjectResolution> {
        if is_subject(index, entity) {
            return resolution(index, entity, entity, vec![JoinPath::default()]);
        }
        let up = Walk::new(index, Direction::Up, false).run(entity);
        let down = Walk::new(index, Direction::Down, false).run(entity);

        let best = up.iter().chain(&down).map(JoinPath::depth).min()?;
        let mut shortest = up.into_iter().chain(down).filter(|p| p.depth() == best);
        let first = shortest.next()?;
        let subject = first.end()?.to_string();

        let mut paths = vec![first];
        for path in shortest {
            if path.end() == Some(subject.as_str()) && !paths.contains(&path) {
                paths.push(path);
            }
        }
        resolution(index, entity, &subject, paths)
    }
}

/// Stops at the first match, Up before Down, without comparing depths.
#[derive(Debug, Clone, Copy, Default)]
pub struct GreedySearch;

impl SubjectSearch for GreedySearch {
    fn search(&self, index: &RelationshipIndex, entity: &str) -> Option<SubjectResolution> {
        if is_subject(index, entity) {
            return resolution(index, entity, entity, vec![JoinPath::default()]);
        }
        let path = Walk::new(index, Direction::Up, true)
            .run(entity)
            .into_iter()
            .next()
            .or_else(|| {
                Walk::new(index, Direction::Down, true)
                    .run(entity)
                    .into_iter()
                    .next()
            })?;
        let subject = path.end()?.to_string();
        resolution(index, entity, &subject, vec![path])
    }
}

/// Memoizes one search result per entity type.
#[derive(Debug)]
pub struct SubjectResolver {
    index: Arc<RelationshipIndex>,
    strategy: Box<dyn SubjectSearch>,
    slots: Vec<OnceLock<Option<Arc<SubjectResolution>>>>,
}

impl SubjectResolver {
    pub fn new(index: Arc<RelationshipIndex>, strategy: Box<dyn SubjectSearch>) -> Self {
        let slots = (0..index.len()).map(|_| OnceLock::new()).collect();
        Self {
            index,
            strategy,
            slots,
        }
    }

    /// The data subject of `entity`, or `None` if no data-subject entity is
    /// reachable in either direction.
    pub fn resolve(&self, entity: &str) -> Option<Arc<SubjectResolution>> {
        let Some(i) = self.index.position(entity) else {
            warn!(entity = %entity, "cannot resolve data subject of unknown entity type");
            return None;
        };
        self.slots[i]
            .get_or_init(|| {
                let resolved = self.strategy.search(&self.index, entity);
                match &resolved {
                    Some(r) => debug!(
                        entity = %entity,
                        subject = %r.subject,
                        role = %r.role,
                        depth = r.depth,
                        paths = r.paths.len(),
                        "resolved data subject"
                    ),
                    None => warn!(entity = %entity, "no data subject reachable"),
                }
                resolved.map(Arc::new)
            })
            .clone()
    }
}
