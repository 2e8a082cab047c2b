//! Per-request audit session.
//!
//! The host calls the lifecycle hooks in order:
//!
//! ```text
//! read:    after_read
//! create:  after_create
//! update:  before_update -> (write) -> after_update
//! delete:  before_delete -> (write)
//! commit:  finish
//! ```
//!
//! Deletes are classified and resolved *before* the write, while the rows and
//! their links still exist. Creates and updates are classified after it, when
//! generated keys and foreign keys are populated. Nothing reaches the sink
//! before `finish`; dropping the session instead discards everything.

use tracing::{debug, warn};
use uuid::Uuid;

use crate::cache::{CacheEntry, LookupExecutor, ResolutionCache};
use crate::classifier::{Images, Pass};
use crate::delta::{Delta, Row};
use crate::engine::PersonalDataAudit;
use crate::error::{PersonalDataError, Result};
use crate::record::{AuditEvent, AuditRecord, EntrySet, RecordSubject, SubjectId, SubjectRef};
use crate::sink::AuditSink;

/// Outcome of [`AuditSession::finish`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FinishSummary {
    pub emitted: usize,
    /// Entries whose data-subject lookup failed.
    pub withheld: usize,
    pub lookups: usize,
}

#[derive(Debug)]
pub struct AuditSession {
    engine: PersonalDataAudit,
    request: Uuid,
    reads: EntrySet,
    writes: EntrySet,
    images: Images,
    cache: ResolutionCache,
    faults: Vec<PersonalDataError>,
}

impl AuditSession {
    pub(crate) fn new(engine: PersonalDataAudit, request: Uuid) -> Self {
        Self {
            engine,
            request,
            reads: EntrySet::new(),
            writes: EntrySet::new(),
            images: Images::new(),
            cache: ResolutionCache::new(),
            faults: Vec::new(),
        }
    }

    pub fn request(&self) -> Uuid {
        self.request
    }

    pub fn reads(&self) -> &EntrySet {
        &self.reads
    }

    pub fn writes(&self) -> &EntrySet {
        &self.writes
    }

    pub fn cache(&self) -> &ResolutionCache {
        &self.cache
    }

    /// Classification faults so far. Each one cost at most one row.
    pub fn faults(&self) -> &[PersonalDataError] {
        &self.faults
    }

    pub fn after_read(&mut self, entity: &str, rows: &[Row]) {
        let mut pass = Pass {
            entries: &mut self.reads,
            cache: &mut self.cache,
            faults: &mut self.faults,
        };
        self.engine.classifier().classify_rows(entity, rows, &mut pass);
    }

    /// Captures the current images of rows about to be updated, including
    /// expanded composition children.
    pub fn before_update(&mut self, entity: &str, current: &[Row]) {
        let mut pass = Pass {
            entries: &mut self.writes,
            cache: &mut self.cache,
            faults: &mut self.faults,
        };
        self.engine
            .classifier()
            .capture_images(entity, current, &mut self.images, &mut pass);
    }

    pub fn after_create(&mut self, entity: &str, deltas: &[Delta]) {
        self.classify_writes(entity, deltas);
    }

    pub fn after_update(&mut self, entity: &str, deltas: &[Delta]) {
        self.classify_writes(entity, deltas);
    }

    /// Classifies rows about to be deleted without resolving their lookups.
    pub fn classify_delete(&mut self, entity: &str, deltas: &[Delta]) {
        self.classify_writes(entity, deltas);
    }

    /// Classifies rows about to be deleted and resolves the lookups they
    /// need while the rows are still there.
    pub async fn before_delete<E: LookupExecutor>(
        &mut self,
        entity: &str,
        deltas: &[Delta],
        executor: &E,
    ) -> Result<()> {
        self.classify_delete(entity, deltas);
        self.resolve_all(executor).await
    }

    fn classify_writes(&mut self, entity: &str, deltas: &[Delta]) {
        let mut pass = Pass {
            entries: &mut self.writes,
            cache: &mut self.cache,
            faults: &mut self.faults,
        };
        self.engine
            .classifier()
            .classify_deltas(entity, deltas, &self.images, &mut pass);
    }

    /// Executes every pending lookup once.
    pub async fn resolve_all<E: LookupExecutor>(&mut self, executor: &E) -> Result<()> {
        self.cache.resolve_all(executor).await
    }

    /// Resolves what is still pending and hands every non-empty entry to
    /// `sink`.
    ///
    /// Entries whose lookup failed are withheld and the lookup error is
    /// returned after all other entries were emitted. A sink error stops
    /// emission immediately.
    pub async fn finish<E: LookupExecutor, S: AuditSink>(
        mut self,
        executor: &E,
        sink: &S,
    ) -> Result<FinishSummary> {
        let resolution = self.resolve_all(executor).await;

        let mut summary = FinishSummary {
            lookups: self.cache.lookups_executed(),
            ..FinishSummary::default()
        };
        let batches = [
            (AuditEvent::SensitiveDataRead, std::mem::take(&mut self.reads)),
            (AuditEvent::PersonalDataModified, std::mem::take(&mut self.writes)),
        ];
        for (event, entries) in batches {
            for mut entry in entries.into_entries() {
                if entry.attributes.is_empty() {
                    continue;
                }
                let subject = match entry.data_subject.take() {
                    None => None,
                    Some(SubjectRef {
                        entity_type,
                        role,
                        id: SubjectId::Known(id),
                    }) => Some(RecordSubject {
                        entity_type,
                        role,
                        id,
                    }),
                    Some(SubjectRef {
                        entity_type,
                        role,
                        id: SubjectId::Pending { pending },
                    }) => match self.cache.lookup(&pending) {
                        Some(CacheEntry::Resolved(Some(id))) => Some(RecordSubject {
                            entity_type,
                            role,
                            id: id.clone(),
                        }),
                        Some(CacheEntry::Resolved(None)) => None,
                        _ => {
                            warn!(
                                entity = %entry.object.entity_type,
                                role = %pending,
                                "withholding audit entry without data subject"
                            );
                            summary.withheld += 1;
                            continue;
                        }
                    },
                };
                let record = AuditRecord::new(self.request, event, entry, subject);
                sink.log(event, &record)
                    .map_err(PersonalDataError::Transport)?;
                summary.emitted += 1;
            }
        }

        debug!(
            request = %self.request,
            emitted = summary.emitted,
            withheld = summary.withheld,
            lookups = summary.lookups,
            "audit session finished"
        );
        resolution.map(|()| summary)
    }
}
