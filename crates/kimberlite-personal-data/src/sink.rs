//! Transport adapters for finished audit records.
//!
//! Delivery guarantees belong to the transport; a sink only has to accept or
//! reject each record.

use std::sync::{Mutex, PoisonError};

use anyhow::anyhow;
use tracing::info;

use crate::record::{AuditEvent, AuditRecord};

pub trait AuditSink {
    fn log(&self, event: AuditEvent, record: &AuditRecord) -> anyhow::Result<()>;
}

impl<S: AuditSink + ?Sized> AuditSink for &S {
    fn log(&self, event: AuditEvent, record: &AuditRecord) -> anyhow::Result<()> {
        (**self).log(event, record)
    }
}

/// Writes each record as one JSON line through `tracing`.
#[derive(Debug, Clone, Copy, Default)]
pub struct TracingSink;

impl AuditSink for TracingSink {
    fn log(&self, event: AuditEvent, record: &AuditRecord) -> anyhow::Result<()> {
        let json = serde_json::to_string(record)?;
        info!(target: "audit", event = %event, record = %json);
        Ok(())
    }
}

/// Keeps records in memory.
#[derive(Debug, Default)]
pub struct MemorySink {
    records: Mutex<Vec<AuditRecord>>,
}

impl MemorySink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn records(&self) -> Vec<AuditRecord> {
        self.records
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn len(&self) -> usize {
        self.records
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl AuditSink for MemorySink {
    fn log(&self, _event: AuditEvent, record: &AuditRecord) -> anyhow::Result<()> {
        self.records
            .lock()
            .map_err(|_| anyhow!("audit record buffer poisoned"))?
            .push(record.clone());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::record::ObjectRef;
    use chrono::Utc;
    use uuid::Uuid;

    fn record() -> AuditRecord {
        AuditRecord {
            uuid: Uuid::new_v4(),
            time: Utc::now(),
            request: Uuid::nil(),
            event: AuditEvent::SensitiveDataRead,
            data_subject: None,
            object: ObjectRef {
                entity_type: "Customer".into(),
                id: serde_json::Map::new(),
            },
            attributes: Vec::new(),
            attachments: Vec::new(),
        }
    }

    #[test]
    fn memory_sink_collects() {
        let sink = MemorySink::new();
        assert!(sink.is_empty());
        let r = record();
        sink.log(AuditEvent::SensitiveDataRead, &r).expect("accepted");
        assert_eq!(sink.records(), vec![r]);
    }

    #[test]
    fn tracing_sink_accepts() {
        assert!(TracingSink.log(AuditEvent::SensitiveDataRead, &record()).is_ok());
    }
}
