use std::collections::BTreeMap;

use sqlx::sqlite::SqliteRow;
use tokio::sync::mpsc::{self, error::TrySendError};
use tracing::warn;

use repairhub_core::audit::{AuditCategory, AuditEvent, AuditOutcome, AuditSink, TracingAuditSink};
use repairhub_core::domain::quote::QuoteId;
use repairhub_core::domain::request::RepairRequestId;

use super::{column, format_timestamp, parse_timestamp, RepositoryError};
use crate::DbPool;

pub struct SqlAuditRepository {
    pool: DbPool,
}

impl SqlAuditRepository {
    pub fn new(pool: DbPool) -> Self {
        Self { pool }
    }

    pub async fn append(&self, event: &AuditEvent) -> Result<(), RepositoryError> {
        let metadata_json = serde_json::to_string(&event.metadata)
            .map_err(|error| RepositoryError::Encode(format!("audit metadata: {error}")))?;

        sqlx::query(
            "INSERT INTO lifecycle_audit_event (id, request_id, quote_id, correlation_id,
                                                event_type, category, actor, outcome,
                                                metadata_json, occurred_at)
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(&event.event_id)
        .bind(event.request_id.as_ref().map(|id| id.0.as_str()))
        .bind(event.quote_id.as_ref().map(|id| id.0.as_str()))
        .bind(&event.correlation_id)
        .bind(&event.event_type)
        .bind(event.category.as_str())
        .bind(&event.actor)
        .bind(event.outcome.as_str())
        .bind(metadata_json)
        .bind(format_timestamp(&event.occurred_at))
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn list_for_request(
        &self,
        request_id: &RepairRequestId,
    ) -> Result<Vec<AuditEvent>, RepositoryError> {
        let rows = sqlx::query(
            "SELECT id, request_id, quote_id, correlation_id, event_type, category, actor,
                    outcome, metadata_json, occurred_at
             FROM lifecycle_audit_event
             WHERE request_id = ?
             ORDER BY occurred_at ASC, id ASC",
        )
        .bind(&request_id.0)
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(audit_event_from_row).collect()
    }
}

fn audit_event_from_row(row: &SqliteRow) -> Result<AuditEvent, RepositoryError> {
    let category_raw: String = column(row, "category")?;
    let outcome_raw: String = column(row, "outcome")?;
    let metadata_json: String = column(row, "metadata_json")?;
    let metadata: BTreeMap<String, String> = serde_json::from_str(&metadata_json)
        .map_err(|error| RepositoryError::Decode(format!("metadata_json: {error}")))?;
    let request_id: Option<String> = column(row, "request_id")?;
    let quote_id: Option<String> = column(row, "quote_id")?;

    Ok(AuditEvent {
        event_id: column(row, "id")?,
        request_id: request_id.map(RepairRequestId),
        quote_id: quote_id.map(QuoteId),
        correlation_id: column(row, "correlation_id")?,
        event_type: column(row, "event_type")?,
        category: AuditCategory::parse(&category_raw).ok_or_else(|| {
            RepositoryError::Decode(format!("unknown audit category `{category_raw}`"))
        })?,
        actor: column(row, "actor")?,
        outcome: AuditOutcome::parse(&outcome_raw).ok_or_else(|| {
            RepositoryError::Decode(format!("unknown audit outcome `{outcome_raw}`"))
        })?,
        metadata,
        occurred_at: parse_timestamp("occurred_at", column(row, "occurred_at")?)?,
    })
}

/// Logs every audit event and queues it for [`AuditWorker`], which appends it to
/// `lifecycle_audit_event`. A full or closed queue and a failed append are logged and never
/// reach the lifecycle operation.
#[derive(Clone)]
pub struct SqlAuditSink {
    sender: mpsc::Sender<AuditEvent>,
    tracing: TracingAuditSink,
}

pub struct AuditWorker {
    receiver: mpsc::Receiver<AuditEvent>,
    repository: SqlAuditRepository,
}

/// Bounded queue between lifecycle operations and the audit writer.
pub fn audit_channel(pool: DbPool, capacity: usize) -> (SqlAuditSink, AuditWorker) {
    let (sender, receiver) = mpsc::channel(capacity.max(1));
    (
        SqlAuditSink { sender, tracing: TracingAuditSink },
        AuditWorker { receiver, repository: SqlAuditRepository::new(pool) },
    )
}

impl AuditSink for SqlAuditSink {
    fn emit(&self, event: AuditEvent) {
        self.tracing.emit(event.clone());

        match self.sender.try_send(event) {
            Ok(()) => {}
            Err(TrySendError::Full(event)) => warn!(
                event_name = "audit.queue.full",
                correlation_id = %event.correlation_id,
                audit_event = %event.event_type,
                "audit queue full; event not persisted"
            ),
            Err(TrySendError::Closed(event)) => warn!(
                event_name = "audit.queue.closed",
                correlation_id = %event.correlation_id,
                audit_event = %event.event_type,
                "audit worker stopped; event not persisted"
            ),
        }
    }
}

impl AuditWorker {
    /// Appends queued events until every sink handle is dropped. Returns how many were stored.
    pub async fn run(mut self) -> u64 {
        let mut persisted = 0;
        while let Some(event) = self.receiver.recv().await {
            match self.repository.append(&event).await {
                Ok(()) => persisted += 1,
                Err(error) => warn!(
                    event_name = "audit.persist.failed",
                    correlation_id = %event.correlation_id,
                    audit_event = %event.event_type,
                    error = %error,
                    "failed to persist audit event"
                ),
            }
        }
        persisted
    }
}
