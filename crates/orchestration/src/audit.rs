//! Append-only audit entries and insights.
//!
//! Entries go to the record store and, when configured, to the hash-chained
//! journal. A journal write failure is logged and never fails the caller.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde_json::Value;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::error::OrchestrationResult;
use crate::journal::Journal;
use crate::store::RecordStore;
use crate::types::{AuditEntry, Insight, InsightKind, Severity};

/// Builder for one audit entry.
#[derive(Clone, Debug)]
pub struct AuditRecord {
    action: String,
    actor: String,
    orchestrator_id: Option<String>,
    task_id: Option<String>,
    delegation_id: Option<String>,
    session_id: Option<String>,
    detail: Value,
}

impl AuditRecord {
    pub fn new(action: impl Into<String>, actor: impl Into<String>) -> Self {
        Self {
            action: action.into(),
            actor: actor.into(),
            orchestrator_id: None,
            task_id: None,
            delegation_id: None,
            session_id: None,
            detail: Value::Null,
        }
    }

    pub fn orchestrator(mut self, id: impl Into<String>) -> Self {
        self.orchestrator_id = Some(id.into());
        self
    }

    pub fn task(mut self, id: impl Into<String>) -> Self {
        self.task_id = Some(id.into());
        self
    }

    pub fn delegation(mut self, id: impl Into<String>) -> Self {
        self.delegation_id = Some(id.into());
        self
    }

    pub fn session(mut self, id: impl Into<String>) -> Self {
        let id = id.into();
        if !id.is_empty() {
            self.session_id = Some(id);
        }
        self
    }

    pub fn detail(mut self, detail: Value) -> Self {
        self.detail = detail;
        self
    }
}

/// New insight content; ids and timestamps are assigned on record.
#[derive(Clone, Debug)]
pub struct NewInsight {
    pub orchestrator_id: String,
    pub task_id: Option<String>,
    pub session_id: Option<String>,
    pub delegation_id: Option<String>,
    pub kind: InsightKind,
    pub severity: Severity,
    pub title: String,
    pub detail: String,
}

#[derive(Clone)]
pub struct AuditLog {
    store: Arc<dyn RecordStore>,
    journal: Option<Arc<Journal>>,
}

impl AuditLog {
    pub fn new(store: Arc<dyn RecordStore>) -> Self {
        Self {
            store,
            journal: None,
        }
    }

    pub fn with_journal(mut self, journal: Arc<Journal>) -> Self {
        self.journal = Some(journal);
        self
    }

    pub async fn record(&self, record: AuditRecord) -> OrchestrationResult<AuditEntry> {
        self.record_at(record, Utc::now()).await
    }

    pub async fn record_at(
        &self,
        record: AuditRecord,
        at: DateTime<Utc>,
    ) -> OrchestrationResult<AuditEntry> {
        let entry = AuditEntry {
            id: Uuid::new_v4().to_string(),
            orchestrator_id: record.orchestrator_id,
            action: record.action,
            actor: record.actor,
            task_id: record.task_id,
            delegation_id: record.delegation_id,
            session_id: record.session_id,
            detail: record.detail,
            created_at: at,
        };

        self.store.append_audit(entry.clone()).await?;
        if let Some(journal) = &self.journal {
            if let Err(err) = journal.append(&entry) {
                warn!(action = %entry.action, "Failed to append audit journal: {}", err);
            }
        }
        debug!(
            action = %entry.action,
            actor = %entry.actor,
            task_id = ?entry.task_id,
            delegation_id = ?entry.delegation_id,
            "Audit entry recorded"
        );
        Ok(entry)
    }

    /// Store an insight and write an `insight.recorded` audit entry.
    pub async fn record_insight(
        &self,
        insight: NewInsight,
        at: DateTime<Utc>,
    ) -> OrchestrationResult<Insight> {
        let insight = Insight {
            id: Uuid::new_v4().to_string(),
            orchestrator_id: insight.orchestrator_id,
            task_id: insight.task_id,
            session_id: insight.session_id,
            delegation_id: insight.delegation_id,
            kind: insight.kind,
            severity: insight.severity,
            title: insight.title,
            detail: insight.detail,
            resolved: false,
            resolved_at: None,
            created_at: at,
        };
        self.store.insert_insight(insight.clone()).await?;

        let mut audit = AuditRecord::new("insight.recorded", "orchestrator")
            .orchestrator(&insight.orchestrator_id)
            .detail(serde_json::json!({
                "insight_id": insight.id,
                "kind": insight.kind,
                "severity": insight.severity,
                "title": insight.title,
            }));
        if let Some(task_id) = &insight.task_id {
            audit = audit.task(task_id);
        }
        if let Some(delegation_id) = &insight.delegation_id {
            audit = audit.delegation(delegation_id);
        }
        self.record_at(audit, at).await?;
        Ok(insight)
    }

    /// Mark an insight resolved. Idempotent; unknown ids are `NotFound`.
    pub async fn resolve_insight(&self, id: &str, actor: &str) -> OrchestrationResult<Insight> {
        let before = self.store.get_insight(id).await?;
        let insight = self.store.resolve_insight(id, Utc::now()).await?;
        if before.map_or(false, |b| !b.resolved) {
            let mut audit = AuditRecord::new("insight.resolved", actor)
                .orchestrator(&insight.orchestrator_id)
                .detail(serde_json::json!({ "insight_id": insight.id }));
            if let Some(task_id) = &insight.task_id {
                audit = audit.task(task_id);
            }
            self.record(audit).await?;
        }
        Ok(insight)
    }

    pub async fn entries(&self, task_id: Option<&str>) -> OrchestrationResult<Vec<AuditEntry>> {
        self.store.list_audit(task_id).await
    }

    pub async fn insights(&self, orchestrator_id: Option<&str>) -> OrchestrationResult<Vec<Insight>> {
        self.store.list_insights(orchestrator_id).await
    }
}
