//! Orchestrator records: one master per user, one per user and folder.

use std::sync::Arc;

use chrono::Utc;
use serde_json::json;
use tracing::info;
use uuid::Uuid;

use crate::audit::{AuditLog, AuditRecord};
use crate::error::{OrchestrationError, OrchestrationResult};
use crate::store::RecordStore;
use crate::types::{Orchestrator, OrchestratorPolicy, OrchestratorScope, OrchestratorStatus};

/// Policy applied to newly created orchestrators.
#[derive(Clone, Debug)]
pub struct PolicyDefaults {
    pub monitoring_interval_sec: u64,
    pub stall_threshold_sec: u64,
    pub auto_intervention: bool,
}

impl Default for PolicyDefaults {
    fn default() -> Self {
        Self {
            monitoring_interval_sec: 10,
            stall_threshold_sec: 300,
            auto_intervention: false,
        }
    }
}

#[derive(Clone)]
pub struct OrchestratorRegistry {
    store: Arc<dyn RecordStore>,
    audit: AuditLog,
    defaults: PolicyDefaults,
}

impl OrchestratorRegistry {
    pub fn new(store: Arc<dyn RecordStore>, audit: AuditLog, defaults: PolicyDefaults) -> Self {
        Self {
            store,
            audit,
            defaults,
        }
    }

    pub async fn create_master(&self, user_id: &str) -> OrchestrationResult<Orchestrator> {
        self.create(user_id, OrchestratorScope::Master).await
    }

    pub async fn create_scoped(
        &self,
        user_id: &str,
        folder: &str,
    ) -> OrchestrationResult<Orchestrator> {
        if folder.trim().is_empty() {
            return Err(OrchestrationError::Validation(
                "folder scope must not be empty".to_string(),
            ));
        }
        self.create(user_id, OrchestratorScope::Folder(folder.trim().to_string()))
            .await
    }

    async fn create(
        &self,
        user_id: &str,
        scope: OrchestratorScope,
    ) -> OrchestrationResult<Orchestrator> {
        if user_id.trim().is_empty() {
            return Err(OrchestrationError::Validation(
                "orchestrator needs a user".to_string(),
            ));
        }
        let orchestrator = Orchestrator {
            id: Uuid::new_v4().to_string(),
            user_id: user_id.to_string(),
            scope,
            status: OrchestratorStatus::Idle,
            monitoring_interval_sec: self.defaults.monitoring_interval_sec,
            stall_threshold_sec: self.defaults.stall_threshold_sec,
            auto_intervention: self.defaults.auto_intervention,
            created_at: Utc::now(),
        };
        self.store.insert_orchestrator(orchestrator.clone()).await?;
        self.audit
            .record(
                AuditRecord::new("orchestrator.created", user_id)
                    .orchestrator(&orchestrator.id)
                    .detail(json!({ "scope": orchestrator.scope })),
            )
            .await?;
        info!(orchestrator_id = %orchestrator.id, scope = %orchestrator.scope, "Orchestrator created");
        Ok(orchestrator)
    }

    /// The user's master orchestrator, created on first use.
    pub async fn ensure_master(&self, user_id: &str) -> OrchestrationResult<Orchestrator> {
        let existing = self
            .store
            .list_orchestrators(user_id)
            .await?
            .into_iter()
            .find(|o| o.scope == OrchestratorScope::Master);
        match existing {
            Some(master) => Ok(master),
            None => self.create_master(user_id).await,
        }
    }

    pub async fn get(&self, id: &str) -> OrchestrationResult<Orchestrator> {
        self.store
            .get_orchestrator(id)
            .await?
            .ok_or_else(|| OrchestrationError::not_found("orchestrator", id))
    }

    pub async fn list_for_user(&self, user_id: &str) -> OrchestrationResult<Vec<Orchestrator>> {
        self.store.list_orchestrators(user_id).await
    }

    pub async fn set_status(
        &self,
        id: &str,
        status: OrchestratorStatus,
        actor: &str,
    ) -> OrchestrationResult<Orchestrator> {
        let mut orchestrator = self.get(id).await?;
        if orchestrator.status == status {
            return Ok(orchestrator);
        }
        let from = orchestrator.status;
        orchestrator.status = status;
        self.store.update_orchestrator(orchestrator.clone()).await?;
        self.audit
            .record(
                AuditRecord::new("orchestrator.status", actor)
                    .orchestrator(id)
                    .detail(json!({ "from": from, "to": status })),
            )
            .await?;
        Ok(orchestrator)
    }

    pub async fn update_policy(
        &self,
        id: &str,
        policy: &OrchestratorPolicy,
        actor: &str,
    ) -> OrchestrationResult<Orchestrator> {
        if policy.monitoring_interval_sec == Some(0) || policy.stall_threshold_sec == Some(0) {
            return Err(OrchestrationError::Validation(
                "intervals must be at least one second".to_string(),
            ));
        }
        let mut orchestrator = self.get(id).await?;
        if let Some(interval) = policy.monitoring_interval_sec {
            orchestrator.monitoring_interval_sec = interval;
        }
        if let Some(threshold) = policy.stall_threshold_sec {
            orchestrator.stall_threshold_sec = threshold;
        }
        if let Some(auto) = policy.auto_intervention {
            orchestrator.auto_intervention = auto;
        }
        self.store.update_orchestrator(orchestrator.clone()).await?;
        self.audit
            .record(
                AuditRecord::new("orchestrator.policy", actor)
                    .orchestrator(id)
                    .detail(serde_json::to_value(policy).unwrap_or_default()),
            )
            .await?;
        Ok(orchestrator)
    }
}
