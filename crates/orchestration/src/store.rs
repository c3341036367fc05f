//! Record store seam and an in-memory implementation.
//!
//! Updates are compare-and-set on the record's status: a writer names the
//! status it read, and the write is rejected when another writer moved the
//! record in between. The store also owns the uniqueness rules (one master
//! orchestrator per user, one scoped orchestrator per user and folder, one
//! non-terminal delegation per task).

use std::collections::HashMap;
use std::sync::Mutex;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::error::{OrchestrationError, OrchestrationResult};
use crate::types::{
    AuditEntry, Delegation, DelegationStatus, Insight, Orchestrator, OrchestratorScope, Task,
    TaskFilter, TaskStatus,
};

#[async_trait]
pub trait RecordStore: Send + Sync {
    async fn insert_task(&self, task: Task) -> OrchestrationResult<()>;
    async fn get_task(&self, id: &str) -> OrchestrationResult<Option<Task>>;
    async fn list_tasks(&self, filter: &TaskFilter) -> OrchestrationResult<Vec<Task>>;
    /// Replace the task if its stored status is still `expected`.
    async fn update_task(&self, task: Task, expected: TaskStatus) -> OrchestrationResult<()>;

    /// Fails with `ActiveDelegationExists` when the task has a non-terminal delegation.
    async fn insert_delegation(&self, delegation: Delegation) -> OrchestrationResult<()>;
    async fn get_delegation(&self, id: &str) -> OrchestrationResult<Option<Delegation>>;
    async fn active_delegation(&self, task_id: &str) -> OrchestrationResult<Option<Delegation>>;
    async fn list_active_delegations(&self) -> OrchestrationResult<Vec<Delegation>>;
    async fn list_delegations(&self, task_id: &str) -> OrchestrationResult<Vec<Delegation>>;
    /// Replace the delegation if its stored status is still `expected`.
    async fn update_delegation(
        &self,
        delegation: Delegation,
        expected: DelegationStatus,
    ) -> OrchestrationResult<()>;

    async fn insert_orchestrator(&self, orchestrator: Orchestrator) -> OrchestrationResult<()>;
    async fn get_orchestrator(&self, id: &str) -> OrchestrationResult<Option<Orchestrator>>;
    async fn list_orchestrators(&self, user_id: &str) -> OrchestrationResult<Vec<Orchestrator>>;
    async fn update_orchestrator(&self, orchestrator: Orchestrator) -> OrchestrationResult<()>;

    async fn append_audit(&self, entry: AuditEntry) -> OrchestrationResult<()>;
    async fn list_audit(&self, task_id: Option<&str>) -> OrchestrationResult<Vec<AuditEntry>>;

    async fn insert_insight(&self, insight: Insight) -> OrchestrationResult<()>;
    async fn get_insight(&self, id: &str) -> OrchestrationResult<Option<Insight>>;
    async fn list_insights(
        &self,
        orchestrator_id: Option<&str>,
    ) -> OrchestrationResult<Vec<Insight>>;
    /// Flip `resolved`; already-resolved insights are returned unchanged.
    async fn resolve_insight(&self, id: &str, at: DateTime<Utc>) -> OrchestrationResult<Insight>;
}

#[derive(Default)]
struct MemoryState {
    tasks: HashMap<String, Task>,
    delegations: HashMap<String, Delegation>,
    orchestrators: HashMap<String, Orchestrator>,
    audit: Vec<AuditEntry>,
    insights: Vec<Insight>,
}

#[derive(Default)]
pub struct MemoryStore {
    state: Mutex<MemoryState>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> OrchestrationResult<std::sync::MutexGuard<'_, MemoryState>> {
        self.state
            .lock()
            .map_err(|_| OrchestrationError::Store("record store poisoned".to_string()))
    }
}

fn active_for(state: &MemoryState, task_id: &str) -> Option<Delegation> {
    state
        .delegations
        .values()
        .filter(|d| d.task_id == task_id && !d.status.is_terminal())
        .max_by_key(|d| d.created_at)
        .cloned()
}

#[async_trait]
impl RecordStore for MemoryStore {
    async fn insert_task(&self, task: Task) -> OrchestrationResult<()> {
        let mut state = self.lock()?;
        if state.tasks.contains_key(&task.id) {
            return Err(OrchestrationError::Conflict(format!(
                "task {} already exists",
                task.id
            )));
        }
        state.tasks.insert(task.id.clone(), task);
        Ok(())
    }

    async fn get_task(&self, id: &str) -> OrchestrationResult<Option<Task>> {
        Ok(self.lock()?.tasks.get(id).cloned())
    }

    async fn list_tasks(&self, filter: &TaskFilter) -> OrchestrationResult<Vec<Task>> {
        let state = self.lock()?;
        let mut tasks: Vec<Task> = state
            .tasks
            .values()
            .filter(|task| filter.matches(task))
            .cloned()
            .collect();
        tasks.sort_by(|a, b| a.created_at.cmp(&b.created_at).then(a.id.cmp(&b.id)));
        Ok(tasks)
    }

    async fn update_task(&self, task: Task, expected: TaskStatus) -> OrchestrationResult<()> {
        let mut state = self.lock()?;
        let current = state
            .tasks
            .get(&task.id)
            .ok_or_else(|| OrchestrationError::not_found("task", &task.id))?;
        if current.status != expected {
            return Err(OrchestrationError::Conflict(format!(
                "task {} is {}, expected {}",
                task.id, current.status, expected
            )));
        }
        state.tasks.insert(task.id.clone(), task);
        Ok(())
    }

    async fn insert_delegation(&self, delegation: Delegation) -> OrchestrationResult<()> {
        let mut state = self.lock()?;
        if !state.tasks.contains_key(&delegation.task_id) {
            return Err(OrchestrationError::not_found("task", &delegation.task_id));
        }
        if let Some(active) = active_for(&state, &delegation.task_id) {
            return Err(OrchestrationError::ActiveDelegationExists {
                task_id: delegation.task_id.clone(),
                delegation_id: active.id,
            });
        }
        state.delegations.insert(delegation.id.clone(), delegation);
        Ok(())
    }

    async fn get_delegation(&self, id: &str) -> OrchestrationResult<Option<Delegation>> {
        Ok(self.lock()?.delegations.get(id).cloned())
    }

    async fn active_delegation(&self, task_id: &str) -> OrchestrationResult<Option<Delegation>> {
        Ok(active_for(&*self.lock()?, task_id))
    }

    async fn list_active_delegations(&self) -> OrchestrationResult<Vec<Delegation>> {
        let state = self.lock()?;
        let mut active: Vec<Delegation> = state
            .delegations
            .values()
            .filter(|d| !d.status.is_terminal())
            .cloned()
            .collect();
        active.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        Ok(active)
    }

    async fn list_delegations(&self, task_id: &str) -> OrchestrationResult<Vec<Delegation>> {
        let state = self.lock()?;
        let mut delegations: Vec<Delegation> = state
            .delegations
            .values()
            .filter(|d| d.task_id == task_id)
            .cloned()
            .collect();
        delegations.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        Ok(delegations)
    }

    async fn update_delegation(
        &self,
        delegation: Delegation,
        expected: DelegationStatus,
    ) -> OrchestrationResult<()> {
        let mut state = self.lock()?;
        let current = state
            .delegations
            .get(&delegation.id)
            .ok_or_else(|| OrchestrationError::not_found("delegation", &delegation.id))?;
        if current.status != expected {
            return Err(OrchestrationError::Conflict(format!(
                "delegation {} is {}, expected {}",
                delegation.id, current.status, expected
            )));
        }
        state.delegations.insert(delegation.id.clone(), delegation);
        Ok(())
    }

    async fn insert_orchestrator(&self, orchestrator: Orchestrator) -> OrchestrationResult<()> {
        let mut state = self.lock()?;
        let clash = state.orchestrators.values().find(|existing| {
            existing.user_id == orchestrator.user_id && existing.scope == orchestrator.scope
        });
        if let Some(existing) = clash {
            let what = match &orchestrator.scope {
                OrchestratorScope::Master => "master orchestrator".to_string(),
                OrchestratorScope::Folder(folder) => {
                    format!("orchestrator for folder '{}'", folder)
                }
            };
            return Err(OrchestrationError::Conflict(format!(
                "user {} already has a {} ({})",
                orchestrator.user_id, what, existing.id
            )));
        }
        state
            .orchestrators
            .insert(orchestrator.id.clone(), orchestrator);
        Ok(())
    }

    async fn get_orchestrator(&self, id: &str) -> OrchestrationResult<Option<Orchestrator>> {
        Ok(self.lock()?.orchestrators.get(id).cloned())
    }

    async fn list_orchestrators(&self, user_id: &str) -> OrchestrationResult<Vec<Orchestrator>> {
        let state = self.lock()?;
        let mut list: Vec<Orchestrator> = state
            .orchestrators
            .values()
            .filter(|o| o.user_id == user_id)
            .cloned()
            .collect();
        list.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        Ok(list)
    }

    async fn update_orchestrator(&self, orchestrator: Orchestrator) -> OrchestrationResult<()> {
        let mut state = self.lock()?;
        let current = state
            .orchestrators
            .get(&orchestrator.id)
            .ok_or_else(|| OrchestrationError::not_found("orchestrator", &orchestrator.id))?;
        if current.user_id != orchestrator.user_id || current.scope != orchestrator.scope {
            return Err(OrchestrationError::Validation(
                "orchestrator owner and scope are immutable".to_string(),
            ));
        }
        state
            .orchestrators
            .insert(orchestrator.id.clone(), orchestrator);
        Ok(())
    }

    async fn append_audit(&self, entry: AuditEntry) -> OrchestrationResult<()> {
        self.lock()?.audit.push(entry);
        Ok(())
    }

    async fn list_audit(&self, task_id: Option<&str>) -> OrchestrationResult<Vec<AuditEntry>> {
        let state = self.lock()?;
        Ok(state
            .audit
            .iter()
            .filter(|e| task_id.map_or(true, |id| e.task_id.as_deref() == Some(id)))
            .cloned()
            .collect())
    }

    async fn insert_insight(&self, insight: Insight) -> OrchestrationResult<()> {
        self.lock()?.insights.push(insight);
        Ok(())
    }

    async fn get_insight(&self, id: &str) -> OrchestrationResult<Option<Insight>> {
        Ok(self.lock()?.insights.iter().find(|i| i.id == id).cloned())
    }

    async fn list_insights(
        &self,
        orchestrator_id: Option<&str>,
    ) -> OrchestrationResult<Vec<Insight>> {
        let state = self.lock()?;
        Ok(state
            .insights
            .iter()
            .filter(|i| orchestrator_id.map_or(true, |id| i.orchestrator_id == id))
            .cloned()
            .collect())
    }

    async fn resolve_insight(&self, id: &str, at: DateTime<Utc>) -> OrchestrationResult<Insight> {
        let mut state = self.lock()?;
        let insight = state
            .insights
            .iter_mut()
            .find(|i| i.id == id)
            .ok_or_else(|| OrchestrationError::not_found("insight", id))?;
        if !insight.resolved {
            insight.resolved = true;
            insight.resolved_at = Some(at);
        }
        Ok(insight.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{AgentProviderKind, OrchestratorStatus, TaskType};

    fn task(id: &str) -> Task {
        let now = Utc::now();
        Task {
            id: id.into(),
            orchestrator_id: "o1".into(),
            folder_scope: None,
            description: "write tests".into(),
            task_type: TaskType::Test,
            status: TaskStatus::Queued,
            confidence: 0.5,
            priority: 5,
            assigned_agent: None,
            delegation_id: None,
            external_issue_ref: None,
            result_summary: None,
            error_info: None,
            created_at: now,
            updated_at: now,
            completed_at: None,
        }
    }

    fn delegation(id: &str, task_id: &str) -> Delegation {
        Delegation {
            id: id.into(),
            task_id: task_id.into(),
            session_id: String::new(),
            status: DelegationStatus::Spawning,
            agent_provider: AgentProviderKind::Claude,
            injected_context: String::new(),
            execution_log: Vec::new(),
            result: None,
            error: None,
            transcript_ref: None,
            created_at: Utc::now(),
            completed_at: None,
            first_output_at: None,
            last_activity_at: None,
            stall_insight_id: None,
            reprompt_count: 0,
            output_baseline: 0,
            lines_seen: 0,
        }
    }

    fn orchestrator(id: &str, scope: OrchestratorScope) -> Orchestrator {
        Orchestrator {
            id: id.into(),
            user_id: "u1".into(),
            scope,
            status: OrchestratorStatus::Idle,
            monitoring_interval_sec: 10,
            stall_threshold_sec: 300,
            auto_intervention: false,
            created_at: Utc::now(),
        }
    }

    #[tokio::test]
    async fn second_active_delegation_is_rejected() {
        let store = MemoryStore::new();
        store.insert_task(task("t1")).await.unwrap();
        store.insert_delegation(delegation("d1", "t1")).await.unwrap();

        match store.insert_delegation(delegation("d2", "t1")).await {
            Err(OrchestrationError::ActiveDelegationExists { delegation_id, .. }) => {
                assert_eq!(delegation_id, "d1")
            }
            other => panic!("unexpected {:?}", other),
        }

        let mut done = store.get_delegation("d1").await.unwrap().unwrap();
        done.status = DelegationStatus::Failed;
        store
            .update_delegation(done, DelegationStatus::Spawning)
            .await
            .unwrap();
        store.insert_delegation(delegation("d2", "t1")).await.unwrap();
    }

    #[tokio::test]
    async fn compare_and_set_rejects_stale_writers() {
        let store = MemoryStore::new();
        store.insert_task(task("t1")).await.unwrap();

        let mut first = store.get_task("t1").await.unwrap().unwrap();
        let mut second = first.clone();
        first.status = TaskStatus::Planning;
        store.update_task(first, TaskStatus::Queued).await.unwrap();

        second.status = TaskStatus::Cancelled;
        assert!(matches!(
            store.update_task(second, TaskStatus::Queued).await,
            Err(OrchestrationError::Conflict(_))
        ));
    }

    #[tokio::test]
    async fn orchestrator_uniqueness() {
        let store = MemoryStore::new();
        store
            .insert_orchestrator(orchestrator("m1", OrchestratorScope::Master))
            .await
            .unwrap();
        assert!(matches!(
            store
                .insert_orchestrator(orchestrator("m2", OrchestratorScope::Master))
                .await,
            Err(OrchestrationError::Conflict(_))
        ));

        let web = OrchestratorScope::Folder("web".into());
        store
            .insert_orchestrator(orchestrator("s1", web.clone()))
            .await
            .unwrap();
        assert!(store
            .insert_orchestrator(orchestrator("s2", web))
            .await
            .is_err());
        store
            .insert_orchestrator(orchestrator("s3", OrchestratorScope::Folder("api".into())))
            .await
            .unwrap();
        assert_eq!(store.list_orchestrators("u1").await.unwrap().len(), 3);
    }
}
