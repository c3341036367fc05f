//! Task queue.
//!
//! `queued` is the only entry state. Every status change is a compare-and-set
//! in the store followed by one audit entry.

use std::sync::Arc;

use chrono::Utc;
use serde_json::json;
use tracing::info;
use uuid::Uuid;

use crate::audit::{AuditLog, AuditRecord};
use crate::error::{OrchestrationError, OrchestrationResult};
use crate::store::RecordStore;
use crate::types::{
    ErrorInfo, NewTask, Task, TaskFilter, TaskStatus, DEFAULT_PRIORITY, MAX_DESCRIPTION_CHARS,
    MAX_PRIORITY,
};

#[derive(Clone)]
pub struct TaskQueue {
    store: Arc<dyn RecordStore>,
    audit: AuditLog,
}

fn validate_description(description: &str) -> OrchestrationResult<String> {
    let trimmed = description.trim();
    if trimmed.is_empty() {
        return Err(OrchestrationError::Validation(
            "task description must not be empty".to_string(),
        ));
    }
    let chars = trimmed.chars().count();
    if chars > MAX_DESCRIPTION_CHARS {
        return Err(OrchestrationError::Validation(format!(
            "task description is {} characters, limit is {}",
            chars, MAX_DESCRIPTION_CHARS
        )));
    }
    Ok(trimmed.to_string())
}

impl TaskQueue {
    pub fn new(store: Arc<dyn RecordStore>, audit: AuditLog) -> Self {
        Self { store, audit }
    }

    pub async fn enqueue(&self, new_task: NewTask, actor: &str) -> OrchestrationResult<Task> {
        let description = validate_description(&new_task.description)?;
        if !(0.0..=1.0).contains(&new_task.confidence) {
            return Err(OrchestrationError::Validation(format!(
                "confidence {} is outside 0..=1",
                new_task.confidence
            )));
        }
        let priority = new_task.priority.unwrap_or(DEFAULT_PRIORITY);
        if priority > MAX_PRIORITY {
            return Err(OrchestrationError::Validation(format!(
                "priority {} is outside 0..={}",
                priority, MAX_PRIORITY
            )));
        }
        if new_task.orchestrator_id.trim().is_empty() {
            return Err(OrchestrationError::Validation(
                "task needs an orchestrator".to_string(),
            ));
        }
        if self
            .store
            .get_orchestrator(&new_task.orchestrator_id)
            .await?
            .is_none()
        {
            return Err(OrchestrationError::not_found(
                "orchestrator",
                &new_task.orchestrator_id,
            ));
        }

        let now = Utc::now();
        let task = Task {
            id: Uuid::new_v4().to_string(),
            orchestrator_id: new_task.orchestrator_id,
            folder_scope: new_task.folder_scope.filter(|s| !s.trim().is_empty()),
            description,
            task_type: new_task.task_type,
            status: TaskStatus::Queued,
            confidence: new_task.confidence,
            priority,
            assigned_agent: None,
            delegation_id: None,
            external_issue_ref: new_task.external_issue_ref,
            result_summary: None,
            error_info: None,
            created_at: now,
            updated_at: now,
            completed_at: None,
        };
        self.store.insert_task(task.clone()).await?;

        self.audit
            .record(
                AuditRecord::new("task.enqueued", actor)
                    .orchestrator(&task.orchestrator_id)
                    .task(&task.id)
                    .detail(json!({
                        "type": task.task_type,
                        "priority": task.priority,
                        "folder_scope": task.folder_scope,
                    })),
            )
            .await?;
        info!(task_id = %task.id, task_type = %task.task_type, "Task enqueued");
        Ok(task)
    }

    pub async fn get(&self, id: &str) -> OrchestrationResult<Task> {
        self.store
            .get_task(id)
            .await?
            .ok_or_else(|| OrchestrationError::not_found("task", id))
    }

    pub async fn list(&self, filter: &TaskFilter) -> OrchestrationResult<Vec<Task>> {
        self.store.list_tasks(filter).await
    }

    /// Highest priority first, then oldest.
    pub async fn next_queued(&self, orchestrator_id: &str) -> OrchestrationResult<Option<Task>> {
        let filter = TaskFilter {
            orchestrator_id: Some(orchestrator_id.to_string()),
            status: Some(TaskStatus::Queued),
            folder_scope: None,
        };
        let tasks = self.store.list_tasks(&filter).await?;
        Ok(tasks.into_iter().min_by(|a, b| {
            b.priority
                .cmp(&a.priority)
                .then(a.created_at.cmp(&b.created_at))
                .then(a.id.cmp(&b.id))
        }))
    }

    /// Only allowed while the task is `queued`.
    pub async fn edit_description(
        &self,
        id: &str,
        description: &str,
        actor: &str,
    ) -> OrchestrationResult<Task> {
        let description = validate_description(description)?;
        let mut task = self.get(id).await?;
        if task.status != TaskStatus::Queued {
            return Err(OrchestrationError::transition(
                "task",
                id,
                task.status,
                "edited",
            ));
        }
        task.description = description;
        task.updated_at = Utc::now();
        self.store.update_task(task.clone(), TaskStatus::Queued).await?;

        self.audit
            .record(
                AuditRecord::new("task.edited", actor)
                    .orchestrator(&task.orchestrator_id)
                    .task(&task.id),
            )
            .await?;
        Ok(task)
    }

    pub async fn begin_planning(&self, id: &str, actor: &str) -> OrchestrationResult<Task> {
        self.transition(id, TaskStatus::Queued, TaskStatus::Planning, actor)
            .await
    }

    pub async fn transition(
        &self,
        id: &str,
        from: TaskStatus,
        to: TaskStatus,
        actor: &str,
    ) -> OrchestrationResult<Task> {
        self.transition_with(id, from, to, actor, |_| {}).await
    }

    pub async fn complete(
        &self,
        id: &str,
        from: TaskStatus,
        summary: Option<String>,
        actor: &str,
    ) -> OrchestrationResult<Task> {
        self.transition_with(id, from, TaskStatus::Completed, actor, |task| {
            task.result_summary = summary;
        })
        .await
    }

    pub async fn fail(
        &self,
        id: &str,
        from: TaskStatus,
        error: ErrorInfo,
        actor: &str,
    ) -> OrchestrationResult<Task> {
        self.transition_with(id, from, TaskStatus::Failed, actor, |task| {
            task.error_info = Some(error);
        })
        .await
    }

    /// Compare-and-set transition plus audit entry. `mutate` runs on the
    /// record before it is written.
    pub async fn transition_with<F>(
        &self,
        id: &str,
        from: TaskStatus,
        to: TaskStatus,
        actor: &str,
        mutate: F,
    ) -> OrchestrationResult<Task>
    where
        F: FnOnce(&mut Task) + Send,
    {
        let mut task = self.get(id).await?;
        if task.status != from || !from.can_transition_to(to) {
            return Err(OrchestrationError::transition("task", id, task.status, to));
        }

        let now = Utc::now();
        mutate(&mut task);
        task.status = to;
        task.updated_at = now;
        if to.is_terminal() {
            task.completed_at = Some(now);
        }
        self.store.update_task(task.clone(), from).await?;

        self.audit
            .record(
                AuditRecord::new("task.transition", actor)
                    .orchestrator(&task.orchestrator_id)
                    .task(&task.id)
                    .detail(json!({ "from": from, "to": to })),
            )
            .await?;
        info!(task_id = %task.id, from = %from, to = %to, "Task transition");
        Ok(task)
    }

    /// Audit-only note; allowed in every state, including terminal ones.
    pub async fn annotate(&self, id: &str, note: &str, actor: &str) -> OrchestrationResult<()> {
        let task = self.get(id).await?;
        if note.trim().is_empty() {
            return Err(OrchestrationError::Validation(
                "annotation must not be empty".to_string(),
            ));
        }
        self.audit
            .record(
                AuditRecord::new("task.annotated", actor)
                    .orchestrator(&task.orchestrator_id)
                    .task(&task.id)
                    .detail(json!({ "note": note.trim() })),
            )
            .await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStore;
    use crate::types::{Orchestrator, OrchestratorScope, OrchestratorStatus, TaskType};

    async fn queue() -> TaskQueue {
        let store: Arc<dyn RecordStore> = Arc::new(MemoryStore::new());
        store
            .insert_orchestrator(Orchestrator {
                id: "o1".into(),
                user_id: "u1".into(),
                scope: OrchestratorScope::Master,
                status: OrchestratorStatus::Idle,
                monitoring_interval_sec: 10,
                stall_threshold_sec: 300,
                auto_intervention: false,
                created_at: Utc::now(),
            })
            .await
            .unwrap();
        let audit = AuditLog::new(store.clone());
        TaskQueue::new(store, audit)
    }

    fn new_task(description: &str, priority: Option<u8>) -> NewTask {
        NewTask {
            orchestrator_id: "o1".into(),
            folder_scope: None,
            description: description.into(),
            task_type: TaskType::Feature,
            confidence: 0.8,
            priority,
            external_issue_ref: None,
        }
    }

    #[tokio::test]
    async fn enqueue_validates_input() {
        let queue = queue().await;
        assert!(matches!(
            queue.enqueue(new_task("   ", None), "user").await,
            Err(OrchestrationError::Validation(_))
        ));
        let huge = "x".repeat(MAX_DESCRIPTION_CHARS + 1);
        assert!(queue.enqueue(new_task(&huge, None), "user").await.is_err());
        assert!(queue.enqueue(new_task("ok", Some(11)), "user").await.is_err());

        let mut bad_confidence = new_task("ok", None);
        bad_confidence.confidence = 1.5;
        assert!(queue.enqueue(bad_confidence, "user").await.is_err());

        let mut orphan = new_task("ok", None);
        orphan.orchestrator_id = "nope".into();
        assert!(matches!(
            queue.enqueue(orphan, "user").await,
            Err(OrchestrationError::NotFound { .. })
        ));

        let task = queue.enqueue(new_task("  add login  ", None), "user").await.unwrap();
        assert_eq!(task.status, TaskStatus::Queued);
        assert_eq!(task.description, "add login");
        assert_eq!(task.priority, DEFAULT_PRIORITY);
    }

    #[tokio::test]
    async fn description_is_editable_only_while_queued() {
        let queue = queue().await;
        let task = queue.enqueue(new_task("first", None), "user").await.unwrap();
        let edited = queue.edit_description(&task.id, "second", "user").await.unwrap();
        assert_eq!(edited.description, "second");

        queue.begin_planning(&task.id, "system").await.unwrap();
        assert!(matches!(
            queue.edit_description(&task.id, "third", "user").await,
            Err(OrchestrationError::InvalidTransition { .. })
        ));
    }

    #[tokio::test]
    async fn transitions_are_checked_and_audited() {
        let queue = queue().await;
        let task = queue.enqueue(new_task("work", None), "user").await.unwrap();

        assert!(queue
            .transition(&task.id, TaskStatus::Queued, TaskStatus::Executing, "system")
            .await
            .is_err());
        assert!(queue
            .transition(&task.id, TaskStatus::Planning, TaskStatus::Executing, "system")
            .await
            .is_err());

        queue.begin_planning(&task.id, "system").await.unwrap();
        queue
            .transition(&task.id, TaskStatus::Planning, TaskStatus::Executing, "system")
            .await
            .unwrap();
        queue
            .transition(&task.id, TaskStatus::Executing, TaskStatus::Monitoring, "system")
            .await
            .unwrap();
        let done = queue
            .complete(&task.id, TaskStatus::Monitoring, Some("shipped".into()), "system")
            .await
            .unwrap();
        assert_eq!(done.result_summary.as_deref(), Some("shipped"));
        assert!(done.completed_at.is_some());

        assert!(queue
            .transition(&task.id, TaskStatus::Completed, TaskStatus::Cancelled, "user")
            .await
            .is_err());
        queue.annotate(&task.id, "reviewed by alice", "user").await.unwrap();

        let entries = queue.audit.entries(Some(&task.id)).await.unwrap();
        let transitions = entries
            .iter()
            .filter(|e| e.action == "task.transition")
            .count();
        assert_eq!(transitions, 4);
        assert!(entries.iter().any(|e| e.action == "task.annotated"));
    }

    #[tokio::test]
    async fn next_queued_prefers_priority_then_age() {
        let queue = queue().await;
        let low = queue.enqueue(new_task("low", Some(1)), "user").await.unwrap();
        let high_old = queue.enqueue(new_task("high old", Some(9)), "user").await.unwrap();
        let _high_new = queue.enqueue(new_task("high new", Some(9)), "user").await.unwrap();

        let next = queue.next_queued("o1").await.unwrap().unwrap();
        assert_eq!(next.id, high_old.id);

        queue.begin_planning(&high_old.id, "system").await.unwrap();
        let next = queue.next_queued("o1").await.unwrap().unwrap();
        assert_ne!(next.id, low.id);
    }
}
