//! Agent sessions as seen by the delegation engine.
//!
//! [`SessionBroker`] is the only way the engine touches agent processes.
//! [`SupervisorBroker`] backs it with the process supervisor and keeps an
//! idle pool keyed by provider and working directory so a finished session
//! can take the next task for the same folder.

use std::collections::{BTreeMap, HashMap};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use devfleet_supervisor::{
    BindTarget, ProcessKind, ProcessSupervisor, Scope, SessionActivity, SessionOutput,
    StartRequest, SupervisorError,
};
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::collaborators::{PreferenceSource, SecretSource};
use crate::error::{OrchestrationError, OrchestrationResult};
use crate::providers::{ProviderContext, ProviderRegistry};
use crate::types::AgentProviderKind;

#[derive(Clone, Debug)]
pub struct SessionRequest {
    pub provider: AgentProviderKind,
    pub folder: Option<String>,
    pub task_id: String,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SessionHandle {
    pub session_id: String,
    pub reused: bool,
    /// Lines the session had already produced when it was handed out.
    pub baseline: u64,
    pub transcript_ref: Option<PathBuf>,
}

#[async_trait]
pub trait SessionBroker: Send + Sync {
    /// Reuse an idle session or start a new one.
    async fn acquire(&self, request: SessionRequest) -> OrchestrationResult<SessionHandle>;

    async fn write_input(
        &self,
        session_id: &str,
        text: &str,
        timeout: Duration,
    ) -> OrchestrationResult<()>;

    /// Activity plus the lines captured after the first `after`, oldest
    /// first, in one consistent read.
    async fn output_since(&self, session_id: &str, after: u64)
        -> OrchestrationResult<SessionOutput>;

    /// Return a session to the idle pool once its delegation is done.
    async fn release(&self, session_id: &str);

    /// Stop the session (graceful, then forced) and forget it.
    async fn stop(&self, session_id: &str) -> OrchestrationResult<()>;
}

type PoolKey = (AgentProviderKind, Option<PathBuf>);

#[derive(Default)]
struct BrokerState {
    idle: HashMap<PoolKey, Vec<String>>,
    /// Pool key of every session this broker started.
    sessions: HashMap<String, PoolKey>,
}

pub struct SupervisorBroker {
    supervisor: ProcessSupervisor,
    providers: ProviderRegistry,
    secrets: Arc<dyn SecretSource>,
    preferences: Arc<dyn PreferenceSource>,
    state: Mutex<BrokerState>,
}

impl SupervisorBroker {
    pub fn new(
        supervisor: ProcessSupervisor,
        providers: ProviderRegistry,
        secrets: Arc<dyn SecretSource>,
        preferences: Arc<dyn PreferenceSource>,
    ) -> Self {
        Self {
            supervisor,
            providers,
            secrets,
            preferences,
            state: Mutex::new(BrokerState::default()),
        }
    }

    pub async fn idle_count(&self) -> usize {
        self.state.lock().await.idle.values().map(Vec::len).sum()
    }

    async fn usable(&self, session_id: &str) -> Option<SessionActivity> {
        let process = self.supervisor.get(session_id).await?;
        if !process.status.is_live() {
            return None;
        }
        let activity = self.supervisor.activity(session_id).await.ok()?;
        (!activity.exited).then_some(activity)
    }

    async fn take_idle(&self, key: &PoolKey) -> Option<(String, SessionActivity)> {
        loop {
            let candidate = {
                let mut state = self.state.lock().await;
                state.idle.get_mut(key).and_then(Vec::pop)?
            };
            match self.usable(&candidate).await {
                Some(activity) => return Some((candidate, activity)),
                None => {
                    debug!(session_id = %candidate, "Dropping dead idle session");
                    self.discard(&candidate).await;
                }
            }
        }
    }

    /// Forget a session and drop its supervisor record.
    async fn discard(&self, session_id: &str) {
        {
            let mut state = self.state.lock().await;
            for pool in state.idle.values_mut() {
                pool.retain(|id| id != session_id);
            }
            state.sessions.remove(session_id);
        }
        if let Err(err) = self.supervisor.stop(session_id).await {
            debug!(session_id = %session_id, "Stop before removal skipped: {}", err);
        }
        if let Err(err) = self.supervisor.remove(session_id).await {
            debug!(session_id = %session_id, "Session record not removed: {}", err);
        }
    }

    async fn provider_for(&self, session_id: &str) -> OrchestrationResult<AgentProviderKind> {
        self.state
            .lock()
            .await
            .sessions
            .get(session_id)
            .map(|(kind, _)| *kind)
            .ok_or_else(|| OrchestrationError::not_found("session", session_id))
    }
}

#[async_trait]
impl SessionBroker for SupervisorBroker {
    async fn acquire(&self, request: SessionRequest) -> OrchestrationResult<SessionHandle> {
        let provider = self.providers.get(request.provider).ok_or_else(|| {
            OrchestrationError::Validation(format!("provider {} is not configured", request.provider))
        })?;
        let folder = self.preferences.resolve(request.folder.as_deref()).await;
        let key: PoolKey = (request.provider, folder.working_dir.clone());

        if let Some((session_id, activity)) = self.take_idle(&key).await {
            info!(session_id = %session_id, task_id = %request.task_id, "Reusing idle session");
            return Ok(SessionHandle {
                transcript_ref: Some(self.supervisor.log_path(&session_id)),
                session_id,
                reused: true,
                baseline: activity.lines_captured,
            });
        }

        let mut credentials = BTreeMap::new();
        for var in provider.credential_vars() {
            match self.secrets.secret(var).await {
                Some(value) => {
                    credentials.insert(var.to_string(), value);
                }
                None => warn!(provider = %request.provider, variable = %var, "Credential not available"),
            }
        }
        let ctx = ProviderContext {
            working_dir: folder.working_dir.clone(),
            credentials,
            env: folder.preferences.env.clone(),
        };

        let short_task: String = request.task_id.chars().take(8).collect();
        let start = StartRequest {
            name: format!("{}-{}", request.provider, short_task),
            kind: ProcessKind::AgentSession,
            bind_target: BindTarget::Stdio,
            command: provider.command(&ctx),
            working_dir: folder.working_dir.clone(),
            scope: request
                .folder
                .as_deref()
                .map(Scope::folder)
                .unwrap_or(Scope::Global),
            startup_deadline: None,
        };
        let process = self.supervisor.start(start).await?;
        self.state
            .lock()
            .await
            .sessions
            .insert(process.id.clone(), key);

        info!(
            session_id = %process.id,
            provider = %request.provider,
            task_id = %request.task_id,
            "Agent session started"
        );
        Ok(SessionHandle {
            transcript_ref: Some(self.supervisor.log_path(&process.id)),
            session_id: process.id,
            reused: false,
            baseline: 0,
        })
    }

    async fn write_input(
        &self,
        session_id: &str,
        text: &str,
        timeout: Duration,
    ) -> OrchestrationResult<()> {
        let kind = self.provider_for(session_id).await?;
        let payload = match self.providers.get(kind) {
            Some(provider) => provider.encode_input(text),
            None => text.to_string(),
        };
        self.supervisor
            .write_input(session_id, &payload, timeout)
            .await?;
        Ok(())
    }

    async fn output_since(
        &self,
        session_id: &str,
        after: u64,
    ) -> OrchestrationResult<SessionOutput> {
        Ok(self.supervisor.output_since(session_id, after).await?)
    }

    async fn release(&self, session_id: &str) {
        if self.usable(session_id).await.is_none() {
            self.discard(session_id).await;
            return;
        }
        let mut state = self.state.lock().await;
        let Some(key) = state.sessions.get(session_id).cloned() else {
            return;
        };
        let pool = state.idle.entry(key).or_default();
        if !pool.iter().any(|id| id == session_id) {
            pool.push(session_id.to_string());
            debug!(session_id = %session_id, "Session returned to idle pool");
        }
    }

    async fn stop(&self, session_id: &str) -> OrchestrationResult<()> {
        {
            let mut state = self.state.lock().await;
            for pool in state.idle.values_mut() {
                pool.retain(|id| id != session_id);
            }
            state.sessions.remove(session_id);
        }
        match self.supervisor.stop(session_id).await {
            Ok(_) => {}
            // Already stopped and removed.
            Err(SupervisorError::NotFound(_)) => return Ok(()),
            Err(err) => return Err(err.into()),
        }
        self.supervisor.remove(session_id).await?;
        debug!(session_id = %session_id, "Session stopped and removed");
        Ok(())
    }
}
