//! The foreground daemon: supervisor, health monitor, orchestration loops
//! and the control socket, wired from configuration.

use std::collections::HashMap;
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use devfleet_common::config::{FleetConfig, ServerSection};
use devfleet_common::limits::{resolve_health_limits, resolve_stop_limits};
use devfleet_common::runtime::{RuntimeDir, SNAPSHOT_FILE};
use devfleet_orchestration::{
    AgentProviderKind, AuditLog, DelegationEngine, DelegationMonitor, EngineSettings,
    EnvSecretSource, Journal, MemoryStore, MonitorSettings, NewTask, Orchestrator,
    OrchestratorRegistry, OrchestratorStatus, PolicyDefaults, ProviderRegistry, RecordStore,
    StaticFolders, SupervisorBroker, TaskFilter, TaskStatus, TaskType,
};
use devfleet_supervisor::{
    BindTarget, CommandSpec, FolderPreferences, HealthMonitor, HealthSettings, HttpProbe,
    PortRegistry, ProcessKind, ProcessSupervisor, Scope, StartRequest, SupervisedProcess,
    SupervisorSettings,
};
use serde_json::json;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::{UnixListener, UnixStream};
use tokio::sync::{watch, Mutex, Notify};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::protocol::{ControlRequest, ControlResponse};

pub const JOURNAL_FILE: &str = "audit.journal";
pub const JOURNAL_KEY_FILE: &str = "audit.key";

/// Load the journal key, creating a random one on first run.
pub fn journal_key(runtime: &RuntimeDir) -> Result<Vec<u8>> {
    if let Some(raw) = runtime.read_string(JOURNAL_KEY_FILE)? {
        let key = raw.trim();
        if !key.is_empty() {
            return Ok(key.as_bytes().to_vec());
        }
        warn!("Empty journal key file; generating a new key");
    }
    let key = format!(
        "{}{}",
        Uuid::new_v4().simple(),
        Uuid::new_v4().simple()
    );
    runtime
        .write_atomic(JOURNAL_KEY_FILE, key.as_bytes())
        .context("write journal key")?;
    Ok(key.into_bytes())
}

pub struct Daemon {
    config: FleetConfig,
    runtime: RuntimeDir,
    profile: String,
    supervisor: ProcessSupervisor,
    health: Arc<HealthMonitor>,
    ports: Mutex<PortRegistry>,
    store: Arc<dyn RecordStore>,
    engine: Arc<DelegationEngine>,
    monitor: Arc<DelegationMonitor>,
    registry: OrchestratorRegistry,
    master: Orchestrator,
    /// Provider requested at `task add`, consumed at dispatch.
    preferred: StdMutex<HashMap<String, AgentProviderKind>>,
    dispatch: Notify,
    shutdown_tx: watch::Sender<bool>,
}

impl Daemon {
    pub async fn build(config: FleetConfig, runtime: RuntimeDir, profile: &str) -> Result<Arc<Self>> {
        runtime.ensure().context("create runtime dir")?;

        let (stop, _) = resolve_stop_limits(
            config.stop.graceful_timeout_ms,
            config.stop.kill_timeout_ms,
            config.stop.spawn_confirm_ms,
            config.stop.port_free_timeout_ms,
        );
        let (health_limits, _) = resolve_health_limits(
            config.health.interval_ms,
            config.health.probe_timeout_ms,
            config.health.startup_deadline_ms,
            config.health.failure_threshold,
        );
        info!(
            health_interval_ms = health_limits.poll_interval_ms,
            failure_threshold = health_limits.failure_threshold,
            graceful_ms = stop.graceful_timeout_ms,
            kill_ms = stop.kill_timeout_ms,
            "Effective limits"
        );

        let mut settings = SupervisorSettings::new(runtime.logs_dir());
        settings.stop = stop;
        settings.default_startup_deadline = health_limits.startup_deadline();
        settings.transcript_lines = config.runtime.transcript_lines.max(1);
        settings.callback_url = config.runtime.callback_url.clone();
        settings.auth_url = config.runtime.auth_url.clone();
        let supervisor = ProcessSupervisor::new(settings);

        let health = Arc::new(
            HealthMonitor::new(
                supervisor.clone(),
                Arc::new(HttpProbe::new()),
                HealthSettings::from(&health_limits),
            )
            .with_snapshot(runtime.clone()),
        );
        let ports = PortRegistry::new(runtime.sockets_dir())
            .with_max_attempts(config.ports.max_suggestion_attempts);

        let store: Arc<dyn RecordStore> = Arc::new(MemoryStore::new());
        let key = journal_key(&runtime)?;
        let journal = Journal::open(runtime.file(JOURNAL_FILE), &key)
            .map_err(|err| anyhow!("open audit journal: {}", err))?;
        let audit = AuditLog::new(store.clone()).with_journal(Arc::new(journal));

        let orchestrator_cfg = &config.orchestrator;
        let registry = OrchestratorRegistry::new(
            store.clone(),
            audit.clone(),
            PolicyDefaults {
                monitoring_interval_sec: orchestrator_cfg.monitoring_interval_sec.max(1),
                stall_threshold_sec: orchestrator_cfg.stall_threshold_sec.max(1),
                auto_intervention: orchestrator_cfg.auto_intervention,
            },
        );
        let master = registry
            .ensure_master(&orchestrator_cfg.user)
            .await
            .map_err(|err| anyhow!("create master orchestrator: {}", err))?;
        for folder in config.folders.keys() {
            if let Err(err) = registry.create_scoped(&orchestrator_cfg.user, folder).await {
                warn!(folder = %folder, "Scoped orchestrator not created: {}", err);
            }
        }

        let default_provider = orchestrator_cfg
            .default_provider
            .parse::<AgentProviderKind>()
            .unwrap_or_else(|err| {
                warn!("{}; falling back to claude", err);
                AgentProviderKind::Claude
            });
        let folders = Arc::new(StaticFolders::new(config.folders.clone()));
        let broker = Arc::new(SupervisorBroker::new(
            supervisor.clone(),
            ProviderRegistry::from_config(&config.providers),
            Arc::new(EnvSecretSource),
            folders.clone(),
        ));
        let engine = Arc::new(DelegationEngine::new(
            store.clone(),
            audit,
            broker,
            folders,
            EngineSettings {
                default_provider,
                inject_timeout: Duration::from_millis(orchestrator_cfg.inject_timeout_ms.max(1)),
            },
        ));
        let monitor = Arc::new(DelegationMonitor::new(
            engine.clone(),
            MonitorSettings {
                poll_interval: Duration::from_secs(orchestrator_cfg.monitoring_interval_sec.max(1)),
                max_reprompts: orchestrator_cfg.max_reprompts,
            },
        ));

        let (shutdown_tx, _) = watch::channel(false);
        Ok(Arc::new(Self {
            config,
            runtime,
            profile: profile.to_string(),
            supervisor,
            health,
            ports: Mutex::new(ports),
            store,
            engine,
            monitor,
            registry,
            master,
            preferred: StdMutex::new(HashMap::new()),
            dispatch: Notify::new(),
            shutdown_tx,
        }))
    }

    pub fn shutdown_signal(&self) -> watch::Receiver<bool> {
        self.shutdown_tx.subscribe()
    }

    pub fn request_shutdown(&self) {
        let _ = self.shutdown_tx.send(true);
    }

    /// Run until a signal or a `shutdown` request, then stop everything.
    pub async fn run(self: Arc<Self>) -> Result<()> {
        let listener = bind_control_socket(&self.runtime)?;
        info!(
            socket = %self.runtime.control_socket().display(),
            profile = %self.profile,
            "devfleetd listening"
        );

        self.start_profile().await;

        let health_loop = self.health.clone().spawn(self.shutdown_signal());
        let monitor_loop = self.monitor.clone().spawn(self.shutdown_signal());
        let dispatcher = tokio::spawn(self.clone().dispatch_loop(self.shutdown_signal()));
        spawn_signal_handlers(self.clone());

        let mut shutdown = self.shutdown_signal();
        loop {
            tokio::select! {
                accepted = listener.accept() => match accepted {
                    Ok((stream, _)) => {
                        let daemon = self.clone();
                        tokio::spawn(async move {
                            if let Err(err) = daemon.handle_connection(stream).await {
                                debug!("Control connection error: {:#}", err);
                            }
                        });
                    }
                    Err(err) => error!("Control socket accept failed: {}", err),
                },
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
            }
        }

        info!("Graceful shutdown initiated");
        for handle in [health_loop, monitor_loop, dispatcher] {
            if let Err(err) = handle.await {
                warn!("Background loop ended abnormally: {}", err);
            }
        }
        self.supervisor.shutdown_all().await;
        if let Err(err) = self
            .runtime
            .write_json(SNAPSHOT_FILE, &self.health.snapshot().await)
        {
            warn!("Failed to write final process snapshot: {}", err);
        }
        let _ = std::fs::remove_file(self.runtime.control_socket());
        info!("devfleetd stopped");
        Ok(())
    }

    async fn start_profile(&self) {
        {
            let mut ports = self.ports.lock().await;
            for (name, folder) in &self.config.folders {
                let preferences = FolderPreferences {
                    env: folder.env.clone(),
                    ports: folder.ports.clone(),
                };
                for err in ports.seed_from_preferences(&Scope::folder(name), &preferences) {
                    warn!(folder = %name, "Port preference rejected: {}", err);
                }
            }
        }

        let Some(profile) = self.config.profile(&self.profile) else {
            if !self.config.profiles.is_empty() {
                warn!(profile = %self.profile, "Profile not found in configuration");
            }
            return;
        };
        for server in &profile.servers {
            match self.start_server(server).await {
                Ok(process) => info!(
                    server = %server.name,
                    process_id = %process.id,
                    pid = ?process.pid,
                    bind = %process.bind_target,
                    "Server started"
                ),
                Err(err) => warn!(server = %server.name, "Server not started: {:#}", err),
            }
        }
    }

    async fn start_server(&self, server: &ServerSection) -> Result<SupervisedProcess> {
        let scope = server
            .folder
            .as_deref()
            .map(Scope::folder)
            .unwrap_or(Scope::Global);
        let folder = server.folder.as_deref().and_then(|name| self.config.folder(name));

        let mut command = CommandSpec::new(&server.command);
        command.args = server.args.clone();
        if let Some(folder) = folder {
            command.env.extend(folder.env.clone());
        }
        command.env.extend(server.env.clone());

        let bind_target = if server.socket {
            let ports = self.ports.lock().await;
            ports.remove_stale_socket(&scope)?;
            BindTarget::Socket(ports.socket_path(&scope))
        } else {
            let candidate = server
                .port
                .or_else(|| folder.and_then(|f| f.ports.get(&server.port_var).copied()));
            match candidate {
                Some(candidate) => {
                    let port = self
                        .ports
                        .lock()
                        .await
                        .reserve(&scope, &server.port_var, u32::from(candidate))?;
                    command.env.insert(server.port_var.clone(), port.to_string());
                    BindTarget::Port(port)
                }
                None => BindTarget::Stdio,
            }
        };

        let request = StartRequest {
            name: server.name.clone(),
            kind: ProcessKind::DevServer,
            bind_target,
            command,
            working_dir: folder.map(|f| f.path.clone()),
            scope,
            startup_deadline: server.startup_deadline_ms.map(Duration::from_millis),
        };
        Ok(self.supervisor.start(request).await?)
    }

    /// Delegate queued tasks of every active orchestrator. Woken by new
    /// tasks and by the monitoring interval.
    async fn dispatch_loop(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) {
        let interval = Duration::from_secs(self.config.orchestrator.monitoring_interval_sec.max(1));
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = ticker.tick() => {}
                _ = self.dispatch.notified() => {}
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                    continue;
                }
            }
            self.dispatch_queued().await;
        }
        debug!("Dispatcher stopped");
    }

    async fn dispatch_queued(&self) {
        let orchestrators = match self.registry.list_for_user(&self.master.user_id).await {
            Ok(list) => list,
            Err(err) => {
                warn!("Failed to list orchestrators: {}", err);
                return;
            }
        };
        for orchestrator in orchestrators {
            if orchestrator.status == OrchestratorStatus::Paused {
                continue;
            }
            loop {
                let next = match self.engine.queue().next_queued(&orchestrator.id).await {
                    Ok(Some(task)) => task,
                    Ok(None) => break,
                    Err(err) => {
                        warn!(orchestrator_id = %orchestrator.id, "Queue read failed: {}", err);
                        break;
                    }
                };
                let provider = self
                    .preferred
                    .lock()
                    .ok()
                    .and_then(|mut preferred| preferred.remove(&next.id));
                if let Err(err) = self.engine.delegate(&next.id, provider).await {
                    warn!(task_id = %next.id, "Dispatch failed: {}", err);
                    break;
                }
            }
        }
    }

    async fn handle_connection(self: Arc<Self>, stream: UnixStream) -> Result<()> {
        let (reader, mut writer) = stream.into_split();
        let mut reader = BufReader::new(reader);
        let mut line = String::new();
        loop {
            line.clear();
            if reader.read_line(&mut line).await? == 0 {
                break;
            }
            let raw = line.trim();
            if raw.is_empty() {
                continue;
            }
            let response = match serde_json::from_str::<ControlRequest>(raw) {
                Ok(request) => self.handle_request(request).await,
                Err(err) => ControlResponse::error("E_BAD_REQUEST", err.to_string()),
            };
            let out = serde_json::to_string(&response)? + "\n";
            writer.write_all(out.as_bytes()).await?;
        }
        Ok(())
    }

    pub async fn handle_request(&self, request: ControlRequest) -> ControlResponse {
        match request {
            ControlRequest::Ping => ControlResponse::ok(json!({
                "pid": std::process::id(),
                "profile": self.profile,
            })),
            ControlRequest::Status => self.status().await,
            ControlRequest::TaskAdd {
                description,
                task_type,
                folder,
                priority,
                confidence,
                provider,
            } => {
                let orchestrator_id = match self.orchestrator_for(folder.as_deref()).await {
                    Ok(id) => id,
                    Err(err) => return err.into(),
                };
                let new_task = NewTask {
                    orchestrator_id,
                    folder_scope: folder,
                    description,
                    task_type: task_type.unwrap_or(TaskType::Feature),
                    confidence: confidence.unwrap_or(1.0),
                    priority,
                    external_issue_ref: None,
                };
                match self.engine.queue().enqueue(new_task, &self.master.user_id).await {
                    Ok(task) => {
                        if let (Some(provider), Ok(mut preferred)) = (provider, self.preferred.lock()) {
                            preferred.insert(task.id.clone(), provider);
                        }
                        self.dispatch.notify_one();
                        ControlResponse::ok(json!(task))
                    }
                    Err(err) => err.into(),
                }
            }
            ControlRequest::TaskList { status } => {
                let filter = TaskFilter {
                    status,
                    ..TaskFilter::default()
                };
                match self.engine.queue().list(&filter).await {
                    Ok(tasks) => ControlResponse::ok(json!(tasks)),
                    Err(err) => err.into(),
                }
            }
            ControlRequest::TaskCancel { id, reason } => {
                let reason = reason.unwrap_or_else(|| "cancelled by user".to_string());
                match self
                    .engine
                    .cancel_task(&id, &reason, &self.master.user_id)
                    .await
                {
                    Ok(task) => ControlResponse::ok(json!(task)),
                    Err(err) => err.into(),
                }
            }
            ControlRequest::Insights => match self.engine.audit().insights(None).await {
                Ok(insights) => ControlResponse::ok(json!(insights)),
                Err(err) => err.into(),
            },
            ControlRequest::ResolveInsight { id } => {
                match self
                    .engine
                    .audit()
                    .resolve_insight(&id, &self.master.user_id)
                    .await
                {
                    Ok(insight) => ControlResponse::ok(json!(insight)),
                    Err(err) => err.into(),
                }
            }
            ControlRequest::Shutdown => {
                info!("Shutdown requested over control socket");
                self.request_shutdown();
                ControlResponse::ok(json!({ "stopping": true }))
            }
        }
    }

    /// Folder tasks go to the folder's orchestrator when one exists.
    async fn orchestrator_for(
        &self,
        folder: Option<&str>,
    ) -> devfleet_orchestration::OrchestrationResult<String> {
        let Some(folder) = folder else {
            return Ok(self.master.id.clone());
        };
        let scoped = self
            .registry
            .list_for_user(&self.master.user_id)
            .await?
            .into_iter()
            .find(|o| {
                matches!(&o.scope, devfleet_orchestration::OrchestratorScope::Folder(f) if f == folder)
            });
        Ok(scoped.map(|o| o.id).unwrap_or_else(|| self.master.id.clone()))
    }

    async fn status(&self) -> ControlResponse {
        let tasks = match self.engine.queue().list(&TaskFilter::default()).await {
            Ok(tasks) => tasks,
            Err(err) => return err.into(),
        };
        let mut counts: HashMap<String, usize> = HashMap::new();
        for task in &tasks {
            *counts.entry(task.status.to_string()).or_default() += 1;
        }
        let active = self
            .store
            .list_active_delegations()
            .await
            .map(|d| d.len())
            .unwrap_or(0);
        let open_insights = self
            .engine
            .audit()
            .insights(None)
            .await
            .map(|list| list.iter().filter(|i| !i.resolved).count())
            .unwrap_or(0);
        ControlResponse::ok(json!({
            "pid": std::process::id(),
            "profile": self.profile,
            "build": devfleet_build_info::build_id(),
            "tasks": counts,
            "queued": tasks.iter().filter(|t| t.status == TaskStatus::Queued).count(),
            "active_delegations": active,
            "open_insights": open_insights,
            "fleet": self.health.snapshot().await,
        }))
    }
}

fn bind_control_socket(runtime: &RuntimeDir) -> Result<UnixListener> {
    let path = runtime.control_socket();
    if path.exists() {
        // Only a stale file can be here: the pid marker guards live daemons.
        std::fs::remove_file(&path)
            .with_context(|| format!("remove stale control socket {}", path.display()))?;
    }
    let listener = UnixListener::bind(&path)
        .with_context(|| format!("bind control socket {}", path.display()))?;
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o600))
            .context("restrict control socket permissions")?;
    }
    Ok(listener)
}

fn spawn_signal_handlers(daemon: Arc<Daemon>) {
    let ctrl_c = daemon.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("Received Ctrl+C; shutting down");
            ctrl_c.request_shutdown();
        }
    });

    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        let mut sigterm = match signal(SignalKind::terminate()) {
            Ok(stream) => stream,
            Err(err) => {
                warn!("Failed to install SIGTERM handler: {}", err);
                return;
            }
        };
        tokio::spawn(async move {
            if sigterm.recv().await.is_some() {
                info!("Received SIGTERM; shutting down");
                daemon.request_shutdown();
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use devfleet_common::config::FolderSection;
    use std::collections::BTreeMap;
    use tempfile::TempDir;

    async fn daemon(temp: &TempDir) -> Arc<Daemon> {
        let mut config = FleetConfig::default();
        config.folders = BTreeMap::from([(
            "web".to_string(),
            FolderSection {
                path: temp.path().to_path_buf(),
                ..FolderSection::default()
            },
        )]);
        Daemon::build(config, RuntimeDir::new(temp.path().join("run")), "default")
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn journal_key_is_created_once() {
        let temp = TempDir::new().unwrap();
        let runtime = RuntimeDir::new(temp.path());
        let first = journal_key(&runtime).unwrap();
        let second = journal_key(&runtime).unwrap();
        assert_eq!(first.len(), 64);
        assert_eq!(first, second);
    }

    #[tokio::test]
    async fn tasks_route_to_folder_orchestrators_and_cancel() {
        let temp = TempDir::new().unwrap();
        let daemon = daemon(&temp).await;

        let added = daemon
            .handle_request(ControlRequest::TaskAdd {
                description: "tidy css".into(),
                task_type: None,
                folder: Some("web".into()),
                priority: Some(3),
                confidence: None,
                provider: None,
            })
            .await;
        assert!(added.ok, "{:?}", added.error);
        assert_ne!(added.data["orchestrator_id"], json!(daemon.master.id));
        let id = added.data["id"].as_str().unwrap().to_string();

        let listed = daemon
            .handle_request(ControlRequest::TaskList {
                status: Some(TaskStatus::Queued),
            })
            .await;
        assert_eq!(listed.data.as_array().unwrap().len(), 1);

        let cancelled = daemon
            .handle_request(ControlRequest::TaskCancel {
                id: id.clone(),
                reason: None,
            })
            .await;
        assert_eq!(cancelled.data["status"], "cancelled");

        let again = daemon
            .handle_request(ControlRequest::TaskCancel { id, reason: None })
            .await;
        assert_eq!(again.code.as_deref(), Some("E_INVALID_TRANSITION"));
    }

    #[tokio::test]
    async fn invalid_tasks_are_rejected() {
        let temp = TempDir::new().unwrap();
        let daemon = daemon(&temp).await;
        let response = daemon
            .handle_request(ControlRequest::TaskAdd {
                description: "   ".into(),
                task_type: None,
                folder: None,
                priority: None,
                confidence: None,
                provider: None,
            })
            .await;
        assert!(!response.ok);
        assert_eq!(response.code.as_deref(), Some("E_VALIDATION"));
    }
}
