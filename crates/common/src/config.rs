//! `devfleet.toml` loading.
//!
//! Unreadable or invalid files never abort the daemon: they are reported with
//! a warning and the defaults are used instead.

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

pub const CONFIG_ENV: &str = "DEVFLEET_CONFIG";
pub const CONFIG_FILE_NAME: &str = "devfleet.toml";

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct FleetConfig {
    pub runtime: RuntimeSection,
    pub health: HealthSection,
    pub stop: StopSection,
    pub ports: PortsSection,
    pub orchestrator: OrchestratorSection,
    pub providers: BTreeMap<String, ProviderSection>,
    pub folders: BTreeMap<String, FolderSection>,
    pub profiles: BTreeMap<String, ProfileSection>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RuntimeSection {
    pub dir: Option<PathBuf>,
    /// Exported to supervised processes as `DEVFLEET_CALLBACK_URL`.
    pub callback_url: Option<String>,
    /// Exported to supervised processes as `DEVFLEET_AUTH_URL`.
    pub auth_url: Option<String>,
    pub transcript_lines: usize,
    pub default_profile: String,
}

impl Default for RuntimeSection {
    fn default() -> Self {
        Self {
            dir: None,
            callback_url: None,
            auth_url: None,
            transcript_lines: 2_000,
            default_profile: "default".to_string(),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct HealthSection {
    pub interval_ms: Option<u64>,
    pub probe_timeout_ms: Option<u64>,
    pub startup_deadline_ms: Option<u64>,
    pub failure_threshold: Option<u32>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct StopSection {
    pub graceful_timeout_ms: Option<u64>,
    pub kill_timeout_ms: Option<u64>,
    pub spawn_confirm_ms: Option<u64>,
    pub port_free_timeout_ms: Option<u64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PortsSection {
    pub max_suggestion_attempts: u32,
}

impl Default for PortsSection {
    fn default() -> Self {
        Self {
            max_suggestion_attempts: 100,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct OrchestratorSection {
    pub user: String,
    pub monitoring_interval_sec: u64,
    pub stall_threshold_sec: u64,
    pub auto_intervention: bool,
    pub max_reprompts: u32,
    pub default_provider: String,
    /// Bound on each write into an agent session while injecting context.
    pub inject_timeout_ms: u64,
}

impl Default for OrchestratorSection {
    fn default() -> Self {
        Self {
            user: "local".to_string(),
            monitoring_interval_sec: 10,
            stall_threshold_sec: 300,
            auto_intervention: false,
            max_reprompts: 1,
            default_provider: "claude".to_string(),
            inject_timeout_ms: 5_000,
        }
    }
}

/// Override of an agent provider's binary, arguments or environment.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ProviderSection {
    pub program: Option<String>,
    pub args: Option<Vec<String>>,
    pub env: BTreeMap<String, String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct FolderSection {
    pub path: PathBuf,
    pub env: BTreeMap<String, String>,
    /// Port reservations by variable name (e.g. `PORT = 3000`).
    pub ports: BTreeMap<String, u16>,
    /// Project knowledge snippets injected into delegations for this folder.
    pub knowledge: Vec<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ProfileSection {
    pub servers: Vec<ServerSection>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerSection {
    pub name: String,
    pub command: String,
    #[serde(default)]
    pub args: Vec<String>,
    #[serde(default)]
    pub folder: Option<String>,
    #[serde(default)]
    pub port: Option<u16>,
    #[serde(default = "default_port_var")]
    pub port_var: String,
    /// Bind to the folder's socket path instead of a TCP port.
    #[serde(default)]
    pub socket: bool,
    #[serde(default)]
    pub env: BTreeMap<String, String>,
    #[serde(default)]
    pub startup_deadline_ms: Option<u64>,
}

fn default_port_var() -> String {
    "PORT".to_string()
}

impl FleetConfig {
    pub fn profile(&self, name: &str) -> Option<&ProfileSection> {
        self.profiles.get(name)
    }

    pub fn folder(&self, name: &str) -> Option<&FolderSection> {
        self.folders.get(name)
    }
}

/// `--config` wins, then `$DEVFLEET_CONFIG`, then `./devfleet.toml` if present.
pub fn resolve_config_path(explicit: Option<&Path>) -> Option<PathBuf> {
    if let Some(path) = explicit {
        return Some(path.to_path_buf());
    }
    if let Ok(raw) = std::env::var(CONFIG_ENV) {
        if !raw.trim().is_empty() {
            return Some(PathBuf::from(raw));
        }
    }
    let local = PathBuf::from(CONFIG_FILE_NAME);
    local.is_file().then_some(local)
}

pub fn load_config(config_path: Option<&Path>) -> FleetConfig {
    let Some(path) = config_path else {
        debug!("No config file found, using defaults");
        return FleetConfig::default();
    };

    let contents = match fs::read_to_string(path) {
        Ok(value) => value,
        Err(err) => {
            warn!("Failed to read config file {}: {}", path.display(), err);
            return FleetConfig::default();
        }
    };

    let mut parsed: FleetConfig = match toml::from_str(&contents) {
        Ok(cfg) => cfg,
        Err(err) => {
            warn!("Failed to parse {}: {}", path.display(), err);
            return FleetConfig::default();
        }
    };

    let base = path.parent().unwrap_or_else(|| Path::new("."));
    for (name, folder) in parsed.folders.iter_mut() {
        if folder.path.as_os_str().is_empty() {
            warn!("Folder '{}' has no path; using config directory", name);
            folder.path = base.to_path_buf();
        } else if folder.path.is_relative() {
            folder.path = base.join(&folder.path);
        }
    }

    for (name, profile) in parsed.profiles.iter_mut() {
        profile.servers.retain(|server| {
            let keep = !server.name.trim().is_empty() && !server.command.trim().is_empty();
            if !keep {
                warn!("Profile '{}': server entry without name or command skipped", name);
            }
            keep
        });
    }

    parsed
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    const SAMPLE: &str = r#"
[orchestrator]
auto_intervention = true
stall_threshold_sec = 120

[ports]
max_suggestion_attempts = 20

[providers.codex]
program = "/opt/codex/bin/codex"

[folders.web]
path = "apps/web"
ports = { PORT = 3000 }
knowledge = ["Uses pnpm workspaces"]

[[profiles.dev.servers]]
name = "web"
folder = "web"
command = "pnpm"
args = ["dev"]
port = 3000

[[profiles.dev.servers]]
name = ""
command = "ignored"
"#;

    #[test]
    fn parses_sections_and_resolves_relative_folder_paths() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join(CONFIG_FILE_NAME);
        fs::write(&path, SAMPLE).unwrap();

        let config = load_config(Some(&path));
        assert!(config.orchestrator.auto_intervention);
        assert_eq!(config.orchestrator.stall_threshold_sec, 120);
        assert_eq!(config.orchestrator.max_reprompts, 1);
        assert_eq!(config.ports.max_suggestion_attempts, 20);
        assert_eq!(
            config.providers["codex"].program.as_deref(),
            Some("/opt/codex/bin/codex")
        );

        let web = config.folder("web").unwrap();
        assert_eq!(web.path, temp.path().join("apps/web"));
        assert_eq!(web.ports.get("PORT"), Some(&3000));

        let dev = config.profile("dev").unwrap();
        assert_eq!(dev.servers.len(), 1);
        assert_eq!(dev.servers[0].port_var, "PORT");
    }

    #[test]
    fn invalid_file_falls_back_to_defaults() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join(CONFIG_FILE_NAME);
        fs::write(&path, "[health\ninterval_ms = ").unwrap();

        let config = load_config(Some(&path));
        assert_eq!(config.ports.max_suggestion_attempts, 100);
        assert!(config.profiles.is_empty());
    }

    #[test]
    fn missing_file_falls_back_to_defaults() {
        let config = load_config(Some(Path::new("/nonexistent/devfleet.toml")));
        assert_eq!(config.orchestrator.user, "local");
        assert_eq!(config.runtime.default_profile, "default");
    }

    #[test]
    fn explicit_path_wins() {
        let explicit = PathBuf::from("/tmp/custom.toml");
        assert_eq!(resolve_config_path(Some(&explicit)), Some(explicit));
    }
}
