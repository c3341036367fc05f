//! Port and socket reservations per scope.
//!
//! A candidate port conflicts with any reservation held by another scope
//! sharing the inheritance chain. Since every folder inherits from `Global`,
//! sibling folders see each other's reservations.

use std::collections::BTreeMap;
use std::net::{Ipv4Addr, SocketAddrV4, TcpListener};
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::error::{SupervisorError, SupervisorResult};
use crate::types::{FolderPreferences, Scope};

pub const MIN_PORT: u32 = 1024;
pub const MAX_PORT: u32 = 65535;
pub const DEFAULT_MAX_SUGGESTION_ATTEMPTS: u32 = 100;

/// Answers whether a port can be bound right now.
pub trait PortProbe: Send + Sync {
    fn is_bindable(&self, port: u16) -> bool;
}

/// Binds `127.0.0.1:<port>` and releases it immediately.
#[derive(Debug, Default, Clone, Copy)]
pub struct LoopbackProbe;

impl PortProbe for LoopbackProbe {
    fn is_bindable(&self, port: u16) -> bool {
        TcpListener::bind(SocketAddrV4::new(Ipv4Addr::LOCALHOST, port)).is_ok()
    }
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct Reservation {
    pub scope: Scope,
    pub variable: String,
    pub port: u16,
}

/// Result of checking a scope's socket path.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum SocketState {
    /// No file at the path.
    Free(PathBuf),
    /// A file exists but nothing accepts connections on it.
    Stale(PathBuf),
    /// A live listener answers.
    InUse(PathBuf),
}

impl SocketState {
    pub fn path(&self) -> &Path {
        match self {
            SocketState::Free(path) | SocketState::Stale(path) | SocketState::InUse(path) => path,
        }
    }
}

pub fn validate_port(port: u32) -> SupervisorResult<u16> {
    if (MIN_PORT..=MAX_PORT).contains(&port) {
        Ok(port as u16)
    } else {
        Err(SupervisorError::InvalidPort { port })
    }
}

pub struct PortRegistry {
    reservations: BTreeMap<(Scope, String), u16>,
    probe: Box<dyn PortProbe>,
    max_attempts: u32,
    sockets_dir: PathBuf,
}

impl std::fmt::Debug for PortRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PortRegistry")
            .field("reservations", &self.reservations)
            .field("max_attempts", &self.max_attempts)
            .field("sockets_dir", &self.sockets_dir)
            .finish()
    }
}

impl PortRegistry {
    pub fn new(sockets_dir: impl Into<PathBuf>) -> Self {
        Self::with_probe(sockets_dir, Box::new(LoopbackProbe))
    }

    pub fn with_probe(sockets_dir: impl Into<PathBuf>, probe: Box<dyn PortProbe>) -> Self {
        Self {
            reservations: BTreeMap::new(),
            probe,
            max_attempts: DEFAULT_MAX_SUGGESTION_ATTEMPTS,
            sockets_dir: sockets_dir.into(),
        }
    }

    pub fn with_max_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = max_attempts.max(1);
        self
    }

    /// Reserve `candidate` for `variable` in `scope`.
    ///
    /// Re-reserving the same `(scope, variable)` replaces its previous value.
    pub fn reserve(
        &mut self,
        scope: &Scope,
        variable: &str,
        candidate: u32,
    ) -> SupervisorResult<u16> {
        let port = validate_port(candidate)?;
        let variable = variable.trim();
        if variable.is_empty() {
            return Err(SupervisorError::InvalidRequest(
                "port variable name must not be empty".to_string(),
            ));
        }

        if let Some((other_scope, other_variable)) = self.holder_of(port, scope, variable) {
            let suggested = self.suggest(port, scope, variable);
            warn!(
                scope = %scope,
                variable,
                port,
                other_scope = %other_scope,
                suggested = ?suggested,
                "Port reservation conflict"
            );
            return Err(SupervisorError::Conflict {
                scope: scope.clone(),
                variable: variable.to_string(),
                port,
                other_scope,
                other_variable,
                suggested,
            });
        }

        self.reservations
            .insert((scope.clone(), variable.to_string()), port);
        debug!(scope = %scope, variable, port, "Port reserved");
        Ok(port)
    }

    pub fn release(&mut self, scope: &Scope, variable: &str) -> Option<u16> {
        self.reservations
            .remove(&(scope.clone(), variable.trim().to_string()))
    }

    pub fn reservation(&self, scope: &Scope, variable: &str) -> Option<u16> {
        self.reservations
            .get(&(scope.clone(), variable.to_string()))
            .copied()
    }

    pub fn reservations(&self) -> Vec<Reservation> {
        self.reservations
            .iter()
            .map(|((scope, variable), port)| Reservation {
                scope: scope.clone(),
                variable: variable.clone(),
                port: *port,
            })
            .collect()
    }

    /// Load the port reservations resolved for a folder. Conflicting entries
    /// are skipped and returned; the rest are reserved.
    pub fn seed_from_preferences(
        &mut self,
        scope: &Scope,
        preferences: &FolderPreferences,
    ) -> Vec<SupervisorError> {
        let mut rejected = Vec::new();
        for (variable, port) in &preferences.ports {
            if let Err(err) = self.reserve(scope, variable, u32::from(*port)) {
                rejected.push(err);
            }
        }
        if !rejected.is_empty() {
            info!(
                scope = %scope,
                rejected = rejected.len(),
                "Some configured port reservations were not applied"
            );
        }
        rejected
    }

    /// First holder of `port` other than `(scope, variable)` itself, among
    /// scopes sharing the chain root.
    fn holder_of(&self, port: u16, scope: &Scope, variable: &str) -> Option<(Scope, String)> {
        let chain = scope.chain();
        let root = chain.last();
        self.reservations
            .iter()
            .filter(|((other_scope, other_variable), reserved)| {
                **reserved == port
                    && !(other_scope == scope && other_variable == variable)
                    && other_scope.chain().last() == root
            })
            .map(|((other_scope, other_variable), _)| (other_scope.clone(), other_variable.clone()))
            .next()
    }

    /// Linear probe upward from `port + 1`, bounded by the attempt cap.
    fn suggest(&self, port: u16, scope: &Scope, variable: &str) -> Option<u16> {
        let mut candidate = u32::from(port);
        for _ in 0..self.max_attempts {
            candidate += 1;
            if candidate > MAX_PORT {
                return None;
            }
            let next = candidate as u16;
            if self.holder_of(next, scope, variable).is_none() && self.probe.is_bindable(next) {
                return Some(next);
            }
        }
        None
    }

    pub fn socket_path(&self, scope: &Scope) -> PathBuf {
        self.sockets_dir.join(format!("{}.sock", scope.slug()))
    }

    /// Socket paths are fixed per scope and never auto-suggested.
    pub fn reserve_socket(&self, scope: &Scope) -> SocketState {
        let path = self.socket_path(scope);
        if !path.exists() {
            return SocketState::Free(path);
        }
        if socket_accepts(&path) {
            SocketState::InUse(path)
        } else {
            SocketState::Stale(path)
        }
    }

    /// Remove the scope's socket file only when it is stale.
    pub fn remove_stale_socket(&self, scope: &Scope) -> SupervisorResult<bool> {
        match self.reserve_socket(scope) {
            SocketState::Free(_) => Ok(false),
            SocketState::Stale(path) => {
                std::fs::remove_file(&path)
                    .map_err(|err| SupervisorError::io("remove stale socket", err))?;
                info!(path = %path.display(), "Removed stale socket");
                Ok(true)
            }
            SocketState::InUse(path) => Err(SupervisorError::InvalidRequest(format!(
                "socket {} has a live listener",
                path.display()
            ))),
        }
    }
}

#[cfg(unix)]
fn socket_accepts(path: &Path) -> bool {
    std::os::unix::net::UnixStream::connect(path).is_ok()
}

#[cfg(not(unix))]
fn socket_accepts(_path: &Path) -> bool {
    false
}
