//! Runtime directory and marker files.
//!
//! The control surface keeps no in-memory "current daemon" state: the PID,
//! the active profile and the supervised process snapshot live in small files
//! under the runtime directory, written atomically and validated against the
//! live process table on every read.

use std::fs::{self, File, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::thread;
use std::time::{Duration, Instant};

use fs2::FileExt;
use serde::de::DeserializeOwned;
use serde::Serialize;
use tracing::{debug, warn};

#[cfg(target_family = "unix")]
use std::os::unix::fs::{DirBuilderExt, OpenOptionsExt};

use crate::process_utils::{pid_matches, read_proc_stat};

pub const RUNTIME_DIR_ENV: &str = "DEVFLEET_RUNTIME_DIR";
pub const PID_FILE: &str = "devfleetd.pid";
pub const PROFILE_FILE: &str = "devfleetd.profile";
pub const LOCK_FILE: &str = "devfleetd.lock";
pub const SNAPSHOT_FILE: &str = "processes.json";
pub const CONTROL_SOCKET: &str = "devfleetd.sock";

/// Resolve the runtime directory: `$DEVFLEET_RUNTIME_DIR`, else `~/.devfleet/run`.
pub fn default_runtime_dir() -> io::Result<PathBuf> {
    if let Ok(dir) = std::env::var(RUNTIME_DIR_ENV) {
        if !dir.trim().is_empty() {
            return Ok(PathBuf::from(dir));
        }
    }
    let home = std::env::var("HOME")
        .or_else(|_| std::env::var("USERPROFILE"))
        .map_err(|_| {
            io::Error::new(
                io::ErrorKind::NotFound,
                "Neither HOME nor USERPROFILE environment variables are set",
            )
        })?;
    Ok(PathBuf::from(home).join(".devfleet").join("run"))
}

/// PID marker of a running daemon.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PidMarker {
    pub pid: u32,
    pub start_ticks: Option<u64>,
}

impl PidMarker {
    /// Marker for the current process.
    pub fn current() -> Self {
        let pid = std::process::id();
        Self {
            pid,
            start_ticks: read_proc_stat(pid).ok().map(|stat| stat.starttime),
        }
    }

    /// `<pid>\n<start_ticks>\n`; the second line is optional on read.
    pub fn render(&self) -> String {
        match self.start_ticks {
            Some(ticks) => format!("{}\n{}\n", self.pid, ticks),
            None => format!("{}\n", self.pid),
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        let mut lines = raw.lines().map(str::trim).filter(|l| !l.is_empty());
        let pid = lines.next()?.parse::<u32>().ok()?;
        if pid == 0 {
            return None;
        }
        let start_ticks = lines.next().and_then(|l| l.parse::<u64>().ok());
        Some(Self { pid, start_ticks })
    }

    pub fn is_alive(&self) -> bool {
        pid_matches(self.pid, self.start_ticks)
    }
}

/// Handle on the runtime directory.
#[derive(Debug, Clone)]
pub struct RuntimeDir {
    root: PathBuf,
}

impl RuntimeDir {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn path(&self) -> &Path {
        &self.root
    }

    pub fn file(&self, name: &str) -> PathBuf {
        self.root.join(name)
    }

    pub fn logs_dir(&self) -> PathBuf {
        self.root.join("logs")
    }

    pub fn sockets_dir(&self) -> PathBuf {
        self.root.join("sockets")
    }

    pub fn control_socket(&self) -> PathBuf {
        self.file(CONTROL_SOCKET)
    }

    /// Create the directory tree (0700 on unix).
    pub fn ensure(&self) -> io::Result<()> {
        for dir in [self.root.clone(), self.logs_dir(), self.sockets_dir()] {
            create_private_dir(&dir)?;
        }
        Ok(())
    }

    /// Atomically replace `name` with `contents`: temp file, fsync, rename, fsync dir.
    pub fn write_atomic(&self, name: &str, contents: &[u8]) -> io::Result<()> {
        self.ensure()?;
        let final_path = self.file(name);
        let temp_path = self.file(&format!("{}.tmp.{}", name, std::process::id()));

        let mut file = open_private_truncate(&temp_path)?;
        file.write_all(contents)?;
        file.sync_all()?;
        drop(file);

        fs::rename(&temp_path, &final_path)?;

        #[cfg(target_family = "unix")]
        {
            let dir = File::open(&self.root)?;
            dir.sync_all()?;
        }

        Ok(())
    }

    pub fn read_string(&self, name: &str) -> io::Result<Option<String>> {
        match fs::read_to_string(self.file(name)) {
            Ok(raw) => Ok(Some(raw)),
            Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(None),
            Err(err) => Err(err),
        }
    }

    pub fn remove(&self, name: &str) -> io::Result<()> {
        match fs::remove_file(self.file(name)) {
            Ok(()) => Ok(()),
            Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(err) => Err(err),
        }
    }

    pub fn write_json<T: Serialize>(&self, name: &str, value: &T) -> io::Result<()> {
        let bytes = serde_json::to_vec_pretty(value)
            .map_err(|e| io::Error::other(format!("Failed to serialize {}: {}", name, e)))?;
        self.write_atomic(name, &bytes)
    }

    pub fn read_json<T: DeserializeOwned>(&self, name: &str) -> io::Result<Option<T>> {
        let Some(raw) = self.read_string(name)? else {
            return Ok(None);
        };
        serde_json::from_str(&raw).map(Some).map_err(|e| {
            io::Error::new(
                io::ErrorKind::InvalidData,
                format!("Failed to parse {}: {}", name, e),
            )
        })
    }

    pub fn write_pid(&self, marker: &PidMarker) -> io::Result<()> {
        self.write_atomic(PID_FILE, marker.render().as_bytes())
    }

    /// Read the daemon PID marker, clearing it (and the profile marker) when
    /// it points at a dead or reused PID.
    pub fn live_pid(&self) -> io::Result<Option<PidMarker>> {
        let Some(raw) = self.read_string(PID_FILE)? else {
            return Ok(None);
        };
        match PidMarker::parse(&raw) {
            Some(marker) if marker.is_alive() => Ok(Some(marker)),
            Some(marker) => {
                warn!(pid = marker.pid, "Clearing stale daemon pid file");
                self.clear_daemon_markers()?;
                Ok(None)
            }
            None => {
                warn!("Clearing unreadable daemon pid file");
                self.clear_daemon_markers()?;
                Ok(None)
            }
        }
    }

    pub fn write_profile(&self, profile: &str) -> io::Result<()> {
        self.write_atomic(PROFILE_FILE, format!("{}\n", profile.trim()).as_bytes())
    }

    pub fn read_profile(&self) -> io::Result<Option<String>> {
        Ok(self
            .read_string(PROFILE_FILE)?
            .map(|raw| raw.trim().to_string())
            .filter(|raw| !raw.is_empty()))
    }

    pub fn clear_daemon_markers(&self) -> io::Result<()> {
        self.remove(PID_FILE)?;
        self.remove(PROFILE_FILE)?;
        let socket = self.control_socket();
        if socket.exists() {
            let _ = fs::remove_file(socket);
        }
        Ok(())
    }

    /// Take the control lock, waiting at most `wait`.
    pub fn lock(&self, wait: Duration) -> io::Result<ControlLock> {
        self.ensure()?;
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(self.file(LOCK_FILE))?;

        let deadline = Instant::now() + wait;
        loop {
            match file.try_lock_exclusive() {
                Ok(()) => {
                    debug!(path = %self.file(LOCK_FILE).display(), "Control lock acquired");
                    return Ok(ControlLock { file });
                }
                Err(err) if Instant::now() >= deadline => {
                    return Err(io::Error::new(
                        io::ErrorKind::WouldBlock,
                        format!("control lock busy after {}ms: {}", wait.as_millis(), err),
                    ));
                }
                Err(_) => thread::sleep(Duration::from_millis(50)),
            }
        }
    }
}

/// Exclusive advisory lock on the runtime dir; released on drop.
#[derive(Debug)]
pub struct ControlLock {
    file: File,
}

impl Drop for ControlLock {
    fn drop(&mut self) {
        let _ = FileExt::unlock(&self.file);
    }
}

#[cfg(target_family = "unix")]
fn create_private_dir(dir: &Path) -> io::Result<()> {
    fs::DirBuilder::new().mode(0o700).recursive(true).create(dir)
}

#[cfg(not(target_family = "unix"))]
fn create_private_dir(dir: &Path) -> io::Result<()> {
    fs::create_dir_all(dir)
}

#[cfg(target_family = "unix")]
fn open_private_truncate(path: &Path) -> io::Result<File> {
    OpenOptions::new()
        .write(true)
        .create(true)
        .truncate(true)
        .mode(0o600)
        .open(path)
}

#[cfg(not(target_family = "unix"))]
fn open_private_truncate(path: &Path) -> io::Result<File> {
    OpenOptions::new()
        .write(true)
        .create(true)
        .truncate(true)
        .open(path)
}
