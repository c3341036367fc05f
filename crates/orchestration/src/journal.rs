//! HMAC-chained audit journal.
//!
//! Append-only JSONL file; each line is signed with HMAC-SHA256 over the
//! previous line's hash, so edits, deletions and reordering are detectable.
//! Reopening an existing journal resumes the chain from its last line.

use std::fs::{File, OpenOptions};
use std::io::{BufRead, BufReader, Write};
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use base64::{engine::general_purpose, Engine as _};
use hmac::{Hmac, Mac};
use serde::{Deserialize, Serialize};
use sha2::Sha256;
use thiserror::Error;

use crate::types::AuditEntry;

type HmacSha256 = Hmac<Sha256>;

#[derive(Debug, Error)]
pub enum JournalError {
    #[error("journal I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("journal serialization error: {0}")]
    Serde(#[from] serde_json::Error),
    #[error("invalid journal key")]
    Key,
    #[error("journal line {line} is corrupt: {reason}")]
    Corrupt { line: usize, reason: String },
}

/// One signed journal line.
#[derive(Serialize, Deserialize, Clone, Debug)]
pub struct JournalEntry {
    pub seq: u64,
    pub ts: i64,
    pub action: String,
    pub actor: String,
    pub subject: String,
    pub detail: serde_json::Value,
    pub prev: String,
    pub hash: String,
}

struct ChainState {
    file: File,
    seq: u64,
    last_hash: String,
}

pub struct Journal {
    path: PathBuf,
    key: Vec<u8>,
    state: Mutex<ChainState>,
}

impl std::fmt::Debug for Journal {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Journal").field("path", &self.path).finish()
    }
}

fn sign(
    key: &[u8],
    prev: &str,
    seq: u64,
    ts: i64,
    action: &str,
    actor: &str,
    subject: &str,
    detail: &serde_json::Value,
) -> Result<String, JournalError> {
    let canonical = format!("{}|{}|{}|{}|{}", seq, ts, action, actor, subject);
    let mut mac = HmacSha256::new_from_slice(key).map_err(|_| JournalError::Key)?;
    mac.update(prev.as_bytes());
    mac.update(canonical.as_bytes());
    mac.update(serde_json::to_string(detail)?.as_bytes());
    Ok(general_purpose::STANDARD.encode(mac.finalize().into_bytes()))
}

/// Subject of an audit entry: the most specific record it references.
fn subject_of(entry: &AuditEntry) -> String {
    entry
        .delegation_id
        .as_ref()
        .map(|id| format!("delegation:{}", id))
        .or_else(|| entry.task_id.as_ref().map(|id| format!("task:{}", id)))
        .or_else(|| entry.session_id.as_ref().map(|id| format!("session:{}", id)))
        .or_else(|| {
            entry
                .orchestrator_id
                .as_ref()
                .map(|id| format!("orchestrator:{}", id))
        })
        .unwrap_or_else(|| "-".to_string())
}

impl Journal {
    /// Open or create the journal, resuming the chain from the last entry.
    pub fn open(path: impl AsRef<Path>, key: &[u8]) -> Result<Self, JournalError> {
        if key.is_empty() {
            return Err(JournalError::Key);
        }
        let path = path.as_ref().to_path_buf();

        let mut seq = 0;
        let mut last_hash = String::new();
        if path.exists() {
            let reader = BufReader::new(File::open(&path)?);
            for (index, line) in reader.lines().enumerate() {
                let line = line?;
                if line.trim().is_empty() {
                    continue;
                }
                let entry: JournalEntry =
                    serde_json::from_str(&line).map_err(|err| JournalError::Corrupt {
                        line: index + 1,
                        reason: err.to_string(),
                    })?;
                seq = entry.seq;
                last_hash = entry.hash;
            }
        }

        let file = open_append(&path)?;
        Ok(Self {
            path,
            key: key.to_vec(),
            state: Mutex::new(ChainState {
                file,
                seq,
                last_hash,
            }),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Append an audit entry; returns the new chain hash.
    pub fn append(&self, entry: &AuditEntry) -> Result<String, JournalError> {
        let detail = serde_json::json!({
            "id": entry.id,
            "orchestrator_id": entry.orchestrator_id,
            "task_id": entry.task_id,
            "delegation_id": entry.delegation_id,
            "session_id": entry.session_id,
            "detail": entry.detail,
        });
        self.append_raw(
            &entry.action,
            &entry.actor,
            &subject_of(entry),
            entry.created_at.timestamp(),
            detail,
        )
    }

    fn append_raw(
        &self,
        action: &str,
        actor: &str,
        subject: &str,
        ts: i64,
        detail: serde_json::Value,
    ) -> Result<String, JournalError> {
        let mut state = self
            .state
            .lock()
            .map_err(|_| JournalError::Io(std::io::Error::other("journal lock poisoned")))?;

        let seq = state.seq + 1;
        let hash = sign(
            &self.key,
            &state.last_hash,
            seq,
            ts,
            action,
            actor,
            subject,
            &detail,
        )?;
        let entry = JournalEntry {
            seq,
            ts,
            action: action.to_string(),
            actor: actor.to_string(),
            subject: subject.to_string(),
            detail,
            prev: state.last_hash.clone(),
            hash: hash.clone(),
        };

        let line = serde_json::to_string(&entry)? + "\n";
        state.file.write_all(line.as_bytes())?;
        state.file.sync_data()?;

        state.seq = seq;
        state.last_hash = hash.clone();
        Ok(hash)
    }

    pub fn current_seq(&self) -> u64 {
        self.state.lock().map(|s| s.seq).unwrap_or(0)
    }
}

#[cfg(unix)]
fn open_append(path: &Path) -> std::io::Result<File> {
    use std::os::unix::fs::OpenOptionsExt;
    OpenOptions::new()
        .create(true)
        .append(true)
        .mode(0o600)
        .open(path)
}

#[cfg(not(unix))]
fn open_append(path: &Path) -> std::io::Result<File> {
    OpenOptions::new().create(true).append(true).open(path)
}

/// Offline integrity check of a journal file.
pub struct JournalVerifier {
    key: Vec<u8>,
}

impl JournalVerifier {
    pub fn new(key: &[u8]) -> Self {
        Self { key: key.to_vec() }
    }

    /// `Ok(false)` on the first broken link; I/O and parse errors are returned.
    pub fn verify_file(&self, path: impl AsRef<Path>) -> Result<bool, JournalError> {
        let reader = BufReader::new(File::open(path)?);

        let mut prev_hash = String::new();
        let mut expected_seq = 1u64;

        for line in reader.lines() {
            let line = line?;
            if line.trim().is_empty() {
                continue;
            }
            let entry: JournalEntry = serde_json::from_str(&line)?;

            if entry.seq != expected_seq || entry.prev != prev_hash {
                return Ok(false);
            }
            let expected_hash = sign(
                &self.key,
                &prev_hash,
                entry.seq,
                entry.ts,
                &entry.action,
                &entry.actor,
                &entry.subject,
                &entry.detail,
            )?;
            if entry.hash != expected_hash {
                return Ok(false);
            }

            prev_hash = entry.hash;
            expected_seq += 1;
        }

        Ok(true)
    }
}
