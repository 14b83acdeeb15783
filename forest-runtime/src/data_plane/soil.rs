//! Soil: the current-state key/value store with per-key revisions.
//!
//! Compare-and-set is the only concurrency primitive. The in-memory map is
//! backed by a JSON-line journal replayed and compacted on open, so a
//! restarted node resumes with its last durable state.

use crate::routing::key_matches;
use crate::status::{ErrorKind, ForestError};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tokio::sync::{broadcast, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, warn};

const SOIL_TAG: &str = "Soil:";
const SOIL_FN_OPEN_TAG: &str = "open():";
const SOIL_FN_PUT_TAG: &str = "put():";

const JOURNAL_FILE: &str = "SOIL.journal";
const WATCH_CAPACITY: usize = 256;

/// Sentinel expected-revision for an unchecked (last-writer-wins) put.
/// Reserved for the Decomposer.
pub const UNCHECKED_REVISION: i64 = -1;

/// One entry of current state.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct StateEntry {
    pub key: String,
    pub bytes: Vec<u8>,
    pub revision: u64,
}

/// Change notification streamed to watchers.
#[derive(Clone, Debug)]
pub enum SoilEvent {
    Put(StateEntry),
    Delete { key: String },
}

impl SoilEvent {
    fn key(&self) -> &str {
        match self {
            SoilEvent::Put(entry) => &entry.key,
            SoilEvent::Delete { key } => key,
        }
    }
}

/// Watcher contract: invoked once per matching change, in change order.
#[async_trait]
pub trait SoilWatcher: Send + Sync {
    async fn on_change(&self, event: SoilEvent);
}

/// Handle owning a running watch task.
pub struct SoilWatchHandle {
    task: JoinHandle<()>,
}

impl SoilWatchHandle {
    pub async fn stop(self) {
        self.task.abort();
        let _ = self.task.await;
    }
}

#[derive(Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "op")]
enum JournalLine {
    Put {
        key: String,
        #[serde(
            serialize_with = "crate::leaf::serialize_payload",
            deserialize_with = "crate::leaf::deserialize_payload"
        )]
        bytes: Vec<u8>,
        revision: u64,
    },
    Delete {
        key: String,
    },
}

struct SoilInner {
    entries: HashMap<String, StateEntry>,
    journal: fs::File,
}

/// Revisioned key/value store. Mutation flows through the Decomposer; user
/// code writes only via Humus intents.
pub struct Soil {
    journal_path: PathBuf,
    inner: Mutex<SoilInner>,
    watch_tx: broadcast::Sender<SoilEvent>,
}

fn validate_key(key: &str) -> Result<(), ForestError> {
    if key.is_empty()
        || key
            .split('/')
            .any(|token| token.is_empty() || token.contains(char::is_whitespace))
    {
        return Err(ForestError::fail_with_kind(
            ErrorKind::ConfigInvalid,
            format!("invalid state key {key:?}"),
        ));
    }
    Ok(())
}

impl Soil {
    /// Opens the SOIL bucket under the bus data directory, replaying and
    /// compacting the journal.
    pub async fn open(data_dir: impl AsRef<Path>) -> Result<Arc<Self>, ForestError> {
        let dir = data_dir.as_ref();
        fs::create_dir_all(dir).await.map_err(|err| {
            ForestError::fail_with_kind(ErrorKind::Bus, format!("unable to create soil dir: {err}"))
        })?;
        let journal_path = dir.join(JOURNAL_FILE);

        let mut entries: HashMap<String, StateEntry> = HashMap::new();
        if let Ok(raw) = fs::read_to_string(&journal_path).await {
            for line in raw.lines().filter(|line| !line.trim().is_empty()) {
                match serde_json::from_str::<JournalLine>(line) {
                    Ok(JournalLine::Put {
                        key,
                        bytes,
                        revision,
                    }) => {
                        entries.insert(
                            key.clone(),
                            StateEntry {
                                key,
                                bytes,
                                revision,
                            },
                        );
                    }
                    Ok(JournalLine::Delete { key }) => {
                        entries.remove(&key);
                    }
                    Err(err) => {
                        warn!("{SOIL_TAG}{SOIL_FN_OPEN_TAG} skipping corrupt journal line: {err}");
                    }
                }
            }
        }

        // Compact: rewrite only live entries, then swap in atomically.
        let compact_path = dir.join(format!("{JOURNAL_FILE}.compact"));
        let mut compacted = String::new();
        for entry in entries.values() {
            let line = JournalLine::Put {
                key: entry.key.clone(),
                bytes: entry.bytes.clone(),
                revision: entry.revision,
            };
            compacted.push_str(&serde_json::to_string(&line).map_err(|err| {
                ForestError::fail_with_kind(ErrorKind::Internal, err.to_string())
            })?);
            compacted.push('\n');
        }
        fs::write(&compact_path, compacted).await.map_err(|err| {
            ForestError::fail_with_kind(ErrorKind::Bus, format!("journal compaction failed: {err}"))
        })?;
        fs::rename(&compact_path, &journal_path).await.map_err(|err| {
            ForestError::fail_with_kind(ErrorKind::Bus, format!("journal swap failed: {err}"))
        })?;

        let journal = fs::OpenOptions::new()
            .append(true)
            .open(&journal_path)
            .await
            .map_err(|err| {
                ForestError::fail_with_kind(ErrorKind::Bus, format!("journal open failed: {err}"))
            })?;

        debug!(
            "{SOIL_TAG}{SOIL_FN_OPEN_TAG} open with {} entries",
            entries.len()
        );
        let (watch_tx, _) = broadcast::channel(WATCH_CAPACITY);
        Ok(Arc::new(Self {
            journal_path,
            inner: Mutex::new(SoilInner { entries, journal }),
            watch_tx,
        }))
    }

    pub async fn get(&self, key: &str) -> Result<StateEntry, ForestError> {
        let inner = self.inner.lock().await;
        inner.entries.get(key).cloned().ok_or_else(|| {
            ForestError::fail_with_kind(ErrorKind::NotFound, format!("no entry for {key:?}"))
        })
    }

    /// Compare-and-set put.
    ///
    /// `expected_revision = 0` creates (key must not exist); a positive value
    /// must match the current revision; [`UNCHECKED_REVISION`] upserts
    /// last-writer-wins and is reserved for the Decomposer.
    pub async fn put(
        &self,
        key: &str,
        bytes: &[u8],
        expected_revision: i64,
    ) -> Result<u64, ForestError> {
        validate_key(key)?;
        let mut inner = self.inner.lock().await;
        let current = inner.entries.get(key).map(|entry| entry.revision);

        let next_revision = match (expected_revision, current) {
            (UNCHECKED_REVISION, existing) => existing.unwrap_or(0) + 1,
            (0, None) => 1,
            (0, Some(revision)) => {
                return Err(ForestError::fail_with_kind(
                    ErrorKind::RevisionConflict,
                    format!("{key:?} already exists at revision {revision}"),
                ))
            }
            (expected, Some(revision)) if expected as u64 == revision => revision + 1,
            (expected, current) => {
                return Err(ForestError::fail_with_kind(
                    ErrorKind::RevisionConflict,
                    format!(
                        "{key:?} expected revision {expected}, current {current:?}"
                    ),
                ))
            }
        };

        let entry = StateEntry {
            key: key.to_string(),
            bytes: bytes.to_vec(),
            revision: next_revision,
        };
        self.append_journal(
            &mut inner,
            &JournalLine::Put {
                key: entry.key.clone(),
                bytes: entry.bytes.clone(),
                revision: entry.revision,
            },
        )
        .await?;
        inner.entries.insert(entry.key.clone(), entry.clone());
        drop(inner);

        let _ = self.watch_tx.send(SoilEvent::Put(entry));
        Ok(next_revision)
    }

    /// Removes the entry. Idempotent: deleting an absent key succeeds.
    pub async fn delete(&self, key: &str) -> Result<(), ForestError> {
        validate_key(key)?;
        let mut inner = self.inner.lock().await;
        if !inner.entries.contains_key(key) {
            return Ok(());
        }
        self.append_journal(
            &mut inner,
            &JournalLine::Delete {
                key: key.to_string(),
            },
        )
        .await?;
        inner.entries.remove(key);
        drop(inner);

        let _ = self.watch_tx.send(SoilEvent::Delete {
            key: key.to_string(),
        });
        Ok(())
    }

    /// Streams subsequent changes whose key matches `key_pattern` to the
    /// watcher, in change order.
    pub fn watch(
        self: &Arc<Self>,
        key_pattern: &str,
        watcher: Arc<dyn SoilWatcher>,
    ) -> SoilWatchHandle {
        let pattern = key_pattern.to_string();
        let mut receiver = self.watch_tx.subscribe();
        let task = tokio::spawn(async move {
            loop {
                match receiver.recv().await {
                    Ok(event) => {
                        if key_matches(&pattern, event.key()) {
                            watcher.on_change(event).await;
                        }
                    }
                    Err(broadcast::error::RecvError::Lagged(missed)) => {
                        warn!("{SOIL_TAG} watcher on {pattern:?} lagged, missed {missed} events");
                    }
                    Err(broadcast::error::RecvError::Closed) => return,
                }
            }
        });
        SoilWatchHandle { task }
    }

    async fn append_journal(
        &self,
        inner: &mut SoilInner,
        line: &JournalLine,
    ) -> Result<(), ForestError> {
        let mut raw = serde_json::to_string(line)
            .map_err(|err| ForestError::fail_with_kind(ErrorKind::Internal, err.to_string()))?;
        raw.push('\n');
        inner
            .journal
            .write_all(raw.as_bytes())
            .await
            .map_err(|err| {
                ForestError::fail_with_kind(
                    ErrorKind::Bus,
                    format!("journal write to {} failed: {err}", self.journal_path.display()),
                )
            })?;
        inner.journal.sync_data().await.map_err(|err| {
            ForestError::fail_with_kind(
                ErrorKind::Bus,
                format!("{SOIL_TAG}{SOIL_FN_PUT_TAG} journal sync failed: {err}"),
            )
        })
    }
}
