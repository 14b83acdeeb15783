//! Durable stream engine shared by River and Humus.
//!
//! Append-only JSON-line segment files under the bus data directory, one
//! record per line, fsynced before the assigned slot is returned. The
//! retained window is mirrored in memory for pattern-filtered replay; the
//! segment files are the durability source on open. Retention evicts whole
//! segments by age or total size.

use crate::routing::subject_matches;
use crate::status::{ErrorKind, ForestError};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{HashSet, VecDeque};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tokio::sync::{Mutex, Notify};
use tracing::{debug, warn};

const STREAM_TAG: &str = "DurableStream:";
const STREAM_FN_OPEN_TAG: &str = "open():";
const STREAM_FN_APPEND_TAG: &str = "append():";

/// Records per segment file before rolling to a new one.
const SEGMENT_RECORDS: u64 = 4096;

const DEFAULT_MAX_AGE: Duration = Duration::from_secs(7 * 24 * 60 * 60);
const DEFAULT_MAX_BYTES: u64 = 10 * 1024 * 1024 * 1024;
const DEFAULT_ACK_WAIT: Duration = Duration::from_secs(30);

/// Fixed-at-creation stream configuration.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct StreamConfig {
    pub name: String,
    pub subject_filter: String,
    pub max_age: Duration,
    pub max_bytes: u64,
    pub ack_wait: Duration,
    pub replicas: usize,
}

impl StreamConfig {
    pub fn new(name: impl Into<String>, subject_filter: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            subject_filter: subject_filter.into(),
            max_age: DEFAULT_MAX_AGE,
            max_bytes: DEFAULT_MAX_BYTES,
            ack_wait: DEFAULT_ACK_WAIT,
            replicas: 1,
        }
    }
}

/// Identity fields persisted beside the segments; creation is idempotent
/// only when these match.
#[derive(Debug, Serialize, Deserialize, PartialEq, Eq)]
struct StreamIdentity {
    name: String,
    subject_filter: String,
}

/// One record on a durable stream.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct StreamRecord {
    pub slot: u64,
    pub subject: String,
    #[serde(
        serialize_with = "crate::leaf::serialize_payload",
        deserialize_with = "crate::leaf::deserialize_payload"
    )]
    pub payload: Vec<u8>,
    pub timestamp: DateTime<Utc>,
}

struct Segment {
    base_slot: u64,
    path: PathBuf,
    bytes: u64,
    newest: DateTime<Utc>,
}

struct StreamInner {
    next_slot: u64,
    records: VecDeque<Arc<StreamRecord>>,
    segments: Vec<Segment>,
    active: Option<fs::File>,
    active_records: u64,
}

/// File-backed stream with monotonic slots and named durable consumers.
pub struct DurableStream {
    config: StreamConfig,
    dir: PathBuf,
    inner: Mutex<StreamInner>,
    pub(crate) notify: Notify,
    pub(crate) pins: Mutex<HashSet<String>>,
    pub(crate) pin_released: Notify,
}

impl std::fmt::Debug for DurableStream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DurableStream")
            .field("dir", &self.dir)
            .finish_non_exhaustive()
    }
}

impl DurableStream {
    /// Opens (or creates) the stream under `dir`, replaying retained
    /// segments. Opening an existing stream with a matching identity
    /// succeeds; a mismatch is a bus error.
    pub async fn open(dir: impl AsRef<Path>, config: StreamConfig) -> Result<Arc<Self>, ForestError> {
        let dir = dir.as_ref().join(&config.name);
        fs::create_dir_all(dir.join("consumers"))
            .await
            .map_err(|err| {
                ForestError::fail_with_kind(
                    ErrorKind::Bus,
                    format!("unable to create stream directory: {err}"),
                )
            })?;

        let identity = StreamIdentity {
            name: config.name.clone(),
            subject_filter: config.subject_filter.clone(),
        };
        let identity_path = dir.join("stream.json");
        match fs::read_to_string(&identity_path).await {
            Ok(raw) => {
                let existing: StreamIdentity = serde_json::from_str(&raw).map_err(|err| {
                    ForestError::fail_with_kind(
                        ErrorKind::Bus,
                        format!("corrupt stream identity: {err}"),
                    )
                })?;
                if existing != identity {
                    return Err(ForestError::fail_with_kind(
                        ErrorKind::Bus,
                        format!(
                            "stream {:?} exists with different config (filter {:?})",
                            existing.name, existing.subject_filter
                        ),
                    ));
                }
            }
            Err(_) => {
                let raw = serde_json::to_string(&identity).map_err(|err| {
                    ForestError::fail_with_kind(ErrorKind::Internal, err.to_string())
                })?;
                fs::write(&identity_path, raw).await.map_err(|err| {
                    ForestError::fail_with_kind(
                        ErrorKind::Bus,
                        format!("unable to persist stream identity: {err}"),
                    )
                })?;
            }
        }

        let inner = Self::replay_segments(&dir).await?;
        debug!(
            "{STREAM_TAG}{STREAM_FN_OPEN_TAG} {} open at slot {}",
            config.name, inner.next_slot
        );

        Ok(Arc::new(Self {
            config,
            dir,
            inner: Mutex::new(inner),
            notify: Notify::new(),
            pins: Mutex::new(HashSet::new()),
            pin_released: Notify::new(),
        }))
    }

    async fn replay_segments(dir: &Path) -> Result<StreamInner, ForestError> {
        let mut segment_paths: Vec<PathBuf> = Vec::new();
        let mut entries = fs::read_dir(dir).await.map_err(|err| {
            ForestError::fail_with_kind(ErrorKind::Bus, format!("unable to read stream dir: {err}"))
        })?;
        while let Ok(Some(entry)) = entries.next_entry().await {
            let path = entry.path();
            if path.extension().is_some_and(|ext| ext == "log") {
                segment_paths.push(path);
            }
        }
        segment_paths.sort();

        let mut records = VecDeque::new();
        let mut segments = Vec::new();
        let mut next_slot = 1u64;
        for path in segment_paths {
            let raw = fs::read_to_string(&path).await.map_err(|err| {
                ForestError::fail_with_kind(ErrorKind::Bus, format!("unable to read segment: {err}"))
            })?;
            let mut base_slot = None;
            let mut newest = Utc::now();
            for line in raw.lines().filter(|line| !line.trim().is_empty()) {
                match serde_json::from_str::<StreamRecord>(line) {
                    Ok(record) => {
                        base_slot.get_or_insert(record.slot);
                        newest = record.timestamp;
                        next_slot = record.slot + 1;
                        records.push_back(Arc::new(record));
                    }
                    Err(err) => {
                        // A torn tail write is survivable; replay stops there.
                        warn!(
                            "{STREAM_TAG}{STREAM_FN_OPEN_TAG} skipping corrupt line in {}: {err}",
                            path.display()
                        );
                    }
                }
            }
            segments.push(Segment {
                base_slot: base_slot.unwrap_or(next_slot),
                bytes: raw.len() as u64,
                newest,
                path,
            });
        }

        Ok(StreamInner {
            next_slot,
            records,
            segments,
            active: None,
            active_records: 0,
        })
    }

    pub fn config(&self) -> &StreamConfig {
        &self.config
    }

    /// Appends one record; returns its slot after durable commit.
    pub async fn append(&self, subject: &str, payload: &[u8]) -> Result<u64, ForestError> {
        if !subject_matches(&self.config.subject_filter, subject) {
            return Err(ForestError::fail_with_kind(
                ErrorKind::Bus,
                format!(
                    "subject {subject:?} outside stream filter {:?}",
                    self.config.subject_filter
                ),
            ));
        }

        let mut inner = self.inner.lock().await;
        let record = StreamRecord {
            slot: inner.next_slot,
            subject: subject.to_string(),
            payload: payload.to_vec(),
            timestamp: Utc::now(),
        };

        let mut line = serde_json::to_string(&record)
            .map_err(|err| ForestError::fail_with_kind(ErrorKind::Internal, err.to_string()))?;
        line.push('\n');

        if inner.active.is_none() || inner.active_records >= SEGMENT_RECORDS {
            self.roll_segment(&mut inner, record.slot).await?;
        }
        let file = inner.active.as_mut().ok_or_else(|| {
            ForestError::fail_with_kind(ErrorKind::Internal, "active segment missing")
        })?;
        file.write_all(line.as_bytes()).await.map_err(|err| {
            ForestError::fail_with_kind(ErrorKind::Bus, format!("segment write failed: {err}"))
        })?;
        file.sync_data().await.map_err(|err| {
            ForestError::fail_with_kind(ErrorKind::Bus, format!("segment sync failed: {err}"))
        })?;

        let slot = record.slot;
        inner.next_slot = slot + 1;
        inner.active_records += 1;
        if let Some(segment) = inner.segments.last_mut() {
            segment.bytes += line.len() as u64;
            segment.newest = record.timestamp;
        }
        inner.records.push_back(Arc::new(record));

        self.enforce_retention(&mut inner).await;
        drop(inner);
        self.notify.notify_waiters();
        Ok(slot)
    }

    async fn roll_segment(&self, inner: &mut StreamInner, base_slot: u64) -> Result<(), ForestError> {
        if let Some(previous) = inner.active.take() {
            let _ = previous.sync_all().await;
        }
        let path = self.dir.join(format!("{base_slot:020}.log"));
        let file = fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .await
            .map_err(|err| {
                ForestError::fail_with_kind(ErrorKind::Bus, format!("segment open failed: {err}"))
            })?;
        inner.segments.push(Segment {
            base_slot,
            path,
            bytes: 0,
            newest: Utc::now(),
        });
        inner.active = Some(file);
        inner.active_records = 0;
        Ok(())
    }

    /// Evicts whole closed segments that fall outside the age or size bound.
    async fn enforce_retention(&self, inner: &mut StreamInner) {
        let now = Utc::now();
        loop {
            // Never evict the active (last) segment.
            if inner.segments.len() <= 1 {
                return;
            }
            let total_bytes: u64 = inner.segments.iter().map(|segment| segment.bytes).sum();
            let oldest = &inner.segments[0];
            let age = now
                .signed_duration_since(oldest.newest)
                .to_std()
                .unwrap_or_default();
            if total_bytes <= self.config.max_bytes && age <= self.config.max_age {
                return;
            }
            let evicted = inner.segments.remove(0);
            let keep_from = inner
                .segments
                .first()
                .map(|segment| segment.base_slot)
                .unwrap_or(inner.next_slot);
            while inner
                .records
                .front()
                .is_some_and(|record| record.slot < keep_from)
            {
                inner.records.pop_front();
            }
            debug!(
                "{STREAM_TAG}{STREAM_FN_APPEND_TAG} {} evicting segment {}",
                self.config.name, evicted.base_slot
            );
            if let Err(err) = fs::remove_file(&evicted.path).await {
                warn!(
                    "{STREAM_TAG}{STREAM_FN_APPEND_TAG} unable to remove evicted segment: {err}"
                );
            }
        }
    }

    /// First retained record at or after `from` whose subject matches
    /// `pattern`.
    pub(crate) async fn fetch_from(
        &self,
        from: u64,
        pattern: &str,
    ) -> Option<Arc<StreamRecord>> {
        let inner = self.inner.lock().await;
        inner
            .records
            .iter()
            .find(|record| record.slot >= from && subject_matches(pattern, &record.subject))
            .cloned()
    }

    pub(crate) fn consumer_cursor_path(&self, consumer: &str) -> PathBuf {
        self.dir.join("consumers").join(format!("{consumer}.json"))
    }

    /// Last retained slot, for observability and tests.
    pub async fn last_slot(&self) -> u64 {
        self.inner.lock().await.next_slot.saturating_sub(1)
    }
}
