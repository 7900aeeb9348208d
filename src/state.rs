//! Transfer state persistence.
//!
//! Every product the trawler has seen owns one [`StateRecord`]. Records move through the
//! transfer state machine
//!
//! ```text
//! discovered -> extracting -> extracted -> submitting -> acknowledged
//!      \             \             \             \
//!       +-------------+-------------+-------------+--> failed
//! ```
//!
//! and are persisted after every transition so a restarted trawler resumes from the
//! last durable state. `acknowledged` is only ever written together with the archive
//! identifier; the product's local copy is released only after that write succeeds.
//!
//! The store is a single JSON document written atomically (temp file + rename).
//! Released records older than the retention period are moved out of it into an
//! append-only `*.released.jsonl` log, so the live document only holds recent work.

use chrono::{DateTime, Utc};
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use crate::error::{AppResult, TrawlerError};
use crate::product::{CaptureId, ContainerFormat};

/// Position of a product in the transfer state machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransferState {
    /// Seen in the buffer, nothing done yet.
    Discovered,
    /// Metadata extraction in progress.
    Extracting,
    /// Metadata record built and written beside the product.
    Extracted,
    /// Submission to the archive in progress.
    Submitting,
    /// The archive confirmed ingestion. Terminal.
    Acknowledged,
    /// Needs operator attention. Terminal.
    Failed,
}

impl TransferState {
    /// All states in pipeline order.
    pub const ALL: [TransferState; 6] = [
        TransferState::Discovered,
        TransferState::Extracting,
        TransferState::Extracted,
        TransferState::Submitting,
        TransferState::Acknowledged,
        TransferState::Failed,
    ];

    /// Terminal states are never left.
    pub fn is_terminal(self) -> bool {
        matches!(self, TransferState::Acknowledged | TransferState::Failed)
    }

    /// Whether the state machine allows moving from `self` to `next`.
    ///
    /// Self-transitions of the in-flight states are allowed so that interrupted work can
    /// be resumed (a crash during `extracting` re-runs extraction).
    pub fn can_transition_to(self, next: TransferState) -> bool {
        use TransferState::*;
        match (self, next) {
            (Acknowledged, _) | (Failed, _) => false,
            (_, Failed) => true,
            (Discovered, Extracting) => true,
            (Extracting, Extracting) | (Extracting, Extracted) => true,
            (Extracted, Extracting) | (Extracted, Submitting) => true,
            (Submitting, Submitting) | (Submitting, Acknowledged) => true,
            _ => false,
        }
    }

    /// Parse the lowercase name used on the command line and in logs.
    pub fn parse(name: &str) -> Option<Self> {
        Self::ALL
            .into_iter()
            .find(|state| state.as_str() == name.to_ascii_lowercase())
    }

    /// Lowercase name.
    pub fn as_str(self) -> &'static str {
        match self {
            TransferState::Discovered => "discovered",
            TransferState::Extracting => "extracting",
            TransferState::Extracted => "extracted",
            TransferState::Submitting => "submitting",
            TransferState::Acknowledged => "acknowledged",
            TransferState::Failed => "failed",
        }
    }
}

impl fmt::Display for TransferState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Durable transfer record of one product.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StateRecord {
    /// Product this record tracks.
    pub capture_id: CaptureId,
    /// Current transfer state.
    pub state: TransferState,
    /// Primary file of the product in the buffer.
    pub product_path: PathBuf,
    /// Container format of the primary file.
    pub format: ContainerFormat,
    /// Identifier assigned by the archive; set exactly when `state` is `acknowledged`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub archive_id: Option<String>,
    /// SHA-256 of the serialized metadata record, once extracted.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata_digest: Option<String>,
    /// Submissions sent so far, across restarts.
    #[serde(default)]
    pub submit_attempts: u32,
    /// Most recent failure, kept after recovery for diagnosis.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
    /// Local copy deleted or moved after acknowledgement.
    #[serde(default)]
    pub released: bool,
    /// Time of the last persisted change.
    pub updated_at: DateTime<Utc>,
}

impl StateRecord {
    /// A fresh record in `discovered`.
    pub fn discovered(capture_id: CaptureId, product_path: PathBuf, format: ContainerFormat) -> Self {
        Self {
            capture_id,
            state: TransferState::Discovered,
            product_path,
            format,
            archive_id: None,
            metadata_digest: None,
            submit_attempts: 0,
            last_error: None,
            released: false,
            updated_at: Utc::now(),
        }
    }

    /// Move to `next`, enforcing the state machine.
    pub fn transition(&mut self, next: TransferState) -> AppResult<()> {
        if !self.state.can_transition_to(next) {
            return Err(TrawlerError::InvalidTransition {
                capture_id: self.capture_id.to_string(),
                from: self.state,
                to: next,
            });
        }
        self.state = next;
        self.updated_at = Utc::now();
        Ok(())
    }

    /// Enter `acknowledged`, recording the archive identifier in the same step.
    pub fn acknowledge(&mut self, archive_id: impl Into<String>) -> AppResult<()> {
        self.transition(TransferState::Acknowledged)?;
        self.archive_id = Some(archive_id.into());
        self.last_error = None;
        Ok(())
    }

    /// Released and last changed before `cutoff`.
    pub fn is_expired(&self, cutoff: DateTime<Utc>) -> bool {
        self.state == TransferState::Acknowledged && self.released && self.updated_at < cutoff
    }

    /// Enter `failed` with the reason an operator will see.
    pub fn fail(&mut self, reason: impl Into<String>) -> AppResult<()> {
        self.transition(TransferState::Failed)?;
        self.last_error = Some(reason.into());
        Ok(())
    }
}

// =============================================================================
// Store
// =============================================================================

/// Durable map from capture identifier to transfer record.
///
/// `put` must be durable when it returns: the orchestrator relies on it to order the
/// `acknowledged` write before releasing the local copy.
pub trait StateStore: Send + Sync {
    /// Record for `id`, if any.
    fn get(&self, id: &CaptureId) -> AppResult<Option<StateRecord>>;
    /// Insert or replace a record.
    fn put(&self, record: &StateRecord) -> AppResult<()>;
    /// Every record, ordered by capture identifier.
    fn all(&self) -> AppResult<Vec<StateRecord>>;
    /// Drop records that [`StateRecord::is_expired`] at `cutoff`; returns how many.
    fn prune_released(&self, cutoff: DateTime<Utc>) -> AppResult<usize>;

    /// Records currently in `state`.
    fn in_state(&self, state: TransferState) -> AppResult<Vec<StateRecord>> {
        Ok(self
            .all()?
            .into_iter()
            .filter(|record| record.state == state)
            .collect())
    }
}

/// On-disk document layout.
#[derive(Debug, Default, Serialize, Deserialize)]
struct StateDocument {
    version: u32,
    records: BTreeMap<CaptureId, StateRecord>,
}

const STATE_DOCUMENT_VERSION: u32 = 1;

/// JSON file backed store.
///
/// Writers hold the map's write lock across the file write, so the file always
/// reflects a complete snapshot.
pub struct JsonStateStore {
    path: PathBuf,
    records: RwLock<BTreeMap<CaptureId, StateRecord>>,
}

impl JsonStateStore {
    /// Open the store at `path`, creating an empty one when the file does not exist.
    pub fn open(path: impl Into<PathBuf>) -> AppResult<Self> {
        let path = path.into();
        let records = if path.exists() {
            let json = std::fs::read_to_string(&path)?;
            let doc: StateDocument = serde_json::from_str(&json).map_err(|e| {
                TrawlerError::State(format!("cannot parse {}: {}", path.display(), e))
            })?;
            if doc.version != STATE_DOCUMENT_VERSION {
                return Err(TrawlerError::State(format!(
                    "{} has unsupported version {}",
                    path.display(),
                    doc.version
                )));
            }
            doc.records
        } else {
            BTreeMap::new()
        };
        tracing::debug!(path = %path.display(), records = records.len(), "opened state store");
        Ok(Self {
            path,
            records: RwLock::new(records),
        })
    }

    /// Location of the backing file.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Append-only log receiving pruned records.
    pub fn released_log_path(&self) -> PathBuf {
        self.path.with_extension("released.jsonl")
    }

    fn append_released(&self, records: &[&StateRecord]) -> AppResult<()> {
        use std::io::Write;
        let mut lines = String::new();
        for record in records {
            lines.push_str(&serde_json::to_string(record)?);
            lines.push('\n');
        }
        let mut log = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(self.released_log_path())?;
        log.write_all(lines.as_bytes())?;
        log.sync_all()?;
        Ok(())
    }

    fn persist(&self, records: &BTreeMap<CaptureId, StateRecord>) -> AppResult<()> {
        let doc = StateDocumentRef {
            version: STATE_DOCUMENT_VERSION,
            records,
        };
        let json = serde_json::to_string_pretty(&doc)?;

        if let Some(parent) = self.path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)?;
        }
        let tmp = self.path.with_extension("json.tmp");
        {
            use std::io::Write;
            let mut file = std::fs::File::create(&tmp)?;
            file.write_all(json.as_bytes())?;
            file.sync_all()?;
        }
        std::fs::rename(&tmp, &self.path)?;
        Ok(())
    }
}

#[derive(Serialize)]
struct StateDocumentRef<'a> {
    version: u32,
    records: &'a BTreeMap<CaptureId, StateRecord>,
}

impl StateStore for JsonStateStore {
    fn get(&self, id: &CaptureId) -> AppResult<Option<StateRecord>> {
        Ok(self.records.read().get(id).cloned())
    }

    fn put(&self, record: &StateRecord) -> AppResult<()> {
        let mut records = self.records.write();
        let previous = records.insert(record.capture_id.clone(), record.clone());
        if let Err(e) = self.persist(&records) {
            match previous {
                Some(previous) => records.insert(record.capture_id.clone(), previous),
                None => records.remove(&record.capture_id),
            };
            return Err(e);
        }
        Ok(())
    }

    fn all(&self) -> AppResult<Vec<StateRecord>> {
        Ok(self.records.read().values().cloned().collect())
    }

    fn prune_released(&self, cutoff: DateTime<Utc>) -> AppResult<usize> {
        let mut records = self.records.write();
        let expired: Vec<&StateRecord> = records
            .values()
            .filter(|record| record.is_expired(cutoff))
            .collect();
        if expired.is_empty() {
            return Ok(0);
        }
        // Log first: a crash before the rewrite only repeats lines in the log
        self.append_released(&expired)?;
        let ids: Vec<CaptureId> = expired.iter().map(|r| r.capture_id.clone()).collect();
        let removed: Vec<StateRecord> = ids.iter().filter_map(|id| records.remove(id)).collect();
        if let Err(e) = self.persist(&records) {
            for record in removed {
                records.insert(record.capture_id.clone(), record);
            }
            return Err(e);
        }
        tracing::info!(pruned = removed.len(), log = %self.released_log_path().display(), "pruned released records");
        Ok(removed.len())
    }
}

/// Volatile store for tests and one-shot tools.
#[derive(Default)]
pub struct InMemoryStateStore {
    records: RwLock<BTreeMap<CaptureId, StateRecord>>,
}

impl InMemoryStateStore {
    /// An empty store.
    pub fn new() -> Self {
        Self::default()
    }
}

impl StateStore for InMemoryStateStore {
    fn get(&self, id: &CaptureId) -> AppResult<Option<StateRecord>> {
        Ok(self.records.read().get(id).cloned())
    }

    fn put(&self, record: &StateRecord) -> AppResult<()> {
        self.records
            .write()
            .insert(record.capture_id.clone(), record.clone());
        Ok(())
    }

    fn all(&self) -> AppResult<Vec<StateRecord>> {
        Ok(self.records.read().values().cloned().collect())
    }

    fn prune_released(&self, cutoff: DateTime<Utc>) -> AppResult<usize> {
        let mut records = self.records.write();
        let before = records.len();
        records.retain(|_, record| !record.is_expired(cutoff));
        Ok(before - records.len())
    }
}

// =============================================================================
// Per-product locks
// =============================================================================

/// One async mutex per capture identifier, so a product is never worked on twice at once.
#[derive(Default)]
pub struct KeyedLocks {
    locks: Mutex<HashMap<CaptureId, Arc<tokio::sync::Mutex<()>>>>,
}

impl KeyedLocks {
    /// An empty lock table.
    pub fn new() -> Self {
        Self::default()
    }

    /// Try to take the lock for `id` without waiting.
    ///
    /// Returns `None` when another task already holds it.
    pub fn try_lock(&self, id: &CaptureId) -> Option<tokio::sync::OwnedMutexGuard<()>> {
        let lock = self
            .locks
            .lock()
            .entry(id.clone())
            .or_insert_with(|| Arc::new(tokio::sync::Mutex::new(())))
            .clone();
        lock.try_lock_owned().ok()
    }

    /// Drop table entries nobody holds.
    pub fn prune(&self) {
        self.locks
            .lock()
            .retain(|_, lock| Arc::strong_count(lock) > 1);
    }
}
