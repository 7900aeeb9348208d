//! Transfer Orchestrator
//!
//! Drives every product through the transfer state machine:
//!
//! ```text
//! discovered -> extracting -> extracted -> submitting -> acknowledged -> (released)
//!                    |                          |
//!                    +--------> failed <--------+
//! ```
//!
//! One [`Trawler`] runs a single polling loop. Each cycle asks the
//! [`CompletionDetector`] for ready products, registers new ones as `discovered`, and
//! hands them to a bounded pool of workers. Every transition is persisted before the
//! next step starts, so a restarted trawler resumes where it stopped.
//!
//! Guarantees:
//! - **At-most-once archival.** A submission whose outcome is unknown (timeout, lost
//!   acknowledgement) is never blindly retried: the archive is asked whether it already
//!   holds the product first, and a failed lookup is retried as a lookup.
//! - **No data loss.** Local files are released only after `acknowledged` (with the
//!   archive identifier) has been persisted.
//! - **Isolation.** A failing product is moved to `failed` and marked with a
//!   `<capture_id>.failed` token; the rest of the cycle carries on.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{watch, Semaphore};
use tokio::task::JoinSet;
use tracing::{debug, error, info, info_span, warn, Instrument};

use crate::archive::ArchiveClient;
use crate::config::{ReleaseMode, TrawlerConfig};
use crate::detector::CompletionDetector;
use crate::error::{AppResult, SubmissionError, TrawlerError};
use crate::metadata::{Extraction, Extractor};
use crate::product::{
    capture_dir_regex, Product, CHECKSUM_EXTENSION, COMPLETE_TOKEN, FAILED_EXTENSION,
    METADATA_EXTENSION,
};
use crate::retry::RetryPolicy;
use crate::state::{KeyedLocks, StateRecord, StateStore, TransferState};

/// Runtime settings of the orchestrator.
#[derive(Debug, Clone)]
pub struct TrawlerSettings {
    /// Root of the LOP buffer.
    pub buffer_root: PathBuf,
    /// Quiet period before a product counts as complete.
    pub settle_interval: Duration,
    /// Ceiling for one buffer scan.
    pub scan_timeout: Duration,
    /// Products started per cycle at most.
    pub max_products_per_cycle: usize,
    /// Sleep between cycles.
    pub poll_interval: Duration,
    /// Products processed concurrently.
    pub workers: usize,
    /// Ceiling for extracting one product.
    pub extraction_timeout: Duration,
    /// What happens to acknowledged products.
    pub release: ReleaseMode,
    /// Destination for [`ReleaseMode::Move`].
    pub cold_storage_dir: Option<PathBuf>,
    /// Submission retry budget.
    pub retry: RetryPolicy,
    /// Age after which released records leave the state store.
    pub state_retention: Duration,
}

impl From<&TrawlerConfig> for TrawlerSettings {
    fn from(config: &TrawlerConfig) -> Self {
        Self {
            buffer_root: config.buffer.root.clone(),
            settle_interval: config.buffer.settle_interval,
            scan_timeout: config.buffer.scan_timeout,
            max_products_per_cycle: config.buffer.max_products_per_cycle,
            poll_interval: config.transfer.poll_interval,
            workers: config.transfer.workers,
            extraction_timeout: config.transfer.extraction_timeout,
            release: config.transfer.release,
            cold_storage_dir: config.transfer.cold_storage_dir.clone(),
            retry: RetryPolicy::from(&config.retry),
            state_retention: config.state.retention,
        }
    }
}

/// Counts for one poll cycle (or the resume pass).
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CycleReport {
    /// Products seen for the first time.
    pub discovered: usize,
    /// Products the archive acknowledged in this cycle.
    pub acknowledged: usize,
    /// Products whose local copy was released.
    pub released: usize,
    /// Products moved to `failed`.
    pub failed: usize,
    /// Products left in their state after a transient problem, retried next cycle.
    pub deferred: usize,
    /// Products not started because of the per-cycle cap or a held lock.
    pub skipped: usize,
    /// Completed capture directories removed.
    pub cleaned_dirs: usize,
    /// Released records pruned from the state store.
    pub pruned: usize,
}

impl CycleReport {
    fn absorb(&mut self, outcome: &Outcome) {
        match outcome {
            Outcome::Released { acknowledged } => {
                self.released += 1;
                if *acknowledged {
                    self.acknowledged += 1;
                }
            }
            Outcome::Acknowledged => self.acknowledged += 1,
            Outcome::Failed => self.failed += 1,
            Outcome::Deferred => self.deferred += 1,
            Outcome::Busy => self.skipped += 1,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum Outcome {
    /// Local copy released; `acknowledged` when acknowledgement happened in this run.
    Released { acknowledged: bool },
    /// Acknowledged but the release failed; retried next cycle.
    Acknowledged,
    Failed,
    Deferred,
    Busy,
}

struct Shared {
    settings: TrawlerSettings,
    detector: Arc<CompletionDetector>,
    extractor: Extractor,
    archive: Arc<dyn ArchiveClient>,
    store: Arc<dyn StateStore>,
    locks: KeyedLocks,
    workers: Arc<Semaphore>,
}

/// The transfer orchestrator.
///
/// Cheap to clone; clones share state.
#[derive(Clone)]
pub struct Trawler {
    shared: Arc<Shared>,
}

impl Trawler {
    /// Build a trawler from the loaded configuration.
    pub fn new(
        config: &TrawlerConfig,
        archive: Arc<dyn ArchiveClient>,
        store: Arc<dyn StateStore>,
    ) -> Self {
        Self::with_settings(TrawlerSettings::from(config), archive, store)
    }

    /// Build a trawler from explicit settings.
    pub fn with_settings(
        settings: TrawlerSettings,
        archive: Arc<dyn ArchiveClient>,
        store: Arc<dyn StateStore>,
    ) -> Self {
        let detector = Arc::new(CompletionDetector::new(settings.settle_interval));
        let workers = Arc::new(Semaphore::new(settings.workers.max(1)));
        Self {
            shared: Arc::new(Shared {
                settings,
                detector,
                extractor: Extractor::new(),
                archive,
                store,
                locks: KeyedLocks::new(),
                workers,
            }),
        }
    }

    /// The settings in use.
    pub fn settings(&self) -> &TrawlerSettings {
        &self.shared.settings
    }

    /// Take a first look at the buffer without processing anything.
    ///
    /// Products become ready on a later scan that finds them unchanged, so a single
    /// cycle run right after startup needs this observation first.
    pub async fn observe(&self) {
        let settings = &self.shared.settings;
        let ready = self
            .shared
            .detector
            .list_ready_products_bounded(&settings.buffer_root, settings.scan_timeout)
            .await;
        debug!(ready = ready.len(), "buffer observed");
    }

    /// Resume interrupted work, then poll until `cancel` turns `true`.
    ///
    /// Cancellation is honoured between cycles; a running cycle always finishes.
    pub async fn run(&self, mut cancel: watch::Receiver<bool>) -> AppResult<()> {
        let settings = &self.shared.settings;
        info!(
            root = %settings.buffer_root.display(),
            poll_interval = %humantime::format_duration(settings.poll_interval),
            workers = settings.workers,
            "trawler started"
        );

        let report = self.resume().await?;
        if report != CycleReport::default() {
            info!(?report, "resumed interrupted transfers");
        }

        let mut cycle = 0u64;
        loop {
            if *cancel.borrow() {
                break;
            }
            cycle += 1;
            let report = self
                .run_cycle()
                .instrument(info_span!("cycle", n = cycle))
                .await?;
            if report != CycleReport::default() {
                info!(cycle, ?report, "cycle complete");
            }

            tokio::select! {
                _ = tokio::time::sleep(settings.poll_interval) => {}
                changed = cancel.changed() => {
                    if changed.is_err() || *cancel.borrow() {
                        break;
                    }
                }
            }
        }

        info!("trawler stopped");
        Ok(())
    }

    /// Pick up every product whose last persisted state is not final.
    ///
    /// Covers records left in `discovered`, `extracting`, `extracted` or `submitting`, and
    /// acknowledged products whose local copy was not yet released.
    pub async fn resume(&self) -> AppResult<CycleReport> {
        let mut work = Vec::new();
        let mut report = CycleReport::default();
        for record in self.shared.store.all()? {
            if record.state == TransferState::Failed
                || (record.state == TransferState::Acknowledged && record.released)
            {
                continue;
            }
            match locate(&record) {
                Ok(Some(product)) => work.push((product, record)),
                Ok(None) if record.state == TransferState::Acknowledged => {
                    // Already gone from the buffer
                    let mut record = record;
                    record.released = true;
                    self.shared.store.put(&record)?;
                    report.released += 1;
                }
                Ok(None) => {
                    let mut record = record;
                    let reason = format!(
                        "product {} is no longer in the buffer",
                        record.product_path.display()
                    );
                    fail_record(&self.shared, &mut record, &reason)?;
                    report.failed += 1;
                }
                Err(e) => {
                    warn!(capture_id = %record.capture_id, error = %e, "cannot stat product, deferring");
                    report.deferred += 1;
                }
            }
        }
        let processed = self.process_all(work).await;
        merge(&mut report, processed);
        Ok(report)
    }

    /// Run one poll cycle.
    pub async fn run_cycle(&self) -> AppResult<CycleReport> {
        let shared = &self.shared;
        let settings = &shared.settings;
        let mut report = CycleReport::default();

        let ready = shared
            .detector
            .list_ready_products_bounded(&settings.buffer_root, settings.scan_timeout)
            .await;

        let mut work = Vec::new();
        for product in ready {
            let record = match shared.store.get(&product.capture_id)? {
                None => {
                    let record = StateRecord::discovered(
                        product.capture_id.clone(),
                        product.path.clone(),
                        product.format,
                    );
                    shared.store.put(&record)?;
                    info!(capture_id = %record.capture_id, format = %product.format, "product discovered");
                    report.discovered += 1;
                    record
                }
                Some(record) if record.state == TransferState::Failed => continue,
                Some(record) if record.state == TransferState::Acknowledged && record.released => {
                    warn!(
                        capture_id = %record.capture_id,
                        archive_id = record.archive_id.as_deref().unwrap_or_default(),
                        "released product reappeared in the buffer, ignoring"
                    );
                    continue;
                }
                Some(record) => record,
            };
            work.push((product, record));
        }

        if work.len() > settings.max_products_per_cycle {
            report.skipped += work.len() - settings.max_products_per_cycle;
            work.truncate(settings.max_products_per_cycle);
        }

        let processed = self.process_all(work).await;
        merge(&mut report, processed);

        report.cleaned_dirs = cleanup_completed_dirs(&settings.buffer_root);
        shared.locks.prune();
        let cutoff = chrono::Duration::from_std(settings.state_retention)
            .ok()
            .and_then(|retention| chrono::Utc::now().checked_sub_signed(retention));
        if let Some(cutoff) = cutoff {
            report.pruned = shared.store.prune_released(cutoff)?;
        }
        Ok(report)
    }

    async fn process_all(&self, work: Vec<(Product, StateRecord)>) -> CycleReport {
        let mut report = CycleReport::default();
        let mut tasks = JoinSet::new();
        for (product, record) in work {
            let shared = Arc::clone(&self.shared);
            let span = info_span!("product", capture_id = %product.capture_id);
            tasks.spawn(
                async move {
                    let Ok(_permit) = Arc::clone(&shared.workers).acquire_owned().await else {
                        return Outcome::Deferred;
                    };
                    let capture_id = product.capture_id.clone();
                    match process_product(&shared, product, record).await {
                        Ok(outcome) => outcome,
                        Err(e) => {
                            warn!(capture_id = %capture_id, error = %e, "transfer deferred");
                            Outcome::Deferred
                        }
                    }
                }
                .instrument(span),
            );
        }
        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok(outcome) => report.absorb(&outcome),
                Err(e) => {
                    error!(error = %e, "product worker panicked");
                    report.deferred += 1;
                }
            }
        }
        report
    }
}

fn merge(into: &mut CycleReport, other: CycleReport) {
    into.discovered += other.discovered;
    into.acknowledged += other.acknowledged;
    into.released += other.released;
    into.failed += other.failed;
    into.deferred += other.deferred;
    into.skipped += other.skipped;
    into.cleaned_dirs += other.cleaned_dirs;
    into.pruned += other.pruned;
}

// =============================================================================
// Per-product pipeline
// =============================================================================

async fn process_product(
    shared: &Shared,
    product: Product,
    record: StateRecord,
) -> AppResult<Outcome> {
    let Some(_guard) = shared.locks.try_lock(&product.capture_id) else {
        debug!("product is being processed elsewhere");
        return Ok(Outcome::Busy);
    };
    // Another worker may have moved it on since the cycle started
    let mut record = shared.store.get(&product.capture_id)?.unwrap_or(record);

    match record.state {
        TransferState::Failed => return Ok(Outcome::Failed),
        TransferState::Acknowledged if record.released => {
            return Ok(Outcome::Released {
                acknowledged: false,
            })
        }
        TransferState::Acknowledged => {
            return release_product(shared, &product, &mut record, false);
        }
        _ => {}
    }

    if record.state == TransferState::Discovered {
        transition(shared, &mut record, TransferState::Extracting)?;
    }

    let extraction = match shared
        .extractor
        .extract_bounded(&product, shared.settings.extraction_timeout)
        .await
    {
        Ok(extraction) => extraction,
        Err(e) => {
            error!(capture_id = %product.capture_id, state = %record.state, error = %e, "metadata extraction failed");
            fail_record(shared, &mut record, &e.to_string())?;
            return Ok(Outcome::Failed);
        }
    };
    let digest = extraction.digest();
    extraction.record.write_sidecar(&product.sidecar_path())?;
    if record.metadata_digest.as_deref() != Some(digest.as_str()) {
        if let Some(previous) = &record.metadata_digest {
            warn!(previous = %previous, current = %digest, "metadata changed since last extraction");
        }
        record.metadata_digest = Some(digest.clone());
    }
    if record.state == TransferState::Extracting {
        transition(shared, &mut record, TransferState::Extracted)?;
    }

    if record.state == TransferState::Submitting {
        // The previous run may have reached the archive before stopping
        match reconcile(shared, &record, &digest).await {
            Ok(Some(archive_id)) => {
                acknowledge(shared, &mut record, archive_id)?;
                return release_product(shared, &product, &mut record, true);
            }
            Ok(None) => {}
            Err(e @ TrawlerError::ReconciliationConflict { .. }) => {
                error!(error = %e, "archive holds different content");
                fail_record(shared, &mut record, &e.to_string())?;
                return Ok(Outcome::Failed);
            }
            Err(e) => return Err(e),
        }
    } else {
        transition(shared, &mut record, TransferState::Submitting)?;
    }

    submit_with_retry(shared, &product, &mut record, &extraction).await
}

async fn submit_with_retry(
    shared: &Shared,
    product: &Product,
    record: &mut StateRecord,
    extraction: &Extraction,
) -> AppResult<Outcome> {
    let digest = extraction.digest();
    let mut backoff = shared.settings.retry.backoff();

    loop {
        record.submit_attempts += 1;
        record.updated_at = chrono::Utc::now();
        shared.store.put(record)?;

        let err = match shared.archive.submit(product, &extraction.record).await {
            Ok(receipt) => {
                acknowledge(shared, record, receipt.archive_id)?;
                return release_product(shared, product, record, true);
            }
            Err(err) => err,
        };
        warn!(
            attempt = record.submit_attempts,
            error = %err,
            "submission not acknowledged"
        );

        if matches!(err, SubmissionError::Rejected(_)) {
            fail_record(shared, record, &err.to_string())?;
            return Ok(Outcome::Failed);
        }

        // Duplicate and ambiguous outcomes: ask the archive what it has.
        // No resubmission happens until that question is answered.
        let found = loop {
            match reconcile(shared, record, &digest).await {
                Ok(found) => break found,
                Err(e @ TrawlerError::ReconciliationConflict { .. }) => {
                    error!(error = %e, "archive holds different content");
                    fail_record(shared, record, &e.to_string())?;
                    return Ok(Outcome::Failed);
                }
                Err(e) => {
                    let Some(delay) = backoff.next() else {
                        // Left in `submitting`; the next cycle reconciles first
                        record.last_error = Some(e.to_string());
                        shared.store.put(record)?;
                        return Err(e);
                    };
                    warn!(
                        error = %e,
                        delay = %humantime::format_duration(delay),
                        "archive lookup failed, retrying lookup"
                    );
                    tokio::time::sleep(delay).await;
                }
            }
        };
        match found {
            Some(archive_id) => {
                acknowledge(shared, record, archive_id)?;
                return release_product(shared, product, record, true);
            }
            None if matches!(err, SubmissionError::Duplicate(_)) => {
                let reason = format!("{err}, but it reports no such product");
                fail_record(shared, record, &reason)?;
                return Ok(Outcome::Failed);
            }
            None => {}
        }

        record.last_error = Some(err.to_string());
        match backoff.next() {
            Some(delay) => {
                debug!(delay = %humantime::format_duration(delay), "retrying submission");
                tokio::time::sleep(delay).await;
            }
            None => {
                let reason = format!(
                    "retry budget exhausted after {} attempts: {}",
                    record.submit_attempts, err
                );
                fail_record(shared, record, &reason)?;
                return Ok(Outcome::Failed);
            }
        }
    }
}

/// Archive identifier when the archive already holds this product with `digest`.
async fn reconcile(
    shared: &Shared,
    record: &StateRecord,
    digest: &str,
) -> AppResult<Option<String>> {
    let id = record.capture_id.as_str();
    if !shared.archive.exists(id).await? {
        return Ok(None);
    }
    let Some(archived) = shared.archive.status(id).await? else {
        return Ok(None);
    };
    match archived.metadata_digest {
        Some(archived_digest) if archived_digest != digest => {
            Err(TrawlerError::ReconciliationConflict {
                capture_id: id.to_string(),
                archived_digest,
                local_digest: digest.to_string(),
            })
        }
        _ => {
            info!(archive_id = %archived.archive_id, "archive already holds product");
            Ok(Some(archived.archive_id))
        }
    }
}

fn transition(shared: &Shared, record: &mut StateRecord, next: TransferState) -> AppResult<()> {
    let from = record.state;
    record.transition(next)?;
    shared.store.put(record)?;
    info!(capture_id = %record.capture_id, from = %from, state = %next, "transition");
    Ok(())
}

fn acknowledge(shared: &Shared, record: &mut StateRecord, archive_id: String) -> AppResult<()> {
    record.acknowledge(archive_id)?;
    shared.store.put(record)?;
    info!(
        capture_id = %record.capture_id,
        state = %record.state,
        archive_id = record.archive_id.as_deref().unwrap_or_default(),
        attempts = record.submit_attempts,
        "product acknowledged"
    );
    Ok(())
}

fn fail_record(shared: &Shared, record: &mut StateRecord, reason: &str) -> AppResult<()> {
    let last_state = record.state;
    record.fail(reason)?;
    shared.store.put(record)?;
    error!(
        capture_id = %record.capture_id,
        last_state = %last_state,
        error = %reason,
        "product failed"
    );
    let token = failed_token_path(record);
    if let Err(e) = std::fs::write(&token, format!("{reason}\n")) {
        warn!(token = %token.display(), error = %e, "cannot write failed token");
    }
    Ok(())
}

fn failed_token_path(record: &StateRecord) -> PathBuf {
    record
        .product_path
        .parent()
        .unwrap_or_else(|| Path::new("."))
        .join(format!("{}.{}", record.capture_id, FAILED_EXTENSION))
}

/// Product described by a state record, if its primary file is still present.
fn locate(record: &StateRecord) -> std::io::Result<Option<Product>> {
    if !record.product_path.exists() {
        return Ok(None);
    }
    let product = Product::standalone(&record.product_path)?;
    Ok(product.filter(|p| p.format == record.format))
}

// =============================================================================
// Release
// =============================================================================

fn release_product(
    shared: &Shared,
    product: &Product,
    record: &mut StateRecord,
    acknowledged_now: bool,
) -> AppResult<Outcome> {
    if record.state != TransferState::Acknowledged || record.archive_id.is_none() {
        return Err(TrawlerError::State(format!(
            "refusing to release '{}' in state {}",
            record.capture_id, record.state
        )));
    }

    let settings = &shared.settings;
    // Companions first: a present primary file means the release is incomplete
    let mut files: Vec<&Path> = product.companions.iter().map(PathBuf::as_path).collect();
    files.push(product.path.as_path());

    for file in files {
        let result = match (settings.release, &settings.cold_storage_dir) {
            (ReleaseMode::Move, Some(cold)) => move_to_cold_storage(&settings.buffer_root, cold, file),
            _ => remove_if_present(file),
        };
        if let Err(e) = result {
            warn!(file = %file.display(), error = %e, "release failed, will retry");
            return Ok(if acknowledged_now {
                Outcome::Acknowledged
            } else {
                Outcome::Deferred
            });
        }
    }
    for extra in [product.sidecar_path(), product.checksum_path()] {
        if let Err(e) = remove_if_present(&extra) {
            debug!(file = %extra.display(), error = %e, "cannot remove side file");
        }
    }

    record.released = true;
    record.updated_at = chrono::Utc::now();
    shared.store.put(record)?;
    info!(
        capture_id = %record.capture_id,
        mode = ?settings.release,
        "local copy released"
    );
    Ok(Outcome::Released {
        acknowledged: acknowledged_now,
    })
}

fn remove_if_present(path: &Path) -> std::io::Result<()> {
    match std::fs::remove_file(path) {
        Err(e) if e.kind() != std::io::ErrorKind::NotFound => Err(e),
        _ => Ok(()),
    }
}

fn move_to_cold_storage(buffer_root: &Path, cold: &Path, file: &Path) -> std::io::Result<()> {
    if !file.exists() {
        return Ok(());
    }
    let relative = file
        .strip_prefix(buffer_root)
        .map(Path::to_path_buf)
        .unwrap_or_else(|_| file.file_name().map(PathBuf::from).unwrap_or_default());
    let dest = cold.join(relative);
    if let Some(parent) = dest.parent() {
        std::fs::create_dir_all(parent)?;
    }
    if std::fs::rename(file, &dest).is_err() {
        // Different filesystem
        std::fs::copy(file, &dest)?;
        std::fs::remove_file(file)?;
    }
    Ok(())
}

/// Remove capture directories marked `complete` that hold no product files any more.
fn cleanup_completed_dirs(buffer_root: &Path) -> usize {
    let Ok(entries) = std::fs::read_dir(buffer_root) else {
        return 0;
    };
    let mut removed = 0;
    for entry in entries.flatten() {
        let dir = entry.path();
        let is_capture_dir = entry
            .file_name()
            .to_str()
            .is_some_and(|name| capture_dir_regex().is_match(name));
        if !is_capture_dir || !dir.is_dir() || !dir.join(COMPLETE_TOKEN).is_file() {
            continue;
        }
        if holds_product_files(&dir) {
            continue;
        }
        match std::fs::remove_dir_all(&dir) {
            Ok(()) => {
                info!(dir = %dir.display(), "removed completed capture directory");
                removed += 1;
            }
            Err(e) => warn!(dir = %dir.display(), error = %e, "cannot remove capture directory"),
        }
    }
    removed
}

// Anything except tokens and side-cars counts, including files still being written
fn holds_product_files(dir: &Path) -> bool {
    let Ok(entries) = std::fs::read_dir(dir) else {
        return true;
    };
    for entry in entries.flatten() {
        let path = entry.path();
        if path.is_dir() {
            if holds_product_files(&path) {
                return true;
            }
            continue;
        }
        let name = entry.file_name();
        let name = name.to_string_lossy();
        let is_marker = name == COMPLETE_TOKEN
            || path
                .extension()
                .is_some_and(|ext| {
                    ext == METADATA_EXTENSION || ext == FAILED_EXTENSION || ext == CHECKSUM_EXTENSION
                });
        let is_container = name.ends_with(".h5") || name.ends_with(".rdb");
        if is_container || !is_marker {
            return true;
        }
    }
    false
}
