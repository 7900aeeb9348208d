//! Integration tests for the transfer pipeline: detector → extractor → orchestrator →
//! archive, against the in-memory archive.

mod common;

use common::{fast_settings, sdp_entries, write_corrupt_product, write_rdb_product};
use mtpa_trawler::archive::{ArchivedProduct, InMemoryArchive};
use mtpa_trawler::error::AppResult;
use mtpa_trawler::metadata::Extractor;
use mtpa_trawler::product::{CaptureId, Product};
use mtpa_trawler::state::{InMemoryStateStore, JsonStateStore, StateRecord, StateStore, TransferState};
use mtpa_trawler::Trawler;
use chrono::{DateTime, Utc};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

const CBID: &str = "1555862422";
const PRODUCT_ID: &str = "1555862422_sdp_l0";

fn record_of(store: &dyn StateStore, id: &str) -> StateRecord {
    store
        .get(&CaptureId::new(id))
        .expect("store readable")
        .expect("record exists")
}

/// A record left behind by a trawler that stopped while submitting.
fn interrupted_record(path: &Path, digest: String) -> StateRecord {
    let product = Product::standalone(path).expect("stat").expect("product");
    let mut record = StateRecord::discovered(product.capture_id, product.path, product.format);
    for state in [
        TransferState::Extracting,
        TransferState::Extracted,
        TransferState::Submitting,
    ] {
        record.transition(state).expect("valid transition");
    }
    record.metadata_digest = Some(digest);
    record.submit_attempts = 1;
    record
}

fn digest_of(path: &Path) -> String {
    Extractor::new()
        .extract_path(path)
        .expect("fixture extracts")
        .digest()
}

fn archived(digest: Option<String>) -> ArchivedProduct {
    ArchivedProduct {
        product_id: PRODUCT_ID.to_string(),
        archive_id: "mtpa-000042".to_string(),
        product_type: "MeerKATTelescopeProduct".to_string(),
        status: "archived".to_string(),
        metadata_digest: digest,
        datastore_refs: Vec::new(),
    }
}

#[tokio::test]
async fn test_lost_acknowledgement_archives_once() {
    let buffer = tempfile::tempdir().unwrap();
    let path = write_rdb_product(buffer.path(), CBID, "sdp_l0", &sdp_entries(CBID, "sdp_l0"));
    let archive = Arc::new(InMemoryArchive::new());
    archive.drop_next_acks(1);
    let store = Arc::new(InMemoryStateStore::new());
    let trawler = Trawler::with_settings(fast_settings(buffer.path()), archive.clone(), store.clone());

    trawler.observe().await;
    let report = trawler.run_cycle().await.unwrap();

    assert_eq!(report.acknowledged, 1);
    assert_eq!(archive.submit_calls(), 1, "ambiguous outcome must not be resubmitted");
    assert_eq!(archive.products().len(), 1);
    assert_eq!(
        archive.calls(),
        vec![
            format!("submit {PRODUCT_ID}"),
            format!("exists {PRODUCT_ID}"),
            format!("status {PRODUCT_ID}"),
        ]
    );
    let record = record_of(store.as_ref(), PRODUCT_ID);
    assert_eq!(record.state, TransferState::Acknowledged);
    assert_eq!(record.archive_id.as_deref(), Some("mtpa-000001"));
    assert!(!path.exists());
}

#[tokio::test]
async fn test_failed_lookup_after_lost_ack_retries_lookup_not_submit() {
    let buffer = tempfile::tempdir().unwrap();
    write_rdb_product(buffer.path(), CBID, "sdp_l0", &sdp_entries(CBID, "sdp_l0"));
    let archive = Arc::new(InMemoryArchive::new());
    archive.drop_next_acks(1);
    archive.fail_next_lookups(1);
    let store = Arc::new(InMemoryStateStore::new());
    let trawler = Trawler::with_settings(fast_settings(buffer.path()), archive.clone(), store.clone());

    trawler.observe().await;
    let report = trawler.run_cycle().await.unwrap();

    assert_eq!(report.acknowledged, 1);
    assert_eq!(
        archive.calls(),
        vec![
            format!("submit {PRODUCT_ID}"),
            format!("exists {PRODUCT_ID}"),
            format!("exists {PRODUCT_ID}"),
            format!("status {PRODUCT_ID}"),
        ]
    );
    assert_eq!(record_of(store.as_ref(), PRODUCT_ID).archive_id.as_deref(), Some("mtpa-000001"));
}

#[tokio::test]
async fn test_unreachable_lookup_leaves_product_submitting() {
    let buffer = tempfile::tempdir().unwrap();
    let path = write_rdb_product(buffer.path(), CBID, "sdp_l0", &sdp_entries(CBID, "sdp_l0"));
    let archive = Arc::new(InMemoryArchive::new());
    archive.drop_next_acks(1);
    archive.fail_next_lookups(1000);
    let store = Arc::new(InMemoryStateStore::new());
    let trawler = Trawler::with_settings(fast_settings(buffer.path()), archive.clone(), store.clone());

    trawler.observe().await;
    let report = trawler.run_cycle().await.unwrap();

    assert_eq!(report.acknowledged, 0);
    assert_eq!(report.failed, 0);
    assert_eq!(archive.submit_calls(), 1);
    assert_eq!(record_of(store.as_ref(), PRODUCT_ID).state, TransferState::Submitting);
    assert!(path.exists());

    archive.fail_next_lookups(0);
    let report = trawler.run_cycle().await.unwrap();

    assert_eq!(report.acknowledged, 1);
    assert_eq!(archive.submit_calls(), 1, "archive already held the product");
    assert_eq!(record_of(store.as_ref(), PRODUCT_ID).state, TransferState::Acknowledged);
}

#[tokio::test]
async fn test_two_timeouts_then_success() {
    let buffer = tempfile::tempdir().unwrap();
    write_rdb_product(buffer.path(), CBID, "sdp_l0", &sdp_entries(CBID, "sdp_l0"));
    let archive = Arc::new(InMemoryArchive::new());
    archive.fail_next_submits(2);
    let store = Arc::new(InMemoryStateStore::new());
    let trawler = Trawler::with_settings(fast_settings(buffer.path()), archive.clone(), store.clone());

    trawler.observe().await;
    let report = trawler.run_cycle().await.unwrap();

    assert_eq!(report.acknowledged, 1);
    assert_eq!(report.failed, 0);
    assert_eq!(archive.submit_calls(), 3);
    assert_eq!(archive.exists_calls(), 2);
    assert_eq!(archive.products().len(), 1);
    let record = record_of(store.as_ref(), PRODUCT_ID);
    assert_eq!(record.state, TransferState::Acknowledged);
    assert_eq!(record.submit_attempts, 3);
    assert!(record.released);
}

#[tokio::test]
async fn test_restart_in_submitting_checks_archive_before_resubmit() {
    let buffer = tempfile::tempdir().unwrap();
    let path = write_rdb_product(buffer.path(), CBID, "sdp_l0", &sdp_entries(CBID, "sdp_l0"));
    let store = Arc::new(InMemoryStateStore::new());
    store.put(&interrupted_record(&path, digest_of(&path))).unwrap();
    let archive = Arc::new(InMemoryArchive::new());
    let trawler = Trawler::with_settings(fast_settings(buffer.path()), archive.clone(), store.clone());

    let report = trawler.resume().await.unwrap();

    assert_eq!(report.acknowledged, 1);
    let calls = archive.calls();
    let exists_at = calls
        .iter()
        .position(|c| c == &format!("exists {PRODUCT_ID}"))
        .expect("exists was called");
    let submit_at = calls
        .iter()
        .position(|c| c == &format!("submit {PRODUCT_ID}"))
        .expect("submit was called");
    assert!(exists_at < submit_at, "calls out of order: {calls:?}");
    assert_eq!(record_of(store.as_ref(), PRODUCT_ID).submit_attempts, 2);
}

#[tokio::test]
async fn test_restart_after_unrecorded_success_does_not_resubmit() {
    let buffer = tempfile::tempdir().unwrap();
    let path = write_rdb_product(buffer.path(), CBID, "sdp_l0", &sdp_entries(CBID, "sdp_l0"));
    let digest = digest_of(&path);
    let store = Arc::new(InMemoryStateStore::new());
    store.put(&interrupted_record(&path, digest.clone())).unwrap();
    let archive = Arc::new(InMemoryArchive::new());
    archive.insert(archived(Some(digest)));
    let trawler = Trawler::with_settings(fast_settings(buffer.path()), archive.clone(), store.clone());

    trawler.resume().await.unwrap();

    assert_eq!(archive.submit_calls(), 0);
    let record = record_of(store.as_ref(), PRODUCT_ID);
    assert_eq!(record.state, TransferState::Acknowledged);
    assert_eq!(record.archive_id.as_deref(), Some("mtpa-000042"));
    assert!(!path.exists());
}

#[tokio::test]
async fn test_conflicting_archive_content_fails_product() {
    let buffer = tempfile::tempdir().unwrap();
    let path = write_rdb_product(buffer.path(), CBID, "sdp_l0", &sdp_entries(CBID, "sdp_l0"));
    let store = Arc::new(InMemoryStateStore::new());
    store.put(&interrupted_record(&path, digest_of(&path))).unwrap();
    let archive = Arc::new(InMemoryArchive::new());
    archive.insert(archived(Some("0".repeat(64))));
    let trawler = Trawler::with_settings(fast_settings(buffer.path()), archive.clone(), store.clone());

    let report = trawler.resume().await.unwrap();

    assert_eq!(report.failed, 1);
    assert_eq!(archive.submit_calls(), 0);
    assert!(path.exists(), "conflicting product must stay in the buffer");
    let record = record_of(store.as_ref(), PRODUCT_ID);
    assert_eq!(record.state, TransferState::Failed);
    assert!(record.last_error.unwrap().contains("different content"));
    assert!(path.with_file_name(format!("{PRODUCT_ID}.failed")).exists());
}

#[tokio::test]
async fn test_duplicate_with_same_content_is_acknowledged() {
    let buffer = tempfile::tempdir().unwrap();
    let path = write_rdb_product(buffer.path(), CBID, "sdp_l0", &sdp_entries(CBID, "sdp_l0"));
    let archive = Arc::new(InMemoryArchive::new());
    archive.insert(archived(Some(digest_of(&path))));
    let store = Arc::new(InMemoryStateStore::new());
    let trawler = Trawler::with_settings(fast_settings(buffer.path()), archive.clone(), store.clone());

    trawler.observe().await;
    let report = trawler.run_cycle().await.unwrap();

    assert_eq!(report.acknowledged, 1);
    assert_eq!(archive.submit_calls(), 1);
    assert_eq!(archive.products().len(), 1);
    assert_eq!(
        record_of(store.as_ref(), PRODUCT_ID).archive_id.as_deref(),
        Some("mtpa-000042")
    );
}

#[tokio::test]
async fn test_failed_product_does_not_block_others() {
    let buffer = tempfile::tempdir().unwrap();
    let corrupt = write_corrupt_product(buffer.path(), CBID, "sdp_l1_flags");
    let good = write_rdb_product(buffer.path(), CBID, "sdp_l0", &sdp_entries(CBID, "sdp_l0"));
    let other = write_rdb_product(
        buffer.path(),
        "1555870000",
        "sdp_l0",
        &sdp_entries("1555870000", "sdp_l0"),
    );
    let archive = Arc::new(InMemoryArchive::new());
    let store = Arc::new(InMemoryStateStore::new());
    let trawler = Trawler::with_settings(fast_settings(buffer.path()), archive.clone(), store.clone());

    trawler.observe().await;
    let report = trawler.run_cycle().await.unwrap();

    assert_eq!(report.discovered, 3);
    assert_eq!(report.failed, 1);
    assert_eq!(report.acknowledged, 2);
    assert!(corrupt.exists());
    assert!(!good.exists());
    assert!(!other.exists());
    assert_eq!(
        record_of(store.as_ref(), "1555862422_sdp_l1_flags").state,
        TransferState::Failed
    );

    // Later cycles leave the failed product alone
    let report = trawler.run_cycle().await.unwrap();
    assert_eq!(report.discovered, 0);
    assert_eq!(archive.submit_calls(), 2);
}

#[tokio::test]
async fn test_rediscovery_is_a_noop() {
    let buffer = tempfile::tempdir().unwrap();
    write_rdb_product(buffer.path(), CBID, "sdp_l0", &sdp_entries(CBID, "sdp_l0"));
    let archive = Arc::new(InMemoryArchive::new());
    archive.reject_next("schema mismatch");
    let store = Arc::new(InMemoryStateStore::new());
    let trawler = Trawler::with_settings(fast_settings(buffer.path()), archive.clone(), store.clone());

    trawler.observe().await;
    trawler.run_cycle().await.unwrap();
    let failed_at = record_of(store.as_ref(), PRODUCT_ID).updated_at;

    // Operator removes the token; the product is seen again but its record is final
    let token = buffer
        .path()
        .join(CBID)
        .join(format!("{PRODUCT_ID}.failed"));
    std::fs::remove_file(token).unwrap();
    let report = trawler.run_cycle().await.unwrap();

    assert_eq!(report.discovered, 0);
    assert_eq!(archive.submit_calls(), 1);
    assert_eq!(record_of(store.as_ref(), PRODUCT_ID).updated_at, failed_at);
}

#[tokio::test]
async fn test_complete_capture_dir_is_cleaned_up() {
    let buffer = tempfile::tempdir().unwrap();
    write_rdb_product(buffer.path(), CBID, "sdp_l0", &sdp_entries(CBID, "sdp_l0"));
    write_rdb_product(buffer.path(), CBID, "sdp_l1", &sdp_entries(CBID, "sdp_l1"));
    let capture_dir = buffer.path().join(CBID);
    let trawler = Trawler::with_settings(
        fast_settings(buffer.path()),
        Arc::new(InMemoryArchive::new()),
        Arc::new(InMemoryStateStore::new()),
    );

    // Not marked complete yet
    trawler.observe().await;
    let report = trawler.run_cycle().await.unwrap();
    assert_eq!(report.released, 2);
    assert_eq!(report.cleaned_dirs, 0);
    assert!(capture_dir.exists());

    std::fs::write(capture_dir.join("complete"), b"").unwrap();
    let report = trawler.run_cycle().await.unwrap();
    assert_eq!(report.cleaned_dirs, 1);
    assert!(!capture_dir.exists());
}

// =============================================================================
// Ordering: release only after the acknowledgement is durable
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct PutEvent {
    state: TransferState,
    released: bool,
    file_present: bool,
}

/// Store that notes whether the product file still existed at every write.
struct ObservingStore {
    inner: InMemoryStateStore,
    watched: PathBuf,
    events: Mutex<Vec<PutEvent>>,
}

impl StateStore for ObservingStore {
    fn get(&self, id: &CaptureId) -> AppResult<Option<StateRecord>> {
        self.inner.get(id)
    }

    fn put(&self, record: &StateRecord) -> AppResult<()> {
        self.events.lock().unwrap().push(PutEvent {
            state: record.state,
            released: record.released,
            file_present: self.watched.exists(),
        });
        self.inner.put(record)
    }

    fn all(&self) -> AppResult<Vec<StateRecord>> {
        self.inner.all()
    }

    fn prune_released(&self, cutoff: DateTime<Utc>) -> AppResult<usize> {
        self.inner.prune_released(cutoff)
    }
}

#[tokio::test]
async fn test_local_copy_released_only_after_acknowledgement_persisted() {
    let buffer = tempfile::tempdir().unwrap();
    let path = write_rdb_product(buffer.path(), CBID, "sdp_l0", &sdp_entries(CBID, "sdp_l0"));
    let store = Arc::new(ObservingStore {
        inner: InMemoryStateStore::new(),
        watched: path.clone(),
        events: Mutex::new(Vec::new()),
    });
    let archive = Arc::new(InMemoryArchive::new());
    archive.fail_next_submits(1);
    let trawler = Trawler::with_settings(fast_settings(buffer.path()), archive, store.clone());

    trawler.observe().await;
    trawler.run_cycle().await.unwrap();

    let events = store.events.lock().unwrap().clone();
    let first_ack = events
        .iter()
        .position(|e| e.state == TransferState::Acknowledged)
        .expect("acknowledgement persisted");
    assert!(
        events[..=first_ack].iter().all(|e| e.file_present),
        "file removed before acknowledgement was persisted: {events:?}"
    );
    assert!(!events[first_ack].released);
    let last = events.last().unwrap();
    assert_eq!(
        *last,
        PutEvent {
            state: TransferState::Acknowledged,
            released: true,
            file_present: false,
        }
    );
}

#[tokio::test]
async fn test_state_survives_restart() {
    let buffer = tempfile::tempdir().unwrap();
    let state_dir = tempfile::tempdir().unwrap();
    let state_path = state_dir.path().join("trawler-state.json");
    write_rdb_product(buffer.path(), CBID, "sdp_l0", &sdp_entries(CBID, "sdp_l0"));
    write_corrupt_product(buffer.path(), CBID, "sdp_l1_flags");

    {
        let store = Arc::new(JsonStateStore::open(&state_path).unwrap());
        let trawler = Trawler::with_settings(
            fast_settings(buffer.path()),
            Arc::new(InMemoryArchive::new()),
            store,
        );
        trawler.observe().await;
        trawler.run_cycle().await.unwrap();
    }

    let reopened = JsonStateStore::open(&state_path).unwrap();
    let acknowledged = reopened.in_state(TransferState::Acknowledged).unwrap();
    let failed = reopened.in_state(TransferState::Failed).unwrap();
    assert_eq!(acknowledged.len(), 1);
    assert_eq!(acknowledged[0].archive_id.as_deref(), Some("mtpa-000001"));
    assert!(acknowledged[0].released);
    assert_eq!(failed.len(), 1);
    assert!(failed[0].last_error.as_deref().unwrap().contains("corrupt"));
}

#[tokio::test]
async fn test_released_records_leave_state_file_after_retention() {
    let buffer = tempfile::tempdir().unwrap();
    let state_dir = tempfile::tempdir().unwrap();
    let state_path = state_dir.path().join("trawler-state.json");
    write_rdb_product(buffer.path(), CBID, "sdp_l0", &sdp_entries(CBID, "sdp_l0"));
    let store = Arc::new(JsonStateStore::open(&state_path).unwrap());
    let mut settings = fast_settings(buffer.path());
    settings.state_retention = std::time::Duration::ZERO;
    let trawler = Trawler::with_settings(settings, Arc::new(InMemoryArchive::new()), store.clone());

    trawler.observe().await;
    let first = trawler.run_cycle().await.unwrap();
    tokio::time::sleep(std::time::Duration::from_millis(10)).await;
    let second = trawler.run_cycle().await.unwrap();

    assert_eq!(first.released, 1);
    assert_eq!(first.pruned + second.pruned, 1);
    assert!(store.all().unwrap().is_empty());
    let log = std::fs::read_to_string(store.released_log_path()).unwrap();
    assert!(log.contains(PRODUCT_ID));
    assert!(log.contains("mtpa-000001"));
}
