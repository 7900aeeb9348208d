//! Shared fixtures for the integration tests.

#![allow(dead_code)]

use mtpa_trawler::config::ReleaseMode;
use mtpa_trawler::metadata::rdb::{write_dump, RdbValue};
use mtpa_trawler::retry::RetryPolicy;
use mtpa_trawler::TrawlerSettings;
use serde_json::{json, Value};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Keys of a typical visibility stream dump.
pub fn sdp_entries(cbid: &str, stream: &str) -> BTreeMap<String, Value> {
    let mut entries = BTreeMap::new();
    entries.insert("capture_block_id".to_string(), json!(cbid));
    entries.insert("stream_name".to_string(), json!(stream));
    entries.insert(format!("{stream}_stream_type"), json!("sdp.vis"));
    entries.insert("start_time".to_string(), json!(1_555_862_422.25));
    entries.insert("end_time".to_string(), json!(1_555_866_022.0));
    entries.insert("targets".to_string(), json!(["PKS1934-63", "3C286"]));
    entries.insert("antennas".to_string(), json!(["m000", "m001", "m063"]));
    entries.insert("center_freq".to_string(), json!(1_284_000_000.0));
    entries.insert("bandwidth".to_string(), json!(856_000_000.0));
    entries.insert("n_chans".to_string(), json!(4096));
    entries.insert(
        "obs_params".to_string(),
        json!({
            "observer": "Sharmila",
            "description": "Imaging run",
            "experiment_id": "20190421-0001",
            "script_name": "image.py",
            "proposal_id": "SCI-20190418-SG-01",
        }),
    );
    entries
}

/// Encode `entries` as a record-database dump.
pub fn dump_bytes(entries: &BTreeMap<String, Value>) -> Vec<u8> {
    let encoded: BTreeMap<String, RdbValue> = entries
        .iter()
        .map(|(k, v)| (k.clone(), RdbValue::String(v.to_string().into_bytes())))
        .collect();
    write_dump(&encoded)
}

/// Write `<root>/<cbid>/<cbid>_<stream>.rdb` and its `.full.rdb` companion.
pub fn write_rdb_product(
    root: &Path,
    cbid: &str,
    stream: &str,
    entries: &BTreeMap<String, Value>,
) -> PathBuf {
    let dir = root.join(cbid);
    std::fs::create_dir_all(&dir).expect("create capture dir");
    let bytes = dump_bytes(entries);
    let path = dir.join(format!("{cbid}_{stream}.rdb"));
    std::fs::write(&path, &bytes).expect("write lite dump");
    std::fs::write(dir.join(format!("{cbid}_{stream}.full.rdb")), &bytes).expect("write full dump");
    path
}

/// A product whose dump is truncated.
pub fn write_corrupt_product(root: &Path, cbid: &str, stream: &str) -> PathBuf {
    let dir = root.join(cbid);
    std::fs::create_dir_all(&dir).expect("create capture dir");
    let path = dir.join(format!("{cbid}_{stream}.rdb"));
    std::fs::write(&path, b"REDIS0009\xfa\x09redis-ver").expect("write lite dump");
    std::fs::write(dir.join(format!("{cbid}_{stream}.full.rdb")), b"x").expect("write full dump");
    path
}

/// Orchestrator settings with no settle time and millisecond backoff.
pub fn fast_settings(root: &Path) -> TrawlerSettings {
    TrawlerSettings {
        buffer_root: root.to_path_buf(),
        settle_interval: Duration::ZERO,
        scan_timeout: Duration::from_secs(5),
        max_products_per_cycle: 5000,
        poll_interval: Duration::from_millis(10),
        workers: 4,
        extraction_timeout: Duration::from_secs(10),
        release: ReleaseMode::Delete,
        cold_storage_dir: None,
        retry: RetryPolicy {
            max_attempts: 5,
            initial_backoff: Duration::from_millis(1),
            max_backoff: Duration::from_millis(4),
        },
        state_retention: Duration::from_secs(3600),
    }
}
