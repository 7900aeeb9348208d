//! Completion Detector
//!
//! Decides when a product in the LOP buffer is fully written. Upstream writers give no
//! completion signal for individual files, so a product is considered ready once its
//! size and modification time have stayed the same for at least the settle interval.
//!
//! The detector keeps an in-memory table of the first time each product's
//! `(size, mtime)` fingerprint was observed. Any change restarts the clock, and a product
//! is only ever ready on a later scan that sees the same fingerprint again. A product
//! seen for the first time is credited with the age of its mtime, so products that
//! settled while the trawler was down are ready on the second scan instead of waiting a
//! full settle interval. The buffer itself is never modified.

use parking_lot::Mutex;
use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant, SystemTime};
use tracing::{debug, trace, warn};

use crate::product::{capture_dir_regex, Product, DIR_FAILED_TOKEN};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Fingerprint {
    size: u64,
    modified: SystemTime,
}

#[derive(Debug, Clone, Copy)]
struct Observation {
    fingerprint: Fingerprint,
    first_seen: Instant,
}

/// Finds products whose files have stopped changing.
#[derive(Debug)]
pub struct CompletionDetector {
    settle_interval: Duration,
    observations: Mutex<HashMap<PathBuf, Observation>>,
}

impl CompletionDetector {
    /// A detector with the given settle interval.
    pub fn new(settle_interval: Duration) -> Self {
        Self {
            settle_interval,
            observations: Mutex::new(HashMap::new()),
        }
    }

    /// The configured settle interval.
    pub fn settle_interval(&self) -> Duration {
        self.settle_interval
    }

    /// Products under `buffer_root` that are ready for archiving, ordered by path.
    ///
    /// Never fails: an unreadable buffer is logged and yields no products.
    pub fn list_ready_products(&self, buffer_root: &Path) -> Vec<Product> {
        self.scan_at(buffer_root, Instant::now())
    }

    /// [`CompletionDetector::list_ready_products`] on the blocking pool, giving up after
    /// `limit`.
    pub async fn list_ready_products_bounded(
        self: &Arc<Self>,
        buffer_root: &Path,
        limit: Duration,
    ) -> Vec<Product> {
        let detector = Arc::clone(self);
        let root = buffer_root.to_path_buf();
        let task = tokio::task::spawn_blocking(move || detector.list_ready_products(&root));
        match tokio::time::timeout(limit, task).await {
            Ok(Ok(products)) => products,
            Ok(Err(e)) => {
                warn!(root = %buffer_root.display(), error = %e, "buffer scan task failed");
                Vec::new()
            }
            Err(_) => {
                warn!(
                    root = %buffer_root.display(),
                    limit = %humantime::format_duration(limit),
                    "buffer scan timed out"
                );
                Vec::new()
            }
        }
    }

    /// Scan as if the current time were `now`.
    pub fn scan_at(&self, buffer_root: &Path, now: Instant) -> Vec<Product> {
        let candidates = match discover(buffer_root) {
            Ok(candidates) => candidates,
            Err(e) => {
                warn!(root = %buffer_root.display(), error = %e, "buffer unreadable, skipping scan");
                return Vec::new();
            }
        };

        let mut observations = self.observations.lock();
        // Forget products that vanished (released, or moved away by an operator)
        let present: HashSet<&Path> = candidates.iter().map(|p| p.path.as_path()).collect();
        observations.retain(|path, _| present.contains(path.as_path()));

        let mut ready = Vec::new();
        for product in candidates {
            let fingerprint = Fingerprint {
                size: product.size,
                modified: product.modified,
            };
            let Some(entry) = observations.get_mut(&product.path) else {
                trace!(capture_id = %product.capture_id, "product seen for the first time");
                observations.insert(
                    product.path.clone(),
                    Observation {
                        fingerprint,
                        first_seen: backdate(now, product.modified, self.settle_interval),
                    },
                );
                continue;
            };
            if entry.fingerprint != fingerprint {
                trace!(capture_id = %product.capture_id, "product still changing");
                *entry = Observation {
                    fingerprint,
                    first_seen: now,
                };
                continue;
            }
            if now.saturating_duration_since(entry.first_seen) >= self.settle_interval {
                ready.push(product);
            }
        }
        debug!(
            root = %buffer_root.display(),
            tracked = observations.len(),
            ready = ready.len(),
            "buffer scanned"
        );
        ready
    }
}

// A product first seen after a restart counts as stable since its mtime, up to `settle`
fn backdate(now: Instant, modified: SystemTime, settle: Duration) -> Instant {
    let age = SystemTime::now()
        .duration_since(modified)
        .unwrap_or(Duration::ZERO)
        .min(settle);
    now.checked_sub(age).unwrap_or(now)
}

/// Every product currently in the buffer, whether settled or not.
pub fn discover(buffer_root: &Path) -> std::io::Result<Vec<Product>> {
    let mut products = Vec::new();
    for entry in std::fs::read_dir(buffer_root)? {
        let entry = entry?;
        let name = entry.file_name();
        let Some(name) = name.to_str() else {
            continue;
        };
        if !capture_dir_regex().is_match(name) || !entry.file_type()?.is_dir() {
            continue;
        }
        let dir = entry.path();
        if dir.join(DIR_FAILED_TOKEN).exists() {
            debug!(dir = %dir.display(), "capture directory marked failed, skipping");
            continue;
        }
        collect_products(&dir, &mut products);
    }
    products.sort_by(|a, b| a.path.cmp(&b.path));
    Ok(products)
}

// Errors below the capture-directory level only skip the affected entry
fn collect_products(dir: &Path, products: &mut Vec<Product>) {
    let entries = match std::fs::read_dir(dir) {
        Ok(entries) => entries,
        Err(e) => {
            warn!(dir = %dir.display(), error = %e, "cannot read capture directory");
            return;
        }
    };
    for entry in entries.flatten() {
        let path = entry.path();
        match entry.file_type() {
            Ok(ft) if ft.is_dir() => collect_products(&path, products),
            Ok(ft) if ft.is_file() => match Product::from_path(&path) {
                Ok(Some(product)) if product.is_quarantined() => {
                    trace!(capture_id = %product.capture_id, "product has failed token, skipping");
                }
                Ok(Some(product)) => products.push(product),
                Ok(None) => {}
                // Vanished between listing and stat
                Err(e) => trace!(path = %path.display(), error = %e, "skipping entry"),
            },
            _ => {}
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    const SETTLE: Duration = Duration::from_secs(30);

    #[test]
    fn new_product_is_not_ready_on_first_sight() {
        let buffer = tempfile::tempdir().unwrap();
        let dir = buffer.path().join("1402481532");
        fs::create_dir(&dir).unwrap();
        fs::write(dir.join("1402481532.h5"), b"data").unwrap();

        let detector = CompletionDetector::new(SETTLE);
        let t0 = Instant::now();
        assert!(detector.scan_at(buffer.path(), t0).is_empty());
        assert!(detector.scan_at(buffer.path(), t0 + Duration::from_secs(10)).is_empty());
        assert_eq!(detector.scan_at(buffer.path(), t0 + SETTLE).len(), 1);
    }

    #[test]
    fn ignores_foreign_dirs_and_writing_files() {
        let buffer = tempfile::tempdir().unwrap();
        fs::create_dir(buffer.path().join("lost+found")).unwrap();
        fs::write(buffer.path().join("lost+found").join("1.h5"), b"x").unwrap();
        let dir = buffer.path().join("1402481532");
        fs::create_dir(&dir).unwrap();
        fs::write(dir.join("1402481532.writing.h5"), b"x").unwrap();

        assert!(discover(buffer.path()).unwrap().is_empty());
    }

    #[test]
    fn failed_tokens_are_respected() {
        let buffer = tempfile::tempdir().unwrap();
        let quarantined = buffer.path().join("1402481532");
        fs::create_dir(&quarantined).unwrap();
        fs::write(quarantined.join("1402481532.h5"), b"x").unwrap();
        fs::write(quarantined.join("failed"), b"").unwrap();

        let dir = buffer.path().join("1402481533");
        fs::create_dir(&dir).unwrap();
        fs::write(dir.join("1402481533.h5"), b"x").unwrap();
        fs::write(dir.join("1402481533.failed"), b"corrupt").unwrap();
        fs::write(dir.join("1402481534.h5"), b"x").unwrap();

        let found = discover(buffer.path()).unwrap();
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].capture_id.as_str(), "1402481534");
    }

    #[test]
    fn old_product_is_ready_on_second_sight() {
        let buffer = tempfile::tempdir().unwrap();
        let dir = buffer.path().join("1402481532");
        fs::create_dir(&dir).unwrap();
        let path = dir.join("1402481532.h5");
        fs::write(&path, b"data").unwrap();
        let hour_ago = SystemTime::now() - Duration::from_secs(3600);
        fs::File::options()
            .write(true)
            .open(&path)
            .unwrap()
            .set_modified(hour_ago)
            .unwrap();

        let detector = CompletionDetector::new(SETTLE);
        let t0 = Instant::now();
        assert!(detector.scan_at(buffer.path(), t0).is_empty());
        assert_eq!(
            detector
                .scan_at(buffer.path(), t0 + Duration::from_secs(1))
                .len(),
            1
        );
    }

    #[test]
    fn zero_settle_still_needs_a_second_observation() {
        let buffer = tempfile::tempdir().unwrap();
        let dir = buffer.path().join("1402481532");
        fs::create_dir(&dir).unwrap();
        fs::write(dir.join("1402481532.h5"), b"data").unwrap();

        let detector = CompletionDetector::new(Duration::ZERO);
        let t0 = Instant::now();
        assert!(detector.scan_at(buffer.path(), t0).is_empty());
        assert_eq!(detector.scan_at(buffer.path(), t0).len(), 1);
    }

    #[test]
    fn missing_root_yields_nothing() {
        let detector = CompletionDetector::new(SETTLE);
        assert!(detector
            .list_ready_products(Path::new("/nonexistent/lop/buffer"))
            .is_empty());
    }

    #[tokio::test]
    async fn bounded_scan_returns_products() {
        let buffer = tempfile::tempdir().unwrap();
        let dir = buffer.path().join("1402481532");
        fs::create_dir(&dir).unwrap();
        fs::write(dir.join("1402481532.h5"), b"data").unwrap();

        let detector = Arc::new(CompletionDetector::new(Duration::ZERO));
        let first = detector
            .list_ready_products_bounded(buffer.path(), Duration::from_secs(5))
            .await;
        assert!(first.is_empty());
        let ready = detector
            .list_ready_products_bounded(buffer.path(), Duration::from_secs(5))
            .await;
        assert_eq!(ready.len(), 1);
    }
}
