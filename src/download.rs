//! Capture-block download.
//!
//! Looks up every archived product of a capture block and fetches its files into
//! `DEST/<product_id>/<file name>`. `file://` references are copied, `http(s)://`
//! references are streamed. Files already present in the destination are skipped, so an
//! interrupted download can simply be re-run.

use futures::StreamExt;
use reqwest::Client;
use std::path::{Component, Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tracing::{debug, info, warn};
use url::Url;

use crate::archive::ArchiveClient;
use crate::error::{AppResult, TrawlerError};

/// Where and how to download.
#[derive(Debug, Clone)]
pub struct DownloadOptions {
    /// Destination directory.
    pub dest: PathBuf,
    /// Concurrent fetches.
    pub parallel: usize,
    /// Timeout for establishing an HTTP connection.
    pub connect_timeout: Duration,
    /// Longest wait for the next chunk of a response body.
    pub read_timeout: Duration,
}

/// Summary of a download run.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DownloadReport {
    /// Archived products found for the capture block.
    pub products: usize,
    /// Files fetched in this run.
    pub fetched: usize,
    /// Files already present.
    pub skipped: usize,
    /// Bytes written.
    pub bytes: u64,
    /// `(reference, error)` for every file that could not be fetched.
    pub failed: Vec<(String, String)>,
}

enum Fetched {
    Written(u64),
    Present,
}

/// Fetches archived products to local disk.
pub struct Downloader {
    archive: Arc<dyn ArchiveClient>,
    client: Client,
    options: DownloadOptions,
}

impl Downloader {
    /// Create a downloader.
    pub fn new(archive: Arc<dyn ArchiveClient>, options: DownloadOptions) -> AppResult<Self> {
        let client = Client::builder()
            .connect_timeout(options.connect_timeout)
            .user_agent(concat!("mtpa-trawler/", env!("CARGO_PKG_VERSION")))
            .build()
            .map_err(|e| TrawlerError::Configuration(format!("HTTP client: {e}")))?;
        Ok(Self {
            archive,
            client,
            options,
        })
    }

    /// Download every product of `capture_block_id`.
    ///
    /// Errors only when the archive lookup fails; per-file failures are collected in
    /// [`DownloadReport::failed`].
    pub async fn download_capture_block(&self, capture_block_id: &str) -> AppResult<DownloadReport> {
        let products = self.archive.find_by_capture_block(capture_block_id).await?;
        let mut report = DownloadReport {
            products: products.len(),
            ..Default::default()
        };
        if products.is_empty() {
            warn!(capture_block_id, "archive holds no products for capture block");
            return Ok(report);
        }

        let permits = Arc::new(Semaphore::new(self.options.parallel.max(1)));
        let mut tasks = JoinSet::new();
        for product in products {
            let Some(dir_name) = safe_file_name(&product.product_id) else {
                warn!(product_id = %product.product_id, "refusing unsafe product identifier");
                for reference in product.datastore_refs {
                    report.failed.push((
                        reference,
                        format!("unsafe product identifier '{}'", product.product_id),
                    ));
                }
                continue;
            };
            let product_dir = self.options.dest.join(dir_name);
            for reference in product.datastore_refs {
                let client = self.client.clone();
                let permits = Arc::clone(&permits);
                let product_dir = product_dir.clone();
                let read_timeout = self.options.read_timeout;
                tasks.spawn(async move {
                    let _permit = permits.acquire_owned().await;
                    let result = fetch(&client, &reference, &product_dir, read_timeout).await;
                    (reference, result)
                });
            }
        }

        while let Some(joined) = tasks.join_next().await {
            let (reference, result) = joined?;
            match result {
                Ok(Fetched::Written(bytes)) => {
                    report.fetched += 1;
                    report.bytes += bytes;
                }
                Ok(Fetched::Present) => report.skipped += 1,
                Err(e) => {
                    warn!(reference = %reference, error = %e, "download failed");
                    report.failed.push((reference, e.to_string()));
                }
            }
        }
        report.failed.sort();

        info!(
            capture_block_id,
            products = report.products,
            fetched = report.fetched,
            skipped = report.skipped,
            failed = report.failed.len(),
            "download finished"
        );
        Ok(report)
    }
}

/// `name` when it is a single plain path component that stays inside its parent.
fn safe_file_name(name: &str) -> Option<&str> {
    let mut components = Path::new(name).components();
    match (components.next(), components.next()) {
        (Some(Component::Normal(_)), None) if !name.contains(['/', '\\']) => Some(name),
        _ => None,
    }
}

async fn fetch(
    client: &Client,
    reference: &str,
    product_dir: &Path,
    read_timeout: Duration,
) -> AppResult<Fetched> {
    let url = Url::parse(reference)
        .map_err(|e| TrawlerError::Configuration(format!("invalid reference '{reference}': {e}")))?;
    let name = url
        .path_segments()
        .and_then(|mut segments| segments.next_back())
        .and_then(safe_file_name)
        .ok_or_else(|| {
            TrawlerError::Configuration(format!("reference '{reference}' names no usable file"))
        })?
        .to_string();
    let target = product_dir.join(&name);
    if tokio::fs::try_exists(&target).await? {
        debug!(file = %target.display(), "already downloaded");
        return Ok(Fetched::Present);
    }
    tokio::fs::create_dir_all(product_dir).await?;

    // Partial downloads never take the final name
    let partial = product_dir.join(format!(".{name}.part"));
    let written = match url.scheme() {
        "file" => {
            let source = url.to_file_path().map_err(|_| {
                TrawlerError::Configuration(format!("reference '{reference}' is not a local path"))
            })?;
            tokio::fs::copy(&source, &partial).await?
        }
        "http" | "https" => stream_to(client, url, &partial, read_timeout).await?,
        other => {
            return Err(TrawlerError::Configuration(format!(
                "unsupported reference scheme '{other}'"
            )))
        }
    };
    tokio::fs::rename(&partial, &target).await?;
    debug!(file = %target.display(), bytes = written, "downloaded");
    Ok(Fetched::Written(written))
}

async fn stream_to(
    client: &Client,
    url: Url,
    partial: &Path,
    read_timeout: Duration,
) -> AppResult<u64> {
    let stalled = || {
        TrawlerError::TransientIo(format!(
            "no data for {}",
            humantime::format_duration(read_timeout)
        ))
    };
    let response = tokio::time::timeout(read_timeout, client.get(url).send())
        .await
        .map_err(|_| stalled())?
        .and_then(|r| r.error_for_status())
        .map_err(|e| TrawlerError::TransientIo(e.to_string()))?;
    let mut file = tokio::fs::File::create(partial).await?;
    let mut body = response.bytes_stream();
    let mut written = 0u64;
    while let Some(chunk) = tokio::time::timeout(read_timeout, body.next())
        .await
        .map_err(|_| stalled())?
    {
        let chunk = chunk.map_err(|e| TrawlerError::TransientIo(e.to_string()))?;
        file.write_all(&chunk).await?;
        written += chunk.len() as u64;
    }
    file.flush().await?;
    Ok(written)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::archive::{ArchivedProduct, InMemoryArchive};

    fn archived(product_id: &str, refs: Vec<String>) -> ArchivedProduct {
        ArchivedProduct {
            product_id: product_id.to_string(),
            archive_id: format!("mtpa-{product_id}"),
            product_type: "MeerKATTelescopeProduct".to_string(),
            status: "archived".to_string(),
            metadata_digest: None,
            datastore_refs: refs,
        }
    }

    fn options(dest: &Path) -> DownloadOptions {
        DownloadOptions {
            dest: dest.to_path_buf(),
            parallel: 2,
            connect_timeout: Duration::from_secs(1),
            read_timeout: Duration::from_secs(1),
        }
    }

    #[tokio::test]
    async fn copies_file_references_and_skips_existing() {
        let store = tempfile::tempdir().unwrap();
        let dest = tempfile::tempdir().unwrap();
        let lite = store.path().join("1555862422_sdp_l0.rdb");
        let full = store.path().join("1555862422_sdp_l0.full.rdb");
        std::fs::write(&lite, b"lite").unwrap();
        std::fs::write(&full, b"full dump").unwrap();

        let archive = Arc::new(InMemoryArchive::new());
        archive.insert(archived(
            "1555862422_sdp_l0",
            vec![
                format!("file://{}", lite.display()),
                format!("file://{}", full.display()),
            ],
        ));
        archive.insert(archived("1555862499_sdp_l0", vec![]));

        let downloader = Downloader::new(archive, options(dest.path())).unwrap();
        let report = downloader.download_capture_block("1555862422").await.unwrap();
        assert_eq!(report.products, 1);
        assert_eq!(report.fetched, 2);
        assert_eq!(report.bytes, 13);
        assert!(report.failed.is_empty());
        let copied = dest.path().join("1555862422_sdp_l0").join("1555862422_sdp_l0.full.rdb");
        assert_eq!(std::fs::read(copied).unwrap(), b"full dump");

        let again = downloader.download_capture_block("1555862422").await.unwrap();
        assert_eq!(again.fetched, 0);
        assert_eq!(again.skipped, 2);
    }

    #[tokio::test]
    async fn bad_references_are_reported_not_fatal() {
        let dest = tempfile::tempdir().unwrap();
        let archive = Arc::new(InMemoryArchive::new());
        archive.insert(archived(
            "1555862422_sdp_l0",
            vec![
                "s3://bucket/1555862422_sdp_l0.rdb".to_string(),
                "file:///nonexistent/1555862422_sdp_l0.full.rdb".to_string(),
            ],
        ));

        let downloader = Downloader::new(archive, options(dest.path())).unwrap();
        let report = downloader.download_capture_block("1555862422").await.unwrap();
        assert_eq!(report.fetched, 0);
        assert_eq!(report.failed.len(), 2);
        assert!(report.failed.iter().any(|(_, e)| e.contains("unsupported reference scheme")));
    }

    #[test]
    fn only_plain_names_are_safe() {
        assert_eq!(safe_file_name("1555862422_sdp_l0"), Some("1555862422_sdp_l0"));
        for name in ["", ".", "..", "/etc", "a/b", "a\\b", "1555862422_../../x"] {
            assert_eq!(safe_file_name(name), None, "{name}");
        }
    }

    #[tokio::test]
    async fn product_ids_cannot_escape_destination() {
        let store = tempfile::tempdir().unwrap();
        let dest = tempfile::tempdir().unwrap();
        let file = store.path().join("1555862422_sdp_l0.rdb");
        std::fs::write(&file, b"lite").unwrap();
        let archive = Arc::new(InMemoryArchive::new());
        archive.insert(archived(
            "1555862422_../../escaped",
            vec![format!("file://{}", file.display())],
        ));

        let downloader = Downloader::new(archive, options(dest.path())).unwrap();
        let report = downloader.download_capture_block("1555862422").await.unwrap();
        assert_eq!(report.products, 1);
        assert_eq!(report.fetched, 0);
        assert_eq!(report.failed.len(), 1);
        assert!(report.failed[0].1.contains("unsafe product identifier"));
        assert!(!dest.path().parent().unwrap().join("escaped").exists());
    }

    #[tokio::test]
    async fn unknown_capture_block_downloads_nothing() {
        let dest = tempfile::tempdir().unwrap();
        let downloader =
            Downloader::new(Arc::new(InMemoryArchive::new()), options(dest.path())).unwrap();
        let report = downloader.download_capture_block("1555862422").await.unwrap();
        assert_eq!(report, DownloadReport::default());
    }
}
