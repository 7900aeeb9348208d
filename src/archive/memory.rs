//! In-process archive used by tests and dry runs.

use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::BTreeMap;
use std::time::Duration;

use super::{ArchiveClient, ArchiveReceipt, ArchivedProduct, SubmitRequest};
use crate::error::SubmissionError;
use crate::metadata::MetadataRecord;
use crate::product::Product;

const INJECTED_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Debug, Default)]
struct Inner {
    products: BTreeMap<String, ArchivedProduct>,
    next_id: u64,
    fail_next_submits: u32,
    drop_next_acks: u32,
    fail_next_lookups: u32,
    reject_next: Option<String>,
    submit_calls: u32,
    exists_calls: u32,
    status_calls: u32,
    calls: Vec<String>,
}

/// Archive fake that keeps products in memory.
///
/// Fault injection covers the ambiguous outcomes the orchestrator has to survive:
/// submissions that time out before reaching the archive, and acknowledgements that are
/// lost after the archive recorded the product.
#[derive(Debug, Default)]
pub struct InMemoryArchive {
    inner: Mutex<Inner>,
}

impl InMemoryArchive {
    /// An empty archive.
    pub fn new() -> Self {
        Self::default()
    }

    /// The next `n` submissions time out without being recorded.
    pub fn fail_next_submits(&self, n: u32) {
        self.inner.lock().fail_next_submits = n;
    }

    /// The next `n` submissions are recorded but answered with a timeout.
    pub fn drop_next_acks(&self, n: u32) {
        self.inner.lock().drop_next_acks = n;
    }

    /// The next `n` `exists` lookups fail with a transient error.
    pub fn fail_next_lookups(&self, n: u32) {
        self.inner.lock().fail_next_lookups = n;
    }

    /// The next submission is rejected with `reason`.
    pub fn reject_next(&self, reason: impl Into<String>) {
        self.inner.lock().reject_next = Some(reason.into());
    }

    /// Seed the archive with an already ingested product.
    pub fn insert(&self, product: ArchivedProduct) {
        self.inner
            .lock()
            .products
            .insert(product.product_id.clone(), product);
    }

    /// Every archived product.
    pub fn products(&self) -> Vec<ArchivedProduct> {
        self.inner.lock().products.values().cloned().collect()
    }

    /// Number of `submit` calls so far.
    pub fn submit_calls(&self) -> u32 {
        self.inner.lock().submit_calls
    }

    /// Number of `exists` calls so far.
    pub fn exists_calls(&self) -> u32 {
        self.inner.lock().exists_calls
    }

    /// Number of `status` calls so far.
    pub fn status_calls(&self) -> u32 {
        self.inner.lock().status_calls
    }

    /// Call log as `"<operation> <id>"` entries, oldest first.
    pub fn calls(&self) -> Vec<String> {
        self.inner.lock().calls.clone()
    }
}

#[async_trait]
impl ArchiveClient for InMemoryArchive {
    async fn submit(
        &self,
        product: &Product,
        record: &MetadataRecord,
    ) -> Result<ArchiveReceipt, SubmissionError> {
        let request = SubmitRequest::new(product, record);
        let mut inner = self.inner.lock();
        inner.submit_calls += 1;
        inner.calls.push(format!("submit {}", request.product_id));

        if inner.fail_next_submits > 0 {
            inner.fail_next_submits -= 1;
            return Err(SubmissionError::Timeout(INJECTED_TIMEOUT));
        }
        if let Some(reason) = inner.reject_next.take() {
            return Err(SubmissionError::Rejected(reason));
        }
        if inner.products.contains_key(&request.product_id) {
            return Err(SubmissionError::Duplicate(request.product_id));
        }

        inner.next_id += 1;
        let archive_id = format!("mtpa-{:06}", inner.next_id);
        inner.products.insert(
            request.product_id.clone(),
            ArchivedProduct {
                product_id: request.product_id,
                archive_id: archive_id.clone(),
                product_type: request.product_type,
                status: "archived".to_string(),
                metadata_digest: Some(request.metadata_digest),
                datastore_refs: request.references,
            },
        );

        if inner.drop_next_acks > 0 {
            inner.drop_next_acks -= 1;
            return Err(SubmissionError::Timeout(INJECTED_TIMEOUT));
        }
        Ok(ArchiveReceipt { archive_id })
    }

    async fn exists(&self, product_id: &str) -> Result<bool, SubmissionError> {
        let mut inner = self.inner.lock();
        inner.exists_calls += 1;
        inner.calls.push(format!("exists {product_id}"));
        if inner.fail_next_lookups > 0 {
            inner.fail_next_lookups -= 1;
            return Err(SubmissionError::Transient("lookup unavailable".to_string()));
        }
        Ok(inner.products.contains_key(product_id))
    }

    async fn status(&self, product_id: &str) -> Result<Option<ArchivedProduct>, SubmissionError> {
        let mut inner = self.inner.lock();
        inner.status_calls += 1;
        inner.calls.push(format!("status {product_id}"));
        Ok(inner.products.get(product_id).cloned())
    }

    async fn find_by_capture_block(
        &self,
        capture_block_id: &str,
    ) -> Result<Vec<ArchivedProduct>, SubmissionError> {
        let inner = self.inner.lock();
        Ok(inner
            .products
            .values()
            .filter(|p| {
                p.product_id == capture_block_id
                    || p.product_id
                        .strip_prefix(capture_block_id)
                        .is_some_and(|rest| rest.starts_with(['_', '-']))
            })
            .cloned()
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::product::{CaptureId, ContainerFormat};
    use std::path::PathBuf;
    use std::time::SystemTime;

    fn product(id: &str) -> Product {
        Product {
            capture_id: CaptureId::new(id),
            path: PathBuf::from(format!("/data/{id}/{id}.rdb")),
            companions: Vec::new(),
            size: 1,
            modified: SystemTime::UNIX_EPOCH,
            format: ContainerFormat::RecordDb,
        }
    }

    #[tokio::test]
    async fn duplicate_submission_is_refused() {
        let archive = InMemoryArchive::new();
        let record = MetadataRecord::new();
        let receipt = archive.submit(&product("1555862422_sdp_l0"), &record).await.unwrap();
        assert_eq!(receipt.archive_id, "mtpa-000001");
        let err = archive
            .submit(&product("1555862422_sdp_l0"), &record)
            .await
            .unwrap_err();
        assert!(matches!(err, SubmissionError::Duplicate(_)));
        assert_eq!(archive.products().len(), 1);
    }

    #[tokio::test]
    async fn dropped_ack_still_records() {
        let archive = InMemoryArchive::new();
        archive.drop_next_acks(1);
        let err = archive
            .submit(&product("1555862422_sdp_l0"), &MetadataRecord::new())
            .await
            .unwrap_err();
        assert!(err.is_ambiguous());
        assert!(archive.exists("1555862422_sdp_l0").await.unwrap());
    }

    #[tokio::test]
    async fn lookup_by_capture_block() {
        let archive = InMemoryArchive::new();
        for id in ["1555862422_sdp_l0", "1555862422_sdp_l1_flags", "15558624220_x"] {
            archive.submit(&product(id), &MetadataRecord::new()).await.unwrap();
        }
        let found = archive.find_by_capture_block("1555862422").await.unwrap();
        assert_eq!(found.len(), 2);
    }
}
