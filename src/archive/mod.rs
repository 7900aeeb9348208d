//! Archive Ingestion Client
//!
//! The trawler talks to the MTPA ingestion service through the [`ArchiveClient`] trait:
//!
//! - [`ArchiveClient::submit`] hands over one product and its metadata record and returns
//!   the archive-assigned identifier once ingestion is confirmed
//! - [`ArchiveClient::exists`] / [`ArchiveClient::status`] look a product up by its
//!   capture identifier, used to reconcile ambiguous submissions
//! - [`ArchiveClient::find_by_capture_block`] lists archived products of a capture block
//!
//! [`HttpArchiveClient`] is the production implementation (JSON over HTTP);
//! [`InMemoryArchive`] is a fake with fault injection for tests and dry runs.

pub mod http;
pub mod memory;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::SubmissionError;
use crate::metadata::MetadataRecord;
use crate::product::Product;

pub use http::HttpArchiveClient;
pub use memory::InMemoryArchive;

/// Confirmation that the archive ingested a product.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ArchiveReceipt {
    /// Identifier assigned by the archive.
    pub archive_id: String,
}

/// What the archive knows about one product.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ArchivedProduct {
    /// Capture identifier the product was submitted under.
    pub product_id: String,
    /// Identifier assigned by the archive.
    pub archive_id: String,
    /// Archive product type, e.g. `MeerKATTelescopeProduct`.
    #[serde(default)]
    pub product_type: String,
    /// Ingestion status reported by the archive, e.g. `"archived"`.
    #[serde(default)]
    pub status: String,
    /// Digest of the metadata record the product was submitted with.
    #[serde(default)]
    pub metadata_digest: Option<String>,
    /// Locations the product's files can be fetched from.
    #[serde(default)]
    pub datastore_refs: Vec<String>,
}

/// Body of a submission.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SubmitRequest {
    /// Capture identifier the product is archived under.
    pub product_id: String,
    /// Archive product type taken from the record.
    pub product_type: String,
    /// The metadata record submitted with the product.
    pub metadata: MetadataRecord,
    /// SHA-256 of the serialized record, used to reconcile ambiguous outcomes.
    pub metadata_digest: String,
    /// `file://` URLs of the product's files in the buffer.
    pub references: Vec<String>,
}

impl SubmitRequest {
    /// Build the submission for `product` described by `record`.
    pub fn new(product: &Product, record: &MetadataRecord) -> Self {
        Self {
            product_id: product.capture_id.to_string(),
            product_type: record.text("ProductType").unwrap_or_default(),
            metadata: record.clone(),
            metadata_digest: record.digest(),
            references: product
                .files()
                .map(|path| format!("file://{}", path.display()))
                .collect(),
        }
    }
}

/// Client for the archive ingestion service.
///
/// Implementations classify failures with [`SubmissionError`]: transient ones may have
/// been applied by the archive and must be reconciled through `exists`/`status` before
/// any retry.
#[async_trait]
pub trait ArchiveClient: Send + Sync {
    /// Submit a product with its metadata record.
    async fn submit(
        &self,
        product: &Product,
        record: &MetadataRecord,
    ) -> Result<ArchiveReceipt, SubmissionError>;

    /// Whether the archive holds a product with this identifier.
    async fn exists(&self, product_id: &str) -> Result<bool, SubmissionError>;

    /// Archive view of a product, `None` if unknown.
    async fn status(&self, product_id: &str) -> Result<Option<ArchivedProduct>, SubmissionError>;

    /// Archived products belonging to a capture block.
    async fn find_by_capture_block(
        &self,
        capture_block_id: &str,
    ) -> Result<Vec<ArchivedProduct>, SubmissionError>;
}
