//! JSON-over-HTTP archive client.
//!
//! | Operation | Request | Success |
//! |---|---|---|
//! | submit | `POST {endpoint}/products` | `200`/`201` `{"archive_id": ...}` |
//! | status | `GET {endpoint}/products/{id}` | `200` [`ArchivedProduct`], `404` unknown |
//! | find by capture block | `GET {endpoint}/products?capture_block_id=X` | `200` `[ArchivedProduct]` |
//!
//! Connection failures, timeouts, `429` and `5xx` are transient; `400`/`422` are
//! rejections and `409` reports a duplicate identifier.

use async_trait::async_trait;
use reqwest::{Client, Response, StatusCode};
use serde::de::DeserializeOwned;
use std::future::Future;
use std::time::Duration;
use tracing::{debug, instrument};
use url::Url;

use super::{ArchiveClient, ArchiveReceipt, ArchivedProduct, SubmitRequest};
use crate::config::ArchiveConfig;
use crate::error::{AppResult, SubmissionError, TrawlerError};
use crate::metadata::MetadataRecord;
use crate::product::Product;

// Leeway on top of the per-request timeout before the outer guard fires
const OUTER_TIMEOUT_SLACK: Duration = Duration::from_secs(1);

/// Archive client speaking JSON over HTTP.
#[derive(Debug, Clone)]
pub struct HttpArchiveClient {
    client: Client,
    endpoint: Url,
    request_timeout: Duration,
}

impl HttpArchiveClient {
    /// Create a client for the configured endpoint.
    pub fn new(config: &ArchiveConfig) -> AppResult<Self> {
        let mut endpoint = Url::parse(&config.endpoint).map_err(|e| {
            TrawlerError::Configuration(format!(
                "Invalid archive endpoint '{}': {}",
                config.endpoint, e
            ))
        })?;
        // Url::join drops the last path segment unless it ends in '/'
        if !endpoint.path().ends_with('/') {
            endpoint.set_path(&format!("{}/", endpoint.path()));
        }
        let client = Client::builder()
            .timeout(config.request_timeout)
            .connect_timeout(config.request_timeout)
            .user_agent(concat!("mtpa-trawler/", env!("CARGO_PKG_VERSION")))
            .build()
            .map_err(|e| TrawlerError::Configuration(format!("HTTP client: {e}")))?;
        Ok(Self {
            client,
            endpoint,
            request_timeout: config.request_timeout,
        })
    }

    /// Base URL requests are resolved against.
    pub fn endpoint(&self) -> &Url {
        &self.endpoint
    }

    fn url(&self, path: &str) -> Result<Url, SubmissionError> {
        self.endpoint
            .join(path)
            .map_err(|e| SubmissionError::Rejected(format!("invalid request path '{path}': {e}")))
    }

    fn product_url(&self, product_id: &str) -> Result<Url, SubmissionError> {
        let mut url = self.url("products")?;
        url.path_segments_mut()
            .map_err(|_| SubmissionError::Rejected("endpoint cannot be a base URL".to_string()))?
            .push(product_id);
        Ok(url)
    }

    async fn bounded<F>(&self, request: F) -> Result<Response, SubmissionError>
    where
        F: Future<Output = Result<Response, reqwest::Error>>,
    {
        match tokio::time::timeout(self.request_timeout + OUTER_TIMEOUT_SLACK, request).await {
            Ok(Ok(response)) => Ok(response),
            Ok(Err(e)) => Err(classify_transport(e, self.request_timeout)),
            Err(_) => Err(SubmissionError::Timeout(self.request_timeout)),
        }
    }
}

/// Map a transport-level failure.
fn classify_transport(err: reqwest::Error, timeout: Duration) -> SubmissionError {
    if err.is_timeout() {
        SubmissionError::Timeout(timeout)
    } else if err.is_decode() {
        // The archive answered, but not with what we expected
        SubmissionError::Transient(format!("undecodable archive response: {err}"))
    } else {
        SubmissionError::Transient(err.to_string())
    }
}

/// Map a non-success HTTP status.
pub fn classify_status(status: StatusCode, body: &str, product_id: &str) -> SubmissionError {
    let detail = if body.trim().is_empty() {
        status.to_string()
    } else {
        format!("{status}: {}", body.trim())
    };
    match status {
        StatusCode::CONFLICT => SubmissionError::Duplicate(product_id.to_string()),
        StatusCode::TOO_MANY_REQUESTS | StatusCode::REQUEST_TIMEOUT => {
            SubmissionError::Transient(detail)
        }
        s if s.is_server_error() => SubmissionError::Transient(detail),
        _ => SubmissionError::Rejected(detail),
    }
}

async fn error_for_status(response: Response, product_id: &str) -> SubmissionError {
    let status = response.status();
    let body = response.text().await.unwrap_or_default();
    classify_status(status, &body, product_id)
}

async fn decode<T: DeserializeOwned>(
    response: Response,
    timeout: Duration,
) -> Result<T, SubmissionError> {
    response
        .json::<T>()
        .await
        .map_err(|e| classify_transport(e, timeout))
}

#[async_trait]
impl ArchiveClient for HttpArchiveClient {
    #[instrument(skip_all, fields(capture_id = %product.capture_id))]
    async fn submit(
        &self,
        product: &Product,
        record: &MetadataRecord,
    ) -> Result<ArchiveReceipt, SubmissionError> {
        let body = SubmitRequest::new(product, record);
        let url = self.url("products")?;
        debug!(%url, "submitting product");
        let response = self.bounded(self.client.post(url).json(&body).send()).await?;
        match response.status() {
            StatusCode::OK | StatusCode::CREATED => {
                decode::<ArchiveReceipt>(response, self.request_timeout).await
            }
            _ => Err(error_for_status(response, &body.product_id).await),
        }
    }

    async fn exists(&self, product_id: &str) -> Result<bool, SubmissionError> {
        let response = self
            .bounded(self.client.head(self.product_url(product_id)?).send())
            .await?;
        match response.status() {
            s if s.is_success() => Ok(true),
            StatusCode::NOT_FOUND => Ok(false),
            _ => Err(error_for_status(response, product_id).await),
        }
    }

    async fn status(&self, product_id: &str) -> Result<Option<ArchivedProduct>, SubmissionError> {
        let response = self
            .bounded(self.client.get(self.product_url(product_id)?).send())
            .await?;
        match response.status() {
            StatusCode::OK => decode(response, self.request_timeout).await.map(Some),
            StatusCode::NOT_FOUND => Ok(None),
            _ => Err(error_for_status(response, product_id).await),
        }
    }

    async fn find_by_capture_block(
        &self,
        capture_block_id: &str,
    ) -> Result<Vec<ArchivedProduct>, SubmissionError> {
        let mut url = self.url("products")?;
        url.query_pairs_mut()
            .append_pair("capture_block_id", capture_block_id);
        let response = self.bounded(self.client.get(url).send()).await?;
        match response.status() {
            StatusCode::OK => decode(response, self.request_timeout).await,
            StatusCode::NOT_FOUND => Ok(Vec::new()),
            _ => Err(error_for_status(response, capture_block_id).await),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn client(endpoint: &str) -> HttpArchiveClient {
        HttpArchiveClient::new(&ArchiveConfig {
            endpoint: endpoint.to_string(),
            request_timeout: Duration::from_millis(500),
        })
        .unwrap()
    }

    #[test]
    fn status_classification() {
        let id = "1555862422_sdp_l0";
        assert_eq!(
            classify_status(StatusCode::CONFLICT, "", id),
            SubmissionError::Duplicate(id.to_string())
        );
        assert!(classify_status(StatusCode::SERVICE_UNAVAILABLE, "", id).is_transient());
        assert!(classify_status(StatusCode::TOO_MANY_REQUESTS, "", id).is_transient());
        assert!(matches!(
            classify_status(StatusCode::UNPROCESSABLE_ENTITY, "bad key", id),
            SubmissionError::Rejected(msg) if msg.contains("bad key")
        ));
        assert!(matches!(
            classify_status(StatusCode::BAD_REQUEST, "", id),
            SubmissionError::Rejected(_)
        ));
    }

    #[test]
    fn urls_keep_endpoint_path() {
        let c = client("http://archive.example:9101/api/v1");
        assert_eq!(
            c.url("products").unwrap().as_str(),
            "http://archive.example:9101/api/v1/products"
        );
        assert_eq!(
            c.product_url("1555862422_sdp_l0").unwrap().as_str(),
            "http://archive.example:9101/api/v1/products/1555862422_sdp_l0"
        );
    }

    #[test]
    fn rejects_invalid_endpoint() {
        let err = HttpArchiveClient::new(&ArchiveConfig {
            endpoint: "archive without scheme".to_string(),
            request_timeout: Duration::from_secs(1),
        })
        .unwrap_err();
        assert!(matches!(err, TrawlerError::Configuration(_)));
    }

    #[tokio::test]
    async fn unreachable_archive_is_transient() {
        // Port 9 (discard) on localhost is closed in test environments
        let c = client("http://127.0.0.1:9");
        let err = c.exists("1555862422_sdp_l0").await.unwrap_err();
        assert!(err.is_transient());
    }
}
