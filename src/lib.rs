//! # MTPA Trawler
//!
//! Moves observation products from the LOP staging buffer into the MeerKAT Telescope
//! Product Archive (MTPA). A product is a completed observation container in the buffer:
//! either a legacy HDF5 file (`.h5`) or a record-database dump (`.rdb`, with its
//! `.full.rdb` companion).
//!
//! ## Crate Structure
//!
//! - **`detector`**: Completion Detector. Decides when a product has stopped changing.
//! - **`metadata`**: Metadata Extractor. Reads both container formats and builds the
//!   archive metadata record (`.met` side-car, CAS XML).
//! - **`orchestrator`**: Transfer Orchestrator. The polling loop and the per-product
//!   state machine (`discovered → extracting → extracted → submitting → acknowledged`).
//! - **`archive`**: Archive Ingestion Client. Submission, existence and status lookups.
//! - **`state`**: Durable transfer state store and per-product locks.
//! - **`download`**: Fetch archived products of a capture block back to disk.
//! - **`product`**: Product identity, container formats and buffer naming rules.
//! - **`retry`**: Exponential backoff with jitter for archive submissions.
//! - **`config`**: Layered configuration (TOML file + `MTPA_TRAWLER_*` environment).
//! - **`telemetry`**: `tracing` subscriber setup.
//! - **`error`**: The `TrawlerError` enum and the extraction/submission error taxonomies.

pub mod archive;
pub mod config;
pub mod detector;
pub mod download;
pub mod error;
pub mod metadata;
pub mod orchestrator;
pub mod product;
pub mod retry;
pub mod state;
pub mod telemetry;

pub use error::{AppResult, TrawlerError};
pub use orchestrator::{CycleReport, Trawler, TrawlerSettings};
