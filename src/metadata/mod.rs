//! Metadata Extractor
//!
//! Turns an observation product into the archive metadata record. There is exactly one
//! reader per [`ContainerFormat`](crate::product::ContainerFormat):
//!
//! - [`legacy`]: HDF5 files (`.h5`), read through libhdf5 behind the `storage_hdf5` feature
//! - [`rdb`]: record-database dumps (`.rdb`), parsed in pure Rust
//!
//! Both fill the same [`ObservationAttributes`]; [`Extractor::build_record`] then derives
//! durations and frequency ranges, classifies the product type, applies defaults for
//! missing optional fields and produces a validated [`MetadataRecord`].
//!
//! # Example
//!
//! ```no_run
//! use mtpa_trawler::metadata::Extractor;
//! use std::path::Path;
//!
//! let extraction = Extractor::new().extract_path(Path::new("1555862422_sdp_l0.rdb"))?;
//! for warning in &extraction.defaulted {
//!     eprintln!("{warning}");
//! }
//! print!("{}", extraction.record.to_cas_xml());
//! # Ok::<(), mtpa_trawler::error::ExtractionError>(())
//! ```

pub mod extract;
pub mod legacy;
pub mod rdb;
pub mod record;

pub use extract::{Extraction, Extractor, ObservationAttributes};
pub use record::{MetValue, MetadataRecord};
