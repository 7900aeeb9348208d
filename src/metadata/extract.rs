//! Metadata extraction: container → [`ObservationAttributes`] → [`MetadataRecord`].

use chrono::{DateTime, Utc};
use sha2::{Digest, Sha256};
use std::fmt::Write as _;
use std::path::Path;
use std::time::Duration;
use tracing::{debug, warn};

use super::record::MetadataRecord;
use super::{legacy, rdb};
use crate::error::{ExtractionError, ExtractionErrorKind};
use crate::product::{ContainerFormat, Product};

/// Target list written when a product names none.
pub const DEFAULT_TARGET: &str = "unknown";
/// Observer written when a product names none.
pub const DEFAULT_OBSERVER: &str = "unknown";
/// MIME type for files that are not containers.
pub const FALLBACK_MIME_TYPE: &str = "application/x-data";

/// Observation attributes shared by every container format.
///
/// Readers fill what the container holds; all derivation and defaulting happens in
/// [`Extractor::build_record`].
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ObservationAttributes {
    /// Container format version.
    pub format_version: Option<String>,
    /// Capture block the product belongs to.
    pub capture_block_id: Option<String>,
    /// Stream the product was recorded from, e.g. `sdp_l0`.
    pub stream_name: Option<String>,
    /// Stream type such as `sdp.vis` or `sdp.flags`.
    pub stream_type: Option<String>,
    /// Seconds since the Unix epoch.
    pub start_time: Option<f64>,
    /// Seconds since the Unix epoch.
    pub end_time: Option<f64>,
    /// Observed target names.
    pub targets: Option<Vec<String>>,
    /// Antennas in the subarray.
    pub antennas: Option<Vec<String>>,
    /// Reference antenna.
    pub ref_ant: Option<String>,
    /// Person who ran the observation.
    pub observer: Option<String>,
    /// Free-text observation description.
    pub description: Option<String>,
    /// Experiment identifier.
    pub experiment_id: Option<String>,
    /// Observation script.
    pub script_name: Option<String>,
    /// Arguments the script ran with.
    pub script_arguments: Option<String>,
    /// Science proposal identifier.
    pub proposal_id: Option<String>,
    /// Schedule block identifier code.
    pub sb_id_code: Option<String>,
    /// Program block identifier.
    pub program_block_id: Option<String>,
    /// Hz.
    pub center_freq: Option<f64>,
    /// Hz.
    pub bandwidth: Option<f64>,
    /// Number of frequency channels.
    pub n_chans: Option<u64>,
    /// Seconds per dump.
    pub dump_period: Option<f64>,
    /// Provenance of the processing that produced the product.
    pub processing_chain: Option<String>,
}

/// Result of a successful extraction.
#[derive(Debug, Clone, PartialEq)]
pub struct Extraction {
    /// The metadata record.
    pub record: MetadataRecord,
    /// Archive product type, e.g. `MeerKATTelescopeProduct`.
    pub product_type: String,
    /// Recoverable problems: fields that fell back to their documented default.
    pub defaulted: Vec<ExtractionError>,
}

impl Extraction {
    /// SHA-256 of the serialized record.
    pub fn digest(&self) -> String {
        self.record.digest()
    }
}

/// Builds metadata records from product containers.
///
/// Extraction is a pure function of the files on disk: the same product always yields
/// a byte-identical record.
#[derive(Debug, Clone, Copy, Default)]
pub struct Extractor;

impl Extractor {
    /// Create an extractor.
    pub fn new() -> Self {
        Self
    }

    /// Read `product` and build its metadata record.
    ///
    /// Blocking; callers on the async runtime use [`Extractor::extract_bounded`].
    pub fn extract(&self, product: &Product) -> Result<Extraction, ExtractionError> {
        let id = product.capture_id.as_str();
        check_signature(product)?;
        let attrs = match product.format {
            ContainerFormat::Legacy => {
                let snapshot = legacy::read_snapshot(&product.path).map_err(|e| relabel(e, id))?;
                legacy::map_attributes(&snapshot, id)?
            }
            ContainerFormat::RecordDb => {
                let dump = rdb::read_dump(&product.path).map_err(|e| relabel(e, id))?;
                rdb::map_attributes(&dump, id)?
            }
        };
        let extraction = self.build_record(product, &attrs)?;
        debug!(
            capture_id = %id,
            product_type = %extraction.product_type,
            fields = extraction.record.len(),
            defaulted = extraction.defaulted.len(),
            "extracted metadata"
        );
        Ok(extraction)
    }

    /// Run [`Extractor::extract`] on the blocking pool with a time ceiling.
    pub async fn extract_bounded(
        &self,
        product: &Product,
        limit: Duration,
    ) -> Result<Extraction, ExtractionError> {
        let extractor = *self;
        let owned = product.clone();
        let task = tokio::task::spawn_blocking(move || extractor.extract(&owned));
        match tokio::time::timeout(limit, task).await {
            Ok(Ok(result)) => result,
            Ok(Err(join_err)) => Err(ExtractionError::new(
                product.capture_id.as_str(),
                ExtractionErrorKind::Corrupt(format!("extraction task failed: {join_err}")),
            )),
            Err(_) => Err(ExtractionError::new(
                product.capture_id.as_str(),
                ExtractionErrorKind::Timeout(limit),
            )),
        }
    }

    /// Extract a single file outside the buffer workflow (`mtpa-trawler extract`).
    pub fn extract_path(&self, path: &Path) -> Result<Extraction, ExtractionError> {
        let product = Product::standalone(path).map_err(|e| {
            ExtractionError::new(
                path.display().to_string(),
                ExtractionErrorKind::Unreadable(e.to_string()),
            )
        })?;
        match product {
            Some(product) => self.extract(&product),
            None => Err(ExtractionError::new(
                path.display().to_string(),
                ExtractionErrorKind::UnsupportedFormat(
                    "expected a .h5 or .rdb container".to_string(),
                ),
            )),
        }
    }

    /// Derive the full record from container attributes.
    pub fn build_record(
        &self,
        product: &Product,
        attrs: &ObservationAttributes,
    ) -> Result<Extraction, ExtractionError> {
        let id = product.capture_id.as_str();
        let fatal = |kind| ExtractionError::new(id, kind);
        let mut defaulted = Vec::new();
        let mut default = |field: &'static str, value: &str| {
            let err = ExtractionError::new(
                id,
                ExtractionErrorKind::Defaulted {
                    field,
                    default: value.to_string(),
                },
            );
            warn!(capture_id = %id, field, default = %value, "attribute missing, using default");
            defaulted.push(err);
        };

        let product_type = match product.format {
            ContainerFormat::RecordDb => {
                let stream_type = attrs
                    .stream_type
                    .as_deref()
                    .ok_or_else(|| fatal(ExtractionErrorKind::MissingRequired { field: "StreamType" }))?;
                match stream_type {
                    "sdp.vis" => "MeerKATTelescopeProduct",
                    "sdp.flags" => "MeerKATFlagProduct",
                    other => {
                        return Err(fatal(ExtractionErrorKind::UnsupportedFormat(format!(
                            "stream type '{other}'"
                        ))))
                    }
                }
            }
            ContainerFormat::Legacy => legacy::product_type(attrs),
        };

        let start = attrs
            .start_time
            .ok_or_else(|| fatal(ExtractionErrorKind::MissingRequired { field: "StartTime" }))?;
        let end = attrs
            .end_time
            .ok_or_else(|| fatal(ExtractionErrorKind::MissingRequired { field: "EndTime" }))?;
        if end < start {
            return Err(fatal(ExtractionErrorKind::Malformed {
                field: "Duration",
                reason: format!("end time {end} precedes start time {start}"),
            }));
        }
        let start_time = to_utc(start, "StartTime").map_err(fatal)?;
        let end_time = to_utc(end, "EndTime").map_err(fatal)?;

        let mut record = MetadataRecord::new();

        // Identity
        let capture_block = attrs
            .capture_block_id
            .clone()
            .unwrap_or_else(|| product.capture_id.capture_block().to_string());
        record.insert("id", id);
        record.insert("CAS.ProductId", id);
        record.insert("CAS.ProductName", id);
        record.insert("CAS.ProductTypeName", product_type);
        record.insert("CAS.ProductTypeId", format!("urn:kat:{product_type}"));
        record.insert("ProductType", product_type);
        record.insert("CaptureBlockId", capture_block);
        let stream = attrs
            .stream_name
            .clone()
            .or_else(|| product.capture_id.stream().map(str::to_string));
        if let Some(stream) = stream {
            record.insert("CaptureStreamId", id);
            record.insert("StreamId", stream);
        }
        record.insert_opt("FormatVersion", attrs.format_version.clone());

        // References
        let files: Vec<&Path> = product.files().collect();
        record.insert(
            "CAS.ProductStructure",
            if files.len() > 1 { "Hierarchical" } else { "Flat" },
        );
        let mut references = Vec::with_capacity(files.len());
        let mut sizes = Vec::with_capacity(files.len());
        let mut mime_types = Vec::with_capacity(files.len());
        for file in &files {
            let meta = std::fs::metadata(file).map_err(|e| {
                fatal(ExtractionErrorKind::Unreadable(format!(
                    "{}: {}",
                    file.display(),
                    e
                )))
            })?;
            references.push(format!("file://{}", file.display()));
            sizes.push(meta.len().to_string());
            mime_types.push(
                ContainerFormat::from_path(file)
                    .map(ContainerFormat::mime_type)
                    .unwrap_or_else(|| companion_mime_type(file))
                    .to_string(),
            );
        }
        record.insert("CAS.ReferenceOriginal", references);
        record.insert("CAS.ReferenceFileSize", sizes);
        record.insert("CAS.ReferenceMimeType", mime_types);
        record.insert("FileSize", product.size);
        let (file_digest, algorithm) = file_digest(product).map_err(|e| {
            fatal(ExtractionErrorKind::Unreadable(format!(
                "{}: {}",
                product.path.display(),
                e
            )))
        })?;
        record.insert("FileDigest", file_digest);
        record.insert("FileDigestAlgorithm", algorithm);

        // Timing
        record.insert("StartTime", start_time);
        record.insert("EndTime", end_time);
        record.insert("Duration", ((end - start) * 100.0).round() / 100.0);
        record.insert_opt("DumpPeriod", attrs.dump_period);

        // Observation
        let targets = match attrs.targets.as_ref().filter(|t| !t.is_empty()) {
            Some(targets) => targets.clone(),
            None => {
                default("Targets", DEFAULT_TARGET);
                vec![DEFAULT_TARGET.to_string()]
            }
        };
        record.insert("Targets", targets);
        let antennas = match &attrs.antennas {
            Some(antennas) => antennas.clone(),
            None => {
                default("Antennas", "");
                Vec::new()
            }
        };
        record.insert("Antennas", antennas);
        record.insert_opt("RefAntenna", attrs.ref_ant.clone());
        let observer = attrs.observer.clone().unwrap_or_else(|| {
            default("Observer", DEFAULT_OBSERVER);
            DEFAULT_OBSERVER.to_string()
        });
        record.insert("Observer", observer);
        let description = attrs.description.clone().unwrap_or_else(|| {
            default("Description", "");
            String::new()
        });
        record.insert("Description", description);
        let experiment_id = attrs.experiment_id.clone().unwrap_or_else(|| {
            default("ExperimentID", "");
            String::new()
        });
        record.insert("ExperimentID", experiment_id);
        if let Some(script) = &attrs.script_name {
            let args = attrs.script_arguments.as_deref().unwrap_or_default();
            record.insert("InstructionSet", format!("{script} {args}").trim_end().to_string());
        }
        record.insert_opt("ProposalId", attrs.proposal_id.clone());
        record.insert_opt("ScheduleBlockIdCode", attrs.sb_id_code.clone());
        record.insert_opt("ProgramBlockId", attrs.program_block_id.clone());

        // Frequency
        record.insert_opt("CenterFrequency", attrs.center_freq);
        record.insert_opt("Bandwidth", attrs.bandwidth);
        record.insert_opt("NumFreqChannels", attrs.n_chans);
        if let (Some(bw), Some(n)) = (attrs.bandwidth, attrs.n_chans) {
            record.insert("ChannelWidth", bw / n as f64);
        }
        if let (Some(center), Some(bw)) = (attrs.center_freq, attrs.bandwidth) {
            record.insert("MinFreq", center - bw / 2.0);
            record.insert("MaxFreq", center + bw / 2.0);
        }

        record.insert_opt("ProcessingChain", attrs.processing_chain.clone());

        record.validate(id)?;

        Ok(Extraction {
            record,
            product_type: product_type.to_string(),
            defaulted,
        })
    }
}

fn to_utc(seconds: f64, field: &'static str) -> Result<DateTime<Utc>, ExtractionErrorKind> {
    let millis = (seconds * 1000.0).round();
    if !millis.is_finite() {
        return Err(ExtractionErrorKind::Malformed {
            field,
            reason: format!("{seconds} is not a valid timestamp"),
        });
    }
    DateTime::from_timestamp_millis(millis as i64).ok_or_else(|| ExtractionErrorKind::Malformed {
        field,
        reason: format!("{seconds} is out of range"),
    })
}

fn companion_mime_type(path: &Path) -> &'static str {
    match path.extension().and_then(|e| e.to_str()) {
        Some("rdb") => ContainerFormat::RecordDb.mime_type(),
        Some("h5") => ContainerFormat::Legacy.mime_type(),
        _ => FALLBACK_MIME_TYPE,
    }
}

fn check_signature(product: &Product) -> Result<(), ExtractionError> {
    use std::io::Read;

    let id = product.capture_id.as_str();
    let magic = product.format.magic();
    let mut head = vec![0u8; magic.len()];
    let mut file = std::fs::File::open(&product.path).map_err(|e| {
        ExtractionError::new(id, ExtractionErrorKind::Unreadable(e.to_string()))
    })?;
    let read = file.read(&mut head).map_err(|e| {
        ExtractionError::new(id, ExtractionErrorKind::Unreadable(e.to_string()))
    })?;
    if read < magic.len() || head != magic {
        return Err(ExtractionError::new(
            id,
            ExtractionErrorKind::Corrupt(format!(
                "{} does not start with the {} signature",
                product.path.display(),
                product.format
            )),
        ));
    }
    Ok(())
}

/// Channel count as a positive integer; anything else is malformed in every format.
pub(crate) fn channel_count(
    value: Option<f64>,
    product: &str,
) -> Result<Option<u64>, ExtractionError> {
    match value {
        Some(n) if n.fract() != 0.0 || n < 1.0 => Err(ExtractionError::new(
            product,
            ExtractionErrorKind::Malformed {
                field: "NumFreqChannels",
                reason: format!("'n_chans' must be a positive integer, got {n}"),
            },
        )),
        Some(n) => Ok(Some(n as u64)),
        None => Ok(None),
    }
}

/// Content checksum of the primary file and the algorithm that produced it.
///
/// A `<file>.md5` left by the writer is taken as given; otherwise the file is hashed with
/// SHA-256. The checksum file is only read, never removed.
pub fn file_digest(product: &Product) -> std::io::Result<(String, &'static str)> {
    let checksum_path = product.checksum_path();
    match std::fs::read_to_string(&checksum_path) {
        Ok(text) => {
            let sum = text
                .split_whitespace()
                .next()
                .filter(|s| s.len() == 32 && s.chars().all(|c| c.is_ascii_hexdigit()));
            if let Some(sum) = sum {
                return Ok((sum.to_ascii_lowercase(), "md5"));
            }
            warn!(file = %checksum_path.display(), "ignoring malformed checksum file");
        }
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
        Err(e) => return Err(e),
    }

    let mut file = std::fs::File::open(&product.path)?;
    let mut hasher = Sha256::new();
    std::io::copy(&mut file, &mut hasher)?;
    let hex = hasher
        .finalize()
        .iter()
        .fold(String::with_capacity(64), |mut out, b| {
            let _ = write!(out, "{b:02x}");
            out
        });
    Ok((hex, "sha256"))
}

// Readers label errors with the file path; the pipeline reports capture ids
fn relabel(mut err: ExtractionError, id: &str) -> ExtractionError {
    err.product = id.to_string();
    err
}
