//! Legacy HDF5 containers.
//!
//! Reading happens in two steps: [`read_snapshot`] pulls the handful of well-known
//! attributes and the timestamp axis out of the file (this needs libhdf5 and the
//! `storage_hdf5` feature), then [`map_attributes`] turns that snapshot into
//! [`ObservationAttributes`]. The mapping is plain Rust and always compiled.

use std::collections::BTreeMap;
use std::path::Path;

use super::extract::{channel_count, ObservationAttributes};
use crate::error::{ExtractionError, ExtractionErrorKind};

/// Group holding observation script parameters.
pub const OBSERVATION_GROUP: &str = "/MetaData/Configuration/Observation";
/// Group holding correlator settings.
pub const CORRELATOR_GROUP: &str = "/MetaData/Configuration/Correlator";
/// Group holding provenance.
pub const HISTORY_GROUP: &str = "/History";
/// Dataset with one timestamp per dump.
pub const TIMESTAMPS_DATASET: &str = "/Data/timestamps";

/// Attributes read from a legacy file, as `(group, attribute)` pairs.
pub const WELL_KNOWN_ATTRIBUTES: &[(&str, &str)] = &[
    ("/", "version"),
    (OBSERVATION_GROUP, "target"),
    (OBSERVATION_GROUP, "ants"),
    (OBSERVATION_GROUP, "ref_ant"),
    (OBSERVATION_GROUP, "script_observer"),
    (OBSERVATION_GROUP, "script_description"),
    (OBSERVATION_GROUP, "script_experiment_id"),
    (OBSERVATION_GROUP, "script_name"),
    (OBSERVATION_GROUP, "script_arguments"),
    (OBSERVATION_GROUP, "script_proposal_id"),
    (OBSERVATION_GROUP, "script_sb_id_code"),
    (OBSERVATION_GROUP, "script_program_block_id"),
    (CORRELATOR_GROUP, "center_freq"),
    (CORRELATOR_GROUP, "bandwidth"),
    (CORRELATOR_GROUP, "n_chans"),
    (CORRELATOR_GROUP, "int_time"),
    (HISTORY_GROUP, "processing_chain"),
];

/// A scalar attribute value.
#[derive(Debug, Clone, PartialEq)]
pub enum AttrValue {
    /// String attribute.
    Text(String),
    /// Numeric attribute.
    Number(f64),
}

impl AttrValue {
    fn text(&self) -> String {
        match self {
            AttrValue::Text(s) => s.clone(),
            AttrValue::Number(n) => n.to_string(),
        }
    }

    fn number(&self) -> Option<f64> {
        match self {
            AttrValue::Number(n) => Some(*n),
            AttrValue::Text(s) => s.trim().parse().ok(),
        }
    }
}

/// The parts of a legacy file the extractor looks at.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct LegacySnapshot {
    /// Attribute values keyed by `"<group>@<name>"`, e.g. `"/@version"`.
    pub attributes: BTreeMap<String, AttrValue>,
    /// The timestamp axis, seconds since the Unix epoch.
    pub timestamps: Vec<f64>,
}

impl LegacySnapshot {
    /// Attribute key for `name` on `group`.
    pub fn key(group: &str, name: &str) -> String {
        format!("{group}@{name}")
    }

    /// Set an attribute.
    pub fn set(&mut self, group: &str, name: &str, value: AttrValue) {
        self.attributes.insert(Self::key(group, name), value);
    }

    fn get(&self, group: &str, name: &str) -> Option<&AttrValue> {
        self.attributes.get(&Self::key(group, name))
    }

    fn text(&self, group: &str, name: &str) -> Option<String> {
        self.get(group, name)
            .map(AttrValue::text)
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty())
    }
}

/// Read the well-known attributes and timestamps of the HDF5 file at `path`.
#[cfg(feature = "storage_hdf5")]
pub fn read_snapshot(path: &Path) -> Result<LegacySnapshot, ExtractionError> {
    use hdf5::types::{FixedAscii, VarLenAscii, VarLenUnicode};

    let product = path.display().to_string();
    let file = hdf5::File::open(path).map_err(|e| {
        ExtractionError::new(&product, ExtractionErrorKind::Unreadable(e.to_string()))
    })?;

    let mut snapshot = LegacySnapshot::default();
    for (group_name, attr_name) in WELL_KNOWN_ATTRIBUTES {
        let Ok(group) = file.group(group_name) else {
            continue;
        };
        let Ok(attr) = group.attr(attr_name) else {
            continue;
        };
        let value = if let Ok(s) = attr.read_scalar::<VarLenUnicode>() {
            AttrValue::Text(s.as_str().to_string())
        } else if let Ok(s) = attr.read_scalar::<VarLenAscii>() {
            AttrValue::Text(s.as_str().to_string())
        } else if let Ok(s) = attr.read_scalar::<FixedAscii<1024>>() {
            AttrValue::Text(s.as_str().to_string())
        } else if let Ok(n) = attr.read_scalar::<f64>() {
            AttrValue::Number(n)
        } else {
            tracing::debug!(
                product = %product,
                attribute = %LegacySnapshot::key(group_name, attr_name),
                "skipping attribute of unsupported type"
            );
            continue;
        };
        snapshot.set(group_name, attr_name, value);
    }

    if let Ok(dataset) = file.dataset(TIMESTAMPS_DATASET) {
        snapshot.timestamps = dataset.read_raw::<f64>().map_err(|e| {
            ExtractionError::new(&product, ExtractionErrorKind::Corrupt(e.to_string()))
        })?;
    }

    Ok(snapshot)
}

/// Without libhdf5 support legacy containers cannot be read.
#[cfg(not(feature = "storage_hdf5"))]
pub fn read_snapshot(path: &Path) -> Result<LegacySnapshot, ExtractionError> {
    Err(ExtractionError::new(
        path.display().to_string(),
        ExtractionErrorKind::FeatureNotEnabled("storage_hdf5"),
    ))
}

/// Map a legacy snapshot onto observation attributes.
pub fn map_attributes(
    snapshot: &LegacySnapshot,
    product: &str,
) -> Result<ObservationAttributes, ExtractionError> {
    let obs = |name: &str| snapshot.text(OBSERVATION_GROUP, name);
    let number = |group: &str, name: &str, field: &'static str| -> Result<Option<f64>, ExtractionError> {
        match snapshot.get(group, name) {
            None => Ok(None),
            Some(value) => value.number().map(Some).ok_or_else(|| {
                ExtractionError::new(
                    product,
                    ExtractionErrorKind::Malformed {
                        field,
                        reason: format!("'{name}' is not a number: {}", value.text()),
                    },
                )
            }),
        }
    };

    let n_chans = channel_count(number(CORRELATOR_GROUP, "n_chans", "NumFreqChannels")?, product)?;

    Ok(ObservationAttributes {
        format_version: snapshot.text("/", "version"),
        start_time: snapshot.timestamps.first().copied(),
        end_time: snapshot.timestamps.last().copied(),
        targets: obs("target").map(|t| split_list(&t)),
        antennas: obs("ants").map(|a| split_list(&a)),
        ref_ant: obs("ref_ant"),
        observer: obs("script_observer"),
        description: obs("script_description"),
        experiment_id: obs("script_experiment_id"),
        script_name: obs("script_name"),
        script_arguments: obs("script_arguments"),
        proposal_id: obs("script_proposal_id"),
        sb_id_code: obs("script_sb_id_code"),
        program_block_id: obs("script_program_block_id"),
        center_freq: number(CORRELATOR_GROUP, "center_freq", "CenterFrequency")?,
        bandwidth: number(CORRELATOR_GROUP, "bandwidth", "Bandwidth")?,
        n_chans,
        dump_period: number(CORRELATOR_GROUP, "int_time", "DumpPeriod")?,
        processing_chain: snapshot.text(HISTORY_GROUP, "processing_chain"),
        ..Default::default()
    })
}

/// Product type of a legacy observation.
///
/// KAT-7 antennas are named `antN`; RTS runs carry `RTS` in their proposal id. Every
/// other legacy file comes from MeerKAT AR1.
pub fn product_type(attrs: &ObservationAttributes) -> &'static str {
    let kat7 = attrs
        .antennas
        .as_ref()
        .and_then(|ants| ants.first())
        .is_some_and(|first| first.starts_with("ant"));
    if kat7 {
        "KAT7TelescopeProduct"
    } else if attrs.proposal_id.as_deref().is_some_and(|p| p.contains("RTS")) {
        "RTSTelescopeProduct"
    } else {
        "MeerKATAR1TelescopeProduct"
    }
}

fn split_list(raw: &str) -> Vec<String> {
    raw.split(|c: char| c == ',' || c.is_whitespace())
        .filter(|s| !s.is_empty())
        .map(str::to_string)
        .collect()
}
