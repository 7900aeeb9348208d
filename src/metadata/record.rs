//! The archive metadata record and its CAS XML side-car form.

use chrono::{DateTime, SecondsFormat, Utc};
use regex::Regex;
use serde::{Serialize, Serializer};
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;
use std::fmt::Write as _;
use std::path::Path;
use std::sync::LazyLock;

use crate::error::{ExtractionError, ExtractionErrorKind};

/// Namespace of the CAS metadata document.
pub const CAS_NAMESPACE: &str = "http://oodt.jpl.nasa.gov/1.0/cas";

/// Allowed field names.
pub const FIELD_NAME_REGEX: &str = r"^[A-Za-z][A-Za-z0-9_.]*$";

/// Fields every record must carry before it may be submitted.
pub const CORE_FIELDS: &[&str] = &[
    "id",
    "CAS.ProductId",
    "CAS.ProductName",
    "CAS.ProductTypeId",
    "CAS.ProductTypeName",
    "CAS.ProductStructure",
    "CAS.ReferenceOriginal",
    "CAS.ReferenceFileSize",
    "CAS.ReferenceMimeType",
    "CaptureBlockId",
    "ProductType",
    "FileSize",
    "StartTime",
    "EndTime",
    "Duration",
];

#[allow(clippy::expect_used)]
static FIELD_NAME_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(FIELD_NAME_REGEX).expect("Invalid field name regex"));

/// One metadata value.
#[derive(Debug, Clone, PartialEq)]
pub enum MetValue {
    /// Free text.
    Text(String),
    /// Numeric value.
    Number(f64),
    /// UTC timestamp.
    Time(DateTime<Utc>),
    /// Repeated value.
    List(Vec<String>),
}

impl MetValue {
    /// The value as the list of strings written to the side-car.
    ///
    /// Numbers use Rust's shortest round-trip formatting and times are RFC 3339 with
    /// millisecond precision, so the output is stable across runs.
    pub fn to_strings(&self) -> Vec<String> {
        match self {
            MetValue::Text(s) => vec![s.clone()],
            MetValue::Number(n) => vec![format_number(*n)],
            MetValue::Time(t) => vec![t.to_rfc3339_opts(SecondsFormat::Millis, true)],
            MetValue::List(items) => items.clone(),
        }
    }

    /// The first textual value, if any.
    pub fn first(&self) -> Option<String> {
        self.to_strings().into_iter().next()
    }
}

fn format_number(n: f64) -> String {
    if n == 0.0 {
        // Normalise -0
        "0".to_string()
    } else {
        format!("{n}")
    }
}

impl From<&str> for MetValue {
    fn from(value: &str) -> Self {
        MetValue::Text(value.to_string())
    }
}

impl From<String> for MetValue {
    fn from(value: String) -> Self {
        MetValue::Text(value)
    }
}

impl From<f64> for MetValue {
    fn from(value: f64) -> Self {
        MetValue::Number(value)
    }
}

impl From<u64> for MetValue {
    fn from(value: u64) -> Self {
        MetValue::Number(value as f64)
    }
}

impl From<DateTime<Utc>> for MetValue {
    fn from(value: DateTime<Utc>) -> Self {
        MetValue::Time(value)
    }
}

impl From<Vec<String>> for MetValue {
    fn from(value: Vec<String>) -> Self {
        MetValue::List(value)
    }
}

// Archive JSON carries every field as a list of strings, like the side-car
impl Serialize for MetValue {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        self.to_strings().serialize(serializer)
    }
}

/// Archive metadata for one product, keyed by CAS field name.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(transparent)]
pub struct MetadataRecord {
    fields: BTreeMap<String, MetValue>,
}

impl MetadataRecord {
    /// An empty record.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set `key`, replacing any previous value.
    pub fn insert(&mut self, key: impl Into<String>, value: impl Into<MetValue>) {
        self.fields.insert(key.into(), value.into());
    }

    /// Set `key` only when `value` is present.
    pub fn insert_opt<V: Into<MetValue>>(&mut self, key: &str, value: Option<V>) {
        if let Some(value) = value {
            self.insert(key, value);
        }
    }

    /// Value of `key`.
    pub fn get(&self, key: &str) -> Option<&MetValue> {
        self.fields.get(key)
    }

    /// First textual value of `key`.
    pub fn text(&self, key: &str) -> Option<String> {
        self.get(key).and_then(MetValue::first)
    }

    /// Fields in key order.
    pub fn iter(&self) -> impl Iterator<Item = (&String, &MetValue)> {
        self.fields.iter()
    }

    /// Number of fields.
    pub fn len(&self) -> usize {
        self.fields.len()
    }

    /// Whether the record has no fields.
    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }

    /// Check field names, numeric values and the presence of the core fields.
    pub fn validate(&self, product: &str) -> Result<(), ExtractionError> {
        for (key, value) in &self.fields {
            if !FIELD_NAME_RE.is_match(key) {
                return Err(ExtractionError::new(
                    product,
                    ExtractionErrorKind::Malformed {
                        field: "record",
                        reason: format!("invalid field name '{key}'"),
                    },
                ));
            }
            if let MetValue::Number(n) = value {
                if !n.is_finite() {
                    return Err(ExtractionError::new(
                        product,
                        ExtractionErrorKind::Malformed {
                            field: "record",
                            reason: format!("field '{key}' is not a finite number"),
                        },
                    ));
                }
            }
        }
        for &field in CORE_FIELDS {
            if !self.fields.contains_key(field) {
                return Err(ExtractionError::new(
                    product,
                    ExtractionErrorKind::MissingRequired { field },
                ));
            }
        }
        Ok(())
    }

    /// Serialize to the CAS metadata XML document.
    pub fn to_cas_xml(&self) -> String {
        let mut xml = String::from("<?xml version=\"1.0\" encoding=\"UTF-8\"?>\n");
        let _ = writeln!(xml, "<cas:metadata xmlns:cas=\"{CAS_NAMESPACE}\">");
        for (key, value) in &self.fields {
            xml.push_str("  <keyval>\n");
            let _ = writeln!(xml, "    <key>{}</key>", escape_xml(key));
            for val in value.to_strings() {
                let _ = writeln!(xml, "    <val>{}</val>", escape_xml(&val));
            }
            xml.push_str("  </keyval>\n");
        }
        xml.push_str("</cas:metadata>\n");
        xml
    }

    /// Lowercase hex SHA-256 of the serialized document.
    pub fn digest(&self) -> String {
        let hash = Sha256::digest(self.to_cas_xml().as_bytes());
        hash.iter().fold(String::with_capacity(64), |mut out, b| {
            let _ = write!(out, "{b:02x}");
            out
        })
    }

    /// Write the side-car document to `path` via a temporary file.
    pub fn write_sidecar(&self, path: &Path) -> std::io::Result<()> {
        let tmp = path.with_extension("met.tmp");
        std::fs::write(&tmp, self.to_cas_xml())?;
        std::fs::rename(&tmp, path)
    }
}

fn escape_xml(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    for c in text.chars() {
        match c {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '"' => out.push_str("&quot;"),
            '\'' => out.push_str("&apos;"),
            c => out.push(c),
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn sample() -> MetadataRecord {
        let mut rec = MetadataRecord::new();
        rec.insert("Targets", vec!["PKS 1934-63".to_string(), "3C286".to_string()]);
        rec.insert("Description", "Flux <cal> & \"test\"");
        rec.insert("Duration", 3599.5);
        rec.insert("FileSize", 1024u64);
        rec.insert(
            "StartTime",
            Utc.with_ymd_and_hms(2019, 4, 21, 16, 0, 22).unwrap(),
        );
        rec
    }

    #[test]
    fn xml_is_sorted_and_escaped() {
        let xml = sample().to_cas_xml();
        let description = xml.find("<key>Description</key>").unwrap();
        let targets = xml.find("<key>Targets</key>").unwrap();
        assert!(description < targets);
        assert!(xml.contains("<val>Flux &lt;cal&gt; &amp; &quot;test&quot;</val>"));
        assert!(xml.contains("<val>PKS 1934-63</val>\n    <val>3C286</val>"));
        assert!(xml.contains("<val>3599.5</val>"));
        assert!(xml.contains("<val>1024</val>"));
        assert!(xml.contains("<val>2019-04-21T16:00:22.000Z</val>"));
        assert!(xml.starts_with("<?xml version=\"1.0\" encoding=\"UTF-8\"?>\n<cas:metadata"));
    }

    #[test]
    fn digest_depends_on_content() {
        let a = sample();
        let mut b = sample();
        assert_eq!(a.digest(), b.digest());
        assert_eq!(a.digest().len(), 64);
        b.insert("Observer", "someone");
        assert_ne!(a.digest(), b.digest());
    }

    #[test]
    fn validate_rejects_bad_names_and_missing_core() {
        let mut rec = sample();
        assert!(matches!(
            rec.validate("x").unwrap_err().kind,
            ExtractionErrorKind::MissingRequired { .. }
        ));

        rec.insert("1bad", "x");
        assert!(matches!(
            rec.validate("x").unwrap_err().kind,
            ExtractionErrorKind::Malformed { .. }
        ));
    }

    #[test]
    fn json_form_is_lists_of_strings() {
        let json = serde_json::to_value(sample()).unwrap();
        assert_eq!(json["Duration"], serde_json::json!(["3599.5"]));
        assert_eq!(json["Targets"][1], "3C286");
    }
}
