//! Record-database containers.
//!
//! A record-database product is a Redis RDB dump of the telescope state store taken at
//! the end of a capture. Keys hold JSON-encoded values; immutable keys are plain strings
//! and sensor-like keys are sorted sets whose highest-scored member is the latest value.
//!
//! The parser understands RDB versions 1 through 11: length and integer encodings, LZF
//! compressed strings, auxiliary fields, database selectors, expiry and LRU/LFU opcodes.
//! Compact encodings (ziplist, listpack, intset, quicklist) are kept as opaque blobs; no
//! attribute the trawler reads is stored that way. The trailing checksum is not verified.

use serde_json::Value;
use std::collections::BTreeMap;
use std::path::Path;

use super::extract::{channel_count, ObservationAttributes};
use crate::error::{ExtractionError, ExtractionErrorKind};

const MAGIC: &[u8] = b"REDIS";
const MAX_VERSION: u32 = 11;

const OP_IDLE: u8 = 0xF8;
const OP_FREQ: u8 = 0xF9;
const OP_AUX: u8 = 0xFA;
const OP_RESIZEDB: u8 = 0xFB;
const OP_EXPIRETIME_MS: u8 = 0xFC;
const OP_EXPIRETIME: u8 = 0xFD;
const OP_SELECTDB: u8 = 0xFE;
const OP_EOF: u8 = 0xFF;

const TYPE_STRING: u8 = 0;
const TYPE_LIST: u8 = 1;
const TYPE_SET: u8 = 2;
const TYPE_ZSET: u8 = 3;
const TYPE_HASH: u8 = 4;
const TYPE_ZSET_2: u8 = 5;
const TYPE_LIST_QUICKLIST: u8 = 14;
const TYPE_LIST_QUICKLIST_2: u8 = 18;

/// A decoded value.
#[derive(Debug, Clone, PartialEq)]
pub enum RdbValue {
    /// Plain string value.
    String(Vec<u8>),
    /// List elements in order.
    List(Vec<Vec<u8>>),
    /// Set members.
    Set(Vec<Vec<u8>>),
    /// Members with their scores, in file order.
    SortedSet(Vec<(Vec<u8>, f64)>),
    /// Field and value pairs.
    Hash(Vec<(Vec<u8>, Vec<u8>)>),
    /// Compact encodings that are not decoded.
    Encoded {
        /// RDB value type code.
        type_code: u8,
        /// Raw encoded payload.
        blob: Vec<u8>,
    },
}

/// Contents of one dump file.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RdbDump {
    /// Dump format version from the header.
    pub version: u32,
    /// Auxiliary header fields (`redis-ver`, `ctime`, ...).
    pub aux: BTreeMap<String, String>,
    /// Keys of every database, later databases overriding earlier ones.
    pub entries: BTreeMap<String, RdbValue>,
}

impl RdbDump {
    /// Latest textual value of `key`.
    ///
    /// Strings are returned as is; sorted sets yield their highest-scored member and
    /// lists their last element.
    pub fn text(&self, key: &str) -> Option<String> {
        let bytes = match self.entries.get(key)? {
            RdbValue::String(bytes) => bytes,
            RdbValue::SortedSet(members) => {
                &members
                    .iter()
                    .max_by(|a, b| a.1.total_cmp(&b.1))?
                    .0
            }
            RdbValue::List(items) => items.last()?,
            _ => return None,
        };
        Some(String::from_utf8_lossy(bytes).into_owned())
    }

    /// Latest value of `key`, JSON-decoded when it parses, otherwise the raw text.
    pub fn json(&self, key: &str) -> Option<Value> {
        let text = self.text(key)?;
        Some(serde_json::from_str(&text).unwrap_or(Value::String(text)))
    }
}

/// Read and parse the dump at `path`.
pub fn read_dump(path: &Path) -> Result<RdbDump, ExtractionError> {
    let product = path.display().to_string();
    let bytes = std::fs::read(path).map_err(|e| {
        ExtractionError::new(&product, ExtractionErrorKind::Unreadable(e.to_string()))
    })?;
    parse_dump(&bytes)
        .map_err(|reason| ExtractionError::new(&product, ExtractionErrorKind::Corrupt(reason)))
}

/// Parse an in-memory dump.
pub fn parse_dump(bytes: &[u8]) -> Result<RdbDump, String> {
    let mut reader = Reader { bytes, pos: 0 };

    let magic = reader.take(MAGIC.len())?;
    if magic != MAGIC {
        return Err("missing REDIS signature".to_string());
    }
    let version = std::str::from_utf8(reader.take(4)?)
        .ok()
        .and_then(|v| v.parse::<u32>().ok())
        .ok_or_else(|| "invalid RDB version".to_string())?;
    if version == 0 || version > MAX_VERSION {
        return Err(format!("unsupported RDB version {version}"));
    }

    let mut dump = RdbDump {
        version,
        ..Default::default()
    };

    loop {
        let opcode = reader.byte()?;
        match opcode {
            OP_EOF => break,
            OP_AUX => {
                let key = reader.string()?;
                let value = reader.string()?;
                dump.aux.insert(
                    String::from_utf8_lossy(&key).into_owned(),
                    String::from_utf8_lossy(&value).into_owned(),
                );
            }
            OP_SELECTDB => {
                reader.length()?;
            }
            OP_RESIZEDB => {
                reader.length()?;
                reader.length()?;
            }
            OP_EXPIRETIME => {
                reader.take(4)?;
            }
            OP_EXPIRETIME_MS => {
                reader.take(8)?;
            }
            OP_IDLE => {
                reader.length()?;
            }
            OP_FREQ => {
                reader.byte()?;
            }
            type_code => {
                let key = reader.string()?;
                let value = reader.value(type_code)?;
                dump.entries
                    .insert(String::from_utf8_lossy(&key).into_owned(), value);
            }
        }
    }

    Ok(dump)
}

/// Map the well-known keys of a dump onto observation attributes.
///
/// Keys are looked up with the stream prefix first (`<stream_name>_<key>`), then bare.
pub fn map_attributes(dump: &RdbDump, product: &str) -> Result<ObservationAttributes, ExtractionError> {
    let stream_name = dump.json("stream_name").and_then(as_string);
    let lookup = |key: &str| -> Option<Value> {
        stream_name
            .as_ref()
            .and_then(|stream| dump.json(&format!("{stream}_{key}")))
            .or_else(|| dump.json(key))
    };
    let malformed = |field: &'static str, reason: String| {
        ExtractionError::new(product, ExtractionErrorKind::Malformed { field, reason })
    };
    let number = |key: &str, field: &'static str| -> Result<Option<f64>, ExtractionError> {
        match lookup(key) {
            None | Some(Value::Null) => Ok(None),
            Some(value) => as_f64(&value)
                .map(Some)
                .ok_or_else(|| malformed(field, format!("'{key}' is not a number: {value}"))),
        }
    };

    let obs_params = match lookup("obs_params") {
        Some(Value::Object(map)) => map,
        Some(other) => {
            return Err(malformed(
                "ObsParams",
                format!("'obs_params' is not an object: {other}"),
            ))
        }
        None => serde_json::Map::new(),
    };
    let param = |key: &str| obs_params.get(key).cloned().and_then(as_string);

    let targets = lookup("targets")
        .and_then(as_string_list)
        .or_else(|| lookup("target").and_then(as_string).map(|t| vec![t]));

    let n_chans = channel_count(number("n_chans", "NumFreqChannels")?, product)?;

    Ok(ObservationAttributes {
        format_version: Some(
            lookup("version")
                .and_then(as_string)
                .unwrap_or_else(|| "4.0".to_string()),
        ),
        capture_block_id: lookup("capture_block_id").and_then(as_string),
        stream_type: lookup("stream_type").and_then(as_string),
        start_time: number("start_time", "StartTime")?,
        end_time: number("end_time", "EndTime")?,
        targets,
        antennas: lookup("antennas").and_then(as_string_list),
        ref_ant: lookup("ref_ant").and_then(as_string),
        observer: param("observer"),
        description: param("description"),
        experiment_id: param("experiment_id"),
        script_name: param("script_name"),
        script_arguments: param("script_arguments"),
        proposal_id: param("proposal_id"),
        sb_id_code: param("sb_id_code"),
        program_block_id: param("program_block_id"),
        center_freq: number("center_freq", "CenterFrequency")?,
        bandwidth: number("bandwidth", "Bandwidth")?,
        n_chans,
        dump_period: number("int_time", "DumpPeriod")?,
        processing_chain: lookup("processing_chain").and_then(as_string),
        stream_name,
    })
}

fn as_string(value: Value) -> Option<String> {
    match value {
        Value::String(s) => Some(s),
        Value::Number(n) => Some(n.to_string()),
        Value::Bool(b) => Some(b.to_string()),
        _ => None,
    }
}

fn as_f64(value: &Value) -> Option<f64> {
    match value {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}

fn as_string_list(value: Value) -> Option<Vec<String>> {
    match value {
        Value::Array(items) => Some(items.into_iter().filter_map(as_string).collect()),
        Value::String(s) => Some(
            s.split(',')
                .map(str::trim)
                .filter(|s| !s.is_empty())
                .map(str::to_string)
                .collect(),
        ),
        _ => None,
    }
}

// =============================================================================
// Parser
// =============================================================================

enum Length {
    Len(u64),
    Int(i64),
    Lzf,
}

struct Reader<'a> {
    bytes: &'a [u8],
    pos: usize,
}

impl<'a> Reader<'a> {
    fn take(&mut self, n: usize) -> Result<&'a [u8], String> {
        let end = self
            .pos
            .checked_add(n)
            .filter(|end| *end <= self.bytes.len())
            .ok_or_else(|| format!("unexpected end of dump at offset {}", self.pos))?;
        let slice = &self.bytes[self.pos..end];
        self.pos = end;
        Ok(slice)
    }

    fn byte(&mut self) -> Result<u8, String> {
        Ok(self.take(1)?[0])
    }

    fn array<const N: usize>(&mut self) -> Result<[u8; N], String> {
        let mut out = [0u8; N];
        out.copy_from_slice(self.take(N)?);
        Ok(out)
    }

    fn encoded_length(&mut self) -> Result<Length, String> {
        let first = self.byte()?;
        match first >> 6 {
            0 => Ok(Length::Len(u64::from(first & 0x3F))),
            1 => {
                let next = self.byte()?;
                Ok(Length::Len((u64::from(first & 0x3F) << 8) | u64::from(next)))
            }
            2 => match first {
                0x80 => Ok(Length::Len(u64::from(u32::from_be_bytes(self.array()?)))),
                0x81 => Ok(Length::Len(u64::from_be_bytes(self.array()?))),
                other => Err(format!("invalid length prefix 0x{other:02x}")),
            },
            _ => match first & 0x3F {
                0 => Ok(Length::Int(i64::from(i8::from_le_bytes(self.array()?)))),
                1 => Ok(Length::Int(i64::from(i16::from_le_bytes(self.array()?)))),
                2 => Ok(Length::Int(i64::from(i32::from_le_bytes(self.array()?)))),
                3 => Ok(Length::Lzf),
                other => Err(format!("invalid special encoding {other}")),
            },
        }
    }

    fn length(&mut self) -> Result<usize, String> {
        match self.encoded_length()? {
            Length::Len(n) => {
                usize::try_from(n).map_err(|_| format!("length {n} does not fit in memory"))
            }
            _ => Err("expected a length, found an encoded string".to_string()),
        }
    }

    fn string(&mut self) -> Result<Vec<u8>, String> {
        match self.encoded_length()? {
            Length::Len(n) => {
                let n = usize::try_from(n).map_err(|_| format!("string length {n} too large"))?;
                Ok(self.take(n)?.to_vec())
            }
            Length::Int(v) => Ok(v.to_string().into_bytes()),
            Length::Lzf => {
                let compressed_len = self.length()?;
                let len = self.length()?;
                let compressed = self.take(compressed_len)?;
                lzf_decompress(compressed, len)
            }
        }
    }

    fn text_score(&mut self) -> Result<f64, String> {
        match self.byte()? {
            253 => Ok(f64::NAN),
            254 => Ok(f64::INFINITY),
            255 => Ok(f64::NEG_INFINITY),
            n => {
                let raw = self.take(usize::from(n))?;
                std::str::from_utf8(raw)
                    .ok()
                    .and_then(|s| s.parse().ok())
                    .ok_or_else(|| "invalid sorted set score".to_string())
            }
        }
    }

    fn strings(&mut self) -> Result<Vec<Vec<u8>>, String> {
        let n = self.length()?;
        (0..n).map(|_| self.string()).collect()
    }

    fn value(&mut self, type_code: u8) -> Result<RdbValue, String> {
        match type_code {
            TYPE_STRING => Ok(RdbValue::String(self.string()?)),
            TYPE_LIST => Ok(RdbValue::List(self.strings()?)),
            TYPE_SET => Ok(RdbValue::Set(self.strings()?)),
            TYPE_ZSET | TYPE_ZSET_2 => {
                let n = self.length()?;
                let mut members = Vec::with_capacity(n.min(1024));
                for _ in 0..n {
                    let member = self.string()?;
                    let score = if type_code == TYPE_ZSET_2 {
                        f64::from_le_bytes(self.array()?)
                    } else {
                        self.text_score()?
                    };
                    members.push((member, score));
                }
                Ok(RdbValue::SortedSet(members))
            }
            TYPE_HASH => {
                let n = self.length()?;
                let mut pairs = Vec::with_capacity(n.min(1024));
                for _ in 0..n {
                    pairs.push((self.string()?, self.string()?));
                }
                Ok(RdbValue::Hash(pairs))
            }
            TYPE_LIST_QUICKLIST => {
                let blob = self.strings()?.concat();
                Ok(RdbValue::Encoded { type_code, blob })
            }
            TYPE_LIST_QUICKLIST_2 => {
                let n = self.length()?;
                let mut blob = Vec::new();
                for _ in 0..n {
                    self.length()?;
                    blob.extend(self.string()?);
                }
                Ok(RdbValue::Encoded { type_code, blob })
            }
            9..=13 | 16 | 17 => Ok(RdbValue::Encoded {
                type_code,
                blob: self.string()?,
            }),
            other => Err(format!("unsupported value type {other}")),
        }
    }
}

/// Largest output a single LZF input byte can produce (a 3-byte back-reference copies 264).
const LZF_MAX_RATIO: usize = 88;

/// Decompress an LZF block of known decompressed length.
///
/// The declared length is checked against what the input can expand to before anything
/// is allocated.
fn lzf_decompress(input: &[u8], expected_len: usize) -> Result<Vec<u8>, String> {
    let corrupt = || "corrupt LZF data".to_string();
    if expected_len > input.len().saturating_mul(LZF_MAX_RATIO) {
        return Err(format!(
            "LZF block of {} bytes cannot expand to {expected_len} bytes",
            input.len()
        ));
    }
    let mut out: Vec<u8> = Vec::new();
    out.try_reserve_exact(expected_len)
        .map_err(|e| format!("cannot allocate {expected_len} bytes: {e}"))?;
    let mut i = 0;
    while i < input.len() {
        let ctrl = usize::from(input[i]);
        i += 1;
        if ctrl < 32 {
            let run = ctrl + 1;
            let literal = input.get(i..i + run).ok_or_else(corrupt)?;
            if out.len() + run > expected_len {
                return Err(corrupt());
            }
            out.extend_from_slice(literal);
            i += run;
        } else {
            let mut len = ctrl >> 5;
            if len == 7 {
                len += usize::from(*input.get(i).ok_or_else(corrupt)?);
                i += 1;
            }
            let low = usize::from(*input.get(i).ok_or_else(corrupt)?);
            i += 1;
            let back = ((ctrl & 0x1F) << 8) + low + 1;
            if back > out.len() {
                return Err(corrupt());
            }
            if out.len() + len + 2 > expected_len {
                return Err(corrupt());
            }
            let start = out.len() - back;
            // Source and destination may overlap
            for k in 0..len + 2 {
                let b = out[start + k];
                out.push(b);
            }
        }
    }
    if out.len() != expected_len {
        return Err(format!(
            "LZF length mismatch: expected {expected_len}, got {}",
            out.len()
        ));
    }
    Ok(out)
}

// =============================================================================
// Writer
// =============================================================================

/// Encode string and sorted-set entries as an RDB (version 9) dump.
///
/// Used to build test fixtures and to snapshot a telescope state by hand. Other value
/// kinds are skipped.
pub fn write_dump(entries: &BTreeMap<String, RdbValue>) -> Vec<u8> {
    let mut out = Vec::new();
    out.extend_from_slice(b"REDIS0009");
    out.push(OP_AUX);
    put_string(&mut out, b"redis-ver");
    put_string(&mut out, b"5.0.7");
    out.push(OP_SELECTDB);
    put_length(&mut out, 0);
    out.push(OP_RESIZEDB);
    put_length(&mut out, entries.len());
    put_length(&mut out, 0);
    for (key, value) in entries {
        match value {
            RdbValue::String(bytes) => {
                out.push(TYPE_STRING);
                put_string(&mut out, key.as_bytes());
                put_string(&mut out, bytes);
            }
            RdbValue::SortedSet(members) => {
                out.push(TYPE_ZSET_2);
                put_string(&mut out, key.as_bytes());
                put_length(&mut out, members.len());
                for (member, score) in members {
                    put_string(&mut out, member);
                    out.extend_from_slice(&score.to_le_bytes());
                }
            }
            _ => {}
        }
    }
    out.push(OP_EOF);
    out.extend_from_slice(&[0u8; 8]);
    out
}

fn put_length(out: &mut Vec<u8>, len: usize) {
    if len < 0x40 {
        out.push(len as u8);
    } else if len < 0x4000 {
        out.push(0x40 | (len >> 8) as u8);
        out.push((len & 0xFF) as u8);
    } else {
        out.push(0x80);
        out.extend_from_slice(&(len as u32).to_be_bytes());
    }
}

fn put_string(out: &mut Vec<u8>, bytes: &[u8]) {
    put_length(out, bytes.len());
    out.extend_from_slice(bytes);
}
