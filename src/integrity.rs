//! Lightweight corruption signals.
//!
//! None of these parse a format fully. They catch the common failure modes of
//! pipeline outputs: zero-byte files, truncated writes that never got a
//! header, and metadata sidecars that say the producing step failed.

use std::fs::File;
use std::io::{Read, Seek, SeekFrom};
use std::path::Path;
use std::str::FromStr;

use serde_json::Value;
use strum::{Display, EnumIter, EnumString};
use tracing::warn;

use crate::model::Asset;

/// Largest metadata sidecar that is parsed
pub const METADATA_READ_LIMIT: u64 = 2_000_000;

const TIFF_MAGIC: &[&[u8; 4]] = &[b"II*\0", b"MM\0*", b"II+\0", b"MM\0+"];
const ZIP_MAGIC: &[u8; 4] = b"PK\x03\x04";
const PICKLE_PROTO: u8 = 0x80;
const PARQUET_MAGIC: &[u8; 4] = b"PAR1";

/// Integrity check applied to an existing asset
#[derive(Debug, Clone, Copy, PartialEq, Eq, Display, EnumString, EnumIter)]
#[strum(serialize_all = "snake_case")]
pub enum Validator {
    /// Exists and is non-empty
    Size,
    Tiff,
    /// Zip container or a raw pickle stream
    Zip,
    Parquet,
    MetadataJson,
}

impl Validator {
    /// Default validator for an asset kind
    pub fn for_kind(kind: &str) -> Self {
        match kind.trim().to_ascii_lowercase().as_str() {
            "cog" | "tif" | "tiff" | "geotiff" => Self::Tiff,
            "tensor" | "pt" | "torch" | "zip" => Self::Zip,
            "parquet" => Self::Parquet,
            "metadata" => Self::MetadataJson,
            _ => Self::Size,
        }
    }

    /// Validator for an asset, honouring `extra.validator`
    pub fn select(asset: &Asset) -> Self {
        if let Some(name) = asset.validator_override() {
            match Self::from_str(name) {
                Ok(v) => return v,
                Err(_) => warn!(
                    "Asset {} names unknown validator '{}', using kind '{}'",
                    asset.asset_id, name, asset.kind
                ),
            }
        }
        Self::for_kind(&asset.kind)
    }

    /// Whether the check needs more than the object size
    pub fn reads_content(self) -> bool {
        !matches!(self, Self::Size)
    }
}

/// Outcome of a content check
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Verdict {
    Valid,
    Corrupt(String),
}

/// Check the first and last bytes of a file of `size` bytes
pub fn check_header(validator: Validator, size: u64, head: &[u8], tail: &[u8]) -> Verdict {
    if size == 0 {
        return Verdict::Corrupt("zero-byte file".into());
    }
    match validator {
        Validator::Size | Validator::MetadataJson => Verdict::Valid,
        Validator::Tiff => {
            if head.len() >= 4 && TIFF_MAGIC.iter().any(|m| &head[..4] == m.as_slice()) {
                Verdict::Valid
            } else {
                Verdict::Corrupt("missing TIFF header".into())
            }
        }
        Validator::Zip => {
            if head.starts_with(ZIP_MAGIC) || head.first() == Some(&PICKLE_PROTO) {
                Verdict::Valid
            } else {
                Verdict::Corrupt("missing zip/pickle header".into())
            }
        }
        Validator::Parquet => {
            if size < 8 {
                Verdict::Corrupt(format!("parquet file too short ({} bytes)", size))
            } else if !head.starts_with(PARQUET_MAGIC) {
                Verdict::Corrupt("missing PAR1 header".into())
            } else if !tail.ends_with(PARQUET_MAGIC) {
                Verdict::Corrupt("missing PAR1 footer (truncated write?)".into())
            } else {
                Verdict::Valid
            }
        }
    }
}

fn truthy(value: &Value) -> bool {
    match value {
        Value::Null => false,
        Value::Bool(b) => *b,
        Value::Number(n) => n.as_f64().is_some_and(|f| f != 0.0),
        Value::String(s) => !s.is_empty(),
        Value::Array(a) => !a.is_empty(),
        Value::Object(o) => !o.is_empty(),
    }
}

/// Inspect a metadata sidecar. `corrupt` wins over `success` when both are set.
pub fn check_metadata(bytes: &[u8]) -> Verdict {
    if bytes.is_empty() {
        return Verdict::Corrupt("zero-byte file".into());
    }
    let value: Value = match serde_json::from_slice(bytes) {
        Ok(v) => v,
        Err(e) => return Verdict::Corrupt(format!("metadata is not valid JSON: {}", e)),
    };
    let Some(obj) = value.as_object() else {
        return Verdict::Corrupt("metadata is not a JSON object".into());
    };
    if let Some(flag) = obj.get("corrupt") {
        return if truthy(flag) {
            Verdict::Corrupt("metadata.corrupt is set".into())
        } else {
            Verdict::Valid
        };
    }
    if let Some(flag) = obj.get("success") {
        if !truthy(flag) {
            return Verdict::Corrupt("metadata.success is false".into());
        }
    }
    Verdict::Valid
}

/// Run `validator` against a local regular file
pub fn check_local_file(validator: Validator, path: &Path, size: u64) -> std::io::Result<Verdict> {
    if size == 0 || validator == Validator::Size {
        return Ok(check_header(validator, size, &[], &[]));
    }

    if validator == Validator::MetadataJson {
        if size > METADATA_READ_LIMIT {
            return Ok(Verdict::Valid);
        }
        let bytes = std::fs::read(path)?;
        return Ok(check_metadata(&bytes));
    }

    let mut file = File::open(path)?;
    let mut head = Vec::with_capacity(8);
    file.by_ref().take(8).read_to_end(&mut head)?;

    let mut tail = Vec::with_capacity(4);
    if size >= 4 {
        file.seek(SeekFrom::End(-4))?;
        file.read_to_end(&mut tail)?;
    }
    Ok(check_header(validator, size, &head, &tail))
}
