// crates/envelope-core/src/runtime/mapper.rs
// ============================================================================
// Module: Form-Flow Data Mapper
// Description: Declarative mapping from collected form data to envelope inputs.
// Purpose: Produce payload patches and attachment files from form submissions.
// Dependencies: base64, serde_json, tracing
// ============================================================================

//! ## Overview
//! Form flows hand over a bag of collected step data in one of several
//! shapes. [`CollectedData`] normalizes the bag into a step-name-keyed map;
//! the mapper then walks the driver's [`FormFlowMapping`] to build a payload
//! patch and to extract attachment files.
//! Invariants:
//! - Normalization is first-writer-wins on duplicate step names.
//! - A source path that resolves to nothing omits its payload key; null is
//!   never written into a patch.
//! - Cast mismatches and undecodable attachment sources are logged and
//!   skipped; mapping never fails a sync.

// ============================================================================
// SECTION: Imports
// ============================================================================

use std::collections::BTreeMap;

use base64::Engine;
use base64::engine::general_purpose::STANDARD as BASE64;
use serde_json::Map;
use serde_json::Number;
use serde_json::Value;
use tracing::debug;
use tracing::warn;

use crate::core::driver::AttachmentMapping;
use crate::core::driver::FormFlowMapping;
use crate::core::identifiers::DocType;

// ============================================================================
// SECTION: Collected Data
// ============================================================================

/// Step discriminator keys accepted in indexed bags.
const STEP_NAME_KEYS: [&str; 2] = ["_step_name", "step_name"];

/// Normalized form submission: step data keyed by step name.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct CollectedData {
    /// Step data keyed by step name.
    steps: BTreeMap<String, Value>,
}

impl CollectedData {
    /// Normalizes a raw collected-data bag.
    ///
    /// Accepted shapes:
    /// - an array of step objects carrying a `_step_name` (or `step_name`)
    ///   discriminator;
    /// - a map keyed by step index whose values carry a discriminator;
    /// - a map already keyed by step name.
    ///
    /// Entries without a usable discriminator are skipped; the first writer
    /// wins when two entries claim the same step name.
    #[must_use]
    pub fn normalize(raw: &Value) -> Self {
        let mut steps = BTreeMap::new();
        match raw {
            Value::Array(entries) => {
                for entry in entries {
                    insert_discriminated(&mut steps, entry);
                }
            }
            Value::Object(map) => {
                let indexed = map.keys().all(|k| k.parse::<usize>().is_ok());
                if indexed && !map.is_empty() {
                    for entry in map.values() {
                        insert_discriminated(&mut steps, entry);
                    }
                } else {
                    for (name, entry) in map {
                        steps.entry(name.clone()).or_insert_with(|| entry.clone());
                    }
                }
            }
            other => {
                debug!(shape = %value_kind(other), "ignoring non-bag collected data");
            }
        }
        Self {
            steps,
        }
    }

    /// Returns true when no steps were collected.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.steps.is_empty()
    }

    /// Returns the names of the collected steps.
    pub fn step_names(&self) -> impl Iterator<Item = &str> {
        self.steps.keys().map(String::as_str)
    }

    /// Resolves a dotted path (`step.field.nested`) against the steps.
    #[must_use]
    pub fn get(&self, path: &str) -> Option<&Value> {
        let mut segments = path.split('.');
        let step = segments.next()?;
        let mut current = self.steps.get(step)?;
        for segment in segments {
            current = match current {
                Value::Object(map) => map.get(segment)?,
                Value::Array(items) => items.get(segment.parse::<usize>().ok()?)?,
                _ => return None,
            };
        }
        Some(current)
    }
}

/// Files an entry under its declared step name when one of the known
/// name keys is present; entries without a name are dropped.
fn insert_discriminated(steps: &mut BTreeMap<String, Value>, entry: &Value) {
    let Value::Object(map) = entry else {
        debug!(shape = %value_kind(entry), "skipping non-object step entry");
        return;
    };
    let Some(name) = STEP_NAME_KEYS
        .iter()
        .find_map(|key| map.get(*key).and_then(Value::as_str))
    else {
        debug!("skipping step entry without a step-name discriminator");
        return;
    };
    steps.entry(name.to_string()).or_insert_with(|| entry.clone());
}

/// Names a JSON value's shape for log output.
fn value_kind(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "bool",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

// ============================================================================
// SECTION: Mapped Files
// ============================================================================

/// Fallback mime when neither mapping nor data URI names one.
const DEFAULT_MIME: &str = "application/octet-stream";

/// An attachment file extracted from collected form data.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MappedFile {
    /// Original filename, when collected.
    pub filename: Option<String>,
    /// Mime type to record.
    pub mime: String,
    /// Decoded file content.
    pub bytes: Vec<u8>,
}

// ============================================================================
// SECTION: Mapper
// ============================================================================

/// Maps collected form data into payload patches and attachment files.
#[derive(Debug, Clone, Default)]
pub struct FormFlowDataMapper {
    /// Mapping used when the driver does not carry one.
    default_mapping: Option<FormFlowMapping>,
}

impl FormFlowDataMapper {
    /// Creates a mapper with no default mapping.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a mapper that falls back to `mapping` for drivers without one.
    #[must_use]
    pub fn with_default_mapping(mapping: FormFlowMapping) -> Self {
        Self {
            default_mapping: Some(mapping),
        }
    }

    /// Picks the mapping for a driver: its own, else the mapper's default.
    #[must_use]
    pub fn mapping_for<'a>(
        &'a self,
        driver_mapping: Option<&'a FormFlowMapping>,
    ) -> Option<&'a FormFlowMapping> {
        driver_mapping.or(self.default_mapping.as_ref())
    }

    /// Builds a payload patch from collected data.
    ///
    /// Each mapped field uses a `path[:cast][ | fallback-path[:cast]]`
    /// expression; the first alternative that resolves to a non-null value
    /// wins. Sections where nothing resolves are omitted.
    #[must_use]
    pub fn to_payload(
        &self,
        collected: &CollectedData,
        mapping: &FormFlowMapping,
    ) -> Map<String, Value> {
        let mut patch = Map::new();
        for (section, fields) in &mapping.payload {
            let mut section_patch = Map::new();
            for (field, expression) in fields {
                if let Some(value) = resolve_expression(collected, expression) {
                    section_patch.insert(field.clone(), value);
                }
            }
            if !section_patch.is_empty() {
                patch.insert(section.clone(), Value::Object(section_patch));
            }
        }
        patch
    }

    /// Extracts attachment files from collected data.
    ///
    /// Sources may be base64 strings (with or without a data-URI prefix) or
    /// arrays of byte values. Missing or undecodable sources are skipped.
    #[must_use]
    pub fn extract_attachments(
        &self,
        collected: &CollectedData,
        mapping: &FormFlowMapping,
    ) -> Vec<(DocType, MappedFile)> {
        let mut files = Vec::new();
        for (doc_type, attachment) in &mapping.attachments {
            if let Some(file) = extract_file(collected, doc_type, attachment) {
                files.push((doc_type.clone(), file));
            }
        }
        files
    }
}

// ============================================================================
// SECTION: Expression Resolution
// ============================================================================

/// Resolves one mapping expression (`path[:cast][ | fallback]`) against
/// collected data.
fn resolve_expression(collected: &CollectedData, expression: &str) -> Option<Value> {
    for alternative in expression.split('|') {
        let alternative = alternative.trim();
        if alternative.is_empty() {
            continue;
        }
        let (path, cast) = match alternative.split_once(':') {
            Some((path, cast)) => (path.trim(), Some(cast.trim())),
            None => (alternative, None),
        };
        let Some(value) = collected.get(path) else {
            continue;
        };
        if value.is_null() {
            continue;
        }
        return Some(match cast {
            Some(cast) => apply_cast(value, cast, path),
            None => value.clone(),
        });
    }
    None
}

/// Applies a cast suffix to a resolved value; failures log and pass the
/// value through unchanged.
#[allow(
    clippy::cast_possible_truncation,
    reason = "Integer casts on collected form values saturate acceptably."
)]
fn apply_cast(value: &Value, cast: &str, path: &str) -> Value {
    let converted = match cast {
        "float" => cast_float(value).and_then(Number::from_f64).map(Value::Number),
        "int" => cast_float(value).map(|f| Value::Number(Number::from(f as i64))),
        "bool" => cast_bool(value).map(Value::Bool),
        "string" => cast_string(value).map(Value::String),
        other => {
            warn!(cast = other, path, "unknown cast in mapping expression");
            None
        }
    };
    converted.unwrap_or_else(|| {
        warn!(cast, path, "cast failed; keeping original value");
        value.clone()
    })
}

/// Coerces a JSON value to a float.
fn cast_float(value: &Value) -> Option<f64> {
    match value {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.trim().parse::<f64>().ok(),
        Value::Bool(b) => Some(if *b { 1.0 } else { 0.0 }),
        _ => None,
    }
}

/// Coerces a JSON value to a boolean.
fn cast_bool(value: &Value) -> Option<bool> {
    match value {
        Value::Bool(b) => Some(*b),
        Value::Number(n) => n.as_f64().map(|f| f != 0.0),
        Value::String(s) => match s.trim().to_ascii_lowercase().as_str() {
            "true" | "1" | "yes" | "on" => Some(true),
            "false" | "0" | "no" | "off" | "" => Some(false),
            _ => None,
        },
        _ => None,
    }
}

/// Coerces a JSON scalar to a string.
fn cast_string(value: &Value) -> Option<String> {
    match value {
        Value::String(s) => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        Value::Bool(b) => Some(b.to_string()),
        _ => None,
    }
}

// ============================================================================
// SECTION: Attachment Extraction
// ============================================================================

/// Decodes one mapped attachment from collected data into raw bytes.
fn extract_file(
    collected: &CollectedData,
    doc_type: &DocType,
    mapping: &AttachmentMapping,
) -> Option<MappedFile> {
    let Some(source) = collected.get(&mapping.source) else {
        debug!(doc_type = %doc_type, source = %mapping.source, "attachment source absent");
        return None;
    };

    let (bytes, data_uri_mime) = match source {
        Value::String(encoded) => {
            let (mime, payload) = split_data_uri(encoded);
            match BASE64.decode(payload.trim()) {
                Ok(bytes) => (bytes, mime),
                Err(error) => {
                    warn!(
                        doc_type = %doc_type,
                        source = %mapping.source,
                        %error,
                        "attachment source is not valid base64; skipping"
                    );
                    return None;
                }
            }
        }
        Value::Array(items) => {
            let mut bytes = Vec::with_capacity(items.len());
            for item in items {
                match item.as_u64().and_then(|v| u8::try_from(v).ok()) {
                    Some(byte) => bytes.push(byte),
                    None => {
                        warn!(
                            doc_type = %doc_type,
                            source = %mapping.source,
                            "attachment byte array holds non-byte values; skipping"
                        );
                        return None;
                    }
                }
            }
            (bytes, None)
        }
        other => {
            warn!(
                doc_type = %doc_type,
                source = %mapping.source,
                shape = %value_kind(other),
                "attachment source has unsupported shape; skipping"
            );
            return None;
        }
    };

    let filename = mapping
        .filename
        .as_ref()
        .and_then(|path| collected.get(path))
        .and_then(Value::as_str)
        .map(ToString::to_string);

    let mime = resolve_mime(collected, mapping, data_uri_mime);

    Some(MappedFile {
        filename,
        mime,
        bytes,
    })
}

/// Splits `data:<mime>;base64,<payload>` into its parts; plain base64 passes
/// through unchanged.
fn split_data_uri(encoded: &str) -> (Option<String>, &str) {
    if let Some(rest) = encoded.strip_prefix("data:")
        && let Some((header, payload)) = rest.split_once(',')
    {
        let mime = header
            .split(';')
            .next()
            .filter(|m| !m.is_empty())
            .map(ToString::to_string);
        return (mime, payload);
    }
    (None, encoded)
}

/// Determines the MIME type for a mapped attachment.
fn resolve_mime(
    collected: &CollectedData,
    mapping: &AttachmentMapping,
    data_uri_mime: Option<String>,
) -> String {
    if let Some(configured) = &mapping.mime {
        // A literal mime type contains a slash; anything else is a path.
        if configured.contains('/') {
            return configured.clone();
        }
        if let Some(value) = collected.get(configured).and_then(Value::as_str) {
            return value.to_string();
        }
    }
    data_uri_mime.unwrap_or_else(|| DEFAULT_MIME.to_string())
}

// ============================================================================
// SECTION: Tests
// ============================================================================
