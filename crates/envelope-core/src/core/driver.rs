// crates/envelope-core/src/core/driver.rs
// ============================================================================
// Module: Driver Configuration
// Description: Immutable per-use-case configuration snapshot for envelopes.
// Purpose: Define documents, checklist, signals, gates, and mapping for a driver.
// Dependencies: gate-logic, serde, serde_json
// ============================================================================

//! ## Overview
//! A [`Driver`] is the immutable configuration snapshot a use case pins at
//! envelope creation: the payload schema reference, the registry of
//! acceptable document types, the checklist template, signal definitions,
//! gate rules (parsed once at load), and the optional form-flow mapping.
//! Invariants:
//! - A loaded driver never changes; new behavior ships as a new version.
//! - Gate rules are parsed ASTs; evaluation never re-parses rule text.
//! - Gates evaluate in definition order and may only reference earlier gates.

// ============================================================================
// SECTION: Imports
// ============================================================================

use std::collections::BTreeMap;

use gate_logic::RuleExpr;
use serde::Deserialize;
use serde::Serialize;

use crate::core::envelope::ChecklistItemKind;
use crate::core::envelope::ReviewMode;
use crate::core::envelope::SignalValue;
use crate::core::identifiers::ChecklistKey;
use crate::core::identifiers::DocType;
use crate::core::identifiers::DriverId;
use crate::core::identifiers::DriverKey;
use crate::core::identifiers::DriverVersion;
use crate::core::identifiers::GateKey;
use crate::core::identifiers::SignalKey;

// ============================================================================
// SECTION: Payload Configuration
// ============================================================================

/// Reference to the schema the envelope payload is expected to follow.
///
/// Payload writes are deliberately lenient; the schema reference is carried
/// for hosts that validate at presentation or settlement time.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PayloadSchema {
    /// Stable schema identifier (e.g. `voucher.cash/v1`).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub schema_id: Option<String>,
    /// Schema format hint (e.g. `json-schema`).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub format: Option<String>,
    /// External location of the schema document.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub uri: Option<String>,
    /// Inline schema document, when the driver embeds it.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub inline: Option<serde_json::Value>,
}

/// How payload writes are applied to the envelope.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PayloadStorage {
    /// Recursive merge; patch values win at leaves.
    #[default]
    MergePatch,
    /// Each write replaces the payload wholesale.
    Replace,
}

// ============================================================================
// SECTION: Document Registry
// ============================================================================

/// A document type the driver accepts as attachment evidence.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DocumentType {
    /// Document type key (e.g. `SELFIE`).
    pub doc_type: DocType,
    /// Human-readable label.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub label: Option<String>,
    /// Acceptable mime types; empty means any.
    #[serde(default)]
    pub allowed_mimes: Vec<String>,
    /// Maximum attachment size in megabytes; `None` means unbounded.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_size_mb: Option<u64>,
    /// Whether multiple attachments of this type may coexist.
    #[serde(default)]
    pub multiple: bool,
}

impl DocumentType {
    /// Returns true when the mime type is acceptable for this document type.
    #[must_use]
    pub fn accepts_mime(&self, mime: &str) -> bool {
        self.allowed_mimes.is_empty() || self.allowed_mimes.iter().any(|m| m == mime)
    }

    /// Returns the maximum attachment size in bytes, when bounded.
    #[must_use]
    pub fn max_size_bytes(&self) -> Option<u64> {
        self.max_size_mb.map(|mb| mb.saturating_mul(1024 * 1024))
    }
}

// ============================================================================
// SECTION: Checklist Template
// ============================================================================

/// One entry of the driver's checklist template.
///
/// # Invariants
/// - The kind-specific link is present: `document` items carry `doc_type`,
///   `payload_field` items carry `pointer`, `signal` items carry `signal`,
///   `attestation` items carry `attestation_type`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChecklistTemplateItem {
    /// Stable checklist key.
    pub key: ChecklistKey,
    /// Human-readable label.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub label: Option<String>,
    /// What kind of evidence satisfies this item.
    pub kind: ChecklistItemKind,
    /// Linked document type for `document` items.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub doc_type: Option<DocType>,
    /// Linked payload pointer for `payload_field` items (e.g. `/payee/name`).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pointer: Option<String>,
    /// Linked signal key for `signal` items.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub signal: Option<SignalKey>,
    /// Linked attestation type for `attestation` items.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub attestation_type: Option<String>,
    /// Whether the item must be satisfied before review-readiness.
    #[serde(default)]
    pub required: bool,
    /// Review treatment once evidence is present.
    #[serde(default)]
    pub review: ReviewMode,
}

// ============================================================================
// SECTION: Signal Definitions
// ============================================================================

/// Provenance category of a signal; governs who may write it.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SignalCategory {
    /// Produced by integrations; system writes require `system_settable`.
    Integration,
    /// Human judgment; never writable by the system actor. Omitted
    /// categories land here so an unlabeled signal is closed to the
    /// system path, not open.
    #[default]
    Decision,
}

/// One signal the driver tracks on the envelope.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SignalDef {
    /// Stable signal key.
    pub key: SignalKey,
    /// Human-readable label.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub label: Option<String>,
    /// Provenance category.
    #[serde(default)]
    pub category: SignalCategory,
    /// Value assumed while the signal is unset.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub default: Option<SignalValue>,
    /// Whether a value must be present before settlement.
    #[serde(default)]
    pub required: bool,
    /// Whether the system actor may write an `integration` signal.
    #[serde(default)]
    pub system_settable: bool,
}

// ============================================================================
// SECTION: Gate Definitions
// ============================================================================

/// One named gate: a parsed boolean rule over the envelope context.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GateDef {
    /// Stable gate key; `settleable` is consulted for the final transition.
    pub key: GateKey,
    /// Human-readable label.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub label: Option<String>,
    /// Parsed rule AST, built once at driver load.
    pub rule: RuleExpr,
    /// Original rule text as written in the driver document.
    pub source: String,
}

// ============================================================================
// SECTION: Form-Flow Mapping
// ============================================================================

/// Mapping from one attachment source in collected form data.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AttachmentMapping {
    /// Dotted path to the file content within the collected data.
    pub source: String,
    /// Dotted path to the original filename, when collected.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub filename: Option<String>,
    /// Mime type to record, or dotted path to one; defaults applied upstream.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mime: Option<String>,
}

/// Declarative mapping from collected form data to payload and attachments.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct FormFlowMapping {
    /// Payload sections: section key to field-name/source-expression pairs.
    ///
    /// Source expressions take the form `path[:cast][ | fallback-path]`.
    #[serde(default)]
    pub payload: BTreeMap<String, BTreeMap<String, String>>,
    /// Attachment extraction keyed by document type.
    #[serde(default)]
    pub attachments: BTreeMap<DocType, AttachmentMapping>,
}

impl FormFlowMapping {
    /// Returns true when the mapping maps nothing.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.payload.is_empty() && self.attachments.is_empty()
    }
}

// ============================================================================
// SECTION: Audit and Manifest Configuration
// ============================================================================

/// Controls what the envelope audit trail records.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AuditConfig {
    /// Whether audit entries are recorded at all.
    pub enabled: bool,
    /// Whether payload-change entries carry the set of changed keys.
    #[serde(default)]
    pub include_payload_keys: bool,
}

impl Default for AuditConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            include_payload_keys: true,
        }
    }
}

/// Controls what a settlement manifest assembled by the host includes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ManifestConfig {
    /// Include the payload document.
    pub include_payload: bool,
    /// Include attachment descriptors.
    pub include_attachments: bool,
    /// Include signal values.
    pub include_signals: bool,
}

impl Default for ManifestConfig {
    fn default() -> Self {
        Self {
            include_payload: true,
            include_attachments: true,
            include_signals: false,
        }
    }
}

// ============================================================================
// SECTION: Driver
// ============================================================================

/// Immutable driver configuration snapshot.
///
/// # Invariants
/// - Built once by the registry; shared as `Arc<Driver>` and never mutated.
/// - `gates` is ordered; each rule references only earlier gates via `gate.*`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Driver {
    /// Driver identifier.
    pub id: DriverId,
    /// Driver version.
    pub version: DriverVersion,
    /// Human-readable title.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
    /// Human-readable description.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    /// Payload schema reference.
    #[serde(default)]
    pub payload_schema: PayloadSchema,
    /// Payload write strategy.
    #[serde(default)]
    pub payload_storage: PayloadStorage,
    /// Registry of acceptable document types.
    #[serde(default)]
    pub documents: Vec<DocumentType>,
    /// Checklist template, materialized onto every new envelope.
    #[serde(default)]
    pub checklist: Vec<ChecklistTemplateItem>,
    /// Signal definitions.
    #[serde(default)]
    pub signals: Vec<SignalDef>,
    /// Gate definitions in evaluation order.
    #[serde(default)]
    pub gates: Vec<GateDef>,
    /// Audit trail configuration.
    #[serde(default)]
    pub audit: AuditConfig,
    /// Settlement manifest configuration.
    #[serde(default)]
    pub manifest: ManifestConfig,
    /// Optional declarative form-flow mapping.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub form_flow_mapping: Option<FormFlowMapping>,
}

impl Driver {
    /// Returns the composite `id@version` key of this driver.
    #[must_use]
    pub fn key(&self) -> DriverKey {
        DriverKey::new(self.id.clone(), self.version.clone())
    }

    /// Looks up a document type by key.
    #[must_use]
    pub fn document_type(&self, doc_type: &DocType) -> Option<&DocumentType> {
        self.documents.iter().find(|d| &d.doc_type == doc_type)
    }

    /// Looks up a checklist template item by key.
    #[must_use]
    pub fn checklist_item(&self, key: &ChecklistKey) -> Option<&ChecklistTemplateItem> {
        self.checklist.iter().find(|c| &c.key == key)
    }

    /// Looks up a signal definition by key.
    #[must_use]
    pub fn signal_def(&self, key: &SignalKey) -> Option<&SignalDef> {
        self.signals.iter().find(|s| &s.key == key)
    }

    /// Looks up a gate definition by key.
    #[must_use]
    pub fn gate_def(&self, key: &GateKey) -> Option<&GateDef> {
        self.gates.iter().find(|g| &g.key == key)
    }
}

// ============================================================================
// SECTION: Tests
// ============================================================================

#[cfg(test)]
mod tests {
    #![allow(
        clippy::unwrap_used,
        clippy::expect_used,
        clippy::panic,
        clippy::missing_docs_in_private_items,
        reason = "Test-only panic-based assertions are permitted."
    )]

    use super::DocumentType;
    use crate::core::identifiers::DocType;

    #[test]
    fn document_type_with_no_mimes_accepts_anything() {
        let doc = DocumentType {
            doc_type: DocType::new("SELFIE"),
            label: None,
            allowed_mimes: Vec::new(),
            max_size_mb: None,
            multiple: false,
        };
        assert!(doc.accepts_mime("image/png"));
        assert!(doc.accepts_mime("application/pdf"));
    }

    #[test]
    fn document_type_restricts_to_listed_mimes() {
        let doc = DocumentType {
            doc_type: DocType::new("SELFIE"),
            label: None,
            allowed_mimes: vec!["image/png".to_string(), "image/jpeg".to_string()],
            max_size_mb: Some(5),
            multiple: false,
        };
        assert!(doc.accepts_mime("image/jpeg"));
        assert!(!doc.accepts_mime("application/pdf"));
        assert_eq!(doc.max_size_bytes(), Some(5 * 1024 * 1024));
    }
}
