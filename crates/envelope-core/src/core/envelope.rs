// crates/envelope-core/src/core/envelope.rs
// ============================================================================
// Module: Envelope State
// Description: Mutable per-case state accumulating evidence toward settlement.
// Purpose: Hold payload, checklist, signals, attachments, gates, and audit trail.
// Dependencies: serde, serde_json
// ============================================================================

//! ## Overview
//! An [`Envelope`] is the long-lived record for one case (one voucher, one
//! disbursement). It pins a driver snapshot at creation and accumulates
//! payload data, attachments, signal values, and review outcomes until its
//! gates report it ready to settle.
//! Invariants:
//! - The pinned [`DriverKey`](crate::core::identifiers::DriverKey) never
//!   changes after creation.
//! - `payload_version` increments on every applied payload patch.
//! - `revision` increments on every persisted write; stores compare-and-swap
//!   on it.
//! - The gates cache is a persisted snapshot of a pure computation; it is
//!   never the source of truth.

// ============================================================================
// SECTION: Imports
// ============================================================================

use std::collections::BTreeMap;

use serde::Deserialize;
use serde::Serialize;
use serde_json::Map;
use serde_json::Value;

use crate::core::driver::ChecklistTemplateItem;
use crate::core::identifiers::AttachmentId;
use crate::core::identifiers::ChecklistKey;
use crate::core::identifiers::DocType;
use crate::core::identifiers::DriverKey;
use crate::core::identifiers::EnvelopeId;
use crate::core::identifiers::GateKey;
use crate::core::identifiers::ReferenceCode;
use crate::core::identifiers::SignalKey;
use crate::core::time::Timestamp;
use crate::interfaces::StorageRef;

// ============================================================================
// SECTION: Status
// ============================================================================

/// Lifecycle status of an envelope.
///
/// The first four states form the automatic forward path; the rest are
/// administrative states reached only through explicit service calls.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EnvelopeStatus {
    /// Created, no evidence collected yet.
    Draft,
    /// Evidence collection under way.
    InProgress,
    /// All required evidence present; awaiting review.
    ReadyForReview,
    /// Required evidence accepted and the `settleable` gate open.
    ReadyToSettle,
    /// Frozen for settlement; no further edits.
    Locked,
    /// Settlement completed. Terminal.
    Settled,
    /// Case withdrawn. Terminal unless reopened.
    Cancelled,
    /// Case refused by a reviewer. Terminal unless reopened.
    Rejected,
    /// Returned to collection after a rejection, cancellation, or lock.
    Reopened,
}

impl EnvelopeStatus {
    /// Returns the wire-form string (`snake_case`) for this status.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Draft => "draft",
            Self::InProgress => "in_progress",
            Self::ReadyForReview => "ready_for_review",
            Self::ReadyToSettle => "ready_to_settle",
            Self::Locked => "locked",
            Self::Settled => "settled",
            Self::Cancelled => "cancelled",
            Self::Rejected => "rejected",
            Self::Reopened => "reopened",
        }
    }

    /// Position on the automatic forward path; `None` for states outside it.
    #[must_use]
    pub const fn auto_rank(self) -> Option<u8> {
        match self {
            Self::Draft => Some(0),
            Self::InProgress => Some(1),
            Self::ReadyForReview => Some(2),
            Self::ReadyToSettle => Some(3),
            Self::Locked
            | Self::Settled
            | Self::Cancelled
            | Self::Rejected
            | Self::Reopened => None,
        }
    }

    /// Returns true when evidence writes are accepted in this status.
    #[must_use]
    pub const fn can_edit(self) -> bool {
        matches!(
            self,
            Self::Draft | Self::InProgress | Self::ReadyForReview | Self::Reopened
        )
    }

    /// Returns true when the envelope may be locked for settlement.
    #[must_use]
    pub const fn can_lock(self) -> bool {
        matches!(self, Self::ReadyToSettle)
    }

    /// Returns true when the envelope may be settled.
    #[must_use]
    pub const fn can_settle(self) -> bool {
        matches!(self, Self::Locked)
    }

    /// Returns true when the envelope may be cancelled.
    #[must_use]
    pub const fn can_cancel(self) -> bool {
        !matches!(self, Self::Settled | Self::Cancelled | Self::Rejected)
    }

    /// Returns true when the envelope may be rejected by a reviewer.
    #[must_use]
    pub const fn can_reject(self) -> bool {
        !matches!(self, Self::Settled | Self::Cancelled | Self::Rejected)
    }

    /// Returns true when the envelope may be reopened for further collection.
    #[must_use]
    pub const fn can_reopen(self) -> bool {
        matches!(self, Self::Locked | Self::Cancelled | Self::Rejected)
    }
}

impl std::fmt::Display for EnvelopeStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

// ============================================================================
// SECTION: Checklist
// ============================================================================

/// What kind of evidence satisfies a checklist item.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChecklistItemKind {
    /// Satisfied by an attachment of the linked document type.
    Document,
    /// Satisfied by a non-null value at the linked payload pointer.
    PayloadField,
    /// Satisfied by a truthy value of the linked signal.
    Signal,
    /// Satisfied by an explicit attestation call.
    Attestation,
}

/// Review treatment applied when a checklist item's evidence arrives.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReviewMode {
    /// Evidence auto-accepts on arrival.
    #[default]
    None,
    /// Evidence waits in `pending_review` but does not hold up readiness;
    /// a reviewer may still accept or reject it.
    Optional,
    /// Evidence waits in `pending_review` until a reviewer decides.
    Required,
}

/// Current state of one checklist item.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChecklistItemStatus {
    /// No evidence yet.
    Missing,
    /// Evidence present, awaiting a reviewer decision.
    PendingReview,
    /// Evidence present and accepted.
    Accepted,
    /// Evidence present and rejected; replacement needed.
    Rejected,
}

/// Reviewer decision on a piece of evidence.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReviewDecision {
    /// Accept the evidence.
    Accept,
    /// Reject the evidence; a reason is recorded.
    Reject,
}

/// A checklist item materialized onto an envelope from the driver template.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChecklistItem {
    /// Stable checklist key.
    pub key: ChecklistKey,
    /// Evidence kind, copied from the template.
    pub kind: ChecklistItemKind,
    /// Whether the item counts toward review-readiness.
    pub required: bool,
    /// Review treatment, copied from the template.
    pub review: ReviewMode,
    /// Linked document type for `document` items.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub doc_type: Option<DocType>,
    /// Linked payload pointer for `payload_field` items.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pointer: Option<String>,
    /// Linked signal key for `signal` items.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub signal: Option<SignalKey>,
    /// Linked attestation type for `attestation` items.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub attestation_type: Option<String>,
    /// Current item status.
    pub status: ChecklistItemStatus,
    /// Reviewer note recorded with the latest decision, if any.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub note: Option<String>,
}

impl ChecklistItem {
    /// Materializes a fresh item from a driver template entry.
    #[must_use]
    pub fn from_template(template: &ChecklistTemplateItem) -> Self {
        Self {
            key: template.key.clone(),
            kind: template.kind,
            required: template.required,
            review: template.review,
            doc_type: template.doc_type.clone(),
            pointer: template.pointer.clone(),
            signal: template.signal.clone(),
            attestation_type: template.attestation_type.clone(),
            status: ChecklistItemStatus::Missing,
            note: None,
        }
    }

    /// Returns true when the item has accepted evidence.
    #[must_use]
    pub const fn is_accepted(&self) -> bool {
        matches!(self.status, ChecklistItemStatus::Accepted)
    }

    /// Returns true when any evidence is present, accepted or not.
    #[must_use]
    pub const fn is_present(&self) -> bool {
        !matches!(self.status, ChecklistItemStatus::Missing)
    }

    /// Returns true when the item no longer holds up acceptance-based
    /// readiness. Evidence under `optional` review counts while it awaits a
    /// decision; `required` review holds readiness until accepted.
    #[must_use]
    pub const fn counts_as_accepted(&self) -> bool {
        match self.status {
            ChecklistItemStatus::Accepted => true,
            ChecklistItemStatus::PendingReview => matches!(self.review, ReviewMode::Optional),
            ChecklistItemStatus::Missing | ChecklistItemStatus::Rejected => false,
        }
    }
}

// ============================================================================
// SECTION: Signals
// ============================================================================

/// A signal value; untyped on the wire, typed for gate evaluation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum SignalValue {
    /// Boolean signal.
    Bool(bool),
    /// Numeric signal.
    Number(f64),
    /// String signal.
    String(String),
}

impl SignalValue {
    /// Truthiness used when a signal satisfies a checklist item.
    #[must_use]
    pub fn is_truthy(&self) -> bool {
        match self {
            Self::Bool(value) => *value,
            Self::Number(value) => *value != 0.0,
            Self::String(value) => !value.is_empty() && value != "0",
        }
    }
}

/// Recorded state of one signal on an envelope.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SignalState {
    /// The recorded value; `None` until first set (driver default applies).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub value: Option<SignalValue>,
    /// Actor label that recorded the value.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub set_by: Option<String>,
    /// When the value was recorded.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub set_at: Option<Timestamp>,
}

// ============================================================================
// SECTION: Attachments
// ============================================================================

/// Review state of an attachment.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReviewStatus {
    /// Awaiting a reviewer decision (or auto-accepted items skip this).
    #[default]
    Pending,
    /// Accepted by a reviewer or auto-accepted.
    Accepted,
    /// Rejected; does not satisfy checklist items.
    Rejected,
}

/// An uploaded piece of file evidence.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Attachment {
    /// Attachment identifier assigned at upload time.
    pub id: AttachmentId,
    /// Document type this attachment satisfies.
    pub doc_type: DocType,
    /// Original filename, when known.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub filename: Option<String>,
    /// Mime type recorded at upload.
    pub mime: String,
    /// Content size in bytes.
    pub size_bytes: u64,
    /// Lowercase hex SHA-256 of the content; drives upload dedup.
    pub sha256: String,
    /// Where the blob store persisted the content.
    pub storage: StorageRef,
    /// Review state.
    pub review: ReviewStatus,
    /// Reason recorded with a rejection.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub review_reason: Option<String>,
    /// Upload time.
    pub uploaded_at: Timestamp,
}

// ============================================================================
// SECTION: Gates Cache
// ============================================================================

/// Persisted snapshot of the last gate evaluation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GatesCache {
    /// Gate results keyed by gate key.
    pub results: BTreeMap<GateKey, bool>,
    /// When the snapshot was computed.
    pub computed_at: Timestamp,
}

impl GatesCache {
    /// Returns the cached result for a gate, if present.
    #[must_use]
    pub fn get(&self, key: &GateKey) -> Option<bool> {
        self.results.get(key).copied()
    }
}

// ============================================================================
// SECTION: Audit Trail
// ============================================================================

/// What an audit entry records.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AuditAction {
    /// Envelope created.
    Created,
    /// Payload patch applied.
    PayloadUpdated,
    /// Host context merged.
    ContextUpdated,
    /// Attachment uploaded.
    AttachmentUploaded,
    /// Attachment reviewed.
    AttachmentReviewed,
    /// Signal value recorded.
    SignalSet,
    /// Attestation recorded.
    AttestationRecorded,
    /// Status changed.
    StatusChanged,
}

/// One entry of the envelope audit trail.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AuditEntry {
    /// When the action happened.
    pub at: Timestamp,
    /// Actor label that performed the action.
    pub actor: String,
    /// What happened.
    pub action: AuditAction,
    /// Structured detail (changed keys, decision, target ids).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub detail: Option<Value>,
}

// ============================================================================
// SECTION: Envelope
// ============================================================================

/// The per-case evidence record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    /// Envelope identifier.
    pub id: EnvelopeId,
    /// Pinned driver snapshot (`id@version`); immutable after creation.
    pub driver: DriverKey,
    /// External correlation identifier (e.g. a voucher code).
    pub reference_code: ReferenceCode,
    /// Lifecycle status.
    pub status: EnvelopeStatus,
    /// Structured payload document.
    #[serde(default)]
    pub payload: Map<String, Value>,
    /// Incremented on every applied payload patch.
    pub payload_version: u64,
    /// Host-scoped context map, merged outside the payload; never feeds
    /// checklist or gate evaluation.
    #[serde(default)]
    pub context: Map<String, Value>,
    /// Checklist items materialized from the driver template.
    #[serde(default)]
    pub checklist: Vec<ChecklistItem>,
    /// Signal states keyed by signal key.
    #[serde(default)]
    pub signals: BTreeMap<SignalKey, SignalState>,
    /// Uploaded attachments, in upload order.
    #[serde(default)]
    pub attachments: Vec<Attachment>,
    /// Last gate evaluation snapshot.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub gates_cache: Option<GatesCache>,
    /// Store revision for compare-and-swap writes.
    pub revision: u64,
    /// Audit trail, append-only.
    #[serde(default)]
    pub audit: Vec<AuditEntry>,
    /// Creation time.
    pub created_at: Timestamp,
    /// Last update time.
    pub updated_at: Timestamp,
}

impl Envelope {
    /// Creates a fresh draft envelope pinned to a driver snapshot.
    #[must_use]
    pub fn new(
        id: EnvelopeId,
        driver: DriverKey,
        reference_code: ReferenceCode,
        now: Timestamp,
    ) -> Self {
        Self {
            id,
            driver,
            reference_code,
            status: EnvelopeStatus::Draft,
            payload: Map::new(),
            payload_version: 0,
            context: Map::new(),
            checklist: Vec::new(),
            signals: BTreeMap::new(),
            attachments: Vec::new(),
            gates_cache: None,
            revision: 0,
            audit: Vec::new(),
            created_at: now,
            updated_at: now,
        }
    }

    /// Looks up a checklist item by key.
    #[must_use]
    pub fn checklist_item(&self, key: &ChecklistKey) -> Option<&ChecklistItem> {
        self.checklist.iter().find(|item| &item.key == key)
    }

    /// Looks up a checklist item mutably by key.
    pub fn checklist_item_mut(&mut self, key: &ChecklistKey) -> Option<&mut ChecklistItem> {
        self.checklist.iter_mut().find(|item| &item.key == key)
    }

    /// Looks up an attachment by id.
    #[must_use]
    pub fn attachment(&self, id: &AttachmentId) -> Option<&Attachment> {
        self.attachments.iter().find(|a| &a.id == id)
    }

    /// Returns all attachments of a document type, in upload order.
    pub fn attachments_of_type<'a>(
        &'a self,
        doc_type: &'a DocType,
    ) -> impl Iterator<Item = &'a Attachment> {
        self.attachments.iter().filter(move |a| &a.doc_type == doc_type)
    }

    /// Returns the recorded value of a signal, if one has been set.
    #[must_use]
    pub fn signal_value(&self, key: &SignalKey) -> Option<&SignalValue> {
        self.signals.get(key).and_then(|state| state.value.as_ref())
    }

    /// Returns true when the payload holds no data.
    #[must_use]
    pub fn payload_is_empty(&self) -> bool {
        self.payload.is_empty()
    }
}

// ============================================================================
// SECTION: Tests
// ============================================================================
