// crates/envelope-core/src/runtime/service.rs
// ============================================================================
// Module: Envelope Service
// Description: All evidence writes and lifecycle transitions for envelopes.
// Purpose: Apply driver rules to payload, attachment, signal, and status writes.
// Dependencies: gate-logic (via gates), serde_json, sha2, thiserror, tracing
// ============================================================================

//! ## Overview
//! Every mutation of an envelope goes through the service: payload patches,
//! attachment uploads with validation and content dedup, signal writes with
//! actor gating, reviewer decisions, attestations, and the administrative
//! lifecycle transitions. The service mutates envelopes in place and
//! refreshes the gates cache; persistence belongs to the caller.
//! Invariants:
//! - Evidence writes are accepted only while the status is editable.
//! - An attachment with the same document type and content hash as an
//!   existing one is a no-op, never a duplicate upload.
//! - `decision` signals are never writable by the system actor.
//! - Locking re-evaluates the `settleable` gate; the cache alone never
//!   authorizes settlement.

// ============================================================================
// SECTION: Imports
// ============================================================================

use std::sync::Arc;

use serde_json::Map;
use serde_json::Value;
use serde_json::json;
use sha2::Digest;
use sha2::Sha256;
use thiserror::Error;
use tracing::debug;
use tracing::info;

use crate::core::driver::Driver;
use crate::core::driver::PayloadStorage;
use crate::core::driver::SignalCategory;
use crate::core::envelope::Attachment;
use crate::core::envelope::AuditAction;
use crate::core::envelope::AuditEntry;
use crate::core::envelope::ChecklistItem;
use crate::core::envelope::ChecklistItemKind;
use crate::core::envelope::ChecklistItemStatus;
use crate::core::envelope::Envelope;
use crate::core::envelope::EnvelopeStatus;
use crate::core::envelope::GatesCache;
use crate::core::envelope::ReviewDecision;
use crate::core::envelope::ReviewMode;
use crate::core::envelope::ReviewStatus;
use crate::core::envelope::SignalState;
use crate::core::envelope::SignalValue;
use crate::core::identifiers::AttachmentId;
use crate::core::identifiers::ChecklistKey;
use crate::core::identifiers::DocType;
use crate::core::identifiers::EnvelopeId;
use crate::core::identifiers::GateKey;
use crate::core::identifiers::ReferenceCode;
use crate::core::identifiers::SignalKey;
use crate::core::time::Timestamp;
use crate::interfaces::BlobStore;
use crate::interfaces::BlobStoreError;
use crate::runtime::gates::GateEvaluator;
use crate::runtime::mapper::MappedFile;
use crate::runtime::pointer::field_exists;
use crate::runtime::pointer::merge_patch;

// ============================================================================
// SECTION: Actor
// ============================================================================

/// Who is performing a write.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Actor {
    /// The automated integration path (form-flow sync, schedulers).
    System,
    /// A human operator or reviewer.
    User(String),
}

impl Actor {
    /// Returns the audit label for this actor.
    #[must_use]
    pub fn label(&self) -> String {
        match self {
            Self::System => "system".to_string(),
            Self::User(id) => format!("user:{id}"),
        }
    }

    /// Returns true for the system actor.
    #[must_use]
    pub const fn is_system(&self) -> bool {
        matches!(self, Self::System)
    }
}

// ============================================================================
// SECTION: Errors
// ============================================================================

/// Errors surfaced by envelope service operations.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ServiceError {
    /// The envelope status does not accept evidence writes.
    #[error("envelope is not editable in status `{status}`")]
    NotEditable {
        /// Current status.
        status: EnvelopeStatus,
    },
    /// The document type is not registered by the driver.
    #[error("document type `{doc_type}` is not registered by the driver")]
    UnsupportedDocumentType {
        /// The offending document type.
        doc_type: DocType,
    },
    /// The attachment mime type is not acceptable for the document type.
    #[error("mime `{mime}` is not allowed for document type `{doc_type}`")]
    InvalidMime {
        /// The document type.
        doc_type: DocType,
        /// The rejected mime type.
        mime: String,
    },
    /// The attachment exceeds the document type's size limit.
    #[error("attachment of {size_bytes} bytes exceeds limit of {max_bytes} for `{doc_type}`")]
    AttachmentTooLarge {
        /// The document type.
        doc_type: DocType,
        /// Actual content size.
        size_bytes: u64,
        /// Configured maximum.
        max_bytes: u64,
    },
    /// No attachment exists under the given id.
    #[error("attachment `{id}` not found on envelope")]
    UnknownAttachment {
        /// The requested attachment id.
        id: AttachmentId,
    },
    /// No attestation-kind checklist item links the given attestation type.
    #[error("no checklist item takes attestation `{attestation_type}`")]
    UnknownAttestationType {
        /// The requested attestation type.
        attestation_type: String,
    },
    /// The signal is not defined by the driver.
    #[error("signal `{key}` is not defined by the driver")]
    UnknownSignal {
        /// The requested signal key.
        key: SignalKey,
    },
    /// A decision signal was written from the system path.
    #[error("signal `{key}` records a decision and cannot be set by the system")]
    DecisionSignalFromSystem {
        /// The signal key.
        key: SignalKey,
    },
    /// An integration signal without `system_settable` was written by the
    /// system path.
    #[error("signal `{key}` is not system-settable")]
    SignalNotSystemSettable {
        /// The signal key.
        key: SignalKey,
    },
    /// A rejection or reopen was attempted without a reason.
    #[error("`{action}` requires a reason")]
    ReasonRequired {
        /// The attempted action.
        action: &'static str,
    },
    /// The lifecycle transition is not allowed from the current status.
    #[error("cannot `{action}` from status `{status}`")]
    InvalidTransition {
        /// The attempted action.
        action: &'static str,
        /// Current status.
        status: EnvelopeStatus,
    },
    /// Locking was attempted while the `settleable` gate is closed.
    #[error("the settleable gate is closed; envelope cannot be locked")]
    SettleableGateClosed,
    /// The blob store failed to persist attachment content.
    #[error(transparent)]
    Blob(#[from] BlobStoreError),
}

// ============================================================================
// SECTION: Service
// ============================================================================

/// Applies driver rules to envelope writes.
pub struct EnvelopeService {
    /// Attachment byte storage.
    blobs: Arc<dyn BlobStore + Send + Sync>,
    /// Gate rule evaluator.
    evaluator: GateEvaluator,
}

impl std::fmt::Debug for EnvelopeService {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EnvelopeService").finish_non_exhaustive()
    }
}

impl EnvelopeService {
    /// Creates a service backed by the given blob store.
    #[must_use]
    pub fn new(blobs: Arc<dyn BlobStore + Send + Sync>) -> Self {
        Self {
            blobs,
            evaluator: GateEvaluator::new(),
        }
    }

    // ------------------------------------------------------------------
    // Creation
    // ------------------------------------------------------------------

    /// Creates a draft envelope pinned to `driver`, with checklist items and
    /// signal slots materialized and gates computed.
    ///
    /// The initial payload, when given, is applied without status
    /// advancement; the first sync or explicit activation moves the envelope
    /// forward.
    #[must_use]
    pub fn create(
        &self,
        id: EnvelopeId,
        reference_code: ReferenceCode,
        driver: &Driver,
        initial_payload: Option<Map<String, Value>>,
        actor: &Actor,
        now: Timestamp,
    ) -> Envelope {
        let mut envelope = Envelope::new(id, driver.key(), reference_code, now);
        self.materialize_checklist(&mut envelope, driver);
        for def in &driver.signals {
            envelope.signals.entry(def.key.clone()).or_default();
        }
        if let Some(payload) = initial_payload
            && !payload.is_empty()
        {
            merge_patch(&mut envelope.payload, payload);
            envelope.payload_version = 1;
            recompute_payload_items(&mut envelope);
        }
        self.refresh_gates(&mut envelope, driver, now);
        record_audit(
            &mut envelope,
            driver,
            actor,
            AuditAction::Created,
            None,
            now,
        );
        info!(envelope = %envelope.id, driver = %envelope.driver, "envelope created");
        envelope
    }

    /// Adds any template checklist items the envelope is missing. Idempotent;
    /// existing item state is preserved.
    pub fn materialize_checklist(&self, envelope: &mut Envelope, driver: &Driver) {
        for template in &driver.checklist {
            if envelope.checklist_item(&template.key).is_none() {
                envelope.checklist.push(ChecklistItem::from_template(template));
            }
        }
    }

    // ------------------------------------------------------------------
    // Payload
    // ------------------------------------------------------------------

    /// Applies a payload patch and recomputes payload-linked checklist items.
    ///
    /// Returns the top-level keys the patch touched. An empty patch, or a
    /// patch that changes nothing, is a no-op: no version bump, no audit
    /// entry, no editability requirement. Re-running a sync with identical
    /// data therefore leaves the envelope byte-identical.
    ///
    /// # Errors
    /// Returns [`ServiceError::NotEditable`] outside the editable statuses.
    pub fn update_payload(
        &self,
        envelope: &mut Envelope,
        driver: &Driver,
        patch: Map<String, Value>,
        actor: &Actor,
        now: Timestamp,
    ) -> Result<Vec<String>, ServiceError> {
        if patch.is_empty() {
            return Ok(Vec::new());
        }
        let mut merged = envelope.payload.clone();
        let touched = match driver.payload_storage {
            PayloadStorage::MergePatch => merge_patch(&mut merged, patch),
            PayloadStorage::Replace => {
                let keys = patch.keys().cloned().collect();
                merged = patch;
                keys
            }
        };
        if merged == envelope.payload {
            return Ok(Vec::new());
        }
        ensure_editable(envelope)?;
        envelope.payload = merged;
        envelope.payload_version += 1;
        envelope.updated_at = now;
        recompute_payload_items(envelope);
        self.refresh_gates(envelope, driver, now);
        let detail = driver
            .audit
            .include_payload_keys
            .then(|| json!({ "keys": touched }));
        record_audit(
            envelope,
            driver,
            actor,
            AuditAction::PayloadUpdated,
            detail,
            now,
        );
        debug!(
            envelope = %envelope.id,
            version = envelope.payload_version,
            keys = touched.len(),
            "payload patch applied"
        );
        Ok(touched)
    }

    /// Merges a patch into the envelope's host-scoped context map.
    ///
    /// Context lives beside the payload, not in it: no payload version bump,
    /// no checklist recompute, no gate refresh. Empty and no-change patches
    /// are no-ops. Returns the top-level keys the patch touched.
    ///
    /// # Errors
    /// Returns [`ServiceError::NotEditable`] outside the editable statuses.
    pub fn update_context(
        &self,
        envelope: &mut Envelope,
        driver: &Driver,
        patch: Map<String, Value>,
        actor: &Actor,
        now: Timestamp,
    ) -> Result<Vec<String>, ServiceError> {
        if patch.is_empty() {
            return Ok(Vec::new());
        }
        let mut merged = envelope.context.clone();
        let touched = merge_patch(&mut merged, patch);
        if merged == envelope.context {
            return Ok(Vec::new());
        }
        ensure_editable(envelope)?;
        envelope.context = merged;
        envelope.updated_at = now;
        record_audit(
            envelope,
            driver,
            actor,
            AuditAction::ContextUpdated,
            Some(json!({ "keys": touched })),
            now,
        );
        Ok(touched)
    }

    // ------------------------------------------------------------------
    // Attachments
    // ------------------------------------------------------------------

    /// Uploads an attachment after document-type validation.
    ///
    /// Content is hashed with SHA-256; an existing attachment of the same
    /// document type with the same hash makes the upload a no-op and `None`
    /// is returned, regardless of status, so re-syncs stay idempotent. For
    /// single-instance document types a pending attachment with different
    /// content is superseded by the new upload.
    ///
    /// # Errors
    /// Returns validation errors before any blob write; blob failures
    /// propagate as [`ServiceError::Blob`].
    pub fn upload_attachment(
        &self,
        envelope: &mut Envelope,
        driver: &Driver,
        doc_type: &DocType,
        file: &MappedFile,
        actor: &Actor,
        now: Timestamp,
    ) -> Result<Option<AttachmentId>, ServiceError> {
        let Some(registered) = driver.document_type(doc_type) else {
            return Err(ServiceError::UnsupportedDocumentType {
                doc_type: doc_type.clone(),
            });
        };
        if !registered.accepts_mime(&file.mime) {
            return Err(ServiceError::InvalidMime {
                doc_type: doc_type.clone(),
                mime: file.mime.clone(),
            });
        }
        let size_bytes = file.bytes.len() as u64;
        if let Some(max_bytes) = registered.max_size_bytes()
            && size_bytes > max_bytes
        {
            return Err(ServiceError::AttachmentTooLarge {
                doc_type: doc_type.clone(),
                size_bytes,
                max_bytes,
            });
        }

        let sha256 = hex_digest(&file.bytes);
        if envelope
            .attachments_of_type(doc_type)
            .any(|existing| existing.sha256 == sha256)
        {
            debug!(envelope = %envelope.id, doc_type = %doc_type, "duplicate content; upload skipped");
            return Ok(None);
        }
        ensure_editable(envelope)?;
        if !registered.multiple {
            envelope.attachments.retain(|existing| {
                &existing.doc_type != doc_type || existing.review != ReviewStatus::Pending
            });
        }

        let storage = self.blobs.put(&envelope.id, doc_type, &file.bytes)?;
        let id = AttachmentId::new(format!("att-{doc_type}-{}", &sha256[..12]));
        let review_mode = document_review_mode(envelope, doc_type);
        let review = match review_mode {
            ReviewMode::None => ReviewStatus::Accepted,
            ReviewMode::Optional | ReviewMode::Required => ReviewStatus::Pending,
        };
        envelope.attachments.push(Attachment {
            id: id.clone(),
            doc_type: doc_type.clone(),
            filename: file.filename.clone(),
            mime: file.mime.clone(),
            size_bytes,
            sha256,
            storage,
            review,
            review_reason: None,
            uploaded_at: now,
        });
        recompute_document_items(envelope);
        envelope.updated_at = now;
        self.refresh_gates(envelope, driver, now);
        record_audit(
            envelope,
            driver,
            actor,
            AuditAction::AttachmentUploaded,
            Some(json!({ "attachment": id.as_str(), "doc_type": doc_type.as_str() })),
            now,
        );
        info!(envelope = %envelope.id, doc_type = %doc_type, attachment = %id, "attachment uploaded");
        Ok(Some(id))
    }

    /// Records a reviewer decision on an attachment and recomputes the
    /// linked checklist item.
    ///
    /// # Errors
    /// Rejections require a reason ([`ServiceError::ReasonRequired`]).
    pub fn review_attachment(
        &self,
        envelope: &mut Envelope,
        driver: &Driver,
        attachment_id: &AttachmentId,
        decision: ReviewDecision,
        reason: Option<String>,
        actor: &Actor,
        now: Timestamp,
    ) -> Result<(), ServiceError> {
        if decision == ReviewDecision::Reject && reason.as_deref().is_none_or(str::is_empty) {
            return Err(ServiceError::ReasonRequired {
                action: "reject attachment",
            });
        }
        let Some(attachment) = envelope
            .attachments
            .iter_mut()
            .find(|a| &a.id == attachment_id)
        else {
            return Err(ServiceError::UnknownAttachment {
                id: attachment_id.clone(),
            });
        };
        attachment.review = match decision {
            ReviewDecision::Accept => ReviewStatus::Accepted,
            ReviewDecision::Reject => ReviewStatus::Rejected,
        };
        attachment.review_reason = reason.clone();
        recompute_document_items(envelope);
        envelope.updated_at = now;
        self.refresh_gates(envelope, driver, now);
        record_audit(
            envelope,
            driver,
            actor,
            AuditAction::AttachmentReviewed,
            Some(json!({
                "attachment": attachment_id.as_str(),
                "decision": match decision {
                    ReviewDecision::Accept => "accept",
                    ReviewDecision::Reject => "reject",
                },
                "reason": reason,
            })),
            now,
        );
        Ok(())
    }

    // ------------------------------------------------------------------
    // Signals and attestations
    // ------------------------------------------------------------------

    /// Records a signal value, enforcing actor gating.
    ///
    /// # Errors
    /// `decision` signals reject the system actor; `integration` signals
    /// require `system_settable` for system writes.
    pub fn set_signal(
        &self,
        envelope: &mut Envelope,
        driver: &Driver,
        key: &SignalKey,
        value: SignalValue,
        actor: &Actor,
        now: Timestamp,
    ) -> Result<(), ServiceError> {
        ensure_editable(envelope)?;
        let Some(def) = driver.signal_def(key) else {
            return Err(ServiceError::UnknownSignal {
                key: key.clone(),
            });
        };
        match def.category {
            SignalCategory::Decision if actor.is_system() => {
                return Err(ServiceError::DecisionSignalFromSystem {
                    key: key.clone(),
                });
            }
            SignalCategory::Integration if actor.is_system() && !def.system_settable => {
                return Err(ServiceError::SignalNotSystemSettable {
                    key: key.clone(),
                });
            }
            _ => {}
        }
        envelope.signals.insert(
            key.clone(),
            SignalState {
                value: Some(value.clone()),
                set_by: Some(actor.label()),
                set_at: Some(now),
            },
        );
        recompute_signal_items(envelope);
        envelope.updated_at = now;
        self.refresh_gates(envelope, driver, now);
        record_audit(
            envelope,
            driver,
            actor,
            AuditAction::SignalSet,
            Some(json!({ "signal": key.as_str() })),
            now,
        );
        Ok(())
    }

    /// Records an attestation, satisfying every attestation-kind checklist
    /// item linked to the given attestation type.
    ///
    /// # Errors
    /// Returns [`ServiceError::UnknownAttestationType`] when no item links
    /// the type.
    pub fn record_attestation(
        &self,
        envelope: &mut Envelope,
        driver: &Driver,
        attestation_type: &str,
        actor: &Actor,
        now: Timestamp,
    ) -> Result<(), ServiceError> {
        ensure_editable(envelope)?;
        let mut matched = false;
        for item in &mut envelope.checklist {
            if item.kind != ChecklistItemKind::Attestation
                || item.attestation_type.as_deref() != Some(attestation_type)
            {
                continue;
            }
            matched = true;
            item.status = match item.review {
                ReviewMode::None => ChecklistItemStatus::Accepted,
                ReviewMode::Optional | ReviewMode::Required => ChecklistItemStatus::PendingReview,
            };
        }
        if !matched {
            return Err(ServiceError::UnknownAttestationType {
                attestation_type: attestation_type.to_string(),
            });
        }
        envelope.updated_at = now;
        self.refresh_gates(envelope, driver, now);
        record_audit(
            envelope,
            driver,
            actor,
            AuditAction::AttestationRecorded,
            Some(json!({ "attestation_type": attestation_type })),
            now,
        );
        Ok(())
    }

    // ------------------------------------------------------------------
    // Status
    // ------------------------------------------------------------------

    /// Sets the status directly, with no lifecycle checks. Hosts use this
    /// for migrations and corrections; the audited transitions below are the
    /// normal path.
    pub fn set_status(
        &self,
        envelope: &mut Envelope,
        driver: &Driver,
        status: EnvelopeStatus,
        actor: &Actor,
        now: Timestamp,
    ) {
        transition(envelope, driver, status, "set_status", None, actor, now);
    }

    /// Moves a draft or reopened envelope into active collection.
    ///
    /// # Errors
    /// Returns [`ServiceError::InvalidTransition`] from other statuses.
    pub fn activate(
        &self,
        envelope: &mut Envelope,
        driver: &Driver,
        actor: &Actor,
        now: Timestamp,
    ) -> Result<(), ServiceError> {
        if !matches!(
            envelope.status,
            EnvelopeStatus::Draft | EnvelopeStatus::Reopened
        ) {
            return Err(ServiceError::InvalidTransition {
                action: "activate",
                status: envelope.status,
            });
        }
        transition(
            envelope,
            driver,
            EnvelopeStatus::InProgress,
            "activate",
            None,
            actor,
            now,
        );
        Ok(())
    }

    /// Locks a ready-to-settle envelope for settlement.
    ///
    /// The `settleable` gate is re-evaluated against current state; the
    /// cached snapshot never authorizes the lock on its own.
    ///
    /// # Errors
    /// Returns [`ServiceError::SettleableGateClosed`] when the gate has
    /// closed since the envelope became ready.
    pub fn lock(
        &self,
        envelope: &mut Envelope,
        driver: &Driver,
        actor: &Actor,
        now: Timestamp,
    ) -> Result<(), ServiceError> {
        if !envelope.status.can_lock() {
            return Err(ServiceError::InvalidTransition {
                action: "lock",
                status: envelope.status,
            });
        }
        let results = self.evaluator.evaluate(envelope, driver);
        let settleable = results
            .get(&GateKey::new(GateKey::SETTLEABLE))
            .copied()
            .unwrap_or(false);
        envelope.gates_cache = Some(GatesCache {
            results,
            computed_at: now,
        });
        if !settleable {
            return Err(ServiceError::SettleableGateClosed);
        }
        transition(
            envelope,
            driver,
            EnvelopeStatus::Locked,
            "lock",
            None,
            actor,
            now,
        );
        Ok(())
    }

    /// Settles a locked envelope. Terminal.
    ///
    /// # Errors
    /// Returns [`ServiceError::InvalidTransition`] unless locked.
    pub fn settle(
        &self,
        envelope: &mut Envelope,
        driver: &Driver,
        actor: &Actor,
        now: Timestamp,
    ) -> Result<(), ServiceError> {
        if !envelope.status.can_settle() {
            return Err(ServiceError::InvalidTransition {
                action: "settle",
                status: envelope.status,
            });
        }
        transition(
            envelope,
            driver,
            EnvelopeStatus::Settled,
            "settle",
            None,
            actor,
            now,
        );
        Ok(())
    }

    /// Cancels an envelope. Allowed from any non-terminal status.
    ///
    /// # Errors
    /// Returns [`ServiceError::InvalidTransition`] from terminal statuses.
    pub fn cancel(
        &self,
        envelope: &mut Envelope,
        driver: &Driver,
        reason: Option<String>,
        actor: &Actor,
        now: Timestamp,
    ) -> Result<(), ServiceError> {
        if !envelope.status.can_cancel() {
            return Err(ServiceError::InvalidTransition {
                action: "cancel",
                status: envelope.status,
            });
        }
        transition(
            envelope,
            driver,
            EnvelopeStatus::Cancelled,
            "cancel",
            reason,
            actor,
            now,
        );
        Ok(())
    }

    /// Rejects an envelope with a mandatory reason.
    ///
    /// # Errors
    /// Returns [`ServiceError::ReasonRequired`] without a reason.
    pub fn reject(
        &self,
        envelope: &mut Envelope,
        driver: &Driver,
        reason: String,
        actor: &Actor,
        now: Timestamp,
    ) -> Result<(), ServiceError> {
        if reason.is_empty() {
            return Err(ServiceError::ReasonRequired {
                action: "reject",
            });
        }
        if !envelope.status.can_reject() {
            return Err(ServiceError::InvalidTransition {
                action: "reject",
                status: envelope.status,
            });
        }
        transition(
            envelope,
            driver,
            EnvelopeStatus::Rejected,
            "reject",
            Some(reason),
            actor,
            now,
        );
        Ok(())
    }

    /// Reopens a locked, cancelled, or rejected envelope for further
    /// collection, with a mandatory reason.
    ///
    /// # Errors
    /// Returns [`ServiceError::ReasonRequired`] without a reason.
    pub fn reopen(
        &self,
        envelope: &mut Envelope,
        driver: &Driver,
        reason: String,
        actor: &Actor,
        now: Timestamp,
    ) -> Result<(), ServiceError> {
        if reason.is_empty() {
            return Err(ServiceError::ReasonRequired {
                action: "reopen",
            });
        }
        if !envelope.status.can_reopen() {
            return Err(ServiceError::InvalidTransition {
                action: "reopen",
                status: envelope.status,
            });
        }
        transition(
            envelope,
            driver,
            EnvelopeStatus::Reopened,
            "reopen",
            Some(reason),
            actor,
            now,
        );
        Ok(())
    }

    // ------------------------------------------------------------------
    // Gates
    // ------------------------------------------------------------------

    /// Re-evaluates all gates and stores the snapshot on the envelope.
    pub fn refresh_gates(&self, envelope: &mut Envelope, driver: &Driver, now: Timestamp) {
        let results = self.evaluator.evaluate(envelope, driver);
        envelope.gates_cache = Some(GatesCache {
            results,
            computed_at: now,
        });
    }
}

// ============================================================================
// SECTION: Checklist Recomputation
// ============================================================================

/// Rejects writes unless the envelope is in an editable status.
fn ensure_editable(envelope: &Envelope) -> Result<(), ServiceError> {
    if envelope.status.can_edit() {
        Ok(())
    } else {
        Err(ServiceError::NotEditable {
            status: envelope.status,
        })
    }
}

/// Review mode of the checklist item linked to a document type; `None` mode
/// when no item links it.
fn document_review_mode(envelope: &Envelope, doc_type: &DocType) -> ReviewMode {
    envelope
        .checklist
        .iter()
        .find(|item| {
            item.kind == ChecklistItemKind::Document && item.doc_type.as_ref() == Some(doc_type)
        })
        .map_or(ReviewMode::None, |item| item.review)
}

/// Recomputes document checklist items from attachment review states.
fn recompute_document_items(envelope: &mut Envelope) {
    let statuses: Vec<(ChecklistKey, ChecklistItemStatus)> = envelope
        .checklist
        .iter()
        .filter(|item| item.kind == ChecklistItemKind::Document)
        .filter_map(|item| {
            let doc_type = item.doc_type.as_ref()?;
            let mut any = false;
            let mut accepted = false;
            let mut pending = false;
            for attachment in envelope.attachments_of_type(doc_type) {
                any = true;
                match attachment.review {
                    ReviewStatus::Accepted => accepted = true,
                    ReviewStatus::Pending => pending = true,
                    ReviewStatus::Rejected => {}
                }
            }
            let status = if accepted {
                ChecklistItemStatus::Accepted
            } else if pending {
                ChecklistItemStatus::PendingReview
            } else if any {
                ChecklistItemStatus::Rejected
            } else {
                ChecklistItemStatus::Missing
            };
            Some((item.key.clone(), status))
        })
        .collect();
    for (key, status) in statuses {
        if let Some(item) = envelope.checklist_item_mut(&key) {
            item.status = status;
        }
    }
}

/// Re-evaluates `payload_field` items with auto-accept review; reviewed
/// payload items keep their reviewer-driven state.
fn recompute_payload_items(envelope: &mut Envelope) {
    let payload = envelope.payload.clone();
    for item in &mut envelope.checklist {
        if item.kind != ChecklistItemKind::PayloadField || item.review != ReviewMode::None {
            continue;
        }
        let Some(pointer) = &item.pointer else {
            continue;
        };
        item.status = if field_exists(&payload, pointer) {
            ChecklistItemStatus::Accepted
        } else {
            ChecklistItemStatus::Missing
        };
    }
}

/// Recomputes signal and attestation checklist items from signal state.
fn recompute_signal_items(envelope: &mut Envelope) {
    let truthy: Vec<(ChecklistKey, bool)> = envelope
        .checklist
        .iter()
        .filter(|item| item.kind == ChecklistItemKind::Signal)
        .filter_map(|item| {
            let key = item.signal.as_ref()?;
            let value = envelope.signal_value(key);
            Some((item.key.clone(), value.is_some_and(SignalValue::is_truthy)))
        })
        .collect();
    for (key, is_truthy) in truthy {
        if let Some(item) = envelope.checklist_item_mut(&key) {
            if item.review != ReviewMode::None {
                if is_truthy && item.status == ChecklistItemStatus::Missing {
                    item.status = ChecklistItemStatus::PendingReview;
                }
                continue;
            }
            item.status = if is_truthy {
                ChecklistItemStatus::Accepted
            } else {
                ChecklistItemStatus::Missing
            };
        }
    }
}

// ============================================================================
// SECTION: Transitions and Audit
// ============================================================================

/// Moves the envelope to `next`, stamping time and recording the change.
fn transition(
    envelope: &mut Envelope,
    driver: &Driver,
    to: EnvelopeStatus,
    action: &'static str,
    reason: Option<String>,
    actor: &Actor,
    now: Timestamp,
) {
    let from = envelope.status;
    envelope.status = to;
    envelope.updated_at = now;
    record_audit(
        envelope,
        driver,
        actor,
        AuditAction::StatusChanged,
        Some(json!({
            "action": action,
            "from": from.as_str(),
            "to": to.as_str(),
            "reason": reason,
        })),
        now,
    );
    info!(
        envelope = %envelope.id,
        from = from.as_str(),
        to = to.as_str(),
        action,
        "status changed"
    );
}

/// Appends an audit entry when the driver has auditing enabled.
fn record_audit(
    envelope: &mut Envelope,
    driver: &Driver,
    actor: &Actor,
    action: AuditAction,
    detail: Option<Value>,
    now: Timestamp,
) {
    if !driver.audit.enabled {
        return;
    }
    envelope.audit.push(AuditEntry {
        at: now,
        actor: actor.label(),
        action,
        detail,
    });
}

/// Hex-encodes the SHA-256 digest of `bytes`.
fn hex_digest(bytes: &[u8]) -> String {
    Sha256::digest(bytes)
        .iter()
        .map(|byte| format!("{byte:02x}"))
        .collect()
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

    use std::sync::Arc;

    use gate_logic::parse_rule;
    use serde_json::json;

    use super::Actor;
    use super::EnvelopeService;
    use super::ServiceError;
    use crate::core::driver::ChecklistTemplateItem;
    use crate::core::driver::DocumentType;
    use crate::core::driver::Driver;
    use crate::core::driver::GateDef;
    use crate::core::driver::SignalCategory;
    use crate::core::driver::SignalDef;
    use crate::core::envelope::ChecklistItemKind;
    use crate::core::envelope::ChecklistItemStatus;
    use crate::core::envelope::Envelope;
    use crate::core::envelope::EnvelopeStatus;
    use crate::core::envelope::ReviewDecision;
    use crate::core::envelope::ReviewMode;
    use crate::core::envelope::SignalValue;
    use crate::core::identifiers::ChecklistKey;
    use crate::core::identifiers::DocType;
    use crate::core::identifiers::EnvelopeId;
    use crate::core::identifiers::GateKey;
    use crate::core::identifiers::ReferenceCode;
    use crate::core::identifiers::SignalKey;
    use crate::core::time::Timestamp;
    use crate::interfaces::MemoryBlobStore;
    use crate::runtime::mapper::MappedFile;

    fn test_driver() -> Driver {
        Driver {
            id: "voucher.cash".into(),
            version: "1.0.0".into(),
            title: None,
            description: None,
            payload_schema: Default::default(),
            payload_storage: Default::default(),
            documents: vec![DocumentType {
                doc_type: DocType::new("SELFIE"),
                label: None,
                allowed_mimes: vec!["image/jpeg".to_string()],
                max_size_mb: Some(1),
                multiple: false,
            }],
            checklist: vec![
                ChecklistTemplateItem {
                    key: ChecklistKey::new("selfie"),
                    label: None,
                    kind: ChecklistItemKind::Document,
                    doc_type: Some(DocType::new("SELFIE")),
                    pointer: None,
                    signal: None,
                    attestation_type: None,
                    required: true,
                    review: ReviewMode::Required,
                },
                ChecklistTemplateItem {
                    key: ChecklistKey::new("payee_name"),
                    label: None,
                    kind: ChecklistItemKind::PayloadField,
                    doc_type: None,
                    pointer: Some("/payee/name".to_string()),
                    signal: None,
                    attestation_type: None,
                    required: true,
                    review: ReviewMode::None,
                },
            ],
            signals: vec![
                SignalDef {
                    key: SignalKey::new("approved"),
                    label: None,
                    category: SignalCategory::Decision,
                    default: Some(SignalValue::Bool(false)),
                    required: false,
                    system_settable: false,
                },
                SignalDef {
                    key: SignalKey::new("kyc_passed"),
                    label: None,
                    category: SignalCategory::Integration,
                    default: None,
                    required: false,
                    system_settable: true,
                },
            ],
            gates: vec![GateDef {
                key: GateKey::new("settleable"),
                label: None,
                rule: parse_rule("checklist.required_accepted && signal.approved").unwrap(),
                source: "checklist.required_accepted && signal.approved".to_string(),
            }],
            audit: Default::default(),
            manifest: Default::default(),
            form_flow_mapping: None,
        }
    }

    fn service() -> EnvelopeService {
        EnvelopeService::new(Arc::new(MemoryBlobStore::new()))
    }

    fn create(service: &EnvelopeService, driver: &Driver) -> Envelope {
        service.create(
            EnvelopeId::new("env-1"),
            ReferenceCode::new("VCH-001"),
            driver,
            None,
            &Actor::System,
            Timestamp::from_unix_millis(0),
        )
    }

    fn jpeg(bytes: &[u8]) -> MappedFile {
        MappedFile {
            filename: Some("selfie.jpg".to_string()),
            mime: "image/jpeg".to_string(),
            bytes: bytes.to_vec(),
        }
    }

    #[test]
    fn create_materializes_checklist_and_signals() {
        let driver = test_driver();
        let envelope = create(&service(), &driver);
        assert_eq!(envelope.status, EnvelopeStatus::Draft);
        assert_eq!(envelope.checklist.len(), 2);
        assert!(envelope.signals.contains_key(&SignalKey::new("approved")));
        assert!(envelope.gates_cache.is_some());
        assert_eq!(envelope.audit.len(), 1);
    }

    #[test]
    fn payload_patch_satisfies_pointer_item() {
        let driver = test_driver();
        let svc = service();
        let mut envelope = create(&svc, &driver);
        let patch = match json!({ "payee": { "name": "Ada" } }) {
            serde_json::Value::Object(map) => map,
            _ => unreachable!(),
        };
        let touched = svc
            .update_payload(
                &mut envelope,
                &driver,
                patch,
                &Actor::System,
                Timestamp::from_unix_millis(1),
            )
            .unwrap();
        assert_eq!(touched, vec!["payee".to_string()]);
        assert_eq!(envelope.payload_version, 1);
        let item = envelope.checklist_item(&ChecklistKey::new("payee_name")).unwrap();
        assert_eq!(item.status, ChecklistItemStatus::Accepted);
    }

    #[test]
    fn duplicate_upload_is_a_no_op() {
        let driver = test_driver();
        let svc = service();
        let mut envelope = create(&svc, &driver);
        let doc = DocType::new("SELFIE");
        let first = svc
            .upload_attachment(
                &mut envelope,
                &driver,
                &doc,
                &jpeg(b"same-bytes"),
                &Actor::System,
                Timestamp::from_unix_millis(1),
            )
            .unwrap();
        assert!(first.is_some());
        let second = svc
            .upload_attachment(
                &mut envelope,
                &driver,
                &doc,
                &jpeg(b"same-bytes"),
                &Actor::System,
                Timestamp::from_unix_millis(2),
            )
            .unwrap();
        assert!(second.is_none());
        assert_eq!(envelope.attachments.len(), 1);
    }

    #[test]
    fn upload_validation_rejects_bad_mime_and_size() {
        let driver = test_driver();
        let svc = service();
        let mut envelope = create(&svc, &driver);
        let doc = DocType::new("SELFIE");

        let mut png = jpeg(b"bytes");
        png.mime = "image/png".to_string();
        let err = svc
            .upload_attachment(&mut envelope, &driver, &doc, &png, &Actor::System, Timestamp::from_unix_millis(1))
            .unwrap_err();
        assert!(matches!(err, ServiceError::InvalidMime { .. }));

        let oversized = jpeg(&vec![0u8; 2 * 1024 * 1024]);
        let err = svc
            .upload_attachment(&mut envelope, &driver, &doc, &oversized, &Actor::System, Timestamp::from_unix_millis(1))
            .unwrap_err();
        assert!(matches!(err, ServiceError::AttachmentTooLarge { .. }));

        let err = svc
            .upload_attachment(
                &mut envelope,
                &driver,
                &DocType::new("UNKNOWN"),
                &jpeg(b"bytes"),
                &Actor::System,
                Timestamp::from_unix_millis(1),
            )
            .unwrap_err();
        assert!(matches!(err, ServiceError::UnsupportedDocumentType { .. }));
    }

    #[test]
    fn reviewed_document_item_follows_decisions() {
        let driver = test_driver();
        let svc = service();
        let mut envelope = create(&svc, &driver);
        let doc = DocType::new("SELFIE");
        let id = svc
            .upload_attachment(
                &mut envelope,
                &driver,
                &doc,
                &jpeg(b"bytes"),
                &Actor::System,
                Timestamp::from_unix_millis(1),
            )
            .unwrap()
            .unwrap();
        let item = envelope.checklist_item(&ChecklistKey::new("selfie")).unwrap();
        assert_eq!(item.status, ChecklistItemStatus::PendingReview);

        svc.review_attachment(
            &mut envelope,
            &driver,
            &id,
            ReviewDecision::Accept,
            None,
            &Actor::User("rev-1".to_string()),
            Timestamp::from_unix_millis(2),
        )
        .unwrap();
        let item = envelope.checklist_item(&ChecklistKey::new("selfie")).unwrap();
        assert_eq!(item.status, ChecklistItemStatus::Accepted);
    }

    #[test]
    fn rejecting_without_reason_fails() {
        let driver = test_driver();
        let svc = service();
        let mut envelope = create(&svc, &driver);
        let doc = DocType::new("SELFIE");
        let id = svc
            .upload_attachment(
                &mut envelope,
                &driver,
                &doc,
                &jpeg(b"bytes"),
                &Actor::System,
                Timestamp::from_unix_millis(1),
            )
            .unwrap()
            .unwrap();
        let err = svc
            .review_attachment(
                &mut envelope,
                &driver,
                &id,
                ReviewDecision::Reject,
                None,
                &Actor::User("rev-1".to_string()),
                Timestamp::from_unix_millis(2),
            )
            .unwrap_err();
        assert!(matches!(err, ServiceError::ReasonRequired { .. }));
    }

    #[test]
    fn decision_signal_rejects_system_writes() {
        let driver = test_driver();
        let svc = service();
        let mut envelope = create(&svc, &driver);
        let err = svc
            .set_signal(
                &mut envelope,
                &driver,
                &SignalKey::new("approved"),
                SignalValue::Bool(true),
                &Actor::System,
                Timestamp::from_unix_millis(1),
            )
            .unwrap_err();
        assert!(matches!(err, ServiceError::DecisionSignalFromSystem { .. }));

        svc.set_signal(
            &mut envelope,
            &driver,
            &SignalKey::new("approved"),
            SignalValue::Bool(true),
            &Actor::User("rev-1".to_string()),
            Timestamp::from_unix_millis(1),
        )
        .unwrap();
        assert!(
            envelope
                .signal_value(&SignalKey::new("approved"))
                .unwrap()
                .is_truthy()
        );
    }

    #[test]
    fn system_settable_integration_signal_accepts_system() {
        let driver = test_driver();
        let svc = service();
        let mut envelope = create(&svc, &driver);
        svc.set_signal(
            &mut envelope,
            &driver,
            &SignalKey::new("kyc_passed"),
            SignalValue::Bool(true),
            &Actor::System,
            Timestamp::from_unix_millis(1),
        )
        .unwrap();
    }

    #[test]
    fn lock_requires_open_settleable_gate() {
        let driver = test_driver();
        let svc = service();
        let mut envelope = create(&svc, &driver);
        envelope.status = EnvelopeStatus::ReadyToSettle;
        let err = svc
            .lock(&mut envelope, &driver, &Actor::User("ops".to_string()), Timestamp::from_unix_millis(1))
            .unwrap_err();
        assert!(matches!(err, ServiceError::SettleableGateClosed));
    }

    #[test]
    fn writes_rejected_once_locked() {
        let driver = test_driver();
        let svc = service();
        let mut envelope = create(&svc, &driver);
        envelope.status = EnvelopeStatus::Locked;
        let patch = match json!({ "x": 1 }) {
            serde_json::Value::Object(map) => map,
            _ => unreachable!(),
        };
        let err = svc
            .update_payload(&mut envelope, &driver, patch, &Actor::System, Timestamp::from_unix_millis(1))
            .unwrap_err();
        assert!(matches!(err, ServiceError::NotEditable { .. }));
    }

    #[test]
    fn lifecycle_transitions_enforce_preconditions() {
        let driver = test_driver();
        let svc = service();
        let actor = Actor::User("ops".to_string());
        let now = Timestamp::from_unix_millis(1);

        let mut envelope = create(&svc, &driver);
        svc.activate(&mut envelope, &driver, &actor, now).unwrap();
        assert_eq!(envelope.status, EnvelopeStatus::InProgress);
        assert!(matches!(
            svc.settle(&mut envelope, &driver, &actor, now),
            Err(ServiceError::InvalidTransition { .. })
        ));

        svc.reject(&mut envelope, &driver, "fraud".to_string(), &actor, now)
            .unwrap();
        assert_eq!(envelope.status, EnvelopeStatus::Rejected);
        assert!(matches!(
            svc.reject(&mut envelope, &driver, "again".to_string(), &actor, now),
            Err(ServiceError::InvalidTransition { .. })
        ));

        svc.reopen(&mut envelope, &driver, "appeal".to_string(), &actor, now)
            .unwrap();
        assert_eq!(envelope.status, EnvelopeStatus::Reopened);
        svc.activate(&mut envelope, &driver, &actor, now).unwrap();
        assert_eq!(envelope.status, EnvelopeStatus::InProgress);
    }

    #[test]
    fn optional_review_holds_the_decision_but_not_readiness() {
        let mut driver = test_driver();
        driver.checklist[0].review = ReviewMode::Optional;
        let svc = service();
        let mut envelope = create(&svc, &driver);
        svc.upload_attachment(
            &mut envelope,
            &driver,
            &DocType::new("SELFIE"),
            &jpeg(b"bytes"),
            &Actor::System,
            Timestamp::from_unix_millis(1),
        )
        .unwrap()
        .unwrap();
        // Evidence is not auto-accepted, but it no longer holds readiness.
        assert_eq!(envelope.attachments[0].review, crate::core::envelope::ReviewStatus::Pending);
        let item = envelope.checklist_item(&ChecklistKey::new("selfie")).unwrap();
        assert_eq!(item.status, ChecklistItemStatus::PendingReview);
        assert!(item.counts_as_accepted());
    }

    #[test]
    fn attestation_resolves_items_through_the_linked_type() {
        let mut driver = test_driver();
        driver.checklist.push(ChecklistTemplateItem {
            key: ChecklistKey::new("identity_confirmed"),
            label: None,
            kind: ChecklistItemKind::Attestation,
            doc_type: None,
            pointer: None,
            signal: None,
            attestation_type: Some("payee_identity".to_string()),
            required: true,
            review: ReviewMode::None,
        });
        let svc = service();
        let mut envelope = create(&svc, &driver);
        svc.record_attestation(
            &mut envelope,
            &driver,
            "payee_identity",
            &Actor::User("agent-1".to_string()),
            Timestamp::from_unix_millis(1),
        )
        .unwrap();
        let item = envelope
            .checklist_item(&ChecklistKey::new("identity_confirmed"))
            .unwrap();
        assert_eq!(item.status, ChecklistItemStatus::Accepted);

        let err = svc
            .record_attestation(
                &mut envelope,
                &driver,
                "never_declared",
                &Actor::User("agent-1".to_string()),
                Timestamp::from_unix_millis(2),
            )
            .unwrap_err();
        assert!(matches!(err, ServiceError::UnknownAttestationType { .. }));
    }

    #[test]
    fn context_merges_beside_the_payload() {
        let driver = test_driver();
        let svc = service();
        let mut envelope = create(&svc, &driver);
        let patch = match json!({ "channel": { "name": "branch-12" } }) {
            serde_json::Value::Object(map) => map,
            _ => unreachable!(),
        };
        let touched = svc
            .update_context(
                &mut envelope,
                &driver,
                patch.clone(),
                &Actor::System,
                Timestamp::from_unix_millis(1),
            )
            .unwrap();
        assert_eq!(touched, vec!["channel".to_string()]);
        assert!(envelope.payload.is_empty());
        assert_eq!(envelope.payload_version, 0);

        // Identical re-application changes nothing and records nothing.
        let audit_len = envelope.audit.len();
        let touched = svc
            .update_context(&mut envelope, &driver, patch, &Actor::System, Timestamp::from_unix_millis(2))
            .unwrap();
        assert!(touched.is_empty());
        assert_eq!(envelope.audit.len(), audit_len);
    }
}
