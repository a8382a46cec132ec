// crates/envelope-core/src/runtime/sync.rs
// ============================================================================
// Module: Sync Orchestrator
// Description: End-to-end application of a form-flow submission to an envelope.
// Purpose: Map, upload, patch, evaluate, auto-advance, and persist atomically.
// Dependencies: serde_json, tracing
// ============================================================================

//! ## Overview
//! The orchestrator takes one collected-data submission and runs the full
//! pipeline: load the envelope and its pinned driver, map the submission
//! into a payload patch and attachment files, upload attachments, apply the
//! patch, refresh gates, auto-advance the status, and persist with
//! compare-and-swap.
//! Invariants:
//! - Attachments upload before the payload patch is applied; a failed
//!   attachment never blocks the rest of the batch.
//! - A missing envelope or driver yields a failed [`SyncOutcome`], not an
//!   error; per-attachment failures are collected, not raised.
//! - Auto-advance only moves forward along draft, in_progress,
//!   ready_for_review, ready_to_settle, and is bounded by the path length.
//! - A lost compare-and-swap yields a retryable failed outcome; the caller
//!   re-syncs against fresh state.

// ============================================================================
// SECTION: Imports
// ============================================================================

use std::collections::BTreeMap;
use std::sync::Arc;

use serde_json::Value;
use tracing::info;
use tracing::warn;

use crate::core::driver::Driver;
use crate::core::envelope::Envelope;
use crate::core::envelope::EnvelopeStatus;
use crate::core::identifiers::DocType;
use crate::core::identifiers::EnvelopeId;
use crate::core::identifiers::GateKey;
use crate::core::time::Timestamp;
use crate::interfaces::DriverCatalog;
use crate::interfaces::EnvelopeStore;
use crate::interfaces::StoreError;
use crate::runtime::mapper::CollectedData;
use crate::runtime::mapper::FormFlowDataMapper;
use crate::runtime::service::Actor;
use crate::runtime::service::EnvelopeService;

// ============================================================================
// SECTION: Outcome
// ============================================================================

/// Result of one sync run; failures are data, not panics.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SyncOutcome {
    /// Whether the run completed and persisted.
    pub success: bool,
    /// Failure description when `success` is false.
    pub error: Option<String>,
    /// Whether the run lost a revision race and should be retried.
    pub retryable: bool,
    /// Whether a payload patch was applied.
    pub payload_updated: bool,
    /// Top-level payload keys the patch touched.
    pub payload_keys: Vec<String>,
    /// Number of attachments actually uploaded (dedup hits excluded).
    pub attachments_uploaded: usize,
    /// Per-attachment failures, keyed by document type.
    pub attachment_errors: BTreeMap<DocType, String>,
}

impl SyncOutcome {
    /// Builds a failed outcome with no applied changes.
    fn failed(error: impl Into<String>) -> Self {
        Self {
            success: false,
            error: Some(error.into()),
            ..Self::default()
        }
    }
}

// ============================================================================
// SECTION: Orchestrator
// ============================================================================

/// Bounds the auto-advance loop; the forward path has three hops.
const MAX_AUTO_ADVANCE_STEPS: usize = 3;

/// Applies form-flow submissions to envelopes end to end.
pub struct SyncOrchestrator {
    /// Envelope persistence.
    store: Arc<dyn EnvelopeStore + Send + Sync>,
    /// Driver definition lookup.
    catalog: Arc<dyn DriverCatalog + Send + Sync>,
    /// Envelope mutation rules.
    service: EnvelopeService,
    /// Form-flow payload and attachment mapper.
    mapper: FormFlowDataMapper,
}

impl std::fmt::Debug for SyncOrchestrator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SyncOrchestrator").finish_non_exhaustive()
    }
}

impl SyncOrchestrator {
    /// Creates an orchestrator over the given stores and service.
    #[must_use]
    pub fn new(
        store: Arc<dyn EnvelopeStore + Send + Sync>,
        catalog: Arc<dyn DriverCatalog + Send + Sync>,
        service: EnvelopeService,
        mapper: FormFlowDataMapper,
    ) -> Self {
        Self {
            store,
            catalog,
            service,
            mapper,
        }
    }

    /// Runs one sync of collected form data against an envelope.
    #[must_use]
    pub fn sync(&self, envelope_id: &EnvelopeId, collected: &Value, now: Timestamp) -> SyncOutcome {
        let mut envelope = match self.store.get(envelope_id) {
            Ok(envelope) => envelope,
            Err(StoreError::NotFound { id }) => {
                warn!(envelope = %id, "sync skipped: envelope not found");
                return SyncOutcome::failed(format!("envelope `{id}` not found"));
            }
            Err(error) => return SyncOutcome::failed(error.to_string()),
        };
        let loaded_revision = envelope.revision;

        let driver = match self.catalog.load(&envelope.driver) {
            Ok(driver) => driver,
            Err(error) => {
                warn!(envelope = %envelope.id, driver = %envelope.driver, %error, "sync skipped: driver unavailable");
                return SyncOutcome::failed(error.to_string());
            }
        };

        let mut outcome = SyncOutcome {
            success: true,
            ..SyncOutcome::default()
        };
        let collected = CollectedData::normalize(collected);
        self.apply(&mut envelope, &driver, &collected, &mut outcome, now);
        if !outcome.success {
            return outcome;
        }

        // Advancement reads the cache; make sure it reflects this sync.
        self.service.refresh_gates(&mut envelope, &driver, now);
        self.advance(&mut envelope, &driver, now);

        match self.store.put(envelope, loaded_revision) {
            Ok(persisted) => {
                info!(
                    envelope = %persisted.id,
                    status = persisted.status.as_str(),
                    payload_updated = outcome.payload_updated,
                    attachments = outcome.attachments_uploaded,
                    "sync completed"
                );
                outcome
            }
            Err(StoreError::RevisionConflict { id, expected, stored }) => {
                warn!(envelope = %id, expected, stored, "sync lost revision race");
                SyncOutcome {
                    retryable: true,
                    ..SyncOutcome::failed(format!(
                        "revision conflict on `{id}`: expected {expected}, stored {stored}"
                    ))
                }
            }
            Err(error) => SyncOutcome::failed(error.to_string()),
        }
    }

    /// Maps and applies the submission: attachments first, then the payload
    /// patch. Per-attachment failures are collected; a payload failure stops
    /// the run.
    fn apply(
        &self,
        envelope: &mut Envelope,
        driver: &Driver,
        collected: &CollectedData,
        outcome: &mut SyncOutcome,
        now: Timestamp,
    ) {
        let Some(mapping) = self.mapper.mapping_for(driver.form_flow_mapping.as_ref()) else {
            return;
        };

        for (doc_type, file) in self.mapper.extract_attachments(collected, mapping) {
            match self.service.upload_attachment(
                envelope,
                driver,
                &doc_type,
                &file,
                &Actor::System,
                now,
            ) {
                Ok(Some(_)) => outcome.attachments_uploaded += 1,
                Ok(None) => {}
                Err(error) => {
                    warn!(envelope = %envelope.id, doc_type = %doc_type, %error, "attachment sync failed");
                    outcome.attachment_errors.insert(doc_type, error.to_string());
                }
            }
        }

        let patch = self.mapper.to_payload(collected, mapping);
        if patch.is_empty() {
            return;
        }
        match self
            .service
            .update_payload(envelope, driver, patch, &Actor::System, now)
        {
            Ok(touched) => {
                outcome.payload_updated = !touched.is_empty();
                outcome.payload_keys = touched;
            }
            Err(error) => {
                warn!(envelope = %envelope.id, %error, "payload sync failed");
                outcome.success = false;
                outcome.error = Some(error.to_string());
            }
        }
    }

    /// Walks the forward path until no transition applies.
    fn advance(&self, envelope: &mut Envelope, driver: &Driver, now: Timestamp) {
        for _ in 0..MAX_AUTO_ADVANCE_STEPS {
            let next = match envelope.status {
                EnvelopeStatus::Draft if has_any_evidence(envelope) => EnvelopeStatus::InProgress,
                EnvelopeStatus::InProgress if required_present(envelope) => {
                    EnvelopeStatus::ReadyForReview
                }
                EnvelopeStatus::ReadyForReview
                    if required_accepted(envelope) && settleable_open(envelope) =>
                {
                    EnvelopeStatus::ReadyToSettle
                }
                _ => break,
            };
            self.service.set_status(envelope, driver, next, &Actor::System, now);
            // Status feeds the rule context; recompute before the next hop.
            self.service.refresh_gates(envelope, driver, now);
        }
    }
}

// ============================================================================
// SECTION: Advancement Conditions
// ============================================================================

/// True when the envelope carries any payload data, attachment, or
/// checklist progress.
fn has_any_evidence(envelope: &Envelope) -> bool {
    !envelope.payload_is_empty() || !envelope.attachments.is_empty()
}

/// True when every required checklist item is at least present.
fn required_present(envelope: &Envelope) -> bool {
    envelope
        .checklist
        .iter()
        .filter(|item| item.required)
        .all(|item| item.is_present())
}

/// True when every required checklist item counts as accepted; evidence
/// under optional review counts while it awaits a decision.
fn required_accepted(envelope: &Envelope) -> bool {
    envelope
        .checklist
        .iter()
        .filter(|item| item.required)
        .all(|item| item.counts_as_accepted())
}

/// Reads the settleable gate from the cached evaluation.
fn settleable_open(envelope: &Envelope) -> bool {
    envelope
        .gates_cache
        .as_ref()
        .and_then(|cache| cache.get(&GateKey::new(GateKey::SETTLEABLE)))
        .unwrap_or(false)
}
