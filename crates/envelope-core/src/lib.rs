// crates/envelope-core/src/lib.rs
// ============================================================================
// Module: Envelope Core Library
// Description: Settlement envelope data model, gate evaluation, and sync runtime.
// Purpose: Track whether a case has collected enough evidence to be settled.
// Dependencies: gate-logic, serde, serde_json, sha2, base64, time, tracing
// ============================================================================

//! ## Overview
//! Envelope Core implements the settlement envelope engine: a
//! driver-configured workflow that accumulates payload data, attachments,
//! and signals against an [`Envelope`], recomputes checklist and gate state,
//! and auto-advances envelope status until the case is ready to settle.
//! Invariants:
//! - Drivers are immutable once loaded; envelopes pin `id@version`.
//! - Attachments are persisted before payload updates within a sync.
//! - Gate evaluation is pure; the gates cache is an optimization only.
//! - Automatic transitions never move status backward.

// ============================================================================
// SECTION: Modules
// ============================================================================

pub mod core;
pub mod interfaces;
pub mod runtime;

// ============================================================================
// SECTION: Re-Exports
// ============================================================================

pub use crate::core::driver::AuditConfig;
pub use crate::core::driver::AttachmentMapping;
pub use crate::core::driver::ChecklistTemplateItem;
pub use crate::core::driver::DocumentType;
pub use crate::core::driver::Driver;
pub use crate::core::driver::FormFlowMapping;
pub use crate::core::driver::GateDef;
pub use crate::core::driver::ManifestConfig;
pub use crate::core::driver::PayloadSchema;
pub use crate::core::driver::PayloadStorage;
pub use crate::core::driver::SignalCategory;
pub use crate::core::driver::SignalDef;
pub use crate::core::envelope::Attachment;
pub use crate::core::envelope::AuditAction;
pub use crate::core::envelope::AuditEntry;
pub use crate::core::envelope::ChecklistItem;
pub use crate::core::envelope::ChecklistItemKind;
pub use crate::core::envelope::ChecklistItemStatus;
pub use crate::core::envelope::Envelope;
pub use crate::core::envelope::EnvelopeStatus;
pub use crate::core::envelope::GatesCache;
pub use crate::core::envelope::ReviewDecision;
pub use crate::core::envelope::ReviewMode;
pub use crate::core::envelope::ReviewStatus;
pub use crate::core::envelope::SignalState;
pub use crate::core::envelope::SignalValue;
pub use crate::core::identifiers::AttachmentId;
pub use crate::core::identifiers::ChecklistKey;
pub use crate::core::identifiers::DocType;
pub use crate::core::identifiers::DriverId;
pub use crate::core::identifiers::DriverKey;
pub use crate::core::identifiers::DriverVersion;
pub use crate::core::identifiers::EnvelopeId;
pub use crate::core::identifiers::GateKey;
pub use crate::core::identifiers::ReferenceCode;
pub use crate::core::identifiers::SignalKey;
pub use crate::core::time::Timestamp;
pub use crate::interfaces::BlobStore;
pub use crate::interfaces::BlobStoreError;
pub use crate::interfaces::DriverCatalog;
pub use crate::interfaces::DriverCatalogError;
pub use crate::interfaces::EnvelopeStore;
pub use crate::interfaces::MemoryBlobStore;
pub use crate::interfaces::MemoryEnvelopeStore;
pub use crate::interfaces::StorageRef;
pub use crate::interfaces::StoreError;
pub use crate::runtime::gates::GateEvaluator;
pub use crate::runtime::mapper::CollectedData;
pub use crate::runtime::mapper::FormFlowDataMapper;
pub use crate::runtime::mapper::MappedFile;
pub use crate::runtime::pointer::field_exists;
pub use crate::runtime::pointer::field_value;
pub use crate::runtime::pointer::merge_patch;
pub use crate::runtime::service::Actor;
pub use crate::runtime::service::EnvelopeService;
pub use crate::runtime::service::ServiceError;
pub use crate::runtime::sync::SyncOrchestrator;
pub use crate::runtime::sync::SyncOutcome;
