// crates/envelope-config/src/lib.rs
// ============================================================================
// Module: Envelope Config Library
// Description: YAML driver documents, composition, validation, and registry.
// Purpose: Turn driver configuration files into immutable Driver snapshots.
// Dependencies: envelope-core, gate-logic, serde, serde_yaml, thiserror, tracing
// ============================================================================

//! ## Overview
//! Drivers are authored as YAML documents under a root directory and loaded
//! through [`DriverRegistry`]. Documents may extend other documents;
//! composition merges registry-style lists by key with the overlay winning.
//! Every rule string is parsed and every cross-reference checked at load
//! time, so a driver that loads is a driver that evaluates.
//! Invariants:
//! - A loaded driver is cached for the registry's lifetime and never
//!   reloaded; new behavior ships as a new version.
//! - Validation failures are load errors; evaluation never sees a malformed
//!   rule or a dangling reference.

// ============================================================================
// SECTION: Modules
// ============================================================================

pub mod document;
pub mod registry;

// ============================================================================
// SECTION: Re-Exports
// ============================================================================

pub use document::DriverDocument;
pub use document::DriverError;
pub use registry::DriverRegistry;
