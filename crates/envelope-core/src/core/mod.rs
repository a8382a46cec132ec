// crates/envelope-core/src/core/mod.rs
// ============================================================================
// Module: Envelope Core Data Model
// Description: Identifiers, driver configuration, and envelope state types.
// Purpose: Canonical types shared by the runtime and storage interfaces.
// Dependencies: crate submodules
// ============================================================================

//! ## Overview
//! The core module holds the data model: strongly typed identifiers, the
//! immutable driver configuration, and the mutable envelope state that
//! accumulates evidence over a case's life.

pub mod driver;
pub mod envelope;
pub mod identifiers;
pub mod time;
