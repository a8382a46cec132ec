// crates/envelope-core/src/runtime/mod.rs
// ============================================================================
// Module: Envelope Runtime
// Description: Gate evaluation, payload mapping, service operations, and sync.
// Purpose: The behavior layer that mutates envelopes under driver rules.
// Dependencies: crate submodules
// ============================================================================

//! ## Overview
//! The runtime turns the passive data model into behavior: the payload
//! pointer walker, the pure gate evaluator, the form-flow data mapper, the
//! envelope service (all evidence writes), and the sync orchestrator that
//! ties them together for form-flow submissions.

pub mod gates;
pub mod mapper;
pub mod pointer;
pub mod service;
pub mod sync;
