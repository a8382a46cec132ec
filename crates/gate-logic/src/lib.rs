// crates/gate-logic/src/lib.rs
// ============================================================================
// Module: Gate Logic Library
// Description: Boolean rule expressions for driver-authored gates.
// Purpose: Parse rule strings once into typed ASTs and evaluate them against
//          host-supplied contexts.
// Dependencies: serde
// ============================================================================

//! ## Overview
//! Gate Logic turns driver-authored rule strings such as
//! `checklist.required_accepted && signal.approved` into an immutable
//! [`RuleExpr`] tree at load time, then evaluates the tree against a
//! [`Resolver`] that maps dotted references to [`RuleValue`]s.
//! Invariants:
//! - Parsing happens once per rule; evaluation never re-parses strings.
//! - Evaluation is pure: the same resolver snapshot yields the same result.
//! - Rule input is untrusted; size and nesting limits fail closed.

// ============================================================================
// SECTION: Modules
// ============================================================================

pub mod dsl;
pub mod expr;

// ============================================================================
// SECTION: Re-Exports
// ============================================================================

pub use dsl::MAX_RULE_INPUT_BYTES;
pub use dsl::MAX_RULE_NESTING;
pub use dsl::RuleParseError;
pub use dsl::parse_rule;
pub use expr::Resolver;
pub use expr::RuleExpr;
pub use expr::RuleValue;
