// crates/envelope-core/src/runtime/gates.rs
// ============================================================================
// Module: Gate Evaluator
// Description: Pure evaluation of driver gate rules over envelope state.
// Purpose: Compute the named boolean conditions that drive status advancement.
// Dependencies: gate-logic
// ============================================================================

//! ## Overview
//! The evaluator builds a rule context from the envelope (checklist
//! aggregates, signal values with driver defaults, payload flags, envelope
//! status) and folds each gate's parsed rule in driver definition order.
//! Invariants:
//! - Evaluation is pure: same envelope and driver, same results. The caller
//!   persists results into the gates cache; the cache is never read here.
//! - `gate.<key>` references resolve to gates evaluated earlier in the same
//!   pass; the driver loader guarantees no forward references exist.
//! - Unresolved references evaluate as absent, which is falsy.

// ============================================================================
// SECTION: Imports
// ============================================================================

use std::collections::BTreeMap;

use gate_logic::RuleValue;

use crate::core::driver::Driver;
use crate::core::envelope::ChecklistItemStatus;
use crate::core::envelope::Envelope;
use crate::core::envelope::SignalValue;
use crate::core::identifiers::GateKey;

// ============================================================================
// SECTION: Evaluator
// ============================================================================

/// Pure gate evaluator.
#[derive(Debug, Clone, Copy, Default)]
pub struct GateEvaluator;

impl GateEvaluator {
    /// Creates an evaluator.
    #[must_use]
    pub const fn new() -> Self {
        Self
    }

    /// Evaluates every gate of `driver` against `envelope`, in definition
    /// order.
    #[must_use]
    pub fn evaluate(&self, envelope: &Envelope, driver: &Driver) -> BTreeMap<GateKey, bool> {
        let context = build_context(envelope, driver);
        let mut results: BTreeMap<GateKey, bool> = BTreeMap::new();
        for gate in &driver.gates {
            let open = gate.rule.evaluate_bool(&|reference: &str| {
                if let Some(key) = reference.strip_prefix("gate.") {
                    return results
                        .get(&GateKey::new(key))
                        .copied()
                        .map(RuleValue::Bool);
                }
                context.get(reference).cloned()
            });
            results.insert(gate.key.clone(), open);
        }
        results
    }
}

// ============================================================================
// SECTION: Context Construction
// ============================================================================

/// Builds the rule context for an envelope: checklist aggregates, signal
/// values with driver defaults, and payload and envelope facts.
fn build_context(envelope: &Envelope, driver: &Driver) -> BTreeMap<String, RuleValue> {
    let mut context = BTreeMap::new();

    let total = envelope.checklist.len();
    let required: Vec<_> = envelope.checklist.iter().filter(|i| i.required).collect();
    let required_present = required.iter().all(|i| i.is_present());
    let required_accepted = required.iter().all(|i| i.counts_as_accepted());
    let all_accepted = envelope.checklist.iter().all(|i| i.counts_as_accepted());
    let has_rejected = envelope
        .checklist
        .iter()
        .any(|i| matches!(i.status, ChecklistItemStatus::Rejected));
    let pending = envelope
        .checklist
        .iter()
        .filter(|i| !i.is_accepted())
        .count();

    context.insert("checklist.required_present".into(), RuleValue::Bool(required_present));
    context.insert("checklist.required_accepted".into(), RuleValue::Bool(required_accepted));
    context.insert("checklist.all_accepted".into(), RuleValue::Bool(all_accepted));
    context.insert("checklist.has_rejected".into(), RuleValue::Bool(has_rejected));
    context.insert("checklist.total".into(), RuleValue::Number(to_count(total)));
    context.insert(
        "checklist.required_count".into(),
        RuleValue::Number(to_count(required.len())),
    );
    context.insert("checklist.pending_count".into(), RuleValue::Number(to_count(pending)));

    for def in &driver.signals {
        let value = envelope
            .signal_value(&def.key)
            .or(def.default.as_ref())
            .map_or(RuleValue::Null, signal_to_rule_value);
        context.insert(format!("signal.{}", def.key), value);
    }

    context.insert(
        "payload.valid".into(),
        RuleValue::Bool(!envelope.payload_is_empty()),
    );
    context.insert(
        "payload.version".into(),
        RuleValue::Number(to_count_u64(envelope.payload_version)),
    );
    context.insert(
        "envelope.status".into(),
        RuleValue::String(envelope.status.as_str().to_string()),
    );
    context.insert(
        "envelope.payload_version".into(),
        RuleValue::Number(to_count_u64(envelope.payload_version)),
    );

    context
}

/// Converts a stored signal value into a rule value.
fn signal_to_rule_value(value: &SignalValue) -> RuleValue {
    match value {
        SignalValue::Bool(b) => RuleValue::Bool(*b),
        SignalValue::Number(n) => RuleValue::Number(*n),
        SignalValue::String(s) => RuleValue::String(s.clone()),
    }
}

/// Widens a checklist count for numeric comparison in rules.
// Counts stay far below the f64 integer limit in practice.
#[allow(
    clippy::cast_precision_loss,
    reason = "Checklist and version counts are small integers."
)]
fn to_count(value: usize) -> f64 {
    value as f64
}

/// Widens the payload version for numeric comparison in rules.
#[allow(
    clippy::cast_precision_loss,
    reason = "Payload versions are small integers."
)]
fn to_count_u64(value: u64) -> f64 {
    value as f64
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

    use gate_logic::parse_rule;
    use serde_json::json;

    use super::GateEvaluator;
    use crate::core::driver::Driver;
    use crate::core::driver::GateDef;
    use crate::core::driver::SignalCategory;
    use crate::core::driver::SignalDef;
    use crate::core::envelope::ChecklistItem;
    use crate::core::envelope::ChecklistItemKind;
    use crate::core::envelope::ChecklistItemStatus;
    use crate::core::envelope::Envelope;
    use crate::core::envelope::ReviewMode;
    use crate::core::envelope::SignalState;
    use crate::core::envelope::SignalValue;
    use crate::core::identifiers::ChecklistKey;
    use crate::core::identifiers::DriverKey;
    use crate::core::identifiers::EnvelopeId;
    use crate::core::identifiers::GateKey;
    use crate::core::identifiers::ReferenceCode;
    use crate::core::identifiers::SignalKey;
    use crate::core::time::Timestamp;

    fn gate(key: &str, rule: &str) -> GateDef {
        GateDef {
            key: GateKey::new(key),
            label: None,
            rule: parse_rule(rule).unwrap(),
            source: rule.to_string(),
        }
    }

    fn driver_with_gates(gates: Vec<GateDef>) -> Driver {
        Driver {
            id: "voucher.cash".into(),
            version: "1.0.0".into(),
            title: None,
            description: None,
            payload_schema: Default::default(),
            payload_storage: Default::default(),
            documents: Vec::new(),
            checklist: Vec::new(),
            signals: vec![SignalDef {
                key: SignalKey::new("approved"),
                label: None,
                category: SignalCategory::Decision,
                default: Some(SignalValue::Bool(false)),
                required: false,
                system_settable: false,
            }],
            gates,
            audit: Default::default(),
            manifest: Default::default(),
            form_flow_mapping: None,
        }
    }

    fn envelope() -> Envelope {
        Envelope::new(
            EnvelopeId::new("env-1"),
            DriverKey::new("voucher.cash".into(), "1.0.0".into()),
            ReferenceCode::new("VCH-001"),
            Timestamp::from_unix_millis(0),
        )
    }

    #[test]
    fn gates_chain_in_definition_order() {
        let driver = driver_with_gates(vec![
            gate("payload_valid", "payload.valid"),
            gate("settleable", "gate.payload_valid && signal.approved"),
        ]);
        let mut env = envelope();
        let results = GateEvaluator::new().evaluate(&env, &driver);
        assert_eq!(results.get(&GateKey::new("payload_valid")), Some(&false));
        assert_eq!(results.get(&GateKey::new("settleable")), Some(&false));

        env.payload = match json!({ "amount": 10 }) {
            serde_json::Value::Object(map) => map,
            _ => unreachable!(),
        };
        env.signals.insert(
            SignalKey::new("approved"),
            SignalState {
                value: Some(SignalValue::Bool(true)),
                set_by: None,
                set_at: None,
            },
        );
        let results = GateEvaluator::new().evaluate(&env, &driver);
        assert_eq!(results.get(&GateKey::new("payload_valid")), Some(&true));
        assert_eq!(results.get(&GateKey::new("settleable")), Some(&true));
    }

    #[test]
    fn unset_signal_falls_back_to_driver_default() {
        let driver = driver_with_gates(vec![gate("approved", "signal.approved == true")]);
        let results = GateEvaluator::new().evaluate(&envelope(), &driver);
        assert_eq!(results.get(&GateKey::new("approved")), Some(&false));
    }

    #[test]
    fn evaluation_is_pure_and_repeatable() {
        let driver = driver_with_gates(vec![
            gate("payload_valid", "payload.valid"),
            gate("settleable", "gate.payload_valid || signal.approved"),
        ]);
        let env = envelope();
        let first = GateEvaluator::new().evaluate(&env, &driver);
        let second = GateEvaluator::new().evaluate(&env, &driver);
        assert_eq!(first, second);
    }

    #[test]
    fn pending_optional_review_does_not_hold_the_accepted_aggregate() {
        let driver = driver_with_gates(vec![gate("settleable", "checklist.required_accepted")]);
        let pending_item = |review: ReviewMode| ChecklistItem {
            key: ChecklistKey::new("selfie"),
            kind: ChecklistItemKind::Document,
            required: true,
            review,
            doc_type: None,
            pointer: None,
            signal: None,
            attestation_type: None,
            status: ChecklistItemStatus::PendingReview,
            note: None,
        };

        let mut env = envelope();
        env.checklist = vec![pending_item(ReviewMode::Optional)];
        let results = GateEvaluator::new().evaluate(&env, &driver);
        assert_eq!(results.get(&GateKey::new("settleable")), Some(&true));

        env.checklist = vec![pending_item(ReviewMode::Required)];
        let results = GateEvaluator::new().evaluate(&env, &driver);
        assert_eq!(results.get(&GateKey::new("settleable")), Some(&false));
    }

    #[test]
    fn unknown_reference_is_falsy() {
        let driver = driver_with_gates(vec![gate("odd", "signal.never_defined")]);
        let results = GateEvaluator::new().evaluate(&envelope(), &driver);
        assert_eq!(results.get(&GateKey::new("odd")), Some(&false));
    }
}
