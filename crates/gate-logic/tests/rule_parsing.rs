// crates/gate-logic/tests/rule_parsing.rs
// ============================================================================
// Module: Rule Parsing Unit Tests
// Description: Tests for the gate rule lexer, parser, and evaluation.
// Purpose: Validate the rule grammar against the expressions drivers actually use.
// Dependencies: gate-logic
// ============================================================================

//! ## Overview
//! Exercises [`gate_logic::parse_rule`] and evaluation over map resolvers,
//! covering the operator set, literals, precedence, and failure modes.

#![allow(
    clippy::panic,
    clippy::print_stdout,
    clippy::print_stderr,
    clippy::unwrap_used,
    clippy::expect_used,
    clippy::use_debug,
    clippy::dbg_macro,
    clippy::panic_in_result_fn,
    clippy::unwrap_in_result,
    clippy::missing_docs_in_private_items,
    reason = "Test-only output and panic-based assertions are permitted."
)]

use std::collections::BTreeMap;

use gate_logic::RuleParseError;
use gate_logic::RuleValue;
use gate_logic::parse_rule;

// ============================================================================
// SECTION: Test Helpers
// ============================================================================

/// Builds a resolver map from (reference, value) pairs.
fn resolver(entries: &[(&str, RuleValue)]) -> BTreeMap<String, RuleValue> {
    entries.iter().map(|(key, value)| ((*key).to_string(), value.clone())).collect()
}

/// Parses and evaluates a rule against the given context entries.
fn eval(rule: &str, entries: &[(&str, RuleValue)]) -> bool {
    parse_rule(rule).expect("rule should parse").evaluate_bool(&resolver(entries))
}

// ============================================================================
// SECTION: Literal Tests
// ============================================================================

#[test]
fn evaluates_boolean_literals() {
    assert!(eval("true", &[]));
    assert!(!eval("false", &[]));
}

#[test]
fn negates_literals() {
    assert!(!eval("!true", &[]));
    assert!(eval("!false", &[]));
}

#[test]
fn numeric_literal_zero_is_falsy() {
    assert!(!eval("0", &[]));
    assert!(eval("1", &[]));
    assert!(eval("0.5", &[]));
}

// ============================================================================
// SECTION: Reference Tests
// ============================================================================

#[test]
fn resolves_dotted_references() {
    assert!(eval("signal.approved", &[("signal.approved", RuleValue::Bool(true))]));
    assert!(!eval("signal.approved", &[("signal.approved", RuleValue::Bool(false))]));
}

#[test]
fn unknown_reference_is_false() {
    assert!(!eval("signal.never_declared", &[]));
}

#[test]
fn negates_signal_reference() {
    assert!(!eval("!signal.approved", &[("signal.approved", RuleValue::Bool(true))]));
}

// ============================================================================
// SECTION: Boolean Composition Tests
// ============================================================================

#[test]
fn evaluates_and_chains() {
    let ctx = [
        ("signal.kyc_passed", RuleValue::Bool(true)),
        ("signal.account_created", RuleValue::Bool(true)),
    ];
    assert!(eval("signal.kyc_passed && signal.account_created", &ctx));

    let ctx = [
        ("signal.kyc_passed", RuleValue::Bool(true)),
        ("signal.account_created", RuleValue::Bool(false)),
    ];
    assert!(!eval("signal.kyc_passed && signal.account_created", &ctx));
}

#[test]
fn evaluates_or_chains() {
    let ctx = [("a", RuleValue::Bool(false)), ("b", RuleValue::Bool(true))];
    assert!(eval("a || b", &ctx));
    assert!(!eval("a || a", &ctx));
}

#[test]
fn and_binds_tighter_than_or() {
    // a || (b && c)
    let ctx = [
        ("a", RuleValue::Bool(true)),
        ("b", RuleValue::Bool(false)),
        ("c", RuleValue::Bool(true)),
    ];
    assert!(eval("a || b && c", &ctx));
    assert!(!eval("(a || b) && b", &ctx));
}

#[test]
fn parenthesized_grouping_overrides_precedence() {
    let ctx = [
        ("a", RuleValue::Bool(false)),
        ("b", RuleValue::Bool(true)),
        ("c", RuleValue::Bool(false)),
    ];
    assert!(!eval("(a || b) && c", &ctx));
}

// ============================================================================
// SECTION: Comparison Tests
// ============================================================================

#[test]
fn evaluates_equality_against_boolean_literal() {
    assert!(eval("payload.valid == true", &[("payload.valid", RuleValue::Bool(true))]));
    assert!(eval("payload.valid == false", &[("payload.valid", RuleValue::Bool(false))]));
}

#[test]
fn evaluates_inequality_against_number() {
    let ctx = [("checklist.pending_count", RuleValue::Number(5.0))];
    assert!(eval("checklist.pending_count != 0", &ctx));
    let ctx = [("checklist.pending_count", RuleValue::Number(0.0))];
    assert!(!eval("checklist.pending_count != 0", &ctx));
}

#[test]
fn evaluates_string_comparison() {
    let ctx = [("envelope.status", RuleValue::String("draft".to_string()))];
    assert!(eval("envelope.status == \"draft\"", &ctx));
    assert!(eval("envelope.status == 'draft'", &ctx));
    assert!(!eval("envelope.status == 'locked'", &ctx));
}

#[test]
fn unresolved_reference_compared_to_true_is_false() {
    assert!(!eval("payload.valid == true", &[]));
}

// ============================================================================
// SECTION: Production Rule Shapes
// ============================================================================

#[test]
fn evaluates_settleable_rule_shape() {
    let ctx = [
        ("gate.payload_valid", RuleValue::Bool(true)),
        ("gate.docs_reviewed", RuleValue::Bool(true)),
        ("signal.approved", RuleValue::Bool(true)),
    ];
    assert!(eval("gate.payload_valid && gate.docs_reviewed && signal.approved", &ctx));

    let ctx = [
        ("gate.payload_valid", RuleValue::Bool(true)),
        ("gate.docs_reviewed", RuleValue::Bool(true)),
        ("signal.approved", RuleValue::Bool(false)),
    ];
    assert!(!eval("gate.payload_valid && gate.docs_reviewed && signal.approved", &ctx));
}

#[test]
fn evaluates_checklist_flag_rules() {
    let ctx = [("checklist.required_accepted", RuleValue::Bool(true))];
    assert!(eval("checklist.required_accepted == true", &ctx));
    assert!(eval("checklist.required_accepted", &ctx));
}

// ============================================================================
// SECTION: Error Tests
// ============================================================================

#[test]
fn rejects_empty_input() {
    assert_eq!(parse_rule("   "), Err(RuleParseError::EmptyInput));
}

#[test]
fn rejects_single_ampersand() {
    let err = parse_rule("a & b").unwrap_err();
    assert!(matches!(err, RuleParseError::UnexpectedToken { expected: "&&", .. }));
}

#[test]
fn rejects_single_equals() {
    let err = parse_rule("a = b").unwrap_err();
    assert!(matches!(err, RuleParseError::UnexpectedToken { expected: "==", .. }));
}

#[test]
fn rejects_trailing_input() {
    let err = parse_rule("a b").unwrap_err();
    assert!(matches!(err, RuleParseError::TrailingInput { .. }));
}

#[test]
fn rejects_malformed_reference() {
    let err = parse_rule("signal..approved").unwrap_err();
    assert!(matches!(err, RuleParseError::InvalidReference { .. }));
}

#[test]
fn rejects_unterminated_string() {
    let err = parse_rule("status == 'draft").unwrap_err();
    assert!(matches!(err, RuleParseError::UnterminatedString { .. }));
}

#[test]
fn rejects_unbalanced_parentheses() {
    let err = parse_rule("(a && b").unwrap_err();
    assert!(matches!(err, RuleParseError::UnexpectedToken { .. }));
}

#[test]
fn rejects_excess_nesting() {
    let depth = gate_logic::MAX_RULE_NESTING + 1;
    let rule = format!("{}true{}", "(".repeat(depth), ")".repeat(depth));
    let err = parse_rule(&rule).unwrap_err();
    assert!(matches!(err, RuleParseError::NestingTooDeep { .. }));
}

#[test]
fn rejects_oversized_input() {
    let rule = "a && ".repeat(gate_logic::MAX_RULE_INPUT_BYTES / 4);
    let err = parse_rule(&rule).unwrap_err();
    assert!(matches!(err, RuleParseError::InputTooLarge { .. }));
}

// ============================================================================
// SECTION: Purity Tests
// ============================================================================

#[test]
fn evaluation_is_stable_across_calls() {
    let expr = parse_rule("gate.a && (signal.b || !signal.c)").expect("rule should parse");
    let ctx = resolver(&[
        ("gate.a", RuleValue::Bool(true)),
        ("signal.b", RuleValue::Bool(false)),
        ("signal.c", RuleValue::Bool(false)),
    ]);
    let first = expr.evaluate_bool(&ctx);
    for _ in 0 .. 16 {
        assert_eq!(expr.evaluate_bool(&ctx), first);
    }
}
