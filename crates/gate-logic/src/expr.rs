// crates/gate-logic/src/expr.rs
// ============================================================================
// Module: Rule Expression Tree
// Description: Typed AST for gate rules and pure evaluation semantics.
// Purpose: Evaluate parsed rules against host contexts without re-parsing.
// Dependencies: serde
// ============================================================================

//! ## Overview
//! [`RuleExpr`] is the immutable expression tree produced by
//! [`parse_rule`](crate::dsl::parse_rule). Evaluation resolves dotted
//! references through a caller-supplied [`Resolver`] and folds the tree into
//! a boolean. Comparison and truthiness semantics are loose by design: rules
//! are authored in driver configuration by operators, not programmers, and
//! the original engine accepted `payload.valid == true` alongside bare
//! references like `signal.approved`.

// ============================================================================
// SECTION: Imports
// ============================================================================

use std::collections::BTreeMap;
use std::fmt;

use serde::Deserialize;
use serde::Serialize;

// ============================================================================
// SECTION: Rule Values
// ============================================================================

/// Value produced by resolving a rule reference.
///
/// # Invariants
/// - `Null` represents an unresolved reference; it is falsy and compares
///   equal only to `Null` and falsy booleans.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum RuleValue {
    /// Absent or unresolved value.
    Null,
    /// Boolean value.
    Bool(bool),
    /// Numeric value (integers widen to f64).
    Number(f64),
    /// String value.
    String(String),
}

impl RuleValue {
    /// Returns the loose truthiness of the value.
    ///
    /// Empty strings and the literal string `"0"` are falsy; every other
    /// non-empty string is truthy. Numbers are truthy when non-zero.
    #[must_use]
    pub fn is_truthy(&self) -> bool {
        match self {
            Self::Null => false,
            Self::Bool(value) => *value,
            Self::Number(value) => *value != 0.0,
            Self::String(value) => !value.is_empty() && value != "0",
        }
    }

    /// Compares two values with loose equality.
    ///
    /// Numbers and numeric strings compare numerically; booleans compare
    /// against the other side's truthiness; `Null` equals `Null` and any
    /// falsy boolean.
    #[must_use]
    pub fn loose_eq(&self, other: &Self) -> bool {
        match (self, other) {
            (Self::Null, Self::Null) => true,
            (Self::Bool(a), Self::Bool(b)) => a == b,
            (Self::Bool(a), other_value) | (other_value, Self::Bool(a)) => {
                *a == other_value.is_truthy()
            }
            (Self::Number(a), Self::Number(b)) => a == b,
            (Self::String(a), Self::String(b)) => a == b,
            (Self::Number(a), Self::String(b)) | (Self::String(b), Self::Number(a)) => {
                b.parse::<f64>().is_ok_and(|parsed| parsed == *a)
            }
            (Self::Null, _) | (_, Self::Null) => false,
        }
    }
}

impl fmt::Display for RuleValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Null => write!(f, "null"),
            Self::Bool(value) => value.fmt(f),
            Self::Number(value) => value.fmt(f),
            Self::String(value) => value.fmt(f),
        }
    }
}

impl From<bool> for RuleValue {
    fn from(value: bool) -> Self {
        Self::Bool(value)
    }
}

impl From<f64> for RuleValue {
    fn from(value: f64) -> Self {
        Self::Number(value)
    }
}

impl From<&str> for RuleValue {
    fn from(value: &str) -> Self {
        Self::String(value.to_string())
    }
}

// ============================================================================
// SECTION: Resolver
// ============================================================================

/// Resolves dotted references (e.g. `signal.approved`) to values.
///
/// Implementations must be pure for the duration of an evaluation: the same
/// reference must resolve to the same value within one `evaluate` call.
pub trait Resolver {
    /// Returns the value for the given dotted reference, or `None` if unknown.
    fn resolve(&self, reference: &str) -> Option<RuleValue>;
}

impl Resolver for BTreeMap<String, RuleValue> {
    fn resolve(&self, reference: &str) -> Option<RuleValue> {
        self.get(reference).cloned()
    }
}

impl<F> Resolver for F
where
    F: Fn(&str) -> Option<RuleValue>,
{
    fn resolve(&self, reference: &str) -> Option<RuleValue> {
        (self)(reference)
    }
}

// ============================================================================
// SECTION: Expression Tree
// ============================================================================

/// Immutable rule expression tree.
///
/// # Invariants
/// - Trees are built by the parser and never mutated afterwards.
/// - `Reference` paths are dotted identifiers validated by the parser.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum RuleExpr {
    /// Literal value.
    Literal {
        /// The literal value.
        value: RuleValue,
    },
    /// Dotted context reference.
    Reference {
        /// Dotted reference path (e.g. `checklist.required_accepted`).
        path: String,
    },
    /// Logical conjunction; short-circuits left to right.
    And {
        /// Operand expressions.
        operands: Vec<RuleExpr>,
    },
    /// Logical disjunction; short-circuits left to right.
    Or {
        /// Operand expressions.
        operands: Vec<RuleExpr>,
    },
    /// Logical negation.
    Not {
        /// Negated expression.
        operand: Box<RuleExpr>,
    },
    /// Loose equality comparison.
    Eq {
        /// Left operand.
        left: Box<RuleExpr>,
        /// Right operand.
        right: Box<RuleExpr>,
    },
    /// Loose inequality comparison.
    Ne {
        /// Left operand.
        left: Box<RuleExpr>,
        /// Right operand.
        right: Box<RuleExpr>,
    },
}

impl RuleExpr {
    /// Evaluates the expression to a value.
    ///
    /// Unresolved references yield [`RuleValue::Null`], which is falsy.
    #[must_use]
    pub fn evaluate<R: Resolver>(&self, resolver: &R) -> RuleValue {
        match self {
            Self::Literal {
                value,
            } => value.clone(),
            Self::Reference {
                path,
            } => resolver.resolve(path).unwrap_or(RuleValue::Null),
            Self::And {
                operands,
            } => {
                let all = operands.iter().all(|operand| operand.evaluate_bool(resolver));
                RuleValue::Bool(all)
            }
            Self::Or {
                operands,
            } => {
                let any = operands.iter().any(|operand| operand.evaluate_bool(resolver));
                RuleValue::Bool(any)
            }
            Self::Not {
                operand,
            } => RuleValue::Bool(!operand.evaluate_bool(resolver)),
            Self::Eq {
                left,
                right,
            } => RuleValue::Bool(left.evaluate(resolver).loose_eq(&right.evaluate(resolver))),
            Self::Ne {
                left,
                right,
            } => RuleValue::Bool(!left.evaluate(resolver).loose_eq(&right.evaluate(resolver))),
        }
    }

    /// Evaluates the expression and truthy-tests the result.
    #[must_use]
    pub fn evaluate_bool<R: Resolver>(&self, resolver: &R) -> bool {
        self.evaluate(resolver).is_truthy()
    }

    /// Visits every reference path in the tree.
    ///
    /// Used by driver loaders to validate references against the declared
    /// signals and gates before a rule is accepted.
    pub fn visit_references<'a>(&'a self, visit: &mut impl FnMut(&'a str)) {
        match self {
            Self::Literal {
                ..
            } => {}
            Self::Reference {
                path,
            } => visit(path),
            Self::And {
                operands,
            }
            | Self::Or {
                operands,
            } => {
                for operand in operands {
                    operand.visit_references(visit);
                }
            }
            Self::Not {
                operand,
            } => operand.visit_references(visit),
            Self::Eq {
                left,
                right,
            }
            | Self::Ne {
                left,
                right,
            } => {
                left.visit_references(visit);
                right.visit_references(visit);
            }
        }
    }

    /// Collects every reference path in the tree.
    #[must_use]
    pub fn references(&self) -> Vec<&str> {
        let mut paths = Vec::new();
        self.visit_references(&mut |path| paths.push(path));
        paths
    }
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

    use std::collections::BTreeMap;

    use super::RuleExpr;
    use super::RuleValue;

    fn context(entries: &[(&str, RuleValue)]) -> BTreeMap<String, RuleValue> {
        entries.iter().map(|(key, value)| ((*key).to_string(), value.clone())).collect()
    }

    #[test]
    fn truthiness_matches_loose_semantics() {
        assert!(!RuleValue::Null.is_truthy());
        assert!(!RuleValue::Bool(false).is_truthy());
        assert!(!RuleValue::Number(0.0).is_truthy());
        assert!(!RuleValue::String(String::new()).is_truthy());
        assert!(!RuleValue::String("0".to_string()).is_truthy());
        assert!(RuleValue::Bool(true).is_truthy());
        assert!(RuleValue::Number(2.5).is_truthy());
        assert!(RuleValue::String("yes".to_string()).is_truthy());
    }

    #[test]
    fn loose_eq_compares_numeric_strings() {
        assert!(RuleValue::Number(5.0).loose_eq(&RuleValue::String("5".to_string())));
        assert!(!RuleValue::Number(5.0).loose_eq(&RuleValue::String("five".to_string())));
    }

    #[test]
    fn loose_eq_compares_booleans_by_truthiness() {
        assert!(RuleValue::Bool(true).loose_eq(&RuleValue::String("accepted".to_string())));
        assert!(RuleValue::Bool(false).loose_eq(&RuleValue::Null));
    }

    #[test]
    fn unresolved_reference_is_falsy() {
        let expr = RuleExpr::Reference {
            path: "signal.unknown".to_string(),
        };
        assert!(!expr.evaluate_bool(&context(&[])));
    }

    #[test]
    fn and_short_circuits_over_operands() {
        let expr = RuleExpr::And {
            operands: vec![
                RuleExpr::Reference {
                    path: "a".to_string(),
                },
                RuleExpr::Reference {
                    path: "b".to_string(),
                },
            ],
        };
        let ctx = context(&[("a", RuleValue::Bool(true)), ("b", RuleValue::Bool(false))]);
        assert!(!expr.evaluate_bool(&ctx));
    }

    #[test]
    fn references_collects_all_paths() {
        let expr = RuleExpr::And {
            operands: vec![
                RuleExpr::Reference {
                    path: "gate.payload_valid".to_string(),
                },
                RuleExpr::Not {
                    operand: Box::new(RuleExpr::Reference {
                        path: "signal.blocked".to_string(),
                    }),
                },
            ],
        };
        assert_eq!(expr.references(), vec!["gate.payload_valid", "signal.blocked"]);
    }
}
