// crates/gate-logic/src/dsl.rs
// ============================================================================
// Module: Gate Rule Parser
// Description: Lexer and recursive-descent parser for driver gate rules.
// Purpose: Turn operator-authored rule strings into `RuleExpr` trees with
//          validation and positioned errors.
// Dependencies: crate::expr
// ============================================================================

//! ## Overview
//!
//! The rule language is a compact boolean syntax for driver authors. It
//! supports infix composition (`&&`, `||`, `!`), loose comparison (`==`,
//! `!=`), parentheses, literals (`true`, `false`, numbers, quoted strings)
//! and dotted context references (`checklist.required_accepted`,
//! `signal.kyc_passed`, `gate.payload_valid`).
//!
//! ### Grammar (informal)
//! - **or**: `and ( "||" and )*`
//! - **and**: `cmp ( "&&" cmp )*`
//! - **cmp**: `unary ( ("==" | "!=") unary )?`
//! - **unary**: `"!" unary | primary`
//! - **primary**: `"(" or ")" | literal | reference`
//!
//! ### Example
//!
//! ```
//! use gate_logic::RuleValue;
//! use gate_logic::parse_rule;
//!
//! let rule = parse_rule("gate.payload_valid && signal.approved").unwrap();
//! let resolver = |reference: &str| match reference {
//!     "gate.payload_valid" | "signal.approved" => Some(RuleValue::Bool(true)),
//!     _ => None,
//! };
//! assert!(rule.evaluate_bool(&resolver));
//! ```
//!
//! Rule input is untrusted driver configuration; the parser enforces size
//! and nesting limits and fails closed on anything it does not recognize.

// ============================================================================
// SECTION: Imports
// ============================================================================

use std::fmt;

use crate::expr::RuleExpr;
use crate::expr::RuleValue;

// ============================================================================
// SECTION: Limits
// ============================================================================

/// Maximum allowed rule input size in bytes.
pub const MAX_RULE_INPUT_BYTES: usize = 64 * 1024;
/// Maximum supported nesting depth for rule expressions.
pub const MAX_RULE_NESTING: usize = 32;

// ============================================================================
// SECTION: Errors
// ============================================================================

/// Errors that can occur while parsing a rule expression.
///
/// # Invariants
/// - `position` fields are byte offsets into the original input.
#[derive(Debug, Clone, PartialEq)]
pub enum RuleParseError {
    /// Input was empty or contained only whitespace.
    EmptyInput,
    /// Input exceeded the configured size limit.
    InputTooLarge {
        /// Maximum allowed bytes.
        max_bytes: usize,
        /// Actual input length in bytes.
        actual_bytes: usize,
    },
    /// Input exceeded the configured nesting depth.
    NestingTooDeep {
        /// Maximum allowed nesting depth.
        max_depth: usize,
        /// Byte offset in the original input.
        position: usize,
    },
    /// Unexpected token encountered during parsing.
    UnexpectedToken {
        /// Human-friendly expectation summary.
        expected: &'static str,
        /// The token that was actually seen.
        found: String,
        /// Byte offset in the original input.
        position: usize,
    },
    /// Reference path was malformed (empty segment or trailing dot).
    InvalidReference {
        /// The malformed reference text.
        raw: String,
        /// Byte offset in the original input.
        position: usize,
    },
    /// Numeric literal failed to parse.
    InvalidNumber {
        /// The raw numeric text.
        raw: String,
        /// Byte offset in the original input.
        position: usize,
    },
    /// String literal was not terminated.
    UnterminatedString {
        /// Byte offset where the string begins.
        position: usize,
    },
    /// Unexpected trailing input after a complete expression.
    TrailingInput {
        /// Byte offset where unexpected input begins.
        position: usize,
    },
}

impl fmt::Display for RuleParseError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::EmptyInput => write!(f, "rule is empty"),
            Self::InputTooLarge {
                max_bytes,
                actual_bytes,
            } => {
                write!(f, "rule exceeds size limit: {actual_bytes} bytes (max {max_bytes})")
            }
            Self::NestingTooDeep {
                max_depth,
                position,
            } => {
                write!(f, "rule nesting exceeds limit of {max_depth} at {position}")
            }
            Self::UnexpectedToken {
                expected,
                found,
                position,
            } => {
                write!(f, "unexpected token `{found}` at {position}, expected {expected}")
            }
            Self::InvalidReference {
                raw,
                position,
            } => {
                write!(f, "invalid reference `{raw}` at {position}")
            }
            Self::InvalidNumber {
                raw,
                position,
            } => {
                write!(f, "invalid number `{raw}` at {position}")
            }
            Self::UnterminatedString {
                position,
            } => {
                write!(f, "unterminated string literal at {position}")
            }
            Self::TrailingInput {
                position,
            } => {
                write!(f, "unexpected trailing input at {position}")
            }
        }
    }
}

impl std::error::Error for RuleParseError {}

// ============================================================================
// SECTION: Public API
// ============================================================================

/// Parses a rule string into a [`RuleExpr`] tree.
///
/// # Errors
/// Returns [`RuleParseError`] for syntax issues, malformed references or
/// literals, trailing input, and size/nesting limit violations.
pub fn parse_rule(input: &str) -> Result<RuleExpr, RuleParseError> {
    if input.len() > MAX_RULE_INPUT_BYTES {
        return Err(RuleParseError::InputTooLarge {
            max_bytes: MAX_RULE_INPUT_BYTES,
            actual_bytes: input.len(),
        });
    }
    let mut lexer = Lexer::new(input);
    let tokens = lexer.lex()?;

    let mut parser = Parser::new(tokens);
    let expr = parser.parse_or()?;
    parser.expect_eof()?;
    Ok(expr)
}

// ============================================================================
// SECTION: Lexer
// ============================================================================

/// Lexer token produced from the rule input.
#[derive(Debug, Clone, PartialEq)]
enum Token {
    /// Dotted reference path or bare identifier.
    Reference(String),
    /// Numeric literal text.
    Number(String),
    /// Quoted string literal (unquoted content).
    Str(String),
    /// Boolean literal `true`.
    True,
    /// Boolean literal `false`.
    False,
    /// Logical AND operator (`&&`).
    And,
    /// Logical OR operator (`||`).
    Or,
    /// Logical NOT operator (`!`).
    Not,
    /// Loose equality operator (`==`).
    EqEq,
    /// Loose inequality operator (`!=`).
    NotEq,
    /// Left parenthesis.
    LParen,
    /// Right parenthesis.
    RParen,
    /// End-of-input marker.
    Eof,
}

/// Token paired with its byte offset.
#[derive(Debug, Clone)]
struct SpannedToken {
    /// Token value.
    token: Token,
    /// Byte offset into the input.
    position: usize,
}

/// Lexer for the rule language.
struct Lexer<'a> {
    /// Source input being tokenized.
    input: &'a str,
    /// Current byte offset into the input.
    offset: usize,
}

impl<'a> Lexer<'a> {
    /// Creates a new lexer for the given input.
    const fn new(input: &'a str) -> Self {
        Self {
            input,
            offset: 0,
        }
    }

    /// Lexes the input into a sequence of tokens.
    fn lex(&mut self) -> Result<Vec<SpannedToken>, RuleParseError> {
        let mut tokens = Vec::new();
        let bytes = self.input.as_bytes();

        while self.offset < bytes.len() {
            let ch = bytes[self.offset];
            match ch {
                b' ' | b'\t' | b'\n' | b'\r' => {
                    self.offset += 1;
                }
                b'(' => {
                    tokens.push(self.simple(Token::LParen));
                    self.offset += 1;
                }
                b')' => {
                    tokens.push(self.simple(Token::RParen));
                    self.offset += 1;
                }
                b'!' => {
                    if self.peek_char(bytes) == Some(b'=') {
                        tokens.push(self.simple(Token::NotEq));
                        self.offset += 2;
                    } else {
                        tokens.push(self.simple(Token::Not));
                        self.offset += 1;
                    }
                }
                b'=' => {
                    if self.peek_char(bytes) == Some(b'=') {
                        tokens.push(self.simple(Token::EqEq));
                        self.offset += 2;
                    } else {
                        return Err(RuleParseError::UnexpectedToken {
                            expected: "==",
                            found: "=".to_string(),
                            position: self.offset,
                        });
                    }
                }
                b'&' => {
                    if self.peek_char(bytes) == Some(b'&') {
                        tokens.push(self.simple(Token::And));
                        self.offset += 2;
                    } else {
                        return Err(RuleParseError::UnexpectedToken {
                            expected: "&&",
                            found: "&".to_string(),
                            position: self.offset,
                        });
                    }
                }
                b'|' => {
                    if self.peek_char(bytes) == Some(b'|') {
                        tokens.push(self.simple(Token::Or));
                        self.offset += 2;
                    } else {
                        return Err(RuleParseError::UnexpectedToken {
                            expected: "||",
                            found: "|".to_string(),
                            position: self.offset,
                        });
                    }
                }
                b'"' | b'\'' => {
                    tokens.push(self.lex_string(bytes, ch)?);
                }
                b'0' ..= b'9' => {
                    tokens.push(self.lex_number(bytes)?);
                }
                b'a' ..= b'z' | b'A' ..= b'Z' | b'_' => {
                    tokens.push(self.lex_reference(bytes)?);
                }
                _ => {
                    return Err(RuleParseError::UnexpectedToken {
                        expected: "reference, literal, or operator",
                        found: char::from(ch).to_string(),
                        position: self.offset,
                    });
                }
            }
        }

        if tokens.is_empty() {
            return Err(RuleParseError::EmptyInput);
        }

        tokens.push(SpannedToken {
            token: Token::Eof,
            position: self.offset,
        });
        Ok(tokens)
    }

    /// Builds a token at the current offset.
    const fn simple(&self, token: Token) -> SpannedToken {
        SpannedToken {
            token,
            position: self.offset,
        }
    }

    /// Returns the next byte without advancing.
    fn peek_char(&self, bytes: &[u8]) -> Option<u8> {
        bytes.get(self.offset + 1).copied()
    }

    /// Lexes a quoted string literal.
    fn lex_string(&mut self, bytes: &[u8], quote: u8) -> Result<SpannedToken, RuleParseError> {
        let start = self.offset;
        self.offset += 1;
        let content_start = self.offset;
        while let Some(&b) = bytes.get(self.offset) {
            if b == quote {
                let content = self.input[content_start .. self.offset].to_string();
                self.offset += 1;
                return Ok(SpannedToken {
                    token: Token::Str(content),
                    position: start,
                });
            }
            self.offset += 1;
        }
        Err(RuleParseError::UnterminatedString {
            position: start,
        })
    }

    /// Lexes a numeric literal (digits with an optional fraction).
    fn lex_number(&mut self, bytes: &[u8]) -> Result<SpannedToken, RuleParseError> {
        let start = self.offset;
        self.consume_while(bytes, |b| b.is_ascii_digit());
        if bytes.get(self.offset) == Some(&b'.')
            && bytes.get(self.offset + 1).is_some_and(u8::is_ascii_digit)
        {
            self.offset += 1;
            self.consume_while(bytes, |b| b.is_ascii_digit());
        }
        let raw = &self.input[start .. self.offset];
        if raw.parse::<f64>().is_err() {
            return Err(RuleParseError::InvalidNumber {
                raw: raw.to_string(),
                position: start,
            });
        }
        Ok(SpannedToken {
            token: Token::Number(raw.to_string()),
            position: start,
        })
    }

    /// Lexes a dotted reference path or keyword.
    fn lex_reference(&mut self, bytes: &[u8]) -> Result<SpannedToken, RuleParseError> {
        let start = self.offset;
        self.consume_while(bytes, |b| b.is_ascii_alphanumeric() || b == b'_' || b == b'.');
        let raw = &self.input[start .. self.offset];

        let token = match raw {
            "true" => Token::True,
            "false" => Token::False,
            _ => {
                let malformed = raw.split('.').any(str::is_empty);
                if malformed {
                    return Err(RuleParseError::InvalidReference {
                        raw: raw.to_string(),
                        position: start,
                    });
                }
                Token::Reference(raw.to_string())
            }
        };
        Ok(SpannedToken {
            token,
            position: start,
        })
    }

    /// Advances while the condition matches the current byte.
    fn consume_while<F>(&mut self, bytes: &[u8], condition: F)
    where
        F: Fn(u8) -> bool,
    {
        while let Some(&b) = bytes.get(self.offset) {
            if condition(b) {
                self.offset += 1;
            } else {
                break;
            }
        }
    }
}

// ============================================================================
// SECTION: Parser
// ============================================================================

/// Recursive-descent parser for the rule language.
struct Parser {
    /// Token stream with source positions.
    tokens: Vec<SpannedToken>,
    /// Current token index.
    index: usize,
    /// Current nesting depth for parenthesized and negated expressions.
    nesting: usize,
}

impl Parser {
    /// Creates a parser over the token stream.
    const fn new(tokens: Vec<SpannedToken>) -> Self {
        Self {
            tokens,
            index: 0,
            nesting: 0,
        }
    }

    /// Parses OR expressions.
    fn parse_or(&mut self) -> Result<RuleExpr, RuleParseError> {
        let mut parts = Vec::new();
        parts.push(self.parse_and()?);

        while self.matches(&Token::Or) {
            parts.push(self.parse_and()?);
        }

        if parts.len() == 1 {
            Ok(parts.remove(0))
        } else {
            Ok(RuleExpr::Or {
                operands: parts,
            })
        }
    }

    /// Parses AND expressions.
    fn parse_and(&mut self) -> Result<RuleExpr, RuleParseError> {
        let mut parts = Vec::new();
        parts.push(self.parse_comparison()?);

        while self.matches(&Token::And) {
            parts.push(self.parse_comparison()?);
        }

        if parts.len() == 1 {
            Ok(parts.remove(0))
        } else {
            Ok(RuleExpr::And {
                operands: parts,
            })
        }
    }

    /// Parses an optional `==` / `!=` comparison.
    fn parse_comparison(&mut self) -> Result<RuleExpr, RuleParseError> {
        let left = self.parse_unary()?;

        if self.matches(&Token::EqEq) {
            let right = self.parse_unary()?;
            return Ok(RuleExpr::Eq {
                left: Box::new(left),
                right: Box::new(right),
            });
        }
        if self.matches(&Token::NotEq) {
            let right = self.parse_unary()?;
            return Ok(RuleExpr::Ne {
                left: Box::new(left),
                right: Box::new(right),
            });
        }
        Ok(left)
    }

    /// Parses unary expressions, including NOT.
    fn parse_unary(&mut self) -> Result<RuleExpr, RuleParseError> {
        if self.matches(&Token::Not) {
            let position = self.current().position;
            return self.with_nesting(position, |parser| {
                let operand = parser.parse_unary()?;
                Ok(RuleExpr::Not {
                    operand: Box::new(operand),
                })
            });
        }
        self.parse_primary()
    }

    /// Parses a primary expression.
    fn parse_primary(&mut self) -> Result<RuleExpr, RuleParseError> {
        let position = self.current().position;
        match self.current().token.clone() {
            Token::Reference(path) => {
                self.advance();
                Ok(RuleExpr::Reference {
                    path,
                })
            }
            Token::True => {
                self.advance();
                Ok(RuleExpr::Literal {
                    value: RuleValue::Bool(true),
                })
            }
            Token::False => {
                self.advance();
                Ok(RuleExpr::Literal {
                    value: RuleValue::Bool(false),
                })
            }
            Token::Number(raw) => {
                self.advance();
                let value = raw.parse::<f64>().map_err(|_| RuleParseError::InvalidNumber {
                    raw: raw.clone(),
                    position,
                })?;
                Ok(RuleExpr::Literal {
                    value: RuleValue::Number(value),
                })
            }
            Token::Str(content) => {
                self.advance();
                Ok(RuleExpr::Literal {
                    value: RuleValue::String(content),
                })
            }
            Token::LParen => {
                self.advance();
                self.with_nesting(position, |parser| {
                    let expr = parser.parse_or()?;
                    parser.expect(&Token::RParen, "`)`")?;
                    Ok(expr)
                })
            }
            Token::RParen
            | Token::And
            | Token::Or
            | Token::Not
            | Token::EqEq
            | Token::NotEq
            | Token::Eof => Err(RuleParseError::UnexpectedToken {
                expected: "reference, literal, or `(`",
                found: self.describe_current(),
                position,
            }),
        }
    }

    /// Runs a parser step while enforcing the nesting limit.
    fn with_nesting<T>(
        &mut self,
        position: usize,
        f: impl FnOnce(&mut Self) -> Result<T, RuleParseError>,
    ) -> Result<T, RuleParseError> {
        let next_depth = self.nesting + 1;
        if next_depth > MAX_RULE_NESTING {
            return Err(RuleParseError::NestingTooDeep {
                max_depth: MAX_RULE_NESTING,
                position,
            });
        }
        self.nesting = next_depth;
        let result = f(self);
        self.nesting = self.nesting.saturating_sub(1);
        result
    }

    /// Consumes the expected token or returns an error.
    fn expect(&mut self, token: &Token, expected: &'static str) -> Result<(), RuleParseError> {
        if std::mem::discriminant(&self.current().token) == std::mem::discriminant(token) {
            self.advance();
            Ok(())
        } else {
            Err(RuleParseError::UnexpectedToken {
                expected,
                found: self.describe_current(),
                position: self.current().position,
            })
        }
    }

    /// Ensures the parser is at end-of-input.
    fn expect_eof(&self) -> Result<(), RuleParseError> {
        if matches!(self.current().token, Token::Eof) {
            Ok(())
        } else {
            Err(RuleParseError::TrailingInput {
                position: self.current().position,
            })
        }
    }

    /// Consumes the token if it matches the expected kind.
    fn matches(&mut self, kind: &Token) -> bool {
        if std::mem::discriminant(&self.current().token) == std::mem::discriminant(kind) {
            self.advance();
            true
        } else {
            false
        }
    }

    /// Returns the current token.
    fn current(&self) -> &SpannedToken {
        debug_assert!(self.index < self.tokens.len(), "parser index out of bounds");
        &self.tokens[self.index]
    }

    /// Advances to the next token.
    const fn advance(&mut self) {
        if self.index < self.tokens.len() - 1 {
            self.index += 1;
        }
    }

    /// Formats the current token for diagnostics.
    fn describe_current(&self) -> String {
        match &self.current().token {
            Token::Reference(path) => path.clone(),
            Token::Number(raw) => raw.clone(),
            Token::Str(content) => format!("\"{content}\""),
            Token::True => "true".to_string(),
            Token::False => "false".to_string(),
            Token::And => "&&".to_string(),
            Token::Or => "||".to_string(),
            Token::Not => "!".to_string(),
            Token::EqEq => "==".to_string(),
            Token::NotEq => "!=".to_string(),
            Token::LParen => "(".to_string(),
            Token::RParen => ")".to_string(),
            Token::Eof => "end of input".to_string(),
        }
    }
}
