// crates/elspeth-expr/src/lib.rs
// ============================================================================
// Crate: elspeth-expr
// Description: Safe AST-based predicate evaluator for gate conditions.
// ============================================================================

//! Implements the gate condition expression language: a deliberately
//! small whitelist of Python-expression syntax (`==`, `and`/`or`/`not`,
//! arithmetic, `row[...]`, `row.get(...)`, literals, and a ternary) with
//! no calls, no comprehensions, no attribute access beyond `row.get`,
//! and no loops — the whole surface a gate condition can exercise is
//! the grammar in [`parser`].
//!
//! Security and syntax errors can only occur while parsing
//! ([`GateCondition::parse`]); evaluation failures can only occur while
//! evaluating ([`GateCondition::evaluate`]). A condition that has
//! successfully parsed can never later fail with a security or syntax
//! error.

mod ast;
mod error;
mod eval;
mod lexer;
mod parser;

pub use ast::ArithOp;
pub use ast::BoolOp;
pub use ast::CompareOp;
pub use ast::Expr;
pub use error::ExpressionError;
pub use eval::truthy;

use serde::Deserialize;
use serde::Serialize;
use serde_json::Value;

/// A parsed, whitelisted gate condition ready for repeated evaluation
/// against rows.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GateCondition {
    source: String,
    #[serde(skip)]
    expr: Option<Expr>,
}

impl GateCondition {
    /// Parses `source` into a [`GateCondition`].
    ///
    /// # Errors
    ///
    /// Returns [`ExpressionError::Security`] if `source` contains a
    /// construct outside the whitelist, or [`ExpressionError::Syntax`]
    /// if `source` is not well-formed.
    pub fn parse(source: impl Into<String>) -> Result<Self, ExpressionError> {
        let source = source.into();
        let expr = parser::parse(&source)?;
        Ok(Self { source, expr: Some(expr) })
    }

    /// The original source text this condition was parsed from.
    #[must_use]
    pub fn source(&self) -> &str {
        &self.source
    }

    /// Evaluates this condition against `row`.
    ///
    /// # Errors
    ///
    /// Returns [`ExpressionError::Eval`] if evaluation fails at
    /// runtime: a missing field, an out-of-range index, a type
    /// mismatch, or division by zero.
    ///
    /// # Panics
    ///
    /// Panics if called on a `GateCondition` that was deserialized
    /// without going through [`GateCondition::parse`] first; every
    /// value reachable through the public API carries a parsed
    /// expression.
    pub fn evaluate(&self, row: &Value) -> Result<Value, ExpressionError> {
        let expr = self
            .expr
            .as_ref()
            .expect("GateCondition always carries a parsed expression after construction");
        eval::evaluate(expr, row)
    }

    /// Evaluates this condition and coerces the result to Python-style
    /// truthiness, for use as a routing gate predicate.
    ///
    /// # Errors
    ///
    /// Same as [`GateCondition::evaluate`].
    pub fn evaluate_truthy(&self, row: &Value) -> Result<bool, ExpressionError> {
        self.evaluate(row).map(|value| truthy(&value))
    }

    /// Returns whether this condition's shape always evaluates to a
    /// boolean, without evaluating it. Used to decide whether a gate
    /// may use bare `true`/`false` route labels (§4.6).
    #[must_use]
    pub fn is_boolean_expression(&self) -> bool {
        self.expr.as_ref().is_some_and(Expr::is_boolean_expression)
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, reason = "Test-only panic-based assertions are permitted.")]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn evaluates_simple_field_comparison() {
        let condition = GateCondition::parse("row['status'] == 'approved'").unwrap();
        let row = json!({ "status": "approved" });
        assert_eq!(condition.evaluate(&row).unwrap(), json!(true));
    }

    #[test]
    fn evaluates_get_with_default() {
        let condition = GateCondition::parse("row.get('missing', 'fallback')").unwrap();
        let row = json!({});
        assert_eq!(condition.evaluate(&row).unwrap(), json!("fallback"));
    }

    #[test]
    fn evaluates_boolean_chain_with_short_circuit() {
        let condition = GateCondition::parse("row['a'] > 0 and row['b'] > 0").unwrap();
        let row = json!({ "a": 1, "b": -1 });
        assert_eq!(condition.evaluate_truthy(&row).unwrap(), false);
    }

    #[test]
    fn evaluates_ternary_expression() {
        let condition =
            GateCondition::parse("'high' if row['score'] >= 90 else 'low'").unwrap();
        let row = json!({ "score": 95 });
        assert_eq!(condition.evaluate(&row).unwrap(), json!("high"));
    }

    #[test]
    fn rejects_arbitrary_function_calls_as_security_error() {
        let error = GateCondition::parse("eval('1')").unwrap_err();
        assert!(matches!(error, ExpressionError::Security { .. }));
        assert!(error.is_parse_time());
    }

    #[test]
    fn rejects_attribute_access_other_than_get() {
        let error = GateCondition::parse("row.__class__").unwrap_err();
        assert!(matches!(error, ExpressionError::Security { .. }));
    }

    #[test]
    fn rejects_is_comparison_against_non_none() {
        let error = GateCondition::parse("row['x'] is 5").unwrap_err();
        assert!(matches!(error, ExpressionError::Security { .. }));
    }

    #[test]
    fn rejects_malformed_syntax() {
        let error = GateCondition::parse("row['x'] ==").unwrap_err();
        assert!(matches!(error, ExpressionError::Syntax { .. }));
    }

    #[test]
    fn reports_missing_key_as_eval_error() {
        let condition = GateCondition::parse("row['missing']").unwrap();
        let error = condition.evaluate(&json!({})).unwrap_err();
        assert!(matches!(error, ExpressionError::Eval(_)));
    }

    #[test]
    fn reports_division_by_zero_as_eval_error() {
        let condition = GateCondition::parse("row['a'] / row['b']").unwrap();
        let error = condition.evaluate(&json!({ "a": 1, "b": 0 })).unwrap_err();
        assert!(matches!(error, ExpressionError::Eval(_)));
    }

    #[test]
    fn chained_comparison_is_statically_boolean() {
        let condition = GateCondition::parse("0 < row['x'] < 10").unwrap();
        assert!(condition.is_boolean_expression());
    }

    #[test]
    fn arithmetic_expression_is_not_statically_boolean() {
        let condition = GateCondition::parse("row['x'] + 1").unwrap();
        assert!(!condition.is_boolean_expression());
    }

    #[test]
    fn membership_checks_list_and_string_containers() {
        let in_list = GateCondition::parse("row['tag'] in ['a', 'b']").unwrap();
        assert_eq!(in_list.evaluate(&json!({ "tag": "b" })).unwrap(), json!(true));

        let not_in_string = GateCondition::parse("'z' not in row['name']").unwrap();
        assert_eq!(not_in_string.evaluate(&json!({ "name": "hello" })).unwrap(), json!(true));
    }

    #[test]
    fn rejects_oversized_expression_as_security_error() {
        let source = format!("row['{}']", "a".repeat(lexer::MAX_EXPRESSION_BYTES));
        let error = GateCondition::parse(source).unwrap_err();
        assert!(matches!(error, ExpressionError::Security { .. }));
    }
}
