// crates/elspeth-expr/tests/evaluator.rs
// ============================================================================
// Integration tests: gate condition parsing and evaluation.
// ============================================================================

#![allow(
    clippy::panic,
    clippy::unwrap_used,
    clippy::expect_used,
    reason = "Test-only panic-based assertions are permitted."
)]

use elspeth_expr::ExpressionError;
use elspeth_expr::GateCondition;
use proptest::prelude::*;
use serde_json::json;

#[test]
fn nested_row_access_and_boolean_combinators() {
    let condition = GateCondition::parse(
        "row['user']['tier'] == 'gold' and (row['amount'] > 100 or row.get('override', False))",
    )
    .expect("valid expression");

    let gold_big_spender = json!({ "user": { "tier": "gold" }, "amount": 500 });
    assert!(condition.evaluate_truthy(&gold_big_spender).expect("evaluates"));

    let gold_small_with_override =
        json!({ "user": { "tier": "gold" }, "amount": 1, "override": true });
    assert!(condition.evaluate_truthy(&gold_small_with_override).expect("evaluates"));

    let silver = json!({ "user": { "tier": "silver" }, "amount": 1000 });
    assert!(!condition.evaluate_truthy(&silver).expect("evaluates"));
}

#[test]
fn list_and_dict_literals_are_constructible() {
    let condition = GateCondition::parse("row['value'] in [1, 2, 3]").expect("valid expression");
    assert!(condition.evaluate_truthy(&json!({ "value": 2 })).expect("evaluates"));
    assert!(!condition.evaluate_truthy(&json!({ "value": 9 })).expect("evaluates"));
}

#[test]
fn security_errors_never_leak_from_a_successfully_parsed_condition() {
    let condition = GateCondition::parse("row['a'] == row['b']").expect("valid expression");
    // Any failure against a malformed row must be an Eval error, never
    // Security or Syntax: those only occur during parse.
    let error = condition.evaluate(&json!({ "a": 1 })).expect_err("missing key");
    assert!(matches!(error, ExpressionError::Eval(_)));
    assert!(!error.is_parse_time());
}

#[test]
fn unterminated_string_is_a_syntax_error_not_a_panic() {
    let error = GateCondition::parse("row['a'] == 'unterminated").expect_err("malformed");
    assert!(matches!(error, ExpressionError::Syntax { .. }));
}

#[test]
fn comprehension_like_syntax_is_rejected() {
    let error =
        GateCondition::parse("[x for x in row['items']]").expect_err("comprehensions banned");
    assert!(matches!(error, ExpressionError::Syntax { .. } | ExpressionError::Security { .. }));
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(256))]

    #[test]
    fn arithmetic_never_panics_on_arbitrary_finite_operands(a in -1_000_000.0f64..1_000_000.0, b in -1_000_000.0f64..1_000_000.0) {
        let condition = GateCondition::parse("row['a'] + row['b'] - row['a'] * row['b']")
            .expect("valid expression");
        let row = json!({ "a": a, "b": b });
        // Only property under test: evaluation completes without panicking,
        // returning either a finite result or a well-formed Eval error.
        let _ = condition.evaluate(&row);
    }

    #[test]
    fn chained_comparison_matches_pairwise_conjunction(a in -100i64..100, b in -100i64..100, c in -100i64..100) {
        let chained = GateCondition::parse("row['a'] < row['b'] < row['c']").expect("valid expression");
        let row = json!({ "a": a, "b": b, "c": c });
        let chained_result = chained.evaluate_truthy(&row).expect("evaluates");
        let expected = a < b && b < c;
        prop_assert_eq!(chained_result, expected);
    }
}
