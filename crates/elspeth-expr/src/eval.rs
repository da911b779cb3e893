// crates/elspeth-expr/src/eval.rs
// ============================================================================
// Module: ELSPETH Expression Evaluator
// Description: Tree-walking evaluator over parsed gate condition expressions.
// ============================================================================

//! ## Overview
//! The evaluator never fails with a Rust panic: every runtime failure
//! (a missing key, an out-of-range index, a type mismatch, division by
//! zero) is surfaced as [`ExpressionError::Eval`], per the parse-time vs.
//! evaluate-time split described in [`crate::error`].

use serde_json::Value;
use serde_json::json;

use crate::ast::ArithOp;
use crate::ast::BoolOp;
use crate::ast::CompareOp;
use crate::ast::Expr;
use crate::error::ExpressionError;

/// Evaluates `expr` against `row`, returning the resulting JSON value.
///
/// # Errors
///
/// Returns [`ExpressionError::Eval`] if evaluation fails: a missing
/// field, an out-of-range index, a type mismatch, or division by zero.
pub fn evaluate(expr: &Expr, row: &Value) -> Result<Value, ExpressionError> {
    match expr {
        Expr::Row => Ok(row.clone()),
        Expr::Bool(value) => Ok(Value::Bool(*value)),
        Expr::NoneLit => Ok(Value::Null),
        Expr::Number(value) => Ok(json!(*value)),
        Expr::Str(value) => Ok(Value::String(value.clone())),
        Expr::List(items) | Expr::Tuple(items) => {
            let values =
                items.iter().map(|item| evaluate(item, row)).collect::<Result<Vec<_>, _>>()?;
            Ok(Value::Array(values))
        }
        Expr::Set(items) => {
            // JSON has no set type; represented as an array, de-duplicated
            // by canonical string form to approximate set semantics.
            let mut values = Vec::new();
            for item in items {
                let value = evaluate(item, row)?;
                if !values.contains(&value) {
                    values.push(value);
                }
            }
            Ok(Value::Array(values))
        }
        Expr::Dict(entries) => {
            let mut map = serde_json::Map::new();
            for (key_expr, value_expr) in entries {
                let key = dict_key_string(evaluate(key_expr, row)?)?;
                map.insert(key, evaluate(value_expr, row)?);
            }
            Ok(Value::Object(map))
        }
        Expr::Subscript { base, index } => {
            let base_value = evaluate(base, row)?;
            let index_value = evaluate(index, row)?;
            subscript(&base_value, &index_value)
        }
        Expr::Get { base, key, default } => {
            let base_value = evaluate(base, row)?;
            let key_value = evaluate(key, row)?;
            let fallback = match default {
                Some(expr) => evaluate(expr, row)?,
                None => Value::Null,
            };
            get_with_default(&base_value, &key_value, fallback)
        }
        Expr::UnaryPlus(inner) => {
            let value = evaluate(inner, row)?;
            Ok(json!(as_f64(&value)?))
        }
        Expr::UnaryMinus(inner) => {
            let value = evaluate(inner, row)?;
            Ok(json!(-as_f64(&value)?))
        }
        Expr::Not(inner) => Ok(Value::Bool(!truthy(&evaluate(inner, row)?))),
        Expr::Arith { op, left, right } => {
            let left_value = evaluate(left, row)?;
            let right_value = evaluate(right, row)?;
            arith(*op, &left_value, &right_value)
        }
        Expr::Compare { first, rest } => evaluate_chained_comparison(first, rest, row),
        Expr::BoolChain { op, operands } => evaluate_bool_chain(*op, operands, row),
        Expr::Ternary { cond, value_if, value_else } => {
            if truthy(&evaluate(cond, row)?) {
                evaluate(value_if, row)
            } else {
                evaluate(value_else, row)
            }
        }
    }
}

fn evaluate_bool_chain(op: BoolOp, operands: &[Expr], row: &Value) -> Result<Value, ExpressionError> {
    let mut last = Value::Bool(matches!(op, BoolOp::And));
    for operand in operands {
        last = evaluate(operand, row)?;
        let short_circuit = match op {
            BoolOp::And => !truthy(&last),
            BoolOp::Or => truthy(&last),
        };
        if short_circuit {
            return Ok(last);
        }
    }
    Ok(last)
}

fn evaluate_chained_comparison(
    first: &Expr,
    rest: &[(CompareOp, Expr)],
    row: &Value,
) -> Result<Value, ExpressionError> {
    let mut left = evaluate(first, row)?;
    for (op, right_expr) in rest {
        let right = evaluate(right_expr, row)?;
        if !compare(*op, &left, &right)? {
            return Ok(Value::Bool(false));
        }
        left = right;
    }
    Ok(Value::Bool(true))
}

/// Python-style truthiness: `None`, `false`, `0`, `""`, and empty
/// collections are falsy; everything else is truthy.
#[must_use]
pub fn truthy(value: &Value) -> bool {
    match value {
        Value::Null => false,
        Value::Bool(flag) => *flag,
        Value::Number(number) => number.as_f64().is_none_or(|value| value != 0.0),
        Value::String(text) => !text.is_empty(),
        Value::Array(items) => !items.is_empty(),
        Value::Object(map) => !map.is_empty(),
    }
}

fn as_f64(value: &Value) -> Result<f64, ExpressionError> {
    value
        .as_f64()
        .ok_or_else(|| ExpressionError::Eval(format!("expected a number, found {value}")))
}

fn dict_key_string(value: Value) -> Result<String, ExpressionError> {
    match value {
        Value::String(text) => Ok(text),
        other => Ok(other.to_string()),
    }
}

fn subscript(base: &Value, index: &Value) -> Result<Value, ExpressionError> {
    match base {
        Value::Array(items) => {
            let raw = as_f64(index)?;
            #[allow(
                clippy::cast_possible_truncation,
                reason = "array indices are bounds-checked immediately after truncation"
            )]
            let requested = raw as i64;
            let resolved = if requested < 0 {
                items.len().checked_sub(requested.unsigned_abs() as usize)
            } else {
                Some(requested as usize)
            };
            resolved
                .and_then(|position| items.get(position))
                .cloned()
                .ok_or_else(|| ExpressionError::Eval(format!("list index {requested} out of range")))
        }
        Value::Object(map) => {
            let key = dict_key_string(index.clone())?;
            map.get(&key)
                .cloned()
                .ok_or_else(|| ExpressionError::Eval(format!("key {key:?} not found")))
        }
        Value::String(text) => {
            let raw = as_f64(index)?;
            #[allow(
                clippy::cast_possible_truncation,
                reason = "string indices are bounds-checked immediately after truncation"
            )]
            let requested = raw as i64;
            let chars: Vec<char> = text.chars().collect();
            let resolved = if requested < 0 {
                chars.len().checked_sub(requested.unsigned_abs() as usize)
            } else {
                Some(requested as usize)
            };
            resolved
                .and_then(|position| chars.get(position))
                .map(|ch| Value::String(ch.to_string()))
                .ok_or_else(|| ExpressionError::Eval(format!("string index {requested} out of range")))
        }
        other => Err(ExpressionError::Eval(format!("{other} is not subscriptable"))),
    }
}

fn get_with_default(base: &Value, key: &Value, default: Value) -> Result<Value, ExpressionError> {
    match base {
        Value::Object(map) => {
            let key = dict_key_string(key.clone())?;
            Ok(map.get(&key).cloned().unwrap_or(default))
        }
        other => Err(ExpressionError::Eval(format!("{other} has no 'get' method"))),
    }
}

fn arith(op: ArithOp, left: &Value, right: &Value) -> Result<Value, ExpressionError> {
    if op == ArithOp::Add {
        if let (Value::String(left_text), Value::String(right_text)) = (left, right) {
            return Ok(Value::String(format!("{left_text}{right_text}")));
        }
    }
    let left_number = as_f64(left)?;
    let right_number = as_f64(right)?;
    let result = match op {
        ArithOp::Add => left_number + right_number,
        ArithOp::Sub => left_number - right_number,
        ArithOp::Mul => left_number * right_number,
        ArithOp::Div => {
            if right_number == 0.0 {
                return Err(ExpressionError::Eval("division by zero".to_string()));
            }
            left_number / right_number
        }
        ArithOp::FloorDiv => {
            if right_number == 0.0 {
                return Err(ExpressionError::Eval("division by zero".to_string()));
            }
            (left_number / right_number).floor()
        }
        ArithOp::Mod => {
            if right_number == 0.0 {
                return Err(ExpressionError::Eval("modulo by zero".to_string()));
            }
            left_number.rem_euclid(right_number)
        }
    };
    if !result.is_finite() {
        return Err(ExpressionError::Eval("arithmetic result is not a finite number".to_string()));
    }
    Ok(json!(result))
}

fn compare(op: CompareOp, left: &Value, right: &Value) -> Result<bool, ExpressionError> {
    match op {
        CompareOp::Eq => Ok(left == right),
        CompareOp::NotEq => Ok(left != right),
        CompareOp::Is => Ok(matches!(right, Value::Null) == matches!(left, Value::Null)),
        CompareOp::IsNot => Ok(matches!(right, Value::Null) != matches!(left, Value::Null)),
        CompareOp::Lt | CompareOp::LtEq | CompareOp::Gt | CompareOp::GtEq => {
            ordering_compare(op, left, right)
        }
        CompareOp::In => membership(left, right),
        CompareOp::NotIn => membership(left, right).map(|found| !found),
    }
}

fn ordering_compare(op: CompareOp, left: &Value, right: &Value) -> Result<bool, ExpressionError> {
    let ordering = match (left, right) {
        (Value::Number(_), Value::Number(_)) => {
            let left_number = as_f64(left)?;
            let right_number = as_f64(right)?;
            left_number.partial_cmp(&right_number)
        }
        (Value::String(left_text), Value::String(right_text)) => {
            Some(left_text.cmp(right_text))
        }
        _ => None,
    };
    let ordering = ordering.ok_or_else(|| {
        ExpressionError::Eval(format!("cannot order-compare {left} and {right}"))
    })?;
    Ok(match op {
        CompareOp::Lt => ordering.is_lt(),
        CompareOp::LtEq => ordering.is_le(),
        CompareOp::Gt => ordering.is_gt(),
        CompareOp::GtEq => ordering.is_ge(),
        _ => unreachable!("only ordering operators reach this branch"),
    })
}

fn membership(needle: &Value, haystack: &Value) -> Result<bool, ExpressionError> {
    match haystack {
        Value::Array(items) => Ok(items.contains(needle)),
        Value::Object(map) => {
            let key = dict_key_string(needle.clone())?;
            Ok(map.contains_key(&key))
        }
        Value::String(text) => match needle {
            Value::String(needle_text) => Ok(text.contains(needle_text.as_str())),
            other => Err(ExpressionError::Eval(format!(
                "'in' requires a string on the left of a string, found {other}"
            ))),
        },
        other => Err(ExpressionError::Eval(format!("argument of type '{other}' is not iterable"))),
    }
}
