//! Boolean guard evaluation over the execution variable scope.
//!
//! Supports equality and ordering comparisons between scalar literals and
//! `${path}` references (`${x} == "ok"`, `${count} > 0`), plus a bare
//! boolean reference. Anything else is a condition error.

use crate::error::{WorkflowError, WorkflowResult};
use crate::scope;
use serde_json::Value;
use std::collections::HashMap;

const OPERATORS: [(&str, CompareOp); 6] = [
    ("==", CompareOp::Eq),
    ("!=", CompareOp::Ne),
    (">=", CompareOp::Ge),
    ("<=", CompareOp::Le),
    (">", CompareOp::Gt),
    ("<", CompareOp::Lt),
];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum CompareOp {
    Eq,
    Ne,
    Gt,
    Lt,
    Ge,
    Le,
}

/// Evaluates a condition expression for a task.
pub fn evaluate(
    task_id: &str,
    expr: &str,
    variables: &HashMap<String, Value>,
) -> WorkflowResult<bool> {
    let expr = expr.trim();
    if expr.is_empty() {
        return Err(condition_error(task_id, "empty condition expression"));
    }

    if let Some((lhs, op, rhs)) = split_comparison(expr) {
        let left = parse_operand(task_id, lhs, variables)?;
        let right = parse_operand(task_id, rhs, variables)?;
        return compare(task_id, &left, op, &right);
    }

    // Bare reference: must resolve to a boolean.
    match parse_operand(task_id, expr, variables)? {
        Value::Bool(value) => Ok(value),
        other => Err(condition_error(
            task_id,
            format!("expression '{}' is not a boolean (got {})", expr, other),
        )),
    }
}

fn condition_error(task_id: &str, reason: impl Into<String>) -> WorkflowError {
    WorkflowError::Condition {
        task_id: task_id.to_string(),
        reason: reason.into(),
    }
}

/// Splits `lhs OP rhs` on the first operator occurring outside quotes.
fn split_comparison(expr: &str) -> Option<(&str, CompareOp, &str)> {
    let bytes = expr.as_bytes();
    let mut in_quote: Option<u8> = None;

    let mut index = 0;
    while index < bytes.len() {
        let byte = bytes[index];
        match in_quote {
            Some(quote) => {
                if byte == quote {
                    in_quote = None;
                }
            }
            None => {
                if byte == b'"' || byte == b'\'' {
                    in_quote = Some(byte);
                } else {
                    for (token, op) in OPERATORS {
                        if expr[index..].starts_with(token) {
                            let lhs = expr[..index].trim();
                            let rhs = expr[index + token.len()..].trim();
                            if lhs.is_empty() || rhs.is_empty() {
                                return None;
                            }
                            return Some((lhs, op, rhs));
                        }
                    }
                }
            }
        }
        index += 1;
    }

    None
}

fn parse_operand(
    task_id: &str,
    raw: &str,
    variables: &HashMap<String, Value>,
) -> WorkflowResult<Value> {
    let raw = raw.trim();

    if let Some(path) = raw.strip_prefix("${").and_then(|s| s.strip_suffix('}')) {
        return scope::resolve(variables, path).cloned().ok_or_else(|| {
            condition_error(task_id, format!("unresolved reference '${{{}}}'", path))
        });
    }

    if (raw.starts_with('"') && raw.ends_with('"') && raw.len() >= 2)
        || (raw.starts_with('\'') && raw.ends_with('\'') && raw.len() >= 2)
    {
        return Ok(Value::String(raw[1..raw.len() - 1].to_string()));
    }

    match raw {
        "true" => return Ok(Value::Bool(true)),
        "false" => return Ok(Value::Bool(false)),
        "null" => return Ok(Value::Null),
        _ => {}
    }

    if let Ok(int) = raw.parse::<i64>() {
        return Ok(Value::from(int));
    }
    if let Ok(float) = raw.parse::<f64>() {
        return Ok(Value::from(float));
    }

    Err(condition_error(
        task_id,
        format!("unparseable operand '{}'", raw),
    ))
}

fn compare(task_id: &str, left: &Value, op: CompareOp, right: &Value) -> WorkflowResult<bool> {
    match op {
        CompareOp::Eq => Ok(values_equal(left, right)),
        CompareOp::Ne => Ok(!values_equal(left, right)),
        _ => {
            let (a, b) = match (left.as_f64(), right.as_f64()) {
                (Some(a), Some(b)) => (a, b),
                _ => {
                    return Err(condition_error(
                        task_id,
                        format!("ordering comparison requires numbers, got {} and {}", left, right),
                    ));
                }
            };
            Ok(match op {
                CompareOp::Gt => a > b,
                CompareOp::Lt => a < b,
                CompareOp::Ge => a >= b,
                CompareOp::Le => a <= b,
                _ => unreachable!(),
            })
        }
    }
}

/// Equality with numeric coercion so `1 == 1.0` holds.
fn values_equal(left: &Value, right: &Value) -> bool {
    if let (Some(a), Some(b)) = (left.as_f64(), right.as_f64()) {
        return a == b;
    }
    left == right
}
