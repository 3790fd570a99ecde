//! Condition evaluator.
//!
//! A condition is a JSON expression tree: every operator node is a single-key
//! object `{"op": args}`, where `args` is an array or a single value. Anything
//! else is a literal. Evaluation is pure: the only input is the data context.
//!
//! `evaluate` is fail-closed. Unknown operators, wrong arity, non-numeric
//! comparisons and ill-formed trees all yield `false`.

use serde_json::{Map, Number, Value};
use thiserror::Error;
use tracing::warn;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum ConditionError {
    #[error("unknown operator: {0}")]
    UnknownOperator(String),

    #[error("operator '{op}' expects {expected} argument(s), got {got}")]
    Arity {
        op: String,
        expected: &'static str,
        got: usize,
    },

    #[error("operator '{op}' needs a number, got {value}")]
    NotANumber { op: String, value: Value },

    #[error("malformed condition: {0}")]
    Malformed(String),
}

type Result<T> = std::result::Result<T, ConditionError>;

const OPERATORS: &[&str] = &[
    "var",
    "==",
    "!=",
    "===",
    "!==",
    "<",
    "<=",
    ">",
    ">=",
    "and",
    "or",
    "!",
    "!!",
    "if",
    "in",
    "missing",
    "missing_some",
];

/// Evaluate `condition` against `data`. Never fails: any error is logged and
/// treated as "no match".
pub fn evaluate(condition: &Value, data: &Value) -> bool {
    match try_evaluate(condition, data) {
        Ok(matched) => matched,
        Err(e) => {
            warn!(error = %e, "Condition evaluation failed, treating as no match");
            false
        }
    }
}

/// Evaluate and coerce the result to a boolean, surfacing errors.
pub fn try_evaluate(condition: &Value, data: &Value) -> Result<bool> {
    apply(condition, data).map(|v| truthy(&v))
}

/// Static check: known operators and fixed arities, recursively.
pub fn validate(condition: &Value) -> Result<()> {
    match condition {
        Value::Object(map) => {
            let (op, raw) = operator(map)?;
            if !OPERATORS.contains(&op) {
                return Err(ConditionError::UnknownOperator(op.to_string()));
            }
            let args = arguments(raw);
            check_arity(op, args.len())?;
            args.iter().try_for_each(|a| validate(a))
        }
        Value::Array(items) => items.iter().try_for_each(validate),
        _ => Ok(()),
    }
}

fn apply(expr: &Value, data: &Value) -> Result<Value> {
    match expr {
        Value::Object(map) => {
            let (op, raw) = operator(map)?;
            let args = arguments(raw);
            apply_operator(op, &args, data)
        }
        Value::Array(items) => items
            .iter()
            .map(|item| apply(item, data))
            .collect::<Result<Vec<_>>>()
            .map(Value::Array),
        literal => Ok(literal.clone()),
    }
}

fn operator(map: &Map<String, Value>) -> Result<(&str, &Value)> {
    let mut entries = map.iter();
    match (entries.next(), entries.next()) {
        (Some((op, args)), None) => Ok((op.as_str(), args)),
        _ => Err(ConditionError::Malformed(format!(
            "operator node must have exactly one key, found {}",
            map.len()
        ))),
    }
}

fn arguments(raw: &Value) -> Vec<&Value> {
    match raw {
        Value::Array(items) => items.iter().collect(),
        single => vec![single],
    }
}

fn check_arity(op: &str, got: usize) -> Result<()> {
    let (ok, expected) = match op {
        "==" | "!=" | "===" | "!==" | ">" | ">=" | "in" => (got == 2, "2"),
        "<" | "<=" => (got == 2 || got == 3, "2 or 3"),
        "!" | "!!" => (got == 1, "1"),
        "var" => (got <= 2, "0 to 2"),
        "and" | "or" => (got >= 1, "at least 1"),
        "missing_some" => (got == 2, "2"),
        _ => (true, ""),
    };
    if ok {
        Ok(())
    } else {
        Err(ConditionError::Arity {
            op: op.to_string(),
            expected,
            got,
        })
    }
}

fn apply_operator(op: &str, args: &[&Value], data: &Value) -> Result<Value> {
    if !OPERATORS.contains(&op) {
        return Err(ConditionError::UnknownOperator(op.to_string()));
    }
    check_arity(op, args.len())?;

    // Short-circuiting operators evaluate their own arguments.
    match op {
        "and" => {
            let mut last = Value::Bool(true);
            for arg in args {
                last = apply(arg, data)?;
                if !truthy(&last) {
                    break;
                }
            }
            return Ok(last);
        }
        "or" => {
            let mut last = Value::Bool(false);
            for arg in args {
                last = apply(arg, data)?;
                if truthy(&last) {
                    break;
                }
            }
            return Ok(last);
        }
        "if" => {
            let mut rest = args;
            while rest.len() >= 2 {
                if truthy(&apply(rest[0], data)?) {
                    return apply(rest[1], data);
                }
                rest = &rest[2..];
            }
            return match rest.first() {
                Some(otherwise) => apply(otherwise, data),
                None => Ok(Value::Null),
            };
        }
        _ => {}
    }

    let values = args
        .iter()
        .map(|a| apply(a, data))
        .collect::<Result<Vec<_>>>()?;

    let result = match op {
        "var" => var(&values, data),
        "==" => Value::Bool(loose_eq(&values[0], &values[1])),
        "!=" => Value::Bool(!loose_eq(&values[0], &values[1])),
        "===" => Value::Bool(strict_eq(&values[0], &values[1])),
        "!==" => Value::Bool(!strict_eq(&values[0], &values[1])),
        "<" | "<=" | ">" | ">=" => Value::Bool(compare(op, &values)?),
        "!" => Value::Bool(!truthy(&values[0])),
        "!!" => Value::Bool(truthy(&values[0])),
        "in" => Value::Bool(contains(&values[1], &values[0])),
        "missing" => missing(&values, data),
        "missing_some" => missing_some(&values, data)?,
        other => return Err(ConditionError::UnknownOperator(other.to_string())),
    };
    Ok(result)
}

// ---------------------------------------------------------------------------
// Variables
// ---------------------------------------------------------------------------

fn var(values: &[Value], data: &Value) -> Value {
    let default = values.get(1).cloned().unwrap_or(Value::Null);
    let path = match values.first() {
        None | Some(Value::Null) => return data.clone(),
        Some(Value::String(s)) if s.is_empty() => return data.clone(),
        Some(Value::String(s)) => s.clone(),
        Some(Value::Number(n)) => n.to_string(),
        Some(_) => return default,
    };
    lookup(data, &path).cloned().unwrap_or(default)
}

/// Resolve a dotted path through nested objects and array indices.
fn lookup<'a>(data: &'a Value, path: &str) -> Option<&'a Value> {
    path.split('.').try_fold(data, |node, segment| match node {
        Value::Object(map) => map.get(segment),
        Value::Array(items) => segment.parse::<usize>().ok().and_then(|i| items.get(i)),
        _ => None,
    })
}

fn is_absent(data: &Value, key: &Value) -> bool {
    let path = match key {
        Value::String(s) => s.clone(),
        Value::Number(n) => n.to_string(),
        _ => return true,
    };
    match lookup(data, &path) {
        None | Some(Value::Null) => true,
        Some(Value::String(s)) => s.is_empty(),
        Some(_) => false,
    }
}

fn missing(values: &[Value], data: &Value) -> Value {
    // A single array argument is the key list.
    let keys: Vec<&Value> = match values {
        [Value::Array(items)] => items.iter().collect(),
        _ => values.iter().collect(),
    };
    Value::Array(
        keys.into_iter()
            .filter(|k| is_absent(data, k))
            .cloned()
            .collect(),
    )
}

fn missing_some(values: &[Value], data: &Value) -> Result<Value> {
    let need = as_number("missing_some", &values[0])?;
    let Value::Array(keys) = &values[1] else {
        return Err(ConditionError::Malformed(
            "missing_some expects [min_required, [keys]]".into(),
        ));
    };
    let absent: Vec<Value> = keys.iter().filter(|k| is_absent(data, k)).cloned().collect();
    let present = (keys.len() - absent.len()) as f64;
    if present >= need {
        Ok(Value::Array(Vec::new()))
    } else {
        Ok(Value::Array(absent))
    }
}

// ---------------------------------------------------------------------------
// Comparison
// ---------------------------------------------------------------------------

fn as_number(op: &str, value: &Value) -> Result<f64> {
    let n = match value {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.trim().parse::<f64>().ok(),
        _ => None,
    };
    n.ok_or_else(|| ConditionError::NotANumber {
        op: op.to_string(),
        value: value.clone(),
    })
}

fn compare(op: &str, values: &[Value]) -> Result<bool> {
    let nums = values
        .iter()
        .map(|v| as_number(op, v))
        .collect::<Result<Vec<f64>>>()?;
    let holds = |a: f64, b: f64| match op {
        "<" => a < b,
        "<=" => a <= b,
        ">" => a > b,
        _ => a >= b,
    };
    Ok(nums.windows(2).all(|pair| holds(pair[0], pair[1])))
}

fn number_eq(a: &Number, b: &Number) -> bool {
    match (a.as_f64(), b.as_f64()) {
        (Some(x), Some(y)) => x == y,
        _ => a == b,
    }
}

fn strict_eq(a: &Value, b: &Value) -> bool {
    match (a, b) {
        (Value::Number(x), Value::Number(y)) => number_eq(x, y),
        _ => a == b,
    }
}

/// Equality with numeric coercion of strings and booleans.
fn loose_eq(a: &Value, b: &Value) -> bool {
    match (a, b) {
        (Value::Null, Value::Null) => true,
        (Value::Null, _) | (_, Value::Null) => false,
        (Value::Number(x), Value::Number(y)) => number_eq(x, y),
        (Value::Number(_), Value::String(_) | Value::Bool(_))
        | (Value::String(_) | Value::Bool(_), Value::Number(_)) => {
            match (coerce(a), coerce(b)) {
                (Some(x), Some(y)) => x == y,
                _ => false,
            }
        }
        _ => a == b,
    }
}

fn coerce(value: &Value) -> Option<f64> {
    match value {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.trim().parse().ok(),
        Value::Bool(b) => Some(if *b { 1.0 } else { 0.0 }),
        _ => None,
    }
}

fn contains(haystack: &Value, needle: &Value) -> bool {
    match (haystack, needle) {
        (Value::Array(items), _) => items.iter().any(|item| strict_eq(item, needle)),
        (Value::String(s), Value::String(sub)) => s.contains(sub.as_str()),
        _ => false,
    }
}

fn truthy(value: &Value) -> bool {
    match value {
        Value::Null => false,
        Value::Bool(b) => *b,
        Value::Number(n) => n.as_f64().is_some_and(|f| f != 0.0),
        Value::String(s) => !s.is_empty(),
        Value::Array(items) => !items.is_empty(),
        Value::Object(_) => true,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn object() -> Value {
        json!({
            "status": "active",
            "priority": 7,
            "estimate": "12",
            "owner": {"name": "ana", "team": {"id": "t-1"}},
            "tags": ["urgent", "billing"],
            "title": "Renewal for ACME",
            "archived": null
        })
    }

    #[test]
    fn equality_on_payload_field() {
        let cond = json!({"==": [{"var": "status"}, "active"]});
        assert!(evaluate(&cond, &object()));
        assert!(!evaluate(&cond, &json!({"status": "draft"})));
    }

    #[test]
    fn dotted_paths_and_array_indices() {
        assert!(evaluate(&json!({"==": [{"var": "owner.team.id"}, "t-1"]}), &object()));
        assert!(evaluate(&json!({"==": [{"var": "tags.1"}, "billing"]}), &object()));
        assert!(!evaluate(&json!({"==": [{"var": "owner.missing.id"}, "t-1"]}), &object()));
    }

    #[test]
    fn var_default_applies_to_missing_path() {
        let cond = json!({"==": [{"var": ["region", "emea"]}, "emea"]});
        assert!(evaluate(&cond, &object()));
    }

    #[test]
    fn loose_equality_coerces_numeric_strings() {
        assert!(evaluate(&json!({"==": [{"var": "estimate"}, 12]}), &object()));
        assert!(!evaluate(&json!({"===": [{"var": "estimate"}, 12]}), &object()));
        assert!(evaluate(&json!({"===": [{"var": "priority"}, 7.0]}), &object()));
        assert!(evaluate(&json!({"!=": [{"var": "status"}, "closed"]}), &object()));
    }

    #[test]
    fn numeric_comparisons_and_between() {
        assert!(evaluate(&json!({">": [{"var": "priority"}, 5]}), &object()));
        assert!(evaluate(&json!({">=": [{"var": "estimate"}, 12]}), &object()));
        assert!(evaluate(&json!({"<": [1, {"var": "priority"}, 10]}), &object()));
        assert!(!evaluate(&json!({"<": [1, {"var": "priority"}, 7]}), &object()));
        assert!(evaluate(&json!({"<=": [1, {"var": "priority"}, 7]}), &object()));
    }

    #[test]
    fn comparing_missing_value_numerically_fails_closed() {
        let cond = json!({">": [{"var": "budget"}, 100]});
        assert!(!evaluate(&cond, &object()));
        assert!(matches!(
            try_evaluate(&cond, &object()),
            Err(ConditionError::NotANumber { .. })
        ));
    }

    #[test]
    fn logic_operators() {
        let cond = json!({"and": [
            {"==": [{"var": "status"}, "active"]},
            {"or": [{">": [{"var": "priority"}, 9]}, {"in": ["urgent", {"var": "tags"}]}]}
        ]});
        assert!(evaluate(&cond, &object()));
        assert!(evaluate(&json!({"!": {"var": "archived"}}), &object()));
        assert!(evaluate(&json!({"!!": {"var": "title"}}), &object()));
    }

    #[test]
    fn and_short_circuits_before_bad_branch() {
        let cond = json!({"and": [false, {"bogus": [1]}]});
        assert_eq!(try_evaluate(&cond, &object()), Ok(false));
    }

    #[test]
    fn in_checks_substring() {
        assert!(evaluate(&json!({"in": ["ACME", {"var": "title"}]}), &object()));
        assert!(!evaluate(&json!({"in": ["Globex", {"var": "title"}]}), &object()));
    }

    #[test]
    fn if_chains_pick_first_truthy_branch() {
        let cond = json!({"if": [
            {"==": [{"var": "status"}, "draft"]}, false,
            {">": [{"var": "priority"}, 5]}, true,
            false
        ]});
        assert!(evaluate(&cond, &object()));
    }

    #[test]
    fn missing_and_missing_some() {
        assert_eq!(
            apply(&json!({"missing": ["status", "budget", "archived"]}), &object()).unwrap(),
            json!(["budget", "archived"])
        );
        assert!(evaluate(&json!({"!": {"missing": ["status", "owner.name"]}}), &object()));
        assert_eq!(
            apply(&json!({"missing_some": [1, ["budget", "status"]]}), &object()).unwrap(),
            json!([])
        );
        assert_eq!(
            apply(&json!({"missing_some": [2, ["budget", "status"]]}), &object()).unwrap(),
            json!(["budget"])
        );
    }

    #[test]
    fn unknown_operator_is_false() {
        let cond = json!({"regex": [{"var": "status"}, "^act"]});
        assert!(!evaluate(&cond, &object()));
        assert_eq!(
            try_evaluate(&cond, &object()),
            Err(ConditionError::UnknownOperator("regex".into()))
        );
    }

    #[test]
    fn malformed_trees_are_false() {
        assert!(!evaluate(&json!({"==": [1, 1], "!=": [1, 2]}), &object()));
        assert!(!evaluate(&json!({"==": [{"var": "status"}]}), &object()));
        assert!(!evaluate(&json!({}), &object()));
    }

    #[test]
    fn literals_use_truthiness() {
        assert!(evaluate(&json!(true), &object()));
        assert!(!evaluate(&json!(0), &object()));
        assert!(!evaluate(&Value::Null, &object()));
    }

    #[test]
    fn validate_reports_static_problems() {
        assert!(validate(&json!({"and": [{"==": [{"var": "a"}, 1]}, {"!": {"var": "b"}}]})).is_ok());
        assert!(matches!(
            validate(&json!({"and": [{"~=": [1, 2]}]})),
            Err(ConditionError::UnknownOperator(_))
        ));
        assert!(matches!(
            validate(&json!({">": [1, 2, 3]})),
            Err(ConditionError::Arity { .. })
        ));
    }
}
