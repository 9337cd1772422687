use std::cmp::Ordering;

use serde_json::Value;
use tracing::debug;

use colony_core::{ColonyError, JsonMap, Result};

use crate::definition::{ConditionKind, WorkflowCondition};

/// JSON truthiness: null, false, 0, NaN and "" are false.
pub fn truthy(value: &Value) -> bool {
    match value {
        Value::Null => false,
        Value::Bool(b) => *b,
        Value::Number(n) => n.as_f64().is_some_and(|f| f != 0.0 && !f.is_nan()),
        Value::String(s) => !s.is_empty(),
        Value::Array(_) | Value::Object(_) => true,
    }
}

/// Look `field` up in the result bag. An exact top-level key wins;
/// otherwise the field is walked as a dotted path through objects and
/// array indices.
pub fn lookup_field<'a>(bag: &'a JsonMap, field: &str) -> Option<&'a Value> {
    if let Some(value) = bag.get(field) {
        return Some(value);
    }
    let mut parts = field.split('.');
    let mut current = bag.get(parts.next()?)?;
    for part in parts {
        current = match current {
            Value::Object(map) => map.get(part)?,
            Value::Array(items) => items.get(part.parse::<usize>().ok()?)?,
            _ => return None,
        };
    }
    Some(current)
}

fn loosely_equal(a: &Value, b: &Value) -> bool {
    match (a, b) {
        (Value::Number(x), Value::Number(y)) => x.as_f64() == y.as_f64(),
        _ => a == b,
    }
}

fn compare(a: &Value, b: &Value) -> Option<Ordering> {
    match (a, b) {
        (Value::Number(x), Value::Number(y)) => x.as_f64()?.partial_cmp(&y.as_f64()?),
        (Value::String(x), Value::String(y)) => Some(x.cmp(y)),
        _ => None,
    }
}

fn contains(haystack: &Value, needle: &Value) -> bool {
    match (haystack, needle) {
        (Value::String(s), Value::String(sub)) => s.contains(sub.as_str()),
        (Value::Array(items), _) => items.iter().any(|item| loosely_equal(item, needle)),
        _ => false,
    }
}

/// Evaluate `condition` against the workflow result bag.
pub async fn evaluate_condition(condition: &WorkflowCondition, bag: &JsonMap) -> Result<bool> {
    if let Some(evaluator) = &condition.evaluator {
        let value = evaluator.evaluate(bag).await.map_err(|e| match e {
            ColonyError::Condition(_) => e,
            other => ColonyError::Condition(format!("condition evaluation failed: {other}")),
        })?;
        return Ok(truthy(&value));
    }

    let actual = lookup_field(bag, &condition.field);
    let expected = &condition.value;
    let outcome = match condition.kind {
        ConditionKind::Custom => {
            return Err(ColonyError::Condition(
                "custom condition has no evaluator".into(),
            ))
        }
        ConditionKind::Exists => actual.is_some_and(|v| !v.is_null()),
        ConditionKind::Equals => actual.is_some_and(|v| loosely_equal(v, expected)),
        ConditionKind::Contains => actual.is_some_and(|v| contains(v, expected)),
        ConditionKind::Greater => {
            actual.and_then(|v| compare(v, expected)) == Some(Ordering::Greater)
        }
        ConditionKind::Less => actual.and_then(|v| compare(v, expected)) == Some(Ordering::Less),
    };
    debug!(field = %condition.field, kind = ?condition.kind, outcome, "Condition evaluated");
    Ok(outcome)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn bag(value: Value) -> JsonMap {
        match value {
            Value::Object(map) => map,
            _ => unreachable!(),
        }
    }

    async fn check(kind: ConditionKind, field: &str, value: Value, data: &JsonMap) -> bool {
        evaluate_condition(&WorkflowCondition::new(kind, field, value), data)
            .await
            .unwrap()
    }

    #[test]
    fn truthiness() {
        assert!(!truthy(&Value::Null));
        assert!(!truthy(&json!(0)));
        assert!(!truthy(&json!("")));
        assert!(truthy(&json!("no")));
        assert!(truthy(&json!(-1.5)));
        assert!(truthy(&json!([])));
    }

    #[test]
    fn dotted_lookup() {
        let data = bag(json!({
            "fetch": {"rows": [{"id": 7}], "count": 1},
            "a.b": "literal"
        }));
        assert_eq!(lookup_field(&data, "fetch.count"), Some(&json!(1)));
        assert_eq!(lookup_field(&data, "fetch.rows.0.id"), Some(&json!(7)));
        assert_eq!(lookup_field(&data, "a.b"), Some(&json!("literal")));
        assert_eq!(lookup_field(&data, "fetch.missing"), None);
        assert_eq!(lookup_field(&data, "fetch.count.deeper"), None);
    }

    #[tokio::test]
    async fn structural_kinds() {
        let data = bag(json!({
            "status": "ok",
            "score": 4,
            "ratio": 0.5,
            "tags": ["urgent", 3],
            "log": "disk almost full",
            "empty": null
        }));
        assert!(check(ConditionKind::Equals, "status", json!("ok"), &data).await);
        assert!(check(ConditionKind::Equals, "score", json!(4.0), &data).await);
        assert!(!check(ConditionKind::Equals, "score", json!("4"), &data).await);
        assert!(check(ConditionKind::Contains, "log", json!("full"), &data).await);
        assert!(check(ConditionKind::Contains, "tags", json!("urgent"), &data).await);
        assert!(check(ConditionKind::Contains, "tags", json!(3.0), &data).await);
        assert!(!check(ConditionKind::Contains, "score", json!(4), &data).await);
        assert!(check(ConditionKind::Greater, "score", json!(3), &data).await);
        assert!(!check(ConditionKind::Greater, "score", json!(4), &data).await);
        assert!(check(ConditionKind::Less, "ratio", json!(1), &data).await);
        assert!(!check(ConditionKind::Less, "status", json!(1), &data).await);
        assert!(check(ConditionKind::Exists, "status", Value::Null, &data).await);
        assert!(!check(ConditionKind::Exists, "empty", Value::Null, &data).await);
        assert!(!check(ConditionKind::Exists, "absent", Value::Null, &data).await);
    }

    #[tokio::test]
    async fn custom_without_evaluator_is_condition_error() {
        let cond = WorkflowCondition::new(ConditionKind::Custom, "x", Value::Null);
        let err = evaluate_condition(&cond, &JsonMap::new()).await.unwrap_err();
        assert_eq!(err.kind(), "condition_error");
    }

    #[tokio::test]
    async fn custom_evaluator_result_is_coerced() {
        let cond = WorkflowCondition::custom(|bag: &JsonMap| {
            Ok::<_, ColonyError>(bag.get("count").cloned().unwrap_or(Value::Null))
        });
        assert!(evaluate_condition(&cond, &bag(json!({"count": 2}))).await.unwrap());
        assert!(!evaluate_condition(&cond, &bag(json!({"count": 0}))).await.unwrap());

        let failing = WorkflowCondition::custom(|_: &JsonMap| {
            Err::<Value, _>(ColonyError::Agent("lost".into()))
        });
        let err = evaluate_condition(&failing, &JsonMap::new()).await.unwrap_err();
        assert_eq!(err.kind(), "condition_error");
    }
}
