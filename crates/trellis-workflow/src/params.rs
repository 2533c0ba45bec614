//! `${path}` parameter interpolation against the variable scope.
//!
//! Every string leaf of a task's parameter tree is scanned for `${path}`
//! tokens before dispatch. A string that is exactly one token substitutes
//! the resolved value with its type intact; embedded tokens stringify
//! scalars into the surrounding text. Unresolved tokens fail the task
//! without dispatch.

use crate::error::{WorkflowError, WorkflowResult};
use crate::scope;
use serde_json::Value;
use std::collections::HashMap;

/// Renders a task's parameter map against the scope.
pub fn render(
    task_id: &str,
    parameters: &HashMap<String, Value>,
    variables: &HashMap<String, Value>,
) -> WorkflowResult<HashMap<String, Value>> {
    parameters
        .iter()
        .map(|(key, value)| Ok((key.clone(), render_value(task_id, value, variables)?)))
        .collect()
}

fn render_value(
    task_id: &str,
    value: &Value,
    variables: &HashMap<String, Value>,
) -> WorkflowResult<Value> {
    match value {
        Value::String(text) => render_string(task_id, text, variables),
        Value::Object(map) => {
            let mut rendered = serde_json::Map::with_capacity(map.len());
            for (key, nested) in map {
                rendered.insert(key.clone(), render_value(task_id, nested, variables)?);
            }
            Ok(Value::Object(rendered))
        }
        Value::Array(items) => {
            let rendered: WorkflowResult<Vec<Value>> = items
                .iter()
                .map(|item| render_value(task_id, item, variables))
                .collect();
            Ok(Value::Array(rendered?))
        }
        other => Ok(other.clone()),
    }
}

fn render_string(
    task_id: &str,
    text: &str,
    variables: &HashMap<String, Value>,
) -> WorkflowResult<Value> {
    // Whole-token substitution keeps the resolved type (int, array, ...).
    if let Some(path) = whole_token(text) {
        return scope::resolve(variables, path)
            .cloned()
            .ok_or_else(|| unresolved(task_id, path));
    }

    let mut rendered = String::with_capacity(text.len());
    let mut rest = text;

    while let Some(start) = rest.find("${") {
        rendered.push_str(&rest[..start]);
        let after = &rest[start + 2..];
        let end = after.find('}').ok_or_else(|| WorkflowError::Parameter {
            task_id: task_id.to_string(),
            reason: format!("unterminated substitution in '{}'", text),
        })?;
        let path = &after[..end];
        let value = scope::resolve(variables, path).ok_or_else(|| unresolved(task_id, path))?;
        rendered.push_str(&stringify(value));
        rest = &after[end + 1..];
    }
    rendered.push_str(rest);

    Ok(Value::String(rendered))
}

/// Returns the path when the whole string is a single `${path}` token.
fn whole_token(text: &str) -> Option<&str> {
    let path = text.strip_prefix("${")?.strip_suffix('}')?;
    if path.contains("${") || path.contains('}') {
        return None;
    }
    Some(path)
}

fn stringify(value: &Value) -> String {
    match value {
        Value::String(text) => text.clone(),
        other => other.to_string(),
    }
}

fn unresolved(task_id: &str, path: &str) -> WorkflowError {
    WorkflowError::Parameter {
        task_id: task_id.to_string(),
        reason: format!("unresolved substitution '${{{}}}'", path),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn scope() -> HashMap<String, Value> {
        let mut variables = HashMap::new();
        variables.insert("limit".to_string(), json!(25));
        variables.insert("label".to_string(), json!("Person"));
        variables.insert("tasks.a".to_string(), json!({"nodes": [{"id": "n1"}]}));
        variables
    }

    fn parameters(pairs: &[(&str, Value)]) -> HashMap<String, Value> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.clone()))
            .collect()
    }

    #[test]
    fn test_embedded_substitution() {
        let rendered = render(
            "t",
            &parameters(&[(
                "cypher",
                json!("MATCH (n:${label}) RETURN n LIMIT ${limit}"),
            )]),
            &scope(),
        )
        .unwrap();

        assert_eq!(
            rendered["cypher"],
            json!("MATCH (n:Person) RETURN n LIMIT 25")
        );
    }

    #[test]
    fn test_whole_token_keeps_type() {
        let rendered = render(
            "t",
            &parameters(&[("limit", json!("${limit}")), ("nodes", json!("${tasks.a.nodes}"))]),
            &scope(),
        )
        .unwrap();

        assert_eq!(rendered["limit"], json!(25));
        assert_eq!(rendered["nodes"], json!([{"id": "n1"}]));
    }

    #[test]
    fn test_nested_structures_rendered() {
        let rendered = render(
            "t",
            &parameters(&[(
                "payload",
                json!({"filter": {"label": "${label}"}, "limits": ["${limit}"]}),
            )]),
            &scope(),
        )
        .unwrap();

        assert_eq!(
            rendered["payload"],
            json!({"filter": {"label": "Person"}, "limits": [25]})
        );
    }

    #[test]
    fn test_unresolved_token_fails() {
        let result = render(
            "t",
            &parameters(&[("text", json!("${tasks.a.missing}"))]),
            &scope(),
        );

        assert!(matches!(result, Err(WorkflowError::Parameter { .. })));
    }

    #[test]
    fn test_unterminated_token_fails() {
        let result = render("t", &parameters(&[("text", json!("${label"))]), &scope());
        assert!(matches!(result, Err(WorkflowError::Parameter { .. })));
    }

    #[test]
    fn test_plain_values_untouched() {
        let rendered = render(
            "t",
            &parameters(&[("operation", json!("traverse")), ("depth", json!(2))]),
            &scope(),
        )
        .unwrap();

        assert_eq!(rendered["operation"], json!("traverse"));
        assert_eq!(rendered["depth"], json!(2));
    }
}
