//! Dotted-path variable scope shared across a workflow execution.
//!
//! The scope is a flat mapping keyed by dotted path: task outputs are
//! written once under `tasks.<id>` on success, and lookups walk nested
//! objects so `tasks.<id>.<key>` resolves without wiring object graphs.

use serde_json::Value;
use std::collections::HashMap;

/// Resolves a dotted path against the scope.
///
/// The longest matching flat key wins; remaining segments are walked into
/// nested objects. `tasks.a.nodes` first tries the literal key, then
/// `tasks.a` with a walk into `nodes`.
pub fn resolve<'a>(variables: &'a HashMap<String, Value>, path: &str) -> Option<&'a Value> {
    if let Some(value) = variables.get(path) {
        return Some(value);
    }

    let segments: Vec<&str> = path.split('.').collect();
    for split in (1..segments.len()).rev() {
        let prefix = segments[..split].join(".");
        if let Some(root) = variables.get(&prefix) {
            return walk(root, &segments[split..]);
        }
    }

    None
}

fn walk<'a>(mut value: &'a Value, segments: &[&str]) -> Option<&'a Value> {
    for segment in segments {
        match value {
            Value::Object(map) => value = map.get(*segment)?,
            Value::Array(items) => {
                let index: usize = segment.parse().ok()?;
                value = items.get(index)?;
            }
            _ => return None,
        }
    }
    Some(value)
}

/// Binds a task's output under `tasks.<id>`.
pub fn bind_task_output(
    variables: &mut HashMap<String, Value>,
    task_id: &str,
    output: &HashMap<String, Value>,
) {
    let object: serde_json::Map<String, Value> = output
        .iter()
        .map(|(k, v)| (k.clone(), v.clone()))
        .collect();
    variables.insert(format!("tasks.{}", task_id), Value::Object(object));
}

/// Copies selected output keys into top-level variables.
///
/// `aliases` maps variable names to output keys; aliases naming a missing
/// output key are ignored with a debug log.
pub fn apply_aliases(
    variables: &mut HashMap<String, Value>,
    aliases: &HashMap<String, String>,
    output: &HashMap<String, Value>,
) {
    for (variable, output_key) in aliases {
        match output.get(output_key) {
            Some(value) => {
                variables.insert(variable.clone(), value.clone());
            }
            None => {
                tracing::debug!(
                    "Alias '{}' names missing output key '{}'",
                    variable,
                    output_key
                );
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn scope() -> HashMap<String, Value> {
        let mut variables = HashMap::new();
        variables.insert("query".to_string(), json!("match all"));
        variables.insert(
            "tasks.a".to_string(),
            json!({"nodes": [{"id": "n1"}], "count": 1}),
        );
        variables
    }

    #[test]
    fn test_resolve_flat_key() {
        let variables = scope();
        assert_eq!(resolve(&variables, "query"), Some(&json!("match all")));
    }

    #[test]
    fn test_resolve_task_output_path() {
        let variables = scope();
        assert_eq!(resolve(&variables, "tasks.a.count"), Some(&json!(1)));
        assert_eq!(
            resolve(&variables, "tasks.a.nodes.0.id"),
            Some(&json!("n1"))
        );
    }

    #[test]
    fn test_resolve_missing_path() {
        let variables = scope();
        assert_eq!(resolve(&variables, "tasks.a.missing"), None);
        assert_eq!(resolve(&variables, "tasks.b.anything"), None);
    }

    #[test]
    fn test_bind_and_alias() {
        let mut variables = HashMap::new();
        let mut output = HashMap::new();
        output.insert("summary".to_string(), json!("one node"));

        bind_task_output(&mut variables, "b", &output);
        let mut aliases = HashMap::new();
        aliases.insert("report".to_string(), "summary".to_string());
        aliases.insert("ghost".to_string(), "missing".to_string());
        apply_aliases(&mut variables, &aliases, &output);

        assert_eq!(
            resolve(&variables, "tasks.b.summary"),
            Some(&json!("one node"))
        );
        assert_eq!(resolve(&variables, "report"), Some(&json!("one node")));
        assert_eq!(resolve(&variables, "ghost"), None);
    }
}
