//! Workflow template store: on-disk documents rendered into definitions.

use crate::definition::WorkflowDefinition;
use crate::error::{WorkflowError, WorkflowResult};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Declared type of a template variable.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum VariableType {
    String,
    Int,
    Bool,
    Array,
    Object,
}

impl VariableType {
    /// Checks a value against the declared type.
    pub fn matches(&self, value: &Value) -> bool {
        match self {
            VariableType::String => value.is_string(),
            VariableType::Int => value.is_i64() || value.is_u64(),
            VariableType::Bool => value.is_boolean(),
            VariableType::Array => value.is_array(),
            VariableType::Object => value.is_object(),
        }
    }

    /// Wire name of the type.
    pub fn as_str(&self) -> &'static str {
        match self {
            VariableType::String => "string",
            VariableType::Int => "int",
            VariableType::Bool => "bool",
            VariableType::Array => "array",
            VariableType::Object => "object",
        }
    }
}

/// Schema entry for one template variable.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TemplateVariable {
    /// Variable name.
    pub name: String,

    /// Declared type.
    #[serde(rename = "type")]
    pub var_type: VariableType,

    /// Whether a value (or default) must be present.
    #[serde(default)]
    pub required: bool,

    /// Default value used when the caller supplies none.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub default: Option<Value>,

    /// Enumerated allowed values.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub options: Option<Vec<Value>>,
}

impl TemplateVariable {
    /// Validates a supplied value against the schema entry.
    pub fn validate(&self, value: &Value) -> WorkflowResult<()> {
        if !self.var_type.matches(value) {
            return Err(WorkflowError::TemplateRender(format!(
                "Variable '{}' expects type {}",
                self.name,
                self.var_type.as_str()
            )));
        }

        if let Some(options) = &self.options {
            if !options.contains(value) {
                return Err(WorkflowError::TemplateRender(format!(
                    "Variable '{}' value is not among the declared options",
                    self.name
                )));
            }
        }

        Ok(())
    }
}

/// On-disk template document: a workflow definition plus the declared
/// variable schema used to render it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkflowTemplate {
    /// Template identifier.
    pub id: String,

    /// Human-readable name.
    pub name: String,

    /// Description shown in listings.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,

    /// Listing category.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub category: Option<String>,

    /// Template version.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub version: Option<String>,

    /// Declared variable schema.
    #[serde(default)]
    pub variables: Vec<TemplateVariable>,

    /// The embedded workflow definition.
    pub workflow: WorkflowDefinition,
}

impl WorkflowTemplate {
    /// Renders a concrete definition from the template and caller
    /// variables.
    ///
    /// Fails when a required variable is absent without a default, a
    /// value's type does not match its declaration, or a value falls
    /// outside the declared options. Defaults are merged under the caller
    /// values (caller wins).
    pub fn render(&self, user_vars: &HashMap<String, Value>) -> WorkflowResult<WorkflowDefinition> {
        for variable in &self.variables {
            match user_vars.get(&variable.name) {
                Some(value) => variable.validate(value)?,
                None if variable.required && variable.default.is_none() => {
                    return Err(WorkflowError::TemplateRender(format!(
                        "Required variable '{}' is missing",
                        variable.name
                    )));
                }
                None => {}
            }
        }

        let mut definition = self.workflow.clone();
        for variable in &self.variables {
            if let Some(default) = &variable.default {
                definition
                    .variables
                    .entry(variable.name.clone())
                    .or_insert_with(|| default.clone());
            }
        }
        for (name, value) in user_vars {
            definition.variables.insert(name.clone(), value.clone());
        }

        Ok(definition)
    }
}

/// Store of templates loaded from a configured directory.
///
/// The cache is read-mostly; reloads replace it atomically.
pub struct TemplateStore {
    dir: PathBuf,
    cache: RwLock<HashMap<String, Arc<WorkflowTemplate>>>,
}

impl TemplateStore {
    /// Opens the store, loading every template in the directory.
    pub fn open(dir: impl Into<PathBuf>) -> WorkflowResult<Self> {
        let store = Self {
            dir: dir.into(),
            cache: RwLock::new(HashMap::new()),
        };
        let loaded = store.reload()?;
        info!(
            "Template store loaded {} templates from {}",
            loaded,
            store.dir.display()
        );
        Ok(store)
    }

    /// Rescans the directory, replacing the cache atomically.
    pub fn reload(&self) -> WorkflowResult<usize> {
        let entries = std::fs::read_dir(&self.dir).map_err(|err| {
            WorkflowError::TemplateStore(format!(
                "Cannot read template directory {}: {}",
                self.dir.display(),
                err
            ))
        })?;

        let mut loaded: HashMap<String, Arc<WorkflowTemplate>> = HashMap::new();
        for entry in entries {
            let entry = entry.map_err(|err| WorkflowError::TemplateStore(err.to_string()))?;
            let path = entry.path();
            if !is_template_file(&path) {
                continue;
            }

            match Self::load_file(&path) {
                Ok(template) => {
                    debug!("Loaded template '{}' from {}", template.id, path.display());
                    if let Some(previous) = loaded.insert(template.id.clone(), Arc::new(template)) {
                        return Err(WorkflowError::InvalidDefinition(format!(
                            "Duplicate template id '{}' in {}",
                            previous.id,
                            self.dir.display()
                        )));
                    }
                }
                Err(err) => {
                    warn!("Skipping template {}: {}", path.display(), err);
                }
            }
        }

        let count = loaded.len();
        *self.cache.write() = loaded;
        Ok(count)
    }

    /// Parses and validates a single template document.
    fn load_file(path: &Path) -> WorkflowResult<WorkflowTemplate> {
        let content = std::fs::read_to_string(path)
            .map_err(|err| WorkflowError::TemplateStore(err.to_string()))?;

        let template: WorkflowTemplate = match path.extension().and_then(|ext| ext.to_str()) {
            Some("json") => serde_json::from_str(&content)?,
            _ => serde_yaml::from_str(&content)?,
        };

        template.workflow.validate().map_err(|err| {
            WorkflowError::InvalidDefinition(format!(
                "Template '{}' embeds an invalid workflow: {}",
                template.id, err
            ))
        })?;
        Ok(template)
    }

    /// Gets a template by ID, trying an on-demand load on cache miss.
    pub fn get(&self, template_id: &str) -> WorkflowResult<Arc<WorkflowTemplate>> {
        if let Some(template) = self.cache.read().get(template_id) {
            return Ok(template.clone());
        }

        for extension in ["yaml", "yml", "json"] {
            let path = self.dir.join(format!("{}.{}", template_id, extension));
            if path.is_file() {
                let template = Arc::new(Self::load_file(&path)?);
                if template.id != template_id {
                    return Err(WorkflowError::TemplateNotFound(template_id.to_string()));
                }
                self.cache
                    .write()
                    .insert(template.id.clone(), template.clone());
                return Ok(template);
            }
        }

        Err(WorkflowError::TemplateNotFound(template_id.to_string()))
    }

    /// Lists all cached templates, sorted by ID.
    pub fn list(&self) -> Vec<Arc<WorkflowTemplate>> {
        let mut templates: Vec<Arc<WorkflowTemplate>> =
            self.cache.read().values().cloned().collect();
        templates.sort_by(|a, b| a.id.cmp(&b.id));
        templates
    }

    /// Renders a definition from a stored template.
    pub fn render(
        &self,
        template_id: &str,
        user_vars: &HashMap<String, Value>,
    ) -> WorkflowResult<WorkflowDefinition> {
        self.get(template_id)?.render(user_vars)
    }
}

fn is_template_file(path: &Path) -> bool {
    path.is_file()
        && matches!(
            path.extension().and_then(|ext| ext.to_str()),
            Some("yaml") | Some("yml") | Some("json")
        )
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    const TEMPLATE_YAML: &str = r#"
id: t1
name: Graph summary
description: Traverse the graph and summarize
category: analysis
variables:
  - name: limit
    type: int
    default: 1
  - name: label
    type: string
    required: true
  - name: mode
    type: string
    default: fast
    options: [fast, thorough]
workflow:
  id: graph-summary
  variables:
    limit: 1
  tasks:
    - id: a
      type: data
      parameters:
        operation: traverse
        cypher: "MATCH (n:${label}) RETURN n LIMIT ${limit}"
    - id: b
      type: ai
      depends_on: [a]
      parameters:
        operation: summarize
        text: "${tasks.a.nodes}"
"#;

    fn store_with_template() -> (tempfile::TempDir, TemplateStore) {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("t1.yaml"), TEMPLATE_YAML).unwrap();
        let store = TemplateStore::open(dir.path()).unwrap();
        (dir, store)
    }

    #[test]
    fn test_open_loads_templates() {
        let (_dir, store) = store_with_template();
        assert_eq!(store.list().len(), 1);
        assert_eq!(store.get("t1").unwrap().name, "Graph summary");
    }

    #[test]
    fn test_render_merges_defaults_and_user_values() {
        let (_dir, store) = store_with_template();

        let mut user_vars = HashMap::new();
        user_vars.insert("label".to_string(), json!("Person"));
        user_vars.insert("limit".to_string(), json!(5));

        let definition = store.render("t1", &user_vars).unwrap();
        assert_eq!(definition.variables["label"], json!("Person"));
        assert_eq!(definition.variables["limit"], json!(5));
        assert_eq!(definition.variables["mode"], json!("fast"));
    }

    #[test]
    fn test_render_with_defaults_is_idempotent() {
        let (_dir, store) = store_with_template();

        let mut user_vars = HashMap::new();
        user_vars.insert("label".to_string(), json!("Person"));

        let first = store.render("t1", &user_vars).unwrap();
        let second = store.render("t1", &user_vars).unwrap();
        assert_eq!(first.variables, second.variables);
        assert_eq!(first.variables["limit"], json!(1));
    }

    #[test]
    fn test_missing_required_variable_fails() {
        let (_dir, store) = store_with_template();
        let result = store.render("t1", &HashMap::new());
        assert!(matches!(result, Err(WorkflowError::TemplateRender(_))));
    }

    #[test]
    fn test_type_mismatch_fails() {
        let (_dir, store) = store_with_template();

        let mut user_vars = HashMap::new();
        user_vars.insert("label".to_string(), json!("Person"));
        user_vars.insert("limit".to_string(), json!("not a number"));

        let result = store.render("t1", &user_vars);
        assert!(matches!(result, Err(WorkflowError::TemplateRender(_))));
    }

    #[test]
    fn test_value_outside_options_fails() {
        let (_dir, store) = store_with_template();

        let mut user_vars = HashMap::new();
        user_vars.insert("label".to_string(), json!("Person"));
        user_vars.insert("mode".to_string(), json!("sloppy"));

        let result = store.render("t1", &user_vars);
        assert!(matches!(result, Err(WorkflowError::TemplateRender(_))));
    }

    #[test]
    fn test_unknown_template_fails() {
        let (_dir, store) = store_with_template();
        assert!(matches!(
            store.get("ghost"),
            Err(WorkflowError::TemplateNotFound(_))
        ));
    }

    #[test]
    fn test_reload_picks_up_new_files() {
        let (dir, store) = store_with_template();

        let json_template = json!({
            "id": "t2",
            "name": "Empty",
            "workflow": {"id": "empty", "tasks": []}
        });
        std::fs::write(
            dir.path().join("t2.json"),
            serde_json::to_string(&json_template).unwrap(),
        )
        .unwrap();

        store.reload().unwrap();
        assert_eq!(store.list().len(), 2);
        assert!(store.get("t2").is_ok());
    }

    #[test]
    fn test_invalid_embedded_workflow_is_skipped() {
        let dir = tempfile::tempdir().unwrap();
        let bad = r#"
id: bad
name: Cyclic
workflow:
  id: cyclic
  tasks:
    - id: a
      type: data
      depends_on: [b]
      parameters: {operation: traverse}
    - id: b
      type: data
      depends_on: [a]
      parameters: {operation: traverse}
"#;
        std::fs::write(dir.path().join("bad.yaml"), bad).unwrap();

        let store = TemplateStore::open(dir.path()).unwrap();
        assert!(store.list().is_empty());
        assert!(matches!(
            store.get("bad"),
            Err(WorkflowError::InvalidDefinition(_))
        ));
    }

    #[test]
    fn test_missing_directory_fails_open() {
        let result = TemplateStore::open("/definitely/not/a/real/dir");
        assert!(matches!(result, Err(WorkflowError::TemplateStore(_))));
    }
}
