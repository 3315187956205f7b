//! Tool execution: shell, in-process function, and HTTP variants.
//!
//! The executor validates parameters against the declared schema, then
//! dispatches to the variant implementation. All failures surface as
//! `ToolError` and are reported to the agent as tool-call failures; they
//! never terminate the workflow.

pub mod function;
pub mod http;
pub mod shell;

use serde_json::{Map, Value};
use std::sync::Arc;

use crate::definitions::schema::{ToolDefinition, ToolImplementation};
use crate::errors::ToolError;

pub use function::FunctionRegistry;

/// Executes tool definitions against their variant implementations.
pub struct ToolExecutor {
    functions: Arc<FunctionRegistry>,
    http_client: reqwest::Client,
}

impl ToolExecutor {
    pub fn new(functions: Arc<FunctionRegistry>) -> Self {
        Self {
            functions,
            http_client: reqwest::Client::new(),
        }
    }

    /// Execute a tool with the given parameters. Parameters are validated
    /// against the declared schema (required fields, defaults, enumerated
    /// values, types) before the variant runs.
    pub async fn execute(
        &self,
        tool: &ToolDefinition,
        params: &Map<String, Value>,
    ) -> Result<Value, ToolError> {
        let params = validate_params(tool, params)?;

        match &tool.implementation {
            ToolImplementation::Shell { command, sandbox } => {
                shell::execute(&tool.name, command, sandbox, &params).await
            }
            ToolImplementation::Function {
                module,
                function,
                timeout_seconds,
            } => {
                self.functions
                    .execute(&tool.name, module, function, *timeout_seconds, params)
                    .await
            }
            ToolImplementation::Http {
                method,
                url,
                headers,
                body,
            } => {
                http::execute(
                    &self.http_client,
                    &tool.name,
                    *method,
                    url,
                    headers,
                    body.as_deref(),
                    &params,
                )
                .await
            }
        }
    }
}

/// Validate parameters against the tool's declared schema: required fields
/// must be present, defaults are applied, enumerated values and types are
/// enforced. Undeclared parameters are rejected.
pub fn validate_params(
    tool: &ToolDefinition,
    params: &Map<String, Value>,
) -> Result<Map<String, Value>, ToolError> {
    let mut validated = Map::new();

    for key in params.keys() {
        if !tool.parameters.contains_key(key) {
            return Err(ToolError::InvalidParameters {
                tool: tool.name.clone(),
                message: format!("unknown parameter '{}'", key),
            });
        }
    }

    for (name, decl) in &tool.parameters {
        let value = match params.get(name) {
            Some(v) => v.clone(),
            None => match &decl.default {
                Some(default) => default.clone(),
                None if decl.required => {
                    return Err(ToolError::InvalidParameters {
                        tool: tool.name.clone(),
                        message: format!("missing required parameter '{}'", name),
                    });
                }
                None => continue,
            },
        };

        if !decl.param_type.matches(&value) {
            return Err(ToolError::InvalidParameters {
                tool: tool.name.clone(),
                message: format!(
                    "parameter '{}' does not match declared type {:?}",
                    name, decl.param_type
                ),
            });
        }

        if let Some(allowed) = &decl.enum_values {
            if !allowed.contains(&value) {
                return Err(ToolError::InvalidParameters {
                    tool: tool.name.clone(),
                    message: format!(
                        "parameter '{}' must be one of {}",
                        name,
                        serde_json::to_string(allowed).unwrap_or_default()
                    ),
                });
            }
        }

        validated.insert(name.clone(), value);
    }

    Ok(validated)
}

/// Render a parameter value for template substitution. Strings are inserted
/// raw; everything else is JSON-serialized.
pub(crate) fn render_value(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

/// Replace `${name}` placeholders in a template with parameter values.
/// Unknown placeholders are left intact.
pub(crate) fn substitute_template(template: &str, params: &Map<String, Value>) -> String {
    let mut result = String::with_capacity(template.len());
    let mut rest = template;

    while let Some(start) = rest.find("${") {
        result.push_str(&rest[..start]);
        let after = &rest[start + 2..];
        match after.find('}') {
            Some(end) => {
                let name = &after[..end];
                match params.get(name) {
                    Some(value) => result.push_str(&render_value(value)),
                    None => {
                        result.push_str("${");
                        result.push_str(name);
                        result.push('}');
                    }
                }
                rest = &after[end + 1..];
            }
            None => {
                result.push_str(&rest[start..]);
                rest = "";
            }
        }
    }
    result.push_str(rest);
    result
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::definitions::schema::{ParamType, SandboxPolicy, ToolParameter};
    use serde_json::json;
    use std::collections::BTreeMap;

    fn tool_with_params(parameters: BTreeMap<String, ToolParameter>) -> ToolDefinition {
        ToolDefinition {
            name: "test-tool".to_string(),
            description: "Test".to_string(),
            parameters,
            tags: Vec::new(),
            implementation: ToolImplementation::Shell {
                command: "true".to_string(),
                sandbox: SandboxPolicy::default(),
            },
        }
    }

    fn param(param_type: ParamType, required: bool, default: Option<Value>) -> ToolParameter {
        ToolParameter {
            param_type,
            description: String::new(),
            required,
            default,
            enum_values: None,
        }
    }

    #[test]
    fn test_validate_params_applies_defaults() {
        let mut parameters = BTreeMap::new();
        parameters.insert(
            "count".to_string(),
            param(ParamType::Integer, false, Some(json!(3))),
        );
        let tool = tool_with_params(parameters);

        let validated = validate_params(&tool, &Map::new()).unwrap();
        assert_eq!(validated.get("count"), Some(&json!(3)));
    }

    #[test]
    fn test_validate_params_missing_required() {
        let mut parameters = BTreeMap::new();
        parameters.insert("name".to_string(), param(ParamType::String, true, None));
        let tool = tool_with_params(parameters);

        let err = validate_params(&tool, &Map::new()).unwrap_err();
        assert!(err.to_string().contains("missing required parameter"));
    }

    #[test]
    fn test_validate_params_type_mismatch() {
        let mut parameters = BTreeMap::new();
        parameters.insert("count".to_string(), param(ParamType::Integer, true, None));
        let tool = tool_with_params(parameters);

        let mut input = Map::new();
        input.insert("count".to_string(), json!("three"));
        let err = validate_params(&tool, &input).unwrap_err();
        assert!(err.to_string().contains("declared type"));
    }

    #[test]
    fn test_validate_params_enum_enforced() {
        let mut parameters = BTreeMap::new();
        let mut env_param = param(ParamType::String, true, None);
        env_param.enum_values = Some(vec![json!("test"), json!("prod")]);
        parameters.insert("environment".to_string(), env_param);
        let tool = tool_with_params(parameters);

        let mut input = Map::new();
        input.insert("environment".to_string(), json!("staging"));
        assert!(validate_params(&tool, &input).is_err());

        let mut input = Map::new();
        input.insert("environment".to_string(), json!("prod"));
        assert!(validate_params(&tool, &input).is_ok());
    }

    #[test]
    fn test_validate_params_rejects_unknown() {
        let tool = tool_with_params(BTreeMap::new());
        let mut input = Map::new();
        input.insert("surprise".to_string(), json!(1));
        let err = validate_params(&tool, &input).unwrap_err();
        assert!(err.to_string().contains("unknown parameter"));
    }

    #[test]
    fn test_validate_params_empty_schema_empty_input() {
        let tool = tool_with_params(BTreeMap::new());
        let validated = validate_params(&tool, &Map::new()).unwrap();
        assert!(validated.is_empty());
    }

    #[test]
    fn test_substitute_template_basic() {
        let mut params = Map::new();
        params.insert("name".to_string(), json!("world"));
        assert_eq!(
            substitute_template("hello ${name}!", &params),
            "hello world!"
        );
    }

    #[test]
    fn test_substitute_template_non_string_values() {
        let mut params = Map::new();
        params.insert("count".to_string(), json!(42));
        params.insert("flag".to_string(), json!(true));
        assert_eq!(
            substitute_template("n=${count} f=${flag}", &params),
            "n=42 f=true"
        );
    }

    #[test]
    fn test_substitute_template_unknown_placeholder_left_intact() {
        let params = Map::new();
        assert_eq!(substitute_template("x=${missing}", &params), "x=${missing}");
    }

    #[test]
    fn test_substitute_template_unterminated_placeholder() {
        let params = Map::new();
        assert_eq!(substitute_template("x=${open", &params), "x=${open");
    }

    #[test]
    fn test_render_value_string_is_raw() {
        assert_eq!(render_value(&json!("plain")), "plain");
        assert_eq!(render_value(&json!(3.5)), "3.5");
        assert_eq!(render_value(&json!({"a": 1})), r#"{"a":1}"#);
    }
}
