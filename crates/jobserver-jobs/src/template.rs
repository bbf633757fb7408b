// ABOUTME: Job templates: named, parameterized sequences of stages, and the registry that holds them.
// ABOUTME: Submitted parameters are validated against the template before any stage is built.

use std::collections::BTreeMap;
use std::sync::Arc;

use jobserver_core::{JobPriority, StoredEnum};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::stage::{Stage, StageKind};

/// Parameter name every template accepts.
pub const PRIORITY_PARAM: &str = "priority";

/// The accepted type of a template parameter.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ParamKind {
    Text,
    Integer,
    Boolean,
}

impl ParamKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ParamKind::Text => "text",
            ParamKind::Integer => "an integer",
            ParamKind::Boolean => "a boolean",
        }
    }

    fn accepts(&self, value: &Value) -> bool {
        match self {
            ParamKind::Text => value.is_string(),
            ParamKind::Integer => value.is_i64(),
            ParamKind::Boolean => value.is_boolean(),
        }
    }
}

/// One declared parameter. A parameter without a default is required.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ParameterSpec {
    pub name: String,
    pub kind: ParamKind,
    pub default: Option<Value>,
    pub description: String,
}

impl ParameterSpec {
    pub fn required(name: &str, kind: ParamKind, description: &str) -> Self {
        Self {
            name: name.to_string(),
            kind,
            default: None,
            description: description.to_string(),
        }
    }

    pub fn optional(name: &str, kind: ParamKind, default: Value, description: &str) -> Self {
        Self {
            default: Some(default),
            ..Self::required(name, kind, description)
        }
    }
}

/// What a caller submits: a template name plus parameter values.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobParameters {
    pub template: String,
    #[serde(default)]
    pub values: Map<String, Value>,
}

impl JobParameters {
    pub fn new(template: impl Into<String>) -> Self {
        Self {
            template: template.into(),
            values: Map::new(),
        }
    }

    pub fn with(mut self, name: &str, value: impl Into<Value>) -> Self {
        self.values.insert(name.to_string(), value.into());
        self
    }
}

/// Parameters after validation, with defaults filled in.
#[derive(Debug, Clone, PartialEq)]
pub struct ResolvedParameters {
    values: Map<String, Value>,
    priority: JobPriority,
}

impl ResolvedParameters {
    pub fn new(values: Map<String, Value>, priority: JobPriority) -> Self {
        Self { values, priority }
    }

    pub fn priority(&self) -> JobPriority {
        self.priority
    }

    pub fn get(&self, name: &str) -> Option<&Value> {
        self.values.get(name)
    }

    pub fn text(&self, name: &str) -> Option<&str> {
        self.values.get(name).and_then(Value::as_str)
    }

    pub fn integer(&self, name: &str) -> Option<i64> {
        self.values.get(name).and_then(Value::as_i64)
    }

    pub fn boolean(&self, name: &str) -> Option<bool> {
        self.values.get(name).and_then(Value::as_bool)
    }
}

/// A named, ordered list of stages and the parameters they read.
#[derive(Debug, Clone)]
pub struct JobTemplate {
    pub name: String,
    pub description: String,
    pub parameters: Vec<ParameterSpec>,
    pub stages: Vec<StageKind>,
}

impl JobTemplate {
    pub fn new(name: &str, description: &str) -> Self {
        Self {
            name: name.to_string(),
            description: description.to_string(),
            parameters: Vec::new(),
            stages: Vec::new(),
        }
    }

    pub fn parameter(mut self, spec: ParameterSpec) -> Self {
        self.parameters.push(spec);
        self
    }

    pub fn stage(mut self, kind: StageKind) -> Self {
        self.stages.push(kind);
        self
    }

    /// Check `values` against the declared parameters. Unknown names, wrong
    /// types and missing required values are all rejected with a reason.
    pub fn resolve(&self, values: &Map<String, Value>) -> Result<ResolvedParameters, String> {
        let mut priority = JobPriority::default();
        for (name, value) in values {
            if name == PRIORITY_PARAM {
                priority = value
                    .as_i64()
                    .and_then(JobPriority::from_code)
                    .ok_or_else(|| format!("{PRIORITY_PARAM} must be an integer from 1 to 5"))?;
                continue;
            }
            let Some(spec) = self.parameters.iter().find(|p| &p.name == name) else {
                return Err(format!("unknown parameter {name}"));
            };
            if !spec.kind.accepts(value) {
                return Err(format!("parameter {name} must be {}", spec.kind.as_str()));
            }
        }

        let mut resolved = Map::new();
        for spec in &self.parameters {
            let value = match (values.get(&spec.name), &spec.default) {
                (Some(v), _) => v.clone(),
                (None, Some(default)) => default.clone(),
                (None, None) => return Err(format!("missing required parameter {}", spec.name)),
            };
            resolved.insert(spec.name.clone(), value);
        }
        Ok(ResolvedParameters::new(resolved, priority))
    }

    pub fn build_stages(&self, params: &ResolvedParameters) -> Vec<Arc<dyn Stage>> {
        self.stages.iter().map(|kind| kind.build(params)).collect()
    }

    pub fn info(&self) -> TemplateInfo {
        TemplateInfo {
            name: self.name.clone(),
            description: self.description.clone(),
            parameters: self.parameters.clone(),
            stages: self.stages.iter().map(|s| s.name().to_string()).collect(),
        }
    }
}

/// A serializable description of a template.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TemplateInfo {
    pub name: String,
    pub description: String,
    pub parameters: Vec<ParameterSpec>,
    pub stages: Vec<String>,
}

/// The templates a manager can instantiate, by name.
#[derive(Debug, Clone, Default)]
pub struct TemplateRegistry {
    templates: BTreeMap<String, Arc<JobTemplate>>,
}

impl TemplateRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// The echo, sleep and file-write-read templates.
    pub fn builtin() -> Self {
        let mut registry = Self::new();
        registry.register(
            JobTemplate::new("echo", "Log a message, optionally failing")
                .parameter(ParameterSpec::optional(
                    "message",
                    ParamKind::Text,
                    Value::from("hello"),
                    "Text to log",
                ))
                .parameter(ParameterSpec::optional(
                    "fail",
                    ParamKind::Boolean,
                    Value::from(false),
                    "Report failure instead of success",
                ))
                .stage(StageKind::Echo),
        );
        registry.register(
            JobTemplate::new("sleep", "Wait for a while; stops early when cancelled")
                .parameter(ParameterSpec::optional(
                    "duration_ms",
                    ParamKind::Integer,
                    Value::from(1000),
                    "How long to wait, in milliseconds",
                ))
                .stage(StageKind::Sleep),
        );
        registry.register(
            JobTemplate::new("file-write-read", "Write a file, then read it back and compare")
                .parameter(ParameterSpec::required(
                    "path",
                    ParamKind::Text,
                    "File to write",
                ))
                .parameter(ParameterSpec::optional(
                    "contents",
                    ParamKind::Text,
                    Value::from("Hello, World!"),
                    "Text to write",
                ))
                .stage(StageKind::WriteFile)
                .stage(StageKind::ReadFile),
        );
        registry
    }

    /// Add or replace a template.
    pub fn register(&mut self, template: JobTemplate) {
        self.templates
            .insert(template.name.clone(), Arc::new(template));
    }

    pub fn get(&self, name: &str) -> Option<Arc<JobTemplate>> {
        self.templates.get(name).cloned()
    }

    /// Descriptions of every template, ordered by name.
    pub fn list(&self) -> Vec<TemplateInfo> {
        self.templates.values().map(|t| t.info()).collect()
    }

    pub fn len(&self) -> usize {
        self.templates.len()
    }

    pub fn is_empty(&self) -> bool {
        self.templates.is_empty()
    }
}
