//! Typed schema descriptors for LLM output and a validator that reports
//! every violation in a single traversal.

use once_cell::sync::Lazy;
use promptmend_core::ProblemType;
use serde_json::{json, Map, Value};

/// Shape a JSON value must have
#[derive(Debug, Clone, PartialEq)]
pub enum SchemaKind {
    String,
    Number { min: Option<f64>, max: Option<f64> },
    Boolean,
    Enum(Vec<String>),
    Array(Box<SchemaKind>),
    Object(ObjectSchema),
}

#[derive(Debug, Clone, PartialEq)]
pub struct FieldSchema {
    pub name: String,
    pub kind: SchemaKind,
    pub required: bool,
    pub description: String,
}

impl FieldSchema {
    pub fn required(name: &str, kind: SchemaKind, description: &str) -> Self {
        Self {
            name: name.to_string(),
            kind,
            required: true,
            description: description.to_string(),
        }
    }

    pub fn optional(name: &str, kind: SchemaKind, description: &str) -> Self {
        Self {
            required: false,
            ..Self::required(name, kind, description)
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct ObjectSchema {
    pub name: String,
    pub fields: Vec<FieldSchema>,
}

/// Result of validating one document
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SchemaReport {
    pub errors: Vec<String>,
}

impl SchemaReport {
    pub fn is_valid(&self) -> bool {
        self.errors.is_empty()
    }
}

impl ObjectSchema {
    pub fn new(name: &str, fields: Vec<FieldSchema>) -> Self {
        Self {
            name: name.to_string(),
            fields,
        }
    }

    /// Check `value` against this schema without modifying it. Violations
    /// are reported in document order with a `$.path` prefix.
    pub fn validate(&self, value: &Value) -> SchemaReport {
        let mut errors = Vec::new();
        check_object(self, value, "$", &mut errors);
        SchemaReport { errors }
    }

    /// JSON Schema rendering embedded into prompts as the output contract
    pub fn to_json_schema(&self) -> Value {
        object_json_schema(self)
    }
}

fn check_object(schema: &ObjectSchema, value: &Value, path: &str, errors: &mut Vec<String>) {
    let Some(map) = value.as_object() else {
        errors.push(format!("{}: expected object, found {}", path, type_name(value)));
        return;
    };

    for field in &schema.fields {
        let field_path = format!("{}.{}", path, field.name);
        match map.get(&field.name) {
            None | Some(Value::Null) if field.required => {
                errors.push(format!("{}: required field missing", field_path))
            }
            None | Some(Value::Null) => {}
            Some(v) => check_kind(&field.kind, v, &field_path, errors),
        }
    }
}

fn check_kind(kind: &SchemaKind, value: &Value, path: &str, errors: &mut Vec<String>) {
    match kind {
        SchemaKind::String => {
            if !value.is_string() {
                errors.push(format!("{}: expected string, found {}", path, type_name(value)));
            }
        }
        SchemaKind::Boolean => {
            if !value.is_boolean() {
                errors.push(format!("{}: expected boolean, found {}", path, type_name(value)));
            }
        }
        SchemaKind::Number { min, max } => match value.as_f64() {
            None => errors.push(format!("{}: expected number, found {}", path, type_name(value))),
            Some(n) => {
                if min.is_some_and(|min| n < min) || max.is_some_and(|max| n > max) {
                    errors.push(format!(
                        "{}: {} is outside [{}, {}]",
                        path,
                        n,
                        min.map_or("-inf".to_string(), |m| m.to_string()),
                        max.map_or("inf".to_string(), |m| m.to_string())
                    ));
                }
            }
        },
        SchemaKind::Enum(allowed) => match value.as_str() {
            Some(s) if allowed.iter().any(|a| a == s) => {}
            Some(s) => errors.push(format!(
                "{}: \"{}\" is not one of [{}]",
                path,
                s,
                allowed.join(", ")
            )),
            None => errors.push(format!("{}: expected string, found {}", path, type_name(value))),
        },
        SchemaKind::Array(item) => match value.as_array() {
            None => errors.push(format!("{}: expected array, found {}", path, type_name(value))),
            Some(items) => {
                for (i, v) in items.iter().enumerate() {
                    check_kind(item, v, &format!("{}[{}]", path, i), errors);
                }
            }
        },
        SchemaKind::Object(schema) => check_object(schema, value, path, errors),
    }
}

fn type_name(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

fn object_json_schema(schema: &ObjectSchema) -> Value {
    let mut properties = Map::new();
    let mut required = Vec::new();
    for field in &schema.fields {
        let mut property = kind_json_schema(&field.kind);
        if let Some(obj) = property.as_object_mut() {
            obj.insert("description".into(), Value::String(field.description.clone()));
        }
        properties.insert(field.name.clone(), property);
        if field.required {
            required.push(Value::String(field.name.clone()));
        }
    }

    json!({
        "title": schema.name,
        "type": "object",
        "properties": properties,
        "required": required,
    })
}

fn kind_json_schema(kind: &SchemaKind) -> Value {
    match kind {
        SchemaKind::String => json!({"type": "string"}),
        SchemaKind::Boolean => json!({"type": "boolean"}),
        SchemaKind::Number { min, max } => {
            let mut schema = json!({"type": "number"});
            if let Some(obj) = schema.as_object_mut() {
                if let Some(min) = min {
                    obj.insert("minimum".into(), json!(min));
                }
                if let Some(max) = max {
                    obj.insert("maximum".into(), json!(max));
                }
            }
            schema
        }
        SchemaKind::Enum(allowed) => json!({"type": "string", "enum": allowed}),
        SchemaKind::Array(item) => json!({"type": "array", "items": kind_json_schema(item)}),
        SchemaKind::Object(schema) => object_json_schema(schema),
    }
}

fn unit_interval() -> SchemaKind {
    SchemaKind::Number {
        min: Some(0.0),
        max: Some(1.0),
    }
}

static MODIFICATION_SCHEMA: Lazy<ObjectSchema> = Lazy::new(|| {
    ObjectSchema::new(
        "Modification",
        vec![
            FieldSchema::required(
                "target",
                SchemaKind::Enum(vec![
                    "governing-prompt".into(),
                    "variable-prompt".into(),
                    "model-configuration".into(),
                ]),
                "Artifact the edit applies to",
            ),
            FieldSchema::optional(
                "locator",
                SchemaKind::String,
                "Markdown heading of the affected section, the variable name, or the configuration key",
            ),
            FieldSchema::optional(
                "original_text",
                SchemaKind::String,
                "Exact text to replace; empty to insert new text",
            ),
            FieldSchema::required("replacement_text", SchemaKind::String, "New text"),
            FieldSchema::optional("rationale", SchemaKind::String, "Why this edit fixes the issue"),
        ],
    )
});

static DIAGNOSIS_SCHEMA: Lazy<ObjectSchema> = Lazy::new(|| {
    ObjectSchema::new(
        "Diagnosis",
        vec![
            FieldSchema::required(
                "identified_issue",
                SchemaKind::String,
                "One-sentence statement of what went wrong",
            ),
            FieldSchema::optional(
                "problem_type",
                SchemaKind::Enum(
                    ProblemType::all()
                        .iter()
                        .map(|p| p.as_str().to_string())
                        .collect(),
                ),
                "Failure category",
            ),
            FieldSchema::required(
                "root_cause_analysis",
                SchemaKind::String,
                "Which instructions (or missing instructions) caused the reply",
            ),
            FieldSchema::required(
                "proposed_modifications",
                SchemaKind::Array(Box::new(SchemaKind::Object(MODIFICATION_SCHEMA.clone()))),
                "Ordered edits; later edits see the result of earlier ones",
            ),
            FieldSchema::required(
                "expected_impact",
                SchemaKind::String,
                "How the bot should behave after the edits",
            ),
            FieldSchema::required(
                "test_scenarios",
                SchemaKind::Array(Box::new(SchemaKind::String)),
                "User messages that exercise the fix",
            ),
            FieldSchema::required("confidence_score", unit_interval(), "Confidence in the diagnosis"),
        ],
    )
});

static VERDICT_SCHEMA: Lazy<ObjectSchema> = Lazy::new(|| {
    ObjectSchema::new(
        "ValidationVerdict",
        vec![
            FieldSchema::required(
                "valid",
                SchemaKind::Boolean,
                "Whether the modified prompt resolves the issue without regressions",
            ),
            FieldSchema::required("confidence", unit_interval(), "Confidence in the verdict"),
            FieldSchema::optional(
                "issues",
                SchemaKind::Array(Box::new(SchemaKind::String)),
                "Remaining problems with the modified prompt",
            ),
        ],
    )
});

pub fn diagnosis_schema() -> &'static ObjectSchema {
    &DIAGNOSIS_SCHEMA
}

pub fn verdict_schema() -> &'static ObjectSchema {
    &VERDICT_SCHEMA
}
