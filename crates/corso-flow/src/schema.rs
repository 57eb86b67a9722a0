//! Strict output schemas for LLM-structured responses.
//!
//! Model output is never trusted past this boundary: every stage declares
//! the shape it expects, and every repair-layer attempt is re-validated
//! against that shape before a value is accepted. Unknown extra fields are
//! tolerated (models love to add them); missing or mistyped declared fields
//! are violations.

use serde_json::Value;

use crate::state::PipelineStage;

/// The JSON kind a field is expected to hold.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FieldKind {
    /// A JSON string.
    String,
    /// A JSON number.
    Number,
    /// A JSON boolean.
    Boolean,
    /// A JSON array.
    Array,
    /// A JSON object.
    Object,
}

impl FieldKind {
    /// Returns the kind of a concrete JSON value.
    #[must_use]
    pub fn of(value: &Value) -> Option<Self> {
        match value {
            Value::String(_) => Some(Self::String),
            Value::Number(_) => Some(Self::Number),
            Value::Bool(_) => Some(Self::Boolean),
            Value::Array(_) => Some(Self::Array),
            Value::Object(_) => Some(Self::Object),
            Value::Null => None,
        }
    }
}

impl std::fmt::Display for FieldKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::String => f.write_str("string"),
            Self::Number => f.write_str("number"),
            Self::Boolean => f.write_str("boolean"),
            Self::Array => f.write_str("array"),
            Self::Object => f.write_str("object"),
        }
    }
}

/// One expected field of a structured output.
#[derive(Debug, Clone)]
pub struct FieldSpec {
    /// Field name as it must appear in the output object.
    pub name: String,
    /// Expected JSON kind.
    pub kind: FieldKind,
    /// Whether the field must be present and non-null.
    pub required: bool,
}

/// The shape a stage expects the model to produce.
#[derive(Debug, Clone)]
pub struct OutputSchema {
    /// Schema name, used in diagnostics and critique prompts.
    pub name: String,
    /// Expected fields.
    pub fields: Vec<FieldSpec>,
}

impl OutputSchema {
    /// Creates an empty schema.
    #[must_use]
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            fields: Vec::new(),
        }
    }

    /// Adds a required field.
    #[must_use]
    pub fn field(mut self, name: impl Into<String>, kind: FieldKind) -> Self {
        self.fields.push(FieldSpec {
            name: name.into(),
            kind,
            required: true,
        });
        self
    }

    /// Adds an optional field.
    #[must_use]
    pub fn optional_field(mut self, name: impl Into<String>, kind: FieldKind) -> Self {
        self.fields.push(FieldSpec {
            name: name.into(),
            kind,
            required: false,
        });
        self
    }

    /// Returns the schema each pipeline stage expects from the model.
    #[must_use]
    pub fn for_stage(stage: PipelineStage) -> Self {
        match stage {
            PipelineStage::Outline => Self::new("course_outline")
                .field("title", FieldKind::String)
                .field("description", FieldKind::String)
                .field("sections", FieldKind::Array),
            PipelineStage::Sections => Self::new("course_sections")
                .field("sections", FieldKind::Array),
            PipelineStage::Assessments => Self::new("course_assessments")
                .field("assessments", FieldKind::Array),
        }
    }

    /// Validates a candidate value against this schema.
    ///
    /// # Errors
    ///
    /// Returns the full set of violations; callers feed these back into the
    /// repair cascade (critique prompts, partial regeneration).
    pub fn validate(&self, value: &Value) -> Result<(), SchemaViolations> {
        let Value::Object(map) = value else {
            return Err(SchemaViolations {
                schema: self.name.clone(),
                violations: vec![Violation {
                    field: "$".into(),
                    problem: ViolationKind::NotAnObject,
                }],
            });
        };

        let mut violations = Vec::new();
        for spec in &self.fields {
            match map.get(&spec.name) {
                None | Some(Value::Null) => {
                    if spec.required {
                        violations.push(Violation {
                            field: spec.name.clone(),
                            problem: ViolationKind::Missing,
                        });
                    }
                }
                Some(actual) => {
                    let actual_kind = FieldKind::of(actual);
                    if actual_kind != Some(spec.kind) {
                        violations.push(Violation {
                            field: spec.name.clone(),
                            problem: ViolationKind::WrongKind {
                                expected: spec.kind,
                                actual: actual_kind,
                            },
                        });
                    }
                }
            }
        }

        if violations.is_empty() {
            Ok(())
        } else {
            Err(SchemaViolations {
                schema: self.name.clone(),
                violations,
            })
        }
    }

    /// Renders the expected shape for inclusion in a model prompt.
    #[must_use]
    pub fn describe(&self) -> String {
        let fields = self
            .fields
            .iter()
            .map(|f| {
                let req = if f.required { "" } else { ", optional" };
                format!("  \"{}\": {}{}", f.name, f.kind, req)
            })
            .collect::<Vec<_>>()
            .join("\n");
        format!("{} {{\n{fields}\n}}", self.name)
    }
}

/// What went wrong with one field.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ViolationKind {
    /// The value is not a JSON object at all.
    NotAnObject,
    /// A required field is absent or null.
    Missing,
    /// The field holds a value of the wrong kind.
    WrongKind {
        /// The kind the schema expects.
        expected: FieldKind,
        /// The kind actually found (`None` for null).
        actual: Option<FieldKind>,
    },
}

/// A single schema violation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Violation {
    /// The offending field name (`$` for the document root).
    pub field: String,
    /// What went wrong.
    pub problem: ViolationKind,
}

impl std::fmt::Display for Violation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match &self.problem {
            ViolationKind::NotAnObject => write!(f, "{}: not a JSON object", self.field),
            ViolationKind::Missing => write!(f, "{}: required field is missing", self.field),
            ViolationKind::WrongKind { expected, actual } => match actual {
                Some(actual) => write!(f, "{}: expected {expected}, found {actual}", self.field),
                None => write!(f, "{}: expected {expected}, found null", self.field),
            },
        }
    }
}

/// All violations found when validating one candidate value.
#[derive(Debug, Clone)]
pub struct SchemaViolations {
    /// The schema that was violated.
    pub schema: String,
    /// The individual violations.
    pub violations: Vec<Violation>,
}

impl SchemaViolations {
    /// Names of the fields that failed validation (`$` for the root).
    #[must_use]
    pub fn failed_fields(&self) -> Vec<&str> {
        self.violations.iter().map(|v| v.field.as_str()).collect()
    }
}

impl std::fmt::Display for SchemaViolations {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "schema '{}' violated: ", self.schema)?;
        let mut first = true;
        for v in &self.violations {
            if !first {
                write!(f, "; ")?;
            }
            write!(f, "{v}")?;
            first = false;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn outline_schema() -> OutputSchema {
        OutputSchema::for_stage(PipelineStage::Outline)
    }

    #[test]
    fn valid_output_passes() {
        let value = json!({
            "title": "Intro to Soil Science",
            "description": "A practical course.",
            "sections": [{"heading": "Basics"}],
        });
        assert!(outline_schema().validate(&value).is_ok());
    }

    #[test]
    fn extra_fields_are_tolerated() {
        let value = json!({
            "title": "T", "description": "D", "sections": [],
            "confidence": 0.93,
        });
        assert!(outline_schema().validate(&value).is_ok());
    }

    #[test]
    fn missing_required_field_is_reported() {
        let value = json!({"title": "T", "sections": []});
        let err = outline_schema().validate(&value).unwrap_err();
        assert_eq!(err.failed_fields(), vec!["description"]);
    }

    #[test]
    fn wrong_kind_is_reported() {
        let value = json!({"title": "T", "description": "D", "sections": "not an array"});
        let err = outline_schema().validate(&value).unwrap_err();
        assert!(err.to_string().contains("expected array, found string"));
    }

    #[test]
    fn non_object_root_is_reported() {
        let err = outline_schema().validate(&json!("just text")).unwrap_err();
        assert_eq!(err.failed_fields(), vec!["$"]);
    }

    #[test]
    fn null_required_field_counts_as_missing() {
        let value = json!({"title": null, "description": "D", "sections": []});
        let err = outline_schema().validate(&value).unwrap_err();
        assert_eq!(err.failed_fields(), vec!["title"]);
    }

    #[test]
    fn describe_lists_fields() {
        let text = outline_schema().describe();
        assert!(text.contains("\"title\": string"));
        assert!(text.contains("\"sections\": array"));
    }
}
