//! Step parameter resolution.
//!
//! A step's tool parameters are built in three passes: the static
//! `parameters`, then `parameter_mappings` pulling fields out of earlier step
//! results, then `${var}` substitution on every string value. Mappings and
//! static templates are compiled once per step; resolution is a pure function
//! of the step results and variables passed in.

use std::collections::HashMap;

use mcpflow_types::workflow::{ParameterMapping, WorkflowStep};
use serde_json::{Map, Value};

use super::expression::render;

// ---------------------------------------------------------------------------
// Transformation
// ---------------------------------------------------------------------------

/// A value transformation applied to a mapped parameter.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Transformation {
    Uppercase,
    Lowercase,
    /// `format:<template>`; `{}` or `{0}` stands for the value.
    Format(String),
}

impl Transformation {
    /// Parse `uppercase`, `lowercase` or `format:<template>`.
    pub fn parse(raw: &str) -> Option<Self> {
        match raw {
            "uppercase" => Some(Transformation::Uppercase),
            "lowercase" => Some(Transformation::Lowercase),
            _ => raw
                .strip_prefix("format:")
                .map(|template| Transformation::Format(template.to_string())),
        }
    }

    /// Apply to a present value. A template that needs more than one
    /// positional value leaves the input unchanged.
    pub fn apply(&self, value: &Value) -> Value {
        let text = render(value);
        match self {
            Transformation::Uppercase => Value::String(text.to_uppercase()),
            Transformation::Lowercase => Value::String(text.to_lowercase()),
            Transformation::Format(template) => {
                if template.matches("{}").count() > 1 {
                    tracing::warn!(template = template.as_str(), "format transformation expects one value, leaving parameter unchanged");
                    return value.clone();
                }
                Value::String(template.replace("{}", &text).replace("{0}", &text))
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Variable templates
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq)]
enum Segment {
    Text(String),
    Var(String),
}

/// A string split into literal text and `${name}` references.
#[derive(Debug, Clone, PartialEq)]
struct Template {
    segments: Vec<Segment>,
}

impl Template {
    fn parse(source: &str) -> Self {
        let mut segments = Vec::new();
        let mut rest = source;

        while let Some(start) = rest.find("${") {
            let after = &rest[start + 2..];
            let Some(end) = after.find('}') else {
                break;
            };
            if start > 0 {
                segments.push(Segment::Text(rest[..start].to_string()));
            }
            segments.push(Segment::Var(after[..end].to_string()));
            rest = &after[end + 1..];
        }
        if !rest.is_empty() {
            segments.push(Segment::Text(rest.to_string()));
        }
        Self { segments }
    }

    fn has_vars(&self) -> bool {
        self.segments.iter().any(|s| matches!(s, Segment::Var(_)))
    }

    /// Unknown variables are kept verbatim.
    fn render(&self, variables: &HashMap<String, Value>) -> String {
        let mut out = String::new();
        for segment in &self.segments {
            match segment {
                Segment::Text(text) => out.push_str(text),
                Segment::Var(name) => match variables.get(name) {
                    Some(Value::String(s)) => out.push_str(s),
                    Some(other) => out.push_str(&other.to_string()),
                    None => {
                        out.push_str("${");
                        out.push_str(name);
                        out.push('}');
                    }
                },
            }
        }
        out
    }
}

// ---------------------------------------------------------------------------
// StepParameters
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
struct CompiledMapping {
    source_step_id: String,
    source_parameter: String,
    target_parameter: String,
    transformation: Option<Transformation>,
    default_value: Option<Value>,
}

impl CompiledMapping {
    fn compile(step_id: &str, mapping: &ParameterMapping) -> Self {
        let transformation = mapping.transformation.as_deref().and_then(|raw| {
            let parsed = Transformation::parse(raw);
            if parsed.is_none() {
                tracing::warn!(step_id, transformation = raw, "ignoring unknown parameter transformation");
            }
            parsed
        });
        Self {
            source_step_id: mapping.source_step_id.clone(),
            source_parameter: mapping.source_parameter.clone(),
            target_parameter: mapping.target_parameter.clone(),
            transformation,
            default_value: mapping.default_value.clone(),
        }
    }

    /// The mapped value, or `None` when neither source nor default is present.
    fn resolve(&self, results: &HashMap<String, Value>) -> Option<Value> {
        let source = match results.get(&self.source_step_id) {
            Some(Value::Object(result)) => result
                .get(&self.source_parameter)
                .filter(|v| !v.is_null())
                .cloned(),
            _ => None,
        };
        let value = source.or_else(|| self.default_value.clone().filter(|v| !v.is_null()))?;
        Some(match &self.transformation {
            Some(t) => t.apply(&value),
            None => value,
        })
    }
}

/// A step's parameter recipe, compiled once per run.
#[derive(Debug, Clone)]
pub struct StepParameters {
    statics: Map<String, Value>,
    templates: HashMap<String, Template>,
    mappings: Vec<CompiledMapping>,
}

impl StepParameters {
    pub fn compile(step: &WorkflowStep) -> Self {
        let templates = step
            .parameters
            .iter()
            .filter_map(|(key, value)| match value {
                Value::String(s) => Some((key.clone(), Template::parse(s))),
                _ => None,
            })
            .collect();
        Self {
            statics: step.parameters.clone(),
            templates,
            mappings: step
                .parameter_mappings
                .iter()
                .map(|m| CompiledMapping::compile(&step.id, m))
                .collect(),
        }
    }

    /// Build the tool parameters from step results and variables.
    pub fn resolve(
        &self,
        results: &HashMap<String, Value>,
        variables: &HashMap<String, Value>,
    ) -> Map<String, Value> {
        let mut params = self.statics.clone();
        let mut mapped = Vec::new();

        for mapping in &self.mappings {
            if let Some(value) = mapping.resolve(results) {
                params.insert(mapping.target_parameter.clone(), value);
                mapped.push(mapping.target_parameter.as_str());
            }
        }

        for (key, value) in params.iter_mut() {
            let Value::String(text) = value else {
                continue;
            };
            let rendered = if mapped.contains(&key.as_str()) {
                let template = Template::parse(text);
                template.has_vars().then(|| template.render(variables))
            } else {
                self.templates
                    .get(key)
                    .filter(|t| t.has_vars())
                    .map(|t| t.render(variables))
            };
            if let Some(rendered) = rendered {
                *text = rendered;
            }
        }
        params
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn mapping(source: &str, field: &str, target: &str) -> ParameterMapping {
        ParameterMapping {
            source_step_id: source.to_string(),
            source_parameter: field.to_string(),
            target_parameter: target.to_string(),
            transformation: None,
            default_value: None,
        }
    }

    fn step_with(params: Value, mappings: Vec<ParameterMapping>) -> WorkflowStep {
        let mut step = WorkflowStep::new("save", "Save", "db");
        step.parameters = params.as_object().cloned().unwrap_or_default();
        step.parameter_mappings = mappings;
        step
    }

    fn results() -> HashMap<String, Value> {
        HashMap::from([(
            "fetch".to_string(),
            json!({"city": "Oslo", "count": 3, "missing": null}),
        )])
    }

    fn variables() -> HashMap<String, Value> {
        HashMap::from([
            ("env".to_string(), json!("prod")),
            ("region".to_string(), json!("eu")),
            ("limit".to_string(), json!(50)),
        ])
    }

    #[test]
    fn parse_transformations() {
        assert_eq!(Transformation::parse("uppercase"), Some(Transformation::Uppercase));
        assert_eq!(Transformation::parse("lowercase"), Some(Transformation::Lowercase));
        assert_eq!(
            Transformation::parse("format:city={}"),
            Some(Transformation::Format("city={}".to_string()))
        );
        assert_eq!(Transformation::parse("reverse"), None);
    }

    #[test]
    fn format_variants() {
        let t = Transformation::Format("<{0}>".to_string());
        assert_eq!(t.apply(&json!(7)), json!("<7>"));
        let multi = Transformation::Format("{} and {}".to_string());
        assert_eq!(multi.apply(&json!("x")), json!("x"));
    }

    #[test]
    fn mappings_override_statics_and_transform() {
        let mut upper = mapping("fetch", "city", "city");
        upper.transformation = Some("uppercase".to_string());
        let step = step_with(
            json!({"city": "default", "mode": "fast"}),
            vec![upper, mapping("fetch", "count", "rows")],
        );

        let params = StepParameters::compile(&step).resolve(&results(), &variables());
        assert_eq!(params["city"], json!("OSLO"));
        assert_eq!(params["rows"], json!(3));
        assert_eq!(params["mode"], json!("fast"));
    }

    #[test]
    fn default_used_when_source_absent_or_null() {
        let mut from_null = mapping("fetch", "missing", "a");
        from_null.default_value = Some(json!("fallback"));
        let mut from_absent_step = mapping("ghost", "x", "b");
        from_absent_step.default_value = Some(json!(1));
        let no_default = mapping("ghost", "x", "c");

        let step = step_with(json!({}), vec![from_null, from_absent_step, no_default]);
        let params = StepParameters::compile(&step).resolve(&results(), &variables());
        assert_eq!(params["a"], json!("fallback"));
        assert_eq!(params["b"], json!(1));
        assert!(!params.contains_key("c"));
    }

    #[test]
    fn substitutes_every_variable() {
        let step = step_with(
            json!({"path": "/${env}/${region}/items?limit=${limit}&x=${unknown}", "n": 5}),
            vec![],
        );
        let params = StepParameters::compile(&step).resolve(&results(), &variables());
        assert_eq!(params["path"], json!("/prod/eu/items?limit=50&x=${unknown}"));
        assert_eq!(params["n"], json!(5));
    }

    #[test]
    fn substitutes_inside_mapped_values() {
        let mut fmt = mapping("fetch", "city", "label");
        fmt.transformation = Some("format:{}-${env}".to_string());
        let step = step_with(json!({}), vec![fmt]);
        let params = StepParameters::compile(&step).resolve(&results(), &variables());
        assert_eq!(params["label"], json!("Oslo-prod"));
    }

    #[test]
    fn unterminated_reference_is_literal() {
        let step = step_with(json!({"q": "a ${env"}), vec![]);
        let params = StepParameters::compile(&step).resolve(&results(), &variables());
        assert_eq!(params["q"], json!("a ${env"));
    }

    #[test]
    fn resolution_is_idempotent() {
        let mut lower = mapping("fetch", "city", "city");
        lower.transformation = Some("lowercase".to_string());
        let step = step_with(json!({"env": "${env}"}), vec![lower]);
        let compiled = StepParameters::compile(&step);
        let (r, v) = (results(), variables());

        let first = compiled.resolve(&r, &v);
        let second = compiled.resolve(&r, &v);
        assert_eq!(first, second);
        assert_eq!(first["city"], json!("oslo"));
    }
}
