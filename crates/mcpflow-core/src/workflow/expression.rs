//! Step condition evaluation over a typed operand AST.
//!
//! Condition operands are parsed once into [`Operand`] values when a run is
//! planned (and by the validator for diagnostics). Evaluation resolves them
//! against the run's variables and step results without re-scanning strings.
//!
//! Operand precedence: `${var}` reference, then `stepId.field` lookup, then
//! number (float if the text contains `.`), then `true`/`false`
//! (case-insensitive), then the raw string.
//!
//! Evaluation never fails outward: any error makes the condition false.

use std::collections::HashMap;

use mcpflow_types::workflow::{Condition, ConditionLogic, ConditionOperator, WorkflowStep};
use regex::Regex;
use serde_json::Value;

// ---------------------------------------------------------------------------
// Error type
// ---------------------------------------------------------------------------

/// Errors that can occur while evaluating one condition.
#[derive(Debug, thiserror::Error)]
pub enum ExpressionError {
    #[error("invalid pattern '{pattern}': {reason}")]
    InvalidPattern { pattern: String, reason: String },
}

// ---------------------------------------------------------------------------
// Scope
// ---------------------------------------------------------------------------

/// The values an operand can refer to.
#[derive(Debug, Clone, Copy)]
pub struct EvalScope<'a> {
    pub variables: &'a HashMap<String, Value>,
    pub step_results: &'a HashMap<String, Value>,
}

// ---------------------------------------------------------------------------
// Operand
// ---------------------------------------------------------------------------

/// A parsed condition operand.
#[derive(Debug, Clone, PartialEq)]
pub enum Operand {
    /// `${name}`; resolves to null when the variable is unset.
    Variable(String),
    /// `stepId.field`; falls back to the literal reading of the same text
    /// when the step has no object result.
    StepField {
        step_id: String,
        field: String,
        fallback: Value,
    },
    Literal(Value),
}

impl Operand {
    pub fn parse(raw: &str) -> Self {
        if let Some(name) = raw.strip_prefix("${").and_then(|r| r.strip_suffix('}')) {
            return Operand::Variable(name.to_string());
        }
        let literal = parse_literal(raw);
        if let Some((step_id, field)) = raw.split_once('.') {
            return Operand::StepField {
                step_id: step_id.to_string(),
                field: field.to_string(),
                fallback: literal,
            };
        }
        Operand::Literal(literal)
    }

    pub fn resolve(&self, scope: &EvalScope<'_>) -> Value {
        match self {
            Operand::Variable(name) => scope.variables.get(name).cloned().unwrap_or(Value::Null),
            Operand::StepField {
                step_id,
                field,
                fallback,
            } => match scope.step_results.get(step_id) {
                Some(Value::Object(result)) => result.get(field).cloned().unwrap_or(Value::Null),
                _ => fallback.clone(),
            },
            Operand::Literal(value) => value.clone(),
        }
    }
}

/// Read operand text as a number, boolean or string.
pub fn parse_literal(raw: &str) -> Value {
    let trimmed = raw.trim();
    if trimmed.contains('.') {
        if let Some(n) = trimmed
            .parse::<f64>()
            .ok()
            .and_then(serde_json::Number::from_f64)
        {
            return Value::Number(n);
        }
    } else if let Ok(n) = trimmed.parse::<i64>() {
        return Value::from(n);
    }

    if raw.eq_ignore_ascii_case("true") {
        Value::Bool(true)
    } else if raw.eq_ignore_ascii_case("false") {
        Value::Bool(false)
    } else {
        Value::String(raw.to_string())
    }
}

// ---------------------------------------------------------------------------
// Compiled conditions
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
enum Pattern {
    /// Right operand is not a literal; compiled at evaluation time.
    Dynamic,
    Compiled(Regex),
    Invalid(String),
}

/// One condition with parsed operands.
#[derive(Debug, Clone)]
pub struct CompiledCondition {
    pub id: String,
    pub left: Operand,
    pub operator: ConditionOperator,
    pub right: Operand,
    pattern: Pattern,
}

impl CompiledCondition {
    pub fn compile(condition: &Condition) -> Self {
        let left = Operand::parse(&condition.left_operand);
        let right = Operand::parse(&condition.right_operand);

        let pattern = match (&condition.operator, &right) {
            (ConditionOperator::RegexMatch, Operand::Literal(value)) => {
                let source = render(value);
                match Regex::new(&source) {
                    Ok(re) => Pattern::Compiled(re),
                    Err(e) => Pattern::Invalid(e.to_string()),
                }
            }
            _ => Pattern::Dynamic,
        };

        Self {
            id: condition.id.clone(),
            left,
            operator: condition.operator,
            right,
            pattern,
        }
    }

    /// Why this condition can never hold, if known before evaluation.
    pub fn compile_error(&self) -> Option<&str> {
        match &self.pattern {
            Pattern::Invalid(reason) => Some(reason),
            _ => None,
        }
    }

    /// Evaluate, treating any error as `false`.
    pub fn evaluate(&self, scope: &EvalScope<'_>) -> bool {
        match self.try_evaluate(scope) {
            Ok(result) => result,
            Err(e) => {
                tracing::debug!(condition_id = self.id.as_str(), error = %e, "condition evaluation failed");
                false
            }
        }
    }

    fn try_evaluate(&self, scope: &EvalScope<'_>) -> Result<bool, ExpressionError> {
        let left = self.left.resolve(scope);
        let right = self.right.resolve(scope);

        let result = match self.operator {
            ConditionOperator::Equals => loose_eq(&left, &right),
            ConditionOperator::NotEquals => !loose_eq(&left, &right),
            ConditionOperator::GreaterThan => match (as_f64(&left), as_f64(&right)) {
                (Some(l), Some(r)) => l > r,
                _ => false,
            },
            ConditionOperator::LessThan => match (as_f64(&left), as_f64(&right)) {
                (Some(l), Some(r)) => l < r,
                _ => false,
            },
            ConditionOperator::Contains => render(&left).contains(&render(&right)),
            ConditionOperator::RegexMatch => {
                let haystack = render(&left);
                match &self.pattern {
                    Pattern::Compiled(re) => re.is_match(&haystack),
                    Pattern::Invalid(reason) => {
                        return Err(ExpressionError::InvalidPattern {
                            pattern: render(&right),
                            reason: reason.clone(),
                        });
                    }
                    Pattern::Dynamic => {
                        let source = render(&right);
                        let re = Regex::new(&source).map_err(|e| ExpressionError::InvalidPattern {
                            pattern: source.clone(),
                            reason: e.to_string(),
                        })?;
                        re.is_match(&haystack)
                    }
                }
            }
            ConditionOperator::IsEmpty => is_empty(&left),
            ConditionOperator::IsNotEmpty => !is_empty(&left),
        };
        Ok(result)
    }
}

/// All conditions of one step with their combining logic.
#[derive(Debug, Clone)]
pub struct ConditionSet {
    conditions: Vec<CompiledCondition>,
    logic: ConditionLogic,
}

impl ConditionSet {
    pub fn compile(step: &WorkflowStep) -> Self {
        Self {
            conditions: step.conditions.iter().map(CompiledCondition::compile).collect(),
            logic: step.condition_logic,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.conditions.is_empty()
    }

    pub fn conditions(&self) -> &[CompiledCondition] {
        &self.conditions
    }

    /// True when there are no conditions.
    pub fn evaluate(&self, scope: &EvalScope<'_>) -> bool {
        if self.conditions.is_empty() {
            return true;
        }
        let mut results = self.conditions.iter().map(|c| c.evaluate(scope));
        match self.logic {
            ConditionLogic::And => results.all(|r| r),
            ConditionLogic::Or => results.any(|r| r),
        }
    }
}

// ---------------------------------------------------------------------------
// Value helpers
// ---------------------------------------------------------------------------

/// String form used by `contains`, `regex_match` and text substitution.
pub fn render(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        Value::Null => String::new(),
        other => other.to_string(),
    }
}

fn loose_eq(left: &Value, right: &Value) -> bool {
    match (left, right) {
        (Value::Number(l), Value::Number(r)) => match (l.as_f64(), r.as_f64()) {
            (Some(l), Some(r)) => l == r,
            _ => l == r,
        },
        _ => left == right,
    }
}

fn as_f64(value: &Value) -> Option<f64> {
    match value {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.trim().parse::<f64>().ok(),
        Value::Bool(b) => Some(if *b { 1.0 } else { 0.0 }),
        _ => None,
    }
}

fn is_empty(value: &Value) -> bool {
    match value {
        Value::Null => true,
        Value::Bool(b) => !b,
        Value::Number(n) => n.as_f64() == Some(0.0),
        Value::String(s) => s.is_empty(),
        Value::Array(a) => a.is_empty(),
        Value::Object(o) => o.is_empty(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    struct Fixture {
        variables: HashMap<String, Value>,
        step_results: HashMap<String, Value>,
    }

    impl Fixture {
        fn new() -> Self {
            let mut variables = HashMap::new();
            variables.insert("env".to_string(), json!("prod"));
            variables.insert("threshold".to_string(), json!(10));
            let mut step_results = HashMap::new();
            step_results.insert(
                "fetch".to_string(),
                json!({"count": 42, "name": "Report", "rows": []}),
            );
            step_results.insert("raw".to_string(), json!("not an object"));
            Self {
                variables,
                step_results,
            }
        }

        fn scope(&self) -> EvalScope<'_> {
            EvalScope {
                variables: &self.variables,
                step_results: &self.step_results,
            }
        }
    }

    fn holds(left: &str, op: ConditionOperator, right: &str) -> bool {
        let fx = Fixture::new();
        CompiledCondition::compile(&Condition::new(left, op, right)).evaluate(&fx.scope())
    }

    #[test]
    fn literal_parsing_precedence() {
        assert_eq!(parse_literal("42"), json!(42));
        assert_eq!(parse_literal("4.5"), json!(4.5));
        assert_eq!(parse_literal("TRUE"), json!(true));
        assert_eq!(parse_literal("False"), json!(false));
        assert_eq!(parse_literal("hello"), json!("hello"));
        assert_eq!(parse_literal("1e5"), json!("1e5"));
    }

    #[test]
    fn operand_parse_builds_ast() {
        assert_eq!(Operand::parse("${env}"), Operand::Variable("env".to_string()));
        assert_eq!(
            Operand::parse("fetch.count"),
            Operand::StepField {
                step_id: "fetch".to_string(),
                field: "count".to_string(),
                fallback: json!("fetch.count"),
            }
        );
        assert_eq!(Operand::parse("7"), Operand::Literal(json!(7)));
    }

    #[test]
    fn dotted_number_without_step_falls_back_to_float() {
        let fx = Fixture::new();
        assert_eq!(Operand::parse("3.14").resolve(&fx.scope()), json!(3.14));
    }

    #[test]
    fn step_field_on_non_object_result_falls_back() {
        let fx = Fixture::new();
        assert_eq!(
            Operand::parse("raw.field").resolve(&fx.scope()),
            json!("raw.field")
        );
        assert_eq!(Operand::parse("fetch.missing").resolve(&fx.scope()), Value::Null);
    }

    #[test]
    fn equality_operators() {
        assert!(holds("${env}", ConditionOperator::Equals, "prod"));
        assert!(holds("fetch.count", ConditionOperator::Equals, "42"));
        assert!(holds("fetch.count", ConditionOperator::Equals, "42.0"));
        assert!(holds("${env}", ConditionOperator::NotEquals, "staging"));
        assert!(!holds("${env}", ConditionOperator::NotEquals, "prod"));
    }

    #[test]
    fn numeric_comparisons() {
        assert!(holds("fetch.count", ConditionOperator::GreaterThan, "${threshold}"));
        assert!(holds("${threshold}", ConditionOperator::LessThan, "10.5"));
        assert!(!holds("${env}", ConditionOperator::GreaterThan, "1"));
        assert!(!holds("${unset}", ConditionOperator::LessThan, "1"));
    }

    #[test]
    fn contains_and_regex() {
        assert!(holds("fetch.name", ConditionOperator::Contains, "port"));
        assert!(!holds("fetch.name", ConditionOperator::Contains, "xyz"));
        assert!(holds("fetch.name", ConditionOperator::RegexMatch, "^Rep"));
        assert!(!holds("fetch.name", ConditionOperator::RegexMatch, "^port"));
    }

    #[test]
    fn scalars_render_in_json_form() {
        assert_eq!(render(&json!(true)), "true");
        assert_eq!(render(&Value::Null), "");
        assert_eq!(render(&json!(2.5)), "2.5");
        assert_eq!(render(&json!({"a": 1})), r#"{"a":1}"#);

        let variables = HashMap::from([
            ("flag".to_string(), json!(true)),
            ("note".to_string(), Value::Null),
        ]);
        let step_results = HashMap::new();
        let scope = EvalScope {
            variables: &variables,
            step_results: &step_results,
        };
        let check = |left: &str, op, right: &str| {
            CompiledCondition::compile(&Condition::new(left, op, right)).evaluate(&scope)
        };
        // Boolean literals parse case-insensitively, so both spellings match.
        assert!(check("${flag}", ConditionOperator::Contains, "True"));
        assert!(check("${flag}", ConditionOperator::RegexMatch, "^tr"));
        assert!(!check("${flag}", ConditionOperator::RegexMatch, "^Tr"));
        assert!(check("${note}", ConditionOperator::RegexMatch, "^$"));
    }

    #[test]
    fn invalid_regex_is_false_and_reported() {
        let cond = CompiledCondition::compile(&Condition::new(
            "fetch.name",
            ConditionOperator::RegexMatch,
            "(unclosed",
        ));
        assert!(cond.compile_error().is_some());
        let fx = Fixture::new();
        assert!(!cond.evaluate(&fx.scope()));
    }

    #[test]
    fn dynamic_pattern_compiles_at_evaluation() {
        let mut fx = Fixture::new();
        fx.variables.insert("pattern".to_string(), json!("R.p"));
        let cond = CompiledCondition::compile(&Condition::new(
            "fetch.name",
            ConditionOperator::RegexMatch,
            "${pattern}",
        ));
        assert!(cond.compile_error().is_none());
        assert!(cond.evaluate(&fx.scope()));
    }

    #[test]
    fn emptiness() {
        assert!(holds("fetch.rows", ConditionOperator::IsEmpty, ""));
        assert!(holds("${unset}", ConditionOperator::IsEmpty, ""));
        assert!(holds("fetch.count", ConditionOperator::IsNotEmpty, ""));
        assert!(!holds("fetch.name", ConditionOperator::IsEmpty, ""));
    }

    #[test]
    fn and_or_logic() {
        let fx = Fixture::new();
        let mut step = WorkflowStep::new("s", "S", "echo");
        step.conditions = vec![
            Condition::new("${env}", ConditionOperator::Equals, "prod"),
            Condition::new("fetch.count", ConditionOperator::LessThan, "5"),
        ];

        assert!(!ConditionSet::compile(&step).evaluate(&fx.scope()));

        step.condition_logic = ConditionLogic::Or;
        assert!(ConditionSet::compile(&step).evaluate(&fx.scope()));
    }

    #[test]
    fn no_conditions_is_true() {
        let fx = Fixture::new();
        let step = WorkflowStep::new("s", "S", "echo");
        let set = ConditionSet::compile(&step);
        assert!(set.is_empty());
        assert!(set.evaluate(&fx.scope()));
    }
}
