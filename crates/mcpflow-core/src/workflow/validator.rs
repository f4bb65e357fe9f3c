//! Structural validation of workflow definitions.
//!
//! Every check runs and every violation is reported; nothing short-circuits.
//! Activation requires a valid definition; drafts may be saved incomplete.

use std::collections::HashSet;

use mcpflow_types::workflow::WorkflowDefinition;

use super::expression::CompiledCondition;
use super::graph::DependencyGraph;
use super::mapping::Transformation;

/// The outcome of validating one definition.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ValidationReport {
    pub errors: Vec<String>,
}

impl ValidationReport {
    pub fn is_valid(&self) -> bool {
        self.errors.is_empty()
    }
}

/// Validate a workflow definition.
pub fn validate_workflow(def: &WorkflowDefinition) -> ValidationReport {
    let mut errors = Vec::new();

    if def.name.trim().is_empty() {
        errors.push("Workflow name is required".to_string());
    }
    if def.steps.is_empty() {
        errors.push("Workflow must have at least one step".to_string());
    }

    // Steps
    let mut step_ids = HashSet::new();
    for step in &def.steps {
        if !step_ids.insert(step.id.as_str()) {
            errors.push(format!("Duplicate step ID: {}", step.id));
        }
        if step.name.trim().is_empty() {
            errors.push(format!("Step {} must have a name", step.id));
        }
        if step.tool_id.trim().is_empty() {
            errors.push(format!("Step {} must specify a tool", step.id));
        }
        if step.timeout <= 0 {
            errors.push(format!("Step {} timeout must be positive", step.id));
        }
        if step.retry_count < 0 {
            errors.push(format!("Step {} retry count cannot be negative", step.id));
        }
        if step.retry_count > 0 && step.retry_delay <= 0 {
            errors.push(format!(
                "Step {} retry delay must be positive when retries are enabled",
                step.id
            ));
        }
    }

    // Connections
    let mut connection_ids = HashSet::new();
    for conn in &def.connections {
        if !connection_ids.insert(conn.id.as_str()) {
            errors.push(format!("Duplicate connection ID: {}", conn.id));
        }
        if !step_ids.contains(conn.source_step_id.as_str()) {
            errors.push(format!(
                "Connection {} references invalid source step: {}",
                conn.id, conn.source_step_id
            ));
        }
        if !step_ids.contains(conn.target_step_id.as_str()) {
            errors.push(format!(
                "Connection {} references invalid target step: {}",
                conn.id, conn.target_step_id
            ));
        }
        if conn.source_step_id == conn.target_step_id {
            errors.push(format!("Connection {} cannot connect step to itself", conn.id));
        }
    }

    if DependencyGraph::new(def).has_cycle() {
        errors.push("Workflow contains cycles".to_string());
    }

    let mut variable_names = HashSet::new();
    for var in &def.variables {
        if !variable_names.insert(var.name.as_str()) {
            errors.push(format!("Duplicate variable name: {}", var.name));
        }
    }

    if def.max_execution_time <= 0 {
        errors.push("Maximum execution time must be positive".to_string());
    }
    if def.max_parallel_steps <= 0 {
        errors.push("Maximum parallel steps must be positive".to_string());
    }

    for (index, trigger) in def.triggers.iter().enumerate() {
        if trigger.trigger_type.trim().is_empty() {
            errors.push(format!("Trigger {index} must have a type"));
        }
    }

    // Conditions and mappings that can never work at run time.
    for step in &def.steps {
        for condition in &step.conditions {
            if let Some(reason) = CompiledCondition::compile(condition).compile_error() {
                errors.push(format!(
                    "Step {} condition {} has invalid pattern: {}",
                    step.id, condition.id, reason
                ));
            }
        }
        for mapping in &step.parameter_mappings {
            if let Some(raw) = mapping.transformation.as_deref() {
                if Transformation::parse(raw).is_none() {
                    errors.push(format!("Step {} has unknown transformation: {}", step.id, raw));
                }
            }
        }
    }

    ValidationReport { errors }
}

#[cfg(test)]
mod tests {
    use super::*;
    use mcpflow_types::workflow::{
        Condition, ConditionOperator, ConnectionType, ParameterMapping, WorkflowConnection,
        WorkflowStep, WorkflowTrigger, WorkflowVariable,
    };

    fn valid_workflow() -> WorkflowDefinition {
        let mut def = WorkflowDefinition::new("etl");
        def.steps = vec![
            WorkflowStep::new("fetch", "Fetch", "http"),
            WorkflowStep::new("save", "Save", "db"),
        ];
        def.connections = vec![WorkflowConnection::new(
            "c1",
            "fetch",
            "save",
            ConnectionType::Data,
        )];
        def
    }

    #[test]
    fn valid_definition_has_no_errors() {
        let report = validate_workflow(&valid_workflow());
        assert!(report.is_valid(), "{:?}", report.errors);
    }

    #[test]
    fn empty_definition_reports_name_and_steps() {
        let def = WorkflowDefinition::new("");
        let report = validate_workflow(&def);
        assert_eq!(
            report.errors,
            vec![
                "Workflow name is required".to_string(),
                "Workflow must have at least one step".to_string(),
            ]
        );
    }

    #[test]
    fn step_checks_accumulate() {
        let mut def = valid_workflow();
        let mut bad = WorkflowStep::new("fetch", "", "");
        bad.timeout = 0;
        bad.retry_count = -1;
        def.steps.push(bad);
        let mut no_delay = WorkflowStep::new("retry", "Retry", "http");
        no_delay.retry_count = 2;
        no_delay.retry_delay = 0;
        def.steps.push(no_delay);

        let errors = validate_workflow(&def).errors;
        assert_eq!(
            errors,
            vec![
                "Duplicate step ID: fetch",
                "Step fetch must have a name",
                "Step fetch must specify a tool",
                "Step fetch timeout must be positive",
                "Step fetch retry count cannot be negative",
                "Step retry retry delay must be positive when retries are enabled",
            ]
        );
    }

    #[test]
    fn zero_retry_delay_allowed_without_retries() {
        let mut def = valid_workflow();
        def.steps[0].retry_delay = 0;
        assert!(validate_workflow(&def).is_valid());
    }

    #[test]
    fn connection_checks() {
        let mut def = valid_workflow();
        def.connections.push(WorkflowConnection::new(
            "c1",
            "ghost",
            "phantom",
            ConnectionType::Control,
        ));
        def.connections
            .push(WorkflowConnection::new("c2", "save", "save", ConnectionType::Error));

        let errors = validate_workflow(&def).errors;
        assert_eq!(
            errors,
            vec![
                "Duplicate connection ID: c1",
                "Connection c1 references invalid source step: ghost",
                "Connection c1 references invalid target step: phantom",
                "Connection c2 cannot connect step to itself",
            ]
        );
    }

    #[test]
    fn cycle_fails_regardless_of_insertion_order() {
        let edges = [("a", "b"), ("b", "c"), ("c", "a")];
        for rotation in 0..3 {
            let mut rotated = edges.to_vec();
            rotated.rotate_left(rotation);
            let mut def = WorkflowDefinition::new("loop");
            def.steps = ["a", "b", "c"]
                .iter()
                .map(|id| WorkflowStep::new(*id, id.to_uppercase(), "echo"))
                .collect();
            def.connections = rotated
                .iter()
                .enumerate()
                .map(|(i, (s, t))| {
                    WorkflowConnection::new(format!("c{i}"), *s, *t, ConnectionType::Data)
                })
                .collect();

            let report = validate_workflow(&def);
            assert_eq!(report.errors, vec!["Workflow contains cycles"]);
        }
    }

    #[test]
    fn error_edge_back_reference_is_not_a_cycle() {
        let mut def = valid_workflow();
        def.connections
            .push(WorkflowConnection::new("c2", "save", "fetch", ConnectionType::Error));
        assert!(validate_workflow(&def).is_valid());
    }

    #[test]
    fn variables_bounds_and_triggers() {
        let mut def = valid_workflow();
        def.variables = vec![
            WorkflowVariable::new("city", None),
            WorkflowVariable::new("city", None),
        ];
        def.max_execution_time = 0;
        def.max_parallel_steps = -3;
        def.triggers = vec![
            WorkflowTrigger {
                trigger_type: "manual".to_string(),
                configuration: Default::default(),
                enabled: true,
            },
            WorkflowTrigger {
                trigger_type: String::new(),
                configuration: Default::default(),
                enabled: true,
            },
        ];

        let errors = validate_workflow(&def).errors;
        assert_eq!(
            errors,
            vec![
                "Duplicate variable name: city",
                "Maximum execution time must be positive",
                "Maximum parallel steps must be positive",
                "Trigger 1 must have a type",
            ]
        );
    }

    #[test]
    fn invalid_regex_and_unknown_transformation() {
        let mut def = valid_workflow();
        let mut cond = Condition::new("fetch.name", ConditionOperator::RegexMatch, "([a-z");
        cond.id = "k1".to_string();
        def.steps[1].conditions.push(cond);
        def.steps[1].parameter_mappings.push(ParameterMapping {
            source_step_id: "fetch".to_string(),
            source_parameter: "body".to_string(),
            target_parameter: "payload".to_string(),
            transformation: Some("reverse".to_string()),
            default_value: None,
        });

        let errors = validate_workflow(&def).errors;
        assert_eq!(errors.len(), 2);
        assert!(errors[0].starts_with("Step save condition k1 has invalid pattern: "));
        assert_eq!(errors[1], "Step save has unknown transformation: reverse");
    }
}
