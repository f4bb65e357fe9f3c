//! Workflow definition types for mcpflow.
//!
//! A `WorkflowDefinition` is a directed graph of tool-invoking steps joined by
//! typed connections, plus the variables, triggers and execution settings that
//! govern a run. Definitions are owned by the workflow store and persisted as
//! JSON blobs alongside a few indexed columns.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

/// Generate a fresh string identifier for steps, connections and conditions.
pub fn generate_id() -> String {
    Uuid::now_v7().to_string()
}

// ---------------------------------------------------------------------------
// Workflow Definition
// ---------------------------------------------------------------------------

/// A complete workflow graph with its execution settings and statistics.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct WorkflowDefinition {
    /// UUIDv7 assigned at creation.
    #[serde(default = "Uuid::now_v7")]
    pub id: Uuid,
    /// Human-readable workflow name.
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub description: String,
    /// Semantic version string, bumped on every content change.
    #[serde(default = "default_version")]
    pub version: String,
    /// Steps in definition order.
    #[serde(default)]
    pub steps: Vec<WorkflowStep>,
    #[serde(default)]
    pub connections: Vec<WorkflowConnection>,
    #[serde(default)]
    pub variables: Vec<WorkflowVariable>,
    #[serde(default)]
    pub triggers: Vec<WorkflowTrigger>,
    #[serde(default)]
    pub execution_mode: ExecutionMode,
    #[serde(default)]
    pub error_handling: ErrorHandling,
    /// Upper bound in seconds used while waiting on a parallel group.
    #[serde(default = "default_max_execution_time")]
    pub max_execution_time: i64,
    /// Maximum number of steps of one parallel group running at once.
    #[serde(default = "default_max_parallel_steps")]
    pub max_parallel_steps: i64,
    #[serde(default)]
    pub status: WorkflowStatus,
    #[serde(default)]
    pub created_by: String,
    #[serde(default = "Utc::now")]
    pub created_at: DateTime<Utc>,
    #[serde(default = "Utc::now")]
    pub updated_at: DateTime<Utc>,
    #[serde(default)]
    pub tags: Vec<String>,
    #[serde(default = "default_category")]
    pub category: String,
    /// Aggregate execution statistics maintained by the executor.
    #[serde(default)]
    pub stats: WorkflowStats,
}

fn default_version() -> String {
    "1.0.0".to_string()
}

fn default_max_execution_time() -> i64 {
    3600
}

fn default_max_parallel_steps() -> i64 {
    5
}

fn default_category() -> String {
    "general".to_string()
}

impl WorkflowDefinition {
    /// Create an empty draft workflow with default settings.
    pub fn new(name: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::now_v7(),
            name: name.into(),
            description: String::new(),
            version: default_version(),
            steps: Vec::new(),
            connections: Vec::new(),
            variables: Vec::new(),
            triggers: Vec::new(),
            execution_mode: ExecutionMode::default(),
            error_handling: ErrorHandling::default(),
            max_execution_time: default_max_execution_time(),
            max_parallel_steps: default_max_parallel_steps(),
            status: WorkflowStatus::default(),
            created_by: String::new(),
            created_at: now,
            updated_at: now,
            tags: Vec::new(),
            category: default_category(),
            stats: WorkflowStats::default(),
        }
    }

    /// Look up a step by ID.
    pub fn step(&self, step_id: &str) -> Option<&WorkflowStep> {
        self.steps.iter().find(|s| s.id == step_id)
    }

    /// Position of a step in definition order.
    pub fn step_index(&self, step_id: &str) -> Option<usize> {
        self.steps.iter().position(|s| s.id == step_id)
    }

    /// Step IDs this step depends on through data/control connections.
    pub fn dependencies(&self, step_id: &str) -> Vec<&str> {
        self.connections
            .iter()
            .filter(|c| c.connection_type.is_dependency() && c.target_step_id == step_id)
            .map(|c| c.source_step_id.as_str())
            .collect()
    }

    /// Step IDs that depend on this step through data/control connections.
    pub fn dependents(&self, step_id: &str) -> Vec<&str> {
        self.connections
            .iter()
            .filter(|c| c.connection_type.is_dependency() && c.source_step_id == step_id)
            .map(|c| c.target_step_id.as_str())
            .collect()
    }

    /// Default values of all variables that declare one.
    pub fn variable_defaults(&self) -> HashMap<String, Value> {
        self.variables
            .iter()
            .filter_map(|v| v.default_value.clone().map(|d| (v.name.clone(), d)))
            .collect()
    }
}

/// Lifecycle status of a workflow definition.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkflowStatus {
    #[default]
    Draft,
    Active,
    Archived,
}

impl std::fmt::Display for WorkflowStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            WorkflowStatus::Draft => "draft",
            WorkflowStatus::Active => "active",
            WorkflowStatus::Archived => "archived",
        };
        f.write_str(s)
    }
}

/// How the executor orders the steps of a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionMode {
    /// One step at a time in dependency order.
    #[default]
    Sequential,
    /// Steps grouped by `parallel_group`, each group run concurrently.
    Parallel,
    /// Repeatedly run every step whose predecessors have completed.
    Conditional,
    /// Present in stored definitions but not executable.
    Loop,
}

impl std::fmt::Display for ExecutionMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            ExecutionMode::Sequential => "sequential",
            ExecutionMode::Parallel => "parallel",
            ExecutionMode::Conditional => "conditional",
            ExecutionMode::Loop => "loop",
        };
        f.write_str(s)
    }
}

/// Workflow-level reaction to a failed step.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorHandling {
    /// Halt the run on the first failed step.
    #[default]
    Stop,
    /// Keep running the remaining steps.
    Continue,
    /// Same as `Continue` at the workflow level; steps retry per `retry_count`.
    Retry,
}

/// Aggregate execution statistics for a workflow.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct WorkflowStats {
    #[serde(default)]
    pub execution_count: i64,
    #[serde(default)]
    pub success_count: i64,
    /// Rolling average run duration in seconds.
    #[serde(default)]
    pub average_execution_time: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_executed: Option<DateTime<Utc>>,
}

impl WorkflowStats {
    /// Fold one finished run into the statistics.
    pub fn record(&mut self, succeeded: bool, duration_secs: f64, finished_at: DateTime<Utc>) {
        self.execution_count += 1;
        if succeeded {
            self.success_count += 1;
        }
        let n = self.execution_count as f64;
        self.average_execution_time =
            (self.average_execution_time * (n - 1.0) + duration_secs) / n;
        self.last_executed = Some(finished_at);
    }
}

// ---------------------------------------------------------------------------
// Steps
// ---------------------------------------------------------------------------

/// A single unit of work delegated to an external tool.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct WorkflowStep {
    /// Unique within the workflow.
    #[serde(default = "generate_id")]
    pub id: String,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub description: String,
    /// External tool reference; not owned by the workflow.
    #[serde(default)]
    pub tool_id: String,
    /// Static tool parameters.
    #[serde(default)]
    pub parameters: serde_json::Map<String, Value>,
    /// Values pulled from earlier step results into parameters.
    #[serde(default)]
    pub parameter_mappings: Vec<ParameterMapping>,
    /// Seconds to wait for one tool attempt.
    #[serde(default = "default_step_timeout")]
    pub timeout: i64,
    /// Extra attempts after the first failure.
    #[serde(default)]
    pub retry_count: i64,
    /// Seconds between attempts.
    #[serde(default = "default_retry_delay")]
    pub retry_delay: i64,
    #[serde(default)]
    pub conditions: Vec<Condition>,
    #[serde(default)]
    pub condition_logic: ConditionLogic,
    #[serde(default = "default_true")]
    pub enabled: bool,
    /// Skip rather than fail when the conditions do not hold.
    #[serde(default)]
    pub optional: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parallel_group: Option<String>,
}

fn default_step_timeout() -> i64 {
    300
}

fn default_retry_delay() -> i64 {
    5
}

fn default_true() -> bool {
    true
}

impl WorkflowStep {
    /// Create an enabled step with default timeout and retry settings.
    pub fn new(id: impl Into<String>, name: impl Into<String>, tool_id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            description: String::new(),
            tool_id: tool_id.into(),
            parameters: serde_json::Map::new(),
            parameter_mappings: Vec::new(),
            timeout: default_step_timeout(),
            retry_count: 0,
            retry_delay: default_retry_delay(),
            conditions: Vec::new(),
            condition_logic: ConditionLogic::default(),
            enabled: true,
            optional: false,
            parallel_group: None,
        }
    }
}

/// Copies a field of an earlier step's result into a parameter.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ParameterMapping {
    pub source_step_id: String,
    /// Field of the source step's result object.
    pub source_parameter: String,
    pub target_parameter: String,
    /// `uppercase`, `lowercase` or `format:<template>` where `{}` is the value.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub transformation: Option<String>,
    /// Used when the source value is missing or null.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub default_value: Option<Value>,
}

/// A boolean predicate gating a step.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Condition {
    #[serde(default = "generate_id")]
    pub id: String,
    /// `${var}`, `stepId.field` or a literal.
    pub left_operand: String,
    #[serde(default)]
    pub operator: ConditionOperator,
    #[serde(default)]
    pub right_operand: String,
    #[serde(default)]
    pub description: String,
}

impl Condition {
    pub fn new(
        left_operand: impl Into<String>,
        operator: ConditionOperator,
        right_operand: impl Into<String>,
    ) -> Self {
        Self {
            id: generate_id(),
            left_operand: left_operand.into(),
            operator,
            right_operand: right_operand.into(),
            description: String::new(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConditionOperator {
    #[default]
    Equals,
    NotEquals,
    GreaterThan,
    LessThan,
    Contains,
    RegexMatch,
    IsEmpty,
    IsNotEmpty,
}

/// How multiple conditions on one step combine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum ConditionLogic {
    #[default]
    #[serde(rename = "AND", alias = "and")]
    And,
    #[serde(rename = "OR", alias = "or")]
    Or,
}

// ---------------------------------------------------------------------------
// Connections, variables, triggers
// ---------------------------------------------------------------------------

/// A directed edge between two steps.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct WorkflowConnection {
    #[serde(default = "generate_id")]
    pub id: String,
    pub source_step_id: String,
    pub target_step_id: String,
    #[serde(default)]
    pub connection_type: ConnectionType,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source_output: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target_input: Option<String>,
    #[serde(default)]
    pub label: String,
}

impl WorkflowConnection {
    pub fn new(
        id: impl Into<String>,
        source_step_id: impl Into<String>,
        target_step_id: impl Into<String>,
        connection_type: ConnectionType,
    ) -> Self {
        Self {
            id: id.into(),
            source_step_id: source_step_id.into(),
            target_step_id: target_step_id.into(),
            connection_type,
            source_output: None,
            target_input: None,
            label: String::new(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionType {
    #[default]
    Data,
    Control,
    Error,
    Conditional,
}

impl ConnectionType {
    /// Whether the edge orders execution and takes part in cycle detection.
    pub fn is_dependency(self) -> bool {
        matches!(self, ConnectionType::Data | ConnectionType::Control)
    }
}

/// A named workflow variable, referenced as `${name}`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct WorkflowVariable {
    pub name: String,
    #[serde(rename = "type", default = "default_variable_type")]
    pub var_type: String,
    #[serde(default)]
    pub description: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub default_value: Option<Value>,
    #[serde(default)]
    pub required: bool,
}

fn default_variable_type() -> String {
    "string".to_string()
}

impl WorkflowVariable {
    pub fn new(name: impl Into<String>, default_value: Option<Value>) -> Self {
        Self {
            name: name.into(),
            var_type: default_variable_type(),
            description: String::new(),
            default_value,
            required: false,
        }
    }
}

/// How a workflow may be started (manual, schedule, event, webhook).
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct WorkflowTrigger {
    #[serde(default)]
    pub trigger_type: String,
    #[serde(default)]
    pub configuration: serde_json::Map<String, Value>,
    #[serde(default = "default_true")]
    pub enabled: bool,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn minimal_json_fills_defaults() {
        let def: WorkflowDefinition = serde_json::from_value(json!({
            "name": "etl",
            "steps": [{"id": "fetch", "name": "Fetch", "tool_id": "http"}]
        }))
        .unwrap();

        assert_eq!(def.version, "1.0.0");
        assert_eq!(def.execution_mode, ExecutionMode::Sequential);
        assert_eq!(def.error_handling, ErrorHandling::Stop);
        assert_eq!(def.max_execution_time, 3600);
        assert_eq!(def.max_parallel_steps, 5);
        assert_eq!(def.status, WorkflowStatus::Draft);
        assert_eq!(def.category, "general");

        let step = &def.steps[0];
        assert_eq!(step.timeout, 300);
        assert_eq!(step.retry_count, 0);
        assert_eq!(step.retry_delay, 5);
        assert_eq!(step.condition_logic, ConditionLogic::And);
        assert!(step.enabled);
        assert!(!step.optional);
    }

    #[test]
    fn condition_logic_uses_uppercase_names() {
        assert_eq!(serde_json::to_value(ConditionLogic::Or).unwrap(), json!("OR"));
        let parsed: ConditionLogic = serde_json::from_value(json!("and")).unwrap();
        assert_eq!(parsed, ConditionLogic::And);
    }

    #[test]
    fn dependencies_ignore_error_edges() {
        let mut def = WorkflowDefinition::new("deps");
        def.steps.push(WorkflowStep::new("a", "A", "t"));
        def.steps.push(WorkflowStep::new("b", "B", "t"));
        def.steps.push(WorkflowStep::new("c", "C", "t"));
        def.connections
            .push(WorkflowConnection::new("c1", "a", "c", ConnectionType::Data));
        def.connections
            .push(WorkflowConnection::new("c2", "b", "c", ConnectionType::Error));

        assert_eq!(def.dependencies("c"), vec!["a"]);
        assert_eq!(def.dependents("a"), vec!["c"]);
        assert!(def.dependents("b").is_empty());
    }

    #[test]
    fn stats_keep_rolling_average() {
        let mut stats = WorkflowStats::default();
        let now = Utc::now();
        stats.record(true, 2.0, now);
        stats.record(false, 4.0, now);

        assert_eq!(stats.execution_count, 2);
        assert_eq!(stats.success_count, 1);
        assert!((stats.average_execution_time - 3.0).abs() < f64::EPSILON);
        assert_eq!(stats.last_executed, Some(now));
    }

    #[test]
    fn variable_defaults_skip_missing_values() {
        let mut def = WorkflowDefinition::new("vars");
        def.variables.push(WorkflowVariable::new("city", Some(json!("Oslo"))));
        def.variables.push(WorkflowVariable::new("limit", None));

        let defaults = def.variable_defaults();
        assert_eq!(defaults.len(), 1);
        assert_eq!(defaults["city"], json!("Oslo"));
    }
}
