//! SQLite workflow repository implementation.
//!
//! Implements `WorkflowRepository` from `mcpflow-core` using sqlx with split
//! read/write pools. Definitions and templates are stored whole as JSON blobs
//! next to the scalar columns used for filtering; executions and step records
//! keep one column per field with JSON for nested values.

use std::collections::{BTreeMap, HashMap};

use chrono::{DateTime, SecondsFormat, Utc};
use mcpflow_core::repository::workflow::{WorkflowFilter, WorkflowRepository};
use mcpflow_types::error::RepositoryError;
use mcpflow_types::execution::{StepExecutionRecord, StepOutcome, WorkflowExecution};
use mcpflow_types::template::WorkflowTemplate;
use mcpflow_types::workflow::WorkflowDefinition;
use serde::Serialize;
use serde::de::DeserializeOwned;
use serde_json::Value;
use sqlx::Row;
use uuid::Uuid;

use super::pool::DatabasePool;

/// SQLite-backed implementation of `WorkflowRepository`.
pub struct SqliteWorkflowRepository {
    pool: DatabasePool,
}

impl SqliteWorkflowRepository {
    /// Create a new repository backed by the given database pool.
    pub fn new(pool: DatabasePool) -> Self {
        Self { pool }
    }
}

// ---------------------------------------------------------------------------
// Internal row types
// ---------------------------------------------------------------------------

struct JsonBlobRow {
    json: String,
}

impl JsonBlobRow {
    fn from_row(row: &sqlx::sqlite::SqliteRow, column: &str) -> Result<Self, RepositoryError> {
        Ok(Self {
            json: row.try_get(column).map_err(query_error)?,
        })
    }

    fn parse<T: DeserializeOwned>(self, what: &str) -> Result<T, RepositoryError> {
        serde_json::from_str(&self.json)
            .map_err(|e| RepositoryError::Query(format!("invalid {what} JSON: {e}")))
    }
}

struct ExecutionRow {
    id: String,
    workflow_id: String,
    workflow_version: String,
    status: String,
    input_parameters: String,
    variables: String,
    result: Option<String>,
    error_message: Option<String>,
    start_time: Option<String>,
    end_time: Option<String>,
    execution_time: Option<f64>,
    executed_by: String,
    trigger_type: String,
    parent_execution_id: Option<String>,
    step_executions: String,
    created_at: String,
}

impl ExecutionRow {
    fn from_row(row: &sqlx::sqlite::SqliteRow) -> Result<Self, sqlx::Error> {
        Ok(Self {
            id: row.try_get("id")?,
            workflow_id: row.try_get("workflow_id")?,
            workflow_version: row.try_get("workflow_version")?,
            status: row.try_get("status")?,
            input_parameters: row.try_get("input_parameters")?,
            variables: row.try_get("variables")?,
            result: row.try_get("result")?,
            error_message: row.try_get("error_message")?,
            start_time: row.try_get("start_time")?,
            end_time: row.try_get("end_time")?,
            execution_time: row.try_get("execution_time")?,
            executed_by: row.try_get("executed_by")?,
            trigger_type: row.try_get("trigger_type")?,
            parent_execution_id: row.try_get("parent_execution_id")?,
            step_executions: row.try_get("step_executions")?,
            created_at: row.try_get("created_at")?,
        })
    }

    fn into_execution(self) -> Result<WorkflowExecution, RepositoryError> {
        let input_parameters: HashMap<String, Value> = parse_json(&self.input_parameters, "input_parameters")?;
        let variables: HashMap<String, Value> = parse_json(&self.variables, "variables")?;
        let step_executions: BTreeMap<String, StepOutcome> = parse_json(&self.step_executions, "step_executions")?;

        Ok(WorkflowExecution {
            id: parse_uuid(&self.id)?,
            workflow_id: parse_uuid(&self.workflow_id)?,
            workflow_version: self.workflow_version,
            status: parse_enum(&self.status, "execution status")?,
            input_parameters,
            variables,
            result: self.result.as_deref().map(|s| parse_json(s, "result")).transpose()?,
            error_message: self.error_message,
            start_time: self.start_time.as_deref().map(parse_datetime).transpose()?,
            end_time: self.end_time.as_deref().map(parse_datetime).transpose()?,
            execution_time: self.execution_time,
            step_executions,
            executed_by: self.executed_by,
            trigger_type: self.trigger_type,
            parent_execution_id: self.parent_execution_id.as_deref().map(parse_uuid).transpose()?,
            created_at: parse_datetime(&self.created_at)?,
        })
    }
}

struct StepRow {
    id: String,
    workflow_execution_id: String,
    step_id: String,
    tool_id: String,
    status: String,
    parameters: String,
    result: Option<String>,
    error_message: Option<String>,
    start_time: Option<String>,
    end_time: Option<String>,
    execution_time: Option<f64>,
    retry_count: i64,
}

impl StepRow {
    fn from_row(row: &sqlx::sqlite::SqliteRow) -> Result<Self, sqlx::Error> {
        Ok(Self {
            id: row.try_get("id")?,
            workflow_execution_id: row.try_get("workflow_execution_id")?,
            step_id: row.try_get("step_id")?,
            tool_id: row.try_get("tool_id")?,
            status: row.try_get("status")?,
            parameters: row.try_get("parameters")?,
            result: row.try_get("result")?,
            error_message: row.try_get("error_message")?,
            start_time: row.try_get("start_time")?,
            end_time: row.try_get("end_time")?,
            execution_time: row.try_get("execution_time")?,
            retry_count: row.try_get("retry_count")?,
        })
    }

    fn into_record(self) -> Result<StepExecutionRecord, RepositoryError> {
        Ok(StepExecutionRecord {
            id: parse_uuid(&self.id)?,
            execution_id: parse_uuid(&self.workflow_execution_id)?,
            step_id: self.step_id,
            tool_id: self.tool_id,
            status: parse_enum(&self.status, "step status")?,
            parameters: parse_json(&self.parameters, "step parameters")?,
            result: self.result.as_deref().map(|s| parse_json(s, "step result")).transpose()?,
            error_message: self.error_message,
            start_time: self.start_time.as_deref().map(parse_datetime).transpose()?,
            end_time: self.end_time.as_deref().map(parse_datetime).transpose()?,
            execution_time: self.execution_time,
            retry_count: u32::try_from(self.retry_count).unwrap_or(0),
        })
    }
}

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

fn query_error(e: sqlx::Error) -> RepositoryError {
    RepositoryError::Query(e.to_string())
}

fn parse_uuid(s: &str) -> Result<Uuid, RepositoryError> {
    s.parse::<Uuid>()
        .map_err(|e| RepositoryError::Query(format!("invalid UUID: {e}")))
}

fn parse_datetime(s: &str) -> Result<DateTime<Utc>, RepositoryError> {
    DateTime::parse_from_rfc3339(s)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| RepositoryError::Query(format!("invalid datetime: {e}")))
}

/// Fixed-width RFC 3339 so that text ordering matches time ordering.
fn format_datetime(dt: &DateTime<Utc>) -> String {
    dt.to_rfc3339_opts(SecondsFormat::Micros, true)
}

fn parse_json<T: DeserializeOwned>(s: &str, what: &str) -> Result<T, RepositoryError> {
    serde_json::from_str(s).map_err(|e| RepositoryError::Query(format!("invalid {what} JSON: {e}")))
}

fn to_json<T: Serialize + ?Sized>(value: &T) -> Result<String, RepositoryError> {
    serde_json::to_string(value).map_err(|e| RepositoryError::Query(format!("serialize: {e}")))
}

/// The serde name of a unit enum variant, e.g. `ExecutionStatus::Active` -> `"active"`.
fn enum_str<T: Serialize>(value: &T) -> Result<String, RepositoryError> {
    match serde_json::to_value(value) {
        Ok(Value::String(s)) => Ok(s),
        Ok(other) => Err(RepositoryError::Query(format!("not a unit variant: {other}"))),
        Err(e) => Err(RepositoryError::Query(e.to_string())),
    }
}

fn parse_enum<T: DeserializeOwned>(s: &str, what: &str) -> Result<T, RepositoryError> {
    serde_json::from_value(Value::String(s.to_string()))
        .map_err(|_| RepositoryError::Query(format!("invalid {what}: {s}")))
}

// ---------------------------------------------------------------------------
// WorkflowRepository impl
// ---------------------------------------------------------------------------

impl WorkflowRepository for SqliteWorkflowRepository {
    async fn save_definition(&self, def: &WorkflowDefinition) -> Result<(), RepositoryError> {
        sqlx::query(
            r#"INSERT INTO workflow_definitions
               (id, name, description, version, definition_json, status, created_by,
                created_at, updated_at, tags, category, execution_count, success_count,
                average_execution_time, last_executed)
               VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
               ON CONFLICT(id) DO UPDATE SET
                 name = excluded.name,
                 description = excluded.description,
                 version = excluded.version,
                 definition_json = excluded.definition_json,
                 status = excluded.status,
                 created_by = excluded.created_by,
                 updated_at = excluded.updated_at,
                 tags = excluded.tags,
                 category = excluded.category,
                 execution_count = excluded.execution_count,
                 success_count = excluded.success_count,
                 average_execution_time = excluded.average_execution_time,
                 last_executed = excluded.last_executed"#,
        )
        .bind(def.id.to_string())
        .bind(&def.name)
        .bind(&def.description)
        .bind(&def.version)
        .bind(to_json(def)?)
        .bind(enum_str(&def.status)?)
        .bind(&def.created_by)
        .bind(format_datetime(&def.created_at))
        .bind(format_datetime(&def.updated_at))
        .bind(to_json(&def.tags)?)
        .bind(&def.category)
        .bind(def.stats.execution_count)
        .bind(def.stats.success_count)
        .bind(def.stats.average_execution_time)
        .bind(def.stats.last_executed.as_ref().map(format_datetime))
        .execute(&self.pool.writer)
        .await
        .map_err(query_error)?;

        Ok(())
    }

    async fn get_definition(&self, id: &Uuid) -> Result<Option<WorkflowDefinition>, RepositoryError> {
        let row = sqlx::query("SELECT definition_json FROM workflow_definitions WHERE id = ?")
            .bind(id.to_string())
            .fetch_optional(&self.pool.reader)
            .await
            .map_err(query_error)?;

        row.map(|row| JsonBlobRow::from_row(&row, "definition_json")?.parse("workflow definition"))
            .transpose()
    }

    async fn list_definitions(&self, filter: &WorkflowFilter) -> Result<Vec<WorkflowDefinition>, RepositoryError> {
        let status = filter.status.as_ref().map(enum_str).transpose()?;

        let rows = sqlx::query(
            r#"SELECT definition_json FROM workflow_definitions
               WHERE (?1 IS NULL OR status = ?1)
                 AND (?2 IS NULL OR category = ?2)
                 AND (?3 IS NULL OR created_by = ?3)
               ORDER BY updated_at DESC, id DESC"#,
        )
        .bind(status)
        .bind(filter.category.as_deref())
        .bind(filter.created_by.as_deref())
        .fetch_all(&self.pool.reader)
        .await
        .map_err(query_error)?;

        let mut defs = Vec::with_capacity(rows.len());
        for row in &rows {
            defs.push(JsonBlobRow::from_row(row, "definition_json")?.parse("workflow definition")?);
        }
        Ok(defs)
    }

    async fn delete_definition(&self, id: &Uuid) -> Result<bool, RepositoryError> {
        let result = sqlx::query("DELETE FROM workflow_definitions WHERE id = ?")
            .bind(id.to_string())
            .execute(&self.pool.writer)
            .await
            .map_err(query_error)?;

        Ok(result.rows_affected() > 0)
    }

    async fn save_execution(&self, execution: &WorkflowExecution) -> Result<(), RepositoryError> {
        sqlx::query(
            r#"INSERT INTO workflow_executions
               (id, workflow_id, workflow_version, status, input_parameters, variables, result,
                error_message, start_time, end_time, execution_time, executed_by, trigger_type,
                parent_execution_id, step_executions, created_at)
               VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
               ON CONFLICT(id) DO UPDATE SET
                 status = excluded.status,
                 variables = excluded.variables,
                 result = excluded.result,
                 error_message = excluded.error_message,
                 start_time = excluded.start_time,
                 end_time = excluded.end_time,
                 execution_time = excluded.execution_time,
                 step_executions = excluded.step_executions"#,
        )
        .bind(execution.id.to_string())
        .bind(execution.workflow_id.to_string())
        .bind(&execution.workflow_version)
        .bind(enum_str(&execution.status)?)
        .bind(to_json(&execution.input_parameters)?)
        .bind(to_json(&execution.variables)?)
        .bind(execution.result.as_ref().map(to_json).transpose()?)
        .bind(&execution.error_message)
        .bind(execution.start_time.as_ref().map(format_datetime))
        .bind(execution.end_time.as_ref().map(format_datetime))
        .bind(execution.execution_time)
        .bind(&execution.executed_by)
        .bind(&execution.trigger_type)
        .bind(execution.parent_execution_id.map(|id| id.to_string()))
        .bind(to_json(&execution.step_executions)?)
        .bind(format_datetime(&execution.created_at))
        .execute(&self.pool.writer)
        .await
        .map_err(query_error)?;

        Ok(())
    }

    async fn get_execution(&self, id: &Uuid) -> Result<Option<WorkflowExecution>, RepositoryError> {
        let row = sqlx::query("SELECT * FROM workflow_executions WHERE id = ?")
            .bind(id.to_string())
            .fetch_optional(&self.pool.reader)
            .await
            .map_err(query_error)?;

        match row {
            Some(row) => {
                let r = ExecutionRow::from_row(&row).map_err(query_error)?;
                Ok(Some(r.into_execution()?))
            }
            None => Ok(None),
        }
    }

    async fn list_executions(
        &self,
        workflow_id: Option<&Uuid>,
        limit: u32,
    ) -> Result<Vec<WorkflowExecution>, RepositoryError> {
        let rows = sqlx::query(
            r#"SELECT * FROM workflow_executions
               WHERE (?1 IS NULL OR workflow_id = ?1)
               ORDER BY created_at DESC, id DESC
               LIMIT ?2"#,
        )
        .bind(workflow_id.map(|id| id.to_string()))
        .bind(i64::from(limit))
        .fetch_all(&self.pool.reader)
        .await
        .map_err(query_error)?;

        let mut executions = Vec::with_capacity(rows.len());
        for row in &rows {
            let r = ExecutionRow::from_row(row).map_err(query_error)?;
            executions.push(r.into_execution()?);
        }
        Ok(executions)
    }

    async fn count_executions_by_status(
        &self,
        workflow_id: Option<&Uuid>,
    ) -> Result<BTreeMap<String, u64>, RepositoryError> {
        let rows = sqlx::query(
            r#"SELECT status, COUNT(*) AS n FROM workflow_executions
               WHERE (?1 IS NULL OR workflow_id = ?1)
               GROUP BY status"#,
        )
        .bind(workflow_id.map(|id| id.to_string()))
        .fetch_all(&self.pool.reader)
        .await
        .map_err(query_error)?;

        let mut counts = BTreeMap::new();
        for row in &rows {
            let status: String = row.try_get("status").map_err(query_error)?;
            let n: i64 = row.try_get("n").map_err(query_error)?;
            counts.insert(status, u64::try_from(n).unwrap_or(0));
        }
        Ok(counts)
    }

    async fn average_execution_time(&self, workflow_id: Option<&Uuid>) -> Result<f64, RepositoryError> {
        let row = sqlx::query(
            r#"SELECT AVG(execution_time) AS avg_time FROM workflow_executions
               WHERE execution_time IS NOT NULL AND (?1 IS NULL OR workflow_id = ?1)"#,
        )
        .bind(workflow_id.map(|id| id.to_string()))
        .fetch_one(&self.pool.reader)
        .await
        .map_err(query_error)?;

        let avg: Option<f64> = row.try_get("avg_time").map_err(query_error)?;
        Ok(avg.unwrap_or(0.0))
    }

    async fn save_step_execution(&self, record: &StepExecutionRecord) -> Result<(), RepositoryError> {
        sqlx::query(
            r#"INSERT INTO workflow_step_executions
               (id, workflow_execution_id, step_id, tool_id, status, parameters, result,
                error_message, start_time, end_time, execution_time, retry_count)
               VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
               ON CONFLICT(id) DO UPDATE SET
                 status = excluded.status,
                 parameters = excluded.parameters,
                 result = excluded.result,
                 error_message = excluded.error_message,
                 start_time = excluded.start_time,
                 end_time = excluded.end_time,
                 execution_time = excluded.execution_time,
                 retry_count = excluded.retry_count"#,
        )
        .bind(record.id.to_string())
        .bind(record.execution_id.to_string())
        .bind(&record.step_id)
        .bind(&record.tool_id)
        .bind(enum_str(&record.status)?)
        .bind(to_json(&record.parameters)?)
        .bind(record.result.as_ref().map(to_json).transpose()?)
        .bind(&record.error_message)
        .bind(record.start_time.as_ref().map(format_datetime))
        .bind(record.end_time.as_ref().map(format_datetime))
        .bind(record.execution_time)
        .bind(i64::from(record.retry_count))
        .execute(&self.pool.writer)
        .await
        .map_err(query_error)?;

        Ok(())
    }

    async fn list_step_executions(&self, execution_id: &Uuid) -> Result<Vec<StepExecutionRecord>, RepositoryError> {
        let rows = sqlx::query(
            "SELECT * FROM workflow_step_executions WHERE workflow_execution_id = ? ORDER BY start_time ASC, id ASC",
        )
        .bind(execution_id.to_string())
        .fetch_all(&self.pool.reader)
        .await
        .map_err(query_error)?;

        let mut records = Vec::with_capacity(rows.len());
        for row in &rows {
            let r = StepRow::from_row(row).map_err(query_error)?;
            records.push(r.into_record()?);
        }
        Ok(records)
    }

    async fn save_template(&self, template: &WorkflowTemplate) -> Result<(), RepositoryError> {
        sqlx::query(
            r#"INSERT INTO workflow_templates
               (id, name, description, category, tags, template_json, author, version,
                created_at, updated_at, usage_count, parameters, requirements)
               VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
               ON CONFLICT(id) DO UPDATE SET
                 name = excluded.name,
                 description = excluded.description,
                 category = excluded.category,
                 tags = excluded.tags,
                 template_json = excluded.template_json,
                 author = excluded.author,
                 version = excluded.version,
                 updated_at = excluded.updated_at,
                 usage_count = excluded.usage_count,
                 parameters = excluded.parameters,
                 requirements = excluded.requirements"#,
        )
        .bind(template.id.to_string())
        .bind(&template.name)
        .bind(&template.description)
        .bind(&template.category)
        .bind(to_json(&template.tags)?)
        .bind(to_json(template)?)
        .bind(&template.author)
        .bind(&template.version)
        .bind(format_datetime(&template.created_at))
        .bind(format_datetime(&template.updated_at))
        .bind(template.usage_count)
        .bind(to_json(&template.parameters)?)
        .bind(to_json(&template.requirements)?)
        .execute(&self.pool.writer)
        .await
        .map_err(query_error)?;

        Ok(())
    }

    async fn get_template(&self, id: &Uuid) -> Result<Option<WorkflowTemplate>, RepositoryError> {
        let row = sqlx::query("SELECT template_json FROM workflow_templates WHERE id = ?")
            .bind(id.to_string())
            .fetch_optional(&self.pool.reader)
            .await
            .map_err(query_error)?;

        row.map(|row| JsonBlobRow::from_row(&row, "template_json")?.parse("workflow template"))
            .transpose()
    }

    async fn list_templates(&self, category: Option<&str>) -> Result<Vec<WorkflowTemplate>, RepositoryError> {
        let rows = sqlx::query(
            r#"SELECT template_json FROM workflow_templates
               WHERE (?1 IS NULL OR category = ?1)
               ORDER BY name ASC, id ASC"#,
        )
        .bind(category)
        .fetch_all(&self.pool.reader)
        .await
        .map_err(query_error)?;

        let mut templates = Vec::with_capacity(rows.len());
        for row in &rows {
            templates.push(JsonBlobRow::from_row(row, "template_json")?.parse("workflow template")?);
        }
        Ok(templates)
    }

    async fn delete_template(&self, id: &Uuid) -> Result<bool, RepositoryError> {
        let result = sqlx::query("DELETE FROM workflow_templates WHERE id = ?")
            .bind(id.to_string())
            .execute(&self.pool.writer)
            .await
            .map_err(query_error)?;

        Ok(result.rows_affected() > 0)
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
