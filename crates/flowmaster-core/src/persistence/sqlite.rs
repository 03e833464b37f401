// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! SQLite-backed persistence implementation.

use std::path::Path;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use sqlx::sqlite::{SqliteConnection, SqlitePoolOptions, SqliteRow};
use sqlx::{Row, SqlitePool};

use crate::error::CoreError;
use crate::model::{
    AcquireOutcome, ClaimState, Command, ErrorCommand, Lookup, NewCommand, TaskGroup,
    TaskGroupClaim, TaskInstance, WorkflowDefinition, WorkflowInstance, WorkflowState,
};

use super::Persistence;

static MIGRATOR: sqlx::migrate::Migrator = sqlx::migrate!("./migrations/sqlite");

const COMMAND_COLUMNS: &str = "id, command_type, workflow_code, workflow_version, \
     workflow_instance_id, warning_policy, failure_strategy, params, created_at";

const INSTANCE_COLUMNS: &str = "id, name, workflow_code, workflow_version, state, \
     command_type, host, start_time, restart_time, end_time, timeout_secs, \
     failure_strategy, warning_policy, is_sub_workflow, run_times, params";

const TASK_COLUMNS: &str = "id, workflow_instance_id, name, task_code, task_version, \
     task_type, state, host, retry_times, max_retry_times, retry_interval_secs, \
     task_group_id, timeout_secs, timeout_strategy, submit_time, start_time, end_time, \
     active, params";

const CLAIM_COLUMNS: &str =
    "id, group_id, workflow_instance_id, task_instance_id, state, created_at, updated_at";

/// SQLite-backed persistence provider.
#[derive(Clone)]
pub struct SqlitePersistence {
    pool: SqlitePool,
}

impl SqlitePersistence {
    /// Create a new SQLite persistence provider from an existing pool.
    ///
    /// The schema is expected to be migrated already; see [`Self::migrate`].
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Create and initialize a new SQLite persistence from a file path.
    ///
    /// Creates parent directories and the database file when missing, then
    /// runs all migrations.
    ///
    /// ```ignore
    /// let persistence = SqlitePersistence::from_path(".data/flowmaster.db").await?;
    /// ```
    pub async fn from_path(path: impl AsRef<Path>) -> Result<Self, CoreError> {
        let path = path.as_ref();

        if let Some(parent) = path.parent()
            && !parent.as_os_str().is_empty()
        {
            std::fs::create_dir_all(parent).map_err(|e| CoreError::DatabaseError {
                operation: "create_dir".to_string(),
                details: format!("Failed to create directory {:?}: {}", parent, e),
            })?;
        }

        let url = format!("sqlite:{}?mode=rwc", path.to_string_lossy());
        Self::connect(&url, 5).await
    }

    /// Connect to a database URL (`sqlite:...`) and run migrations.
    pub async fn connect(url: &str, max_connections: u32) -> Result<Self, CoreError> {
        let pool = SqlitePoolOptions::new()
            .max_connections(max_connections)
            .connect(url)
            .await
            .map_err(|e| CoreError::DatabaseError {
                operation: "connect".to_string(),
                details: format!("Failed to connect to SQLite at {}: {}", url, e),
            })?;

        let persistence = Self { pool };
        persistence.migrate().await?;
        Ok(persistence)
    }

    /// A private in-memory database, migrated. Used by tests and demos.
    ///
    /// The pool is pinned to one connection because every SQLite memory
    /// connection is its own database.
    pub async fn in_memory() -> Result<Self, CoreError> {
        Self::connect("sqlite::memory:", 1).await
    }

    /// Run pending migrations.
    pub async fn migrate(&self) -> Result<(), CoreError> {
        MIGRATOR
            .run(&self.pool)
            .await
            .map_err(|e| CoreError::DatabaseError {
                operation: "migrate".to_string(),
                details: format!("Failed to run migrations: {}", e),
            })
    }

    /// The underlying pool.
    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }
}

// ============================================================================
// Row mapping
// ============================================================================

fn text<T>(row: &SqliteRow, column: &str) -> Result<T, CoreError>
where
    T: FromStr<Err = CoreError>,
{
    let raw: String = row.try_get(column)?;
    raw.parse()
}

fn optional_text<T>(row: &SqliteRow, column: &str) -> Result<Option<T>, CoreError>
where
    T: FromStr<Err = CoreError>,
{
    let raw: Option<String> = row.try_get(column)?;
    raw.map(|value| value.parse()).transpose()
}

fn json(row: &SqliteRow, column: &str) -> Result<serde_json::Value, CoreError> {
    let raw: String = row.try_get(column)?;
    Ok(serde_json::from_str(&raw)?)
}

fn command_from_row(row: &SqliteRow) -> Result<Command, CoreError> {
    Ok(Command {
        id: row.try_get("id")?,
        command_type: text(row, "command_type")?,
        workflow_code: row.try_get("workflow_code")?,
        workflow_version: row.try_get("workflow_version")?,
        workflow_instance_id: row.try_get("workflow_instance_id")?,
        warning_policy: text(row, "warning_policy")?,
        failure_strategy: optional_text(row, "failure_strategy")?,
        params: json(row, "params")?,
        created_at: row.try_get("created_at")?,
    })
}

fn instance_from_row(row: &SqliteRow) -> Result<WorkflowInstance, CoreError> {
    Ok(WorkflowInstance {
        id: row.try_get("id")?,
        name: row.try_get("name")?,
        workflow_code: row.try_get("workflow_code")?,
        workflow_version: row.try_get("workflow_version")?,
        state: text(row, "state")?,
        command_type: text(row, "command_type")?,
        host: row.try_get("host")?,
        start_time: row.try_get("start_time")?,
        restart_time: row.try_get("restart_time")?,
        end_time: row.try_get("end_time")?,
        timeout_secs: row.try_get("timeout_secs")?,
        failure_strategy: text(row, "failure_strategy")?,
        warning_policy: text(row, "warning_policy")?,
        is_sub_workflow: row.try_get("is_sub_workflow")?,
        run_times: row.try_get("run_times")?,
        params: json(row, "params")?,
    })
}

fn task_from_row(row: &SqliteRow) -> Result<TaskInstance, CoreError> {
    Ok(TaskInstance {
        id: row.try_get("id")?,
        workflow_instance_id: row.try_get("workflow_instance_id")?,
        name: row.try_get("name")?,
        task_code: row.try_get("task_code")?,
        task_version: row.try_get("task_version")?,
        task_type: row.try_get("task_type")?,
        state: text(row, "state")?,
        host: row.try_get("host")?,
        retry_times: row.try_get("retry_times")?,
        max_retry_times: row.try_get("max_retry_times")?,
        retry_interval_secs: row.try_get("retry_interval_secs")?,
        task_group_id: row.try_get("task_group_id")?,
        timeout_secs: row.try_get("timeout_secs")?,
        timeout_strategy: optional_text(row, "timeout_strategy")?,
        submit_time: row.try_get("submit_time")?,
        start_time: row.try_get("start_time")?,
        end_time: row.try_get("end_time")?,
        active: row.try_get("active")?,
        params: json(row, "params")?,
    })
}

fn claim_from_row(row: &SqliteRow) -> Result<TaskGroupClaim, CoreError> {
    Ok(TaskGroupClaim {
        id: row.try_get("id")?,
        group_id: row.try_get("group_id")?,
        workflow_instance_id: row.try_get("workflow_instance_id")?,
        task_instance_id: row.try_get("task_instance_id")?,
        state: text(row, "state")?,
        created_at: row.try_get("created_at")?,
        updated_at: row.try_get("updated_at")?,
    })
}

fn unfinished_states_sql() -> String {
    WorkflowState::unfinished()
        .iter()
        .map(|state| format!("'{}'", state.as_str()))
        .collect::<Vec<_>>()
        .join(", ")
}

// ============================================================================
// Statements shared between pool and transaction callers
// ============================================================================

async fn insert_instance(
    conn: &mut SqliteConnection,
    instance: &WorkflowInstance,
) -> Result<i64, CoreError> {
    let result = sqlx::query(
        r#"
        INSERT INTO workflow_instances (
            name, workflow_code, workflow_version, state, command_type, host,
            start_time, restart_time, end_time, timeout_secs, failure_strategy,
            warning_policy, is_sub_workflow, run_times, params
        )
        VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
        "#,
    )
    .bind(&instance.name)
    .bind(instance.workflow_code)
    .bind(instance.workflow_version)
    .bind(instance.state.as_str())
    .bind(instance.command_type.as_str())
    .bind(&instance.host)
    .bind(instance.start_time)
    .bind(instance.restart_time)
    .bind(instance.end_time)
    .bind(instance.timeout_secs)
    .bind(instance.failure_strategy.as_str())
    .bind(instance.warning_policy.as_str())
    .bind(instance.is_sub_workflow)
    .bind(instance.run_times)
    .bind(serde_json::to_string(&instance.params)?)
    .execute(&mut *conn)
    .await?;

    Ok(result.last_insert_rowid())
}

async fn update_instance(
    conn: &mut SqliteConnection,
    instance: &WorkflowInstance,
) -> Result<u64, CoreError> {
    let result = sqlx::query(
        r#"
        UPDATE workflow_instances
        SET name = ?, state = ?, command_type = ?, host = ?, start_time = ?,
            restart_time = ?, end_time = ?, timeout_secs = ?, failure_strategy = ?,
            warning_policy = ?, is_sub_workflow = ?, run_times = ?, params = ?
        WHERE id = ?
        "#,
    )
    .bind(&instance.name)
    .bind(instance.state.as_str())
    .bind(instance.command_type.as_str())
    .bind(&instance.host)
    .bind(instance.start_time)
    .bind(instance.restart_time)
    .bind(instance.end_time)
    .bind(instance.timeout_secs)
    .bind(instance.failure_strategy.as_str())
    .bind(instance.warning_policy.as_str())
    .bind(instance.is_sub_workflow)
    .bind(instance.run_times)
    .bind(serde_json::to_string(&instance.params)?)
    .bind(instance.id)
    .execute(&mut *conn)
    .await?;

    Ok(result.rows_affected())
}

async fn find_live_claim(
    conn: &mut SqliteConnection,
    task_instance_id: i64,
) -> Result<Option<TaskGroupClaim>, CoreError> {
    let sql = format!(
        "SELECT {CLAIM_COLUMNS} FROM task_group_queue \
         WHERE task_instance_id = ? AND state != ? ORDER BY id DESC LIMIT 1"
    );
    sqlx::query(&sql)
        .bind(task_instance_id)
        .bind(ClaimState::Released.as_str())
        .fetch_optional(&mut *conn)
        .await?
        .as_ref()
        .map(claim_from_row)
        .transpose()
}

#[async_trait::async_trait]
impl Persistence for SqlitePersistence {
    async fn insert_command(&self, command: &NewCommand) -> Result<i64, CoreError> {
        let result = sqlx::query(
            r#"
            INSERT INTO commands (
                command_type, workflow_code, workflow_version, workflow_instance_id,
                warning_policy, failure_strategy, params, created_at
            )
            VALUES (?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(command.command_type.as_str())
        .bind(command.workflow_code)
        .bind(command.workflow_version)
        .bind(command.workflow_instance_id)
        .bind(command.warning_policy.as_str())
        .bind(command.failure_strategy.map(|s| s.as_str()))
        .bind(serde_json::to_string(&command.params)?)
        .bind(Utc::now())
        .execute(&self.pool)
        .await?;

        Ok(result.last_insert_rowid())
    }

    async fn find_pending_commands(
        &self,
        page_size: i64,
        page_no: i64,
        slot_count: i64,
        slot_index: i64,
    ) -> Result<Vec<Command>, CoreError> {
        if slot_count <= 0 || page_size <= 0 {
            return Ok(Vec::new());
        }

        let sql = format!(
            "SELECT {COMMAND_COLUMNS} FROM commands \
             WHERE id % ? = ? ORDER BY id ASC LIMIT ? OFFSET ?"
        );
        let rows = sqlx::query(&sql)
            .bind(slot_count)
            .bind(slot_index)
            .bind(page_size)
            .bind(page_size * page_no.max(0))
            .fetch_all(&self.pool)
            .await?;

        rows.iter().map(command_from_row).collect()
    }

    async fn move_to_error_command(
        &self,
        command: &Command,
        reason: &str,
    ) -> Result<(), CoreError> {
        let mut tx = self.pool.begin().await?;

        sqlx::query(
            r#"
            INSERT OR REPLACE INTO error_commands (
                id, command_type, workflow_code, workflow_version, workflow_instance_id,
                warning_policy, failure_strategy, params, created_at, message, failed_at
            )
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(command.id)
        .bind(command.command_type.as_str())
        .bind(command.workflow_code)
        .bind(command.workflow_version)
        .bind(command.workflow_instance_id)
        .bind(command.warning_policy.as_str())
        .bind(command.failure_strategy.map(|s| s.as_str()))
        .bind(serde_json::to_string(&command.params)?)
        .bind(command.created_at)
        .bind(reason)
        .bind(Utc::now())
        .execute(&mut *tx)
        .await?;

        sqlx::query("DELETE FROM commands WHERE id = ?")
            .bind(command.id)
            .execute(&mut *tx)
            .await?;

        tx.commit().await?;
        Ok(())
    }

    async fn list_error_commands(&self) -> Result<Vec<ErrorCommand>, CoreError> {
        let sql = format!(
            "SELECT {COMMAND_COLUMNS}, message, failed_at FROM error_commands ORDER BY id ASC"
        );
        let rows = sqlx::query(&sql).fetch_all(&self.pool).await?;

        rows.iter()
            .map(|row| -> Result<ErrorCommand, CoreError> {
                Ok(ErrorCommand {
                    command: command_from_row(row)?,
                    message: row.try_get("message")?,
                    failed_at: row.try_get("failed_at")?,
                })
            })
            .collect()
    }

    async fn consume_command(
        &self,
        command_id: i64,
        instance: &WorkflowInstance,
    ) -> Result<Lookup<i64>, CoreError> {
        let mut tx = self.pool.begin().await?;

        let deleted = sqlx::query("DELETE FROM commands WHERE id = ?")
            .bind(command_id)
            .execute(&mut *tx)
            .await?;
        if deleted.rows_affected() == 0 {
            tx.rollback().await?;
            return Ok(Lookup::Conflict(format!(
                "command {} was already consumed",
                command_id
            )));
        }

        let instance_id = if instance.id == 0 {
            insert_instance(&mut tx, instance).await?
        } else {
            if update_instance(&mut tx, instance).await? == 0 {
                tx.rollback().await?;
                return Ok(Lookup::NotFound);
            }
            instance.id
        };

        tx.commit().await?;
        Ok(Lookup::Found(instance_id))
    }

    async fn save_workflow_definition(
        &self,
        definition: &WorkflowDefinition,
    ) -> Result<(), CoreError> {
        sqlx::query(
            r#"
            INSERT INTO workflow_definitions (code, version, name, definition, updated_at)
            VALUES (?, ?, ?, ?, ?)
            ON CONFLICT (code, version) DO UPDATE SET
                name = excluded.name,
                definition = excluded.definition,
                updated_at = excluded.updated_at
            "#,
        )
        .bind(definition.code)
        .bind(definition.version)
        .bind(&definition.name)
        .bind(serde_json::to_string(definition)?)
        .bind(Utc::now())
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn find_workflow_definition(
        &self,
        code: i64,
        version: i32,
    ) -> Result<Option<WorkflowDefinition>, CoreError> {
        let raw: Option<String> = sqlx::query_scalar(
            "SELECT definition FROM workflow_definitions WHERE code = ? AND version = ?",
        )
        .bind(code)
        .bind(version)
        .fetch_optional(&self.pool)
        .await?;

        match raw {
            Some(raw) => Ok(Some(serde_json::from_str(&raw)?)),
            None => Ok(None),
        }
    }

    async fn find_workflow_instance(
        &self,
        workflow_instance_id: i64,
    ) -> Result<Option<WorkflowInstance>, CoreError> {
        let sql = format!("SELECT {INSTANCE_COLUMNS} FROM workflow_instances WHERE id = ?");
        sqlx::query(&sql)
            .bind(workflow_instance_id)
            .fetch_optional(&self.pool)
            .await?
            .as_ref()
            .map(instance_from_row)
            .transpose()
    }

    async fn insert_workflow_instance(
        &self,
        instance: &WorkflowInstance,
    ) -> Result<i64, CoreError> {
        let mut conn = self.pool.acquire().await?;
        insert_instance(&mut conn, instance).await
    }

    async fn update_workflow_instance(
        &self,
        instance: &WorkflowInstance,
    ) -> Result<(), CoreError> {
        let mut conn = self.pool.acquire().await?;
        if update_instance(&mut conn, instance).await? == 0 {
            return Err(CoreError::WorkflowInstanceNotFound {
                workflow_instance_id: instance.id,
            });
        }
        Ok(())
    }

    async fn find_unfinished_instances_by_host(
        &self,
        host: &str,
    ) -> Result<Vec<WorkflowInstance>, CoreError> {
        let sql = format!(
            "SELECT {INSTANCE_COLUMNS} FROM workflow_instances \
             WHERE host = ? AND state IN ({}) ORDER BY id ASC",
            unfinished_states_sql()
        );
        let rows = sqlx::query(&sql).bind(host).fetch_all(&self.pool).await?;
        rows.iter().map(instance_from_row).collect()
    }

    async fn list_unfinished_instance_hosts(&self) -> Result<Vec<String>, CoreError> {
        let sql = format!(
            "SELECT DISTINCT host FROM workflow_instances \
             WHERE host IS NOT NULL AND state IN ({}) ORDER BY host",
            unfinished_states_sql()
        );
        Ok(sqlx::query_scalar(&sql).fetch_all(&self.pool).await?)
    }

    async fn transfer_workflow_instance_host(
        &self,
        workflow_instance_id: i64,
        expected_host: &str,
        new_host: &str,
        restart_time: DateTime<Utc>,
    ) -> Result<bool, CoreError> {
        let sql = format!(
            "UPDATE workflow_instances SET host = ?, restart_time = ? \
             WHERE id = ? AND host = ? AND state IN ({})",
            unfinished_states_sql()
        );
        let result = sqlx::query(&sql)
            .bind(new_host)
            .bind(restart_time)
            .bind(workflow_instance_id)
            .bind(expected_host)
            .execute(&self.pool)
            .await?;

        Ok(result.rows_affected() == 1)
    }

    async fn insert_task_instance(&self, task: &TaskInstance) -> Result<i64, CoreError> {
        let result = sqlx::query(
            r#"
            INSERT INTO task_instances (
                workflow_instance_id, name, task_code, task_version, task_type, state,
                host, retry_times, max_retry_times, retry_interval_secs, task_group_id,
                timeout_secs, timeout_strategy, submit_time, start_time, end_time,
                active, params
            )
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(task.workflow_instance_id)
        .bind(&task.name)
        .bind(task.task_code)
        .bind(task.task_version)
        .bind(&task.task_type)
        .bind(task.state.as_str())
        .bind(&task.host)
        .bind(task.retry_times)
        .bind(task.max_retry_times)
        .bind(task.retry_interval_secs)
        .bind(task.task_group_id)
        .bind(task.timeout_secs)
        .bind(task.timeout_strategy.map(|s| s.as_str()))
        .bind(task.submit_time)
        .bind(task.start_time)
        .bind(task.end_time)
        .bind(task.active)
        .bind(serde_json::to_string(&task.params)?)
        .execute(&self.pool)
        .await?;

        Ok(result.last_insert_rowid())
    }

    async fn update_task_instance(&self, task: &TaskInstance) -> Result<(), CoreError> {
        let result = sqlx::query(
            r#"
            UPDATE task_instances
            SET state = ?, host = ?, start_time = ?, end_time = ?, active = ?, params = ?
            WHERE id = ?
            "#,
        )
        .bind(task.state.as_str())
        .bind(&task.host)
        .bind(task.start_time)
        .bind(task.end_time)
        .bind(task.active)
        .bind(serde_json::to_string(&task.params)?)
        .bind(task.id)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(CoreError::TaskInstanceNotFound {
                task_instance_id: task.id,
            });
        }
        Ok(())
    }

    async fn find_task_instance(
        &self,
        task_instance_id: i64,
    ) -> Result<Option<TaskInstance>, CoreError> {
        let sql = format!("SELECT {TASK_COLUMNS} FROM task_instances WHERE id = ?");
        sqlx::query(&sql)
            .bind(task_instance_id)
            .fetch_optional(&self.pool)
            .await?
            .as_ref()
            .map(task_from_row)
            .transpose()
    }

    async fn list_task_instances(
        &self,
        workflow_instance_id: i64,
    ) -> Result<Vec<TaskInstance>, CoreError> {
        let sql = format!(
            "SELECT {TASK_COLUMNS} FROM task_instances \
             WHERE workflow_instance_id = ? ORDER BY id ASC"
        );
        let rows = sqlx::query(&sql)
            .bind(workflow_instance_id)
            .fetch_all(&self.pool)
            .await?;
        rows.iter().map(task_from_row).collect()
    }

    async fn find_worker_task_instances(
        &self,
        worker_host: &str,
    ) -> Result<Vec<TaskInstance>, CoreError> {
        let sql = format!(
            "SELECT {TASK_COLUMNS} FROM task_instances \
             WHERE host = ? AND active = 1 AND state IN ('dispatch', 'running') \
             ORDER BY id ASC"
        );
        let rows = sqlx::query(&sql)
            .bind(worker_host)
            .fetch_all(&self.pool)
            .await?;
        rows.iter().map(task_from_row).collect()
    }

    async fn list_busy_worker_hosts(&self) -> Result<Vec<String>, CoreError> {
        Ok(sqlx::query_scalar(
            r#"
            SELECT DISTINCT host FROM task_instances
            WHERE host IS NOT NULL AND active = 1 AND state IN ('dispatch', 'running')
            ORDER BY host
            "#,
        )
        .fetch_all(&self.pool)
        .await?)
    }

    async fn create_task_group(&self, name: &str, capacity: i32) -> Result<i64, CoreError> {
        if capacity < 0 {
            return Err(CoreError::ValidationError {
                field: "capacity".to_string(),
                message: format!("must not be negative, got {}", capacity),
            });
        }

        let result = sqlx::query(
            "INSERT INTO task_groups (name, capacity, use_size, created_at) VALUES (?, ?, 0, ?)",
        )
        .bind(name)
        .bind(capacity)
        .bind(Utc::now())
        .execute(&self.pool)
        .await?;

        Ok(result.last_insert_rowid())
    }

    async fn find_task_group(&self, group_id: i64) -> Result<Option<TaskGroup>, CoreError> {
        let row = sqlx::query("SELECT id, name, capacity, use_size FROM task_groups WHERE id = ?")
            .bind(group_id)
            .fetch_optional(&self.pool)
            .await?;

        row.map(|row| -> Result<TaskGroup, CoreError> {
            Ok(TaskGroup {
                id: row.try_get("id")?,
                name: row.try_get("name")?,
                capacity: row.try_get("capacity")?,
                use_size: row.try_get("use_size")?,
            })
        })
        .transpose()
    }

    async fn acquire_task_group_slot(
        &self,
        group_id: i64,
        workflow_instance_id: i64,
        task_instance_id: i64,
    ) -> Result<Lookup<AcquireOutcome>, CoreError> {
        let mut tx = self.pool.begin().await?;

        let exists: Option<i64> = sqlx::query_scalar("SELECT id FROM task_groups WHERE id = ?")
            .bind(group_id)
            .fetch_optional(&mut *tx)
            .await?;
        if exists.is_none() {
            tx.rollback().await?;
            return Ok(Lookup::NotFound);
        }

        if let Some(claim) = find_live_claim(&mut tx, task_instance_id).await? {
            tx.rollback().await?;
            return Ok(match claim.state.as_outcome() {
                Some(outcome) => Lookup::Found(outcome),
                None => Lookup::Conflict(format!("claim {} already released", claim.id)),
            });
        }

        let reserved = sqlx::query(
            "UPDATE task_groups SET use_size = use_size + 1 WHERE id = ? AND use_size < capacity",
        )
        .bind(group_id)
        .execute(&mut *tx)
        .await?;

        let state = if reserved.rows_affected() == 1 {
            ClaimState::Acquired
        } else {
            ClaimState::Queued
        };

        let now = Utc::now();
        sqlx::query(
            r#"
            INSERT INTO task_group_queue (
                group_id, workflow_instance_id, task_instance_id, state, created_at, updated_at
            )
            VALUES (?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(group_id)
        .bind(workflow_instance_id)
        .bind(task_instance_id)
        .bind(state.as_str())
        .bind(now)
        .bind(now)
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;

        match state.as_outcome() {
            Some(outcome) => Ok(Lookup::Found(outcome)),
            None => Ok(Lookup::NotFound),
        }
    }

    async fn release_task_group_slot(
        &self,
        task_instance_id: i64,
    ) -> Result<Option<TaskGroupClaim>, CoreError> {
        let mut tx = self.pool.begin().await?;

        let Some(claim) = find_live_claim(&mut tx, task_instance_id).await? else {
            tx.rollback().await?;
            return Ok(None);
        };

        let now = Utc::now();
        sqlx::query("UPDATE task_group_queue SET state = ?, updated_at = ? WHERE id = ?")
            .bind(ClaimState::Released.as_str())
            .bind(now)
            .bind(claim.id)
            .execute(&mut *tx)
            .await?;

        let mut promoted = None;
        if claim.state == ClaimState::Acquired {
            let sql = format!(
                "SELECT {CLAIM_COLUMNS} FROM task_group_queue \
                 WHERE group_id = ? AND state = ? ORDER BY id ASC LIMIT 1"
            );
            let next = sqlx::query(&sql)
                .bind(claim.group_id)
                .bind(ClaimState::Queued.as_str())
                .fetch_optional(&mut *tx)
                .await?
                .as_ref()
                .map(claim_from_row)
                .transpose()?;

            match next {
                // The freed unit passes straight to the head of the queue, so
                // use_size is unchanged.
                Some(mut next) => {
                    sqlx::query(
                        "UPDATE task_group_queue SET state = ?, updated_at = ? WHERE id = ?",
                    )
                    .bind(ClaimState::Acquired.as_str())
                    .bind(now)
                    .bind(next.id)
                    .execute(&mut *tx)
                    .await?;
                    next.state = ClaimState::Acquired;
                    next.updated_at = now;
                    promoted = Some(next);
                }
                None => {
                    sqlx::query(
                        "UPDATE task_groups SET use_size = use_size - 1 WHERE id = ? AND use_size > 0",
                    )
                    .bind(claim.group_id)
                    .execute(&mut *tx)
                    .await?;
                }
            }
        }

        tx.commit().await?;
        Ok(promoted)
    }

    async fn list_task_group_claims(
        &self,
        group_id: i64,
    ) -> Result<Vec<TaskGroupClaim>, CoreError> {
        let sql = format!(
            "SELECT {CLAIM_COLUMNS} FROM task_group_queue WHERE group_id = ? ORDER BY id ASC"
        );
        let rows = sqlx::query(&sql)
            .bind(group_id)
            .fetch_all(&self.pool)
            .await?;
        rows.iter().map(claim_from_row).collect()
    }

    async fn health_check_db(&self) -> Result<bool, CoreError> {
        let one: i64 = sqlx::query_scalar("SELECT 1").fetch_one(&self.pool).await?;
        Ok(one == 1)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{CommandType, TaskDefinition, TaskState, WorkflowState};

    /// Create an in-memory SQLite pool for testing.
    async fn test_pool() -> SqlitePool {
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect("sqlite::memory:")
            .await
            .expect("Failed to create in-memory SQLite pool");

        MIGRATOR.run(&pool).await.expect("Failed to run migrations");

        pool
    }

    fn definition() -> WorkflowDefinition {
        WorkflowDefinition::new(42, 1, "etl")
            .task(TaskDefinition::normal(1, "A", "shell"))
            .task(TaskDefinition::normal(2, "B", "shell"))
            .relation("A", "B")
    }

    async fn running_instance(persistence: &SqlitePersistence, host: &str) -> WorkflowInstance {
        let mut instance = WorkflowInstance::new(&definition(), host, Utc::now());
        instance.state = WorkflowState::Running;
        instance.id = persistence
            .insert_workflow_instance(&instance)
            .await
            .unwrap();
        instance
    }

    #[tokio::test]
    async fn test_pending_commands_are_partitioned_by_slot() {
        let persistence = SqlitePersistence::new(test_pool().await);
        for _ in 0..6 {
            persistence
                .insert_command(&NewCommand::start(42, 1))
                .await
                .unwrap();
        }

        let slot0 = persistence.find_pending_commands(10, 0, 2, 0).await.unwrap();
        let slot1 = persistence.find_pending_commands(10, 0, 2, 1).await.unwrap();

        assert_eq!(
            slot0.iter().map(|c| c.id).collect::<Vec<_>>(),
            vec![2, 4, 6]
        );
        assert_eq!(
            slot1.iter().map(|c| c.id).collect::<Vec<_>>(),
            vec![1, 3, 5]
        );
        assert!(
            persistence
                .find_pending_commands(10, 0, 0, 0)
                .await
                .unwrap()
                .is_empty()
        );
    }

    #[tokio::test]
    async fn test_pending_commands_paging() {
        let persistence = SqlitePersistence::new(test_pool().await);
        for _ in 0..5 {
            persistence
                .insert_command(&NewCommand::start(42, 1))
                .await
                .unwrap();
        }

        let page0 = persistence.find_pending_commands(2, 0, 1, 0).await.unwrap();
        let page2 = persistence.find_pending_commands(2, 2, 1, 0).await.unwrap();
        assert_eq!(page0.len(), 2);
        assert_eq!(page0[0].id, 1);
        assert_eq!(page2.len(), 1);
        assert_eq!(page2[0].id, 5);
    }

    #[tokio::test]
    async fn test_consume_command_is_exactly_once() {
        let persistence = SqlitePersistence::new(test_pool().await);
        let command_id = persistence
            .insert_command(&NewCommand::start(42, 1))
            .await
            .unwrap();
        let instance = WorkflowInstance::new(&definition(), "m1:5678", Utc::now());

        let first = persistence
            .consume_command(command_id, &instance)
            .await
            .unwrap();
        let instance_id = first.found().unwrap();
        assert!(instance_id > 0);

        let second = persistence
            .consume_command(command_id, &instance)
            .await
            .unwrap();
        assert!(matches!(second, Lookup::Conflict(_)));

        // The conflicting attempt must not have written a second instance.
        assert!(
            persistence
                .find_workflow_instance(instance_id + 1)
                .await
                .unwrap()
                .is_none()
        );
        assert!(
            persistence
                .find_pending_commands(10, 0, 1, 0)
                .await
                .unwrap()
                .is_empty()
        );
    }

    #[tokio::test]
    async fn test_consume_recovery_command_updates_instance() {
        let persistence = SqlitePersistence::new(test_pool().await);
        let mut instance = running_instance(&persistence, "m1:5678").await;
        let command_id = persistence
            .insert_command(&NewCommand::recover(
                CommandType::RecoverFailed,
                42,
                1,
                instance.id,
            ))
            .await
            .unwrap();

        instance.command_type = CommandType::RecoverFailed;
        instance.run_times = 2;
        let result = persistence
            .consume_command(command_id, &instance)
            .await
            .unwrap();
        assert_eq!(result.found(), Some(instance.id));

        let stored = persistence
            .find_workflow_instance(instance.id)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(stored.run_times, 2);
        assert_eq!(stored.command_type, CommandType::RecoverFailed);
    }

    #[tokio::test]
    async fn test_move_to_error_command() {
        let persistence = SqlitePersistence::new(test_pool().await);
        persistence
            .insert_command(&NewCommand::start(99, 1))
            .await
            .unwrap();
        let command = persistence
            .find_pending_commands(10, 0, 1, 0)
            .await
            .unwrap()
            .remove(0);

        persistence
            .move_to_error_command(&command, "definition missing")
            .await
            .unwrap();

        assert!(
            persistence
                .find_pending_commands(10, 0, 1, 0)
                .await
                .unwrap()
                .is_empty()
        );
        let errors = persistence.list_error_commands().await.unwrap();
        assert_eq!(errors.len(), 1);
        assert_eq!(errors[0].command.id, command.id);
        assert_eq!(errors[0].message, "definition missing");
    }

    #[tokio::test]
    async fn test_definition_round_trip() {
        let persistence = SqlitePersistence::new(test_pool().await);
        persistence
            .save_workflow_definition(&definition())
            .await
            .unwrap();

        let loaded = persistence
            .find_workflow_definition(42, 1)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(loaded, definition());
        assert!(
            persistence
                .find_workflow_definition(42, 2)
                .await
                .unwrap()
                .is_none()
        );
    }

    #[tokio::test]
    async fn test_transfer_host_is_conditional() {
        let persistence = SqlitePersistence::new(test_pool().await);
        let instance = running_instance(&persistence, "dead:5678").await;
        let now = Utc::now();

        assert!(
            persistence
                .transfer_workflow_instance_host(instance.id, "dead:5678", "live:5678", now)
                .await
                .unwrap()
        );
        // A second master detecting the same failure loses the race.
        assert!(
            !persistence
                .transfer_workflow_instance_host(instance.id, "dead:5678", "other:5678", now)
                .await
                .unwrap()
        );

        let stored = persistence
            .find_workflow_instance(instance.id)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(stored.host.as_deref(), Some("live:5678"));
        assert!(stored.restart_time.is_some());
    }

    #[tokio::test]
    async fn test_unfinished_hosts() {
        let persistence = SqlitePersistence::new(test_pool().await);
        running_instance(&persistence, "a:1").await;
        let mut finished = running_instance(&persistence, "b:1").await;
        finished.state = WorkflowState::Success;
        persistence
            .update_workflow_instance(&finished)
            .await
            .unwrap();

        assert_eq!(
            persistence.list_unfinished_instance_hosts().await.unwrap(),
            vec!["a:1".to_string()]
        );
        assert_eq!(
            persistence
                .find_unfinished_instances_by_host("b:1")
                .await
                .unwrap()
                .len(),
            0
        );
    }

    #[tokio::test]
    async fn test_worker_task_queries() {
        let persistence = SqlitePersistence::new(test_pool().await);
        let instance = running_instance(&persistence, "m:1").await;
        let def = definition();

        let mut running = TaskInstance::new(instance.id, &def.tasks[0], 0, Utc::now());
        running.state = TaskState::Running;
        running.host = Some("w1:1234".to_string());
        running.id = persistence.insert_task_instance(&running).await.unwrap();

        let mut done = TaskInstance::new(instance.id, &def.tasks[1], 0, Utc::now());
        done.state = TaskState::Success;
        done.host = Some("w2:1234".to_string());
        done.id = persistence.insert_task_instance(&done).await.unwrap();

        assert_eq!(
            persistence.list_busy_worker_hosts().await.unwrap(),
            vec!["w1:1234".to_string()]
        );
        let on_worker = persistence
            .find_worker_task_instances("w1:1234")
            .await
            .unwrap();
        assert_eq!(on_worker.len(), 1);
        assert_eq!(on_worker[0].id, running.id);

        running.active = false;
        running.state = TaskState::NeedFaultTolerance;
        persistence.update_task_instance(&running).await.unwrap();
        assert!(
            persistence
                .find_worker_task_instances("w1:1234")
                .await
                .unwrap()
                .is_empty()
        );
        assert_eq!(
            persistence
                .list_task_instances(instance.id)
                .await
                .unwrap()
                .len(),
            2
        );
    }

    #[tokio::test]
    async fn test_task_group_capacity_and_fifo_promotion() {
        let persistence = SqlitePersistence::new(test_pool().await);
        let group = persistence.create_task_group("db", 1).await.unwrap();

        let first = persistence
            .acquire_task_group_slot(group, 1, 100)
            .await
            .unwrap();
        let second = persistence
            .acquire_task_group_slot(group, 1, 101)
            .await
            .unwrap();
        let third = persistence
            .acquire_task_group_slot(group, 2, 102)
            .await
            .unwrap();
        assert_eq!(first.found(), Some(AcquireOutcome::Acquired));
        assert_eq!(second.found(), Some(AcquireOutcome::Queued));
        assert_eq!(third.found(), Some(AcquireOutcome::Queued));

        // Re-acquiring returns the existing claim.
        assert_eq!(
            persistence
                .acquire_task_group_slot(group, 1, 101)
                .await
                .unwrap()
                .found(),
            Some(AcquireOutcome::Queued)
        );

        let promoted = persistence.release_task_group_slot(100).await.unwrap();
        assert_eq!(promoted.map(|c| c.task_instance_id), Some(101));
        assert_eq!(
            persistence
                .find_task_group(group)
                .await
                .unwrap()
                .unwrap()
                .use_size,
            1
        );

        let promoted = persistence.release_task_group_slot(101).await.unwrap();
        assert_eq!(promoted.map(|c| c.task_instance_id), Some(102));

        assert!(
            persistence
                .release_task_group_slot(102)
                .await
                .unwrap()
                .is_none()
        );
        assert_eq!(
            persistence
                .find_task_group(group)
                .await
                .unwrap()
                .unwrap()
                .use_size,
            0
        );
    }

    #[tokio::test]
    async fn test_release_of_queued_claim_keeps_use_size() {
        let persistence = SqlitePersistence::new(test_pool().await);
        let group = persistence.create_task_group("api", 1).await.unwrap();
        persistence
            .acquire_task_group_slot(group, 1, 10)
            .await
            .unwrap();
        persistence
            .acquire_task_group_slot(group, 1, 11)
            .await
            .unwrap();

        assert!(
            persistence
                .release_task_group_slot(11)
                .await
                .unwrap()
                .is_none()
        );
        let group_row = persistence.find_task_group(group).await.unwrap().unwrap();
        assert_eq!(group_row.use_size, 1);

        let claims = persistence.list_task_group_claims(group).await.unwrap();
        assert_eq!(claims[0].state, ClaimState::Acquired);
        assert_eq!(claims[1].state, ClaimState::Released);
    }

    #[tokio::test]
    async fn test_acquire_unknown_group() {
        let persistence = SqlitePersistence::new(test_pool().await);
        let result = persistence
            .acquire_task_group_slot(404, 1, 1)
            .await
            .unwrap();
        assert!(matches!(result, Lookup::NotFound));
    }

    #[tokio::test]
    async fn test_health_check() {
        let persistence = SqlitePersistence::in_memory().await.unwrap();
        assert!(persistence.health_check_db().await.unwrap());
    }
}
