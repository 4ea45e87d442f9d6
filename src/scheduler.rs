//! Cron task scheduler.
//!
//! Owns the task and execution tables, a per-minute-or-finer ticker that
//! launches due tasks, and a sweeper that enforces execution retention.
//! Concurrency is bounded by a semaphore: when the cap is saturated, due
//! tasks are skipped for the tick and re-evaluated on the next one (no
//! backlog queue). Executor failures are captured into the execution
//! record and never crash the scheduler.
//!
//! Execution records transition `running → completed | failed` exactly
//! once and are immutable afterwards.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use sqlx::{Row, SqlitePool};
use tokio::sync::{Mutex, Semaphore};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::config::SchedulerConfig;
use crate::cron;
use crate::error::{Error, Result};

/// The kind of work a task runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TaskType {
    /// A RAG query against the store.
    Query,
    /// An ingest of a file, URL, or inline text.
    Ingest,
    /// A safelisted command.
    Script,
    /// A named MCP tool invocation.
    Tool,
}

impl TaskType {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Query => "query",
            Self::Ingest => "ingest",
            Self::Script => "script",
            Self::Tool => "tool",
        }
    }
}

impl std::str::FromStr for TaskType {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "query" => Ok(Self::Query),
            "ingest" => Ok(Self::Ingest),
            "script" => Ok(Self::Script),
            "tool" => Ok(Self::Tool),
            other => Err(Error::invalid_arg(format!("unknown task type: '{other}'"))),
        }
    }
}

/// A scheduled (or one-shot) task.
#[derive(Debug, Clone, Serialize)]
pub struct Task {
    pub id: String,
    pub task_type: TaskType,
    /// Cron expression; empty means one-shot (run on demand only).
    pub schedule: String,
    pub parameters: HashMap<String, String>,
    pub description: String,
    pub priority: i64,
    pub enabled: bool,
    pub created: i64,
    pub updated: i64,
    pub next_run: Option<i64>,
    pub last_run: Option<i64>,
}

/// Status of one task execution.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ExecutionStatus {
    Running,
    Completed,
    Failed,
}

impl ExecutionStatus {
    fn as_str(self) -> &'static str {
        match self {
            Self::Running => "running",
            Self::Completed => "completed",
            Self::Failed => "failed",
        }
    }

    fn parse(s: &str) -> Self {
        match s {
            "completed" => Self::Completed,
            "failed" => Self::Failed,
            _ => Self::Running,
        }
    }
}

/// A single run of a task. Immutable once `finished` is set.
#[derive(Debug, Clone, Serialize)]
pub struct TaskExecution {
    pub id: String,
    pub task_id: String,
    pub start: i64,
    pub finished: Option<i64>,
    pub duration_ms: i64,
    pub status: ExecutionStatus,
    pub output: Option<String>,
    pub error: Option<String>,
}

/// What an executor produced.
#[derive(Debug, Clone, Default)]
pub struct TaskResult {
    pub success: bool,
    pub output: Option<String>,
    pub error: Option<String>,
}

impl TaskResult {
    pub fn ok(output: impl Into<String>) -> Self {
        Self {
            success: true,
            output: Some(output.into()),
            error: None,
        }
    }

    pub fn err(error: impl Into<String>) -> Self {
        Self {
            success: false,
            output: None,
            error: Some(error.into()),
        }
    }
}

/// Executor plug-in for one task type.
#[async_trait]
pub trait TaskExecutor: Send + Sync {
    fn task_type(&self) -> TaskType;

    /// Reject malformed parameters before a task is created.
    fn validate(&self, params: &HashMap<String, String>) -> Result<()>;

    /// Run the task. Must be cancellation-aware; errors become failed
    /// execution records, not scheduler crashes.
    async fn execute(
        &self,
        params: &HashMap<String, String>,
        cancel: &CancellationToken,
    ) -> Result<TaskResult>;
}

// ============ Task storage ============

/// SQL layer for the task and execution tables. The scheduler is the
/// only writer.
#[derive(Clone)]
pub struct TaskStore {
    pool: SqlitePool,
}

impl TaskStore {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    pub async fn migrate(&self) -> Result<()> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS tasks (
                id TEXT PRIMARY KEY,
                task_type TEXT NOT NULL,
                schedule TEXT NOT NULL DEFAULT '',
                parameters_json TEXT NOT NULL DEFAULT '{}',
                description TEXT NOT NULL DEFAULT '',
                priority INTEGER NOT NULL DEFAULT 0,
                enabled INTEGER NOT NULL DEFAULT 1,
                created INTEGER NOT NULL,
                updated INTEGER NOT NULL,
                next_run INTEGER,
                last_run INTEGER
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS task_executions (
                id TEXT PRIMARY KEY,
                task_id TEXT NOT NULL,
                start INTEGER NOT NULL,
                finished INTEGER,
                duration_ms INTEGER NOT NULL DEFAULT 0,
                status TEXT NOT NULL,
                output TEXT,
                error TEXT,
                FOREIGN KEY (task_id) REFERENCES tasks(id)
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            "CREATE INDEX IF NOT EXISTS idx_executions_task_id
             ON task_executions(task_id, start DESC)",
        )
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    pub async fn insert_task(&self, task: &Task) -> Result<()> {
        let parameters_json = serde_json::to_string(&task.parameters)
            .map_err(|e| Error::invalid_arg(format!("unserializable parameters: {e}")))?;

        sqlx::query(
            r#"
            INSERT INTO tasks (id, task_type, schedule, parameters_json, description,
                               priority, enabled, created, updated, next_run, last_run)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&task.id)
        .bind(task.task_type.as_str())
        .bind(&task.schedule)
        .bind(&parameters_json)
        .bind(&task.description)
        .bind(task.priority)
        .bind(task.enabled)
        .bind(task.created)
        .bind(task.updated)
        .bind(task.next_run)
        .bind(task.last_run)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    pub async fn get_task(&self, id: &str) -> Result<Task> {
        let row = sqlx::query("SELECT * FROM tasks WHERE id = ?")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;

        row.as_ref()
            .map(row_to_task)
            .transpose()?
            .ok_or_else(|| Error::NotFound(format!("task '{id}'")))
    }

    pub async fn list_tasks(&self) -> Result<Vec<Task>> {
        let rows = sqlx::query("SELECT * FROM tasks ORDER BY priority DESC, created ASC")
            .fetch_all(&self.pool)
            .await?;
        rows.iter().map(row_to_task).collect()
    }

    /// Tasks that are enabled and due at `now`, most urgent first.
    pub async fn due_tasks(&self, now: i64) -> Result<Vec<Task>> {
        let rows = sqlx::query(
            "SELECT * FROM tasks
             WHERE enabled = 1 AND next_run IS NOT NULL AND next_run <= ?
             ORDER BY priority DESC, next_run ASC",
        )
        .bind(now)
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(row_to_task).collect()
    }

    pub async fn set_enabled(&self, id: &str, enabled: bool) -> Result<()> {
        let now = chrono::Utc::now().timestamp();
        let result = sqlx::query("UPDATE tasks SET enabled = ?, updated = ? WHERE id = ?")
            .bind(enabled)
            .bind(now)
            .bind(id)
            .execute(&self.pool)
            .await?;
        if result.rows_affected() == 0 {
            return Err(Error::NotFound(format!("task '{id}'")));
        }
        Ok(())
    }

    pub async fn delete_task(&self, id: &str) -> Result<()> {
        let mut tx = self.pool.begin().await?;
        sqlx::query("DELETE FROM task_executions WHERE task_id = ?")
            .bind(id)
            .execute(&mut *tx)
            .await?;
        let result = sqlx::query("DELETE FROM tasks WHERE id = ?")
            .bind(id)
            .execute(&mut *tx)
            .await?;
        tx.commit().await?;
        if result.rows_affected() == 0 {
            return Err(Error::NotFound(format!("task '{id}'")));
        }
        Ok(())
    }

    /// Record the run outcome on the task row.
    pub async fn record_task_run(
        &self,
        id: &str,
        last_run: i64,
        next_run: Option<i64>,
    ) -> Result<()> {
        sqlx::query("UPDATE tasks SET last_run = ?, next_run = ?, updated = ? WHERE id = ?")
            .bind(last_run)
            .bind(next_run)
            .bind(chrono::Utc::now().timestamp())
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    /// Open a `running` execution record.
    pub async fn start_execution(&self, task_id: &str) -> Result<TaskExecution> {
        let execution = TaskExecution {
            id: Uuid::new_v4().to_string(),
            task_id: task_id.to_string(),
            start: chrono::Utc::now().timestamp(),
            finished: None,
            duration_ms: 0,
            status: ExecutionStatus::Running,
            output: None,
            error: None,
        };

        sqlx::query(
            "INSERT INTO task_executions (id, task_id, start, status) VALUES (?, ?, ?, ?)",
        )
        .bind(&execution.id)
        .bind(&execution.task_id)
        .bind(execution.start)
        .bind(execution.status.as_str())
        .execute(&self.pool)
        .await?;

        Ok(execution)
    }

    /// Close an execution record. Only a `running` record can be closed,
    /// which makes the `running → completed|failed` transition happen
    /// exactly once.
    pub async fn finish_execution(
        &self,
        execution_id: &str,
        status: ExecutionStatus,
        output: Option<&str>,
        error: Option<&str>,
        duration_ms: i64,
    ) -> Result<()> {
        let finished = chrono::Utc::now().timestamp();
        sqlx::query(
            "UPDATE task_executions
             SET finished = ?, duration_ms = ?, status = ?, output = ?, error = ?
             WHERE id = ? AND status = 'running'",
        )
        .bind(finished)
        .bind(duration_ms)
        .bind(status.as_str())
        .bind(output)
        .bind(error)
        .bind(execution_id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Recent executions for a task, newest first.
    pub async fn list_executions(&self, task_id: &str, limit: i64) -> Result<Vec<TaskExecution>> {
        let rows = sqlx::query(
            "SELECT * FROM task_executions WHERE task_id = ? ORDER BY start DESC LIMIT ?",
        )
        .bind(task_id)
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;

        Ok(rows.iter().map(row_to_execution).collect())
    }

    /// Drop executions past the retention window and beyond the per-task
    /// history cap.
    pub async fn cleanup_executions(&self, retention_days: i64, max_history: i64) -> Result<u64> {
        let cutoff = chrono::Utc::now().timestamp() - retention_days * 86_400;

        let aged = sqlx::query("DELETE FROM task_executions WHERE start < ?")
            .bind(cutoff)
            .execute(&self.pool)
            .await?
            .rows_affected();

        let overflow = sqlx::query(
            r#"
            DELETE FROM task_executions WHERE id IN (
                SELECT id FROM task_executions te
                WHERE (
                    SELECT COUNT(*) FROM task_executions newer
                    WHERE newer.task_id = te.task_id
                      AND (newer.start > te.start
                           OR (newer.start = te.start AND newer.rowid > te.rowid))
                ) >= ?
            )
            "#,
        )
        .bind(max_history)
        .execute(&self.pool)
        .await?
        .rows_affected();

        Ok(aged + overflow)
    }
}

fn row_to_task(row: &sqlx::sqlite::SqliteRow) -> Result<Task> {
    let task_type: String = row.get("task_type");
    let parameters_json: String = row.get("parameters_json");

    Ok(Task {
        id: row.get("id"),
        task_type: task_type.parse()?,
        schedule: row.get("schedule"),
        parameters: serde_json::from_str(&parameters_json).unwrap_or_default(),
        description: row.get("description"),
        priority: row.get("priority"),
        enabled: row.get("enabled"),
        created: row.get("created"),
        updated: row.get("updated"),
        next_run: row.get("next_run"),
        last_run: row.get("last_run"),
    })
}

fn row_to_execution(row: &sqlx::sqlite::SqliteRow) -> TaskExecution {
    let status: String = row.get("status");
    TaskExecution {
        id: row.get("id"),
        task_id: row.get("task_id"),
        start: row.get("start"),
        finished: row.get("finished"),
        duration_ms: row.get("duration_ms"),
        status: ExecutionStatus::parse(&status),
        output: row.get("output"),
        error: row.get("error"),
    }
}

// ============ Scheduler ============

struct SchedulerInner {
    store: TaskStore,
    executors: HashMap<TaskType, Arc<dyn TaskExecutor>>,
    semaphore: Arc<Semaphore>,
    config: SchedulerConfig,
    /// Cancellation token for the ticker/sweeper; Some while started.
    running: Mutex<Option<CancellationToken>>,
}

/// The task scheduler. Cheap to clone; all clones share state.
#[derive(Clone)]
pub struct Scheduler {
    inner: Arc<SchedulerInner>,
}

impl Scheduler {
    /// Build a scheduler over the shared pool with its executor plug-ins.
    /// Later executors of the same type replace earlier ones.
    pub async fn new(
        pool: SqlitePool,
        config: SchedulerConfig,
        executors: Vec<Arc<dyn TaskExecutor>>,
    ) -> Result<Self> {
        let store = TaskStore::new(pool);
        store.migrate().await?;

        let executors: HashMap<TaskType, Arc<dyn TaskExecutor>> = executors
            .into_iter()
            .map(|executor| (executor.task_type(), executor))
            .collect();

        Ok(Self {
            inner: Arc::new(SchedulerInner {
                store,
                executors,
                semaphore: Arc::new(Semaphore::new(config.max_concurrent)),
                config,
                running: Mutex::new(None),
            }),
        })
    }

    /// Direct access to the task store (listing, history).
    pub fn store(&self) -> &TaskStore {
        &self.inner.store
    }

    /// Create a task. The schedule is validated, the type's executor
    /// validates the parameters, and `next_run` is derived (None for an
    /// empty schedule, i.e. a one-shot task).
    pub async fn create_task(
        &self,
        task_type: TaskType,
        schedule: &str,
        parameters: HashMap<String, String>,
        description: &str,
        priority: i64,
    ) -> Result<Task> {
        cron::validate(schedule)?;

        let executor = self
            .inner
            .executors
            .get(&task_type)
            .ok_or_else(|| Error::invalid_arg(format!(
                "no executor registered for task type '{}'",
                task_type.as_str()
            )))?;
        executor.validate(&parameters)?;

        let now = chrono::Utc::now();
        let next_run = cron::next_run(schedule, now)?.map(|dt| dt.timestamp());

        let task = Task {
            id: Uuid::new_v4().to_string(),
            task_type,
            schedule: schedule.to_string(),
            parameters,
            description: description.to_string(),
            priority,
            enabled: true,
            created: now.timestamp(),
            updated: now.timestamp(),
            next_run,
            last_run: None,
        };

        self.inner.store.insert_task(&task).await?;
        debug!(task_id = %task.id, task_type = task_type.as_str(), "task created");
        Ok(task)
    }

    pub async fn get_task(&self, id: &str) -> Result<Task> {
        self.inner.store.get_task(id).await
    }

    pub async fn list_tasks(&self) -> Result<Vec<Task>> {
        self.inner.store.list_tasks().await
    }

    pub async fn delete_task(&self, id: &str) -> Result<()> {
        self.inner.store.delete_task(id).await
    }

    pub async fn set_enabled(&self, id: &str, enabled: bool) -> Result<()> {
        self.inner.store.set_enabled(id, enabled).await
    }

    pub async fn list_executions(&self, task_id: &str, limit: i64) -> Result<Vec<TaskExecution>> {
        self.inner.store.list_executions(task_id, limit).await
    }

    /// Run a task immediately, bypassing the schedule but not the
    /// concurrency cap. Returns the finished execution record.
    pub async fn run_task(&self, id: &str, cancel: &CancellationToken) -> Result<TaskExecution> {
        let task = self.inner.store.get_task(id).await?;

        let permit = self
            .inner
            .semaphore
            .clone()
            .acquire_owned()
            .await
            .map_err(|_| Error::Canceled)?;

        let execution = self.execute_task(&task, cancel).await?;
        drop(permit);
        Ok(execution)
    }

    /// Start the ticker and sweeper. Idempotent.
    pub async fn start(&self) {
        let mut running = self.inner.running.lock().await;
        if running.is_some() {
            return;
        }
        let token = CancellationToken::new();
        *running = Some(token.clone());
        drop(running);

        let tick_secs = self.inner.config.tick_secs.max(1);
        let scheduler = self.clone();
        let tick_token = token.clone();
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(Duration::from_secs(tick_secs));
            interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                tokio::select! {
                    _ = interval.tick() => scheduler.tick(&tick_token).await,
                    () = tick_token.cancelled() => break,
                }
            }
        });

        let scheduler = self.clone();
        let sweep_token = token;
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(Duration::from_secs(3600));
            interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                tokio::select! {
                    _ = interval.tick() => {
                        if let Err(e) = scheduler.sweep().await {
                            warn!("execution sweep failed: {e}");
                        }
                    }
                    () = sweep_token.cancelled() => break,
                }
            }
        });
    }

    /// Stop the ticker and sweeper. Idempotent; in-flight executions run
    /// to completion (their records are closed by the worker).
    pub async fn stop(&self) {
        let mut running = self.inner.running.lock().await;
        if let Some(token) = running.take() {
            token.cancel();
        }
    }

    /// One pass of the sweeper.
    pub async fn sweep(&self) -> Result<u64> {
        let removed = self
            .inner
            .store
            .cleanup_executions(self.inner.config.retention_days, self.inner.config.max_history)
            .await?;
        if removed > 0 {
            debug!(removed, "swept old task executions");
        }
        Ok(removed)
    }

    /// One scheduler tick: launch every due task that fits under the
    /// concurrency cap; the rest wait for the next tick.
    async fn tick(&self, cancel: &CancellationToken) {
        let now = chrono::Utc::now().timestamp();
        let due = match self.inner.store.due_tasks(now).await {
            Ok(due) => due,
            Err(e) => {
                warn!("failed to query due tasks: {e}");
                return;
            }
        };

        for task in due {
            let Ok(permit) = self.inner.semaphore.clone().try_acquire_owned() else {
                debug!(task_id = %task.id, "scheduler saturated, deferring to next tick");
                continue;
            };

            let scheduler = self.clone();
            let cancel = cancel.clone();
            tokio::spawn(async move {
                if let Err(e) = scheduler.execute_task(&task, &cancel).await {
                    warn!(task_id = %task.id, "task execution bookkeeping failed: {e}");
                }
                drop(permit);
            });
        }
    }

    /// Run one task through its executor, recording the execution and
    /// updating the task's run bookkeeping. Executor failures land in the
    /// record; only storage failures surface as errors.
    async fn execute_task(&self, task: &Task, cancel: &CancellationToken) -> Result<TaskExecution> {
        let executor = self
            .inner
            .executors
            .get(&task.task_type)
            .ok_or_else(|| Error::invalid_arg(format!(
                "no executor registered for task type '{}'",
                task.task_type.as_str()
            )))?;

        let mut execution = self.inner.store.start_execution(&task.id).await?;
        let started = std::time::Instant::now();

        let outcome = executor.execute(&task.parameters, cancel).await;
        let duration_ms = started.elapsed().as_millis() as i64;

        let (status, output, error) = match outcome {
            Ok(result) if result.success => (ExecutionStatus::Completed, result.output, None),
            Ok(result) => (
                ExecutionStatus::Failed,
                result.output,
                Some(result.error.unwrap_or_else(|| "task failed".to_string())),
            ),
            Err(e) => (ExecutionStatus::Failed, None, Some(e.to_string())),
        };

        self.inner
            .store
            .finish_execution(
                &execution.id,
                status,
                output.as_deref(),
                error.as_deref(),
                duration_ms,
            )
            .await?;

        let now = chrono::Utc::now();
        let next_run = cron::next_run(&task.schedule, now)?.map(|dt| dt.timestamp());
        self.inner
            .store
            .record_task_run(&task.id, now.timestamp(), next_run)
            .await?;

        execution.finished = Some(now.timestamp());
        execution.duration_ms = duration_ms;
        execution.status = status;
        execution.output = output;
        execution.error = error;
        Ok(execution)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db;

    struct CountingExecutor {
        runs: Arc<std::sync::atomic::AtomicUsize>,
        fail: bool,
    }

    #[async_trait]
    impl TaskExecutor for CountingExecutor {
        fn task_type(&self) -> TaskType {
            TaskType::Script
        }

        fn validate(&self, params: &HashMap<String, String>) -> Result<()> {
            if params.contains_key("command") {
                Ok(())
            } else {
                Err(Error::invalid_arg("missing 'command' parameter"))
            }
        }

        async fn execute(
            &self,
            _params: &HashMap<String, String>,
            _cancel: &CancellationToken,
        ) -> Result<TaskResult> {
            self.runs.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
            if self.fail {
                Ok(TaskResult::err("boom"))
            } else {
                Ok(TaskResult::ok("done"))
            }
        }
    }

    async fn make_scheduler(fail: bool) -> (Scheduler, Arc<std::sync::atomic::AtomicUsize>) {
        let pool = db::connect_in_memory().await.unwrap();
        let runs = Arc::new(std::sync::atomic::AtomicUsize::new(0));
        let executor = Arc::new(CountingExecutor {
            runs: runs.clone(),
            fail,
        });
        let scheduler = Scheduler::new(pool, SchedulerConfig::default(), vec![executor])
            .await
            .unwrap();
        (scheduler, runs)
    }

    fn script_params() -> HashMap<String, String> {
        let mut params = HashMap::new();
        params.insert("command".to_string(), "echo hello".to_string());
        params
    }

    #[test]
    fn test_task_type_parsing() {
        assert_eq!("query".parse::<TaskType>().unwrap(), TaskType::Query);
        assert_eq!("tool".parse::<TaskType>().unwrap(), TaskType::Tool);
        assert!("cron".parse::<TaskType>().is_err());
    }

    #[tokio::test]
    async fn test_create_task_roundtrip() {
        let (scheduler, _) = make_scheduler(false).await;
        let task = scheduler
            .create_task(
                TaskType::Script,
                "*/5 * * * *",
                script_params(),
                "test task",
                1,
            )
            .await
            .unwrap();

        let fetched = scheduler.get_task(&task.id).await.unwrap();
        assert_eq!(fetched.schedule, "*/5 * * * *");
        assert_eq!(fetched.description, "test task");
        assert_eq!(fetched.parameters.get("command").unwrap(), "echo hello");
        assert!(fetched.enabled);
        // A scheduled task has a next_run strictly in the future.
        assert!(fetched.next_run.unwrap() > chrono::Utc::now().timestamp());
    }

    #[tokio::test]
    async fn test_one_shot_has_no_next_run() {
        let (scheduler, _) = make_scheduler(false).await;
        let task = scheduler
            .create_task(TaskType::Script, "", script_params(), "one-shot", 0)
            .await
            .unwrap();
        assert_eq!(task.next_run, None);
        assert!(scheduler
            .store()
            .due_tasks(i64::MAX)
            .await
            .unwrap()
            .is_empty());
    }

    #[tokio::test]
    async fn test_create_task_validates_cron_and_params() {
        let (scheduler, _) = make_scheduler(false).await;
        let err = scheduler
            .create_task(TaskType::Script, "bogus cron", script_params(), "", 0)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::InvalidArg(_)));

        let err = scheduler
            .create_task(TaskType::Script, "", HashMap::new(), "", 0)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::InvalidArg(_)));
    }

    #[tokio::test]
    async fn test_run_task_records_completed_execution() {
        let (scheduler, runs) = make_scheduler(false).await;
        let task = scheduler
            .create_task(TaskType::Script, "", script_params(), "", 0)
            .await
            .unwrap();

        let execution = scheduler
            .run_task(&task.id, &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(execution.status, ExecutionStatus::Completed);
        assert_eq!(execution.output.as_deref(), Some("done"));
        assert!(execution.finished.is_some());
        assert_eq!(runs.load(std::sync::atomic::Ordering::SeqCst), 1);

        let task = scheduler.get_task(&task.id).await.unwrap();
        assert!(task.last_run.unwrap() <= chrono::Utc::now().timestamp());

        let history = scheduler.list_executions(&task.id, 10).await.unwrap();
        assert_eq!(history.len(), 1);
        assert_eq!(history[0].status, ExecutionStatus::Completed);
    }

    #[tokio::test]
    async fn test_executor_failure_recorded_not_raised() {
        let (scheduler, _) = make_scheduler(true).await;
        let task = scheduler
            .create_task(TaskType::Script, "", script_params(), "", 0)
            .await
            .unwrap();

        let execution = scheduler
            .run_task(&task.id, &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(execution.status, ExecutionStatus::Failed);
        assert_eq!(execution.error.as_deref(), Some("boom"));
    }

    #[tokio::test]
    async fn test_finish_execution_happens_once() {
        let (scheduler, _) = make_scheduler(false).await;
        let task = scheduler
            .create_task(TaskType::Script, "", script_params(), "", 0)
            .await
            .unwrap();
        let execution = scheduler
            .run_task(&task.id, &CancellationToken::new())
            .await
            .unwrap();

        // A second close attempt on the finished record changes nothing.
        scheduler
            .store()
            .finish_execution(&execution.id, ExecutionStatus::Failed, None, Some("late"), 1)
            .await
            .unwrap();
        let history = scheduler.list_executions(&task.id, 10).await.unwrap();
        assert_eq!(history[0].status, ExecutionStatus::Completed);
        assert_eq!(history[0].output.as_deref(), Some("done"));
    }

    #[tokio::test]
    async fn test_delete_task_cascades_executions() {
        let (scheduler, _) = make_scheduler(false).await;
        let task = scheduler
            .create_task(TaskType::Script, "", script_params(), "", 0)
            .await
            .unwrap();
        scheduler
            .run_task(&task.id, &CancellationToken::new())
            .await
            .unwrap();

        scheduler.delete_task(&task.id).await.unwrap();
        assert!(matches!(
            scheduler.get_task(&task.id).await.unwrap_err(),
            Error::NotFound(_)
        ));
        assert!(scheduler
            .list_executions(&task.id, 10)
            .await
            .unwrap()
            .is_empty());
    }

    #[tokio::test]
    async fn test_cleanup_enforces_max_history() {
        let (scheduler, _) = make_scheduler(false).await;
        let task = scheduler
            .create_task(TaskType::Script, "", script_params(), "", 0)
            .await
            .unwrap();

        for _ in 0..5 {
            scheduler
                .run_task(&task.id, &CancellationToken::new())
                .await
                .unwrap();
        }

        // Retention window keeps everything, history cap keeps 2.
        scheduler
            .store()
            .cleanup_executions(30, 2)
            .await
            .unwrap();
        let history = scheduler.list_executions(&task.id, 100).await.unwrap();
        assert!(history.len() <= 2, "history kept {} records", history.len());
    }

    #[tokio::test]
    async fn test_start_stop_idempotent() {
        let (scheduler, _) = make_scheduler(false).await;
        scheduler.start().await;
        scheduler.start().await;
        scheduler.stop().await;
        scheduler.stop().await;
    }

    #[tokio::test]
    async fn test_enable_disable() {
        let (scheduler, _) = make_scheduler(false).await;
        let task = scheduler
            .create_task(TaskType::Script, "*/5 * * * *", script_params(), "", 0)
            .await
            .unwrap();

        scheduler.set_enabled(&task.id, false).await.unwrap();
        assert!(!scheduler.get_task(&task.id).await.unwrap().enabled);
        // Disabled tasks are never due.
        let due = scheduler.store().due_tasks(i64::MAX).await.unwrap();
        assert!(due.is_empty());
    }
}
