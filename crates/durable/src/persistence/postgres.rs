//! PostgreSQL implementation of WorkflowEventStore
//!
//! Production persistence using PostgreSQL with:
//! - Optimistic concurrency on history via `next_sequence ... FOR UPDATE`
//! - Task claiming with `FOR UPDATE SKIP LOCKED`
//! - Partial unique indexes for task dedup and the per-run workflow task lock
//! - Every [`HistoryCommit`] applied in one transaction

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::postgres::PgRow;
use sqlx::{PgConnection, PgPool, Row};
use tracing::{debug, error, info, instrument, warn};
use uuid::Uuid;

use super::store::*;
use crate::workflow::{HistoryEvent, WorkflowError, WorkflowEvent};

/// PostgreSQL implementation of WorkflowEventStore
///
/// # Example
///
/// ```ignore
/// use keel_durable::PostgresWorkflowEventStore;
/// use sqlx::PgPool;
///
/// let pool = PgPool::connect("postgres://localhost/keel").await?;
/// let store = PostgresWorkflowEventStore::new(pool);
/// store.migrate().await?;
/// ```
#[derive(Clone)]
pub struct PostgresWorkflowEventStore {
    pool: PgPool,
}

impl PostgresWorkflowEventStore {
    /// Create a new PostgreSQL store with the given connection pool
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Get a reference to the connection pool
    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Apply the bundled schema migrations
    pub async fn migrate(&self) -> Result<(), StoreError> {
        sqlx::migrate!("./migrations")
            .run(&self.pool)
            .await
            .map_err(|e| {
                error!("Failed to run migrations: {}", e);
                StoreError::Database(e.to_string())
            })?;
        info!("durable schema migrations applied");
        Ok(())
    }

    async fn begin(&self) -> Result<sqlx::Transaction<'static, sqlx::Postgres>, StoreError> {
        self.pool.begin().await.map_err(|e| db_error("begin transaction", e))
    }
}

fn db_error(operation: &str, e: sqlx::Error) -> StoreError {
    error!("Failed to {}: {}", operation, e);
    StoreError::Database(e.to_string())
}

fn is_unique_violation(e: &sqlx::Error) -> bool {
    matches!(e, sqlx::Error::Database(db) if db.code().as_deref() == Some("23505"))
}

fn millis(duration: Duration) -> i64 {
    i64::try_from(duration.as_millis()).unwrap_or(i64::MAX)
}

// =============================================================================
// Row mapping
// =============================================================================

fn claimed_from_row(row: &PgRow) -> Result<ClaimedTask, StoreError> {
    let payload: serde_json::Value = row.get("payload");
    let lease_token: Option<Uuid> = row.get("lease_token");
    let worker_id: Option<String> = row.get("worker_id");
    let lease_expires_at: Option<DateTime<Utc>> = row.get("lease_expires_at");

    Ok(ClaimedTask {
        id: row.get("id"),
        lease_token: lease_token.unwrap_or_else(Uuid::nil),
        worker_id: worker_id.unwrap_or_default(),
        task_queue: row.get("task_queue"),
        instance: InstanceId::new(row.get::<String, _>("workflow_id"), row.get("run_id")),
        workflow_type: row.get("workflow_type"),
        payload: serde_json::from_value(payload)?,
        attempt: row.get::<i32, _>("attempt") as u32,
        lease_expires_at: lease_expires_at.unwrap_or_else(Utc::now),
    })
}

fn info_from_row(row: &PgRow) -> Result<WorkflowInfo, StoreError> {
    let status: String = row.get("status");
    let error: Option<serde_json::Value> = row.get("error");
    let next_sequence: i64 = row.get("next_sequence");

    Ok(WorkflowInfo {
        instance: InstanceId::new(row.get::<String, _>("workflow_id"), row.get("run_id")),
        workflow_type: row.get("workflow_type"),
        task_queue: row.get("task_queue"),
        status: status.parse()?,
        input: row.get("input"),
        result: row.get("result"),
        error: error.map(serde_json::from_value::<WorkflowError>).transpose()?,
        history_length: (next_sequence - 1) as u64,
        created_at: row.get("created_at"),
        closed_at: row.get("closed_at"),
    })
}

fn expiry_reason(name: Option<&str>) -> ExpiryReason {
    match name {
        Some("heartbeat_timeout") => ExpiryReason::HeartbeatTimeout,
        _ => ExpiryReason::LeaseExpired,
    }
}

fn expiry_reason_name(reason: ExpiryReason) -> &'static str {
    match reason {
        ExpiryReason::HeartbeatTimeout => "heartbeat_timeout",
        ExpiryReason::LeaseExpired => "lease_expired",
    }
}

// =============================================================================
// Statements shared by single operations and commits
// =============================================================================

/// Lock the instance row; returns (next_sequence, history_closed)
async fn lock_instance(
    conn: &mut PgConnection,
    instance: &InstanceId,
) -> Result<(u64, bool), StoreError> {
    let row = sqlx::query(
        r#"
        SELECT next_sequence, history_closed
        FROM durable_instances
        WHERE workflow_id = $1 AND run_id = $2
        FOR UPDATE
        "#,
    )
    .bind(&instance.workflow_id)
    .bind(instance.run_id)
    .fetch_optional(&mut *conn)
    .await
    .map_err(|e| db_error("lock instance", e))?
    .ok_or_else(|| StoreError::InstanceNotFound(instance.clone()))?;

    let next: i64 = row.get("next_sequence");
    Ok((next as u64, row.get("history_closed")))
}

async fn check_append(
    conn: &mut PgConnection,
    instance: &InstanceId,
    expected_next: u64,
    appending: bool,
) -> Result<(), StoreError> {
    let (actual, closed) = lock_instance(conn, instance).await?;
    if actual != expected_next {
        return Err(StoreError::Conflict {
            instance: instance.clone(),
            expected: expected_next,
            actual,
        });
    }
    if appending && closed {
        return Err(StoreError::InstanceClosed(instance.clone()));
    }
    Ok(())
}

/// Insert events starting at `first`; returns the last sequence in history
async fn push_events(
    conn: &mut PgConnection,
    instance: &InstanceId,
    first: u64,
    events: &[WorkflowEvent],
) -> Result<u64, StoreError> {
    let mut next = first;
    let mut closes = false;
    for event in events {
        sqlx::query(
            r#"
            INSERT INTO durable_events (workflow_id, run_id, sequence, event_type, payload)
            VALUES ($1, $2, $3, $4, $5)
            "#,
        )
        .bind(&instance.workflow_id)
        .bind(instance.run_id)
        .bind(next as i64)
        .bind(event.kind())
        .bind(serde_json::to_value(event)?)
        .execute(&mut *conn)
        .await
        .map_err(|e| db_error("append event", e))?;

        closes |= event.is_terminal();
        next += 1;
    }

    if !events.is_empty() {
        sqlx::query(
            r#"
            UPDATE durable_instances
            SET next_sequence = $3, history_closed = history_closed OR $4
            WHERE workflow_id = $1 AND run_id = $2
            "#,
        )
        .bind(&instance.workflow_id)
        .bind(instance.run_id)
        .bind(next as i64)
        .bind(closes)
        .execute(&mut *conn)
        .await
        .map_err(|e| db_error("advance sequence", e))?;
    }

    Ok(next - 1)
}

async fn insert_task(conn: &mut PgConnection, task: &TaskDefinition) -> Result<Uuid, StoreError> {
    let kind = task.kind();
    let item_id = task.item_id().unwrap_or_default();

    let inserted = sqlx::query(
        r#"
        INSERT INTO durable_tasks (
            id, kind, task_queue, workflow_id, run_id, workflow_type, type_name, item_id,
            payload, max_attempts, lease_ms, heartbeat_ms, visible_at
        )
        VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, COALESCE($13, NOW()))
        ON CONFLICT DO NOTHING
        RETURNING id
        "#,
    )
    .bind(Uuid::now_v7())
    .bind(kind.as_str())
    .bind(&task.task_queue)
    .bind(&task.instance.workflow_id)
    .bind(task.instance.run_id)
    .bind(&task.workflow_type)
    .bind(task.type_name())
    .bind(item_id)
    .bind(serde_json::to_value(&task.payload)?)
    .bind(task.max_attempts().map(|n| n as i32))
    .bind(task.lease_override().map(millis))
    .bind(task.heartbeat_timeout().map(millis))
    .bind(task.visible_at)
    .fetch_optional(&mut *conn)
    .await
    .map_err(|e| db_error("enqueue task", e))?;

    if let Some(row) = inserted {
        return Ok(row.get("id"));
    }

    // Deduplicated: hand back the task that already covers this work.
    let existing = match kind {
        TaskKind::Workflow => sqlx::query(
            r#"
            UPDATE durable_tasks
            SET visible_at = LEAST(visible_at, COALESCE($3, NOW()))
            WHERE workflow_id = $1 AND run_id = $2 AND kind = 'workflow' AND status = 'pending'
            RETURNING id
            "#,
        )
        .bind(&task.instance.workflow_id)
        .bind(task.instance.run_id)
        .bind(task.visible_at)
        .fetch_optional(&mut *conn)
        .await,
        _ => sqlx::query(
            r#"
            SELECT id FROM durable_tasks
            WHERE workflow_id = $1 AND run_id = $2 AND kind = $3 AND item_id = $4
            "#,
        )
        .bind(&task.instance.workflow_id)
        .bind(task.instance.run_id)
        .bind(kind.as_str())
        .bind(item_id)
        .fetch_optional(&mut *conn)
        .await,
    }
    .map_err(|e| db_error("find deduplicated task", e))?;

    existing
        .map(|row| row.get("id"))
        .ok_or_else(|| StoreError::Database(format!("task for {} vanished during enqueue", task.instance)))
}

async fn check_create(conn: &mut PgConnection, new: &NewInstance) -> Result<bool, StoreError> {
    // Serializes starts of the same workflow id.
    sqlx::query("SELECT pg_advisory_xact_lock(hashtext($1))")
        .bind(&new.instance.workflow_id)
        .execute(&mut *conn)
        .await
        .map_err(|e| db_error("lock workflow id", e))?;

    let exists = sqlx::query("SELECT 1 FROM durable_instances WHERE workflow_id = $1 AND run_id = $2")
        .bind(&new.instance.workflow_id)
        .bind(new.instance.run_id)
        .fetch_optional(&mut *conn)
        .await
        .map_err(|e| db_error("check instance", e))?;
    if exists.is_some() {
        return Ok(false);
    }

    let current = sqlx::query(
        r#"
        SELECT c.run_id, i.status
        FROM durable_current_runs c
        JOIN durable_instances i ON i.workflow_id = c.workflow_id AND i.run_id = c.run_id
        WHERE c.workflow_id = $1
        "#,
    )
    .bind(&new.instance.workflow_id)
    .fetch_optional(&mut *conn)
    .await
    .map_err(|e| db_error("read current run", e))?;

    if let Some(row) = current {
        let run_id: Uuid = row.get("run_id");
        let status: WorkflowStatus = row.get::<String, _>("status").parse()?;
        if !status.is_terminal() && new.continued_from != Some(run_id) {
            return Err(StoreError::AlreadyRunning {
                workflow_id: new.instance.workflow_id.clone(),
                run_id,
            });
        }
    }
    Ok(true)
}

async fn create_instance_in(conn: &mut PgConnection, new: &NewInstance) -> Result<(), StoreError> {
    if !check_create(conn, new).await? {
        return Ok(());
    }

    sqlx::query(
        r#"
        INSERT INTO durable_instances (workflow_id, run_id, workflow_type, task_queue, input)
        VALUES ($1, $2, $3, $4, $5)
        "#,
    )
    .bind(&new.instance.workflow_id)
    .bind(new.instance.run_id)
    .bind(&new.workflow_type)
    .bind(&new.task_queue)
    .bind(&new.input)
    .execute(&mut *conn)
    .await
    .map_err(|e| db_error("create instance", e))?;

    push_events(conn, &new.instance, 1, &[new.started_event()]).await?;

    sqlx::query(
        r#"
        INSERT INTO durable_current_runs (workflow_id, run_id)
        VALUES ($1, $2)
        ON CONFLICT (workflow_id) DO UPDATE SET run_id = EXCLUDED.run_id
        "#,
    )
    .bind(&new.instance.workflow_id)
    .bind(new.instance.run_id)
    .execute(&mut *conn)
    .await
    .map_err(|e| db_error("set current run", e))?;

    for task in new.initial_tasks(Utc::now()) {
        insert_task(conn, &task).await?;
    }
    Ok(())
}

async fn close_instance(
    conn: &mut PgConnection,
    instance: &InstanceId,
    close: &InstanceClose,
) -> Result<(), StoreError> {
    let error = close.error.as_ref().map(serde_json::to_value).transpose()?;

    sqlx::query(
        r#"
        UPDATE durable_instances
        SET status = $3, result = $4, error = $5, closed_at = NOW()
        WHERE workflow_id = $1 AND run_id = $2
        "#,
    )
    .bind(&instance.workflow_id)
    .bind(instance.run_id)
    .bind(close.status.as_str())
    .bind(&close.result)
    .bind(&error)
    .execute(&mut *conn)
    .await
    .map_err(|e| db_error("close instance", e))?;

    sqlx::query(
        r#"
        DELETE FROM durable_tasks
        WHERE workflow_id = $1 AND run_id = $2 AND status <> 'leased'
        "#,
    )
    .bind(&instance.workflow_id)
    .bind(instance.run_id)
    .execute(&mut *conn)
    .await
    .map_err(|e| db_error("drop pending tasks", e))?;

    sqlx::query(
        r#"
        UPDATE durable_tasks SET cancel_requested = TRUE
        WHERE workflow_id = $1 AND run_id = $2 AND kind = 'activity'
        "#,
    )
    .bind(&instance.workflow_id)
    .bind(instance.run_id)
    .execute(&mut *conn)
    .await
    .map_err(|e| db_error("cancel running activities", e))?;

    Ok(())
}

/// Release expired leases; returns newly expired and all parked tasks
async fn reclaim_in(conn: &mut PgConnection) -> Result<Vec<ExpiredTask>, StoreError> {
    sqlx::query(
        r#"
        DELETE FROM durable_tasks t
        USING durable_instances i
        WHERE t.status = 'leased'
          AND (t.lease_expires_at <= NOW() OR t.heartbeat_deadline <= NOW())
          AND i.workflow_id = t.workflow_id AND i.run_id = t.run_id
          AND i.status <> 'running'
        "#,
    )
    .execute(&mut *conn)
    .await
    .map_err(|e| db_error("drop expired tasks of closed runs", e))?;

    let rows = sqlx::query(
        r#"
        SELECT id, kind, task_queue, workflow_id, run_id, workflow_type, payload, attempt,
               max_attempts, lease_token, worker_id, lease_expires_at,
               COALESCE(heartbeat_deadline <= NOW(), FALSE) AS heartbeat_missed
        FROM durable_tasks
        WHERE status = 'leased'
          AND (lease_expires_at <= NOW() OR heartbeat_deadline <= NOW())
        ORDER BY enqueue_seq
        FOR UPDATE SKIP LOCKED
        "#,
    )
    .fetch_all(&mut *conn)
    .await
    .map_err(|e| db_error("find expired leases", e))?;

    let mut reclaimed = Vec::with_capacity(rows.len());
    for row in rows {
        let task = claimed_from_row(&row)?;
        let reason = if row.get("heartbeat_missed") {
            ExpiryReason::HeartbeatTimeout
        } else {
            ExpiryReason::LeaseExpired
        };
        let max_attempts: Option<i32> = row.get("max_attempts");
        let exhausted = max_attempts.is_some_and(|max| task.attempt >= max as u32);

        if exhausted {
            sqlx::query(
                r#"
                UPDATE durable_tasks
                SET status = 'parked', expiry_reason = $2, last_error = $2,
                    lease_token = NULL, worker_id = NULL,
                    lease_expires_at = NULL, heartbeat_deadline = NULL
                WHERE id = $1
                "#,
            )
            .bind(task.id)
            .bind(expiry_reason_name(reason))
            .execute(&mut *conn)
            .await
            .map_err(|e| db_error("park exhausted task", e))?;
            continue;
        }

        if task.kind() == TaskKind::Workflow {
            // A newer pending workflow task already covers this run.
            let coalesced = sqlx::query(
                r#"
                DELETE FROM durable_tasks t
                WHERE t.id = $1 AND EXISTS (
                    SELECT 1 FROM durable_tasks p
                    WHERE p.workflow_id = t.workflow_id AND p.run_id = t.run_id
                      AND p.kind = 'workflow' AND p.status = 'pending'
                )
                "#,
            )
            .bind(task.id)
            .execute(&mut *conn)
            .await
            .map_err(|e| db_error("coalesce workflow task", e))?;

            if coalesced.rows_affected() > 0 {
                reclaimed.push(ExpiredTask {
                    task,
                    reason,
                    exhausted: false,
                });
                continue;
            }
        }

        let delay = redelivery_delay(&task.payload, task.attempt);
        sqlx::query(
            r#"
            UPDATE durable_tasks
            SET status = 'pending', last_error = $2,
                visible_at = NOW() + make_interval(secs => $3::double precision / 1000.0),
                lease_token = NULL, worker_id = NULL,
                lease_expires_at = NULL, heartbeat_deadline = NULL
            WHERE id = $1
            "#,
        )
        .bind(task.id)
        .bind(expiry_reason_name(reason))
        .bind(millis(delay))
        .execute(&mut *conn)
        .await
        .map_err(|e| db_error("release expired lease", e))?;

        warn!(task_id = %task.id, instance = %task.instance, ?reason, "lease expired, task released");
        reclaimed.push(ExpiredTask {
            task,
            reason,
            exhausted: false,
        });
    }

    let parked = sqlx::query(
        r#"
        SELECT id, task_queue, workflow_id, run_id, workflow_type, payload, attempt,
               lease_token, worker_id, lease_expires_at, expiry_reason
        FROM durable_tasks
        WHERE status = 'parked'
        ORDER BY enqueue_seq
        "#,
    )
    .fetch_all(&mut *conn)
    .await
    .map_err(|e| db_error("list parked tasks", e))?;

    for row in parked {
        let reason: Option<String> = row.get("expiry_reason");
        reclaimed.push(ExpiredTask {
            task: claimed_from_row(&row)?,
            reason: expiry_reason(reason.as_deref()),
            exhausted: true,
        });
    }

    Ok(reclaimed)
}

/// Map a failed ownership check to TaskNotFound or LeaseExpired
async fn ownership_error(pool: &PgPool, task_id: Uuid) -> StoreError {
    match sqlx::query("SELECT 1 FROM durable_tasks WHERE id = $1")
        .bind(task_id)
        .fetch_optional(pool)
        .await
    {
        Ok(Some(_)) => StoreError::LeaseExpired(task_id),
        Ok(None) => StoreError::TaskNotFound(task_id),
        Err(e) => db_error("check task", e),
    }
}

/// Predicate for "this lease token still owns the task"
const OWNED: &str = r#"
    id = $1 AND lease_token = $2 AND status = 'leased'
    AND lease_expires_at > NOW()
    AND (heartbeat_deadline IS NULL OR heartbeat_deadline > NOW())
"#;

#[async_trait]
impl HistoryLog for PostgresWorkflowEventStore {
    #[instrument(skip(self, events), fields(instance = %instance))]
    async fn append_events(
        &self,
        instance: &InstanceId,
        expected_next: u64,
        events: Vec<WorkflowEvent>,
    ) -> Result<u64, StoreError> {
        let mut tx = self.begin().await?;
        check_append(&mut tx, instance, expected_next, !events.is_empty()).await?;
        let last = push_events(&mut tx, instance, expected_next, &events).await?;
        tx.commit().await.map_err(|e| db_error("commit append", e))?;

        debug!(last_sequence = last, "appended events");
        Ok(last)
    }

    #[instrument(skip(self), fields(instance = %instance))]
    async fn read_events(
        &self,
        instance: &InstanceId,
        from_sequence: u64,
    ) -> Result<Vec<HistoryEvent>, StoreError> {
        let rows = sqlx::query(
            r#"
            SELECT sequence, payload, created_at
            FROM durable_events
            WHERE workflow_id = $1 AND run_id = $2 AND sequence >= $3
            ORDER BY sequence
            "#,
        )
        .bind(&instance.workflow_id)
        .bind(instance.run_id)
        .bind(from_sequence as i64)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| db_error("load events", e))?;

        if rows.is_empty() {
            // Distinguish an empty tail from a missing run.
            self.get_workflow_info(instance).await?;
        }

        let mut events = Vec::with_capacity(rows.len());
        for row in rows {
            let sequence: i64 = row.get("sequence");
            let payload: serde_json::Value = row.get("payload");
            events.push(HistoryEvent {
                sequence: sequence as u64,
                timestamp: row.get("created_at"),
                event: serde_json::from_value(payload)?,
            });
        }
        Ok(events)
    }
}

#[async_trait]
impl TaskQueue for PostgresWorkflowEventStore {
    #[instrument(skip(self, task), fields(instance = %task.instance, kind = task.kind().as_str()))]
    async fn enqueue_task(&self, task: TaskDefinition) -> Result<Uuid, StoreError> {
        let mut tx = self.begin().await?;
        let id = insert_task(&mut tx, &task).await?;
        tx.commit().await.map_err(|e| db_error("commit enqueue", e))?;

        debug!(task_id = %id, "enqueued task");
        Ok(id)
    }

    #[instrument(skip(self, request), fields(queue = %request.task_queue, worker_id = %request.worker_id))]
    async fn claim_task(&self, request: &PollRequest) -> Result<Option<ClaimedTask>, StoreError> {
        let mut tx = self.begin().await?;
        reclaim_in(&mut tx).await?;
        // Expiry releases are kept even if no task matches.
        tx.commit().await.map_err(|e| db_error("commit reclaim", e))?;

        let kinds: Vec<&str> = request.kinds.iter().map(TaskKind::as_str).collect();
        let claimed = sqlx::query(
            r#"
            WITH candidate AS (
                SELECT t.id
                FROM durable_tasks t
                WHERE t.status = 'pending'
                  AND t.task_queue = $1
                  AND t.visible_at <= NOW()
                  AND t.kind = ANY($2)
                  AND (
                      (t.kind = 'activity' AND t.type_name = ANY($4))
                      OR (t.kind <> 'activity' AND t.type_name = ANY($3))
                  )
                  AND (
                      t.kind <> 'workflow'
                      OR NOT EXISTS (
                          SELECT 1 FROM durable_tasks l
                          WHERE l.workflow_id = t.workflow_id AND l.run_id = t.run_id
                            AND l.kind = 'workflow' AND l.status = 'leased'
                      )
                  )
                ORDER BY t.visible_at, t.enqueue_seq
                LIMIT 1
                FOR UPDATE SKIP LOCKED
            )
            UPDATE durable_tasks t
            SET status = 'leased',
                attempt = t.attempt + 1,
                lease_token = $5,
                worker_id = $6,
                lease_expires_at = NOW()
                    + make_interval(secs => COALESCE(t.lease_ms, $7)::double precision / 1000.0),
                heartbeat_deadline = CASE
                    WHEN t.heartbeat_ms IS NULL THEN NULL
                    ELSE NOW() + make_interval(secs => t.heartbeat_ms::double precision / 1000.0)
                END
            FROM candidate c
            WHERE t.id = c.id
            RETURNING t.id, t.task_queue, t.workflow_id, t.run_id, t.workflow_type, t.payload,
                      t.attempt, t.lease_token, t.worker_id, t.lease_expires_at
            "#,
        )
        .bind(&request.task_queue)
        .bind(&kinds)
        .bind(&request.workflow_types)
        .bind(&request.activity_types)
        .bind(Uuid::now_v7())
        .bind(&request.worker_id)
        .bind(millis(request.lease))
        .fetch_optional(&self.pool)
        .await;

        match claimed {
            Ok(Some(row)) => {
                let task = claimed_from_row(&row)?;
                debug!(task_id = %task.id, attempt = task.attempt, "claimed task");
                Ok(Some(task))
            }
            Ok(None) => Ok(None),
            // Lost the race for the run's workflow task lock.
            Err(e) if is_unique_violation(&e) => Ok(None),
            Err(e) => Err(db_error("claim task", e)),
        }
    }

    #[instrument(skip(self))]
    async fn ack_task(&self, task_id: Uuid, lease_token: Uuid) -> Result<(), StoreError> {
        let result = sqlx::query(&format!("DELETE FROM durable_tasks WHERE {OWNED}"))
            .bind(task_id)
            .bind(lease_token)
            .execute(&self.pool)
            .await
            .map_err(|e| db_error("ack task", e))?;

        if result.rows_affected() == 0 {
            return Err(ownership_error(&self.pool, task_id).await);
        }
        Ok(())
    }

    #[instrument(skip(self))]
    async fn extend_lease(
        &self,
        task_id: Uuid,
        lease_token: Uuid,
        extension: Duration,
    ) -> Result<DateTime<Utc>, StoreError> {
        let row = sqlx::query(&format!(
            r#"
            UPDATE durable_tasks
            SET lease_expires_at = NOW() + make_interval(secs => $3::double precision / 1000.0)
            WHERE {OWNED}
            RETURNING lease_expires_at
            "#
        ))
        .bind(task_id)
        .bind(lease_token)
        .bind(millis(extension))
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| db_error("extend lease", e))?;

        match row {
            Some(row) => Ok(row.get("lease_expires_at")),
            None => Err(ownership_error(&self.pool, task_id).await),
        }
    }

    #[instrument(skip(self, details))]
    async fn heartbeat_task(
        &self,
        task_id: Uuid,
        lease_token: Uuid,
        details: Option<serde_json::Value>,
    ) -> Result<HeartbeatResponse, StoreError> {
        let row = sqlx::query(&format!(
            r#"
            UPDATE durable_tasks
            SET heartbeat_deadline = CASE
                    WHEN heartbeat_ms IS NULL THEN NULL
                    ELSE NOW() + make_interval(secs => heartbeat_ms::double precision / 1000.0)
                END,
                heartbeat_details = COALESCE($3, heartbeat_details)
            WHERE {OWNED}
            RETURNING cancel_requested
            "#
        ))
        .bind(task_id)
        .bind(lease_token)
        .bind(&details)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| db_error("heartbeat task", e))?;

        match row {
            Some(row) => Ok(HeartbeatResponse {
                accepted: true,
                should_cancel: row.get("cancel_requested"),
            }),
            None => Err(ownership_error(&self.pool, task_id).await),
        }
    }

    #[instrument(skip(self, error))]
    async fn retry_task(
        &self,
        task_id: Uuid,
        lease_token: Uuid,
        delay: Duration,
        error: &str,
    ) -> Result<(), StoreError> {
        let result = sqlx::query(&format!(
            r#"
            UPDATE durable_tasks
            SET status = 'pending', last_error = $4,
                visible_at = NOW() + make_interval(secs => $3::double precision / 1000.0),
                lease_token = NULL, worker_id = NULL,
                lease_expires_at = NULL, heartbeat_deadline = NULL
            WHERE {OWNED}
            "#
        ))
        .bind(task_id)
        .bind(lease_token)
        .bind(millis(delay))
        .bind(error)
        .execute(&self.pool)
        .await
        .map_err(|e| db_error("retry task", e))?;

        if result.rows_affected() == 0 {
            return Err(ownership_error(&self.pool, task_id).await);
        }
        debug!(%task_id, ?delay, "task scheduled for retry");
        Ok(())
    }

    #[instrument(skip(self))]
    async fn reclaim_expired_tasks(&self) -> Result<Vec<ExpiredTask>, StoreError> {
        let mut tx = self.begin().await?;
        let expired = reclaim_in(&mut tx).await?;
        tx.commit().await.map_err(|e| db_error("commit reclaim", e))?;
        Ok(expired)
    }
}

#[async_trait]
impl WorkflowEventStore for PostgresWorkflowEventStore {
    #[instrument(skip(self, instance), fields(instance = %instance.instance, workflow_type = %instance.workflow_type))]
    async fn create_instance(&self, instance: NewInstance) -> Result<(), StoreError> {
        let mut tx = self.begin().await?;
        create_instance_in(&mut tx, &instance).await?;
        tx.commit().await.map_err(|e| db_error("commit create", e))?;

        debug!("created workflow instance");
        Ok(())
    }

    #[instrument(skip(self))]
    async fn current_run(&self, workflow_id: &str) -> Result<InstanceId, StoreError> {
        let row = sqlx::query("SELECT run_id FROM durable_current_runs WHERE workflow_id = $1")
            .bind(workflow_id)
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| db_error("get current run", e))?
            .ok_or_else(|| StoreError::WorkflowNotFound(workflow_id.to_string()))?;

        Ok(InstanceId::new(workflow_id, row.get("run_id")))
    }

    #[instrument(skip(self), fields(instance = %instance))]
    async fn get_workflow_info(&self, instance: &InstanceId) -> Result<WorkflowInfo, StoreError> {
        let row = sqlx::query(
            r#"
            SELECT workflow_id, run_id, workflow_type, task_queue, status, input, result, error,
                   next_sequence, created_at, closed_at
            FROM durable_instances
            WHERE workflow_id = $1 AND run_id = $2
            "#,
        )
        .bind(&instance.workflow_id)
        .bind(instance.run_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| db_error("get workflow info", e))?
        .ok_or_else(|| StoreError::InstanceNotFound(instance.clone()))?;

        info_from_row(&row)
    }

    #[instrument(skip(self, commit), fields(instance = %commit.instance, expected_next = commit.expected_next))]
    async fn commit(&self, mut commit: HistoryCommit) -> Result<CommitResult, StoreError> {
        commit.drop_tasks_of_closing_run();
        let mut tx = self.begin().await?;
        let instance = &commit.instance;

        check_append(&mut tx, instance, commit.expected_next, !commit.events.is_empty()).await?;
        let last_sequence = push_events(&mut tx, instance, commit.expected_next, &commit.events).await?;

        if let Some(close) = &commit.close {
            close_instance(&mut tx, instance, close).await?;
        }

        if !commit.cancel_timers.is_empty() {
            sqlx::query(
                r#"
                DELETE FROM durable_tasks
                WHERE workflow_id = $1 AND run_id = $2 AND kind = 'timer'
                  AND item_id = ANY($3) AND status <> 'leased'
                "#,
            )
            .bind(&instance.workflow_id)
            .bind(instance.run_id)
            .bind(&commit.cancel_timers)
            .execute(&mut *tx)
            .await
            .map_err(|e| db_error("cancel timers", e))?;
        }

        if !commit.cancel_activities.is_empty() {
            sqlx::query(
                r#"
                UPDATE durable_tasks SET cancel_requested = TRUE
                WHERE workflow_id = $1 AND run_id = $2 AND kind = 'activity' AND item_id = ANY($3)
                "#,
            )
            .bind(&instance.workflow_id)
            .bind(instance.run_id)
            .bind(&commit.cancel_activities)
            .execute(&mut *tx)
            .await
            .map_err(|e| db_error("cancel activities", e))?;
        }

        let mut enqueued = Vec::with_capacity(commit.tasks.len());
        for task in &commit.tasks {
            enqueued.push(insert_task(&mut tx, task).await?);
        }

        if let Some(next) = &commit.continue_as {
            create_instance_in(&mut tx, next).await?;
        }

        let acked = match commit.ack {
            Some(ack) => {
                let result = sqlx::query(
                    r#"
                    DELETE FROM durable_tasks
                    WHERE id = $1 AND ($2::uuid IS NULL OR lease_token = $2)
                    "#,
                )
                .bind(ack.task_id)
                .bind(ack.lease_token)
                .execute(&mut *tx)
                .await
                .map_err(|e| db_error("ack task", e))?;
                result.rows_affected() > 0
            }
            None => false,
        };

        tx.commit().await.map_err(|e| db_error("commit history", e))?;

        debug!(last_sequence, enqueued = enqueued.len(), acked, "committed");
        Ok(CommitResult {
            last_sequence,
            enqueued,
            acked,
        })
    }

    #[instrument(skip(self))]
    async fn purge_closed_before(&self, cutoff: DateTime<Utc>) -> Result<u64, StoreError> {
        let mut tx = self.begin().await?;

        sqlx::query(
            r#"
            DELETE FROM durable_current_runs c
            USING durable_instances i
            WHERE i.workflow_id = c.workflow_id AND i.run_id = c.run_id
              AND i.status <> 'running' AND i.closed_at < $1
            "#,
        )
        .bind(cutoff)
        .execute(&mut *tx)
        .await
        .map_err(|e| db_error("purge current runs", e))?;

        let result = sqlx::query(
            "DELETE FROM durable_instances WHERE status <> 'running' AND closed_at < $1",
        )
        .bind(cutoff)
        .execute(&mut *tx)
        .await
        .map_err(|e| db_error("purge instances", e))?;

        tx.commit().await.map_err(|e| db_error("commit purge", e))?;

        let purged = result.rows_affected();
        if purged > 0 {
            info!(purged, %cutoff, "purged closed workflow runs");
        }
        Ok(purged)
    }

    #[instrument(skip(self, worker), fields(worker_id = %worker.id))]
    async fn register_worker(&self, worker: WorkerInfo) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            INSERT INTO durable_workers (
                id, task_queue, workflow_types, activity_types,
                max_concurrent_workflow_tasks, max_concurrent_activities, started_at, last_seen_at
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
            ON CONFLICT (id) DO UPDATE SET
                task_queue = EXCLUDED.task_queue,
                workflow_types = EXCLUDED.workflow_types,
                activity_types = EXCLUDED.activity_types,
                max_concurrent_workflow_tasks = EXCLUDED.max_concurrent_workflow_tasks,
                max_concurrent_activities = EXCLUDED.max_concurrent_activities,
                last_seen_at = EXCLUDED.last_seen_at
            "#,
        )
        .bind(&worker.id)
        .bind(&worker.task_queue)
        .bind(&worker.workflow_types)
        .bind(&worker.activity_types)
        .bind(worker.max_concurrent_workflow_tasks as i32)
        .bind(worker.max_concurrent_activities as i32)
        .bind(worker.started_at)
        .bind(worker.last_seen_at)
        .execute(&self.pool)
        .await
        .map_err(|e| db_error("register worker", e))?;

        Ok(())
    }

    #[instrument(skip(self))]
    async fn deregister_worker(&self, worker_id: &str) -> Result<(), StoreError> {
        sqlx::query("DELETE FROM durable_workers WHERE id = $1")
            .bind(worker_id)
            .execute(&self.pool)
            .await
            .map_err(|e| db_error("deregister worker", e))?;
        Ok(())
    }

    #[instrument(skip(self))]
    async fn list_workers(&self) -> Result<Vec<WorkerInfo>, StoreError> {
        let rows = sqlx::query(
            r#"
            SELECT id, task_queue, workflow_types, activity_types,
                   max_concurrent_workflow_tasks, max_concurrent_activities,
                   started_at, last_seen_at
            FROM durable_workers
            ORDER BY id
            "#,
        )
        .fetch_all(&self.pool)
        .await
        .map_err(|e| db_error("list workers", e))?;

        Ok(rows
            .iter()
            .map(|row| WorkerInfo {
                id: row.get("id"),
                task_queue: row.get("task_queue"),
                workflow_types: row.get("workflow_types"),
                activity_types: row.get("activity_types"),
                max_concurrent_workflow_tasks: row.get::<i32, _>("max_concurrent_workflow_tasks")
                    as usize,
                max_concurrent_activities: row.get::<i32, _>("max_concurrent_activities") as usize,
                started_at: row.get("started_at"),
                last_seen_at: row.get("last_seen_at"),
            })
            .collect())
    }
}
