//! SQLite store implementation
//!
//! This module provides a SQLite-based implementation of the [`Store`] trait.
//!
//! ## Features
//!
//! - **Embedded**: No separate database server required
//! - **WAL mode**: Readers (log streams, API) do not block the pollers
//! - **Connection pooling**: Every operation borrows a connection for its own
//!   duration only, so concurrent loops cannot exhaust the pool
//! - **Migrations**: Automatic schema versioning with sqlx
//!
//! Timestamps are stored as unix milliseconds. Structured columns (credentials,
//! metrics endpoints, task params and results, raw payloads) are stored as JSON text.

use std::collections::HashMap;
use std::path::Path;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::sqlite::{
    SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions, SqliteRow, SqliteSynchronous,
};
use sqlx::{Pool, Row, Sqlite, SqliteConnection};
use tracing::{debug, info, instrument};

use super::backend::{HealthStatus, Store};
use super::error::{StoreError, StoreResult};
use crate::model::{
    Alert, AlertFilter, AlertId, AlertKey, Domain, DomainId, FinishedTask, Host, HostHealth,
    HostId, LogId, MetricSample, NewAlert, NewDomain, NewHost, NewLogEntry, NewNsCheck, NewTask,
    NsCheckResult, Task, TaskDeletion, TaskFilter, TaskId, TaskLogEntry, TaskOutcome, TaskStats,
    TaskStatus,
};

const TASK_COLUMNS: &str = "id, name, kind, host_id, domain_id, params, status, progress, \
     result, error_message, created_at, started_at, completed_at";

const ALERT_COLUMNS: &str = "id, level, title, message, alert_kind, subject_kind, subject_id, \
     is_resolved, resolved_at, notified_at, created_at";

const LOG_COLUMNS: &str =
    "id, task_id, timestamp, level, source, message, stdout, stderr, return_code";

/// SQLite-backed store
pub struct SqliteStore {
    pool: Pool<Sqlite>,
    db_path: String,
}

impl SqliteStore {
    /// Open (or create) the database at `db_path` and run migrations
    ///
    /// ```no_run
    /// # use fleetwarden::storage::sqlite::SqliteStore;
    /// # async fn example() -> anyhow::Result<()> {
    /// let store = SqliteStore::new("./fleetwarden.db", 5).await?;
    /// # Ok(())
    /// # }
    /// ```
    #[instrument(skip_all)]
    pub async fn new(db_path: impl AsRef<Path>, max_connections: u32) -> StoreResult<Self> {
        let db_path_str = db_path.as_ref().to_string_lossy().to_string();

        info!("initializing SQLite store at: {}", db_path_str);

        let options = SqliteConnectOptions::new()
            .filename(&db_path_str)
            .create_if_missing(true)
            .foreign_keys(true)
            .journal_mode(SqliteJournalMode::Wal)
            .synchronous(SqliteSynchronous::Normal)
            .busy_timeout(Duration::from_secs(30));

        let pool = SqlitePoolOptions::new()
            .max_connections(max_connections.max(1))
            .connect_with(options)
            .await
            .map_err(|e| StoreError::ConnectionFailed(e.to_string()))?;

        debug!("running database migrations");
        sqlx::migrate!("./migrations").run(&pool).await?;
        info!("database migrations complete");

        Ok(Self {
            pool,
            db_path: db_path_str,
        })
    }
}

fn to_millis(dt: &DateTime<Utc>) -> i64 {
    dt.timestamp_millis()
}

fn from_millis(millis: i64) -> DateTime<Utc> {
    DateTime::from_timestamp_millis(millis).unwrap_or_default()
}

fn opt_from_millis(millis: Option<i64>) -> Option<DateTime<Utc>> {
    millis.map(from_millis)
}

fn host_from_row(row: &SqliteRow) -> StoreResult<Host> {
    let credential: String = row.try_get("ssh_credential")?;
    let metrics: String = row.try_get("metrics_endpoint")?;
    let reachability: String = row.try_get("reachability")?;
    Ok(Host {
        id: row.try_get("id")?,
        name: row.try_get("name")?,
        address: row.try_get("address")?,
        ssh_port: row.try_get::<i64, _>("ssh_port")? as u16,
        ssh_user: row.try_get("ssh_user")?,
        credential: serde_json::from_str(&credential)?,
        metrics: serde_json::from_str(&metrics)?,
        reachability: reachability.parse()?,
        consecutive_failures: row.try_get::<i64, _>("consecutive_failures")? as u32,
        last_checked_at: opt_from_millis(row.try_get("last_checked_at")?),
        created_at: from_millis(row.try_get("created_at")?),
    })
}

fn sample_from_row(row: &SqliteRow) -> StoreResult<MetricSample> {
    let raw: String = row.try_get("raw_payload")?;
    Ok(MetricSample {
        host_id: row.try_get("host_id")?,
        cpu_pct: row.try_get("cpu_pct")?,
        mem_pct: row.try_get("mem_pct")?,
        disk_pct: row.try_get("disk_pct")?,
        load1: row.try_get("load1")?,
        load5: row.try_get("load5")?,
        load15: row.try_get("load15")?,
        uptime_secs: row
            .try_get::<Option<i64>, _>("uptime_secs")?
            .map(|v| v as u64),
        raw_payload: serde_json::from_str(&raw)?,
        taken_at: from_millis(row.try_get("taken_at")?),
    })
}

fn domain_from_row(row: &SqliteRow) -> StoreResult<Domain> {
    Ok(Domain {
        id: row.try_get("id")?,
        name: row.try_get("name")?,
        host_id: row.try_get("host_id")?,
        ns_policy: row.try_get("ns_policy")?,
        ssl: row.try_get("ssl")?,
        upstream: row.try_get("upstream")?,
        last_checked_at: opt_from_millis(row.try_get("last_checked_at")?),
        created_at: from_millis(row.try_get("created_at")?),
    })
}

fn ns_check_from_row(row: &SqliteRow) -> StoreResult<NsCheckResult> {
    let nameservers: String = row.try_get("nameservers")?;
    Ok(NsCheckResult {
        id: row.try_get("id")?,
        domain_id: row.try_get("domain_id")?,
        nameservers: serde_json::from_str(&nameservers)?,
        is_valid: row.try_get("is_valid")?,
        error: row.try_get("error")?,
        checked_at: from_millis(row.try_get("checked_at")?),
    })
}

fn alert_from_row(row: &SqliteRow) -> StoreResult<Alert> {
    let level: String = row.try_get("level")?;
    let alert_kind: String = row.try_get("alert_kind")?;
    let subject_kind: String = row.try_get("subject_kind")?;
    Ok(Alert {
        id: row.try_get("id")?,
        level: level.parse()?,
        title: row.try_get("title")?,
        message: row.try_get("message")?,
        alert_kind: alert_kind.parse()?,
        subject_kind: subject_kind.parse()?,
        subject_id: row.try_get("subject_id")?,
        is_resolved: row.try_get("is_resolved")?,
        resolved_at: opt_from_millis(row.try_get("resolved_at")?),
        notified_at: opt_from_millis(row.try_get("notified_at")?),
        created_at: from_millis(row.try_get("created_at")?),
    })
}

fn task_from_row(row: &SqliteRow) -> StoreResult<Task> {
    let kind: String = row.try_get("kind")?;
    let status: String = row.try_get("status")?;
    let params: String = row.try_get("params")?;
    let result: Option<String> = row.try_get("result")?;
    Ok(Task {
        id: row.try_get("id")?,
        name: row.try_get("name")?,
        kind: kind.parse()?,
        host_id: row.try_get("host_id")?,
        domain_id: row.try_get("domain_id")?,
        params: serde_json::from_str(&params)?,
        status: status.parse()?,
        progress: row.try_get::<i64, _>("progress")?.clamp(0, 100) as u8,
        result: result.map(|r| serde_json::from_str(&r)).transpose()?,
        error_message: row.try_get("error_message")?,
        created_at: from_millis(row.try_get("created_at")?),
        started_at: opt_from_millis(row.try_get("started_at")?),
        completed_at: opt_from_millis(row.try_get("completed_at")?),
    })
}

fn log_from_row(row: &SqliteRow) -> StoreResult<TaskLogEntry> {
    let level: String = row.try_get("level")?;
    Ok(TaskLogEntry {
        id: row.try_get("id")?,
        task_id: row.try_get("task_id")?,
        timestamp: from_millis(row.try_get("timestamp")?),
        level: level.parse()?,
        source: row.try_get("source")?,
        message: row.try_get("message")?,
        stdout: row.try_get("stdout")?,
        stderr: row.try_get("stderr")?,
        return_code: row
            .try_get::<Option<i64>, _>("return_code")?
            .map(|c| c as i32),
    })
}

fn limit_param(limit: Option<usize>) -> i64 {
    limit.map(|l| l as i64).unwrap_or(-1)
}

async fn insert_log<'e, E>(executor: E, task_id: TaskId, entry: &NewLogEntry) -> StoreResult<TaskLogEntry>
where
    E: sqlx::Executor<'e, Database = Sqlite>,
{
    let row = sqlx::query(&format!(
        "INSERT INTO task_logs (task_id, timestamp, level, source, message, stdout, stderr, return_code) \
         VALUES (?, ?, ?, ?, ?, ?, ?, ?) RETURNING {LOG_COLUMNS}"
    ))
    .bind(task_id)
    .bind(to_millis(&entry.timestamp))
    .bind(entry.level.as_str())
    .bind(&entry.source)
    .bind(&entry.message)
    .bind(&entry.stdout)
    .bind(&entry.stderr)
    .bind(entry.return_code.map(i64::from))
    .fetch_one(executor)
    .await?;
    log_from_row(&row)
}

async fn insert_alert_row<'e, E>(executor: E, alert: &NewAlert) -> StoreResult<Alert>
where
    E: sqlx::Executor<'e, Database = Sqlite>,
{
    let row = sqlx::query(&format!(
        "INSERT INTO alerts (level, title, message, alert_kind, subject_kind, subject_id, created_at) \
         VALUES (?, ?, ?, ?, ?, ?, ?) RETURNING {ALERT_COLUMNS}"
    ))
    .bind(alert.level.as_str())
    .bind(&alert.title)
    .bind(&alert.message)
    .bind(alert.key.alert_kind.as_str())
    .bind(alert.key.subject_kind.as_str())
    .bind(alert.key.subject_id)
    .bind(to_millis(&alert.created_at))
    .fetch_one(executor)
    .await?;
    alert_from_row(&row)
}

/// Set a hysteresis slot to `breaching`. Returns `true` if the stored state changed.
async fn flip_alert_key(
    conn: &mut SqliteConnection,
    key: &AlertKey,
    breaching: bool,
) -> StoreResult<bool> {
    let now = to_millis(&Utc::now());

    sqlx::query(
        r#"
        INSERT INTO alert_keys (subject_id, subject_kind, alert_kind, is_open, changed_at)
        VALUES (?, ?, ?, 0, ?)
        ON CONFLICT (subject_id, subject_kind, alert_kind) DO NOTHING
        "#,
    )
    .bind(key.subject_id)
    .bind(key.subject_kind.as_str())
    .bind(key.alert_kind.as_str())
    .bind(now)
    .execute(&mut *conn)
    .await?;

    let flipped = sqlx::query(
        r#"
        UPDATE alert_keys SET is_open = ?, changed_at = ?
        WHERE subject_id = ? AND subject_kind = ? AND alert_kind = ? AND is_open != ?
        "#,
    )
    .bind(breaching)
    .bind(now)
    .bind(key.subject_id)
    .bind(key.subject_kind.as_str())
    .bind(key.alert_kind.as_str())
    .bind(breaching)
    .execute(&mut *conn)
    .await?;

    Ok(flipped.rows_affected() > 0)
}

#[async_trait]
impl Store for SqliteStore {
    #[instrument(skip(self, host), fields(name = %host.name))]
    async fn create_host(&self, host: NewHost) -> StoreResult<Host> {
        let row = sqlx::query(
            r#"
            INSERT INTO hosts (name, address, ssh_port, ssh_user, ssh_credential, metrics_endpoint, created_at)
            VALUES (?, ?, ?, ?, ?, ?, ?)
            RETURNING *
            "#,
        )
        .bind(&host.name)
        .bind(&host.address)
        .bind(i64::from(host.ssh_port))
        .bind(&host.ssh_user)
        .bind(serde_json::to_string(&host.credential)?)
        .bind(serde_json::to_string(&host.metrics)?)
        .bind(to_millis(&Utc::now()))
        .fetch_one(&self.pool)
        .await?;
        host_from_row(&row)
    }

    async fn get_host(&self, id: HostId) -> StoreResult<Option<Host>> {
        sqlx::query("SELECT * FROM hosts WHERE id = ?")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?
            .map(|row| host_from_row(&row))
            .transpose()
    }

    async fn list_hosts(&self) -> StoreResult<Vec<Host>> {
        sqlx::query("SELECT * FROM hosts ORDER BY id")
            .fetch_all(&self.pool)
            .await?
            .iter()
            .map(host_from_row)
            .collect()
    }

    async fn update_host_health(&self, id: HostId, health: HostHealth) -> StoreResult<()> {
        let result = sqlx::query(
            "UPDATE hosts SET reachability = ?, consecutive_failures = ?, last_checked_at = ? WHERE id = ?",
        )
        .bind(health.reachability.as_str())
        .bind(i64::from(health.consecutive_failures))
        .bind(to_millis(&health.last_checked_at))
        .bind(id)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(StoreError::NotFound { entity: "host", id });
        }
        Ok(())
    }

    async fn delete_host(&self, id: HostId) -> StoreResult<bool> {
        let result = sqlx::query("DELETE FROM hosts WHERE id = ?")
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() > 0)
    }

    async fn insert_sample(&self, sample: &MetricSample) -> StoreResult<()> {
        sqlx::query(
            r#"
            INSERT INTO metric_samples (
                host_id, cpu_pct, mem_pct, disk_pct, load1, load5, load15,
                uptime_secs, raw_payload, taken_at
            )
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(sample.host_id)
        .bind(sample.cpu_pct)
        .bind(sample.mem_pct)
        .bind(sample.disk_pct)
        .bind(sample.load1)
        .bind(sample.load5)
        .bind(sample.load15)
        .bind(sample.uptime_secs.map(|v| v as i64))
        .bind(serde_json::to_string(&sample.raw_payload)?)
        .bind(to_millis(&sample.taken_at))
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn latest_samples(
        &self,
        host_id: HostId,
        limit: usize,
    ) -> StoreResult<Vec<MetricSample>> {
        sqlx::query("SELECT * FROM metric_samples WHERE host_id = ? ORDER BY id DESC LIMIT ?")
            .bind(host_id)
            .bind(limit as i64)
            .fetch_all(&self.pool)
            .await?
            .iter()
            .map(sample_from_row)
            .collect()
    }

    #[instrument(skip(self))]
    async fn delete_samples_before(&self, cutoff: DateTime<Utc>) -> StoreResult<u64> {
        let result = sqlx::query("DELETE FROM metric_samples WHERE taken_at < ?")
            .bind(to_millis(&cutoff))
            .execute(&self.pool)
            .await?;
        debug!("deleted {} metric samples", result.rows_affected());
        Ok(result.rows_affected())
    }

    async fn create_domain(&self, domain: NewDomain) -> StoreResult<Domain> {
        let row = sqlx::query(
            r#"
            INSERT INTO domains (name, host_id, ns_policy, ssl, upstream, created_at)
            VALUES (?, ?, ?, ?, ?, ?)
            RETURNING *
            "#,
        )
        .bind(&domain.name)
        .bind(domain.host_id)
        .bind(&domain.ns_policy)
        .bind(domain.ssl)
        .bind(&domain.upstream)
        .bind(to_millis(&Utc::now()))
        .fetch_one(&self.pool)
        .await?;
        domain_from_row(&row)
    }

    async fn get_domain(&self, id: DomainId) -> StoreResult<Option<Domain>> {
        sqlx::query("SELECT * FROM domains WHERE id = ?")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?
            .map(|row| domain_from_row(&row))
            .transpose()
    }

    async fn list_domains(&self) -> StoreResult<Vec<Domain>> {
        sqlx::query("SELECT * FROM domains ORDER BY id")
            .fetch_all(&self.pool)
            .await?
            .iter()
            .map(domain_from_row)
            .collect()
    }

    async fn delete_domain(&self, id: DomainId) -> StoreResult<bool> {
        let result = sqlx::query("DELETE FROM domains WHERE id = ?")
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() > 0)
    }

    async fn record_ns_check(&self, check: NewNsCheck) -> StoreResult<NsCheckResult> {
        let mut tx = self.pool.begin().await?;

        let updated = sqlx::query("UPDATE domains SET last_checked_at = ? WHERE id = ?")
            .bind(to_millis(&check.checked_at))
            .bind(check.domain_id)
            .execute(&mut *tx)
            .await?;
        if updated.rows_affected() == 0 {
            return Err(StoreError::NotFound {
                entity: "domain",
                id: check.domain_id,
            });
        }

        let row = sqlx::query(
            r#"
            INSERT INTO ns_checks (domain_id, nameservers, is_valid, error, checked_at)
            VALUES (?, ?, ?, ?, ?)
            RETURNING *
            "#,
        )
        .bind(check.domain_id)
        .bind(serde_json::to_string(&check.nameservers)?)
        .bind(check.is_valid)
        .bind(&check.error)
        .bind(to_millis(&check.checked_at))
        .fetch_one(&mut *tx)
        .await?;

        tx.commit().await?;
        ns_check_from_row(&row)
    }

    async fn ns_checks(
        &self,
        domain_id: DomainId,
        limit: usize,
    ) -> StoreResult<Vec<NsCheckResult>> {
        sqlx::query("SELECT * FROM ns_checks WHERE domain_id = ? ORDER BY id DESC LIMIT ?")
            .bind(domain_id)
            .bind(limit as i64)
            .fetch_all(&self.pool)
            .await?
            .iter()
            .map(ns_check_from_row)
            .collect()
    }

    async fn alert_key_is_open(&self, key: &AlertKey) -> StoreResult<bool> {
        let open: Option<bool> = sqlx::query_scalar(
            "SELECT is_open FROM alert_keys WHERE subject_id = ? AND subject_kind = ? AND alert_kind = ?",
        )
        .bind(key.subject_id)
        .bind(key.subject_kind.as_str())
        .bind(key.alert_kind.as_str())
        .fetch_optional(&self.pool)
        .await?;
        Ok(open.unwrap_or(false))
    }

    #[instrument(skip(self), fields(subject = key.subject_id, kind = %key.alert_kind))]
    async fn transition_alert_key(
        &self,
        key: &AlertKey,
        breaching: bool,
    ) -> StoreResult<Option<bool>> {
        let mut tx = self.pool.begin().await?;
        let flipped = flip_alert_key(&mut *tx, key, breaching).await?;
        tx.commit().await?;

        Ok(flipped.then_some(breaching))
    }

    #[instrument(skip(self, alert), fields(subject = key.subject_id, kind = %key.alert_kind))]
    async fn transition_alert_key_and_record(
        &self,
        key: &AlertKey,
        breaching: bool,
        alert: NewAlert,
    ) -> StoreResult<Option<Alert>> {
        let mut tx = self.pool.begin().await?;

        if !flip_alert_key(&mut *tx, key, breaching).await? {
            tx.rollback().await?;
            return Ok(None);
        }
        let alert = insert_alert_row(&mut *tx, &alert).await?;

        tx.commit().await?;

        Ok(Some(alert))
    }

    async fn insert_alert(&self, alert: NewAlert) -> StoreResult<Alert> {
        insert_alert_row(&self.pool, &alert).await
    }

    async fn get_alert(&self, id: AlertId) -> StoreResult<Option<Alert>> {
        sqlx::query(&format!("SELECT {ALERT_COLUMNS} FROM alerts WHERE id = ?"))
            .bind(id)
            .fetch_optional(&self.pool)
            .await?
            .map(|row| alert_from_row(&row))
            .transpose()
    }

    async fn list_alerts(&self, filter: &AlertFilter) -> StoreResult<Vec<Alert>> {
        sqlx::query(&format!(
            "SELECT {ALERT_COLUMNS} FROM alerts \
             WHERE (? = 0 OR is_resolved = 0) AND (? IS NULL OR subject_id = ?) \
             ORDER BY id DESC LIMIT ?"
        ))
        .bind(filter.unresolved)
        .bind(filter.subject_id)
        .bind(filter.subject_id)
        .bind(limit_param(filter.limit))
        .fetch_all(&self.pool)
        .await?
        .iter()
        .map(alert_from_row)
        .collect()
    }

    async fn mark_alert_notified(&self, id: AlertId, at: DateTime<Utc>) -> StoreResult<()> {
        sqlx::query("UPDATE alerts SET notified_at = ? WHERE id = ?")
            .bind(to_millis(&at))
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn resolve_alert(&self, id: AlertId, at: DateTime<Utc>) -> StoreResult<Option<Alert>> {
        sqlx::query(
            "UPDATE alerts SET is_resolved = 1, resolved_at = ? WHERE id = ? AND is_resolved = 0",
        )
        .bind(to_millis(&at))
        .bind(id)
        .execute(&self.pool)
        .await?;
        self.get_alert(id).await
    }

    async fn undelivered_alerts(&self, limit: usize) -> StoreResult<Vec<Alert>> {
        sqlx::query(&format!(
            "SELECT {ALERT_COLUMNS} FROM alerts \
             WHERE notified_at IS NULL AND is_resolved = 0 ORDER BY id LIMIT ?"
        ))
        .bind(limit as i64)
        .fetch_all(&self.pool)
        .await?
        .iter()
        .map(alert_from_row)
        .collect()
    }

    async fn create_task(&self, task: NewTask) -> StoreResult<Task> {
        let row = sqlx::query(&format!(
            "INSERT INTO tasks (name, kind, host_id, domain_id, params, status, progress, created_at) \
             VALUES (?, ?, ?, ?, ?, 'pending', 0, ?) RETURNING {TASK_COLUMNS}"
        ))
        .bind(&task.name)
        .bind(task.kind.as_str())
        .bind(task.host_id)
        .bind(task.domain_id)
        .bind(serde_json::to_string(&task.params)?)
        .bind(to_millis(&task.created_at))
        .fetch_one(&self.pool)
        .await?;
        task_from_row(&row)
    }

    async fn get_task(&self, id: TaskId) -> StoreResult<Option<Task>> {
        sqlx::query(&format!("SELECT {TASK_COLUMNS} FROM tasks WHERE id = ?"))
            .bind(id)
            .fetch_optional(&self.pool)
            .await?
            .map(|row| task_from_row(&row))
            .transpose()
    }

    async fn list_tasks(&self, filter: &TaskFilter) -> StoreResult<Vec<Task>> {
        let status = filter.status.map(|s| s.as_str());
        let kind = filter.kind.map(|k| k.as_str());
        sqlx::query(&format!(
            "SELECT {TASK_COLUMNS} FROM tasks \
             WHERE (? IS NULL OR status = ?) AND (? IS NULL OR kind = ?) \
             ORDER BY id DESC LIMIT ?"
        ))
        .bind(status)
        .bind(status)
        .bind(kind)
        .bind(kind)
        .bind(limit_param(filter.limit))
        .fetch_all(&self.pool)
        .await?
        .iter()
        .map(task_from_row)
        .collect()
    }

    async fn task_stats(&self) -> StoreResult<TaskStats> {
        let rows = sqlx::query("SELECT status, COUNT(*) AS count FROM tasks GROUP BY status")
            .fetch_all(&self.pool)
            .await?;

        let mut stats = TaskStats::default();
        for row in rows {
            let status: String = row.try_get("status")?;
            let count = row.try_get::<i64, _>("count")? as u64;
            stats.total += count;
            match status.parse::<TaskStatus>()? {
                TaskStatus::Pending => stats.pending = count,
                TaskStatus::Running => stats.running = count,
                TaskStatus::Completed => stats.completed = count,
                TaskStatus::Failed => stats.failed = count,
            }
        }
        Ok(stats)
    }

    async fn start_task(&self, id: TaskId, at: DateTime<Utc>) -> StoreResult<bool> {
        let result = sqlx::query(
            "UPDATE tasks SET status = 'running', started_at = ? WHERE id = ? AND status = 'pending'",
        )
        .bind(to_millis(&at))
        .bind(id)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() > 0)
    }

    async fn advance_progress(&self, id: TaskId, progress: u8) -> StoreResult<Option<u8>> {
        let stored: Option<i64> = sqlx::query_scalar(
            "UPDATE tasks SET progress = MAX(progress, ?) WHERE id = ? AND status = 'running' RETURNING progress",
        )
        .bind(i64::from(progress.min(100)))
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(stored.map(|p| p.clamp(0, 100) as u8))
    }

    #[instrument(skip(self, outcome))]
    async fn finish_task(
        &self,
        id: TaskId,
        outcome: TaskOutcome,
        at: DateTime<Utc>,
    ) -> StoreResult<Option<FinishedTask>> {
        let mut tx = self.pool.begin().await?;

        let updated = match &outcome {
            TaskOutcome::Completed { result } => {
                sqlx::query(
                    "UPDATE tasks SET status = 'completed', progress = 100, result = ?, completed_at = ? \
                     WHERE id = ? AND status = 'running'",
                )
                .bind(serde_json::to_string(result)?)
                .bind(to_millis(&at))
                .bind(id)
                .execute(&mut *tx)
                .await?
            }
            TaskOutcome::Failed { error, .. } => {
                sqlx::query(
                    "UPDATE tasks SET status = 'failed', error_message = ?, completed_at = ? \
                     WHERE id = ? AND status = 'running'",
                )
                .bind(error)
                .bind(to_millis(&at))
                .bind(id)
                .execute(&mut *tx)
                .await?
            }
        };

        if updated.rows_affected() == 0 {
            tx.rollback().await?;
            return Ok(None);
        }

        let final_log = match &outcome {
            TaskOutcome::Completed { .. } => None,
            TaskOutcome::Failed { log, .. } => Some(insert_log(&mut *tx, id, log).await?),
        };

        let row = sqlx::query(&format!("SELECT {TASK_COLUMNS} FROM tasks WHERE id = ?"))
            .bind(id)
            .fetch_one(&mut *tx)
            .await?;
        let task = task_from_row(&row)?;

        tx.commit().await?;

        Ok(Some(FinishedTask { task, final_log }))
    }

    async fn delete_task(&self, id: TaskId) -> StoreResult<TaskDeletion> {
        let mut tx = self.pool.begin().await?;

        let status: Option<String> = sqlx::query_scalar("SELECT status FROM tasks WHERE id = ?")
            .bind(id)
            .fetch_optional(&mut *tx)
            .await?;
        let Some(status) = status else {
            return Ok(TaskDeletion::NotFound);
        };
        let status: TaskStatus = status.parse()?;
        if !status.is_terminal() {
            return Ok(TaskDeletion::InProgress(status));
        }

        sqlx::query("DELETE FROM task_logs WHERE task_id = ?")
            .bind(id)
            .execute(&mut *tx)
            .await?;
        sqlx::query("DELETE FROM tasks WHERE id = ?")
            .bind(id)
            .execute(&mut *tx)
            .await?;

        tx.commit().await?;
        Ok(TaskDeletion::Deleted)
    }

    async fn append_task_log(
        &self,
        task_id: TaskId,
        entry: NewLogEntry,
    ) -> StoreResult<TaskLogEntry> {
        insert_log(&self.pool, task_id, &entry).await
    }

    async fn task_logs(&self, task_id: TaskId, after: LogId) -> StoreResult<Vec<TaskLogEntry>> {
        sqlx::query(&format!(
            "SELECT {LOG_COLUMNS} FROM task_logs WHERE task_id = ? AND id > ? ORDER BY id"
        ))
        .bind(task_id)
        .bind(after)
        .fetch_all(&self.pool)
        .await?
        .iter()
        .map(log_from_row)
        .collect()
    }

    #[instrument(skip(self))]
    async fn delete_task_logs_before(&self, cutoff: DateTime<Utc>) -> StoreResult<u64> {
        let result = sqlx::query(
            r#"
            DELETE FROM task_logs
            WHERE timestamp < ?
              AND task_id IN (SELECT id FROM tasks WHERE status IN ('completed', 'failed'))
            "#,
        )
        .bind(to_millis(&cutoff))
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected())
    }

    #[instrument(skip(self))]
    async fn delete_completed_tasks_before(&self, cutoff: DateTime<Utc>) -> StoreResult<u64> {
        let cutoff = to_millis(&cutoff);
        let mut tx = self.pool.begin().await?;

        sqlx::query(
            r#"
            DELETE FROM task_logs WHERE task_id IN (
                SELECT id FROM tasks WHERE status = 'completed' AND completed_at < ?
            )
            "#,
        )
        .bind(cutoff)
        .execute(&mut *tx)
        .await?;

        let result = sqlx::query("DELETE FROM tasks WHERE status = 'completed' AND completed_at < ?")
            .bind(cutoff)
            .execute(&mut *tx)
            .await?;

        tx.commit().await?;
        Ok(result.rows_affected())
    }

    async fn health_check(&self) -> StoreResult<HealthStatus> {
        let healthy = sqlx::query("SELECT 1").fetch_one(&self.pool).await.is_ok();

        Ok(HealthStatus {
            healthy,
            message: if healthy {
                "SQLite storage operational".to_string()
            } else {
                "SQLite storage unreachable".to_string()
            },
            metadata: HashMap::from([
                ("backend".to_string(), "sqlite".to_string()),
                ("path".to_string(), self.db_path.clone()),
                ("pool_size".to_string(), self.pool.size().to_string()),
            ]),
        })
    }
}
