//! SQLite implementation of [`DispatchStore`]
//!
//! Timestamps are stored as epoch milliseconds and capabilities as a JSON
//! array. A partial unique index on `assignments(task_id)` guarantees at most
//! one open assignment per task.

use std::collections::HashMap;
use std::path::Path;
use std::sync::{Mutex, MutexGuard};

use chrono::{DateTime, Utc};
use rusqlite::types::Type;
use rusqlite::{params, Connection, OptionalExtension, Row};

use super::{
    can_claim, override_status, released_status, ClaimOutcome, CloseOutcome, DispatchStore,
};
use crate::error::{Error, Result};
use crate::models::{
    Assignment, AssignmentStatus, Device, DeviceHistory, DeviceRegistration, DeviceStatus,
    HeartbeatMetrics, HeartbeatSample, LoadCorrection, NewTask, Resolution, Task, TaskCounts,
    TaskState, TaskStatus,
};
use crate::scheduler::backoff::RetryPolicy;

const DEVICE_COLUMNS: &str = "device_id, device_type, address, capabilities, \
    max_concurrent_tasks, current_task_count, status, last_heartbeat, registered_at, \
    cpu_usage, memory_usage, disk_usage, active_task_count";

const TASK_COLUMNS: &str = "id, task_type, priority, payload, status, device_id, assigned_at, \
    started_at, deadline, finished_at, error, next_run_at, execution_timeout_secs, \
    max_retry_count, retry_count, created_at, updated_at";

const ASSIGNMENT_COLUMNS: &str = "id, task_id, device_id, status, assigned_at, deadline, \
    started_at, completed_at, retry_count, error_message, result";

/// SQLite-backed dispatch store
///
/// Uses `Mutex` to serialize access to the connection. Claims and closes run
/// inside a transaction.
pub struct SqliteDispatchStore {
    conn: Mutex<Connection>,
}

impl SqliteDispatchStore {
    /// Open or create the database at `path`
    pub fn new(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();

        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }

        let conn = Connection::open(path)?;

        // WAL lets readers proceed while a claim holds the write lock
        conn.execute_batch("PRAGMA journal_mode=WAL; PRAGMA synchronous=NORMAL;")?;

        let store = Self {
            conn: Mutex::new(conn),
        };
        store.create_schema()?;

        tracing::info!(path = %path.display(), "SQLite dispatch store initialized");
        Ok(store)
    }

    /// Create an in-memory store (for testing)
    pub fn in_memory() -> Result<Self> {
        let store = Self {
            conn: Mutex::new(Connection::open_in_memory()?),
        };
        store.create_schema()?;
        Ok(store)
    }

    fn conn(&self) -> Result<MutexGuard<'_, Connection>> {
        self.conn
            .lock()
            .map_err(|_| Error::storage("SQLite connection lock poisoned"))
    }

    fn create_schema(&self) -> Result<()> {
        let conn = self.conn()?;
        conn.execute_batch(
            r#"
                CREATE TABLE IF NOT EXISTS devices (
                    device_id TEXT PRIMARY KEY,
                    device_type TEXT NOT NULL,
                    address TEXT,
                    capabilities TEXT NOT NULL DEFAULT '[]',
                    max_concurrent_tasks INTEGER NOT NULL,
                    current_task_count INTEGER NOT NULL DEFAULT 0,
                    status TEXT NOT NULL DEFAULT 'online',
                    last_heartbeat INTEGER NOT NULL,
                    registered_at INTEGER NOT NULL,
                    cpu_usage REAL NOT NULL DEFAULT 0,
                    memory_usage REAL NOT NULL DEFAULT 0,
                    disk_usage REAL NOT NULL DEFAULT 0,
                    active_task_count INTEGER NOT NULL DEFAULT 0
                );

                CREATE INDEX IF NOT EXISTS idx_devices_heartbeat
                    ON devices(device_id, last_heartbeat);

                CREATE TABLE IF NOT EXISTS heartbeats (
                    id INTEGER PRIMARY KEY AUTOINCREMENT,
                    device_id TEXT NOT NULL,
                    timestamp INTEGER NOT NULL,
                    cpu_usage REAL NOT NULL,
                    memory_usage REAL NOT NULL,
                    disk_usage REAL NOT NULL,
                    active_task_count INTEGER NOT NULL
                );

                CREATE INDEX IF NOT EXISTS idx_heartbeats_device_time
                    ON heartbeats(device_id, timestamp);

                CREATE TABLE IF NOT EXISTS tasks (
                    id INTEGER PRIMARY KEY AUTOINCREMENT,
                    task_type TEXT NOT NULL,
                    priority INTEGER NOT NULL,
                    payload TEXT NOT NULL,
                    status TEXT NOT NULL,
                    device_id TEXT,
                    assigned_at INTEGER,
                    started_at INTEGER,
                    deadline INTEGER,
                    finished_at INTEGER,
                    error TEXT,
                    next_run_at INTEGER,
                    execution_timeout_secs INTEGER NOT NULL,
                    max_retry_count INTEGER NOT NULL,
                    retry_count INTEGER NOT NULL DEFAULT 0,
                    created_at INTEGER NOT NULL,
                    updated_at INTEGER NOT NULL
                );

                CREATE INDEX IF NOT EXISTS idx_tasks_status_next_run
                    ON tasks(status, next_run_at);

                CREATE TABLE IF NOT EXISTS assignments (
                    id INTEGER PRIMARY KEY AUTOINCREMENT,
                    task_id INTEGER NOT NULL,
                    device_id TEXT NOT NULL,
                    status TEXT NOT NULL,
                    assigned_at INTEGER NOT NULL,
                    deadline INTEGER NOT NULL,
                    started_at INTEGER,
                    completed_at INTEGER,
                    retry_count INTEGER NOT NULL DEFAULT 0,
                    error_message TEXT,
                    result TEXT
                );

                CREATE INDEX IF NOT EXISTS idx_assignments_device_status
                    ON assignments(device_id, status);

                CREATE INDEX IF NOT EXISTS idx_assignments_task
                    ON assignments(task_id);

                CREATE UNIQUE INDEX IF NOT EXISTS idx_assignments_open_task
                    ON assignments(task_id) WHERE status IN ('assigned', 'running');
                "#,
        )?;

        Ok(())
    }

    /// Overwrite a load counter to simulate drift
    #[cfg(test)]
    pub(crate) fn force_load_counter(&self, device_id: &str, count: u32) -> Result<()> {
        let conn = self.conn()?;
        conn.execute(
            "UPDATE devices SET current_task_count = ?2 WHERE device_id = ?1",
            params![device_id, count],
        )?;
        Ok(())
    }
}

// ============================================================================
// Row Mapping
// ============================================================================

fn ms(dt: DateTime<Utc>) -> i64 {
    dt.timestamp_millis()
}

fn from_ms(ms: i64) -> DateTime<Utc> {
    DateTime::from_timestamp_millis(ms).unwrap_or_default()
}

fn conversion_err<E>(idx: usize, err: E) -> rusqlite::Error
where
    E: std::error::Error + Send + Sync + 'static,
{
    rusqlite::Error::FromSqlConversionFailure(idx, Type::Text, Box::new(err))
}

fn required<T>(value: Option<T>, column: &str) -> rusqlite::Result<T> {
    value.ok_or_else(|| rusqlite::Error::InvalidColumnType(0, column.to_string(), Type::Null))
}

fn device_from_row(row: &Row<'_>) -> rusqlite::Result<Device> {
    let device_type: String = row.get("device_type")?;
    let capabilities: String = row.get("capabilities")?;
    let status: String = row.get("status")?;

    Ok(Device {
        device_id: row.get("device_id")?,
        device_type: device_type.parse().map_err(|e| conversion_err(1, e))?,
        address: row.get("address")?,
        capabilities: serde_json::from_str(&capabilities).map_err(|e| conversion_err(3, e))?,
        max_concurrent_tasks: row.get("max_concurrent_tasks")?,
        current_task_count: row.get("current_task_count")?,
        status: status.parse().map_err(|e| conversion_err(6, e))?,
        last_heartbeat: from_ms(row.get("last_heartbeat")?),
        registered_at: from_ms(row.get("registered_at")?),
        metrics: HeartbeatMetrics {
            cpu_usage: row.get("cpu_usage")?,
            memory_usage: row.get("memory_usage")?,
            disk_usage: row.get("disk_usage")?,
            active_task_count: row.get("active_task_count")?,
        },
    })
}

fn task_from_row(row: &Row<'_>) -> rusqlite::Result<Task> {
    let status: String = row.get("status")?;
    let status: TaskStatus = status.parse().map_err(|e| conversion_err(4, e))?;
    let payload: String = row.get("payload")?;
    let at = |column: &str| -> rusqlite::Result<Option<DateTime<Utc>>> {
        Ok(row.get::<_, Option<i64>>(column)?.map(from_ms))
    };
    let device = || -> rusqlite::Result<String> {
        required(row.get::<_, Option<String>>("device_id")?, "device_id")
    };

    let state = match status {
        TaskStatus::Pending => TaskState::Pending {
            next_run_at: required(at("next_run_at")?, "next_run_at")?,
        },
        TaskStatus::Assigned => TaskState::Assigned {
            device_id: device()?,
            assigned_at: required(at("assigned_at")?, "assigned_at")?,
            deadline: required(at("deadline")?, "deadline")?,
        },
        TaskStatus::Running => TaskState::Running {
            device_id: device()?,
            assigned_at: required(at("assigned_at")?, "assigned_at")?,
            started_at: required(at("started_at")?, "started_at")?,
            deadline: required(at("deadline")?, "deadline")?,
        },
        TaskStatus::Completed => TaskState::Completed {
            finished_at: required(at("finished_at")?, "finished_at")?,
        },
        TaskStatus::Failed => TaskState::Failed {
            finished_at: required(at("finished_at")?, "finished_at")?,
            error: row.get("error")?,
        },
    };

    Ok(Task {
        id: row.get("id")?,
        task_type: row.get("task_type")?,
        priority: row.get("priority")?,
        payload: serde_json::from_str(&payload).map_err(|e| conversion_err(3, e))?,
        state,
        execution_timeout_secs: row.get::<_, i64>("execution_timeout_secs")?.max(0) as u64,
        max_retry_count: row.get("max_retry_count")?,
        retry_count: row.get("retry_count")?,
        created_at: from_ms(row.get("created_at")?),
        updated_at: from_ms(row.get("updated_at")?),
    })
}

fn assignment_from_row(row: &Row<'_>) -> rusqlite::Result<Assignment> {
    let status: String = row.get("status")?;
    let result: Option<String> = row.get("result")?;

    Ok(Assignment {
        id: row.get("id")?,
        task_id: row.get("task_id")?,
        device_id: row.get("device_id")?,
        status: status.parse().map_err(|e| conversion_err(3, e))?,
        assigned_at: from_ms(row.get("assigned_at")?),
        deadline: from_ms(row.get("deadline")?),
        started_at: row.get::<_, Option<i64>>("started_at")?.map(from_ms),
        completed_at: row.get::<_, Option<i64>>("completed_at")?.map(from_ms),
        retry_count: row.get("retry_count")?,
        error_message: row.get("error_message")?,
        result: result
            .map(|r| serde_json::from_str(&r))
            .transpose()
            .map_err(|e| conversion_err(10, e))?,
    })
}

/// Flattened task state columns
struct StateColumns<'a> {
    status: &'static str,
    device_id: Option<&'a str>,
    assigned_at: Option<i64>,
    started_at: Option<i64>,
    deadline: Option<i64>,
    finished_at: Option<i64>,
    error: Option<&'a str>,
    next_run_at: Option<i64>,
}

fn state_columns(state: &TaskState) -> StateColumns<'_> {
    let mut cols = StateColumns {
        status: state.status().as_str(),
        device_id: None,
        assigned_at: None,
        started_at: None,
        deadline: None,
        finished_at: None,
        error: None,
        next_run_at: None,
    };

    match state {
        TaskState::Pending { next_run_at } => cols.next_run_at = Some(ms(*next_run_at)),
        TaskState::Assigned {
            device_id,
            assigned_at,
            deadline,
        } => {
            cols.device_id = Some(device_id);
            cols.assigned_at = Some(ms(*assigned_at));
            cols.deadline = Some(ms(*deadline));
        }
        TaskState::Running {
            device_id,
            assigned_at,
            started_at,
            deadline,
        } => {
            cols.device_id = Some(device_id);
            cols.assigned_at = Some(ms(*assigned_at));
            cols.started_at = Some(ms(*started_at));
            cols.deadline = Some(ms(*deadline));
        }
        TaskState::Completed { finished_at } => cols.finished_at = Some(ms(*finished_at)),
        TaskState::Failed { finished_at, error } => {
            cols.finished_at = Some(ms(*finished_at));
            cols.error = error.as_deref();
        }
    }

    cols
}

// ============================================================================
// Queries
// ============================================================================

fn query_device(conn: &Connection, device_id: &str) -> Result<Option<Device>> {
    let sql = format!("SELECT {DEVICE_COLUMNS} FROM devices WHERE device_id = ?1");
    Ok(conn
        .query_row(&sql, params![device_id], device_from_row)
        .optional()?)
}

fn query_task(conn: &Connection, task_id: i64) -> Result<Option<Task>> {
    let sql = format!("SELECT {TASK_COLUMNS} FROM tasks WHERE id = ?1");
    Ok(conn.query_row(&sql, params![task_id], task_from_row).optional()?)
}

fn query_assignment(conn: &Connection, assignment_id: i64) -> Result<Option<Assignment>> {
    let sql = format!("SELECT {ASSIGNMENT_COLUMNS} FROM assignments WHERE id = ?1");
    Ok(conn
        .query_row(&sql, params![assignment_id], assignment_from_row)
        .optional()?)
}

fn query_assignments(
    conn: &Connection,
    filter: &str,
    params: &[&dyn rusqlite::ToSql],
) -> Result<Vec<Assignment>> {
    let sql = format!("SELECT {ASSIGNMENT_COLUMNS} FROM assignments {filter}");
    let mut stmt = conn.prepare(&sql)?;
    let rows = stmt
        .query_map(params, assignment_from_row)?
        .collect::<rusqlite::Result<Vec<_>>>()?;
    Ok(rows)
}

fn write_task_state(
    conn: &Connection,
    task_id: i64,
    state: &TaskState,
    retry_count: u32,
    now: DateTime<Utc>,
) -> Result<()> {
    let cols = state_columns(state);
    conn.execute(
        "UPDATE tasks SET status = ?2, device_id = ?3, assigned_at = ?4, started_at = ?5, \
         deadline = ?6, finished_at = ?7, error = ?8, next_run_at = ?9, retry_count = ?10, \
         updated_at = ?11 WHERE id = ?1",
        params![
            task_id,
            cols.status,
            cols.device_id,
            cols.assigned_at,
            cols.started_at,
            cols.deadline,
            cols.finished_at,
            cols.error,
            cols.next_run_at,
            retry_count,
            ms(now),
        ],
    )?;
    Ok(())
}

fn set_load(conn: &Connection, device_id: &str, load: u32, status: DeviceStatus) -> Result<()> {
    conn.execute(
        "UPDATE devices SET current_task_count = ?2, status = ?3 WHERE device_id = ?1",
        params![device_id, load, status.as_str()],
    )?;
    Ok(())
}

/// Saturating decrement of a device's load counter
fn release_slot(conn: &Connection, device_id: &str) -> Result<()> {
    if let Some(device) = query_device(conn, device_id)? {
        let load = device.current_task_count.saturating_sub(1);
        set_load(conn, device_id, load, released_status(&device, load))?;
    }
    Ok(())
}

// ============================================================================
// DispatchStore
// ============================================================================

impl DispatchStore for SqliteDispatchStore {
    fn upsert_device(
        &self,
        registration: &DeviceRegistration,
        now: DateTime<Utc>,
    ) -> Result<Device> {
        let conn = self.conn()?;
        let capabilities = serde_json::to_string(&registration.capability_set())?;

        conn.execute(
            r#"
            INSERT INTO devices (device_id, device_type, address, capabilities,
                                 max_concurrent_tasks, current_task_count, status,
                                 last_heartbeat, registered_at)
            VALUES (?1, ?2, ?3, ?4, ?5, 0, 'online', ?6, ?6)
            ON CONFLICT(device_id) DO UPDATE SET
                device_type = excluded.device_type,
                address = excluded.address,
                capabilities = excluded.capabilities,
                max_concurrent_tasks = excluded.max_concurrent_tasks,
                last_heartbeat = excluded.last_heartbeat,
                status = CASE
                    WHEN devices.current_task_count >= excluded.max_concurrent_tasks THEN 'busy'
                    ELSE 'online'
                END
            "#,
            params![
                registration.device_id,
                registration.device_type.as_str(),
                registration.address,
                capabilities,
                registration.max_concurrent_tasks,
                ms(now),
            ],
        )?;

        query_device(&conn, &registration.device_id)?
            .ok_or_else(|| Error::storage("device missing after upsert"))
    }

    fn get_device(&self, device_id: &str) -> Result<Option<Device>> {
        let conn = self.conn()?;
        query_device(&conn, device_id)
    }

    fn list_devices(&self) -> Result<Vec<Device>> {
        let conn = self.conn()?;
        let sql = format!("SELECT {DEVICE_COLUMNS} FROM devices ORDER BY device_id");
        let mut stmt = conn.prepare(&sql)?;
        let devices = stmt
            .query_map([], device_from_row)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(devices)
    }

    fn record_heartbeat(
        &self,
        device_id: &str,
        metrics: &HeartbeatMetrics,
        now: DateTime<Utc>,
    ) -> Result<Option<Device>> {
        let mut conn = self.conn()?;
        let tx = conn.transaction()?;

        let Some(device) = query_device(&tx, device_id)? else {
            return Ok(None);
        };

        let metrics = metrics.clamped();
        let load = device.current_task_count.max(metrics.active_task_count);
        let status = DeviceStatus::from_load(load, device.max_concurrent_tasks);

        tx.execute(
            "UPDATE devices SET last_heartbeat = ?2, status = ?3, cpu_usage = ?4, \
             memory_usage = ?5, disk_usage = ?6, active_task_count = ?7 WHERE device_id = ?1",
            params![
                device_id,
                ms(now),
                status.as_str(),
                metrics.cpu_usage,
                metrics.memory_usage,
                metrics.disk_usage,
                metrics.active_task_count,
            ],
        )?;
        tx.execute(
            "INSERT INTO heartbeats (device_id, timestamp, cpu_usage, memory_usage, disk_usage, \
             active_task_count) VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            params![
                device_id,
                ms(now),
                metrics.cpu_usage,
                metrics.memory_usage,
                metrics.disk_usage,
                metrics.active_task_count,
            ],
        )?;

        let updated = query_device(&tx, device_id)?;
        tx.commit()?;
        Ok(updated)
    }

    fn available_devices(&self, live_since: DateTime<Utc>) -> Result<Vec<Device>> {
        let conn = self.conn()?;
        let sql = format!(
            "SELECT {DEVICE_COLUMNS} FROM devices \
             WHERE device_type != 'master' AND status != 'offline' AND last_heartbeat >= ?1 \
             AND current_task_count < max_concurrent_tasks ORDER BY device_id"
        );
        let mut stmt = conn.prepare(&sql)?;
        let devices = stmt
            .query_map(params![ms(live_since)], device_from_row)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(devices)
    }

    fn set_device_status(&self, device_id: &str, status: DeviceStatus) -> Result<Option<Device>> {
        let mut conn = self.conn()?;
        let tx = conn.transaction()?;

        let Some(device) = query_device(&tx, device_id)? else {
            return Ok(None);
        };
        tx.execute(
            "UPDATE devices SET status = ?2 WHERE device_id = ?1",
            params![device_id, override_status(&device, status).as_str()],
        )?;

        let updated = query_device(&tx, device_id)?;
        tx.commit()?;
        Ok(updated)
    }

    fn mark_stale_offline(&self, live_since: DateTime<Utc>) -> Result<Vec<String>> {
        let mut conn = self.conn()?;
        let tx = conn.transaction()?;

        let ids = {
            let mut stmt = tx.prepare(
                "SELECT device_id FROM devices WHERE status != 'offline' AND last_heartbeat < ?1 \
                 ORDER BY device_id",
            )?;
            let ids = stmt
                .query_map(params![ms(live_since)], |row| row.get::<_, String>(0))?
                .collect::<rusqlite::Result<Vec<_>>>()?;
            ids
        };

        tx.execute(
            "UPDATE devices SET status = 'offline' WHERE status != 'offline' AND last_heartbeat < ?1",
            params![ms(live_since)],
        )?;
        tx.commit()?;

        Ok(ids)
    }

    fn heartbeat_samples(
        &self,
        device_id: &str,
        since: DateTime<Utc>,
    ) -> Result<Vec<HeartbeatSample>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(
            "SELECT device_id, timestamp, cpu_usage, memory_usage, disk_usage, active_task_count \
             FROM heartbeats WHERE device_id = ?1 AND timestamp >= ?2 ORDER BY timestamp",
        )?;
        let samples = stmt
            .query_map(params![device_id, ms(since)], |row| {
                Ok(HeartbeatSample {
                    device_id: row.get(0)?,
                    timestamp: from_ms(row.get(1)?),
                    metrics: HeartbeatMetrics {
                        cpu_usage: row.get(2)?,
                        memory_usage: row.get(3)?,
                        disk_usage: row.get(4)?,
                        active_task_count: row.get(5)?,
                    },
                })
            })?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(samples)
    }

    fn prune_heartbeats(&self, before: DateTime<Utc>) -> Result<usize> {
        let conn = self.conn()?;
        Ok(conn.execute(
            "DELETE FROM heartbeats WHERE timestamp < ?1",
            params![ms(before)],
        )?)
    }

    fn insert_task(&self, task: &NewTask, now: DateTime<Utc>) -> Result<Task> {
        let conn = self.conn()?;
        let payload = serde_json::to_string(&task.payload)?;

        conn.execute(
            "INSERT INTO tasks (task_type, priority, payload, status, next_run_at, \
             execution_timeout_secs, max_retry_count, retry_count, created_at, updated_at) \
             VALUES (?1, ?2, ?3, 'pending', ?4, ?5, ?6, 0, ?7, ?7)",
            params![
                task.task_type,
                task.priority,
                payload,
                ms(task.next_run_at),
                task.execution_timeout_secs.min(i64::MAX as u64) as i64,
                task.max_retry_count,
                ms(now),
            ],
        )?;

        let id = conn.last_insert_rowid();
        query_task(&conn, id)?.ok_or_else(|| Error::storage("task missing after insert"))
    }

    fn get_task(&self, task_id: i64) -> Result<Option<Task>> {
        let conn = self.conn()?;
        query_task(&conn, task_id)
    }

    fn list_tasks(&self, status: Option<TaskStatus>, limit: usize) -> Result<Vec<Task>> {
        let conn = self.conn()?;
        let limit = limit.min(i64::MAX as usize) as i64;

        let tasks = match status {
            Some(status) => {
                let sql = format!(
                    "SELECT {TASK_COLUMNS} FROM tasks WHERE status = ?1 \
                     ORDER BY created_at DESC, id DESC LIMIT ?2"
                );
                let mut stmt = conn.prepare(&sql)?;
                let rows = stmt
                    .query_map(params![status.as_str(), limit], task_from_row)?
                    .collect::<rusqlite::Result<Vec<_>>>()?;
                rows
            }
            None => {
                let sql = format!(
                    "SELECT {TASK_COLUMNS} FROM tasks ORDER BY created_at DESC, id DESC LIMIT ?1"
                );
                let mut stmt = conn.prepare(&sql)?;
                let rows = stmt
                    .query_map(params![limit], task_from_row)?
                    .collect::<rusqlite::Result<Vec<_>>>()?;
                rows
            }
        };

        Ok(tasks)
    }

    fn dispatchable_tasks(&self, now: DateTime<Utc>, limit: usize) -> Result<Vec<Task>> {
        let conn = self.conn()?;
        let sql = format!(
            "SELECT {TASK_COLUMNS} FROM tasks WHERE status = 'pending' AND next_run_at <= ?1 \
             ORDER BY priority DESC, next_run_at ASC, id ASC LIMIT ?2"
        );
        let mut stmt = conn.prepare(&sql)?;
        let tasks = stmt
            .query_map(
                params![ms(now), limit.min(i64::MAX as usize) as i64],
                task_from_row,
            )?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(tasks)
    }

    fn task_counts(&self) -> Result<TaskCounts> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare("SELECT status, COUNT(*) FROM tasks GROUP BY status")?;
        let rows = stmt
            .query_map([], |row| {
                Ok((row.get::<_, String>(0)?, row.get::<_, i64>(1)?))
            })?
            .collect::<rusqlite::Result<Vec<_>>>()?;

        let mut counts = TaskCounts::default();
        for (status, n) in rows {
            counts.add(status.parse()?, n as usize);
        }
        Ok(counts)
    }

    fn claim(
        &self,
        task_id: i64,
        device_id: &str,
        now: DateTime<Utc>,
        live_since: DateTime<Utc>,
    ) -> Result<ClaimOutcome> {
        let mut conn = self.conn()?;
        let tx = conn.transaction()?;

        let task = query_task(&tx, task_id)?.ok_or_else(|| Error::not_found("task", task_id))?;
        let device =
            query_device(&tx, device_id)?.ok_or_else(|| Error::not_found("device", device_id))?;

        if task.status() != TaskStatus::Pending {
            return Ok(ClaimOutcome::TaskNotPending);
        }
        if !can_claim(&device, live_since) {
            return Ok(ClaimOutcome::DeviceUnavailable);
        }

        let deadline = task.deadline_from(now)?;
        let state = task
            .state
            .assign(device_id, now, task.execution_timeout())?;
        write_task_state(&tx, task_id, &state, task.retry_count, now)?;

        tx.execute(
            "INSERT INTO assignments (task_id, device_id, status, assigned_at, deadline, retry_count) \
             VALUES (?1, ?2, 'assigned', ?3, ?4, ?5)",
            params![task_id, device_id, ms(now), ms(deadline), task.retry_count],
        )?;
        let assignment_id = tx.last_insert_rowid();

        let load = device.current_task_count + 1;
        set_load(
            &tx,
            device_id,
            load,
            DeviceStatus::from_load(load, device.max_concurrent_tasks),
        )?;

        let assignment = query_assignment(&tx, assignment_id)?
            .ok_or_else(|| Error::storage("assignment missing after insert"))?;
        tx.commit()?;

        Ok(ClaimOutcome::Claimed(assignment))
    }

    fn assigned_to(&self, device_id: &str, limit: usize) -> Result<Vec<(Assignment, Task)>> {
        let conn = self.conn()?;
        let assignments = query_assignments(
            &conn,
            "WHERE device_id = ?1 AND status = 'assigned' ORDER BY assigned_at, id LIMIT ?2",
            params![device_id, limit.min(i64::MAX as usize) as i64],
        )?;

        let mut pulled = Vec::with_capacity(assignments.len());
        for assignment in assignments {
            let task = query_task(&conn, assignment.task_id)?
                .ok_or_else(|| Error::not_found("task", assignment.task_id))?;
            pulled.push((assignment, task));
        }
        Ok(pulled)
    }

    fn mark_running(&self, assignment_id: i64, now: DateTime<Utc>) -> Result<Option<Assignment>> {
        let mut conn = self.conn()?;
        let tx = conn.transaction()?;

        let assignment = query_assignment(&tx, assignment_id)?
            .ok_or_else(|| Error::not_found("assignment", assignment_id))?;

        match assignment.status {
            AssignmentStatus::Running => return Ok(Some(assignment)),
            AssignmentStatus::Assigned => {}
            _ => return Ok(None),
        }

        let task = query_task(&tx, assignment.task_id)?
            .ok_or_else(|| Error::not_found("task", assignment.task_id))?;
        let state = task.state.start(now)?;
        write_task_state(&tx, task.id, &state, task.retry_count, now)?;

        tx.execute(
            "UPDATE assignments SET status = 'running', started_at = ?2 WHERE id = ?1",
            params![assignment_id, ms(now)],
        )?;

        let updated = query_assignment(&tx, assignment_id)?;
        tx.commit()?;
        Ok(updated)
    }

    fn close_assignment(
        &self,
        assignment_id: i64,
        resolution: &Resolution,
        policy: &RetryPolicy,
        now: DateTime<Utc>,
    ) -> Result<CloseOutcome> {
        let mut conn = self.conn()?;
        let tx = conn.transaction()?;

        let assignment = query_assignment(&tx, assignment_id)?
            .ok_or_else(|| Error::not_found("assignment", assignment_id))?;
        if !resolution.applies_to(assignment.status) {
            return Ok(CloseOutcome::Stale);
        }

        let task = query_task(&tx, assignment.task_id)?
            .ok_or_else(|| Error::not_found("task", assignment.task_id))?;
        let (state, retry_count) = policy.resolve(&task, resolution, now)?;
        write_task_state(&tx, task.id, &state, retry_count, now)?;

        let result = resolution.result().map(serde_json::to_string).transpose()?;
        tx.execute(
            "UPDATE assignments SET status = ?2, completed_at = ?3, error_message = ?4, result = ?5 \
             WHERE id = ?1",
            params![
                assignment_id,
                resolution.assignment_status().as_str(),
                ms(now),
                resolution.error_message(),
                result,
            ],
        )?;
        release_slot(&tx, &assignment.device_id)?;

        let assignment = query_assignment(&tx, assignment_id)?
            .ok_or_else(|| Error::storage("assignment missing after close"))?;
        let task = query_task(&tx, task.id)?
            .ok_or_else(|| Error::storage("task missing after close"))?;
        tx.commit()?;

        Ok(CloseOutcome::Closed { assignment, task })
    }

    fn get_assignment(&self, assignment_id: i64) -> Result<Option<Assignment>> {
        let conn = self.conn()?;
        query_assignment(&conn, assignment_id)
    }

    fn open_assignments(&self, device_id: Option<&str>) -> Result<Vec<Assignment>> {
        let conn = self.conn()?;
        match device_id {
            Some(id) => query_assignments(
                &conn,
                "WHERE device_id = ?1 AND status IN ('assigned', 'running') ORDER BY id",
                params![id],
            ),
            None => query_assignments(
                &conn,
                "WHERE status IN ('assigned', 'running') ORDER BY id",
                params![],
            ),
        }
    }

    fn expired_assignments(&self, now: DateTime<Utc>) -> Result<Vec<Assignment>> {
        let conn = self.conn()?;
        query_assignments(
            &conn,
            "WHERE status IN ('assigned', 'running') AND deadline < ?1 ORDER BY deadline, id",
            params![ms(now)],
        )
    }

    fn assignments_for_task(&self, task_id: i64) -> Result<Vec<Assignment>> {
        let conn = self.conn()?;
        query_assignments(&conn, "WHERE task_id = ?1 ORDER BY id", params![task_id])
    }

    fn device_history(&self, since: DateTime<Utc>) -> Result<HashMap<String, DeviceHistory>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(
            r#"
            SELECT device_id,
                   SUM(CASE WHEN status = 'completed' THEN 1 ELSE 0 END),
                   SUM(CASE WHEN status = 'failed' THEN 1 ELSE 0 END),
                   SUM(CASE WHEN status = 'timeout' THEN 1 ELSE 0 END),
                   AVG(CASE WHEN status = 'completed'
                            THEN completed_at - COALESCE(started_at, assigned_at) END)
            FROM assignments
            WHERE status IN ('completed', 'failed', 'timeout') AND completed_at >= ?1
            GROUP BY device_id
            "#,
        )?;

        let rows = stmt
            .query_map(params![ms(since)], |row| {
                Ok((
                    row.get::<_, String>(0)?,
                    DeviceHistory {
                        completed: row.get::<_, i64>(1)?.max(0) as u64,
                        failed: row.get::<_, i64>(2)?.max(0) as u64,
                        timed_out: row.get::<_, i64>(3)?.max(0) as u64,
                        avg_response_secs: row.get::<_, Option<f64>>(4)?.map(|ms| ms / 1000.0),
                    },
                ))
            })?
            .collect::<rusqlite::Result<HashMap<_, _>>>()?;
        Ok(rows)
    }

    fn prune_assignments(&self, before: DateTime<Utc>) -> Result<usize> {
        let conn = self.conn()?;
        Ok(conn.execute(
            "DELETE FROM assignments WHERE status IN ('completed', 'failed', 'timeout', 'moved') \
             AND completed_at < ?1",
            params![ms(before)],
        )?)
    }

    fn reconcile_loads(&self) -> Result<Vec<LoadCorrection>> {
        let mut conn = self.conn()?;
        let tx = conn.transaction()?;

        let rows = {
            let sql = format!(
                "SELECT {DEVICE_COLUMNS}, \
                 (SELECT COUNT(*) FROM assignments a \
                  WHERE a.device_id = devices.device_id AND a.status IN ('assigned', 'running')) \
                 AS open_count FROM devices ORDER BY device_id"
            );
            let mut stmt = tx.prepare(&sql)?;
            let rows = stmt
                .query_map([], |row| {
                    Ok((device_from_row(row)?, row.get::<_, u32>("open_count")?))
                })?
                .collect::<rusqlite::Result<Vec<_>>>()?;
            rows
        };

        let mut corrections = Vec::new();
        for (device, actual) in rows {
            if device.current_task_count == actual {
                continue;
            }
            set_load(&tx, &device.device_id, actual, released_status(&device, actual))?;
            corrections.push(LoadCorrection {
                device_id: device.device_id,
                recorded: device.current_task_count,
                actual,
            });
        }

        tx.commit()?;
        Ok(corrections)
    }
}
