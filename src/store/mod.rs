//! Device model store backed by SQLite
//!
//! All cross-request coordination in the ACS flows through this store: every
//! mutation is a single atomic statement, and task dispatch is serialized per
//! device by the conditional status update in [`DeviceStore::advance_task_status`].

pub mod models;

use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde_json::Value;
use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions, SqliteRow};
use sqlx::{Row, SqlitePool};

use crate::{Error, Result};

pub use models::{
    AcsStats, CwmpSession, Device, DeviceField, DeviceIdStruct, Parameter, Task, TaskCommand,
    TaskKind, TaskStatus,
};

const SCHEMA: &[&str] = &[
    "CREATE TABLE IF NOT EXISTS devices (
        id TEXT PRIMARY KEY,
        manufacturer TEXT NOT NULL DEFAULT '',
        oui TEXT NOT NULL DEFAULT '',
        product_class TEXT NOT NULL DEFAULT '',
        serial_number TEXT NOT NULL DEFAULT '',
        ip_address TEXT,
        connection_request_url TEXT,
        software_version TEXT,
        hardware_version TEXT,
        first_seen TEXT NOT NULL,
        last_inform TEXT,
        online INTEGER NOT NULL DEFAULT 0,
        tags TEXT NOT NULL DEFAULT '[]',
        metadata TEXT NOT NULL DEFAULT '{}'
    )",
    "CREATE TABLE IF NOT EXISTS parameters (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        device_id TEXT NOT NULL REFERENCES devices(id),
        name TEXT NOT NULL,
        value TEXT NOT NULL DEFAULT '',
        param_type TEXT NOT NULL DEFAULT 'string',
        writable INTEGER NOT NULL DEFAULT 0,
        last_updated TEXT NOT NULL,
        UNIQUE(device_id, name)
    )",
    "CREATE INDEX IF NOT EXISTS idx_parameters_device ON parameters(device_id)",
    "CREATE TABLE IF NOT EXISTS tasks (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        device_id TEXT NOT NULL REFERENCES devices(id),
        kind TEXT NOT NULL,
        payload TEXT NOT NULL DEFAULT '{}',
        status TEXT NOT NULL DEFAULT 'pending',
        created_at TEXT NOT NULL,
        completed_at TEXT,
        result TEXT
    )",
    "CREATE INDEX IF NOT EXISTS idx_tasks_device ON tasks(device_id)",
    "CREATE TABLE IF NOT EXISTS sessions (
        id TEXT PRIMARY KEY,
        device_id TEXT NOT NULL,
        started_at TEXT NOT NULL,
        ended_at TEXT,
        inform_events TEXT NOT NULL DEFAULT '[]',
        messages_exchanged INTEGER NOT NULL DEFAULT 0
    )",
];

/// Typed interface over the persistent device model
#[derive(Debug, Clone)]
pub struct DeviceStore {
    pool: SqlitePool,
}

impl DeviceStore {
    /// Open (creating if necessary) the database at `url` and ensure the schema
    pub async fn connect(url: &str) -> Result<Self> {
        let options = SqliteConnectOptions::from_str(url)?.create_if_missing(true);

        // An in-memory database exists per connection; a larger pool would
        // hand each worker its own empty database.
        let max_connections = if url.contains(":memory:") { 1 } else { 5 };

        let pool = SqlitePoolOptions::new()
            .max_connections(max_connections)
            .connect_with(options)
            .await?;

        let store = Self { pool };
        store.migrate().await?;
        Ok(store)
    }

    async fn migrate(&self) -> Result<()> {
        for statement in SCHEMA {
            sqlx::query(statement).execute(&self.pool).await?;
        }
        Ok(())
    }

    /// Insert the device if absent, otherwise refresh its identity attributes.
    /// `first_seen` is set once at creation and never overwritten.
    pub async fn upsert_device(
        &self,
        identity: &DeviceIdStruct,
        now: DateTime<Utc>,
    ) -> Result<()> {
        sqlx::query(
            "INSERT INTO devices (id, manufacturer, oui, product_class, serial_number, first_seen)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)
             ON CONFLICT(id) DO UPDATE SET
                 manufacturer = excluded.manufacturer,
                 oui = excluded.oui,
                 product_class = excluded.product_class,
                 serial_number = excluded.serial_number",
        )
        .bind(identity.device_id())
        .bind(&identity.manufacturer)
        .bind(&identity.oui)
        .bind(&identity.product_class)
        .bind(&identity.serial_number)
        .bind(now)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Record an Inform: bump `last_inform`, refresh the observed IP, mark online
    pub async fn touch_liveness(
        &self,
        device_id: &str,
        ip: &str,
        now: DateTime<Utc>,
    ) -> Result<()> {
        sqlx::query("UPDATE devices SET last_inform = ?2, ip_address = ?3, online = 1 WHERE id = ?1")
            .bind(device_id)
            .bind(now)
            .bind(ip)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    /// Set one of the promoted device scalars
    pub async fn set_device_field(
        &self,
        device_id: &str,
        field: DeviceField,
        value: &str,
    ) -> Result<()> {
        let sql = format!("UPDATE devices SET {} = ?2 WHERE id = ?1", field.column());
        sqlx::query(&sql)
            .bind(device_id)
            .bind(value)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    /// Record an observed parameter value; repeated observations overwrite in place
    pub async fn upsert_parameter(
        &self,
        device_id: &str,
        name: &str,
        value: &str,
        now: DateTime<Utc>,
    ) -> Result<()> {
        sqlx::query(
            "INSERT INTO parameters (device_id, name, value, last_updated)
             VALUES (?1, ?2, ?3, ?4)
             ON CONFLICT(device_id, name) DO UPDATE SET
                 value = excluded.value,
                 last_updated = excluded.last_updated",
        )
        .bind(device_id)
        .bind(name)
        .bind(value)
        .bind(now)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn create_task(
        &self,
        device_id: &str,
        command: &TaskCommand,
        now: DateTime<Utc>,
    ) -> Result<Task> {
        let payload = command.payload();
        let row = sqlx::query(
            "INSERT INTO tasks (device_id, kind, payload, status, created_at)
             VALUES (?1, ?2, ?3, 'pending', ?4)
             RETURNING id",
        )
        .bind(device_id)
        .bind(command.kind().as_str())
        .bind(payload.to_string())
        .bind(now)
        .fetch_one(&self.pool)
        .await?;

        Ok(Task {
            id: row.try_get("id")?,
            device_id: device_id.to_string(),
            command: command.clone(),
            status: TaskStatus::Pending,
            created_at: now,
            completed_at: None,
            result: None,
        })
    }

    /// Oldest pending task for the device, FIFO by `(created_at, id)`
    pub async fn peek_pending_task(&self, device_id: &str) -> Result<Option<Task>> {
        let row = sqlx::query(
            "SELECT id, device_id, kind, payload, status, created_at, completed_at, result
             FROM tasks
             WHERE device_id = ?1 AND status = 'pending'
             ORDER BY created_at, id
             LIMIT 1",
        )
        .bind(device_id)
        .fetch_optional(&self.pool)
        .await?;

        row.map(task_from_row).transpose()
    }

    /// Conditionally advance a task's status; fails with `StoreConflict` when
    /// the current status no longer matches `from` (another worker won the
    /// race). Edges outside the pending -> sent -> {completed, failed}
    /// lifecycle are refused outright.
    pub async fn advance_task_status(
        &self,
        task_id: i64,
        from: TaskStatus,
        to: TaskStatus,
        result: Option<&Value>,
        now: DateTime<Utc>,
    ) -> Result<()> {
        if !from.can_advance_to(to) {
            return Err(Error::internal(format!(
                "illegal task transition {} -> {}",
                from.as_str(),
                to.as_str()
            )));
        }
        let completed_at = to.is_terminal().then_some(now);
        let outcome = sqlx::query(
            "UPDATE tasks
             SET status = ?2, completed_at = COALESCE(?3, completed_at), result = COALESCE(?4, result)
             WHERE id = ?1 AND status = ?5",
        )
        .bind(task_id)
        .bind(to.as_str())
        .bind(completed_at)
        .bind(result.map(|v| v.to_string()))
        .bind(from.as_str())
        .execute(&self.pool)
        .await?;

        if outcome.rows_affected() != 1 {
            return Err(Error::store_conflict(format!(
                "task {} is no longer {}",
                task_id,
                from.as_str()
            )));
        }
        Ok(())
    }

    /// Most recently dispatched task still awaiting its response, optionally
    /// narrowed to one kind
    pub async fn latest_sent_task(
        &self,
        device_id: &str,
        kind: Option<TaskKind>,
    ) -> Result<Option<Task>> {
        let row = match kind {
            Some(kind) => {
                sqlx::query(
                    "SELECT id, device_id, kind, payload, status, created_at, completed_at, result
                     FROM tasks
                     WHERE device_id = ?1 AND status = 'sent' AND kind = ?2
                     ORDER BY id DESC
                     LIMIT 1",
                )
                .bind(device_id)
                .bind(kind.as_str())
                .fetch_optional(&self.pool)
                .await?
            }
            None => {
                sqlx::query(
                    "SELECT id, device_id, kind, payload, status, created_at, completed_at, result
                     FROM tasks
                     WHERE device_id = ?1 AND status = 'sent'
                     ORDER BY id DESC
                     LIMIT 1",
                )
                .bind(device_id)
                .fetch_optional(&self.pool)
                .await?
            }
        };

        row.map(task_from_row).transpose()
    }

    pub async fn open_session(
        &self,
        session_id: &str,
        device_id: &str,
        inform_events: &[String],
        now: DateTime<Utc>,
    ) -> Result<()> {
        sqlx::query(
            "INSERT INTO sessions (id, device_id, started_at, inform_events, messages_exchanged)
             VALUES (?1, ?2, ?3, ?4, 1)",
        )
        .bind(session_id)
        .bind(device_id)
        .bind(now)
        .bind(serde_json::to_string(inform_events)?)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn get_session(&self, session_id: &str) -> Result<Option<CwmpSession>> {
        let row = sqlx::query(
            "SELECT id, device_id, started_at, ended_at, inform_events, messages_exchanged
             FROM sessions WHERE id = ?1",
        )
        .bind(session_id)
        .fetch_optional(&self.pool)
        .await?;

        row.map(session_from_row).transpose()
    }

    pub async fn bump_session(&self, session_id: &str) -> Result<()> {
        sqlx::query(
            "UPDATE sessions SET messages_exchanged = messages_exchanged + 1 WHERE id = ?1",
        )
        .bind(session_id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn close_session(&self, session_id: &str, now: DateTime<Utc>) -> Result<()> {
        sqlx::query("UPDATE sessions SET ended_at = ?2 WHERE id = ?1 AND ended_at IS NULL")
            .bind(session_id)
            .bind(now)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    pub async fn list_devices(&self) -> Result<Vec<Device>> {
        let rows = sqlx::query(
            "SELECT id, manufacturer, oui, product_class, serial_number, ip_address,
                    connection_request_url, software_version, hardware_version,
                    first_seen, last_inform, online, tags, metadata
             FROM devices ORDER BY id",
        )
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(device_from_row).collect()
    }

    pub async fn get_device(&self, device_id: &str) -> Result<Option<Device>> {
        let row = sqlx::query(
            "SELECT id, manufacturer, oui, product_class, serial_number, ip_address,
                    connection_request_url, software_version, hardware_version,
                    first_seen, last_inform, online, tags, metadata
             FROM devices WHERE id = ?1",
        )
        .bind(device_id)
        .fetch_optional(&self.pool)
        .await?;

        row.map(device_from_row).transpose()
    }

    pub async fn list_parameters(&self, device_id: &str) -> Result<Vec<Parameter>> {
        let rows = sqlx::query(
            "SELECT id, device_id, name, value, param_type, writable, last_updated
             FROM parameters WHERE device_id = ?1 ORDER BY name",
        )
        .bind(device_id)
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(parameter_from_row).collect()
    }

    /// Task history for a device, newest first
    pub async fn list_tasks(&self, device_id: &str) -> Result<Vec<Task>> {
        let rows = sqlx::query(
            "SELECT id, device_id, kind, payload, status, created_at, completed_at, result
             FROM tasks WHERE device_id = ?1 ORDER BY id DESC",
        )
        .bind(device_id)
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(task_from_row).collect()
    }

    pub async fn stats(&self) -> Result<AcsStats> {
        let totals = sqlx::query(
            "SELECT COUNT(*) AS total,
                    COALESCE(SUM(online), 0) AS online
             FROM devices",
        )
        .fetch_one(&self.pool)
        .await?;
        let total_devices: i64 = totals.try_get("total")?;
        let online: i64 = totals.try_get("online")?;

        let pending = sqlx::query("SELECT COUNT(*) AS pending FROM tasks WHERE status = 'pending'")
            .fetch_one(&self.pool)
            .await?;
        let pending_tasks: i64 = pending.try_get("pending")?;

        Ok(AcsStats {
            total_devices,
            online,
            offline: total_devices - online,
            pending_tasks,
        })
    }

    /// Flip `online` to false for devices whose last inform is older than
    /// `cutoff`. Never touches `last_inform`; idempotent.
    pub async fn sweep_offline(&self, cutoff: DateTime<Utc>) -> Result<u64> {
        let outcome = sqlx::query(
            "UPDATE devices SET online = 0
             WHERE online = 1 AND (last_inform IS NULL OR last_inform < ?1)",
        )
        .bind(cutoff)
        .execute(&self.pool)
        .await?;
        Ok(outcome.rows_affected())
    }
}

fn device_from_row(row: SqliteRow) -> Result<Device> {
    let tags: String = row.try_get("tags")?;
    let metadata: String = row.try_get("metadata")?;
    Ok(Device {
        id: row.try_get("id")?,
        manufacturer: row.try_get("manufacturer")?,
        oui: row.try_get("oui")?,
        product_class: row.try_get("product_class")?,
        serial_number: row.try_get("serial_number")?,
        ip_address: row.try_get("ip_address")?,
        connection_request_url: row.try_get("connection_request_url")?,
        software_version: row.try_get("software_version")?,
        hardware_version: row.try_get("hardware_version")?,
        first_seen: row.try_get("first_seen")?,
        last_inform: row.try_get("last_inform")?,
        online: row.try_get("online")?,
        tags: serde_json::from_str(&tags)?,
        metadata: serde_json::from_str(&metadata)?,
    })
}

fn parameter_from_row(row: SqliteRow) -> Result<Parameter> {
    Ok(Parameter {
        id: row.try_get("id")?,
        device_id: row.try_get("device_id")?,
        name: row.try_get("name")?,
        value: row.try_get("value")?,
        param_type: row.try_get("param_type")?,
        writable: row.try_get("writable")?,
        last_updated: row.try_get("last_updated")?,
    })
}

fn task_from_row(row: SqliteRow) -> Result<Task> {
    let kind = TaskKind::parse(row.try_get::<String, _>("kind")?.as_str())?;
    let payload: Value = serde_json::from_str(row.try_get::<String, _>("payload")?.as_str())?;
    let result: Option<String> = row.try_get("result")?;
    Ok(Task {
        id: row.try_get("id")?,
        device_id: row.try_get("device_id")?,
        command: TaskCommand::from_parts(kind, &payload)?,
        status: TaskStatus::parse(row.try_get::<String, _>("status")?.as_str())?,
        created_at: row.try_get("created_at")?,
        completed_at: row.try_get("completed_at")?,
        result: result.map(|r| serde_json::from_str(&r)).transpose()?,
    })
}

fn session_from_row(row: SqliteRow) -> Result<CwmpSession> {
    let events: String = row.try_get("inform_events")?;
    Ok(CwmpSession {
        id: row.try_get("id")?,
        device_id: row.try_get("device_id")?,
        started_at: row.try_get("started_at")?,
        ended_at: row.try_get("ended_at")?,
        inform_events: serde_json::from_str(&events)?,
        messages_exchanged: row.try_get("messages_exchanged")?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    fn test_identity() -> DeviceIdStruct {
        DeviceIdStruct {
            manufacturer: "TestVendor".to_string(),
            oui: "ABCDEF".to_string(),
            product_class: "TestRouter".to_string(),
            serial_number: "TEST123456".to_string(),
        }
    }

    async fn test_store() -> DeviceStore {
        DeviceStore::connect("sqlite::memory:").await.unwrap()
    }

    #[tokio::test]
    async fn test_upsert_device_preserves_first_seen() {
        let store = test_store().await;
        let identity = test_identity();
        let t0 = Utc::now();

        store.upsert_device(&identity, t0).await.unwrap();
        store
            .upsert_device(&identity, t0 + Duration::seconds(60))
            .await
            .unwrap();

        let device = store
            .get_device(&identity.device_id())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(device.first_seen, t0);
        assert_eq!(device.manufacturer, "TestVendor");
        assert!(!device.online);
    }

    #[tokio::test]
    async fn test_touch_liveness_orders_first_seen_before_last_inform() {
        let store = test_store().await;
        let identity = test_identity();
        let now = Utc::now();

        store.upsert_device(&identity, now).await.unwrap();
        store
            .touch_liveness(&identity.device_id(), "203.0.113.1", now)
            .await
            .unwrap();

        let device = store
            .get_device(&identity.device_id())
            .await
            .unwrap()
            .unwrap();
        assert!(device.online);
        assert_eq!(device.ip_address.as_deref(), Some("203.0.113.1"));
        let last_inform = device.last_inform.unwrap();
        assert!(device.first_seen <= last_inform);
    }

    #[tokio::test]
    async fn test_parameter_upsert_overwrites_in_place() {
        let store = test_store().await;
        let identity = test_identity();
        let device_id = identity.device_id();
        let now = Utc::now();
        store.upsert_device(&identity, now).await.unwrap();

        let name = "InternetGatewayDevice.DeviceInfo.SoftwareVersion";
        store
            .upsert_parameter(&device_id, name, "1.0.0", now)
            .await
            .unwrap();
        store
            .upsert_parameter(&device_id, name, "1.0.1", now + Duration::seconds(1))
            .await
            .unwrap();

        let params = store.list_parameters(&device_id).await.unwrap();
        assert_eq!(params.len(), 1);
        assert_eq!(params[0].value, "1.0.1");
        assert_eq!(params[0].last_updated, now + Duration::seconds(1));
    }

    #[tokio::test]
    async fn test_peek_pending_is_fifo_with_id_tiebreak() {
        let store = test_store().await;
        let identity = test_identity();
        let device_id = identity.device_id();
        let now = Utc::now();
        store.upsert_device(&identity, now).await.unwrap();

        // Same created_at: the lower id must win
        let first = store
            .create_task(&device_id, &TaskCommand::Reboot, now)
            .await
            .unwrap();
        let _second = store
            .create_task(&device_id, &TaskCommand::FactoryReset, now)
            .await
            .unwrap();

        let peeked = store.peek_pending_task(&device_id).await.unwrap().unwrap();
        assert_eq!(peeked.id, first.id);
        assert_eq!(peeked.command, TaskCommand::Reboot);
    }

    #[tokio::test]
    async fn test_advance_task_status_is_conditional() {
        let store = test_store().await;
        let identity = test_identity();
        let device_id = identity.device_id();
        let now = Utc::now();
        store.upsert_device(&identity, now).await.unwrap();

        let task = store
            .create_task(&device_id, &TaskCommand::Reboot, now)
            .await
            .unwrap();

        store
            .advance_task_status(task.id, TaskStatus::Pending, TaskStatus::Sent, None, now)
            .await
            .unwrap();

        // Second pending->sent must lose: the status already moved on
        let raced = store
            .advance_task_status(task.id, TaskStatus::Pending, TaskStatus::Sent, None, now)
            .await;
        assert!(matches!(raced, Err(Error::StoreConflict(_))));

        store
            .advance_task_status(
                task.id,
                TaskStatus::Sent,
                TaskStatus::Completed,
                Some(&serde_json::json!({"ok": true})),
                now,
            )
            .await
            .unwrap();

        // No back-edges: a completed task cannot regress
        assert!(store
            .advance_task_status(task.id, TaskStatus::Completed, TaskStatus::Pending, None, now)
            .await
            .is_err());

        let history = store.list_tasks(&device_id).await.unwrap();
        assert_eq!(history.len(), 1);
        assert_eq!(history[0].status, TaskStatus::Completed);
    }

    #[tokio::test]
    async fn test_latest_sent_task_by_kind() {
        let store = test_store().await;
        let identity = test_identity();
        let device_id = identity.device_id();
        let now = Utc::now();
        store.upsert_device(&identity, now).await.unwrap();

        let get = store
            .create_task(
                &device_id,
                &TaskCommand::GetParams {
                    names: vec!["A.B".to_string()],
                },
                now,
            )
            .await
            .unwrap();
        store
            .advance_task_status(get.id, TaskStatus::Pending, TaskStatus::Sent, None, now)
            .await
            .unwrap();

        let found = store
            .latest_sent_task(&device_id, Some(TaskKind::GetParams))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(found.id, get.id);

        assert!(store
            .latest_sent_task(&device_id, Some(TaskKind::SetParams))
            .await
            .unwrap()
            .is_none());
        assert!(store
            .latest_sent_task(&device_id, None)
            .await
            .unwrap()
            .is_some());
    }

    #[tokio::test]
    async fn test_sweep_offline_leaves_last_inform_untouched() {
        let store = test_store().await;
        let identity = test_identity();
        let device_id = identity.device_id();
        let informed_at = Utc::now() - Duration::seconds(10);

        store.upsert_device(&identity, informed_at).await.unwrap();
        store
            .touch_liveness(&device_id, "203.0.113.1", informed_at)
            .await
            .unwrap();

        let swept = store
            .sweep_offline(informed_at + Duration::seconds(5))
            .await
            .unwrap();
        assert_eq!(swept, 1);

        let device = store.get_device(&device_id).await.unwrap().unwrap();
        assert!(!device.online);
        assert_eq!(device.last_inform, Some(informed_at));

        // Idempotent: nothing left to flip
        let swept_again = store
            .sweep_offline(informed_at + Duration::seconds(5))
            .await
            .unwrap();
        assert_eq!(swept_again, 0);
    }

    #[tokio::test]
    async fn test_stats_counts() {
        let store = test_store().await;
        let identity = test_identity();
        let device_id = identity.device_id();
        let now = Utc::now();

        store.upsert_device(&identity, now).await.unwrap();
        store
            .touch_liveness(&device_id, "203.0.113.1", now)
            .await
            .unwrap();
        store
            .create_task(&device_id, &TaskCommand::Reboot, now)
            .await
            .unwrap();

        let stats = store.stats().await.unwrap();
        assert_eq!(stats.total_devices, 1);
        assert_eq!(stats.online, 1);
        assert_eq!(stats.offline, 0);
        assert_eq!(stats.pending_tasks, 1);
    }

    #[tokio::test]
    async fn test_session_lifecycle() {
        let store = test_store().await;
        let identity = test_identity();
        let device_id = identity.device_id();
        let now = Utc::now();
        store.upsert_device(&identity, now).await.unwrap();

        let events = vec!["0 BOOTSTRAP".to_string(), "2 PERIODIC".to_string()];
        store
            .open_session("sess-1", &device_id, &events, now)
            .await
            .unwrap();
        store.bump_session("sess-1").await.unwrap();

        let session = store.get_session("sess-1").await.unwrap().unwrap();
        assert_eq!(session.device_id, device_id);
        assert_eq!(session.inform_events, events);
        assert_eq!(session.messages_exchanged, 2);
        assert!(session.ended_at.is_none());

        store.close_session("sess-1", now).await.unwrap();
        let closed = store.get_session("sess-1").await.unwrap().unwrap();
        assert!(closed.ended_at.is_some());
    }
}
