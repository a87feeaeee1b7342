//! SQLite-based store implementation

use chrono::{DateTime, SecondsFormat, Utc};
use rusqlite::{params, params_from_iter, Connection, OptionalExtension, Row};
use std::path::Path;
use std::sync::Mutex;
use tracing::{debug, warn};

use crate::{
    AuditEvent, ComplianceRecord, Device, Exclusion, Overlap, Store, StoreError, StoreResult, User,
    COMPLIANCE_TABLES,
};

const SCHEMA: &str = r#"
    -- Chat directory users cross-referenced with MDM identity
    CREATE TABLE IF NOT EXISTS users (
        user_slack_id TEXT PRIMARY KEY,
        user_mdm_id TEXT NOT NULL DEFAULT '',
        user_long_name TEXT NOT NULL DEFAULT '',
        user_email TEXT NOT NULL,
        tz_offset INTEGER NOT NULL DEFAULT 0,
        created_at TEXT NOT NULL,
        updated_at TEXT NOT NULL
    );

    -- MDM device snapshot
    CREATE TABLE IF NOT EXISTS devices (
        device_id TEXT NOT NULL,
        device_name TEXT NOT NULL DEFAULT '',
        model TEXT NOT NULL DEFAULT '',
        serial_number TEXT PRIMARY KEY,
        platform TEXT NOT NULL DEFAULT '',
        os_version TEXT NOT NULL DEFAULT '',
        user_name TEXT NOT NULL DEFAULT '',
        user_mdm_id TEXT NOT NULL DEFAULT '',
        last_check_in TEXT,
        created_at TEXT NOT NULL,
        updated_at TEXT NOT NULL
    );

    -- Exemptions
    CREATE TABLE IF NOT EXISTS exclusions (
        serial_number TEXT PRIMARY KEY,
        approved INTEGER NOT NULL DEFAULT 0,
        user_email TEXT NOT NULL DEFAULT '',
        reason TEXT NOT NULL DEFAULT '',
        until TEXT NOT NULL,
        created_at TEXT NOT NULL,
        updated_at TEXT NOT NULL
    );

    -- Compliance ledger
    CREATE TABLE IF NOT EXISTS bot_results (
        serial_number TEXT PRIMARY KEY,
        slack_id TEXT NOT NULL,
        user_email TEXT NOT NULL DEFAULT '',
        manager_slack_id TEXT,
        first_ack INTEGER NOT NULL DEFAULT 0,
        first_ack_time TEXT,
        first_message_sent INTEGER NOT NULL DEFAULT 0,
        first_message_sent_at TEXT,
        first_message_waiting INTEGER NOT NULL DEFAULT 0,
        manager_message_sent INTEGER NOT NULL DEFAULT 0,
        manager_message_sent_at TEXT,
        full_name TEXT NOT NULL DEFAULT '',
        delay_at TEXT,
        delay_date TEXT NOT NULL DEFAULT '',
        delay_time TEXT NOT NULL DEFAULT '',
        delay_sent INTEGER NOT NULL DEFAULT 0,
        tz_offset INTEGER NOT NULL DEFAULT 0,
        created_at TEXT NOT NULL,
        updated_at TEXT NOT NULL
    );

    -- Audit log (append-only)
    CREATE TABLE IF NOT EXISTS audit_log (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        timestamp TEXT NOT NULL,
        event_json TEXT NOT NULL
    );

    -- Indexes
    CREATE INDEX IF NOT EXISTS idx_users_email ON users(user_email);
    CREATE INDEX IF NOT EXISTS idx_bot_results_slack ON bot_results(slack_id);
    CREATE INDEX IF NOT EXISTS idx_audit_timestamp ON audit_log(timestamp);
"#;

const USER_COLUMNS: &str =
    "user_slack_id, user_mdm_id, user_long_name, user_email, tz_offset, created_at, updated_at";

const DEVICE_COLUMNS: &str = "device_id, device_name, model, serial_number, platform, os_version, \
     user_name, user_mdm_id, last_check_in, created_at, updated_at";

const RECORD_COLUMNS: &str = "serial_number, slack_id, user_email, manager_slack_id, first_ack, \
     first_ack_time, first_message_sent, first_message_sent_at, first_message_waiting, \
     manager_message_sent, manager_message_sent_at, full_name, delay_at, delay_date, delay_time, \
     delay_sent, tz_offset, created_at, updated_at";

const EXCLUSION_COLUMNS: &str =
    "serial_number, approved, user_email, reason, until, created_at, updated_at";

/// Timestamps are stored as fixed-precision RFC 3339 so equality
/// comparisons in SQL are exact.
fn ts(dt: &DateTime<Utc>) -> String {
    dt.to_rfc3339_opts(SecondsFormat::Micros, true)
}

fn parse_ts(s: Option<String>) -> Option<DateTime<Utc>> {
    s.and_then(|s| DateTime::parse_from_rfc3339(&s).ok())
        .map(|dt| dt.with_timezone(&Utc))
}

fn placeholders(n: usize) -> String {
    vec!["?"; n].join(", ")
}

fn user_from_row(row: &Row<'_>) -> rusqlite::Result<User> {
    Ok(User {
        slack_id: row.get(0)?,
        mdm_id: row.get(1)?,
        long_name: row.get(2)?,
        email: row.get(3)?,
        tz_offset: row.get(4)?,
        created_at: parse_ts(row.get(5)?),
        updated_at: parse_ts(row.get(6)?),
    })
}

fn device_from_row(row: &Row<'_>) -> rusqlite::Result<Device> {
    Ok(Device {
        device_id: row.get(0)?,
        device_name: row.get(1)?,
        model: row.get(2)?,
        serial_number: row.get(3)?,
        platform: row.get(4)?,
        os_version: row.get(5)?,
        user_email: row.get(6)?,
        user_mdm_id: row.get(7)?,
        last_check_in: parse_ts(row.get(8)?),
        created_at: parse_ts(row.get(9)?),
        updated_at: parse_ts(row.get(10)?),
    })
}

fn record_from_row(row: &Row<'_>) -> rusqlite::Result<ComplianceRecord> {
    Ok(ComplianceRecord {
        serial_number: row.get(0)?,
        slack_id: row.get(1)?,
        user_email: row.get(2)?,
        manager_slack_id: row.get(3)?,
        first_ack: row.get(4)?,
        first_ack_time: parse_ts(row.get(5)?),
        first_message_sent: row.get(6)?,
        first_message_sent_at: parse_ts(row.get(7)?),
        first_message_waiting: row.get(8)?,
        manager_message_sent: row.get(9)?,
        manager_message_sent_at: parse_ts(row.get(10)?),
        full_name: row.get(11)?,
        delay_at: parse_ts(row.get(12)?),
        delay_date: row.get(13)?,
        delay_time: row.get(14)?,
        delay_sent: row.get(15)?,
        tz_offset: row.get(16)?,
        created_at: parse_ts(row.get(17)?),
        updated_at: parse_ts(row.get(18)?),
    })
}

fn exclusion_from_row(row: &Row<'_>) -> rusqlite::Result<Exclusion> {
    let until: String = row.get(4)?;
    let until = DateTime::parse_from_rfc3339(&until)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| {
            rusqlite::Error::FromSqlConversionFailure(4, rusqlite::types::Type::Text, Box::new(e))
        })?;

    Ok(Exclusion {
        serial_number: row.get(0)?,
        approved: row.get(1)?,
        user_email: row.get(2)?,
        reason: row.get(3)?,
        until,
        created_at: parse_ts(row.get(5)?),
        updated_at: parse_ts(row.get(6)?),
    })
}

/// SQLite-based store
pub struct SqliteStore {
    conn: Mutex<Connection>,
}

impl SqliteStore {
    /// Open or create a store at the given path
    pub fn open(path: impl AsRef<Path>) -> StoreResult<Self> {
        if let Some(parent) = path.as_ref().parent()
            && !parent.as_os_str().is_empty()
        {
            std::fs::create_dir_all(parent)?;
        }
        let conn = Connection::open(path)?;
        let store = Self {
            conn: Mutex::new(conn),
        };
        store.init_schema()?;
        Ok(store)
    }

    /// Create an in-memory store (for testing)
    pub fn in_memory() -> StoreResult<Self> {
        let conn = Connection::open_in_memory()?;
        let store = Self {
            conn: Mutex::new(conn),
        };
        store.init_schema()?;
        Ok(store)
    }

    fn init_schema(&self) -> StoreResult<()> {
        let conn = self.conn.lock().unwrap();
        conn.execute_batch(SCHEMA)?;

        debug!("Store schema initialized");
        Ok(())
    }

    /// Run a single-row UPDATE and report whether a row matched
    fn update_one(&self, sql: &str, params: impl rusqlite::Params) -> StoreResult<bool> {
        let conn = self.conn.lock().unwrap();
        let changed = conn.execute(sql, params)?;
        Ok(changed > 0)
    }

    fn delete_by_serials(&self, table: &str, serials: &[String]) -> StoreResult<usize> {
        if serials.is_empty() {
            return Ok(0);
        }
        let conn = self.conn.lock().unwrap();
        let sql = format!(
            "DELETE FROM {table} WHERE serial_number IN ({})",
            placeholders(serials.len())
        );
        let removed = conn.execute(&sql, params_from_iter(serials.iter()))?;
        debug!(table, requested = serials.len(), removed, "Rows deleted");
        Ok(removed)
    }

    fn write_record(&self, sql: &str, record: &ComplianceRecord) -> StoreResult<usize> {
        let conn = self.conn.lock().unwrap();
        let now = ts(&versiongate_util::now());
        let created = record.created_at.as_ref().map(ts).unwrap_or_else(|| now.clone());

        let changed = conn.execute(
            sql,
            params![
                record.serial_number,
                record.slack_id,
                record.user_email,
                record.manager_slack_id,
                record.first_ack,
                record.first_ack_time.as_ref().map(ts),
                record.first_message_sent,
                record.first_message_sent_at.as_ref().map(ts),
                record.first_message_waiting,
                record.manager_message_sent,
                record.manager_message_sent_at.as_ref().map(ts),
                record.full_name,
                record.delay_at.as_ref().map(ts),
                record.delay_date,
                record.delay_time,
                record.delay_sent,
                record.tz_offset,
                created,
                now,
            ],
        )?;
        Ok(changed)
    }

    fn write_exclusion(&self, sql: &str, exclusion: &Exclusion) -> StoreResult<usize> {
        let conn = self.conn.lock().unwrap();
        let now = ts(&versiongate_util::now());
        let created = exclusion
            .created_at
            .as_ref()
            .map(ts)
            .unwrap_or_else(|| now.clone());

        let changed = conn.execute(
            sql,
            params![
                exclusion.serial_number,
                exclusion.approved,
                exclusion.user_email,
                exclusion.reason,
                ts(&exclusion.until),
                created,
                now,
            ],
        )?;
        Ok(changed)
    }
}

impl Store for SqliteStore {
    fn upsert_user(&self, user: &User) -> StoreResult<()> {
        let conn = self.conn.lock().unwrap();
        let now = ts(&versiongate_util::now());

        conn.execute(
            &format!(
                r#"
                INSERT INTO users ({USER_COLUMNS})
                VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?6)
                ON CONFLICT(user_slack_id)
                DO UPDATE SET
                    user_mdm_id = excluded.user_mdm_id,
                    user_long_name = excluded.user_long_name,
                    user_email = excluded.user_email,
                    tz_offset = excluded.tz_offset,
                    updated_at = excluded.updated_at
                "#
            ),
            params![
                user.slack_id,
                user.mdm_id,
                user.long_name,
                user.email,
                user.tz_offset,
                now
            ],
        )?;

        debug!(slack_id = %user.slack_id, email = %user.email, "User upserted");
        Ok(())
    }

    fn user_by_email(&self, email: &str) -> StoreResult<Option<User>> {
        let conn = self.conn.lock().unwrap();
        let user = conn
            .query_row(
                &format!("SELECT {USER_COLUMNS} FROM users WHERE lower(user_email) = lower(?)"),
                [email],
                user_from_row,
            )
            .optional()?;
        Ok(user)
    }

    fn user_by_slack_id(&self, slack_id: &str) -> StoreResult<Option<User>> {
        let conn = self.conn.lock().unwrap();
        let user = conn
            .query_row(
                &format!("SELECT {USER_COLUMNS} FROM users WHERE user_slack_id = ?"),
                [slack_id],
                user_from_row,
            )
            .optional()?;
        Ok(user)
    }

    fn list_users(&self) -> StoreResult<Vec<User>> {
        let conn = self.conn.lock().unwrap();
        let mut stmt =
            conn.prepare(&format!("SELECT {USER_COLUMNS} FROM users ORDER BY user_email"))?;
        let users = stmt
            .query_map([], user_from_row)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(users)
    }

    fn upsert_devices(&self, devices: &[Device]) -> StoreResult<()> {
        if devices.is_empty() {
            return Ok(());
        }

        let mut conn = self.conn.lock().unwrap();
        let now = ts(&versiongate_util::now());
        let tx = conn.transaction()?;
        {
            let mut stmt = tx.prepare(&format!(
                r#"
                INSERT INTO devices ({DEVICE_COLUMNS})
                VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?10)
                ON CONFLICT(serial_number)
                DO UPDATE SET
                    device_id = excluded.device_id,
                    device_name = excluded.device_name,
                    model = excluded.model,
                    platform = excluded.platform,
                    os_version = excluded.os_version,
                    user_name = excluded.user_name,
                    user_mdm_id = excluded.user_mdm_id,
                    last_check_in = excluded.last_check_in,
                    updated_at = excluded.updated_at
                "#
            ))?;

            for device in devices {
                stmt.execute(params![
                    device.device_id,
                    device.device_name,
                    device.model,
                    device.serial_number,
                    device.platform,
                    device.os_version,
                    device.user_email,
                    device.user_mdm_id,
                    device.last_check_in.as_ref().map(ts),
                    now,
                ])?;
            }
        }
        tx.commit()?;

        debug!(count = devices.len(), "Devices upserted");
        Ok(())
    }

    fn device_by_serial(&self, serial: &str) -> StoreResult<Option<Device>> {
        let conn = self.conn.lock().unwrap();
        let device = conn
            .query_row(
                &format!("SELECT {DEVICE_COLUMNS} FROM devices WHERE serial_number = ?"),
                [serial],
                device_from_row,
            )
            .optional()?;
        Ok(device)
    }

    fn list_devices(&self) -> StoreResult<Vec<Device>> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare(&format!(
            "SELECT {DEVICE_COLUMNS} FROM devices ORDER BY serial_number"
        ))?;
        let devices = stmt
            .query_map([], device_from_row)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(devices)
    }

    fn remove_devices(&self, serials: &[String]) -> StoreResult<usize> {
        self.delete_by_serials("devices", serials)
    }

    fn device_user_overlap(&self) -> StoreResult<Vec<Overlap>> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare(
            r#"
            SELECT d.user_name, u.user_long_name, d.serial_number, u.user_slack_id,
                   d.os_version, u.tz_offset
            FROM devices d
            JOIN users u ON (lower(u.user_email) = lower(d.user_name))
            WHERE d.user_name <> '' AND u.user_slack_id <> ''
            ORDER BY d.serial_number
            "#,
        )?;

        let rows = stmt
            .query_map([], |row| {
                Ok(Overlap {
                    user_email: row.get(0)?,
                    full_name: row.get(1)?,
                    serial_number: row.get(2)?,
                    slack_id: row.get(3)?,
                    os_version: row.get(4)?,
                    tz_offset: row.get(5)?,
                })
            })?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    fn insert_record(&self, record: &ComplianceRecord) -> StoreResult<bool> {
        let sql = format!(
            "INSERT INTO bot_results ({RECORD_COLUMNS}) VALUES ({}) \
             ON CONFLICT(serial_number) DO NOTHING",
            placeholders(19)
        );
        let inserted = self.write_record(&sql, record)? > 0;
        debug!(serial = %record.serial_number, inserted, "Ledger insert");
        Ok(inserted)
    }

    fn upsert_record(&self, record: &ComplianceRecord) -> StoreResult<()> {
        let sql = format!(
            r#"
            INSERT INTO bot_results ({RECORD_COLUMNS}) VALUES ({})
            ON CONFLICT(serial_number)
            DO UPDATE SET
                slack_id = excluded.slack_id,
                user_email = excluded.user_email,
                manager_slack_id = excluded.manager_slack_id,
                first_ack = excluded.first_ack,
                first_ack_time = excluded.first_ack_time,
                first_message_sent = excluded.first_message_sent,
                first_message_sent_at = excluded.first_message_sent_at,
                first_message_waiting = excluded.first_message_waiting,
                manager_message_sent = excluded.manager_message_sent,
                manager_message_sent_at = excluded.manager_message_sent_at,
                full_name = excluded.full_name,
                delay_at = excluded.delay_at,
                delay_date = excluded.delay_date,
                delay_time = excluded.delay_time,
                delay_sent = excluded.delay_sent,
                tz_offset = excluded.tz_offset,
                updated_at = excluded.updated_at
            "#,
            placeholders(19)
        );
        self.write_record(&sql, record)?;
        debug!(serial = %record.serial_number, "Ledger upsert");
        Ok(())
    }

    fn record_by_serial(&self, serial: &str) -> StoreResult<Option<ComplianceRecord>> {
        let conn = self.conn.lock().unwrap();
        let record = conn
            .query_row(
                &format!("SELECT {RECORD_COLUMNS} FROM bot_results WHERE serial_number = ?"),
                [serial],
                record_from_row,
            )
            .optional()?;
        Ok(record)
    }

    fn records_by_slack_id(&self, slack_id: &str) -> StoreResult<Vec<ComplianceRecord>> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare(&format!(
            "SELECT {RECORD_COLUMNS} FROM bot_results WHERE slack_id = ? ORDER BY serial_number"
        ))?;
        let records = stmt
            .query_map([slack_id], record_from_row)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(records)
    }

    fn list_records(&self) -> StoreResult<Vec<ComplianceRecord>> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare(&format!(
            "SELECT {RECORD_COLUMNS} FROM bot_results ORDER BY serial_number"
        ))?;
        let records = stmt
            .query_map([], record_from_row)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(records)
    }

    fn update_reminder(
        &self,
        serial: &str,
        delay_at: DateTime<Utc>,
        delay_date: &str,
        delay_time: &str,
    ) -> StoreResult<bool> {
        let found = self.update_one(
            r#"
            UPDATE bot_results
            SET delay_at = ?, delay_date = ?, delay_time = ?, delay_sent = 0, updated_at = ?
            WHERE serial_number = ?
            "#,
            params![
                ts(&delay_at),
                delay_date,
                delay_time,
                ts(&versiongate_util::now()),
                serial
            ],
        )?;
        debug!(serial, delay_at = %delay_at, found, "Reminder updated");
        Ok(found)
    }

    fn set_delay_sent(&self, serial: &str) -> StoreResult<bool> {
        self.update_one(
            "UPDATE bot_results SET delay_sent = 1, updated_at = ? WHERE serial_number = ?",
            params![ts(&versiongate_util::now()), serial],
        )
    }

    fn claim_delay(&self, serial: &str, delay_at: DateTime<Utc>) -> StoreResult<bool> {
        let claimed = self.update_one(
            r#"
            UPDATE bot_results
            SET delay_sent = 1, updated_at = ?
            WHERE serial_number = ? AND delay_at = ? AND delay_sent = 0
            "#,
            params![ts(&versiongate_util::now()), serial, ts(&delay_at)],
        )?;
        debug!(serial, claimed, "Reminder claim");
        Ok(claimed)
    }

    fn mark_first_message_sent(&self, serial: &str, at: DateTime<Utc>) -> StoreResult<bool> {
        self.update_one(
            r#"
            UPDATE bot_results
            SET first_message_sent = 1, first_message_sent_at = ?, updated_at = ?
            WHERE serial_number = ?
            "#,
            params![ts(&at), ts(&versiongate_util::now()), serial],
        )
    }

    fn set_first_message_waiting(&self, serial: &str, waiting: bool) -> StoreResult<bool> {
        self.update_one(
            "UPDATE bot_results SET first_message_waiting = ?, updated_at = ? WHERE serial_number = ?",
            params![waiting, ts(&versiongate_util::now()), serial],
        )
    }

    fn record_first_ack(&self, serial: &str, at: DateTime<Utc>) -> StoreResult<bool> {
        self.update_one(
            r#"
            UPDATE bot_results
            SET first_ack = 1, first_ack_time = COALESCE(first_ack_time, ?), updated_at = ?
            WHERE serial_number = ?
            "#,
            params![ts(&at), ts(&versiongate_util::now()), serial],
        )
    }

    fn mark_manager_message_sent(&self, serial: &str, at: DateTime<Utc>) -> StoreResult<bool> {
        self.update_one(
            r#"
            UPDATE bot_results
            SET manager_message_sent = 1, manager_message_sent_at = ?, updated_at = ?
            WHERE serial_number = ?
            "#,
            params![ts(&at), ts(&versiongate_util::now()), serial],
        )
    }

    fn set_manager(&self, serial: &str, manager_slack_id: &str) -> StoreResult<bool> {
        self.update_one(
            "UPDATE bot_results SET manager_slack_id = ?, updated_at = ? WHERE serial_number = ?",
            params![manager_slack_id, ts(&versiongate_util::now()), serial],
        )
    }

    fn remove_records(&self, serials: &[String]) -> StoreResult<usize> {
        self.delete_by_serials("bot_results", serials)
    }

    fn insert_exclusion(&self, exclusion: &Exclusion) -> StoreResult<bool> {
        let sql = format!(
            "INSERT INTO exclusions ({EXCLUSION_COLUMNS}) VALUES ({}) \
             ON CONFLICT(serial_number) DO NOTHING",
            placeholders(7)
        );
        let inserted = self.write_exclusion(&sql, exclusion)? > 0;
        debug!(serial = %exclusion.serial_number, approved = exclusion.approved, inserted, "Exclusion insert");
        Ok(inserted)
    }

    fn upsert_exclusion(&self, exclusion: &Exclusion) -> StoreResult<()> {
        let sql = format!(
            r#"
            INSERT INTO exclusions ({EXCLUSION_COLUMNS}) VALUES ({})
            ON CONFLICT(serial_number)
            DO UPDATE SET
                approved = excluded.approved,
                user_email = excluded.user_email,
                reason = excluded.reason,
                until = excluded.until,
                updated_at = excluded.updated_at
            "#,
            placeholders(7)
        );
        self.write_exclusion(&sql, exclusion)?;
        debug!(serial = %exclusion.serial_number, approved = exclusion.approved, "Exclusion upsert");
        Ok(())
    }

    fn approve_exclusion(
        &self,
        serial: &str,
        reason: Option<&str>,
        until: Option<DateTime<Utc>>,
    ) -> StoreResult<bool> {
        self.update_one(
            r#"
            UPDATE exclusions
            SET approved = 1,
                reason = COALESCE(?, reason),
                until = COALESCE(?, until),
                updated_at = ?
            WHERE serial_number = ?
            "#,
            params![
                reason,
                until.as_ref().map(ts),
                ts(&versiongate_util::now()),
                serial
            ],
        )
    }

    fn exclusion_by_serial(&self, serial: &str) -> StoreResult<Option<Exclusion>> {
        let conn = self.conn.lock().unwrap();
        let exclusion = conn
            .query_row(
                &format!("SELECT {EXCLUSION_COLUMNS} FROM exclusions WHERE serial_number = ?"),
                [serial],
                exclusion_from_row,
            )
            .optional()?;
        Ok(exclusion)
    }

    fn remove_exclusion(&self, serial: &str) -> StoreResult<bool> {
        Ok(self.delete_by_serials("exclusions", &[serial.to_string()])? > 0)
    }

    fn list_exclusions(&self) -> StoreResult<Vec<Exclusion>> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare(&format!(
            "SELECT {EXCLUSION_COLUMNS} FROM exclusions ORDER BY serial_number"
        ))?;
        let exclusions = stmt
            .query_map([], exclusion_from_row)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(exclusions)
    }

    fn clear_tables(&self, names: &[&str]) -> StoreResult<()> {
        if let Some(unknown) = names.iter().find(|n| !COMPLIANCE_TABLES.contains(*n)) {
            return Err(StoreError::UnknownTable(unknown.to_string()));
        }

        let mut conn = self.conn.lock().unwrap();
        let tx = conn.transaction()?;
        for name in names {
            tx.execute(&format!("DELETE FROM {name}"), [])?;
        }
        tx.commit()?;

        debug!(tables = ?names, "Tables cleared");
        Ok(())
    }

    fn rebuild_schema(&self) -> StoreResult<()> {
        let conn = self.conn.lock().unwrap();
        let drops: String = COMPLIANCE_TABLES
            .iter()
            .map(|t| format!("DROP TABLE IF EXISTS {t};\n"))
            .collect();
        conn.execute_batch(&drops)?;
        conn.execute_batch(SCHEMA)?;

        debug!("Compliance tables rebuilt");
        Ok(())
    }

    fn append_audit(&self, mut event: AuditEvent) -> StoreResult<()> {
        let conn = self.conn.lock().unwrap();
        let event_json = serde_json::to_string(&event.event)?;

        conn.execute(
            "INSERT INTO audit_log (timestamp, event_json) VALUES (?, ?)",
            params![ts(&event.timestamp), event_json],
        )?;

        event.id = conn.last_insert_rowid();
        debug!(event_id = event.id, "Audit event appended");

        Ok(())
    }

    fn get_recent_audits(&self, limit: usize) -> StoreResult<Vec<AuditEvent>> {
        let conn = self.conn.lock().unwrap();

        let mut stmt = conn.prepare(
            "SELECT id, timestamp, event_json FROM audit_log ORDER BY id DESC LIMIT ?",
        )?;

        let rows = stmt.query_map([limit as i64], |row| {
            let id: i64 = row.get(0)?;
            let timestamp_str: String = row.get(1)?;
            let event_json: String = row.get(2)?;
            Ok((id, timestamp_str, event_json))
        })?;

        let mut events = Vec::new();
        for row in rows {
            let (id, timestamp_str, event_json) = row?;
            let timestamp =
                parse_ts(Some(timestamp_str)).unwrap_or_else(versiongate_util::now);
            let event: crate::AuditEventType = serde_json::from_str(&event_json)?;

            events.push(AuditEvent {
                id,
                timestamp,
                event,
            });
        }

        Ok(events)
    }

    fn is_healthy(&self) -> bool {
        match self.conn.lock() {
            Ok(conn) => conn.query_row("SELECT 1", [], |_| Ok(())).is_ok(),
            Err(_) => {
                warn!("Store lock poisoned");
                false
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::AuditEventType;
    use chrono::Duration;

    fn device(serial: &str, os: &str, owner: &str) -> Device {
        Device {
            device_id: format!("id-{serial}"),
            device_name: format!("{serial}'s laptop"),
            model: "MacBookPro18,1".into(),
            serial_number: serial.into(),
            platform: "Mac".into(),
            os_version: os.into(),
            user_email: owner.into(),
            user_mdm_id: "mdm-1".into(),
            last_check_in: Some(versiongate_util::now()),
            created_at: None,
            updated_at: None,
        }
    }

    fn user(slack_id: &str, email: &str) -> User {
        User {
            slack_id: slack_id.into(),
            mdm_id: "mdm-1".into(),
            long_name: "Ada Lovelace".into(),
            email: email.into(),
            tz_offset: -300,
            created_at: None,
            updated_at: None,
        }
    }

    #[test]
    fn test_in_memory_store() {
        let store = SqliteStore::in_memory().unwrap();
        assert!(store.is_healthy());
    }

    #[test]
    fn test_open_creates_parent_dir() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("versiongate.db");
        let store = SqliteStore::open(&path).unwrap();
        assert!(store.is_healthy());
        assert!(path.exists());
    }

    #[test]
    fn test_audit_log() {
        let store = SqliteStore::in_memory().unwrap();

        let event = AuditEvent::new(AuditEventType::ServiceStarted);
        store.append_audit(event).unwrap();

        let events = store.get_recent_audits(10).unwrap();
        assert_eq!(events.len(), 1);
        assert!(matches!(events[0].event, AuditEventType::ServiceStarted));
    }

    #[test]
    fn test_users() {
        let store = SqliteStore::in_memory().unwrap();
        store.upsert_user(&user("U1", "ada@example.com")).unwrap();

        let by_email = store.user_by_email("ADA@example.com").unwrap().unwrap();
        assert_eq!(by_email.slack_id, "U1");
        assert_eq!(by_email.tz_offset, -300);

        let mut moved = user("U1", "ada@example.com");
        moved.tz_offset = 60;
        store.upsert_user(&moved).unwrap();
        assert_eq!(store.user_by_slack_id("U1").unwrap().unwrap().tz_offset, 60);
        assert_eq!(store.list_users().unwrap().len(), 1);
    }

    #[test]
    fn test_devices_and_overlap() {
        let store = SqliteStore::in_memory().unwrap();
        store
            .upsert_devices(&[
                device("S1", "12.0", "ada@example.com"),
                device("S2", "13.1", "ada@example.com"),
                device("S3", "12.0", "nobody@example.com"),
                device("S4", "12.0", ""),
            ])
            .unwrap();
        store.upsert_user(&user("U1", "ada@example.com")).unwrap();

        assert_eq!(store.list_devices().unwrap().len(), 4);

        let overlap = store.device_user_overlap().unwrap();
        let serials: Vec<_> = overlap.iter().map(|o| o.serial_number.as_str()).collect();
        assert_eq!(serials, vec!["S1", "S2"]);
        assert_eq!(overlap[0].slack_id, "U1");
        assert_eq!(overlap[0].tz_offset, -300);

        // Refresh is wholesale
        store
            .upsert_devices(&[device("S1", "13.4", "ada@example.com")])
            .unwrap();
        assert_eq!(
            store.device_by_serial("S1").unwrap().unwrap().os_version,
            "13.4"
        );

        let removed = store
            .remove_devices(&["S1".to_string(), "S9".to_string()])
            .unwrap();
        assert_eq!(removed, 1);
        assert!(store.device_by_serial("S1").unwrap().is_none());
    }

    #[test]
    fn test_ledger_insert_does_not_overwrite() {
        let store = SqliteStore::in_memory().unwrap();
        let record = ComplianceRecord::new("S1", "U1", "ada@example.com", "Ada", 0);

        assert!(store.insert_record(&record).unwrap());
        store
            .record_first_ack("S1", versiongate_util::now())
            .unwrap();

        assert!(!store.insert_record(&record).unwrap());
        assert!(store.record_by_serial("S1").unwrap().unwrap().first_ack);

        // Upsert zeroes it again
        store.upsert_record(&record).unwrap();
        assert!(!store.record_by_serial("S1").unwrap().unwrap().first_ack);
    }

    #[test]
    fn test_records_by_slack_id() {
        let store = SqliteStore::in_memory().unwrap();
        for serial in ["S1", "S2"] {
            store
                .insert_record(&ComplianceRecord::new(serial, "U1", "a@example.com", "A", 0))
                .unwrap();
        }
        store
            .insert_record(&ComplianceRecord::new("S3", "U2", "b@example.com", "B", 0))
            .unwrap();

        assert_eq!(store.records_by_slack_id("U1").unwrap().len(), 2);
        assert!(store.records_by_slack_id("U9").unwrap().is_empty());
        assert_eq!(store.list_records().unwrap().len(), 3);

        let removed = store
            .remove_records(&["S1".to_string(), "S3".to_string()])
            .unwrap();
        assert_eq!(removed, 2);
        assert_eq!(store.list_records().unwrap().len(), 1);
    }

    #[test]
    fn test_reminder_claim() {
        let store = SqliteStore::in_memory().unwrap();
        store
            .insert_record(&ComplianceRecord::new("S1", "U1", "a@example.com", "A", 0))
            .unwrap();

        let first = versiongate_util::now() + Duration::minutes(4);
        assert!(store.update_reminder("S1", first, "2024-01-02", "09:00").unwrap());

        let record = store.record_by_serial("S1").unwrap().unwrap();
        assert!(record.has_pending_reminder());
        let stored_at = record.delay_at.unwrap();

        // Exactly one claim wins
        assert!(store.claim_delay("S1", stored_at).unwrap());
        assert!(!store.claim_delay("S1", stored_at).unwrap());
        assert!(store.record_by_serial("S1").unwrap().unwrap().delay_sent);

        // A stale claim for an older reminder loses
        let second = first + Duration::hours(1);
        assert!(store.update_reminder("S1", second, "2024-01-02", "10:00").unwrap());
        let record = store.record_by_serial("S1").unwrap().unwrap();
        assert!(!record.delay_sent);
        assert!(!store.claim_delay("S1", stored_at).unwrap());
        assert!(store.claim_delay("S1", record.delay_at.unwrap()).unwrap());

        assert!(!store.update_reminder("S9", second, "2024-01-02", "10:00").unwrap());
    }

    #[test]
    fn test_escalation_fields() {
        let store = SqliteStore::in_memory().unwrap();
        store
            .insert_record(&ComplianceRecord::new("S1", "U1", "a@example.com", "A", 0))
            .unwrap();
        let now = versiongate_util::now();

        store.set_first_message_waiting("S1", true).unwrap();
        store.mark_first_message_sent("S1", now).unwrap();
        store.set_manager("S1", "UMGR").unwrap();
        store.record_first_ack("S1", now).unwrap();
        store.mark_manager_message_sent("S1", now).unwrap();

        let record = store.record_by_serial("S1").unwrap().unwrap();
        assert!(record.first_message_waiting);
        assert!(record.first_message_sent);
        assert!(record.first_ack);
        assert!(record.manager_message_sent);
        assert_eq!(record.manager_slack_id.as_deref(), Some("UMGR"));
        assert!(record.first_ack_time.is_some());

        // Second ack keeps the original time
        let later = now + Duration::hours(2);
        store.record_first_ack("S1", later).unwrap();
        let again = store.record_by_serial("S1").unwrap().unwrap();
        assert_eq!(again.first_ack_time, record.first_ack_time);
    }

    #[test]
    fn test_exclusions() {
        let store = SqliteStore::in_memory().unwrap();
        let until = versiongate_util::now() + Duration::days(30);
        let requested = Exclusion::new("S1", "a@example.com", "loaner", until, false);

        assert!(store.insert_exclusion(&requested).unwrap());
        assert!(!store.insert_exclusion(&requested).unwrap());

        assert!(store.approve_exclusion("S1", None, None).unwrap());
        let approved = store.exclusion_by_serial("S1").unwrap().unwrap();
        assert!(approved.approved);
        assert_eq!(approved.reason, "loaner");
        assert_eq!(ts(&approved.until), ts(&until));

        assert!(store.approve_exclusion("S1", Some("travel"), None).unwrap());
        assert_eq!(store.exclusion_by_serial("S1").unwrap().unwrap().reason, "travel");

        assert!(!store.approve_exclusion("S9", None, None).unwrap());
        assert!(store.exclusion_by_serial("S9").unwrap().is_none());

        let overwrite = Exclusion::new("S1", "a@example.com", "admin", until, true);
        store.upsert_exclusion(&overwrite).unwrap();
        assert_eq!(store.exclusion_by_serial("S1").unwrap().unwrap().reason, "admin");
        assert_eq!(store.list_exclusions().unwrap().len(), 1);

        assert!(store.remove_exclusion("S1").unwrap());
        assert!(!store.remove_exclusion("S1").unwrap());
    }

    #[test]
    fn test_clear_tables_rejects_unknown() {
        let store = SqliteStore::in_memory().unwrap();
        store
            .insert_record(&ComplianceRecord::new("S1", "U1", "a@example.com", "A", 0))
            .unwrap();

        let result = store.clear_tables(&["bot_results", "sessions"]);
        assert!(matches!(result, Err(StoreError::UnknownTable(ref t)) if t == "sessions"));
        assert_eq!(store.list_records().unwrap().len(), 1);

        store.clear_tables(&["bot_results"]).unwrap();
        assert!(store.list_records().unwrap().is_empty());
    }

    #[test]
    fn test_rebuild_keeps_audit_log() {
        let store = SqliteStore::in_memory().unwrap();
        store.upsert_user(&user("U1", "ada@example.com")).unwrap();
        store
            .append_audit(AuditEvent::new(AuditEventType::TablesRebuilt))
            .unwrap();

        store.rebuild_schema().unwrap();
        assert!(store.list_users().unwrap().is_empty());
        assert_eq!(store.get_recent_audits(10).unwrap().len(), 1);
    }
}
