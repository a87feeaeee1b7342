//! Store trait definitions

use chrono::{DateTime, Utc};

use crate::{AuditEvent, ComplianceRecord, Device, Exclusion, Overlap, StoreResult, User};

/// Tables that make up the compliance schema
pub const COMPLIANCE_TABLES: [&str; 4] = ["users", "devices", "exclusions", "bot_results"];

/// Main store trait
///
/// Every method is a single statement or transaction; callers never hold
/// state across calls.
pub trait Store: Send + Sync {
    // Users

    /// Insert or refresh a user keyed by chat id
    fn upsert_user(&self, user: &User) -> StoreResult<()>;

    fn user_by_email(&self, email: &str) -> StoreResult<Option<User>>;

    fn user_by_slack_id(&self, slack_id: &str) -> StoreResult<Option<User>>;

    fn list_users(&self) -> StoreResult<Vec<User>>;

    // Devices

    /// Write devices wholesale, keyed by serial number
    fn upsert_devices(&self, devices: &[Device]) -> StoreResult<()>;

    fn device_by_serial(&self, serial: &str) -> StoreResult<Option<Device>>;

    fn list_devices(&self) -> StoreResult<Vec<Device>>;

    /// Delete devices by serial, returning how many rows went away
    fn remove_devices(&self, serials: &[String]) -> StoreResult<usize>;

    /// Devices whose owner email resolves to a user with a chat id
    fn device_user_overlap(&self) -> StoreResult<Vec<Overlap>>;

    // Compliance ledger

    /// Insert a record; returns false if the serial is already tracked
    fn insert_record(&self, record: &ComplianceRecord) -> StoreResult<bool>;

    /// Insert or fully replace a record
    fn upsert_record(&self, record: &ComplianceRecord) -> StoreResult<()>;

    fn record_by_serial(&self, serial: &str) -> StoreResult<Option<ComplianceRecord>>;

    fn records_by_slack_id(&self, slack_id: &str) -> StoreResult<Vec<ComplianceRecord>>;

    fn list_records(&self) -> StoreResult<Vec<ComplianceRecord>>;

    /// Set a new reminder and clear `delay_sent` in the same statement
    fn update_reminder(
        &self,
        serial: &str,
        delay_at: DateTime<Utc>,
        delay_date: &str,
        delay_time: &str,
    ) -> StoreResult<bool>;

    /// Latch `delay_sent` for whatever reminder is current
    fn set_delay_sent(&self, serial: &str) -> StoreResult<bool>;

    /// Latch `delay_sent` only if the reminder is still `delay_at` and unsent
    fn claim_delay(&self, serial: &str, delay_at: DateTime<Utc>) -> StoreResult<bool>;

    fn mark_first_message_sent(&self, serial: &str, at: DateTime<Utc>) -> StoreResult<bool>;

    fn set_first_message_waiting(&self, serial: &str, waiting: bool) -> StoreResult<bool>;

    fn record_first_ack(&self, serial: &str, at: DateTime<Utc>) -> StoreResult<bool>;

    fn mark_manager_message_sent(&self, serial: &str, at: DateTime<Utc>) -> StoreResult<bool>;

    fn set_manager(&self, serial: &str, manager_slack_id: &str) -> StoreResult<bool>;

    fn remove_records(&self, serials: &[String]) -> StoreResult<usize>;

    // Exclusions

    /// Insert an exclusion; returns false if the serial already has one
    fn insert_exclusion(&self, exclusion: &Exclusion) -> StoreResult<bool>;

    /// Insert or overwrite an exclusion
    fn upsert_exclusion(&self, exclusion: &Exclusion) -> StoreResult<()>;

    /// Approve an existing exclusion, replacing reason/until only when given
    fn approve_exclusion(
        &self,
        serial: &str,
        reason: Option<&str>,
        until: Option<DateTime<Utc>>,
    ) -> StoreResult<bool>;

    fn exclusion_by_serial(&self, serial: &str) -> StoreResult<Option<Exclusion>>;

    fn remove_exclusion(&self, serial: &str) -> StoreResult<bool>;

    fn list_exclusions(&self) -> StoreResult<Vec<Exclusion>>;

    // Maintenance

    /// Delete every row from the named tables; unknown names are rejected
    /// before anything is deleted
    fn clear_tables(&self, names: &[&str]) -> StoreResult<()>;

    /// Drop and recreate the compliance tables
    fn rebuild_schema(&self) -> StoreResult<()>;

    // Audit log

    /// Append an audit event
    fn append_audit(&self, event: AuditEvent) -> StoreResult<()>;

    /// Get recent audit events
    fn get_recent_audits(&self, limit: usize) -> StoreResult<Vec<AuditEvent>>;

    // Health

    /// Check if store is healthy
    fn is_healthy(&self) -> bool;
}
