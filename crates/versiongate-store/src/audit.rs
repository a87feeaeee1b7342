//! Audit event types

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use versiongate_util::RunId;

/// Types of audit events
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum AuditEventType {
    /// Service started
    ServiceStarted,

    /// Service stopped
    ServiceStopped,

    /// Config reload requested
    ConfigReloaded { success: bool },

    /// Periodic tasks spawned for a new epoch
    LifecycleStarted { run_id: RunId },

    /// Periodic tasks retired
    LifecycleStopped { run_id: RunId, reason: String },

    /// Devices entered tracking
    DevicesTracked { serials: Vec<String> },

    /// Devices left tracking
    DevicesReleased { serials: Vec<String> },

    /// Approved exclusion written by an administrator
    ExclusionAdded { serial: String, until: DateTime<Utc> },

    /// Unapproved exclusions requested by a user
    ExclusionRequested { slack_id: String, serials: Vec<String> },

    /// Exclusion approved
    ExclusionApproved { serial: String },

    /// Exclusion removed
    ExclusionRemoved { serial: String },

    /// Delayed reminder handed to the messenger
    ReminderDispatched { serial: String, delay_at: DateTime<Utc> },

    /// Deadline passed and enforcement ran
    DeadlineEnforced { deadline: DateTime<Utc> },

    /// Tables dropped and recreated
    TablesRebuilt,

    /// Client connected to the control socket
    ClientConnected {
        client_id: String,
        role: String,
        uid: Option<u32>,
    },

    /// Client disconnected
    ClientDisconnected { client_id: String },
}

/// Full audit event with metadata
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuditEvent {
    /// Unique event ID
    pub id: i64,

    /// Event timestamp
    pub timestamp: DateTime<Utc>,

    /// Event type and details
    pub event: AuditEventType,
}

impl AuditEvent {
    pub fn new(event: AuditEventType) -> Self {
        Self {
            id: 0, // Will be set by store
            timestamp: versiongate_util::now(),
            event,
        }
    }
}
