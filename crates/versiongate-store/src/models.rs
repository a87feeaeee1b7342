//! Row types for the persisted tables

use chrono::{DateTime, SubsecRound, Utc};
use serde::{Deserialize, Serialize};

/// A managed machine as last reported by the MDM
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Device {
    pub device_id: String,
    pub device_name: String,
    pub model: String,
    pub serial_number: String,
    pub platform: String,
    pub os_version: String,
    /// Owner email (`user_name` column)
    pub user_email: String,
    pub user_mdm_id: String,
    pub last_check_in: Option<DateTime<Utc>>,
    pub created_at: Option<DateTime<Utc>>,
    pub updated_at: Option<DateTime<Utc>>,
}

/// A person known to both the chat directory and the MDM
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct User {
    pub slack_id: String,
    pub mdm_id: String,
    pub long_name: String,
    pub email: String,
    /// Minutes east of UTC
    pub tz_offset: i64,
    pub created_at: Option<DateTime<Utc>>,
    pub updated_at: Option<DateTime<Utc>>,
}

/// Ledger row: one per tracked, non-compliant, non-excluded device
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ComplianceRecord {
    pub serial_number: String,
    pub slack_id: String,
    pub user_email: String,
    pub manager_slack_id: Option<String>,
    pub first_ack: bool,
    pub first_ack_time: Option<DateTime<Utc>>,
    pub first_message_sent: bool,
    pub first_message_sent_at: Option<DateTime<Utc>>,
    pub first_message_waiting: bool,
    pub manager_message_sent: bool,
    pub manager_message_sent_at: Option<DateTime<Utc>>,
    pub full_name: String,
    /// `None` means no reminder is scheduled
    pub delay_at: Option<DateTime<Utc>>,
    pub delay_date: String,
    pub delay_time: String,
    pub delay_sent: bool,
    pub tz_offset: i64,
    pub created_at: Option<DateTime<Utc>>,
    pub updated_at: Option<DateTime<Utc>>,
}

impl ComplianceRecord {
    /// A fresh record with acknowledgement and reminder state zeroed
    pub fn new(
        serial_number: impl Into<String>,
        slack_id: impl Into<String>,
        user_email: impl Into<String>,
        full_name: impl Into<String>,
        tz_offset: i64,
    ) -> Self {
        Self {
            serial_number: serial_number.into(),
            slack_id: slack_id.into(),
            user_email: user_email.into(),
            manager_slack_id: None,
            first_ack: false,
            first_ack_time: None,
            first_message_sent: false,
            first_message_sent_at: None,
            first_message_waiting: false,
            manager_message_sent: false,
            manager_message_sent_at: None,
            full_name: full_name.into(),
            delay_at: None,
            delay_date: String::new(),
            delay_time: String::new(),
            delay_sent: false,
            tz_offset,
            created_at: None,
            updated_at: None,
        }
    }

    /// A reminder is scheduled and has not been dispatched yet
    pub fn has_pending_reminder(&self) -> bool {
        self.delay_at.is_some() && !self.delay_sent
    }
}

/// A time-boxed exemption for one device
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Exclusion {
    pub serial_number: String,
    pub approved: bool,
    pub user_email: String,
    pub reason: String,
    pub until: DateTime<Utc>,
    pub created_at: Option<DateTime<Utc>>,
    pub updated_at: Option<DateTime<Utc>>,
}

impl Exclusion {
    /// `until` is kept to whole seconds so it reads back unchanged
    pub fn new(
        serial_number: impl Into<String>,
        user_email: impl Into<String>,
        reason: impl Into<String>,
        until: DateTime<Utc>,
        approved: bool,
    ) -> Self {
        Self {
            serial_number: serial_number.into(),
            approved,
            user_email: user_email.into(),
            reason: reason.into(),
            until: until.trunc_subsecs(0),
            created_at: None,
            updated_at: None,
        }
    }

    /// Approved and not yet expired
    pub fn suppresses(&self, now: DateTime<Utc>) -> bool {
        self.approved && self.until > now
    }
}

/// Device joined to its owner, used to (re)build the ledger
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Overlap {
    pub user_email: String,
    pub full_name: String,
    pub serial_number: String,
    pub slack_id: String,
    pub os_version: String,
    pub tz_offset: i64,
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    #[test]
    fn new_record_is_zeroed() {
        let record = ComplianceRecord::new("S1", "U1", "a@example.com", "A Person", -300);
        assert!(!record.first_ack);
        assert!(!record.first_message_sent);
        assert!(record.delay_at.is_none());
        assert!(!record.has_pending_reminder());
    }

    #[test]
    fn exclusion_suppression() {
        let now = versiongate_util::now();
        let future = now + Duration::days(7);

        assert!(Exclusion::new("S1", "a@example.com", "loaner", future, true).suppresses(now));
        assert!(!Exclusion::new("S1", "a@example.com", "loaner", future, false).suppresses(now));
        assert!(
            !Exclusion::new("S1", "a@example.com", "loaner", now - Duration::days(1), true)
                .suppresses(now)
        );
    }
}
