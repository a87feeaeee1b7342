//! Types exchanged with collaborators

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Owner of a device as the MDM knows them
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MdmUser {
    #[serde(default)]
    pub email: String,
    #[serde(default)]
    pub id: String,
    #[serde(default)]
    pub name: String,
}

/// A device as reported by the MDM
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MdmDevice {
    pub device_id: String,
    #[serde(default)]
    pub device_name: String,
    #[serde(default)]
    pub model: String,
    pub serial_number: String,
    #[serde(default)]
    pub platform: String,
    #[serde(default)]
    pub os_version: String,
    #[serde(default)]
    pub last_check_in: Option<DateTime<Utc>>,
    #[serde(default)]
    pub user: MdmUser,
    #[serde(default)]
    pub asset_tag: String,
    #[serde(default)]
    pub first_enrollment: Option<DateTime<Utc>>,
    #[serde(default)]
    pub last_enrollment: Option<DateTime<Utc>>,
}

/// Device query; unset fields match anything
#[derive(Debug, Clone, Default)]
pub struct DeviceFilter {
    pub serial_number: Option<String>,
    pub user_email: Option<String>,
    pub platform: Option<String>,
}

impl DeviceFilter {
    pub fn serial(serial: impl Into<String>) -> Self {
        Self {
            serial_number: Some(serial.into()),
            ..Default::default()
        }
    }

    pub fn matches(&self, device: &MdmDevice) -> bool {
        let eq = |want: &Option<String>, have: &str| {
            want.as_ref().is_none_or(|w| w.eq_ignore_ascii_case(have))
        };
        eq(&self.serial_number, &device.serial_number)
            && eq(&self.user_email, &device.user.email)
            && eq(&self.platform, &device.platform)
    }
}

/// User query; unset fields match anything
#[derive(Debug, Clone, Default)]
pub struct UserFilter {
    pub email: Option<String>,
}

impl UserFilter {
    pub fn matches(&self, user: &MdmUser) -> bool {
        self.email
            .as_ref()
            .is_none_or(|e| e.eq_ignore_ascii_case(&user.email))
    }
}

/// A chat-directory profile
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DirectoryUser {
    pub slack_id: String,
    pub email: String,
    #[serde(default)]
    pub real_name: String,
    /// Minutes east of UTC
    #[serde(default)]
    pub tz_offset: i64,
    #[serde(default)]
    pub manager_slack_id: Option<String>,
}

/// What an outbound message is for
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageKind {
    First,
    Resend,
    Nudge,
    Reminder,
    Manager,
    Deadline,
    /// Device left tracking
    Resolved,
    Report,
}

/// A message addressed to one chat user or channel
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OutboundMessage {
    pub kind: MessageKind,
    pub recipient: String,
    pub text: String,
    pub serial: Option<String>,
}

impl OutboundMessage {
    pub fn new(kind: MessageKind, recipient: impl Into<String>, text: impl Into<String>) -> Self {
        Self {
            kind,
            recipient: recipient.into(),
            text: text.into(),
            serial: None,
        }
    }

    pub fn for_serial(mut self, serial: impl Into<String>) -> Self {
        self.serial = Some(serial.into());
        self
    }
}

/// Everything a delayed reminder needs once it comes due
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReminderPayload {
    pub slack_id: String,
    pub user_email: String,
    pub serial: String,
    pub required_version: String,
    /// Current OS, or "unknown" when the lookup failed
    pub os_version: String,
    pub deadline_date: String,
    pub cutoff_time: String,
    pub text: String,
}

impl ReminderPayload {
    pub fn to_message(&self) -> OutboundMessage {
        let text = format!(
            "{}\nDevice {} is on {} and needs {} by {} {}.",
            self.text,
            self.serial,
            self.os_version,
            self.required_version,
            self.deadline_date,
            self.cutoff_time
        );
        OutboundMessage::new(MessageKind::Reminder, &self.slack_id, text).for_serial(&self.serial)
    }
}

/// Daily summary for administrators
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AdminReport {
    pub generated_at: Option<DateTime<Utc>>,
    pub required_version: String,
    pub deadline: Option<DateTime<Utc>>,
    pub tracked: usize,
    pub first_message_sent: usize,
    pub acknowledged: usize,
    pub manager_notified: usize,
    pub pending_reminders: usize,
    pub exclusions_approved: usize,
    pub exclusions_pending: usize,
    /// Device count per OS version across the device table
    pub os_breakdown: BTreeMap<String, usize>,
}

impl AdminReport {
    pub fn render(&self) -> String {
        let mut out = format!(
            "Compliance report (required {})\n\
             Tracked: {}\nFirst message sent: {}\nAcknowledged: {}\n\
             Manager notified: {}\nPending reminders: {}\n\
             Exclusions: {} approved, {} pending",
            self.required_version,
            self.tracked,
            self.first_message_sent,
            self.acknowledged,
            self.manager_notified,
            self.pending_reminders,
            self.exclusions_approved,
            self.exclusions_pending,
        );
        if let Some(deadline) = self.deadline {
            out.push_str(&format!("\nDeadline: {} UTC", deadline.format("%Y-%m-%d %H:%M")));
        }
        if !self.os_breakdown.is_empty() {
            out.push_str("\nOS versions:");
            for (os, count) in &self.os_breakdown {
                out.push_str(&format!("\n  {os}: {count}"));
            }
        }
        out
    }
}
