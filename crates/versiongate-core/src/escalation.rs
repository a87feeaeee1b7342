//! Escalation policies
//!
//! Both policies share the first phase: the owner gets the first notice
//! once, and it is resent while unacknowledged. After acknowledgement the
//! Manager policy tells the owner's manager once; the TimeBound policy
//! keeps nudging the owner on a fixed interval.
//!
//! For TimeBound the `manager_message_sent_at` column holds the time of the
//! latest nudge.

use chrono::{DateTime, Utc};
use std::time::Duration;
use tracing::{debug, info, warn};
use versiongate_config::{EscalationKind, Settings, TestingMode};
use versiongate_provider::{MessageKind, OutboundMessage};
use versiongate_store::{ComplianceRecord, Store};
use versiongate_util::Result;

use crate::{Collaborators, ExclusionManager};

/// How long an unacknowledged first notice waits before the Manager
/// policy resends it
pub const MANAGER_RESEND_AFTER: Duration = Duration::from_secs(24 * 3600);

/// Policy-specific timing
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EscalationPolicy {
    Manager {
        resend_after: Duration,
        escalate_after: Duration,
    },
    TimeBound {
        interval: Duration,
    },
}

impl EscalationPolicy {
    pub fn from_settings(settings: &Settings) -> Self {
        match settings.compliance.escalation {
            EscalationKind::Manager => EscalationPolicy::Manager {
                resend_after: MANAGER_RESEND_AFTER,
                escalate_after: settings.schedule.manager_escalation_after,
            },
            EscalationKind::TimeBound => EscalationPolicy::TimeBound {
                interval: settings.schedule.reminder_interval,
            },
        }
    }

    fn resend_after(&self) -> Duration {
        match self {
            EscalationPolicy::Manager { resend_after, .. } => *resend_after,
            EscalationPolicy::TimeBound { interval } => *interval,
        }
    }
}

/// What one check pass sent
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CheckReport {
    pub first: usize,
    pub resent: usize,
    pub escalated: usize,
}

/// A `first_message_waiting` flag older than this belongs to a send that
/// never finished
pub const FIRST_MESSAGE_WAIT_LIMIT: Duration = Duration::from_secs(15 * 60);

/// Clears `first_message_waiting` when dropped, including when the send
/// is abandoned mid-flight
struct WaitingFlag<'a> {
    store: &'a dyn Store,
    serial: &'a str,
}

impl Drop for WaitingFlag<'_> {
    fn drop(&mut self) {
        if let Err(e) = self.store.set_first_message_waiting(self.serial, false) {
            warn!(serial = %self.serial, error = %e, "Failed to clear first message flag");
        }
    }
}

/// Whether `window` has elapsed since `since`; a missing timestamp counts
/// as elapsed
fn elapsed(since: Option<DateTime<Utc>>, now: DateTime<Utc>, window: Duration) -> bool {
    since.is_none_or(|t| (now - t).to_std().is_ok_and(|d| d >= window))
}

/// The configured escalation policy bound to its collaborators
pub struct Escalation {
    policy: EscalationPolicy,
    collab: Collaborators,
    exclusions: ExclusionManager,
    testing: TestingMode,
    required_version: String,
    deadline: String,
}

impl Escalation {
    pub fn new(settings: &Settings, collab: Collaborators) -> Self {
        let policy = &settings.compliance;
        let deadline = match policy.deadline() {
            Some(dt) => dt.format("%B %-d, %Y %H:%M UTC").to_string(),
            None => format!("{} {}", policy.deadline_date, policy.cutoff_time),
        };

        Self {
            policy: EscalationPolicy::from_settings(settings),
            exclusions: ExclusionManager::new(collab.store.clone()),
            collab,
            testing: settings.testing.clone(),
            required_version: policy.required_version.clone(),
            deadline,
        }
    }

    pub fn kind(&self) -> EscalationKind {
        match self.policy {
            EscalationPolicy::Manager { .. } => EscalationKind::Manager,
            EscalationPolicy::TimeBound { .. } => EscalationKind::TimeBound,
        }
    }

    pub fn policy(&self) -> &EscalationPolicy {
        &self.policy
    }

    /// Text of the first notice
    pub fn first_message(&self) -> String {
        self.collab
            .messenger
            .first_message(&self.required_version, &self.deadline)
    }

    async fn notify(&self, kind: MessageKind, recipient: &str, text: String, serial: &str) -> bool {
        let message = OutboundMessage::new(kind, recipient, text).for_serial(serial);
        match self.collab.messenger.send(&message).await {
            Ok(()) => true,
            Err(e) => {
                warn!(kind = ?kind, recipient = %recipient, serial = %serial, error = %e, "Message not delivered");
                false
            }
        }
    }

    fn enforceable(&self, record: &ComplianceRecord, suppressed: &std::collections::HashSet<String>) -> bool {
        !suppressed.contains(&record.serial_number)
            && self.testing.allows(&record.user_email, Some(&record.slack_id))
    }

    /// One check pass over the ledger
    pub async fn check(&self, now: DateTime<Utc>) -> Result<CheckReport> {
        let store = &self.collab.store;
        let suppressed = self.exclusions.active_suppressions(now)?;
        let mut report = CheckReport::default();

        for record in store.list_records()? {
            if !self.enforceable(&record, &suppressed) {
                continue;
            }
            let serial = record.serial_number.as_str();

            if !record.first_message_sent {
                if record.first_message_waiting
                    && !elapsed(record.updated_at, now, FIRST_MESSAGE_WAIT_LIMIT)
                {
                    debug!(serial = %serial, "First message already in flight");
                    continue;
                }
                store.set_first_message_waiting(serial, true)?;
                let _waiting = WaitingFlag {
                    store: store.as_ref(),
                    serial,
                };
                let text = format!("{}\nDevice: {serial}", self.first_message());
                if self.notify(MessageKind::First, &record.slack_id, text, serial).await {
                    store.mark_first_message_sent(serial, now)?;
                    report.first += 1;
                }
                continue;
            }

            if !record.first_ack {
                if elapsed(record.first_message_sent_at, now, self.policy.resend_after()) {
                    let text = format!("Reminder: {}\nDevice: {serial}", self.first_message());
                    if self.notify(MessageKind::Resend, &record.slack_id, text, serial).await {
                        store.mark_first_message_sent(serial, now)?;
                        report.resent += 1;
                    }
                }
                continue;
            }

            match &self.policy {
                EscalationPolicy::Manager { escalate_after, .. } => {
                    if record.manager_message_sent
                        || !elapsed(record.first_ack_time, now, *escalate_after)
                    {
                        continue;
                    }
                    let Some(manager) = self.manager_for(&record).await? else {
                        debug!(serial = %serial, "No manager to escalate to");
                        continue;
                    };
                    let text = format!(
                        "{} has a device ({serial}) that is still below {}. It must be updated by {}.",
                        record.full_name, self.required_version, self.deadline
                    );
                    if self.notify(MessageKind::Manager, &manager, text, serial).await {
                        store.mark_manager_message_sent(serial, now)?;
                        report.escalated += 1;
                    }
                }
                EscalationPolicy::TimeBound { interval } => {
                    if record.has_pending_reminder() {
                        continue;
                    }
                    let last = record.manager_message_sent_at.or(record.first_ack_time);
                    if !elapsed(last, now, *interval) {
                        continue;
                    }
                    let text = format!(
                        "Your device {serial} still needs {} or later by {}.",
                        self.required_version, self.deadline
                    );
                    if self.notify(MessageKind::Nudge, &record.slack_id, text, serial).await {
                        store.mark_manager_message_sent(serial, now)?;
                        report.escalated += 1;
                    }
                }
            }
        }

        if report != CheckReport::default() {
            info!(
                first = report.first,
                resent = report.resent,
                escalated = report.escalated,
                "Check finished"
            );
        }
        Ok(report)
    }

    async fn manager_for(&self, record: &ComplianceRecord) -> Result<Option<String>> {
        if let Some(manager) = &record.manager_slack_id {
            return Ok(Some(manager.clone()));
        }
        match self.collab.directory.manager_of(&record.slack_id).await {
            Ok(Some(manager)) => {
                self.collab.store.set_manager(&record.serial_number, &manager)?;
                Ok(Some(manager))
            }
            Ok(None) => Ok(None),
            Err(e) => {
                debug!(slack_id = %record.slack_id, error = %e, "Manager lookup failed");
                Ok(None)
            }
        }
    }

    /// Tell owners who were notified that their device left tracking
    pub async fn on_removed(&self, records: &[ComplianceRecord]) {
        for record in records.iter().filter(|r| r.first_message_sent) {
            let text = format!(
                "Thanks! Device {} is no longer being tracked for the {} update.",
                record.serial_number, self.required_version
            );
            self.notify(MessageKind::Resolved, &record.slack_id, text, &record.serial_number)
                .await;
        }
    }

    /// Terminal enforcement: announce the passed deadline for every
    /// enforceable record. Returns how many owners were told.
    pub async fn deadline(&self, now: DateTime<Utc>) -> Result<usize> {
        let suppressed = self.exclusions.active_suppressions(now)?;
        let mut told = 0;

        for record in self.collab.store.list_records()? {
            if !self.enforceable(&record, &suppressed) {
                continue;
            }
            let serial = record.serial_number.as_str();
            let text = format!(
                "The deadline ({}) to update device {serial} to {} has passed.",
                self.deadline, self.required_version
            );
            if self
                .notify(MessageKind::Deadline, &record.slack_id, text.clone(), serial)
                .await
            {
                told += 1;
            }
            if let EscalationPolicy::Manager { .. } = self.policy
                && let Some(manager) = &record.manager_slack_id
            {
                self.notify(MessageKind::Deadline, manager, text, serial).await;
            }
        }

        info!(told, "Deadline enforced");
        Ok(told)
    }
}
