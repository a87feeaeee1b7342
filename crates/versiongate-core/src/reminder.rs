//! Delayed reminders
//!
//! The scheduler scans the ledger on every poll tick. A reminder that is
//! due within one poll interval (either side) is claimed in the store and
//! handed to the registry, which sleeps until it is due and then delivers
//! it. Claiming flips `delay_sent` for the exact `delay_at`, so overlapping
//! ticks never dispatch the same reminder twice.

use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use versiongate_config::Settings;
use versiongate_provider::{DeviceFilter, Messenger, ReminderPayload};
use versiongate_store::{AuditEvent, AuditEventType, ComplianceRecord};
use versiongate_util::{Result, abs_duration, locale_diff};

use crate::{Collaborators, ExclusionManager};

/// Text of a user-requested reminder
pub const REMINDER_TEXT: &str = ":wave: Here is your requested reminder to update your device!";

/// OS reported when the device lookup fails
pub const UNKNOWN_OS: &str = "unknown";

struct Outstanding {
    generation: u64,
    token: CancellationToken,
}

#[derive(Default)]
struct RegistryState {
    next_generation: u64,
    entries: HashMap<String, Outstanding>,
}

/// Outstanding reminder tasks keyed by serial
#[derive(Clone, Default)]
pub struct ReminderRegistry {
    state: Arc<Mutex<RegistryState>>,
}

impl ReminderRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, RegistryState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Deliver `payload` after `delay` unless cancelled first.
    ///
    /// A reminder already outstanding for the same serial is cancelled and
    /// replaced. Cancelling `parent` cancels the reminder too.
    pub fn schedule(
        &self,
        delay: Duration,
        payload: ReminderPayload,
        messenger: Arc<dyn Messenger>,
        parent: &CancellationToken,
    ) {
        let serial = payload.serial.clone();
        let token = parent.child_token();

        let generation = {
            let mut state = self.lock();
            state.next_generation += 1;
            let generation = state.next_generation;
            if let Some(previous) = state.entries.insert(
                serial.clone(),
                Outstanding {
                    generation,
                    token: token.clone(),
                },
            ) {
                debug!(serial = %serial, "Replacing outstanding reminder");
                previous.token.cancel();
            }
            generation
        };

        let registry = self.clone();
        tokio::spawn(async move {
            tokio::select! {
                _ = token.cancelled() => {
                    debug!(serial = %serial, "Reminder cancelled");
                }
                _ = tokio::time::sleep(delay) => {
                    match messenger.reminder_message(&payload).await {
                        Ok(()) => info!(serial = %serial, slack_id = %payload.slack_id, "Reminder delivered"),
                        Err(e) => warn!(serial = %serial, error = %e, "Reminder delivery failed"),
                    }
                }
            }
            registry.finish(&serial, generation);
        });
    }

    fn finish(&self, serial: &str, generation: u64) {
        let mut state = self.lock();
        if state
            .entries
            .get(serial)
            .is_some_and(|o| o.generation == generation)
        {
            state.entries.remove(serial);
        }
    }

    /// Cancel the outstanding reminder for a serial, if any
    pub fn cancel(&self, serial: &str) -> bool {
        match self.lock().entries.remove(serial) {
            Some(outstanding) => {
                outstanding.token.cancel();
                true
            }
            None => false,
        }
    }

    /// Cancel every outstanding reminder, returning how many there were
    pub fn cancel_all(&self) -> usize {
        let drained: Vec<Outstanding> = self.lock().entries.drain().map(|(_, o)| o).collect();
        for outstanding in &drained {
            outstanding.token.cancel();
        }
        drained.len()
    }

    pub fn outstanding(&self) -> usize {
        self.lock().entries.len()
    }

    pub fn contains(&self, serial: &str) -> bool {
        self.lock().entries.contains_key(serial)
    }
}

/// Outcome of one poll tick
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PollReport {
    pub dispatched: usize,
    /// Records whose reminder date/time could not be parsed
    pub failed: usize,
}

/// Finds near-due reminders and hands them to the registry
pub struct ReminderScheduler {
    settings: Settings,
    collab: Collaborators,
    exclusions: ExclusionManager,
    registry: ReminderRegistry,
}

impl ReminderScheduler {
    pub fn new(settings: Settings, collab: Collaborators, registry: ReminderRegistry) -> Self {
        Self {
            exclusions: ExclusionManager::new(collab.store.clone()),
            settings,
            collab,
            registry,
        }
    }

    /// One poll tick
    pub async fn poll(&self, now: DateTime<Utc>, token: &CancellationToken) -> Result<PollReport> {
        let window = self.settings.schedule.poll_interval;
        let suppressed = self.exclusions.active_suppressions(now)?;
        let mut report = PollReport::default();

        for record in self.collab.store.list_records()? {
            if !record.has_pending_reminder() || suppressed.contains(&record.serial_number) {
                continue;
            }
            let Some(delay_at) = record.delay_at else {
                continue;
            };

            let diff = match locale_diff(record.tz_offset, &record.delay_date, &record.delay_time, now)
            {
                Ok(diff) => diff,
                Err(e) => {
                    warn!(serial = %record.serial_number, error = %e, "Bad reminder time");
                    report.failed += 1;
                    continue;
                }
            };

            if abs_duration(diff) > window {
                continue;
            }

            // No await between the claim and the schedule
            let payload = self.payload(&record).await;
            if !self.collab.store.claim_delay(&record.serial_number, delay_at)? {
                debug!(serial = %record.serial_number, "Reminder already claimed");
                continue;
            }

            // Overdue reminders fire right away
            let delay = diff.to_std().unwrap_or(Duration::ZERO);
            self.registry
                .schedule(delay, payload, self.collab.messenger.clone(), token);

            if let Err(e) = self.collab.store.append_audit(AuditEvent::new(
                AuditEventType::ReminderDispatched {
                    serial: record.serial_number.clone(),
                    delay_at,
                },
            )) {
                warn!(error = %e, "Failed to write audit event");
            }
            info!(
                serial = %record.serial_number,
                delay_secs = delay.as_secs(),
                "Reminder dispatched"
            );
            report.dispatched += 1;
        }

        Ok(report)
    }

    async fn payload(&self, record: &ComplianceRecord) -> ReminderPayload {
        let os_version = match self
            .collab
            .mdm
            .query_devices(&DeviceFilter::serial(&record.serial_number))
            .await
        {
            Ok(devices) => devices
                .into_iter()
                .next()
                .map(|d| d.os_version)
                .unwrap_or_else(|| UNKNOWN_OS.to_string()),
            Err(e) => {
                debug!(serial = %record.serial_number, error = %e, "Device lookup failed");
                UNKNOWN_OS.to_string()
            }
        };

        let policy = &self.settings.compliance;
        ReminderPayload {
            slack_id: record.slack_id.clone(),
            user_email: record.user_email.clone(),
            serial: record.serial_number.clone(),
            required_version: policy.required_version.clone(),
            os_version,
            deadline_date: policy.deadline_date.clone(),
            cutoff_time: policy.cutoff_time.clone(),
            text: REMINDER_TEXT.to_string(),
        }
    }
}
