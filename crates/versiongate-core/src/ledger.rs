//! Compliance ledger service and user directory sync

use chrono::{DateTime, Utc};
use std::collections::HashSet;
use std::sync::Arc;
use tracing::{debug, info, warn};
use versiongate_config::TestingMode;
use versiongate_provider::{Directory, MdmDevice, MdmProvider, MdmUser, UserFilter};
use versiongate_store::{ComplianceRecord, Device, Store, User};
use versiongate_util::{ComplianceError, Result, local_due, satisfies};

/// Device row derived wholesale from an MDM record
pub fn device_from_mdm(device: &MdmDevice) -> Device {
    Device {
        device_id: device.device_id.clone(),
        device_name: device.device_name.clone(),
        model: device.model.clone(),
        serial_number: device.serial_number.clone(),
        platform: device.platform.clone(),
        os_version: device.os_version.clone(),
        user_email: device.user.email.clone(),
        user_mdm_id: device.user.id.clone(),
        last_check_in: device.last_check_in,
        created_at: None,
        updated_at: None,
    }
}

/// Outcome of a batch add
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BatchReport {
    /// Serials that now have a ledger row
    pub added: Vec<String>,
    /// Serials whose owner could not be resolved to a chat user
    pub unresolved: Vec<String>,
    /// Serials skipped by testing mode
    pub filtered: Vec<String>,
}

impl BatchReport {
    /// `PartialFailure` when some entries could not be resolved
    pub fn partial_failure(&self) -> Option<ComplianceError> {
        if self.unresolved.is_empty() {
            None
        } else {
            Some(ComplianceError::PartialFailure {
                succeeded: self.added.len(),
                unresolved: self.unresolved.len(),
            })
        }
    }
}

/// Per-device tracking records (`bot_results`)
#[derive(Clone)]
pub struct Ledger {
    store: Arc<dyn Store>,
    directory: Arc<dyn Directory>,
}

impl Ledger {
    pub fn new(store: Arc<dyn Store>, directory: Arc<dyn Directory>) -> Self {
        Self { store, directory }
    }

    /// Track one record; false if the serial is already tracked
    pub fn add_one(&self, record: &ComplianceRecord) -> Result<bool> {
        Ok(self.store.insert_record(record)?)
    }

    /// Start tracking newly non-compliant devices.
    ///
    /// Owners must already be known users. Entries whose owner cannot be
    /// resolved are reported back rather than failing the batch; store
    /// failures abort it.
    pub async fn add_batch(
        &self,
        devices: &[MdmDevice],
        testing: &TestingMode,
    ) -> Result<BatchReport> {
        let mut report = BatchReport::default();

        for device in devices {
            let serial = &device.serial_number;
            let email = device.user.email.trim();
            if email.is_empty() {
                debug!(serial = %serial, "Device has no owner");
                report.unresolved.push(serial.clone());
                continue;
            }

            let Some(user) = self.store.user_by_email(email)? else {
                debug!(serial = %serial, email = %email, "Owner not in directory");
                report.unresolved.push(serial.clone());
                continue;
            };

            if !testing.allows(&user.email, Some(&user.slack_id)) {
                report.filtered.push(serial.clone());
                continue;
            }

            let mut record = ComplianceRecord::new(
                serial,
                &user.slack_id,
                &user.email,
                &user.long_name,
                user.tz_offset,
            );
            record.manager_slack_id = self.manager_of(&user.slack_id).await;

            if self.store.insert_record(&record)? {
                self.store.upsert_devices(&[device_from_mdm(device)])?;
                report.added.push(serial.clone());
            } else {
                debug!(serial = %serial, "Already tracked");
            }
        }

        if !report.added.is_empty() || !report.unresolved.is_empty() {
            info!(
                added = report.added.len(),
                unresolved = report.unresolved.len(),
                filtered = report.filtered.len(),
                "Batch add finished"
            );
        }
        Ok(report)
    }

    pub fn by_serial(&self, serial: &str) -> Result<ComplianceRecord> {
        self.store
            .record_by_serial(serial)?
            .ok_or_else(|| ComplianceError::not_found(format!("serial {serial} is not tracked")))
    }

    pub fn by_slack_id(&self, slack_id: &str) -> Result<Vec<ComplianceRecord>> {
        Ok(self.store.records_by_slack_id(slack_id)?)
    }

    pub fn all(&self) -> Result<Vec<ComplianceRecord>> {
        Ok(self.store.list_records()?)
    }

    /// Replace the reminder fields; `delay_sent` is cleared in the same write
    pub fn update_reminder(
        &self,
        serial: &str,
        delay_at: DateTime<Utc>,
        delay_date: &str,
        delay_time: &str,
    ) -> Result<()> {
        if !self
            .store
            .update_reminder(serial, delay_at, delay_date, delay_time)?
        {
            return Err(ComplianceError::not_found(format!("serial {serial} is not tracked")));
        }
        Ok(())
    }

    /// Schedule a reminder at the owner's local `date` (`YYYY-MM-DD`) and
    /// `time` (`HH:MM`), returning the UTC due instant
    pub fn schedule_reminder(&self, serial: &str, date: &str, time: &str) -> Result<DateTime<Utc>> {
        let record = self.by_serial(serial)?;
        let due = local_due(record.tz_offset, date, time)
            .map_err(|e| ComplianceError::validation(e.to_string()))?;

        self.update_reminder(serial, due, date.trim(), time.trim())?;
        info!(serial = %serial, due = %due, "Reminder scheduled");
        Ok(due)
    }

    pub fn set_delay_sent(&self, serial: &str) -> Result<()> {
        if !self.store.set_delay_sent(serial)? {
            return Err(ComplianceError::not_found(format!("serial {serial} is not tracked")));
        }
        Ok(())
    }

    /// Record the owner's acknowledgement of the first message
    pub fn acknowledge(&self, serial: &str, at: DateTime<Utc>) -> Result<()> {
        if !self.store.record_first_ack(serial, at)? {
            return Err(ComplianceError::not_found(format!("serial {serial} is not tracked")));
        }
        Ok(())
    }

    pub fn remove(&self, serials: &[String]) -> Result<usize> {
        Ok(self.store.remove_records(serials)?)
    }

    /// Repopulate the ledger from the device/user join.
    ///
    /// Every non-compliant device with a resolvable owner gets a fresh
    /// record with acknowledgement and reminder state zeroed. Returns the
    /// number of records written.
    pub async fn build_from_overlap(
        &self,
        required_version: &str,
        testing: &TestingMode,
    ) -> Result<usize> {
        let mut written = 0;
        for overlap in self.store.device_user_overlap()? {
            match satisfies(&overlap.os_version, required_version) {
                Ok(true) => continue,
                Ok(false) => {}
                Err(e) => {
                    warn!(serial = %overlap.serial_number, error = %e, "Skipping unparsable version");
                    continue;
                }
            }
            if !testing.allows(&overlap.user_email, Some(&overlap.slack_id)) {
                continue;
            }

            let mut record = ComplianceRecord::new(
                &overlap.serial_number,
                &overlap.slack_id,
                &overlap.user_email,
                &overlap.full_name,
                overlap.tz_offset,
            );
            record.manager_slack_id = self.manager_of(&overlap.slack_id).await;
            self.store.upsert_record(&record)?;
            written += 1;
        }

        info!(records = written, "Ledger built from device overlap");
        Ok(written)
    }

    async fn manager_of(&self, slack_id: &str) -> Option<String> {
        match self.directory.manager_of(slack_id).await {
            Ok(manager) => manager,
            Err(e) => {
                debug!(slack_id = %slack_id, error = %e, "Manager lookup failed");
                None
            }
        }
    }
}

/// Outcome of a user sync
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SyncReport {
    pub synced: usize,
    /// Emails the directory does not know
    pub unresolved: Vec<String>,
}

/// Keeps the `users` table in step with the chat directory
#[derive(Clone)]
pub struct UserSync {
    store: Arc<dyn Store>,
    directory: Arc<dyn Directory>,
}

impl UserSync {
    pub fn new(store: Arc<dyn Store>, directory: Arc<dyn Directory>) -> Self {
        Self { store, directory }
    }

    /// Resolve device owners through the directory and upsert them.
    ///
    /// Owners already present in the store are skipped. Directory failures
    /// for one owner leave that owner unresolved.
    pub async fn sync_owners(&self, owners: &[MdmUser]) -> Result<SyncReport> {
        self.sync(owners, true).await
    }

    /// Refresh every MDM user from the directory
    pub async fn sync_all(&self, mdm: &dyn MdmProvider) -> Result<SyncReport> {
        let owners = mdm.get_users(&UserFilter::default()).await?;
        self.sync(&owners, false).await
    }

    async fn sync(&self, owners: &[MdmUser], skip_known: bool) -> Result<SyncReport> {
        let mut report = SyncReport::default();
        let mut seen = HashSet::new();

        for owner in owners {
            let email = owner.email.trim().to_lowercase();
            if email.is_empty() || !seen.insert(email.clone()) {
                continue;
            }
            if skip_known && self.store.user_by_email(&email)?.is_some() {
                continue;
            }

            let profile = match self.directory.lookup_by_email(&email).await {
                Ok(Some(profile)) => profile,
                Ok(None) => {
                    report.unresolved.push(email);
                    continue;
                }
                Err(e) => {
                    warn!(email = %email, error = %e, "Directory lookup failed");
                    report.unresolved.push(email);
                    continue;
                }
            };

            let long_name = if profile.real_name.is_empty() {
                owner.name.clone()
            } else {
                profile.real_name
            };
            self.store.upsert_user(&User {
                slack_id: profile.slack_id,
                mdm_id: owner.id.clone(),
                long_name,
                email: profile.email,
                tz_offset: profile.tz_offset,
                created_at: None,
                updated_at: None,
            })?;
            report.synced += 1;
        }

        if report.synced > 0 {
            info!(synced = report.synced, unresolved = report.unresolved.len(), "Users synced");
        }
        Ok(report)
    }
}
