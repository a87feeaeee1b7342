//! Time-boxed exemptions from enforcement

use chrono::{DateTime, SubsecRound, Utc};
use std::collections::HashSet;
use std::sync::Arc;
use tracing::{debug, info, warn};
use versiongate_store::{AuditEvent, AuditEventType, Exclusion, Store};
use versiongate_util::{ComplianceError, Result};

/// Exclusion workflow over the `exclusions` table
#[derive(Clone)]
pub struct ExclusionManager {
    store: Arc<dyn Store>,
}

impl ExclusionManager {
    pub fn new(store: Arc<dyn Store>) -> Self {
        Self { store }
    }

    /// Administratively exclude a device.
    ///
    /// The owner is resolved from the device table, then the ledger. An
    /// existing exclusion for the serial is overwritten and the new row is
    /// approved.
    pub fn add_exclusion(&self, serial: &str, reason: &str, until: DateTime<Utc>) -> Result<()> {
        let user_email = self.owner_of(serial)?;

        let exclusion = Exclusion::new(serial, user_email, reason, until, true);
        self.store.upsert_exclusion(&exclusion)?;
        self.audit(AuditEventType::ExclusionAdded {
            serial: serial.to_string(),
            until: exclusion.until,
        });

        info!(serial = %serial, until = %until, "Exclusion added");
        Ok(())
    }

    /// Approve a requested exclusion; reason and until are replaced only
    /// when given
    pub fn approve_exclusion(
        &self,
        serial: &str,
        reason: Option<&str>,
        until: Option<DateTime<Utc>>,
    ) -> Result<()> {
        let until = until.map(|u| u.trunc_subsecs(0));
        if !self.store.approve_exclusion(serial, reason, until)? {
            return Err(ComplianceError::not_found(format!("no exclusion for {serial}")));
        }
        self.audit(AuditEventType::ExclusionApproved {
            serial: serial.to_string(),
        });

        info!(serial = %serial, "Exclusion approved");
        Ok(())
    }

    /// A user asks for some of their tracked devices to be excluded.
    ///
    /// Inserts unapproved rows for the requested serials the user owns and
    /// returns the serials that got a new row. Existing exclusions are left
    /// untouched.
    pub fn request_exclusion(
        &self,
        slack_id: &str,
        reason: &str,
        serials: &[String],
        until: DateTime<Utc>,
    ) -> Result<Vec<String>> {
        let records = self.store.records_by_slack_id(slack_id)?;
        if records.is_empty() {
            return Err(ComplianceError::not_found(format!(
                "no tracked devices for {slack_id}"
            )));
        }

        let wanted: HashSet<&str> = serials.iter().map(String::as_str).collect();
        let mut inserted = Vec::new();
        for record in records
            .iter()
            .filter(|r| wanted.contains(r.serial_number.as_str()))
        {
            let exclusion = Exclusion::new(
                &record.serial_number,
                &record.user_email,
                reason,
                until,
                false,
            );
            if self.store.insert_exclusion(&exclusion)? {
                inserted.push(record.serial_number.clone());
            } else {
                debug!(serial = %record.serial_number, "Exclusion already present");
            }
        }

        if !inserted.is_empty() {
            self.audit(AuditEventType::ExclusionRequested {
                slack_id: slack_id.to_string(),
                serials: inserted.clone(),
            });
        }
        info!(slack_id = %slack_id, requested = inserted.len(), "Exclusion requested");
        Ok(inserted)
    }

    /// `(excluded, approved)`; lookup failures read as not excluded
    pub fn is_excluded(&self, serial: &str) -> (bool, bool) {
        match self.store.exclusion_by_serial(serial) {
            Ok(Some(exclusion)) => (true, exclusion.approved),
            Ok(None) => (false, false),
            Err(e) => {
                warn!(serial = %serial, error = %e, "Exclusion lookup failed");
                (false, false)
            }
        }
    }

    /// Insert or overwrite a row as given
    pub fn set_exclusion(&self, exclusion: &Exclusion) -> Result<()> {
        self.store.upsert_exclusion(exclusion)?;
        Ok(())
    }

    pub fn remove_exclusion(&self, serial: &str) -> Result<()> {
        if !self.store.remove_exclusion(serial)? {
            return Err(ComplianceError::not_found(format!("no exclusion for {serial}")));
        }
        self.audit(AuditEventType::ExclusionRemoved {
            serial: serial.to_string(),
        });
        Ok(())
    }

    pub fn exclusion(&self, serial: &str) -> Result<Exclusion> {
        self.store
            .exclusion_by_serial(serial)?
            .ok_or_else(|| ComplianceError::not_found(format!("no exclusion for {serial}")))
    }

    pub fn list(&self) -> Result<Vec<Exclusion>> {
        Ok(self.store.list_exclusions()?)
    }

    /// Whether enforcement is currently suppressed for a serial
    pub fn suppresses(&self, serial: &str, now: DateTime<Utc>) -> Result<bool> {
        Ok(self
            .store
            .exclusion_by_serial(serial)?
            .is_some_and(|e| e.suppresses(now)))
    }

    /// Serials with an approved, unexpired exclusion
    pub fn active_suppressions(&self, now: DateTime<Utc>) -> Result<HashSet<String>> {
        Ok(self
            .store
            .list_exclusions()?
            .into_iter()
            .filter(|e| e.suppresses(now))
            .map(|e| e.serial_number)
            .collect())
    }

    fn owner_of(&self, serial: &str) -> Result<String> {
        if let Some(device) = self.store.device_by_serial(serial)?
            && !device.user_email.is_empty()
        {
            return Ok(device.user_email);
        }
        if let Some(record) = self.store.record_by_serial(serial)? {
            return Ok(record.user_email);
        }
        Err(ComplianceError::not_found(format!("unknown serial {serial}")))
    }

    fn audit(&self, event: AuditEventType) {
        if let Err(e) = self.store.append_audit(AuditEvent::new(event)) {
            warn!(error = %e, "Failed to write audit event");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, TimeZone};
    use versiongate_store::{ComplianceRecord, Device, SqliteStore};

    fn setup() -> (Arc<dyn Store>, ExclusionManager) {
        let store: Arc<dyn Store> = Arc::new(SqliteStore::in_memory().unwrap());
        (store.clone(), ExclusionManager::new(store))
    }

    fn device(serial: &str, email: &str) -> Device {
        Device {
            device_id: format!("id-{serial}"),
            device_name: String::new(),
            model: String::new(),
            serial_number: serial.into(),
            platform: "Mac".into(),
            os_version: "12.0".into(),
            user_email: email.into(),
            user_mdm_id: String::new(),
            last_check_in: None,
            created_at: None,
            updated_at: None,
        }
    }

    #[test]
    fn add_unknown_serial_writes_nothing() {
        let (store, exclusions) = setup();
        let until = versiongate_util::now() + Duration::days(7);

        let err = exclusions.add_exclusion("NOPE", "loaner", until).unwrap_err();
        assert!(err.is_not_found());
        assert!(store.list_exclusions().unwrap().is_empty());
    }

    #[test]
    fn add_resolves_owner_and_overwrites() {
        let (store, exclusions) = setup();
        store.upsert_devices(&[device("S1", "a@example.com")]).unwrap();
        let now = versiongate_util::now();

        exclusions
            .add_exclusion("S1", "loaner", now + Duration::days(1))
            .unwrap();
        exclusions
            .add_exclusion("S1", "repair", now + Duration::days(3))
            .unwrap();

        let row = exclusions.exclusion("S1").unwrap();
        assert!(row.approved);
        assert_eq!(row.user_email, "a@example.com");
        assert_eq!(row.reason, "repair");
        assert!(exclusions.suppresses("S1", now).unwrap());
    }

    #[test]
    fn request_then_approve() {
        let (store, exclusions) = setup();
        store
            .insert_record(&ComplianceRecord::new("S1", "U1", "a@example.com", "A", 0))
            .unwrap();
        store
            .insert_record(&ComplianceRecord::new("S2", "U1", "a@example.com", "A", 0))
            .unwrap();
        let until = versiongate_util::now() + Duration::days(7);

        assert_eq!(exclusions.is_excluded("S1"), (false, false));

        let inserted = exclusions
            .request_exclusion("U1", "traveling", &["S1".to_string(), "S9".to_string()], until)
            .unwrap();
        assert_eq!(inserted, vec!["S1".to_string()]);
        assert_eq!(exclusions.is_excluded("S1"), (true, false));
        assert_eq!(exclusions.is_excluded("S2"), (false, false));

        // Pending requests never suppress
        assert!(!exclusions.suppresses("S1", versiongate_util::now()).unwrap());

        exclusions.approve_exclusion("S1", None, None).unwrap();
        assert_eq!(exclusions.is_excluded("S1"), (true, true));

        let row = exclusions.exclusion("S1").unwrap();
        assert_eq!(row.reason, "traveling");
        assert_eq!(row.until, until.trunc_subsecs(0));
    }

    #[test]
    fn until_reads_back_as_written() {
        let (store, exclusions) = setup();
        store.upsert_devices(&[device("S1", "a@example.com")]).unwrap();
        let until = Utc.with_ymd_and_hms(2030, 1, 2, 8, 0, 0).unwrap()
            + Duration::nanoseconds(387_858_520);

        exclusions.add_exclusion("S1", "loaner", until).unwrap();
        let stored = exclusions.exclusion("S1").unwrap().until;
        assert_eq!(stored, Utc.with_ymd_and_hms(2030, 1, 2, 8, 0, 0).unwrap());

        let later = until + Duration::days(1);
        exclusions.approve_exclusion("S1", None, Some(later)).unwrap();
        assert_eq!(exclusions.exclusion("S1").unwrap().until, later.trunc_subsecs(0));
    }

    #[test]
    fn request_never_overwrites() {
        let (store, exclusions) = setup();
        store
            .insert_record(&ComplianceRecord::new("S1", "U1", "a@example.com", "A", 0))
            .unwrap();
        let until = versiongate_util::now() + Duration::days(7);
        exclusions.add_exclusion("S1", "admin", until).unwrap();

        let inserted = exclusions
            .request_exclusion("U1", "mine", &["S1".to_string()], until)
            .unwrap();
        assert!(inserted.is_empty());
        assert!(exclusions.exclusion("S1").unwrap().approved);
    }

    #[test]
    fn request_for_unknown_user() {
        let (_, exclusions) = setup();
        let until = versiongate_util::now() + Duration::days(7);
        let err = exclusions
            .request_exclusion("UNKNOWN", "x", &["S1".to_string()], until)
            .unwrap_err();
        assert!(err.is_not_found());
    }

    #[test]
    fn approve_missing_row() {
        let (store, exclusions) = setup();
        assert!(exclusions.approve_exclusion("S1", Some("x"), None).unwrap_err().is_not_found());
        assert!(store.list_exclusions().unwrap().is_empty());
    }

    #[test]
    fn active_suppressions_skip_expired_and_pending() {
        let (store, exclusions) = setup();
        let now = versiongate_util::now();
        store
            .upsert_exclusion(&Exclusion::new("S1", "a@example.com", "", now + Duration::days(1), true))
            .unwrap();
        store
            .upsert_exclusion(&Exclusion::new("S2", "a@example.com", "", now - Duration::days(1), true))
            .unwrap();
        store
            .upsert_exclusion(&Exclusion::new("S3", "a@example.com", "", now + Duration::days(1), false))
            .unwrap();

        let active = exclusions.active_suppressions(now).unwrap();
        assert_eq!(active.len(), 1);
        assert!(active.contains("S1"));

        exclusions.remove_exclusion("S1").unwrap();
        assert!(exclusions.active_suppressions(now).unwrap().is_empty());
        assert!(exclusions.remove_exclusion("S1").unwrap_err().is_not_found());
    }
}
