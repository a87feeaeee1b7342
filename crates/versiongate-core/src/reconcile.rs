//! Device reconciliation: MDM fleet vs. ledger
//!
//! `compute_additions` and `compute_removals` are pure. The `Reconciler`
//! feeds them from the store and the MDM, then applies the result.

use chrono::{DateTime, Utc};
use std::collections::{BTreeSet, HashMap, HashSet};
use std::sync::Arc;
use tracing::{debug, info, warn};
use versiongate_config::Settings;
use versiongate_provider::{MdmDevice, MdmUser};
use versiongate_store::{AuditEvent, AuditEventType, Device};
use versiongate_util::{OsVersion, Result, VersionError, satisfies};

use crate::{
    BatchReport, Collaborators, Escalation, ExclusionManager, Ledger, ReminderRegistry, UserSync,
    device_from_mdm,
};

/// A ledger-known serial and the OS recorded for it
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VersionCheck {
    pub serial: String,
    pub os: String,
}

impl VersionCheck {
    pub fn new(serial: impl Into<String>, os: impl Into<String>) -> Self {
        Self {
            serial: serial.into(),
            os: os.into(),
        }
    }
}

/// Whether a device platform is one of `platforms` (already lower-cased)
fn platform_tracked(platforms: &[String], platform: &str) -> bool {
    let platform = platform.to_lowercase();
    platforms.iter().any(|p| *p == platform)
}

/// Devices that should start being tracked.
///
/// A device is added when its serial is not local, its platform is tracked
/// and its OS does not satisfy `required_version`. Unparsable versions are
/// skipped.
pub fn compute_additions(
    local_serials: &HashSet<String>,
    required_version: &str,
    platforms: &[String],
    devices: &[MdmDevice],
) -> Vec<MdmDevice> {
    devices
        .iter()
        .filter(|d| !local_serials.contains(&d.serial_number))
        .filter(|d| platform_tracked(platforms, &d.platform))
        .filter(|d| match satisfies(&d.os_version, required_version) {
            Ok(compliant) => !compliant,
            Err(e) => {
                warn!(serial = %d.serial_number, os = %d.os_version, error = %e, "Unparsable OS version");
                false
            }
        })
        .cloned()
        .collect()
}

/// Serials that should stop being tracked because they are now compliant.
///
/// When the live OS is newer than the recorded one the live OS decides,
/// otherwise the recorded OS does. Serials absent from `devices` are left
/// to the caller. Unparsable versions never cause a removal.
pub fn compute_removals(
    required_version: &str,
    checks: &[VersionCheck],
    devices: &[MdmDevice],
) -> Vec<String> {
    let live: HashMap<&str, &MdmDevice> = devices
        .iter()
        .map(|d| (d.serial_number.as_str(), d))
        .collect();

    let mut removals = Vec::new();
    for check in checks {
        let Some(device) = live.get(check.serial.as_str()) else {
            continue;
        };

        match now_compliant(&check.os, &device.os_version, required_version) {
            Ok(true) => removals.push(check.serial.clone()),
            Ok(false) => {}
            Err(e) => {
                warn!(serial = %check.serial, error = %e, "Cannot compare versions; keeping device");
            }
        }
    }
    removals
}

fn now_compliant(recorded: &str, live: &str, required: &str) -> std::result::Result<bool, VersionError> {
    let deciding = if OsVersion::parse(live)? > OsVersion::parse(recorded)? {
        live
    } else {
        recorded
    };
    satisfies(deciding, required)
}

/// What one reconciliation pass did
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReconcileReport {
    pub batch: BatchReport,
    pub removed: Vec<String>,
    pub refreshed: usize,
}

impl ReconcileReport {
    pub fn summary(&self) -> String {
        format!(
            "added {}, removed {}, unresolved {}, refreshed {}",
            self.batch.added.len(),
            self.removed.len(),
            self.batch.unresolved.len(),
            self.refreshed
        )
    }
}

/// Runs reconciliation passes against the store
pub struct Reconciler {
    settings: Settings,
    collab: Collaborators,
    ledger: Ledger,
    users: UserSync,
    exclusions: ExclusionManager,
    escalation: Arc<Escalation>,
    registry: ReminderRegistry,
}

impl Reconciler {
    pub fn new(
        settings: Settings,
        collab: Collaborators,
        escalation: Arc<Escalation>,
        registry: ReminderRegistry,
    ) -> Self {
        Self {
            ledger: Ledger::new(collab.store.clone(), collab.directory.clone()),
            users: UserSync::new(collab.store.clone(), collab.directory.clone()),
            exclusions: ExclusionManager::new(collab.store.clone()),
            settings,
            collab,
            escalation,
            registry,
        }
    }

    /// One pass: diff the MDM snapshot against the ledger and apply it
    pub async fn run(&self, now: DateTime<Utc>) -> Result<ReconcileReport> {
        let policy = &self.settings.compliance;
        let store = &self.collab.store;

        let fleet = self.collab.mdm.list_devices().await?;
        let records = store.list_records()?;
        let rows = store.list_devices()?;
        let suppressed = self.exclusions.active_suppressions(now)?;

        let local: HashSet<String> = records.iter().map(|r| r.serial_number.clone()).collect();
        let recorded_os: HashMap<&str, &str> = rows
            .iter()
            .map(|d| (d.serial_number.as_str(), d.os_version.as_str()))
            .collect();
        let live: HashMap<&str, &MdmDevice> = fleet
            .iter()
            .map(|d| (d.serial_number.as_str(), d))
            .collect();

        let known: BTreeSet<&str> = local
            .iter()
            .map(String::as_str)
            .chain(rows.iter().map(|d| d.serial_number.as_str()))
            .collect();

        let checks: Vec<VersionCheck> = known
            .iter()
            .filter_map(|serial| {
                let os = recorded_os
                    .get(serial)
                    .copied()
                    .or_else(|| live.get(serial).map(|d| d.os_version.as_str()))?;
                Some(VersionCheck::new(*serial, os))
            })
            .collect();

        let mut removals: BTreeSet<String> =
            compute_removals(&policy.required_version, &checks, &fleet)
                .into_iter()
                .collect();
        for serial in &known {
            if !live.contains_key(serial) {
                debug!(serial = %serial, "Device gone from MDM");
                removals.insert(serial.to_string());
            } else if suppressed.contains(*serial) {
                debug!(serial = %serial, "Device excluded");
                removals.insert(serial.to_string());
            }
        }

        let additions: Vec<MdmDevice> = compute_additions(
            &local,
            &policy.required_version,
            &policy.platforms,
            &fleet,
        )
        .into_iter()
        .filter(|d| !removals.contains(&d.serial_number) && !suppressed.contains(&d.serial_number))
        .collect();

        let owners: Vec<MdmUser> = additions.iter().map(|d| d.user.clone()).collect();
        self.users.sync_owners(&owners).await?;
        let batch = self.ledger.add_batch(&additions, &self.settings.testing).await?;

        let removed: Vec<String> = removals.into_iter().collect();
        self.release(&removed).await?;

        // Devices still tracked are refreshed from the snapshot
        let keep: Vec<Device> = known
            .iter()
            .filter(|serial| !removed.iter().any(|r| r == *serial))
            .filter_map(|serial| live.get(serial).map(|d| device_from_mdm(d)))
            .collect();
        store.upsert_devices(&keep)?;

        if !batch.added.is_empty() {
            self.audit(AuditEventType::DevicesTracked {
                serials: batch.added.clone(),
            });
        }

        let report = ReconcileReport {
            batch,
            removed,
            refreshed: keep.len(),
        };
        info!(
            fleet = fleet.len(),
            added = report.batch.added.len(),
            removed = report.removed.len(),
            unresolved = report.batch.unresolved.len(),
            "Reconciliation finished"
        );
        Ok(report)
    }

    async fn release(&self, serials: &[String]) -> Result<()> {
        if serials.is_empty() {
            return Ok(());
        }
        let store = &self.collab.store;

        let mut leaving = Vec::new();
        for serial in serials {
            if let Some(record) = store.record_by_serial(serial)? {
                leaving.push(record);
            }
        }
        self.escalation.on_removed(&leaving).await;

        for serial in serials {
            self.registry.cancel(serial);
        }
        store.remove_records(serials)?;
        store.remove_devices(serials)?;

        self.audit(AuditEventType::DevicesReleased {
            serials: serials.to_vec(),
        });
        Ok(())
    }

    fn audit(&self, event: AuditEventType) {
        if let Err(e) = self.collab.store.append_audit(AuditEvent::new(event)) {
            warn!(error = %e, "Failed to write audit event");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn device(serial: &str, platform: &str, os: &str) -> MdmDevice {
        MdmDevice {
            device_id: format!("id-{serial}"),
            serial_number: serial.into(),
            platform: platform.into(),
            os_version: os.into(),
            user: MdmUser {
                email: "a@example.com".into(),
                ..Default::default()
            },
            ..Default::default()
        }
    }

    fn mac() -> Vec<String> {
        vec!["mac".into(), "macos".into()]
    }

    fn serials(devices: &[MdmDevice]) -> Vec<&str> {
        devices.iter().map(|d| d.serial_number.as_str()).collect()
    }

    #[test]
    fn additions_require_every_condition() {
        let local: HashSet<String> = ["S4".to_string()].into();
        let fleet = vec![
            device("S1", "Mac", "12.0"),
            device("S2", "MACOS", "12.6.1"),
            device("S3", "Mac", "13.0"),
            device("S4", "Mac", "12.0"),
            device("S5", "Windows", "10.0"),
            device("S6", "Mac", "thirteen"),
        ];

        let added = compute_additions(&local, "13.0", &mac(), &fleet);
        assert_eq!(serials(&added), vec!["S1", "S2"]);
    }

    #[test]
    fn additions_idempotent() {
        let local = HashSet::new();
        let fleet = vec![device("S1", "Mac", "12.0"), device("S2", "macos", "11.7")];

        let first = compute_additions(&local, "13.0", &mac(), &fleet);
        let second = compute_additions(&local, "13.0", &mac(), &fleet);
        assert_eq!(first, second);
    }

    #[test]
    fn additions_respect_configured_platforms() {
        let fleet = vec![device("S1", "Mac", "12.0"), device("S2", "iPadOS", "15.0")];
        let added = compute_additions(&HashSet::new(), "16.0", &["ipados".to_string()], &fleet);
        assert_eq!(serials(&added), vec!["S2"]);
    }

    #[test]
    fn removal_truth_table() {
        // (recorded, live, removed?) with required 13.0
        let cases = [
            // live newer than recorded: live decides
            ("12.0", "13.4", true),
            ("12.0", "12.6", false),
            // live not newer: recorded decides
            ("13.1", "13.1", true),
            ("12.0", "12.0", false),
            ("13.2", "12.0", true),
            ("12.6", "11.0", false),
        ];

        for (recorded, live, expected) in cases {
            let fleet = vec![device("S1", "Mac", live)];
            let checks = vec![VersionCheck::new("S1", recorded)];
            let removed = compute_removals("13.0", &checks, &fleet);
            assert_eq!(
                removed == vec!["S1".to_string()],
                expected,
                "recorded {recorded}, live {live}"
            );
        }
    }

    #[test]
    fn removals_ignore_missing_and_unparsable() {
        let fleet = vec![device("S1", "Mac", "beta"), device("S2", "Mac", "14.0")];
        let checks = vec![
            VersionCheck::new("S1", "12.0"),
            VersionCheck::new("S2", "??"),
            VersionCheck::new("GONE", "12.0"),
        ];
        assert!(compute_removals("13.0", &checks, &fleet).is_empty());
    }
}
