//! Table maintenance and the daily admin report

use chrono::{DateTime, Utc};
use std::collections::BTreeMap;
use tracing::{info, warn};
use versiongate_config::Settings;
use versiongate_provider::AdminReport;
use versiongate_store::{AuditEvent, AuditEventType, Device};
use versiongate_util::{ComplianceError, Result};

use crate::{Collaborators, Ledger, UserSync, device_from_mdm};

/// Drop and recreate the compliance tables, then repopulate them from the
/// MDM and the chat directory. Returns the number of ledger records built.
pub async fn rebuild_tables(settings: &Settings, collab: &Collaborators) -> Result<usize> {
    collab.store.rebuild_schema()?;
    if let Err(e) = collab
        .store
        .append_audit(AuditEvent::new(AuditEventType::TablesRebuilt))
    {
        warn!(error = %e, "Failed to write audit event");
    }
    populate(settings, collab).await
}

/// Populate an empty ledger on first boot; does nothing otherwise
pub async fn initialize_if_empty(settings: &Settings, collab: &Collaborators) -> Result<Option<usize>> {
    if !collab.store.list_records()?.is_empty() || !collab.store.list_devices()?.is_empty() {
        return Ok(None);
    }
    info!("Empty database, loading devices and users");
    populate(settings, collab).await.map(Some)
}

async fn populate(settings: &Settings, collab: &Collaborators) -> Result<usize> {
    let users = UserSync::new(collab.store.clone(), collab.directory.clone());
    users.sync_all(collab.mdm.as_ref()).await?;

    let policy = &settings.compliance;
    let devices: Vec<Device> = collab
        .mdm
        .list_devices()
        .await?
        .iter()
        .filter(|d| policy.tracks_platform(&d.platform))
        .map(device_from_mdm)
        .collect();
    collab.store.upsert_devices(&devices)?;
    info!(devices = devices.len(), "Devices loaded");

    Ledger::new(collab.store.clone(), collab.directory.clone())
        .build_from_overlap(&policy.required_version, &settings.testing)
        .await
}

/// Summarise the ledger for administrators
pub fn build_admin_report(settings: &Settings, collab: &Collaborators, now: DateTime<Utc>) -> Result<AdminReport> {
    let records = collab.store.list_records()?;
    let exclusions = collab.store.list_exclusions()?;

    let mut os_breakdown = BTreeMap::new();
    for device in collab.store.list_devices()? {
        *os_breakdown.entry(device.os_version).or_insert(0) += 1;
    }

    Ok(AdminReport {
        generated_at: Some(now),
        required_version: settings.compliance.required_version.clone(),
        deadline: settings.compliance.deadline(),
        tracked: records.len(),
        first_message_sent: records.iter().filter(|r| r.first_message_sent).count(),
        acknowledged: records.iter().filter(|r| r.first_ack).count(),
        manager_notified: records.iter().filter(|r| r.manager_message_sent).count(),
        pending_reminders: records.iter().filter(|r| r.has_pending_reminder()).count(),
        exclusions_approved: exclusions.iter().filter(|e| e.approved).count(),
        exclusions_pending: exclusions.iter().filter(|e| !e.approved).count(),
        os_breakdown,
    })
}

/// Build the admin report and send it to the configured admin group
pub async fn send_daily_report(settings: &Settings, collab: &Collaborators, now: DateTime<Utc>) -> Result<AdminReport> {
    let group = settings
        .providers
        .admin_group
        .as_deref()
        .ok_or_else(|| ComplianceError::config("providers.admin_group is not set"))?;

    let recipients = collab.idp.admin_group(group).await?;
    let report = build_admin_report(settings, collab, now)?;
    collab.messenger.send_admin_report(&recipients, &report).await?;

    info!(group = %group, recipients = recipients.len(), tracked = report.tracked, "Daily report sent");
    Ok(report)
}
