//! Validated settings structures

use crate::schema::{RawCompliance, RawConfig, RawProviders, RawSchedule, RawServiceConfig, RawTesting};
use crate::validation::parse_escalation;
use crate::{ConfigError, ConfigResult};
use chrono::{DateTime, Utc};
use std::path::{Path, PathBuf};
use std::time::Duration;
use versiongate_util::{default_data_dir, default_socket_path, parse_deadline};

/// Deadline check cadence; not operator-configurable
pub const DEADLINE_CHECK_INTERVAL: Duration = Duration::from_secs(5 * 60);

/// Platforms tracked when none are configured
pub const DEFAULT_PLATFORMS: [&str; 2] = ["mac", "macos"];

const DEFAULT_DEVICE_DIFF_MINUTES: u64 = 60;
const DEFAULT_CHECK_MINUTES: u64 = 15;
const DEFAULT_POLL_MINUTES: u64 = 10;
const DEFAULT_REMINDER_MINUTES: u64 = 240;
const DEFAULT_MANAGER_ESCALATION_HOURS: u64 = 48;

/// Escalation policy selected once at configuration time
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EscalationKind {
    Manager,
    TimeBound,
}

/// Validated settings ready for use by the core
#[derive(Debug, Clone)]
pub struct Settings {
    pub compliance: CompliancePolicy,
    pub schedule: Schedule,
    pub service: ServiceConfig,
    pub providers: ProviderConfig,
    pub testing: TestingMode,
}

impl Settings {
    /// Convert from raw config (after validation).
    ///
    /// This is the single defaulting step: every optional field gets its
    /// documented default here and nowhere else.
    pub fn from_raw(raw: RawConfig) -> Self {
        Self {
            compliance: CompliancePolicy::from_raw(raw.compliance),
            schedule: Schedule::from_raw(raw.schedule),
            service: ServiceConfig::from_raw(raw.service),
            providers: ProviderConfig::from_raw(raw.providers),
            testing: TestingMode::from_raw(raw.testing),
        }
    }
}

/// What compliance means and when it is enforced
#[derive(Debug, Clone)]
pub struct CompliancePolicy {
    pub required_version: String,
    /// MM-DD-YYYY as configured
    pub deadline_date: String,
    /// HH:MM as configured
    pub cutoff_time: String,
    pub escalation: EscalationKind,
    /// Lower-cased platform names
    pub platforms: Vec<String>,
}

impl CompliancePolicy {
    fn from_raw(raw: RawCompliance) -> Self {
        let platforms = raw
            .platforms
            .unwrap_or_else(|| DEFAULT_PLATFORMS.iter().map(|p| p.to_string()).collect())
            .into_iter()
            .map(|p| p.trim().to_lowercase())
            .filter(|p| !p.is_empty())
            .collect();

        Self {
            escalation: parse_escalation(&raw.escalation).unwrap_or(EscalationKind::Manager),
            required_version: raw.required_version.trim().to_string(),
            deadline_date: raw.deadline_date.trim().to_string(),
            cutoff_time: raw.cutoff_time.trim().to_string(),
            platforms,
        }
    }

    /// Deadline as a UTC instant, if the configured strings parse
    pub fn deadline(&self) -> Option<DateTime<Utc>> {
        parse_deadline(&self.deadline_date, &self.cutoff_time).ok()
    }

    /// Whether a device platform is subject to the policy
    pub fn tracks_platform(&self, platform: &str) -> bool {
        let platform = platform.to_lowercase();
        self.platforms.iter().any(|p| *p == platform)
    }
}

/// Periodic task cadence
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Schedule {
    pub device_diff_interval: Duration,
    pub check_interval: Duration,
    pub poll_interval: Duration,
    pub reminder_interval: Duration,
    pub manager_escalation_after: Duration,
    pub deadline_interval: Duration,
}

impl Schedule {
    fn from_raw(raw: RawSchedule) -> Self {
        let minutes = |v: Option<u64>, default: u64| Duration::from_secs(v.unwrap_or(default) * 60);

        Self {
            device_diff_interval: minutes(raw.device_diff_interval, DEFAULT_DEVICE_DIFF_MINUTES),
            check_interval: minutes(raw.check_interval, DEFAULT_CHECK_MINUTES),
            poll_interval: minutes(raw.poll_interval, DEFAULT_POLL_MINUTES),
            reminder_interval: minutes(raw.reminder_interval, DEFAULT_REMINDER_MINUTES),
            manager_escalation_after: Duration::from_secs(
                raw.manager_escalation_hours
                    .unwrap_or(DEFAULT_MANAGER_ESCALATION_HOURS)
                    * 3600,
            ),
            deadline_interval: DEADLINE_CHECK_INTERVAL,
        }
    }
}

impl Default for Schedule {
    fn default() -> Self {
        Self::from_raw(RawSchedule::default())
    }
}

/// Daemon configuration
#[derive(Debug, Clone)]
pub struct ServiceConfig {
    pub service_name: String,
    pub data_dir: PathBuf,
    pub socket_path: PathBuf,
    pub autostart: bool,
}

impl ServiceConfig {
    fn from_raw(raw: RawServiceConfig) -> Self {
        Self {
            service_name: raw.service_name.unwrap_or_else(|| "versiongate".to_string()),
            data_dir: raw.data_dir.unwrap_or_else(default_data_dir),
            socket_path: raw.socket_path.unwrap_or_else(default_socket_path),
            autostart: raw.autostart.unwrap_or(true),
        }
    }
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self::from_raw(RawServiceConfig::default())
    }
}

/// Collaborator wiring
#[derive(Debug, Clone, Default)]
pub struct ProviderConfig {
    pub inventory_path: Option<PathBuf>,
    pub webhook_url: Option<String>,
    pub admin_group: Option<String>,
}

impl ProviderConfig {
    fn from_raw(raw: RawProviders) -> Self {
        Self {
            inventory_path: raw.inventory_path,
            webhook_url: raw.webhook_url.filter(|u| !u.trim().is_empty()),
            admin_group: raw.admin_group,
        }
    }

    /// The inventory file the daemon reads devices and users from
    pub fn inventory(&self) -> ConfigResult<&Path> {
        self.inventory_path
            .as_deref()
            .ok_or(ConfigError::MissingSetting("providers.inventory_path"))
    }
}

/// Testing-mode user override
#[derive(Debug, Clone, Default)]
pub struct TestingMode {
    pub enabled: bool,
    pub users: Vec<String>,
}

impl TestingMode {
    fn from_raw(raw: RawTesting) -> Self {
        Self {
            enabled: raw.enabled,
            users: raw.users.into_iter().map(|u| u.trim().to_lowercase()).collect(),
        }
    }

    /// Outside testing mode everyone is allowed; inside it only listed
    /// emails or chat ids are.
    pub fn allows(&self, email: &str, slack_id: Option<&str>) -> bool {
        if !self.enabled {
            return true;
        }
        let email = email.to_lowercase();
        let slack_id = slack_id.map(|s| s.to_lowercase());
        self.users
            .iter()
            .any(|u| *u == email || Some(u) == slack_id.as_ref())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::parse_config;

    const MINIMAL: &str = r#"
        config_version = 1

        [compliance]
        required_version = "13.0"
        deadline_date = "01-02-2024"
        cutoff_time = "08:00"
    "#;

    #[test]
    fn defaults_applied() {
        let settings = parse_config(MINIMAL).unwrap();
        assert_eq!(settings.schedule.device_diff_interval, Duration::from_secs(3600));
        assert_eq!(settings.schedule.check_interval, Duration::from_secs(900));
        assert_eq!(settings.schedule.poll_interval, Duration::from_secs(600));
        assert_eq!(settings.schedule.deadline_interval, DEADLINE_CHECK_INTERVAL);
        assert_eq!(settings.compliance.escalation, EscalationKind::Manager);
        assert_eq!(settings.compliance.platforms, vec!["mac", "macos"]);
        assert!(settings.service.autostart);
        assert!(settings.providers.webhook_url.is_none());
    }

    #[test]
    fn daemon_needs_inventory_path() {
        let settings = parse_config(MINIMAL).unwrap();
        assert!(matches!(
            settings.providers.inventory(),
            Err(ConfigError::MissingSetting("providers.inventory_path"))
        ));

        let with_inventory = format!("{MINIMAL}\n[providers]\ninventory_path = \"/etc/versiongate/inventory.json\"\n");
        let settings = parse_config(&with_inventory).unwrap();
        assert_eq!(
            settings.providers.inventory().unwrap(),
            Path::new("/etc/versiongate/inventory.json")
        );
    }

    #[test]
    fn platform_matching_is_case_insensitive() {
        let settings = parse_config(MINIMAL).unwrap();
        assert!(settings.compliance.tracks_platform("Mac"));
        assert!(settings.compliance.tracks_platform("macOS"));
        assert!(!settings.compliance.tracks_platform("iOS"));
        assert!(!settings.compliance.tracks_platform("Windows"));
    }

    #[test]
    fn deadline_is_parsed() {
        let settings = parse_config(MINIMAL).unwrap();
        let deadline = settings.compliance.deadline().unwrap();
        assert_eq!(deadline.to_rfc3339(), "2024-01-02T08:00:00+00:00");
    }

    #[test]
    fn testing_mode_filter() {
        let off = TestingMode::default();
        assert!(off.allows("anyone@example.com", None));

        let on = TestingMode {
            enabled: true,
            users: vec!["tester@example.com".into(), "u123".into()],
        };
        assert!(on.allows("Tester@Example.com", None));
        assert!(on.allows("other@example.com", Some("U123")));
        assert!(!on.allows("other@example.com", Some("U999")));
    }
}
