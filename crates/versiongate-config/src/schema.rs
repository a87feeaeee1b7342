//! Raw configuration schema (as parsed from TOML)

use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Raw configuration as parsed from TOML
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct RawConfig {
    /// Config schema version
    pub config_version: u32,

    /// What compliance means and when it is enforced
    pub compliance: RawCompliance,

    /// Periodic task cadence
    #[serde(default)]
    pub schedule: RawSchedule,

    /// Daemon settings
    #[serde(default)]
    pub service: RawServiceConfig,

    /// Collaborator wiring
    #[serde(default)]
    pub providers: RawProviders,

    /// Testing-mode user override
    #[serde(default)]
    pub testing: RawTesting,
}

/// Compliance policy
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct RawCompliance {
    /// Minimum OS version, e.g. "13.0"
    pub required_version: String,

    /// MM-DD-YYYY
    pub deadline_date: String,

    /// HH:MM
    pub cutoff_time: String,

    /// "manager" or "time_bound"
    #[serde(default = "default_escalation")]
    pub escalation: String,

    /// Platforms subject to the policy (case-insensitive)
    pub platforms: Option<Vec<String>>,
}

fn default_escalation() -> String {
    "manager".to_string()
}

/// Periodic task cadence, in minutes unless noted
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct RawSchedule {
    pub device_diff_interval: Option<u64>,
    pub check_interval: Option<u64>,
    pub poll_interval: Option<u64>,
    /// Time-bound resend cadence
    pub reminder_interval: Option<u64>,
    /// Manager escalation delay after acknowledgement, in hours
    pub manager_escalation_hours: Option<u64>,
}

/// Daemon-level settings
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct RawServiceConfig {
    pub service_name: Option<String>,

    /// Data directory for the store
    pub data_dir: Option<PathBuf>,

    /// Control socket path
    pub socket_path: Option<PathBuf>,

    /// Spawn periodic tasks immediately at startup
    pub autostart: Option<bool>,
}

/// Collaborator wiring for the bundled providers
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct RawProviders {
    /// JSON inventory snapshot used by the file-backed MDM/directory
    pub inventory_path: Option<PathBuf>,

    /// Incoming-webhook URL for outbound messages; log-only when absent
    pub webhook_url: Option<String>,

    /// IDP group whose members receive admin reports
    pub admin_group: Option<String>,
}

/// Testing mode
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct RawTesting {
    #[serde(default)]
    pub enabled: bool,

    /// Emails or chat ids allowed through while testing
    #[serde(default)]
    pub users: Vec<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_full_config() {
        let toml_str = r#"
            config_version = 1

            [compliance]
            required_version = "13.0"
            deadline_date = "01-02-2024"
            cutoff_time = "08:00"
            escalation = "time_bound"
            platforms = ["mac"]

            [schedule]
            device_diff_interval = 30
            poll_interval = 5

            [service]
            autostart = false

            [testing]
            enabled = true
            users = ["a@example.com"]
        "#;

        let config: RawConfig = toml::from_str(toml_str).unwrap();
        assert_eq!(config.compliance.escalation, "time_bound");
        assert_eq!(config.schedule.device_diff_interval, Some(30));
        assert_eq!(config.schedule.check_interval, None);
        assert_eq!(config.service.autostart, Some(false));
        assert_eq!(config.testing.users, vec!["a@example.com".to_string()]);
    }

    #[test]
    fn escalation_defaults_to_manager() {
        let toml_str = r#"
            config_version = 1

            [compliance]
            required_version = "13.0"
            deadline_date = "01-02-2024"
            cutoff_time = "08:00"
        "#;

        let config: RawConfig = toml::from_str(toml_str).unwrap();
        assert_eq!(config.compliance.escalation, "manager");
        assert!(!config.testing.enabled);
    }
}
