//! Configuration validation

use crate::schema::{RawConfig, RawSchedule};
use thiserror::Error;
use versiongate_util::{parse_deadline, OsVersion};

/// Validation error
#[derive(Debug, Clone, Error)]
pub enum ValidationError {
    #[error("Invalid required_version '{value}': {message}")]
    InvalidVersion { value: String, message: String },

    #[error("Invalid deadline: {0}")]
    InvalidDeadline(String),

    #[error("Unknown escalation policy '{0}' (expected \"manager\" or \"time_bound\")")]
    UnknownEscalation(String),

    #[error("Interval '{field}' must be greater than zero")]
    ZeroInterval { field: &'static str },

    #[error("Testing mode is enabled but testing.users is empty")]
    EmptyTestingUsers,

    #[error("Global config error: {0}")]
    GlobalError(String),
}

/// Parse an escalation policy name
pub(crate) fn parse_escalation(value: &str) -> Option<crate::EscalationKind> {
    match value.trim().to_ascii_lowercase().replace('-', "_").as_str() {
        "manager" => Some(crate::EscalationKind::Manager),
        "time_bound" | "timebound" => Some(crate::EscalationKind::TimeBound),
        _ => None,
    }
}

/// Validate a raw configuration
pub fn validate_config(config: &RawConfig) -> Vec<ValidationError> {
    let mut errors = Vec::new();
    let compliance = &config.compliance;

    if let Err(e) = OsVersion::parse(&compliance.required_version) {
        errors.push(ValidationError::InvalidVersion {
            value: compliance.required_version.clone(),
            message: e.to_string(),
        });
    }

    if let Err(e) = parse_deadline(&compliance.deadline_date, &compliance.cutoff_time) {
        errors.push(ValidationError::InvalidDeadline(e.to_string()));
    }

    if parse_escalation(&compliance.escalation).is_none() {
        errors.push(ValidationError::UnknownEscalation(compliance.escalation.clone()));
    }

    if let Some(platforms) = &compliance.platforms
        && platforms.iter().all(|p| p.trim().is_empty())
    {
        errors.push(ValidationError::GlobalError(
            "compliance.platforms must name at least one platform".into(),
        ));
    }

    errors.extend(validate_schedule(&config.schedule));

    if config.testing.enabled && config.testing.users.is_empty() {
        errors.push(ValidationError::EmptyTestingUsers);
    }

    errors
}

fn validate_schedule(schedule: &RawSchedule) -> Vec<ValidationError> {
    let fields: [(&'static str, Option<u64>); 5] = [
        ("device_diff_interval", schedule.device_diff_interval),
        ("check_interval", schedule.check_interval),
        ("poll_interval", schedule.poll_interval),
        ("reminder_interval", schedule.reminder_interval),
        ("manager_escalation_hours", schedule.manager_escalation_hours),
    ];

    fields
        .into_iter()
        .filter(|(_, value)| *value == Some(0))
        .map(|(field, _)| ValidationError::ZeroInterval { field })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::*;

    fn raw(required: &str, date: &str, cutoff: &str, escalation: &str) -> RawConfig {
        RawConfig {
            config_version: 1,
            compliance: RawCompliance {
                required_version: required.into(),
                deadline_date: date.into(),
                cutoff_time: cutoff.into(),
                escalation: escalation.into(),
                platforms: None,
            },
            schedule: RawSchedule::default(),
            service: RawServiceConfig::default(),
            providers: RawProviders::default(),
            testing: RawTesting::default(),
        }
    }

    #[test]
    fn valid_config_has_no_errors() {
        let config = raw("13.0", "01-02-2024", "08:00", "manager");
        assert!(validate_config(&config).is_empty());
    }

    #[test]
    fn collects_every_error() {
        let mut config = raw("thirteen", "2024-01-02", "08:00", "pager");
        config.schedule.poll_interval = Some(0);
        config.testing.enabled = true;

        let errors = validate_config(&config);
        assert_eq!(errors.len(), 5);
        assert!(errors.iter().any(|e| matches!(e, ValidationError::InvalidVersion { .. })));
        assert!(errors.iter().any(|e| matches!(e, ValidationError::InvalidDeadline(_))));
        assert!(errors.iter().any(|e| matches!(e, ValidationError::UnknownEscalation(_))));
        assert!(errors.iter().any(|e| matches!(
            e,
            ValidationError::ZeroInterval { field: "poll_interval" }
        )));
        assert!(errors.iter().any(|e| matches!(e, ValidationError::EmptyTestingUsers)));
    }

    #[test]
    fn escalation_aliases() {
        assert_eq!(parse_escalation("Manager"), Some(crate::EscalationKind::Manager));
        assert_eq!(parse_escalation("time-bound"), Some(crate::EscalationKind::TimeBound));
        assert_eq!(parse_escalation("timebound"), Some(crate::EscalationKind::TimeBound));
        assert_eq!(parse_escalation("cron"), None);
    }
}
