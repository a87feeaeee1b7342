//! Config validation CLI tool
//!
//! Validates a versiongated configuration file and reports any errors.

use std::path::PathBuf;
use std::process::ExitCode;
use versiongate_config::{ConfigError, EscalationKind, CURRENT_CONFIG_VERSION};
use versiongate_util::default_config_path;

fn main() -> ExitCode {
    let args: Vec<String> = std::env::args().collect();

    let config_path = match args.get(1) {
        Some(path) => PathBuf::from(path),
        None => {
            let default_path = default_config_path();
            eprintln!("Usage: validate-config [config-file]");
            eprintln!();
            eprintln!("Validates a versiongated configuration file.");
            eprintln!();
            eprintln!("If no path is provided, uses: {}", default_path.display());
            eprintln!();
            eprintln!("Example:");
            eprintln!("  validate-config {}", default_path.display());
            eprintln!("  validate-config config.example.toml");
            return ExitCode::from(2);
        }
    };

    if !config_path.exists() {
        eprintln!("Error: Configuration file not found: {}", config_path.display());
        return ExitCode::from(1);
    }

    match versiongate_config::load_config(&config_path) {
        Ok(settings) => {
            let compliance = &settings.compliance;
            let schedule = &settings.schedule;
            let escalation = match compliance.escalation {
                EscalationKind::Manager => "manager",
                EscalationKind::TimeBound => "time_bound",
            };

            println!("✓ Configuration is valid");
            println!();
            println!("Summary:");
            println!("  Config version: {}", CURRENT_CONFIG_VERSION);
            println!("  Required version: {}", compliance.required_version);
            if let Some(deadline) = compliance.deadline() {
                println!("  Deadline: {} UTC", deadline.format("%Y-%m-%d %H:%M"));
            }
            println!("  Escalation: {}", escalation);
            println!("  Platforms: {}", compliance.platforms.join(", "));
            println!();
            println!("Schedule:");
            println!("  Device diff: {}m", schedule.device_diff_interval.as_secs() / 60);
            println!("  Check: {}m", schedule.check_interval.as_secs() / 60);
            println!("  Poll: {}m", schedule.poll_interval.as_secs() / 60);
            println!("  Reminder: {}m", schedule.reminder_interval.as_secs() / 60);
            if settings.testing.enabled {
                println!();
                println!("Testing mode: {} user(s)", settings.testing.users.len());
            }

            ExitCode::SUCCESS
        }
        Err(e) => {
            eprintln!("✗ Configuration validation failed");
            eprintln!();
            match &e {
                ConfigError::ReadError(io_err) => {
                    eprintln!("Failed to read file: {}", io_err);
                }
                ConfigError::ParseError(parse_err) => {
                    eprintln!("TOML parse error:");
                    eprintln!("  {}", parse_err);
                }
                ConfigError::ValidationFailed { errors } => {
                    eprintln!("Validation errors ({}):", errors.len());
                    for err in errors {
                        eprintln!("  - {}", err);
                    }
                }
                ConfigError::UnsupportedVersion(ver) => {
                    eprintln!(
                        "Unsupported config version: {} (expected {})",
                        ver, CURRENT_CONFIG_VERSION
                    );
                }
                ConfigError::MissingSetting(name) => {
                    eprintln!("Missing required setting: {}", name);
                }
            }
            ExitCode::from(1)
        }
    }
}
