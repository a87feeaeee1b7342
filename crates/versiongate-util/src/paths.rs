//! Default paths for versiongate components
//!
//! - Config: `$XDG_CONFIG_HOME/versiongate/config.toml`
//! - Data: `$VERSIONGATE_DATA_DIR`, else `$XDG_DATA_HOME/versiongate`
//! - Socket: `$VERSIONGATE_SOCKET`, else `$XDG_RUNTIME_DIR/versiongate/versiongate.sock`

use std::path::PathBuf;

/// Environment variable for overriding the socket path
pub const VERSIONGATE_SOCKET_ENV: &str = "VERSIONGATE_SOCKET";

/// Environment variable for overriding the data directory
pub const VERSIONGATE_DATA_DIR_ENV: &str = "VERSIONGATE_DATA_DIR";

const SOCKET_FILENAME: &str = "versiongate.sock";
const CONFIG_FILENAME: &str = "config.toml";
const DB_FILENAME: &str = "versiongate.db";
const APP_DIR: &str = "versiongate";

/// Default configuration file path
pub fn default_config_path() -> PathBuf {
    dirs::config_dir()
        .unwrap_or_else(|| PathBuf::from("/etc"))
        .join(APP_DIR)
        .join(CONFIG_FILENAME)
}

/// Default socket path, honoring `$VERSIONGATE_SOCKET`
pub fn default_socket_path() -> PathBuf {
    if let Ok(path) = std::env::var(VERSIONGATE_SOCKET_ENV) {
        return PathBuf::from(path);
    }

    socket_path_without_env()
}

/// Socket path ignoring the environment override
pub fn socket_path_without_env() -> PathBuf {
    if let Some(runtime_dir) = dirs::runtime_dir() {
        return runtime_dir.join(APP_DIR).join(SOCKET_FILENAME);
    }

    let username = std::env::var("USER").unwrap_or_else(|_| "unknown".to_string());
    PathBuf::from(format!("/tmp/{}-{}", APP_DIR, username)).join(SOCKET_FILENAME)
}

/// Default data directory, honoring `$VERSIONGATE_DATA_DIR`
pub fn default_data_dir() -> PathBuf {
    if let Ok(path) = std::env::var(VERSIONGATE_DATA_DIR_ENV) {
        return PathBuf::from(path);
    }

    data_dir_without_env()
}

/// Data directory ignoring the environment override
pub fn data_dir_without_env() -> PathBuf {
    dirs::data_dir()
        .map(|d| d.join(APP_DIR))
        .unwrap_or_else(|| PathBuf::from("/tmp").join(APP_DIR).join("data"))
}

/// Database file inside a data directory
pub fn database_path(data_dir: &std::path::Path) -> PathBuf {
    data_dir.join(DB_FILENAME)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn socket_path_contains_app_dir() {
        let path = socket_path_without_env();
        assert!(path.to_string_lossy().contains("versiongate"));
        assert!(path.to_string_lossy().ends_with(".sock"));
    }

    #[test]
    fn config_path_is_toml() {
        let path = default_config_path();
        assert!(path.to_string_lossy().ends_with("versiongate/config.toml"));
    }

    #[test]
    fn database_path_joins_filename() {
        let path = database_path(std::path::Path::new("/var/lib/versiongate"));
        assert_eq!(path, PathBuf::from("/var/lib/versiongate/versiongate.db"));
    }
}
