//! Default locations. Every one of them can be overridden on the command
//! line or through the environment.

use std::path::{Path, PathBuf};

pub const DEFAULT_SOCK: &str = "/tmp/focusknob.sock";
pub const APP_DIR: &str = "focusknob";
pub const LOG_FILE: &str = "sync.log";
pub const TOKEN_CACHE_FILE: &str = ".calendar_token.json";

pub fn default_socket() -> PathBuf {
    PathBuf::from(DEFAULT_SOCK)
}

pub fn config_dir() -> PathBuf {
    dirs::config_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(APP_DIR)
}

/// `config.toml` unless only a `config.json` exists.
pub fn default_config_file() -> PathBuf {
    config_file_in(&config_dir())
}

pub fn config_file_in(dir: &Path) -> PathBuf {
    let toml = dir.join("config.toml");
    let json = dir.join("config.json");
    if !toml.exists() && json.exists() {
        json
    } else {
        toml
    }
}

pub fn log_dir() -> PathBuf {
    dirs::state_dir()
        .or_else(dirs::data_local_dir)
        .unwrap_or_else(std::env::temp_dir)
        .join(APP_DIR)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn json_config_only_when_toml_is_absent() {
        let dir = tempfile::tempdir().unwrap();
        assert_eq!(config_file_in(dir.path()), dir.path().join("config.toml"));

        std::fs::write(dir.path().join("config.json"), "{}").unwrap();
        assert_eq!(config_file_in(dir.path()), dir.path().join("config.json"));

        std::fs::write(dir.path().join("config.toml"), "").unwrap();
        assert_eq!(config_file_in(dir.path()), dir.path().join("config.toml"));
    }
}
