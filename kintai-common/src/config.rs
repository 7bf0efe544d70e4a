//! Configuration loading and root folder resolution

use crate::{Error, Result};
use std::path::PathBuf;

/// Root folder resolution priority order:
/// 1. Command-line argument (highest priority)
/// 2. Environment variable
/// 3. TOML config file
/// 4. OS-dependent compiled default (fallback)
pub fn resolve_root_folder(cli_arg: Option<&str>, env_var_name: &str) -> Result<PathBuf> {
    // Priority 1: Command-line argument
    if let Some(path) = cli_arg {
        return Ok(PathBuf::from(path));
    }

    // Priority 2: Environment variable
    if let Ok(path) = std::env::var(env_var_name) {
        if !path.trim().is_empty() {
            return Ok(PathBuf::from(path));
        }
    }

    // Priority 3: TOML config file
    if let Ok(config_path) = locate_config_file() {
        if let Ok(toml_content) = std::fs::read_to_string(&config_path) {
            if let Ok(config) = toml::from_str::<toml::Value>(&toml_content) {
                if let Some(root_folder) = config.get("root_folder").and_then(|v| v.as_str()) {
                    return Ok(PathBuf::from(root_folder));
                }
            }
        }
    }

    // Priority 4: OS-dependent compiled default
    Ok(default_root_folder())
}

/// Get the configuration file path for the platform
fn locate_config_file() -> Result<PathBuf> {
    // ~/.config/kintai/config.toml first, then /etc/kintai/config.toml
    if let Some(path) = dirs::config_dir().map(|d| d.join("kintai").join("config.toml")) {
        if path.exists() {
            return Ok(path);
        }
    }
    let system_config = PathBuf::from("/etc/kintai/config.toml");
    if system_config.exists() {
        return Ok(system_config);
    }
    Err(Error::Config("No config file found".to_string()))
}

/// OS-dependent default root folder path
fn default_root_folder() -> PathBuf {
    dirs::data_local_dir()
        .map(|d| d.join("kintai"))
        .unwrap_or_else(|| PathBuf::from("./kintai_data"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cli_arg_wins() {
        let root = resolve_root_folder(Some("/tmp/kintai-test"), "KINTAI_TEST_UNSET").unwrap();
        assert_eq!(root, PathBuf::from("/tmp/kintai-test"));
    }

    #[test]
    fn test_fallback_is_nonempty() {
        let root = resolve_root_folder(None, "KINTAI_TEST_UNSET").unwrap();
        assert!(!root.as_os_str().is_empty());
    }
}
