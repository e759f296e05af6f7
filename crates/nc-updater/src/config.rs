// Copyright (c) 2025 SOLARE S.R.O.
//
// This file is part of nc-updater.
//
// Licensed under the Creative Commons Attribution-NonCommercial-NoDerivatives 4.0 International
// (CC BY-NC-ND 4.0). You may use and share this file for non-commercial purposes only and you may not
// create derivatives. See <https://creativecommons.org/licenses/by-nc-nd/4.0/>.
//
// This software is provided "AS IS", without warranty of any kind.
//
// For commercial licensing, please contact: info@solare.cz

//! Configuration module for the updater
//!
//! Two sources feed the updater: the instance configuration persisted inside
//! the install root (`config/config.json`), which the core only reads apart
//! from the maintenance flag, and [`UpdaterOptions`] supplied by the driver.

use crate::error::{Result, UpdaterError};
use crate::version::normalize_version;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use uuid::Uuid;

pub const CONFIG_FILE: &str = "config/config.json";
pub const VERSION_FILE: &str = "version.php";
pub const DEFAULT_UPDATER_SERVER: &str = "https://updates.nextcloud.org/updater_server/";

const VERSION_MARKER: &str = "$OC_VersionString";

/// Settings of the deployed instance, loaded once per orchestrator
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InstanceConfig {
    #[serde(rename = "datadirectory")]
    pub data_directory: PathBuf,

    #[serde(rename = "instanceid")]
    pub instance_id: String,

    /// Installed version as recorded in the configuration, e.g. "20.0.5.2"
    pub version: String,

    #[serde(
        rename = "updater.server.url",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    pub updater_server_url: Option<String>,

    #[serde(default)]
    pub maintenance: bool,
}

impl InstanceConfig {
    /// Load `config/config.json` below `root`
    pub fn load(root: &Path) -> Result<Self> {
        let path = root.join(CONFIG_FILE);
        if !path.exists() {
            return Err(UpdaterError::Config(format!(
                "could not find {}. Is the updater pointed at the install root?",
                path.display()
            )));
        }

        let content =
            std::fs::read_to_string(&path).map_err(|e| UpdaterError::io_at("read", &path, e))?;
        let mut config: Self = serde_json::from_str(&content)
            .map_err(|e| UpdaterError::Config(format!("Failed to parse config: {e}")))?;

        if config.instance_id.trim().is_empty() {
            return Err(UpdaterError::Config("instanceid must not be empty".to_string()));
        }
        if config.version.trim().is_empty() {
            return Err(UpdaterError::Config("version must not be empty".to_string()));
        }
        if config.data_directory.is_relative() {
            config.data_directory = root.join(&config.data_directory);
        }

        Ok(config)
    }

    pub fn updater_server(&self) -> &str {
        self.updater_server_url
            .as_deref()
            .unwrap_or(DEFAULT_UPDATER_SERVER)
    }

    /// Per-instance working directory below the data directory
    pub fn updater_dir(&self) -> PathBuf {
        self.data_directory
            .join(format!("updater-{}", self.instance_id))
    }
}

/// Set the `maintenance` key of the persisted configuration
///
/// Every other key is preserved as found on disk. The file is replaced
/// atomically.
pub fn set_maintenance_mode(root: &Path, enabled: bool) -> Result<()> {
    let path = root.join(CONFIG_FILE);
    let content =
        std::fs::read_to_string(&path).map_err(|e| UpdaterError::io_at("read", &path, e))?;
    let mut value: serde_json::Value = serde_json::from_str(&content)
        .map_err(|e| UpdaterError::Config(format!("Failed to parse config: {e}")))?;

    let Some(settings) = value.as_object_mut() else {
        return Err(UpdaterError::Config(format!(
            "{} does not contain a JSON object",
            path.display()
        )));
    };
    settings.insert("maintenance".to_string(), serde_json::Value::Bool(enabled));

    write_atomic(&path, &serde_json::to_string_pretty(&value)?)?;
    tracing::info!("Maintenance mode {}", if enabled { "enabled" } else { "disabled" });
    Ok(())
}

/// Installed version, normalized to three components
///
/// Read from `version.php` when present, otherwise from the configured
/// version.
pub fn installed_version(root: &Path, config: &InstanceConfig) -> String {
    let path = root.join(VERSION_FILE);
    let from_file = std::fs::read_to_string(&path)
        .ok()
        .and_then(|content| parse_version_file(&content));

    match from_file {
        Some(version) => normalize_version(&version),
        None => {
            tracing::debug!(
                "No version string in {}, using configured version",
                path.display()
            );
            normalize_version(&config.version)
        }
    }
}

/// Extract the quoted value of `$OC_VersionString = '...';`
fn parse_version_file(content: &str) -> Option<String> {
    let line = content.lines().find(|line| line.contains(VERSION_MARKER))?;
    let (_, value) = line.split_once('=')?;
    let value = value.trim().trim_end_matches(';').trim();
    let unquoted = value
        .strip_prefix('\'')
        .and_then(|v| v.strip_suffix('\''))
        .or_else(|| value.strip_prefix('"').and_then(|v| v.strip_suffix('"')))?;
    (!unquoted.is_empty()).then(|| unquoted.to_string())
}

/// Replace `path` through a sibling temp file private to this call
pub(crate) fn write_atomic(path: &Path, content: &str) -> Result<()> {
    let file_name = path
        .file_name()
        .map_or_else(String::new, |name| name.to_string_lossy().into_owned());
    let temp_path = path.with_file_name(format!(".{file_name}.{}.tmp", Uuid::new_v4().simple()));

    if let Err(e) = std::fs::write(&temp_path, content) {
        let _ = std::fs::remove_file(&temp_path);
        return Err(UpdaterError::io_at("write", &temp_path, e));
    }
    if let Err(e) = std::fs::rename(&temp_path, path) {
        let _ = std::fs::remove_file(&temp_path);
        return Err(UpdaterError::io_at("replace", path, e));
    }
    Ok(())
}

fn default_30() -> u64 {
    30
}

fn default_86400() -> u64 {
    86_400
}

/// Options of the updater itself, supplied by whoever drives the steps
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UpdaterOptions {
    /// Timeout for the update server query and the download connection (seconds)
    #[serde(default = "default_30")]
    pub http_timeout_secs: u64,

    /// A lease not renewed for this long may be taken over (seconds)
    #[serde(default = "default_86400")]
    pub lease_ttl_secs: u64,
}

impl UpdaterOptions {
    pub fn http_timeout(&self) -> Duration {
        Duration::from_secs(self.http_timeout_secs)
    }

    pub fn lease_ttl(&self) -> chrono::Duration {
        chrono::Duration::seconds(i64::try_from(self.lease_ttl_secs).unwrap_or(i64::MAX))
    }
}

impl Default for UpdaterOptions {
    fn default() -> Self {
        Self {
            http_timeout_secs: 30,
            lease_ttl_secs: 86_400,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn write_config(root: &Path, json: &serde_json::Value) {
        std::fs::create_dir_all(root.join("config")).unwrap();
        std::fs::write(
            root.join(CONFIG_FILE),
            serde_json::to_string_pretty(json).unwrap(),
        )
        .unwrap();
    }

    #[test]
    fn test_load_config() {
        let root = TempDir::new().unwrap();
        write_config(
            root.path(),
            &serde_json::json!({
                "datadirectory": "/srv/data",
                "instanceid": "oc8c0fd71e03",
                "version": "20.0.5.2",
                "dbtype": "sqlite3"
            }),
        );

        let config = InstanceConfig::load(root.path()).unwrap();
        assert_eq!(config.data_directory, PathBuf::from("/srv/data"));
        assert_eq!(config.instance_id, "oc8c0fd71e03");
        assert_eq!(config.version, "20.0.5.2");
        assert!(!config.maintenance);
        assert_eq!(config.updater_server(), DEFAULT_UPDATER_SERVER);
        assert_eq!(
            config.updater_dir(),
            PathBuf::from("/srv/data/updater-oc8c0fd71e03")
        );
    }

    #[test]
    fn test_relative_data_directory_is_resolved_against_root() {
        let root = TempDir::new().unwrap();
        write_config(
            root.path(),
            &serde_json::json!({
                "datadirectory": "data",
                "instanceid": "abc",
                "version": "20.0.5",
                "updater.server.url": "http://localhost:8080/"
            }),
        );

        let config = InstanceConfig::load(root.path()).unwrap();
        assert_eq!(config.data_directory, root.path().join("data"));
        assert_eq!(config.updater_server(), "http://localhost:8080/");
    }

    #[test]
    fn test_missing_config_is_fatal() {
        let root = TempDir::new().unwrap();
        let err = InstanceConfig::load(root.path()).unwrap_err();
        assert!(matches!(err, UpdaterError::Config(_)));
    }

    #[test]
    fn test_missing_required_key_is_fatal() {
        let root = TempDir::new().unwrap();
        write_config(
            root.path(),
            &serde_json::json!({"datadirectory": "/srv/data", "version": "20.0.5"}),
        );
        let err = InstanceConfig::load(root.path()).unwrap_err();
        assert!(matches!(err, UpdaterError::Config(_)));
    }

    #[test]
    fn test_set_maintenance_mode_preserves_other_keys() {
        let root = TempDir::new().unwrap();
        write_config(
            root.path(),
            &serde_json::json!({
                "datadirectory": "/srv/data",
                "instanceid": "abc",
                "version": "20.0.5",
                "trusted_domains": ["cloud.example.org"]
            }),
        );

        set_maintenance_mode(root.path(), true).unwrap();
        let config = InstanceConfig::load(root.path()).unwrap();
        assert!(config.maintenance);

        let raw: serde_json::Value = serde_json::from_str(
            &std::fs::read_to_string(root.path().join(CONFIG_FILE)).unwrap(),
        )
        .unwrap();
        assert_eq!(raw["trusted_domains"][0], "cloud.example.org");

        set_maintenance_mode(root.path(), false).unwrap();
        assert!(!InstanceConfig::load(root.path()).unwrap().maintenance);
        let leftovers: Vec<_> = std::fs::read_dir(root.path().join("config"))
            .unwrap()
            .map(|entry| entry.unwrap().file_name())
            .collect();
        assert_eq!(leftovers, vec![std::ffi::OsString::from("config.json")]);
    }

    #[test]
    fn test_installed_version_prefers_version_file() {
        let root = TempDir::new().unwrap();
        write_config(
            root.path(),
            &serde_json::json!({
                "datadirectory": "/srv/data",
                "instanceid": "abc",
                "version": "19.0.0.1"
            }),
        );
        let config = InstanceConfig::load(root.path()).unwrap();
        assert_eq!(installed_version(root.path(), &config), "19.0.0");

        std::fs::write(
            root.path().join(VERSION_FILE),
            "<?php\n$OC_Version = array(20,0,5,2);\n$OC_VersionString = '20.0.5';\n",
        )
        .unwrap();
        assert_eq!(installed_version(root.path(), &config), "20.0.5");
    }

    #[test]
    fn test_parse_version_file() {
        assert_eq!(
            parse_version_file("$OC_VersionString = \"21.0.1 RC1\";"),
            Some("21.0.1 RC1".to_string())
        );
        assert_eq!(parse_version_file("$OC_VersionString = '';"), None);
        assert_eq!(parse_version_file("<?php\n$OC_Channel = 'stable';"), None);
    }

    #[test]
    fn test_default_options() {
        let options = UpdaterOptions::default();
        assert_eq!(options.http_timeout(), Duration::from_secs(30));
        assert_eq!(options.lease_ttl().num_hours(), 24);

        let parsed: UpdaterOptions = serde_json::from_str("{}").unwrap();
        assert_eq!(parsed.http_timeout_secs, 30);
        assert_eq!(parsed.lease_ttl_secs, 86_400);
    }
}
