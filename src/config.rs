use std::env;
use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};

use crate::repo::DEFAULT_FETCH_TIMEOUT_SECS;
use crate::signature::TrustedKey;
use crate::update::DEFAULT_UPDATE_COOLDOWN_SECS;

const ENV_FILE_ENV: &str = "PLUGIN_WARDEN_ENV_FILE";
const DEFAULT_ARTIFACT_NAME: &str = "plugin-warden";

#[derive(Debug, Clone)]
pub struct Settings {
    pub debug: bool,
    pub data_dir: PathBuf,
    pub telemetry_file: PathBuf,
    pub hostname: String,
    pub git_bin: String,
    pub plugin: PluginSettings,
    pub self_update: SelfUpdateSettings,
}

#[derive(Debug, Clone)]
pub struct PluginSettings {
    pub enabled: bool,
    pub checkout_path: PathBuf,
    pub remote_url: String,
    /// `identifier key` entries, in configuration order.
    pub signing_keys: Vec<String>,
    /// Path relative to the working copy.
    pub alt_signing_keys_file: Option<String>,
    pub default_revision: String,
    pub fetch_timeout_secs: u64,
    pub update_cooldown_secs: u64,
    pub update_interval_secs: u64,
}

#[derive(Debug, Clone)]
pub struct SelfUpdateSettings {
    pub enabled: bool,
    pub artifact_name: String,
}

impl Settings {
    pub fn load() -> Result<Self> {
        load_dotenv()?;

        let data_dir = read_non_empty_env("PLUGIN_WARDEN_DATA_DIR")
            .map(PathBuf::from)
            .unwrap_or_else(|| PathBuf::from("./data"));

        let telemetry_file = read_non_empty_env("PLUGIN_WARDEN_TELEMETRY_FILE")
            .map(PathBuf::from)
            .unwrap_or_else(|| data_dir.join("telemetry/latest.json"));

        let plugin = PluginSettings {
            enabled: read_bool_env("PLUGIN_WARDEN_PLUGIN_ENABLED", false),
            checkout_path: read_non_empty_env("PLUGIN_WARDEN_PLUGIN_CHECKOUT_PATH")
                .map(PathBuf::from)
                .unwrap_or_else(|| PathBuf::from("./plugin")),
            remote_url: read_non_empty_env("PLUGIN_WARDEN_PLUGIN_GIT").unwrap_or_default(),
            signing_keys: read_list_env("PLUGIN_WARDEN_PLUGIN_SIGNING_KEYS"),
            alt_signing_keys_file: read_non_empty_env("PLUGIN_WARDEN_PLUGIN_ALT_SIGNING_KEYS_FILE"),
            default_revision: read_non_empty_env("PLUGIN_WARDEN_PLUGIN_DEFAULT_REVISION")
                .unwrap_or_else(|| "origin/master".to_string()),
            fetch_timeout_secs: read_u64_env(
                "PLUGIN_WARDEN_PLUGIN_FETCH_TIMEOUT_SECS",
                DEFAULT_FETCH_TIMEOUT_SECS,
            ),
            update_cooldown_secs: read_u64_env(
                "PLUGIN_WARDEN_PLUGIN_UPDATE_COOLDOWN_SECS",
                DEFAULT_UPDATE_COOLDOWN_SECS,
            ),
            update_interval_secs: read_u64_env("PLUGIN_WARDEN_PLUGIN_UPDATE_INTERVAL_SECS", 600),
        };

        let self_update = SelfUpdateSettings {
            enabled: read_bool_env("PLUGIN_WARDEN_SELF_UPDATE", false),
            artifact_name: read_non_empty_env("PLUGIN_WARDEN_SELF_UPDATE_ARTIFACT")
                .unwrap_or_else(default_artifact_name),
        };

        Ok(Self {
            debug: read_bool_env("PLUGIN_WARDEN_DEBUG", false),
            data_dir,
            telemetry_file,
            hostname: resolve_hostname(),
            git_bin: read_non_empty_env("PLUGIN_WARDEN_GIT_BIN")
                .unwrap_or_else(|| "git".to_string()),
            plugin,
            self_update,
        })
    }

    pub fn doctor_report(&self) -> DoctorReport {
        let mut warnings = Vec::new();
        let plugin = &self.plugin;

        if plugin.enabled && plugin.remote_url.trim().is_empty() {
            warnings.push(
                "plugin updates are enabled but PLUGIN_WARDEN_PLUGIN_GIT is not set".to_string(),
            );
        }
        if plugin.signing_keys.is_empty() {
            warnings.push(
                "no plugin signing keys configured; revisions are checked out without signature verification"
                    .to_string(),
            );
        }
        for entry in &plugin.signing_keys {
            let Some(key) = TrustedKey::parse(entry) else {
                continue;
            };
            if !is_valid_ed25519_key_material(&key.public_key) {
                warnings.push(format!(
                    "signing key '{}' is not a base64-encoded 32-byte Ed25519 public key",
                    key.identifier
                ));
            }
        }
        if plugin.alt_signing_keys_file.is_some() && plugin.signing_keys.is_empty() {
            warnings.push(
                "alternate signing keys file is ignored while no primary signing keys are configured"
                    .to_string(),
            );
        }
        if plugin.fetch_timeout_secs == 0 {
            warnings.push("PLUGIN_WARDEN_PLUGIN_FETCH_TIMEOUT_SECS should be > 0".to_string());
        }
        if plugin.update_interval_secs == 0 {
            warnings.push("PLUGIN_WARDEN_PLUGIN_UPDATE_INTERVAL_SECS should be > 0".to_string());
        }
        if self.self_update.enabled && !plugin.enabled {
            warnings.push("self-update is enabled but plugin updates are disabled".to_string());
        }

        DoctorReport {
            hostname: self.hostname.clone(),
            data_dir: self.data_dir.clone(),
            telemetry_file: self.telemetry_file.clone(),
            git_bin: self.git_bin.clone(),
            plugin_enabled: plugin.enabled,
            checkout_path: plugin.checkout_path.clone(),
            remote_url: Some(plugin.remote_url.clone()).filter(|value| !value.is_empty()),
            signing_keys_count: plugin.signing_keys.len(),
            alt_signing_keys_file: plugin.alt_signing_keys_file.clone(),
            default_revision: plugin.default_revision.clone(),
            fetch_timeout_secs: plugin.fetch_timeout_secs,
            update_cooldown_secs: plugin.update_cooldown_secs,
            update_interval_secs: plugin.update_interval_secs,
            self_update_enabled: self.self_update.enabled,
            self_update_artifact: self.self_update.artifact_name.clone(),
            warnings,
        }
    }
}

#[derive(Debug, Clone)]
pub struct DoctorReport {
    pub hostname: String,
    pub data_dir: PathBuf,
    pub telemetry_file: PathBuf,
    pub git_bin: String,
    pub plugin_enabled: bool,
    pub checkout_path: PathBuf,
    pub remote_url: Option<String>,
    pub signing_keys_count: usize,
    pub alt_signing_keys_file: Option<String>,
    pub default_revision: String,
    pub fetch_timeout_secs: u64,
    pub update_cooldown_secs: u64,
    pub update_interval_secs: u64,
    pub self_update_enabled: bool,
    pub self_update_artifact: String,
    pub warnings: Vec<String>,
}

fn default_artifact_name() -> String {
    env::current_exe()
        .ok()
        .and_then(|path| path.file_name().map(|name| name.to_string_lossy().to_string()))
        .filter(|name| !name.is_empty())
        .unwrap_or_else(|| DEFAULT_ARTIFACT_NAME.to_string())
}

fn resolve_hostname() -> String {
    read_non_empty_env("PLUGIN_WARDEN_HOSTNAME")
        .or_else(|| read_non_empty_env("HOSTNAME"))
        .or_else(|| read_non_empty_env("HOST"))
        .or_else(|| {
            fs::read_to_string("/etc/hostname")
                .ok()
                .map(|value| value.trim().to_string())
                .filter(|value| !value.is_empty())
        })
        .unwrap_or_else(|| "unknown".to_string())
}

fn is_valid_ed25519_key_material(value: &str) -> bool {
    decode_base64(value.trim()).is_ok_and(|decoded| decoded.len() == 32)
}

fn decode_base64(value: &str) -> std::result::Result<Vec<u8>, base64::DecodeError> {
    use base64::engine::general_purpose;
    use base64::Engine as _;

    general_purpose::STANDARD.decode(value)
}

fn read_non_empty_env(key: &str) -> Option<String> {
    env::var(key).ok().and_then(|value| {
        let trimmed = value.trim();
        if trimmed.is_empty() {
            None
        } else {
            Some(trimmed.to_string())
        }
    })
}

fn read_u64_env(key: &str, default: u64) -> u64 {
    env::var(key)
        .ok()
        .and_then(|value| value.trim().parse::<u64>().ok())
        .unwrap_or(default)
}

fn read_bool_env(key: &str, default: bool) -> bool {
    let Some(value) = env::var(key).ok() else {
        return default;
    };
    let normalized = value.trim().to_ascii_lowercase();
    match normalized.as_str() {
        "1" | "true" | "yes" | "on" => true,
        "0" | "false" | "no" | "off" => false,
        _ => default,
    }
}

/// `;`-separated entries; whitespace inside an entry is kept.
fn read_list_env(key: &str) -> Vec<String> {
    let Some(value) = env::var(key).ok() else {
        return Vec::new();
    };

    value
        .split(';')
        .map(str::trim)
        .filter(|part| !part.is_empty())
        .map(ToString::to_string)
        .collect()
}

fn load_dotenv() -> Result<()> {
    if let Ok(path) = env::var(ENV_FILE_ENV) {
        if !path.trim().is_empty() {
            dotenvy::from_path(path.trim())
                .with_context(|| format!("failed loading {} from {}", ENV_FILE_ENV, path.trim()))?;
            return Ok(());
        }
    }

    if Path::new(".env").exists() {
        dotenvy::from_path(".env").context("failed loading .env from current directory")?;
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use std::path::PathBuf;

    use super::{is_valid_ed25519_key_material, PluginSettings, SelfUpdateSettings, Settings};

    fn settings(plugin: PluginSettings) -> Settings {
        Settings {
            debug: false,
            data_dir: PathBuf::from("./data"),
            telemetry_file: PathBuf::from("./data/telemetry/latest.json"),
            hostname: "agent-01".to_string(),
            git_bin: "git".to_string(),
            plugin,
            self_update: SelfUpdateSettings {
                enabled: false,
                artifact_name: "plugin-warden".to_string(),
            },
        }
    }

    fn plugin() -> PluginSettings {
        PluginSettings {
            enabled: true,
            checkout_path: PathBuf::from("./plugin"),
            remote_url: "https://git.example.com/plugins.git".to_string(),
            signing_keys: vec![format!("ops {}", "A".repeat(43) + "=")],
            alt_signing_keys_file: None,
            default_revision: "origin/master".to_string(),
            fetch_timeout_secs: 120,
            update_cooldown_secs: 300,
            update_interval_secs: 600,
        }
    }

    #[test]
    fn key_material_must_decode_to_32_bytes() {
        assert!(is_valid_ed25519_key_material(&("A".repeat(43) + "=")));
        assert!(!is_valid_ed25519_key_material("c2hvcnQ="));
        assert!(!is_valid_ed25519_key_material("not base64!"));
    }

    #[test]
    fn complete_plugin_config_has_no_warnings() {
        let report = settings(plugin()).doctor_report();
        assert!(report.warnings.is_empty(), "{:?}", report.warnings);
        assert_eq!(report.signing_keys_count, 1);
    }

    #[test]
    fn doctor_flags_missing_remote_and_bad_keys() {
        let mut plugin = plugin();
        plugin.remote_url.clear();
        plugin.signing_keys = vec!["ops c2hvcnQ=".to_string()];
        let report = settings(plugin).doctor_report();

        assert!(report
            .warnings
            .iter()
            .any(|warning| warning.contains("PLUGIN_WARDEN_PLUGIN_GIT")));
        assert!(report
            .warnings
            .iter()
            .any(|warning| warning.contains("signing key 'ops'")));
        assert!(report.remote_url.is_none());
    }

    #[test]
    fn doctor_flags_alternate_file_without_primary_keys() {
        let mut plugin = plugin();
        plugin.signing_keys.clear();
        plugin.alt_signing_keys_file = Some("keys/alt.txt".to_string());
        let report = settings(plugin).doctor_report();

        assert_eq!(report.warnings.len(), 2);
        assert!(report.warnings[0].contains("without signature verification"));
        assert!(report.warnings[1].contains("alternate signing keys file"));
    }
}
