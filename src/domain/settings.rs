use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogSettings {
    #[serde(default = "default_level")]
    pub level: String, // "trace", "debug", "info", "warn", "error"
    #[serde(default = "default_false")]
    pub file_logging_enabled: bool,
    #[serde(default = "default_true")]
    pub console_logging_enabled: bool,
    #[serde(default = "default_log_dir")]
    pub log_dir: String,
    #[serde(default = "default_prefix")]
    pub file_name_prefix: String,
    #[serde(default = "default_false")]
    pub show_file_line: bool,
    #[serde(default = "default_false")]
    pub show_thread_ids: bool,
    #[serde(default = "default_true")]
    pub show_target: bool,
    #[serde(default = "default_true")]
    pub ansi_colors: bool,
    #[serde(default = "default_rotation")]
    pub rotation: String, // "daily", "hourly", "minutely", "never"
}

impl Default for LogSettings {
    fn default() -> Self {
        Self {
            level: default_level(),
            file_logging_enabled: default_false(),
            console_logging_enabled: default_true(),
            log_dir: default_log_dir(),
            file_name_prefix: default_prefix(),
            show_file_line: default_false(),
            show_thread_ids: default_false(),
            show_target: default_true(),
            ansi_colors: default_true(),
            rotation: default_rotation(),
        }
    }
}

fn default_level() -> String {
    "info".to_string()
}
fn default_true() -> bool {
    true
}
fn default_false() -> bool {
    false
}
fn default_log_dir() -> String {
    "logs".to_string()
}
fn default_prefix() -> String {
    "ftms_link".to_string()
}
fn default_rotation() -> String {
    "daily".to_string()
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Settings {
    #[serde(default)]
    pub log_settings: LogSettings,

    // Connection Settings
    #[serde(default = "default_max_attempts")]
    pub connect_max_attempts: u32,

    // Session Settings
    #[serde(default = "default_max_attempts")]
    pub session_max_attempts: u32,
    #[serde(default = "default_session_retry_unit_ms")]
    pub session_retry_unit_ms: u64,

    // Scan Settings
    #[serde(default = "default_scan_service_filter")]
    pub scan_service_filter: Option<String>,
    #[serde(default = "default_false")]
    pub show_all_devices: bool,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            log_settings: LogSettings::default(),
            connect_max_attempts: default_max_attempts(),
            session_max_attempts: default_max_attempts(),
            session_retry_unit_ms: default_session_retry_unit_ms(),
            scan_service_filter: default_scan_service_filter(),
            show_all_devices: false,
        }
    }
}

/// Bluetooth SIG Fitness Machine service
const FITNESS_MACHINE_SERVICE_UUID: &str = "00001826-0000-1000-8000-00805f9b34fb";

fn default_max_attempts() -> u32 {
    10
}
fn default_session_retry_unit_ms() -> u64 {
    1000
}
fn default_scan_service_filter() -> Option<String> {
    Some(FITNESS_MACHINE_SERVICE_UUID.to_string())
}

pub struct SettingsService {
    settings: Settings,
    settings_path: PathBuf,
}

impl SettingsService {
    pub fn new() -> anyhow::Result<Self> {
        let settings_path = Self::get_settings_path()?;
        Ok(Self::load_from(settings_path))
    }

    /// Load settings from an explicit path, falling back to defaults when
    /// the file is missing or unreadable.
    pub fn load_from(settings_path: PathBuf) -> Self {
        let settings = match Self::load_from_file(&settings_path) {
            Ok(settings) => settings,
            Err(e) => {
                tracing::debug!(
                    path = %settings_path.display(),
                    "Using default settings: {}",
                    e
                );
                Settings::default()
            }
        };

        Self {
            settings,
            settings_path,
        }
    }

    fn get_settings_path() -> anyhow::Result<PathBuf> {
        let mut path = dirs::config_dir()
            .ok_or_else(|| anyhow::anyhow!("Could not determine config directory"))?;
        path.push("FtmsLink");
        fs::create_dir_all(&path)?;
        path.push("settings.json");
        Ok(path)
    }

    fn load_from_file(path: &Path) -> anyhow::Result<Settings> {
        let contents = fs::read_to_string(path)?;
        let settings = serde_json::from_str(&contents)?;
        Ok(settings)
    }

    pub fn save(&self) -> anyhow::Result<()> {
        if let Some(parent) = self.settings_path.parent() {
            fs::create_dir_all(parent)?;
        }
        let json = serde_json::to_string_pretty(&self.settings)?;
        fs::write(&self.settings_path, json)?;
        Ok(())
    }

    pub fn path(&self) -> &Path {
        &self.settings_path
    }

    pub fn get(&self) -> &Settings {
        &self.settings
    }

    pub fn get_mut(&mut self) -> &mut Settings {
        &mut self.settings
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_match_retry_bounds() {
        let settings = Settings::default();
        assert_eq!(settings.connect_max_attempts, 10);
        assert_eq!(settings.session_max_attempts, 10);
        assert_eq!(settings.session_retry_unit_ms, 1000);
        assert_eq!(
            settings.scan_service_filter,
            Some("00001826-0000-1000-8000-00805f9b34fb".to_string())
        );
    }

    #[test]
    fn test_partial_file_uses_defaults() {
        let settings: Settings = serde_json::from_str(r#"{ "connect_max_attempts": 3 }"#).unwrap();
        assert_eq!(settings.connect_max_attempts, 3);
        assert_eq!(settings.session_max_attempts, 10);
        assert_eq!(settings.log_settings.level, "info");
    }

    #[test]
    fn test_missing_file_loads_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let service = SettingsService::load_from(dir.path().join("settings.json"));
        assert_eq!(service.get().connect_max_attempts, 10);
    }

    #[test]
    fn test_save_and_reload() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("settings.json");

        let mut service = SettingsService::load_from(path.clone());
        service.get_mut().session_retry_unit_ms = 250;
        service.get_mut().show_all_devices = true;
        service.save().unwrap();

        let reloaded = SettingsService::load_from(path);
        assert_eq!(reloaded.get().session_retry_unit_ms, 250);
        assert!(reloaded.get().show_all_devices);
    }
}
