use crate::domain::models::DeviceDescriptor;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

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
    "o2ring_companion".to_string()
}
fn default_rotation() -> String {
    "daily".to_string()
}

/// Which readiness strategy the native binding uses
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum PlatformKind {
    /// Link establishment means the command protocol is usable
    #[default]
    Android,
    /// An explicit "service deployed" handshake follows the link
    Ios,
}

/// Timing and retry policy of the session controller
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionSettings {
    #[serde(default = "default_realtime_max_attempts")]
    pub realtime_max_attempts: u32,
    #[serde(default = "default_realtime_backoff_ms")]
    pub realtime_backoff_ms: u64,
    #[serde(default = "default_realtime_stale_ms")]
    pub realtime_stale_ms: u64,
    #[serde(default = "default_info_retry_interval_ms")]
    pub info_retry_interval_ms: u64,
    #[serde(default = "default_info_max_attempts")]
    pub info_max_attempts: u32,
    #[serde(default = "default_read_timeout_ms")]
    pub read_timeout_ms: u64,
    #[serde(default = "default_max_file_retries")]
    pub max_file_retries: u32,
    #[serde(default = "default_reconnect_scan_ms")]
    pub reconnect_scan_ms: u64,
    #[serde(default = "default_connect_timeout_ms")]
    pub connect_timeout_ms: u64,
    #[serde(default = "default_known_devices_max")]
    pub known_devices_max: usize,
}

impl Default for SessionSettings {
    fn default() -> Self {
        Self {
            realtime_max_attempts: default_realtime_max_attempts(),
            realtime_backoff_ms: default_realtime_backoff_ms(),
            realtime_stale_ms: default_realtime_stale_ms(),
            info_retry_interval_ms: default_info_retry_interval_ms(),
            info_max_attempts: default_info_max_attempts(),
            read_timeout_ms: default_read_timeout_ms(),
            max_file_retries: default_max_file_retries(),
            reconnect_scan_ms: default_reconnect_scan_ms(),
            connect_timeout_ms: default_connect_timeout_ms(),
            known_devices_max: default_known_devices_max(),
        }
    }
}

impl SessionSettings {
    pub fn realtime_backoff(&self, attempt: u32) -> Duration {
        Duration::from_millis(self.realtime_backoff_ms * u64::from(attempt))
    }

    pub fn realtime_stale_window(&self) -> Duration {
        Duration::from_millis(self.realtime_stale_ms)
    }

    pub fn info_retry_interval(&self) -> Duration {
        Duration::from_millis(self.info_retry_interval_ms)
    }

    pub fn read_timeout(&self) -> Duration {
        Duration::from_millis(self.read_timeout_ms)
    }

    pub fn reconnect_scan(&self) -> Duration {
        Duration::from_millis(self.reconnect_scan_ms)
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }
}

fn default_realtime_max_attempts() -> u32 {
    10
}
fn default_realtime_backoff_ms() -> u64 {
    500
}
fn default_realtime_stale_ms() -> u64 {
    5_000
}
fn default_info_retry_interval_ms() -> u64 {
    4_000
}
fn default_info_max_attempts() -> u32 {
    10
}
fn default_read_timeout_ms() -> u64 {
    30_000
}
fn default_max_file_retries() -> u32 {
    2
}
fn default_reconnect_scan_ms() -> u64 {
    10_000
}
fn default_connect_timeout_ms() -> u64 {
    20_000
}
fn default_known_devices_max() -> usize {
    5
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UploadSettings {
    /// Uploads are disabled while this is unset
    #[serde(default)]
    pub base_url: Option<String>,
    #[serde(default = "default_upload_path")]
    pub endpoint_path: String,
    #[serde(default)]
    pub username: Option<String>,
    #[serde(default)]
    pub password: Option<String>,
    #[serde(default = "default_upload_timeout_secs")]
    pub timeout_secs: u64,
    #[serde(default = "default_true")]
    pub auto_upload: bool,
}

impl Default for UploadSettings {
    fn default() -> Self {
        Self {
            base_url: None,
            endpoint_path: default_upload_path(),
            username: None,
            password: None,
            timeout_secs: default_upload_timeout_secs(),
            auto_upload: default_true(),
        }
    }
}

fn default_upload_path() -> String {
    "/staff/o2ring-data/upload.php".to_string()
}
fn default_upload_timeout_secs() -> u64 {
    60
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Settings {
    /// Most-recent-first, bounded by `session.known_devices_max`
    #[serde(default)]
    pub known_devices: Vec<DeviceDescriptor>,
    #[serde(default)]
    pub patient_id: Option<String>,

    // Logging Settings
    #[serde(default)]
    pub log_settings: LogSettings,

    #[serde(default)]
    pub session: SessionSettings,
    #[serde(default)]
    pub upload: UploadSettings,
    #[serde(default)]
    pub platform: PlatformKind,

    /// Root of the per-patient history directories
    #[serde(default = "default_data_dir")]
    pub data_dir: PathBuf,
    /// Fixed offset for CSV rows and filenames; host local time when unset
    #[serde(default)]
    pub utc_offset_minutes: Option<i32>,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            known_devices: Vec::new(),
            patient_id: None,
            log_settings: LogSettings::default(),
            session: SessionSettings::default(),
            upload: UploadSettings::default(),
            platform: PlatformKind::default(),
            data_dir: default_data_dir(),
            utc_offset_minutes: None,
        }
    }
}

fn default_data_dir() -> PathBuf {
    let mut path = dirs::data_dir().unwrap_or_else(|| PathBuf::from("."));
    path.push("O2RingCompanion");
    path
}

pub struct SettingsService {
    settings: Settings,
    settings_path: PathBuf,
}

impl SettingsService {
    pub fn new() -> anyhow::Result<Self> {
        let settings_path = Self::get_settings_path()?;
        Ok(Self::load(settings_path))
    }

    /// Load from an explicit file, falling back to defaults when it is
    /// missing or unreadable
    pub fn load(settings_path: PathBuf) -> Self {
        let mut settings = match Self::load_from_file(&settings_path) {
            Ok(settings) => settings,
            Err(e) => {
                tracing::debug!("Using default settings ({}): {}", settings_path.display(), e);
                Settings::default()
            }
        };
        let max = settings.session.known_devices_max;
        settings.known_devices.truncate(max);

        Self {
            settings,
            settings_path,
        }
    }

    fn get_settings_path() -> anyhow::Result<PathBuf> {
        let mut path = dirs::config_dir()
            .ok_or_else(|| anyhow::anyhow!("Could not determine config directory"))?;
        path.push("O2RingCompanion");
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

    pub fn get(&self) -> &Settings {
        &self.settings
    }

    pub fn get_mut(&mut self) -> &mut Settings {
        &mut self.settings
    }

    pub fn known_devices(&self) -> &[DeviceDescriptor] {
        &self.settings.known_devices
    }

    pub fn is_known(&self, mac: &str) -> bool {
        self.settings.known_devices.iter().any(|d| d.mac == mac)
    }

    /// Move (or insert) a device to the front of the known list and persist
    pub fn remember_device(&mut self, device: &DeviceDescriptor) -> anyhow::Result<()> {
        let max = self.settings.session.known_devices_max;
        let known = &mut self.settings.known_devices;
        known.retain(|d| d.mac != device.mac);
        known.insert(0, device.clone());
        known.truncate(max);
        self.save()
    }

    pub fn set_patient_id(&mut self, patient_id: Option<String>) -> anyhow::Result<()> {
        self.settings.patient_id = patient_id;
        self.save()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn device(n: usize) -> DeviceDescriptor {
        DeviceDescriptor::new(format!("MAC-{n}"), format!("O2Ring {n:04}"), 0)
    }

    #[test]
    fn test_known_devices_are_mru_and_bounded() {
        let dir = tempfile::tempdir().unwrap();
        let mut service = SettingsService::load(dir.path().join("settings.json"));

        for n in 0..7 {
            service.remember_device(&device(n)).unwrap();
        }
        service.remember_device(&device(4)).unwrap();

        let macs: Vec<_> = service.known_devices().iter().map(|d| d.mac.clone()).collect();
        assert_eq!(macs, vec!["MAC-4", "MAC-6", "MAC-5", "MAC-3", "MAC-2"]);
    }

    #[test]
    fn test_settings_survive_reload() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("settings.json");

        let mut service = SettingsService::load(path.clone());
        service.remember_device(&device(1)).unwrap();
        service.set_patient_id(Some("P100".to_string())).unwrap();

        let reloaded = SettingsService::load(path);
        assert_eq!(reloaded.known_devices(), &[device(1)]);
        assert_eq!(reloaded.get().patient_id.as_deref(), Some("P100"));
        assert!(reloaded.is_known("MAC-1"));
    }

    #[test]
    fn test_partial_file_uses_field_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("settings.json");
        fs::write(&path, r#"{ "platform": "ios", "session": { "read_timeout_ms": 1000 } }"#).unwrap();

        let service = SettingsService::load(path);
        let settings = service.get();
        assert_eq!(settings.platform, PlatformKind::Ios);
        assert_eq!(settings.session.read_timeout_ms, 1000);
        assert_eq!(settings.session.max_file_retries, 2);
        assert_eq!(settings.session.known_devices_max, 5);
        assert!(settings.known_devices.is_empty());
    }

    #[test]
    fn test_oversized_known_list_is_cut_on_load() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("settings.json");
        let settings = Settings {
            known_devices: (0..4).map(device).collect(),
            session: SessionSettings {
                known_devices_max: 2,
                ..Default::default()
            },
            ..Default::default()
        };
        fs::write(&path, serde_json::to_string(&settings).unwrap()).unwrap();

        let service = SettingsService::load(path);
        assert_eq!(service.known_devices(), &[device(0), device(1)]);
    }
}
