use serde::{Deserialize, Serialize};
use std::fs;
use std::path::PathBuf;

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
    #[serde(default = "default_true")]
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
            show_file_line: default_true(),
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
    "ble_gateway".to_string()
}
fn default_rotation() -> String {
    "daily".to_string()
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Settings {
    /// Identifier spliced into every topic: `<topic_root>/<gateway_id>/ble/...`
    #[serde(default = "default_gateway_id")]
    pub gateway_id: String,
    #[serde(default = "default_topic_root")]
    pub topic_root: String,

    // Logging Settings
    #[serde(default)]
    pub log_settings: LogSettings,

    // Scan Settings
    #[serde(default = "default_scan_secs")]
    pub scan_secs: u64,

    // Connection Settings
    #[serde(default = "default_connect_window_secs")]
    pub connect_window_secs: u64,
    #[serde(default = "default_retry_backoff_ms")]
    pub retry_backoff_ms: u64,
    #[serde(default = "default_control_workers")]
    pub control_workers: usize,

    // UART Link Settings
    #[serde(default = "default_uart_service_uuid")]
    pub uart_service_uuid: String,
    #[serde(default = "default_uart_write_char_uuid")]
    pub uart_write_char_uuid: String,
    #[serde(default = "default_uart_notify_char_uuid")]
    pub uart_notify_char_uuid: String,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            gateway_id: default_gateway_id(),
            topic_root: default_topic_root(),
            log_settings: LogSettings::default(),
            scan_secs: default_scan_secs(),
            connect_window_secs: default_connect_window_secs(),
            retry_backoff_ms: default_retry_backoff_ms(),
            control_workers: default_control_workers(),
            uart_service_uuid: default_uart_service_uuid(),
            uart_write_char_uuid: default_uart_write_char_uuid(),
            uart_notify_char_uuid: default_uart_notify_char_uuid(),
        }
    }
}

fn default_gateway_id() -> String {
    std::env::var("GATEWAY_THING_NAME").unwrap_or_else(|_| "local".to_string())
}
fn default_topic_root() -> String {
    "gateway".to_string()
}
fn default_scan_secs() -> u64 {
    5
}
fn default_connect_window_secs() -> u64 {
    30
}
fn default_retry_backoff_ms() -> u64 {
    2000
}
fn default_control_workers() -> usize {
    4
}
// Nordic UART service: the write characteristic carries bus->device
// payloads, the notify characteristic carries device->bus payloads.
fn default_uart_service_uuid() -> String {
    "6e400001-b5a3-f393-e0a9-e50e24dcca9e".to_string()
}
fn default_uart_write_char_uuid() -> String {
    "6e400002-b5a3-f393-e0a9-e50e24dcca9e".to_string()
}
fn default_uart_notify_char_uuid() -> String {
    "6e400003-b5a3-f393-e0a9-e50e24dcca9e".to_string()
}

pub struct SettingsService {
    settings: Settings,
    settings_path: PathBuf,
}

impl SettingsService {
    pub fn new() -> anyhow::Result<Self> {
        let settings_path = Self::get_settings_path()?;
        let settings = Self::load_from_file(&settings_path).unwrap_or_default();

        Ok(Self {
            settings,
            settings_path,
        })
    }

    /// Load from an explicit path instead of the platform config directory.
    pub fn from_path(settings_path: PathBuf) -> anyhow::Result<Self> {
        let settings = Self::load_from_file(&settings_path)?;
        Ok(Self {
            settings,
            settings_path,
        })
    }

    fn get_settings_path() -> anyhow::Result<PathBuf> {
        let mut path = dirs::config_dir()
            .ok_or_else(|| anyhow::anyhow!("Could not determine config directory"))?;
        path.push("BleGateway");
        fs::create_dir_all(&path)?;
        path.push("settings.json");
        Ok(path)
    }

    fn load_from_file(path: &PathBuf) -> anyhow::Result<Settings> {
        let contents = fs::read_to_string(path)?;
        let settings = serde_json::from_str(&contents)?;
        Ok(settings)
    }

    pub fn save(&self) -> anyhow::Result<()> {
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
}
