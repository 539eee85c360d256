use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

/// Protocol adapter selector. Hardware families share the command surface
/// but speak different byte-level protocols.
pub type DeviceModel = u32;

/// A discovered or remembered ring. Identity is the mac.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct DeviceDescriptor {
    pub mac: String,
    pub name: String,
    pub model: DeviceModel,
}

impl DeviceDescriptor {
    pub fn new(mac: impl Into<String>, name: impl Into<String>, model: DeviceModel) -> Self {
        Self {
            mac: mac.into(),
            name: name.into(),
            model,
        }
    }

    /// Last four characters of the advertised name, used in history filenames
    pub fn serial_suffix(&self) -> &str {
        let start = self
            .name
            .char_indices()
            .rev()
            .nth(3)
            .map(|(idx, _)| idx)
            .unwrap_or(0);
        &self.name[start..]
    }
}

impl fmt::Display for DeviceDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({})", self.name, self.mac)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum ConnectionState {
    #[default]
    Disconnected,
    Scanning,
    Connecting(DeviceDescriptor),
    Connected(DeviceDescriptor),
    ServiceReady(DeviceDescriptor),
    RealtimeActive(DeviceDescriptor),
}

impl ConnectionState {
    /// The device being connected to or connected with, if any
    pub fn device(&self) -> Option<&DeviceDescriptor> {
        match self {
            Self::Connecting(d) | Self::Connected(d) | Self::ServiceReady(d) | Self::RealtimeActive(d) => {
                Some(d)
            }
            Self::Disconnected | Self::Scanning => None,
        }
    }

    pub fn is_connecting(&self) -> bool {
        matches!(self, Self::Connecting(_))
    }

    /// Link established (regardless of service readiness)
    pub fn is_connected(&self) -> bool {
        matches!(
            self,
            Self::Connected(_) | Self::ServiceReady(_) | Self::RealtimeActive(_)
        )
    }

    pub fn is_service_ready(&self) -> bool {
        matches!(self, Self::ServiceReady(_) | Self::RealtimeActive(_))
    }
}

/// Live vitals pushed by the ring. Overwritten on every event, never logged.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct RealtimeSample {
    pub spo2: u16,
    pub pulse_rate: u16,
    pub perfusion_index: u16,
    pub motion: u16,
    /// Unix milliseconds
    pub timestamp_ms: i64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BatteryState {
    Discharging,
    Charging,
    Full,
    Unknown(i32),
}

impl BatteryState {
    pub fn from_code(code: i32) -> Self {
        match code {
            0 => Self::Discharging,
            1 => Self::Charging,
            2 => Self::Full,
            other => Self::Unknown(other),
        }
    }
}

/// Result of a `getInfo` request
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceInfoSnapshot {
    /// 0-100
    pub battery_level: u8,
    pub battery_state: BatteryState,
    /// Remote file identifiers in firmware order
    pub files: Vec<String>,
}

/// A downloaded history recording, already converted to CSV
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HistoryFile {
    pub csv: String,
    /// Recording start, Unix seconds
    pub start_time: i64,
}

/// Stable error codes reported by the native binding
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorCode {
    NoDeviceConnected,
    ServiceNotReady,
    NoActivity,
    BluetoothUnavailable,
    BluetoothOff,
    BluetoothUnauthorized,
    BluetoothUnsupported,
    DeviceNotFound,
    InvalidDevice,
    ConnectFailed,
    ServiceInitFailed,
    InfoError,
    ReadFileError,
    CommandFailed,
    BindingClosed,
}

impl ErrorCode {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::NoDeviceConnected => "NO_DEVICE_CONNECTED",
            Self::ServiceNotReady => "SERVICE_NOT_READY",
            Self::NoActivity => "NO_ACTIVITY",
            Self::BluetoothUnavailable => "BLUETOOTH_UNAVAILABLE",
            Self::BluetoothOff => "BLUETOOTH_OFF",
            Self::BluetoothUnauthorized => "BLUETOOTH_UNAUTHORIZED",
            Self::BluetoothUnsupported => "BLUETOOTH_UNSUPPORTED",
            Self::DeviceNotFound => "DEVICE_NOT_FOUND",
            Self::InvalidDevice => "INVALID_DEVICE",
            Self::ConnectFailed => "CONNECT_FAILED",
            Self::ServiceInitFailed => "SERVICE_INIT_FAILED",
            Self::InfoError => "INFO_ERROR",
            Self::ReadFileError => "READ_FILE_ERROR",
            Self::CommandFailed => "COMMAND_FAILED",
            Self::BindingClosed => "BINDING_CLOSED",
        }
    }

    /// Errors the caller must fix before retrying (no automatic retry)
    pub fn is_precondition(&self) -> bool {
        matches!(
            self,
            Self::NoDeviceConnected
                | Self::ServiceNotReady
                | Self::NoActivity
                | Self::BluetoothUnavailable
        )
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Coded failure from the native layer. Raw platform errors never leak past
/// the binding.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("{code}: {message}")]
pub struct DeviceError {
    pub code: ErrorCode,
    pub message: String,
}

impl DeviceError {
    pub fn new(code: ErrorCode, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
        }
    }
}

/// Server-push notifications from the native binding
#[derive(Debug, Clone, PartialEq)]
pub enum DeviceEvent {
    DeviceFound(DeviceDescriptor),
    Connected {
        mac: String,
        model: DeviceModel,
    },
    ServiceReady {
        mac: String,
    },
    Disconnected {
        mac: Option<String>,
        model: Option<DeviceModel>,
        reason: i32,
    },
    Realtime(RealtimeSample),
    Info(DeviceInfoSnapshot),
    ReadProgress(u8),
    HistoryFile(HistoryFile),
    Error(DeviceError),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StatusMessage {
    pub message: String,
    pub severity: MessageSeverity,
}

impl StatusMessage {
    pub fn new(message: impl Into<String>, severity: MessageSeverity) -> Self {
        Self {
            message: message.into(),
            severity,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageSeverity {
    Info,
    Success,
    Warning,
    Error,
}

/// Everything a consumer needs to render the session. Published by the
/// controller after every processed message.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct SessionSnapshot {
    pub initializing: bool,
    pub has_permission: bool,
    pub connection: ConnectionState,
    pub is_scanning: bool,
    /// Devices discovered since the last scan started, no duplicate macs
    pub devices: Vec<DeviceDescriptor>,
    /// Most-recent-first
    pub known_devices: Vec<DeviceDescriptor>,
    pub realtime: Option<RealtimeSample>,
    pub device_info: Option<DeviceInfoSnapshot>,
    pub is_downloading_history: bool,
    /// Progress of the file currently being read, 0-100
    pub download_progress: u8,
    pub download_completed_files: usize,
    pub download_total_files: usize,
    /// Set when a connected device dropped without being asked to
    pub offline_device: Option<DeviceDescriptor>,
    pub last_error: Option<DeviceError>,
    pub patient_id: Option<String>,
    pub status: Option<StatusMessage>,
}

impl SessionSnapshot {
    pub fn connected_device(&self) -> Option<&DeviceDescriptor> {
        if self.connection.is_connected() {
            self.connection.device()
        } else {
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_serial_suffix() {
        let d = DeviceDescriptor::new("AA:BB", "O2Ring 1A2B", 0);
        assert_eq!(d.serial_suffix(), "1A2B");
        let short = DeviceDescriptor::new("AA:BB", "O2", 0);
        assert_eq!(short.serial_suffix(), "O2");
    }

    #[test]
    fn test_error_code_strings() {
        assert_eq!(ErrorCode::ReadFileError.as_str(), "READ_FILE_ERROR");
        assert_eq!(
            DeviceError::new(ErrorCode::ServiceNotReady, "Service not ready yet").to_string(),
            "SERVICE_NOT_READY: Service not ready yet"
        );
        assert!(ErrorCode::NoDeviceConnected.is_precondition());
        assert!(!ErrorCode::ConnectFailed.is_precondition());
    }

    #[test]
    fn test_connection_state_queries() {
        let d = DeviceDescriptor::new("AA", "O2Ring", 0);
        assert!(ConnectionState::Connecting(d.clone()).is_connecting());
        assert!(!ConnectionState::Connecting(d.clone()).is_connected());
        assert!(ConnectionState::Connected(d.clone()).is_connected());
        assert!(!ConnectionState::Connected(d.clone()).is_service_ready());
        assert!(ConnectionState::RealtimeActive(d.clone()).is_service_ready());
        assert_eq!(ConnectionState::ServiceReady(d.clone()).device(), Some(&d));
        assert_eq!(ConnectionState::Scanning.device(), None);
    }

    #[test]
    fn test_connected_device_needs_link() {
        let d = DeviceDescriptor::new("AA", "O2Ring", 0);
        let mut snapshot = SessionSnapshot {
            connection: ConnectionState::Connecting(d.clone()),
            ..Default::default()
        };
        assert_eq!(snapshot.connected_device(), None);
        snapshot.connection = ConnectionState::ServiceReady(d.clone());
        assert_eq!(snapshot.connected_device(), Some(&d));
    }
}
