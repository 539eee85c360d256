//! Vendor SDK seam
//!
//! The ring vendor ships a per-platform SDK that owns the radio and decodes
//! raw packets. The binding only needs the small surface below: a handful of
//! "begin" calls that return immediately, plus callbacks that arrive later on
//! the channel handed over in [`VendorSdk::init`].

use crate::domain::models::{DeviceError, DeviceModel};
use tokio::sync::mpsc;

/// One decoded waveform point of a stored recording
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct OxySample {
    pub spo2: u16,
    pub pulse_rate: u16,
    pub motion: u16,
    pub spo2_warning: bool,
    pub pr_warning: bool,
}

/// A stored recording as decoded by the SDK
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct OxyFile {
    /// Unix seconds
    pub start_time: i64,
    /// Total recording length; 0 when the firmware did not report it
    pub recording_seconds: u32,
    pub samples: Vec<OxySample>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AdapterState {
    PoweredOn,
    PoweredOff,
    Unauthorized,
    Unsupported,
}

/// Asynchronous notifications from the vendor SDK
#[derive(Debug, Clone, PartialEq)]
pub enum SdkCallback {
    Discovered {
        mac: String,
        name: Option<String>,
        model: DeviceModel,
    },
    LinkUp {
        mac: String,
    },
    LinkDown {
        mac: String,
        reason: i32,
    },
    ConnectFailed(String),
    /// Command protocol deployed on top of the link (or failed to)
    ServiceDeployed(bool),
    RealtimeParams {
        spo2: u16,
        pulse_rate: u16,
        perfusion_index: u16,
        motion: u16,
    },
    /// Raw info fields as the firmware reports them
    Info {
        battery: String,
        state: String,
        file_list: String,
    },
    InfoFailed(String),
    /// Either a fraction (0.0-1.0) or a percentage
    ReadProgress(f64),
    FileRead(OxyFile),
    FileReadFailed(String),
    AdapterState(AdapterState),
    CommandFailed(i32),
}

pub trait VendorSdk: Send + 'static {
    /// Set up the SDK singleton. Called at most once per process.
    fn init(&mut self, callbacks: mpsc::UnboundedSender<SdkCallback>) -> Result<(), DeviceError>;

    fn request_permissions(&mut self) -> Result<bool, DeviceError>;

    fn start_scan(&mut self) -> Result<(), DeviceError>;
    fn stop_scan(&mut self);

    fn connect(&mut self, mac: &str, model: DeviceModel) -> Result<(), DeviceError>;
    fn disconnect(&mut self, mac: &str, model: DeviceModel);

    fn request_realtime(&mut self, model: DeviceModel) -> Result<(), DeviceError>;
    fn request_info(&mut self, model: DeviceModel) -> Result<(), DeviceError>;
    fn read_file(&mut self, model: DeviceModel, file_id: &str) -> Result<(), DeviceError>;
}
