//! Bluetooth Service Module
//!
//! The native device binding. A single task owns the vendor SDK and all link
//! state; callers talk to it through a [`BindingClient`] (request/response)
//! and observe it through a stream of [`DeviceEvent`]s. SDK callbacks are
//! funnelled into the same task, so nothing here is shared across threads.

use crate::domain::history_csv::LocalZone;
use crate::domain::models::{
    BatteryState, DeviceError, DeviceEvent, DeviceInfoSnapshot, DeviceModel, ErrorCode,
    HistoryFile, RealtimeSample,
};
use crate::domain::settings::PlatformKind;
use crate::infrastructure::bluetooth::{
    connection::{LinkState, Platform},
    convert::{self, RowTimeFormat},
    protocol,
    scanner::BleScanner,
    sdk::{AdapterState, SdkCallback, VendorSdk},
};
use chrono::Utc;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, info, warn};

pub type Reply<T> = oneshot::Sender<Result<T, DeviceError>>;

/// Commands understood by the binding task
#[derive(Debug)]
pub enum BindingRequest {
    RequestPermissions(Reply<bool>),
    Initialize(Reply<bool>),
    Scan(Reply<bool>),
    StopScan(Reply<bool>),
    Connect {
        mac: String,
        model: DeviceModel,
        reply: Reply<bool>,
    },
    Disconnect(Reply<bool>),
    StartRealtime(Reply<bool>),
    StopRealtime(Reply<bool>),
    GetInfo(Reply<bool>),
    ReadHistoryFile {
        id: String,
        reply: Reply<bool>,
    },
    IsServiceReady(Reply<bool>),
}

/// Cloneable command side of the binding
#[derive(Debug, Clone)]
pub struct BindingClient {
    tx: mpsc::UnboundedSender<BindingRequest>,
}

fn binding_closed() -> DeviceError {
    DeviceError::new(ErrorCode::BindingClosed, "Device binding is not running")
}

impl BindingClient {
    pub fn new(tx: mpsc::UnboundedSender<BindingRequest>) -> Self {
        Self { tx }
    }

    async fn call<T>(
        &self,
        request: impl FnOnce(Reply<T>) -> BindingRequest,
    ) -> Result<T, DeviceError> {
        let (reply, rx) = oneshot::channel();
        self.tx.send(request(reply)).map_err(|_| binding_closed())?;
        rx.await.map_err(|_| binding_closed())?
    }

    pub async fn request_permissions(&self) -> Result<bool, DeviceError> {
        self.call(BindingRequest::RequestPermissions).await
    }

    pub async fn initialize(&self) -> Result<bool, DeviceError> {
        self.call(BindingRequest::Initialize).await
    }

    pub async fn scan(&self) -> Result<bool, DeviceError> {
        self.call(BindingRequest::Scan).await
    }

    pub async fn stop_scan(&self) -> Result<bool, DeviceError> {
        self.call(BindingRequest::StopScan).await
    }

    pub async fn connect(&self, mac: &str, model: DeviceModel) -> Result<bool, DeviceError> {
        let mac = mac.to_string();
        self.call(|reply| BindingRequest::Connect { mac, model, reply })
            .await
    }

    pub async fn disconnect(&self) -> Result<bool, DeviceError> {
        self.call(BindingRequest::Disconnect).await
    }

    pub async fn start_realtime(&self) -> Result<bool, DeviceError> {
        self.call(BindingRequest::StartRealtime).await
    }

    pub async fn stop_realtime(&self) -> Result<bool, DeviceError> {
        self.call(BindingRequest::StopRealtime).await
    }

    pub async fn get_info(&self) -> Result<bool, DeviceError> {
        self.call(BindingRequest::GetInfo).await
    }

    pub async fn read_history_file(&self, id: &str) -> Result<bool, DeviceError> {
        let id = id.to_string();
        self.call(|reply| BindingRequest::ReadHistoryFile { id, reply })
            .await
    }

    pub async fn is_service_ready(&self) -> Result<bool, DeviceError> {
        self.call(BindingRequest::IsServiceReady).await
    }
}

/// Construction-time choices of a binding
#[derive(Debug, Clone, Copy)]
pub struct BindingConfig {
    pub platform: Platform,
    pub zone: LocalZone,
    pub time_format: RowTimeFormat,
}

impl BindingConfig {
    /// Each platform's converter renders row times its own way
    pub fn for_platform(kind: PlatformKind, zone: LocalZone) -> Self {
        let time_format = match kind {
            PlatformKind::Android => RowTimeFormat::Legacy,
            PlatformKind::Ios => RowTimeFormat::Iso8601,
        };
        Self {
            platform: Platform::from(kind),
            zone,
            time_format,
        }
    }
}

/// Binding task state
pub struct DeviceBindingService<S: VendorSdk> {
    sdk: S,
    config: BindingConfig,
    initialized: bool,
    scanner: BleScanner,
    link: LinkState,
    realtime_active: bool,
    /// File id of the read in progress
    reading: Option<String>,
    callback_tx: mpsc::UnboundedSender<SdkCallback>,
    event_tx: mpsc::UnboundedSender<DeviceEvent>,
}

impl<S: VendorSdk> DeviceBindingService<S> {
    /// Start the binding task
    pub fn spawn(
        sdk: S,
        config: BindingConfig,
    ) -> (BindingClient, mpsc::UnboundedReceiver<DeviceEvent>) {
        let (request_tx, request_rx) = mpsc::unbounded_channel();
        let (event_tx, event_rx) = mpsc::unbounded_channel();
        let (callback_tx, callback_rx) = mpsc::unbounded_channel();

        let service = Self {
            sdk,
            config,
            initialized: false,
            scanner: BleScanner::new(config.platform.filters_scan_names()),
            link: LinkState::default(),
            realtime_active: false,
            reading: None,
            callback_tx,
            event_tx,
        };
        tokio::spawn(service.run(request_rx, callback_rx));

        (BindingClient::new(request_tx), event_rx)
    }

    async fn run(
        mut self,
        mut requests: mpsc::UnboundedReceiver<BindingRequest>,
        mut callbacks: mpsc::UnboundedReceiver<SdkCallback>,
    ) {
        info!(platform = ?self.config.platform, "Device binding started");
        loop {
            tokio::select! {
                request = requests.recv() => match request {
                    Some(request) => self.handle_request(request),
                    None => break,
                },
                Some(callback) = callbacks.recv() => self.handle_callback(callback),
            }
        }
        if let Some((mac, model)) = self.link.take() {
            self.sdk.disconnect(&mac, model);
        }
        info!("Device binding stopped");
    }

    fn emit(&self, event: DeviceEvent) {
        let _ = self.event_tx.send(event);
    }

    fn emit_error(&self, code: ErrorCode, message: impl Into<String>) {
        self.emit(DeviceEvent::Error(DeviceError::new(code, message)));
    }

    fn handle_request(&mut self, request: BindingRequest) {
        match request {
            BindingRequest::RequestPermissions(reply) => {
                let _ = reply.send(self.sdk.request_permissions());
            }
            BindingRequest::Initialize(reply) => {
                let _ = reply.send(self.ensure_initialized().map(|_| true));
            }
            BindingRequest::Scan(reply) => {
                let _ = reply.send(self.scan());
            }
            BindingRequest::StopScan(reply) => {
                self.sdk.stop_scan();
                self.scanner.end();
                let _ = reply.send(Ok(true));
            }
            BindingRequest::Connect { mac, model, reply } => {
                let _ = reply.send(self.connect(&mac, model));
            }
            BindingRequest::Disconnect(reply) => {
                self.disconnect();
                let _ = reply.send(Ok(true));
            }
            BindingRequest::StartRealtime(reply) => {
                let _ = reply.send(self.start_realtime());
            }
            BindingRequest::StopRealtime(reply) => {
                self.realtime_active = false;
                let _ = reply.send(Ok(true));
            }
            BindingRequest::GetInfo(reply) => {
                let result = self
                    .link
                    .require_ready()
                    .map(|link| link.model)
                    .and_then(|model| self.sdk.request_info(model))
                    .map(|_| true);
                let _ = reply.send(result);
            }
            BindingRequest::ReadHistoryFile { id, reply } => {
                let _ = reply.send(self.read_history_file(id));
            }
            BindingRequest::IsServiceReady(reply) => {
                let _ = reply.send(Ok(self.link.is_service_ready()));
            }
        }
    }

    /// Sets up the SDK once per binding lifetime
    fn ensure_initialized(&mut self) -> Result<(), DeviceError> {
        if self.initialized {
            return Ok(());
        }
        self.sdk.init(self.callback_tx.clone())?;
        self.initialized = true;
        info!("Vendor SDK initialized");
        Ok(())
    }

    fn scan(&mut self) -> Result<bool, DeviceError> {
        self.ensure_initialized()?;
        self.scanner.begin();
        if let Err(e) = self.sdk.start_scan() {
            self.scanner.end();
            return Err(e);
        }
        Ok(true)
    }

    fn connect(&mut self, mac: &str, model: DeviceModel) -> Result<bool, DeviceError> {
        let mac = mac.trim();
        if mac.is_empty() {
            return Err(DeviceError::new(ErrorCode::InvalidDevice, "Device id is empty"));
        }
        self.ensure_initialized()?;

        let model = match self.scanner.lookup(mac) {
            Some(known) if model == 0 => known.model,
            Some(_) => model,
            None if self.config.platform.can_retrieve_unscanned() => {
                debug!(mac, "Retrieving device that was not scanned");
                model
            }
            None => {
                return Err(DeviceError::new(
                    ErrorCode::DeviceNotFound,
                    "Device not found. Scan first.",
                ))
            }
        };

        if self.scanner.is_scanning() {
            self.sdk.stop_scan();
            self.scanner.end();
        }
        if let Some((previous, previous_model)) = self.link.take() {
            if previous != mac {
                self.sdk.disconnect(&previous, previous_model);
            }
        }

        self.realtime_active = false;
        self.reading = None;
        self.link.begin_connect(mac, model);
        if let Err(e) = self.sdk.connect(mac, model) {
            self.link.on_connect_failed();
            return Err(DeviceError::new(ErrorCode::ConnectFailed, e.message));
        }
        Ok(true)
    }

    /// Always succeeds, even without a link
    fn disconnect(&mut self) {
        self.realtime_active = false;
        self.reading = None;
        match self.link.take() {
            Some((mac, model)) => {
                info!(mac = %mac, "Disconnecting device");
                self.sdk.disconnect(&mac, model);
            }
            None => debug!("Disconnect requested without a link"),
        }
    }

    fn start_realtime(&mut self) -> Result<bool, DeviceError> {
        let model = self.link.require_ready()?.model;
        self.sdk.request_realtime(model)?;
        self.realtime_active = true;
        Ok(true)
    }

    fn read_history_file(&mut self, id: String) -> Result<bool, DeviceError> {
        let model = self.link.require_ready()?.model;
        if id.trim().is_empty() {
            return Err(DeviceError::new(ErrorCode::ReadFileError, "File id is empty"));
        }
        self.sdk.read_file(model, &id)?;
        debug!(file = %id, "History read started");
        self.reading = Some(id);
        Ok(true)
    }

    fn handle_callback(&mut self, callback: SdkCallback) {
        match callback {
            SdkCallback::Discovered { mac, name, model } => {
                if !self.scanner.is_scanning() {
                    return;
                }
                if let Some(device) = self.scanner.on_discovered(&mac, name.as_deref(), model) {
                    debug!(device = %device, "Device found");
                    self.emit(DeviceEvent::DeviceFound(device));
                }
            }
            SdkCallback::LinkUp { mac } => {
                let fallback = self.scanner.lookup(&mac).map(|d| d.model).unwrap_or(0);
                let link = self.link.on_link_up(&mac, fallback, self.config.platform);
                info!(mac = %mac, model = link.model, "Link established");
                self.emit(DeviceEvent::Connected {
                    mac: link.mac.clone(),
                    model: link.model,
                });
                if link.service_ready {
                    self.emit(DeviceEvent::ServiceReady { mac: link.mac });
                }
            }
            SdkCallback::LinkDown { mac, reason } => {
                let model = self.link.on_link_down(&mac).map(|l| l.model);
                self.realtime_active = false;
                self.reading = None;
                info!(mac = %mac, reason, "Link lost");
                self.emit(DeviceEvent::Disconnected {
                    mac: Some(mac),
                    model,
                    reason,
                });
            }
            SdkCallback::ConnectFailed(message) => {
                self.link.on_connect_failed();
                warn!("Connect failed: {}", message);
                self.emit_error(ErrorCode::ConnectFailed, message);
            }
            SdkCallback::ServiceDeployed(true) => {
                if let Some(link) = self.link.mark_service_ready() {
                    let mac = link.mac.clone();
                    info!(mac = %mac, "Service deployed");
                    self.emit(DeviceEvent::ServiceReady { mac });
                }
            }
            SdkCallback::ServiceDeployed(false) => {
                self.emit_error(ErrorCode::ServiceInitFailed, "Service deploy failed");
            }
            SdkCallback::RealtimeParams {
                spo2,
                pulse_rate,
                perfusion_index,
                motion,
            } => {
                if !self.realtime_active {
                    return;
                }
                self.emit(DeviceEvent::Realtime(RealtimeSample {
                    spo2,
                    pulse_rate,
                    perfusion_index,
                    motion,
                    timestamp_ms: Utc::now().timestamp_millis(),
                }));
            }
            SdkCallback::Info {
                battery,
                state,
                file_list,
            } => {
                let battery_level = protocol::parse_integer(&battery).unwrap_or(0).clamp(0, 100) as u8;
                let battery_state = BatteryState::from_code(protocol::parse_integer(&state).unwrap_or(-1));
                let files = protocol::parse_file_list(&file_list);
                debug!(battery_level, files = files.len(), "Device info received");
                self.emit(DeviceEvent::Info(DeviceInfoSnapshot {
                    battery_level,
                    battery_state,
                    files,
                }));
            }
            SdkCallback::InfoFailed(message) => {
                self.emit_error(ErrorCode::InfoError, message);
            }
            SdkCallback::ReadProgress(progress) => {
                if self.reading.is_some() {
                    self.emit(DeviceEvent::ReadProgress(protocol::normalize_progress(
                        progress,
                        self.config.platform.progress_unit(),
                    )));
                }
            }
            SdkCallback::FileRead(file) => {
                let Some(id) = self.reading.take() else {
                    debug!("Dropping file read with no read in flight");
                    return;
                };
                match convert::oxy_file_to_csv(&file, self.config.zone, self.config.time_format) {
                    Ok(csv) => {
                        debug!(file = %id, samples = file.samples.len(), "History file converted");
                        self.emit(DeviceEvent::HistoryFile(HistoryFile {
                            csv,
                            start_time: file.start_time,
                        }));
                    }
                    Err(e) => self.emit(DeviceEvent::Error(e)),
                }
            }
            SdkCallback::FileReadFailed(message) => {
                if self.reading.take().is_none() {
                    debug!("Dropping read failure with no read in flight");
                    return;
                }
                self.emit_error(ErrorCode::ReadFileError, message);
            }
            SdkCallback::AdapterState(state) => match state {
                AdapterState::PoweredOn => debug!("Bluetooth adapter powered on"),
                AdapterState::PoweredOff => {
                    self.scanner.end();
                    self.emit_error(ErrorCode::BluetoothOff, "Bluetooth is powered off");
                }
                AdapterState::Unauthorized => {
                    self.emit_error(ErrorCode::BluetoothUnauthorized, "Bluetooth access not authorized")
                }
                AdapterState::Unsupported => {
                    self.emit_error(ErrorCode::BluetoothUnsupported, "Bluetooth LE is not supported")
                }
            },
            SdkCallback::CommandFailed(code) => {
                self.emit_error(ErrorCode::CommandFailed, format!("Command failed with code {}", code));
            }
        }
    }
}
