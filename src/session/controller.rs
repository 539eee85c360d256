//! Session Controller
//!
//! Owns the connection state machine, realtime bring-up, the info retry
//! loop, the history download queue and the auto-reconnect policy. All of it
//! runs on one task; binding events, timer expiries and background results
//! are serialised into that task's `select!` loop.

use crate::domain::history_csv::{self, LocalZone};
use crate::domain::models::{
    ConnectionState, DeviceDescriptor, DeviceError, DeviceEvent, DeviceInfoSnapshot, ErrorCode,
    HistoryFile, MessageSeverity, RealtimeSample, SessionSnapshot, StatusMessage,
};
use crate::domain::settings::{SessionSettings, SettingsService};
use crate::infrastructure::bluetooth::BindingClient;
use crate::infrastructure::storage::{HistoryStore, StorageError};
use crate::infrastructure::upload::CsvUploader;
use crate::session::queue::{DownloadQueue, FailOutcome};
use crate::session::scheduler::{Fired, Scheduler};
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::AbortHandle;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

/// Serial used in filenames when the device name is unknown
const FALLBACK_SERIAL: &str = "Ring";

#[derive(Error, Debug)]
pub enum SessionError {
    #[error(transparent)]
    Binding(#[from] DeviceError),
    #[error("bluetooth permission denied")]
    PermissionDenied,
    #[error("no device with a ready service")]
    NotConnected,
    #[error("no patient id set")]
    MissingPatientId,
    #[error("recording start {0} is not a valid time")]
    InvalidStartTime(i64),
    #[error("history storage failed: {0}")]
    Storage(#[from] StorageError),
    #[error("session controller stopped")]
    Stopped,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
enum TimerKind {
    InfoRetry,
    ReadTimeout,
    ConnectTimeout,
    ReconnectScanStop,
}

impl TimerKind {
    /// Timers that belong to a device session and die with it
    fn is_session(&self) -> bool {
        !matches!(self, Self::ReconnectScanStop)
    }
}

type Ack<T> = oneshot::Sender<T>;

enum Command {
    Boot(Ack<()>),
    RequestPermissions(Ack<bool>),
    StartScan(Ack<Result<(), SessionError>>),
    StopScan(Ack<()>),
    Connect(DeviceDescriptor, Ack<Result<(), SessionError>>),
    Disconnect(Ack<()>),
    RefreshRealtime(Ack<bool>),
    RequestInfo(Ack<Result<(), SessionError>>),
    ClearDevices,
    SetPatientId(Option<String>, Ack<()>),
    Shutdown,
}

/// Results of work the controller pushed off its own task
enum Internal {
    RealtimeDone { epoch: u64, ok: bool },
}

/// The single in-flight realtime start; later callers wait on it
struct RealtimeBringUp {
    epoch: u64,
    waiters: Vec<Ack<bool>>,
    task: AbortHandle,
}

/// Cloneable front door to a running [`SessionController`]
#[derive(Clone)]
pub struct SessionHandle {
    tx: mpsc::UnboundedSender<Command>,
    state: watch::Receiver<SessionSnapshot>,
}

impl SessionHandle {
    async fn ask<T>(&self, command: impl FnOnce(Ack<T>) -> Command) -> Result<T, SessionError> {
        let (ack, rx) = oneshot::channel();
        self.tx.send(command(ack)).map_err(|_| SessionError::Stopped)?;
        rx.await.map_err(|_| SessionError::Stopped)
    }

    /// Initialise the binding and, when devices are remembered, run one
    /// bounded scan looking for them
    pub async fn start(&self) -> Result<(), SessionError> {
        self.ask(Command::Boot).await
    }

    pub async fn request_permissions(&self) -> Result<bool, SessionError> {
        self.ask(Command::RequestPermissions).await
    }

    pub async fn start_scan(&self) -> Result<(), SessionError> {
        self.ask(Command::StartScan).await?
    }

    pub async fn stop_scan(&self) -> Result<(), SessionError> {
        self.ask(Command::StopScan).await
    }

    pub async fn connect_to_device(&self, device: DeviceDescriptor) -> Result<(), SessionError> {
        self.ask(|ack| Command::Connect(device, ack)).await?
    }

    pub async fn disconnect(&self) -> Result<(), SessionError> {
        self.ask(Command::Disconnect).await
    }

    /// Resolves once the realtime stream is (or could not be) started
    pub async fn refresh_realtime(&self) -> Result<bool, SessionError> {
        self.ask(Command::RefreshRealtime).await
    }

    /// Restart the info retry loop
    pub async fn request_info(&self) -> Result<(), SessionError> {
        self.ask(Command::RequestInfo).await?
    }

    pub fn clear_devices(&self) -> Result<(), SessionError> {
        self.tx
            .send(Command::ClearDevices)
            .map_err(|_| SessionError::Stopped)
    }

    pub async fn set_patient_id(&self, patient_id: Option<String>) -> Result<(), SessionError> {
        self.ask(|ack| Command::SetPatientId(patient_id, ack)).await
    }

    pub fn shutdown(&self) {
        let _ = self.tx.send(Command::Shutdown);
    }

    pub fn snapshot(&self) -> SessionSnapshot {
        self.state.borrow().clone()
    }

    pub fn subscribe(&self) -> watch::Receiver<SessionSnapshot> {
        self.state.clone()
    }
}

pub struct SessionController {
    binding: BindingClient,
    settings: SettingsService,
    tunables: SessionSettings,
    store: Arc<dyn HistoryStore>,
    uploader: Option<Arc<dyn CsvUploader>>,
    auto_upload: bool,
    zone: LocalZone,

    snapshot: SessionSnapshot,
    state_tx: watch::Sender<SessionSnapshot>,
    scheduler: Scheduler<TimerKind>,
    internal_tx: mpsc::UnboundedSender<Internal>,

    queue: DownloadQueue,
    /// Cleared by a user disconnect, set again by a user connect
    auto_reconnect: bool,
    /// Mac whose next disconnect event was asked for
    intentional_disconnect: Option<String>,
    /// Bumped whenever the device session is torn down
    epoch: u64,
    realtime: Option<RealtimeBringUp>,
    last_realtime_at: Option<Instant>,
    info_attempts: u32,
}

impl SessionController {
    /// Start the controller task
    pub fn spawn(
        binding: BindingClient,
        events: mpsc::UnboundedReceiver<DeviceEvent>,
        settings: SettingsService,
        store: Arc<dyn HistoryStore>,
        uploader: Option<Arc<dyn CsvUploader>>,
    ) -> SessionHandle {
        let (command_tx, command_rx) = mpsc::unbounded_channel();
        let (internal_tx, internal_rx) = mpsc::unbounded_channel();
        let (scheduler, timer_rx) = Scheduler::new();

        let config = settings.get();
        let snapshot = SessionSnapshot {
            initializing: true,
            known_devices: config.known_devices.clone(),
            patient_id: config.patient_id.clone(),
            ..Default::default()
        };
        let (state_tx, state_rx) = watch::channel(snapshot.clone());

        let controller = Self {
            binding,
            tunables: config.session.clone(),
            auto_upload: config.upload.auto_upload,
            zone: LocalZone::from_offset_minutes(config.utc_offset_minutes),
            settings,
            store,
            uploader,
            snapshot,
            state_tx,
            scheduler,
            internal_tx,
            queue: DownloadQueue::new(),
            auto_reconnect: true,
            intentional_disconnect: None,
            epoch: 0,
            realtime: None,
            last_realtime_at: None,
            info_attempts: 0,
        };
        tokio::spawn(controller.run(command_rx, events, timer_rx, internal_rx));

        SessionHandle {
            tx: command_tx,
            state: state_rx,
        }
    }

    async fn run(
        mut self,
        mut commands: mpsc::UnboundedReceiver<Command>,
        mut events: mpsc::UnboundedReceiver<DeviceEvent>,
        mut timers: mpsc::UnboundedReceiver<Fired<TimerKind>>,
        mut internal: mpsc::UnboundedReceiver<Internal>,
    ) {
        info!("Session controller started");
        loop {
            tokio::select! {
                command = commands.recv() => match command {
                    Some(Command::Shutdown) | None => break,
                    Some(command) => self.handle_command(command).await,
                },
                Some(event) = events.recv() => self.handle_event(event).await,
                Some((kind, token)) = timers.recv() => {
                    if self.scheduler.take_fired(kind, token) {
                        self.handle_timer(kind).await;
                    }
                }
                Some(message) = internal.recv() => self.handle_internal(message),
            }
            self.publish();
        }

        if let Some(device) = self.snapshot.connection.device() {
            self.intentional_disconnect = Some(device.mac.clone());
            let _ = self.binding.disconnect().await;
        }
        self.teardown_session();
        self.snapshot.connection = ConnectionState::Disconnected;
        self.publish();
        info!("Session controller stopped");
    }

    fn publish(&mut self) {
        let (completed, total) = self.queue.progress();
        self.snapshot.download_completed_files = completed;
        self.snapshot.download_total_files = total;

        let snapshot = &self.snapshot;
        self.state_tx.send_if_modified(|current| {
            if current == snapshot {
                return false;
            }
            *current = snapshot.clone();
            true
        });
    }

    fn set_status(&mut self, message: impl Into<String>, severity: MessageSeverity) {
        self.snapshot.status = Some(StatusMessage::new(message, severity));
    }

    fn record_error(&mut self, err: DeviceError) {
        if err.code.is_precondition() {
            warn!(code = %err.code, "{}", err.message);
        } else {
            error!(code = %err.code, "{}", err.message);
        }
        self.set_status(err.message.clone(), MessageSeverity::Error);
        self.snapshot.last_error = Some(err);
    }

    async fn handle_command(&mut self, command: Command) {
        match command {
            Command::Boot(ack) => {
                self.boot().await;
                let _ = ack.send(());
            }
            Command::RequestPermissions(ack) => {
                let granted = self.request_permissions().await;
                let _ = ack.send(granted);
            }
            Command::StartScan(ack) => {
                // A user scan is not bounded
                self.scheduler.cancel(TimerKind::ReconnectScanStop);
                let result = self.start_scan().await;
                let _ = ack.send(result);
            }
            Command::StopScan(ack) => {
                self.stop_scan().await;
                let _ = ack.send(());
            }
            Command::Connect(device, ack) => {
                let result = self.connect(device, true).await;
                let _ = ack.send(result);
            }
            Command::Disconnect(ack) => {
                self.disconnect().await;
                let _ = ack.send(());
            }
            Command::RefreshRealtime(ack) => self.refresh_realtime(ack),
            Command::RequestInfo(ack) => {
                let result = if self.snapshot.connection.is_service_ready() {
                    self.start_info_loop().await;
                    Ok(())
                } else {
                    Err(SessionError::NotConnected)
                };
                let _ = ack.send(result);
            }
            Command::ClearDevices => self.snapshot.devices.clear(),
            Command::SetPatientId(patient_id, ack) => {
                self.set_patient_id(patient_id).await;
                let _ = ack.send(());
            }
            Command::Shutdown => {}
        }
    }

    async fn boot(&mut self) {
        match self.binding.initialize().await {
            Ok(_) => info!("Device binding initialized"),
            Err(e) => {
                warn!("Device binding initialization failed: {}", e);
                self.snapshot.last_error = Some(e);
            }
        }
        self.snapshot.initializing = false;

        if self.snapshot.known_devices.is_empty() || self.snapshot.connection.device().is_some() {
            return;
        }
        info!(
            known = self.snapshot.known_devices.len(),
            "Scanning for known devices"
        );
        match self.start_scan().await {
            Ok(()) => self
                .scheduler
                .schedule(TimerKind::ReconnectScanStop, self.tunables.reconnect_scan()),
            Err(e) => warn!("Reconnect scan not started: {}", e),
        }
    }

    async fn request_permissions(&mut self) -> bool {
        let granted = match self.binding.request_permissions().await {
            Ok(granted) => granted,
            Err(e) => {
                warn!("Permission request failed: {}", e);
                false
            }
        };
        self.snapshot.has_permission = granted;
        granted
    }

    async fn start_scan(&mut self) -> Result<(), SessionError> {
        if !self.snapshot.has_permission && !self.request_permissions().await {
            self.set_status("Bluetooth permission denied", MessageSeverity::Error);
            return Err(SessionError::PermissionDenied);
        }

        self.snapshot.devices.clear();
        self.snapshot.is_scanning = true;
        if self.snapshot.connection == ConnectionState::Disconnected {
            self.snapshot.connection = ConnectionState::Scanning;
        }
        if let Err(e) = self.binding.scan().await {
            self.mark_scan_stopped();
            self.record_error(e.clone());
            return Err(e.into());
        }
        Ok(())
    }

    fn mark_scan_stopped(&mut self) {
        self.snapshot.is_scanning = false;
        if self.snapshot.connection == ConnectionState::Scanning {
            self.snapshot.connection = ConnectionState::Disconnected;
        }
    }

    async fn stop_scan(&mut self) {
        self.scheduler.cancel(TimerKind::ReconnectScanStop);
        if let Err(e) = self.binding.stop_scan().await {
            warn!("Failed to stop scan: {}", e);
        }
        self.mark_scan_stopped();
    }

    async fn connect(
        &mut self,
        device: DeviceDescriptor,
        user_initiated: bool,
    ) -> Result<(), SessionError> {
        if self
            .snapshot
            .connection
            .device()
            .is_some_and(|current| current.mac == device.mac)
        {
            debug!(mac = %device.mac, "Already connecting or connected");
            return Ok(());
        }
        if user_initiated {
            self.auto_reconnect = true;
        }
        if self.snapshot.is_scanning {
            self.stop_scan().await;
        }

        if let Some(previous) = self.snapshot.connection.device().cloned() {
            info!(mac = %previous.mac, "Disconnecting previous device");
            self.intentional_disconnect = Some(previous.mac);
            if let Err(e) = self.binding.disconnect().await {
                warn!("Disconnect of previous device failed: {}", e);
            }
        }
        self.teardown_session();

        info!(mac = %device.mac, model = device.model, user_initiated, "Connecting");
        self.set_status(format!("Connecting to {}", device.name), MessageSeverity::Info);
        self.snapshot.connection = ConnectionState::Connecting(device.clone());
        self.scheduler
            .schedule(TimerKind::ConnectTimeout, self.tunables.connect_timeout());

        if let Err(e) = self.binding.connect(&device.mac, device.model).await {
            self.scheduler.cancel(TimerKind::ConnectTimeout);
            self.snapshot.connection = ConnectionState::Disconnected;
            self.record_error(e.clone());
            return Err(e.into());
        }
        Ok(())
    }

    async fn disconnect(&mut self) {
        self.auto_reconnect = false;
        if let Some(device) = self.snapshot.connection.device() {
            info!(mac = %device.mac, "Disconnect requested");
            self.intentional_disconnect = Some(device.mac.clone());
        }
        if let Err(e) = self.binding.disconnect().await {
            warn!("Disconnect failed: {}", e);
        }
        self.teardown_session();
        self.snapshot.connection = ConnectionState::Disconnected;
        self.set_status("Disconnected", MessageSeverity::Info);
    }

    /// Drop everything tied to the current device session
    fn teardown_session(&mut self) {
        self.scheduler.cancel_where(TimerKind::is_session);
        self.queue.clear();
        self.epoch += 1;
        if let Some(bring_up) = self.realtime.take() {
            bring_up.task.abort();
            for waiter in bring_up.waiters {
                let _ = waiter.send(false);
            }
        }
        self.last_realtime_at = None;
        self.info_attempts = 0;
        self.snapshot.realtime = None;
        self.snapshot.device_info = None;
        self.snapshot.is_downloading_history = false;
        self.snapshot.download_progress = 0;
    }

    fn connect_failed(&mut self, err: DeviceError) {
        self.scheduler.cancel(TimerKind::ConnectTimeout);
        self.teardown_session();
        self.snapshot.connection = ConnectionState::Disconnected;
        self.record_error(err);
    }

    fn refresh_realtime(&mut self, ack: Ack<bool>) {
        if !self.snapshot.connection.is_connected() {
            let _ = ack.send(false);
            return;
        }
        let fresh = self
            .last_realtime_at
            .is_some_and(|at| at.elapsed() < self.tunables.realtime_stale_window());
        if fresh {
            let _ = ack.send(true);
            return;
        }
        self.start_realtime(Some(ack));
    }

    /// Start realtime streaming, or join the start already in flight
    fn start_realtime(&mut self, waiter: Option<Ack<bool>>) {
        if let Some(bring_up) = self.realtime.as_mut() {
            bring_up.waiters.extend(waiter);
            return;
        }

        let binding = self.binding.clone();
        let tunables = self.tunables.clone();
        let internal = self.internal_tx.clone();
        let epoch = self.epoch;
        let task = tokio::spawn(async move {
            let ok = bring_up_realtime(&binding, &tunables).await;
            let _ = internal.send(Internal::RealtimeDone { epoch, ok });
        });

        self.realtime = Some(RealtimeBringUp {
            epoch,
            waiters: waiter.into_iter().collect(),
            task: task.abort_handle(),
        });
    }

    fn handle_internal(&mut self, message: Internal) {
        match message {
            Internal::RealtimeDone { epoch, ok } => match self.realtime.take() {
                Some(bring_up) if bring_up.epoch == epoch => {
                    if !ok {
                        warn!("Realtime stream could not be started");
                    }
                    for waiter in bring_up.waiters {
                        let _ = waiter.send(ok);
                    }
                }
                other => self.realtime = other,
            },
        }
    }

    async fn start_info_loop(&mut self) {
        self.scheduler.cancel(TimerKind::InfoRetry);
        self.info_attempts = 0;
        self.request_info_once().await;
    }

    async fn request_info_once(&mut self) {
        self.info_attempts += 1;
        debug!(attempt = self.info_attempts, "Requesting device info");
        if let Err(e) = self.binding.get_info().await {
            warn!(attempt = self.info_attempts, "Info request failed: {}", e);
        }
        if self.info_attempts < self.tunables.info_max_attempts {
            self.scheduler
                .schedule(TimerKind::InfoRetry, self.tunables.info_retry_interval());
        } else {
            debug!("Info retries exhausted");
        }
    }

    async fn set_patient_id(&mut self, patient_id: Option<String>) {
        let patient_id = patient_id
            .map(|id| id.trim().to_string())
            .filter(|id| !id.is_empty());
        if patient_id == self.snapshot.patient_id {
            return;
        }
        if let Err(e) = self.settings.set_patient_id(patient_id.clone()) {
            warn!("Failed to persist patient id: {}", e);
        }
        info!(has_patient = patient_id.is_some(), "Patient identity changed");

        // Files queued for the previous patient must not land under the new one
        self.scheduler.cancel(TimerKind::ReadTimeout);
        self.queue.clear();
        self.snapshot.is_downloading_history = false;
        self.snapshot.download_progress = 0;
        self.snapshot.patient_id = patient_id;

        if self.snapshot.patient_id.is_some() && self.snapshot.connection.is_service_ready() {
            self.start_info_loop().await;
        }
    }

    async fn handle_event(&mut self, event: DeviceEvent) {
        match event {
            DeviceEvent::DeviceFound(device) => self.on_device_found(device).await,
            DeviceEvent::Connected { mac, model } => self.on_connected(mac, model),
            DeviceEvent::ServiceReady { mac } => self.on_service_ready(mac).await,
            DeviceEvent::Disconnected { mac, reason, .. } => self.on_disconnected(mac, reason),
            DeviceEvent::Realtime(sample) => self.on_realtime(sample),
            DeviceEvent::Info(info) => self.on_info(info).await,
            DeviceEvent::ReadProgress(progress) => self.on_read_progress(progress),
            DeviceEvent::HistoryFile(file) => self.on_history_file(file).await,
            DeviceEvent::Error(err) => self.on_error(err).await,
        }
    }

    async fn on_device_found(&mut self, device: DeviceDescriptor) {
        if !self.snapshot.devices.iter().any(|d| d.mac == device.mac) {
            self.snapshot.devices.push(device.clone());
        }

        if !self.auto_reconnect || self.snapshot.connection.device().is_some() {
            return;
        }
        if self.settings.is_known(&device.mac) {
            info!(mac = %device.mac, "Known device found, reconnecting");
            if let Err(e) = self.connect(device, false).await {
                warn!("Auto-reconnect failed: {}", e);
            }
        }
    }

    fn on_connected(&mut self, mac: String, model: u32) {
        if self.intentional_disconnect.as_deref() == Some(mac.as_str()) {
            self.intentional_disconnect = None;
        }
        let device = match &self.snapshot.connection {
            ConnectionState::Connecting(d) if d.mac == mac => {
                let mut device = d.clone();
                if model != 0 {
                    device.model = model;
                }
                device
            }
            other => {
                debug!(mac = %mac, state = ?other, "Ignoring link for a device not being connected");
                return;
            }
        };

        self.scheduler.cancel(TimerKind::ConnectTimeout);
        info!(mac = %device.mac, "Connected");
        self.set_status(format!("Connected to {}", device.name), MessageSeverity::Success);
        self.snapshot.connection = ConnectionState::Connected(device.clone());
        self.snapshot.offline_device = None;
        self.snapshot.last_error = None;

        if let Err(e) = self.settings.remember_device(&device) {
            warn!("Failed to persist known devices: {}", e);
        }
        self.snapshot.known_devices = self.settings.known_devices().to_vec();

        self.start_realtime(None);
    }

    async fn on_service_ready(&mut self, mac: String) {
        let device = match &self.snapshot.connection {
            ConnectionState::Connected(d) if d.mac == mac => d.clone(),
            other => {
                debug!(mac = %mac, state = ?other, "Ignoring service ready");
                return;
            }
        };
        debug!(mac = %mac, "Service ready");
        self.snapshot.connection = ConnectionState::ServiceReady(device);
        self.start_info_loop().await;
    }

    fn on_disconnected(&mut self, mac: Option<String>, reason: i32) {
        if mac.is_some() && mac == self.intentional_disconnect {
            debug!(mac = ?mac, "Intentional disconnect confirmed");
            self.intentional_disconnect = None;
            return;
        }
        let Some(current) = self.snapshot.connection.device().cloned() else {
            debug!(mac = ?mac, "Disconnect without a device, ignoring");
            return;
        };
        if mac.as_ref().is_some_and(|m| *m != current.mac) {
            debug!(mac = ?mac, "Disconnect of a previous device, ignoring");
            return;
        }

        if self.snapshot.connection.is_connecting() {
            self.connect_failed(DeviceError::new(
                ErrorCode::ConnectFailed,
                format!("Link to {} dropped while connecting (reason {})", current.name, reason),
            ));
            return;
        }

        warn!(mac = %current.mac, reason, "Device went offline");
        self.teardown_session();
        self.snapshot.connection = ConnectionState::Disconnected;
        self.set_status(format!("{} disconnected", current.name), MessageSeverity::Warning);
        self.snapshot.offline_device = Some(current);
    }

    fn on_realtime(&mut self, sample: RealtimeSample) {
        let ready = match &self.snapshot.connection {
            ConnectionState::ServiceReady(d) => Some(d.clone()),
            ConnectionState::Connected(_) | ConnectionState::RealtimeActive(_) => None,
            _ => return,
        };
        self.snapshot.realtime = Some(sample);
        self.last_realtime_at = Some(Instant::now());
        if let Some(device) = ready {
            self.snapshot.connection = ConnectionState::RealtimeActive(device);
        }
    }

    async fn on_info(&mut self, info: DeviceInfoSnapshot) {
        self.scheduler.cancel(TimerKind::InfoRetry);
        if !self.snapshot.connection.is_connected() {
            debug!("Ignoring info without a connection");
            return;
        }
        let files = info.files.clone();
        self.snapshot.device_info = Some(info);
        self.reconcile(files).await;
    }

    /// Queue the firmware files not yet stored for the patient
    async fn reconcile(&mut self, files: Vec<String>) {
        let Some(patient) = self.snapshot.patient_id.clone() else {
            info!("Device info arrived before a patient id, history sync deferred");
            return;
        };
        if files.is_empty() {
            return;
        }

        let missing: Vec<String> = match self.store.existing_timestamps(&patient) {
            Ok(existing) => files
                .into_iter()
                .filter(|id| !existing.contains(id.trim()))
                .collect(),
            Err(e) => {
                warn!("Could not list stored history, queueing every file: {}", e);
                files
            }
        };
        let added = self.queue.enqueue(missing);
        if added > 0 {
            info!(added, "History files queued");
        }
        self.process_queue().await;
    }

    /// Start the next read unless one is in flight
    async fn process_queue(&mut self) {
        loop {
            if self.queue.current().is_some() {
                return;
            }
            let Some(id) = self.queue.start_next().map(str::to_string) else {
                self.snapshot.is_downloading_history = false;
                self.snapshot.download_progress = 0;
                return;
            };

            self.snapshot.is_downloading_history = true;
            self.snapshot.download_progress = 0;
            self.scheduler
                .schedule(TimerKind::ReadTimeout, self.tunables.read_timeout());
            debug!(file = %id, "Reading history file");

            match self.binding.read_history_file(&id).await {
                Ok(_) => return,
                Err(e) => {
                    self.scheduler.cancel(TimerKind::ReadTimeout);
                    self.fail_current_read(&e.to_string());
                }
            }
        }
    }

    fn fail_current_read(&mut self, reason: &str) {
        match self.queue.fail_current(self.tunables.max_file_retries) {
            Some(FailOutcome::Requeued { id, attempt }) => {
                warn!(file = %id, attempt, "History read failed, requeued: {}", reason)
            }
            Some(FailOutcome::Dropped { id }) => {
                warn!(file = %id, "History read failed too often, skipping: {}", reason)
            }
            None => {}
        }
    }

    fn on_read_progress(&mut self, progress: u8) {
        if self.queue.current().is_none() {
            return;
        }
        self.snapshot.is_downloading_history = true;
        self.snapshot.download_progress = progress.min(100);
        self.scheduler
            .schedule(TimerKind::ReadTimeout, self.tunables.read_timeout());
    }

    async fn on_history_file(&mut self, file: HistoryFile) {
        let Some(id) = self.queue.current().map(str::to_string) else {
            debug!("Ignoring history file with no read in flight");
            return;
        };
        self.scheduler.cancel(TimerKind::ReadTimeout);

        match self.persist(&file) {
            Ok((patient, name, csv)) => {
                self.queue.complete_current();
                self.snapshot.download_progress = 100;
                info!(file = %id, name = %name, "History file saved");
                self.upload_in_background(patient, name, csv);
            }
            Err(e) => self.fail_current_read(&e.to_string()),
        }
        self.process_queue().await;
    }

    /// Write a downloaded file; returns `(patient, filename, csv)`
    fn persist(&self, file: &HistoryFile) -> Result<(String, String, String), SessionError> {
        let patient = self
            .snapshot
            .patient_id
            .clone()
            .ok_or(SessionError::MissingPatientId)?;
        let serial = self
            .snapshot
            .connection
            .device()
            .map(DeviceDescriptor::serial_suffix)
            .unwrap_or(FALLBACK_SERIAL);
        let name = history_csv::history_file_name(serial, file.start_time, self.zone)
            .ok_or(SessionError::InvalidStartTime(file.start_time))?;
        let csv = history_csv::normalize_times(&file.csv, self.zone);

        self.store.write(&patient, &name, &csv)?;
        Ok((patient, name, csv))
    }

    fn upload_in_background(&self, patient: String, name: String, csv: String) {
        let Some(uploader) = self.uploader.clone().filter(|_| self.auto_upload) else {
            return;
        };
        tokio::spawn(async move {
            if let Err(e) = uploader.upload(&patient, &name, csv).await {
                warn!(file = %name, "Upload failed, left for a later retry: {}", e);
            }
        });
    }

    async fn on_error(&mut self, err: DeviceError) {
        match err.code {
            ErrorCode::ReadFileError => {
                if self.queue.current().is_none() {
                    debug!("Ignoring read error with no read in flight");
                    return;
                }
                self.scheduler.cancel(TimerKind::ReadTimeout);
                self.fail_current_read(&err.message);
                self.process_queue().await;
            }
            ErrorCode::ConnectFailed if self.snapshot.connection.is_connecting() => {
                self.connect_failed(err);
            }
            ErrorCode::InfoError => debug!("Info request failed: {}", err.message),
            ErrorCode::BluetoothOff => {
                self.mark_scan_stopped();
                self.record_error(err);
            }
            _ => self.record_error(err),
        }
    }

    async fn handle_timer(&mut self, kind: TimerKind) {
        match kind {
            TimerKind::InfoRetry => {
                if self.snapshot.connection.is_service_ready() {
                    self.request_info_once().await;
                }
            }
            TimerKind::ReadTimeout => {
                if let Some(id) = self.queue.current().map(str::to_string) {
                    warn!(file = %id, "History read timed out");
                    self.fail_current_read("read timed out");
                    self.process_queue().await;
                }
            }
            TimerKind::ConnectTimeout => {
                if let ConnectionState::Connecting(device) = &self.snapshot.connection {
                    let mac = device.mac.clone();
                    warn!(mac = %mac, "Connect timed out");
                    self.intentional_disconnect = Some(mac);
                    if let Err(e) = self.binding.disconnect().await {
                        warn!("Disconnect after timeout failed: {}", e);
                    }
                    self.connect_failed(DeviceError::new(
                        ErrorCode::ConnectFailed,
                        "Connection timed out",
                    ));
                }
            }
            TimerKind::ReconnectScanStop => {
                if self.snapshot.is_scanning {
                    info!("Reconnect scan finished");
                    self.stop_scan().await;
                }
            }
        }
    }
}

async fn bring_up_realtime(binding: &BindingClient, tunables: &SessionSettings) -> bool {
    let attempts = tunables.realtime_max_attempts.max(1);
    for attempt in 1..=attempts {
        match binding.start_realtime().await {
            Ok(_) => {
                debug!(attempt, "Realtime stream started");
                return true;
            }
            Err(e) => {
                warn!(attempt, "Realtime start failed: {}", e);
                if attempt < attempts {
                    tokio::time::sleep(tunables.realtime_backoff(attempt)).await;
                }
            }
        }
    }
    false
}
