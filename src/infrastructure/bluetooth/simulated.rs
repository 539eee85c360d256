//! In-memory ring
//!
//! A [`VendorSdk`] that answers from canned data. Used by the headless runner
//! when no radio is available and by tests that need the binding end to end.
//! Cloning yields another handle on the same ring, so a test can keep one to
//! inject link drops while the binding owns the other.

use crate::domain::history_csv::{self, LocalZone};
use crate::domain::models::{DeviceError, DeviceModel, ErrorCode};
use crate::infrastructure::bluetooth::sdk::{
    AdapterState, OxyFile, OxySample, SdkCallback, VendorSdk,
};
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::sync::mpsc;
use tracing::debug;

#[derive(Debug, Clone)]
struct SimDevice {
    mac: String,
    name: Option<String>,
    model: DeviceModel,
}

#[derive(Debug, Default)]
struct SimState {
    callbacks: Option<mpsc::UnboundedSender<SdkCallback>>,
    permission_granted: bool,
    handshake: bool,
    devices: Vec<SimDevice>,
    files: Vec<(String, OxyFile)>,
    failing_reads: HashMap<String, u32>,
    connected: Option<String>,
    connect_calls: usize,
    radio_missing: bool,
    host_detached: bool,
    hold_reads: bool,
    held_read: Option<String>,
}

#[derive(Debug, Clone, Default)]
pub struct SimulatedRing {
    state: Arc<Mutex<SimState>>,
}

impl SimulatedRing {
    pub fn new() -> Self {
        let ring = Self::default();
        ring.lock().permission_granted = true;
        ring
    }

    /// One ring holding two overnight recordings
    pub fn with_sample_data(zone: LocalZone) -> Self {
        let ring = Self::new();
        ring.add_device("D4:8C:11:9F:3C:01", Some("O2Ring 9F3C"), 1);
        for stamp in ["20251126013442", "20251127004210"] {
            if let Some(start_time) = history_csv::file_stamp_to_epoch(stamp, zone) {
                ring.add_file(stamp, synthetic_recording(start_time, 3_600));
            }
        }
        ring
    }

    fn lock(&self) -> MutexGuard<'_, SimState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn add_device(&self, mac: &str, name: Option<&str>, model: DeviceModel) {
        self.lock().devices.push(SimDevice {
            mac: mac.to_string(),
            name: name.map(str::to_string),
            model,
        });
    }

    pub fn add_file(&self, id: &str, file: OxyFile) {
        self.lock().files.push((id.to_string(), file));
    }

    /// Fail the next `times` reads of `id`
    pub fn fail_reads(&self, id: &str, times: u32) {
        self.lock().failing_reads.insert(id.to_string(), times);
    }

    /// Services deploy asynchronously after the link comes up
    pub fn set_handshake(&self, handshake: bool) {
        self.lock().handshake = handshake;
    }

    pub fn set_permission(&self, granted: bool) {
        self.lock().permission_granted = granted;
    }

    /// Lose the link as if the ring went out of range
    pub fn drop_link(&self, reason: i32) {
        let mut state = self.lock();
        if let Some(mac) = state.connected.take() {
            state.send(SdkCallback::LinkDown { mac, reason });
        }
    }

    /// Behave like a platform without a Bluetooth manager
    pub fn remove_radio(&self) {
        self.lock().radio_missing = true;
    }

    /// No foreground host is left to show the permission prompt
    pub fn detach_host(&self) {
        self.lock().host_detached = true;
    }

    /// Park reads after their first progress report until [`Self::release_read`]
    pub fn hold_reads(&self) {
        self.lock().hold_reads = true;
    }

    pub fn release_read(&self) {
        let mut state = self.lock();
        if let Some(id) = state.held_read.take() {
            state.finish_read(&id);
        }
    }

    pub fn connected(&self) -> Option<String> {
        self.lock().connected.clone()
    }

    pub fn connect_calls(&self) -> usize {
        self.lock().connect_calls
    }
}

impl SimState {
    fn send(&self, callback: SdkCallback) {
        if let Some(tx) = &self.callbacks {
            let _ = tx.send(callback);
        }
    }

    /// Handshake-platform SDKs report fractions, the other one percent
    fn progress(&self, fraction: f64) -> f64 {
        if self.handshake {
            fraction
        } else {
            fraction * 100.0
        }
    }

    fn finish_read(&self, file_id: &str) {
        let file = self
            .files
            .iter()
            .find(|(id, _)| id == file_id)
            .map(|(_, file)| file.clone());
        match file {
            Some(file) => {
                self.send(SdkCallback::ReadProgress(self.progress(0.5)));
                self.send(SdkCallback::ReadProgress(self.progress(1.0)));
                self.send(SdkCallback::FileRead(file));
            }
            None => self.send(SdkCallback::FileReadFailed(format!("{} not found", file_id))),
        }
    }

    fn require_link(&self) -> Result<(), DeviceError> {
        if self.connected.is_none() {
            return Err(DeviceError::new(
                ErrorCode::NoDeviceConnected,
                "No active O2Ring connection",
            ));
        }
        Ok(())
    }
}

impl VendorSdk for SimulatedRing {
    fn init(&mut self, callbacks: mpsc::UnboundedSender<SdkCallback>) -> Result<(), DeviceError> {
        let mut state = self.lock();
        if state.radio_missing {
            return Err(DeviceError::new(
                ErrorCode::BluetoothUnavailable,
                "Bluetooth manager unavailable",
            ));
        }
        state.callbacks = Some(callbacks);
        state.send(SdkCallback::AdapterState(AdapterState::PoweredOn));
        Ok(())
    }

    fn request_permissions(&mut self) -> Result<bool, DeviceError> {
        let state = self.lock();
        if state.host_detached {
            return Err(DeviceError::new(
                ErrorCode::NoActivity,
                "No foreground activity to ask for permissions",
            ));
        }
        Ok(state.permission_granted)
    }

    fn start_scan(&mut self) -> Result<(), DeviceError> {
        let state = self.lock();
        // Rings advertise repeatedly; deliver each twice
        for _ in 0..2 {
            for device in &state.devices {
                state.send(SdkCallback::Discovered {
                    mac: device.mac.clone(),
                    name: device.name.clone(),
                    model: device.model,
                });
            }
        }
        Ok(())
    }

    fn stop_scan(&mut self) {}

    fn connect(&mut self, mac: &str, _model: DeviceModel) -> Result<(), DeviceError> {
        let mut state = self.lock();
        state.connect_calls += 1;
        if !state.devices.iter().any(|d| d.mac == mac) {
            state.send(SdkCallback::ConnectFailed(format!("{} is out of range", mac)));
            return Ok(());
        }
        state.connected = Some(mac.to_string());
        state.send(SdkCallback::LinkUp {
            mac: mac.to_string(),
        });
        if state.handshake {
            state.send(SdkCallback::ServiceDeployed(true));
        }
        Ok(())
    }

    fn disconnect(&mut self, mac: &str, _model: DeviceModel) {
        let mut state = self.lock();
        if state.connected.as_deref() == Some(mac) {
            state.connected = None;
            state.send(SdkCallback::LinkDown {
                mac: mac.to_string(),
                reason: 0,
            });
        }
    }

    fn request_realtime(&mut self, _model: DeviceModel) -> Result<(), DeviceError> {
        let state = self.lock();
        state.require_link()?;
        state.send(SdkCallback::RealtimeParams {
            spo2: 97,
            pulse_rate: 62,
            perfusion_index: 15,
            motion: 0,
        });
        Ok(())
    }

    fn request_info(&mut self, _model: DeviceModel) -> Result<(), DeviceError> {
        let state = self.lock();
        state.require_link()?;
        let file_list = state
            .files
            .iter()
            .map(|(id, _)| id.as_str())
            .collect::<Vec<_>>()
            .join(",");
        state.send(SdkCallback::Info {
            battery: "87".to_string(),
            state: "0".to_string(),
            file_list,
        });
        Ok(())
    }

    fn read_file(&mut self, _model: DeviceModel, file_id: &str) -> Result<(), DeviceError> {
        let mut state = self.lock();
        state.require_link()?;

        let started = state.progress(0.25);
        state.send(SdkCallback::ReadProgress(started));
        if let Some(remaining) = state.failing_reads.get_mut(file_id) {
            if *remaining > 0 {
                *remaining -= 1;
                debug!(file = file_id, "Simulated read failure");
                state.send(SdkCallback::FileReadFailed(format!("Read of {} failed", file_id)));
                return Ok(());
            }
        }

        if state.hold_reads {
            state.held_read = Some(file_id.to_string());
            return Ok(());
        }
        state.finish_read(file_id);
        Ok(())
    }
}

/// A plausible night: slow drift in both vitals, a few dropouts
pub fn synthetic_recording(start_time: i64, seconds: u32) -> OxyFile {
    let points = (seconds / 4).max(1);
    let samples = (0..points)
        .map(|i| {
            let dropout = i % 97 == 96;
            OxySample {
                spo2: if dropout { 255 } else { 94 + (i % 5) as u16 },
                pulse_rate: if dropout { 511 } else { 58 + (i % 9) as u16 },
                motion: (i % 13 == 0) as u16,
                spo2_warning: false,
                pr_warning: false,
            }
        })
        .collect();
    OxyFile {
        start_time,
        recording_seconds: seconds,
        samples,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::models::DeviceEvent;
    use crate::infrastructure::bluetooth::convert::RowTimeFormat;
    use crate::infrastructure::bluetooth::service::{BindingConfig, DeviceBindingService};
    use crate::infrastructure::bluetooth::connection::Platform;
    use std::time::Duration;
    use tokio::time::timeout;

    async fn next(events: &mut mpsc::UnboundedReceiver<DeviceEvent>) -> DeviceEvent {
        timeout(Duration::from_secs(1), events.recv())
            .await
            .unwrap()
            .unwrap()
    }

    fn config(platform: Platform) -> BindingConfig {
        BindingConfig {
            platform,
            zone: LocalZone::utc(),
            time_format: RowTimeFormat::Legacy,
        }
    }

    #[tokio::test]
    async fn test_scan_reports_each_device_once() {
        let ring = SimulatedRing::new();
        ring.add_device("AA", Some("O2Ring 0001"), 1);
        ring.add_device("BB", Some("O2Ring 0002"), 1);
        let (client, mut events) = DeviceBindingService::spawn(ring, config(Platform::ReadyOnLink));

        assert!(client.initialize().await.unwrap());
        assert!(client.initialize().await.unwrap());
        assert!(client.scan().await.unwrap());

        let mut found = Vec::new();
        while let Ok(Some(event)) = timeout(Duration::from_millis(50), events.recv()).await {
            if let DeviceEvent::DeviceFound(device) = event {
                found.push(device.mac);
            }
        }
        assert_eq!(found, vec!["AA", "BB"]);
    }

    #[tokio::test]
    async fn test_data_calls_need_ready_link() {
        let ring = SimulatedRing::new();
        let (client, _events) = DeviceBindingService::spawn(ring, config(Platform::ReadyOnLink));

        let err = client.get_info().await.unwrap_err();
        assert_eq!(err.code, ErrorCode::NoDeviceConnected);
        let err = client.start_realtime().await.unwrap_err();
        assert_eq!(err.code, ErrorCode::NoDeviceConnected);
        assert!(client.disconnect().await.unwrap());

        let err = client.connect("ZZ", 1).await.unwrap_err();
        assert_eq!(err.code, ErrorCode::DeviceNotFound);
        let err = client.connect("  ", 1).await.unwrap_err();
        assert_eq!(err.code, ErrorCode::InvalidDevice);
    }

    #[tokio::test]
    async fn test_handshake_platform_gates_on_service_deployed() {
        let ring = SimulatedRing::new();
        ring.add_device("AA", Some("O2Ring 0001"), 1);
        ring.set_handshake(true);
        let (client, mut events) = DeviceBindingService::spawn(ring, config(Platform::Handshake));

        // Unscanned devices can be retrieved on this platform
        assert!(client.connect("AA", 1).await.unwrap());
        loop {
            match next(&mut events).await {
                DeviceEvent::Connected { mac, model } => {
                    assert_eq!((mac.as_str(), model), ("AA", 1));
                    break;
                }
                _ => continue,
            }
        }
        assert_eq!(
            next(&mut events).await,
            DeviceEvent::ServiceReady {
                mac: "AA".to_string()
            }
        );
        assert!(client.is_service_ready().await.unwrap());
    }

    #[tokio::test]
    async fn test_read_emits_progress_then_csv() {
        let ring = SimulatedRing::new();
        ring.add_device("AA", Some("O2Ring 0001"), 1);
        ring.add_file("20251126132744", synthetic_recording(1_764_163_664, 40));
        let (client, mut events) =
            DeviceBindingService::spawn(ring.clone(), config(Platform::ReadyOnLink));

        client.scan().await.unwrap();
        client.connect("AA", 0).await.unwrap();
        while !matches!(next(&mut events).await, DeviceEvent::ServiceReady { .. }) {}

        client.get_info().await.unwrap();
        match next(&mut events).await {
            DeviceEvent::Info(info) => {
                assert_eq!(info.battery_level, 87);
                assert_eq!(info.files, vec!["20251126132744"]);
            }
            other => panic!("unexpected event {:?}", other),
        }

        client.read_history_file("20251126132744").await.unwrap();
        assert_eq!(next(&mut events).await, DeviceEvent::ReadProgress(25));
        assert_eq!(next(&mut events).await, DeviceEvent::ReadProgress(50));
        assert_eq!(next(&mut events).await, DeviceEvent::ReadProgress(100));
        match next(&mut events).await {
            DeviceEvent::HistoryFile(file) => {
                assert_eq!(file.start_time, 1_764_163_664);
                assert_eq!(file.csv.lines().count(), 11);
            }
            other => panic!("unexpected event {:?}", other),
        }

        ring.drop_link(8);
        assert_eq!(
            next(&mut events).await,
            DeviceEvent::Disconnected {
                mac: Some("AA".to_string()),
                model: Some(1),
                reason: 8,
            }
        );
        assert_eq!(ring.connect_calls(), 1);
    }

    #[tokio::test]
    async fn test_file_read_after_disconnect_is_dropped() {
        let ring = SimulatedRing::new();
        ring.add_device("AA", Some("O2Ring 0001"), 1);
        ring.add_file("20251126132744", synthetic_recording(1_764_163_664, 40));
        ring.hold_reads();
        let (client, mut events) =
            DeviceBindingService::spawn(ring.clone(), config(Platform::ReadyOnLink));

        client.scan().await.unwrap();
        client.connect("AA", 1).await.unwrap();
        while !matches!(next(&mut events).await, DeviceEvent::ServiceReady { .. }) {}

        client.read_history_file("20251126132744").await.unwrap();
        assert_eq!(next(&mut events).await, DeviceEvent::ReadProgress(25));
        assert!(client.disconnect().await.unwrap());
        assert!(matches!(
            next(&mut events).await,
            DeviceEvent::Disconnected { .. }
        ));

        ring.release_read();
        while let Ok(Some(event)) = timeout(Duration::from_millis(50), events.recv()).await {
            assert!(
                !matches!(event, DeviceEvent::HistoryFile(_) | DeviceEvent::ReadProgress(_)),
                "late read surfaced: {:?}",
                event
            );
        }
    }

    #[tokio::test]
    async fn test_missing_host_and_radio_are_coded() {
        let ring = SimulatedRing::new();
        ring.detach_host();
        ring.remove_radio();
        let (client, _events) = DeviceBindingService::spawn(ring, config(Platform::ReadyOnLink));

        let err = client.request_permissions().await.unwrap_err();
        assert_eq!(err.code, ErrorCode::NoActivity);
        assert!(err.code.is_precondition());
        let err = client.initialize().await.unwrap_err();
        assert_eq!(err.code, ErrorCode::BluetoothUnavailable);
        let err = client.scan().await.unwrap_err();
        assert_eq!(err.code, ErrorCode::BluetoothUnavailable);
    }
}
