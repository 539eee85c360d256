use o2ring_companion::domain::history_csv::LocalZone;
use o2ring_companion::domain::models::SessionSnapshot;
use o2ring_companion::domain::settings::SettingsService;
use o2ring_companion::infrastructure::bluetooth::{
    BindingConfig, DeviceBindingService, SimulatedRing,
};
use o2ring_companion::infrastructure::logging;
use o2ring_companion::infrastructure::storage::FsHistoryStore;
use o2ring_companion::infrastructure::upload::{self, CsvUploader, HttpUploader};
use o2ring_companion::session::SessionController;
use std::sync::Arc;
use tracing::{info, warn};

/// Patient identity override for headless runs
const PATIENT_ENV: &str = "O2RING_PATIENT_ID";

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let mut settings = SettingsService::new()?;
    if let Ok(patient_id) = std::env::var(PATIENT_ENV) {
        settings.get_mut().patient_id = Some(patient_id.trim().to_string()).filter(|p| !p.is_empty());
    }

    let _logging_guard = logging::init_logger(&settings.get().log_settings)?;
    info!("Starting O2Ring companion");

    let config = settings.get().clone();
    let zone = LocalZone::from_offset_minutes(config.utc_offset_minutes);

    // No radio stack is linked into the headless runner
    let sdk = SimulatedRing::with_sample_data(zone);
    let (binding, events) =
        DeviceBindingService::spawn(sdk, BindingConfig::for_platform(config.platform, zone));

    let store = Arc::new(FsHistoryStore::new(&config.data_dir));
    info!(root = %store.root().display(), "History store ready");
    let uploader: Option<Arc<dyn CsvUploader>> = match HttpUploader::from_settings(&config.upload) {
        Ok(Some(uploader)) => {
            info!(url = %uploader.url(), "History upload enabled");
            Some(Arc::new(uploader))
        }
        Ok(None) => None,
        Err(e) => {
            warn!("History upload disabled: {}", e);
            None
        }
    };

    if let (Some(uploader), Some(patient_id)) = (&uploader, &config.patient_id) {
        match upload::upload_pending(uploader.as_ref(), store.as_ref(), patient_id).await {
            Ok(uploaded) if !uploaded.is_empty() => {
                info!(count = uploaded.len(), "Uploaded pending history files")
            }
            Ok(_) => {}
            Err(e) => warn!("Pending upload failed: {}", e),
        }
    }

    let handle = SessionController::spawn(binding, events, settings, store, uploader);
    handle.start().await?;

    if handle.snapshot().known_devices.is_empty() {
        handle.start_scan().await?;
    }

    let mut state = handle.subscribe();
    let mut last = state.borrow().clone();
    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => break,
            changed = state.changed() => {
                if changed.is_err() {
                    break;
                }
                let snapshot = state.borrow_and_update().clone();
                log_changes(&last, &snapshot);

                // First run: pair with whatever ring shows up
                if snapshot.known_devices.is_empty() && snapshot.connection.device().is_none() {
                    if let Some(device) = snapshot.devices.first().cloned() {
                        if let Err(e) = handle.connect_to_device(device).await {
                            warn!("Connect failed: {}", e);
                        }
                    }
                }
                last = snapshot;
            }
        }
    }

    info!("Shutting down");
    handle.shutdown();
    Ok(())
}

fn log_changes(previous: &SessionSnapshot, current: &SessionSnapshot) {
    if previous.connection != current.connection {
        info!(state = ?current.connection, "Connection changed");
    }
    if previous.connected_device() != current.connected_device() {
        if let Some(device) = current.connected_device() {
            info!(device = %device, "Device linked");
        }
    }
    if previous.device_info != current.device_info {
        if let Some(info) = &current.device_info {
            info!(
                battery = info.battery_level,
                files = info.files.len(),
                "Device info"
            );
        }
    }
    if (previous.download_completed_files, previous.download_total_files)
        != (current.download_completed_files, current.download_total_files)
    {
        info!(
            completed = current.download_completed_files,
            total = current.download_total_files,
            "History download"
        );
    }
    if previous.status != current.status {
        if let Some(status) = &current.status {
            info!(severity = ?status.severity, "{}", status.message);
        }
    }
}
