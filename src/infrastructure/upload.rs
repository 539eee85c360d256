//! Upload Gateway
//!
//! Multipart POST of a persisted CSV to the clinic backend. A 409 means the
//! server already holds a file of that name and counts as uploaded.

use crate::domain::settings::UploadSettings;
use crate::infrastructure::storage::{HistoryStore, StorageError};
use async_trait::async_trait;
use reqwest::{multipart, Client, StatusCode};
use std::time::Duration;
use thiserror::Error;
use tracing::{info, warn};

#[derive(Error, Debug)]
pub enum UploadError {
    #[error("missing patient id")]
    MissingPatientId,
    #[error("upload request failed: {0}")]
    Http(#[from] reqwest::Error),
    #[error("upload rejected: status={status}, payload={payload}")]
    Rejected { status: u16, payload: String },
    #[error(transparent)]
    Storage(#[from] StorageError),
}

#[async_trait]
pub trait CsvUploader: Send + Sync {
    async fn upload(&self, patient_id: &str, file_name: &str, csv: String) -> Result<(), UploadError>;
}

/// Whether the backend accepted the file. Besides 200 and 409, a 2xx whose
/// JSON body carries `"status": 200` is accepted.
pub fn is_accepted(status: u16, body: &str) -> bool {
    if status == StatusCode::CONFLICT.as_u16() || status == StatusCode::OK.as_u16() {
        return true;
    }
    if !(200..300).contains(&status) {
        return false;
    }
    serde_json::from_str::<serde_json::Value>(body)
        .ok()
        .and_then(|v| v.get("status").and_then(serde_json::Value::as_u64))
        == Some(200)
}

pub struct HttpUploader {
    client: Client,
    url: String,
    credentials: Option<(String, Option<String>)>,
}

impl HttpUploader {
    /// `None` when no backend is configured
    pub fn from_settings(settings: &UploadSettings) -> Result<Option<Self>, UploadError> {
        let Some(base_url) = settings.base_url.as_deref().filter(|u| !u.trim().is_empty()) else {
            return Ok(None);
        };
        let client = Client::builder()
            .timeout(Duration::from_secs(settings.timeout_secs))
            .build()?;
        let url = format!(
            "{}/{}",
            base_url.trim_end_matches('/'),
            settings.endpoint_path.trim_start_matches('/')
        );
        let credentials = settings
            .username
            .clone()
            .map(|user| (user, settings.password.clone()));

        Ok(Some(Self {
            client,
            url,
            credentials,
        }))
    }

    pub fn url(&self) -> &str {
        &self.url
    }
}

#[async_trait]
impl CsvUploader for HttpUploader {
    async fn upload(&self, patient_id: &str, file_name: &str, csv: String) -> Result<(), UploadError> {
        if patient_id.trim().is_empty() {
            return Err(UploadError::MissingPatientId);
        }

        let form = multipart::Form::new()
            .text("patient_id", patient_id.to_string())
            .text("silent", "1")
            .part(
                "csv",
                multipart::Part::text(csv)
                    .file_name(file_name.to_string())
                    .mime_str("text/csv")?,
            );

        let mut request = self
            .client
            .post(&self.url)
            .header(reqwest::header::ACCEPT, "application/json")
            .multipart(form);
        if let Some((user, password)) = &self.credentials {
            request = request.basic_auth(user, password.as_ref());
        }

        let response = request.send().await?;
        let status = response.status().as_u16();
        let payload = response.text().await.unwrap_or_default();

        if is_accepted(status, &payload) {
            info!(file = file_name, status, "History file uploaded");
            Ok(())
        } else {
            Err(UploadError::Rejected { status, payload })
        }
    }
}

/// Upload every stored CSV of a patient; returns the names that went through.
/// Individual failures are logged and skipped.
pub async fn upload_pending(
    uploader: &dyn CsvUploader,
    store: &dyn HistoryStore,
    patient_id: &str,
) -> Result<Vec<String>, UploadError> {
    let mut uploaded = Vec::new();
    for entry in store.list(patient_id)? {
        let csv = match store.read(patient_id, &entry.name) {
            Ok(csv) => csv,
            Err(e) => {
                warn!(file = %entry.name, "Skipping unreadable history file: {}", e);
                continue;
            }
        };
        match uploader.upload(patient_id, &entry.name, csv).await {
            Ok(()) => uploaded.push(entry.name),
            Err(e) => warn!(file = %entry.name, "Upload failed: {}", e),
        }
    }
    Ok(uploaded)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::infrastructure::storage::FsHistoryStore;
    use std::sync::Mutex;

    #[test]
    fn test_accepted_statuses() {
        assert!(is_accepted(200, ""));
        assert!(is_accepted(409, "{\"error\":\"duplicate\"}"));
        assert!(is_accepted(201, "{\"status\":200}"));
        assert!(!is_accepted(201, "{\"status\":500}"));
        assert!(!is_accepted(204, ""));
        assert!(!is_accepted(500, "{\"status\":200}"));
    }

    #[test]
    fn test_uploader_needs_base_url() {
        let mut settings = UploadSettings::default();
        assert!(HttpUploader::from_settings(&settings).unwrap().is_none());

        settings.base_url = Some("https://clinic.example/".to_string());
        let uploader = HttpUploader::from_settings(&settings).unwrap().unwrap();
        assert_eq!(
            uploader.url(),
            "https://clinic.example/staff/o2ring-data/upload.php"
        );
    }

    struct RejectSome {
        reject: &'static str,
        seen: Mutex<Vec<(String, String)>>,
    }

    #[async_trait]
    impl CsvUploader for RejectSome {
        async fn upload(&self, patient_id: &str, file_name: &str, _csv: String) -> Result<(), UploadError> {
            self.seen
                .lock()
                .unwrap()
                .push((patient_id.to_string(), file_name.to_string()));
            if file_name == self.reject {
                return Err(UploadError::Rejected {
                    status: 500,
                    payload: String::new(),
                });
            }
            Ok(())
        }
    }

    #[tokio::test]
    async fn test_upload_pending_keeps_going() {
        let dir = tempfile::tempdir().unwrap();
        let store = FsHistoryStore::new(dir.path());
        store.write("P100", "a_20251126013442.csv", "x").unwrap();
        store.write("P100", "b_20251127004210.csv", "y").unwrap();
        store.write("P100", "c_20251128004210.csv", "z").unwrap();

        let uploader = RejectSome {
            reject: "b_20251127004210.csv",
            seen: Mutex::new(Vec::new()),
        };
        let uploaded = upload_pending(&uploader, &store, "P100").await.unwrap();

        assert_eq!(uploaded, vec!["a_20251126013442.csv", "c_20251128004210.csv"]);
        assert_eq!(uploader.seen.lock().unwrap().len(), 3);
    }
}
