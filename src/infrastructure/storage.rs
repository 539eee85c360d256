//! History Storage Gateway
//!
//! Per-patient directories of CSV recordings under `<root>/o2data/<patient>`.

use crate::domain::history_csv;
use std::collections::HashSet;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::debug;

#[derive(Error, Debug)]
pub enum StorageError {
    #[error("invalid patient id {0:?}")]
    InvalidPatientId(String),
    #[error("invalid file name {0:?}")]
    InvalidFileName(String),
    #[error("storage i/o failed: {0}")]
    Io(#[from] io::Error),
}

/// One file in a patient directory
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HistoryEntry {
    pub name: String,
    pub path: PathBuf,
}

pub trait HistoryStore: Send + Sync {
    /// Create the patient directory if needed and return it
    fn ensure_dir(&self, patient_id: &str) -> Result<PathBuf, StorageError>;
    /// CSV files of a patient, sorted by name
    fn list(&self, patient_id: &str) -> Result<Vec<HistoryEntry>, StorageError>;
    fn read(&self, patient_id: &str, name: &str) -> Result<String, StorageError>;
    /// Create or overwrite
    fn write(&self, patient_id: &str, name: &str, contents: &str) -> Result<PathBuf, StorageError>;
    fn delete(&self, patient_id: &str, name: &str) -> Result<(), StorageError>;
    fn exists(&self, patient_id: &str, name: &str) -> Result<bool, StorageError>;

    /// 14-digit identifiers of the recordings already stored for a patient
    fn existing_timestamps(&self, patient_id: &str) -> Result<HashSet<String>, StorageError> {
        Ok(self
            .list(patient_id)?
            .iter()
            .filter_map(|entry| history_csv::timestamp_suffix(&entry.name))
            .map(str::to_string)
            .collect())
    }
}

/// Filesystem store rooted at the configured data directory
#[derive(Debug, Clone)]
pub struct FsHistoryStore {
    root: PathBuf,
}

impl FsHistoryStore {
    pub fn new(data_dir: impl Into<PathBuf>) -> Self {
        Self {
            root: data_dir.into().join("o2data"),
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn patient_dir(&self, patient_id: &str) -> Result<PathBuf, StorageError> {
        let id = patient_id.trim();
        if !is_plain_component(id) {
            return Err(StorageError::InvalidPatientId(patient_id.to_string()));
        }
        Ok(self.root.join(id))
    }

    fn file_path(&self, patient_id: &str, name: &str) -> Result<PathBuf, StorageError> {
        if !is_plain_component(name) {
            return Err(StorageError::InvalidFileName(name.to_string()));
        }
        Ok(self.patient_dir(patient_id)?.join(name))
    }
}

/// A single path component that cannot escape its parent
fn is_plain_component(value: &str) -> bool {
    !value.is_empty()
        && value != "."
        && value != ".."
        && !value.contains(['/', '\\'])
}

impl HistoryStore for FsHistoryStore {
    fn ensure_dir(&self, patient_id: &str) -> Result<PathBuf, StorageError> {
        let dir = self.patient_dir(patient_id)?;
        fs::create_dir_all(&dir)?;
        Ok(dir)
    }

    fn list(&self, patient_id: &str) -> Result<Vec<HistoryEntry>, StorageError> {
        let dir = self.ensure_dir(patient_id)?;
        let mut entries = Vec::new();
        for entry in fs::read_dir(&dir)? {
            let entry = entry?;
            if !entry.file_type()?.is_file() {
                continue;
            }
            let name = entry.file_name().to_string_lossy().into_owned();
            if name.to_ascii_lowercase().ends_with(".csv") {
                entries.push(HistoryEntry {
                    name,
                    path: entry.path(),
                });
            }
        }
        entries.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(entries)
    }

    fn read(&self, patient_id: &str, name: &str) -> Result<String, StorageError> {
        Ok(fs::read_to_string(self.file_path(patient_id, name)?)?)
    }

    fn write(&self, patient_id: &str, name: &str, contents: &str) -> Result<PathBuf, StorageError> {
        self.ensure_dir(patient_id)?;
        let path = self.file_path(patient_id, name)?;
        fs::write(&path, contents)?;
        debug!(path = %path.display(), bytes = contents.len(), "History file written");
        Ok(path)
    }

    fn delete(&self, patient_id: &str, name: &str) -> Result<(), StorageError> {
        match fs::remove_file(self.file_path(patient_id, name)?) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    fn exists(&self, patient_id: &str, name: &str) -> Result<bool, StorageError> {
        Ok(self.file_path(patient_id, name)?.is_file())
    }
}
