//! Reading persistence.
//!
//! [`RecordStore`] is the only persistence surface the control loop knows
//! about. Two backends are provided: [`MemoryStore`] and the CSV-backed
//! [`CsvStore`] (feature `storage_csv`).

pub mod csv_store;
pub mod storage;

pub use csv_store::CsvStore;
pub use storage::{ExportSink, MemoryStore, ProgramManifest, RecordStore};

use crate::config::{StorageBackend, StorageConfig};
use crate::error::AppResult;
use std::sync::Arc;

/// Opens the backend selected in the settings.
pub fn open_store(config: &StorageConfig) -> AppResult<Arc<dyn RecordStore>> {
    match config.backend {
        StorageBackend::Csv => open_csv(config),
        StorageBackend::Memory => Ok(Arc::new(MemoryStore::new())),
    }
}

#[cfg(feature = "storage_csv")]
fn open_csv(config: &StorageConfig) -> AppResult<Arc<dyn RecordStore>> {
    Ok(Arc::new(CsvStore::open(config.root.clone())?))
}

#[cfg(not(feature = "storage_csv"))]
fn open_csv(config: &StorageConfig) -> AppResult<Arc<dyn RecordStore>> {
    CsvStore::open(config.root.clone())?;
    Err(crate::error::DaqError::FeatureNotEnabled("storage_csv".to_string()))
}
