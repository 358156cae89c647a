//! CSV-backed [`RecordStore`].
//!
//! One directory per program under the store root:
//!
//! ```text
//! <root>/<program id>/manifest.json
//! <root>/<program id>/readings.csv
//! ```
//!
//! A batch is serialized in memory and appended with a single write followed
//! by `sync_data`. A crash mid-write leaves an unterminated last row, which is
//! cut off the next time the file is loaded, so a batch is either on disk or
//! not. Deleting partial cycles rewrites the file through a temporary file and
//! a rename.

#[cfg(feature = "storage_csv")]
mod csv_enabled {
    use crate::core::{ChannelId, ProgramId, Reading, ReadingKind};
    use crate::data::storage::{
        check_batch, last_completed, newest_of_channel, partial_cycles, ProgramManifest,
        RecordStore,
    };
    use crate::error::{AppResult, DaqError};
    use async_trait::async_trait;
    use chrono::{DateTime, Utc};
    use serde::{Deserialize, Serialize};
    use std::collections::hash_map::Entry;
    use std::collections::HashMap;
    use std::fs::{self, File, OpenOptions};
    use std::io::Write;
    use std::path::{Path, PathBuf};
    use tokio::sync::Mutex;
    use tracing::{debug, info, warn};

    const MANIFEST: &str = "manifest.json";
    const READINGS: &str = "readings.csv";

    /// Flat CSV row of a [`Reading`].
    #[derive(Serialize, Deserialize)]
    struct Row {
        cycle: u32,
        point: u32,
        channel: ChannelId,
        timestamp: DateTime<Utc>,
        kind: ReadingKind,
        temperature_c: f64,
        wavelength_nm: f64,
        power_dbm: f64,
        drift_rate: Option<f64>,
    }

    impl From<Reading> for Row {
        fn from(r: Reading) -> Self {
            Self {
                cycle: r.cycle,
                point: r.point,
                channel: r.channel,
                timestamp: r.timestamp,
                kind: r.kind,
                temperature_c: r.temperature_c,
                wavelength_nm: r.wavelength_nm,
                power_dbm: r.power_dbm,
                drift_rate: r.drift_rate,
            }
        }
    }

    impl From<Row> for Reading {
        fn from(r: Row) -> Self {
            Self {
                channel: r.channel,
                cycle: r.cycle,
                point: r.point,
                timestamp: r.timestamp,
                kind: r.kind,
                temperature_c: r.temperature_c,
                wavelength_nm: r.wavelength_nm,
                power_dbm: r.power_dbm,
                drift_rate: r.drift_rate,
            }
        }
    }

    /// CSV record store. Assumes it is the only writer of its directory: the
    /// readings of every program it has touched are indexed in memory.
    pub struct CsvStore {
        root: PathBuf,
        /// Readings on disk per program, loaded on first use. Also serializes
        /// file access, since readers and the runner share the store.
        index: Mutex<HashMap<ProgramId, Vec<Reading>>>,
    }

    impl CsvStore {
        /// Opens (and creates if needed) a store rooted at `root`.
        pub fn open(root: impl Into<PathBuf>) -> AppResult<Self> {
            let root = root.into();
            fs::create_dir_all(&root)?;
            info!(root = %root.display(), "CSV record store opened");
            Ok(Self {
                root,
                index: Mutex::new(HashMap::new()),
            })
        }

        fn program_dir(&self, program: &ProgramId) -> AppResult<PathBuf> {
            let id = program.as_str();
            if id.is_empty() || id == "." || id == ".." || id.contains(['/', '\\']) {
                return Err(DaqError::Storage(format!(
                    "program id '{id}' cannot be used as a directory name"
                )));
            }
            Ok(self.root.join(id))
        }

        fn load_manifest(dir: &Path) -> AppResult<Option<ProgramManifest>> {
            let path = dir.join(MANIFEST);
            if !path.exists() {
                return Ok(None);
            }
            let text = fs::read_to_string(&path)?;
            serde_json::from_str(&text).map(Some).map_err(|e| {
                DaqError::Storage(format!("corrupt manifest {}: {e}", path.display()))
            })
        }

        fn require_manifest(&self, program: &ProgramId) -> AppResult<(PathBuf, ProgramManifest)> {
            let dir = self.program_dir(program)?;
            let manifest = Self::load_manifest(&dir)?
                .ok_or_else(|| DaqError::Storage(format!("unknown program {program}")))?;
            Ok((dir, manifest))
        }

        /// Reads the readings file. An unterminated last line is what an
        /// interrupted append leaves behind; it is cut off and the file
        /// rewritten so later appends start on a fresh line.
        fn load_readings(dir: &Path) -> AppResult<Vec<Reading>> {
            let path = dir.join(READINGS);
            if !path.exists() {
                return Ok(Vec::new());
            }
            let bytes = fs::read(&path)?;
            let complete = bytes
                .iter()
                .rposition(|&b| b == b'\n')
                .map_or(0, |newline| newline + 1);

            let mut reader = csv::Reader::from_reader(&bytes[..complete]);
            let mut readings = Vec::new();
            for row in reader.deserialize::<Row>() {
                let row = row.map_err(|e| {
                    DaqError::Storage(format!("corrupt readings file {}: {e}", path.display()))
                })?;
                readings.push(row.into());
            }

            if complete < bytes.len() {
                warn!(
                    file = %path.display(),
                    dropped_bytes = bytes.len() - complete,
                    "truncating interrupted append"
                );
                Self::rewrite(dir, readings.clone())?;
            }
            Ok(readings)
        }

        fn encode(rows: impl IntoIterator<Item = Reading>, headers: bool) -> AppResult<Vec<u8>> {
            let mut writer = csv::WriterBuilder::new()
                .has_headers(headers)
                .from_writer(Vec::new());
            for reading in rows {
                writer.serialize(Row::from(reading))?;
            }
            writer
                .into_inner()
                .map_err(|e| DaqError::Storage(format!("failed to encode readings: {e}")))
        }

        fn rewrite(dir: &Path, readings: Vec<Reading>) -> AppResult<()> {
            let path = dir.join(READINGS);
            let temp = dir.join(format!("{READINGS}.tmp"));
            let bytes = Self::encode(readings, true)?;
            {
                let mut file = File::create(&temp)?;
                file.write_all(&bytes)?;
                file.sync_all()?;
            }
            fs::rename(&temp, &path)?;
            Ok(())
        }

        fn append(path: &Path, readings: Vec<Reading>) -> AppResult<()> {
            let needs_header = fs::metadata(path).map(|m| m.len() == 0).unwrap_or(true);
            let bytes = Self::encode(readings, needs_header)?;
            let mut file = OpenOptions::new().create(true).append(true).open(path)?;
            file.write_all(&bytes)?;
            file.sync_data()?;
            Ok(())
        }
    }

    /// Indexed readings of `program`, loading them on first use.
    fn indexed<'a>(
        index: &'a mut HashMap<ProgramId, Vec<Reading>>,
        program: &ProgramId,
        dir: &Path,
    ) -> AppResult<&'a mut Vec<Reading>> {
        match index.entry(program.clone()) {
            Entry::Occupied(entry) => Ok(entry.into_mut()),
            Entry::Vacant(entry) => Ok(entry.insert(CsvStore::load_readings(dir)?)),
        }
    }

    #[async_trait]
    impl RecordStore for CsvStore {
        async fn ensure_program(&self, manifest: &ProgramManifest) -> AppResult<()> {
            let _index = self.index.lock().await;
            let dir = self.program_dir(&manifest.id)?;
            if let Some(stored) = Self::load_manifest(&dir)? {
                return stored.ensure_compatible(manifest);
            }
            fs::create_dir_all(&dir)?;
            let json = serde_json::to_string_pretty(manifest)
                .map_err(|e| DaqError::Storage(format!("failed to encode manifest: {e}")))?;
            fs::write(dir.join(MANIFEST), json)?;
            info!(program = %manifest.id, dir = %dir.display(), "program data set created");
            Ok(())
        }

        async fn manifest(&self, program: &ProgramId) -> AppResult<Option<ProgramManifest>> {
            let _index = self.index.lock().await;
            Self::load_manifest(&self.program_dir(program)?)
        }

        async fn exists(&self, program: &ProgramId) -> AppResult<bool> {
            let _index = self.index.lock().await;
            Ok(self.program_dir(program)?.join(MANIFEST).exists())
        }

        async fn append_cycle(
            &self,
            program: &ProgramId,
            cycle: u32,
            readings: Vec<Reading>,
        ) -> AppResult<()> {
            let mut index = self.index.lock().await;
            let (dir, manifest) = self.require_manifest(program)?;
            let existing = indexed(&mut index, program, &dir)?;
            check_batch(&manifest, existing, cycle, &readings)?;

            let count = readings.len();
            if let Err(e) = Self::append(&dir.join(READINGS), readings.clone()) {
                // The file may now end in a torn row; reload it on next use.
                index.remove(program);
                return Err(e);
            }
            existing.extend(readings);
            debug!(program = %program, cycle, count, "batch appended");
            Ok(())
        }

        async fn last_completed_cycle(&self, program: &ProgramId) -> AppResult<u32> {
            let mut index = self.index.lock().await;
            let dir = self.program_dir(program)?;
            match Self::load_manifest(&dir)? {
                Some(manifest) => last_completed(&manifest, indexed(&mut index, program, &dir)?),
                None => Ok(0),
            }
        }

        async fn delete_partial_cycles(&self, program: &ProgramId) -> AppResult<Vec<u32>> {
            let mut index = self.index.lock().await;
            let dir = self.program_dir(program)?;
            let Some(manifest) = Self::load_manifest(&dir)? else {
                return Ok(Vec::new());
            };
            let readings = indexed(&mut index, program, &dir)?;
            let partial = partial_cycles(&manifest, readings);
            if !partial.is_empty() {
                let kept: Vec<Reading> = readings
                    .iter()
                    .filter(|r| !partial.contains(&r.cycle))
                    .cloned()
                    .collect();
                Self::rewrite(&dir, kept.clone())?;
                *readings = kept;
                info!(program = %program, cycles = ?partial, "partial cycles deleted");
            }
            Ok(partial)
        }

        async fn last_readings(
            &self,
            program: &ProgramId,
            channel: &ChannelId,
            n: usize,
        ) -> AppResult<Vec<Reading>> {
            let mut index = self.index.lock().await;
            let dir = self.program_dir(program)?;
            let readings = indexed(&mut index, program, &dir)?;
            Ok(newest_of_channel(readings, channel, n))
        }

        async fn readings(&self, program: &ProgramId) -> AppResult<Vec<Reading>> {
            let mut index = self.index.lock().await;
            let dir = self.program_dir(program)?;
            Ok(indexed(&mut index, program, &dir)?.clone())
        }
    }
}

#[cfg(not(feature = "storage_csv"))]
mod csv_disabled {
    use crate::error::{AppResult, DaqError};
    use std::path::PathBuf;

    /// Placeholder when the crate is built without `storage_csv`.
    pub struct CsvStore;

    impl CsvStore {
        /// Always fails: the crate was built without CSV support.
        pub fn open(_root: impl Into<PathBuf>) -> AppResult<Self> {
            Err(DaqError::FeatureNotEnabled("storage_csv".to_string()))
        }
    }
}

#[cfg(feature = "storage_csv")]
pub use csv_enabled::CsvStore;

#[cfg(not(feature = "storage_csv"))]
pub use csv_disabled::CsvStore;

#[cfg(all(test, feature = "storage_csv"))]
mod tests {
    use super::*;
    use crate::core::ChannelId;
    use crate::data::storage::tests::{batch, manifest, seed};
    use crate::data::storage::RecordStore;
    use crate::error::DaqError;

    #[tokio::test]
    async fn test_partial_cycles_survive_reopen_and_are_deleted() {
        let dir = tempfile::tempdir().unwrap();
        let manifest = {
            let store = CsvStore::open(dir.path()).unwrap();
            seed(&store).await
        };

        let store = CsvStore::open(dir.path()).unwrap();
        assert!(store.exists(&manifest.id).await.unwrap());
        assert_eq!(store.manifest(&manifest.id).await.unwrap(), Some(manifest.clone()));
        assert_eq!(store.last_completed_cycle(&manifest.id).await.unwrap(), 2);
        assert_eq!(store.delete_partial_cycles(&manifest.id).await.unwrap(), vec![3]);
        assert_eq!(store.readings(&manifest.id).await.unwrap().len(), 8);

        // Cycle 3 can be written again from scratch.
        store.append_cycle(&manifest.id, 3, batch(3, 0)).await.unwrap();
        store.append_cycle(&manifest.id, 3, batch(3, 1)).await.unwrap();
        assert_eq!(store.last_completed_cycle(&manifest.id).await.unwrap(), 3);
    }

    #[tokio::test]
    async fn test_round_trip_preserves_fields() {
        let dir = tempfile::tempdir().unwrap();
        let store = CsvStore::open(dir.path()).unwrap();
        let manifest = manifest(1);
        store.ensure_program(&manifest).await.unwrap();
        let mut written = batch(1, 0);
        written[1].drift_rate = None;
        store.append_cycle(&manifest.id, 1, written.clone()).await.unwrap();

        let read = store.readings(&manifest.id).await.unwrap();
        assert_eq!(read, written);
        let last = store
            .last_readings(&manifest.id, &ChannelId::new("FBG-1"), 5)
            .await
            .unwrap();
        assert_eq!(last.len(), 1);
    }

    #[tokio::test]
    async fn test_path_like_program_id_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let store = CsvStore::open(dir.path()).unwrap();
        let mut bad = manifest(1);
        bad.id = crate::core::ProgramId::new("../escape");
        assert!(matches!(
            store.ensure_program(&bad).await,
            Err(DaqError::Storage(_))
        ));
    }

    #[tokio::test]
    async fn test_interrupted_append_is_truncated_before_next_append() {
        let dir = tempfile::tempdir().unwrap();
        let manifest = manifest(1);
        {
            let store = CsvStore::open(dir.path()).unwrap();
            store.ensure_program(&manifest).await.unwrap();
            store.append_cycle(&manifest.id, 1, batch(1, 0)).await.unwrap();
        }
        // A crash halfway through the next batch.
        let file = dir.path().join(manifest.id.as_str()).join("readings.csv");
        {
            use std::io::Write;
            let mut torn = std::fs::OpenOptions::new().append(true).open(&file).unwrap();
            torn.write_all(b"2,0,FBG-1,2026-01-01T00:").unwrap();
        }

        let store = CsvStore::open(dir.path()).unwrap();
        assert_eq!(store.last_completed_cycle(&manifest.id).await.unwrap(), 1);
        store.append_cycle(&manifest.id, 2, batch(2, 0)).await.unwrap();
        store.append_cycle(&manifest.id, 3, batch(3, 0)).await.unwrap();
        assert_eq!(store.last_completed_cycle(&manifest.id).await.unwrap(), 3);

        // Everything written after the repair reads back from a fresh store.
        drop(store);
        let reopened = CsvStore::open(dir.path()).unwrap();
        assert_eq!(reopened.readings(&manifest.id).await.unwrap().len(), 6);
        assert_eq!(reopened.last_completed_cycle(&manifest.id).await.unwrap(), 3);
        assert!(std::fs::read(&file).unwrap().ends_with(b"\n"));
    }

    #[tokio::test]
    async fn test_corrupt_row_mid_file_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let store = CsvStore::open(dir.path()).unwrap();
        let manifest = manifest(1);
        store.ensure_program(&manifest).await.unwrap();
        let file = dir.path().join(manifest.id.as_str()).join("readings.csv");
        std::fs::write(&file, "cycle,point\nnot,a-row\n").unwrap();

        assert!(matches!(
            store.readings(&manifest.id).await,
            Err(DaqError::Storage(_))
        ));
    }

    #[tokio::test]
    async fn test_duplicates_rejected_from_index() {
        let dir = tempfile::tempdir().unwrap();
        let store = CsvStore::open(dir.path()).unwrap();
        let manifest = seed(&store).await;
        let file = dir.path().join(manifest.id.as_str()).join("readings.csv");

        // The accepted rows come from memory, not from the file.
        std::fs::remove_file(&file).unwrap();
        assert!(matches!(
            store.append_cycle(&manifest.id, 2, batch(2, 1)).await,
            Err(DaqError::Storage(_))
        ));
        assert_eq!(store.readings(&manifest.id).await.unwrap().len(), 10);
        store.append_cycle(&manifest.id, 3, batch(3, 1)).await.unwrap();
        assert_eq!(store.last_completed_cycle(&manifest.id).await.unwrap(), 3);
    }
}
