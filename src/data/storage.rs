//! Persistence contract for program readings.
//!
//! A program's data set is described by a [`ProgramManifest`]. Readings are
//! appended one accepted batch at a time; a batch is the full channel set for
//! one recorded point and is stored atomically. A cycle is *complete* when
//! every point `0..points_per_cycle` has an accepted reading for every
//! manifest channel. Anything less is a *partial* cycle, which must be deleted
//! before a program resumes.

use crate::core::{ChannelId, ProgramId, ProgramKind, Reading};
use crate::error::{AppResult, DaqError};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};
use std::sync::Arc;
use tokio::sync::RwLock;

/// Shape of a program's data set, fixed when the program is first created.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ProgramManifest {
    /// Program the data set belongs to.
    pub id: ProgramId,
    /// Calibration or baking data.
    pub kind: ProgramKind,
    /// Serial numbers of the recorded sensors.
    pub channels: Vec<ChannelId>,
    /// Accepted batches that complete one cycle.
    pub points_per_cycle: u32,
}

impl ProgramManifest {
    /// Checks that `other` describes the same data set.
    pub fn ensure_compatible(&self, other: &ProgramManifest) -> AppResult<()> {
        if self.kind != other.kind {
            return Err(DaqError::Resume(format!(
                "program {} holds {} data and cannot be continued as a {} program",
                self.id, self.kind, other.kind
            )));
        }
        let stored: BTreeSet<_> = self.channels.iter().collect();
        let wanted: BTreeSet<_> = other.channels.iter().collect();
        if stored != wanted {
            return Err(DaqError::Resume(format!(
                "sensor serial numbers of program {} have changed, use a new program id",
                self.id
            )));
        }
        if self.points_per_cycle != other.points_per_cycle {
            return Err(DaqError::Resume(format!(
                "program {} records {} points per cycle, the configuration asks for {}",
                self.id, self.points_per_cycle, other.points_per_cycle
            )));
        }
        Ok(())
    }
}

/// Store for program readings. Shared between the runner (appends) and
/// readers such as live plots and status queries.
#[async_trait]
pub trait RecordStore: Send + Sync {
    /// Registers a new program or checks an existing one against `manifest`.
    /// A mismatch is a [`DaqError::Resume`].
    async fn ensure_program(&self, manifest: &ProgramManifest) -> AppResult<()>;

    /// Manifest of `program`, if it was ever created.
    async fn manifest(&self, program: &ProgramId) -> AppResult<Option<ProgramManifest>>;

    /// Whether `program` has a data set.
    async fn exists(&self, program: &ProgramId) -> AppResult<bool>;

    /// Appends one batch. Either all readings are persisted or none.
    async fn append_cycle(
        &self,
        program: &ProgramId,
        cycle: u32,
        readings: Vec<Reading>,
    ) -> AppResult<()>;

    /// Highest cycle `k` such that cycles `1..=k` are complete; 0 if none.
    async fn last_completed_cycle(&self, program: &ProgramId) -> AppResult<u32>;

    /// Removes every partial cycle and returns their numbers.
    async fn delete_partial_cycles(&self, program: &ProgramId) -> AppResult<Vec<u32>>;

    /// Newest `n` readings of one channel, oldest first.
    async fn last_readings(
        &self,
        program: &ProgramId,
        channel: &ChannelId,
        n: usize,
    ) -> AppResult<Vec<Reading>>;

    /// Every reading of a program in append order.
    async fn readings(&self, program: &ProgramId) -> AppResult<Vec<Reading>>;
}

/// Hook for the external spreadsheet and graph builder.
#[async_trait]
pub trait ExportSink: Send + Sync {
    /// Called once after the last cycle of `program` is persisted.
    async fn program_completed(&self, program: &ProgramId, kind: ProgramKind) -> AppResult<()>;
}

// ============================================================================
// Cycle bookkeeping shared by the store implementations
// ============================================================================

/// Completeness of every cycle that has at least one reading.
pub(crate) fn cycle_completeness(
    manifest: &ProgramManifest,
    readings: &[Reading],
) -> BTreeMap<u32, bool> {
    let mut seen: BTreeMap<u32, HashSet<(u32, &ChannelId)>> = BTreeMap::new();
    for reading in readings {
        let points = seen.entry(reading.cycle).or_default();
        if reading.kind.is_accepted() {
            points.insert((reading.point, &reading.channel));
        }
    }
    seen.into_iter()
        .map(|(cycle, points)| {
            let complete = (0..manifest.points_per_cycle).all(|point| {
                manifest
                    .channels
                    .iter()
                    .all(|channel| points.contains(&(point, channel)))
            });
            (cycle, complete)
        })
        .collect()
}

pub(crate) fn partial_cycles(manifest: &ProgramManifest, readings: &[Reading]) -> Vec<u32> {
    cycle_completeness(manifest, readings)
        .into_iter()
        .filter_map(|(cycle, complete)| (!complete).then_some(cycle))
        .collect()
}

/// Complete cycles must form `1..=k`; a gap means the data set was edited or
/// written by something else.
pub(crate) fn last_completed(manifest: &ProgramManifest, readings: &[Reading]) -> AppResult<u32> {
    let complete: Vec<u32> = cycle_completeness(manifest, readings)
        .into_iter()
        .filter_map(|(cycle, complete)| complete.then_some(cycle))
        .collect();
    for (expected, cycle) in (1..).zip(&complete) {
        if *cycle != expected {
            return Err(DaqError::Resume(format!(
                "program {}: cycle {expected} is missing but cycle {cycle} is complete",
                manifest.id
            )));
        }
    }
    Ok(complete.len() as u32)
}

/// Rejects malformed batches and batches that would duplicate accepted points.
pub(crate) fn check_batch(
    manifest: &ProgramManifest,
    existing: &[Reading],
    cycle: u32,
    batch: &[Reading],
) -> AppResult<()> {
    if batch.is_empty() {
        return Err(DaqError::Storage("refusing to append an empty batch".into()));
    }
    if cycle == 0 {
        return Err(DaqError::Storage("cycles are numbered from 1".into()));
    }
    if let Some(reading) = batch.iter().find(|r| r.cycle != cycle) {
        return Err(DaqError::Storage(format!(
            "reading for cycle {} appended to cycle {cycle}",
            reading.cycle
        )));
    }
    if let Some(reading) = batch.iter().find(|r| !manifest.channels.contains(&r.channel)) {
        return Err(DaqError::Storage(format!(
            "channel {} is not part of program {}",
            reading.channel, manifest.id
        )));
    }
    let taken: HashSet<(u32, &ChannelId)> = existing
        .iter()
        .filter(|r| r.cycle == cycle && r.kind.is_accepted())
        .map(|r| (r.point, &r.channel))
        .collect();
    if let Some(reading) = batch
        .iter()
        .find(|r| r.kind.is_accepted() && taken.contains(&(r.point, &r.channel)))
    {
        return Err(DaqError::Storage(format!(
            "cycle {cycle} point {} of {} is already recorded",
            reading.point, reading.channel
        )));
    }
    Ok(())
}

pub(crate) fn newest_of_channel(readings: &[Reading], channel: &ChannelId, n: usize) -> Vec<Reading> {
    let mut newest: Vec<Reading> = readings
        .iter()
        .rev()
        .filter(|r| &r.channel == channel)
        .take(n)
        .cloned()
        .collect();
    newest.reverse();
    newest
}

// ============================================================================
// In-memory store
// ============================================================================

struct ProgramData {
    manifest: ProgramManifest,
    readings: Vec<Reading>,
}

/// Volatile store, used by tests and `--simulate` runs.
#[derive(Clone, Default)]
pub struct MemoryStore {
    programs: Arc<RwLock<HashMap<ProgramId, ProgramData>>>,
}

impl MemoryStore {
    /// Empty store.
    pub fn new() -> Self {
        Self::default()
    }
}

fn unknown(program: &ProgramId) -> DaqError {
    DaqError::Storage(format!("unknown program {program}"))
}

#[async_trait]
impl RecordStore for MemoryStore {
    async fn ensure_program(&self, manifest: &ProgramManifest) -> AppResult<()> {
        let mut programs = self.programs.write().await;
        match programs.get(&manifest.id) {
            Some(data) => data.manifest.ensure_compatible(manifest),
            None => {
                programs.insert(
                    manifest.id.clone(),
                    ProgramData {
                        manifest: manifest.clone(),
                        readings: Vec::new(),
                    },
                );
                Ok(())
            }
        }
    }

    async fn manifest(&self, program: &ProgramId) -> AppResult<Option<ProgramManifest>> {
        Ok(self
            .programs
            .read()
            .await
            .get(program)
            .map(|data| data.manifest.clone()))
    }

    async fn exists(&self, program: &ProgramId) -> AppResult<bool> {
        Ok(self.programs.read().await.contains_key(program))
    }

    async fn append_cycle(
        &self,
        program: &ProgramId,
        cycle: u32,
        readings: Vec<Reading>,
    ) -> AppResult<()> {
        let mut programs = self.programs.write().await;
        let data = programs.get_mut(program).ok_or_else(|| unknown(program))?;
        check_batch(&data.manifest, &data.readings, cycle, &readings)?;
        data.readings.extend(readings);
        Ok(())
    }

    async fn last_completed_cycle(&self, program: &ProgramId) -> AppResult<u32> {
        let programs = self.programs.read().await;
        match programs.get(program) {
            Some(data) => last_completed(&data.manifest, &data.readings),
            None => Ok(0),
        }
    }

    async fn delete_partial_cycles(&self, program: &ProgramId) -> AppResult<Vec<u32>> {
        let mut programs = self.programs.write().await;
        let Some(data) = programs.get_mut(program) else {
            return Ok(Vec::new());
        };
        let partial = partial_cycles(&data.manifest, &data.readings);
        data.readings.retain(|r| !partial.contains(&r.cycle));
        Ok(partial)
    }

    async fn last_readings(
        &self,
        program: &ProgramId,
        channel: &ChannelId,
        n: usize,
    ) -> AppResult<Vec<Reading>> {
        let programs = self.programs.read().await;
        Ok(programs
            .get(program)
            .map(|data| newest_of_channel(&data.readings, channel, n))
            .unwrap_or_default())
    }

    async fn readings(&self, program: &ProgramId) -> AppResult<Vec<Reading>> {
        let programs = self.programs.read().await;
        Ok(programs
            .get(program)
            .map(|data| data.readings.clone())
            .unwrap_or_default())
    }
}
