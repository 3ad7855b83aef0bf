//! State Reconciler - per-station desired-state documents
//!
//! The station index sits behind an `RwLock`; each station has its own
//! document lock and a separate I/O lock. Mutations of one station never
//! wait on another station, and no document lock is held across disk I/O.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Instant;

use helm_core::{Clock, StationName, SystemClock};
use parking_lot::{Mutex, RwLock};
use tracing::{debug, info, warn};

use crate::desired::ShapeError;
use crate::{
    codec, persist, reconcile, ActuatorCommand, DecodeLimits, DesiredActuatorState,
    DesiredPidState, DesiredState, Missing, PidMode, ReconcileError, ReconcileResult,
    ReconciliationResult, RecordError, Table, FORMAT_VERSION, MAX_ACTUATORS, MAX_PID_LOOPS,
    MAX_TABLE_ENTRIES,
};

/// Invoked once per conflicting actuator: (station, slot, desired, actual)
pub type ActuatorConflictCallback =
    Box<dyn Fn(&StationName, u16, &DesiredActuatorState, &DesiredActuatorState) + Send + Sync>;

/// Invoked once per conflicting control loop: (station, loop_id, desired, actual)
pub type PidConflictCallback =
    Box<dyn Fn(&StationName, u16, &DesiredPidState, &DesiredPidState) + Send + Sync>;

/// State Reconciler configuration
#[derive(Clone, Debug)]
pub struct ReconcilerConfig {
    /// Directory holding one record file per station
    pub persist_path: PathBuf,
    pub file_extension: String,
    /// Station table bound, `None` for unbounded
    pub max_stations: Option<usize>,
    /// Per-station actuator bound, clamped to [`MAX_TABLE_ENTRIES`]
    pub actuator_capacity: usize,
    /// Per-station PID loop bound, clamped to [`MAX_TABLE_ENTRIES`]
    pub pid_capacity: usize,
}

impl Default for ReconcilerConfig {
    fn default() -> Self {
        ReconcilerConfig {
            persist_path: PathBuf::from("desired_state"),
            file_extension: "dsf".to_string(),
            max_stations: Some(256),
            actuator_capacity: MAX_ACTUATORS,
            pid_capacity: MAX_PID_LOOPS,
        }
    }
}

impl ReconcilerConfig {
    pub fn with_persist_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.persist_path = path.into();
        self
    }

    fn actuator_limit(&self) -> usize {
        self.actuator_capacity.min(MAX_TABLE_ENTRIES)
    }

    fn pid_limit(&self) -> usize {
        self.pid_capacity.min(MAX_TABLE_ENTRIES)
    }

    fn limits(&self) -> DecodeLimits {
        DecodeLimits {
            actuator_capacity: self.actuator_limit(),
            pid_capacity: self.pid_limit(),
        }
    }
}

struct StationSlot {
    doc: Mutex<DesiredState>,
    /// Orders disk operations for this station
    io: Mutex<()>,
}

impl StationSlot {
    fn new(station: &StationName) -> Self {
        StationSlot {
            doc: Mutex::new(DesiredState::new(station.clone())),
            io: Mutex::new(()),
        }
    }
}

/// Versioned store of what each station should be doing
pub struct StateReconciler {
    config: ReconcilerConfig,
    clock: Arc<dyn Clock>,
    stations: RwLock<HashMap<StationName, Arc<StationSlot>>>,
    on_actuator_conflict: Option<ActuatorConflictCallback>,
    on_pid_conflict: Option<PidConflictCallback>,
}

impl StateReconciler {
    pub fn new(config: ReconcilerConfig) -> Self {
        Self::with_clock(config, Arc::new(SystemClock))
    }

    pub fn with_clock(config: ReconcilerConfig, clock: Arc<dyn Clock>) -> Self {
        StateReconciler {
            config,
            clock,
            stations: RwLock::new(HashMap::new()),
            on_actuator_conflict: None,
            on_pid_conflict: None,
        }
    }

    pub fn on_actuator_conflict<F>(mut self, callback: F) -> Self
    where
        F: Fn(&StationName, u16, &DesiredActuatorState, &DesiredActuatorState)
            + Send
            + Sync
            + 'static,
    {
        self.on_actuator_conflict = Some(Box::new(callback));
        self
    }

    pub fn on_pid_conflict<F>(mut self, callback: F) -> Self
    where
        F: Fn(&StationName, u16, &DesiredPidState, &DesiredPidState) + Send + Sync + 'static,
    {
        self.on_pid_conflict = Some(Box::new(callback));
        self
    }

    pub fn config(&self) -> &ReconcilerConfig {
        &self.config
    }

    /// Record the desired output of an actuator slot, returns the new sequence
    pub fn set_actuator(
        &self,
        station: &StationName,
        slot: u16,
        command: ActuatorCommand,
        pwm_duty: u8,
        epoch: u32,
    ) -> ReconcileResult<u64> {
        self.write_actuator(station, slot, command, pwm_duty, epoch, false)
    }

    /// As [`set_actuator`](Self::set_actuator), marking the value as an operator override
    pub fn force_actuator(
        &self,
        station: &StationName,
        slot: u16,
        command: ActuatorCommand,
        pwm_duty: u8,
        epoch: u32,
    ) -> ReconcileResult<u64> {
        self.write_actuator(station, slot, command, pwm_duty, epoch, true)
    }

    fn write_actuator(
        &self,
        station: &StationName,
        slot: u16,
        command: ActuatorCommand,
        pwm_duty: u8,
        epoch: u32,
        forced: bool,
    ) -> ReconcileResult<u64> {
        let capacity = self.config.actuator_limit();
        let sequence = self.mutate(station, |doc, now| {
            let entry = DesiredActuatorState {
                slot,
                command,
                pwm_duty,
                forced,
                set_time: now,
                set_epoch: epoch,
            };
            if !doc.upsert_actuator(entry, capacity) {
                return Err(ReconcileError::Full {
                    table: Table::Actuators,
                    capacity,
                });
            }
            Ok(())
        })?;

        debug!(station = %station, slot, %command, pwm_duty, epoch, forced, sequence, "desired actuator set");
        Ok(sequence)
    }

    /// Record the desired mode and setpoint of a control loop
    pub fn set_pid_loop(
        &self,
        station: &StationName,
        loop_id: u16,
        mode: PidMode,
        setpoint: f32,
    ) -> ReconcileResult<u64> {
        let sequence = self.write_pid(station, loop_id, |p, now| {
            p.mode = mode;
            p.setpoint = setpoint;
            p.set_time = now;
        })?;

        debug!(station = %station, loop_id, %mode, setpoint, sequence, "desired loop set");
        Ok(sequence)
    }

    /// Record the output a loop should hold while in MANUAL
    pub fn set_pid_manual_output(
        &self,
        station: &StationName,
        loop_id: u16,
        output: f32,
    ) -> ReconcileResult<u64> {
        let sequence = self.write_pid(station, loop_id, |p, now| {
            p.manual_output = output;
            p.set_time = now;
        })?;

        debug!(station = %station, loop_id, output, sequence, "desired manual output set");
        Ok(sequence)
    }

    fn write_pid<F>(&self, station: &StationName, loop_id: u16, update: F) -> ReconcileResult<u64>
    where
        F: FnOnce(&mut DesiredPidState, u64),
    {
        let capacity = self.config.pid_limit();
        self.mutate(station, |doc, now| {
            if !doc.update_pid_loop(loop_id, capacity, |p| update(p, now)) {
                return Err(ReconcileError::Full {
                    table: Table::PidLoops,
                    capacity,
                });
            }
            Ok(())
        })
    }

    /// Copy of a station's document
    pub fn get_desired(&self, station: &StationName) -> ReconcileResult<DesiredState> {
        let slot = self.slot(station)?;
        let doc = slot.doc.lock().clone();
        Ok(doc)
    }

    pub fn get_sequence(&self, station: &StationName) -> ReconcileResult<u64> {
        let slot = self.slot(station)?;
        let sequence = slot.doc.lock().sequence;
        Ok(sequence)
    }

    /// Persist a station's document, returns the file written
    ///
    /// `dirty` is cleared only if no mutation landed while the file was
    /// being written.
    pub fn snapshot(&self, station: &StationName) -> ReconcileResult<PathBuf> {
        let slot = self.slot(station)?;
        let _io = slot.io.lock();

        let (bytes, sequence) = {
            let mut doc = slot.doc.lock();
            doc.seal();
            (codec::encode(&doc), doc.sequence)
        };

        let path = self.file_path(station);
        if let Err(err) = persist::write_record(&path, &bytes) {
            warn!(station = %station, error = %err, "snapshot failed");
            return Err(err);
        }

        let mut doc = slot.doc.lock();
        if doc.sequence == sequence {
            doc.dirty = false;
        }
        info!(station = %station, sequence, bytes = bytes.len(), "desired state saved");
        Ok(path)
    }

    /// Snapshot every station with unsaved changes
    pub fn snapshot_dirty(&self) -> Vec<(StationName, ReconcileResult<PathBuf>)> {
        self.dirty_stations()
            .into_iter()
            .map(|station| {
                let result = self.snapshot(&station);
                (station, result)
            })
            .collect()
    }

    /// Replace a station's document with its persisted record
    ///
    /// Foreign versions, bad checksums and records for another station are
    /// refused and leave memory untouched. Restoring over a live document
    /// whose sequence has reached the record's adopts the record's contents
    /// under the next live sequence, so sequence never goes backwards.
    pub fn restore(&self, station: &StationName) -> ReconcileResult<DesiredState> {
        let path = self.file_path(station);

        if let Some(slot) = self.lookup(station) {
            let _io = slot.io.lock();
            let mut restored = self.load(station, path)?;
            let mut doc = slot.doc.lock();
            if restored.sequence <= doc.sequence {
                debug!(station = %station, stored = restored.sequence, live = doc.sequence, "record behind live document, resequencing");
                restored.sequence = doc.sequence;
                restored.touch(self.clock.now_ms());
            }
            *doc = restored.clone();
            info!(station = %station, sequence = restored.sequence, "desired state restored");
            return Ok(restored);
        }

        let restored = self.load(station, path)?;
        let slot = self.slot_or_create(station)?;
        *slot.doc.lock() = restored.clone();
        info!(station = %station, sequence = restored.sequence, "desired state restored");
        Ok(restored)
    }

    fn load(&self, station: &StationName, path: PathBuf) -> ReconcileResult<DesiredState> {
        let bytes = persist::read_record(&path)?;

        let reject = |reason: RecordError| {
            warn!(station = %station, path = %path.display(), %reason, "persisted record rejected");
            ReconcileError::Protocol {
                path: path.clone(),
                reason,
            }
        };

        let state = codec::decode(&bytes, &self.config.limits()).map_err(reject)?;
        if state.station_name != *station {
            return Err(reject(RecordError::StationMismatch {
                expected: station.clone(),
                found: state.station_name,
            }));
        }
        Ok(state)
    }

    /// Compare the desired document with what the device reports
    ///
    /// Callbacks run after the station's lock is released.
    pub fn reconcile(
        &self,
        station: &StationName,
        actual: Option<&DesiredState>,
    ) -> ReconcileResult<ReconciliationResult> {
        let started = Instant::now();
        let desired = self.get_desired(station)?;

        let mut result = reconcile::compare(
            &desired,
            actual,
            |want, have| {
                warn!(station = %station, slot = want.slot, desired = %want.command, actual = %have.command,
                    desired_duty = want.pwm_duty, actual_duty = have.pwm_duty, "actuator diverged");
                if let Some(callback) = &self.on_actuator_conflict {
                    callback(station, want.slot, want, have);
                }
            },
            |want, have| {
                warn!(station = %station, loop_id = want.loop_id, desired = %want.mode, actual = %have.mode,
                    desired_setpoint = want.setpoint, actual_setpoint = have.setpoint, "control loop diverged");
                if let Some(callback) = &self.on_pid_conflict {
                    callback(station, want.loop_id, want, have);
                }
            },
        );
        result.elapsed = started.elapsed();

        info!(
            station = %station,
            synced = result.actuators_synced + result.pid_synced,
            conflicts = result.conflicts(),
            reported = actual.is_some(),
            "reconciled"
        );
        Ok(result)
    }

    /// Bump sequence without changing values so consumers push everything again
    pub fn force_sync(&self, station: &StationName) -> ReconcileResult<u64> {
        let slot = self.slot(station)?;
        let now = self.clock.now_ms();
        let mut doc = slot.doc.lock();
        doc.touch(now);
        info!(station = %station, sequence = doc.sequence, "forced resync");
        Ok(doc.sequence)
    }

    /// Adopt the device-reported state as the desired state
    pub fn accept_rtu_state(
        &self,
        station: &StationName,
        rtu_state: DesiredState,
    ) -> ReconcileResult<u64> {
        rtu_state
            .check_shape(self.config.actuator_limit(), self.config.pid_limit())
            .map_err(|err| match err {
                ShapeError::Capacity { table, capacity, .. } => {
                    ReconcileError::Full { table, capacity }
                }
                ShapeError::Duplicate(dup) => ReconcileError::InvalidParameter(dup),
            })?;

        let sequence = self.mutate(station, |doc, _| {
            doc.version = FORMAT_VERSION;
            doc.valid = true;
            doc.actuators = rtu_state.actuators;
            doc.pid_loops = rtu_state.pid_loops;
            Ok(())
        })?;

        info!(station = %station, sequence, "device state adopted as desired");
        Ok(sequence)
    }

    /// Whether `state` is older than `threshold_ms` on this reconciler's clock
    pub fn is_stale(&self, state: &DesiredState, threshold_ms: u64) -> bool {
        state.is_stale_at(self.clock.now_ms(), threshold_ms)
    }

    /// Stations with unsaved changes, sorted
    pub fn dirty_stations(&self) -> Vec<StationName> {
        let mut names: Vec<_> = self
            .stations
            .read()
            .iter()
            .filter(|(_, slot)| slot.doc.lock().dirty)
            .map(|(name, _)| name.clone())
            .collect();
        names.sort();
        names
    }

    /// Tracked stations, sorted
    pub fn stations(&self) -> Vec<StationName> {
        let mut names: Vec<_> = self.stations.read().keys().cloned().collect();
        names.sort();
        names
    }

    pub fn len(&self) -> usize {
        self.stations.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.stations.read().is_empty()
    }

    /// Record file for a station
    pub fn file_path(&self, station: &StationName) -> PathBuf {
        persist::record_path(&self.config.persist_path, station, &self.config.file_extension)
    }

    /// Apply a change under the station's lock, then bump and reseal
    ///
    /// `change` must leave the document untouched when it fails.
    fn mutate<F>(&self, station: &StationName, change: F) -> ReconcileResult<u64>
    where
        F: FnOnce(&mut DesiredState, u64) -> ReconcileResult<()>,
    {
        let slot = self.slot_or_create(station)?;
        let now = self.clock.now_ms();
        let mut doc = slot.doc.lock();
        if let Err(err) = change(&mut doc, now) {
            warn!(station = %station, error = %err, "desired state change refused");
            return Err(err);
        }
        doc.touch(now);
        Ok(doc.sequence)
    }

    fn lookup(&self, station: &StationName) -> Option<Arc<StationSlot>> {
        self.stations.read().get(station).cloned()
    }

    fn slot(&self, station: &StationName) -> ReconcileResult<Arc<StationSlot>> {
        self.lookup(station)
            .ok_or_else(|| Missing::Station(station.clone()).into())
    }

    fn slot_or_create(&self, station: &StationName) -> ReconcileResult<Arc<StationSlot>> {
        if let Some(slot) = self.lookup(station) {
            return Ok(slot);
        }

        let mut stations = self.stations.write();
        if let Some(slot) = stations.get(station) {
            return Ok(slot.clone());
        }
        if let Some(capacity) = self.config.max_stations {
            if stations.len() >= capacity {
                warn!(station = %station, capacity, "desired-state table full");
                return Err(ReconcileError::Full {
                    table: Table::Stations,
                    capacity,
                });
            }
        }

        let slot = Arc::new(StationSlot::new(station));
        stations.insert(station.clone(), slot.clone());
        debug!(station = %station, "desired-state document created");
        Ok(slot)
    }
}
