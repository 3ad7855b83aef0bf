//! Desired-state document - what the controller wants a station to be doing

use std::fmt;

use helm_core::{elapsed_ms, Millis, StationName};

use crate::{codec, InvalidInput, Table};

/// On-disk format version carried by every document
pub const FORMAT_VERSION: u16 = 1;

/// Default per-station actuator capacity
pub const MAX_ACTUATORS: usize = 64;

/// Default per-station PID loop capacity
pub const MAX_PID_LOOPS: usize = 64;

/// Largest table a record can carry (u16 entry count)
pub const MAX_TABLE_ENTRIES: usize = u16::MAX as usize;

/// Actuator drive command
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
#[repr(u8)]
pub enum ActuatorCommand {
    #[default]
    Off = 0,
    On = 1,
    Pwm = 2,
}

impl ActuatorCommand {
    pub fn from_byte(b: u8) -> Option<Self> {
        match b {
            0 => Some(ActuatorCommand::Off),
            1 => Some(ActuatorCommand::On),
            2 => Some(ActuatorCommand::Pwm),
            _ => None,
        }
    }

    #[inline]
    pub fn to_byte(self) -> u8 {
        self as u8
    }
}

impl fmt::Display for ActuatorCommand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            ActuatorCommand::Off => "OFF",
            ActuatorCommand::On => "ON",
            ActuatorCommand::Pwm => "PWM",
        })
    }
}

/// Control loop operating mode
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
#[repr(u8)]
pub enum PidMode {
    #[default]
    Off = 0,
    Manual = 1,
    Auto = 2,
    Cascade = 3,
}

impl PidMode {
    pub fn from_byte(b: u8) -> Option<Self> {
        match b {
            0 => Some(PidMode::Off),
            1 => Some(PidMode::Manual),
            2 => Some(PidMode::Auto),
            3 => Some(PidMode::Cascade),
            _ => None,
        }
    }

    #[inline]
    pub fn to_byte(self) -> u8 {
        self as u8
    }
}

impl fmt::Display for PidMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            PidMode::Off => "OFF",
            PidMode::Manual => "MANUAL",
            PidMode::Auto => "AUTO",
            PidMode::Cascade => "CASCADE",
        })
    }
}

/// Intended output of one actuator slot
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DesiredActuatorState {
    pub slot: u16,
    pub command: ActuatorCommand,
    pub pwm_duty: u8,
    /// Operator override
    pub forced: bool,
    pub set_time: Millis,
    /// Authority epoch active when the value was set (audit only)
    pub set_epoch: u32,
}

impl DesiredActuatorState {
    pub fn new(slot: u16, command: ActuatorCommand, pwm_duty: u8) -> Self {
        DesiredActuatorState {
            slot,
            command,
            pwm_duty,
            forced: false,
            set_time: 0,
            set_epoch: 0,
        }
    }

    /// Whether a reported output differs from this one
    #[inline]
    pub fn diverges_from(&self, actual: &DesiredActuatorState) -> bool {
        self.command != actual.command || self.pwm_duty != actual.pwm_duty
    }
}

/// Intended configuration of one control loop
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct DesiredPidState {
    pub loop_id: u16,
    pub mode: PidMode,
    pub setpoint: f32,
    pub manual_output: f32,
    pub set_time: Millis,
}

/// Setpoints closer than this are treated as equal when reconciling
pub const SETPOINT_TOLERANCE: f32 = 1e-3;

impl DesiredPidState {
    pub fn new(loop_id: u16, mode: PidMode, setpoint: f32) -> Self {
        DesiredPidState {
            loop_id,
            mode,
            setpoint,
            manual_output: 0.0,
            set_time: 0,
        }
    }

    /// Whether a reported loop differs in mode or setpoint
    #[inline]
    pub fn diverges_from(&self, actual: &DesiredPidState) -> bool {
        // NaN on either side counts as divergence
        let close = (self.setpoint - actual.setpoint).abs() <= SETPOINT_TOLERANCE;
        self.mode != actual.mode || !close
    }
}

/// Versioned desired-state document for one station
#[derive(Debug, Clone, PartialEq)]
pub struct DesiredState {
    pub version: u16,
    /// Incremented by exactly one on every mutation
    pub sequence: u64,
    /// CRC-32 of the encoded record with this field zeroed
    pub checksum: u32,
    pub timestamp: Millis,
    pub station_name: StationName,
    pub valid: bool,
    /// Unsaved changes (not persisted)
    pub dirty: bool,
    pub actuators: Vec<DesiredActuatorState>,
    pub pid_loops: Vec<DesiredPidState>,
}

impl DesiredState {
    /// Empty document for a station
    pub fn new(station_name: StationName) -> Self {
        let mut state = DesiredState {
            version: FORMAT_VERSION,
            sequence: 0,
            checksum: 0,
            timestamp: 0,
            station_name,
            valid: true,
            dirty: false,
            actuators: Vec::new(),
            pid_loops: Vec::new(),
        };
        state.seal();
        state
    }

    pub fn actuator(&self, slot: u16) -> Option<&DesiredActuatorState> {
        self.actuators.iter().find(|a| a.slot == slot)
    }

    pub fn pid_loop(&self, loop_id: u16) -> Option<&DesiredPidState> {
        self.pid_loops.iter().find(|p| p.loop_id == loop_id)
    }

    /// Insert or replace by slot. Returns false if a new entry would exceed `capacity`.
    pub fn upsert_actuator(&mut self, entry: DesiredActuatorState, capacity: usize) -> bool {
        if let Some(existing) = self.actuators.iter_mut().find(|a| a.slot == entry.slot) {
            *existing = entry;
            return true;
        }
        if self.actuators.len() >= capacity {
            return false;
        }
        self.actuators.push(entry);
        true
    }

    /// Insert or update a loop in place. Returns false if a new entry would exceed `capacity`.
    pub fn update_pid_loop<F>(&mut self, loop_id: u16, capacity: usize, update: F) -> bool
    where
        F: FnOnce(&mut DesiredPidState),
    {
        if let Some(existing) = self.pid_loops.iter_mut().find(|p| p.loop_id == loop_id) {
            update(existing);
            return true;
        }
        if self.pid_loops.len() >= capacity {
            return false;
        }
        let mut entry = DesiredPidState::new(loop_id, PidMode::Off, 0.0);
        update(&mut entry);
        self.pid_loops.push(entry);
        true
    }

    /// Record a mutation: bump sequence, stamp time, mark dirty, reseal
    pub fn touch(&mut self, now: Millis) {
        self.sequence = self.sequence.saturating_add(1);
        self.timestamp = now;
        self.dirty = true;
        self.seal();
    }

    /// Recompute and store the checksum
    pub fn seal(&mut self) {
        self.checksum = codec::compute_checksum(self);
    }

    /// Whether the stored checksum matches the contents
    pub fn verify(&self) -> bool {
        self.checksum == codec::compute_checksum(self)
    }

    /// Whether the document is older than `threshold_ms` at `now`
    #[inline]
    pub fn is_stale_at(&self, now: Millis, threshold_ms: u64) -> bool {
        elapsed_ms(now, self.timestamp) > threshold_ms
    }

    /// Reject documents with repeated keys or more entries than allowed
    pub(crate) fn check_shape(
        &self,
        actuator_capacity: usize,
        pid_capacity: usize,
    ) -> Result<(), ShapeError> {
        if self.actuators.len() > actuator_capacity {
            return Err(ShapeError::Capacity {
                table: Table::Actuators,
                count: self.actuators.len(),
                capacity: actuator_capacity,
            });
        }
        if self.pid_loops.len() > pid_capacity {
            return Err(ShapeError::Capacity {
                table: Table::PidLoops,
                count: self.pid_loops.len(),
                capacity: pid_capacity,
            });
        }
        for (i, a) in self.actuators.iter().enumerate() {
            if self.actuators[..i].iter().any(|b| b.slot == a.slot) {
                return Err(ShapeError::Duplicate(InvalidInput::DuplicateSlot(a.slot)));
            }
        }
        for (i, p) in self.pid_loops.iter().enumerate() {
            if self.pid_loops[..i].iter().any(|q| q.loop_id == p.loop_id) {
                return Err(ShapeError::Duplicate(InvalidInput::DuplicateLoop(p.loop_id)));
            }
        }
        Ok(())
    }
}

/// Structural problem in a whole document
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum ShapeError {
    Capacity {
        table: Table,
        count: usize,
        capacity: usize,
    },
    Duplicate(InvalidInput),
}
