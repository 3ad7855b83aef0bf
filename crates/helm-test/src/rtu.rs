//! Simulated field device
//!
//! The device is the final authority on its own outputs. It hands control to
//! the controller under a fresh epoch and only applies writes stamped with
//! the epoch of the grant it currently honours.

use std::collections::{BTreeMap, BTreeSet};

use helm_core::{Millis, StationName};
use helm_state::{
    ActuatorCommand, DesiredActuatorState, DesiredPidState, DesiredState, PidMode, MAX_ACTUATORS,
    MAX_PID_LOOPS,
};
use tracing::debug;

/// Controller to device
#[derive(Clone, Debug, PartialEq)]
pub enum ToRtu {
    /// Ask for control; carries the controller's current epoch
    RequestAuthority { epoch: u32 },
    ReleaseAuthority,
    WriteActuator {
        slot: u16,
        command: ActuatorCommand,
        pwm_duty: u8,
        epoch: u32,
    },
    WriteLoop {
        loop_id: u16,
        mode: PidMode,
        setpoint: f32,
        epoch: u32,
    },
    /// Ask the device to report its outputs
    ReadBack,
}

/// Device to controller
#[derive(Clone, Debug, PartialEq)]
pub enum FromRtu {
    Granted { epoch: u32 },
    Released { epoch: u32 },
    /// Periodic heartbeat, also sent in answer to a refused write
    Status { epoch: u32, controller_holds: bool },
    Report(DesiredState),
}

/// Device-side counters
#[derive(Clone, Debug, Default)]
pub struct RtuStats {
    pub grants: u64,
    pub releases: u64,
    pub writes_applied: u64,
    pub writes_refused: u64,
}

pub struct SimulatedRtu {
    station: StationName,
    epoch: u32,
    controller_holds: bool,
    /// Every epoch this device has granted
    granted: BTreeSet<u32>,
    outputs: BTreeMap<u16, (ActuatorCommand, u8)>,
    loops: BTreeMap<u16, (PidMode, f32)>,
    heartbeat_ms: Millis,
    last_heartbeat: Millis,
    stats: RtuStats,
}

impl SimulatedRtu {
    pub fn new(station: StationName, heartbeat_ms: Millis) -> Self {
        SimulatedRtu {
            station,
            epoch: 1,
            controller_holds: false,
            granted: BTreeSet::new(),
            outputs: BTreeMap::new(),
            loops: BTreeMap::new(),
            heartbeat_ms,
            last_heartbeat: 0,
            stats: RtuStats::default(),
        }
    }

    /// Handle one message from the controller
    pub fn handle(&mut self, message: ToRtu) -> Option<FromRtu> {
        match message {
            ToRtu::RequestAuthority { epoch } => {
                // Duplicates and retries of an honoured request get the same grant
                if !self.controller_holds || self.epoch < epoch {
                    self.epoch = self.epoch.saturating_add(1).max(epoch);
                    self.controller_holds = true;
                    self.granted.insert(self.epoch);
                    self.stats.grants += 1;
                    debug!(station = %self.station, epoch = self.epoch, "device granted control");
                }
                Some(FromRtu::Granted { epoch: self.epoch })
            }
            ToRtu::ReleaseAuthority => {
                if self.controller_holds {
                    self.controller_holds = false;
                    self.stats.releases += 1;
                    debug!(station = %self.station, epoch = self.epoch, "device took back control");
                }
                Some(FromRtu::Released { epoch: self.epoch })
            }
            ToRtu::WriteActuator {
                slot,
                command,
                pwm_duty,
                epoch,
            } => {
                if !self.admits(epoch) {
                    return self.refuse();
                }
                self.outputs.insert(slot, (command, pwm_duty));
                self.stats.writes_applied += 1;
                None
            }
            ToRtu::WriteLoop {
                loop_id,
                mode,
                setpoint,
                epoch,
            } => {
                if !self.admits(epoch) {
                    return self.refuse();
                }
                self.loops.insert(loop_id, (mode, setpoint));
                self.stats.writes_applied += 1;
                None
            }
            ToRtu::ReadBack => Some(FromRtu::Report(self.report())),
        }
    }

    /// Heartbeat if one is due
    pub fn tick(&mut self, now: Millis) -> Option<FromRtu> {
        if now.saturating_sub(self.last_heartbeat) < self.heartbeat_ms {
            return None;
        }
        self.last_heartbeat = now;
        Some(self.status())
    }

    pub fn status(&self) -> FromRtu {
        FromRtu::Status {
            epoch: self.epoch,
            controller_holds: self.controller_holds,
        }
    }

    /// Operator switches the panel to local control
    pub fn take_local_control(&mut self) -> FromRtu {
        self.revoke();
        FromRtu::Released { epoch: self.epoch }
    }

    /// Link watchdog fired: the device governs itself under a new epoch
    pub fn link_lost(&mut self) {
        self.revoke();
    }

    /// Local panel change, refused while the controller holds the device
    pub fn set_local_output(&mut self, slot: u16, command: ActuatorCommand, pwm_duty: u8) -> bool {
        if self.controller_holds {
            return false;
        }
        self.outputs.insert(slot, (command, pwm_duty));
        true
    }

    /// Current outputs as a desired-state document
    pub fn report(&self) -> DesiredState {
        let mut state = DesiredState::new(self.station.clone());
        for (&slot, &(command, pwm_duty)) in &self.outputs {
            state.upsert_actuator(DesiredActuatorState::new(slot, command, pwm_duty), MAX_ACTUATORS);
        }
        for (&loop_id, &(mode, setpoint)) in &self.loops {
            state.pid_loops.push(DesiredPidState::new(loop_id, mode, setpoint));
        }
        state.pid_loops.truncate(MAX_PID_LOOPS);
        state.seal();
        state
    }

    pub fn output(&self, slot: u16) -> Option<(ActuatorCommand, u8)> {
        self.outputs.get(&slot).copied()
    }

    pub fn station(&self) -> &StationName {
        &self.station
    }

    pub fn epoch(&self) -> u32 {
        self.epoch
    }

    pub fn controller_holds(&self) -> bool {
        self.controller_holds
    }

    pub fn has_granted(&self, epoch: u32) -> bool {
        self.granted.contains(&epoch)
    }

    pub fn stats(&self) -> &RtuStats {
        &self.stats
    }

    fn admits(&self, epoch: u32) -> bool {
        self.controller_holds && (epoch == 0 || epoch == self.epoch)
    }

    fn refuse(&mut self) -> Option<FromRtu> {
        self.stats.writes_refused += 1;
        Some(self.status())
    }

    fn revoke(&mut self) {
        if self.controller_holds {
            self.stats.releases += 1;
        }
        self.controller_holds = false;
        self.epoch = self.epoch.saturating_add(1);
        debug!(station = %self.station, epoch = self.epoch, "device revoked controller authority");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn rtu() -> SimulatedRtu {
        SimulatedRtu::new(StationName::new("tank-1").unwrap(), 100)
    }

    #[test]
    fn test_grant_uses_fresh_epoch() {
        let mut rtu = rtu();
        assert_eq!(
            rtu.handle(ToRtu::RequestAuthority { epoch: 1 }),
            Some(FromRtu::Granted { epoch: 2 })
        );
        // Retry of the same request
        assert_eq!(
            rtu.handle(ToRtu::RequestAuthority { epoch: 1 }),
            Some(FromRtu::Granted { epoch: 2 })
        );
        assert!(rtu.has_granted(2));
        assert_eq!(rtu.stats().grants, 1);
    }

    #[test]
    fn test_request_ahead_of_device_epoch() {
        let mut rtu = rtu();
        rtu.handle(ToRtu::RequestAuthority { epoch: 1 });
        assert_eq!(
            rtu.handle(ToRtu::RequestAuthority { epoch: 7 }),
            Some(FromRtu::Granted { epoch: 7 })
        );
    }

    #[test]
    fn test_writes_need_current_grant() {
        let mut rtu = rtu();
        let write = |epoch| ToRtu::WriteActuator {
            slot: 3,
            command: ActuatorCommand::On,
            pwm_duty: 0,
            epoch,
        };

        assert!(matches!(rtu.handle(write(1)), Some(FromRtu::Status { controller_holds: false, .. })));
        rtu.handle(ToRtu::RequestAuthority { epoch: 1 });
        assert_eq!(rtu.handle(write(1)), Some(FromRtu::Status { epoch: 2, controller_holds: true }));
        assert_eq!(rtu.handle(write(2)), None);
        assert_eq!(rtu.output(3), Some((ActuatorCommand::On, 0)));
        assert_eq!(rtu.stats().writes_refused, 2);
    }

    #[test]
    fn test_local_control_fences_old_epoch() {
        let mut rtu = rtu();
        rtu.handle(ToRtu::RequestAuthority { epoch: 1 });
        assert!(!rtu.set_local_output(1, ActuatorCommand::On, 0));

        assert_eq!(rtu.take_local_control(), FromRtu::Released { epoch: 3 });
        assert!(rtu.set_local_output(1, ActuatorCommand::On, 0));
        assert!(rtu
            .handle(ToRtu::WriteActuator {
                slot: 1,
                command: ActuatorCommand::Off,
                pwm_duty: 0,
                epoch: 2,
            })
            .is_some());
        assert_eq!(rtu.output(1), Some((ActuatorCommand::On, 0)));
    }

    #[test]
    fn test_report_reflects_outputs() {
        let mut rtu = rtu();
        rtu.set_local_output(4, ActuatorCommand::Pwm, 60);
        let report = rtu.report();
        assert_eq!(report.station_name.as_str(), "tank-1");
        assert_eq!(report.actuator(4).unwrap().pwm_duty, 60);
        assert!(report.verify());
    }

    #[test]
    fn test_heartbeat_interval() {
        let mut rtu = rtu();
        assert!(rtu.tick(50).is_none());
        assert!(rtu.tick(100).is_some());
        assert!(rtu.tick(150).is_none());
        assert!(rtu.tick(200).is_some());
    }
}
