//! Reference coordinator
//!
//! Wires the Authority Manager and the State Reconciler together the way a
//! controller's connection handler and scheduler would:
//! - Requests authority for every connected station it wants to drive
//! - Stamps desired-state writes with the current epoch
//! - Reconciles on every grant and on a read-back cadence
//! - Turns conflicts into corrective writes

use std::collections::HashMap;
use std::sync::Arc;

use helm_authority::{AuthorityConfig, AuthorityManager, AuthorityState};
use helm_core::{Clock, ErrorKind, Millis, StationName};
use helm_state::{
    ActuatorCommand, DesiredState, PidMode, ReconcileResult, ReconcilerConfig, StateReconciler,
};
use tracing::{debug, error, info, warn};

use crate::{FromRtu, ToRtu};

/// Coordinator cadences
#[derive(Clone, Debug)]
pub struct CoordinatorConfig {
    pub authority: AuthorityConfig,
    pub reconciler: ReconcilerConfig,
    /// Interval between read-backs of a supervised station
    pub readback_interval_ms: Millis,
    /// Interval between snapshots of dirty documents
    pub snapshot_interval_ms: Millis,
}

impl Default for CoordinatorConfig {
    fn default() -> Self {
        CoordinatorConfig {
            authority: AuthorityConfig::fast_failover(),
            reconciler: ReconcilerConfig::default(),
            readback_interval_ms: 250,
            snapshot_interval_ms: 1_000,
        }
    }
}

/// Coordinator counters
#[derive(Clone, Debug, Default)]
pub struct CoordinatorStats {
    pub requests: u64,
    pub reconciliations: u64,
    pub conflicts: u64,
    pub corrective_writes: u64,
    pub refused_commands: u64,
    pub protocol_anomalies: u64,
    pub snapshot_failures: u64,
}

#[derive(Clone, Debug, Default)]
struct Session {
    online: bool,
    /// Whether the controller wants to drive this station
    wanted: bool,
    last_readback: Millis,
}

pub struct Coordinator {
    config: CoordinatorConfig,
    authority: AuthorityManager,
    reconciler: StateReconciler,
    sessions: HashMap<StationName, Session>,
    last_snapshot: Millis,
    stats: CoordinatorStats,
}

impl Coordinator {
    pub fn new(config: CoordinatorConfig, clock: Arc<dyn Clock>) -> Self {
        let authority = AuthorityManager::with_clock(config.authority.clone(), clock.clone())
            .on_state_change(|station, old, new, ctx| {
                debug!(station = %station, %old, %new, epoch = ctx.epoch, "coordinator saw transition");
            });
        let reconciler = StateReconciler::with_clock(config.reconciler.clone(), clock);

        Coordinator {
            config,
            authority,
            reconciler,
            sessions: HashMap::new(),
            last_snapshot: 0,
            stats: CoordinatorStats::default(),
        }
    }

    pub fn authority(&self) -> &AuthorityManager {
        &self.authority
    }

    pub fn reconciler(&self) -> &StateReconciler {
        &self.reconciler
    }

    pub fn stats(&self) -> &CoordinatorStats {
        &self.stats
    }

    /// Reload a station's persisted desired state, if any
    pub fn restore(&self, station: &StationName) -> ReconcileResult<Option<DesiredState>> {
        match self.reconciler.restore(station) {
            Ok(state) => Ok(Some(state)),
            Err(err) if err.kind() == ErrorKind::NotFound => Ok(None),
            Err(err) => Err(err),
        }
    }

    /// Device came online; the controller wants to drive it
    pub fn connect(&mut self, station: &StationName) -> Vec<ToRtu> {
        let session = self.sessions.entry(station.clone()).or_default();
        session.online = true;
        session.wanted = true;
        info!(station = %station, "station connected");
        self.request(station).into_iter().collect()
    }

    /// Device link dropped: stop driving it immediately
    pub fn disconnect(&mut self, station: &StationName) {
        if let Some(session) = self.sessions.get_mut(station) {
            session.online = false;
        }
        match self.authority.force_release(station) {
            Ok(ctx) => info!(station = %station, epoch = ctx.epoch, "station disconnected"),
            Err(err) => debug!(station = %station, error = %err, "disconnect of untracked station"),
        }
    }

    /// Hand a station back to local control
    pub fn relinquish(&mut self, station: &StationName) -> Vec<ToRtu> {
        if let Some(session) = self.sessions.get_mut(station) {
            session.wanted = false;
        }
        match self.authority.release(station) {
            Ok(_) => vec![ToRtu::ReleaseAuthority],
            Err(err) => {
                debug!(station = %station, error = %err, "nothing to relinquish");
                Vec::new()
            }
        }
    }

    /// Record a desired output and push it if the station is supervised
    pub fn set_output(
        &mut self,
        station: &StationName,
        slot: u16,
        command: ActuatorCommand,
        pwm_duty: u8,
    ) -> ReconcileResult<Vec<ToRtu>> {
        let epoch = self.authority.epoch(station).unwrap_or(0);
        self.reconciler
            .set_actuator(station, slot, command, pwm_duty, epoch)?;
        Ok(self.admitted(station, |epoch| {
            vec![ToRtu::WriteActuator {
                slot,
                command,
                pwm_duty,
                epoch,
            }]
        }))
    }

    /// Record a desired loop configuration and push it if supervised
    pub fn set_loop(
        &mut self,
        station: &StationName,
        loop_id: u16,
        mode: PidMode,
        setpoint: f32,
    ) -> ReconcileResult<Vec<ToRtu>> {
        self.reconciler.set_pid_loop(station, loop_id, mode, setpoint)?;
        Ok(self.admitted(station, |epoch| {
            vec![ToRtu::WriteLoop {
                loop_id,
                mode,
                setpoint,
                epoch,
            }]
        }))
    }

    /// Handle one message from a device
    pub fn handle(&mut self, station: &StationName, message: FromRtu) -> Vec<ToRtu> {
        match message {
            FromRtu::Granted { epoch } => match self.authority.handle_grant(station, epoch) {
                Ok(_) => {
                    if let Some(session) = self.sessions.get_mut(station) {
                        session.last_readback = 0;
                    }
                    vec![ToRtu::ReadBack]
                }
                Err(err) => {
                    self.stats.protocol_anomalies += 1;
                    debug!(station = %station, epoch, error = %err, "grant ignored");
                    Vec::new()
                }
            },
            FromRtu::Released { epoch } => {
                if let Err(err) = self.authority.handle_released(station, epoch) {
                    debug!(station = %station, error = %err, "release from untracked station");
                }
                Vec::new()
            }
            FromRtu::Status {
                epoch,
                controller_holds,
            } => self.on_status(station, epoch, controller_holds),
            FromRtu::Report(actual) => self.on_report(station, &actual),
        }
    }

    /// Scheduler pass: timeouts, re-requests, read-backs and snapshots
    pub fn tick(&mut self, now: Millis) -> Vec<(StationName, ToRtu)> {
        let swept = self.authority.process(now);
        if swept > 0 {
            debug!(swept, "authority timeouts");
        }

        let mut out = Vec::new();
        let mut stations: Vec<_> = self.sessions.keys().cloned().collect();
        stations.sort();

        for station in stations {
            let Some(session) = self.sessions.get(&station).cloned() else {
                continue;
            };
            if !session.online || !session.wanted {
                continue;
            }

            match self.authority.state(&station) {
                Ok(AuthorityState::Supervised) => {
                    if now.saturating_sub(session.last_readback) >= self.config.readback_interval_ms {
                        if let Some(s) = self.sessions.get_mut(&station) {
                            s.last_readback = now;
                        }
                        out.push((station, ToRtu::ReadBack));
                    }
                }
                Ok(AuthorityState::HandoffPending) => {}
                Ok(_) | Err(_) => {
                    if let Some(message) = self.request(&station) {
                        out.push((station, message));
                    }
                }
            }
        }

        if now.saturating_sub(self.last_snapshot) >= self.config.snapshot_interval_ms {
            self.last_snapshot = now;
            self.snapshot_dirty();
        }

        out
    }

    /// Persist every document with unsaved changes
    pub fn snapshot_dirty(&mut self) {
        for (station, result) in self.reconciler.snapshot_dirty() {
            match result {
                Ok(_) => {}
                // Still dirty, the next snapshot pass retries
                Err(err) if err.kind().is_transient() => {
                    self.stats.snapshot_failures += 1;
                    warn!(station = %station, error = %err, "snapshot failed, will retry");
                }
                Err(err) => {
                    self.stats.snapshot_failures += 1;
                    error!(station = %station, error = %err, "snapshot failed");
                }
            }
        }
    }

    fn request(&mut self, station: &StationName) -> Option<ToRtu> {
        match self.authority.request(station) {
            Ok(ctx) if ctx.state == AuthorityState::HandoffPending => {
                self.stats.requests += 1;
                Some(ToRtu::RequestAuthority { epoch: ctx.epoch })
            }
            Ok(_) => None,
            Err(err) if err.kind().is_transient() => {
                debug!(station = %station, error = %err, "authority request deferred");
                None
            }
            Err(err) => {
                warn!(station = %station, error = %err, "authority request refused");
                None
            }
        }
    }

    fn on_status(&mut self, station: &StationName, epoch: u32, controller_holds: bool) -> Vec<ToRtu> {
        let state = self.authority.state(station).unwrap_or_default();
        let wanted = self.sessions.get(station).map_or(false, |s| s.wanted);

        if !controller_holds && matches!(state, AuthorityState::Supervised | AuthorityState::Releasing) {
            // The release announcement was lost; the heartbeat carries the same news
            if let Err(err) = self.authority.handle_released(station, epoch) {
                debug!(station = %station, error = %err, "status from untracked station");
            }
            return Vec::new();
        }
        if controller_holds && !wanted {
            return vec![ToRtu::ReleaseAuthority];
        }
        Vec::new()
    }

    fn on_report(&mut self, station: &StationName, actual: &DesiredState) -> Vec<ToRtu> {
        let result = match self.reconciler.reconcile(station, Some(actual)) {
            Ok(result) => result,
            Err(err) => {
                debug!(station = %station, error = %err, "nothing to reconcile");
                return Vec::new();
            }
        };
        self.stats.reconciliations += 1;
        self.stats.conflicts += u64::from(result.conflicts());

        let Ok(desired) = self.reconciler.get_desired(station) else {
            return Vec::new();
        };

        // Entries the device does not report count as synced but still need pushing
        let slots: Vec<u16> = desired
            .actuators
            .iter()
            .filter(|a| result.conflicting_slots.contains(&a.slot) || actual.actuator(a.slot).is_none())
            .map(|a| a.slot)
            .collect();
        let loops: Vec<u16> = desired
            .pid_loops
            .iter()
            .filter(|p| result.conflicting_loops.contains(&p.loop_id) || actual.pid_loop(p.loop_id).is_none())
            .map(|p| p.loop_id)
            .collect();

        if slots.is_empty() && loops.is_empty() {
            return Vec::new();
        }

        let writes = self.admitted(station, |epoch| {
            let actuators = slots.iter().filter_map(|&slot| desired.actuator(slot)).map(|a| {
                ToRtu::WriteActuator {
                    slot: a.slot,
                    command: a.command,
                    pwm_duty: a.pwm_duty,
                    epoch,
                }
            });
            let pid = loops.iter().filter_map(|&id| desired.pid_loop(id)).map(|p| ToRtu::WriteLoop {
                loop_id: p.loop_id,
                mode: p.mode,
                setpoint: p.setpoint,
                epoch,
            });
            actuators.chain(pid).collect()
        });

        self.stats.corrective_writes += writes.len() as u64;
        if !writes.is_empty() {
            info!(station = %station, writes = writes.len(), "corrective writes issued");
        }
        writes
    }

    /// Build writes only if the manager admits a command under the current epoch
    fn admitted<F>(&mut self, station: &StationName, build: F) -> Vec<ToRtu>
    where
        F: FnOnce(u32) -> Vec<ToRtu>,
    {
        let Ok(epoch) = self.authority.epoch(station) else {
            return Vec::new();
        };
        match self.authority.validate_command(station, epoch) {
            Ok(()) => build(epoch),
            Err(err) => {
                self.stats.refused_commands += 1;
                debug!(station = %station, error = %err, "write held back");
                Vec::new()
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use helm_core::ManualClock;

    fn coordinator(dir: &std::path::Path) -> Coordinator {
        let config = CoordinatorConfig {
            reconciler: ReconcilerConfig::default().with_persist_path(dir),
            ..CoordinatorConfig::default()
        };
        Coordinator::new(config, Arc::new(ManualClock::new(1_000)))
    }

    fn tank() -> StationName {
        StationName::new("tank-1").unwrap()
    }

    #[test]
    fn test_connect_requests_with_current_epoch() {
        let dir = tempfile::tempdir().unwrap();
        let mut coordinator = coordinator(dir.path());

        assert_eq!(coordinator.connect(&tank()), vec![ToRtu::RequestAuthority { epoch: 1 }]);
        assert_eq!(
            coordinator.authority().state(&tank()).unwrap(),
            AuthorityState::HandoffPending
        );
    }

    #[test]
    fn test_writes_held_until_supervised() {
        let dir = tempfile::tempdir().unwrap();
        let mut coordinator = coordinator(dir.path());
        coordinator.connect(&tank());

        let writes = coordinator.set_output(&tank(), 3, ActuatorCommand::On, 0).unwrap();
        assert!(writes.is_empty());
        assert_eq!(coordinator.stats().refused_commands, 1);

        assert_eq!(
            coordinator.handle(&tank(), FromRtu::Granted { epoch: 2 }),
            vec![ToRtu::ReadBack]
        );
        let writes = coordinator.set_output(&tank(), 3, ActuatorCommand::Off, 0).unwrap();
        assert_eq!(
            writes,
            vec![ToRtu::WriteActuator {
                slot: 3,
                command: ActuatorCommand::Off,
                pwm_duty: 0,
                epoch: 2,
            }]
        );
    }

    #[test]
    fn test_report_produces_corrective_writes() {
        let dir = tempfile::tempdir().unwrap();
        let mut coordinator = coordinator(dir.path());
        coordinator.connect(&tank());
        coordinator.handle(&tank(), FromRtu::Granted { epoch: 2 });
        coordinator.set_output(&tank(), 1, ActuatorCommand::Pwm, 40).unwrap();
        coordinator.set_output(&tank(), 2, ActuatorCommand::On, 0).unwrap();

        let mut actual = DesiredState::new(tank());
        actual.upsert_actuator(helm_state::DesiredActuatorState::new(1, ActuatorCommand::Pwm, 10), 64);

        let writes = coordinator.handle(&tank(), FromRtu::Report(actual));
        assert_eq!(writes.len(), 2);
        assert_eq!(coordinator.stats().conflicts, 1);
        assert_eq!(coordinator.stats().corrective_writes, 2);
    }

    #[test]
    fn test_status_recovers_lost_release() {
        let dir = tempfile::tempdir().unwrap();
        let mut coordinator = coordinator(dir.path());
        coordinator.connect(&tank());
        coordinator.handle(&tank(), FromRtu::Granted { epoch: 2 });

        coordinator.handle(
            &tank(),
            FromRtu::Status {
                epoch: 3,
                controller_holds: false,
            },
        );
        let ctx = coordinator.authority().context(&tank()).unwrap();
        assert_eq!(ctx.state, AuthorityState::Autonomous);
        assert_eq!(ctx.epoch, 3);
    }

    #[test]
    fn test_duplicate_grant_is_counted_not_applied() {
        let dir = tempfile::tempdir().unwrap();
        let mut coordinator = coordinator(dir.path());
        coordinator.connect(&tank());
        coordinator.handle(&tank(), FromRtu::Granted { epoch: 2 });

        assert!(coordinator.handle(&tank(), FromRtu::Granted { epoch: 2 }).is_empty());
        assert_eq!(coordinator.stats().protocol_anomalies, 1);
        assert_eq!(coordinator.authority().epoch(&tank()).unwrap(), 2);
    }

    #[test]
    fn test_relinquish_repeats_release_while_device_holds() {
        let dir = tempfile::tempdir().unwrap();
        let mut coordinator = coordinator(dir.path());
        coordinator.connect(&tank());
        coordinator.handle(&tank(), FromRtu::Granted { epoch: 2 });

        assert_eq!(coordinator.relinquish(&tank()), vec![ToRtu::ReleaseAuthority]);
        assert_eq!(
            coordinator.handle(
                &tank(),
                FromRtu::Status {
                    epoch: 2,
                    controller_holds: true,
                }
            ),
            vec![ToRtu::ReleaseAuthority]
        );
        assert_eq!(
            coordinator.authority().state(&tank()).unwrap(),
            AuthorityState::Releasing
        );
    }

    #[test]
    fn test_busy_request_is_deferred() {
        let dir = tempfile::tempdir().unwrap();
        let mut coordinator = coordinator(dir.path());
        coordinator.connect(&tank());

        assert!(coordinator.connect(&tank()).is_empty());
        assert_eq!(coordinator.stats().requests, 1);
        assert_eq!(
            coordinator.authority().state(&tank()).unwrap(),
            AuthorityState::HandoffPending
        );
    }

    #[test]
    fn test_failed_snapshot_stays_dirty_for_retry() {
        let dir = tempfile::tempdir().unwrap();
        let blocker = dir.path().join("blocker");
        std::fs::write(&blocker, b"file").unwrap();
        let mut coordinator = coordinator(&blocker);
        coordinator
            .reconciler()
            .set_actuator(&tank(), 1, ActuatorCommand::On, 0, 1)
            .unwrap();

        coordinator.snapshot_dirty();
        coordinator.snapshot_dirty();
        assert_eq!(coordinator.stats().snapshot_failures, 2);
        assert_eq!(coordinator.reconciler().dirty_stations(), vec![tank()]);
    }
}
