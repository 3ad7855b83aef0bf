//! Plant simulation: one coordinator, many devices, lossy links in between
//!
//! Time only moves when [`Plant::step`] is called, so every run is
//! reproducible from its seed.

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;

use helm_core::{Clock, ManualClock, Millis, StationName, StationNameError};
use helm_state::ReconcilerConfig;
use tracing::{debug, error};

use crate::{Coordinator, CoordinatorConfig, FromRtu, Link, LinkConfig, SimulatedRtu, ToRtu};

/// Plant configuration
#[derive(Clone, Debug)]
pub struct PlantConfig {
    pub link: LinkConfig,
    pub coordinator: CoordinatorConfig,
    pub step_ms: Millis,
    pub heartbeat_ms: Millis,
    pub seed: u64,
}

impl PlantConfig {
    pub fn new(persist_path: impl Into<PathBuf>) -> Self {
        PlantConfig {
            link: LinkConfig::default(),
            coordinator: CoordinatorConfig {
                reconciler: ReconcilerConfig::default().with_persist_path(persist_path),
                ..CoordinatorConfig::default()
            },
            step_ms: 10,
            heartbeat_ms: 200,
            seed: 0,
        }
    }

    pub fn with_link(mut self, link: LinkConfig) -> Self {
        self.link = link;
        self
    }

    pub fn with_seed(mut self, seed: u64) -> Self {
        self.seed = seed;
        self
    }
}

/// Authority invariant broken during a run
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Violation {
    pub at: Millis,
    pub station: StationName,
    pub what: String,
}

struct Node {
    rtu: SimulatedRtu,
    down: Link<ToRtu>,
    up: Link<FromRtu>,
    connected: bool,
}

pub struct Plant {
    config: PlantConfig,
    clock: Arc<ManualClock>,
    coordinator: Coordinator,
    nodes: BTreeMap<StationName, Node>,
    /// Highest manager epoch seen per station
    epochs: BTreeMap<StationName, u32>,
    violations: Vec<Violation>,
}

impl Plant {
    pub fn new(config: PlantConfig) -> Self {
        let clock = Arc::new(ManualClock::new(0));
        let coordinator = Coordinator::new(config.coordinator.clone(), clock.clone());
        Plant {
            config,
            clock,
            coordinator,
            nodes: BTreeMap::new(),
            epochs: BTreeMap::new(),
            violations: Vec::new(),
        }
    }

    /// Add a device and connect it
    pub fn add_station(&mut self, name: &str) -> Result<StationName, StationNameError> {
        let station = StationName::new(name)?;
        let seed = self.config.seed.wrapping_add(2 * self.nodes.len() as u64);
        let node = Node {
            rtu: SimulatedRtu::new(station.clone(), self.config.heartbeat_ms),
            down: Link::new(self.config.link.clone(), seed),
            up: Link::new(self.config.link.clone(), seed.wrapping_add(1)),
            connected: false,
        };
        self.nodes.insert(station.clone(), node);
        self.connect(&station);
        Ok(station)
    }

    pub fn connect(&mut self, station: &StationName) {
        let now = self.now();
        let Some(node) = self.nodes.get_mut(station) else {
            return;
        };
        node.connected = true;
        node.down.restore();
        node.up.restore();
        for message in self.coordinator.connect(station) {
            node.down.send(now, message);
        }
    }

    /// Cut the link in both directions; both sides notice at once
    pub fn disconnect(&mut self, station: &StationName) {
        let Some(node) = self.nodes.get_mut(station) else {
            return;
        };
        node.connected = false;
        node.down.cut();
        node.up.cut();
        node.rtu.link_lost();
        self.coordinator.disconnect(station);
    }

    /// Replace the coordinator as if the controller process restarted
    ///
    /// Desired state is snapshotted first and restored into the new instance.
    pub fn restart_controller(&mut self) {
        self.coordinator.snapshot_dirty();
        self.coordinator = Coordinator::new(self.config.coordinator.clone(), self.clock.clone());
        self.epochs.clear();

        let stations: Vec<_> = self.nodes.keys().cloned().collect();
        for station in &stations {
            if let Err(err) = self.coordinator.restore(station) {
                error!(station = %station, error = %err, "restore after restart failed");
            }
        }
        for station in &stations {
            if self.nodes.get(station).map_or(false, |n| n.connected) {
                self.connect(station);
            }
        }
    }

    /// Controller hands the device back on purpose
    pub fn relinquish(&mut self, station: &StationName) {
        let now = self.now();
        let messages = self.coordinator.relinquish(station);
        self.send_down(now, station, messages);
    }

    /// Operator takes the device panel to local control
    pub fn take_local_control(&mut self, station: &StationName) {
        let now = self.now();
        if let Some(node) = self.nodes.get_mut(station) {
            let message = node.rtu.take_local_control();
            node.up.send(now, message);
        }
    }

    /// Desired-output change issued by the controller's command path
    pub fn set_output(
        &mut self,
        station: &StationName,
        slot: u16,
        command: helm_state::ActuatorCommand,
        pwm_duty: u8,
    ) {
        let now = self.now();
        match self.coordinator.set_output(station, slot, command, pwm_duty) {
            Ok(writes) => self.send_down(now, station, writes),
            Err(err) => error!(station = %station, error = %err, "desired output rejected"),
        }
    }

    pub fn set_loop(
        &mut self,
        station: &StationName,
        loop_id: u16,
        mode: helm_state::PidMode,
        setpoint: f32,
    ) {
        let now = self.now();
        match self.coordinator.set_loop(station, loop_id, mode, setpoint) {
            Ok(writes) => self.send_down(now, station, writes),
            Err(err) => error!(station = %station, error = %err, "desired loop rejected"),
        }
    }

    /// Advance the clock one step and move every message that is due
    pub fn step(&mut self) {
        let now = self.clock.advance(self.config.step_ms);

        let stations: Vec<_> = self.nodes.keys().cloned().collect();
        for station in &stations {
            let Some(node) = self.nodes.get_mut(station) else {
                continue;
            };

            for message in node.down.poll(now) {
                if let Some(reply) = node.rtu.handle(message) {
                    node.up.send(now, reply);
                }
            }
            if node.connected {
                if let Some(heartbeat) = node.rtu.tick(now) {
                    node.up.send(now, heartbeat);
                }
            }

            let arrived = node.up.poll(now);
            for message in arrived {
                let replies = self.coordinator.handle(station, message);
                self.send_down(now, station, replies);
            }
        }

        for (station, message) in self.coordinator.tick(now) {
            self.send_down(now, &station, vec![message]);
        }

        self.check_invariants(now);
    }

    /// Step until `ms` of simulated time have passed
    pub fn run_for(&mut self, ms: Millis) {
        let until = self.now() + ms;
        while self.now() < until {
            self.step();
        }
    }

    /// Step until `done` holds or `ms` have passed; returns whether it held
    pub fn run_until<F>(&mut self, ms: Millis, mut done: F) -> bool
    where
        F: FnMut(&Plant) -> bool,
    {
        let until = self.now() + ms;
        while self.now() < until {
            if done(self) {
                return true;
            }
            self.step();
        }
        done(self)
    }

    /// Controller supervises the device under the device's own epoch
    pub fn supervised(&self, station: &StationName) -> bool {
        let Some(node) = self.nodes.get(station) else {
            return false;
        };
        let Ok(ctx) = self.coordinator.authority().context(station) else {
            return false;
        };
        ctx.state.controller_drives()
            && node.rtu.controller_holds()
            && ctx.epoch == node.rtu.epoch()
    }

    /// Supervised, and every desired actuator output is live on the device
    pub fn converged(&self, station: &StationName) -> bool {
        if !self.supervised(station) {
            return false;
        }
        let (Some(node), Ok(desired)) = (
            self.nodes.get(station),
            self.coordinator.reconciler().get_desired(station),
        ) else {
            return false;
        };
        desired
            .actuators
            .iter()
            .all(|a| node.rtu.output(a.slot) == Some((a.command, a.pwm_duty)))
    }

    pub fn rtu(&self, station: &StationName) -> Option<&SimulatedRtu> {
        self.nodes.get(station).map(|n| &n.rtu)
    }

    pub fn rtu_mut(&mut self, station: &StationName) -> Option<&mut SimulatedRtu> {
        self.nodes.get_mut(station).map(|n| &mut n.rtu)
    }

    pub fn coordinator(&self) -> &Coordinator {
        &self.coordinator
    }

    pub fn violations(&self) -> &[Violation] {
        &self.violations
    }

    pub fn now(&self) -> Millis {
        self.clock.now_ms()
    }

    fn send_down(&mut self, now: Millis, station: &StationName, messages: Vec<ToRtu>) {
        if let Some(node) = self.nodes.get_mut(station) {
            for message in messages {
                node.down.send(now, message);
            }
        }
    }

    /// The controller may only believe it drives a device under an epoch the
    /// device itself granted, and a station's epoch never goes backwards.
    fn check_invariants(&mut self, now: Millis) {
        for (station, node) in &self.nodes {
            let Ok(ctx) = self.coordinator.authority().context(station) else {
                continue;
            };

            if ctx.state.controller_drives() && !node.rtu.has_granted(ctx.epoch) {
                self.violations.push(Violation {
                    at: now,
                    station: station.clone(),
                    what: format!("supervised under epoch {} never granted", ctx.epoch),
                });
            }
            if ctx.epoch > node.rtu.epoch() {
                debug!(station = %station, manager = ctx.epoch, device = node.rtu.epoch(), "manager epoch ahead of device");
            }

            let seen = self.epochs.entry(station.clone()).or_insert(ctx.epoch);
            if ctx.epoch < *seen {
                self.violations.push(Violation {
                    at: now,
                    station: station.clone(),
                    what: format!("epoch went from {} to {}", *seen, ctx.epoch),
                });
            }
            *seen = (*seen).max(ctx.epoch);
        }
    }
}
