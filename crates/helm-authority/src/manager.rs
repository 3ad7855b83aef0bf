//! Authority Manager - admits or rejects controller commands per station
//!
//! One context per station, created on first `request`. The manager owns a
//! single lock around its table; every operation runs to completion under
//! it, and the state-change callback fires under it as well.

use std::collections::HashMap;
use std::sync::Arc;

use helm_core::{elapsed_ms, Clock, Millis, MonotonicClock, StationName};
use parking_lot::Mutex;
use tracing::{debug, info, warn};

use crate::{
    Anomaly, AuthorityContext, AuthorityError, AuthorityResult, AuthorityState, Denial,
};

/// Invoked on every committed transition: (station, old, new, context after)
///
/// Runs under the manager's lock and must not call back into the manager.
pub type StateChangeCallback =
    Box<dyn Fn(&StationName, AuthorityState, AuthorityState, &AuthorityContext) + Send + Sync>;

/// Authority Manager configuration
#[derive(Clone, Debug)]
pub struct AuthorityConfig {
    /// Identity recorded as `holder` while supervised
    pub controller_id: String,
    /// Limit on HANDOFF_PENDING and RELEASING phases
    pub handoff_timeout_ms: u64,
    /// Default age after which a timed command is refused
    pub stale_command_threshold_ms: u64,
    /// Station table bound, `None` for unbounded
    pub max_stations: Option<usize>,
}

impl Default for AuthorityConfig {
    fn default() -> Self {
        AuthorityConfig {
            controller_id: "helm-controller".to_string(),
            handoff_timeout_ms: 5_000,
            stale_command_threshold_ms: 10_000,
            max_stations: Some(256),
        }
    }
}

impl AuthorityConfig {
    /// Short timeouts for redundant-controller deployments
    pub fn fast_failover() -> Self {
        AuthorityConfig {
            handoff_timeout_ms: 1_000,
            stale_command_threshold_ms: 2_000,
            ..Self::default()
        }
    }

    pub fn with_controller_id(mut self, id: impl Into<String>) -> Self {
        self.controller_id = id.into();
        self
    }
}

/// Per-station ownership tracker
pub struct AuthorityManager {
    config: AuthorityConfig,
    clock: Arc<dyn Clock>,
    contexts: Mutex<HashMap<StationName, AuthorityContext>>,
    on_change: Option<StateChangeCallback>,
}

impl AuthorityManager {
    /// Create a manager with default configuration
    pub fn new() -> Self {
        Self::with_config(AuthorityConfig::default())
    }

    pub fn with_config(config: AuthorityConfig) -> Self {
        Self::with_clock(config, Arc::new(MonotonicClock::new()))
    }

    pub fn with_clock(config: AuthorityConfig, clock: Arc<dyn Clock>) -> Self {
        AuthorityManager {
            config,
            clock,
            contexts: Mutex::new(HashMap::new()),
            on_change: None,
        }
    }

    /// Register the state-change callback
    pub fn on_state_change<F>(mut self, callback: F) -> Self
    where
        F: Fn(&StationName, AuthorityState, AuthorityState, &AuthorityContext)
            + Send
            + Sync
            + 'static,
    {
        self.on_change = Some(Box::new(callback));
        self
    }

    pub fn config(&self) -> &AuthorityConfig {
        &self.config
    }

    /// Clock that stamps request and grant times
    pub fn clock(&self) -> &Arc<dyn Clock> {
        &self.clock
    }

    /// Current time on the manager's clock
    ///
    /// `process` and `validate_timed_command` compare against this timeline.
    pub fn now(&self) -> Millis {
        self.clock.now_ms()
    }

    /// Ask the device for control
    ///
    /// Idempotent while SUPERVISED. Busy while a handoff is already pending.
    pub fn request(&self, station: &StationName) -> AuthorityResult<AuthorityContext> {
        let now = self.clock.now_ms();
        let mut contexts = self.contexts.lock();

        if !contexts.contains_key(station) {
            if let Some(capacity) = self.config.max_stations {
                if contexts.len() >= capacity {
                    warn!(station = %station, capacity, "authority table full");
                    return Err(AuthorityError::Full { capacity });
                }
            }
            contexts.insert(
                station.clone(),
                AuthorityContext::new(station, self.config.stale_command_threshold_ms),
            );
        }

        let ctx = Self::entry(&mut contexts, station)?;
        match ctx.state {
            AuthorityState::Supervised => return Ok(ctx.clone()),
            AuthorityState::HandoffPending => {
                debug!(station = %station, "request while handoff pending");
                return Err(AuthorityError::Busy(station.clone()));
            }
            AuthorityState::Autonomous | AuthorityState::Releasing => {}
        }

        let old = ctx.state;
        ctx.state = AuthorityState::HandoffPending;
        ctx.request_time = now;
        ctx.rtu_acknowledged = false;
        ctx.controller_online = true;

        info!(station = %station, epoch = ctx.epoch, "authority requested");
        self.notify(station, old, ctx);
        Ok(ctx.clone())
    }

    /// Start handing control back to the device
    pub fn release(&self, station: &StationName) -> AuthorityResult<AuthorityContext> {
        let now = self.clock.now_ms();
        let mut contexts = self.contexts.lock();
        let ctx = Self::entry(&mut contexts, station)?;

        if ctx.state != AuthorityState::Supervised {
            warn!(station = %station, state = %ctx.state, "release outside SUPERVISED");
            return Err(AuthorityError::Permission {
                station: station.clone(),
                denial: Denial::NotSupervised {
                    operation: "release",
                    state: ctx.state,
                },
            });
        }

        let old = ctx.state;
        ctx.state = AuthorityState::Releasing;
        ctx.request_time = now;

        info!(station = %station, epoch = ctx.epoch, "authority release started");
        self.notify(station, old, ctx);
        Ok(ctx.clone())
    }

    /// Device granted control under `epoch`
    pub fn handle_grant(&self, station: &StationName, epoch: u32) -> AuthorityResult<AuthorityContext> {
        let now = self.clock.now_ms();
        let mut contexts = self.contexts.lock();
        let ctx = Self::entry(&mut contexts, station)?;

        if ctx.state != AuthorityState::HandoffPending {
            warn!(station = %station, state = %ctx.state, epoch, "unsolicited grant");
            return Err(AuthorityError::Protocol {
                station: station.clone(),
                anomaly: Anomaly::UnsolicitedGrant { state: ctx.state },
            });
        }
        if epoch < ctx.epoch {
            warn!(station = %station, granted = epoch, current = ctx.epoch, "stale grant");
            return Err(AuthorityError::Protocol {
                station: station.clone(),
                anomaly: Anomaly::StaleGrant {
                    granted: epoch,
                    current: ctx.epoch,
                },
            });
        }

        let old = ctx.state;
        ctx.epoch = epoch;
        ctx.state = AuthorityState::Supervised;
        ctx.grant_time = now;
        ctx.rtu_acknowledged = true;
        ctx.holder = self.config.controller_id.clone();

        info!(station = %station, epoch, "authority granted");
        self.notify(station, old, ctx);
        Ok(ctx.clone())
    }

    /// Device reports it governs itself again
    ///
    /// Trusted in every state: the device is the final word on its outputs.
    pub fn handle_released(&self, station: &StationName, epoch: u32) -> AuthorityResult<AuthorityContext> {
        let mut contexts = self.contexts.lock();
        let ctx = Self::entry(&mut contexts, station)?;

        if epoch < ctx.epoch {
            debug!(station = %station, reported = epoch, current = ctx.epoch, "release epoch behind, keeping current");
        }

        let old = ctx.state;
        ctx.adopt_epoch(epoch);
        ctx.state = AuthorityState::Autonomous;
        ctx.holder = station.to_string();
        ctx.rtu_acknowledged = false;

        info!(station = %station, epoch = ctx.epoch, from = %old, "device released authority");
        self.notify(station, old, ctx);
        Ok(ctx.clone())
    }

    /// Admit a command stamped with `command_epoch` (0 = epoch-unaware)
    pub fn validate_command(&self, station: &StationName, command_epoch: u32) -> AuthorityResult<()> {
        let contexts = self.contexts.lock();
        let ctx = contexts
            .get(station)
            .ok_or_else(|| AuthorityError::NotFound(station.clone()))?;

        Self::check_command(station, ctx, command_epoch)
    }

    /// As [`validate_command`](Self::validate_command), also refusing commands
    /// older than the station's stale-command threshold
    ///
    /// `issued_at` is a time on the manager's [`clock`](Self::clock).
    pub fn validate_timed_command(
        &self,
        station: &StationName,
        command_epoch: u32,
        issued_at: Millis,
    ) -> AuthorityResult<()> {
        let now = self.clock.now_ms();
        let contexts = self.contexts.lock();
        let ctx = contexts
            .get(station)
            .ok_or_else(|| AuthorityError::NotFound(station.clone()))?;

        Self::check_command(station, ctx, command_epoch)?;

        let age_ms = elapsed_ms(now, issued_at);
        if age_ms > ctx.stale_command_threshold_ms {
            warn!(station = %station, age_ms, threshold_ms = ctx.stale_command_threshold_ms, "stale command rejected");
            return Err(AuthorityError::Permission {
                station: station.clone(),
                denial: Denial::StaleCommand {
                    age_ms,
                    threshold_ms: ctx.stale_command_threshold_ms,
                },
            });
        }
        Ok(())
    }

    fn check_command(station: &StationName, ctx: &AuthorityContext, command_epoch: u32) -> AuthorityResult<()> {
        if !ctx.state.controller_drives() {
            warn!(station = %station, state = %ctx.state, "command rejected, not supervised");
            return Err(AuthorityError::Permission {
                station: station.clone(),
                denial: Denial::NotSupervised {
                    operation: "command",
                    state: ctx.state,
                },
            });
        }
        if command_epoch != 0 && command_epoch < ctx.epoch {
            warn!(station = %station, command_epoch, current = ctx.epoch, "stale epoch rejected");
            return Err(AuthorityError::Permission {
                station: station.clone(),
                denial: Denial::StaleEpoch {
                    command: command_epoch,
                    current: ctx.epoch,
                },
            });
        }
        Ok(())
    }

    /// Timeout sweep, returns how many stations were moved to AUTONOMOUS
    ///
    /// A stuck handoff fails toward device control. A stuck release completes
    /// under a new epoch. `now` must be read from [`clock`](Self::clock).
    pub fn process(&self, now: Millis) -> usize {
        let timeout = self.config.handoff_timeout_ms;
        let mut contexts = self.contexts.lock();
        let mut swept = 0;

        for (station, ctx) in contexts.iter_mut() {
            let waited = elapsed_ms(now, ctx.request_time);
            if waited <= timeout {
                continue;
            }

            let old = ctx.state;
            match old {
                AuthorityState::HandoffPending => {
                    ctx.state = AuthorityState::Autonomous;
                    ctx.controller_online = false;
                    ctx.rtu_acknowledged = false;
                    warn!(station = %station, waited_ms = waited, "handoff timed out");
                }
                AuthorityState::Releasing => {
                    ctx.state = AuthorityState::Autonomous;
                    ctx.bump_epoch();
                    ctx.holder = station.to_string();
                    ctx.rtu_acknowledged = false;
                    warn!(station = %station, waited_ms = waited, epoch = ctx.epoch, "release timed out, forcing completion");
                }
                AuthorityState::Autonomous | AuthorityState::Supervised => continue,
            }

            swept += 1;
            self.notify(station, old, ctx);
        }

        swept
    }

    /// Timeout sweep at the manager's own current time
    pub fn process_now(&self) -> usize {
        self.process(self.clock.now_ms())
    }

    /// Administrative override: hand control to the device immediately
    pub fn force_release(&self, station: &StationName) -> AuthorityResult<AuthorityContext> {
        let mut contexts = self.contexts.lock();
        let ctx = Self::entry(&mut contexts, station)?;

        let old = ctx.state;
        ctx.state = AuthorityState::Autonomous;
        ctx.bump_epoch();
        ctx.controller_online = false;
        ctx.rtu_acknowledged = false;
        ctx.holder = station.to_string();

        warn!(station = %station, epoch = ctx.epoch, from = %old, "authority force-released");
        self.notify(station, old, ctx);
        Ok(ctx.clone())
    }

    /// Override the stale-command threshold for one station
    pub fn set_stale_command_threshold(&self, station: &StationName, threshold_ms: u64) -> AuthorityResult<()> {
        let mut contexts = self.contexts.lock();
        let ctx = Self::entry(&mut contexts, station)?;
        ctx.stale_command_threshold_ms = threshold_ms;
        Ok(())
    }

    /// Copy of a station's context
    pub fn context(&self, station: &StationName) -> AuthorityResult<AuthorityContext> {
        self.contexts
            .lock()
            .get(station)
            .cloned()
            .ok_or_else(|| AuthorityError::NotFound(station.clone()))
    }

    pub fn state(&self, station: &StationName) -> AuthorityResult<AuthorityState> {
        self.context(station).map(|ctx| ctx.state)
    }

    pub fn epoch(&self, station: &StationName) -> AuthorityResult<u32> {
        self.context(station).map(|ctx| ctx.epoch)
    }

    /// Tracked stations, sorted
    pub fn stations(&self) -> Vec<StationName> {
        let mut names: Vec<_> = self.contexts.lock().keys().cloned().collect();
        names.sort();
        names
    }

    pub fn len(&self) -> usize {
        self.contexts.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.contexts.lock().is_empty()
    }

    fn entry<'a>(
        contexts: &'a mut HashMap<StationName, AuthorityContext>,
        station: &StationName,
    ) -> AuthorityResult<&'a mut AuthorityContext> {
        contexts
            .get_mut(station)
            .ok_or_else(|| AuthorityError::NotFound(station.clone()))
    }

    fn notify(&self, station: &StationName, old: AuthorityState, ctx: &AuthorityContext) {
        debug_assert!(
            old.can_transition_to(ctx.state),
            "illegal authority transition {old} -> {}",
            ctx.state
        );
        if old == ctx.state {
            return;
        }
        debug!(station = %station, from = %old, to = %ctx.state, epoch = ctx.epoch, "authority transition");
        if let Some(callback) = &self.on_change {
            callback(station, old, ctx.state, ctx);
        }
    }
}

impl Default for AuthorityManager {
    fn default() -> Self {
        Self::new()
    }
}
