//! Desired vs. reported state comparison
//!
//! Detection only. A coordinator turns conflicts into corrective writes.

use std::time::Duration;

use crate::{DesiredActuatorState, DesiredPidState, DesiredState};

/// Outcome of one reconciliation pass
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ReconciliationResult {
    pub actuators_synced: u32,
    pub actuators_conflicted: u32,
    pub pid_synced: u32,
    pub pid_conflicted: u32,
    /// Slots whose reported output differs from the desired one
    pub conflicting_slots: Vec<u16>,
    /// Loops whose reported mode or setpoint differs
    pub conflicting_loops: Vec<u16>,
    pub elapsed: Duration,
    /// No conflicts in either dimension
    pub success: bool,
}

impl ReconciliationResult {
    pub fn conflicts(&self) -> u32 {
        self.actuators_conflicted + self.pid_conflicted
    }
}

/// Classify every tracked entry of `desired` against `actual`
///
/// Entries the device does not report are counted as synced, as is
/// everything when there is no report at all.
pub fn compare<A, P>(
    desired: &DesiredState,
    actual: Option<&DesiredState>,
    mut on_actuator: A,
    mut on_pid: P,
) -> ReconciliationResult
where
    A: FnMut(&DesiredActuatorState, &DesiredActuatorState),
    P: FnMut(&DesiredPidState, &DesiredPidState),
{
    let mut result = ReconciliationResult::default();

    for want in &desired.actuators {
        match actual.and_then(|a| a.actuator(want.slot)) {
            Some(have) if want.diverges_from(have) => {
                result.actuators_conflicted += 1;
                result.conflicting_slots.push(want.slot);
                on_actuator(want, have);
            }
            _ => result.actuators_synced += 1,
        }
    }

    for want in &desired.pid_loops {
        match actual.and_then(|a| a.pid_loop(want.loop_id)) {
            Some(have) if want.diverges_from(have) => {
                result.pid_conflicted += 1;
                result.conflicting_loops.push(want.loop_id);
                on_pid(want, have);
            }
            _ => result.pid_synced += 1,
        }
    }

    result.success = result.conflicts() == 0;
    result
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{ActuatorCommand, PidMode, MAX_ACTUATORS, MAX_PID_LOOPS};
    use helm_core::StationName;

    fn desired() -> DesiredState {
        let mut state = DesiredState::new(StationName::new("tank-1").unwrap());
        for slot in 0..4 {
            state.upsert_actuator(
                DesiredActuatorState::new(slot, ActuatorCommand::Pwm, 10 * slot as u8),
                MAX_ACTUATORS,
            );
        }
        state.update_pid_loop(1, MAX_PID_LOOPS, |p| {
            p.mode = PidMode::Auto;
            p.setpoint = 50.0;
        });
        state
    }

    #[test]
    fn test_identical_report_is_synced() {
        let want = desired();
        let result = compare(&want, Some(&want.clone()), |_, _| panic!(), |_, _| panic!());
        assert_eq!(result.actuators_synced, 4);
        assert_eq!(result.pid_synced, 1);
        assert!(result.success);
    }

    #[test]
    fn test_pwm_difference_is_one_conflict() {
        let want = desired();
        let mut have = want.clone();
        have.actuators[2].pwm_duty = 99;

        let mut calls = Vec::new();
        let result = compare(&want, Some(&have), |d, a| calls.push((d.slot, a.pwm_duty)), |_, _| {});

        assert_eq!(result.actuators_conflicted, 1);
        assert_eq!(result.actuators_synced, 3);
        assert_eq!(result.conflicting_slots, vec![2]);
        assert_eq!(calls, vec![(2, 99)]);
        assert!(!result.success);
    }

    #[test]
    fn test_missing_entries_count_as_synced() {
        let want = desired();
        let mut have = want.clone();
        have.actuators.clear();
        have.pid_loops.clear();

        let result = compare(&want, Some(&have), |_, _| panic!(), |_, _| panic!());
        assert_eq!(result.actuators_synced, 4);
        assert_eq!(result.pid_synced, 1);
        assert!(result.success);
    }

    #[test]
    fn test_absent_report_is_all_synced() {
        let want = desired();
        let result = compare(&want, None, |_, _| panic!(), |_, _| panic!());
        assert_eq!(result.actuators_synced, 4);
        assert_eq!(result.pid_synced, 1);
        assert_eq!(result.conflicts(), 0);
        assert!(result.success);
    }

    #[test]
    fn test_pid_mode_conflict() {
        let want = desired();
        let mut have = want.clone();
        have.pid_loops[0].mode = PidMode::Manual;

        let mut loops = Vec::new();
        let result = compare(&want, Some(&have), |_, _| {}, |d, _| loops.push(d.loop_id));
        assert_eq!(result.pid_conflicted, 1);
        assert_eq!(result.conflicting_loops, vec![1]);
        assert_eq!(loops, vec![1]);
        assert!(!result.success);
    }

    #[test]
    fn test_extra_reported_entries_ignored() {
        let want = desired();
        let mut have = want.clone();
        have.upsert_actuator(DesiredActuatorState::new(40, ActuatorCommand::On, 0), MAX_ACTUATORS);

        let result = compare(&want, Some(&have), |_, _| {}, |_, _| {});
        assert_eq!(result.actuators_synced + result.actuators_conflicted, 4);
        assert!(result.success);
    }
}
