//! Authority handoff and failover scenarios over simulated links

use helm_authority::AuthorityState;
use helm_state::{ActuatorCommand, PidMode};
use helm_test::{init_tracing, LinkConfig, Plant, PlantConfig};

fn plant(dir: &std::path::Path, link: LinkConfig, seed: u64) -> Plant {
    init_tracing();
    Plant::new(PlantConfig::new(dir).with_link(link).with_seed(seed))
}

#[test]
fn test_local_control_fences_controller_writes() {
    let dir = tempfile::tempdir().unwrap();
    let mut plant = plant(dir.path(), LinkConfig::perfect(), 1);
    let tank = plant.add_station("tank-1").unwrap();
    plant.set_output(&tank, 1, ActuatorCommand::On, 0);
    assert!(plant.run_until(2_000, |p| p.converged(&tank)));
    let first_epoch = plant.rtu(&tank).unwrap().epoch();

    plant.take_local_control(&tank);
    assert!(plant.rtu_mut(&tank).unwrap().set_local_output(1, ActuatorCommand::Off, 0));

    // The controller takes the device back under a newer epoch and corrects it
    assert!(plant.run_until(5_000, |p| p.converged(&tank)));
    let epoch = plant.coordinator().authority().epoch(&tank).unwrap();
    assert!(epoch > first_epoch + 1);
    assert_eq!(plant.rtu(&tank).unwrap().output(1), Some((ActuatorCommand::On, 0)));
    assert!(plant.violations().is_empty());
}

#[test]
fn test_disconnect_hands_control_to_device() {
    let dir = tempfile::tempdir().unwrap();
    let mut plant = plant(dir.path(), LinkConfig::perfect(), 2);
    let tank = plant.add_station("tank-1").unwrap();
    assert!(plant.run_until(1_000, |p| p.supervised(&tank)));

    plant.disconnect(&tank);
    let ctx = plant.coordinator().authority().context(&tank).unwrap();
    assert_eq!(ctx.state, AuthorityState::Autonomous);
    assert!(!ctx.controller_online);
    assert!(!plant.rtu(&tank).unwrap().controller_holds());

    // Nothing is sent while the link is down
    plant.run_for(3_000);
    assert_eq!(
        plant.coordinator().authority().state(&tank).unwrap(),
        AuthorityState::Autonomous
    );

    plant.connect(&tank);
    assert!(plant.run_until(2_000, |p| p.supervised(&tank)));
    assert!(plant.violations().is_empty());
}

#[test]
fn test_changes_made_while_disconnected_are_pushed_on_reconnect() {
    let dir = tempfile::tempdir().unwrap();
    let mut plant = plant(dir.path(), LinkConfig::perfect(), 3);
    let tank = plant.add_station("tank-1").unwrap();
    assert!(plant.run_until(1_000, |p| p.supervised(&tank)));

    plant.disconnect(&tank);
    plant.set_output(&tank, 4, ActuatorCommand::Pwm, 35);
    plant.set_loop(&tank, 1, PidMode::Auto, 21.5);
    assert_eq!(plant.rtu(&tank).unwrap().output(4), None);

    plant.connect(&tank);
    assert!(plant.run_until(3_000, |p| p.converged(&tank)));
    assert_eq!(plant.rtu(&tank).unwrap().output(4), Some((ActuatorCommand::Pwm, 35)));
    assert!(plant.coordinator().stats().corrective_writes > 0);
}

#[test]
fn test_relinquish_returns_device_to_autonomy() {
    let dir = tempfile::tempdir().unwrap();
    let mut plant = plant(dir.path(), LinkConfig::perfect(), 4);
    let tank = plant.add_station("tank-1").unwrap();
    assert!(plant.run_until(1_000, |p| p.supervised(&tank)));

    plant.relinquish(&tank);
    assert_eq!(
        plant.coordinator().authority().state(&tank).unwrap(),
        AuthorityState::Releasing
    );

    plant.run_for(2_000);
    let ctx = plant.coordinator().authority().context(&tank).unwrap();
    assert_eq!(ctx.state, AuthorityState::Autonomous);
    assert_eq!(ctx.holder, "tank-1");
    assert!(!plant.rtu(&tank).unwrap().controller_holds());
    // Not wanted any more, so no new request goes out
    assert_eq!(plant.coordinator().stats().requests, 1);
}

#[test]
fn test_many_stations_hand_off_independently() {
    let dir = tempfile::tempdir().unwrap();
    let mut plant = plant(dir.path(), LinkConfig::default(), 5);
    let stations: Vec<_> = (0..8)
        .map(|i| plant.add_station(&format!("rtu-{i}")).unwrap())
        .collect();
    for (i, station) in stations.iter().enumerate() {
        plant.set_output(station, 1, ActuatorCommand::Pwm, i as u8 * 10);
    }

    assert!(plant.run_until(10_000, |p| stations.iter().all(|s| p.converged(s))));
    assert_eq!(plant.coordinator().authority().len(), 8);
    assert!(plant.violations().is_empty());
}
