//! End-to-end pose control against the software rig.

use std::time::Duration;

use glam::DVec3;
use strut_core::config::RigConfig;
use strut_core::hal::sim::SimRig;
use strut_core::sensors::attitude::AttitudeSensors;
use strut_core::sensors::extension::ExtensionSensors;
use strut_core::servo::ServoControllers;
use strut_core::{Gpio, LinearActuators, Pose, PoseOutcome, SeekStatus, StewartPlatform};

/// Wire a complete platform from the default rig description, the same
/// way the command line tool does.
fn build_platform(rig: &SimRig) -> StewartPlatform {
    let config = RigConfig::default();
    let gpio = Gpio::new(Box::new(rig.clone()));

    let mut sensors = ExtensionSensors::from_spi(
        gpio.allocate_spi().unwrap(),
        config.extension.channels.clone(),
        config.extension.minimal,
        config.extension.maximal,
    )
    .unwrap();
    sensors
        .set_samples_per_measurement(config.extension.samples_per_measurement)
        .unwrap();

    let pins = config
        .pins
        .direction
        .iter()
        .map(|&pin| gpio.allocate_pin(pin).unwrap())
        .collect();
    let servos = ServoControllers::new(
        pins,
        gpio.allocate_i2c().unwrap(),
        config.servo.channels.clone(),
        config.servo.maximal_speed,
    )
    .unwrap();

    let mut actuators = LinearActuators::new(
        servos,
        sensors,
        config.actuators.minimal_extension,
        config.actuators.maximal_extension,
    )
    .unwrap();
    actuators
        .set_acceptable_deviation(config.actuators.acceptable_deviation)
        .unwrap();

    let attitude = AttitudeSensors::from_uart(gpio.allocate_uart().unwrap()).unwrap();
    StewartPlatform::new(actuators, attitude, config.platform_geometry().unwrap()).unwrap()
}

#[test]
fn test_pose_seek_converges_on_the_commanded_extensions() {
    let rig = SimRig::new();
    let mut platform = build_platform(&rig);

    let pose = Pose::new(DVec3::new(0.0, 0.0, 0.5), DVec3::ZERO);
    let outcome = platform.set_end_effector_pose(&pose).unwrap();
    let PoseOutcome::Accepted { extensions } = outcome else {
        panic!("pose should be reachable, got {outcome:?}");
    };

    assert_eq!(
        platform.wait_until_pose_is_reached(Duration::from_secs(10)),
        SeekStatus::Converged
    );

    let measured = platform.actuators().get_extensions().unwrap();
    for (channel, (target, extension)) in extensions.iter().zip(&measured).enumerate() {
        assert!(
            (target - extension).abs() < 0.02,
            "channel {channel}: target {target}, measured {extension}"
        );
    }
}

#[test]
fn test_reached_pose_is_reconstructed_by_forward_kinematics() {
    let rig = SimRig::new();
    let mut platform = build_platform(&rig);

    let commanded = Pose::new(DVec3::new(0.0, 0.0, 0.5), DVec3::ZERO);
    assert!(matches!(
        platform.set_end_effector_pose(&commanded).unwrap(),
        PoseOutcome::Accepted { .. }
    ));
    assert_eq!(
        platform.wait_until_pose_is_reached(Duration::from_secs(10)),
        SeekStatus::Converged
    );

    // Reconstruction error is bounded by the seek tolerance.
    let reached = platform.end_effector_pose().unwrap();
    assert!(
        (reached.translation - commanded.translation).length() < 0.05,
        "reconstructed {:?}",
        reached.translation
    );
    assert!(reached.attitude.length() < 1e-9);
}

#[test]
fn test_unreachable_pose_is_refused_without_motion() {
    let rig = SimRig::new();
    let mut platform = build_platform(&rig);

    let pose = Pose::new(DVec3::new(0.0, 0.0, 5.0), DVec3::ZERO);
    assert!(matches!(
        platform.set_end_effector_pose(&pose).unwrap(),
        PoseOutcome::Unreachable { .. }
    ));
    assert_eq!(rig.duties(), [0.0; 6]);

    // The rig never moved, every actuator still reads its rest value.
    for extension in platform.actuators().get_extensions().unwrap() {
        assert!((extension - 0.4).abs() < 1e-9);
    }
}
