//! Closed-loop extension control of the six linear actuators.
//!
//! [`LinearActuators`] pairs the drive stage with the extension sensors.
//! A seek runs on its own thread: every tick it measures, compares each
//! extension against its target and drives the actuators that still
//! deviate. Commanding new targets first cancels the running seek and
//! joins its thread, so two seeks never overlap and the drive is always
//! stopped between them.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use thiserror::Error;
use tracing::{debug, warn};

use crate::sensors::SensorError;
use crate::sensors::extension::ExtensionSensors;
use crate::servo::{ServoControllers, ServoError};

/// Pause between two seek ticks.
const TICK: Duration = Duration::from_millis(10);

/// Consecutive failed ticks tolerated before a seek gives up.
const FAULT_BUDGET: u32 = 10;

/// Half-width of the band around a target that counts as reached.
const DEFAULT_DEVIATION: f64 = 0.01;

#[derive(Debug, Clone, Error)]
pub enum ActuatorError {
    /// Command length does not match the number of actuators
    #[error("expected {expected} actuator channels, got {got}")]
    ChannelCountMismatch { expected: usize, got: usize },

    /// Extension bounds are empty or not finite
    #[error("invalid extension bounds [{minimal}, {maximal}]")]
    InvalidBounds { minimal: f64, maximal: f64 },

    /// Target outside the configured extension bounds
    #[error("target extension {0} outside the configured bounds")]
    TargetOutOfBounds(f64),

    /// Seek speed outside `[0, 1]`
    #[error("seek speed {0} outside [0, 1]")]
    SpeedOutOfRange(f64),

    /// Acceptable deviation must be finite and positive
    #[error("acceptable deviation {0} must be positive")]
    InvalidDeviation(f64),

    #[error(transparent)]
    Servo(#[from] ServoError),

    #[error(transparent)]
    Sensor(#[from] SensorError),
}

/// How a seek ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SeekStatus {
    /// Every extension sits within the acceptable deviation.
    Converged,
    /// The seek was preempted by a new command or an explicit stop.
    Cancelled,
    /// Too many consecutive ticks failed.
    Faulted,
    /// The wait deadline passed while the seek was still running.
    TimedOut,
}

struct Seek {
    cancel: Arc<AtomicBool>,
    outcome: Arc<(Mutex<Option<SeekStatus>>, Condvar)>,
    worker: JoinHandle<()>,
}

/// The six actuators as one closed-loop positioning stage.
pub struct LinearActuators {
    servos: Arc<Mutex<ServoControllers>>,
    sensors: Arc<ExtensionSensors>,
    minimal_extension: f64,
    maximal_extension: f64,
    acceptable_deviation: f64,
    seek: Option<Seek>,
    last_outcome: SeekStatus,
}

impl LinearActuators {
    /// Pair a drive stage with its extension sensors.
    ///
    /// `minimal_extension` and `maximal_extension` bound every target;
    /// they describe the mechanically safe part of the stroke.
    pub fn new(
        servos: ServoControllers,
        sensors: ExtensionSensors,
        minimal_extension: f64,
        maximal_extension: f64,
    ) -> Result<Self, ActuatorError> {
        if servos.channel_count() != sensors.channel_count() {
            return Err(ActuatorError::ChannelCountMismatch {
                expected: servos.channel_count(),
                got: sensors.channel_count(),
            });
        }
        if !minimal_extension.is_finite()
            || !maximal_extension.is_finite()
            || minimal_extension >= maximal_extension
        {
            return Err(ActuatorError::InvalidBounds {
                minimal: minimal_extension,
                maximal: maximal_extension,
            });
        }
        Ok(Self {
            servos: Arc::new(Mutex::new(servos)),
            sensors: Arc::new(sensors),
            minimal_extension,
            maximal_extension,
            acceptable_deviation: DEFAULT_DEVIATION,
            seek: None,
            last_outcome: SeekStatus::Converged,
        })
    }

    pub fn channel_count(&self) -> usize {
        self.sensors.channel_count()
    }

    pub fn minimal_extension(&self) -> f64 {
        self.minimal_extension
    }

    pub fn maximal_extension(&self) -> f64 {
        self.maximal_extension
    }

    pub fn acceptable_deviation(&self) -> f64 {
        self.acceptable_deviation
    }

    pub fn set_acceptable_deviation(&mut self, deviation: f64) -> Result<(), ActuatorError> {
        if !deviation.is_finite() || deviation <= 0.0 {
            return Err(ActuatorError::InvalidDeviation(deviation));
        }
        self.acceptable_deviation = deviation;
        Ok(())
    }

    /// Current extension of every actuator.
    pub fn get_extensions(&self) -> Result<Vec<f64>, ActuatorError> {
        Ok(self.sensors.measure()?)
    }

    /// Seek every actuator to its target extension.
    ///
    /// The command is validated completely first. A running seek is then
    /// cancelled and joined before the new one starts, so its drive
    /// commands can no longer interleave with ours. The call returns as
    /// soon as the new seek thread runs; completion is observed through
    /// [`wait_until_settled`](Self::wait_until_settled).
    pub fn set_extensions(
        &mut self,
        targets: Vec<f64>,
        maximal_speeds: Vec<f64>,
    ) -> Result<(), ActuatorError> {
        let channels = self.channel_count();
        if targets.len() != channels {
            return Err(ActuatorError::ChannelCountMismatch {
                expected: channels,
                got: targets.len(),
            });
        }
        if maximal_speeds.len() != channels {
            return Err(ActuatorError::ChannelCountMismatch {
                expected: channels,
                got: maximal_speeds.len(),
            });
        }
        for &target in &targets {
            if !target.is_finite()
                || target < self.minimal_extension
                || target > self.maximal_extension
            {
                return Err(ActuatorError::TargetOutOfBounds(target));
            }
        }
        if let Some(&speed) = maximal_speeds
            .iter()
            .find(|&&speed| !(0.0..=1.0).contains(&speed))
        {
            return Err(ActuatorError::SpeedOutOfRange(speed));
        }

        self.cancel_current_seek();

        let cancel = Arc::new(AtomicBool::new(false));
        let outcome = Arc::new((Mutex::new(None), Condvar::new()));
        let seek_loop = SeekLoop {
            servos: Arc::clone(&self.servos),
            sensors: Arc::clone(&self.sensors),
            targets,
            maximal_speeds,
            minimal_extension: self.minimal_extension,
            maximal_extension: self.maximal_extension,
            acceptable_deviation: self.acceptable_deviation,
            cancel: Arc::clone(&cancel),
            outcome: Arc::clone(&outcome),
        };
        debug!(targets = ?seek_loop.targets, "seek started");
        let worker = thread::spawn(move || seek_loop.run());
        self.seek = Some(Seek {
            cancel,
            outcome,
            worker,
        });
        Ok(())
    }

    /// Cancel the running seek, if any, and stop the drive.
    pub fn stop(&mut self) -> Result<(), ActuatorError> {
        self.cancel_current_seek();
        self.servos.lock().unwrap().stop()?;
        Ok(())
    }

    /// Block until the current seek ends or `timeout` passes.
    ///
    /// With no seek running this reports how the last one ended;
    /// a fresh stage counts as settled.
    pub fn wait_until_settled(&self, timeout: Duration) -> SeekStatus {
        let Some(seek) = &self.seek else {
            return self.last_outcome;
        };
        let (slot, condvar) = &*seek.outcome;
        let deadline = Instant::now() + timeout;
        let mut outcome = slot.lock().unwrap();
        loop {
            if let Some(status) = *outcome {
                return status;
            }
            let Some(remaining) = deadline.checked_duration_since(Instant::now()) else {
                return SeekStatus::TimedOut;
            };
            let (guard, waited) = condvar.wait_timeout(outcome, remaining).unwrap();
            outcome = guard;
            if waited.timed_out() {
                return outcome.unwrap_or(SeekStatus::TimedOut);
            }
        }
    }

    fn cancel_current_seek(&mut self) {
        if let Some(seek) = self.seek.take() {
            seek.cancel.store(true, Ordering::Relaxed);
            let _ = seek.worker.join();
            let outcome = seek.outcome.0.lock().unwrap();
            self.last_outcome = outcome.unwrap_or(SeekStatus::Cancelled);
        }
    }
}

impl Drop for LinearActuators {
    fn drop(&mut self) {
        self.cancel_current_seek();
    }
}

// ─── Seek Worker ────────────────────────────────────────────────────

struct SeekLoop {
    servos: Arc<Mutex<ServoControllers>>,
    sensors: Arc<ExtensionSensors>,
    targets: Vec<f64>,
    maximal_speeds: Vec<f64>,
    minimal_extension: f64,
    maximal_extension: f64,
    acceptable_deviation: f64,
    cancel: Arc<AtomicBool>,
    outcome: Arc<(Mutex<Option<SeekStatus>>, Condvar)>,
}

impl SeekLoop {
    fn run(self) {
        let status = self.drive();
        // The drive must be stopped no matter how the seek ended.
        if let Err(err) = self.servos.lock().unwrap().stop() {
            warn!(%err, "drive stop failed after seek");
        }
        let (slot, condvar) = &*self.outcome;
        *slot.lock().unwrap() = Some(status);
        condvar.notify_all();
        debug!(?status, "seek finished");
    }

    fn drive(&self) -> SeekStatus {
        let mut failures: u32 = 0;
        loop {
            if self.cancel.load(Ordering::Relaxed) {
                return SeekStatus::Cancelled;
            }
            match self.tick() {
                Ok(true) => return SeekStatus::Converged,
                Ok(false) => failures = 0,
                Err(err) => {
                    failures += 1;
                    debug!(%err, failures, "seek tick failed");
                    if failures >= FAULT_BUDGET {
                        warn!(%err, "seek abandoned after repeated faults");
                        return SeekStatus::Faulted;
                    }
                }
            }
            thread::sleep(TICK);
        }
    }

    /// One control tick. `Ok(true)` means every channel sits within the
    /// acceptable deviation; nothing is driven in that case.
    fn tick(&self) -> Result<bool, ActuatorError> {
        let extensions = self.sensors.measure()?;
        let mut forwards = vec![false; self.targets.len()];
        let mut speeds = vec![0.0; self.targets.len()];
        let mut settled = true;
        for (channel, (&target, &extension)) in
            self.targets.iter().zip(&extensions).enumerate()
        {
            let extension = extension.clamp(self.minimal_extension, self.maximal_extension);
            let deviation = extension - target;
            if deviation.abs() <= self.acceptable_deviation {
                continue;
            }
            settled = false;
            forwards[channel] = deviation < 0.0;
            speeds[channel] = self.maximal_speeds[channel];
        }
        if settled {
            return Ok(true);
        }
        self.servos.lock().unwrap().run(&forwards, &speeds)?;
        Ok(false)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gpio::Gpio;
    use crate::hal::sim::{SimEvent, SimRig};
    use crate::hal::Level;
    use crate::sensors::extension::ExtensionSensors;

    const DIRECTION_PINS: [u8; 6] = [22, 5, 6, 13, 19, 26];

    fn actuators_on(rig: &SimRig) -> LinearActuators {
        actuators_with_channels(rig, vec![0, 1, 2, 3, 4, 5])
    }

    fn actuators_with_channels(rig: &SimRig, adc_channels: Vec<u8>) -> LinearActuators {
        let gpio = Gpio::new(Box::new(rig.clone()));
        let sensors =
            ExtensionSensors::from_spi(gpio.allocate_spi().unwrap(), adc_channels, 0.0, 1.0)
                .unwrap();
        let pins = DIRECTION_PINS
            .iter()
            .map(|&pin| gpio.allocate_pin(pin).unwrap())
            .collect();
        let servos = ServoControllers::new(
            pins,
            gpio.allocate_i2c().unwrap(),
            vec![0, 1, 2, 3, 4, 5],
            1.0,
        )
        .unwrap();
        LinearActuators::new(servos, sensors, 0.1, 0.8).unwrap()
    }

    #[test]
    fn seek_converges_on_the_targets() {
        let rig = SimRig::new();
        let mut actuators = actuators_on(&rig);

        actuators
            .set_extensions(vec![0.5; 6], vec![1.0; 6])
            .unwrap();
        assert_eq!(
            actuators.wait_until_settled(Duration::from_secs(5)),
            SeekStatus::Converged
        );

        for extension in actuators.get_extensions().unwrap() {
            assert!((extension - 0.5).abs() < 0.02, "extension {extension}");
        }
        assert_eq!(rig.duties(), [0.0; 6]);
    }

    #[test]
    fn new_targets_preempt_the_running_seek() {
        let rig = SimRig::new();
        let mut actuators = actuators_on(&rig);

        // First seek extends everything, so it writes High levels and
        // non-zero duties only.
        actuators
            .set_extensions(vec![0.75; 6], vec![1.0; 6])
            .unwrap();
        thread::sleep(Duration::from_millis(50));
        actuators
            .set_extensions(vec![0.15; 6], vec![1.0; 6])
            .unwrap();
        assert_eq!(
            actuators.wait_until_settled(Duration::from_secs(10)),
            SeekStatus::Converged
        );

        // The first Low level belongs to the second seek; the first
        // seek's drive must have been fully stopped before it.
        let events = rig.events();
        let first_low = events
            .iter()
            .position(|event| {
                matches!(
                    event,
                    SimEvent::Line {
                        level: Level::Low,
                        ..
                    }
                )
            })
            .unwrap();
        let stops_before = events[..first_low]
            .iter()
            .filter(|event| matches!(event, SimEvent::Duty { duty, .. } if *duty == 0.0))
            .count();
        assert!(stops_before >= 6, "only {stops_before} stop writes");

        for extension in actuators.get_extensions().unwrap() {
            assert!((extension - 0.15).abs() < 0.02, "extension {extension}");
        }
    }

    #[test]
    fn wait_without_a_seek_reports_settled() {
        let rig = SimRig::new();
        let actuators = actuators_on(&rig);
        assert_eq!(
            actuators.wait_until_settled(Duration::from_millis(10)),
            SeekStatus::Converged
        );
    }

    #[test]
    fn slow_seek_times_out_and_stop_cancels_it() {
        let rig = SimRig::new();
        let mut actuators = actuators_on(&rig);

        actuators
            .set_extensions(vec![0.7; 6], vec![0.01; 6])
            .unwrap();
        assert_eq!(
            actuators.wait_until_settled(Duration::from_millis(50)),
            SeekStatus::TimedOut
        );

        actuators.stop().unwrap();
        assert_eq!(rig.duties(), [0.0; 6]);
        assert_eq!(
            actuators.wait_until_settled(Duration::from_millis(10)),
            SeekStatus::Cancelled
        );
    }

    #[test]
    fn repeated_sensor_faults_abandon_the_seek() {
        let rig = SimRig::new();
        // Converter channel 9 does not exist, every measurement fails.
        let mut actuators = actuators_with_channels(&rig, vec![0, 1, 2, 3, 4, 9]);

        actuators
            .set_extensions(vec![0.5; 6], vec![1.0; 6])
            .unwrap();
        assert_eq!(
            actuators.wait_until_settled(Duration::from_secs(5)),
            SeekStatus::Faulted
        );
        assert_eq!(rig.duties(), [0.0; 6]);
    }

    #[test]
    fn commands_are_validated_before_the_seek_starts() {
        let rig = SimRig::new();
        let mut actuators = actuators_on(&rig);

        assert!(matches!(
            actuators.set_extensions(vec![0.5; 5], vec![1.0; 6]),
            Err(ActuatorError::ChannelCountMismatch { expected: 6, got: 5 })
        ));
        assert!(matches!(
            actuators.set_extensions(vec![0.05; 6], vec![1.0; 6]),
            Err(ActuatorError::TargetOutOfBounds(_))
        ));
        assert!(matches!(
            actuators.set_extensions(vec![0.9; 6], vec![1.0; 6]),
            Err(ActuatorError::TargetOutOfBounds(_))
        ));
        assert!(matches!(
            actuators.set_extensions(vec![f64::NAN; 6], vec![1.0; 6]),
            Err(ActuatorError::TargetOutOfBounds(_))
        ));
        assert!(matches!(
            actuators.set_extensions(vec![0.5; 6], vec![1.5; 6]),
            Err(ActuatorError::SpeedOutOfRange(_))
        ));
        assert!(rig.events().is_empty());

        assert!(matches!(
            actuators.set_acceptable_deviation(0.0),
            Err(ActuatorError::InvalidDeviation(_))
        ));
        actuators.set_acceptable_deviation(0.02).unwrap();
    }

    #[test]
    fn drop_cancels_the_seek_and_stops_the_drive() {
        let rig = SimRig::new();
        let mut actuators = actuators_on(&rig);

        actuators
            .set_extensions(vec![0.75; 6], vec![1.0; 6])
            .unwrap();
        thread::sleep(Duration::from_millis(30));
        assert!(rig.duties().iter().any(|&duty| duty > 0.0));

        drop(actuators);
        assert_eq!(rig.duties(), [0.0; 6]);
    }

    #[test]
    fn construction_validates_counts_and_bounds() {
        let rig = SimRig::new();
        let gpio = Gpio::new(Box::new(rig.clone()));
        let sensors =
            ExtensionSensors::from_spi(gpio.allocate_spi().unwrap(), vec![0, 1, 2], 0.0, 1.0)
                .unwrap();
        let pins = DIRECTION_PINS
            .iter()
            .map(|&pin| gpio.allocate_pin(pin).unwrap())
            .collect();
        let servos = ServoControllers::new(
            pins,
            gpio.allocate_i2c().unwrap(),
            vec![0, 1, 2, 3, 4, 5],
            1.0,
        )
        .unwrap();
        assert!(matches!(
            LinearActuators::new(servos, sensors, 0.1, 0.8),
            Err(ActuatorError::ChannelCountMismatch { expected: 6, got: 3 })
        ));

        let rig = SimRig::new();
        let gpio = Gpio::new(Box::new(rig.clone()));
        let sensors = ExtensionSensors::from_spi(
            gpio.allocate_spi().unwrap(),
            vec![0, 1, 2, 3, 4, 5],
            0.0,
            1.0,
        )
        .unwrap();
        let pins = DIRECTION_PINS
            .iter()
            .map(|&pin| gpio.allocate_pin(pin).unwrap())
            .collect();
        let servos = ServoControllers::new(
            pins,
            gpio.allocate_i2c().unwrap(),
            vec![0, 1, 2, 3, 4, 5],
            1.0,
        )
        .unwrap();
        assert!(matches!(
            LinearActuators::new(servos, sensors, 0.8, 0.8),
            Err(ActuatorError::InvalidBounds { .. })
        ));
    }
}
