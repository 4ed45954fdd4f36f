//! Drive stage of the six linear actuators.
//!
//! Each actuator is driven by an H-bridge: a direction pin selects extend
//! or retract and a PWM channel sets the speed. [`ServoControllers`] owns
//! all six direction pins plus the PWM bank and guarantees that a drive
//! command is validated completely before the first wire is touched, so
//! a rejected command never leaves the bridge half-programmed.

use thiserror::Error;
use tracing::trace;

use crate::gpio::{I2c, Pin};
use crate::hal::{DriverError, Level};

#[derive(Debug, Clone, Error)]
pub enum ServoError {
    /// Command length does not match the number of actuators
    #[error("expected {expected} channels, got {got}")]
    ChannelCountMismatch { expected: usize, got: usize },

    /// Speed outside `[0, 1]`, or a speed cap outside `(0, 1]`
    #[error("speed {0} outside the drivable range")]
    SpeedOutOfRange(f64),

    /// The drive hardware refused a write
    #[error("driver failure: {0}")]
    Driver(#[from] DriverError),
}

/// The drive stage: one direction pin and one PWM channel per actuator.
pub struct ServoControllers {
    direction_pins: Vec<Pin>,
    i2c: I2c,
    channels: Vec<u8>,
    maximal_speed: f64,
}

impl ServoControllers {
    /// Take ownership of the drive hardware.
    ///
    /// `maximal_speed` caps every commanded speed and must lie in
    /// `(0, 1]`; direction pins and PWM channels pair up by index, and
    /// every channel id must exist on the bank.
    pub fn new(
        direction_pins: Vec<Pin>,
        mut i2c: I2c,
        channels: Vec<u8>,
        maximal_speed: f64,
    ) -> Result<Self, ServoError> {
        if direction_pins.len() != channels.len() {
            return Err(ServoError::ChannelCountMismatch {
                expected: channels.len(),
                got: direction_pins.len(),
            });
        }
        if !maximal_speed.is_finite() || maximal_speed <= 0.0 || maximal_speed > 1.0 {
            return Err(ServoError::SpeedOutOfRange(maximal_speed));
        }
        let available = i2c.pwm_mut().channel_count();
        if let Some(&channel) = channels.iter().find(|&&channel| channel >= available) {
            return Err(ServoError::Driver(DriverError::ChannelOutOfRange {
                channel,
                available,
            }));
        }
        Ok(Self {
            direction_pins,
            i2c,
            channels,
            maximal_speed,
        })
    }

    pub fn channel_count(&self) -> usize {
        self.channels.len()
    }

    pub fn maximal_speed(&self) -> f64 {
        self.maximal_speed
    }

    /// Drive every actuator: `true` extends, speeds in `[0, 1]` scale
    /// against the configured cap.
    ///
    /// The whole command is validated before any write. Directions are
    /// written before duties so an actuator never accelerates towards
    /// the old direction.
    pub fn run(&mut self, forwards: &[bool], speeds: &[f64]) -> Result<(), ServoError> {
        if forwards.len() != self.channels.len() {
            return Err(ServoError::ChannelCountMismatch {
                expected: self.channels.len(),
                got: forwards.len(),
            });
        }
        if speeds.len() != self.channels.len() {
            return Err(ServoError::ChannelCountMismatch {
                expected: self.channels.len(),
                got: speeds.len(),
            });
        }
        if let Some(&speed) = speeds.iter().find(|&&speed| !(0.0..=1.0).contains(&speed)) {
            return Err(ServoError::SpeedOutOfRange(speed));
        }

        for (pin, &forward) in self.direction_pins.iter_mut().zip(forwards) {
            pin.set(if forward { Level::High } else { Level::Low })?;
        }
        for (&channel, &speed) in self.channels.iter().zip(speeds) {
            self.i2c
                .pwm_mut()
                .set_duty(channel, speed * self.maximal_speed)?;
        }
        trace!(?speeds, "drive updated");
        Ok(())
    }

    /// Zero every duty cycle. Direction pins keep their last level.
    pub fn stop(&mut self) -> Result<(), ServoError> {
        for &channel in &self.channels {
            self.i2c.pwm_mut().set_duty(channel, 0.0)?;
        }
        trace!("drive stopped");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gpio::Gpio;
    use crate::hal::sim::{SimEvent, SimRig};

    const DIRECTION_PINS: [u8; 6] = [22, 5, 6, 13, 19, 26];

    fn servos_on(rig: &SimRig, maximal_speed: f64) -> ServoControllers {
        let gpio = Gpio::new(Box::new(rig.clone()));
        let pins = DIRECTION_PINS
            .iter()
            .map(|&pin| gpio.allocate_pin(pin).unwrap())
            .collect();
        ServoControllers::new(
            pins,
            gpio.allocate_i2c().unwrap(),
            vec![0, 1, 2, 3, 4, 5],
            maximal_speed,
        )
        .unwrap()
    }

    #[test]
    fn invalid_commands_touch_no_hardware() {
        let rig = SimRig::new();
        let mut servos = servos_on(&rig, 1.0);

        let mut speeds = [0.5; 6];
        speeds[2] = 1.5;
        assert!(matches!(
            servos.run(&[true; 6], &speeds),
            Err(ServoError::SpeedOutOfRange(_))
        ));

        speeds[2] = f64::NAN;
        assert!(servos.run(&[true; 6], &speeds).is_err());

        assert!(matches!(
            servos.run(&[true; 5], &[0.5; 6]),
            Err(ServoError::ChannelCountMismatch { expected: 6, got: 5 })
        ));

        assert!(rig.events().is_empty());
    }

    #[test]
    fn directions_are_written_before_duties() {
        let rig = SimRig::new();
        let mut servos = servos_on(&rig, 1.0);

        let forwards = [true, false, true, false, true, false];
        servos.run(&forwards, &[0.3; 6]).unwrap();

        let events = rig.events();
        let first_duty = events
            .iter()
            .position(|event| matches!(event, SimEvent::Duty { .. }))
            .unwrap();
        assert_eq!(first_duty, 6);
        assert!(events[..first_duty]
            .iter()
            .all(|event| matches!(event, SimEvent::Line { .. })));

        assert_eq!(rig.line_level(22), Level::High);
        assert_eq!(rig.line_level(5), Level::Low);
    }

    #[test]
    fn speeds_scale_against_the_cap() {
        let rig = SimRig::new();
        let mut servos = servos_on(&rig, 0.5);

        servos.run(&[true; 6], &[0.8; 6]).unwrap();
        assert!(rig.duties().iter().all(|duty| (duty - 0.4).abs() < 1e-9));
    }

    #[test]
    fn stop_zeroes_duties_and_keeps_directions() {
        let rig = SimRig::new();
        let mut servos = servos_on(&rig, 1.0);

        servos.run(&[true; 6], &[1.0; 6]).unwrap();
        servos.stop().unwrap();

        assert_eq!(rig.duties(), [0.0; 6]);
        assert_eq!(rig.line_level(22), Level::High);
    }

    #[test]
    fn construction_validates_counts_and_cap() {
        let rig = SimRig::new();
        let gpio = Gpio::new(Box::new(rig.clone()));
        let pins: Vec<Pin> = [22, 5, 6, 13, 19]
            .iter()
            .map(|&pin| gpio.allocate_pin(pin).unwrap())
            .collect();
        assert!(matches!(
            ServoControllers::new(
                pins,
                gpio.allocate_i2c().unwrap(),
                vec![0, 1, 2, 3, 4, 5],
                1.0
            ),
            Err(ServoError::ChannelCountMismatch { expected: 6, got: 5 })
        ));

        for cap in [0.0, 1.2, f64::NAN] {
            let rig = SimRig::new();
            let gpio = Gpio::new(Box::new(rig.clone()));
            assert!(matches!(
                ServoControllers::new(Vec::new(), gpio.allocate_i2c().unwrap(), Vec::new(), cap),
                Err(ServoError::SpeedOutOfRange(_))
            ));
        }
    }

    #[test]
    fn construction_rejects_channels_the_bank_does_not_have() {
        let rig = SimRig::new();
        let gpio = Gpio::new(Box::new(rig.clone()));
        let pins = DIRECTION_PINS
            .iter()
            .map(|&pin| gpio.allocate_pin(pin).unwrap())
            .collect();
        assert!(matches!(
            ServoControllers::new(
                pins,
                gpio.allocate_i2c().unwrap(),
                vec![0, 1, 2, 3, 4, 6],
                1.0
            ),
            Err(ServoError::Driver(DriverError::ChannelOutOfRange {
                channel: 6,
                available: 6
            }))
        ));
    }
}
