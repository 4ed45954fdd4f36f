//! Ultrasonic distance sensing over single-wire echo modules.
//!
//! Each module shares trigger and echo on one pin: a 10 microsecond
//! High pulse fires the burst, then the module answers with a High pulse
//! whose width encodes the round-trip time. Distances are reported in
//! centimetres; a sensor that stays silent past the timeout reports NaN
//! for that reading instead of failing the whole frame.

use std::thread;
use std::time::Duration;

use tracing::debug;

use super::{SensorError, SensorSource, Sensors};
use crate::gpio::Pin;
use crate::hal::Level;

/// Width of the trigger pulse.
const TRIGGER_PULSE: Duration = Duration::from_micros(10);

/// Longest echo worth waiting for, round trips beyond this report NaN.
const ECHO_TIMEOUT: Duration = Duration::from_millis(250);

/// Round-trip microseconds per centimetre of distance.
const MICROS_PER_CENTIMETRE: f64 = 58.0;

/// Echo modules, one claimed pin each.
pub struct EchoSource {
    pins: Vec<Pin>,
}

impl SensorSource for EchoSource {
    fn channel_count(&self) -> usize {
        self.pins.len()
    }

    fn read_raw(&mut self) -> Result<Vec<f64>, SensorError> {
        let mut frame = Vec::with_capacity(self.pins.len());
        for pin in &mut self.pins {
            pin.set(Level::High)?;
            thread::sleep(TRIGGER_PULSE);
            pin.set(Level::Low)?;
            match pin.wait_for_pulse(ECHO_TIMEOUT)? {
                Some(width) => {
                    frame.push(width.as_secs_f64() * 1e6 / MICROS_PER_CENTIMETRE);
                }
                None => {
                    debug!(pin = pin.number(), "no echo before timeout");
                    frame.push(f64::NAN);
                }
            }
        }
        Ok(frame)
    }
}

/// Distance sensors of one rig, readings in centimetres.
pub type DistanceSensors = Sensors<EchoSource>;

impl Sensors<EchoSource> {
    /// Drive the given claimed pins as echo modules.
    ///
    /// All trigger lines are parked Low before the first measurement.
    pub fn from_pins(
        mut pins: Vec<Pin>,
        minimal: f64,
        maximal: f64,
    ) -> Result<Self, SensorError> {
        for pin in &mut pins {
            pin.set(Level::Low)?;
        }
        Sensors::new(EchoSource { pins }, minimal, maximal)
    }
}
