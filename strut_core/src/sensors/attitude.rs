//! Effector attitude sensing over the serial stream.
//!
//! The inertial unit on the effector plate streams lines of the form
//! `#RPY=<roll>,<pitch>,<yaw>` with angles in degrees. The stream is
//! free-running, so a reader may join mid-line or hit status chatter;
//! unparsable lines are discarded up to a retry budget. Measurements are
//! reported in radians.

use std::f64::consts::PI;

use tracing::debug;

use super::{SensorError, SensorSource, Sensors};
use crate::gpio::Uart;

/// Unparsable lines tolerated per reading before giving up.
const PARSE_RETRY_BUDGET: usize = 32;

/// Command that re-zeroes the inertial unit.
const RESET_COMMAND: &[u8] = b"#r";

/// Parse one stream line into its three angle fields, in degrees.
///
/// The prefix before `=` is ignored; the payload must hold exactly three
/// comma separated numbers.
fn parse_attitude(line: &str) -> Option<[f64; 3]> {
    let (_, payload) = line.rsplit_once('=')?;
    let mut fields = payload.trim().split(',');
    let first = fields.next()?.trim().parse().ok()?;
    let second = fields.next()?.trim().parse().ok()?;
    let third = fields.next()?.trim().parse().ok()?;
    if fields.next().is_some() {
        return None;
    }
    Some([first, second, third])
}

/// Inertial unit behind the UART pin group.
pub struct AttitudeSource {
    uart: Uart,
}

impl SensorSource for AttitudeSource {
    fn channel_count(&self) -> usize {
        3
    }

    fn read_raw(&mut self) -> Result<Vec<f64>, SensorError> {
        for _ in 0..PARSE_RETRY_BUDGET {
            let line = self.uart.link_mut().read_line()?;
            match parse_attitude(&line) {
                Some(degrees) => {
                    return Ok(degrees.iter().map(|value| value.to_radians()).collect());
                }
                None => debug!(line = line.trim(), "discarding unparsable attitude line"),
            }
        }
        Err(SensorError::Protocol(format!(
            "no parsable attitude line in {PARSE_RETRY_BUDGET} reads"
        )))
    }
}

/// Attitude sensors of one rig: roll, pitch and yaw in radians.
pub type AttitudeSensors = Sensors<AttitudeSource>;

impl Sensors<AttitudeSource> {
    /// Read the inertial unit through a claimed UART group.
    pub fn from_uart(uart: Uart) -> Result<Self, SensorError> {
        Sensors::new(AttitudeSource { uart }, -PI, PI)
    }

    /// Re-zero the inertial unit at its current orientation.
    pub fn reset(&self) -> Result<(), SensorError> {
        self.with_source(|source| Ok(source.uart.link_mut().write_all(RESET_COMMAND)?))
    }
}
