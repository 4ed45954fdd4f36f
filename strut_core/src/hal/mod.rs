//! Hardware collaborator traits and error types.
//!
//! This module defines:
//! - `IoProvider` trait - Factory for the electrical back-end of one rig
//! - `DigitalLine`, `AdcBus`, `PwmBus`, `SerialLink` traits - Per-claim capabilities
//! - `DriverError` enum - Error type shared by all collaborator operations
//!
//! The registry in [`crate::gpio`] owns an `IoProvider` and attaches one
//! capability object to every claim it hands out. Swapping the provider
//! swaps the whole electrical layer; [`sim`] backs everything with a
//! software rig, [`serial`] provides the real UART device.

pub mod serial;
pub mod sim;

use std::time::Duration;

use thiserror::Error;

/// Error type for hardware collaborator operations.
#[derive(Debug, Clone, Error)]
pub enum DriverError {
    /// Device level I/O failure
    #[error("I/O failure on {device}: {detail}")]
    Io { device: String, detail: String },

    /// Channel index beyond what the device offers
    #[error("channel {channel} out of range, device has {available}")]
    ChannelOutOfRange { channel: u8, available: u8 },

    /// Device did not answer in time
    #[error("device not responding: {0}")]
    NotResponding(String),
}

/// Logic level of a digital line.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Level {
    Low,
    High,
}

/// A single claimed digital I/O line.
pub trait DigitalLine: Send {
    /// Drive the line to the given level.
    fn set(&mut self, level: Level) -> Result<(), DriverError>;

    /// Read the current level of the line.
    fn read(&mut self) -> Result<Level, DriverError>;

    /// Block until the line completes one High pulse and return its width.
    ///
    /// `Ok(None)` means no pulse finished within `timeout`; the call never
    /// blocks longer than that.
    fn wait_for_pulse(&mut self, timeout: Duration) -> Result<Option<Duration>, DriverError>;
}

/// Analog-to-digital converter behind the SPI pin group.
pub trait AdcBus: Send {
    /// Number of usable converter channels.
    fn channel_count(&self) -> u8;

    /// Sample one channel, normalised to `[0, 1]`.
    fn sample(&mut self, channel: u8) -> Result<f64, DriverError>;
}

/// PWM motor-driver bank behind the I2C pin group.
pub trait PwmBus: Send {
    /// Number of usable PWM channels.
    fn channel_count(&self) -> u8;

    /// Set the duty cycle of one channel, `duty` in `[0, 1]`.
    fn set_duty(&mut self, channel: u8, duty: f64) -> Result<(), DriverError>;
}

/// Line-oriented serial device behind the UART pin group.
pub trait SerialLink: Send {
    /// Read one newline-terminated line, terminator included.
    fn read_line(&mut self) -> Result<String, DriverError>;

    /// Write raw bytes to the device.
    fn write_all(&mut self, bytes: &[u8]) -> Result<(), DriverError>;
}

/// Factory for the electrical back-end. One provider serves a whole rig.
///
/// Implementations must be cheap to call concurrently; the registry invokes
/// them while holding no lock.
pub trait IoProvider: Send + Sync {
    /// Back-end identifier (e.g. "sim", "bcm2835").
    fn name(&self) -> &'static str;

    /// Open the digital line with the given BCM number.
    fn line(&self, number: u8) -> Result<Box<dyn DigitalLine>, DriverError>;

    /// Open the ADC behind the SPI pin group.
    fn adc(&self) -> Result<Box<dyn AdcBus>, DriverError>;

    /// Open the PWM bank behind the I2C pin group.
    fn pwm(&self) -> Result<Box<dyn PwmBus>, DriverError>;

    /// Open the serial device behind the UART pin group.
    fn serial(&self) -> Result<Box<dyn SerialLink>, DriverError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn driver_error_display() {
        let err = DriverError::Io {
            device: "/dev/ttyAMA0".to_string(),
            detail: "permission denied".to_string(),
        };
        assert!(err.to_string().contains("/dev/ttyAMA0"));

        let err = DriverError::ChannelOutOfRange {
            channel: 9,
            available: 6,
        };
        assert!(err.to_string().contains('9'));
    }
}
