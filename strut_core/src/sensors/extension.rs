//! Actuator extension sensing over the SPI analog converter.
//!
//! Each actuator carries a potentiometer wired to one converter channel.
//! The converter already normalises to `[0, 1]`; calibration against the
//! mechanical stroke happens through correction tables.

use super::{SensorError, SensorSource, Sensors};
use crate::gpio::Spi;

/// Potentiometer bank behind the SPI pin group.
pub struct AnalogSource {
    spi: Spi,
    channels: Vec<u8>,
}

impl SensorSource for AnalogSource {
    fn channel_count(&self) -> usize {
        self.channels.len()
    }

    fn read_raw(&mut self) -> Result<Vec<f64>, SensorError> {
        let mut frame = Vec::with_capacity(self.channels.len());
        for &channel in &self.channels {
            frame.push(self.spi.adc_mut().sample(channel)?);
        }
        Ok(frame)
    }
}

/// Extension sensors of one rig, one converter channel per actuator.
pub type ExtensionSensors = Sensors<AnalogSource>;

impl Sensors<AnalogSource> {
    /// Read the given converter channels through a claimed SPI group.
    pub fn from_spi(
        spi: Spi,
        channels: Vec<u8>,
        minimal: f64,
        maximal: f64,
    ) -> Result<Self, SensorError> {
        Sensors::new(AnalogSource { spi, channels }, minimal, maximal)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gpio::Gpio;
    use crate::hal::sim::SimRig;
    use crate::sensors::Correction;

    #[test]
    fn reads_one_value_per_channel() {
        let rig = SimRig::new();
        let gpio = Gpio::new(Box::new(rig.clone()));
        let spi = gpio.allocate_spi().unwrap();
        let sensors = ExtensionSensors::from_spi(spi, vec![0, 1, 2, 3, 4, 5], 0.0, 1.0).unwrap();

        let values = sensors.measure().unwrap();
        assert_eq!(values.len(), 6);
        assert!(values.iter().all(|value| (value - 0.4).abs() < 1e-9));
    }

    #[test]
    fn channel_list_selects_converter_inputs() {
        let rig = SimRig::new();
        rig.set_extensions([0.1, 0.2, 0.3, 0.4, 0.5, 0.6]);
        let gpio = Gpio::new(Box::new(rig.clone()));
        let spi = gpio.allocate_spi().unwrap();
        let sensors = ExtensionSensors::from_spi(spi, vec![4, 1], 0.0, 1.0).unwrap();

        let values = sensors.measure().unwrap();
        assert!((values[0] - 0.5).abs() < 1e-9);
        assert!((values[1] - 0.2).abs() < 1e-9);
    }

    #[test]
    fn correction_tables_calibrate_the_stroke() {
        let rig = SimRig::new();
        rig.set_extensions([0.8; 6]);
        let gpio = Gpio::new(Box::new(rig.clone()));
        let spi = gpio.allocate_spi().unwrap();
        let mut sensors = ExtensionSensors::from_spi(spi, vec![0], 0.0, 1.0).unwrap();
        sensors
            .set_corrections(vec![Correction::Table(vec![[0.0, 0.0], [1.0, 2.0]])])
            .unwrap();

        assert!((sensors.measure().unwrap()[0] - 1.6).abs() < 1e-9);
    }
}
