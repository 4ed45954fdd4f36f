//! Claim registry for the 26 general purpose I/O pins.
//!
//! Every pin and pin group is claimed exactly once. A claim hands out a
//! move-only handle carrying the matching hardware capability; dropping
//! the handle (or calling `release`) returns the underlying pins to the
//! pool. Handles hold only a weak reference to the registry, so they stay
//! valid even if the registry itself is dropped first.

use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;

use static_assertions::const_assert;
use thiserror::Error;
use tracing::debug;

use crate::hal::{AdcBus, DigitalLine, DriverError, IoProvider, Level, PwmBus, SerialLink};

/// Lowest addressable pin number.
pub const FIRST_PIN: u8 = 2;

/// Highest addressable pin number.
pub const LAST_PIN: u8 = 27;

const PIN_SLOTS: usize = (LAST_PIN - FIRST_PIN + 1) as usize;
const_assert!(PIN_SLOTS == 26);

// ─── Error Types ────────────────────────────────────────────────────

#[derive(Debug, Clone, Error)]
pub enum GpioError {
    /// Pin number outside the addressable window
    #[error("pin {0} outside the addressable range [2, 27]")]
    OutOfRange(u8),

    /// Pin already handed out and not yet released
    #[error("pin {0} is already claimed")]
    AlreadyClaimed(u8),

    /// A pin group could not be claimed as a whole
    #[error("cannot claim the {bus} pin group, pin {pin} is already claimed")]
    BusConflict { bus: &'static str, pin: u8 },

    /// The electrical back-end refused the claim
    #[error("driver failure: {0}")]
    Driver(#[from] DriverError),
}

// ─── Pin Groups ─────────────────────────────────────────────────────

/// The fixed function pin groups of the header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum BusKind {
    Spi,
    I2c,
    Uart,
}

impl BusKind {
    const fn pins(self) -> &'static [u8] {
        match self {
            BusKind::Spi => &[7, 8, 9, 10, 11],
            BusKind::I2c => &[2, 3],
            BusKind::Uart => &[14, 15],
        }
    }

    const fn label(self) -> &'static str {
        match self {
            BusKind::Spi => "SPI",
            BusKind::I2c => "I2C",
            BusKind::Uart => "UART",
        }
    }
}

fn slot_index(pin: u8) -> Result<usize, GpioError> {
    if (FIRST_PIN..=LAST_PIN).contains(&pin) {
        Ok((pin - FIRST_PIN) as usize)
    } else {
        Err(GpioError::OutOfRange(pin))
    }
}

// ─── Registry ───────────────────────────────────────────────────────

struct GpioInner {
    claims: Mutex<[bool; PIN_SLOTS]>,
    provider: Box<dyn IoProvider>,
}

impl GpioInner {
    /// Only called with pins that went through `slot_index` when claimed.
    fn release_slots(&self, pins: &[u8]) {
        let mut claims = self.claims.lock().unwrap();
        for &pin in pins {
            claims[(pin - FIRST_PIN) as usize] = false;
        }
    }
}

/// Shared claim registry. Clones refer to the same pool.
#[derive(Clone)]
pub struct Gpio {
    inner: Arc<GpioInner>,
}

impl Gpio {
    pub fn new(provider: Box<dyn IoProvider>) -> Self {
        debug!(provider = provider.name(), "claim registry ready");
        Self {
            inner: Arc::new(GpioInner {
                claims: Mutex::new([false; PIN_SLOTS]),
                provider,
            }),
        }
    }

    /// Claim a single digital pin.
    pub fn allocate_pin(&self, number: u8) -> Result<Pin, GpioError> {
        let slot = slot_index(number)?;
        {
            let mut claims = self.inner.claims.lock().unwrap();
            if claims[slot] {
                return Err(GpioError::AlreadyClaimed(number));
            }
            claims[slot] = true;
        }
        // The provider runs outside the claims lock; undo on failure.
        match self.inner.provider.line(number) {
            Ok(line) => {
                debug!(pin = number, "pin claimed");
                Ok(Pin {
                    number,
                    line,
                    owner: Arc::downgrade(&self.inner),
                    released: false,
                })
            }
            Err(err) => {
                self.inner.release_slots(&[number]);
                Err(GpioError::Driver(err))
            }
        }
    }

    /// Claim the SPI pin group and open the converter behind it.
    pub fn allocate_spi(&self) -> Result<Spi, GpioError> {
        self.claim_bus(BusKind::Spi)?;
        match self.inner.provider.adc() {
            Ok(adc) => Ok(Spi {
                adc,
                owner: Arc::downgrade(&self.inner),
                released: false,
            }),
            Err(err) => {
                self.inner.release_slots(BusKind::Spi.pins());
                Err(GpioError::Driver(err))
            }
        }
    }

    /// Claim the I2C pin group and open the PWM bank behind it.
    pub fn allocate_i2c(&self) -> Result<I2c, GpioError> {
        self.claim_bus(BusKind::I2c)?;
        match self.inner.provider.pwm() {
            Ok(pwm) => Ok(I2c {
                pwm,
                owner: Arc::downgrade(&self.inner),
                released: false,
            }),
            Err(err) => {
                self.inner.release_slots(BusKind::I2c.pins());
                Err(GpioError::Driver(err))
            }
        }
    }

    /// Claim the UART pin group and open the serial device behind it.
    pub fn allocate_uart(&self) -> Result<Uart, GpioError> {
        self.claim_bus(BusKind::Uart)?;
        match self.inner.provider.serial() {
            Ok(link) => Ok(Uart {
                link,
                owner: Arc::downgrade(&self.inner),
                released: false,
            }),
            Err(err) => {
                self.inner.release_slots(BusKind::Uart.pins());
                Err(GpioError::Driver(err))
            }
        }
    }

    /// Claim every pin of a group, or none of them.
    fn claim_bus(&self, bus: BusKind) -> Result<(), GpioError> {
        let mut claims = self.inner.claims.lock().unwrap();
        if let Some(&pin) = bus
            .pins()
            .iter()
            .find(|&&pin| claims[(pin - FIRST_PIN) as usize])
        {
            return Err(GpioError::BusConflict {
                bus: bus.label(),
                pin,
            });
        }
        for &pin in bus.pins() {
            claims[(pin - FIRST_PIN) as usize] = true;
        }
        debug!(bus = bus.label(), "pin group claimed");
        Ok(())
    }
}

// ─── Claim Handles ──────────────────────────────────────────────────

/// Exclusive handle on one digital pin.
pub struct Pin {
    number: u8,
    line: Box<dyn DigitalLine>,
    owner: Weak<GpioInner>,
    released: bool,
}

impl Pin {
    pub fn number(&self) -> u8 {
        self.number
    }

    pub fn set(&mut self, level: Level) -> Result<(), DriverError> {
        self.line.set(level)
    }

    pub fn read(&mut self) -> Result<Level, DriverError> {
        self.line.read()
    }

    /// Wait for one High pulse and return its width, `None` on timeout.
    pub fn wait_for_pulse(&mut self, timeout: Duration) -> Result<Option<Duration>, DriverError> {
        self.line.wait_for_pulse(timeout)
    }

    /// Return the pin to the pool. Safe to call more than once.
    pub fn release(&mut self) {
        if self.released {
            return;
        }
        self.released = true;
        if let Some(owner) = self.owner.upgrade() {
            owner.release_slots(&[self.number]);
            debug!(pin = self.number, "pin released");
        }
    }
}

impl Drop for Pin {
    fn drop(&mut self) {
        self.release();
    }
}

/// Exclusive handle on the SPI pin group with its converter.
pub struct Spi {
    adc: Box<dyn AdcBus>,
    owner: Weak<GpioInner>,
    released: bool,
}

impl Spi {
    pub fn adc_mut(&mut self) -> &mut dyn AdcBus {
        self.adc.as_mut()
    }

    /// Return the whole pin group to the pool. Safe to call more than once.
    pub fn release(&mut self) {
        if self.released {
            return;
        }
        self.released = true;
        if let Some(owner) = self.owner.upgrade() {
            owner.release_slots(BusKind::Spi.pins());
        }
    }
}

impl Drop for Spi {
    fn drop(&mut self) {
        self.release();
    }
}

/// Exclusive handle on the I2C pin group with its PWM bank.
pub struct I2c {
    pwm: Box<dyn PwmBus>,
    owner: Weak<GpioInner>,
    released: bool,
}

impl I2c {
    pub fn pwm_mut(&mut self) -> &mut dyn PwmBus {
        self.pwm.as_mut()
    }

    /// Return the whole pin group to the pool. Safe to call more than once.
    pub fn release(&mut self) {
        if self.released {
            return;
        }
        self.released = true;
        if let Some(owner) = self.owner.upgrade() {
            owner.release_slots(BusKind::I2c.pins());
        }
    }
}

impl Drop for I2c {
    fn drop(&mut self) {
        self.release();
    }
}

/// Exclusive handle on the UART pin group with its serial device.
pub struct Uart {
    link: Box<dyn SerialLink>,
    owner: Weak<GpioInner>,
    released: bool,
}

impl Uart {
    pub fn link_mut(&mut self) -> &mut dyn SerialLink {
        self.link.as_mut()
    }

    /// Return the whole pin group to the pool. Safe to call more than once.
    pub fn release(&mut self) {
        if self.released {
            return;
        }
        self.released = true;
        if let Some(owner) = self.owner.upgrade() {
            owner.release_slots(BusKind::Uart.pins());
        }
    }
}

impl Drop for Uart {
    fn drop(&mut self) {
        self.release();
    }
}

#[cfg(test)]
mod tests {
    use std::thread;

    use super::*;
    use crate::hal::sim::SimRig;

    fn registry() -> Gpio {
        Gpio::new(Box::new(SimRig::new()))
    }

    #[test]
    fn claim_release_claim_cycle() {
        let gpio = registry();

        let mut first = gpio.allocate_pin(5).unwrap();
        assert_eq!(first.number(), 5);
        assert!(matches!(
            gpio.allocate_pin(5),
            Err(GpioError::AlreadyClaimed(5))
        ));

        first.release();
        first.release(); // idempotent
        let _again = gpio.allocate_pin(5).unwrap();
    }

    #[test]
    fn boundary_pins_are_addressable() {
        let gpio = registry();
        assert!(gpio.allocate_pin(FIRST_PIN).is_ok());
        assert!(gpio.allocate_pin(LAST_PIN).is_ok());
        assert!(matches!(
            gpio.allocate_pin(1),
            Err(GpioError::OutOfRange(1))
        ));
        assert!(matches!(
            gpio.allocate_pin(28),
            Err(GpioError::OutOfRange(28))
        ));
    }

    #[test]
    fn dropping_a_handle_frees_its_pin() {
        let gpio = registry();
        {
            let _pin = gpio.allocate_pin(17).unwrap();
        }
        assert!(gpio.allocate_pin(17).is_ok());
    }

    #[test]
    fn bus_claim_is_all_or_nothing() {
        let gpio = registry();
        let _blocker = gpio.allocate_pin(9).unwrap();

        match gpio.allocate_spi() {
            Err(GpioError::BusConflict { bus: "SPI", pin: 9 }) => {}
            other => panic!("expected SPI conflict on pin 9, got {:?}", other.err()),
        }

        // The failed group claim must not have taken any sibling pin.
        let seven = gpio.allocate_pin(7).unwrap();
        drop(seven);

        // _blocker still holds 9, so the group stays refused.
        assert!(matches!(
            gpio.allocate_pin(9),
            Err(GpioError::AlreadyClaimed(9))
        ));
        assert!(gpio.allocate_spi().is_err());
    }

    #[test]
    fn second_bus_claim_leaves_the_first_intact() {
        let gpio = registry();
        let mut bank = gpio.allocate_i2c().unwrap();
        assert!(matches!(
            gpio.allocate_i2c(),
            Err(GpioError::BusConflict { bus: "I2C", .. })
        ));
        bank.pwm_mut().set_duty(0, 0.5).unwrap();
    }

    #[test]
    fn releasing_a_bus_frees_exactly_its_pins() {
        let gpio = registry();
        let mut uart = gpio.allocate_uart().unwrap();
        uart.release();

        // Keep the reclaimed pins alive, a dropped handle frees its slot.
        let _pin14 = gpio.allocate_pin(14).unwrap();
        let _pin15 = gpio.allocate_pin(15).unwrap();
        assert!(matches!(
            gpio.allocate_uart(),
            Err(GpioError::BusConflict { bus: "UART", .. })
        ));
    }

    #[test]
    fn spi_handle_reads_the_converter() {
        let rig = SimRig::new();
        let gpio = Gpio::new(Box::new(rig.clone()));
        let mut spi = gpio.allocate_spi().unwrap();
        let sample = spi.adc_mut().sample(0).unwrap();
        assert!((sample - 0.4).abs() < 1e-9);
    }

    #[test]
    fn handles_outlive_the_registry() {
        let gpio = registry();
        let mut pin = gpio.allocate_pin(21).unwrap();
        drop(gpio);
        pin.set(Level::High).unwrap();
        pin.release();
    }

    #[test]
    fn concurrent_claims_have_one_winner() {
        let gpio = registry();
        let results: Vec<Result<Pin, GpioError>> = thread::scope(|scope| {
            let handles: Vec<_> = (0..8)
                .map(|_| {
                    let gpio = gpio.clone();
                    scope.spawn(move || gpio.allocate_pin(21))
                })
                .collect();
            handles
                .into_iter()
                .map(|handle| handle.join().unwrap())
                .collect()
        });

        let winners = results.iter().filter(|result| result.is_ok()).count();
        assert_eq!(winners, 1);
        assert!(results
            .iter()
            .filter(|result| result.is_err())
            .all(|result| matches!(result, Err(GpioError::AlreadyClaimed(21)))));
    }
}
