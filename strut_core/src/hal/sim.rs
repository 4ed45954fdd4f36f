//! Software rig for development and testing without hardware.
//!
//! [`SimRig`] implements [`IoProvider`] on top of a shared in-memory state.
//! Actuator physics are integrated lazily: every capability call first
//! advances the six extensions by the elapsed wall-clock time, so a test
//! that drives a duty cycle and sleeps observes realistic motion without
//! a dedicated physics thread.

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use tracing::trace;

use super::{AdcBus, DigitalLine, DriverError, IoProvider, Level, PwmBus, SerialLink};

/// Channels served by the simulated ADC and PWM bank.
pub const SIM_CHANNELS: u8 = 6;

/// Extension change per second at full duty, as a fraction of full stroke.
pub const FULL_SCALE_SPEED: f64 = 0.5;

/// One observable side effect, in the order it happened.
#[derive(Debug, Clone, PartialEq)]
pub enum SimEvent {
    /// A digital line was driven.
    Line { pin: u8, level: Level },
    /// A PWM duty cycle was written.
    Duty { channel: u8, duty: f64 },
}

// ─── Shared State ───────────────────────────────────────────────────

struct SimState {
    extensions: [f64; SIM_CHANNELS as usize],
    duties: [f64; SIM_CHANNELS as usize],
    line_levels: HashMap<u8, Level>,
    direction_pins: [u8; SIM_CHANNELS as usize],
    attitude_degrees: [f64; 3],
    scripted_lines: VecDeque<String>,
    serial_writes: Vec<Vec<u8>>,
    pulse_widths: HashMap<u8, Option<Duration>>,
    events: Vec<SimEvent>,
    last_tick: Instant,
}

impl SimState {
    fn new() -> Self {
        Self {
            extensions: [0.4; SIM_CHANNELS as usize],
            duties: [0.0; SIM_CHANNELS as usize],
            line_levels: HashMap::new(),
            direction_pins: [22, 5, 6, 13, 19, 26],
            attitude_degrees: [0.0; 3],
            scripted_lines: VecDeque::new(),
            serial_writes: Vec::new(),
            pulse_widths: HashMap::new(),
            events: Vec::new(),
            last_tick: Instant::now(),
        }
    }

    /// Advance the actuator physics by the elapsed wall-clock time.
    ///
    /// An actuator with a non-zero duty moves at `duty * FULL_SCALE_SPEED`
    /// per second, extending while its direction line is High and
    /// retracting while it is Low. Extensions saturate at the stroke ends.
    fn integrate(&mut self) {
        let now = Instant::now();
        let dt = now.duration_since(self.last_tick).as_secs_f64();
        self.last_tick = now;
        if dt <= 0.0 {
            return;
        }

        for channel in 0..SIM_CHANNELS as usize {
            let duty = self.duties[channel];
            if duty <= 0.0 {
                continue;
            }
            let pin = self.direction_pins[channel];
            let sign = match self.line_levels.get(&pin).copied().unwrap_or(Level::Low) {
                Level::High => 1.0,
                Level::Low => -1.0,
            };
            let moved = sign * duty * FULL_SCALE_SPEED * dt;
            let next = (self.extensions[channel] + moved).clamp(0.0, 1.0);
            trace!(channel, duty, from = self.extensions[channel], to = next, "sim step");
            self.extensions[channel] = next;
        }
    }
}

// ─── SimRig ─────────────────────────────────────────────────────────

/// In-memory rig shared between the provider and its test harness.
///
/// Cloning yields another handle onto the same state, so a test can keep
/// one clone for scripting and assertions while the registry owns the
/// other.
#[derive(Clone)]
pub struct SimRig {
    state: Arc<Mutex<SimState>>,
}

impl SimRig {
    pub fn new() -> Self {
        Self {
            state: Arc::new(Mutex::new(SimState::new())),
        }
    }

    /// Current extension of one actuator channel.
    pub fn extension(&self, channel: usize) -> f64 {
        let mut state = self.state.lock().unwrap();
        state.integrate();
        state.extensions[channel]
    }

    /// Teleport all actuators to the given extensions.
    pub fn set_extensions(&self, extensions: [f64; SIM_CHANNELS as usize]) {
        let mut state = self.state.lock().unwrap();
        state.integrate();
        state.extensions = extensions;
    }

    /// Attitude reported by the synthesised serial stream, in degrees.
    pub fn set_attitude_degrees(&self, degrees: [f64; 3]) {
        self.state.lock().unwrap().attitude_degrees = degrees;
    }

    /// Queue one line for the serial reader ahead of the synthesised feed.
    pub fn push_serial_line(&self, line: &str) {
        self.state
            .lock()
            .unwrap()
            .scripted_lines
            .push_back(line.to_string());
    }

    /// Everything written to the serial device so far.
    pub fn serial_writes(&self) -> Vec<Vec<u8>> {
        self.state.lock().unwrap().serial_writes.clone()
    }

    /// Script the pulse width measured on a pin. `None` means no pulse
    /// arrives and a waiting reader times out.
    pub fn set_pulse_width(&self, pin: u8, width: Option<Duration>) {
        self.state.lock().unwrap().pulse_widths.insert(pin, width);
    }

    /// All line and duty writes, in order.
    pub fn events(&self) -> Vec<SimEvent> {
        self.state.lock().unwrap().events.clone()
    }

    /// Current duty cycles of the PWM bank.
    pub fn duties(&self) -> [f64; SIM_CHANNELS as usize] {
        let mut state = self.state.lock().unwrap();
        state.integrate();
        state.duties
    }

    /// Last level driven onto a pin, Low if it was never written.
    pub fn line_level(&self, pin: u8) -> Level {
        self.state
            .lock()
            .unwrap()
            .line_levels
            .get(&pin)
            .copied()
            .unwrap_or(Level::Low)
    }

    /// Rewire which pin steers which actuator channel.
    pub fn set_direction_pins(&self, pins: [u8; SIM_CHANNELS as usize]) {
        let mut state = self.state.lock().unwrap();
        state.integrate();
        state.direction_pins = pins;
    }
}

impl Default for SimRig {
    fn default() -> Self {
        Self::new()
    }
}

impl IoProvider for SimRig {
    fn name(&self) -> &'static str {
        "sim"
    }

    fn line(&self, number: u8) -> Result<Box<dyn DigitalLine>, DriverError> {
        Ok(Box::new(SimLine {
            pin: number,
            state: Arc::clone(&self.state),
        }))
    }

    fn adc(&self) -> Result<Box<dyn AdcBus>, DriverError> {
        Ok(Box::new(SimAdc {
            state: Arc::clone(&self.state),
        }))
    }

    fn pwm(&self) -> Result<Box<dyn PwmBus>, DriverError> {
        Ok(Box::new(SimPwm {
            state: Arc::clone(&self.state),
        }))
    }

    fn serial(&self) -> Result<Box<dyn SerialLink>, DriverError> {
        Ok(Box::new(SimSerial {
            state: Arc::clone(&self.state),
        }))
    }
}

// ─── Capabilities ───────────────────────────────────────────────────

struct SimLine {
    pin: u8,
    state: Arc<Mutex<SimState>>,
}

impl DigitalLine for SimLine {
    fn set(&mut self, level: Level) -> Result<(), DriverError> {
        let mut state = self.state.lock().unwrap();
        state.integrate();
        state.line_levels.insert(self.pin, level);
        state.events.push(SimEvent::Line {
            pin: self.pin,
            level,
        });
        Ok(())
    }

    fn read(&mut self) -> Result<Level, DriverError> {
        let state = self.state.lock().unwrap();
        Ok(state.line_levels.get(&self.pin).copied().unwrap_or(Level::Low))
    }

    fn wait_for_pulse(&mut self, _timeout: Duration) -> Result<Option<Duration>, DriverError> {
        let state = self.state.lock().unwrap();
        Ok(state.pulse_widths.get(&self.pin).copied().flatten())
    }
}

struct SimAdc {
    state: Arc<Mutex<SimState>>,
}

impl AdcBus for SimAdc {
    fn channel_count(&self) -> u8 {
        SIM_CHANNELS
    }

    fn sample(&mut self, channel: u8) -> Result<f64, DriverError> {
        if channel >= SIM_CHANNELS {
            return Err(DriverError::ChannelOutOfRange {
                channel,
                available: SIM_CHANNELS,
            });
        }
        let mut state = self.state.lock().unwrap();
        state.integrate();
        Ok(state.extensions[channel as usize])
    }
}

struct SimPwm {
    state: Arc<Mutex<SimState>>,
}

impl PwmBus for SimPwm {
    fn channel_count(&self) -> u8 {
        SIM_CHANNELS
    }

    fn set_duty(&mut self, channel: u8, duty: f64) -> Result<(), DriverError> {
        if channel >= SIM_CHANNELS {
            return Err(DriverError::ChannelOutOfRange {
                channel,
                available: SIM_CHANNELS,
            });
        }
        let mut state = self.state.lock().unwrap();
        state.integrate();
        state.duties[channel as usize] = duty;
        state.events.push(SimEvent::Duty { channel, duty });
        Ok(())
    }
}

struct SimSerial {
    state: Arc<Mutex<SimState>>,
}

impl SerialLink for SimSerial {
    fn read_line(&mut self) -> Result<String, DriverError> {
        let mut state = self.state.lock().unwrap();
        if let Some(line) = state.scripted_lines.pop_front() {
            return Ok(line);
        }
        let [roll, pitch, yaw] = state.attitude_degrees;
        Ok(format!("#RPY={roll:.3},{pitch:.3},{yaw:.3}\n"))
    }

    fn write_all(&mut self, bytes: &[u8]) -> Result<(), DriverError> {
        self.state.lock().unwrap().serial_writes.push(bytes.to_vec());
        Ok(())
    }
}
