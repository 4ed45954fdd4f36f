//! Strut Core Library
//!
//! Motion control stack for a six-legged parallel manipulator (6-6 Stewart
//! platform) driven from a Linux single-board computer: claim-based GPIO
//! access, a shared sensor pipeline with background sampling, closed-loop
//! actuator seeks and the platform kinematics on top.
//!
//! # Module Structure
//!
//! - [`gpio`] - Pin and bus claim registry with RAII release handles
//! - [`hal`] - Hardware collaborator traits, simulated rig, serial backend
//! - [`sensors`] - Generic measurement pipeline and the sensor families
//! - [`servo`] - Direction-line plus PWM motor fan-out
//! - [`actuators`] - Cancellable closed-loop extension control
//! - [`kinematics`] - Rotation and trilateration primitives
//! - [`platform`] - The assembled Stewart platform
//! - [`config`] - TOML rig description
//!
//! # Usage
//!
//! ```rust,no_run
//! use strut_core::config::RigConfig;
//! use strut_core::gpio::Gpio;
//! use strut_core::hal::sim::SimRig;
//!
//! let config = RigConfig::default();
//! let gpio = Gpio::new(Box::new(SimRig::new()));
//! let spi = gpio.allocate_spi().unwrap();
//! # let _ = (config, spi);
//! ```

pub mod actuators;
pub mod config;
pub mod gpio;
pub mod hal;
pub mod kinematics;
pub mod platform;
pub mod sensors;
pub mod servo;

pub use actuators::{ActuatorError, LinearActuators, SeekStatus};
pub use gpio::{Gpio, GpioError, Pin};
pub use platform::{Pose, PoseOutcome, StewartPlatform};
