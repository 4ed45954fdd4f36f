//! Pose-level control of the six-actuator platform.
//!
//! [`StewartPlatform`] couples the actuator stage with the attitude
//! sensors and the rig geometry. Inverse kinematics turns a requested
//! pose into six extension targets; forward kinematics reconstructs the
//! effector position from measured extensions and attitude by
//! trilateration over the first three actuators.

use glam::DVec3;
use thiserror::Error;
use tracing::{debug, info};

use crate::actuators::{ActuatorError, LinearActuators, SeekStatus};
use crate::kinematics::{GeometryError, rotation_matrix, trilaterate};
use crate::sensors::SensorError;
use crate::sensors::attitude::AttitudeSensors;
use std::time::Duration;

/// Actuators of a hexapod platform.
pub const ACTUATOR_COUNT: usize = 6;

const ATTITUDE_CHANNELS: usize = 3;

#[derive(Debug, Clone, Error)]
pub enum PlatformError {
    /// The actuator stage does not have six channels
    #[error("expected 6 actuator channels, got {0}")]
    ActuatorCountMismatch(usize),

    /// The attitude sensors do not report three angles
    #[error("expected 3 attitude channels, got {0}")]
    AttitudeCountMismatch(usize),

    /// The rig geometry is inconsistent
    #[error("invalid geometry: {0}")]
    InvalidGeometry(String),

    /// A requested pose contains NaN or infinite components
    #[error("pose components must be finite")]
    NonFinitePose,

    #[error(transparent)]
    Geometry(#[from] GeometryError),

    #[error(transparent)]
    Actuator(#[from] ActuatorError),

    #[error(transparent)]
    Sensor(#[from] SensorError),
}

/// Fixed mechanical layout of one rig.
///
/// Base joints are in base coordinates, effector joints relative to the
/// effector plate centre. The allowed extension bands describe what each
/// actuator may be asked to do, which can be tighter than its stroke.
#[derive(Debug, Clone)]
pub struct PlatformGeometry {
    pub base_joints: [DVec3; ACTUATOR_COUNT],
    pub effector_joints: [DVec3; ACTUATOR_COUNT],
    pub minimal_allowed_extension: [f64; ACTUATOR_COUNT],
    pub maximal_allowed_extension: [f64; ACTUATOR_COUNT],
}

impl PlatformGeometry {
    pub fn validate(&self) -> Result<(), PlatformError> {
        for joint in self.base_joints.iter().chain(self.effector_joints.iter()) {
            if !joint.is_finite() {
                return Err(PlatformError::InvalidGeometry(
                    "joint positions must be finite".to_string(),
                ));
            }
        }
        for channel in 0..ACTUATOR_COUNT {
            let minimal = self.minimal_allowed_extension[channel];
            let maximal = self.maximal_allowed_extension[channel];
            if !minimal.is_finite() || !maximal.is_finite() || minimal < 0.0 || minimal >= maximal
            {
                return Err(PlatformError::InvalidGeometry(format!(
                    "extension band [{minimal}, {maximal}] of channel {channel} is invalid"
                )));
            }
        }
        Ok(())
    }
}

/// Effector pose: translation in metres, attitude as roll, pitch, yaw
/// in radians.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Pose {
    pub translation: DVec3,
    pub attitude: DVec3,
}

impl Pose {
    pub fn new(translation: DVec3, attitude: DVec3) -> Self {
        Self {
            translation,
            attitude,
        }
    }

    pub fn is_finite(&self) -> bool {
        self.translation.is_finite() && self.attitude.is_finite()
    }
}

/// Result of a pose command.
#[derive(Debug, Clone, PartialEq)]
pub enum PoseOutcome {
    /// The seek towards the computed extensions has started.
    Accepted { extensions: [f64; ACTUATOR_COUNT] },
    /// At least one computed extension leaves its allowed band; nothing
    /// was driven.
    Unreachable { extensions: [f64; ACTUATOR_COUNT] },
}

/// One hexapod rig under pose-level control.
pub struct StewartPlatform {
    actuators: LinearActuators,
    attitude: AttitudeSensors,
    geometry: PlatformGeometry,
}

impl StewartPlatform {
    /// Assemble a platform from its stage, attitude sensors and geometry.
    ///
    /// The attitude sampler is started here so pose reads never stall on
    /// the serial stream.
    pub fn new(
        actuators: LinearActuators,
        mut attitude: AttitudeSensors,
        geometry: PlatformGeometry,
    ) -> Result<Self, PlatformError> {
        if actuators.channel_count() != ACTUATOR_COUNT {
            return Err(PlatformError::ActuatorCountMismatch(
                actuators.channel_count(),
            ));
        }
        if attitude.channel_count() != ATTITUDE_CHANNELS {
            return Err(PlatformError::AttitudeCountMismatch(
                attitude.channel_count(),
            ));
        }
        geometry.validate()?;
        for channel in 0..ACTUATOR_COUNT {
            let minimal = geometry.minimal_allowed_extension[channel];
            let maximal = geometry.maximal_allowed_extension[channel];
            if minimal < actuators.minimal_extension() || maximal > actuators.maximal_extension()
            {
                return Err(PlatformError::InvalidGeometry(format!(
                    "allowed band [{minimal}, {maximal}] of channel {channel} leaves the \
                     actuator stroke [{}, {}]",
                    actuators.minimal_extension(),
                    actuators.maximal_extension()
                )));
            }
        }
        attitude.run_asynchronous()?;
        info!("platform ready");
        Ok(Self {
            actuators,
            attitude,
            geometry,
        })
    }

    pub fn actuators(&self) -> &LinearActuators {
        &self.actuators
    }

    pub fn actuators_mut(&mut self) -> &mut LinearActuators {
        &mut self.actuators
    }

    pub fn attitude_sensors(&self) -> &AttitudeSensors {
        &self.attitude
    }

    pub fn geometry(&self) -> &PlatformGeometry {
        &self.geometry
    }

    /// Extension each actuator needs for the pose.
    fn required_extensions(&self, pose: &Pose) -> [f64; ACTUATOR_COUNT] {
        let attitude = rotation_matrix(pose.attitude.x, pose.attitude.y, pose.attitude.z);
        std::array::from_fn(|joint| {
            let mounted = attitude * self.geometry.effector_joints[joint] + pose.translation;
            (self.geometry.base_joints[joint] - mounted).length()
        })
    }

    /// Seek the effector towards a pose.
    ///
    /// A pose whose extensions leave the allowed bands is answered with
    /// [`PoseOutcome::Unreachable`] and moves nothing. For an accepted
    /// pose the seek speeds are scaled by target extension, largest
    /// first, so all six actuators arrive together.
    pub fn set_end_effector_pose(&mut self, pose: &Pose) -> Result<PoseOutcome, PlatformError> {
        if !pose.is_finite() {
            return Err(PlatformError::NonFinitePose);
        }

        let extensions = self.required_extensions(pose);
        let within_bands = extensions.iter().enumerate().all(|(channel, &extension)| {
            extension >= self.geometry.minimal_allowed_extension[channel]
                && extension <= self.geometry.maximal_allowed_extension[channel]
        });
        if !within_bands {
            debug!(?extensions, "pose rejected, extensions leave the allowed bands");
            return Ok(PoseOutcome::Unreachable { extensions });
        }

        let peak = extensions.iter().copied().fold(0.0, f64::max);
        let speeds = if peak > 0.0 {
            extensions
                .iter()
                .map(|&extension| extension / peak)
                .collect()
        } else {
            vec![1.0; ACTUATOR_COUNT]
        };
        self.actuators.set_extensions(extensions.to_vec(), speeds)?;
        Ok(PoseOutcome::Accepted { extensions })
    }

    /// Reconstruct the current pose from measured extensions and
    /// attitude.
    pub fn end_effector_pose(&self) -> Result<Pose, PlatformError> {
        let attitude = self.attitude.measure()?;
        if attitude.len() != ATTITUDE_CHANNELS {
            return Err(PlatformError::AttitudeCountMismatch(attitude.len()));
        }
        let extensions = self.actuators.get_extensions()?;
        if extensions.len() != ACTUATOR_COUNT {
            return Err(PlatformError::ActuatorCountMismatch(extensions.len()));
        }

        let rotation = rotation_matrix(attitude[0], attitude[1], attitude[2]);
        let centres: [DVec3; 3] = std::array::from_fn(|joint| {
            self.geometry.base_joints[joint] - rotation * self.geometry.effector_joints[joint]
        });
        let radii = [extensions[0], extensions[1], extensions[2]];
        let translation = trilaterate(centres, radii)?;
        Ok(Pose {
            translation,
            attitude: DVec3::new(attitude[0], attitude[1], attitude[2]),
        })
    }

    /// Block until the running pose seek ends or `timeout` passes.
    pub fn wait_until_pose_is_reached(&self, timeout: Duration) -> SeekStatus {
        self.actuators.wait_until_settled(timeout)
    }
}
