//! Measurement pipeline shared by every sensor family.
//!
//! This module defines:
//! - `SensorSource` trait - One raw multi-channel reading per call
//! - `Sensors` - Burst sampling, per-channel median, per-channel correction
//! - `Correction` enum - Identity, affine or interpolation-table mapping
//!
//! A `Sensors` value reads synchronously by default. After
//! [`Sensors::run_asynchronous`] a background thread keeps a cache fresh
//! and `measure` returns the cached values without touching the device.
//! Sample counts and corrections can be changed at any time and apply
//! from the next burst.

pub mod attitude;
pub mod distance;
pub mod extension;

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use thiserror::Error;
use tracing::debug;

use crate::hal::DriverError;

/// Pause between two asynchronous measurement bursts.
pub const SAMPLING_PERIOD: Duration = Duration::from_millis(10);

#[derive(Debug, Clone, Error)]
pub enum SensorError {
    /// A burst needs at least one sample
    #[error("samples per measurement must be at least 1")]
    InvalidSampleCount,

    /// A correction failed validation against the measurable range
    #[error("invalid correction: {0}")]
    InvalidCorrection(String),

    /// Measurable range is empty or not finite
    #[error("invalid measurable range [{minimal}, {maximal}]")]
    InvalidRange { minimal: f64, maximal: f64 },

    /// The device answered, but not in the expected format
    #[error("protocol violation: {0}")]
    Protocol(String),

    /// The device did not answer at all
    #[error("driver failure: {0}")]
    Driver(#[from] DriverError),
}

// ─── Corrections ────────────────────────────────────────────────────

/// Per-channel mapping from a raw median to a calibrated value.
#[derive(Debug, Clone, PartialEq)]
pub enum Correction {
    /// Pass the median through unchanged.
    Identity,
    /// `scale * value + offset`.
    Affine { offset: f64, scale: f64 },
    /// Piecewise linear interpolation over `[raw, corrected]` breakpoints,
    /// clamped to the outermost breakpoints.
    Table(Vec<[f64; 2]>),
}

impl Correction {
    /// NaN marks a failed reading and passes through uncorrected.
    pub fn apply(&self, value: f64) -> f64 {
        if value.is_nan() {
            return value;
        }
        match self {
            Correction::Identity => value,
            Correction::Affine { offset, scale } => scale * value + offset,
            Correction::Table(points) => interpolate(points, value),
        }
    }

    /// Check the correction against the measurable range of its channel.
    pub fn validate(&self, minimal: f64, maximal: f64) -> Result<(), SensorError> {
        match self {
            Correction::Identity => Ok(()),
            Correction::Affine { offset, scale } => {
                if offset.is_finite() && scale.is_finite() {
                    Ok(())
                } else {
                    Err(SensorError::InvalidCorrection(
                        "affine coefficients must be finite".to_string(),
                    ))
                }
            }
            Correction::Table(points) => {
                if points.len() < 2 {
                    return Err(SensorError::InvalidCorrection(
                        "table needs at least two breakpoints".to_string(),
                    ));
                }
                for point in points {
                    if !point[0].is_finite() || !point[1].is_finite() {
                        return Err(SensorError::InvalidCorrection(
                            "table breakpoints must be finite".to_string(),
                        ));
                    }
                    if point[0] < minimal || point[0] > maximal {
                        return Err(SensorError::InvalidCorrection(format!(
                            "breakpoint {} outside the measurable range [{minimal}, {maximal}]",
                            point[0]
                        )));
                    }
                }
                for pair in points.windows(2) {
                    if pair[1][0] <= pair[0][0] {
                        return Err(SensorError::InvalidCorrection(
                            "table breakpoints must be strictly increasing".to_string(),
                        ));
                    }
                }
                Ok(())
            }
        }
    }
}

fn interpolate(points: &[[f64; 2]], value: f64) -> f64 {
    let (Some(first), Some(last)) = (points.first(), points.last()) else {
        return value;
    };
    if value <= first[0] {
        return first[1];
    }
    if value >= last[0] {
        return last[1];
    }
    for pair in points.windows(2) {
        let [x0, y0] = pair[0];
        let [x1, y1] = pair[1];
        if value <= x1 {
            return y0 + (value - x0) * (y1 - y0) / (x1 - x0);
        }
    }
    last[1]
}

/// Median of a slice. NaN values sort to the ends via total ordering.
pub fn median(values: &mut [f64]) -> f64 {
    if values.is_empty() {
        return f64::NAN;
    }
    values.sort_by(f64::total_cmp);
    let mid = values.len() / 2;
    if values.len() % 2 == 1 {
        values[mid]
    } else {
        (values[mid - 1] + values[mid]) / 2.0
    }
}

// ─── Pipeline ───────────────────────────────────────────────────────

/// Raw access to one sensor family.
pub trait SensorSource: Send + 'static {
    /// Number of values a single `read_raw` returns.
    fn channel_count(&self) -> usize;

    /// Take one raw reading of every channel.
    fn read_raw(&mut self) -> Result<Vec<f64>, SensorError>;
}

struct Pipeline {
    samples_per_measurement: usize,
    corrections: Vec<Correction>,
}

struct Sampler {
    stop: Arc<AtomicBool>,
    worker: JoinHandle<()>,
}

/// Measurement front-end over one [`SensorSource`].
pub struct Sensors<S: SensorSource> {
    source: Arc<Mutex<S>>,
    pipeline: Arc<Mutex<Pipeline>>,
    cache: Arc<Mutex<Vec<f64>>>,
    channel_count: usize,
    minimal: f64,
    maximal: f64,
    sampler: Option<Sampler>,
}

impl<S: SensorSource> Sensors<S> {
    /// Wrap a source whose raw values fall within `[minimal, maximal]`.
    pub fn new(source: S, minimal: f64, maximal: f64) -> Result<Self, SensorError> {
        if !minimal.is_finite() || !maximal.is_finite() || minimal >= maximal {
            return Err(SensorError::InvalidRange { minimal, maximal });
        }
        let channel_count = source.channel_count();
        Ok(Self {
            source: Arc::new(Mutex::new(source)),
            pipeline: Arc::new(Mutex::new(Pipeline {
                samples_per_measurement: 1,
                corrections: vec![Correction::Identity; channel_count],
            })),
            cache: Arc::new(Mutex::new(Vec::new())),
            channel_count,
            minimal,
            maximal,
            sampler: None,
        })
    }

    pub fn channel_count(&self) -> usize {
        self.channel_count
    }

    pub fn minimal_measurable_value(&self) -> f64 {
        self.minimal
    }

    pub fn maximal_measurable_value(&self) -> f64 {
        self.maximal
    }

    /// Set how many raw readings one measurement aggregates.
    ///
    /// Takes effect from the next burst, also while sampling runs.
    pub fn set_samples_per_measurement(&mut self, samples: usize) -> Result<(), SensorError> {
        if samples == 0 {
            return Err(SensorError::InvalidSampleCount);
        }
        self.pipeline.lock().unwrap().samples_per_measurement = samples;
        Ok(())
    }

    /// Replace the per-channel corrections, one per channel.
    pub fn set_corrections(&mut self, corrections: Vec<Correction>) -> Result<(), SensorError> {
        if corrections.len() != self.channel_count {
            return Err(SensorError::InvalidCorrection(format!(
                "expected {} corrections, got {}",
                self.channel_count,
                corrections.len()
            )));
        }
        for correction in &corrections {
            correction.validate(self.minimal, self.maximal)?;
        }
        self.pipeline.lock().unwrap().corrections = corrections;
        Ok(())
    }

    /// One corrected measurement of every channel.
    ///
    /// While the sampler runs this returns the cached values and never
    /// touches the device.
    pub fn measure(&self) -> Result<Vec<f64>, SensorError> {
        if self.sampler.is_some() {
            return Ok(self.cache.lock().unwrap().clone());
        }
        measure_once(&self.source, &self.pipeline)
    }

    /// Start the background sampler.
    ///
    /// The cache is primed with one synchronous measurement before the
    /// thread starts, so `measure` never observes an empty cache. Calling
    /// this while the sampler already runs is a no-op.
    pub fn run_asynchronous(&mut self) -> Result<(), SensorError> {
        if self.sampler.is_some() {
            debug!("sampler already running");
            return Ok(());
        }
        let first = measure_once(&self.source, &self.pipeline)?;
        *self.cache.lock().unwrap() = first;

        let stop = Arc::new(AtomicBool::new(false));
        let worker = {
            let stop = Arc::clone(&stop);
            let source = Arc::clone(&self.source);
            let pipeline = Arc::clone(&self.pipeline);
            let cache = Arc::clone(&self.cache);
            thread::spawn(move || {
                while !stop.load(Ordering::Relaxed) {
                    match measure_once(&source, &pipeline) {
                        Ok(values) => *cache.lock().unwrap() = values,
                        Err(err) => debug!(%err, "sampler read failed, keeping last values"),
                    }
                    thread::sleep(SAMPLING_PERIOD);
                }
            })
        };
        self.sampler = Some(Sampler { stop, worker });
        Ok(())
    }

    /// Run a closure against the locked source.
    pub(crate) fn with_source<T>(&self, action: impl FnOnce(&mut S) -> T) -> T {
        action(&mut self.source.lock().unwrap())
    }

    fn stop_sampler(&mut self) {
        if let Some(sampler) = self.sampler.take() {
            sampler.stop.store(true, Ordering::Relaxed);
            let _ = sampler.worker.join();
        }
    }
}

impl<S: SensorSource> Drop for Sensors<S> {
    fn drop(&mut self) {
        self.stop_sampler();
    }
}

/// One burst: lock the source, read `samples` frames back to back, then
/// reduce each channel to its corrected median.
fn measure_once<S: SensorSource>(
    source: &Mutex<S>,
    pipeline: &Mutex<Pipeline>,
) -> Result<Vec<f64>, SensorError> {
    let (samples, corrections) = {
        let pipeline = pipeline.lock().unwrap();
        (
            pipeline.samples_per_measurement,
            pipeline.corrections.clone(),
        )
    };

    let mut columns: Vec<Vec<f64>> = Vec::new();
    {
        let mut source = source.lock().unwrap();
        for _ in 0..samples {
            let frame = source.read_raw()?;
            if columns.is_empty() {
                columns = vec![Vec::with_capacity(samples); frame.len()];
            }
            for (column, value) in columns.iter_mut().zip(frame) {
                column.push(value);
            }
        }
    }

    Ok(columns
        .iter_mut()
        .zip(&corrections)
        .map(|(column, correction)| correction.apply(median(column)))
        .collect())
}
