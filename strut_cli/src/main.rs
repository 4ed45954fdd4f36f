//! Strut maintenance binary.
//!
//! Command-line surface over the hexapod motion stack: scripted
//! demonstration tour, single pose moves, live pose readout and the
//! extension sensor calibration recorder.
//!
//! # Usage
//!
//! ```bash
//! # Scripted demonstration tour on the simulated rig
//! strut demo
//!
//! # One pose, wait for convergence
//! strut pose 0.0 0.0 0.5 0.0 0.0 0.0
//!
//! # Drive every actuator to 60 % extension
//! strut extension 0.6
//!
//! # Live pose readout
//! strut --verbose sensor
//!
//! # Record extension sensor correction tables
//! strut calibrate-extensions --output corrections.toml
//! ```

#![deny(warnings)]

use std::io::{self, Write as _};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread;
use std::time::Duration;

use clap::{Parser, Subcommand};
use glam::DVec3;
use tracing::{Level, error, info, warn};
use tracing_subscriber::EnvFilter;

use strut_core::config::{ConfigLoader, CorrectionTableFile, RigConfig};
use strut_core::hal::serial::TtyLink;
use strut_core::hal::sim::SimRig;
use strut_core::hal::{AdcBus, DigitalLine, DriverError, IoProvider, PwmBus, SerialLink};
use strut_core::sensors::attitude::AttitudeSensors;
use strut_core::sensors::extension::ExtensionSensors;
use strut_core::sensors::median;
use strut_core::servo::ServoControllers;
use strut_core::{Gpio, LinearActuators, Pose, PoseOutcome, SeekStatus, StewartPlatform};

/// How long one pose of the demonstration tour may take.
const DEMO_STEP_TIMEOUT: Duration = Duration::from_secs(10);

/// Tour offsets around the measured home pose.
const TRANSLATION_NUDGE: f64 = 0.03; // metres
const ATTITUDE_NUDGE: f64 = 0.26; // radians

/// Extension levels visited by the calibration recorder.
const CALIBRATION_LEVELS: [f64; 7] = [0.1, 0.2, 0.3, 0.4, 0.5, 0.6, 0.7];

/// Sensor readings aggregated into one calibration breakpoint.
const CALIBRATION_ROUNDS: usize = 20;

/// Strut - maintenance and calibration surface for the hexapod rig
#[derive(Parser, Debug)]
#[command(name = "strut")]
#[command(version)]
#[command(about = "Maintenance and calibration surface for the hexapod motion rig")]
#[command(long_about = None)]
struct Args {
    /// Path to the rig configuration file; the built-in demonstrator
    /// wiring is used when omitted
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// I/O backend to drive
    #[arg(short, long, default_value = "sim")]
    driver: String,

    /// Attach the attitude link to a real serial device instead of the
    /// backend's own stream
    #[arg(long, value_name = "DEVICE")]
    attitude_port: Option<PathBuf>,

    /// Enable verbose logging
    #[arg(short, long)]
    verbose: bool,

    /// Output logs in JSON format
    #[arg(long)]
    json: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Nudge the effector around its home pose until interrupted
    Demo,

    /// Drive the effector to one pose and wait for convergence
    #[command(allow_negative_numbers = true)]
    Pose {
        /// Translation along x, in metres
        x: f64,
        /// Translation along y, in metres
        y: f64,
        /// Translation along z, in metres
        z: f64,
        /// Roll in radians
        roll: f64,
        /// Pitch in radians
        pitch: f64,
        /// Yaw in radians
        yaw: f64,
    },

    /// Drive every actuator to the same extension
    Extension {
        /// Target extension as a fraction of full stroke
        level: f64,
    },

    /// Print the measured pose until interrupted
    Sensor,

    /// Record extension sensor correction tables from operator
    /// measurements
    CalibrateExtensions {
        /// Where to write the recorded tables
        #[arg(short, long, default_value = "corrections.toml")]
        output: PathBuf,
    },
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    if let Err(e) = run() {
        error!("strut failed: {}", e);
        std::process::exit(1);
    }
    Ok(())
}

fn run() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();

    setup_tracing(&args);

    info!("strut v{} starting", env!("CARGO_PKG_VERSION"));

    let config = match &args.config {
        Some(path) => {
            info!("Loading rig configuration from {:?}", path);
            RigConfig::load(path)?
        }
        None => RigConfig::default(),
    };
    config.validate()?;

    let provider = provider_for(&args)?;
    let mut platform = build_platform(provider, &config)?;

    let running = Arc::new(AtomicBool::new(true));
    {
        let running = Arc::clone(&running);
        ctrlc::set_handler(move || {
            info!("Received shutdown signal");
            running.store(false, Ordering::SeqCst);
        })?;
    }

    match args.command {
        Command::Demo => run_demo(&mut platform, &running)?,
        Command::Pose {
            x,
            y,
            z,
            roll,
            pitch,
            yaw,
        } => {
            let pose = Pose::new(DVec3::new(x, y, z), DVec3::new(roll, pitch, yaw));
            run_pose(&mut platform, pose)?;
        }
        Command::Extension { level } => run_extension(&mut platform, level)?,
        Command::Sensor => run_sensor(&platform, &running),
        Command::CalibrateExtensions { output } => {
            run_calibration(&mut platform, &config, &output)?;
        }
    }

    platform.actuators_mut().stop()?;
    info!("strut shutdown complete");
    Ok(())
}

/// Pick the I/O backend from the CLI arguments.
fn provider_for(args: &Args) -> Result<Box<dyn IoProvider>, Box<dyn std::error::Error>> {
    match args.driver.as_str() {
        "sim" => {
            let rig = SimRig::new();
            match &args.attitude_port {
                Some(device) => {
                    info!("Attitude link on {:?}", device);
                    Ok(Box::new(TetheredRig {
                        rig,
                        device: device.clone(),
                    }))
                }
                None => Ok(Box::new(rig)),
            }
        }
        other => Err(format!("unknown driver '{other}', available: sim").into()),
    }
}

/// Simulated rig with the serial link redirected to a real device, so
/// the attitude stream can come from actual hardware while the rest of
/// the rig stays simulated.
struct TetheredRig {
    rig: SimRig,
    device: PathBuf,
}

impl IoProvider for TetheredRig {
    fn name(&self) -> &'static str {
        "sim+tty"
    }

    fn line(&self, number: u8) -> Result<Box<dyn DigitalLine>, DriverError> {
        self.rig.line(number)
    }

    fn adc(&self) -> Result<Box<dyn AdcBus>, DriverError> {
        self.rig.adc()
    }

    fn pwm(&self) -> Result<Box<dyn PwmBus>, DriverError> {
        self.rig.pwm()
    }

    fn serial(&self) -> Result<Box<dyn SerialLink>, DriverError> {
        Ok(Box::new(TtyLink::open(&self.device)?))
    }
}

/// Wire the platform from a backend and the rig configuration.
fn build_platform(
    provider: Box<dyn IoProvider>,
    config: &RigConfig,
) -> Result<StewartPlatform, Box<dyn std::error::Error>> {
    let gpio = Gpio::new(provider);

    let mut sensors = ExtensionSensors::from_spi(
        gpio.allocate_spi()?,
        config.extension.channels.clone(),
        config.extension.minimal,
        config.extension.maximal,
    )?;
    sensors.set_samples_per_measurement(config.extension.samples_per_measurement)?;
    if let Some(file) = &config.extension.correction_file {
        info!(file = %file, "Loading extension sensor corrections");
        let tables = CorrectionTableFile::load(Path::new(file))?;
        sensors.set_corrections(tables.corrections())?;
    }

    let pins = config
        .pins
        .direction
        .iter()
        .map(|&pin| gpio.allocate_pin(pin))
        .collect::<Result<Vec<_>, _>>()?;
    let servos = ServoControllers::new(
        pins,
        gpio.allocate_i2c()?,
        config.servo.channels.clone(),
        config.servo.maximal_speed,
    )?;

    let mut actuators = LinearActuators::new(
        servos,
        sensors,
        config.actuators.minimal_extension,
        config.actuators.maximal_extension,
    )?;
    actuators.set_acceptable_deviation(config.actuators.acceptable_deviation)?;

    let attitude = AttitudeSensors::from_uart(gpio.allocate_uart()?)?;

    Ok(StewartPlatform::new(
        actuators,
        attitude,
        config.platform_geometry()?,
    )?)
}

/// Tour each translation and attitude axis around the home pose,
/// returning home between moves, until interrupted.
fn run_demo(
    platform: &mut StewartPlatform,
    running: &AtomicBool,
) -> Result<(), Box<dyn std::error::Error>> {
    let home = platform.end_effector_pose()?;
    info!(translation = ?home.translation, "Demo tour around the measured home pose");

    while running.load(Ordering::SeqCst) {
        for axis in 0..2 {
            for step in [-TRANSLATION_NUDGE, TRANSLATION_NUDGE, 0.0] {
                let mut pose = home;
                pose.translation[axis] += step;
                if !visit(platform, &pose, running)? {
                    return Ok(());
                }
            }
        }
        for axis in 0..2 {
            for step in [-ATTITUDE_NUDGE, ATTITUDE_NUDGE, 0.0] {
                let mut pose = home;
                pose.attitude[axis] += step;
                if !visit(platform, &pose, running)? {
                    return Ok(());
                }
            }
        }
    }
    Ok(())
}

/// Drive one pose of the tour. Returns false once interrupted.
fn visit(
    platform: &mut StewartPlatform,
    pose: &Pose,
    running: &AtomicBool,
) -> Result<bool, Box<dyn std::error::Error>> {
    if !running.load(Ordering::SeqCst) {
        return Ok(false);
    }
    match platform.set_end_effector_pose(pose)? {
        PoseOutcome::Accepted { .. } => {
            let status = platform.wait_until_pose_is_reached(DEMO_STEP_TIMEOUT);
            info!(?status, translation = ?pose.translation, attitude = ?pose.attitude, "Demo step");
        }
        PoseOutcome::Unreachable { extensions } => {
            warn!(?extensions, "Demo pose unreachable, skipping");
        }
    }
    thread::sleep(Duration::from_millis(100));
    Ok(true)
}

fn run_pose(
    platform: &mut StewartPlatform,
    pose: Pose,
) -> Result<(), Box<dyn std::error::Error>> {
    match platform.set_end_effector_pose(&pose)? {
        PoseOutcome::Accepted { extensions } => {
            info!(?extensions, "Pose accepted");
            let status = platform.wait_until_pose_is_reached(Duration::from_secs(30));
            let reached = platform.end_effector_pose()?;
            println!("seek {status:?}");
            println!(
                "translation [{:+.4}, {:+.4}, {:+.4}] m",
                reached.translation.x, reached.translation.y, reached.translation.z
            );
            println!(
                "attitude    [{:+.4}, {:+.4}, {:+.4}] rad",
                reached.attitude.x, reached.attitude.y, reached.attitude.z
            );
            Ok(())
        }
        PoseOutcome::Unreachable { extensions } => {
            Err(format!("pose unreachable, required extensions {extensions:?}").into())
        }
    }
}

fn run_extension(
    platform: &mut StewartPlatform,
    level: f64,
) -> Result<(), Box<dyn std::error::Error>> {
    let channels = platform.actuators().channel_count();
    platform
        .actuators_mut()
        .set_extensions(vec![level; channels], vec![1.0; channels])?;
    let status = platform
        .actuators()
        .wait_until_settled(Duration::from_secs(30));
    println!("seek {status:?}");
    for (channel, extension) in platform.actuators().get_extensions()?.iter().enumerate() {
        println!("actuator {channel}: {extension:.4}");
    }
    Ok(())
}

/// Print the measured pose at a fixed cadence until interrupted.
fn run_sensor(platform: &StewartPlatform, running: &AtomicBool) {
    let mut row = 0u32;
    while running.load(Ordering::SeqCst) {
        if row % 10 == 0 {
            println!(
                "{:>9} {:>9} {:>9}  {:>9} {:>9} {:>9}",
                "x [m]", "y [m]", "z [m]", "roll", "pitch", "yaw"
            );
        }
        match platform.end_effector_pose() {
            Ok(pose) => println!(
                "{:>9.4} {:>9.4} {:>9.4}  {:>9.4} {:>9.4} {:>9.4}",
                pose.translation.x,
                pose.translation.y,
                pose.translation.z,
                pose.attitude.x,
                pose.attitude.y,
                pose.attitude.z
            ),
            Err(err) => warn!(%err, "Pose read failed"),
        }
        row += 1;
        thread::sleep(Duration::from_millis(100));
    }
}

/// Step the bank through fixed extension levels, record the median
/// sensor reading against the operator's measured value at each level
/// and write the breakpoints as a correction table file.
fn run_calibration(
    platform: &mut StewartPlatform,
    config: &RigConfig,
    output: &Path,
) -> Result<(), Box<dyn std::error::Error>> {
    if config.extension.correction_file.is_some() {
        warn!("correction_file is configured; recorded tables would compound the installed corrections");
    }

    let channels = platform.actuators().channel_count();
    let mut tables = vec![Vec::new(); channels];

    for level in CALIBRATION_LEVELS {
        info!(level, "Calibration step");
        platform
            .actuators_mut()
            .set_extensions(vec![level; channels], vec![1.0; channels])?;
        let status = platform
            .actuators()
            .wait_until_settled(Duration::from_secs(10));
        if status != SeekStatus::Converged {
            warn!(?status, level, "Step did not converge, recording anyway");
        }

        let mut rounds: Vec<Vec<f64>> = vec![Vec::with_capacity(CALIBRATION_ROUNDS); channels];
        for _ in 0..CALIBRATION_ROUNDS {
            for (channel, extension) in platform.actuators().get_extensions()?.iter().enumerate()
            {
                rounds[channel].push(*extension);
            }
            thread::sleep(Duration::from_millis(10));
        }

        for channel in 0..channels {
            let reading = median(&mut rounds[channel]);
            let measured = prompt_measurement(channel)?;
            tables[channel].push([reading, measured]);
        }
    }

    platform
        .actuators_mut()
        .set_extensions(vec![0.5; channels], vec![1.0; channels])?;
    let status = platform
        .actuators()
        .wait_until_settled(Duration::from_secs(10));
    info!(?status, "Returned to mid stroke");

    let file = CorrectionTableFile::from_tables(tables);
    std::fs::write(output, toml::to_string_pretty(&file)?)?;
    info!(path = ?output, "Correction tables written");
    Ok(())
}

fn prompt_measurement(channel: usize) -> Result<f64, Box<dyn std::error::Error>> {
    print!("measured extension of sensor {channel}: ");
    io::stdout().flush()?;
    let mut line = String::new();
    io::stdin().read_line(&mut line)?;
    Ok(line.trim().parse()?)
}

/// Setup tracing subscriber based on CLI arguments.
fn setup_tracing(args: &Args) {
    let level = if args.verbose {
        Level::DEBUG
    } else {
        Level::INFO
    };

    let filter = EnvFilter::from_default_env().add_directive(level.into());

    if args.json {
        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .json()
            .init();
    } else {
        tracing_subscriber::fmt().with_env_filter(filter).init();
    }
}
