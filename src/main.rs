use std::io;
use std::path::PathBuf;
use std::process::exit;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use clap::{Args, Parser, Subcommand};
use log::{info, warn};

use ad5933::calibration::FrontEndSettings;
use ad5933::logging;
use ad5933::mock::SimulatedAd5933;
use ad5933::report::{CsvSink, ResultSink};
use ad5933::{
    Ad5933, CancelToken, Calibration, ClockSource, ControlTransport, OutputVoltage, PgaGain,
    SettlingMultiplier, SweepConfig, SweepPoint, SweepTiming, UsbConnector,
};

#[derive(Parser, Debug)]
#[command(name = "ad5933ctl", about = "Drive an AD5933 impedance analyzer over USB")]
struct Cli {
    /// Use a simulated chip with a resistive load of this many ohms instead of USB
    #[arg(long, global = true, value_name = "OHMS")]
    simulate: Option<f64>,
    /// JSON sweep configuration; flags below override its fields
    #[arg(long, global = true, value_name = "JSON")]
    config: Option<PathBuf>,
    /// Log level (error, warn, info, debug, trace); overrides AD5933_LOG
    #[arg(long, global = true)]
    log_level: Option<String>,
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Read the on-chip temperature sensor
    Temperature,
    /// Run a sweep and print the raw real/imaginary samples
    Sweep {
        #[command(flatten)]
        sweep: SweepArgs,
        /// Also save the raw points as JSON
        #[arg(long)]
        output: Option<PathBuf>,
    },
    /// Sweep a known reference resistor and save the calibration
    Calibrate {
        #[command(flatten)]
        sweep: SweepArgs,
        /// Reference resistance in ohms
        #[arg(long)]
        reference: f64,
        #[arg(long, default_value = "calibration.json")]
        output: PathBuf,
    },
    /// Sweep an unknown load and write calibrated impedance as CSV
    Measure {
        #[command(flatten)]
        sweep: SweepArgs,
        #[arg(long, default_value = "calibration.json")]
        calibration: PathBuf,
        /// CSV destination; stdout when omitted
        #[arg(long)]
        output: Option<PathBuf>,
    },
}

#[derive(Args, Debug, Default)]
struct SweepArgs {
    /// Start frequency in Hz
    #[arg(long)]
    start: Option<f64>,
    /// End frequency in Hz (requires --points)
    #[arg(long, requires = "points")]
    end: Option<f64>,
    /// Number of points, including both ends
    #[arg(long)]
    points: Option<u16>,
    /// Output range: 2v, 1v, 400mv, 200mv
    #[arg(long)]
    voltage: Option<OutputVoltage>,
    /// PGA gain: x1, x5
    #[arg(long)]
    pga: Option<PgaGain>,
    /// Clock source: internal, external
    #[arg(long)]
    clock: Option<ClockSource>,
    /// External clock frequency in Hz
    #[arg(long)]
    external_clock: Option<f64>,
    #[arg(long)]
    settling_cycles: Option<u16>,
    /// Settling multiplier: x1, x2, x4
    #[arg(long)]
    multiplier: Option<SettlingMultiplier>,
}

impl SweepArgs {
    fn apply(&self, base: SweepConfig) -> Result<SweepConfig> {
        let mut config = base;
        match (self.end, self.points) {
            (Some(end), Some(points)) => {
                let start = self.start.unwrap_or(config.start_hz);
                let range = SweepConfig::from_range(start, end, points)?;
                config.start_hz = range.start_hz;
                config.increment_hz = range.increment_hz;
                config.increments = range.increments;
            }
            (None, Some(points)) => config.increments = points.saturating_sub(1),
            _ => {}
        }
        if let Some(start) = self.start {
            config.start_hz = start;
        }
        if let Some(v) = self.voltage {
            config.output_voltage = v;
        }
        if let Some(g) = self.pga {
            config.pga_gain = g;
        }
        if let Some(c) = self.clock {
            config.clock = c;
        }
        if let Some(hz) = self.external_clock {
            config.external_clock_hz = hz;
        }
        if let Some(n) = self.settling_cycles {
            config.settling_cycles = n;
        }
        if let Some(m) = self.multiplier {
            config.settling_multiplier = m;
        }
        config.encode().context("invalid sweep settings")?;
        Ok(config)
    }
}

fn main() {
    if let Err(e) = run() {
        eprintln!("Error: {e:#}");
        exit(1);
    }
}

fn run() -> Result<()> {
    let cli = Cli::parse();

    let level = match cli.log_level.as_deref() {
        Some(s) => match logging::parse_level(Some(s)) {
            Some(level) => Some(level),
            None => bail!("invalid log level '{s}'"),
        },
        None => None,
    };
    logging::init_logging_with(level);

    let base = match &cli.config {
        Some(path) => SweepConfig::load(path)
            .with_context(|| format!("loading sweep configuration {}", path.display()))?,
        None => SweepConfig::default(),
    };

    let mut timing = SweepTiming::default();
    if cli.simulate.is_some() {
        timing.settle = Duration::ZERO;
    }
    let cancel = CancelToken::new();
    let mut device = open_device(cli.simulate)?;

    match &cli.command {
        Command::Temperature => {
            let celsius = device
                .measure_temperature(&timing.poll)
                .context("measuring temperature")?;
            println!("{celsius:.2} °C");
        }
        Command::Sweep { sweep, output } => {
            let config = sweep.apply(base)?;
            let points = device
                .sweep(&config, &timing, &cancel)
                .context("running sweep")?;
            println!("{:>12} {:>8} {:>8}", "Frequency", "Real", "Imag");
            for p in &points {
                println!("{:>12.3} {:>8} {:>8}", p.frequency, p.sample.re, p.sample.im);
            }
            if let Some(path) = output {
                save_points(path, &points)?;
            }
        }
        Command::Calibrate {
            sweep,
            reference,
            output,
        } => {
            let config = sweep.apply(base)?;
            let points = device
                .sweep(&config, &timing, &cancel)
                .context("running calibration sweep")?;
            let calibration =
                Calibration::from_sweep(&points, *reference)?.with_settings(&config);
            calibration
                .save(output)
                .with_context(|| format!("saving calibration to {}", output.display()))?;
            info!("calibration written to {}", output.display());
        }
        Command::Measure {
            sweep,
            calibration: cal_path,
            output,
        } => {
            let calibration = Calibration::load(cal_path)
                .with_context(|| format!("loading calibration {}", cal_path.display()))?;
            let config = sweep.apply(base)?;
            if !calibration.settings_match(&config) {
                warn!(
                    "calibration was taken with {:?}, measuring with {:?}; gains may not apply",
                    calibration.settings,
                    FrontEndSettings::from(&config)
                );
            }
            let celsius = device.measure_temperature(&timing.poll)?;
            info!("chip temperature {celsius:.2} °C");

            let points = device
                .sweep(&config, &timing, &cancel)
                .context("running measurement sweep")?;
            let scored = calibration.score(&points);
            match output {
                Some(path) => CsvSink::create(path)?.write_all(&scored)?,
                None => CsvSink::new(io::stdout().lock())?.write_all(&scored)?,
            }
        }
    }

    device.power_down().context("powering down")?;
    Ok(())
}

fn open_device(simulate: Option<f64>) -> Result<Ad5933<Box<dyn ControlTransport>>> {
    let transport: Box<dyn ControlTransport> = match simulate {
        Some(ohms) => {
            if !(ohms.is_finite() && ohms > 0.0) {
                bail!("--simulate needs a positive resistance, got {ohms}");
            }
            info!("using simulated AD5933 with a {ohms} Ω load");
            Box::new(SimulatedAd5933::resistive(ohms))
        }
        None => {
            let connector = UsbConnector::default();
            Box::new(connector.open().with_context(|| {
                format!(
                    "opening USB device {:04x}:{:04x}",
                    connector.vid, connector.pid
                )
            })?)
        }
    };
    Ok(Ad5933::new(transport)?)
}

fn save_points(path: &PathBuf, points: &[SweepPoint]) -> Result<()> {
    let file = std::fs::File::create(path)
        .with_context(|| format!("creating {}", path.display()))?;
    serde_json::to_writer_pretty(io::BufWriter::new(file), points)?;
    Ok(())
}
