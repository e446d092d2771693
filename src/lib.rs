//! AD5933 impedance converter driver.
//!
//! The chip sits behind an FX2 USB bridge that exposes one vendor control
//! request for single-byte register reads and writes. On top of that this
//! crate provides device configuration, the frequency-sweep state machine,
//! temperature readout and gain/phase calibration.
//!
//! # Measuring an unknown impedance
//!
//! 1. Sweep a known reference resistor and build a [`Calibration`] from it.
//! 2. Swap in the unknown load and sweep again with the same settings.
//! 3. [`Calibration::score`] turns each raw sample into `|Z|` and phase.
//!
//! Gain factors depend on output range, PGA gain and the feedback resistor,
//! so a calibration is only valid for the settings it was taken with;
//! [`Calibration::with_settings`] records them for later comparison.
//!
//! ```no_run
//! use ad5933::{Ad5933, CancelToken, Calibration, SweepConfig, SweepTiming, UsbConnector};
//!
//! # fn main() -> ad5933::Result<()> {
//! let mut dev = Ad5933::new(UsbConnector::default().open()?)?;
//! let config = SweepConfig::from_range(10_000.0, 20_000.0, 11)?;
//! let raw = dev.sweep(&config, &SweepTiming::default(), &CancelToken::new())?;
//! let cal = Calibration::from_sweep(&raw, 1000.0)?.with_settings(&config);
//! assert!(cal.settings_match(&config));
//! # Ok(())
//! # }
//! ```

pub mod ad5933;
pub mod calibration;
mod errors;
pub mod logging;
pub mod mock;
pub mod registers;
pub mod report;
pub mod sweep;
pub mod usb;

pub use ad5933::{Ad5933, CancelToken, PollPolicy, StatusFlag};
pub use calibration::{
    Calibration, FrequencyTable, FrontEndSettings, GainTable, ImpedancePoint, PhaseTable,
};
pub use errors::*;
pub use registers::{
    ClockSource, Mode, OutputVoltage, PgaGain, Register, SettlingMultiplier, Status,
};
pub use report::{CsvSink, ResultSink};
pub use sweep::{SweepConfig, SweepEngine, SweepPoint, SweepState, SweepTiming};
pub use usb::{ControlTransport, Direction, UsbConnector, UsbTransport};
