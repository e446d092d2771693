//! Frequency sweep state machine.
//!
//! ```text
//! Idle -> Standby -> Initializing -> Sweeping -> Complete
//! ```
//!
//! Each transition out of `Idle`, `Standby` and `Initializing` is followed by
//! a settle delay: the analog front end needs time at the new excitation
//! before the first status poll. Inside `Sweeping` the engine waits for
//! impedance-valid, reads the point, then either stops on sweep-complete or
//! issues increment-frequency.
//!
//! A transport error aborts the sweep and the points gathered so far are
//! dropped with it. The unit of retry is the whole sweep.

use std::fs::File;
use std::io::{BufReader, BufWriter};
use std::path::Path;
use std::thread;
use std::time::Duration;

use log::{debug, info};
use num_complex::Complex64;
use serde::{Deserialize, Serialize};

use crate::ad5933::{Ad5933, CancelToken, PollPolicy, StatusFlag};
use crate::errors::{DriverError, Result};
use crate::registers::{
    check_nine_bit, frequency_to_word, word_to_frequency, ClockSource, OutputVoltage, PgaGain,
    SettlingMultiplier, DEFAULT_EXTERNAL_CLOCK_HZ, INTERNAL_CLOCK_HZ,
};
use crate::usb::ControlTransport;

/// Hardware settling time after each mode transition that changes the excitation.
pub const SETTLE_DELAY: Duration = Duration::from_millis(500);

// ============================================================================
// Configuration
// ============================================================================

/// Sweep parameters as the operator states them.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SweepConfig {
    /// First excitation frequency in Hz.
    pub start_hz: f64,
    /// Step between points in Hz.
    pub increment_hz: f64,
    /// Number of increments; the sweep yields `increments + 1` points.
    pub increments: u16,
    pub settling_cycles: u16,
    pub settling_multiplier: SettlingMultiplier,
    pub output_voltage: OutputVoltage,
    pub pga_gain: PgaGain,
    pub clock: ClockSource,
    /// Nominal external clock, used only when `clock` is external.
    pub external_clock_hz: f64,
}

impl Default for SweepConfig {
    fn default() -> Self {
        Self {
            start_hz: 30_000.0,
            increment_hz: 10.0,
            increments: 10,
            settling_cycles: 15,
            settling_multiplier: SettlingMultiplier::X1,
            output_voltage: OutputVoltage::V2pp,
            pga_gain: PgaGain::X1,
            clock: ClockSource::Internal,
            external_clock_hz: DEFAULT_EXTERNAL_CLOCK_HZ,
        }
    }
}

impl SweepConfig {
    /// Sweep `points` evenly spaced frequencies from `start_hz` to `end_hz` inclusive.
    pub fn from_range(start_hz: f64, end_hz: f64, points: u16) -> Result<Self> {
        if points == 0 {
            return Err(DriverError::Config("a sweep needs at least one point".into()));
        }
        if end_hz < start_hz {
            return Err(DriverError::Config(format!(
                "end frequency {end_hz} Hz is below start frequency {start_hz} Hz"
            )));
        }
        let increments = points - 1;
        let increment_hz = if increments == 0 {
            0.0
        } else {
            (end_hz - start_hz) / increments as f64
        };
        Ok(Self {
            start_hz,
            increment_hz,
            increments,
            ..Self::default()
        })
    }

    /// Read a JSON sweep file. Missing fields take their defaults.
    pub fn load(path: &Path) -> Result<Self> {
        let config: Self = serde_json::from_reader(BufReader::new(File::open(path)?))?;
        config.encode()?;
        debug!("loaded sweep configuration from {}", path.display());
        Ok(config)
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        serde_json::to_writer_pretty(BufWriter::new(File::create(path)?), self)?;
        Ok(())
    }

    /// Clock frequency the words will be encoded against.
    pub fn clock_hz(&self) -> f64 {
        match self.clock {
            ClockSource::Internal => INTERNAL_CLOCK_HZ,
            ClockSource::External => self.external_clock_hz,
        }
    }

    /// Nominal frequency of every point, from the encoded words.
    pub fn nominal_frequencies(&self) -> Result<Vec<f64>> {
        let words = self.encode()?;
        Ok((0..=self.increments as u32)
            .map(|i| word_to_frequency(words.start + i * words.increment, self.clock_hz()))
            .collect())
    }

    /// Encode and range-check every register field.
    pub fn encode(&self) -> Result<EncodedSweep> {
        let clock = self.clock_hz();
        let start = frequency_to_word("start frequency", self.start_hz, clock)?;
        let increment = frequency_to_word("frequency increment", self.increment_hz, clock)?;
        let increments = check_nine_bit("number of increments", self.increments)?;
        let settling_cycles = check_nine_bit("settling cycles", self.settling_cycles)?;

        if increments > 0 && increment == 0 {
            return Err(DriverError::Config(format!(
                "frequency increment {} Hz is below the {:.4} Hz resolution of a {} Hz clock",
                self.increment_hz,
                crate::registers::frequency_quantum(clock),
                clock
            )));
        }
        let end = start as u64 + increment as u64 * increments as u64;
        if end > crate::registers::MAX_FREQUENCY_WORD as u64 {
            return Err(DriverError::EncodingOverflow {
                field: "end frequency",
                value: end,
                bits: crate::registers::FREQUENCY_WORD_BITS,
            });
        }

        Ok(EncodedSweep {
            start,
            increment,
            increments,
            settling_cycles,
        })
    }
}

/// Register words derived from a [`SweepConfig`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EncodedSweep {
    pub start: u32,
    pub increment: u32,
    pub increments: u16,
    pub settling_cycles: u16,
}

/// Delays used by the sweep.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SweepTiming {
    /// Wait after standby, init-start-frequency and start-sweep.
    pub settle: Duration,
    pub poll: PollPolicy,
}

impl Default for SweepTiming {
    fn default() -> Self {
        Self {
            settle: SETTLE_DELAY,
            poll: PollPolicy::default(),
        }
    }
}

// ============================================================================
// Results
// ============================================================================

/// One measured frequency.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct SweepPoint {
    /// Excitation frequency recovered from the frequency word, in Hz.
    pub frequency: f64,
    /// Raw real/imaginary DFT result.
    pub sample: Complex64,
}

/// Position of the sweep engine in its state machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SweepState {
    Idle,
    Standby,
    Initializing,
    Sweeping,
    Complete,
}

// ============================================================================
// Engine
// ============================================================================

/// Drives one sweep on a borrowed session.
pub struct SweepEngine<'a, T: ControlTransport> {
    device: &'a mut Ad5933<T>,
    timing: SweepTiming,
    cancel: CancelToken,
    state: SweepState,
}

impl<'a, T: ControlTransport> SweepEngine<'a, T> {
    pub fn new(device: &'a mut Ad5933<T>, timing: SweepTiming, cancel: CancelToken) -> Self {
        Self {
            device,
            timing,
            cancel,
            state: SweepState::Idle,
        }
    }

    pub fn state(&self) -> SweepState {
        self.state
    }

    fn settle(&self) {
        if !self.timing.settle.is_zero() {
            thread::sleep(self.timing.settle);
        }
    }

    fn transition(&mut self, to: SweepState) {
        debug!("sweep {:?} -> {:?}", self.state, to);
        self.state = to;
    }

    /// Configure the device and run the sweep to completion.
    ///
    /// Returns `increments + 1` points in increasing frequency order.
    pub fn run(&mut self, config: &SweepConfig) -> Result<Vec<SweepPoint>> {
        if self.state != SweepState::Idle {
            // A finished engine starts over.
            self.transition(SweepState::Idle);
        }

        let words = self.device.configure(config)?;
        let clock = self.device.clock_hz();

        self.device.enter_standby()?;
        self.transition(SweepState::Standby);
        self.settle();

        self.device.init_start_frequency()?;
        self.transition(SweepState::Initializing);
        self.settle();

        self.device.start_sweep()?;
        self.transition(SweepState::Sweeping);
        self.settle();

        let mut points = Vec::with_capacity(words.increments as usize + 1);
        let mut word = words.start;
        loop {
            self.device
                .wait_for(StatusFlag::ImpedanceValid, &self.timing.poll, &self.cancel)?;
            let sample = self.device.read_measurement()?;
            let frequency = word_to_frequency(word, clock);
            debug!(
                "point {}: {:.3} Hz re={} im={}",
                points.len(),
                frequency,
                sample.re,
                sample.im
            );
            points.push(SweepPoint { frequency, sample });

            let status = self.device.status()?;
            if status.sweep_complete() {
                break;
            }
            if points.len() > words.increments as usize {
                return Err(DriverError::Protocol(format!(
                    "device did not report sweep-complete after {} points",
                    points.len()
                )));
            }
            if self.cancel.is_cancelled() {
                return Err(DriverError::Cancelled);
            }

            self.device.increment_frequency()?;
            word += words.increment;
        }

        self.transition(SweepState::Complete);
        self.device.enter_standby()?;
        info!(
            "sweep complete: {} point(s), {:.1}-{:.1} Hz",
            points.len(),
            points.first().map(|p| p.frequency).unwrap_or_default(),
            points.last().map(|p| p.frequency).unwrap_or_default()
        );
        Ok(points)
    }
}

impl<T: ControlTransport> Ad5933<T> {
    /// Program every sweep register.
    ///
    /// The clock goes first so the frequency words are encoded against the
    /// clock that will actually drive the DDS. Settling cycles are written
    /// before the multiplier because the cycle write overwrites the whole word.
    pub fn configure(&mut self, config: &SweepConfig) -> Result<EncodedSweep> {
        if config.clock == ClockSource::External {
            self.set_external_clock_hz(config.external_clock_hz)?;
        }
        self.select_clock(config.clock)?;

        let words = config.encode()?;
        self.set_starting_frequency(words.start)?;
        self.set_frequency_step(words.increment)?;
        self.set_step_number(words.increments)?;
        self.set_settling_cycles(words.settling_cycles)?;
        self.set_settling_multiplier(config.settling_multiplier)?;
        self.set_voltage_output(config.output_voltage)?;
        self.set_pga(config.pga_gain)?;
        debug!("configured sweep: {:?} -> {:?}", config, words);
        Ok(words)
    }

    /// Run a full sweep. See [`SweepEngine::run`].
    pub fn sweep(
        &mut self,
        config: &SweepConfig,
        timing: &SweepTiming,
        cancel: &CancelToken,
    ) -> Result<Vec<SweepPoint>> {
        SweepEngine::new(self, *timing, cancel.clone()).run(config)
    }

    /// Measure the current frequency again (repeat-frequency mode).
    pub fn repeat_point(&mut self, poll: &PollPolicy, cancel: &CancelToken) -> Result<Complex64> {
        self.repeat_frequency()?;
        self.wait_for(StatusFlag::ImpedanceValid, poll, cancel)?;
        self.read_measurement()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mock::SimulatedAd5933;
    use crate::registers::Register;

    fn fast() -> SweepTiming {
        SweepTiming {
            settle: Duration::ZERO,
            poll: PollPolicy::immediate(Duration::from_millis(200)),
        }
    }

    #[test]
    fn sweep_yields_increments_plus_one_points() {
        let mut dev = Ad5933::new(SimulatedAd5933::resistive(1000.0)).unwrap();
        let config = SweepConfig {
            start_hz: 10_000.0,
            increment_hz: 1_000.0,
            increments: 7,
            ..SweepConfig::default()
        };
        let points = dev.sweep(&config, &fast(), &CancelToken::new()).unwrap();
        assert_eq!(points.len(), 8);
        for pair in points.windows(2) {
            assert!(pair[1].frequency > pair[0].frequency);
        }
        // each increment word carries up to half a quantum of rounding error
        let quantum = crate::registers::frequency_quantum(INTERNAL_CLOCK_HZ);
        assert!((points[0].frequency - 10_000.0).abs() <= quantum);
        assert!((points[7].frequency - 17_000.0).abs() <= 8.0 * quantum);
        let nominal = config.nominal_frequencies().unwrap();
        for (p, f) in points.iter().zip(nominal) {
            assert_eq!(p.frequency, f);
        }
    }

    #[test]
    fn reported_frequencies_match_excitation() {
        let sim = SimulatedAd5933::resistive(470.0).with_external_clock_hz(4_000_000.0);
        let mut dev = Ad5933::new(sim).unwrap();
        let config = SweepConfig {
            start_hz: 5_000.0,
            increment_hz: 250.0,
            increments: 4,
            clock: ClockSource::External,
            external_clock_hz: 4_000_000.0,
            ..SweepConfig::default()
        };
        let points = dev.sweep(&config, &fast(), &CancelToken::new()).unwrap();
        let excited = dev.transport().excited_frequencies();
        assert_eq!(excited.len(), points.len());
        for (p, f) in points.iter().zip(excited) {
            assert_eq!(p.frequency, *f);
        }
        let nominal = config.nominal_frequencies().unwrap();
        for (p, f) in points.iter().zip(nominal) {
            assert_eq!(p.frequency, f);
        }
    }

    #[test]
    fn mode_sequence_follows_state_machine() {
        let mut dev = Ad5933::new(SimulatedAd5933::resistive(1000.0)).unwrap();
        let config = SweepConfig {
            increments: 2,
            ..SweepConfig::default()
        };
        dev.transport_mut().clear_log();
        dev.sweep(&config, &fast(), &CancelToken::new()).unwrap();
        let modes: Vec<u8> = dev
            .transport()
            .writes()
            .into_iter()
            .filter(|(reg, _)| *reg == Register::ControlHigh.addr())
            .map(|(_, v)| v & 0xF0)
            .filter(|m| *m != 0x00 && *m != 0xA0) // voltage/PGA writes keep the reset mode
            .collect();
        assert_eq!(modes, vec![0xB0, 0x10, 0x20, 0x30, 0x30, 0xB0]);
    }

    #[test]
    fn configuration_writes_clock_before_frequency_words() {
        let mut dev = Ad5933::new(SimulatedAd5933::resistive(1000.0)).unwrap();
        dev.transport_mut().clear_log();
        dev.configure(&SweepConfig::default()).unwrap();
        let writes = dev.transport().writes();
        let clock = writes
            .iter()
            .position(|(r, _)| *r == Register::ControlLow.addr())
            .unwrap();
        let start = writes
            .iter()
            .position(|(r, _)| *r == Register::StartFrequency2.addr())
            .unwrap();
        assert!(clock < start);
    }

    #[test]
    fn lagging_status_is_polled_until_valid() {
        let mut sim = SimulatedAd5933::resistive(1000.0);
        sim.set_polls_until_valid(3);
        let mut dev = Ad5933::new(sim).unwrap();
        let config = SweepConfig {
            increments: 3,
            ..SweepConfig::default()
        };
        let points = dev.sweep(&config, &fast(), &CancelToken::new()).unwrap();
        assert_eq!(points.len(), 4);
    }

    #[test]
    fn stuck_measurement_times_out() {
        let mut sim = SimulatedAd5933::resistive(1000.0);
        sim.set_impedance_stuck(true);
        let mut dev = Ad5933::new(sim).unwrap();
        let timing = SweepTiming {
            settle: Duration::ZERO,
            poll: PollPolicy::immediate(Duration::from_millis(10)),
        };
        let err = dev
            .sweep(&SweepConfig::default(), &timing, &CancelToken::new())
            .unwrap_err();
        assert!(matches!(
            err,
            DriverError::MeasurementTimeout {
                flag: "impedance-valid",
                ..
            }
        ));
    }

    #[test]
    fn missing_sweep_complete_is_a_protocol_error() {
        let mut sim = SimulatedAd5933::resistive(1000.0);
        sim.set_sweep_complete_suppressed(true);
        let mut dev = Ad5933::new(sim).unwrap();
        let config = SweepConfig {
            increments: 2,
            ..SweepConfig::default()
        };
        let err = dev
            .sweep(&config, &fast(), &CancelToken::new())
            .unwrap_err();
        assert!(matches!(err, DriverError::Protocol(_)), "{err:?}");
        assert_eq!(dev.transport().excited_frequencies().len(), 3);
    }

    #[test]
    fn configure_updates_session_settings() {
        let mut dev = Ad5933::new(SimulatedAd5933::resistive(1000.0)).unwrap();
        let config = SweepConfig {
            output_voltage: OutputVoltage::Mv400pp,
            pga_gain: PgaGain::X5,
            clock: ClockSource::External,
            external_clock_hz: 2_000_000.0,
            ..SweepConfig::default()
        };
        dev.configure(&config).unwrap();
        assert_eq!(dev.output_voltage(), OutputVoltage::Mv400pp);
        assert_eq!(dev.pga_gain(), PgaGain::X5);
        assert_eq!(dev.clock_source(), ClockSource::External);
        assert_eq!(dev.clock_hz(), 2_000_000.0);
    }

    #[test]
    fn transport_error_aborts_sweep() {
        let mut sim = SimulatedAd5933::resistive(1000.0);
        sim.fail_on(Register::ImaginaryLow);
        let mut dev = Ad5933::new(sim).unwrap();
        let err = dev
            .sweep(&SweepConfig::default(), &fast(), &CancelToken::new())
            .unwrap_err();
        assert!(matches!(err, DriverError::Transport { register: 0x97, .. }));
    }

    #[test]
    fn cancelled_sweep_stops() {
        let mut dev = Ad5933::new(SimulatedAd5933::resistive(1000.0)).unwrap();
        let cancel = CancelToken::new();
        cancel.cancel();
        let err = dev
            .sweep(&SweepConfig::default(), &fast(), &cancel)
            .unwrap_err();
        assert!(matches!(err, DriverError::Cancelled));
    }

    #[test]
    fn engine_reports_state() {
        let mut dev = Ad5933::new(SimulatedAd5933::resistive(1000.0)).unwrap();
        let mut engine = SweepEngine::new(&mut dev, fast(), CancelToken::new());
        assert_eq!(engine.state(), SweepState::Idle);
        engine.run(&SweepConfig::default()).unwrap();
        assert_eq!(engine.state(), SweepState::Complete);
        // a finished engine can run again
        assert_eq!(engine.run(&SweepConfig::default()).unwrap().len(), 11);
    }

    #[test]
    fn range_config() {
        let config = SweepConfig::from_range(1_000.0, 2_000.0, 11).unwrap();
        assert_eq!(config.increments, 10);
        assert_eq!(config.increment_hz, 100.0);
        assert!(SweepConfig::from_range(2_000.0, 1_000.0, 3).is_err());
        assert!(SweepConfig::from_range(1_000.0, 2_000.0, 0).is_err());
    }

    #[test]
    fn encoding_rejects_out_of_range_sweeps() {
        let too_many = SweepConfig {
            increments: 600,
            ..SweepConfig::default()
        };
        assert!(matches!(
            too_many.encode(),
            Err(DriverError::EncodingOverflow { bits: 9, .. })
        ));

        let past_end = SweepConfig {
            start_hz: 100_000.0,
            increment_hz: 100_000.0,
            increments: 500,
            ..SweepConfig::default()
        };
        assert!(matches!(
            past_end.encode(),
            Err(DriverError::EncodingOverflow {
                field: "end frequency",
                ..
            })
        ));

        let zero_step = SweepConfig {
            increment_hz: 0.0,
            ..SweepConfig::default()
        };
        assert!(matches!(zero_step.encode(), Err(DriverError::Config(_))));
    }

    #[test]
    fn repeat_point_measures_same_frequency() {
        let mut dev = Ad5933::new(SimulatedAd5933::resistive(1000.0)).unwrap();
        let config = SweepConfig {
            increments: 0,
            ..SweepConfig::default()
        };
        dev.configure(&config).unwrap();
        dev.init_start_frequency().unwrap();
        dev.start_sweep().unwrap();
        let poll = PollPolicy::immediate(Duration::from_millis(100));
        let cancel = CancelToken::new();
        dev.wait_for(StatusFlag::ImpedanceValid, &poll, &cancel)
            .unwrap();
        let first = dev.read_measurement().unwrap();
        let again = dev.repeat_point(&poll, &cancel).unwrap();
        assert_eq!(first, again);
        let excited = dev.transport().excited_frequencies();
        assert_eq!(excited.len(), 2);
        assert_eq!(excited[0], excited[1]);
    }

    #[test]
    fn json_config_fills_defaults() {
        let config: SweepConfig = serde_json::from_str(
            r#"{"start_hz": 1000.0, "clock": "external", "output_voltage": "mv200pp"}"#,
        )
        .unwrap();
        assert_eq!(config.start_hz, 1000.0);
        assert_eq!(config.clock, ClockSource::External);
        assert_eq!(config.increments, SweepConfig::default().increments);
        assert_eq!(config.clock_hz(), DEFAULT_EXTERNAL_CLOCK_HZ);
    }
}
