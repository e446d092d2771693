//! AD5933 device session.
//!
//! [`Ad5933`] owns the control-transfer channel and a shadow copy of the two
//! control bytes. Every setter that touches a shared byte reads the register
//! from the device first, so the shadow always follows what the chip holds.
//!
//! # Register access
//!
//! The bridge firmware exposes one vendor request for single-byte access:
//!
//! - write: OUT, `wIndex = (value << 8) | register`, no data stage
//! - read:  IN,  `wIndex = register`, one-byte data stage
//!
//! There is no multi-byte transfer. Wide fields are written one byte at a time,
//! most significant byte first, and a failed transfer is never retried here.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use log::{debug, trace, warn};
use num_complex::Complex64;

use crate::errors::{DriverError, Result, VerificationMismatch};
use crate::registers::{
    self, be_bytes, check_nine_bit, decode_temperature, ClockSource, Mode, OutputVoltage,
    PgaGain, Register, SettlingMultiplier, Status, CLOCK_EXTERNAL, DEFAULT_EXTERNAL_CLOCK_HZ,
    INTERNAL_CLOCK_HZ, MAX_FREQUENCY_WORD, MODE_MASK, PGA_MASK, RESET,
    SETTLING_MULTIPLIER_MASK, VOLTAGE_MASK,
};
use crate::usb::{ControlTransport, Direction, REGISTER_REQUEST, REGISTER_VALUE};

// ============================================================================
// Constants
// ============================================================================

const DEFAULT_POLL_INTERVAL: Duration = Duration::from_millis(1);
const DEFAULT_POLL_MAX_INTERVAL: Duration = Duration::from_millis(50);
const DEFAULT_POLL_TIMEOUT: Duration = Duration::from_secs(5);

// ============================================================================
// Polling
// ============================================================================

/// Status-register flag to wait for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StatusFlag {
    TemperatureValid,
    ImpedanceValid,
    SweepComplete,
}

impl StatusFlag {
    pub fn is_set(self, status: Status) -> bool {
        match self {
            StatusFlag::TemperatureValid => status.temperature_valid(),
            StatusFlag::ImpedanceValid => status.impedance_valid(),
            StatusFlag::SweepComplete => status.sweep_complete(),
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            StatusFlag::TemperatureValid => "temperature-valid",
            StatusFlag::ImpedanceValid => "impedance-valid",
            StatusFlag::SweepComplete => "sweep-complete",
        }
    }
}

/// Bounded status polling with exponential backoff.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PollPolicy {
    /// Delay after the first unsuccessful poll.
    pub interval: Duration,
    /// Upper bound on the delay between polls.
    pub max_interval: Duration,
    /// Growth factor applied to the delay after every unsuccessful poll.
    pub backoff: f64,
    /// Total time allowed before giving up with `MeasurementTimeout`.
    pub timeout: Duration,
}

impl Default for PollPolicy {
    fn default() -> Self {
        Self {
            interval: DEFAULT_POLL_INTERVAL,
            max_interval: DEFAULT_POLL_MAX_INTERVAL,
            backoff: 2.0,
            timeout: DEFAULT_POLL_TIMEOUT,
        }
    }
}

impl PollPolicy {
    /// Poll back to back with no delay; only the timeout bounds the wait.
    pub fn immediate(timeout: Duration) -> Self {
        Self {
            interval: Duration::ZERO,
            max_interval: Duration::ZERO,
            backoff: 1.0,
            timeout,
        }
    }

    fn next_interval(&self, current: Duration) -> Duration {
        let next = current.as_secs_f64() * self.backoff.max(1.0);
        if next.is_finite() && next < self.max_interval.as_secs_f64() {
            Duration::from_secs_f64(next)
        } else {
            self.max_interval
        }
    }
}

/// Cooperative cancellation flag, checked between status polls.
#[derive(Debug, Clone, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

// ============================================================================
// Ad5933 Session
// ============================================================================

/// One connected AD5933.
///
/// All device access goes through this value; callers serialize operations by
/// owning it. Writing configuration registers through [`Ad5933::write_register`]
/// bypasses the shadow copy, so prefer the typed setters.
///
/// # Example
/// ```ignore
/// let transport = UsbConnector::default().open()?;
/// let mut device = Ad5933::new(transport)?;
/// println!("die temperature: {:.2} °C", device.measure_temperature(&PollPolicy::default())?);
/// ```
pub struct Ad5933<T: ControlTransport> {
    transport: T,
    control_high: u8,
    control_low: u8,
    clock: ClockSource,
    external_clock_hz: f64,
    verify_writes: bool,
    mismatches: usize,
}

impl<T: ControlTransport> Ad5933<T> {
    // ------------------------------------------------------------------------
    // Constructors
    // ------------------------------------------------------------------------

    /// Wrap an opened transport and load the control bytes into the shadow copy.
    pub fn new(transport: T) -> Result<Self> {
        let mut device = Self {
            transport,
            control_high: 0,
            control_low: 0,
            clock: ClockSource::Internal,
            external_clock_hz: DEFAULT_EXTERNAL_CLOCK_HZ,
            verify_writes: false,
            mismatches: 0,
        };
        device.control_high = device.read_register(Register::ControlHigh)?;
        device.control_low = device.read_register(Register::ControlLow)?;
        device.clock = if device.control_low & CLOCK_EXTERNAL != 0 {
            ClockSource::External
        } else {
            ClockSource::Internal
        };
        debug!(
            "session opened: control={:#04X}{:02X}, clock={:?}",
            device.control_high, device.control_low, device.clock
        );
        Ok(device)
    }

    /// Read back every configuration write and report mismatches.
    pub fn with_verification(mut self, enabled: bool) -> Self {
        self.verify_writes = enabled;
        self
    }

    /// Release the transport.
    pub fn into_inner(self) -> T {
        self.transport
    }

    pub fn transport(&self) -> &T {
        &self.transport
    }

    pub fn transport_mut(&mut self) -> &mut T {
        &mut self.transport
    }

    // ------------------------------------------------------------------------
    // Register Access
    // ------------------------------------------------------------------------

    /// Read one register.
    pub fn read_register(&mut self, register: Register) -> Result<u8> {
        let mut buf = [0u8; 1];
        let n = self
            .transport
            .control_transfer(
                Direction::In,
                REGISTER_REQUEST,
                REGISTER_VALUE,
                register.addr() as u16,
                &mut buf,
            )
            .map_err(|e| e.at(register.addr()))?;
        if n != 1 {
            return Err(crate::errors::TransportError::ShortTransfer {
                expected: 1,
                actual: n,
            }
            .at(register.addr()));
        }
        trace!("read {} -> {:#04X}", register, buf[0]);
        Ok(buf[0])
    }

    /// Write one register. No read-back.
    pub fn write_register(&mut self, register: Register, value: u8) -> Result<()> {
        let index = ((value as u16) << 8) | register.addr() as u16;
        self.transport
            .control_transfer(
                Direction::Out,
                REGISTER_REQUEST,
                REGISTER_VALUE,
                index,
                &mut [],
            )
            .map_err(|e| e.at(register.addr()))?;
        trace!("write {} <- {:#04X}", register, value);
        Ok(())
    }

    /// Write one register and read it back.
    ///
    /// A mismatch is returned, not raised: mode bits and self-clearing bits
    /// legitimately read back differently.
    pub fn write_register_checked(
        &mut self,
        register: Register,
        value: u8,
    ) -> Result<Option<VerificationMismatch>> {
        self.write_register(register, value)?;
        let read_back = self.read_register(register)?;
        if read_back == value {
            return Ok(None);
        }
        let mismatch = VerificationMismatch {
            register: register.addr(),
            written: value,
            read_back,
        };
        warn!(
            "write to {} did not take effect: wrote {:#04X}, read {:#04X}",
            register, value, read_back
        );
        self.mismatches += 1;
        Ok(Some(mismatch))
    }

    /// Number of verification mismatches seen in this session.
    pub fn verification_mismatches(&self) -> usize {
        self.mismatches
    }

    fn write_config(&mut self, register: Register, value: u8) -> Result<()> {
        if self.verify_writes {
            self.write_register_checked(register, value).map(|_| ())
        } else {
            self.write_register(register, value)
        }
    }

    /// Write a big-endian field MSB first as discrete single-byte writes.
    fn write_wide<const N: usize>(&mut self, registers: [Register; N], value: u32) -> Result<()> {
        for (register, byte) in registers.into_iter().zip(be_bytes::<N>(value)) {
            self.write_config(register, byte)?;
        }
        Ok(())
    }

    /// Read-modify-write of the bits selected by `mask`.
    fn update_bits(&mut self, register: Register, mask: u8, bits: u8) -> Result<u8> {
        let current = self.read_register(register)?;
        let updated = (current & !mask) | (bits & mask);
        self.write_config(register, updated)?;
        Ok(updated)
    }

    fn update_control_high(&mut self, mask: u8, bits: u8) -> Result<()> {
        let before = self.control_high;
        self.control_high = self.update_bits(Register::ControlHigh, mask, bits)?;
        debug!(
            "control high {:#04X} -> {:#04X}",
            before, self.control_high
        );
        Ok(())
    }

    fn update_control_low(&mut self, mask: u8, bits: u8) -> Result<()> {
        self.control_low = self.update_bits(Register::ControlLow, mask, bits)?;
        Ok(())
    }

    /// Current status flags.
    pub fn status(&mut self) -> Result<Status> {
        self.read_register(Register::Status).map(Status)
    }

    // ------------------------------------------------------------------------
    // Device Configuration
    // ------------------------------------------------------------------------

    /// Program the 24-bit start frequency word.
    pub fn set_starting_frequency(&mut self, word: u32) -> Result<()> {
        check_frequency_word("start frequency", word)?;
        self.write_wide(registers::START_FREQUENCY, word)?;
        debug!("start frequency word = {:#08X}", word);
        Ok(())
    }

    /// Program the 24-bit frequency increment word.
    pub fn set_frequency_step(&mut self, word: u32) -> Result<()> {
        check_frequency_word("frequency increment", word)?;
        self.write_wide(registers::FREQUENCY_INCREMENT, word)?;
        debug!("frequency increment word = {:#08X}", word);
        Ok(())
    }

    /// Program the number of increments (0-511).
    pub fn set_step_number(&mut self, count: u16) -> Result<()> {
        let count = check_nine_bit("number of increments", count)?;
        self.write_wide(
            [Register::IncrementCountHigh, Register::IncrementCountLow],
            count as u32,
        )?;
        debug!("number of increments = {}", count);
        Ok(())
    }

    /// Program the number of settling cycles (0-511).
    ///
    /// This overwrites the whole settling-cycles word, multiplier included;
    /// call [`Ad5933::set_settling_multiplier`] afterwards.
    pub fn set_settling_cycles(&mut self, cycles: u16) -> Result<()> {
        let cycles = check_nine_bit("settling cycles", cycles)?;
        self.write_wide(
            [Register::SettlingCyclesHigh, Register::SettlingCyclesLow],
            cycles as u32,
        )?;
        debug!("settling cycles = {}", cycles);
        Ok(())
    }

    pub fn set_settling_multiplier(&mut self, multiplier: SettlingMultiplier) -> Result<()> {
        self.update_bits(
            Register::SettlingCyclesHigh,
            SETTLING_MULTIPLIER_MASK,
            multiplier.to_bits(),
        )?;
        debug!("settling multiplier = {:?}", multiplier);
        Ok(())
    }

    pub fn set_voltage_output(&mut self, voltage: OutputVoltage) -> Result<()> {
        self.update_control_high(VOLTAGE_MASK, voltage.to_bits())
    }

    pub fn set_pga(&mut self, gain: PgaGain) -> Result<()> {
        self.update_control_high(PGA_MASK, gain.to_bits())
    }

    /// Select the system clock. Must happen before frequency words are encoded.
    pub fn select_clock(&mut self, source: ClockSource) -> Result<()> {
        let bits = match source {
            ClockSource::Internal => 0,
            ClockSource::External => CLOCK_EXTERNAL,
        };
        self.update_control_low(CLOCK_EXTERNAL, bits)?;
        self.clock = source;
        debug!("clock = {:?} ({} Hz)", source, self.clock_hz());
        Ok(())
    }

    /// Nominal frequency of the external clock. The chip cannot report it.
    pub fn set_external_clock_hz(&mut self, hz: f64) -> Result<()> {
        if !hz.is_finite() || hz <= 0.0 {
            return Err(DriverError::Config(format!(
                "external clock must be positive, got {hz}"
            )));
        }
        self.external_clock_hz = hz;
        Ok(())
    }

    /// Pulse the reset bit of the low control byte.
    pub fn reset(&mut self) -> Result<()> {
        self.update_control_low(RESET, RESET)?;
        // The bit is not self-clearing on every silicon revision.
        self.update_control_low(RESET, 0)?;
        debug!("device reset");
        Ok(())
    }

    pub fn clock_source(&self) -> ClockSource {
        self.clock
    }

    /// Frequency of the clock currently selected, in hertz.
    pub fn clock_hz(&self) -> f64 {
        match self.clock {
            ClockSource::Internal => INTERNAL_CLOCK_HZ,
            ClockSource::External => self.external_clock_hz,
        }
    }

    /// Shadow copy of the control register, `(high, low)`.
    pub fn control_shadow(&self) -> (u8, u8) {
        (self.control_high, self.control_low)
    }

    pub fn output_voltage(&self) -> OutputVoltage {
        OutputVoltage::from_bits(self.control_high)
    }

    pub fn pga_gain(&self) -> PgaGain {
        PgaGain::from_bits(self.control_high)
    }

    // ------------------------------------------------------------------------
    // Mode Transitions
    // ------------------------------------------------------------------------

    /// Write the mode nibble, keeping voltage and gain bits.
    pub fn set_mode(&mut self, mode: Mode) -> Result<()> {
        self.update_control_high(MODE_MASK, mode.to_bits())?;
        debug!("mode -> {:?}", mode);
        Ok(())
    }

    pub fn enter_standby(&mut self) -> Result<()> {
        self.set_mode(Mode::Standby)
    }

    pub fn init_start_frequency(&mut self) -> Result<()> {
        self.set_mode(Mode::InitStartFrequency)
    }

    pub fn start_sweep(&mut self) -> Result<()> {
        self.set_mode(Mode::StartSweep)
    }

    pub fn increment_frequency(&mut self) -> Result<()> {
        self.set_mode(Mode::IncrementFrequency)
    }

    pub fn repeat_frequency(&mut self) -> Result<()> {
        self.set_mode(Mode::RepeatFrequency)
    }

    pub fn measure_temperature_mode(&mut self) -> Result<()> {
        self.set_mode(Mode::MeasureTemperature)
    }

    pub fn power_down(&mut self) -> Result<()> {
        self.set_mode(Mode::PowerDown)
    }

    // ------------------------------------------------------------------------
    // Measurements
    // ------------------------------------------------------------------------

    /// Poll the status register until `flag` is set.
    pub fn wait_for(
        &mut self,
        flag: StatusFlag,
        policy: &PollPolicy,
        cancel: &CancelToken,
    ) -> Result<Status> {
        let start = Instant::now();
        let mut interval = policy.interval;
        let mut polls = 0u32;
        loop {
            if cancel.is_cancelled() {
                debug!("cancelled while waiting for {}", flag.name());
                return Err(DriverError::Cancelled);
            }

            let status = self.status()?;
            polls += 1;
            if flag.is_set(status) {
                trace!("{} after {} poll(s)", flag.name(), polls);
                return Ok(status);
            }

            let waited = start.elapsed();
            if waited >= policy.timeout {
                return Err(DriverError::MeasurementTimeout {
                    flag: flag.name(),
                    waited,
                });
            }
            thread::sleep(interval.min(policy.timeout - waited));
            interval = policy.next_interval(interval);
        }
    }

    /// Read the real and imaginary results of the current point.
    pub fn read_measurement(&mut self) -> Result<Complex64> {
        let mut bytes = [0u8; 4];
        for (byte, register) in bytes.iter_mut().zip(registers::MEASUREMENT) {
            *byte = self.read_register(register)?;
        }
        let real = i16::from_be_bytes([bytes[0], bytes[1]]);
        let imaginary = i16::from_be_bytes([bytes[2], bytes[3]]);
        Ok(Complex64::new(real as f64, imaginary as f64))
    }

    /// One-shot die temperature in °C.
    pub fn measure_temperature(&mut self, policy: &PollPolicy) -> Result<f64> {
        self.measure_temperature_with_cancel(policy, &CancelToken::new())
    }

    pub fn measure_temperature_with_cancel(
        &mut self,
        policy: &PollPolicy,
        cancel: &CancelToken,
    ) -> Result<f64> {
        self.measure_temperature_mode()?;
        self.wait_for(StatusFlag::TemperatureValid, policy, cancel)?;
        let high = self.read_register(Register::TemperatureHigh)?;
        let low = self.read_register(Register::TemperatureLow)?;
        let temperature = decode_temperature(high, low);
        debug!(
            "temperature raw={:#04X}{:02X} -> {:.3} °C",
            high, low, temperature
        );
        Ok(temperature)
    }
}

fn check_frequency_word(field: &'static str, word: u32) -> Result<()> {
    if word > MAX_FREQUENCY_WORD {
        return Err(DriverError::EncodingOverflow {
            field,
            value: word as u64,
            bits: registers::FREQUENCY_WORD_BITS,
        });
    }
    Ok(())
}
