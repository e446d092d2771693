//! Register-level model of an AD5933 behind the USB bridge.
//!
//! [`SimulatedAd5933`] answers the same vendor control transfers as the real
//! board. It keeps written configuration, runs the mode state machine, raises
//! the status flags and fills the result registers from an impedance model, so
//! sessions can be exercised without hardware.

use std::f64::consts::PI;

use num_complex::Complex64;

use crate::errors::TransportError;
use crate::registers::{
    word_to_frequency, Mode, Register, CLOCK_EXTERNAL, DEFAULT_EXTERNAL_CLOCK_HZ,
    INTERNAL_CLOCK_HZ, STATUS_IMPEDANCE_VALID, STATUS_SWEEP_COMPLETE,
    STATUS_TEMPERATURE_VALID,
};
use crate::usb::{ControlTransport, Direction, REGISTER_REQUEST, REGISTER_VALUE};

/// Scale between admittance (S) and raw DFT magnitude in the model.
pub const DEFAULT_GAIN_CONSTANT: f64 = 1.0e7;

type ImpedanceModel = Box<dyn Fn(f64) -> Complex64 + Send>;

/// Simulated chip. See the module docs.
pub struct SimulatedAd5933 {
    regs: [u8; 256],
    impedance: ImpedanceModel,
    gain_constant: f64,
    system_phase: f64,
    external_clock_hz: f64,
    control_readback_mask: u8,

    status: u8,
    pending_polls: u32,
    polls_until_valid: u32,
    initialized: bool,
    current_word: u32,
    point_index: u16,
    temperature: (u8, u8),
    temperature_stuck: bool,
    impedance_stuck: bool,
    sweep_complete_suppressed: bool,
    fail_register: Option<u8>,

    log: Vec<(Direction, u8, u8)>,
    excited: Vec<f64>,
}

impl SimulatedAd5933 {
    /// Chip measuring an arbitrary impedance `Z(f)` in ohms.
    pub fn new<F>(impedance: F) -> Self
    where
        F: Fn(f64) -> Complex64 + Send + 'static,
    {
        let mut regs = [0u8; 256];
        // Control register resets to 0xA000.
        regs[Register::ControlHigh.addr() as usize] = Mode::PowerDown.to_bits();
        Self {
            regs,
            impedance: Box::new(impedance),
            gain_constant: DEFAULT_GAIN_CONSTANT,
            system_phase: 0.0,
            external_clock_hz: DEFAULT_EXTERNAL_CLOCK_HZ,
            control_readback_mask: 0xFF,
            status: 0,
            pending_polls: 0,
            polls_until_valid: 0,
            initialized: false,
            current_word: 0,
            point_index: 0,
            temperature: (0x03, 0x20), // 25 °C
            temperature_stuck: false,
            impedance_stuck: false,
            sweep_complete_suppressed: false,
            fail_register: None,
            log: Vec::new(),
            excited: Vec::new(),
        }
    }

    /// Chip measuring a pure resistance.
    pub fn resistive(ohms: f64) -> Self {
        Self::new(move |_| Complex64::new(ohms, 0.0))
    }

    /// Chip measuring a resistor in series with a capacitor.
    pub fn series_rc(ohms: f64, farads: f64) -> Self {
        Self::new(move |f| Complex64::new(ohms, -1.0 / (2.0 * PI * f.max(1e-9) * farads)))
    }

    pub fn with_gain_constant(mut self, k: f64) -> Self {
        self.gain_constant = k;
        self
    }

    /// Fixed phase offset (radians) added by the simulated signal chain.
    pub fn with_system_phase(mut self, radians: f64) -> Self {
        self.system_phase = radians;
        self
    }

    pub fn with_external_clock_hz(mut self, hz: f64) -> Self {
        self.external_clock_hz = hz;
        self
    }

    /// Number of status reads that report "not yet valid" before each result.
    pub fn set_polls_until_valid(&mut self, polls: u32) {
        self.polls_until_valid = polls;
    }

    pub fn set_temperature_raw(&mut self, high: u8, low: u8) {
        self.temperature = (high, low);
    }

    pub fn set_temperature_stuck(&mut self, stuck: bool) {
        self.temperature_stuck = stuck;
    }

    pub fn set_impedance_stuck(&mut self, stuck: bool) {
        self.impedance_stuck = stuck;
    }

    /// Never raise sweep-complete, as a misbehaving bridge would.
    pub fn set_sweep_complete_suppressed(&mut self, suppressed: bool) {
        self.sweep_complete_suppressed = suppressed;
    }

    /// Fail every transfer that touches `register`.
    pub fn fail_on(&mut self, register: Register) {
        self.fail_register = Some(register.addr());
    }

    /// Bits of the control-high byte that read back as written.
    pub fn set_control_readback_mask(&mut self, mask: u8) {
        self.control_readback_mask = mask;
    }

    /// Set a register without going through the bus.
    pub fn poke(&mut self, register: Register, value: u8) {
        self.regs[register.addr() as usize] = value;
    }

    /// Inspect a register without going through the bus.
    pub fn peek(&self, register: Register) -> u8 {
        self.regs[register.addr() as usize]
    }

    pub fn clear_log(&mut self) {
        self.log.clear();
    }

    /// `(register, value)` of every write, in order.
    pub fn writes(&self) -> Vec<(u8, u8)> {
        self.log
            .iter()
            .filter(|(d, _, _)| *d == Direction::Out)
            .map(|&(_, reg, value)| (reg, value))
            .collect()
    }

    /// Address of every read, in order.
    pub fn reads(&self) -> Vec<u8> {
        self.log
            .iter()
            .filter(|(d, _, _)| *d == Direction::In)
            .map(|&(_, reg, _)| reg)
            .collect()
    }

    /// Excitation frequency of every measurement taken so far.
    pub fn excited_frequencies(&self) -> &[f64] {
        &self.excited
    }

    fn clock_hz(&self) -> f64 {
        if self.peek(Register::ControlLow) & CLOCK_EXTERNAL != 0 {
            self.external_clock_hz
        } else {
            INTERNAL_CLOCK_HZ
        }
    }

    fn wide(&self, registers: &[Register]) -> u32 {
        registers
            .iter()
            .fold(0u32, |acc, r| (acc << 8) | self.peek(*r) as u32)
    }

    fn increments(&self) -> u16 {
        (self.wide(&[Register::IncrementCountHigh, Register::IncrementCountLow]) & 0x1FF) as u16
    }

    fn measure_point(&mut self) {
        self.status &= !(STATUS_IMPEDANCE_VALID | STATUS_SWEEP_COMPLETE);
        if self.impedance_stuck {
            return;
        }

        let frequency = word_to_frequency(self.current_word, self.clock_hz());
        let z = (self.impedance)(frequency);
        let admittance = if z.norm() > 0.0 {
            z.inv()
        } else {
            Complex64::new(0.0, 0.0)
        };
        let sample = admittance * self.gain_constant * Complex64::from_polar(1.0, self.system_phase);
        let real = clamp_i16(sample.re).to_be_bytes();
        let imaginary = clamp_i16(sample.im).to_be_bytes();
        self.poke(Register::RealHigh, real[0]);
        self.poke(Register::RealLow, real[1]);
        self.poke(Register::ImaginaryHigh, imaginary[0]);
        self.poke(Register::ImaginaryLow, imaginary[1]);
        self.excited.push(frequency);

        self.status |= STATUS_IMPEDANCE_VALID;
        if !self.sweep_complete_suppressed && self.point_index >= self.increments() {
            self.status |= STATUS_SWEEP_COMPLETE;
        }
        self.pending_polls = self.polls_until_valid;
    }

    fn on_control_write(&mut self, value: u8) {
        match Mode::from_bits(value) {
            Some(Mode::Standby) | Some(Mode::PowerDown) => {
                self.status = 0;
                self.initialized = false;
            }
            Some(Mode::InitStartFrequency) => {
                self.status = 0;
                self.current_word = self.wide(&crate::registers::START_FREQUENCY);
                self.point_index = 0;
                self.initialized = true;
            }
            Some(Mode::StartSweep) if self.initialized => self.measure_point(),
            Some(Mode::IncrementFrequency) if self.initialized => {
                if self.point_index < self.increments() {
                    self.point_index += 1;
                    self.current_word = self
                        .current_word
                        .wrapping_add(self.wide(&crate::registers::FREQUENCY_INCREMENT));
                }
                self.measure_point();
            }
            Some(Mode::RepeatFrequency) if self.initialized => self.measure_point(),
            Some(Mode::MeasureTemperature) => {
                self.status &= !STATUS_TEMPERATURE_VALID;
                if !self.temperature_stuck {
                    let (high, low) = self.temperature;
                    self.poke(Register::TemperatureHigh, high);
                    self.poke(Register::TemperatureLow, low);
                    self.status |= STATUS_TEMPERATURE_VALID;
                }
            }
            _ => {}
        }
    }

    fn read(&mut self, addr: u8) -> u8 {
        match Register::from_addr(addr) {
            Some(Register::Status) => {
                if self.pending_polls > 0 {
                    self.pending_polls -= 1;
                    self.status & STATUS_TEMPERATURE_VALID
                } else {
                    self.status
                }
            }
            Some(Register::ControlHigh) => self.regs[addr as usize] & self.control_readback_mask,
            _ => self.regs[addr as usize],
        }
    }
}

impl ControlTransport for SimulatedAd5933 {
    fn control_transfer(
        &mut self,
        direction: Direction,
        request: u8,
        value: u16,
        index: u16,
        buf: &mut [u8],
    ) -> Result<usize, TransportError> {
        if request != REGISTER_REQUEST || value != REGISTER_VALUE {
            return Err(TransportError::Usb(rusb::Error::InvalidParam));
        }
        let addr = (index & 0xFF) as u8;
        if self.fail_register == Some(addr) {
            return Err(TransportError::Usb(rusb::Error::Io));
        }

        match direction {
            Direction::In => {
                let Some(slot) = buf.first_mut() else {
                    return Ok(0);
                };
                let byte = self.read(addr);
                *slot = byte;
                self.log.push((Direction::In, addr, byte));
                Ok(1)
            }
            Direction::Out => {
                let byte = (index >> 8) as u8;
                self.regs[addr as usize] = byte;
                self.log.push((Direction::Out, addr, byte));
                if addr == Register::ControlHigh.addr() {
                    self.on_control_write(byte);
                }
                Ok(0)
            }
        }
    }
}

fn clamp_i16(x: f64) -> i16 {
    x.round().clamp(i16::MIN as f64, i16::MAX as f64) as i16
}

#[cfg(test)]
mod tests {
    use super::*;

    fn write(sim: &mut SimulatedAd5933, register: Register, value: u8) {
        let index = ((value as u16) << 8) | register.addr() as u16;
        sim.control_transfer(Direction::Out, REGISTER_REQUEST, REGISTER_VALUE, index, &mut [])
            .unwrap();
    }

    fn read(sim: &mut SimulatedAd5933, register: Register) -> u8 {
        let mut buf = [0u8];
        sim.control_transfer(
            Direction::In,
            REGISTER_REQUEST,
            REGISTER_VALUE,
            register.addr() as u16,
            &mut buf,
        )
        .unwrap();
        buf[0]
    }

    #[test]
    fn rejects_foreign_requests() {
        let mut sim = SimulatedAd5933::resistive(100.0);
        let err = sim
            .control_transfer(Direction::In, 0xA0, 0, 0, &mut [0u8])
            .unwrap_err();
        assert!(matches!(err, TransportError::Usb(rusb::Error::InvalidParam)));
    }

    #[test]
    fn resistor_produces_real_sample() {
        let mut sim = SimulatedAd5933::resistive(1000.0);
        write(&mut sim, Register::StartFrequency2, 0x0E);
        write(&mut sim, Register::ControlHigh, Mode::InitStartFrequency.to_bits());
        write(&mut sim, Register::ControlHigh, Mode::StartSweep.to_bits());
        assert_eq!(read(&mut sim, Register::Status) & STATUS_IMPEDANCE_VALID, STATUS_IMPEDANCE_VALID);
        let real = i16::from_be_bytes([
            read(&mut sim, Register::RealHigh),
            read(&mut sim, Register::RealLow),
        ]);
        let imaginary = i16::from_be_bytes([
            read(&mut sim, Register::ImaginaryHigh),
            read(&mut sim, Register::ImaginaryLow),
        ]);
        assert_eq!((real, imaginary), (10_000, 0));
        // zero increments: the first point is also the last
        assert_ne!(read(&mut sim, Register::Status) & STATUS_SWEEP_COMPLETE, 0);
    }

    #[test]
    fn validity_can_lag_behind() {
        let mut sim = SimulatedAd5933::resistive(1000.0);
        sim.set_polls_until_valid(2);
        write(&mut sim, Register::ControlHigh, Mode::InitStartFrequency.to_bits());
        write(&mut sim, Register::ControlHigh, Mode::StartSweep.to_bits());
        assert_eq!(read(&mut sim, Register::Status), 0);
        assert_eq!(read(&mut sim, Register::Status), 0);
        assert_ne!(read(&mut sim, Register::Status) & STATUS_IMPEDANCE_VALID, 0);
    }

    #[test]
    fn gain_constant_scales_sample() {
        let mut sim = SimulatedAd5933::resistive(1000.0).with_gain_constant(2.0e6);
        write(&mut sim, Register::StartFrequency2, 0x0E);
        write(&mut sim, Register::ControlHigh, Mode::InitStartFrequency.to_bits());
        write(&mut sim, Register::ControlHigh, Mode::StartSweep.to_bits());
        let real = i16::from_be_bytes([
            read(&mut sim, Register::RealHigh),
            read(&mut sim, Register::RealLow),
        ]);
        assert_eq!(real, 2_000);
    }
}
