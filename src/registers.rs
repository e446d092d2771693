//! AD5933 register map and bit-level encodings.
//!
//! Every register is one byte wide on the wire. Multi-byte fields are split
//! across consecutive addresses, most significant byte at the lowest address.
//!
//! # Control register
//!
//! ```text
//! 0x80 (high): D15-D12 mode | D11 reserved | D10-D9 output voltage | D8 PGA
//! 0x81 (low):  D7-D5 reserved | D4 reset | D3 external clock | D2-D0 reserved
//! ```

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::errors::{DriverError, Result};

// ============================================================================
// Register Addresses
// ============================================================================

/// Addressable registers of the AD5933.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum Register {
    ControlHigh = 0x80,
    ControlLow = 0x81,
    StartFrequency2 = 0x82,
    StartFrequency1 = 0x83,
    StartFrequency0 = 0x84,
    FrequencyIncrement2 = 0x85,
    FrequencyIncrement1 = 0x86,
    FrequencyIncrement0 = 0x87,
    IncrementCountHigh = 0x88,
    IncrementCountLow = 0x89,
    SettlingCyclesHigh = 0x8A,
    SettlingCyclesLow = 0x8B,
    Status = 0x8F,
    TemperatureHigh = 0x92,
    TemperatureLow = 0x93,
    RealHigh = 0x94,
    RealLow = 0x95,
    ImaginaryHigh = 0x96,
    ImaginaryLow = 0x97,
}

impl Register {
    /// Bus address of the register.
    #[inline]
    pub fn addr(self) -> u8 {
        self as u8
    }

    pub fn from_addr(addr: u8) -> Option<Self> {
        use Register::*;
        Some(match addr {
            0x80 => ControlHigh,
            0x81 => ControlLow,
            0x82 => StartFrequency2,
            0x83 => StartFrequency1,
            0x84 => StartFrequency0,
            0x85 => FrequencyIncrement2,
            0x86 => FrequencyIncrement1,
            0x87 => FrequencyIncrement0,
            0x88 => IncrementCountHigh,
            0x89 => IncrementCountLow,
            0x8A => SettlingCyclesHigh,
            0x8B => SettlingCyclesLow,
            0x8F => Status,
            0x92 => TemperatureHigh,
            0x93 => TemperatureLow,
            0x94 => RealHigh,
            0x95 => RealLow,
            0x96 => ImaginaryHigh,
            0x97 => ImaginaryLow,
            _ => return None,
        })
    }
}

impl fmt::Display for Register {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}({:#04X})", self, self.addr())
    }
}

/// Start frequency word, MSB first.
pub const START_FREQUENCY: [Register; 3] = [
    Register::StartFrequency2,
    Register::StartFrequency1,
    Register::StartFrequency0,
];

/// Frequency increment word, MSB first.
pub const FREQUENCY_INCREMENT: [Register; 3] = [
    Register::FrequencyIncrement2,
    Register::FrequencyIncrement1,
    Register::FrequencyIncrement0,
];

/// Read order of one measurement: real MSB/LSB, then imaginary MSB/LSB.
pub const MEASUREMENT: [Register; 4] = [
    Register::RealHigh,
    Register::RealLow,
    Register::ImaginaryHigh,
    Register::ImaginaryLow,
];

// ============================================================================
// Control / Status Bits
// ============================================================================

pub const MODE_MASK: u8 = 0xF0;
pub const VOLTAGE_MASK: u8 = 0x06;
pub const PGA_MASK: u8 = 0x01;
pub const CLOCK_EXTERNAL: u8 = 0x08;
pub const RESET: u8 = 0x10;
/// D10-D9 of the settling-cycles word, i.e. bits 2:1 of its high byte.
pub const SETTLING_MULTIPLIER_MASK: u8 = 0x06;

pub const STATUS_TEMPERATURE_VALID: u8 = 0x01;
pub const STATUS_IMPEDANCE_VALID: u8 = 0x02;
pub const STATUS_SWEEP_COMPLETE: u8 = 0x04;

/// Internal oscillator of the AD5933.
pub const INTERNAL_CLOCK_HZ: f64 = 16_776_000.0;
/// Crystal fitted on the evaluation board's external clock input.
pub const DEFAULT_EXTERNAL_CLOCK_HZ: f64 = 4_000_000.0;

pub const FREQUENCY_WORD_BITS: u8 = 24;
pub const MAX_FREQUENCY_WORD: u32 = (1 << FREQUENCY_WORD_BITS) - 1;
/// Increment count and settling cycles are 9-bit fields.
pub const NINE_BIT_MAX: u16 = 511;

// ============================================================================
// Closed Enumerations
// ============================================================================

/// Control-register mode nibble (D15-D12).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Mode {
    InitStartFrequency,
    StartSweep,
    IncrementFrequency,
    RepeatFrequency,
    MeasureTemperature,
    PowerDown,
    Standby,
}

impl Mode {
    pub fn to_bits(self) -> u8 {
        match self {
            Mode::InitStartFrequency => 0x10,
            Mode::StartSweep => 0x20,
            Mode::IncrementFrequency => 0x30,
            Mode::RepeatFrequency => 0x40,
            Mode::MeasureTemperature => 0x90,
            Mode::PowerDown => 0xA0,
            Mode::Standby => 0xB0,
        }
    }

    /// Decode the mode nibble of a control-high byte. Unassigned codes give `None`.
    pub fn from_bits(byte: u8) -> Option<Self> {
        match byte & MODE_MASK {
            0x10 => Some(Mode::InitStartFrequency),
            0x20 => Some(Mode::StartSweep),
            0x30 => Some(Mode::IncrementFrequency),
            0x40 => Some(Mode::RepeatFrequency),
            0x90 => Some(Mode::MeasureTemperature),
            0xA0 => Some(Mode::PowerDown),
            0xB0 => Some(Mode::Standby),
            _ => None,
        }
    }
}

/// Excitation output range (D10-D9).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OutputVoltage {
    #[default]
    V2pp,
    Mv200pp,
    Mv400pp,
    V1pp,
}

impl OutputVoltage {
    pub fn to_bits(self) -> u8 {
        match self {
            OutputVoltage::V2pp => 0x00,
            OutputVoltage::Mv200pp => 0x02,
            OutputVoltage::Mv400pp => 0x04,
            OutputVoltage::V1pp => 0x06,
        }
    }

    pub fn from_bits(byte: u8) -> Self {
        match byte & VOLTAGE_MASK {
            0x02 => OutputVoltage::Mv200pp,
            0x04 => OutputVoltage::Mv400pp,
            0x06 => OutputVoltage::V1pp,
            _ => OutputVoltage::V2pp,
        }
    }
}

impl FromStr for OutputVoltage {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "2v" | "2vpp" | "v2pp" => Ok(OutputVoltage::V2pp),
            "200mv" | "200mvpp" | "mv200pp" => Ok(OutputVoltage::Mv200pp),
            "400mv" | "400mvpp" | "mv400pp" => Ok(OutputVoltage::Mv400pp),
            "1v" | "1vpp" | "v1pp" => Ok(OutputVoltage::V1pp),
            _ => Err(format!(
                "invalid output voltage '{s}'. Supported: 2v, 1v, 400mv, 200mv."
            )),
        }
    }
}

/// Programmable gain amplifier setting (D8).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PgaGain {
    #[default]
    X1,
    X5,
}

impl PgaGain {
    pub fn to_bits(self) -> u8 {
        match self {
            PgaGain::X1 => 0x01,
            PgaGain::X5 => 0x00,
        }
    }

    pub fn from_bits(byte: u8) -> Self {
        if byte & PGA_MASK != 0 {
            PgaGain::X1
        } else {
            PgaGain::X5
        }
    }
}

impl FromStr for PgaGain {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "1" | "x1" | "1x" => Ok(PgaGain::X1),
            "5" | "x5" | "5x" => Ok(PgaGain::X5),
            _ => Err(format!("invalid PGA gain '{s}'. Supported: x1, x5.")),
        }
    }
}

/// System clock source (D3 of the low control byte).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ClockSource {
    #[default]
    Internal,
    External,
}

impl FromStr for ClockSource {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "int" | "internal" => Ok(ClockSource::Internal),
            "ext" | "external" => Ok(ClockSource::External),
            _ => Err(format!("invalid clock '{s}'. Supported: internal, external.")),
        }
    }
}

/// Settling-time multiplier (D10-D9 of the settling-cycles word).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SettlingMultiplier {
    #[default]
    X1,
    X2,
    X4,
}

impl SettlingMultiplier {
    pub fn to_bits(self) -> u8 {
        match self {
            SettlingMultiplier::X1 => 0x00,
            SettlingMultiplier::X2 => 0x02,
            SettlingMultiplier::X4 => 0x06,
        }
    }
}

impl FromStr for SettlingMultiplier {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "1" | "x1" | "1x" => Ok(SettlingMultiplier::X1),
            "2" | "x2" | "2x" => Ok(SettlingMultiplier::X2),
            "4" | "x4" | "4x" => Ok(SettlingMultiplier::X4),
            _ => Err(format!(
                "invalid settling multiplier '{s}'. Supported: x1, x2, x4."
            )),
        }
    }
}

/// Snapshot of the status register. The flags are independent.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Status(pub u8);

impl Status {
    #[inline]
    pub fn temperature_valid(self) -> bool {
        self.0 & STATUS_TEMPERATURE_VALID != 0
    }

    #[inline]
    pub fn impedance_valid(self) -> bool {
        self.0 & STATUS_IMPEDANCE_VALID != 0
    }

    #[inline]
    pub fn sweep_complete(self) -> bool {
        self.0 & STATUS_SWEEP_COMPLETE != 0
    }
}

// ============================================================================
// Encodings
// ============================================================================

/// Frequency-word counts per hertz: `2^27 / (clock / 4)`.
#[inline]
pub fn conversion_factor(clock_hz: f64) -> f64 {
    (1u64 << 27) as f64 / (clock_hz / 4.0)
}

/// Resolution of the frequency word in hertz for a given clock.
#[inline]
pub fn frequency_quantum(clock_hz: f64) -> f64 {
    1.0 / conversion_factor(clock_hz)
}

/// Encode a frequency (or increment) in hertz as a 24-bit word.
///
/// `clock_hz` must be the clock that will be active while the word is in use.
pub fn frequency_to_word(field: &'static str, freq_hz: f64, clock_hz: f64) -> Result<u32> {
    if !freq_hz.is_finite() || freq_hz < 0.0 {
        return Err(DriverError::Config(format!(
            "{field} must be a non-negative frequency, got {freq_hz}"
        )));
    }
    if !clock_hz.is_finite() || clock_hz <= 0.0 {
        return Err(DriverError::Config(format!(
            "clock must be positive, got {clock_hz}"
        )));
    }

    let word = (freq_hz * conversion_factor(clock_hz)).round();
    if word > MAX_FREQUENCY_WORD as f64 {
        return Err(DriverError::EncodingOverflow {
            field,
            value: word as u64,
            bits: FREQUENCY_WORD_BITS,
        });
    }
    Ok(word as u32)
}

/// Inverse of [`frequency_to_word`].
#[inline]
pub fn word_to_frequency(word: u32, clock_hz: f64) -> f64 {
    word as f64 / conversion_factor(clock_hz)
}

/// Reject values that do not fit a 9-bit field.
pub fn check_nine_bit(field: &'static str, value: u16) -> Result<u16> {
    if value > NINE_BIT_MAX {
        return Err(DriverError::EncodingOverflow {
            field,
            value: value as u64,
            bits: 9,
        });
    }
    Ok(value)
}

/// Decode the 14-bit two's complement temperature reading (1/32 °C per LSB).
///
/// D15-D14 of the register are don't-care; D13 is the sign bit.
pub fn decode_temperature(high: u8, low: u8) -> f64 {
    let raw = (((high & 0x3F) as u16) << 8) | low as u16;
    if raw & 0x2000 != 0 {
        (raw as f64 - 16384.0) / 32.0
    } else {
        raw as f64 / 32.0
    }
}

/// Split a big-endian word into its low `N` bytes, MSB first.
#[inline]
pub fn be_bytes<const N: usize>(value: u32) -> [u8; N] {
    let all = value.to_be_bytes();
    let mut out = [0u8; N];
    out.copy_from_slice(&all[4 - N..]);
    out
}
