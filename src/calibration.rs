//! Gain-factor calibration and impedance derivation.
//!
//! A sweep against a known resistor gives one gain factor per frequency:
//!
//! ```text
//! gain = 1 / (|sample| * R_ref)
//! |Z|  = 1 / (|sample| * gain)
//! ```
//!
//! The same sweep fixes the system phase, the phase the signal chain adds on
//! its own. Later measurements report `arg(sample) - system_phase(f)`.
//!
//! When a measurement frequency is not one of the calibration frequencies the
//! gain is interpolated linearly between the neighbouring calibration points,
//! and held flat outside the calibrated range.

use std::fs::File;
use std::io::{BufReader, BufWriter};
use std::path::Path;

use log::{debug, info};
use num_complex::Complex64;
use serde::{Deserialize, Serialize};

use crate::errors::{DriverError, Result};
use crate::registers::{ClockSource, OutputVoltage, PgaGain};
use crate::sweep::{SweepConfig, SweepPoint};

/// Frequencies closer than this are treated as the same calibration point.
pub const FREQUENCY_TOLERANCE_HZ: f64 = 0.1;

// ============================================================================
// Point Math
// ============================================================================

/// Gain factor from a sample taken against a known resistance.
#[inline]
pub fn gain_factor(sample: Complex64, reference_ohms: f64) -> f64 {
    1.0 / (sample.norm() * reference_ohms)
}

/// Impedance magnitude in ohms.
///
/// A zero sample (open circuit) gives `f64::INFINITY`.
#[inline]
pub fn magnitude(sample: Complex64, gain: f64) -> f64 {
    1.0 / (sample.norm() * gain)
}

/// Argument of the sample in degrees.
#[inline]
pub fn phase_degrees(sample: Complex64) -> f64 {
    sample.arg().to_degrees()
}

/// Wrap an angle in degrees to (-180, 180].
pub fn wrap_degrees(angle: f64) -> f64 {
    let wrapped = angle.rem_euclid(360.0);
    if wrapped > 180.0 {
        wrapped - 360.0
    } else {
        wrapped
    }
}

/// Linear interpolation of a calibration value at `f`.
///
/// Returns `g0` or `g1` unchanged when `f` is within
/// [`FREQUENCY_TOLERANCE_HZ`] of `f0` or `f1`.
pub fn interpolate(f: f64, (f0, g0): (f64, f64), (f1, g1): (f64, f64)) -> f64 {
    if (f0 - f).abs() < FREQUENCY_TOLERANCE_HZ {
        return g0;
    }
    if (f1 - f).abs() < FREQUENCY_TOLERANCE_HZ {
        return g1;
    }
    let t = (f - f0) / (f1 - f0);
    (1.0 - t) * g0 + t * g1
}

// ============================================================================
// Frequency Tables
// ============================================================================

/// One `(frequency, value)` entry of a calibration table.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct TablePoint {
    pub frequency: f64,
    pub value: f64,
}

/// Calibration values ordered by ascending frequency.
///
/// Construction sorts the entries, so lookups never see an unordered table.
/// Immutable once built.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "Vec<TablePoint>", into = "Vec<TablePoint>")]
pub struct FrequencyTable {
    points: Vec<TablePoint>,
}

/// Gain factor per calibration frequency.
pub type GainTable = FrequencyTable;
/// System phase (degrees) per calibration frequency.
pub type PhaseTable = FrequencyTable;

impl FrequencyTable {
    pub fn new(mut points: Vec<TablePoint>) -> Result<Self> {
        if points.is_empty() {
            return Err(DriverError::Calibration("calibration table is empty".into()));
        }
        if let Some(bad) = points
            .iter()
            .find(|p| !p.frequency.is_finite() || !p.value.is_finite())
        {
            return Err(DriverError::Calibration(format!(
                "non-finite calibration entry at {} Hz: {}",
                bad.frequency, bad.value
            )));
        }
        points.sort_by(|a, b| a.frequency.total_cmp(&b.frequency));
        Ok(Self { points })
    }

    pub fn from_pairs<I: IntoIterator<Item = (f64, f64)>>(pairs: I) -> Result<Self> {
        Self::new(
            pairs
                .into_iter()
                .map(|(frequency, value)| TablePoint { frequency, value })
                .collect(),
        )
    }

    pub fn points(&self) -> &[TablePoint] {
        &self.points
    }

    pub fn len(&self) -> usize {
        self.points.len()
    }

    pub fn is_empty(&self) -> bool {
        self.points.is_empty()
    }

    /// Value at a single frequency, by the same rule as [`FrequencyTable::resample`].
    ///
    /// `None` when `f` is NaN.
    pub fn value_at(&self, f: f64) -> Option<f64> {
        if f.is_nan() {
            return None;
        }
        let first = self.points[0];
        let last = self.points[self.points.len() - 1];
        if f < first.frequency {
            return Some(first.value);
        }
        // index of the first calibration point strictly above f
        let upper = self.points.partition_point(|p| p.frequency <= f);
        if upper >= self.points.len() {
            return Some(last.value);
        }
        let (lo, hi) = (self.points[upper - 1], self.points[upper]);
        Some(interpolate(f, (lo.frequency, lo.value), (hi.frequency, hi.value)))
    }

    /// Copy with angle values (degrees) made continuous along frequency.
    ///
    /// Successive entries never differ by more than 180°, so linear
    /// interpolation does not cut across the ±180° seam.
    pub fn unwrapped_degrees(&self) -> Self {
        let mut points = self.points.clone();
        for i in 1..points.len() {
            let prev = points[i - 1].value;
            points[i].value = prev + wrap_degrees(points[i].value - prev);
        }
        Self { points }
    }

    /// Values at an ascending list of frequencies.
    ///
    /// Frequencies below the table take the lowest entry, frequencies above it
    /// take the highest, and anything in between is interpolated.
    pub fn resample(&self, frequencies: &[f64]) -> Vec<f64> {
        let cal = &self.points;
        let mut out = Vec::with_capacity(frequencies.len());
        let mut k = 0;

        while k < frequencies.len() && frequencies[k] < cal[0].frequency {
            out.push(cal[0].value);
            k += 1;
        }
        for pair in cal.windows(2) {
            let (lo, hi) = (pair[0], pair[1]);
            while k < frequencies.len() && frequencies[k] < hi.frequency {
                out.push(interpolate(
                    frequencies[k],
                    (lo.frequency, lo.value),
                    (hi.frequency, hi.value),
                ));
                k += 1;
            }
        }
        let tail = cal[cal.len() - 1].value;
        out.extend(std::iter::repeat(tail).take(frequencies.len() - k));
        out
    }
}

impl TryFrom<Vec<TablePoint>> for FrequencyTable {
    type Error = DriverError;

    fn try_from(points: Vec<TablePoint>) -> Result<Self> {
        Self::new(points)
    }
}

impl From<FrequencyTable> for Vec<TablePoint> {
    fn from(table: FrequencyTable) -> Self {
        table.points
    }
}

/// Gain table from a calibration sweep against `reference_ohms`.
pub fn calibrate_gain(points: &[SweepPoint], reference_ohms: f64) -> Result<GainTable> {
    check_reference(reference_ohms)?;
    let mut entries = Vec::with_capacity(points.len());
    for p in points {
        if p.sample.norm() == 0.0 {
            return Err(DriverError::Calibration(format!(
                "zero response at {:.3} Hz; is the reference connected?",
                p.frequency
            )));
        }
        entries.push(TablePoint {
            frequency: p.frequency,
            value: gain_factor(p.sample, reference_ohms),
        });
    }
    GainTable::new(entries)
}

/// Gain for every sweep point from a table calibrated at other frequencies.
///
/// `points` must be in ascending frequency order, as a sweep produces them.
pub fn multi_point_gains(points: &[SweepPoint], calibration: &GainTable) -> Vec<TablePoint> {
    let frequencies: Vec<f64> = points.iter().map(|p| p.frequency).collect();
    calibration
        .resample(&frequencies)
        .into_iter()
        .zip(frequencies)
        .map(|(value, frequency)| TablePoint { frequency, value })
        .collect()
}

/// `(frequency, |Z|)` pairing each point with the gain at the same index.
pub fn same_index_magnitudes(points: &[SweepPoint], gains: &GainTable) -> Result<Vec<(f64, f64)>> {
    if points.len() != gains.len() {
        return Err(DriverError::Calibration(format!(
            "{} measurement point(s) but {} gain factor(s)",
            points.len(),
            gains.len()
        )));
    }
    Ok(points
        .iter()
        .zip(gains.points())
        .map(|(p, g)| (p.frequency, magnitude(p.sample, g.value)))
        .collect())
}

fn check_reference(reference_ohms: f64) -> Result<()> {
    if !reference_ohms.is_finite() || reference_ohms <= 0.0 {
        return Err(DriverError::Calibration(format!(
            "reference resistance must be positive, got {reference_ohms}"
        )));
    }
    Ok(())
}

// ============================================================================
// Calibration
// ============================================================================

/// One calibrated result row.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ImpedancePoint {
    pub frequency: f64,
    /// |Z| in ohms.
    pub magnitude: f64,
    /// Phase of Z relative to the system phase, degrees.
    pub phase: f64,
    /// Raw real code.
    pub real: f64,
    /// Raw imaginary code.
    pub imaginary: f64,
    /// Raw DFT magnitude `|real + j imaginary|`.
    pub raw_magnitude: f64,
}

/// Front-end settings a gain table was measured with.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct FrontEndSettings {
    pub output_voltage: OutputVoltage,
    pub pga_gain: PgaGain,
    pub clock: ClockSource,
}

impl From<&SweepConfig> for FrontEndSettings {
    fn from(config: &SweepConfig) -> Self {
        Self {
            output_voltage: config.output_voltage,
            pga_gain: config.pga_gain,
            clock: config.clock,
        }
    }
}

/// Gain and system phase captured against a reference resistor.
///
/// Only valid for the output range, PGA gain and clock it was taken with.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Calibration {
    pub reference_ohms: f64,
    pub gains: GainTable,
    /// Degrees, continuous along frequency.
    pub system_phase: PhaseTable,
    /// Absent in files written without a known sweep configuration.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub settings: Option<FrontEndSettings>,
}

impl Calibration {
    pub fn from_sweep(points: &[SweepPoint], reference_ohms: f64) -> Result<Self> {
        let gains = calibrate_gain(points, reference_ohms)?;
        let system_phase =
            PhaseTable::from_pairs(points.iter().map(|p| (p.frequency, phase_degrees(p.sample))))?
                .unwrapped_degrees();
        info!(
            "calibrated against {} Ω at {} frequencies ({:.1}-{:.1} Hz)",
            reference_ohms,
            gains.len(),
            gains.points()[0].frequency,
            gains.points()[gains.len() - 1].frequency
        );
        Ok(Self {
            reference_ohms,
            gains,
            system_phase,
            settings: None,
        })
    }

    /// Record the sweep settings the calibration was taken with.
    pub fn with_settings(mut self, config: &SweepConfig) -> Self {
        self.settings = Some(FrontEndSettings::from(config));
        self
    }

    /// Whether `config` uses the recorded front-end settings.
    /// A calibration without recorded settings matches anything.
    pub fn settings_match(&self, config: &SweepConfig) -> bool {
        self.settings
            .map_or(true, |s| s == FrontEndSettings::from(config))
    }

    /// Convert raw sweep points into impedance magnitude and phase.
    pub fn score(&self, points: &[SweepPoint]) -> Vec<ImpedancePoint> {
        let frequencies: Vec<f64> = points.iter().map(|p| p.frequency).collect();
        let gains = self.gains.resample(&frequencies);
        let phases = self.system_phase.unwrapped_degrees().resample(&frequencies);

        points
            .iter()
            .zip(gains.into_iter().zip(phases))
            .map(|(p, (gain, system_phase))| {
                let point = ImpedancePoint {
                    frequency: p.frequency,
                    magnitude: magnitude(p.sample, gain),
                    phase: wrap_degrees(phase_degrees(p.sample) - system_phase),
                    real: p.sample.re,
                    imaginary: p.sample.im,
                    raw_magnitude: p.sample.norm(),
                };
                debug!(
                    "{:.3} Hz: |Z|={:.3} Ω, phase={:.3}°",
                    point.frequency, point.magnitude, point.phase
                );
                point
            })
            .collect()
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        let writer = BufWriter::new(File::create(path)?);
        serde_json::to_writer_pretty(writer, self)?;
        debug!("calibration saved to {}", path.display());
        Ok(())
    }

    pub fn load(path: &Path) -> Result<Self> {
        let reader = BufReader::new(File::open(path)?);
        let calibration: Self = serde_json::from_reader(reader)?;
        check_reference(calibration.reference_ohms)?;
        Ok(calibration)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn point(frequency: f64, re: f64, im: f64) -> SweepPoint {
        SweepPoint {
            frequency,
            sample: Complex64::new(re, im),
        }
    }

    #[test]
    fn gain_and_magnitude_are_inverse() {
        let s = Complex64::new(3000.0, 4000.0);
        let g = gain_factor(s, 1000.0);
        assert!((g - 1.0 / 5.0e6).abs() < 1e-18);
        assert!((magnitude(s, g) - 1000.0).abs() < 1e-9);
        assert!(magnitude(Complex64::new(0.0, 0.0), g).is_infinite());
    }

    #[test]
    fn interpolation_returns_endpoints_verbatim() {
        let g0 = (1000.0, 2.0e-7);
        let g1 = (2000.0, 4.0e-7);
        assert_eq!(interpolate(1000.0, g0, g1), 2.0e-7);
        assert_eq!(interpolate(2000.0, g0, g1), 4.0e-7);
        assert_eq!(interpolate(1000.05, g0, g1), 2.0e-7);
        assert_eq!(interpolate(1999.95, g0, g1), 4.0e-7);
    }

    #[test]
    fn interpolation_is_linear_between_points() {
        let g0 = (1000.0, 10.0);
        let g1 = (2000.0, 20.0);
        assert!((interpolate(1500.0, g0, g1) - 15.0).abs() < 1e-12);
        assert!((interpolate(1250.0, g0, g1) - 12.5).abs() < 1e-12);
        let mut last = f64::MIN;
        for f in (1000..=2000).step_by(50) {
            let v = interpolate(f as f64, g0, g1);
            assert!(v >= last);
            last = v;
        }
        // degenerate segment
        assert_eq!(interpolate(1000.0, (1000.0, 1.0), (1000.0, 2.0)), 1.0);
    }

    #[test]
    fn resample_extrapolates_flat() {
        let table = GainTable::from_pairs([(1000.0, 1.0), (2000.0, 2.0), (4000.0, 4.0)]).unwrap();
        let out = table.resample(&[100.0, 500.0, 1000.0, 1500.0, 2000.0, 3000.0, 4000.0, 9000.0]);
        assert_eq!(out, vec![1.0, 1.0, 1.0, 1.5, 2.0, 3.0, 4.0, 4.0]);
    }

    #[test]
    fn value_at_agrees_with_resample() {
        let table = GainTable::from_pairs([(1000.0, 1.0), (2000.0, 2.0), (4000.0, 4.0)]).unwrap();
        let freqs = [10.0, 1000.0, 1200.0, 2000.0, 2500.0, 4000.0, 5000.0];
        let batch = table.resample(&freqs);
        for (f, v) in freqs.iter().zip(batch) {
            assert!((table.value_at(*f).unwrap() - v).abs() < 1e-12, "f={f}");
        }
        assert_eq!(table.value_at(f64::NAN), None);
        assert_eq!(table.value_at(f64::INFINITY), Some(4.0));
        assert_eq!(table.value_at(f64::NEG_INFINITY), Some(1.0));
    }

    #[test]
    fn tables_are_sorted_on_construction() {
        let table = GainTable::from_pairs([(3000.0, 3.0), (1000.0, 1.0), (2000.0, 2.0)]).unwrap();
        let freqs: Vec<f64> = table.points().iter().map(|p| p.frequency).collect();
        assert_eq!(freqs, vec![1000.0, 2000.0, 3000.0]);
        assert!(GainTable::new(Vec::new()).is_err());
        assert!(GainTable::from_pairs([(f64::NAN, 1.0)]).is_err());
    }

    #[test]
    fn single_point_table_is_flat() {
        let table = GainTable::from_pairs([(1000.0, 7.0)]).unwrap();
        assert_eq!(table.resample(&[10.0, 1000.0, 5000.0]), vec![7.0, 7.0, 7.0]);
    }

    #[test]
    fn multi_point_gains_keep_sample_frequencies() {
        let table = GainTable::from_pairs([(1000.0, 1.0), (3000.0, 3.0)]).unwrap();
        let points = [point(500.0, 1.0, 0.0), point(2000.0, 1.0, 0.0), point(3500.0, 1.0, 0.0)];
        let gains = multi_point_gains(&points, &table);
        assert_eq!(
            gains,
            vec![
                TablePoint { frequency: 500.0, value: 1.0 },
                TablePoint { frequency: 2000.0, value: 2.0 },
                TablePoint { frequency: 3500.0, value: 3.0 },
            ]
        );
    }

    #[test]
    fn calibration_rejects_bad_input() {
        let points = [point(1000.0, 100.0, 0.0)];
        assert!(calibrate_gain(&points, 0.0).is_err());
        assert!(calibrate_gain(&points, f64::NAN).is_err());
        assert!(calibrate_gain(&[point(1000.0, 0.0, 0.0)], 1000.0).is_err());
    }

    #[test]
    fn same_index_requires_equal_lengths() {
        let gains = calibrate_gain(&[point(1.0, 10.0, 0.0), point(2.0, 10.0, 0.0)], 100.0).unwrap();
        assert!(same_index_magnitudes(&[point(1.0, 10.0, 0.0)], &gains).is_err());
        let z = same_index_magnitudes(&[point(1.0, 5.0, 0.0), point(2.0, 20.0, 0.0)], &gains)
            .unwrap();
        assert!((z[0].1 - 200.0).abs() < 1e-9);
        assert!((z[1].1 - 50.0).abs() < 1e-9);
    }

    #[test]
    fn phase_is_relative_to_system_phase() {
        let system = Complex64::from_polar(1000.0, 10f64.to_radians());
        let cal = Calibration::from_sweep(
            &[
                SweepPoint { frequency: 1000.0, sample: system },
                SweepPoint { frequency: 2000.0, sample: system },
            ],
            1000.0,
        )
        .unwrap();
        let measured = Complex64::from_polar(500.0, -35f64.to_radians());
        let scored = cal.score(&[SweepPoint { frequency: 1500.0, sample: measured }]);
        assert!((scored[0].phase - -45.0).abs() < 1e-9);
        assert!((scored[0].magnitude - 2000.0).abs() < 1e-6);
        assert_eq!(scored[0].raw_magnitude, measured.norm());
    }

    #[test]
    fn wrap_degrees_range() {
        assert_eq!(wrap_degrees(190.0), -170.0);
        assert_eq!(wrap_degrees(-190.0), 170.0);
        assert_eq!(wrap_degrees(180.0), 180.0);
        assert_eq!(wrap_degrees(-180.0), 180.0);
        assert_eq!(wrap_degrees(45.0), 45.0);
    }

    #[test]
    fn calibration_json_round_trip_keeps_order() {
        let cal = Calibration {
            reference_ohms: 1000.0,
            gains: GainTable::from_pairs([(2000.0, 2.0), (1000.0, 1.0)]).unwrap(),
            system_phase: PhaseTable::from_pairs([(1000.0, 0.5)]).unwrap(),
            settings: None,
        };
        let json = serde_json::to_string(&cal).unwrap();
        let back: Calibration = serde_json::from_str(&json).unwrap();
        assert_eq!(back, cal);

        let unsorted = r#"{"reference_ohms":1.0,
            "gains":[{"frequency":2.0,"value":2.0},{"frequency":1.0,"value":1.0}],
            "system_phase":[{"frequency":1.0,"value":0.0}]}"#;
        let parsed: Calibration = serde_json::from_str(unsorted).unwrap();
        assert_eq!(parsed.gains.points()[0].frequency, 1.0);
        assert!(serde_json::from_str::<Calibration>(
            r#"{"reference_ohms":1.0,"gains":[],"system_phase":[]}"#
        )
        .is_err());
    }

    #[test]
    fn system_phase_interpolates_across_the_seam() {
        let cal = Calibration::from_sweep(
            &[
                SweepPoint { frequency: 1000.0, sample: Complex64::from_polar(1000.0, 179f64.to_radians()) },
                SweepPoint { frequency: 2000.0, sample: Complex64::from_polar(1000.0, -179f64.to_radians()) },
            ],
            1000.0,
        )
        .unwrap();
        let values: Vec<f64> = cal.system_phase.points().iter().map(|p| p.value).collect();
        assert!((values[0] - 179.0).abs() < 1e-9);
        assert!((values[1] - 181.0).abs() < 1e-9);

        let on_baseline = Complex64::from_polar(500.0, 180f64.to_radians());
        let scored = cal.score(&[SweepPoint { frequency: 1500.0, sample: on_baseline }]);
        assert!(wrap_degrees(scored[0].phase).abs() < 1e-6, "{:?}", scored[0]);

        // a wrapped table loaded from disk is unwrapped before interpolation
        let wrapped = Calibration {
            system_phase: PhaseTable::from_pairs([(1000.0, 179.0), (2000.0, -179.0)]).unwrap(),
            ..cal
        };
        let scored = wrapped.score(&[SweepPoint { frequency: 1500.0, sample: on_baseline }]);
        assert!(scored[0].phase.abs() < 1e-6);
    }

    #[test]
    fn unwrapping_keeps_steps_below_half_turn() {
        let table = PhaseTable::from_pairs([(1.0, 170.0), (2.0, -170.0), (3.0, -10.0), (4.0, -160.0)])
            .unwrap()
            .unwrapped_degrees();
        let values: Vec<f64> = table.points().iter().map(|p| p.value).collect();
        assert_eq!(values, vec![170.0, 190.0, 350.0, 200.0]);
    }

    #[test]
    fn settings_are_recorded_and_compared() {
        let config = SweepConfig::default();
        let cal = Calibration::from_sweep(&[point(1000.0, 100.0, 0.0)], 1000.0).unwrap();
        assert!(cal.settings_match(&config));

        let cal = cal.with_settings(&config);
        assert!(cal.settings_match(&config));
        let other = SweepConfig {
            pga_gain: PgaGain::X5,
            ..SweepConfig::default()
        };
        assert!(!cal.settings_match(&other));

        let json = serde_json::to_string(&cal).unwrap();
        assert!(json.contains("\"pga_gain\":\"x1\""));
        let back: Calibration = serde_json::from_str(&json).unwrap();
        assert_eq!(back.settings, cal.settings);
    }
}
