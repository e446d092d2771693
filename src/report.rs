use std::fs::File;
use std::io::Write;
use std::path::Path;

use log::debug;

use crate::calibration::ImpedancePoint;
use crate::errors::{DriverError, Result};

pub const CSV_HEADER: [&str; 6] = ["Frequency", "Impedance", "Phase", "Real", "Imaginary", "Magnitude"];

/// Destination for calibrated sweep results.
pub trait ResultSink {
    fn write_point(&mut self, point: &ImpedancePoint) -> Result<()>;

    /// Flush anything buffered. Called once after the last point.
    fn finish(&mut self) -> Result<()>;

    fn write_all(&mut self, points: &[ImpedancePoint]) -> Result<()> {
        for p in points {
            self.write_point(p)?;
        }
        self.finish()
    }
}

/// One CSV row per point, header first.
pub struct CsvSink<W: Write> {
    writer: csv::Writer<W>,
    rows: usize,
}

impl CsvSink<File> {
    pub fn create(path: &Path) -> Result<Self> {
        let writer = csv::Writer::from_path(path)?;
        debug!("writing results to {}", path.display());
        Self::with_writer(writer)
    }
}

impl<W: Write> CsvSink<W> {
    pub fn new(inner: W) -> Result<Self> {
        Self::with_writer(csv::Writer::from_writer(inner))
    }

    fn with_writer(mut writer: csv::Writer<W>) -> Result<Self> {
        writer.write_record(CSV_HEADER)?;
        Ok(Self { writer, rows: 0 })
    }

    pub fn rows(&self) -> usize {
        self.rows
    }

    pub fn into_inner(self) -> Result<W> {
        self.writer
            .into_inner()
            .map_err(|e| DriverError::Io(e.into_error()))
    }
}

impl<W: Write> ResultSink for CsvSink<W> {
    fn write_point(&mut self, p: &ImpedancePoint) -> Result<()> {
        self.writer.write_record(&[
            format!("{:.3}", p.frequency),
            format!("{:.6}", p.magnitude),
            format!("{:.6}", p.phase),
            format!("{}", p.real),
            format!("{}", p.imaginary),
            format!("{:.6}", p.raw_magnitude),
        ])?;
        self.rows += 1;
        Ok(())
    }

    fn finish(&mut self) -> Result<()> {
        self.writer.flush()?;
        debug!("wrote {} result row(s)", self.rows);
        Ok(())
    }
}

/// Collects points in memory.
#[derive(Debug, Default)]
pub struct MemorySink {
    pub points: Vec<ImpedancePoint>,
    pub finished: bool,
}

impl ResultSink for MemorySink {
    fn write_point(&mut self, point: &ImpedancePoint) -> Result<()> {
        self.points.push(*point);
        Ok(())
    }

    fn finish(&mut self) -> Result<()> {
        self.finished = true;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> ImpedancePoint {
        ImpedancePoint {
            frequency: 30000.0,
            magnitude: 1000.0,
            phase: -1.5,
            real: 10000.0,
            imaginary: -262.0,
            raw_magnitude: 10003.432,
        }
    }

    #[test]
    fn csv_has_header_and_rows() {
        let mut sink = CsvSink::new(Vec::new()).unwrap();
        sink.write_all(&[sample(), sample()]).unwrap();
        assert_eq!(sink.rows(), 2);

        let text = String::from_utf8(sink.into_inner().unwrap()).unwrap();
        let lines: Vec<&str> = text.lines().collect();
        assert_eq!(lines.len(), 3);
        assert_eq!(lines[0], "Frequency,Impedance,Phase,Real,Imaginary,Magnitude");
        assert_eq!(
            lines[1],
            "30000.000,1000.000000,-1.500000,10000,-262,10003.432000"
        );
    }

    #[test]
    fn empty_sweep_writes_header_only() {
        let mut sink = CsvSink::new(Vec::new()).unwrap();
        sink.finish().unwrap();
        let text = String::from_utf8(sink.into_inner().unwrap()).unwrap();
        assert_eq!(text.lines().count(), 1);
    }

    #[test]
    fn memory_sink_collects() {
        let mut sink = MemorySink::default();
        sink.write_all(&[sample()]).unwrap();
        assert!(sink.finished);
        assert_eq!(sink.points, vec![sample()]);
    }
}
