//! Frequency-dependent loss calibration.
//!
//! RF power measured at the sensor is attenuated by the probe and the cable
//! link between the device and the sensor, and both losses vary with
//! frequency. This module loads up to two loss curves from external files,
//! interpolates them at each record's beat frequency, and adds the absolute
//! losses back onto the raw reading.
//!
//! Two input formats are supported:
//! - a network-analyzer two-port file (probe loss, taken as the average of
//!   the S21 and S12 magnitudes in dB)
//! - a plain two-column frequency/loss table (link loss)
//!
//! A curve that is not configured, or that fails to load, contributes zero
//! loss; the omission is carried on the output so a dataset can always be
//! traced back to which corrections were actually applied.

use std::fs;
use std::path::Path;

use anyhow::{anyhow, Context, Result};
use tracing::{debug, warn};

use crate::config::CalibrationPaths;
use crate::sweep::SweepStepRecord;

/// One loss curve: `(frequency_ghz, loss_db)` pairs sorted ascending by
/// frequency. Loaded once, immutable afterwards.
#[derive(Debug, Clone)]
pub struct CalibrationCurve {
    points: Vec<(f64, f64)>,
}

impl CalibrationCurve {
    /// Build a curve from raw points, sorting them by frequency.
    ///
    /// # Errors
    ///
    /// Fails when the point list is empty or any value is non-finite.
    pub fn from_points(mut points: Vec<(f64, f64)>) -> Result<Self> {
        if points.is_empty() {
            return Err(anyhow!("calibration curve has no points"));
        }
        if points
            .iter()
            .any(|(f, l)| !f.is_finite() || !l.is_finite())
        {
            return Err(anyhow!("calibration curve contains non-finite values"));
        }
        points.sort_by(|a, b| a.0.total_cmp(&b.0));
        Ok(Self { points })
    }

    pub fn points(&self) -> &[(f64, f64)] {
        &self.points
    }

    /// Piecewise-linear loss lookup at `freq_ghz`.
    ///
    /// Queries at or beyond the curve ends return the boundary value; there
    /// is no extrapolation. Two points sharing a frequency form a zero-width
    /// interval and the lower point's value is returned.
    pub fn interpolate(&self, freq_ghz: f64) -> f64 {
        let first = self.points[0];
        let last = self.points[self.points.len() - 1];
        if freq_ghz <= first.0 {
            return first.1;
        }
        if freq_ghz >= last.0 {
            return last.1;
        }
        for pair in self.points.windows(2) {
            let (f0, l0) = pair[0];
            let (f1, l1) = pair[1];
            if freq_ghz >= f0 && freq_ghz <= f1 {
                let width = f1 - f0;
                if width == 0.0 {
                    return l0;
                }
                let t = (freq_ghz - f0) / width;
                return l0 + t * (l1 - l0);
            }
        }
        // Unreachable with sorted points, but the boundary value is the
        // right answer if it ever triggers.
        last.1
    }
}

/// Frequency scale factor to GHz for a two-port header unit token
fn frequency_unit_to_ghz(token: &str) -> Option<f64> {
    match token.to_ascii_uppercase().as_str() {
        "HZ" => Some(1e-9),
        "KHZ" => Some(1e-6),
        "MHZ" => Some(1e-3),
        "GHZ" => Some(1.0),
        _ => None,
    }
}

/// Parse a network-analyzer two-port file into a probe-loss curve.
///
/// The option line starts with `#` and declares the frequency unit and data
/// format; `!` lines are comments. Data rows are whitespace-delimited with
/// at least 9 fields: frequency in field 0, S21 dB magnitude in field 3 and
/// S12 in field 5. The curve is `(S21 + S12) / 2` per frequency, with
/// frequencies normalized to GHz.
///
/// # Errors
///
/// Fails on a missing or unsupported option line (only the dB format is
/// usable as a loss curve), malformed rows, or an empty file.
pub fn parse_two_port(contents: &str) -> Result<CalibrationCurve> {
    let mut unit_to_ghz: Option<f64> = None;
    let mut points = Vec::new();

    for (line_no, raw) in contents.lines().enumerate() {
        let line = raw.trim();
        if line.is_empty() || line.starts_with('!') {
            continue;
        }
        if let Some(option) = line.strip_prefix('#') {
            let tokens: Vec<&str> = option.split_whitespace().collect();
            let unit = tokens
                .first()
                .and_then(|t| frequency_unit_to_ghz(t))
                .ok_or_else(|| anyhow!("option line declares no frequency unit: '{line}'"))?;
            if !tokens.iter().any(|t| t.eq_ignore_ascii_case("DB")) {
                return Err(anyhow!(
                    "two-port format must be dB magnitude, got option line '{line}'"
                ));
            }
            unit_to_ghz = Some(unit);
            continue;
        }

        let scale =
            unit_to_ghz.ok_or_else(|| anyhow!("data row before the '#' option line"))?;
        let fields: Vec<&str> = line.split_whitespace().collect();
        if fields.len() < 9 {
            return Err(anyhow!(
                "row {} has {} fields, expected at least 9",
                line_no + 1,
                fields.len()
            ));
        }
        let freq: f64 = fields[0]
            .parse()
            .with_context(|| format!("bad frequency in row {}", line_no + 1))?;
        let s21: f64 = fields[3]
            .parse()
            .with_context(|| format!("bad S21 in row {}", line_no + 1))?;
        let s12: f64 = fields[5]
            .parse()
            .with_context(|| format!("bad S12 in row {}", line_no + 1))?;
        points.push((freq * scale, (s21 + s12) / 2.0));
    }

    CalibrationCurve::from_points(points).context("two-port file yielded no data rows")
}

/// Parse a plain two-column frequency/loss table.
///
/// One point per row, whitespace-delimited, frequency in GHz in the first
/// column and loss in dB in the second. No header row is expected; rows
/// starting with `#` are tolerated and skipped.
pub fn parse_loss_table(contents: &str) -> Result<CalibrationCurve> {
    let mut points = Vec::new();
    for (line_no, raw) in contents.lines().enumerate() {
        let line = raw.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        let mut fields = line.split_whitespace();
        let freq: f64 = fields
            .next()
            .ok_or_else(|| anyhow!("empty row {}", line_no + 1))?
            .parse()
            .with_context(|| format!("bad frequency in row {}", line_no + 1))?;
        let loss: f64 = fields
            .next()
            .ok_or_else(|| anyhow!("row {} has no loss column", line_no + 1))?
            .parse()
            .with_context(|| format!("bad loss in row {}", line_no + 1))?;
        points.push((freq, loss));
    }
    CalibrationCurve::from_points(points).context("loss table yielded no data rows")
}

/// One calibrated sweep record
#[derive(Debug, Clone, Copy)]
pub struct CalibratedRecord {
    pub raw: SweepStepRecord,
    /// Interpolated probe loss at this record's frequency (dB)
    pub probe_loss_db: f64,
    /// Interpolated link loss at this record's frequency (dB)
    pub link_loss_db: f64,
    /// Raw power plus the absolute loss contributions, `None` when the raw
    /// power measurement failed
    pub calibrated_power_dbm: Option<f64>,
}

/// Calibrated view of a full sweep, with per-curve applied flags
#[derive(Debug, Clone)]
pub struct CalibratedDataset {
    pub records: Vec<CalibratedRecord>,
    pub probe_applied: bool,
    pub link_applied: bool,
}

/// The loaded calibration state for one run
#[derive(Debug, Clone, Default)]
pub struct LossCalibration {
    probe: Option<CalibrationCurve>,
    link: Option<CalibrationCurve>,
}

impl LossCalibration {
    pub fn new(probe: Option<CalibrationCurve>, link: Option<CalibrationCurve>) -> Self {
        Self { probe, link }
    }

    /// Load the configured calibration files.
    ///
    /// A missing path or a failed parse downgrades that curve to "not
    /// applied" with a warning rather than failing the run; the sweep data
    /// is worth keeping even when a calibration input is bad.
    pub fn load(paths: &CalibrationPaths) -> Self {
        let probe = paths.probe_loss_file.as_deref().and_then(|path| {
            match load_curve(path, parse_two_port) {
                Ok(curve) => Some(curve),
                Err(err) => {
                    warn!(
                        path = %path.display(),
                        error = %format!("{err:#}"),
                        "probe loss curve not applied"
                    );
                    None
                }
            }
        });
        let link = paths.link_loss_file.as_deref().and_then(|path| {
            match load_curve(path, parse_loss_table) {
                Ok(curve) => Some(curve),
                Err(err) => {
                    warn!(
                        path = %path.display(),
                        error = %format!("{err:#}"),
                        "link loss curve not applied"
                    );
                    None
                }
            }
        });
        Self { probe, link }
    }

    /// Apply the loaded curves to a sweep.
    ///
    /// Loss terms enter as absolute values so a curve stored as negative
    /// transmission dB still raises the calibrated power.
    pub fn calibrate(&self, records: &[SweepStepRecord]) -> CalibratedDataset {
        let calibrated = records
            .iter()
            .map(|record| {
                let probe_loss_db = self
                    .probe
                    .as_ref()
                    .map_or(0.0, |c| c.interpolate(record.beat_freq_ghz).abs());
                let link_loss_db = self
                    .link
                    .as_ref()
                    .map_or(0.0, |c| c.interpolate(record.beat_freq_ghz).abs());
                CalibratedRecord {
                    raw: *record,
                    probe_loss_db,
                    link_loss_db,
                    calibrated_power_dbm: record
                        .raw_power_dbm
                        .map(|raw| raw + probe_loss_db + link_loss_db),
                }
            })
            .collect();
        debug!(
            records = records.len(),
            probe_applied = self.probe.is_some(),
            link_applied = self.link.is_some(),
            "calibration applied"
        );
        CalibratedDataset {
            records: calibrated,
            probe_applied: self.probe.is_some(),
            link_applied: self.link.is_some(),
        }
    }
}

fn load_curve(
    path: &Path,
    parse: fn(&str) -> Result<CalibrationCurve>,
) -> Result<CalibrationCurve> {
    let contents =
        fs::read_to_string(path).with_context(|| format!("reading {}", path.display()))?;
    parse(&contents)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(freq: f64, power: Option<f64>) -> SweepStepRecord {
        SweepStepRecord {
            step_index: 0,
            beat_freq_ghz: freq,
            raw_power_dbm: power,
            photocurrent_ma: 5.2,
            voa_power_dbm: -8.0,
        }
    }

    #[test]
    fn test_interpolate_hits_curve_points_exactly() {
        let curve =
            CalibrationCurve::from_points(vec![(0.0, 1.0), (10.0, 3.0), (20.0, 2.0)]).unwrap();
        assert_eq!(curve.interpolate(0.0), 1.0);
        assert_eq!(curve.interpolate(10.0), 3.0);
        assert_eq!(curve.interpolate(20.0), 2.0);
    }

    #[test]
    fn test_interpolate_between_points() {
        let curve = CalibrationCurve::from_points(vec![(0.0, 1.0), (10.0, 3.0)]).unwrap();
        assert!((curve.interpolate(5.0) - 2.0).abs() < 1e-12);
        assert!((curve.interpolate(2.5) - 1.5).abs() < 1e-12);
    }

    #[test]
    fn test_interpolate_clamps_at_boundaries() {
        let curve = CalibrationCurve::from_points(vec![(1.0, 1.0), (10.0, 3.0)]).unwrap();
        assert_eq!(curve.interpolate(0.0), 1.0);
        assert_eq!(curve.interpolate(-5.0), 1.0);
        assert_eq!(curve.interpolate(50.0), 3.0);
    }

    #[test]
    fn test_zero_width_interval_returns_lower_value() {
        let curve =
            CalibrationCurve::from_points(vec![(0.0, 1.0), (5.0, 2.0), (5.0, 9.0), (10.0, 3.0)])
                .unwrap();
        assert_eq!(curve.interpolate(5.0), 2.0);
    }

    #[test]
    fn test_unsorted_points_are_sorted() {
        let curve =
            CalibrationCurve::from_points(vec![(10.0, 3.0), (0.0, 1.0)]).unwrap();
        assert!((curve.interpolate(5.0) - 2.0).abs() < 1e-12);
    }

    #[test]
    fn test_empty_curve_rejected() {
        assert!(CalibrationCurve::from_points(vec![]).is_err());
        assert!(CalibrationCurve::from_points(vec![(f64::NAN, 0.0)]).is_err());
    }

    #[test]
    fn test_parse_two_port() {
        let contents = "\
! network analyzer export
# GHZ S DB R 50
1.0 0.0 0.0 -1.0 0.0 -1.2 0.0 0.0 0.0
5.0 0.0 0.0 -2.0 0.0 -2.4 0.0 0.0 0.0
";
        let curve = parse_two_port(contents).expect("parse");
        assert_eq!(curve.points().len(), 2);
        assert!((curve.interpolate(1.0) - (-1.1)).abs() < 1e-12);
        assert!((curve.interpolate(5.0) - (-2.2)).abs() < 1e-12);
    }

    #[test]
    fn test_parse_two_port_normalizes_hz() {
        let contents = "\
# HZ S DB R 50
1000000000 0.0 0.0 -1.0 0.0 -1.0 0.0 0.0 0.0
2000000000 0.0 0.0 -3.0 0.0 -3.0 0.0 0.0 0.0
";
        let curve = parse_two_port(contents).expect("parse");
        assert_eq!(curve.points()[0].0, 1.0);
        assert_eq!(curve.points()[1].0, 2.0);
    }

    #[test]
    fn test_parse_two_port_rejects_short_rows() {
        let contents = "\
# GHZ S DB R 50
1.0 0.0 0.0 -1.0
";
        assert!(parse_two_port(contents).is_err());
    }

    #[test]
    fn test_parse_two_port_rejects_non_db_format() {
        let contents = "\
# GHZ S RI R 50
1.0 0.0 0.0 -1.0 0.0 -1.0 0.0 0.0 0.0
";
        assert!(parse_two_port(contents).is_err());
    }

    #[test]
    fn test_parse_loss_table() {
        let contents = "0.0 1.0\n10.0 3.0\n";
        let curve = parse_loss_table(contents).expect("parse");
        assert!((curve.interpolate(5.0) - 2.0).abs() < 1e-12);
    }

    #[test]
    fn test_calibrate_adds_absolute_losses() {
        let probe = CalibrationCurve::from_points(vec![(0.0, 1.0), (10.0, 3.0)]).unwrap();
        let calibration = LossCalibration::new(Some(probe), None);
        let dataset = calibration.calibrate(&[record(5.0, Some(-20.0))]);

        assert!(dataset.probe_applied);
        assert!(!dataset.link_applied);
        let cal = &dataset.records[0];
        assert!((cal.probe_loss_db - 2.0).abs() < 1e-12);
        assert_eq!(cal.link_loss_db, 0.0);
        assert!((cal.calibrated_power_dbm.unwrap() - (-18.0)).abs() < 1e-12);
    }

    #[test]
    fn test_negative_transmission_curve_still_raises_power() {
        let probe = CalibrationCurve::from_points(vec![(0.0, -1.0), (10.0, -3.0)]).unwrap();
        let calibration = LossCalibration::new(Some(probe), None);
        let dataset = calibration.calibrate(&[record(5.0, Some(-20.0))]);
        assert!((dataset.records[0].calibrated_power_dbm.unwrap() - (-18.0)).abs() < 1e-12);
    }

    #[test]
    fn test_missing_power_stays_missing() {
        let calibration = LossCalibration::default();
        let dataset = calibration.calibrate(&[record(5.0, None)]);
        assert!(dataset.records[0].calibrated_power_dbm.is_none());
        assert_eq!(dataset.records[0].probe_loss_db, 0.0);
    }

    #[test]
    fn test_load_missing_file_degrades_to_not_applied() {
        let paths = CalibrationPaths {
            probe_loss_file: Some("/nonexistent/probe.s2p".into()),
            link_loss_file: None,
        };
        let calibration = LossCalibration::load(&paths);
        let dataset = calibration.calibrate(&[record(5.0, Some(-20.0))]);
        assert!(!dataset.probe_applied);
        assert_eq!(dataset.records[0].calibrated_power_dbm, Some(-20.0));
    }

    #[test]
    fn test_load_from_files() {
        use std::io::Write;
        let dir = tempfile::tempdir().expect("tempdir");
        let probe_path = dir.path().join("probe.s2p");
        let link_path = dir.path().join("link.txt");
        let mut probe = std::fs::File::create(&probe_path).expect("create");
        write!(
            probe,
            "# GHZ S DB R 50\n0.0 0.0 0.0 1.0 0.0 1.0 0.0 0.0 0.0\n10.0 0.0 0.0 3.0 0.0 3.0 0.0 0.0 0.0\n"
        )
        .expect("write");
        let mut link = std::fs::File::create(&link_path).expect("create");
        write!(link, "0.0 0.5\n10.0 0.5\n").expect("write");

        let calibration = LossCalibration::load(&CalibrationPaths {
            probe_loss_file: Some(probe_path),
            link_loss_file: Some(link_path),
        });
        let dataset = calibration.calibrate(&[record(5.0, Some(-20.0))]);
        assert!(dataset.probe_applied);
        assert!(dataset.link_applied);
        // -20 + 2.0 probe + 0.5 link
        assert!((dataset.records[0].calibrated_power_dbm.unwrap() - (-17.5)).abs() < 1e-12);
    }
}
