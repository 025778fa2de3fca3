//! CSV export of a completed run.
//!
//! Output layout: a block of `# `-prefixed pretty-printed JSON metadata at
//! the top of the file (self-describing, survives spreadsheet import as
//! comments), followed by a CSV header row and one row per calibrated
//! record. Missing power values export as empty cells, never as sentinel
//! numbers.

use std::fs::File;
use std::io::Write;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::info;

use crate::run::RunResult;

/// Metadata block written ahead of the CSV body
#[derive(Debug, Serialize)]
struct ExportHeader<'a> {
    run_id: &'a str,
    started_at: DateTime<Utc>,
    finished_at: DateTime<Utc>,
    device_label: &'a str,
    comment: &'a str,
    bias_voltage_v: f64,
    start_freq_ghz: f64,
    end_freq_ghz: f64,
    steps: u32,
    initial_photocurrent_ma: f64,
    cancelled: bool,
    probe_calibration_applied: bool,
    link_calibration_applied: bool,
}

impl<'a> ExportHeader<'a> {
    fn from_result(result: &'a RunResult) -> Self {
        Self {
            run_id: &result.run_id,
            started_at: result.started_at,
            finished_at: result.finished_at,
            device_label: &result.config.metadata.device_label,
            comment: &result.config.metadata.comment,
            bias_voltage_v: result.config.metadata.bias_voltage_v,
            start_freq_ghz: result.config.sweep.start_freq_ghz,
            end_freq_ghz: result.config.sweep.end_freq_ghz,
            steps: result.config.sweep.steps,
            initial_photocurrent_ma: result.initial_photocurrent_ma,
            cancelled: result.cancelled,
            probe_calibration_applied: result.dataset.probe_applied,
            link_calibration_applied: result.dataset.link_applied,
        }
    }
}

/// Default output file name: `<device>_<UTC timestamp>.csv` under `dir`
pub fn default_output_path(dir: &Path, device_label: &str) -> PathBuf {
    let label = if device_label.is_empty() {
        "run"
    } else {
        device_label
    };
    dir.join(format!(
        "{}_{}.csv",
        label,
        Utc::now().format("%Y%m%d_%H%M%S")
    ))
}

/// Write the run's calibrated dataset to `path`.
pub fn export_csv(result: &RunResult, path: &Path) -> Result<()> {
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() && !parent.exists() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("creating output directory {}", parent.display()))?;
        }
    }
    let mut file = File::create(path)
        .with_context(|| format!("creating output file {}", path.display()))?;

    let header = ExportHeader::from_result(result);
    let json = serde_json::to_string_pretty(&header).context("serializing run metadata")?;
    for line in json.lines() {
        file.write_all(b"# ")
            .and_then(|_| file.write_all(line.as_bytes()))
            .and_then(|_| file.write_all(b"\n"))
            .context("writing metadata header")?;
    }

    let mut writer = csv::Writer::from_writer(file);
    writer
        .write_record([
            "step_index",
            "beat_freq_ghz",
            "photocurrent_ma",
            "raw_power_dbm",
            "probe_loss_db",
            "link_loss_db",
            "calibrated_power_dbm",
            "voa_power_dbm",
        ])
        .context("writing CSV header")?;

    for record in &result.dataset.records {
        let raw_power = record
            .raw
            .raw_power_dbm
            .map_or(String::new(), |v| format!("{v:.4}"));
        let calibrated = record
            .calibrated_power_dbm
            .map_or(String::new(), |v| format!("{v:.4}"));
        writer
            .write_record(&[
                record.raw.step_index.to_string(),
                format!("{:.6}", record.raw.beat_freq_ghz),
                format!("{:.6}", record.raw.photocurrent_ma),
                raw_power,
                format!("{:.4}", record.probe_loss_db),
                format!("{:.4}", record.link_loss_db),
                calibrated,
                format!("{:.4}", record.raw.voa_power_dbm),
            ])
            .context("writing data row")?;
    }
    writer.flush().context("flushing CSV writer")?;
    info!(
        path = %path.display(),
        records = result.dataset.records.len(),
        "dataset exported"
    );
    Ok(())
}
