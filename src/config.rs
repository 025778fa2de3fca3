//! Run configuration loaded through Figment.
//!
//! Strongly-typed configuration for a lock-and-sweep run. Configuration is
//! loaded from:
//! 1. A TOML file (base configuration)
//! 2. Environment variables (prefixed with `HETERODYNE__`)
//!
//! # Environment Variable Overrides
//!
//! Environment variables with the `HETERODYNE__` prefix can override
//! configuration values, using `__` as the section separator:
//!
//! ```text
//! HETERODYNE__SWEEP__STEPS=20
//! HETERODYNE__SEARCH__SETTLE_DELAY=500ms
//! HETERODYNE__LASER__TUNED_WAVELENGTH_NM=1552.0
//! ```
//!
//! # Example
//!
//! ```no_run
//! use heterodyne_daq::config::RunConfig;
//!
//! fn main() -> anyhow::Result<()> {
//!     let config = RunConfig::load_from("config/heterodyne.toml")?;
//!     println!("Sweep: {} -> {} GHz in {} steps",
//!         config.sweep.start_freq_ghz,
//!         config.sweep.end_freq_ghz,
//!         config.sweep.steps);
//!     Ok(())
//! }
//! ```
//!
//! All empirically tuned control-loop constants live here as defaults rather
//! than in code; they were tuned against one specific bench and must be
//! re-tunable for different instrument models without recompiling.

use figment::{
    providers::{Env, Format, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::error::{AppResult, HeterodyneError};

/// Top-level configuration for one lock-and-sweep run
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunConfig {
    /// Laser channel assignment and starting wavelengths
    pub laser: LaserConfig,
    /// Sweep range, step count, and timing
    pub sweep: SweepConfig,
    /// Lock-search tuning (step policies, overshoot recovery, dead band)
    #[serde(default)]
    pub search: SearchTuning,
    /// RF power measurement policy
    #[serde(default)]
    pub rf: RfPowerConfig,
    /// Optional loss-calibration input files
    #[serde(default)]
    pub calibration: CalibrationPaths,
    /// Operator-provided metadata carried into the output header
    #[serde(default)]
    pub metadata: RunMetadata,
}

/// Laser channel assignment and tuning range
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LaserConfig {
    /// Channel holding the fixed reference line
    #[serde(default = "default_reference_channel")]
    pub reference_channel: u8,
    /// Channel the controller actuates
    #[serde(default = "default_tuned_channel")]
    pub tuned_channel: u8,
    /// Starting wavelength for the reference channel (nm)
    pub reference_wavelength_nm: f64,
    /// Starting wavelength for the tuned channel (nm)
    pub tuned_wavelength_nm: f64,
    /// Lower edge of the safe tuning range (nm)
    #[serde(default = "default_min_wavelength")]
    pub min_wavelength_nm: f64,
    /// Upper edge of the safe tuning range (nm)
    #[serde(default = "default_max_wavelength")]
    pub max_wavelength_nm: f64,
}

/// Sweep range and timing
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SweepConfig {
    /// Target beat frequency at the start of the sweep (GHz)
    pub start_freq_ghz: f64,
    /// Target beat frequency at the end of the sweep (GHz)
    pub end_freq_ghz: f64,
    /// Number of sweep steps
    pub steps: u32,
    /// Delay between sweep steps
    #[serde(with = "humantime_serde", default = "default_step_delay")]
    pub step_delay: Duration,
    /// Run the automatic lock search before sweeping. When disabled the
    /// sweep starts from whatever beat frequency the bench is already at.
    #[serde(default = "default_true")]
    pub auto_search: bool,
    /// Lock convergence threshold (GHz). Values below 0.5 are accepted but
    /// not guaranteed achievable given sensor noise.
    #[serde(default = "default_convergence_threshold")]
    pub convergence_threshold_ghz: f64,
    /// Early-step residual-lock-error correction policy
    #[serde(default)]
    pub early_correction: EarlyCorrection,
}

/// Correction applied when the first sweep steps see an estimate far above
/// a low target, which indicates residual lock error rather than a real
/// beat-frequency excursion.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EarlyCorrection {
    /// Only steps with index below this are eligible
    #[serde(default = "default_early_step_limit")]
    pub step_limit: u32,
    /// Only applies when the sweep start frequency is below this (GHz)
    #[serde(default = "default_early_start_max")]
    pub start_max_ghz: f64,
    /// Estimate must exceed this to trigger the correction (GHz)
    #[serde(default = "default_early_estimate_min")]
    pub estimate_min_ghz: f64,
    /// Size of the single corrective micro-step (GHz)
    #[serde(default = "default_early_step")]
    pub step_ghz: f64,
}

/// Tuning for the lock-search state machine.
///
/// Every value here was tuned empirically against specific hardware; none is
/// derived from a documented model. Treat them as starting points.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SearchTuning {
    /// Fraction of the current estimate removed per coarse iteration when
    /// the wavelength-meter branch (or the large-estimate ESA branch) is
    /// trusted
    #[serde(default = "default_proportional_fraction")]
    pub proportional_fraction: f64,
    /// Fixed corrective step applied when no estimate is available (GHz)
    #[serde(default = "default_corrective_step")]
    pub corrective_step_ghz: f64,
    /// ESA estimates above this use the proportional fraction (GHz)
    #[serde(default = "default_esa_proportional_above")]
    pub esa_proportional_above_ghz: f64,
    /// Graduated fixed steps for the ESA branch, evaluated top-down; the
    /// first rule whose `min_estimate_ghz` the estimate meets or exceeds
    /// supplies the step
    #[serde(default = "default_esa_step_table")]
    pub esa_step_table: Vec<StepRule>,
    /// Consecutive estimate increases before the search is judged diverged
    #[serde(default = "default_overshoot_threshold")]
    pub overshoot_threshold: u32,
    /// On divergence, the tuned channel resets to this far below the
    /// reference wavelength (nm)
    #[serde(default = "default_reset_offset")]
    pub reset_offset_nm: f64,
    /// Stabilization wait after a divergence reset
    #[serde(with = "humantime_serde", default = "default_reset_settle")]
    pub reset_settle: Duration,
    /// Estimates below this enter near-zero recovery (GHz)
    #[serde(default = "default_near_zero_entry")]
    pub near_zero_entry_ghz: f64,
    /// Size of the deliberate zero-crossing jump (GHz)
    #[serde(default = "default_near_zero_jump")]
    pub near_zero_jump_ghz: f64,
    /// Size of each follow-up jump while the estimate stays ambiguous (GHz)
    #[serde(default = "default_near_zero_retry_jump")]
    pub near_zero_retry_jump_ghz: f64,
    /// Follow-up jumps allowed before the search gives up
    #[serde(default = "default_near_zero_max_retries")]
    pub near_zero_max_retries: u32,
    /// Post-jump estimates above this are treated as implausible (GHz)
    #[serde(default = "default_near_zero_plausible_max")]
    pub near_zero_plausible_max_ghz: f64,
    /// Settle delay between control iterations
    #[serde(with = "humantime_serde", default = "default_settle_delay")]
    pub settle_delay: Duration,
    /// Hard cap on coarse-search iterations
    #[serde(default = "default_max_iterations")]
    pub max_iterations: u32,
}

/// One row of the graduated ESA step table
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StepRule {
    /// Lower edge of the estimate range this rule covers (GHz, inclusive)
    pub min_estimate_ghz: f64,
    /// Frequency decrement to apply (GHz)
    pub step_ghz: f64,
}

/// RF power measurement policy
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RfPowerConfig {
    /// Top-level measurement attempts per sweep step
    #[serde(default = "default_rf_max_attempts")]
    pub max_attempts: u32,
    /// Samples averaged per attempt
    #[serde(default = "default_rf_samples")]
    pub samples_per_attempt: u32,
    /// Delay between samples within an attempt
    #[serde(with = "humantime_serde", default = "default_rf_sample_delay")]
    pub sample_delay: Duration,
    /// Zero the power sensor before the run starts. Refused when the
    /// attenuator output is enabled.
    #[serde(default)]
    pub zero_before_run: bool,
    /// Stabilization wait after zeroing
    #[serde(with = "humantime_serde", default = "default_zero_settle")]
    pub zero_settle: Duration,
}

/// Paths to the optional loss-calibration inputs
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CalibrationPaths {
    /// Network-analyzer two-port file for the probe loss curve
    #[serde(default)]
    pub probe_loss_file: Option<PathBuf>,
    /// Two-column tabular file for the link loss curve
    #[serde(default)]
    pub link_loss_file: Option<PathBuf>,
}

/// Operator metadata recorded in the output header
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RunMetadata {
    /// Device under test label
    #[serde(default)]
    pub device_label: String,
    /// Free-form comment
    #[serde(default)]
    pub comment: String,
    /// Bias voltage applied to the device (V)
    #[serde(default)]
    pub bias_voltage_v: f64,
}

// ============================================================================
// Default value functions
// ============================================================================

fn default_reference_channel() -> u8 {
    3
}

fn default_tuned_channel() -> u8 {
    4
}

fn default_min_wavelength() -> f64 {
    1540.0
}

fn default_max_wavelength() -> f64 {
    1660.0
}

fn default_step_delay() -> Duration {
    Duration::from_secs(1)
}

fn default_true() -> bool {
    true
}

fn default_convergence_threshold() -> f64 {
    1.0
}

fn default_early_step_limit() -> u32 {
    2
}

fn default_early_start_max() -> f64 {
    5.0
}

fn default_early_estimate_min() -> f64 {
    15.0
}

fn default_early_step() -> f64 {
    0.3
}

fn default_proportional_fraction() -> f64 {
    0.67
}

fn default_corrective_step() -> f64 {
    0.2
}

fn default_esa_proportional_above() -> f64 {
    3.0
}

fn default_esa_step_table() -> Vec<StepRule> {
    vec![
        StepRule {
            min_estimate_ghz: 1.5,
            step_ghz: 0.5,
        },
        StepRule {
            min_estimate_ghz: 1.0,
            step_ghz: 0.2,
        },
        StepRule {
            min_estimate_ghz: 0.0,
            step_ghz: 0.1,
        },
    ]
}

fn default_overshoot_threshold() -> u32 {
    3
}

fn default_reset_offset() -> f64 {
    2.0
}

fn default_reset_settle() -> Duration {
    Duration::from_secs(15)
}

fn default_near_zero_entry() -> f64 {
    1.0
}

fn default_near_zero_jump() -> f64 {
    1.0
}

fn default_near_zero_retry_jump() -> f64 {
    0.4
}

fn default_near_zero_max_retries() -> u32 {
    5
}

fn default_near_zero_plausible_max() -> f64 {
    10.0
}

fn default_settle_delay() -> Duration {
    Duration::from_secs(3)
}

fn default_max_iterations() -> u32 {
    200
}

fn default_rf_max_attempts() -> u32 {
    3
}

fn default_rf_samples() -> u32 {
    5
}

fn default_rf_sample_delay() -> Duration {
    Duration::from_millis(100)
}

fn default_zero_settle() -> Duration {
    Duration::from_secs(10)
}

impl Default for SearchTuning {
    fn default() -> Self {
        Self {
            proportional_fraction: default_proportional_fraction(),
            corrective_step_ghz: default_corrective_step(),
            esa_proportional_above_ghz: default_esa_proportional_above(),
            esa_step_table: default_esa_step_table(),
            overshoot_threshold: default_overshoot_threshold(),
            reset_offset_nm: default_reset_offset(),
            reset_settle: default_reset_settle(),
            near_zero_entry_ghz: default_near_zero_entry(),
            near_zero_jump_ghz: default_near_zero_jump(),
            near_zero_retry_jump_ghz: default_near_zero_retry_jump(),
            near_zero_max_retries: default_near_zero_max_retries(),
            near_zero_plausible_max_ghz: default_near_zero_plausible_max(),
            settle_delay: default_settle_delay(),
            max_iterations: default_max_iterations(),
        }
    }
}

impl Default for RfPowerConfig {
    fn default() -> Self {
        Self {
            max_attempts: default_rf_max_attempts(),
            samples_per_attempt: default_rf_samples(),
            sample_delay: default_rf_sample_delay(),
            zero_before_run: false,
            zero_settle: default_zero_settle(),
        }
    }
}

impl Default for EarlyCorrection {
    fn default() -> Self {
        Self {
            step_limit: default_early_step_limit(),
            start_max_ghz: default_early_start_max(),
            estimate_min_ghz: default_early_estimate_min(),
            step_ghz: default_early_step(),
        }
    }
}

// ============================================================================
// Configuration Loading and Validation
// ============================================================================

impl RunConfig {
    /// Load configuration from a TOML file and environment variables.
    ///
    /// Precedence (highest to lowest):
    /// 1. Environment variables (`HETERODYNE__` prefix)
    /// 2. The TOML file
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be parsed or validation fails.
    pub fn load_from<P: AsRef<Path>>(path: P) -> AppResult<Self> {
        let config: Self = Figment::new()
            .merge(Toml::file(path.as_ref()))
            .merge(Env::prefixed("HETERODYNE__").split("__"))
            .extract()?;

        config.validate()?;
        Ok(config)
    }

    /// Validate configuration before a run starts.
    ///
    /// Checks:
    /// - Both starting wavelengths are inside the safe tuning range
    /// - The two channels are distinct
    /// - Step count is positive and the sweep range is non-degenerate
    /// - The proportional fraction is in (0, 1)
    /// - Retry and overshoot thresholds are at least 1
    ///
    /// # Errors
    ///
    /// Returns a descriptive `Configuration` error for the first failure.
    pub fn validate(&self) -> AppResult<()> {
        let l = &self.laser;
        if l.min_wavelength_nm >= l.max_wavelength_nm {
            return Err(HeterodyneError::Configuration(format!(
                "Invalid tuning range [{}, {}] nm",
                l.min_wavelength_nm, l.max_wavelength_nm
            )));
        }
        for (label, wl) in [
            ("reference_wavelength_nm", l.reference_wavelength_nm),
            ("tuned_wavelength_nm", l.tuned_wavelength_nm),
        ] {
            if wl < l.min_wavelength_nm || wl > l.max_wavelength_nm {
                return Err(HeterodyneError::Configuration(format!(
                    "{label} = {wl} outside tuning range [{}, {}] nm",
                    l.min_wavelength_nm, l.max_wavelength_nm
                )));
            }
        }
        if l.reference_channel == l.tuned_channel {
            return Err(HeterodyneError::Configuration(format!(
                "reference_channel and tuned_channel are both {}",
                l.reference_channel
            )));
        }

        if self.sweep.steps == 0 {
            return Err(HeterodyneError::Configuration(
                "sweep.steps must be > 0".to_string(),
            ));
        }
        if self.sweep.start_freq_ghz < 0.0 || self.sweep.end_freq_ghz < 0.0 {
            return Err(HeterodyneError::Configuration(
                "sweep frequencies must be non-negative".to_string(),
            ));
        }
        if (self.sweep.end_freq_ghz - self.sweep.start_freq_ghz).abs() < f64::EPSILON {
            return Err(HeterodyneError::Configuration(
                "sweep start and end frequencies are equal".to_string(),
            ));
        }
        if self.sweep.convergence_threshold_ghz <= 0.0 {
            return Err(HeterodyneError::Configuration(
                "convergence_threshold_ghz must be > 0".to_string(),
            ));
        }
        if self.sweep.convergence_threshold_ghz < 0.5 {
            tracing::warn!(
                threshold_ghz = self.sweep.convergence_threshold_ghz,
                "convergence threshold below 0.5 GHz is not guaranteed achievable"
            );
        }

        let s = &self.search;
        if s.proportional_fraction <= 0.0 || s.proportional_fraction >= 1.0 {
            return Err(HeterodyneError::Configuration(format!(
                "proportional_fraction {} must be in (0, 1)",
                s.proportional_fraction
            )));
        }
        if s.overshoot_threshold == 0 {
            return Err(HeterodyneError::Configuration(
                "overshoot_threshold must be >= 1".to_string(),
            ));
        }
        if s.esa_step_table.is_empty() {
            return Err(HeterodyneError::Configuration(
                "esa_step_table must have at least one rule".to_string(),
            ));
        }

        if self.rf.max_attempts == 0 || self.rf.samples_per_attempt == 0 {
            return Err(HeterodyneError::Configuration(
                "rf.max_attempts and rf.samples_per_attempt must be >= 1".to_string(),
            ));
        }

        Ok(())
    }
}
