//! Two-sensor beat-frequency estimation.
//!
//! Neither sensor covers the full beat-frequency range on its own: the
//! wavelength meter's delta measurement is only meaningful once the two
//! lines are well separated, and the spectrum analyzer's marker peak search
//! is span-limited. The estimator triggers both instruments each cycle and
//! fuses the raw readings under an explicit trust policy, so every consumer
//! sees a single `FrequencyEstimate` instead of two disagreeing numbers.
//!
//! The trust windows are disjoint: readings in the gap between them are
//! discarded and the cycle reports no information. Crossing that gap is the
//! lock controller's job, not the estimator's.

use async_trait::async_trait;
use tracing::{debug, warn};

use crate::error::AppResult;
use crate::instrument::{SpectrumAnalyzer, WavelengthMeter};

/// Which sensor produced a reading or estimate
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrequencySource {
    WavelengthMeter,
    SpectrumAnalyzer,
}

/// One raw sensor reading, tagged with its origin and whether it fell
/// inside that sensor's trust window
#[derive(Debug, Clone, Copy)]
pub struct FrequencyReading {
    pub value_ghz: f64,
    pub source: FrequencySource,
    pub valid: bool,
}

/// Fused result of one estimation cycle.
///
/// `value_ghz` of `None` means "no information this cycle"; callers retry
/// after a short backoff rather than treating it as zero.
#[derive(Debug, Clone, Copy)]
pub struct FrequencyEstimate {
    pub value_ghz: Option<f64>,
    pub chosen_source: Option<FrequencySource>,
}

impl FrequencyEstimate {
    pub fn none() -> Self {
        Self {
            value_ghz: None,
            chosen_source: None,
        }
    }
}

/// Trust windows of the two sensors, in GHz.
///
/// The wavelength meter is authoritative strictly inside
/// (`wlm_min_ghz`, `wlm_max_ghz`); the spectrum analyzer is usable strictly
/// below `esa_max_ghz`. The gap below `wlm_min_ghz` where neither window
/// applies is the dead band the lock controller jumps across.
#[derive(Debug, Clone, Copy)]
pub struct TrustWindows {
    pub wlm_min_ghz: f64,
    pub wlm_max_ghz: f64,
    pub esa_max_ghz: f64,
}

impl Default for TrustWindows {
    fn default() -> Self {
        Self {
            wlm_min_ghz: 50.0,
            wlm_max_ghz: 1000.0,
            esa_max_ghz: 50.0,
        }
    }
}

/// Apply the trust-region fusion rule to one pair of raw readings.
///
/// Pure function so the policy can be tested exhaustively without
/// instruments. Both inputs are in GHz.
pub fn fuse(
    wlm_delta_ghz: Option<f64>,
    esa_peak_ghz: Option<f64>,
    windows: &TrustWindows,
) -> FrequencyEstimate {
    if let Some(delta) = wlm_delta_ghz {
        if delta > windows.wlm_min_ghz && delta < windows.wlm_max_ghz {
            return FrequencyEstimate {
                value_ghz: Some(delta),
                chosen_source: Some(FrequencySource::WavelengthMeter),
            };
        }
    }
    if let Some(peak) = esa_peak_ghz {
        if peak < windows.esa_max_ghz {
            return FrequencyEstimate {
                value_ghz: Some(peak),
                chosen_source: Some(FrequencySource::SpectrumAnalyzer),
            };
        }
    }
    FrequencyEstimate::none()
}

/// Source of fused beat-frequency estimates.
///
/// The control loops depend on this trait rather than on the concrete
/// estimator, so tests can script estimate sequences directly.
#[async_trait]
pub trait EstimateSource: Send {
    /// Run one measurement cycle and return the fused estimate.
    ///
    /// Triggers real hardware; callers must not invoke this more than once
    /// per control iteration.
    async fn estimate(&mut self) -> AppResult<FrequencyEstimate>;
}

/// Production estimator owning the two frequency sensors
pub struct BeatEstimator {
    wavelength_meter: Box<dyn WavelengthMeter>,
    spectrum_analyzer: Box<dyn SpectrumAnalyzer>,
    windows: TrustWindows,
}

impl BeatEstimator {
    pub fn new(
        wavelength_meter: Box<dyn WavelengthMeter>,
        spectrum_analyzer: Box<dyn SpectrumAnalyzer>,
    ) -> Self {
        Self {
            wavelength_meter,
            spectrum_analyzer,
            windows: TrustWindows::default(),
        }
    }

    pub fn with_windows(mut self, windows: TrustWindows) -> Self {
        self.windows = windows;
        self
    }

    /// Raw readings of the last cycle as tagged `FrequencyReading`s,
    /// for diagnostics
    fn readings(
        &self,
        wlm: Option<f64>,
        esa: Option<f64>,
    ) -> (Option<FrequencyReading>, Option<FrequencyReading>) {
        let wlm_reading = wlm.map(|value_ghz| FrequencyReading {
            value_ghz,
            source: FrequencySource::WavelengthMeter,
            valid: value_ghz > self.windows.wlm_min_ghz && value_ghz < self.windows.wlm_max_ghz,
        });
        let esa_reading = esa.map(|value_ghz| FrequencyReading {
            value_ghz,
            source: FrequencySource::SpectrumAnalyzer,
            valid: value_ghz < self.windows.esa_max_ghz,
        });
        (wlm_reading, esa_reading)
    }
}

#[async_trait]
impl EstimateSource for BeatEstimator {
    async fn estimate(&mut self) -> AppResult<FrequencyEstimate> {
        // A failed read is the same as no reading this cycle. The sensors
        // fault transiently in normal operation and the outer loops carry
        // the retry budget.
        let wlm = match self.wavelength_meter.trigger_and_read_delta().await {
            Ok(delta) => delta,
            Err(err) => {
                warn!(error = %format!("{err:#}"), "wavelength meter read failed");
                None
            }
        };
        let esa = match self.spectrum_analyzer.peak_search_frequency().await {
            Ok(peak_hz) => peak_hz.map(|hz| hz / 1e9),
            Err(err) => {
                warn!(error = %format!("{err:#}"), "spectrum analyzer peak search failed");
                None
            }
        };

        let (wlm_reading, esa_reading) = self.readings(wlm, esa);
        let estimate = fuse(wlm, esa, &self.windows);
        debug!(
            wlm = ?wlm_reading,
            esa = ?esa_reading,
            fused = ?estimate.value_ghz,
            source = ?estimate.chosen_source,
            "estimation cycle"
        );
        Ok(estimate)
    }
}
