//! Simulated heterodyne bench.
//!
//! Implements every instrument capability trait against a small shared
//! physics model: two optical lines at the commanded wavelengths, a beat
//! note at |f_ref - f_tuned|, and sensor readings derived from the true
//! beat with bounded uniform noise. Each simulated sensor also enforces its
//! own usable span, returning `None` outside it exactly as the real devices
//! do, so the estimator's trust policy is exercised end to end.
//!
//! Used by the binary's demo mode and by the integration tests.

use std::collections::HashMap;
use std::sync::Arc;

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use tokio::sync::Mutex;

use super::{
    optical_frequency_hz, OpticalAttenuator, RfPowerSensor, SourceMeter, SpectrumAnalyzer,
    TunableLaser, WavelengthMeter,
};

/// Tunable parameters of the simulated bench
#[derive(Debug, Clone)]
pub struct SimSettings {
    /// Smallest line separation the wavelength meter can resolve (GHz)
    pub wlm_min_resolvable_ghz: f64,
    /// Largest separation the wavelength meter reports (GHz)
    pub wlm_max_ghz: f64,
    /// Low-frequency cutoff of the spectrum analyzer (GHz)
    pub esa_min_ghz: f64,
    /// Span limit of the spectrum analyzer (GHz)
    pub esa_span_max_ghz: f64,
    /// Half-width of the uniform measurement noise (GHz)
    pub noise_ghz: f64,
    /// RF power at zero beat frequency (dBm)
    pub rf_power_at_dc_dbm: f64,
    /// RF power roll-off per GHz of beat frequency (dB)
    pub rf_rolloff_db_per_ghz: f64,
    /// Quiescent photocurrent (A)
    pub photocurrent_a: f64,
    /// Attenuator monitor reading (dBm)
    pub voa_power_dbm: f64,
}

impl Default for SimSettings {
    fn default() -> Self {
        Self {
            wlm_min_resolvable_ghz: 40.0,
            wlm_max_ghz: 1100.0,
            esa_min_ghz: 0.05,
            esa_span_max_ghz: 55.0,
            noise_ghz: 0.05,
            rf_power_at_dc_dbm: -10.0,
            rf_rolloff_db_per_ghz: 0.4,
            photocurrent_a: 5.2e-3,
            voa_power_dbm: -8.0,
        }
    }
}

struct BenchState {
    reference_channel: u8,
    tuned_channel: u8,
    wavelengths_nm: HashMap<u8, f64>,
    enabled: HashMap<u8, bool>,
    attenuator_output_enabled: bool,
    rf_center_ghz: f64,
    rf_zeroed: bool,
    rng: StdRng,
    settings: SimSettings,
}

impl BenchState {
    fn beat_ghz(&self) -> f64 {
        let f_ref = self
            .wavelengths_nm
            .get(&self.reference_channel)
            .map(|nm| optical_frequency_hz(*nm))
            .unwrap_or(0.0);
        let f_tuned = self
            .wavelengths_nm
            .get(&self.tuned_channel)
            .map(|nm| optical_frequency_hz(*nm))
            .unwrap_or(0.0);
        (f_ref - f_tuned).abs() / 1e9
    }

    fn both_enabled(&self) -> bool {
        let on = |ch: &u8| self.enabled.get(ch).copied().unwrap_or(false);
        on(&self.reference_channel) && on(&self.tuned_channel)
    }

    fn noise(&mut self) -> f64 {
        let half = self.settings.noise_ghz;
        if half <= 0.0 {
            return 0.0;
        }
        self.rng.gen_range(-half..half)
    }
}

type Shared = Arc<Mutex<BenchState>>;

/// Simulated bench handle bundling one instance of each instrument.
///
/// All instruments share the same physics state; wavelength commands issued
/// through [`SimLaser`] are immediately visible to every sensor.
pub struct SimulatedBench {
    state: Shared,
    pub laser: SimLaser,
    pub wavelength_meter: SimWavelengthMeter,
    pub spectrum_analyzer: SimSpectrumAnalyzer,
    pub rf_sensor: SimRfPowerSensor,
    pub source_meter: SimSourceMeter,
    pub attenuator: SimAttenuator,
}

impl SimulatedBench {
    /// Build a bench with both channels at the given starting wavelengths,
    /// outputs disabled, and a deterministic noise stream.
    pub fn new(
        reference_channel: u8,
        tuned_channel: u8,
        reference_nm: f64,
        tuned_nm: f64,
        seed: u64,
        settings: SimSettings,
    ) -> Self {
        let mut wavelengths_nm = HashMap::new();
        wavelengths_nm.insert(reference_channel, reference_nm);
        wavelengths_nm.insert(tuned_channel, tuned_nm);
        let state: Shared = Arc::new(Mutex::new(BenchState {
            reference_channel,
            tuned_channel,
            wavelengths_nm,
            enabled: HashMap::new(),
            attenuator_output_enabled: false,
            rf_center_ghz: 0.0,
            rf_zeroed: false,
            rng: StdRng::seed_from_u64(seed),
            settings,
        }));
        Self {
            laser: SimLaser {
                state: state.clone(),
            },
            wavelength_meter: SimWavelengthMeter {
                state: state.clone(),
            },
            spectrum_analyzer: SimSpectrumAnalyzer {
                state: state.clone(),
            },
            rf_sensor: SimRfPowerSensor {
                state: state.clone(),
            },
            source_meter: SimSourceMeter {
                state: state.clone(),
            },
            attenuator: SimAttenuator {
                state: state.clone(),
            },
            state,
        }
    }

    /// True beat frequency of the model, for assertions in tests
    pub async fn true_beat_ghz(&self) -> f64 {
        self.state.lock().await.beat_ghz()
    }

    /// Flip the attenuator output path on or off
    pub async fn set_attenuator_output(&self, enabled: bool) {
        self.state.lock().await.attenuator_output_enabled = enabled;
    }

    /// Whether the RF sensor has been zeroed since construction
    pub async fn rf_zeroed(&self) -> bool {
        self.state.lock().await.rf_zeroed
    }
}

#[derive(Clone)]
pub struct SimLaser {
    state: Shared,
}

#[async_trait]
impl TunableLaser for SimLaser {
    async fn set_wavelength(&mut self, channel: u8, nm: f64) -> Result<()> {
        let mut state = self.state.lock().await;
        if !state.wavelengths_nm.contains_key(&channel) {
            return Err(anyhow!("Unknown laser channel {channel}"));
        }
        state.wavelengths_nm.insert(channel, nm);
        Ok(())
    }

    async fn wavelength(&mut self, channel: u8) -> Result<f64> {
        let state = self.state.lock().await;
        state
            .wavelengths_nm
            .get(&channel)
            .copied()
            .ok_or_else(|| anyhow!("Unknown laser channel {channel}"))
    }

    async fn enable(&mut self, channel: u8) -> Result<()> {
        self.state.lock().await.enabled.insert(channel, true);
        Ok(())
    }

    async fn disable(&mut self, channel: u8) -> Result<()> {
        self.state.lock().await.enabled.insert(channel, false);
        Ok(())
    }
}

#[derive(Clone)]
pub struct SimWavelengthMeter {
    state: Shared,
}

#[async_trait]
impl WavelengthMeter for SimWavelengthMeter {
    async fn trigger_and_read_delta(&mut self) -> Result<Option<f64>> {
        let mut state = self.state.lock().await;
        if !state.both_enabled() {
            return Ok(None);
        }
        let beat = state.beat_ghz();
        if beat < state.settings.wlm_min_resolvable_ghz || beat > state.settings.wlm_max_ghz {
            return Ok(None);
        }
        let noise = state.noise();
        Ok(Some(beat + noise))
    }
}

#[derive(Clone)]
pub struct SimSpectrumAnalyzer {
    state: Shared,
}

#[async_trait]
impl SpectrumAnalyzer for SimSpectrumAnalyzer {
    async fn peak_search_frequency(&mut self) -> Result<Option<f64>> {
        let mut state = self.state.lock().await;
        if !state.both_enabled() {
            return Ok(None);
        }
        let beat = state.beat_ghz();
        if beat < state.settings.esa_min_ghz || beat > state.settings.esa_span_max_ghz {
            return Ok(None);
        }
        let noise = state.noise();
        Ok(Some((beat + noise).max(0.0) * 1e9))
    }
}

#[derive(Clone)]
pub struct SimRfPowerSensor {
    state: Shared,
}

#[async_trait]
impl RfPowerSensor for SimRfPowerSensor {
    async fn configure(&mut self, center_freq_ghz: f64) -> Result<()> {
        self.state.lock().await.rf_center_ghz = center_freq_ghz;
        Ok(())
    }

    async fn trigger_and_read(&mut self) -> Result<Option<f64>> {
        let mut state = self.state.lock().await;
        if !state.both_enabled() {
            return Ok(None);
        }
        let beat = state.beat_ghz();
        let dbm = state.settings.rf_power_at_dc_dbm
            - state.settings.rf_rolloff_db_per_ghz * beat
            + state.noise() * 0.5;
        let watts = 10f64.powf((dbm - 30.0) / 10.0);
        Ok(Some(watts))
    }

    async fn zero(&mut self) -> Result<()> {
        let mut state = self.state.lock().await;
        if state.attenuator_output_enabled {
            return Err(anyhow!("Cannot zero with attenuator output enabled"));
        }
        state.rf_zeroed = true;
        Ok(())
    }
}

#[derive(Clone)]
pub struct SimSourceMeter {
    state: Shared,
}

#[async_trait]
impl SourceMeter for SimSourceMeter {
    async fn read_current(&mut self) -> Result<f64> {
        let mut state = self.state.lock().await;
        let jitter = state.noise() * 1e-5;
        Ok(state.settings.photocurrent_a + jitter)
    }
}

#[derive(Clone)]
pub struct SimAttenuator {
    state: Shared,
}

#[async_trait]
impl OpticalAttenuator for SimAttenuator {
    async fn read_actual_power(&mut self) -> Result<f64> {
        let mut state = self.state.lock().await;
        let jitter = state.noise() * 0.1;
        Ok(state.settings.voa_power_dbm + jitter)
    }

    async fn output_enabled(&mut self) -> Result<bool> {
        Ok(self.state.lock().await.attenuator_output_enabled)
    }
}
