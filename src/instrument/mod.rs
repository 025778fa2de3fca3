//! Instrument capability traits.
//!
//! Abstract device capabilities for the heterodyne bench. The controller
//! consumes these method-level interfaces only; the underlying bus framing
//! (GPIB, USB, VISA strings) belongs to the driver implementing the trait.
//!
//! # Design Philosophy
//!
//! Each trait models one capability the control loop needs, not one physical
//! box. A combined instrument (e.g. an attenuator with a built-in power
//! monitor) simply implements several traits. Measurement triggers take
//! `&mut self`: every read re-arms the device, so reads are non-idempotent
//! and must be sequenced by the caller.
//!
//! All methods return `anyhow::Result` so drivers can attach transport
//! context freely; the control loop converts to the application error type
//! at its boundary.

use anyhow::Result;
use async_trait::async_trait;

use crate::error::{AppResult, HeterodyneError};

pub mod sim;

/// Speed of light in vacuum (m/s), used for wavelength/frequency conversion.
pub const SPEED_OF_LIGHT_M_PER_S: f64 = 299_792_458.0;

/// Optical frequency (Hz) of a vacuum wavelength given in nanometers.
pub fn optical_frequency_hz(wavelength_nm: f64) -> f64 {
    SPEED_OF_LIGHT_M_PER_S / (wavelength_nm * 1e-9)
}

/// Vacuum wavelength (nm) of an optical frequency given in Hz.
pub fn wavelength_nm(frequency_hz: f64) -> f64 {
    SPEED_OF_LIGHT_M_PER_S / frequency_hz * 1e9
}

/// Wavelength (nm) after lowering the optical frequency by `step_ghz`.
///
/// A positive step lowers the optical frequency (lengthens the wavelength);
/// a negative step raises it. This is the single actuation primitive of the
/// whole control loop: the tuned channel only ever moves in optical
/// frequency, and the beat note responds with |f_ref - f_tuned|.
pub fn wavelength_after_step_ghz(wavelength_nm_in: f64, step_ghz: f64) -> f64 {
    wavelength_nm(optical_frequency_hz(wavelength_nm_in) - step_ghz * 1e9)
}

/// Tunable dual-output laser source.
#[async_trait]
pub trait TunableLaser: Send + Sync {
    /// Command a channel to the given wavelength.
    ///
    /// # Arguments
    ///
    /// * `channel` - Output channel number
    /// * `nm` - Target wavelength in nanometers
    async fn set_wavelength(&mut self, channel: u8, nm: f64) -> Result<()>;

    /// Read back the commanded wavelength of a channel in nanometers
    async fn wavelength(&mut self, channel: u8) -> Result<f64>;

    /// Enable a channel's output
    async fn enable(&mut self, channel: u8) -> Result<()>;

    /// Disable a channel's output
    async fn disable(&mut self, channel: u8) -> Result<()>;
}

/// Wavelength meter tracking two optical lines.
#[async_trait]
pub trait WavelengthMeter: Send + Sync {
    /// Trigger a measurement cycle and read the frequency difference between
    /// the two tracked lines, in GHz.
    ///
    /// Returns `None` when the meter cannot resolve two lines (separation
    /// below its resolving power, or one line missing). `None` is a normal
    /// per-cycle outcome, not an error.
    async fn trigger_and_read_delta(&mut self) -> Result<Option<f64>>;
}

/// Electrical spectrum analyzer with a marker peak search.
#[async_trait]
pub trait SpectrumAnalyzer: Send + Sync {
    /// Run a peak search and return the marker frequency in Hz.
    ///
    /// Returns `None` when no peak rises above the noise floor inside the
    /// analyzer's span.
    async fn peak_search_frequency(&mut self) -> Result<Option<f64>>;
}

/// RF power sensor.
#[async_trait]
pub trait RfPowerSensor: Send + Sync {
    /// Set the sensor's frequency-dependent correction to the given center
    /// frequency.
    ///
    /// # Arguments
    ///
    /// * `center_freq_ghz` - Expected signal frequency in GHz
    async fn configure(&mut self, center_freq_ghz: f64) -> Result<()>;

    /// Trigger one reading and return it in watts, or `None` on a transient
    /// under/over-range condition.
    async fn trigger_and_read(&mut self) -> Result<Option<f64>>;

    /// Zero the sensor offset. Must only be called with no signal applied.
    async fn zero(&mut self) -> Result<()>;
}

/// Source meter supplying the device bias and reporting photocurrent.
#[async_trait]
pub trait SourceMeter: Send + Sync {
    /// Read the instantaneous current in amps
    async fn read_current(&mut self) -> Result<f64>;
}

/// Variable optical attenuator with a power monitor.
#[async_trait]
pub trait OpticalAttenuator: Send + Sync {
    /// Read the actual output power in dBm
    async fn read_actual_power(&mut self) -> Result<f64>;

    /// Whether the attenuator output path is currently enabled
    async fn output_enabled(&mut self) -> Result<bool>;
}

/// One output of the tunable source, with its commanded wavelength and the
/// safe tuning range.
///
/// Owned exclusively by whichever controller is active; all actuation goes
/// through [`LaserChannel::command`], which bounds-checks before the command
/// is issued. A computed wavelength outside the range is fatal and is never
/// clamped.
#[derive(Debug, Clone)]
pub struct LaserChannel {
    /// Channel number on the source
    pub channel: u8,
    /// Last commanded wavelength (nm)
    pub wavelength_nm: f64,
    /// Lower edge of the safe tuning range (nm)
    pub min_nm: f64,
    /// Upper edge of the safe tuning range (nm)
    pub max_nm: f64,
}

impl LaserChannel {
    pub fn new(channel: u8, wavelength_nm: f64, min_nm: f64, max_nm: f64) -> Self {
        Self {
            channel,
            wavelength_nm,
            min_nm,
            max_nm,
        }
    }

    /// Check a candidate wavelength against the safe tuning range.
    pub fn check(&self, nm: f64) -> AppResult<()> {
        if !nm.is_finite() || nm < self.min_nm || nm > self.max_nm {
            return Err(HeterodyneError::WavelengthOutOfBounds {
                channel: self.channel,
                requested_nm: nm,
                min_nm: self.min_nm,
                max_nm: self.max_nm,
            });
        }
        Ok(())
    }

    /// Bounds-check and issue a wavelength command, recording the new value
    /// on success.
    pub async fn command(&mut self, laser: &mut dyn TunableLaser, nm: f64) -> AppResult<()> {
        self.check(nm)?;
        laser
            .set_wavelength(self.channel, nm)
            .await
            .map_err(HeterodyneError::instrument)?;
        self.wavelength_nm = nm;
        Ok(())
    }

    /// Lower the channel's optical frequency by `step_ghz` (negative raises
    /// it), bounds-checked like any other command.
    pub async fn step_down_ghz(
        &mut self,
        laser: &mut dyn TunableLaser,
        step_ghz: f64,
    ) -> AppResult<()> {
        let target = wavelength_after_step_ghz(self.wavelength_nm, step_ghz);
        self.command(laser, target).await
    }
}
