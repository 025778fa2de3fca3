//! Custom error types for the application.
//!
//! This module defines the primary error type, `HeterodyneError`, for the
//! entire application. Using the `thiserror` crate, it provides a centralized
//! and consistent way to handle the different kinds of errors that can occur,
//! from I/O and configuration issues to instrument and control-loop faults.
//!
//! ## Error Hierarchy
//!
//! `HeterodyneError` is an enum that consolidates various error sources:
//!
//! - **`Config`**: Wraps errors from the `figment` crate, typically related to
//!   file parsing or format issues in the configuration files.
//! - **`Configuration`**: Represents semantic errors in the configuration,
//!   such as values that parse fine but are logically invalid (e.g., a start
//!   wavelength outside the laser's tuning range). These are caught during
//!   the validation step before a run starts.
//! - **`Io`**: Wraps standard `std::io::Error`, covering all file I/O.
//! - **`Instrument`**: A general category for errors originating from
//!   instrument drivers, anything from a communication failure to an invalid
//!   command sent to the hardware.
//! - **`WavelengthOutOfBounds`**: A commanded wavelength would leave the
//!   laser's safe tuning range. This is always fatal for a run; the
//!   controller never clamps and reissues.
//! - **`LockFailed`**: The lock controller could not converge (near-zero
//!   recovery exhausted its jump budget, or the iteration cap was hit).
//! - **`Cancelled`**: The run was cancelled cooperatively by the operator.
//! - **`Calibration`**: A calibration file could not be parsed. Note that a
//!   *missing* curve is not an error (its contribution is zero); this variant
//!   is only produced by the parsers themselves.
//!
//! By using `#[from]`, `HeterodyneError` can be seamlessly created from
//! underlying error types, simplifying error handling throughout the
//! application with the `?` operator.

use thiserror::Error;

/// Convenience alias for results using the application error type.
pub type AppResult<T> = std::result::Result<T, HeterodyneError>;

#[derive(Error, Debug)]
pub enum HeterodyneError {
    #[error("Configuration error: {0}")]
    Config(#[from] figment::Error),

    #[error("Configuration validation error: {0}")]
    Configuration(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Instrument error: {0}")]
    Instrument(String),

    #[error("Wavelength {requested_nm:.3} nm out of bounds [{min_nm:.1}, {max_nm:.1}] nm on channel {channel}")]
    WavelengthOutOfBounds {
        channel: u8,
        requested_nm: f64,
        min_nm: f64,
        max_nm: f64,
    },

    #[error("Frequency lock failed: {0}")]
    LockFailed(String),

    #[error("Run cancelled by operator")]
    Cancelled,

    #[error("Calibration error: {0}")]
    Calibration(String),

    #[error("Data processing error: {0}")]
    Processing(String),
}

impl HeterodyneError {
    /// Wrap an instrument-layer `anyhow::Error` with its full context chain.
    pub fn instrument(err: anyhow::Error) -> Self {
        HeterodyneError::Instrument(format!("{err:#}"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = HeterodyneError::Instrument("laser failed".to_string());
        assert_eq!(err.to_string(), "Instrument error: laser failed");
    }

    #[test]
    fn test_bounds_error_display() {
        let err = HeterodyneError::WavelengthOutOfBounds {
            channel: 4,
            requested_nm: 1665.2,
            min_nm: 1540.0,
            max_nm: 1660.0,
        };
        let msg = err.to_string();
        assert!(msg.contains("1665.200"));
        assert!(msg.contains("channel 4"));
    }

    #[test]
    fn test_instrument_context_chain() {
        let inner = anyhow::anyhow!("timeout").context("reading power sensor");
        let err = HeterodyneError::instrument(inner);
        assert!(err.to_string().contains("reading power sensor"));
        assert!(err.to_string().contains("timeout"));
    }
}
