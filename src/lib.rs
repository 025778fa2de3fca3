//! Closed-loop lock-and-sweep controller for a two-laser heterodyne bench.
//!
//! Two laser lines beat on a photodetector; this library locks the beat
//! frequency to an operator target by actuating one tunable channel, sweeps
//! it through a configured range while taking retried, averaged RF power
//! measurements, and applies frequency-dependent loss calibration to the
//! collected records. Instrument access goes through capability traits, so
//! the control loops run unchanged against real hardware drivers or the
//! built-in simulated bench.

pub mod calibration;
pub mod config;
pub mod error;
pub mod estimator;
pub mod instrument;
pub mod lock;
pub mod run;
pub mod storage;
pub mod sweep;
