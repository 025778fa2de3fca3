//! Stepped beat-frequency sweep with per-step measurements.
//!
//! Runs after the lock search has parked the beat note at the sweep start
//! frequency. Each step lowers the tuned channel's optical frequency by one
//! increment (the beat note grows on the far side of zero), waits for the
//! bench to settle, measures the beat frequency, RF power, photocurrent and
//! the attenuator output power, and appends one record.
//!
//! A step whose estimate falls in the sensor dead band produces no record at
//! all; indices in the output stay dense, so a record's `step_index` is its
//! position in the series, not the count of actuation steps taken. RF power
//! measurement is the flakiest read on the bench and gets its own bounded
//! retry-with-averaging; exhaustion degrades that one field to `None`
//! instead of failing the run.

use std::sync::atomic::{AtomicBool, Ordering};

use tokio::time::sleep;
use tracing::{debug, info, warn};

use crate::config::{RfPowerConfig, SweepConfig};
use crate::error::{AppResult, HeterodyneError};
use crate::estimator::EstimateSource;
use crate::instrument::{
    LaserChannel, OpticalAttenuator, RfPowerSensor, SourceMeter, TunableLaser,
};

/// Convert an RF power reading from watts to dBm.
pub fn watts_to_dbm(watts: f64) -> f64 {
    10.0 * watts.log10() + 30.0
}

/// One measured point of the sweep.
///
/// `step_index` is dense over the output series: steps skipped for lack of
/// a frequency estimate never consume an index.
#[derive(Debug, Clone, Copy)]
pub struct SweepStepRecord {
    pub step_index: u32,
    /// Measured beat frequency at this step (GHz)
    pub beat_freq_ghz: f64,
    /// Averaged RF power (dBm), `None` when every measurement attempt failed
    pub raw_power_dbm: Option<f64>,
    /// Device photocurrent (mA)
    pub photocurrent_ma: f64,
    /// Attenuator output power monitor reading (dBm)
    pub voa_power_dbm: f64,
}

/// Snapshot handed to the progress observer once per sweep step
#[derive(Debug, Clone, Copy)]
pub struct SweepProgress {
    /// Actuation step just completed (0-based)
    pub step: u32,
    pub total_steps: u32,
    /// Estimate at this step, `None` when the step was skipped
    pub estimate_ghz: Option<f64>,
    pub raw_power_dbm: Option<f64>,
}

/// The sweep executor.
///
/// Borrows the sweep and RF tuning for one run; instruments are handed in
/// per call, after the lock controller releases them.
pub struct SweepStepper<'a> {
    sweep: &'a SweepConfig,
    rf: &'a RfPowerConfig,
    cancel: &'a AtomicBool,
}

impl<'a> SweepStepper<'a> {
    pub fn new(sweep: &'a SweepConfig, rf: &'a RfPowerConfig, cancel: &'a AtomicBool) -> Self {
        Self { sweep, rf, cancel }
    }

    /// Frequency increment per actuation step (GHz)
    fn delta_ghz(&self) -> f64 {
        (self.sweep.end_freq_ghz - self.sweep.start_freq_ghz) / f64::from(self.sweep.steps)
    }

    /// Execute the sweep and return the collected records.
    ///
    /// Cancellation is checked at the top of every step and returns the
    /// records collected so far; it is the one early exit that is not an
    /// error. A wavelength bound violation while advancing is fatal and
    /// propagates.
    pub async fn run(
        &self,
        channel: &mut LaserChannel,
        laser: &mut dyn TunableLaser,
        source: &mut dyn EstimateSource,
        rf_sensor: &mut dyn RfPowerSensor,
        source_meter: &mut dyn SourceMeter,
        attenuator: &mut dyn OpticalAttenuator,
        observer: &mut dyn FnMut(SweepProgress),
    ) -> AppResult<Vec<SweepStepRecord>> {
        let delta = self.delta_ghz();
        let mut records: Vec<SweepStepRecord> = Vec::with_capacity(self.sweep.steps as usize);
        info!(
            start_ghz = self.sweep.start_freq_ghz,
            end_ghz = self.sweep.end_freq_ghz,
            steps = self.sweep.steps,
            delta_ghz = delta,
            "starting sweep"
        );

        for step in 0..self.sweep.steps {
            if self.cancel.load(Ordering::Relaxed) {
                info!(step, collected = records.len(), "sweep cancelled");
                return Ok(records);
            }

            let mut estimate = source.estimate().await?.value_ghz;

            if let Some(freq) = estimate {
                if self.early_correction_applies(step, freq) {
                    // Residual lock error this early in a low sweep cannot
                    // be a real excursion. Nudge the tuned line back up in
                    // optical frequency and trust the re-measurement.
                    let correction = self.sweep.early_correction.step_ghz;
                    warn!(
                        step,
                        estimate_ghz = freq,
                        correction_ghz = correction,
                        "residual lock error at sweep start, applying correction"
                    );
                    channel.step_down_ghz(laser, -correction).await?;
                    sleep(self.sweep.step_delay).await;
                    estimate = source.estimate().await?.value_ghz;
                }
            }

            match estimate {
                Some(freq) => {
                    let raw_power_dbm = self.measure_rf_power(rf_sensor, freq).await;
                    let photocurrent_ma = source_meter
                        .read_current()
                        .await
                        .map_err(HeterodyneError::instrument)?
                        * 1e3;
                    let voa_power_dbm = attenuator
                        .read_actual_power()
                        .await
                        .map_err(HeterodyneError::instrument)?;

                    let record = SweepStepRecord {
                        step_index: records.len() as u32,
                        beat_freq_ghz: freq,
                        raw_power_dbm,
                        photocurrent_ma,
                        voa_power_dbm,
                    };
                    debug!(
                        step,
                        index = record.step_index,
                        beat_ghz = freq,
                        power_dbm = ?raw_power_dbm,
                        photocurrent_ma,
                        "sweep step recorded"
                    );
                    records.push(record);
                    observer(SweepProgress {
                        step,
                        total_steps: self.sweep.steps,
                        estimate_ghz: Some(freq),
                        raw_power_dbm,
                    });
                }
                None => {
                    // Dead-band step. Nothing to record; the actuation still
                    // advances so the sweep keeps its frequency schedule.
                    warn!(step, "no frequency estimate, skipping record");
                    observer(SweepProgress {
                        step,
                        total_steps: self.sweep.steps,
                        estimate_ghz: None,
                        raw_power_dbm: None,
                    });
                }
            }

            channel.step_down_ghz(laser, delta).await?;
            sleep(self.sweep.step_delay).await;
        }

        info!(collected = records.len(), "sweep complete");
        Ok(records)
    }

    fn early_correction_applies(&self, step: u32, estimate_ghz: f64) -> bool {
        let ec = &self.sweep.early_correction;
        step < ec.step_limit
            && self.sweep.start_freq_ghz < ec.start_max_ghz
            && estimate_ghz > ec.estimate_min_ghz
    }

    /// Measure RF power at the given beat frequency.
    ///
    /// Each attempt configures the sensor's frequency correction, takes a
    /// burst of samples and averages them in watts. An attempt fails when
    /// any sample reports under/over-range, a read errors out, or the
    /// average is non-positive. After `max_attempts` failures the step's
    /// power field degrades to `None`.
    async fn measure_rf_power(
        &self,
        sensor: &mut dyn RfPowerSensor,
        center_freq_ghz: f64,
    ) -> Option<f64> {
        for attempt in 1..=self.rf.max_attempts {
            if let Err(err) = sensor.configure(center_freq_ghz).await {
                warn!(
                    attempt,
                    error = %format!("{err:#}"),
                    "RF sensor configure failed"
                );
                continue;
            }

            let mut sum_watts = 0.0;
            let mut complete = true;
            for _ in 0..self.rf.samples_per_attempt {
                match sensor.trigger_and_read().await {
                    Ok(Some(watts)) => sum_watts += watts,
                    Ok(None) => {
                        complete = false;
                        break;
                    }
                    Err(err) => {
                        warn!(
                            attempt,
                            error = %format!("{err:#}"),
                            "RF sensor read failed"
                        );
                        complete = false;
                        break;
                    }
                }
                sleep(self.rf.sample_delay).await;
            }

            if complete {
                let mean_watts = sum_watts / f64::from(self.rf.samples_per_attempt);
                if mean_watts > 0.0 {
                    return Some(watts_to_dbm(mean_watts));
                }
            }
            debug!(attempt, center_freq_ghz, "RF measurement attempt failed");
        }
        warn!(
            center_freq_ghz,
            attempts = self.rf.max_attempts,
            "RF power measurement exhausted, recording no power"
        );
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::EarlyCorrection;
    use crate::error::AppResult;
    use crate::estimator::{FrequencyEstimate, FrequencySource};
    use anyhow::Result;
    use async_trait::async_trait;
    use std::collections::VecDeque;
    use std::time::Duration;

    struct ScriptedSource {
        values: VecDeque<Option<f64>>,
    }

    impl ScriptedSource {
        fn new(values: &[Option<f64>]) -> Self {
            Self {
                values: values.iter().copied().collect(),
            }
        }
    }

    #[async_trait]
    impl EstimateSource for ScriptedSource {
        async fn estimate(&mut self) -> AppResult<FrequencyEstimate> {
            let value_ghz = self.values.pop_front().flatten();
            Ok(FrequencyEstimate {
                value_ghz,
                chosen_source: value_ghz.map(|_| FrequencySource::SpectrumAnalyzer),
            })
        }
    }

    #[derive(Default)]
    struct RecordingLaser {
        commands: Vec<(u8, f64)>,
    }

    #[async_trait]
    impl TunableLaser for RecordingLaser {
        async fn set_wavelength(&mut self, channel: u8, nm: f64) -> Result<()> {
            self.commands.push((channel, nm));
            Ok(())
        }

        async fn wavelength(&mut self, channel: u8) -> Result<f64> {
            Ok(self
                .commands
                .iter()
                .rev()
                .find(|(ch, _)| *ch == channel)
                .map(|(_, nm)| *nm)
                .unwrap_or(0.0))
        }

        async fn enable(&mut self, _channel: u8) -> Result<()> {
            Ok(())
        }

        async fn disable(&mut self, _channel: u8) -> Result<()> {
            Ok(())
        }
    }

    /// RF sensor replaying a scripted sequence of per-read outcomes
    struct ScriptedRfSensor {
        readings: VecDeque<Option<f64>>,
        configure_calls: u32,
    }

    impl ScriptedRfSensor {
        fn new(readings: &[Option<f64>]) -> Self {
            Self {
                readings: readings.iter().copied().collect(),
                configure_calls: 0,
            }
        }
    }

    #[async_trait]
    impl RfPowerSensor for ScriptedRfSensor {
        async fn configure(&mut self, _center_freq_ghz: f64) -> Result<()> {
            self.configure_calls += 1;
            Ok(())
        }

        async fn trigger_and_read(&mut self) -> Result<Option<f64>> {
            Ok(self.readings.pop_front().flatten())
        }

        async fn zero(&mut self) -> Result<()> {
            Ok(())
        }
    }

    struct ConstSourceMeter {
        amps: f64,
    }

    #[async_trait]
    impl SourceMeter for ConstSourceMeter {
        async fn read_current(&mut self) -> Result<f64> {
            Ok(self.amps)
        }
    }

    struct ConstAttenuator {
        dbm: f64,
    }

    #[async_trait]
    impl OpticalAttenuator for ConstAttenuator {
        async fn read_actual_power(&mut self) -> Result<f64> {
            Ok(self.dbm)
        }

        async fn output_enabled(&mut self) -> Result<bool> {
            Ok(true)
        }
    }

    fn fast_sweep(start: f64, end: f64, steps: u32) -> SweepConfig {
        SweepConfig {
            start_freq_ghz: start,
            end_freq_ghz: end,
            steps,
            step_delay: Duration::ZERO,
            auto_search: true,
            convergence_threshold_ghz: 1.0,
            early_correction: EarlyCorrection::default(),
        }
    }

    fn fast_rf() -> RfPowerConfig {
        RfPowerConfig {
            max_attempts: 3,
            samples_per_attempt: 2,
            sample_delay: Duration::ZERO,
            zero_before_run: false,
            zero_settle: Duration::ZERO,
        }
    }

    fn channel() -> LaserChannel {
        LaserChannel::new(4, 1548.0, 1540.0, 1660.0)
    }

    struct Bench {
        laser: RecordingLaser,
        rf: ScriptedRfSensor,
        smu: ConstSourceMeter,
        voa: ConstAttenuator,
    }

    impl Bench {
        fn with_rf(readings: &[Option<f64>]) -> Self {
            Self {
                laser: RecordingLaser::default(),
                rf: ScriptedRfSensor::new(readings),
                smu: ConstSourceMeter { amps: 5.2e-3 },
                voa: ConstAttenuator { dbm: -8.0 },
            }
        }
    }

    #[test]
    fn test_watts_to_dbm() {
        assert!((watts_to_dbm(1e-3) - 0.0).abs() < 1e-9);
        assert!((watts_to_dbm(1.0) - 30.0).abs() < 1e-9);
        assert!((watts_to_dbm(1e-4) - (-10.0)).abs() < 1e-9);
    }

    #[tokio::test]
    async fn test_sweep_records_every_step() {
        let sweep = fast_sweep(10.0, 20.0, 3);
        let rf = fast_rf();
        let cancel = AtomicBool::new(false);
        let stepper = SweepStepper::new(&sweep, &rf, &cancel);

        let mut source = ScriptedSource::new(&[Some(10.0), Some(13.3), Some(16.7)]);
        let mut bench = Bench::with_rf(&[Some(1e-4); 6]);
        let mut channel = channel();

        let records = stepper
            .run(
                &mut channel,
                &mut bench.laser,
                &mut source,
                &mut bench.rf,
                &mut bench.smu,
                &mut bench.voa,
                &mut |_| {},
            )
            .await
            .expect("sweep");

        assert_eq!(records.len(), 3);
        for (i, record) in records.iter().enumerate() {
            assert_eq!(record.step_index, i as u32);
            assert!((record.photocurrent_ma - 5.2).abs() < 1e-9);
            assert!((record.voa_power_dbm - (-8.0)).abs() < 1e-9);
            let power = record.raw_power_dbm.expect("power");
            assert!((power - (-10.0)).abs() < 1e-9);
        }
        // One actuation command per step
        assert_eq!(bench.laser.commands.len(), 3);
    }

    #[tokio::test]
    async fn test_skipped_step_keeps_indices_dense() {
        let sweep = fast_sweep(10.0, 20.0, 4);
        let rf = fast_rf();
        let cancel = AtomicBool::new(false);
        let stepper = SweepStepper::new(&sweep, &rf, &cancel);

        let mut source = ScriptedSource::new(&[Some(10.0), None, Some(15.0), Some(17.5)]);
        let mut bench = Bench::with_rf(&[Some(1e-4); 8]);
        let mut channel = channel();

        let records = stepper
            .run(
                &mut channel,
                &mut bench.laser,
                &mut source,
                &mut bench.rf,
                &mut bench.smu,
                &mut bench.voa,
                &mut |_| {},
            )
            .await
            .expect("sweep");

        assert_eq!(records.len(), 3);
        let indices: Vec<u32> = records.iter().map(|r| r.step_index).collect();
        assert_eq!(indices, vec![0, 1, 2]);
        // The skipped step still advanced the laser
        assert_eq!(bench.laser.commands.len(), 4);
    }

    #[tokio::test]
    async fn test_rf_retry_recovers_within_bound() {
        let sweep = fast_sweep(10.0, 20.0, 1);
        let rf = fast_rf();
        let cancel = AtomicBool::new(false);
        let stepper = SweepStepper::new(&sweep, &rf, &cancel);

        let mut source = ScriptedSource::new(&[Some(10.0)]);
        // First attempt's first sample under-ranges, second attempt succeeds
        let mut bench = Bench::with_rf(&[None, Some(1e-4), Some(1e-4)]);
        let mut channel = channel();

        let records = stepper
            .run(
                &mut channel,
                &mut bench.laser,
                &mut source,
                &mut bench.rf,
                &mut bench.smu,
                &mut bench.voa,
                &mut |_| {},
            )
            .await
            .expect("sweep");

        assert_eq!(records.len(), 1);
        assert!(records[0].raw_power_dbm.is_some());
        assert_eq!(bench.rf.configure_calls, 2);
    }

    #[tokio::test]
    async fn test_rf_exhaustion_degrades_to_none() {
        let sweep = fast_sweep(10.0, 20.0, 1);
        let rf = fast_rf();
        let cancel = AtomicBool::new(false);
        let stepper = SweepStepper::new(&sweep, &rf, &cancel);

        let mut source = ScriptedSource::new(&[Some(10.0)]);
        let mut bench = Bench::with_rf(&[None; 10]);
        let mut channel = channel();

        let records = stepper
            .run(
                &mut channel,
                &mut bench.laser,
                &mut source,
                &mut bench.rf,
                &mut bench.smu,
                &mut bench.voa,
                &mut |_| {},
            )
            .await
            .expect("sweep");

        // The step is still recorded; only the power field degrades
        assert_eq!(records.len(), 1);
        assert!(records[0].raw_power_dbm.is_none());
        assert_eq!(bench.rf.configure_calls, 3);
        assert!((records[0].beat_freq_ghz - 10.0).abs() < f64::EPSILON);
    }

    #[tokio::test]
    async fn test_cancellation_returns_partial_records() {
        let sweep = fast_sweep(10.0, 20.0, 5);
        let rf = fast_rf();
        let cancel = AtomicBool::new(false);
        let stepper = SweepStepper::new(&sweep, &rf, &cancel);

        let mut source = ScriptedSource::new(&[Some(10.0); 5]);
        let mut bench = Bench::with_rf(&[Some(1e-4); 10]);
        let mut channel = channel();

        let records = stepper
            .run(
                &mut channel,
                &mut bench.laser,
                &mut source,
                &mut bench.rf,
                &mut bench.smu,
                &mut bench.voa,
                &mut |progress| {
                    if progress.step == 1 {
                        cancel.store(true, Ordering::Relaxed);
                    }
                },
            )
            .await
            .expect("sweep");

        assert_eq!(records.len(), 2);
    }

    #[tokio::test]
    async fn test_early_correction_raises_optical_frequency() {
        // Low sweep start with a first estimate far above it: the stepper
        // applies one corrective step and trusts the re-measurement
        let sweep = fast_sweep(0.0, 10.0, 2);
        let rf = fast_rf();
        let cancel = AtomicBool::new(false);
        let stepper = SweepStepper::new(&sweep, &rf, &cancel);

        let mut source = ScriptedSource::new(&[Some(20.0), Some(0.4), Some(5.0)]);
        let mut bench = Bench::with_rf(&[Some(1e-4); 10]);
        let mut channel = channel();
        let start_nm = channel.wavelength_nm;

        let records = stepper
            .run(
                &mut channel,
                &mut bench.laser,
                &mut source,
                &mut bench.rf,
                &mut bench.smu,
                &mut bench.voa,
                &mut |_| {},
            )
            .await
            .expect("sweep");

        // First command is the correction: a negative step shortens the
        // wavelength (raises the optical frequency)
        let (_, first_nm) = bench.laser.commands[0];
        assert!(first_nm < start_nm);
        // The recorded estimate is the re-measured one
        assert_eq!(records.len(), 2);
        assert!((records[0].beat_freq_ghz - 0.4).abs() < f64::EPSILON);
        // Correction plus one advance per step
        assert_eq!(bench.laser.commands.len(), 3);
    }

    #[tokio::test]
    async fn test_advance_lengthens_wavelength_for_rising_sweep() {
        let sweep = fast_sweep(10.0, 20.0, 3);
        let rf = fast_rf();
        let cancel = AtomicBool::new(false);
        let stepper = SweepStepper::new(&sweep, &rf, &cancel);

        let mut source = ScriptedSource::new(&[Some(10.0), Some(13.3), Some(16.7)]);
        let mut bench = Bench::with_rf(&[Some(1e-4); 6]);
        let mut channel = channel();
        let start_nm = channel.wavelength_nm;

        stepper
            .run(
                &mut channel,
                &mut bench.laser,
                &mut source,
                &mut bench.rf,
                &mut bench.smu,
                &mut bench.voa,
                &mut |_| {},
            )
            .await
            .expect("sweep");

        let mut previous = start_nm;
        for (_, nm) in &bench.laser.commands {
            assert!(*nm > previous);
            previous = *nm;
        }
    }
}
