//! Run orchestration.
//!
//! Sequences one complete lock-and-sweep run: configuration validation,
//! laser bring-up, optional sensor zeroing, the lock search, the sweep, and
//! the final calibration pass. The orchestrator owns the cancellation flag
//! and a watch channel carrying the latest [`RunStatus`]; a presentation
//! layer subscribes to the channel and never touches the control loop.
//!
//! Instruments are grouped in a [`Bench`] and borrowed for the duration of
//! one run. The lock controller and the sweep stepper receive them
//! sequentially, so the tuned channel has exactly one writer at any time.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use tokio::sync::watch;
use tokio::time::sleep;
use tracing::{info, warn};
use uuid::Uuid;

use crate::calibration::{CalibratedDataset, LossCalibration};
use crate::config::RunConfig;
use crate::error::{AppResult, HeterodyneError};
use crate::estimator::EstimateSource;
use crate::instrument::{
    LaserChannel, OpticalAttenuator, RfPowerSensor, SourceMeter, TunableLaser,
};
use crate::lock::{LockController, LockOutcome, LockProgress};
use crate::sweep::{SweepProgress, SweepStepper};

/// The instrument set one run drives.
///
/// The beat-frequency sensors live inside the estimate source; everything
/// else is consumed directly.
pub struct Bench {
    pub laser: Box<dyn TunableLaser>,
    pub estimator: Box<dyn EstimateSource>,
    pub rf_sensor: Box<dyn RfPowerSensor>,
    pub source_meter: Box<dyn SourceMeter>,
    pub attenuator: Box<dyn OpticalAttenuator>,
}

/// Latest state of a run, published on the watch channel
#[derive(Debug, Clone)]
pub enum RunStatus {
    Idle,
    Preparing,
    Locking(LockProgress),
    Sweeping(SweepProgress),
    Calibrating,
    Finished { records: usize, cancelled: bool },
    Failed(String),
}

/// Everything a completed run produced
#[derive(Debug, Clone)]
pub struct RunResult {
    /// Unique run identifier
    pub run_id: String,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    /// Configuration the run executed with
    pub config: RunConfig,
    /// Photocurrent read once before any actuation (mA)
    pub initial_photocurrent_ma: f64,
    /// Lock handoff, `None` when the automatic search was disabled or the
    /// run was cancelled before locking
    pub lock: Option<LockOutcome>,
    /// Whether the operator cancelled the run
    pub cancelled: bool,
    pub dataset: CalibratedDataset,
}

/// Orchestrates one lock-and-sweep run.
pub struct RunOrchestrator {
    config: RunConfig,
    cancel: Arc<AtomicBool>,
    status_tx: watch::Sender<RunStatus>,
}

impl RunOrchestrator {
    /// Create an orchestrator for a validated configuration.
    ///
    /// # Errors
    ///
    /// Returns the first configuration validation failure.
    pub fn new(config: RunConfig) -> AppResult<Self> {
        config.validate()?;
        let (status_tx, _) = watch::channel(RunStatus::Idle);
        Ok(Self {
            config,
            cancel: Arc::new(AtomicBool::new(false)),
            status_tx,
        })
    }

    /// Handle the operator uses to cancel the run from another task
    pub fn cancel_handle(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.cancel)
    }

    /// Subscribe to status updates
    pub fn subscribe(&self) -> watch::Receiver<RunStatus> {
        self.status_tx.subscribe()
    }

    pub fn config(&self) -> &RunConfig {
        &self.config
    }

    /// Execute the run to completion, cancellation, or the first fatal
    /// fault.
    ///
    /// On success the result carries the calibrated dataset; a cancelled
    /// run returns normally with whatever was collected. Fatal faults
    /// (bounds violations, lock failure, instrument transport loss) are
    /// published on the status channel and propagated.
    pub async fn run(&self, bench: &mut Bench) -> AppResult<RunResult> {
        let run_id = Uuid::new_v4().to_string();
        let started_at = Utc::now();
        info!(
            run_id = %run_id,
            device = %self.config.metadata.device_label,
            "run starting"
        );

        let result = self.execute(bench, &run_id, started_at).await;
        match &result {
            Ok(run) => {
                self.status_tx.send_replace(RunStatus::Finished {
                    records: run.dataset.records.len(),
                    cancelled: run.cancelled,
                });
            }
            Err(err) => {
                self.status_tx
                    .send_replace(RunStatus::Failed(err.to_string()));
            }
        }
        result
    }

    async fn execute(
        &self,
        bench: &mut Bench,
        run_id: &str,
        started_at: DateTime<Utc>,
    ) -> AppResult<RunResult> {
        self.status_tx.send_replace(RunStatus::Preparing);
        let laser_cfg = &self.config.laser;

        let mut reference = LaserChannel::new(
            laser_cfg.reference_channel,
            laser_cfg.reference_wavelength_nm,
            laser_cfg.min_wavelength_nm,
            laser_cfg.max_wavelength_nm,
        );
        let mut tuned = LaserChannel::new(
            laser_cfg.tuned_channel,
            laser_cfg.tuned_wavelength_nm,
            laser_cfg.min_wavelength_nm,
            laser_cfg.max_wavelength_nm,
        );

        reference
            .command(bench.laser.as_mut(), laser_cfg.reference_wavelength_nm)
            .await?;
        tuned
            .command(bench.laser.as_mut(), laser_cfg.tuned_wavelength_nm)
            .await?;
        for channel in [reference.channel, tuned.channel] {
            bench
                .laser
                .enable(channel)
                .await
                .map_err(HeterodyneError::instrument)?;
        }

        if self.config.rf.zero_before_run {
            self.zero_rf_sensor(bench).await?;
        }

        let initial_photocurrent_ma = bench
            .source_meter
            .read_current()
            .await
            .map_err(HeterodyneError::instrument)?
            * 1e3;
        info!(initial_photocurrent_ma, "bench ready");

        let mut lock = None;
        if self.config.sweep.auto_search {
            let mut controller = LockController::new(
                &self.config.search,
                self.config.sweep.start_freq_ghz,
                self.config.sweep.convergence_threshold_ghz,
                laser_cfg.reference_wavelength_nm,
                &self.cancel,
            );
            let status_tx = &self.status_tx;
            let outcome = controller
                .run_to_lock(
                    &mut tuned,
                    bench.laser.as_mut(),
                    bench.estimator.as_mut(),
                    &mut |progress| {
                        status_tx.send_replace(RunStatus::Locking(progress));
                    },
                )
                .await;
            match outcome {
                Ok(outcome) => lock = Some(outcome),
                Err(HeterodyneError::Cancelled) => {
                    return Ok(self.finish(
                        run_id,
                        started_at,
                        initial_photocurrent_ma,
                        None,
                        true,
                        &[],
                    ));
                }
                Err(err) => return Err(err),
            }
        } else {
            info!("automatic lock search disabled, sweeping from current state");
        }

        let stepper = SweepStepper::new(&self.config.sweep, &self.config.rf, &self.cancel);
        let status_tx = &self.status_tx;
        let records = stepper
            .run(
                &mut tuned,
                bench.laser.as_mut(),
                bench.estimator.as_mut(),
                bench.rf_sensor.as_mut(),
                bench.source_meter.as_mut(),
                bench.attenuator.as_mut(),
                &mut |progress| {
                    status_tx.send_replace(RunStatus::Sweeping(progress));
                },
            )
            .await?;

        let cancelled = self.cancel.load(Ordering::Relaxed);
        Ok(self.finish(
            run_id,
            started_at,
            initial_photocurrent_ma,
            lock,
            cancelled,
            &records,
        ))
    }

    fn finish(
        &self,
        run_id: &str,
        started_at: DateTime<Utc>,
        initial_photocurrent_ma: f64,
        lock: Option<LockOutcome>,
        cancelled: bool,
        records: &[crate::sweep::SweepStepRecord],
    ) -> RunResult {
        self.status_tx.send_replace(RunStatus::Calibrating);
        let calibration = LossCalibration::load(&self.config.calibration);
        let dataset = calibration.calibrate(records);
        let finished_at = Utc::now();
        info!(
            run_id,
            records = dataset.records.len(),
            cancelled,
            elapsed_s = (finished_at - started_at).num_seconds(),
            "run finished"
        );
        RunResult {
            run_id: run_id.to_string(),
            started_at,
            finished_at,
            config: self.config.clone(),
            initial_photocurrent_ma,
            lock,
            cancelled,
            dataset,
        }
    }

    /// Zero the RF power sensor, then wait for it to settle.
    ///
    /// Zeroing with signal applied corrupts the offset, so the zero is
    /// skipped while the attenuator output is enabled. The run continues
    /// with the existing offset.
    async fn zero_rf_sensor(&self, bench: &mut Bench) -> AppResult<()> {
        let output_enabled = bench
            .attenuator
            .output_enabled()
            .await
            .map_err(HeterodyneError::instrument)?;
        if output_enabled {
            warn!("attenuator output is enabled, skipping RF power sensor zero");
            return Ok(());
        }
        info!("zeroing RF power sensor");
        bench
            .rf_sensor
            .zero()
            .await
            .map_err(HeterodyneError::instrument)?;
        sleep(self.config.rf.zero_settle).await;
        Ok(())
    }
}
