//! Frequency-lock state machine.
//!
//! Drives the tuned laser channel from an arbitrary starting offset down to
//! the operator's target beat frequency. The search always runs in the same
//! direction: the tuned channel's optical frequency only ever steps down, so
//! the beat note first shrinks toward zero, crosses it, and then grows again
//! on the far side where the sweep will continue.
//!
//! # Phases
//!
//! ```text
//! CoarseSearch ──(estimate < 1 GHz)──> NearZeroRecovery
//!      │  ▲                                   │
//!      │  └──(overshoot reset)                │ (zero crossed)
//!      │                                      ▼
//!      │                               FineApproach ──> Locked
//!      │                                      │
//!      └──────────(bounds violation)──────────┴──────> Aborted
//! ```
//!
//! Every phase polls the estimator, waits a settle delay, and actuates
//! through the bounds-checked [`LaserChannel`]; a computed wavelength
//! outside the safe range aborts the run rather than being clamped.

use std::sync::atomic::{AtomicBool, Ordering};

use tokio::time::sleep;
use tracing::{debug, info, warn};

use crate::config::SearchTuning;
use crate::error::{AppResult, HeterodyneError};
use crate::estimator::{EstimateSource, FrequencySource};
use crate::instrument::{LaserChannel, TunableLaser};

/// Phase of the lock search
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SearchPhase {
    CoarseSearch,
    NearZeroRecovery,
    FineApproach,
    Locked,
    Aborted,
}

/// Mutable state of one lock attempt.
///
/// Created when the attempt starts, mutated every iteration, discarded once
/// `Locked` is reached or the attempt ends in `Aborted`.
#[derive(Debug, Clone)]
pub struct SearchState {
    /// Estimate from the previous coarse iteration
    pub last_freq: Option<f64>,
    /// Length of the current run of strictly increasing estimates
    pub consecutive_increases: u32,
    pub phase: SearchPhase,
}

impl SearchState {
    fn new() -> Self {
        Self {
            last_freq: None,
            consecutive_increases: 0,
            phase: SearchPhase::CoarseSearch,
        }
    }
}

/// Snapshot handed to the progress observer once per estimation cycle
#[derive(Debug, Clone, Copy)]
pub struct LockProgress {
    pub phase: SearchPhase,
    pub iterations: u32,
    pub estimate_ghz: Option<f64>,
    pub wavelength_nm: f64,
}

/// Successful lock handoff
#[derive(Debug, Clone, Copy)]
pub struct LockOutcome {
    /// Last measured beat frequency at lock
    pub beat_freq_ghz: f64,
    /// Estimation cycles consumed by the whole search
    pub iterations: u32,
}

/// The lock-search controller.
///
/// Owns the [`SearchState`] for one attempt; the laser channel and the
/// estimate source are borrowed for the duration of [`run_to_lock`]
/// (sequential ownership, handed to the sweep stepper afterwards).
///
/// [`run_to_lock`]: LockController::run_to_lock
pub struct LockController<'a> {
    tuning: &'a SearchTuning,
    target_start_ghz: f64,
    convergence_threshold_ghz: f64,
    reference_wavelength_nm: f64,
    cancel: &'a AtomicBool,
    pub state: SearchState,
    iterations: u32,
}

impl<'a> LockController<'a> {
    pub fn new(
        tuning: &'a SearchTuning,
        target_start_ghz: f64,
        convergence_threshold_ghz: f64,
        reference_wavelength_nm: f64,
        cancel: &'a AtomicBool,
    ) -> Self {
        Self {
            tuning,
            target_start_ghz,
            convergence_threshold_ghz,
            reference_wavelength_nm,
            cancel,
            state: SearchState::new(),
            iterations: 0,
        }
    }

    /// Run the full search to a locked beat frequency.
    ///
    /// On success the channel holds the locked wavelength and the returned
    /// [`LockOutcome`] carries the last measured beat frequency. On any
    /// error other than cancellation the state is left in `Aborted` and the
    /// laser stays at its last commanded (in-bounds) wavelength.
    pub async fn run_to_lock(
        &mut self,
        channel: &mut LaserChannel,
        laser: &mut dyn TunableLaser,
        source: &mut dyn EstimateSource,
        observer: &mut dyn FnMut(LockProgress),
    ) -> AppResult<LockOutcome> {
        self.state = SearchState::new();
        self.iterations = 0;

        let result = self.search(channel, laser, source, observer).await;
        match &result {
            Ok(outcome) => {
                self.state.phase = SearchPhase::Locked;
                info!(
                    beat_freq_ghz = outcome.beat_freq_ghz,
                    iterations = outcome.iterations,
                    wavelength_nm = channel.wavelength_nm,
                    "lock achieved"
                );
            }
            Err(HeterodyneError::Cancelled) => {
                info!("lock search cancelled");
            }
            Err(err) => {
                self.state.phase = SearchPhase::Aborted;
                warn!(error = %err, "lock search aborted");
            }
        }
        result
    }

    async fn search(
        &mut self,
        channel: &mut LaserChannel,
        laser: &mut dyn TunableLaser,
        source: &mut dyn EstimateSource,
        observer: &mut dyn FnMut(LockProgress),
    ) -> AppResult<LockOutcome> {
        self.coarse_search(channel, laser, source, observer).await?;

        let near_zero_exit = self
            .near_zero_recovery(channel, laser, source, observer)
            .await?;

        // A target at or inside the dead band cannot be approached any
        // closer than the zero-crossing exit point.
        let locked = if self.target_start_ghz > self.tuning.near_zero_entry_ghz {
            self.fine_approach(near_zero_exit, channel, laser, source, observer)
                .await?
        } else {
            near_zero_exit
        };

        Ok(LockOutcome {
            beat_freq_ghz: locked,
            iterations: self.iterations,
        })
    }

    /// Proportional / graduated-step descent until the estimate drops into
    /// the near-zero dead band.
    async fn coarse_search(
        &mut self,
        channel: &mut LaserChannel,
        laser: &mut dyn TunableLaser,
        source: &mut dyn EstimateSource,
        observer: &mut dyn FnMut(LockProgress),
    ) -> AppResult<()> {
        loop {
            self.check_cancel()?;
            self.bump_iterations("coarse search")?;

            let estimate = source.estimate().await?;
            self.observe(observer, estimate.value_ghz, channel.wavelength_nm);

            let (freq, chosen) = match (estimate.value_ghz, estimate.chosen_source) {
                (Some(freq), Some(chosen)) => (freq, chosen),
                _ => {
                    debug!(
                        step_ghz = self.tuning.corrective_step_ghz,
                        "no estimate this cycle, applying corrective step"
                    );
                    channel
                        .step_down_ghz(laser, self.tuning.corrective_step_ghz)
                        .await?;
                    sleep(self.tuning.settle_delay).await;
                    continue;
                }
            };

            if self.register_overshoot(freq) {
                let reset_nm = self.reference_wavelength_nm - self.tuning.reset_offset_nm;
                warn!(
                    consecutive_increases = self.tuning.overshoot_threshold,
                    reset_nm, "search diverged, resetting tuned channel"
                );
                channel.command(laser, reset_nm).await?;
                self.state.consecutive_increases = 0;
                self.state.last_freq = None;
                sleep(self.tuning.reset_settle).await;
                continue;
            }

            if freq < self.tuning.near_zero_entry_ghz {
                self.state.phase = SearchPhase::NearZeroRecovery;
                debug!(freq_ghz = freq, "estimate inside dead band");
                return Ok(());
            }

            let step = self.coarse_step_ghz(freq, chosen);
            debug!(freq_ghz = freq, step_ghz = step, source = ?chosen, "coarse step");
            channel.step_down_ghz(laser, step).await?;
            self.state.last_freq = Some(freq);
            sleep(self.tuning.settle_delay).await;
        }
    }

    /// Track runs of strictly increasing estimates; returns true when the
    /// divergence threshold is reached.
    fn register_overshoot(&mut self, freq: f64) -> bool {
        if let Some(last) = self.state.last_freq {
            if freq > last && freq >= self.tuning.near_zero_entry_ghz {
                self.state.consecutive_increases += 1;
                return self.state.consecutive_increases >= self.tuning.overshoot_threshold;
            }
        }
        self.state.consecutive_increases = 0;
        false
    }

    /// Step size for one coarse iteration.
    ///
    /// The wavelength-meter branch is proportional. The spectrum-analyzer
    /// branch is proportional only for large estimates; below that a
    /// graduated fixed-step table takes over, because a proportional step
    /// at small estimates overshoots badly under sensor noise.
    fn coarse_step_ghz(&self, freq: f64, source: FrequencySource) -> f64 {
        match source {
            FrequencySource::WavelengthMeter => freq * self.tuning.proportional_fraction,
            FrequencySource::SpectrumAnalyzer => {
                if freq > self.tuning.esa_proportional_above_ghz {
                    freq * self.tuning.proportional_fraction
                } else {
                    self.tuning
                        .esa_step_table
                        .iter()
                        .find(|rule| freq >= rule.min_estimate_ghz)
                        .map(|rule| rule.step_ghz)
                        .unwrap_or(self.tuning.corrective_step_ghz)
                }
            }
        }
    }

    /// Jump deliberately across the zero-beat dead band, then keep nudging
    /// until a plausible estimate appears on the far side.
    async fn near_zero_recovery(
        &mut self,
        channel: &mut LaserChannel,
        laser: &mut dyn TunableLaser,
        source: &mut dyn EstimateSource,
        observer: &mut dyn FnMut(LockProgress),
    ) -> AppResult<f64> {
        info!(
            jump_ghz = self.tuning.near_zero_jump_ghz,
            "crossing zero-beat dead band"
        );
        channel
            .step_down_ghz(laser, self.tuning.near_zero_jump_ghz)
            .await?;
        sleep(self.tuning.settle_delay).await;

        let mut attempts = 0u32;
        loop {
            self.check_cancel()?;
            self.bump_iterations("near-zero recovery")?;

            let estimate = source.estimate().await?;
            self.observe(observer, estimate.value_ghz, channel.wavelength_nm);

            match estimate.value_ghz {
                Some(freq) if freq <= self.tuning.near_zero_plausible_max_ghz => {
                    debug!(freq_ghz = freq, "zero crossing confirmed");
                    return Ok(freq);
                }
                other => {
                    if attempts >= self.tuning.near_zero_max_retries {
                        return Err(HeterodyneError::LockFailed(format!(
                            "near-zero recovery exhausted after {attempts} extra jumps"
                        )));
                    }
                    attempts += 1;
                    warn!(
                        estimate = ?other,
                        attempt = attempts,
                        "ambiguous estimate after zero crossing, jumping again"
                    );
                    channel
                        .step_down_ghz(laser, self.tuning.near_zero_retry_jump_ghz)
                        .await?;
                    sleep(self.tuning.settle_delay).await;
                }
            }
        }
    }

    /// Halve the remaining error each iteration until the estimate is
    /// within the convergence threshold of the target.
    async fn fine_approach(
        &mut self,
        start_freq: f64,
        channel: &mut LaserChannel,
        laser: &mut dyn TunableLaser,
        source: &mut dyn EstimateSource,
        observer: &mut dyn FnMut(LockProgress),
    ) -> AppResult<f64> {
        self.state.phase = SearchPhase::FineApproach;
        let mut current = start_freq;
        loop {
            let error = self.target_start_ghz - current;
            if error.abs() <= self.convergence_threshold_ghz {
                return Ok(current);
            }
            self.check_cancel()?;
            self.bump_iterations("fine approach")?;

            // Past the zero crossing the beat grows as the optical
            // frequency steps down, so a positive remaining error maps
            // directly onto a positive step.
            let step = error / 2.0;
            debug!(
                current_ghz = current,
                target_ghz = self.target_start_ghz,
                step_ghz = step,
                "fine approach step"
            );
            channel.step_down_ghz(laser, step).await?;
            sleep(self.tuning.settle_delay).await;

            let estimate = source.estimate().await?;
            self.observe(observer, estimate.value_ghz, channel.wavelength_nm);
            match estimate.value_ghz {
                Some(freq) => current = freq,
                None => debug!("no estimate during fine approach, re-measuring"),
            }
        }
    }

    fn check_cancel(&self) -> AppResult<()> {
        if self.cancel.load(Ordering::Relaxed) {
            return Err(HeterodyneError::Cancelled);
        }
        Ok(())
    }

    fn bump_iterations(&mut self, phase: &str) -> AppResult<()> {
        if self.iterations >= self.tuning.max_iterations {
            return Err(HeterodyneError::LockFailed(format!(
                "iteration cap ({}) hit during {phase}",
                self.tuning.max_iterations
            )));
        }
        self.iterations += 1;
        Ok(())
    }

    fn observe(
        &self,
        observer: &mut dyn FnMut(LockProgress),
        estimate_ghz: Option<f64>,
        wavelength_nm: f64,
    ) {
        observer(LockProgress {
            phase: self.state.phase,
            iterations: self.iterations,
            estimate_ghz,
            wavelength_nm,
        });
    }
}
