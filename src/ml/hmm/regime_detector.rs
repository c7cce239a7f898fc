use chrono::NaiveDate;
use ndarray::{Array1, Array2};
use rayon::prelude::*;
use tracing::{debug, info, warn};

use super::{FitSummary, GaussianHMM, HmmParameters};
use crate::config::RegimeSettings;
use crate::error::{NonConvergence, PipelineError, PipelineResult};
use crate::types::{RegimeAssignment, RegimeLabel};

/// Minimum observations per hidden state
pub const MIN_OBSERVATIONS_PER_STATE: usize = 10;

/// Fitted two-regime model together with its decoded state path
#[derive(Debug, Clone)]
pub struct RegimeFit {
    pub parameters: HmmParameters,
    /// Viterbi state per observation
    pub states: Vec<usize>,
    /// Posterior state probabilities (n_obs x n_states)
    pub posteriors: Array2<f64>,
    pub log_likelihood_history: Vec<f64>,
    pub log_likelihood: f64,
    pub iterations: usize,
    pub converged: bool,
    /// Index of the seeded restart that produced this fit
    pub restart: usize,
    pub warning: Option<NonConvergence>,
    bear_state: usize,
}

impl RegimeFit {
    /// State with the lower fitted mean
    pub fn bear_state(&self) -> usize {
        self.bear_state
    }

    pub fn bull_state(&self) -> usize {
        1 - self.bear_state
    }

    pub fn label_for_state(&self, state: usize) -> RegimeLabel {
        if state == self.bear_state {
            RegimeLabel::BearMarket
        } else {
            RegimeLabel::BullMarket
        }
    }

    pub fn state_for_label(&self, label: RegimeLabel) -> usize {
        match label {
            RegimeLabel::BearMarket => self.bear_state(),
            RegimeLabel::BullMarket => self.bull_state(),
        }
    }

    #[cfg(test)]
    pub fn labels(&self) -> Vec<RegimeLabel> {
        self.states.iter().map(|&s| self.label_for_state(s)).collect()
    }

    pub fn mean(&self, label: RegimeLabel) -> f64 {
        self.parameters.means[self.state_for_label(label)]
    }

    pub fn variance(&self, label: RegimeLabel) -> f64 {
        self.parameters.variances[self.state_for_label(label)]
    }

    /// Pair each decoded state with its day. `timestamps` must line up with the
    /// returns the model was fit on.
    pub fn assignments(&self, timestamps: &[NaiveDate]) -> PipelineResult<Vec<RegimeAssignment>> {
        if timestamps.len() != self.states.len() {
            return Err(PipelineError::invalid(format!(
                "{} timestamps for {} decoded states",
                timestamps.len(),
                self.states.len()
            )));
        }

        Ok(timestamps
            .iter()
            .zip(self.states.iter())
            .enumerate()
            .map(|(t, (&timestamp, &state))| RegimeAssignment {
                timestamp,
                state,
                label: self.label_for_state(state),
                probability: self.posteriors[[t, state]],
            })
            .collect())
    }
}

/// Fits a two-state Gaussian HMM to a return series and labels each day
#[derive(Debug, Clone, Default)]
pub struct RegimeDetector {
    settings: RegimeSettings,
}

impl RegimeDetector {
    pub fn new(settings: RegimeSettings) -> Self {
        Self { settings }
    }

    /// Estimate parameters with Baum-Welch over `n_restarts` seeded starts, keep
    /// the best log-likelihood and decode with Viterbi.
    ///
    /// Hitting the iteration cap is reported through `RegimeFit::warning`, not
    /// as an error.
    pub fn fit_and_label(&self, returns: &[f64]) -> PipelineResult<RegimeFit> {
        self.validate(returns)?;
        let settings = self.settings;

        let candidates: Vec<(usize, GaussianHMM, FitSummary)> = (0..settings.n_restarts)
            .into_par_iter()
            .map(|restart| -> PipelineResult<(usize, GaussianHMM, FitSummary)> {
                let seed = settings.seed.wrapping_add(restart as u64);
                let mut hmm = GaussianHMM::seeded(
                    returns,
                    settings.n_states,
                    seed,
                    settings.tolerance,
                    settings.max_iterations,
                )
                .map_err(|e| PipelineError::invalid(e.to_string()))?;
                let summary = hmm
                    .fit(returns)
                    .map_err(|e| PipelineError::invalid(e.to_string()))?;
                debug!(
                    "Restart {} (seed {}): log-likelihood {:.4} after {} iterations",
                    restart, seed, summary.log_likelihood, summary.iterations
                );
                Ok((restart, hmm, summary))
            })
            .collect::<PipelineResult<Vec<_>>>()?;

        // Highest log-likelihood wins; ties go to the earliest restart
        let mut best: Option<(usize, GaussianHMM, FitSummary)> = None;
        for candidate in candidates {
            if !candidate.2.log_likelihood.is_finite() {
                continue;
            }
            let better = match &best {
                Some((_, _, current)) => candidate.2.log_likelihood > current.log_likelihood,
                None => true,
            };
            if better {
                best = Some(candidate);
            }
        }
        let (restart, hmm, summary) = best.ok_or_else(|| {
            PipelineError::invalid("no restart produced a finite log-likelihood")
        })?;

        decode(hmm, summary, restart, returns)
    }

    fn validate(&self, returns: &[f64]) -> PipelineResult<()> {
        let settings = &self.settings;
        if settings.n_states != 2 {
            return Err(PipelineError::invalid(format!(
                "regime model has exactly 2 states, got n_states={}",
                settings.n_states
            )));
        }
        if settings.max_iterations == 0 {
            return Err(PipelineError::invalid("max_iterations must be > 0"));
        }
        if settings.n_restarts == 0 {
            return Err(PipelineError::invalid("n_restarts must be > 0"));
        }
        if !(settings.tolerance.is_finite() && settings.tolerance > 0.0) {
            return Err(PipelineError::invalid("tolerance must be a positive number"));
        }

        let required = settings.n_states * MIN_OBSERVATIONS_PER_STATE;
        if returns.len() < required {
            return Err(PipelineError::invalid(format!(
                "need at least {} returns to fit {} states, got {}",
                required,
                settings.n_states,
                returns.len()
            )));
        }
        if let Some(pos) = returns.iter().position(|r| !r.is_finite()) {
            return Err(PipelineError::invalid(format!(
                "return at position {} is not finite ({})",
                pos, returns[pos]
            )));
        }
        Ok(())
    }
}

/// Index of the state with the lower mean; ties resolve to state 0
fn lower_mean_state(means: &Array1<f64>) -> usize {
    if means[0] <= means[1] {
        0
    } else {
        1
    }
}

/// Viterbi-decode `returns` under a fitted model and map its states to labels
fn decode(hmm: GaussianHMM, summary: FitSummary, restart: usize, returns: &[f64]) -> PipelineResult<RegimeFit> {
    let states = hmm
        .predict(returns)
        .map_err(|e| PipelineError::invalid(e.to_string()))?;
    let posteriors = hmm
        .posteriors(returns)
        .map_err(|e| PipelineError::invalid(e.to_string()))?;

    let means = &hmm.params.means;
    let bear_state = lower_mean_state(means);

    let warning = if summary.converged {
        None
    } else {
        let warning = NonConvergence {
            iterations: summary.iterations,
            last_improvement: summary.last_improvement,
        };
        warn!(
            "⚠ EM did not converge within {} iterations (last improvement {:.3e}); using parameters at the cap",
            warning.iterations, warning.last_improvement
        );
        Some(warning)
    };

    info!(
        "HMM fit: restart {}, {} iterations, log-likelihood {:.4}, bear mean {:.6}, bull mean {:.6}",
        restart,
        summary.iterations,
        summary.log_likelihood,
        means[bear_state],
        means[1 - bear_state]
    );

    Ok(RegimeFit {
        parameters: hmm.params,
        states,
        posteriors,
        log_likelihood_history: summary.log_likelihood_history,
        log_likelihood: summary.log_likelihood,
        iterations: summary.iterations,
        converged: summary.converged,
        restart,
        warning,
        bear_state,
    })
}

/// Fit a two-state Gaussian HMM to `returns` and label every observation
pub fn fit_and_label(returns: &[f64], settings: &RegimeSettings) -> PipelineResult<RegimeFit> {
    RegimeDetector::new(*settings).fit_and_label(returns)
}
