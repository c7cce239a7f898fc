use anyhow::{anyhow, Result};
use ndarray::{Array1, Array2};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::f64::consts::PI;

/// Variance floor that keeps a state from collapsing onto a single point
pub const MIN_VARIANCE: f64 = 1e-12;

/// Parameters of a Hidden Markov Model with one-dimensional Gaussian emissions
#[derive(Debug, Clone, PartialEq)]
pub struct HmmParameters {
    /// Initial state probabilities (n_states)
    pub initial_distribution: Array1<f64>,
    /// Row-stochastic state transition matrix (n_states x n_states)
    pub transition_matrix: Array2<f64>,
    /// Emission mean per state
    pub means: Array1<f64>,
    /// Emission variance per state
    pub variances: Array1<f64>,
}

impl HmmParameters {
    pub fn n_states(&self) -> usize {
        self.means.len()
    }

    /// Seeded starting point for EM.
    ///
    /// Means come from splitting the sorted observations into `n_states` equal
    /// quantile blocks, jittered by up to 10% of the overall standard deviation.
    /// Every state starts with the overall variance, a uniform initial
    /// distribution and a diagonally dominant transition matrix.
    pub fn initialize(observations: &[f64], n_states: usize, seed: u64) -> Result<Self> {
        let n_obs = observations.len();
        if n_states == 0 || n_obs < n_states {
            return Err(anyhow!(
                "Need at least {} observations to initialize {} states",
                n_states.max(1),
                n_states
            ));
        }

        let mut rng = StdRng::seed_from_u64(seed);

        let mut sorted = observations.to_vec();
        sorted.sort_by(|a, b| a.total_cmp(b));

        let overall_mean = sorted.iter().sum::<f64>() / n_obs as f64;
        let overall_var = (sorted.iter().map(|x| (x - overall_mean).powi(2)).sum::<f64>()
            / n_obs as f64)
            .max(MIN_VARIANCE);
        let overall_std = overall_var.sqrt();

        let mut means = Array1::zeros(n_states);
        for state in 0..n_states {
            let block = &sorted[state * n_obs / n_states..(state + 1) * n_obs / n_states];
            let block_mean = block.iter().sum::<f64>() / block.len() as f64;
            means[state] = block_mean + rng.gen_range(-0.1..0.1) * overall_std;
        }

        let variances = Array1::from_elem(n_states, overall_var);
        let initial_distribution = Array1::from_elem(n_states, 1.0 / n_states as f64);

        let mut transition_matrix = Array2::zeros((n_states, n_states));
        for i in 0..n_states {
            for j in 0..n_states {
                transition_matrix[[i, j]] = if i == j {
                    0.8 + rng.gen::<f64>() * 0.15
                } else {
                    0.01 + rng.gen::<f64>() * 0.1
                };
            }
            let row_sum: f64 = transition_matrix.row(i).sum();
            for j in 0..n_states {
                transition_matrix[[i, j]] /= row_sum;
            }
        }

        Ok(Self {
            initial_distribution,
            transition_matrix,
            means,
            variances,
        })
    }
}

/// Outcome of a Baum-Welch run
#[derive(Debug, Clone)]
pub struct FitSummary {
    /// Log-likelihood before each M-step; the last entry scores the final parameters
    pub log_likelihood_history: Vec<f64>,
    pub log_likelihood: f64,
    /// Number of M-steps applied
    pub iterations: usize,
    pub converged: bool,
    /// Change in log-likelihood over the last iteration
    pub last_improvement: f64,
}

/// Hidden Markov Model with univariate Gaussian emissions, trained by
/// Baum-Welch EM entirely in log space
#[derive(Debug, Clone)]
pub struct GaussianHMM {
    pub params: HmmParameters,
    /// Convergence tolerance on the log-likelihood improvement
    pub tol: f64,
    /// Maximum EM iterations
    pub max_iter: usize,
}

impl GaussianHMM {
    pub fn new(params: HmmParameters, tol: f64, max_iter: usize) -> Self {
        Self {
            params,
            tol,
            max_iter,
        }
    }

    /// Create an HMM with seeded initial parameters for `observations`
    pub fn seeded(
        observations: &[f64],
        n_states: usize,
        seed: u64,
        tol: f64,
        max_iter: usize,
    ) -> Result<Self> {
        let params = HmmParameters::initialize(observations, n_states, seed)?;
        Ok(Self::new(params, tol, max_iter))
    }

    pub fn n_states(&self) -> usize {
        self.params.n_states()
    }

    /// Log density of `x` under the Gaussian emission of `state`
    fn log_emission_prob(&self, x: f64, state: usize) -> f64 {
        let mean = self.params.means[state];
        let var = self.params.variances[state];
        -0.5 * ((2.0 * PI * var).ln() + (x - mean).powi(2) / var)
    }

    /// Emission log densities for every observation and state (n_obs x n_states)
    fn log_emissions(&self, observations: &[f64]) -> Array2<f64> {
        let n_states = self.n_states();
        Array2::from_shape_fn((observations.len(), n_states), |(t, s)| {
            self.log_emission_prob(observations[t], s)
        })
    }

    fn log_transitions(&self) -> Array2<f64> {
        self.params.transition_matrix.mapv(f64::ln)
    }

    /// Forward algorithm: log forward probabilities and sequence log-likelihood
    fn forward(&self, log_b: &Array2<f64>) -> (Array2<f64>, f64) {
        let (n_obs, n_states) = log_b.dim();
        let log_a = self.log_transitions();
        let mut log_alpha = Array2::from_elem((n_obs, n_states), f64::NEG_INFINITY);

        // Initialization
        for state in 0..n_states {
            log_alpha[[0, state]] = self.params.initial_distribution[state].ln() + log_b[[0, state]];
        }

        // Recursion
        let mut terms = vec![0.0; n_states];
        for t in 1..n_obs {
            for j in 0..n_states {
                for i in 0..n_states {
                    terms[i] = log_alpha[[t - 1, i]] + log_a[[i, j]];
                }
                log_alpha[[t, j]] = log_sum_exp(&terms) + log_b[[t, j]];
            }
        }

        // Termination
        let log_prob = log_sum_exp(&log_alpha.row(n_obs - 1).to_vec());

        (log_alpha, log_prob)
    }

    /// Backward algorithm: log backward probabilities
    fn backward(&self, log_b: &Array2<f64>) -> Array2<f64> {
        let (n_obs, n_states) = log_b.dim();
        let log_a = self.log_transitions();
        let mut log_beta = Array2::from_elem((n_obs, n_states), f64::NEG_INFINITY);

        // Initialization: log(1)
        for state in 0..n_states {
            log_beta[[n_obs - 1, state]] = 0.0;
        }

        let mut terms = vec![0.0; n_states];
        for t in (0..n_obs - 1).rev() {
            for i in 0..n_states {
                for j in 0..n_states {
                    terms[j] = log_a[[i, j]] + log_b[[t + 1, j]] + log_beta[[t + 1, j]];
                }
                log_beta[[t, i]] = log_sum_exp(&terms);
            }
        }

        log_beta
    }

    /// Log-likelihood of the observation sequence under the current parameters
    pub fn score(&self, observations: &[f64]) -> Result<f64> {
        if observations.is_empty() {
            return Err(anyhow!("Cannot score an empty sequence"));
        }
        let log_b = self.log_emissions(observations);
        Ok(self.forward(&log_b).1)
    }

    /// Posterior state probabilities `P(state_t = s | observations)` (n_obs x n_states)
    pub fn posteriors(&self, observations: &[f64]) -> Result<Array2<f64>> {
        if observations.is_empty() {
            return Err(anyhow!("Cannot compute posteriors of an empty sequence"));
        }
        let log_b = self.log_emissions(observations);
        let (log_alpha, log_prob) = self.forward(&log_b);
        let log_beta = self.backward(&log_b);
        Ok(occupancy(&log_alpha, &log_beta, log_prob))
    }

    /// Train with Baum-Welch EM from the current parameters.
    ///
    /// Stops when the log-likelihood improves by less than `tol` or after
    /// `max_iter` M-steps. Running out of iterations is not an error; check
    /// `FitSummary::converged`.
    pub fn fit(&mut self, observations: &[f64]) -> Result<FitSummary> {
        let n_obs = observations.len();
        if n_obs < 2 {
            return Err(anyhow!("Need at least 2 observations"));
        }
        if let Some(x) = observations.iter().find(|x| !x.is_finite()) {
            return Err(anyhow!("Observations must be finite, found {}", x));
        }

        let mut history: Vec<f64> = Vec::new();
        let mut last_improvement = f64::INFINITY;
        let mut iterations = 0;

        for _ in 0..self.max_iter {
            // E-step: compute forward-backward
            let log_b = self.log_emissions(observations);
            let (log_alpha, log_prob) = self.forward(&log_b);
            let log_beta = self.backward(&log_b);

            // Check convergence
            if let Some(&prev) = history.last() {
                last_improvement = log_prob - prev;
            }
            history.push(log_prob);
            if history.len() > 1 && last_improvement < self.tol {
                return Ok(FitSummary {
                    log_likelihood: log_prob,
                    log_likelihood_history: history,
                    iterations,
                    converged: true,
                    last_improvement,
                });
            }

            self.m_step(observations, &log_b, &log_alpha, &log_beta, log_prob);
            iterations += 1;
        }

        // Iteration cap reached; score the final parameters with the same rule
        let final_log_prob = self.score(observations)?;
        if let Some(&prev) = history.last() {
            last_improvement = final_log_prob - prev;
        }
        history.push(final_log_prob);

        Ok(FitSummary {
            log_likelihood: final_log_prob,
            converged: history.len() > 1 && last_improvement < self.tol,
            log_likelihood_history: history,
            iterations,
            last_improvement,
        })
    }

    fn m_step(
        &mut self,
        observations: &[f64],
        log_b: &Array2<f64>,
        log_alpha: &Array2<f64>,
        log_beta: &Array2<f64>,
        log_prob: f64,
    ) {
        let n_obs = observations.len();
        let n_states = self.n_states();
        let log_a = self.log_transitions();

        let gamma = occupancy(log_alpha, log_beta, log_prob);

        // Summed pairwise transition posteriors
        let mut xi_sum = Array2::<f64>::zeros((n_states, n_states));
        for t in 0..n_obs - 1 {
            for i in 0..n_states {
                for j in 0..n_states {
                    let log_xi = log_alpha[[t, i]]
                        + log_a[[i, j]]
                        + log_b[[t + 1, j]]
                        + log_beta[[t + 1, j]]
                        - log_prob;
                    xi_sum[[i, j]] += log_xi.exp();
                }
            }
        }

        // Update start probabilities
        let start_sum: f64 = gamma.row(0).sum();
        if start_sum > 0.0 {
            for state in 0..n_states {
                self.params.initial_distribution[state] = gamma[[0, state]] / start_sum;
            }
        }

        // Update transition matrix; a row with no mass keeps its old value
        for i in 0..n_states {
            let row_sum: f64 = xi_sum.row(i).sum();
            if row_sum > 0.0 {
                for j in 0..n_states {
                    self.params.transition_matrix[[i, j]] = xi_sum[[i, j]] / row_sum;
                }
            }
        }

        // Update means and variances
        for state in 0..n_states {
            let gamma_sum: f64 = gamma.column(state).sum();
            if gamma_sum <= f64::MIN_POSITIVE {
                continue;
            }

            let weighted_sum: f64 = observations
                .iter()
                .enumerate()
                .map(|(t, x)| gamma[[t, state]] * x)
                .sum();
            let mean = weighted_sum / gamma_sum;

            let weighted_sq: f64 = observations
                .iter()
                .enumerate()
                .map(|(t, x)| gamma[[t, state]] * (x - mean).powi(2))
                .sum();

            self.params.means[state] = mean;
            self.params.variances[state] = (weighted_sq / gamma_sum).max(MIN_VARIANCE);
        }
    }

    /// Most likely state sequence (Viterbi)
    pub fn predict(&self, observations: &[f64]) -> Result<Vec<usize>> {
        let n_obs = observations.len();
        if n_obs == 0 {
            return Err(anyhow!("Cannot decode an empty sequence"));
        }

        let n_states = self.n_states();
        let log_b = self.log_emissions(observations);
        let log_a = self.log_transitions();
        let mut log_delta = Array2::from_elem((n_obs, n_states), f64::NEG_INFINITY);
        let mut psi = Array2::<usize>::zeros((n_obs, n_states));

        // Initialization
        for state in 0..n_states {
            log_delta[[0, state]] = self.params.initial_distribution[state].ln() + log_b[[0, state]];
        }

        // Recursion
        for t in 1..n_obs {
            for j in 0..n_states {
                let mut max_val = f64::NEG_INFINITY;
                let mut max_state = 0;

                for i in 0..n_states {
                    let val = log_delta[[t - 1, i]] + log_a[[i, j]];
                    if val > max_val {
                        max_val = val;
                        max_state = i;
                    }
                }

                log_delta[[t, j]] = max_val + log_b[[t, j]];
                psi[[t, j]] = max_state;
            }
        }

        // Backtracking
        let mut states = vec![0; n_obs];
        let mut max_val = f64::NEG_INFINITY;
        for state in 0..n_states {
            if log_delta[[n_obs - 1, state]] > max_val {
                max_val = log_delta[[n_obs - 1, state]];
                states[n_obs - 1] = state;
            }
        }

        for t in (0..n_obs - 1).rev() {
            states[t] = psi[[t + 1, states[t + 1]]];
        }

        Ok(states)
    }
}

/// State occupancy `gamma[t][s]` from log forward/backward probabilities
fn occupancy(log_alpha: &Array2<f64>, log_beta: &Array2<f64>, log_prob: f64) -> Array2<f64> {
    let (n_obs, n_states) = log_alpha.dim();
    let mut gamma = Array2::zeros((n_obs, n_states));
    for t in 0..n_obs {
        let mut row_sum = 0.0;
        for state in 0..n_states {
            let g = (log_alpha[[t, state]] + log_beta[[t, state]] - log_prob).exp();
            gamma[[t, state]] = g;
            row_sum += g;
        }
        if row_sum > 0.0 {
            for state in 0..n_states {
                gamma[[t, state]] /= row_sum;
            }
        }
    }
    gamma
}

/// Log-sum-exp trick for numerical stability
fn log_sum_exp(log_values: &[f64]) -> f64 {
    if log_values.is_empty() {
        return f64::NEG_INFINITY;
    }

    let max_val = log_values.iter().cloned().fold(f64::NEG_INFINITY, f64::max);
    if max_val == f64::NEG_INFINITY {
        return f64::NEG_INFINITY;
    }

    let sum_exp: f64 = log_values.iter().map(|&v| (v - max_val).exp()).sum();
    max_val + sum_exp.ln()
}
