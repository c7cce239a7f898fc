use chrono::NaiveDate;
use serde::Serialize;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{info, warn};

use crate::chart::write_regime_chart;
use crate::config::{PipelineSettings, RegimeSettings, RequestSettings};
use crate::data::{add_features, clean};
use crate::database::TableStore;
use crate::error::{PipelineError, PipelineResult};
use crate::market_data::PriceLoader;
use crate::ml::{fit_and_label, RegimeFit};
use crate::types::{FeatureTable, LabeledRow, RegimeLabel, RegimeTable};

/// Symbol and inclusive date range for one run
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunRequest {
    pub symbol: String,
    pub start: NaiveDate,
    pub end: NaiveDate,
}

impl From<&RequestSettings> for RunRequest {
    fn from(settings: &RequestSettings) -> Self {
        Self {
            symbol: settings.symbol.clone(),
            start: settings.start,
            end: settings.end,
        }
    }
}

/// Fitted parameters of one regime
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct RegimeSummary {
    pub label: RegimeLabel,
    pub mean: f64,
    pub variance: f64,
    pub days: usize,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PipelineReport {
    pub symbol: String,
    pub fetched_rows: usize,
    pub clean_rows: usize,
    pub labeled_rows: usize,
    pub iterations: usize,
    pub converged: bool,
    pub log_likelihood: f64,
    /// Log-likelihood before each M-step of the winning restart, then the final score
    pub log_likelihood_history: Vec<f64>,
    pub restart: usize,
    pub regimes: Vec<RegimeSummary>,
    pub table_name: String,
    pub chart_path: Option<PathBuf>,
}

impl PipelineReport {
    #[cfg(test)]
    pub fn regime(&self, label: RegimeLabel) -> Option<&RegimeSummary> {
        self.regimes.iter().find(|r| r.label == label)
    }

    pub fn log_summary(&self) {
        info!("━━━ Summary: {} ━━━", self.symbol);
        info!("  Rows: {} fetched, {} clean, {} labeled", self.fetched_rows, self.clean_rows, self.labeled_rows);
        info!(
            "  EM: {} iterations, converged: {}, log-likelihood {:.4} (restart {})",
            self.iterations, self.converged, self.log_likelihood, self.restart
        );
        for regime in &self.regimes {
            info!(
                "  {:<12} mean {:+.6}  variance {:.3e}  {:5} days",
                regime.label.as_str(),
                regime.mean,
                regime.variance,
                regime.days
            );
        }
        info!("  Stored in table: {}", self.table_name);
        if let Some(path) = &self.chart_path {
            info!("  Chart: {}", path.display());
        }
    }
}

/// Fit the regime model on every row with a defined return and attach the
/// decoded assignment to that row. Rows without a return stay unlabeled.
pub fn label_regimes(table: FeatureTable, settings: &RegimeSettings) -> PipelineResult<(RegimeTable, RegimeFit)> {
    let (timestamps, returns) = table.defined_returns();
    let fit = fit_and_label(&returns, settings)?;
    let mut assignments = fit.assignments(&timestamps)?.into_iter();

    let rows = table
        .rows
        .into_iter()
        .map(|features| LabeledRow {
            regime: features.log_return.and_then(|_| assignments.next()),
            features,
        })
        .collect();

    Ok((
        RegimeTable {
            symbol: table.symbol,
            rows,
        },
        fit,
    ))
}

/// Fetch, clean, build features, fit and persist one symbol
pub struct RegimePipeline {
    loader: Arc<dyn PriceLoader>,
    store: Arc<dyn TableStore>,
    settings: PipelineSettings,
}

impl RegimePipeline {
    pub fn new(loader: Arc<dyn PriceLoader>, store: Arc<dyn TableStore>, settings: PipelineSettings) -> Self {
        Self {
            loader,
            store,
            settings,
        }
    }

    pub async fn run(&self, request: RunRequest) -> PipelineResult<PipelineReport> {
        if request.start > request.end {
            return Err(PipelineError::invalid(format!(
                "start {} is after end {}",
                request.start, request.end
            )));
        }

        info!("━━━ Step 1: Fetching {} ({} to {}) ━━━", request.symbol, request.start, request.end);
        let raw = self.loader.fetch(&request.symbol, request.start, request.end).await?;
        let fetched_rows = raw.len();
        info!("✓ Fetched {} rows", fetched_rows);

        info!("━━━ Step 2: Cleaning ━━━");
        let prices = clean(raw)?;
        let clean_rows = prices.len();
        info!("✓ {} rows kept, {} dropped", clean_rows, fetched_rows - clean_rows);

        info!("━━━ Step 3: Building features ━━━");
        let features = add_features(prices, &self.settings.features)?;
        info!(
            "✓ {} feature rows: returns, {}-day volatility, {}-day moving average",
            features.len(),
            self.settings.features.vol_window,
            self.settings.features.ma_window
        );

        info!("━━━ Step 4: Fitting 2-state Gaussian HMM ━━━");
        let (table, fit) = label_regimes(features, &self.settings.regime)?;
        if let Some(warning) = fit.warning {
            if self.settings.fail_on_non_convergence {
                return Err(warning.into());
            }
            warn!(
                "⚠ Continuing with parameters from iteration {} (last improvement {:.3e})",
                warning.iterations, warning.last_improvement
            );
        }
        info!("✓ Labeled {} days", table.assignments().count());

        info!("━━━ Step 5: Storing table {} ━━━", self.settings.storage.table_name);
        self.store.store(&table, &self.settings.storage.table_name).await?;

        let chart_path = match &self.settings.chart.output_path {
            Some(path) => {
                info!("━━━ Step 6: Rendering chart ━━━");
                let title = self
                    .settings
                    .chart
                    .title
                    .clone()
                    .unwrap_or_else(|| format!("{} market regimes", table.symbol));
                write_regime_chart(&table, &title, path)?;
                Some(path.clone())
            }
            None => None,
        };

        let regimes = [RegimeLabel::BearMarket, RegimeLabel::BullMarket]
            .into_iter()
            .map(|label| RegimeSummary {
                label,
                mean: fit.mean(label),
                variance: fit.variance(label),
                days: table.count_label(label),
            })
            .collect();

        Ok(PipelineReport {
            symbol: table.symbol.clone(),
            fetched_rows,
            clean_rows,
            labeled_rows: table.assignments().count(),
            iterations: fit.iterations,
            converged: fit.converged,
            log_likelihood: fit.log_likelihood,
            log_likelihood_history: fit.log_likelihood_history.clone(),
            restart: fit.restart,
            regimes,
            table_name: self.settings.storage.table_name.clone(),
            chart_path,
        })
    }
}
