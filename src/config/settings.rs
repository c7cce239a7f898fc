use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineSettings {
    /// Treat EM non-convergence as a hard error instead of a warning
    pub fail_on_non_convergence: bool,
    pub request: RequestSettings,
    pub features: FeatureSettings,
    pub regime: RegimeSettings,
    pub provider: ProviderSettings,
    pub storage: StorageSettings,
    pub chart: ChartSettings,
}

impl PipelineSettings {
    pub fn validate(&self) -> Result<(), Vec<String>> {
        let mut errors = Vec::new();

        // Request validation
        if self.request.symbol.trim().is_empty() {
            errors.push("request.symbol must not be empty".to_string());
        }
        if self.request.start > self.request.end {
            errors.push("request.start must not be after request.end".to_string());
        }

        // Feature validation
        if self.features.vol_window == 0 {
            errors.push("features.vol_window must be >= 1".to_string());
        }
        if self.features.ma_window == 0 {
            errors.push("features.ma_window must be >= 1".to_string());
        }

        // Regime validation
        if self.regime.n_states != 2 {
            errors.push("regime.n_states must be 2".to_string());
        }
        if self.regime.max_iterations == 0 {
            errors.push("regime.max_iterations must be > 0".to_string());
        }
        if !(self.regime.tolerance.is_finite() && self.regime.tolerance > 0.0) {
            errors.push("regime.tolerance must be a positive number".to_string());
        }
        if self.regime.n_restarts == 0 {
            errors.push("regime.n_restarts must be > 0".to_string());
        }

        // Provider validation
        if self.provider.requests_per_minute == 0 {
            errors.push("provider.requests_per_minute must be > 0".to_string());
        }
        if !matches!(self.provider.output_size.as_str(), "compact" | "full") {
            errors.push("provider.output_size must be 'compact' or 'full'".to_string());
        }

        // Storage validation
        if !crate::database::is_valid_table_name(&self.storage.table_name) {
            errors.push(format!(
                "storage.table_name '{}' is not a valid SQL identifier",
                self.storage.table_name
            ));
        }

        if errors.is_empty() {
            Ok(())
        } else {
            Err(errors)
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RequestSettings {
    pub symbol: String,
    pub start: NaiveDate,
    pub end: NaiveDate,
}

impl Default for RequestSettings {
    fn default() -> Self {
        Self {
            symbol: "AAPL".to_string(),
            start: NaiveDate::from_ymd_opt(2000, 1, 1).unwrap_or_default(),
            end: NaiveDate::from_ymd_opt(2025, 1, 1).unwrap_or_default(),
        }
    }
}

/// How the per-day return is computed from adjusted closes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReturnKind {
    /// `p[i] / p[i-1] - 1`
    #[default]
    Simple,
    /// `ln(p[i] / p[i-1])`
    Log,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
#[serde(default)]
pub struct FeatureSettings {
    pub vol_window: usize,
    pub ma_window: usize,
    pub return_kind: ReturnKind,
}

impl Default for FeatureSettings {
    fn default() -> Self {
        Self {
            vol_window: 10,
            ma_window: 50,
            return_kind: ReturnKind::Simple,
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
#[serde(default)]
pub struct RegimeSettings {
    pub n_states: usize,
    pub max_iterations: usize,
    pub tolerance: f64,
    pub seed: u64,
    /// Independent seeded EM runs; the best log-likelihood wins
    pub n_restarts: usize,
}

impl Default for RegimeSettings {
    fn default() -> Self {
        Self {
            n_states: 2,
            max_iterations: 1000,
            tolerance: 1e-6,
            seed: 42,
            n_restarts: 4,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ProviderSettings {
    pub base_url: String,
    /// Falls back to `ALPHA_VANTAGE_API_KEY` when empty
    pub api_key: String,
    pub output_size: String,
    pub requests_per_minute: u32,
    pub timeout_secs: u64,
}

impl Default for ProviderSettings {
    fn default() -> Self {
        Self {
            base_url: "https://www.alphavantage.co".to_string(),
            api_key: String::new(),
            output_size: "full".to_string(),
            requests_per_minute: 5,
            timeout_secs: 30,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageSettings {
    pub database_url: String,
    pub table_name: String,
}

impl Default for StorageSettings {
    fn default() -> Self {
        Self {
            database_url: "sqlite:./investment_data.db".to_string(),
            table_name: "market_data".to_string(),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ChartSettings {
    /// Chart is only rendered when a path is set
    pub output_path: Option<PathBuf>,
    pub title: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_are_valid() {
        let settings = PipelineSettings::default();
        assert!(settings.validate().is_ok());
        assert_eq!(settings.features.vol_window, 10);
        assert_eq!(settings.features.ma_window, 50);
        assert_eq!(settings.regime.n_states, 2);
        assert_eq!(settings.regime.max_iterations, 1000);
    }

    #[test]
    fn test_validate_reports_every_violation() {
        let mut settings = PipelineSettings::default();
        settings.features.vol_window = 0;
        settings.regime.n_states = 3;
        settings.regime.tolerance = f64::NAN;
        settings.storage.table_name = "drop table;".to_string();

        let errors = settings.validate().unwrap_err();
        assert_eq!(errors.len(), 4);
        assert!(errors.iter().any(|e| e.contains("vol_window")));
        assert!(errors.iter().any(|e| e.contains("n_states")));
        assert!(errors.iter().any(|e| e.contains("tolerance")));
        assert!(errors.iter().any(|e| e.contains("table_name")));
    }

    #[test]
    fn test_return_kind_serde() {
        let kind: ReturnKind = serde_json::from_str("\"log\"").unwrap();
        assert_eq!(kind, ReturnKind::Log);
    }
}
