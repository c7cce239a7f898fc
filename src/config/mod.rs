pub mod settings;

pub use settings::*;

use anyhow::{anyhow, Context, Result};
use std::path::Path;
use tracing::{debug, info};

pub const API_KEY_ENV: &str = "ALPHA_VANTAGE_API_KEY";
pub const ENV_PREFIX: &str = "REGIME";

/// Build settings from defaults, an optional TOML file and `REGIME__*`
/// environment variables, in increasing priority.
pub fn load_settings(path: &Path) -> Result<PipelineSettings> {
    dotenvy::dotenv().ok();

    let builder = config::Config::builder()
        .add_source(config::Config::try_from(&PipelineSettings::default())?)
        .add_source(config::File::from(path).required(false))
        .add_source(
            config::Environment::with_prefix(ENV_PREFIX)
                .prefix_separator("__")
                .separator("__")
                .try_parsing(true),
        );

    let mut settings: PipelineSettings = builder
        .build()
        .with_context(|| format!("Failed to read configuration from {}", path.display()))?
        .try_deserialize()
        .context("Invalid configuration values")?;

    if settings.provider.api_key.is_empty() {
        if let Ok(key) = std::env::var(API_KEY_ENV) {
            debug!("Using API key from {}", API_KEY_ENV);
            settings.provider.api_key = key;
        }
    }

    settings
        .validate()
        .map_err(|errors| anyhow!("Invalid configuration: {}", errors.join(", ")))?;

    info!("Configuration loaded (file: {})", path.display());
    Ok(settings)
}

/// Default settings as TOML, without the API key
pub fn default_settings_toml() -> Result<String> {
    Ok(toml::to_string_pretty(&PipelineSettings::default())?)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_toml_round_trips() {
        let text = default_settings_toml().unwrap();
        assert!(text.contains("[regime]"));
        let parsed: PipelineSettings = toml::from_str(&text).unwrap();
        assert_eq!(parsed.regime.max_iterations, 1000);
        assert_eq!(parsed.storage.table_name, "market_data");
    }

    #[test]
    fn test_load_settings_reads_file_overrides() {
        let dir = std::env::temp_dir().join(format!("regime_cfg_{}", std::process::id()));
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join("regime.toml");
        std::fs::write(
            &path,
            "[features]\nvol_window = 20\n\n[regime]\nseed = 7\n",
        )
        .unwrap();

        let settings = load_settings(&path).unwrap();
        assert_eq!(settings.features.vol_window, 20);
        assert_eq!(settings.features.ma_window, 50);
        assert_eq!(settings.regime.seed, 7);

        std::fs::remove_dir_all(&dir).ok();
    }

    #[test]
    fn test_missing_file_falls_back_to_defaults() {
        let settings = load_settings(Path::new("/nonexistent/regime.toml")).unwrap();
        assert_eq!(settings.request.symbol, "AAPL");
    }
}
