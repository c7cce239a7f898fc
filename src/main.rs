mod chart;
mod config;
mod data;
mod database;
mod error;
mod indicators;
mod market_data;
mod ml;
mod pipeline;
mod types;

use anyhow::{anyhow, Result};
use chrono::NaiveDate;
use clap::{Parser, Subcommand};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{info, Level};
use tracing_subscriber::FmtSubscriber;

use config::{load_settings, PipelineSettings};
use database::Database;
use market_data::{write_csv, AlphaVantageClient, CsvPriceLoader, PriceLoader};
use pipeline::{RegimePipeline, RunRequest};

#[derive(Parser)]
#[command(name = "regime-detect")]
#[command(version)]
#[command(about = "Detect bull and bear market regimes from daily prices with a Gaussian HMM", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Configuration file path
    #[arg(short, long, default_value = "regime.toml")]
    config: PathBuf,

    /// Enable verbose logging
    #[arg(short, long)]
    verbose: bool,

    /// Emit logs as JSON lines
    #[arg(long)]
    json_logs: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Fetch, clean, label and store one symbol
    Run {
        /// Ticker symbol (e.g., AAPL, SPY)
        #[arg(short, long)]
        symbol: Option<String>,
        /// Start date (YYYY-MM-DD)
        #[arg(long)]
        start: Option<NaiveDate>,
        /// End date (YYYY-MM-DD)
        #[arg(long)]
        end: Option<NaiveDate>,
        /// Read prices from a CSV file instead of Alpha Vantage
        #[arg(long)]
        csv: Option<PathBuf>,
        /// Rolling volatility window in days
        #[arg(long)]
        vol_window: Option<usize>,
        /// Moving average window in days
        #[arg(long)]
        ma_window: Option<usize>,
        /// Seed for HMM initialization
        #[arg(long)]
        seed: Option<u64>,
        /// EM iteration cap
        #[arg(long)]
        max_iterations: Option<usize>,
        /// Number of seeded EM restarts
        #[arg(long)]
        restarts: Option<usize>,
        /// Destination table name
        #[arg(long)]
        table: Option<String>,
        /// SQLite database URL (e.g., sqlite:./investment_data.db)
        #[arg(long)]
        db: Option<String>,
        /// Write an HTML regime chart to this path
        #[arg(long)]
        chart: Option<PathBuf>,
        /// Print the run report as JSON
        #[arg(long)]
        json: bool,
    },
    /// Download daily prices from Alpha Vantage to a CSV file
    Fetch {
        #[arg(short, long)]
        symbol: Option<String>,
        #[arg(long)]
        start: Option<NaiveDate>,
        #[arg(long)]
        end: Option<NaiveDate>,
        /// Output CSV file path
        #[arg(short, long, default_value = "prices.csv")]
        output: PathBuf,
    },
    /// Print rows from a stored regime table
    Show {
        #[arg(short, long)]
        table: Option<String>,
        /// Number of most recent rows to print
        #[arg(short, long, default_value = "20")]
        limit: usize,
        #[arg(long)]
        db: Option<String>,
    },
    /// Print the default configuration as TOML
    InitConfig,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Initialize logging
    let log_level = if cli.verbose { Level::DEBUG } else { Level::INFO };
    if cli.json_logs {
        let subscriber = FmtSubscriber::builder()
            .with_max_level(log_level)
            .json()
            .finish();
        tracing::subscriber::set_global_default(subscriber)?;
    } else {
        let subscriber = FmtSubscriber::builder()
            .with_max_level(log_level)
            .with_target(false)
            .with_thread_ids(false)
            .with_file(false)
            .with_line_number(false)
            .finish();
        tracing::subscriber::set_global_default(subscriber)?;
    }

    match cli.command {
        Commands::InitConfig => {
            print!("{}", config::default_settings_toml()?);
        }
        Commands::Run {
            symbol,
            start,
            end,
            csv,
            vol_window,
            ma_window,
            seed,
            max_iterations,
            restarts,
            table,
            db,
            chart,
            json,
        } => {
            let mut settings = load_settings(&cli.config)?;
            apply_request_overrides(&mut settings, symbol, start, end);
            if let Some(v) = vol_window {
                settings.features.vol_window = v;
            }
            if let Some(v) = ma_window {
                settings.features.ma_window = v;
            }
            if let Some(v) = seed {
                settings.regime.seed = v;
            }
            if let Some(v) = max_iterations {
                settings.regime.max_iterations = v;
            }
            if let Some(v) = restarts {
                settings.regime.n_restarts = v;
            }
            if let Some(v) = table {
                settings.storage.table_name = v;
            }
            if let Some(v) = db {
                settings.storage.database_url = v;
            }
            if chart.is_some() {
                settings.chart.output_path = chart;
            }
            run_pipeline(settings, csv.as_deref(), json).await?;
        }
        Commands::Fetch {
            symbol,
            start,
            end,
            output,
        } => {
            let mut settings = load_settings(&cli.config)?;
            apply_request_overrides(&mut settings, symbol, start, end);
            fetch_prices(&settings, &output).await?;
        }
        Commands::Show { table, limit, db } => {
            let settings = load_settings(&cli.config)?;
            let table = table.unwrap_or(settings.storage.table_name);
            let db = db.unwrap_or(settings.storage.database_url);
            show_table(&db, &table, limit).await?;
        }
    }

    Ok(())
}

fn apply_request_overrides(
    settings: &mut PipelineSettings,
    symbol: Option<String>,
    start: Option<NaiveDate>,
    end: Option<NaiveDate>,
) {
    if let Some(symbol) = symbol {
        settings.request.symbol = symbol;
    }
    if let Some(start) = start {
        settings.request.start = start;
    }
    if let Some(end) = end {
        settings.request.end = end;
    }
}

async fn run_pipeline(settings: PipelineSettings, csv: Option<&Path>, json: bool) -> Result<()> {
    settings
        .validate()
        .map_err(|errors| anyhow!("Invalid settings: {}", errors.join(", ")))?;

    let loader: Arc<dyn PriceLoader> = match csv {
        Some(path) => {
            info!("Price source: CSV file {}", path.display());
            Arc::new(CsvPriceLoader::new(path))
        }
        None => {
            info!("Price source: Alpha Vantage");
            Arc::new(AlphaVantageClient::new(&settings.provider)?)
        }
    };
    let store = Arc::new(Database::new(&settings.storage.database_url).await?);

    let request = RunRequest::from(&settings.request);
    let pipeline = RegimePipeline::new(loader, store, settings);
    let report = pipeline.run(request).await?;

    report.log_summary();
    if json {
        println!("{}", serde_json::to_string_pretty(&report)?);
    }
    Ok(())
}

async fn fetch_prices(settings: &PipelineSettings, output: &Path) -> Result<()> {
    settings
        .validate()
        .map_err(|errors| anyhow!("Invalid settings: {}", errors.join(", ")))?;

    let request = &settings.request;
    let client = AlphaVantageClient::new(&settings.provider)?;
    let table = client.fetch(&request.symbol, request.start, request.end).await?;

    write_csv(output, &table.rows)?;
    info!("✓ Wrote {} rows for {} to {}", table.len(), table.symbol, output.display());
    Ok(())
}

async fn show_table(db_url: &str, table_name: &str, limit: usize) -> Result<()> {
    let db = Database::new(db_url).await?;
    let table = db.load(table_name).await?;

    println!(
        "{:<10}  {:>10}  {:>10}  {:>10}  {:>10}  {:<12}  {:>6}",
        "date", "adj_close", "return", "vol", "ma", "regime", "prob"
    );
    let skip = table.len().saturating_sub(limit);
    for row in table.rows.iter().skip(skip) {
        let fmt_opt = |v: Option<f64>, prec: usize| match v {
            Some(x) => format!("{:.*}", prec, x),
            None => "-".to_string(),
        };
        let (label, prob) = match &row.regime {
            Some(r) => (r.label.as_str(), format!("{:.3}", r.probability)),
            None => ("-", "-".to_string()),
        };
        println!(
            "{:<10}  {:>10.2}  {:>10}  {:>10}  {:>10}  {:<12}  {:>6}",
            row.timestamp().to_string(),
            row.features.price.adj_close,
            fmt_opt(row.features.log_return, 5),
            fmt_opt(row.features.volatility, 5),
            fmt_opt(row.features.moving_avg, 2),
            label,
            prob
        );
    }

    info!(
        "{}: {} rows, {} bear days, {} bull days",
        table_name,
        table.len(),
        table.count_label(types::RegimeLabel::BearMarket),
        table.count_label(types::RegimeLabel::BullMarket)
    );
    Ok(())
}
