use async_trait::async_trait;
use chrono::NaiveDate;
use sqlx::sqlite::{SqliteConnectOptions, SqlitePool, SqlitePoolOptions, SqliteRow};
use sqlx::Row;
use std::str::FromStr;
use tracing::{debug, info};

use crate::error::{PipelineError, PipelineResult};
use crate::types::{FeatureRow, LabeledRow, PriceRow, RegimeAssignment, RegimeLabel, RegimeTable};

/// Letters, digits and underscores, not starting with a digit.
///
/// Table names are interpolated into DDL, so nothing else is accepted.
pub fn is_valid_table_name(name: &str) -> bool {
    let mut chars = name.chars();
    match chars.next() {
        Some(c) if c.is_ascii_alphabetic() || c == '_' => {}
        _ => return false,
    }
    chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
}

fn checked_table_name(name: &str) -> PipelineResult<&str> {
    if is_valid_table_name(name) {
        Ok(name)
    } else {
        Err(PipelineError::invalid(format!("'{}' is not a valid table name", name)))
    }
}

/// Destination for labeled regime tables
#[async_trait]
pub trait TableStore: Send + Sync {
    /// Replace the contents of `table_name` with `table`. Either every row is
    /// written or the previous contents are left untouched.
    async fn store(&self, table: &RegimeTable, table_name: &str) -> PipelineResult<()>;
}

pub struct Database {
    pool: SqlitePool,
}

impl Database {
    /// Open (creating if needed) the SQLite database at `url`
    pub async fn new(url: &str) -> PipelineResult<Self> {
        info!("Opening SQLite database at: {}", url);

        let options = SqliteConnectOptions::from_str(url)?.create_if_missing(true);

        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .connect_with(options)
            .await?;

        Ok(Self { pool })
    }

    /// Private in-memory database. A single connection keeps it alive.
    #[cfg(test)]
    pub async fn in_memory() -> PipelineResult<Self> {
        let options = SqliteConnectOptions::from_str("sqlite::memory:")?;

        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .idle_timeout(None)
            .max_lifetime(None)
            .connect_with(options)
            .await?;

        Ok(Self { pool })
    }

    /// Read a table written by `store`, oldest row first
    pub async fn load(&self, table_name: &str) -> PipelineResult<RegimeTable> {
        let table_name = checked_table_name(table_name)?;

        let rows = sqlx::query(&format!(
            r#"
            SELECT timestamp, open, high, low, close, adj_close, volume,
                   log_return, volatility, moving_avg,
                   regime, regime_label, regime_probability
            FROM {}
            ORDER BY timestamp ASC
            "#,
            table_name
        ))
        .fetch_all(&self.pool)
        .await?;

        let rows = rows
            .iter()
            .map(labeled_row_from_sql)
            .collect::<PipelineResult<Vec<_>>>()?;

        debug!("Loaded {} rows from {}", rows.len(), table_name);
        Ok(RegimeTable {
            symbol: table_name.to_string(),
            rows,
        })
    }

    /// Number of rows currently in `table_name`
    #[cfg(test)]
    pub async fn row_count(&self, table_name: &str) -> PipelineResult<i64> {
        let table_name = checked_table_name(table_name)?;
        let row = sqlx::query(&format!("SELECT COUNT(*) AS n FROM {}", table_name))
            .fetch_one(&self.pool)
            .await?;
        Ok(row.get("n"))
    }
}

#[async_trait]
impl TableStore for Database {
    async fn store(&self, table: &RegimeTable, table_name: &str) -> PipelineResult<()> {
        let table_name = checked_table_name(table_name)?;
        let mut tx = self.pool.begin().await?;

        sqlx::query(&format!("DROP TABLE IF EXISTS {}", table_name))
            .execute(&mut *tx)
            .await?;

        sqlx::query(&format!(
            r#"
            CREATE TABLE {} (
                timestamp TEXT PRIMARY KEY,
                open REAL NOT NULL,
                high REAL NOT NULL,
                low REAL NOT NULL,
                close REAL NOT NULL,
                adj_close REAL NOT NULL,
                volume REAL NOT NULL,
                log_return REAL,
                volatility REAL,
                moving_avg REAL,
                regime INTEGER,
                regime_label TEXT,
                regime_probability REAL
            )
            "#,
            table_name
        ))
        .execute(&mut *tx)
        .await?;

        sqlx::query(&format!(
            "CREATE INDEX IF NOT EXISTS idx_{0}_timestamp ON {0}(timestamp)",
            table_name
        ))
        .execute(&mut *tx)
        .await?;

        let insert = format!(
            r#"
            INSERT INTO {} (
                timestamp, open, high, low, close, adj_close, volume,
                log_return, volatility, moving_avg,
                regime, regime_label, regime_probability
            ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
            table_name
        );

        for row in &table.rows {
            let price = &row.features.price;
            sqlx::query(&insert)
                .bind(price.timestamp.format("%Y-%m-%d").to_string())
                .bind(price.open)
                .bind(price.high)
                .bind(price.low)
                .bind(price.close)
                .bind(price.adj_close)
                .bind(price.volume)
                .bind(row.features.log_return)
                .bind(row.features.volatility)
                .bind(row.features.moving_avg)
                .bind(row.regime.map(|r| r.state as i64))
                .bind(row.regime.map(|r| r.label.as_str()))
                .bind(row.regime.map(|r| r.probability))
                .execute(&mut *tx)
                .await?;
        }

        tx.commit().await?;

        info!("Stored {} rows in table {}", table.len(), table_name);
        Ok(())
    }
}

fn labeled_row_from_sql(row: &SqliteRow) -> PipelineResult<LabeledRow> {
    let raw_date: String = row.try_get("timestamp")?;
    let timestamp = NaiveDate::parse_from_str(&raw_date, "%Y-%m-%d")
        .map_err(|e| PipelineError::Persistence(format!("bad timestamp '{}': {}", raw_date, e)))?;

    let price = PriceRow {
        timestamp,
        open: row.try_get("open")?,
        high: row.try_get("high")?,
        low: row.try_get("low")?,
        close: row.try_get("close")?,
        adj_close: row.try_get("adj_close")?,
        volume: row.try_get("volume")?,
    };

    let state: Option<i64> = row.try_get("regime")?;
    let label: Option<String> = row.try_get("regime_label")?;
    let probability: Option<f64> = row.try_get("regime_probability")?;

    let regime = match (state, label, probability) {
        (Some(state), Some(label), Some(probability)) => Some(RegimeAssignment {
            timestamp,
            state: state as usize,
            label: RegimeLabel::from_str(&label).map_err(|e| PipelineError::Persistence(e.to_string()))?,
            probability,
        }),
        _ => None,
    };

    Ok(LabeledRow {
        features: FeatureRow {
            price,
            log_return: row.try_get("log_return")?,
            volatility: row.try_get("volatility")?,
            moving_avg: row.try_get("moving_avg")?,
        },
        regime,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn labeled(day: u32, close: f64, regime: Option<RegimeLabel>) -> LabeledRow {
        let timestamp = NaiveDate::from_ymd_opt(2024, 3, day).unwrap();
        LabeledRow {
            features: FeatureRow {
                price: PriceRow {
                    timestamp,
                    open: close,
                    high: close + 1.0,
                    low: close - 1.0,
                    close,
                    adj_close: close,
                    volume: 1_000.0,
                },
                log_return: regime.map(|_| 0.01),
                volatility: None,
                moving_avg: Some(close),
            },
            regime: regime.map(|label| RegimeAssignment {
                timestamp,
                state: if label == RegimeLabel::BearMarket { 0 } else { 1 },
                label,
                probability: 0.9,
            }),
        }
    }

    fn table(rows: Vec<LabeledRow>) -> RegimeTable {
        RegimeTable {
            symbol: "TEST".to_string(),
            rows,
        }
    }

    #[test]
    fn test_table_names() {
        assert!(is_valid_table_name("market_data"));
        assert!(is_valid_table_name("_spy2024"));
        assert!(!is_valid_table_name(""));
        assert!(!is_valid_table_name("2024_spy"));
        assert!(!is_valid_table_name("market data"));
        assert!(!is_valid_table_name("x; DROP TABLE y"));
    }

    #[tokio::test]
    async fn test_store_and_load_round_trip() {
        let db = Database::in_memory().await.unwrap();
        let written = table(vec![
            labeled(1, 100.0, None),
            labeled(4, 101.0, Some(RegimeLabel::BullMarket)),
            labeled(5, 99.0, Some(RegimeLabel::BearMarket)),
        ]);

        db.store(&written, "market_data").await.unwrap();
        let loaded = db.load("market_data").await.unwrap();

        assert_eq!(loaded.rows, written.rows);
        assert_eq!(loaded.rows[0].regime, None);
        assert_eq!(loaded.rows[0].features.log_return, None);
        assert_eq!(loaded.count_label(RegimeLabel::BearMarket), 1);
    }

    #[tokio::test]
    async fn test_store_replaces_previous_contents() {
        let db = Database::in_memory().await.unwrap();

        db.store(
            &table(vec![labeled(1, 100.0, None), labeled(4, 101.0, None), labeled(5, 102.0, None)]),
            "market_data",
        )
        .await
        .unwrap();
        db.store(&table(vec![labeled(8, 90.0, Some(RegimeLabel::BearMarket))]), "market_data")
            .await
            .unwrap();

        assert_eq!(db.row_count("market_data").await.unwrap(), 1);
        let loaded = db.load("market_data").await.unwrap();
        assert_eq!(loaded.rows[0].features.price.close, 90.0);
    }

    #[tokio::test]
    async fn test_invalid_table_name_is_rejected() {
        let db = Database::in_memory().await.unwrap();
        let result = db.store(&table(vec![labeled(1, 100.0, None)]), "bad name").await;
        assert!(matches!(result, Err(PipelineError::InvalidInput(_))));
        assert!(matches!(db.load("1abc").await, Err(PipelineError::InvalidInput(_))));
    }

    #[tokio::test]
    async fn test_missing_table_is_persistence_error() {
        let db = Database::in_memory().await.unwrap();
        assert!(matches!(db.load("market_data").await, Err(PipelineError::Persistence(_))));
    }
}
