use async_trait::async_trait;
use chrono::NaiveDate;
use std::path::{Path, PathBuf};
use tracing::info;

use super::{within_range, PriceLoader};
use crate::error::{PipelineError, PipelineResult};
use crate::types::{RawPriceRow, RawPriceTable};

/// Loads daily rows from a CSV file with the header
/// `timestamp,open,high,low,close,adj_close,volume`. Empty cells are missing.
#[derive(Debug, Clone)]
pub struct CsvPriceLoader {
    path: PathBuf,
}

impl CsvPriceLoader {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    fn read_rows(&self) -> PipelineResult<Vec<RawPriceRow>> {
        let mut reader = csv::Reader::from_path(&self.path).map_err(|e| {
            PipelineError::DataUnavailable(format!("cannot open {}: {}", self.path.display(), e))
        })?;

        reader
            .deserialize::<RawPriceRow>()
            .enumerate()
            .map(|(i, record)| {
                record.map_err(|e| {
                    PipelineError::DataUnavailable(format!(
                        "{} record {}: {}",
                        self.path.display(),
                        i + 1,
                        e
                    ))
                })
            })
            .collect()
    }
}

#[async_trait]
impl PriceLoader for CsvPriceLoader {
    async fn fetch(&self, symbol: &str, start: NaiveDate, end: NaiveDate) -> PipelineResult<RawPriceTable> {
        let loader = self.clone();
        let rows = tokio::task::spawn_blocking(move || loader.read_rows())
            .await
            .map_err(|e| PipelineError::DataUnavailable(format!("CSV reader task failed: {}", e)))??;

        let rows = within_range(rows, start, end);
        if rows.is_empty() {
            return Err(PipelineError::DataUnavailable(format!(
                "{} has no rows between {} and {}",
                self.path.display(),
                start,
                end
            )));
        }

        info!("Loaded {} daily rows for {} from {}", rows.len(), symbol, self.path.display());
        Ok(RawPriceTable::new(symbol, rows))
    }
}

/// Write rows in the format `CsvPriceLoader` reads
pub fn write_csv(path: &Path, rows: &[RawPriceRow]) -> anyhow::Result<()> {
    let mut writer = csv::Writer::from_path(path)?;
    for row in rows {
        writer.serialize(row)?;
    }
    writer.flush()?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn temp_csv(name: &str, contents: &str) -> PathBuf {
        let path = std::env::temp_dir().join(format!("regime_{}_{}.csv", name, std::process::id()));
        std::fs::write(&path, contents).unwrap();
        path
    }

    fn date(d: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(2024, 1, d).unwrap()
    }

    #[tokio::test]
    async fn test_reads_and_filters_rows() {
        let path = temp_csv(
            "read",
            "timestamp,open,high,low,close,adj_close,volume\n\
             2024-01-03,2,3,1,2.5,2.4,100\n\
             2024-01-02,1,2,0.5,1.5,,90\n\
             2024-01-10,3,4,2,3.5,3.4,120\n",
        );

        let table = CsvPriceLoader::new(&path)
            .fetch("TEST", date(1), date(5))
            .await
            .unwrap();

        assert_eq!(table.symbol, "TEST");
        assert_eq!(table.rows.len(), 2);
        assert_eq!(table.rows[0].timestamp, date(2));
        assert_eq!(table.rows[0].adj_close, None);
        assert_eq!(table.rows[1].adj_close, Some(2.4));

        std::fs::remove_file(path).ok();
    }

    #[tokio::test]
    async fn test_missing_file_is_unavailable() {
        let result = CsvPriceLoader::new("/nonexistent/prices.csv")
            .fetch("TEST", date(1), date(5))
            .await;
        assert!(matches!(result, Err(PipelineError::DataUnavailable(_))));
    }

    #[tokio::test]
    async fn test_written_csv_reads_back() {
        let path = std::env::temp_dir().join(format!("regime_write_{}.csv", std::process::id()));
        let rows = vec![RawPriceRow {
            timestamp: date(4),
            open: Some(1.0),
            high: Some(2.0),
            low: None,
            close: Some(1.5),
            adj_close: Some(1.4),
            volume: Some(10.0),
        }];
        write_csv(&path, &rows).unwrap();

        let table = CsvPriceLoader::new(&path)
            .fetch("TEST", date(1), date(31))
            .await
            .unwrap();
        assert_eq!(table.rows, rows);

        std::fs::remove_file(path).ok();
    }
}
