use tracing::debug;

use crate::error::{PipelineError, PipelineResult};
use crate::indicators::mean_and_stddev;
use crate::types::{PriceRow, PriceTable, RawPriceTable};

/// Rows whose z-score reaches this on any column are dropped
pub const OUTLIER_Z_SCORE: f64 = 3.0;

/// Drop incomplete rows, then drop rows that are 3-sigma outliers on any
/// numeric column. Row order is preserved.
pub fn clean(table: RawPriceTable) -> PipelineResult<PriceTable> {
    if table.len() < 2 {
        return Err(PipelineError::invalid(format!(
            "need at least 2 rows to clean {}, got {}",
            table.symbol,
            table.len()
        )));
    }

    if let Some(pair) = table
        .rows
        .windows(2)
        .find(|pair| pair[1].timestamp <= pair[0].timestamp)
    {
        return Err(PipelineError::invalid(format!(
            "timestamps must be strictly increasing ({} followed by {})",
            pair[0].timestamp, pair[1].timestamp
        )));
    }

    let total = table.len();
    let complete: Vec<PriceRow> = table.rows.iter().filter_map(|r| r.complete()).collect();
    debug!("Dropped {} rows with missing values", total - complete.len());

    match complete.len() {
        0 => {
            return Err(PipelineError::EmptyResult(format!(
                "every row of {} has a missing value",
                table.symbol
            )))
        }
        1 => {
            return Err(PipelineError::invalid(
                "only one complete row; standard deviation is undefined",
            ))
        }
        _ => {}
    }

    let stats = column_stats(&complete);
    for (name, (mean, std)) in PriceRow::COLUMNS.iter().zip(stats.iter()) {
        debug!("{}: mean {:.4}, std {:.4}", name, mean, std);
    }
    let kept: Vec<PriceRow> = complete
        .iter()
        .filter(|row| !is_outlier(row, &stats))
        .copied()
        .collect();
    debug!("Dropped {} outlier rows", complete.len() - kept.len());

    if kept.is_empty() {
        return Err(PipelineError::EmptyResult(format!(
            "outlier filtering removed every row of {}",
            table.symbol
        )));
    }

    Ok(PriceTable::new(table.symbol, kept))
}

/// Mean and sample standard deviation per column, in `PriceRow::COLUMNS` order
fn column_stats(rows: &[PriceRow]) -> [(f64, f64); 6] {
    let mut stats = [(0.0, 0.0); 6];
    for (col, stat) in stats.iter_mut().enumerate() {
        let values: Vec<f64> = rows.iter().map(|r| r.values()[col]).collect();
        // rows.len() >= 2 is checked by the caller
        *stat = mean_and_stddev(&values).unwrap_or((0.0, 0.0));
    }
    stats
}

fn is_outlier(row: &PriceRow, stats: &[(f64, f64); 6]) -> bool {
    row.values()
        .iter()
        .zip(stats.iter())
        .any(|(value, &(mean, std))| std > 0.0 && (value - mean).abs() / std >= OUTLIER_Z_SCORE)
}
