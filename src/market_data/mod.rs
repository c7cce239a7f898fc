pub mod alpha_vantage;
pub mod csv_file;

pub use alpha_vantage::*;
pub use csv_file::*;

use async_trait::async_trait;
use chrono::NaiveDate;

use crate::error::PipelineResult;
use crate::types::{RawPriceRow, RawPriceTable};

/// Source of daily price history
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait PriceLoader: Send + Sync {
    /// Daily rows for `symbol` within `[start, end]`, oldest first
    async fn fetch(&self, symbol: &str, start: NaiveDate, end: NaiveDate) -> PipelineResult<RawPriceTable>;
}

/// Sort ascending and keep rows inside `[start, end]`
pub(crate) fn within_range(mut rows: Vec<RawPriceRow>, start: NaiveDate, end: NaiveDate) -> Vec<RawPriceRow> {
    rows.retain(|r| r.timestamp >= start && r.timestamp <= end);
    rows.sort_by_key(|r| r.timestamp);
    rows
}
