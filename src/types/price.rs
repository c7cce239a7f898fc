use chrono::NaiveDate;
use serde::{Deserialize, Serialize};

/// Daily bar as delivered by a loader; any column may be missing
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RawPriceRow {
    pub timestamp: NaiveDate,
    pub open: Option<f64>,
    pub high: Option<f64>,
    pub low: Option<f64>,
    pub close: Option<f64>,
    pub adj_close: Option<f64>,
    pub volume: Option<f64>,
}

impl RawPriceRow {
    /// Returns the row with every column defined, or `None` if any value is
    /// missing or non-finite.
    pub fn complete(&self) -> Option<PriceRow> {
        let finite = |v: Option<f64>| v.filter(|x| x.is_finite());
        Some(PriceRow {
            timestamp: self.timestamp,
            open: finite(self.open)?,
            high: finite(self.high)?,
            low: finite(self.low)?,
            close: finite(self.close)?,
            adj_close: finite(self.adj_close)?,
            volume: finite(self.volume)?,
        })
    }
}

impl From<PriceRow> for RawPriceRow {
    fn from(row: PriceRow) -> Self {
        Self {
            timestamp: row.timestamp,
            open: Some(row.open),
            high: Some(row.high),
            low: Some(row.low),
            close: Some(row.close),
            adj_close: Some(row.adj_close),
            volume: Some(row.volume),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RawPriceTable {
    pub symbol: String,
    pub rows: Vec<RawPriceRow>,
}

impl RawPriceTable {
    pub fn new(symbol: impl Into<String>, rows: Vec<RawPriceRow>) -> Self {
        Self {
            symbol: symbol.into(),
            rows,
        }
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }
}

/// Daily bar with every numeric column defined
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct PriceRow {
    pub timestamp: NaiveDate,
    pub open: f64,
    pub high: f64,
    pub low: f64,
    pub close: f64,
    pub adj_close: f64,
    pub volume: f64,
}

impl PriceRow {
    pub const COLUMNS: [&'static str; 6] = ["open", "high", "low", "close", "adj_close", "volume"];

    /// Numeric columns in `COLUMNS` order
    pub fn values(&self) -> [f64; 6] {
        [
            self.open,
            self.high,
            self.low,
            self.close,
            self.adj_close,
            self.volume,
        ]
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct PriceTable {
    pub symbol: String,
    pub rows: Vec<PriceRow>,
}

impl PriceTable {
    pub fn new(symbol: impl Into<String>, rows: Vec<PriceRow>) -> Self {
        Self {
            symbol: symbol.into(),
            rows,
        }
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    pub fn adj_closes(&self) -> Vec<f64> {
        self.rows.iter().map(|r| r.adj_close).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn raw(adj_close: Option<f64>) -> RawPriceRow {
        RawPriceRow {
            timestamp: NaiveDate::from_ymd_opt(2024, 1, 2).unwrap(),
            open: Some(10.0),
            high: Some(11.0),
            low: Some(9.5),
            close: Some(10.5),
            adj_close,
            volume: Some(1_000.0),
        }
    }

    #[test]
    fn test_complete_row() {
        let row = raw(Some(10.4)).complete().unwrap();
        assert_eq!(row.values(), [10.0, 11.0, 9.5, 10.5, 10.4, 1_000.0]);
    }

    #[test]
    fn test_missing_or_non_finite_is_incomplete() {
        assert!(raw(None).complete().is_none());
        assert!(raw(Some(f64::NAN)).complete().is_none());
        assert!(raw(Some(f64::INFINITY)).complete().is_none());
    }
}
