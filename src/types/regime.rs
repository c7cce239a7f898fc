use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use super::PriceRow;

/// Human-readable market regime, derived from the fitted state means
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum RegimeLabel {
    #[serde(rename = "Bear Market")]
    BearMarket,
    #[serde(rename = "Bull Market")]
    BullMarket,
}

impl RegimeLabel {
    pub fn as_str(&self) -> &'static str {
        match self {
            RegimeLabel::BearMarket => "Bear Market",
            RegimeLabel::BullMarket => "Bull Market",
        }
    }

    /// Chart color for the regime
    pub fn color(&self) -> &'static str {
        match self {
            RegimeLabel::BearMarket => "red",
            RegimeLabel::BullMarket => "green",
        }
    }
}

impl fmt::Display for RegimeLabel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for RegimeLabel {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "Bear Market" => Ok(RegimeLabel::BearMarket),
            "Bull Market" => Ok(RegimeLabel::BullMarket),
            _ => Err(anyhow::anyhow!("Unknown regime label: {}", s)),
        }
    }
}

/// Decoded regime for one trading day
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct RegimeAssignment {
    pub timestamp: NaiveDate,
    /// Internal HMM state index; its meaning changes between fits
    pub state: usize,
    pub label: RegimeLabel,
    /// Posterior probability of `state` at this day
    pub probability: f64,
}

/// Price row with derived features. `None` marks insufficient history.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct FeatureRow {
    pub price: PriceRow,
    pub log_return: Option<f64>,
    pub volatility: Option<f64>,
    pub moving_avg: Option<f64>,
}

impl FeatureRow {
    pub fn timestamp(&self) -> NaiveDate {
        self.price.timestamp
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct FeatureTable {
    pub symbol: String,
    pub rows: Vec<FeatureRow>,
}

impl FeatureTable {
    pub fn len(&self) -> usize {
        self.rows.len()
    }

    /// Timestamps and returns of the rows that have a defined return
    pub fn defined_returns(&self) -> (Vec<NaiveDate>, Vec<f64>) {
        self.rows
            .iter()
            .filter_map(|r| r.log_return.map(|ret| (r.timestamp(), ret)))
            .unzip()
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct LabeledRow {
    pub features: FeatureRow,
    pub regime: Option<RegimeAssignment>,
}

impl LabeledRow {
    pub fn timestamp(&self) -> NaiveDate {
        self.features.timestamp()
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct RegimeTable {
    pub symbol: String,
    pub rows: Vec<LabeledRow>,
}

impl RegimeTable {
    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn assignments(&self) -> impl Iterator<Item = &RegimeAssignment> {
        self.rows.iter().filter_map(|r| r.regime.as_ref())
    }

    pub fn count_label(&self, label: RegimeLabel) -> usize {
        self.assignments().filter(|a| a.label == label).count()
    }
}
