use askama::Template;
use chrono::NaiveDate;
use std::path::Path;
use tracing::info;

use crate::error::{PipelineError, PipelineResult};
use crate::types::{LabeledRow, RegimeAssignment, RegimeLabel, RegimeTable};

const WIDTH: f64 = 960.0;
const HEIGHT: f64 = 480.0;
const MARGIN_LEFT: f64 = 70.0;
const MARGIN_RIGHT: f64 = 20.0;
const MARGIN_TOP: f64 = 50.0;
const MARGIN_BOTTOM: f64 = 40.0;
const Y_TICKS: usize = 5;
const X_TICKS: usize = 6;

struct ChartPoint {
    x: String,
    y: String,
    color: &'static str,
    date: NaiveDate,
    label: &'static str,
    value: String,
}

struct AxisTick {
    position: String,
    text: String,
}

struct LegendEntry {
    x: String,
    text_x: String,
    color: &'static str,
    label: &'static str,
    count: usize,
}

#[derive(Template)]
#[template(path = "regime_chart.html")]
struct RegimeChartTemplate<'a> {
    title: &'a str,
    symbol: &'a str,
    first_date: NaiveDate,
    last_date: NaiveDate,
    point_count: usize,
    width: f64,
    height: f64,
    plot_left: f64,
    plot_right: f64,
    plot_top: f64,
    plot_bottom: f64,
    y_label_x: f64,
    x_label_y: f64,
    header_y: f64,
    marker_y: f64,
    price_path: String,
    points: Vec<ChartPoint>,
    y_ticks: Vec<AxisTick>,
    x_ticks: Vec<AxisTick>,
    legend: Vec<LegendEntry>,
}

/// Maps dates and prices into the plot area
struct Scale {
    first: NaiveDate,
    days: f64,
    low: f64,
    high: f64,
}

impl Scale {
    fn new(first: NaiveDate, last: NaiveDate, low: f64, high: f64) -> Self {
        // flat series still get a visible band
        let (low, high) = if high > low { (low, high) } else { (low - 1.0, high + 1.0) };
        Self {
            first,
            days: ((last - first).num_days() as f64).max(1.0),
            low,
            high,
        }
    }

    fn x(&self, date: NaiveDate) -> f64 {
        let t = (date - self.first).num_days() as f64 / self.days;
        MARGIN_LEFT + t * (WIDTH - MARGIN_LEFT - MARGIN_RIGHT)
    }

    fn y(&self, value: f64) -> f64 {
        let t = (value - self.low) / (self.high - self.low);
        HEIGHT - MARGIN_BOTTOM - t * (HEIGHT - MARGIN_TOP - MARGIN_BOTTOM)
    }
}

/// Render adjusted close over time, one point per labeled day, colored by
/// regime.
pub fn render_regime_chart(table: &RegimeTable, title: &str) -> PipelineResult<String> {
    let labeled: Vec<(&LabeledRow, &RegimeAssignment)> = table
        .rows
        .iter()
        .filter_map(|row| row.regime.as_ref().map(|regime| (row, regime)))
        .collect();

    let (first, last) = match (labeled.first(), labeled.last()) {
        (Some((first, _)), Some((last, _))) => (first.timestamp(), last.timestamp()),
        _ => return Err(PipelineError::invalid("no labeled rows to chart")),
    };

    let closes = labeled.iter().map(|(row, _)| row.features.price.adj_close);
    let low = closes.clone().fold(f64::INFINITY, f64::min);
    let high = closes.fold(f64::NEG_INFINITY, f64::max);
    let scale = Scale::new(first, last, low, high);

    let points: Vec<ChartPoint> = labeled
        .iter()
        .map(|(row, regime)| {
            let close = row.features.price.adj_close;
            ChartPoint {
                x: format!("{:.1}", scale.x(row.timestamp())),
                y: format!("{:.1}", scale.y(close)),
                color: regime.label.color(),
                date: row.timestamp(),
                label: regime.label.as_str(),
                value: format!("{:.2}", close),
            }
        })
        .collect();

    let price_path = points
        .iter()
        .map(|p| format!("{},{}", p.x, p.y))
        .collect::<Vec<_>>()
        .join(" ");

    let y_ticks = (0..=Y_TICKS)
        .map(|i| {
            let value = scale.low + (scale.high - scale.low) * i as f64 / Y_TICKS as f64;
            AxisTick {
                position: format!("{:.1}", scale.y(value)),
                text: format!("{:.2}", value),
            }
        })
        .collect();

    let x_ticks = (0..=X_TICKS)
        .map(|i| {
            let offset = (scale.days * i as f64 / X_TICKS as f64).round() as i64;
            let date = first + chrono::Duration::days(offset);
            AxisTick {
                position: format!("{:.1}", scale.x(date)),
                text: date.format("%Y-%m-%d").to_string(),
            }
        })
        .collect();

    let legend = [RegimeLabel::BearMarket, RegimeLabel::BullMarket]
        .iter()
        .enumerate()
        .map(|(i, label)| {
            let x = WIDTH - MARGIN_RIGHT - 260.0 + i as f64 * 130.0;
            LegendEntry {
                x: format!("{:.1}", x),
                text_x: format!("{:.1}", x + 10.0),
                color: label.color(),
                label: label.as_str(),
                count: table.count_label(*label),
            }
        })
        .collect();

    let template = RegimeChartTemplate {
        title,
        symbol: &table.symbol,
        first_date: first,
        last_date: last,
        point_count: points.len(),
        width: WIDTH,
        height: HEIGHT,
        plot_left: MARGIN_LEFT,
        plot_right: WIDTH - MARGIN_RIGHT,
        plot_top: MARGIN_TOP,
        plot_bottom: HEIGHT - MARGIN_BOTTOM,
        y_label_x: MARGIN_LEFT - 6.0,
        x_label_y: HEIGHT - MARGIN_BOTTOM + 18.0,
        header_y: MARGIN_TOP - 12.0,
        marker_y: MARGIN_TOP - 16.0,
        price_path,
        points,
        y_ticks,
        x_ticks,
        legend,
    };

    template
        .render()
        .map_err(|e| PipelineError::Render(e.to_string()))
}

pub fn write_regime_chart(table: &RegimeTable, title: &str, path: &Path) -> PipelineResult<()> {
    let html = render_regime_chart(table, title)?;
    std::fs::write(path, html)
        .map_err(|e| PipelineError::Render(format!("cannot write {}: {}", path.display(), e)))?;
    info!("Wrote regime chart to {}", path.display());
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{FeatureRow, PriceRow};

    fn row(day: u32, close: f64, label: Option<RegimeLabel>) -> LabeledRow {
        let timestamp = NaiveDate::from_ymd_opt(2023, 5, day).unwrap();
        LabeledRow {
            features: FeatureRow {
                price: PriceRow {
                    timestamp,
                    open: close,
                    high: close,
                    low: close,
                    close,
                    adj_close: close,
                    volume: 10.0,
                },
                log_return: label.map(|_| 0.0),
                volatility: None,
                moving_avg: None,
            },
            regime: label.map(|label| RegimeAssignment {
                timestamp,
                state: 0,
                label,
                probability: 1.0,
            }),
        }
    }

    fn sample_table() -> RegimeTable {
        RegimeTable {
            symbol: "SPY".to_string(),
            rows: vec![
                row(1, 100.0, None),
                row(2, 101.0, Some(RegimeLabel::BullMarket)),
                row(3, 99.0, Some(RegimeLabel::BearMarket)),
                row(4, 98.0, Some(RegimeLabel::BearMarket)),
                row(5, 102.0, Some(RegimeLabel::BullMarket)),
                row(8, 103.0, Some(RegimeLabel::BullMarket)),
            ],
        }
    }

    #[test]
    fn test_one_point_per_labeled_row() {
        let html = render_regime_chart(&sample_table(), "SPY regimes").unwrap();

        assert_eq!(html.matches("class=\"regime-point\"").count(), 5);
        assert_eq!(html.matches("r=\"2\" fill=\"red\"").count(), 2);
        assert_eq!(html.matches("r=\"2\" fill=\"green\"").count(), 3);
        assert!(html.contains("<title>SPY regimes</title>"));
        assert!(html.contains("Bear Market (2)"));
        assert!(html.contains("Bull Market (3)"));
    }

    #[test]
    fn test_title_is_escaped() {
        let html = render_regime_chart(&sample_table(), "<b>SPY</b>").unwrap();
        assert!(!html.contains("<b>SPY</b>"));
    }

    #[test]
    fn test_unlabeled_table_is_rejected() {
        let table = RegimeTable {
            symbol: "SPY".to_string(),
            rows: vec![row(1, 100.0, None)],
        };
        assert!(matches!(
            render_regime_chart(&table, "x"),
            Err(PipelineError::InvalidInput(_))
        ));
        assert!(matches!(
            render_regime_chart(&RegimeTable::default(), "x"),
            Err(PipelineError::InvalidInput(_))
        ));
    }

    #[test]
    fn test_flat_series_renders() {
        let table = RegimeTable {
            symbol: "FLAT".to_string(),
            rows: vec![row(2, 50.0, Some(RegimeLabel::BullMarket))],
        };
        let html = render_regime_chart(&table, "flat").unwrap();
        assert_eq!(html.matches("class=\"regime-point\"").count(), 1);
        assert!(!html.contains("NaN"));
    }
}
