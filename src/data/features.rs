use tracing::warn;

use crate::config::{FeatureSettings, ReturnKind};
use crate::error::{PipelineError, PipelineResult};
use crate::indicators::{sma, stddev, trailing_window};
use crate::types::{FeatureRow, FeatureTable, PriceTable};

/// Derive per-row return, rolling volatility and rolling moving average from
/// the adjusted close.
///
/// Features without enough history are `None`. A window longer than the table
/// leaves its column undefined on every row rather than failing.
pub fn add_features(table: PriceTable, settings: &FeatureSettings) -> PipelineResult<FeatureTable> {
    if settings.vol_window < 1 || settings.ma_window < 1 {
        return Err(PipelineError::invalid(format!(
            "window sizes must be >= 1 (vol_window={}, ma_window={})",
            settings.vol_window, settings.ma_window
        )));
    }
    if table.is_empty() {
        return Err(PipelineError::invalid("cannot add features to an empty table"));
    }
    if settings.vol_window >= table.len() {
        warn!(
            "vol_window {} leaves no row with a full return window ({} rows)",
            settings.vol_window,
            table.len()
        );
    }
    if settings.ma_window > table.len() {
        warn!(
            "ma_window {} exceeds the {} available rows",
            settings.ma_window,
            table.len()
        );
    }

    let closes = table.adj_closes();
    let returns = period_returns(&closes, settings.return_kind);
    let volatility = rolling_volatility(&returns, settings.vol_window);
    let moving_avg = rolling_mean(&closes, settings.ma_window);

    let rows = table
        .rows
        .into_iter()
        .enumerate()
        .map(|(i, price)| FeatureRow {
            price,
            log_return: returns[i],
            volatility: volatility[i],
            moving_avg: moving_avg[i],
        })
        .collect();

    Ok(FeatureTable {
        symbol: table.symbol,
        rows,
    })
}

/// Per-row return; index 0 and rows with an unusable previous close are `None`
pub fn period_returns(closes: &[f64], kind: ReturnKind) -> Vec<Option<f64>> {
    let mut returns = Vec::with_capacity(closes.len());
    if closes.is_empty() {
        return returns;
    }
    returns.push(None);
    for pair in closes.windows(2) {
        let (prev, curr) = (pair[0], pair[1]);
        let ret = match kind {
            ReturnKind::Simple if prev != 0.0 => Some(curr / prev - 1.0),
            ReturnKind::Log if prev > 0.0 && curr > 0.0 => Some((curr / prev).ln()),
            _ => None,
        };
        returns.push(ret.filter(|r| r.is_finite()));
    }
    returns
}

/// Sample standard deviation of the trailing `window` returns ending at each row
pub fn rolling_volatility(returns: &[Option<f64>], window: usize) -> Vec<Option<f64>> {
    (0..returns.len())
        .map(|i| trailing_window(returns, i, window).and_then(|w| stddev(&w, window)))
        .collect()
}

/// Mean of the trailing `window` values ending at each row
pub fn rolling_mean(values: &[f64], window: usize) -> Vec<Option<f64>> {
    (0..values.len())
        .map(|i| {
            if i + 1 < window {
                None
            } else {
                sma(&values[..=i], window)
            }
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::PriceRow;
    use approx::assert_relative_eq;
    use chrono::{Duration, NaiveDate};

    fn table(closes: &[f64]) -> PriceTable {
        let start = NaiveDate::from_ymd_opt(2024, 1, 1).unwrap();
        let rows = closes
            .iter()
            .enumerate()
            .map(|(i, &c)| PriceRow {
                timestamp: start + Duration::days(i as i64),
                open: c,
                high: c + 1.0,
                low: c - 1.0,
                close: c,
                adj_close: c,
                volume: 1_000.0,
            })
            .collect();
        PriceTable::new("TEST", rows)
    }

    fn zigzag(n: usize) -> Vec<f64> {
        (0..n)
            .map(|i| 100.0 + i as f64 * 0.5 + if i % 2 == 0 { 1.0 } else { -1.0 })
            .collect()
    }

    fn settings(vol_window: usize, ma_window: usize) -> FeatureSettings {
        FeatureSettings {
            vol_window,
            ma_window,
            ..FeatureSettings::default()
        }
    }

    #[test]
    fn test_simple_returns() {
        let features = add_features(table(&[100.0, 110.0, 99.0]), &settings(1, 1)).unwrap();
        assert_eq!(features.rows[0].log_return, None);
        assert_relative_eq!(features.rows[1].log_return.unwrap(), 0.1, epsilon = 1e-12);
        assert_relative_eq!(features.rows[2].log_return.unwrap(), -0.1, epsilon = 1e-12);
    }

    #[test]
    fn test_log_returns() {
        let returns = period_returns(&[100.0, 110.0], ReturnKind::Log);
        assert_relative_eq!(returns[1].unwrap(), (1.1_f64).ln(), epsilon = 1e-12);
        assert_eq!(period_returns(&[0.0, 1.0], ReturnKind::Log)[1], None);
        assert_eq!(period_returns(&[0.0, 1.0], ReturnKind::Simple)[1], None);
    }

    #[test]
    fn test_window_boundaries() {
        let (vol_window, ma_window) = (10, 50);
        let features = add_features(table(&zigzag(80)), &settings(vol_window, ma_window)).unwrap();

        for (i, row) in features.rows.iter().enumerate() {
            assert_eq!(row.volatility.is_some(), i >= vol_window, "volatility at {}", i);
            assert_eq!(row.moving_avg.is_some(), i + 1 >= ma_window, "moving_avg at {}", i);
        }
    }

    #[test]
    fn test_rolling_values() {
        let closes = zigzag(30);
        let features = add_features(table(&closes), &settings(10, 5)).unwrap();

        let expected_ma = closes[10..15].iter().sum::<f64>() / 5.0;
        assert_relative_eq!(features.rows[14].moving_avg.unwrap(), expected_ma, epsilon = 1e-12);

        let window: Vec<f64> = features.rows[11..=20]
            .iter()
            .map(|r| r.log_return.unwrap())
            .collect();
        let mean = window.iter().sum::<f64>() / 10.0;
        let var = window.iter().map(|r| (r - mean).powi(2)).sum::<f64>() / 9.0;
        assert_relative_eq!(features.rows[20].volatility.unwrap(), var.sqrt(), epsilon = 1e-12);
    }

    #[test]
    fn test_short_table_leaves_volatility_undefined() {
        let features = add_features(table(&zigzag(5)), &settings(10, 50)).unwrap();
        assert_eq!(features.len(), 5);
        assert!(features.rows.iter().all(|r| r.volatility.is_none()));
        assert!(features.rows.iter().all(|r| r.moving_avg.is_none()));
    }

    #[test]
    fn test_undefined_return_blocks_volatility() {
        let mut closes = zigzag(20);
        closes[4] = 0.0;
        let features = add_features(table(&closes), &settings(3, 1)).unwrap();
        // return at 5 divides by zero, so windows covering it stay undefined
        assert_eq!(features.rows[5].log_return, None);
        assert!(features.rows[5..8].iter().all(|r| r.volatility.is_none()));
        assert!(features.rows[8].volatility.is_some());
    }

    #[test]
    fn test_unit_vol_window_is_undefined() {
        let features = add_features(table(&zigzag(10)), &settings(1, 1)).unwrap();
        assert!(features.rows.iter().all(|r| r.volatility.is_none()));
        assert!(features.rows.iter().all(|r| r.moving_avg.is_some()));
    }

    #[test]
    fn test_invalid_windows() {
        assert!(matches!(
            add_features(table(&zigzag(10)), &settings(0, 5)),
            Err(PipelineError::InvalidInput(_))
        ));
        assert!(matches!(
            add_features(table(&zigzag(10)), &settings(5, 0)),
            Err(PipelineError::InvalidInput(_))
        ));
        assert!(matches!(
            add_features(table(&[]), &settings(5, 5)),
            Err(PipelineError::InvalidInput(_))
        ));
    }
}
