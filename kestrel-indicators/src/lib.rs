//! Technical indicator math over candle close windows.
//!
//! All indicators consume a slice of closes ordered oldest to newest and
//! produce either the latest value or the last two values (for crossing
//! detection). Periods are validated up front; windows shorter than an
//! indicator's minimum are reported, never silently padded.

use rust_decimal::{Decimal, MathematicalOps};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use kestrel_core::rounding::safe_div;

/// Errors produced during indicator evaluation.
#[derive(Debug, Error, PartialEq)]
pub enum IndicatorError {
    #[error("{indicator} needs at least {needed} candles, got {got}")]
    NotEnoughData {
        indicator: &'static str,
        needed: usize,
        got: usize,
    },
    #[error("invalid {parameter} for {indicator}: {reason}")]
    InvalidParameter {
        indicator: &'static str,
        parameter: &'static str,
        reason: String,
    },
}

impl IndicatorError {
    fn invalid_period(indicator: &'static str, reason: impl Into<String>) -> Self {
        Self::InvalidParameter {
            indicator,
            parameter: "period",
            reason: reason.into(),
        }
    }
}

/// Closed set of supported indicators with their parameters.
#[derive(Clone, Copy, Debug, Deserialize, PartialEq, Serialize)]
#[serde(rename_all = "snake_case", tag = "kind")]
pub enum IndicatorSpec {
    Rsi { period: usize },
    Sma { period: usize },
    Ema { period: usize },
    Macd { fast: usize, slow: usize, signal: usize },
    Bollinger { period: usize, std_dev: Decimal },
}

impl IndicatorSpec {
    /// Conventional default parameterizations.
    #[must_use]
    pub fn default_rsi() -> Self {
        Self::Rsi { period: 14 }
    }

    #[must_use]
    pub fn default_sma() -> Self {
        Self::Sma { period: 20 }
    }

    #[must_use]
    pub fn default_ema() -> Self {
        Self::Ema { period: 20 }
    }

    #[must_use]
    pub fn default_macd() -> Self {
        Self::Macd {
            fast: 12,
            slow: 26,
            signal: 9,
        }
    }

    #[must_use]
    pub fn default_bollinger() -> Self {
        Self::Bollinger {
            period: 20,
            std_dev: Decimal::TWO,
        }
    }

    /// Short name used in errors and status messages.
    #[must_use]
    pub fn name(&self) -> &'static str {
        match self {
            Self::Rsi { .. } => "rsi",
            Self::Sma { .. } => "sma",
            Self::Ema { .. } => "ema",
            Self::Macd { .. } => "macd",
            Self::Bollinger { .. } => "bollinger",
        }
    }

    /// The dominant period, used to size candle fetches.
    #[must_use]
    pub fn max_period(&self) -> usize {
        match *self {
            Self::Rsi { period } | Self::Sma { period } | Self::Ema { period } => period,
            Self::Macd { fast, slow, signal } => fast.max(slow).max(signal),
            Self::Bollinger { period, .. } => period,
        }
    }

    /// Minimum number of candles required to produce one value.
    #[must_use]
    pub fn min_candles(&self) -> usize {
        match *self {
            Self::Rsi { period } => period + 1,
            Self::Sma { period } | Self::Ema { period } => period,
            Self::Macd { slow, signal, .. } => slow + signal,
            Self::Bollinger { period, .. } => period,
        }
    }

    fn validate(&self) -> Result<(), IndicatorError> {
        match *self {
            Self::Rsi { period } | Self::Sma { period } | Self::Ema { period } if period < 2 => {
                Err(IndicatorError::invalid_period(self.name(), "must be >= 2"))
            }
            Self::Macd { fast, slow, signal } => {
                if fast < 2 || slow < 2 || signal < 1 {
                    Err(IndicatorError::invalid_period(self.name(), "must be >= 2"))
                } else if fast >= slow {
                    Err(IndicatorError::invalid_period(
                        self.name(),
                        format!("fast ({fast}) must be shorter than slow ({slow})"),
                    ))
                } else {
                    Ok(())
                }
            }
            Self::Bollinger { period, std_dev } => {
                if period < 2 {
                    Err(IndicatorError::invalid_period(self.name(), "must be >= 2"))
                } else if std_dev <= Decimal::ZERO {
                    Err(IndicatorError::InvalidParameter {
                        indicator: self.name(),
                        parameter: "std_dev",
                        reason: "must be positive".into(),
                    })
                } else {
                    Ok(())
                }
            }
            _ => Ok(()),
        }
    }

    /// Latest value of the indicator over `closes` (oldest first).
    pub fn evaluate(&self, closes: &[Decimal]) -> Result<IndicatorValue, IndicatorError> {
        self.series(closes)?
            .pop()
            .ok_or(IndicatorError::NotEnoughData {
                indicator: self.name(),
                needed: self.min_candles(),
                got: closes.len(),
            })
    }

    /// Last two values, for crossing-style conditions. Requires one candle
    /// beyond the minimum.
    pub fn evaluate_pair(
        &self,
        closes: &[Decimal],
    ) -> Result<(IndicatorValue, IndicatorValue), IndicatorError> {
        let mut series = self.series(closes)?;
        let latest = series.pop();
        let previous = series.pop();
        match (previous, latest) {
            (Some(previous), Some(latest)) => Ok((previous, latest)),
            _ => Err(IndicatorError::NotEnoughData {
                indicator: self.name(),
                needed: self.min_candles() + 1,
                got: closes.len(),
            }),
        }
    }

    /// Full value series, one entry per candle once warmed up.
    pub fn series(&self, closes: &[Decimal]) -> Result<Vec<IndicatorValue>, IndicatorError> {
        self.validate()?;
        let needed = self.min_candles();
        if closes.len() < needed {
            return Err(IndicatorError::NotEnoughData {
                indicator: self.name(),
                needed,
                got: closes.len(),
            });
        }
        let values = match *self {
            Self::Rsi { period } => rsi_series(closes, period)
                .into_iter()
                .map(IndicatorValue::Scalar)
                .collect(),
            Self::Sma { period } => sma_series(closes, period)
                .into_iter()
                .map(IndicatorValue::Scalar)
                .collect(),
            Self::Ema { period } => ema_series(closes, period)
                .into_iter()
                .map(IndicatorValue::Scalar)
                .collect(),
            Self::Macd { fast, slow, signal } => macd_series(closes, fast, slow, signal),
            Self::Bollinger { period, std_dev } => bollinger_series(closes, period, std_dev),
        };
        Ok(values)
    }
}

/// Output of one indicator evaluation.
#[derive(Clone, Copy, Debug, Deserialize, PartialEq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum IndicatorValue {
    Scalar(Decimal),
    Macd {
        macd: Decimal,
        signal: Decimal,
        histogram: Decimal,
    },
    Bands {
        upper: Decimal,
        middle: Decimal,
        lower: Decimal,
    },
}

/// Which component of a multi-valued indicator a condition compares.
#[derive(Clone, Copy, Debug, Default, Deserialize, Eq, PartialEq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum FieldSelector {
    /// Scalar output, or MACD line / middle band for multi-valued outputs.
    #[default]
    Primary,
    Signal,
    Histogram,
    Upper,
    Lower,
}

impl FieldSelector {
    /// Extracts the selected component, `None` when the selector does not
    /// apply to the value's shape.
    #[must_use]
    pub fn extract(self, value: IndicatorValue) -> Option<Decimal> {
        match (self, value) {
            (Self::Primary, IndicatorValue::Scalar(v)) => Some(v),
            (Self::Primary, IndicatorValue::Macd { macd, .. }) => Some(macd),
            (Self::Primary, IndicatorValue::Bands { middle, .. }) => Some(middle),
            (Self::Signal, IndicatorValue::Macd { signal, .. }) => Some(signal),
            (Self::Histogram, IndicatorValue::Macd { histogram, .. }) => Some(histogram),
            (Self::Upper, IndicatorValue::Bands { upper, .. }) => Some(upper),
            (Self::Lower, IndicatorValue::Bands { lower, .. }) => Some(lower),
            _ => None,
        }
    }
}

fn sma_series(closes: &[Decimal], period: usize) -> Vec<Decimal> {
    closes
        .windows(period)
        .map(|window| {
            let sum: Decimal = window.iter().copied().sum();
            safe_div(sum, Decimal::from(period as u64))
        })
        .collect()
}

fn ema_series(closes: &[Decimal], period: usize) -> Vec<Decimal> {
    let period_dec = Decimal::from(period as u64);
    let multiplier = safe_div(Decimal::TWO, period_dec + Decimal::ONE);
    let seed: Decimal = closes[..period].iter().copied().sum::<Decimal>() / period_dec;
    let mut values = Vec::with_capacity(closes.len() - period + 1);
    let mut ema = seed;
    values.push(ema);
    for close in &closes[period..] {
        ema = (*close - ema) * multiplier + ema;
        values.push(ema);
    }
    values
}

fn rsi_series(closes: &[Decimal], period: usize) -> Vec<Decimal> {
    let period_dec = Decimal::from(period as u64);
    let hundred = Decimal::ONE_HUNDRED;

    let mut gains = Decimal::ZERO;
    let mut losses = Decimal::ZERO;
    for pair in closes[..=period].windows(2) {
        let delta = pair[1] - pair[0];
        if delta > Decimal::ZERO {
            gains += delta;
        } else {
            losses -= delta;
        }
    }
    let mut avg_gain = gains / period_dec;
    let mut avg_loss = losses / period_dec;

    let rsi_of = |avg_gain: Decimal, avg_loss: Decimal| {
        if avg_loss.is_zero() {
            hundred
        } else {
            let rs = avg_gain / avg_loss;
            hundred - hundred / (Decimal::ONE + rs)
        }
    };

    let mut values = Vec::with_capacity(closes.len() - period);
    values.push(rsi_of(avg_gain, avg_loss));
    for pair in closes[period..].windows(2) {
        let delta = pair[1] - pair[0];
        let (gain, loss) = if delta > Decimal::ZERO {
            (delta, Decimal::ZERO)
        } else {
            (Decimal::ZERO, -delta)
        };
        // Wilder smoothing.
        avg_gain = (avg_gain * (period_dec - Decimal::ONE) + gain) / period_dec;
        avg_loss = (avg_loss * (period_dec - Decimal::ONE) + loss) / period_dec;
        values.push(rsi_of(avg_gain, avg_loss));
    }
    values
}

fn macd_series(closes: &[Decimal], fast: usize, slow: usize, signal: usize) -> Vec<IndicatorValue> {
    let fast_values = ema_series(closes, fast);
    let slow_values = ema_series(closes, slow);
    // Both series end at the latest candle; align their tails.
    let offset = fast_values.len() - slow_values.len();
    let macd_line: Vec<Decimal> = slow_values
        .iter()
        .zip(&fast_values[offset..])
        .map(|(slow_v, fast_v)| *fast_v - *slow_v)
        .collect();
    let signal_line = ema_series(&macd_line, signal);
    let offset = macd_line.len() - signal_line.len();
    macd_line[offset..]
        .iter()
        .zip(&signal_line)
        .map(|(macd, signal)| IndicatorValue::Macd {
            macd: *macd,
            signal: *signal,
            histogram: *macd - *signal,
        })
        .collect()
}

fn bollinger_series(closes: &[Decimal], period: usize, std_dev: Decimal) -> Vec<IndicatorValue> {
    let period_dec = Decimal::from(period as u64);
    closes
        .windows(period)
        .map(|window| {
            let middle: Decimal = window.iter().copied().sum::<Decimal>() / period_dec;
            let variance: Decimal = window
                .iter()
                .map(|close| {
                    let diff = *close - middle;
                    diff * diff
                })
                .sum::<Decimal>()
                / period_dec;
            let deviation = variance.sqrt().unwrap_or(Decimal::ZERO) * std_dev;
            IndicatorValue::Bands {
                upper: middle + deviation,
                middle,
                lower: middle - deviation,
            }
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    fn closes(values: &[i64]) -> Vec<Decimal> {
        values.iter().map(|v| Decimal::from(*v)).collect()
    }

    #[test]
    fn sma_of_ramp() {
        let spec = IndicatorSpec::Sma { period: 5 };
        let value = spec.evaluate(&closes(&[1, 2, 3, 4, 5])).unwrap();
        assert_eq!(value, IndicatorValue::Scalar(dec!(3)));
    }

    #[test]
    fn ema_of_constant_series_is_the_constant() {
        let spec = IndicatorSpec::Ema { period: 4 };
        let value = spec.evaluate(&closes(&[7, 7, 7, 7, 7, 7, 7, 7])).unwrap();
        assert_eq!(value, IndicatorValue::Scalar(dec!(7)));
    }

    #[test]
    fn rsi_of_pure_uptrend_is_100() {
        let spec = IndicatorSpec::Rsi { period: 14 };
        let data: Vec<i64> = (1..=20).collect();
        let value = spec.evaluate(&closes(&data)).unwrap();
        assert_eq!(value, IndicatorValue::Scalar(dec!(100)));
    }

    #[test]
    fn rsi_of_mixed_moves_is_bounded() {
        let spec = IndicatorSpec::Rsi { period: 5 };
        let data = closes(&[10, 12, 11, 13, 12, 14, 13, 15, 14, 16]);
        let IndicatorValue::Scalar(rsi) = spec.evaluate(&data).unwrap() else {
            panic!("expected scalar");
        };
        assert!(rsi > Decimal::ZERO && rsi < dec!(100));
        assert!(rsi > dec!(50), "net uptrend should sit above 50, got {rsi}");
    }

    #[test]
    fn macd_of_constant_series_is_zero() {
        let spec = IndicatorSpec::default_macd();
        let data = vec![dec!(50); 60];
        let value = spec.evaluate(&data).unwrap();
        assert_eq!(
            value,
            IndicatorValue::Macd {
                macd: Decimal::ZERO,
                signal: Decimal::ZERO,
                histogram: Decimal::ZERO,
            }
        );
    }

    #[test]
    fn bollinger_of_constant_series_collapses() {
        let spec = IndicatorSpec::Bollinger {
            period: 5,
            std_dev: dec!(2),
        };
        let value = spec.evaluate(&vec![dec!(30); 10]).unwrap();
        assert_eq!(
            value,
            IndicatorValue::Bands {
                upper: dec!(30),
                middle: dec!(30),
                lower: dec!(30),
            }
        );
    }

    #[test]
    fn bollinger_bands_are_symmetric() {
        let spec = IndicatorSpec::Bollinger {
            period: 4,
            std_dev: dec!(2),
        };
        let data = closes(&[10, 12, 14, 16]);
        let IndicatorValue::Bands {
            upper,
            middle,
            lower,
        } = spec.evaluate(&data).unwrap()
        else {
            panic!("expected bands");
        };
        assert_eq!(middle, dec!(13));
        assert_eq!(upper - middle, middle - lower);
        assert!(upper > middle);
    }

    #[test]
    fn short_window_reports_requirements() {
        let spec = IndicatorSpec::Rsi { period: 14 };
        let err = spec.evaluate(&closes(&[1, 2, 3])).unwrap_err();
        assert_eq!(
            err,
            IndicatorError::NotEnoughData {
                indicator: "rsi",
                needed: 15,
                got: 3,
            }
        );
    }

    #[test]
    fn invalid_macd_periods_rejected() {
        let spec = IndicatorSpec::Macd {
            fast: 26,
            slow: 12,
            signal: 9,
        };
        assert!(spec.evaluate(&vec![dec!(1); 100]).is_err());
    }

    #[test]
    fn evaluate_pair_yields_consecutive_values() {
        let spec = IndicatorSpec::Sma { period: 3 };
        let (previous, latest) = spec.evaluate_pair(&closes(&[1, 2, 3, 4, 5])).unwrap();
        assert_eq!(previous, IndicatorValue::Scalar(dec!(3)));
        assert_eq!(latest, IndicatorValue::Scalar(dec!(4)));
    }

    #[test]
    fn field_selector_extracts_components() {
        let value = IndicatorValue::Macd {
            macd: dec!(1.5),
            signal: dec!(1.2),
            histogram: dec!(0.3),
        };
        assert_eq!(FieldSelector::Primary.extract(value), Some(dec!(1.5)));
        assert_eq!(FieldSelector::Histogram.extract(value), Some(dec!(0.3)));
        assert_eq!(FieldSelector::Upper.extract(value), None);
    }

    #[test]
    fn determinism_over_identical_windows() {
        let spec = IndicatorSpec::default_rsi();
        let data = closes(&[44, 47, 45, 50, 49, 52, 55, 53, 56, 58, 57, 60, 62, 61, 63, 65]);
        assert_eq!(spec.evaluate(&data).unwrap(), spec.evaluate(&data).unwrap());
    }
}
