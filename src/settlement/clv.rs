//! Closing-line value.
//!
//! Positive CLV always means the bettor locked in a better number than the
//! market closed at.

use crate::db::models::{MarketType, Side};

/// Implied win probability of an American price, without vig removal.
/// Prices strictly between -100 and +100 are not valid American odds.
pub fn implied_probability(american: f64) -> Option<f64> {
    if !american.is_finite() || american.abs() < 100.0 {
        return None;
    }
    if american < 0.0 {
        Some(-american / (-american + 100.0))
    } else {
        Some(100.0 / (american + 100.0))
    }
}

/// CLV for a pick given its reference (open) quote and the closing quote.
///
/// Spread: lines are from the picked side, so a line that closes lower means
/// the bettor got extra points: `open - close`. Over: `close - open`. Under:
/// `open - close`. Moneyline: `implied(close) - implied(open)`.
pub fn compute_clv(
    market_type: MarketType,
    side: Side,
    open_line: Option<f64>,
    open_price: f64,
    close_line: Option<f64>,
    close_price: f64,
) -> Option<f64> {
    match market_type {
        MarketType::Spread => Some(open_line? - close_line?),
        MarketType::Total => {
            let (open, close) = (open_line?, close_line?);
            match side {
                Side::Over => Some(close - open),
                _ => Some(open - close),
            }
        }
        MarketType::Moneyline => {
            Some(implied_probability(close_price)? - implied_probability(open_price)?)
        }
    }
}
