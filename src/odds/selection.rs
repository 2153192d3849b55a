//! Picking the single quote that represents a market.
//!
//! Pure functions over already-loaded snapshots. The closing line is the same
//! selection applied to snapshots captured at or before the start time.

use chrono::{DateTime, Utc};
use std::cmp::Ordering;

use crate::db::models::{MarketType, OddsSnapshot, Side};

/// Priority for books not in the table. Always loses a tie.
pub const UNKNOWN_BOOK_PRIORITY: u32 = 1000;

/// Lower is sharper. Books absent from the table get `UNKNOWN_BOOK_PRIORITY`.
const BOOK_PRIORITIES: &[(&str, u32)] = &[
    ("pinnacle", 1),
    ("circa", 1),
    ("bookmaker", 2),
    ("betonlineag", 3),
    ("lowvig", 3),
    ("betcris", 4),
    ("draftkings", 10),
    ("fanduel", 10),
    ("betmgm", 12),
    ("williamhill_us", 12),
    ("pointsbetus", 14),
    ("bovada", 15),
    ("betrivers", 16),
    ("unibet", 16),
];

pub fn book_priority(book: &str) -> u32 {
    let key = book.trim().to_ascii_lowercase();
    BOOK_PRIORITIES
        .iter()
        .find(|(name, _)| *name == key)
        .map(|(_, p)| *p)
        .unwrap_or(UNKNOWN_BOOK_PRIORITY)
}

/// Most recent first, then sharper book, then book name.
fn rank(a: &OddsSnapshot, b: &OddsSnapshot) -> Ordering {
    b.captured_at
        .cmp(&a.captured_at)
        .then_with(|| book_priority(&a.book).cmp(&book_priority(&b.book)))
        .then_with(|| a.book.cmp(&b.book))
        .then_with(|| a.id.cmp(&b.id))
}

/// Best quote for `market_type` (and `side`, if given) among `candidates`.
pub fn select_best(
    candidates: &[OddsSnapshot],
    market_type: MarketType,
    side: Option<Side>,
) -> Option<&OddsSnapshot> {
    best_of(candidates.iter(), market_type, side)
}

/// Closing quote: `select_best` over the quotes captured at or before
/// `start_time`.
pub fn select_closing(
    candidates: &[OddsSnapshot],
    market_type: MarketType,
    side: Side,
    start_time: DateTime<Utc>,
) -> Option<&OddsSnapshot> {
    best_of(
        candidates.iter().filter(|s| s.captured_at <= start_time),
        market_type,
        Some(side),
    )
}

fn best_of<'a>(
    candidates: impl Iterator<Item = &'a OddsSnapshot>,
    market_type: MarketType,
    side: Option<Side>,
) -> Option<&'a OddsSnapshot> {
    candidates
        .filter(|s| s.market_type == market_type)
        .filter(|s| side.map_or(true, |side| s.side == side))
        .min_by(|a, b| rank(a, b))
}
