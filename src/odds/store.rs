use anyhow::Result;
use chrono::{DateTime, Duration, Utc};
use std::sync::Arc;
use thiserror::Error;
use tracing::debug;

use super::selection::{select_best, select_closing};
use crate::db::models::{EventId, MarketType, OddsSnapshot, Side};
use crate::db::Repository;

/// Why a quote was dropped before storage.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum ObservationError {
    #[error("{market} quote has no line")]
    MissingLine { market: MarketType },
    #[error("price {price:?} is missing or not finite")]
    InvalidPrice { price: Option<f64> },
    #[error("line {line} is not finite")]
    InvalidLine { line: f64 },
    #[error("side {side} is not valid for {market}")]
    SideMismatch { market: MarketType, side: Side },
}

/// One quote from a book, already keyed to a canonical event.
#[derive(Debug, Clone, PartialEq)]
pub struct SnapshotObservation {
    pub event_id: EventId,
    pub book: String,
    pub market_type: MarketType,
    pub side: Side,
    pub line: Option<f64>,
    pub price: Option<f64>,
    pub captured_at: DateTime<Utc>,
}

/// Counts from one `store_snapshots` call.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StoreReport {
    pub inserted: usize,
    /// Rows dropped by validation
    pub skipped: usize,
    /// Valid rows whose key already existed
    pub duplicates: usize,
}

/// Floor `ts` to the start of its bucket, counted from the Unix epoch.
pub fn time_bucket(ts: DateTime<Utc>, width: Duration) -> DateTime<Utc> {
    let secs = width.num_seconds().max(1);
    let t = ts.timestamp();
    DateTime::from_timestamp(t - t.rem_euclid(secs), 0).unwrap_or(ts)
}

/// Validate a quote and turn it into a storable snapshot.
pub fn to_snapshot(
    obs: &SnapshotObservation,
    bucket_width: Duration,
) -> Result<OddsSnapshot, ObservationError> {
    if !obs.market_type.accepts(obs.side) {
        return Err(ObservationError::SideMismatch {
            market: obs.market_type,
            side: obs.side,
        });
    }
    let price = match obs.price {
        Some(p) if p.is_finite() => p,
        other => return Err(ObservationError::InvalidPrice { price: other }),
    };
    let line = if obs.market_type.is_line_based() {
        match obs.line {
            Some(l) if l.is_finite() => Some(l),
            Some(l) => return Err(ObservationError::InvalidLine { line: l }),
            None => {
                return Err(ObservationError::MissingLine {
                    market: obs.market_type,
                })
            }
        }
    } else {
        None
    };
    Ok(OddsSnapshot {
        id: None,
        event_id: obs.event_id,
        book: obs.book.trim().to_ascii_lowercase(),
        market_type: obs.market_type,
        side: obs.side,
        line,
        price,
        captured_at: obs.captured_at,
        captured_bucket: time_bucket(obs.captured_at, bucket_width),
    })
}

/// Append-only, bucket-deduplicated time series of quotes.
pub struct OddsStore {
    repo: Arc<dyn Repository>,
    bucket_width: Duration,
}

impl OddsStore {
    pub fn new(repo: Arc<dyn Repository>, bucket_width: Duration) -> Self {
        OddsStore { repo, bucket_width }
    }

    /// Validate, bucket and insert a batch. Re-storing the same quote within
    /// its bucket is a no-op; invalid rows are dropped and counted.
    pub fn store_snapshots(&self, batch: &[SnapshotObservation]) -> Result<StoreReport> {
        let mut valid = Vec::with_capacity(batch.len());
        let mut skipped = 0;
        for obs in batch {
            match to_snapshot(obs, self.bucket_width) {
                Ok(snapshot) => valid.push(snapshot),
                Err(e) => {
                    debug!(
                        "Dropping {} quote for event {} from {}: {}",
                        obs.market_type, obs.event_id, obs.book, e
                    );
                    skipped += 1;
                }
            }
        }
        let inserted = self.repo.insert_snapshots(&valid)?;
        Ok(StoreReport {
            inserted,
            skipped,
            duplicates: valid.len() - inserted,
        })
    }

    /// Every stored quote for an event, oldest first.
    pub fn get_market_history(&self, event_id: EventId) -> Result<Vec<OddsSnapshot>> {
        self.repo.snapshots_for_event(event_id)
    }

    /// Current best quote for a market, for pricing consumers.
    pub fn get_latest_odds(
        &self,
        event_id: EventId,
        market_type: MarketType,
        side: Option<Side>,
    ) -> Result<Option<OddsSnapshot>> {
        let candidates = self
            .repo
            .snapshots_for_market(event_id, market_type, side, None)?;
        Ok(select_best(&candidates, market_type, side).cloned())
    }

    /// Best quote captured at or before `start_time`.
    pub fn closing_line(
        &self,
        event_id: EventId,
        market_type: MarketType,
        side: Side,
        start_time: DateTime<Utc>,
    ) -> Result<Option<OddsSnapshot>> {
        let candidates =
            self.repo
                .snapshots_for_market(event_id, market_type, Some(side), Some(start_time))?;
        Ok(select_closing(&candidates, market_type, side, start_time).cloned())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::models::{EventStatus, NewEvent};
    use crate::db::Database;
    use chrono::TimeZone;

    fn tip_off() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 1, 15, 19, 0, 0).unwrap()
    }

    fn setup() -> (Arc<Database>, OddsStore, EventId) {
        let db = Arc::new(Database::open_in_memory().unwrap());
        let home = db
            .create_team_with_mapping("NCAAM", "Duke", None, "espn", "150")
            .unwrap();
        let away = db
            .create_team_with_mapping("NCAAM", "UNC", None, "espn", "153")
            .unwrap();
        let event_id = db
            .create_event_with_mapping(
                &NewEvent {
                    league: "NCAAM".into(),
                    season: 2026,
                    start_time: tip_off(),
                    home_team_id: home,
                    away_team_id: away,
                    home_name: "Duke".into(),
                    away_name: "UNC".into(),
                    status: EventStatus::Scheduled,
                },
                "espn",
                "401",
            )
            .unwrap();
        let store = OddsStore::new(db.clone(), Duration::minutes(15));
        (db, store, event_id)
    }

    fn quote(event_id: EventId, minutes_before: i64) -> SnapshotObservation {
        SnapshotObservation {
            event_id,
            book: "pinnacle".into(),
            market_type: MarketType::Spread,
            side: Side::Home,
            line: Some(-5.5),
            price: Some(-110.0),
            captured_at: tip_off() - Duration::minutes(minutes_before),
        }
    }

    #[test]
    fn test_time_bucket_floors() {
        let width = Duration::minutes(15);
        let t = Utc.with_ymd_and_hms(2026, 1, 15, 18, 44, 59).unwrap();
        assert_eq!(
            time_bucket(t, width),
            Utc.with_ymd_and_hms(2026, 1, 15, 18, 30, 0).unwrap()
        );
        assert_eq!(time_bucket(tip_off(), width), tip_off());
    }

    #[test]
    fn test_repeated_polling_stores_one_row() {
        let (db, store, event_id) = setup();
        let batch = vec![quote(event_id, 40); 5];
        let report = store.store_snapshots(&batch).unwrap();
        assert_eq!(report.inserted, 1);
        assert_eq!(report.duplicates, 4);
        for _ in 0..3 {
            store.store_snapshots(&batch).unwrap();
        }
        assert_eq!(db.snapshots_for_event(event_id).unwrap().len(), 1);
    }

    #[test]
    fn test_price_change_in_same_bucket_is_deduplicated() {
        let (_db, store, event_id) = setup();
        store.store_snapshots(&[quote(event_id, 40)]).unwrap();
        let mut moved = quote(event_id, 35);
        moved.price = Some(-120.0);
        let report = store.store_snapshots(&[moved]).unwrap();
        assert_eq!(report.inserted, 0);
        assert_eq!(store.get_market_history(event_id).unwrap()[0].price, -110.0);
    }

    #[test]
    fn test_line_change_in_same_bucket_is_new_row() {
        let (_db, store, event_id) = setup();
        let mut moved = quote(event_id, 35);
        moved.line = Some(-6.0);
        let report = store.store_snapshots(&[quote(event_id, 40), moved]).unwrap();
        assert_eq!(report.inserted, 2);
    }

    #[test]
    fn test_invalid_rows_are_dropped() {
        let (_db, store, event_id) = setup();
        let mut no_line = quote(event_id, 40);
        no_line.line = None;
        let mut nan_price = quote(event_id, 40);
        nan_price.price = Some(f64::NAN);
        let mut no_price = quote(event_id, 40);
        no_price.price = None;
        let mut wrong_side = quote(event_id, 40);
        wrong_side.side = Side::Over;
        let mut ml = quote(event_id, 40);
        ml.market_type = MarketType::Moneyline;
        ml.line = None;
        ml.price = Some(-250.0);

        let report = store
            .store_snapshots(&[no_line, nan_price, no_price, wrong_side, ml])
            .unwrap();
        assert_eq!(report.skipped, 4);
        assert_eq!(report.inserted, 1);
        assert_eq!(
            to_snapshot(&quote(event_id, 1), Duration::minutes(15)).map(|s| s.line),
            Ok(Some(-5.5))
        );
    }

    #[test]
    fn test_latest_and_closing() {
        let (_db, store, event_id) = setup();
        let mut after = quote(event_id, -30);
        after.line = Some(-7.0);
        let mut dk = quote(event_id, 10);
        dk.book = "DraftKings".into();
        dk.line = Some(-6.0);
        store
            .store_snapshots(&[quote(event_id, 60), dk, after])
            .unwrap();

        let latest = store
            .get_latest_odds(event_id, MarketType::Spread, Some(Side::Home))
            .unwrap()
            .unwrap();
        assert_eq!(latest.line, Some(-7.0));
        let close = store
            .closing_line(event_id, MarketType::Spread, Side::Home, tip_off())
            .unwrap()
            .unwrap();
        assert_eq!(close.book, "draftkings");
        assert_eq!(close.line, Some(-6.0));
    }
}
