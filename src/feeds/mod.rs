//! Provider feeds and the ingestion boundary.
//!
//! Each provider's payload is typed in its own module and mapped into the
//! sighting shapes below. Nothing provider-shaped gets past `Ingestor`.

pub mod espn;
pub mod odds_api;

pub use espn::EspnClient;
pub use odds_api::OddsApiClient;

use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info, warn};

use crate::db::models::{
    EventStatus, MarketType, RunOutcome, RunStatus, Side, UnresolvedSighting,
};
use crate::db::Repository;
use crate::identity::{EventObservation, EventResolver, FeedMatch, Resolution, ScoreUpdate};
use crate::odds::{OddsStore, SnapshotObservation, StoreReport};

/// Team as a provider reports it.
#[derive(Debug, Clone, PartialEq)]
pub struct TeamSighting {
    pub provider_team_id: String,
    pub name: String,
    pub abbreviation: Option<String>,
}

/// One game from a scoreboard feed.
#[derive(Debug, Clone, PartialEq)]
pub struct EventSighting {
    pub provider_event_id: String,
    pub league: String,
    pub start_time: DateTime<Utc>,
    pub home: TeamSighting,
    pub away: TeamSighting,
    pub status: EventStatus,
    pub score: Option<ScoreUpdate>,
}

/// One book's price for one side of one market.
#[derive(Debug, Clone, PartialEq)]
pub struct QuoteSighting {
    pub book: String,
    pub market_type: MarketType,
    pub side: Side,
    pub line: Option<f64>,
    pub price: Option<f64>,
    pub captured_at: DateTime<Utc>,
}

/// One game from an odds feed, identified by names rather than team ids.
#[derive(Debug, Clone, PartialEq)]
pub struct OddsSighting {
    pub provider_event_id: String,
    pub league: String,
    pub home_name: String,
    pub away_name: String,
    pub commence_time: DateTime<Utc>,
    pub quotes: Vec<QuoteSighting>,
}

#[async_trait]
pub trait ScoreboardProvider: Send + Sync {
    /// Provider key used in mappings, e.g. "espn".
    fn name(&self) -> &str;

    async fn fetch_scoreboard(&self, league: &str) -> Result<Vec<EventSighting>>;
}

#[async_trait]
pub trait OddsProvider: Send + Sync {
    fn name(&self) -> &str;

    async fn fetch_odds(&self, league: &str) -> Result<Vec<OddsSighting>>;
}

/// ESPN scoreboard path segment for a league.
pub fn espn_path(league: &str) -> Option<&'static str> {
    match league.to_ascii_uppercase().as_str() {
        "NCAAM" | "NCAAB" => Some("basketball/mens-college-basketball"),
        "NCAAW" => Some("basketball/womens-college-basketball"),
        "NBA" => Some("basketball/nba"),
        "NFL" => Some("football/nfl"),
        "NCAAF" => Some("football/college-football"),
        "NHL" => Some("hockey/nhl"),
        "MLB" => Some("baseball/mlb"),
        _ => None,
    }
}

/// The Odds API sport key for a league.
pub fn odds_api_sport(league: &str) -> Option<&'static str> {
    match league.to_ascii_uppercase().as_str() {
        "NCAAM" | "NCAAB" => Some("basketball_ncaab"),
        "NCAAW" => Some("basketball_wncaab"),
        "NBA" => Some("basketball_nba"),
        "NFL" => Some("americanfootball_nfl"),
        "NCAAF" => Some("americanfootball_ncaaf"),
        "NHL" => Some("icehockey_nhl"),
        "MLB" => Some("baseball_mlb"),
        _ => None,
    }
}

/// Outcome of one ingestion run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct IngestReport {
    pub run_id: i64,
    pub status: RunStatus,
    pub processed: usize,
    pub unresolved: usize,
    pub snapshots_inserted: usize,
    pub snapshots_skipped: usize,
}

/// Runs provider fetches through resolution and storage, with an audit row
/// per run. Provider failures end the run as failed; they never propagate.
/// A sighting that fails to resolve or store is logged and counted as
/// unresolved, and the run goes on.
pub struct Ingestor {
    repo: Arc<dyn Repository>,
    events: Arc<EventResolver>,
    odds: Arc<OddsStore>,
    fetch_timeout: Duration,
}

impl Ingestor {
    pub fn new(
        repo: Arc<dyn Repository>,
        events: Arc<EventResolver>,
        odds: Arc<OddsStore>,
        fetch_timeout: Duration,
    ) -> Self {
        Ingestor {
            repo,
            events,
            odds,
            fetch_timeout,
        }
    }

    pub async fn ingest_scoreboard(
        &self,
        provider: &dyn ScoreboardProvider,
        league: &str,
    ) -> Result<IngestReport> {
        let run_id = self
            .repo
            .start_ingestion_run(provider.name(), league, "scores")?;
        let sightings =
            match tokio::time::timeout(self.fetch_timeout, provider.fetch_scoreboard(league)).await
            {
                Ok(Ok(sightings)) => sightings,
                Ok(Err(e)) => return self.fail_run(run_id, provider.name(), league, format!("{:#}", e)),
                Err(_) => {
                    return self.fail_run(
                        run_id,
                        provider.name(),
                        league,
                        format!("timed out after {:?}", self.fetch_timeout),
                    )
                }
            };

        let mut processed = 0;
        let mut unresolved = 0;
        for sighting in &sightings {
            match self.record_event_sighting(provider.name(), sighting) {
                Ok(true) => processed += 1,
                Ok(false) => unresolved += 1,
                Err(e) => {
                    error!(
                        "{} event {} failed: {:#}",
                        provider.name(),
                        sighting.provider_event_id,
                        e
                    );
                    unresolved += 1;
                }
            }
        }

        self.repo
            .finish_ingestion_run(run_id, &RunOutcome::success(processed, unresolved))?;
        info!(
            "{} {} scores: {} processed, {} unresolved",
            provider.name(),
            league,
            processed,
            unresolved
        );
        Ok(IngestReport {
            run_id,
            status: RunStatus::Success,
            processed,
            unresolved,
            snapshots_inserted: 0,
            snapshots_skipped: 0,
        })
    }

    /// Resolve one scoreboard game and settle its quarantine row. True when
    /// it landed on a canonical event.
    fn record_event_sighting(&self, provider: &str, sighting: &EventSighting) -> Result<bool> {
        match self.apply_event_sighting(provider, sighting)? {
            Resolution::Resolved(_) => {
                self.repo
                    .clear_unresolved("event", provider, &sighting.provider_event_id)?;
                Ok(true)
            }
            Resolution::Unresolved(reason) => {
                self.quarantine(
                    "event",
                    provider,
                    &sighting.provider_event_id,
                    &sighting.league,
                    &format!(
                        "{} @ {} {}",
                        sighting.away.name,
                        sighting.home.name,
                        sighting.start_time.to_rfc3339()
                    ),
                    reason.as_str(),
                )?;
                Ok(false)
            }
        }
    }

    fn apply_event_sighting(&self, provider: &str, sighting: &EventSighting) -> Result<Resolution> {
        let identity = self.events.identity();
        let home = identity.resolve_or_create_team(
            &sighting.league,
            provider,
            &sighting.home.provider_team_id,
            &sighting.home.name,
            sighting.home.abbreviation.as_deref(),
        )?;
        let away = identity.resolve_or_create_team(
            &sighting.league,
            provider,
            &sighting.away.provider_team_id,
            &sighting.away.name,
            sighting.away.abbreviation.as_deref(),
        )?;
        self.events.resolve_event(&EventObservation {
            provider: provider.to_string(),
            provider_event_id: sighting.provider_event_id.clone(),
            league: sighting.league.clone(),
            start_time: sighting.start_time,
            home_team_id: Some(home),
            away_team_id: Some(away),
            status: sighting.status,
            result: sighting.score.clone(),
        })
    }

    pub async fn ingest_odds(&self, provider: &dyn OddsProvider, league: &str) -> Result<IngestReport> {
        let run_id = self.repo.start_ingestion_run(provider.name(), league, "odds")?;
        let sightings =
            match tokio::time::timeout(self.fetch_timeout, provider.fetch_odds(league)).await {
                Ok(Ok(sightings)) => sightings,
                Ok(Err(e)) => return self.fail_run(run_id, provider.name(), league, format!("{:#}", e)),
                Err(_) => {
                    return self.fail_run(
                        run_id,
                        provider.name(),
                        league,
                        format!("timed out after {:?}", self.fetch_timeout),
                    )
                }
            };

        let mut report = IngestReport {
            run_id,
            status: RunStatus::Success,
            processed: 0,
            unresolved: 0,
            snapshots_inserted: 0,
            snapshots_skipped: 0,
        };
        for sighting in &sightings {
            match self.record_odds_sighting(provider.name(), sighting) {
                Ok(Some(stored)) => {
                    report.snapshots_inserted += stored.inserted;
                    report.snapshots_skipped += stored.skipped;
                    report.processed += 1;
                }
                Ok(None) => report.unresolved += 1,
                Err(e) => {
                    error!(
                        "{} odds event {} failed: {:#}",
                        provider.name(),
                        sighting.provider_event_id,
                        e
                    );
                    report.unresolved += 1;
                }
            }
        }

        self.repo.finish_ingestion_run(
            run_id,
            &RunOutcome::success(report.processed, report.unresolved),
        )?;
        info!(
            "{} {} odds: {} events, {} new quotes, {} dropped, {} unresolved",
            provider.name(),
            league,
            report.processed,
            report.snapshots_inserted,
            report.snapshots_skipped,
            report.unresolved
        );
        Ok(report)
    }

    /// Resolve one odds event and store its quotes in the event's orientation.
    /// `None` when the event was quarantined.
    fn record_odds_sighting(&self, provider: &str, sighting: &OddsSighting) -> Result<Option<StoreReport>> {
        let (event_id, swapped) = match self.events.resolve_provider_event_by_names(
            provider,
            &sighting.provider_event_id,
            &sighting.league,
            &sighting.home_name,
            &sighting.away_name,
            sighting.commence_time,
        )? {
            FeedMatch::Linked { event_id, swapped } => (event_id, swapped),
            FeedMatch::Unresolved(reason) => {
                self.quarantine(
                    "odds_event",
                    provider,
                    &sighting.provider_event_id,
                    &sighting.league,
                    &format!(
                        "{} @ {} {}",
                        sighting.away_name,
                        sighting.home_name,
                        sighting.commence_time.to_rfc3339()
                    ),
                    reason.as_str(),
                )?;
                return Ok(None);
            }
        };

        self.repo
            .clear_unresolved("odds_event", provider, &sighting.provider_event_id)?;
        let batch: Vec<SnapshotObservation> = sighting
            .quotes
            .iter()
            .map(|q| SnapshotObservation {
                event_id,
                book: q.book.clone(),
                market_type: q.market_type,
                side: if swapped { q.side.swap_home_away() } else { q.side },
                line: q.line,
                price: q.price,
                captured_at: q.captured_at,
            })
            .collect();
        let stored = self.odds.store_snapshots(&batch)?;
        debug!(
            "Event {}: {} quotes stored, {} dropped",
            event_id, stored.inserted, stored.skipped
        );
        Ok(Some(stored))
    }

    fn fail_run(&self, run_id: i64, provider: &str, league: &str, error: String) -> Result<IngestReport> {
        warn!("{} {} fetch failed: {}", provider, league, error);
        self.repo
            .finish_ingestion_run(run_id, &RunOutcome::failed(error))?;
        Ok(IngestReport {
            run_id,
            status: RunStatus::Failed,
            processed: 0,
            unresolved: 0,
            snapshots_inserted: 0,
            snapshots_skipped: 0,
        })
    }

    fn quarantine(
        &self,
        kind: &str,
        provider: &str,
        provider_key: &str,
        league: &str,
        description: &str,
        reason: &str,
    ) -> Result<()> {
        let now = Utc::now();
        self.repo.record_unresolved(&UnresolvedSighting {
            kind: kind.to_string(),
            provider: provider.to_string(),
            provider_key: provider_key.to_string(),
            league: league.to_string(),
            description: description.to_string(),
            reason: reason.to_string(),
            attempts: 1,
            first_seen: now,
            last_seen: now,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::TtlCache;
    use crate::db::models::TeamId;
    use crate::db::{Database, SCHEMA_SQL};
    use crate::identity::{IdentityResolver, MappingKey};
    use rusqlite::Connection;
    use chrono::{Duration as ChronoDuration, TimeZone};
    use std::sync::Mutex;

    struct FakeScoreboard(Vec<EventSighting>);

    #[async_trait]
    impl ScoreboardProvider for FakeScoreboard {
        fn name(&self) -> &str {
            "espn"
        }

        async fn fetch_scoreboard(&self, _league: &str) -> Result<Vec<EventSighting>> {
            Ok(self.0.clone())
        }
    }

    struct DownScoreboard;

    #[async_trait]
    impl ScoreboardProvider for DownScoreboard {
        fn name(&self) -> &str {
            "espn"
        }

        async fn fetch_scoreboard(&self, _league: &str) -> Result<Vec<EventSighting>> {
            anyhow::bail!("connection refused")
        }
    }

    struct FakeOdds(Mutex<Vec<OddsSighting>>);

    #[async_trait]
    impl OddsProvider for FakeOdds {
        fn name(&self) -> &str {
            "odds_api"
        }

        async fn fetch_odds(&self, _league: &str) -> Result<Vec<OddsSighting>> {
            Ok(self.0.lock().unwrap().clone())
        }
    }

    fn tip_off() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 1, 15, 19, 0, 0).unwrap()
    }

    fn ingestor() -> (Arc<Database>, Ingestor) {
        ingestor_over(Database::open_in_memory().unwrap())
    }

    fn ingestor_over(db: Database) -> (Arc<Database>, Ingestor) {
        let db = Arc::new(db);
        let cache: Arc<TtlCache<MappingKey, TeamId>> =
            Arc::new(TtlCache::new(Duration::from_secs(60), 100));
        let identity = Arc::new(IdentityResolver::new(db.clone(), cache));
        let events = Arc::new(EventResolver::new(
            db.clone(),
            identity,
            ChronoDuration::hours(6),
        ));
        let odds = Arc::new(OddsStore::new(db.clone(), ChronoDuration::minutes(15)));
        let ingestor = Ingestor::new(db.clone(), events, odds, Duration::from_secs(5));
        (db, ingestor)
    }

    fn team(id: &str, name: &str) -> TeamSighting {
        TeamSighting {
            provider_team_id: id.into(),
            name: name.into(),
            abbreviation: None,
        }
    }

    fn duke_unc() -> EventSighting {
        EventSighting {
            provider_event_id: "401".into(),
            league: "NCAAM".into(),
            start_time: tip_off(),
            home: team("150", "Duke"),
            away: team("153", "UNC"),
            status: EventStatus::Scheduled,
            score: None,
        }
    }

    fn odds_sighting(home: &str, away: &str) -> OddsSighting {
        OddsSighting {
            provider_event_id: "abc".into(),
            league: "NCAAM".into(),
            home_name: home.into(),
            away_name: away.into(),
            commence_time: tip_off(),
            quotes: vec![
                QuoteSighting {
                    book: "pinnacle".into(),
                    market_type: MarketType::Spread,
                    side: Side::Home,
                    line: Some(-5.5),
                    price: Some(-110.0),
                    captured_at: tip_off() - ChronoDuration::hours(2),
                },
                QuoteSighting {
                    book: "pinnacle".into(),
                    market_type: MarketType::Total,
                    side: Side::Over,
                    line: None,
                    price: Some(-110.0),
                    captured_at: tip_off() - ChronoDuration::hours(2),
                },
            ],
        }
    }

    #[test]
    fn test_league_keys() {
        assert_eq!(espn_path("ncaam"), Some("basketball/mens-college-basketball"));
        assert_eq!(odds_api_sport("NBA"), Some("basketball_nba"));
        assert_eq!(odds_api_sport("EPL"), None);
    }

    #[tokio::test]
    async fn test_scoreboard_run_is_audited() {
        let (db, ingestor) = ingestor();
        let feed = FakeScoreboard(vec![duke_unc(), duke_unc()]);
        let report = ingestor.ingest_scoreboard(&feed, "NCAAM").await.unwrap();
        assert_eq!(report.status, RunStatus::Success);
        assert_eq!(report.processed, 2);
        assert_eq!(db.count_events("NCAAM").unwrap(), 1);

        let runs = db.recent_ingestion_runs(5).unwrap();
        assert_eq!(runs[0].status, RunStatus::Success);
        assert_eq!(runs[0].items_processed, 2);
        assert!(runs[0].finished_at.is_some());
    }

    #[tokio::test]
    async fn test_transport_failure_finishes_run_as_failed() {
        let (db, ingestor) = ingestor();
        let report = ingestor
            .ingest_scoreboard(&DownScoreboard, "NCAAM")
            .await
            .unwrap();
        assert_eq!(report.status, RunStatus::Failed);
        assert_eq!(report.processed, 0);
        let run = &db.recent_ingestion_runs(1).unwrap()[0];
        assert_eq!(run.status, RunStatus::Failed);
        assert_eq!(run.items_processed, 0);
        assert!(run.error.as_deref().unwrap_or("").contains("connection refused"));
    }

    #[tokio::test]
    async fn test_same_team_sighting_is_quarantined() {
        let (db, ingestor) = ingestor();
        let mut bad = duke_unc();
        bad.away = team("150", "Duke");
        let report = ingestor
            .ingest_scoreboard(&FakeScoreboard(vec![bad]), "NCAAM")
            .await
            .unwrap();
        assert_eq!(report.unresolved, 1);
        let quarantined = db.list_unresolved(10).unwrap();
        assert_eq!(quarantined[0].reason, "same_team");
    }

    #[tokio::test]
    async fn test_odds_quarantined_until_event_exists() {
        let (db, ingestor) = ingestor();
        let odds = FakeOdds(Mutex::new(vec![odds_sighting("Duke Blue Devils", "North Carolina UNC")]));

        let early = ingestor.ingest_odds(&odds, "NCAAM").await.unwrap();
        assert_eq!(early.unresolved, 1);
        assert_eq!(db.list_unresolved(10).unwrap().len(), 1);

        ingestor
            .ingest_scoreboard(&FakeScoreboard(vec![duke_unc()]), "NCAAM")
            .await
            .unwrap();
        let report = ingestor.ingest_odds(&odds, "NCAAM").await.unwrap();
        assert_eq!(report.processed, 1);
        assert_eq!(report.snapshots_inserted, 1);
        assert_eq!(report.snapshots_skipped, 1);
        assert!(db.list_unresolved(10).unwrap().is_empty());
        assert!(db.find_event_mapping("odds_api", "abc").unwrap().is_some());

        let again = ingestor.ingest_odds(&odds, "NCAAM").await.unwrap();
        assert_eq!(again.snapshots_inserted, 0);
    }

    #[tokio::test]
    async fn test_storage_error_on_one_event_does_not_abort_run() {
        let conn = Connection::open_in_memory().unwrap();
        conn.execute_batch(SCHEMA_SQL).unwrap();
        conn.execute_batch(
            "CREATE TRIGGER full_disk BEFORE INSERT ON odds_snapshots
             BEGIN SELECT RAISE(ABORT, 'disk full'); END;",
        )
        .unwrap();
        let (db, ingestor) = ingestor_over(Database::from_connection(conn).unwrap());
        ingestor
            .ingest_scoreboard(&FakeScoreboard(vec![duke_unc()]), "NCAAM")
            .await
            .unwrap();

        let mut unknown = odds_sighting("Gonzaga", "Baylor");
        unknown.provider_event_id = "def".into();
        let feed = FakeOdds(Mutex::new(vec![odds_sighting("Duke", "UNC"), unknown]));
        let report = ingestor.ingest_odds(&feed, "NCAAM").await.unwrap();
        assert_eq!(report.status, RunStatus::Success);
        assert_eq!(report.processed, 0);
        assert_eq!(report.unresolved, 2);

        // The sighting after the failing one was still handled.
        let quarantined = db.list_unresolved(10).unwrap();
        assert_eq!(quarantined.len(), 1);
        assert_eq!(quarantined[0].provider_key, "def");

        let run = &db.recent_ingestion_runs(1).unwrap()[0];
        assert_eq!(run.kind, "odds");
        assert_eq!(run.status, RunStatus::Success);
        assert_eq!(run.items_unresolved, 2);
        assert!(run.finished_at.is_some());
    }

    #[tokio::test]
    async fn test_reversed_odds_feed_stores_quotes_on_event_sides() {
        let (db, ingestor) = ingestor();
        ingestor
            .ingest_scoreboard(&FakeScoreboard(vec![duke_unc()]), "NCAAM")
            .await
            .unwrap();
        let event_id = db.find_event_mapping("espn", "401").unwrap().unwrap().event_id;

        // The feed has UNC at home, giving them +5.5 on its home side.
        let mut reversed = odds_sighting("UNC", "Duke");
        reversed.quotes[0].line = Some(5.5);
        reversed.quotes[0].captured_at = tip_off() - ChronoDuration::hours(3);
        let feed = FakeOdds(Mutex::new(vec![reversed]));
        let report = ingestor.ingest_odds(&feed, "NCAAM").await.unwrap();
        assert_eq!(report.snapshots_inserted, 1);
        assert!(db.find_event_mapping("odds_api", "abc").unwrap().unwrap().swapped);

        // A later poll resolves through the mapping and keeps the flip.
        feed.0.lock().unwrap()[0].quotes[0].captured_at = tip_off() - ChronoDuration::hours(1);
        ingestor.ingest_odds(&feed, "NCAAM").await.unwrap();

        let rows = db.snapshots_for_event(event_id).unwrap();
        assert_eq!(rows.len(), 2);
        assert!(rows
            .iter()
            .all(|r| r.side == Side::Away && r.line == Some(5.5)));
    }
}
