//! Settlement: results in, closing lines recorded, picks graded once.
//!
//! Every write here is conditional (grade only while PENDING, closing line
//! only while unset), so overlapping runs converge instead of double-counting.

pub mod clv;
pub mod grading;

use anyhow::{anyhow, Result};
use chrono::{DateTime, Duration, Utc};
use serde::Serialize;
use std::sync::Arc;
use tracing::{debug, error, info, warn};

use crate::db::models::{Event, EventId, EventStatus, GameResult, Pick};
use crate::db::Repository;
use crate::identity::{EventResolver, Resolution, ScoreUpdate, UnresolvedReason};
use crate::jobs::{JobLock, JobStatus};
use crate::odds::OddsStore;

pub use clv::{compute_clv, implied_probability};
pub use grading::{grade_margin, grade_pick, GradeError};

#[derive(Debug, Clone)]
pub struct SettlementConfig {
    pub lock_ttl: Duration,
    /// How far back a started event is still considered for closing lines
    pub clv_lookback: Duration,
    pub max_resolution_attempts: u32,
}

impl Default for SettlementConfig {
    fn default() -> Self {
        SettlementConfig {
            lock_ttl: Duration::minutes(10),
            clv_lookback: Duration::days(3),
            max_resolution_attempts: 5,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct SettlementReport {
    pub status: JobStatus,
    pub graded: usize,
    pub clv_updates: usize,
    pub failures: usize,
}

impl SettlementReport {
    fn skipped() -> Self {
        SettlementReport {
            status: JobStatus::Skipped,
            graded: 0,
            clv_updates: 0,
            failures: 0,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct PickResolutionReport {
    pub attached: usize,
    pub unresolved: usize,
    pub quarantined: usize,
}

pub struct SettlementEngine {
    repo: Arc<dyn Repository>,
    odds: Arc<OddsStore>,
    events: Arc<EventResolver>,
    config: SettlementConfig,
}

impl SettlementEngine {
    pub fn new(
        repo: Arc<dyn Repository>,
        odds: Arc<OddsStore>,
        events: Arc<EventResolver>,
        config: SettlementConfig,
    ) -> Self {
        SettlementEngine {
            repo,
            odds,
            events,
            config,
        }
    }

    /// Record a score for an event. A final score also finalizes the event.
    pub fn ingest_result(&self, event_id: EventId, score: &ScoreUpdate) -> Result<()> {
        self.repo.upsert_game_result(&GameResult {
            event_id,
            home_score: score.home_score,
            away_score: score.away_score,
            is_final: score.is_final,
            period: score.period.clone(),
            updated_at: Utc::now(),
        })?;
        if score.is_final {
            self.repo
                .update_event_state(event_id, EventStatus::Final, None)?;
        }
        Ok(())
    }

    /// Overwrite a stored result, including un-finalizing it. Picks already
    /// graded keep their outcome.
    pub fn correct_game_result(&self, event_id: EventId, score: &ScoreUpdate) -> Result<()> {
        warn!(
            "Correcting result for event {} to {}-{} (final: {})",
            event_id, score.home_score, score.away_score, score.is_final
        );
        self.repo.correct_game_result(&GameResult {
            event_id,
            home_score: score.home_score,
            away_score: score.away_score,
            is_final: score.is_final,
            period: score.period.clone(),
            updated_at: Utc::now(),
        })
    }

    /// Closing line backfill, then grading, under a per-league lock.
    pub fn run_settlement_cycle(
        &self,
        league: Option<&str>,
        limit: Option<usize>,
    ) -> Result<SettlementReport> {
        let lock_name = format!("settlement:{}", league.unwrap_or("all"));
        let Some(_lock) = JobLock::try_acquire(self.repo.clone(), &lock_name, self.config.lock_ttl)?
        else {
            info!("Settlement for {} skipped: lock held", league.unwrap_or("all leagues"));
            return Ok(SettlementReport::skipped());
        };

        let now = Utc::now();
        let (clv_updates, clv_failures) = self.backfill_closing_lines(league, limit, now)?;
        let (graded, grade_failures) = self.grade_pending(league, limit, now)?;
        let report = SettlementReport {
            status: JobStatus::Completed,
            graded,
            clv_updates,
            failures: clv_failures + grade_failures,
        };
        info!(
            "Settlement {}: {} graded, {} closing lines, {} failures",
            league.unwrap_or("all"),
            report.graded,
            report.clv_updates,
            report.failures
        );
        Ok(report)
    }

    /// Record closing line and CLV for picks whose event has started.
    /// Picks left without one are counted so they queue behind the rest.
    /// Returns (updated, failed).
    pub fn backfill_closing_lines(
        &self,
        league: Option<&str>,
        limit: Option<usize>,
        now: DateTime<Utc>,
    ) -> Result<(usize, usize)> {
        let rows = self.repo.picks_missing_closing_line(
            now,
            now - self.config.clv_lookback,
            league,
            limit,
        )?;
        let mut updated = 0;
        let mut failed = 0;
        for (pick, event) in rows {
            match self.record_close(&pick, &event, now) {
                Ok(true) => {
                    updated += 1;
                    continue;
                }
                Ok(false) => {}
                Err(e) => {
                    error!("Closing line for pick {:?} failed: {:#}", pick.id, e);
                    failed += 1;
                }
            }
            if let Some(pick_id) = pick.id {
                if let Err(e) = self.repo.record_closing_line_miss(pick_id) {
                    warn!("Could not count closing line miss for pick {}: {:#}", pick_id, e);
                }
            }
        }
        Ok((updated, failed))
    }

    fn record_close(&self, pick: &Pick, event: &Event, now: DateTime<Utc>) -> Result<bool> {
        let pick_id = pick.id.ok_or_else(|| anyhow!("pick has no id"))?;
        let Some(close) =
            self.odds
                .closing_line(event.id, pick.market_type, pick.side, event.start_time)?
        else {
            debug!("No pre-start quotes for pick {} on event {}", pick_id, event.id);
            return Ok(false);
        };
        let clv = compute_clv(
            pick.market_type,
            pick.side,
            pick.reference_line(),
            pick.reference_price(),
            close.line,
            close.price,
        );
        if clv.is_none() {
            warn!("Pick {} has no usable reference for CLV", pick_id);
        }
        self.repo
            .record_closing_line(pick_id, close.line, close.price, clv, now)
    }

    /// Grade pending picks on finalized events. A pick that cannot be graded
    /// keeps its error and moves behind the others. Returns (graded, failed).
    pub fn grade_pending(
        &self,
        league: Option<&str>,
        limit: Option<usize>,
        now: DateTime<Utc>,
    ) -> Result<(usize, usize)> {
        let candidates = self.repo.pending_picks_on_final_events(league, limit)?;
        let mut graded = 0;
        let mut failed = 0;
        for candidate in candidates {
            let Some(pick_id) = candidate.pick.id else {
                failed += 1;
                continue;
            };
            let outcome = match grade_pick(&candidate.pick, &candidate.result) {
                Ok(outcome) => outcome,
                Err(e) => {
                    error!("Pick {} not graded: {}", pick_id, e);
                    if let Err(write_err) = self.repo.record_grade_failure(pick_id, &e.to_string()) {
                        warn!("Could not record grade failure for pick {}: {:#}", pick_id, write_err);
                    }
                    failed += 1;
                    continue;
                }
            };
            match self.repo.record_pick_grade(pick_id, outcome, now) {
                Ok(true) => {
                    debug!("Pick {} graded {}", pick_id, outcome);
                    graded += 1;
                }
                Ok(false) => debug!("Pick {} already graded", pick_id),
                Err(e) => {
                    error!("Writing grade for pick {} failed: {:#}", pick_id, e);
                    failed += 1;
                }
            }
        }
        Ok((graded, failed))
    }

    /// Attach events to picks recorded by matchup only. Picks that keep
    /// failing are quarantined.
    pub fn resolve_pending_picks(&self, limit: Option<usize>) -> Result<PickResolutionReport> {
        let mut report = PickResolutionReport::default();
        for pick in self.repo.picks_awaiting_event(limit)? {
            match self.resolve_pick(&pick) {
                Ok(PickStep::Attached) => report.attached += 1,
                Ok(PickStep::Unresolved) => report.unresolved += 1,
                Ok(PickStep::Quarantined) => report.quarantined += 1,
                Err(e) => error!("Resolving pick {:?} failed: {:#}", pick.id, e),
            }
        }
        if report != PickResolutionReport::default() {
            info!(
                "Pick resolution: {} attached, {} unresolved, {} quarantined",
                report.attached, report.unresolved, report.quarantined
            );
        }
        Ok(report)
    }

    fn resolve_pick(&self, pick: &Pick) -> Result<PickStep> {
        let pick_id = pick.id.ok_or_else(|| anyhow!("pick has no id"))?;
        let resolution = match pick.kickoff {
            Some(kickoff) => {
                self.events
                    .match_by_names(&pick.league, &pick.home_name, &pick.away_name, kickoff)?
            }
            None => Resolution::Unresolved(UnresolvedReason::NoCandidate),
        };

        match resolution {
            Resolution::Resolved(event_id) => {
                let event = self
                    .repo
                    .get_event(event_id)?
                    .ok_or_else(|| anyhow!("event {} vanished", event_id))?;
                let side = if self
                    .events
                    .names_swapped(&event, &pick.home_name, &pick.away_name)?
                {
                    pick.side.swap_home_away()
                } else {
                    pick.side
                };
                self.repo.attach_pick_event(pick_id, event_id, side)?;
                Ok(PickStep::Attached)
            }
            Resolution::Unresolved(reason) => {
                let quarantined = self
                    .repo
                    .record_pick_resolution_failure(pick_id, self.config.max_resolution_attempts)?;
                if quarantined {
                    warn!(
                        "Pick {} ({} @ {}) quarantined: {}",
                        pick_id,
                        pick.away_name,
                        pick.home_name,
                        reason.as_str()
                    );
                    Ok(PickStep::Quarantined)
                } else {
                    Ok(PickStep::Unresolved)
                }
            }
        }
    }
}

enum PickStep {
    Attached,
    Unresolved,
    Quarantined,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::TtlCache;
    use crate::db::models::{MarketType, PickOutcome, Side, TeamId};
    use crate::db::Database;
    use crate::identity::{EventObservation, IdentityResolver, MappingKey};
    use crate::odds::SnapshotObservation;
    use approx::assert_relative_eq;
    use chrono::SubsecRound;

    struct Fixture {
        db: Arc<Database>,
        engine: SettlementEngine,
        odds: Arc<OddsStore>,
        event_id: EventId,
        start: DateTime<Utc>,
    }

    fn fixture() -> Fixture {
        let db = Arc::new(Database::open_in_memory().unwrap());
        let cache: Arc<TtlCache<MappingKey, TeamId>> =
            Arc::new(TtlCache::new(std::time::Duration::from_secs(60), 100));
        let identity = Arc::new(IdentityResolver::new(db.clone(), cache));
        let events = Arc::new(EventResolver::new(
            db.clone(),
            identity.clone(),
            Duration::hours(6),
        ));
        let odds = Arc::new(OddsStore::new(db.clone(), Duration::minutes(15)));
        let start = (Utc::now() - Duration::hours(3)).trunc_subsecs(0);

        let duke = identity
            .resolve_or_create_team("NCAAM", "espn", "150", "Duke", None)
            .unwrap();
        let unc = identity
            .resolve_or_create_team("NCAAM", "espn", "153", "UNC", None)
            .unwrap();
        let event_id = events
            .resolve_or_create_event(&EventObservation {
                provider: "espn".into(),
                provider_event_id: "401".into(),
                league: "NCAAM".into(),
                start_time: start,
                home_team_id: Some(duke),
                away_team_id: Some(unc),
                status: EventStatus::Scheduled,
                result: None,
            })
            .unwrap()
            .unwrap();

        let engine = SettlementEngine::new(
            db.clone(),
            odds.clone(),
            events,
            SettlementConfig {
                max_resolution_attempts: 2,
                ..SettlementConfig::default()
            },
        );
        Fixture {
            db,
            engine,
            odds,
            event_id,
            start,
        }
    }

    impl Fixture {
        fn pick(&self, market_type: MarketType, side: Side, line: Option<f64>) -> Pick {
            Pick {
                id: None,
                league: "NCAAM".into(),
                event_id: Some(self.event_id),
                home_name: "Duke".into(),
                away_name: "UNC".into(),
                kickoff: Some(self.start),
                market_type,
                side,
                line,
                price: -110.0,
                open_line: line,
                open_price: None,
                outcome: PickOutcome::Pending,
                closing_line: None,
                closing_price: None,
                clv: None,
                clv_recorded_at: None,
                placed_at: self.start - Duration::days(1),
                graded_at: None,
                resolution_attempts: 0,
                quarantined: false,
            }
        }

        fn final_score(&self, home: i32, away: i32) {
            self.engine
                .ingest_result(
                    self.event_id,
                    &ScoreUpdate {
                        home_score: home,
                        away_score: away,
                        is_final: true,
                        period: Some("Final".into()),
                    },
                )
                .unwrap();
        }

        fn quote(&self, book: &str, minutes_before: i64, line: f64) -> SnapshotObservation {
            SnapshotObservation {
                event_id: self.event_id,
                book: book.into(),
                market_type: MarketType::Spread,
                side: Side::Home,
                line: Some(line),
                price: Some(-110.0),
                captured_at: self.start - Duration::minutes(minutes_before),
            }
        }
    }

    #[test]
    fn test_pick_graded_exactly_once() {
        let f = fixture();
        let pick_id = f
            .db
            .insert_pick(&f.pick(MarketType::Spread, Side::Home, Some(-5.5)))
            .unwrap();
        f.final_score(80, 73);

        let first = f.engine.run_settlement_cycle(Some("NCAAM"), None).unwrap();
        assert_eq!(first.status, JobStatus::Completed);
        assert_eq!(first.graded, 1);
        let second = f.engine.run_settlement_cycle(Some("NCAAM"), None).unwrap();
        assert_eq!(second.graded, 0);

        let pick = f.db.get_pick(pick_id).unwrap().unwrap();
        assert_eq!(pick.outcome, PickOutcome::Won);
        assert!(pick.graded_at.is_some());
        assert_eq!(
            f.db.get_event(f.event_id).unwrap().unwrap().status,
            EventStatus::Final
        );
    }

    #[test]
    fn test_not_final_is_left_pending() {
        let f = fixture();
        let pick_id = f
            .db
            .insert_pick(&f.pick(MarketType::Moneyline, Side::Home, None))
            .unwrap();
        f.engine
            .ingest_result(
                f.event_id,
                &ScoreUpdate {
                    home_score: 40,
                    away_score: 38,
                    is_final: false,
                    period: Some("2nd Half".into()),
                },
            )
            .unwrap();
        let report = f.engine.run_settlement_cycle(None, None).unwrap();
        assert_eq!(report.graded, 0);
        assert_eq!(
            f.db.get_pick(pick_id).unwrap().unwrap().outcome,
            PickOutcome::Pending
        );
    }

    #[test]
    fn test_malformed_pick_does_not_block_batch() {
        let f = fixture();
        let bad = f
            .db
            .insert_pick(&f.pick(MarketType::Spread, Side::Home, None))
            .unwrap();
        let good = f
            .db
            .insert_pick(&f.pick(MarketType::Total, Side::Over, Some(145.0)))
            .unwrap();
        f.final_score(80, 66);

        let report = f.engine.run_settlement_cycle(None, None).unwrap();
        assert_eq!(report.graded, 1);
        assert_eq!(report.failures, 1);
        assert_eq!(
            f.db.get_pick(bad).unwrap().unwrap().outcome,
            PickOutcome::Pending
        );
        assert_eq!(
            f.db.get_pick(good).unwrap().unwrap().outcome,
            PickOutcome::Won
        );
    }

    #[test]
    fn test_failing_pick_moves_behind_gradable_ones() {
        let f = fixture();
        let bad = f
            .db
            .insert_pick(&f.pick(MarketType::Spread, Side::Home, None))
            .unwrap();
        let good = f
            .db
            .insert_pick(&f.pick(MarketType::Total, Side::Over, Some(145.0)))
            .unwrap();
        f.final_score(80, 66);

        let first = f.engine.run_settlement_cycle(None, Some(1)).unwrap();
        assert_eq!((first.graded, first.failures), (0, 1));
        let second = f.engine.run_settlement_cycle(None, Some(1)).unwrap();
        assert_eq!(second.graded, 1);
        assert_eq!(
            f.db.get_pick(good).unwrap().unwrap().outcome,
            PickOutcome::Won
        );
        assert_eq!(
            f.db.get_pick(bad).unwrap().unwrap().outcome,
            PickOutcome::Pending
        );
    }

    #[test]
    fn test_pick_without_closing_quotes_moves_behind_others() {
        let f = fixture();
        let no_quotes = f
            .db
            .insert_pick(&f.pick(MarketType::Moneyline, Side::Home, None))
            .unwrap();
        let spread = f
            .db
            .insert_pick(&f.pick(MarketType::Spread, Side::Home, Some(-3.0)))
            .unwrap();
        f.odds
            .store_snapshots(&[f.quote("pinnacle", 5, -5.0)])
            .unwrap();

        let first = f.engine.run_settlement_cycle(None, Some(1)).unwrap();
        assert_eq!(first.clv_updates, 0);
        let second = f.engine.run_settlement_cycle(None, Some(1)).unwrap();
        assert_eq!(second.clv_updates, 1);
        assert_eq!(
            f.db.get_pick(spread).unwrap().unwrap().closing_line,
            Some(-5.0)
        );
        assert!(f.db.get_pick(no_quotes).unwrap().unwrap().clv_recorded_at.is_none());
    }

    #[test]
    fn test_closing_line_recorded_once() {
        let f = fixture();
        let mut pick = f.pick(MarketType::Spread, Side::Home, Some(-3.0));
        pick.line = Some(-4.0);
        let pick_id = f.db.insert_pick(&pick).unwrap();
        f.odds
            .store_snapshots(&[
                f.quote("draftkings", 60, -4.5),
                f.quote("pinnacle", 5, -5.0),
                f.quote("pinnacle", -30, -8.0),
            ])
            .unwrap();

        let report = f.engine.run_settlement_cycle(None, None).unwrap();
        assert_eq!(report.clv_updates, 1);
        let stored = f.db.get_pick(pick_id).unwrap().unwrap();
        assert_eq!(stored.closing_line, Some(-5.0));
        assert_relative_eq!(stored.clv.unwrap(), 2.0);

        f.odds
            .store_snapshots(&[f.quote("circa", 1, -6.0)])
            .unwrap();
        let again = f.engine.run_settlement_cycle(None, None).unwrap();
        assert_eq!(again.clv_updates, 0);
        assert_eq!(
            f.db.get_pick(pick_id).unwrap().unwrap().closing_line,
            Some(-5.0)
        );
    }

    #[test]
    fn test_cycle_skipped_while_locked() {
        let f = fixture();
        let _held = JobLock::try_acquire(f.db.clone(), "settlement:NCAAM", Duration::minutes(5))
            .unwrap()
            .unwrap();
        let report = f.engine.run_settlement_cycle(Some("NCAAM"), None).unwrap();
        assert_eq!(report.status, JobStatus::Skipped);
    }

    #[test]
    fn test_resolve_pending_picks_attaches_and_flips_side() {
        let f = fixture();
        let mut pick = f.pick(MarketType::Spread, Side::Home, Some(3.5));
        pick.event_id = None;
        pick.home_name = "North Carolina UNC".into();
        pick.away_name = "Duke Blue Devils".into();
        let pick_id = f.db.insert_pick(&pick).unwrap();

        let report = f.engine.resolve_pending_picks(None).unwrap();
        assert_eq!(report.attached, 1);
        let stored = f.db.get_pick(pick_id).unwrap().unwrap();
        assert_eq!(stored.event_id, Some(f.event_id));
        assert_eq!(stored.side, Side::Away);
    }

    #[test]
    fn test_unresolvable_pick_is_quarantined() {
        let f = fixture();
        let mut pick = f.pick(MarketType::Moneyline, Side::Home, None);
        pick.event_id = None;
        pick.home_name = "Gonzaga".into();
        pick.away_name = "Baylor".into();
        let pick_id = f.db.insert_pick(&pick).unwrap();

        assert_eq!(f.engine.resolve_pending_picks(None).unwrap().unresolved, 1);
        assert_eq!(f.engine.resolve_pending_picks(None).unwrap().quarantined, 1);
        // Quarantined picks are no longer retried.
        assert_eq!(
            f.engine.resolve_pending_picks(None).unwrap(),
            PickResolutionReport::default()
        );
        let stored = f.db.get_pick(pick_id).unwrap().unwrap();
        assert!(stored.quarantined);
        assert_eq!(stored.resolution_attempts, 2);
    }
}
