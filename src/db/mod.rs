use anyhow::{anyhow, Result};
use chrono::{DateTime, Duration, Utc};
use rusqlite::{params, Connection, OptionalExtension, TransactionBehavior};
use std::sync::{Arc, Mutex, MutexGuard};
use tracing::info;

pub mod models;

use models::*;

/// Line value written for line-less (moneyline) quotes so the snapshot
/// uniqueness key still applies. Reads convert it back to `None`.
pub const MONEYLINE_LINE_SENTINEL: f64 = 0.0;

/// Storage interface for the resolution, odds and settlement pipeline.
///
/// Every write is either an insert that ignores conflicts on a natural key or
/// an upsert, so overlapping jobs converge on the same rows. Callers never see
/// SQL; `Database` is the SQLite implementation.
pub trait Repository: Send + Sync {
    // ── Teams ────────────────────────────────────────────────────────────────

    fn find_team_mapping(
        &self,
        provider: &str,
        provider_team_id: &str,
        league: &str,
    ) -> Result<Option<TeamProviderMapping>>;

    /// Refresh the cached provider display name on an existing mapping.
    fn refresh_team_mapping_name(
        &self,
        provider: &str,
        provider_team_id: &str,
        league: &str,
        raw_name: &str,
    ) -> Result<()>;

    fn get_team(&self, team_id: TeamId) -> Result<Option<Team>>;

    /// All names teams in `league` are known by.
    fn team_aliases(&self, league: &str) -> Result<Vec<TeamAlias>>;

    fn count_teams(&self, league: &str) -> Result<i64>;

    /// Team ids `provider` already has a mapping for in `league`.
    fn teams_mapped_by_provider(&self, league: &str, provider: &str) -> Result<Vec<TeamId>>;

    /// Map a provider team onto an existing team. If another writer already
    /// created the mapping, returns the team id that mapping points at.
    fn link_team_provider(
        &self,
        team_id: TeamId,
        provider: &str,
        provider_team_id: &str,
        league: &str,
        raw_name: &str,
    ) -> Result<TeamId>;

    /// Create a canonical team and its provider mapping in one transaction.
    /// If the mapping already exists, no team is created and the mapped team
    /// id is returned.
    fn create_team_with_mapping(
        &self,
        league: &str,
        display_name: &str,
        abbreviation: Option<&str>,
        provider: &str,
        provider_team_id: &str,
    ) -> Result<TeamId>;

    // ── Events ───────────────────────────────────────────────────────────────

    fn find_event_mapping(
        &self,
        provider: &str,
        provider_event_id: &str,
    ) -> Result<Option<EventProviderMapping>>;

    /// Exact lookup on the canonical natural key.
    fn find_event_by_key(
        &self,
        league: &str,
        home_team_id: TeamId,
        away_team_id: TeamId,
        start_time: DateTime<Utc>,
    ) -> Result<Option<Event>>;

    /// Events for this exact pairing whose start lies in `[from, to]`.
    fn find_events_by_teams(
        &self,
        league: &str,
        home_team_id: TeamId,
        away_team_id: TeamId,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> Result<Vec<Event>>;

    fn events_in_window(
        &self,
        league: &str,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> Result<Vec<Event>>;

    fn get_event(&self, event_id: EventId) -> Result<Option<Event>>;

    fn count_events(&self, league: &str) -> Result<i64>;

    /// Attach a provider event id to an event. `swapped` records that the
    /// provider lists the teams home/away reversed. Returns false when the
    /// mapping (or a mapping for this event and provider) already exists.
    fn link_event_provider(
        &self,
        event_id: EventId,
        provider: &str,
        provider_event_id: &str,
        swapped: bool,
    ) -> Result<bool>;

    /// Create an event and its provider mapping in one transaction. Converges
    /// on the existing event when the mapping or the natural key already exists.
    fn create_event_with_mapping(
        &self,
        event: &NewEvent,
        provider: &str,
        provider_event_id: &str,
    ) -> Result<EventId>;

    /// Update status and optionally start time. A final event keeps its
    /// status and start time.
    fn update_event_state(
        &self,
        event_id: EventId,
        status: EventStatus,
        start_time: Option<DateTime<Utc>>,
    ) -> Result<()>;

    // ── Results ──────────────────────────────────────────────────────────────

    /// Idempotent upsert. Never clears `is_final`; a non-final write against a
    /// finalized row is ignored.
    fn upsert_game_result(&self, result: &GameResult) -> Result<()>;

    /// Overwrite a result unconditionally, including the final flag.
    fn correct_game_result(&self, result: &GameResult) -> Result<()>;

    fn get_game_result(&self, event_id: EventId) -> Result<Option<GameResult>>;

    // ── Odds ─────────────────────────────────────────────────────────────────

    /// Insert snapshots, ignoring rows whose key already exists. Returns the
    /// number of rows actually written.
    fn insert_snapshots(&self, snapshots: &[OddsSnapshot]) -> Result<usize>;

    /// Full history for an event ordered by capture time.
    fn snapshots_for_event(&self, event_id: EventId) -> Result<Vec<OddsSnapshot>>;

    fn snapshots_for_market(
        &self,
        event_id: EventId,
        market_type: MarketType,
        side: Option<Side>,
        captured_at_or_before: Option<DateTime<Utc>>,
    ) -> Result<Vec<OddsSnapshot>>;

    // ── Picks ────────────────────────────────────────────────────────────────

    fn insert_pick(&self, pick: &Pick) -> Result<PickId>;

    fn get_pick(&self, pick_id: PickId) -> Result<Option<Pick>>;

    /// Picks with no event yet that are not quarantined.
    fn picks_awaiting_event(&self, limit: Option<usize>) -> Result<Vec<Pick>>;

    /// Attach a resolved event. `side` is rewritten in the event's
    /// orientation (home/away flip when the pick named the teams swapped).
    fn attach_pick_event(&self, pick_id: PickId, event_id: EventId, side: Side) -> Result<()>;

    /// Count a failed resolution attempt. Returns true when the pick is now
    /// quarantined.
    fn record_pick_resolution_failure(&self, pick_id: PickId, max_attempts: u32) -> Result<bool>;

    /// Pending picks on final events. Picks that failed grading before come
    /// last, fewest failures first.
    fn pending_picks_on_final_events(
        &self,
        league: Option<&str>,
        limit: Option<usize>,
    ) -> Result<Vec<GradingCandidate>>;

    /// Picks with no closing line whose event started in `[started_after, now]`.
    /// Picks already tried without success come last.
    fn picks_missing_closing_line(
        &self,
        now: DateTime<Utc>,
        started_after: DateTime<Utc>,
        league: Option<&str>,
        limit: Option<usize>,
    ) -> Result<Vec<(Pick, Event)>>;

    /// Write a grade only if the pick is still pending.
    fn record_pick_grade(
        &self,
        pick_id: PickId,
        outcome: PickOutcome,
        graded_at: DateTime<Utc>,
    ) -> Result<bool>;

    /// Count a failed grading attempt and keep the reason.
    fn record_grade_failure(&self, pick_id: PickId, error: &str) -> Result<()>;

    /// Count a closing-line attempt that found nothing to record.
    fn record_closing_line_miss(&self, pick_id: PickId) -> Result<()>;

    /// Write closing line and CLV only if none was recorded yet.
    fn record_closing_line(
        &self,
        pick_id: PickId,
        closing_line: Option<f64>,
        closing_price: f64,
        clv: Option<f64>,
        recorded_at: DateTime<Utc>,
    ) -> Result<bool>;

    // ── Ingestion audit ──────────────────────────────────────────────────────

    fn start_ingestion_run(&self, provider: &str, league: &str, kind: &str) -> Result<i64>;

    fn finish_ingestion_run(&self, run_id: i64, outcome: &RunOutcome) -> Result<()>;

    fn recent_ingestion_runs(&self, limit: usize) -> Result<Vec<IngestionRun>>;

    fn record_unresolved(&self, sighting: &UnresolvedSighting) -> Result<()>;

    fn clear_unresolved(&self, kind: &str, provider: &str, provider_key: &str) -> Result<()>;

    fn list_unresolved(&self, limit: usize) -> Result<Vec<UnresolvedSighting>>;

    // ── Job locks ────────────────────────────────────────────────────────────

    /// Take the named lock unless another owner holds an unexpired one.
    fn try_acquire_lock(&self, name: &str, owner: &str, ttl: Duration) -> Result<bool>;

    fn release_lock(&self, name: &str, owner: &str) -> Result<()>;
}

/// Thread-safe SQLite connection pool (single connection with mutex)
#[derive(Clone)]
pub struct Database {
    conn: Arc<Mutex<Connection>>,
}

impl Database {
    /// Open (or create) the SQLite database at the given path
    pub fn open(path: &str) -> Result<Self> {
        let conn = Connection::open(path)?;
        conn.execute_batch("PRAGMA journal_mode=WAL; PRAGMA foreign_keys=ON;")?;
        Self::from_connection(conn)
    }

    /// Private in-memory database, used by tests and dry runs.
    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        conn.execute_batch("PRAGMA foreign_keys=ON;")?;
        Self::from_connection(conn)
    }

    /// Wrap an already-open connection and bring its schema up to date.
    pub(crate) fn from_connection(conn: Connection) -> Result<Self> {
        let db = Database {
            conn: Arc::new(Mutex::new(conn)),
        };
        db.run_migrations()?;
        Ok(db)
    }

    /// Run schema migrations (idempotent)
    fn run_migrations(&self) -> Result<()> {
        let conn = self.conn()?;
        conn.execute_batch(SCHEMA_SQL)?;
        for (table, column, definition) in ADDED_COLUMNS {
            if !has_column(&conn, table, column)? {
                conn.execute_batch(&format!(
                    "ALTER TABLE {} ADD COLUMN {} {};",
                    table, column, definition
                ))?;
                info!("Added column {}.{}", table, column);
            }
        }
        Ok(())
    }

    fn conn(&self) -> Result<MutexGuard<'_, Connection>> {
        self.conn
            .lock()
            .map_err(|_| anyhow!("database connection mutex poisoned"))
    }
}

impl Repository for Database {
    // ── Teams ────────────────────────────────────────────────────────────────

    fn find_team_mapping(
        &self,
        provider: &str,
        provider_team_id: &str,
        league: &str,
    ) -> Result<Option<TeamProviderMapping>> {
        let conn = self.conn()?;
        let mapping = conn
            .query_row(
                "SELECT provider, provider_team_id, league, team_id, raw_name, updated_at
                 FROM team_provider_mappings
                 WHERE provider=?1 AND provider_team_id=?2 AND league=?3",
                params![provider, provider_team_id, league],
                map_team_mapping,
            )
            .optional()?;
        Ok(mapping)
    }

    fn refresh_team_mapping_name(
        &self,
        provider: &str,
        provider_team_id: &str,
        league: &str,
        raw_name: &str,
    ) -> Result<()> {
        let conn = self.conn()?;
        conn.execute(
            "UPDATE team_provider_mappings SET raw_name=?4, updated_at=?5
             WHERE provider=?1 AND provider_team_id=?2 AND league=?3 AND raw_name != ?4",
            params![provider, provider_team_id, league, raw_name, Utc::now()],
        )?;
        Ok(())
    }

    fn get_team(&self, team_id: TeamId) -> Result<Option<Team>> {
        let conn = self.conn()?;
        let team = conn
            .query_row(
                "SELECT id, league, display_name, abbreviation, created_at
                 FROM teams WHERE id=?1",
                params![team_id],
                map_team,
            )
            .optional()?;
        Ok(team)
    }

    fn team_aliases(&self, league: &str) -> Result<Vec<TeamAlias>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(
            "SELECT id, display_name FROM teams WHERE league=?1
             UNION
             SELECT team_id, raw_name FROM team_provider_mappings WHERE league=?1",
        )?;
        let aliases = stmt
            .query_map(params![league], |row| {
                Ok(TeamAlias {
                    team_id: row.get(0)?,
                    alias: row.get(1)?,
                })
            })?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(aliases)
    }

    fn count_teams(&self, league: &str) -> Result<i64> {
        let conn = self.conn()?;
        let count = conn.query_row(
            "SELECT COUNT(*) FROM teams WHERE league=?1",
            params![league],
            |r| r.get(0),
        )?;
        Ok(count)
    }

    fn teams_mapped_by_provider(&self, league: &str, provider: &str) -> Result<Vec<TeamId>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(
            "SELECT DISTINCT team_id FROM team_provider_mappings WHERE league=?1 AND provider=?2",
        )?;
        let ids = stmt
            .query_map(params![league, provider], |r| r.get(0))?
            .collect::<rusqlite::Result<Vec<TeamId>>>()?;
        Ok(ids)
    }

    fn link_team_provider(
        &self,
        team_id: TeamId,
        provider: &str,
        provider_team_id: &str,
        league: &str,
        raw_name: &str,
    ) -> Result<TeamId> {
        let conn = self.conn()?;
        conn.execute(
            "INSERT INTO team_provider_mappings
                (provider, provider_team_id, league, team_id, raw_name, updated_at)
             VALUES (?1,?2,?3,?4,?5,?6)
             ON CONFLICT(provider, provider_team_id, league) DO NOTHING",
            params![provider, provider_team_id, league, team_id, raw_name, Utc::now()],
        )?;
        let mapped: TeamId = conn.query_row(
            "SELECT team_id FROM team_provider_mappings
             WHERE provider=?1 AND provider_team_id=?2 AND league=?3",
            params![provider, provider_team_id, league],
            |r| r.get(0),
        )?;
        Ok(mapped)
    }

    fn create_team_with_mapping(
        &self,
        league: &str,
        display_name: &str,
        abbreviation: Option<&str>,
        provider: &str,
        provider_team_id: &str,
    ) -> Result<TeamId> {
        let mut conn = self.conn()?;
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
        let existing: Option<TeamId> = tx
            .query_row(
                "SELECT team_id FROM team_provider_mappings
                 WHERE provider=?1 AND provider_team_id=?2 AND league=?3",
                params![provider, provider_team_id, league],
                |r| r.get(0),
            )
            .optional()?;
        if let Some(team_id) = existing {
            tx.commit()?;
            return Ok(team_id);
        }

        let now = Utc::now();
        tx.execute(
            "INSERT INTO teams (league, display_name, abbreviation, created_at)
             VALUES (?1,?2,?3,?4)",
            params![league, display_name, abbreviation, now],
        )?;
        let team_id = tx.last_insert_rowid();
        tx.execute(
            "INSERT INTO team_provider_mappings
                (provider, provider_team_id, league, team_id, raw_name, updated_at)
             VALUES (?1,?2,?3,?4,?5,?6)",
            params![provider, provider_team_id, league, team_id, display_name, now],
        )?;
        tx.commit()?;
        Ok(team_id)
    }

    // ── Events ───────────────────────────────────────────────────────────────

    fn find_event_mapping(
        &self,
        provider: &str,
        provider_event_id: &str,
    ) -> Result<Option<EventProviderMapping>> {
        let conn = self.conn()?;
        let mapping = conn
            .query_row(
                "SELECT provider, provider_event_id, event_id, swapped, created_at
                 FROM event_provider_mappings
                 WHERE provider=?1 AND provider_event_id=?2",
                params![provider, provider_event_id],
                |row| {
                    Ok(EventProviderMapping {
                        provider: row.get(0)?,
                        provider_event_id: row.get(1)?,
                        event_id: row.get(2)?,
                        swapped: row.get(3)?,
                        created_at: row.get(4)?,
                    })
                },
            )
            .optional()?;
        Ok(mapping)
    }

    fn find_event_by_key(
        &self,
        league: &str,
        home_team_id: TeamId,
        away_team_id: TeamId,
        start_time: DateTime<Utc>,
    ) -> Result<Option<Event>> {
        let conn = self.conn()?;
        let sql = format!(
            "SELECT {EVENT_COLUMNS} FROM events e
             WHERE e.league=?1 AND e.home_team_id=?2 AND e.away_team_id=?3 AND e.start_time=?4"
        );
        let event = conn
            .query_row(
                &sql,
                params![league, home_team_id, away_team_id, start_time],
                |row| map_event(row, 0),
            )
            .optional()?;
        Ok(event)
    }

    fn find_events_by_teams(
        &self,
        league: &str,
        home_team_id: TeamId,
        away_team_id: TeamId,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> Result<Vec<Event>> {
        let conn = self.conn()?;
        let sql = format!(
            "SELECT {EVENT_COLUMNS} FROM events e
             WHERE e.league=?1 AND e.home_team_id=?2 AND e.away_team_id=?3
               AND e.start_time >= ?4 AND e.start_time <= ?5
             ORDER BY e.start_time"
        );
        let mut stmt = conn.prepare(&sql)?;
        let events = stmt
            .query_map(params![league, home_team_id, away_team_id, from, to], |row| {
                map_event(row, 0)
            })?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(events)
    }

    fn events_in_window(
        &self,
        league: &str,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> Result<Vec<Event>> {
        let conn = self.conn()?;
        let sql = format!(
            "SELECT {EVENT_COLUMNS} FROM events e
             WHERE e.league=?1 AND e.start_time >= ?2 AND e.start_time <= ?3
             ORDER BY e.start_time"
        );
        let mut stmt = conn.prepare(&sql)?;
        let events = stmt
            .query_map(params![league, from, to], |row| map_event(row, 0))?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(events)
    }

    fn get_event(&self, event_id: EventId) -> Result<Option<Event>> {
        let conn = self.conn()?;
        let sql = format!("SELECT {EVENT_COLUMNS} FROM events e WHERE e.id=?1");
        let event = conn
            .query_row(&sql, params![event_id], |row| map_event(row, 0))
            .optional()?;
        Ok(event)
    }

    fn count_events(&self, league: &str) -> Result<i64> {
        let conn = self.conn()?;
        let count = conn.query_row(
            "SELECT COUNT(*) FROM events WHERE league=?1",
            params![league],
            |r| r.get(0),
        )?;
        Ok(count)
    }

    fn link_event_provider(
        &self,
        event_id: EventId,
        provider: &str,
        provider_event_id: &str,
        swapped: bool,
    ) -> Result<bool> {
        let conn = self.conn()?;
        let inserted = conn.execute(
            "INSERT OR IGNORE INTO event_provider_mappings
                (provider, provider_event_id, event_id, swapped, created_at)
             VALUES (?1,?2,?3,?4,?5)",
            params![provider, provider_event_id, event_id, swapped, Utc::now()],
        )?;
        Ok(inserted == 1)
    }

    fn create_event_with_mapping(
        &self,
        event: &NewEvent,
        provider: &str,
        provider_event_id: &str,
    ) -> Result<EventId> {
        let mut conn = self.conn()?;
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
        let mapped: Option<EventId> = tx
            .query_row(
                "SELECT event_id FROM event_provider_mappings
                 WHERE provider=?1 AND provider_event_id=?2",
                params![provider, provider_event_id],
                |r| r.get(0),
            )
            .optional()?;
        if let Some(event_id) = mapped {
            tx.commit()?;
            return Ok(event_id);
        }

        let now = Utc::now();
        let inserted = tx.execute(
            "INSERT INTO events (league, season, start_time, home_team_id, away_team_id,
                                 home_name, away_name, status, updated_at)
             VALUES (?1,?2,?3,?4,?5,?6,?7,?8,?9)
             ON CONFLICT(league, home_team_id, away_team_id, start_time) DO NOTHING",
            params![
                event.league,
                event.season,
                event.start_time,
                event.home_team_id,
                event.away_team_id,
                event.home_name,
                event.away_name,
                event.status,
                now,
            ],
        )?;
        let event_id: EventId = if inserted == 1 {
            tx.last_insert_rowid()
        } else {
            tx.query_row(
                "SELECT id FROM events
                 WHERE league=?1 AND home_team_id=?2 AND away_team_id=?3 AND start_time=?4",
                params![
                    event.league,
                    event.home_team_id,
                    event.away_team_id,
                    event.start_time
                ],
                |r| r.get(0),
            )?
        };
        tx.execute(
            "INSERT OR IGNORE INTO event_provider_mappings
                (provider, provider_event_id, event_id, created_at)
             VALUES (?1,?2,?3,?4)",
            params![provider, provider_event_id, event_id, now],
        )?;
        tx.commit()?;
        Ok(event_id)
    }

    fn update_event_state(
        &self,
        event_id: EventId,
        status: EventStatus,
        start_time: Option<DateTime<Utc>>,
    ) -> Result<()> {
        let conn = self.conn()?;
        let now = Utc::now();
        if let Some(start) = start_time {
            // OR IGNORE: moving onto another event's natural key is skipped.
            conn.execute(
                "UPDATE OR IGNORE events SET start_time=?2, updated_at=?3
                 WHERE id=?1 AND status != 'final' AND start_time != ?2",
                params![event_id, start, now],
            )?;
        }
        conn.execute(
            "UPDATE events SET status=?2, updated_at=?3
             WHERE id=?1 AND status != 'final' AND status != ?2",
            params![event_id, status, now],
        )?;
        Ok(())
    }

    // ── Results ──────────────────────────────────────────────────────────────

    fn upsert_game_result(&self, result: &GameResult) -> Result<()> {
        let conn = self.conn()?;
        conn.execute(
            "INSERT INTO game_results (event_id, home_score, away_score, is_final, period, updated_at)
             VALUES (?1,?2,?3,?4,?5,?6)
             ON CONFLICT(event_id) DO UPDATE SET
                home_score=excluded.home_score,
                away_score=excluded.away_score,
                is_final=MAX(game_results.is_final, excluded.is_final),
                period=excluded.period,
                updated_at=excluded.updated_at
             WHERE game_results.is_final = 0 OR excluded.is_final = 1",
            params![
                result.event_id,
                result.home_score,
                result.away_score,
                result.is_final,
                result.period,
                result.updated_at,
            ],
        )?;
        Ok(())
    }

    fn correct_game_result(&self, result: &GameResult) -> Result<()> {
        let conn = self.conn()?;
        conn.execute(
            "INSERT INTO game_results (event_id, home_score, away_score, is_final, period, updated_at)
             VALUES (?1,?2,?3,?4,?5,?6)
             ON CONFLICT(event_id) DO UPDATE SET
                home_score=excluded.home_score,
                away_score=excluded.away_score,
                is_final=excluded.is_final,
                period=excluded.period,
                updated_at=excluded.updated_at",
            params![
                result.event_id,
                result.home_score,
                result.away_score,
                result.is_final,
                result.period,
                result.updated_at,
            ],
        )?;
        Ok(())
    }

    fn get_game_result(&self, event_id: EventId) -> Result<Option<GameResult>> {
        let conn = self.conn()?;
        let result = conn
            .query_row(
                "SELECT event_id, home_score, away_score, is_final, period, updated_at
                 FROM game_results WHERE event_id=?1",
                params![event_id],
                |row| map_game_result(row, 0),
            )
            .optional()?;
        Ok(result)
    }

    // ── Odds ─────────────────────────────────────────────────────────────────

    fn insert_snapshots(&self, snapshots: &[OddsSnapshot]) -> Result<usize> {
        if snapshots.is_empty() {
            return Ok(0);
        }
        let mut conn = self.conn()?;
        let tx = conn.transaction()?;
        let mut inserted = 0;
        {
            let mut stmt = tx.prepare_cached(
                "INSERT OR IGNORE INTO odds_snapshots
                    (event_id, book, market_type, side, line, price, captured_at, captured_bucket)
                 VALUES (?1,?2,?3,?4,?5,?6,?7,?8)",
            )?;
            for snap in snapshots {
                inserted += stmt.execute(params![
                    snap.event_id,
                    snap.book,
                    snap.market_type,
                    snap.side,
                    snap.line.unwrap_or(MONEYLINE_LINE_SENTINEL),
                    snap.price,
                    snap.captured_at,
                    snap.captured_bucket.timestamp(),
                ])?;
            }
        }
        tx.commit()?;
        Ok(inserted)
    }

    fn snapshots_for_event(&self, event_id: EventId) -> Result<Vec<OddsSnapshot>> {
        let conn = self.conn()?;
        let sql = format!(
            "SELECT {SNAPSHOT_COLUMNS} FROM odds_snapshots s
             WHERE s.event_id=?1 ORDER BY s.captured_at, s.id"
        );
        let mut stmt = conn.prepare(&sql)?;
        let rows = stmt
            .query_map(params![event_id], map_snapshot)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(rows)
    }

    fn snapshots_for_market(
        &self,
        event_id: EventId,
        market_type: MarketType,
        side: Option<Side>,
        captured_at_or_before: Option<DateTime<Utc>>,
    ) -> Result<Vec<OddsSnapshot>> {
        let conn = self.conn()?;
        let sql = format!(
            "SELECT {SNAPSHOT_COLUMNS} FROM odds_snapshots s
             WHERE s.event_id=?1 AND s.market_type=?2
               AND (?3 IS NULL OR s.side=?3)
               AND (?4 IS NULL OR s.captured_at <= ?4)
             ORDER BY s.captured_at, s.id"
        );
        let mut stmt = conn.prepare(&sql)?;
        let rows = stmt
            .query_map(
                params![event_id, market_type, side, captured_at_or_before],
                map_snapshot,
            )?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(rows)
    }

    // ── Picks ────────────────────────────────────────────────────────────────

    fn insert_pick(&self, pick: &Pick) -> Result<PickId> {
        let conn = self.conn()?;
        conn.execute(
            "INSERT INTO picks (
                league, event_id, home_name, away_name, kickoff, market_type, side,
                line, price, open_line, open_price, outcome, closing_line, closing_price,
                clv, clv_recorded_at, placed_at, graded_at, resolution_attempts, quarantined
             ) VALUES (?1,?2,?3,?4,?5,?6,?7,?8,?9,?10,?11,?12,?13,?14,?15,?16,?17,?18,?19,?20)",
            params![
                pick.league,
                pick.event_id,
                pick.home_name,
                pick.away_name,
                pick.kickoff,
                pick.market_type,
                pick.side,
                pick.line,
                pick.price,
                pick.open_line,
                pick.open_price,
                pick.outcome,
                pick.closing_line,
                pick.closing_price,
                pick.clv,
                pick.clv_recorded_at,
                pick.placed_at,
                pick.graded_at,
                pick.resolution_attempts,
                pick.quarantined,
            ],
        )?;
        Ok(conn.last_insert_rowid())
    }

    fn get_pick(&self, pick_id: PickId) -> Result<Option<Pick>> {
        let conn = self.conn()?;
        let sql = format!("SELECT {PICK_COLUMNS} FROM picks p WHERE p.id=?1");
        let pick = conn
            .query_row(&sql, params![pick_id], |row| map_pick(row, 0))
            .optional()?;
        Ok(pick)
    }

    fn picks_awaiting_event(&self, limit: Option<usize>) -> Result<Vec<Pick>> {
        let conn = self.conn()?;
        let sql = format!(
            "SELECT {PICK_COLUMNS} FROM picks p
             WHERE p.event_id IS NULL AND p.quarantined = 0
             ORDER BY p.placed_at LIMIT ?1"
        );
        let mut stmt = conn.prepare(&sql)?;
        let picks = stmt
            .query_map(params![sql_limit(limit)], |row| map_pick(row, 0))?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(picks)
    }

    fn attach_pick_event(&self, pick_id: PickId, event_id: EventId, side: Side) -> Result<()> {
        let conn = self.conn()?;
        conn.execute(
            "UPDATE picks SET event_id=?2, side=?3 WHERE id=?1 AND event_id IS NULL",
            params![pick_id, event_id, side],
        )?;
        Ok(())
    }

    fn record_pick_resolution_failure(&self, pick_id: PickId, max_attempts: u32) -> Result<bool> {
        let conn = self.conn()?;
        conn.execute(
            "UPDATE picks SET
                resolution_attempts = resolution_attempts + 1,
                quarantined = CASE WHEN resolution_attempts + 1 >= ?2 THEN 1 ELSE quarantined END
             WHERE id=?1 AND event_id IS NULL",
            params![pick_id, max_attempts],
        )?;
        let quarantined: bool = conn.query_row(
            "SELECT quarantined FROM picks WHERE id=?1",
            params![pick_id],
            |r| r.get(0),
        )?;
        Ok(quarantined)
    }

    fn pending_picks_on_final_events(
        &self,
        league: Option<&str>,
        limit: Option<usize>,
    ) -> Result<Vec<GradingCandidate>> {
        let conn = self.conn()?;
        let sql = format!(
            "SELECT {PICK_COLUMNS}, {EVENT_COLUMNS},
                    r.event_id, r.home_score, r.away_score, r.is_final, r.period, r.updated_at
             FROM picks p
             JOIN events e ON e.id = p.event_id
             JOIN game_results r ON r.event_id = e.id
             WHERE p.outcome = 'PENDING' AND r.is_final = 1
               AND (?1 IS NULL OR p.league = ?1)
             ORDER BY p.grade_attempts, e.start_time, p.id
             LIMIT ?2"
        );
        let mut stmt = conn.prepare(&sql)?;
        let rows = stmt
            .query_map(params![league, sql_limit(limit)], |row| {
                Ok(GradingCandidate {
                    pick: map_pick(row, 0)?,
                    event: map_event(row, PICK_COLUMN_COUNT)?,
                    result: map_game_result(row, PICK_COLUMN_COUNT + EVENT_COLUMN_COUNT)?,
                })
            })?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(rows)
    }

    fn picks_missing_closing_line(
        &self,
        now: DateTime<Utc>,
        started_after: DateTime<Utc>,
        league: Option<&str>,
        limit: Option<usize>,
    ) -> Result<Vec<(Pick, Event)>> {
        let conn = self.conn()?;
        let sql = format!(
            "SELECT {PICK_COLUMNS}, {EVENT_COLUMNS}
             FROM picks p
             JOIN events e ON e.id = p.event_id
             WHERE p.clv_recorded_at IS NULL
               AND e.start_time <= ?1 AND e.start_time >= ?2
               AND (?3 IS NULL OR p.league = ?3)
             ORDER BY p.clv_attempts, e.start_time, p.id
             LIMIT ?4"
        );
        let mut stmt = conn.prepare(&sql)?;
        let rows = stmt
            .query_map(params![now, started_after, league, sql_limit(limit)], |row| {
                Ok((map_pick(row, 0)?, map_event(row, PICK_COLUMN_COUNT)?))
            })?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(rows)
    }

    fn record_pick_grade(
        &self,
        pick_id: PickId,
        outcome: PickOutcome,
        graded_at: DateTime<Utc>,
    ) -> Result<bool> {
        let conn = self.conn()?;
        let updated = conn.execute(
            "UPDATE picks SET outcome=?2, graded_at=?3 WHERE id=?1 AND outcome='PENDING'",
            params![pick_id, outcome, graded_at],
        )?;
        Ok(updated == 1)
    }

    fn record_grade_failure(&self, pick_id: PickId, error: &str) -> Result<()> {
        let conn = self.conn()?;
        conn.execute(
            "UPDATE picks SET grade_attempts = grade_attempts + 1, grade_error=?2
             WHERE id=?1 AND outcome='PENDING'",
            params![pick_id, error],
        )?;
        Ok(())
    }

    fn record_closing_line_miss(&self, pick_id: PickId) -> Result<()> {
        let conn = self.conn()?;
        conn.execute(
            "UPDATE picks SET clv_attempts = clv_attempts + 1
             WHERE id=?1 AND clv_recorded_at IS NULL",
            params![pick_id],
        )?;
        Ok(())
    }

    fn record_closing_line(
        &self,
        pick_id: PickId,
        closing_line: Option<f64>,
        closing_price: f64,
        clv: Option<f64>,
        recorded_at: DateTime<Utc>,
    ) -> Result<bool> {
        let conn = self.conn()?;
        let updated = conn.execute(
            "UPDATE picks SET closing_line=?2, closing_price=?3, clv=?4, clv_recorded_at=?5
             WHERE id=?1 AND clv_recorded_at IS NULL",
            params![pick_id, closing_line, closing_price, clv, recorded_at],
        )?;
        Ok(updated == 1)
    }

    // ── Ingestion audit ──────────────────────────────────────────────────────

    fn start_ingestion_run(&self, provider: &str, league: &str, kind: &str) -> Result<i64> {
        let conn = self.conn()?;
        conn.execute(
            "INSERT INTO ingestion_runs (provider, league, kind, started_at, status)
             VALUES (?1,?2,?3,?4,?5)",
            params![provider, league, kind, Utc::now(), RunStatus::Running],
        )?;
        Ok(conn.last_insert_rowid())
    }

    fn finish_ingestion_run(&self, run_id: i64, outcome: &RunOutcome) -> Result<()> {
        let conn = self.conn()?;
        conn.execute(
            "UPDATE ingestion_runs SET
                finished_at=?2, status=?3, items_processed=?4, items_unresolved=?5, error=?6
             WHERE id=?1",
            params![
                run_id,
                Utc::now(),
                outcome.status,
                outcome.items_processed,
                outcome.items_unresolved,
                outcome.error,
            ],
        )?;
        Ok(())
    }

    fn recent_ingestion_runs(&self, limit: usize) -> Result<Vec<IngestionRun>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(
            "SELECT id, provider, league, kind, started_at, finished_at, status,
                    items_processed, items_unresolved, error
             FROM ingestion_runs ORDER BY id DESC LIMIT ?1",
        )?;
        let runs = stmt
            .query_map(params![limit as i64], |row| {
                Ok(IngestionRun {
                    id: row.get(0)?,
                    provider: row.get(1)?,
                    league: row.get(2)?,
                    kind: row.get(3)?,
                    started_at: row.get(4)?,
                    finished_at: row.get(5)?,
                    status: row.get(6)?,
                    items_processed: row.get(7)?,
                    items_unresolved: row.get(8)?,
                    error: row.get(9)?,
                })
            })?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(runs)
    }

    fn record_unresolved(&self, sighting: &UnresolvedSighting) -> Result<()> {
        let conn = self.conn()?;
        conn.execute(
            "INSERT INTO unresolved_sightings
                (kind, provider, provider_key, league, description, reason, attempts,
                 first_seen, last_seen)
             VALUES (?1,?2,?3,?4,?5,?6,?7,?8,?9)
             ON CONFLICT(kind, provider, provider_key) DO UPDATE SET
                description=excluded.description,
                reason=excluded.reason,
                attempts=unresolved_sightings.attempts + 1,
                last_seen=excluded.last_seen",
            params![
                sighting.kind,
                sighting.provider,
                sighting.provider_key,
                sighting.league,
                sighting.description,
                sighting.reason,
                sighting.attempts,
                sighting.first_seen,
                sighting.last_seen,
            ],
        )?;
        Ok(())
    }

    fn clear_unresolved(&self, kind: &str, provider: &str, provider_key: &str) -> Result<()> {
        let conn = self.conn()?;
        conn.execute(
            "DELETE FROM unresolved_sightings WHERE kind=?1 AND provider=?2 AND provider_key=?3",
            params![kind, provider, provider_key],
        )?;
        Ok(())
    }

    fn list_unresolved(&self, limit: usize) -> Result<Vec<UnresolvedSighting>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(
            "SELECT kind, provider, provider_key, league, description, reason, attempts,
                    first_seen, last_seen
             FROM unresolved_sightings ORDER BY last_seen DESC LIMIT ?1",
        )?;
        let rows = stmt
            .query_map(params![limit as i64], |row| {
                Ok(UnresolvedSighting {
                    kind: row.get(0)?,
                    provider: row.get(1)?,
                    provider_key: row.get(2)?,
                    league: row.get(3)?,
                    description: row.get(4)?,
                    reason: row.get(5)?,
                    attempts: row.get(6)?,
                    first_seen: row.get(7)?,
                    last_seen: row.get(8)?,
                })
            })?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(rows)
    }

    // ── Job locks ────────────────────────────────────────────────────────────

    fn try_acquire_lock(&self, name: &str, owner: &str, ttl: Duration) -> Result<bool> {
        let conn = self.conn()?;
        let now = Utc::now();
        conn.execute(
            "DELETE FROM job_locks WHERE name=?1 AND expires_at <= ?2",
            params![name, now],
        )?;
        let inserted = conn.execute(
            "INSERT OR IGNORE INTO job_locks (name, owner, acquired_at, expires_at)
             VALUES (?1,?2,?3,?4)",
            params![name, owner, now, now + ttl],
        )?;
        Ok(inserted == 1)
    }

    fn release_lock(&self, name: &str, owner: &str) -> Result<()> {
        let conn = self.conn()?;
        conn.execute(
            "DELETE FROM job_locks WHERE name=?1 AND owner=?2",
            params![name, owner],
        )?;
        Ok(())
    }
}

/// SQLite schema (idempotent CREATE IF NOT EXISTS)
/// Columns added after the first schema. Databases created before them get
/// them on open.
const ADDED_COLUMNS: &[(&str, &str, &str)] = &[
    ("event_provider_mappings", "swapped", "INTEGER NOT NULL DEFAULT 0"),
    ("picks", "grade_attempts", "INTEGER NOT NULL DEFAULT 0"),
    ("picks", "grade_error", "TEXT"),
    ("picks", "clv_attempts", "INTEGER NOT NULL DEFAULT 0"),
];

fn has_column(conn: &Connection, table: &str, column: &str) -> Result<bool> {
    let mut stmt = conn.prepare(&format!("PRAGMA table_info({})", table))?;
    let names = stmt.query_map([], |row| row.get::<_, String>(1))?;
    for name in names {
        if name? == column {
            return Ok(true);
        }
    }
    Ok(false)
}

pub const SCHEMA_SQL: &str = r#"
CREATE TABLE IF NOT EXISTS teams (
    id           INTEGER PRIMARY KEY AUTOINCREMENT,
    league       TEXT    NOT NULL,
    display_name TEXT    NOT NULL,
    abbreviation TEXT,
    created_at   TEXT    NOT NULL
);

CREATE TABLE IF NOT EXISTS team_provider_mappings (
    provider         TEXT    NOT NULL,
    provider_team_id TEXT    NOT NULL,
    league           TEXT    NOT NULL,
    team_id          INTEGER NOT NULL REFERENCES teams(id),
    raw_name         TEXT    NOT NULL,
    updated_at       TEXT    NOT NULL,
    PRIMARY KEY (provider, provider_team_id, league)
);

CREATE TABLE IF NOT EXISTS events (
    id           INTEGER PRIMARY KEY AUTOINCREMENT,
    league       TEXT    NOT NULL,
    season       INTEGER NOT NULL,
    start_time   TEXT    NOT NULL,
    home_team_id INTEGER NOT NULL REFERENCES teams(id),
    away_team_id INTEGER NOT NULL REFERENCES teams(id),
    home_name    TEXT    NOT NULL,
    away_name    TEXT    NOT NULL,
    status       TEXT    NOT NULL DEFAULT 'scheduled',
    updated_at   TEXT    NOT NULL,
    UNIQUE (league, home_team_id, away_team_id, start_time)
);

CREATE TABLE IF NOT EXISTS event_provider_mappings (
    provider          TEXT    NOT NULL,
    provider_event_id TEXT    NOT NULL,
    event_id          INTEGER NOT NULL REFERENCES events(id),
    -- provider lists home and away reversed
    swapped           INTEGER NOT NULL DEFAULT 0,
    created_at        TEXT    NOT NULL,
    PRIMARY KEY (provider, provider_event_id),
    UNIQUE (event_id, provider)
);

CREATE TABLE IF NOT EXISTS game_results (
    event_id   INTEGER PRIMARY KEY REFERENCES events(id),
    home_score INTEGER NOT NULL,
    away_score INTEGER NOT NULL,
    is_final   INTEGER NOT NULL DEFAULT 0,
    period     TEXT,
    updated_at TEXT    NOT NULL
);

CREATE TABLE IF NOT EXISTS odds_snapshots (
    id              INTEGER PRIMARY KEY AUTOINCREMENT,
    event_id        INTEGER NOT NULL REFERENCES events(id),
    book            TEXT    NOT NULL,
    market_type     TEXT    NOT NULL,
    side            TEXT    NOT NULL,
    line            REAL    NOT NULL,
    price           REAL    NOT NULL,
    captured_at     TEXT    NOT NULL,
    captured_bucket INTEGER NOT NULL,
    UNIQUE (event_id, market_type, side, line, book, captured_bucket)
);

CREATE TABLE IF NOT EXISTS picks (
    id                  INTEGER PRIMARY KEY AUTOINCREMENT,
    league              TEXT    NOT NULL,
    event_id            INTEGER REFERENCES events(id),
    home_name           TEXT    NOT NULL,
    away_name           TEXT    NOT NULL,
    kickoff             TEXT,
    market_type         TEXT    NOT NULL,
    side                TEXT    NOT NULL,
    line                REAL,
    price               REAL    NOT NULL,
    open_line           REAL,
    open_price          REAL,
    outcome             TEXT    NOT NULL DEFAULT 'PENDING',
    closing_line        REAL,
    closing_price       REAL,
    clv                 REAL,
    clv_recorded_at     TEXT,
    placed_at           TEXT    NOT NULL,
    graded_at           TEXT,
    resolution_attempts INTEGER NOT NULL DEFAULT 0,
    quarantined         INTEGER NOT NULL DEFAULT 0,
    grade_attempts      INTEGER NOT NULL DEFAULT 0,
    grade_error         TEXT,
    clv_attempts        INTEGER NOT NULL DEFAULT 0
);

CREATE TABLE IF NOT EXISTS ingestion_runs (
    id               INTEGER PRIMARY KEY AUTOINCREMENT,
    provider         TEXT    NOT NULL,
    league           TEXT    NOT NULL,
    kind             TEXT    NOT NULL,
    started_at       TEXT    NOT NULL,
    finished_at      TEXT,
    status           TEXT    NOT NULL,
    items_processed  INTEGER NOT NULL DEFAULT 0,
    items_unresolved INTEGER NOT NULL DEFAULT 0,
    error            TEXT
);

CREATE TABLE IF NOT EXISTS unresolved_sightings (
    kind         TEXT    NOT NULL,
    provider     TEXT    NOT NULL,
    provider_key TEXT    NOT NULL,
    league       TEXT    NOT NULL,
    description  TEXT    NOT NULL,
    reason       TEXT    NOT NULL,
    attempts     INTEGER NOT NULL DEFAULT 1,
    first_seen   TEXT    NOT NULL,
    last_seen    TEXT    NOT NULL,
    PRIMARY KEY (kind, provider, provider_key)
);

CREATE TABLE IF NOT EXISTS job_locks (
    name        TEXT PRIMARY KEY,
    owner       TEXT NOT NULL,
    acquired_at TEXT NOT NULL,
    expires_at  TEXT NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_team_mappings_team ON team_provider_mappings(team_id);
CREATE INDEX IF NOT EXISTS idx_events_league_start ON events(league, start_time);
CREATE INDEX IF NOT EXISTS idx_snapshots_event_market ON odds_snapshots(event_id, market_type, side, captured_at);
CREATE INDEX IF NOT EXISTS idx_picks_outcome ON picks(outcome);
CREATE INDEX IF NOT EXISTS idx_picks_event ON picks(event_id);
"#;

// ── SQL helpers ────────────────────────────────────────────────────────────────

const EVENT_COLUMNS: &str = "e.id, e.league, e.season, e.start_time, e.home_team_id, \
     e.away_team_id, e.home_name, e.away_name, e.status, e.updated_at";
const EVENT_COLUMN_COUNT: usize = 10;

const PICK_COLUMNS: &str = "p.id, p.league, p.event_id, p.home_name, p.away_name, p.kickoff, \
     p.market_type, p.side, p.line, p.price, p.open_line, p.open_price, p.outcome, \
     p.closing_line, p.closing_price, p.clv, p.clv_recorded_at, p.placed_at, p.graded_at, \
     p.resolution_attempts, p.quarantined";
const PICK_COLUMN_COUNT: usize = 21;

const SNAPSHOT_COLUMNS: &str = "s.id, s.event_id, s.book, s.market_type, s.side, s.line, \
     s.price, s.captured_at, s.captured_bucket";

/// SQLite treats a negative LIMIT as "no limit".
fn sql_limit(limit: Option<usize>) -> i64 {
    limit.map(|l| l as i64).unwrap_or(-1)
}

fn map_team(row: &rusqlite::Row) -> rusqlite::Result<Team> {
    Ok(Team {
        id: row.get(0)?,
        league: row.get(1)?,
        display_name: row.get(2)?,
        abbreviation: row.get(3)?,
        created_at: row.get(4)?,
    })
}

fn map_team_mapping(row: &rusqlite::Row) -> rusqlite::Result<TeamProviderMapping> {
    Ok(TeamProviderMapping {
        provider: row.get(0)?,
        provider_team_id: row.get(1)?,
        league: row.get(2)?,
        team_id: row.get(3)?,
        raw_name: row.get(4)?,
        updated_at: row.get(5)?,
    })
}

fn map_event(row: &rusqlite::Row, at: usize) -> rusqlite::Result<Event> {
    Ok(Event {
        id: row.get(at)?,
        league: row.get(at + 1)?,
        season: row.get(at + 2)?,
        start_time: row.get(at + 3)?,
        home_team_id: row.get(at + 4)?,
        away_team_id: row.get(at + 5)?,
        home_name: row.get(at + 6)?,
        away_name: row.get(at + 7)?,
        status: row.get(at + 8)?,
        updated_at: row.get(at + 9)?,
    })
}

fn map_game_result(row: &rusqlite::Row, at: usize) -> rusqlite::Result<GameResult> {
    Ok(GameResult {
        event_id: row.get(at)?,
        home_score: row.get(at + 1)?,
        away_score: row.get(at + 2)?,
        is_final: row.get(at + 3)?,
        period: row.get(at + 4)?,
        updated_at: row.get(at + 5)?,
    })
}

fn map_pick(row: &rusqlite::Row, at: usize) -> rusqlite::Result<Pick> {
    Ok(Pick {
        id: row.get(at)?,
        league: row.get(at + 1)?,
        event_id: row.get(at + 2)?,
        home_name: row.get(at + 3)?,
        away_name: row.get(at + 4)?,
        kickoff: row.get(at + 5)?,
        market_type: row.get(at + 6)?,
        side: row.get(at + 7)?,
        line: row.get(at + 8)?,
        price: row.get(at + 9)?,
        open_line: row.get(at + 10)?,
        open_price: row.get(at + 11)?,
        outcome: row.get(at + 12)?,
        closing_line: row.get(at + 13)?,
        closing_price: row.get(at + 14)?,
        clv: row.get(at + 15)?,
        clv_recorded_at: row.get(at + 16)?,
        placed_at: row.get(at + 17)?,
        graded_at: row.get(at + 18)?,
        resolution_attempts: row.get(at + 19)?,
        quarantined: row.get(at + 20)?,
    })
}

fn map_snapshot(row: &rusqlite::Row) -> rusqlite::Result<OddsSnapshot> {
    let market_type: MarketType = row.get(3)?;
    let line: f64 = row.get(5)?;
    let bucket_secs: i64 = row.get(8)?;
    let captured_bucket = DateTime::from_timestamp(bucket_secs, 0).ok_or_else(|| {
        rusqlite::Error::IntegralValueOutOfRange(8, bucket_secs)
    })?;
    Ok(OddsSnapshot {
        id: row.get(0)?,
        event_id: row.get(1)?,
        book: row.get(2)?,
        market_type,
        side: row.get(4)?,
        line: if market_type.is_line_based() { Some(line) } else { None },
        price: row.get(6)?,
        captured_at: row.get(7)?,
        captured_bucket,
    })
}
