use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

pub type TeamId = i64;
pub type EventId = i64;
pub type PickId = i64;

/// Error returned when a stored or submitted enum string is not recognised.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[error("unknown {kind} value: {value:?}")]
pub struct ParseEnumError {
    pub kind: &'static str,
    pub value: String,
}

impl ParseEnumError {
    fn new(kind: &'static str, value: &str) -> Self {
        ParseEnumError {
            kind,
            value: value.to_string(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum MarketType {
    Spread,
    Total,
    Moneyline,
}

impl MarketType {
    pub fn as_str(&self) -> &'static str {
        match self {
            MarketType::Spread => "SPREAD",
            MarketType::Total => "TOTAL",
            MarketType::Moneyline => "MONEYLINE",
        }
    }

    /// Spread and total quotes are meaningless without a line.
    pub fn is_line_based(&self) -> bool {
        matches!(self, MarketType::Spread | MarketType::Total)
    }

    /// Whether `side` is a valid selection in this market.
    pub fn accepts(&self, side: Side) -> bool {
        match self {
            MarketType::Spread | MarketType::Moneyline => matches!(side, Side::Home | Side::Away),
            MarketType::Total => matches!(side, Side::Over | Side::Under),
        }
    }
}

impl FromStr for MarketType {
    type Err = ParseEnumError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_uppercase().as_str() {
            "SPREAD" | "SPREADS" => Ok(MarketType::Spread),
            "TOTAL" | "TOTALS" => Ok(MarketType::Total),
            "MONEYLINE" | "H2H" | "ML" => Ok(MarketType::Moneyline),
            _ => Err(ParseEnumError::new("market type", s)),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Side {
    Home,
    Away,
    Over,
    Under,
}

impl Side {
    pub fn as_str(&self) -> &'static str {
        match self {
            Side::Home => "HOME",
            Side::Away => "AWAY",
            Side::Over => "OVER",
            Side::Under => "UNDER",
        }
    }

    /// The same selection seen with home and away exchanged.
    pub fn swap_home_away(self) -> Side {
        match self {
            Side::Home => Side::Away,
            Side::Away => Side::Home,
            other => other,
        }
    }
}

impl FromStr for Side {
    type Err = ParseEnumError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_uppercase().as_str() {
            "HOME" => Ok(Side::Home),
            "AWAY" => Ok(Side::Away),
            "OVER" => Ok(Side::Over),
            "UNDER" => Ok(Side::Under),
            _ => Err(ParseEnumError::new("side", s)),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventStatus {
    Scheduled,
    InProgress,
    Final,
    Postponed,
}

impl EventStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            EventStatus::Scheduled => "scheduled",
            EventStatus::InProgress => "in_progress",
            EventStatus::Final => "final",
            EventStatus::Postponed => "postponed",
        }
    }

    pub fn is_final(&self) -> bool {
        *self == EventStatus::Final
    }
}

impl FromStr for EventStatus {
    type Err = ParseEnumError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "scheduled" => Ok(EventStatus::Scheduled),
            "in_progress" => Ok(EventStatus::InProgress),
            "final" => Ok(EventStatus::Final),
            "postponed" => Ok(EventStatus::Postponed),
            _ => Err(ParseEnumError::new("event status", s)),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum PickOutcome {
    Pending,
    Won,
    Lost,
    Push,
    Void,
}

impl PickOutcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            PickOutcome::Pending => "PENDING",
            PickOutcome::Won => "WON",
            PickOutcome::Lost => "LOST",
            PickOutcome::Push => "PUSH",
            PickOutcome::Void => "VOID",
        }
    }
}

impl FromStr for PickOutcome {
    type Err = ParseEnumError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_uppercase().as_str() {
            "PENDING" => Ok(PickOutcome::Pending),
            "WON" => Ok(PickOutcome::Won),
            "LOST" => Ok(PickOutcome::Lost),
            "PUSH" => Ok(PickOutcome::Push),
            "VOID" => Ok(PickOutcome::Void),
            _ => Err(ParseEnumError::new("pick outcome", s)),
        }
    }
}

macro_rules! text_enum {
    ($($ty:ty),* $(,)?) => {$(
        impl fmt::Display for $ty {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(self.as_str())
            }
        }

        impl rusqlite::types::ToSql for $ty {
            fn to_sql(&self) -> rusqlite::Result<rusqlite::types::ToSqlOutput<'_>> {
                Ok(rusqlite::types::ToSqlOutput::from(self.as_str()))
            }
        }

        impl rusqlite::types::FromSql for $ty {
            fn column_result(
                value: rusqlite::types::ValueRef<'_>,
            ) -> rusqlite::types::FromSqlResult<Self> {
                value
                    .as_str()?
                    .parse()
                    .map_err(|e| rusqlite::types::FromSqlError::Other(Box::new(e)))
            }
        }
    )*};
}

text_enum!(MarketType, Side, EventStatus, PickOutcome);

/// Canonical team identity. The id never changes once assigned.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Team {
    pub id: TeamId,
    pub league: String,
    pub display_name: String,
    pub abbreviation: Option<String>,
    pub created_at: DateTime<Utc>,
}

/// Link between a provider's team id and the canonical team.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TeamProviderMapping {
    pub provider: String,
    pub provider_team_id: String,
    pub league: String,
    pub team_id: TeamId,
    /// Provider display name as last seen, kept for audit and as a match alias
    pub raw_name: String,
    pub updated_at: DateTime<Utc>,
}

/// A name a team is known by within a league (display name or provider raw name).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TeamAlias {
    pub team_id: TeamId,
    pub alias: String,
}

/// Canonical game, independent of which provider reported it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Event {
    pub id: EventId,
    pub league: String,
    pub season: i32,
    pub start_time: DateTime<Utc>,
    pub home_team_id: TeamId,
    pub away_team_id: TeamId,
    pub home_name: String,
    pub away_name: String,
    pub status: EventStatus,
    pub updated_at: DateTime<Utc>,
}

/// Fields needed to create a canonical event.
#[derive(Debug, Clone, PartialEq)]
pub struct NewEvent {
    pub league: String,
    pub season: i32,
    pub start_time: DateTime<Utc>,
    pub home_team_id: TeamId,
    pub away_team_id: TeamId,
    pub home_name: String,
    pub away_name: String,
    pub status: EventStatus,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EventProviderMapping {
    pub provider: String,
    pub provider_event_id: String,
    pub event_id: EventId,
    /// The provider lists home and away the other way round.
    pub swapped: bool,
    pub created_at: DateTime<Utc>,
}

/// One row per event. `is_final` only moves from false to true outside of
/// explicit corrections.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GameResult {
    pub event_id: EventId,
    pub home_score: i32,
    pub away_score: i32,
    pub is_final: bool,
    /// Provider period / status text, e.g. "2nd Half" or "Final/OT"
    pub period: Option<String>,
    pub updated_at: DateTime<Utc>,
}

/// Immutable price observation. `(event_id, market_type, side, line, book,
/// captured_bucket)` is unique.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OddsSnapshot {
    pub id: Option<i64>,
    pub event_id: EventId,
    pub book: String,
    pub market_type: MarketType,
    pub side: Side,
    /// `None` for moneyline quotes
    pub line: Option<f64>,
    /// American odds
    pub price: f64,
    pub captured_at: DateTime<Utc>,
    pub captured_bucket: DateTime<Utc>,
}

/// A bet leg tied to a market.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Pick {
    pub id: Option<PickId>,
    pub league: String,
    /// Canonical event, once resolved
    pub event_id: Option<EventId>,
    /// Matchup as recorded on the pick, used to resolve the event later
    pub home_name: String,
    pub away_name: String,
    pub kickoff: Option<DateTime<Utc>>,
    pub market_type: MarketType,
    pub side: Side,
    /// Line the pick was placed at (from the picked side's perspective)
    pub line: Option<f64>,
    /// American odds the pick was placed at
    pub price: f64,
    /// Line the market showed when the pick was locked in
    pub open_line: Option<f64>,
    pub open_price: Option<f64>,
    pub outcome: PickOutcome,
    pub closing_line: Option<f64>,
    pub closing_price: Option<f64>,
    pub clv: Option<f64>,
    pub clv_recorded_at: Option<DateTime<Utc>>,
    pub placed_at: DateTime<Utc>,
    pub graded_at: Option<DateTime<Utc>>,
    pub resolution_attempts: i32,
    pub quarantined: bool,
}

impl Pick {
    /// Line used as the reference for closing-line value.
    pub fn reference_line(&self) -> Option<f64> {
        self.open_line.or(self.line)
    }

    pub fn reference_price(&self) -> f64 {
        self.open_price.unwrap_or(self.price)
    }
}

/// Pending pick on a finalized event, with everything grading needs.
#[derive(Debug, Clone, PartialEq)]
pub struct GradingCandidate {
    pub pick: Pick,
    pub event: Event,
    pub result: GameResult,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Running,
    Success,
    Failed,
}

impl RunStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            RunStatus::Running => "running",
            RunStatus::Success => "success",
            RunStatus::Failed => "failed",
        }
    }
}

impl FromStr for RunStatus {
    type Err = ParseEnumError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "running" => Ok(RunStatus::Running),
            "success" => Ok(RunStatus::Success),
            "failed" => Ok(RunStatus::Failed),
            _ => Err(ParseEnumError::new("run status", s)),
        }
    }
}

text_enum!(RunStatus);

/// Audit record for one provider ingestion pass.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IngestionRun {
    pub id: i64,
    pub provider: String,
    pub league: String,
    /// "scores" | "odds"
    pub kind: String,
    pub started_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
    pub status: RunStatus,
    pub items_processed: i64,
    pub items_unresolved: i64,
    pub error: Option<String>,
}

/// Final state written when an ingestion run ends.
#[derive(Debug, Clone, PartialEq)]
pub struct RunOutcome {
    pub status: RunStatus,
    pub items_processed: i64,
    pub items_unresolved: i64,
    pub error: Option<String>,
}

impl RunOutcome {
    pub fn success(items_processed: usize, items_unresolved: usize) -> Self {
        RunOutcome {
            status: RunStatus::Success,
            items_processed: items_processed as i64,
            items_unresolved: items_unresolved as i64,
            error: None,
        }
    }

    pub fn failed(error: impl Into<String>) -> Self {
        RunOutcome {
            status: RunStatus::Failed,
            items_processed: 0,
            items_unresolved: 0,
            error: Some(error.into()),
        }
    }
}

/// A team, event or pick that could not be resolved and is held for retry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UnresolvedSighting {
    /// "team" | "event" | "odds_event"
    pub kind: String,
    pub provider: String,
    pub provider_key: String,
    pub league: String,
    /// Human-readable summary, e.g. "Duke @ UNC 2026-01-15T19:00:00Z"
    pub description: String,
    /// "unresolved" | "ambiguous" | ...
    pub reason: String,
    pub attempts: i64,
    pub first_seen: DateTime<Utc>,
    pub last_seen: DateTime<Utc>,
}
