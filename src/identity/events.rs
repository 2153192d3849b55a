use anyhow::{anyhow, Result};
use chrono::{DateTime, Datelike, Duration, SubsecRound, Utc};
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, info, warn};

use super::matching::match_names;
use super::teams::IdentityResolver;
use crate::db::models::{Event, EventId, EventStatus, GameResult, NewEvent, TeamId};
use crate::db::Repository;

/// Score fields carried by a scoreboard sighting.
#[derive(Debug, Clone, PartialEq)]
pub struct ScoreUpdate {
    pub home_score: i32,
    pub away_score: i32,
    pub is_final: bool,
    pub period: Option<String>,
}

/// A provider's report of one game after its teams went through the
/// identity resolver.
#[derive(Debug, Clone, PartialEq)]
pub struct EventObservation {
    pub provider: String,
    pub provider_event_id: String,
    pub league: String,
    pub start_time: DateTime<Utc>,
    pub home_team_id: Option<TeamId>,
    pub away_team_id: Option<TeamId>,
    pub status: EventStatus,
    pub result: Option<ScoreUpdate>,
}

/// Why an observation did not yield a canonical event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UnresolvedReason {
    MissingTeams,
    SameTeam,
    Ambiguous,
    NoCandidate,
}

impl UnresolvedReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            UnresolvedReason::MissingTeams => "missing_teams",
            UnresolvedReason::SameTeam => "same_team",
            UnresolvedReason::Ambiguous => "ambiguous",
            UnresolvedReason::NoCandidate => "no_candidate",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Resolution {
    Resolved(EventId),
    Unresolved(UnresolvedReason),
}

/// Outcome of matching a feed event that carries no team ids. `swapped`
/// means the feed lists home and away the other way round from the event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FeedMatch {
    Linked { event_id: EventId, swapped: bool },
    Unresolved(UnresolvedReason),
}

impl Resolution {
    pub fn event_id(&self) -> Option<EventId> {
        match self {
            Resolution::Resolved(id) => Some(*id),
            Resolution::Unresolved(_) => None,
        }
    }
}

/// Season label for a game. Winter sports take the year the season ends,
/// fall football the year it starts, baseball the calendar year.
pub fn season_for(league: &str, start: DateTime<Utc>) -> i32 {
    let year = start.year();
    match league.to_ascii_uppercase().as_str() {
        "NCAAM" | "NCAAB" | "NCAAW" | "NBA" | "NHL" => {
            if start.month() >= 8 {
                year + 1
            } else {
                year
            }
        }
        "NFL" | "NCAAF" => {
            if start.month() <= 2 {
                year - 1
            } else {
                year
            }
        }
        _ => year,
    }
}

/// Maps provider events and bare matchups onto canonical events.
pub struct EventResolver {
    repo: Arc<dyn Repository>,
    identity: Arc<IdentityResolver>,
    match_window: Duration,
}

impl EventResolver {
    pub fn new(
        repo: Arc<dyn Repository>,
        identity: Arc<IdentityResolver>,
        match_window: Duration,
    ) -> Self {
        EventResolver {
            repo,
            identity,
            match_window,
        }
    }

    pub fn identity(&self) -> &IdentityResolver {
        &self.identity
    }

    /// Resolve a provider event to a canonical event id, creating it on first
    /// sighting. Returns `None` when the input is rejected or ambiguous.
    pub fn resolve_or_create_event(&self, obs: &EventObservation) -> Result<Option<EventId>> {
        Ok(self.resolve_event(obs)?.event_id())
    }

    /// Same as `resolve_or_create_event` but reports why nothing resolved.
    pub fn resolve_event(&self, obs: &EventObservation) -> Result<Resolution> {
        let (home, away) = match (obs.home_team_id, obs.away_team_id) {
            (Some(h), Some(a)) => (h, a),
            _ => {
                warn!(
                    "{} event {} rejected: teams unresolved",
                    obs.provider, obs.provider_event_id
                );
                return Ok(Resolution::Unresolved(UnresolvedReason::MissingTeams));
            }
        };
        if home == away {
            warn!(
                "{} event {} rejected: home and away are team {}",
                obs.provider, obs.provider_event_id, home
            );
            return Ok(Resolution::Unresolved(UnresolvedReason::SameTeam));
        }
        let start = obs.start_time.trunc_subsecs(0);

        if let Some(mapping) = self
            .repo
            .find_event_mapping(&obs.provider, &obs.provider_event_id)?
        {
            self.apply_state(mapping.event_id, obs, Some(start))?;
            return Ok(Resolution::Resolved(mapping.event_id));
        }

        let existing = match self.repo.find_event_by_key(&obs.league, home, away, start)? {
            Some(event) => Some(event.id),
            None => {
                let candidates = self.repo.find_events_by_teams(
                    &obs.league,
                    home,
                    away,
                    start - self.match_window,
                    start + self.match_window,
                )?;
                match candidates.as_slice() {
                    [] => None,
                    [only] => Some(only.id),
                    many => {
                        warn!(
                            "{} event {} matches {} events in the window, not linking",
                            obs.provider,
                            obs.provider_event_id,
                            many.len()
                        );
                        return Ok(Resolution::Unresolved(UnresolvedReason::Ambiguous));
                    }
                }
            }
        };

        if let Some(event_id) = existing {
            if !self
                .repo
                .link_event_provider(event_id, &obs.provider, &obs.provider_event_id, false)?
            {
                debug!(
                    "{} already mapped to event {} under another id, keeping {}",
                    obs.provider, event_id, obs.provider_event_id
                );
            }
            self.apply_state(event_id, obs, None)?;
            return Ok(Resolution::Resolved(event_id));
        }

        let home_team = self
            .repo
            .get_team(home)?
            .ok_or_else(|| anyhow!("team {} not found", home))?;
        let away_team = self
            .repo
            .get_team(away)?
            .ok_or_else(|| anyhow!("team {} not found", away))?;
        let new_event = NewEvent {
            league: obs.league.clone(),
            season: season_for(&obs.league, start),
            start_time: start,
            home_team_id: home,
            away_team_id: away,
            home_name: home_team.display_name,
            away_name: away_team.display_name,
            status: obs.status,
        };
        let event_id =
            self.repo
                .create_event_with_mapping(&new_event, &obs.provider, &obs.provider_event_id)?;
        info!(
            "New {} event {}: {} @ {} at {}",
            obs.league, event_id, new_event.away_name, new_event.home_name, start
        );
        self.apply_state(event_id, obs, None)?;
        Ok(Resolution::Resolved(event_id))
    }

    fn apply_state(
        &self,
        event_id: EventId,
        obs: &EventObservation,
        start_time: Option<DateTime<Utc>>,
    ) -> Result<()> {
        let is_final = obs.result.as_ref().is_some_and(|r| r.is_final);
        let status = if is_final {
            EventStatus::Final
        } else {
            obs.status
        };
        self.repo.update_event_state(event_id, status, start_time)?;
        if let Some(score) = &obs.result {
            self.repo.upsert_game_result(&GameResult {
                event_id,
                home_score: score.home_score,
                away_score: score.away_score,
                is_final: score.is_final,
                period: score.period.clone(),
                updated_at: Utc::now(),
            })?;
        }
        Ok(())
    }

    /// Find the one canonical event a bare matchup refers to.
    ///
    /// Returns `None` when no event or more than one event in the match
    /// window fits both names, directly or with sides swapped.
    pub fn resolve_by_names(
        &self,
        league: &str,
        home_name: &str,
        away_name: &str,
        kickoff: DateTime<Utc>,
    ) -> Result<Option<EventId>> {
        Ok(self
            .match_by_names(league, home_name, away_name, kickoff)?
            .event_id())
    }

    pub fn match_by_names(
        &self,
        league: &str,
        home_name: &str,
        away_name: &str,
        kickoff: DateTime<Utc>,
    ) -> Result<Resolution> {
        let events = self.repo.events_in_window(
            league,
            kickoff - self.match_window,
            kickoff + self.match_window,
        )?;
        if events.is_empty() {
            debug!("No {} events near {} for {} @ {}", league, kickoff, away_name, home_name);
            return Ok(Resolution::Unresolved(UnresolvedReason::NoCandidate));
        }
        let aliases = self.identity.aliases_by_team(league)?;

        let matched: Vec<EventId> = events
            .iter()
            .filter(|e| {
                let direct = team_matches(&aliases, e.home_team_id, home_name)
                    && team_matches(&aliases, e.away_team_id, away_name);
                let swapped = team_matches(&aliases, e.home_team_id, away_name)
                    && team_matches(&aliases, e.away_team_id, home_name);
                direct || swapped
            })
            .map(|e| e.id)
            .collect();

        match matched.as_slice() {
            [] => {
                warn!(
                    "Unresolved {} matchup {} @ {} near {}",
                    league, away_name, home_name, kickoff
                );
                Ok(Resolution::Unresolved(UnresolvedReason::NoCandidate))
            }
            [only] => Ok(Resolution::Resolved(*only)),
            many => {
                warn!(
                    "Ambiguous {} matchup {} @ {} near {}: events {:?}",
                    league, away_name, home_name, kickoff, many
                );
                Ok(Resolution::Unresolved(UnresolvedReason::Ambiguous))
            }
        }
    }

    /// True when the names fit `event` only with home and away swapped.
    pub fn names_swapped(&self, event: &Event, home_name: &str, away_name: &str) -> Result<bool> {
        let aliases = self.identity.aliases_by_team(&event.league)?;
        let direct = team_matches(&aliases, event.home_team_id, home_name)
            && team_matches(&aliases, event.away_team_id, away_name);
        let swapped = team_matches(&aliases, event.home_team_id, away_name)
            && team_matches(&aliases, event.away_team_id, home_name);
        Ok(!direct && swapped)
    }

    /// Resolve an event from a feed that carries its own event id but no team
    /// ids: provider mapping first, then names, linking the id on success.
    /// The orientation found at link time is stored with the mapping.
    pub fn resolve_provider_event_by_names(
        &self,
        provider: &str,
        provider_event_id: &str,
        league: &str,
        home_name: &str,
        away_name: &str,
        kickoff: DateTime<Utc>,
    ) -> Result<FeedMatch> {
        if let Some(mapping) = self.repo.find_event_mapping(provider, provider_event_id)? {
            return Ok(FeedMatch::Linked {
                event_id: mapping.event_id,
                swapped: mapping.swapped,
            });
        }
        let event_id = match self.match_by_names(league, home_name, away_name, kickoff)? {
            Resolution::Resolved(event_id) => event_id,
            Resolution::Unresolved(reason) => return Ok(FeedMatch::Unresolved(reason)),
        };
        let event = self
            .repo
            .get_event(event_id)?
            .ok_or_else(|| anyhow!("event {} not found", event_id))?;
        let swapped = self.names_swapped(&event, home_name, away_name)?;
        if !self
            .repo
            .link_event_provider(event_id, provider, provider_event_id, swapped)?
        {
            // A concurrent poll linked this id first; its row wins.
            if let Some(existing) = self.repo.find_event_mapping(provider, provider_event_id)? {
                return Ok(FeedMatch::Linked {
                    event_id: existing.event_id,
                    swapped: existing.swapped,
                });
            }
        }
        if swapped {
            info!(
                "{} lists event {} with home and away reversed ({} @ {})",
                provider, event_id, away_name, home_name
            );
        }
        Ok(FeedMatch::Linked { event_id, swapped })
    }
}

fn team_matches(aliases: &HashMap<TeamId, Vec<String>>, team_id: TeamId, name: &str) -> bool {
    aliases
        .get(&team_id)
        .is_some_and(|names| names.iter().any(|alias| match_names(alias, name).is_match()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::TtlCache;
    use crate::db::Database;
    use crate::identity::teams::MappingKey;
    use chrono::TimeZone;

    struct Fixture {
        db: Arc<Database>,
        events: EventResolver,
    }

    fn fixture() -> Fixture {
        let db = Arc::new(Database::open_in_memory().unwrap());
        let cache: Arc<TtlCache<MappingKey, TeamId>> =
            Arc::new(TtlCache::new(std::time::Duration::from_secs(60), 100));
        let identity = Arc::new(IdentityResolver::new(db.clone(), cache));
        let events = EventResolver::new(db.clone(), identity, Duration::hours(6));
        Fixture { db, events }
    }

    fn tip_off() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 1, 15, 19, 0, 0).unwrap()
    }

    impl Fixture {
        fn team(&self, provider: &str, id: &str, name: &str) -> TeamId {
            self.events
                .identity()
                .resolve_or_create_team("NCAAM", provider, id, name, None)
                .unwrap()
        }

        fn observe(&self, provider: &str, id: &str, home: TeamId, away: TeamId) -> EventObservation {
            EventObservation {
                provider: provider.into(),
                provider_event_id: id.into(),
                league: "NCAAM".into(),
                start_time: tip_off(),
                home_team_id: Some(home),
                away_team_id: Some(away),
                status: EventStatus::Scheduled,
                result: None,
            }
        }
    }

    #[test]
    fn test_season_rules() {
        let nov = Utc.with_ymd_and_hms(2025, 11, 20, 0, 0, 0).unwrap();
        let mar = Utc.with_ymd_and_hms(2026, 3, 20, 0, 0, 0).unwrap();
        let jan = Utc.with_ymd_and_hms(2026, 1, 10, 0, 0, 0).unwrap();
        assert_eq!(season_for("NCAAM", nov), 2026);
        assert_eq!(season_for("NCAAM", mar), 2026);
        assert_eq!(season_for("NFL", jan), 2025);
        assert_eq!(season_for("NFL", nov), 2025);
        assert_eq!(season_for("MLB", mar), 2026);
    }

    #[test]
    fn test_unresolved_teams_are_rejected() {
        let f = fixture();
        let duke = f.team("espn", "150", "Duke");
        let mut obs = f.observe("espn", "401", duke, duke);
        assert_eq!(
            f.events.resolve_event(&obs).unwrap(),
            Resolution::Unresolved(UnresolvedReason::SameTeam)
        );
        obs.away_team_id = None;
        assert_eq!(f.events.resolve_or_create_event(&obs).unwrap(), None);
        assert_eq!(f.db.count_events("NCAAM").unwrap(), 0);
    }

    #[test]
    fn test_second_provider_attaches_to_existing_event() {
        let f = fixture();
        let duke = f.team("espn", "150", "Duke");
        let unc = f.team("espn", "153", "UNC");
        let first = f
            .events
            .resolve_or_create_event(&f.observe("espn", "401", duke, unc))
            .unwrap()
            .unwrap();

        let duke_b = f.team("sportsdata", "DUKE", "duke");
        let unc_b = f.team("sportsdata", "UNC", "unc");
        assert_eq!((duke_b, unc_b), (duke, unc));

        let mut obs = f.observe("sportsdata", "9001", duke_b, unc_b);
        obs.start_time = tip_off() + Duration::minutes(5);
        let second = f.events.resolve_or_create_event(&obs).unwrap().unwrap();
        assert_eq!(first, second);
        assert_eq!(f.db.count_events("NCAAM").unwrap(), 1);
        // Canonical start time is kept when linking from another provider.
        assert_eq!(f.db.get_event(first).unwrap().unwrap().start_time, tip_off());
    }

    #[test]
    fn test_mapping_path_updates_state_and_result() {
        let f = fixture();
        let duke = f.team("espn", "150", "Duke");
        let unc = f.team("espn", "153", "UNC");
        let event_id = f
            .events
            .resolve_or_create_event(&f.observe("espn", "401", duke, unc))
            .unwrap()
            .unwrap();

        let mut obs = f.observe("espn", "401", duke, unc);
        obs.status = EventStatus::InProgress;
        obs.result = Some(ScoreUpdate {
            home_score: 80,
            away_score: 73,
            is_final: true,
            period: Some("Final".into()),
        });
        assert_eq!(f.events.resolve_or_create_event(&obs).unwrap(), Some(event_id));
        let event = f.db.get_event(event_id).unwrap().unwrap();
        assert_eq!(event.status, EventStatus::Final);
        let result = f.db.get_game_result(event_id).unwrap().unwrap();
        assert!(result.is_final);
        assert_eq!((result.home_score, result.away_score), (80, 73));
    }

    #[test]
    fn test_resolve_by_names_matches_casing_and_swapped_sides() {
        let f = fixture();
        let duke = f.team("espn", "150", "Duke");
        let unc = f.team("espn", "153", "UNC");
        let event_id = f
            .events
            .resolve_or_create_event(&f.observe("espn", "401", duke, unc))
            .unwrap();

        let kickoff = tip_off() + Duration::hours(2);
        assert_eq!(
            f.events.resolve_by_names("NCAAM", "DUKE", "unc", kickoff).unwrap(),
            event_id
        );
        assert_eq!(
            f.events.resolve_by_names("NCAAM", "UNC", "Duke Blue Devils", kickoff).unwrap(),
            event_id
        );
        assert_eq!(
            f.events
                .resolve_by_names("NCAAM", "Duke", "UNC", tip_off() + Duration::hours(7))
                .unwrap(),
            None
        );
        assert_eq!(f.db.count_events("NCAAM").unwrap(), 1);
    }

    #[test]
    fn test_ambiguous_names_fail_closed() {
        let f = fixture();
        let iowa_st = f.team("espn", "66", "Iowa State");
        let kansas = f.team("espn", "2305", "Kansas");
        let mich_st = f.team("espn", "127", "Michigan State");
        let kc = f.team("espn", "140", "Kansas City");
        let first = f
            .events
            .resolve_or_create_event(&f.observe("espn", "1", iowa_st, kansas))
            .unwrap();
        f.events
            .resolve_or_create_event(&f.observe("espn", "2", mich_st, kc))
            .unwrap();

        assert_eq!(
            f.events
                .match_by_names("NCAAM", "State", "Kansas", tip_off())
                .unwrap(),
            Resolution::Unresolved(UnresolvedReason::Ambiguous)
        );
        assert_eq!(
            f.events
                .resolve_by_names("NCAAM", "Iowa State", "Kansas", tip_off())
                .unwrap(),
            first
        );
    }

    #[test]
    fn test_names_swapped() {
        let f = fixture();
        let duke = f.team("espn", "150", "Duke");
        let unc = f.team("espn", "153", "UNC");
        let event_id = f
            .events
            .resolve_or_create_event(&f.observe("espn", "401", duke, unc))
            .unwrap()
            .unwrap();
        let event = f.db.get_event(event_id).unwrap().unwrap();
        assert!(!f.events.names_swapped(&event, "Duke", "UNC").unwrap());
        assert!(f.events.names_swapped(&event, "UNC", "Duke").unwrap());
    }

    #[test]
    fn test_provider_event_linked_after_name_match() {
        let f = fixture();
        let duke = f.team("espn", "150", "Duke");
        let unc = f.team("espn", "153", "UNC");
        let event_id = f
            .events
            .resolve_or_create_event(&f.observe("espn", "401", duke, unc))
            .unwrap()
            .unwrap();
        let resolution = f
            .events
            .resolve_provider_event_by_names("odds_api", "abc123", "NCAAM", "Duke", "UNC", tip_off())
            .unwrap();
        assert_eq!(
            resolution,
            FeedMatch::Linked {
                event_id,
                swapped: false
            }
        );
        assert_eq!(
            f.db.find_event_mapping("odds_api", "abc123")
                .unwrap()
                .map(|m| m.event_id),
            Some(event_id)
        );
    }

    #[test]
    fn test_reversed_feed_orientation_is_kept_with_mapping() {
        let f = fixture();
        let duke = f.team("espn", "150", "Duke");
        let unc = f.team("espn", "153", "UNC");
        let event_id = f
            .events
            .resolve_or_create_event(&f.observe("espn", "401", duke, unc))
            .unwrap()
            .unwrap();
        let reversed = FeedMatch::Linked {
            event_id,
            swapped: true,
        };
        assert_eq!(
            f.events
                .resolve_provider_event_by_names("odds_api", "xyz", "NCAAM", "UNC", "Duke", tip_off())
                .unwrap(),
            reversed
        );
        assert!(f.db.find_event_mapping("odds_api", "xyz").unwrap().unwrap().swapped);
        // Later polls go through the mapping and keep the orientation, whatever
        // the names say.
        assert_eq!(
            f.events
                .resolve_provider_event_by_names("odds_api", "xyz", "NCAAM", "", "", tip_off())
                .unwrap(),
            reversed
        );
    }
}
