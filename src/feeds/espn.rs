use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Duration as ChronoDuration, NaiveDateTime, Utc};
use reqwest::Client;
use serde::Deserialize;
use std::time::Duration;
use tracing::{debug, warn};
use url::Url;

use super::{espn_path, EventSighting, ScoreboardProvider, TeamSighting};
use crate::db::models::EventStatus;
use crate::identity::ScoreUpdate;

const DEFAULT_BASE_URL: &str = "https://site.api.espn.com/apis/site/v2/sports";

#[derive(Debug, Deserialize)]
pub struct ScoreboardResponse {
    #[serde(default)]
    pub events: Vec<EspnEvent>,
}

#[derive(Debug, Deserialize)]
pub struct EspnEvent {
    pub id: String,
    pub date: String,
    #[serde(default)]
    pub competitions: Vec<Competition>,
    pub status: Option<EspnStatus>,
}

#[derive(Debug, Deserialize)]
pub struct Competition {
    #[serde(default)]
    pub competitors: Vec<Competitor>,
    pub status: Option<EspnStatus>,
}

#[derive(Debug, Deserialize)]
pub struct Competitor {
    #[serde(rename = "homeAway")]
    pub home_away: String,
    pub score: Option<String>,
    pub team: EspnTeam,
}

#[derive(Debug, Deserialize)]
pub struct EspnTeam {
    pub id: String,
    #[serde(rename = "displayName")]
    pub display_name: String,
    pub abbreviation: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct EspnStatus {
    #[serde(rename = "type")]
    pub status_type: StatusType,
}

#[derive(Debug, Deserialize)]
pub struct StatusType {
    #[serde(default)]
    pub name: String,
    /// "pre" | "in" | "post"
    #[serde(default)]
    pub state: String,
    #[serde(default)]
    pub completed: bool,
    #[serde(rename = "shortDetail")]
    pub short_detail: Option<String>,
}

/// ESPN dates come as "2026-01-15T19:00Z", without seconds.
fn parse_espn_date(raw: &str) -> Option<DateTime<Utc>> {
    NaiveDateTime::parse_from_str(raw, "%Y-%m-%dT%H:%MZ")
        .map(|naive| naive.and_utc())
        .ok()
        .or_else(|| {
            DateTime::parse_from_rfc3339(raw)
                .ok()
                .map(|dt| dt.with_timezone(&Utc))
        })
}

fn map_status(status: &StatusType) -> EventStatus {
    match status.name.as_str() {
        "STATUS_POSTPONED" | "STATUS_CANCELED" | "STATUS_SUSPENDED" => {
            return EventStatus::Postponed
        }
        _ => {}
    }
    match status.state.as_str() {
        "post" if status.completed => EventStatus::Final,
        "post" | "in" => EventStatus::InProgress,
        _ => EventStatus::Scheduled,
    }
}

/// Map one ESPN event to a sighting. Events without exactly one home and one
/// away competitor, or with an unreadable date, are skipped.
pub fn to_sighting(league: &str, event: &EspnEvent) -> Option<EventSighting> {
    let start_time = match parse_espn_date(&event.date) {
        Some(t) => t,
        None => {
            warn!("ESPN event {} has unreadable date '{}'", event.id, event.date);
            return None;
        }
    };
    let competition = event.competitions.first()?;
    let home = competition.competitors.iter().find(|c| c.home_away == "home")?;
    let away = competition.competitors.iter().find(|c| c.home_away == "away")?;
    let status_type = &competition
        .status
        .as_ref()
        .or(event.status.as_ref())?
        .status_type;
    let status = map_status(status_type);

    let score = match status {
        EventStatus::InProgress | EventStatus::Final => {
            let home_score = home.score.as_deref().and_then(|s| s.trim().parse().ok());
            let away_score = away.score.as_deref().and_then(|s| s.trim().parse().ok());
            match (home_score, away_score) {
                (Some(home_score), Some(away_score)) => Some(ScoreUpdate {
                    home_score,
                    away_score,
                    is_final: status.is_final(),
                    period: status_type.short_detail.clone(),
                }),
                _ => None,
            }
        }
        _ => None,
    };

    let team = |c: &Competitor| TeamSighting {
        provider_team_id: c.team.id.clone(),
        name: c.team.display_name.clone(),
        abbreviation: c.team.abbreviation.clone(),
    };

    Some(EventSighting {
        provider_event_id: event.id.clone(),
        league: league.to_ascii_uppercase(),
        start_time,
        home: team(home),
        away: team(away),
        status,
        score,
    })
}

/// ESPN public scoreboard. Asks for yesterday and today so late finals are
/// picked up after midnight UTC.
pub struct EspnClient {
    http: Client,
    /// Base URL for overriding in tests
    base_url: String,
}

impl EspnClient {
    pub fn new(base_url: Option<&str>, timeout: Duration) -> Result<Self> {
        let http = Client::builder()
            .timeout(timeout)
            .build()
            .context("Failed to build HTTP client")?;
        Ok(EspnClient {
            http,
            base_url: base_url.unwrap_or(DEFAULT_BASE_URL).trim_end_matches('/').to_string(),
        })
    }

    fn scoreboard_url(&self, league: &str, now: DateTime<Utc>) -> Result<Url> {
        let path = espn_path(league)
            .with_context(|| format!("ESPN has no scoreboard for league {}", league))?;
        let mut url = Url::parse(&format!("{}/{}/scoreboard", self.base_url, path))
            .context("Invalid ESPN base URL")?;
        let from = (now - ChronoDuration::days(1)).format("%Y%m%d");
        let to = now.format("%Y%m%d");
        {
            let mut query = url.query_pairs_mut();
            query.append_pair("dates", &format!("{}-{}", from, to));
            query.append_pair("limit", "500");
            if matches!(league.to_ascii_uppercase().as_str(), "NCAAM" | "NCAAB" | "NCAAW") {
                // Division I only
                query.append_pair("groups", "50");
            }
        }
        Ok(url)
    }
}

#[async_trait]
impl ScoreboardProvider for EspnClient {
    fn name(&self) -> &str {
        "espn"
    }

    async fn fetch_scoreboard(&self, league: &str) -> Result<Vec<EventSighting>> {
        let url = self.scoreboard_url(league, Utc::now())?;
        debug!("Fetching ESPN scoreboard {}", url);

        let resp = self
            .http
            .get(url)
            .send()
            .await
            .context("ESPN request failed")?;
        if !resp.status().is_success() {
            anyhow::bail!("ESPN error: {}", resp.status());
        }
        let body: ScoreboardResponse = resp
            .json()
            .await
            .context("Failed to parse ESPN scoreboard")?;

        let sightings: Vec<EventSighting> = body
            .events
            .iter()
            .filter_map(|event| to_sighting(league, event))
            .collect();
        debug!(
            "ESPN {}: {} of {} events usable",
            league,
            sightings.len(),
            body.events.len()
        );
        Ok(sightings)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    const SAMPLE: &str = r#"{
      "events": [
        {
          "id": "401720001",
          "date": "2026-01-15T19:00Z",
          "status": {"type": {"name": "STATUS_FINAL", "state": "post", "completed": true, "shortDetail": "Final/OT"}},
          "competitions": [{
            "status": {"type": {"name": "STATUS_FINAL", "state": "post", "completed": true, "shortDetail": "Final/OT"}},
            "competitors": [
              {"homeAway": "home", "score": "81", "team": {"id": "150", "displayName": "Duke Blue Devils", "abbreviation": "DUKE"}},
              {"homeAway": "away", "score": "79", "team": {"id": "153", "displayName": "North Carolina Tar Heels", "abbreviation": "UNC"}}
            ]
          }]
        },
        {
          "id": "401720002",
          "date": "2026-01-16T00:30Z",
          "competitions": [{
            "status": {"type": {"name": "STATUS_SCHEDULED", "state": "pre", "completed": false, "shortDetail": "7:30 PM"}},
            "competitors": [
              {"homeAway": "home", "score": "0", "team": {"id": "2", "displayName": "Auburn Tigers"}},
              {"homeAway": "away", "score": "0", "team": {"id": "333", "displayName": "Alabama Crimson Tide"}}
            ]
          }]
        },
        {
          "id": "401720003",
          "date": "not a date",
          "competitions": []
        }
      ]
    }"#;

    #[test]
    fn test_parse_scoreboard() {
        let body: ScoreboardResponse = serde_json::from_str(SAMPLE).unwrap();
        let sightings: Vec<EventSighting> = body
            .events
            .iter()
            .filter_map(|e| to_sighting("ncaam", e))
            .collect();
        assert_eq!(sightings.len(), 2);

        let final_game = &sightings[0];
        assert_eq!(final_game.league, "NCAAM");
        assert_eq!(final_game.start_time, Utc.with_ymd_and_hms(2026, 1, 15, 19, 0, 0).unwrap());
        assert_eq!(final_game.home.provider_team_id, "150");
        assert_eq!(final_game.away.abbreviation.as_deref(), Some("UNC"));
        assert_eq!(final_game.status, EventStatus::Final);
        let score = final_game.score.as_ref().unwrap();
        assert_eq!((score.home_score, score.away_score), (81, 79));
        assert!(score.is_final);
        assert_eq!(score.period.as_deref(), Some("Final/OT"));

        // Pre-game zeros are not a score.
        assert_eq!(sightings[1].status, EventStatus::Scheduled);
        assert!(sightings[1].score.is_none());
    }

    #[test]
    fn test_status_mapping() {
        let status = |name: &str, state: &str, completed: bool| StatusType {
            name: name.into(),
            state: state.into(),
            completed,
            short_detail: None,
        };
        assert_eq!(map_status(&status("STATUS_IN_PROGRESS", "in", false)), EventStatus::InProgress);
        assert_eq!(map_status(&status("STATUS_POSTPONED", "post", false)), EventStatus::Postponed);
        assert_eq!(map_status(&status("STATUS_FINAL", "post", true)), EventStatus::Final);
        assert_eq!(map_status(&status("STATUS_SCHEDULED", "pre", false)), EventStatus::Scheduled);
    }

    #[test]
    fn test_date_formats() {
        let expected = Utc.with_ymd_and_hms(2026, 1, 15, 19, 0, 0).unwrap();
        assert_eq!(parse_espn_date("2026-01-15T19:00Z"), Some(expected));
        assert_eq!(parse_espn_date("2026-01-15T19:00:00Z"), Some(expected));
        assert_eq!(parse_espn_date("yesterday"), None);
    }

    #[test]
    fn test_scoreboard_url() {
        let client = EspnClient::new(Some("http://localhost:9/sports/"), Duration::from_secs(1)).unwrap();
        let now = Utc.with_ymd_and_hms(2026, 1, 15, 3, 0, 0).unwrap();
        let url = client.scoreboard_url("NCAAM", now).unwrap();
        assert_eq!(url.path(), "/sports/basketball/mens-college-basketball/scoreboard");
        let query = url.query().unwrap();
        assert!(query.contains("dates=20260114-20260115"));
        assert!(query.contains("groups=50"));
        assert!(client.scoreboard_url("EPL", now).is_err());
    }
}
