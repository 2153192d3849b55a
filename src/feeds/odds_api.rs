use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use reqwest::Client;
use serde::Deserialize;
use std::time::Duration;
use tracing::debug;
use url::Url;

use super::{odds_api_sport, OddsProvider, OddsSighting, QuoteSighting};
use crate::db::models::{MarketType, Side};
use crate::identity::normalize_name;

const DEFAULT_BASE_URL: &str = "https://api.the-odds-api.com/v4";

#[derive(Debug, Deserialize, Clone, Default)]
#[serde(default)]
pub struct OddsApiEvent {
    pub id: String,
    pub sport_key: String,
    pub commence_time: Option<DateTime<Utc>>,
    pub home_team: String,
    pub away_team: String,
    pub bookmakers: Vec<Bookmaker>,
}

#[derive(Debug, Deserialize, Clone, Default)]
#[serde(default)]
pub struct Bookmaker {
    pub key: String,
    pub title: String,
    pub last_update: Option<DateTime<Utc>>,
    pub markets: Vec<Market>,
}

#[derive(Debug, Deserialize, Clone, Default)]
#[serde(default)]
pub struct Market {
    pub key: String,
    pub last_update: Option<DateTime<Utc>>,
    pub outcomes: Vec<Outcome>,
}

#[derive(Debug, Deserialize, Clone, Default)]
#[serde(default)]
pub struct Outcome {
    pub name: String,
    pub price: Option<f64>,
    pub point: Option<f64>,
}

fn market_type(key: &str) -> Option<MarketType> {
    match key {
        "spreads" => Some(MarketType::Spread),
        "totals" => Some(MarketType::Total),
        "h2h" => Some(MarketType::Moneyline),
        // Halves, alternates and props
        _ => None,
    }
}

fn outcome_side(event: &OddsApiEvent, market: MarketType, name: &str) -> Option<Side> {
    match market {
        MarketType::Total => match name.to_ascii_lowercase().as_str() {
            "over" => Some(Side::Over),
            "under" => Some(Side::Under),
            _ => None,
        },
        MarketType::Spread | MarketType::Moneyline => {
            let name = normalize_name(name);
            if name == normalize_name(&event.home_team) {
                Some(Side::Home)
            } else if name == normalize_name(&event.away_team) {
                Some(Side::Away)
            } else {
                // "Draw" on three-way moneylines
                None
            }
        }
    }
}

/// Flatten an event's bookmakers into one quote per book, market and side.
/// Events without a commence time are skipped.
pub fn to_sighting(league: &str, event: &OddsApiEvent, fetched_at: DateTime<Utc>) -> Option<OddsSighting> {
    let commence_time = event.commence_time?;
    let mut quotes = Vec::new();
    for bookmaker in &event.bookmakers {
        for market in &bookmaker.markets {
            let Some(market_type) = market_type(&market.key) else {
                continue;
            };
            let captured_at = market
                .last_update
                .or(bookmaker.last_update)
                .unwrap_or(fetched_at);
            for outcome in &market.outcomes {
                let Some(side) = outcome_side(event, market_type, &outcome.name) else {
                    continue;
                };
                quotes.push(QuoteSighting {
                    book: bookmaker.key.clone(),
                    market_type,
                    side,
                    line: match market_type {
                        MarketType::Moneyline => None,
                        _ => outcome.point,
                    },
                    price: outcome.price,
                    captured_at,
                });
            }
        }
    }
    Some(OddsSighting {
        provider_event_id: event.id.clone(),
        league: league.to_ascii_uppercase(),
        home_name: event.home_team.clone(),
        away_name: event.away_team.clone(),
        commence_time,
        quotes,
    })
}

/// The Odds API v4 client. American prices, US books.
pub struct OddsApiClient {
    http: Client,
    api_key: String,
    base_url: String,
    regions: String,
}

impl OddsApiClient {
    pub fn new(api_key: &str, base_url: Option<&str>, regions: &str, timeout: Duration) -> Result<Self> {
        let http = Client::builder()
            .timeout(timeout)
            .build()
            .context("Failed to build HTTP client")?;
        Ok(OddsApiClient {
            http,
            api_key: api_key.to_string(),
            base_url: base_url.unwrap_or(DEFAULT_BASE_URL).trim_end_matches('/').to_string(),
            regions: regions.to_string(),
        })
    }

    fn odds_url(&self, league: &str) -> Result<Url> {
        let sport = odds_api_sport(league)
            .with_context(|| format!("The Odds API has no sport key for league {}", league))?;
        let mut url = Url::parse(&format!("{}/sports/{}/odds", self.base_url, sport))
            .context("Invalid Odds API base URL")?;
        url.query_pairs_mut()
            .append_pair("apiKey", &self.api_key)
            .append_pair("regions", &self.regions)
            .append_pair("markets", "spreads,totals,h2h")
            .append_pair("oddsFormat", "american")
            .append_pair("dateFormat", "iso");
        Ok(url)
    }
}

#[async_trait]
impl OddsProvider for OddsApiClient {
    fn name(&self) -> &str {
        "odds_api"
    }

    async fn fetch_odds(&self, league: &str) -> Result<Vec<OddsSighting>> {
        let url = self.odds_url(league)?;
        let resp = self
            .http
            .get(url)
            .send()
            .await
            .context("Odds API request failed")?;
        let status = resp.status();
        if let Some(remaining) = resp
            .headers()
            .get("x-requests-remaining")
            .and_then(|v| v.to_str().ok())
        {
            debug!("Odds API quota remaining: {}", remaining);
        }
        let body = resp.text().await.context("Failed to read Odds API response")?;
        if !status.is_success() {
            anyhow::bail!("Odds API error {}: {}", status, body);
        }
        let events: Vec<OddsApiEvent> =
            serde_json::from_str(&body).context("Failed to parse Odds API response")?;

        let fetched_at = Utc::now();
        Ok(events
            .iter()
            .filter_map(|e| to_sighting(league, e, fetched_at))
            .collect())
    }
}
