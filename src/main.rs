use anyhow::Result;
use clap::Parser;
use futures_util::future::join_all;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info, warn};

use linekeeper::api::{self, AppState};
use linekeeper::cache::TtlCache;
use linekeeper::config::{Command, Config};
use linekeeper::db::models::TeamId;
use linekeeper::db::{Database, Repository};
use linekeeper::feeds::{EspnClient, Ingestor, OddsApiClient, OddsProvider, ScoreboardProvider};
use linekeeper::identity::{EventResolver, IdentityResolver, MappingKey};
use linekeeper::jobs::run_periodic;
use linekeeper::odds::OddsStore;
use linekeeper::settlement::{SettlementConfig, SettlementEngine};

/// Everything the jobs and the API share.
#[derive(Clone)]
struct Services {
    repo: Arc<dyn Repository>,
    odds: Arc<OddsStore>,
    ingestor: Arc<Ingestor>,
    settlement: Arc<SettlementEngine>,
    scoreboard: Arc<dyn ScoreboardProvider>,
    odds_feed: Option<Arc<dyn OddsProvider>>,
    leagues: Vec<String>,
    batch_limit: usize,
}

impl Services {
    fn build(config: &Config) -> Result<Self> {
        let db = Database::open(&config.database_path)?;
        info!("Database opened: {}", config.database_path);
        let repo: Arc<dyn Repository> = Arc::new(db);

        let cache: Arc<TtlCache<MappingKey, TeamId>> = Arc::new(TtlCache::new(
            Duration::from_secs(config.team_cache_ttl_secs),
            config.team_cache_max_entries,
        ));
        let identity = Arc::new(IdentityResolver::new(repo.clone(), cache));
        let events = Arc::new(EventResolver::new(
            repo.clone(),
            identity,
            config.match_window(),
        ));
        let odds = Arc::new(OddsStore::new(repo.clone(), config.bucket_width()));
        let ingestor = Arc::new(Ingestor::new(
            repo.clone(),
            events.clone(),
            odds.clone(),
            config.fetch_timeout(),
        ));
        let settlement = Arc::new(SettlementEngine::new(
            repo.clone(),
            odds.clone(),
            events,
            SettlementConfig {
                lock_ttl: config.lock_ttl(),
                clv_lookback: chrono::Duration::hours(config.clv_lookback_hours),
                max_resolution_attempts: config.pick_resolution_max_attempts,
            },
        ));

        let scoreboard: Arc<dyn ScoreboardProvider> = Arc::new(EspnClient::new(
            Some(&config.espn_api_url),
            config.fetch_timeout(),
        )?);
        let odds_feed: Option<Arc<dyn OddsProvider>> = match config.odds_api_key.as_deref() {
            Some(key) if !key.trim().is_empty() => Some(Arc::new(OddsApiClient::new(
                key,
                Some(&config.odds_api_url),
                &config.odds_api_regions,
                config.fetch_timeout(),
            )?)),
            _ => {
                warn!("ODDS_API_KEY not set; odds ingestion disabled");
                None
            }
        };

        Ok(Services {
            repo,
            odds,
            ingestor,
            settlement,
            scoreboard,
            odds_feed,
            leagues: config.leagues(),
            batch_limit: config.settlement_batch_limit,
        })
    }

    async fn ingest_scores(&self) -> Result<()> {
        let runs = self
            .leagues
            .iter()
            .map(|league| self.ingestor.ingest_scoreboard(self.scoreboard.as_ref(), league));
        for (league, outcome) in self.leagues.iter().zip(join_all(runs).await) {
            if let Err(e) = outcome {
                error!("Score ingestion for {} failed: {:#}", league, e);
            }
        }
        Ok(())
    }

    async fn ingest_odds(&self) -> Result<()> {
        let Some(feed) = self.odds_feed.as_ref() else {
            return Ok(());
        };
        let runs = self
            .leagues
            .iter()
            .map(|league| self.ingestor.ingest_odds(feed.as_ref(), league));
        for (league, outcome) in self.leagues.iter().zip(join_all(runs).await) {
            if let Err(e) = outcome {
                error!("Odds ingestion for {} failed: {:#}", league, e);
            }
        }
        Ok(())
    }

    async fn resolve_picks(&self) -> Result<()> {
        let engine = self.settlement.clone();
        let limit = self.batch_limit;
        tokio::task::spawn_blocking(move || engine.resolve_pending_picks(Some(limit))).await??;
        Ok(())
    }

    async fn settle(&self) -> Result<()> {
        // Picks attached this pass can be graded in the same pass.
        self.resolve_picks().await?;
        for league in &self.leagues {
            let engine = self.settlement.clone();
            let league = league.clone();
            let limit = self.batch_limit;
            let report = tokio::task::spawn_blocking(move || {
                engine.run_settlement_cycle(Some(&league), Some(limit))
            })
            .await?;
            if let Err(e) = report {
                error!("Settlement cycle failed: {:#}", e);
            }
        }
        Ok(())
    }
}

fn spawn_job<F, Fut>(name: &'static str, period_secs: u64, jitter_secs: u64, job: F)
where
    F: FnMut() -> Fut + Send + 'static,
    Fut: std::future::Future<Output = Result<()>> + Send + 'static,
{
    info!("Scheduling {} every {}s", name, period_secs);
    tokio::spawn(run_periodic(
        name,
        Duration::from_secs(period_secs),
        Duration::from_secs(jitter_secs),
        job,
    ));
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let config = Config::parse();
    config.validate()?;
    let services = Services::build(&config)?;
    info!("Leagues: {}", services.leagues.join(", "));

    match config.command() {
        Command::IngestScores => services.ingest_scores().await,
        Command::IngestOdds => services.ingest_odds().await,
        Command::ResolvePicks => services.resolve_picks().await,
        Command::Settle => services.settle().await,
        Command::Serve => serve(&config, services).await,
    }
}

async fn serve(config: &Config, services: Services) -> Result<()> {
    let jitter = config.job_jitter_secs;

    let s = services.clone();
    spawn_job("ingest-scores", config.scores_interval_secs, jitter, move || {
        let s = s.clone();
        async move { s.ingest_scores().await }
    });

    if services.odds_feed.is_some() {
        let s = services.clone();
        spawn_job("ingest-odds", config.odds_interval_secs, jitter, move || {
            let s = s.clone();
            async move { s.ingest_odds().await }
        });
    }

    let s = services.clone();
    spawn_job("settlement", config.settlement_interval_secs, jitter, move || {
        let s = s.clone();
        async move { s.settle().await }
    });

    let app = api::router(AppState {
        repo: services.repo.clone(),
        odds: services.odds.clone(),
        settlement: services.settlement.clone(),
        default_limit: services.batch_limit,
    });
    let addr: SocketAddr = config.api_addr.parse()?;
    info!("Ops API listening on http://{}", addr);
    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app).await?;

    Ok(())
}
