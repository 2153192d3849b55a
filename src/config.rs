use clap::{Parser, Subcommand};
use std::time::Duration;

/// Canonical sports line store: ingestion, odds history and pick settlement
#[derive(Parser, Debug, Clone)]
#[command(name = "linekeeper", version, about)]
pub struct Config {
    #[command(subcommand)]
    pub command: Option<Command>,

    /// SQLite database path
    #[arg(long, env = "DATABASE_PATH", default_value = "linekeeper.db", global = true)]
    pub database_path: String,

    /// Ops API listen address
    #[arg(long, env = "API_ADDR", default_value = "0.0.0.0:8080")]
    pub api_addr: String,

    /// Leagues to ingest and settle, comma separated
    #[arg(
        long,
        env = "LEAGUES",
        default_value = "NCAAM",
        value_delimiter = ',',
        global = true
    )]
    pub leagues: Vec<String>,

    /// The Odds API key. Odds ingestion is skipped without one
    #[arg(long, env = "ODDS_API_KEY")]
    pub odds_api_key: Option<String>,

    /// The Odds API base URL
    #[arg(long, env = "ODDS_API_URL", default_value = "https://api.the-odds-api.com/v4")]
    pub odds_api_url: String,

    /// Bookmaker regions requested from The Odds API
    #[arg(long, env = "ODDS_API_REGIONS", default_value = "us")]
    pub odds_api_regions: String,

    /// ESPN site API base URL
    #[arg(
        long,
        env = "ESPN_API_URL",
        default_value = "https://site.api.espn.com/apis/site/v2/sports"
    )]
    pub espn_api_url: String,

    /// Per-request timeout for provider calls in seconds
    #[arg(long, env = "FETCH_TIMEOUT_SECS", default_value = "20")]
    pub fetch_timeout_secs: u64,

    /// Scoreboard polling interval in seconds
    #[arg(long, env = "SCORES_INTERVAL_SECS", default_value = "120")]
    pub scores_interval_secs: u64,

    /// Odds polling interval in seconds
    #[arg(long, env = "ODDS_INTERVAL_SECS", default_value = "900")]
    pub odds_interval_secs: u64,

    /// Settlement cycle interval in seconds
    #[arg(long, env = "SETTLEMENT_INTERVAL_SECS", default_value = "300")]
    pub settlement_interval_secs: u64,

    /// Upper bound on the random delay added to each periodic tick, in seconds
    #[arg(long, env = "JOB_JITTER_SECS", default_value = "10")]
    pub job_jitter_secs: u64,

    /// Odds snapshot bucket width in minutes
    #[arg(long, env = "BUCKET_MINUTES", default_value = "15")]
    pub bucket_minutes: u32,

    /// Half-width of the window used to match events by name, in hours
    #[arg(long, env = "MATCH_WINDOW_HOURS", default_value = "6")]
    pub match_window_hours: i64,

    /// Team mapping cache entry lifetime in seconds
    #[arg(long, env = "TEAM_CACHE_TTL_SECS", default_value = "3600")]
    pub team_cache_ttl_secs: u64,

    /// Team mapping cache capacity
    #[arg(long, env = "TEAM_CACHE_MAX_ENTRIES", default_value = "10000")]
    pub team_cache_max_entries: usize,

    /// Maximum picks handled per settlement pass
    #[arg(long, env = "SETTLEMENT_BATCH_LIMIT", default_value = "500")]
    pub settlement_batch_limit: usize,

    /// Job lock lifetime in seconds
    #[arg(long, env = "LOCK_TTL_SECS", default_value = "600")]
    pub lock_ttl_secs: u64,

    /// How far back closing lines are backfilled, in hours
    #[arg(long, env = "CLV_LOOKBACK_HOURS", default_value = "72")]
    pub clv_lookback_hours: i64,

    /// Failed name resolutions before a pick is quarantined
    #[arg(long, env = "PICK_RESOLUTION_MAX_ATTEMPTS", default_value = "5")]
    pub pick_resolution_max_attempts: u32,
}

#[derive(Subcommand, Debug, Clone, PartialEq, Eq)]
pub enum Command {
    /// Run periodic jobs and the ops API (default)
    Serve,
    /// Fetch scoreboards once and exit
    IngestScores,
    /// Fetch odds once and exit
    IngestOdds,
    /// Attach events to picks recorded by matchup name, then exit
    ResolvePicks,
    /// Run one settlement cycle per league and exit
    Settle,
}

impl Config {
    pub fn command(&self) -> Command {
        self.command.clone().unwrap_or(Command::Serve)
    }

    /// Leagues upper-cased, blanks dropped.
    pub fn leagues(&self) -> Vec<String> {
        self.leagues
            .iter()
            .map(|l| l.trim().to_ascii_uppercase())
            .filter(|l| !l.is_empty())
            .collect()
    }

    pub fn bucket_width(&self) -> chrono::Duration {
        chrono::Duration::minutes(i64::from(self.bucket_minutes))
    }

    pub fn match_window(&self) -> chrono::Duration {
        chrono::Duration::hours(self.match_window_hours)
    }

    pub fn lock_ttl(&self) -> chrono::Duration {
        chrono::Duration::seconds(self.lock_ttl_secs as i64)
    }

    pub fn fetch_timeout(&self) -> Duration {
        Duration::from_secs(self.fetch_timeout_secs)
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        if self.leagues().is_empty() {
            anyhow::bail!("LEAGUES must name at least one league");
        }
        if self.bucket_minutes == 0 {
            anyhow::bail!("bucket_minutes must be positive");
        }
        if 60 % self.bucket_minutes != 0 {
            anyhow::bail!(
                "bucket_minutes must divide an hour evenly (got {})",
                self.bucket_minutes
            );
        }
        if self.match_window_hours <= 0 {
            anyhow::bail!("match_window_hours must be positive");
        }
        if self.lock_ttl_secs == 0 {
            anyhow::bail!("lock_ttl_secs must be positive");
        }
        if self.fetch_timeout_secs == 0 {
            anyhow::bail!("fetch_timeout_secs must be positive");
        }
        if self.scores_interval_secs == 0
            || self.odds_interval_secs == 0
            || self.settlement_interval_secs == 0
        {
            anyhow::bail!("job intervals must be positive");
        }
        if self.pick_resolution_max_attempts < 1 {
            anyhow::bail!("pick_resolution_max_attempts must be at least 1");
        }
        Ok(())
    }
}
