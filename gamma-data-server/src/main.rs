use clap::Parser;
use gamma_data::{
    calendar::MarketCalendar,
    config::{ServiceConfig, UpstreamConfig},
    credential::{CredentialStore, EnvTokenRefresher, TokenFileRefresher},
    error::DataError,
    expiry::{ExpiryCache, ExpiryResolver},
    fetcher::Fetcher,
    health::ServiceHealth,
    instrument::{SymbolSource, Tier, Universe},
    policy::RetryPolicy,
    scheduler::CadenceLoop,
    store::InMemoryStore,
    upstream::{MarketDataApi, upstox::UpstoxClient},
};
use std::{path::PathBuf, sync::Arc, time::Duration};
use tokio::{sync::watch, task::JoinHandle};
use tracing::{error, info, warn};

/// Polls option chains on two cadences and logs gamma-blast precursors.
#[derive(Debug, Parser)]
#[command(name = "gamma-data-server", version, about)]
struct Cli {
    /// Optional TOML configuration file
    #[arg(long)]
    config: Option<PathBuf>,

    /// Slow (equity) loop cadence in seconds
    #[arg(long)]
    interval: Option<u64>,

    /// Fast (index) loop cadence in seconds
    #[arg(long)]
    fast_interval: Option<u64>,

    /// Poll outside market hours
    #[arg(long)]
    force: bool,

    /// Instruments JSON describing the universe, re-read every pass
    #[arg(long)]
    universe: Option<PathBuf>,
}

impl Cli {
    fn apply(&self, config: &mut ServiceConfig) {
        if let Some(interval) = self.interval {
            config.scheduler.slow_interval_secs = interval;
        }
        if let Some(interval) = self.fast_interval {
            config.scheduler.fast_interval_secs = interval;
        }
        if self.force {
            config.scheduler.force = true;
        }
    }
}

#[tokio::main]
async fn main() {
    init_logging();

    let cli = Cli::parse();
    if let Err(error) = run(cli).await {
        error!(%error, "gamma-data-server exited with error");
        std::process::exit(1);
    }
}

async fn run(cli: Cli) -> Result<(), DataError> {
    let mut config = ServiceConfig::load(cli.config.as_deref())?;
    cli.apply(&mut config);
    config.validate()?;

    let calendar = MarketCalendar::from_config(&config.calendar)?;
    let (universe, fast_source, slow_source) = match &cli.universe {
        Some(path) => (
            Universe::load(path).await?,
            SymbolSource::file(path, Tier::Fast),
            SymbolSource::file(path, Tier::Slow),
        ),
        None => {
            info!("no universe file given, polling the built-in index set only");
            let universe = Universe::default_indices();
            (
                universe.clone(),
                SymbolSource::Fixed(universe.fast),
                SymbolSource::Fixed(universe.slow),
            )
        }
    };

    info!(
        fast_symbols = universe.fast.len(),
        slow_symbols = universe.slow.len(),
        fast_interval_secs = config.scheduler.fast_interval_secs,
        slow_interval_secs = config.scheduler.slow_interval_secs,
        force = config.scheduler.force,
        "starting gamma-data-server"
    );

    let credentials = init_credentials(&config.upstream).await?;
    let api: Arc<dyn MarketDataApi> = Arc::new(UpstoxClient::new(&config.upstream)?);
    let store = Arc::new(InMemoryStore::from_config(&config.store));
    let health = Arc::new(ServiceHealth::default());
    let policy = RetryPolicy::from(&config.retry);

    let resolver = ExpiryResolver::new(
        Arc::clone(&api),
        credentials.clone(),
        calendar,
        policy,
        config.fetcher.request_spacing(),
        Arc::new(ExpiryCache::default()),
    );
    let fetcher = Fetcher::new(
        api,
        store.clone(),
        resolver,
        credentials,
        policy,
        config.fetcher,
        config.expiry,
        Arc::clone(&health),
    );

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let fast = tokio::spawn(
        CadenceLoop::new(
            "fast",
            fast_source,
            Duration::from_secs(config.scheduler.fast_interval_secs),
            fetcher.clone(),
            calendar,
            config.scheduler,
        )
        .run(shutdown_rx.clone()),
    );
    let slow = tokio::spawn(
        CadenceLoop::new(
            "slow",
            slow_source,
            Duration::from_secs(config.scheduler.slow_interval_secs),
            fetcher,
            calendar,
            config.scheduler,
        )
        .run(shutdown_rx),
    );

    tokio::spawn(async move {
        match tokio::signal::ctrl_c().await {
            Ok(()) => {
                info!("shutdown requested, finishing in-flight batches");
                let _ = shutdown_tx.send(true);
            }
            Err(error) => warn!(%error, "failed to listen for ctrl-c, running until loops stop"),
        }
    });

    let (fast, slow) = tokio::join!(join("fast", fast), join("slow", slow));

    for row in store.latest_per_symbol() {
        info!(
            symbol = %row.symbol,
            expiry = %row.expiry,
            time = %row.time,
            probability = row.signal.probability,
            direction = %row.signal.direction,
            risk = %row.signal.risk_level,
            sentiment = %row.sentiment.sentiment,
            "latest signal"
        );
    }
    match serde_json::to_string(&health.snapshot()) {
        Ok(snapshot) => info!(health = %snapshot, "gamma-data-server stopped"),
        Err(error) => warn!(%error, "failed to serialise final health snapshot"),
    }

    fast.and(slow)
}

/// Await a cadence loop task, logging how it ended.
async fn join(name: &str, handle: JoinHandle<Result<(), DataError>>) -> Result<(), DataError> {
    match handle.await {
        Ok(Ok(())) => {
            info!(cadence_loop = name, "cadence loop finished");
            Ok(())
        }
        Ok(Err(error)) => {
            error!(cadence_loop = name, %error, "cadence loop stopped on error");
            Err(error)
        }
        Err(join_error) => {
            error!(cadence_loop = name, %join_error, "cadence loop task panicked");
            Err(DataError::Config(format!("{name} loop task failed: {join_error}")))
        }
    }
}

/// Initial token from `UPSTOX_ACCESS_TOKEN`, else from the token file.
///
/// Refreshes re-read the token file when one is configured, the environment otherwise.
async fn init_credentials(config: &UpstreamConfig) -> Result<CredentialStore, DataError> {
    let env = EnvTokenRefresher::default();

    match &config.token_file {
        Some(path) => {
            let file = TokenFileRefresher::new(path);
            let initial = match env.read() {
                Ok(credential) => credential,
                Err(_) => file.read().await?,
            };
            Ok(CredentialStore::new(initial, Arc::new(file)))
        }
        None => {
            let initial = env.read()?;
            Ok(CredentialStore::new(initial, Arc::new(env)))
        }
    }
}

/// Initialise logging, `LOG_FORMAT=json` selects structured JSON output.
fn init_logging() {
    let builder = tracing_subscriber::fmt().with_env_filter(
        tracing_subscriber::EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
    );

    if std::env::var("LOG_FORMAT").is_ok_and(|format| format.eq_ignore_ascii_case("json")) {
        builder.json().init();
    } else {
        builder.init();
    }
}
