use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use sqlx::postgres::PgPoolOptions;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};
use vouch_adapters::{build_providers, ProvidersConfig};
use vouch_core::{AccessTokenSource, Clock, SystemClock};
use vouch_storage::{
    HttpClientConfig, HttpFetcher, MemoryOAuthStore, MemoryProfileStore, MemoryRecordStore,
    MemoryWindowStore, OAuthStore, PgOAuthStore, PgProfileStore, PgRecordStore, PgWindowStore,
    ProfileStore, RecordStore, WindowStore,
};
use vouch_sync::{
    HttpTokenExchanger, IngestConfig, OAuthTokenManager, Orchestrator, Scheduler,
    SlidingWindowLimiter, StoreBackend,
};
use vouch_web::AppState;

const JANITOR_INTERVAL: Duration = Duration::from_secs(300);

#[derive(Debug, Parser)]
#[command(name = "vouch")]
#[command(about = "Testimonial ingestion engine")]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// HTTP surface plus the cron scheduler
    Serve,
    /// Run one provider sync now and print the result
    Sync { provider: String },
    /// Apply database migrations
    Migrate,
    /// List registered providers and whether they are configured
    Providers,
}

struct Engine {
    oauth: Arc<OAuthTokenManager>,
    orchestrator: Arc<Orchestrator>,
    windows: Arc<dyn WindowStore>,
    clock: Arc<dyn Clock>,
}

struct Stores {
    windows: Arc<dyn WindowStore>,
    oauth: Arc<dyn OAuthStore>,
    records: Arc<dyn RecordStore>,
    profiles: Arc<dyn ProfileStore>,
}

async fn open_stores(config: &IngestConfig, backend: StoreBackend, clock: Arc<dyn Clock>) -> Result<Stores> {
    match backend {
        StoreBackend::Postgres => {
            let pool = PgPoolOptions::new()
                .max_connections(10)
                .connect(&config.database_url)
                .await
                .context("connecting to postgres")?;
            Ok(Stores {
                windows: Arc::new(PgWindowStore::new(pool.clone())),
                oauth: Arc::new(PgOAuthStore::new(pool.clone())),
                records: Arc::new(PgRecordStore::new(pool.clone())),
                profiles: Arc::new(PgProfileStore::new(pool)),
            })
        }
        StoreBackend::Memory => {
            warn!("using in-memory stores; limits and tokens are not shared and do not survive restarts");
            Ok(Stores {
                windows: Arc::new(MemoryWindowStore::new()),
                oauth: Arc::new(MemoryOAuthStore::new()),
                records: Arc::new(MemoryRecordStore::new(clock.clone())),
                profiles: Arc::new(MemoryProfileStore::new(clock)),
            })
        }
    }
}

async fn build_engine(config: &IngestConfig, backend: StoreBackend) -> Result<Engine> {
    let clock: Arc<dyn Clock> = Arc::new(SystemClock);
    let stores = open_stores(config, backend, clock.clone()).await?;
    let providers_config = ProvidersConfig::from_env();

    let exchanger = HttpTokenExchanger::new(config.http_timeout(), clock.clone())
        .context("building token exchanger")?;
    let oauth = Arc::new(OAuthTokenManager::new(
        providers_config.oauth_specs(&config.oauth_callback_url),
        stores.oauth,
        Arc::new(exchanger),
        clock.clone(),
    ));

    let http = HttpFetcher::new(HttpClientConfig {
        timeout: config.http_timeout(),
        user_agent: Some(config.user_agent.clone()),
        ..Default::default()
    })
    .context("building http client")?;
    let providers = build_providers(
        &providers_config,
        Arc::new(http),
        oauth.clone() as Arc<dyn AccessTokenSource>,
        &config.oauth_callback_url,
    );

    let orchestrator = Orchestrator::new(
        providers,
        SlidingWindowLimiter::new(stores.windows.clone(), clock.clone()),
        stores.records,
        clock.clone(),
        config.orchestrator_config(),
    )
    .with_profiles(stores.profiles);
    Ok(Engine {
        oauth,
        orchestrator: Arc::new(orchestrator),
        windows: stores.windows,
        clock,
    })
}

fn init_tracing() {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("vouch=info,warn"));
    tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().compact())
        .init();
}

fn cancel_on_ctrl_c(token: CancellationToken) {
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("ctrl-c received; shutting down");
        }
        token.cancel();
    });
}

/// Periodically drops lapsed rate-limit windows and unredeemed OAuth states.
fn spawn_janitor(engine: &Engine, shutdown: CancellationToken) {
    let limiter = SlidingWindowLimiter::new(engine.windows.clone(), engine.clock.clone());
    let oauth = engine.oauth.clone();
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(JANITOR_INTERVAL);
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = ticker.tick() => {}
            }
            match limiter.purge_expired().await {
                Ok(n) => debug!(purged = n, "rate limit windows purged"),
                Err(err) => warn!(error = %err, "rate limit purge failed"),
            }
            match oauth.purge_expired_states().await {
                Ok(n) => debug!(purged = n, "oauth states purged"),
                Err(err) => warn!(error = %err, "oauth state purge failed"),
            }
        }
    });
}

async fn serve(config: IngestConfig) -> Result<()> {
    let engine = build_engine(&config, config.store).await?;
    let shutdown = CancellationToken::new();
    cancel_on_ctrl_c(shutdown.clone());
    spawn_janitor(&engine, shutdown.clone());

    let scheduler = if config.scheduler_enabled {
        let (scheduler, mut runs) =
            Scheduler::new(engine.orchestrator.clone()).context("validating provider schedules")?;
        scheduler.start().await.context("starting scheduler")?;
        tokio::spawn(async move {
            while let Some(run) = runs.recv().await {
                debug!(provider = %run.provider, run_id = %run.run_id, ok = run.succeeded(), "scheduled run finished");
            }
        });
        Some(scheduler)
    } else {
        info!("scheduler disabled; syncs run only when forced");
        None
    };

    let state = AppState::new(engine.oauth.clone(), engine.orchestrator.clone())
        .with_shutdown(shutdown.clone());
    let served = vouch_web::serve(state, config.web_port).await;

    shutdown.cancel();
    if let Some(scheduler) = scheduler {
        scheduler.shutdown().await;
    }
    served.context("http server")
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    init_tracing();

    let cli = Cli::parse();
    let config = IngestConfig::from_env().context("loading configuration")?;

    match cli.command.unwrap_or(Commands::Serve) {
        Commands::Serve => serve(config).await?,
        Commands::Sync { provider } => {
            let engine = build_engine(&config, config.store).await?;
            let cancel = CancellationToken::new();
            cancel_on_ctrl_c(cancel.clone());
            let run = engine
                .orchestrator
                .sync(&provider, &cancel)
                .await
                .with_context(|| format!("syncing {provider}"))?;
            println!("{}", serde_json::to_string_pretty(&run)?);
        }
        Commands::Migrate => {
            let pool = PgPoolOptions::new()
                .max_connections(1)
                .connect(&config.database_url)
                .await
                .context("connecting to postgres")?;
            vouch_storage::run_migrations(&pool)
                .await
                .context("running migrations")?;
            println!("migrations applied");
        }
        Commands::Providers => {
            // Listing needs no shared state.
            let engine = build_engine(&config, StoreBackend::Memory).await?;
            for p in engine.orchestrator.providers() {
                println!(
                    "{:<12} configured={:<5} schedule={:<14} quota={}/{}s oauth={}",
                    p.name, p.configured, p.schedule, p.quota_count, p.quota_window_secs, p.requires_oauth
                );
            }
        }
    }

    Ok(())
}
