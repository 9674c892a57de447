use axum::{routing::get, Router};
use std::{net::SocketAddr, sync::Arc};
use tokio::time::{interval, Duration};
use tower_http::{cors::CorsLayer, trace::TraceLayer};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use valet_server::{
    chat::SlackChat,
    config::Config,
    db,
    dedup::EventDedup,
    encryption::{kek_from_config, EnvelopeCipher},
    focus::FocusOrchestrator,
    github::GithubClient,
    handlers::{self, AppState},
    metrics,
    models::Provider,
    notify::{Notifier, SseRegistry},
    oauth_state::OAuthStateStore,
    scheduler::{run_backup_sweep, run_job_worker, Scheduler},
    store::{PgStore, Store},
    tokens::TokenVault,
};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load environment variables from .env file
    dotenvy::dotenv().ok();

    // Default to warn in production, debug in development
    let log_level = std::env::var("RUST_LOG").unwrap_or_else(|_| {
        #[cfg(debug_assertions)]
        {
            "debug".to_string()
        }

        #[cfg(not(debug_assertions))]
        {
            "warn".to_string()
        }
    });

    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(&log_level))
        .with(tracing_subscriber::fmt::layer().json())
        .init();

    tracing::info!("Starting Valet server");

    let config = Arc::new(Config::from_env()?);
    tracing::info!(
        kek_provider = config.encryption_kek_provider.as_str(),
        slack_configured = config.slack_client_id.is_some(),
        github_configured = config.github_client_id.is_some(),
        "Configuration loaded"
    );

    // Initialize metrics
    let metrics_recorder = metrics::MetricsRecorder::new();
    let metrics_handle = metrics_recorder.handle().clone();

    // Initialize database and store
    let pool = db::init_db(db::DbConfig {
        database_url: config.database_url.clone(),
        ..db::DbConfig::default()
    })
    .await?;
    let store: Arc<dyn Store> = Arc::new(PgStore::new(pool));
    tracing::info!("Database initialized");

    // Envelope encryption and the token vault
    let kek = kek_from_config(&config)?;
    let cipher = Arc::new(EnvelopeCipher::new(kek));
    let vault = Arc::new(TokenVault::new(store.clone(), cipher));

    // Chat provider, OAuth plumbing
    let slack = Arc::new(SlackChat::new(vault.clone()));
    let oauth_states = Arc::new(OAuthStateStore::new(store.clone()));
    let github = Arc::new(GithubClient::new(
        vault.clone(),
        store.clone(),
        oauth_states.clone(),
        config.github_client_id.clone(),
        config.github_client_secret.clone(),
        config.github_oauth_redirect_uri.clone(),
    ));
    vault.register_refresher(Provider::Github, github.clone());

    // Realtime fanout
    let sse_registry = Arc::new(SseRegistry::new(config.sse_queue_capacity));
    let notifier = Arc::new(Notifier::new(sse_registry.clone(), store.clone()));

    // Scheduler and the state machine
    let scheduler = Arc::new(Scheduler::new(store.clone()));
    let orchestrator = Arc::new(FocusOrchestrator::new(
        store.clone(),
        slack.clone(),
        notifier.clone(),
        scheduler.clone(),
    ));

    // Deferred job worker
    let worker_store = store.clone();
    let worker_orchestrator = orchestrator.clone();
    tokio::spawn(async move {
        run_job_worker(worker_store, worker_orchestrator).await;
    });
    tracing::info!("Deferred job worker started");

    // Quarter-hourly expiration sweep
    let sweep_store = store.clone();
    let sweep_orchestrator = orchestrator.clone();
    tokio::spawn(async move {
        run_backup_sweep(sweep_store, sweep_orchestrator).await;
    });
    tracing::info!("Backup expiration sweep started");

    // Hourly purge of expired KV entries (OAuth states, dedup keys, sidecars)
    let purge_store = store.clone();
    tokio::spawn(async move {
        let mut ticker = interval(Duration::from_secs(3600));
        loop {
            ticker.tick().await;
            match purge_store.kv_purge_expired().await {
                Ok(purged) if purged > 0 => {
                    tracing::debug!(purged, "purged expired KV entries")
                }
                Ok(_) => {}
                Err(e) => tracing::error!(error = %e, "KV purge failed"),
            }
        }
    });
    tracing::info!("KV purge worker started");

    let dedup = Arc::new(EventDedup::new(store.clone()));

    let app_state = AppState {
        config: config.clone(),
        store,
        orchestrator,
        notifier,
        sse_registry,
        vault,
        github,
        slack,
        oauth_states,
        dedup,
    };

    // Only expose metrics when explicitly enabled
    let metrics_router = if config.enable_metrics {
        Router::new()
            .route("/metrics", get(metrics::metrics_handler))
            .with_state(metrics_handle)
    } else {
        Router::new()
    };

    let app = handlers::router(app_state)
        .merge(metrics_router)
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive());

    let addr = SocketAddr::from(([0, 0, 0, 0], config.server_port));
    tracing::info!("Server listening on {}", addr);

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app).await?;

    Ok(())
}
