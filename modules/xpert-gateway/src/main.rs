use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use axum::Router;
use event_bus::{EventBus, InMemoryBus, NatsBus};
use tower_http::cors::CorsLayer;
use tracing_subscriber::EnvFilter;

use xpert_gateway_rs::aggregator::{AggregationOrchestrator, Snapshot};
use xpert_gateway_rs::admin_log::AdminActionLogger;
use xpert_gateway_rs::config::{BusType, Config};
use xpert_gateway_rs::db;
use xpert_gateway_rs::direct_configs::DirectConfigStore;
use xpert_gateway_rs::event_publisher::run_event_publisher;
use xpert_gateway_rs::health::health;
use xpert_gateway_rs::identity::{FallbackTokenResolver, TokenResolver};
use xpert_gateway_rs::marzban::{HttpMarzbanClient, MarzbanClient, NoopMarzbanClient};
use xpert_gateway_rs::policy::PolicyStore;
use xpert_gateway_rs::prober::Prober;
use xpert_gateway_rs::routes::{admin_router, public_router};
use xpert_gateway_rs::sources::SourceRegistry;
use xpert_gateway_rs::state::AppState;
use xpert_gateway_rs::traffic::TrafficAccounting;

#[tokio::main]
async fn main() {
    dotenvy::dotenv().ok();

    // rustls is built with default-features = false, so no process-default
    // CryptoProvider is installed automatically; without this,
    // rustls::ClientConfig::builder() panics on the first TLS handshake
    // probe.
    rustls::crypto::ring::default_provider()
        .install_default()
        .expect("failed to install rustls ring crypto provider");

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .init();

    let config = Config::from_env().expect("failed to load configuration");
    tracing::info!(bus_type = ?config.bus_type, "configuration loaded");

    let pool = db::init_pool(&config.database_url)
        .await
        .expect("failed to connect to database");
    tracing::info!("database connection established");

    sqlx::migrate!("./db/migrations")
        .run(&pool)
        .await
        .expect("failed to run migrations");
    tracing::info!("database migrations completed");

    let bus: Arc<dyn EventBus> = match config.bus_type {
        BusType::Nats => {
            let nats_url = config.nats_url.as_ref().expect("NATS_URL required for NATS bus");
            tracing::info!("connecting to NATS at {}", nats_url);
            let nats_client = async_nats::connect(nats_url)
                .await
                .expect("failed to connect to NATS");
            Arc::new(NatsBus::new(nats_client))
        }
        BusType::InMemory => {
            tracing::info!("using in-memory event bus");
            Arc::new(InMemoryBus::new())
        }
    };

    let publisher_pool = pool.clone();
    let publisher_bus = bus.clone();
    tokio::spawn(async move {
        run_event_publisher(publisher_pool, publisher_bus).await;
    });
    tracing::info!("background event publisher started");

    tokio::fs::create_dir_all(&config.state_dir)
        .await
        .expect("failed to create state directory");

    let sources = Arc::new(SourceRegistry::load(config.state_dir.join("sources.json")).await);
    let direct_configs =
        Arc::new(DirectConfigStore::load(config.state_dir.join("direct_configs.json")).await);
    let policy = Arc::new(
        PolicyStore::load(
            config.state_dir.join("policy.json"),
            config.state_dir.join("legacy_hwid_locks.json"),
        )
        .await,
    );
    let prober = Arc::new(Prober::new(config.probe_timeout_ms, config.target_ips.clone()));
    let traffic = Arc::new(TrafficAccounting::new(pool.clone()));
    let admin_log = Arc::new(AdminActionLogger::new(pool.clone()));
    let identity: Arc<dyn TokenResolver> = Arc::new(FallbackTokenResolver);

    let marzban: Arc<dyn MarzbanClient> = match (&config.marzban_base_url, &config.marzban_api_token) {
        (Some(base_url), Some(api_token)) => {
            tracing::info!("marzban push-through enabled");
            Arc::new(HttpMarzbanClient::new(base_url.clone(), api_token.clone()))
        }
        _ => {
            tracing::info!("marzban push-through disabled, no base url/token configured");
            Arc::new(NoopMarzbanClient)
        }
    };

    let orchestrator = Arc::new(AggregationOrchestrator::new(
        pool.clone(),
        sources.clone(),
        prober.clone(),
        marzban,
        Arc::new(Snapshot::empty()),
        Duration::from_secs(config.source_fetch_timeout_secs),
        Duration::from_secs(config.aggregation_tick_timeout_secs),
        config.marzban_fallback_tag.clone(),
    ));
    orchestrator.clone().spawn_scheduler(config.aggregation_interval_secs);
    tracing::info!(
        interval_secs = config.aggregation_interval_secs,
        "aggregation scheduler started"
    );

    let state = AppState {
        config: Arc::new(config),
        pool: pool.clone(),
        sources,
        direct_configs,
        policy,
        traffic,
        admin_log,
        orchestrator,
        prober,
        identity,
    };

    let app = Router::new()
        .route("/health", axum::routing::get(health))
        .merge(public_router())
        .merge(admin_router())
        .with_state(state)
        .layer(
            CorsLayer::new()
                .allow_origin(tower_http::cors::Any)
                .allow_methods(tower_http::cors::Any)
                .allow_headers(tower_http::cors::Any),
        );

    let host = std::env::var("HOST").unwrap_or_else(|_| "0.0.0.0".to_string());
    let port: u16 = std::env::var("PORT")
        .unwrap_or_else(|_| "8090".to_string())
        .parse()
        .expect("PORT must be a valid u16");
    let addr: SocketAddr = format!("{host}:{port}").parse().expect("invalid HOST/PORT");

    tracing::info!("xpert-gateway listening on {}", addr);

    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .expect("failed to bind");

    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .await
    .expect("server failed to start");
}
