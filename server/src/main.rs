mod auth;
mod config;
mod files;
mod proto;
mod relay;
mod routes;
mod routing;
mod state;
mod voice;
mod ws;

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use tokio::net::TcpListener;
use uuid::Uuid;

use config::{generate_config_template, Config};
use relay::RelayBus;
use routing::RoutingStore;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Load config with layered precedence: defaults < TOML < env < CLI
    let config = Config::load()?;

    // Handle --generate-config: print template and exit
    if config.generate_config {
        print!("{}", generate_config_template());
        return Ok(());
    }

    // Initialize tracing/logging
    if config.json_logs {
        tracing_subscriber::fmt()
            .json()
            .with_env_filter(
                tracing_subscriber::EnvFilter::try_from_default_env()
                    .unwrap_or_else(|_| "switchboard_server=info".parse().unwrap()),
            )
            .init();
    } else {
        tracing_subscriber::fmt()
            .pretty()
            .with_env_filter(
                tracing_subscriber::EnvFilter::try_from_default_env()
                    .unwrap_or_else(|_| "switchboard_server=info".parse().unwrap()),
            )
            .init();
    }

    tracing::info!("Switchboard server v{} starting", env!("CARGO_PKG_VERSION"));

    std::fs::create_dir_all(&config.data_dir)?;

    // Secret shared with the external auth service
    let jwt_secret = auth::jwt::load_or_generate_jwt_secret(&config.data_dir)?;

    // --- Routing store & relay bus ---
    // With a redis_url the store and bus are shared across processes;
    // without one this process is the whole deployment.
    let op_timeout = Duration::from_millis(config.store_timeout_ms);
    let (store, bus): (Arc<dyn RoutingStore>, Arc<dyn RelayBus>) = match &config.redis_url {
        Some(url) => {
            let store = routing::RedisStore::connect(url, op_timeout)
                .await
                .map_err(|e| format!("routing store connect failed: {e}"))?;
            let bus = relay::RedisBus::connect(url, op_timeout)
                .await
                .map_err(|e| format!("relay bus connect failed: {e}"))?;
            tracing::info!("connected to shared routing store and relay bus");
            (Arc::new(store), Arc::new(bus))
        }
        None => {
            tracing::info!("no redis_url configured, running single-process with in-memory backends");
            (
                Arc::new(routing::MemoryStore::new()),
                Arc::new(relay::MemoryBus::new()),
            )
        }
    };

    // Each process owns exactly one relay topic; routing entries written
    // by this process's connections point at it.
    let process_topic = relay::process_topic(&Uuid::now_v7().simple().to_string());
    let connections = ws::new_connection_registry();

    // Subscribe to our topic and bridge inbound frames to local sockets
    let ingress_rx = bus
        .subscribe(&process_topic)
        .await
        .map_err(|e| format!("relay bus subscribe failed: {e}"))?;
    tokio::spawn(relay::ingress::run(ingress_rx, connections.clone()));
    tracing::info!(topic = %process_topic, "subscribed to relay topic");

    // Build application state
    let app_state = state::AppState {
        connections,
        store,
        bus,
        jwt_secret,
        process_topic,
        route_ttl_secs: config.route_ttl_secs,
    };

    // Build router
    let app = routes::build_router(app_state);

    // Bind and serve
    let addr = format!("{}:{}", config.bind_address, config.port);
    let listener = TcpListener::bind(&addr).await?;
    tracing::info!("Listening on {}", addr);

    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .await?;

    Ok(())
}
