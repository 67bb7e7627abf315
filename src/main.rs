use couch_deploy::api::build_router;
use couch_deploy::command::CommandRunner;
use couch_deploy::logging::setup_logging;
use couch_deploy::notify::{BroadcastService, Notification, Notifier};
use couch_deploy::{AppState, critical, load_config};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::sync::broadcast;
use tracing::info;

const DEFAULT_BIND_ADDRESS: &str = "127.0.0.1:8888";
const DEFAULT_CONFIG_PATH: &str = "config.toml";
const NOTIFICATION_CHANNEL_CAPACITY: usize = 100;

#[tokio::main]
async fn main() {
    dotenv::dotenv().ok();

    let bind_address =
        std::env::var("BIND_ADDRESS").unwrap_or_else(|_| DEFAULT_BIND_ADDRESS.to_string());
    let config_path =
        std::env::var("COUCH_DEPLOY_CONFIG").unwrap_or_else(|_| DEFAULT_CONFIG_PATH.to_string());

    let config = match load_config(&config_path) {
        Ok(cfg) => Arc::new(cfg),
        Err(e) => {
            eprintln!("Configuration error: {}", e);
            std::process::exit(1);
        }
    };

    // Keep the guard alive so buffered log lines are flushed on exit
    let _log_guard = match setup_logging(config.log_level, config.log_dir.as_deref()) {
        Ok(guard) => guard,
        Err(e) => {
            eprintln!("Logging error: {}", e);
            std::process::exit(1);
        }
    };

    let (notifications, _) = broadcast::channel::<Notification>(NOTIFICATION_CHANNEL_CAPACITY);
    let notifier = match Notifier::from_config(&config) {
        Ok(notifier) => notifier.with_service(Arc::new(BroadcastService::new(notifications.clone()))),
        Err(e) => {
            critical!("Could not set up notifications: {}", e);
            std::process::exit(1);
        }
    };

    let runner = Arc::new(CommandRunner::new(notifier));
    let state = Arc::new(AppState::new(Arc::clone(&config), runner, notifications));
    let app = build_router(state);

    info!("Using config at {:?}", config_path);
    info!(
        "Watching {} unit(s) under {}",
        config.folders_to_trigger_on.len(),
        config.local_path.display()
    );

    let listener = match tokio::net::TcpListener::bind(&bind_address).await {
        Ok(listener) => listener,
        Err(e) => {
            critical!("Could not bind {}: {}", bind_address, e);
            std::process::exit(1);
        }
    };
    info!(
        "Listening on {}, webhook at {}",
        bind_address,
        config.route_path()
    );

    if let Err(e) = axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .await
    {
        critical!("Server error: {}", e);
        std::process::exit(1);
    }
}
