use std::{net::SocketAddr, sync::Arc};

use anyhow::Context;
use tokio::signal;
use tracing::{error, info};

use commerce_core as api;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cfg = Arc::new(api::config::load_config().context("failed to load configuration")?);
    api::config::init_tracing(&cfg.log_level, cfg.log_json);
    api::handlers::health::init_start_time();

    // Init events
    let (event_sender, event_rx) = api::events::EventSender::channel(cfg.event_channel_capacity);
    let event_sender = Arc::new(event_sender);
    let dispatcher: Arc<dyn api::notifications::NotificationDispatcher> =
        Arc::new(api::notifications::LoggingNotificationDispatcher);
    let event_loop = tokio::spawn(api::events::process_events(event_rx, dispatcher));

    // Build services
    let seed = match &cfg.catalog_seed_path {
        Some(path) => {
            info!("Loading catalog seed from {}", path);
            api::services::factory::CommerceSeed::from_path(path)?
        }
        None => api::services::factory::CommerceSeed::default(),
    };
    let clock: api::clock::SharedClock = Arc::new(api::clock::SystemClock);
    let services =
        api::services::factory::ServiceFactory::new(cfg.clone(), event_sender.clone(), clock)
            .with_seed(seed)
            .build()
            .context("failed to build services")?;

    // Reservation expiry, abandoned sessions and stale carts
    let sweepers = services.spawn_sweepers();

    let app_state = Arc::new(api::AppState::new(services, event_sender));
    let app = api::app_router(app_state);

    // Bind and serve
    let addr: SocketAddr = format!("{}:{}", cfg.host, cfg.port)
        .parse()
        .with_context(|| format!("invalid listen address {}:{}", cfg.host, cfg.port))?;
    info!("commerce-core listening on http://{}", addr);
    let listener = tokio::net::TcpListener::bind(addr).await?;

    axum::serve(listener, app.into_make_service())
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    for sweeper in sweepers {
        sweeper.abort();
    }
    event_loop.abort();
    info!("Shutdown complete");
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            error!("Failed to install Ctrl+C handler: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        use tokio::signal::unix::{signal, SignalKind};

        match signal(SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                error!("Failed to install SIGTERM handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
    info!("Shutdown signal received");
}
