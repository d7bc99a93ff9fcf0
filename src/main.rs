use std::{net::SocketAddr, sync::Arc, time::Duration};

use anyhow::Context;
use chrono::Utc;
use tokio::signal;
use tracing::{error, info, warn};

use vaif_api as api;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cfg = api::config::load_config()?;
    api::config::init_tracing(cfg.log_level(), cfg.log_json, cfg.otel_enabled);
    api::errors::expose_error_details(!cfg.is_production());

    // Init DB
    let db_pool = api::db::establish_connection_from_app_config(&cfg)
        .await
        .context("failed to connect to the database")?;
    if cfg.auto_migrate {
        api::db::run_migrations(&db_pool).await.map_err(|e| {
            error!("Failed running migrations: {}", e);
            e
        })?;
    }
    let db_arc = Arc::new(db_pool);

    // Init events
    let (event_sender, event_rx) = api::events::channel(cfg.event_channel_capacity);
    let event_sender = Arc::new(event_sender);
    tokio::spawn(api::events::process_events(event_rx));

    let auth_service = Arc::new(api::auth::AuthService::new(api::auth::AuthConfig::from(
        &cfg,
    )));

    // Aggregate app services used by HTTP handlers
    let collaborators = api::handlers::Collaborators::from_config(&cfg)
        .context("failed to initialize outbound collaborators")?;
    let services = api::handlers::AppServices::new(
        db_arc.clone(),
        event_sender.clone(),
        &cfg,
        collaborators,
    );

    if cfg.expiry_sweep_interval_secs > 0 {
        tokio::spawn(run_expiry_sweep(
            services.quotes.clone(),
            Duration::from_secs(cfg.expiry_sweep_interval_secs),
        ));
    } else {
        info!("expiry sweep disabled");
    }

    let Some(cors_layer) = api::cors_layer(&cfg) else {
        error!("Missing CORS configuration detected; set APP__CORS_ALLOWED_ORIGINS or APP__CORS_ALLOW_ANY_ORIGIN=true");
        anyhow::bail!("Missing CORS configuration: set APP__CORS_ALLOWED_ORIGINS or APP__CORS_ALLOW_ANY_ORIGIN=true");
    };

    let cfg = Arc::new(cfg);
    // Compose shared app state
    let app_state = api::AppState {
        db: db_arc,
        config: cfg.clone(),
        event_sender,
        services,
        auth: auth_service,
        started_at: Utc::now(),
    };
    let app = api::app_router(app_state, cors_layer);

    // Bind and serve
    let addr = SocketAddr::from(([0, 0, 0, 0], cfg.port));
    info!("vaif-api listening on http://{}", addr);
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("failed to bind {}", addr))?;

    axum::serve(listener, app.into_make_service())
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    info!("server stopped");
    Ok(())
}

/// Moves overdue quotes to `expired` on a fixed interval.
async fn run_expiry_sweep(quotes: Arc<api::services::quotes::QuoteService>, every: Duration) {
    let mut ticker = tokio::time::interval(every);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    loop {
        ticker.tick().await;
        match quotes.expire_overdue(Utc::now()).await {
            Ok(0) => {}
            Ok(count) => info!(count, "expired overdue quotes"),
            Err(e) => warn!(error = %e, "expiry sweep failed"),
        }
    }
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            error!(error = %e, "failed to install Ctrl+C handler");
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
                error!(error = %e, "failed to install SIGTERM handler");
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
    info!("shutdown signal received");
}
