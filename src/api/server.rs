//! API server setup

use std::net::{IpAddr, SocketAddr};
use std::time::Duration;

use axum::Router;
use tokio::net::TcpListener;
use tokio::task::JoinHandle;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing::{error, info, warn};

use super::create_router;
use super::state::{AppState, Backends};
use crate::config::Config;

/// Build the router with middleware and resolve the bind address
pub fn create_server(
    state: AppState,
) -> Result<(Router, SocketAddr), Box<dyn std::error::Error + Send + Sync>> {
    let ip: IpAddr = state.config.server.host.parse()?;
    let addr = SocketAddr::new(ip, state.config.server.port);
    let enable_cors = state.config.server.enable_cors;

    let mut router = create_router(state).layer(TraceLayer::new_for_http());

    if enable_cors {
        router = router.layer(
            CorsLayer::new()
                .allow_origin(Any)
                .allow_methods(Any)
                .allow_headers(Any),
        );
    }

    Ok((router, addr))
}

/// Refresh hosts and rates in the background; the first pass runs immediately
pub fn spawn_refresh_loop(state: AppState) -> JoinHandle<()> {
    let period = Duration::from_secs(state.config.server.refresh_interval_secs.max(1));

    tokio::spawn(async move {
        let mut interval = tokio::time::interval(period);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            interval.tick().await;
            let report = state.discovery.refresh().await;
            if !report.failed_sources.is_empty() {
                warn!(failed = ?report.failed_sources, "some host sources failed");
            }
            let rates = state.rates.get_rates(false).await;
            info!(
                hosts = report.hosts,
                enhanced = report.enhanced,
                rates = rates.rates.len(),
                "background refresh done"
            );
        }
    })
}

/// Run the API server until Ctrl-C
pub async fn run_server(config: Config) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    tokio::fs::create_dir_all(&config.server.data_dir).await?;

    let backends = Backends::live(&config);
    let state = AppState::new(config, backends);
    let refresher = spawn_refresh_loop(state.clone());
    let (router, addr) = create_server(state)?;

    let listener = TcpListener::bind(addr).await?;
    info!(addr = %listener.local_addr()?, "evernode-enhanced API listening");

    let served = axum::serve(
        listener,
        router.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!(error = %e, "failed to listen for shutdown signal");
        }
        info!("shutdown signal received");
    })
    .await;

    refresher.abort();
    served?;
    Ok(())
}
