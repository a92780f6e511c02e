// MuxPilot engine
//
// Single-node supervisor for a DAB/DAB+ multiplex:
//   - Owns the active preset (services, identities, bitrates) and persists
//     it as flat JSON under the data directory
//   - Drives the external ODR tools (odr-audioenc / odr-padenc / odr-dabmux)
//     as supervised named processes
//   - Watches stream health and fails services over between primary and
//     backup sources while ON AIR
//   - Keeps DLS text and slideshow artwork in sync with now-playing sources
//
// The browser UI talks JSON over the API in api.rs; put nginx/Caddy in front
// for TLS when exposing it beyond the studio LAN.

mod api;
mod capacity;
mod error;
mod logging;
mod metadata;
mod model;
mod muxcfg;
mod settings;
mod state;
mod storage;
mod supervisor;
mod watchdog;

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use tracing::{info, warn};

use crate::logging::LogSink;
use crate::settings::Settings;
use crate::state::{AppState, EnginePaths};
use crate::supervisor::ProcessSupervisor;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env().add_directive("info".parse()?),
        )
        .init();

    let data_dir =
        std::env::var("MUXPILOT_DATA_DIR").unwrap_or_else(|_| "./data".to_string());
    let paths = EnginePaths::new(PathBuf::from(data_dir));
    paths.ensure_tree()?;

    let settings = Settings::load_or_init(&paths.settings_file())?;
    let sink = Arc::new(LogSink::new(paths.log_file())?);
    let supervisor = Arc::new(ProcessSupervisor::new(settings.odr_bin_dir.clone(), sink.clone()));
    let state = AppState::new(paths, settings.clone(), sink.clone(), supervisor)?;

    let app = api::build_router(state.clone());

    let addr: SocketAddr = std::env::var("MUXPILOT_BIND")
        .unwrap_or_else(|_| format!("{}:{}", settings.host, settings.port))
        .parse()?;

    info!("MuxPilot engine starting on http://{addr}");
    sink.line("web", &format!("engine listening on http://{addr}"));

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    // Take the encoders and the mux down with us; orphaned ODR processes
    // would keep the ports busy for the next start.
    if let Err(e) = state.stop_mux().await {
        warn!("shutdown: stopping mux failed: {e}");
    }
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        tokio::signal::ctrl_c().await.ok();
    };

    #[cfg(unix)]
    let term = async {
        use tokio::signal::unix::{signal, SignalKind};
        let mut sigterm = signal(SignalKind::terminate()).expect("sigterm handler");
        sigterm.recv().await;
    };

    #[cfg(not(unix))]
    let term = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = term => {},
    }

    warn!("Shutdown signal received.");
}
