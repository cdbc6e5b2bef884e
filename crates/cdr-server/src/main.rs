//! Process entry point: wires the job store, VM pool, coordinator, and
//! REST server, then serves until an interrupt signal triggers graceful
//! shutdown (§10).

mod error;
mod routes;
mod state;

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration as StdDuration;

use axum::extract::DefaultBodyLimit;
use cdr_adapters::mock::{MockAvEngine, MockBlobStore, MockCdrEngine, MockEdrConsole, MockVmBackend};
use cdr_adapters::{AvEngine, BlobStore, CdrEngine, EdrConsole};
use cdr_engine::{Coordinator, CoordinatorDeps};
use cdr_store::InMemoryJobStore;
use cdr_types::Config;
use cdr_vmpool::VmPool;
use clap::Parser;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

use crate::state::AppState;

#[derive(Debug, Parser)]
#[command(name = "cdr-validate-server", about = "CDR/AV/EDR validation pipeline server")]
struct Cli {
    /// Path to a TOML configuration file. Falls back to `CDR_VALIDATE_CONFIG`
    /// or `./config.toml` when absent.
    #[arg(long, env = "CDR_VALIDATE_CONFIG")]
    config: Option<std::path::PathBuf>,
}

/// EDR labels this demo deployment knows about. A production deployment
/// reads these from `pool.base_image`'s keys instead of hardcoding them.
const EDR_LABELS: &[&str] = &["crowdstrike", "sentinelone"];

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let config_path = cli.config.unwrap_or_else(Config::default_path);
    let config = Config::load(&config_path)?;

    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::try_new(&config.server.log_filter).unwrap_or_else(|_| "info".into()))
        .with(tracing_subscriber::fmt::layer())
        .init();

    tracing::info!(path = %config_path.display(), "loaded configuration");

    // Real CDR/AV/EDR/VM integrations are out of scope; these in-memory
    // fakes let the pipeline run end to end for local and demo use (§10).
    let store_concrete = Arc::new(InMemoryJobStore::new(chrono::Duration::seconds(config.store.ttl_sec)));
    store_concrete.spawn_reaper(StdDuration::from_secs(300));
    let store: Arc<dyn cdr_store::JobStore> = store_concrete;
    let blob_store: Arc<dyn BlobStore> = Arc::new(MockBlobStore::new());
    let cdr_engines: Vec<Arc<dyn CdrEngine>> = vec![Arc::new(MockCdrEngine::new("cdr-sanitizer"))];
    let av_engines: Vec<Arc<dyn AvEngine>> = vec![Arc::new(MockAvEngine::new("defender")), Arc::new(MockAvEngine::new("sentinel"))];
    let edr_consoles: Vec<Arc<dyn EdrConsole>> =
        EDR_LABELS.iter().map(|label| Arc::new(MockEdrConsole::new(*label)) as Arc<dyn EdrConsole>).collect();

    let labels: Vec<String> = EDR_LABELS.iter().map(|s| s.to_string()).collect();
    let vm_pool = Arc::new(VmPool::new(&labels, config.pool.clone(), Arc::new(MockVmBackend::new())));
    vm_pool.initialize().await;

    let coordinator = Arc::new(Coordinator::new(CoordinatorDeps {
        store: Arc::clone(&store),
        blob_store,
        cdr_engines,
        av_engines,
        edr_consoles,
        vm_pool: Arc::clone(&vm_pool),
        phase1_config: config.phase1.clone(),
        phase2_config: config.phase2.clone(),
        phase3_config: config.phase3.clone(),
    }));

    let app_state = AppState::new(coordinator, Arc::clone(&store), Arc::clone(&vm_pool));

    let cors = CorsLayer::new().allow_origin(Any).allow_methods(Any).allow_headers(Any);
    let app = routes::router(app_state)
        .layer(TraceLayer::new_for_http())
        .layer(cors)
        .layer(DefaultBodyLimit::max(config.server.max_body_bytes as usize));

    let addr: SocketAddr = config
        .server
        .bind_addr
        .parse()
        .unwrap_or_else(|_| SocketAddr::from(([0, 0, 0, 0], 8080)));

    tracing::info!(%addr, "cdr-validate-server listening");
    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app).with_graceful_shutdown(shutdown_signal()).await?;

    vm_pool.shutdown().await;
    tracing::info!("shutdown complete");
    Ok(())
}

/// Waits for SIGINT (or, on unix, SIGTERM) and lets in-flight requests
/// drain before `axum::serve` returns (§10 "Graceful shutdown").
async fn shutdown_signal() {
    let ctrl_c = async {
        let _ = tokio::signal::ctrl_c().await;
    };

    #[cfg(unix)]
    let terminate = async {
        let mut signal = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("failed to install SIGTERM handler");
        signal.recv().await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }
    tracing::info!("interrupt received, draining in-flight requests");
    tokio::time::sleep(StdDuration::from_millis(50)).await;
}
