//! `potlined` — the Potline server binary.
//!
//! Usage:
//!   potlined -c <context-name-or-path> [--listen <addr>]
//!
//! The context name resolves to `/etc/potline/<name>.toml`.
//! If a path with `/` or `.` is given, it's used directly.

mod config;
mod routes;

use std::sync::Arc;

use clap::Parser;
use potline_core::Module;
use tracing::info;

use config::ServerConfig;

/// How often expired idempotency records are garbage-collected.
const IDEMPOTENCY_SWEEP_SECS: u64 = 300;

/// Potline server.
#[derive(Parser, Debug)]
#[command(name = "potlined", about = "Potline nursery operations server")]
struct Cli {
    /// Context name or path to config file.
    #[arg(short = 'c', long = "config", required = true)]
    config: String,

    /// Listen address (overrides the config file).
    #[arg(long = "listen")]
    listen: Option<String>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize logging.
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .init();

    let cli = Cli::parse();

    // Load server configuration.
    let config_path = ServerConfig::resolve_path(&cli.config);
    info!("Loading configuration from {}", config_path.display());
    let server_config = ServerConfig::load(&config_path)?;
    let listen = cli.listen.unwrap_or_else(|| server_config.listen.clone());

    // Initialize storage.
    let data_dir = std::path::PathBuf::from(&server_config.storage.data_dir);
    std::fs::create_dir_all(&data_dir)?;

    let core_config = potline_core::ServiceConfig {
        data_dir: Some(data_dir.clone()),
        listen: listen.clone(),
        ..Default::default()
    };

    let kv: Arc<dyn potline_kv::KVStore> = Arc::new(
        potline_kv::RedbStore::open(&core_config.resolve_db_path())
            .map_err(|e| anyhow::anyhow!("failed to open KV store: {}", e))?,
    );

    let batch_service = Arc::new(batch::service::BatchService::new(Arc::clone(&kv)));
    let batch_module = batch::BatchModule::new(Arc::clone(&batch_service));
    info!("Batch module initialized");

    // Expired idempotency records are reclaimed lazily on replay;
    // sweep the rest so unique tokens do not pile up.
    tokio::spawn({
        let service = Arc::clone(&batch_service);
        async move {
            let mut tick =
                tokio::time::interval(std::time::Duration::from_secs(IDEMPOTENCY_SWEEP_SECS));
            loop {
                tick.tick().await;
                if let Err(e) = service.sweep_expired_idempotency() {
                    tracing::warn!("idempotency sweep failed: {}", e);
                }
            }
        }
    });

    let module_routes = vec![(batch_module.name(), batch_module.routes())];

    // Build router.
    let app = routes::build_router(module_routes);

    // Start server.
    let listener = tokio::net::TcpListener::bind(&listen).await?;
    info!("Potline server listening on {}", listen);
    axum::serve(listener, app).await?;

    Ok(())
}
