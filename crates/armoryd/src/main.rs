use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use armory_core::{TransactionMachine, VerificationEngine};
use armory_store::{SqliteStore, TemplateCipher};
use clap::Parser;
use tracing_subscriber::EnvFilter;

mod api;
mod config;
mod engine;
mod remote;

use api::{api_router, AppState, DaemonInfo};
use config::Config;
use engine::{spawn_engine, Engine};
use remote::{HttpTemplateSource, InsightFaceProvider};

#[derive(Parser)]
#[command(name = "armoryd", about = "Armory custody daemon", version)]
struct Args {
    /// Config file (TOML). Defaults to /etc/armory/armoryd.toml when present.
    #[arg(short, long)]
    config: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let args = Args::parse();
    let config = Config::load(args.config.as_deref())?;
    tracing::info!(db = %config.db_path.display(), listen = %config.listen_addr, "armoryd starting");

    if let Some(dir) = config.db_path.parent() {
        std::fs::create_dir_all(dir)
            .with_context(|| format!("creating data directory {}", dir.display()))?;
    }
    let mut store = SqliteStore::open(&config.db_path)
        .await
        .with_context(|| format!("opening store {}", config.db_path.display()))?;
    if let Some(key) = &config.template_key {
        store = store.with_cipher(TemplateCipher::from_passphrase(key));
        tracing::info!("template encryption enabled");
    }

    let provider = InsightFaceProvider::new(
        config.provider.url.clone(),
        config.provider.api_key.clone(),
        config.provider.metric,
        Duration::from_secs(config.provider.timeout_secs),
    )
    .context("building provider client")?;
    let verifier = VerificationEngine::new(provider, config.strategy(), config.similarity.threshold)
        .context("configuring verification engine")?;
    tracing::info!(
        provider = %config.provider.url,
        strategy = ?config.similarity.strategy,
        threshold = verifier.threshold().value(),
        "verification engine ready"
    );

    let source = match config.remote_url() {
        Some(url) => {
            tracing::info!(remote = url, "template sync enabled");
            Some(
                HttpTemplateSource::new(
                    url,
                    config.remote.token.clone(),
                    Duration::from_secs(config.remote.timeout_secs),
                )
                .context("building remote client")?,
            )
        }
        None => {
            tracing::info!(offline = config.offline, "template sync disabled");
            None
        }
    };

    let info = DaemonInfo {
        version: env!("CARGO_PKG_VERSION"),
        strategy: config.similarity.strategy,
        threshold: verifier.threshold().value(),
        reassign_policy: config.reassign_policy,
        verifier_identity: config.verifier_identity.clone(),
        camera_device: config.camera_device.clone(),
        offline: config.offline,
        remote_configured: source.is_some(),
        encrypted_templates: store.is_encrypted(),
        reset_delay_ms: config.reset_delay_ms,
        debounce_frames: config.debounce_frames,
        min_face_px: config.min_face_px,
    };

    let machine = TransactionMachine::new(
        verifier,
        config.reassign_policy,
        config.verifier_identity.clone(),
    );
    let engine = spawn_engine(Engine::new(store.clone(), machine, source));

    let app = api_router(AppState {
        store,
        engine,
        info: Arc::new(info),
    });

    let listener = tokio::net::TcpListener::bind(config.listen_addr)
        .await
        .with_context(|| format!("binding {}", config.listen_addr))?;
    tracing::info!(addr = %config.listen_addr, "armoryd ready");

    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(shutdown_signal())
    .await
    .context("serving HTTP")?;

    tracing::info!("armoryd shutting down");
    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!(error = %e, "failed to listen for ctrl-c");
    }
}
