use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use tracing::{info, warn};

use synapse_auth::TokenStore;
use synapse_conversations::{Conversation, ConversationRegistry, ConversationStore};
use synapse_core::config::SynapseConfig;
use synapse_engine::mock::MockEngineFactory;
use synapse_engine::EngineGateway;
use synapse_gateway::{http, Dispatcher};

#[derive(Parser)]
#[command(name = "synapse-gateway", about = "On-device inference gateway")]
struct Args {
    /// Path to synapse.toml. Defaults to ~/.synapse/synapse.toml.
    #[arg(long)]
    config: Option<String>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "synapse=info,synapse_gateway=info,tower_http=debug".into()),
        )
        .init();

    let args = Args::parse();
    let config = SynapseConfig::load(args.config.as_deref()).unwrap_or_else(|e| {
        warn!("config load failed ({}), using defaults", e);
        SynapseConfig::default()
    });

    let data_dir = PathBuf::from(&config.storage.data_dir);
    std::fs::create_dir_all(&data_dir)?;

    let conn = rusqlite::Connection::open(data_dir.join("synapse.db"))?;
    let tokens = Arc::new(TokenStore::new(
        conn,
        data_dir.join("auth_tokens_backup.json"),
    )?);

    let store = ConversationStore::open(data_dir.join("conversations"))?;
    let records = store.load_all();
    let (registry, invalidations) =
        ConversationRegistry::new(store, config.conversations.default_ttl_ms);
    let registry = Arc::new(registry);
    for record in records {
        registry.insert_loaded(Conversation::from_record(record));
    }
    info!(conversations = registry.len(), "registry restored");

    // The native runtime binding plugs in through EngineFactory; until one
    // is linked the deterministic mock engine serves development setups.
    let engine = Arc::new(EngineGateway::new(Box::new(MockEngineFactory::default())));
    engine.spawn_invalidation_listener(invalidations);

    if config.model.path.is_empty() {
        warn!("no model path configured, generation will fail until a model is loaded");
    } else {
        engine
            .load(Path::new(&config.model.path), config.model.backend)
            .await?;
    }

    registry.spawn_sweeper(Duration::from_secs(config.conversations.cleanup_interval_secs));

    let dispatcher = Arc::new(Dispatcher::new(
        tokens,
        registry,
        engine,
        &config.host.caller_id,
    ));

    if config.http.enabled {
        let addr: SocketAddr = format!("{}:{}", config.http.bind, config.http.port).parse()?;
        let router = http::build_router(dispatcher);
        info!("synapse gateway listening on {}", addr);
        let listener = tokio::net::TcpListener::bind(addr).await?;
        axum::serve(listener, router).await?;
    } else {
        info!("synapse gateway ready (HTTP surface disabled)");
        tokio::signal::ctrl_c().await?;
    }

    Ok(())
}
