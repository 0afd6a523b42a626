use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use clap::Parser;

use kai_agent::AgentSettings;
use kai_core::ids::SessionId;
use kai_core::query::{AgentQuery, QueryOptions, QueryTransport, TransportError};
use kai_hub::MessageHub;
use kai_providers::{global_registry, AnthropicProvider};
use kai_server::{
    register_handlers, BridgeManager, HandlerDeps, NullWorktreeGateway, RoomAgent,
    RoomAgentConfig, ServerConfig, SessionManager, StateBroadcaster,
};
use kai_store::rooms::RoomRepo;
use kai_store::Database;
use kai_telemetry::{init_logging, DaemonMetrics, LoggingConfig};

#[derive(Parser, Debug)]
#[command(name = "kaid", about = "kai agent session daemon")]
struct Args {
    /// Port for the WebSocket/HTTP server.
    #[arg(long, default_value_t = 9420)]
    port: u16,

    /// Database path. Defaults to ~/.kai/kai.db.
    #[arg(long)]
    db_path: Option<PathBuf>,

    /// Maximum live agent sessions kept in memory.
    #[arg(long, default_value_t = 64)]
    cache_capacity: usize,

    /// Emit JSON log lines.
    #[arg(long)]
    log_json: bool,
}

/// Placeholder transport for deployments where no agent backend is wired
/// in yet. Every start attempt reports the SDK as not ready; sent messages
/// stay queued until a real transport is plugged into this seam.
struct DetachedTransport;

#[async_trait::async_trait]
impl QueryTransport for DetachedTransport {
    async fn start_query(
        &self,
        _session_id: &SessionId,
        _options: QueryOptions,
    ) -> Result<Arc<dyn AgentQuery>, TransportError> {
        Err(TransportError::NotReady)
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    init_logging(&LoggingConfig {
        json: args.log_json,
        ..Default::default()
    });
    tracing::info!("starting kai daemon");

    let db_path = match args.db_path {
        Some(path) => path,
        None => home_dir().join(".kai").join("kai.db"),
    };
    let db = Database::open(&db_path).context("failed to open database")?;

    let registry = global_registry();
    registry.register(Arc::new(AnthropicProvider::from_env()));

    let hub = Arc::new(MessageHub::new());
    let metrics = Arc::new(DaemonMetrics::new());
    let transport = Arc::new(DetachedTransport);

    let manager = SessionManager::new(
        db.clone(),
        hub.clone(),
        transport,
        registry.clone(),
        AgentSettings::default(),
        args.cache_capacity,
        Arc::new(NullWorktreeGateway),
        metrics.clone(),
    );
    let manager_loop = manager.clone().spawn_event_loop();

    let broadcaster = StateBroadcaster::new(db.clone(), hub.clone(), manager.clone(), "default");
    broadcaster.clone().register();
    let broadcaster_loop = broadcaster.clone().spawn_event_loop();

    register_handlers(Arc::new(HandlerDeps {
        db: db.clone(),
        hub: hub.clone(),
        manager: manager.clone(),
        broadcaster,
        registry,
        metrics: metrics.clone(),
        sdk_dir: home_dir().join(".kai").join("sdk-sessions"),
    }));

    // Resume the agent for every persisted room; each restores its exact
    // lifecycle state from the store.
    let bridges = BridgeManager::new(db.clone(), hub.clone());
    let mut room_agents = Vec::new();
    for room in RoomRepo::new(db.clone()).list().context("failed to list rooms")? {
        let agent = RoomAgent::new(
            room.id.clone(),
            db.clone(),
            hub.clone(),
            manager.clone(),
            bridges.clone(),
            RoomAgentConfig::default(),
        );
        if let Err(e) = agent.start() {
            tracing::error!(room_id = %room.id, error = %e, "room agent failed to start");
            continue;
        }
        room_agents.push(agent);
    }

    let config = ServerConfig {
        port: args.port,
        ..Default::default()
    };
    let handle = kai_server::start(config, hub, metrics)
        .await
        .context("failed to start server")?;
    tracing::info!(port = handle.port, "kai daemon ready");

    tokio::signal::ctrl_c()
        .await
        .context("failed to listen for ctrl+c")?;

    tracing::info!("shutting down");
    manager.cleanup();
    for agent in &room_agents {
        agent.stop();
    }
    bridges.stop_all_bridges();
    handle.shutdown();
    handle.drain().await;
    manager_loop.abort();
    broadcaster_loop.abort();
    Ok(())
}

fn home_dir() -> PathBuf {
    std::env::var("HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|_| PathBuf::from("/tmp"))
}
