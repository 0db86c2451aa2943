//! Terminal client for a collab wiki chat room.
//!
//! ```bash
//! COLLAB_CHAT_PASSWORD=secret collab-chat --room lobby
//! ```
//!
//! Lines typed on stdin are sent to the room, `/quit` or end of input leaves.
//! Chat output goes to stdout, logs to stderr.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use tracing::{info, warn};
use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

use collab_core::config::Config;
use collab_core::event::{BroadcastEventBus, EventBus};
use collab_core::scheduler::TokioScheduler;
use collab_core::session_store::{FileSessionStore, MemorySessionStore, SessionStore};
use collab_xmpp::{ChatConnection, ChatSession, ConnectionConfig, WebSocketTransport};

mod input;
mod render;

/// How long the renderer gets to print the last events after the session ends.
const RENDER_GRACE: Duration = Duration::from_secs(1);

/// Collab wiki room chat
#[derive(Parser, Debug)]
#[command(name = "collab-chat")]
#[command(about = "Join a collab wiki chat room from the terminal")]
#[command(version)]
struct Args {
    /// Config file (defaults to the platform config dir)
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Room address or bare room name
    #[arg(short, long)]
    room: Option<String>,

    /// XMPP-over-WebSocket endpoint
    #[arg(short, long)]
    endpoint: Option<String>,

    /// Account JID
    #[arg(short, long)]
    jid: Option<String>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    let config = load_config(&args)?;
    init_tracing(&config.log_level);

    let event_bus: Arc<dyn EventBus> = Arc::new(BroadcastEventBus::default());
    let (transport, transport_events) =
        WebSocketTransport::with_timeout(Duration::from_secs(config.chat.timeout_seconds));
    let (scheduler, ticks) = TokioScheduler::new();
    let connection = ChatConnection::new(
        ConnectionConfig::from(&config.chat),
        transport,
        scheduler,
        open_store(&config),
        event_bus.clone(),
    );
    let session = ChatSession::new(connection, transport_events, ticks, event_bus.clone())?;

    let renderer = tokio::spawn(render::run(event_bus.subscribe("chat.**")?));
    let input = tokio::spawn(input::forward(
        input::spawn_stdin_reader(),
        event_bus.clone(),
    ));

    info!(room = %config.chat.room, jid = %config.chat.jid, "starting chat session");
    let result = session.run(shutdown_signal()).await;
    input.abort();

    if tokio::time::timeout(RENDER_GRACE, renderer).await.is_err() {
        warn!("renderer did not finish");
    }
    result.context("chat session failed")?;
    Ok(())
}

fn load_config(args: &Args) -> Result<Config> {
    let path = match &args.config {
        Some(path) => path.clone(),
        None => Config::default_path()?,
    };
    let mut config =
        Config::load(&path).with_context(|| format!("loading config from {}", path.display()))?;

    if let Some(room) = &args.room {
        config.chat.room = room.clone();
    }
    if let Some(endpoint) = &args.endpoint {
        config.chat.endpoint = endpoint.clone();
    }
    if let Some(jid) = &args.jid {
        config.chat.jid = jid.clone();
    }
    config.apply_env();
    config.validate()?;
    Ok(config)
}

fn init_tracing(log_level: &str) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(log_level));
    tracing_subscriber::registry()
        .with(fmt::layer().with_writer(std::io::stderr))
        .with(filter)
        .init();
}

/// The file-backed store keeps the room nick across restarts; without it the
/// nick is only stable for this process.
fn open_store(config: &Config) -> Box<dyn SessionStore + Send> {
    let opened = config
        .store_path()
        .map_err(anyhow::Error::from)
        .and_then(|path| FileSessionStore::open(path).map_err(anyhow::Error::from));
    match opened {
        Ok(store) => Box::new(store),
        Err(error) => {
            warn!(error = %error, "session store unavailable, keeping session state in memory");
            Box::new(MemorySessionStore::new())
        }
    }
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(error) = tokio::signal::ctrl_c().await {
            warn!(error = %error, "failed to listen for ctrl-c");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(error) => {
                warn!(error = %error, "failed to listen for SIGTERM");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => info!("received ctrl-c"),
        _ = terminate => info!("received SIGTERM"),
    }
}
