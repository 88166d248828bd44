// LSNP peer daemon: announce profile and presence, log everything received.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

use anyhow::Result;
use clap::Parser;
use lsnp_core::protocol::keys;
use lsnp_core::{Message, MessageType, TypedMessage};
use lsnp_node::{config, detect_local_ip, Engine};
use tracing::info;
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(name = "lsnp-node", version, about = "Local Social Networking Protocol peer")]
struct Cli {
    /// Identity as name@ip (default: $USER@<local ip>)
    #[arg(long)]
    user_id: Option<String>,

    /// Name shown in PROFILE broadcasts
    #[arg(long)]
    display_name: Option<String>,

    /// UDP port to listen on
    #[arg(short, long)]
    port: Option<u16>,

    /// Debug logging (RUST_LOG takes precedence when set)
    #[arg(short, long)]
    verbose: bool,

    /// Config file (default: ~/.config/lsnp/config.toml, then /etc/lsnp/config.toml)
    #[arg(short, long)]
    config: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let mut cfg = config::load(cli.config.as_deref())?;
    if let Some(p) = cli.port {
        cfg.port = p;
    }
    if cli.user_id.is_some() {
        cfg.user_id = cli.user_id;
    }
    if cli.display_name.is_some() {
        cfg.display_name = cli.display_name;
    }
    cfg.verbose |= cli.verbose;

    let default_level = if cfg.verbose { "debug" } else { "info" };
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level)),
        )
        .with_target(false)
        .init();

    let local_ip = detect_local_ip();
    let engine = Engine::start(cfg.engine_config(local_ip)).await?;
    for kind in MessageType::ALL {
        engine.register_handler(kind.as_str(), log_message).await;
    }

    let display_name = cfg
        .display_name
        .clone()
        .unwrap_or_else(|| engine.user_id().split('@').next().unwrap_or_default().to_string());
    let profile = Message::new(MessageType::Profile.as_str())
        .with(keys::USER_ID, engine.user_id())
        .with(keys::DISPLAY_NAME, display_name)
        .with(keys::STATUS, cfg.status.clone());
    if let Err(e) = engine.broadcast(profile).await {
        tracing::warn!(error = %e, "profile broadcast failed");
    }
    engine
        .spawn_presence(Duration::from_secs(cfg.presence_interval_secs.max(1)))
        .await;

    let mut failures = engine.subscribe_failures();
    tokio::spawn(async move {
        while let Ok(f) = failures.recv().await {
            info!(message_id = %f.message_id, target = %f.target, "message not delivered");
        }
    });

    shutdown_signal().await?;
    engine.shutdown().await;
    println!("{}", serde_json::to_string_pretty(&engine.stats().await)?);
    Ok(())
}

fn log_message(message: &Message, from: SocketAddr) -> Result<()> {
    match TypedMessage::parse(message)? {
        TypedMessage::Profile(p) => {
            info!(%from, user_id = %p.user_id, name = %p.display_name, status = %p.status, "profile")
        }
        TypedMessage::Post(p) => info!(%from, user_id = %p.user_id, content = %p.content, "post"),
        TypedMessage::Dm(dm) => info!(%from, sender = %dm.from, content = %dm.content, "direct message"),
        TypedMessage::Ping { user_id } => info!(%from, %user_id, "ping"),
        TypedMessage::Hello { user_id, .. } => info!(%from, user_id = ?user_id, "hello"),
        TypedMessage::Ack(ack) => info!(%from, message_id = %ack.message_id, "ack"),
        TypedMessage::Follow(f) => info!(%from, follower = %f.from, "new follower"),
        TypedMessage::Unfollow(f) => info!(%from, follower = %f.from, "unfollowed"),
        TypedMessage::Like(l) => info!(%from, sender = %l.from, action = %l.action, "like"),
        TypedMessage::Revoke { .. } => info!(%from, "token revoked"),
        TypedMessage::Other { message, .. } => {
            info!(%from, msg_type = message.type_name().unwrap_or_default(), fields = message.len(), "message")
        }
    }
    Ok(())
}

/// Wait for Ctrl+C or SIGTERM (Unix).
async fn shutdown_signal() -> Result<()> {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        let mut sigterm = signal(SignalKind::terminate())?;
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {}
            _ = sigterm.recv() => {}
        }
    }
    #[cfg(not(unix))]
    {
        tokio::signal::ctrl_c().await?;
    }
    Ok(())
}
