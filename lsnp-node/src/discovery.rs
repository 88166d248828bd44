//! Presence: HELLO once on start, then PING every interval. Peers learn us from either.

use std::time::Duration;

use lsnp_core::protocol::keys;
use lsnp_core::{Message, MessageType};
use tokio::sync::watch;
use tracing::{debug, warn};

use crate::engine::Engine;

pub fn hello_message(user_id: &str, listen_port: u16) -> Message {
    Message::new(MessageType::Hello.as_str())
        .with(keys::USER_ID, user_id)
        .with(keys::LISTEN_PORT, listen_port)
}

pub fn ping_message(user_id: &str) -> Message {
    Message::new(MessageType::Ping.as_str()).with(keys::USER_ID, user_id)
}

/// Runs until `shutdown` flips. Send failures are logged and retried next period.
pub async fn run_presence(engine: Engine, interval: Duration, mut shutdown: watch::Receiver<bool>) {
    let hello = hello_message(engine.user_id(), engine.local_port());
    match engine.broadcast(hello).await {
        Ok(n) => debug!(datagrams = n, "hello sent"),
        Err(e) => warn!(error = %e, "hello broadcast failed"),
    }

    let mut ticker = tokio::time::interval(interval);
    // First tick completes immediately; HELLO already covered it.
    ticker.tick().await;
    loop {
        tokio::select! {
            _ = ticker.tick() => {
                if let Err(e) = engine.broadcast(ping_message(engine.user_id())).await {
                    warn!(error = %e, "ping broadcast failed");
                }
            }
            _ = shutdown.changed() => break,
        }
    }
    debug!("presence stopped");
}
