//! Engine: the surface collaborators use. Owns the socket, the core and the background tasks.
//!
//! Tasks: the listener (socket -> channel), ingest (channel -> core -> handlers), the retry
//! sweep, and optionally the presence broadcast. The core lock is never held across socket
//! I/O or handler execution.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use lsnp_core::protocol::keys;
use lsnp_core::{
    CoreConfig, CoreStats, DeliveryFailure, LsnpCore, Message, OutboundAction, PeerRecord, Scope,
    SendError, Target, Token, TokenError,
};
use tokio::sync::{broadcast, mpsc, watch, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::discovery;
use crate::transport::{EngineError, Inbound, Transport};

/// Host-side settings around the core.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    pub core: CoreConfig,
    pub sweep_interval: Duration,
    /// Datagrams buffered between listener and ingest.
    pub inbound_queue: usize,
    /// Delivery failures buffered per subscriber.
    pub failure_queue: usize,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            core: CoreConfig::default(),
            sweep_interval: Duration::from_secs(1),
            inbound_queue: 1024,
            failure_queue: 64,
        }
    }
}

struct Inner {
    core: Mutex<LsnpCore>,
    transport: Transport,
    user_id: String,
    failures: broadcast::Sender<DeliveryFailure>,
    shutdown: watch::Sender<bool>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

/// Cheap to clone; every clone drives the same engine.
#[derive(Clone)]
pub struct Engine {
    inner: Arc<Inner>,
}

impl Engine {
    /// Bind the listening socket and start the listener, ingest and sweep tasks.
    /// A bind failure is fatal and returned as [`EngineError::SocketBindFailure`].
    pub async fn start(config: EngineConfig) -> Result<Self, EngineError> {
        Self::start_with(config, LsnpCore::with_system_clock).await
    }

    /// Like [`Engine::start`] with a caller-built core (custom clock or random source).
    /// `build` receives the core config with the actually bound port filled in.
    pub async fn start_with<F>(config: EngineConfig, build: F) -> Result<Self, EngineError>
    where
        F: FnOnce(CoreConfig) -> LsnpCore,
    {
        let transport = Transport::bind(config.core.listen_port)?;
        let mut core_config = config.core;
        core_config.listen_port = transport.local_port();
        let user_id = core_config.user_id.clone();
        let core = build(core_config);

        let (failures, _) = broadcast::channel(config.failure_queue.max(1));
        let (shutdown, shutdown_rx) = watch::channel(false);
        let inner = Arc::new(Inner {
            core: Mutex::new(core),
            transport: transport.clone(),
            user_id,
            failures,
            shutdown,
            tasks: Mutex::new(Vec::new()),
        });
        let engine = Engine { inner };

        let (inbound_tx, inbound_rx) = mpsc::channel(config.inbound_queue.max(1));
        let listener = tokio::spawn(transport.listen(inbound_tx, shutdown_rx.clone()));
        let ingest = tokio::spawn(engine.clone().ingest_loop(inbound_rx));
        let sweep = tokio::spawn(
            engine
                .clone()
                .sweep_loop(config.sweep_interval, shutdown_rx),
        );
        engine
            .inner
            .tasks
            .lock()
            .await
            .extend([listener, ingest, sweep]);

        info!(
            user_id = %engine.inner.user_id,
            port = engine.local_port(),
            "engine listening"
        );
        Ok(engine)
    }

    pub fn user_id(&self) -> &str {
        &self.inner.user_id
    }

    pub fn local_port(&self) -> u16 {
        self.inner.transport.local_port()
    }

    /// Send to one peer. With `requires_ack` the message is retried until acknowledged.
    /// A failed first send is reported here and not retried.
    pub async fn send(
        &self,
        mut message: Message,
        target: impl Into<Target>,
        requires_ack: bool,
    ) -> Result<(), SendError> {
        let (actions, tracked) = {
            let mut core = self.inner.core.lock().await;
            if requires_ack && message.message_id().is_none() {
                let id = core.new_message_id();
                message.insert(keys::MESSAGE_ID, id);
            }
            let tracked = message.message_id().filter(|_| requires_ack);
            (core.prepare_send(message, target.into(), requires_ack)?, tracked)
        };
        for action in actions {
            if let OutboundAction::SendDatagram(addr, bytes) = action {
                if let Err(e) = self.inner.transport.send_to(&bytes, addr).await {
                    if let Some(id) = &tracked {
                        self.inner.core.lock().await.cancel_ack(id);
                    }
                    return Err(e);
                }
            }
        }
        Ok(())
    }

    /// Send to every known peer and the broadcast address. Returns how many datagrams left;
    /// fails only when none did.
    pub async fn broadcast(&self, message: Message) -> Result<usize, SendError> {
        let actions = self.inner.core.lock().await.prepare_broadcast(message)?;
        let mut sent = 0;
        let mut last_err = None;
        for action in actions {
            if let OutboundAction::SendDatagram(addr, bytes) = action {
                match self.inner.transport.send_to(&bytes, addr).await {
                    Ok(()) => sent += 1,
                    Err(e) => {
                        debug!(error = %e, "broadcast leg failed");
                        last_err = Some(e);
                    }
                }
            }
        }
        match last_err {
            Some(e) if sent == 0 => Err(e),
            _ => Ok(sent),
        }
    }

    /// Acknowledge `original` to the sender's listener.
    pub async fn send_ack(&self, original: &Message, reply_to: SocketAddr) -> Result<(), SendError> {
        let actions = self.inner.core.lock().await.prepare_ack(original, reply_to)?;
        self.send_datagrams(actions).await;
        Ok(())
    }

    pub async fn register_handler<F>(&self, msg_type: impl Into<String>, handler: F)
    where
        F: Fn(&Message, SocketAddr) -> anyhow::Result<()> + Send + Sync + 'static,
    {
        self.inner
            .core
            .lock()
            .await
            .register_handler(msg_type, handler);
    }

    pub async fn mint_token(&self, subject: &str, ttl_secs: u64, scope: Scope) -> String {
        self.inner.core.lock().await.mint_token(subject, ttl_secs, scope)
    }

    pub async fn validate_token(&self, token: &str, scope: Scope) -> Result<Token, TokenError> {
        self.inner.core.lock().await.validate_token(token, scope)
    }

    pub async fn revoke_token(&self, token: &str) -> bool {
        self.inner.core.lock().await.revoke_token(token)
    }

    pub async fn known_peers(&self) -> Vec<PeerRecord> {
        self.inner.core.lock().await.known_peers()
    }

    pub async fn is_pending(&self, message_id: &str) -> bool {
        self.inner.core.lock().await.is_pending(message_id)
    }

    pub async fn stats(&self) -> CoreStats {
        self.inner.core.lock().await.stats()
    }

    /// Messages that ran out of retries, from now on.
    pub fn subscribe_failures(&self) -> broadcast::Receiver<DeliveryFailure> {
        self.inner.failures.subscribe()
    }

    /// Broadcast HELLO now and PING every `interval` until shutdown.
    pub async fn spawn_presence(&self, interval: Duration) {
        let task = tokio::spawn(discovery::run_presence(
            self.clone(),
            interval,
            self.inner.shutdown.subscribe(),
        ));
        self.inner.tasks.lock().await.push(task);
    }

    pub fn is_shut_down(&self) -> bool {
        *self.inner.shutdown.borrow()
    }

    /// Stop every background task and wait for them to finish. Idempotent.
    pub async fn shutdown(&self) {
        self.inner.shutdown.send_replace(true);
        let tasks: Vec<JoinHandle<()>> = self.inner.tasks.lock().await.drain(..).collect();
        for task in tasks {
            if let Err(e) = task.await {
                warn!(error = %e, "engine task ended abnormally");
            }
        }
        info!(user_id = %self.inner.user_id, "engine stopped");
    }

    async fn ingest_loop(self, mut inbound: mpsc::Receiver<Inbound>) {
        while let Some((bytes, from)) = inbound.recv().await {
            let result = self
                .inner
                .core
                .lock()
                .await
                .on_datagram_received(&bytes, from);
            match result {
                Ok(actions) => self.execute(actions).await,
                Err(e) => debug!(%from, error = %e, "inbound datagram dropped"),
            }
        }
    }

    async fn sweep_loop(self, period: Duration, mut shutdown: watch::Receiver<bool>) {
        let mut ticker = tokio::time::interval(period);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    let actions = self.inner.core.lock().await.tick();
                    self.execute(actions).await;
                }
                _ = shutdown.changed() => break,
            }
        }
    }

    /// Carry out core actions. Runs with the core unlocked.
    async fn execute(&self, actions: Vec<OutboundAction>) {
        for action in actions {
            match action {
                OutboundAction::SendDatagram(addr, bytes) => self.send_logged(&bytes, addr).await,
                OutboundAction::Dispatch(delivery) => {
                    if let Err(e) = delivery.run() {
                        // Not marked handled: a retry from the sender runs the handler again.
                        warn!(from = %delivery.from, error = %e, "handler failed");
                        continue;
                    }
                    let acks = self.inner.core.lock().await.mark_handled(&delivery);
                    match acks {
                        Ok(acks) => self.send_datagrams(acks).await,
                        Err(e) => warn!(error = %e, "ack not sent"),
                    }
                }
                OutboundAction::DeliveryExhausted(failure) => {
                    warn!(
                        message_id = %failure.message_id,
                        target = %failure.target,
                        retries = failure.retries,
                        "giving up on unacknowledged message"
                    );
                    // No subscribers is fine.
                    let _ = self.inner.failures.send(failure);
                }
            }
        }
    }

    async fn send_datagrams(&self, actions: Vec<OutboundAction>) {
        for action in actions {
            if let OutboundAction::SendDatagram(addr, bytes) = action {
                self.send_logged(&bytes, addr).await;
            }
        }
    }

    async fn send_logged(&self, bytes: &[u8], addr: SocketAddr) {
        if let Err(e) = self.inner.transport.send_to(bytes, addr).await {
            warn!(error = %e, "send failed");
        }
    }
}
