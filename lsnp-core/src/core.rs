//! Host-driven API: LsnpCore receives events from host, returns actions.
//!
//! The host owns the socket and timers. It feeds received datagrams to
//! [`LsnpCore::on_datagram_received`], send requests to [`LsnpCore::prepare_send`] and
//! [`LsnpCore::prepare_broadcast`], and calls [`LsnpCore::tick`] about once a second. Every call
//! returns [`OutboundAction`]s the host executes after releasing whatever lock guards the core.

use std::fmt;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::Arc;

use rand::rngs::StdRng;
use rand::{Rng as _, SeedableRng};
use serde::Serialize;
use tracing::{debug, info};

use crate::clock::{self, Clock, Rng, SystemClock};
use crate::dedup::{DedupCache, DEFAULT_DEDUP_CAPACITY};
use crate::dispatch::{self, DispatchError, Dispatcher, Handler};
use crate::peers::{PeerRecord, PeerTable};
use crate::protocol::{
    keys, Message, MessageType, Scope, TypedMessage, TypedParseError, ACK_TIMEOUT_SECS,
    BROADCAST_ADDR, DEFAULT_PORT, DEFAULT_TOKEN_TTL_SECS, MAX_RETRIES,
};
use crate::reliability::{AckStats, ReliabilityManager, SweepAction};
use crate::token::{Token, TokenAuthority, TokenError, TokenStats};
use crate::wire::{self, FrameDecodeError, FrameEncodeError};

/// Status carried by every ACK this engine sends.
pub const ACK_STATUS_RECEIVED: &str = "RECEIVED";

/// Engine parameters. `user_id` is this peer's `name@host` identity.
#[derive(Debug, Clone)]
pub struct CoreConfig {
    pub user_id: String,
    /// Port this peer's socket is bound to; stamped as LISTEN_PORT.
    pub listen_port: u16,
    /// Addresses that count as "this machine" for IP-based self detection.
    pub local_ips: Vec<IpAddr>,
    pub broadcast_addr: Ipv4Addr,
    pub token_ttl_secs: u64,
    pub ack_timeout_millis: u64,
    pub max_retries: u32,
    pub dedup_capacity: usize,
    /// Evict peers silent for this long. `None` keeps them for the process lifetime.
    pub peer_ttl_millis: Option<u64>,
    /// Fraction of inbound datagrams dropped on purpose (0.0 disables).
    pub simulated_loss: f64,
}

impl CoreConfig {
    pub fn new(user_id: impl Into<String>, listen_port: u16) -> Self {
        Self {
            user_id: user_id.into(),
            listen_port,
            local_ips: Vec::new(),
            broadcast_addr: BROADCAST_ADDR,
            token_ttl_secs: DEFAULT_TOKEN_TTL_SECS,
            ack_timeout_millis: ACK_TIMEOUT_SECS * 1000,
            max_retries: MAX_RETRIES,
            dedup_capacity: DEFAULT_DEDUP_CAPACITY,
            peer_ttl_millis: None,
            simulated_loss: 0.0,
        }
    }
}

impl Default for CoreConfig {
    fn default() -> Self {
        Self::new("anonymous@127.0.0.1", DEFAULT_PORT)
    }
}

/// Where a message goes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Target {
    /// A `name@host` identity; resolved through the peer table, then the host part.
    Identity(String),
    Addr(SocketAddr),
    /// Every known peer plus the broadcast address.
    Broadcast,
}

impl From<SocketAddr> for Target {
    fn from(addr: SocketAddr) -> Self {
        Target::Addr(addr)
    }
}

impl From<&str> for Target {
    fn from(identity: &str) -> Self {
        Target::Identity(identity.to_string())
    }
}

/// An accepted inbound message paired with its handler.
#[derive(Clone)]
pub struct Delivery {
    pub handler: Handler,
    pub message: Message,
    /// Datagram source.
    pub from: SocketAddr,
    /// Sender's listener (declared LISTEN_PORT), where replies go.
    pub reply_to: SocketAddr,
    /// Whether a successful handler run must be acknowledged.
    pub ack: bool,
}

impl Delivery {
    /// Run the handler. On success the host reports back through [`LsnpCore::mark_handled`].
    pub fn run(&self) -> Result<(), DispatchError> {
        dispatch::invoke(&self.handler, &self.message, self.from)
    }
}

impl fmt::Debug for Delivery {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Delivery")
            .field("message", &self.message)
            .field("from", &self.from)
            .field("reply_to", &self.reply_to)
            .field("ack", &self.ack)
            .finish_non_exhaustive()
    }
}

/// A message that was never acknowledged within the retry budget.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DeliveryFailure {
    pub message_id: String,
    pub target: SocketAddr,
    pub retries: u32,
}

/// Action for host to perform.
#[derive(Debug, Clone)]
pub enum OutboundAction {
    SendDatagram(SocketAddr, Vec<u8>),
    Dispatch(Delivery),
    DeliveryExhausted(DeliveryFailure),
}

#[derive(Debug, Clone, Copy, Serialize)]
pub struct CoreStats {
    pub tokens: TokenStats,
    pub acks: AckStats,
    pub peers: usize,
    pub dedup_entries: usize,
    pub revoked_tokens: usize,
}

/// Main coordinator. Host passes events; core returns actions.
pub struct LsnpCore {
    config: CoreConfig,
    clock: Arc<dyn Clock>,
    rng: Rng,
    peers: PeerTable,
    tokens: TokenAuthority,
    reliability: ReliabilityManager,
    dedup: DedupCache,
    dispatcher: Dispatcher,
}

impl LsnpCore {
    pub fn new(config: CoreConfig, clock: Arc<dyn Clock>, rng: Rng) -> Self {
        Self {
            peers: PeerTable::new(),
            tokens: TokenAuthority::new(clock.clone()),
            reliability: ReliabilityManager::new(config.ack_timeout_millis, config.max_retries),
            dedup: DedupCache::new(config.dedup_capacity),
            dispatcher: Dispatcher::new(),
            config,
            clock,
            rng,
        }
    }

    /// Wall clock and an entropy-seeded random source.
    pub fn with_system_clock(config: CoreConfig) -> Self {
        Self::new(
            config,
            Arc::new(SystemClock),
            Box::new(StdRng::from_entropy()),
        )
    }

    pub fn user_id(&self) -> &str {
        &self.config.user_id
    }

    pub fn listen_port(&self) -> u16 {
        self.config.listen_port
    }

    pub fn config(&self) -> &CoreConfig {
        &self.config
    }

    pub fn register_handler<F>(&mut self, msg_type: impl Into<String>, handler: F)
    where
        F: Fn(&Message, SocketAddr) -> anyhow::Result<()> + Send + Sync + 'static,
    {
        self.dispatcher.register(msg_type, handler);
    }

    pub fn mint_token(&self, subject: &str, ttl_secs: u64, scope: Scope) -> String {
        self.tokens.mint(subject, ttl_secs, scope)
    }

    pub fn validate_token(&mut self, token: &str, scope: Scope) -> Result<Token, TokenError> {
        self.tokens.validate(token, scope, None)
    }

    pub fn revoke_token(&mut self, token: &str) -> bool {
        self.tokens.revoke(token)
    }

    pub fn tokens(&self) -> &TokenAuthority {
        &self.tokens
    }

    pub fn known_peers(&self) -> Vec<PeerRecord> {
        self.peers.snapshot()
    }

    pub fn is_pending(&self, message_id: &str) -> bool {
        self.reliability.is_pending(message_id)
    }

    pub fn stats(&self) -> CoreStats {
        CoreStats {
            tokens: self.tokens.stats(),
            acks: self.reliability.stats(),
            peers: self.peers.len(),
            dedup_entries: self.dedup.len(),
            revoked_tokens: self.tokens.revoked_count(),
        }
    }

    /// Fresh 64-bit hex message ID from the injected random source.
    pub fn new_message_id(&mut self) -> String {
        clock::new_message_id(&mut *self.rng)
    }

    /// Stamp, encode and address a message. Sends to self resolve to no actions.
    pub fn prepare_send(
        &mut self,
        mut message: Message,
        target: Target,
        requires_ack: bool,
    ) -> Result<Vec<OutboundAction>, SendError> {
        // ACKs are never acknowledged themselves.
        let requires_ack = requires_ack && message.kind() != Some(MessageType::Ack);
        let addr = match target {
            Target::Broadcast if requires_ack => return Err(SendError::AckOnBroadcast),
            Target::Broadcast => return self.prepare_broadcast(message),
            Target::Addr(addr) => addr,
            Target::Identity(id) => {
                if id == self.config.user_id {
                    debug!(to = %id, "skipping send to self");
                    return Ok(vec![]);
                }
                self.resolve_identity(&id)?
            }
        };
        if self.is_self_addr(addr) {
            debug!(%addr, "skipping send to own listener");
            return Ok(vec![]);
        }
        self.stamp(&mut message, requires_ack)?;
        let payload = wire::encode_message(&message)?;
        if requires_ack {
            // stamp() guarantees the ID.
            if let Some(id) = message.message_id() {
                self.reliability
                    .track_for_ack(&id, payload.clone(), addr, self.clock.now_millis());
            }
        }
        Ok(vec![OutboundAction::SendDatagram(addr, payload)])
    }

    /// One datagram per known peer (self excluded) plus the broadcast address. A peer can
    /// receive both legs, so the message always carries a MESSAGE_ID for dedup.
    pub fn prepare_broadcast(
        &mut self,
        mut message: Message,
    ) -> Result<Vec<OutboundAction>, SendError> {
        self.stamp(&mut message, false)?;
        if message.message_id().is_none() {
            let id = self.new_message_id();
            message.insert(keys::MESSAGE_ID, id);
        }
        let payload = wire::encode_message(&message)?;
        let mut targets: Vec<SocketAddr> = self
            .peers
            .addrs()
            .into_iter()
            .filter(|a| !self.is_self_addr(*a))
            .collect();
        targets.push(SocketAddr::new(
            IpAddr::V4(self.config.broadcast_addr),
            self.config.listen_port,
        ));
        Ok(targets
            .into_iter()
            .map(|addr| OutboundAction::SendDatagram(addr, payload.clone()))
            .collect())
    }

    /// ACK for `original`, addressed to `reply_to`. Messages without MESSAGE_ID get none.
    pub fn prepare_ack(
        &mut self,
        original: &Message,
        reply_to: SocketAddr,
    ) -> Result<Vec<OutboundAction>, SendError> {
        let Some(acked_id) = original.message_id() else {
            return Ok(vec![]);
        };
        let mut ack = Message::new(MessageType::Ack.as_str())
            .with(keys::MESSAGE_ID, self.new_message_id())
            .with(keys::FROM, self.config.user_id.clone());
        if let Some(sender) = original.sender() {
            ack.insert(keys::TO, sender);
        }
        ack.insert(keys::ACK_MESSAGE_ID, acked_id);
        ack.insert(keys::STATUS, ACK_STATUS_RECEIVED);
        self.stamp(&mut ack, false)?;
        let payload = wire::encode_message(&ack)?;
        Ok(vec![OutboundAction::SendDatagram(reply_to, payload)])
    }

    /// Ingest one datagram: self-filter, peer table, ACK bookkeeping, dedup, token check,
    /// then hand back a [`Delivery`] for the registered handler. The MESSAGE_ID only counts as
    /// seen once the host reports a successful run through [`LsnpCore::mark_handled`].
    pub fn on_datagram_received(
        &mut self,
        bytes: &[u8],
        from: SocketAddr,
    ) -> Result<Vec<OutboundAction>, IngestError> {
        if self.config.simulated_loss > 0.0 && self.rng.gen::<f64>() < self.config.simulated_loss
        {
            return Err(IngestError::SimulatedLoss);
        }
        let message = wire::decode_message(bytes)?;
        let type_name = message
            .type_name()
            .ok_or(IngestError::MissingType)?
            .to_string();
        if self.is_self_message(&message, from) {
            return Err(IngestError::SelfMessage);
        }
        let reply_to = SocketAddr::new(from.ip(), message.listen_port().unwrap_or(from.port()));
        let now = self.clock.now_millis();
        if self.peers.observe(reply_to, message.sender(), now) {
            info!(peer = %reply_to, user_id = ?message.sender(), "discovered peer");
        }

        let kind = message.kind();
        if kind == Some(MessageType::Ack) {
            if let TypedMessage::Ack(ack) = TypedMessage::parse(&message)? {
                self.reliability.on_ack_received(&ack.message_id);
            }
            if !self.dispatcher.has_handler(&type_name) {
                return Ok(vec![]);
            }
            return Ok(vec![self.deliver(message, from, reply_to, false)?]);
        }

        let message_id = message.message_id();
        let ack_required = kind.is_some_and(MessageType::requires_ack);
        if let Some(id) = &message_id {
            if self.dedup.contains(id) {
                debug!(message_id = %id, msg_type = %type_name, "duplicate dropped");
                if ack_required {
                    return Ok(self.prepare_ack(&message, reply_to)?);
                }
                return Ok(vec![]);
            }
        }

        if let Some(scope) = kind.and_then(MessageType::required_scope) {
            let token = message.token().ok_or(TokenError::MalformedToken)?;
            self.tokens.validate(&token, scope, Some(from.ip()))?;
        }
        if kind == Some(MessageType::Revoke) {
            self.apply_revoke(&message, from)?;
            // The revocation itself is the processing; a handler is optional.
            if !self.dispatcher.has_handler(&type_name) {
                if let Some(id) = &message_id {
                    self.dedup.seen_before(id);
                }
                return Ok(vec![]);
            }
        }
        Ok(vec![self.deliver(message, from, reply_to, ack_required)?])
    }

    /// The host ran `delivery` successfully: remember its MESSAGE_ID so copies are not
    /// processed again, and return the ACK it owes, if any.
    pub fn mark_handled(&mut self, delivery: &Delivery) -> Result<Vec<OutboundAction>, SendError> {
        if let Some(id) = delivery.message.message_id() {
            self.dedup.seen_before(&id);
        }
        if delivery.ack {
            self.prepare_ack(&delivery.message, delivery.reply_to)
        } else {
            Ok(vec![])
        }
    }

    /// Stop waiting for an ACK whose first send never left the host.
    pub fn cancel_ack(&mut self, message_id: &str) -> bool {
        self.reliability.cancel(message_id)
    }

    /// Periodic tick: retry sweep, optional stale-peer eviction.
    pub fn tick(&mut self) -> Vec<OutboundAction> {
        let now = self.clock.now_millis();
        let mut actions = Vec::new();
        for action in self.reliability.sweep(now) {
            match action {
                SweepAction::Resend {
                    target, payload, ..
                } => actions.push(OutboundAction::SendDatagram(target, payload)),
                SweepAction::Exhausted {
                    message_id,
                    target,
                    retries,
                } => actions.push(OutboundAction::DeliveryExhausted(DeliveryFailure {
                    message_id,
                    target,
                    retries,
                })),
            }
        }
        if let Some(ttl) = self.config.peer_ttl_millis {
            for peer in self.peers.evict_stale(now, ttl) {
                info!(peer = %peer.addr, user_id = ?peer.user_id, "evicted stale peer");
            }
        }
        actions
    }

    fn deliver(
        &self,
        message: Message,
        from: SocketAddr,
        reply_to: SocketAddr,
        ack: bool,
    ) -> Result<OutboundAction, DispatchError> {
        let handler = self.dispatcher.route(&message, from)?;
        Ok(OutboundAction::Dispatch(Delivery {
            handler,
            message,
            from,
            reply_to,
            ack,
        }))
    }

    /// Built-in REVOKE: only the token's own subject host may revoke it.
    fn apply_revoke(&mut self, message: &Message, from: SocketAddr) -> Result<(), IngestError> {
        let TypedMessage::Revoke { token } = TypedMessage::parse(message)? else {
            return Ok(());
        };
        let parsed = Token::parse(&token)?;
        if let Some(host) = parsed.subject_host() {
            if host != from.ip().to_string() {
                return Err(TokenError::IdentityMismatch.into());
            }
        }
        if self.tokens.revoke(&token) {
            info!(subject = %parsed.subject, "token revoked by peer");
        }
        Ok(())
    }

    fn stamp(&mut self, message: &mut Message, requires_ack: bool) -> Result<(), SendError> {
        let kind = message.kind();
        if message.type_name().is_none() {
            return Err(SendError::MissingType);
        }
        message.insert_if_absent(keys::TIMESTAMP, self.clock.now_secs());
        message.insert_if_absent(keys::LISTEN_PORT, self.config.listen_port);
        if requires_ack && message.message_id().is_none() {
            let id = self.new_message_id();
            message.insert(keys::MESSAGE_ID, id);
        }
        if let Some(scope) = kind.and_then(MessageType::required_scope) {
            if !message.contains_key(keys::TOKEN) {
                let token =
                    self.tokens
                        .mint(&self.config.user_id, self.config.token_ttl_secs, scope);
                message.insert(keys::TOKEN, token);
            }
        }
        Ok(())
    }

    fn resolve_identity(&self, id: &str) -> Result<SocketAddr, SendError> {
        if let Some(addr) = self.peers.resolve(id) {
            return Ok(addr);
        }
        id.rsplit_once('@')
            .and_then(|(_, host)| host.parse::<IpAddr>().ok())
            .map(|ip| SocketAddr::new(ip, self.config.listen_port))
            .ok_or_else(|| SendError::UnknownTarget(id.to_string()))
    }

    /// Declared identity decides when present. Otherwise a datagram from this machine
    /// (loopback or a configured local IP) on our own port is treated as ours; two
    /// anonymous peers sharing one IP and port cannot be told apart.
    fn is_self_message(&self, message: &Message, from: SocketAddr) -> bool {
        if let Some(sender) = message.sender() {
            return sender == self.config.user_id;
        }
        let port = message.listen_port().unwrap_or(from.port());
        self.is_self_addr(SocketAddr::new(from.ip(), port))
    }

    fn is_self_addr(&self, addr: SocketAddr) -> bool {
        addr.port() == self.config.listen_port
            && (addr.ip().is_loopback()
                || addr.ip().is_unspecified()
                || self.config.local_ips.contains(&addr.ip()))
    }
}

#[derive(Debug, thiserror::Error)]
pub enum SendError {
    #[error("message has no TYPE")]
    MissingType,
    #[error("cannot resolve target {0:?}")]
    UnknownTarget(String),
    #[error("acknowledgment cannot be required on a broadcast")]
    AckOnBroadcast,
    #[error(transparent)]
    Encode(#[from] FrameEncodeError),
    #[error("send to {target} failed: {source}")]
    SocketSendFailure {
        target: SocketAddr,
        #[source]
        source: std::io::Error,
    },
}

/// Why an inbound datagram produced no delivery.
#[derive(Debug, thiserror::Error)]
pub enum IngestError {
    #[error("dropped by simulated packet loss")]
    SimulatedLoss,
    #[error(transparent)]
    Decode(#[from] FrameDecodeError),
    #[error("message has no TYPE")]
    MissingType,
    #[error("message originated from this peer")]
    SelfMessage,
    #[error(transparent)]
    Malformed(#[from] TypedParseError),
    #[error(transparent)]
    Token(#[from] TokenError),
    #[error(transparent)]
    Dispatch(#[from] DispatchError),
    #[error(transparent)]
    Reply(#[from] SendError),
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::protocol::Value;
    use std::collections::HashMap;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;

    const NOW: u64 = 1_700_000_000;
    const ALICE: &str = "alice@10.0.0.1";
    const BOB: &str = "bob@10.0.0.2";

    fn alice_addr() -> SocketAddr {
        "10.0.0.1:50999".parse().unwrap()
    }

    fn bob_addr() -> SocketAddr {
        "10.0.0.2:50999".parse().unwrap()
    }

    fn core_for(user: &str, clock: &ManualClock, seed: u64) -> LsnpCore {
        LsnpCore::new(
            CoreConfig::new(user, DEFAULT_PORT),
            Arc::new(clock.clone()),
            Box::new(StdRng::seed_from_u64(seed)),
        )
    }

    fn datagrams(actions: &[OutboundAction]) -> Vec<(SocketAddr, Vec<u8>)> {
        actions
            .iter()
            .filter_map(|a| match a {
                OutboundAction::SendDatagram(addr, bytes) => Some((*addr, bytes.clone())),
                _ => None,
            })
            .collect()
    }

    fn deliveries(actions: Vec<OutboundAction>) -> Vec<Delivery> {
        actions
            .into_iter()
            .filter_map(|a| match a {
                OutboundAction::Dispatch(d) => Some(d),
                _ => None,
            })
            .collect()
    }

    fn counting_handler(core: &mut LsnpCore, msg_type: &str) -> Arc<AtomicUsize> {
        let hits = Arc::new(AtomicUsize::new(0));
        let h = hits.clone();
        core.register_handler(msg_type, move |_, _| {
            h.fetch_add(1, Ordering::SeqCst);
            Ok(())
        });
        hits
    }

    #[test]
    fn send_stamps_fields() {
        let clock = ManualClock::at_secs(NOW);
        let mut alice = core_for(ALICE, &clock, 1);
        let dm = Message::new("DM")
            .with("FROM", ALICE)
            .with("TO", BOB)
            .with("CONTENT", "hi");
        let actions = alice.prepare_send(dm, Target::Addr(bob_addr()), true).unwrap();
        let out = datagrams(&actions);
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].0, bob_addr());
        let sent = wire::decode_message(&out[0].1).unwrap();
        assert_eq!(sent.get("TIMESTAMP"), Some(&Value::Int(NOW)));
        assert_eq!(sent.listen_port(), Some(DEFAULT_PORT));
        let token = sent.token().unwrap();
        assert_eq!(token, format!("{}|{}|chat", ALICE, NOW + DEFAULT_TOKEN_TTL_SECS));
        let id = sent.message_id().unwrap();
        assert!(alice.is_pending(&id));
    }

    #[test]
    fn existing_token_and_id_kept() {
        let clock = ManualClock::at_secs(NOW);
        let mut alice = core_for(ALICE, &clock, 1);
        let dm = Message::new("DM")
            .with("MESSAGE_ID", "deadbeef")
            .with("TOKEN", "custom|1|chat");
        let actions = alice.prepare_send(dm, Target::Addr(bob_addr()), true).unwrap();
        let sent = wire::decode_message(&datagrams(&actions)[0].1).unwrap();
        assert_eq!(sent.message_id().as_deref(), Some("deadbeef"));
        assert_eq!(sent.token().as_deref(), Some("custom|1|chat"));
        assert!(alice.is_pending("deadbeef"));
    }

    #[test]
    fn send_to_self_is_noop() {
        let clock = ManualClock::at_secs(NOW);
        let mut alice = core_for(ALICE, &clock, 1);
        let ping = Message::new("PING").with("USER_ID", ALICE);
        assert!(alice
            .prepare_send(ping.clone(), Target::Identity(ALICE.into()), false)
            .unwrap()
            .is_empty());
        let own: SocketAddr = "127.0.0.1:50999".parse().unwrap();
        assert!(alice.prepare_send(ping, own.into(), false).unwrap().is_empty());
    }

    #[test]
    fn identity_resolution() {
        let clock = ManualClock::at_secs(NOW);
        let mut alice = core_for(ALICE, &clock, 1);
        let actions = alice
            .prepare_send(Message::new("PING"), Target::Identity(BOB.into()), false)
            .unwrap();
        assert_eq!(datagrams(&actions)[0].0, bob_addr());
        assert!(matches!(
            alice.prepare_send(Message::new("PING"), "bob@nowhere".into(), false),
            Err(SendError::UnknownTarget(_))
        ));
    }

    #[test]
    fn send_without_type_fails() {
        let clock = ManualClock::at_secs(NOW);
        let mut alice = core_for(ALICE, &clock, 1);
        let mut m = Message::default();
        m.insert("CONTENT", "x");
        assert!(matches!(
            alice.prepare_send(m, Target::Addr(bob_addr()), false),
            Err(SendError::MissingType)
        ));
    }

    #[test]
    fn broadcast_fans_out() {
        let clock = ManualClock::at_secs(NOW);
        let mut alice = core_for(ALICE, &clock, 1);
        let bob = Message::new("PING").with("USER_ID", BOB);
        alice
            .on_datagram_received(&wire::encode_message(&bob).unwrap(), bob_addr())
            .unwrap_err();
        let actions = alice
            .prepare_broadcast(Message::new("PROFILE").with("USER_ID", ALICE))
            .unwrap();
        let targets: Vec<SocketAddr> = datagrams(&actions).into_iter().map(|(a, _)| a).collect();
        assert_eq!(
            targets,
            vec![bob_addr(), "255.255.255.255:50999".parse().unwrap()]
        );
        assert!(matches!(
            alice.prepare_send(Message::new("POST"), Target::Broadcast, true),
            Err(SendError::AckOnBroadcast)
        ));
    }

    #[test]
    fn dm_with_ack_roundtrip() {
        let clock = ManualClock::at_secs(NOW);
        let mut alice = core_for(ALICE, &clock, 1);
        let mut bob = core_for(BOB, &clock, 2);
        let hits = counting_handler(&mut bob, "DM");

        let dm = Message::new("DM")
            .with("FROM", ALICE)
            .with("TO", BOB)
            .with("MESSAGE_ID", "deadbeef")
            .with("CONTENT", "hello");
        let out = datagrams(&alice.prepare_send(dm, BOB.into(), true).unwrap());
        assert!(alice.is_pending("deadbeef"));

        let delivered = deliveries(bob.on_datagram_received(&out[0].1, alice_addr()).unwrap());
        assert_eq!(delivered.len(), 1);
        let d = &delivered[0];
        assert!(d.ack);
        assert_eq!(d.reply_to, alice_addr());
        d.run().unwrap();
        assert_eq!(hits.load(Ordering::SeqCst), 1);

        let ack = datagrams(&bob.mark_handled(d).unwrap());
        assert_eq!(ack[0].0, alice_addr());
        let ack_msg = wire::decode_message(&ack[0].1).unwrap();
        assert_eq!(ack_msg.type_name(), Some("ACK"));
        assert_eq!(ack_msg.get_text("ACK_MESSAGE_ID").as_deref(), Some("deadbeef"));
        assert_eq!(ack_msg.get_text("TO").as_deref(), Some(ALICE));
        assert_eq!(ack_msg.get_text("STATUS").as_deref(), Some("RECEIVED"));
        assert!(!ack_msg.contains_key("TOKEN"));

        // No ACK handler registered on Alice: bookkeeping still happens.
        let res = alice.on_datagram_received(&ack[0].1, bob_addr()).unwrap();
        assert!(res.is_empty());
        assert!(!alice.is_pending("deadbeef"));
        assert_eq!(alice.stats().acks.acked, 1);
    }

    #[test]
    fn duplicates_dispatched_once_but_acked_each_time() {
        let clock = ManualClock::at_secs(NOW);
        let mut alice = core_for(ALICE, &clock, 1);
        let mut bob = core_for(BOB, &clock, 2);
        let hits = counting_handler(&mut bob, "DM");
        let dm = Message::new("DM").with("FROM", ALICE).with("MESSAGE_ID", "abc123");
        let bytes = datagrams(&alice.prepare_send(dm, BOB.into(), true).unwrap())[0]
            .1
            .clone();

        let mut acks = 0;
        for _ in 0..5 {
            for action in bob.on_datagram_received(&bytes, alice_addr()).unwrap() {
                match action {
                    OutboundAction::Dispatch(d) => {
                        d.run().unwrap();
                        acks += datagrams(&bob.mark_handled(&d).unwrap()).len();
                    }
                    OutboundAction::SendDatagram(_, _) => acks += 1,
                    OutboundAction::DeliveryExhausted(_) => unreachable!(),
                }
            }
        }
        assert_eq!(hits.load(Ordering::SeqCst), 1);
        assert_eq!(acks, 5);
    }

    #[test]
    fn failed_handler_is_retried_not_acked() {
        let clock = ManualClock::at_secs(NOW);
        let mut alice = core_for(ALICE, &clock, 1);
        let mut bob = core_for(BOB, &clock, 2);
        let calls = Arc::new(AtomicUsize::new(0));
        let c = calls.clone();
        bob.register_handler("DM", move |_, _| {
            c.fetch_add(1, Ordering::SeqCst);
            Err(anyhow::anyhow!("inbox locked"))
        });
        let dm = Message::new("DM").with("FROM", ALICE).with("MESSAGE_ID", "feed01");
        let bytes = datagrams(&alice.prepare_send(dm, BOB.into(), true).unwrap())[0]
            .1
            .clone();

        for _ in 0..2 {
            let actions = bob.on_datagram_received(&bytes, alice_addr()).unwrap();
            assert!(datagrams(&actions).is_empty());
            let delivered = deliveries(actions);
            assert_eq!(delivered.len(), 1);
            assert!(matches!(
                delivered[0].run(),
                Err(DispatchError::HandlerFailed { .. })
            ));
        }
        assert_eq!(calls.load(Ordering::SeqCst), 2);
        assert!(alice.is_pending("feed01"));
    }

    #[test]
    fn unhandled_type_never_acked() {
        let clock = ManualClock::at_secs(NOW);
        let mut alice = core_for(ALICE, &clock, 1);
        let mut bob = core_for(BOB, &clock, 2);
        let follow = Message::new("FOLLOW").with("FROM", ALICE).with("TO", BOB);
        let bytes = datagrams(&alice.prepare_send(follow, BOB.into(), true).unwrap())[0]
            .1
            .clone();
        for _ in 0..2 {
            assert!(matches!(
                bob.on_datagram_received(&bytes, alice_addr()),
                Err(IngestError::Dispatch(DispatchError::UnrecognizedType(t))) if t == "FOLLOW"
            ));
        }
        assert_eq!(bob.stats().dedup_entries, 0);
    }

    #[test]
    fn broadcast_copies_processed_once() {
        let clock = ManualClock::at_secs(NOW);
        let mut alice = core_for(ALICE, &clock, 1);
        let mut bob = core_for(BOB, &clock, 2);
        let posts = counting_handler(&mut bob, "POST");
        let hello = Message::new("PING").with("USER_ID", BOB);
        alice
            .on_datagram_received(&wire::encode_message(&hello).unwrap(), bob_addr())
            .unwrap_err();

        let post = Message::new("POST")
            .with("USER_ID", ALICE)
            .with("CONTENT", "hello lan");
        let legs = datagrams(&alice.prepare_broadcast(post).unwrap());
        assert_eq!(legs.len(), 2);
        assert_eq!(legs[0].1, legs[1].1);
        assert!(wire::decode_message(&legs[0].1).unwrap().message_id().is_some());

        // Bob listens on the shared port, so both legs reach him.
        for (_, bytes) in &legs {
            for d in deliveries(bob.on_datagram_received(bytes, alice_addr()).unwrap()) {
                d.run().unwrap();
                assert!(bob.mark_handled(&d).unwrap().is_empty());
            }
        }
        assert_eq!(posts.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn ack_messages_are_not_tracked() {
        let clock = ManualClock::at_secs(NOW);
        let mut alice = core_for(ALICE, &clock, 1);
        let ack = Message::new("ACK")
            .with("MESSAGE_ID", "ack0001a")
            .with("ACK_MESSAGE_ID", "deadbeef");
        assert_eq!(
            datagrams(&alice.prepare_send(ack, BOB.into(), true).unwrap()).len(),
            1
        );
        assert!(!alice.is_pending("ack0001a"));
        assert_eq!(alice.stats().acks.tracked, 0);
    }

    #[test]
    fn cancelled_send_never_exhausts() {
        let clock = ManualClock::at_secs(NOW);
        let mut alice = core_for(ALICE, &clock, 1);
        let dm = Message::new("DM").with("FROM", ALICE).with("MESSAGE_ID", "gone01");
        alice.prepare_send(dm, BOB.into(), true).unwrap();
        assert!(alice.cancel_ack("gone01"));
        clock.advance_secs(60);
        assert!(alice.tick().is_empty());
        assert_eq!(alice.stats().acks.exhausted, 0);
    }

    #[test]
    fn self_filter_by_identity() {
        let clock = ManualClock::at_secs(NOW);
        let mut alice = core_for(ALICE, &clock, 1);
        let hits = counting_handler(&mut alice, "PROFILE");
        let own = Message::new("PROFILE")
            .with("USER_ID", ALICE)
            .with("DISPLAY_NAME", "Alice");
        // Arrives from a foreign-looking address (NAT), identity still wins.
        let res = alice.on_datagram_received(&wire::encode_message(&own).unwrap(), bob_addr());
        assert!(matches!(res, Err(IngestError::SelfMessage)));
        assert_eq!(hits.load(Ordering::SeqCst), 0);
        assert!(alice.known_peers().is_empty());
    }

    #[test]
    fn self_filter_fallback_without_identity() {
        let clock = ManualClock::at_secs(NOW);
        let mut alice = core_for(ALICE, &clock, 1);
        counting_handler(&mut alice, "HELLO");
        let hello = wire::encode_message(&Message::new("HELLO").with("LISTEN_PORT", 50999u16))
            .unwrap();
        let loopback: SocketAddr = "127.0.0.1:40000".parse().unwrap();
        assert!(matches!(
            alice.on_datagram_received(&hello, loopback),
            Err(IngestError::SelfMessage)
        ));
        // Same IP, different declared port: another peer on this machine.
        let other = wire::encode_message(&Message::new("HELLO").with("LISTEN_PORT", 51000u16))
            .unwrap();
        assert_eq!(deliveries(alice.on_datagram_received(&other, loopback).unwrap()).len(), 1);
        assert_eq!(
            alice.known_peers()[0].addr,
            "127.0.0.1:51000".parse::<SocketAddr>().unwrap()
        );
    }

    #[test]
    fn listen_port_recorded_not_source_port() {
        let clock = ManualClock::at_secs(NOW);
        let mut bob = core_for(BOB, &clock, 2);
        counting_handler(&mut bob, "HELLO");
        let hello = Message::new("HELLO")
            .with("USER_ID", ALICE)
            .with("LISTEN_PORT", 50999u16);
        let ephemeral: SocketAddr = "10.0.0.1:54321".parse().unwrap();
        bob.on_datagram_received(&wire::encode_message(&hello).unwrap(), ephemeral)
            .unwrap();
        let peers = bob.known_peers();
        assert_eq!(peers.len(), 1);
        assert_eq!(peers[0].addr, alice_addr());
        assert_eq!(peers[0].user_id.as_deref(), Some(ALICE));
        clock.advance_secs(3);
        bob.on_datagram_received(&wire::encode_message(&hello).unwrap(), ephemeral)
            .unwrap();
        assert_eq!(bob.known_peers()[0].last_seen_millis, (NOW + 3) * 1000);
    }

    #[test]
    fn unrecognized_type_dropped() {
        let clock = ManualClock::at_secs(NOW);
        let mut bob = core_for(BOB, &clock, 2);
        let m = wire::encode_message(&Message::new("WHATEVER").with("FROM", ALICE)).unwrap();
        assert!(matches!(
            bob.on_datagram_received(&m, alice_addr()),
            Err(IngestError::Dispatch(DispatchError::UnrecognizedType(t))) if t == "WHATEVER"
        ));
        assert!(matches!(
            bob.on_datagram_received(b"no colon here\n\n", alice_addr()),
            Err(IngestError::MissingType)
        ));
    }

    #[test]
    fn token_rejections() {
        let clock = ManualClock::at_secs(NOW);
        let mut bob = core_for(BOB, &clock, 2);
        let hits = counting_handler(&mut bob, "DM");

        let missing = Message::new("DM").with("FROM", ALICE).with("MESSAGE_ID", "a1");
        assert!(matches!(
            bob.on_datagram_received(&wire::encode_message(&missing).unwrap(), alice_addr()),
            Err(IngestError::Token(TokenError::MalformedToken))
        ));

        let expired = Message::new("DM")
            .with("FROM", ALICE)
            .with("MESSAGE_ID", "a2")
            .with("TOKEN", format!("{}|{}|chat", ALICE, NOW - 60));
        assert!(matches!(
            bob.on_datagram_received(&wire::encode_message(&expired).unwrap(), alice_addr()),
            Err(IngestError::Token(TokenError::Expired))
        ));

        let wrong_scope = Message::new("DM")
            .with("FROM", ALICE)
            .with("MESSAGE_ID", "a3")
            .with("TOKEN", format!("{}|{}|file", ALICE, NOW + 60));
        assert!(matches!(
            bob.on_datagram_received(&wire::encode_message(&wrong_scope).unwrap(), alice_addr()),
            Err(IngestError::Token(TokenError::ScopeMismatch))
        ));

        let spoofed = Message::new("DM")
            .with("FROM", ALICE)
            .with("MESSAGE_ID", "a4")
            .with("TOKEN", format!("{}|{}|chat", ALICE, NOW + 60));
        let stranger: SocketAddr = "10.0.0.66:50999".parse().unwrap();
        assert!(matches!(
            bob.on_datagram_received(&wire::encode_message(&spoofed).unwrap(), stranger),
            Err(IngestError::Token(TokenError::IdentityMismatch))
        ));

        assert_eq!(hits.load(Ordering::SeqCst), 0);
        assert_eq!(bob.stats().tokens.invalid, 3);

        // A rejected ID is not remembered, so a corrected resend gets through.
        let fixed = Message::new("DM")
            .with("FROM", ALICE)
            .with("MESSAGE_ID", "a2")
            .with("TOKEN", format!("{}|{}|chat", ALICE, NOW + 60));
        let delivered = deliveries(
            bob.on_datagram_received(&wire::encode_message(&fixed).unwrap(), alice_addr())
                .unwrap(),
        );
        assert_eq!(delivered.len(), 1);
    }

    #[test]
    fn revoke_message_revokes_token() {
        let clock = ManualClock::at_secs(NOW);
        let mut alice = core_for(ALICE, &clock, 1);
        let mut bob = core_for(BOB, &clock, 2);
        counting_handler(&mut bob, "DM");
        let token = alice.mint_token(ALICE, 3600, Scope::Chat);

        // Someone else cannot revoke Alice's token.
        let forged = wire::encode_message(&Message::new("REVOKE").with("TOKEN", token.clone()))
            .unwrap();
        let stranger: SocketAddr = "10.0.0.66:50999".parse().unwrap();
        assert!(matches!(
            bob.on_datagram_received(&forged, stranger),
            Err(IngestError::Token(TokenError::IdentityMismatch))
        ));

        let revoke = Message::new("REVOKE")
            .with("FROM", ALICE)
            .with("TOKEN", token.clone());
        let out = datagrams(&alice.prepare_send(revoke, BOB.into(), false).unwrap());
        assert!(bob.on_datagram_received(&out[0].1, alice_addr()).unwrap().is_empty());
        assert!(bob.tokens().is_revoked(&token));

        let dm = Message::new("DM")
            .with("FROM", ALICE)
            .with("MESSAGE_ID", "d1")
            .with("TOKEN", token);
        assert!(matches!(
            bob.on_datagram_received(&wire::encode_message(&dm).unwrap(), alice_addr()),
            Err(IngestError::Token(TokenError::Revoked))
        ));
    }

    #[test]
    fn tick_retries_then_reports_exhaustion() {
        let clock = ManualClock::at_secs(NOW);
        let mut alice = core_for(ALICE, &clock, 1);
        let dm = Message::new("DM").with("FROM", ALICE).with("MESSAGE_ID", "lost1");
        let first = datagrams(&alice.prepare_send(dm, BOB.into(), true).unwrap());

        let mut resent = 0;
        let mut failure = None;
        for _ in 0..25 {
            clock.advance_secs(1);
            for action in alice.tick() {
                match action {
                    OutboundAction::SendDatagram(addr, bytes) => {
                        assert_eq!(addr, bob_addr());
                        assert_eq!(bytes, first[0].1);
                        resent += 1;
                    }
                    OutboundAction::DeliveryExhausted(f) => failure = Some(f),
                    OutboundAction::Dispatch(_) => unreachable!(),
                }
            }
        }
        assert_eq!(resent, 3);
        assert_eq!(
            failure,
            Some(DeliveryFailure {
                message_id: "lost1".into(),
                target: bob_addr(),
                retries: 3,
            })
        );
        assert!(!alice.is_pending("lost1"));
    }

    #[test]
    fn stale_peers_evicted_when_configured() {
        let clock = ManualClock::at_secs(NOW);
        let mut config = CoreConfig::new(BOB, DEFAULT_PORT);
        config.peer_ttl_millis = Some(60_000);
        let mut bob = LsnpCore::new(
            config,
            Arc::new(clock.clone()),
            Box::new(StdRng::seed_from_u64(3)),
        );
        counting_handler(&mut bob, "PING");
        let ping = wire::encode_message(&Message::new("PING").with("USER_ID", ALICE)).unwrap();
        bob.on_datagram_received(&ping, alice_addr()).unwrap();
        clock.advance_secs(59);
        bob.tick();
        assert_eq!(bob.known_peers().len(), 1);
        clock.advance_secs(1);
        bob.tick();
        assert!(bob.known_peers().is_empty());
    }

    #[test]
    fn simulated_loss_drops_everything_at_one() {
        let clock = ManualClock::at_secs(NOW);
        let mut config = CoreConfig::new(BOB, DEFAULT_PORT);
        config.simulated_loss = 1.0;
        let mut bob = LsnpCore::new(
            config,
            Arc::new(clock.clone()),
            Box::new(StdRng::seed_from_u64(3)),
        );
        let ping = wire::encode_message(&Message::new("PING").with("USER_ID", ALICE)).unwrap();
        assert!(matches!(
            bob.on_datagram_received(&ping, alice_addr()),
            Err(IngestError::SimulatedLoss)
        ));
    }

    #[test]
    fn profile_broadcast_updates_view() {
        let clock = ManualClock::at_secs(NOW);
        let mut alice = core_for(ALICE, &clock, 1);
        let mut bob = core_for(BOB, &clock, 2);

        let profiles: Arc<Mutex<HashMap<String, (String, String)>>> = Arc::default();
        let view = profiles.clone();
        bob.register_handler("PROFILE", move |m, _| {
            if let TypedMessage::Profile(p) = TypedMessage::parse(m)? {
                view.lock()
                    .unwrap()
                    .insert(p.user_id, (p.display_name, p.status));
            }
            Ok(())
        });
        counting_handler(&mut alice, "HELLO");

        // Bob introduces himself so Alice has him in her table.
        let hello = datagrams(
            &bob.prepare_send(
                Message::new("HELLO").with("USER_ID", BOB),
                Target::Addr(alice_addr()),
                false,
            )
            .unwrap(),
        );
        alice.on_datagram_received(&hello[0].1, bob_addr()).unwrap();

        let profile = Message::new("PROFILE")
            .with("USER_ID", ALICE)
            .with("DISPLAY_NAME", "Alice")
            .with("STATUS", "Online");
        let out = datagrams(&alice.prepare_broadcast(profile).unwrap());
        let (_, to_bob) = out.iter().find(|(a, _)| *a == bob_addr()).unwrap();
        for d in deliveries(bob.on_datagram_received(to_bob, alice_addr()).unwrap()) {
            assert!(!d.ack);
            d.run().unwrap();
        }
        assert_eq!(
            profiles.lock().unwrap().get(ALICE),
            Some(&("Alice".to_string(), "Online".to_string()))
        );
    }
}
