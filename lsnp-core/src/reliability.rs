//! At-least-once delivery: messages awaiting ACK are re-sent on timeout up to a retry ceiling.

use std::collections::HashMap;
use std::net::SocketAddr;

use serde::Serialize;
use tracing::{debug, warn};

use crate::protocol::{ACK_TIMEOUT_SECS, MAX_RETRIES};

/// A sent message still waiting for its ACK.
#[derive(Debug, Clone, PartialEq, Eq)]
struct PendingAck {
    pub message_id: String,
    pub payload: Vec<u8>,
    pub target: SocketAddr,
    pub sent_at_millis: u64,
    pub retry_count: u32,
}

/// What a sweep asks the host to do.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SweepAction {
    /// Send the stored payload again.
    Resend {
        message_id: String,
        target: SocketAddr,
        payload: Vec<u8>,
        attempt: u32,
    },
    /// Retry ceiling reached; the entry has been removed.
    Exhausted {
        message_id: String,
        target: SocketAddr,
        retries: u32,
    },
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct AckStats {
    pub tracked: u64,
    pub acked: u64,
    pub retries: u64,
    pub exhausted: u64,
    pub pending: usize,
}

pub struct ReliabilityManager {
    pending: HashMap<String, PendingAck>,
    ack_timeout_millis: u64,
    max_retries: u32,
    tracked: u64,
    acked: u64,
    retries: u64,
    exhausted: u64,
}

impl ReliabilityManager {
    pub fn new(ack_timeout_millis: u64, max_retries: u32) -> Self {
        Self {
            pending: HashMap::new(),
            ack_timeout_millis,
            max_retries,
            tracked: 0,
            acked: 0,
            retries: 0,
            exhausted: 0,
        }
    }

    /// Start waiting for an ACK. Re-tracking an ID restarts its retry budget.
    pub fn track_for_ack(
        &mut self,
        message_id: &str,
        payload: Vec<u8>,
        target: SocketAddr,
        now_millis: u64,
    ) {
        self.tracked += 1;
        self.pending.insert(
            message_id.to_string(),
            PendingAck {
                message_id: message_id.to_string(),
                payload,
                target,
                sent_at_millis: now_millis,
                retry_count: 0,
            },
        );
    }

    /// Clear the pending entry for `message_id`. Returns false for unknown or already acked IDs.
    pub fn on_ack_received(&mut self, message_id: &str) -> bool {
        match self.pending.remove(message_id) {
            Some(p) => {
                self.acked += 1;
                debug!(message_id, retries = p.retry_count, "ack received");
                true
            }
            None => false,
        }
    }

    /// Re-send everything older than the ACK timeout; give up on entries at the retry ceiling.
    pub fn sweep(&mut self, now_millis: u64) -> Vec<SweepAction> {
        let mut actions = Vec::new();
        let mut given_up = Vec::new();
        for pending in self.pending.values_mut() {
            if now_millis.saturating_sub(pending.sent_at_millis) < self.ack_timeout_millis {
                continue;
            }
            if pending.retry_count < self.max_retries {
                pending.retry_count += 1;
                pending.sent_at_millis = now_millis;
                self.retries += 1;
                debug!(
                    message_id = %pending.message_id,
                    attempt = pending.retry_count,
                    target = %pending.target,
                    "retrying unacknowledged message"
                );
                actions.push(SweepAction::Resend {
                    message_id: pending.message_id.clone(),
                    target: pending.target,
                    payload: pending.payload.clone(),
                    attempt: pending.retry_count,
                });
            } else {
                given_up.push(pending.message_id.clone());
            }
        }
        for id in given_up {
            if let Some(p) = self.pending.remove(&id) {
                self.exhausted += 1;
                warn!(message_id = %p.message_id, target = %p.target, "delivery exhausted");
                actions.push(SweepAction::Exhausted {
                    message_id: p.message_id,
                    target: p.target,
                    retries: p.retry_count,
                });
            }
        }
        actions
    }

    pub fn is_pending(&self, message_id: &str) -> bool {
        self.pending.contains_key(message_id)
    }

    /// Drop the entry without counting it as acked (the first send never left).
    pub fn cancel(&mut self, message_id: &str) -> bool {
        self.pending.remove(message_id).is_some()
    }

    pub fn stats(&self) -> AckStats {
        AckStats {
            tracked: self.tracked,
            acked: self.acked,
            retries: self.retries,
            exhausted: self.exhausted,
            pending: self.pending.len(),
        }
    }
}

impl Default for ReliabilityManager {
    fn default() -> Self {
        Self::new(ACK_TIMEOUT_SECS * 1000, MAX_RETRIES)
    }
}
