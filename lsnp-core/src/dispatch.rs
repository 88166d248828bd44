//! TYPE -> handler routing.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;

use tracing::debug;

use crate::protocol::Message;

/// Upper-layer callback for one message TYPE. Errors suppress the automatic ACK.
pub type Handler = Arc<dyn Fn(&Message, SocketAddr) -> anyhow::Result<()> + Send + Sync>;

#[derive(Debug, thiserror::Error)]
pub enum DispatchError {
    #[error("unrecognized message type {0:?}")]
    UnrecognizedType(String),
    #[error("handler for {msg_type} failed: {source}")]
    HandlerFailed {
        msg_type: String,
        #[source]
        source: anyhow::Error,
    },
}

#[derive(Default, Clone)]
pub struct Dispatcher {
    handlers: HashMap<String, Handler>,
}

impl Dispatcher {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register (or replace) the handler for `msg_type`.
    pub fn register<F>(&mut self, msg_type: impl Into<String>, handler: F)
    where
        F: Fn(&Message, SocketAddr) -> anyhow::Result<()> + Send + Sync + 'static,
    {
        self.handlers.insert(msg_type.into(), Arc::new(handler));
    }

    /// Handler for a TYPE, cloned out so callers can run it without holding any lock.
    pub fn handler_for(&self, msg_type: &str) -> Option<Handler> {
        self.handlers.get(msg_type).cloned()
    }

    pub fn has_handler(&self, msg_type: &str) -> bool {
        self.handlers.contains_key(msg_type)
    }

    /// Handler for `message`'s TYPE. A missing handler is non-fatal: the message is dropped.
    pub fn route(&self, message: &Message, from: SocketAddr) -> Result<Handler, DispatchError> {
        let msg_type = message.type_name().unwrap_or_default();
        self.handler_for(msg_type).ok_or_else(|| {
            debug!(msg_type, %from, "unrecognized message type dropped");
            DispatchError::UnrecognizedType(msg_type.to_string())
        })
    }
}

/// Run `handler`, tagging a failure with the message TYPE.
pub fn invoke(handler: &Handler, message: &Message, from: SocketAddr) -> Result<(), DispatchError> {
    handler(message, from).map_err(|source| DispatchError::HandlerFailed {
        msg_type: message.type_name().unwrap_or_default().to_string(),
        source,
    })
}
