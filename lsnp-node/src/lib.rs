//! LSNP node: tokio host around `lsnp_core`. Socket, background tasks, presence, config.

pub mod config;
pub mod discovery;
pub mod engine;
pub mod transport;

pub use engine::{Engine, EngineConfig};
pub use transport::{detect_local_ip, EngineError};
