//! LSNP protocol engine.
//! Host-driven: no I/O; host passes datagrams and ticks, and receives actions.

pub mod clock;
pub mod core;
pub mod dedup;
pub mod dispatch;
pub mod peers;
pub mod protocol;
pub mod reliability;
pub mod token;
pub mod wire;

pub use crate::core::{
    CoreConfig, CoreStats, Delivery, DeliveryFailure, IngestError, LsnpCore, OutboundAction,
    SendError, Target,
};
pub use clock::{Clock, ManualClock, SystemClock};
pub use dispatch::{DispatchError, Dispatcher, Handler};
pub use peers::{PeerRecord, PeerTable};
pub use protocol::{Message, MessageType, Scope, TypedMessage, Value, DEFAULT_PORT};
pub use token::{Token, TokenAuthority, TokenError, TokenStats};
pub use wire::{decode_message, encode_message, FrameDecodeError, FrameEncodeError};
