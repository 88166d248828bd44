//! LSNP message model: ordered key/value messages, the TYPE catalog and token scopes.

use std::fmt;
use std::net::Ipv4Addr;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

/// Well-known UDP port every peer binds.
pub const DEFAULT_PORT: u16 = 50999;
/// Limited broadcast address used for discovery fan-out.
pub const BROADCAST_ADDR: Ipv4Addr = Ipv4Addr::BROADCAST;
/// Seconds an unacknowledged message waits before it is re-sent.
pub const ACK_TIMEOUT_SECS: u64 = 5;
/// Re-sends attempted before a pending message is given up.
pub const MAX_RETRIES: u32 = 3;
/// Lifetime of tokens minted by `Send` when the caller supplied none.
pub const DEFAULT_TOKEN_TTL_SECS: u64 = 3600;

/// Field names with protocol meaning.
pub mod keys {
    pub const TYPE: &str = "TYPE";
    pub const FROM: &str = "FROM";
    pub const USER_ID: &str = "USER_ID";
    pub const TO: &str = "TO";
    pub const MESSAGE_ID: &str = "MESSAGE_ID";
    pub const TIMESTAMP: &str = "TIMESTAMP";
    pub const TOKEN: &str = "TOKEN";
    /// Internal routing flag; never written to the wire.
    pub const BROADCAST: &str = "BROADCAST";
    pub const LISTEN_PORT: &str = "LISTEN_PORT";
    pub const ACK_MESSAGE_ID: &str = "ACK_MESSAGE_ID";
    pub const STATUS: &str = "STATUS";
    pub const DISPLAY_NAME: &str = "DISPLAY_NAME";
    pub const AVATAR_TYPE: &str = "AVATAR_TYPE";
    pub const AVATAR_DATA: &str = "AVATAR_DATA";
    pub const CONTENT: &str = "CONTENT";
    pub const TTL: &str = "TTL";
    pub const POST_TIMESTAMP: &str = "POST_TIMESTAMP";
    pub const ACTION: &str = "ACTION";
}

/// A single field value. Digit-only values travel as integers after decoding.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Value {
    Int(u64),
    Text(String),
}

impl Value {
    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::Text(s) => Some(s),
            Value::Int(_) => None,
        }
    }

    pub fn as_u64(&self) -> Option<u64> {
        match self {
            Value::Int(n) => Some(*n),
            Value::Text(s) => s.parse().ok(),
        }
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Int(n) => write!(f, "{}", n),
            Value::Text(s) => f.write_str(s),
        }
    }
}

impl From<&str> for Value {
    fn from(s: &str) -> Self {
        Value::Text(s.to_string())
    }
}

impl From<String> for Value {
    fn from(s: String) -> Self {
        Value::Text(s)
    }
}

impl From<u64> for Value {
    fn from(n: u64) -> Self {
        Value::Int(n)
    }
}

impl From<u32> for Value {
    fn from(n: u32) -> Self {
        Value::Int(n.into())
    }
}

impl From<u16> for Value {
    fn from(n: u16) -> Self {
        Value::Int(n.into())
    }
}

/// Flat message: insertion-ordered string keys. Setting an existing key replaces it in place.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Message {
    fields: Vec<(String, Value)>,
}

impl Message {
    /// Start a message with its TYPE field.
    pub fn new(msg_type: impl Into<String>) -> Self {
        let mut m = Self::default();
        m.insert(keys::TYPE, msg_type.into());
        m
    }

    /// Builder form of [`Message::insert`].
    pub fn with(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.insert(key, value);
        self
    }

    pub fn insert(&mut self, key: impl Into<String>, value: impl Into<Value>) {
        let key = key.into();
        let value = value.into();
        match self.fields.iter_mut().find(|(k, _)| *k == key) {
            Some(slot) => slot.1 = value,
            None => self.fields.push((key, value)),
        }
    }

    pub fn insert_if_absent(&mut self, key: &str, value: impl Into<Value>) {
        if !self.contains_key(key) {
            self.fields.push((key.to_string(), value.into()));
        }
    }

    pub fn get(&self, key: &str) -> Option<&Value> {
        self.fields.iter().find(|(k, _)| k == key).map(|(_, v)| v)
    }

    /// Text form of a field whatever its decoded representation.
    pub fn get_text(&self, key: &str) -> Option<String> {
        self.get(key).map(Value::to_string)
    }

    pub fn get_u64(&self, key: &str) -> Option<u64> {
        self.get(key).and_then(Value::as_u64)
    }

    pub fn remove(&mut self, key: &str) -> Option<Value> {
        let idx = self.fields.iter().position(|(k, _)| k == key)?;
        Some(self.fields.remove(idx).1)
    }

    pub fn contains_key(&self, key: &str) -> bool {
        self.fields.iter().any(|(k, _)| k == key)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &Value)> {
        self.fields.iter().map(|(k, v)| (k.as_str(), v))
    }

    pub fn len(&self) -> usize {
        self.fields.len()
    }

    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }

    /// Raw TYPE field, if present and textual.
    pub fn type_name(&self) -> Option<&str> {
        self.get(keys::TYPE).and_then(Value::as_str)
    }

    /// TYPE as a catalog entry; `None` for missing or unknown types.
    pub fn kind(&self) -> Option<MessageType> {
        self.type_name().and_then(|t| t.parse().ok())
    }

    /// Declared sender identity: `USER_ID`, falling back to `FROM`.
    pub fn sender(&self) -> Option<String> {
        self.get_text(keys::USER_ID)
            .or_else(|| self.get_text(keys::FROM))
    }

    pub fn message_id(&self) -> Option<String> {
        self.get_text(keys::MESSAGE_ID)
    }

    pub fn token(&self) -> Option<String> {
        self.get_text(keys::TOKEN)
    }

    pub fn listen_port(&self) -> Option<u16> {
        self.get_u64(keys::LISTEN_PORT)
            .and_then(|p| u16::try_from(p).ok())
    }
}

impl FromIterator<(String, Value)> for Message {
    fn from_iter<I: IntoIterator<Item = (String, Value)>>(iter: I) -> Self {
        let mut m = Message::default();
        for (k, v) in iter {
            m.insert(k, v);
        }
        m
    }
}

/// Capability tag carried in a token.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Scope {
    Chat,
    File,
    Broadcast,
    Follow,
    Game,
    Group,
}

impl Scope {
    pub const ALL: [Scope; 6] = [
        Scope::Chat,
        Scope::File,
        Scope::Broadcast,
        Scope::Follow,
        Scope::Game,
        Scope::Group,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            Scope::Chat => "chat",
            Scope::File => "file",
            Scope::Broadcast => "broadcast",
            Scope::Follow => "follow",
            Scope::Game => "game",
            Scope::Group => "group",
        }
    }
}

impl fmt::Display for Scope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("unknown scope {0:?}")]
pub struct UnknownScope(pub String);

impl FromStr for Scope {
    type Err = UnknownScope;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Scope::ALL
            .into_iter()
            .find(|scope| scope.as_str() == s)
            .ok_or_else(|| UnknownScope(s.to_string()))
    }
}

/// Every TYPE this engine knows the contract of.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MessageType {
    Profile,
    Post,
    Dm,
    Ping,
    Ack,
    Follow,
    Unfollow,
    Like,
    Revoke,
    FileOffer,
    FileChunk,
    FileReceived,
    TictactoeInvite,
    TictactoeMove,
    TictactoeResult,
    GroupCreate,
    GroupUpdate,
    GroupMessage,
    Hello,
}

impl MessageType {
    pub const ALL: [MessageType; 19] = [
        MessageType::Profile,
        MessageType::Post,
        MessageType::Dm,
        MessageType::Ping,
        MessageType::Ack,
        MessageType::Follow,
        MessageType::Unfollow,
        MessageType::Like,
        MessageType::Revoke,
        MessageType::FileOffer,
        MessageType::FileChunk,
        MessageType::FileReceived,
        MessageType::TictactoeInvite,
        MessageType::TictactoeMove,
        MessageType::TictactoeResult,
        MessageType::GroupCreate,
        MessageType::GroupUpdate,
        MessageType::GroupMessage,
        MessageType::Hello,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            MessageType::Profile => "PROFILE",
            MessageType::Post => "POST",
            MessageType::Dm => "DM",
            MessageType::Ping => "PING",
            MessageType::Ack => "ACK",
            MessageType::Follow => "FOLLOW",
            MessageType::Unfollow => "UNFOLLOW",
            MessageType::Like => "LIKE",
            MessageType::Revoke => "REVOKE",
            MessageType::FileOffer => "FILE_OFFER",
            MessageType::FileChunk => "FILE_CHUNK",
            MessageType::FileReceived => "FILE_RECEIVED",
            MessageType::TictactoeInvite => "TICTACTOE_INVITE",
            MessageType::TictactoeMove => "TICTACTOE_MOVE",
            MessageType::TictactoeResult => "TICTACTOE_RESULT",
            MessageType::GroupCreate => "GROUP_CREATE",
            MessageType::GroupUpdate => "GROUP_UPDATE",
            MessageType::GroupMessage => "GROUP_MESSAGE",
            MessageType::Hello => "HELLO",
        }
    }

    /// Scope an inbound token must carry. `None` means no token is checked.
    pub fn required_scope(self) -> Option<Scope> {
        match self {
            MessageType::Profile
            | MessageType::Ping
            | MessageType::Ack
            | MessageType::Hello
            | MessageType::Revoke => None,
            MessageType::Post | MessageType::Like => Some(Scope::Broadcast),
            MessageType::Dm => Some(Scope::Chat),
            MessageType::Follow | MessageType::Unfollow => Some(Scope::Follow),
            MessageType::FileOffer | MessageType::FileChunk | MessageType::FileReceived => {
                Some(Scope::File)
            }
            MessageType::TictactoeInvite
            | MessageType::TictactoeMove
            | MessageType::TictactoeResult => Some(Scope::Game),
            MessageType::GroupCreate | MessageType::GroupUpdate | MessageType::GroupMessage => {
                Some(Scope::Group)
            }
        }
    }

    /// Whether a successfully handled message of this type is answered with an ACK.
    pub fn requires_ack(self) -> bool {
        !matches!(
            self,
            MessageType::Profile
                | MessageType::Post
                | MessageType::Ping
                | MessageType::Ack
                | MessageType::Hello
                | MessageType::Revoke
        )
    }
}

impl fmt::Display for MessageType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("unknown message type {0:?}")]
pub struct UnknownMessageType(pub String);

impl FromStr for MessageType {
    type Err = UnknownMessageType;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        MessageType::ALL
            .into_iter()
            .find(|t| t.as_str() == s)
            .ok_or_else(|| UnknownMessageType(s.to_string()))
    }
}

/// Typed view over the message kinds the engine and its collaborators inspect most.
#[derive(Debug, Clone, PartialEq)]
pub enum TypedMessage {
    Profile(Profile),
    Post(Post),
    Dm(DirectMessage),
    Ping { user_id: String },
    Ack(Ack),
    Follow(FollowChange),
    Unfollow(FollowChange),
    Like(Like),
    Revoke { token: String },
    Hello {
        user_id: Option<String>,
        listen_port: Option<u16>,
    },
    /// Any other TYPE, including ones this build has never heard of.
    Other {
        kind: Option<MessageType>,
        message: Message,
    },
}

#[derive(Debug, Clone, PartialEq)]
pub struct Profile {
    pub user_id: String,
    pub display_name: String,
    pub status: String,
    pub avatar_type: Option<String>,
    pub avatar_data: Option<String>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Post {
    pub user_id: String,
    pub content: String,
    pub ttl: Option<u64>,
    pub message_id: Option<String>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct DirectMessage {
    pub from: String,
    pub to: String,
    pub content: String,
    pub message_id: Option<String>,
    pub timestamp: Option<u64>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Ack {
    pub message_id: String,
    pub status: Option<String>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct FollowChange {
    pub from: String,
    pub to: String,
    pub message_id: Option<String>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Like {
    pub from: String,
    pub to: String,
    pub post_timestamp: u64,
    /// `LIKE` or `UNLIKE`.
    pub action: String,
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TypedParseError {
    #[error("message has no TYPE")]
    MissingType,
    #[error("{kind} message missing field {field}")]
    MissingField {
        kind: MessageType,
        field: &'static str,
    },
}

impl TypedMessage {
    pub fn parse(message: &Message) -> Result<Self, TypedParseError> {
        let type_name = message.type_name().ok_or(TypedParseError::MissingType)?;
        let Ok(kind) = type_name.parse::<MessageType>() else {
            return Ok(TypedMessage::Other {
                kind: None,
                message: message.clone(),
            });
        };
        let field = |key: &'static str| {
            message
                .get_text(key)
                .ok_or(TypedParseError::MissingField { kind, field: key })
        };
        let typed = match kind {
            MessageType::Profile => TypedMessage::Profile(Profile {
                user_id: field(keys::USER_ID)?,
                display_name: field(keys::DISPLAY_NAME)?,
                status: message.get_text(keys::STATUS).unwrap_or_default(),
                avatar_type: message.get_text(keys::AVATAR_TYPE),
                avatar_data: message.get_text(keys::AVATAR_DATA),
            }),
            MessageType::Post => TypedMessage::Post(Post {
                user_id: field(keys::USER_ID)?,
                content: field(keys::CONTENT)?,
                ttl: message.get_u64(keys::TTL),
                message_id: message.message_id(),
            }),
            MessageType::Dm => TypedMessage::Dm(DirectMessage {
                from: field(keys::FROM)?,
                to: field(keys::TO)?,
                content: field(keys::CONTENT)?,
                message_id: message.message_id(),
                timestamp: message.get_u64(keys::TIMESTAMP),
            }),
            MessageType::Ping => TypedMessage::Ping {
                user_id: field(keys::USER_ID)?,
            },
            MessageType::Ack => TypedMessage::Ack(Ack {
                message_id: field(keys::ACK_MESSAGE_ID)?,
                status: message.get_text(keys::STATUS),
            }),
            MessageType::Follow | MessageType::Unfollow => {
                let change = FollowChange {
                    from: field(keys::FROM)?,
                    to: field(keys::TO)?,
                    message_id: message.message_id(),
                };
                if kind == MessageType::Follow {
                    TypedMessage::Follow(change)
                } else {
                    TypedMessage::Unfollow(change)
                }
            }
            MessageType::Like => TypedMessage::Like(Like {
                from: field(keys::FROM)?,
                to: field(keys::TO)?,
                post_timestamp: message.get_u64(keys::POST_TIMESTAMP).ok_or(
                    TypedParseError::MissingField {
                        kind,
                        field: keys::POST_TIMESTAMP,
                    },
                )?,
                action: message
                    .get_text(keys::ACTION)
                    .unwrap_or_else(|| "LIKE".to_string()),
            }),
            MessageType::Revoke => TypedMessage::Revoke {
                token: field(keys::TOKEN)?,
            },
            MessageType::Hello => TypedMessage::Hello {
                user_id: message.sender(),
                listen_port: message.listen_port(),
            },
            other => TypedMessage::Other {
                kind: Some(other),
                message: message.clone(),
            },
        };
        Ok(typed)
    }
}
