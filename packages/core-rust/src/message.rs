//! Inbound and outbound message kinds.
//!
//! [`Message`] is a closed sum type over the payload kinds the service
//! understands. Callers that need a concrete payload ask for it through
//! [`Message::as_kind`], which returns `None` when the stored kind differs
//! instead of reinterpreting the value.
//!
//! Messages are internally tagged by `type` and encoded as named `MsgPack`
//! maps (`rmp_serde::to_vec_named`) with camelCase field names.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::stamp::Stamp;

// ---------------------------------------------------------------------------
// Envelope
// ---------------------------------------------------------------------------

/// Stage timestamps recorded by the transport layer while a message was read.
///
/// Any stamp may be [`Stamp::UNSET`] when the transport skipped that stage.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Envelope {
    /// First byte of the header arrived.
    pub recv_stamp: Stamp,
    /// The message cleared the receive throttle.
    pub throttle_stamp: Stamp,
    /// The whole message body was read.
    pub recv_complete_stamp: Stamp,
    /// The message was handed to the dispatcher.
    pub dispatch_stamp: Stamp,
}

// ---------------------------------------------------------------------------
// Payloads
// ---------------------------------------------------------------------------

/// Authentication handshake. Arrives before any session exists.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AuthRequest {
    pub principal_id: String,
    pub token: String,
}

/// Liveness probe.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Ping {
    pub seq: u64,
}

/// Answer to a [`Ping`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Pong {
    pub seq: u64,
}

/// Administrative or data command.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Command {
    /// Command name, e.g. `"status"`.
    pub prefix: String,
    #[serde(default)]
    pub args: Vec<String>,
}

/// Result of a [`Command`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CommandReply {
    /// Zero on success, a negative errno-style code otherwise.
    pub code: i32,
    pub status: String,
    #[serde(default)]
    pub output: String,
}

/// Subscription to a map or log stream, starting at a version.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Subscribe {
    pub what: String,
    pub start: u64,
    #[serde(default)]
    pub one_shot: bool,
}

// ---------------------------------------------------------------------------
// Message
// ---------------------------------------------------------------------------

/// Every message kind the service sends or receives.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum Message {
    #[serde(rename = "AUTH")]
    Auth(AuthRequest),
    #[serde(rename = "PING")]
    Ping(Ping),
    #[serde(rename = "PONG")]
    Pong(Pong),
    #[serde(rename = "COMMAND")]
    Command(Command),
    #[serde(rename = "COMMAND_REPLY")]
    CommandReply(CommandReply),
    #[serde(rename = "SUBSCRIBE")]
    Subscribe(Subscribe),
}

impl Message {
    /// Wire discriminator of this message.
    #[must_use]
    pub fn kind_name(&self) -> &'static str {
        match self {
            Message::Auth(_) => AuthRequest::KIND,
            Message::Ping(_) => Ping::KIND,
            Message::Pong(_) => Pong::KIND,
            Message::Command(_) => Command::KIND,
            Message::CommandReply(_) => CommandReply::KIND,
            Message::Subscribe(_) => Subscribe::KIND,
        }
    }

    /// Checked view of the payload as kind `T`.
    ///
    /// Returns `None` when the message holds a different kind.
    #[must_use]
    pub fn as_kind<T: MessageKind>(&self) -> Option<&T> {
        T::from_message(self)
    }

    /// Encodes as a named `MsgPack` map.
    ///
    /// # Errors
    ///
    /// Returns an error if serialization fails.
    pub fn encode(&self) -> Result<Vec<u8>, rmp_serde::encode::Error> {
        rmp_serde::to_vec_named(self)
    }

    /// Decodes a message produced by [`Message::encode`].
    ///
    /// # Errors
    ///
    /// Returns an error if the bytes are not a valid message map.
    pub fn decode(bytes: &[u8]) -> Result<Self, rmp_serde::decode::Error> {
        rmp_serde::from_slice(bytes)
    }
}

/// One-line descriptor used in diagnostics.
impl fmt::Display for Message {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Message::Auth(m) => write!(f, "auth(principal={})", m.principal_id),
            Message::Ping(m) => write!(f, "ping(seq={})", m.seq),
            Message::Pong(m) => write!(f, "pong(seq={})", m.seq),
            Message::Command(m) => {
                write!(f, "command({}", m.prefix)?;
                for arg in &m.args {
                    write!(f, " {arg}")?;
                }
                f.write_str(")")
            }
            Message::CommandReply(m) => {
                write!(f, "command_reply(code={} status={})", m.code, m.status)
            }
            Message::Subscribe(m) => {
                write!(f, "subscribe({} start={}", m.what, m.start)?;
                if m.one_shot {
                    f.write_str(" onetime")?;
                }
                f.write_str(")")
            }
        }
    }
}

// ---------------------------------------------------------------------------
// MessageKind
// ---------------------------------------------------------------------------

/// A concrete payload type that can be viewed out of a [`Message`].
pub trait MessageKind: Sized {
    /// Wire discriminator for this kind.
    const KIND: &'static str;

    /// Returns the payload if `msg` holds this kind.
    fn from_message(msg: &Message) -> Option<&Self>;
}

macro_rules! message_kinds {
    ($($variant:ident => $ty:ty, $kind:literal;)*) => {
        $(
            impl MessageKind for $ty {
                const KIND: &'static str = $kind;

                fn from_message(msg: &Message) -> Option<&Self> {
                    match msg {
                        Message::$variant(inner) => Some(inner),
                        _ => None,
                    }
                }
            }

            impl From<$ty> for Message {
                fn from(inner: $ty) -> Self {
                    Message::$variant(inner)
                }
            }
        )*
    };
}

message_kinds! {
    Auth => AuthRequest, "AUTH";
    Ping => Ping, "PING";
    Pong => Pong, "PONG";
    Command => Command, "COMMAND";
    CommandReply => CommandReply, "COMMAND_REPLY";
    Subscribe => Subscribe, "SUBSCRIBE";
}
