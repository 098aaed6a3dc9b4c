//! `optrack` core: timestamps, message kinds, peer roles, and the structured
//! formatter used by diagnostic dumps.

pub mod format;
pub mod message;
pub mod peer;
pub mod stamp;

pub use format::{FieldValue, FormatError, Formatter, JsonFormatter};
pub use message::{
    AuthRequest, Command, CommandReply, Envelope, Message, MessageKind, Ping, Pong, Subscribe,
};
pub use peer::{PeerRoles, Principal};
pub use stamp::{ClockSource, ManualClock, Stamp, SystemClock};
