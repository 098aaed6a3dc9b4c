//! Transport-side collaborators: connections, sessions, and inbound requests.

pub mod config;
pub mod connection;
pub mod request;
pub mod session;

pub use config::ConnectionConfig;
pub use connection::{
    ConnectionHandle, ConnectionId, ConnectionRegistry, OutboundMessage, SendError,
};
pub use request::Request;
pub use session::{Session, SessionAuth, SessionId};
