//! Inbound request payloads as delivered by the transport.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use optrack_core::{Envelope, Message, MessageKind};

use super::connection::ConnectionHandle;

/// A decoded inbound message together with its transport envelope.
///
/// Shared as `Arc<Request>`: the transport keeps one reference while it
/// finishes reading, and every [`OperationTracker`](crate::tracker::OperationTracker)
/// wrapping the request holds another for its whole lifetime. At most one
/// tracker wraps a request at a time.
#[derive(Debug)]
pub struct Request {
    envelope: Envelope,
    message: Message,
    connection: Option<Arc<ConnectionHandle>>,
    tracked: AtomicBool,
}

impl Request {
    #[must_use]
    pub fn new(
        envelope: Envelope,
        message: Message,
        connection: Option<Arc<ConnectionHandle>>,
    ) -> Self {
        Self {
            envelope,
            message,
            connection,
            tracked: AtomicBool::new(false),
        }
    }

    #[must_use]
    pub fn envelope(&self) -> &Envelope {
        &self.envelope
    }

    #[must_use]
    pub fn message(&self) -> &Message {
        &self.message
    }

    /// Checked view of the message payload as kind `T`.
    #[must_use]
    pub fn payload<T: MessageKind>(&self) -> Option<&T> {
        self.message.as_kind::<T>()
    }

    /// The connection the request arrived on. Locally generated requests
    /// have none.
    #[must_use]
    pub fn connection(&self) -> Option<&Arc<ConnectionHandle>> {
        self.connection.as_ref()
    }

    /// `true` while an operation tracker wraps this request.
    #[must_use]
    pub fn is_tracked(&self) -> bool {
        self.tracked.load(Ordering::Acquire)
    }

    /// Marks the request as tracked. Returns `false` if it already was.
    pub(crate) fn claim_tracking(&self) -> bool {
        self.tracked
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    pub(crate) fn release_tracking(&self) {
        self.tracked.store(false, Ordering::Release);
    }
}
