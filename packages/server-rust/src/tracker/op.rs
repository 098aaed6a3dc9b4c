//! A single tracked operation.
//!
//! An [`OperationTracker`] wraps one inbound [`Request`] for as long as any
//! worker still holds it. It pins the request, the connection it arrived on
//! and the session attached to that connection, and records the stages the
//! request passes through on a timeline owned by the [`TrackingRegistry`].
//!
//! Trackers are shared as `Arc<OperationTracker>`. Dropping the last `Arc`
//! retires the operation from the registry and releases the request and
//! session references.
//!
//! [`TrackingRegistry`]: super::TrackingRegistry

use std::borrow::Cow;
use std::fmt;
use std::sync::{Arc, OnceLock};

use optrack_core::{FormatError, Formatter, Message, MessageKind, Stamp};
use parking_lot::Mutex;

use super::error::{ReplyError, TrackError};
use super::registry::{RegistryInner, TrackerId};
use super::timeline::{dump_events, labels, TimelineEvent};
use crate::network::{ConnectionHandle, OutboundMessage, Request, SendError, Session};

/// One admitted request and the timeline of its processing stages.
pub struct OperationTracker {
    id: TrackerId,
    registry: Arc<RegistryInner>,
    request: Arc<Request>,
    connection: Option<Arc<ConnectionHandle>>,
    /// Guarded so late installs cannot race each other or a reader.
    session: Mutex<Option<Arc<Session>>>,
    initiated_at: Stamp,
    dequeued_at: OnceLock<Stamp>,
    from_peer_service: OnceLock<bool>,
}

impl OperationTracker {
    /// Admits `request` into `registry` and records the four transport
    /// stages from its envelope, in order, unset stamps included.
    ///
    /// Fails without touching any refcount if another live tracker already
    /// wraps `request` or the registry is shut down.
    pub(super) fn from_request(
        request: Arc<Request>,
        registry: &Arc<RegistryInner>,
    ) -> Result<Self, TrackError> {
        let envelope = *request.envelope();
        let initiated_at = if envelope.recv_stamp.is_unset() {
            registry.now()
        } else {
            envelope.recv_stamp
        };
        if !request.claim_tracking() {
            return Err(TrackError::AlreadyTracked);
        }
        let id = match registry.acquire_slot(request.message().to_string(), initiated_at) {
            Ok(id) => id,
            Err(e) => {
                request.release_tracking();
                return Err(e);
            }
        };

        // Auth handshakes and locally generated requests have no session.
        let connection = request.connection().cloned();
        let session = connection.as_ref().and_then(|c| c.attached_session());

        for (label, stamp) in [
            (labels::HEADER_READ, envelope.recv_stamp),
            (labels::THROTTLED, envelope.throttle_stamp),
            (labels::ALL_READ, envelope.recv_complete_stamp),
            (labels::DISPATCHED, envelope.dispatch_stamp),
        ] {
            registry.mark_event(id, Cow::Borrowed(label), stamp);
        }

        Ok(Self {
            id,
            registry: Arc::clone(registry),
            request,
            connection,
            session: Mutex::new(session),
            initiated_at,
            dequeued_at: OnceLock::new(),
            from_peer_service: OnceLock::new(),
        })
    }

    #[must_use]
    pub fn id(&self) -> TrackerId {
        self.id
    }

    /// Receive stamp of the request, or admission time if the transport
    /// left it unset.
    #[must_use]
    pub fn initiated_at(&self) -> Stamp {
        self.initiated_at
    }

    /// The wrapped request.
    #[must_use]
    pub fn payload(&self) -> &Arc<Request> {
        &self.request
    }

    #[must_use]
    pub fn message(&self) -> &Message {
        self.request.message()
    }

    /// The request payload as kind `T`, or `None` if it is another kind.
    #[must_use]
    pub fn as_kind<T: MessageKind>(&self) -> Option<&T> {
        self.request.payload::<T>()
    }

    #[must_use]
    pub fn connection(&self) -> Option<&Arc<ConnectionHandle>> {
        self.connection.as_ref()
    }

    // -- session ------------------------------------------------------------

    /// A new shared reference to the current session, if any.
    ///
    /// The returned `Arc` is independent of the tracker and may outlive it.
    #[must_use]
    pub fn session_ref(&self) -> Option<Arc<Session>> {
        self.session.lock().clone()
    }

    /// Installs a fresh reference to `session`. The previously held
    /// reference, if any, is released.
    pub fn set_session(&self, session: &Arc<Session>) {
        let previous = self.session.lock().replace(Arc::clone(session));
        drop(previous);
    }

    /// Clears the session slot without releasing the reference it held.
    ///
    /// Ownership of that reference passes to the caller, who decides when
    /// it is released. Use [`OperationTracker::clear_session`] to clear and
    /// release in one step.
    #[must_use = "the returned session reference is released when dropped"]
    pub fn take_session(&self) -> Option<Arc<Session>> {
        self.session.lock().take()
    }

    /// Clears the session slot and releases the reference it held.
    pub fn clear_session(&self) {
        let previous = self.session.lock().take();
        drop(previous);
    }

    // -- peer classification ------------------------------------------------

    /// `true` if the request arrived on a connection whose peer declared the
    /// internal-peer role.
    #[must_use]
    pub fn is_from_peer_service(&self) -> bool {
        self.connection
            .as_ref()
            .is_some_and(|c| c.peer_roles().is_internal_peer())
    }

    /// Records the dispatcher's own classification. Only the first call has
    /// any effect; returns whether this call was the one applied.
    pub fn set_from_peer_service(&self, from_peer: bool) -> bool {
        self.from_peer_service.set(from_peer).is_ok()
    }

    /// The dispatcher's classification, `false` until set.
    #[must_use]
    pub fn declared_from_peer_service(&self) -> bool {
        self.from_peer_service.get().copied().unwrap_or(false)
    }

    // -- timeline -----------------------------------------------------------

    /// Records that the request left its queue at `stamp`. Only the first
    /// call is recorded; returns whether this call was the one applied.
    pub fn mark_dequeued(&self, stamp: Stamp) -> bool {
        if self.dequeued_at.set(stamp).is_err() {
            return false;
        }
        self.mark_event_at(labels::DEQUEUED, stamp);
        true
    }

    #[must_use]
    pub fn dequeued_at(&self) -> Option<Stamp> {
        self.dequeued_at.get().copied()
    }

    /// Appends `label` stamped with the registry clock's current time.
    pub fn mark_event(&self, label: impl Into<Cow<'static, str>>) {
        let now = self.registry.now();
        self.registry.mark_event(self.id, label.into(), now);
    }

    pub fn mark_event_at(&self, label: impl Into<Cow<'static, str>>, stamp: Stamp) {
        self.registry.mark_event(self.id, label.into(), stamp);
    }

    /// Copy of the timeline in append order.
    #[must_use]
    pub fn timeline(&self) -> Vec<TimelineEvent> {
        self.registry.with_timeline(self.id, |events| events.to_vec())
    }

    /// Renders the timeline as an `events` array of `{time, event}` objects.
    ///
    /// The registry's shard lock is held only while the events are written
    /// and is released even if `f` fails. `_now` is accepted so every kind of
    /// tracked op can be dumped through the same call; this dump does not
    /// compute ages from it.
    ///
    /// # Errors
    ///
    /// Propagates the first error raised by `f`.
    pub fn dump(&self, _now: Stamp, f: &mut dyn Formatter) -> Result<(), FormatError> {
        f.open_array_section("events")?;
        self.registry
            .with_timeline(self.id, |events| dump_events(events, f))?;
        f.close_section()
    }

    // -- reply --------------------------------------------------------------

    /// Encodes `reply` and queues it on the request's connection without
    /// waiting for the write loop.
    ///
    /// # Errors
    ///
    /// Returns [`ReplyError::NoConnection`] for requests without a
    /// connection, [`ReplyError::Backpressure`] if the outbound queue is full
    /// and [`ReplyError::Disconnected`] if the connection has closed.
    pub fn reply(&self, reply: &Message) -> Result<(), ReplyError> {
        let Some(connection) = &self.connection else {
            tracing::debug!(op = self.id.0, reply = %reply, "reply dropped: no connection");
            return Err(ReplyError::NoConnection);
        };
        let bytes = reply.encode()?;
        connection
            .try_send(OutboundMessage::Binary(bytes))
            .map_err(|e| match e {
                SendError::Full | SendError::Timeout => ReplyError::Backpressure,
                SendError::Disconnected => ReplyError::Disconnected,
            })?;
        self.mark_event(labels::REPLY_SENT);
        Ok(())
    }
}

impl Drop for OperationTracker {
    fn drop(&mut self) {
        self.registry.retire(self.id);
        self.request.release_tracking();
    }
}

impl fmt::Debug for OperationTracker {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("OperationTracker")
            .field("id", &self.id)
            .field("message", self.request.message())
            .field("initiated_at", &self.initiated_at)
            .field("connection", &self.connection.as_ref().map(|c| c.id))
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::thread;

    use optrack_core::{
        AuthRequest, Command, CommandReply, Envelope, JsonFormatter, ManualClock, Message, PeerRoles,
        Ping, Pong,
    };
    use proptest::prelude::*;
    use serde_json::json;

    use super::*;
    use crate::network::{ConnectionConfig, ConnectionId};
    use crate::tracker::{TrackerConfig, TrackingRegistry};

    const T0: u64 = 1_700_000_000_000;

    fn registry() -> TrackingRegistry {
        let clock = Arc::new(ManualClock::new(Stamp::from_millis(T0 + 10_000)));
        TrackingRegistry::with_clock(TrackerConfig::default(), clock)
    }

    fn session() -> Arc<Session> {
        Arc::new(Session::new(None, Stamp::from_millis(T0)))
    }

    fn connection(roles: PeerRoles) -> (Arc<ConnectionHandle>, tokio::sync::mpsc::Receiver<OutboundMessage>) {
        let config = ConnectionConfig {
            outbound_channel_capacity: 1,
            ..ConnectionConfig::default()
        };
        let (handle, rx) = ConnectionHandle::new(ConnectionId(1), roles, &config);
        (Arc::new(handle), rx)
    }

    fn ping_request(connection: Option<Arc<ConnectionHandle>>) -> Arc<Request> {
        let envelope = Envelope {
            recv_stamp: Stamp::from_millis(T0),
            ..Envelope::default()
        };
        Arc::new(Request::new(envelope, Message::Ping(Ping { seq: 1 }), connection))
    }

    /// Formatter that fails on the `n`th field it is asked to write.
    struct FailingFormatter {
        remaining: usize,
    }

    impl Formatter for FailingFormatter {
        fn open_array_section(&mut self, _name: &str) -> Result<(), FormatError> {
            Ok(())
        }

        fn open_object_section(&mut self, _name: &str) -> Result<(), FormatError> {
            Ok(())
        }

        fn dump_field(&mut self, _key: &str, _value: optrack_core::FieldValue) -> Result<(), FormatError> {
            if self.remaining == 0 {
                return Err(FormatError::Sink("disk full".into()));
            }
            self.remaining -= 1;
            Ok(())
        }

        fn close_section(&mut self) -> Result<(), FormatError> {
            Ok(())
        }
    }

    // -- construction -------------------------------------------------------

    #[test]
    fn bootstrap_events_use_envelope_stamps_in_order() {
        let registry = registry();
        let envelope = Envelope {
            recv_stamp: Stamp::from_millis(T0),
            throttle_stamp: Stamp::UNSET,
            recv_complete_stamp: Stamp::UNSET,
            dispatch_stamp: Stamp::from_millis(T0 + 3),
        };
        let request = Arc::new(Request::new(envelope, Message::Ping(Ping { seq: 1 }), None));
        let op = registry.create_request(request).unwrap();

        assert_eq!(
            op.timeline(),
            vec![
                TimelineEvent::new(Stamp::from_millis(T0), labels::HEADER_READ),
                TimelineEvent::new(Stamp::UNSET, labels::THROTTLED),
                TimelineEvent::new(Stamp::UNSET, labels::ALL_READ),
                TimelineEvent::new(Stamp::from_millis(T0 + 3), labels::DISPATCHED),
            ]
        );
        assert_eq!(op.initiated_at(), Stamp::from_millis(T0));
    }

    #[test]
    fn unset_receive_stamp_initiates_at_admission() {
        let registry = registry();
        let request = Arc::new(Request::new(
            Envelope::default(),
            Message::Ping(Ping { seq: 1 }),
            None,
        ));
        let op = registry.create_request(request).unwrap();

        assert_eq!(op.initiated_at(), registry.now());
        assert!(op.timeline().iter().all(|e| e.stamp.is_unset()));
    }

    #[test]
    fn payload_refcount_up_on_create_down_on_drop() {
        let registry = registry();
        let request = ping_request(None);
        assert_eq!(Arc::strong_count(&request), 1);

        let op = registry.create_request(Arc::clone(&request)).unwrap();
        assert_eq!(Arc::strong_count(&request), 2);
        assert!(Arc::ptr_eq(op.payload(), &request));

        drop(op);
        assert_eq!(Arc::strong_count(&request), 1);
    }

    #[test]
    fn rejected_construction_leaks_nothing() {
        let registry = registry();
        let (conn, _rx) = connection(PeerRoles::CLIENT);
        let session = session();
        conn.attach_session(Arc::clone(&session));
        let request = ping_request(Some(Arc::clone(&conn)));
        let (req_before, conn_before, session_before) = (
            Arc::strong_count(&request),
            Arc::strong_count(&conn),
            Arc::strong_count(&session),
        );

        registry.shutdown();
        assert!(registry.create_request(Arc::clone(&request)).is_err());

        assert_eq!(Arc::strong_count(&request), req_before);
        assert_eq!(Arc::strong_count(&conn), conn_before);
        assert_eq!(Arc::strong_count(&session), session_before);
        assert_eq!(registry.in_flight_count(), 0);
    }

    #[test]
    fn request_is_wrapped_by_one_tracker_at_a_time() {
        let registry = registry();
        let request = ping_request(None);

        let first = registry.create_request(Arc::clone(&request)).unwrap();
        assert!(request.is_tracked());
        let refs = Arc::strong_count(&request);

        assert_eq!(
            registry.create_request(Arc::clone(&request)).unwrap_err(),
            TrackError::AlreadyTracked
        );
        assert_eq!(Arc::strong_count(&request), refs);
        assert_eq!(registry.in_flight_count(), 1);
        assert_eq!(first.timeline().len(), 4);

        drop(first);
        assert!(!request.is_tracked());
        let second = registry.create_request(Arc::clone(&request)).unwrap();
        assert_eq!(registry.in_flight_count(), 1);
        assert_eq!(second.timeline().len(), 4);
    }

    #[test]
    fn shutdown_rejection_leaves_request_claimable() {
        let registry = registry();
        let request = ping_request(None);
        registry.shutdown();

        assert_eq!(
            registry.create_request(Arc::clone(&request)).unwrap_err(),
            TrackError::Closed
        );
        assert!(!request.is_tracked());
    }

    #[test]
    fn no_connection_means_no_session_and_not_peer() {
        let registry = registry();
        let op = registry.create_request(ping_request(None)).unwrap();

        assert!(op.connection().is_none());
        assert!(!op.is_from_peer_service());
        assert!(op.session_ref().is_none());
    }

    #[test]
    fn connection_without_session_is_not_an_error() {
        let registry = registry();
        let (conn, _rx) = connection(PeerRoles::CLIENT);
        let request = Arc::new(Request::new(
            Envelope::default(),
            Message::Auth(AuthRequest {
                principal_id: "client.admin".into(),
                token: "secret".into(),
            }),
            Some(conn),
        ));
        let op = registry.create_request(request).unwrap();

        assert!(op.connection().is_some());
        assert!(op.session_ref().is_none());
    }

    #[test]
    fn initial_session_comes_from_connection() {
        let registry = registry();
        let (conn, _rx) = connection(PeerRoles::CLIENT);
        let session = session();
        conn.attach_session(Arc::clone(&session));

        let op = registry.create_request(ping_request(Some(Arc::clone(&conn)))).unwrap();
        // Test, connection slot, tracker.
        assert_eq!(Arc::strong_count(&session), 3);
        assert!(Arc::ptr_eq(&op.session_ref().unwrap(), &session));

        drop(op);
        assert_eq!(Arc::strong_count(&session), 2);
        assert!(conn.attached_session().is_some());
    }

    // -- typed access -------------------------------------------------------

    #[test]
    fn as_kind_is_checked() {
        let registry = registry();
        let op = registry.create_request(ping_request(None)).unwrap();

        assert_eq!(op.as_kind::<Ping>(), Some(&Ping { seq: 1 }));
        assert!(op.as_kind::<Command>().is_none());
        assert!(op.as_kind::<Pong>().is_none());
    }

    // -- session ------------------------------------------------------------

    #[test]
    fn session_ref_hands_out_independent_references() {
        let registry = registry();
        let op = registry.create_request(ping_request(None)).unwrap();
        let session = session();
        op.set_session(&session);
        assert_eq!(Arc::strong_count(&session), 2);

        let a = op.session_ref().unwrap();
        let b = op.session_ref().unwrap();
        assert_eq!(Arc::strong_count(&session), 4);

        // References handed out survive the tracker.
        drop(op);
        assert_eq!(Arc::strong_count(&session), 3);
        drop((a, b));
        assert_eq!(Arc::strong_count(&session), 1);
    }

    #[test]
    fn replacing_session_releases_previous_immediately() {
        let registry = registry();
        let op = registry.create_request(ping_request(None)).unwrap();
        let a = session();
        let b = session();

        op.set_session(&a);
        assert_eq!(Arc::strong_count(&a), 2);

        op.set_session(&b);
        assert_eq!(Arc::strong_count(&a), 1);
        assert_eq!(Arc::strong_count(&b), 2);

        drop(op);
        assert_eq!(Arc::strong_count(&b), 1);
    }

    #[test]
    fn take_session_clears_without_releasing() {
        let registry = registry();
        let op = registry.create_request(ping_request(None)).unwrap();
        let a = session();
        op.set_session(&a);

        let taken = op.take_session();
        assert!(op.session_ref().is_none());
        // The tracker let go of the slot but the reference was not released:
        // it now belongs to the caller.
        assert_eq!(Arc::strong_count(&a), 2);
        assert!(Arc::ptr_eq(taken.as_ref().unwrap(), &a));

        drop(op);
        assert_eq!(Arc::strong_count(&a), 2);
        drop(taken);
        assert_eq!(Arc::strong_count(&a), 1);
    }

    #[test]
    fn clear_session_releases() {
        let registry = registry();
        let op = registry.create_request(ping_request(None)).unwrap();
        let a = session();
        op.set_session(&a);

        op.clear_session();
        assert!(op.session_ref().is_none());
        assert_eq!(Arc::strong_count(&a), 1);

        // Clearing an empty slot is a no-op.
        op.clear_session();
        assert!(op.take_session().is_none());
    }

    #[derive(Debug, Clone)]
    enum SessionStep {
        Install(usize),
        Clear,
    }

    fn session_step() -> impl Strategy<Value = SessionStep> {
        prop_oneof![
            (0usize..3).prop_map(SessionStep::Install),
            Just(SessionStep::Clear),
        ]
    }

    proptest! {
        #[test]
        fn session_installs_track_last_and_balance_refcounts(
            steps in proptest::collection::vec(session_step(), 0..24)
        ) {
            let registry = registry();
            let op = registry.create_request(ping_request(None)).unwrap();
            let sessions = [session(), session(), session()];
            let mut expected: Option<usize> = None;

            for step in &steps {
                match step {
                    SessionStep::Install(i) => {
                        op.set_session(&sessions[*i]);
                        expected = Some(*i);
                    }
                    SessionStep::Clear => {
                        op.clear_session();
                        expected = None;
                    }
                }
                for (i, s) in sessions.iter().enumerate() {
                    let held = usize::from(expected == Some(i));
                    prop_assert_eq!(Arc::strong_count(s), 1 + held);
                }
            }

            match (op.session_ref(), expected) {
                (Some(current), Some(i)) => prop_assert!(Arc::ptr_eq(&current, &sessions[i])),
                (None, None) => {}
                (got, want) => prop_assert!(false, "session {:?} != expected {:?}", got.map(|s| s.id), want),
            }

            drop(op);
            for s in &sessions {
                prop_assert_eq!(Arc::strong_count(s), 1);
            }
        }
    }

    #[test]
    fn concurrent_set_session_keeps_counts_consistent() {
        let registry = registry();
        let op = registry.create_request(ping_request(None)).unwrap();
        let sessions: Vec<_> = (0..4).map(|_| session()).collect();

        thread::scope(|scope| {
            for s in &sessions {
                let op = &op;
                scope.spawn(move || {
                    for _ in 0..200 {
                        op.set_session(s);
                    }
                });
            }
        });

        let held: usize = sessions.iter().map(|s| Arc::strong_count(s) - 1).sum();
        assert_eq!(held, 1);
        drop(op);
        assert!(sessions.iter().all(|s| Arc::strong_count(s) == 1));
    }

    // -- peer classification ------------------------------------------------

    #[test]
    fn internal_peer_connection_is_peer_service() {
        let registry = registry();
        let (mon, _rx1) = connection(PeerRoles::MONITOR | PeerRoles::MANAGER);
        let (client, _rx2) = connection(PeerRoles::CLIENT);

        let from_mon = registry.create_request(ping_request(Some(mon))).unwrap();
        let from_client = registry.create_request(ping_request(Some(client))).unwrap();

        assert!(from_mon.is_from_peer_service());
        assert!(!from_client.is_from_peer_service());
    }

    #[test]
    fn declared_peer_flag_is_set_once() {
        let registry = registry();
        let op = registry.create_request(ping_request(None)).unwrap();
        assert!(!op.declared_from_peer_service());

        assert!(op.set_from_peer_service(true));
        assert!(!op.set_from_peer_service(false));
        assert!(op.declared_from_peer_service());
    }

    // -- timeline -----------------------------------------------------------

    #[test]
    fn mark_dequeued_records_once() {
        let registry = registry();
        let op = registry.create_request(ping_request(None)).unwrap();
        assert!(op.dequeued_at().is_none());

        assert!(op.mark_dequeued(Stamp::from_millis(T0 + 5)));
        assert!(!op.mark_dequeued(Stamp::from_millis(T0 + 9)));

        assert_eq!(op.dequeued_at(), Some(Stamp::from_millis(T0 + 5)));
        let timeline = op.timeline();
        assert_eq!(timeline.len(), 5);
        assert_eq!(timeline[4], TimelineEvent::new(Stamp::from_millis(T0 + 5), labels::DEQUEUED));
    }

    #[test]
    fn mark_event_uses_registry_clock() {
        let registry = registry();
        let op = registry.create_request(ping_request(None)).unwrap();
        op.mark_event("waiting_for_paxos");
        op.mark_event_at(String::from("early"), Stamp::from_millis(1));

        let timeline = op.timeline();
        assert_eq!(timeline[4], TimelineEvent::new(registry.now(), "waiting_for_paxos"));
        // Append order, not stamp order.
        assert_eq!(timeline[5], TimelineEvent::new(Stamp::from_millis(1), "early"));
    }

    #[test]
    fn dump_renders_events_in_append_order() {
        let registry = registry();
        let op = registry.create_request(ping_request(None)).unwrap();
        op.mark_event_at("queued_for_service", Stamp::from_millis(T0 + 1));

        let mut f = JsonFormatter::new();
        op.dump(registry.now(), &mut f).unwrap();
        let value = f.finish().unwrap();

        let unset = Stamp::UNSET.to_string();
        assert_eq!(
            value,
            json!({
                "events": [
                    { "time": Stamp::from_millis(T0).to_string(), "event": "header_read" },
                    { "time": unset, "event": "throttled" },
                    { "time": unset, "event": "all_read" },
                    { "time": unset, "event": "dispatched" },
                    { "time": Stamp::from_millis(T0 + 1).to_string(), "event": "queued_for_service" },
                ]
            })
        );
    }

    #[test]
    fn failing_sink_releases_the_lock() {
        let registry = registry();
        let op = registry.create_request(ping_request(None)).unwrap();

        let mut f = FailingFormatter { remaining: 3 };
        let err = op.dump(registry.now(), &mut f).unwrap_err();
        assert_eq!(err, FormatError::Sink("disk full".into()));

        // Would deadlock if the shard lock were still held.
        op.mark_event("after_failed_dump");
        assert_eq!(op.timeline().len(), 5);
        let mut f = JsonFormatter::new();
        registry.dump_ops_in_flight(registry.now(), &mut f).unwrap();
    }

    #[test]
    fn concurrent_dump_sees_prefixes_of_appends() {
        const APPENDS: usize = 500;
        let registry = registry();
        let op = registry.create_request(ping_request(None)).unwrap();
        let done = AtomicBool::new(false);

        let dumps = thread::scope(|scope| {
            let appender = scope.spawn(|| {
                for i in 0..APPENDS {
                    op.mark_event(format!("step_{i}"));
                }
                done.store(true, Ordering::SeqCst);
            });
            let dumper = scope.spawn(|| {
                let mut dumps = Vec::new();
                while !done.load(Ordering::SeqCst) {
                    let mut f = JsonFormatter::new();
                    op.dump(Stamp::UNSET, &mut f).unwrap();
                    dumps.push(f.finish().unwrap());
                }
                dumps
            });
            appender.join().unwrap();
            dumper.join().unwrap()
        });

        let full: Vec<String> = op.timeline().into_iter().map(|e| e.label.into_owned()).collect();
        assert_eq!(full.len(), 4 + APPENDS);
        for dump in dumps {
            let seen: Vec<&str> = dump["events"]
                .as_array()
                .unwrap()
                .iter()
                .map(|e| e["event"].as_str().unwrap())
                .collect();
            assert!(seen.len() >= 4);
            assert_eq!(seen[..], full[..seen.len()]);
        }
    }

    // -- reply --------------------------------------------------------------

    #[test]
    fn reply_enqueues_encoded_message_and_marks_event() {
        let registry = registry();
        let (conn, mut rx) = connection(PeerRoles::CLIENT);
        let op = registry.create_request(ping_request(Some(conn))).unwrap();

        let pong = Message::Pong(Pong { seq: 1 });
        op.reply(&pong).unwrap();

        match rx.try_recv().unwrap() {
            OutboundMessage::Binary(bytes) => assert_eq!(Message::decode(&bytes).unwrap(), pong),
            OutboundMessage::Close(_) => panic!("expected a binary frame"),
        }
        assert_eq!(op.timeline().last().unwrap().label, labels::REPLY_SENT);
    }

    #[test]
    fn reply_errors() {
        let registry = registry();
        let reply = Message::CommandReply(CommandReply {
            code: 0,
            status: "ok".into(),
            output: String::new(),
        });

        let detached = registry.create_request(ping_request(None)).unwrap();
        assert!(matches!(detached.reply(&reply), Err(ReplyError::NoConnection)));

        let (conn, rx) = connection(PeerRoles::CLIENT);
        let op = registry.create_request(ping_request(Some(conn))).unwrap();
        op.reply(&reply).unwrap();
        // Capacity is one.
        assert!(matches!(op.reply(&reply), Err(ReplyError::Backpressure)));

        drop(rx);
        assert!(matches!(op.reply(&reply), Err(ReplyError::Disconnected)));
        let replies = op
            .timeline()
            .iter()
            .filter(|e| e.label == labels::REPLY_SENT)
            .count();
        assert_eq!(replies, 1);
    }
}
