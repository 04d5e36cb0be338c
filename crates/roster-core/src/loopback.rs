//! In-memory session client.
//!
//! Behaves like a session transport with a single local participant:
//! completions fire inside the call, lifecycle events are emitted on the
//! session, publisher and subscriber buses, and remote activity is simulated
//! explicitly. Failures can be queued per operation.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

use uuid::Uuid;

use crate::client::{Completion, Publisher, Session, SessionClient, Subscriber};
use crate::errors::TransportError;
use crate::events::{
    EventBus, EventHandler, EventKind, EventSource, SessionEvent, SubscriptionHandle, Unsubscribe,
};
use crate::model::{
    Connection, PublisherProperties, SignalEnvelope, Stream, StreamRecord, SubscriberProperties,
};

/// Operations that can be made to fail with [`LoopbackClient::fail_next`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Operation {
    Connect,
    InitPublisher,
    Publish,
    Subscribe,
    Signal,
    ForceDisconnect,
    ForceUnpublish,
}

type PublisherRegistry = Arc<Mutex<HashMap<String, Arc<LoopbackPublisher>>>>;

#[derive(Default)]
struct Failures {
    queued: Mutex<HashMap<Operation, TransportError>>,
}

impl Failures {
    fn check(&self, op: Operation) -> Result<(), TransportError> {
        match self.queued.lock().unwrap_or_else(PoisonError::into_inner).remove(&op) {
            Some(err) => {
                tracing::debug!(?op, %err, "loopback: injecting failure");
                Err(err)
            }
            None => Ok(()),
        }
    }
}

fn not_connected() -> TransportError {
    TransportError::new("OT_NOT_CONNECTED", "session is not connected").with_code(1010)
}

/// Entry point of the loopback transport.
///
/// Meant to back one test or script: every session it initialises stays
/// reachable through [`LoopbackClient::session`] for the client's lifetime.
/// Publishers are tracked from initialisation until they are unpublished.
#[derive(Clone, Default)]
pub struct LoopbackClient {
    failures: Arc<Failures>,
    publishers: PublisherRegistry,
    sessions: Arc<Mutex<Vec<Arc<LoopbackSession>>>>,
}

impl LoopbackClient {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make the next call of `op` report `err` through its completion.
    pub fn fail_next(&self, op: Operation, err: TransportError) {
        self.failures
            .queued
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(op, err);
    }

    /// The most recently initialised session.
    pub fn session(&self) -> Option<Arc<LoopbackSession>> {
        self.sessions
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .last()
            .cloned()
    }

    pub fn publisher(&self, id: &str) -> Option<Arc<LoopbackPublisher>> {
        self.publishers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(id)
            .cloned()
    }
}

impl SessionClient for LoopbackClient {
    fn init_session(&self, api_key: &str, session_id: &str) -> Arc<dyn Session> {
        let session = Arc::new(LoopbackSession {
            api_key: api_key.to_string(),
            session_id: session_id.to_string(),
            bus: EventBus::new(),
            connection: Mutex::new(None),
            failures: self.failures.clone(),
            publishers: self.publishers.clone(),
            subscribers: Mutex::new(HashMap::new()),
            remote_streams: Mutex::new(HashMap::new()),
            sent_signals: Mutex::new(Vec::new()),
            forced_disconnects: Mutex::new(Vec::new()),
        });
        tracing::debug!(session_id, "loopback: session initialised");
        self.sessions
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(session.clone());
        session
    }

    fn init_publisher(
        &self,
        target: &str,
        properties: &PublisherProperties,
        done: Completion,
    ) -> Arc<dyn Publisher> {
        let publisher = Arc::new(LoopbackPublisher::new(properties.clone()));
        tracing::debug!(id = %publisher.id, target, "loopback: publisher initialised");
        self.publishers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(publisher.id.clone(), publisher.clone());

        match self.failures.check(Operation::InitPublisher) {
            Ok(()) => {
                publisher.bus.emit(&SessionEvent::AccessAllowed);
                done(Ok(()));
            }
            Err(err) => {
                publisher.bus.emit(&SessionEvent::AccessDenied);
                done(Err(err));
            }
        }
        publisher
    }
}

pub struct LoopbackSession {
    api_key: String,
    session_id: String,
    bus: EventBus,
    connection: Mutex<Option<Connection>>,
    failures: Arc<Failures>,
    publishers: PublisherRegistry,
    subscribers: Mutex<HashMap<String, Arc<LoopbackSubscriber>>>,
    remote_streams: Mutex<HashMap<String, Stream>>,
    sent_signals: Mutex<Vec<SignalEnvelope>>,
    forced_disconnects: Mutex<Vec<Connection>>,
}

impl LoopbackSession {
    pub fn api_key(&self) -> &str {
        &self.api_key
    }

    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    pub fn is_connected(&self) -> bool {
        self.lock_connection().is_some()
    }

    pub fn sent_signals(&self) -> Vec<SignalEnvelope> {
        self.sent_signals
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn forced_disconnects(&self) -> Vec<Connection> {
        self.forced_disconnects
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// A remote participant starts publishing.
    pub fn add_remote_stream(&self, stream: Stream) {
        self.remote_streams
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(stream.stream_id.clone(), stream.clone());
        self.bus.emit(&SessionEvent::StreamCreated(stream));
    }

    /// A remote participant starts publishing, described the way a transport
    /// reports it. A record with an unknown video type is logged and dropped.
    pub fn add_remote_record(&self, record: StreamRecord) {
        let stream_id = record.stream_id.clone();
        match Stream::try_from(record) {
            Ok(stream) => self.add_remote_stream(stream),
            Err(err) => tracing::warn!(%stream_id, "loopback: ignoring remote stream: {err}"),
        }
    }

    /// A remote participant stops publishing. Unknown ids are ignored.
    pub fn remove_remote_stream(&self, stream_id: &str) {
        let removed = self
            .remote_streams
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(stream_id);
        if let Some(stream) = removed {
            self.bus.emit(&SessionEvent::StreamDestroyed {
                stream,
                reason: "clientDisconnected".to_string(),
            });
        }
    }

    /// A signal arrives from another participant.
    pub fn receive_signal(&self, kind: &str, data: &str, from: Option<Connection>) {
        self.bus.emit(&SessionEvent::Signal {
            kind: kind.to_string(),
            data: data.to_string(),
            from,
        });
    }

    /// Deliver a session event outside the tracked set, such as
    /// `archiveStarted` or `streamPropertyChanged`.
    pub fn deliver_event(&self, name: &str, payload: serde_json::Value) {
        self.bus.emit(&SessionEvent::Other {
            name: name.to_string(),
            payload,
        });
    }

    /// The transport loses the session.
    pub fn drop_connection(&self, reason: &str) {
        self.lock_connection().take();
        self.bus.emit(&SessionEvent::SessionDisconnected {
            reason: reason.to_string(),
        });
    }

    /// The transport drops and recovers the connection.
    pub fn reconnect(&self) {
        self.bus.emit(&SessionEvent::SessionReconnecting);
        self.bus.emit(&SessionEvent::SessionReconnected);
    }

    fn lock_connection(&self) -> std::sync::MutexGuard<'_, Option<Connection>> {
        self.connection.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn own_connection(&self) -> Result<Connection, TransportError> {
        self.lock_connection().clone().ok_or_else(not_connected)
    }

    fn registered_publisher(&self, id: &str) -> Option<Arc<LoopbackPublisher>> {
        self.publishers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(id)
            .cloned()
    }

    fn start_publishing(&self, publisher: &Arc<dyn Publisher>) -> Result<(), TransportError> {
        let connection = self.own_connection()?;
        self.failures.check(Operation::Publish)?;
        let local = self.registered_publisher(&publisher.id()).ok_or_else(|| {
            TransportError::new("OT_INVALID_PARAMETER", "publisher was not created by this client")
                .with_code(1011)
        })?;

        let mut stream = Stream::new(
            Uuid::new_v4().to_string(),
            local.properties.video_source,
            connection,
        );
        stream.name = local.properties.name.clone().unwrap_or_default();
        stream.has_audio = local.properties.publish_audio;
        stream.has_video = local.properties.publish_video;

        *local.stream.lock().unwrap_or_else(PoisonError::into_inner) = Some(stream.clone());
        local.bus.emit(&SessionEvent::StreamCreated(stream));
        Ok(())
    }
}

impl EventSource for LoopbackSession {
    fn on(&self, kind: EventKind, handler: EventHandler) -> SubscriptionHandle {
        self.bus.on(kind, handler)
    }

    fn off(&self, target: Unsubscribe) {
        self.bus.off(target)
    }
}

impl Session for LoopbackSession {
    fn connection(&self) -> Option<Connection> {
        self.lock_connection().clone()
    }

    fn connect(&self, token: &str, done: Completion) {
        let result = self.failures.check(Operation::Connect).and_then(|()| {
            if token.is_empty() {
                Err(TransportError::new("OT_AUTHENTICATION_ERROR", "token is empty").with_code(1004))
            } else {
                Ok(())
            }
        });
        if let Err(err) = result {
            done(Err(err));
            return;
        }

        *self.lock_connection() = Some(Connection::new(Uuid::new_v4().to_string()));
        self.bus.emit(&SessionEvent::SessionConnected);
        done(Ok(()));
    }

    fn disconnect(&self) {
        let was_connected = self.lock_connection().take().is_some();
        if was_connected {
            self.bus.emit(&SessionEvent::SessionDisconnected {
                reason: "clientDisconnected".to_string(),
            });
        }
    }

    fn publish(&self, publisher: Arc<dyn Publisher>, done: Completion) {
        done(self.start_publishing(&publisher));
    }

    fn unpublish(&self, publisher: &Arc<dyn Publisher>) {
        let removed = self
            .publishers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&publisher.id());
        let Some(local) = removed else {
            return;
        };
        let stream = local.stream.lock().unwrap_or_else(PoisonError::into_inner).take();
        if let Some(stream) = stream {
            local.bus.emit(&SessionEvent::StreamDestroyed {
                stream,
                reason: "unpublished".to_string(),
            });
        }
    }

    fn subscribe(
        &self,
        stream: &Stream,
        container: &str,
        properties: &SubscriberProperties,
        done: Completion,
    ) -> Arc<dyn Subscriber> {
        let subscriber = Arc::new(LoopbackSubscriber {
            id: Uuid::new_v4().to_string(),
            stream: stream.clone(),
            container: container.to_string(),
            bus: EventBus::new(),
            audio: AtomicBool::new(properties.subscribe_to_audio),
            video: AtomicBool::new(properties.subscribe_to_video),
        });

        let result = self
            .own_connection()
            .and_then(|_| self.failures.check(Operation::Subscribe));
        if result.is_ok() {
            self.subscribers
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .insert(subscriber.id.clone(), subscriber.clone());
        }
        done(result);
        subscriber
    }

    fn unsubscribe(&self, subscriber: &Arc<dyn Subscriber>) {
        let removed = self
            .subscribers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&subscriber.id());
        if let Some(local) = removed {
            local.bus.emit(&SessionEvent::Destroyed {
                reason: "unsubscribe".to_string(),
            });
        }
    }

    fn signal(&self, envelope: SignalEnvelope, done: Completion) {
        let own = match self
            .own_connection()
            .and_then(|own| self.failures.check(Operation::Signal).map(|()| own))
        {
            Ok(own) => own,
            Err(err) => {
                done(Err(err));
                return;
            }
        };

        self.sent_signals
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(envelope.clone());

        let delivered_locally = envelope
            .to
            .as_ref()
            .is_none_or(|to| to.connection_id == own.connection_id);
        if delivered_locally {
            self.bus.emit(&SessionEvent::Signal {
                kind: envelope.kind,
                data: envelope.data,
                from: Some(own),
            });
        }
        done(Ok(()));
    }

    fn force_disconnect(&self, connection: &Connection, done: Completion) {
        if let Err(err) = self.failures.check(Operation::ForceDisconnect) {
            done(Err(err));
            return;
        }

        self.forced_disconnects
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(connection.clone());

        let dropped: Vec<Stream> = {
            let mut remote = self.remote_streams.lock().unwrap_or_else(PoisonError::into_inner);
            let ids: Vec<String> = remote
                .values()
                .filter(|s| s.connection.connection_id == connection.connection_id)
                .map(|s| s.stream_id.clone())
                .collect();
            ids.iter().filter_map(|id| remote.remove(id)).collect()
        };
        for stream in dropped {
            self.bus.emit(&SessionEvent::StreamDestroyed {
                stream,
                reason: "forceDisconnected".to_string(),
            });
        }
        self.bus.emit(&SessionEvent::ConnectionDestroyed {
            connection: connection.clone(),
            reason: "forceDisconnected".to_string(),
        });
        done(Ok(()));
    }

    fn force_unpublish(&self, stream: &Stream, done: Completion) {
        if let Err(err) = self.failures.check(Operation::ForceUnpublish) {
            done(Err(err));
            return;
        }

        self.remote_streams
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&stream.stream_id);
        self.bus.emit(&SessionEvent::StreamDestroyed {
            stream: stream.clone(),
            reason: "forceUnpublished".to_string(),
        });
        done(Ok(()));
    }
}

pub struct LoopbackPublisher {
    id: String,
    properties: PublisherProperties,
    bus: EventBus,
    stream: Mutex<Option<Stream>>,
    audio: AtomicBool,
    video: AtomicBool,
}

impl LoopbackPublisher {
    fn new(properties: PublisherProperties) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            audio: AtomicBool::new(properties.publish_audio),
            video: AtomicBool::new(properties.publish_video),
            properties,
            bus: EventBus::new(),
            stream: Mutex::new(None),
        }
    }

    pub fn is_publishing_audio(&self) -> bool {
        self.audio.load(Ordering::SeqCst)
    }

    pub fn is_publishing_video(&self) -> bool {
        self.video.load(Ordering::SeqCst)
    }
}

impl EventSource for LoopbackPublisher {
    fn on(&self, kind: EventKind, handler: EventHandler) -> SubscriptionHandle {
        self.bus.on(kind, handler)
    }

    fn off(&self, target: Unsubscribe) {
        self.bus.off(target)
    }
}

impl Publisher for LoopbackPublisher {
    fn id(&self) -> String {
        self.id.clone()
    }

    fn stream(&self) -> Option<Stream> {
        self.stream.lock().unwrap_or_else(PoisonError::into_inner).clone()
    }

    fn publish_audio(&self, enabled: bool) {
        self.audio.store(enabled, Ordering::SeqCst);
    }

    fn publish_video(&self, enabled: bool) {
        let was = self.video.swap(enabled, Ordering::SeqCst);
        if was != enabled {
            let reason = "publishVideo".to_string();
            self.bus.emit(&if enabled {
                SessionEvent::VideoEnabled { reason }
            } else {
                SessionEvent::VideoDisabled { reason }
            });
        }
    }
}

pub struct LoopbackSubscriber {
    id: String,
    stream: Stream,
    container: String,
    bus: EventBus,
    audio: AtomicBool,
    video: AtomicBool,
}

impl LoopbackSubscriber {
    pub fn container(&self) -> &str {
        &self.container
    }

    pub fn is_receiving_audio(&self) -> bool {
        self.audio.load(Ordering::SeqCst)
    }

    pub fn is_receiving_video(&self) -> bool {
        self.video.load(Ordering::SeqCst)
    }
}

impl EventSource for LoopbackSubscriber {
    fn on(&self, kind: EventKind, handler: EventHandler) -> SubscriptionHandle {
        self.bus.on(kind, handler)
    }

    fn off(&self, target: Unsubscribe) {
        self.bus.off(target)
    }
}

impl Subscriber for LoopbackSubscriber {
    fn id(&self) -> String {
        self.id.clone()
    }

    fn stream(&self) -> Stream {
        self.stream.clone()
    }

    fn subscribe_to_audio(&self, enabled: bool) {
        self.audio.store(enabled, Ordering::SeqCst);
    }

    fn subscribe_to_video(&self, enabled: bool) {
        let was = self.video.swap(enabled, Ordering::SeqCst);
        if was != enabled {
            let reason = "subscribeToVideo".to_string();
            self.bus.emit(&if enabled {
                SessionEvent::VideoEnabled { reason }
            } else {
                SessionEvent::VideoDisabled { reason }
            });
        }
    }
}
