use std::sync::{Arc, LazyLock, Mutex, MutexGuard, PoisonError};

use regex::Regex;
use serde::Serialize;

use crate::client::{Publisher, Session, SessionClient, Subscriber, complete, completion};
use crate::config::Credentials;
use crate::errors::RosterError;
use crate::events::{
    Callback, ConnectionState, EventHandler, EventKind, EventListeners, EventSource, SessionEvent,
    SubscriptionHandle, Unsubscribe,
};
use crate::model::{
    Connection, PublisherProperties, SignalEnvelope, Stream, StreamRole, SubscriberProperties,
};
use crate::participants::{ParticipantStore, Snapshot};

/// Largest signal payload the session accepts, in bytes of serialized JSON.
const MAX_SIGNAL_DATA_BYTES: usize = 8192;

static SIGNAL_TYPE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^[A-Za-z0-9_~-]{1,128}$").expect("signal type pattern is valid")
});

struct Inner {
    credentials: Credentials,
    client: Arc<dyn SessionClient>,
    session: Arc<dyn Session>,
    participants: Mutex<ParticipantStore>,
    connection_state: Mutex<ConnectionState>,
    reconnect_attempt: Mutex<u32>,
    /// Bookkeeping bindings made by `connect`.
    internal_bindings: Mutex<Vec<SubscriptionHandle>>,
    /// Bindings made on behalf of callers, removable through `off`.
    caller_bindings: Mutex<Vec<(EventKind, SubscriptionHandle)>>,
}

/// Façade over one session of the external client.
///
/// Forwards session operations and keeps a [`ParticipantStore`] in step with
/// both their outcomes and the session's lifecycle events. Cloning is cheap
/// and yields a handle to the same session.
#[derive(Clone)]
pub struct SessionManager {
    inner: Arc<Inner>,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

impl SessionManager {
    pub fn new(client: Arc<dyn SessionClient>, credentials: Credentials) -> Self {
        let session = client.init_session(&credentials.api_key, &credentials.session_id);
        tracing::debug!(session_id = %credentials.session_id, "session initialised");
        Self {
            inner: Arc::new(Inner {
                credentials,
                client,
                session,
                participants: Mutex::new(ParticipantStore::new()),
                connection_state: Mutex::new(ConnectionState::Disconnected),
                reconnect_attempt: Mutex::new(0),
                internal_bindings: Mutex::new(Vec::new()),
                caller_bindings: Mutex::new(Vec::new()),
            }),
        }
    }

    pub fn session_id(&self) -> &str {
        &self.inner.credentials.session_id
    }

    /// Snapshot of streams, publishers, subscribers and their counts.
    pub fn state(&self) -> Snapshot {
        lock(&self.inner.participants).all()
    }

    pub fn connection_state(&self) -> ConnectionState {
        lock(&self.inner.connection_state).clone()
    }

    /// Connect to the session with the stored token.
    ///
    /// Drops every existing binding, re-binds the bookkeeping listeners, then
    /// binds `listeners` on the session. Safe to call again after a disconnect.
    pub async fn connect(&self, listeners: Option<EventListeners>) -> Result<(), RosterError> {
        let listeners = match listeners {
            Some(listeners) => listeners.resolve()?,
            None => Vec::new(),
        };

        self.inner.session.off(Unsubscribe::All);
        lock(&self.inner.internal_bindings).clear();
        lock(&self.inner.caller_bindings).clear();

        self.wire_session_events();
        let bound = self.bind_listeners(&*self.inner.session, listeners);
        lock(&self.inner.caller_bindings).extend(bound);

        self.set_connection_state(ConnectionState::Connecting);
        tracing::info!(session_id = %self.session_id(), "connecting to session");

        let session = self.inner.session.clone();
        let token = self.inner.credentials.token.clone();
        match complete(|done| session.connect(&token, done)).await {
            Ok(()) => {
                *lock(&self.inner.reconnect_attempt) = 0;
                self.set_connection_state(ConnectionState::Connected);
                tracing::info!(session_id = %self.session_id(), "connected to session");
                Ok(())
            }
            Err(err) => {
                tracing::warn!(session_id = %self.session_id(), "connect failed: {err}");
                self.set_connection_state(ConnectionState::Disconnected);
                Err(err.into())
            }
        }
    }

    /// Tear down the session connection and forget all participants.
    pub fn disconnect(&self) {
        self.inner.session.disconnect();
        lock(&self.inner.participants).reset();
        self.set_connection_state(ConnectionState::Disconnected);
        tracing::info!(session_id = %self.session_id(), "disconnected from session");
    }

    /// Create a local publisher and, unless `preview_only`, join it to the session.
    ///
    /// The publisher is recorded only once the session confirms the join.
    pub async fn publish(
        &self,
        target: &str,
        properties: &PublisherProperties,
        listeners: Option<EventListeners>,
        preview_only: bool,
    ) -> Result<Arc<dyn Publisher>, RosterError> {
        let listeners = match listeners {
            Some(listeners) => listeners.resolve()?,
            None => Vec::new(),
        };

        let (done, initialised) = completion();
        let publisher = self.inner.client.init_publisher(target, properties, done);
        self.bind_listeners(&*publisher, listeners);

        if let Err(err) = initialised.await {
            tracing::warn!(container = %target, "publisher initialisation failed: {err}");
            return Err(err.into());
        }
        if preview_only {
            tracing::debug!(publisher_id = %publisher.id(), "publisher created for preview");
            return Ok(publisher);
        }

        self.join(publisher.clone(), properties.video_source).await?;
        Ok(publisher)
    }

    /// Join a publisher created with `preview_only` to the session.
    pub async fn publish_preview(&self, publisher: &Arc<dyn Publisher>) -> Result<(), RosterError> {
        self.join(publisher.clone(), StreamRole::Camera).await
    }

    async fn join(
        &self,
        publisher: Arc<dyn Publisher>,
        fallback_role: StreamRole,
    ) -> Result<(), RosterError> {
        let session = self.inner.session.clone();
        let joining = publisher.clone();
        if let Err(err) = complete(|done| session.publish(joining, done)).await {
            tracing::warn!(publisher_id = %publisher.id(), "publish failed: {err}");
            return Err(err.into());
        }

        let stream = publisher.stream();
        let role = {
            let mut participants = lock(&self.inner.participants);
            let role = match &stream {
                Some(stream) => {
                    if let Err(err) = participants.add_stream(stream) {
                        tracing::error!("published stream not recorded: {err}");
                    }
                    participants
                        .recorded_role(&stream.stream_id)
                        .unwrap_or(stream.role)
                }
                None => fallback_role,
            };
            participants.add_publisher(role, publisher.clone());
            role
        };
        tracing::info!(
            publisher_id = %publisher.id(),
            stream_id = stream.as_ref().map(|s| s.stream_id.as_str()).unwrap_or(""),
            %role,
            "publisher joined session"
        );
        Ok(())
    }

    /// Stop publishing. The publisher is dropped from the state regardless of
    /// what the session does with the request.
    pub fn unpublish(&self, publisher: &Arc<dyn Publisher>) {
        let id = publisher.id();
        let stream = publisher.stream();
        self.inner.session.unpublish(publisher);

        let mut participants = lock(&self.inner.participants);
        match stream {
            Some(stream) => {
                participants.remove_publisher(stream.role, &id);
                participants.remove_stream(&stream.stream_id);
            }
            None => {
                for role in StreamRole::ALL {
                    participants.remove_publisher(role, &id);
                }
            }
        }
        tracing::info!(publisher_id = %id, "publisher removed");
    }

    /// Subscribe to a remote stream. The subscriber is recorded only on success.
    pub async fn subscribe(
        &self,
        stream: &Stream,
        container: &str,
        properties: &SubscriberProperties,
        listeners: Option<EventListeners>,
    ) -> Result<Arc<dyn Subscriber>, RosterError> {
        let listeners = match listeners {
            Some(listeners) => listeners.resolve()?,
            None => Vec::new(),
        };

        let (done, subscribed) = completion();
        let subscriber = self
            .inner
            .session
            .subscribe(stream, container, properties, done);
        if let Err(err) = subscribed.await {
            tracing::warn!(stream_id = %stream.stream_id, "subscribe failed: {err}");
            return Err(err.into());
        }

        let role = {
            let mut participants = lock(&self.inner.participants);
            if let Err(err) = participants.add_stream(stream) {
                tracing::error!("subscribed stream not recorded: {err}");
            }
            participants.add_subscriber(subscriber.clone());
            participants
                .recorded_role(&stream.stream_id)
                .unwrap_or(stream.role)
        };
        self.bind_listeners(&*subscriber, listeners);
        tracing::info!(
            subscriber_id = %subscriber.id(),
            stream_id = %stream.stream_id,
            %role,
            "subscribed to stream"
        );
        Ok(subscriber)
    }

    pub fn unsubscribe(&self, subscriber: &Arc<dyn Subscriber>) {
        let id = subscriber.id();
        let stream_id = subscriber.stream().stream_id;
        self.inner.session.unsubscribe(subscriber);

        let mut participants = lock(&self.inner.participants);
        participants.remove_subscriber(&id);
        participants.remove_stream(&stream_id);
        tracing::info!(subscriber_id = %id, %stream_id, "subscriber removed");
    }

    /// Send `payload` as JSON over the session's signaling channel, to
    /// everyone or to a single connection.
    pub async fn signal<T>(
        &self,
        kind: &str,
        payload: &T,
        recipient: Option<&Connection>,
    ) -> Result<(), RosterError>
    where
        T: Serialize + ?Sized,
    {
        if !SIGNAL_TYPE.is_match(kind) {
            return Err(RosterError::InvalidParameters(format!(
                "signal type '{kind}' must be 1-128 characters of [A-Za-z0-9_~-]"
            )));
        }
        let data = serde_json::to_string(payload)?;
        if data.len() > MAX_SIGNAL_DATA_BYTES {
            return Err(RosterError::InvalidParameters(format!(
                "signal data is {} bytes, limit is {MAX_SIGNAL_DATA_BYTES}",
                data.len()
            )));
        }

        let envelope = SignalEnvelope {
            kind: kind.to_string(),
            data,
            to: recipient.cloned(),
        };
        let session = self.inner.session.clone();
        complete(|done| session.signal(envelope, done)).await?;
        tracing::debug!(kind, to = ?recipient.map(|c| &c.connection_id), "signal sent");
        Ok(())
    }

    /// Ask the session to drop another participant's connection.
    ///
    /// The resulting stream teardown reaches the state through the usual
    /// `streamDestroyed` events.
    pub async fn force_disconnect(&self, connection: &Connection) -> Result<(), RosterError> {
        let session = self.inner.session.clone();
        complete(|done| session.force_disconnect(connection, done)).await?;
        tracing::info!(connection_id = %connection.connection_id, "connection force-disconnected");
        Ok(())
    }

    /// Ask the session to stop another participant's stream.
    pub async fn force_unpublish(&self, stream: &Stream) -> Result<(), RosterError> {
        let session = self.inner.session.clone();
        complete(|done| session.force_unpublish(stream, done)).await?;
        tracing::info!(stream_id = %stream.stream_id, "stream force-unpublished");
        Ok(())
    }

    /// Whether `connection` is our own connection to the session.
    pub fn is_me(&self, connection: &Connection) -> bool {
        self.inner
            .session
            .connection()
            .is_some_and(|own| own.connection_id == connection.connection_id)
    }

    /// Bind `callback` to a session event by name.
    pub fn on<F>(&self, event: &str, callback: F) -> Result<SubscriptionHandle, RosterError>
    where
        F: Fn(&SessionManager, &SessionEvent) + Send + Sync + 'static,
    {
        let kind: EventKind = event.parse()?;
        let handle = self
            .inner
            .session
            .on(kind.clone(), self.with_context(Arc::new(callback)));
        lock(&self.inner.caller_bindings).push((kind, handle));
        Ok(handle)
    }

    /// Bind several callbacks at once. Nothing is bound if any name is invalid.
    pub fn on_many(&self, listeners: EventListeners) -> Result<Vec<SubscriptionHandle>, RosterError> {
        let listeners = listeners.resolve()?;
        let bound = self.bind_listeners(&*self.inner.session, listeners);
        let handles = bound.iter().map(|(_, handle)| *handle).collect();
        lock(&self.inner.caller_bindings).extend(bound);
        Ok(handles)
    }

    /// Remove caller bindings for the named events, or all of them when
    /// `events` is empty. Bookkeeping bindings are kept.
    pub fn off(&self, events: &[&str]) {
        let kinds: Vec<EventKind> = events
            .iter()
            .filter_map(|name| match name.parse() {
                Ok(kind) => Some(kind),
                Err(_) => {
                    tracing::warn!("off: ignoring blank event name {name:?}");
                    None
                }
            })
            .collect();

        let removed: Vec<SubscriptionHandle> = {
            let mut bindings = lock(&self.inner.caller_bindings);
            let (removed, kept): (Vec<_>, Vec<_>) = bindings
                .drain(..)
                .partition(|(kind, _)| events.is_empty() || kinds.contains(kind));
            *bindings = kept;
            removed.into_iter().map(|(_, handle)| handle).collect()
        };
        for handle in removed {
            self.inner.session.off(Unsubscribe::Handle(handle));
        }
    }

    /// Mute or unmute audio on every camera publisher.
    pub fn enable_publisher_audio(&self, enabled: bool) {
        let publishers = lock(&self.inner.participants).publishers(StreamRole::Camera);
        for publisher in publishers {
            publisher.publish_audio(enabled);
        }
    }

    /// Start or stop video on every camera publisher.
    pub fn enable_publisher_video(&self, enabled: bool) {
        let publishers = lock(&self.inner.participants).publishers(StreamRole::Camera);
        for publisher in publishers {
            publisher.publish_video(enabled);
        }
    }

    pub fn enable_subscriber_audio(&self, stream_id: &str, enabled: bool) {
        let subscriber = lock(&self.inner.participants).subscriber_for_stream(stream_id);
        match subscriber {
            Some(subscriber) => subscriber.subscribe_to_audio(enabled),
            None => tracing::debug!(stream_id, "no subscriber for stream"),
        }
    }

    pub fn enable_subscriber_video(&self, stream_id: &str, enabled: bool) {
        let subscriber = lock(&self.inner.participants).subscriber_for_stream(stream_id);
        match subscriber {
            Some(subscriber) => subscriber.subscribe_to_video(enabled),
            None => tracing::debug!(stream_id, "no subscriber for stream"),
        }
    }

    fn set_connection_state(&self, state: ConnectionState) {
        *lock(&self.inner.connection_state) = state;
    }

    /// Wrap a caller callback so it runs with this manager as context.
    ///
    /// Holds the manager weakly: the session owns its handlers, and must not
    /// keep the manager alive.
    fn with_context(&self, callback: Callback) -> EventHandler {
        let inner = Arc::downgrade(&self.inner);
        Arc::new(move |event: &SessionEvent| {
            if let Some(inner) = inner.upgrade() {
                callback(&SessionManager { inner }, event);
            }
        })
    }

    fn bind_listeners<S>(
        &self,
        source: &S,
        listeners: Vec<(EventKind, Callback)>,
    ) -> Vec<(EventKind, SubscriptionHandle)>
    where
        S: EventSource + ?Sized,
    {
        listeners
            .into_iter()
            .map(|(kind, callback)| {
                let handle = source.on(kind.clone(), self.with_context(callback));
                (kind, handle)
            })
            .collect()
    }

    fn wire_session_events(&self) {
        let wiring: [(EventKind, fn(&SessionManager, &SessionEvent)); 6] = [
            (EventKind::StreamCreated, Self::on_stream_created),
            (EventKind::StreamDestroyed, Self::on_stream_destroyed),
            (EventKind::SessionConnected, Self::on_session_up),
            (EventKind::SessionReconnected, Self::on_session_up),
            (EventKind::SessionReconnecting, Self::on_session_reconnecting),
            (EventKind::SessionDisconnected, Self::on_session_down),
        ];
        let handles = wiring
            .into_iter()
            .map(|(kind, handler)| self.inner.session.on(kind, self.with_context(Arc::new(handler))))
            .collect();
        *lock(&self.inner.internal_bindings) = handles;
    }

    fn on_stream_created(&self, event: &SessionEvent) {
        let SessionEvent::StreamCreated(stream) = event else {
            return;
        };
        match lock(&self.inner.participants).add_stream(stream) {
            Ok(()) => tracing::debug!(
                stream_id = %stream.stream_id,
                role = %stream.role,
                connection_id = %stream.connection.connection_id,
                "stream created"
            ),
            Err(err) => tracing::error!("ignoring stream created event: {err}"),
        }
    }

    fn on_stream_destroyed(&self, event: &SessionEvent) {
        if let SessionEvent::StreamDestroyed { stream, reason } = event {
            lock(&self.inner.participants).remove_stream(&stream.stream_id);
            tracing::debug!(stream_id = %stream.stream_id, %reason, "stream destroyed");
        }
    }

    fn on_session_up(&self, _event: &SessionEvent) {
        *lock(&self.inner.reconnect_attempt) = 0;
        self.set_connection_state(ConnectionState::Connected);
    }

    fn on_session_reconnecting(&self, _event: &SessionEvent) {
        let attempt = {
            let mut attempt = lock(&self.inner.reconnect_attempt);
            *attempt += 1;
            *attempt
        };
        tracing::info!(attempt, "session reconnecting");
        self.set_connection_state(ConnectionState::Reconnecting { attempt });
    }

    fn on_session_down(&self, event: &SessionEvent) {
        if let SessionEvent::SessionDisconnected { reason } = event {
            tracing::info!(%reason, "session disconnected");
        }
        lock(&self.inner.participants).reset();
        self.set_connection_state(ConnectionState::Disconnected);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::errors::TransportError;
    use crate::loopback::{LoopbackClient, LoopbackSession, Operation};
    use crate::model::StreamRecord;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn credentials() -> Credentials {
        Credentials::new("46000000", "1_MX40NjAwMDAwMH4", "T1==token")
    }

    fn manager(client: &LoopbackClient) -> SessionManager {
        SessionManager::new(Arc::new(client.clone()), credentials())
    }

    async fn connected() -> (LoopbackClient, Arc<LoopbackSession>, SessionManager) {
        let client = LoopbackClient::new();
        let manager = manager(&client);
        manager.connect(None).await.unwrap();
        let session = client.session().unwrap();
        (client, session, manager)
    }

    fn remote_stream(id: &str, role: StreamRole) -> Stream {
        Stream::new(id, role, Connection::new(format!("remote-{id}")))
    }

    fn counter() -> (Arc<AtomicUsize>, impl Fn(&SessionManager, &SessionEvent) + Send + Sync + 'static) {
        let count = Arc::new(AtomicUsize::new(0));
        let hits = count.clone();
        (count, move |_: &SessionManager, _: &SessionEvent| {
            hits.fetch_add(1, Ordering::SeqCst);
        })
    }

    #[tokio::test]
    async fn connect_marks_session_connected() {
        let client = LoopbackClient::new();
        let manager = manager(&client);
        assert_eq!(manager.connection_state(), ConnectionState::Disconnected);

        manager.connect(None).await.unwrap();

        assert_eq!(manager.connection_state(), ConnectionState::Connected);
        let session = client.session().unwrap();
        assert_eq!(session.api_key(), "46000000");
        assert_eq!(session.session_id(), manager.session_id());
    }

    #[tokio::test]
    async fn connect_failure_surfaces_transport_error() {
        let client = LoopbackClient::new();
        let manager = manager(&client);
        let err = TransportError::new("OT_CONNECT_FAILED", "unreachable").with_code(1006);
        client.fail_next(Operation::Connect, err.clone());

        let result = manager.connect(None).await;

        assert!(matches!(result, Err(RosterError::Transport(e)) if e == err));
        assert_eq!(manager.connection_state(), ConnectionState::Disconnected);
    }

    #[tokio::test]
    async fn is_me_compares_own_connection() {
        let client = LoopbackClient::new();
        let manager = manager(&client);
        let stranger = Connection::new("someone-else");
        assert!(!manager.is_me(&stranger));

        manager.connect(None).await.unwrap();
        let own = client.session().unwrap().connection().unwrap();

        assert!(manager.is_me(&own));
        assert!(!manager.is_me(&stranger));
    }

    #[tokio::test]
    async fn remote_stream_events_update_state() {
        let (_client, session, manager) = connected().await;

        session.add_remote_stream(remote_stream("s1", StreamRole::Camera));
        session.add_remote_stream(remote_stream("s2", StreamRole::Screen));
        let state = manager.state();
        assert_eq!(state.meta.streams.camera, 1);
        assert_eq!(state.meta.streams.screen, 1);

        session.remove_remote_stream("s1");
        session.remove_remote_stream("s1");
        let state = manager.state();
        assert!(state.streams.camera.is_empty());
        assert_eq!(state.meta.streams.total, 1);
    }

    #[tokio::test]
    async fn remote_stream_with_unknown_video_type_is_not_recorded() {
        let (_client, session, manager) = connected().await;
        let record: StreamRecord = serde_json::from_value(serde_json::json!({
            "streamId": "s1",
            "videoType": "custom",
            "connection": { "connectionId": "remote-s1" },
        }))
        .unwrap();

        session.add_remote_record(record);

        assert_eq!(manager.state(), Snapshot::default());
    }

    #[tokio::test]
    async fn conflicting_role_for_known_stream_is_ignored() {
        let (_client, session, manager) = connected().await;

        session.add_remote_stream(remote_stream("s1", StreamRole::Camera));
        session.add_remote_stream(remote_stream("s1", StreamRole::Screen));

        let state = manager.state();
        assert!(state.streams.camera.contains_key("s1"));
        assert!(state.streams.screen.is_empty());
    }

    #[tokio::test]
    async fn publish_records_publisher_under_stream_role() {
        let (_client, _session, manager) = connected().await;

        let publisher = manager
            .publish("local-video", &PublisherProperties::default(), None, false)
            .await
            .unwrap();

        let stream_id = publisher.stream().unwrap().stream_id;
        let state = manager.state();
        assert!(state.publishers.camera.contains_key(&publisher.id()));
        assert_eq!(state.meta.publishers.camera, 1);
        assert_eq!(state.stream_map[&stream_id], publisher.id());
        assert!(state.streams.camera.contains_key(&stream_id));
    }

    #[tokio::test]
    async fn screen_publisher_goes_to_screen_partition() {
        let (_client, _session, manager) = connected().await;
        let props = PublisherProperties {
            video_source: StreamRole::Screen,
            ..Default::default()
        };

        let publisher = manager.publish("screen", &props, None, false).await.unwrap();

        let state = manager.state();
        assert!(state.publishers.screen.contains_key(&publisher.id()));
        assert_eq!(state.meta.publishers.camera, 0);
    }

    #[tokio::test]
    async fn failed_join_leaves_publishers_untouched() {
        let (client, _session, manager) = connected().await;
        manager
            .publish("first", &PublisherProperties::default(), None, false)
            .await
            .unwrap();
        let before = manager.state();
        let err = TransportError::new("OT_STREAM_CREATE_FAILED", "media server refused").with_code(1553);
        client.fail_next(Operation::Publish, err.clone());

        let result = manager
            .publish("second", &PublisherProperties::default(), None, false)
            .await;

        assert!(matches!(result, Err(RosterError::Transport(e)) if e == err));
        assert_eq!(manager.state(), before);
    }

    #[tokio::test]
    async fn failed_initialisation_leaves_state_untouched() {
        let (client, _session, manager) = connected().await;
        client.fail_next(
            Operation::InitPublisher,
            TransportError::new("OT_USER_MEDIA_ACCESS_DENIED", "camera blocked").with_code(1500),
        );
        let (denied, on_denied) = counter();
        let listeners = EventListeners::new().on("accessDenied", on_denied);

        let result = manager
            .publish("local-video", &PublisherProperties::default(), Some(listeners), false)
            .await;

        assert!(result.is_err());
        assert_eq!(manager.state(), Snapshot::default());
        // Denial fires inside initialisation, before listeners can be bound.
        assert_eq!(denied.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn preview_publisher_is_recorded_only_after_joining() {
        let (_client, _session, manager) = connected().await;

        let publisher = manager
            .publish("preview", &PublisherProperties::default(), None, true)
            .await
            .unwrap();
        assert!(publisher.stream().is_none());
        assert_eq!(manager.state().meta.publishers.total, 0);

        manager.publish_preview(&publisher).await.unwrap();

        let state = manager.state();
        assert!(state.publishers.camera.contains_key(&publisher.id()));
        assert_eq!(state.meta.publishers.total, 1);
    }

    #[tokio::test]
    async fn failed_preview_join_leaves_state_untouched() {
        let (client, _session, manager) = connected().await;
        let publisher = manager
            .publish("preview", &PublisherProperties::default(), None, true)
            .await
            .unwrap();
        client.fail_next(Operation::Publish, TransportError::new("OT_TIMEOUT", "no answer"));

        assert!(manager.publish_preview(&publisher).await.is_err());
        assert_eq!(manager.state(), Snapshot::default());
    }

    #[tokio::test]
    async fn unpublish_removes_publisher_and_stream() {
        let (_client, _session, manager) = connected().await;
        let publisher = manager
            .publish("local-video", &PublisherProperties::default(), None, false)
            .await
            .unwrap();

        manager.unpublish(&publisher);
        manager.unpublish(&publisher);

        assert_eq!(manager.state(), Snapshot::default());
    }

    #[tokio::test]
    async fn subscribe_records_subscriber_and_binds_listeners() {
        let (_client, session, manager) = connected().await;
        let stream = remote_stream("s1", StreamRole::Screen);
        session.add_remote_stream(stream.clone());
        let (disabled, on_disabled) = counter();
        let listeners = EventListeners::new().on("videoDisabled", on_disabled);

        let subscriber = manager
            .subscribe(&stream, "remote-1", &SubscriberProperties::default(), Some(listeners))
            .await
            .unwrap();

        let state = manager.state();
        assert!(state.subscribers.screen.contains_key(&subscriber.id()));
        assert_eq!(state.stream_map["s1"], subscriber.id());
        assert_eq!(state.meta.subscribers.screen, 1);

        manager.enable_subscriber_video("s1", false);
        assert_eq!(disabled.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn subscriber_keeps_recorded_role_of_stream() {
        let (_client, session, manager) = connected().await;
        session.add_remote_stream(remote_stream("s1", StreamRole::Camera));
        let mislabelled = remote_stream("s1", StreamRole::Screen);

        let subscriber = manager
            .subscribe(&mislabelled, "remote-1", &SubscriberProperties::default(), None)
            .await
            .unwrap();

        let state = manager.state();
        assert!(state.streams.camera.contains_key("s1"));
        assert!(state.streams.screen.is_empty());
        assert!(state.subscribers.camera.contains_key(&subscriber.id()));
        assert!(state.subscribers.screen.is_empty());
        assert_eq!(state.meta.subscribers.camera, 1);
    }

    #[tokio::test]
    async fn failed_subscribe_is_not_recorded() {
        let (client, session, manager) = connected().await;
        let stream = remote_stream("s1", StreamRole::Camera);
        session.add_remote_stream(stream.clone());
        let before = manager.state();
        client.fail_next(
            Operation::Subscribe,
            TransportError::new("OT_STREAM_NOT_FOUND", "stream is gone").with_code(1600),
        );

        let result = manager
            .subscribe(&stream, "remote-1", &SubscriberProperties::default(), None)
            .await;

        assert!(result.is_err());
        assert_eq!(manager.state(), before);
    }

    #[tokio::test]
    async fn destroyed_stream_keeps_subscriber_but_drops_mapping() {
        let (_client, session, manager) = connected().await;
        let stream = remote_stream("s1", StreamRole::Screen);
        session.add_remote_stream(stream.clone());
        let subscriber = manager
            .subscribe(&stream, "remote-1", &SubscriberProperties::default(), None)
            .await
            .unwrap();

        session.remove_remote_stream("s1");

        let state = manager.state();
        assert!(state.subscribers.screen.contains_key(&subscriber.id()));
        assert!(!state.stream_map.contains_key("s1"));

        manager.unsubscribe(&subscriber);
        assert_eq!(manager.state(), Snapshot::default());
    }

    #[tokio::test]
    async fn signal_builds_envelope() {
        let (_client, session, manager) = connected().await;
        let recipient = Connection::new("remote-conn");

        manager
            .signal("chat", &serde_json::json!({ "text": "hello" }), None)
            .await
            .unwrap();
        manager.signal("cursor", &[1, 2], Some(&recipient)).await.unwrap();

        let sent = session.sent_signals();
        assert_eq!(sent.len(), 2);
        assert_eq!(sent[0].kind, "chat");
        assert_eq!(sent[0].data, r#"{"text":"hello"}"#);
        assert!(sent[0].to.is_none());
        assert_eq!(sent[1].data, "[1,2]");
        assert_eq!(sent[1].to.as_ref(), Some(&recipient));
    }

    #[tokio::test]
    async fn signal_limits_are_enforced_locally() {
        let (_client, session, manager) = connected().await;

        let bad_type = manager.signal("no spaces", &"x", None).await;
        let too_big = manager.signal("blob", &"x".repeat(MAX_SIGNAL_DATA_BYTES), None).await;

        assert!(matches!(bad_type, Err(RosterError::InvalidParameters(_))));
        assert!(matches!(too_big, Err(RosterError::InvalidParameters(_))));
        assert!(session.sent_signals().is_empty());
    }

    #[tokio::test]
    async fn signal_failure_is_propagated() {
        let (client, _session, manager) = connected().await;
        let err = TransportError::new("OT_RATE_LIMIT_EXCEEDED", "slow down").with_code(413);
        client.fail_next(Operation::Signal, err.clone());

        let result = manager.signal("chat", &"hi", None).await;

        assert!(matches!(result, Err(RosterError::Transport(e)) if e == err));
    }

    #[tokio::test]
    async fn signal_listener_sees_own_broadcast() {
        let (_client, _session, manager) = connected().await;
        let received = Arc::new(Mutex::new(Vec::new()));
        let sink = received.clone();
        manager
            .on("signal:chat", move |m, event| {
                if let SessionEvent::Signal { data, from, .. } = event {
                    let from_me = from.as_ref().is_some_and(|c| m.is_me(c));
                    sink.lock().unwrap().push((data.clone(), from_me));
                }
            })
            .unwrap();

        manager.signal("chat", &"hi", None).await.unwrap();
        manager.signal("other", &"ignored", None).await.unwrap();

        assert_eq!(*received.lock().unwrap(), vec![("\"hi\"".to_string(), true)]);
    }

    #[tokio::test]
    async fn force_unpublish_updates_state_through_event() {
        let (_client, session, manager) = connected().await;
        let stream = remote_stream("s1", StreamRole::Camera);
        session.add_remote_stream(stream.clone());

        manager.force_unpublish(&stream).await.unwrap();

        assert!(manager.state().streams.camera.is_empty());
    }

    #[tokio::test]
    async fn failed_force_disconnect_leaves_state_untouched() {
        let (client, session, manager) = connected().await;
        let stream = remote_stream("s1", StreamRole::Camera);
        session.add_remote_stream(stream.clone());
        let before = manager.state();
        client.fail_next(
            Operation::ForceDisconnect,
            TransportError::new("OT_PERMISSION_DENIED", "not a moderator").with_code(1520),
        );

        let result = manager.force_disconnect(&stream.connection).await;

        assert!(result.is_err());
        assert_eq!(manager.state(), before);
        assert!(session.forced_disconnects().is_empty());
    }

    #[tokio::test]
    async fn force_disconnect_tears_down_remote_streams() {
        let (_client, session, manager) = connected().await;
        let stream = remote_stream("s1", StreamRole::Camera);
        session.add_remote_stream(stream.clone());

        manager.force_disconnect(&stream.connection).await.unwrap();

        assert_eq!(manager.state().meta.streams.total, 0);
        assert_eq!(session.forced_disconnects(), vec![stream.connection]);
    }

    #[tokio::test]
    async fn disconnect_resets_everything() {
        let (_client, session, manager) = connected().await;
        let stream = remote_stream("s1", StreamRole::Screen);
        session.add_remote_stream(stream.clone());
        manager
            .subscribe(&stream, "remote-1", &SubscriberProperties::default(), None)
            .await
            .unwrap();
        manager
            .publish("local-video", &PublisherProperties::default(), None, false)
            .await
            .unwrap();

        manager.disconnect();

        assert_eq!(manager.state(), Snapshot::default());
        assert_eq!(manager.connection_state(), ConnectionState::Disconnected);
        assert!(!session.is_connected());
    }

    #[tokio::test]
    async fn transport_disconnect_resets_state() {
        let (_client, session, manager) = connected().await;
        session.add_remote_stream(remote_stream("s1", StreamRole::Camera));

        session.drop_connection("networkDisconnected");

        assert_eq!(manager.state(), Snapshot::default());
        assert_eq!(manager.connection_state(), ConnectionState::Disconnected);
    }

    #[tokio::test]
    async fn reconnect_cycle_tracks_connection_state() {
        let (_client, session, manager) = connected().await;
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        manager
            .on("sessionReconnecting", move |m, _| {
                sink.lock().unwrap().push(m.connection_state());
            })
            .unwrap();

        session.reconnect();

        assert_eq!(
            *seen.lock().unwrap(),
            vec![ConnectionState::Reconnecting { attempt: 1 }]
        );
        assert_eq!(manager.connection_state(), ConnectionState::Connected);
    }

    #[tokio::test]
    async fn off_without_names_silences_caller_bindings() {
        let (_client, session, manager) = connected().await;
        let (created, on_created) = counter();
        let (disconnected, on_disconnected) = counter();
        manager
            .on_many(
                EventListeners::new()
                    .on("streamCreated", on_created)
                    .on("sessionDisconnected", on_disconnected),
            )
            .unwrap();

        manager.off(&[]);
        session.add_remote_stream(remote_stream("s1", StreamRole::Camera));
        assert_eq!(manager.state().meta.streams.camera, 1);
        session.drop_connection("networkDisconnected");

        assert_eq!(created.load(Ordering::SeqCst), 0);
        assert_eq!(disconnected.load(Ordering::SeqCst), 0);
        assert_eq!(manager.state(), Snapshot::default());
    }

    #[tokio::test]
    async fn off_with_names_removes_only_those() {
        let (_client, session, manager) = connected().await;
        let (created, on_created) = counter();
        let (destroyed, on_destroyed) = counter();
        manager.on("streamCreated", on_created).unwrap();
        manager.on("streamDestroyed", on_destroyed).unwrap();

        manager.off(&["streamCreated", " "]);
        session.add_remote_stream(remote_stream("s1", StreamRole::Camera));
        session.remove_remote_stream("s1");

        assert_eq!(created.load(Ordering::SeqCst), 0);
        assert_eq!(destroyed.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn invalid_event_name_binds_nothing() {
        let (_client, session, manager) = connected().await;
        let (count, on_event) = counter();
        let shared: Callback = Arc::new(on_event);

        let single = manager.on("", |_, _| {});
        let many = manager.on_many(
            [("streamCreated", shared.clone()), ("  ", shared)]
                .into_iter()
                .collect(),
        );

        assert!(matches!(single, Err(RosterError::InvalidParameters(_))));
        assert!(matches!(many, Err(RosterError::InvalidParameters(_))));
        session.add_remote_stream(remote_stream("s1", StreamRole::Camera));
        assert_eq!(count.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn unlisted_transport_events_can_be_bound() {
        let (_client, session, manager) = connected().await;
        let received = Arc::new(Mutex::new(Vec::new()));
        let sink = received.clone();
        manager
            .on("archiveStarted", move |_, event| {
                if let SessionEvent::Other { payload, .. } = event {
                    sink.lock().unwrap().push(payload.clone());
                }
            })
            .unwrap();
        manager.on("streamPropertyChanged", |_, _| {}).unwrap();
        manager.on("exception", |_, _| {}).unwrap();

        session.deliver_event("archiveStarted", serde_json::json!({ "id": "a1" }));
        session.deliver_event("archiveStopped", serde_json::json!({ "id": "a1" }));

        assert_eq!(*received.lock().unwrap(), vec![serde_json::json!({ "id": "a1" })]);
    }

    #[tokio::test]
    async fn callbacks_observe_state_after_bookkeeping() {
        let (_client, session, manager) = connected().await;
        let observed = Arc::new(Mutex::new(None));
        let sink = observed.clone();
        manager
            .on("streamCreated", move |m, event| {
                if let SessionEvent::StreamCreated(stream) = event {
                    let recorded = m.state().streams.get(stream.role).contains_key(&stream.stream_id);
                    *sink.lock().unwrap() = Some(recorded);
                }
            })
            .unwrap();

        session.add_remote_stream(remote_stream("s1", StreamRole::Screen));

        assert_eq!(*observed.lock().unwrap(), Some(true));
    }

    #[tokio::test]
    async fn reconnect_rewires_without_duplicates() {
        let client = LoopbackClient::new();
        let manager = manager(&client);
        let (created, on_created) = counter();
        manager
            .connect(Some(EventListeners::new().on("streamCreated", on_created)))
            .await
            .unwrap();
        manager.disconnect();

        manager.connect(None).await.unwrap();
        let session = client.session().unwrap();
        session.add_remote_stream(remote_stream("s1", StreamRole::Camera));

        assert_eq!(manager.state().meta.streams.camera, 1);
        assert_eq!(created.load(Ordering::SeqCst), 0);
        assert_eq!(manager.connection_state(), ConnectionState::Connected);
    }

    #[tokio::test]
    async fn invalid_connect_listeners_fail_before_connecting() {
        let client = LoopbackClient::new();
        let manager = manager(&client);

        let result = manager
            .connect(Some(EventListeners::new().on("", |_, _| {})))
            .await;

        assert!(matches!(result, Err(RosterError::InvalidParameters(_))));
        assert!(!client.session().unwrap().is_connected());
    }

    #[tokio::test]
    async fn publisher_toggles_apply_to_camera_publishers_only() {
        let (client, _session, manager) = connected().await;
        let camera = manager
            .publish("camera", &PublisherProperties::default(), None, false)
            .await
            .unwrap();
        let screen_props = PublisherProperties {
            video_source: StreamRole::Screen,
            ..Default::default()
        };
        let screen = manager.publish("screen", &screen_props, None, false).await.unwrap();

        manager.enable_publisher_audio(false);
        manager.enable_publisher_video(false);

        let camera = client.publisher(&camera.id()).unwrap();
        let screen = client.publisher(&screen.id()).unwrap();
        assert!(!camera.is_publishing_audio());
        assert!(!camera.is_publishing_video());
        assert!(screen.is_publishing_audio());
        assert!(screen.is_publishing_video());
    }

    #[tokio::test]
    async fn subscriber_toggles_resolve_through_stream_map() {
        let (_client, session, manager) = connected().await;
        let stream = remote_stream("s1", StreamRole::Camera);
        session.add_remote_stream(stream.clone());
        let (toggled, on_toggled) = counter();
        let shared: Callback = Arc::new(on_toggled);
        let listeners: EventListeners = [("videoEnabled", shared.clone()), ("videoDisabled", shared)]
            .into_iter()
            .collect();
        manager
            .subscribe(&stream, "remote-1", &SubscriberProperties::default(), Some(listeners))
            .await
            .unwrap();

        manager.enable_subscriber_video("unknown", false);
        assert_eq!(toggled.load(Ordering::SeqCst), 0);

        manager.enable_subscriber_video("s1", false);
        manager.enable_subscriber_video("s1", false);
        manager.enable_subscriber_video("s1", true);
        assert_eq!(toggled.load(Ordering::SeqCst), 2);

        session.remove_remote_stream("s1");
        manager.enable_subscriber_video("s1", false);
        assert_eq!(toggled.load(Ordering::SeqCst), 2);
    }
}
