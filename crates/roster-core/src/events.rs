use std::fmt;
use std::str::FromStr;
use std::sync::{Arc, PoisonError, RwLock};

use uuid::Uuid;

use crate::errors::RosterError;
use crate::model::{Connection, Stream};
use crate::session::SessionManager;

/// Lifecycle events delivered by the session client and its publishers/subscribers.
#[derive(Debug, Clone, PartialEq)]
pub enum SessionEvent {
    StreamCreated(Stream),
    StreamDestroyed { stream: Stream, reason: String },
    SessionConnected,
    SessionDisconnected { reason: String },
    SessionReconnecting,
    SessionReconnected,
    ConnectionCreated(Connection),
    ConnectionDestroyed { connection: Connection, reason: String },
    Signal {
        kind: String,
        data: String,
        from: Option<Connection>,
    },
    AccessAllowed,
    AccessDenied,
    VideoEnabled { reason: String },
    VideoDisabled { reason: String },
    Destroyed { reason: String },
    /// Any other event the transport delivers, passed through by name.
    Other {
        name: String,
        payload: serde_json::Value,
    },
}

impl SessionEvent {
    pub fn kind(&self) -> EventKind {
        match self {
            SessionEvent::StreamCreated(_) => EventKind::StreamCreated,
            SessionEvent::StreamDestroyed { .. } => EventKind::StreamDestroyed,
            SessionEvent::SessionConnected => EventKind::SessionConnected,
            SessionEvent::SessionDisconnected { .. } => EventKind::SessionDisconnected,
            SessionEvent::SessionReconnecting => EventKind::SessionReconnecting,
            SessionEvent::SessionReconnected => EventKind::SessionReconnected,
            SessionEvent::ConnectionCreated(_) => EventKind::ConnectionCreated,
            SessionEvent::ConnectionDestroyed { .. } => EventKind::ConnectionDestroyed,
            SessionEvent::Signal { kind, .. } => EventKind::Signal(Some(kind.clone())),
            SessionEvent::AccessAllowed => EventKind::AccessAllowed,
            SessionEvent::AccessDenied => EventKind::AccessDenied,
            SessionEvent::VideoEnabled { .. } => EventKind::VideoEnabled,
            SessionEvent::VideoDisabled { .. } => EventKind::VideoDisabled,
            SessionEvent::Destroyed { .. } => EventKind::Destroyed,
            SessionEvent::Other { name, .. } => EventKind::Other(name.clone()),
        }
    }

    /// Whether a handler bound to `kind` should see this event.
    ///
    /// A plain `signal` binding receives every signal; `signal:<type>` only
    /// receives signals of that type.
    pub fn matches(&self, kind: &EventKind) -> bool {
        match (self, kind) {
            (SessionEvent::Signal { .. }, EventKind::Signal(None)) => true,
            (SessionEvent::Signal { kind: sent, .. }, EventKind::Signal(Some(wanted))) => {
                sent == wanted
            }
            _ => self.kind() == *kind,
        }
    }
}

/// Closed set of event names a handler can be bound to.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum EventKind {
    StreamCreated,
    StreamDestroyed,
    SessionConnected,
    SessionDisconnected,
    SessionReconnecting,
    SessionReconnected,
    ConnectionCreated,
    ConnectionDestroyed,
    Signal(Option<String>),
    AccessAllowed,
    AccessDenied,
    VideoEnabled,
    VideoDisabled,
    Destroyed,
    /// A name outside the set above, bound as-is.
    Other(String),
}

impl FromStr for EventKind {
    type Err = RosterError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let kind = match s {
            "streamCreated" => EventKind::StreamCreated,
            "streamDestroyed" => EventKind::StreamDestroyed,
            "sessionConnected" => EventKind::SessionConnected,
            "sessionDisconnected" => EventKind::SessionDisconnected,
            "sessionReconnecting" => EventKind::SessionReconnecting,
            "sessionReconnected" => EventKind::SessionReconnected,
            "connectionCreated" => EventKind::ConnectionCreated,
            "connectionDestroyed" => EventKind::ConnectionDestroyed,
            "signal" => EventKind::Signal(None),
            "accessAllowed" => EventKind::AccessAllowed,
            "accessDenied" => EventKind::AccessDenied,
            "videoEnabled" => EventKind::VideoEnabled,
            "videoDisabled" => EventKind::VideoDisabled,
            "destroyed" => EventKind::Destroyed,
            other if other.trim().is_empty() => {
                return Err(RosterError::InvalidParameters(
                    "event name is empty".to_string(),
                ));
            }
            other => match other.strip_prefix("signal:") {
                Some("") => {
                    return Err(RosterError::InvalidParameters(
                        "signal binding 'signal:' names no signal type".to_string(),
                    ));
                }
                Some(signal_type) => EventKind::Signal(Some(signal_type.to_string())),
                None => EventKind::Other(other.to_string()),
            },
        };
        Ok(kind)
    }
}

impl fmt::Display for EventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            EventKind::StreamCreated => "streamCreated",
            EventKind::StreamDestroyed => "streamDestroyed",
            EventKind::SessionConnected => "sessionConnected",
            EventKind::SessionDisconnected => "sessionDisconnected",
            EventKind::SessionReconnecting => "sessionReconnecting",
            EventKind::SessionReconnected => "sessionReconnected",
            EventKind::ConnectionCreated => "connectionCreated",
            EventKind::ConnectionDestroyed => "connectionDestroyed",
            EventKind::Signal(None) => "signal",
            EventKind::Signal(Some(signal_type)) => return write!(f, "signal:{signal_type}"),
            EventKind::AccessAllowed => "accessAllowed",
            EventKind::AccessDenied => "accessDenied",
            EventKind::VideoEnabled => "videoEnabled",
            EventKind::VideoDisabled => "videoDisabled",
            EventKind::Destroyed => "destroyed",
            EventKind::Other(name) => name,
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    Reconnecting { attempt: u32 },
}

/// Handler invoked by an [`EventSource`] for every matching event.
pub type EventHandler = Arc<dyn Fn(&SessionEvent) + Send + Sync>;

/// Identifies one binding made on an [`EventSource`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriptionHandle(Uuid);

impl SubscriptionHandle {
    fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

/// What to remove from an [`EventSource`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Unsubscribe {
    Handle(SubscriptionHandle),
    Event(EventKind),
    All,
}

/// Anything that delivers named lifecycle events: sessions, publishers, subscribers.
pub trait EventSource: Send + Sync {
    fn on(&self, kind: EventKind, handler: EventHandler) -> SubscriptionHandle;
    fn off(&self, target: Unsubscribe);
}

struct Binding {
    handle: SubscriptionHandle,
    kind: EventKind,
    handler: EventHandler,
}

/// In-process event bus dispatching to handlers in registration order.
#[derive(Clone, Default)]
pub struct EventBus {
    bindings: Arc<RwLock<Vec<Binding>>>,
}

impl EventBus {
    pub fn new() -> Self {
        Self::default()
    }

    /// Deliver `event` to every matching handler.
    ///
    /// Handlers are collected before any of them runs, so a handler may bind
    /// or unbind without deadlocking; such changes apply from the next event.
    pub fn emit(&self, event: &SessionEvent) {
        let handlers: Vec<EventHandler> = self
            .bindings
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .filter(|b| event.matches(&b.kind))
            .map(|b| b.handler.clone())
            .collect();
        tracing::trace!(event = %event.kind(), handlers = handlers.len(), "dispatching event");
        for handler in handlers {
            handler(event);
        }
    }

    pub fn binding_count(&self) -> usize {
        self.bindings
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }
}

impl EventSource for EventBus {
    fn on(&self, kind: EventKind, handler: EventHandler) -> SubscriptionHandle {
        let handle = SubscriptionHandle::new();
        self.bindings
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .push(Binding {
                handle,
                kind,
                handler,
            });
        handle
    }

    fn off(&self, target: Unsubscribe) {
        let mut bindings = self.bindings.write().unwrap_or_else(PoisonError::into_inner);
        match target {
            Unsubscribe::Handle(handle) => bindings.retain(|b| b.handle != handle),
            Unsubscribe::Event(kind) => bindings.retain(|b| b.kind != kind),
            Unsubscribe::All => bindings.clear(),
        }
    }
}

/// Caller callback. Runs with the owning [`SessionManager`] as its context.
pub type Callback = Arc<dyn Fn(&SessionManager, &SessionEvent) + Send + Sync>;

/// Ordered list of event name → callback pairs supplied by callers.
#[derive(Clone, Default)]
pub struct EventListeners {
    entries: Vec<(String, Callback)>,
}

impl EventListeners {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn on<F>(mut self, event: impl Into<String>, callback: F) -> Self
    where
        F: Fn(&SessionManager, &SessionEvent) + Send + Sync + 'static,
    {
        self.entries.push((event.into(), Arc::new(callback)));
        self
    }

    pub fn push(&mut self, event: impl Into<String>, callback: Callback) {
        self.entries.push((event.into(), callback));
    }

    /// Append another list, keeping its order after the current entries.
    pub fn chain(mut self, other: EventListeners) -> Self {
        self.entries.extend(other.entries);
        self
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Parse every event name. Fails as a whole if any name is invalid.
    pub(crate) fn resolve(&self) -> Result<Vec<(EventKind, Callback)>, RosterError> {
        self.entries
            .iter()
            .map(|(name, callback)| Ok((name.parse::<EventKind>()?, callback.clone())))
            .collect()
    }
}

impl<S: Into<String>> FromIterator<(S, Callback)> for EventListeners {
    fn from_iter<I: IntoIterator<Item = (S, Callback)>>(iter: I) -> Self {
        Self {
            entries: iter.into_iter().map(|(name, cb)| (name.into(), cb)).collect(),
        }
    }
}

impl fmt::Debug for EventListeners {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_list()
            .entries(self.entries.iter().map(|(name, _)| name))
            .finish()
    }
}
