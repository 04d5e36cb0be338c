//! Roster core: local bookkeeping for a real-time video session.
//!
//! Mirrors the publishers, subscribers and streams of a session client into a
//! queryable snapshot and forwards session operations to that client. The
//! client itself is external and reached only through the traits in [`client`].

pub mod auth;
pub mod client;
pub mod config;
pub mod errors;
pub mod events;
pub mod loopback;
pub mod model;
pub mod participants;
pub mod session;

pub use auth::CredentialsService;
pub use client::{Publisher, Session, SessionClient, Subscriber};
pub use config::{Credentials, RosterConfig};
pub use errors::{RosterError, TransportError};
pub use events::{ConnectionState, EventKind, EventListeners, SessionEvent};
pub use model::{
    Connection, PublisherProperties, Stream, StreamRecord, StreamRole, SubscriberProperties,
};
pub use participants::{ParticipantStore, Snapshot};
pub use session::SessionManager;
