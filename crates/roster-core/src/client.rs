//! Capability interface of the external video-session client.
//!
//! The session client reports the outcome of every asynchronous operation
//! through a one-shot completion callback. [`completion`] and [`complete`]
//! turn those callbacks into futures so callers can `.await` them.

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};

use futures_util::FutureExt;
use tokio::sync::oneshot;

use crate::errors::TransportError;
use crate::events::EventSource;
use crate::model::{
    Connection, PublisherProperties, SignalEnvelope, Stream, SubscriberProperties,
};

/// One-shot completion callback handed to the session client.
pub type Completion<T = ()> = Box<dyn FnOnce(Result<T, TransportError>) + Send + 'static>;

/// Entry point of the external client.
pub trait SessionClient: Send + Sync {
    fn init_session(&self, api_key: &str, session_id: &str) -> Arc<dyn Session>;

    /// Create a local publisher. `done` fires once media access is granted or refused.
    fn init_publisher(
        &self,
        target: &str,
        properties: &PublisherProperties,
        done: Completion,
    ) -> Arc<dyn Publisher>;
}

pub trait Session: EventSource {
    /// Our own connection, once connected.
    fn connection(&self) -> Option<Connection>;
    fn connect(&self, token: &str, done: Completion);
    fn disconnect(&self);
    fn publish(&self, publisher: Arc<dyn Publisher>, done: Completion);
    fn unpublish(&self, publisher: &Arc<dyn Publisher>);
    fn subscribe(
        &self,
        stream: &Stream,
        container: &str,
        properties: &SubscriberProperties,
        done: Completion,
    ) -> Arc<dyn Subscriber>;
    fn unsubscribe(&self, subscriber: &Arc<dyn Subscriber>);
    fn signal(&self, envelope: SignalEnvelope, done: Completion);
    fn force_disconnect(&self, connection: &Connection, done: Completion);
    fn force_unpublish(&self, stream: &Stream, done: Completion);
}

pub trait Publisher: EventSource {
    fn id(&self) -> String;
    /// The outbound stream, present once the publisher has joined a session.
    fn stream(&self) -> Option<Stream>;
    fn publish_audio(&self, enabled: bool);
    fn publish_video(&self, enabled: bool);
}

pub trait Subscriber: EventSource {
    fn id(&self) -> String;
    fn stream(&self) -> Stream;
    fn subscribe_to_audio(&self, enabled: bool);
    fn subscribe_to_video(&self, enabled: bool);
}

/// Future side of a [`Completion`].
#[must_use = "a pending completion does nothing unless awaited"]
pub struct Pending<T> {
    rx: oneshot::Receiver<Result<T, TransportError>>,
}

impl<T> Future for Pending<T> {
    type Output = Result<T, TransportError>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        self.rx
            .poll_unpin(cx)
            .map(|received| received.unwrap_or_else(|_| Err(TransportError::completion_dropped())))
    }
}

/// Create a linked completion callback and the future it resolves.
pub fn completion<T: Send + 'static>() -> (Completion<T>, Pending<T>) {
    let (tx, rx) = oneshot::channel();
    let done: Completion<T> = Box::new(move |result| {
        // Receiver gone means the caller stopped waiting.
        let _ = tx.send(result);
    });
    (done, Pending { rx })
}

/// Run a callback-style operation and await its completion.
pub async fn complete<T, F>(start: F) -> Result<T, TransportError>
where
    T: Send + 'static,
    F: FnOnce(Completion<T>),
{
    let (done, pending) = completion();
    start(done);
    pending.await
}
