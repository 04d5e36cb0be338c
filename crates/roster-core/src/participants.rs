use std::collections::BTreeMap;
use std::sync::Arc;

use serde::Serialize;

use crate::client::{Publisher, Subscriber};
use crate::errors::RosterError;
use crate::model::{Stream, StreamRole};

/// Records partitioned by stream role, keyed by id.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ByRole<T> {
    pub camera: BTreeMap<String, T>,
    pub screen: BTreeMap<String, T>,
}

impl<T> Default for ByRole<T> {
    fn default() -> Self {
        Self {
            camera: BTreeMap::new(),
            screen: BTreeMap::new(),
        }
    }
}

impl<T> ByRole<T> {
    pub fn get(&self, role: StreamRole) -> &BTreeMap<String, T> {
        match role {
            StreamRole::Camera => &self.camera,
            StreamRole::Screen => &self.screen,
        }
    }

    fn get_mut(&mut self, role: StreamRole) -> &mut BTreeMap<String, T> {
        match role {
            StreamRole::Camera => &mut self.camera,
            StreamRole::Screen => &mut self.screen,
        }
    }

    /// Role partition holding `id`, if any.
    pub fn role_of(&self, id: &str) -> Option<StreamRole> {
        StreamRole::ALL
            .into_iter()
            .find(|role| self.get(*role).contains_key(id))
    }

    pub fn counts(&self) -> RoleCounts {
        RoleCounts {
            camera: self.camera.len(),
            screen: self.screen.len(),
            total: self.camera.len() + self.screen.len(),
        }
    }

    fn map<U>(&self, f: impl Fn(StreamRole, &T) -> U) -> ByRole<U> {
        ByRole {
            camera: self
                .camera
                .iter()
                .map(|(id, v)| (id.clone(), f(StreamRole::Camera, v)))
                .collect(),
            screen: self
                .screen
                .iter()
                .map(|(id, v)| (id.clone(), f(StreamRole::Screen, v)))
                .collect(),
        }
    }

    fn clear(&mut self) {
        self.camera.clear();
        self.screen.clear();
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct RoleCounts {
    pub camera: usize,
    pub screen: usize,
    pub total: usize,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct Meta {
    pub streams: RoleCounts,
    pub publishers: RoleCounts,
    pub subscribers: RoleCounts,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PublisherInfo {
    pub id: String,
    pub role: StreamRole,
    pub stream_id: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SubscriberInfo {
    pub id: String,
    pub role: StreamRole,
    pub stream_id: String,
}

/// Owned view of the store at one point in time.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Snapshot {
    pub streams: ByRole<Stream>,
    pub stream_map: BTreeMap<String, String>,
    pub publishers: ByRole<PublisherInfo>,
    pub subscribers: ByRole<SubscriberInfo>,
    pub meta: Meta,
}

/// Tracks the publishers, subscribers and streams of the current session.
///
/// Updated by session events and by the outcome of local operations. Every
/// mutator tolerates missing or duplicate keys, since remote events routinely
/// arrive after local cleanup.
#[derive(Default)]
pub struct ParticipantStore {
    streams: ByRole<Stream>,
    publishers: ByRole<Arc<dyn Publisher>>,
    subscribers: ByRole<Arc<dyn Subscriber>>,
    /// stream id -> local publisher/subscriber id
    stream_map: BTreeMap<String, String>,
}

impl ParticipantStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a stream, replacing any earlier record with the same id.
    ///
    /// A stream keeps the role it was first recorded with; a re-add under a
    /// different role is refused and the existing record is left untouched.
    pub fn add_stream(&mut self, stream: &Stream) -> Result<(), RosterError> {
        if let Some(recorded) = self.streams.role_of(&stream.stream_id) {
            if recorded != stream.role {
                return Err(RosterError::RoleConflict {
                    stream_id: stream.stream_id.clone(),
                    recorded,
                    observed: stream.role,
                });
            }
        }
        self.streams
            .get_mut(stream.role)
            .insert(stream.stream_id.clone(), stream.clone());
        Ok(())
    }

    pub fn remove_stream(&mut self, stream_id: &str) {
        if let Some(role) = self.streams.role_of(stream_id) {
            self.streams.get_mut(role).remove(stream_id);
        }
        self.stream_map.remove(stream_id);
    }

    pub fn add_publisher(&mut self, role: StreamRole, publisher: Arc<dyn Publisher>) {
        let id = publisher.id();
        if let Some(stream) = publisher.stream() {
            self.stream_map.insert(stream.stream_id, id.clone());
        }
        self.publishers.get_mut(role).insert(id, publisher);
    }

    pub fn remove_publisher(&mut self, role: StreamRole, publisher_id: &str) {
        self.publishers.get_mut(role).remove(publisher_id);
        self.stream_map.retain(|_, owner| owner.as_str() != publisher_id);
    }

    /// Record a subscriber under the role of the stream it consumes.
    ///
    /// The role recorded for that stream wins over the one the subscriber
    /// reports; the reported role is used only for streams not yet recorded.
    pub fn add_subscriber(&mut self, subscriber: Arc<dyn Subscriber>) {
        let id = subscriber.id();
        let stream = subscriber.stream();
        let role = self.recorded_role(&stream.stream_id).unwrap_or(stream.role);
        self.stream_map.insert(stream.stream_id, id.clone());
        self.subscribers.get_mut(role).insert(id, subscriber);
    }

    pub fn remove_subscriber(&mut self, subscriber_id: &str) {
        if let Some(role) = self.subscribers.role_of(subscriber_id) {
            self.subscribers.get_mut(role).remove(subscriber_id);
        }
        self.stream_map.retain(|_, owner| owner.as_str() != subscriber_id);
    }

    /// Role a stream was first recorded with.
    pub fn recorded_role(&self, stream_id: &str) -> Option<StreamRole> {
        self.streams.role_of(stream_id)
    }

    pub fn stream(&self, stream_id: &str) -> Option<&Stream> {
        let role = self.streams.role_of(stream_id)?;
        self.streams.get(role).get(stream_id)
    }

    pub fn publishers(&self, role: StreamRole) -> Vec<Arc<dyn Publisher>> {
        self.publishers.get(role).values().cloned().collect()
    }

    /// The local subscriber consuming `stream_id`, resolved through the stream map.
    pub fn subscriber_for_stream(&self, stream_id: &str) -> Option<Arc<dyn Subscriber>> {
        let subscriber_id = self.stream_map.get(stream_id)?;
        let role = self.subscribers.role_of(subscriber_id)?;
        self.subscribers.get(role).get(subscriber_id).cloned()
    }

    pub fn all(&self) -> Snapshot {
        Snapshot {
            streams: self.streams.clone(),
            stream_map: self.stream_map.clone(),
            publishers: self.publishers.map(|role, p| PublisherInfo {
                id: p.id(),
                role,
                stream_id: p.stream().map(|s| s.stream_id),
            }),
            subscribers: self.subscribers.map(|role, s| SubscriberInfo {
                id: s.id(),
                role,
                stream_id: s.stream().stream_id,
            }),
            meta: Meta {
                streams: self.streams.counts(),
                publishers: self.publishers.counts(),
                subscribers: self.subscribers.counts(),
            },
        }
    }

    pub fn reset(&mut self) {
        self.streams.clear();
        self.publishers.clear();
        self.subscribers.clear();
        self.stream_map.clear();
    }
}
