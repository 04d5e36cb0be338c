use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::errors::RosterError;

/// Classification of a media stream. Recorded once per stream and never changed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StreamRole {
    Camera,
    Screen,
}

impl StreamRole {
    pub const ALL: [StreamRole; 2] = [StreamRole::Camera, StreamRole::Screen];

    /// Map a transport `videoType` onto a role.
    ///
    /// Audio-only streams carry no video type and count as camera streams.
    pub fn from_video_type(video_type: Option<&str>) -> Result<Self, RosterError> {
        match video_type {
            None => Ok(StreamRole::Camera),
            Some(v) => v.parse(),
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            StreamRole::Camera => "camera",
            StreamRole::Screen => "screen",
        }
    }
}

impl FromStr for StreamRole {
    type Err = RosterError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "camera" => Ok(StreamRole::Camera),
            "screen" => Ok(StreamRole::Screen),
            other => Err(RosterError::UnknownVideoType(other.to_string())),
        }
    }
}

impl fmt::Display for StreamRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A participant's connection to the session.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Connection {
    pub connection_id: String,
    #[serde(default = "Utc::now")]
    pub creation_time: DateTime<Utc>,
    /// Opaque data attached to the participant's token.
    #[serde(default)]
    pub data: String,
}

impl Connection {
    pub fn new(connection_id: impl Into<String>) -> Self {
        Self {
            connection_id: connection_id.into(),
            creation_time: Utc::now(),
            data: String::new(),
        }
    }
}

/// Descriptor of a media stream published into the session.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Stream {
    pub stream_id: String,
    pub role: StreamRole,
    pub connection: Connection,
    #[serde(default)]
    pub name: String,
    pub has_audio: bool,
    pub has_video: bool,
    pub creation_time: DateTime<Utc>,
}

impl Stream {
    pub fn new(stream_id: impl Into<String>, role: StreamRole, connection: Connection) -> Self {
        Self {
            stream_id: stream_id.into(),
            role,
            connection,
            name: String::new(),
            has_audio: true,
            has_video: true,
            creation_time: Utc::now(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PublisherProperties {
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default = "default_video_source")]
    pub video_source: StreamRole,
    #[serde(default = "default_true")]
    pub publish_audio: bool,
    #[serde(default = "default_true")]
    pub publish_video: bool,
    #[serde(default)]
    pub resolution: Option<String>,
    #[serde(default)]
    pub frame_rate: Option<u32>,
}

fn default_true() -> bool {
    true
}

fn default_video_source() -> StreamRole {
    StreamRole::Camera
}

impl Default for PublisherProperties {
    fn default() -> Self {
        Self {
            name: None,
            video_source: StreamRole::Camera,
            publish_audio: true,
            publish_video: true,
            resolution: None,
            frame_rate: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SubscriberProperties {
    #[serde(default = "default_true")]
    pub subscribe_to_audio: bool,
    #[serde(default = "default_true")]
    pub subscribe_to_video: bool,
    #[serde(default)]
    pub preferred_resolution: Option<String>,
    #[serde(default)]
    pub preferred_frame_rate: Option<u32>,
}

impl Default for SubscriberProperties {
    fn default() -> Self {
        Self {
            subscribe_to_audio: true,
            subscribe_to_video: true,
            preferred_resolution: None,
            preferred_frame_rate: None,
        }
    }
}

/// A stream as the transport reports it, before its video type is checked.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StreamRecord {
    pub stream_id: String,
    /// Absent for audio-only streams.
    #[serde(default)]
    pub video_type: Option<String>,
    pub connection: Connection,
    #[serde(default)]
    pub name: String,
    #[serde(default = "default_true")]
    pub has_audio: bool,
    #[serde(default = "default_true")]
    pub has_video: bool,
    #[serde(default = "Utc::now")]
    pub creation_time: DateTime<Utc>,
}

impl TryFrom<StreamRecord> for Stream {
    type Error = RosterError;

    fn try_from(record: StreamRecord) -> Result<Self, Self::Error> {
        Ok(Stream {
            role: StreamRole::from_video_type(record.video_type.as_deref())?,
            stream_id: record.stream_id,
            connection: record.connection,
            name: record.name,
            has_audio: record.has_audio,
            has_video: record.has_video,
            creation_time: record.creation_time,
        })
    }
}

/// Out-of-band message handed to the session's signaling channel.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SignalEnvelope {
    #[serde(rename = "type")]
    pub kind: String,
    pub data: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub to: Option<Connection>,
}
