use std::fmt;
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::errors::RosterError;
use crate::model::{PublisherProperties, SubscriberProperties};

/// What it takes to join one session.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Credentials {
    pub api_key: String,
    pub session_id: String,
    pub token: String,
}

impl Credentials {
    pub fn new(
        api_key: impl Into<String>,
        session_id: impl Into<String>,
        token: impl Into<String>,
    ) -> Self {
        Self {
            api_key: api_key.into(),
            session_id: session_id.into(),
            token: token.into(),
        }
    }

    pub fn from_json(json: &str) -> Result<Self, RosterError> {
        serde_json::from_str(json)
            .map_err(|e| RosterError::Config(format!("invalid credentials: {e}")))
    }
}

// The token grants access to the session; keep it out of logs.
impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credentials")
            .field("api_key", &self.api_key)
            .field("session_id", &self.session_id)
            .field("token", &"<redacted>")
            .finish()
    }
}

/// On-disk configuration: credentials plus default media properties.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RosterConfig {
    pub credentials: Credentials,
    #[serde(default)]
    pub publisher: PublisherProperties,
    #[serde(default)]
    pub subscriber: SubscriberProperties,
}

impl RosterConfig {
    pub fn new(credentials: Credentials) -> Self {
        Self {
            credentials,
            publisher: PublisherProperties::default(),
            subscriber: SubscriberProperties::default(),
        }
    }

    /// Read a config file. Unlike plain settings there is nothing sensible to
    /// fall back to, so a missing or corrupt file is an error.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, RosterError> {
        let path = path.as_ref();
        let contents = std::fs::read_to_string(path)
            .map_err(|e| RosterError::Config(format!("cannot read {}: {e}", path.display())))?;
        serde_json::from_str(&contents)
            .map_err(|e| RosterError::Config(format!("invalid config {}: {e}", path.display())))
    }

    pub fn save(&self, path: impl AsRef<Path>) -> Result<(), RosterError> {
        let path = path.as_ref();
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| {
                RosterError::Config(format!("cannot create {}: {e}", parent.display()))
            })?;
        }
        let json = serde_json::to_string_pretty(self)?;
        std::fs::write(path, json)
            .map_err(|e| RosterError::Config(format!("cannot write {}: {e}", path.display())))
    }
}
