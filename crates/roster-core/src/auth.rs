use url::Url;

use crate::config::Credentials;
use crate::errors::RosterError;

/// Requests session credentials for a room from an HTTP endpoint.
pub struct CredentialsService;

impl CredentialsService {
    /// GET `<endpoint>/room/<room>` and parse the `{apiKey, sessionId, token}` body.
    pub async fn request(endpoint: &str, room: &str) -> Result<Credentials, RosterError> {
        let url = Self::room_url(endpoint, room)?;

        tracing::info!("requesting session credentials from {}", url);

        let resp = reqwest::get(url.as_str())
            .await
            .map_err(|e| RosterError::Http(e.to_string()))?;

        if !resp.status().is_success() {
            return Err(RosterError::Auth(format!(
                "credentials endpoint returned status {}",
                resp.status()
            )));
        }

        resp.json::<Credentials>()
            .await
            .map_err(|e| RosterError::Auth(format!("invalid credentials response: {e}")))
    }

    /// Build the credentials URL for `room`.
    ///
    /// `endpoint` must be an absolute http(s) URL and may carry a base path,
    /// e.g. `https://example.com/api` gives `https://example.com/api/room/<room>`.
    pub fn room_url(endpoint: &str, room: &str) -> Result<Url, RosterError> {
        let room = room.trim();
        if room.is_empty() {
            return Err(RosterError::InvalidUrl("room name is empty".to_string()));
        }

        let mut url = Url::parse(endpoint.trim())
            .map_err(|e| RosterError::InvalidUrl(format!("invalid endpoint '{endpoint}': {e}")))?;
        if !matches!(url.scheme(), "http" | "https") {
            return Err(RosterError::InvalidUrl(format!(
                "endpoint must be http or https, got '{}'",
                url.scheme()
            )));
        }

        let path = format!(
            "{}/room/{}",
            url.path().trim_end_matches('/'),
            urlencoding::encode(room)
        );
        url.set_path(&path);
        url.set_query(None);
        Ok(url)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn room_url_on_bare_host() {
        let url = CredentialsService::room_url("https://creds.example.com", "standup").unwrap();
        assert_eq!(url.as_str(), "https://creds.example.com/room/standup");
    }

    #[test]
    fn room_url_keeps_base_path() {
        let url = CredentialsService::room_url("https://example.com/api/", "standup").unwrap();
        assert_eq!(url.as_str(), "https://example.com/api/room/standup");
    }

    #[test]
    fn room_url_encodes_room() {
        let url = CredentialsService::room_url("http://localhost:8080", " my room/1 ").unwrap();
        assert_eq!(url.as_str(), "http://localhost:8080/room/my%20room%2F1");
    }

    #[test]
    fn room_url_rejects_relative_endpoint() {
        let err = CredentialsService::room_url("creds.example.com", "standup").unwrap_err();
        assert!(matches!(err, RosterError::InvalidUrl(_)));
    }

    #[test]
    fn room_url_rejects_other_schemes() {
        let err = CredentialsService::room_url("ftp://creds.example.com", "standup").unwrap_err();
        assert!(matches!(err, RosterError::InvalidUrl(_)));
    }

    #[test]
    fn room_url_rejects_empty_room() {
        let err = CredentialsService::room_url("https://creds.example.com", "  ").unwrap_err();
        assert!(matches!(err, RosterError::InvalidUrl(_)));
    }

    #[tokio::test]
    async fn request_with_invalid_endpoint_fails_before_sending() {
        let err = CredentialsService::request("not a url", "standup").await.unwrap_err();
        assert!(matches!(err, RosterError::InvalidUrl(_)));
    }
}
