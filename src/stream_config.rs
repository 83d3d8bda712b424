//! Stream URL parsing and validation.
//!
//! A [`StreamConfiguration`] is the immutable description of one CLSP stream
//! target: scheme, host, port, stream name, and an optional access token.
//! Sessions never mutate a configuration; each source change constructs a
//! fresh one.

use std::fmt;

use serde::{Deserialize, Serialize};
use url::Url;

/// Default broker port for plain `clsp://` URLs.
pub const DEFAULT_PORT: u16 = 9001;

/// Default broker port for TLS `clsps://` URLs.
pub const DEFAULT_TLS_PORT: u16 = 443;

/// Errors produced while parsing a stream URL.
#[derive(Debug, Clone, thiserror::Error, PartialEq, Eq)]
pub enum StreamConfigurationError {
    /// The URL is not a recognizable CLSP stream target
    #[error("Invalid stream url: {reason}")]
    InvalidUrl {
        /// Human-readable description of what made the URL invalid
        reason: String,
    },
}

/// Result type for stream configuration operations
pub type StreamConfigurationResult<T> = Result<T, StreamConfigurationError>;

/// URL schemes recognized as CLSP stream targets.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ClspScheme {
    /// Plain MQTT-over-WebSocket
    Clsp,
    /// TLS MQTT-over-WebSocket
    Clsps,
    /// Plain transport with a hash-authenticated URL
    ClspHash,
    /// TLS transport with a hash-authenticated URL
    ClspsHash,
}

impl ClspScheme {
    /// Parses a URL scheme string into a CLSP scheme.
    pub fn parse(scheme: &str) -> Option<Self> {
        match scheme {
            "clsp" => Some(ClspScheme::Clsp),
            "clsps" => Some(ClspScheme::Clsps),
            "clsp-hash" => Some(ClspScheme::ClspHash),
            "clsps-hash" => Some(ClspScheme::ClspsHash),
            _ => None,
        }
    }

    /// Returns the scheme as it appears in a URL.
    pub fn as_str(self) -> &'static str {
        match self {
            ClspScheme::Clsp => "clsp",
            ClspScheme::Clsps => "clsps",
            ClspScheme::ClspHash => "clsp-hash",
            ClspScheme::ClspsHash => "clsps-hash",
        }
    }

    /// Returns true if this scheme rides on a TLS websocket.
    pub fn uses_tls(self) -> bool {
        matches!(self, ClspScheme::Clsps | ClspScheme::ClspsHash)
    }

    /// Returns the broker port implied when the URL carries none.
    pub fn default_port(self) -> u16 {
        if self.uses_tls() {
            DEFAULT_TLS_PORT
        } else {
            DEFAULT_PORT
        }
    }
}

impl fmt::Display for ClspScheme {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Immutable description of one CLSP stream target.
///
/// Two configurations compare equal iff every field is equal.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StreamConfiguration {
    scheme: ClspScheme,
    host: String,
    port: u16,
    stream_name: String,
    token: Option<String>,
}

impl StreamConfiguration {
    /// Parses a CLSP URL of the form `clsp[s][-hash]://host[:port]/streamName`.
    ///
    /// The optional `token` query parameter is carried opaquely to the
    /// transport.
    ///
    /// # Errors
    ///
    /// - `StreamConfigurationError::InvalidUrl` - Unrecognized scheme, empty
    ///   host, or missing stream name
    pub fn from_url(url: &str) -> StreamConfigurationResult<Self> {
        let parsed = Url::parse(url).map_err(|e| StreamConfigurationError::InvalidUrl {
            reason: e.to_string(),
        })?;

        let scheme = ClspScheme::parse(parsed.scheme()).ok_or_else(|| {
            StreamConfigurationError::InvalidUrl {
                reason: format!("unrecognized scheme: {}", parsed.scheme()),
            }
        })?;

        let host = parsed
            .host_str()
            .filter(|h| !h.is_empty())
            .ok_or_else(|| StreamConfigurationError::InvalidUrl {
                reason: "missing host".to_string(),
            })?
            .to_string();

        let port = parsed.port().unwrap_or_else(|| scheme.default_port());

        let stream_name = parsed.path().trim_matches('/').to_string();
        if stream_name.is_empty() {
            return Err(StreamConfigurationError::InvalidUrl {
                reason: "missing stream name".to_string(),
            });
        }

        let token = parsed
            .query_pairs()
            .find(|(key, _)| key == "token")
            .map(|(_, value)| value.into_owned());

        Ok(Self {
            scheme,
            host,
            port,
            stream_name,
            token,
        })
    }

    /// Serializes this configuration back into its canonical URL form.
    pub fn to_url(&self) -> String {
        let mut url = format!(
            "{}://{}:{}/{}",
            self.scheme, self.host, self.port, self.stream_name
        );
        if let Some(token) = &self.token {
            url.push_str("?token=");
            url.push_str(token);
        }
        url
    }

    /// Returns the URL scheme.
    pub fn scheme(&self) -> ClspScheme {
        self.scheme
    }

    /// Returns the broker host.
    pub fn host(&self) -> &str {
        &self.host
    }

    /// Returns the broker port.
    pub fn port(&self) -> u16 {
        self.port
    }

    /// Returns the stream name.
    pub fn stream_name(&self) -> &str {
        &self.stream_name
    }

    /// Returns true when the transport must use TLS.
    pub fn use_tls(&self) -> bool {
        self.scheme.uses_tls()
    }

    /// Returns the optional access token.
    pub fn token(&self) -> Option<&str> {
        self.token.as_deref()
    }
}

impl fmt::Display for StreamConfiguration {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_url())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_plain_url() {
        let config = StreamConfiguration::from_url("clsp://sfs.example.com/front-door").unwrap();
        assert_eq!(config.scheme(), ClspScheme::Clsp);
        assert_eq!(config.host(), "sfs.example.com");
        assert_eq!(config.port(), DEFAULT_PORT);
        assert_eq!(config.stream_name(), "front-door");
        assert!(!config.use_tls());
        assert_eq!(config.token(), None);
    }

    #[test]
    fn test_parse_tls_url_with_port_and_token() {
        let config =
            StreamConfiguration::from_url("clsps://sfs.example.com:8443/lobby?token=abc123")
                .unwrap();
        assert_eq!(config.scheme(), ClspScheme::Clsps);
        assert_eq!(config.port(), 8443);
        assert!(config.use_tls());
        assert_eq!(config.token(), Some("abc123"));
    }

    #[test]
    fn test_tls_default_port() {
        let config = StreamConfiguration::from_url("clsps://sfs.example.com/lobby").unwrap();
        assert_eq!(config.port(), DEFAULT_TLS_PORT);
    }

    #[test]
    fn test_reject_unknown_scheme() {
        let result = StreamConfiguration::from_url("rtsp://sfs.example.com/lobby");
        assert!(matches!(
            result,
            Err(StreamConfigurationError::InvalidUrl { .. })
        ));
    }

    #[test]
    fn test_reject_missing_stream_name() {
        let result = StreamConfiguration::from_url("clsp://sfs.example.com/");
        assert!(matches!(
            result,
            Err(StreamConfigurationError::InvalidUrl { .. })
        ));
    }

    #[test]
    fn test_reject_not_a_url() {
        let result = StreamConfiguration::from_url("not a url");
        assert!(matches!(
            result,
            Err(StreamConfigurationError::InvalidUrl { .. })
        ));
    }

    #[test]
    fn test_url_round_trip() {
        for url in [
            "clsp://sfs.example.com:9001/front-door",
            "clsps://sfs.example.com:443/lobby?token=abc123",
            "clsps-hash://sfs.example.com:443/yard",
        ] {
            let config = StreamConfiguration::from_url(url).unwrap();
            assert_eq!(config.to_url(), url);
            assert_eq!(StreamConfiguration::from_url(&config.to_url()).unwrap(), config);
        }
    }

    #[test]
    fn test_equality_is_field_wise() {
        let a = StreamConfiguration::from_url("clsp://sfs/stream-a").unwrap();
        let b = StreamConfiguration::from_url("clsp://sfs/stream-a").unwrap();
        let c = StreamConfiguration::from_url("clsp://sfs/stream-b").unwrap();
        assert_eq!(a, b);
        assert_ne!(a, c);
    }
}
