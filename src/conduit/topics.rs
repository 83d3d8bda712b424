//! Topic derivation for one negotiated stream.
//!
//! The play handshake happens on fixed topics; everything afterwards rides
//! on topics derived from the guid the server assigns to the session.

/// Fixed topic play requests are published to.
pub const PLAY_REQUEST_TOPIC: &str = "iov/video/play";

/// Per-client topic the server answers play requests on.
pub fn response_topic(client_id: &str) -> String {
    format!("{client_id}/response")
}

/// The guid-derived topics of one negotiated stream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StreamTopics {
    /// Inbound init and media segments
    pub media: String,
    /// Outbound resync requests when the feeder falls behind
    pub resync: String,
    /// Outbound stop request on teardown
    pub stop: String,
}

impl StreamTopics {
    /// Derives the topic set for a server-assigned stream guid.
    pub fn for_guid(guid: &str) -> Self {
        Self {
            media: format!("iov/video/{guid}/live"),
            resync: format!("iov/video/{guid}/resync"),
            stop: format!("iov/video/{guid}/stop"),
        }
    }

    /// Returns every topic in the set, for bulk unsubscription.
    pub fn all(&self) -> [&str; 3] {
        [&self.media, &self.resync, &self.stop]
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_guid_derivation() {
        let topics = StreamTopics::for_guid("abc-123");
        assert_eq!(topics.media, "iov/video/abc-123/live");
        assert_eq!(topics.resync, "iov/video/abc-123/resync");
        assert_eq!(topics.stop, "iov/video/abc-123/stop");
    }

    #[test]
    fn test_response_topic_is_per_client() {
        assert_eq!(response_topic("clsp-42"), "clsp-42/response");
    }
}
