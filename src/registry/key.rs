//! Stream identity

/// Unique identifier for a stream: vhost, app and stream name
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct StreamKey {
    /// Virtual host (e.g., "__defaultVhost__" or "live.example.com")
    pub vhost: String,
    /// Application name (e.g., "live")
    pub app: String,
    /// Stream name (e.g., "stream_key_123")
    pub stream: String,
}

impl StreamKey {
    pub fn new(
        vhost: impl Into<String>,
        app: impl Into<String>,
        stream: impl Into<String>,
    ) -> Self {
        Self {
            vhost: vhost.into(),
            app: app.into(),
            stream: stream.into(),
        }
    }
}

impl std::fmt::Display for StreamKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}/{}", self.vhost, self.app, self.stream)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    #[test]
    fn test_display() {
        let key = StreamKey::new("localhost", "live", "cam1");
        assert_eq!(key.to_string(), "localhost/live/cam1");
    }

    #[test]
    fn test_vhost_distinguishes_streams() {
        let mut keys = HashSet::new();
        keys.insert(StreamKey::new("a.example.com", "live", "cam1"));
        keys.insert(StreamKey::new("b.example.com", "live", "cam1"));
        keys.insert(StreamKey::new("a.example.com", "live", "cam1"));
        assert_eq!(keys.len(), 2);
    }
}
