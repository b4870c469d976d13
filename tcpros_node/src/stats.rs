//! Per-peer traffic counters and the snapshot shape exposed to the
//! external RPC facade.

use std::time::Instant;

/// Traffic counters for one peer of a subscription (a publisher URI) or
/// one client of a publication (an accepted socket).
#[derive(Debug, Clone, Default)]
pub struct PeerStats {
    pub uri: String,
    pub bytes: u64,
    pub messages: u64,
    /// Only meaningful on the publisher side: messages dropped because
    /// this client's output buffer was full.
    pub dropped: u64,
    pub last_active: Option<Instant>,
}

impl PeerStats {
    pub fn new(uri: impl Into<String>) -> Self {
        Self {
            uri: uri.into(),
            ..Default::default()
        }
    }

    pub fn record(&mut self, bytes: u64) {
        self.bytes += bytes;
        self.messages += 1;
        self.last_active = Some(Instant::now());
    }

    pub fn record_dropped(&mut self) {
        self.dropped += 1;
    }
}

/// Everything the RPC facade needs to display about one topic's
/// subscription or publication.
#[derive(Debug, Clone)]
pub struct TopicSnapshot {
    pub topic: String,
    pub topic_type: String,
    pub peers: Vec<PeerStats>,
}
