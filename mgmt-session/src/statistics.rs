//! Session statistics collection

/// Session statistics
///
/// Updated by the session while it runs; [`crate::BleSession::statistics`]
/// returns a snapshot.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SessionStatistics {
    /// Requests handed to the link
    pub requests_sent: u64,
    /// Responses delivered to a waiting request
    pub responses_received: u64,
    /// Inbound messages nobody was waiting for
    pub unmatched_responses: u64,
    /// Requests that timed out
    pub timeouts: u64,
    /// Inbound data that could not be decoded
    pub decode_errors: u64,
    /// Link disconnects observed
    pub disconnects: u64,
}

impl SessionStatistics {
    /// Create zeroed statistics
    pub fn new() -> Self {
        Self::default()
    }

    /// Reset all counters to zero
    pub fn clear(&mut self) {
        *self = Self::default();
    }

    pub fn increment_requests_sent(&mut self) {
        self.requests_sent += 1;
    }

    pub fn increment_responses_received(&mut self) {
        self.responses_received += 1;
    }

    pub fn increment_unmatched_responses(&mut self) {
        self.unmatched_responses += 1;
    }

    pub fn increment_timeouts(&mut self) {
        self.timeouts += 1;
    }

    pub fn increment_decode_errors(&mut self) {
        self.decode_errors += 1;
    }

    pub fn increment_disconnects(&mut self) {
        self.disconnects += 1;
    }
}
