use std::time::Duration;

/// Timing and paging knobs for the sync engine.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SyncConfig {
    /// Unconditional reconciliation period for every mounted room.
    pub safety_poll_interval: Duration,
    /// Delay before the single resubscribe attempt after a timeout.
    pub resubscribe_delay: Duration,
    pub page_size: u32,
    pub unread_poll_interval: Duration,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            safety_poll_interval: Duration::from_secs(10),
            resubscribe_delay: Duration::from_secs(2),
            page_size: 50,
            unread_poll_interval: Duration::from_secs(30),
        }
    }
}
