use std::collections::HashMap;

use shared::domain::{RoomId, UnreadCount};

/// Advisory unread and mention counters keyed by channel.
#[derive(Debug, Clone, Default)]
pub struct UnreadTracker {
    counts: HashMap<RoomId, UnreadCount>,
}

impl UnreadTracker {
    pub fn replace_all(&mut self, counts: Vec<UnreadCount>) {
        self.counts = counts.into_iter().map(|c| (c.channel_id, c)).collect();
    }

    pub fn get(&self, channel_id: RoomId) -> Option<UnreadCount> {
        self.counts.get(&channel_id).copied()
    }

    pub fn snapshot(&self) -> HashMap<RoomId, UnreadCount> {
        self.counts.clone()
    }

    /// Zeroes the channel locally ahead of the next refresh.
    pub fn mark_read(&mut self, channel_id: RoomId) {
        self.counts.insert(
            channel_id,
            UnreadCount {
                channel_id,
                unread_count: 0,
                mention_count: 0,
            },
        );
    }

    pub fn total_unread(&self) -> u32 {
        self.counts.values().map(|c| c.unread_count).sum()
    }

    pub fn clear(&mut self) {
        self.counts.clear();
    }
}
