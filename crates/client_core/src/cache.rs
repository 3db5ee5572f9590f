use std::collections::{HashMap, HashSet};

use chrono::{DateTime, Utc};
use shared::domain::{Message, MessageId, ReactionSummary, RoomId};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CacheKey {
    Room(RoomId),
    /// Replies below a top-level message, keyed by that message.
    Thread(MessageId),
}

/// Ordered, deduplicated message list for one room or thread.
#[derive(Debug, Clone, Default)]
pub struct CacheEntry {
    messages: Vec<Message>,
    seen: HashSet<MessageId>,
    stale: bool,
    loaded: bool,
    /// `last_reply_at` per cached message as of the last store snapshot.
    snapshot_last_reply: HashMap<MessageId, DateTime<Utc>>,
    /// Replies applied to a cached parent since that snapshot, as
    /// `reply -> (parent, created_at)`.
    counted_replies: HashMap<MessageId, (MessageId, DateTime<Utc>)>,
}

impl CacheEntry {
    pub fn messages(&self) -> &[Message] {
        &self.messages
    }

    pub fn len(&self) -> usize {
        self.messages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.messages.is_empty()
    }

    pub fn contains(&self, id: MessageId) -> bool {
        self.seen.contains(&id)
    }

    pub fn is_stale(&self) -> bool {
        self.stale
    }

    pub fn is_loaded(&self) -> bool {
        self.loaded
    }

    pub fn mark_stale(&mut self) {
        self.stale = true;
    }

    pub fn oldest(&self) -> Option<&Message> {
        self.messages.first()
    }

    pub fn get_mut(&mut self, id: MessageId) -> Option<&mut Message> {
        if !self.seen.contains(&id) {
            return None;
        }
        self.messages.iter_mut().find(|m| m.id == id)
    }

    /// Appends in arrival order. Returns `false` when the id is already cached.
    pub fn push(&mut self, message: Message) -> bool {
        if !self.seen.insert(message.id) {
            return false;
        }
        self.messages.push(message);
        true
    }

    /// Puts an older page in front of the cached messages, skipping ids
    /// already present. Returns how many were added.
    pub fn prepend(&mut self, older: Vec<Message>) -> usize {
        let mut fresh = older
            .into_iter()
            .filter(|m| self.seen.insert(m.id))
            .collect::<Vec<_>>();
        let added = fresh.len();
        fresh.append(&mut self.messages);
        self.messages = fresh;
        added
    }

    /// Replaces the contents with a store snapshot in store order.
    ///
    /// Cached messages missing from the snapshot survive only when they are
    /// newer than everything in it; those arrived over the transport while the
    /// query was in flight.
    pub fn replace(&mut self, snapshot: Vec<Message>) {
        let newest = snapshot.iter().map(|m| (m.created_at, m.id)).max();
        let snapshot_ids = snapshot.iter().map(|m| m.id).collect::<HashSet<_>>();
        let in_flight = self
            .messages
            .drain(..)
            .filter(|m| !snapshot_ids.contains(&m.id))
            .filter(|m| newest.map_or(true, |n| (m.created_at, m.id) > n))
            .collect::<Vec<_>>();
        let kept = in_flight.iter().map(|m| m.id).collect::<HashSet<_>>();

        self.snapshot_last_reply = snapshot
            .iter()
            .filter_map(|m| m.last_reply_at.map(|at| (m.id, at)))
            .collect();
        self.seen = snapshot_ids;
        self.messages = snapshot;
        for message in in_flight {
            self.push(message);
        }
        self.stale = false;
        self.loaded = true;

        // Kept in-flight rows still carry their counts. Counts the snapshot
        // already includes are dropped; the rest are re-applied to the fresh
        // parent rows.
        let counted = std::mem::take(&mut self.counted_replies);
        for (reply_id, (parent_id, at)) in counted {
            if kept.contains(&parent_id) {
                self.counted_replies.insert(reply_id, (parent_id, at));
            } else {
                self.count_reply(parent_id, reply_id, at);
            }
        }
    }

    /// Whether the last snapshot already counted a reply created at `at`
    /// under `parent`.
    pub fn snapshot_covers_reply(&self, parent: MessageId, at: DateTime<Utc>) -> bool {
        self.snapshot_last_reply
            .get(&parent)
            .is_some_and(|last| at <= *last)
    }

    /// Applies a reply to its cached parent's `reply_count` and
    /// `last_reply_at`, once per reply id. Returns `false` when the parent is
    /// not cached here, the snapshot already counted the reply, or it was
    /// applied before.
    pub fn count_reply(
        &mut self,
        parent_id: MessageId,
        reply_id: MessageId,
        at: DateTime<Utc>,
    ) -> bool {
        if self.counted_replies.contains_key(&reply_id)
            || self.snapshot_covers_reply(parent_id, at)
        {
            return false;
        }
        let Some(parent) = self.get_mut(parent_id) else {
            return false;
        };
        parent.reply_count += 1;
        parent.last_reply_at = Some(parent.last_reply_at.map_or(at, |last| last.max(at)));
        self.counted_replies.insert(reply_id, (parent_id, at));
        true
    }

    pub fn set_reactions(&mut self, id: MessageId, reactions: &[ReactionSummary]) -> bool {
        match self.get_mut(id) {
            Some(message) => {
                message.reactions = reactions.to_vec();
                true
            }
            None => false,
        }
    }
}

/// Session-scoped keyed cache of rooms and threads.
#[derive(Debug, Default)]
pub struct MessageCache {
    entries: HashMap<CacheKey, CacheEntry>,
    thread_rooms: HashMap<MessageId, RoomId>,
}

impl MessageCache {
    pub fn get(&self, key: CacheKey) -> Option<&CacheEntry> {
        self.entries.get(&key)
    }

    pub fn get_mut(&mut self, key: CacheKey) -> Option<&mut CacheEntry> {
        self.entries.get_mut(&key)
    }

    pub fn entry(&mut self, key: CacheKey) -> &mut CacheEntry {
        self.entries.entry(key).or_default()
    }

    pub fn remove(&mut self, key: CacheKey) -> Option<CacheEntry> {
        if let CacheKey::Thread(root) = key {
            self.thread_rooms.remove(&root);
        }
        self.entries.remove(&key)
    }

    pub fn set_thread_room(&mut self, root: MessageId, room_id: RoomId) {
        self.thread_rooms.insert(root, room_id);
    }

    /// Loaded thread caches belonging to `room_id`.
    pub fn loaded_threads_of(&self, room_id: RoomId) -> Vec<MessageId> {
        self.entries
            .iter()
            .filter_map(|(key, entry)| match key {
                CacheKey::Thread(root)
                    if entry.is_loaded() && self.thread_rooms.get(root) == Some(&room_id) =>
                {
                    Some(*root)
                }
                _ => None,
            })
            .collect()
    }

    /// Room that holds `id` as a top-level message, if any is cached.
    pub fn room_of(&self, id: MessageId) -> Option<RoomId> {
        self.entries.iter().find_map(|(key, entry)| match key {
            CacheKey::Room(room_id) if entry.contains(id) => Some(*room_id),
            _ => None,
        })
    }

    pub fn set_reactions(&mut self, id: MessageId, reactions: &[ReactionSummary]) -> bool {
        let mut updated = false;
        for entry in self.entries.values_mut() {
            updated |= entry.set_reactions(id, reactions);
        }
        updated
    }

    pub fn clear(&mut self) {
        self.entries.clear();
        self.thread_rooms.clear();
    }
}

#[cfg(test)]
#[path = "tests/cache_tests.rs"]
mod tests;
