use std::{
    collections::HashMap,
    sync::{
        atomic::{AtomicBool, AtomicUsize, Ordering},
        Arc, Mutex,
    },
};

use async_trait::async_trait;
use chrono::{DateTime, Duration, TimeZone, Utc};
use pubsub::{ChannelPublisher, InProcessBroker};
use shared::{
    domain::{
        Message, MessageId, MessageKind, ReactionSummary, RoomId, RoomKind, RoomSummary,
        UnreadCount, UserId,
    },
    error::{ApiError, ErrorCode},
    protocol::{
        room_channel_name, ParticipantSummary, RoomCreatedResponse, SendMessageRequest,
        MESSAGE_CREATED_EVENT,
    },
};

use crate::{ChatBackend, ChatClient, SyncConfig};

pub const ROOM: RoomId = RoomId(1);
pub const OTHER_ROOM: RoomId = RoomId(2);

#[derive(Default)]
struct Store {
    users: HashMap<String, UserId>,
    messages: Vec<Message>,
    reads: HashMap<(UserId, RoomId), MessageId>,
    reactions: HashMap<MessageId, Vec<(UserId, String)>>,
    dms: HashMap<(UserId, UserId), RoomId>,
    next_room: i64,
}

/// In-memory stand-in for the server: keeps messages in insertion order and
/// optionally publishes sends on a broker like the real pipeline does.
pub struct FakeBackend {
    store: Mutex<Store>,
    broker: Option<InProcessBroker>,
    offline: AtomicBool,
    top_level_calls: AtomicUsize,
    thread_calls: AtomicUsize,
}

impl FakeBackend {
    pub fn new(broker: Option<InProcessBroker>) -> Arc<Self> {
        let mut store = Store {
            next_room: 100,
            ..Store::default()
        };
        store.users.insert("alice".into(), UserId(1));
        store.users.insert("bob".into(), UserId(2));
        Arc::new(Self {
            store: Mutex::new(store),
            broker,
            offline: AtomicBool::new(false),
            top_level_calls: AtomicUsize::new(0),
            thread_calls: AtomicUsize::new(0),
        })
    }

    /// While offline every query fails as unavailable.
    pub fn set_offline(&self, offline: bool) {
        self.offline.store(offline, Ordering::SeqCst);
    }

    pub fn top_level_calls(&self) -> usize {
        self.top_level_calls.load(Ordering::SeqCst)
    }

    pub fn thread_calls(&self) -> usize {
        self.thread_calls.load(Ordering::SeqCst)
    }

    fn check_online(&self) -> Result<(), ApiError> {
        if self.offline.load(Ordering::SeqCst) {
            return Err(ApiError::new(ErrorCode::Unavailable, "store unreachable"));
        }
        Ok(())
    }

    /// Persists a message without publishing it.
    pub fn insert(
        &self,
        room_id: RoomId,
        author_id: UserId,
        content: &str,
        parent: Option<MessageId>,
    ) -> Message {
        let mut store = self.store.lock().expect("store");
        let id = MessageId(store.messages.len() as i64 + 1);
        let thread_root_id = parent.map(|parent| {
            store
                .messages
                .iter()
                .find(|m| m.id == parent)
                .and_then(|m| m.thread_root_id)
                .unwrap_or(parent)
        });
        let message = Message {
            id,
            room_id,
            parent_message_id: parent,
            thread_root_id,
            author_id,
            author_username: Some(if author_id == UserId(1) { "alice" } else { "bob" }.into()),
            content: content.to_string(),
            kind: MessageKind::Text,
            created_at: at(id.0),
            reactions: Vec::new(),
            reply_count: 0,
            last_reply_at: None,
        };
        store.messages.push(message.clone());
        message
    }

    /// The message as the store would serve it now.
    pub fn stored(&self, id: MessageId) -> Message {
        let store = self.store.lock().expect("store");
        let message = store
            .messages
            .iter()
            .find(|m| m.id == id)
            .cloned()
            .expect("stored message");
        with_reply_stats(&store, message)
    }
}

pub fn at(offset_secs: i64) -> DateTime<Utc> {
    Utc.timestamp_opt(1_700_000_000, 0).single().expect("ts") + Duration::seconds(offset_secs)
}

fn with_reply_stats(store: &Store, mut message: Message) -> Message {
    let replies = store
        .messages
        .iter()
        .filter(|m| m.parent_message_id == Some(message.id))
        .collect::<Vec<_>>();
    message.reply_count = replies.len() as u32;
    message.last_reply_at = replies.iter().map(|m| m.created_at).max();
    message.reactions = summarize(store.reactions.get(&message.id));
    message
}

fn summarize(rows: Option<&Vec<(UserId, String)>>) -> Vec<ReactionSummary> {
    let mut out: Vec<ReactionSummary> = Vec::new();
    for (user, emoji) in rows.into_iter().flatten() {
        match out.iter_mut().find(|r| &r.emoji == emoji) {
            Some(summary) => {
                summary.count += 1;
                summary.user_ids.push(*user);
            }
            None => out.push(ReactionSummary {
                emoji: emoji.clone(),
                count: 1,
                user_ids: vec![*user],
            }),
        }
    }
    out
}

#[async_trait]
impl ChatBackend for FakeBackend {
    async fn login(&self, username: &str) -> Result<UserId, ApiError> {
        self.check_online()?;
        let mut store = self.store.lock().expect("store");
        let next = UserId(store.users.len() as i64 + 1);
        Ok(*store.users.entry(username.to_string()).or_insert(next))
    }

    async fn send_message(&self, request: SendMessageRequest) -> Result<Message, ApiError> {
        self.check_online()?;
        if request.content.trim().is_empty() {
            return Err(ApiError::validation("message content is empty"));
        }
        let message = self.insert(
            request.room_id,
            request.user_id,
            &request.content,
            request.parent_message_id,
        );
        if let Some(broker) = &self.broker {
            let payload = serde_json::to_value(&message).expect("encode");
            let _ = broker.publish(
                &room_channel_name(request.room_id),
                MESSAGE_CREATED_EVENT,
                payload,
            );
        }
        Ok(message)
    }

    async fn list_top_level(
        &self,
        _user_id: UserId,
        room_id: RoomId,
        before: Option<DateTime<Utc>>,
        limit: u32,
    ) -> Result<Vec<Message>, ApiError> {
        self.top_level_calls.fetch_add(1, Ordering::SeqCst);
        self.check_online()?;
        let store = self.store.lock().expect("store");
        let mut page = store
            .messages
            .iter()
            .filter(|m| m.room_id == room_id && m.is_top_level())
            .filter(|m| before.map_or(true, |before| m.created_at < before))
            .cloned()
            .collect::<Vec<_>>();
        page.sort_by_key(|m| (m.created_at, m.id));
        let skip = page.len().saturating_sub(limit as usize);
        Ok(page
            .into_iter()
            .skip(skip)
            .map(|m| with_reply_stats(&store, m))
            .collect())
    }

    async fn list_thread(
        &self,
        _user_id: UserId,
        parent_id: MessageId,
    ) -> Result<Vec<Message>, ApiError> {
        self.thread_calls.fetch_add(1, Ordering::SeqCst);
        self.check_online()?;
        let store = self.store.lock().expect("store");
        let mut frontier = vec![parent_id];
        let mut rows = Vec::new();
        while let Some(parent) = frontier.pop() {
            for child in store
                .messages
                .iter()
                .filter(|m| m.parent_message_id == Some(parent))
            {
                frontier.push(child.id);
                rows.push(child.clone());
            }
        }
        rows.sort_by_key(|m| (m.created_at, m.id));
        Ok(rows)
    }

    async fn mark_read(
        &self,
        user_id: UserId,
        channel_id: RoomId,
        last_read_message_id: MessageId,
    ) -> Result<(), ApiError> {
        self.check_online()?;
        self.store
            .lock()
            .expect("store")
            .reads
            .insert((user_id, channel_id), last_read_message_id);
        Ok(())
    }

    async fn unread_counts(&self, user_id: UserId) -> Result<Vec<UnreadCount>, ApiError> {
        self.check_online()?;
        let store = self.store.lock().expect("store");
        let mut counts: HashMap<RoomId, u32> = HashMap::new();
        for message in &store.messages {
            counts.entry(message.room_id).or_default();
            let read = store.reads.get(&(user_id, message.room_id)).copied();
            if message.is_top_level()
                && message.author_id != user_id
                && read.map_or(true, |read| message.id > read)
            {
                *counts.entry(message.room_id).or_default() += 1;
            }
        }
        let mut out = counts
            .into_iter()
            .map(|(channel_id, unread_count)| UnreadCount {
                channel_id,
                unread_count,
                mention_count: 0,
            })
            .collect::<Vec<_>>();
        out.sort_by_key(|c| c.channel_id);
        Ok(out)
    }

    async fn create_or_get_dm(
        &self,
        user_id: UserId,
        target_user_id: UserId,
    ) -> Result<RoomCreatedResponse, ApiError> {
        self.check_online()?;
        if user_id == target_user_id {
            return Err(ApiError::validation("cannot open a DM with yourself"));
        }
        let key = (user_id.min(target_user_id), user_id.max(target_user_id));
        let mut store = self.store.lock().expect("store");
        if let Some(room_id) = store.dms.get(&key).copied() {
            return Ok(RoomCreatedResponse {
                room_id,
                kind: RoomKind::Dm,
                created: false,
            });
        }
        store.next_room += 1;
        let room_id = RoomId(store.next_room);
        store.dms.insert(key, room_id);
        Ok(RoomCreatedResponse {
            room_id,
            kind: RoomKind::Dm,
            created: true,
        })
    }

    async fn create_group(
        &self,
        _user_id: UserId,
        _name: &str,
        _member_ids: &[UserId],
    ) -> Result<RoomCreatedResponse, ApiError> {
        self.check_online()?;
        let mut store = self.store.lock().expect("store");
        store.next_room += 1;
        Ok(RoomCreatedResponse {
            room_id: RoomId(store.next_room),
            kind: RoomKind::Group,
            created: true,
        })
    }

    async fn list_rooms(&self, _user_id: UserId) -> Result<Vec<RoomSummary>, ApiError> {
        self.check_online()?;
        Ok(vec![RoomSummary {
            room_id: ROOM,
            kind: RoomKind::Group,
            name: Some("desk".into()),
            community_id: None,
            participant_ids: vec![UserId(1), UserId(2)],
        }])
    }

    async fn list_participants(
        &self,
        _user_id: UserId,
        _room_id: RoomId,
    ) -> Result<Vec<ParticipantSummary>, ApiError> {
        self.check_online()?;
        Ok(vec![
            ParticipantSummary {
                user_id: UserId(1),
                username: "alice".into(),
            },
            ParticipantSummary {
                user_id: UserId(2),
                username: "bob".into(),
            },
        ])
    }

    async fn add_reaction(
        &self,
        user_id: UserId,
        message_id: MessageId,
        emoji: &str,
    ) -> Result<Vec<ReactionSummary>, ApiError> {
        self.check_online()?;
        let mut store = self.store.lock().expect("store");
        let rows = store.reactions.entry(message_id).or_default();
        if !rows.iter().any(|(u, e)| *u == user_id && e == emoji) {
            rows.push((user_id, emoji.to_string()));
        }
        Ok(summarize(store.reactions.get(&message_id)))
    }

    async fn remove_reaction(
        &self,
        user_id: UserId,
        message_id: MessageId,
        emoji: &str,
    ) -> Result<Vec<ReactionSummary>, ApiError> {
        self.check_online()?;
        let mut store = self.store.lock().expect("store");
        if let Some(rows) = store.reactions.get_mut(&message_id) {
            rows.retain(|(u, e)| !(*u == user_id && e == emoji));
        }
        Ok(summarize(store.reactions.get(&message_id)))
    }
}

pub struct Harness {
    pub client: Arc<ChatClient>,
    pub backend: Arc<FakeBackend>,
    pub broker: InProcessBroker,
}

/// Alice signed in against a fake backend that publishes sends on `broker`.
pub async fn signed_in() -> Harness {
    let broker = InProcessBroker::new();
    let backend = FakeBackend::new(Some(broker.clone()));
    let client = ChatClient::new(
        backend.clone(),
        Arc::new(broker.clone()),
        SyncConfig::default(),
    );
    client.sign_in("alice").await.expect("sign in");
    settle().await;
    Harness {
        client,
        backend,
        broker,
    }
}

/// Lets spawned tasks run until they block again.
pub async fn settle() {
    for _ in 0..50 {
        tokio::task::yield_now().await;
    }
}

/// Moves paused time forward and lets timers that came due run.
pub async fn advance(duration: std::time::Duration) {
    tokio::time::advance(duration).await;
    settle().await;
}
