use anyhow::{anyhow, Context, Result};
use chrono::{DateTime, Utc};
use sqlx::{
    sqlite::{SqliteConnectOptions, SqlitePoolOptions, SqliteRow},
    Pool, QueryBuilder, Row, Sqlite,
};
use std::{
    collections::HashMap,
    fs,
    path::{Path, PathBuf},
    str::FromStr,
};
use tracing::debug;

use shared::domain::{
    CommunityId, Message, MessageId, MessageKind, ReactionSummary, ReadState, RoomId, RoomKind,
    RoomSummary, UnreadCount, UserId,
};

const MESSAGE_SELECT: &str = "SELECT m.id, m.room_id, m.parent_message_id, m.thread_root_id, m.author_id, u.username,
        m.content, m.kind, m.created_at,
        (SELECT COUNT(*) FROM messages r WHERE r.parent_message_id = m.id) AS reply_count,
        (SELECT MAX(r.created_at) FROM messages r WHERE r.parent_message_id = m.id) AS last_reply_at
 FROM messages m
 INNER JOIN users u ON u.id = m.author_id";

#[derive(Clone)]
pub struct Storage {
    pool: Pool<Sqlite>,
}

#[derive(Debug, Clone)]
pub struct NewMessage {
    pub room_id: RoomId,
    pub author_id: UserId,
    pub parent_message_id: Option<MessageId>,
    pub content: String,
    pub kind: MessageKind,
    pub created_at: DateTime<Utc>,
}

/// Where a message lives: its room and, for replies, the thread it belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MessageLocation {
    pub room_id: RoomId,
    pub parent_message_id: Option<MessageId>,
    pub thread_root_id: Option<MessageId>,
}

impl MessageLocation {
    /// Thread root a reply to this message would be filed under.
    pub fn root_for_reply(&self, message_id: MessageId) -> MessageId {
        self.thread_root_id.unwrap_or(message_id)
    }
}

impl Storage {
    pub async fn new(database_url: &str) -> Result<Self> {
        ensure_sqlite_parent_dir_exists(database_url)?;

        let connect_options = SqliteConnectOptions::from_str(database_url)?.create_if_missing(true);
        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .connect_with(connect_options)
            .await?;
        sqlx::migrate!("./migrations").run(&pool).await?;
        Ok(Self { pool })
    }

    pub fn pool(&self) -> &Pool<Sqlite> {
        &self.pool
    }

    pub async fn health_check(&self) -> Result<()> {
        let _: i64 = sqlx::query_scalar("SELECT 1")
            .fetch_one(&self.pool)
            .await
            .context("sqlite ping failed")?;
        Ok(())
    }

    pub async fn create_user(&self, username: &str) -> Result<UserId> {
        let rec = sqlx::query(
            "INSERT INTO users (username) VALUES (?)
             ON CONFLICT(username) DO UPDATE SET username=excluded.username
             RETURNING id",
        )
        .bind(username)
        .fetch_one(&self.pool)
        .await?;
        Ok(UserId(rec.get::<i64, _>(0)))
    }

    pub async fn username_for_user(&self, user_id: UserId) -> Result<Option<String>> {
        let row = sqlx::query("SELECT username FROM users WHERE id = ?")
            .bind(user_id.0)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row.map(|r| r.get::<String, _>(0)))
    }

    pub async fn user_by_username(&self, username: &str) -> Result<Option<UserId>> {
        let row = sqlx::query("SELECT id FROM users WHERE username = ?")
            .bind(username)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row.map(|r| UserId(r.get::<i64, _>(0))))
    }

    pub async fn create_room(
        &self,
        kind: RoomKind,
        name: Option<&str>,
        community_id: Option<CommunityId>,
    ) -> Result<RoomId> {
        let rec = sqlx::query(
            "INSERT INTO rooms (kind, name, community_id) VALUES (?, ?, ?) RETURNING id",
        )
        .bind(kind.as_str())
        .bind(name)
        .bind(community_id.map(|id| id.0))
        .fetch_one(&self.pool)
        .await?;
        Ok(RoomId(rec.get::<i64, _>(0)))
    }

    pub async fn add_participant(&self, room_id: RoomId, user_id: UserId) -> Result<()> {
        sqlx::query(
            "INSERT INTO room_participants (room_id, user_id) VALUES (?, ?)
             ON CONFLICT(room_id, user_id) DO NOTHING",
        )
        .bind(room_id.0)
        .bind(user_id.0)
        .execute(&self.pool)
        .await
        .with_context(|| {
            format!(
                "failed to add user {} to room {}",
                user_id.0, room_id.0
            )
        })?;
        Ok(())
    }

    pub async fn find_dm(&self, a: UserId, b: UserId) -> Result<Option<RoomId>> {
        let row = sqlx::query("SELECT id FROM rooms WHERE dm_key = ?")
            .bind(dm_key(a, b))
            .fetch_optional(&self.pool)
            .await?;
        Ok(row.map(|r| RoomId(r.get::<i64, _>(0))))
    }

    /// Returns the direct-message room shared by `a` and `b`, creating it when
    /// missing. The boolean is `true` when this call created the room.
    pub async fn get_or_create_dm(&self, a: UserId, b: UserId) -> Result<(RoomId, bool)> {
        if let Some(existing) = self.find_dm(a, b).await? {
            return Ok((existing, false));
        }

        let key = dm_key(a, b);
        let mut tx = self.pool.begin().await?;
        let inserted = sqlx::query(
            "INSERT INTO rooms (kind, dm_key) VALUES ('dm', ?)
             ON CONFLICT(dm_key) DO NOTHING
             RETURNING id",
        )
        .bind(&key)
        .fetch_optional(&mut *tx)
        .await?;

        let Some(row) = inserted else {
            tx.rollback().await?;
            let existing = self
                .find_dm(a, b)
                .await?
                .ok_or_else(|| anyhow!("direct message room {key} vanished after conflict"))?;
            return Ok((existing, false));
        };

        let room_id = RoomId(row.get::<i64, _>(0));
        for user_id in [a, b] {
            sqlx::query(
                "INSERT INTO room_participants (room_id, user_id) VALUES (?, ?)
                 ON CONFLICT(room_id, user_id) DO NOTHING",
            )
            .bind(room_id.0)
            .bind(user_id.0)
            .execute(&mut *tx)
            .await?;
        }
        tx.commit().await?;
        debug!(room_id = room_id.0, %key, "storage: created direct message room");
        Ok((room_id, true))
    }

    pub async fn room_kind(&self, room_id: RoomId) -> Result<Option<RoomKind>> {
        let row = sqlx::query("SELECT kind FROM rooms WHERE id = ?")
            .bind(room_id.0)
            .fetch_optional(&self.pool)
            .await?;
        row.map(|r| parse_room_kind(&r.get::<String, _>(0)))
            .transpose()
    }

    pub async fn is_participant(&self, room_id: RoomId, user_id: UserId) -> Result<bool> {
        let row = sqlx::query("SELECT 1 FROM room_participants WHERE room_id = ? AND user_id = ?")
            .bind(room_id.0)
            .bind(user_id.0)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row.is_some())
    }

    pub async fn list_participants(&self, room_id: RoomId) -> Result<Vec<(UserId, String)>> {
        let rows = sqlx::query(
            "SELECT u.id, u.username
             FROM room_participants p
             INNER JOIN users u ON u.id = p.user_id
             WHERE p.room_id = ?
             ORDER BY u.id ASC",
        )
        .bind(room_id.0)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows
            .into_iter()
            .map(|r| (UserId(r.get::<i64, _>(0)), r.get::<String, _>(1)))
            .collect())
    }

    pub async fn room_summary(&self, room_id: RoomId) -> Result<Option<RoomSummary>> {
        let row = sqlx::query("SELECT id, kind, name, community_id FROM rooms WHERE id = ?")
            .bind(room_id.0)
            .fetch_optional(&self.pool)
            .await?;
        let Some(row) = row else {
            return Ok(None);
        };
        let participant_ids = self
            .list_participants(room_id)
            .await?
            .into_iter()
            .map(|(user_id, _)| user_id)
            .collect();
        Ok(Some(RoomSummary {
            room_id,
            kind: parse_room_kind(&row.get::<String, _>(1))?,
            name: row.get::<Option<String>, _>(2),
            community_id: row.get::<Option<i64>, _>(3).map(CommunityId),
            participant_ids,
        }))
    }

    pub async fn list_rooms_for_user(&self, user_id: UserId) -> Result<Vec<RoomSummary>> {
        let rows = sqlx::query(
            "SELECT r.id, r.kind, r.name, r.community_id
             FROM rooms r
             INNER JOIN room_participants p ON p.room_id = r.id
             WHERE p.user_id = ?
             ORDER BY r.id ASC",
        )
        .bind(user_id.0)
        .fetch_all(&self.pool)
        .await?;

        let mut rooms = Vec::with_capacity(rows.len());
        for row in rows {
            let room_id = RoomId(row.get::<i64, _>(0));
            let participant_ids = self
                .list_participants(room_id)
                .await?
                .into_iter()
                .map(|(user_id, _)| user_id)
                .collect();
            rooms.push(RoomSummary {
                room_id,
                kind: parse_room_kind(&row.get::<String, _>(1))?,
                name: row.get::<Option<String>, _>(2),
                community_id: row.get::<Option<i64>, _>(3).map(CommunityId),
                participant_ids,
            });
        }
        Ok(rooms)
    }

    pub async fn message_location(&self, message_id: MessageId) -> Result<Option<MessageLocation>> {
        let row = sqlx::query(
            "SELECT room_id, parent_message_id, thread_root_id FROM messages WHERE id = ?",
        )
        .bind(message_id.0)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.map(|r| MessageLocation {
            room_id: RoomId(r.get::<i64, _>(0)),
            parent_message_id: r.get::<Option<i64>, _>(1).map(MessageId),
            thread_root_id: r.get::<Option<i64>, _>(2).map(MessageId),
        }))
    }

    /// Persists a message and returns it with author and thread fields resolved.
    pub async fn insert_message(&self, message: NewMessage) -> Result<Message> {
        let thread_root_id = match message.parent_message_id {
            Some(parent_id) => {
                let parent = self
                    .message_location(parent_id)
                    .await?
                    .ok_or_else(|| anyhow!("parent message {} not found", parent_id.0))?;
                Some(parent.root_for_reply(parent_id))
            }
            None => None,
        };

        let rec = sqlx::query(
            "INSERT INTO messages (room_id, parent_message_id, thread_root_id, author_id, content, kind, created_at)
             VALUES (?, ?, ?, ?, ?, ?, ?)
             RETURNING id",
        )
        .bind(message.room_id.0)
        .bind(message.parent_message_id.map(|id| id.0))
        .bind(thread_root_id.map(|id| id.0))
        .bind(message.author_id.0)
        .bind(&message.content)
        .bind(message.kind.as_str())
        .bind(message.created_at)
        .fetch_one(&self.pool)
        .await
        .context("failed to insert message")?;
        let message_id = MessageId(rec.get::<i64, _>(0));

        self.get_message(message_id)
            .await?
            .ok_or_else(|| anyhow!("message {} missing right after insert", message_id.0))
    }

    pub async fn get_message(&self, message_id: MessageId) -> Result<Option<Message>> {
        let row = sqlx::query(&format!("{MESSAGE_SELECT} WHERE m.id = ?"))
            .bind(message_id.0)
            .fetch_optional(&self.pool)
            .await?;
        let Some(row) = row else {
            return Ok(None);
        };
        let mut messages = vec![message_from_row(&row)?];
        self.attach_reactions(&mut messages).await?;
        Ok(messages.pop())
    }

    /// Newest `limit` top-level messages of a room, optionally strictly older
    /// than `before`, returned in ascending creation order.
    pub async fn list_top_level(
        &self,
        room_id: RoomId,
        before: Option<DateTime<Utc>>,
        limit: u32,
    ) -> Result<Vec<Message>> {
        let mut rows = if let Some(before) = before {
            sqlx::query(&format!(
                "{MESSAGE_SELECT}
                 WHERE m.room_id = ? AND m.parent_message_id IS NULL AND m.created_at < ?
                 ORDER BY m.created_at DESC, m.id DESC
                 LIMIT ?"
            ))
            .bind(room_id.0)
            .bind(before)
            .bind(limit)
            .fetch_all(&self.pool)
            .await?
        } else {
            sqlx::query(&format!(
                "{MESSAGE_SELECT}
                 WHERE m.room_id = ? AND m.parent_message_id IS NULL
                 ORDER BY m.created_at DESC, m.id DESC
                 LIMIT ?"
            ))
            .bind(room_id.0)
            .bind(limit)
            .fetch_all(&self.pool)
            .await?
        };

        rows.reverse();
        let mut messages = rows
            .iter()
            .map(message_from_row)
            .collect::<Result<Vec<_>>>()?;
        self.attach_reactions(&mut messages).await?;
        Ok(messages)
    }

    /// Every reply below `parent_id` at any depth, ascending by creation time.
    /// Each row keeps its own `parent_message_id` so callers can rebuild the tree.
    pub async fn list_thread(&self, parent_id: MessageId) -> Result<Vec<Message>> {
        let rows = sqlx::query(&format!(
            "WITH RECURSIVE descendants(id) AS (
                 SELECT id FROM messages WHERE parent_message_id = ?
                 UNION ALL
                 SELECT c.id FROM messages c INNER JOIN descendants d ON c.parent_message_id = d.id
             )
             {MESSAGE_SELECT}
             WHERE m.id IN (SELECT id FROM descendants)
             ORDER BY m.created_at ASC, m.id ASC"
        ))
        .bind(parent_id.0)
        .fetch_all(&self.pool)
        .await?;

        let mut messages = rows
            .iter()
            .map(message_from_row)
            .collect::<Result<Vec<_>>>()?;
        self.attach_reactions(&mut messages).await?;
        Ok(messages)
    }

    pub async fn add_reaction(
        &self,
        message_id: MessageId,
        user_id: UserId,
        emoji: &str,
    ) -> Result<()> {
        sqlx::query(
            "INSERT INTO reactions (message_id, user_id, emoji) VALUES (?, ?, ?)
             ON CONFLICT(message_id, user_id, emoji) DO NOTHING",
        )
        .bind(message_id.0)
        .bind(user_id.0)
        .bind(emoji)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn remove_reaction(
        &self,
        message_id: MessageId,
        user_id: UserId,
        emoji: &str,
    ) -> Result<bool> {
        let removed = sqlx::query(
            "DELETE FROM reactions WHERE message_id = ? AND user_id = ? AND emoji = ?",
        )
        .bind(message_id.0)
        .bind(user_id.0)
        .bind(emoji)
        .execute(&self.pool)
        .await?
        .rows_affected();
        Ok(removed > 0)
    }

    pub async fn reactions_for_message(&self, message_id: MessageId) -> Result<Vec<ReactionSummary>> {
        let mut grouped = self.load_reactions(&[message_id]).await?;
        Ok(grouped.remove(&message_id).unwrap_or_default())
    }

    async fn attach_reactions(&self, messages: &mut [Message]) -> Result<()> {
        if messages.is_empty() {
            return Ok(());
        }
        let ids = messages.iter().map(|m| m.id).collect::<Vec<_>>();
        let mut grouped = self.load_reactions(&ids).await?;
        for message in messages.iter_mut() {
            message.reactions = grouped.remove(&message.id).unwrap_or_default();
        }
        Ok(())
    }

    async fn load_reactions(
        &self,
        message_ids: &[MessageId],
    ) -> Result<HashMap<MessageId, Vec<ReactionSummary>>> {
        let mut grouped: HashMap<MessageId, Vec<ReactionSummary>> = HashMap::new();
        if message_ids.is_empty() {
            return Ok(grouped);
        }

        let mut builder: QueryBuilder<Sqlite> =
            QueryBuilder::new("SELECT message_id, emoji, user_id FROM reactions WHERE message_id IN (");
        let mut separated = builder.separated(", ");
        for id in message_ids {
            separated.push_bind(id.0);
        }
        separated.push_unseparated(") ORDER BY message_id ASC, created_at ASC, user_id ASC");
        let rows = builder.build().fetch_all(&self.pool).await?;

        for row in rows {
            let message_id = MessageId(row.get::<i64, _>(0));
            let emoji = row.get::<String, _>(1);
            let user_id = UserId(row.get::<i64, _>(2));
            let reactions = grouped.entry(message_id).or_default();
            match reactions.iter_mut().find(|r| r.emoji == emoji) {
                Some(existing) => {
                    existing.count += 1;
                    existing.user_ids.push(user_id);
                }
                None => reactions.push(ReactionSummary {
                    emoji,
                    count: 1,
                    user_ids: vec![user_id],
                }),
            }
        }
        Ok(grouped)
    }

    /// Moves the read pointer and clears the whole mention counter.
    pub async fn upsert_read_state(
        &self,
        user_id: UserId,
        channel_id: RoomId,
        last_read_message_id: MessageId,
    ) -> Result<()> {
        sqlx::query(
            "INSERT INTO read_states (user_id, channel_id, last_read_message_id, last_read_at, mention_count)
             VALUES (?, ?, ?, ?, 0)
             ON CONFLICT(user_id, channel_id) DO UPDATE SET
                 last_read_message_id = excluded.last_read_message_id,
                 last_read_at = excluded.last_read_at,
                 mention_count = 0",
        )
        .bind(user_id.0)
        .bind(channel_id.0)
        .bind(last_read_message_id.0)
        .bind(Utc::now())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn increment_mention_count(&self, user_id: UserId, channel_id: RoomId) -> Result<()> {
        sqlx::query(
            "INSERT INTO read_states (user_id, channel_id, mention_count) VALUES (?, ?, 1)
             ON CONFLICT(user_id, channel_id) DO UPDATE SET mention_count = mention_count + 1",
        )
        .bind(user_id.0)
        .bind(channel_id.0)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn read_state(&self, user_id: UserId, channel_id: RoomId) -> Result<Option<ReadState>> {
        let row = sqlx::query(
            "SELECT last_read_message_id, last_read_at, mention_count
             FROM read_states
             WHERE user_id = ? AND channel_id = ?",
        )
        .bind(user_id.0)
        .bind(channel_id.0)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.map(|r| ReadState {
            user_id,
            channel_id,
            last_read_message_id: r.get::<Option<i64>, _>(0).map(MessageId),
            last_read_at: r.get::<Option<DateTime<Utc>>, _>(1),
            mention_count: count_from_i64(r.get::<i64, _>(2)),
        }))
    }

    /// Unread and mention counters for every room the user participates in,
    /// computed in one query. Unread counts top-level messages by other
    /// authors created after the read pointer.
    pub async fn unread_counts(&self, user_id: UserId) -> Result<Vec<UnreadCount>> {
        let rows = sqlx::query(
            "SELECT p.room_id,
                    (SELECT COUNT(*) FROM messages m
                      WHERE m.room_id = p.room_id
                        AND m.parent_message_id IS NULL
                        AND m.author_id != p.user_id
                        AND (lr.id IS NULL
                             OR m.created_at > lr.created_at
                             OR (m.created_at = lr.created_at AND m.id > lr.id))) AS unread_count,
                    COALESCE(rs.mention_count, 0) AS mention_count
             FROM room_participants p
             LEFT JOIN read_states rs ON rs.user_id = p.user_id AND rs.channel_id = p.room_id
             LEFT JOIN messages lr ON lr.id = rs.last_read_message_id
             WHERE p.user_id = ?
             ORDER BY p.room_id ASC",
        )
        .bind(user_id.0)
        .fetch_all(&self.pool)
        .await?;

        Ok(rows
            .into_iter()
            .map(|r| UnreadCount {
                channel_id: RoomId(r.get::<i64, _>(0)),
                unread_count: count_from_i64(r.get::<i64, _>(1)),
                mention_count: count_from_i64(r.get::<i64, _>(2)),
            })
            .collect())
    }
}

fn message_from_row(r: &SqliteRow) -> Result<Message> {
    let kind_raw = r.get::<String, _>(7);
    let kind = MessageKind::parse(&kind_raw)
        .ok_or_else(|| anyhow!("unknown message kind '{kind_raw}'"))?;
    Ok(Message {
        id: MessageId(r.get::<i64, _>(0)),
        room_id: RoomId(r.get::<i64, _>(1)),
        parent_message_id: r.get::<Option<i64>, _>(2).map(MessageId),
        thread_root_id: r.get::<Option<i64>, _>(3).map(MessageId),
        author_id: UserId(r.get::<i64, _>(4)),
        author_username: Some(r.get::<String, _>(5)),
        content: r.get::<String, _>(6),
        kind,
        created_at: r.get::<DateTime<Utc>, _>(8),
        reactions: Vec::new(),
        reply_count: count_from_i64(r.get::<i64, _>(9)),
        last_reply_at: r.get::<Option<DateTime<Utc>>, _>(10),
    })
}

fn parse_room_kind(raw: &str) -> Result<RoomKind> {
    RoomKind::parse(raw).ok_or_else(|| anyhow!("unknown room kind '{raw}'"))
}

fn count_from_i64(value: i64) -> u32 {
    u32::try_from(value.max(0)).unwrap_or(u32::MAX)
}

fn dm_key(a: UserId, b: UserId) -> String {
    let (low, high) = if a.0 <= b.0 { (a, b) } else { (b, a) };
    format!("{}:{}", low.0, high.0)
}

fn ensure_sqlite_parent_dir_exists(database_url: &str) -> Result<()> {
    let Some(path) = sqlite_path(database_url) else {
        return Ok(());
    };

    let Some(parent) = path.parent() else {
        return Ok(());
    };

    fs::create_dir_all(parent).with_context(|| {
        format!(
            "failed to create parent directory '{}' for database url '{database_url}'",
            parent.display()
        )
    })?;

    Ok(())
}

fn sqlite_path(database_url: &str) -> Option<PathBuf> {
    if database_url.starts_with("sqlite::memory:") || !database_url.starts_with("sqlite:") {
        return None;
    }

    let path = database_url
        .trim_start_matches("sqlite://")
        .trim_start_matches("sqlite:")
        .split('?')
        .next()
        .unwrap_or_default();

    if path.is_empty() {
        return None;
    }

    Some(Path::new(path).to_path_buf())
}

#[cfg(test)]
#[path = "tests/lib_tests.rs"]
mod tests;
