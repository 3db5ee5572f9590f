use std::collections::HashSet;

use chrono::{DateTime, Utc};
use shared::{
    domain::{Message, MessageId, ReactionSummary, RoomId, UserId},
    error::ApiError,
    protocol::{
        room_channel_name, ReactionChangedPayload, SendMessageRequest, MESSAGE_CREATED_EVENT,
        REACTION_CHANGED_EVENT,
    },
};
use storage::NewMessage;
use tracing::{debug, info, warn};

use crate::{authenticate, ensure_room_access, store_failure, ApiContext};

pub const MAX_CONTENT_BYTES: usize = 4000;
pub const DEFAULT_PAGE_SIZE: u32 = 50;
pub const MAX_PAGE_SIZE: u32 = 500;
const MAX_EMOJI_BYTES: usize = 64;

/// Persists a message and then broadcasts it on the room channel.
///
/// The insert is the durability point. Everything after it (publish, the
/// sender's read pointer, mention counters) is best effort and only logged on
/// failure, so a caller that sees `Ok` knows the message is stored.
pub async fn send_message(
    ctx: &ApiContext,
    request: SendMessageRequest,
) -> Result<Message, ApiError> {
    let SendMessageRequest {
        user_id,
        room_id,
        content,
        kind,
        parent_message_id,
    } = request;

    let author = authenticate(ctx, user_id).await?;
    validate_content(&content)?;
    ensure_room_access(ctx, room_id, user_id).await?;

    if let Some(parent_id) = parent_message_id {
        let parent = ctx
            .storage
            .message_location(parent_id)
            .await
            .map_err(store_failure)?;
        match parent {
            Some(location) if location.room_id == room_id => {}
            Some(_) => {
                return Err(ApiError::validation(
                    "parent message belongs to a different room",
                ))
            }
            None => return Err(ApiError::validation("parent message not found")),
        }
    }

    let message = ctx
        .storage
        .insert_message(NewMessage {
            room_id,
            author_id: user_id,
            parent_message_id,
            content,
            kind,
            created_at: Utc::now(),
        })
        .await
        .map_err(store_failure)?;
    info!(
        room_id = room_id.0,
        message_id = message.id.0,
        author = %author,
        reply = message.parent_message_id.is_some(),
        "message stored"
    );

    publish_message(ctx, &message);

    if let Err(error) = ctx
        .storage
        .upsert_read_state(user_id, room_id, message.id)
        .await
    {
        warn!(room_id = room_id.0, user_id = user_id.0, %error, "failed to advance sender read state");
    }

    record_mentions(ctx, &message).await;

    Ok(message)
}

fn validate_content(content: &str) -> Result<(), ApiError> {
    if content.trim().is_empty() {
        return Err(ApiError::validation("message content must not be empty"));
    }
    if content.len() > MAX_CONTENT_BYTES {
        return Err(ApiError::validation(format!(
            "message content exceeds {MAX_CONTENT_BYTES} bytes"
        )));
    }
    Ok(())
}

fn publish_message(ctx: &ApiContext, message: &Message) {
    let channel = room_channel_name(message.room_id);
    let payload = match serde_json::to_value(message) {
        Ok(payload) => payload,
        Err(error) => {
            warn!(message_id = message.id.0, %error, "failed to encode broadcast payload");
            return;
        }
    };
    if let Err(error) = ctx.publisher.publish(&channel, MESSAGE_CREATED_EVENT, payload) {
        warn!(
            %channel,
            message_id = message.id.0,
            %error,
            "broadcast failed; subscribers will catch up on reconciliation"
        );
    }
}

async fn record_mentions(ctx: &ApiContext, message: &Message) {
    let mentioned = mentioned_usernames(&message.content);
    if mentioned.is_empty() {
        return;
    }

    let participants = match ctx.storage.list_participants(message.room_id).await {
        Ok(participants) => participants,
        Err(error) => {
            warn!(room_id = message.room_id.0, %error, "failed to load participants for mentions");
            return;
        }
    };

    for (user_id, username) in participants {
        if user_id == message.author_id || !mentioned.contains(username.as_str()) {
            continue;
        }
        match ctx
            .storage
            .increment_mention_count(user_id, message.room_id)
            .await
        {
            Ok(()) => debug!(room_id = message.room_id.0, user_id = user_id.0, "mention recorded"),
            Err(error) => warn!(
                room_id = message.room_id.0,
                user_id = user_id.0,
                %error,
                "failed to record mention"
            ),
        }
    }
}

/// Usernames written as `@name` in the content. Trailing punctuation is not
/// part of the name.
fn mentioned_usernames(content: &str) -> HashSet<&str> {
    content
        .split_whitespace()
        .filter_map(|word| word.strip_prefix('@'))
        .map(|name| {
            name.trim_end_matches(|c: char| !(c.is_alphanumeric() || c == '_' || c == '-'))
        })
        .filter(|name| !name.is_empty())
        .collect()
}

pub async fn list_messages(
    ctx: &ApiContext,
    user_id: UserId,
    room_id: RoomId,
    limit: Option<u32>,
    before: Option<DateTime<Utc>>,
) -> Result<Vec<Message>, ApiError> {
    authenticate(ctx, user_id).await?;
    ensure_room_access(ctx, room_id, user_id).await?;
    let limit = limit.unwrap_or(DEFAULT_PAGE_SIZE).clamp(1, MAX_PAGE_SIZE);
    ctx.storage
        .list_top_level(room_id, before, limit)
        .await
        .map_err(store_failure)
}

/// All replies below `message_id`, flat and ascending, each carrying its own
/// parent pointer.
pub async fn list_thread(
    ctx: &ApiContext,
    user_id: UserId,
    message_id: MessageId,
) -> Result<Vec<Message>, ApiError> {
    authenticate(ctx, user_id).await?;
    let location = ctx
        .storage
        .message_location(message_id)
        .await
        .map_err(store_failure)?
        .ok_or_else(|| ApiError::not_found("message not found"))?;
    ensure_room_access(ctx, location.room_id, user_id).await?;
    ctx.storage
        .list_thread(message_id)
        .await
        .map_err(store_failure)
}

pub async fn add_reaction(
    ctx: &ApiContext,
    user_id: UserId,
    message_id: MessageId,
    emoji: &str,
) -> Result<Vec<ReactionSummary>, ApiError> {
    let room_id = authorize_reaction(ctx, user_id, message_id, emoji).await?;
    ctx.storage
        .add_reaction(message_id, user_id, emoji.trim())
        .await
        .map_err(store_failure)?;
    reaction_changed(ctx, room_id, message_id).await
}

pub async fn remove_reaction(
    ctx: &ApiContext,
    user_id: UserId,
    message_id: MessageId,
    emoji: &str,
) -> Result<Vec<ReactionSummary>, ApiError> {
    let room_id = authorize_reaction(ctx, user_id, message_id, emoji).await?;
    let removed = ctx
        .storage
        .remove_reaction(message_id, user_id, emoji.trim())
        .await
        .map_err(store_failure)?;
    if !removed {
        debug!(message_id = message_id.0, user_id = user_id.0, "reaction already absent");
    }
    reaction_changed(ctx, room_id, message_id).await
}

async fn authorize_reaction(
    ctx: &ApiContext,
    user_id: UserId,
    message_id: MessageId,
    emoji: &str,
) -> Result<RoomId, ApiError> {
    authenticate(ctx, user_id).await?;
    let emoji = emoji.trim();
    if emoji.is_empty() || emoji.len() > MAX_EMOJI_BYTES {
        return Err(ApiError::validation("invalid reaction emoji"));
    }
    let location = ctx
        .storage
        .message_location(message_id)
        .await
        .map_err(store_failure)?
        .ok_or_else(|| ApiError::not_found("message not found"))?;
    ensure_room_access(ctx, location.room_id, user_id).await?;
    Ok(location.room_id)
}

async fn reaction_changed(
    ctx: &ApiContext,
    room_id: RoomId,
    message_id: MessageId,
) -> Result<Vec<ReactionSummary>, ApiError> {
    let reactions = ctx
        .storage
        .reactions_for_message(message_id)
        .await
        .map_err(store_failure)?;

    let payload = ReactionChangedPayload {
        id: message_id,
        room_id,
        reactions: reactions.clone(),
    };
    let channel = room_channel_name(room_id);
    match serde_json::to_value(&payload) {
        Ok(payload) => {
            if let Err(error) = ctx.publisher.publish(&channel, REACTION_CHANGED_EVENT, payload) {
                warn!(%channel, message_id = message_id.0, %error, "reaction broadcast failed");
            }
        }
        Err(error) => warn!(message_id = message_id.0, %error, "failed to encode reaction payload"),
    }
    Ok(reactions)
}

#[cfg(test)]
#[path = "tests/messages_tests.rs"]
mod tests;
