use shared::{
    domain::{MessageId, RoomId, UnreadCount, UserId},
    error::ApiError,
};
use tracing::debug;

use crate::{authenticate, ensure_room_access, store_failure, ApiContext};

/// Moves the caller's read pointer for `channel_id` and clears its mention
/// counter. The message must belong to that channel.
pub async fn mark_read(
    ctx: &ApiContext,
    user_id: UserId,
    channel_id: RoomId,
    last_read_message_id: MessageId,
) -> Result<(), ApiError> {
    authenticate(ctx, user_id).await?;
    ensure_room_access(ctx, channel_id, user_id).await?;

    let location = ctx
        .storage
        .message_location(last_read_message_id)
        .await
        .map_err(store_failure)?
        .ok_or_else(|| ApiError::validation("message not found"))?;
    if location.room_id != channel_id {
        return Err(ApiError::validation("message does not belong to this channel"));
    }

    ctx.storage
        .upsert_read_state(user_id, channel_id, last_read_message_id)
        .await
        .map_err(store_failure)?;
    debug!(
        user_id = user_id.0,
        channel_id = channel_id.0,
        message_id = last_read_message_id.0,
        "read pointer advanced"
    );
    Ok(())
}

pub async fn unread_counts(
    ctx: &ApiContext,
    user_id: UserId,
) -> Result<Vec<UnreadCount>, ApiError> {
    authenticate(ctx, user_id).await?;
    ctx.storage
        .unread_counts(user_id)
        .await
        .map_err(store_failure)
}

#[cfg(test)]
#[path = "tests/read_state_tests.rs"]
mod tests;
