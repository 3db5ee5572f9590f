use std::sync::Arc;

use pubsub::ChannelPublisher;
use shared::{
    domain::{RoomId, RoomKind, UserId},
    error::{ApiError, ErrorCode},
};
use storage::Storage;
use tracing::error;

mod messages;
mod read_state;
mod rooms;

pub use messages::{
    add_reaction, list_messages, list_thread, remove_reaction, send_message, DEFAULT_PAGE_SIZE,
    MAX_CONTENT_BYTES, MAX_PAGE_SIZE,
};
pub use read_state::{mark_read, unread_counts};
pub use rooms::{create_group, create_or_get_dm, list_participants, list_rooms, login};

#[derive(Clone)]
pub struct ApiContext {
    pub storage: Storage,
    pub publisher: Arc<dyn ChannelPublisher>,
}

impl ApiContext {
    pub fn new(storage: Storage, publisher: Arc<dyn ChannelPublisher>) -> Self {
        Self { storage, publisher }
    }
}

/// Checks that `user_id` may follow the live channel of `room_id`.
pub async fn authorize_room_channel(
    ctx: &ApiContext,
    user_id: UserId,
    room_id: RoomId,
) -> Result<(), ApiError> {
    authenticate(ctx, user_id).await?;
    ensure_room_access(ctx, room_id, user_id).await?;
    Ok(())
}

/// Resolves the caller to a known user; anything else is unauthenticated.
async fn authenticate(ctx: &ApiContext, user_id: UserId) -> Result<String, ApiError> {
    ctx.storage
        .username_for_user(user_id)
        .await
        .map_err(store_failure)?
        .ok_or_else(|| ApiError::unauthorized("unknown caller"))
}

/// Channel rooms are open to any authenticated user; DMs and groups require
/// participation.
async fn ensure_room_access(
    ctx: &ApiContext,
    room_id: RoomId,
    user_id: UserId,
) -> Result<RoomKind, ApiError> {
    let kind = ctx
        .storage
        .room_kind(room_id)
        .await
        .map_err(store_failure)?
        .ok_or_else(|| ApiError::not_found("room not found"))?;
    if kind == RoomKind::Channel {
        return Ok(kind);
    }
    let member = ctx
        .storage
        .is_participant(room_id, user_id)
        .await
        .map_err(store_failure)?;
    if !member {
        return Err(ApiError::forbidden("user is not a participant of this room"));
    }
    Ok(kind)
}

fn store_failure(err: anyhow::Error) -> ApiError {
    error!(error = %format!("{err:#}"), "store operation failed");
    ApiError::new(ErrorCode::Store, err.to_string())
}

#[cfg(test)]
#[path = "tests/support.rs"]
mod test_support;
