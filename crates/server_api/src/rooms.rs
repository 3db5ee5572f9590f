use std::collections::BTreeSet;

use shared::{
    domain::{RoomId, RoomKind, RoomSummary, UserId},
    error::ApiError,
    protocol::{ParticipantSummary, RoomCreatedResponse},
};
use tracing::info;

use crate::{authenticate, ensure_room_access, store_failure, ApiContext};

const MAX_USERNAME_BYTES: usize = 64;
const MAX_ROOM_NAME_BYTES: usize = 100;

/// Resolves or registers `username`. Stands in for the external identity
/// provider; every other call only trusts the returned id.
pub async fn login(ctx: &ApiContext, username: &str) -> Result<UserId, ApiError> {
    let username = username.trim();
    if username.is_empty() || username.len() > MAX_USERNAME_BYTES {
        return Err(ApiError::validation("invalid username"));
    }
    if username.chars().any(char::is_whitespace) {
        return Err(ApiError::validation("username must not contain whitespace"));
    }
    ctx.storage
        .create_user(username)
        .await
        .map_err(store_failure)
}

pub async fn create_or_get_dm(
    ctx: &ApiContext,
    user_id: UserId,
    target_user_id: UserId,
) -> Result<RoomCreatedResponse, ApiError> {
    authenticate(ctx, user_id).await?;
    if target_user_id == user_id {
        return Err(ApiError::validation("cannot open a direct message with yourself"));
    }
    ctx.storage
        .username_for_user(target_user_id)
        .await
        .map_err(store_failure)?
        .ok_or_else(|| ApiError::not_found("target user not found"))?;

    let (room_id, created) = ctx
        .storage
        .get_or_create_dm(user_id, target_user_id)
        .await
        .map_err(store_failure)?;
    if created {
        info!(room_id = room_id.0, user_id = user_id.0, target = target_user_id.0, "direct message opened");
    }
    Ok(RoomCreatedResponse {
        room_id,
        kind: RoomKind::Dm,
        created,
    })
}

/// Creates a group room with the caller and every listed member as
/// participants. Duplicate member ids collapse into one participant.
pub async fn create_group(
    ctx: &ApiContext,
    user_id: UserId,
    name: &str,
    member_ids: &[UserId],
) -> Result<RoomCreatedResponse, ApiError> {
    authenticate(ctx, user_id).await?;
    let name = name.trim();
    if name.is_empty() || name.len() > MAX_ROOM_NAME_BYTES {
        return Err(ApiError::validation("invalid group name"));
    }

    let mut members = BTreeSet::from([user_id]);
    members.extend(member_ids.iter().copied());
    for member in &members {
        ctx.storage
            .username_for_user(*member)
            .await
            .map_err(store_failure)?
            .ok_or_else(|| ApiError::not_found(format!("user {} not found", member.0)))?;
    }

    let room_id = ctx
        .storage
        .create_room(RoomKind::Group, Some(name), None)
        .await
        .map_err(store_failure)?;
    for member in members.iter().copied() {
        ctx.storage
            .add_participant(room_id, member)
            .await
            .map_err(store_failure)?;
    }
    info!(room_id = room_id.0, members = members.len(), "group created");

    Ok(RoomCreatedResponse {
        room_id,
        kind: RoomKind::Group,
        created: true,
    })
}

pub async fn list_rooms(ctx: &ApiContext, user_id: UserId) -> Result<Vec<RoomSummary>, ApiError> {
    authenticate(ctx, user_id).await?;
    ctx.storage
        .list_rooms_for_user(user_id)
        .await
        .map_err(store_failure)
}

pub async fn list_participants(
    ctx: &ApiContext,
    user_id: UserId,
    room_id: RoomId,
) -> Result<Vec<ParticipantSummary>, ApiError> {
    authenticate(ctx, user_id).await?;
    ensure_room_access(ctx, room_id, user_id).await?;
    let participants = ctx
        .storage
        .list_participants(room_id)
        .await
        .map_err(store_failure)?;
    Ok(participants
        .into_iter()
        .map(|(user_id, username)| ParticipantSummary { user_id, username })
        .collect())
}

#[cfg(test)]
#[path = "tests/rooms_tests.rs"]
mod tests;
