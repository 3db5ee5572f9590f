use std::sync::Arc;

use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    Json,
};
use chrono::{DateTime, Utc};
use serde::Deserialize;
use server_api::{
    add_reaction, create_group, create_or_get_dm, list_messages, list_participants, list_rooms,
    list_thread, login, mark_read, remove_reaction, send_message, unread_counts,
};
use shared::{
    domain::{Message, MessageId, ReactionSummary, RoomId, RoomSummary, UnreadCount, UserId},
    error::{ApiError, ErrorCode},
    protocol::{
        CreateDmRequest, CreateGroupRequest, LoginRequest, LoginResponse, MarkReadRequest,
        ParticipantSummary, ReactionRequest, RoomCreatedResponse, SendMessageRequest,
    },
};
use tracing::error;

use crate::app_state::AppState;

type HttpResult<T> = Result<Json<T>, (StatusCode, Json<ApiError>)>;

#[derive(Debug, Deserialize)]
pub(crate) struct UserQuery {
    user_id: i64,
}

#[derive(Debug, Deserialize)]
pub(crate) struct ListMessagesQuery {
    user_id: i64,
    limit: Option<u32>,
    before: Option<DateTime<Utc>>,
}

pub(crate) fn status_for(code: ErrorCode) -> StatusCode {
    match code {
        ErrorCode::Unauthorized => StatusCode::UNAUTHORIZED,
        ErrorCode::Forbidden => StatusCode::FORBIDDEN,
        ErrorCode::NotFound => StatusCode::NOT_FOUND,
        ErrorCode::Validation => StatusCode::BAD_REQUEST,
        ErrorCode::Unavailable => StatusCode::SERVICE_UNAVAILABLE,
        ErrorCode::Store | ErrorCode::Internal => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

pub(crate) fn reject(err: ApiError) -> (StatusCode, Json<ApiError>) {
    (status_for(err.code), Json(err))
}

pub(crate) async fn healthz(
    State(state): State<Arc<AppState>>,
) -> Result<&'static str, (StatusCode, Json<ApiError>)> {
    state.api.storage.health_check().await.map_err(|e| {
        error!(error = %e, "health check failed");
        (
            StatusCode::SERVICE_UNAVAILABLE,
            Json(ApiError::new(ErrorCode::Unavailable, e.to_string())),
        )
    })?;
    Ok("ok")
}

pub(crate) async fn http_login(
    State(state): State<Arc<AppState>>,
    Json(req): Json<LoginRequest>,
) -> HttpResult<LoginResponse> {
    let user_id = login(&state.api, &req.username).await.map_err(reject)?;
    Ok(Json(LoginResponse { user_id }))
}

pub(crate) async fn http_list_rooms(
    State(state): State<Arc<AppState>>,
    Query(q): Query<UserQuery>,
) -> HttpResult<Vec<RoomSummary>> {
    let rooms = list_rooms(&state.api, UserId(q.user_id))
        .await
        .map_err(reject)?;
    Ok(Json(rooms))
}

pub(crate) async fn http_list_messages(
    State(state): State<Arc<AppState>>,
    Path(room_id): Path<i64>,
    Query(q): Query<ListMessagesQuery>,
) -> HttpResult<Vec<Message>> {
    let messages = list_messages(
        &state.api,
        UserId(q.user_id),
        RoomId(room_id),
        q.limit,
        q.before,
    )
    .await
    .map_err(reject)?;
    Ok(Json(messages))
}

pub(crate) async fn http_list_thread(
    State(state): State<Arc<AppState>>,
    Path(message_id): Path<i64>,
    Query(q): Query<UserQuery>,
) -> HttpResult<Vec<Message>> {
    let replies = list_thread(&state.api, UserId(q.user_id), MessageId(message_id))
        .await
        .map_err(reject)?;
    Ok(Json(replies))
}

pub(crate) async fn http_send_message(
    State(state): State<Arc<AppState>>,
    Json(req): Json<SendMessageRequest>,
) -> HttpResult<Message> {
    let message = send_message(&state.api, req).await.map_err(reject)?;
    Ok(Json(message))
}

pub(crate) async fn http_mark_read(
    State(state): State<Arc<AppState>>,
    Json(req): Json<MarkReadRequest>,
) -> Result<StatusCode, (StatusCode, Json<ApiError>)> {
    mark_read(
        &state.api,
        req.user_id,
        req.channel_id,
        req.last_read_message_id,
    )
    .await
    .map_err(reject)?;
    Ok(StatusCode::NO_CONTENT)
}

pub(crate) async fn http_unread_counts(
    State(state): State<Arc<AppState>>,
    Query(q): Query<UserQuery>,
) -> HttpResult<Vec<UnreadCount>> {
    let counts = unread_counts(&state.api, UserId(q.user_id))
        .await
        .map_err(reject)?;
    Ok(Json(counts))
}

pub(crate) async fn http_create_dm(
    State(state): State<Arc<AppState>>,
    Json(req): Json<CreateDmRequest>,
) -> HttpResult<RoomCreatedResponse> {
    let created = create_or_get_dm(&state.api, req.user_id, req.target_user_id)
        .await
        .map_err(reject)?;
    Ok(Json(created))
}

pub(crate) async fn http_create_group(
    State(state): State<Arc<AppState>>,
    Json(req): Json<CreateGroupRequest>,
) -> HttpResult<RoomCreatedResponse> {
    let created = create_group(&state.api, req.user_id, &req.name, &req.member_ids)
        .await
        .map_err(reject)?;
    Ok(Json(created))
}

pub(crate) async fn http_list_participants(
    State(state): State<Arc<AppState>>,
    Path(room_id): Path<i64>,
    Query(q): Query<UserQuery>,
) -> HttpResult<Vec<ParticipantSummary>> {
    let participants = list_participants(&state.api, UserId(q.user_id), RoomId(room_id))
        .await
        .map_err(reject)?;
    Ok(Json(participants))
}

pub(crate) async fn http_add_reaction(
    State(state): State<Arc<AppState>>,
    Path(message_id): Path<i64>,
    Json(req): Json<ReactionRequest>,
) -> HttpResult<Vec<ReactionSummary>> {
    let reactions = add_reaction(&state.api, req.user_id, MessageId(message_id), &req.emoji)
        .await
        .map_err(reject)?;
    Ok(Json(reactions))
}

pub(crate) async fn http_remove_reaction(
    State(state): State<Arc<AppState>>,
    Path(message_id): Path<i64>,
    Json(req): Json<ReactionRequest>,
) -> HttpResult<Vec<ReactionSummary>> {
    let reactions = remove_reaction(&state.api, req.user_id, MessageId(message_id), &req.emoji)
        .await
        .map_err(reject)?;
    Ok(Json(reactions))
}
