use async_trait::async_trait;
use chrono::{DateTime, Utc};
use reqwest::{Client, RequestBuilder};
use serde::de::DeserializeOwned;
use server_api::ApiContext;
use shared::{
    domain::{Message, MessageId, ReactionSummary, RoomId, RoomSummary, UnreadCount, UserId},
    error::{ApiError, ErrorCode},
    protocol::{
        CreateDmRequest, CreateGroupRequest, LoginRequest, LoginResponse, MarkReadRequest,
        ParticipantSummary, ReactionRequest, RoomCreatedResponse, SendMessageRequest,
    },
};
use tracing::debug;

/// The authoritative side of the conversation: the send pipeline, the message
/// store queries and room management. Every call names its caller explicitly.
#[async_trait]
pub trait ChatBackend: Send + Sync {
    async fn login(&self, username: &str) -> Result<UserId, ApiError>;
    async fn send_message(&self, request: SendMessageRequest) -> Result<Message, ApiError>;
    async fn list_top_level(
        &self,
        user_id: UserId,
        room_id: RoomId,
        before: Option<DateTime<Utc>>,
        limit: u32,
    ) -> Result<Vec<Message>, ApiError>;
    async fn list_thread(
        &self,
        user_id: UserId,
        parent_id: MessageId,
    ) -> Result<Vec<Message>, ApiError>;
    async fn mark_read(
        &self,
        user_id: UserId,
        channel_id: RoomId,
        last_read_message_id: MessageId,
    ) -> Result<(), ApiError>;
    async fn unread_counts(&self, user_id: UserId) -> Result<Vec<UnreadCount>, ApiError>;
    async fn create_or_get_dm(
        &self,
        user_id: UserId,
        target_user_id: UserId,
    ) -> Result<RoomCreatedResponse, ApiError>;
    async fn create_group(
        &self,
        user_id: UserId,
        name: &str,
        member_ids: &[UserId],
    ) -> Result<RoomCreatedResponse, ApiError>;
    async fn list_rooms(&self, user_id: UserId) -> Result<Vec<RoomSummary>, ApiError>;
    async fn list_participants(
        &self,
        user_id: UserId,
        room_id: RoomId,
    ) -> Result<Vec<ParticipantSummary>, ApiError>;
    async fn add_reaction(
        &self,
        user_id: UserId,
        message_id: MessageId,
        emoji: &str,
    ) -> Result<Vec<ReactionSummary>, ApiError>;
    async fn remove_reaction(
        &self,
        user_id: UserId,
        message_id: MessageId,
        emoji: &str,
    ) -> Result<Vec<ReactionSummary>, ApiError>;
}

/// Talks to the HTTP surface of the server.
#[derive(Clone)]
pub struct HttpBackend {
    http: Client,
    server_url: String,
}

impl HttpBackend {
    pub fn new(server_url: impl Into<String>) -> Self {
        Self {
            http: Client::new(),
            server_url: server_url.into().trim_end_matches('/').to_string(),
        }
    }

    pub fn server_url(&self) -> &str {
        &self.server_url
    }

    fn url(&self, path: &str) -> String {
        format!("{}{path}", self.server_url)
    }

    async fn json<T: DeserializeOwned>(&self, request: RequestBuilder) -> Result<T, ApiError> {
        let response = send(request).await?;
        response
            .json::<T>()
            .await
            .map_err(|e| ApiError::new(ErrorCode::Internal, format!("malformed response: {e}")))
    }
}

async fn send(request: RequestBuilder) -> Result<reqwest::Response, ApiError> {
    let response = request
        .send()
        .await
        .map_err(|e| ApiError::new(ErrorCode::Unavailable, format!("request failed: {e}")))?;
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }

    let body = response.text().await.unwrap_or_default();
    debug!(%status, %body, "http backend: request rejected");
    Err(serde_json::from_str::<ApiError>(&body).unwrap_or_else(|_| {
        ApiError::new(
            if status.is_server_error() {
                ErrorCode::Unavailable
            } else {
                ErrorCode::Internal
            },
            format!("server returned {status}"),
        )
    }))
}

#[async_trait]
impl ChatBackend for HttpBackend {
    async fn login(&self, username: &str) -> Result<UserId, ApiError> {
        let response: LoginResponse = self
            .json(self.http.post(self.url("/login")).json(&LoginRequest {
                username: username.to_string(),
            }))
            .await?;
        Ok(response.user_id)
    }

    async fn send_message(&self, request: SendMessageRequest) -> Result<Message, ApiError> {
        self.json(self.http.post(self.url("/messages")).json(&request))
            .await
    }

    async fn list_top_level(
        &self,
        user_id: UserId,
        room_id: RoomId,
        before: Option<DateTime<Utc>>,
        limit: u32,
    ) -> Result<Vec<Message>, ApiError> {
        let mut query = vec![
            ("user_id", user_id.0.to_string()),
            ("limit", limit.to_string()),
        ];
        if let Some(before) = before {
            query.push(("before", before.to_rfc3339()));
        }
        self.json(
            self.http
                .get(self.url(&format!("/rooms/{}/messages", room_id.0)))
                .query(&query),
        )
        .await
    }

    async fn list_thread(
        &self,
        user_id: UserId,
        parent_id: MessageId,
    ) -> Result<Vec<Message>, ApiError> {
        self.json(
            self.http
                .get(self.url(&format!("/messages/{}/thread", parent_id.0)))
                .query(&[("user_id", user_id.0)]),
        )
        .await
    }

    async fn mark_read(
        &self,
        user_id: UserId,
        channel_id: RoomId,
        last_read_message_id: MessageId,
    ) -> Result<(), ApiError> {
        send(self.http.post(self.url("/read_state")).json(&MarkReadRequest {
            user_id,
            channel_id,
            last_read_message_id,
        }))
        .await?;
        Ok(())
    }

    async fn unread_counts(&self, user_id: UserId) -> Result<Vec<UnreadCount>, ApiError> {
        self.json(
            self.http
                .get(self.url("/unread"))
                .query(&[("user_id", user_id.0)]),
        )
        .await
    }

    async fn create_or_get_dm(
        &self,
        user_id: UserId,
        target_user_id: UserId,
    ) -> Result<RoomCreatedResponse, ApiError> {
        self.json(self.http.post(self.url("/dms")).json(&CreateDmRequest {
            user_id,
            target_user_id,
        }))
        .await
    }

    async fn create_group(
        &self,
        user_id: UserId,
        name: &str,
        member_ids: &[UserId],
    ) -> Result<RoomCreatedResponse, ApiError> {
        self.json(self.http.post(self.url("/groups")).json(&CreateGroupRequest {
            user_id,
            name: name.to_string(),
            member_ids: member_ids.to_vec(),
        }))
        .await
    }

    async fn list_rooms(&self, user_id: UserId) -> Result<Vec<RoomSummary>, ApiError> {
        self.json(
            self.http
                .get(self.url("/rooms"))
                .query(&[("user_id", user_id.0)]),
        )
        .await
    }

    async fn list_participants(
        &self,
        user_id: UserId,
        room_id: RoomId,
    ) -> Result<Vec<ParticipantSummary>, ApiError> {
        self.json(
            self.http
                .get(self.url(&format!("/rooms/{}/participants", room_id.0)))
                .query(&[("user_id", user_id.0)]),
        )
        .await
    }

    async fn add_reaction(
        &self,
        user_id: UserId,
        message_id: MessageId,
        emoji: &str,
    ) -> Result<Vec<ReactionSummary>, ApiError> {
        self.json(
            self.http
                .post(self.url(&format!("/messages/{}/reactions", message_id.0)))
                .json(&ReactionRequest {
                    user_id,
                    emoji: emoji.to_string(),
                }),
        )
        .await
    }

    async fn remove_reaction(
        &self,
        user_id: UserId,
        message_id: MessageId,
        emoji: &str,
    ) -> Result<Vec<ReactionSummary>, ApiError> {
        self.json(
            self.http
                .delete(self.url(&format!("/messages/{}/reactions", message_id.0)))
                .json(&ReactionRequest {
                    user_id,
                    emoji: emoji.to_string(),
                }),
        )
        .await
    }
}

/// Runs the server-side operations in process, for single-binary setups and tests.
#[async_trait]
impl ChatBackend for ApiContext {
    async fn login(&self, username: &str) -> Result<UserId, ApiError> {
        server_api::login(self, username).await
    }

    async fn send_message(&self, request: SendMessageRequest) -> Result<Message, ApiError> {
        server_api::send_message(self, request).await
    }

    async fn list_top_level(
        &self,
        user_id: UserId,
        room_id: RoomId,
        before: Option<DateTime<Utc>>,
        limit: u32,
    ) -> Result<Vec<Message>, ApiError> {
        server_api::list_messages(self, user_id, room_id, Some(limit), before).await
    }

    async fn list_thread(
        &self,
        user_id: UserId,
        parent_id: MessageId,
    ) -> Result<Vec<Message>, ApiError> {
        server_api::list_thread(self, user_id, parent_id).await
    }

    async fn mark_read(
        &self,
        user_id: UserId,
        channel_id: RoomId,
        last_read_message_id: MessageId,
    ) -> Result<(), ApiError> {
        server_api::mark_read(self, user_id, channel_id, last_read_message_id).await
    }

    async fn unread_counts(&self, user_id: UserId) -> Result<Vec<UnreadCount>, ApiError> {
        server_api::unread_counts(self, user_id).await
    }

    async fn create_or_get_dm(
        &self,
        user_id: UserId,
        target_user_id: UserId,
    ) -> Result<RoomCreatedResponse, ApiError> {
        server_api::create_or_get_dm(self, user_id, target_user_id).await
    }

    async fn create_group(
        &self,
        user_id: UserId,
        name: &str,
        member_ids: &[UserId],
    ) -> Result<RoomCreatedResponse, ApiError> {
        server_api::create_group(self, user_id, name, member_ids).await
    }

    async fn list_rooms(&self, user_id: UserId) -> Result<Vec<RoomSummary>, ApiError> {
        server_api::list_rooms(self, user_id).await
    }

    async fn list_participants(
        &self,
        user_id: UserId,
        room_id: RoomId,
    ) -> Result<Vec<ParticipantSummary>, ApiError> {
        server_api::list_participants(self, user_id, room_id).await
    }

    async fn add_reaction(
        &self,
        user_id: UserId,
        message_id: MessageId,
        emoji: &str,
    ) -> Result<Vec<ReactionSummary>, ApiError> {
        server_api::add_reaction(self, user_id, message_id, emoji).await
    }

    async fn remove_reaction(
        &self,
        user_id: UserId,
        message_id: MessageId,
        emoji: &str,
    ) -> Result<Vec<ReactionSummary>, ApiError> {
        server_api::remove_reaction(self, user_id, message_id, emoji).await
    }
}
