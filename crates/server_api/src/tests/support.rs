use std::sync::Arc;

use pubsub::{ChannelPublisher, InProcessBroker, TransportError};
use shared::domain::{RoomKind, RoomId, UserId};
use storage::Storage;

use crate::ApiContext;

/// Publisher that rejects every broadcast.
pub struct FailingPublisher;

impl ChannelPublisher for FailingPublisher {
    fn publish(
        &self,
        _channel: &str,
        _event: &str,
        _payload: serde_json::Value,
    ) -> Result<(), TransportError> {
        Err(TransportError::Unavailable("publisher down".into()))
    }
}

pub struct Fixture {
    pub ctx: ApiContext,
    pub broker: InProcessBroker,
    pub alice: UserId,
    pub bob: UserId,
    pub room: RoomId,
}

/// Alice and Bob sharing one group room, backed by in-memory storage.
pub async fn fixture() -> Fixture {
    let storage = Storage::new("sqlite::memory:").await.expect("db");
    let alice = storage.create_user("alice").await.expect("alice");
    let bob = storage.create_user("bob").await.expect("bob");
    let room = storage
        .create_room(RoomKind::Group, Some("desk"), None)
        .await
        .expect("room");
    storage.add_participant(room, alice).await.expect("alice joins");
    storage.add_participant(room, bob).await.expect("bob joins");

    let broker = InProcessBroker::new();
    Fixture {
        ctx: ApiContext::new(storage, Arc::new(broker.clone())),
        broker,
        alice,
        bob,
        room,
    }
}

pub fn with_publisher(ctx: &ApiContext, publisher: Arc<dyn ChannelPublisher>) -> ApiContext {
    ApiContext::new(ctx.storage.clone(), publisher)
}
