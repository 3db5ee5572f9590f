use std::time::Duration;

use serde_json::json;

use super::*;
use crate::test_support::{advance, settle, signed_in, FakeBackend, ROOM, OTHER_ROOM};

const BOB: UserId = UserId(2);

fn created(message: &Message) -> BroadcastEvent {
    BroadcastEvent {
        channel: room_channel_name(message.room_id),
        event: MESSAGE_CREATED_EVENT.to_string(),
        payload: serde_json::to_value(message).expect("encode"),
    }
}

fn ids(messages: &[Message]) -> Vec<MessageId> {
    messages.iter().map(|m| m.id).collect()
}

fn drain(events: &mut broadcast::Receiver<ClientEvent>) -> Vec<ClientEvent> {
    let mut out = Vec::new();
    while let Ok(event) = events.try_recv() {
        out.push(event);
    }
    out
}

#[tokio::test(start_paused = true)]
async fn mount_subscribes_once_and_loads_store_order() {
    let h = signed_in().await;
    let a = h.backend.insert(ROOM, BOB, "a", None);
    let b = h.backend.insert(ROOM, BOB, "b", None);

    let _handle = h.client.mount_room(ROOM).await.expect("mount");
    settle().await;

    assert_eq!(ids(&h.client.room_messages(ROOM)), vec![a.id, b.id]);
    assert_eq!(h.client.subscription_state(ROOM), SubscriptionState::Subscribed);
    assert_eq!(h.client.fetch_state(ROOM), FetchState::Ready);
    assert_eq!(h.broker.subscriber_count("room:1"), 1);
}

#[tokio::test(start_paused = true)]
async fn consumers_of_one_room_share_a_subscription() {
    let h = signed_in().await;
    let first = h.client.mount_room(ROOM).await.expect("mount");
    let second = h.client.mount_room(ROOM).await.expect("mount again");
    settle().await;
    assert_eq!(h.broker.subscribe_count(), 1);
    assert_eq!(h.broker.subscriber_count("room:1"), 1);

    drop(first);
    settle().await;
    assert!(h.client.is_mounted(ROOM));
    assert_eq!(h.broker.subscriber_count("room:1"), 1);

    drop(second);
    settle().await;
    assert!(!h.client.is_mounted(ROOM));
    assert_eq!(h.broker.subscriber_count("room:1"), 0);
    assert_eq!(h.client.subscription_state(ROOM), SubscriptionState::Unsubscribed);
}

#[tokio::test(start_paused = true)]
async fn switching_rooms_releases_the_previous_channel() {
    let h = signed_in().await;
    let first = h.client.mount_room(ROOM).await.expect("mount");
    settle().await;

    let next = h
        .client
        .switch_room(first, OTHER_ROOM)
        .await
        .expect("switch");
    settle().await;

    assert_eq!(next.room_id(), OTHER_ROOM);
    assert_eq!(h.broker.subscriber_count("room:1"), 0);
    assert_eq!(h.broker.subscriber_count("room:2"), 1);
    assert!(!h.client.is_mounted(ROOM));
}

#[tokio::test(start_paused = true)]
async fn duplicate_deliveries_leave_one_entry() {
    let h = signed_in().await;
    let _handle = h.client.mount_room(ROOM).await.expect("mount");
    settle().await;

    let message = h.backend.insert(ROOM, BOB, "once", None);
    h.client.receive(ROOM, &created(&message)).expect("first");
    h.client.receive(ROOM, &created(&message)).expect("second");

    assert_eq!(ids(&h.client.room_messages(ROOM)), vec![message.id]);
}

#[tokio::test(start_paused = true)]
async fn events_without_an_id_are_rejected() {
    let h = signed_in().await;
    for payload in [json!({ "content": "x" }), json!({ "id": null, "content": "x" })] {
        let event = BroadcastEvent {
            channel: "room:1".into(),
            event: MESSAGE_CREATED_EVENT.into(),
            payload,
        };
        assert!(matches!(
            h.client.receive(ROOM, &event),
            Err(SyncError::MissingEventId)
        ));
    }
    assert!(h.client.room_messages(ROOM).is_empty());
}

#[tokio::test(start_paused = true)]
async fn replies_bump_the_root_once_and_fill_open_threads() {
    let h = signed_in().await;
    let root = h.backend.insert(ROOM, BOB, "root", None);
    let _handle = h.client.mount_room(ROOM).await.expect("mount");
    settle().await;

    let reply = h.backend.insert(ROOM, BOB, "first", Some(root.id));
    h.client.receive(ROOM, &created(&reply)).expect("reply");
    h.client.receive(ROOM, &created(&reply)).expect("reply again");

    let top = h.client.room_messages(ROOM);
    assert_eq!(ids(&top), vec![root.id]);
    assert_eq!(top[0].reply_count, 1);
    assert_eq!(top[0].last_reply_at, Some(reply.created_at));

    // Never opened, so the reply leaves no thread entry behind.
    assert!(h.client.lock().cache.get(CacheKey::Thread(root.id)).is_none());
    let calls = h.backend.thread_calls();
    let view = h.client.open_thread(root.id).await.expect("open");
    assert_eq!(h.backend.thread_calls(), calls + 1);
    assert_eq!(view.total, 1);

    let nested = h.backend.insert(ROOM, BOB, "nested", Some(reply.id));
    h.client.receive(ROOM, &created(&nested)).expect("nested");

    let entries = h.client.thread_entries(root.id);
    let shape = entries
        .iter()
        .map(|e| (e.message.id, e.depth))
        .collect::<Vec<_>>();
    assert_eq!(shape, vec![(reply.id, 1), (nested.id, 2)]);
    assert_eq!(entries[0].message.reply_count, 1);
    assert_eq!(h.client.room_messages(ROOM)[0].reply_count, 1);

    h.client.open_thread(root.id).await.expect("reopen");
    assert_eq!(h.backend.thread_calls(), calls + 1);
}

#[tokio::test(start_paused = true)]
async fn nested_replies_count_against_their_direct_parent() {
    let h = signed_in().await;
    let root = h.backend.insert(ROOM, BOB, "root", None);
    let child = h.backend.insert(ROOM, BOB, "child", Some(root.id));
    let _handle = h.client.mount_room(ROOM).await.expect("mount");
    h.client.open_thread(root.id).await.expect("open");
    settle().await;
    let mut events = h.client.subscribe_events();

    let grandchild = h.backend.insert(ROOM, BOB, "grandchild", Some(child.id));
    h.client.receive(ROOM, &created(&grandchild)).expect("grandchild");
    h.client.receive(ROOM, &created(&grandchild)).expect("grandchild again");

    let parent = || {
        h.client
            .thread_entries(root.id)
            .into_iter()
            .find(|e| e.message.id == child.id)
            .expect("child cached")
            .message
    };
    let cached = parent();
    assert_eq!(cached.reply_count, 1);
    assert_eq!(cached.last_reply_at, Some(grandchild.created_at));
    assert_eq!(h.client.room_messages(ROOM)[0].reply_count, 1);
    assert!(drain(&mut events).contains(&ClientEvent::ThreadUpdated { root_id: root.id }));

    // The poll refetches the open thread; the store's count replaces ours.
    advance(Duration::from_secs(10)).await;
    let cached = parent();
    assert_eq!(cached.reply_count, 1);
    assert_eq!(cached.last_reply_at, Some(grandchild.created_at));
    assert_eq!(h.client.room_messages(ROOM)[0].reply_count, 1);
}

#[tokio::test(start_paused = true)]
async fn reconciliation_does_not_count_a_reply_twice() {
    let h = signed_in().await;
    let root = h.backend.insert(ROOM, BOB, "root", None);
    let _handle = h.client.mount_room(ROOM).await.expect("mount");
    settle().await;

    let reply = h.backend.insert(ROOM, BOB, "late", Some(root.id));
    advance(Duration::from_secs(10)).await;
    assert_eq!(h.client.room_messages(ROOM)[0].reply_count, 1);

    // The broadcast shows up after the poll already counted it.
    h.client.receive(ROOM, &created(&reply)).expect("late echo");
    assert_eq!(h.client.room_messages(ROOM)[0].reply_count, 1);
}

#[tokio::test(start_paused = true)]
async fn safety_poll_restores_store_order() {
    let h = signed_in().await;
    let a = h.backend.insert(ROOM, BOB, "a", None);
    let _handle = h.client.mount_room(ROOM).await.expect("mount");
    settle().await;

    let b = h.backend.insert(ROOM, BOB, "b", None);
    let c = h.backend.insert(ROOM, BOB, "c", None);
    h.client.receive(ROOM, &created(&c)).expect("c");
    h.client.receive(ROOM, &created(&b)).expect("b");
    assert_eq!(ids(&h.client.room_messages(ROOM)), vec![a.id, c.id, b.id]);

    let fetches = h.backend.top_level_calls();
    advance(Duration::from_secs(9)).await;
    assert_eq!(h.backend.top_level_calls(), fetches);

    advance(Duration::from_secs(1)).await;
    assert_eq!(h.backend.top_level_calls(), fetches + 1);
    assert_eq!(ids(&h.client.room_messages(ROOM)), vec![a.id, b.id, c.id]);
}

#[tokio::test(start_paused = true)]
async fn channel_error_reconciles_and_stays_subscribed() {
    let h = signed_in().await;
    let _handle = h.client.mount_room(ROOM).await.expect("mount");
    settle().await;
    let fetches = h.backend.top_level_calls();

    h.broker.inject_status("room:1", ChannelStatus::ChannelError);
    settle().await;

    assert_eq!(h.backend.top_level_calls(), fetches + 1);
    assert_eq!(h.client.subscription_state(ROOM), SubscriptionState::Subscribed);
    assert_eq!(h.broker.subscriber_count("room:1"), 1);
    assert_eq!(h.broker.subscribe_count(), 1);
}

#[tokio::test(start_paused = true)]
async fn timeout_reconciles_and_resubscribes_exactly_once() {
    let h = signed_in().await;
    let a = h.backend.insert(ROOM, BOB, "a", None);
    let _handle = h.client.mount_room(ROOM).await.expect("mount");
    settle().await;
    assert_eq!(h.broker.subscribe_count(), 1);
    let fetches = h.backend.top_level_calls();

    h.broker.inject_status("room:1", ChannelStatus::TimedOut);
    settle().await;
    assert_eq!(h.backend.top_level_calls(), fetches + 1);
    assert_eq!(h.client.subscription_state(ROOM), SubscriptionState::Subscribing);
    assert_eq!(h.broker.subscriber_count("room:1"), 0);

    advance(Duration::from_millis(1_900)).await;
    assert_eq!(h.broker.subscribe_count(), 1);

    advance(Duration::from_millis(100)).await;
    assert_eq!(h.broker.subscribe_count(), 2);
    assert_eq!(h.client.subscription_state(ROOM), SubscriptionState::Subscribed);
    assert_eq!(h.broker.subscriber_count("room:1"), 1);

    advance(Duration::from_secs(10)).await;
    assert_eq!(h.broker.subscribe_count(), 2);

    let b = h
        .backend
        .send_message(SendMessageRequest {
            user_id: BOB,
            room_id: ROOM,
            content: "after".into(),
            kind: MessageKind::Text,
            parent_message_id: None,
        })
        .await
        .expect("bob sends");
    settle().await;
    h.client.receive(ROOM, &created(&b)).expect("replayed");
    assert_eq!(ids(&h.client.room_messages(ROOM)), vec![a.id, b.id]);
}

#[tokio::test(start_paused = true)]
async fn messages_sent_while_offline_arrive_within_one_poll() {
    let h = signed_in().await;
    let a = h.backend.insert(ROOM, BOB, "a", None);
    let b = h.backend.insert(ROOM, BOB, "b", None);
    let _handle = h.client.mount_room(ROOM).await.expect("mount");
    settle().await;

    h.backend.set_offline(true);
    h.broker.set_offline(true);
    let c = h.backend.insert(ROOM, BOB, "c", None);
    advance(Duration::from_secs(10)).await;
    assert!(matches!(h.client.fetch_state(ROOM), FetchState::Error(_)));
    assert_eq!(ids(&h.client.room_messages(ROOM)), vec![a.id, b.id]);

    h.backend.set_offline(false);
    h.broker.set_offline(false);
    advance(Duration::from_secs(10)).await;
    assert_eq!(ids(&h.client.room_messages(ROOM)), vec![a.id, b.id, c.id]);
    assert_eq!(h.client.fetch_state(ROOM), FetchState::Ready);
}

#[tokio::test(start_paused = true)]
async fn failed_first_fetch_still_mounts_and_recovers() {
    let h = signed_in().await;
    let a = h.backend.insert(ROOM, BOB, "a", None);
    let mut events = h.client.subscribe_events();
    h.backend.set_offline(true);

    let _handle = h.client.mount_room(ROOM).await.expect("mount");
    settle().await;
    assert!(matches!(h.client.fetch_state(ROOM), FetchState::Error(_)));
    assert!(drain(&mut events)
        .iter()
        .any(|e| matches!(e, ClientEvent::FetchFailed { room_id, .. } if *room_id == ROOM)));

    h.backend.set_offline(false);
    advance(Duration::from_secs(10)).await;
    assert_eq!(h.client.fetch_state(ROOM), FetchState::Ready);
    assert_eq!(ids(&h.client.room_messages(ROOM)), vec![a.id]);
}

#[tokio::test(start_paused = true)]
async fn connectivity_regained_resubscribes_and_reconciles() {
    let h = signed_in().await;
    h.broker.set_offline(true);
    let _handle = h.client.mount_room(ROOM).await.expect("mount");
    settle().await;
    assert_eq!(h.client.subscription_state(ROOM), SubscriptionState::Unsubscribed);

    h.client.on_connectivity_change(false).await;
    h.broker.set_offline(false);
    let fetches = h.backend.top_level_calls();
    h.client.on_connectivity_change(true).await;
    settle().await;

    assert_eq!(h.client.subscription_state(ROOM), SubscriptionState::Subscribed);
    assert_eq!(h.broker.subscriber_count("room:1"), 1);
    assert_eq!(h.backend.top_level_calls(), fetches + 1);
}

#[tokio::test(start_paused = true)]
async fn safety_poll_retries_a_failed_subscription() {
    let h = signed_in().await;
    h.broker.set_offline(true);
    let _handle = h.client.mount_room(ROOM).await.expect("mount");
    settle().await;
    h.broker.set_offline(false);

    advance(Duration::from_secs(10)).await;
    assert_eq!(h.client.subscription_state(ROOM), SubscriptionState::Subscribed);
}

#[tokio::test(start_paused = true)]
async fn becoming_visible_reconciles() {
    let h = signed_in().await;
    let _handle = h.client.mount_room(ROOM).await.expect("mount");
    settle().await;
    let fetches = h.backend.top_level_calls();

    h.client.on_visibility_change(true).await;
    assert_eq!(h.backend.top_level_calls(), fetches);

    h.client.on_visibility_change(false).await;
    h.client.on_visibility_change(true).await;
    assert_eq!(h.backend.top_level_calls(), fetches + 1);
}

#[tokio::test(start_paused = true)]
async fn own_send_appears_at_once_and_echo_is_absorbed() {
    let h = signed_in().await;
    let _handle = h.client.mount_room(ROOM).await.expect("mount");
    settle().await;

    let sent = h
        .client
        .send(ROOM, "hello", MessageKind::Text, None)
        .await
        .expect("send");
    assert_eq!(ids(&h.client.room_messages(ROOM)), vec![sent.id]);

    settle().await;
    assert_eq!(ids(&h.client.room_messages(ROOM)), vec![sent.id]);

    assert!(matches!(
        h.client.send(ROOM, "   ", MessageKind::Text, None).await,
        Err(SyncError::Validation(_))
    ));
}

#[tokio::test(start_paused = true)]
async fn older_pages_are_prepended() {
    let h = signed_in().await;
    for i in 0..60 {
        h.backend.insert(ROOM, BOB, &format!("m{i}"), None);
    }
    let _handle = h.client.mount_room(ROOM).await.expect("mount");
    settle().await;
    let first_page = h.client.room_messages(ROOM);
    assert_eq!(first_page.len(), 50);
    assert_eq!(first_page[0].id, MessageId(11));

    assert_eq!(h.client.load_older(ROOM).await.expect("older"), 10);
    let all = h.client.room_messages(ROOM);
    assert_eq!(all.len(), 60);
    assert_eq!(all[0].id, MessageId(1));
    assert_eq!(h.client.load_older(ROOM).await.expect("nothing left"), 0);

    advance(Duration::from_secs(10)).await;
    assert_eq!(h.client.room_messages(ROOM).len(), 60);
}

#[tokio::test(start_paused = true)]
async fn mark_read_clears_unread_and_mentions() {
    let h = signed_in().await;
    h.backend.insert(ROOM, BOB, "one", None);
    let last = h.backend.insert(ROOM, BOB, "two", None);

    h.client.refresh_unread().await.expect("refresh");
    assert_eq!(h.client.unread_for(ROOM).map(|c| c.unread_count), Some(2));

    h.client.mark_read(ROOM, last.id).await.expect("mark read");
    let counts = h.client.unread_for(ROOM).expect("room counted");
    assert_eq!((counts.unread_count, counts.mention_count), (0, 0));
}

#[tokio::test(start_paused = true)]
async fn unread_counts_refresh_on_their_own_interval() {
    let h = signed_in().await;
    assert_eq!(h.client.unread_for(ROOM), None);

    h.backend.insert(ROOM, BOB, "ping", None);
    advance(Duration::from_secs(30)).await;
    assert_eq!(h.client.unread_for(ROOM).map(|c| c.unread_count), Some(1));
}

#[tokio::test(start_paused = true)]
async fn thread_view_collapses_to_latest_reply() {
    let h = signed_in().await;
    let root = h.backend.insert(ROOM, BOB, "root", None);
    for text in ["r1", "r2", "r3"] {
        h.backend.insert(ROOM, BOB, text, Some(root.id));
    }

    let view = h.client.open_thread(root.id).await.expect("open");
    assert_eq!(view.visible.len(), 1);
    assert_eq!(view.visible[0].message.content, "r3");
    assert_eq!(view.hidden_count, 2);

    assert!(h.client.toggle_thread(root.id));
    assert_eq!(h.client.thread_view(root.id).visible.len(), 3);

    h.client.collapse_thread(root.id);
    h.client.collapse_thread(root.id);
    assert_eq!(h.client.thread_view(root.id).hidden_count, 2);
}

#[tokio::test(start_paused = true)]
async fn reactions_update_cached_messages_in_place() {
    let h = signed_in().await;
    let a = h.backend.insert(ROOM, BOB, "a", None);
    let b = h.backend.insert(ROOM, BOB, "b", None);
    let _handle = h.client.mount_room(ROOM).await.expect("mount");
    settle().await;

    let event = BroadcastEvent {
        channel: "room:1".into(),
        event: REACTION_CHANGED_EVENT.into(),
        payload: json!({
            "id": a.id,
            "room_id": ROOM,
            "reactions": [{ "emoji": "fire", "count": 1, "user_ids": [2] }],
        }),
    };
    h.client.receive(ROOM, &event).expect("reaction");
    let messages = h.client.room_messages(ROOM);
    assert_eq!(ids(&messages), vec![a.id, b.id]);
    assert_eq!(messages[0].reactions[0].emoji, "fire");

    let summary = h.client.add_reaction(b.id, "rocket").await.expect("react");
    assert_eq!(h.client.room_messages(ROOM)[1].reactions, summary);
    assert_eq!(h.backend.stored(b.id).reactions, summary);
}

#[tokio::test(start_paused = true)]
async fn sign_out_releases_everything() {
    let h = signed_in().await;
    h.backend.insert(ROOM, BOB, "a", None);
    let handle = h.client.mount_room(ROOM).await.expect("mount");
    settle().await;
    h.client.refresh_unread().await.expect("unread");

    h.client.sign_out();
    assert_eq!(h.broker.subscriber_count("room:1"), 0);
    assert!(!h.client.is_mounted(ROOM));
    assert!(h.client.room_messages(ROOM).is_empty());
    assert!(h.client.unread_counts().is_empty());
    assert!(h.client.current_user().is_none());

    drop(handle);
    let fetches = h.backend.top_level_calls();
    advance(Duration::from_secs(30)).await;
    assert_eq!(h.backend.top_level_calls(), fetches);

    assert!(matches!(
        h.client.mount_room(ROOM).await,
        Err(SyncError::NotSignedIn)
    ));
}

#[tokio::test(start_paused = true)]
async fn dm_creation_is_idempotent_through_the_client() {
    let h = signed_in().await;
    let first = h.client.create_or_get_dm(BOB).await.expect("dm");
    let second = h.client.create_or_get_dm(BOB).await.expect("dm again");
    assert!(first.created);
    assert!(!second.created);
    assert_eq!(first.room_id, second.room_id);
}

#[tokio::test]
async fn calls_before_sign_in_fail_fast() {
    let backend = FakeBackend::new(None);
    let client = ChatClient::new(
        backend,
        Arc::new(pubsub::InProcessBroker::new()),
        SyncConfig::default(),
    );
    assert!(matches!(
        client.send(ROOM, "hi", MessageKind::Text, None).await,
        Err(SyncError::NotSignedIn)
    ));
    assert!(matches!(
        client.refresh_unread().await,
        Err(SyncError::NotSignedIn)
    ));
}
