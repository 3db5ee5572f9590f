use std::{
    collections::HashMap,
    sync::{Arc, Mutex, MutexGuard, PoisonError, Weak},
};

use pubsub::{ChannelSubscriber, SubscriptionGuard, TransportSignal};
use shared::{
    domain::{Message, MessageId, MessageKind, ReactionSummary, RoomId, RoomSummary, UnreadCount, UserId},
    protocol::{
        room_channel_name, BroadcastEvent, ChannelStatus, ParticipantSummary,
        ReactionChangedPayload, RoomCreatedResponse, SendMessageRequest, MESSAGE_CREATED_EVENT,
        REACTION_CHANGED_EVENT,
    },
};
use tokio::{
    sync::{broadcast, mpsc},
    task::JoinHandle,
    time::MissedTickBehavior,
};
use tracing::{debug, info, warn};

pub mod backend;
pub mod cache;
pub mod config;
pub mod error;
pub mod read_state;
pub mod thread;
pub mod transport;

pub use backend::{ChatBackend, HttpBackend};
pub use cache::{CacheEntry, CacheKey, MessageCache};
pub use config::SyncConfig;
pub use error::SyncError;
pub use read_state::UnreadTracker;
pub use thread::{display_thread, flatten_thread, ExpansionState, ThreadDisplay, ThreadEntry};
pub use transport::WsTransport;

/// Upper bound on how many top-level messages one reconciliation refetches.
const MAX_RECONCILE_LIMIT: u32 = 500;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubscriptionState {
    Unsubscribed,
    Subscribing,
    Subscribed,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FetchState {
    Idle,
    Loading,
    Ready,
    Error(String),
}

#[derive(Debug, Clone, PartialEq)]
pub enum ClientEvent {
    RoomUpdated { room_id: RoomId },
    ThreadUpdated { root_id: MessageId },
    ReactionsUpdated { message_id: MessageId },
    SubscriptionChanged { room_id: RoomId, state: SubscriptionState },
    Reconciled { room_id: RoomId, messages: usize },
    FetchFailed { room_id: RoomId, message: String },
    UnreadCountsUpdated,
    Error(String),
}

#[derive(Debug, Clone)]
struct Session {
    user_id: UserId,
    username: String,
}

/// Live machinery behind one mounted room. Dropping it stops the room's
/// tasks and releases its transport subscription.
struct RoomRuntime {
    mount_id: u64,
    consumers: usize,
    subscription: SubscriptionState,
    fetch: FetchState,
    guard: Option<SubscriptionGuard>,
    pump: Option<JoinHandle<()>>,
    poller: Option<JoinHandle<()>>,
    resubscribe: Option<JoinHandle<()>>,
    generation: u64,
    fetch_ticket: u64,
}

impl RoomRuntime {
    fn new(mount_id: u64) -> Self {
        Self {
            mount_id,
            consumers: 1,
            subscription: SubscriptionState::Subscribing,
            fetch: FetchState::Idle,
            guard: None,
            pump: None,
            poller: None,
            resubscribe: None,
            generation: 0,
            fetch_ticket: 0,
        }
    }
}

impl Drop for RoomRuntime {
    fn drop(&mut self) {
        for task in [self.pump.take(), self.poller.take(), self.resubscribe.take()]
            .into_iter()
            .flatten()
        {
            task.abort();
        }
        self.guard = None;
    }
}

struct ClientState {
    session: Option<Session>,
    session_epoch: u64,
    cache: MessageCache,
    rooms: HashMap<RoomId, RoomRuntime>,
    unread: UnreadTracker,
    unread_poller: Option<JoinHandle<()>>,
    expansion: ExpansionState,
    next_mount_id: u64,
    visible: bool,
    online: bool,
}

impl ClientState {
    fn mounted(&mut self, room_id: RoomId, mount_id: u64) -> Option<&mut RoomRuntime> {
        self.rooms
            .get_mut(&room_id)
            .filter(|runtime| runtime.mount_id == mount_id)
    }
}

/// Keeps a session's view of its rooms and threads in line with the store.
///
/// Broadcasts are merged as they arrive; the store is re-read on channel
/// trouble, on the safety poll and on environment triggers. Cache mutation
/// happens under one lock that is never held across I/O.
pub struct ChatClient {
    backend: Arc<dyn ChatBackend>,
    transport: Arc<dyn ChannelSubscriber>,
    config: SyncConfig,
    inner: Mutex<ClientState>,
    events: broadcast::Sender<ClientEvent>,
}

/// Keeps a room mounted. The last handle of a room to drop releases its
/// subscription.
pub struct RoomHandle {
    client: Arc<ChatClient>,
    room_id: RoomId,
    mount_id: u64,
}

impl RoomHandle {
    pub fn room_id(&self) -> RoomId {
        self.room_id
    }
}

impl Drop for RoomHandle {
    fn drop(&mut self) {
        self.client.release_room(self.room_id, self.mount_id);
    }
}

impl std::fmt::Debug for RoomHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RoomHandle")
            .field("room_id", &self.room_id)
            .field("mount_id", &self.mount_id)
            .finish()
    }
}

impl ChatClient {
    pub fn new(
        backend: Arc<dyn ChatBackend>,
        transport: Arc<dyn ChannelSubscriber>,
        config: SyncConfig,
    ) -> Arc<Self> {
        let (events, _) = broadcast::channel(1024);
        Arc::new(Self {
            backend,
            transport,
            config,
            inner: Mutex::new(ClientState {
                session: None,
                session_epoch: 0,
                cache: MessageCache::default(),
                rooms: HashMap::new(),
                unread: UnreadTracker::default(),
                unread_poller: None,
                expansion: ExpansionState::default(),
                next_mount_id: 0,
                visible: true,
                online: true,
            }),
            events,
        })
    }

    pub fn config(&self) -> &SyncConfig {
        &self.config
    }

    pub fn subscribe_events(&self) -> broadcast::Receiver<ClientEvent> {
        self.events.subscribe()
    }

    fn lock(&self) -> MutexGuard<'_, ClientState> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn emit(&self, event: ClientEvent) {
        let _ = self.events.send(event);
    }

    fn user_id(&self) -> Result<UserId, SyncError> {
        self.lock()
            .session
            .as_ref()
            .map(|session| session.user_id)
            .ok_or(SyncError::NotSignedIn)
    }

    pub fn current_user(&self) -> Option<(UserId, String)> {
        self.lock()
            .session
            .as_ref()
            .map(|session| (session.user_id, session.username.clone()))
    }

    pub async fn sign_in(self: &Arc<Self>, username: &str) -> Result<UserId, SyncError> {
        let user_id = self.backend.login(username).await?;
        let previous = self.lock().session.as_ref().map(|s| s.user_id);
        if previous.is_some_and(|id| id != user_id) {
            self.sign_out();
        }

        {
            let mut state = self.lock();
            state.session = Some(Session {
                user_id,
                username: username.to_string(),
            });
            state.session_epoch += 1;
            if state.unread_poller.is_none() {
                state.unread_poller = Some(self.spawn_unread_poller());
            }
        }
        info!(user_id = user_id.0, username, "sync: signed in");
        Ok(user_id)
    }

    /// Drops every subscription, task and cached message of the session.
    pub fn sign_out(&self) {
        let (rooms, poller) = {
            let mut state = self.lock();
            state.session = None;
            state.session_epoch += 1;
            state.cache.clear();
            state.unread.clear();
            state.expansion.clear();
            (std::mem::take(&mut state.rooms), state.unread_poller.take())
        };
        if let Some(poller) = poller {
            poller.abort();
        }
        let room_ids = rooms.keys().copied().collect::<Vec<_>>();
        drop(rooms);
        for room_id in room_ids {
            self.emit(ClientEvent::SubscriptionChanged {
                room_id,
                state: SubscriptionState::Unsubscribed,
            });
        }
        info!("sync: signed out");
    }

    /// Mounts `room_id`. The first consumer subscribes to the room channel,
    /// starts the safety poll and fetches the first page; later consumers
    /// share that machinery. A failed first fetch still mounts the room, with
    /// the failure recorded in its fetch state.
    pub async fn mount_room(self: &Arc<Self>, room_id: RoomId) -> Result<RoomHandle, SyncError> {
        self.user_id()?;
        let (mount_id, first) = {
            let mut state = self.lock();
            match state.rooms.get_mut(&room_id) {
                Some(runtime) => {
                    runtime.consumers += 1;
                    (runtime.mount_id, false)
                }
                None => {
                    state.next_mount_id += 1;
                    let mount_id = state.next_mount_id;
                    state.rooms.insert(room_id, RoomRuntime::new(mount_id));
                    (mount_id, true)
                }
            }
        };
        let handle = RoomHandle {
            client: Arc::clone(self),
            room_id,
            mount_id,
        };

        if first {
            debug!(room_id = room_id.0, "sync: mounting room");
            self.emit(ClientEvent::SubscriptionChanged {
                room_id,
                state: SubscriptionState::Subscribing,
            });
            {
                let mut state = self.lock();
                if let Some(runtime) = state.mounted(room_id, mount_id) {
                    runtime.poller = Some(self.spawn_safety_poll(room_id, mount_id));
                }
            }
            self.subscribe_room(room_id, mount_id).await;
            if let Err(error) = self.reconcile_room(room_id).await {
                warn!(room_id = room_id.0, %error, "sync: initial fetch failed");
            }
        }
        Ok(handle)
    }

    /// Releases `current` before mounting `next`, so at most one of the two
    /// subscriptions exists at any time.
    pub async fn switch_room(
        self: &Arc<Self>,
        current: RoomHandle,
        next: RoomId,
    ) -> Result<RoomHandle, SyncError> {
        drop(current);
        self.mount_room(next).await
    }

    fn release_room(&self, room_id: RoomId, mount_id: u64) {
        let released = {
            let mut state = self.lock();
            let last = match state.mounted(room_id, mount_id) {
                Some(runtime) if runtime.consumers > 1 => {
                    runtime.consumers -= 1;
                    false
                }
                Some(_) => true,
                None => false,
            };
            if last {
                state.rooms.remove(&room_id)
            } else {
                None
            }
        };
        if let Some(runtime) = released {
            drop(runtime);
            debug!(room_id = room_id.0, "sync: room unmounted");
            self.emit(ClientEvent::SubscriptionChanged {
                room_id,
                state: SubscriptionState::Unsubscribed,
            });
        }
    }

    pub fn is_mounted(&self, room_id: RoomId) -> bool {
        self.lock().rooms.contains_key(&room_id)
    }

    pub fn subscription_state(&self, room_id: RoomId) -> SubscriptionState {
        self.lock()
            .rooms
            .get(&room_id)
            .map_or(SubscriptionState::Unsubscribed, |runtime| runtime.subscription)
    }

    pub fn fetch_state(&self, room_id: RoomId) -> FetchState {
        self.lock()
            .rooms
            .get(&room_id)
            .map_or(FetchState::Idle, |runtime| runtime.fetch.clone())
    }

    /// Top-level messages of the room in cache order.
    pub fn room_messages(&self, room_id: RoomId) -> Vec<Message> {
        self.lock()
            .cache
            .get(CacheKey::Room(room_id))
            .map(|entry| entry.messages().to_vec())
            .unwrap_or_default()
    }

    async fn subscribe_room(self: &Arc<Self>, room_id: RoomId, mount_id: u64) {
        let generation = {
            let mut state = self.lock();
            let Some(runtime) = state.mounted(room_id, mount_id) else {
                return;
            };
            runtime.generation += 1;
            runtime.subscription = SubscriptionState::Subscribing;
            runtime.generation
        };

        let channel = room_channel_name(room_id);
        match self.transport.subscribe(&channel).await {
            Ok(subscription) => {
                let (guard, signals) = subscription.into_parts();
                let mut state = self.lock();
                let Some(runtime) = state
                    .mounted(room_id, mount_id)
                    .filter(|runtime| runtime.generation == generation)
                else {
                    debug!(room_id = room_id.0, "sync: dropping superseded subscription");
                    return;
                };
                runtime.guard = Some(guard);
                let pump = self.spawn_pump(room_id, mount_id, generation, signals);
                if let Some(previous) = runtime.pump.replace(pump) {
                    previous.abort();
                }
            }
            Err(error) => {
                warn!(room_id = room_id.0, %error, "sync: subscribe failed");
                let changed = {
                    let mut state = self.lock();
                    match state
                        .mounted(room_id, mount_id)
                        .filter(|runtime| runtime.generation == generation)
                    {
                        Some(runtime) => {
                            runtime.subscription = SubscriptionState::Unsubscribed;
                            true
                        }
                        None => false,
                    }
                };
                if changed {
                    self.emit(ClientEvent::SubscriptionChanged {
                        room_id,
                        state: SubscriptionState::Unsubscribed,
                    });
                    self.emit(ClientEvent::Error(format!(
                        "subscribe to room {} failed: {error}",
                        room_id.0
                    )));
                }
            }
        }
    }

    fn spawn_pump(
        self: &Arc<Self>,
        room_id: RoomId,
        mount_id: u64,
        generation: u64,
        mut signals: mpsc::UnboundedReceiver<TransportSignal>,
    ) -> JoinHandle<()> {
        let client = Arc::downgrade(self);
        tokio::spawn(async move {
            while let Some(signal) = signals.recv().await {
                let Some(client) = client.upgrade() else {
                    return;
                };
                match signal {
                    TransportSignal::Event(event) => {
                        if let Err(error) = client.receive(room_id, &event) {
                            warn!(room_id = room_id.0, event = %event.event, %error, "sync: rejected broadcast");
                            client.emit(ClientEvent::Error(error.to_string()));
                        }
                    }
                    TransportSignal::Status(status) => {
                        if !client
                            .on_channel_status(room_id, mount_id, generation, status)
                            .await
                        {
                            return;
                        }
                    }
                }
            }
            if let Some(client) = client.upgrade() {
                client
                    .on_channel_status(room_id, mount_id, generation, ChannelStatus::Closed)
                    .await;
            }
        })
    }

    /// Applies one transport status. Returns whether the pump keeps reading.
    async fn on_channel_status(
        self: &Arc<Self>,
        room_id: RoomId,
        mount_id: u64,
        generation: u64,
        status: ChannelStatus,
    ) -> bool {
        let current = self
            .lock()
            .mounted(room_id, mount_id)
            .is_some_and(|runtime| runtime.generation == generation);
        if !current {
            return false;
        }

        match status {
            ChannelStatus::Subscribed => {
                if let Some(runtime) = self.lock().mounted(room_id, mount_id) {
                    runtime.subscription = SubscriptionState::Subscribed;
                }
                info!(room_id = room_id.0, "sync: channel subscribed");
                self.emit(ClientEvent::SubscriptionChanged {
                    room_id,
                    state: SubscriptionState::Subscribed,
                });
                true
            }
            ChannelStatus::ChannelError => {
                warn!(room_id = room_id.0, "sync: channel error, reconciling");
                self.reconcile_logged(room_id).await;
                true
            }
            ChannelStatus::TimedOut | ChannelStatus::Closed => {
                warn!(room_id = room_id.0, ?status, "sync: channel lost, reconciling");
                let released = {
                    let mut state = self.lock();
                    match state.mounted(room_id, mount_id) {
                        Some(runtime) => {
                            runtime.subscription = SubscriptionState::Subscribing;
                            runtime.pump = None;
                            if runtime.resubscribe.is_none() {
                                runtime.resubscribe =
                                    Some(self.schedule_resubscribe(room_id, mount_id));
                            }
                            runtime.guard.take()
                        }
                        None => None,
                    }
                };
                drop(released);
                self.emit(ClientEvent::SubscriptionChanged {
                    room_id,
                    state: SubscriptionState::Subscribing,
                });
                self.reconcile_logged(room_id).await;
                false
            }
        }
    }

    fn schedule_resubscribe(self: &Arc<Self>, room_id: RoomId, mount_id: u64) -> JoinHandle<()> {
        let client = Arc::downgrade(self);
        let delay = self.config.resubscribe_delay;
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            let Some(client) = client.upgrade() else {
                return;
            };
            {
                let mut state = client.lock();
                let Some(runtime) = state.mounted(room_id, mount_id) else {
                    return;
                };
                runtime.resubscribe = None;
            }
            info!(room_id = room_id.0, "sync: resubscribing");
            client.subscribe_room(room_id, mount_id).await;
        })
    }

    fn spawn_safety_poll(self: &Arc<Self>, room_id: RoomId, mount_id: u64) -> JoinHandle<()> {
        let client: Weak<Self> = Arc::downgrade(self);
        let period = self.config.safety_poll_interval;
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                let Some(client) = client.upgrade() else {
                    return;
                };
                let retry_subscribe = {
                    let mut state = client.lock();
                    let Some(runtime) = state.mounted(room_id, mount_id) else {
                        return;
                    };
                    runtime.subscription == SubscriptionState::Unsubscribed
                        && runtime.resubscribe.is_none()
                };
                if retry_subscribe {
                    client.subscribe_room(room_id, mount_id).await;
                }
                client.reconcile_logged(room_id).await;
            }
        })
    }

    async fn reconcile_logged(&self, room_id: RoomId) {
        if let Err(error) = self.reconcile_room(room_id).await {
            debug!(room_id = room_id.0, %error, "sync: reconciliation failed");
        }
    }

    /// Replaces the room cache with the store's view and refreshes the loaded
    /// threads of the room. Failures land in the room's fetch state.
    pub async fn reconcile_room(&self, room_id: RoomId) -> Result<usize, SyncError> {
        let user_id = self.user_id()?;
        let (mount_id, ticket, limit) = {
            let mut guard = self.lock();
            let state = &mut *guard;
            let cached = state
                .cache
                .get(CacheKey::Room(room_id))
                .map_or(0, CacheEntry::len);
            let Some(runtime) = state.rooms.get_mut(&room_id) else {
                return Err(SyncError::NotMounted(room_id.0));
            };
            runtime.fetch_ticket += 1;
            if runtime.fetch != FetchState::Ready {
                runtime.fetch = FetchState::Loading;
            }
            let cached = u32::try_from(cached).unwrap_or(u32::MAX);
            (
                runtime.mount_id,
                runtime.fetch_ticket,
                cached.max(self.config.page_size).min(MAX_RECONCILE_LIMIT),
            )
        };

        let result = self
            .backend
            .list_top_level(user_id, room_id, None, limit)
            .await;

        let (count, threads) = {
            let mut guard = self.lock();
            let state = &mut *guard;
            let Some(runtime) = state
                .rooms
                .get_mut(&room_id)
                .filter(|runtime| runtime.mount_id == mount_id && runtime.fetch_ticket == ticket)
            else {
                debug!(room_id = room_id.0, "sync: discarding superseded fetch");
                return Ok(0);
            };
            match result {
                Ok(snapshot) => {
                    runtime.fetch = FetchState::Ready;
                    let entry = state.cache.entry(CacheKey::Room(room_id));
                    entry.replace(snapshot);
                    (entry.len(), state.cache.loaded_threads_of(room_id))
                }
                Err(error) => {
                    runtime.fetch = FetchState::Error(error.message.clone());
                    drop(guard);
                    warn!(room_id = room_id.0, code = ?error.code, message = %error.message, "sync: fetch failed");
                    self.emit(ClientEvent::FetchFailed {
                        room_id,
                        message: error.message.clone(),
                    });
                    return Err(error.into());
                }
            }
        };

        debug!(room_id = room_id.0, messages = count, "sync: reconciled");
        self.emit(ClientEvent::RoomUpdated { room_id });
        self.emit(ClientEvent::Reconciled {
            room_id,
            messages: count,
        });
        for root_id in threads {
            if let Err(error) = self.fetch_thread(root_id).await {
                debug!(root_id = root_id.0, %error, "sync: thread refresh failed");
            }
        }
        Ok(count)
    }

    /// Reconciles every mounted room.
    pub async fn reconcile_all(&self) {
        let rooms = self.lock().rooms.keys().copied().collect::<Vec<_>>();
        for room_id in rooms {
            self.reconcile_logged(room_id).await;
        }
    }

    /// Merges one broadcast from the channel of `room_id`.
    pub fn receive(&self, room_id: RoomId, event: &BroadcastEvent) -> Result<(), SyncError> {
        if event
            .payload
            .get("id")
            .map_or(true, serde_json::Value::is_null)
        {
            return Err(SyncError::MissingEventId);
        }

        match event.event.as_str() {
            MESSAGE_CREATED_EVENT => {
                let message: Message = serde_json::from_value(event.payload.clone())?;
                if message.room_id != room_id {
                    debug!(room_id = room_id.0, message_id = message.id.0, "sync: ignoring message for another room");
                    return Ok(());
                }
                self.merge_message(message);
            }
            REACTION_CHANGED_EVENT => {
                let payload: ReactionChangedPayload = serde_json::from_value(event.payload.clone())?;
                self.apply_reactions(payload.id, &payload.reactions);
            }
            other => debug!(room_id = room_id.0, event = other, "sync: ignoring unknown event"),
        }
        Ok(())
    }

    /// Dedup merge shared by broadcasts and own sends.
    ///
    /// A reply bumps its direct parent once per reply id, wherever that parent
    /// is cached: the room list for a top-level parent, the open thread for a
    /// nested one. It then lands in the thread cache if that is loaded.
    /// Threads that were never opened get no cache entry.
    fn merge_message(&self, message: Message) {
        let mut updates = Vec::new();
        {
            let mut guard = self.lock();
            let cache = &mut guard.cache;
            let room_id = message.room_id;
            match (message.thread_root(), message.parent_message_id) {
                (Some(root_id), Some(parent_id)) => {
                    let at = message.created_at;
                    let room_key = CacheKey::Room(room_id);
                    let thread_key = CacheKey::Thread(root_id);
                    let parent_key = [room_key, thread_key].into_iter().find(|key| {
                        cache
                            .get(*key)
                            .is_some_and(|entry| entry.contains(parent_id))
                    });
                    if let Some(key) = parent_key {
                        let counted = cache
                            .get_mut(key)
                            .is_some_and(|entry| entry.count_reply(parent_id, message.id, at));
                        if counted {
                            updates.push(match key {
                                CacheKey::Room(room_id) => ClientEvent::RoomUpdated { room_id },
                                CacheKey::Thread(root_id) => ClientEvent::ThreadUpdated { root_id },
                            });
                        }
                    }

                    if let Some(thread) = cache.get_mut(thread_key) {
                        if !thread.is_loaded() {
                            thread.mark_stale();
                        } else if thread.push(message) {
                            updates.push(ClientEvent::ThreadUpdated { root_id });
                        }
                    }
                }
                _ => {
                    if cache.entry(CacheKey::Room(room_id)).push(message) {
                        updates.push(ClientEvent::RoomUpdated { room_id });
                    }
                }
            }
        }
        for update in updates {
            self.emit(update);
        }
    }

    fn apply_reactions(&self, message_id: MessageId, reactions: &[ReactionSummary]) {
        if self.lock().cache.set_reactions(message_id, reactions) {
            self.emit(ClientEvent::ReactionsUpdated { message_id });
        }
    }

    /// Sends through the pipeline and merges the stored message right away,
    /// so the broadcast echo is absorbed by dedup.
    pub async fn send(
        &self,
        room_id: RoomId,
        content: &str,
        kind: MessageKind,
        parent_message_id: Option<MessageId>,
    ) -> Result<Message, SyncError> {
        let user_id = self.user_id()?;
        if content.trim().is_empty() {
            return Err(SyncError::Validation("message content is empty".into()));
        }
        let message = self
            .backend
            .send_message(SendMessageRequest {
                user_id,
                room_id,
                content: content.to_string(),
                kind,
                parent_message_id,
            })
            .await?;
        debug!(room_id = room_id.0, message_id = message.id.0, "sync: sent");
        self.merge_message(message.clone());
        self.lock().unread.mark_read(room_id);
        self.emit(ClientEvent::UnreadCountsUpdated);
        Ok(message)
    }

    /// Fetches the page before the oldest cached top-level message and puts it
    /// in front. Returns how many messages were added.
    pub async fn load_older(&self, room_id: RoomId) -> Result<usize, SyncError> {
        let user_id = self.user_id()?;
        let (oldest, epoch) = {
            let state = self.lock();
            let oldest = state
                .cache
                .get(CacheKey::Room(room_id))
                .and_then(CacheEntry::oldest)
                .map(|message| message.created_at);
            (oldest, state.session_epoch)
        };
        let Some(before) = oldest else {
            return Ok(0);
        };

        let page = self
            .backend
            .list_top_level(user_id, room_id, Some(before), self.config.page_size)
            .await?;
        let added = {
            let mut state = self.lock();
            if state.session_epoch != epoch {
                return Ok(0);
            }
            state.cache.entry(CacheKey::Room(room_id)).prepend(page)
        };
        if added > 0 {
            self.emit(ClientEvent::RoomUpdated { room_id });
        }
        Ok(added)
    }

    async fn fetch_thread(&self, root_id: MessageId) -> Result<(), SyncError> {
        let user_id = self.user_id()?;
        let epoch = self.lock().session_epoch;
        let rows = self.backend.list_thread(user_id, root_id).await?;
        {
            let mut guard = self.lock();
            let state = &mut *guard;
            if state.session_epoch != epoch {
                return Ok(());
            }
            let room_id = rows
                .first()
                .map(|message| message.room_id)
                .or_else(|| state.cache.room_of(root_id));
            if let Some(room_id) = room_id {
                state.cache.set_thread_room(root_id, room_id);
            }
            state.cache.entry(CacheKey::Thread(root_id)).replace(rows);
        }
        self.emit(ClientEvent::ThreadUpdated { root_id });
        Ok(())
    }

    /// Opens the thread below the top-level message `root_id`, fetching it
    /// when it was never loaded or has gone stale.
    pub async fn open_thread(&self, root_id: MessageId) -> Result<ThreadDisplay, SyncError> {
        let needs_fetch = self
            .lock()
            .cache
            .get(CacheKey::Thread(root_id))
            .map_or(true, |entry| !entry.is_loaded() || entry.is_stale());
        if needs_fetch {
            self.fetch_thread(root_id).await?;
        }
        Ok(self.thread_view(root_id))
    }

    pub fn close_thread(&self, root_id: MessageId) {
        let mut state = self.lock();
        state.cache.remove(CacheKey::Thread(root_id));
        state.expansion.collapse(root_id);
    }

    /// Every cached reply of the thread, flattened.
    pub fn thread_entries(&self, root_id: MessageId) -> Vec<ThreadEntry> {
        let state = self.lock();
        let rows = state
            .cache
            .get(CacheKey::Thread(root_id))
            .map(CacheEntry::messages)
            .unwrap_or_default();
        flatten_thread(root_id, rows)
    }

    /// The part of the thread currently on display.
    pub fn thread_view(&self, root_id: MessageId) -> ThreadDisplay {
        let entries = self.thread_entries(root_id);
        let state = self.lock();
        display_thread(root_id, entries, &state.expansion)
    }

    pub fn expand_thread(&self, root_id: MessageId) {
        self.lock().expansion.expand(root_id);
        self.emit(ClientEvent::ThreadUpdated { root_id });
    }

    pub fn collapse_thread(&self, root_id: MessageId) {
        self.lock().expansion.collapse(root_id);
        self.emit(ClientEvent::ThreadUpdated { root_id });
    }

    pub fn toggle_thread(&self, root_id: MessageId) -> bool {
        let expanded = self.lock().expansion.toggle(root_id);
        self.emit(ClientEvent::ThreadUpdated { root_id });
        expanded
    }

    /// Reconciles every mounted room when the view becomes visible again.
    pub async fn on_visibility_change(&self, visible: bool) {
        let regained = {
            let mut state = self.lock();
            let regained = visible && !state.visible;
            state.visible = visible;
            regained
        };
        if regained {
            debug!("sync: visible again, reconciling");
            self.reconcile_all().await;
        }
    }

    /// On regaining connectivity, resubscribes rooms left without a channel,
    /// then reconciles everything and refreshes unread counts.
    pub async fn on_connectivity_change(self: &Arc<Self>, online: bool) {
        let resubscribe = {
            let mut state = self.lock();
            let regained = online && !state.online;
            state.online = online;
            if !regained {
                return;
            }
            state
                .rooms
                .iter()
                .filter(|(_, runtime)| {
                    runtime.subscription == SubscriptionState::Unsubscribed
                        && runtime.resubscribe.is_none()
                })
                .map(|(room_id, runtime)| (*room_id, runtime.mount_id))
                .collect::<Vec<_>>()
        };
        info!("sync: connectivity regained");
        for (room_id, mount_id) in resubscribe {
            self.subscribe_room(room_id, mount_id).await;
        }
        self.reconcile_all().await;
        if let Err(error) = self.refresh_unread().await {
            warn!(%error, "sync: unread refresh failed");
        }
    }

    fn spawn_unread_poller(self: &Arc<Self>) -> JoinHandle<()> {
        let client = Arc::downgrade(self);
        let period = self.config.unread_poll_interval;
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                let Some(client) = client.upgrade() else {
                    return;
                };
                if let Err(error) = client.refresh_unread().await {
                    debug!(%error, "sync: unread poll failed");
                }
            }
        })
    }

    pub async fn refresh_unread(&self) -> Result<(), SyncError> {
        let user_id = self.user_id()?;
        let epoch = self.lock().session_epoch;
        let counts = self.backend.unread_counts(user_id).await?;
        {
            let mut state = self.lock();
            if state.session_epoch != epoch {
                return Ok(());
            }
            state.unread.replace_all(counts);
        }
        self.emit(ClientEvent::UnreadCountsUpdated);
        Ok(())
    }

    pub async fn mark_read(
        &self,
        room_id: RoomId,
        last_read_message_id: MessageId,
    ) -> Result<(), SyncError> {
        let user_id = self.user_id()?;
        self.backend
            .mark_read(user_id, room_id, last_read_message_id)
            .await?;
        self.lock().unread.mark_read(room_id);
        self.emit(ClientEvent::UnreadCountsUpdated);
        if let Err(error) = self.refresh_unread().await {
            warn!(room_id = room_id.0, %error, "sync: unread refresh after mark_read failed");
        }
        Ok(())
    }

    pub fn unread_counts(&self) -> HashMap<RoomId, UnreadCount> {
        self.lock().unread.snapshot()
    }

    pub fn unread_for(&self, room_id: RoomId) -> Option<UnreadCount> {
        self.lock().unread.get(room_id)
    }

    pub async fn create_or_get_dm(
        &self,
        target_user_id: UserId,
    ) -> Result<RoomCreatedResponse, SyncError> {
        let user_id = self.user_id()?;
        Ok(self.backend.create_or_get_dm(user_id, target_user_id).await?)
    }

    pub async fn create_group(
        &self,
        name: &str,
        member_ids: &[UserId],
    ) -> Result<RoomCreatedResponse, SyncError> {
        let user_id = self.user_id()?;
        Ok(self.backend.create_group(user_id, name, member_ids).await?)
    }

    pub async fn list_rooms(&self) -> Result<Vec<RoomSummary>, SyncError> {
        let user_id = self.user_id()?;
        Ok(self.backend.list_rooms(user_id).await?)
    }

    pub async fn list_participants(
        &self,
        room_id: RoomId,
    ) -> Result<Vec<ParticipantSummary>, SyncError> {
        let user_id = self.user_id()?;
        Ok(self.backend.list_participants(user_id, room_id).await?)
    }

    pub async fn add_reaction(
        &self,
        message_id: MessageId,
        emoji: &str,
    ) -> Result<Vec<ReactionSummary>, SyncError> {
        let user_id = self.user_id()?;
        let reactions = self.backend.add_reaction(user_id, message_id, emoji).await?;
        self.apply_reactions(message_id, &reactions);
        Ok(reactions)
    }

    pub async fn remove_reaction(
        &self,
        message_id: MessageId,
        emoji: &str,
    ) -> Result<Vec<ReactionSummary>, SyncError> {
        let user_id = self.user_id()?;
        let reactions = self
            .backend
            .remove_reaction(user_id, message_id, emoji)
            .await?;
        self.apply_reactions(message_id, &reactions);
        Ok(reactions)
    }
}

#[cfg(test)]
#[path = "tests/support.rs"]
mod test_support;

#[cfg(test)]
#[path = "tests/lib_tests.rs"]
mod tests;
