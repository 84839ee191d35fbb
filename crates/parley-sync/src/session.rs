//! Chat session controller.
//!
//! [`ChatSession`] is what a UI holds. It keeps the displayed message list in
//! memory, writes optimistically, and hands confirmation and retries to the
//! [`SyncCoordinator`]. Inbound real-time events arrive through the
//! session's [`ChannelHandler`], and a background task runs sync cycles on
//! connectivity, foreground and timer triggers.

use std::sync::{Arc, Mutex, MutexGuard, Weak};
use std::time::{Duration, Instant};

use anyhow::Context;
use async_trait::async_trait;
use tokio::sync::{broadcast, watch, Notify};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, warn};

use parley_net::{ChannelClient, ChannelError, ChannelHandler, ChannelStatus, NetworkMonitor, RemoteApi};
use parley_shared::protocol::{ReactionRequest, ServerEvent};
use parley_shared::{Message, MessageId, OnlineUser, PayloadError, Presence};
use parley_store::{LocalStore, MessagePatch, StoreError, SyncAction};

use crate::config::SyncConfig;
use crate::coordinator::{SyncCoordinator, SyncReport};
use crate::error::SessionError;
use crate::events::{emit_event, NoticePayload, SessionEvent, EVENT_BUS_CAPACITY};
use crate::throttle::Throttle;

#[derive(Default)]
struct SessionState {
    /// Snapshot of the store, ownership re-derived.
    stored: Vec<Message>,
    /// Optimistic rows whose direct send has not settled; not in the store.
    in_flight: Vec<Message>,
    online_users: Vec<OnlineUser>,
}

struct SessionInner {
    me: Weak<SessionInner>,
    user: String,
    store: LocalStore,
    network: NetworkMonitor,
    coordinator: Arc<SyncCoordinator>,
    channel: Arc<ChannelClient>,
    state: Mutex<SessionState>,
    send_throttle: Mutex<Throttle>,
    presence: Mutex<Presence>,
    events: broadcast::Sender<SessionEvent>,
    foreground: Arc<Notify>,
    shutdown: Arc<Notify>,
    sync_interval: Duration,
    /// Replay ceiling given to queued reactions.
    max_attempts: u32,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

#[derive(Clone)]
pub struct ChatSession {
    inner: Arc<SessionInner>,
}

impl ChatSession {
    pub fn new(
        user: &str,
        store: LocalStore,
        network: NetworkMonitor,
        api: Arc<dyn RemoteApi>,
        channel: Arc<ChannelClient>,
        config: &SyncConfig,
    ) -> Self {
        let coordinator = Arc::new(SyncCoordinator::new(
            store.clone(),
            api,
            network.clone(),
            user,
            config,
        ));
        let (events, _) = broadcast::channel(EVENT_BUS_CAPACITY);

        let inner = Arc::new_cyclic(|me| SessionInner {
            me: me.clone(),
            user: user.to_string(),
            store,
            network,
            coordinator,
            channel,
            state: Mutex::new(SessionState::default()),
            send_throttle: Mutex::new(Throttle::new(config.send_debounce)),
            presence: Mutex::new(Presence::default()),
            events,
            foreground: Arc::new(Notify::new()),
            shutdown: Arc::new(Notify::new()),
            sync_interval: config.sync_interval,
            max_attempts: config.max_attempts,
            tasks: Mutex::new(Vec::new()),
        });
        Self { inner }
    }

    /// Load the stored conversation, join the real-time channel and start
    /// the background sync triggers. The first cycle runs immediately.
    pub async fn start(&self, presence: Presence) -> Result<(), SessionError> {
        let inner = &self.inner;
        *lock(&inner.presence) = presence;
        inner.reload().await?;
        inner.connect_channel().await;

        let handle = tokio::spawn(trigger_loop(
            inner.me.clone(),
            inner.network.watch(),
            inner.foreground.clone(),
            inner.shutdown.clone(),
            inner.sync_interval,
        ));
        lock(&inner.tasks).push(handle);

        info!(user = %inner.user, "chat session started");
        Ok(())
    }

    /// Stop background work and close the channel.
    pub async fn dispose(&self) {
        self.inner.shutdown.notify_one();
        self.inner.channel.dispose().await;
        for task in lock(&self.inner.tasks).drain(..) {
            task.abort();
        }
        info!(user = %self.inner.user, "chat session disposed");
    }

    pub fn user(&self) -> &str {
        &self.inner.user
    }

    pub fn coordinator(&self) -> &Arc<SyncCoordinator> {
        &self.inner.coordinator
    }

    /// The handler the real-time channel delivers into.
    pub fn channel_handler(&self) -> Arc<dyn ChannelHandler> {
        self.inner.channel_handler()
    }

    pub fn subscribe(&self) -> broadcast::Receiver<SessionEvent> {
        self.inner.events.subscribe()
    }

    /// The displayed conversation, oldest first: stored rows plus optimistic
    /// rows still in flight.
    pub fn messages(&self) -> Vec<Message> {
        let state = self.inner.state();
        let mut all = state.stored.clone();
        all.extend(
            state
                .in_flight
                .iter()
                .filter(|m| !state.stored.iter().any(|s| s.answers_to(&m.id)))
                .cloned(),
        );
        all.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        all
    }

    pub fn online_users(&self) -> Vec<OnlineUser> {
        self.inner.state().online_users.clone()
    }

    /// The app came to the foreground; runs a (debounced) sync cycle.
    pub fn notify_foreground(&self) {
        self.inner.foreground.notify_one();
    }

    pub async fn send(
        &self,
        text: &str,
        reply_to: Option<MessageId>,
    ) -> Result<Message, SessionError> {
        let text = text.trim();
        if text.is_empty() {
            return Err(SessionError::EmptyMessage);
        }
        self.inner.acquire_send_slot()?;
        self.inner
            .deliver(Message::new_text(&self.inner.user, text, reply_to))
            .await
    }

    /// Send a recorded clip. `audio_ref` is a local file read at upload time.
    pub async fn send_voice(
        &self,
        audio_ref: &str,
        duration: f64,
        reply_to: Option<MessageId>,
    ) -> Result<Message, SessionError> {
        if audio_ref.trim().is_empty() {
            return Err(SessionError::EmptyAudio);
        }
        self.inner.acquire_send_slot()?;
        self.inner
            .deliver(Message::new_voice(&self.inner.user, audio_ref, duration, reply_to))
            .await
    }

    /// Toggle the local user's `emoji` reaction on a message.
    ///
    /// The toggle is applied locally first and never rolled back. When it
    /// cannot be delivered right away it is queued for the next cycle.
    pub async fn add_reaction(
        &self,
        message_id: &MessageId,
        emoji: &str,
    ) -> Result<Message, SessionError> {
        let inner = &self.inner;

        let optimistic = {
            let mut state = inner.state();
            state
                .in_flight
                .iter_mut()
                .find(|m| m.answers_to(message_id))
                .map(|m| {
                    m.reactions.toggle(emoji, &inner.user);
                    m.clone()
                })
        };
        let updated = match optimistic {
            Some(message) => message,
            None => inner
                .store
                .toggle_reaction(message_id, emoji, &inner.user)
                .await
                .map_err(|e| match e {
                    StoreError::NotFound => SessionError::MessageNotFound(message_id.to_string()),
                    other => other.into(),
                })?,
        };
        inner.reload().await?;

        let request = ReactionRequest {
            message_id: updated.id.0.clone(),
            emoji: emoji.to_string(),
            username: inner.user.clone(),
        };
        let delivered = if inner.network.is_online() && !updated.id.is_temporary() {
            match inner.coordinator.send_reaction(&request).await {
                Ok(()) => true,
                Err(e) => {
                    warn!(id = %updated.id, error = %e, "reaction not delivered, queuing");
                    false
                }
            }
        } else {
            false
        };

        if !delivered {
            let payload = serde_json::to_value(&request).map_err(PayloadError::from)?;
            inner
                .store
                .enqueue_with_limit(&updated.id, SyncAction::Reaction, &payload, inner.max_attempts)
                .await?;
            inner.reload().await?;
        }

        Ok(updated.with_ownership(&inner.user))
    }

    /// Run a sync cycle now, bypassing the pull debounce.
    pub async fn refresh(&self) -> Result<Option<SyncReport>, SessionError> {
        Ok(self.inner.run_forced().await?)
    }

    /// Like [`refresh`](Self::refresh), but reports problems to the user:
    /// refuses while offline and posts a notice when a phase could not reach
    /// the server.
    pub async fn force_sync(&self) -> Result<Option<SyncReport>, SessionError> {
        let inner = &self.inner;
        if !inner.network.is_online() {
            inner.notice(SessionError::Offline.to_string());
            return Err(SessionError::Offline);
        }

        match inner.run_forced().await {
            Ok(Some(report)) => {
                if !report.aborted.is_empty() {
                    inner.notice("Sync incomplete: the server could not be reached".to_string());
                }
                Ok(Some(report))
            }
            Ok(None) => Ok(None),
            Err(e) => {
                inner.notice(format!("Sync failed: {e}"));
                Err(e.into())
            }
        }
    }

    /// Announce a new badge/streak. Kept for the next join when the channel
    /// is down.
    pub async fn update_presence(
        &self,
        badge: serde_json::Value,
        current_streak: i64,
    ) -> Result<(), SessionError> {
        let presence = Presence {
            badge,
            current_streak,
        };
        *lock(&self.inner.presence) = presence.clone();

        match self.inner.channel.update_presence(presence).await {
            Ok(()) => Ok(()),
            Err(ChannelError::NotConnected) => {
                debug!("channel down, presence kept for next join");
                Ok(())
            }
            Err(e) => Err(e.into()),
        }
    }
}

impl SessionInner {
    fn state(&self) -> MutexGuard<'_, SessionState> {
        lock(&self.state)
    }

    fn emit(&self, event: SessionEvent) {
        emit_event(&self.events, event);
    }

    fn notice(&self, message: String) {
        warn!(notice = %message, "user notice");
        self.emit(SessionEvent::Notice(NoticePayload { message }));
    }

    fn channel_handler(&self) -> Arc<dyn ChannelHandler> {
        Arc::new(SessionHandler {
            session: self.me.clone(),
        })
    }

    fn acquire_send_slot(&self) -> Result<(), SessionError> {
        if lock(&self.send_throttle).try_acquire(Instant::now()) {
            Ok(())
        } else {
            debug!("send throttled");
            Err(SessionError::Throttled)
        }
    }

    async fn connect_channel(&self) {
        let presence = lock(&self.presence).clone();
        if let Err(e) = self
            .channel
            .connect(&self.user, presence, self.channel_handler())
            .await
        {
            warn!(error = %e, "real-time channel unavailable");
        }
    }

    /// Re-read the store into memory and tell subscribers.
    async fn reload(&self) -> Result<(), StoreError> {
        let stored: Vec<Message> = self
            .store
            .get_all()
            .await?
            .into_iter()
            .map(|m| m.with_ownership(&self.user))
            .collect();
        self.state().stored = stored;
        self.emit(SessionEvent::MessagesChanged);
        Ok(())
    }

    fn forget_in_flight(&self, id: &MessageId) {
        self.state().in_flight.retain(|m| &m.id != id);
    }

    async fn deliver(&self, message: Message) -> Result<Message, SessionError> {
        self.state().in_flight.push(message.clone());
        self.emit(SessionEvent::MessagesChanged);

        if self.network.is_online() {
            match self.coordinator.send_message(&message).await {
                Ok(confirmed) => {
                    if let Err(e) = self.store.replace_identity(&message.id, &confirmed).await {
                        self.forget_in_flight(&message.id);
                        return Err(e.into());
                    }
                    let confirmed = self.retire_in_flight(&message, confirmed).await?;
                    self.reload().await?;
                    debug!(id = %confirmed.id, temp_id = %message.id, "message sent");
                    return Ok(confirmed.with_ownership(&self.user));
                }
                Err(e) => warn!(id = %message.id, error = %e, "direct send failed, keeping as pending"),
            }
        }

        // A broadcast of this very message may already have confirmed it.
        let persisted = match self.store.get_by_id(&message.id).await? {
            Some(existing) if existing.synced => existing,
            _ => {
                let mut pending = message.clone();
                pending.pending = true;
                pending.synced = false;
                if let Err(e) = self.store.save(&pending, true).await {
                    self.forget_in_flight(&message.id);
                    return Err(e.into());
                }
                info!(id = %pending.id, "message stored as pending");
                pending
            }
        };
        let persisted = self.retire_in_flight(&message, persisted).await?;
        self.reload().await?;
        Ok(persisted.with_ownership(&self.user))
    }

    /// Drop the optimistic copy of `sent` once `persisted` is in the store,
    /// carrying over reactions toggled while the send was in flight.
    async fn retire_in_flight(&self, sent: &Message, persisted: Message) -> Result<Message, StoreError> {
        let optimistic = {
            let mut state = self.state();
            state
                .in_flight
                .iter()
                .position(|m| m.id == sent.id)
                .map(|i| state.in_flight.remove(i))
        };
        match optimistic {
            Some(optimistic) if optimistic.reactions != sent.reactions => {
                self.store
                    .update(&persisted.id, &MessagePatch::reactions(optimistic.reactions))
                    .await
            }
            _ => Ok(persisted),
        }
    }

    async fn run_forced(&self) -> Result<Option<SyncReport>, crate::error::SyncError> {
        let report = self.coordinator.run_cycle(true).await?;
        self.after_cycle(report.as_ref()).await;
        Ok(report)
    }

    async fn run_triggered(&self, trigger: &'static str) {
        match self.coordinator.run_cycle(false).await {
            Ok(report) => self.after_cycle(report.as_ref()).await,
            Err(e) => error!(trigger, error = %e, "background sync failed"),
        }
    }

    async fn after_cycle(&self, report: Option<&SyncReport>) {
        let Some(report) = report else {
            return;
        };
        if let Err(e) = self.reload().await {
            error!(error = %e, "failed to reload messages after sync");
        }
        self.emit(SessionEvent::SyncCompleted(report.clone()));
    }

    async fn apply_event(&self, event: ServerEvent) -> anyhow::Result<()> {
        match event {
            ServerEvent::NewMessage(remote) => {
                let message = remote.into_message(&self.user)?;
                let outcome = self.coordinator.reconcile(message).await?;
                debug!(?outcome, "newMessage applied");
            }
            ServerEvent::MessageUpdated(remote) => {
                let id = remote
                    .id
                    .clone()
                    .map(MessageId)
                    .context("messageUpdated without id")?;
                match self.store.get_by_id(&id).await? {
                    Some(local) if local.reactions != remote.reactions => {
                        self.store
                            .update(&local.id, &MessagePatch::reactions(remote.reactions))
                            .await?;
                    }
                    // Duplicate delivery.
                    Some(_) => return Ok(()),
                    None => {
                        let message = remote.into_message(&self.user)?;
                        self.coordinator.reconcile(message).await?;
                    }
                }
            }
            ServerEvent::OnlineUsers(users) => {
                debug!(count = users.len(), "online users");
                self.state().online_users = users.clone();
                self.emit(SessionEvent::PresenceChanged(users));
                return Ok(());
            }
            ServerEvent::MessagesCleanup(directive) => {
                let cutoff = directive.cutoff()?;
                let removed = self.store.delete_older_than(&cutoff).await?;
                info!(
                    removed,
                    announced = directive.deleted_count,
                    cutoff = %cutoff,
                    "applied server cleanup"
                );
            }
        }
        self.reload().await?;
        Ok(())
    }
}

struct SessionHandler {
    session: Weak<SessionInner>,
}

#[async_trait]
impl ChannelHandler for SessionHandler {
    async fn on_event(&self, event: ServerEvent) -> anyhow::Result<()> {
        match self.session.upgrade() {
            Some(inner) => inner.apply_event(event).await,
            None => Ok(()),
        }
    }

    async fn on_status(&self, status: ChannelStatus) {
        if let Some(inner) = self.session.upgrade() {
            inner.emit(SessionEvent::Channel(status));
        }
    }
}

async fn trigger_loop(
    session: Weak<SessionInner>,
    mut online: watch::Receiver<bool>,
    foreground: Arc<Notify>,
    shutdown: Arc<Notify>,
    interval: Duration,
) {
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        let trigger = tokio::select! {
            _ = shutdown.notified() => return,
            changed = online.changed() => {
                if changed.is_err() {
                    return;
                }
                if !*online.borrow_and_update() {
                    continue;
                }
                "online"
            }
            _ = foreground.notified() => "foreground",
            _ = ticker.tick() => "interval",
        };

        let Some(inner) = session.upgrade() else {
            return;
        };
        debug!(trigger, "sync triggered");
        if trigger == "online" {
            // Reconnect attempts may have run out while we were offline.
            inner.connect_channel().await;
        }
        inner.run_triggered(trigger).await;
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|e| e.into_inner())
}
