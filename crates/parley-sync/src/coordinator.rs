//! Sync coordinator: the only component that talks to the REST API.
//!
//! One cycle runs three network phases in order and then trims:
//!
//! 1. **Pull** messages created after the last-sync marker and reconcile
//!    them into the store (insert if absent, take the remote reaction set if
//!    it differs).
//! 2. **Push** every pending message; a confirmed send swaps the temporary
//!    identity for the server's in one store transaction.
//! 3. **Drain** retryable `REACTION` items from the sync queue.
//!
//! A network failure aborts only the phase it happens in. Store failures
//! abort the cycle.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Instant;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::{debug, info, warn};

use parley_net::{NetworkMonitor, RemoteApi};
use parley_shared::protocol::{ReactionRequest, SendTextRequest, VoiceUpload};
use parley_shared::{Message, MessageKind};
use parley_store::{LocalStore, MessagePatch, StoreError, SyncAction};

use crate::config::SyncConfig;
use crate::error::SyncError;
use crate::throttle::Throttle;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum SyncPhase {
    Pull,
    Push,
    Drain,
}

/// What one cycle did.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncReport {
    pub forced: bool,
    /// Network phases were skipped because the monitor reported offline.
    pub offline: bool,
    /// The pull was collapsed into a recent one.
    pub pull_skipped: bool,
    pub pulled: usize,
    pub inserted: usize,
    /// Own messages whose optimistic row was swapped for the pulled one.
    pub confirmed: usize,
    pub reactions_updated: usize,
    /// Pulled payloads that failed validation.
    pub rejected: usize,
    pub pushed: usize,
    pub push_failures: usize,
    pub drained: usize,
    pub drain_failures: usize,
    /// Queue items that reached their attempt ceiling.
    pub exhausted: usize,
    pub trimmed: usize,
    /// Phases cut short by a network failure.
    pub aborted: Vec<SyncPhase>,
}

impl SyncReport {
    pub fn is_complete(&self) -> bool {
        !self.offline && self.aborted.is_empty()
    }
}

/// Outcome of merging one confirmed message into the store.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Reconciled {
    Inserted,
    /// Replaced the optimistic row it was sent from.
    Confirmed,
    ReactionsUpdated,
    Unchanged,
}

pub struct SyncCoordinator {
    store: LocalStore,
    api: Arc<dyn RemoteApi>,
    network: NetworkMonitor,
    current_user: String,
    pull_limit: u32,
    retention: Option<chrono::Duration>,
    running: AtomicBool,
    pull_throttle: Mutex<Throttle>,
}

/// Clears the running flag however the cycle ends.
struct RunningGuard<'a>(&'a AtomicBool);

impl Drop for RunningGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

impl SyncCoordinator {
    pub fn new(
        store: LocalStore,
        api: Arc<dyn RemoteApi>,
        network: NetworkMonitor,
        current_user: &str,
        config: &SyncConfig,
    ) -> Self {
        Self {
            store,
            api,
            network,
            current_user: current_user.to_string(),
            pull_limit: config.pull_limit,
            retention: config.retention(),
            running: AtomicBool::new(false),
            pull_throttle: Mutex::new(Throttle::new(config.pull_debounce)),
        }
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }

    /// Run one cycle. Returns `None` when another cycle is already running;
    /// the trigger is dropped, not queued.
    pub async fn run_cycle(&self, forced: bool) -> Result<Option<SyncReport>, SyncError> {
        if self
            .running
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            debug!(forced, "sync already running, trigger ignored");
            return Ok(None);
        }
        let _guard = RunningGuard(&self.running);

        let started = Instant::now();
        let mut report = SyncReport {
            forced,
            ..SyncReport::default()
        };

        if self.network.is_online() {
            let pull_due = {
                let mut throttle = self.pull_throttle.lock().unwrap_or_else(|e| e.into_inner());
                if forced {
                    throttle.record(started);
                    true
                } else {
                    throttle.try_acquire(started)
                }
            };

            if pull_due {
                let result = self.pull(&mut report).await;
                settle(SyncPhase::Pull, result, &mut report)?;
            } else {
                debug!("pull debounced");
                report.pull_skipped = true;
            }

            let result = self.push(&mut report).await;
            settle(SyncPhase::Push, result, &mut report)?;

            let result = self.drain(&mut report).await;
            settle(SyncPhase::Drain, result, &mut report)?;
        } else {
            debug!("offline, skipping network phases");
            report.offline = true;
        }

        report.trimmed = self.trim().await?;
        report.exhausted = self.store.list_exhausted().await?.len();

        info!(
            forced,
            pulled = report.pulled,
            inserted = report.inserted,
            reactions = report.reactions_updated,
            pushed = report.pushed,
            drained = report.drained,
            trimmed = report.trimmed,
            aborted = ?report.aborted,
            elapsed_ms = started.elapsed().as_millis() as u64,
            "sync cycle complete"
        );
        Ok(Some(report))
    }

    /// Send one message as a confirmed request and return the server's row.
    /// The result remembers the temporary id it was sent under.
    pub async fn send_message(&self, message: &Message) -> Result<Message, SyncError> {
        let remote = match message.kind {
            MessageKind::Text => {
                self.api
                    .send_text(&SendTextRequest::from_message(message))
                    .await?
            }
            MessageKind::Voice => {
                self.api
                    .send_voice(&VoiceUpload::from_message(message)?)
                    .await?
            }
        };

        let mut confirmed = remote.into_message(&self.current_user)?;
        if confirmed.temp_id.is_none() && message.id.is_temporary() {
            confirmed.temp_id = Some(message.id.clone());
        }
        if confirmed.reply_to.is_none() {
            confirmed.reply_to = message.reply_to.clone();
        }
        Ok(confirmed)
    }

    pub async fn send_reaction(&self, request: &ReactionRequest) -> Result<(), SyncError> {
        Ok(self.api.send_reaction(request).await?)
    }

    /// Merge a server-confirmed message into the store without ever
    /// duplicating it.
    pub async fn reconcile(&self, message: Message) -> Result<Reconciled, StoreError> {
        let message = message.with_ownership(&self.current_user);

        if let Some(local) = self.store.get_by_id(&message.id).await? {
            if local.reactions == message.reactions {
                return Ok(Reconciled::Unchanged);
            }
            // Remote reaction state wins.
            self.store
                .update(&local.id, &MessagePatch::reactions(message.reactions))
                .await?;
            return Ok(Reconciled::ReactionsUpdated);
        }

        if let Some(temp_id) = &message.temp_id {
            if self.store.get_by_id(temp_id).await?.is_some() {
                self.store.replace_identity(temp_id, &message).await?;
                return Ok(Reconciled::Confirmed);
            }
        }

        self.store.save(&message, false).await?;
        Ok(Reconciled::Inserted)
    }

    async fn pull(&self, report: &mut SyncReport) -> Result<(), SyncError> {
        let started_at = Utc::now();
        let since = self.store.last_sync_marker().await?;

        let batch = self.api.fetch_messages(since, self.pull_limit).await?;
        let full_page = batch.len() >= self.pull_limit as usize;
        report.pulled = batch.len();

        let mut newest: Option<DateTime<Utc>> = None;
        for remote in batch {
            let message = match remote.into_message(&self.current_user) {
                Ok(m) => m,
                Err(e) => {
                    warn!(error = %e, "skipping invalid pulled message");
                    report.rejected += 1;
                    continue;
                }
            };
            newest = newest.max(Some(message.created_at));

            match self.reconcile(message).await? {
                Reconciled::Inserted => report.inserted += 1,
                Reconciled::Confirmed => report.confirmed += 1,
                Reconciled::ReactionsUpdated => report.reactions_updated += 1,
                Reconciled::Unchanged => {}
            }
        }

        // A full page may have more behind it, possibly sharing its newest
        // timestamp. Resume just before that (the API takes millisecond
        // markers); rows seen twice reconcile as unchanged. A page that cannot
        // move the marker that way resumes after its newest entry instead.
        let marker = match newest {
            Some(newest) if full_page => {
                let resume = newest - chrono::Duration::milliseconds(1);
                match since {
                    Some(since) if resume <= since => newest,
                    _ => resume,
                }
            }
            _ => started_at,
        };
        self.store.set_last_sync_marker(&marker).await?;
        debug!(since = ?since, marker = %marker, "pull complete");
        Ok(())
    }

    async fn push(&self, report: &mut SyncReport) -> Result<(), SyncError> {
        for message in self.store.get_pending().await? {
            // A broadcast may have confirmed it since the list was read.
            match self.store.get_by_id(&message.id).await? {
                Some(current) if current.pending => {}
                _ => continue,
            }

            match self.send_message(&message).await {
                Ok(confirmed) => {
                    self.store.replace_identity(&message.id, &confirmed).await?;
                    info!(temp_id = %message.id, id = %confirmed.id, "pending message confirmed");
                    report.pushed += 1;
                }
                Err(SyncError::Net(e)) if e.is_transient() => {
                    report.push_failures += 1;
                    return Err(SyncError::Net(e));
                }
                Err(SyncError::Net(e)) => {
                    warn!(id = %message.id, error = %e, "pending message rejected, left pending");
                    report.push_failures += 1;
                }
                Err(e) => return Err(e),
            }
        }
        Ok(())
    }

    async fn drain(&self, report: &mut SyncReport) -> Result<(), SyncError> {
        for item in self.store.list_retryable().await? {
            match &item.action {
                SyncAction::Reaction => {}
                SyncAction::Create => {
                    // Sends are retried through the pending flag.
                    debug!(item = item.id, "dropping stale CREATE queue item");
                    self.store.remove(item.id).await?;
                    continue;
                }
                SyncAction::Other(kind) => {
                    warn!(item = item.id, kind = %kind, "unknown sync action, leaving queued");
                    continue;
                }
            }

            let mut request: ReactionRequest = match serde_json::from_value(item.payload.clone()) {
                Ok(r) => r,
                Err(e) => {
                    warn!(item = item.id, error = %e, "undecodable reaction payload");
                    self.store.increment_attempts(item.id).await?;
                    report.drain_failures += 1;
                    continue;
                }
            };

            match self.store.get_by_id(&item.target_id).await? {
                None => {
                    info!(item = item.id, target = %item.target_id, "reaction target gone, dropping");
                    self.store.remove(item.id).await?;
                    continue;
                }
                Some(target) if target.id.is_temporary() => {
                    debug!(item = item.id, "reaction target not confirmed yet");
                    continue;
                }
                Some(target) => request.message_id = target.id.0,
            }

            match self.api.send_reaction(&request).await {
                Ok(()) => {
                    self.store.remove(item.id).await?;
                    report.drained += 1;
                }
                Err(e) => {
                    self.store.increment_attempts(item.id).await?;
                    report.drain_failures += 1;
                    if e.is_transient() {
                        return Err(SyncError::Net(e));
                    }
                    warn!(item = item.id, error = %e, "reaction replay failed");
                }
            }
        }
        Ok(())
    }

    async fn trim(&self) -> Result<usize, StoreError> {
        let Some(retention) = self.retention else {
            return Ok(0);
        };
        let cutoff = Utc::now() - retention;
        let removed = self.store.delete_expired(&cutoff).await?;
        if removed > 0 {
            info!(removed, cutoff = %cutoff, "trimmed old messages");
        }
        Ok(removed)
    }
}

fn settle(
    phase: SyncPhase,
    result: Result<(), SyncError>,
    report: &mut SyncReport,
) -> Result<(), SyncError> {
    match result {
        Ok(()) => Ok(()),
        Err(SyncError::Net(e)) => {
            warn!(phase = ?phase, error = %e, "sync phase aborted");
            report.aborted.push(phase);
            Ok(())
        }
        Err(e) => Err(e),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use parley_shared::protocol::RemoteMessage;
    use parley_shared::{MessageId, Reactions};
    use tokio::sync::Notify;

    use crate::testing::{minutes_ago, remote_text, FakeApi};

    fn coordinator(online: bool) -> (LocalStore, Arc<FakeApi>, NetworkMonitor, Arc<SyncCoordinator>) {
        coordinator_with(online, &SyncConfig::default())
    }

    fn coordinator_with(
        online: bool,
        config: &SyncConfig,
    ) -> (LocalStore, Arc<FakeApi>, NetworkMonitor, Arc<SyncCoordinator>) {
        let store = LocalStore::open_in_memory().unwrap();
        let api = FakeApi::new();
        let network = NetworkMonitor::new(online);
        let coordinator = SyncCoordinator::new(store.clone(), api.clone(), network.clone(), "alice", config);
        (store, api, network, Arc::new(coordinator))
    }

    fn reactions(pairs: &[(&str, &str)]) -> Reactions {
        let mut r = Reactions::new();
        for (emoji, user) in pairs {
            r.toggle(emoji, user);
        }
        r
    }

    #[tokio::test]
    async fn offline_send_is_confirmed_once_online() {
        let (store, _api, network, coordinator) = coordinator(false);

        let msg = Message::new_text("alice", "hello", None);
        store.save(&msg, true).await.unwrap();

        let report = coordinator.run_cycle(true).await.unwrap().unwrap();
        assert!(report.offline);
        let stored = store.get_all().await.unwrap();
        assert_eq!(stored.len(), 1);
        assert!(stored[0].pending && stored[0].is_own);

        network.set_online(true);
        let report = coordinator.run_cycle(true).await.unwrap().unwrap();
        assert_eq!(report.pushed, 1);

        let stored = store.get_all().await.unwrap();
        assert_eq!(stored.len(), 1);
        let row = &stored[0];
        assert!(!row.id.is_temporary());
        assert!(row.synced && !row.pending && row.is_own);
        assert_eq!(store.get_by_id(&msg.id).await.unwrap().unwrap().id, row.id);
        assert!(store.list_retryable().await.unwrap().is_empty());

        // The echo of our own message on the next pull is not a second row.
        coordinator.run_cycle(true).await.unwrap();
        assert_eq!(store.get_all().await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn transient_push_failure_keeps_message_pending() {
        let (store, api, _network, coordinator) = coordinator(true);
        api.set_reachable(false);

        let msg = Message::new_text("alice", "hello", None);
        store.save(&msg, true).await.unwrap();

        let report = coordinator.run_cycle(true).await.unwrap().unwrap();
        assert_eq!(report.aborted, vec![SyncPhase::Pull, SyncPhase::Push]);
        assert_eq!(report.push_failures, 1);

        let row = store.get_by_id(&msg.id).await.unwrap().unwrap();
        assert!(row.pending);
        assert!(store.list_retryable().await.unwrap().is_empty());
        assert_eq!(store.last_sync_marker().await.unwrap(), None);
    }

    #[tokio::test]
    async fn concurrent_reactions_converge_on_pull() {
        let (store, api, _network, coordinator) = coordinator(true);

        let mut server_copy = remote_text("m1", "carol", "vote", &minutes_ago(30));
        server_copy.reactions = reactions(&[("👍", "alice"), ("👍", "bob")]);
        api.seed(server_copy.clone());

        let mut local_copy = server_copy.clone();
        local_copy.reactions = reactions(&[("👍", "alice")]);
        store
            .save(&local_copy.into_message("alice").unwrap(), false)
            .await
            .unwrap();

        let report = coordinator.run_cycle(true).await.unwrap().unwrap();
        assert_eq!(report.reactions_updated, 1);

        let row = store.get_by_id(&MessageId::from("m1")).await.unwrap().unwrap();
        let authors: Vec<&str> = row
            .reactions
            .authors("👍")
            .unwrap()
            .iter()
            .map(String::as_str)
            .collect();
        assert_eq!(authors, vec!["alice", "bob"]);

        // Applying the same remote state again is a no-op.
        let again = server_copy.into_message("alice").unwrap();
        assert_eq!(coordinator.reconcile(again).await.unwrap(), Reconciled::Unchanged);
    }

    #[tokio::test]
    async fn pull_isolates_bad_payloads_and_advances_marker() {
        let (store, api, _network, coordinator) = coordinator(true);
        api.seed(remote_text("m1", "bob", "fine", &minutes_ago(5)));
        api.seed(RemoteMessage {
            created_at: None,
            ..remote_text("m2", "bob", "broken", &minutes_ago(4))
        });
        api.seed(remote_text("m3", "bob", "bad date", "yesterday-ish"));

        let before = Utc::now();
        let report = coordinator.run_cycle(true).await.unwrap().unwrap();
        assert_eq!(report.pulled, 3);
        assert_eq!(report.inserted, 1);
        assert_eq!(report.rejected, 2);

        let marker = store.last_sync_marker().await.unwrap().unwrap();
        assert!(marker >= before);
        assert!(!store.get_all().await.unwrap()[0].is_own);
    }

    #[tokio::test]
    async fn pulls_are_debounced_unless_forced() {
        let (_store, api, _network, coordinator) = coordinator(true);

        coordinator.run_cycle(false).await.unwrap();
        let second = coordinator.run_cycle(false).await.unwrap().unwrap();
        assert!(second.pull_skipped);
        assert_eq!(api.with(|s| s.fetches), 1);

        coordinator.run_cycle(true).await.unwrap();
        assert_eq!(api.with(|s| s.fetches), 2);
    }

    #[tokio::test]
    async fn concurrent_trigger_is_ignored() {
        let (_store, api, _network, coordinator) = coordinator(true);
        let entered = Arc::new(Notify::new());
        let release = Arc::new(Notify::new());
        api.gate_fetch(entered.clone(), release.clone());

        let running = coordinator.clone();
        let first = tokio::spawn(async move { running.run_cycle(true).await });

        entered.notified().await;
        assert!(coordinator.is_running());
        assert!(coordinator.run_cycle(true).await.unwrap().is_none());

        release.notify_one();
        assert!(first.await.unwrap().unwrap().is_some());
        assert!(!coordinator.is_running());
    }

    #[tokio::test]
    async fn queued_reaction_waits_for_target_confirmation() {
        let (store, api, _network, coordinator) = coordinator(true);

        let msg = Message::new_text("alice", "hello", None);
        store.save(&msg, true).await.unwrap();
        let request = ReactionRequest {
            message_id: msg.id.0.clone(),
            emoji: "🎉".into(),
            username: "alice".into(),
        };
        store
            .enqueue(&msg.id, SyncAction::Reaction, &serde_json::to_value(&request).unwrap())
            .await
            .unwrap();

        // Sends fail: the target keeps its temporary id and the item waits
        // without burning an attempt.
        api.with(|s| s.fail_sends = true);
        coordinator.run_cycle(true).await.unwrap();
        let items = store.list_retryable().await.unwrap();
        assert_eq!(items.len(), 1);
        assert_eq!(items[0].attempts, 0);

        api.with(|s| s.fail_sends = false);
        let report = coordinator.run_cycle(true).await.unwrap().unwrap();
        assert_eq!((report.pushed, report.drained), (1, 1));

        let confirmed = store.get_by_id(&msg.id).await.unwrap().unwrap();
        let sent = api.with(|s| s.reactions.clone());
        assert_eq!(sent[0].message_id, confirmed.id.0);
        assert!(store.list_retryable().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn failing_reaction_stops_at_attempt_ceiling() {
        let (store, _api, _network, coordinator) = coordinator(true);

        // Confirmed locally but unknown to the server: every replay is a 404.
        let ghost = remote_text("ghost", "bob", "?", &minutes_ago(5))
            .into_message("alice")
            .unwrap();
        store.save(&ghost, false).await.unwrap();
        let request = ReactionRequest {
            message_id: "ghost".into(),
            emoji: "👍".into(),
            username: "alice".into(),
        };
        store
            .enqueue(&ghost.id, SyncAction::Reaction, &serde_json::to_value(&request).unwrap())
            .await
            .unwrap();

        for _ in 0..3 {
            coordinator.run_cycle(true).await.unwrap();
        }
        let report = coordinator.run_cycle(true).await.unwrap().unwrap();

        assert!(store.list_retryable().await.unwrap().is_empty());
        assert_eq!(report.exhausted, 1);
        assert_eq!(report.drain_failures, 0);
    }

    #[tokio::test]
    async fn old_messages_are_trimmed_even_offline() {
        let (store, _api, _network, coordinator) = coordinator(false);

        let mut old = Message::new_text("bob", "ancient", None);
        old.created_at = Utc::now() - chrono::Duration::days(45);
        store.save(&old, false).await.unwrap();
        let mut draft = Message::new_text("alice", "never got out", None);
        draft.created_at = Utc::now() - chrono::Duration::days(45);
        store.save(&draft, true).await.unwrap();
        let fresh = Message::new_text("alice", "recent", None);
        store.save(&fresh, true).await.unwrap();

        let report = coordinator.run_cycle(false).await.unwrap().unwrap();
        assert_eq!(report.trimmed, 1);
        let ids: Vec<_> = store.get_all().await.unwrap().into_iter().map(|m| m.id).collect();
        assert_eq!(ids, vec![draft.id, fresh.id]);
    }

    #[tokio::test]
    async fn full_page_boundary_does_not_skip_same_timestamp() {
        let config = SyncConfig {
            pull_limit: 2,
            ..SyncConfig::default()
        };
        let (store, api, _network, coordinator) = coordinator_with(true, &config);
        let shared = minutes_ago(3);
        api.seed(remote_text("m1", "bob", "one", &minutes_ago(5)));
        api.seed(remote_text("m2", "bob", "two", &shared));
        api.seed(remote_text("m3", "carol", "three", &shared));

        let first = coordinator.run_cycle(true).await.unwrap().unwrap();
        assert_eq!(first.inserted, 2);
        let second = coordinator.run_cycle(true).await.unwrap().unwrap();
        assert_eq!(second.inserted, 1);

        let ids: Vec<_> = store.get_all().await.unwrap().into_iter().map(|m| m.id.0).collect();
        assert_eq!(ids, ["m1", "m2", "m3"]);

        let third = coordinator.run_cycle(true).await.unwrap().unwrap();
        assert_eq!(third.pulled, 0);
    }
}
