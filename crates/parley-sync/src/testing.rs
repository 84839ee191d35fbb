//! In-memory stand-in for the message server used by the unit tests.

use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat, Utc};
use tokio::sync::Notify;

use parley_net::{NetError, RemoteApi};
use parley_shared::protocol::{ReactionRequest, RemoteMessage, SendTextRequest, VoiceUpload};
use parley_shared::types::parse_timestamp;

pub(crate) fn minutes_ago(minutes: i64) -> String {
    (Utc::now() - chrono::Duration::minutes(minutes)).to_rfc3339_opts(SecondsFormat::Nanos, true)
}

pub(crate) fn remote_text(id: &str, author: &str, body: &str, created_at: &str) -> RemoteMessage {
    RemoteMessage {
        id: Some(id.to_string()),
        username: Some(author.to_string()),
        content: Some(body.to_string()),
        message_type: Some("text".to_string()),
        created_at: Some(created_at.to_string()),
        ..RemoteMessage::default()
    }
}

#[derive(Default)]
pub(crate) struct FakeServer {
    pub messages: Vec<RemoteMessage>,
    pub reachable: bool,
    /// Sends answer 500 while set.
    pub fail_sends: bool,
    pub fetches: usize,
    pub sends: usize,
    pub reactions: Vec<ReactionRequest>,
    next_id: u32,
}

#[derive(Default)]
pub(crate) struct FakeApi {
    server: Mutex<FakeServer>,
    fetch_gate: Gate,
    send_gate: Gate,
}

type Gate = Mutex<Option<(Arc<Notify>, Arc<Notify>)>>;

/// Signal `entered` and wait for `release`, once.
async fn pass(gate: &Gate) {
    let armed = gate.lock().unwrap().take();
    if let Some((entered, release)) = armed {
        entered.notify_one();
        release.notified().await;
    }
}

impl FakeApi {
    pub fn new() -> Arc<Self> {
        let api = Self::default();
        api.with(|s| s.reachable = true);
        Arc::new(api)
    }

    pub fn with<R>(&self, f: impl FnOnce(&mut FakeServer) -> R) -> R {
        f(&mut self.server.lock().unwrap())
    }

    pub fn set_reachable(&self, reachable: bool) {
        self.with(|s| s.reachable = reachable);
    }

    pub fn seed(&self, message: RemoteMessage) {
        self.with(|s| s.messages.push(message));
    }

    /// Make the next fetch signal `entered` and wait for `release`.
    pub fn gate_fetch(&self, entered: Arc<Notify>, release: Arc<Notify>) {
        *self.fetch_gate.lock().unwrap() = Some((entered, release));
    }

    /// Same as [`gate_fetch`](Self::gate_fetch) for the next send.
    pub fn gate_send(&self, entered: Arc<Notify>, release: Arc<Notify>) {
        *self.send_gate.lock().unwrap() = Some((entered, release));
    }

    fn check(&self) -> Result<(), NetError> {
        if self.with(|s| s.reachable) {
            Ok(())
        } else {
            Err(NetError::Connect("connection refused".into()))
        }
    }

    fn accept(&self, mut message: RemoteMessage) -> Result<RemoteMessage, NetError> {
        self.check()?;
        self.with(|s| {
            if s.fail_sends {
                return Err(NetError::Status(500));
            }
            s.sends += 1;
            // Replays carrying a known client id get the original back.
            if let Some(existing) = s
                .messages
                .iter()
                .find(|m| m.client_id.is_some() && m.client_id == message.client_id)
            {
                return Ok(existing.clone());
            }
            s.next_id += 1;
            message.id = Some(format!("srv_{}", s.next_id));
            message.created_at = Some(Utc::now().to_rfc3339_opts(SecondsFormat::Nanos, true));
            s.messages.push(message.clone());
            Ok(message)
        })
    }
}

#[async_trait]
impl RemoteApi for FakeApi {
    async fn fetch_messages(
        &self,
        since: Option<DateTime<Utc>>,
        limit: u32,
    ) -> Result<Vec<RemoteMessage>, NetError> {
        pass(&self.fetch_gate).await;
        self.check()?;
        Ok(self.with(|s| {
            s.fetches += 1;
            s.messages
                .iter()
                .filter(|m| {
                    let created = m.created_at.as_deref().and_then(|c| parse_timestamp(c).ok());
                    match (since, created) {
                        (Some(since), Some(created)) => created > since,
                        _ => true,
                    }
                })
                .take(limit as usize)
                .cloned()
                .collect()
        }))
    }

    async fn send_text(&self, request: &SendTextRequest) -> Result<RemoteMessage, NetError> {
        pass(&self.send_gate).await;
        self.accept(RemoteMessage {
            username: Some(request.username.clone()),
            content: Some(request.content.clone()),
            message_type: Some("text".into()),
            reply_to: request.reply_to.clone(),
            client_id: Some(request.client_id.clone()),
            ..RemoteMessage::default()
        })
    }

    async fn send_voice(&self, upload: &VoiceUpload) -> Result<RemoteMessage, NetError> {
        pass(&self.send_gate).await;
        self.accept(RemoteMessage {
            username: Some(upload.username.clone()),
            message_type: Some("voice".into()),
            audio_url: Some(format!("https://cdn.example/{}.m4a", upload.client_id)),
            audio_duration: Some(upload.duration),
            reply_to: upload.reply_to.clone(),
            client_id: Some(upload.client_id.clone()),
            ..RemoteMessage::default()
        })
    }

    async fn send_reaction(&self, request: &ReactionRequest) -> Result<(), NetError> {
        self.check()?;
        self.with(|s| {
            let target = s
                .messages
                .iter_mut()
                .find(|m| m.id.as_deref() == Some(request.message_id.as_str()))
                .ok_or(NetError::Status(404))?;
            target.reactions.toggle(&request.emoji, &request.username);
            s.reactions.push(request.clone());
            Ok(())
        })
    }
}
