//! Real-time transports.
//!
//! The channel client tries its transports in order: a WebSocket first, then
//! HTTP long-polling for networks that block upgrades. Both carry the same
//! `{"event": …, "data": …}` JSON frames.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures::{SinkExt, StreamExt};
use reqwest::{Client, StatusCode};
use serde::Deserialize;
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::Message as WsMessage;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use tracing::{debug, info};
use url::Url;

use parley_shared::protocol::ClientEvent;

use crate::api::CredentialProvider;
use crate::error::{ChannelError, NetError};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TransportKind {
    WebSocket,
    Polling,
}

impl std::fmt::Display for TransportKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            Self::WebSocket => "websocket",
            Self::Polling => "polling",
        })
    }
}

#[async_trait]
pub trait Transport: Send + Sync {
    fn kind(&self) -> TransportKind;

    async fn open(&self, identity: &str) -> Result<Box<dyn Connection>, ChannelError>;
}

/// One open real-time session.
#[async_trait]
pub trait Connection: Send {
    async fn send(&mut self, event: &ClientEvent) -> Result<(), ChannelError>;

    /// Next inbound frame, or `None` once the server closed the session.
    async fn recv(&mut self) -> Result<Option<String>, ChannelError>;
}

// ---------------------------------------------------------------------------
// WebSocket
// ---------------------------------------------------------------------------

pub struct WebSocketTransport {
    url: Url,
    credentials: Arc<dyn CredentialProvider>,
}

impl WebSocketTransport {
    pub fn new(url: &str, credentials: Arc<dyn CredentialProvider>) -> Result<Self, ChannelError> {
        Ok(Self {
            url: Url::parse(url)?,
            credentials,
        })
    }
}

#[async_trait]
impl Transport for WebSocketTransport {
    fn kind(&self) -> TransportKind {
        TransportKind::WebSocket
    }

    async fn open(&self, identity: &str) -> Result<Box<dyn Connection>, ChannelError> {
        let mut url = self.url.clone();
        let token = self.credentials.bearer_token().await?;
        {
            let mut query = url.query_pairs_mut();
            query.append_pair("username", identity);
            if let Some(token) = token {
                query.append_pair("token", &token);
            }
        }

        let (stream, _) = connect_async(url.as_str()).await?;
        info!(url = %self.url, "websocket connected");
        Ok(Box::new(WsConnection { stream }))
    }
}

struct WsConnection {
    stream: WebSocketStream<MaybeTlsStream<TcpStream>>,
}

#[async_trait]
impl Connection for WsConnection {
    async fn send(&mut self, event: &ClientEvent) -> Result<(), ChannelError> {
        self.stream.send(WsMessage::Text(event.to_json()?)).await?;
        Ok(())
    }

    async fn recv(&mut self) -> Result<Option<String>, ChannelError> {
        while let Some(frame) = self.stream.next().await {
            match frame? {
                WsMessage::Text(text) => return Ok(Some(text)),
                WsMessage::Close(_) => return Ok(None),
                // Pings are answered by tungstenite itself.
                _ => continue,
            }
        }
        Ok(None)
    }
}

// ---------------------------------------------------------------------------
// HTTP long-polling
// ---------------------------------------------------------------------------

/// Fallback transport: `POST /realtime/session` opens a session, then
/// `GET /realtime/{id}/poll` blocks until frames arrive and
/// `POST /realtime/{id}/emit` sends one.
pub struct PollingTransport {
    http: Client,
    base_url: String,
    credentials: Arc<dyn CredentialProvider>,
    poll_timeout: Duration,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct SessionOpened {
    session_id: String,
}

impl PollingTransport {
    pub fn new(
        base_url: &str,
        credentials: Arc<dyn CredentialProvider>,
        poll_timeout: Duration,
    ) -> Result<Self, ChannelError> {
        Url::parse(base_url)?;
        Ok(Self {
            http: Client::builder().build().map_err(NetError::from)?,
            base_url: base_url.trim_end_matches('/').to_string(),
            credentials,
            poll_timeout,
        })
    }
}

#[async_trait]
impl Transport for PollingTransport {
    fn kind(&self) -> TransportKind {
        TransportKind::Polling
    }

    async fn open(&self, identity: &str) -> Result<Box<dyn Connection>, ChannelError> {
        let token = self.credentials.bearer_token().await?;
        let mut request = self
            .http
            .post(format!("{}/realtime/session", self.base_url))
            .json(&serde_json::json!({ "username": identity }))
            .timeout(self.poll_timeout);
        if let Some(token) = &token {
            request = request.bearer_auth(token);
        }

        let opened: SessionOpened = request
            .send()
            .await
            .and_then(|r| r.error_for_status())
            .map_err(NetError::from)?
            .json()
            .await
            .map_err(NetError::from)?;
        info!(session = %opened.session_id, "long-poll session opened");

        let session_url = format!("{}/realtime/{}", self.base_url, opened.session_id);
        let (frames_tx, frames) = mpsc::channel(POLL_BUFFER);
        let poller = tokio::spawn(poll_loop(
            self.http.clone(),
            format!("{session_url}/poll"),
            token.clone(),
            self.poll_timeout,
            frames_tx,
        ));

        Ok(Box::new(PollConnection {
            http: self.http.clone(),
            session_url,
            token,
            poll_timeout: self.poll_timeout,
            frames,
            poller,
        }))
    }
}

/// Frames decoded by the poller but not yet handed to the channel.
const POLL_BUFFER: usize = 64;

type PolledFrame = Result<String, ChannelError>;

/// Polls in its own task so a `recv` dropped mid-request (the channel loop
/// selects on it) never loses an answered batch.
async fn poll_loop(
    http: Client,
    poll_url: String,
    token: Option<String>,
    poll_timeout: Duration,
    frames: mpsc::Sender<PolledFrame>,
) {
    while !frames.is_closed() {
        let mut request = http.get(&poll_url).timeout(poll_timeout);
        if let Some(token) = &token {
            request = request.bearer_auth(token);
        }

        let response = match request.send().await {
            Ok(r) => r,
            // An idle long-poll simply expires; ask again.
            Err(e) if e.is_timeout() => continue,
            Err(e) => {
                let _ = frames.send(Err(NetError::from(e).into())).await;
                return;
            }
        };

        match response.status() {
            StatusCode::NO_CONTENT => continue,
            StatusCode::NOT_FOUND | StatusCode::GONE => {
                debug!("long-poll session closed by server");
                return;
            }
            _ => {}
        }

        let batch = match response.error_for_status() {
            Ok(r) => r.json::<Vec<serde_json::Value>>().await,
            Err(e) => Err(e),
        };
        let batch = match batch {
            Ok(batch) => batch,
            Err(e) => {
                let _ = frames.send(Err(NetError::from(e).into())).await;
                return;
            }
        };

        debug!(count = batch.len(), "long-poll frames");
        for frame in batch {
            if frames.send(Ok(frame.to_string())).await.is_err() {
                return;
            }
        }
    }
}

struct PollConnection {
    http: Client,
    session_url: String,
    token: Option<String>,
    poll_timeout: Duration,
    frames: mpsc::Receiver<PolledFrame>,
    poller: JoinHandle<()>,
}

impl Drop for PollConnection {
    fn drop(&mut self) {
        self.poller.abort();
    }
}

#[async_trait]
impl Connection for PollConnection {
    async fn send(&mut self, event: &ClientEvent) -> Result<(), ChannelError> {
        let mut request = self
            .http
            .post(format!("{}/emit", self.session_url))
            .json(event)
            .timeout(self.poll_timeout);
        if let Some(token) = &self.token {
            request = request.bearer_auth(token);
        }
        request
            .send()
            .await
            .and_then(|r| r.error_for_status())
            .map_err(NetError::from)?;
        Ok(())
    }

    async fn recv(&mut self) -> Result<Option<String>, ChannelError> {
        // `mpsc::Receiver::recv` is cancel-safe.
        match self.frames.recv().await {
            Some(frame) => frame.map(Some),
            None => Ok(None),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    use axum::extract::{Path, State};
    use axum::http::StatusCode as AxumStatus;
    use axum::routing::{get, post};
    use axum::{Json, Router};

    use crate::api::StaticToken;

    #[derive(Clone, Default)]
    struct Server {
        emitted: Arc<Mutex<Vec<serde_json::Value>>>,
        polls: Arc<Mutex<u32>>,
    }

    async fn open_session() -> Json<serde_json::Value> {
        Json(serde_json::json!({ "sessionId": "s1" }))
    }

    async fn emit(
        State(server): State<Server>,
        Path(_sid): Path<String>,
        Json(body): Json<serde_json::Value>,
    ) -> AxumStatus {
        server.emitted.lock().unwrap().push(body);
        AxumStatus::OK
    }

    async fn poll(
        State(server): State<Server>,
        Path(_sid): Path<String>,
    ) -> Result<Json<serde_json::Value>, AxumStatus> {
        let mut polls = server.polls.lock().unwrap();
        *polls += 1;
        match *polls {
            1 => Err(AxumStatus::NO_CONTENT),
            2 => Ok(Json(serde_json::json!([
                {"event": "onlineUsers", "data": []},
                {"event": "messagesCleanup", "data": {"cutoffDate": "2024-01-01"}}
            ]))),
            _ => Err(AxumStatus::GONE),
        }
    }

    #[tokio::test]
    async fn long_poll_session_round_trip() {
        let server = Server::default();
        let app = Router::new()
            .route("/realtime/session", post(open_session))
            .route("/realtime/:sid/emit", post(emit))
            .route("/realtime/:sid/poll", get(poll))
            .with_state(server.clone());
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });

        let transport = PollingTransport::new(
            &format!("http://{addr}"),
            Arc::new(StaticToken(None)),
            Duration::from_secs(5),
        )
        .unwrap();
        let mut conn = transport.open("alice").await.unwrap();

        conn.send(&ClientEvent::UpdateBadge {
            badge: serde_json::json!("gold"),
            current_streak: 2,
        })
        .await
        .unwrap();
        assert_eq!(server.emitted.lock().unwrap()[0]["event"], "updateBadge");

        let first = conn.recv().await.unwrap().unwrap();
        assert!(first.contains("onlineUsers"));
        let second = conn.recv().await.unwrap().unwrap();
        assert!(second.contains("messagesCleanup"));
        assert_eq!(conn.recv().await.unwrap(), None);
    }

    async fn slow_poll(
        State(server): State<Server>,
        Path(_sid): Path<String>,
    ) -> Result<Json<serde_json::Value>, AxumStatus> {
        let first = {
            let mut polls = server.polls.lock().unwrap();
            *polls += 1;
            *polls == 1
        };
        if !first {
            return Err(AxumStatus::GONE);
        }
        tokio::time::sleep(Duration::from_millis(200)).await;
        Ok(Json(serde_json::json!([{"event": "onlineUsers", "data": []}])))
    }

    #[tokio::test]
    async fn interrupted_recv_keeps_answered_frames() {
        let server = Server::default();
        let app = Router::new()
            .route("/realtime/session", post(open_session))
            .route("/realtime/:sid/emit", post(emit))
            .route("/realtime/:sid/poll", get(slow_poll))
            .with_state(server.clone());
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });

        let transport = PollingTransport::new(
            &format!("http://{addr}"),
            Arc::new(StaticToken(None)),
            Duration::from_secs(5),
        )
        .unwrap();
        let mut conn = transport.open("alice").await.unwrap();

        // The channel loop drops `recv` whenever a command wins the select.
        tokio::select! {
            frame = conn.recv() => panic!("poll answered too early: {frame:?}"),
            _ = tokio::time::sleep(Duration::from_millis(50)) => {}
        }
        conn.send(&ClientEvent::UpdateBadge {
            badge: serde_json::Value::Null,
            current_streak: 0,
        })
        .await
        .unwrap();

        let frame = conn.recv().await.unwrap().unwrap();
        assert!(frame.contains("onlineUsers"));
        assert_eq!(conn.recv().await.unwrap(), None);
        assert_eq!(*server.polls.lock().unwrap(), 2);
    }

    #[tokio::test]
    async fn websocket_refused_is_an_error() {
        let transport =
            WebSocketTransport::new("ws://127.0.0.1:9/realtime", Arc::new(StaticToken(None))).unwrap();
        assert!(transport.open("alice").await.is_err());
    }
}
