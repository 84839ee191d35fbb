//! Real-time channel client.
//!
//! A single background task owns the live connection. Callers talk to it
//! through a command queue and receive inbound events through a
//! [`ChannelHandler`]. On connection loss the task reconnects a bounded number
//! of times, trying each transport in order, and announces the user again
//! with `joinChat` after every successful connect.

use std::panic::AssertUnwindSafe;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use futures::FutureExt;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use parley_shared::constants::{RECONNECT_ATTEMPTS, RECONNECT_DELAY_MS};
use parley_shared::protocol::{ClientEvent, ServerEvent};
use parley_shared::Presence;

use crate::error::ChannelError;
use crate::transport::{Connection, Transport, TransportKind};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChannelStatus {
    Connected(TransportKind),
    Disconnected,
    ConnectError(String),
    /// Reconnect attempts are exhausted; a new `connect` call is needed.
    GaveUp,
}

/// Receives everything the channel delivers.
///
/// Errors and panics raised by `on_event` are logged and swallowed so one bad
/// event never tears down the connection.
#[async_trait]
pub trait ChannelHandler: Send + Sync {
    async fn on_event(&self, event: ServerEvent) -> anyhow::Result<()>;

    async fn on_status(&self, _status: ChannelStatus) {}
}

#[derive(Debug, Clone)]
pub struct ChannelConfig {
    pub reconnect_attempts: u32,
    pub reconnect_delay: Duration,
}

impl Default for ChannelConfig {
    fn default() -> Self {
        Self {
            reconnect_attempts: RECONNECT_ATTEMPTS,
            reconnect_delay: Duration::from_millis(RECONNECT_DELAY_MS),
        }
    }
}

enum ChannelCommand {
    Emit(ClientEvent),
    Shutdown,
}

struct ActiveSession {
    identity: String,
    cmd_tx: mpsc::Sender<ChannelCommand>,
    task: JoinHandle<()>,
}

pub struct ChannelClient {
    transports: Vec<Arc<dyn Transport>>,
    config: ChannelConfig,
    presence: Arc<Mutex<Presence>>,
    session: tokio::sync::Mutex<Option<ActiveSession>>,
}

impl ChannelClient {
    /// `transports` are tried in order on every (re)connect.
    pub fn new(transports: Vec<Arc<dyn Transport>>, config: ChannelConfig) -> Self {
        Self {
            transports,
            config,
            presence: Arc::new(Mutex::new(Presence::default())),
            session: tokio::sync::Mutex::new(None),
        }
    }

    /// Start the channel for `identity`. Calling again while a session for the
    /// same identity is alive only refreshes the stored presence.
    pub async fn connect(
        &self,
        identity: &str,
        presence: Presence,
        handler: Arc<dyn ChannelHandler>,
    ) -> Result<(), ChannelError> {
        if self.transports.is_empty() {
            return Err(ChannelError::NotConnected);
        }
        *self.presence.lock().unwrap_or_else(|e| e.into_inner()) = presence;

        let mut session = self.session.lock().await;
        if let Some(active) = session.as_ref() {
            if !active.task.is_finished() {
                if active.identity == identity {
                    debug!(identity, "channel already running");
                    return Ok(());
                }
                info!(from = %active.identity, to = identity, "identity changed, restarting channel");
                let _ = active.cmd_tx.send(ChannelCommand::Shutdown).await;
            }
        }

        let (cmd_tx, cmd_rx) = mpsc::channel::<ChannelCommand>(64);
        let task = tokio::spawn(run_channel(
            identity.to_string(),
            self.transports.clone(),
            self.config.clone(),
            self.presence.clone(),
            handler,
            cmd_rx,
        ));
        *session = Some(ActiveSession {
            identity: identity.to_string(),
            cmd_tx,
            task,
        });
        Ok(())
    }

    /// Store `presence` for future joins and emit `updateBadge` now.
    pub async fn update_presence(&self, presence: Presence) -> Result<(), ChannelError> {
        *self.presence.lock().unwrap_or_else(|e| e.into_inner()) = presence.clone();
        self.emit(ClientEvent::UpdateBadge {
            badge: presence.badge,
            current_streak: presence.current_streak,
        })
        .await
    }

    pub async fn emit(&self, event: ClientEvent) -> Result<(), ChannelError> {
        let session = self.session.lock().await;
        match session.as_ref() {
            Some(active) if !active.task.is_finished() => active
                .cmd_tx
                .send(ChannelCommand::Emit(event))
                .await
                .map_err(|_| ChannelError::NotConnected),
            _ => Err(ChannelError::NotConnected),
        }
    }

    pub async fn is_running(&self) -> bool {
        matches!(self.session.lock().await.as_ref(), Some(a) if !a.task.is_finished())
    }

    /// Close the connection and stop reconnecting.
    pub async fn dispose(&self) {
        let Some(active) = self.session.lock().await.take() else {
            return;
        };
        let _ = active.cmd_tx.send(ChannelCommand::Shutdown).await;

        let abort = active.task.abort_handle();
        if tokio::time::timeout(Duration::from_secs(2), active.task).await.is_err() {
            warn!("channel task did not stop in time, aborting");
            abort.abort();
        }
        info!(identity = %active.identity, "channel disposed");
    }
}

enum PumpExit {
    Shutdown,
    Lost,
}

async fn run_channel(
    identity: String,
    transports: Vec<Arc<dyn Transport>>,
    config: ChannelConfig,
    presence: Arc<Mutex<Presence>>,
    handler: Arc<dyn ChannelHandler>,
    mut cmd_rx: mpsc::Receiver<ChannelCommand>,
) {
    let mut failures = 0u32;

    loop {
        match open_first(&transports, &identity).await {
            Ok((kind, mut conn)) => {
                failures = 0;
                info!(identity = %identity, transport = %kind, "channel connected");
                handler.on_status(ChannelStatus::Connected(kind)).await;

                let join = {
                    let p = presence.lock().unwrap_or_else(|e| e.into_inner());
                    ClientEvent::JoinChat {
                        username: identity.clone(),
                        badge: p.badge.clone(),
                        current_streak: p.current_streak,
                    }
                };
                let exit = match conn.send(&join).await {
                    Ok(()) => pump(conn.as_mut(), &mut cmd_rx, &handler).await,
                    Err(e) => {
                        warn!(error = %e, "joinChat failed");
                        PumpExit::Lost
                    }
                };

                handler.on_status(ChannelStatus::Disconnected).await;
                if let PumpExit::Shutdown = exit {
                    return;
                }
            }
            Err(e) => {
                warn!(error = %e, "channel connect failed");
                handler.on_status(ChannelStatus::ConnectError(e.to_string())).await;
            }
        }

        failures += 1;
        if failures >= config.reconnect_attempts {
            warn!(attempts = failures, "giving up on real-time channel");
            handler.on_status(ChannelStatus::GaveUp).await;
            return;
        }

        debug!(attempt = failures, delay = ?config.reconnect_delay, "reconnecting");
        let delay = tokio::time::sleep(config.reconnect_delay);
        tokio::pin!(delay);
        loop {
            tokio::select! {
                _ = &mut delay => break,
                cmd = cmd_rx.recv() => match cmd {
                    // Presence is re-sent with the next joinChat.
                    Some(ChannelCommand::Emit(_)) => debug!("dropping emit while reconnecting"),
                    Some(ChannelCommand::Shutdown) | None => return,
                },
            }
        }
    }
}

async fn open_first(
    transports: &[Arc<dyn Transport>],
    identity: &str,
) -> Result<(TransportKind, Box<dyn Connection>), ChannelError> {
    let mut last = ChannelError::NotConnected;
    for transport in transports {
        match transport.open(identity).await {
            Ok(conn) => return Ok((transport.kind(), conn)),
            Err(e) => {
                debug!(transport = %transport.kind(), error = %e, "transport unavailable");
                last = e;
            }
        }
    }
    Err(last)
}

async fn pump(
    conn: &mut dyn Connection,
    cmd_rx: &mut mpsc::Receiver<ChannelCommand>,
    handler: &Arc<dyn ChannelHandler>,
) -> PumpExit {
    loop {
        tokio::select! {
            cmd = cmd_rx.recv() => match cmd {
                Some(ChannelCommand::Emit(event)) => {
                    if let Err(e) = conn.send(&event).await {
                        warn!(error = %e, "channel emit failed");
                        return PumpExit::Lost;
                    }
                }
                Some(ChannelCommand::Shutdown) | None => return PumpExit::Shutdown,
            },
            frame = conn.recv() => match frame {
                Ok(Some(text)) => dispatch(handler, &text).await,
                Ok(None) => {
                    info!("channel closed by server");
                    return PumpExit::Lost;
                }
                Err(e) => {
                    warn!(error = %e, "channel receive failed");
                    return PumpExit::Lost;
                }
            },
        }
    }
}

async fn dispatch(handler: &Arc<dyn ChannelHandler>, frame: &str) {
    let event = match ServerEvent::from_json(frame) {
        Ok(event) => event,
        Err(e) => {
            warn!(error = %e, "ignoring malformed channel frame");
            return;
        }
    };
    let name = event.name();

    match AssertUnwindSafe(handler.on_event(event)).catch_unwind().await {
        Ok(Ok(())) => debug!(event = name, "channel event handled"),
        Ok(Err(e)) => error!(event = name, error = %e, "channel event handler failed"),
        Err(_) => error!(event = name, "channel event handler panicked"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct FakeConnection {
        inbound: mpsc::UnboundedReceiver<String>,
        sent: Arc<Mutex<Vec<ClientEvent>>>,
    }

    #[async_trait]
    impl Connection for FakeConnection {
        async fn send(&mut self, event: &ClientEvent) -> Result<(), ChannelError> {
            self.sent.lock().unwrap().push(event.clone());
            Ok(())
        }

        async fn recv(&mut self) -> Result<Option<String>, ChannelError> {
            Ok(self.inbound.recv().await)
        }
    }

    struct FakeTransport {
        kind: TransportKind,
        inbound: Mutex<Option<mpsc::UnboundedReceiver<String>>>,
        sent: Arc<Mutex<Vec<ClientEvent>>>,
        opens: AtomicUsize,
    }

    impl FakeTransport {
        fn working(kind: TransportKind) -> (Arc<Self>, mpsc::UnboundedSender<String>) {
            let (tx, rx) = mpsc::unbounded_channel();
            let transport = Self {
                kind,
                inbound: Mutex::new(Some(rx)),
                sent: Arc::default(),
                opens: AtomicUsize::new(0),
            };
            (Arc::new(transport), tx)
        }

        fn broken(kind: TransportKind) -> Arc<Self> {
            Arc::new(Self {
                kind,
                inbound: Mutex::new(None),
                sent: Arc::default(),
                opens: AtomicUsize::new(0),
            })
        }
    }

    #[async_trait]
    impl Transport for FakeTransport {
        fn kind(&self) -> TransportKind {
            self.kind
        }

        async fn open(&self, _identity: &str) -> Result<Box<dyn Connection>, ChannelError> {
            self.opens.fetch_add(1, Ordering::SeqCst);
            match self.inbound.lock().unwrap().take() {
                Some(inbound) => Ok(Box::new(FakeConnection {
                    inbound,
                    sent: self.sent.clone(),
                })),
                None => Err(ChannelError::Closed),
            }
        }
    }

    #[derive(Default)]
    struct Recorder {
        events: Mutex<Vec<&'static str>>,
        statuses: Mutex<Vec<ChannelStatus>>,
    }

    #[async_trait]
    impl ChannelHandler for Recorder {
        async fn on_event(&self, event: ServerEvent) -> anyhow::Result<()> {
            self.events.lock().unwrap().push(event.name());
            match event {
                ServerEvent::OnlineUsers(_) => panic!("handler bug"),
                ServerEvent::MessagesCleanup(_) => anyhow::bail!("store unavailable"),
                _ => Ok(()),
            }
        }

        async fn on_status(&self, status: ChannelStatus) {
            self.statuses.lock().unwrap().push(status);
        }
    }

    async fn wait_until(mut condition: impl FnMut() -> bool) {
        for _ in 0..300 {
            if condition() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("condition not reached");
    }

    fn fast() -> ChannelConfig {
        ChannelConfig {
            reconnect_attempts: 3,
            reconnect_delay: Duration::from_millis(5),
        }
    }

    fn presence(streak: i64) -> Presence {
        Presence {
            badge: serde_json::json!("gold"),
            current_streak: streak,
        }
    }

    #[tokio::test]
    async fn joins_on_connect_and_survives_failing_handlers() {
        let (ws, inbound) = FakeTransport::working(TransportKind::WebSocket);
        let client = ChannelClient::new(vec![ws.clone()], fast());
        let recorder = Arc::new(Recorder::default());

        client.connect("alice", presence(3), recorder.clone()).await.unwrap();

        inbound.send("not json".into()).unwrap();
        inbound
            .send(r#"{"event":"onlineUsers","data":[]}"#.into())
            .unwrap();
        inbound
            .send(r#"{"event":"messagesCleanup","data":{"cutoffDate":"2024-01-01"}}"#.into())
            .unwrap();
        inbound
            .send(r#"{"event":"messageUpdated","data":{"_id":"m1"}}"#.into())
            .unwrap();

        wait_until(|| recorder.events.lock().unwrap().len() == 3).await;
        assert_eq!(
            *recorder.events.lock().unwrap(),
            vec!["onlineUsers", "messagesCleanup", "messageUpdated"]
        );

        client.update_presence(presence(4)).await.unwrap();
        wait_until(|| ws.sent.lock().unwrap().len() == 2).await;

        let sent = ws.sent.lock().unwrap().clone();
        assert!(matches!(
            &sent[0],
            ClientEvent::JoinChat { username, current_streak: 3, .. } if username == "alice"
        ));
        assert!(matches!(sent[1], ClientEvent::UpdateBadge { current_streak: 4, .. }));

        client.dispose().await;
        assert!(!client.is_running().await);
        assert_eq!(
            recorder.statuses.lock().unwrap().first(),
            Some(&ChannelStatus::Connected(TransportKind::WebSocket))
        );
    }

    #[tokio::test]
    async fn falls_back_to_polling() {
        let ws = FakeTransport::broken(TransportKind::WebSocket);
        let (polling, _inbound) = FakeTransport::working(TransportKind::Polling);
        let client = ChannelClient::new(vec![ws.clone(), polling.clone()], fast());
        let recorder = Arc::new(Recorder::default());

        client.connect("alice", presence(0), recorder.clone()).await.unwrap();
        wait_until(|| !recorder.statuses.lock().unwrap().is_empty()).await;

        assert_eq!(
            recorder.statuses.lock().unwrap()[0],
            ChannelStatus::Connected(TransportKind::Polling)
        );
        assert_eq!(ws.opens.load(Ordering::SeqCst), 1);
        client.dispose().await;
    }

    #[tokio::test]
    async fn reconnect_is_bounded() {
        let ws = FakeTransport::broken(TransportKind::WebSocket);
        let polling = FakeTransport::broken(TransportKind::Polling);
        let client = ChannelClient::new(vec![ws.clone(), polling.clone()], fast());
        let recorder = Arc::new(Recorder::default());

        client.connect("alice", presence(0), recorder.clone()).await.unwrap();
        wait_until(|| {
            recorder.statuses.lock().unwrap().last() == Some(&ChannelStatus::GaveUp)
        })
        .await;

        assert_eq!(ws.opens.load(Ordering::SeqCst), 3);
        assert_eq!(polling.opens.load(Ordering::SeqCst), 3);
        for _ in 0..300 {
            if !client.is_running().await {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert!(matches!(
            client.emit(ClientEvent::UpdateBadge {
                badge: serde_json::Value::Null,
                current_streak: 0
            })
            .await,
            Err(ChannelError::NotConnected)
        ));
    }

    #[tokio::test]
    async fn connect_is_idempotent_per_identity() {
        let (ws, _inbound) = FakeTransport::working(TransportKind::WebSocket);
        let client = ChannelClient::new(vec![ws.clone()], fast());
        let recorder = Arc::new(Recorder::default());

        client.connect("alice", presence(0), recorder.clone()).await.unwrap();
        client.connect("alice", presence(1), recorder.clone()).await.unwrap();
        wait_until(|| !ws.sent.lock().unwrap().is_empty()).await;

        assert_eq!(ws.opens.load(Ordering::SeqCst), 1);
        client.dispose().await;
    }
}
