//! Terminal front-end for the sync engine.
//!
//! Reads lines from stdin: plain text is sent as a message, `/react <id>
//! <emoji>` toggles a reaction, `/sync` forces a cycle and `/quit` exits.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use tokio::io::{AsyncBufReadExt, BufReader};
use url::Url;

use parley_net::{
    ChannelClient, ChannelConfig, ConnectivityProbe, HttpApi, NetworkMonitor, PollingTransport,
    StaticToken, TcpProbe, Transport, WebSocketTransport,
};
use parley_shared::constants::{CONNECTIVITY_POLL_SECS, PROBE_TIMEOUT_MS};
use parley_shared::{MessageId, Presence};
use parley_store::{Database, LocalStore};
use parley_sync::{init_tracing, ChatSession, SessionEvent, SyncConfig};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    init_tracing();
    let config = SyncConfig::from_env();
    tracing::info!(api = %config.api_url, user = %config.username, "Starting Parley headless client");

    let store = match &config.db_path {
        Some(path) => LocalStore::open_at(path)?,
        None => LocalStore::new(Database::new()?),
    };

    let credentials = Arc::new(StaticToken(config.token.clone()));
    let api = HttpApi::new(&config.api_url, credentials.clone())?
        .with_timeouts(config.request_timeout, config.upload_timeout);

    let api_url = Url::parse(&config.api_url)?;
    let probe: Arc<dyn ConnectivityProbe> = Arc::new(
        TcpProbe::for_url(&api_url, Duration::from_millis(PROBE_TIMEOUT_MS))
            .context("API URL has no host to probe")?,
    );
    let network = NetworkMonitor::probed(probe.as_ref()).await;
    let _probe_task = network.spawn_probe_loop(probe, Duration::from_secs(CONNECTIVITY_POLL_SECS));
    let _transitions = network.subscribe(|online| {
        if online {
            tracing::info!("Connectivity restored");
        } else {
            tracing::warn!("Connectivity lost, working offline");
        }
    });

    let transports: Vec<Arc<dyn Transport>> = vec![
        Arc::new(WebSocketTransport::new(&config.realtime_endpoint()?, credentials.clone())?),
        Arc::new(PollingTransport::new(&config.api_url, credentials, config.request_timeout)?),
    ];
    let channel = Arc::new(ChannelClient::new(transports, ChannelConfig::default()));

    let session = ChatSession::new(
        &config.username,
        store,
        network,
        Arc::new(api),
        channel,
        &config,
    );

    let mut events = session.subscribe();
    let watcher = session.clone();
    tokio::spawn(async move {
        while let Ok(event) = events.recv().await {
            match event {
                SessionEvent::MessagesChanged => {
                    if let Some(last) = watcher.messages().last() {
                        let state = if last.pending { "pending" } else if last.synced { "sent" } else { "sending" };
                        println!(
                            "[{}] {}: {} ({state})",
                            last.id,
                            last.author,
                            last.body.as_deref().unwrap_or("<voice>")
                        );
                    }
                }
                SessionEvent::Notice(notice) => println!("! {}", notice.message),
                other => tracing::debug!(event = other.name(), "session event"),
            }
        }
    });

    session.start(Presence::default()).await?;

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    while let Some(line) = lines.next_line().await? {
        let line = line.trim();
        let result = match line.split_whitespace().collect::<Vec<_>>().as_slice() {
            [] => continue,
            ["/quit"] => break,
            ["/sync"] => session.force_sync().await.map(|_| ()),
            ["/react", id, emoji] => session
                .add_reaction(&MessageId::from(*id), emoji)
                .await
                .map(|_| ()),
            _ => session.send(line, None).await.map(|_| ()),
        };
        if let Err(e) = result {
            eprintln!("error: {e}");
        }
    }

    session.dispose().await;
    tracing::info!("Parley headless client stopped");
    Ok(())
}
