//! Connectivity tracking.
//!
//! [`NetworkMonitor`] holds the current online/offline flag and fans
//! transitions out to callbacks and `watch` receivers. What "online" means is
//! decided by a pluggable [`ConnectivityProbe`]; the default [`TcpProbe`]
//! opens a TCP connection to the API host.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;

use async_trait::async_trait;
use tokio::net::TcpStream;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info};
use url::Url;

type Callback = Arc<dyn Fn(bool) + Send + Sync>;

struct MonitorInner {
    state: watch::Sender<bool>,
    subscribers: Mutex<HashMap<u64, Callback>>,
    next_id: AtomicU64,
}

#[derive(Clone)]
pub struct NetworkMonitor {
    inner: Arc<MonitorInner>,
}

impl NetworkMonitor {
    pub fn new(initially_online: bool) -> Self {
        let (state, _) = watch::channel(initially_online);
        Self {
            inner: Arc::new(MonitorInner {
                state,
                subscribers: Mutex::new(HashMap::new()),
                next_id: AtomicU64::new(1),
            }),
        }
    }

    /// Build a monitor whose initial state comes from one probe run.
    pub async fn probed(probe: &dyn ConnectivityProbe) -> Self {
        Self::new(probe.check().await)
    }

    pub fn is_online(&self) -> bool {
        *self.inner.state.borrow()
    }

    /// Record a connectivity observation. Subscribers are only notified when
    /// the value actually changes; returns whether it did.
    pub fn set_online(&self, online: bool) -> bool {
        let changed = self.inner.state.send_if_modified(|current| {
            if *current == online {
                false
            } else {
                *current = online;
                true
            }
        });

        if changed {
            info!(online, "connectivity changed");
            // Snapshot so callbacks may subscribe or unsubscribe re-entrantly.
            let callbacks: Vec<Callback> = self
                .inner
                .subscribers
                .lock()
                .unwrap_or_else(|e| e.into_inner())
                .values()
                .cloned()
                .collect();
            for callback in callbacks {
                callback(online);
            }
        }
        changed
    }

    /// Register a callback invoked on every transition. The callback stays
    /// registered until the returned [`Subscription`] is dropped or
    /// explicitly unsubscribed.
    pub fn subscribe<F>(&self, callback: F) -> Subscription
    where
        F: Fn(bool) + Send + Sync + 'static,
    {
        let id = self.inner.next_id.fetch_add(1, Ordering::Relaxed);
        self.inner
            .subscribers
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(id, Arc::new(callback));
        Subscription {
            id,
            monitor: Arc::downgrade(&self.inner),
        }
    }

    /// Receiver that observes the flag; `changed()` fires on transitions.
    pub fn watch(&self) -> watch::Receiver<bool> {
        self.inner.state.subscribe()
    }

    pub fn subscriber_count(&self) -> usize {
        self.inner
            .subscribers
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .len()
    }

    /// Re-run `probe` every `interval` and feed the result into the monitor.
    pub fn spawn_probe_loop(
        &self,
        probe: Arc<dyn ConnectivityProbe>,
        interval: Duration,
    ) -> JoinHandle<()> {
        let monitor = self.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                let online = probe.check().await;
                debug!(online, "connectivity probe");
                monitor.set_online(online);
            }
        })
    }
}

/// Keeps a [`NetworkMonitor::subscribe`] callback registered.
pub struct Subscription {
    id: u64,
    monitor: Weak<MonitorInner>,
}

impl Subscription {
    pub fn unsubscribe(self) {
        // Drop does the work.
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        if let Some(inner) = self.monitor.upgrade() {
            inner
                .subscribers
                .lock()
                .unwrap_or_else(|e| e.into_inner())
                .remove(&self.id);
        }
    }
}

/// Decides whether the backend is currently reachable.
#[async_trait]
pub trait ConnectivityProbe: Send + Sync {
    async fn check(&self) -> bool;
}

/// Reachability by TCP connect to a fixed `host:port`.
pub struct TcpProbe {
    addr: String,
    timeout: Duration,
}

impl TcpProbe {
    pub fn new(addr: impl Into<String>, timeout: Duration) -> Self {
        Self {
            addr: addr.into(),
            timeout,
        }
    }

    /// Probe the host serving `url`, on its explicit or default port.
    pub fn for_url(url: &Url, timeout: Duration) -> Option<Self> {
        let host = url.host_str()?;
        let port = url.port_or_known_default()?;
        Some(Self::new(format!("{host}:{port}"), timeout))
    }

    pub fn addr(&self) -> &str {
        &self.addr
    }
}

#[async_trait]
impl ConnectivityProbe for TcpProbe {
    async fn check(&self) -> bool {
        matches!(
            tokio::time::timeout(self.timeout, TcpStream::connect(&self.addr)).await,
            Ok(Ok(_))
        )
    }
}
