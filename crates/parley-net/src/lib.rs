// Network layer: connectivity monitoring, the REST message API and the
// real-time channel.

pub mod api;
pub mod channel;
pub mod error;
pub mod network;
pub mod transport;

pub use api::{CredentialProvider, HttpApi, RemoteApi, StaticToken};
pub use channel::{ChannelClient, ChannelConfig, ChannelHandler, ChannelStatus};
pub use error::{ChannelError, NetError};
pub use network::{ConnectivityProbe, NetworkMonitor, Subscription, TcpProbe};
pub use transport::{PollingTransport, Transport, TransportKind, WebSocketTransport};
