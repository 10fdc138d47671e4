//! Session transport, plugin pipeline and audit log
//!
//! Everything a gateway process needs except the network listeners:
//! the packet model and framed stream, per-session context, the write-ahead
//! audit log, the session search index, the ordered plugin pipeline with its
//! built-in units, the dispatcher used by the control API and the session
//! router.

pub mod config;
pub mod context;
pub mod dispatcher;
pub mod encoding;
pub mod index;
pub mod packet;
pub mod plugin;
pub mod plugins;
pub mod router;
pub mod stream;
pub mod wal;

pub use config::GatewayConfig;
pub use context::{AgentMode, ClientOrigin, Lifetime, LifetimeEnd, SessionContext};
pub use dispatcher::{
    ClientRequest, ClientStatus, DispatchError, DispatchReceiver, Dispatcher, DispatcherSettings,
};
pub use packet::{Component, Packet};
pub use plugin::{Pipeline, Plugin, PluginError, PluginRegistry, PluginResponse, Received};
pub use router::{RouterError, SessionRouter};
pub use stream::{PacketSender, PacketStream, StreamError};
pub use wal::{WalError, WalSettings, WalStore};
