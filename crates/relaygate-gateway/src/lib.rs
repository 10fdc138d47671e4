//! relaygate-gateway — transport server and control plane
//!
//! Accepts agent, client and proxy-manager packet streams, authenticates
//! their handshake and runs one session worker per client session. The
//! control API drives proxy-manager streams and review decisions over HTTP.

pub mod agent;
pub mod auth;
pub mod control;
pub mod server;
pub mod session;
pub mod sessions;

pub use auth::{ConnectionResolver, Identity, IdentityProvider, StaticDirectory};
pub use server::{GatewayServer, GatewayState, ServerSettings};
