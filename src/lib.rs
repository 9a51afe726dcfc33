//! HTTP Proxy Ingress
//!
//! Accepts raw TCP connections, reads an HTTP proxy request, enforces Basic
//! proxy authentication with a short-lived decision cache, answers CONNECT,
//! and hands each classified connection to a relay dispatcher.

pub mod adapter;
pub mod auth;
pub mod cache;
pub mod config;
pub mod error;
pub mod handler;
pub mod listener;
pub mod relay;
pub mod request;
pub mod security;

// Re-export commonly used types and functions
pub use adapter::{Metadata, RelayAdapter, RelayMode};
pub use auth::{Authenticator, DecisionCache, StaticAuthenticator, User, evaluate};
pub use cache::TtlCache;
pub use config::{Config, ListenConfig, load_config};
pub use error::{Error, Result};
pub use handler::{CloseReason, Disposition, ProxyContext, handle_connection};
pub use listener::Listener;
pub use relay::{ChannelDispatcher, DirectRelay, Dispatcher};
pub use request::{HttpRequest, read_request};
pub use security::is_client_ip_allowed;
