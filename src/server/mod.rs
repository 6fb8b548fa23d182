//! Inbound SSH server
//!
//! - `listener`: accept loop and per-connection task
//! - `handler`: russh callbacks, publickey auth and channel negotiation
//! - `registry`: connections and their logical channels
//! - `request`: per-channel negotiation state

mod auth;
mod handler;
mod listener;
mod registry;
mod request;

pub use auth::{authenticate, parse_login, AuthFailure, AuthenticatedUser};
pub use handler::{allowed_methods, BastionHandler};
pub use listener::{serve, serve_listener};
pub use registry::{Client, Connection, ConnectionRegistry, ReadySignal};
pub use request::{ChannelKind, HostPort, Negotiation, Request, RequestType, X11Params};
