//! Client for CQHTTP/OneBot websocket servers.
//!
//! Two halves that work together:
//!
//! - A codec for CQ codes, the inline `[CQ:kind,key=value]` markup chat messages use for
//!   mentions, images, replies and other rich content. [`parse`] turns text into a
//!   [`MessageChain`] of text and [`Tag`] segments; [`serialize`] goes back.
//! - A duplex connection that multiplexes request/response API calls and server-pushed events
//!   over one websocket. Calls are matched to responses by their `echo` id; events are
//!   classified into an [`EventCategory`] tree and fanned out to subscribers.
//!
//! To use the client:
//! 1. Build a [`ClientConfig`] (in code, or from TOML with `ClientConfig::from_file`)
//! 2. Create a [`Client`] and subscribe to events with `client.on(...)`
//! 3. Call `client.connect().await`
//! 4. Issue calls with `client.call(action, params).await`
//!
//! Uses `tokio` and `tokio-tungstenite` for I/O and `serde_json` for the wire format.

mod codec;
mod config;
mod connection;
mod correlator;
mod error;
mod event;
mod message;
mod tag;
mod transport;

pub use codec::*;
pub use config::*;
pub use connection::*;
pub use correlator::*;
pub use error::*;
pub use event::*;
pub use message::*;
pub use tag::*;
pub use transport::*;

pub use serde_json::Value;
