//! Client side: session construction and local pipers
//!
//! ```text
//! local app ──► pipe_tcp / pipe_udp ──► SessionSlot ──► Connector::make_session
//!                                                          │
//!                                                NumConn handshakes in parallel
//! ```

mod connector;
mod piper;

pub use connector::{Connector, RETRY_DELAY};
pub use piper::{pipe_tcp, pipe_udp, SessionSlot};
