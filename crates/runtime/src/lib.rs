//! Runtime layer for the drover browser backends.
//!
//! This crate owns everything below the adapter layer: the message
//! [`transport`] to the browser process, the [`Session`] request/response
//! correlation scope, and the [`Connection`] that multiplexes sessions over
//! one transport. All three remote-debugging protocols share this plumbing;
//! only the routing key on the wire differs.
//!
//! [`Session`]: session::Session
//! [`Connection`]: connection::Connection

pub mod connection;
pub mod error;
pub mod session;
pub mod transport;

pub use connection::Connection;
pub use error::{Error, Result};
pub use session::{Session, SessionEvent, SessionRoute};
pub use transport::{Transport, TransportHarness};
