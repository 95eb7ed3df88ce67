//! drover — drive real browsers over their native debugging protocols.
//!
//! This crate is the protocol-adapter layer of the engine: three backend
//! implementations (Chromium DevTools Protocol, WebKit Inspector Protocol,
//! WebDriver BiDi) behind one [`PageDelegate`] contract, so the
//! protocol-agnostic page model above can drive any engine uniformly.
//!
//! Each backend owns its session topology — flat `sessionId` child sessions
//! for Chromium, nested `Target.sendMessageToTarget` envelopes for WebKit, a
//! single stream of browsing-context-addressed commands for BiDi — and
//! translates its navigation, realm and network event vocabulary into the
//! shared [`PageEvent`] stream. Backend-native payload shapes never cross
//! this boundary.
//!
//! The shared bookkeeping the backends drive lives here too:
//!
//! - [`lifecycle::FrameTracker`] — per-frame navigation state machine with
//!   document generations and stale-event discard
//! - [`realms::RealmTable`] — execution-context table with per-realm
//!   addressing and frame-detach cascade
//! - [`network::NetworkTracker`] — request correlation with redirect chains
//!   and deferred body retrieval

pub mod bidi;
pub mod chromium;
pub mod delegate;
pub mod input;
mod json;
pub mod lifecycle;
pub mod network;
pub mod realms;
pub mod registry;
pub mod webkit;

pub use delegate::{
    CallArgument, CallResult, GotoResult, PageDelegate, PageEvent, PageEventSink, RemoteHandle,
};
pub use drover_protocol as protocol;
pub use drover_runtime::{Error, Result};
pub use registry::{PageId, PageRegistry};
