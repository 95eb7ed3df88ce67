//! Wire types shared by the drover browser backends.
//!
//! Every remote-debugging protocol drover speaks (Chromium DevTools, WebKit
//! Inspector, WebDriver BiDi) exchanges JSON messages with the same outer
//! shape: id-correlated requests and responses, plus id-less events. This
//! crate contains that envelope, the normalized geometry and input types the
//! adapter layer hands upward, and the canonical in-memory JavaScript value
//! model every backend codec converts to and from.
//!
//! # Design Philosophy
//!
//! Types in this crate are:
//! - **Pure data**: No behavior beyond serialization and value equality
//! - **Backend-neutral**: Backend-specific payload shapes live with their
//!   backend and never cross the adapter boundary
//! - **Stable**: Changes only when the internal contract changes

pub mod message;
pub mod types;
pub mod value;

pub use message::*;
pub use types::*;
pub use value::*;
