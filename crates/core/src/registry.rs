//! Page registry — arena-and-index ownership for live pages.
//!
//! The page model, its delegate and the delegate's sessions form a cycle if
//! they hold references to each other. Instead, a page is registered under a
//! stable [`PageId`]; sessions keep the id and resolve through the registry
//! when they need the delegate, so teardown order never dangles.

use crate::delegate::PageDelegate;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

/// Stable identifier of a registered page.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct PageId(u64);

/// Registry of live pages, keyed by [`PageId`].
#[derive(Default)]
pub struct PageRegistry {
    next_id: AtomicU64,
    pages: Mutex<HashMap<PageId, Arc<dyn PageDelegate>>>,
}

impl PageRegistry {
    pub fn new() -> PageRegistry {
        PageRegistry::default()
    }

    /// Registers a page and returns its stable id.
    pub fn register(&self, page: Arc<dyn PageDelegate>) -> PageId {
        let id = PageId(self.next_id.fetch_add(1, Ordering::SeqCst));
        self.pages.lock().insert(id, page);
        id
    }

    /// Resolves a page id; `None` once the page is unregistered.
    pub fn resolve(&self, id: PageId) -> Option<Arc<dyn PageDelegate>> {
        self.pages.lock().get(&id).cloned()
    }

    /// Removes a page. Idempotent.
    pub fn unregister(&self, id: PageId) -> Option<Arc<dyn PageDelegate>> {
        self.pages.lock().remove(&id)
    }

    pub fn len(&self) -> usize {
        self.pages.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.pages.lock().is_empty()
    }
}
