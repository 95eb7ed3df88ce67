//! Execution-context (realm) bookkeeping.
//!
//! Each target's frame session owns one table mapping protocol-local realm
//! ids to the frame and world they belong to, plus the addressing mode the
//! backend resolved at creation time. The address is resolved once and
//! reused for the realm's lifetime — some backends treat a sandbox name as
//! routing to a different realm after re-navigation, so re-deriving the
//! target per call is wrong.

use drover_protocol::{FrameId, RealmId, World};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;

/// How evaluate/call-function requests address this realm on the wire.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RealmAddress {
    /// Numeric execution-context id (Chromium, WebKit).
    ContextId(i64),
    /// Browsing context plus sandbox name (BiDi utility-world touch).
    ContextSandbox {
        context: Arc<str>,
        sandbox: Option<Arc<str>>,
    },
    /// Opaque realm handle (BiDi).
    Handle(Arc<str>),
}

/// One live realm.
#[derive(Debug, Clone)]
pub struct RealmEntry {
    pub realm: RealmId,
    pub frame: FrameId,
    /// `None` for anonymous sandboxes we track but never report upward.
    pub world: Option<World>,
    pub address: RealmAddress,
}

/// Realm table owned by one frame session.
#[derive(Default)]
pub struct RealmTable {
    realms: Mutex<HashMap<RealmId, RealmEntry>>,
}

impl RealmTable {
    pub fn new() -> RealmTable {
        RealmTable::default()
    }

    /// Inserts a realm. Returns false if the id is already present
    /// (duplicate creation events are ignored).
    pub fn created(&self, entry: RealmEntry) -> bool {
        let mut realms = self.realms.lock();
        if realms.contains_key(&entry.realm) {
            return false;
        }
        realms.insert(entry.realm.clone(), entry);
        true
    }

    /// Removes a realm, returning its entry if it was present.
    pub fn destroyed(&self, realm: &RealmId) -> Option<RealmEntry> {
        self.realms.lock().remove(realm)
    }

    /// Removes every realm owned by the frame. Called on frame detach,
    /// before the detach is reported upward, so no caller can observe a
    /// live realm for a detached frame.
    pub fn remove_frame(&self, frame: &FrameId) -> Vec<RealmEntry> {
        let mut realms = self.realms.lock();
        let ids: Vec<RealmId> = realms
            .iter()
            .filter(|(_, entry)| entry.frame == *frame)
            .map(|(id, _)| id.clone())
            .collect();
        ids.iter().filter_map(|id| realms.remove(id)).collect()
    }

    /// Removes everything; the session's contexts were cleared wholesale.
    pub fn clear(&self) -> Vec<RealmEntry> {
        self.realms.lock().drain().map(|(_, entry)| entry).collect()
    }

    pub fn get(&self, realm: &RealmId) -> Option<RealmEntry> {
        self.realms.lock().get(realm).cloned()
    }

    /// Finds the realm of a given world in a frame.
    pub fn find(&self, frame: &FrameId, world: World) -> Option<RealmEntry> {
        self.realms
            .lock()
            .values()
            .find(|entry| entry.frame == *frame && entry.world == Some(world))
            .cloned()
    }

    pub fn frame_realm_count(&self, frame: &FrameId) -> usize {
        self.realms
            .lock()
            .values()
            .filter(|entry| entry.frame == *frame)
            .count()
    }

    pub fn len(&self) -> usize {
        self.realms.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.realms.lock().is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(realm: &str, frame: &str, world: Option<World>) -> RealmEntry {
        RealmEntry {
            realm: Arc::from(realm),
            frame: Arc::from(frame),
            world,
            address: RealmAddress::Handle(Arc::from(realm)),
        }
    }

    #[test]
    fn duplicate_creation_is_ignored() {
        let table = RealmTable::new();
        assert!(table.created(entry("r1", "F", Some(World::Main))));
        assert!(!table.created(entry("r1", "F", Some(World::Utility))));
        assert_eq!(table.get(&Arc::from("r1")).unwrap().world, Some(World::Main));
    }

    #[test]
    fn frame_detach_cascades_all_worlds() {
        let table = RealmTable::new();
        table.created(entry("r1", "F", Some(World::Main)));
        table.created(entry("r2", "F", Some(World::Utility)));
        table.created(entry("r3", "F", None));
        table.created(entry("r4", "G", Some(World::Main)));

        let removed = table.remove_frame(&Arc::from("F"));
        assert_eq!(removed.len(), 3);
        assert_eq!(table.frame_realm_count(&Arc::from("F")), 0);
        assert_eq!(table.len(), 1);
    }

    #[test]
    fn attach_detach_sequences_leave_no_entries() {
        let table = RealmTable::new();
        for round in 0..3 {
            let realm = format!("r{round}");
            table.created(entry(&realm, "F", Some(World::Main)));
            let removed = table.remove_frame(&Arc::from("F"));
            assert_eq!(removed.len(), 1);
            assert_eq!(table.frame_realm_count(&Arc::from("F")), 0);
        }
        assert!(table.is_empty());
    }

    #[test]
    fn find_by_world() {
        let table = RealmTable::new();
        table.created(entry("r1", "F", Some(World::Main)));
        table.created(entry("r2", "F", Some(World::Utility)));
        let found = table.find(&Arc::from("F"), World::Utility).unwrap();
        assert_eq!(found.realm.as_ref(), "r2");
        assert!(table.find(&Arc::from("G"), World::Main).is_none());
    }
}
