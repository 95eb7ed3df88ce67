//! Per-frame navigation state machine.
//!
//! Tracks the frame tree and, for each frame, the committed document
//! generation and which lifecycle milestones fired against it. The tracker
//! is pure bookkeeping: methods return what changed and the owning backend
//! turns that into [`PageEvent`](crate::PageEvent)s, so the three backends
//! share one set of transition rules.
//!
//! Generation discipline: `domcontentloaded`/`load` only apply when the
//! event's generation token matches the frame's current generation. Events
//! against a superseded generation are an expected race during fast repeated
//! navigation and are dropped silently.

use drover_protocol::{DocumentId, FrameId, LifecycleEvent};
use parking_lot::Mutex;
use std::collections::{HashMap, HashSet};

#[derive(Debug)]
struct FrameNode {
    parent: Option<FrameId>,
    url: String,
    /// Generation of the committed document, if any committed yet.
    current: Option<DocumentId>,
    /// Generation of a navigation that started but has not committed.
    pending: Option<DocumentId>,
    fired: HashSet<LifecycleEvent>,
}

/// What a commit call changed.
#[derive(Debug, PartialEq, Eq)]
pub enum CommitOutcome {
    /// The frame now shows a new document of this generation.
    Committed,
    /// The generation was already current; nothing to report again.
    AlreadyCurrent,
    /// The frame is unknown (detached before the event was processed).
    UnknownFrame,
}

/// Frame-tree and navigation bookkeeping shared by all backends.
#[derive(Default)]
pub struct FrameTracker {
    frames: Mutex<HashMap<FrameId, FrameNode>>,
}

impl FrameTracker {
    pub fn new() -> FrameTracker {
        FrameTracker::default()
    }

    /// Records an attached frame. Returns false if the frame was already
    /// known (re-announcements are expected when walking an existing tree).
    pub fn attach(&self, frame: &FrameId, parent: Option<&FrameId>) -> bool {
        let mut frames = self.frames.lock();
        if frames.contains_key(frame) {
            return false;
        }
        frames.insert(
            frame.clone(),
            FrameNode {
                parent: parent.cloned(),
                url: String::new(),
                current: None,
                pending: None,
                fired: HashSet::new(),
            },
        );
        true
    }

    /// Removes a frame and every descendant, deepest-first. Returns the
    /// removed frame ids so the caller can cascade realm destruction before
    /// notifying upward.
    pub fn detach(&self, frame: &FrameId) -> Vec<FrameId> {
        let mut frames = self.frames.lock();
        if !frames.contains_key(frame) {
            return Vec::new();
        }
        let mut removed = Vec::new();
        collect_subtree(&frames, frame, &mut removed);
        // Children first, the detached root last.
        removed.reverse();
        for id in &removed {
            frames.remove(id);
        }
        removed
    }

    /// Removes every child of the frame (but not the frame itself); used
    /// when a frame transitions between local and remote sessions.
    pub fn remove_children(&self, frame: &FrameId) -> Vec<FrameId> {
        let mut frames = self.frames.lock();
        let children: Vec<FrameId> = frames
            .iter()
            .filter(|(_, node)| node.parent.as_ref() == Some(frame))
            .map(|(id, _)| id.clone())
            .collect();
        let mut removed = Vec::new();
        for child in children {
            collect_subtree(&frames, &child, &mut removed);
        }
        removed.reverse();
        for id in &removed {
            frames.remove(id);
        }
        removed
    }

    /// Records that a navigation started, keeping its generation token so a
    /// later abort can be matched to it.
    pub fn navigation_requested(&self, frame: &FrameId, document: Option<&DocumentId>) {
        if let Some(node) = self.frames.lock().get_mut(frame) {
            node.pending = document.cloned();
        }
    }

    /// Commits a new document. Clears the lifecycle flags of the previous
    /// generation; events still in flight for that generation will be
    /// dropped as stale.
    pub fn commit_new_document(
        &self,
        frame: &FrameId,
        url: &str,
        document: &DocumentId,
    ) -> CommitOutcome {
        let mut frames = self.frames.lock();
        let Some(node) = frames.get_mut(frame) else {
            return CommitOutcome::UnknownFrame;
        };
        if node.current.as_ref() == Some(document) {
            node.url = url.to_string();
            return CommitOutcome::AlreadyCurrent;
        }
        node.current = Some(document.clone());
        node.pending = None;
        node.url = url.to_string();
        node.fired.clear();
        CommitOutcome::Committed
    }

    /// Fragment or history-API navigation: updates the URL without touching
    /// the generation or lifecycle flags.
    pub fn commit_same_document(&self, frame: &FrameId, url: &str) -> bool {
        match self.frames.lock().get_mut(frame) {
            Some(node) => {
                node.url = url.to_string();
                true
            }
            None => false,
        }
    }

    /// Applies a lifecycle event. Returns true if the event is fresh for the
    /// frame's current generation; stale or duplicate events return false
    /// and leave the flags unchanged.
    pub fn lifecycle_event(
        &self,
        frame: &FrameId,
        document: Option<&DocumentId>,
        event: LifecycleEvent,
    ) -> bool {
        let mut frames = self.frames.lock();
        let Some(node) = frames.get_mut(frame) else {
            return false;
        };
        if let Some(document) = document {
            if node.current.as_ref() != Some(document) {
                return false;
            }
        }
        node.fired.insert(event)
    }

    /// Matches an abort/failure against the pending navigation. Returns true
    /// if a pending navigation (of this generation, when given) was cleared.
    pub fn navigation_aborted(&self, frame: &FrameId, document: Option<&DocumentId>) -> bool {
        let mut frames = self.frames.lock();
        let Some(node) = frames.get_mut(frame) else {
            return false;
        };
        match (&node.pending, document) {
            (Some(pending), Some(document)) if pending != document => false,
            (Some(_), _) => {
                node.pending = None;
                true
            }
            (None, _) => false,
        }
    }

    pub fn contains(&self, frame: &FrameId) -> bool {
        self.frames.lock().contains_key(frame)
    }

    pub fn parent(&self, frame: &FrameId) -> Option<FrameId> {
        self.frames.lock().get(frame)?.parent.clone()
    }

    pub fn url(&self, frame: &FrameId) -> Option<String> {
        self.frames.lock().get(frame).map(|node| node.url.clone())
    }

    pub fn current_document(&self, frame: &FrameId) -> Option<DocumentId> {
        self.frames.lock().get(frame)?.current.clone()
    }

    /// Ids of all known frames, in no particular order.
    pub fn frame_ids(&self) -> Vec<FrameId> {
        self.frames.lock().keys().cloned().collect()
    }

    pub fn has_fired(&self, frame: &FrameId, event: LifecycleEvent) -> bool {
        self.frames
            .lock()
            .get(frame)
            .is_some_and(|node| node.fired.contains(&event))
    }
}

fn collect_subtree(
    frames: &HashMap<FrameId, FrameNode>,
    root: &FrameId,
    out: &mut Vec<FrameId>,
) {
    out.push(root.clone());
    let children: Vec<FrameId> = frames
        .iter()
        .filter(|(_, node)| node.parent.as_ref() == Some(root))
        .map(|(id, _)| id.clone())
        .collect();
    for child in children {
        collect_subtree(frames, &child, out);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    fn id(s: &str) -> Arc<str> {
        Arc::from(s)
    }

    #[test]
    fn detach_removes_descendants_children_first() {
        let tracker = FrameTracker::new();
        let (a, b, c) = (id("A"), id("B"), id("C"));
        assert!(tracker.attach(&a, None));
        assert!(tracker.attach(&b, Some(&a)));
        assert!(tracker.attach(&c, Some(&b)));

        let removed = tracker.detach(&a);
        assert_eq!(removed.last(), Some(&a));
        assert!(removed.iter().position(|f| *f == c) < removed.iter().position(|f| *f == b));
        assert!(!tracker.contains(&b));
        assert!(!tracker.contains(&c));
    }

    #[test]
    fn stale_generation_lifecycle_is_dropped() {
        let tracker = FrameTracker::new();
        let frame = id("F");
        tracker.attach(&frame, None);
        let gen_a = id("loader-a");
        let gen_b = id("loader-b");

        tracker.commit_new_document(&frame, "http://x/a", &gen_a);
        tracker.commit_new_document(&frame, "http://x/b", &gen_b);

        // Event for the superseded generation: dropped, flags unchanged.
        assert!(!tracker.lifecycle_event(&frame, Some(&gen_a), LifecycleEvent::Load));
        assert!(!tracker.has_fired(&frame, LifecycleEvent::Load));

        // Current generation applies exactly once.
        assert!(tracker.lifecycle_event(&frame, Some(&gen_b), LifecycleEvent::Load));
        assert!(!tracker.lifecycle_event(&frame, Some(&gen_b), LifecycleEvent::Load));
    }

    #[test]
    fn replaying_stale_events_is_idempotent() {
        let tracker = FrameTracker::new();
        let frame = id("F");
        tracker.attach(&frame, None);
        let current = id("loader-1");
        let stale = id("loader-0");
        tracker.commit_new_document(&frame, "http://x", &current);
        tracker.lifecycle_event(&frame, Some(&current), LifecycleEvent::DomContentLoaded);

        for _ in 0..3 {
            assert!(!tracker.lifecycle_event(&frame, Some(&stale), LifecycleEvent::Load));
        }
        assert!(tracker.has_fired(&frame, LifecycleEvent::DomContentLoaded));
        assert!(!tracker.has_fired(&frame, LifecycleEvent::Load));
    }

    #[test]
    fn same_document_navigation_keeps_flags() {
        let tracker = FrameTracker::new();
        let frame = id("F");
        tracker.attach(&frame, None);
        let generation = id("loader-1");
        tracker.commit_new_document(&frame, "http://x/", &generation);
        tracker.lifecycle_event(&frame, Some(&generation), LifecycleEvent::Load);

        assert!(tracker.commit_same_document(&frame, "http://x/#anchor"));
        assert_eq!(tracker.url(&frame).unwrap(), "http://x/#anchor");
        assert!(tracker.has_fired(&frame, LifecycleEvent::Load));
        assert_eq!(tracker.current_document(&frame), Some(generation));
    }

    #[test]
    fn superseding_navigation_wins() {
        let tracker = FrameTracker::new();
        let frame = id("F");
        tracker.attach(&frame, None);
        let gen_a = id("nav-a");
        let gen_b = id("nav-b");

        // Second navigation starts before the first commits.
        tracker.navigation_requested(&frame, Some(&gen_a));
        tracker.navigation_requested(&frame, Some(&gen_b));
        assert_eq!(
            tracker.commit_new_document(&frame, "http://x/b", &gen_b),
            CommitOutcome::Committed
        );
        assert_eq!(tracker.url(&frame).unwrap(), "http://x/b");
        // The abandoned generation's lifecycle never applies.
        assert!(!tracker.lifecycle_event(&frame, Some(&gen_a), LifecycleEvent::Load));
    }

    #[test]
    fn abort_matches_pending_generation() {
        let tracker = FrameTracker::new();
        let frame = id("F");
        tracker.attach(&frame, None);
        let generation = id("nav-1");
        tracker.navigation_requested(&frame, Some(&generation));

        let other = id("nav-2");
        assert!(!tracker.navigation_aborted(&frame, Some(&other)));
        assert!(tracker.navigation_aborted(&frame, Some(&generation)));
        assert!(!tracker.navigation_aborted(&frame, Some(&generation)));
    }
}
