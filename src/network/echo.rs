//! Echo Suppression
//!
//! The client keeps a local render snapshot that mirrors the replicated
//! maps. Mirroring a remote update is itself a local change, and a naive
//! change reaction would publish it straight back to the document. The
//! guard marks the mirroring scope so reactions can tell the two apart.
//!
//! The guard is owned by one sync subsystem instance and handed down the
//! call chain; there is no process-wide flag.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use crate::game::state::TableMaps;

/// Where a state change came from.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum UpdateOrigin {
    /// Produced by this client.
    Local,
    /// Mirrored from the replicated document.
    Remote,
}

/// Whether a change reaction should publish.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PublishDecision {
    /// Write the change to the replicated document.
    Publish,
    /// The change is an echo; do nothing.
    Skip,
}

/// Re-entrancy marker for remote-update scopes.
///
/// Clones share state. Nested scopes are counted.
#[derive(Clone, Debug, Default)]
pub struct EchoGuard {
    depth: Arc<AtomicUsize>,
}

/// RAII scope returned by [`EchoGuard::enter`]. Clears on drop, including
/// during unwinding.
#[must_use = "the guard is released as soon as the scope is dropped"]
#[derive(Debug)]
pub struct GuardScope {
    depth: Arc<AtomicUsize>,
}

impl Drop for GuardScope {
    fn drop(&mut self) {
        self.depth.fetch_sub(1, Ordering::SeqCst);
    }
}

impl EchoGuard {
    /// Create an inactive guard.
    pub fn new() -> Self {
        Self::default()
    }

    /// Is a remote-update scope open?
    pub fn is_active(&self) -> bool {
        self.depth.load(Ordering::SeqCst) > 0
    }

    /// Open a scope.
    pub fn enter(&self) -> GuardScope {
        self.depth.fetch_add(1, Ordering::SeqCst);
        GuardScope {
            depth: Arc::clone(&self.depth),
        }
    }

    /// Run `f` with the guard set.
    pub fn with_guard<T>(&self, f: impl FnOnce() -> T) -> T {
        let _scope = self.enter();
        f()
    }

    /// Decide whether a change reaction should publish.
    pub fn decide(&self, origin: UpdateOrigin) -> PublishDecision {
        if origin == UpdateOrigin::Remote || self.is_active() {
            PublishDecision::Skip
        } else {
            PublishDecision::Publish
        }
    }
}

// =============================================================================
// LOCAL MIRROR
// =============================================================================

/// The client's render snapshot of the table.
#[derive(Debug, Default)]
pub struct LocalMirror {
    view: TableMaps,
    guard: EchoGuard,
    published: usize,
    skipped: usize,
}

impl LocalMirror {
    /// Create an empty mirror sharing `guard`.
    pub fn new(guard: EchoGuard) -> Self {
        Self {
            guard,
            ..Default::default()
        }
    }

    /// Current snapshot.
    pub fn view(&self) -> &TableMaps {
        &self.view
    }

    /// Guard in use.
    pub fn guard(&self) -> &EchoGuard {
        &self.guard
    }

    /// Changes that were published.
    pub fn published(&self) -> usize {
        self.published
    }

    /// Changes suppressed as echoes.
    pub fn skipped(&self) -> usize {
        self.skipped
    }

    fn react(&mut self, origin: UpdateOrigin) -> PublishDecision {
        let decision = self.guard.decide(origin);
        match decision {
            PublishDecision::Publish => self.published += 1,
            PublishDecision::Skip => self.skipped += 1,
        }
        decision
    }

    /// Mirror the replicated maps. Never publishes.
    pub fn mirror_remote(&mut self, maps: &TableMaps) -> PublishDecision {
        let guard = self.guard.clone();
        guard.with_guard(|| {
            self.view = maps.clone();
            // The change reaction still fires; the guard turns it into a no-op
            self.react(UpdateOrigin::Local)
        })
    }

    /// Apply a local edit to the snapshot and report whether to publish it.
    pub fn apply_local(&mut self, edit: impl FnOnce(&mut TableMaps)) -> PublishDecision {
        edit(&mut self.view);
        self.react(UpdateOrigin::Local)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::game::mutators;
    use crate::game::state::tests::sample_table;
    use std::panic::{catch_unwind, AssertUnwindSafe};

    #[test]
    fn test_guard_scoping() {
        let guard = EchoGuard::new();
        assert!(!guard.is_active());

        let seen = guard.with_guard(|| guard.is_active());
        assert!(seen);
        assert!(!guard.is_active());
    }

    #[test]
    fn test_nested_scopes() {
        let guard = EchoGuard::new();
        let outer = guard.enter();
        {
            let _inner = guard.enter();
            assert!(guard.is_active());
        }
        assert!(guard.is_active());
        drop(outer);
        assert!(!guard.is_active());
    }

    #[test]
    fn test_guard_clears_on_panic() {
        let guard = EchoGuard::new();
        let result = catch_unwind(AssertUnwindSafe(|| {
            guard.with_guard(|| panic!("mirror failed"));
        }));
        assert!(result.is_err());
        assert!(!guard.is_active());
    }

    #[test]
    fn test_guards_are_independent() {
        let a = EchoGuard::new();
        let b = EchoGuard::new();
        let _scope = a.enter();
        assert_eq!(a.decide(UpdateOrigin::Local), PublishDecision::Skip);
        assert_eq!(b.decide(UpdateOrigin::Local), PublishDecision::Publish);
        assert_eq!(b.decide(UpdateOrigin::Remote), PublishDecision::Skip);
    }

    #[test]
    fn test_mirror_does_not_echo() {
        let mut mirror = LocalMirror::new(EchoGuard::new());
        let maps = sample_table();

        assert_eq!(mirror.mirror_remote(&maps), PublishDecision::Skip);
        assert_eq!(mirror.view(), &maps);
        assert_eq!(mirror.published(), 0);

        let decision = mirror.apply_local(|view| {
            mutators::tap_card(view, &"b1".into(), true);
        });
        assert_eq!(decision, PublishDecision::Publish);
        assert_eq!(mirror.published(), 1);
        assert_eq!(mirror.skipped(), 1);
        assert!(!mirror.guard().is_active());
    }
}
