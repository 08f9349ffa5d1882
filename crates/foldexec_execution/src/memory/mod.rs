//! Hierarchical memory scopes.
//!
//! Arenas form a tree; resetting a parent cascades into its children. A reset
//! bumps the arena generation (invalidating ownership tags held by values
//! that lived in the scope) and fires any registered shutdown callbacks.
//! Callbacks run on reset, not on drop, matching the contract that error
//! unwinds skip them.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use parking_lot::Mutex;

static NEXT_ARENA_ID: AtomicU64 = AtomicU64::new(1);

pub type ArenaId = u64;

/// Identifies one lifetime of one arena.
///
/// Two scopes compare equal only if they name the same arena _and_ the arena
/// has not been reset in between. Transition values record the scope they
/// were allocated under; a matching scope is what permits in-place reuse.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ArenaScope {
    pub arena: ArenaId,
    pub generation: u64,
}

struct ArenaInner {
    id: ArenaId,
    name: &'static str,
    generation: AtomicU64,
    children: Mutex<Vec<Weak<ArenaInner>>>,
    callbacks: Mutex<Vec<Box<dyn FnOnce() + Send>>>,
}

impl std::fmt::Debug for ArenaInner {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ArenaInner")
            .field("id", &self.id)
            .field("name", &self.name)
            .field("generation", &self.generation)
            .finish_non_exhaustive()
    }
}

/// Handle to a memory scope. Cloning the handle shares the scope.
#[derive(Debug, Clone)]
pub struct MemoryArena {
    inner: Arc<ArenaInner>,
}

impl MemoryArena {
    pub fn new_root(name: &'static str) -> Self {
        MemoryArena {
            inner: Arc::new(ArenaInner {
                id: NEXT_ARENA_ID.fetch_add(1, Ordering::Relaxed),
                name,
                generation: AtomicU64::new(0),
                children: Mutex::new(Vec::new()),
                callbacks: Mutex::new(Vec::new()),
            }),
        }
    }

    /// Create a child scope. Resetting self resets the child too.
    pub fn new_child(&self, name: &'static str) -> Self {
        let child = MemoryArena {
            inner: Arc::new(ArenaInner {
                id: NEXT_ARENA_ID.fetch_add(1, Ordering::Relaxed),
                name,
                generation: AtomicU64::new(0),
                children: Mutex::new(Vec::new()),
                callbacks: Mutex::new(Vec::new()),
            }),
        };
        self.inner
            .children
            .lock()
            .push(Arc::downgrade(&child.inner));
        child
    }

    pub fn id(&self) -> ArenaId {
        self.inner.id
    }

    pub fn name(&self) -> &'static str {
        self.inner.name
    }

    /// Scope tag for values allocated under the current generation.
    pub fn scope(&self) -> ArenaScope {
        ArenaScope {
            arena: self.inner.id,
            generation: self.inner.generation.load(Ordering::Relaxed),
        }
    }

    /// Whether a previously recorded scope still names this arena's current
    /// generation.
    pub fn owns(&self, scope: ArenaScope) -> bool {
        scope.arena == self.inner.id
            && scope.generation == self.inner.generation.load(Ordering::Relaxed)
    }

    /// Register a callback to run the next time this scope is reset.
    pub fn register_callback(&self, callback: impl FnOnce() + Send + 'static) {
        self.inner.callbacks.lock().push(Box::new(callback));
    }

    pub fn pending_callbacks(&self) -> usize {
        self.inner.callbacks.lock().len()
    }

    /// Reset the scope: fire callbacks, invalidate outstanding scope tags,
    /// and cascade into children.
    pub fn reset(&self) {
        let callbacks = std::mem::take(&mut *self.inner.callbacks.lock());
        for callback in callbacks {
            callback();
        }

        self.inner.generation.fetch_add(1, Ordering::Relaxed);

        let mut children = self.inner.children.lock();
        children.retain(|child| match child.upgrade() {
            Some(child) => {
                MemoryArena { inner: child }.reset();
                true
            }
            None => false,
        });
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::AtomicUsize;

    use super::*;

    #[test]
    fn reset_invalidates_scope() {
        let arena = MemoryArena::new_root("test");
        let scope = arena.scope();
        assert!(arena.owns(scope));
        arena.reset();
        assert!(!arena.owns(scope));
        assert!(arena.owns(arena.scope()));
    }

    #[test]
    fn reset_cascades_to_children() {
        let parent = MemoryArena::new_root("parent");
        let child = parent.new_child("child");
        let scope = child.scope();
        parent.reset();
        assert!(!child.owns(scope));
    }

    #[test]
    fn callbacks_fire_once_per_registration() {
        let arena = MemoryArena::new_root("cb");
        let fired = Arc::new(AtomicUsize::new(0));

        let fired2 = fired.clone();
        arena.register_callback(move || {
            fired2.fetch_add(1, Ordering::Relaxed);
        });

        arena.reset();
        arena.reset();
        assert_eq!(1, fired.load(Ordering::Relaxed));
    }

    #[test]
    fn sibling_scopes_are_distinct() {
        let parent = MemoryArena::new_root("parent");
        let a = parent.new_child("a");
        let b = parent.new_child("b");
        assert!(!a.owns(b.scope()));
    }
}
