use std::ops::{Deref, DerefMut};

use super::{Handle, ObjectPool, PoolObject};

/// An open iteration over the used list of an [`ObjectPool`].
///
/// Opening a scope bumps the pool's loop depth and snapshots the used list.
/// While any scope is open, [`ObjectPool::release`] and
/// [`ObjectPool::activate`] only queue their work. Dropping the outermost
/// scope (depth back to 0) flushes both queues.
///
/// The scope derefs to the pool, so the loop body keeps full access to it,
/// including opening nested scopes:
///
/// ```ignore
/// let mut scope = pool.begin_loop();
/// while let Some(handle) = scope.next_in_game() {
///     let mut inner = scope.begin_loop();
///     inner.release(handle); // deferred until `scope` is dropped
/// }
/// ```
pub struct LoopScope<'a, T: PoolObject> {
    pool: &'a mut ObjectPool<T>,
    depth_at_entry: usize,
    snapshot: Vec<Handle>,
    cursor: usize,
}

impl<'a, T: PoolObject> LoopScope<'a, T> {
    pub(super) fn new(pool: &'a mut ObjectPool<T>) -> Self {
        let depth_at_entry = pool.loop_depth;
        pool.loop_depth += 1;
        let snapshot = pool.used.iter().collect();

        LoopScope {
            pool,
            depth_at_entry,
            snapshot,
            cursor: 0,
        }
    }

    /// The used list as it was when the scope opened.
    pub fn snapshot(&self) -> &[Handle] {
        &self.snapshot
    }

    /// Advances through the snapshot, skipping slots that are not in game.
    ///
    /// Slots queued for termination earlier in this loop are skipped, and so
    /// are slots whose activation is still pending.
    pub fn next_in_game(&mut self) -> Option<Handle> {
        while self.cursor < self.snapshot.len() {
            let handle = self.snapshot[self.cursor];
            self.cursor += 1;
            if self.pool.is_in_game(handle) {
                return Some(handle);
            }
        }
        None
    }

    /// Closes the scope. Equivalent to dropping it.
    pub fn end(self) {}
}

impl<T: PoolObject> Deref for LoopScope<'_, T> {
    type Target = ObjectPool<T>;

    fn deref(&self) -> &Self::Target {
        self.pool
    }
}

impl<T: PoolObject> DerefMut for LoopScope<'_, T> {
    fn deref_mut(&mut self) -> &mut Self::Target {
        self.pool
    }
}

impl<T: PoolObject> Drop for LoopScope<'_, T> {
    fn drop(&mut self) {
        self.pool.loop_depth -= 1;
        debug_assert_eq!(
            self.pool.loop_depth, self.depth_at_entry,
            "{} loop scopes closed out of order",
            self.pool.name()
        );

        if self.pool.loop_depth == 0 {
            self.pool.flush_pending();
        }
    }
}
