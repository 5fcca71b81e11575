//! Counted ownership for metas and mappings
//!
//! A count reaching zero is terminal: [`RefCount::get_unless_zero`] refuses
//! to revive it, so a lookup racing with the final [`RefCount::put`] sees the
//! record as already gone.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

/// Atomic reference count
#[derive(Debug)]
pub(crate) struct RefCount(AtomicUsize);

impl RefCount {
    pub(crate) fn new(count: usize) -> Self {
        Self(AtomicUsize::new(count))
    }

    /// Take a reference. The caller must already own one.
    pub(crate) fn get(&self) {
        let old = self.0.fetch_add(1, Ordering::SeqCst);
        debug_assert!(old > 0, "get on a dead refcount");
    }

    /// Take a reference unless the count already reached zero
    pub(crate) fn get_unless_zero(&self) -> bool {
        self.0
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| {
                (n != 0).then(|| n + 1)
            })
            .is_ok()
    }

    /// Drop a reference, running `destroy` if it was the last one.
    ///
    /// Returns whether the count reached zero.
    pub(crate) fn put(&self, destroy: impl FnOnce()) -> bool {
        let old = self.0.fetch_sub(1, Ordering::SeqCst);
        debug_assert!(old > 0, "refcount underflow");
        if old == 1 {
            destroy();
            true
        } else {
            false
        }
    }

    /// Drop a reference without tearing anything down. A `true` return hands
    /// the teardown to the caller.
    pub(crate) fn put_noop(&self) -> bool {
        self.put(|| {})
    }

    /// Current count
    pub(crate) fn load(&self) -> usize {
        self.0.load(Ordering::SeqCst)
    }
}

/// Marks one counted reference as held by a structural owner, so it is
/// released at most once no matter how many paths race to release it.
#[derive(Debug)]
pub(crate) struct Hold(AtomicBool);

impl Hold {
    pub(crate) fn new(held: bool) -> Self {
        Self(AtomicBool::new(held))
    }

    /// Claim the held reference for release. Only one caller gets `true`.
    pub(crate) fn take(&self) -> bool {
        self.0.swap(false, Ordering::SeqCst)
    }

    /// Mark a reference the caller already owns as held. Returns `false`
    /// if it was held already, in which case the caller keeps its reference.
    pub(crate) fn set(&self) -> bool {
        !self.0.swap(true, Ordering::SeqCst)
    }

    pub(crate) fn is_held(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::Cell;

    #[test]
    fn test_put_runs_destroy_once() {
        let refs = RefCount::new(2);
        let runs = Cell::new(0);
        assert!(!refs.put(|| runs.set(runs.get() + 1)));
        assert!(refs.put(|| runs.set(runs.get() + 1)));
        assert_eq!(runs.get(), 1);
        assert_eq!(refs.load(), 0);
    }

    #[test]
    fn test_dead_count_is_not_revived() {
        let refs = RefCount::new(1);
        assert!(refs.get_unless_zero());
        assert_eq!(refs.load(), 2);
        refs.put_noop();
        assert!(refs.put_noop());
        assert!(!refs.get_unless_zero());
        assert_eq!(refs.load(), 0);
    }

    #[test]
    fn test_hold_releases_once() {
        let hold = Hold::new(true);
        assert!(hold.is_held());
        assert!(hold.take());
        assert!(!hold.take());
        assert!(hold.set());
        assert!(!hold.set());
    }

    #[test]
    fn test_concurrent_get_put() {
        let refs = RefCount::new(1);
        std::thread::scope(|s| {
            for _ in 0..8 {
                s.spawn(|| {
                    for _ in 0..1000 {
                        refs.get();
                        assert!(!refs.put_noop());
                    }
                });
            }
        });
        assert_eq!(refs.load(), 1);
    }
}
