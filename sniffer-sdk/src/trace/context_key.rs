use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};

/// Identity of an execution context: the unit whose spans form one
/// segment.
///
/// Threaded code keys by thread with [`ContextKey::current_thread`].
/// Event-loop runtimes that multiplex many tasks on one thread key by task
/// with [`ContextKey::new`]. Thread keys live in the upper half of the `u64`
/// space, so they never collide with task keys below `2^63`.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ContextKey(u64);

const THREAD_KEY_BASE: u64 = 1 << 63;

static NEXT_THREAD_KEY: AtomicU64 = AtomicU64::new(THREAD_KEY_BASE);

thread_local! {
    static THREAD_KEY: ContextKey = ContextKey(NEXT_THREAD_KEY.fetch_add(1, Ordering::Relaxed));
}

impl ContextKey {
    /// Key of a caller-managed context, such as an async task.
    pub const fn new(id: u64) -> Self {
        ContextKey(id)
    }

    /// Key of the calling thread. Stable for the lifetime of the thread.
    pub fn current_thread() -> Self {
        THREAD_KEY.with(|key| *key)
    }

    /// The raw value of the key.
    pub const fn as_u64(self) -> u64 {
        self.0
    }

    /// Spreads keys over `buckets`. Consecutive keys land in different
    /// buckets.
    pub(crate) fn bucket(self, buckets: usize) -> usize {
        // Fibonacci hashing
        let mixed = self.0.wrapping_mul(0x9E37_79B9_7F4A_7C15);
        ((mixed >> 32) as usize) % buckets.max(1)
    }
}

impl fmt::Debug for ContextKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.0 >= THREAD_KEY_BASE {
            write!(f, "ContextKey(thread:{})", self.0 - THREAD_KEY_BASE)
        } else {
            write!(f, "ContextKey({})", self.0)
        }
    }
}
