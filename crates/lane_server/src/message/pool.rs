//! Reusable object pool backing message envelopes.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Mutex;
use tracing::warn;

/// Capacity used when a pool is configured with a size of zero.
pub const DEFAULT_POOL_SIZE: usize = 100;

type Generator<T> = Box<dyn Fn() -> T + Send + Sync>;
type Releaser<T> = Box<dyn Fn(&mut T) + Send + Sync>;

/// A bounded free list of reusable values.
///
/// `get` never blocks: when the free list is empty a fresh value is built by
/// the generator and the shortfall is logged. `release` resets the value and
/// keeps it only while the free list is below its configured size.
pub struct Pool<T> {
    free: Mutex<Vec<T>>,
    size: usize,
    generator: Generator<T>,
    releaser: Releaser<T>,
    closed: AtomicBool,
    overflow: AtomicU64,
}

impl<T> Pool<T> {
    /// Creates a pool pre-filled with `size` values.
    pub fn new(
        size: usize,
        generator: impl Fn() -> T + Send + Sync + 'static,
        releaser: impl Fn(&mut T) + Send + Sync + 'static,
    ) -> Self {
        let size = if size == 0 { DEFAULT_POOL_SIZE } else { size };
        let free = (0..size).map(|_| generator()).collect();
        Self {
            free: Mutex::new(free),
            size,
            generator: Box::new(generator),
            releaser: Box::new(releaser),
            closed: AtomicBool::new(false),
            overflow: AtomicU64::new(0),
        }
    }

    /// Takes a value from the free list, allocating one if it is empty.
    pub fn get(&self) -> T {
        let reused = self.free.lock().unwrap_or_else(|e| e.into_inner()).pop();
        match reused {
            Some(item) => item,
            None => {
                let overflow = self.overflow.fetch_add(1, Ordering::Relaxed) + 1;
                if overflow == 1 || overflow % 1024 == 0 {
                    warn!(
                        size = self.size,
                        overflow,
                        "pool exhausted, allocating beyond configured size"
                    );
                }
                (self.generator)()
            }
        }
    }

    /// Resets `item` and returns it to the free list.
    pub fn release(&self, mut item: T) {
        (self.releaser)(&mut item);
        if self.closed.load(Ordering::Acquire) {
            return;
        }
        let mut free = self.free.lock().unwrap_or_else(|e| e.into_inner());
        if free.len() < self.size {
            free.push(item);
        }
    }

    /// Drains the free list. Later releases are dropped instead of kept.
    pub fn close(&self) {
        self.closed.store(true, Ordering::Release);
        self.free.lock().unwrap_or_else(|e| e.into_inner()).clear();
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Values currently waiting on the free list.
    pub fn available(&self) -> usize {
        self.free.lock().unwrap_or_else(|e| e.into_inner()).len()
    }

    pub fn size(&self) -> usize {
        self.size
    }

    /// Number of `get` calls that had to allocate.
    pub fn overflow_count(&self) -> u64 {
        self.overflow.load(Ordering::Relaxed)
    }
}
