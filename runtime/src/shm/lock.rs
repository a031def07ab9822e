use std::{
    hint,
    sync::atomic::{AtomicU32, Ordering},
    thread,
};

/// Spins before yielding the thread while waiting for a [Lock].
const SPINS_BEFORE_YIELD: u32 = 64;

const UNLOCKED: u32 = 0;
const LOCKED: u32 = 1;

/// A mutual exclusion lock stored in a single word of shared memory.
///
/// The lock does not park waiters (there is no cross-process futex here), so critical sections
/// must stay short and must never block or await.
pub struct Lock<'a> {
    word: &'a AtomicU32,
}

impl<'a> Lock<'a> {
    /// Wrap an (initially zero) word as a lock.
    pub fn new(word: &'a AtomicU32) -> Self {
        Self { word }
    }

    /// Acquire the lock, spinning until it is available.
    pub fn lock(&self) -> Guard<'a> {
        let mut spins = 0u32;
        loop {
            if let Some(guard) = self.try_lock() {
                return guard;
            }
            while self.word.load(Ordering::Relaxed) != UNLOCKED {
                if spins < SPINS_BEFORE_YIELD {
                    spins += 1;
                    hint::spin_loop();
                } else {
                    thread::yield_now();
                }
            }
        }
    }

    /// Acquire the lock if it is free.
    pub fn try_lock(&self) -> Option<Guard<'a>> {
        self.word
            .compare_exchange(UNLOCKED, LOCKED, Ordering::Acquire, Ordering::Relaxed)
            .ok()
            .map(|_| Guard { word: self.word })
    }

    /// Returns true if some holder owns the lock.
    pub fn is_locked(&self) -> bool {
        self.word.load(Ordering::Relaxed) != UNLOCKED
    }
}

/// Releases the [Lock] when dropped.
#[must_use = "the lock is released as soon as the guard is dropped"]
pub struct Guard<'a> {
    word: &'a AtomicU32,
}

impl Drop for Guard<'_> {
    fn drop(&mut self) {
        self.word.store(UNLOCKED, Ordering::Release);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::shm::Region;
    use std::sync::Arc;

    #[test]
    fn test_try_lock() {
        let word = AtomicU32::new(0);
        let lock = Lock::new(&word);
        let guard = lock.try_lock().unwrap();
        assert!(lock.is_locked());
        assert!(lock.try_lock().is_none());
        drop(guard);
        assert!(!lock.is_locked());
        let _guard = lock.lock();
    }

    #[test]
    fn test_mutual_exclusion_in_region() {
        const THREADS: usize = 4;
        const ROUNDS: u64 = 10_000;

        let region = Arc::new(Region::anonymous(64).unwrap());
        let mut handles = Vec::new();
        for _ in 0..THREADS {
            let region = region.clone();
            handles.push(thread::spawn(move || {
                let lock = Lock::new(region.atomic_u32(0));
                for _ in 0..ROUNDS {
                    let _guard = lock.lock();
                    // A non-atomic read-modify-write protected by the lock
                    let counter = region.atomic_u64(8);
                    let value = counter.load(Ordering::Relaxed);
                    counter.store(value + 1, Ordering::Relaxed);
                }
            }));
        }
        for handle in handles {
            handle.join().unwrap();
        }
        assert_eq!(
            region.atomic_u64(8).load(Ordering::Relaxed),
            THREADS as u64 * ROUNDS
        );
    }
}
