use std::cell::UnsafeCell;
use std::mem::MaybeUninit;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError};

// ── POSIX counting semaphore ──

/// Thin wrapper over an unnamed POSIX semaphore.
///
/// This exists instead of a Condvar because `sem_post` is async-signal-safe:
/// the producer side of the capture handoff may run inside the host's SIGIO
/// handler.
pub struct Semaphore {
    sem: UnsafeCell<libc::sem_t>,
}

// The semaphore is the synchronization primitive itself.
unsafe impl Send for Semaphore {}
unsafe impl Sync for Semaphore {}

impl Semaphore {
    /// glibc's `sem_t` holds no self-references, so constructing by value and
    /// letting the owning stream pin it on the heap afterwards is sound; no
    /// waiter can exist before the stream is published.
    pub fn new(value: u32) -> Semaphore {
        let mut sem = MaybeUninit::<libc::sem_t>::uninit();
        // pshared = 0: private to this process
        let rc = unsafe { libc::sem_init(sem.as_mut_ptr(), 0, value) };
        assert_eq!(rc, 0, "sem_init failed");
        Semaphore {
            sem: UnsafeCell::new(unsafe { sem.assume_init() }),
        }
    }

    pub fn post(&self) {
        unsafe {
            libc::sem_post(self.sem.get());
        }
    }

    pub fn wait(&self) {
        loop {
            let rc = unsafe { libc::sem_wait(self.sem.get()) };
            if rc == 0 {
                return;
            }
            if unsafe { *libc::__errno_location() } != libc::EINTR {
                return;
            }
        }
    }

    /// Reinitialize to `value`. Caller must guarantee no concurrent waiter or
    /// poster; used only while a stream's write lock excludes the producer
    /// and its worker is joined.
    pub(crate) fn reset(&self, value: u32) {
        unsafe {
            libc::sem_destroy(self.sem.get());
            libc::sem_init(self.sem.get(), 0, value);
        }
    }
}

impl Drop for Semaphore {
    fn drop(&mut self) {
        unsafe {
            libc::sem_destroy(self.sem.get());
        }
    }
}

// ── Raw spinlock ──

/// Test-and-set spinlock for streams opened in async mode.
///
/// A signal handler may fire on a thread that already holds an unrelated
/// blocking mutex, and sleeping inside a handler is unsafe, so async streams
/// spin instead. A handler re-entering the producer path on the very thread
/// that holds this lock would still deadlock; the host library serializes
/// its own calls per device and the engine inherits that assumption.
pub struct SpinLock {
    locked: AtomicBool,
}

impl SpinLock {
    pub const fn new() -> SpinLock {
        SpinLock {
            locked: AtomicBool::new(false),
        }
    }

    pub fn lock(&self) -> SpinGuard<'_> {
        while self
            .locked
            .compare_exchange_weak(false, true, Ordering::Acquire, Ordering::Relaxed)
            .is_err()
        {
            while self.locked.load(Ordering::Relaxed) {
                std::hint::spin_loop();
            }
        }
        SpinGuard { lock: self }
    }
}

pub struct SpinGuard<'a> {
    lock: &'a SpinLock,
}

impl Drop for SpinGuard<'_> {
    fn drop(&mut self) {
        self.lock.locked.store(false, Ordering::Release);
    }
}

// ── Per-mode write lock ──

/// RAII guard over a stream's write path: blocking mutex for ordinary
/// streams, spinlock when the producer can run in signal context. Exactly
/// one of the two is ever used for a given stream's lifetime.
pub struct WriteGuard<'a> {
    _guard: GuardInner<'a>,
}

enum GuardInner<'a> {
    Blocking(MutexGuard<'a, ()>),
    Spinning(SpinGuard<'a>),
}

impl<'a> WriteGuard<'a> {
    pub fn blocking(mutex: &'a Mutex<()>) -> WriteGuard<'a> {
        WriteGuard {
            _guard: GuardInner::Blocking(mutex.lock().unwrap_or_else(PoisonError::into_inner)),
        }
    }

    pub fn spinning(lock: &'a SpinLock) -> WriteGuard<'a> {
        WriteGuard {
            _guard: GuardInner::Spinning(lock.lock()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;
    use std::sync::Arc;
    use std::thread;
    use std::time::Duration;

    #[test]
    fn semaphore_counts_posts() {
        let sem = Semaphore::new(0);
        sem.post();
        sem.post();
        sem.wait();
        sem.wait(); // returns immediately: two credits were posted
    }

    #[test]
    fn semaphore_blocks_until_posted() {
        let sem = Arc::new(Semaphore::new(0));
        let woke = Arc::new(AtomicBool::new(false));
        let handle = {
            let sem = sem.clone();
            let woke = woke.clone();
            thread::spawn(move || {
                sem.wait();
                woke.store(true, Ordering::SeqCst);
            })
        };
        thread::sleep(Duration::from_millis(50));
        assert!(!woke.load(Ordering::SeqCst));
        sem.post();
        handle.join().unwrap();
        assert!(woke.load(Ordering::SeqCst));
    }

    #[test]
    fn semaphore_reset_restores_initial_value() {
        let sem = Semaphore::new(0);
        sem.post();
        sem.post();
        sem.reset(1);
        sem.wait(); // exactly the one reset credit
    }

    #[test]
    fn spinlock_excludes_concurrent_writers() {
        let lock = Arc::new(SpinLock::new());
        let counter = Arc::new(AtomicUsize::new(0));
        let mut handles = Vec::new();
        for _ in 0..4 {
            let lock = lock.clone();
            let counter = counter.clone();
            handles.push(thread::spawn(move || {
                for _ in 0..1000 {
                    let _guard = lock.lock();
                    // non-atomic read-modify-write under the lock
                    let v = counter.load(Ordering::Relaxed);
                    counter.store(v + 1, Ordering::Relaxed);
                }
            }));
        }
        for h in handles {
            h.join().unwrap();
        }
        assert_eq!(counter.load(Ordering::Relaxed), 4000);
    }
}
