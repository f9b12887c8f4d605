//! Fair reader-writer lock guarding one path on a storage server.
//!
//! Three primitives make up the lock:
//!   - `admission`: FIFO mutex every acquirer (reader or writer) passes
//!     through, so entry order between readers and writers is serialized
//!   - `reader_count`: number of readers currently holding the lock, behind
//!     its own small mutex
//!   - `write_gate`: one-permit semaphore held either by the writer or, on
//!     behalf of a whole batch of readers, from the moment the first reader
//!     of the batch enters until the last one leaves
//!
//! A writer holds `admission` while it waits for `write_gate`, so readers
//! arriving after it queue up behind it instead of extending the current
//! reader batch indefinitely.

use std::sync::{Mutex, MutexGuard, PoisonError};

use crate::utils::NetFsError;

use tokio::sync::{Mutex as AsyncMutex, Semaphore};

/// Per-path fair reader-writer lock.
#[derive(Debug)]
pub struct FairRwLock {
    admission: AsyncMutex<()>,
    reader_count: Mutex<usize>,
    write_gate: Semaphore,
}

impl Default for FairRwLock {
    fn default() -> Self {
        Self::new()
    }
}

impl FairRwLock {
    /// Creates a new unlocked lock.
    pub fn new() -> Self {
        FairRwLock {
            admission: AsyncMutex::new(()),
            reader_count: Mutex::new(0),
            write_gate: Semaphore::new(1),
        }
    }

    fn count(&self) -> MutexGuard<'_, usize> {
        // the count is a plain integer, a panicked holder cannot leave it
        // half-updated
        self.reader_count
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    /// Number of readers currently holding the lock.
    pub fn reader_count(&self) -> usize {
        *self.count()
    }

    /// Acquires the lock in shared mode. The returned guard releases it when
    /// dropped.
    ///
    /// Cancellation safe: dropping the future before it resolves leaves the
    /// lock state untouched.
    pub async fn acquire_read(&self) -> Result<ReadGuard<'_>, NetFsError> {
        let _admission = self.admission.lock().await;
        {
            let mut count = self.count();
            if *count > 0 {
                // join the batch already holding the gate
                *count += 1;
                return Ok(ReadGuard { lock: self });
            }
        }

        // first reader of a batch; no other reader can be inside while we
        // hold admission and the count is zero
        self.write_gate.acquire().await?.forget();
        *self.count() += 1;
        Ok(ReadGuard { lock: self })
    }

    /// Releases one shared hold; the last reader out opens the write gate.
    fn release_read(&self) {
        let mut count = self.count();
        debug_assert!(*count > 0);
        *count -= 1;
        if *count == 0 {
            self.write_gate.add_permits(1);
        }
    }

    /// Acquires the lock in exclusive mode. The returned guard releases it
    /// when dropped.
    ///
    /// Cancellation safe: dropping the future before it resolves leaves the
    /// lock state untouched.
    pub async fn acquire_write(&self) -> Result<WriteGuard<'_>, NetFsError> {
        let _admission = self.admission.lock().await;
        self.write_gate.acquire().await?.forget();
        Ok(WriteGuard { lock: self })
    }

    fn release_write(&self) {
        self.write_gate.add_permits(1);
    }
}

/// Shared hold on a `FairRwLock`.
#[derive(Debug)]
pub struct ReadGuard<'a> {
    lock: &'a FairRwLock,
}

impl ReadGuard<'_> {
    /// Releases the hold now instead of at end of scope.
    pub fn release(self) {}
}

impl Drop for ReadGuard<'_> {
    fn drop(&mut self) {
        self.lock.release_read();
    }
}

/// Exclusive hold on a `FairRwLock`.
#[derive(Debug)]
pub struct WriteGuard<'a> {
    lock: &'a FairRwLock,
}

impl WriteGuard<'_> {
    /// Releases the hold now instead of at end of scope.
    pub fn release(self) {}
}

impl Drop for WriteGuard<'_> {
    fn drop(&mut self) {
        self.lock.release_write();
    }
}

#[cfg(test)]
mod rwlock_tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;
    use tokio::time::{self, Duration};

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn readers_share() -> Result<(), NetFsError> {
        let lock = FairRwLock::new();
        let r1 = lock.acquire_read().await?;
        let r2 = lock.acquire_read().await?;
        assert_eq!(lock.reader_count(), 2);
        r1.release();
        assert_eq!(lock.reader_count(), 1);
        drop(r2);
        assert_eq!(lock.reader_count(), 0);
        let _w = lock.acquire_write().await?;
        Ok(())
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn writer_blocks_reader() -> Result<(), NetFsError> {
        let lock = Arc::new(FairRwLock::new());
        let w = lock.acquire_write().await?;
        let lock2 = lock.clone();
        let reader = tokio::spawn(async move {
            let _r = lock2.acquire_read().await?;
            Ok::<(), NetFsError>(())
        });
        time::sleep(Duration::from_millis(50)).await;
        assert!(!reader.is_finished());
        w.release();
        reader.await??;
        assert_eq!(lock.reader_count(), 0);
        Ok(())
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn mutual_exclusion() -> Result<(), NetFsError> {
        let lock = Arc::new(FairRwLock::new());
        let readers = Arc::new(AtomicUsize::new(0));
        let writers = Arc::new(AtomicUsize::new(0));

        let mut tasks = Vec::new();
        for i in 0..12 {
            let (lock, readers, writers) =
                (lock.clone(), readers.clone(), writers.clone());
            tasks.push(tokio::spawn(async move {
                for _ in 0..50 {
                    if i % 3 == 0 {
                        let _w = lock.acquire_write().await?;
                        assert_eq!(writers.fetch_add(1, Ordering::SeqCst), 0);
                        assert_eq!(readers.load(Ordering::SeqCst), 0);
                        tokio::task::yield_now().await;
                        writers.fetch_sub(1, Ordering::SeqCst);
                    } else {
                        let _r = lock.acquire_read().await?;
                        readers.fetch_add(1, Ordering::SeqCst);
                        assert_eq!(writers.load(Ordering::SeqCst), 0);
                        tokio::task::yield_now().await;
                        readers.fetch_sub(1, Ordering::SeqCst);
                    }
                }
                Ok::<(), NetFsError>(())
            }));
        }
        for task in tasks {
            task.await??;
        }
        assert_eq!(lock.reader_count(), 0);
        Ok(())
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn waiting_writer_beats_later_reader() -> Result<(), NetFsError> {
        let lock = Arc::new(FairRwLock::new());
        let order = Arc::new(Mutex::new(Vec::new()));

        // an admitted reader batch holds the gate
        let r1 = lock.acquire_read().await?;

        let (lock_w, order_w) = (lock.clone(), order.clone());
        let writer = tokio::spawn(async move {
            let _w = lock_w.acquire_write().await?;
            order_w.lock().unwrap().push("writer");
            Ok::<(), NetFsError>(())
        });
        time::sleep(Duration::from_millis(50)).await;

        // a reader arriving after the writer queues behind it
        let (lock_r, order_r) = (lock.clone(), order.clone());
        let reader = tokio::spawn(async move {
            let _r = lock_r.acquire_read().await?;
            order_r.lock().unwrap().push("reader");
            Ok::<(), NetFsError>(())
        });
        time::sleep(Duration::from_millis(50)).await;
        assert!(order.lock().unwrap().is_empty());

        r1.release();
        writer.await??;
        reader.await??;
        assert_eq!(*order.lock().unwrap(), vec!["writer", "reader"]);
        Ok(())
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn cancelled_acquire_leaves_lock_clean() -> Result<(), NetFsError> {
        let lock = FairRwLock::new();
        let w = lock.acquire_write().await?;
        assert!(time::timeout(Duration::from_millis(20), lock.acquire_read())
            .await
            .is_err());
        w.release();
        assert_eq!(lock.reader_count(), 0);
        let _w = lock.acquire_write().await?;
        Ok(())
    }
}
