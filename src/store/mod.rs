mod log_writer;

pub use log_writer::LocalLogWriter;

use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use log::{debug, error};
use tokio::sync::{mpsc, Mutex as AsyncMutex};
use tokio::time::{self, Duration};

use crate::models::Reading;

/// Shared state between the device poll loop, the upload loop and the query
/// interface: a bounded cache of recent readings plus the queue of readings
/// waiting for upload.
pub struct ReadingStore {
    inner: Arc<StoreInner>,
}

struct StoreInner {
    cache: Mutex<VecDeque<Reading>>,
    capacity: usize,
    pending_tx: mpsc::UnboundedSender<Reading>,
    pending_rx: AsyncMutex<mpsc::UnboundedReceiver<Reading>>,
    pending_len: AtomicUsize,
}

impl ReadingStore {
    pub fn new(capacity: usize) -> Self {
        let (pending_tx, pending_rx) = mpsc::unbounded_channel();
        Self {
            inner: Arc::new(StoreInner {
                cache: Mutex::new(VecDeque::with_capacity(capacity)),
                capacity,
                pending_tx,
                pending_rx: AsyncMutex::new(pending_rx),
                pending_len: AtomicUsize::new(0),
            }),
        }
    }

    pub fn capacity(&self) -> usize {
        self.inner.capacity
    }

    /// Adds a reading to the cache and the upload queue.
    ///
    /// The queue send happens under the cache lock, so a snapshot never
    /// contains a reading that is not also queued.
    pub fn record(&self, reading: Reading) {
        let mut cache = self.lock_cache();

        debug!("recording reading {} ({})", reading.id, reading.weight);
        self.inner.pending_len.fetch_add(1, Ordering::SeqCst);
        if let Err(err) = self.inner.pending_tx.send(reading.clone()) {
            self.inner.pending_len.fetch_sub(1, Ordering::SeqCst);
            error!("upload queue closed, reading {} not queued", err.0.id);
        }

        cache.push_back(reading);
        while cache.len() > self.inner.capacity {
            cache.pop_front();
        }
    }

    pub fn snapshot(&self) -> Vec<Reading> {
        self.lock_cache().iter().cloned().collect()
    }

    /// Readings that arrived after `since_id`. An unknown or evicted cursor
    /// yields the whole snapshot.
    pub fn snapshot_since(&self, since_id: &str) -> Vec<Reading> {
        let mut readings = self.snapshot();
        match readings.iter().rposition(|reading| reading.id == since_id) {
            Some(index) => readings.split_off(index + 1),
            None => {
                debug!(
                    "cursor {since_id} not in cache, returning all {} readings",
                    readings.len()
                );
                readings
            }
        }
    }

    /// Pulls up to `max_count` queued readings, waiting at most `max_wait`
    /// for each one. Returns early once the queue goes quiet.
    pub async fn dequeue_batch(&self, max_count: usize, max_wait: Duration) -> Vec<Reading> {
        let mut batch = Vec::new();
        if max_count == 0 {
            return batch;
        }

        let mut pending = self.inner.pending_rx.lock().await;
        while batch.len() < max_count {
            match time::timeout(max_wait, pending.recv()).await {
                Ok(Some(reading)) => batch.push(reading),
                Ok(None) | Err(_) => break,
            }
        }

        self.inner.pending_len.fetch_sub(batch.len(), Ordering::SeqCst);
        batch
    }

    pub fn cached_len(&self) -> usize {
        self.lock_cache().len()
    }

    pub fn pending_len(&self) -> usize {
        self.inner.pending_len.load(Ordering::SeqCst)
    }

    fn lock_cache(&self) -> MutexGuard<'_, VecDeque<Reading>> {
        match self.inner.cache.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}

impl Clone for ReadingStore {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}
