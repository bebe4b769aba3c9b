use std::{ops::ControlFlow, panic::AssertUnwindSafe, sync::Arc};

use anyhow::Result;
use futures::FutureExt;
use log::{error, info, warn};
use tokio::time::{self, Duration, Instant};
use tokio_util::sync::CancellationToken;

use crate::models::Reading;
use crate::store::ReadingStore;
use crate::utils::describe_panic;

use super::sink::{encode_record, BatchSink, MAX_SINK_RECORDS};

#[derive(Debug, Clone)]
pub struct UploadConfig {
    pub batch_size: usize,
    pub flush_interval: Duration,
    /// Per-item wait while topping up the batch from the queue.
    pub drain_wait: Duration,
    pub failure_cooldown: Duration,
    pub idle_delay: Duration,
}

impl Default for UploadConfig {
    fn default() -> Self {
        Self {
            batch_size: MAX_SINK_RECORDS,
            flush_interval: Duration::from_secs(60),
            drain_wait: Duration::from_millis(100),
            failure_cooldown: Duration::from_secs(2),
            idle_delay: Duration::from_millis(500),
        }
    }
}

/// Drains the pending queue into batches and ships them to the sink.
///
/// A batch goes out once it is full or `flush_interval` has passed since the
/// last attempt. Failed batches are kept and retried. A panicking iteration is
/// logged and treated like a failed upload. Once cancelled, whatever is still
/// batched or queued gets one final upload attempt.
pub async fn upload_loop(
    store: ReadingStore,
    sink: Arc<dyn BatchSink>,
    config: UploadConfig,
    cancel_token: CancellationToken,
) {
    info!(
        "upload loop started (batch size {}, interval {}s)",
        config.batch_size,
        config.flush_interval.as_secs()
    );

    let mut uploader = BatchUploader::new(store, sink, config);
    uploader.run(&cancel_token).await;

    if let Err(panic) = AssertUnwindSafe(uploader.final_flush())
        .catch_unwind()
        .await
    {
        error!("final upload panicked: {}", describe_panic(panic.as_ref()));
    }
    info!("upload loop stopped");
}

struct BatchUploader {
    store: ReadingStore,
    sink: Arc<dyn BatchSink>,
    config: UploadConfig,
    batch: Vec<Reading>,
    last_flush: Instant,
}

impl BatchUploader {
    fn new(store: ReadingStore, sink: Arc<dyn BatchSink>, config: UploadConfig) -> Self {
        Self {
            store,
            sink,
            batch: Vec::with_capacity(config.batch_size.min(MAX_SINK_RECORDS)),
            config,
            last_flush: Instant::now(),
        }
    }

    async fn run(&mut self, cancel_token: &CancellationToken) {
        while !cancel_token.is_cancelled() {
            let outcome = AssertUnwindSafe(self.step(cancel_token))
                .catch_unwind()
                .await;
            match outcome {
                Ok(ControlFlow::Continue(())) => {}
                Ok(ControlFlow::Break(())) => break,
                Err(panic) => {
                    error!(
                        "upload iteration panicked, keeping {} records: {}",
                        self.batch.len(),
                        describe_panic(panic.as_ref())
                    );
                    self.last_flush = Instant::now();
                    if wait_or_cancel(self.config.failure_cooldown, cancel_token).await {
                        break;
                    }
                }
            }
        }
    }

    async fn step(&mut self, cancel_token: &CancellationToken) -> ControlFlow<()> {
        self.fill().await;

        if !self.flush_due() {
            return pause(self.config.idle_delay, cancel_token).await;
        }

        let result = self.flush().await;
        // Reset on failure too, so a dead sink is not hammered.
        self.last_flush = Instant::now();
        if let Err(err) = result {
            warn!(
                "upload failed, keeping {} records for retry: {err:#}",
                self.batch.len()
            );
            return pause(self.config.failure_cooldown, cancel_token).await;
        }
        ControlFlow::Continue(())
    }

    async fn fill(&mut self) {
        let room = self.config.batch_size.saturating_sub(self.batch.len());
        if room == 0 {
            return;
        }
        let drained = self.store.dequeue_batch(room, self.config.drain_wait).await;
        self.batch.extend(drained);
    }

    fn flush_due(&self) -> bool {
        !self.batch.is_empty()
            && (self.batch.len() >= self.config.batch_size
                || self.last_flush.elapsed() >= self.config.flush_interval)
    }

    /// Uploads the head of the batch and removes it on success.
    async fn flush(&mut self) -> Result<usize> {
        let count = self.batch.len().min(MAX_SINK_RECORDS);
        if count < self.batch.len() {
            warn!(
                "batch of {} exceeds the sink limit, submitting the first {count}",
                self.batch.len()
            );
        }

        let records = self.batch[..count]
            .iter()
            .map(encode_record)
            .collect::<Result<Vec<_>>>()?;
        self.sink.put_records(&records).await?;
        self.batch.drain(..count);
        Ok(count)
    }

    async fn final_flush(&mut self) {
        let queued = self.store.dequeue_batch(usize::MAX, Duration::ZERO).await;
        self.batch.extend(queued);
        if self.batch.is_empty() {
            return;
        }

        info!("final upload of {} remaining records", self.batch.len());
        while !self.batch.is_empty() {
            if let Err(err) = self.flush().await {
                error!(
                    "final upload failed, {} records remain only in the local log: {err:#}",
                    self.batch.len()
                );
                return;
            }
        }
    }
}

async fn wait_or_cancel(delay: Duration, cancel_token: &CancellationToken) -> bool {
    tokio::select! {
        _ = cancel_token.cancelled() => true,
        _ = time::sleep(delay) => false,
    }
}

async fn pause(delay: Duration, cancel_token: &CancellationToken) -> ControlFlow<()> {
    if wait_or_cancel(delay, cancel_token).await {
        ControlFlow::Break(())
    } else {
        ControlFlow::Continue(())
    }
}
