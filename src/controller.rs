use std::sync::Arc;

use anyhow::{bail, Result};
use futures::future::select_all;
use log::{error, info, warn};
use tokio::task::JoinHandle;
use tokio::time::{self, Duration};
use tokio_util::sync::CancellationToken;

use crate::device::{device_poll_loop, PollConfig, ScaleConnector};
use crate::store::{LocalLogWriter, ReadingStore};
use crate::upload::{upload_loop, BatchSink, UploadConfig};

/// Everything the two pipeline loops share.
#[derive(Clone)]
pub struct PipelineParts {
    pub connector: Arc<dyn ScaleConnector>,
    pub store: ReadingStore,
    pub log_writer: LocalLogWriter,
    pub sink: Arc<dyn BatchSink>,
}

#[derive(Debug, Clone, Default)]
pub struct PipelineConfig {
    pub poll: PollConfig,
    pub upload: UploadConfig,
    pub shutdown_grace: Duration,
    /// Added to the upload loop's grace so an in-flight final flush can finish.
    pub sink_timeout: Duration,
}

struct LoopTask {
    name: &'static str,
    handle: JoinHandle<()>,
    grace: Duration,
}

pub struct PipelineController {
    tasks: Vec<LoopTask>,
    cancel_token: Option<CancellationToken>,
}

impl PipelineController {
    pub fn new() -> Self {
        Self {
            tasks: Vec::new(),
            cancel_token: None,
        }
    }

    pub fn is_running(&self) -> bool {
        self.cancel_token.is_some()
    }

    /// Spawns the poll and upload loops under `cancel_token`.
    pub fn start(
        &mut self,
        parts: PipelineParts,
        config: PipelineConfig,
        cancel_token: CancellationToken,
    ) -> Result<()> {
        if self.is_running() {
            bail!("pipeline already running");
        }

        info!("starting pipeline on {}", parts.connector.describe());

        let poll = tokio::spawn(device_poll_loop(
            parts.connector,
            parts.store.clone(),
            parts.log_writer,
            config.poll,
            cancel_token.clone(),
        ));
        let upload = tokio::spawn(upload_loop(
            parts.store,
            parts.sink,
            config.upload,
            cancel_token.clone(),
        ));

        self.tasks = vec![
            LoopTask {
                name: "device poll loop",
                handle: poll,
                grace: config.shutdown_grace,
            },
            LoopTask {
                name: "upload loop",
                handle: upload,
                grace: config.shutdown_grace + config.sink_timeout,
            },
        ];
        self.cancel_token = Some(cancel_token);
        Ok(())
    }

    /// Resolves once any loop task ends, returning its name. Loops only end
    /// on cancellation, so before shutdown this is always a fault.
    pub async fn wait_for_exit(&mut self) -> &'static str {
        if self.tasks.is_empty() {
            return std::future::pending().await;
        }

        let (result, index, remaining) =
            select_all(self.tasks.iter_mut().map(|task| &mut task.handle)).await;
        drop(remaining);

        let task = self.tasks.remove(index);
        match result {
            Ok(()) => warn!("{} exited", task.name),
            Err(err) => error!("{} failed: {err}", task.name),
        }
        task.name
    }

    /// Cancels both loops and waits for each up to its grace period.
    pub async fn stop(&mut self) {
        if let Some(token) = self.cancel_token.take() {
            token.cancel();
        }

        for task in self.tasks.drain(..) {
            match time::timeout(task.grace, task.handle).await {
                Ok(Ok(())) => info!("{} stopped", task.name),
                Ok(Err(err)) => error!("{} failed during shutdown: {err}", task.name),
                Err(_) => warn!(
                    "{} unresponsive after {}s, abandoning it",
                    task.name,
                    task.grace.as_secs()
                ),
            }
        }
    }
}

impl Default for PipelineController {
    fn default() -> Self {
        Self::new()
    }
}
