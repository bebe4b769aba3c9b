use std::{fmt, ops::ControlFlow, panic::AssertUnwindSafe, sync::Arc};

use futures::FutureExt;
use log::{debug, error, info, warn};
use tokio::io::AsyncReadExt;
use tokio::time::{self, Duration};
use tokio_util::sync::CancellationToken;

use crate::decoder::FrameDecoder;
use crate::store::{LocalLogWriter, ReadingStore};
use crate::utils::describe_panic;

use super::{ScaleConnector, ScalePort};

const READ_CHUNK_BYTES: usize = 256;

#[derive(Debug, Clone)]
pub struct PollConfig {
    /// Upper bound on a single read while connected.
    pub read_timeout: Duration,
    pub reconnect_backoff: Duration,
    /// Pause after an iteration that produced no reading.
    pub idle_delay: Duration,
}

impl Default for PollConfig {
    fn default() -> Self {
        Self {
            read_timeout: Duration::from_secs(1),
            reconnect_backoff: Duration::from_secs(5),
            idle_delay: Duration::from_millis(50),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkState {
    Disconnected,
    Connecting,
    Connected,
}

impl fmt::Display for LinkState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            LinkState::Disconnected => "disconnected",
            LinkState::Connecting => "connecting",
            LinkState::Connected => "connected",
        };
        f.write_str(label)
    }
}

enum ReadOutcome {
    Bytes(usize),
    Idle,
    Closed(String),
    Cancelled,
}

/// Reads the scale until cancelled, reconnecting after every failure.
///
/// Each decoded reading goes to the local log and then the store. A panic
/// inside one iteration is logged, the connection is dropped and the loop
/// carries on after the reconnect backoff. The device connection is closed
/// when the loop exits.
pub async fn device_poll_loop(
    connector: Arc<dyn ScaleConnector>,
    store: ReadingStore,
    log_writer: LocalLogWriter,
    config: PollConfig,
    cancel_token: CancellationToken,
) {
    let mut poller = DevicePoller::new(connector, store, log_writer, config);
    info!("device poll loop started for {}", poller.device);

    while !cancel_token.is_cancelled() {
        match AssertUnwindSafe(poller.step(&cancel_token))
            .catch_unwind()
            .await
        {
            Ok(ControlFlow::Continue(())) => {}
            Ok(ControlFlow::Break(())) => break,
            Err(panic) => {
                error!(
                    "device poll iteration panicked: {}",
                    describe_panic(panic.as_ref())
                );
                poller.drop_connection();
                if pause(poller.config.reconnect_backoff, &cancel_token)
                    .await
                    .is_break()
                {
                    break;
                }
            }
        }
    }

    if poller.port.take().is_some() {
        info!("closed connection to {}", poller.device);
    }
    info!("device poll loop stopped");
}

struct DevicePoller {
    connector: Arc<dyn ScaleConnector>,
    store: ReadingStore,
    log_writer: LocalLogWriter,
    config: PollConfig,
    device: String,
    decoder: FrameDecoder,
    port: Option<Box<dyn ScalePort>>,
    state: LinkState,
    read_buf: [u8; READ_CHUNK_BYTES],
}

impl DevicePoller {
    fn new(
        connector: Arc<dyn ScaleConnector>,
        store: ReadingStore,
        log_writer: LocalLogWriter,
        config: PollConfig,
    ) -> Self {
        Self {
            device: connector.describe(),
            connector,
            store,
            log_writer,
            config,
            decoder: FrameDecoder::new(),
            port: None,
            state: LinkState::Disconnected,
            read_buf: [0u8; READ_CHUNK_BYTES],
        }
    }

    /// One iteration: connect if needed, read once, record what decodes.
    async fn step(&mut self, cancel_token: &CancellationToken) -> ControlFlow<()> {
        let mut active = match self.port.take() {
            Some(active) => active,
            None => match self.connect().await {
                Some(opened) => opened,
                None => return pause(self.config.reconnect_backoff, cancel_token).await,
            },
        };

        let outcome = read_chunk(
            active.as_mut(),
            &mut self.read_buf,
            self.config.read_timeout,
            cancel_token,
        )
        .await;
        match outcome {
            ReadOutcome::Bytes(count) => {
                debug!("read {count} bytes from {}", self.device);
                self.decoder.feed(&self.read_buf[..count]);
            }
            ReadOutcome::Idle => {}
            ReadOutcome::Closed(reason) => {
                error!(
                    "lost connection to {}: {reason}; reconnecting in {}s",
                    self.device,
                    self.config.reconnect_backoff.as_secs_f32()
                );
                self.set_state(LinkState::Disconnected);
                return pause(self.config.reconnect_backoff, cancel_token).await;
            }
            ReadOutcome::Cancelled => {
                self.port = Some(active);
                return ControlFlow::Break(());
            }
        }
        self.port = Some(active);

        if self.record_decoded() == 0 {
            return pause(self.config.idle_delay, cancel_token).await;
        }
        ControlFlow::Continue(())
    }

    async fn connect(&mut self) -> Option<Box<dyn ScalePort>> {
        self.set_state(LinkState::Connecting);
        match self.connector.connect().await {
            Ok(opened) => {
                self.decoder.reset();
                self.set_state(LinkState::Connected);
                Some(opened)
            }
            Err(err) => {
                self.set_state(LinkState::Disconnected);
                warn!(
                    "failed to connect to {}: {err:#}; retrying in {}s",
                    self.device,
                    self.config.reconnect_backoff.as_secs_f32()
                );
                None
            }
        }
    }

    /// Records every reading the buffered bytes yield. Frames that fail to
    /// decode still consume bytes, so keep going while the buffer shrinks.
    fn record_decoded(&mut self) -> usize {
        let mut produced = 0usize;
        loop {
            let before = self.decoder.buffered_len();
            match self.decoder.next_reading() {
                Some(reading) => {
                    self.log_writer.append(&reading);
                    self.store.record(reading);
                    produced += 1;
                }
                None if self.decoder.buffered_len() < before => {}
                None => return produced,
            }
        }
    }

    fn drop_connection(&mut self) {
        self.port = None;
        self.decoder.reset();
        self.set_state(LinkState::Disconnected);
    }

    fn set_state(&mut self, next: LinkState) {
        if self.state != next {
            info!("{}: {} -> {next}", self.device, self.state);
            self.state = next;
        }
    }
}

async fn read_chunk(
    port: &mut dyn ScalePort,
    buf: &mut [u8],
    read_timeout: Duration,
    cancel_token: &CancellationToken,
) -> ReadOutcome {
    tokio::select! {
        _ = cancel_token.cancelled() => ReadOutcome::Cancelled,
        result = time::timeout(read_timeout, port.read(buf)) => match result {
            Ok(Ok(0)) => ReadOutcome::Closed("device closed the stream".into()),
            Ok(Ok(count)) => ReadOutcome::Bytes(count),
            Ok(Err(err)) if err.kind() == std::io::ErrorKind::TimedOut => ReadOutcome::Idle,
            Ok(Err(err)) => ReadOutcome::Closed(err.to_string()),
            Err(_) => ReadOutcome::Idle,
        },
    }
}

/// Sleeps for `delay`; breaks if cancellation arrives first.
async fn pause(delay: Duration, cancel_token: &CancellationToken) -> ControlFlow<()> {
    tokio::select! {
        _ = cancel_token.cancelled() => ControlFlow::Break(()),
        _ = time::sleep(delay) => ControlFlow::Continue(()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::decoder::encode_frame;
    use anyhow::{anyhow, Result};
    use async_trait::async_trait;
    use std::collections::VecDeque;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;
    use tokio::io::{duplex, AsyncWriteExt, DuplexStream};

    /// Hands out the queued streams in order, then fails every attempt.
    struct ScriptedConnector {
        streams: Mutex<VecDeque<Option<DuplexStream>>>,
        attempts: AtomicUsize,
    }

    impl ScriptedConnector {
        fn new(streams: Vec<Option<DuplexStream>>) -> Arc<Self> {
            Arc::new(Self {
                streams: Mutex::new(streams.into()),
                attempts: AtomicUsize::new(0),
            })
        }
    }

    #[async_trait]
    impl ScaleConnector for ScriptedConnector {
        async fn connect(&self) -> Result<Box<dyn ScalePort>> {
            self.attempts.fetch_add(1, Ordering::SeqCst);
            match self.streams.lock().unwrap().pop_front() {
                Some(Some(stream)) => Ok(Box::new(stream)),
                _ => Err(anyhow!("port busy")),
            }
        }

        fn describe(&self) -> String {
            "scripted".into()
        }
    }

    async fn device_with(frames: &[Vec<u8>]) -> DuplexStream {
        let (device, mut scale) = duplex(4096);
        for frame in frames {
            scale.write_all(frame).await.unwrap();
        }
        device
    }

    fn spawn_loop(
        connector: Arc<ScriptedConnector>,
        store: &ReadingStore,
        writer: &LocalLogWriter,
        cancel: &CancellationToken,
    ) -> tokio::task::JoinHandle<()> {
        tokio::spawn(device_poll_loop(
            connector,
            store.clone(),
            writer.clone(),
            PollConfig::default(),
            cancel.clone(),
        ))
    }

    #[tokio::test(start_paused = true)]
    async fn decoded_readings_reach_store_and_log() {
        let dir = tempfile::tempdir().unwrap();
        let writer = LocalLogWriter::new(dir.path().join("weighing.jsonl"));
        let store = ReadingStore::new(10);
        let cancel = CancellationToken::new();

        let (device, mut scale) = duplex(4096);
        let connector = ScriptedConnector::new(vec![Some(device)]);
        let handle = spawn_loop(connector, &store, &writer, &cancel);

        scale.write_all(b"noise\x021234").await.unwrap();
        time::sleep(Duration::from_millis(200)).await;
        scale.write_all(b"5673\x03").await.unwrap();
        scale.write_all(&encode_frame("0000420", 1)).await.unwrap();
        time::sleep(Duration::from_millis(200)).await;

        let weights: Vec<f64> = store.snapshot().iter().map(|r| r.weight).collect();
        assert_eq!(weights, vec![1234.567, 42.0]);
        assert_eq!(store.pending_len(), 2);

        let logged = std::fs::read_to_string(writer.path()).unwrap();
        assert_eq!(logged.lines().count(), 2);

        cancel.cancel();
        handle.await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn reconnects_after_failure_and_disconnect() {
        let dir = tempfile::tempdir().unwrap();
        let writer = LocalLogWriter::new(dir.path().join("weighing.jsonl"));
        let store = ReadingStore::new(10);
        let cancel = CancellationToken::new();

        // first attempt fails; each stream then delivers one frame and hits EOF
        let first = device_with(&[encode_frame("0000010", 0)]).await;
        let second = device_with(&[encode_frame("0000020", 0)]).await;
        let connector = ScriptedConnector::new(vec![None, Some(first), Some(second)]);
        let handle = spawn_loop(connector.clone(), &store, &writer, &cancel);

        time::sleep(Duration::from_secs(12)).await;

        let weights: Vec<f64> = store.snapshot().iter().map(|r| r.weight).collect();
        assert_eq!(weights, vec![10.0, 20.0]);
        assert!(connector.attempts.load(Ordering::SeqCst) >= 3);

        cancel.cancel();
        handle.await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn cancellation_interrupts_backoff() {
        let dir = tempfile::tempdir().unwrap();
        let writer = LocalLogWriter::new(dir.path().join("weighing.jsonl"));
        let store = ReadingStore::new(10);
        let cancel = CancellationToken::new();
        let connector = ScriptedConnector::new(vec![]);

        let handle = spawn_loop(connector.clone(), &store, &writer, &cancel);
        time::sleep(Duration::from_millis(100)).await;
        cancel.cancel();

        time::timeout(Duration::from_secs(1), handle)
            .await
            .expect("loop should stop well before the backoff elapses")
            .unwrap();
        assert_eq!(connector.attempts.load(Ordering::SeqCst), 1);
    }

    /// Every connection opens fine and is already at EOF.
    #[derive(Default)]
    struct DeadLinkConnector {
        attempts: AtomicUsize,
    }

    #[async_trait]
    impl ScaleConnector for DeadLinkConnector {
        async fn connect(&self) -> Result<Box<dyn ScalePort>> {
            self.attempts.fetch_add(1, Ordering::SeqCst);
            let (device, scale) = duplex(64);
            drop(scale);
            Ok(Box::new(device))
        }

        fn describe(&self) -> String {
            "dead link".into()
        }
    }

    /// Panics on the first connect, then serves one stream.
    struct PanicOnceConnector {
        stream: Mutex<Option<DuplexStream>>,
        attempts: AtomicUsize,
    }

    #[async_trait]
    impl ScaleConnector for PanicOnceConnector {
        async fn connect(&self) -> Result<Box<dyn ScalePort>> {
            if self.attempts.fetch_add(1, Ordering::SeqCst) == 0 {
                panic!("driver fault");
            }
            match self.stream.lock().unwrap().take() {
                Some(stream) => Ok(Box::new(stream)),
                None => Err(anyhow!("port busy")),
            }
        }

        fn describe(&self) -> String {
            "panicky".into()
        }
    }

    #[tokio::test(start_paused = true)]
    async fn closed_link_reconnects_after_backoff() {
        let dir = tempfile::tempdir().unwrap();
        let writer = LocalLogWriter::new(dir.path().join("weighing.jsonl"));
        let store = ReadingStore::new(10);
        let cancel = CancellationToken::new();
        let connector = Arc::new(DeadLinkConnector::default());

        let handle = tokio::spawn(device_poll_loop(
            connector.clone(),
            store.clone(),
            writer,
            PollConfig::default(),
            cancel.clone(),
        ));
        time::sleep(Duration::from_secs(12)).await;

        // t = 0s, 5s, 10s
        let attempts = connector.attempts.load(Ordering::SeqCst);
        assert!((2..=4).contains(&attempts), "{attempts} connect attempts");

        cancel.cancel();
        handle.await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn panicking_iteration_does_not_end_loop() {
        let dir = tempfile::tempdir().unwrap();
        let writer = LocalLogWriter::new(dir.path().join("weighing.jsonl"));
        let store = ReadingStore::new(10);
        let cancel = CancellationToken::new();

        let (device, mut scale) = duplex(4096);
        scale.write_all(&encode_frame("0000070", 0)).await.unwrap();
        let connector = Arc::new(PanicOnceConnector {
            stream: Mutex::new(Some(device)),
            attempts: AtomicUsize::new(0),
        });

        let handle = tokio::spawn(device_poll_loop(
            connector.clone(),
            store.clone(),
            writer,
            PollConfig::default(),
            cancel.clone(),
        ));
        time::sleep(Duration::from_secs(6)).await;

        assert!(!handle.is_finished());
        assert_eq!(connector.attempts.load(Ordering::SeqCst), 2);
        let weights: Vec<f64> = store.snapshot().iter().map(|r| r.weight).collect();
        assert_eq!(weights, vec![70.0]);

        cancel.cancel();
        handle.await.unwrap();
    }
}
