pub mod api;
pub mod controller;
pub mod decoder;
pub mod device;
pub mod history;
pub mod models;
pub mod settings;
pub mod store;
pub mod upload;
mod utils;

use std::sync::Arc;

use anyhow::{anyhow, Context, Result};
use api::ApiState;
use controller::{PipelineController, PipelineParts};
use device::SerialConnector;
use env_logger::Env;
use history::HistoryStore;
use log::{error, info, warn};
use settings::Settings;
use store::{LocalLogWriter, ReadingStore};
use tokio::net::TcpListener;
use tokio::time;
use tokio_util::sync::CancellationToken;
use upload::HttpBatchSink;

pub fn run() {
    // RUST_LOG overrides the default level
    env_logger::Builder::from_env(Env::default().default_filter_or("info")).init();

    info!("weighlink starting up...");

    let settings = match Settings::load().and_then(|settings| {
        settings.validate()?;
        Ok(settings)
    }) {
        Ok(settings) => settings,
        Err(err) => {
            error!("configuration error: {err:#}");
            std::process::exit(1);
        }
    };

    let runtime = match tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
    {
        Ok(runtime) => runtime,
        Err(err) => {
            error!("failed to start async runtime: {err}");
            std::process::exit(1);
        }
    };

    if let Err(err) = runtime.block_on(serve(settings)) {
        error!("weighlink stopped with an error: {err:#}");
        std::process::exit(1);
    }

    info!("weighlink stopped");
}

async fn serve(settings: Settings) -> Result<()> {
    let store = ReadingStore::new(settings.cache_capacity);
    let log_writer = LocalLogWriter::new(settings.log_file.clone());
    let sink_url = settings
        .sink_url
        .clone()
        .context("sink_url is not configured")?;
    let sink = HttpBatchSink::new(sink_url, settings.sink_timeout())?;

    let history = HistoryStore::from_settings(&settings)?;
    if history.is_none() {
        warn!("no historical storage configured, /historical will answer 503");
    }

    let addr = settings.api_addr();
    let listener = TcpListener::bind(&addr)
        .await
        .with_context(|| format!("failed to bind query interface on {addr}"))?;

    let cancel_token = CancellationToken::new();
    let mut controller = PipelineController::new();
    controller.start(
        PipelineParts {
            connector: Arc::new(SerialConnector::new(
                settings.serial_port.clone(),
                settings.baud_rate,
            )),
            store: store.clone(),
            log_writer,
            sink: Arc::new(sink),
        },
        settings.pipeline_config(),
        cancel_token.clone(),
    )?;

    let api_state = Arc::new(ApiState { store, history });
    let mut server = tokio::spawn(api::serve(listener, api_state, cancel_token.clone()));
    let mut server_finished = false;

    let outcome = tokio::select! {
        _ = shutdown_signal() => Ok(()),
        name = controller.wait_for_exit() => Err(anyhow!("{name} ended unexpectedly")),
        result = &mut server => {
            server_finished = true;
            match result {
                Ok(Ok(())) => Err(anyhow!("query interface stopped unexpectedly")),
                Ok(Err(err)) => Err(err),
                Err(err) => Err(anyhow!("query interface task failed: {err}")),
            }
        }
    };

    info!("shutting down...");
    cancel_token.cancel();
    controller.stop().await;

    if !server_finished {
        match time::timeout(settings.shutdown_grace(), server).await {
            Ok(Ok(Ok(()))) => {}
            Ok(Ok(Err(err))) => error!("query interface failed during shutdown: {err:#}"),
            Ok(Err(err)) => error!("query interface task failed: {err}"),
            Err(_) => warn!("query interface did not stop in time"),
        }
    }

    outcome
}

async fn shutdown_signal() {
    let interrupt = async {
        if let Err(err) = tokio::signal::ctrl_c().await {
            error!("failed to listen for SIGINT: {err}");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        use tokio::signal::unix::{signal, SignalKind};
        match signal(SignalKind::terminate()) {
            Ok(mut stream) => {
                stream.recv().await;
            }
            Err(err) => {
                error!("failed to listen for SIGTERM: {err}");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = interrupt => info!("received SIGINT"),
        _ = terminate => info!("received SIGTERM"),
    }
}
