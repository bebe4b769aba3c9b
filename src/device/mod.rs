mod loop_worker;

pub use loop_worker::{device_poll_loop, LinkState, PollConfig};

use anyhow::{Context, Result};
use async_trait::async_trait;
use tokio::io::AsyncRead;
use tokio::task::spawn_blocking;
use tokio_serial::SerialPortBuilderExt;

/// Byte source for the poll loop.
pub trait ScalePort: AsyncRead + Send + Unpin {}

impl<T: AsyncRead + Send + Unpin> ScalePort for T {}

/// Opens connections to the scale. The poll loop calls `connect` again after
/// every disconnect.
#[async_trait]
pub trait ScaleConnector: Send + Sync {
    async fn connect(&self) -> Result<Box<dyn ScalePort>>;

    fn describe(&self) -> String;
}

pub struct SerialConnector {
    port_path: String,
    baud_rate: u32,
}

impl SerialConnector {
    pub fn new(port_path: impl Into<String>, baud_rate: u32) -> Self {
        Self {
            port_path: port_path.into(),
            baud_rate,
        }
    }
}

#[async_trait]
impl ScaleConnector for SerialConnector {
    async fn connect(&self) -> Result<Box<dyn ScalePort>> {
        let port_path = self.port_path.clone();
        let baud_rate = self.baud_rate;

        // Opening can block on some drivers.
        let port = spawn_blocking(move || {
            tokio_serial::new(&port_path, baud_rate)
                .data_bits(tokio_serial::DataBits::Eight)
                .parity(tokio_serial::Parity::None)
                .stop_bits(tokio_serial::StopBits::One)
                .flow_control(tokio_serial::FlowControl::None)
                .open_native_async()
                .with_context(|| format!("failed to open serial port {port_path}"))
        })
        .await
        .context("serial open worker join failed")??;

        Ok(Box::new(port))
    }

    fn describe(&self) -> String {
        format!("{} @ {} baud", self.port_path, self.baud_rate)
    }
}
