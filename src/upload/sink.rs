use std::time::Duration;

use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use bytes::Bytes;
use log::{debug, info};
use reqwest::header::CONTENT_TYPE;
use serde::Deserialize;

use crate::models::Reading;

/// Hard per-call record limit of the remote ingestion endpoint.
pub const MAX_SINK_RECORDS: usize = 500;

/// Remote endpoint that durably ingests batches of serialized readings.
///
/// `put_records` never receives more than [`MAX_SINK_RECORDS`] records. Any
/// rejection, partial or total, is reported as an error for the whole batch.
#[async_trait]
pub trait BatchSink: Send + Sync {
    async fn put_records(&self, records: &[Bytes]) -> Result<()>;
}

/// One newline-terminated JSON line.
pub fn encode_record(reading: &Reading) -> Result<Bytes> {
    let mut line = serde_json::to_vec(reading).context("failed to serialize reading")?;
    line.push(b'\n');
    Ok(Bytes::from(line))
}

#[derive(Debug, Default, Deserialize)]
struct PutResponse {
    #[serde(default)]
    failed_put_count: usize,
}

/// Posts batches as newline-delimited JSON.
pub struct HttpBatchSink {
    client: reqwest::Client,
    url: String,
}

impl HttpBatchSink {
    pub fn new(url: impl Into<String>, timeout: Duration) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .context("failed to build HTTP client")?;

        Ok(Self {
            client,
            url: url.into(),
        })
    }
}

#[async_trait]
impl BatchSink for HttpBatchSink {
    async fn put_records(&self, records: &[Bytes]) -> Result<()> {
        if records.is_empty() {
            debug!("no records to upload");
            return Ok(());
        }

        let body: Vec<u8> = records.concat();
        let response = self
            .client
            .post(&self.url)
            .header(CONTENT_TYPE, "application/x-ndjson")
            .body(body)
            .send()
            .await
            .with_context(|| format!("failed to reach sink {}", self.url))?;

        let status = response.status();
        if !status.is_success() {
            bail!("sink {} answered {status}", self.url);
        }

        let text = response
            .text()
            .await
            .context("failed to read sink response")?;
        let outcome = parse_put_response(&text)?;
        if outcome.failed_put_count > 0 {
            bail!(
                "sink rejected {} of {} records",
                outcome.failed_put_count,
                records.len()
            );
        }

        info!("uploaded {} records to {}", records.len(), self.url);
        Ok(())
    }
}

fn parse_put_response(body: &str) -> Result<PutResponse> {
    if body.trim().is_empty() {
        return Ok(PutResponse::default());
    }
    serde_json::from_str(body).context("malformed sink response")
}
