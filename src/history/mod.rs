//! Read-only access to archived readings.
//!
//! The remote sink delivers batches into dated partitions
//! (`<prefix>/YYYY/MM/DD/<object>`), each object holding JSON lines. This
//! module fetches one day's partition and merges it into a single
//! chronological list.

use std::{path::Path, sync::Arc};

use anyhow::{Context, Result};
use chrono::NaiveDate;
use futures::TryStreamExt;
use log::{debug, info, warn};
use object_store::{
    aws::AmazonS3Builder, local::LocalFileSystem, path::Path as ObjectPath, ObjectMeta,
    ObjectStore,
};

use crate::models::Reading;
use crate::settings::Settings;

#[derive(Clone)]
pub struct HistoryStore {
    store: Arc<dyn ObjectStore>,
    prefix: String,
}

impl HistoryStore {
    pub fn new(store: Arc<dyn ObjectStore>, prefix: impl Into<String>) -> Self {
        Self {
            store,
            prefix: prefix.into().trim_matches('/').to_string(),
        }
    }

    pub fn local(root: &Path, prefix: impl Into<String>) -> Result<Self> {
        std::fs::create_dir_all(root)
            .with_context(|| format!("failed to create history directory {}", root.display()))?;
        let store = LocalFileSystem::new_with_prefix(root)
            .with_context(|| format!("failed to open history directory {}", root.display()))?;
        Ok(Self::new(Arc::new(store), prefix))
    }

    pub fn s3(bucket: &str, region: &str, prefix: impl Into<String>) -> Result<Self> {
        let store = AmazonS3Builder::from_env()
            .with_bucket_name(bucket)
            .with_region(region)
            .build()
            .with_context(|| format!("failed to configure S3 bucket {bucket}"))?;
        Ok(Self::new(Arc::new(store), prefix))
    }

    /// S3 when a bucket is configured, otherwise a local directory, otherwise
    /// nothing.
    pub fn from_settings(settings: &Settings) -> Result<Option<Self>> {
        let prefix = settings.history_prefix.clone();
        match (&settings.history_bucket, &settings.history_dir) {
            (Some(bucket), _) => {
                let region = settings
                    .aws_region
                    .as_deref()
                    .context("history_bucket requires aws_region")?;
                Self::s3(bucket, region, prefix).map(Some)
            }
            (None, Some(dir)) => Self::local(dir, prefix).map(Some),
            (None, None) => Ok(None),
        }
    }

    pub fn partition(&self, date: NaiveDate) -> ObjectPath {
        let day = date.format("%Y/%m/%d");
        if self.prefix.is_empty() {
            ObjectPath::from(day.to_string())
        } else {
            ObjectPath::from(format!("{}/{day}", self.prefix))
        }
    }

    /// Every reading archived for `date`, oldest first. Unreadable objects
    /// and malformed lines are skipped.
    pub async fn readings_for_date(&self, date: NaiveDate) -> Result<Vec<Reading>> {
        let partition = self.partition(date);
        info!("fetching historical readings from {partition}");

        let objects: Vec<ObjectMeta> = self
            .store
            .list(Some(&partition))
            .try_collect()
            .await
            .with_context(|| format!("failed to list {partition}"))?;

        let mut readings = Vec::new();
        for object in &objects {
            debug!("reading archived object {}", object.location);
            match self.read_object(&object.location).await {
                Ok(mut parsed) => readings.append(&mut parsed),
                Err(err) => warn!("skipping {}: {err:#}", object.location),
            }
        }

        readings.sort_by_key(|reading| reading.timestamp);
        info!(
            "loaded {} historical readings from {} objects for {date}",
            readings.len(),
            objects.len()
        );
        Ok(readings)
    }

    async fn read_object(&self, location: &ObjectPath) -> Result<Vec<Reading>> {
        let bytes = self
            .store
            .get(location)
            .await
            .context("fetch failed")?
            .bytes()
            .await
            .context("download failed")?;
        let text = std::str::from_utf8(&bytes).context("object is not UTF-8")?;
        Ok(parse_lines(text, location))
    }
}

fn parse_lines(text: &str, location: &ObjectPath) -> Vec<Reading> {
    text.lines()
        .map(str::trim)
        .filter(|line| !line.is_empty())
        .filter_map(|line| match serde_json::from_str::<Reading>(line) {
            Ok(reading) => Some(reading),
            Err(err) => {
                let preview: String = line.chars().take(100).collect();
                warn!("skipping invalid line in {location}: {err} ({preview})");
                None
            }
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{TimeZone, Utc};
    use std::fs;

    fn line(weight: f64, hour: u32) -> String {
        let timestamp = Utc.with_ymd_and_hms(2026, 10, 19, hour, 0, 0).unwrap();
        let reading = Reading::at(weight, timestamp);
        serde_json::to_string(&reading).unwrap()
    }

    fn seeded_store() -> (tempfile::TempDir, HistoryStore) {
        let dir = tempfile::tempdir().unwrap();
        let day = dir.path().join("data/2026/10/19");
        fs::create_dir_all(&day).unwrap();
        fs::write(
            day.join("batch-2"),
            format!("{}\n{{broken\n\n{}\n", line(3.0, 9), line(1.0, 7)),
        )
        .unwrap();
        fs::write(day.join("batch-1"), format!("{}\n", line(2.0, 8))).unwrap();

        let other_day = dir.path().join("data/2026/10/20");
        fs::create_dir_all(&other_day).unwrap();
        fs::write(other_day.join("batch-3"), format!("{}\n", line(9.0, 1))).unwrap();

        let store = HistoryStore::local(dir.path(), "data").unwrap();
        (dir, store)
    }

    #[tokio::test]
    async fn merges_partition_in_timestamp_order() {
        let (_dir, store) = seeded_store();

        let readings = store
            .readings_for_date(NaiveDate::from_ymd_opt(2026, 10, 19).unwrap())
            .await
            .unwrap();

        let weights: Vec<f64> = readings.iter().map(|r| r.weight).collect();
        assert_eq!(weights, vec![1.0, 2.0, 3.0]);
    }

    #[tokio::test]
    async fn empty_partition_yields_no_readings() {
        let (_dir, store) = seeded_store();

        let readings = store
            .readings_for_date(NaiveDate::from_ymd_opt(2026, 1, 1).unwrap())
            .await
            .unwrap();
        assert!(readings.is_empty());
    }

    #[test]
    fn partition_layout() {
        let dir = tempfile::tempdir().unwrap();
        let date = NaiveDate::from_ymd_opt(2026, 3, 7).unwrap();

        let store = HistoryStore::local(dir.path(), "/data/").unwrap();
        assert_eq!(store.partition(date).as_ref(), "data/2026/03/07");

        let bare = HistoryStore::local(dir.path(), "").unwrap();
        assert_eq!(bare.partition(date).as_ref(), "2026/03/07");
    }

    #[test]
    fn settings_without_history_source() {
        assert!(HistoryStore::from_settings(&Settings::default())
            .unwrap()
            .is_none());
    }
}
