use std::path::{Path, PathBuf};

use anyhow::{bail, Context, Result};
use figment::{
    providers::{Env, Format, Serialized, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};
use tokio::time::Duration;

use crate::controller::PipelineConfig;
use crate::device::PollConfig;
use crate::upload::{UploadConfig, MAX_SINK_RECORDS};

pub const ENV_PREFIX: &str = "WEIGHLINK_";
pub const DEFAULT_CONFIG_FILE: &str = "weighlink.toml";

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    pub serial_port: String,
    pub baud_rate: u32,
    pub serial_timeout_secs: u64,
    pub reconnect_backoff_secs: u64,

    pub cache_capacity: usize,
    pub upload_batch_size: usize,
    pub upload_interval_secs: u64,
    pub log_file: PathBuf,

    pub sink_url: Option<String>,
    pub sink_timeout_secs: u64,

    pub history_bucket: Option<String>,
    pub aws_region: Option<String>,
    pub history_dir: Option<PathBuf>,
    pub history_prefix: String,

    pub api_host: String,
    pub api_port: u16,
    pub shutdown_grace_secs: u64,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            serial_port: "/dev/ttyUSB0".into(),
            baud_rate: 9600,
            serial_timeout_secs: 1,
            reconnect_backoff_secs: 5,
            cache_capacity: 200,
            upload_batch_size: MAX_SINK_RECORDS,
            upload_interval_secs: 60,
            log_file: PathBuf::from("weighing_logs.jsonl"),
            sink_url: None,
            sink_timeout_secs: 10,
            history_bucket: None,
            aws_region: None,
            history_dir: None,
            history_prefix: "data".into(),
            api_host: "127.0.0.1".into(),
            api_port: 5000,
            shutdown_grace_secs: 10,
        }
    }
}

impl Settings {
    /// Defaults, then the TOML file named by `WEIGHLINK_CONFIG` (or
    /// `weighlink.toml`), then `WEIGHLINK_*` variables.
    pub fn load() -> Result<Self> {
        let path = std::env::var(format!("{ENV_PREFIX}CONFIG"))
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from(DEFAULT_CONFIG_FILE));
        Self::load_from(&path)
    }

    pub fn load_from(path: &Path) -> Result<Self> {
        Self::figment(path)
            .extract()
            .with_context(|| format!("failed to load settings ({})", path.display()))
    }

    fn figment(path: &Path) -> Figment {
        Figment::from(Serialized::defaults(Settings::default()))
            .merge(Toml::file(path))
            .merge(Env::prefixed(ENV_PREFIX).ignore(&["config"]))
    }

    /// Startup checks; any failure here is fatal.
    pub fn validate(&self) -> Result<()> {
        let Some(sink_url) = self.sink_url.as_deref().filter(|url| !url.trim().is_empty()) else {
            bail!("missing required setting {ENV_PREFIX}SINK_URL");
        };
        let parsed = reqwest::Url::parse(sink_url)
            .with_context(|| format!("invalid sink_url '{sink_url}'"))?;
        if !matches!(parsed.scheme(), "http" | "https") {
            bail!("sink_url must be http or https, got '{}'", parsed.scheme());
        }

        if self.history_bucket.is_some() && self.aws_region.is_none() {
            bail!("history_bucket requires {ENV_PREFIX}AWS_REGION");
        }

        if !(1..=MAX_SINK_RECORDS).contains(&self.upload_batch_size) {
            bail!(
                "upload_batch_size {} must be between 1 and {MAX_SINK_RECORDS}",
                self.upload_batch_size
            );
        }
        if self.cache_capacity == 0 {
            bail!("cache_capacity must be greater than zero");
        }
        if self.baud_rate == 0 {
            bail!("baud_rate must be greater than zero");
        }
        if self.upload_interval_secs == 0 {
            bail!("upload_interval_secs must be greater than zero");
        }

        Ok(())
    }

    pub fn sink_timeout(&self) -> Duration {
        Duration::from_secs(self.sink_timeout_secs)
    }

    pub fn shutdown_grace(&self) -> Duration {
        Duration::from_secs(self.shutdown_grace_secs)
    }

    pub fn api_addr(&self) -> String {
        format!("{}:{}", self.api_host, self.api_port)
    }

    pub fn poll_config(&self) -> PollConfig {
        PollConfig {
            read_timeout: Duration::from_secs(self.serial_timeout_secs.max(1)),
            reconnect_backoff: Duration::from_secs(self.reconnect_backoff_secs),
            ..PollConfig::default()
        }
    }

    pub fn upload_config(&self) -> UploadConfig {
        UploadConfig {
            batch_size: self.upload_batch_size,
            flush_interval: Duration::from_secs(self.upload_interval_secs),
            ..UploadConfig::default()
        }
    }

    pub fn pipeline_config(&self) -> PipelineConfig {
        PipelineConfig {
            poll: self.poll_config(),
            upload: self.upload_config(),
            shutdown_grace: self.shutdown_grace(),
            sink_timeout: self.sink_timeout(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn valid() -> Settings {
        Settings {
            sink_url: Some("https://ingest.example.com/batches".into()),
            ..Settings::default()
        }
    }

    #[test]
    fn defaults_need_a_sink() {
        let err = Settings::default().validate().unwrap_err();
        assert!(err.to_string().contains("SINK_URL"));
        assert!(valid().validate().is_ok());
    }

    #[test]
    fn rejects_bad_values() {
        let cases = [
            Settings {
                sink_url: Some("ftp://host/x".into()),
                ..valid()
            },
            Settings {
                sink_url: Some("not a url".into()),
                ..valid()
            },
            Settings {
                history_bucket: Some("scale-archive".into()),
                ..valid()
            },
            Settings {
                upload_batch_size: 0,
                ..valid()
            },
            Settings {
                upload_batch_size: MAX_SINK_RECORDS + 1,
                ..valid()
            },
            Settings {
                cache_capacity: 0,
                ..valid()
            },
            Settings {
                upload_interval_secs: 0,
                ..valid()
            },
        ];
        for settings in cases {
            assert!(settings.validate().is_err(), "{settings:?}");
        }
    }

    #[test]
    fn file_and_env_layers_override_defaults() {
        figment::Jail::expect_with(|jail| {
            jail.create_file(
                "scale.toml",
                r#"
                serial_port = "/dev/ttyACM0"
                cache_capacity = 50
                sink_url = "http://localhost:9000/put"
                "#,
            )?;
            jail.set_env("WEIGHLINK_CACHE_CAPACITY", "75");
            jail.set_env("WEIGHLINK_UPLOAD_INTERVAL_SECS", "15");

            let settings = Settings::load_from(Path::new("scale.toml")).unwrap();
            assert_eq!(settings.serial_port, "/dev/ttyACM0");
            assert_eq!(settings.cache_capacity, 75);
            assert_eq!(settings.upload_interval_secs, 15);
            assert_eq!(settings.baud_rate, 9600);
            assert!(settings.validate().is_ok());
            let pipeline = settings.pipeline_config();
            assert_eq!(pipeline.upload.flush_interval, Duration::from_secs(15));
            assert_eq!(pipeline.poll.reconnect_backoff, Duration::from_secs(5));
            Ok(())
        });
    }

    #[test]
    fn missing_file_falls_back_to_defaults() {
        figment::Jail::expect_with(|_| {
            let settings = Settings::load_from(Path::new("absent.toml")).unwrap();
            assert_eq!(settings.api_addr(), "127.0.0.1:5000");
            assert_eq!(settings.log_file, PathBuf::from("weighing_logs.jsonl"));
            Ok(())
        });
    }
}
