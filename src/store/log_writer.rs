use std::{
    fs::{self, File, OpenOptions},
    io::Write,
    path::{Path, PathBuf},
    sync::{Arc, Mutex},
};

use anyhow::{Context, Result};
use log::{error, warn};

use crate::models::Reading;

/// Append-only JSON-lines log of every accepted reading.
///
/// Writes are best-effort: failures are logged and swallowed so the ingestion
/// path never stalls on the local disk.
#[derive(Clone)]
pub struct LocalLogWriter {
    path: Arc<PathBuf>,
    file: Arc<Mutex<Option<File>>>,
}

impl LocalLogWriter {
    pub fn new(path: PathBuf) -> Self {
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            if let Err(err) = fs::create_dir_all(parent) {
                warn!(
                    "failed to create log directory {}: {err}",
                    parent.display()
                );
            }
        }

        Self {
            path: Arc::new(path),
            file: Arc::new(Mutex::new(None)),
        }
    }

    pub fn path(&self) -> &Path {
        self.path.as_path()
    }

    pub fn append(&self, reading: &Reading) {
        if let Err(err) = self.try_append(reading) {
            error!(
                "failed to append reading {} to {}: {err:#}",
                reading.id,
                self.path.display()
            );
        }
    }

    fn try_append(&self, reading: &Reading) -> Result<()> {
        let mut line = serde_json::to_vec(reading).context("failed to serialize reading")?;
        line.push(b'\n');

        let mut guard = match self.file.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };

        if guard.is_none() {
            let file = OpenOptions::new()
                .create(true)
                .append(true)
                .open(self.path.as_path())
                .with_context(|| format!("failed to open {}", self.path.display()))?;
            *guard = Some(file);
        }

        let result = match guard.as_mut() {
            Some(file) => file.write_all(&line).and_then(|()| file.flush()),
            None => Ok(()),
        };

        if let Err(err) = result {
            // Reopen on the next append.
            *guard = None;
            return Err(err).context("write failed");
        }

        Ok(())
    }
}
