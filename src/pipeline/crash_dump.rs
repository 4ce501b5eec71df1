use crate::constants::CRASH_DUMP_SUFFIX;
use crate::error::Result;
use crate::pipeline::assembler::RecordSpan;
use std::path::{Path, PathBuf};
use tokio::fs::OpenOptions;
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;

/// Append-only side files holding the raw text of records that failed to parse.
///
/// One file per index and source file: `<index>-<source stem>-logs.xml`.
/// Appends are serialised so concurrent file workers never interleave records.
#[derive(Debug)]
pub struct CrashDump {
    dir: PathBuf,
    index: String,
    lock: Mutex<()>,
}

impl CrashDump {
    pub fn new(dir: impl Into<PathBuf>, index: &str) -> Self {
        Self {
            dir: dir.into(),
            index: index.to_string(),
            lock: Mutex::new(()),
        }
    }

    pub fn path_for(&self, file_name: &str) -> PathBuf {
        let stem = file_name.split('.').next().unwrap_or(file_name);
        self.dir
            .join(format!("{}-{}{}", self.index, stem, CRASH_DUMP_SUFFIX))
    }

    pub async fn record(&self, file_name: &str, span: &RecordSpan) -> Result<PathBuf> {
        let path = self.path_for(file_name);
        let _guard = self.lock.lock().await;
        append_line(&path, &span.text).await?;
        Ok(path)
    }
}

async fn append_line(path: &Path, text: &str) -> Result<()> {
    let mut file = OpenOptions::new().create(true).append(true).open(path).await?;
    file.write_all(text.as_bytes()).await?;
    file.write_all(b"\n").await?;
    file.flush().await?;
    Ok(())
}
