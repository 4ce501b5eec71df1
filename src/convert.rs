//! Conversion of binary `.evtx` logs into XML exports with `wevtutil`.

use crate::constants::{ALL_FILES, EVTX_EXTENSION, EXPORT_EXTENSION};
use crate::error::{ExcavatorError, Result};
use std::path::{Path, PathBuf};
use tokio::fs::OpenOptions;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tracing::{error, info};

/// Name of the export produced for `file`.
pub fn export_name(file: &str) -> String {
    if file.ends_with(EXPORT_EXTENSION) {
        file.to_string()
    } else {
        format!("{file}{EXPORT_EXTENSION}")
    }
}

/// Convert the selected `.evtx` files in `dir`. Files that fail to convert are
/// logged and skipped; the paths of the written exports are returned.
pub async fn convert_exports(dir: &Path, selector: &str) -> Result<Vec<PathBuf>> {
    if !cfg!(windows) {
        return Err(ExcavatorError::ConversionFailed(
            "wevtutil is only available on Windows".to_string(),
        ));
    }

    let files = if selector == ALL_FILES {
        let mut names = Vec::new();
        for entry in std::fs::read_dir(dir)? {
            let name = entry?.file_name().to_string_lossy().into_owned();
            if name.ends_with(EVTX_EXTENSION) {
                names.push(name);
            }
        }
        names.sort();
        names
    } else {
        vec![selector.to_string()]
    };

    let mut exports = Vec::new();
    for file in files {
        match convert_one(dir, &file).await {
            Ok(path) => {
                info!("Converted {} to {}", file, path.display());
                exports.push(path);
            }
            Err(e) => error!("Unable to convert {}: {}", file, e),
        }
    }
    Ok(exports)
}

async fn convert_one(dir: &Path, file: &str) -> Result<PathBuf> {
    let source = dir.join(file);
    let target = dir.join(export_name(file));

    let output = Command::new("wevtutil")
        .arg("qe")
        .arg(&source)
        .arg("/lf:true")
        .arg("/f:XML")
        .output()
        .await?;
    if !output.status.success() {
        return Err(ExcavatorError::ConversionFailed(format!(
            "wevtutil exited with {}: {}",
            output.status,
            String::from_utf8_lossy(&output.stderr).trim()
        )));
    }

    // Appends, so repeated conversions accumulate like the shell redirect would
    let mut export = OpenOptions::new().create(true).append(true).open(&target).await?;
    export.write_all(&output.stdout).await?;
    export.flush().await?;
    Ok(target)
}
