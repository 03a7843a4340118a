use anyhow::{Context, Result};
use serde::Serialize;
use std::path::Path;
use uuid::Uuid;

/// Writes `value` as pretty JSON to `path` via a temp file + rename, so a crash mid-write
/// never leaves a half-written file behind. The only write pattern used for durable state.
pub async fn write_json_atomic<T: Serialize>(path: impl AsRef<Path>, value: &T) -> Result<()> {
    let path = path.as_ref();
    if let Some(parent) = path.parent() {
        tokio::fs::create_dir_all(parent)
            .await
            .with_context(|| format!("creating parent dir for {}", path.display()))?;
    }
    let tmp_path = path.with_extension(format!("tmp.{}", Uuid::new_v4()));
    let body = serde_json::to_string_pretty(value).context("serializing state to JSON")?;
    tokio::fs::write(&tmp_path, body)
        .await
        .with_context(|| format!("writing temp file {}", tmp_path.display()))?;
    tokio::fs::rename(&tmp_path, path)
        .await
        .with_context(|| format!("renaming {} to {}", tmp_path.display(), path.display()))?;
    Ok(())
}

pub async fn read_json<T: for<'de> serde::Deserialize<'de>>(
    path: impl AsRef<Path>,
) -> Result<Option<T>> {
    let path = path.as_ref();
    if !path.exists() {
        return Ok(None);
    }
    let raw = tokio::fs::read_to_string(path)
        .await
        .with_context(|| format!("reading {}", path.display()))?;
    let value = serde_json::from_str(&raw).with_context(|| format!("parsing {}", path.display()))?;
    Ok(Some(value))
}
