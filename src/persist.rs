//! Crash-safe file writes shared by the ledger and the recipient store.

use std::path::{Path, PathBuf};

use tokio::io::AsyncWriteExt;

/// Write `contents` to `path` through a sibling temp file. The temp file
/// is fsynced before the rename and the parent directory after it, so
/// the replacement is durable across power loss, not just a process
/// crash.
pub(crate) async fn write_atomic(path: &Path, contents: &str) -> std::io::Result<()> {
    let mut tmp_name = path.as_os_str().to_os_string();
    tmp_name.push(".tmp");
    let tmp = PathBuf::from(tmp_name);

    let mut file = tokio::fs::File::create(&tmp).await?;
    file.write_all(contents.as_bytes()).await?;
    file.sync_all().await?;
    drop(file);

    tokio::fs::rename(&tmp, path).await?;

    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            tokio::fs::File::open(parent).await?.sync_all().await?;
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn write_replaces_target_and_removes_temp() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("out.json");
        write_atomic(&path, "one").await.unwrap();
        write_atomic(&path, "two").await.unwrap();

        assert_eq!(std::fs::read_to_string(&path).unwrap(), "two");
        assert!(!dir.path().join("out.json.tmp").exists());
    }
}
