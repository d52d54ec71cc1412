use std::{io, path::PathBuf};

use tokio::{fs::OpenOptions, io::AsyncWriteExt};

pub async fn atomic_replace(src: PathBuf, dst: PathBuf) -> io::Result<()> {
    tokio::task::spawn_blocking(move || atomicwrites::replace_atomic(&src, &dst))
        .await
        .map_err(|e| io::Error::new(io::ErrorKind::Other, e))??;

    Ok(())
}

/// Atomically writes the given bytes to the specified path.
/// Writes to a temporary file in the same directory and then renames it over the target file.
/// Ensures that either the entire file is written or not changed at all.
/// Truncates the tmp_file if it exists
pub async fn atomic_write(path: PathBuf, tmp_path: PathBuf, data: &[u8]) -> io::Result<()> {
    // Write to the temporary file
    {
        let mut tmp_file = OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(true)
            .open(&tmp_path)
            .await?;
        tmp_file.write_all(data).await?;
        tmp_file.sync_all().await?;
    }

    atomic_replace(tmp_path, path).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[tokio::test]
    async fn atomic_write_replaces_existing_content() {
        let dir = tempdir().unwrap();
        let target = dir.path().join("data.bin");
        let tmp = dir.path().join("data.bin.partial");

        std::fs::write(&target, b"old").unwrap();
        atomic_write(target.clone(), tmp.clone(), b"new content")
            .await
            .unwrap();

        assert_eq!(std::fs::read(&target).unwrap(), b"new content");
        assert!(!tmp.exists());
    }

    #[tokio::test]
    async fn atomic_write_creates_missing_target() {
        let dir = tempdir().unwrap();
        let target = dir.path().join("fresh.bin");
        let tmp = dir.path().join("fresh.bin.partial");

        atomic_write(target.clone(), tmp, b"hello").await.unwrap();
        assert_eq!(std::fs::read(&target).unwrap(), b"hello");
    }
}
