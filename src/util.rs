use std::io;
use std::path::{Path, PathBuf};

use tracing::debug;

/// `path` with `.{suffix}` appended to its file name, e.g. `a.xml.bz2` -> `a.xml.bz2.tmp`
pub fn sibling(path: &Path, suffix: &str) -> PathBuf {
    let mut name = path.as_os_str().to_owned();
    name.push(".");
    name.push(suffix);
    PathBuf::from(name)
}

/// Move a file or directory tree, falling back to copy and delete across filesystems
pub async fn recursive_move(src: &Path, dest: &Path) -> io::Result<()> {
    debug!(from = ?src, to = ?dest, "Moving path");

    if let Some(parent) = dest.parent() {
        tokio::fs::create_dir_all(parent).await?;
    }

    // Try atomic rename (fast path)
    if tokio::fs::rename(src, dest).await.is_ok() {
        return Ok(());
    }

    if src.is_dir() {
        tokio::fs::create_dir_all(dest).await?;

        for entry in jwalk::WalkDir::new(src).sort(true).into_iter() {
            let entry = entry.map_err(io::Error::other)?;
            let path = entry.path();
            let Ok(relative) = path.strip_prefix(src) else {
                continue;
            };
            let dest_path = dest.join(relative);

            if entry.file_type().is_dir() {
                tokio::fs::create_dir_all(&dest_path).await?;
            } else if tokio::fs::rename(&path, &dest_path).await.is_err() {
                tokio::fs::copy(&path, &dest_path).await?;
                tokio::fs::remove_file(&path).await?;
            }
        }

        tokio::fs::remove_dir_all(src).await?;
    } else {
        tokio::fs::copy(src, dest).await?;
        tokio::fs::remove_file(src).await?;
    }

    debug!(from = ?src, to = ?dest, "Path moved successfully");
    Ok(())
}
