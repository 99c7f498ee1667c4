use anyhow::{Context, Result};
use std::path::Path;
use tracing::warn;

/// Copy `{library_root}/{relative_path}/cover.jpg` into
/// `{content_dir}/covers/{id}.jpg` and return its public URL path.
/// When the destination is already at least as new as the source, it is
/// reused without copying. Returns `Ok(None)` when the book has no cover.
pub async fn copy_cover(
    library_root: &Path,
    relative_path: &str,
    id: i64,
    content_dir: &Path,
) -> Result<Option<String>> {
    let source = library_root.join(relative_path).join("cover.jpg");
    let source_meta = match tokio::fs::metadata(&source).await {
        Ok(meta) if meta.is_file() => meta,
        _ => return Ok(None),
    };

    let covers_dir = content_dir.join("covers");
    tokio::fs::create_dir_all(&covers_dir)
        .await
        .with_context(|| format!("failed to create covers dir: {}", covers_dir.display()))?;

    let dest = covers_dir.join(format!("{id}.jpg"));
    let url = format!("/covers/{id}.jpg");
    if let Ok(dest_meta) = tokio::fs::metadata(&dest).await {
        if let (Ok(dst), Ok(src)) = (dest_meta.modified(), source_meta.modified()) {
            if dst >= src {
                return Ok(Some(url));
            }
        }
    }

    tokio::fs::copy(&source, &dest)
        .await
        .with_context(|| format!("failed to copy cover {}", source.display()))?;
    Ok(Some(url))
}

/// Best-effort variant used during snapshots: failures are logged and yield `None`.
pub async fn cover_url(
    library_root: &Path,
    relative_path: &str,
    id: i64,
    content_dir: &Path,
) -> Option<String> {
    match copy_cover(library_root, relative_path, id, content_dir).await {
        Ok(url) => url,
        Err(err) => {
            warn!(?err, id, "cover copy failed");
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[tokio::test]
    async fn copies_cover_and_returns_url() {
        let lib = tempdir().unwrap();
        let content = tempdir().unwrap();
        let book_dir = lib.path().join("Frank Herbert/Dune (1)");
        std::fs::create_dir_all(&book_dir).unwrap();
        std::fs::write(book_dir.join("cover.jpg"), b"jpeg").unwrap();

        let url = copy_cover(lib.path(), "Frank Herbert/Dune (1)", 1, content.path())
            .await
            .unwrap();
        assert_eq!(url.as_deref(), Some("/covers/1.jpg"));
        let copied = std::fs::read(content.path().join("covers/1.jpg")).unwrap();
        assert_eq!(copied, b"jpeg");
    }

    #[tokio::test]
    async fn newer_destination_is_left_alone() {
        let lib = tempdir().unwrap();
        let content = tempdir().unwrap();
        let book_dir = lib.path().join("book");
        std::fs::create_dir_all(&book_dir).unwrap();
        std::fs::write(book_dir.join("cover.jpg"), b"old source").unwrap();

        let covers = content.path().join("covers");
        std::fs::create_dir_all(&covers).unwrap();
        std::thread::sleep(std::time::Duration::from_millis(20));
        std::fs::write(covers.join("5.jpg"), b"kept").unwrap();

        let url = copy_cover(lib.path(), "book", 5, content.path()).await.unwrap();
        assert_eq!(url.as_deref(), Some("/covers/5.jpg"));
        assert_eq!(std::fs::read(covers.join("5.jpg")).unwrap(), b"kept");
    }

    #[tokio::test]
    async fn missing_cover_yields_none() {
        let lib = tempdir().unwrap();
        let content = tempdir().unwrap();
        assert!(cover_url(lib.path(), "nowhere", 3, content.path())
            .await
            .is_none());
    }
}
