//! Per-request working directories.

use bytes::Bytes;
use futures::Stream;
use std::path::{Path, PathBuf};
use std::pin::Pin;
use std::task::{Context, Poll};
use tokio_util::io::ReaderStream;
use tracing::{debug, warn};

/// Directory owned by one `/infer` request. Removed when dropped.
#[derive(Debug)]
pub struct SessionDir {
    path: PathBuf,
    background: bool,
}

impl SessionDir {
    pub fn create(root: &Path) -> std::io::Result<Self> {
        let path = root.join(uuid::Uuid::new_v4().simple().to_string());
        std::fs::create_dir_all(&path)?;
        debug!(session_dir = %path.display(), "Created session directory");
        Ok(Self {
            path,
            background: false,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Remove on a blocking worker instead of on the dropping thread.
    pub fn cleanup_in_background(mut self) -> Self {
        self.background = true;
        self
    }
}

fn remove(path: &Path) {
    match std::fs::remove_dir_all(path) {
        Ok(()) => debug!(session_dir = %path.display(), "Removed session directory"),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
        Err(e) => warn!(session_dir = %path.display(), error = %e, "Failed to remove session directory"),
    }
}

impl Drop for SessionDir {
    fn drop(&mut self) {
        let path = std::mem::take(&mut self.path);
        if self.background
            && let Ok(runtime) = tokio::runtime::Handle::try_current()
        {
            runtime.spawn_blocking(move || remove(&path));
            return;
        }
        remove(&path);
    }
}

/// Response body streaming a file out of a session directory. The
/// directory goes away once the body is dropped.
pub struct SessionFileStream {
    inner: ReaderStream<tokio::fs::File>,
    _session: SessionDir,
}

impl SessionFileStream {
    pub fn new(file: tokio::fs::File, session: SessionDir) -> Self {
        Self {
            inner: ReaderStream::new(file),
            _session: session.cleanup_in_background(),
        }
    }
}

impl Stream for SessionFileStream {
    type Item = std::io::Result<Bytes>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        Pin::new(&mut self.inner).poll_next(cx)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::StreamExt;
    use std::time::{Duration, Instant};

    #[test]
    fn test_session_removed_on_drop() {
        let root = tempfile::tempdir().unwrap();
        let session = SessionDir::create(root.path()).unwrap();
        let path = session.path().to_path_buf();
        std::fs::write(path.join("image_file.nrrd"), b"x").unwrap();
        assert!(path.is_dir());

        drop(session);
        assert!(!path.exists());
    }

    #[tokio::test]
    async fn test_stream_cleans_up_after_body() {
        let root = tempfile::tempdir().unwrap();
        let session = SessionDir::create(root.path()).unwrap();
        let path = session.path().to_path_buf();
        let file_path = path.join("output-segmentation.nii.gz");
        std::fs::write(&file_path, b"labels").unwrap();

        let file = tokio::fs::File::open(&file_path).await.unwrap();
        let mut stream = SessionFileStream::new(file, session);
        let mut body = Vec::new();
        while let Some(chunk) = stream.next().await {
            body.extend_from_slice(&chunk.unwrap());
        }
        assert_eq!(body, b"labels");
        assert!(path.exists());

        drop(stream);
        let start = Instant::now();
        while path.exists() {
            assert!(start.elapsed() < Duration::from_secs(10));
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    }
}
