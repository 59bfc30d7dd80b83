//! Streams a file through SHA-256 to produce its content fingerprint,
//! reporting fractional progress at bounded frequency.

use crate::error::CoreError;
use crate::host::FileSource;
use sha2::{Digest, Sha256};
use std::path::Path;
use std::sync::Arc;
use tokio::io::AsyncReadExt;
use tokio_util::sync::CancellationToken;

const BLOCK_SIZE: usize = 256 * 1024;

pub trait DigestProgressSink: Send + Sync {
    /// Called at most once per integer percentage point.
    fn on_progress(&self, fraction: f64);
}

pub struct NoOpDigestProgress;

impl DigestProgressSink for NoOpDigestProgress {
    fn on_progress(&self, _fraction: f64) {}
}

/// Streams `source` through SHA-256 in fixed-size blocks, feeding a
/// progress sink along the way. Cancellation is observed between blocks
/// so hashing a large file never blocks the enclosing runtime from
/// reacting to a cancel.
pub async fn digest_file(
    host: &Arc<dyn FileSource>,
    source: &Path,
    file_size: u64,
    progress: &dyn DigestProgressSink,
    cancel: &CancellationToken,
) -> Result<String, CoreError> {
    let mut reader = host.open_range(source, 0, file_size).await?;
    let mut hasher = Sha256::new();
    let mut buf = vec![0u8; BLOCK_SIZE];
    let mut read_total: u64 = 0;
    let mut last_reported_percent: i64 = -1;

    loop {
        if cancel.is_cancelled() {
            return Err(CoreError::Cancelled);
        }

        let n = reader.read(&mut buf).await?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
        read_total += n as u64;

        if file_size > 0 {
            let fraction = read_total as f64 / file_size as f64;
            let percent = (fraction * 100.0) as i64;
            if percent != last_reported_percent {
                progress.on_progress(fraction);
                last_reported_percent = percent;
            }
        }
    }

    if file_size == 0 {
        progress.on_progress(1.0);
    }

    Ok(format!("{:x}", hasher.finalize()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::host::LocalFileSource;
    use std::io::Write;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct CountingSink(AtomicUsize);

    impl DigestProgressSink for CountingSink {
        fn on_progress(&self, _fraction: f64) {
            self.0.fetch_add(1, Ordering::SeqCst);
        }
    }

    #[tokio::test]
    async fn digest_is_stable_for_identical_content() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("a.bin");
        let mut f = std::fs::File::create(&path).unwrap();
        f.write_all(&[7u8; 4096]).unwrap();
        drop(f);

        let host: Arc<dyn FileSource> = Arc::new(LocalFileSource);
        let cancel = CancellationToken::new();
        let sink = NoOpDigestProgress;

        let a = digest_file(&host, &path, 4096, &sink, &cancel).await.unwrap();
        let b = digest_file(&host, &path, 4096, &sink, &cancel).await.unwrap();
        assert_eq!(a, b);
        assert_eq!(a.len(), 64);
    }

    #[tokio::test]
    async fn cancellation_is_observed() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("b.bin");
        std::fs::write(&path, vec![1u8; 1024 * 1024]).unwrap();

        let host: Arc<dyn FileSource> = Arc::new(LocalFileSource);
        let cancel = CancellationToken::new();
        cancel.cancel();
        let sink = NoOpDigestProgress;

        let result = digest_file(&host, &path, 1024 * 1024, &sink, &cancel).await;
        assert!(matches!(result, Err(CoreError::Cancelled)));
    }

    #[tokio::test]
    async fn zero_length_file_reports_complete() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("empty.bin");
        std::fs::write(&path, []).unwrap();

        let host: Arc<dyn FileSource> = Arc::new(LocalFileSource);
        let cancel = CancellationToken::new();
        let sink = CountingSink(AtomicUsize::new(0));

        let digest = digest_file(&host, &path, 0, &sink, &cancel).await.unwrap();
        assert_eq!(sink.0.load(Ordering::SeqCst), 1);
        assert!(!digest.is_empty());
    }
}
