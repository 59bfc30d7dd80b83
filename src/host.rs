//! Host capability boundary: everything the core needs from the
//! surrounding environment to read a source file's bytes and metadata.
//! Concrete HTTP transport and persistence live in their own modules;
//! this trait only covers local file access, so hosts other than a
//! native filesystem can be plugged in without touching the scheduler.

use crate::error::CoreError;
use futures::future::BoxFuture;
use std::path::Path;
use tokio::fs::File;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncSeekExt, BufReader, ReadBuf, SeekFrom};
use std::pin::Pin;
use std::task::{Context as TaskContext, Poll};

#[derive(Debug, Clone)]
pub struct FileInfo {
    pub name: String,
    pub size: u64,
    pub content_type: String,
    pub last_modified: Option<i64>,
}

/// Capability a host must provide for the engine to read a source file in
/// byte-range pieces. Implemented here for the native filesystem; other
/// hosts (browser File objects, mini-program handles) implement the same
/// trait on the core's behalf. Methods return boxed futures directly
/// (rather than `async fn`) so the trait stays object-safe and schedulers
/// can hold a single `Arc<dyn FileSource>` regardless of host.
pub trait FileSource: Send + Sync {
    fn file_info<'a>(&'a self, source: &'a Path) -> BoxFuture<'a, Result<FileInfo, CoreError>>;

    /// Returns a reader over exactly `[start, end)` bytes of `source`.
    fn open_range<'a>(
        &'a self,
        source: &'a Path,
        start: u64,
        end: u64,
    ) -> BoxFuture<'a, Result<Box<dyn AsyncRead + Send + Unpin>, CoreError>>;
}

pub struct LocalFileSource;

impl FileSource for LocalFileSource {
    fn file_info<'a>(&'a self, source: &'a Path) -> BoxFuture<'a, Result<FileInfo, CoreError>> {
        Box::pin(async move {
            let metadata = tokio::fs::metadata(source).await?;
            let name = source
                .file_name()
                .map(|n| n.to_string_lossy().into_owned())
                .unwrap_or_default();
            let content_type = mime_guess_by_extension(source);
            let last_modified = metadata
                .modified()
                .ok()
                .and_then(|t| t.duration_since(std::time::UNIX_EPOCH).ok())
                .map(|d| d.as_secs() as i64);

            Ok(FileInfo {
                name,
                size: metadata.len(),
                content_type,
                last_modified,
            })
        })
    }

    fn open_range<'a>(
        &'a self,
        source: &'a Path,
        start: u64,
        end: u64,
    ) -> BoxFuture<'a, Result<Box<dyn AsyncRead + Send + Unpin>, CoreError>> {
        Box::pin(async move {
            let file = File::open(source).await?;
            let mut reader = BufReader::with_capacity(RANGE_BUFFER_SIZE, file);
            reader.seek(SeekFrom::Start(start)).await?;
            let boxed: Box<dyn AsyncRead + Send + Unpin> = Box::new(RangeReader {
                reader,
                remaining: end.saturating_sub(start),
            });
            Ok(boxed)
        })
    }
}

const RANGE_BUFFER_SIZE: usize = 64 * 1024;

/// Caps reads to the remaining byte count of one chunk descriptor so a
/// worker can stream a chunk without knowing the underlying file's size.
struct RangeReader {
    reader: BufReader<File>,
    remaining: u64,
}

impl AsyncRead for RangeReader {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut TaskContext<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<std::io::Result<()>> {
        if self.remaining == 0 {
            return Poll::Ready(Ok(()));
        }
        let max_read = (self.remaining as usize).min(buf.remaining());
        let mut limited = buf.take(max_read);
        let before = limited.filled().len();
        let reader = Pin::new(&mut self.reader);
        match reader.poll_read(cx, &mut limited) {
            Poll::Ready(Ok(())) => {
                let read = limited.filled().len() - before;
                unsafe {
                    buf.assume_init(read);
                }
                buf.advance(read);
                self.remaining -= read as u64;
                Poll::Ready(Ok(()))
            }
            other => other,
        }
    }
}

fn mime_guess_by_extension(path: &Path) -> String {
    match path.extension().and_then(|e| e.to_str()) {
        Some("png") => "image/png",
        Some("jpg") | Some("jpeg") => "image/jpeg",
        Some("gif") => "image/gif",
        Some("pdf") => "application/pdf",
        Some("txt") => "text/plain",
        Some("json") => "application/json",
        Some("zip") => "application/zip",
        Some("mp4") => "video/mp4",
        _ => "application/octet-stream",
    }
    .to_string()
}

/// Reads exactly `[start, end)` from a local file into memory. Used by
/// callers that need an owned buffer (multipart chunk bodies) rather than
/// a streaming reader.
pub async fn read_range(path: &Path, start: u64, end: u64) -> Result<Vec<u8>, CoreError> {
    let mut file = File::open(path).await?;
    file.seek(SeekFrom::Start(start)).await?;
    let len = (end - start) as usize;
    let mut buf = vec![0u8; len];
    file.read_exact(&mut buf).await?;
    Ok(buf)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn open_range_yields_exactly_the_requested_bytes() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("f.bin");
        std::fs::write(&path, b"0123456789").unwrap();

        let source = LocalFileSource;
        let mut reader = source.open_range(&path, 2, 6).await.unwrap();
        let mut buf = Vec::new();
        reader.read_to_end(&mut buf).await.unwrap();
        assert_eq!(buf, b"2345");
    }

    #[tokio::test]
    async fn file_info_reports_size_and_name() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("f.json");
        std::fs::write(&path, b"{}").unwrap();

        let source = LocalFileSource;
        let info = source.file_info(&path).await.unwrap();
        assert_eq!(info.size, 2);
        assert_eq!(info.name, "f.json");
        assert_eq!(info.content_type, "application/json");
    }

    #[tokio::test]
    async fn read_range_matches_open_range() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("g.bin");
        std::fs::write(&path, b"abcdefgh").unwrap();

        let bytes = read_range(&path, 3, 7).await.unwrap();
        assert_eq!(bytes, b"defg");
    }
}
