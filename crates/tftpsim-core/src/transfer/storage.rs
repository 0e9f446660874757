//! Local byte sources and destinations for transfers.

use crate::BLOCK_SIZE;
use async_trait::async_trait;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::fs::{self, File, OpenOptions};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWriteExt, BufWriter};
use tokio::sync::Mutex;
use tracing::debug;

/// Byte stream a sending transfer reads from
pub type BoxedSource = Box<dyn AsyncRead + Send + Unpin>;

/// Fill `buf` from `source`, stopping early only at end of input.
///
/// Returns the number of bytes read; fewer than `BLOCK_SIZE` means the
/// source is exhausted.
pub async fn read_block<R>(source: &mut R, buf: &mut [u8; BLOCK_SIZE]) -> io::Result<usize>
where
    R: AsyncRead + Unpin + ?Sized,
{
    let mut filled = 0;
    while filled < BLOCK_SIZE {
        let n = source.read(&mut buf[filled..]).await?;
        if n == 0 {
            break;
        }
        filled += n;
    }
    Ok(filled)
}

/// Sink for received blocks
#[async_trait]
pub trait Destination: Send {
    /// Append one block's payload
    async fn write_block(&mut self, data: &[u8]) -> io::Result<()>;

    /// Flush and close after the last block
    async fn finish(&mut self) -> io::Result<()>;

    /// Throw away whatever was written (transfer aborted)
    async fn discard(&mut self) -> io::Result<()>;
}

/// File-backed destination
pub struct FileDestination {
    path: PathBuf,
    writer: Option<BufWriter<File>>,
}

impl FileDestination {
    /// Create or truncate `path`
    pub async fn create(path: impl AsRef<Path>) -> io::Result<Self> {
        let path = path.as_ref().to_path_buf();
        let file = File::create(&path).await?;
        Ok(Self::from_file(path, file))
    }

    /// Create `path`, failing with `AlreadyExists` if it is present
    pub async fn create_new(path: impl AsRef<Path>) -> io::Result<Self> {
        let path = path.as_ref().to_path_buf();
        let file = OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(&path)
            .await?;
        Ok(Self::from_file(path, file))
    }

    fn from_file(path: PathBuf, file: File) -> Self {
        Self {
            path,
            writer: Some(BufWriter::new(file)),
        }
    }

    /// Target path
    pub fn path(&self) -> &Path {
        &self.path
    }

    fn writer(&mut self) -> io::Result<&mut BufWriter<File>> {
        self.writer
            .as_mut()
            .ok_or_else(|| io::Error::new(io::ErrorKind::BrokenPipe, "destination already closed"))
    }
}

#[async_trait]
impl Destination for FileDestination {
    async fn write_block(&mut self, data: &[u8]) -> io::Result<()> {
        self.writer()?.write_all(data).await
    }

    async fn finish(&mut self) -> io::Result<()> {
        if let Some(mut writer) = self.writer.take() {
            writer.flush().await?;
            writer.get_mut().sync_all().await?;
        }
        Ok(())
    }

    async fn discard(&mut self) -> io::Result<()> {
        self.writer = None;
        match fs::remove_file(&self.path).await {
            Ok(()) => {
                debug!(path = %self.path.display(), "removed partial output");
                Ok(())
            }
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e),
        }
    }
}

/// Buffer shared between a [`MemoryDestination`] and its owner
pub type SharedBuffer = Arc<Mutex<Vec<u8>>>;

/// In-memory destination
#[derive(Debug, Clone, Default)]
pub struct MemoryDestination {
    buffer: SharedBuffer,
}

impl MemoryDestination {
    /// Create a destination and hand back the buffer it fills
    pub fn new() -> (Self, SharedBuffer) {
        let buffer = SharedBuffer::default();
        (
            Self {
                buffer: buffer.clone(),
            },
            buffer,
        )
    }
}

#[async_trait]
impl Destination for MemoryDestination {
    async fn write_block(&mut self, data: &[u8]) -> io::Result<()> {
        self.buffer.lock().await.extend_from_slice(data);
        Ok(())
    }

    async fn finish(&mut self) -> io::Result<()> {
        Ok(())
    }

    async fn discard(&mut self) -> io::Result<()> {
        self.buffer.lock().await.clear();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[tokio::test]
    async fn test_read_block_sizes() {
        let data = vec![7u8; 600];
        let mut source: BoxedSource = Box::new(std::io::Cursor::new(data));
        let mut buf = [0u8; BLOCK_SIZE];

        assert_eq!(read_block(&mut source, &mut buf).await.unwrap(), 512);
        assert_eq!(read_block(&mut source, &mut buf).await.unwrap(), 88);
        assert_eq!(read_block(&mut source, &mut buf).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_read_block_from_trickling_source() {
        // duplex halves deliver at most what was written so far
        let (mut tx, mut rx) = tokio::io::duplex(64);
        tokio::spawn(async move {
            for _ in 0..10 {
                tx.write_all(&[1u8; 60]).await.unwrap();
            }
        });
        let mut buf = [0u8; BLOCK_SIZE];
        assert_eq!(read_block(&mut rx, &mut buf).await.unwrap(), 512);
        assert_eq!(read_block(&mut rx, &mut buf).await.unwrap(), 88);
    }

    #[tokio::test]
    async fn test_file_destination_finish() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("out.bin");

        let mut dest = FileDestination::create(&path).await.unwrap();
        dest.write_block(b"hello ").await.unwrap();
        dest.write_block(b"world").await.unwrap();
        dest.finish().await.unwrap();

        assert_eq!(tokio::fs::read(&path).await.unwrap(), b"hello world");
        assert!(dest.write_block(b"late").await.is_err());
    }

    #[tokio::test]
    async fn test_file_destination_discard() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("partial.bin");

        let mut dest = FileDestination::create(&path).await.unwrap();
        dest.write_block(&[0u8; 512]).await.unwrap();
        dest.discard().await.unwrap();
        assert!(!path.exists());

        // discarding twice is harmless
        dest.discard().await.unwrap();
    }

    #[tokio::test]
    async fn test_create_new_refuses_existing() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("exists.txt");
        std::fs::write(&path, b"x").unwrap();

        let err = FileDestination::create_new(&path).await.err().unwrap();
        assert_eq!(err.kind(), io::ErrorKind::AlreadyExists);
    }

    #[tokio::test]
    async fn test_memory_destination() {
        let (mut dest, buffer) = MemoryDestination::new();
        dest.write_block(b"abc").await.unwrap();
        dest.write_block(b"def").await.unwrap();
        assert_eq!(*buffer.lock().await, b"abcdef");

        dest.discard().await.unwrap();
        assert!(buffer.lock().await.is_empty());
    }
}
