//! Local file byte source

use std::io::SeekFrom;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use bytes::{Bytes, BytesMut};
use tokio::fs::{self, File};
use tokio::io::{AsyncReadExt, AsyncSeekExt};
use tokio::sync::{Mutex, OnceCell};

use super::{check_range, ByteRangeSource};
use crate::error::{Error, Result};

/// Byte source over a local file
///
/// The file is opened lazily on first read and kept open until `close()`.
/// The length is read once and assumed not to change.
#[derive(Debug)]
pub struct FileSource {
    path: PathBuf,
    handle: Mutex<Option<File>>,
    size: OnceCell<u64>,
}

impl FileSource {
    pub fn new(path: impl AsRef<Path>) -> Self {
        Self {
            path: path.as_ref().to_path_buf(),
            handle: Mutex::new(None),
            size: OnceCell::new(),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

async fn read_exact_at(file: &mut File, offset: u64, size: u64) -> Result<Bytes> {
    file.seek(SeekFrom::Start(offset)).await?;
    let mut buf = BytesMut::zeroed(size as usize);
    let mut filled = 0;
    while filled < buf.len() {
        let n = file.read(&mut buf[filled..]).await?;
        if n == 0 {
            break;
        }
        filled += n;
    }

    if filled as u64 != size {
        return Err(Error::Integrity {
            expected: size,
            actual: filled as u64,
        });
    }
    Ok(buf.freeze())
}

#[async_trait]
impl ByteRangeSource for FileSource {
    async fn get_bytes(&self, offset: u64, size: u64) -> Result<Bytes> {
        let len = self.count().await?;
        check_range(offset, size, len)?;

        let mut handle = self.handle.lock().await;
        let mut file = match handle.take() {
            Some(file) => file,
            None => File::open(&self.path).await?,
        };
        let result = read_exact_at(&mut file, offset, size).await;
        *handle = Some(file);
        result
    }

    async fn count(&self) -> Result<u64> {
        self.size
            .get_or_try_init(|| async {
                let meta = fs::metadata(&self.path).await?;
                Ok::<_, Error>(meta.len())
            })
            .await
            .copied()
    }

    async fn close(&self) -> Result<()> {
        self.handle.lock().await.take();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn temp_file(contents: &[u8]) -> tempfile::NamedTempFile {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(contents).unwrap();
        file.flush().unwrap();
        file
    }

    #[tokio::test]
    async fn test_file_source_reads() {
        let file = temp_file(b"0123456789");
        let source = FileSource::new(file.path());

        assert_eq!(source.count().await.unwrap(), 10);
        assert_eq!(source.get_bytes(3, 4).await.unwrap().as_ref(), b"3456");
        assert_eq!(source.get_bytes(0, 1).await.unwrap().as_ref(), b"0");
        assert!(matches!(
            source.get_bytes(8, 3).await,
            Err(Error::OutOfRange { .. })
        ));
    }

    #[tokio::test]
    async fn test_file_source_short_read() {
        let file = temp_file(b"0123456789");
        let source = FileSource::new(file.path());
        source.count().await.unwrap();

        // Truncated after the size was memoized
        file.as_file().set_len(5).unwrap();

        let err = source.get_bytes(2, 6).await.unwrap_err();
        assert_eq!(err, Error::Integrity { expected: 6, actual: 3 });
    }

    #[tokio::test]
    async fn test_file_source_reopens_after_close() {
        let file = temp_file(b"abcdef");
        let source = FileSource::new(file.path());

        assert_eq!(source.get_bytes(0, 2).await.unwrap().as_ref(), b"ab");
        source.close().await.unwrap();
        assert_eq!(source.get_bytes(4, 2).await.unwrap().as_ref(), b"ef");
    }

    #[tokio::test]
    async fn test_missing_file() {
        let source = FileSource::new("/nonexistent/rangecache/file.bin");
        assert!(matches!(source.count().await, Err(Error::Io(_))));
    }
}
