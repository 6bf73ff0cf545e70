pub mod local;
pub mod object;

use crate::backend::local::{LocalFs, LocalReader, LocalWriter};
use crate::backend::object::{ObjectFs, ObjectReader, ObjectWriter};
use crate::error::{Error, Result};
use crate::metadata::{Entry, ObjectMetadata};
use futures::stream::BoxStream;
use futures::StreamExt;
use std::future::Future;
use std::io::SeekFrom;
use url::Url;

pub trait Stream: futures::Stream + Send + Unpin {}
impl<T> Stream for T where T: futures::Stream + Send + Unpin {}

/// A storage backend addressed by paths below its root.
pub trait Filesystem: Send + Sync {
    type Reader: Send;
    type Writer: Send;

    /// Scheme this backend is registered under.
    fn name(&self) -> &str;
    fn root(&self) -> &str;

    fn open(&self, path: &str) -> impl Future<Output = Result<Self::Reader>> + Send;
    fn create(&self, path: &str) -> impl Future<Output = Result<Self::Writer>> + Send;
    fn remove(&self, path: &str) -> impl Future<Output = Result<()>> + Send;
    fn remove_all(&self, path: &str) -> impl Future<Output = Result<()>> + Send;
    fn stat(&self, path: &str) -> impl Future<Output = Result<ObjectMetadata>> + Send;
    fn list_dir(&self, path: &str) -> impl Future<Output = Result<Vec<Entry>>> + Send;

    /// Every entry below `root`. `depth` limits how many levels are descended,
    /// `None` walks the whole tree.
    fn walk(
        &self,
        root: &str,
        depth: Option<usize>,
    ) -> impl Future<Output = Result<impl Stream<Item = Result<Entry>> + 'static>> + Send;
}

/// Runtime selected backend.
#[derive(Clone)]
pub enum Backend {
    Local(LocalFs),
    Object(ObjectFs),
}

impl From<LocalFs> for Backend {
    fn from(value: LocalFs) -> Self {
        Self::Local(value)
    }
}

impl From<ObjectFs> for Backend {
    fn from(value: ObjectFs) -> Self {
        Self::Object(value)
    }
}

impl Backend {
    pub fn name(&self) -> &str {
        match self {
            Self::Local(fs) => fs.name(),
            Self::Object(fs) => fs.name(),
        }
    }

    pub fn root(&self) -> &str {
        match self {
            Self::Local(fs) => fs.root(),
            Self::Object(fs) => fs.root(),
        }
    }

    pub async fn open(&self, path: &str) -> Result<ReadStream> {
        Ok(match self {
            Self::Local(fs) => ReadStream::Local(fs.open(path).await?),
            Self::Object(fs) => ReadStream::Object(fs.open(path).await?),
        })
    }

    pub async fn create(&self, path: &str) -> Result<WriteStream> {
        Ok(match self {
            Self::Local(fs) => WriteStream::Local(fs.create(path).await?),
            Self::Object(fs) => WriteStream::Object(fs.create(path).await?),
        })
    }

    pub async fn remove(&self, path: &str) -> Result<()> {
        match self {
            Self::Local(fs) => fs.remove(path).await,
            Self::Object(fs) => fs.remove(path).await,
        }
    }

    pub async fn remove_all(&self, path: &str) -> Result<()> {
        match self {
            Self::Local(fs) => fs.remove_all(path).await,
            Self::Object(fs) => fs.remove_all(path).await,
        }
    }

    pub async fn stat(&self, path: &str) -> Result<ObjectMetadata> {
        match self {
            Self::Local(fs) => fs.stat(path).await,
            Self::Object(fs) => fs.stat(path).await,
        }
    }

    pub async fn list_dir(&self, path: &str) -> Result<Vec<Entry>> {
        match self {
            Self::Local(fs) => fs.list_dir(path).await,
            Self::Object(fs) => fs.list_dir(path).await,
        }
    }

    pub async fn walk(
        &self,
        root: &str,
        depth: Option<usize>,
    ) -> Result<BoxStream<'static, Result<Entry>>> {
        Ok(match self {
            Self::Local(fs) => fs.walk(root, depth).await?.boxed(),
            Self::Object(fs) => fs.walk(root, depth).await?.boxed(),
        })
    }
}

/// Readable handle returned by [`Backend::open`].
pub enum ReadStream {
    Local(LocalReader),
    Object(ObjectReader),
}

impl ReadStream {
    pub async fn read(&mut self, buf: &mut [u8]) -> Result<usize> {
        match self {
            Self::Local(r) => r.read(buf).await,
            Self::Object(r) => r.read(buf).await,
        }
    }

    /// Positional read, the stream position is left unchanged.
    pub async fn read_at(&self, buf: &mut [u8], offset: u64) -> Result<usize> {
        match self {
            Self::Local(r) => r.read_at(buf, offset).await,
            Self::Object(r) => r.read_at(buf, offset).await,
        }
    }

    /// Reads until the end of the stream.
    pub async fn read_to_end(&mut self, out: &mut Vec<u8>) -> Result<usize> {
        let mut buf = vec![0; 64 * 1024];
        let mut total = 0;
        loop {
            let n = self.read(&mut buf).await?;
            if n == 0 {
                return Ok(total);
            }
            out.extend_from_slice(&buf[..n]);
            total += n;
        }
    }

    pub async fn seek(&mut self, pos: SeekFrom) -> Result<u64> {
        match self {
            Self::Local(r) => r.seek(pos).await,
            Self::Object(r) => r.seek(pos),
        }
    }

    pub fn close(&mut self) -> Result<()> {
        match self {
            Self::Local(r) => r.close(),
            Self::Object(r) => r.close(),
        }
    }

    pub async fn stat(&mut self) -> Result<ObjectMetadata> {
        match self {
            Self::Local(r) => r.stat().await,
            Self::Object(r) => r.stat().await,
        }
    }

    pub fn url(&self) -> Result<Url> {
        match self {
            Self::Local(r) => r.url(),
            Self::Object(r) => r.url(),
        }
    }
}

/// Writable handle returned by [`Backend::create`].
///
/// Nothing is guaranteed to be visible at the destination before `close` succeeded.
pub enum WriteStream {
    Local(LocalWriter),
    Object(ObjectWriter),
}

impl WriteStream {
    pub async fn write(&mut self, buf: &[u8]) -> Result<usize> {
        match self {
            Self::Local(w) => w.write(buf).await,
            Self::Object(w) => w.write(buf).await,
        }
    }

    pub async fn write_all(&mut self, mut buf: &[u8]) -> Result<()> {
        while !buf.is_empty() {
            let n = self.write(buf).await?;
            if n == 0 {
                return Err(Error::Io(std::io::ErrorKind::WriteZero.into()));
            }
            buf = &buf[n..];
        }
        Ok(())
    }

    pub async fn flush(&mut self) -> Result<()> {
        match self {
            Self::Local(w) => w.flush().await,
            Self::Object(w) => w.flush().await,
        }
    }

    pub async fn seek(&mut self, pos: SeekFrom) -> Result<u64> {
        match self {
            Self::Local(w) => w.seek(pos).await,
            Self::Object(w) => w.seek(pos),
        }
    }

    pub async fn close(&mut self) -> Result<()> {
        match self {
            Self::Local(w) => w.close().await,
            Self::Object(w) => w.close().await,
        }
    }

    /// Gives up on the file, discarding everything written so far.
    pub async fn cancel(&mut self) -> Result<()> {
        match self {
            Self::Local(w) => w.cancel().await,
            Self::Object(w) => w.cancel().await,
        }
    }

    pub async fn stat(&mut self) -> Result<ObjectMetadata> {
        match self {
            Self::Local(w) => w.stat().await,
            Self::Object(w) => w.stat().await,
        }
    }

    pub fn url(&self) -> Result<Url> {
        match self {
            Self::Local(w) => w.url(),
            Self::Object(w) => w.url(),
        }
    }
}

/// Either direction of an open file, as handed out by url based lookups.
pub enum File {
    Read(ReadStream),
    Write(WriteStream),
}

impl From<ReadStream> for File {
    fn from(value: ReadStream) -> Self {
        Self::Read(value)
    }
}

impl From<WriteStream> for File {
    fn from(value: WriteStream) -> Self {
        Self::Write(value)
    }
}

impl File {
    fn reader(&mut self) -> Result<&mut ReadStream> {
        match self {
            Self::Read(r) => Ok(r),
            Self::Write(_) => Err(Error::WrongDirection("reading")),
        }
    }

    fn writer(&mut self) -> Result<&mut WriteStream> {
        match self {
            Self::Write(w) => Ok(w),
            Self::Read(_) => Err(Error::WrongDirection("writing")),
        }
    }

    pub fn into_reader(self) -> Result<ReadStream> {
        match self {
            Self::Read(r) => Ok(r),
            Self::Write(_) => Err(Error::WrongDirection("reading")),
        }
    }

    pub fn into_writer(self) -> Result<WriteStream> {
        match self {
            Self::Write(w) => Ok(w),
            Self::Read(_) => Err(Error::WrongDirection("writing")),
        }
    }

    pub async fn read(&mut self, buf: &mut [u8]) -> Result<usize> {
        self.reader()?.read(buf).await
    }

    pub async fn read_at(&mut self, buf: &mut [u8], offset: u64) -> Result<usize> {
        self.reader()?.read_at(buf, offset).await
    }

    pub async fn write(&mut self, buf: &[u8]) -> Result<usize> {
        self.writer()?.write(buf).await
    }

    pub async fn flush(&mut self) -> Result<()> {
        self.writer()?.flush().await
    }

    pub async fn seek(&mut self, pos: SeekFrom) -> Result<u64> {
        match self {
            Self::Read(r) => r.seek(pos).await,
            Self::Write(w) => w.seek(pos).await,
        }
    }

    pub async fn close(&mut self) -> Result<()> {
        match self {
            Self::Read(r) => r.close(),
            Self::Write(w) => w.close().await,
        }
    }

    pub async fn stat(&mut self) -> Result<ObjectMetadata> {
        match self {
            Self::Read(r) => r.stat().await,
            Self::Write(w) => w.stat().await,
        }
    }

    pub fn url(&self) -> Result<Url> {
        match self {
            Self::Read(r) => r.url(),
            Self::Write(w) => w.url(),
        }
    }
}

/// Copies everything left in `reader` into `writer` and closes both.
///
/// On failure the writer is cancelled so no partial file or pending upload
/// stays behind, and the original error is returned.
pub async fn copy(reader: &mut ReadStream, writer: &mut WriteStream) -> Result<u64> {
    async fn pump(reader: &mut ReadStream, writer: &mut WriteStream) -> Result<u64> {
        let mut buf = vec![0; 1024 * 1024];
        let mut copied = 0u64;
        loop {
            let n = reader.read(&mut buf).await?;
            if n == 0 {
                break;
            }
            writer.write_all(&buf[..n]).await?;
            copied += n as u64;
        }
        writer.close().await?;
        Ok(copied)
    }

    match pump(reader, writer).await {
        Ok(copied) => {
            reader.close()?;
            Ok(copied)
        }
        Err(err) => {
            if let Err(cancel_err) = writer.cancel().await {
                tracing::warn!(error = %cancel_err, "cancelling the destination failed");
            }
            Err(err)
        }
    }
}
