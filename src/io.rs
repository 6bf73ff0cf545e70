use bytes::{Bytes, BytesMut};
use std::cmp::min;
use std::io::SeekFrom;
use std::marker::PhantomData;
use std::path::{Path, PathBuf};
use tokio::io::{AsyncReadExt, AsyncSeekExt, AsyncWriteExt};

/// Returned by [`RangeBuffer::write`] once the write cursor reached the logical length.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BufferFull;

/// Fixed size staging buffer.
///
/// The length of the backing `BytesMut` is the logical length of the buffer.
/// `filled` marks how much of it holds valid data and `cursor` is where the next
/// write lands. `cursor <= filled <= len` holds at all times.
///
/// A full buffer never grows on its own: writes fail with [`BufferFull`] until the
/// owner drains, takes or clears it.
#[derive(Debug)]
pub struct RangeBuffer {
    data: BytesMut,
    cursor: usize,
    filled: usize,
}

impl RangeBuffer {
    pub fn with_len(len: usize) -> Self {
        Self {
            data: BytesMut::zeroed(len),
            cursor: 0,
            filled: 0,
        }
    }

    /// Copies as much of `buf` as fits between the cursor and the end of the buffer.
    pub fn write(&mut self, buf: &[u8]) -> Result<usize, BufferFull> {
        if self.cursor == self.data.len() {
            return Err(BufferFull);
        }
        let n = min(buf.len(), self.data.len() - self.cursor);
        self.data[self.cursor..self.cursor + n].copy_from_slice(&buf[..n]);
        self.cursor += n;
        self.filled = self.filled.max(self.cursor);
        Ok(n)
    }

    /// Changes the logical length, keeping the common prefix and zero-filling any
    /// newly exposed region.
    pub fn resize(&mut self, len: usize) {
        self.data.resize(len, 0);
        self.filled = min(self.filled, len);
        self.cursor = min(self.cursor, len);
    }

    /// Removes the first `n` filled bytes and shifts the remainder to the front.
    pub fn drain(&mut self, n: usize) {
        let n = min(n, self.filled);
        if n == 0 {
            return;
        }
        self.data.copy_within(n..self.filled, 0);
        self.filled -= n;
        self.cursor = self.cursor.saturating_sub(n);
    }

    /// Moves the write cursor, `pos` must not point past the filled region.
    pub fn set_cursor(&mut self, pos: usize) -> bool {
        if pos > self.filled {
            return false;
        }
        self.cursor = pos;
        true
    }

    /// Hands out the filled bytes and leaves an empty buffer of the same length behind.
    pub fn take(&mut self) -> Bytes {
        let len = self.data.len();
        let out = self.data.split_to(self.filled).freeze();
        self.data.clear();
        self.data.resize(len, 0);
        self.cursor = 0;
        self.filled = 0;
        out
    }

    pub fn clear(&mut self) {
        self.cursor = 0;
        self.filled = 0;
    }

    pub fn as_slice(&self) -> &[u8] {
        &self.data[..self.filled]
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn filled(&self) -> usize {
        self.filled
    }

    pub fn cursor(&self) -> usize {
        self.cursor
    }

    pub fn is_empty(&self) -> bool {
        self.filled == 0
    }

    pub fn is_full(&self) -> bool {
        self.cursor == self.data.len()
    }
}

trait Readable {}
trait Writable {}

pub struct ReadOnly;
impl Readable for ReadOnly {}

pub struct WriteOnly;
impl Writable for WriteOnly {}

/// `tokio::fs::File` restricted to one direction by its marker type.
pub(crate) struct TokioFile<M> {
    file: tokio::fs::File,
    path: PathBuf,
    _phantom_data: PhantomData<M>,
}

impl TokioFile<WriteOnly> {
    pub async fn create<P: AsRef<Path>>(path: P) -> std::io::Result<Self> {
        let path = path.as_ref().to_path_buf();
        let file = tokio::fs::File::create(&path).await?;
        Ok(Self {
            file,
            path,
            _phantom_data: PhantomData,
        })
    }
}

impl TokioFile<ReadOnly> {
    pub async fn open<P: AsRef<Path>>(path: P) -> std::io::Result<Self> {
        let path = path.as_ref().to_path_buf();
        let file = tokio::fs::File::open(&path).await?;
        Ok(Self {
            file,
            path,
            _phantom_data: PhantomData,
        })
    }
}

impl<M> TokioFile<M> {
    pub async fn metadata(&self) -> std::io::Result<std::fs::Metadata> {
        self.file.metadata().await
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub async fn seek(&mut self, pos: SeekFrom) -> std::io::Result<u64> {
        self.file.seek(pos).await
    }
}

impl<M: Readable> TokioFile<M> {
    pub async fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
        self.file.read(buf).await
    }

    /// Positional read through a second handle, the cursor of this one stays put.
    pub async fn read_at(&self, buf: &mut [u8], offset: u64) -> std::io::Result<usize> {
        let mut file = tokio::fs::File::open(&self.path).await?;
        file.seek(SeekFrom::Start(offset)).await?;
        let mut read = 0;
        while read < buf.len() {
            let n = file.read(&mut buf[read..]).await?;
            if n == 0 {
                break;
            }
            read += n;
        }
        Ok(read)
    }
}

impl<M: Writable> TokioFile<M> {
    pub async fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        self.file.write_all(buf).await?;
        Ok(buf.len())
    }

    pub async fn flush(&mut self) -> std::io::Result<()> {
        self.file.flush().await
    }

    pub async fn close(mut self) -> std::io::Result<()> {
        self.file.flush().await?;
        self.file.sync_all().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn write_stops_at_logical_length() {
        let mut buf = RangeBuffer::with_len(8);
        assert_eq!(buf.write(b"hello"), Ok(5));
        assert_eq!(buf.write(b"world"), Ok(3));
        assert!(buf.is_full());
        assert_eq!(buf.write(b"!"), Err(BufferFull));
        assert_eq!(buf.as_slice(), b"hellowor");
    }

    #[test]
    fn resize_keeps_prefix_and_zero_fills() {
        let mut buf = RangeBuffer::with_len(4);
        buf.write(b"abcd").unwrap();
        buf.resize(2);
        assert_eq!(buf.as_slice(), b"ab");
        assert_eq!(buf.len(), 2);

        buf.resize(6);
        assert_eq!(buf.len(), 6);
        assert_eq!(buf.filled(), 2);
        assert_eq!(buf.write(b"cd"), Ok(2));
        assert_eq!(buf.as_slice(), b"abcd");
        buf.set_cursor(4);
        assert_eq!(buf.write(b"ef"), Ok(2));
        assert_eq!(buf.as_slice(), b"abcdef");
    }

    #[test]
    fn resize_exposes_zeroes() {
        let mut buf = RangeBuffer::with_len(4);
        buf.write(b"xyzw").unwrap();
        buf.resize(2);
        buf.resize(4);
        assert_eq!(&buf.data[..], b"xy\0\0");
        assert_eq!(buf.as_slice(), b"xy");
    }

    #[test]
    fn drain_shifts_remainder_to_front() {
        let mut buf = RangeBuffer::with_len(10);
        buf.write(b"0123456789").unwrap();
        buf.drain(4);
        assert_eq!(buf.as_slice(), b"456789");
        assert_eq!(buf.cursor(), 6);
        assert_eq!(buf.write(b"ab"), Ok(2));
        assert_eq!(buf.as_slice(), b"456789ab");

        buf.drain(100);
        assert!(buf.is_empty());
        assert_eq!(buf.cursor(), 0);
    }

    #[test]
    fn set_cursor_overwrites_inside_filled_region() {
        let mut buf = RangeBuffer::with_len(8);
        buf.write(b"abcdef").unwrap();
        assert!(!buf.set_cursor(7));
        assert!(buf.set_cursor(2));
        buf.write(b"XY").unwrap();
        assert_eq!(buf.as_slice(), b"abXYef");
        assert_eq!(buf.filled(), 6);
        assert_eq!(buf.cursor(), 4);
    }

    #[test]
    fn take_resets_buffer() {
        let mut buf = RangeBuffer::with_len(4);
        buf.write(b"abc").unwrap();
        let out = buf.take();
        assert_eq!(out.as_ref(), b"abc");
        assert!(buf.is_empty());
        assert_eq!(buf.len(), 4);
        assert_eq!(buf.write(b"wxyz"), Ok(4));
        assert_eq!(buf.as_slice(), b"wxyz");
    }
}
