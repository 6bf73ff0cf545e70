use super::object_url;
use crate::error::{Error, Result};
use crate::io::RangeBuffer;
use crate::metadata::{MetadataSlot, ObjectMetadata};
use crate::store::ObjectStoreRef;
use std::cmp::min;
use std::io::SeekFrom;
use tracing::instrument;
use url::Url;

/// Upper bound of bytes requested from the store by a single `read`.
pub const CHUNK_SIZE: usize = 5 * 1024 * 1024;

/// Read-only stream over a remote object.
///
/// Sequential reads go through a staging buffer that is refilled with at most one
/// range request per call. Positional reads bypass it entirely.
pub struct ObjectReader {
    store: Option<ObjectStoreRef>,
    scheme: String,
    bucket: String,
    key: String,
    cursor: u64,
    size: u64,
    metadata: MetadataSlot,
    /// holds the bytes at `cursor..cursor + staged.filled()`
    staged: RangeBuffer,
}

impl ObjectReader {
    #[instrument(skip(store, scheme))]
    pub(crate) async fn open(
        store: ObjectStoreRef,
        scheme: &str,
        bucket: &str,
        key: &str,
    ) -> Result<Self> {
        let mut metadata = MetadataSlot::default();
        let size = metadata.populate(store.head(bucket, key).await?).size();
        tracing::trace!(size, "object opened for reading");
        Ok(Self {
            store: Some(store),
            scheme: scheme.to_string(),
            bucket: bucket.to_string(),
            key: key.to_string(),
            cursor: 0,
            size,
            metadata,
            staged: RangeBuffer::with_len(0),
        })
    }

    fn store(&self) -> Result<&ObjectStoreRef> {
        self.store.as_ref().ok_or(Error::AlreadyClosed)
    }

    pub fn bucket(&self) -> &str {
        self.bucket.as_str()
    }

    pub fn key(&self) -> &str {
        self.key.as_str()
    }

    pub fn position(&self) -> u64 {
        self.cursor
    }

    pub fn size(&self) -> u64 {
        self.size
    }

    /// Reads into `buf`, returning `0` once the cursor is at or past the end.
    #[instrument(skip(self, buf), fields(key = %self.key, cursor = self.cursor, len = buf.len()))]
    pub async fn read(&mut self, buf: &mut [u8]) -> Result<usize> {
        let store = self.store()?.clone();
        if self.cursor >= self.size || buf.is_empty() {
            return Ok(0);
        }

        let staged = self.staged.filled();
        if staged < buf.len() {
            let from = self.cursor + staged as u64;
            if from < self.size {
                let to = min(from + CHUNK_SIZE as u64, self.size);
                tracing::trace!(from, to, "fetching range");
                let data = store.get_range(&self.bucket, &self.key, from..to).await?;
                if data.is_empty() {
                    return Err(Error::transport(format!(
                        "empty range {}..{} returned for {}",
                        from, to, self.key
                    )));
                }
                self.staged.resize(staged + data.len());
                self.staged
                    .write(&data)
                    .map_err(|_| Error::transport("staging buffer exhausted"))?;
            }
        }

        let n = min(buf.len(), self.staged.filled());
        buf[..n].copy_from_slice(&self.staged.as_slice()[..n]);
        self.staged.drain(n);
        self.cursor += n as u64;
        Ok(n)
    }

    /// Reads the bytes at `offset` with a single range request.
    ///
    /// Neither the cursor nor the staged bytes of sequential reads are touched.
    #[instrument(skip(self, buf), fields(key = %self.key, len = buf.len()))]
    pub async fn read_at(&self, buf: &mut [u8], offset: u64) -> Result<usize> {
        let store = self.store()?;
        if buf.is_empty() || offset >= self.size {
            return Ok(0);
        }
        let end = min(offset + buf.len() as u64, self.size);
        let data = store.get_range(&self.bucket, &self.key, offset..end).await?;
        let n = min(data.len(), buf.len());
        buf[..n].copy_from_slice(&data[..n]);
        Ok(n)
    }

    /// Moves the cursor. Positions past the end are accepted and read as end of stream.
    pub fn seek(&mut self, pos: SeekFrom) -> Result<u64> {
        self.store()?;
        let target = match pos {
            SeekFrom::Start(n) => n,
            SeekFrom::Current(delta) => self
                .cursor
                .checked_add_signed(delta)
                .ok_or(Error::InvalidSeek)?,
            SeekFrom::End(_) => {
                return Err(Error::Unsupported(
                    "seeking relative to the end of a remote object",
                ))
            }
        };

        match target.checked_sub(self.cursor) {
            Some(skip) if skip <= self.staged.filled() as u64 => self.staged.drain(skip as usize),
            _ => self.staged.clear(),
        }
        self.cursor = target;
        Ok(target)
    }

    pub fn close(&mut self) -> Result<()> {
        self.store.take().ok_or(Error::AlreadyClosed)?;
        self.staged.clear();
        self.staged.resize(0);
        Ok(())
    }

    /// Returns the metadata captured at open, probing the store only if there is none.
    pub async fn stat(&mut self) -> Result<ObjectMetadata> {
        if let Some(metadata) = self.metadata.get() {
            return Ok(metadata.clone());
        }
        let metadata = self.store()?.head(&self.bucket, &self.key).await?;
        Ok(self.metadata.populate(metadata).clone())
    }

    pub fn url(&self) -> Result<Url> {
        object_url(&self.scheme, &self.bucket, &self.key)
    }
}
