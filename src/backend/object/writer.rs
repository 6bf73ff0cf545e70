use super::object_url;
use crate::error::{Error, Result};
use crate::io::{BufferFull, RangeBuffer};
use crate::metadata::{MetadataSlot, ObjectMetadata};
use crate::store::{CompletedPart, ObjectStoreRef};
use crate::Etag;
use std::io::SeekFrom;
use tracing::instrument;
use url::Url;

/// Size of every committed part except possibly the last one.
pub const PART_SIZE: usize = 5 * 1024 * 1024;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum State {
    Accumulating,
    Completed,
    /// A remote call failed, the multipart session is left as is
    Aborted,
    Cancelled,
}

struct UploadSession {
    upload_id: String,
    next_part: u32,
    parts: Vec<CompletedPart>,
    buffer: RangeBuffer,
    /// stream offset of the first byte in `buffer`
    part_start: u64,
}

/// Write-only stream into a remote object, backed by a multipart upload.
///
/// Bytes are collected into a part sized buffer, every full buffer is uploaded as the
/// next part once more input arrives. `close` uploads the remainder and completes the
/// upload atomically. Nothing is retried and a failed upload is never cleaned up
/// implicitly, see [`ObjectWriter::cancel`].
pub struct ObjectWriter {
    store: ObjectStoreRef,
    scheme: String,
    bucket: String,
    key: String,
    state: State,
    session: UploadSession,
    etag: Option<Etag>,
    metadata: MetadataSlot,
}

impl ObjectWriter {
    #[instrument(skip(store, scheme))]
    pub(crate) async fn create(
        store: ObjectStoreRef,
        scheme: &str,
        bucket: &str,
        key: &str,
    ) -> Result<Self> {
        let upload_id = store.create_multipart(bucket, key).await?;
        tracing::debug!(upload_id = %upload_id, "multipart upload initiated");
        Ok(Self {
            store,
            scheme: scheme.to_string(),
            bucket: bucket.to_string(),
            key: key.to_string(),
            state: State::Accumulating,
            session: UploadSession {
                upload_id,
                next_part: 1,
                parts: vec![],
                buffer: RangeBuffer::with_len(PART_SIZE),
                part_start: 0,
            },
            etag: None,
            metadata: MetadataSlot::default(),
        })
    }

    fn writable(&self) -> Result<ObjectStoreRef> {
        match self.state {
            State::Accumulating => Ok(self.store.clone()),
            State::Aborted => Err(Error::Aborted {
                upload_id: self.session.upload_id.clone(),
            }),
            State::Completed | State::Cancelled => Err(Error::AlreadyClosed),
        }
    }

    pub fn bucket(&self) -> &str {
        self.bucket.as_str()
    }

    pub fn key(&self) -> &str {
        self.key.as_str()
    }

    pub fn upload_id(&self) -> &str {
        self.session.upload_id.as_str()
    }

    /// Parts committed so far, ordered by part number.
    pub fn completed_parts(&self) -> &[CompletedPart] {
        self.session.parts.as_slice()
    }

    /// Content hash of the assembled object, available once `close` succeeded.
    pub fn etag(&self) -> Option<&Etag> {
        self.etag.as_ref()
    }

    pub fn position(&self) -> u64 {
        self.session.part_start + self.session.buffer.cursor() as u64
    }

    /// Buffers all of `data`, committing parts as the buffer runs full.
    #[instrument(skip(self, data), fields(key = %self.key, len = data.len()))]
    pub async fn write(&mut self, data: &[u8]) -> Result<usize> {
        let store = self.writable()?;
        let mut remaining = data;
        while !remaining.is_empty() {
            match self.session.buffer.write(remaining) {
                Ok(n) => remaining = &remaining[n..],
                Err(BufferFull) => self.commit(&store).await?,
            }
        }
        Ok(data.len())
    }

    /// Commits whatever is buffered as a part of its own, even if it is short.
    ///
    /// S3 rejects parts below 5 MiB unless they are the last one, so a short flush
    /// followed by more writes makes `close` fail on completion.
    pub async fn flush(&mut self) -> Result<()> {
        let store = self.writable()?;
        self.commit(&store).await
    }

    async fn commit(&mut self, store: &ObjectStoreRef) -> Result<()> {
        let session = &mut self.session;
        if session.buffer.is_empty() {
            return Ok(());
        }
        let part_number = session.next_part;
        let data = session.buffer.take();
        let size = data.len() as u64;
        tracing::debug!(part_number, size, "committing part");

        match store
            .upload_part(
                &self.bucket,
                &self.key,
                &session.upload_id,
                part_number,
                data,
            )
            .await
        {
            Ok(etag) => {
                session.parts.push(CompletedPart {
                    part_number,
                    etag,
                    size,
                });
                session.next_part += 1;
                session.part_start += size;
                Ok(())
            }
            Err(err) => {
                tracing::warn!(part_number, error = %err, "part upload failed, aborting");
                self.state = State::Aborted;
                Err(err)
            }
        }
    }

    /// Uploads the remaining bytes and completes the multipart upload.
    #[instrument(skip(self), fields(key = %self.key, upload_id = %self.session.upload_id))]
    pub async fn close(&mut self) -> Result<()> {
        let store = self.writable()?;
        self.commit(&store).await?;
        if self.session.parts.is_empty() {
            self.state = State::Aborted;
            return Err(Error::EmptyUpload);
        }

        match store
            .complete_multipart(
                &self.bucket,
                &self.key,
                &self.session.upload_id,
                &self.session.parts,
            )
            .await
        {
            Ok(completed) => {
                tracing::debug!(etag = %completed.etag, parts = self.session.parts.len(), "multipart upload completed");
                self.bucket = completed.bucket;
                self.key = completed.key;
                self.etag = Some(completed.etag);
                self.state = State::Completed;
                Ok(())
            }
            Err(err) => {
                tracing::warn!(error = %err, "completing multipart upload failed");
                self.state = State::Aborted;
                Err(err)
            }
        }
    }

    /// Aborts the remote multipart session, discarding all committed parts.
    pub async fn cancel(&mut self) -> Result<()> {
        match self.state {
            State::Accumulating | State::Aborted => {}
            State::Completed | State::Cancelled => return Err(Error::AlreadyClosed),
        }
        self.store
            .abort_multipart(&self.bucket, &self.key, &self.session.upload_id)
            .await?;
        tracing::debug!(upload_id = %self.session.upload_id, "multipart upload cancelled");
        self.state = State::Cancelled;
        self.session.buffer.clear();
        Ok(())
    }

    /// Repositions the write cursor inside the part that is still buffered.
    ///
    /// Committed parts are immutable, so targets before the buffered part fail, as do
    /// targets past the buffered bytes and any end relative seek.
    pub fn seek(&mut self, pos: SeekFrom) -> Result<u64> {
        self.writable()?;
        let target = match pos {
            SeekFrom::Start(n) => n,
            SeekFrom::Current(delta) => self
                .position()
                .checked_add_signed(delta)
                .ok_or(Error::InvalidSeek)?,
            SeekFrom::End(_) => {
                return Err(Error::Unsupported(
                    "seeking relative to the end of an upload",
                ))
            }
        };

        let offset = target
            .checked_sub(self.session.part_start)
            .ok_or(Error::Unsupported("seeking into an already committed part"))?;
        if offset > self.session.buffer.filled() as u64
            || !self.session.buffer.set_cursor(offset as usize)
        {
            return Err(Error::Unsupported("seeking past the buffered data"));
        }
        Ok(target)
    }

    /// Probes the store, the result is cached once the upload completed.
    pub async fn stat(&mut self) -> Result<ObjectMetadata> {
        if let Some(metadata) = self.metadata.get() {
            return Ok(metadata.clone());
        }
        let metadata = self.store.head(&self.bucket, &self.key).await?;
        if self.state == State::Completed {
            return Ok(self.metadata.populate(metadata).clone());
        }
        Ok(metadata)
    }

    pub fn url(&self) -> Result<Url> {
        object_url(&self.scheme, &self.bucket, &self.key)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::{Fault, MemoryStore};
    use std::sync::Arc;

    async fn writer() -> (Arc<MemoryStore>, ObjectWriter) {
        writer_on(MemoryStore::new()).await
    }

    async fn writer_on(store: MemoryStore) -> (Arc<MemoryStore>, ObjectWriter) {
        let store = Arc::new(store);
        let writer = ObjectWriter::create(store.clone(), "s3", "bucket", "upload")
            .await
            .unwrap();
        (store, writer)
    }

    fn part_numbers(writer: &ObjectWriter) -> Vec<u32> {
        writer
            .completed_parts()
            .iter()
            .map(|p| p.part_number)
            .collect()
    }

    #[tokio::test]
    async fn uneven_writes_are_split_on_part_boundaries() {
        let (store, mut writer) = writer().await;
        for len in [5_000_000, 5_000_000, 2_000_000] {
            assert_eq!(writer.write(&vec![7; len]).await.unwrap(), len);
        }
        assert_eq!(part_numbers(&writer), vec![1, 2]);

        writer.close().await.unwrap();
        assert_eq!(part_numbers(&writer), vec![1, 2, 3]);
        assert_eq!(
            store.part_sizes("bucket", "upload").await.unwrap(),
            vec![PART_SIZE as u64, PART_SIZE as u64, 1_514_240]
        );
        assert!(writer.etag().is_some());
        assert_eq!(store.pending_uploads().await, 0);
    }

    #[tokio::test]
    async fn exact_multiple_commits_no_trailing_part() {
        let (store, mut writer) = writer().await;
        let block = vec![1; 1024 * 1024];
        for _ in 0..(2 * PART_SIZE / block.len()) {
            writer.write(&block).await.unwrap();
        }
        writer.close().await.unwrap();

        assert_eq!(part_numbers(&writer), vec![1, 2]);
        assert_eq!(store.part_uploads(), 2);
        assert_eq!(
            store.get("bucket", "upload").await.unwrap().len(),
            2 * PART_SIZE
        );
    }

    #[tokio::test]
    async fn closing_without_data_is_an_empty_upload() {
        let (store, mut writer) = writer().await;
        assert!(matches!(writer.close().await, Err(Error::EmptyUpload)));
        assert!(matches!(writer.close().await, Err(Error::Aborted { .. })));
        assert!(matches!(
            writer.write(b"late").await,
            Err(Error::Aborted { .. })
        ));

        // the remote session stays until someone cancels it
        assert_eq!(store.pending_uploads().await, 1);
        writer.cancel().await.unwrap();
        assert_eq!(store.pending_uploads().await, 0);
        assert!(matches!(writer.cancel().await, Err(Error::AlreadyClosed)));
    }

    #[tokio::test]
    async fn explicit_flush_commits_short_parts() {
        let (store, mut writer) = writer_on(MemoryStore::new().with_min_part_size(0)).await;
        writer.write(b"0123456789").await.unwrap();
        writer.flush().await.unwrap();
        writer.flush().await.unwrap();
        assert_eq!(store.part_uploads(), 1);

        writer.write(b"abcde").await.unwrap();
        writer.close().await.unwrap();
        assert_eq!(
            store.part_sizes("bucket", "upload").await.unwrap(),
            vec![10, 5]
        );
        assert_eq!(
            store.get("bucket", "upload").await.unwrap().as_ref(),
            b"0123456789abcde"
        );
    }

    #[tokio::test]
    async fn seek_is_limited_to_the_buffered_part() {
        let (store, mut writer) = writer().await;
        let p = PART_SIZE as u64;
        writer.write(&vec![0; PART_SIZE + 10]).await.unwrap();
        assert_eq!(writer.completed_parts().len(), 1);
        assert_eq!(writer.position(), p + 10);

        assert!(matches!(
            writer.seek(SeekFrom::Start(5)),
            Err(Error::Unsupported(_))
        ));
        assert!(matches!(
            writer.seek(SeekFrom::Start(p + 11)),
            Err(Error::Unsupported(_))
        ));
        assert!(matches!(
            writer.seek(SeekFrom::End(0)),
            Err(Error::Unsupported(_))
        ));

        assert_eq!(writer.seek(SeekFrom::Start(p + 3)).unwrap(), p + 3);
        writer.write(b"xyz").await.unwrap();
        assert_eq!(writer.seek(SeekFrom::Current(4)).unwrap(), p + 10);
        writer.write(b"!").await.unwrap();
        writer.close().await.unwrap();

        let data = store.get("bucket", "upload").await.unwrap();
        assert_eq!(data.len(), PART_SIZE + 11);
        assert_eq!(&data[PART_SIZE..], b"\0\0\0xyz\0\0\0\0!");
    }

    #[tokio::test]
    async fn completed_writer_is_closed() {
        let (_store, mut writer) = writer().await;
        writer.write(b"data").await.unwrap();
        writer.close().await.unwrap();

        assert!(matches!(writer.close().await, Err(Error::AlreadyClosed)));
        assert!(matches!(
            writer.write(b"more").await,
            Err(Error::AlreadyClosed)
        ));
        assert!(matches!(writer.flush().await, Err(Error::AlreadyClosed)));

        let first = writer.stat().await.unwrap();
        let second = writer.stat().await.unwrap();
        assert_eq!(first.size(), 4);
        assert_eq!(first.etag(), writer.etag());
        assert_eq!(first.etag(), second.etag());
        assert_eq!(writer.url().unwrap().as_str(), "s3://bucket/upload");
    }

    #[tokio::test]
    async fn stat_before_completion_is_not_found() {
        let (_store, mut writer) = writer().await;
        writer.write(b"pending").await.unwrap();
        assert!(writer.stat().await.unwrap_err().is_not_found());
    }

    #[tokio::test]
    async fn short_flushed_part_fails_completion() {
        let (store, mut writer) = writer().await;
        writer.write(b"0123456789").await.unwrap();
        writer.flush().await.unwrap();
        writer.write(b"abcde").await.unwrap();

        assert!(matches!(writer.close().await, Err(Error::Transport(_))));
        assert!(matches!(writer.close().await, Err(Error::Aborted { .. })));
        assert!(store.get("bucket", "upload").await.is_none());
    }

    #[tokio::test]
    async fn failed_part_upload_aborts_the_writer() {
        let (store, mut writer) = writer().await;
        store.fail_next(Fault::UploadPart, 1);

        // the first byte past a full buffer triggers the commit
        let err = writer.write(&vec![3; PART_SIZE + 1]).await.unwrap_err();
        assert!(matches!(err, Error::Transport(_)));
        assert!(writer.completed_parts().is_empty());

        let upload_id = writer.upload_id().to_string();
        match writer.write(b"more").await {
            Err(Error::Aborted { upload_id: id }) => assert_eq!(id, upload_id),
            other => panic!("expected an aborted writer, got {:?}", other),
        }
        assert!(matches!(writer.flush().await, Err(Error::Aborted { .. })));
        assert!(matches!(writer.close().await, Err(Error::Aborted { .. })));
        assert!(matches!(
            writer.seek(SeekFrom::Start(0)),
            Err(Error::Aborted { .. })
        ));

        assert_eq!(store.pending_uploads().await, 1);
        writer.cancel().await.unwrap();
        assert_eq!(store.pending_uploads().await, 0);
    }

    #[tokio::test]
    async fn failed_completion_keeps_the_session_pending() {
        let (store, mut writer) = writer().await;
        writer.write(b"almost there").await.unwrap();
        store.fail_next(Fault::CompleteMultipart, 1);

        assert!(matches!(writer.close().await, Err(Error::Transport(_))));
        assert_eq!(writer.completed_parts().len(), 1);
        assert!(writer.etag().is_none());
        assert!(matches!(writer.close().await, Err(Error::Aborted { .. })));
        assert!(matches!(
            writer.write(b"x").await,
            Err(Error::Aborted { .. })
        ));

        assert_eq!(store.pending_uploads().await, 1);
        assert!(store.get("bucket", "upload").await.is_none());
    }
}
