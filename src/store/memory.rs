use crate::error::{Error, Result};
use crate::metadata::ObjectMetadata;
use crate::store::{
    CompletedPart, CompletedUpload, ListPage, ListRequest, ObjectStore, DEFAULT_PAGE_SIZE,
};
use crate::Etag;
use async_trait::async_trait;
use bytes::{Bytes, BytesMut};
use chrono::{DateTime, Utc};
use std::collections::{BTreeMap, HashMap};
use std::ops::Range;
use std::sync::atomic::{AtomicUsize, Ordering};
use tokio::sync::Mutex;
use uuid::Uuid;

/// Smallest part S3 accepts for anything but the last part of an upload.
pub const MIN_PART_SIZE: u64 = 5 * 1024 * 1024;

/// Remote calls [`MemoryStore::fail_next`] can make fail.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Fault {
    GetRange,
    UploadPart,
    CompleteMultipart,
}

/// In-process [`ObjectStore`] with S3 style multipart semantics, including the
/// minimum size of non-final parts.
///
/// Counts the requests it serves so callers can check how a stream talks to it,
/// and fails calls on demand.
pub struct MemoryStore {
    inner: Mutex<Inner>,
    page_size: Option<usize>,
    min_part_size: u64,
    range_requests: AtomicUsize,
    part_uploads: AtomicUsize,
    failing_ranges: AtomicUsize,
    failing_parts: AtomicUsize,
    failing_completions: AtomicUsize,
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self {
            inner: Mutex::default(),
            page_size: None,
            min_part_size: MIN_PART_SIZE,
            range_requests: AtomicUsize::new(0),
            part_uploads: AtomicUsize::new(0),
            failing_ranges: AtomicUsize::new(0),
            failing_parts: AtomicUsize::new(0),
            failing_completions: AtomicUsize::new(0),
        }
    }
}

#[derive(Default)]
struct Inner {
    objects: BTreeMap<(String, String), StoredObject>,
    uploads: HashMap<String, PendingUpload>,
}

struct StoredObject {
    data: Bytes,
    etag: Etag,
    modified: DateTime<Utc>,
    part_sizes: Vec<u64>,
}

struct PendingUpload {
    bucket: String,
    key: String,
    parts: BTreeMap<u32, (Bytes, Etag)>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Caps every listing page at `page_size` entries.
    pub fn with_page_size(mut self, page_size: usize) -> Self {
        self.page_size = Some(page_size.max(1));
        self
    }

    /// Lowers the minimum size of non-final parts, `0` accepts any size.
    pub fn with_min_part_size(mut self, min_part_size: u64) -> Self {
        self.min_part_size = min_part_size;
        self
    }

    /// Makes the next `n` calls of the given kind fail with a transport error.
    pub fn fail_next(&self, fault: Fault, n: usize) {
        self.counter(fault).store(n, Ordering::SeqCst);
    }

    fn counter(&self, fault: Fault) -> &AtomicUsize {
        match fault {
            Fault::GetRange => &self.failing_ranges,
            Fault::UploadPart => &self.failing_parts,
            Fault::CompleteMultipart => &self.failing_completions,
        }
    }

    fn injected(&self, fault: Fault) -> Result<()> {
        let armed = self
            .counter(fault)
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if armed {
            return Err(Error::transport(format!("injected {:?} failure", fault)));
        }
        Ok(())
    }

    pub async fn put(&self, bucket: &str, key: &str, data: impl Into<Bytes>) -> Etag {
        let data = data.into();
        let etag = content_hash(&data);
        let mut inner = self.inner.lock().await;
        inner.objects.insert(
            (bucket.to_string(), key.to_string()),
            StoredObject {
                data,
                etag: etag.clone(),
                modified: Utc::now(),
                part_sizes: vec![],
            },
        );
        etag
    }

    pub async fn get(&self, bucket: &str, key: &str) -> Option<Bytes> {
        let inner = self.inner.lock().await;
        inner
            .objects
            .get(&(bucket.to_string(), key.to_string()))
            .map(|o| o.data.clone())
    }

    /// Sizes of the parts the object was assembled from, empty for direct puts.
    pub async fn part_sizes(&self, bucket: &str, key: &str) -> Option<Vec<u64>> {
        let inner = self.inner.lock().await;
        inner
            .objects
            .get(&(bucket.to_string(), key.to_string()))
            .map(|o| o.part_sizes.clone())
    }

    pub async fn pending_uploads(&self) -> usize {
        self.inner.lock().await.uploads.len()
    }

    pub fn range_requests(&self) -> usize {
        self.range_requests.load(Ordering::SeqCst)
    }

    pub fn part_uploads(&self) -> usize {
        self.part_uploads.load(Ordering::SeqCst)
    }
}

fn content_hash(data: &[u8]) -> Etag {
    Etag::from(blake3::hash(data).to_hex().to_string())
}

fn not_found(bucket: &str, key: &str) -> Error {
    Error::NotFound(format!("{}/{}", bucket, key))
}

fn no_such_upload(upload_id: &str) -> Error {
    Error::transport(format!("no such upload: {}", upload_id))
}

#[async_trait]
impl ObjectStore for MemoryStore {
    async fn head(&self, bucket: &str, key: &str) -> Result<ObjectMetadata> {
        let inner = self.inner.lock().await;
        let object = inner
            .objects
            .get(&(bucket.to_string(), key.to_string()))
            .ok_or_else(|| not_found(bucket, key))?;
        Ok(ObjectMetadata::new(
            key,
            object.data.len() as u64,
            Some(object.etag.clone()),
            object.modified,
        ))
    }

    async fn get_range(&self, bucket: &str, key: &str, range: Range<u64>) -> Result<Bytes> {
        self.range_requests.fetch_add(1, Ordering::SeqCst);
        self.injected(Fault::GetRange)?;
        let inner = self.inner.lock().await;
        let object = inner
            .objects
            .get(&(bucket.to_string(), key.to_string()))
            .ok_or_else(|| not_found(bucket, key))?;
        let len = object.data.len() as u64;
        if range.start >= len || range.start >= range.end {
            return Err(Error::transport(format!(
                "range {}..{} not satisfiable for {} bytes",
                range.start, range.end, len
            )));
        }
        let end = range.end.min(len);
        Ok(object.data.slice(range.start as usize..end as usize))
    }

    async fn list(&self, bucket: &str, request: &ListRequest) -> Result<ListPage> {
        let page_size = request
            .max_keys
            .or(self.page_size)
            .unwrap_or(DEFAULT_PAGE_SIZE);
        let resume = request.continuation.as_deref();
        let delimiter = request.delimiter.as_deref().filter(|d| !d.is_empty());

        let inner = self.inner.lock().await;
        let mut page = ListPage::default();
        let mut emitted = 0;
        let mut last = None;

        for ((b, key), object) in inner.objects.iter() {
            if b != bucket || !key.starts_with(request.prefix.as_str()) {
                continue;
            }
            if let Some(after) = request.start_after.as_deref() {
                if key.as_str() <= after {
                    continue;
                }
            }
            if let Some(token) = resume {
                let inside_prefix = delimiter.is_some_and(|d| token.ends_with(d))
                    && key.starts_with(token);
                if key.as_str() <= token || inside_prefix {
                    continue;
                }
            }

            let rolled_up = delimiter.and_then(|d| {
                key[request.prefix.len()..]
                    .find(d)
                    .map(|idx| key[..request.prefix.len() + idx + d.len()].to_string())
            });
            if let Some(prefix) = rolled_up.as_ref() {
                if page.prefixes.last() == Some(prefix) {
                    continue;
                }
            }

            if emitted == page_size {
                page.next = last;
                return Ok(page);
            }
            emitted += 1;

            match rolled_up {
                Some(prefix) => {
                    last = Some(prefix.clone());
                    page.prefixes.push(prefix);
                }
                None => {
                    last = Some(key.clone());
                    page.objects.push(ObjectMetadata::new(
                        key.as_str(),
                        object.data.len() as u64,
                        Some(object.etag.clone()),
                        object.modified,
                    ));
                }
            }
        }

        Ok(page)
    }

    async fn create_multipart(&self, bucket: &str, key: &str) -> Result<String> {
        let upload_id = Uuid::now_v7().to_string();
        let mut inner = self.inner.lock().await;
        inner.uploads.insert(
            upload_id.clone(),
            PendingUpload {
                bucket: bucket.to_string(),
                key: key.to_string(),
                parts: BTreeMap::new(),
            },
        );
        Ok(upload_id)
    }

    async fn upload_part(
        &self,
        bucket: &str,
        key: &str,
        upload_id: &str,
        part_number: u32,
        data: Bytes,
    ) -> Result<Etag> {
        self.part_uploads.fetch_add(1, Ordering::SeqCst);
        self.injected(Fault::UploadPart)?;
        let mut inner = self.inner.lock().await;
        let upload = inner
            .uploads
            .get_mut(upload_id)
            .filter(|u| u.bucket == bucket && u.key == key)
            .ok_or_else(|| no_such_upload(upload_id))?;
        let etag = content_hash(&data);
        upload.parts.insert(part_number, (data, etag.clone()));
        Ok(etag)
    }

    async fn complete_multipart(
        &self,
        bucket: &str,
        key: &str,
        upload_id: &str,
        parts: &[CompletedPart],
    ) -> Result<CompletedUpload> {
        self.injected(Fault::CompleteMultipart)?;
        let mut inner = self.inner.lock().await;
        let upload = inner
            .uploads
            .get(upload_id)
            .filter(|u| u.bucket == bucket && u.key == key)
            .ok_or_else(|| no_such_upload(upload_id))?;
        if parts.is_empty() {
            return Err(Error::transport("multipart upload requires at least one part"));
        }

        let mut data = BytesMut::new();
        let mut part_sizes = Vec::with_capacity(parts.len());
        let mut hasher = blake3::Hasher::new();
        let mut previous = 0;
        for part in parts {
            if part.part_number <= previous {
                return Err(Error::transport("parts not in ascending order"));
            }
            previous = part.part_number;
            let (bytes, etag) = upload
                .parts
                .get(&part.part_number)
                .ok_or_else(|| Error::transport(format!("part {} missing", part.part_number)))?;
            if etag != &part.etag {
                return Err(Error::transport(format!(
                    "etag mismatch for part {}",
                    part.part_number
                )));
            }
            let last = part.part_number == parts[parts.len() - 1].part_number;
            if !last && (bytes.len() as u64) < self.min_part_size {
                return Err(Error::transport(format!(
                    "part {} is smaller than the minimum allowed size",
                    part.part_number
                )));
            }
            hasher.update(etag.as_str().as_bytes());
            data.extend_from_slice(bytes);
            part_sizes.push(bytes.len() as u64);
        }
        let etag = Etag::from(format!("{}-{}", hasher.finalize().to_hex(), parts.len()));

        inner.uploads.remove(upload_id);
        inner.objects.insert(
            (bucket.to_string(), key.to_string()),
            StoredObject {
                data: data.freeze(),
                etag: etag.clone(),
                modified: Utc::now(),
                part_sizes,
            },
        );

        Ok(CompletedUpload {
            bucket: bucket.to_string(),
            key: key.to_string(),
            etag,
        })
    }

    async fn abort_multipart(&self, _bucket: &str, _key: &str, upload_id: &str) -> Result<()> {
        let mut inner = self.inner.lock().await;
        inner
            .uploads
            .remove(upload_id)
            .map(|_| ())
            .ok_or_else(|| no_such_upload(upload_id))
    }

    async fn delete(&self, bucket: &str, key: &str) -> Result<()> {
        let mut inner = self.inner.lock().await;
        inner.objects.remove(&(bucket.to_string(), key.to_string()));
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn keys(store: &MemoryStore, request: ListRequest) -> (Vec<String>, Vec<String>) {
        let mut request = request;
        let mut objects = vec![];
        let mut prefixes = vec![];
        loop {
            let page = store.list("bucket", &request).await.unwrap();
            objects.extend(page.objects.into_iter().map(|o| o.name().to_string()));
            prefixes.extend(page.prefixes);
            match page.next {
                Some(token) => request = request.continuation(Some(token)),
                None => break,
            }
        }
        (objects, prefixes)
    }

    #[tokio::test]
    async fn list_rolls_up_common_prefixes_across_pages() {
        let store = MemoryStore::new().with_page_size(2);
        for key in ["a/1", "a/2", "a/b/3", "a/b/4", "a/c/5", "a/6", "z"] {
            store.put("bucket", key, "x").await;
        }
        store.put("other", "a/7", "x").await;

        let (objects, prefixes) = keys(&store, ListRequest::new("a/").delimiter("/")).await;
        assert_eq!(objects, vec!["a/1", "a/2", "a/6"]);
        assert_eq!(prefixes, vec!["a/b/", "a/c/"]);

        let (objects, prefixes) = keys(&store, ListRequest::new("a/")).await;
        assert_eq!(objects, vec!["a/1", "a/2", "a/6", "a/b/3", "a/b/4", "a/c/5"]);
        assert!(prefixes.is_empty());
    }

    #[tokio::test]
    async fn list_honours_start_after() {
        let store = MemoryStore::new();
        for key in ["k1", "k2", "k3"] {
            store.put("bucket", key, "x").await;
        }
        let (objects, _) = keys(&store, ListRequest::new("k").start_after("k1")).await;
        assert_eq!(objects, vec!["k2", "k3"]);
    }

    #[tokio::test]
    async fn complete_rejects_unknown_parts() {
        let store = MemoryStore::new();
        let upload_id = store.create_multipart("bucket", "key").await.unwrap();
        let etag = store
            .upload_part("bucket", "key", &upload_id, 1, Bytes::from_static(b"abc"))
            .await
            .unwrap();
        let parts = [CompletedPart {
            part_number: 2,
            etag,
            size: 3,
        }];
        let err = store
            .complete_multipart("bucket", "key", &upload_id, &parts)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Transport(_)));
        assert_eq!(store.pending_uploads().await, 1);
        assert!(store.get("bucket", "key").await.is_none());
    }

    async fn upload(store: &MemoryStore, upload_id: &str, sizes: &[usize]) -> Vec<CompletedPart> {
        let mut parts = vec![];
        for (i, size) in sizes.iter().enumerate() {
            let part_number = i as u32 + 1;
            let etag = store
                .upload_part("bucket", "key", upload_id, part_number, vec![0; *size].into())
                .await
                .unwrap();
            parts.push(CompletedPart {
                part_number,
                etag,
                size: *size as u64,
            });
        }
        parts
    }

    #[tokio::test]
    async fn complete_enforces_minimum_part_size() {
        let store = MemoryStore::new();
        let upload_id = store.create_multipart("bucket", "key").await.unwrap();
        let parts = upload(&store, &upload_id, &[10, 5]).await;
        let err = store
            .complete_multipart("bucket", "key", &upload_id, &parts)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Transport(_)));
        assert_eq!(store.pending_uploads().await, 1);

        let upload_id = store.create_multipart("bucket", "key").await.unwrap();
        let parts = upload(&store, &upload_id, &[MIN_PART_SIZE as usize, 5]).await;
        store
            .complete_multipart("bucket", "key", &upload_id, &parts)
            .await
            .unwrap();
        assert_eq!(
            store.part_sizes("bucket", "key").await.unwrap(),
            vec![MIN_PART_SIZE, 5]
        );
    }

    #[tokio::test]
    async fn injected_faults_fail_the_next_calls_only() {
        let store = MemoryStore::new();
        store.put("bucket", "key", "content").await;
        store.fail_next(Fault::GetRange, 2);

        for _ in 0..2 {
            assert!(matches!(
                store.get_range("bucket", "key", 0..3).await,
                Err(Error::Transport(_))
            ));
        }
        assert_eq!(
            store.get_range("bucket", "key", 0..3).await.unwrap().as_ref(),
            b"con"
        );
        assert_eq!(store.range_requests(), 3);
    }
}
