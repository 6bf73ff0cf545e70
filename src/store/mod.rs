//! The remote object API consumed by the object backend.
//!
//! Everything speaks in whole byte ranges and atomic parts, turning that into a
//! byte stream is the job of [`crate::backend::object`].

mod memory;
mod s3;

pub use memory::{Fault, MemoryStore, MIN_PART_SIZE};
pub use s3::S3Store;

use crate::error::Result;
use crate::metadata::ObjectMetadata;
use crate::Etag;
use async_trait::async_trait;
use bytes::Bytes;
use std::ops::Range;
use std::sync::Arc;

/// Page size used when a [`ListRequest`] does not set one.
pub const DEFAULT_PAGE_SIZE: usize = 1000;

#[async_trait]
pub trait ObjectStore: Send + Sync {
    /// Probes an object, fails with `NotFound` if it does not exist.
    async fn head(&self, bucket: &str, key: &str) -> Result<ObjectMetadata>;

    /// Fetches the bytes in `range` (end exclusive).
    async fn get_range(&self, bucket: &str, key: &str, range: Range<u64>) -> Result<Bytes>;

    async fn list(&self, bucket: &str, request: &ListRequest) -> Result<ListPage>;

    /// Initiates a multipart upload and returns its upload id.
    async fn create_multipart(&self, bucket: &str, key: &str) -> Result<String>;

    async fn upload_part(
        &self,
        bucket: &str,
        key: &str,
        upload_id: &str,
        part_number: u32,
        data: Bytes,
    ) -> Result<Etag>;

    /// Atomically assembles the object from `parts`, which must be ordered by part number.
    async fn complete_multipart(
        &self,
        bucket: &str,
        key: &str,
        upload_id: &str,
        parts: &[CompletedPart],
    ) -> Result<CompletedUpload>;

    async fn abort_multipart(&self, bucket: &str, key: &str, upload_id: &str) -> Result<()>;

    async fn delete(&self, bucket: &str, key: &str) -> Result<()>;
}

pub type ObjectStoreRef = Arc<dyn ObjectStore>;

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CompletedPart {
    pub part_number: u32,
    pub etag: Etag,
    pub size: u64,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CompletedUpload {
    pub bucket: String,
    pub key: String,
    pub etag: Etag,
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ListRequest {
    pub prefix: String,
    pub delimiter: Option<String>,
    /// Only keys sorting strictly after this one are returned
    pub start_after: Option<String>,
    /// Token from a previous [`ListPage::next`]
    pub continuation: Option<String>,
    pub max_keys: Option<usize>,
}

impl ListRequest {
    pub fn new(prefix: impl Into<String>) -> Self {
        Self {
            prefix: prefix.into(),
            ..Default::default()
        }
    }

    pub fn delimiter(mut self, delimiter: impl Into<String>) -> Self {
        self.delimiter = Some(delimiter.into());
        self
    }

    pub fn start_after(mut self, key: impl Into<String>) -> Self {
        self.start_after = Some(key.into());
        self
    }

    pub fn continuation(mut self, token: Option<String>) -> Self {
        self.continuation = token;
        self
    }
}

#[derive(Clone, Debug, Default)]
pub struct ListPage {
    pub objects: Vec<ObjectMetadata>,
    /// Groups rolled up by the delimiter, each ending with it
    pub prefixes: Vec<String>,
    /// Continuation token, `None` once the listing is exhausted
    pub next: Option<String>,
}
