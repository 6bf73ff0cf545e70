use crate::Etag;
use chrono::{DateTime, Utc};

/// Point-in-time view of a single object or file.
///
/// Never mutated once built, a fresh `stat` produces a new value.
#[derive(Clone, Debug, PartialEq)]
pub struct ObjectMetadata {
    name: String,
    size: u64,
    etag: Option<Etag>,
    modified: DateTime<Utc>,
    is_dir: bool,
}

impl ObjectMetadata {
    pub fn new(
        name: impl Into<String>,
        size: u64,
        etag: Option<Etag>,
        modified: DateTime<Utc>,
    ) -> Self {
        Self {
            name: name.into(),
            size,
            etag,
            modified,
            is_dir: false,
        }
    }

    pub(crate) fn dir(name: impl Into<String>, modified: DateTime<Utc>) -> Self {
        Self {
            name: name.into(),
            size: 0,
            etag: None,
            modified,
            is_dir: true,
        }
    }

    pub fn name(&self) -> &str {
        self.name.as_str()
    }

    pub fn size(&self) -> u64 {
        self.size
    }

    /// Opaque content hash as reported by the storage backend
    pub fn etag(&self) -> Option<&Etag> {
        self.etag.as_ref()
    }

    pub fn modified(&self) -> &DateTime<Utc> {
        &self.modified
    }

    pub fn is_dir(&self) -> bool {
        self.is_dir
    }
}

/// Lazily populated metadata of an open handle.
#[derive(Clone, Debug, Default)]
pub(crate) struct MetadataSlot(Option<ObjectMetadata>);

impl MetadataSlot {
    pub fn get(&self) -> Option<&ObjectMetadata> {
        self.0.as_ref()
    }

    pub fn populate(&mut self, metadata: ObjectMetadata) -> &ObjectMetadata {
        self.0.insert(metadata)
    }
}

/// A single result of listing a directory or walking a tree.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Entry {
    pub path: String,
    pub is_dir: bool,
}

impl Entry {
    pub(crate) fn file(path: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            is_dir: false,
        }
    }

    pub(crate) fn dir(path: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            is_dir: true,
        }
    }
}
