use std::fmt::{Debug, Display, Formatter};
use std::fs::Metadata;
use std::io::{Error as IoError, ErrorKind};
use std::time::SystemTime;

pub mod backend;
pub mod config;
pub mod error;
pub mod io;
pub mod metadata;
pub mod registry;
pub mod store;

pub use backend::{Backend, File, Filesystem, ReadStream, WriteStream};
pub use config::Config;
pub use error::{Error, Result};
pub use metadata::{Entry, ObjectMetadata};
pub use registry::Registry;

/// Opaque content hash handed out by a storage backend.
///
/// It is compared and echoed back, never interpreted.
#[derive(Clone, PartialEq, Eq, Hash)]
pub struct Etag(String);

impl Etag {
    pub fn as_str(&self) -> &str {
        self.0.as_str()
    }
}

impl From<String> for Etag {
    fn from(value: String) -> Self {
        Self(value)
    }
}

impl From<&str> for Etag {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

impl Display for Etag {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        Display::fmt(&self.0, f)
    }
}

impl Debug for Etag {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        Debug::fmt(&self.0, f)
    }
}

impl AsRef<str> for Etag {
    fn as_ref(&self) -> &str {
        self.0.as_str()
    }
}

impl TryFrom<&Metadata> for Etag {
    type Error = IoError;

    fn try_from(metadata: &Metadata) -> std::result::Result<Self, Self::Error> {
        let mut hasher = twox_hash::XxHash3_128::new();
        hasher.write(
            &metadata
                .modified()?
                .duration_since(SystemTime::UNIX_EPOCH)
                .map_err(|_| IoError::new(ErrorKind::InvalidData, "file last_modified before 1970"))?
                .as_nanos()
                .to_be_bytes(),
        );
        hasher.write(&metadata.len().to_be_bytes());
        Ok(Etag(format!("{:032x}", hasher.finish_128())))
    }
}
