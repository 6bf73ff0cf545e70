use crate::backend::{Filesystem, Stream};
use crate::error::{Error, Result};
use crate::io::{ReadOnly, TokioFile, WriteOnly};
use crate::metadata::{Entry, MetadataSlot, ObjectMetadata};
use crate::Etag;
use chrono::{DateTime, Utc};
use futures::{stream, StreamExt, TryStreamExt};
use std::fs::Metadata;
use std::io::{ErrorKind, SeekFrom};
use std::path::{Path, PathBuf};
use tracing::instrument;
use url::Url;

pub const KIND: &str = "file";

/// Pass-through to the host filesystem below `root`.
///
/// An empty root leaves paths untouched, which is what `file:///abs/path` urls dial.
#[derive(Clone, Debug)]
pub struct LocalFs {
    root: PathBuf,
    root_str: String,
}

impl LocalFs {
    pub fn new(root: impl AsRef<Path>) -> Self {
        let root = root.as_ref().to_path_buf();
        Self {
            root_str: root.to_string_lossy().into_owned(),
            root,
        }
    }

    fn join(&self, path: &str) -> PathBuf {
        if self.root.as_os_str().is_empty() {
            PathBuf::from(path)
        } else {
            self.root.join(path.trim_start_matches('/'))
        }
    }
}

fn file_url(path: &Path) -> Result<Url> {
    let path = std::path::absolute(path)?;
    Url::from_file_path(&path).map_err(|_| Error::InvalidUrl(path.display().to_string()))
}

fn to_metadata(path: &Path, metadata: &Metadata) -> Result<ObjectMetadata> {
    let name = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| path.display().to_string());
    let modified = DateTime::<Utc>::from(metadata.modified()?);
    Ok(if metadata.is_dir() {
        ObjectMetadata::dir(name, modified)
    } else {
        ObjectMetadata::new(name, metadata.len(), Etag::try_from(metadata).ok(), modified)
    })
}

fn display(path: &Path) -> String {
    path.to_string_lossy().into_owned()
}

impl Filesystem for LocalFs {
    type Reader = LocalReader;
    type Writer = LocalWriter;

    fn name(&self) -> &str {
        KIND
    }

    fn root(&self) -> &str {
        self.root_str.as_str()
    }

    async fn open(&self, path: &str) -> Result<Self::Reader> {
        let file = TokioFile::open(self.join(path)).await?;
        Ok(LocalReader {
            file: Some(file),
            metadata: MetadataSlot::default(),
        })
    }

    /// Missing parent directories are created first.
    #[instrument(skip(self))]
    async fn create(&self, path: &str) -> Result<Self::Writer> {
        let path = self.join(path);
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            tokio::fs::create_dir_all(parent).await?;
        }
        let file = TokioFile::create(&path).await?;
        Ok(LocalWriter {
            path,
            file: Some(file),
        })
    }

    async fn remove(&self, path: &str) -> Result<()> {
        Ok(tokio::fs::remove_file(self.join(path)).await?)
    }

    /// Removes a file or a whole tree, a missing path is not an error.
    #[instrument(skip(self))]
    async fn remove_all(&self, path: &str) -> Result<()> {
        let path = self.join(path);
        let res = match tokio::fs::symlink_metadata(&path).await {
            Ok(metadata) if metadata.is_dir() => tokio::fs::remove_dir_all(&path).await,
            Ok(_) => tokio::fs::remove_file(&path).await,
            Err(err) => Err(err),
        };
        match res {
            Err(err) if err.kind() != ErrorKind::NotFound => Err(err.into()),
            _ => Ok(()),
        }
    }

    async fn stat(&self, path: &str) -> Result<ObjectMetadata> {
        let path = self.join(path);
        let metadata = tokio::fs::metadata(&path).await?;
        to_metadata(&path, &metadata)
    }

    async fn list_dir(&self, path: &str) -> Result<Vec<Entry>> {
        let stream = tokio_stream::wrappers::ReadDirStream::new(
            tokio::fs::read_dir(self.join(path)).await?,
        );
        let mut entries: Vec<Entry> = stream
            .then(|r| async move {
                let e = r?;
                let path = display(&e.path());
                Ok::<_, std::io::Error>(if e.file_type().await?.is_dir() {
                    Entry::dir(path)
                } else {
                    Entry::file(path)
                })
            })
            .try_collect()
            .await?;
        entries.sort_by(|a, b| a.path.cmp(&b.path));
        Ok(entries)
    }

    /// Depth first, lexically ordered walk that includes `root` itself.
    async fn walk(
        &self,
        root: &str,
        depth: Option<usize>,
    ) -> Result<impl Stream<Item = Result<Entry>> + 'static> {
        let root = self.join(root);
        let is_dir = tokio::fs::metadata(&root).await?.is_dir();

        let stream = stream::try_unfold(vec![(root, 0usize, is_dir)], move |mut pending| async move {
            let Some((path, level, is_dir)) = pending.pop() else {
                return Ok::<_, Error>(None);
            };
            if is_dir && depth.map_or(true, |d| level < d) {
                let mut children = vec![];
                let mut read_dir = tokio::fs::read_dir(&path).await?;
                while let Some(entry) = read_dir.next_entry().await? {
                    children.push((entry.path(), level + 1, entry.file_type().await?.is_dir()));
                }
                children.sort();
                pending.extend(children.into_iter().rev());
            }
            let entry = if is_dir {
                Entry::dir(display(&path))
            } else {
                Entry::file(display(&path))
            };
            Ok(Some((entry, pending)))
        });

        Ok(Box::pin(stream))
    }
}

/// Read-only handle on a local file.
pub struct LocalReader {
    file: Option<TokioFile<ReadOnly>>,
    metadata: MetadataSlot,
}

impl LocalReader {
    fn file(&mut self) -> Result<&mut TokioFile<ReadOnly>> {
        self.file.as_mut().ok_or(Error::AlreadyClosed)
    }

    pub async fn read(&mut self, buf: &mut [u8]) -> Result<usize> {
        Ok(self.file()?.read(buf).await?)
    }

    pub async fn read_at(&self, buf: &mut [u8], offset: u64) -> Result<usize> {
        let file = self.file.as_ref().ok_or(Error::AlreadyClosed)?;
        Ok(file.read_at(buf, offset).await?)
    }

    pub async fn seek(&mut self, pos: SeekFrom) -> Result<u64> {
        Ok(self.file()?.seek(pos).await?)
    }

    pub fn close(&mut self) -> Result<()> {
        self.file.take().map(|_| ()).ok_or(Error::AlreadyClosed)
    }

    pub async fn stat(&mut self) -> Result<ObjectMetadata> {
        if let Some(metadata) = self.metadata.get() {
            return Ok(metadata.clone());
        }
        let file = self.file()?;
        let metadata = to_metadata(file.path(), &file.metadata().await?)?;
        Ok(self.metadata.populate(metadata).clone())
    }

    pub fn url(&self) -> Result<Url> {
        let file = self.file.as_ref().ok_or(Error::AlreadyClosed)?;
        file_url(file.path())
    }
}

/// Write-only handle on a local file.
pub struct LocalWriter {
    path: PathBuf,
    file: Option<TokioFile<WriteOnly>>,
}

impl LocalWriter {
    fn file(&mut self) -> Result<&mut TokioFile<WriteOnly>> {
        self.file.as_mut().ok_or(Error::AlreadyClosed)
    }

    pub async fn write(&mut self, buf: &[u8]) -> Result<usize> {
        Ok(self.file()?.write(buf).await?)
    }

    pub async fn flush(&mut self) -> Result<()> {
        Ok(self.file()?.flush().await?)
    }

    pub async fn seek(&mut self, pos: SeekFrom) -> Result<u64> {
        Ok(self.file()?.seek(pos).await?)
    }

    pub async fn close(&mut self) -> Result<()> {
        let file = self.file.take().ok_or(Error::AlreadyClosed)?;
        Ok(file.close().await?)
    }

    /// Drops the handle and removes the partially written file.
    pub async fn cancel(&mut self) -> Result<()> {
        self.file.take().ok_or(Error::AlreadyClosed)?;
        Ok(tokio::fs::remove_file(&self.path).await?)
    }

    /// Always reflects the current state on disk, the file may still be growing.
    pub async fn stat(&mut self) -> Result<ObjectMetadata> {
        let metadata = tokio::fs::metadata(&self.path).await?;
        to_metadata(&self.path, &metadata)
    }

    pub fn url(&self) -> Result<Url> {
        file_url(&self.path)
    }
}
