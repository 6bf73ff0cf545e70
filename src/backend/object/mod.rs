mod reader;
mod writer;

pub use reader::{ObjectReader, CHUNK_SIZE};
pub use writer::{ObjectWriter, PART_SIZE};

use crate::backend::{Filesystem, Stream};
use crate::config::Config;
use crate::error::{Error, Result};
use crate::metadata::{Entry, ObjectMetadata};
use crate::store::{ListRequest, ObjectStoreRef, S3Store};
use futures::stream;
use std::collections::VecDeque;
use std::fmt::{Display, Formatter};
use std::sync::Arc;
use tracing::instrument;
use url::Url;

pub const KIND: &str = "s3";

/// Filesystem view of one bucket in an object store.
#[derive(Clone)]
pub struct ObjectFs {
    store: ObjectStoreRef,
    scheme: String,
    bucket: String,
}

impl Display for ObjectFs {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} [bucket={}]", self.scheme, self.bucket)
    }
}

impl ObjectFs {
    pub fn new(bucket: impl Into<String>, store: ObjectStoreRef) -> Self {
        Self {
            store,
            scheme: KIND.to_string(),
            bucket: bucket.into(),
        }
    }

    /// Connects to S3 using the keys documented in [`crate::store::S3Store::from_config`].
    pub async fn from_config(bucket: impl Into<String>, config: &Config) -> Result<Self> {
        let store = S3Store::from_config(config).await?;
        Ok(Self::new(bucket, Arc::new(store)))
    }

    /// Scheme used for the urls of opened handles.
    pub fn with_scheme(mut self, scheme: impl Into<String>) -> Self {
        self.scheme = scheme.into();
        self
    }

    pub fn bucket(&self) -> &str {
        self.bucket.as_str()
    }

    pub fn store(&self) -> &ObjectStoreRef {
        &self.store
    }
}

/// `scheme://bucket/key` with the key percent-encoded as a single path.
pub(crate) fn object_url(scheme: &str, bucket: &str, key: &str) -> Result<Url> {
    let mut url = Url::parse(&format!("{}://{}", scheme, bucket))?;
    url.set_path(&format!("/{}", key));
    Ok(url)
}

/// Object keys never start with a slash.
fn clean_path(path: &str) -> &str {
    path.trim_start_matches('/')
}

fn dir_prefix(path: &str) -> String {
    let path = clean_path(path);
    if path.is_empty() || path.ends_with('/') {
        path.to_string()
    } else {
        format!("{}/", path)
    }
}

/// Number of levels `key` sits below `prefix`, direct children are at level 1.
fn level_below(prefix: &str, key: &str) -> usize {
    let rel = key.strip_prefix(prefix).unwrap_or(key);
    let rel = rel.trim_start_matches('/');
    rel.trim_end_matches('/').matches('/').count() + 1
}

struct WalkState {
    store: ObjectStoreRef,
    bucket: String,
    prefix: String,
    depth: Option<usize>,
    after: Option<String>,
    buffered: VecDeque<Entry>,
    exhausted: bool,
}

impl Filesystem for ObjectFs {
    type Reader = ObjectReader;
    type Writer = ObjectWriter;

    fn name(&self) -> &str {
        self.scheme.as_str()
    }

    fn root(&self) -> &str {
        self.bucket.as_str()
    }

    async fn open(&self, path: &str) -> Result<Self::Reader> {
        ObjectReader::open(
            self.store.clone(),
            &self.scheme,
            &self.bucket,
            clean_path(path),
        )
        .await
    }

    async fn create(&self, path: &str) -> Result<Self::Writer> {
        ObjectWriter::create(
            self.store.clone(),
            &self.scheme,
            &self.bucket,
            clean_path(path),
        )
        .await
    }

    #[instrument(skip(self), fields(bucket = %self.bucket))]
    async fn remove(&self, path: &str) -> Result<()> {
        self.store.delete(&self.bucket, clean_path(path)).await
    }

    #[instrument(skip(self), fields(bucket = %self.bucket))]
    async fn remove_all(&self, path: &str) -> Result<()> {
        let key = clean_path(path);
        let mut deleted = 0;
        if !key.is_empty() && !key.ends_with('/') {
            self.store.delete(&self.bucket, key).await?;
        }

        // siblings merely sharing the name as a prefix are left alone
        let mut request = ListRequest::new(dir_prefix(path));
        loop {
            let page = self.store.list(&self.bucket, &request).await?;
            for object in page.objects.iter() {
                self.store.delete(&self.bucket, object.name()).await?;
                deleted += 1;
            }
            match page.next {
                Some(token) => request = request.continuation(Some(token)),
                None => break,
            }
        }
        tracing::debug!(deleted, "objects removed");
        Ok(())
    }

    async fn stat(&self, path: &str) -> Result<ObjectMetadata> {
        self.store.head(&self.bucket, clean_path(path)).await
    }

    #[instrument(skip(self), fields(bucket = %self.bucket))]
    async fn list_dir(&self, path: &str) -> Result<Vec<Entry>> {
        let prefix = dir_prefix(path);
        let mut request = ListRequest::new(prefix.clone()).delimiter("/");
        let mut entries = vec![];
        loop {
            let page = self.store.list(&self.bucket, &request).await?;
            entries.extend(
                page.objects
                    .iter()
                    // the directory placeholder itself
                    .filter(|o| o.name() != prefix)
                    .map(|o| Entry::file(o.name())),
            );
            entries.extend(page.prefixes.into_iter().map(Entry::dir));
            match page.next {
                Some(token) => request = request.continuation(Some(token)),
                None => break,
            }
        }
        Ok(entries)
    }

    async fn walk(
        &self,
        root: &str,
        depth: Option<usize>,
    ) -> Result<impl Stream<Item = Result<Entry>> + 'static> {
        let state = WalkState {
            store: self.store.clone(),
            bucket: self.bucket.clone(),
            prefix: dir_prefix(root),
            depth,
            after: None,
            buffered: VecDeque::new(),
            exhausted: false,
        };

        let stream = stream::try_unfold(state, |mut state| async move {
            loop {
                if let Some(entry) = state.buffered.pop_front() {
                    return Ok::<_, Error>(Some((entry, state)));
                }
                if state.exhausted {
                    return Ok(None);
                }

                let mut request = ListRequest::new(state.prefix.clone());
                request.start_after = state.after.clone();
                let page = state.store.list(&state.bucket, &request).await?;
                state.exhausted = page.next.is_none() || page.objects.is_empty();

                for object in page.objects {
                    let key = object.name().to_string();
                    let within = state
                        .depth
                        .map_or(true, |d| level_below(&state.prefix, &key) <= d);
                    if within {
                        state.buffered.push_back(Entry::file(key.clone()));
                    }
                    state.after = Some(key);
                }
            }
        });

        Ok(Box::pin(stream))
    }
}
