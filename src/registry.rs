use crate::backend::local::{self, LocalFs};
use crate::backend::object::{self, ObjectFs};
use crate::backend::{Backend, File};
use crate::config::Config;
use crate::error::{Error, Result};
use futures::future::BoxFuture;
use futures::FutureExt;
use percent_encoding::percent_decode_str;
use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use tracing::instrument;
use url::Url;

type Constructor = Arc<dyn Fn(String, Config) -> BoxFuture<'static, Result<Backend>> + Send + Sync>;

/// Maps scheme names to backend constructors.
///
/// A constructor receives the root (local directory or bucket) and the backend
/// specific [`Config`].
#[derive(Clone)]
pub struct Registry {
    constructors: HashMap<String, Constructor>,
}

impl Default for Registry {
    /// Knows about `file` and `s3`.
    fn default() -> Self {
        let mut registry = Self::new();
        registry.register(local::KIND, |root, _| async move {
            Ok::<_, Error>(Backend::Local(LocalFs::new(root)))
        });
        registry.register(object::KIND, |root, config| async move {
            Ok::<_, Error>(Backend::Object(ObjectFs::from_config(root, &config).await?))
        });
        registry
    }
}

impl Registry {
    /// An empty registry.
    pub fn new() -> Self {
        Self {
            constructors: HashMap::new(),
        }
    }

    /// Adds or replaces the constructor for `kind`.
    pub fn register<F, Fut>(&mut self, kind: impl Into<String>, constructor: F)
    where
        F: Fn(String, Config) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Backend>> + Send + 'static,
    {
        self.constructors.insert(
            kind.into(),
            Arc::new(move |root, config| constructor(root, config).boxed()),
        );
    }

    pub fn kinds(&self) -> impl Iterator<Item = &str> {
        self.constructors.keys().map(|k| k.as_str())
    }

    #[instrument(skip(self, config))]
    pub async fn dial(&self, kind: &str, root: &str, config: &Config) -> Result<Backend> {
        let constructor = self
            .constructors
            .get(kind)
            .ok_or_else(|| Error::UnknownScheme(kind.to_string()))?;
        constructor(root.to_string(), config.clone()).await
    }

    /// Dials the backend named by the scheme of `url`, rooted at its host.
    pub async fn dial_url(&self, url: &Url, config: &Config) -> Result<Backend> {
        self.dial(url.scheme(), url.host_str().unwrap_or_default(), config)
            .await
    }

    /// Dials the backend of `url` and returns it with the decoded path it addresses.
    pub async fn resolve(&self, url: &Url, config: &Config) -> Result<(Backend, String)> {
        let path = path_of(url)?;
        Ok((self.dial_url(url, config).await?, path))
    }

    /// Opens the file at `url` for reading.
    pub async fn open(&self, url: &str, config: &Config) -> Result<File> {
        let (backend, path) = self.resolve(&Url::parse(url)?, config).await?;
        Ok(backend.open(&path).await?.into())
    }

    /// Creates the file at `url`, replacing whatever was there once it is closed.
    pub async fn create(&self, url: &str, config: &Config) -> Result<File> {
        let (backend, path) = self.resolve(&Url::parse(url)?, config).await?;
        Ok(backend.create(&path).await?.into())
    }
}

/// The percent-decoded path of `url`, as handed to a backend.
pub fn path_of(url: &Url) -> Result<String> {
    percent_decode_str(url.path())
        .decode_utf8()
        .map(|path| path.into_owned())
        .map_err(|_| Error::InvalidUrl(url.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::Filesystem;
    use crate::store::MemoryStore;
    use std::io::SeekFrom;

    fn with_memory(store: Arc<MemoryStore>) -> Registry {
        let mut registry = Registry::default();
        registry.register("mem", move |root, _| {
            let store = store.clone();
            async move {
                Ok::<_, Error>(Backend::Object(ObjectFs::new(root, store).with_scheme("mem")))
            }
        });
        registry
    }

    #[tokio::test]
    async fn unknown_scheme_is_rejected() {
        let registry = Registry::new();
        let err = registry
            .dial("nope", "", &Config::new())
            .await
            .err()
            .unwrap();
        assert!(matches!(err, Error::UnknownScheme(ref s) if s == "nope"));
        assert_eq!(err.to_string(), "`nope` filesystem not found");

        let mut kinds: Vec<_> = Registry::default().kinds().map(|k| k.to_string()).collect();
        kinds.sort();
        assert_eq!(kinds, vec!["file", "s3"]);
    }

    #[tokio::test]
    async fn dial_url_uses_scheme_and_host() {
        let store = Arc::new(MemoryStore::new());
        let registry = with_memory(store.clone());

        let backend = registry
            .dial_url(&Url::parse("mem://bucket/some/key").unwrap(), &Config::new())
            .await
            .ok()
            .unwrap();
        assert_eq!(backend.name(), "mem");
        assert_eq!(backend.root(), "bucket");

        let fs = match backend {
            Backend::Object(fs) => fs,
            Backend::Local(_) => panic!("expected an object backend"),
        };
        assert_eq!(fs.name(), "mem");
    }

    #[tokio::test]
    async fn create_then_open_by_url() {
        let store = Arc::new(MemoryStore::new());
        let registry = with_memory(store.clone());
        let config = Config::new();

        let mut file = registry.create("mem://bucket/a/b.txt", &config).await.ok().unwrap();
        file.write(b"hello registry").await.unwrap();
        file.close().await.unwrap();
        assert_eq!(file.url().unwrap().as_str(), "mem://bucket/a/b.txt");

        let mut reader = registry
            .open("mem://bucket/a/b.txt", &config)
            .await
            .ok()
            .unwrap()
            .into_reader()
            .ok()
            .unwrap();
        reader.seek(SeekFrom::Start(6)).await.unwrap();
        let mut out = vec![];
        reader.read_to_end(&mut out).await.unwrap();
        assert_eq!(out, b"registry");
        assert_eq!(reader.url().unwrap().as_str(), "mem://bucket/a/b.txt");
    }

    #[tokio::test]
    async fn file_urls_use_absolute_paths() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("plain.txt");
        let url = Url::from_file_path(&path).unwrap();
        let registry = Registry::default();
        let config = Config::new();

        let mut file = registry.create(url.as_str(), &config).await.ok().unwrap();
        file.write(b"local").await.unwrap();
        file.close().await.unwrap();

        assert_eq!(tokio::fs::read(&path).await.unwrap(), b"local");
        let mut file = registry.open(url.as_str(), &config).await.ok().unwrap();
        assert_eq!(file.stat().await.unwrap().size(), 5);
        assert!(matches!(
            file.write(b"x").await,
            Err(Error::WrongDirection(_))
        ));
    }

    #[tokio::test]
    async fn escaped_keys_are_decoded_and_round_trip() {
        let store = Arc::new(MemoryStore::new());
        let registry = with_memory(store.clone());
        let config = Config::new();

        store.put("bucket", "dir/my file.txt", b"spaced".to_vec()).await;
        let mut file = registry
            .open("mem://bucket/dir/my%20file.txt", &config)
            .await
            .ok()
            .unwrap();
        let mut buf = [0; 6];
        assert_eq!(file.read(&mut buf).await.unwrap(), 6);
        assert_eq!(&buf, b"spaced");
        assert_eq!(file.url().unwrap().as_str(), "mem://bucket/dir/my%20file.txt");

        let mut file = registry.create("mem://bucket/a%20b%3Fc", &config).await.ok().unwrap();
        file.write(b"x").await.unwrap();
        file.close().await.unwrap();
        assert!(store.get("bucket", "a b?c").await.is_some());
        assert!(store.get("bucket", "a%20b%3Fc").await.is_none());

        let url = file.url().unwrap();
        assert_eq!(url.as_str(), "mem://bucket/a%20b%3Fc");
        assert!(registry.open(url.as_str(), &config).await.is_ok());
    }

    #[tokio::test]
    async fn file_urls_with_spaces_address_the_real_path() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("with space.txt");
        let url = Url::from_file_path(&path).unwrap();
        assert!(url.as_str().ends_with("with%20space.txt"));
        let registry = Registry::default();

        let mut file = registry.create(url.as_str(), &Config::new()).await.ok().unwrap();
        file.write(b"local").await.unwrap();
        file.close().await.unwrap();

        assert_eq!(tokio::fs::read(&path).await.unwrap(), b"local");
        assert_eq!(path_of(&url).unwrap(), path.to_string_lossy());
        assert_eq!(file.url().unwrap(), url);
    }
}
