use crate::error::{Error, Result};
use serde::Deserialize;
use std::collections::BTreeMap;
use std::path::Path;

/// Backend specific key/value settings.
///
/// Each backend documents the keys it understands, unknown keys are ignored.
#[derive(Clone, Debug, Default, PartialEq, Eq, Deserialize)]
#[serde(transparent)]
pub struct Config(BTreeMap<String, String>);

impl Config {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.0.insert(key.into(), value.into());
        self
    }

    pub fn insert(&mut self, key: impl Into<String>, value: impl Into<String>) {
        self.0.insert(key.into(), value.into());
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.0
            .get(key)
            .map(|s| s.as_str())
            .filter(|s| !s.is_empty())
    }

    pub fn contains_key(&self, key: &str) -> bool {
        self.get(key).is_some()
    }

    pub fn from_toml(input: &str) -> Result<Self> {
        toml::from_str(input).map_err(|e| Error::Config(e.to_string()))
    }

    pub async fn load(path: impl AsRef<Path>) -> Result<Self> {
        let input = tokio::fs::read_to_string(path.as_ref()).await?;
        Self::from_toml(&input)
    }
}

impl FromIterator<(String, String)> for Config {
    fn from_iter<T: IntoIterator<Item = (String, String)>>(iter: T) -> Self {
        Self(iter.into_iter().collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_flat_toml_table() {
        let config = Config::from_toml(
            r#"
            region = "eu-central-1"
            profile = "backup"
            endpoint = ""
            "#,
        )
        .unwrap();
        assert_eq!(config.get("region"), Some("eu-central-1"));
        assert_eq!(config.get("profile"), Some("backup"));
        assert!(!config.contains_key("endpoint"));
        assert!(config.get("access_key").is_none());
    }

    #[test]
    fn rejects_nested_values() {
        let err = Config::from_toml("[s3]\nregion = \"x\"").unwrap_err();
        assert!(matches!(err, Error::Config(_)));
    }
}
