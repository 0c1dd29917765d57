//! Object storage for generated images

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::fs;
use std::path::{Component, Path, PathBuf};
use tracing::debug;

use crate::error::{ServeError, ServeResult};

/// `s3://bucket/key`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ObjectUri {
    pub bucket: String,
    pub key: String,
}

impl ObjectUri {
    pub fn parse(uri: &str) -> ServeResult<Self> {
        let rest = uri
            .trim()
            .strip_prefix("s3://")
            .ok_or_else(|| ServeError::storage(format!("`{}` is not an s3:// URI", uri)))?;
        let (bucket, key) = rest.split_once('/').unwrap_or((rest, ""));
        if bucket.is_empty() {
            return Err(ServeError::storage(format!("`{}` has no bucket", uri)));
        }
        Ok(Self {
            bucket: bucket.to_string(),
            key: key.to_string(),
        })
    }

    /// Same bucket, `suffix` appended to the key
    pub fn join(&self, suffix: &str) -> Self {
        Self {
            bucket: self.bucket.clone(),
            key: format!("{}{}", self.key, suffix),
        }
    }
}

impl fmt::Display for ObjectUri {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "s3://{}/{}", self.bucket, self.key)
    }
}

/// Object metadata; values are reduced to printable ASCII
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ObjectMetadata(BTreeMap<String, String>);

impl ObjectMetadata {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, key: &str, value: &str) -> &mut Self {
        self.0.insert(key.to_string(), printable_ascii(value));
        self
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.0.get(key).map(String::as_str)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.0.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }
}

fn printable_ascii(value: &str) -> String {
    value.chars().filter(|c| (' '..='~').contains(c)).collect()
}

/// Destination for generated artifacts
pub trait ObjectStore: Send + Sync {
    fn put(
        &self,
        uri: &ObjectUri,
        body: &[u8],
        content_type: &str,
        metadata: &ObjectMetadata,
    ) -> ServeResult<()>;

    /// Remove an object; a missing object is not an error
    fn delete(&self, uri: &ObjectUri) -> ServeResult<()>;
}

/// Sidecar written next to every object by [`LocalObjectStore`]
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StoredObject {
    pub content_type: String,
    pub metadata: ObjectMetadata,
}

/// Maps `s3://bucket/key` onto `<root>/bucket/key`
#[derive(Debug, Clone)]
pub struct LocalObjectStore {
    root: PathBuf,
}

impl LocalObjectStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Filesystem path of an object; keys may not escape the bucket
    pub fn path_for(&self, uri: &ObjectUri) -> ServeResult<PathBuf> {
        let key = Path::new(&uri.key);
        let escapes = Path::new(&uri.bucket)
            .components()
            .chain(key.components())
            .any(|c| !matches!(c, Component::Normal(_)));
        if escapes || uri.key.is_empty() || uri.key.ends_with('/') {
            return Err(ServeError::storage(format!("invalid object key in {}", uri)));
        }
        Ok(self.root.join(&uri.bucket).join(key))
    }

    pub fn sidecar_path(path: &Path) -> PathBuf {
        let mut name = path.as_os_str().to_owned();
        name.push(".metadata.json");
        PathBuf::from(name)
    }
}

impl ObjectStore for LocalObjectStore {
    fn put(
        &self,
        uri: &ObjectUri,
        body: &[u8],
        content_type: &str,
        metadata: &ObjectMetadata,
    ) -> ServeResult<()> {
        let path = self.path_for(uri)?;
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        fs::write(&path, body)?;

        let sidecar = StoredObject {
            content_type: content_type.to_string(),
            metadata: metadata.clone(),
        };
        fs::write(
            Self::sidecar_path(&path),
            serde_json::to_vec_pretty(&sidecar)?,
        )?;
        debug!("Stored {} ({} bytes) at {}", uri, body.len(), path.display());
        Ok(())
    }

    fn delete(&self, uri: &ObjectUri) -> ServeResult<()> {
        let path = self.path_for(uri)?;
        for file in [Self::sidecar_path(&path), path] {
            match fs::remove_file(&file) {
                Err(e) if e.kind() != std::io::ErrorKind::NotFound => return Err(e.into()),
                _ => {}
            }
        }
        debug!("Deleted {}", uri);
        Ok(())
    }
}
