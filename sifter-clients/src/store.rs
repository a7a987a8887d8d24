//! Image store capability

use crate::error::StoreError;
use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::RwLock;
use sifter_core::{ImageRef, ItemId};
use std::collections::HashMap;
use std::io::ErrorKind;
use std::path::{Component, Path, PathBuf};
use tokio::fs;
use tracing::{debug, info, warn};

/// Listing and fetching of images grouped in collections
#[async_trait]
pub trait ObjectStore: Send + Sync {
    /// Adapter name, for logs
    fn name(&self) -> &str;

    /// Every item of `collection`, in a stable order
    async fn list_items(&self, collection: &str) -> Result<Vec<ItemId>, StoreError>;

    /// Raw bytes of one image
    async fn fetch(&self, image: &ImageRef) -> Result<Bytes, StoreError>;

    /// Reference a detector can resolve
    fn image_ref(&self, collection: &str, item: &ItemId) -> ImageRef {
        ImageRef::new(collection, item.clone())
    }

    /// Release the client
    async fn close(&self) -> Result<(), StoreError> {
        Ok(())
    }
}

/// Store backed by a directory: `<root>/<collection>/<item>`.
///
/// Items are file paths relative to the collection directory, using `/` as a
/// separator, listed in byte order. Hidden files are skipped.
pub struct LocalStore {
    root: PathBuf,
}

impl LocalStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn collection_dir(&self, collection: &str) -> Result<PathBuf, StoreError> {
        let relative = safe_relative(collection)?;
        if relative.components().count() != 1 {
            return Err(StoreError::InvalidPath(format!(
                "collection '{}' must be a single directory name",
                collection
            )));
        }
        Ok(self.root.join(relative))
    }
}

/// Reject absolute paths and `..` so lookups stay under the root
fn safe_relative(path: &str) -> Result<PathBuf, StoreError> {
    let candidate = Path::new(path);
    let mut clean = PathBuf::new();
    for component in candidate.components() {
        match component {
            Component::Normal(part) => clean.push(part),
            Component::CurDir => {}
            _ => {
                return Err(StoreError::InvalidPath(format!(
                    "'{}' escapes the store root",
                    path
                )))
            }
        }
    }
    if clean.as_os_str().is_empty() {
        return Err(StoreError::InvalidPath("empty path".to_string()));
    }
    Ok(clean)
}

#[async_trait]
impl ObjectStore for LocalStore {
    fn name(&self) -> &str {
        "local"
    }

    async fn list_items(&self, collection: &str) -> Result<Vec<ItemId>, StoreError> {
        let base = self.collection_dir(collection)?;
        match fs::metadata(&base).await {
            Ok(meta) if meta.is_dir() => {}
            Ok(_) => return Err(StoreError::CollectionNotFound(collection.to_string())),
            Err(e) if e.kind() == ErrorKind::NotFound => {
                return Err(StoreError::CollectionNotFound(collection.to_string()))
            }
            Err(e) => return Err(e.into()),
        }

        let mut keys = Vec::new();
        let mut pending = vec![(base.clone(), String::new())];
        while let Some((dir, prefix)) = pending.pop() {
            let mut entries = fs::read_dir(&dir).await?;
            while let Some(entry) = entries.next_entry().await? {
                let Some(name) = entry.file_name().to_str().map(str::to_string) else {
                    warn!("Skipping non UTF-8 file name in {}", dir.display());
                    continue;
                };
                if name.starts_with('.') {
                    continue;
                }

                let key = format!("{}{}", prefix, name);
                let file_type = entry.file_type().await?;
                if file_type.is_dir() {
                    pending.push((entry.path(), format!("{}/", key)));
                } else if file_type.is_file() {
                    keys.push(key);
                }
            }
        }
        keys.sort();

        let mut items = Vec::with_capacity(keys.len());
        for key in keys {
            match ItemId::new(key) {
                Ok(item) => items.push(item),
                Err(e) => warn!("Skipping file in '{}': {}", collection, e),
            }
        }

        info!("Listed {} items in collection '{}'", items.len(), collection);
        Ok(items)
    }

    async fn fetch(&self, image: &ImageRef) -> Result<Bytes, StoreError> {
        let path = self
            .collection_dir(&image.collection)?
            .join(safe_relative(image.item.as_str())?);
        match fs::read(&path).await {
            Ok(bytes) => {
                debug!("Fetched {} ({} bytes)", image, bytes.len());
                Ok(Bytes::from(bytes))
            }
            Err(e) if e.kind() == ErrorKind::NotFound => {
                Err(StoreError::ItemNotFound(image.to_string()))
            }
            Err(e) => Err(e.into()),
        }
    }
}

/// Store holding collections in memory; listing keeps insertion order
#[derive(Default)]
pub struct MemoryStore {
    collections: RwLock<HashMap<String, Vec<(ItemId, Bytes)>>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a collection of empty images
    pub fn with_collection<I, S>(self, collection: &str, items: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.collections
            .write()
            .entry(collection.to_string())
            .or_default();
        for item in items {
            if let Ok(item) = ItemId::new(item) {
                self.insert(collection, item, Bytes::new());
            }
        }
        self
    }

    /// Add or replace one image
    pub fn insert(&self, collection: &str, item: ItemId, bytes: Bytes) {
        let mut collections = self.collections.write();
        let entries = collections.entry(collection.to_string()).or_default();
        match entries.iter_mut().find(|(existing, _)| *existing == item) {
            Some(entry) => entry.1 = bytes,
            None => entries.push((item, bytes)),
        }
    }
}

#[async_trait]
impl ObjectStore for MemoryStore {
    fn name(&self) -> &str {
        "memory"
    }

    async fn list_items(&self, collection: &str) -> Result<Vec<ItemId>, StoreError> {
        self.collections
            .read()
            .get(collection)
            .map(|entries| entries.iter().map(|(item, _)| item.clone()).collect())
            .ok_or_else(|| StoreError::CollectionNotFound(collection.to_string()))
    }

    async fn fetch(&self, image: &ImageRef) -> Result<Bytes, StoreError> {
        self.collections
            .read()
            .get(&image.collection)
            .and_then(|entries| entries.iter().find(|(item, _)| *item == image.item))
            .map(|(_, bytes)| bytes.clone())
            .ok_or_else(|| StoreError::ItemNotFound(image.to_string()))
    }
}
