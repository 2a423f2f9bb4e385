use std::io::{Error, ErrorKind};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};

use async_trait::async_trait;
use relative_path::{Component, RelativePath};

use crate::*;

/// A [DurableStore] which is backed by a given root directory.
///
/// Each namespace is one directory under the root, and each key URL becomes a file path under its namespace: the
/// scheme is dropped and the rest is used as a relative path, so `https://host/t/p/w92/a.jpg` lands at
/// `<root>/<namespace>/host/t/p/w92/a.jpg`.  As with any path handed in from outside, keys which would escape the
/// namespace directory are refused rather than normalized into somewhere else.
#[derive(Debug)]
pub struct FilesystemStore {
    root_path: PathBuf,
    temp_counter: AtomicU64,
}

fn conv_key(key: &str) -> Result<&RelativePath, StoreError> {
    let rest = match key.find("://") {
        Some(i) => &key[i + 3..],
        None => key,
    };
    let path = RelativePath::new(rest);

    let mut depth = 0usize;
    for c in path.components() {
        match c {
            Component::Normal(_) => depth += 1,
            Component::CurDir => {}
            Component::ParentDir => {
                depth = depth
                    .checked_sub(1)
                    .ok_or_else(|| StoreError::InvalidKey(key.to_string()))?
            }
        }
    }
    if depth == 0 {
        return Err(StoreError::InvalidKey(key.to_string()));
    }

    Ok(path)
}

impl FilesystemStore {
    pub fn new(root_path: &Path) -> FilesystemStore {
        FilesystemStore {
            root_path: root_path.to_path_buf(),
            temp_counter: AtomicU64::new(0),
        }
    }

    pub fn root(&self) -> &Path {
        &self.root_path
    }

    fn namespace_dir(&self, namespace: &str) -> Result<PathBuf, StoreError> {
        let mut components = RelativePath::new(namespace).components();
        match (components.next(), components.next()) {
            (Some(Component::Normal(x)), None) if x == namespace => Ok(self.root_path.join(x)),
            _ => Err(StoreError::InvalidNamespace(namespace.to_string())),
        }
    }

    /// Work out where a key lives, making sure it stays inside its namespace.
    fn entry_path(&self, namespace: &str, key: &str) -> Result<PathBuf, StoreError> {
        let dir = self.namespace_dir(namespace)?;
        let absolute = conv_key(key)?.normalize().to_logical_path(&dir);
        if !absolute.starts_with(&dir) || absolute == dir {
            return Err(StoreError::InvalidKey(key.to_string()));
        }
        Ok(absolute)
    }
}

fn not_found_as<T>(res: Result<T, Error>, value: T) -> Result<T, StoreError> {
    match res {
        Ok(x) => Ok(x),
        Err(e) if e.kind() == ErrorKind::NotFound => Ok(value),
        Err(e) => Err(e.into()),
    }
}

#[async_trait]
impl DurableStore for FilesystemStore {
    async fn get(&self, namespace: &str, key: &str) -> Result<Option<Vec<u8>>, StoreError> {
        let path = self.entry_path(namespace, key)?;
        not_found_as(tokio::fs::read(path).await.map(Some), None)
    }

    async fn contains(&self, namespace: &str, key: &str) -> Result<bool, StoreError> {
        let path = self.entry_path(namespace, key)?;
        let meta = not_found_as(tokio::fs::metadata(path).await.map(Some), None)?;
        Ok(meta.is_some_and(|m| m.is_file()))
    }

    async fn put(&self, namespace: &str, key: &str, bytes: &[u8]) -> Result<(), StoreError> {
        let path = self.entry_path(namespace, key)?;
        let parent = path
            .parent()
            .ok_or_else(|| StoreError::InvalidKey(key.to_string()))?;
        tokio::fs::create_dir_all(parent).await?;

        // Write beside the destination and rename over it, so readers only ever see complete files.
        let mut temp_name = path.file_name().unwrap_or_default().to_os_string();
        temp_name.push(format!(
            ".tmp-{}-{}",
            std::process::id(),
            self.temp_counter.fetch_add(1, Ordering::Relaxed)
        ));
        let temp = path.with_file_name(temp_name);

        tokio::fs::write(&temp, bytes).await?;
        if let Err(e) = tokio::fs::rename(&temp, &path).await {
            let _ = tokio::fs::remove_file(&temp).await;
            return Err(e.into());
        }
        Ok(())
    }

    async fn delete_namespace(&self, namespace: &str) -> Result<bool, StoreError> {
        let dir = self.namespace_dir(namespace)?;
        not_found_as(tokio::fs::remove_dir_all(dir).await.map(|_| true), false)
    }
}
