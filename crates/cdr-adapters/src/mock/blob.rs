use std::collections::HashMap;
use std::path::Path;
use std::sync::Mutex;

use async_trait::async_trait;

use crate::blob_store::BlobStore;
use crate::error::AdapterError;

/// An in-memory blob store keyed by `(container, path)`.
#[derive(Default)]
pub struct MockBlobStore {
    objects: Mutex<HashMap<(String, String), Vec<u8>>>,
}

impl MockBlobStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Seed an object directly, as a test would populate a source container.
    pub fn seed(&self, container: &str, path: &str, bytes: Vec<u8>) {
        self.objects
            .lock()
            .expect("mock blob store lock poisoned")
            .insert((container.to_string(), path.to_string()), bytes);
    }
}

#[async_trait]
impl BlobStore for MockBlobStore {
    async fn list(&self, container: &str, prefix: Option<&str>) -> Result<Vec<String>, AdapterError> {
        let objects = self.objects.lock().expect("mock blob store lock poisoned");
        Ok(objects
            .keys()
            .filter(|(c, _)| c == container)
            .map(|(_, p)| p.clone())
            .filter(|p| prefix.is_none_or(|pre| p.starts_with(pre)))
            .collect())
    }

    async fn download(&self, container: &str, path: &str, dest: &Path) -> Result<u64, AdapterError> {
        let bytes = {
            let objects = self.objects.lock().expect("mock blob store lock poisoned");
            objects
                .get(&(container.to_string(), path.to_string()))
                .cloned()
                .ok_or_else(|| AdapterError::NotFound {
                    adapter: "mock-blob".to_string(),
                    what: format!("{container}/{path}"),
                })?
        };
        let len = bytes.len() as u64;
        tokio::fs::write(dest, &bytes).await.map_err(|e| AdapterError::Other {
            adapter: "mock-blob".to_string(),
            message: format!("writing {}: {e}", dest.display()),
        })?;
        Ok(len)
    }

    async fn upload(&self, container: &str, local: &Path, path: &str) -> Result<(), AdapterError> {
        let bytes = tokio::fs::read(local).await.map_err(|e| AdapterError::Other {
            adapter: "mock-blob".to_string(),
            message: format!("reading {}: {e}", local.display()),
        })?;
        self.objects
            .lock()
            .expect("mock blob store lock poisoned")
            .insert((container.to_string(), path.to_string()), bytes);
        Ok(())
    }
}
