//! JSON file backed endpoint store

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tokio::sync::Mutex;

use rf_core::error::StoreError;
use rf_core::{Endpoint, EndpointId, LifecycleState, NewEndpoint};

use super::{EndpointStore, EndpointTable};

/// On-disk layout of the store file
#[derive(Debug, Default, Serialize, Deserialize)]
struct StoreFile {
    #[serde(default)]
    next_id: u64,
    #[serde(default)]
    endpoints: Vec<Endpoint>,
}

/// Store persisting every mutation to a JSON file.
///
/// Mutations are applied to a copy of the table, written to `<path>.tmp` and
/// renamed over the store file; the in-memory table only changes once the
/// rename succeeded.
pub struct FileStore {
    path: PathBuf,
    table: Mutex<EndpointTable>,
}

impl FileStore {
    /// Open the store at `path`, creating an empty one if it does not exist
    pub async fn open(path: impl Into<PathBuf>) -> Result<Self, StoreError> {
        let path = path.into();

        let table = match tokio::fs::read(&path).await {
            Ok(bytes) => {
                let file: StoreFile = serde_json::from_slice(&bytes)?;
                EndpointTable::from_records(file.next_id, file.endpoints)
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                tracing::info!("No endpoint store at {:?}, starting empty", path);
                EndpointTable::new()
            }
            Err(source) => return Err(StoreError::Io { path, source }),
        };

        Ok(Self {
            path,
            table: Mutex::new(table),
        })
    }

    /// Path of the store file
    pub fn path(&self) -> &Path {
        &self.path
    }

    async fn persist(&self, table: &EndpointTable) -> Result<(), StoreError> {
        let file = StoreFile {
            next_id: table.next_id(),
            endpoints: table.list(),
        };
        let content = serde_json::to_vec_pretty(&file)?;

        if let Some(parent) = self.path.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|source| StoreError::Io {
                    path: parent.to_path_buf(),
                    source,
                })?;
        }

        let tmp = self.path.with_extension("json.tmp");
        tokio::fs::write(&tmp, content)
            .await
            .map_err(|source| StoreError::Io {
                path: tmp.clone(),
                source,
            })?;
        tokio::fs::rename(&tmp, &self.path)
            .await
            .map_err(|source| StoreError::Io {
                path: self.path.clone(),
                source,
            })?;
        Ok(())
    }

    /// Apply `f` to a copy of the table, persist it, then commit
    async fn mutate<F>(&self, f: F) -> Result<Endpoint, StoreError>
    where
        F: FnOnce(&mut EndpointTable) -> Result<Endpoint, StoreError>,
    {
        let mut guard = self.table.lock().await;
        let mut next = guard.clone();
        let endpoint = f(&mut next)?;
        self.persist(&next).await?;
        *guard = next;
        Ok(endpoint)
    }
}

#[async_trait]
impl EndpointStore for FileStore {
    async fn load_all(&self) -> Result<Vec<Endpoint>, StoreError> {
        Ok(self.table.lock().await.list())
    }

    async fn get(&self, id: EndpointId) -> Result<Endpoint, StoreError> {
        self.table.lock().await.get(id)
    }

    async fn insert(&self, new: NewEndpoint) -> Result<Endpoint, StoreError> {
        self.mutate(|table| table.insert(new)).await
    }

    async fn update(&self, id: EndpointId, new: NewEndpoint) -> Result<Endpoint, StoreError> {
        self.mutate(|table| table.update(id, new)).await
    }

    async fn update_status(
        &self,
        id: EndpointId,
        state: LifecycleState,
    ) -> Result<Endpoint, StoreError> {
        self.mutate(|table| table.update_status(id, state)).await
    }

    async fn remove(&self, id: EndpointId) -> Result<Endpoint, StoreError> {
        self.mutate(|table| table.remove(id)).await
    }
}
