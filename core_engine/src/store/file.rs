use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::path::{Path, PathBuf};
use tokio::fs;
use tokio::sync::Mutex;
use tracing::{debug, info};

use super::{NodeStore, StoreState, TokenStore};
use crate::error::CoreResult;
use crate::model::{Node, NodeFilter, NodeState, ProvisioningToken};

/// Store persisted as a single JSON document.
///
/// Every successful write is flushed before it becomes visible, so a failed
/// flush leaves both the file and the in-memory view unchanged.
#[derive(Debug)]
pub struct JsonFileStore {
    path: PathBuf,
    state: Mutex<StoreState>,
}

impl JsonFileStore {
    /// Open the store at `path`; a missing file starts an empty store.
    pub async fn open(path: impl Into<PathBuf>) -> CoreResult<Self> {
        let path = path.into();
        let state = match fs::read(&path).await {
            Ok(bytes) if bytes.is_empty() => StoreState::default(),
            Ok(bytes) => serde_json::from_slice(&bytes)?,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                info!(file = %path.display(), "state file not found, starting empty");
                StoreState::default()
            }
            Err(err) => return Err(err.into()),
        };

        Ok(Self {
            path,
            state: Mutex::new(state),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    async fn flush(&self, state: &StoreState) -> CoreResult<()> {
        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent).await?;
            }
        }

        let serialized = serde_json::to_vec_pretty(state)?;
        let tmp = self.path.with_extension("tmp");
        fs::write(&tmp, serialized).await?;

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            fs::set_permissions(&tmp, std::fs::Permissions::from_mode(0o600)).await?;
        }

        fs::rename(&tmp, &self.path).await?;
        debug!(file = %self.path.display(), "state flushed");
        Ok(())
    }

    async fn mutate<T>(
        &self,
        apply: impl FnOnce(&mut StoreState) -> CoreResult<T> + Send,
    ) -> CoreResult<T> {
        let mut guard = self.state.lock().await;
        let mut next = guard.clone();
        let out = apply(&mut next)?;
        self.flush(&next).await?;
        *guard = next;
        Ok(out)
    }
}

#[async_trait]
impl NodeStore for JsonFileStore {
    async fn insert(&self, node: Node) -> CoreResult<()> {
        self.mutate(|state| state.insert(node)).await
    }

    async fn get(&self, id: &str) -> CoreResult<Option<Node>> {
        Ok(self.state.lock().await.get(id))
    }

    async fn update(&self, node: Node) -> CoreResult<()> {
        self.mutate(|state| state.update(node)).await
    }

    async fn delete(&self, id: &str) -> CoreResult<Option<Node>> {
        self.mutate(|state| Ok(state.delete(id))).await
    }

    async fn list(&self, filter: &NodeFilter) -> CoreResult<Vec<Node>> {
        Ok(self.state.lock().await.list(filter))
    }

    async fn transition(&self, id: &str, from: &[NodeState], to: NodeState) -> CoreResult<Node> {
        self.mutate(|state| state.transition(id, from, to)).await
    }
}

#[async_trait]
impl TokenStore for JsonFileStore {
    async fn insert_token(&self, token: ProvisioningToken) -> CoreResult<()> {
        self.mutate(|state| state.insert_token(token)).await
    }

    async fn consume_token(&self, value: &str, now: DateTime<Utc>) -> CoreResult<ProvisioningToken> {
        self.mutate(|state| state.consume_token(value, now)).await
    }

    async fn purge_expired_tokens(&self, now: DateTime<Utc>) -> CoreResult<usize> {
        self.mutate(|state| Ok(state.purge_expired_tokens(now))).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::NodeClass;
    use std::collections::BTreeMap;
    use std::net::Ipv4Addr;
    use tempfile::tempdir;

    #[tokio::test]
    async fn survives_reopen() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("nested").join("state.json");

        let store = JsonFileStore::open(&path).await.unwrap();
        let now = Utc::now();
        store
            .insert(Node {
                id: "worker-1".to_string(),
                class: NodeClass::Worker,
                address: Ipv4Addr::new(10, 100, 1, 1),
                public_key: "pub".to_string(),
                private_key: "priv".to_string(),
                rendered_config: "[Interface]\n".to_string(),
                state: NodeState::Pending,
                metadata: BTreeMap::from([("hostname".to_string(), "w1".to_string())]),
                created_at: now,
                updated_at: now,
                deactivated_at: None,
                last_address: None,
            })
            .await
            .unwrap();
        store
            .transition("worker-1", &[NodeState::Pending], NodeState::Connecting)
            .await
            .unwrap();
        drop(store);

        let reopened = JsonFileStore::open(&path).await.unwrap();
        let node = reopened.require("worker-1").await.unwrap();
        assert_eq!(node.state, NodeState::Connecting);
        assert_eq!(node.metadata.get("hostname").map(String::as_str), Some("w1"));
        assert!(!path.with_extension("tmp").exists());
    }

    #[tokio::test]
    async fn failed_write_leaves_state_untouched() {
        let dir = tempdir().unwrap();
        let store = JsonFileStore::open(dir.path().join("state.json")).await.unwrap();

        let result = store.transition("ghost", &[], NodeState::Error).await;
        assert!(result.is_err());
        assert!(!dir.path().join("state.json").exists());
    }
}
