use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use anyhow::Context;
use chrono::Utc;
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use tracing::{info, warn};

use crate::core::domain::{split_endpoint, ModelDeploy, ServerCreate, ServerNode};
use crate::core::error::{FleetError, Result};

/// Server and deployment tables. Mutated only inside `Registry::transaction`.
#[derive(Serialize, Deserialize, Default, Clone, Debug)]
pub struct Tables {
    pub servers: BTreeMap<i64, ServerNode>,
    pub deploys: BTreeMap<i64, ModelDeploy>,
    next_server_id: i64,
    next_deploy_id: i64,
}

impl Tables {
    pub fn server_by_name(&self, name: &str) -> Option<&ServerNode> {
        self.servers.values().find(|s| s.server == name)
    }

    pub fn deploys_for(&self, server_id: i64) -> impl Iterator<Item = &ModelDeploy> {
        self.deploys.values().filter(move |d| d.server_id == server_id)
    }

    pub fn insert_server(&mut self, req: ServerCreate) -> Result<ServerNode> {
        let name = req.server.trim().to_string();
        let endpoint = req.endpoint.trim().trim_start_matches("http://").trim_end_matches('/').to_string();
        if name.is_empty() {
            return Err(FleetError::Validation("server name must not be empty".into()));
        }
        if split_endpoint(&endpoint).is_none() {
            return Err(FleetError::Validation(format!("endpoint '{}' is not host:port", req.endpoint)));
        }
        if self.server_by_name(&name).is_some() {
            return Err(FleetError::Conflict(format!("server '{}' already exists", name)));
        }
        self.next_server_id += 1;
        let node = ServerNode {
            id: self.next_server_id,
            server: name,
            endpoint,
            remark: req.remark,
            create_time: Utc::now(),
        };
        self.servers.insert(node.id, node.clone());
        Ok(node)
    }

    /// Creates a row for `(server_id, model)` with no status yet.
    pub fn insert_deploy(&mut self, server_id: i64, model: &str) -> Result<ModelDeploy> {
        if self.deploys_for(server_id).any(|d| d.model == model) {
            return Err(FleetError::Conflict(format!("model '{}' already tracked on server {}", model, server_id)));
        }
        self.next_deploy_id += 1;
        let now = Utc::now();
        let row = ModelDeploy {
            id: self.next_deploy_id,
            server_id,
            model: model.to_string(),
            status: None,
            config: None,
            remark: None,
            create_time: now,
            update_time: now,
        };
        self.deploys.insert(row.id, row.clone());
        Ok(row)
    }

    pub fn deploy_mut(&mut self, id: i64) -> Result<&mut ModelDeploy> {
        let row = self.deploys.get_mut(&id).ok_or_else(|| FleetError::NotFound(format!("deploy {}", id)))?;
        row.update_time = Utc::now();
        Ok(row)
    }

    /// Removes the server and every deployment it owns.
    pub fn remove_server(&mut self, id: i64) -> Option<ServerNode> {
        let node = self.servers.remove(&id)?;
        self.deploys.retain(|_, d| d.server_id != id);
        Some(node)
    }

    /// Drops rows whose owning server no longer exists.
    pub fn purge_orphans(&mut self) -> Vec<i64> {
        let orphans: Vec<i64> = self.deploys.values()
            .filter(|d| !self.servers.contains_key(&d.server_id))
            .map(|d| d.id)
            .collect();
        for id in &orphans { self.deploys.remove(id); }
        orphans
    }
}

pub struct Registry {
    tables: Mutex<Tables>,
    path: Option<PathBuf>,
}

impl Registry {
    pub fn in_memory() -> Self {
        Self { tables: Mutex::new(Tables::default()), path: None }
    }

    /// Opens a registry backed by a JSON snapshot; a missing file starts empty.
    pub async fn open(path: impl Into<PathBuf>) -> anyhow::Result<Self> {
        let path = path.into();
        let tables = match tokio::fs::read(&path).await {
            Ok(bytes) => serde_json::from_slice(&bytes)
                .with_context(|| format!("corrupt registry snapshot {}", path.display()))?,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                warn!(event = "REGISTRY_SNAPSHOT_MISSING", path = %path.display(), "Starting with an empty registry");
                Tables::default()
            }
            Err(e) => return Err(e).with_context(|| format!("reading {}", path.display())),
        };
        info!(event = "REGISTRY_OPENED", path = %path.display(), servers = tables.servers.len(), deploys = tables.deploys.len(), "Registry loaded");
        Ok(Self { tables: Mutex::new(tables), path: Some(path) })
    }

    pub async fn read<R>(&self, f: impl FnOnce(&Tables) -> R) -> R {
        let guard = self.tables.lock().await;
        f(&guard)
    }

    /// Runs `f` against a draft copy. The draft replaces the live tables only
    /// when `f` succeeds and the snapshot (if any) was written.
    pub async fn transaction<R>(&self, f: impl FnOnce(&mut Tables) -> Result<R>) -> Result<R> {
        let mut guard = self.tables.lock().await;
        let mut draft = guard.clone();
        let out = f(&mut draft)?;
        if let Some(path) = &self.path {
            persist(path, &draft).await?;
        }
        *guard = draft;
        Ok(out)
    }

    pub async fn list_servers(&self) -> Vec<ServerNode> {
        self.read(|t| t.servers.values().cloned().collect()).await
    }

    pub async fn get_deploy(&self, id: i64) -> Result<ModelDeploy> {
        self.read(|t| t.deploys.get(&id).cloned())
            .await
            .ok_or_else(|| FleetError::NotFound(format!("deploy {}", id)))
    }
}

async fn persist(path: &Path, tables: &Tables) -> anyhow::Result<()> {
    let bytes = serde_json::to_vec_pretty(tables)?;
    let tmp = path.with_extension("tmp");
    tokio::fs::write(&tmp, bytes).await.with_context(|| format!("writing {}", tmp.display()))?;
    tokio::fs::rename(&tmp, path).await.with_context(|| format!("replacing {}", path.display()))?;
    Ok(())
}
