use std::collections::HashSet;
use std::sync::Arc;

use futures_util::future::join_all;
use tracing::{info, warn};

use crate::adapters::agent::InferenceAgent;
use crate::adapters::registry::Registry;
use crate::core::domain::{
    DeployUpdate, GpuRecord, ModelDeploy, ModelDeployInfo, ServerCreate, ServerNode,
};
use crate::core::error::{FleetError, Result};
use crate::core::orchestrator::Orchestrator;
use crate::core::{gpu_metrics, reconcile};

/// Every operation the HTTP surface exposes.
pub struct FleetService {
    registry: Arc<Registry>,
    agent: Arc<dyn InferenceAgent>,
    orchestrator: Orchestrator,
    finetuned: HashSet<String>,
}

impl FleetService {
    pub fn new(
        registry: Arc<Registry>,
        agent: Arc<dyn InferenceAgent>,
        orchestrator: Orchestrator,
        finetuned: impl IntoIterator<Item = String>,
    ) -> Self {
        Self { registry, agent, orchestrator, finetuned: finetuned.into_iter().collect() }
    }

    pub async fn add_server(&self, req: ServerCreate) -> Result<ServerNode> {
        let node = self.registry.transaction(|t| t.insert_server(req)).await?;
        info!(event = "SERVER_REGISTERED", server = %node.server, endpoint = %node.endpoint, "Server registered");
        Ok(node)
    }

    pub async fn list_servers(&self) -> Vec<ServerNode> {
        self.registry.list_servers().await
    }

    pub async fn delete_server(&self, id: i64) -> Result<()> {
        let node = self.registry
            .transaction(|t| t.remove_server(id).ok_or_else(|| FleetError::NotFound(format!("server {}", id))))
            .await?;
        info!(event = "SERVER_REMOVED", server = %node.server, "Server and its deployments removed");
        Ok(())
    }

    /// Reconciles every server, then returns the stored view sorted by model
    /// name. `server` filters by display name.
    pub async fn list_deployments(&self, server: Option<&str>) -> Result<Vec<ModelDeployInfo>> {
        reconcile::reconcile_all(&self.registry, self.agent.as_ref()).await;

        let server = server.map(str::trim).filter(|s| !s.is_empty());
        let (orphans, rows) = self.registry.transaction(|t| {
            let orphans = t.purge_orphans();
            let filter = match server {
                Some(name) => Some(
                    t.server_by_name(name).map(|s| s.id)
                        .ok_or_else(|| FleetError::NotFound(format!("server '{}'", name)))?,
                ),
                None => None,
            };
            let mut rows: Vec<(ModelDeploy, String)> = t.deploys.values()
                .filter(|d| filter.map_or(true, |id| d.server_id == id))
                .filter_map(|d| t.servers.get(&d.server_id).map(|s| (d.clone(), s.server.clone())))
                .collect();
            rows.sort_by(|a, b| a.0.model.cmp(&b.0.model).then(a.0.id.cmp(&b.0.id)));
            Ok((orphans, rows))
        }).await?;

        if !orphans.is_empty() {
            warn!(event = "ORPHAN_DEPLOYS_PURGED", ids = ?orphans, "Removed deployments of deleted servers");
        }
        Ok(rows.into_iter().map(|(deploy, server)| {
            let sft_support = self.finetuned.contains(&deploy.model);
            ModelDeployInfo { deploy, server, sft_support }
        }).collect())
    }

    /// A row whose server is gone is removed on sight and reported missing.
    pub async fn get_deployment(&self, id: i64) -> Result<ModelDeploy> {
        let row = self.registry.get_deploy(id).await?;
        let server_alive = self.registry.read(|t| t.servers.contains_key(&row.server_id)).await;
        if !server_alive {
            self.registry.transaction(|t| Ok(t.deploys.remove(&id))).await?;
            warn!(event = "ORPHAN_DEPLOYS_PURGED", deploy.id = id, "Removed deployment of deleted server");
            return Err(FleetError::NotFound(format!("deploy {}", id)));
        }
        Ok(row)
    }

    /// Applies the fields present in `update`; status is not user-editable.
    pub async fn update_deployment(&self, update: DeployUpdate) -> Result<ModelDeploy> {
        self.registry.transaction(|t| {
            let row = t.deploy_mut(update.id)?;
            if let Some(config) = update.config { row.config = Some(config); }
            if let Some(remark) = update.remark { row.set_remark(Some(remark)); }
            Ok(row.clone())
        }).await
    }

    pub async fn load(&self, deploy_id: i64) -> Result<()> {
        self.orchestrator.load(deploy_id).await
    }

    pub async fn unload(&self, deploy_id: i64) -> Result<()> {
        self.orchestrator.unload(deploy_id).await
    }

    /// GPU records of every server, tagged with the server's display name.
    pub async fn gpu_snapshot(&self) -> Vec<GpuRecord> {
        let servers = self.registry.list_servers().await;
        let per_node = join_all(servers.iter().map(|s| async move {
            let mut gpus = gpu_metrics::query(self.agent.as_ref(), &s.endpoint).await;
            for g in &mut gpus { g.server = Some(s.server.clone()); }
            gpus
        })).await;
        per_node.into_iter().flatten().collect()
    }
}

#[cfg(test)]
pub mod tests {
    use super::*;
    use crate::adapters::agent::mock::{entry, MockAgent};
    use crate::core::dispatch::LoadQueue;
    use crate::core::domain::ModelStatus;

    pub fn service(agent: Arc<MockAgent>) -> (FleetService, Arc<LoadQueue>) {
        let registry = Arc::new(Registry::in_memory());
        let queue = Arc::new(LoadQueue::start(3));
        let orchestrator = Orchestrator::new(registry.clone(), agent.clone(), queue.clone());
        (FleetService::new(registry, agent, orchestrator, vec!["llama".to_string()]), queue)
    }

    fn create(name: &str, endpoint: &str) -> ServerCreate {
        ServerCreate { server: name.into(), endpoint: endpoint.into(), remark: None }
    }

    #[tokio::test]
    async fn list_reconciles_and_annotates() {
        let agent = Arc::new(MockAgent::default());
        let (fleet, _queue) = service(agent.clone());
        let a = fleet.add_server(create("gpu-a", "10.0.0.5:8000")).await.unwrap();
        agent.set_index(&a.endpoint, vec![entry("qwen", "READY", ""), entry("llama", "UNAVAILABLE", "unloaded")]);

        let list = fleet.list_deployments(None).await.unwrap();
        let names: Vec<_> = list.iter().map(|i| (i.deploy.model.as_str(), i.sft_support, i.server.as_str())).collect();
        assert_eq!(names, vec![("llama", true, "gpu-a"), ("qwen", false, "gpu-a")]);
        assert_eq!(list[1].deploy.status, Some(ModelStatus::Loaded));
    }

    #[tokio::test]
    async fn list_filters_by_server_name() {
        let agent = Arc::new(MockAgent::default());
        let (fleet, _queue) = service(agent.clone());
        let a = fleet.add_server(create("gpu-a", "10.0.0.5:8000")).await.unwrap();
        let b = fleet.add_server(create("gpu-b", "10.0.0.6:8000")).await.unwrap();
        agent.set_index(&a.endpoint, vec![entry("qwen", "READY", "")]);
        agent.set_index(&b.endpoint, vec![entry("bge", "READY", "")]);

        let only_b = fleet.list_deployments(Some("gpu-b")).await.unwrap();
        assert_eq!(only_b.len(), 1);
        assert_eq!(only_b[0].deploy.model, "bge");
        assert!(matches!(fleet.list_deployments(Some("nope")).await, Err(FleetError::NotFound(_))));
    }

    #[tokio::test]
    async fn deleted_server_leaves_no_rows() {
        let agent = Arc::new(MockAgent::default());
        let (fleet, _queue) = service(agent.clone());
        let a = fleet.add_server(create("gpu-a", "10.0.0.5:8000")).await.unwrap();
        agent.set_index(&a.endpoint, vec![entry("qwen", "READY", "")]);
        assert_eq!(fleet.list_deployments(None).await.unwrap().len(), 1);

        fleet.delete_server(a.id).await.unwrap();
        assert!(fleet.list_deployments(None).await.unwrap().is_empty());
        assert!(matches!(fleet.delete_server(a.id).await, Err(FleetError::NotFound(_))));
    }

    #[tokio::test]
    async fn stale_row_is_dropped_on_read() {
        let agent = Arc::new(MockAgent::default());
        let (fleet, _queue) = service(agent.clone());
        let stale = fleet.registry.transaction(|t| t.insert_deploy(42, "ghost")).await.unwrap();

        assert!(matches!(fleet.get_deployment(stale.id).await, Err(FleetError::NotFound(_))));
        assert!(fleet.registry.read(|t| t.deploys.is_empty()).await);
    }

    #[tokio::test]
    async fn update_touches_only_given_fields() {
        let agent = Arc::new(MockAgent::default());
        let (fleet, _queue) = service(agent.clone());
        let a = fleet.add_server(create("gpu-a", "10.0.0.5:8000")).await.unwrap();
        let row = fleet.registry.transaction(|t| t.insert_deploy(a.id, "qwen")).await.unwrap();

        let updated = fleet.update_deployment(DeployUpdate { id: row.id, config: Some("{}".into()), remark: None }).await.unwrap();
        assert_eq!(updated.config.as_deref(), Some("{}"));
        assert_eq!(updated.remark, None);

        let updated = fleet.update_deployment(DeployUpdate { id: row.id, config: None, remark: Some("r".repeat(600)) }).await.unwrap();
        assert_eq!(updated.config.as_deref(), Some("{}"));
        assert_eq!(updated.remark.unwrap().len(), 512);

        let missing = fleet.update_deployment(DeployUpdate { id: 999, config: None, remark: None }).await;
        assert!(matches!(missing, Err(FleetError::NotFound(_))));
    }

    #[tokio::test]
    async fn gpu_snapshot_concatenates_and_tags() {
        let agent = Arc::new(MockAgent::default());
        let (fleet, _queue) = service(agent.clone());
        fleet.add_server(create("gpu-a", "10.0.0.5:8000")).await.unwrap();
        fleet.add_server(create("gpu-b", "10.0.0.6:8000")).await.unwrap();
        fleet.add_server(create("gpu-down", "10.0.0.7:8000")).await.unwrap();

        let body = "nv_gpu_utilization{gpu_uuid=\"U\"} 12.5\n\
                    nv_gpu_uuid_to_deviceid{gpu_uuid=\"U\"} 0\n\
                    nv_gpu_memory_total_bytes{gpu_uuid=\"U\"} 2147483648\n\
                    nv_gpu_memory_used_bytes{gpu_uuid=\"U\"} 1073741824\n";
        agent.metrics.lock().unwrap().insert("10.0.0.5:8000".into(), body.into());
        agent.metrics.lock().unwrap().insert("10.0.0.6:8000".into(), body.into());

        let gpus = fleet.gpu_snapshot().await;
        let servers: Vec<_> = gpus.iter().map(|g| g.server.as_deref().unwrap()).collect();
        assert_eq!(servers, vec!["gpu-a", "gpu-b"]);
        assert_eq!(gpus[0].gpu_used_mem, "1.00 G");
    }
}
