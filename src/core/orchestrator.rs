use std::sync::Arc;

use serde_json::Value;
use tracing::{error, info, warn};

use crate::adapters::agent::{InferenceAgent, RemoteReply};
use crate::adapters::registry::Registry;
use crate::core::dispatch::LoadQueue;
use crate::core::domain::{truncate, ModelDeploy, ModelStatus, ServerNode, REMARK_LIMIT};
use crate::core::error::{FleetError, Result};
use crate::core::translate::translate;

pub const REQUIRED_PARAMS: [&str; 4] = ["type", "pymodel_type", "gpu_memory", "instance_groups"];

/// Checks a stored model config before it is sent to a node.
/// Keys are looked up in `parameters`, or at the top level when the config
/// has no `parameters` object.
pub fn validate_config(raw: Option<&str>) -> Result<()> {
    let raw = raw
        .filter(|r| !r.trim().is_empty())
        .ok_or_else(|| FleetError::Validation("model has no configuration".into()))?;
    let value: Value = serde_json::from_str(raw)
        .map_err(|e| FleetError::Validation(format!("configuration is not valid JSON: {}", e)))?;
    let root = value
        .as_object()
        .ok_or_else(|| FleetError::Validation("configuration must be a JSON object".into()))?;
    let params = match root.get("parameters") {
        Some(Value::Object(p)) => p,
        _ => root,
    };
    for key in REQUIRED_PARAMS {
        if params.get(key).map_or(true, is_blank) {
            return Err(FleetError::Validation(format!("required parameter '{}' is missing", key)));
        }
    }
    Ok(())
}

/// Falsy values count as unset, including `0` and `false`.
fn is_blank(v: &Value) -> bool {
    match v {
        Value::Null | Value::Bool(false) => true,
        Value::Number(n) => n.as_f64() == Some(0.0),
        Value::String(s) => s.is_empty(),
        Value::Array(a) => a.is_empty(),
        // {"string_value": ""} is how the serving config spells an unset parameter.
        Value::Object(o) => o.is_empty() || o.get("string_value").map_or(false, |s| s.as_str() == Some("")),
        _ => false,
    }
}

/// `error` field of a node's JSON reply, or the raw body.
fn remote_error(reply: &RemoteReply) -> String {
    serde_json::from_str::<Value>(&reply.body)
        .ok()
        .and_then(|v| v.get("error").and_then(Value::as_str).map(str::to_string))
        .filter(|e| !e.is_empty())
        .unwrap_or_else(|| {
            if reply.body.trim().is_empty() { format!("node answered {}", reply.status) } else { reply.body.clone() }
        })
}

pub struct Orchestrator {
    registry: Arc<Registry>,
    agent: Arc<dyn InferenceAgent>,
    queue: Arc<LoadQueue>,
}

impl Orchestrator {
    pub fn new(registry: Arc<Registry>, agent: Arc<dyn InferenceAgent>, queue: Arc<LoadQueue>) -> Self {
        Self { registry, agent, queue }
    }

    /// Marks the deployment Loading and queues the remote load. Returns once
    /// queued; the outcome lands in the store.
    pub async fn load(&self, deploy_id: i64) -> Result<()> {
        let reservation = self.queue.reserve(deploy_id)?;

        let (server, deploy) = self.registry.transaction(|t| {
            let row = t.deploys.get(&deploy_id).cloned()
                .ok_or_else(|| FleetError::NotFound(format!("deploy {}", deploy_id)))?;
            let server = t.servers.get(&row.server_id).cloned()
                .ok_or_else(|| FleetError::NotFound(format!("server {}", row.server_id)))?;
            let status = row.status.unwrap_or(ModelStatus::NotLoaded);
            if !status.can_load() {
                return Err(FleetError::Conflict(format!("model '{}' is {:?}, cannot load", row.model, status)));
            }
            validate_config(row.config.as_deref())?;
            let row = t.deploy_mut(deploy_id)?;
            row.status = Some(ModelStatus::Loading);
            Ok((server, row.clone()))
        }).await?;

        info!(event = "MODEL_LOAD_ACCEPTED", server = %server.server, model = %deploy.model, deploy.id = deploy_id, "Model marked loading");

        let job = dispatch_load(self.registry.clone(), self.agent.clone(), server, deploy);
        if let Err(e) = reservation.submit(job) {
            error!(event = "MODEL_LOAD_NOT_QUEUED", deploy.id = deploy_id, error = %e, "Load could not be queued");
            self.mark_error(deploy_id, translate("load queue unavailable")).await;
            return Err(e);
        }
        Ok(())
    }

    /// Synchronous unload. Success moves the deployment to Unloading; a
    /// failure moves it to Error so the stored status never claims more than
    /// the node confirmed.
    pub async fn unload(&self, deploy_id: i64) -> Result<()> {
        let (server, deploy) = self.registry.read(|t| {
            let row = t.deploys.get(&deploy_id).cloned()
                .ok_or_else(|| FleetError::NotFound(format!("deploy {}", deploy_id)))?;
            let server = t.servers.get(&row.server_id).cloned()
                .ok_or_else(|| FleetError::NotFound(format!("server {}", row.server_id)))?;
            Ok::<_, FleetError>((server, row))
        }).await?;

        let outcome = self.agent.unload_model(&server.endpoint, &deploy.model).await;
        let detail = match outcome {
            Ok(reply) if reply.is_ok() => {
                info!(event = "MODEL_UNLOAD_SUCCEEDED", server = %server.server, model = %deploy.model, "Unload accepted");
                self.registry.transaction(|t| {
                    t.deploy_mut(deploy_id)?.status = Some(ModelStatus::Unloading);
                    Ok(())
                }).await?;
                return Ok(());
            }
            Ok(reply) => {
                let detail = remote_error(&reply);
                warn!(event = "MODEL_UNLOAD_REJECTED", server = %server.server, model = %deploy.model, code = reply.status, body = %reply.body, "Unload rejected");
                self.mark_error(deploy_id, truncate(&format!("Unload failed, {}", detail), REMARK_LIMIT)).await;
                return Err(FleetError::RemoteRejected(format!("unload of '{}' rejected: {}", deploy.model, detail)));
            }
            Err(e) => e,
        };
        warn!(event = "MODEL_UNLOAD_UNREACHABLE", server = %server.server, model = %deploy.model, error = %detail, "Unload call failed");
        self.mark_error(deploy_id, truncate(&format!("Unload failed, {}", detail), REMARK_LIMIT)).await;
        Err(detail)
    }

    async fn mark_error(&self, deploy_id: i64, remark: String) {
        persist_error(&self.registry, deploy_id, remark).await;
    }
}

async fn persist_error(registry: &Registry, deploy_id: i64, remark: String) {
    let res = registry.transaction(|t| {
        let row = t.deploy_mut(deploy_id)?;
        row.status = Some(ModelStatus::Error);
        row.set_remark(Some(remark));
        Ok(())
    }).await;
    if let Err(e) = res {
        warn!(event = "MODEL_STATUS_NOT_STORED", deploy.id = deploy_id, error = %e, "Could not record failure");
    }
}

/// Body of a queued load. Success is only logged: the next reconcile pass sees
/// READY and promotes the row to Loaded.
async fn dispatch_load(registry: Arc<Registry>, agent: Arc<dyn InferenceAgent>, server: ServerNode, deploy: ModelDeploy) {
    let config = deploy.config.clone().unwrap_or_default();
    let failure = match agent.load_model(&server.endpoint, &deploy.model, config).await {
        Ok(reply) if reply.is_ok() => {
            info!(event = "MODEL_LOAD_SUCCEEDED", server = %server.server, model = %deploy.model, "Node accepted load");
            return;
        }
        Ok(reply) => {
            error!(event = "MODEL_LOAD_REJECTED", server = %server.server, model = %deploy.model, code = reply.status, body = %reply.body, "Node rejected load");
            remote_error(&reply)
        }
        Err(e) => {
            error!(event = "MODEL_LOAD_UNREACHABLE", server = %server.server, model = %deploy.model, error = %e, "Load call failed");
            e.to_string()
        }
    };
    persist_error(&registry, deploy.id, translate(&failure)).await;
}
