use std::collections::{HashMap, HashSet};

use chrono::Utc;
use futures_util::future::join_all;
use tracing::{debug, error, info, warn};

use crate::adapters::agent::InferenceAgent;
use crate::adapters::registry::Registry;
use crate::core::domain::{IndexEntry, ModelDeploy, ModelStatus, ReconcileReport, ServerNode};
use crate::core::translate::translate;

const READY: &str = "READY";
const UNAVAILABLE: &str = "UNAVAILABLE";
const UNLOADED: &str = "unloaded";

#[derive(Debug, Clone, PartialEq)]
pub struct Derived {
    pub status: ModelStatus,
    /// `Some` replaces the stored remark, `None` keeps it.
    pub remark: Option<String>,
}

/// Maps a node's view of a model onto the local status.
pub fn derive_status(state: Option<&str>, reason: Option<&str>, current: Option<ModelStatus>) -> Derived {
    let state = state.unwrap_or_default();
    let reason = reason.unwrap_or_default();
    match state {
        READY => Derived { status: ModelStatus::Loaded, remark: None },
        UNAVAILABLE if reason == UNLOADED => Derived { status: ModelStatus::NotLoaded, remark: None },
        UNAVAILABLE => {
            let reason = if reason.is_empty() { "unknown reason" } else { reason };
            Derived { status: ModelStatus::Error, remark: Some(translate(reason)) }
        }
        // No state reported: the node does not hold the model.
        "" => Derived { status: ModelStatus::NotLoaded, remark: None },
        // Transitional states (LOADING, UNLOADING) keep what we have.
        _ => Derived { status: current.unwrap_or(ModelStatus::NotLoaded), remark: None },
    }
}

struct Planned {
    model: String,
    derived: Derived,
    config: Option<String>,
}

/// Aligns the stored rows of `server` with the node's repository index.
/// Never fails: an unreachable node leaves the rows as they are.
pub async fn reconcile(registry: &Registry, agent: &dyn InferenceAgent, server: &ServerNode) -> ReconcileReport {
    let entries = match agent.repository_index(&server.endpoint).await {
        Ok(entries) => entries,
        Err(e) => {
            warn!(event = "RECONCILE_INDEX_UNAVAILABLE", server = %server.server, error = %e, "Repository index not available, skipping");
            return ReconcileReport::default();
        }
    };

    let local: HashMap<String, ModelDeploy> = registry
        .read(|t| t.deploys_for(server.id).map(|d| (d.model.clone(), d.clone())).collect())
        .await;

    let plan = plan_changes(agent, server, &entries, &local).await;
    let seen: HashSet<&str> = plan.iter().map(|p| p.model.as_str()).collect();
    let stale: Vec<i64> = local.values().filter(|d| !seen.contains(d.model.as_str())).map(|d| d.id).collect();

    let server_id = server.id;
    let committed = registry.transaction(move |t| {
        let mut report = ReconcileReport::default();
        // Server deleted while we were talking to it.
        if !t.servers.contains_key(&server_id) { return Ok(report); }

        for p in plan {
            let existing = t.deploys_for(server_id).find(|d| d.model == p.model).map(|d| d.id);
            let id = match existing {
                Some(id) => id,
                None => {
                    report.created += 1;
                    t.insert_deploy(server_id, &p.model)?.id
                }
            };
            let Some(row) = t.deploys.get_mut(&id) else { continue };
            let before = row.clone();
            row.status = Some(p.derived.status);
            if let Some(remark) = p.derived.remark { row.set_remark(Some(remark)); }
            if row.config.is_none() { row.config = p.config; }
            if existing.is_some() && *row != before {
                row.update_time = Utc::now();
                report.updated += 1;
            }
        }
        for id in stale {
            if t.deploys.remove(&id).is_some() { report.deleted += 1; }
        }
        Ok(report)
    }).await;

    match committed {
        Ok(report) => {
            if report.is_noop() {
                debug!(event = "RECONCILE_NOOP", server = %server.server, "No changes");
            } else {
                info!(event = "RECONCILE_APPLIED", server = %server.server, created = report.created, updated = report.updated, deleted = report.deleted, "Deployments reconciled");
            }
            report
        }
        Err(e) => {
            error!(event = "RECONCILE_COMMIT_FAILED", server = %server.server, error = %e, "Could not store reconciled deployments");
            ReconcileReport::default()
        }
    }
}

async fn plan_changes(
    agent: &dyn InferenceAgent,
    server: &ServerNode,
    entries: &[IndexEntry],
    local: &HashMap<String, ModelDeploy>,
) -> Vec<Planned> {
    let mut plan: Vec<Planned> = Vec::with_capacity(entries.len());
    let mut names = HashSet::new();
    for entry in entries {
        // Nodes list one entry per version; the first one wins.
        if entry.name.is_empty() || !names.insert(entry.name.as_str()) { continue; }

        let current = local.get(&entry.name);
        let derived = derive_status(entry.state.as_deref(), entry.reason.as_deref(), current.and_then(|d| d.status));

        let mut config = current.and_then(|d| d.config.clone());
        if config.is_none() {
            match agent.model_config(&server.endpoint, &entry.name).await {
                Ok(raw) => config = Some(raw),
                Err(e) => warn!(event = "MODEL_CONFIG_UNAVAILABLE", server = %server.server, model = %entry.name, error = %e, "Config fetch failed"),
            }
        }
        plan.push(Planned { model: entry.name.clone(), derived, config });
    }
    plan
}

/// Reconciles every registered server concurrently.
pub async fn reconcile_all(registry: &Registry, agent: &dyn InferenceAgent) -> ReconcileReport {
    let servers = registry.list_servers().await;
    let reports = join_all(servers.iter().map(|s| reconcile(registry, agent, s))).await;
    reports.into_iter().fold(ReconcileReport::default(), |mut acc, r| {
        acc.created += r.created;
        acc.updated += r.updated;
        acc.deleted += r.deleted;
        acc
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapters::agent::mock::{entry, MockAgent};
    use crate::core::domain::ServerCreate;

    async fn setup(agent: &MockAgent) -> (Registry, ServerNode) {
        let registry = Registry::in_memory();
        let server = registry
            .transaction(|t| t.insert_server(ServerCreate { server: "gpu-a".into(), endpoint: "10.0.0.5:8000".into(), remark: None }))
            .await
            .unwrap();
        agent.configs.lock().unwrap().insert("llama".into(), "{\"name\":\"llama\"}".into());
        agent.configs.lock().unwrap().insert("qwen".into(), "{\"name\":\"qwen\"}".into());
        agent.configs.lock().unwrap().insert("bge".into(), "{\"name\":\"bge\"}".into());
        (registry, server)
    }

    async fn models(registry: &Registry, server_id: i64) -> Vec<(String, Option<ModelStatus>)> {
        let mut rows: Vec<_> = registry
            .read(|t| t.deploys_for(server_id).map(|d| (d.model.clone(), d.status)).collect())
            .await;
        rows.sort_by(|a, b| a.0.cmp(&b.0));
        rows
    }

    #[test]
    fn status_derivation() {
        assert_eq!(derive_status(Some("READY"), None, None).status, ModelStatus::Loaded);
        assert_eq!(derive_status(Some("UNAVAILABLE"), Some("unloaded"), Some(ModelStatus::Loaded)).status, ModelStatus::NotLoaded);

        let failed = derive_status(Some("UNAVAILABLE"), Some("OutOfMemoryError(GPU-0;x)"), None);
        assert_eq!(failed.status, ModelStatus::Error);
        assert!(failed.remark.unwrap().contains("GPU-0"));

        let blank = derive_status(Some("UNAVAILABLE"), None, None);
        assert_eq!(blank.status, ModelStatus::Error);
        assert!(!blank.remark.unwrap().is_empty());

        assert_eq!(derive_status(None, None, None).status, ModelStatus::NotLoaded);
        assert_eq!(derive_status(Some(""), Some(""), None).status, ModelStatus::NotLoaded);
        assert_eq!(derive_status(None, None, Some(ModelStatus::Loading)).status, ModelStatus::NotLoaded);
        assert_eq!(derive_status(Some(""), None, Some(ModelStatus::Loaded)).status, ModelStatus::NotLoaded);
        assert_eq!(derive_status(Some("LOADING"), None, Some(ModelStatus::Loading)).status, ModelStatus::Loading);
        assert_eq!(derive_status(Some("LOADING"), None, None).status, ModelStatus::NotLoaded);
    }

    #[tokio::test]
    async fn empty_remote_state_releases_stuck_loading_row() {
        let agent = MockAgent::default();
        let (registry, server) = setup(&agent).await;
        let row = registry.transaction(|t| {
            let row = t.insert_deploy(server.id, "llama")?;
            t.deploy_mut(row.id)?.status = Some(ModelStatus::Loading);
            Ok(row)
        }).await.unwrap();

        agent.set_index(&server.endpoint, vec![entry("llama", "", "")]);
        let report = reconcile(&registry, &agent, &server).await;
        assert_eq!(report.updated, 1);
        assert_eq!(registry.get_deploy(row.id).await.unwrap().status, Some(ModelStatus::NotLoaded));
    }

    #[tokio::test]
    async fn local_rows_mirror_remote_index() {
        let agent = MockAgent::default();
        let (registry, server) = setup(&agent).await;
        registry.transaction(|t| t.insert_deploy(server.id, "retired")).await.unwrap();

        agent.set_index(&server.endpoint, vec![
            entry("llama", "READY", ""),
            entry("qwen", "UNAVAILABLE", "unloaded"),
            entry("bge", "UNAVAILABLE", "failed to load"),
        ]);
        let report = reconcile(&registry, &agent, &server).await;
        assert_eq!(report, ReconcileReport { created: 3, updated: 0, deleted: 1 });

        assert_eq!(models(&registry, server.id).await, vec![
            ("bge".to_string(), Some(ModelStatus::Error)),
            ("llama".to_string(), Some(ModelStatus::Loaded)),
            ("qwen".to_string(), Some(ModelStatus::NotLoaded)),
        ]);
        let bge = registry.read(|t| t.deploys_for(server.id).find(|d| d.model == "bge").cloned()).await.unwrap();
        assert_eq!(bge.remark.as_deref(), Some("Load failed, failed to load"));
        assert_eq!(bge.config.as_deref(), Some("{\"name\":\"bge\"}"));
    }

    #[tokio::test]
    async fn second_pass_is_a_noop() {
        let agent = MockAgent::default();
        let (registry, server) = setup(&agent).await;
        agent.set_index(&server.endpoint, vec![entry("llama", "READY", ""), entry("bge", "UNAVAILABLE", "boom")]);

        let first = reconcile(&registry, &agent, &server).await;
        assert_eq!(first.created, 2);
        let config_calls = agent.calls().iter().filter(|c| c.starts_with("config")).count();

        let second = reconcile(&registry, &agent, &server).await;
        assert!(second.is_noop(), "{:?}", second);
        // Cached configs are not fetched again.
        assert_eq!(agent.calls().iter().filter(|c| c.starts_with("config")).count(), config_calls);
    }

    #[tokio::test]
    async fn status_change_counts_as_update() {
        let agent = MockAgent::default();
        let (registry, server) = setup(&agent).await;
        agent.set_index(&server.endpoint, vec![entry("llama", "UNAVAILABLE", "unloaded")]);
        reconcile(&registry, &agent, &server).await;

        agent.set_index(&server.endpoint, vec![entry("llama", "READY", "")]);
        let report = reconcile(&registry, &agent, &server).await;
        assert_eq!(report, ReconcileReport { created: 0, updated: 1, deleted: 0 });
        assert_eq!(models(&registry, server.id).await, vec![("llama".to_string(), Some(ModelStatus::Loaded))]);
    }

    #[tokio::test]
    async fn unreachable_node_keeps_local_rows() {
        let agent = MockAgent::default();
        let (registry, server) = setup(&agent).await;
        registry.transaction(|t| t.insert_deploy(server.id, "llama")).await.unwrap();

        let report = reconcile(&registry, &agent, &server).await;
        assert!(report.is_noop());
        assert_eq!(models(&registry, server.id).await.len(), 1);
    }

    #[tokio::test]
    async fn missing_config_is_retried_next_pass() {
        let agent = MockAgent::default();
        let (registry, server) = setup(&agent).await;
        agent.set_index(&server.endpoint, vec![entry("mistral", "READY", "")]);

        reconcile(&registry, &agent, &server).await;
        let row = registry.read(|t| t.deploys_for(server.id).next().cloned()).await.unwrap();
        assert_eq!(row.config, None);

        agent.configs.lock().unwrap().insert("mistral".into(), "{}".into());
        let report = reconcile(&registry, &agent, &server).await;
        assert_eq!(report.updated, 1);
        let row = registry.read(|t| t.deploys_for(server.id).next().cloned()).await.unwrap();
        assert_eq!(row.config.as_deref(), Some("{}"));
    }

    #[tokio::test]
    async fn reconcile_all_covers_every_server() {
        let agent = MockAgent::default();
        let (registry, a) = setup(&agent).await;
        let b = registry
            .transaction(|t| t.insert_server(ServerCreate { server: "gpu-b".into(), endpoint: "10.0.0.6:8000".into(), remark: None }))
            .await
            .unwrap();
        agent.set_index(&a.endpoint, vec![entry("llama", "READY", "")]);
        agent.set_index(&b.endpoint, vec![entry("llama", "READY", ""), entry("qwen", "READY", "")]);

        let report = reconcile_all(&registry, &agent).await;
        assert_eq!(report.created, 3);
        assert_eq!(models(&registry, b.id).await.len(), 2);
    }
}
