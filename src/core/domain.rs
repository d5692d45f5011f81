use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Longest remark the store accepts; longer text is cut on write.
pub const REMARK_LIMIT: usize = 512;

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct ServerNode {
    pub id: i64,
    pub server: String,   // display name, unique
    pub endpoint: String, // host:port of the serving API
    #[serde(default)]
    pub remark: Option<String>,
    pub create_time: DateTime<Utc>,
}

/// Splits `host:port`. Registration rejects anything else.
pub fn split_endpoint(endpoint: &str) -> Option<(&str, u16)> {
    let (host, port) = endpoint.rsplit_once(':')?;
    if host.is_empty() { return None; }
    Some((host, port.parse().ok()?))
}

#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ModelStatus {
    NotLoaded,
    Loading,
    Loaded,
    Unloading,
    Error,
}

impl ModelStatus {
    pub fn can_load(self) -> bool {
        matches!(self, ModelStatus::NotLoaded | ModelStatus::Error)
    }
}

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct ModelDeploy {
    pub id: i64,
    pub server_id: i64,
    pub model: String,
    pub status: Option<ModelStatus>,
    /// Raw config text as the node returned it.
    pub config: Option<String>,
    pub remark: Option<String>,
    pub create_time: DateTime<Utc>,
    pub update_time: DateTime<Utc>,
}

impl ModelDeploy {
    pub fn set_remark(&mut self, remark: Option<String>) {
        self.remark = remark.map(|r| truncate(&r, REMARK_LIMIT));
    }
}

/// Char-boundary safe cut.
pub fn truncate(text: &str, limit: usize) -> String {
    match text.char_indices().nth(limit) {
        Some((idx, _)) => text[..idx].to_string(),
        None => text.to_string(),
    }
}

/// One entry of `POST /v2/repository/index`.
#[derive(Deserialize, Clone, Debug, Default)]
pub struct IndexEntry {
    pub name: String,
    #[serde(default)]
    pub state: Option<String>,
    #[serde(default)]
    pub reason: Option<String>,
}

#[derive(Serialize, Clone, Debug, PartialEq)]
pub struct GpuRecord {
    pub gpu_id: String,
    pub gpu_uuid: String,
    pub gpu_total_mem: String,
    /// Free memory, kept under the field name clients already read.
    pub gpu_used_mem: String,
    pub gpu_utility: f64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub server: Option<String>,
}

#[derive(Serialize, Clone, Debug)]
pub struct ModelDeployInfo {
    #[serde(flatten)]
    pub deploy: ModelDeploy,
    /// Display name of the owning server.
    pub server: String,
    pub sft_support: bool,
}

#[derive(Serialize, Default, Clone, Debug, PartialEq, Eq)]
pub struct ReconcileReport {
    pub created: usize,
    pub updated: usize,
    pub deleted: usize,
}

impl ReconcileReport {
    pub fn is_noop(&self) -> bool {
        self.created == 0 && self.updated == 0 && self.deleted == 0
    }
}

#[derive(Deserialize)]
pub struct ServerCreate {
    pub server: String,
    pub endpoint: String,
    #[serde(default)]
    pub remark: Option<String>,
}

#[derive(Deserialize, Default)]
pub struct DeployQuery {
    pub server: Option<String>,
}

#[derive(Deserialize)]
pub struct DeployUpdate {
    pub id: i64,
    #[serde(default)]
    pub config: Option<String>,
    #[serde(default)]
    pub remark: Option<String>,
}

#[derive(Deserialize)]
pub struct DeployAction {
    pub deploy_id: i64,
}
