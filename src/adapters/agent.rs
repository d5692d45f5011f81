use std::time::Duration;

use anyhow::Context;
use async_trait::async_trait;
use reqwest::Client;
use tracing::debug;

use crate::core::domain::{split_endpoint, IndexEntry};
use crate::core::error::{FleetError, Result};

/// Status and body of a node reply that the caller must interpret itself.
#[derive(Debug, Clone, PartialEq)]
pub struct RemoteReply {
    pub status: u16,
    pub body: String,
}

impl RemoteReply {
    pub fn is_ok(&self) -> bool {
        self.status == 200
    }
}

/// Repository and metrics API of an inference node, addressed by `host:port`.
#[async_trait]
pub trait InferenceAgent: Send + Sync {
    async fn repository_index(&self, endpoint: &str) -> Result<Vec<IndexEntry>>;
    async fn model_config(&self, endpoint: &str, model: &str) -> Result<String>;
    async fn load_model(&self, endpoint: &str, model: &str, config: String) -> Result<RemoteReply>;
    async fn unload_model(&self, endpoint: &str, model: &str) -> Result<RemoteReply>;
    async fn metrics(&self, endpoint: &str) -> Result<String>;
}

#[derive(Clone)]
pub struct HttpAgent {
    client: Client,
}

impl HttpAgent {
    pub fn new(timeout: Duration) -> anyhow::Result<Self> {
        let client = Client::builder()
            .timeout(timeout)
            .build()
            .context("building HTTP client")?;
        Ok(Self { client })
    }

    async fn post(&self, url: String, body: Option<String>) -> Result<RemoteReply> {
        debug!(url = %url, "POST to inference node");
        let mut req = self.client.post(&url);
        if let Some(body) = body { req = req.body(body); }
        let resp = req.send().await.map_err(|e| unavailable(&url, e))?;
        let status = resp.status().as_u16();
        let body = resp.text().await.map_err(|e| unavailable(&url, e))?;
        Ok(RemoteReply { status, body })
    }
}

fn unavailable(url: &str, e: reqwest::Error) -> FleetError {
    let kind = if e.is_timeout() { "timed out" } else { "failed" };
    FleetError::RemoteUnavailable(format!("{} {}: {}", url, kind, e))
}

fn expect_ok(url: &str, reply: RemoteReply) -> Result<String> {
    if reply.is_ok() {
        Ok(reply.body)
    } else {
        Err(FleetError::RemoteUnavailable(format!("{} answered {}", url, reply.status)))
    }
}

/// Metrics are served one port above the serving API.
pub fn metrics_url(endpoint: &str) -> Result<String> {
    let (host, port) = split_endpoint(endpoint)
        .ok_or_else(|| FleetError::Validation(format!("endpoint '{}' is not host:port", endpoint)))?;
    let port = port.checked_add(1)
        .ok_or_else(|| FleetError::Validation(format!("endpoint '{}' has no metrics port", endpoint)))?;
    Ok(format!("http://{}:{}/metrics", host, port))
}

#[async_trait]
impl InferenceAgent for HttpAgent {
    async fn repository_index(&self, endpoint: &str) -> Result<Vec<IndexEntry>> {
        let url = format!("http://{}/v2/repository/index", endpoint);
        let body = expect_ok(&url, self.post(url.clone(), None).await?)?;
        serde_json::from_str(&body)
            .map_err(|e| FleetError::RemoteUnavailable(format!("{} returned a malformed index: {}", url, e)))
    }

    async fn model_config(&self, endpoint: &str, model: &str) -> Result<String> {
        let url = format!("http://{}/v2/repository/models/{}/config", endpoint, model);
        expect_ok(&url, self.post(url.clone(), None).await?)
    }

    async fn load_model(&self, endpoint: &str, model: &str, config: String) -> Result<RemoteReply> {
        self.post(format!("http://{}/v2/repository/models/{}/load", endpoint, model), Some(config)).await
    }

    async fn unload_model(&self, endpoint: &str, model: &str) -> Result<RemoteReply> {
        self.post(format!("http://{}/v2/repository/models/{}/unload", endpoint, model), None).await
    }

    async fn metrics(&self, endpoint: &str) -> Result<String> {
        let url = metrics_url(endpoint)?;
        debug!(url = %url, "GET metrics");
        let resp = self.client.get(&url).send().await.map_err(|e| unavailable(&url, e))?;
        let status = resp.status().as_u16();
        let body = resp.text().await.map_err(|e| unavailable(&url, e))?;
        expect_ok(&url, RemoteReply { status, body })
    }
}

#[cfg(test)]
pub mod mock {
    //! Scriptable node used by the reconcile, orchestration and route tests.

    use super::*;
    use std::collections::HashMap;
    use std::sync::Mutex;

    #[derive(Default)]
    pub struct MockAgent {
        pub index: Mutex<HashMap<String, Vec<IndexEntry>>>,
        pub configs: Mutex<HashMap<String, String>>,
        pub metrics: Mutex<HashMap<String, String>>,
        pub load_reply: Mutex<Option<RemoteReply>>,
        pub unload_reply: Mutex<Option<RemoteReply>>,
        pub load_delay: Mutex<Option<Duration>>,
        pub calls: Mutex<Vec<String>>,
    }

    pub fn entry(name: &str, state: &str, reason: &str) -> IndexEntry {
        let opt = |s: &str| if s.is_empty() { None } else { Some(s.to_string()) };
        IndexEntry { name: name.into(), state: opt(state), reason: opt(reason) }
    }

    impl MockAgent {
        pub fn set_index(&self, endpoint: &str, entries: Vec<IndexEntry>) {
            self.index.lock().unwrap().insert(endpoint.to_string(), entries);
        }

        pub fn calls(&self) -> Vec<String> {
            self.calls.lock().unwrap().clone()
        }

        fn record(&self, call: String) {
            self.calls.lock().unwrap().push(call);
        }
    }

    fn down(endpoint: &str) -> FleetError {
        FleetError::RemoteUnavailable(format!("{} unreachable", endpoint))
    }

    #[async_trait]
    impl InferenceAgent for MockAgent {
        async fn repository_index(&self, endpoint: &str) -> Result<Vec<IndexEntry>> {
            self.record(format!("index {}", endpoint));
            self.index.lock().unwrap().get(endpoint).cloned().ok_or_else(|| down(endpoint))
        }

        async fn model_config(&self, endpoint: &str, model: &str) -> Result<String> {
            self.record(format!("config {} {}", endpoint, model));
            self.configs.lock().unwrap().get(model).cloned().ok_or_else(|| down(endpoint))
        }

        async fn load_model(&self, endpoint: &str, model: &str, _config: String) -> Result<RemoteReply> {
            self.record(format!("load {} {}", endpoint, model));
            let delay = *self.load_delay.lock().unwrap();
            if let Some(delay) = delay { tokio::time::sleep(delay).await; }
            self.load_reply.lock().unwrap().clone().ok_or_else(|| down(endpoint))
        }

        async fn unload_model(&self, endpoint: &str, model: &str) -> Result<RemoteReply> {
            self.record(format!("unload {} {}", endpoint, model));
            self.unload_reply.lock().unwrap().clone().ok_or_else(|| down(endpoint))
        }

        async fn metrics(&self, endpoint: &str) -> Result<String> {
            self.record(format!("metrics {}", endpoint));
            self.metrics.lock().unwrap().get(endpoint).cloned().ok_or_else(|| down(endpoint))
        }
    }
}
