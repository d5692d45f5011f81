//! Per-GPU view built from a node's metrics exposition text.
//!
//! Four families are joined on their `gpu_uuid` label. The uuid → device id
//! family decides which GPUs exist; a GPU missing from any of the other three
//! families is dropped from the result.

use std::collections::{BTreeMap, HashMap};

use lazy_static::lazy_static;
use regex::Regex;
use tracing::{debug, warn};

use crate::adapters::agent::InferenceAgent;
use crate::core::domain::GpuRecord;

const UTILIZATION: &str = "nv_gpu_utilization";
const UUID_TO_DEVICE: &str = "nv_gpu_uuid_to_deviceid";
const MEMORY_TOTAL: &str = "nv_gpu_memory_total_bytes";
const MEMORY_USED: &str = "nv_gpu_memory_used_bytes";
const UUID_LABEL: &str = "gpu_uuid";
const GIB: f64 = 1024.0 * 1024.0 * 1024.0;

lazy_static! {
    static ref LABEL_PAIR: Regex = Regex::new(r#"([A-Za-z_][A-Za-z0-9_]*)\s*=\s*"((?:[^"\\]|\\.)*)""#).unwrap();
}

#[derive(Debug, PartialEq)]
pub struct Sample<'a> {
    pub name: &'a str,
    pub labels: Vec<(String, String)>,
    pub value: &'a str,
}

impl Sample<'_> {
    pub fn label(&self, key: &str) -> Option<&str> {
        self.labels.iter().find(|(k, _)| k == key).map(|(_, v)| v.as_str())
    }
}

/// Splits one exposition line into name, labels and value.
/// Comments, blanks and lines without a value yield `None`.
pub fn parse_line(line: &str) -> Option<Sample<'_>> {
    let line = line.trim();
    if line.is_empty() || line.starts_with('#') { return None; }

    let name_end = line.find(|c: char| c == '{' || c.is_whitespace()).unwrap_or(line.len());
    let name = &line[..name_end];
    if name.is_empty() { return None; }

    let mut rest = &line[name_end..];
    let mut labels = Vec::new();
    if rest.starts_with('{') {
        let close = closing_brace(rest)?;
        for cap in LABEL_PAIR.captures_iter(&rest[1..close]) {
            labels.push((cap[1].to_string(), unescape(&cap[2])));
        }
        rest = &rest[close + 1..];
    }

    // An optional timestamp may follow the value.
    let value = rest.split_whitespace().next()?;
    Some(Sample { name, labels, value })
}

fn closing_brace(text: &str) -> Option<usize> {
    let mut in_quote = false;
    let mut escaped = false;
    for (idx, c) in text.char_indices() {
        match c {
            _ if escaped => escaped = false,
            '\\' if in_quote => escaped = true,
            '"' => in_quote = !in_quote,
            '}' if !in_quote => return Some(idx),
            _ => {}
        }
    }
    None
}

fn unescape(raw: &str) -> String {
    raw.replace("\\\"", "\"").replace("\\n", "\n").replace("\\\\", "\\")
}

fn round2(v: f64) -> f64 {
    (v * 100.0).round() / 100.0
}

#[derive(Default)]
struct Families {
    utilization: HashMap<String, f64>,
    device: BTreeMap<String, String>,
    total: HashMap<String, f64>,
    used: HashMap<String, f64>,
}

impl Families {
    fn absorb(&mut self, sample: &Sample<'_>) {
        let Some(uuid) = sample.label(UUID_LABEL) else { return };
        let uuid = uuid.to_string();
        // NaN and +Inf parse as f64 but are not usable readings.
        let number = || sample.value.parse::<f64>().ok().filter(|v| v.is_finite());

        if sample.name.contains(UUID_TO_DEVICE) {
            self.device.insert(uuid, sample.value.to_string());
        } else if sample.name.contains(UTILIZATION) {
            if let Some(v) = number() { self.utilization.insert(uuid, round2(v)); }
        } else if sample.name.contains(MEMORY_TOTAL) {
            if let Some(v) = number() { self.total.insert(uuid, v / GIB); }
        } else if sample.name.contains(MEMORY_USED) {
            if let Some(v) = number() { self.used.insert(uuid, v / GIB); }
        }
    }
}

/// Parses a full metrics body into GPU records ordered by device id.
pub fn parse_gpu_metrics(body: &str) -> Vec<GpuRecord> {
    let mut families = Families::default();
    for sample in body.lines().filter_map(parse_line) {
        families.absorb(&sample);
    }

    let mut gpus = Vec::with_capacity(families.device.len());
    for (uuid, device_id) in &families.device {
        let (Some(util), Some(total), Some(used)) = (
            families.utilization.get(uuid),
            families.total.get(uuid),
            families.used.get(uuid),
        ) else {
            debug!(event = "GPU_RECORD_INCOMPLETE", gpu.uuid = %uuid, "Dropping GPU missing a metric family");
            continue;
        };
        gpus.push(GpuRecord {
            gpu_id: device_id.clone(),
            gpu_uuid: uuid.clone(),
            gpu_total_mem: format!("{:.2} G", total),
            gpu_used_mem: format!("{:.2} G", total - used),
            gpu_utility: *util,
            server: None,
        });
    }
    sort_by_device(&mut gpus);
    gpus
}

/// Scrapes one node. Any transport error or non-200 reply gives an empty list.
pub async fn query(agent: &dyn InferenceAgent, endpoint: &str) -> Vec<GpuRecord> {
    match agent.metrics(endpoint).await {
        Ok(body) => parse_gpu_metrics(&body),
        Err(e) => {
            warn!(event = "GPU_QUERY_EMPTY", endpoint = %endpoint, error = %e, "No GPU metrics from node");
            Vec::new()
        }
    }
}

// Numeric order when every id is an integer, string order otherwise.
fn sort_by_device(gpus: &mut [GpuRecord]) {
    let numeric: Option<Vec<u64>> = gpus.iter().map(|g| g.gpu_id.parse().ok()).collect();
    if numeric.is_some() {
        gpus.sort_by_key(|g| g.gpu_id.parse::<u64>().unwrap_or(u64::MAX));
    } else {
        gpus.sort_by(|a, b| a.gpu_id.cmp(&b.gpu_id));
    }
}
