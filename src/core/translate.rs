use crate::core::domain::{truncate, REMARK_LIMIT};

const OOM_MARKER: &str = "OutOfMemoryError";

/// Turns a raw failure from an inference node into an operator-facing remark.
/// The result never exceeds `REMARK_LIMIT` characters.
pub fn translate(raw: &str) -> String {
    let message = match oom_device(raw) {
        Some(device) => format!("Load failed, GPU {} has insufficient memory", device),
        None => format!("Load failed, {}", raw),
    };
    truncate(&message, REMARK_LIMIT)
}

// Device id sits between the first '(' and the next ';'.
fn oom_device(raw: &str) -> Option<&str> {
    if !raw.contains(OOM_MARKER) { return None; }
    let (_, rest) = raw.split_once('(')?;
    let device = rest.split(';').next()?.trim();
    if device.is_empty() { None } else { Some(device) }
}
