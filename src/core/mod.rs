pub mod dispatch;
pub mod domain;
pub mod error;
pub mod fleet;
pub mod gpu_metrics;
pub mod orchestrator;
pub mod reconcile;
pub mod translate;
