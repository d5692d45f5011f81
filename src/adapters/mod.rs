pub mod agent;
pub mod registry;
