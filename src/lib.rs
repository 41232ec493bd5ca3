pub mod config;
pub mod dispatch;
pub mod errors;
pub mod flow_config;
pub mod orchestrator;
pub mod stage;
pub mod status;
