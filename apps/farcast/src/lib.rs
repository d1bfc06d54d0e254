pub mod config;
pub mod display;
pub mod pipeline;
pub mod signaling;
pub mod supervisor;
pub mod telemetry;
