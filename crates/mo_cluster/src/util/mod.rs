pub mod config;
pub mod duration;
pub mod errors;
pub mod hash;
pub mod metrics;
pub mod selector;
pub mod status;
pub mod telemetry;
pub mod version;
