pub mod audit;
pub mod clock;
pub mod config;
pub mod dedupe;
pub mod error;
pub mod handler;
pub mod metrics;
pub mod normalizer;
pub mod secrets;
pub mod types;
