pub mod agent;
pub mod config;
pub mod constants;
pub mod engine;
pub mod error;
pub mod maze;
pub mod relay_protocol;
pub mod replication;
pub mod rng;
pub mod session;
pub mod state;
pub mod types;
