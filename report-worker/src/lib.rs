pub mod app_context;
pub mod batch;
pub mod cache;
pub mod config;
pub mod decoder;
pub mod dedup;
pub mod error;
pub mod metrics_consts;
pub mod pipeline;
pub mod players;
pub mod queue_engine;
pub mod server;
pub mod service;
pub mod storage;
pub mod test_utils;
pub mod transport;
pub mod types;
