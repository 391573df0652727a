pub mod agent;
pub mod config;
pub mod controller;
pub mod counter;
pub mod error;
pub mod forwarder;
pub mod metrics;
pub mod protocol;
pub mod rpc;
pub mod session;
pub mod snapshot;
pub mod subject;

use tracing_subscriber::EnvFilter;

pub fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).init();
}
