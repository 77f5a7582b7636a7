// Wire format
pub mod records;
pub mod packet;

// Policy and resolution
pub mod config;
pub mod policy;
pub mod answers;
pub mod rewrite;
pub mod resolver;

// I/O
pub mod upstream;
pub mod server;
pub mod logging;

#[cfg(test)]
mod test_support;

pub use config::{DnsConfig, PolicyConfig};

use std::sync::Arc;

/// Everything a listener needs to answer queries. Immutable after startup.
pub struct DnsState {
    pub policy: config::PolicyConfig,
    pub upstream: upstream::UpstreamForwarder,
    pub query_logger: logging::QueryLogger,
}

impl DnsState {
    pub fn new(policy: config::PolicyConfig, query_logger: logging::QueryLogger) -> Self {
        let upstream = upstream::UpstreamForwarder::new(policy.upstream(), policy.upstream_timeout_ms());
        Self {
            policy,
            upstream,
            query_logger,
        }
    }
}

pub type SharedDnsState = Arc<DnsState>;
