use std::net::SocketAddrV4;
use std::time::Duration;

use crate::common::DEFAULT_K;

use super::socket::DEFAULT_REQUEST_TIMEOUT;

/// Default lookup parallelism (alpha).
pub const DEFAULT_ALPHA: usize = 3;

/// Default time to live of a stored record.
pub const DEFAULT_RECORD_TTL: Duration = Duration::from_secs(60 * 60);

/// Default interval at which this node re-publishes the records it originally
/// published, comfortably before [DEFAULT_RECORD_TTL] elapses.
pub const DEFAULT_REPUBLISH_INTERVAL: Duration = Duration::from_secs(45 * 60);

/// Default maximum number of records held for other nodes.
pub const DEFAULT_MAX_RECORDS: usize = 1000;

/// Dht node configuration.
#[derive(Debug, Clone)]
pub struct Config {
    /// Bucket capacity and replication factor (K).
    ///
    /// Defaults to [DEFAULT_K]
    pub k: usize,
    /// Lookup parallelism (alpha): the number of concurrently outstanding
    /// requests per lookup.
    ///
    /// Defaults to [DEFAULT_ALPHA]
    pub alpha: usize,
    /// Explicit port to listen on.
    ///
    /// Defaults to None, where an ephemeral port is used.
    pub port: Option<u16>,
    /// UDP request timeout duration.
    ///
    /// The longer this duration is, the longer lookups take until they are
    /// deemed "done". The shorter it is, the more responses from busy nodes
    /// are missed, affecting the accuracy of finding the closest nodes.
    ///
    /// Defaults to [DEFAULT_REQUEST_TIMEOUT]
    pub request_timeout: Duration,
    /// Time to live of stored records.
    ///
    /// Defaults to [DEFAULT_RECORD_TTL]
    pub record_ttl: Duration,
    /// Interval at which locally published records are re-published.
    ///
    /// Defaults to [DEFAULT_REPUBLISH_INTERVAL]
    pub republish_interval: Duration,
    /// Maximum number of records stored for the network.
    ///
    /// Defaults to [DEFAULT_MAX_RECORDS]
    pub max_records: usize,
    /// Addresses of known nodes used to seed the routing table.
    ///
    /// Defaults to none; a first node in a network doesn't need any.
    pub bootstrap: Vec<SocketAddrV4>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            k: DEFAULT_K,
            alpha: DEFAULT_ALPHA,
            port: None,
            request_timeout: DEFAULT_REQUEST_TIMEOUT,
            record_ttl: DEFAULT_RECORD_TTL,
            republish_interval: DEFAULT_REPUBLISH_INTERVAL,
            max_records: DEFAULT_MAX_RECORDS,
            bootstrap: Vec::new(),
        }
    }
}
