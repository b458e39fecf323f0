use std::path::PathBuf;

use crate::net::PROTOCOL_VERSION;

/// A server added manually (configuration or command line).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServerSpec {
    pub hostname: String,
    pub port: u16,
    pub secure_port: Option<u16>,
}

#[derive(Debug, Clone)]
pub struct ClientConfig {
    pub protocol_version: u32,
    pub map_width: u8,
    pub map_height: u8,
    pub sound: bool,
    /// Seconds between keepalive probes while connected.
    pub keepalive_interval_secs: u64,
    pub connect_timeout_secs: u64,
    /// Re-fetch attempts for a resource whose digest keeps mismatching.
    pub integrity_retry_limit: u32,
    pub metaserver_urls: Vec<String>,
    pub query_metaserver: bool,
    pub reconnect: bool,
    pub servers: Vec<ServerSpec>,
    pub cache_dir: PathBuf,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            protocol_version: PROTOCOL_VERSION,
            map_width: 17,
            map_height: 17,
            sound: true,
            keepalive_interval_secs: 120,
            connect_timeout_secs: 10,
            integrity_retry_limit: 3,
            metaserver_urls: vec!["https://meta.mistvale.org/servers".to_string()],
            query_metaserver: true,
            reconnect: false,
            servers: Vec::new(),
            cache_dir: PathBuf::from("cache"),
        }
    }
}
