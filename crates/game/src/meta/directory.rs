use serde::Deserialize;

use super::descriptor::{ServerCertificate, ServerDescriptor, TrustMaterial};
use crate::http::{FetchRequest, FetchState, HttpFetcher};

/// One server entry in a metaserver response body (a JSON array of
/// these).
#[derive(Debug, Deserialize)]
struct MetaserverEntry {
    name: String,
    hostname: String,
    port: u16,
    #[serde(default)]
    secure_port: Option<u16>,
    #[serde(default)]
    version: String,
    #[serde(default)]
    description: String,
    #[serde(default)]
    players: Option<u32>,
    #[serde(default)]
    certificate: Option<String>,
    #[serde(default)]
    public_key: Option<String>,
}

impl MetaserverEntry {
    fn into_descriptor(self) -> ServerDescriptor {
        let trust = match (self.certificate, self.public_key) {
            (Some(text), _) => match ServerCertificate::parse(&text) {
                Ok(cert) => Some(TrustMaterial::Certificate(cert)),
                Err(err) => {
                    log::warn!("ignoring bad certificate for {}: {}", self.hostname, err);
                    None
                }
            },
            (None, Some(pin)) => Some(TrustMaterial::PublicKey(pin.to_ascii_lowercase())),
            (None, None) => None,
        };

        ServerDescriptor {
            name: self.name,
            hostname: self.hostname,
            plain_port: self.port,
            secure_port: self.secure_port,
            version: self.version,
            description: self.description,
            players: self.players,
            discovered: true,
            trust,
        }
    }
}

/// An in-flight discovery refresh: one GET per configured metaserver
/// endpoint, responses accumulated until all are terminal.
struct MetaserverQuery {
    requests: Vec<FetchRequest>,
}

impl MetaserverQuery {
    fn finished(&self) -> bool {
        self.requests
            .iter()
            .all(|request| request.state() != FetchState::InProgress)
    }

    fn collect(self) -> Vec<ServerDescriptor> {
        let mut servers = Vec::new();
        for request in self.requests {
            match request.state() {
                FetchState::Ok => {
                    let body = request.body().unwrap_or_default();
                    match serde_json::from_slice::<Vec<MetaserverEntry>>(&body) {
                        Ok(entries) => {
                            servers.extend(entries.into_iter().map(MetaserverEntry::into_descriptor));
                        }
                        Err(err) => {
                            log::warn!("bad metaserver response from {}: {}", request.url(), err);
                        }
                    }
                }
                _ => {
                    log::warn!(
                        "metaserver query {} failed: {}",
                        request.url(),
                        request.error().unwrap_or_else(|| "unknown error".to_string())
                    );
                }
            }
        }
        servers
    }
}

/// The candidate server list: manually-added entries that survive
/// refreshes plus a discovered subset swapped atomically per refresh.
#[derive(Default)]
pub struct ServerDirectory {
    statics: Vec<ServerDescriptor>,
    discovered: Vec<ServerDescriptor>,
    generation: u64,
    query: Option<MetaserverQuery>,
}

impl ServerDirectory {
    pub fn new() -> Self {
        Self::default()
    }

    /// Idempotent append keyed by hostname+port. Manual entries persist
    /// across discovery refreshes.
    pub fn add_static(&mut self, descriptor: ServerDescriptor) {
        if self
            .statics
            .iter()
            .any(|existing| same_endpoint(existing, &descriptor))
        {
            return;
        }
        self.statics.push(descriptor);
        self.generation += 1;
    }

    pub fn clear_discovered(&mut self) {
        if !self.discovered.is_empty() {
            self.discovered.clear();
            self.generation += 1;
        }
    }

    /// Atomically swap the discovered subset. Incoming entries are
    /// de-duplicated by hostname+port (against each other and against the
    /// manual entries). The generation only moves when the visible list
    /// actually changes.
    pub fn replace_discovered(&mut self, list: Vec<ServerDescriptor>) {
        let mut deduped: Vec<ServerDescriptor> = Vec::with_capacity(list.len());
        for mut descriptor in list {
            descriptor.discovered = true;
            let duplicate = deduped.iter().any(|d| same_endpoint(d, &descriptor))
                || self.statics.iter().any(|d| same_endpoint(d, &descriptor));
            if !duplicate {
                deduped.push(descriptor);
            }
        }

        if deduped != self.discovered {
            self.discovered = deduped;
            self.generation += 1;
        }
    }

    pub fn get(&self, index: usize) -> Option<&ServerDescriptor> {
        if index < self.statics.len() {
            self.statics.get(index)
        } else {
            self.discovered.get(index - self.statics.len())
        }
    }

    pub fn count(&self) -> usize {
        self.statics.len() + self.discovered.len()
    }

    pub fn iter(&self) -> impl Iterator<Item = &ServerDescriptor> {
        self.statics.iter().chain(self.discovered.iter())
    }

    /// Bumped whenever the visible list changes; lets the UI skip
    /// redraws between identical refreshes.
    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn is_refreshing(&self) -> bool {
        self.query.is_some()
    }

    /// Fan out one request per metaserver endpoint. A refresh already in
    /// flight is left alone.
    pub fn begin_refresh(&mut self, fetcher: &HttpFetcher, urls: &[String]) {
        if self.query.is_some() || urls.is_empty() {
            return;
        }
        let requests = urls.iter().map(|url| fetcher.start_get(url)).collect();
        self.query = Some(MetaserverQuery { requests });
    }

    /// Complete a finished refresh, if any. Called once per tick.
    pub fn poll_refresh(&mut self) {
        let finished = self
            .query
            .as_ref()
            .is_some_and(MetaserverQuery::finished);
        if !finished {
            return;
        }

        let query = self.query.take().unwrap();
        let servers = query.collect();
        log::info!("metaserver refresh finished with {} servers", servers.len());
        self.replace_discovered(servers);
    }
}

fn same_endpoint(a: &ServerDescriptor, b: &ServerDescriptor) -> bool {
    a.hostname == b.hostname && a.plain_port == b.plain_port
}
