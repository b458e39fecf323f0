use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};

use sha2::{Digest, Sha512};

use crate::error::ClientError;
use crate::http::{FetchRequest, FetchState, HttpFetcher};
use crate::net::DIGEST_LEN;

pub fn digest_of(data: &[u8]) -> [u8; DIGEST_LEN] {
    let mut hasher = Sha512::new();
    hasher.update(data);
    hasher.finalize().into()
}

/// One content-addressed binary asset.
#[derive(Debug)]
pub struct ResourceRecord {
    name: String,
    digest: [u8; DIGEST_LEN],
    hex: String,
    request: Option<FetchRequest>,
    loaded: bool,
    attempts: u32,
    failed: bool,
}

impl ResourceRecord {
    fn new(name: String, digest: [u8; DIGEST_LEN]) -> Self {
        let hex = hex::encode(digest);
        Self {
            name,
            digest,
            hex,
            request: None,
            loaded: false,
            attempts: 0,
            failed: false,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn digest(&self) -> &[u8; DIGEST_LEN] {
        &self.digest
    }

    /// Cached string form of the digest, used in URLs and file names.
    pub fn hex_digest(&self) -> &str {
        &self.hex
    }

    pub fn loaded(&self) -> bool {
        self.loaded
    }

    /// Exhausted the re-fetch bound without producing matching bytes.
    pub fn failed(&self) -> bool {
        self.failed
    }
}

/// Process-lifetime cache of server-pushed binary assets, keyed by
/// logical name, addressed by SHA-512 digest. Never evicted; verified
/// bytes persist under the cache directory.
pub struct ResourceCache {
    records: HashMap<String, ResourceRecord>,
    cache_dir: PathBuf,
    data_url: Option<String>,
    retry_limit: u32,
}

impl ResourceCache {
    pub fn new(cache_dir: &Path, retry_limit: u32) -> Self {
        Self {
            records: HashMap::new(),
            cache_dir: cache_dir.join("resources"),
            data_url: None,
            retry_limit,
        }
    }

    pub fn set_data_url(&mut self, url: &str) {
        self.data_url = Some(url.trim_end_matches('/').to_string());
    }

    fn path_for(&self, hex: &str) -> PathBuf {
        self.cache_dir.join(hex)
    }

    fn fetch_url(&self, hex: &str) -> Option<String> {
        self.data_url
            .as_ref()
            .map(|base| format!("{base}/resources/{hex}"))
    }

    pub fn find(&self, name: &str) -> Option<&ResourceRecord> {
        self.records.get(name)
    }

    /// Look a resource up by digest. On a miss a new record is created
    /// and an asynchronous download starts; the caller polls
    /// `is_ready` on later ticks.
    pub fn find_by_digest(
        &mut self,
        digest: &[u8; DIGEST_LEN],
        fetcher: &HttpFetcher,
    ) -> &ResourceRecord {
        let existing = self
            .records
            .iter()
            .find(|(_, record)| &record.digest == digest)
            .map(|(name, _)| name.clone());

        let name = match existing {
            Some(name) => name,
            None => {
                let hex = hex::encode(digest);
                let mut record = ResourceRecord::new(hex.clone(), *digest);
                self.load_from_disk(&mut record);
                if !record.loaded {
                    record.request = self.fetch_url(&hex).map(|url| fetcher.start_get(&url));
                }
                self.records.insert(hex.clone(), record);
                hex
            }
        };

        &self.records[&name]
    }

    /// Handle a pushed resource. Bytes matching the digest are stored
    /// directly; anything else falls back to the download path.
    pub fn handle_push(
        &mut self,
        name: &str,
        digest: &[u8; DIGEST_LEN],
        data: &[u8],
        fetcher: &HttpFetcher,
    ) {
        if !data.is_empty() && digest_of(data) == *digest {
            let mut record = ResourceRecord::new(name.to_string(), *digest);
            self.persist(&mut record, data);
            self.records.insert(name.to_string(), record);
            return;
        }

        if !data.is_empty() {
            log::warn!("pushed resource {name} failed its digest check; re-fetching");
        }

        let url = self.fetch_url(&hex::encode(digest));
        let record = self
            .records
            .entry(name.to_string())
            .or_insert_with(|| ResourceRecord::new(name.to_string(), *digest));
        if record.digest != *digest {
            // The server re-keyed this resource; the old bytes no longer
            // apply.
            *record = ResourceRecord::new(name.to_string(), *digest);
        }
        if record.loaded || record.failed || record.request.is_some() {
            return;
        }
        record.request = url.map(|url| fetcher.start_get(&url));
    }

    /// Complete finished downloads and re-queue mismatches, bounded by
    /// the retry limit. Called once per tick.
    pub fn poll(&mut self, fetcher: &HttpFetcher) {
        let mut completed: Vec<(String, Option<Vec<u8>>, Option<String>)> = Vec::new();
        for (name, record) in &self.records {
            if let Some(request) = &record.request {
                match request.state() {
                    FetchState::InProgress => {}
                    FetchState::Ok => completed.push((name.clone(), request.body(), None)),
                    FetchState::Error => completed.push((
                        name.clone(),
                        None,
                        Some(request.error().unwrap_or_else(|| "unknown error".to_string())),
                    )),
                }
            }
        }

        for (name, body, error) in completed {
            let retry_limit = self.retry_limit;
            let (digest, hex) = {
                let record = self.records.get(&name).unwrap();
                (record.digest, record.hex.clone())
            };
            let url = self.fetch_url(&hex);

            if let Some(data) = &body
                && digest_of(data) == digest
            {
                let mut record = self.records.remove(&name).unwrap();
                record.request = None;
                self.persist(&mut record, data);
                self.records.insert(name, record);
                continue;
            }

            let reason = if body.is_some() {
                "digest mismatch".to_string()
            } else {
                error.unwrap_or_else(|| "unknown error".to_string())
            };

            let record = self.records.get_mut(&name).unwrap();
            record.request = None;
            record.attempts += 1;
            if record.attempts >= retry_limit {
                record.failed = true;
                let err = ClientError::Integrity(format!(
                    "resource {} still corrupt after {} attempts ({reason})",
                    record.name, record.attempts
                ));
                log::error!("{err}");
            } else {
                log::warn!(
                    "re-fetching resource {} (attempt {}): {reason}",
                    record.name,
                    record.attempts + 1
                );
                record.request = url.map(|url| fetcher.start_get(&url));
            }
        }
    }

    pub fn is_ready(&self, digest: &[u8; DIGEST_LEN]) -> bool {
        self.records
            .values()
            .any(|record| &record.digest == digest && record.loaded)
    }

    /// Re-check every record against the on-disk store, dropping
    /// in-flight work. Runs when a session is torn down so the next one
    /// starts from verified local state.
    pub fn revalidate(&mut self) {
        for record in self.records.values_mut() {
            record.request = None;
            record.attempts = 0;
            record.failed = false;
            record.loaded = false;
        }
        let names: Vec<String> = self.records.keys().cloned().collect();
        for name in names {
            let mut record = self.records.remove(&name).unwrap();
            self.load_from_disk(&mut record);
            self.records.insert(name, record);
        }
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    fn load_from_disk(&self, record: &mut ResourceRecord) {
        if let Ok(data) = fs::read(self.path_for(&record.hex))
            && digest_of(&data) == record.digest
        {
            record.loaded = true;
        }
    }

    fn persist(&self, record: &mut ResourceRecord, data: &[u8]) {
        if let Err(err) = fs::create_dir_all(&self.cache_dir) {
            log::warn!("cannot create resource cache directory: {err}");
        }
        if let Err(err) = fs::write(self.path_for(&record.hex), data) {
            log::warn!("cannot persist resource {}: {}", record.name, err);
        }
        record.loaded = true;
        record.failed = false;
    }

    #[cfg(test)]
    pub(crate) fn inject_request(&mut self, name: &str, request: FetchRequest) {
        let record = self.records.get_mut(name).unwrap();
        record.request = Some(request);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    static TEST_DIR: AtomicU32 = AtomicU32::new(0);

    fn temp_cache_dir() -> PathBuf {
        std::env::temp_dir().join(format!(
            "mistvale-resources-{}-{}",
            std::process::id(),
            TEST_DIR.fetch_add(1, Ordering::SeqCst)
        ))
    }

    fn cache() -> ResourceCache {
        let mut cache = ResourceCache::new(&temp_cache_dir(), 3);
        // Unroutable base; tests inject resolved requests instead.
        cache.set_data_url("http://127.0.0.1:1/data");
        cache
    }

    #[test]
    fn test_push_with_matching_digest_is_ready() {
        let mut cache = cache();
        let fetcher = HttpFetcher::default();
        let data = b"resource bytes".to_vec();
        let digest = digest_of(&data);

        cache.handle_push("sky", &digest, &data, &fetcher);

        assert!(cache.is_ready(&digest));
        assert!(cache.find("sky").unwrap().loaded());
        assert_eq!(cache.find_by_digest(&digest, &fetcher).name(), "sky");
    }

    #[test]
    fn test_find_by_digest_miss_creates_record() {
        let mut cache = cache();
        let fetcher = HttpFetcher::default();
        let digest = digest_of(b"never seen");

        let record = cache.find_by_digest(&digest, &fetcher);
        assert!(!record.loaded());
        assert_eq!(record.hex_digest(), hex::encode(digest));
        assert!(!cache.is_ready(&digest));
    }

    #[test]
    fn test_download_verifies_digest() {
        let mut cache = cache();
        let fetcher = HttpFetcher::default();
        let data = b"verified bytes".to_vec();
        let digest = digest_of(&data);
        let hex = hex::encode(digest);

        cache.find_by_digest(&digest, &fetcher);
        cache.inject_request(&hex, FetchRequest::resolved("res", data));
        cache.poll(&fetcher);

        assert!(cache.is_ready(&digest));
        // The verified bytes landed on disk too.
        let on_disk = fs::read(cache.path_for(&hex)).unwrap();
        assert_eq!(digest_of(&on_disk), digest);
    }

    #[test]
    fn test_mismatch_requeues_until_retry_bound() {
        let mut cache = cache();
        let fetcher = HttpFetcher::default();
        let digest = digest_of(b"wanted bytes");
        let hex = hex::encode(digest);

        cache.find_by_digest(&digest, &fetcher);

        for attempt in 1..=2 {
            cache.inject_request(&hex, FetchRequest::resolved("res", b"wrong".to_vec()));
            cache.poll(&fetcher);
            let record = cache.find(&hex).unwrap();
            assert!(!record.loaded(), "attempt {attempt} must not load");
            assert!(!record.failed(), "attempt {attempt} must keep retrying");
        }

        cache.inject_request(&hex, FetchRequest::resolved("res", b"wrong".to_vec()));
        cache.poll(&fetcher);

        let record = cache.find(&hex).unwrap();
        assert!(record.failed());
        assert!(!record.loaded());
        assert!(!cache.is_ready(&digest));
    }

    #[test]
    fn test_revalidate_reloads_from_disk() {
        let mut cache = cache();
        let fetcher = HttpFetcher::default();
        let data = b"persisted".to_vec();
        let digest = digest_of(&data);

        cache.handle_push("ground", &digest, &data, &fetcher);
        assert!(cache.is_ready(&digest));

        cache.revalidate();
        assert!(cache.is_ready(&digest));

        // Corrupt the on-disk copy; revalidation must notice.
        let hex = hex::encode(digest);
        fs::write(cache.path_for(&hex), b"tampered").unwrap();
        cache.revalidate();
        assert!(!cache.is_ready(&digest));
    }
}
