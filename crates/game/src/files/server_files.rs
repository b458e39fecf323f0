use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};

use crate::error::ClientError;
use crate::http::{FetchRequest, FetchState, HttpFetcher};

pub const FILE_ANIMS: &str = "anims";
pub const FILE_BMAPS: &str = "bmaps";
pub const FILE_UPDATES: &str = "updates";
pub const FILE_SETTINGS: &str = "settings";
pub const FILE_EFFECTS: &str = "effects";
pub const FILE_HFILES: &str = "hfiles";

pub const LISTING_NAME: &str = "listing.txt";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpdateState {
    Idle,
    Pending,
    InProgress,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct ListingEntry {
    size: u64,
    crc32: u32,
}

/// Feature-supplied hooks for one catalogued file.
pub trait ServerFileHandler: Send {
    fn on_init(&mut self) {}
    fn on_reload(&mut self) {}
    fn on_parse(&mut self, data: &[u8]) -> Result<(), ClientError>;
}

pub struct ServerFileEntry {
    name: String,
    loaded: bool,
    update_state: UpdateState,
    size: u64,
    crc32: u32,
    request: Option<FetchRequest>,
    /// Fetched from the server this session; gets an `on_reload` during
    /// the final pass.
    refreshed: bool,
    handler: Box<dyn ServerFileHandler>,
}

impl ServerFileEntry {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn loaded(&self) -> bool {
        self.loaded
    }

    pub fn update_state(&self) -> UpdateState {
        self.update_state
    }

    pub fn size(&self) -> u64 {
        self.size
    }

    pub fn crc32(&self) -> u32 {
        self.crc32
    }
}

/// The fixed catalogue of data files a server provides and the download
/// machinery that keeps the local copies current. Driven entirely from
/// the connection state machine; nothing here blocks.
pub struct ServerFiles {
    entries: HashMap<String, ServerFileEntry>,
    listing: Option<FetchRequest>,
    listing_done: bool,
    expected: HashMap<String, ListingEntry>,
    data_url: Option<String>,
    cache_dir: PathBuf,
}

impl ServerFiles {
    pub fn new(cache_dir: &Path) -> Self {
        Self {
            entries: HashMap::new(),
            listing: None,
            listing_done: false,
            expected: HashMap::new(),
            data_url: None,
            cache_dir: cache_dir.to_path_buf(),
        }
    }

    /// The standard catalogue, registered at process start.
    pub fn with_default_catalogue(cache_dir: &Path) -> Self {
        let mut files = Self::new(cache_dir);
        files.register(FILE_ANIMS, Box::new(TableFile::new(FILE_ANIMS)));
        files.register(FILE_BMAPS, Box::new(TableFile::new(FILE_BMAPS)));
        files.register(FILE_UPDATES, Box::new(TableFile::new(FILE_UPDATES)));
        files.register(FILE_SETTINGS, Box::new(SettingsFile::default()));
        files.register(FILE_EFFECTS, Box::new(TableFile::new(FILE_EFFECTS)));
        files.register(FILE_HFILES, Box::new(TableFile::new(FILE_HFILES)));
        files
    }

    pub fn register(&mut self, name: &str, mut handler: Box<dyn ServerFileHandler>) {
        handler.on_init();
        self.entries.insert(
            name.to_string(),
            ServerFileEntry {
                name: name.to_string(),
                loaded: false,
                update_state: UpdateState::Idle,
                size: 0,
                crc32: 0,
                request: None,
                refreshed: false,
                handler,
            },
        );
    }

    /// Reset per-connection state ahead of a fresh synchronization pass.
    pub fn begin_sync(&mut self, data_url: &str) {
        self.data_url = Some(data_url.trim_end_matches('/').to_string());
        self.listing = None;
        self.listing_done = false;
        self.expected.clear();
        for entry in self.entries.values_mut() {
            entry.loaded = false;
            entry.update_state = UpdateState::Idle;
            entry.size = 0;
            entry.crc32 = 0;
            entry.request = None;
            entry.refreshed = false;
        }
    }

    /// Abandon any in-flight work, e.g. when the session goes away.
    pub fn abort(&mut self) {
        self.listing = None;
        self.listing_done = false;
        self.expected.clear();
        for entry in self.entries.values_mut() {
            entry.update_state = UpdateState::Idle;
            entry.request = None;
        }
    }

    pub fn retrieve_listing(&mut self, fetcher: &HttpFetcher) {
        let Some(base) = &self.data_url else {
            log::error!("no data URL negotiated; cannot retrieve the file listing");
            self.listing_done = true;
            return;
        };
        let url = format!("{base}/{LISTING_NAME}");
        log::info!("retrieving server file listing from {url}");
        self.listing = Some(fetcher.start_get(&url));
    }

    /// True once the listing fetch reached a terminal state. A failed
    /// fetch is also "processed": the machine then proceeds on whatever
    /// local copies exist.
    pub fn listing_processed(&mut self) -> bool {
        if self.listing_done {
            return true;
        }
        let Some(request) = &self.listing else {
            return false;
        };

        match request.state() {
            FetchState::InProgress => false,
            FetchState::Ok => {
                let body = request.body().unwrap_or_default();
                self.expected = parse_listing(&body);
                log::info!("server file listing has {} entries", self.expected.len());
                self.listing_done = true;
                true
            }
            FetchState::Error => {
                log::error!(
                    "failed to retrieve server file listing: {}",
                    request.error().unwrap_or_else(|| "unknown error".to_string())
                );
                self.listing_done = true;
                true
            }
        }
    }

    /// Pass 0: load whatever already matches on disk, without touching
    /// the network. Pass 1: queue downloads for entries that are absent
    /// or differ from the listing.
    pub fn load(&mut self, pass: u8) {
        if pass == 0 {
            self.load_local();
        } else {
            self.queue_updates();
        }
    }

    fn load_local(&mut self) {
        let cache_dir = self.cache_dir.clone();
        for entry in self.entries.values_mut() {
            let path = cache_dir.join(&entry.name);
            let Ok(data) = fs::read(&path) else {
                continue;
            };
            entry.size = data.len() as u64;
            entry.crc32 = crc32fast::hash(&data);
            match entry.handler.on_parse(&data) {
                Ok(()) => entry.loaded = true,
                Err(err) => log::warn!("cached copy of {} failed to parse: {}", entry.name, err),
            }
        }
    }

    fn queue_updates(&mut self) {
        for entry in self.entries.values_mut() {
            match self.expected.get(&entry.name) {
                Some(expected)
                    if entry.loaded
                        && entry.size == expected.size
                        && entry.crc32 == expected.crc32 => {}
                Some(_) => entry.update_state = UpdateState::Pending,
                // Not in the listing: nothing to download. The entry
                // either keeps its local copy or stays unloaded.
                None => {}
            }
        }
    }

    /// Drive queued and in-flight downloads. Called once per tick while
    /// the machine sits in the file-synchronization state.
    pub fn poll(&mut self, fetcher: &HttpFetcher) {
        let base = self.data_url.clone();
        let cache_dir = self.cache_dir.clone();

        for entry in self.entries.values_mut() {
            match entry.update_state {
                UpdateState::Idle => {}
                UpdateState::Pending => {
                    let Some(base) = &base else {
                        entry.update_state = UpdateState::Idle;
                        continue;
                    };
                    let url = format!("{}/{}", base, entry.name);
                    log::info!("updating server file {}", entry.name);
                    entry.request = Some(fetcher.start_get(&url));
                    entry.update_state = UpdateState::InProgress;
                }
                UpdateState::InProgress => {
                    let Some(request) = &entry.request else {
                        entry.update_state = UpdateState::Idle;
                        continue;
                    };
                    match request.state() {
                        FetchState::InProgress => {}
                        FetchState::Ok => {
                            let data = request.body().unwrap_or_default();
                            entry.request = None;
                            entry.update_state = UpdateState::Idle;
                            finish_download(entry, &self.expected, &cache_dir, data);
                        }
                        FetchState::Error => {
                            log::error!(
                                "download of server file {} failed: {}",
                                entry.name,
                                request.error().unwrap_or_else(|| "unknown error".to_string())
                            );
                            entry.request = None;
                            entry.update_state = UpdateState::Idle;
                        }
                    }
                }
            }
        }
    }

    /// True once every catalogued entry is idle and loaded.
    pub fn all_processed(&self) -> bool {
        self.entries
            .values()
            .all(|entry| entry.update_state == UpdateState::Idle && entry.loaded)
    }

    /// Final pass: run `on_reload` for every entry refreshed this
    /// session.
    pub fn finish_load(&mut self) {
        for entry in self.entries.values_mut() {
            if entry.refreshed {
                entry.handler.on_reload();
                entry.refreshed = false;
            }
        }
    }

    pub fn entry(&self, name: &str) -> Option<&ServerFileEntry> {
        self.entries.get(name)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    #[cfg(test)]
    pub(crate) fn inject_listing(&mut self, request: FetchRequest) {
        self.listing = Some(request);
    }

    #[cfg(test)]
    pub(crate) fn inject_request(&mut self, name: &str, request: FetchRequest) {
        let entry = self.entries.get_mut(name).unwrap();
        entry.request = Some(request);
        entry.update_state = UpdateState::InProgress;
    }
}

fn finish_download(
    entry: &mut ServerFileEntry,
    expected: &HashMap<String, ListingEntry>,
    cache_dir: &Path,
    data: Vec<u8>,
) {
    let size = data.len() as u64;
    let crc32 = crc32fast::hash(&data);

    if let Some(expected) = expected.get(&entry.name)
        && (expected.size != size || expected.crc32 != crc32)
    {
        log::error!(
            "server file {} does not match the listing (size {} vs {}, crc {:08x} vs {:08x})",
            entry.name,
            size,
            expected.size,
            crc32,
            expected.crc32
        );
        return;
    }

    if let Err(err) = fs::create_dir_all(cache_dir) {
        log::warn!("cannot create cache directory: {err}");
    }
    if let Err(err) = fs::write(cache_dir.join(&entry.name), &data) {
        log::warn!("cannot persist server file {}: {}", entry.name, err);
    }

    match entry.handler.on_parse(&data) {
        Ok(()) => {
            entry.size = size;
            entry.crc32 = crc32;
            entry.loaded = true;
            entry.refreshed = true;
        }
        Err(err) => log::error!("server file {} failed to parse: {}", entry.name, err),
    }
}

/// Listing format: one `name size crc32-hex` triple per line.
fn parse_listing(body: &[u8]) -> HashMap<String, ListingEntry> {
    let mut expected = HashMap::new();
    let Ok(text) = std::str::from_utf8(body) else {
        log::error!("server file listing is not valid UTF-8");
        return expected;
    };

    for line in text.lines() {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        let mut parts = line.split_whitespace();
        let (Some(name), Some(size), Some(crc)) = (parts.next(), parts.next(), parts.next())
        else {
            log::warn!("skipping malformed listing line: {line:?}");
            continue;
        };
        let (Ok(size), Ok(crc32)) = (size.parse(), u32::from_str_radix(crc, 16)) else {
            log::warn!("skipping malformed listing line: {line:?}");
            continue;
        };
        expected.insert(name.to_string(), ListingEntry { size, crc32 });
    }
    expected
}

/// Line-oriented table file: rows are counted and kept available for the
/// feature that registered the entry.
struct TableFile {
    kind: &'static str,
    rows: usize,
}

impl TableFile {
    fn new(kind: &'static str) -> Self {
        Self { kind, rows: 0 }
    }
}

impl ServerFileHandler for TableFile {
    fn on_parse(&mut self, data: &[u8]) -> Result<(), ClientError> {
        let text = std::str::from_utf8(data).map_err(|_| {
            ClientError::Protocol(format!("server file {} is not valid UTF-8", self.kind))
        })?;
        self.rows = text
            .lines()
            .filter(|line| !line.is_empty() && !line.starts_with('#'))
            .count();
        log::debug!("parsed {} rows from {}", self.rows, self.kind);
        Ok(())
    }

    fn on_reload(&mut self) {
        log::debug!("{} table reloaded", self.kind);
    }
}

/// `key = value` settings pushed by the server.
#[derive(Default)]
struct SettingsFile {
    values: HashMap<String, String>,
}

impl ServerFileHandler for SettingsFile {
    fn on_parse(&mut self, data: &[u8]) -> Result<(), ClientError> {
        let text = std::str::from_utf8(data)
            .map_err(|_| ClientError::Protocol("settings file is not valid UTF-8".to_string()))?;
        self.values.clear();
        for line in text.lines() {
            let line = line.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }
            if let Some((key, value)) = line.split_once('=') {
                self.values
                    .insert(key.trim().to_string(), value.trim().to_string());
            }
        }
        log::debug!("parsed {} server settings", self.values.len());
        Ok(())
    }

    fn on_reload(&mut self) {
        log::debug!("server settings reloaded");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    static TEST_DIR: AtomicU32 = AtomicU32::new(0);

    fn temp_cache_dir() -> PathBuf {
        let dir = std::env::temp_dir().join(format!(
            "mistvale-files-{}-{}",
            std::process::id(),
            TEST_DIR.fetch_add(1, Ordering::SeqCst)
        ));
        fs::create_dir_all(&dir).unwrap();
        dir
    }

    fn listing_line(name: &str, data: &[u8]) -> String {
        format!("{} {} {:08x}\n", name, data.len(), crc32fast::hash(data))
    }

    #[test]
    fn test_pass0_loads_matching_local_copies() {
        let dir = temp_cache_dir();
        let data = b"row1\nrow2\n".to_vec();
        for name in [
            FILE_ANIMS,
            FILE_BMAPS,
            FILE_UPDATES,
            FILE_SETTINGS,
            FILE_EFFECTS,
            FILE_HFILES,
        ] {
            fs::write(dir.join(name), &data).unwrap();
        }

        let mut files = ServerFiles::with_default_catalogue(&dir);
        files.begin_sync("http://127.0.0.1:1/data");

        let listing: String = [
            FILE_ANIMS,
            FILE_BMAPS,
            FILE_UPDATES,
            FILE_SETTINGS,
            FILE_EFFECTS,
            FILE_HFILES,
        ]
        .iter()
        .map(|name| listing_line(name, &data))
        .collect();
        files.inject_listing(FetchRequest::resolved("listing", listing.into_bytes()));

        assert!(!files.all_processed());
        files.load(0);
        assert!(files.listing_processed());
        files.load(1);

        // Everything matched; nothing queued, nothing fetched.
        assert!(files.all_processed());
        assert_eq!(
            files.entry(FILE_ANIMS).unwrap().update_state(),
            UpdateState::Idle
        );
    }

    #[test]
    fn test_mismatched_entry_is_queued_for_download() {
        let dir = temp_cache_dir();
        fs::write(dir.join(FILE_ANIMS), b"stale\n").unwrap();

        let mut files = ServerFiles::new(&dir);
        files.register(FILE_ANIMS, Box::new(TableFile::new(FILE_ANIMS)));
        files.begin_sync("http://127.0.0.1:1/data");

        files.inject_listing(FetchRequest::resolved(
            "listing",
            listing_line(FILE_ANIMS, b"fresh\n").into_bytes(),
        ));
        files.load(0);
        assert!(files.listing_processed());
        files.load(1);

        assert_eq!(
            files.entry(FILE_ANIMS).unwrap().update_state(),
            UpdateState::Pending
        );
        assert!(!files.all_processed());
    }

    #[test]
    fn test_completed_download_parses_and_persists() {
        let dir = temp_cache_dir();
        let fetcher = HttpFetcher::default();
        let fresh = b"fresh\n".to_vec();

        let mut files = ServerFiles::new(&dir);
        files.register(FILE_ANIMS, Box::new(TableFile::new(FILE_ANIMS)));
        files.begin_sync("http://127.0.0.1:1/data");
        files.inject_listing(FetchRequest::resolved(
            "listing",
            listing_line(FILE_ANIMS, &fresh).into_bytes(),
        ));
        files.load(0);
        assert!(files.listing_processed());
        files.load(1);

        files.inject_request(FILE_ANIMS, FetchRequest::resolved("anims", fresh.clone()));
        files.poll(&fetcher);

        assert!(files.all_processed());
        assert_eq!(fs::read(dir.join(FILE_ANIMS)).unwrap(), fresh);
    }

    #[test]
    fn test_failed_download_keeps_stale_copy() {
        let dir = temp_cache_dir();
        let fetcher = HttpFetcher::default();
        fs::write(dir.join(FILE_ANIMS), b"stale\n").unwrap();

        let mut files = ServerFiles::new(&dir);
        files.register(FILE_ANIMS, Box::new(TableFile::new(FILE_ANIMS)));
        files.begin_sync("http://127.0.0.1:1/data");
        files.inject_listing(FetchRequest::resolved(
            "listing",
            listing_line(FILE_ANIMS, b"fresh\n").into_bytes(),
        ));
        files.load(0);
        assert!(files.listing_processed());
        files.load(1);

        files.inject_request(FILE_ANIMS, FetchRequest::failed("anims", "refused"));
        files.poll(&fetcher);

        // The stale pass-0 load still counts; the machine can proceed.
        let entry = files.entry(FILE_ANIMS).unwrap();
        assert_eq!(entry.update_state(), UpdateState::Idle);
        assert!(entry.loaded());
        assert!(files.all_processed());
    }

    #[test]
    fn test_failed_download_without_local_copy_blocks() {
        let dir = temp_cache_dir();
        let fetcher = HttpFetcher::default();

        let mut files = ServerFiles::new(&dir);
        files.register(FILE_ANIMS, Box::new(TableFile::new(FILE_ANIMS)));
        files.begin_sync("http://127.0.0.1:1/data");
        files.inject_listing(FetchRequest::resolved(
            "listing",
            listing_line(FILE_ANIMS, b"fresh\n").into_bytes(),
        ));
        files.load(0);
        assert!(files.listing_processed());
        files.load(1);

        files.inject_request(FILE_ANIMS, FetchRequest::failed("anims", "refused"));
        files.poll(&fetcher);

        assert!(!files.all_processed());
    }

    #[test]
    fn test_listing_failure_is_still_processed() {
        let dir = temp_cache_dir();
        let mut files = ServerFiles::new(&dir);
        files.register(FILE_ANIMS, Box::new(TableFile::new(FILE_ANIMS)));
        files.begin_sync("http://127.0.0.1:1/data");
        files.inject_listing(FetchRequest::failed("listing", "refused"));

        assert!(files.listing_processed());
    }

    #[test]
    fn test_parse_listing_skips_garbage() {
        let body = b"anims 6 0000abcd\nnot-a-line\nbmaps nine ffff\n";
        let expected = parse_listing(body);
        assert_eq!(expected.len(), 1);
        assert_eq!(expected["anims"].size, 6);
        assert_eq!(expected["anims"].crc32, 0xabcd);
    }
}
