use std::io;
use std::time::{Duration, Instant};

use crate::config::ClientConfig;
use crate::error::ClientError;
use crate::files::{ResourceCache, ServerFiles};
use crate::http::HttpFetcher;
use crate::meta::{ServerDescriptor, ServerDirectory, TrustCheck};
use crate::net::{DEFAULT_PORT, Message, SetupParams, TlsParams, Transport};
use crate::session::keepalive::{KeepaliveStats, KeepaliveTracker};

/// Connection lifecycle states, in the order a successful connect walks
/// through them. Any state can fall back to `Idle` on error or
/// disconnect.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClientState {
    Init,
    MetaserverRefresh,
    Idle,
    StartConnect,
    Connecting,
    WaitCrypto,
    SendClientInfo,
    WaitVersion,
    VersionReceived,
    WaitSetup,
    RequestFileListing,
    WaitFileListing,
    RequestFiles,
    Login,
    WaitLogin,
    CharacterSelect,
    WaitForPlay,
    Play,
}

/// The live connection. At most one exists at a time, owned by the
/// state machine and destroyed on disconnect or reset.
pub struct Session {
    pub transport: Transport,
    pub secure: bool,
    pub protocol_version: u32,
    pub setup: Option<SetupParams>,
}

/// Minimal map bookkeeping the lifecycle clears on (re)connects. The
/// actual map contents belong to the rendering side.
#[derive(Debug, Default)]
pub struct MapState {
    pub name: String,
    pub width: u8,
    pub height: u8,
}

impl MapState {
    pub fn clear(&mut self) {
        *self = Self::default();
    }
}

#[derive(Debug, Clone)]
pub struct Credentials {
    pub account: String,
    pub password: String,
}

/// The top-level client context: every component the connection
/// lifecycle touches, driven by one non-blocking `advance()` call per
/// application tick.
pub struct GameClient {
    pub(crate) config: ClientConfig,
    pub(crate) state: ClientState,
    pub(crate) directory: ServerDirectory,
    pub(crate) fetcher: HttpFetcher,
    pub(crate) files: ServerFiles,
    pub(crate) resources: ResourceCache,
    pub(crate) keepalive: KeepaliveTracker,
    pub(crate) session: Option<Session>,
    pub(crate) selected: Option<ServerDescriptor>,
    pub(crate) map: MapState,
    pub(crate) characters: Vec<String>,
    pub(crate) pending_login: Option<Credentials>,
    pub(crate) pending_character: Option<String>,
    pub(crate) last_error: Option<ClientError>,
    epoch: Instant,
    pub(crate) last_keepalive_ms: u64,
    connect_port: u16,
    connect_secure: bool,
    crypto_hello_sent: bool,
}

impl GameClient {
    pub fn new(config: ClientConfig) -> Self {
        let files = ServerFiles::with_default_catalogue(&config.cache_dir);
        let resources = ResourceCache::new(&config.cache_dir, config.integrity_retry_limit);

        let mut client = Self {
            state: ClientState::Init,
            directory: ServerDirectory::new(),
            fetcher: HttpFetcher::default(),
            files,
            resources,
            keepalive: KeepaliveTracker::new(),
            session: None,
            selected: None,
            map: MapState::default(),
            characters: Vec::new(),
            pending_login: None,
            pending_character: None,
            last_error: None,
            epoch: Instant::now(),
            last_keepalive_ms: 0,
            connect_port: 0,
            connect_secure: false,
            crypto_hello_sent: false,
            config,
        };
        client.seed_static_servers();
        client
    }

    /// Drive the connection lifecycle one step. Performs at most the
    /// work needed to complete the current state or detect its failure,
    /// then returns; it never blocks.
    pub fn advance(&mut self) {
        self.directory.poll_refresh();
        self.process_inbound();
        self.resources.poll(&self.fetcher);
        self.drive_keepalive();

        match self.state {
            ClientState::Init => self.st_init(),
            ClientState::MetaserverRefresh => self.st_metaserver_refresh(),
            ClientState::Idle => {}
            ClientState::StartConnect => self.st_start_connect(),
            ClientState::Connecting => self.st_connecting(),
            ClientState::WaitCrypto => self.st_wait_crypto(),
            ClientState::SendClientInfo => self.st_send_client_info(),
            ClientState::WaitVersion | ClientState::WaitSetup | ClientState::WaitLogin => {}
            ClientState::VersionReceived => self.st_version_received(),
            ClientState::RequestFileListing => self.st_request_file_listing(),
            ClientState::WaitFileListing => self.st_wait_file_listing(),
            ClientState::RequestFiles => self.st_request_files(),
            ClientState::Login => self.st_login(),
            ClientState::CharacterSelect => self.st_character_select(),
            ClientState::WaitForPlay => self.st_wait_for_play(),
            ClientState::Play => {}
        }
    }

    // ---- external selection / input boundary ----

    pub fn state(&self) -> ClientState {
        self.state
    }

    pub fn directory(&self) -> &ServerDirectory {
        &self.directory
    }

    /// Manually add a server, e.g. from configuration or a UI dialog.
    pub fn add_server(&mut self, descriptor: ServerDescriptor) {
        self.directory.add_static(descriptor);
    }

    /// Pick a server from the directory and start connecting. Only
    /// valid while idle.
    pub fn select_server(&mut self, index: usize) -> Result<(), ClientError> {
        if self.state != ClientState::Idle {
            return Err(ClientError::Protocol(format!(
                "cannot select a server in state {:?}",
                self.state
            )));
        }
        let descriptor = self
            .directory
            .get(index)
            .cloned()
            .ok_or_else(|| ClientError::Protocol(format!("no server at index {index}")))?;

        self.selected = Some(descriptor);
        self.last_error = None;
        self.state = ClientState::StartConnect;
        Ok(())
    }

    pub fn selected(&self) -> Option<&ServerDescriptor> {
        self.selected.as_ref()
    }

    pub fn submit_login(&mut self, account: &str, password: &str) {
        self.pending_login = Some(Credentials {
            account: account.to_string(),
            password: password.to_string(),
        });
    }

    pub fn choose_character(&mut self, name: &str) {
        self.pending_character = Some(name.to_string());
    }

    /// Character names offered by the server after a successful login.
    pub fn characters(&self) -> &[String] {
        &self.characters
    }

    /// User-initiated disconnect; returns the machine to idle.
    pub fn disconnect(&mut self) {
        if self.session.is_some() {
            log::info!("disconnected");
        }
        self.teardown();
        self.selected = None;
        self.state = ClientState::Idle;
    }

    pub fn last_error(&self) -> Option<&ClientError> {
        self.last_error.as_ref()
    }

    pub fn keepalive_stats(&self) -> KeepaliveStats {
        self.keepalive.stats()
    }

    pub fn files(&self) -> &ServerFiles {
        &self.files
    }

    pub fn resources(&self) -> &ResourceCache {
        &self.resources
    }

    pub fn resources_mut(&mut self) -> &mut ResourceCache {
        &mut self.resources
    }

    pub fn setup(&self) -> Option<&SetupParams> {
        self.session.as_ref().and_then(|session| session.setup.as_ref())
    }

    pub fn is_secure(&self) -> bool {
        self.session.as_ref().is_some_and(|session| session.secure)
    }

    // ---- shared plumbing ----

    pub(crate) fn now_ms(&self) -> u64 {
        self.epoch.elapsed().as_millis() as u64
    }

    /// Queue a message on the session transport. A send failure tears
    /// the session down, so callers must not touch the session after a
    /// `false` return.
    pub(crate) fn send(&mut self, message: &Message) -> bool {
        let result = match &self.session {
            Some(session) => session.transport.send(message),
            None => return false,
        };
        match result {
            Ok(()) => true,
            Err(err) => {
                self.fail_to_idle(ClientError::Transport(err));
                false
            }
        }
    }

    fn drive_keepalive(&mut self) {
        if self.session.is_none() || !self.link_established() {
            return;
        }
        let now = self.now_ms();
        let interval_ms = self.config.keepalive_interval_secs * 1000;
        if now.saturating_sub(self.last_keepalive_ms) >= interval_ms {
            self.send_keepalive(now);
        }
    }

    fn send_keepalive(&mut self, now_ms: u64) {
        let id = self.keepalive.begin_probe(now_ms);
        self.last_keepalive_ms = now_ms;
        self.send(&Message::KeepaliveProbe { id });
    }

    /// True in every state past the version exchange's start, i.e. once
    /// application traffic flows.
    fn link_established(&self) -> bool {
        !matches!(
            self.state,
            ClientState::Init
                | ClientState::MetaserverRefresh
                | ClientState::Idle
                | ClientState::StartConnect
                | ClientState::Connecting
                | ClientState::WaitCrypto
        )
    }

    fn seed_static_servers(&mut self) {
        let mut local = ServerDescriptor::new("Localhost", "localhost", DEFAULT_PORT);
        local.description = "Local server. Start one before you try to connect.".to_string();
        self.directory.add_static(local);

        for spec in &self.config.servers {
            let mut descriptor = ServerDescriptor::new(&spec.hostname, &spec.hostname, spec.port);
            descriptor.secure_port = spec.secure_port;
            descriptor.description = "Server from the command line".to_string();
            self.directory.add_static(descriptor);
        }
    }

    fn teardown(&mut self) {
        if let Some(mut session) = self.session.take() {
            session.transport.close();
        }
        self.keepalive.abandon_outstanding();
        self.files.abort();
        self.resources.revalidate();
        self.map.clear();
        self.characters.clear();
        self.pending_login = None;
        self.pending_character = None;
        self.crypto_hello_sent = false;
    }

    /// The single authoritative failure transition: one diagnostic, a
    /// clean teardown, back to idle.
    pub(crate) fn fail_to_idle(&mut self, err: ClientError) {
        if err.is_security_relevant() {
            log::error!("refusing connection: {err}");
        } else {
            log::error!("{err}");
        }
        self.teardown();
        self.last_error = Some(err);
        self.state = ClientState::Idle;
    }

    /// The transport reported the connection gone. With reconnection
    /// configured this re-enters the lifecycle at `StartConnect`; it is
    /// a fresh attempt, never a resumption.
    pub(crate) fn on_disconnect(&mut self, reason: String) {
        log::error!("connection lost: {reason}");
        self.teardown();
        self.last_error = Some(ClientError::Transport(io::Error::new(
            io::ErrorKind::ConnectionReset,
            reason,
        )));

        if self.config.reconnect && self.selected.is_some() {
            log::info!("reconnecting");
            self.state = ClientState::StartConnect;
        } else {
            self.state = ClientState::Idle;
        }
    }

    // ---- per-state handlers ----

    fn st_init(&mut self) {
        self.map.clear();
        self.session = None;
        self.state = ClientState::MetaserverRefresh;
    }

    fn st_metaserver_refresh(&mut self) {
        self.directory.clear_discovered();
        self.seed_static_servers();
        if self.config.query_metaserver {
            let urls = self.config.metaserver_urls.clone();
            self.directory.begin_refresh(&self.fetcher, &urls);
        }
        self.state = ClientState::Idle;
    }

    fn st_start_connect(&mut self) {
        let Some(descriptor) = self.selected.clone() else {
            return self.fail_to_idle(ClientError::Protocol("no server selected".to_string()));
        };

        let (port, secure) = descriptor.connect_port();
        log::info!(
            "trying server {} ({}:{})",
            descriptor.name,
            descriptor.hostname,
            port
        );
        self.keepalive.reset();
        self.crypto_hello_sent = false;
        self.connect_port = port;
        self.connect_secure = secure;
        self.state = ClientState::Connecting;
    }

    fn st_connecting(&mut self) {
        let Some(descriptor) = self.selected.clone() else {
            return self.fail_to_idle(ClientError::Protocol("no server selected".to_string()));
        };
        let (port, secure) = (self.connect_port, self.connect_secure);

        // A secure port without trust material is refused before any
        // connection attempt.
        let tls = if secure {
            match descriptor.pin() {
                Some(pin) => Some(TlsParams {
                    server_name: descriptor.hostname.clone(),
                    fingerprint: pin.to_string(),
                }),
                None => {
                    return self.fail_to_idle(ClientError::TrustVerification(format!(
                        "server {} publishes no trust material for its secure port",
                        descriptor.name
                    )));
                }
            }
        } else {
            None
        };

        let timeout = Duration::from_secs(self.config.connect_timeout_secs);
        let mut transport = match Transport::open(&descriptor.hostname, port, timeout, tls) {
            Ok(transport) => transport,
            Err(err) if err.kind() == io::ErrorKind::TimedOut => {
                return self.fail_to_idle(ClientError::Timeout(format!(
                    "connecting to {}:{}",
                    descriptor.hostname, port
                )));
            }
            Err(err) => return self.fail_to_idle(ClientError::Transport(err)),
        };

        match descriptor.verify_peer_addr(transport.peer_addr()) {
            Ok(TrustCheck::Verified) => {}
            Ok(TrustCheck::NoEmbeddedAddress) => {
                if descriptor.trust.is_some() {
                    log::warn!(
                        "certificate for {} embeds no addresses; host identity only partially verified",
                        descriptor.name
                    );
                }
            }
            Err(err) => {
                transport.close();
                return self.fail_to_idle(err);
            }
        }

        self.map.clear();
        self.characters.clear();
        self.session = Some(Session {
            transport,
            secure,
            protocol_version: 0,
            setup: None,
        });
        self.state = if secure {
            ClientState::WaitCrypto
        } else {
            ClientState::SendClientInfo
        };
    }

    fn st_wait_crypto(&mut self) {
        if !self.crypto_hello_sent && self.send(&Message::CryptoHello) {
            self.crypto_hello_sent = true;
        }
        // The handshake controller advances this state.
    }

    fn st_send_client_info(&mut self) {
        let version = self.config.protocol_version;
        if !self.send(&Message::ClientVersion { version }) {
            return;
        }

        let now = self.now_ms();
        let id = self.keepalive.begin_probe(now);
        self.last_keepalive_ms = now;
        if !self.send(&Message::KeepaliveProbe { id }) {
            return;
        }

        self.state = ClientState::WaitVersion;
    }

    fn st_version_received(&mut self) {
        let params = SetupParams {
            sound: self.config.sound,
            map_width: self.config.map_width,
            map_height: self.config.map_height,
            data_url: String::new(),
        };
        if self.send(&Message::SetupRequest(params)) {
            self.state = ClientState::WaitSetup;
        }
    }

    fn st_request_file_listing(&mut self) {
        self.files.retrieve_listing(&self.fetcher);
        // Opportunistically pick up whatever is already cached on disk.
        self.files.load(0);
        self.state = ClientState::WaitFileListing;
    }

    fn st_wait_file_listing(&mut self) {
        if self.files.listing_processed() {
            self.files.load(1);
            self.state = ClientState::RequestFiles;
        }
    }

    fn st_request_files(&mut self) {
        self.files.poll(&self.fetcher);
        if self.files.all_processed() {
            self.files.finish_load();
            log::info!("server files synchronized");
            self.state = ClientState::Login;
        }
    }

    fn st_login(&mut self) {
        if let Some(credentials) = self.pending_login.take() {
            let message = Message::LoginRequest {
                account: credentials.account,
                password: credentials.password,
            };
            if self.send(&message) {
                self.state = ClientState::WaitLogin;
            }
        }
    }

    fn st_character_select(&mut self) {
        if let Some(name) = self.pending_character.take()
            && self.send(&Message::CharacterSelect { name })
        {
            self.state = ClientState::WaitForPlay;
        }
    }

    fn st_wait_for_play(&mut self) {
        self.map.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::meta::{ServerCertificate, TrustMaterial};

    fn test_config() -> ClientConfig {
        ClientConfig {
            query_metaserver: false,
            cache_dir: std::env::temp_dir().join(format!("mistvale-state-{}", std::process::id())),
            ..ClientConfig::default()
        }
    }

    fn reach_idle(client: &mut GameClient) {
        client.advance();
        client.advance();
        assert_eq!(client.state(), ClientState::Idle);
    }

    #[test]
    fn test_startup_reaches_idle_with_loopback_seeded() {
        let mut client = GameClient::new(test_config());
        assert_eq!(client.state(), ClientState::Init);
        reach_idle(&mut client);
        assert_eq!(client.directory().count(), 1);
        assert_eq!(client.directory().get(0).unwrap().hostname, "localhost");
    }

    #[test]
    fn test_cli_servers_are_seeded_as_statics() {
        let mut config = test_config();
        config.servers.push(crate::config::ServerSpec {
            hostname: "play.example".to_string(),
            port: 7680,
            secure_port: Some(7681),
        });
        let mut client = GameClient::new(config);
        reach_idle(&mut client);

        assert_eq!(client.directory().count(), 2);
        let server = client.directory().get(1).unwrap();
        assert_eq!(server.secure_port, Some(7681));
        assert!(!server.discovered);
    }

    #[test]
    fn test_select_requires_idle() {
        let mut client = GameClient::new(test_config());
        assert!(client.select_server(0).is_err());
        reach_idle(&mut client);
        assert!(client.select_server(99).is_err());
    }

    #[test]
    fn test_secure_port_without_trust_fails_before_any_connect() {
        let mut client = GameClient::new(test_config());
        reach_idle(&mut client);

        let mut descriptor = ServerDescriptor::new("Untrusted", "127.0.0.1", 1);
        descriptor.secure_port = Some(1);
        client.add_server(descriptor);

        let index = client.directory().count() - 1;
        client.select_server(index).unwrap();
        assert_eq!(client.state(), ClientState::StartConnect);

        client.advance();
        assert_eq!(client.state(), ClientState::Connecting);
        client.advance();

        assert_eq!(client.state(), ClientState::Idle);
        // A transport failure here would mean a connect was attempted.
        assert!(matches!(
            client.last_error(),
            Some(ClientError::TrustVerification(_))
        ));
        assert!(client.session.is_none());
    }

    #[test]
    fn test_plain_connect_failure_returns_to_idle() {
        let mut client = GameClient::new(test_config());
        reach_idle(&mut client);

        // Port 1 on loopback is refused immediately on any sane host.
        client.add_server(ServerDescriptor::new("Refused", "127.0.0.1", 1));
        let index = client.directory().count() - 1;
        client.select_server(index).unwrap();

        client.advance();
        client.advance();

        assert_eq!(client.state(), ClientState::Idle);
        assert!(matches!(
            client.last_error(),
            Some(ClientError::Transport(_))
        ));
    }

    #[test]
    fn test_trust_material_survives_selection() {
        let mut client = GameClient::new(test_config());
        reach_idle(&mut client);

        let cert = ServerCertificate::parse(
            "hostname: secure.example\nfingerprint: aa\nipv4: 198.51.100.7\n",
        )
        .unwrap();
        let mut descriptor = ServerDescriptor::new("Secure", "secure.example", 7680);
        descriptor.secure_port = Some(7681);
        descriptor.trust = Some(TrustMaterial::Certificate(cert));
        client.add_server(descriptor);

        let index = client.directory().count() - 1;
        client.select_server(index).unwrap();
        assert_eq!(client.selected().unwrap().pin(), Some("aa"));
    }
}
