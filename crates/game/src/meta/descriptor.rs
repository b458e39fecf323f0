use std::net::{IpAddr, SocketAddr};

use crate::error::ClientError;

/// Identity material a server publishes through the metaserver: either a
/// full certificate record or a bare fingerprint pin.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TrustMaterial {
    Certificate(ServerCertificate),
    PublicKey(String),
}

impl TrustMaterial {
    /// Hex SHA-256 pin used to verify the peer certificate.
    pub fn fingerprint(&self) -> &str {
        match self {
            Self::Certificate(cert) => &cert.fingerprint,
            Self::PublicKey(pin) => pin,
        }
    }
}

/// Parsed certificate record. The metaserver serves these as a small
/// `key: value` text blob per server entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServerCertificate {
    pub name: String,
    pub hostname: String,
    pub port: Option<u16>,
    pub secure_port: Option<u16>,
    pub ipv4: Option<String>,
    pub ipv6: Option<String>,
    pub fingerprint: String,
}

impl ServerCertificate {
    pub fn parse(text: &str) -> Result<Self, ClientError> {
        let mut name = None;
        let mut hostname = None;
        let mut port = None;
        let mut secure_port = None;
        let mut ipv4 = None;
        let mut ipv6 = None;
        let mut fingerprint = None;

        for line in text.lines() {
            let line = line.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }
            let Some((key, value)) = line.split_once(':') else {
                return Err(ClientError::TrustVerification(format!(
                    "malformed certificate line: {line:?}"
                )));
            };
            let value = value.trim();
            match key.trim() {
                "name" => name = Some(value.to_string()),
                "hostname" => hostname = Some(value.to_string()),
                "port" => port = value.parse().ok(),
                "secure-port" => secure_port = value.parse().ok(),
                "ipv4" => ipv4 = Some(value.to_string()),
                "ipv6" => ipv6 = Some(value.to_string()),
                "fingerprint" => fingerprint = Some(value.to_ascii_lowercase()),
                _ => {}
            }
        }

        let hostname = hostname.ok_or_else(|| {
            ClientError::TrustVerification("certificate is missing a hostname".to_string())
        })?;
        let fingerprint = fingerprint.ok_or_else(|| {
            ClientError::TrustVerification("certificate is missing a fingerprint".to_string())
        })?;

        Ok(Self {
            name: name.unwrap_or_else(|| hostname.clone()),
            hostname,
            port,
            secure_port,
            ipv4,
            ipv6,
            fingerprint,
        })
    }
}

/// Outcome of the host-identity check against a certificate.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TrustCheck {
    /// The resolved peer address matches an address embedded in the
    /// certificate.
    Verified,
    /// No certificate, or the certificate embeds no addresses. The caller
    /// decides how loudly to warn.
    NoEmbeddedAddress,
}

/// One known game server, added manually or learned from a metaserver.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServerDescriptor {
    pub name: String,
    pub hostname: String,
    pub plain_port: u16,
    pub secure_port: Option<u16>,
    pub version: String,
    pub description: String,
    pub players: Option<u32>,
    pub discovered: bool,
    pub trust: Option<TrustMaterial>,
}

impl ServerDescriptor {
    pub fn new(name: &str, hostname: &str, plain_port: u16) -> Self {
        Self {
            name: name.to_string(),
            hostname: hostname.to_string(),
            plain_port,
            secure_port: None,
            version: String::new(),
            description: String::new(),
            players: None,
            discovered: false,
            trust: None,
        }
    }

    /// The port to connect to, secure preferred when available.
    pub fn connect_port(&self) -> (u16, bool) {
        match self.secure_port {
            Some(port) => (port, true),
            None => (self.plain_port, false),
        }
    }

    /// Fingerprint pin for the secure channel, if any trust material is
    /// attached.
    pub fn pin(&self) -> Option<&str> {
        self.trust.as_ref().map(TrustMaterial::fingerprint)
    }

    /// Compare the transport's resolved peer address against the
    /// addresses embedded in the certificate. A mismatch is treated as a
    /// potential spoofing attack; a certificate without embedded
    /// addresses is a reduced-trust condition, not a failure.
    pub fn verify_peer_addr(&self, addr: SocketAddr) -> Result<TrustCheck, ClientError> {
        let Some(TrustMaterial::Certificate(cert)) = &self.trust else {
            return Ok(TrustCheck::NoEmbeddedAddress);
        };

        let expected = match addr.ip() {
            IpAddr::V4(_) => cert.ipv4.as_deref(),
            IpAddr::V6(_) => cert.ipv6.as_deref(),
        };

        match expected {
            None => Ok(TrustCheck::NoEmbeddedAddress),
            Some(expected) if expected == addr.ip().to_string() => Ok(TrustCheck::Verified),
            Some(expected) => Err(ClientError::TrustVerification(format!(
                "server {} resolved to {} but its certificate names {}",
                self.name,
                addr.ip(),
                expected
            ))),
        }
    }
}
