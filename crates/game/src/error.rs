use std::io;

/// Failure taxonomy for the connection core. Components report these as
/// status values; the state machine owns the transition back to idle.
#[derive(Debug, thiserror::Error)]
pub enum ClientError {
    #[error("transport: {0}")]
    Transport(#[from] io::Error),

    #[error("trust verification: {0}")]
    TrustVerification(String),

    #[error("protocol: {0}")]
    Protocol(String),

    #[error("integrity: {0}")]
    Integrity(String),

    #[error("timed out: {0}")]
    Timeout(String),
}

impl ClientError {
    /// Trust failures are surfaced more prominently than ordinary
    /// connection errors.
    pub fn is_security_relevant(&self) -> bool {
        matches!(self, Self::TrustVerification(_))
    }
}
