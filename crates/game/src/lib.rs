pub mod config;
pub mod error;
pub mod files;
pub mod http;
pub mod meta;
pub mod net;
pub mod session;

pub use config::{ClientConfig, ServerSpec};
pub use error::ClientError;
pub use files::{
    FILE_ANIMS, FILE_BMAPS, FILE_EFFECTS, FILE_HFILES, FILE_SETTINGS, FILE_UPDATES, LISTING_NAME,
    ResourceCache, ResourceRecord, ServerFileEntry, ServerFileHandler, ServerFiles, UpdateState,
    digest_of,
};
pub use http::{FetchRequest, FetchState, HttpFetcher};
pub use meta::{ServerCertificate, ServerDescriptor, ServerDirectory, TrustCheck, TrustMaterial};
pub use net::{
    DEFAULT_PORT, DIGEST_LEN, FrameDecoder, FrameError, MAX_FRAME_SIZE, Message, PROTOCOL_VERSION,
    SetupParams, TlsParams, Transport, TransportEvent,
};
pub use session::{ClientState, Credentials, GameClient, KeepaliveStats, KeepaliveTracker, MapState, Session};
