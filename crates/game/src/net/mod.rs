mod protocol;
mod transport;
mod verifier;

pub use protocol::{
    DEFAULT_PORT, DIGEST_LEN, FRAME_HEADER_LEN, FrameDecoder, FrameError, MAX_FRAME_SIZE, Message,
    PROTOCOL_VERSION, SetupParams,
};
pub use transport::{TlsParams, Transport, TransportEvent};
pub use verifier::PinnedCertVerifier;
