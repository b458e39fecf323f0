use rkyv::util::AlignedVec;
use rkyv::{Archive, Deserialize, Serialize, rancor};

pub const PROTOCOL_VERSION: u32 = 1;
pub const DEFAULT_PORT: u16 = 1728;

/// Length prefix on every frame, little-endian byte count of the payload.
pub const FRAME_HEADER_LEN: usize = 4;
pub const MAX_FRAME_SIZE: usize = 4 * 1024 * 1024;

/// SHA-512 content digest length.
pub const DIGEST_LEN: usize = 64;

/// Capabilities exchanged during session setup. The client proposes, the
/// server acknowledges with the values it settled on.
#[derive(Debug, Clone, PartialEq, Eq, Archive, Serialize, Deserialize)]
#[rkyv(derive(Debug))]
pub struct SetupParams {
    pub sound: bool,
    pub map_width: u8,
    pub map_height: u8,
    /// Base URL for server file and resource downloads. Empty in the
    /// request; filled in by the acknowledgment.
    pub data_url: String,
}

#[derive(Debug, Clone, PartialEq, Archive, Serialize, Deserialize)]
#[rkyv(derive(Debug))]
pub enum Message {
    CryptoHello,
    ClientVersion {
        version: u32,
    },
    VersionAck {
        version: u32,
    },
    SetupRequest(SetupParams),
    SetupAck(SetupParams),
    KeepaliveProbe {
        id: u32,
    },
    KeepaliveReply {
        id: u32,
    },
    LoginRequest {
        account: String,
        password: String,
    },
    LoginAck {
        account: String,
        characters: Vec<String>,
    },
    CharacterSelect {
        name: String,
    },
    PlayStart,
    ResourcePush {
        name: String,
        digest: [u8; DIGEST_LEN],
        data: Vec<u8>,
    },
}

#[derive(Debug, thiserror::Error)]
pub enum FrameError {
    #[error("serialization failed: {0}")]
    Serialize(rancor::Error),
    #[error("deserialization failed: {0}")]
    Deserialize(rancor::Error),
    #[error("frame of {0} bytes exceeds the {MAX_FRAME_SIZE} byte limit")]
    Oversize(usize),
}

impl Message {
    /// Serialize into a length-prefixed frame ready for the wire.
    pub fn to_frame(&self) -> Result<Vec<u8>, FrameError> {
        let payload = rkyv::to_bytes::<rancor::Error>(self).map_err(FrameError::Serialize)?;
        if payload.len() > MAX_FRAME_SIZE {
            return Err(FrameError::Oversize(payload.len()));
        }

        let mut frame = Vec::with_capacity(FRAME_HEADER_LEN + payload.len());
        frame.extend_from_slice(&(payload.len() as u32).to_le_bytes());
        frame.extend_from_slice(&payload);
        Ok(frame)
    }

    pub fn from_payload(payload: &[u8]) -> Result<Self, FrameError> {
        // Validation requires the archive's alignment, which arbitrary
        // stream offsets do not guarantee.
        let mut aligned = AlignedVec::<16>::with_capacity(payload.len());
        aligned.extend_from_slice(payload);
        rkyv::from_bytes::<Self, rancor::Error>(&aligned).map_err(FrameError::Deserialize)
    }
}

/// Incremental frame assembly over a byte stream. Bytes go in as they
/// arrive; complete messages come out.
#[derive(Debug, Default)]
pub struct FrameDecoder {
    buf: Vec<u8>,
}

impl FrameDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn extend(&mut self, bytes: &[u8]) {
        self.buf.extend_from_slice(bytes);
    }

    pub fn next_frame(&mut self) -> Result<Option<Message>, FrameError> {
        if self.buf.len() < FRAME_HEADER_LEN {
            return Ok(None);
        }

        let len = u32::from_le_bytes([self.buf[0], self.buf[1], self.buf[2], self.buf[3]]) as usize;
        if len > MAX_FRAME_SIZE {
            return Err(FrameError::Oversize(len));
        }
        if self.buf.len() < FRAME_HEADER_LEN + len {
            return Ok(None);
        }

        let message = Message::from_payload(&self.buf[FRAME_HEADER_LEN..FRAME_HEADER_LEN + len])?;
        self.buf.drain(..FRAME_HEADER_LEN + len);
        Ok(Some(message))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_frame_roundtrip() {
        let message = Message::KeepaliveProbe { id: 42 };
        let frame = message.to_frame().unwrap();

        let mut decoder = FrameDecoder::new();
        decoder.extend(&frame);

        let decoded = decoder.next_frame().unwrap().unwrap();
        assert_eq!(decoded, message);
        assert!(decoder.next_frame().unwrap().is_none());
    }

    #[test]
    fn test_partial_frame_waits_for_more_bytes() {
        let message = Message::VersionAck {
            version: PROTOCOL_VERSION,
        };
        let frame = message.to_frame().unwrap();

        let mut decoder = FrameDecoder::new();
        decoder.extend(&frame[..3]);
        assert!(decoder.next_frame().unwrap().is_none());

        decoder.extend(&frame[3..frame.len() - 1]);
        assert!(decoder.next_frame().unwrap().is_none());

        decoder.extend(&frame[frame.len() - 1..]);
        assert_eq!(decoder.next_frame().unwrap().unwrap(), message);
    }

    #[test]
    fn test_back_to_back_frames_decode_in_order() {
        let first = Message::ClientVersion {
            version: PROTOCOL_VERSION,
        };
        let second = Message::KeepaliveReply { id: 7 };

        let mut bytes = first.to_frame().unwrap();
        bytes.extend_from_slice(&second.to_frame().unwrap());

        let mut decoder = FrameDecoder::new();
        decoder.extend(&bytes);

        assert_eq!(decoder.next_frame().unwrap().unwrap(), first);
        assert_eq!(decoder.next_frame().unwrap().unwrap(), second);
        assert!(decoder.next_frame().unwrap().is_none());
    }

    #[test]
    fn test_oversize_header_rejected() {
        let mut decoder = FrameDecoder::new();
        decoder.extend(&(MAX_FRAME_SIZE as u32 + 1).to_le_bytes());
        decoder.extend(&[0u8; 16]);

        assert!(matches!(decoder.next_frame(), Err(FrameError::Oversize(_))));
    }

    #[test]
    fn test_setup_params_roundtrip() {
        let message = Message::SetupAck(SetupParams {
            sound: true,
            map_width: 17,
            map_height: 17,
            data_url: "http://example.com/data".to_string(),
        });
        let frame = message.to_frame().unwrap();

        let mut decoder = FrameDecoder::new();
        decoder.extend(&frame);
        assert_eq!(decoder.next_frame().unwrap().unwrap(), message);
    }

    #[test]
    fn test_resource_push_roundtrip() {
        let message = Message::ResourcePush {
            name: "sky_day".to_string(),
            digest: [0xAB; DIGEST_LEN],
            data: vec![1, 2, 3, 4],
        };
        let frame = message.to_frame().unwrap();

        let mut decoder = FrameDecoder::new();
        decoder.extend(&frame);
        assert_eq!(decoder.next_frame().unwrap().unwrap(), message);
    }
}
