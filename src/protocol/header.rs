use crate::error::{Error, Result};
use std::fmt;
use tracing::{trace, warn};

// Wire protocol constants
pub const MAGIC: [u8; 4] = *b"IceP";
pub const HEADER_SIZE: usize = 14;
pub const MESSAGE_TYPE_OFFSET: usize = 8;
pub const COMPRESSION_OFFSET: usize = 9;
pub const SIZE_OFFSET: usize = 10;

pub const PROTOCOL: ProtocolVersion = ProtocolVersion { major: 1, minor: 0 };
pub const PROTOCOL_ENCODING: EncodingVersion = EncodingVersion { major: 1, minor: 0 };
pub const ENCODING: EncodingVersion = EncodingVersion { major: 1, minor: 1 };

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ProtocolVersion {
    pub major: u8,
    pub minor: u8,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct EncodingVersion {
    pub major: u8,
    pub minor: u8,
}

impl fmt::Display for ProtocolVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.major, self.minor)
    }
}

impl fmt::Display for EncodingVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.major, self.minor)
    }
}

/// A peer speaking a newer minor version of the same major protocol is
/// rejected; older minors are accepted.
pub fn check_supported_protocol(version: ProtocolVersion) -> Result<()> {
    if version.major != PROTOCOL.major || version.minor > PROTOCOL.minor {
        return Err(Error::UnsupportedProtocol {
            major: version.major,
            minor: version.minor,
            supported: PROTOCOL.to_string(),
        });
    }
    Ok(())
}

pub fn check_supported_encoding(version: EncodingVersion) -> Result<()> {
    if version.major != PROTOCOL_ENCODING.major || version.minor > PROTOCOL_ENCODING.minor {
        return Err(Error::UnsupportedEncoding {
            major: version.major,
            minor: version.minor,
            supported: PROTOCOL_ENCODING.to_string(),
        });
    }
    Ok(())
}

/// Message type byte. Values are fixed by the wire protocol.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum MessageType {
    Request = 0,
    RequestBatch = 1,
    Reply = 2,
    ValidateConnection = 3,
    CloseConnection = 4,
}

impl TryFrom<u8> for MessageType {
    type Error = Error;

    fn try_from(value: u8) -> Result<Self> {
        match value {
            0 => Ok(MessageType::Request),
            1 => Ok(MessageType::RequestBatch),
            2 => Ok(MessageType::Reply),
            3 => Ok(MessageType::ValidateConnection),
            4 => Ok(MessageType::CloseConnection),
            other => Err(Error::UnknownMessage {
                message_type: other,
            }),
        }
    }
}

impl fmt::Display for MessageType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            MessageType::Request => "request",
            MessageType::RequestBatch => "batch request",
            MessageType::Reply => "reply",
            MessageType::ValidateConnection => "validate connection",
            MessageType::CloseConnection => "close connection",
        };
        f.write_str(name)
    }
}

/// Compression status byte of a frame header.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum CompressionStatus {
    /// Sender does not compress.
    None = 0,
    /// Sender supports compression but this frame is not compressed.
    Supported = 1,
    /// Frame body is compressed.
    Compressed = 2,
}

impl TryFrom<u8> for CompressionStatus {
    type Error = Error;

    fn try_from(value: u8) -> Result<Self> {
        match value {
            0 => Ok(CompressionStatus::None),
            1 => Ok(CompressionStatus::Supported),
            2 => Ok(CompressionStatus::Compressed),
            other => Err(Error::unmarshal(format!(
                "invalid compression status {}",
                other
            ))),
        }
    }
}

/// Decoded fixed-size frame header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Header {
    pub protocol: ProtocolVersion,
    pub encoding: EncodingVersion,
    pub message_type: MessageType,
    pub compression: CompressionStatus,
    /// Total frame size, header included.
    pub size: usize,
}

/// Encode a frame header for a frame of `size` total bytes.
pub fn encode_header(
    message_type: MessageType,
    size: usize,
    compression: CompressionStatus,
) -> [u8; HEADER_SIZE] {
    let mut header = [0u8; HEADER_SIZE];
    header[..4].copy_from_slice(&MAGIC);
    header[4] = PROTOCOL.major;
    header[5] = PROTOCOL.minor;
    header[6] = PROTOCOL_ENCODING.major;
    header[7] = PROTOCOL_ENCODING.minor;
    header[MESSAGE_TYPE_OFFSET] = message_type as u8;
    header[COMPRESSION_OFFSET] = compression as u8;
    header[SIZE_OFFSET..].copy_from_slice(&(size as u32).to_be_bytes());
    header
}

/// Rewrite the size field of an already encoded frame.
pub fn patch_size(frame: &mut [u8], size: usize) {
    frame[SIZE_OFFSET..HEADER_SIZE].copy_from_slice(&(size as u32).to_be_bytes());
}

/// Read the raw size field without validating the rest of the header.
pub fn read_size(bytes: &[u8]) -> i64 {
    let mut size = [0u8; 4];
    size.copy_from_slice(&bytes[SIZE_OFFSET..HEADER_SIZE]);
    i64::from(i32::from_be_bytes(size))
}

/// Validate the magic and versions of a header and return the declared size.
///
/// The message type is not interpreted here so that callers which treat
/// unknown types as a dispatch-level failure can still read the body.
pub fn decode_prefix(bytes: &[u8], max_size: usize) -> Result<usize> {
    if bytes.len() < HEADER_SIZE {
        return Err(Error::IllegalMessageSize {
            size: bytes.len() as i64,
        });
    }

    let mut magic = [0u8; 4];
    magic.copy_from_slice(&bytes[..4]);
    if magic != MAGIC {
        warn!(magic = ?magic, "Received frame with bad magic");
        return Err(Error::BadMagic { magic });
    }

    check_supported_protocol(ProtocolVersion {
        major: bytes[4],
        minor: bytes[5],
    })?;
    check_supported_encoding(EncodingVersion {
        major: bytes[6],
        minor: bytes[7],
    })?;

    let size = read_size(bytes);
    if size < HEADER_SIZE as i64 {
        return Err(Error::IllegalMessageSize { size });
    }
    let size = size as usize;
    if max_size > 0 && size > max_size {
        return Err(Error::MessageTooLarge { size, max_size });
    }
    Ok(size)
}

/// Decode and validate a full frame header.
pub fn decode_header(bytes: &[u8], max_size: usize) -> Result<Header> {
    let size = decode_prefix(bytes, max_size)?;
    let message_type = MessageType::try_from(bytes[MESSAGE_TYPE_OFFSET])?;
    let compression = CompressionStatus::try_from(bytes[COMPRESSION_OFFSET])?;
    trace!(%message_type, size, ?compression, "Decoded frame header");
    Ok(Header {
        protocol: ProtocolVersion {
            major: bytes[4],
            minor: bytes[5],
        },
        encoding: EncodingVersion {
            major: bytes[6],
            minor: bytes[7],
        },
        message_type,
        compression,
        size,
    })
}

/// Header-only control frame (validate connection, heartbeat, close).
pub fn control_frame(message_type: MessageType) -> Vec<u8> {
    encode_header(message_type, HEADER_SIZE, CompressionStatus::None).to_vec()
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_header_layout() {
        let header = encode_header(MessageType::Reply, 300, CompressionStatus::Compressed);
        assert_eq!(&header[..4], b"IceP");
        assert_eq!(header[4..8], [1, 0, 1, 0]);
        assert_eq!(header[8], 2);
        assert_eq!(header[9], 2);
        assert_eq!(header[10..14], [0, 0, 1, 44]);
    }

    #[test]
    fn test_bad_magic_rejected() {
        let mut header = encode_header(MessageType::Request, HEADER_SIZE, CompressionStatus::None);
        header[0] = b'X';
        assert!(matches!(
            decode_header(&header, 0),
            Err(Error::BadMagic { magic }) if magic == *b"XceP"
        ));
    }

    #[test]
    fn test_newer_protocol_rejected_older_accepted() {
        let mut header = encode_header(MessageType::Request, HEADER_SIZE, CompressionStatus::None);
        header[5] = 1;
        assert!(matches!(
            decode_header(&header, 0),
            Err(Error::UnsupportedProtocol { major: 1, minor: 1, .. })
        ));

        let mut header = encode_header(MessageType::Request, HEADER_SIZE, CompressionStatus::None);
        header[4] = 2;
        header[5] = 0;
        assert!(decode_header(&header, 0).is_err());

        let mut header = encode_header(MessageType::Request, HEADER_SIZE, CompressionStatus::None);
        header[7] = 9;
        assert!(matches!(
            decode_header(&header, 0),
            Err(Error::UnsupportedEncoding { .. })
        ));
    }

    #[test]
    fn test_size_limits() {
        let header = encode_header(MessageType::Request, 10, CompressionStatus::None);
        assert!(matches!(
            decode_header(&header, 0),
            Err(Error::IllegalMessageSize { size: 10 })
        ));

        let header = encode_header(MessageType::Request, 2048, CompressionStatus::None);
        assert!(matches!(
            decode_header(&header, 1024),
            Err(Error::MessageTooLarge { size: 2048, max_size: 1024 })
        ));
        assert_eq!(decode_header(&header, 0).unwrap().size, 2048);
    }

    #[test]
    fn test_negative_size_is_illegal() {
        let mut header = encode_header(MessageType::Request, HEADER_SIZE, CompressionStatus::None);
        header[10..14].copy_from_slice(&(-1i32).to_be_bytes());
        assert!(matches!(
            decode_header(&header, 0),
            Err(Error::IllegalMessageSize { size: -1 })
        ));
    }

    #[test]
    fn test_unknown_message_type() {
        let mut header = encode_header(MessageType::Request, HEADER_SIZE, CompressionStatus::None);
        header[8] = 9;
        assert!(matches!(
            decode_header(&header, 0),
            Err(Error::UnknownMessage { message_type: 9 })
        ));
        // The prefix check alone still succeeds.
        assert_eq!(decode_prefix(&header, 0).unwrap(), HEADER_SIZE);
    }

    fn message_types() -> impl Strategy<Value = MessageType> {
        prop_oneof![
            Just(MessageType::Request),
            Just(MessageType::RequestBatch),
            Just(MessageType::Reply),
            Just(MessageType::ValidateConnection),
            Just(MessageType::CloseConnection),
        ]
    }

    fn compressions() -> impl Strategy<Value = CompressionStatus> {
        prop_oneof![
            Just(CompressionStatus::None),
            Just(CompressionStatus::Supported),
            Just(CompressionStatus::Compressed),
        ]
    }

    proptest! {
        #[test]
        fn prop_header_round_trip(
            message_type in message_types(),
            compression in compressions(),
            size in HEADER_SIZE..(i32::MAX as usize),
        ) {
            let encoded = encode_header(message_type, size, compression);
            let decoded = decode_header(&encoded, 0).unwrap();
            prop_assert_eq!(decoded.message_type, message_type);
            prop_assert_eq!(decoded.compression, compression);
            prop_assert_eq!(decoded.size, size);
        }
    }
}
