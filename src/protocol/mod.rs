//! Wire protocol: frame header codec, compression and message bodies.
//!
//! Every frame starts with a fixed 14-byte header:
//!
//! ```text
//! [magic "IceP"][proto major][proto minor][enc major][enc minor][type][compression][size: u32 BE]
//! ```
//!
//! `size` covers the header and the body.

pub mod compress;
pub mod header;
pub mod message;
pub mod stream;

pub use header::{
    decode_header, encode_header, CompressionStatus, EncodingVersion, Header, MessageType,
    ProtocolVersion, HEADER_SIZE, MAGIC,
};
pub use message::{
    OperationMode, Reply, ReplyBody, ReplyStatus, RequestHeader, ONEWAY_REQUEST_ID,
    REQUEST_ID_OFFSET,
};
