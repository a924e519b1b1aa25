//! Request and reply body layouts.

use crate::error::{Error, Result};
use crate::protocol::header::{
    encode_header, CompressionStatus, MessageType, ENCODING, HEADER_SIZE,
};
use crate::protocol::stream::{InputStream, OutputStream};

/// Offset of the request id (or batch count) inside a request frame.
pub const REQUEST_ID_OFFSET: usize = HEADER_SIZE;

/// Request id used for one-way requests. Never assigned to a two-way call.
pub const ONEWAY_REQUEST_ID: i32 = 0;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum OperationMode {
    Normal = 0,
    Nonmutating = 1,
    Idempotent = 2,
}

impl OperationMode {
    /// Operations that may safely execute more than once.
    pub fn is_idempotent(self) -> bool {
        !matches!(self, OperationMode::Normal)
    }
}

impl TryFrom<u8> for OperationMode {
    type Error = Error;

    fn try_from(value: u8) -> Result<Self> {
        match value {
            0 => Ok(OperationMode::Normal),
            1 => Ok(OperationMode::Nonmutating),
            2 => Ok(OperationMode::Idempotent),
            other => Err(Error::unmarshal(format!("invalid operation mode {}", other))),
        }
    }
}

/// Target and operation of a request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RequestHeader {
    pub identity: String,
    pub facet: String,
    pub operation: String,
    pub mode: OperationMode,
}

impl RequestHeader {
    pub fn new(identity: impl Into<String>, operation: impl Into<String>) -> Self {
        Self {
            identity: identity.into(),
            facet: String::new(),
            operation: operation.into(),
            mode: OperationMode::Normal,
        }
    }

    pub fn with_mode(mut self, mode: OperationMode) -> Self {
        self.mode = mode;
        self
    }

    pub fn with_facet(mut self, facet: impl Into<String>) -> Self {
        self.facet = facet.into();
        self
    }

    fn write(&self, out: &mut OutputStream) {
        out.write_string(&self.identity);
        out.write_string(&self.facet);
        out.write_string(&self.operation);
        out.write_u8(self.mode as u8);
    }

    fn read(input: &mut InputStream<'_>) -> Result<Self> {
        Ok(Self {
            identity: input.read_string()?,
            facet: input.read_string()?,
            operation: input.read_string()?,
            mode: OperationMode::try_from(input.read_u8()?)?,
        })
    }
}

/// Encode a request frame. The request id is left as zero; the connection
/// assigns it when the request is sent.
pub fn request_frame(header: &RequestHeader, params: &[u8]) -> Vec<u8> {
    let mut out = OutputStream::with_capacity(HEADER_SIZE + 64 + params.len());
    out.write_blob(&encode_header(MessageType::Request, 0, CompressionStatus::None));
    out.write_i32(ONEWAY_REQUEST_ID);
    header.write(&mut out);
    out.write_encapsulation(ENCODING, params);
    out.into_inner()
}

/// Encode one entry of a batch request body (no request id).
pub fn batch_request_entry(header: &RequestHeader, params: &[u8]) -> Vec<u8> {
    let mut out = OutputStream::with_capacity(64 + params.len());
    header.write(&mut out);
    out.write_encapsulation(ENCODING, params);
    out.into_inner()
}

/// Read one request (header plus params) from a request or batch body.
pub fn read_request(input: &mut InputStream<'_>) -> Result<(RequestHeader, Vec<u8>)> {
    let header = RequestHeader::read(input)?;
    let (_, params) = input.read_encapsulation()?;
    Ok((header, params.to_vec()))
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum ReplyStatus {
    Ok = 0,
    UserException = 1,
    ObjectNotExist = 2,
    FacetNotExist = 3,
    OperationNotExist = 4,
    UnknownLocalException = 5,
    UnknownUserException = 6,
    UnknownException = 7,
}

impl TryFrom<u8> for ReplyStatus {
    type Error = Error;

    fn try_from(value: u8) -> Result<Self> {
        Ok(match value {
            0 => ReplyStatus::Ok,
            1 => ReplyStatus::UserException,
            2 => ReplyStatus::ObjectNotExist,
            3 => ReplyStatus::FacetNotExist,
            4 => ReplyStatus::OperationNotExist,
            5 => ReplyStatus::UnknownLocalException,
            6 => ReplyStatus::UnknownUserException,
            7 => ReplyStatus::UnknownException,
            other => return Err(Error::unmarshal(format!("invalid reply status {}", other))),
        })
    }
}

/// Reply body as produced by a dispatcher, before framing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReplyBody {
    Ok(Vec<u8>),
    UserException(Vec<u8>),
    ObjectNotExist(RequestHeader),
    FacetNotExist(RequestHeader),
    OperationNotExist(RequestHeader),
    UnknownLocal(String),
    UnknownUser(String),
    Unknown(String),
}

impl ReplyBody {
    pub fn status(&self) -> ReplyStatus {
        match self {
            ReplyBody::Ok(_) => ReplyStatus::Ok,
            ReplyBody::UserException(_) => ReplyStatus::UserException,
            ReplyBody::ObjectNotExist(_) => ReplyStatus::ObjectNotExist,
            ReplyBody::FacetNotExist(_) => ReplyStatus::FacetNotExist,
            ReplyBody::OperationNotExist(_) => ReplyStatus::OperationNotExist,
            ReplyBody::UnknownLocal(_) => ReplyStatus::UnknownLocalException,
            ReplyBody::UnknownUser(_) => ReplyStatus::UnknownUserException,
            ReplyBody::Unknown(_) => ReplyStatus::UnknownException,
        }
    }

    /// Encode a complete reply frame for `request_id`.
    pub fn encode(&self, request_id: i32) -> Vec<u8> {
        let mut out = OutputStream::with_capacity(HEADER_SIZE + 64);
        out.write_blob(&encode_header(MessageType::Reply, 0, CompressionStatus::None));
        out.write_i32(request_id);
        out.write_u8(self.status() as u8);
        match self {
            ReplyBody::Ok(params) | ReplyBody::UserException(params) => {
                out.write_encapsulation(ENCODING, params);
            }
            ReplyBody::ObjectNotExist(header)
            | ReplyBody::FacetNotExist(header)
            | ReplyBody::OperationNotExist(header) => {
                out.write_string(&header.identity);
                out.write_string(&header.facet);
                out.write_string(&header.operation);
            }
            ReplyBody::UnknownLocal(reason)
            | ReplyBody::UnknownUser(reason)
            | ReplyBody::Unknown(reason) => out.write_string(reason),
        }
        out.into_inner()
    }
}

/// A reply received for a two-way request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Reply {
    pub request_id: i32,
    pub status: ReplyStatus,
    /// Bytes following the status byte.
    pub body: Vec<u8>,
}

impl Reply {
    /// Decode a reply from the bytes following the frame header.
    pub fn decode(body: &[u8]) -> Result<Self> {
        let mut input = InputStream::new(body);
        let request_id = input.read_i32()?;
        let status = ReplyStatus::try_from(input.read_u8()?)?;
        Ok(Self {
            request_id,
            status,
            body: input.rest().to_vec(),
        })
    }

    /// Interpret the reply: parameters on success, an error otherwise.
    pub fn into_result(self) -> Result<Vec<u8>> {
        let mut input = InputStream::new(&self.body);
        match self.status {
            ReplyStatus::Ok => Ok(input.read_encapsulation()?.1.to_vec()),
            ReplyStatus::UserException => Err(Error::UserException {
                payload: input.read_encapsulation()?.1.to_vec(),
            }),
            ReplyStatus::ObjectNotExist
            | ReplyStatus::FacetNotExist
            | ReplyStatus::OperationNotExist => {
                let identity = input.read_string()?;
                let facet = input.read_string()?;
                let operation = input.read_string()?;
                Err(match self.status {
                    ReplyStatus::ObjectNotExist => Error::ObjectNotExist {
                        identity,
                        facet,
                        operation,
                    },
                    ReplyStatus::FacetNotExist => Error::FacetNotExist {
                        identity,
                        facet,
                        operation,
                    },
                    _ => Error::OperationNotExist {
                        identity,
                        facet,
                        operation,
                    },
                })
            }
            ReplyStatus::UnknownLocalException => Err(Error::UnknownLocal(input.read_string()?)),
            ReplyStatus::UnknownUserException => Err(Error::UnknownUser(input.read_string()?)),
            ReplyStatus::UnknownException => Err(Error::Unknown(input.read_string()?)),
        }
    }
}
