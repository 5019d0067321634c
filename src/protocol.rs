//! Wire codec for the shader compile protocol.
//!
//! One request and at most one response per TCP connection:
//!
//! ```text
//! Request:  magic (4) | kind (4) | payload length (4) | payload (length bytes)
//! Response: artifact length (4) | artifact (length bytes)
//! ```
//!
//! All fixed-width fields are big-endian. The functions here are pure and
//! never touch a socket.

use bytes::{Buf, BufMut, Bytes};
use std::path::Path;
use thiserror::Error;

/// Size of the fixed request header.
pub const HEADER_LEN: usize = 12;

/// Size of the length prefix in front of a response artifact.
pub const RESPONSE_PREFIX_LEN: usize = 4;

/// Sentinel opening every request header (ASCII `SHDR`).
pub const MAGIC: u32 = 0x5348_4452;

/// Hard upper bound for a declared payload length (1 MiB).
pub const MAX_PAYLOAD_LEN: u32 = 1024 * 1024;

/// Pipeline stage the source text is compiled for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ShaderKind {
    Vertex,
    Fragment,
}

impl ShaderKind {
    /// Map the wire value to a shader kind.
    pub fn from_wire(value: u32) -> Option<Self> {
        match value {
            1 => Some(ShaderKind::Vertex),
            2 => Some(ShaderKind::Fragment),
            _ => None,
        }
    }

    /// Wire value of this kind.
    #[allow(dead_code)] // Client side of the codec; the server only decodes
    pub fn to_wire(self) -> u32 {
        match self {
            ShaderKind::Vertex => 1,
            ShaderKind::Fragment => 2,
        }
    }

    /// Infer the kind from a `.vert` / `.frag` file extension.
    pub fn from_path(path: &Path) -> Option<Self> {
        match path.extension()?.to_str()? {
            "vert" => Some(ShaderKind::Vertex),
            "frag" => Some(ShaderKind::Fragment),
            _ => None,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            ShaderKind::Vertex => "vertex",
            ShaderKind::Fragment => "fragment",
        }
    }
}

impl std::fmt::Display for ShaderKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Decoded request header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Header {
    pub kind: ShaderKind,
    /// Declared payload size, always within `1..=MAX_PAYLOAD_LEN`.
    pub payload_len: u32,
}

/// Malformed or out-of-bounds request header.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum ProtocolError {
    #[error("bad magic 0x{0:08x}")]
    BadMagic(u32),
    #[error("payload of {0} bytes exceeds the {max} byte limit", max = MAX_PAYLOAD_LEN)]
    OversizedPayload(u32),
    #[error("empty payload")]
    EmptyPayload,
    #[error("invalid shader kind {0}")]
    InvalidKind(u32),
}

/// Failure to frame an artifact into a response.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum ResponseError {
    #[error("artifact of {0} bytes cannot be length-prefixed")]
    TooLarge(usize),
    #[error("failed to allocate a {0} byte response buffer")]
    Alloc(usize),
}

/// Decode the fixed 12-byte request header.
pub fn decode_header(bytes: &[u8; HEADER_LEN]) -> Result<Header, ProtocolError> {
    let mut buf = &bytes[..];
    let magic = buf.get_u32();
    let kind = buf.get_u32();
    let payload_len = buf.get_u32();

    if magic != MAGIC {
        return Err(ProtocolError::BadMagic(magic));
    }
    if payload_len > MAX_PAYLOAD_LEN {
        return Err(ProtocolError::OversizedPayload(payload_len));
    }
    if payload_len == 0 {
        return Err(ProtocolError::EmptyPayload);
    }
    let kind = ShaderKind::from_wire(kind).ok_or(ProtocolError::InvalidKind(kind))?;

    Ok(Header { kind, payload_len })
}

/// Encode a header; exact inverse of [`decode_header`].
#[allow(dead_code)] // Client side of the codec; the server only decodes
pub fn encode_header(header: &Header) -> [u8; HEADER_LEN] {
    let mut out = [0u8; HEADER_LEN];
    let mut buf = &mut out[..];
    buf.put_u32(MAGIC);
    buf.put_u32(header.kind.to_wire());
    buf.put_u32(header.payload_len);
    out
}

/// Frame an artifact: 4-byte length followed by the bytes verbatim.
pub fn encode_response(artifact: &[u8]) -> Result<Bytes, ResponseError> {
    let len =
        u32::try_from(artifact.len()).map_err(|_| ResponseError::TooLarge(artifact.len()))?;
    let total = RESPONSE_PREFIX_LEN + artifact.len();

    let mut out = Vec::new();
    out.try_reserve_exact(total).map_err(|_| ResponseError::Alloc(total))?;
    out.put_u32(len);
    out.put_slice(artifact);
    Ok(Bytes::from(out))
}

/// Zero-length response, sent on compile failure when enabled.
pub fn failure_response() -> Bytes {
    Bytes::from_static(&[0, 0, 0, 0])
}
