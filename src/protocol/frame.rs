//! Binary frame codec
//!
//! Every frame is a fixed 24-byte header followed by `extras || key || value`.
//! All multi-byte header fields are big-endian.
//!
//! ```text
//!  0      1      2      3      4      5      6      7
//! +------+------+------+------+------+------+------+------+
//! |magic |opcode| key length  |extlen|dtype | vb/status   |
//! +------+------+------+------+------+------+------+------+
//! |     total body length     |          opaque           |
//! +------+------+------+------+------+------+------+------+
//! |                          CAS                          |
//! +------+------+------+------+------+------+------+------+
//! ```

use super::opcode::Magic;
use super::status::Status;
use crate::utils::ProtocolError;

/// Size of the fixed header
pub const HEADER_LEN: usize = 24;

/// Largest body we accept (20 MiB document plus room for extras/key/xattrs)
pub const MAX_BODY_LEN: u32 = 21 * 1024 * 1024;

/// Decoded frame header
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Header {
    pub magic: Magic,
    pub opcode: u8,
    pub key_len: u16,
    pub extras_len: u8,
    pub datatype: u8,
    /// vBucket id for requests, status for responses
    pub vbucket_or_status: u16,
    pub body_len: u32,
    pub opaque: u32,
    pub cas: u64,
}

impl Header {
    /// Parse and validate a header
    pub fn parse(buf: &[u8; HEADER_LEN]) -> Result<Self, ProtocolError> {
        let magic = Magic::from_u8(buf[0]).ok_or(ProtocolError::InvalidMagic(buf[0]))?;
        let header = Header {
            magic,
            opcode: buf[1],
            key_len: u16::from_be_bytes([buf[2], buf[3]]),
            extras_len: buf[4],
            datatype: buf[5],
            vbucket_or_status: u16::from_be_bytes([buf[6], buf[7]]),
            body_len: u32::from_be_bytes([buf[8], buf[9], buf[10], buf[11]]),
            opaque: u32::from_be_bytes([buf[12], buf[13], buf[14], buf[15]]),
            cas: u64::from_be_bytes([
                buf[16], buf[17], buf[18], buf[19], buf[20], buf[21], buf[22], buf[23],
            ]),
        };

        if header.body_len > MAX_BODY_LEN {
            return Err(ProtocolError::BodyTooLarge(header.body_len));
        }
        if header.key_len as u32 + header.extras_len as u32 > header.body_len {
            return Err(ProtocolError::InconsistentLengths {
                key_len: header.key_len,
                extras_len: header.extras_len,
                body_len: header.body_len,
            });
        }
        Ok(header)
    }

    pub fn write_to(&self, out: &mut Vec<u8>) {
        out.push(self.magic as u8);
        out.push(self.opcode);
        out.extend_from_slice(&self.key_len.to_be_bytes());
        out.push(self.extras_len);
        out.push(self.datatype);
        out.extend_from_slice(&self.vbucket_or_status.to_be_bytes());
        out.extend_from_slice(&self.body_len.to_be_bytes());
        out.extend_from_slice(&self.opaque.to_be_bytes());
        out.extend_from_slice(&self.cas.to_be_bytes());
    }

    /// Status of a response header
    pub fn status(&self) -> Status {
        Status::from_u16(self.vbucket_or_status)
    }
}

/// A complete request or response frame
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub header: Header,
    pub extras: Vec<u8>,
    pub key: Vec<u8>,
    pub value: Vec<u8>,
}

impl Frame {
    /// Build a request frame; lengths are derived from the parts
    #[allow(clippy::too_many_arguments)]
    pub fn request(
        opcode: u8,
        vbucket: u16,
        opaque: u32,
        cas: u64,
        datatype: u8,
        extras: Vec<u8>,
        key: Vec<u8>,
        value: Vec<u8>,
    ) -> Result<Self, ProtocolError> {
        Self::build(Magic::Request, opcode, vbucket, opaque, cas, datatype, extras, key, value)
    }

    /// Build a response frame (used by tests and the mock server)
    pub fn response(
        opcode: u8,
        status: Status,
        opaque: u32,
        cas: u64,
        extras: Vec<u8>,
        key: Vec<u8>,
        value: Vec<u8>,
    ) -> Result<Self, ProtocolError> {
        Self::build(
            Magic::Response,
            opcode,
            status.as_u16(),
            opaque,
            cas,
            0,
            extras,
            key,
            value,
        )
    }

    #[allow(clippy::too_many_arguments)]
    fn build(
        magic: Magic,
        opcode: u8,
        vbucket_or_status: u16,
        opaque: u32,
        cas: u64,
        datatype: u8,
        extras: Vec<u8>,
        key: Vec<u8>,
        value: Vec<u8>,
    ) -> Result<Self, ProtocolError> {
        let key_len =
            u16::try_from(key.len()).map_err(|_| ProtocolError::KeyTooLong(key.len()))?;
        let extras_len = u8::try_from(extras.len())
            .map_err(|_| ProtocolError::Malformed(format!("{} bytes of extras", extras.len())))?;
        let body_len = (extras.len() + key.len() + value.len()) as u64;
        if body_len > MAX_BODY_LEN as u64 {
            return Err(ProtocolError::BodyTooLarge(body_len.min(u32::MAX as u64) as u32));
        }

        Ok(Self {
            header: Header {
                magic,
                opcode,
                key_len,
                extras_len,
                datatype,
                vbucket_or_status,
                body_len: body_len as u32,
                opaque,
                cas,
            },
            extras,
            key,
            value,
        })
    }

    /// Split a body according to an already validated header
    pub fn from_parts(header: Header, mut body: Vec<u8>) -> Result<Self, ProtocolError> {
        if body.len() != header.body_len as usize {
            return Err(ProtocolError::Malformed(format!(
                "expected {} body bytes, got {}",
                header.body_len,
                body.len()
            )));
        }
        let extras_end = header.extras_len as usize;
        let key_end = extras_end + header.key_len as usize;
        let value = body.split_off(key_end);
        let key = body.split_off(extras_end);
        Ok(Self {
            header,
            extras: body,
            key,
            value,
        })
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(HEADER_LEN + self.header.body_len as usize);
        self.encode_into(&mut out);
        out
    }

    pub fn encode_into(&self, out: &mut Vec<u8>) {
        self.header.write_to(out);
        out.extend_from_slice(&self.extras);
        out.extend_from_slice(&self.key);
        out.extend_from_slice(&self.value);
    }

    pub fn status(&self) -> Status {
        self.header.status()
    }

    pub fn opaque(&self) -> u32 {
        self.header.opaque
    }
}

/// Incremental decoder for a byte stream
///
/// Bytes may arrive in arbitrary chunks; a frame is only produced once its
/// header and exactly `body_len` further bytes have been buffered.
#[derive(Debug, Default)]
pub struct FrameDecoder {
    buf: Vec<u8>,
    pending: Option<Header>,
}

impl FrameDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append freshly read bytes
    pub fn feed(&mut self, data: &[u8]) {
        self.buf.extend_from_slice(data);
    }

    /// Bytes buffered but not yet consumed
    pub fn buffered(&self) -> usize {
        self.buf.len()
    }

    /// Bytes still required before the next frame can be produced
    pub fn needed(&self) -> usize {
        match self.pending {
            Some(h) => (h.body_len as usize).saturating_sub(self.buf.len()),
            None => HEADER_LEN.saturating_sub(self.buf.len()),
        }
    }

    /// Produce the next complete frame, if any
    pub fn next_frame(&mut self) -> Result<Option<Frame>, ProtocolError> {
        if self.pending.is_none() {
            if self.buf.len() < HEADER_LEN {
                return Ok(None);
            }
            let mut raw = [0u8; HEADER_LEN];
            raw.copy_from_slice(&self.buf[..HEADER_LEN]);
            let header = Header::parse(&raw)?;
            self.buf.drain(..HEADER_LEN);
            self.pending = Some(header);
        }

        let header = match self.pending {
            Some(h) => h,
            None => return Ok(None),
        };
        let body_len = header.body_len as usize;
        if self.buf.len() < body_len {
            return Ok(None);
        }

        let rest = self.buf.split_off(body_len);
        let body = std::mem::replace(&mut self.buf, rest);
        self.pending = None;
        Frame::from_parts(header, body).map(Some)
    }

    /// Drop any partially decoded state
    pub fn reset(&mut self) {
        self.buf.clear();
        self.pending = None;
    }
}
