//! Framing: `[u32 big-endian length][u8 tag][payload]`, where the length
//! counts the tag and the payload. Payloads are JSON except for data
//! chunks, which travel as raw bytes.

use std::io::{self, Read, Write};

use bytes::{BufMut, Bytes, BytesMut};
use thiserror::Error;

use super::{EntryRecord, ProtocolError, Request, Response};

/// Largest accepted frame, tag included.
pub const MAX_FRAME: usize = 64 * 1024 * 1024;

pub const TAG_REQUEST: u8 = 0x01;
pub const TAG_MIME_TYPE: u8 = 0x10;
pub const TAG_TOTAL_SIZE: u8 = 0x11;
pub const TAG_CAN_RESUME: u8 = 0x12;
pub const TAG_DATA: u8 = 0x13;
pub const TAG_PROCESSED_SIZE: u8 = 0x14;
pub const TAG_POSITION: u8 = 0x15;
pub const TAG_OPENED: u8 = 0x16;
pub const TAG_LIST_ENTRY: u8 = 0x17;
pub const TAG_STAT_ENTRY: u8 = 0x18;
pub const TAG_FINISHED: u8 = 0x19;
pub const TAG_ERROR: u8 = 0x1a;

#[derive(Debug, Error)]
pub enum CodecError {
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("invalid payload: {0}")]
    Json(#[from] serde_json::Error),

    #[error("frame of {0} bytes exceeds the limit")]
    FrameTooLarge(usize),

    #[error("frame has no tag")]
    EmptyFrame,

    #[error("unexpected frame tag {0:#04x}")]
    UnknownTag(u8),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub tag: u8,
    pub payload: Bytes,
}

pub fn write_frame<W: Write>(writer: &mut W, tag: u8, payload: &[u8]) -> Result<(), CodecError> {
    let len = payload.len() + 1;
    if len > MAX_FRAME {
        return Err(CodecError::FrameTooLarge(len));
    }
    let mut header = BytesMut::with_capacity(5);
    header.put_u32(len as u32);
    header.put_u8(tag);
    writer.write_all(&header)?;
    writer.write_all(payload)?;
    Ok(())
}

/// Read one frame; `Ok(None)` on a clean end of stream.
pub fn read_frame<R: Read>(reader: &mut R) -> Result<Option<Frame>, CodecError> {
    let mut len_buf = [0u8; 4];
    let mut filled = 0;
    while filled < len_buf.len() {
        match reader.read(&mut len_buf[filled..]) {
            Ok(0) if filled == 0 => return Ok(None),
            Ok(0) => return Err(io::Error::from(io::ErrorKind::UnexpectedEof).into()),
            Ok(n) => filled += n,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
            Err(e) => return Err(e.into()),
        }
    }

    let len = u32::from_be_bytes(len_buf) as usize;
    if len == 0 {
        return Err(CodecError::EmptyFrame);
    }
    if len > MAX_FRAME {
        return Err(CodecError::FrameTooLarge(len));
    }

    let mut body = vec![0u8; len];
    reader.read_exact(&mut body)?;
    let mut body = Bytes::from(body);
    let tag = body[0];
    let payload = body.split_off(1);
    Ok(Some(Frame { tag, payload }))
}

pub fn encode_request(request: &Request) -> Result<Frame, CodecError> {
    Ok(Frame {
        tag: TAG_REQUEST,
        payload: Bytes::from(serde_json::to_vec(request)?),
    })
}

pub fn decode_request(frame: &Frame) -> Result<Request, CodecError> {
    if frame.tag != TAG_REQUEST {
        return Err(CodecError::UnknownTag(frame.tag));
    }
    Ok(serde_json::from_slice(&frame.payload)?)
}

pub fn encode_response(response: &Response) -> Result<Frame, CodecError> {
    let json = |tag: u8, value: Vec<u8>| Frame {
        tag,
        payload: Bytes::from(value),
    };
    Ok(match response {
        Response::MimeType(mime) => json(TAG_MIME_TYPE, serde_json::to_vec(mime)?),
        Response::TotalSize(size) => json(TAG_TOTAL_SIZE, serde_json::to_vec(size)?),
        Response::CanResume(offset) => json(TAG_CAN_RESUME, serde_json::to_vec(offset)?),
        Response::Data(data) => Frame {
            tag: TAG_DATA,
            payload: data.clone(),
        },
        Response::ProcessedSize(size) => json(TAG_PROCESSED_SIZE, serde_json::to_vec(size)?),
        Response::Position(offset) => json(TAG_POSITION, serde_json::to_vec(offset)?),
        Response::Opened => json(TAG_OPENED, Vec::new()),
        Response::ListEntry(entry) => json(TAG_LIST_ENTRY, serde_json::to_vec(entry)?),
        Response::StatEntry(entry) => json(TAG_STAT_ENTRY, serde_json::to_vec(entry)?),
        Response::Finished => json(TAG_FINISHED, Vec::new()),
        Response::Error(error) => json(TAG_ERROR, serde_json::to_vec(error)?),
    })
}

pub fn decode_response(frame: &Frame) -> Result<Response, CodecError> {
    let payload = &frame.payload;
    Ok(match frame.tag {
        TAG_MIME_TYPE => Response::MimeType(serde_json::from_slice(payload)?),
        TAG_TOTAL_SIZE => Response::TotalSize(serde_json::from_slice(payload)?),
        TAG_CAN_RESUME => Response::CanResume(serde_json::from_slice(payload)?),
        TAG_DATA => Response::Data(payload.clone()),
        TAG_PROCESSED_SIZE => Response::ProcessedSize(serde_json::from_slice(payload)?),
        TAG_POSITION => Response::Position(serde_json::from_slice(payload)?),
        TAG_OPENED => Response::Opened,
        TAG_LIST_ENTRY => Response::ListEntry(serde_json::from_slice::<EntryRecord>(payload)?),
        TAG_STAT_ENTRY => Response::StatEntry(serde_json::from_slice::<EntryRecord>(payload)?),
        TAG_FINISHED => Response::Finished,
        TAG_ERROR => Response::Error(serde_json::from_slice::<ProtocolError>(payload)?),
        other => return Err(CodecError::UnknownTag(other)),
    })
}

pub fn write_response<W: Write>(writer: &mut W, response: &Response) -> io::Result<()> {
    let frame = encode_response(response).map_err(|e| match e {
        CodecError::Io(e) => e,
        other => io::Error::new(io::ErrorKind::InvalidData, other),
    })?;
    write_frame(writer, frame.tag, &frame.payload).map_err(|e| match e {
        CodecError::Io(e) => e,
        other => io::Error::new(io::ErrorKind::InvalidData, other),
    })
}
