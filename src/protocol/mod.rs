//! Request/response types exchanged with the application and the loop that
//! drives a [`Slave`] from a framed byte stream.

pub mod adapter;
pub mod codec;
pub mod entry;
pub mod transfer;

use std::collections::BTreeMap;
use std::io::{self, BufReader, BufWriter, Read, Write};

use anyhow::{Context, Result};
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::cache::IdentityLookup;

pub use adapter::{Slave, SlaveError};
pub use entry::EntryRecord;

/// Request metadata key carrying a resume offset.
pub const META_RESUME: &str = "resume";
/// Request metadata key carrying the listing detail level.
pub const META_DETAILS: &str = "details";

/// Access requested by `open`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OpenMode {
    Read,
    Write,
    ReadWrite,
}

impl OpenMode {
    pub fn writes(self) -> bool {
        matches!(self, OpenMode::Write | OpenMode::ReadWrite)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum Request {
    Get {
        url: String,
        #[serde(default)]
        meta: BTreeMap<String, String>,
    },
    ListDir {
        url: String,
        #[serde(default)]
        meta: BTreeMap<String, String>,
    },
    Open {
        url: String,
        mode: OpenMode,
    },
    Read {
        size: u64,
    },
    Seek {
        offset: u64,
    },
    Stat {
        url: String,
        #[serde(default)]
        meta: BTreeMap<String, String>,
    },
    Mimetype {
        url: String,
    },
    Close,
}

/// Error signals a request can end with.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    RepositoryNotFound,
    DoesNotExist,
    IsDirectory,
    IsFile,
    CannotOpenForWriting,
    CannotOpenForReading,
    CouldNotRead,
    CouldNotSeek,
    /// The request frame could not be decoded.
    MalformedRequest,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProtocolError {
    pub kind: ErrorKind,
    /// Offending path, or empty when no file is involved.
    pub detail: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Response {
    MimeType(String),
    TotalSize(u64),
    /// The transfer continues from this offset.
    CanResume(u64),
    Data(Bytes),
    ProcessedSize(u64),
    Position(u64),
    Opened,
    ListEntry(EntryRecord),
    StatEntry(EntryRecord),
    Finished,
    Error(ProtocolError),
}

impl Response {
    pub fn error(kind: ErrorKind, detail: impl Into<String>) -> Self {
        Response::Error(ProtocolError {
            kind,
            detail: detail.into(),
        })
    }

    /// Whether this response ends a request.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            Response::Finished | Response::Error(_) | Response::Opened | Response::Position(_)
        )
    }
}

/// Where a request's responses go.
pub trait ResponseSink {
    fn send(&mut self, response: Response) -> io::Result<()>;
}

impl ResponseSink for Vec<Response> {
    fn send(&mut self, response: Response) -> io::Result<()> {
        self.push(response);
        Ok(())
    }
}

/// Writes responses as frames, flushing at the end of every request.
pub struct FrameSink<W: Write> {
    writer: W,
}

impl<W: Write> FrameSink<W> {
    pub fn new(writer: W) -> Self {
        FrameSink { writer }
    }

    pub fn into_inner(self) -> W {
        self.writer
    }
}

impl<W: Write> ResponseSink for FrameSink<W> {
    fn send(&mut self, response: Response) -> io::Result<()> {
        codec::write_response(&mut self.writer, &response)?;
        if response.is_terminal() {
            self.writer.flush()?;
        }
        Ok(())
    }
}

/// Answer request frames from `reader` until it reaches end of stream.
/// Returns the number of requests handled.
pub fn serve<R, W, L>(reader: R, writer: W, slave: &mut Slave<L>) -> Result<u64>
where
    R: Read,
    W: Write,
    L: IdentityLookup,
{
    let mut reader = BufReader::new(reader);
    let mut sink = FrameSink::new(BufWriter::new(writer));
    let mut handled = 0;

    while let Some(frame) = codec::read_frame(&mut reader).context("Failed to read request frame")? {
        match codec::decode_request(&frame) {
            Ok(request) => {
                debug!(?request, "dispatching");
                slave
                    .handle(request, &mut sink)
                    .context("Failed to write response")?;
            }
            Err(e) => {
                warn!("malformed request: {}", e);
                sink.send(Response::error(ErrorKind::MalformedRequest, e.to_string()))
                    .context("Failed to write response")?;
            }
        }
        handled += 1;
    }

    sink.into_inner().flush().context("Failed to flush responses")?;
    debug!(handled, "request stream closed");
    Ok(handled)
}
