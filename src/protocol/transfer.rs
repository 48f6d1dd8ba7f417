//! Moving file content to the client.

use bytes::Bytes;
use tracing::{debug, warn};

use super::adapter::SlaveError;
use super::{Response, ResponseSink};
use crate::vfs::{NodeId, Repository};

/// Parse a resume offset, ignoring anything unusable.
pub fn resume_offset(resume: Option<&str>, size: u64) -> Option<u64> {
    resume?.trim().parse::<u64>().ok().filter(|&offset| offset < size)
}

/// Stream a whole file, optionally continuing from `resume`.
///
/// Every chunk is followed by the running byte count. The end of content
/// is marked by an empty chunk before `Finished`.
pub fn send_file(
    repo: &mut Repository,
    node: NodeId,
    path: &str,
    resume: Option<&str>,
    chunk_size: usize,
    sink: &mut impl ResponseSink,
) -> Result<(), SlaveError> {
    let could_not_read = |e: crate::error::StoreError| {
        warn!(path, "read failed: {}", e);
        SlaveError::CouldNotRead(path.to_string())
    };

    sink.send(Response::MimeType(repo.node(node).attrs.mime_type.clone()))?;
    let size = repo.file_size(node).map_err(could_not_read)?;
    sink.send(Response::TotalSize(size))?;
    repo.seek(node, 0).map_err(could_not_read)?;

    let mut processed = 0u64;
    if let Some(offset) = resume_offset(resume, size) {
        match repo.seek(node, offset) {
            Ok(()) => {
                debug!(path, offset, "resuming transfer");
                sink.send(Response::CanResume(offset))?;
                processed = offset;
            }
            Err(e) => debug!(path, offset, "cannot resume: {}", e),
        }
    }

    loop {
        match repo.read(node, chunk_size).map_err(could_not_read)? {
            Some(chunk) => {
                processed += chunk.len() as u64;
                sink.send(Response::Data(chunk))?;
                sink.send(Response::ProcessedSize(processed))?;
            }
            None => {
                sink.send(Response::Data(Bytes::new()))?;
                sink.send(Response::ProcessedSize(processed))?;
                sink.send(Response::Finished)?;
                return Ok(());
            }
        }
    }
}

/// Outcome of a handle read.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReadOutcome {
    /// The requested count was delivered.
    Satisfied,
    /// Content ran out; the handle is exhausted.
    Exhausted,
}

/// Send up to `count` bytes from the cursor of an open file.
pub fn send_range(
    repo: &mut Repository,
    node: NodeId,
    path: &str,
    count: u64,
    chunk_size: usize,
    sink: &mut impl ResponseSink,
) -> Result<ReadOutcome, SlaveError> {
    let mut remaining = count;
    while remaining > 0 {
        let want = remaining.min(chunk_size as u64) as usize;
        let chunk = repo.read(node, want).map_err(|e| {
            warn!(path, "read failed: {}", e);
            SlaveError::CouldNotRead(path.to_string())
        })?;
        match chunk {
            Some(chunk) => {
                remaining -= chunk.len() as u64;
                sink.send(Response::Data(chunk))?;
            }
            None => {
                sink.send(Response::Data(Bytes::new()))?;
                sink.send(Response::Finished)?;
                return Ok(ReadOutcome::Exhausted);
            }
        }
    }
    sink.send(Response::Finished)?;
    Ok(ReadOutcome::Satisfied)
}
