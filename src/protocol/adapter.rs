//! Request dispatch and the open-file state machine.

use std::collections::BTreeMap;
use std::io;

use thiserror::Error;
use tracing::{debug, info, warn};

use super::transfer::{self, ReadOutcome};
use super::{ErrorKind, META_DETAILS, META_RESUME, OpenMode, Request, Response, ResponseSink, entry};
use crate::cache::{IdentityLookup, NameCache, SystemIdentities};
use crate::config::{DEFAULT_DETAILS, SlaveConfig};
use crate::locator::ArchiveLocator;
use crate::vfs::NodeId;

/// A failed request. All variants but `Sink` are reported to the client.
#[derive(Debug, Error)]
pub enum SlaveError {
    #[error("no archive found for {0}")]
    RepositoryNotFound(String),

    #[error("{0} does not exist")]
    DoesNotExist(String),

    #[error("{0} is a directory")]
    IsDirectory(String),

    #[error("{0} is a file")]
    IsFile(String),

    #[error("{0} cannot be opened for writing")]
    CannotOpenForWriting(String),

    #[error("{0} cannot be opened for reading")]
    CannotOpenForReading(String),

    #[error("could not read {0}")]
    CouldNotRead(String),

    #[error("could not seek {0}")]
    CouldNotSeek(String),

    #[error("response channel failed: {0}")]
    Sink(#[from] io::Error),
}

impl SlaveError {
    /// Wire form of the error, or `None` when the client cannot be told.
    pub fn to_response(&self) -> Option<Response> {
        let (kind, detail) = match self {
            SlaveError::RepositoryNotFound(p) => (ErrorKind::RepositoryNotFound, p),
            SlaveError::DoesNotExist(p) => (ErrorKind::DoesNotExist, p),
            SlaveError::IsDirectory(p) => (ErrorKind::IsDirectory, p),
            SlaveError::IsFile(p) => (ErrorKind::IsFile, p),
            SlaveError::CannotOpenForWriting(p) => (ErrorKind::CannotOpenForWriting, p),
            SlaveError::CannotOpenForReading(p) => (ErrorKind::CannotOpenForReading, p),
            SlaveError::CouldNotRead(p) => (ErrorKind::CouldNotRead, p),
            SlaveError::CouldNotSeek(p) => (ErrorKind::CouldNotSeek, p),
            SlaveError::Sink(_) => return None,
        };
        Some(Response::error(kind, detail.clone()))
    }
}

/// The file opened by `open`, tied to the repository it came from.
#[derive(Debug, Clone)]
struct OpenHandle {
    node: NodeId,
    path: String,
    generation: u64,
}

/// Parse the `details` request value; absent means the default level and
/// anything unparsable means the minimal level.
pub fn detail_level(meta: &BTreeMap<String, String>) -> i32 {
    match meta.get(META_DETAILS) {
        None => DEFAULT_DETAILS,
        Some(raw) => raw.trim().parse().unwrap_or(0),
    }
}

/// Serves requests against whichever archive the last URL pointed into.
pub struct Slave<L: IdentityLookup = SystemIdentities> {
    config: SlaveConfig,
    locator: ArchiveLocator,
    names: NameCache<L>,
    handle: Option<OpenHandle>,
}

impl Slave<SystemIdentities> {
    pub fn new(config: SlaveConfig) -> Self {
        Slave::with_names(config, NameCache::new())
    }
}

impl<L: IdentityLookup> Slave<L> {
    pub fn with_names(config: SlaveConfig, names: NameCache<L>) -> Self {
        Slave {
            locator: ArchiveLocator::new(config.clone()),
            config,
            names,
            handle: None,
        }
    }

    pub fn locator(&self) -> &ArchiveLocator {
        &self.locator
    }

    /// Whether a file is currently open.
    pub fn has_open_file(&self) -> bool {
        self.handle.is_some()
    }

    /// Handle one request, ending it with a terminal response. Only a
    /// failing sink is returned as an error.
    pub fn handle(&mut self, request: Request, sink: &mut impl ResponseSink) -> io::Result<()> {
        let result = match request {
            Request::Get { url, meta } => self.get(&url, &meta, sink),
            Request::ListDir { url, meta } => self.list_dir(&url, &meta, sink),
            Request::Open { url, mode } => self.open(&url, mode, sink),
            Request::Read { size } => self.read(size, sink),
            Request::Seek { offset } => self.seek(offset, sink),
            Request::Stat { url, meta } => self.stat(&url, &meta, sink),
            Request::Mimetype { url } => self.mimetype(&url, sink),
            Request::Close => self.close(sink),
        };

        match result {
            Ok(()) => Ok(()),
            Err(SlaveError::Sink(e)) => Err(e),
            Err(e) => {
                debug!("request failed: {}", e);
                match e.to_response() {
                    Some(response) => sink.send(response),
                    None => Ok(()),
                }
            }
        }
    }

    /// Find the archive for `url`, dropping the open file if the archive
    /// changed.
    fn locate(&mut self, url: &str) -> Result<Vec<String>, SlaveError> {
        let segments = self.locator.locate(url);
        if let Some(handle) = &self.handle {
            if handle.generation != self.locator.generation() {
                debug!(path = %handle.path, "archive switched, closing open file");
                self.handle = None;
            }
        }
        segments.ok_or_else(|| SlaveError::RepositoryNotFound(url.to_string()))
    }

    fn get(
        &mut self,
        url: &str,
        meta: &BTreeMap<String, String>,
        sink: &mut impl ResponseSink,
    ) -> Result<(), SlaveError> {
        let segments = self.locate(url)?;
        let path = segments.join("/");
        let repo = self
            .locator
            .repository_mut()
            .ok_or_else(|| SlaveError::RepositoryNotFound(url.to_string()))?;

        let node = repo
            .resolve(&segments, true)
            .map_err(|e| {
                warn!(path = %path, "resolution failed: {}", e);
                SlaveError::CouldNotRead(path.clone())
            })?
            .ok_or_else(|| SlaveError::DoesNotExist(path.clone()))?;
        if repo.node(node).is_directory() {
            return Err(SlaveError::IsDirectory(path));
        }

        let resume = meta.get(META_RESUME).map(String::as_str);
        transfer::send_file(repo, node, &path, resume, self.config.read_chunk_size, sink)
    }

    fn list_dir(
        &mut self,
        url: &str,
        meta: &BTreeMap<String, String>,
        sink: &mut impl ResponseSink,
    ) -> Result<(), SlaveError> {
        let segments = self.locate(url)?;
        let path = segments.join("/");
        let repo = self
            .locator
            .repository_mut()
            .ok_or_else(|| SlaveError::RepositoryNotFound(url.to_string()))?;
        let fault = |e: crate::error::StoreError| {
            warn!(path = %path, "listing failed: {}", e);
            SlaveError::CouldNotRead(path.clone())
        };

        let node = repo
            .resolve(&segments, true)
            .map_err(fault)?
            .ok_or_else(|| SlaveError::DoesNotExist(path.clone()))?;
        if !repo.node(node).is_directory() {
            return Err(SlaveError::IsFile(path.clone()));
        }

        repo.reload(node).map_err(fault)?;
        let details = detail_level(meta);
        for child in repo.children(node).map_err(fault)? {
            let record = entry::project(repo, &mut self.names, child, details).map_err(fault)?;
            sink.send(Response::ListEntry(record))?;
        }
        sink.send(Response::Finished)?;
        Ok(())
    }

    fn open(&mut self, url: &str, mode: OpenMode, sink: &mut impl ResponseSink) -> Result<(), SlaveError> {
        if mode.writes() {
            return Err(SlaveError::CannotOpenForWriting(url.to_string()));
        }
        self.handle = None;

        let segments = self.locate(url)?;
        let path = segments.join("/");
        let generation = self.locator.generation();
        let repo = self
            .locator
            .repository_mut()
            .ok_or_else(|| SlaveError::RepositoryNotFound(url.to_string()))?;
        let cannot_open = |e: crate::error::StoreError| {
            warn!(path = %path, "cannot open: {}", e);
            SlaveError::CannotOpenForReading(url.to_string())
        };

        let node = repo
            .resolve(&segments, true)
            .map_err(cannot_open)?
            .ok_or_else(|| SlaveError::DoesNotExist(path.clone()))?;
        if repo.node(node).is_directory() {
            return Err(SlaveError::IsDirectory(path.clone()));
        }

        repo.seek(node, 0).map_err(cannot_open)?;
        let size = repo.file_size(node).map_err(cannot_open)?;
        let mime = repo.node(node).attrs.mime_type.clone();
        info!(file = %repo.complete_path(node), size, "opened file");

        self.handle = Some(OpenHandle {
            node,
            path,
            generation,
        });
        sink.send(Response::MimeType(mime))?;
        sink.send(Response::TotalSize(size))?;
        sink.send(Response::Position(0))?;
        sink.send(Response::Opened)?;
        Ok(())
    }

    fn read(&mut self, size: u64, sink: &mut impl ResponseSink) -> Result<(), SlaveError> {
        let Some(handle) = self.handle.clone() else {
            return Err(SlaveError::CouldNotRead(String::new()));
        };
        let Some(repo) = self.locator.repository_mut() else {
            self.handle = None;
            return Err(SlaveError::CouldNotRead(String::new()));
        };

        match transfer::send_range(repo, handle.node, &handle.path, size, self.config.read_chunk_size, sink) {
            Ok(ReadOutcome::Satisfied) => Ok(()),
            Ok(ReadOutcome::Exhausted) => {
                debug!(path = %handle.path, "file exhausted");
                self.handle = None;
                Ok(())
            }
            Err(e) => {
                self.handle = None;
                Err(e)
            }
        }
    }

    fn seek(&mut self, offset: u64, sink: &mut impl ResponseSink) -> Result<(), SlaveError> {
        let Some(handle) = &self.handle else {
            return Err(SlaveError::CouldNotSeek(String::new()));
        };
        let repo = self
            .locator
            .repository_mut()
            .ok_or_else(|| SlaveError::CouldNotSeek(String::new()))?;

        repo.seek(handle.node, offset).map_err(|e| {
            warn!(path = %handle.path, offset, "seek failed: {}", e);
            SlaveError::CouldNotSeek(handle.path.clone())
        })?;
        sink.send(Response::Position(offset))?;
        Ok(())
    }

    fn stat(
        &mut self,
        url: &str,
        meta: &BTreeMap<String, String>,
        sink: &mut impl ResponseSink,
    ) -> Result<(), SlaveError> {
        let segments = self.locate(url)?;
        let path = segments.join("/");
        let repo = self
            .locator
            .repository_mut()
            .ok_or_else(|| SlaveError::RepositoryNotFound(url.to_string()))?;
        let fault = |e: crate::error::StoreError| {
            warn!(path = %path, "stat failed: {}", e);
            SlaveError::CouldNotRead(path.clone())
        };

        let node = repo
            .resolve(&segments, false)
            .map_err(fault)?
            .ok_or_else(|| SlaveError::DoesNotExist(path.clone()))?;
        let record = entry::project(repo, &mut self.names, node, detail_level(meta)).map_err(fault)?;
        sink.send(Response::StatEntry(record))?;
        sink.send(Response::Finished)?;
        Ok(())
    }

    fn mimetype(&mut self, url: &str, sink: &mut impl ResponseSink) -> Result<(), SlaveError> {
        let segments = self.locate(url)?;
        let path = segments.join("/");
        let repo = self
            .locator
            .repository_mut()
            .ok_or_else(|| SlaveError::RepositoryNotFound(url.to_string()))?;

        let node = repo
            .resolve(&segments, false)
            .map_err(|e| {
                warn!(path = %path, "resolution failed: {}", e);
                SlaveError::CouldNotRead(path.clone())
            })?
            .ok_or_else(|| SlaveError::DoesNotExist(path.clone()))?;
        sink.send(Response::MimeType(repo.node(node).attrs.mime_type.clone()))?;
        sink.send(Response::Finished)?;
        Ok(())
    }

    fn close(&mut self, sink: &mut impl ResponseSink) -> Result<(), SlaveError> {
        if let Some(handle) = self.handle.take() {
            debug!(path = %handle.path, "closed file");
        }
        sink.send(Response::Finished)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn meta(pairs: &[(&str, &str)]) -> BTreeMap<String, String> {
        pairs.iter().map(|(k, v)| (k.to_string(), v.to_string())).collect()
    }

    #[test]
    fn test_detail_level() {
        assert_eq!(detail_level(&meta(&[])), 2);
        assert_eq!(detail_level(&meta(&[("details", "1")])), 1);
        assert_eq!(detail_level(&meta(&[("details", "junk")])), 0);
    }

    #[test]
    fn test_handle_state_errors() {
        let mut slave = Slave::new(SlaveConfig::default());
        let mut out = Vec::new();
        slave.handle(Request::Read { size: 10 }, &mut out).unwrap();
        slave.handle(Request::Seek { offset: 0 }, &mut out).unwrap();
        slave.handle(Request::Close, &mut out).unwrap();
        assert_eq!(
            out,
            vec![
                Response::error(ErrorKind::CouldNotRead, ""),
                Response::error(ErrorKind::CouldNotSeek, ""),
                Response::Finished,
            ]
        );
    }

    #[test]
    fn test_write_rejected_before_lookup() {
        let mut slave = Slave::new(SlaveConfig::default());
        let mut out = Vec::new();
        let request = Request::Open {
            url: "bup:/nowhere/at/all".into(),
            mode: OpenMode::Write,
        };
        slave.handle(request, &mut out).unwrap();
        assert_eq!(
            out,
            vec![Response::error(ErrorKind::CannotOpenForWriting, "bup:/nowhere/at/all")]
        );
        assert!(slave.locator().repository().is_none());
    }
}
