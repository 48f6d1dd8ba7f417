//! Read-only view of bup backup archives for a file-transfer protocol.
//!
//! A request URL is mapped onto the archive that contains it, resolved to
//! a node in the archive's logical tree (branches, snapshots, files), and
//! answered with streamed content or directory-entry records.

pub mod cache;
pub mod config;
pub mod error;
pub mod locator;
pub mod protocol;
pub mod store;
pub mod vfs;

pub use config::SlaveConfig;
pub use error::{StoreError, StoreResult};
pub use locator::ArchiveLocator;
pub use protocol::{Request, Response, Slave};
