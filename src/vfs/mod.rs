pub mod content;
pub mod metadata;
pub mod node;
pub mod path;
pub mod repository;
pub mod resolver;

pub use metadata::{Metadata, MetadataReader};
pub use node::{Directory, DirectorySource, File, FileContent, Node, NodeAttrs, NodeId, NodeKind};
pub use path::VirtualPath;
pub use repository::{LATEST, ROOT_NODE, Repository, git_dir_for};
