use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::cache::{IdentityLookup, NameCache};
use crate::error::StoreResult;
use crate::vfs::{NodeId, Repository};

/// One directory-entry record as sent for `stat` and `listDir`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct EntryRecord {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub link_dest: Option<String>,
    /// `mode & 0o170000`
    pub file_type: u32,
    /// `mode & 0o7777`
    pub access: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub size: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mime_type: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub atime: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mtime: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub group: Option<String>,
}

/// Describe `node` at the given detail level.
///
/// Level 0 carries only name, link and mode bits. Level 1 adds size, MIME
/// type, times and owner. Level 2 and above describe a symlink by its
/// target's attributes while keeping the link's name and destination.
pub fn project<L: IdentityLookup>(
    repo: &mut Repository,
    names: &mut NameCache<L>,
    node: NodeId,
    details: i32,
) -> StoreResult<EntryRecord> {
    let own = repo.node(node).attrs.clone();
    let mut record = EntryRecord {
        name: own.name.clone(),
        link_dest: own.symlink_target.clone().filter(|t| !t.is_empty()),
        file_type: own.file_type(),
        access: own.permissions(),
        ..Default::default()
    };
    if details <= 0 {
        return Ok(record);
    }

    let mut source = node;
    if details > 1 && own.is_symlink() {
        match repo.resolve_link(node) {
            Ok(Some(target)) => source = target,
            Ok(None) => {}
            Err(e) => debug!(link = %own.name, "cannot resolve link: {}", e),
        }
    }

    let attrs = repo.node(source).attrs.clone();
    record.file_type = attrs.file_type();
    record.access = attrs.permissions();
    record.size = Some(repo.file_size(source)?);
    record.mime_type = Some(attrs.mime_type);
    record.atime = Some(attrs.atime);
    record.mtime = Some(attrs.mtime);
    record.user = Some(names.user_name(attrs.uid));
    record.group = Some(names.group_name(attrs.gid));
    Ok(record)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_optional_fields_are_omitted() {
        let record = EntryRecord {
            name: "a".into(),
            file_type: 0o100000,
            access: 0o644,
            ..Default::default()
        };
        let json = serde_json::to_string(&record).unwrap();
        assert_eq!(json, r#"{"name":"a","file_type":32768,"access":420}"#);
        assert_eq!(serde_json::from_str::<EntryRecord>(&json).unwrap(), record);
    }
}
