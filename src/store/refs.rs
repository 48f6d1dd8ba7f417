use std::collections::BTreeMap;
use std::path::Path;

use tracing::debug;

use super::ObjectId;
use crate::error::StoreResult;

const HEADS_PREFIX: &str = "refs/heads/";

/// Read every branch head: loose files under `refs/heads/` win over
/// entries in `packed-refs`. Keys are the names after `refs/heads/`.
pub fn read_branches(git_dir: &Path) -> StoreResult<BTreeMap<String, ObjectId>> {
    let mut branches = BTreeMap::new();

    match std::fs::read_to_string(git_dir.join("packed-refs")) {
        Ok(text) => {
            for (name, id) in parse_packed_refs(&text) {
                let Some(branch) = name.strip_prefix(HEADS_PREFIX) else {
                    continue;
                };
                if branch.contains('/') {
                    debug!(branch, "skipping nested packed ref");
                    continue;
                }
                branches.insert(branch.to_string(), id);
            }
        }
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
        Err(e) => return Err(e.into()),
    }

    let heads_dir = git_dir.join(HEADS_PREFIX);
    let entries = match std::fs::read_dir(&heads_dir) {
        Ok(entries) => entries,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(branches),
        Err(e) => return Err(e.into()),
    };

    for entry in entries {
        let entry = entry?;
        if !entry.file_type()?.is_file() {
            // Hierarchical branch names do not map onto a single path segment.
            debug!(path = %entry.path().display(), "skipping nested ref directory");
            continue;
        }
        let name = entry.file_name().to_string_lossy().into_owned();
        let text = std::fs::read_to_string(entry.path())?;
        match ObjectId::from_hex(&text) {
            Ok(id) => {
                branches.insert(name, id);
            }
            Err(_) => debug!(branch = %name, "ignoring symbolic or malformed ref"),
        }
    }

    Ok(branches)
}

/// Read a single branch head.
pub fn read_branch(git_dir: &Path, branch: &str) -> StoreResult<Option<ObjectId>> {
    Ok(read_branches(git_dir)?.remove(branch))
}

/// Parse `<hex> <refname>` lines, skipping comments and peeled-tag lines.
fn parse_packed_refs(text: &str) -> Vec<(String, ObjectId)> {
    text.lines()
        .filter(|line| !line.starts_with('#') && !line.starts_with('^'))
        .filter_map(|line| {
            let (hex, name) = line.split_once(' ')?;
            let id = ObjectId::from_hex(hex).ok()?;
            Some((name.trim().to_string(), id))
        })
        .collect()
}
