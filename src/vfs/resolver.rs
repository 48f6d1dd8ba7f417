use tracing::debug;

use super::node::NodeId;
use super::path::VirtualPath;
use super::repository::{ROOT_NODE, Repository};
use crate::error::StoreResult;

impl Repository {
    /// Resolve in-archive path segments to a node.
    ///
    /// Links in the middle of the path are always followed; a final link
    /// only when `follow` is set. A final link whose target cannot be
    /// resolved yields the link itself.
    pub fn resolve(&mut self, segments: &[String], follow: bool) -> StoreResult<Option<NodeId>> {
        self.walk(ROOT_NODE, segments, follow, 0)
    }

    /// Resolve a link's target from the link's parent directory.
    ///
    /// Returns `None` if the node is not a link or the target is missing.
    pub fn resolve_link(&mut self, link: NodeId) -> StoreResult<Option<NodeId>> {
        if !self.node(link).attrs.is_symlink() {
            return Ok(None);
        }
        let target = self.follow(link, 1)?;
        Ok(target.filter(|&t| t != link))
    }

    fn walk(
        &mut self,
        start: NodeId,
        segments: &[String],
        follow_last: bool,
        depth: usize,
    ) -> StoreResult<Option<NodeId>> {
        let mut current = start;
        for (i, segment) in segments.iter().enumerate() {
            match segment.as_str() {
                "" | "." => continue,
                ".." => {
                    current = self.up(current);
                    continue;
                }
                _ => {}
            }

            if !self.node(current).is_directory() {
                return Ok(None);
            }
            let Some(child) = self.child(current, segment)? else {
                return Ok(None);
            };

            let last = i + 1 == segments.len();
            if self.node(child).attrs.is_symlink() && (!last || follow_last) {
                match self.follow(child, depth + 1)? {
                    Some(target) => current = target,
                    None if last => current = child,
                    None => return Ok(None),
                }
            } else {
                current = child;
            }
        }
        Ok(Some(current))
    }

    /// Target of a link, or `None` when it dangles or the chain is too long.
    fn follow(&mut self, link: NodeId, depth: usize) -> StoreResult<Option<NodeId>> {
        if depth > self.max_symlink_depth {
            debug!(link = %self.complete_path(link), "symlink chain too long");
            return Ok(None);
        }
        let Some(target) = self.node(link).attrs.symlink_target.clone() else {
            return Ok(None);
        };

        let path = VirtualPath::parse(&target);
        debug!(link = link, target = %path, depth, "following symlink");
        let start = if path.is_absolute() {
            self.snapshot_root_of(link)
        } else {
            self.node(link).parent.unwrap_or(ROOT_NODE)
        };

        let resolved = self.walk(start, path.segments(), true, depth)?;
        // A chain ending in a dangling link does not resolve.
        Ok(resolved.filter(|&node| !self.node(node).attrs.is_symlink()))
    }

    /// Parent directory, never climbing out of a snapshot or the archive.
    fn up(&self, id: NodeId) -> NodeId {
        let node = self.node(id);
        if node.as_directory().is_some_and(|d| d.is_snapshot_root()) {
            return id;
        }
        node.parent.unwrap_or(ROOT_NODE)
    }
}
