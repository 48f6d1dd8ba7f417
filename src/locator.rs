//! Maps request URLs onto an archive root and an in-archive path.

use std::path::Path;

use tracing::{debug, info, warn};

use crate::config::SlaveConfig;
use crate::vfs::{Repository, VirtualPath, git_dir_for};

/// Reduce a request URL to `/seg/seg/.../`.
///
/// The scheme, query and fragment are dropped, a non-empty authority becomes
/// the first path segment, percent escapes are decoded and empty segments
/// collapse.
pub fn normalize_url(url: &str) -> String {
    let rest = strip_scheme(url);
    let rest = rest.find(['?', '#']).map_or(rest, |end| &rest[..end]);
    let path = match rest.strip_prefix("//") {
        Some(after) => match after.find('/') {
            Some(slash) => format!("/{}{}", &after[..slash], &after[slash..]),
            None => format!("/{after}"),
        },
        None => rest.to_string(),
    };
    let decoded = percent_decode(&path);

    let segments: Vec<&str> = decoded.split('/').filter(|s| !s.is_empty()).collect();
    if segments.is_empty() {
        "/".to_string()
    } else {
        format!("/{}/", segments.join("/"))
    }
}

fn strip_scheme(url: &str) -> &str {
    let Some(colon) = url.find(':') else {
        return url;
    };
    let scheme = &url[..colon];
    let is_scheme = scheme.chars().next().is_some_and(|c| c.is_ascii_alphabetic())
        && scheme
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '+' | '-' | '.'));
    if is_scheme { &url[colon + 1..] } else { url }
}

fn percent_decode(text: &str) -> String {
    let bytes = text.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] == b'%' && i + 2 < bytes.len() {
            if let Ok(decoded) = hex::decode(&bytes[i + 1..i + 3]) {
                out.extend_from_slice(&decoded);
                i += 3;
                continue;
            }
        }
        out.push(bytes[i]);
        i += 1;
    }
    String::from_utf8_lossy(&out).into_owned()
}

fn split_segments(path: &str) -> Vec<String> {
    VirtualPath::parse(path).into_segments()
}

/// Finds the archive for a path and keeps the most recent one open.
pub struct ArchiveLocator {
    config: SlaveConfig,
    repository: Option<Repository>,
    /// Bumped whenever the cached repository is dropped or replaced.
    generation: u64,
}

impl ArchiveLocator {
    pub fn new(config: SlaveConfig) -> Self {
        ArchiveLocator {
            config,
            repository: None,
            generation: 0,
        }
    }

    pub fn repository(&self) -> Option<&Repository> {
        self.repository.as_ref()
    }

    pub fn repository_mut(&mut self) -> Option<&mut Repository> {
        self.repository.as_mut()
    }

    /// Identifies the repository currently in the slot; node ids are only
    /// meaningful within one generation.
    pub fn generation(&self) -> u64 {
        self.generation
    }

    /// Find the archive containing `url` and return the path inside it.
    ///
    /// The shallowest ancestor carrying the archive markers wins.
    pub fn locate(&mut self, url: &str) -> Option<Vec<String>> {
        let path = normalize_url(url);

        if let Some(repo) = &self.repository {
            if repo.is_valid() {
                if let Some(inner) = path.strip_prefix(repo.root()) {
                    return Some(split_segments(inner));
                }
            }
        }

        if let Some(old) = self.repository.take() {
            debug!(root = old.root(), "dropping cached repository");
            self.generation += 1;
        }

        let mut candidate = String::from("/");
        let mut segments = split_segments(&path).into_iter();
        while let Some(segment) = segments.next() {
            candidate.push_str(&segment);
            candidate.push('/');
            if git_dir_for(Path::new(&candidate)).is_none() {
                continue;
            }

            return match Repository::open(&candidate, &self.config) {
                Ok(repo) => {
                    info!(root = %candidate, "found archive");
                    self.repository = Some(repo);
                    self.generation += 1;
                    Some(segments.collect())
                }
                Err(e) => {
                    warn!("cannot open archive at {}: {}", candidate, e);
                    None
                }
            };
        }

        debug!(path = %path, "no archive along path");
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn make_archive(dir: &Path, dotted: bool) {
        let git = if dotted { dir.join(".git") } else { dir.to_path_buf() };
        std::fs::create_dir_all(git.join("objects")).unwrap();
        std::fs::create_dir_all(git.join("refs/heads")).unwrap();
    }

    #[test]
    fn test_normalize_url() {
        assert_eq!(normalize_url("bup:///backups/home"), "/backups/home/");
        assert_eq!(normalize_url("bup://backups/home/x"), "/backups/home/x/");
        assert_eq!(normalize_url("/a//b///"), "/a/b/");
        assert_eq!(normalize_url("bup:/a%20b/c%2Fd"), "/a b/c/d/");
        assert_eq!(normalize_url(""), "/");
        assert_eq!(normalize_url("bup:"), "/");
        assert_eq!(normalize_url("/100%"), "/100%/");
        assert_eq!(normalize_url("bup:///backups/home?x=1#top"), "/backups/home/");
        assert_eq!(normalize_url("/a/b%3Fc#frag"), "/a/b?c/");
    }

    #[test]
    fn test_locate_strips_root() {
        let tmp = tempfile::tempdir().unwrap();
        let root = tmp.path().join("home");
        make_archive(&root, true);

        let mut locator = ArchiveLocator::new(SlaveConfig::default());
        let url = format!("bup://{}/main/snap/docs/readme.txt", root.display());
        let segments = locator.locate(&url).unwrap();
        assert_eq!(segments, ["main", "snap", "docs", "readme.txt"]);
        assert_eq!(
            locator.repository().unwrap().root(),
            format!("{}/", root.display())
        );

        // Same archive again: no reopen.
        let generation = locator.generation();
        let segments = locator.locate(&format!("bup:{}", root.display())).unwrap();
        assert!(segments.is_empty());
        assert_eq!(locator.generation(), generation);
    }

    #[test]
    fn test_shallowest_archive_wins() {
        let tmp = tempfile::tempdir().unwrap();
        let outer = tmp.path().join("outer");
        let inner = outer.join("nested/inner");
        make_archive(&outer, false);
        make_archive(&inner, true);

        let mut locator = ArchiveLocator::new(SlaveConfig::default());
        let segments = locator
            .locate(&format!("{}/file", inner.display()))
            .unwrap();
        assert_eq!(segments, ["nested", "inner", "file"]);
        assert_eq!(
            locator.repository().unwrap().root(),
            format!("{}/", outer.display())
        );
    }

    #[test]
    fn test_switching_archives_bumps_generation() {
        let tmp = tempfile::tempdir().unwrap();
        let first = tmp.path().join("first");
        let second = tmp.path().join("second");
        make_archive(&first, false);
        make_archive(&second, false);

        let mut locator = ArchiveLocator::new(SlaveConfig::default());
        locator.locate(&first.display().to_string()).unwrap();
        let generation = locator.generation();

        locator.locate(&second.display().to_string()).unwrap();
        assert!(locator.generation() > generation);
        assert!(locator.repository().unwrap().root().ends_with("second/"));
    }

    #[test]
    fn test_no_archive() {
        let tmp = tempfile::tempdir().unwrap();
        let plain = tmp.path().join("plain/dir");
        std::fs::create_dir_all(&plain).unwrap();

        let mut locator = ArchiveLocator::new(SlaveConfig::default());
        assert!(locator.locate(&plain.display().to_string()).is_none());
        assert!(locator.repository().is_none());
    }

    #[test]
    fn test_vanished_archive_is_dropped() {
        let tmp = tempfile::tempdir().unwrap();
        let root = tmp.path().join("gone");
        make_archive(&root, false);

        let mut locator = ArchiveLocator::new(SlaveConfig::default());
        assert!(locator.locate(&root.display().to_string()).is_some());
        std::fs::remove_dir_all(&root).unwrap();
        assert!(locator.locate(&root.display().to_string()).is_none());
        assert!(locator.repository().is_none());
    }
}
