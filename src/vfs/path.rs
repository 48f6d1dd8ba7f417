/// A slash-separated path inside an archive
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct VirtualPath {
    /// Path segments (e.g., ["main", "2024-01-01 10:00", "etc", "hosts"])
    segments: Vec<String>,
    /// Whether this is an absolute path (starts with /)
    is_absolute: bool,
}

impl VirtualPath {
    /// Parse a path string. Empty segments and `.` are dropped; `..` is kept
    /// so that symlink targets can be applied relative to a directory.
    pub fn parse(path: &str) -> Self {
        let is_absolute = path.starts_with('/');
        let segments: Vec<String> = path
            .split('/')
            .filter(|s| !s.is_empty() && *s != ".")
            .map(String::from)
            .collect();

        VirtualPath {
            segments,
            is_absolute,
        }
    }

    /// Get the path segments
    pub fn segments(&self) -> &[String] {
        &self.segments
    }

    /// Consume the path, returning its segments
    pub fn into_segments(self) -> Vec<String> {
        self.segments
    }

    /// Check if this is an absolute path
    pub fn is_absolute(&self) -> bool {
        self.is_absolute
    }
}

impl std::fmt::Display for VirtualPath {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if self.is_absolute {
            write!(f, "/")?;
        }
        write!(f, "{}", self.segments.join("/"))
    }
}
