//! Canonical path handling.
//!
//! Every component keys state by [`CanonicalPath`] so that the same logical
//! file always compares equal, regardless of how the caller spelled the path.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::io;
use std::path::{Path, PathBuf};

/// A canonical absolute path. Equality is byte-exact on the canonical form.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CanonicalPath(PathBuf);

impl CanonicalPath {
    /// Canonicalize a path.
    ///
    /// If the file does not exist yet (a save may create it), the parent
    /// directory is canonicalized instead and the file name re-joined. This
    /// keeps keys stable across create/delete cycles.
    pub fn new(path: impl AsRef<Path>) -> io::Result<Self> {
        let path = path.as_ref();
        match path.canonicalize() {
            Ok(p) => Ok(Self(p)),
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                let parent = match path.parent() {
                    Some(p) if p.as_os_str().is_empty() => Path::new("."),
                    Some(p) => p,
                    None => return Err(e),
                };
                let file_name = path
                    .file_name()
                    .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidInput, "path has no file name"))?;
                Ok(Self(parent.canonicalize()?.join(file_name)))
            }
            Err(e) => Err(e),
        }
    }

    /// Wrap a path that is already canonical (e.g. derived from another
    /// [`CanonicalPath`] by joining a file name).
    pub fn assume_canonical(path: PathBuf) -> Self {
        Self(path)
    }

    pub fn as_path(&self) -> &Path {
        &self.0
    }

    pub fn to_path_buf(&self) -> PathBuf {
        self.0.clone()
    }

    /// File extension without the leading dot, if any.
    pub fn extension(&self) -> Option<&str> {
        self.0.extension().and_then(|e| e.to_str())
    }

    pub fn file_name(&self) -> Option<&str> {
        self.0.file_name().and_then(|n| n.to_str())
    }

    /// The path as a UTF-8 string for wire payloads (lossy for exotic names).
    pub fn to_wire(&self) -> String {
        self.0.to_string_lossy().into_owned()
    }
}

impl fmt::Display for CanonicalPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0.display())
    }
}

impl AsRef<Path> for CanonicalPath {
    fn as_ref(&self) -> &Path {
        &self.0
    }
}

impl From<CanonicalPath> for PathBuf {
    fn from(p: CanonicalPath) -> Self {
        p.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn same_file_same_key() {
        let dir = std::env::temp_dir();
        let file = dir.join("tether-path-test.txt");
        std::fs::write(&file, "x").unwrap();

        let a = CanonicalPath::new(&file).unwrap();
        let relative_spelling = dir.join(".").join("tether-path-test.txt");
        let b = CanonicalPath::new(&relative_spelling).unwrap();
        assert_eq!(a, b);

        std::fs::remove_file(&file).unwrap();
    }

    #[test]
    fn missing_file_uses_parent_canonical_form() {
        let dir = std::env::temp_dir();
        let file = dir.join("tether-does-not-exist-yet.txt");
        let p = CanonicalPath::new(&file).unwrap();
        assert!(p.as_path().is_absolute());
        assert_eq!(p.file_name(), Some("tether-does-not-exist-yet.txt"));
    }

    #[test]
    fn extension_without_dot() {
        let dir = std::env::temp_dir();
        let p = CanonicalPath::new(dir.join("notes.md")).unwrap();
        assert_eq!(p.extension(), Some("md"));
    }
}
