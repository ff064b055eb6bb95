//! File content and derived metadata.

use serde::{Deserialize, Serialize};
use std::path::Path;

/// Metadata derived from a file's bytes and filesystem entry.
///
/// Derived, never authoritative: computed from whatever bytes were present at
/// read or write time, and never cached across calls.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileMetadata {
    pub size_bytes: u64,
    /// Line/word/char counts are present when the content was actually read,
    /// absent for a bare `stat`.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub line_count: Option<usize>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub word_count: Option<usize>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub char_count: Option<usize>,
    /// Last-modified timestamp, milliseconds since the Unix epoch.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub modified_ms: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub extension: Option<String>,
}

impl FileMetadata {
    /// Derive full metadata from text content.
    pub fn from_text(path: &Path, text: &str, modified_ms: Option<u64>) -> Self {
        Self {
            size_bytes: text.len() as u64,
            line_count: Some(text.lines().count()),
            word_count: Some(text.split_whitespace().count()),
            char_count: Some(text.chars().count()),
            modified_ms,
            extension: extension_of(path),
        }
    }

    /// Metadata from a filesystem entry alone, without reading bytes.
    pub fn from_entry(path: &Path, size_bytes: u64, modified_ms: Option<u64>) -> Self {
        Self {
            size_bytes,
            line_count: None,
            word_count: None,
            char_count: None,
            modified_ms,
            extension: extension_of(path),
        }
    }
}

fn extension_of(path: &Path) -> Option<String> {
    path.extension().and_then(|e| e.to_str()).map(str::to_owned)
}

/// A UTF-8 document plus its derived metadata.
///
/// Equality of content is always a question about `text`; metadata does not
/// participate (two reads of the same bytes at different times differ only in
/// `modified_ms`).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FileContent {
    pub text: String,
    pub metadata: FileMetadata,
}

impl FileContent {
    pub fn from_text(path: &Path, text: String, modified_ms: Option<u64>) -> Self {
        let metadata = FileMetadata::from_text(path, &text, modified_ms);
        Self { text, metadata }
    }

    pub fn same_text(&self, other: &str) -> bool {
        self.text == other
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn derives_counts() {
        let m = FileMetadata::from_text(Path::new("/tmp/a.md"), "hello world\nsecond line\n", None);
        assert_eq!(m.size_bytes, 24);
        assert_eq!(m.line_count, Some(2));
        assert_eq!(m.word_count, Some(4));
        assert_eq!(m.char_count, Some(24));
        assert_eq!(m.extension.as_deref(), Some("md"));
    }

    #[test]
    fn empty_content() {
        let m = FileMetadata::from_text(Path::new("/tmp/a"), "", Some(5));
        assert_eq!(m.size_bytes, 0);
        assert_eq!(m.line_count, Some(0));
        assert_eq!(m.word_count, Some(0));
        assert_eq!(m.modified_ms, Some(5));
        assert_eq!(m.extension, None);
    }

    #[test]
    fn multibyte_chars_counted_once() {
        let m = FileMetadata::from_text(Path::new("/tmp/a.txt"), "héllo", None);
        assert_eq!(m.size_bytes, 6);
        assert_eq!(m.char_count, Some(5));
    }

    #[test]
    fn stat_metadata_has_no_counts() {
        let m = FileMetadata::from_entry(Path::new("/tmp/a.txt"), 123, Some(42));
        assert_eq!(m.size_bytes, 123);
        assert_eq!(m.line_count, None);
        assert_eq!(m.word_count, None);
        assert_eq!(m.char_count, None);
    }
}
