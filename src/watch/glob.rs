//! Glob matching for watch patterns and ignore lists.
//!
//! Semantics: `**` matches any number of path segments, `*` matches any
//! characters within one segment, `?` matches a single character. Paths are
//! matched relative to the watch root with `/` separators.

/// Match a glob pattern against a relative path.
pub fn glob_match(pattern: &str, path: &str) -> bool {
    let pattern_segments: Vec<&str> = pattern.split('/').collect();
    let path_segments: Vec<&str> = path.split('/').collect();
    match_segments(&pattern_segments, &path_segments)
}

/// Match an ignore pattern. A pattern without `/` matches against the file
/// name alone (`*.log` ignores logs anywhere under the root); a pattern with
/// `/` matches the whole relative path.
pub fn ignore_match(pattern: &str, path: &str) -> bool {
    if pattern.contains('/') {
        glob_match(pattern, path)
    } else {
        let name = path.rsplit('/').next().unwrap_or(path);
        segment_match(pattern, name)
    }
}

/// True when any pattern in the list ignores the path.
pub fn is_ignored(patterns: &[String], path: &str) -> bool {
    patterns.iter().any(|p| ignore_match(p, path))
}

fn match_segments(pattern: &[&str], path: &[&str]) -> bool {
    match pattern.split_first() {
        None => path.is_empty(),
        Some((&"**", rest)) => {
            // `**` consumes zero or more whole segments.
            (0..=path.len()).any(|skip| match_segments(rest, &path[skip..]))
        }
        Some((first, rest)) => match path.split_first() {
            Some((segment, remaining)) => {
                segment_match(first, segment) && match_segments(rest, remaining)
            }
            None => false,
        },
    }
}

/// `*`/`?` matching within a single path segment.
fn segment_match(pattern: &str, name: &str) -> bool {
    let pattern: Vec<char> = pattern.chars().collect();
    let name: Vec<char> = name.chars().collect();
    match_chars(&pattern, &name)
}

fn match_chars(pattern: &[char], name: &[char]) -> bool {
    match pattern.split_first() {
        None => name.is_empty(),
        Some(('*', rest)) => (0..=name.len()).any(|skip| match_chars(rest, &name[skip..])),
        Some(('?', rest)) => !name.is_empty() && match_chars(rest, &name[1..]),
        Some((c, rest)) => name
            .split_first()
            .is_some_and(|(n, remaining)| n == c && match_chars(rest, remaining)),
    }
}
