use thiserror::Error;

pub const SEPARATOR: char = ':';

const GLOB_META: [char; 4] = ['*', '?', '[', ']'];

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum KeyError {
    #[error("key has no segments")]
    NoSegments,
    #[error("segment {index} is empty")]
    EmptySegment { index: usize },
    #[error("segment '{segment}' contains the separator ':'")]
    ContainsSeparator { segment: String },
    #[error("segment '{segment}' contains whitespace")]
    ContainsWhitespace { segment: String },
    #[error("segment '{segment}' contains a glob metacharacter")]
    GlobInExactKey { segment: String },
}

fn check_segment(index: usize, segment: &str, exact: bool) -> Result<(), KeyError> {
    if segment.is_empty() {
        return Err(KeyError::EmptySegment { index });
    }
    if segment.contains(SEPARATOR) {
        return Err(KeyError::ContainsSeparator { segment: segment.to_owned() });
    }
    if segment.chars().any(char::is_whitespace) {
        return Err(KeyError::ContainsWhitespace { segment: segment.to_owned() });
    }
    if exact && segment.contains(GLOB_META) {
        return Err(KeyError::GlobInExactKey { segment: segment.to_owned() });
    }
    Ok(())
}

fn join(segments: &[&str], exact: bool) -> Result<String, KeyError> {
    if segments.is_empty() {
        return Err(KeyError::NoSegments);
    }
    let mut out = String::with_capacity(segments.iter().map(|s| s.len() + 1).sum());
    for (index, segment) in segments.iter().enumerate() {
        check_segment(index, segment, exact)?;
        if index > 0 {
            out.push(SEPARATOR);
        }
        out.push_str(segment);
    }
    Ok(out)
}

/// Join segments into a key that names exactly one entry.
pub fn join_exact(segments: &[&str]) -> Result<String, KeyError> {
    join(segments, true)
}

/// Join segments into a scan pattern; glob metacharacters are allowed.
pub fn join_pattern(segments: &[&str]) -> Result<String, KeyError> {
    join(segments, false)
}

fn validate(key: &str, exact: bool) -> Result<(), KeyError> {
    if key.is_empty() {
        return Err(KeyError::NoSegments);
    }
    key.split(SEPARATOR)
        .enumerate()
        .try_for_each(|(index, segment)| check_segment(index, segment, exact))
}

/// Validate an already-joined exact key.
pub fn validate_exact(key: &str) -> Result<(), KeyError> {
    validate(key, true)
}

/// Validate an already-joined scan pattern.
pub fn validate_pattern(pattern: &str) -> Result<(), KeyError> {
    validate(pattern, false)
}
