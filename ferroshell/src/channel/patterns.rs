//! Pattern compilation and match results for `expect`.

use regex::bytes::{Regex, RegexBuilder};

use super::StreamKind;
use super::buffer::PatternBuffer;

/// Compile a pattern string into a case-insensitive regex.
pub fn compile(pattern: &str) -> Result<Regex, regex::Error> {
    RegexBuilder::new(pattern).case_insensitive(true).build()
}

/// Compile literal text into a case-insensitive regex matching it verbatim.
pub fn compile_literal(text: &str) -> Result<Regex, regex::Error> {
    compile(&regex::escape(text))
}

/// Compile several pattern strings, failing on the first invalid one.
pub fn compile_all<S: AsRef<str>>(patterns: &[S]) -> Result<Vec<Regex>, regex::Error> {
    patterns.iter().map(|p| compile(p.as_ref())).collect()
}

/// A successful `expect` match.
///
/// Offsets are absolute positions in the stream's searchable text, so
/// `end` can be fed back as the next search position.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExpectMatch {
    /// Index of the pattern that matched.
    pub index: usize,

    /// Stream the match was found in.
    pub stream: StreamKind,

    /// Absolute start offset.
    pub start: usize,

    /// Absolute end offset.
    pub end: usize,

    /// The matched text.
    pub text: String,

    /// Capture groups 1.., `None` for groups that did not participate.
    pub groups: Vec<Option<String>>,
}

impl ExpectMatch {
    /// Get capture group `n` (1-based; 0 is the whole match).
    pub fn group(&self, n: usize) -> Option<&str> {
        if n == 0 {
            return Some(&self.text);
        }
        self.groups.get(n - 1).and_then(|g| g.as_deref())
    }
}

/// Try every pattern against `buffer` starting at `from`; first pattern in
/// order wins.
pub(crate) fn find_first(
    buffer: &PatternBuffer,
    stream: StreamKind,
    patterns: &[Regex],
    from: usize,
) -> Option<ExpectMatch> {
    let (from, haystack) = buffer.slice_from(from);

    patterns.iter().enumerate().find_map(|(index, pattern)| {
        let caps = pattern.captures(haystack)?;
        let whole = caps.get(0)?;
        let groups = caps
            .iter()
            .skip(1)
            .map(|g| g.map(|m| String::from_utf8_lossy(m.as_bytes()).into_owned()))
            .collect();
        Some(ExpectMatch {
            index,
            stream,
            start: from + whole.start(),
            end: from + whole.end(),
            text: String::from_utf8_lossy(whole.as_bytes()).into_owned(),
            groups,
        })
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_compile_is_case_insensitive() {
        let pattern = compile("password").unwrap();
        assert!(pattern.is_match(b"[sudo] Password for admin:"));
    }

    #[test]
    fn test_compile_literal_escapes() {
        let pattern = compile_literal("mysql> (x)").unwrap();
        assert!(pattern.is_match(b"MYSQL> (x)"));
        assert!(!pattern.is_match(b"mysql> x"));
    }

    #[test]
    fn test_compile_all_rejects_invalid() {
        assert!(compile_all(&["ok", "("]).is_err());
        assert_eq!(compile_all(&["a", "b"]).unwrap().len(), 2);
    }

    #[test]
    fn test_find_first_captures() {
        let mut buffer = PatternBuffer::new();
        buffer.extend(b"noise\n__exitcode3--42--\n");
        let patterns = vec![compile(r"__exitcode3--(\d+)--").unwrap()];

        let m = find_first(&buffer, StreamKind::Stdout, &patterns, 0).unwrap();
        assert_eq!(m.index, 0);
        assert_eq!(m.start, 6);
        assert_eq!(m.group(1), Some("42"));
        assert_eq!(m.group(0), Some("__exitcode3--42--"));
        assert_eq!(m.group(2), None);
    }

    #[test]
    fn test_find_first_respects_position() {
        let mut buffer = PatternBuffer::new();
        buffer.extend(b"$ one\n$ two\n");
        let patterns = vec![compile(r"\$").unwrap()];

        let first = find_first(&buffer, StreamKind::Stdout, &patterns, 0).unwrap();
        let second = find_first(&buffer, StreamKind::Stdout, &patterns, first.end).unwrap();
        assert!(second.start > first.start);
        assert!(find_first(&buffer, StreamKind::Stdout, &patterns, second.end).is_none());
    }

    #[test]
    fn test_pattern_order_wins() {
        let mut buffer = PatternBuffer::new();
        buffer.extend(b"sorry, try again. password:");
        let patterns = compile_all(&["password", "sorry"]).unwrap();

        let m = find_first(&buffer, StreamKind::Stderr, &patterns, 0).unwrap();
        assert_eq!(m.index, 0);
        assert_eq!(m.text, "password");
    }
}
