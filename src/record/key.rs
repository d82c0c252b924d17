//! Record key format and per-node key ranges.
//!
//! Keys are a two-letter prefix followed by a zero-padded numeric suffix,
//! e.g. `tt1000042`. Each node mints suffixes only inside its own range.

use crate::config::SchemaConfig;

/// Prefix + zero-padded suffix key format
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeyFormat {
    prefix: String,
    width: usize,
}

impl KeyFormat {
    pub fn new(prefix: impl Into<String>, width: usize) -> Self {
        Self {
            prefix: prefix.into(),
            width,
        }
    }

    pub fn from_schema(schema: &SchemaConfig) -> Self {
        Self::new(schema.key_prefix.clone(), schema.key_width)
    }

    pub fn prefix(&self) -> &str {
        &self.prefix
    }

    /// Render a suffix as a full key
    pub fn format(&self, suffix: u64) -> String {
        format!("{}{:0width$}", self.prefix, suffix, width = self.width)
    }

    /// Parse a key back to its numeric suffix.
    ///
    /// The prefix comparison is case-insensitive; the suffix must have
    /// exactly `width` digits.
    pub fn parse(&self, key: &str) -> Option<u64> {
        if key.len() != self.prefix.len() + self.width || !key.is_char_boundary(self.prefix.len()) {
            return None;
        }
        let (prefix, digits) = key.split_at(self.prefix.len());
        if !prefix.eq_ignore_ascii_case(&self.prefix) || !digits.bytes().all(|b| b.is_ascii_digit()) {
            return None;
        }
        digits.parse().ok()
    }
}

/// Inclusive range of key suffixes owned by one node
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct KeyRange {
    pub start: u64,
    pub end: u64,
}

impl KeyRange {
    /// Range `[index * size, (index + 1) * size - 1]`
    pub fn for_index(index: u64, size: u64) -> Self {
        let start = index.saturating_mul(size);
        Self {
            start,
            end: start.saturating_add(size.saturating_sub(1)),
        }
    }

    pub fn contains(&self, suffix: u64) -> bool {
        (self.start..=self.end).contains(&suffix)
    }

    /// Next free suffix after the current maximum; `Err` carries the
    /// overflowing suffix when the range is full
    pub fn next_after(&self, current_max: Option<u64>) -> std::result::Result<u64, u64> {
        let next = match current_max {
            Some(max) if max >= self.start => max.saturating_add(1),
            _ => self.start,
        };
        if next > self.end {
            Err(next)
        } else {
            Ok(next)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_format_and_parse() {
        let fmt = KeyFormat::new("tt", 7);
        assert_eq!(fmt.format(42), "tt0000042");
        assert_eq!(fmt.format(1_000_000), "tt1000000");
        assert_eq!(fmt.parse("tt1000000"), Some(1_000_000));
        assert_eq!(fmt.parse("TT0000042"), Some(42));
        assert_eq!(fmt.parse("tt42"), None);
        assert_eq!(fmt.parse("nm0000042"), None);
        assert_eq!(fmt.parse("tt00000-2"), None);
        assert_eq!(fmt.parse("é000000042"), None);
    }

    #[test]
    fn test_range_bounds() {
        let range = KeyRange::for_index(1, 1_000_000);
        assert_eq!(range.start, 1_000_000);
        assert_eq!(range.end, 1_999_999);
        assert!(range.contains(1_500_000));
        assert!(!range.contains(2_000_000));
    }

    #[test]
    fn test_next_after() {
        let range = KeyRange::for_index(2, 10);
        assert_eq!(range.next_after(None), Ok(20));
        assert_eq!(range.next_after(Some(3)), Ok(20));
        assert_eq!(range.next_after(Some(24)), Ok(25));
        assert_eq!(range.next_after(Some(29)), Err(30));
    }
}
