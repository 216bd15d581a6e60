//! Decoding of member path names.
//!
//! Archives store names as raw bytes; the encoding is a property of whatever
//! produced the archive, so the caller picks it at open time. When the bytes
//! do not form a valid string in the chosen encoding, the decoded `pathname`
//! is unavailable but the raw bytes remain accessible.

/// Character encoding used to decode member path names.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum PathEncoding {
    /// UTF-8. Decoding fails on invalid sequences (no replacement characters
    /// are ever substituted into a pathname).
    #[default]
    Utf8,
    /// ISO 8859-1. Every byte sequence decodes; bytes map to the first 256
    /// Unicode code points.
    Latin1,
}

impl PathEncoding {
    /// Decode `bytes` into an owned string, or `None` when the bytes are not
    /// valid in this encoding.
    pub(crate) fn decode(self, bytes: &[u8]) -> Option<String> {
        match self {
            PathEncoding::Utf8 => std::str::from_utf8(bytes).ok().map(str::to_owned),
            PathEncoding::Latin1 => Some(bytes.iter().map(|&b| b as char).collect()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn utf8_rejects_invalid() {
        assert_eq!(PathEncoding::Utf8.decode(b"hello.txt").as_deref(), Some("hello.txt"));
        assert_eq!(PathEncoding::Utf8.decode(b"caf\xc3\xa9").as_deref(), Some("café"));
        assert_eq!(PathEncoding::Utf8.decode(b"caf\xe9"), None);
    }

    #[test]
    fn latin1_never_fails() {
        assert_eq!(PathEncoding::Latin1.decode(b"caf\xe9").as_deref(), Some("café"));
        assert_eq!(PathEncoding::Latin1.decode(b"").as_deref(), Some(""));
        // Every byte is a valid Latin-1 character.
        let all: Vec<u8> = (0..=255).collect();
        assert_eq!(PathEncoding::Latin1.decode(&all).unwrap().chars().count(), 256);
    }
}
