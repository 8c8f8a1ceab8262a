use chrono::{DateTime, Utc};
use mailparse::{MailParseError, ParsedMail};
use rfc3501::Flag;
use std::collections::BTreeSet;
use std::sync::Arc;

/// A message as held by a folder. The raw bytes are canonicalized to
/// CRLF line endings exactly once, at append time, and are the source
/// of truth; the MIME view is derived on demand.
#[derive(Debug, Clone)]
pub struct StoredMessage {
    pub uid: u32,
    pub flags: BTreeSet<Flag>,
    pub internal_date: DateTime<Utc>,
    raw: Arc<[u8]>,
}

impl StoredMessage {
    pub fn new(
        uid: u32,
        raw: Arc<[u8]>,
        flags: BTreeSet<Flag>,
        internal_date: DateTime<Utc>,
    ) -> Self {
        Self {
            uid,
            flags,
            internal_date,
            raw,
        }
    }

    pub fn raw(&self) -> &[u8] {
        &self.raw
    }

    pub fn raw_shared(&self) -> Arc<[u8]> {
        self.raw.clone()
    }

    pub fn size(&self) -> usize {
        self.raw.len()
    }

    pub fn parsed(&self) -> Result<ParsedMail, MailParseError> {
        mailparse::parse_mail(&self.raw)
    }

    pub fn is_set(&self, flag: &Flag) -> bool {
        self.flags.contains(flag)
    }

    /// Keyword comparison is case-insensitive per RFC 3501.
    pub fn has_keyword(&self, keyword: &str) -> bool {
        self.flags.iter().any(|flag| match flag {
            Flag::Keyword(word) => word.eq_ignore_ascii_case(keyword),
            _ => false,
        })
    }
}

/// Normalize line endings to CRLF. Lone LF and lone CR both become
/// CRLF; existing CRLF pairs pass through untouched.
pub fn canonicalize_crlf(input: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(input.len() + 16);
    let mut i = 0;
    while i < input.len() {
        match input[i] {
            b'\r' if input.get(i + 1) == Some(&b'\n') => {
                out.extend_from_slice(b"\r\n");
                i += 2;
            }
            b'\r' | b'\n' => {
                out.extend_from_slice(b"\r\n");
                i += 1;
            }
            byte => {
                out.push(byte);
                i += 1;
            }
        }
    }
    out
}

#[cfg(test)]
mod test {
    use super::*;
    use k9::assert_equal;

    #[test]
    fn crlf_canonicalization() {
        assert_equal!(canonicalize_crlf(b"a\nb"), b"a\r\nb".to_vec());
        assert_equal!(canonicalize_crlf(b"a\r\nb"), b"a\r\nb".to_vec());
        assert_equal!(canonicalize_crlf(b"a\rb"), b"a\r\nb".to_vec());
        assert_equal!(canonicalize_crlf(b"a\n"), b"a\r\n".to_vec());
        assert_equal!(canonicalize_crlf(b""), b"".to_vec());
    }

    #[test]
    fn keyword_lookup_is_case_insensitive() {
        let mut flags = BTreeSet::new();
        flags.insert(Flag::Keyword("Urgent".to_string()));
        let msg = StoredMessage::new(1, Arc::from(&b"x"[..]), flags, Utc::now());
        assert_equal!(msg.has_keyword("urgent"), true);
        assert_equal!(msg.has_keyword("URGENT"), true);
        assert_equal!(msg.has_keyword("other"), false);
    }
}
