use std::borrow::Cow;

use base64::{engine::general_purpose::STANDARD as BASE64, Engine};
use bytes::Bytes;
use serde::{Deserialize, Serialize};

/// A wrapper around `bytes::Bytes` providing utility methods for common operations.
#[derive(Serialize, Deserialize, Debug, Clone, Default)]
pub struct BodyBytes(pub Bytes);

impl BodyBytes {
    pub fn to_vec(&self) -> Vec<u8> {
        self.0.to_vec()
    }

    /// Cheaply clones the bytes into a new `Bytes` instance.
    pub fn to_bytes(&self) -> Bytes {
        self.0.clone()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn contains_str(&self, substring: &str) -> bool {
        if substring.is_empty() {
            return true;
        }

        self.0
            .as_ref()
            .windows(substring.len())
            .any(|window| window == substring.as_bytes())
    }

    /// Converts the bytes to a UTF-8 string, potentially lossy.
    /// Tries to borrow first to avoid copying and creating an owned instance.
    pub fn to_maybe_lossy_str(&self) -> Cow<str> {
        match std::str::from_utf8(&self.0) {
            Ok(valid_str) => Cow::Borrowed(valid_str),
            Err(_) => Cow::Owned(String::from_utf8_lossy(&self.0).to_string()),
        }
    }
}

impl From<Bytes> for BodyBytes {
    fn from(value: Bytes) -> Self {
        BodyBytes(value)
    }
}

impl From<Vec<u8>> for BodyBytes {
    fn from(value: Vec<u8>) -> Self {
        BodyBytes(Bytes::from(value))
    }
}

impl From<&str> for BodyBytes {
    fn from(value: &str) -> Self {
        BodyBytes(Bytes::from(value.to_string()))
    }
}

impl From<String> for BodyBytes {
    fn from(value: String) -> Self {
        BodyBytes(Bytes::from(value))
    }
}

impl PartialEq for BodyBytes {
    fn eq(&self, other: &Self) -> bool {
        self.0 == other.0
    }
}

impl AsRef<[u8]> for BodyBytes {
    fn as_ref(&self) -> &[u8] {
        self.0.as_ref()
    }
}

impl std::fmt::Display for BodyBytes {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        match std::str::from_utf8(&self.0) {
            Ok(result) => write!(f, "{}", result),
            Err(_) => write!(f, "{}", BASE64.encode(&self.0)),
        }
    }
}

// ===============================================================================================
// Header list helpers
// ===============================================================================================

/// Returns the first value of the named header, matched case-insensitively.
pub fn find_header<'a>(headers: &'a [(String, String)], name: &str) -> Option<&'a str> {
    headers
        .iter()
        .find(|(k, _)| k.eq_ignore_ascii_case(name))
        .map(|(_, v)| v.as_str())
}

/// Returns all values of the named header in order of appearance.
pub fn find_headers<'a>(headers: &'a [(String, String)], name: &str) -> Vec<&'a str> {
    headers
        .iter()
        .filter(|(k, _)| k.eq_ignore_ascii_case(name))
        .map(|(_, v)| v.as_str())
        .collect()
}

/// Sets a header value in place. Replaces the first occurrence, removes any further
/// duplicates, and appends if the header was not present. Untouched headers keep
/// their original case and position.
pub fn set_header(headers: &mut Vec<(String, String)>, name: &str, value: &str) {
    let mut replaced = false;
    headers.retain_mut(|(k, v)| {
        if k.eq_ignore_ascii_case(name) {
            if replaced {
                return false;
            }
            *v = value.to_string();
            replaced = true;
        }
        true
    });

    if !replaced {
        headers.push((name.to_string(), value.to_string()));
    }
}

/// Removes all occurrences of the named header.
pub fn remove_header(headers: &mut Vec<(String, String)>, name: &str) {
    headers.retain(|(k, _)| !k.eq_ignore_ascii_case(name));
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn body_bytes_contains_str_test() {
        let body = BodyBytes::from("hello world");
        assert!(body.contains_str("o wor"));
        assert!(body.contains_str(""));
        assert!(!body.contains_str("worlds"));
    }

    #[test]
    fn set_header_preserves_untouched_order_and_case() {
        let mut headers = vec![
            ("Host".to_string(), "example.com".to_string()),
            ("X-First".to_string(), "1".to_string()),
            ("Accept".to_string(), "*/*".to_string()),
        ];

        set_header(&mut headers, "x-first", "2");

        assert_eq!(
            headers,
            vec![
                ("Host".to_string(), "example.com".to_string()),
                ("X-First".to_string(), "2".to_string()),
                ("Accept".to_string(), "*/*".to_string()),
            ]
        );
    }

    #[test]
    fn set_header_appends_missing() {
        let mut headers = vec![("Host".to_string(), "example.com".to_string())];
        set_header(&mut headers, "Content-Length", "5");
        assert_eq!(headers[1], ("Content-Length".to_string(), "5".to_string()));
    }

    #[test]
    fn set_header_collapses_duplicates() {
        let mut headers = vec![
            ("Set-Thing".to_string(), "a".to_string()),
            ("set-thing".to_string(), "b".to_string()),
        ];
        set_header(&mut headers, "set-thing", "c");
        assert_eq!(headers, vec![("Set-Thing".to_string(), "c".to_string())]);
    }

    #[test]
    fn remove_header_removes_all_occurrences() {
        let mut headers = vec![
            ("A".to_string(), "1".to_string()),
            ("a".to_string(), "2".to_string()),
            ("B".to_string(), "3".to_string()),
        ];
        remove_header(&mut headers, "A");
        assert_eq!(headers, vec![("B".to_string(), "3".to_string())]);
    }
}
