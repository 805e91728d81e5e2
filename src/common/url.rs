//! URL normalisation and hostname matching rules used by the matching engine,
//! the TLS interception policy and the no-proxy logic.

use url::Url;

/// Normalises an absolute or schemeless URL into the canonical form used for
/// matching: lowercase scheme and authority, default ports stripped, trailing
/// host dots trimmed, IDN hosts converted to punycode, query and fragment
/// dropped, and the path normalised per [`normalize_path`].
///
/// Inputs starting with `/` are treated as bare paths. Schemeless inputs
/// (`example.com/abc`) keep no scheme in the output.
pub fn normalize_url(input: &str) -> String {
    if input.starts_with('/') {
        return normalize_path(strip_query(input));
    }

    let (schemeless, to_parse) = if input.contains("://") {
        (false, input.to_string())
    } else {
        // The url crate cannot parse authority-only inputs; borrow a scheme.
        (true, format!("http://{}", input))
    };

    let url = match Url::parse(&to_parse) {
        Ok(u) => u,
        // Not parseable as a URL at all: fall back to the raw input minus query.
        Err(_) => return strip_query(input).to_string(),
    };

    let host = url
        .host_str()
        .map(|h| h.to_ascii_lowercase().trim_end_matches('.').to_string())
        .unwrap_or_default();

    let scheme = url.scheme().to_ascii_lowercase();
    let default_port = match scheme.as_str() {
        "http" | "ws" => Some(80),
        "https" | "wss" => Some(443),
        _ => None,
    };

    let port = match url.port() {
        Some(p) if Some(p) != default_port => Some(p),
        _ => None,
    };

    let path = normalize_path(url.path());

    let mut out = String::new();
    if !schemeless {
        out.push_str(&scheme);
        out.push_str("://");
    }
    out.push_str(&host);
    if let Some(p) = port {
        out.push(':');
        out.push_str(&p.to_string());
    }
    out.push_str(&path);
    out
}

/// Normalises a URL path for matching:
/// - valid percent escapes keep their encoding with uppercased hex digits
/// - space and non-printable/non-ASCII bytes are percent-encoded
/// - other ASCII is left untouched
/// - malformed escapes have the characters after `%` uppercased literally
///   (`%1` stays `%1`, `%u002A` becomes `%U002A`)
/// - an empty path becomes `/`
pub fn normalize_path(path: &str) -> String {
    let bytes = path.as_bytes();
    let mut out = String::with_capacity(bytes.len());
    let mut i = 0;

    while i < bytes.len() {
        let b = bytes[i];
        if b == b'%' {
            let hex: Vec<u8> = bytes[i + 1..].iter().take(2).copied().collect();
            if hex.len() == 2 && hex.iter().all(|c| c.is_ascii_hexdigit()) {
                out.push('%');
                out.push(hex[0].to_ascii_uppercase() as char);
                out.push(hex[1].to_ascii_uppercase() as char);
                i += 3;
            } else {
                // Malformed escape: uppercase what follows the `%` literally.
                out.push('%');
                for c in &hex {
                    out.push(c.to_ascii_uppercase() as char);
                }
                i += 1 + hex.len();
            }
        } else if b == b' ' {
            out.push_str("%20");
            i += 1;
        } else if b.is_ascii_graphic() {
            out.push(b as char);
            i += 1;
        } else {
            out.push_str(&format!("%{:02X}", b));
            i += 1;
        }
    }

    if out.is_empty() {
        out.push('/');
    }
    out
}

fn strip_query(input: &str) -> &str {
    let end = input
        .find(|c| c == '?' || c == '#')
        .unwrap_or(input.len());
    &input[..end]
}

/// Matches a hostname against a wildcard pattern. `*.example.com` matches any
/// subdomain of `example.com` (but not the apex), `*.com` matches `example.com`,
/// and patterns without a wildcard match exactly. Comparison is case-insensitive.
pub fn hostname_matches(pattern: &str, hostname: &str) -> bool {
    let pattern = pattern.to_ascii_lowercase();
    let hostname = hostname.to_ascii_lowercase();

    match pattern.strip_prefix("*.") {
        Some(suffix) => {
            hostname.len() > suffix.len() + 1
                && hostname.ends_with(suffix)
                && hostname.as_bytes()[hostname.len() - suffix.len() - 1] == b'.'
        }
        None => pattern == hostname,
    }
}

/// Returns true when any pattern in the list matches the hostname.
pub fn hostname_matches_any(patterns: &[String], hostname: &str) -> bool {
    patterns.iter().any(|p| hostname_matches(p, hostname))
}

/// Decides whether `host:port` falls inside a no-proxy set.
///
/// An entry matches when, after stripping a leading `.` or `*.` and an optional
/// `:port` suffix, the tested host ends in the entry as a full-label suffix and
/// the ports agree if the entry pinned one. IP literals are compared literally;
/// no DNS resolution ever happens.
pub fn matches_no_proxy(hostname: &str, port: u16, no_proxy: &[String]) -> bool {
    let hostname = hostname.to_ascii_lowercase();

    no_proxy.iter().any(|entry| {
        let entry = entry.to_ascii_lowercase();
        let entry = entry
            .strip_prefix("*.")
            .or_else(|| entry.strip_prefix('.'))
            .unwrap_or(&entry);

        // Only split on a single ':' so bare IPv6 literals stay intact.
        let (entry_host, entry_port) = if entry.matches(':').count() == 1 {
            match entry.rsplit_once(':') {
                Some((h, p)) => match p.parse::<u16>() {
                    Ok(parsed) => (h, Some(parsed)),
                    Err(_) => (entry, None),
                },
                None => (entry, None),
            }
        } else {
            (entry, None)
        };

        if let Some(p) = entry_port {
            if p != port {
                return false;
            }
        }

        hostname == entry_host
            || (hostname.ends_with(entry_host)
                && hostname.as_bytes()[hostname.len() - entry_host.len() - 1] == b'.')
    })
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn normalize_lowercases_scheme_and_host() {
        assert_eq!(
            normalize_url("HTTP://EXAMPLE.com/abc"),
            "http://example.com/abc"
        );
    }

    #[test]
    fn normalize_strips_default_ports() {
        assert_eq!(normalize_url("http://example.com:80/a"), "http://example.com/a");
        assert_eq!(normalize_url("https://example.com:443/a"), "https://example.com/a");
        assert_eq!(
            normalize_url("http://example.com:8080/a"),
            "http://example.com:8080/a"
        );
    }

    #[test]
    fn normalize_trims_trailing_host_dots() {
        assert_eq!(normalize_url("http://example.com./a"), "http://example.com/a");
    }

    #[test]
    fn normalize_converts_idn_to_punycode() {
        assert_eq!(
            normalize_url("http://münchen.example/a"),
            "http://xn--mnchen-3ya.example/a"
        );
    }

    #[test]
    fn normalize_drops_query_and_fragment() {
        assert_eq!(
            normalize_url("http://example.com/a?b=1#frag"),
            "http://example.com/a"
        );
        assert_eq!(normalize_url("/a?b=1"), "/a");
    }

    #[test]
    fn normalize_adds_trailing_slash_to_empty_paths() {
        assert_eq!(normalize_url("http://example.com"), "http://example.com/");
        assert_eq!(normalize_url("example.com"), "example.com/");
    }

    #[test]
    fn normalize_path_uppercases_percent_escapes() {
        assert_eq!(normalize_path("/a%2fb"), "/a%2Fb");
        // Encoded characters are preserved even when semantically equivalent.
        assert_eq!(normalize_path("/%2A"), "/%2A");
    }

    #[test]
    fn normalize_path_encodes_space_and_non_ascii() {
        assert_eq!(normalize_path("/a b"), "/a%20b");
        assert_eq!(normalize_path("/ä"), "/%C3%A4");
    }

    #[test]
    fn normalize_path_tolerates_malformed_escapes() {
        assert_eq!(normalize_path("/%1"), "/%1");
        assert_eq!(normalize_path("/%u002A"), "/%U002A");
    }

    #[test]
    fn hostname_wildcards() {
        assert!(hostname_matches("*.example.com", "a.example.com"));
        assert!(hostname_matches("*.example.com", "a.b.example.com"));
        assert!(!hostname_matches("*.example.com", "example.com"));
        assert!(hostname_matches("*.com", "example.com"));
        assert!(hostname_matches("example.com", "EXAMPLE.com"));
        assert!(!hostname_matches("example.com", "sub.example.com"));
    }

    #[test]
    fn no_proxy_suffix_matching() {
        let list = vec!["example.com".to_string()];
        assert!(matches_no_proxy("subdomain.example.com", 80, &list));
        assert!(matches_no_proxy("example.com", 80, &list));
        assert!(!matches_no_proxy("notexample.com", 80, &list));
    }

    #[test]
    fn no_proxy_ip_literals_are_compared_literally() {
        let list = vec!["127.0.0.1".to_string()];
        assert!(!matches_no_proxy("localhost", 80, &list));
        assert!(matches_no_proxy("127.0.0.1", 80, &list));
    }

    #[test]
    fn no_proxy_port_pinning() {
        let list = vec!["example.com:8080".to_string()];
        assert!(matches_no_proxy("a.example.com", 8080, &list));
        assert!(!matches_no_proxy("a.example.com", 80, &list));
    }

    #[test]
    fn no_proxy_strips_leading_wildcards() {
        assert!(matches_no_proxy("a.example.com", 80, &vec![".example.com".to_string()]));
        assert!(matches_no_proxy("a.example.com", 80, &vec!["*.example.com".to_string()]));
    }
}
