//! Request matchers. A rule carries an ordered list of these; all of them
//! must pass for the rule to match, evaluated left to right with a
//! short-circuit on the first failure. Every matcher contributes a fragment
//! to the rule's human-readable explanation.

use regex::Regex;
use serde_json::Value;

use crate::common::{data::InterceptedRequest, url as url_util};

/// A predicate over an [`InterceptedRequest`].
#[derive(Debug, Clone)]
pub enum RequestMatcher {
    /// HTTP method, case-insensitive.
    Method(String),
    /// Absolute URL, compared in normalised form. Schemeless patterns
    /// (`example.com/path`) ignore the request scheme.
    UrlEquals(String),
    PathPrefix(String),
    PathRegex(Regex),
    /// Host and optional port of the request authority.
    Host { host: String, port: Option<u16> },
    /// The query string contains exactly these parameters.
    QueryEquals(Vec<(String, String)>),
    /// The query string contains at least these parameters.
    QueryIncludes(Vec<(String, String)>),
    /// Every listed header is present with the given value.
    HeaderIncludes(Vec<(String, String)>),
    CookieEquals { name: String, value: String },
    /// The urlencoded form body contains exactly these fields.
    FormEquals(Vec<(String, String)>),
    /// The urlencoded form body contains at least these fields.
    FormIncludes(Vec<(String, String)>),
    JsonBodyEquals(Value),
    /// The JSON body contains the given value as a subset.
    JsonBodyIncludes(Value),
    RawBodyEquals(Vec<u8>),
    RawBodyRegex(Regex),
    /// Matches every request.
    Wildcard,
}

impl RequestMatcher {
    pub fn matches(&self, req: &InterceptedRequest) -> bool {
        match self {
            RequestMatcher::Method(method) => req.method().eq_ignore_ascii_case(method),
            RequestMatcher::UrlEquals(pattern) => {
                let expected = url_util::normalize_url(pattern);
                let actual = req.normalized_url();
                if pattern.contains("://") || pattern.starts_with('/') {
                    if pattern.starts_with('/') {
                        return url_util::normalize_path(&req.path()) == expected;
                    }
                    actual == expected
                } else {
                    // Schemeless pattern: strip the scheme from the request side.
                    match actual.split_once("://") {
                        Some((_, rest)) => rest == expected,
                        None => actual == expected,
                    }
                }
            }
            RequestMatcher::PathPrefix(prefix) => req.path().starts_with(prefix.as_str()),
            RequestMatcher::PathRegex(regex) => regex.is_match(&req.path()),
            RequestMatcher::Host { host, port } => {
                let host_matches = req
                    .host()
                    .map(|h| h.eq_ignore_ascii_case(host))
                    .unwrap_or(false);
                let port_matches = port.map(|p| p == req.port()).unwrap_or(true);
                host_matches && port_matches
            }
            RequestMatcher::QueryEquals(expected) => {
                let mut actual = req.query_params();
                let mut expected = expected.clone();
                actual.sort();
                expected.sort();
                actual == expected
            }
            RequestMatcher::QueryIncludes(expected) => {
                let actual = req.query_params();
                expected.iter().all(|pair| actual.contains(pair))
            }
            RequestMatcher::HeaderIncludes(expected) => expected.iter().all(|(name, value)| {
                req.headers()
                    .iter()
                    .any(|(k, v)| k.eq_ignore_ascii_case(name) && v == value)
            }),
            RequestMatcher::CookieEquals { name, value } => req
                .cookies()
                .iter()
                .any(|(k, v)| k == name && v == value),
            RequestMatcher::FormEquals(expected) => match req.form() {
                Some(mut actual) => {
                    let mut expected = expected.clone();
                    actual.sort();
                    expected.sort();
                    actual == expected
                }
                None => false,
            },
            RequestMatcher::FormIncludes(expected) => match req.form() {
                Some(actual) => expected.iter().all(|pair| actual.contains(pair)),
                None => false,
            },
            RequestMatcher::JsonBodyEquals(expected) => match req.body_json() {
                Some(actual) => &actual == expected,
                None => false,
            },
            RequestMatcher::JsonBodyIncludes(expected) => match req.body_json() {
                Some(actual) => json_includes(&actual, expected),
                None => false,
            },
            RequestMatcher::RawBodyEquals(expected) => req.body().as_ref() == expected.as_slice(),
            RequestMatcher::RawBodyRegex(regex) => {
                regex.is_match(&req.body().to_maybe_lossy_str())
            }
            RequestMatcher::Wildcard => true,
        }
    }

    /// A fragment for the rule explanation, e.g. `for GET requests`.
    pub fn explain(&self) -> String {
        match self {
            RequestMatcher::Method(m) => format!("{} requests", m.to_uppercase()),
            RequestMatcher::UrlEquals(url) => format!("for {}", url),
            RequestMatcher::PathPrefix(p) => format!("for paths starting with {}", p),
            RequestMatcher::PathRegex(r) => format!("for paths matching /{}/", r.as_str()),
            RequestMatcher::Host { host, port } => match port {
                Some(p) => format!("for host {}:{}", host, p),
                None => format!("for host {}", host),
            },
            RequestMatcher::QueryEquals(q) => format!("with query {}", format_pairs(q)),
            RequestMatcher::QueryIncludes(q) => {
                format!("with query including {}", format_pairs(q))
            }
            RequestMatcher::HeaderIncludes(h) => {
                format!("with headers including {}", format_pairs(h))
            }
            RequestMatcher::CookieEquals { name, value } => {
                format!("with cookie {}={}", name, value)
            }
            RequestMatcher::FormEquals(f) => format!("with form data {}", format_pairs(f)),
            RequestMatcher::FormIncludes(f) => {
                format!("with form data including {}", format_pairs(f))
            }
            RequestMatcher::JsonBodyEquals(v) => format!("with JSON body {}", v),
            RequestMatcher::JsonBodyIncludes(v) => format!("with JSON body including {}", v),
            RequestMatcher::RawBodyEquals(b) => {
                format!("with body {:?}", String::from_utf8_lossy(b))
            }
            RequestMatcher::RawBodyRegex(r) => format!("with body matching /{}/", r.as_str()),
            RequestMatcher::Wildcard => "for anything".to_string(),
        }
    }
}

fn format_pairs(pairs: &[(String, String)]) -> String {
    pairs
        .iter()
        .map(|(k, v)| format!("{}={}", k, v))
        .collect::<Vec<_>>()
        .join(", ")
}

/// Structural subset check: every key/element of `expected` must appear in
/// `actual` with an equal (or recursively included) value.
fn json_includes(actual: &Value, expected: &Value) -> bool {
    match (actual, expected) {
        (Value::Object(actual), Value::Object(expected)) => expected
            .iter()
            .all(|(k, v)| actual.get(k).map(|a| json_includes(a, v)).unwrap_or(false)),
        (Value::Array(actual), Value::Array(expected)) => expected
            .iter()
            .all(|e| actual.iter().any(|a| json_includes(a, e))),
        (a, e) => a == e,
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::common::{data::HttpVersion, data::InterceptedRequest, util::BodyBytes};
    use serde_json::json;

    fn request(method: &str, url: &str) -> InterceptedRequest {
        InterceptedRequest::new(
            HttpVersion::Http1,
            "http".to_string(),
            method.to_string(),
            url.to_string(),
            Vec::new(),
            None,
            BodyBytes::default(),
        )
    }

    fn request_with_body(headers: Vec<(String, String)>, body: &[u8]) -> InterceptedRequest {
        InterceptedRequest::new(
            HttpVersion::Http1,
            "http".to_string(),
            "POST".to_string(),
            "http://localhost/api".to_string(),
            headers,
            None,
            BodyBytes::from(body.to_vec()),
        )
    }

    #[test]
    fn method_matcher_is_case_insensitive() {
        let req = request("GET", "http://localhost/");
        assert!(RequestMatcher::Method("get".to_string()).matches(&req));
        assert!(!RequestMatcher::Method("POST".to_string()).matches(&req));
    }

    #[test]
    fn url_matcher_uses_normalized_comparison() {
        let req = request("GET", "http://EXAMPLE.com:80/a%2fb?x=1");
        assert!(RequestMatcher::UrlEquals("http://example.com/a%2Fb".to_string()).matches(&req));
    }

    #[test]
    fn url_matcher_accepts_schemeless_patterns() {
        let req = request("GET", "https://example.com/abc");
        assert!(RequestMatcher::UrlEquals("example.com/abc".to_string()).matches(&req));
    }

    #[test]
    fn url_matcher_accepts_bare_paths() {
        let req = request("GET", "http://example.com/abc?q=1");
        assert!(RequestMatcher::UrlEquals("/abc".to_string()).matches(&req));
        assert!(!RequestMatcher::UrlEquals("/other".to_string()).matches(&req));
    }

    #[test]
    fn path_prefix_and_regex() {
        let req = request("GET", "http://localhost/api/users/42");
        assert!(RequestMatcher::PathPrefix("/api".to_string()).matches(&req));
        assert!(!RequestMatcher::PathPrefix("/apix".to_string()).matches(&req));
        assert!(RequestMatcher::PathRegex(Regex::new(r"^/api/users/\d+$").unwrap()).matches(&req));
    }

    #[test]
    fn host_matcher_with_and_without_port() {
        let req = request("GET", "http://example.com:8080/");
        assert!(RequestMatcher::Host {
            host: "example.com".to_string(),
            port: Some(8080)
        }
        .matches(&req));
        assert!(RequestMatcher::Host {
            host: "EXAMPLE.com".to_string(),
            port: None
        }
        .matches(&req));
        assert!(!RequestMatcher::Host {
            host: "example.com".to_string(),
            port: Some(80)
        }
        .matches(&req));
    }

    #[test]
    fn query_matchers() {
        let req = request("GET", "http://localhost/?b=2&a=1");
        let pairs = |s: &[(&str, &str)]| {
            s.iter()
                .map(|(k, v)| (k.to_string(), v.to_string()))
                .collect::<Vec<_>>()
        };

        assert!(RequestMatcher::QueryEquals(pairs(&[("a", "1"), ("b", "2")])).matches(&req));
        assert!(!RequestMatcher::QueryEquals(pairs(&[("a", "1")])).matches(&req));
        assert!(RequestMatcher::QueryIncludes(pairs(&[("a", "1")])).matches(&req));
        assert!(!RequestMatcher::QueryIncludes(pairs(&[("c", "3")])).matches(&req));
    }

    #[test]
    fn header_and_cookie_matchers() {
        let req = request_with_body(
            vec![
                ("Content-Type".to_string(), "text/plain".to_string()),
                ("Cookie".to_string(), "session=abc; theme=dark".to_string()),
            ],
            b"",
        );

        assert!(RequestMatcher::HeaderIncludes(vec![(
            "content-type".to_string(),
            "text/plain".to_string()
        )])
        .matches(&req));
        assert!(RequestMatcher::CookieEquals {
            name: "theme".to_string(),
            value: "dark".to_string()
        }
        .matches(&req));
        assert!(!RequestMatcher::CookieEquals {
            name: "session".to_string(),
            value: "other".to_string()
        }
        .matches(&req));
    }

    #[test]
    fn form_matchers() {
        let req = request_with_body(Vec::new(), b"a=1&b=2");
        let pairs = |s: &[(&str, &str)]| {
            s.iter()
                .map(|(k, v)| (k.to_string(), v.to_string()))
                .collect::<Vec<_>>()
        };

        assert!(RequestMatcher::FormEquals(pairs(&[("b", "2"), ("a", "1")])).matches(&req));
        assert!(RequestMatcher::FormIncludes(pairs(&[("a", "1")])).matches(&req));
        assert!(!RequestMatcher::FormIncludes(pairs(&[("a", "2")])).matches(&req));
    }

    #[test]
    fn json_body_matchers() {
        let req = request_with_body(Vec::new(), b"{\"a\": 1, \"nested\": {\"b\": 2, \"c\": 3}}");

        assert!(RequestMatcher::JsonBodyIncludes(json!({"nested": {"b": 2}})).matches(&req));
        assert!(!RequestMatcher::JsonBodyIncludes(json!({"nested": {"b": 99}})).matches(&req));
        assert!(!RequestMatcher::JsonBodyEquals(json!({"a": 1})).matches(&req));
    }

    #[test]
    fn raw_body_matchers() {
        let req = request_with_body(Vec::new(), b"hello world");
        assert!(RequestMatcher::RawBodyEquals(b"hello world".to_vec()).matches(&req));
        assert!(RequestMatcher::RawBodyRegex(Regex::new("^hello").unwrap()).matches(&req));
    }

    #[test]
    fn wildcard_matches_anything() {
        assert!(RequestMatcher::Wildcard.matches(&request("DELETE", "http://x/y")));
    }

    #[test]
    fn explanations_are_composable() {
        let m = RequestMatcher::Method("get".to_string());
        assert_eq!(m.explain(), "GET requests");
        let m = RequestMatcher::PathPrefix("/api".to_string());
        assert_eq!(m.explain(), "for paths starting with /api");
    }
}
