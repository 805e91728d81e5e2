//! Declarative mutations applied to outgoing upstream requests and incoming
//! upstream responses during passthrough.
//!
//! Body transforms honour the `Content-Encoding` stack: the body is decoded,
//! mutated and re-encoded with the same stack, and `Content-Length` is
//! recomputed. Unknown codings fail the transform with a distinct error. At
//! most one body-replacement transform fires per direction, selected by the
//! precedence `replace_body_from_file` > `replace_body` > `match_replace_body`
//! > `patch_json_body` > `update_json_body`.

use std::{collections::BTreeMap, path::PathBuf};

use bytes::Bytes;
use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;
use url::Url;

use crate::common::{
    data::{HostHeaderPolicy, OutboundRequest, OutboundResponse},
    encoding,
    util::{find_header, remove_header, set_header},
};

#[derive(Error, Debug)]
pub enum Error {
    #[error("transform failed: {0}")]
    Encoding(#[from] encoding::Error),
    #[error("cannot read replacement body file {path}: {source}")]
    BodyFileError {
        path: String,
        source: std::io::Error,
    },
    #[error("cannot apply JSON transform: {0}")]
    JsonError(String),
    #[error("cannot apply JSON patch: {0}")]
    PatchError(String),
    #[error("cannot rewrite URL: {0}")]
    UrlError(String),
}

/// A single pattern+replacement pair. Literal patterns replace the first
/// occurrence; regex patterns replace the first match, or every match when
/// marked global.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum MatchReplace {
    Literal {
        pattern: String,
        replacement: String,
    },
    Regex {
        #[serde(with = "serde_regex")]
        pattern: Regex,
        replacement: String,
        #[serde(default)]
        global: bool,
    },
}

impl MatchReplace {
    pub fn literal(pattern: impl Into<String>, replacement: impl Into<String>) -> Self {
        MatchReplace::Literal {
            pattern: pattern.into(),
            replacement: replacement.into(),
        }
    }

    pub fn regex(pattern: Regex, replacement: impl Into<String>) -> Self {
        MatchReplace::Regex {
            pattern,
            replacement: replacement.into(),
            global: false,
        }
    }

    pub fn regex_global(pattern: Regex, replacement: impl Into<String>) -> Self {
        MatchReplace::Regex {
            pattern,
            replacement: replacement.into(),
            global: true,
        }
    }

    fn apply(&self, input: &str) -> String {
        match self {
            MatchReplace::Literal {
                pattern,
                replacement,
            } => input.replacen(pattern.as_str(), replacement, 1),
            MatchReplace::Regex {
                pattern,
                replacement,
                global,
            } => {
                if *global {
                    pattern.replace_all(input, replacement.as_str()).to_string()
                } else {
                    pattern.replace(input, replacement.as_str()).to_string()
                }
            }
        }
    }
}

fn apply_all(pairs: &[MatchReplace], input: &str) -> String {
    pairs.iter().fold(input.to_string(), |acc, p| p.apply(&acc))
}

/// Authority replacement plus the host-header policy that goes with it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReplaceHost {
    /// New authority, `host` or `host:port`.
    pub target: String,
    #[serde(default)]
    pub update_host_header: HostHeaderPolicy,
}

/// Mutations applied to the outgoing upstream request.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct RequestTransform {
    pub replace_method: Option<String>,
    /// Change the scheme (`http` <-> `https`).
    pub set_protocol: Option<String>,
    pub replace_host: Option<ReplaceHost>,
    pub match_replace_host: Vec<MatchReplace>,
    pub match_replace_path: Vec<MatchReplace>,
    pub match_replace_query: Vec<MatchReplace>,
    /// Set-or-remove named headers; `None` deletes.
    pub update_headers: Option<BTreeMap<String, Option<String>>>,
    /// Replace the entire header set.
    pub replace_headers: Option<Vec<(String, String)>>,
    pub replace_body: Option<Bytes>,
    pub replace_body_from_file: Option<PathBuf>,
    /// Merge into the JSON body; `null` values delete keys.
    pub update_json_body: Option<Value>,
    /// RFC 6902 patch applied to the JSON body.
    pub patch_json_body: Option<json_patch::Patch>,
    pub match_replace_body: Vec<MatchReplace>,
}

/// Mutations applied to the incoming upstream response.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ResponseTransform {
    /// Overwrite the status code; the reason phrase is re-derived.
    pub replace_status: Option<u16>,
    pub update_headers: Option<BTreeMap<String, Option<String>>>,
    pub replace_headers: Option<Vec<(String, String)>>,
    pub replace_body: Option<Bytes>,
    pub replace_body_from_file: Option<PathBuf>,
    pub update_json_body: Option<Value>,
    pub patch_json_body: Option<json_patch::Patch>,
    pub match_replace_body: Vec<MatchReplace>,
}

/// Applies a request transform in place. Returns true when a body transform
/// fired.
pub async fn apply_request(
    transform: &RequestTransform,
    req: &mut OutboundRequest,
) -> Result<bool, Error> {
    if let Some(method) = &transform.replace_method {
        req.method = method.to_uppercase();
    }

    let mut url = Url::parse(&req.url).map_err(|e| Error::UrlError(e.to_string()))?;

    if let Some(protocol) = &transform.set_protocol {
        url.set_scheme(protocol)
            .map_err(|_| Error::UrlError(format!("cannot set scheme to {}", protocol)))?;
    }

    if let Some(replace_host) = &transform.replace_host {
        set_authority(&mut url, &replace_host.target)?;
        apply_host_header(
            &mut req.headers,
            &replace_host.update_host_header,
            &authority_of(&url),
        );
    }

    if !transform.match_replace_host.is_empty() {
        let host = url.host_str().unwrap_or("").to_string();
        let new_host = apply_all(&transform.match_replace_host, &host);
        if new_host != host {
            url.set_host(Some(&new_host))
                .map_err(|e| Error::UrlError(e.to_string()))?;
            set_header(&mut req.headers, "host", &authority_of(&url));
        }
    }

    if !transform.match_replace_path.is_empty() {
        let path = url.path().to_string();
        let new_path = apply_all(&transform.match_replace_path, &path);
        url.set_path(&new_path);
    }

    if !transform.match_replace_query.is_empty() {
        let query = url.query().unwrap_or("").to_string();
        let new_query = apply_all(&transform.match_replace_query, &query);
        if new_query.is_empty() {
            url.set_query(None);
        } else {
            url.set_query(Some(&new_query));
        }
    }

    req.url = url.to_string();

    apply_header_changes(
        &mut req.headers,
        transform.update_headers.as_ref(),
        transform.replace_headers.as_ref(),
    );

    apply_body_transforms(
        &mut req.headers,
        &mut req.body,
        transform.replace_body_from_file.as_ref(),
        transform.replace_body.as_ref(),
        &transform.match_replace_body,
        transform.patch_json_body.as_ref(),
        transform.update_json_body.as_ref(),
    )
    .await
}

/// Applies a response transform in place. Returns true when a body transform
/// fired.
pub async fn apply_response(
    transform: &ResponseTransform,
    res: &mut OutboundResponse,
) -> Result<bool, Error> {
    if let Some(status) = transform.replace_status {
        res.status = status;
        // Reason phrase follows the new status.
        res.status_message = None;
    }

    apply_header_changes(
        &mut res.headers,
        transform.update_headers.as_ref(),
        transform.replace_headers.as_ref(),
    );

    apply_body_transforms(
        &mut res.headers,
        &mut res.body,
        transform.replace_body_from_file.as_ref(),
        transform.replace_body.as_ref(),
        &transform.match_replace_body,
        transform.patch_json_body.as_ref(),
        transform.update_json_body.as_ref(),
    )
    .await
}

fn apply_header_changes(
    headers: &mut Vec<(String, String)>,
    updates: Option<&BTreeMap<String, Option<String>>>,
    replacement: Option<&Vec<(String, String)>>,
) {
    if let Some(replacement) = replacement {
        *headers = replacement.clone();
        return;
    }

    if let Some(updates) = updates {
        for (name, value) in updates {
            match value {
                Some(v) => set_header(headers, name, v),
                None => remove_header(headers, name),
            }
        }
    }
}

#[allow(clippy::too_many_arguments)]
async fn apply_body_transforms(
    headers: &mut Vec<(String, String)>,
    body: &mut Bytes,
    from_file: Option<&PathBuf>,
    replace: Option<&Bytes>,
    match_replace: &[MatchReplace],
    patch: Option<&json_patch::Patch>,
    merge: Option<&Value>,
) -> Result<bool, Error> {
    // Precedence: only the highest-ranked configured transform fires.
    if let Some(path) = from_file {
        let contents = tokio::fs::read(path)
            .await
            .map_err(|source| Error::BodyFileError {
                path: path.display().to_string(),
                source,
            })?;
        set_raw_body(headers, body, Bytes::from(contents));
        return Ok(true);
    }

    if let Some(replacement) = replace {
        set_raw_body(headers, body, replacement.clone());
        return Ok(true);
    }

    if !match_replace.is_empty() {
        mutate_decoded_body(headers, body, |decoded| {
            let text = String::from_utf8_lossy(&decoded).to_string();
            Ok(Bytes::from(apply_all(match_replace, &text)))
        })?;
        return Ok(true);
    }

    if let Some(patch) = patch {
        mutate_decoded_body(headers, body, |decoded| {
            let mut json: Value = serde_json::from_slice(&decoded)
                .map_err(|e| Error::JsonError(e.to_string()))?;
            json_patch::patch(&mut json, patch).map_err(|e| Error::PatchError(e.to_string()))?;
            Ok(Bytes::from(json.to_string()))
        })?;
        return Ok(true);
    }

    if let Some(merge) = merge {
        mutate_decoded_body(headers, body, |decoded| {
            let mut json: Value = serde_json::from_slice(&decoded)
                .map_err(|e| Error::JsonError(e.to_string()))?;
            merge_json(&mut json, merge);
            Ok(Bytes::from(json.to_string()))
        })?;
        return Ok(true);
    }

    Ok(false)
}

/// Shallow-merges `patch` into `target`; `null` values delete keys, nested
/// objects merge recursively.
fn merge_json(target: &mut Value, patch: &Value) {
    match (target, patch) {
        (Value::Object(target), Value::Object(patch)) => {
            for (key, value) in patch {
                if value.is_null() {
                    target.remove(key);
                } else if let (Some(existing), true) =
                    (target.get_mut(key), value.is_object())
                {
                    merge_json(existing, value);
                } else {
                    target.insert(key.clone(), value.clone());
                }
            }
        }
        (target, patch) => *target = patch.clone(),
    }
}

/// Replaces the body wholesale and recomputes `Content-Length`.
fn set_raw_body(headers: &mut Vec<(String, String)>, body: &mut Bytes, new_body: Bytes) {
    set_header(headers, "content-length", &new_body.len().to_string());
    *body = new_body;
}

/// Decodes the body per its `Content-Encoding` stack, applies `f`, re-encodes
/// with the same stack and fixes up `Content-Length`.
fn mutate_decoded_body(
    headers: &mut Vec<(String, String)>,
    body: &mut Bytes,
    f: impl FnOnce(Bytes) -> Result<Bytes, Error>,
) -> Result<(), Error> {
    let stack = find_header(headers, "content-encoding").map(|s| s.to_string());

    let new_body = match &stack {
        None => f(body.clone())?,
        Some(stack) => {
            let decoded = encoding::decode(stack, body)?;
            let mutated = f(decoded)?;
            encoding::encode(stack, &mutated)?
        }
    };

    set_header(headers, "content-length", &new_body.len().to_string());
    *body = new_body;
    Ok(())
}

/// The `Host`-header form of the URL authority (no default ports).
fn authority_of(url: &Url) -> String {
    match (url.host_str(), url.port()) {
        (Some(host), Some(port)) => format!("{}:{}", host, port),
        (Some(host), None) => host.to_string(),
        _ => String::new(),
    }
}

fn set_authority(url: &mut Url, target: &str) -> Result<(), Error> {
    let (host, port) = if target.matches(':').count() == 1 {
        match target.rsplit_once(':') {
            Some((h, p)) => {
                let port = p
                    .parse::<u16>()
                    .map_err(|_| Error::UrlError(format!("invalid port in {}", target)))?;
                (h.to_string(), Some(port))
            }
            None => (target.to_string(), None),
        }
    } else {
        (target.to_string(), None)
    };

    url.set_host(Some(&host))
        .map_err(|e| Error::UrlError(e.to_string()))?;
    url.set_port(port)
        .map_err(|_| Error::UrlError(format!("cannot set port on {}", url)))?;
    Ok(())
}

fn apply_host_header(
    headers: &mut Vec<(String, String)>,
    policy: &HostHeaderPolicy,
    authority: &str,
) {
    match policy {
        HostHeaderPolicy::Update => set_header(headers, "host", authority),
        HostHeaderPolicy::Preserve => {}
        HostHeaderPolicy::Custom(value) => set_header(headers, "host", value),
    }
}
