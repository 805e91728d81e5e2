//! The rule engine: an ordered table of matcher+step rules with per-rule
//! completion counters, seen-request recording and explanatory diagnostics.
//!
//! Reads take a snapshot of the table so matching never blocks rule
//! administration; completion counts are claimed atomically so a `once` rule
//! is never double-served under concurrent load.

use std::sync::{
    atomic::{AtomicU64, Ordering},
    Arc, Mutex, RwLock,
};

use thiserror::Error;
use tracing::debug;

use crate::common::data::{InterceptedRequest, RequestRule, WebSocketRule};

#[derive(Error, Debug)]
pub enum Error {
    #[error("duplicate rule id: {0}")]
    DuplicateRuleId(String),
    #[error("invalid rule: {0}")]
    InvalidRule(String),
}

/// A registered request rule plus its mutable runtime state.
#[derive(Debug)]
pub struct ActiveRule {
    pub(crate) definition: RequestRule,
    id: String,
    insertion: u64,
    seen: AtomicU64,
    seen_requests: Mutex<Vec<Arc<InterceptedRequest>>>,
}

impl ActiveRule {
    fn new(definition: RequestRule, insertion: u64) -> Self {
        let id = definition
            .id
            .clone()
            .unwrap_or_else(|| uuid::Uuid::new_v4().to_string());
        ActiveRule {
            definition,
            id,
            insertion,
            seen: AtomicU64::new(0),
            seen_requests: Mutex::new(Vec::new()),
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn seen_count(&self) -> u64 {
        self.seen.load(Ordering::SeqCst)
    }

    pub fn seen_requests(&self) -> Vec<Arc<InterceptedRequest>> {
        self.seen_requests.lock().unwrap().clone()
    }

    /// Whether the completion predicate admits no further requests.
    pub fn is_done(&self) -> bool {
        match self.definition.completion.limit() {
            Some(limit) => self.seen_count() >= limit,
            None => false,
        }
    }

    /// Human-readable explanation composed from matcher and step fragments.
    pub fn explain(&self) -> String {
        let matchers = if self.definition.matchers.is_empty() {
            "any request".to_string()
        } else {
            self.definition
                .matchers
                .iter()
                .map(|m| m.explain())
                .collect::<Vec<_>>()
                .join(", ")
        };
        format!(
            "Match {}, and then {}, {}.",
            matchers,
            self.definition.step.describe(),
            self.definition.completion.describe()
        )
    }

    /// Atomically claims one use of this rule. Returns false when the
    /// completion predicate is already exhausted.
    fn try_claim(&self) -> bool {
        match self.definition.completion.limit() {
            None => {
                self.seen.fetch_add(1, Ordering::SeqCst);
                true
            }
            Some(limit) => loop {
                let current = self.seen.load(Ordering::SeqCst);
                if current >= limit {
                    return false;
                }
                if self
                    .seen
                    .compare_exchange(current, current + 1, Ordering::SeqCst, Ordering::SeqCst)
                    .is_ok()
                {
                    return true;
                }
            },
        }
    }

    fn record(&self, req: Arc<InterceptedRequest>) {
        self.seen_requests.lock().unwrap().push(req);
    }
}

/// A registered websocket rule plus its runtime state.
pub struct ActiveWebSocketRule {
    pub(crate) definition: WebSocketRule,
    id: String,
    insertion: u64,
    seen: AtomicU64,
}

impl ActiveWebSocketRule {
    fn new(definition: WebSocketRule, insertion: u64) -> Self {
        let id = definition
            .id
            .clone()
            .unwrap_or_else(|| uuid::Uuid::new_v4().to_string());
        ActiveWebSocketRule {
            definition,
            id,
            insertion,
            seen: AtomicU64::new(0),
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn seen_count(&self) -> u64 {
        self.seen.load(Ordering::SeqCst)
    }

    pub fn explain(&self) -> String {
        let matchers = if self.definition.matchers.is_empty() {
            "any websocket".to_string()
        } else {
            self.definition
                .matchers
                .iter()
                .map(|m| m.explain())
                .collect::<Vec<_>>()
                .join(", ")
        };
        format!(
            "Match {}, and then {}.",
            matchers,
            self.definition.step.describe()
        )
    }

    fn try_claim(&self) -> bool {
        match self.definition.completion.limit() {
            None => {
                self.seen.fetch_add(1, Ordering::SeqCst);
                true
            }
            Some(limit) => loop {
                let current = self.seen.load(Ordering::SeqCst);
                if current >= limit {
                    return false;
                }
                if self
                    .seen
                    .compare_exchange(current, current + 1, Ordering::SeqCst, Ordering::SeqCst)
                    .is_ok()
                {
                    return true;
                }
            },
        }
    }
}

/// Stable handle onto a registered rule, exposing its diagnostics.
#[derive(Clone, Debug)]
pub struct MockedEndpoint {
    rule: Arc<ActiveRule>,
}

impl MockedEndpoint {
    pub fn id(&self) -> &str {
        self.rule.id()
    }

    pub fn explanation(&self) -> String {
        self.rule.explain()
    }

    pub fn seen_count(&self) -> u64 {
        self.rule.seen_count()
    }

    pub fn seen_requests(&self) -> Vec<Arc<InterceptedRequest>> {
        self.rule.seen_requests()
    }
}

/// The ordered rule table for HTTP and WebSocket flows.
pub struct RuleStore {
    rules: RwLock<Vec<Arc<ActiveRule>>>,
    ws_rules: RwLock<Vec<Arc<ActiveWebSocketRule>>>,
    insertion_counter: AtomicU64,
}

impl Default for RuleStore {
    fn default() -> Self {
        RuleStore {
            rules: RwLock::new(Vec::new()),
            ws_rules: RwLock::new(Vec::new()),
            insertion_counter: AtomicU64::new(0),
        }
    }
}

impl RuleStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_request_rules(&self, rules: Vec<RequestRule>) -> Result<Vec<MockedEndpoint>, Error> {
        for rule in &rules {
            validate_rule(rule)?;
        }

        let mut table = self.rules.write().unwrap();
        self.check_duplicate_ids(
            rules.iter().filter_map(|r| r.id.as_deref()),
            table.iter().map(|r| r.id()),
        )?;

        let mut handles = Vec::with_capacity(rules.len());
        for rule in rules {
            let insertion = self.insertion_counter.fetch_add(1, Ordering::Relaxed);
            let active = Arc::new(ActiveRule::new(rule, insertion));
            debug!(rule_id = active.id(), "registered request rule");
            handles.push(MockedEndpoint {
                rule: active.clone(),
            });
            table.push(active);
        }

        Ok(handles)
    }

    pub fn set_request_rules(&self, rules: Vec<RequestRule>) -> Result<Vec<MockedEndpoint>, Error> {
        self.rules.write().unwrap().clear();
        self.add_request_rules(rules)
    }

    pub fn add_websocket_rules(&self, rules: Vec<WebSocketRule>) -> Result<Vec<String>, Error> {
        let mut table = self.ws_rules.write().unwrap();
        self.check_duplicate_ids(
            rules.iter().filter_map(|r| r.id.as_deref()),
            table.iter().map(|r| r.id()),
        )?;

        let mut ids = Vec::with_capacity(rules.len());
        for rule in rules {
            let insertion = self.insertion_counter.fetch_add(1, Ordering::Relaxed);
            let active = Arc::new(ActiveWebSocketRule::new(rule, insertion));
            ids.push(active.id().to_string());
            table.push(active);
        }

        Ok(ids)
    }

    pub fn set_websocket_rules(&self, rules: Vec<WebSocketRule>) -> Result<Vec<String>, Error> {
        self.ws_rules.write().unwrap().clear();
        self.add_websocket_rules(rules)
    }

    /// Drops all rules and their recorded traffic.
    pub fn reset(&self) {
        self.rules.write().unwrap().clear();
        self.ws_rules.write().unwrap().clear();
        debug!("rule store reset");
    }

    pub fn mocked_endpoints(&self) -> Vec<MockedEndpoint> {
        self.rules
            .read()
            .unwrap()
            .iter()
            .map(|rule| MockedEndpoint { rule: rule.clone() })
            .collect()
    }

    /// Finds the first rule matching `req` whose completion predicate still
    /// admits a request, claims it and records the request.
    pub fn match_request(&self, req: &Arc<InterceptedRequest>) -> Option<Arc<ActiveRule>> {
        let snapshot = self.snapshot();

        for rule in snapshot {
            let all_match = rule.definition.matchers.iter().all(|m| m.matches(req));
            if !all_match {
                continue;
            }
            if rule.try_claim() {
                rule.record(req.clone());
                req.set_matched_rule(rule.id());
                debug!(rule_id = rule.id(), request_id = req.id(), "request matched rule");
                return Some(rule);
            }
        }

        debug!(request_id = req.id(), "no rule matched request");
        None
    }

    /// Finds and claims a websocket rule for an upgrade request.
    pub fn match_websocket(
        &self,
        req: &Arc<InterceptedRequest>,
    ) -> Option<Arc<ActiveWebSocketRule>> {
        let mut snapshot: Vec<Arc<ActiveWebSocketRule>> =
            self.ws_rules.read().unwrap().iter().cloned().collect();
        snapshot.sort_by(|a, b| {
            b.definition
                .priority
                .cmp(&a.definition.priority)
                .then(a.insertion.cmp(&b.insertion))
        });

        for rule in snapshot {
            if rule.definition.matchers.iter().all(|m| m.matches(req)) && rule.try_claim() {
                req.set_matched_rule(rule.id());
                return Some(rule);
            }
        }
        None
    }

    /// The explanatory body served when no rule matched.
    pub fn explain_unmatched(&self, req: &InterceptedRequest) -> String {
        let snapshot = self.snapshot();

        let mut body = format!(
            "No rules were found matching this request.\nThis request was: {} {}\n\n",
            req.method(),
            req.url()
        );

        if snapshot.is_empty() {
            body.push_str("There are no rules configured on this server.\n");
        } else {
            body.push_str("The configured rules are:\n");
            for rule in &snapshot {
                let state = if rule.is_done() {
                    "done".to_string()
                } else {
                    format!("seen {}", rule.seen_count())
                };
                body.push_str(&format!("- {} ({})\n", rule.explain(), state));
            }
        }

        body.push_str(&format!(
            "\nTo handle this request, add a rule matching {} requests for paths starting with {}.\n",
            req.method(),
            req.path()
        ));
        body
    }

    fn snapshot(&self) -> Vec<Arc<ActiveRule>> {
        let mut snapshot: Vec<Arc<ActiveRule>> =
            self.rules.read().unwrap().iter().cloned().collect();
        // Highest priority first; insertion order breaks ties.
        snapshot.sort_by(|a, b| {
            b.definition
                .priority
                .cmp(&a.definition.priority)
                .then(a.insertion.cmp(&b.insertion))
        });
        snapshot
    }

    fn check_duplicate_ids<'a>(
        &self,
        new_ids: impl Iterator<Item = &'a str>,
        existing: impl Iterator<Item = &'a str> + Clone,
    ) -> Result<(), Error> {
        let mut seen: Vec<&str> = Vec::new();
        for id in new_ids {
            if seen.contains(&id) || existing.clone().any(|e| e == id) {
                return Err(Error::DuplicateRuleId(id.to_string()));
            }
            seen.push(id);
        }
        Ok(())
    }
}

fn validate_rule(rule: &RequestRule) -> Result<(), Error> {
    if let Some(headers) = match &rule.step {
        crate::server::steps::RequestStep::Fixed(spec) => spec.headers.as_ref(),
        _ => None,
    } {
        for (name, _) in headers {
            if name.starts_with(':') {
                return Err(Error::InvalidRule(format!(
                    "pseudo-header {} cannot be set through a rule",
                    name
                )));
            }
        }
    }
    Ok(())
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::{
        common::{
            data::{Completion, HttpVersion, ResponseSpec},
            util::BodyBytes,
        },
        server::{matchers::RequestMatcher, steps::RequestStep},
    };

    fn request(method: &str, path: &str) -> Arc<InterceptedRequest> {
        Arc::new(InterceptedRequest::new(
            HttpVersion::Http1,
            "http".to_string(),
            method.to_string(),
            format!("http://localhost{}", path),
            Vec::new(),
            None,
            BodyBytes::default(),
        ))
    }

    fn rule_for(path: &str) -> RequestRule {
        RequestRule::new(
            vec![
                RequestMatcher::Method("GET".to_string()),
                RequestMatcher::PathPrefix(path.to_string()),
            ],
            RequestStep::Fixed(ResponseSpec::new(200)),
        )
    }

    #[test]
    fn first_matching_rule_wins() {
        let store = RuleStore::new();
        store
            .add_request_rules(vec![
                rule_for("/a").with_id("first"),
                rule_for("/a").with_id("second"),
            ])
            .unwrap();

        let matched = store.match_request(&request("GET", "/a")).unwrap();
        assert_eq!(matched.id(), "first");
    }

    #[test]
    fn priority_beats_insertion_order() {
        let store = RuleStore::new();
        store
            .add_request_rules(vec![
                rule_for("/a").with_id("low"),
                rule_for("/a").with_id("high").with_priority(10),
            ])
            .unwrap();

        let matched = store.match_request(&request("GET", "/a")).unwrap();
        assert_eq!(matched.id(), "high");
    }

    #[test]
    fn exhausted_rules_fall_through_to_later_ones() {
        let store = RuleStore::new();
        store
            .add_request_rules(vec![
                rule_for("/a").with_id("once").with_completion(Completion::Once),
                rule_for("/a").with_id("fallback").with_completion(Completion::Always),
            ])
            .unwrap();

        assert_eq!(store.match_request(&request("GET", "/a")).unwrap().id(), "once");
        assert_eq!(
            store.match_request(&request("GET", "/a")).unwrap().id(),
            "fallback"
        );
        assert_eq!(
            store.match_request(&request("GET", "/a")).unwrap().id(),
            "fallback"
        );
    }

    #[test]
    fn seen_count_increments_exactly_once_per_match() {
        let store = RuleStore::new();
        let handles = store
            .add_request_rules(vec![rule_for("/a").with_completion(Completion::Always)])
            .unwrap();

        for _ in 0..5 {
            store.match_request(&request("GET", "/a"));
        }

        assert_eq!(handles[0].seen_count(), 5);
        assert_eq!(handles[0].seen_requests().len(), 5);
    }

    #[test]
    fn concurrent_claims_never_exceed_the_limit() {
        let store = Arc::new(RuleStore::new());
        store
            .add_request_rules(vec![rule_for("/a").with_completion(Completion::Times(50))])
            .unwrap();

        let mut threads = Vec::new();
        for _ in 0..8 {
            let store = store.clone();
            threads.push(std::thread::spawn(move || {
                let mut claimed = 0;
                for _ in 0..25 {
                    if store.match_request(&request("GET", "/a")).is_some() {
                        claimed += 1;
                    }
                }
                claimed
            }));
        }

        let total: u64 = threads.into_iter().map(|t| t.join().unwrap()).sum();
        assert_eq!(total, 50);
        assert_eq!(store.mocked_endpoints()[0].seen_count(), 50);
    }

    #[test]
    fn duplicate_user_ids_are_rejected() {
        let store = RuleStore::new();
        store
            .add_request_rules(vec![rule_for("/a").with_id("dup")])
            .unwrap();

        let err = store
            .add_request_rules(vec![rule_for("/b").with_id("dup")])
            .unwrap_err();
        assert!(matches!(err, Error::DuplicateRuleId(id) if id == "dup"));
    }

    #[test]
    fn set_request_rules_replaces_the_table() {
        let store = RuleStore::new();
        store.add_request_rules(vec![rule_for("/a")]).unwrap();
        store.set_request_rules(vec![rule_for("/b")]).unwrap();

        assert!(store.match_request(&request("GET", "/a")).is_none());
        assert!(store.match_request(&request("GET", "/b")).is_some());
    }

    #[test]
    fn reset_drops_everything() {
        let store = RuleStore::new();
        store.add_request_rules(vec![rule_for("/a")]).unwrap();
        store.reset();
        assert!(store.mocked_endpoints().is_empty());
        assert!(store.match_request(&request("GET", "/a")).is_none());
    }

    #[test]
    fn pseudo_headers_are_rejected_at_registration() {
        let store = RuleStore::new();
        let rule = RequestRule::new(
            vec![RequestMatcher::Wildcard],
            RequestStep::Fixed(ResponseSpec::new(200).with_header(":status", "418")),
        );
        let err = store.add_request_rules(vec![rule]).unwrap_err();
        assert!(matches!(err, Error::InvalidRule(_)));
    }

    #[test]
    fn explanation_body_lists_rule_states() {
        let store = RuleStore::new();
        store
            .add_request_rules(vec![
                rule_for("/endpoint").with_completion(Completion::Once),
                rule_for("/endpoint").with_completion(Completion::Twice),
                rule_for("/endpoint").with_completion(Completion::Thrice),
                rule_for("/endpoint").with_completion(Completion::Times(4)),
                rule_for("/endpoint").with_completion(Completion::Always),
            ])
            .unwrap();

        // Fire eight requests: 1 + 2 + 3 fill the first three rules,
        // two more land on the fourth.
        for _ in 0..8 {
            store.match_request(&request("GET", "/endpoint")).unwrap();
        }

        let body = store.explain_unmatched(&request("GET", "/other"));

        let done_count = body.matches("(done)").count();
        assert_eq!(done_count, 3);
        assert!(body.contains("(seen 2)"));
        assert!(body.contains("(seen 0)"));
        assert!(body.contains("GET"));
        assert!(body.contains("/other"));
    }
}
