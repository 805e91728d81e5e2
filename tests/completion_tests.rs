extern crate intermock;

use intermock::{
    Completion, ProxyServerBuilder, RequestMatcher, RequestRule, RequestStep, ResponseSpec,
};

fn endpoint_rule(completion: Completion) -> RequestRule {
    RequestRule::new(
        vec![
            RequestMatcher::Method("GET".to_string()),
            RequestMatcher::PathPrefix("/endpoint".to_string()),
        ],
        RequestStep::Fixed(ResponseSpec::new(200).with_body("hit")),
    )
    .with_completion(completion)
}

/// A `once` rule serves exactly one request, then falls out of matching.
#[tokio::test]
async fn once_rule_exhausts_test() {
    // Arrange
    let _ = env_logger::try_init();
    let server = ProxyServerBuilder::new().start().await.unwrap();
    let handles = server
        .add_request_rules(vec![endpoint_rule(Completion::Once)])
        .unwrap();

    // Act + Assert
    let first = reqwest::get(server.url("/endpoint")).await.unwrap();
    assert_eq!(first.status(), 200);

    let second = reqwest::get(server.url("/endpoint")).await.unwrap();
    assert_eq!(second.status(), 503);

    assert_eq!(handles[0].seen_count(), 1);
}

/// Seen-counts increment exactly once per matched request, even when
/// requests run concurrently.
#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_seen_count_test() {
    // Arrange
    let _ = env_logger::try_init();
    let server = ProxyServerBuilder::new().start().await.unwrap();
    let handles = server
        .add_request_rules(vec![endpoint_rule(Completion::Always)])
        .unwrap();

    // Act
    let mut tasks = Vec::new();
    let base = server.url("/endpoint");
    for _ in 0..20 {
        let url = base.clone();
        tasks.push(tokio::spawn(async move {
            reqwest::get(url).await.unwrap().status()
        }));
    }
    for task in tasks {
        assert_eq!(task.await.unwrap(), 200);
    }

    // Assert
    assert_eq!(handles[0].seen_count(), 20);
    assert_eq!(handles[0].seen_requests().len(), 20);
}

/// Five rules with staggered completion predicates drain in order; the
/// explanation body for a later unmatched request reports their states.
#[tokio::test]
async fn completion_state_explanation_test() {
    // Arrange
    let _ = env_logger::try_init();
    let server = ProxyServerBuilder::new().start().await.unwrap();

    server
        .add_request_rules(vec![
            endpoint_rule(Completion::Once),
            endpoint_rule(Completion::Twice),
            endpoint_rule(Completion::Thrice),
            endpoint_rule(Completion::Times(4)),
            endpoint_rule(Completion::Always),
        ])
        .unwrap();

    // Act: eight requests exhaust the first three rules (1 + 2 + 3) and
    // leave the fourth at two of four.
    for _ in 0..8 {
        let response = reqwest::get(server.url("/endpoint")).await.unwrap();
        assert_eq!(response.status(), 200);
    }

    let response = reqwest::get(server.url("/other-path")).await.unwrap();

    // Assert
    assert_eq!(response.status(), 503);
    let body = response.text().await.unwrap();
    assert_eq!(body.matches("(done)").count(), 3);
    assert!(body.contains("(seen 2)"));
    assert!(body.contains("(seen 0)"));
}

/// Higher-priority rules win regardless of insertion order.
#[tokio::test]
async fn priority_test() {
    // Arrange
    let _ = env_logger::try_init();
    let server = ProxyServerBuilder::new().start().await.unwrap();

    server
        .add_request_rules(vec![
            RequestRule::new(
                vec![RequestMatcher::Wildcard],
                RequestStep::Fixed(ResponseSpec::new(200).with_body("low")),
            ),
            RequestRule::new(
                vec![RequestMatcher::Wildcard],
                RequestStep::Fixed(ResponseSpec::new(200).with_body("high")),
            )
            .with_priority(10),
        ])
        .unwrap();

    // Act
    let response = reqwest::get(server.url("/any")).await.unwrap();

    // Assert
    assert_eq!(response.text().await.unwrap(), "high");
}

/// User-supplied rule ids must be unique.
#[tokio::test]
async fn duplicate_rule_id_test() {
    // Arrange
    let _ = env_logger::try_init();
    let server = ProxyServerBuilder::new().start().await.unwrap();

    server
        .add_request_rules(vec![RequestRule::new(
            vec![RequestMatcher::Wildcard],
            RequestStep::Fixed(ResponseSpec::new(200)),
        )
        .with_id("my-rule")])
        .unwrap();

    // Act
    let result = server.add_request_rules(vec![RequestRule::new(
        vec![RequestMatcher::Wildcard],
        RequestStep::Fixed(ResponseSpec::new(200)),
    )
    .with_id("my-rule")]);

    // Assert
    assert!(result.is_err());
}

/// Endpoint handles expose explanations composed from matcher and step
/// descriptions.
#[tokio::test]
async fn endpoint_explanation_test() {
    // Arrange
    let _ = env_logger::try_init();
    let server = ProxyServerBuilder::new().start().await.unwrap();
    let handles = server
        .add_request_rules(vec![endpoint_rule(Completion::Twice)])
        .unwrap();

    // Assert
    let explanation = handles[0].explanation();
    assert!(explanation.contains("GET requests"));
    assert!(explanation.contains("/endpoint"));
    assert!(explanation.contains("twice"));
}
