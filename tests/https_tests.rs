extern crate intermock;

use intermock::{ProxyServerBuilder, RequestMatcher, RequestRule, RequestStep, ResponseSpec};

/// TLS is upgraded on demand with a leaf minted for the SNI; a client that
/// trusts the CA connects cleanly.
#[tokio::test]
async fn https_interception_test() {
    // Arrange
    let _ = env_logger::try_init();
    let server = ProxyServerBuilder::new().start().await.unwrap();
    server
        .add_request_rules(vec![RequestRule::new(
            vec![RequestMatcher::PathPrefix("/secure".to_string())],
            RequestStep::Fixed(ResponseSpec::new(200).with_body("encrypted hello")),
        )])
        .unwrap();

    let ca = reqwest::Certificate::from_pem(server.ca_cert_pem().as_bytes()).unwrap();
    let client = reqwest::Client::builder()
        .add_root_certificate(ca)
        .build()
        .unwrap();

    // Act
    let response = client
        .get(format!("https://localhost:{}/secure", server.port()))
        .send()
        .await
        .unwrap();

    // Assert
    assert_eq!(response.status(), 200);
    assert_eq!(response.text().await.unwrap(), "encrypted hello");
}

/// The scheme surfaced on the unified request reflects the TLS unwrap.
#[tokio::test]
async fn https_request_scheme_test() {
    // Arrange
    let _ = env_logger::try_init();
    use intermock::{EventKind, ProxyEvent};
    use std::sync::{Arc, Mutex};

    let server = ProxyServerBuilder::new().start().await.unwrap();
    server
        .add_request_rules(vec![RequestRule::new(
            vec![RequestMatcher::Wildcard],
            RequestStep::Fixed(ResponseSpec::new(200)),
        )])
        .unwrap();

    let seen_scheme = Arc::new(Mutex::new(None));
    let capture = seen_scheme.clone();
    server.on(
        EventKind::Request,
        Arc::new(move |event| {
            if let ProxyEvent::Request(request) = event {
                *capture.lock().unwrap() = Some(request.scheme().to_string());
            }
        }),
    );

    let ca = reqwest::Certificate::from_pem(server.ca_cert_pem().as_bytes()).unwrap();
    let client = reqwest::Client::builder()
        .add_root_certificate(ca)
        .build()
        .unwrap();

    // Act
    let response = client
        .get(format!("https://localhost:{}/x", server.port()))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 200);
    tokio::time::sleep(std::time::Duration::from_millis(100)).await;

    // Assert
    assert_eq!(seen_scheme.lock().unwrap().as_deref(), Some("https"));
}

/// An untrusting client fails the handshake and the failure is observable
/// as a TLS client error event.
#[tokio::test]
async fn untrusted_client_surfaces_tls_error_event_test() {
    // Arrange
    let _ = env_logger::try_init();
    use intermock::{EventKind, ProxyEvent};
    use std::sync::{Arc, Mutex};

    let server = ProxyServerBuilder::new().start().await.unwrap();

    let errors = Arc::new(Mutex::new(Vec::new()));
    let capture = errors.clone();
    server.on(
        EventKind::TlsClientError,
        Arc::new(move |event| {
            if let ProxyEvent::TlsClientError { error, .. } = event {
                capture.lock().unwrap().push(error.clone());
            }
        }),
    );

    // A client with default roots will not trust the ephemeral CA.
    let client = reqwest::Client::new();

    // Act
    let result = client
        .get(format!("https://localhost:{}/x", server.port()))
        .send()
        .await;

    // Assert
    assert!(result.is_err());
    tokio::time::sleep(std::time::Duration::from_millis(200)).await;
    assert!(!errors.lock().unwrap().is_empty());
}
