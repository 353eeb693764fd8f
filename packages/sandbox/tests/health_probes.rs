// ABOUTME: Composite health-check semantics against a mock HTTP server
// ABOUTME: Agent probe wants 2xx; companion probe only fails on 5xx; network errors are false

use cubby_sandbox::HealthChecker;
use std::time::Duration;
use wiremock::matchers::{method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

fn checker() -> HealthChecker {
    HealthChecker::new(Duration::from_millis(500))
}

async fn server_with(agent_status: u16, app_status: u16) -> MockServer {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/healthz"))
        .respond_with(ResponseTemplate::new(agent_status))
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/"))
        .respond_with(ResponseTemplate::new(app_status))
        .mount(&server)
        .await;
    server
}

#[tokio::test]
async fn test_both_services_healthy() {
    let server = server_with(200, 200).await;
    assert!(checker().check("box-1", &server.uri()).await);
}

#[tokio::test]
async fn test_agent_server_error_fails() {
    let server = server_with(500, 200).await;
    assert!(!checker().check("box-1", &server.uri()).await);
}

#[tokio::test]
async fn test_agent_client_error_fails() {
    // The agent health endpoint must answer 2xx; even a 404 means the
    // agent is not the process answering.
    let server = server_with(404, 200).await;
    assert!(!checker().check("box-1", &server.uri()).await);
}

#[tokio::test]
async fn test_companion_server_error_fails() {
    let server = server_with(200, 503).await;
    assert!(!checker().check("box-1", &server.uri()).await);
}

#[tokio::test]
async fn test_companion_client_error_is_still_alive() {
    // 4xx from the app root (auth wall, unknown route) means the process
    // is up, which is all the probe asks.
    let server = server_with(200, 404).await;
    assert!(checker().check("box-1", &server.uri()).await);
}

#[tokio::test]
async fn test_companion_redirect_is_alive() {
    let server = server_with(200, 302).await;
    assert!(checker().check("box-1", &server.uri()).await);
}

#[tokio::test]
async fn test_connection_refused_is_false_not_an_error() {
    // Nothing listens here; the verdict is a plain false.
    assert!(!checker().check("box-1", "http://127.0.0.1:1").await);
}

#[tokio::test]
async fn test_trailing_slash_in_url_is_tolerated() {
    let server = server_with(200, 200).await;
    let url = format!("{}/", server.uri());
    assert!(checker().check("box-1", &url).await);
}
