//! Integration tests for the simulated user loop.

use std::time::Duration;
use tokio::time::Instant;
use wiremock::matchers::{header_exists, method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

use trade_bench::api::{Credentials, UserClient};
use trade_bench::config::SessionConfig;
use trade_bench::session::Session;
use trade_bench::worker::{run_user, UserConfig, UserOutcome};

fn info_answer() -> ResponseTemplate {
    ResponseTemplate::new(200).set_body_string(r#"{"cursor":3}"#)
}

async fn mount_happy_path(server: &MockServer, info: ResponseTemplate) {
    Mock::given(method("POST"))
        .and(path("/signup"))
        .respond_with(ResponseTemplate::new(200).set_body_string("{}"))
        .mount(server)
        .await;
    Mock::given(method("POST"))
        .and(path("/signin"))
        .respond_with(ResponseTemplate::new(200).set_body_string(r#"{"id":1,"name":"u"}"#))
        .mount(server)
        .await;
    Mock::given(method("GET"))
        .and(path("/info"))
        .respond_with(info)
        .mount(server)
        .await;
    Mock::given(method("GET"))
        .respond_with(ResponseTemplate::new(200))
        .mount(server)
        .await;
}

fn config(threshold: Duration) -> SessionConfig {
    SessionConfig::new()
        .with_attempt_timeout(Duration::from_secs(2))
        .with_retirement_threshold(threshold)
        .with_retry_interval(Duration::from_millis(10))
}

fn user_for(server: &MockServer, threshold: Duration) -> UserClient {
    user_with(server, &config(threshold))
}

fn user_with(server: &MockServer, config: &SessionConfig) -> UserClient {
    UserClient::new(
        Session::new(&server.uri(), config).expect("Failed to create session"),
        Credentials {
            bank_id: "b".to_string(),
            name: "u".to_string(),
            password: "p".to_string(),
        },
    )
}

fn user_config(test_duration: Duration) -> UserConfig {
    UserConfig {
        user_index: 0,
        test_duration,
        poll_interval: Duration::from_millis(50),
    }
}

#[tokio::test]
async fn user_finishes_when_duration_elapses() {
    let server = MockServer::start().await;
    mount_happy_path(&server, info_answer()).await;

    let outcome = run_user(
        user_for(&server, Duration::from_secs(1)),
        user_config(Duration::from_millis(300)),
        Instant::now(),
    )
    .await;

    assert_eq!(outcome, UserOutcome::Finished);
    let polls = server
        .received_requests()
        .await
        .unwrap()
        .iter()
        .filter(|r| r.url.path() == "/info")
        .count();
    assert!(polls >= 1, "expected at least one /info poll");
}

#[tokio::test]
async fn user_retires_on_slow_info() {
    let server = MockServer::start().await;
    mount_happy_path(&server, info_answer().set_delay(Duration::from_millis(500))).await;

    let outcome = run_user(
        user_for(&server, Duration::from_millis(200)),
        user_config(Duration::from_secs(5)),
        Instant::now(),
    )
    .await;

    assert_eq!(outcome, UserOutcome::Retired);
}

#[tokio::test]
async fn user_fails_on_rejected_signup() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/signup"))
        .respond_with(ResponseTemplate::new(400).set_body_string("bad"))
        .expect(1)
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .and(path("/signin"))
        .respond_with(ResponseTemplate::new(200))
        .expect(0)
        .mount(&server)
        .await;

    let outcome = run_user(
        user_for(&server, Duration::from_secs(1)),
        user_config(Duration::from_secs(5)),
        Instant::now(),
    )
    .await;

    assert_eq!(outcome, UserOutcome::Failed);
}

#[tokio::test]
async fn user_keeps_polling_through_cached_info() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/info"))
        .and(header_exists("if-none-match"))
        .respond_with(ResponseTemplate::new(304))
        .expect(1..)
        .mount(&server)
        .await;
    mount_happy_path(
        &server,
        info_answer()
            .insert_header("cache-control", "max-age=60")
            .insert_header("etag", "\"i\""),
    )
    .await;

    let cached = config(Duration::from_secs(1)).with_local_freshness(true);
    let outcome = run_user(
        user_with(&server, &cached),
        user_config(Duration::from_millis(300)),
        Instant::now(),
    )
    .await;
    assert_eq!(outcome, UserOutcome::Finished);

    let revalidating = run_user(
        user_for(&server, Duration::from_secs(1)),
        user_config(Duration::from_millis(300)),
        Instant::now(),
    )
    .await;
    assert_eq!(revalidating, UserOutcome::Finished);
}
