use httpmock::prelude::*;
use nexus_backend::config::ControlSettings;
use nexus_backend::runner_client::RunnerClient;
use serde_json::json;

fn settings(base_url: &str) -> ControlSettings {
    let mut settings = ControlSettings::from_env();
    settings.runner_base_url = base_url.to_string();
    settings.runner_shared_secret = "client-secret".into();
    settings.app_jwt_alg = "HS256".into();
    settings.runner_token_ttl_seconds = 60;
    settings
}

#[tokio::test]
async fn calls_carry_a_bearer_token_and_parse_success_bodies() {
    let server = MockServer::start_async().await;
    let mock = server
        .mock_async(|when, then| {
            when.method(POST)
                .path("/internal/tenants/abc123/start")
                .header_exists("authorization");
            then.status(200)
                .json_body(json!({"tenant_id": "abc123", "ok": true, "detail": "started"}));
        })
        .await;

    let client = RunnerClient::new(&settings(&server.base_url()));
    let body = client.start("abc123", None).await.unwrap();
    assert_eq!(body["detail"], json!("started"));
    mock.assert_async().await;
}

#[tokio::test]
async fn error_details_map_to_code_and_message() {
    let server = MockServer::start_async().await;
    server
        .mock_async(|when, then| {
            when.method(POST).path("/internal/tenants/abc123/apply-config");
            then.status(503).json_body(json!({
                "detail": {"error": "docker_unavailable", "message": "engine down"}
            }));
        })
        .await;

    let client = RunnerClient::new(&settings(&server.base_url()));
    let err = client
        .apply_config("abc123", &json!({"env": {}}))
        .await
        .unwrap_err();
    assert_eq!(err.status, 503);
    assert_eq!(err.code, "docker_unavailable");
    assert_eq!(err.message, "engine down");
}

#[tokio::test]
async fn string_details_keep_the_generic_code() {
    let server = MockServer::start_async().await;
    server
        .mock_async(|when, then| {
            when.method(POST).path("/internal/tenants/abc123/stop");
            then.status(404).json_body(json!({"detail": "Not Found"}));
        })
        .await;

    let client = RunnerClient::new(&settings(&server.base_url()));
    let err = client.stop("abc123").await.unwrap_err();
    assert_eq!(err.status, 404);
    assert_eq!(err.code, "runner_error");
    assert_eq!(err.message, "Not Found");
}

#[tokio::test]
async fn unreachable_runner_is_a_transport_error() {
    // Nothing listens on this port.
    let client = RunnerClient::new(&settings("http://127.0.0.1:1"));
    let err = client.health("abc123").await.unwrap_err();
    assert_eq!(err.status, 502);
    assert_eq!(err.code, "runner_http_error");
}

#[tokio::test]
async fn empty_bodies_decode_to_an_empty_object() {
    let server = MockServer::start_async().await;
    server
        .mock_async(|when, then| {
            when.method(POST).path("/internal/tenants/abc123/whatsapp/disconnect");
            then.status(200);
        })
        .await;

    let client = RunnerClient::new(&settings(&server.base_url()));
    let body = client.disconnect("abc123").await.unwrap();
    assert!(body.as_object().map(|o| o.is_empty()).unwrap_or(false));
}
