// Integration tests for the /oauth/google/* endpoints

use axum::{
    body::Body,
    http::{header, Request, StatusCode},
    Router,
};
use oauth_keeper::api::{create_oauth_router, OAuthAppState};
use oauth_keeper::config::KeeperConfig;
use oauth_keeper::service::Service;
use oauth_keeper::store::MemoryTokenStore;
use std::sync::Arc;
use tower::ServiceExt;

fn create_test_app(server: &mockito::Server) -> Router {
    let mut config = KeeperConfig::default();
    config.provider.client_id = "client-id".to_string();
    config.provider.client_secret = "client-secret".to_string();
    config.provider.redirect_uri = "http://localhost:9001/oauth/google/callback".to_string();
    config.provider.auth_url = format!("{}/auth", server.url());
    config.provider.token_url = format!("{}/token", server.url());

    let service = Service::with_store(config, Arc::new(MemoryTokenStore::new(10))).unwrap();
    create_oauth_router(OAuthAppState {
        controller: service.controller,
    })
}

async fn get(app: &Router, uri: &str) -> axum::response::Response {
    app.clone()
        .oneshot(Request::builder().uri(uri).body(Body::empty()).unwrap())
        .await
        .unwrap()
}

async fn json_body(response: axum::response::Response) -> serde_json::Value {
    let body = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap();
    serde_json::from_slice(&body).unwrap()
}

/// Status before any authorization reports no_token with 200.
#[tokio::test]
async fn test_status_without_token() {
    let server = mockito::Server::new_async().await;
    let app = create_test_app(&server);

    let response = get(&app, "/oauth/google/status").await;
    assert_eq!(response.status(), StatusCode::OK);

    let status = json_body(response).await;
    assert_eq!(status["status"], "no_token");
    assert_eq!(status["authenticated"], false);
}

#[tokio::test]
async fn test_token_without_authorization() {
    let server = mockito::Server::new_async().await;
    let app = create_test_app(&server);

    let response = get(&app, "/oauth/google/token").await;
    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
    assert_eq!(json_body(response).await["error_code"], "not_authenticated");
}

#[tokio::test]
async fn test_start_redirects_to_provider() {
    let server = mockito::Server::new_async().await;
    let app = create_test_app(&server);

    let response = get(&app, "/oauth/google/start").await;
    assert_eq!(response.status(), StatusCode::FOUND);

    let location = response.headers()[header::LOCATION].to_str().unwrap();
    assert!(location.starts_with(&format!("{}/auth?", server.url())));
    assert!(location.contains("client_id=client-id"));
    assert!(location.contains("response_type=code"));
    assert!(location.contains("access_type=offline"));
    assert!(location.contains("state="));
}

#[tokio::test]
async fn test_callback_parameter_errors() {
    let server = mockito::Server::new_async().await;
    let app = create_test_app(&server);

    let response = get(&app, "/oauth/google/callback?state=abc").await;
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    assert_eq!(json_body(response).await["error_code"], "missing_code");

    let response = get(&app, "/oauth/google/callback?code=abc").await;
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    assert_eq!(json_body(response).await["error_code"], "missing_state");

    let response = get(
        &app,
        "/oauth/google/callback?error=access_denied&error_description=User+cancelled",
    )
    .await;
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    let body = json_body(response).await;
    assert_eq!(body["error_code"], "oauth_error");
    assert!(body["error"].as_str().unwrap().contains("access_denied"));
}

#[tokio::test]
async fn test_callback_with_unknown_state() {
    let mut server = mockito::Server::new_async().await;
    let mock = server.mock("POST", "/token").expect(0).create_async().await;
    let app = create_test_app(&server);

    let response = get(&app, "/oauth/google/callback?code=abc&state=forged").await;
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);

    let body = json_body(response).await;
    assert_eq!(body["error_code"], "invalid_state");
    assert_eq!(body["reason"], "not_found");
    mock.assert_async().await;
}

/// start → callback → token → status, then a replayed callback.
#[tokio::test]
async fn test_full_authorization_flow() {
    let mut server = mockito::Server::new_async().await;
    let mock = server
        .mock("POST", "/token")
        .with_status(200)
        .with_header("content-type", "application/json")
        .with_body(r#"{"access_token":"ya29.api","refresh_token":"1//r","expires_in":3600,"scope":"openid email"}"#)
        .expect(1)
        .create_async()
        .await;
    let app = create_test_app(&server);

    let response = get(&app, "/oauth/google/start").await;
    let location = response.headers()[header::LOCATION].to_str().unwrap().to_string();
    let state = reqwest::Url::parse(&location)
        .unwrap()
        .query_pairs()
        .find(|(k, _)| k == "state")
        .map(|(_, v)| v.into_owned())
        .unwrap();

    let callback_uri = format!("/oauth/google/callback?code=auth-code&state={}", state);
    let response = get(&app, &callback_uri).await;
    assert_eq!(response.status(), StatusCode::OK);
    let body = json_body(response).await;
    assert_eq!(body["status"], "success");
    assert_eq!(body["scopes"], serde_json::json!(["openid", "email"]));
    assert!(body.get("access_token").is_none());

    let response = get(&app, "/oauth/google/token").await;
    assert_eq!(response.status(), StatusCode::OK);
    let body = json_body(response).await;
    assert_eq!(body["access_token"], "ya29.api");
    assert!(body["expires_at"].is_string());

    let response = get(&app, "/oauth/google/status").await;
    let body = json_body(response).await;
    assert_eq!(body["status"], "active");
    assert_eq!(body["has_refresh_token"], true);
    assert_eq!(body["last_authorization"], "complete");

    // Replay
    let response = get(&app, &callback_uri).await;
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    let body = json_body(response).await;
    assert_eq!(body["error_code"], "invalid_state");
    assert_eq!(body["reason"], "already_consumed");

    mock.assert_async().await;
}

fn state_from_location(response: &axum::response::Response) -> String {
    let location = response.headers()[header::LOCATION].to_str().unwrap();
    reqwest::Url::parse(location)
        .unwrap()
        .query_pairs()
        .find(|(k, _)| k == "state")
        .map(|(_, v)| v.into_owned())
        .unwrap()
}

/// A denied consent consumes the state: the same state cannot be reused
/// with a code afterwards.
#[tokio::test]
async fn test_denied_callback_consumes_state() {
    let mut server = mockito::Server::new_async().await;
    let mock = server.mock("POST", "/token").expect(0).create_async().await;
    let app = create_test_app(&server);

    let state = state_from_location(&get(&app, "/oauth/google/start").await);

    let response = get(
        &app,
        &format!("/oauth/google/callback?error=access_denied&state={}", state),
    )
    .await;
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    assert_eq!(json_body(response).await["error_code"], "oauth_error");

    let response = get(
        &app,
        &format!("/oauth/google/callback?code=auth-code&state={}", state),
    )
    .await;
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    let body = json_body(response).await;
    assert_eq!(body["error_code"], "invalid_state");
    assert_eq!(body["reason"], "already_consumed");

    let status = json_body(get(&app, "/oauth/google/status").await).await;
    assert_eq!(status["last_authorization"], "failed");
    mock.assert_async().await;
}

#[tokio::test]
async fn test_missing_code_consumes_state() {
    let server = mockito::Server::new_async().await;
    let app = create_test_app(&server);

    let state = state_from_location(&get(&app, "/oauth/google/start").await);

    let response = get(&app, &format!("/oauth/google/callback?state={}", state)).await;
    assert_eq!(json_body(response).await["error_code"], "missing_code");

    let response = get(
        &app,
        &format!("/oauth/google/callback?code=auth-code&state={}", state),
    )
    .await;
    assert_eq!(json_body(response).await["reason"], "already_consumed");
}

/// A refused code reports the provider's description in `details`.
#[tokio::test]
async fn test_exchange_rejection_details() {
    let mut server = mockito::Server::new_async().await;
    let _mock = server
        .mock("POST", "/token")
        .with_status(400)
        .with_header("content-type", "application/json")
        .with_body(r#"{"error":"invalid_grant","error_description":"Malformed auth code."}"#)
        .create_async()
        .await;
    let app = create_test_app(&server);

    let state = state_from_location(&get(&app, "/oauth/google/start").await);
    let response = get(
        &app,
        &format!("/oauth/google/callback?code=bad&state={}", state),
    )
    .await;
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);

    let body = json_body(response).await;
    assert_eq!(body["error_code"], "token_exchange_failed");
    assert_eq!(body["details"], "Malformed auth code.");
}
