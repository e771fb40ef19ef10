//! End-to-end session behaviour against a mock HTTP server.

use std::net::TcpListener;
use std::sync::Arc;
use std::time::Duration;

use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use chrono::Utc;
use futures::future::join_all;
use keyport_core::api::HttpTokenRefresher;
use keyport_core::auth::{MemoryStore, RefreshCoordinator, Session, SessionEvent, TokenGrant};
use keyport_core::{ApiClient, ApiError, Config, Credential};
use reqwest::{Method, StatusCode};
use serde_json::json;
use tokio::sync::broadcast;
use wiremock::matchers::{body_json, header, method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

fn jwt_expiring_in(seconds: i64) -> String {
    let header = URL_SAFE_NO_PAD.encode(r#"{"alg":"HS256","typ":"JWT"}"#);
    let exp = Utc::now().timestamp() + seconds;
    let payload = URL_SAFE_NO_PAD.encode(format!(r#"{{"exp":{},"user_id":1}}"#, exp));
    format!("{}.{}.sig", header, payload)
}

fn client_for(server: &MockServer) -> ApiClient {
    let config = Config {
        api_base_url: server.uri(),
        ..Config::default()
    };
    ApiClient::new(&config, Arc::new(MemoryStore::new())).expect("api client")
}

fn bearer(token: &str) -> String {
    format!("Bearer {}", token)
}

fn drain(events: &mut broadcast::Receiver<SessionEvent>) -> Vec<SessionEvent> {
    let mut seen = Vec::new();
    while let Ok(event) = events.try_recv() {
        seen.push(event);
    }
    seen
}

async fn mount_refresh(server: &MockServer, old: &str, response: ResponseTemplate, times: u64) {
    Mock::given(method("POST"))
        .and(path("/api/auth/refresh/"))
        .and(header("authorization", bearer(old).as_str()))
        .respond_with(response)
        .expect(times)
        .mount(server)
        .await;
}

async fn mount_items(server: &MockServer, token: &str, response: ResponseTemplate) {
    Mock::given(method("GET"))
        .and(path("/api/items/"))
        .and(header("authorization", bearer(token).as_str()))
        .respond_with(response)
        .mount(server)
        .await;
}

fn refreshed(token: &str) -> ResponseTemplate {
    ResponseTemplate::new(200).set_body_json(json!({"status": "success", "data": {"access": token}}))
}

#[tokio::test]
async fn expired_credential_is_refreshed_and_call_replayed_once() {
    let server = MockServer::start().await;
    let old = jwt_expiring_in(-1);
    let new = jwt_expiring_in(3600);

    mount_refresh(&server, &old, refreshed(&new), 1).await;
    mount_items(&server, &old, ResponseTemplate::new(401)).await;
    mount_items(&server, &new, ResponseTemplate::new(200).set_body_json(json!({"items": [1, 2]}))).await;

    let api = client_for(&server);
    api.session().establish(TokenGrant::new(old.as_str()));
    let mut events = api.session().subscribe();

    let body: serde_json::Value = api.get_json("/api/items/").await.expect("retried call succeeds");
    assert_eq!(body["items"], json!([1, 2]));

    assert_eq!(api.session().credential(), Some(Credential::new(new.as_str())));
    assert_eq!(drain(&mut events), vec![SessionEvent::CredentialUpdated(Credential::new(new.as_str()))]);

    let requests = server.received_requests().await.unwrap();
    let item_calls = requests.iter().filter(|r| r.url.path() == "/api/items/").count();
    assert_eq!(item_calls, 2, "exactly one retry");
}

#[tokio::test]
async fn concurrent_failures_share_one_refresh() {
    let server = MockServer::start().await;
    let old = jwt_expiring_in(-1);
    let new = jwt_expiring_in(3600);

    mount_refresh(&server, &old, refreshed(&new).set_delay(Duration::from_millis(300)), 1).await;
    mount_items(&server, &old, ResponseTemplate::new(401)).await;
    mount_items(&server, &new, ResponseTemplate::new(200)).await;

    let api = client_for(&server);
    api.session().establish(TokenGrant::new(old.as_str()));
    let mut events = api.session().subscribe();

    let calls = (0..20).map(|_| api.send(api.request(Method::GET, "/api/items/")));
    let responses = join_all(calls).await;

    for response in responses {
        assert_eq!(response.expect("call completes").status(), StatusCode::OK);
    }
    assert_eq!(drain(&mut events).len(), 1);
    // expect(1) on the refresh mock is verified when the server drops
}

#[tokio::test]
async fn successful_call_never_refreshes() {
    let server = MockServer::start().await;
    let token = jwt_expiring_in(3600);

    mount_refresh(&server, &token, refreshed("unused"), 0).await;
    mount_items(&server, &token, ResponseTemplate::new(200)).await;

    let api = client_for(&server);
    api.session().establish(TokenGrant::new(token.as_str()));

    let response = api.send(api.request(Method::GET, "/api/items/")).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);
}

#[tokio::test]
async fn business_errors_pass_through_untouched() {
    let server = MockServer::start().await;
    let token = jwt_expiring_in(3600);

    mount_refresh(&server, &token, refreshed("unused"), 0).await;
    mount_items(
        &server,
        &token,
        ResponseTemplate::new(500).set_body_json(json!({"message": "database unavailable"})),
    )
    .await;

    let api = client_for(&server);
    api.session().establish(TokenGrant::new(token.as_str()));

    let response = api.send(api.request(Method::GET, "/api/items/")).await.unwrap();
    assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);

    match api.get_json::<serde_json::Value>("/api/items/").await {
        Err(ApiError::ServerError(message)) => assert_eq!(message, "database unavailable"),
        other => panic!("expected server error, got {other:?}"),
    }
    assert_eq!(api.session().credential(), Some(Credential::new(token.as_str())));
}

#[tokio::test]
async fn missing_credential_sends_no_header_and_skips_refresh() {
    let server = MockServer::start().await;

    Mock::given(method("POST"))
        .and(path("/api/auth/refresh/"))
        .respond_with(refreshed("unused"))
        .expect(0)
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/api/items/"))
        .respond_with(ResponseTemplate::new(401))
        .expect(1)
        .mount(&server)
        .await;

    let api = client_for(&server);
    let result = api.send(api.request(Method::GET, "/api/items/")).await;
    assert!(matches!(result, Err(ApiError::AuthenticationFailed)));

    let requests = server.received_requests().await.unwrap();
    assert_eq!(requests.len(), 1);
    assert!(!requests[0].headers.contains_key("authorization"));
}

#[tokio::test]
async fn rejected_refresh_terminates_session_once() {
    let server = MockServer::start().await;
    let old = jwt_expiring_in(-1);

    mount_refresh(
        &server,
        &old,
        ResponseTemplate::new(401).set_delay(Duration::from_millis(200)),
        1,
    )
    .await;
    mount_items(&server, &old, ResponseTemplate::new(401)).await;

    let api = client_for(&server);
    api.session().establish(TokenGrant::new(old.as_str()).with_refresh("expired-refresh"));
    let mut events = api.session().subscribe();

    let calls = (0..5).map(|_| api.send(api.request(Method::GET, "/api/items/")));
    for result in join_all(calls).await {
        assert!(matches!(result, Err(ApiError::AuthenticationFailed)));
    }

    assert!(api.session().credential().is_none());
    assert!(api.session().refresh_credential().is_none());
    assert_eq!(drain(&mut events), vec![SessionEvent::SessionTerminated]);
}

#[tokio::test]
async fn transient_refresh_failure_keeps_session() {
    let server = MockServer::start().await;
    let old = jwt_expiring_in(-1);

    mount_refresh(&server, &old, ResponseTemplate::new(502), 1).await;
    mount_items(&server, &old, ResponseTemplate::new(401)).await;

    let api = client_for(&server);
    api.session().establish(TokenGrant::new(old.as_str()));
    let mut events = api.session().subscribe();

    let result = api.send(api.request(Method::GET, "/api/items/")).await;
    assert!(matches!(result, Err(ApiError::AuthenticationFailed)));

    assert_eq!(api.session().credential(), Some(Credential::new(old.as_str())));
    assert!(drain(&mut events).is_empty());
}

#[tokio::test]
async fn refresh_without_token_in_body_is_transient() {
    let server = MockServer::start().await;
    let old = jwt_expiring_in(-1);

    mount_refresh(&server, &old, ResponseTemplate::new(200).set_body_json(json!({"data": {}})), 1).await;

    let api = client_for(&server);
    api.session().establish(TokenGrant::new(old.as_str()));

    assert!(api.coordinator().refresh().await.is_none());
    assert!(api.session().is_authenticated());
}

#[tokio::test]
async fn unreachable_refresh_endpoint_is_transient() {
    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    let addr = listener.local_addr().unwrap();
    drop(listener); // release the port so the exchange fails with ECONNREFUSED

    let client = reqwest::Client::new();
    let session = Session::new(Arc::new(MemoryStore::new()));
    let refresher = HttpTokenRefresher::new(client.clone(), format!("http://{}/api/auth/refresh/", addr));
    let coordinator = RefreshCoordinator::new(session.clone(), Arc::new(refresher));
    session.establish(TokenGrant::new("stale"));

    assert!(coordinator.refresh().await.is_none());
    assert_eq!(session.credential(), Some(Credential::new("stale")));
}

#[tokio::test]
async fn retried_call_result_is_returned_even_if_it_fails() {
    let server = MockServer::start().await;
    let old = jwt_expiring_in(-1);
    let new = jwt_expiring_in(3600);

    mount_refresh(&server, &old, refreshed(&new), 1).await;
    mount_items(&server, &old, ResponseTemplate::new(401)).await;
    mount_items(&server, &new, ResponseTemplate::new(403)).await;

    let api = client_for(&server);
    api.session().establish(TokenGrant::new(old.as_str()));

    let response = api.send(api.request(Method::GET, "/api/items/")).await.unwrap();
    assert_eq!(response.status(), StatusCode::FORBIDDEN);

    let requests = server.received_requests().await.unwrap();
    assert_eq!(requests.len(), 3, "original call, refresh, single retry");
}

#[tokio::test]
async fn late_rejection_reuses_refresh_that_already_landed() {
    let server = MockServer::start().await;
    let old = jwt_expiring_in(-1);
    let new = jwt_expiring_in(3600);

    mount_refresh(&server, &old, refreshed(&new), 1).await;
    mount_items(&server, &old, ResponseTemplate::new(401)).await;
    mount_items(&server, &new, ResponseTemplate::new(200)).await;
    // The slow endpoint only rejects the old credential after the refresh is done
    Mock::given(method("GET"))
        .and(path("/api/reports/"))
        .and(header("authorization", bearer(&old).as_str()))
        .respond_with(ResponseTemplate::new(401).set_delay(Duration::from_millis(300)))
        .expect(1)
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/api/reports/"))
        .and(header("authorization", bearer(&new).as_str()))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({"rows": 3})))
        .expect(1)
        .mount(&server)
        .await;

    let api = client_for(&server);
    api.session().establish(TokenGrant::new(old.as_str()));

    let (slow, fast) = tokio::join!(
        api.send(api.request(Method::GET, "/api/reports/")),
        api.send(api.request(Method::GET, "/api/items/")),
    );

    assert_eq!(fast.unwrap().status(), StatusCode::OK);
    assert_eq!(slow.unwrap().status(), StatusCode::OK);
    assert_eq!(api.session().credential(), Some(Credential::new(new.as_str())));

    let refreshes = server
        .received_requests()
        .await
        .unwrap()
        .iter()
        .filter(|r| r.url.path() == "/api/auth/refresh/")
        .count();
    assert_eq!(refreshes, 1);
}

#[tokio::test]
async fn streaming_body_returns_original_rejection_after_refresh() {
    let server = MockServer::start().await;
    let old = jwt_expiring_in(-1);
    let new = jwt_expiring_in(3600);

    mount_refresh(&server, &old, refreshed(&new), 1).await;
    Mock::given(method("POST"))
        .and(path("/api/uploads/"))
        .respond_with(ResponseTemplate::new(401))
        .expect(1)
        .mount(&server)
        .await;

    let api = client_for(&server);
    api.session().establish(TokenGrant::new(old.as_str()));

    let chunks: Vec<Result<&'static str, std::io::Error>> = vec![Ok("part-1,"), Ok("part-2")];
    let body = reqwest::Body::wrap_stream(futures::stream::iter(chunks));
    let response = api
        .send(api.request(Method::POST, "/api/uploads/").body(body))
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
    // The refresh still happened, so the next call goes out with the new credential
    assert_eq!(api.session().credential(), Some(Credential::new(new.as_str())));
}

#[tokio::test]
async fn post_json_replays_body_after_refresh() {
    let server = MockServer::start().await;
    let old = jwt_expiring_in(-1);
    let new = jwt_expiring_in(3600);
    let payload = json!({"name": "widget", "quantity": 3});

    mount_refresh(&server, &old, refreshed(&new), 1).await;
    Mock::given(method("POST"))
        .and(path("/api/items/"))
        .and(header("authorization", bearer(&old).as_str()))
        .respond_with(ResponseTemplate::new(401))
        .expect(1)
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .and(path("/api/items/"))
        .and(header("authorization", bearer(&new).as_str()))
        .and(body_json(&payload))
        .respond_with(ResponseTemplate::new(201).set_body_json(json!({"id": 42})))
        .expect(1)
        .mount(&server)
        .await;

    let api = client_for(&server);
    api.session().establish(TokenGrant::new(old.as_str()));

    let created: serde_json::Value = api.post_json("/api/items/", &payload).await.unwrap();
    assert_eq!(created["id"], 42);
}

#[tokio::test]
async fn login_then_refresh_sends_refresh_credential() {
    let server = MockServer::start().await;
    let old = jwt_expiring_in(-1);
    let new = jwt_expiring_in(3600);

    Mock::given(method("POST"))
        .and(path("/api/auth/login/"))
        .and(body_json(json!({"email": "user@example.com", "password": "hunter22"})))
        .respond_with(
            ResponseTemplate::new(200).set_body_json(json!({"data": {"access": old.as_str(), "refresh": "refresh-1"}})),
        )
        .expect(1)
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .and(path("/api/auth/refresh/"))
        .and(header("authorization", bearer(&old).as_str()))
        .and(body_json(json!({"refresh": "refresh-1"})))
        .respond_with(refreshed(&new))
        .expect(1)
        .mount(&server)
        .await;

    let api = client_for(&server);
    api.login("user@example.com", "hunter22").await.expect("login");
    assert_eq!(api.session().refresh_credential(), Some(Credential::new("refresh-1")));

    assert_eq!(api.coordinator().refresh().await, Some(Credential::new(new.as_str())));
    // The server did not rotate the refresh credential
    assert_eq!(api.session().refresh_credential(), Some(Credential::new("refresh-1")));
}

#[tokio::test]
async fn login_failure_surfaces_server_message() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/api/auth/login/"))
        .respond_with(ResponseTemplate::new(400).set_body_json(json!({"message": "Wrong email or password"})))
        .mount(&server)
        .await;

    let api = client_for(&server);
    match api.login("user@example.com", "nope").await {
        Err(ApiError::LoginFailed(message)) => assert_eq!(message, "Wrong email or password"),
        other => panic!("expected login failure, got {other:?}"),
    }
    assert!(!api.session().is_authenticated());
}

#[tokio::test]
async fn login_without_token_is_invalid_response() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/api/auth/login/"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({"data": {}})))
        .mount(&server)
        .await;

    let api = client_for(&server);
    assert!(matches!(
        api.login("user@example.com", "pw").await,
        Err(ApiError::InvalidResponse(_))
    ));
}

#[tokio::test]
async fn register_reports_whether_session_started() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/api/auth/register/"))
        .and(body_json(json!({"name": "Ana", "email": "ana@example.com", "password": "Secret123"})))
        .respond_with(ResponseTemplate::new(201).set_body_json(json!({"data": {"access": "a1", "refresh": "r1"}})))
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .and(path("/api/auth/register/"))
        .and(body_json(json!({"name": "Bo", "email": "bo@example.com", "password": "Secret123"})))
        .respond_with(ResponseTemplate::new(201).set_body_json(json!({"message": "Account created"})))
        .mount(&server)
        .await;

    let api = client_for(&server);
    assert!(api.register("Ana", "ana@example.com", "Secret123").await.unwrap());
    assert_eq!(api.session().credential(), Some(Credential::new("a1")));

    api.logout();
    assert!(!api.register("Bo", "bo@example.com", "Secret123").await.unwrap());
    assert!(!api.session().is_authenticated());
}

#[tokio::test]
async fn profile_is_fetched_through_the_wrapper() {
    let server = MockServer::start().await;
    let token = jwt_expiring_in(3600);
    Mock::given(method("GET"))
        .and(path("/api/auth/profile/"))
        .and(header("authorization", bearer(&token).as_str()))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "data": {"name": "Ana", "email": "ana@example.com", "saldo": 5000, "is_staff": true}
        })))
        .mount(&server)
        .await;

    let api = client_for(&server);
    api.session().establish(TokenGrant::new(token.as_str()));

    let profile = api.profile().await.unwrap();
    assert_eq!(profile.name, "Ana");
    assert_eq!(profile.saldo, 5000.0);
    assert!(profile.is_staff);
}

#[tokio::test]
async fn logout_clears_and_announces() {
    let server = MockServer::start().await;
    let api = client_for(&server);
    api.session().establish(TokenGrant::new("a").with_refresh("r"));
    let mut events = api.session().subscribe();

    api.logout();

    assert!(!api.session().is_authenticated());
    assert!(api.session().refresh_credential().is_none());
    assert_eq!(drain(&mut events), vec![SessionEvent::SessionTerminated]);
}
