//! End-to-end tests for the federation HTTP surface, from the perspective
//! of a remote peer instance talking to our axum router.

use amityvox_api::{build_router, AppState};
use amityvox_core::events::EventBus;
use amityvox_federation::hlc::Hlc;
use amityvox_federation::protocol::FederatedMessage;
use amityvox_federation::{signing, FederationConfig, FederationService};
use axum::body::Body;
use axum::extract::ConnectInfo;
use axum::http::{Request, StatusCode};
use ed25519_dalek::SigningKey;
use serde_json::{json, Value};
use std::net::SocketAddr;
use std::sync::Arc;
use tower::ServiceExt;

async fn build_state() -> AppState {
    let pool = amityvox_db::create_pool("sqlite::memory:", 1)
        .await
        .expect("pool");
    amityvox_db::run_migrations(&pool).await.expect("migrations");
    let bus = EventBus::new(64);
    let federation = FederationService::bootstrap(
        pool.clone(),
        bus.clone(),
        FederationConfig::new("a.example"),
        SigningKey::from_bytes(&[7u8; 32]),
    )
    .await
    .expect("service");
    AppState {
        db: pool,
        bus,
        federation,
        permission_cache: amityvox_core::build_permission_cache(),
    }
}

/// Register instance B directly in the DB and return its signing key.
async fn seed_remote(state: &AppState) -> SigningKey {
    let key = SigningKey::from_bytes(&[11u8; 32]);
    let pem = signing::public_key_pem(&key).expect("pem");
    let fingerprint = signing::key_fingerprint(&pem).expect("fp");
    amityvox_db::instances::insert_instance(
        &state.db,
        &amityvox_db::instances::NewInstance {
            id: "B",
            domain: "b.example",
            public_key: &pem,
            key_fingerprint: &fingerprint,
            federation_mode: "open",
            software: "amityvox",
            version: "0.3.0",
            shorthand: None,
            voice_url: None,
            voice_mode: None,
            is_local: false,
        },
    )
    .await
    .expect("remote instance");
    key
}

async fn seed_home_guild(state: &AppState) {
    amityvox_db::guilds::create_guild(&state.db, "G", "guild", "owner", None)
        .await
        .expect("guild");
    amityvox_db::channels::upsert_channel(&state.db, "C", "G", "general", None, 0, None, 0, false)
        .await
        .expect("channel");
}

fn signed_body<T: serde::Serialize>(key: &SigningKey, sender: &str, value: &T) -> String {
    signing::sign_value(key, sender, value)
        .expect("sign")
        .to_json()
        .expect("encode")
}

async fn send(router: axum::Router, request: Request<Body>) -> axum::response::Response {
    let addr = SocketAddr::from(([203, 0, 113, 5], 40000));
    let mut request = request;
    request.extensions_mut().insert(ConnectInfo(addr));
    router.oneshot(request).await.expect("request")
}

async fn body_json(response: axum::response::Response) -> Value {
    let bytes = axum::body::to_bytes(response.into_body(), 1 << 20)
        .await
        .expect("body");
    serde_json::from_slice(&bytes).expect("json")
}

fn post(path: &str, body: String) -> Request<Body> {
    Request::builder()
        .method("POST")
        .uri(path)
        .header("content-type", "application/json")
        .body(Body::from(body))
        .expect("request")
}

#[tokio::test]
async fn discovery_document_is_served_with_cache_headers() {
    let state = build_state().await;
    let router = build_router(state);

    let response = send(
        router,
        Request::builder()
            .uri("/.well-known/amityvox")
            .body(Body::empty())
            .expect("request"),
    )
    .await;

    assert_eq!(response.status(), StatusCode::OK);
    let cache = response
        .headers()
        .get("cache-control")
        .and_then(|v| v.to_str().ok())
        .unwrap_or_default()
        .to_string();
    assert!(cache.contains("max-age=3600"));

    let doc = body_json(response).await;
    assert_eq!(doc["domain"], "a.example");
    assert_eq!(doc["api_endpoint"], "https://a.example/federation/v1");
    assert!(doc["public_key"]
        .as_str()
        .expect("pem")
        .starts_with("-----BEGIN PUBLIC KEY-----"));
}

#[tokio::test]
async fn inbox_accepts_a_signed_message_event() {
    let state = build_state().await;
    let key = seed_remote(&state).await;
    seed_home_guild(&state).await;
    amityvox_db::guilds::create_guild(&state.db, "RG", "remote guild", "owner@B", Some("B"))
        .await
        .expect("remote guild");
    amityvox_db::channels::upsert_channel(&state.db, "RC", "RG", "general", None, 0, None, 0, false)
        .await
        .expect("remote channel");
    let router = build_router(state.clone());

    let msg = FederatedMessage {
        event_type: "MESSAGE_CREATE".to_string(),
        origin_id: "B".to_string(),
        hlc: Hlc::new(1000, 0),
        guild_id: Some("RG".to_string()),
        channel_id: Some("RC".to_string()),
        data: json!({
            "id": "M",
            "author_id": "U@B",
            "content": "hi",
            "created_at": "2024-01-01T00:00:00Z"
        }),
    };
    let response = send(
        router,
        post("/federation/v1/inbox", signed_body(&key, "B", &msg)),
    )
    .await;

    assert_eq!(response.status(), StatusCode::ACCEPTED);
    assert_eq!(body_json(response).await["status"], "accepted");
    assert!(amityvox_db::messages::get_message(&state.db, "M")
        .await
        .expect("query")
        .is_some());
}

#[tokio::test]
async fn inbox_rejects_unknown_senders_with_403() {
    let state = build_state().await;
    let router = build_router(state);
    let ghost_key = SigningKey::from_bytes(&[9u8; 32]);

    let msg = FederatedMessage {
        event_type: "TYPING_START".to_string(),
        origin_id: "GHOST".to_string(),
        hlc: Hlc::new(1, 0),
        guild_id: None,
        channel_id: None,
        data: json!({"user_id": "U"}),
    };
    let response = send(
        router,
        post("/federation/v1/inbox", signed_body(&ghost_key, "GHOST", &msg)),
    )
    .await;
    assert_eq!(response.status(), StatusCode::FORBIDDEN);
}

#[tokio::test]
async fn malformed_inbox_body_is_a_400() {
    let state = build_state().await;
    let router = build_router(state);
    let response = send(
        router,
        post("/federation/v1/inbox", "{not json".to_string()),
    )
    .await;
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn manage_member_join_redeems_invite_then_410s() {
    let state = build_state().await;
    let key = seed_remote(&state).await;
    seed_home_guild(&state).await;
    amityvox_db::invites::create_invite(&state.db, "welcome", "G", Some("C"), None, 1, None)
        .await
        .expect("invite");

    let join = |user: &str| {
        json!({
            "action": "member_join",
            "user_id": user,
            "data": {"code": "welcome", "username": "remote"}
        })
    };

    let response = send(
        build_router(state.clone()),
        post(
            "/federation/v1/guilds/G/manage",
            signed_body(&key, "B", &join("U@B")),
        ),
    )
    .await;
    assert_eq!(response.status(), StatusCode::CREATED);
    let body = body_json(response).await;
    assert_eq!(body["ok"], true);

    let response = send(
        build_router(state.clone()),
        post(
            "/federation/v1/guilds/G/manage",
            signed_body(&key, "B", &join("U2@B")),
        ),
    )
    .await;
    assert_eq!(response.status(), StatusCode::GONE);
    let body = body_json(response).await;
    assert_eq!(body["ok"], false);
    assert!(body["error"].as_str().expect("error").contains("gone"));

    let invite = amityvox_db::invites::get_invite(&state.db, "welcome")
        .await
        .expect("query")
        .expect("row");
    assert_eq!(invite.uses, 1);
}

#[tokio::test]
async fn sync_serves_only_authorized_guilds() {
    let state = build_state().await;
    let key = seed_remote(&state).await;
    seed_home_guild(&state).await;
    amityvox_db::federation_events::append_event(
        &state.db,
        "E1",
        state.federation.local_id(),
        "MESSAGE_CREATE",
        Some("G"),
        Some("C"),
        5,
        0,
        &json!({"id": "M"}),
        "2024-01-01T00:00:00Z",
    )
    .await
    .expect("event");
    amityvox_db::channel_peers::add_channel_peer(&state.db, "C", "B")
        .await
        .expect("channel peer");

    let request = json!({"last_seen_hlc": {"wall_ms": 0, "counter": 0}, "guild_ids": ["G"]});
    let response = send(
        build_router(state.clone()),
        post("/federation/v1/sync", signed_body(&key, "B", &request)),
    )
    .await;
    assert_eq!(response.status(), StatusCode::OK);
    let body = body_json(response).await;
    assert_eq!(body["truncated"], false);
    assert_eq!(body["events"].as_array().expect("events").len(), 1);

    // Remove the entitlement: same request now returns nothing.
    amityvox_db::channel_peers::remove_channel_peer(&state.db, "C", "B")
        .await
        .expect("remove");
    let response = send(
        build_router(state),
        post("/federation/v1/sync", signed_body(&key, "B", &request)),
    )
    .await;
    let body = body_json(response).await;
    assert!(body["events"].as_array().expect("events").is_empty());
}

#[tokio::test]
async fn guild_preview_is_404_unless_discoverable() {
    let state = build_state().await;
    seed_home_guild(&state).await;

    let response = send(
        build_router(state.clone()),
        Request::builder()
            .uri("/federation/v1/guilds/G/preview")
            .body(Body::empty())
            .expect("request"),
    )
    .await;
    assert_eq!(response.status(), StatusCode::NOT_FOUND);

    amityvox_db::guilds::update_guild_fields(&state.db, "G", None, None, Some(true), None)
        .await
        .expect("discoverable");
    let response = send(
        build_router(state),
        Request::builder()
            .uri("/federation/v1/guilds/G/preview")
            .body(Body::empty())
            .expect("request"),
    )
    .await;
    assert_eq!(response.status(), StatusCode::OK);
    let body = body_json(response).await;
    assert_eq!(body["id"], "G");
}

#[tokio::test]
async fn remote_member_can_post_and_read_messages() {
    let state = build_state().await;
    let key = seed_remote(&state).await;
    seed_home_guild(&state).await;
    amityvox_db::users::ensure_remote_user_stub(&state.db, "U@B", "remote", None, None, "B")
        .await
        .expect("stub");
    amityvox_db::members::add_member(&state.db, "G", "U@B")
        .await
        .expect("member");

    let response = send(
        build_router(state.clone()),
        post(
            "/federation/v1/guilds/G/channels/C/messages/create",
            signed_body(&key, "B", &json!({"user_id": "U@B", "content": "hello from B"})),
        ),
    )
    .await;
    assert_eq!(response.status(), StatusCode::CREATED);
    let created = body_json(response).await;
    assert_eq!(created["author_id"], "U@B");

    let response = send(
        build_router(state.clone()),
        post(
            "/federation/v1/guilds/G/channels/C/messages",
            signed_body(&key, "B", &json!({"user_id": "U@B", "limit": 10})),
        ),
    )
    .await;
    assert_eq!(response.status(), StatusCode::OK);
    let listed = body_json(response).await;
    assert_eq!(listed["messages"].as_array().expect("messages").len(), 1);

    // A non-member from the same instance cannot read.
    amityvox_db::users::ensure_remote_user_stub(&state.db, "X@B", "lurker", None, None, "B")
        .await
        .expect("stub");
    let response = send(
        build_router(state),
        post(
            "/federation/v1/guilds/G/channels/C/messages",
            signed_body(&key, "B", &json!({"user_id": "X@B"})),
        ),
    )
    .await;
    assert_eq!(response.status(), StatusCode::FORBIDDEN);
}

#[tokio::test]
async fn username_lookup_is_open_mode_only() {
    let state = build_state().await;
    amityvox_db::users::create_local_user(&state.db, "U", "alice", Some("Alice"))
        .await
        .expect("user");

    let response = send(
        build_router(state.clone()),
        Request::builder()
            .uri("/federation/v1/users/lookup?username=alice")
            .body(Body::empty())
            .expect("request"),
    )
    .await;
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(body_json(response).await["username"], "alice");

    state
        .federation
        .set_federation_mode(amityvox_models::instance::FederationMode::Closed)
        .await
        .expect("mode");
    let response = send(
        build_router(state),
        Request::builder()
            .uri("/federation/v1/users/lookup?username=alice")
            .body(Body::empty())
            .expect("request"),
    )
    .await;
    assert_eq!(response.status(), StatusCode::FORBIDDEN);
}

#[tokio::test]
async fn voice_token_is_503_when_capability_disabled() {
    let state = build_state().await;
    let key = seed_remote(&state).await;
    let response = send(
        build_router(state),
        post(
            "/federation/v1/voice/token",
            signed_body(
                &key,
                "B",
                &json!({"user_id": "U@B", "guild_id": "G", "channel_id": "V"}),
            ),
        ),
    )
    .await;
    assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
}
