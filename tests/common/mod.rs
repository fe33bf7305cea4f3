#![allow(dead_code, unused_macros)]

use actix_web::{test, web};
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;
use vpn_control_plane::auth::OutboxDelivery;
use vpn_control_plane::db::MemoryStore;
use vpn_control_plane::fleet::HttpNodeSync;
use vpn_control_plane::{AppState, Backends, Settings};

pub const PHONE: &str = "+19995550100";
pub const PASSWORD: &str = "Abcd1234";
pub const ADMIN_PHONE: &str = "+19995550000";

pub struct Harness {
    pub state: web::Data<AppState>,
    pub store: MemoryStore,
    pub outbox: OutboxDelivery,
}

pub fn harness() -> Harness {
    harness_with(Settings::new_for_test().expect("test settings"))
}

pub fn harness_with(settings: Settings) -> Harness {
    let store = MemoryStore::new();
    let outbox = OutboxDelivery::new();
    let node_sync = HttpNodeSync::new(Duration::from_secs(5)).expect("http client");
    let backends = Backends::in_memory(&store, Arc::new(outbox.clone()), Arc::new(node_sync));
    let state = AppState::new(settings, backends).expect("app state");
    Harness {
        state: web::Data::new(state),
        store,
        outbox,
    }
}

pub fn post_json(uri: &str, token: Option<&str>, body: Value) -> test::TestRequest {
    with_token(test::TestRequest::post().uri(uri).set_json(body), token)
}

pub fn get(uri: &str, token: Option<&str>) -> test::TestRequest {
    with_token(test::TestRequest::get().uri(uri), token)
}

pub fn delete(uri: &str, token: Option<&str>) -> test::TestRequest {
    with_token(test::TestRequest::delete().uri(uri), token)
}

fn with_token(req: test::TestRequest, token: Option<&str>) -> test::TestRequest {
    match token {
        Some(token) => req.insert_header(("Authorization", format!("Bearer {}", token))),
        None => req,
    }
}

/// Sends a request built with the helpers above.
macro_rules! call {
    ($app:expr, $req:expr) => {
        actix_web::test::call_service(&$app, $req.to_request()).await
    };
}

/// Requests a code, reads it from the outbox and registers. Evaluates to the token.
macro_rules! register_account {
    ($app:expr, $harness:expr, $phone:expr, $password:expr) => {{
        let resp = call!(
            $app,
            common::post_json("/auth/send-otp", None, serde_json::json!({ "phone_number": $phone }))
        );
        assert_eq!(resp.status(), 200);
        let code = $harness.outbox.last_code($phone).await.expect("code delivered");

        let resp = call!(
            $app,
            common::post_json(
                "/auth/register",
                None,
                serde_json::json!({ "phone_number": $phone, "password": $password, "otp": code }),
            )
        );
        assert_eq!(resp.status(), 201);
        let body: serde_json::Value = actix_web::test::read_body_json(resp).await;
        body["token"].as_str().expect("token").to_string()
    }};
}

macro_rules! login {
    ($app:expr, $phone:expr, $password:expr) => {{
        let resp = call!(
            $app,
            common::post_json(
                "/auth/login",
                None,
                serde_json::json!({ "phone_number": $phone, "password": $password }),
            )
        );
        assert_eq!(resp.status(), 200);
        let body: serde_json::Value = actix_web::test::read_body_json(resp).await;
        body["token"].as_str().expect("token").to_string()
    }};
}

/// Registers an account, promotes it and logs in again so the token carries the role.
macro_rules! admin_token {
    ($app:expr, $harness:expr) => {{
        register_account!($app, $harness, common::ADMIN_PHONE, common::PASSWORD);
        assert!($harness.store.grant_admin(common::ADMIN_PHONE).await);
        login!($app, common::ADMIN_PHONE, common::PASSWORD)
    }};
}
