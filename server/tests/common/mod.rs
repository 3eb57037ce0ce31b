//! Shared harness: boot the router on an ephemeral port with a fresh data
//! dir, seed mirrored accounts and mint tokens for them.
#![allow(dead_code)]

use parley_server::accounts::{upsert, UserUpsert};
use parley_server::config::ChatConfig;
use parley_server::state::AppState;
use serde_json::Value;
use tokio::net::TcpListener;

pub const INTERNAL_TOKEN: &str = "test-internal-token";

pub struct TestServer {
    pub base_url: String,
    pub state: AppState,
    pub client: reqwest::Client,
}

/// Start the server on 127.0.0.1:0. With `internal_token` set, internal
/// endpoints require the X-Internal-Auth header.
pub async fn start_test_server(internal_token: Option<&str>) -> TestServer {
    let tmp_dir = tempfile::tempdir().expect("Failed to create temp dir");
    let data_dir = tmp_dir.path().to_str().unwrap().to_string();

    let db = parley_server::db::init_db(&data_dir).expect("Failed to init DB");
    let jwt_secret = parley_server::auth::jwt::load_or_generate_jwt_secret(&data_dir)
        .expect("Failed to generate JWT secret");

    let state = AppState {
        db,
        jwt_secret,
        internal_token_hash: internal_token.map(parley_server::auth::internal::hash_internal_token),
        chat: ChatConfig::default(),
    };

    let app = parley_server::routes::build_router(state.clone());
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();

    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
        let _keep = tmp_dir;
    });

    TestServer {
        base_url: format!("http://{}", addr),
        state,
        client: reqwest::Client::new(),
    }
}

impl TestServer {
    pub fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }

    /// Mirror an account directly in the database and return a bearer token for it.
    pub fn seed_user(&self, id: i64, phone: Option<&str>, staff: bool, superuser: bool) -> String {
        {
            let conn = self.state.db.lock().unwrap();
            upsert(
                &conn,
                id,
                &UserUpsert {
                    username: format!("user{}", id),
                    phone: phone.map(str::to_string),
                    display_name: format!("User {}", id),
                    is_superuser: superuser,
                    is_staff: staff,
                    is_active: true,
                },
            )
            .unwrap();
        }
        self.token(id)
    }

    pub fn token(&self, id: i64) -> String {
        parley_server::auth::jwt::issue_access_token(&self.state.jwt_secret, id).unwrap()
    }

    pub async fn get(&self, token: &str, path: &str) -> (u16, Value) {
        let resp = self
            .client
            .get(self.url(path))
            .bearer_auth(token)
            .send()
            .await
            .unwrap();
        read(resp).await
    }

    pub async fn post(&self, token: &str, path: &str, body: Value) -> (u16, Value) {
        let resp = self
            .client
            .post(self.url(path))
            .bearer_auth(token)
            .json(&body)
            .send()
            .await
            .unwrap();
        read(resp).await
    }

    pub async fn patch(&self, token: &str, path: &str, body: Value) -> (u16, Value) {
        let resp = self
            .client
            .patch(self.url(path))
            .bearer_auth(token)
            .json(&body)
            .send()
            .await
            .unwrap();
        read(resp).await
    }

    pub async fn put(&self, token: &str, path: &str, body: Value) -> (u16, Value) {
        let resp = self
            .client
            .put(self.url(path))
            .bearer_auth(token)
            .json(&body)
            .send()
            .await
            .unwrap();
        read(resp).await
    }

    pub async fn delete(&self, token: &str, path: &str) -> u16 {
        let resp = self
            .client
            .delete(self.url(path))
            .bearer_auth(token)
            .send()
            .await
            .unwrap();
        resp.status().as_u16()
    }

    /// Can `user_id` do `permission` on `target`? Asked through the caller's own check endpoint.
    pub async fn allowed(&self, token: &str, permission: &str, target_type: &str, target_id: &str) -> bool {
        let (status, body) = self
            .post(
                token,
                "/api/authz/check",
                serde_json::json!({
                    "permission": permission,
                    "target": {"type": target_type, "id": target_id},
                }),
            )
            .await;
        assert_eq!(status, 200, "authz check failed: {}", body);
        body["allowed"].as_bool().unwrap()
    }
}

async fn read(resp: reqwest::Response) -> (u16, Value) {
    let status = resp.status().as_u16();
    let text = resp.text().await.unwrap();
    let body = if text.is_empty() {
        Value::Null
    } else {
        serde_json::from_str(&text).unwrap_or(Value::String(text))
    };
    (status, body)
}
