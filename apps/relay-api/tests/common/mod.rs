#![allow(dead_code)]

use std::sync::Arc;
use std::time::Duration;

use axum::http::header::AUTHORIZATION;
use axum::Router;
use axum_test::TestServer;

use relay_api::config::{Config, PlatformKind};
use relay_api::platform::memory::MemoryPlatform;
use relay_api::AppState;
use relay_common::Snowflake;

/// Config tuned for tests: fast dispatcher ticks and a short connect wait.
pub fn test_config() -> Config {
    Config {
        platform: PlatformKind::Memory,
        dispatch_interval: Duration::from_millis(20),
        connect_poll_attempts: 10,
        connect_poll_interval: Duration::from_millis(100),
        connect_timeout: Duration::from_secs(2),
        send_timeout: Duration::from_secs(2),
        default_delay: Duration::ZERO,
        shutdown_grace: Duration::from_secs(1),
        ..Config::default()
    }
}

/// Build a test AppState over `platform` with the dispatcher running.
pub fn test_state(platform: &MemoryPlatform) -> AppState {
    let state = AppState::new(test_config(), Arc::new(platform.clone()));
    state.supervisor.start();
    state
}

/// Build the full application router wired to the test state.
pub fn test_app(platform: &MemoryPlatform) -> (Router, AppState) {
    let state = test_state(platform);
    let app = relay_api::routes::router().with_state(state.clone());
    (app, state)
}

/// A platform with one group and the given human members.
pub fn platform_with_group(name: &str, members: &[&str]) -> (MemoryPlatform, Snowflake) {
    let platform = MemoryPlatform::new();
    let group_id = platform.add_group(name);
    for member in members {
        platform.add_member(group_id, member, false, &[]);
    }
    (platform, group_id)
}

pub fn bearer(token: &str) -> String {
    format!("Bearer {token}")
}

/// Connect `token` and assert the session became ready.
pub async fn connect(server: &TestServer, token: &str) {
    let resp = server
        .post("/api/v1/session")
        .add_header(AUTHORIZATION, bearer(token))
        .await;
    resp.assert_status_ok();
    assert_eq!(resp.json::<serde_json::Value>()["ready"], true);
}

/// Poll the stats endpoint until the latest broadcast for `group_id` has ended.
pub async fn wait_for_broadcast_end(
    server: &TestServer,
    token: &str,
    group_id: Snowflake,
) -> serde_json::Value {
    for _ in 0..200 {
        let stats: serde_json::Value = server
            .get(&format!("/api/v1/groups/{group_id}/stats"))
            .add_header(AUTHORIZATION, bearer(token))
            .await
            .json();
        if !stats["end_time"].is_null() {
            return stats;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    panic!("broadcast for group {group_id} did not finish");
}
