//! Helpers for running a client against a local `wiremock` server.

use std::time::Duration;

use reqwest::Url;

use crate::{Client, Config, RetryConfig, SessionConfig, SessionContext};

/// Identity used by [`test_session`].
pub const TEST_IDENTITY: &str = "100042";

/// Session whose cookies target `base_url` and which already holds the
/// identity cookie for it.
pub fn test_session(base_url: &str) -> SessionContext {
    let session = SessionContext::new(SessionConfig {
        identity: TEST_IDENTITY.to_string(),
        signing_token: Some("test-token".to_string()),
        cookie_origins: Some(vec![base_url.to_string()]),
        ..Default::default()
    })
    .expect("session");
    let url = Url::parse(base_url).expect("base url");
    session.add_cookie(&format!("c_user={TEST_IDENTITY}; Path=/"), &url);
    session
}

/// Create a test client configured to use a wiremock server.
/// Retries keep their default budget but replay without delay.
pub fn test_client(base_url: &str) -> Client {
    Client::new(test_config(base_url), test_session(base_url)).expect("client")
}

pub fn test_config(base_url: &str) -> Config {
    Config {
        base_url: Some(base_url.to_string()),
        retry: Some(RetryConfig {
            max_delay: Duration::ZERO,
            ..Default::default()
        }),
        ..Default::default()
    }
}
