//! Session validation against a wiremock server.

use std::time::Duration;

use chatlink::{
    testing::{test_client, test_config, TEST_IDENTITY},
    Client, FailureKind, SessionConfig, SessionContext, ValidateOptions,
};
use wiremock::matchers::{method, path};
use wiremock::{Mock, MockServer, Request, Respond, ResponseTemplate};

struct SequenceResponder {
    templates: std::sync::Mutex<std::collections::VecDeque<ResponseTemplate>>,
}

impl SequenceResponder {
    fn new(templates: Vec<ResponseTemplate>) -> Self {
        Self {
            templates: std::sync::Mutex::new(templates.into_iter().collect()),
        }
    }
}

impl Respond for SequenceResponder {
    fn respond(&self, _req: &Request) -> ResponseTemplate {
        let mut templates = self.templates.lock().expect("mutex should not be poisoned");
        templates
            .pop_front()
            .unwrap_or_else(|| ResponseTemplate::new(200).set_body_string("<html>ok</html>"))
    }
}

fn options(retries: u32) -> ValidateOptions {
    ValidateOptions {
        retries,
        delay: Duration::from_millis(10),
    }
}

async fn mount_ok(server: &MockServer, probe: &str) {
    Mock::given(method("GET"))
        .and(path(probe))
        .respond_with(ResponseTemplate::new(200).set_body_string("<html><body>feed</body></html>"))
        .mount(server)
        .await;
}

#[tokio::test]
async fn healthy_session_passes_all_probes() {
    let server = MockServer::start().await;
    mount_ok(&server, "/").await;
    mount_ok(&server, "/settings").await;

    test_client(&server.uri())
        .validate_session(&options(0))
        .await
        .expect("session should validate");

    let requests = server.received_requests().await.expect("recorded requests");
    let paths: Vec<&str> = requests.iter().map(|r| r.url.path()).collect();
    assert_eq!(paths, vec!["/", "/settings"]);
}

#[tokio::test]
async fn missing_identity_cookie_fails_fast() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .respond_with(ResponseTemplate::new(200))
        .expect(0)
        .mount(&server)
        .await;

    let session = SessionContext::new(SessionConfig {
        identity: TEST_IDENTITY.to_string(),
        cookie_origins: Some(vec![server.uri()]),
        ..Default::default()
    })
    .unwrap();
    let client = Client::new(test_config(&server.uri()), session).unwrap();

    let err = client.validate_session(&options(3)).await.unwrap_err();
    assert_eq!(err.failure_kind(), Some(FailureKind::MissingSession));
}

#[tokio::test]
async fn failing_pass_is_retried_from_the_first_probe() {
    let server = MockServer::start().await;
    mount_ok(&server, "/").await;
    Mock::given(method("GET"))
        .and(path("/settings"))
        .respond_with(SequenceResponder::new(vec![ResponseTemplate::new(500)]))
        .mount(&server)
        .await;

    test_client(&server.uri())
        .validate_session(&options(1))
        .await
        .expect("second pass should succeed");

    let requests = server.received_requests().await.expect("recorded requests");
    let paths: Vec<&str> = requests.iter().map(|r| r.url.path()).collect();
    assert_eq!(paths, vec!["/", "/settings", "/", "/settings"]);
}

#[tokio::test]
async fn checkpoint_redirect_is_a_login_redirect_after_retries() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/"))
        .respond_with(
            ResponseTemplate::new(302).insert_header("location", "/checkpoint/1501092823525282/"),
        )
        .expect(3)
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/checkpoint/1501092823525282/"))
        .respond_with(ResponseTemplate::new(200))
        .expect(0)
        .mount(&server)
        .await;

    let client = test_client(&server.uri());
    let err = client.validate_session(&options(2)).await.unwrap_err();
    assert_eq!(err.failure_kind(), Some(FailureKind::LoginRedirect));
    assert!(err.is_auth_failure());
    match &err {
        chatlink::Error::Failure(failure) => {
            assert_eq!(failure.location.as_deref(), Some("/checkpoint/1501092823525282/"));
        }
        other => panic!("unexpected error: {other:?}"),
    }
    assert_eq!(client.session().health("validate.retry"), 2);
}

#[tokio::test]
async fn unauthorized_probe() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .respond_with(ResponseTemplate::new(403))
        .mount(&server)
        .await;

    let err = test_client(&server.uri())
        .validate_session(&options(0))
        .await
        .unwrap_err();
    assert_eq!(err.failure_kind(), Some(FailureKind::Unauthorized));
}
