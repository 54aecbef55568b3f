//! Response classification.
//!
//! [`classify`] turns one [`RawResponse`] into exactly one
//! [`ClassifiedOutcome`]. It never performs I/O: retries, redirect hops and
//! re-authentication are carried out by the caller's loop in `client.rs`.
//! The only side effects are on the [`SessionContext`]: cookie and signing
//! token refresh instructions embedded in successfully parsed payloads.

use std::time::Duration;

use reqwest::Url;
use serde_json::Value;

use crate::{
    errors::{excerpt, Failure, FailureKind},
    http::RetryConfig,
    session::SessionContext,
    transport::RawResponse,
};

/// Anti-hijacking prefix some endpoints put in front of JSON.
const JSON_GUARD: &str = "for (;;);";
const JSON_GUARD_COMPACT: &str = "for(;;);";

/// Application error codes that mean the session is gone.
const NOT_LOGGED_IN_CODES: [i64; 2] = [1357001, 1357004];

const LOGIN_LOCATION_MARKERS: [&str; 3] = ["checkpoint", "login", "recover"];
const LOGIN_PAGE_MARKERS: [&str; 6] = [
    "login_form",
    "/login/",
    "/login.php",
    "checkpoint",
    "type=\"password\"",
    "name=\"pass\"",
];
const LOGIN_FORM_MARKERS: [&str; 4] = [
    "login_form",
    "name=\"pass\"",
    "id=\"loginbutton\"",
    "name=\"login\"",
];

/// The single result of inspecting a response.
#[derive(Clone, Debug, PartialEq)]
pub enum ClassifiedOutcome {
    /// Parsed payload (an array when the body held several JSON objects).
    Success(Value),
    /// Replay the originating request after `after`.
    Retry { after: Duration },
    /// Follow with a GET to `location` and classify again.
    Redirect { location: Url },
    /// The session is not usable; terminal for this call.
    AuthFailure(Failure),
    /// The body is not JSON; `snippet` holds its first 5000 characters.
    MalformedBody { snippet: String },
    /// Any other terminal failure.
    Fatal(Failure),
}

/// Classify `resp`, applying session side effects for parsed payloads.
///
/// `retry_count` is the number of replays already made for this call.
pub fn classify(
    resp: &RawResponse,
    retry_count: u32,
    retry: &RetryConfig,
    session: &SessionContext,
) -> ClassifiedOutcome {
    let status = resp.status;

    if (500..600).contains(&status) {
        if retry.allows_retry(retry_count) {
            return ClassifiedOutcome::Retry {
                after: retry.retry_delay(),
            };
        }
        return ClassifiedOutcome::Fatal(
            Failure::new(FailureKind::RetryExhausted)
                .with_status(status)
                .with_body(&resp.body),
        );
    }

    if (300..400).contains(&status) {
        let Some(location) = resp.location() else {
            return ClassifiedOutcome::Fatal(
                Failure::new(FailureKind::MalformedRedirect)
                    .with_status(status)
                    .with_body(&resp.body),
            );
        };
        return redirect_outcome(resp, location, Some(status));
    }

    if status != 200 {
        return ClassifiedOutcome::Fatal(
            Failure::new(FailureKind::Http)
                .with_status(status)
                .with_body(&resp.body),
        );
    }

    if is_html_document(&resp.body) && has_login_page_markers(&resp.body) {
        return ClassifiedOutcome::AuthFailure(
            Failure::new(FailureKind::HtmlLoginPage)
                .with_status(status)
                .with_body(&resp.body),
        );
    }

    let value = match parse_body(&resp.body) {
        Ok(value) => value,
        Err(_) if has_login_form_markers(&resp.body) => {
            return ClassifiedOutcome::AuthFailure(
                Failure::new(FailureKind::HtmlLoginPageParseFail)
                    .with_status(status)
                    .with_body(&resp.body),
            );
        }
        Err(_) => {
            return ClassifiedOutcome::MalformedBody {
                snippet: excerpt(&resp.body),
            };
        }
    };

    apply_side_effects(&value, session);

    if resp.request.is_get() {
        if let Some(location) = value.get("redirect").and_then(Value::as_str) {
            if !location.trim().is_empty() {
                return redirect_outcome(resp, location, None);
            }
        }
    }

    if is_not_logged_in(&value) {
        return ClassifiedOutcome::AuthFailure(
            Failure::new(FailureKind::NotLoggedIn)
                .with_status(status)
                .with_body(&resp.body),
        );
    }

    ClassifiedOutcome::Success(value)
}

fn redirect_outcome(resp: &RawResponse, location: &str, status: Option<u16>) -> ClassifiedOutcome {
    let failure_base = |kind| {
        let failure = Failure::new(kind).with_location(location);
        match status {
            Some(status) => failure.with_status(status),
            None => failure,
        }
    };

    if is_login_location(location) {
        return ClassifiedOutcome::AuthFailure(failure_base(FailureKind::LoginRedirect));
    }
    match resp.request.url.join(location) {
        Ok(target) => ClassifiedOutcome::Redirect { location: target },
        Err(_) => ClassifiedOutcome::Fatal(failure_base(FailureKind::MalformedRedirect)),
    }
}

/// Whether a redirect target points at a login, checkpoint or recovery page.
pub fn is_login_location(location: &str) -> bool {
    let lower = location.to_ascii_lowercase();
    LOGIN_LOCATION_MARKERS.iter().any(|m| lower.contains(m))
}

/// Whether `body` is a full HTML document rather than a fragment.
pub fn is_html_document(body: &str) -> bool {
    let head: String = body.trim_start().chars().take(512).collect();
    let lower = head.to_ascii_lowercase();
    lower.starts_with("<!doctype html") || lower.starts_with("<html") || lower.contains("<html")
}

pub fn has_login_page_markers(body: &str) -> bool {
    let lower = body.to_ascii_lowercase();
    LOGIN_PAGE_MARKERS.iter().any(|m| lower.contains(m))
}

pub fn has_login_form_markers(body: &str) -> bool {
    let lower = body.to_ascii_lowercase();
    LOGIN_FORM_MARKERS.iter().any(|m| lower.contains(m))
}

/// Parse a response body: strip the JSON guard, then read one or more
/// concatenated JSON values. Several values are returned as an array.
pub fn parse_body(body: &str) -> Result<Value, serde_json::Error> {
    let trimmed = body.trim_start();
    let trimmed = trimmed
        .strip_prefix(JSON_GUARD)
        .or_else(|| trimmed.strip_prefix(JSON_GUARD_COMPACT))
        .unwrap_or(trimmed);

    let mut values = serde_json::Deserializer::from_str(trimmed)
        .into_iter::<Value>()
        .collect::<Result<Vec<_>, _>>()?;

    match values.len() {
        // An empty body is not valid JSON; let serde produce the error.
        0 => serde_json::from_str::<Value>(trimmed),
        1 => Ok(values.remove(0)),
        _ => Ok(Value::Array(values)),
    }
}

fn is_not_logged_in(value: &Value) -> bool {
    let objects: Vec<&Value> = match value {
        Value::Array(items) => items.iter().collect(),
        other => vec![other],
    };
    objects.into_iter().any(|obj| {
        let code_hit = obj
            .get("error")
            .and_then(Value::as_i64)
            .is_some_and(|code| NOT_LOGGED_IN_CODES.contains(&code));
        let summary_hit = obj
            .get("errorSummary")
            .and_then(Value::as_str)
            .is_some_and(|s| s.to_ascii_lowercase().contains("login required"));
        code_hit || summary_hit
    })
}

/// Apply cookie and signing-token instructions found in `value`.
pub(crate) fn apply_side_effects(value: &Value, session: &SessionContext) {
    match value {
        Value::Array(items) => {
            for item in items {
                apply_instructions(item, session);
            }
        }
        other => apply_instructions(other, session),
    }
}

fn apply_instructions(value: &Value, session: &SessionContext) {
    let Some(requires) = value
        .pointer("/jsmods/require")
        .and_then(Value::as_array)
    else {
        return;
    };

    for entry in requires.iter().filter_map(Value::as_array) {
        let module = entry.first().and_then(Value::as_str);
        let method = entry.get(1).and_then(Value::as_str).unwrap_or_default();
        let args = entry.get(3).and_then(Value::as_array);

        match (module, args) {
            (Some("Cookie"), Some(args)) if method.starts_with("set") => {
                let name = args.first().and_then(Value::as_str);
                let cookie_value = args.get(1).and_then(Value::as_str);
                if let (Some(name), Some(cookie_value)) = (name, cookie_value) {
                    let name = name.replace("_js_", "");
                    let path = args.get(3).and_then(Value::as_str).unwrap_or("/");
                    session.install_cookie(&name, cookie_value, path);
                    #[cfg(feature = "tracing")]
                    tracing::debug!(cookie = %name, "installed cookie from response");
                }
            }
            (Some("DTSG"), Some(args)) if method == "setToken" => {
                if let Some(token) = args.first().and_then(Value::as_str) {
                    session.set_signing_token(token);
                    #[cfg(feature = "tracing")]
                    tracing::debug!("refreshed signing token from response");
                }
            }
            _ => {}
        }
    }
}

#[cfg(test)]
mod tests {
    use reqwest::header::{HeaderMap, HeaderValue, LOCATION};
    use serde_json::json;

    use super::*;
    use crate::{session::SessionConfig, transport::RecordedRequest};

    fn session() -> SessionContext {
        SessionContext::new(SessionConfig {
            identity: "4".into(),
            signing_token: Some("old".into()),
            ..Default::default()
        })
        .unwrap()
    }

    fn response(status: u16, body: &str) -> RawResponse {
        let url = Url::parse("https://www.facebook.com/api/thing").unwrap();
        RawResponse {
            status,
            headers: HeaderMap::new(),
            body: body.to_string(),
            request: RecordedRequest::get(url),
        }
    }

    fn redirect(status: u16, location: &str) -> RawResponse {
        let mut resp = response(status, "");
        resp.headers
            .insert(LOCATION, HeaderValue::from_str(location).unwrap());
        resp
    }

    fn fast_retry() -> RetryConfig {
        RetryConfig {
            max_delay: Duration::ZERO,
            ..Default::default()
        }
    }

    #[test]
    fn server_errors_retry_until_budget_spent() {
        let s = session();
        for count in 0..5 {
            assert!(matches!(
                classify(&response(503, "busy"), count, &fast_retry(), &s),
                ClassifiedOutcome::Retry { .. }
            ));
        }
        match classify(&response(503, "busy"), 5, &fast_retry(), &s) {
            ClassifiedOutcome::Fatal(f) => {
                assert_eq!(f.kind, FailureKind::RetryExhausted);
                assert_eq!(f.status, Some(503));
                assert_eq!(f.body_excerpt.as_deref(), Some("busy"));
            }
            other => panic!("expected exhausted, got {other:?}"),
        }
    }

    #[test]
    fn retry_delay_within_default_window() {
        let s = session();
        match classify(&response(500, ""), 0, &RetryConfig::default(), &s) {
            ClassifiedOutcome::Retry { after } => assert!(after <= Duration::from_millis(5000)),
            other => panic!("expected retry, got {other:?}"),
        }
    }

    #[test]
    fn redirect_without_location_is_malformed() {
        match classify(&response(302, ""), 0, &fast_retry(), &session()) {
            ClassifiedOutcome::Fatal(f) => assert_eq!(f.kind, FailureKind::MalformedRedirect),
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn login_like_redirects_are_auth_failures() {
        for location in [
            "https://www.facebook.com/login.php?next=x",
            "/checkpoint/block",
            "https://www.facebook.com/recover/initiate",
        ] {
            match classify(&redirect(302, location), 0, &fast_retry(), &session()) {
                ClassifiedOutcome::AuthFailure(f) => {
                    assert_eq!(f.kind, FailureKind::LoginRedirect);
                    assert_eq!(f.location.as_deref(), Some(location));
                }
                other => panic!("unexpected {other:?} for {location}"),
            }
        }
    }

    #[test]
    fn plain_redirect_resolves_relative_target() {
        match classify(&redirect(301, "/messages/t/1"), 0, &fast_retry(), &session()) {
            ClassifiedOutcome::Redirect { location } => {
                assert_eq!(location.as_str(), "https://www.facebook.com/messages/t/1")
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn non_200_is_http_failure() {
        match classify(&response(404, "nope"), 0, &fast_retry(), &session()) {
            ClassifiedOutcome::Fatal(f) => {
                assert_eq!(f.kind, FailureKind::Http);
                assert_eq!(f.status, Some(404));
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn html_login_page_detected_before_parse() {
        let body = "<!DOCTYPE html><html><form id=\"login_form\"><input name=\"pass\"></form></html>";
        match classify(&response(200, body), 0, &fast_retry(), &session()) {
            ClassifiedOutcome::AuthFailure(f) => assert_eq!(f.kind, FailureKind::HtmlLoginPage),
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn login_fragment_that_fails_parse() {
        let body = "<div><form id=\"login_form\"></form></div>";
        match classify(&response(200, body), 0, &fast_retry(), &session()) {
            ClassifiedOutcome::AuthFailure(f) => {
                assert_eq!(f.kind, FailureKind::HtmlLoginPageParseFail)
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn garbage_body_is_malformed_with_truncated_snippet() {
        let body = format!("oops{}", "z".repeat(6000));
        match classify(&response(200, &body), 0, &fast_retry(), &session()) {
            ClassifiedOutcome::MalformedBody { snippet } => {
                assert_eq!(snippet.len(), 5000);
                assert!(snippet.starts_with("oops"));
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn guard_is_stripped_and_objects_split() {
        assert_eq!(
            parse_body("for (;;);{\"a\":1}").unwrap(),
            json!({"a": 1})
        );
        assert_eq!(
            parse_body("{\"a\":1}\r\n{\"b\":2}").unwrap(),
            json!([{"a": 1}, {"b": 2}])
        );
        assert_eq!(
            parse_body("for(;;);{\"a\":1}\n{\"b\":2}").unwrap(),
            json!([{"a": 1}, {"b": 2}])
        );
        assert!(parse_body("").is_err());
        assert!(parse_body("{\"a\":").is_err());
    }

    #[test]
    fn embedded_redirect_followed_only_on_get() {
        let body = r#"{"redirect":"https://www.facebook.com/next"}"#;
        match classify(&response(200, body), 0, &fast_retry(), &session()) {
            ClassifiedOutcome::Redirect { location } => {
                assert_eq!(location.as_str(), "https://www.facebook.com/next")
            }
            other => panic!("unexpected {other:?}"),
        }

        let mut post = response(200, body);
        post.request = RecordedRequest::post(post.request.url.clone(), vec![]);
        assert!(matches!(
            classify(&post, 0, &fast_retry(), &session()),
            ClassifiedOutcome::Success(_)
        ));
    }

    #[test]
    fn embedded_login_redirect_is_auth_failure() {
        let body = r#"{"redirect":"https://www.facebook.com/checkpoint/828281030927956"}"#;
        match classify(&response(200, body), 0, &fast_retry(), &session()) {
            ClassifiedOutcome::AuthFailure(f) => {
                assert_eq!(f.kind, FailureKind::LoginRedirect);
                assert_eq!(f.status, None);
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn application_error_codes_mean_not_logged_in() {
        for body in [
            r#"{"error":1357001}"#,
            r#"{"error":1357004,"errorSummary":"Please refresh"}"#,
            r#"{"error":1,"errorSummary":"Login Required"}"#,
        ] {
            match classify(&response(200, body), 0, &fast_retry(), &session()) {
                ClassifiedOutcome::AuthFailure(f) => assert_eq!(f.kind, FailureKind::NotLoggedIn),
                other => panic!("unexpected {other:?} for {body}"),
            }
        }
    }

    #[test]
    fn token_and_cookie_instructions_update_session() {
        let s = session();
        let body = json!({
            "jsmods": {"require": [
                ["Cookie", "setConfirmed", [], ["_js_datr", "abc123", 63072000000_i64, "/", false]],
                ["DTSG", "setToken", [], ["fresh-token"]]
            ]},
            "payload": {}
        })
        .to_string();

        let outcome = classify(&response(200, &body), 0, &fast_retry(), &s);
        assert!(matches!(outcome, ClassifiedOutcome::Success(_)));
        assert_eq!(s.tokens().token, "fresh-token");
        assert_eq!(
            s.tokens().checksum,
            crate::session::signing_checksum("fresh-token")
        );
        for origin in s.cookie_origins() {
            assert_eq!(s.cookie_value(origin, "datr").as_deref(), Some("abc123"));
        }
    }

    #[test]
    fn side_effects_apply_even_when_not_logged_in() {
        let s = session();
        let body = json!({
            "error": 1357001,
            "jsmods": {"require": [["DTSG", "setToken", [], ["t2"]]]}
        })
        .to_string();
        assert!(matches!(
            classify(&response(200, &body), 0, &fast_retry(), &s),
            ClassifiedOutcome::AuthFailure(_)
        ));
        assert_eq!(s.tokens().token, "t2");
    }
}
