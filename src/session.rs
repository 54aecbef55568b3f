//! Per-connection session state shared by every in-flight call.
//!
//! A [`SessionContext`] bundles the cookie jar, the identity, the two rotating
//! signing tokens, the request/task sequence counters and a small bag of
//! health counters. All mutation goes through interior mutability so the
//! context can be shared behind an `Arc` by concurrently running calls.
//! Sequence counters are atomics: a caller draws its id before any await, so
//! no two calls ever observe the same value.

use std::{
    collections::HashMap,
    fmt,
    net::IpAddr,
    sync::{
        atomic::{AtomicBool, AtomicU64, Ordering},
        Arc, Mutex, RwLock,
    },
};

use reqwest::{
    cookie::{CookieStore, Jar},
    Url,
};

use crate::errors::{Error, Result, ValidationError};

/// Cookie that carries the logged-in user id.
pub const DEFAULT_IDENTITY_COOKIE: &str = "c_user";

/// Origins that receive cookies installed from response instructions.
pub const DEFAULT_COOKIE_ORIGINS: [&str; 2] =
    ["https://www.facebook.com", "https://www.messenger.com"];

// Form field names used to sign submissions.
const FORM_USER: &str = "__user";
const FORM_AJAX: &str = "__a";
const FORM_REQ: &str = "__req";
const FORM_TOKEN: &str = "fb_dtsg";
const FORM_CHECKSUM: &str = "jazoest";

/// Configuration for [`SessionContext::new`].
#[derive(Clone, Debug, Default)]
pub struct SessionConfig {
    /// Numeric user id of the logged-in account.
    pub identity: String,
    /// Initial CSRF signing token, if already known.
    pub signing_token: Option<String>,
    /// Name of the identity cookie (defaults to `c_user`).
    pub identity_cookie: Option<String>,
    /// Origins that receive installed cookies (defaults to the two web origins).
    pub cookie_origins: Option<Vec<String>>,
    /// Caller-supplied cookie jar; a fresh one is created when absent.
    pub jar: Option<Arc<Jar>>,
}

/// The rotating token pair used to sign form submissions.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct SigningTokens {
    pub token: String,
    pub checksum: String,
}

impl SigningTokens {
    pub fn new(token: impl Into<String>) -> Self {
        let token = token.into();
        let checksum = signing_checksum(&token);
        Self { token, checksum }
    }
}

/// `"2"` followed by the decimal sum of the token's character codes.
pub fn signing_checksum(token: &str) -> String {
    let sum: u64 = token.chars().map(|c| c as u64).sum();
    format!("2{sum}")
}

pub struct SessionContext {
    identity: String,
    identity_cookie: String,
    jar: Arc<Jar>,
    cookie_origins: Vec<Url>,
    tokens: RwLock<SigningTokens>,
    request_counter: AtomicU64,
    task_counter: AtomicU64,
    health: Mutex<HashMap<String, u64>>,
    reauth_in_flight: AtomicBool,
}

impl fmt::Debug for SessionContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SessionContext")
            .field("identity", &self.identity)
            .field("identity_cookie", &self.identity_cookie)
            .field("cookie_origins", &self.cookie_origins)
            .field("request_counter", &self.request_counter)
            .field("task_counter", &self.task_counter)
            .field("reauth_in_flight", &self.reauth_in_flight)
            .finish_non_exhaustive()
    }
}

impl SessionContext {
    pub fn new(cfg: SessionConfig) -> Result<Self> {
        let identity = cfg.identity.trim().to_string();
        if identity.is_empty() {
            return Err(ValidationError::new("is required")
                .with_field("identity")
                .into());
        }

        let origins = match cfg.cookie_origins {
            Some(origins) => origins,
            None => DEFAULT_COOKIE_ORIGINS
                .iter()
                .map(|s| s.to_string())
                .collect(),
        };
        let cookie_origins = origins
            .iter()
            .map(|origin| {
                Url::parse(origin)
                    .map_err(|err| Error::Config(format!("invalid cookie origin {origin}: {err}")))
            })
            .collect::<Result<Vec<_>>>()?;

        Ok(Self {
            identity,
            identity_cookie: cfg
                .identity_cookie
                .filter(|s| !s.trim().is_empty())
                .unwrap_or_else(|| DEFAULT_IDENTITY_COOKIE.to_string()),
            jar: cfg.jar.unwrap_or_default(),
            cookie_origins,
            tokens: RwLock::new(SigningTokens::new(cfg.signing_token.unwrap_or_default())),
            request_counter: AtomicU64::new(0),
            task_counter: AtomicU64::new(0),
            health: Mutex::new(HashMap::new()),
            reauth_in_flight: AtomicBool::new(false),
        })
    }

    pub fn identity(&self) -> &str {
        &self.identity
    }

    pub fn identity_cookie(&self) -> &str {
        &self.identity_cookie
    }

    pub fn jar(&self) -> Arc<Jar> {
        Arc::clone(&self.jar)
    }

    pub fn cookie_origins(&self) -> &[Url] {
        &self.cookie_origins
    }

    /// Store a raw `Set-Cookie` style string for `url`.
    pub fn add_cookie(&self, cookie: &str, url: &Url) {
        self.jar.add_cookie_str(cookie, url);
    }

    /// Value of the named cookie as it would be sent to `url`.
    pub fn cookie_value(&self, url: &Url, name: &str) -> Option<String> {
        let header = self.jar.cookies(url)?;
        let header = header.to_str().ok()?;
        header.split(';').find_map(|pair| {
            let (key, value) = pair.trim().split_once('=')?;
            (key == name).then(|| value.to_string())
        })
    }

    /// Whether the jar holds a non-empty identity cookie for `url`.
    pub fn has_identity_cookie(&self, url: &Url) -> bool {
        self.cookie_value(url, &self.identity_cookie)
            .is_some_and(|v| !v.is_empty())
    }

    /// Install a cookie on every configured origin.
    pub(crate) fn install_cookie(&self, name: &str, value: &str, path: &str) {
        for origin in &self.cookie_origins {
            let cookie = match cookie_domain(origin) {
                Some(domain) => format!("{name}={value}; Path={path}; Domain={domain}"),
                None => format!("{name}={value}; Path={path}"),
            };
            self.jar.add_cookie_str(&cookie, origin);
        }
    }

    pub fn tokens(&self) -> SigningTokens {
        match self.tokens.read() {
            Ok(tokens) => tokens.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }

    /// Replace the signing token and recompute its checksum.
    pub fn set_signing_token(&self, token: impl Into<String>) {
        let fresh = SigningTokens::new(token);
        match self.tokens.write() {
            Ok(mut tokens) => *tokens = fresh,
            Err(poisoned) => *poisoned.into_inner() = fresh,
        }
    }

    /// Allocate the next request sequence number (starts at 1).
    pub fn next_request_id(&self) -> u64 {
        self.request_counter.fetch_add(1, Ordering::SeqCst) + 1
    }

    /// Allocate the next realtime task sequence number (starts at 1).
    pub fn next_task_id(&self) -> u64 {
        self.task_counter.fetch_add(1, Ordering::SeqCst) + 1
    }

    /// Bump the named health counter and return its new value.
    pub fn record_health(&self, key: &str) -> u64 {
        let mut health = match self.health.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        let counter = health.entry(key.to_string()).or_insert(0);
        *counter += 1;
        *counter
    }

    pub fn health(&self, key: &str) -> u64 {
        let health = match self.health.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        health.get(key).copied().unwrap_or(0)
    }

    /// Form fields that sign a submission. Draws a fresh request number.
    pub fn signed_form(&self) -> Vec<(String, String)> {
        self.sign().1
    }

    /// Like [`signed_form`](Self::signed_form), also returning the request
    /// number the fields carry.
    pub fn sign(&self) -> (u64, Vec<(String, String)>) {
        let tokens = self.tokens();
        let request_id = self.next_request_id();
        let fields = vec![
            (FORM_USER.to_string(), self.identity.clone()),
            (FORM_AJAX.to_string(), "1".to_string()),
            (FORM_REQ.to_string(), to_base36(request_id)),
            (FORM_TOKEN.to_string(), tokens.token),
            (FORM_CHECKSUM.to_string(), tokens.checksum),
        ];
        (request_id, fields)
    }

    /// Claim the re-authentication slot. Returns `false` if one is in flight.
    pub(crate) fn try_begin_reauth(&self) -> bool {
        self.reauth_in_flight
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_ok()
    }

    pub(crate) fn finish_reauth(&self) {
        self.reauth_in_flight.store(false, Ordering::SeqCst);
    }

    pub fn reauth_in_flight(&self) -> bool {
        self.reauth_in_flight.load(Ordering::SeqCst)
    }
}

/// Registrable cookie domain for an origin; `None` for IP hosts.
fn cookie_domain(origin: &Url) -> Option<String> {
    let host = origin.host_str()?;
    if host.parse::<IpAddr>().is_ok() || host == "localhost" {
        return None;
    }
    Some(host.strip_prefix("www.").unwrap_or(host).to_string())
}

fn to_base36(mut n: u64) -> String {
    const DIGITS: &[u8; 36] = b"0123456789abcdefghijklmnopqrstuvwxyz";
    if n == 0 {
        return "0".to_string();
    }
    let mut out = Vec::new();
    while n > 0 {
        out.push(DIGITS[(n % 36) as usize]);
        n /= 36;
    }
    out.reverse();
    String::from_utf8_lossy(&out).into_owned()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn session() -> SessionContext {
        SessionContext::new(SessionConfig {
            identity: "100042".into(),
            signing_token: Some("AB".into()),
            ..Default::default()
        })
        .expect("session")
    }

    #[test]
    fn rejects_blank_identity() {
        let err = SessionContext::new(SessionConfig::default()).unwrap_err();
        assert!(matches!(err, Error::Validation(_)));
    }

    #[test]
    fn checksum_sums_char_codes() {
        // 'A' = 65, 'B' = 66
        assert_eq!(signing_checksum("AB"), "2131");
        assert_eq!(signing_checksum(""), "20");
    }

    #[test]
    fn set_signing_token_recomputes_checksum() {
        let session = session();
        assert_eq!(session.tokens().checksum, "2131");
        session.set_signing_token("a");
        assert_eq!(
            session.tokens(),
            SigningTokens {
                token: "a".into(),
                checksum: "297".into()
            }
        );
    }

    #[test]
    fn counters_are_monotonic_and_independent() {
        let session = session();
        assert_eq!(session.next_request_id(), 1);
        assert_eq!(session.next_request_id(), 2);
        assert_eq!(session.next_task_id(), 1);
        assert_eq!(session.next_request_id(), 3);
    }

    #[test]
    fn signed_form_carries_tokens_and_base36_counter() {
        let session = session();
        for _ in 0..35 {
            session.next_request_id();
        }
        let form: HashMap<_, _> = session.signed_form().into_iter().collect();
        assert_eq!(form["__user"], "100042");
        assert_eq!(form["__req"], "10");
        assert_eq!(form["fb_dtsg"], "AB");
        assert_eq!(form["jazoest"], "2131");
    }

    #[test]
    fn installed_cookies_land_on_every_origin() {
        let session = session();
        session.install_cookie("presence", "xyz", "/");
        for origin in session.cookie_origins() {
            assert_eq!(session.cookie_value(origin, "presence").as_deref(), Some("xyz"));
        }
    }

    #[test]
    fn identity_cookie_detection() {
        let session = session();
        let url = Url::parse("https://www.facebook.com/").unwrap();
        assert!(!session.has_identity_cookie(&url));
        session.add_cookie("c_user=100042; Domain=facebook.com; Path=/", &url);
        assert!(session.has_identity_cookie(&url));
    }

    #[test]
    fn reauth_slot_is_exclusive() {
        let session = session();
        assert!(session.try_begin_reauth());
        assert!(!session.try_begin_reauth());
        session.finish_reauth();
        assert!(session.try_begin_reauth());
    }

    #[test]
    fn health_counters_accumulate() {
        let session = session();
        assert_eq!(session.health("edit.resend"), 0);
        session.record_health("edit.resend");
        assert_eq!(session.record_health("edit.resend"), 2);
    }
}
