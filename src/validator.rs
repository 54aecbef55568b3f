//! Session validation by probing a handful of authenticated pages.

use std::{sync::Arc, time::Duration};

use reqwest::Url;
use tokio::time::sleep;

use crate::{
    classify::{has_login_page_markers, is_html_document},
    errors::{Error, Failure, FailureKind, Result},
    session::SessionContext,
    transport::{HttpExecutor, RawResponse, RecordedRequest},
};

/// Pages fetched, in order, to confirm the session is logged in.
pub const DEFAULT_PROBE_PATHS: [&str; 2] = ["/", "/settings"];

const CHECKPOINT_MARKERS: [&str; 2] = ["/checkpoint/", "checkpoint_"];

/// Retry behavior for [`SessionValidator::validate`].
#[derive(Clone, Debug)]
pub struct ValidateOptions {
    /// Extra passes over the probe set after the first one fails.
    pub retries: u32,
    /// Pause before each extra pass.
    pub delay: Duration,
}

impl Default for ValidateOptions {
    fn default() -> Self {
        Self {
            retries: 2,
            delay: Duration::from_millis(1000),
        }
    }
}

#[derive(Clone)]
pub struct SessionValidator {
    executor: Arc<dyn HttpExecutor>,
    session: Arc<SessionContext>,
    base_url: Url,
    probe_paths: Vec<String>,
}

impl SessionValidator {
    pub fn new(executor: Arc<dyn HttpExecutor>, session: Arc<SessionContext>, base_url: Url) -> Self {
        Self {
            executor,
            session,
            base_url,
            probe_paths: DEFAULT_PROBE_PATHS.iter().map(|p| p.to_string()).collect(),
        }
    }

    pub fn with_probe_paths(mut self, paths: Vec<String>) -> Self {
        if !paths.is_empty() {
            self.probe_paths = paths;
        }
        self
    }

    pub fn probe_paths(&self) -> &[String] {
        &self.probe_paths
    }

    /// Confirm the session is usable.
    ///
    /// Fails immediately with [`FailureKind::MissingSession`] when the jar has
    /// no identity cookie for the base origin. Otherwise every probe must
    /// pass within a single pass; a failed pass is retried from the first
    /// probe after `options.delay`, and the last failure is returned once
    /// `options.retries` extra passes are spent.
    pub async fn validate(&self, options: &ValidateOptions) -> Result<()> {
        if !self.session.has_identity_cookie(&self.base_url) {
            #[cfg(feature = "tracing")]
            tracing::warn!(identity = self.session.identity(), "no identity cookie in jar");
            return Err(Failure::new(FailureKind::MissingSession).into());
        }

        let mut pass = 0;
        loop {
            match self.probe_all().await {
                Ok(()) => {
                    #[cfg(feature = "tracing")]
                    tracing::debug!(pass, "session validated");
                    return Ok(());
                }
                Err(err) if pass < options.retries => {
                    pass += 1;
                    self.session.record_health("validate.retry");
                    #[cfg(feature = "tracing")]
                    tracing::debug!(pass, error = %err, "probe pass failed; retrying");
                    #[cfg(not(feature = "tracing"))]
                    drop(err);
                    sleep(options.delay).await;
                }
                Err(err) => {
                    self.session.record_health("validate.failed");
                    #[cfg(feature = "tracing")]
                    tracing::warn!(error = %err, "session validation failed");
                    return Err(err);
                }
            }
        }
    }

    async fn probe_all(&self) -> Result<()> {
        for path in &self.probe_paths {
            let url = self
                .base_url
                .join(path)
                .map_err(|err| Error::Config(format!("invalid probe path {path}: {err}")))?;
            let request = RecordedRequest::get(url);
            let resp = self.executor.execute(&request).await?;
            check_probe(&resp)?;
        }
        Ok(())
    }
}

impl std::fmt::Debug for SessionValidator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionValidator")
            .field("base_url", &self.base_url.as_str())
            .field("probe_paths", &self.probe_paths)
            .finish_non_exhaustive()
    }
}

/// Judge one probe response.
///
/// Every 3xx is a `LoginRedirect` carrying its location, wherever it points;
/// `Checkpoint` is reserved for checkpoint markers in a 2xx body.
pub fn check_probe(resp: &RawResponse) -> std::result::Result<(), Failure> {
    let status = resp.status;

    if (300..400).contains(&status) {
        let failure = Failure::new(FailureKind::LoginRedirect).with_status(status);
        return Err(match resp.location() {
            Some(location) => failure.with_location(location),
            None => failure,
        });
    }

    if status == 401 || status == 403 {
        return Err(Failure::new(FailureKind::Unauthorized)
            .with_status(status)
            .with_body(&resp.body));
    }

    if !(200..300).contains(&status) {
        return Err(Failure::new(FailureKind::Http)
            .with_status(status)
            .with_body(&resp.body));
    }

    let lower = resp.body.to_ascii_lowercase();
    if CHECKPOINT_MARKERS.iter().any(|m| lower.contains(m)) {
        return Err(Failure::new(FailureKind::Checkpoint)
            .with_status(status)
            .with_body(&resp.body));
    }
    if is_html_document(&resp.body) && has_login_page_markers(&resp.body) {
        return Err(Failure::new(FailureKind::HtmlLoginPage)
            .with_status(status)
            .with_body(&resp.body));
    }
    Ok(())
}
