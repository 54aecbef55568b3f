use std::{
    collections::HashMap,
    fmt,
    future::Future,
    sync::Arc,
    time::{Duration, Instant},
};

use reqwest::Url;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tokio::time::sleep;
#[cfg(feature = "tracing")]
use tracing::Instrument;

use crate::{
    advisor::{ActivityOutcome, AdvisorConfig, RiskStore, SafetyAdvisor},
    classify::{classify, ClassifiedOutcome},
    core::RetryState,
    errors::{APIError, Error, Failure, FailureKind, Result, ValidationError},
    http::{HeaderList, RetryConfig},
    pending::{PendingConfig, PendingEdits},
    realtime::{Publisher, QoS, TaskEnvelope, TASK_TOPIC},
    session::SessionContext,
    telemetry::{HttpRequestMetrics, MetricsCallbacks, RequestContext, Telemetry},
    transport::{FormValue, HttpExecutor, RecordedRequest, ReqwestExecutor},
    validator::{SessionValidator, ValidateOptions},
    BoxFuture, DEFAULT_BASE_URL,
};

/// Endpoint that accepts batched GraphQL document queries.
pub const GRAPHQL_BATCH_PATH: &str = "/api/graphqlbatch/";

#[derive(Clone, Debug, Default)]
pub struct Config {
    /// Origin all relative paths are joined to (defaults to the web origin).
    pub base_url: Option<String>,
    pub user_agent: Option<String>,
    /// Proxy URL applied to every request.
    pub proxy: Option<String>,
    /// Caller-built client. It must share the session jar and not follow redirects.
    pub http_client: Option<reqwest::Client>,
    /// Override the connect timeout (defaults to 10s).
    pub connect_timeout: Option<Duration>,
    /// Override the request timeout (defaults to 60s).
    pub timeout: Option<Duration>,
    /// Retry/redirect policy (defaults to 5 retries, 5 redirects, up to 5s delay).
    pub retry: Option<RetryConfig>,
    /// Default extra headers applied to all requests.
    pub default_headers: Option<HeaderList>,
    /// Pages probed by [`Client::validate_session`].
    pub probe_paths: Option<Vec<String>>,
    /// Edit tracker limits (only used when a publisher is attached).
    pub pending: Option<PendingConfig>,
    pub advisor: Option<AdvisorConfig>,
    /// Optional metrics callbacks (HTTP latency, pending edit lifecycle).
    pub metrics: Option<MetricsCallbacks>,
}

/// Hook run when a response says the session is logged out.
///
/// At most one invocation is in flight per session; outcomes are recorded in
/// the session health counters. Implemented for any
/// `Fn() -> impl Future<Output = Result<()>>`.
pub trait ReauthHook: Send + Sync {
    fn reauthenticate(&self) -> BoxFuture<'static, Result<()>>;
}

impl<F, Fut> ReauthHook for F
where
    F: Fn() -> Fut + Send + Sync,
    Fut: Future<Output = Result<()>> + Send + 'static,
{
    fn reauthenticate(&self) -> BoxFuture<'static, Result<()>> {
        Box::pin(self())
    }
}

/// One document query inside a [`Client::graphql_batch`] call.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct GraphQLQuery {
    pub doc_id: String,
    #[serde(rename = "query_params")]
    pub variables: Value,
}

impl GraphQLQuery {
    pub fn new(doc_id: impl Into<String>, variables: Value) -> Self {
        Self {
            doc_id: doc_id.into(),
            variables,
        }
    }
}

#[derive(Clone)]
pub struct Client {
    inner: Arc<ClientInner>,
}

struct ClientInner {
    base_url: Url,
    retry: RetryConfig,
    executor: Arc<dyn HttpExecutor>,
    session: Arc<SessionContext>,
    publisher: Option<Arc<dyn Publisher>>,
    pending: Option<PendingEdits>,
    reauth: Option<Arc<dyn ReauthHook>>,
    advisor: SafetyAdvisor,
    validator: SessionValidator,
    telemetry: Telemetry,
}

/// Assembles a [`Client`] around a session.
pub struct ClientBuilder {
    config: Config,
    session: Arc<SessionContext>,
    executor: Option<Arc<dyn HttpExecutor>>,
    publisher: Option<Arc<dyn Publisher>>,
    reauth: Option<Arc<dyn ReauthHook>>,
    risk_store: Option<Arc<RiskStore>>,
}

impl fmt::Debug for ClientBuilder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ClientBuilder")
            .field("config", &self.config)
            .field("session", &self.session)
            .field("executor", &self.executor.as_ref().map(|_| "custom"))
            .field("publisher", &self.publisher.as_ref().map(|_| "publisher"))
            .field("reauth", &self.reauth.as_ref().map(|_| "hook"))
            .finish()
    }
}

impl ClientBuilder {
    pub fn new(session: impl Into<Arc<SessionContext>>) -> Self {
        Self {
            config: Config::default(),
            session: session.into(),
            executor: None,
            publisher: None,
            reauth: None,
            risk_store: None,
        }
    }

    pub fn config(mut self, config: Config) -> Self {
        self.config = config;
        self
    }

    /// Replace the reqwest-backed executor (tests, custom transports).
    pub fn executor(mut self, executor: Arc<dyn HttpExecutor>) -> Self {
        self.executor = Some(executor);
        self
    }

    /// Attach the realtime channel; enables edits, pins and reactions.
    pub fn publisher(mut self, publisher: Arc<dyn Publisher>) -> Self {
        self.publisher = Some(publisher);
        self
    }

    pub fn reauth_hook(mut self, hook: impl ReauthHook + 'static) -> Self {
        self.reauth = Some(Arc::new(hook));
        self
    }

    /// Share advisor state between clients of the same account.
    pub fn risk_store(mut self, store: Arc<RiskStore>) -> Self {
        self.risk_store = Some(store);
        self
    }

    pub fn build(self) -> Result<Client> {
        let cfg = self.config;
        let base = cfg
            .base_url
            .clone()
            .filter(|s| !s.trim().is_empty())
            .unwrap_or_else(|| DEFAULT_BASE_URL.to_string());
        let base_url = Url::parse(base.trim_end_matches('/'))
            .map_err(|err| Error::Config(format!("invalid base url: {err}")))?;

        let executor: Arc<dyn HttpExecutor> = match self.executor {
            Some(executor) => executor,
            None => Arc::new(ReqwestExecutor::new(&cfg, self.session.jar())?),
        };

        let telemetry = Telemetry::new(cfg.metrics.clone());
        let pending = self.publisher.as_ref().map(|publisher| {
            PendingEdits::with_telemetry(
                cfg.pending.clone().unwrap_or_default(),
                Arc::clone(publisher),
                Arc::clone(&self.session),
                telemetry.clone(),
            )
        });

        let validator = SessionValidator::new(
            Arc::clone(&executor),
            Arc::clone(&self.session),
            base_url.clone(),
        )
        .with_probe_paths(cfg.probe_paths.clone().unwrap_or_default());

        let advisor = SafetyAdvisor::with_config(
            self.risk_store.unwrap_or_default(),
            cfg.advisor.clone().unwrap_or_default(),
        );

        Ok(Client {
            inner: Arc::new(ClientInner {
                base_url,
                retry: cfg.retry.unwrap_or_default(),
                executor,
                session: self.session,
                publisher: self.publisher,
                pending,
                reauth: self.reauth,
                advisor,
                validator,
                telemetry,
            }),
        })
    }
}

impl Client {
    pub fn builder(session: impl Into<Arc<SessionContext>>) -> ClientBuilder {
        ClientBuilder::new(session)
    }

    /// Client over the default reqwest executor, without a realtime channel.
    pub fn new(cfg: Config, session: impl Into<Arc<SessionContext>>) -> Result<Self> {
        ClientBuilder::new(session).config(cfg).build()
    }

    pub fn session(&self) -> &Arc<SessionContext> {
        &self.inner.session
    }

    pub fn advisor(&self) -> &SafetyAdvisor {
        &self.inner.advisor
    }

    /// Edit tracker; `None` until a publisher is attached.
    pub fn pending(&self) -> Option<&PendingEdits> {
        self.inner.pending.as_ref()
    }

    pub fn base_url(&self) -> &Url {
        &self.inner.base_url
    }

    /// GET `path` and return the classified payload.
    pub async fn get(&self, path: &str, query: &[(&str, &str)]) -> Result<Value> {
        let request = RecordedRequest::get(self.inner.url_for(path)?).with_query(query);
        let ctx = RequestContext::new("GET", path);
        self.inner.resolve(request, ctx).await
    }

    /// POST a form signed with the session's token fields. Any file value
    /// switches the body to multipart.
    pub async fn post_form(&self, path: &str, fields: Vec<(String, FormValue)>) -> Result<Value> {
        let url = self.inner.url_for(path)?;
        let (request_id, signed) = self.inner.session.sign();
        let mut form: Vec<(String, FormValue)> = signed
            .into_iter()
            .map(|(key, value)| (key, FormValue::Text(value)))
            .collect();
        form.extend(fields);
        let request = RecordedRequest::post(url, form);
        let ctx = RequestContext::new("POST", path).with_request_id(Some(request_id));
        self.inner.resolve(request, ctx).await
    }

    /// Run several document queries in one request. Results come back in
    /// query order; a missing or errored entry fails the whole call.
    pub async fn graphql_batch(&self, queries: &[GraphQLQuery]) -> Result<Vec<Value>> {
        if queries.is_empty() {
            return Err(ValidationError::new("at least one query is required")
                .with_field("queries")
                .into());
        }
        let batch: Map<String, Value> = queries
            .iter()
            .enumerate()
            .map(|(i, query)| Ok((format!("q{i}"), serde_json::to_value(query)?)))
            .collect::<Result<_>>()?;
        let fields = vec![
            ("queries".to_string(), FormValue::Text(Value::Object(batch).to_string())),
            ("batch_name".to_string(), FormValue::Text("MessengerGraphQLBatch".to_string())),
        ];
        let payload = self.post_form(GRAPHQL_BATCH_PATH, fields).await?;
        collect_batch(payload, queries.len())
    }

    /// Publish an edit and track it until [`Client::acknowledge_edit`].
    pub async fn edit_message(&self, message_id: &str, text: &str) -> Result<()> {
        let pending = self.inner.pending.as_ref().ok_or_else(no_publisher)?;
        let result = pending.submit(message_id, text).await;
        self.inner.record_activity(result.is_ok());
        result
    }

    /// Mark an edit as confirmed by the server. Unknown ids are not an error.
    pub fn acknowledge_edit(&self, message_id: &str) -> bool {
        self.inner
            .pending
            .as_ref()
            .is_some_and(|pending| pending.acknowledge(message_id))
    }

    pub async fn pin_message(&self, thread_id: &str, message_id: &str, pinned: bool) -> Result<()> {
        self.inner
            .publish_task(TaskEnvelope::pin_message(thread_id, message_id, pinned))
            .await
    }

    /// React to a message; an empty `reaction` clears it.
    pub async fn react(&self, thread_id: &str, message_id: &str, reaction: &str) -> Result<()> {
        self.inner
            .publish_task(TaskEnvelope::react(thread_id, message_id, reaction))
            .await
    }

    /// Check the session with the configured probe pages.
    pub async fn validate_session(&self, options: &ValidateOptions) -> Result<()> {
        let result = self.inner.validator.validate(options).await;
        self.inner.record_activity(result.is_ok());
        result
    }
}

fn no_publisher() -> Error {
    Error::Config("no realtime publisher configured".to_string())
}

/// Map a batch payload back to query order.
fn collect_batch(payload: Value, count: usize) -> Result<Vec<Value>> {
    let objects = match payload {
        Value::Array(items) => items,
        other => vec![other],
    };
    let mut entries: HashMap<String, Value> = HashMap::new();
    for object in objects {
        if let Value::Object(map) = object {
            entries.extend(map.into_iter().filter(|(key, _)| key.starts_with('q')));
        }
    }

    (0..count)
        .map(|i| {
            let key = format!("q{i}");
            let entry = entries
                .remove(&key)
                .ok_or_else(|| APIError::new(format!("batch result {key} missing")))?;
            if let Some(err) = batch_entry_error(&entry) {
                return Err(err.into());
            }
            Ok(match entry {
                Value::Object(mut map) => match map.remove("data") {
                    Some(data) => data,
                    None => map.remove("response").unwrap_or(Value::Object(map)),
                },
                other => other,
            })
        })
        .collect()
}

fn batch_entry_error(entry: &Value) -> Option<APIError> {
    if let Some(error) = entry.get("error").filter(|e| !e.is_null()) {
        let code = error
            .as_i64()
            .or_else(|| error.get("code").and_then(Value::as_i64));
        let message = error
            .get("message")
            .and_then(Value::as_str)
            .or_else(|| entry.get("errorSummary").and_then(Value::as_str))
            .unwrap_or("batch query failed")
            .to_string();
        let mut err = APIError::new(message);
        err.raw_body = Some(entry.to_string());
        return Some(match code {
            Some(code) => err.with_code(code),
            None => err,
        });
    }

    let first = entry.get("errors").and_then(Value::as_array)?.first()?;
    let mut err = APIError::new(
        first
            .get("message")
            .and_then(Value::as_str)
            .unwrap_or("batch query failed"),
    );
    err.raw_body = Some(entry.to_string());
    Some(match first.get("code").and_then(Value::as_i64) {
        Some(code) => err.with_code(code),
        None => err,
    })
}

impl ClientInner {
    fn url_for(&self, path: &str) -> Result<Url> {
        if path.starts_with("http://") || path.starts_with("https://") {
            Url::parse(path).map_err(|err| Error::Config(err.to_string()))
        } else {
            self.base_url
                .join(path)
                .map_err(|err| Error::Config(format!("invalid path: {err}")))
        }
    }

    fn record_activity(&self, ok: bool) {
        let outcome = if ok {
            ActivityOutcome::Success
        } else {
            ActivityOutcome::Error
        };
        self.advisor.record_activity(self.session.identity(), outcome);
    }

    async fn publish_task(&self, envelope: TaskEnvelope) -> Result<()> {
        let publisher = self.publisher.as_ref().ok_or_else(no_publisher)?;
        let payload = envelope.encode(&self.session)?;
        let result = publisher.publish(TASK_TOPIC, payload, QoS::AtLeastOnce).await;
        self.record_activity(result.is_ok());
        result
    }

    /// Drive one logical call: execute, classify, and replay or follow
    /// until a terminal outcome. Bounded by `max_retries + max_redirects + 1`
    /// executed requests.
    async fn resolve(&self, request: RecordedRequest, ctx: RequestContext) -> Result<Value> {
        let start = Instant::now();
        let mut state = RetryState::new();
        let mut current = request;
        let mut retries = 0u32;
        let mut redirects = 0u32;

        while state.attempts < self.retry.max_steps() {
            state.record_attempt();
            let exec = self.executor.execute(&current);
            #[cfg(feature = "tracing")]
            let exec = exec.instrument(tracing::debug_span!(
                "chatlink.http",
                method = %current.method,
                path = current.url.path(),
                attempt = state.attempts,
                retries,
                redirects
            ));
            let resp = match exec.await {
                Ok(resp) => resp,
                Err(err) => {
                    state.record_error(&err);
                    let err = attach_retries(err, &state);
                    self.session.record_health("http.transport");
                    self.record_activity(false);
                    #[cfg(feature = "tracing")]
                    tracing::warn!(error = %err, attempts = state.attempts, "request failed");
                    self.finish(&ctx, start, None, Some(err.to_string()), &state, redirects);
                    return Err(err);
                }
            };
            state.record_status(resp.status);

            match classify(&resp, retries, &self.retry, &self.session) {
                ClassifiedOutcome::Success(value) => {
                    self.finish(&ctx, start, Some(resp.status), None, &state, redirects);
                    #[cfg(feature = "tracing")]
                    tracing::debug!(
                        status = resp.status,
                        elapsed_ms = start.elapsed().as_millis() as u64,
                        "request completed"
                    );
                    self.record_activity(true);
                    return Ok(value);
                }
                ClassifiedOutcome::Retry { after } => {
                    retries += 1;
                    self.session.record_health("http.retry");
                    #[cfg(feature = "tracing")]
                    tracing::debug!(
                        status = resp.status,
                        retries,
                        delay_ms = after.as_millis() as u64,
                        "server error; retrying"
                    );
                    sleep(after).await;
                }
                ClassifiedOutcome::Redirect { location } => {
                    if redirects >= self.retry.max_redirects {
                        let failure = Failure::new(FailureKind::TooManyRedirects)
                            .with_location(location.as_str());
                        return Err(self.fail(failure, &ctx, start, &state, redirects));
                    }
                    redirects += 1;
                    #[cfg(feature = "tracing")]
                    tracing::debug!(location = %location, redirects, "following redirect");
                    current = RecordedRequest::get(location);
                }
                ClassifiedOutcome::AuthFailure(failure) => {
                    if failure.kind == FailureKind::NotLoggedIn {
                        self.trigger_reauth();
                    }
                    return Err(self.fail(failure, &ctx, start, &state, redirects));
                }
                ClassifiedOutcome::MalformedBody { snippet } => {
                    let failure = Failure::new(FailureKind::JsonParse)
                        .with_status(resp.status)
                        .with_body(&snippet);
                    return Err(self.fail(failure, &ctx, start, &state, redirects));
                }
                ClassifiedOutcome::Fatal(failure) => {
                    return Err(self.fail(failure, &ctx, start, &state, redirects));
                }
            }
        }

        let failure = Failure::new(FailureKind::TooManyRedirects);
        Err(self.fail(failure, &ctx, start, &state, redirects))
    }

    fn fail(
        &self,
        failure: Failure,
        ctx: &RequestContext,
        start: Instant,
        state: &RetryState,
        redirects: u32,
    ) -> Error {
        let failure = failure.with_retries(state.metadata());
        self.session
            .record_health(&format!("http.{}", failure.kind.as_str()));
        self.record_activity(false);
        #[cfg(feature = "tracing")]
        tracing::warn!(
            kind = failure.kind.as_str(),
            status = failure.status,
            attempts = state.attempts,
            "request failed"
        );
        self.finish(
            ctx,
            start,
            failure.status,
            Some(failure.kind.as_str().to_string()),
            state,
            redirects,
        );
        Error::Failure(failure)
    }

    fn finish(
        &self,
        ctx: &RequestContext,
        start: Instant,
        status: Option<u16>,
        error: Option<String>,
        state: &RetryState,
        redirects: u32,
    ) {
        if self.telemetry.http_enabled() {
            self.telemetry.record_http(HttpRequestMetrics {
                latency: start.elapsed(),
                status,
                error,
                retries: state.metadata(),
                redirects,
                context: ctx.clone(),
            });
        }
    }

    /// Start the re-authentication hook unless one is already running.
    fn trigger_reauth(&self) {
        let Some(hook) = self.reauth.as_ref() else {
            return;
        };
        if !self.session.try_begin_reauth() {
            #[cfg(feature = "tracing")]
            tracing::debug!("re-authentication already in flight");
            return;
        }
        #[cfg(feature = "tracing")]
        tracing::info!(identity = self.session.identity(), "session logged out; re-authenticating");
        self.session.record_health("reauth.started");

        let session = Arc::clone(&self.session);
        let fut = hook.reauthenticate();
        tokio::spawn(async move {
            let result = fut.await;
            session.finish_reauth();
            match result {
                Ok(()) => {
                    session.record_health("reauth.ok");
                }
                Err(_err) => {
                    session.record_health("reauth.failed");
                    #[cfg(feature = "tracing")]
                    tracing::warn!(error = %_err, "re-authentication failed");
                }
            }
        });
    }
}

fn attach_retries(err: Error, state: &RetryState) -> Error {
    match err {
        Error::Transport(mut transport) => {
            transport.retries = state.metadata();
            Error::Transport(transport)
        }
        other => other,
    }
}
