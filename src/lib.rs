//! Session-aware client for a private chat web API.
//!
//! Every HTTP call runs through one classifier that decides between success,
//! retry, redirect and typed failure, and keeps the session's cookies and
//! signing token fresh. Realtime edits are delivered at least once through a
//! bounded pending tracker, and an advisory pacing component suggests safe
//! delays per account.
#![cfg_attr(docsrs, feature(doc_cfg))]
// Allow large error types - boxing the error would change every signature
#![allow(clippy::result_large_err)]

use std::{future::Future, pin::Pin};

/// Default web origin.
pub const DEFAULT_BASE_URL: &str = "https://www.facebook.com";

/// Default User-Agent header value.
pub const DEFAULT_USER_AGENT: &str = "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/124.0.0.0 Safari/537.36";

/// Default connection timeout (10 seconds).
pub const DEFAULT_CONNECT_TIMEOUT: std::time::Duration = std::time::Duration::from_secs(10);

/// Default request timeout (60 seconds).
pub const DEFAULT_REQUEST_TIMEOUT: std::time::Duration = std::time::Duration::from_secs(60);

/// A boxed future type for executor, publisher and hook seams.
pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

pub mod advisor;
pub mod classify;
mod client;
mod core;
mod errors;
mod http;
#[cfg(any(test, feature = "mock"))]
pub mod mock;
pub mod pending;
pub mod realtime;
pub mod session;
mod telemetry;
#[doc(hidden)]
pub mod testing;
pub mod transport;
pub mod validator;

pub use advisor::{ActionClass, ActivityOutcome, AdvisorConfig, RiskSession, RiskStore, RiskTier, SafetyAdvisor};
pub use classify::{classify, ClassifiedOutcome};
pub use client::{Client, ClientBuilder, Config, GraphQLQuery, ReauthHook, GRAPHQL_BATCH_PATH};
pub use errors::{
    APIError, Error, Failure, FailureKind, Result, RetryMetadata, TransportError,
    TransportErrorKind, ValidationError,
};
pub use http::{HeaderEntry, HeaderList, RetryConfig};
pub use pending::{PendingConfig, PendingEdit, PendingEdits, PendingEvent};
pub use realtime::{Publisher, QoS, TaskEnvelope, TaskKind, TASK_TOPIC};
pub use session::{SessionConfig, SessionContext, SigningTokens};
pub use telemetry::{HttpRequestMetrics, MetricsCallbacks, RequestContext};
pub use transport::{
    FilePart, FormValue, HttpExecutor, RawResponse, RecordedRequest, RequestBody, ReqwestExecutor,
};
pub use validator::{SessionValidator, ValidateOptions};
