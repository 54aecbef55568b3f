//! In-memory collaborators for offline tests.

use std::{
    collections::VecDeque,
    sync::{Arc, Mutex},
};

use reqwest::header::{HeaderMap, HeaderValue, LOCATION};

use crate::{
    errors::{Error, Result},
    realtime::{Publisher, QoS},
    transport::{HttpExecutor, RawResponse, RecordedRequest},
    BoxFuture,
};

/// Canned response returned by [`MockExecutor`].
#[derive(Clone, Debug)]
pub struct MockResponse {
    pub status: u16,
    pub headers: HeaderMap,
    pub body: String,
}

impl MockResponse {
    pub fn new(status: u16, body: impl Into<String>) -> Self {
        Self {
            status,
            headers: HeaderMap::new(),
            body: body.into(),
        }
    }

    pub fn json(value: serde_json::Value) -> Self {
        Self::new(200, value.to_string())
    }

    pub fn redirect(status: u16, location: &str) -> Self {
        let mut resp = Self::new(status, "");
        if let Ok(value) = HeaderValue::from_str(location) {
            resp.headers.insert(LOCATION, value);
        }
        resp
    }
}

/// Executor that replays a scripted sequence of responses and records every
/// request it was asked to run. Once the script runs out it answers 500.
#[derive(Clone, Default)]
pub struct MockExecutor {
    inner: Arc<MockInner>,
}

#[derive(Default)]
struct MockInner {
    responses: Mutex<VecDeque<Result<MockResponse>>>,
    requests: Mutex<Vec<RecordedRequest>>,
}

impl MockExecutor {
    pub fn new(responses: Vec<MockResponse>) -> Self {
        let exec = Self::default();
        for resp in responses {
            exec.push(resp);
        }
        exec
    }

    pub fn push(&self, resp: MockResponse) {
        lock(&self.inner.responses).push_back(Ok(resp));
    }

    pub fn push_error(&self, err: Error) {
        lock(&self.inner.responses).push_back(Err(err));
    }

    /// Requests executed so far, in order.
    pub fn requests(&self) -> Vec<RecordedRequest> {
        lock(&self.inner.requests).clone()
    }

    pub fn request_count(&self) -> usize {
        lock(&self.inner.requests).len()
    }
}

impl HttpExecutor for MockExecutor {
    fn execute<'a>(&'a self, request: &'a RecordedRequest) -> BoxFuture<'a, Result<RawResponse>> {
        lock(&self.inner.requests).push(request.clone());
        let next = lock(&self.inner.responses)
            .pop_front()
            .unwrap_or_else(|| Ok(MockResponse::new(500, "no more mock responses configured")));
        Box::pin(async move {
            let resp = next?;
            Ok(RawResponse {
                status: resp.status,
                headers: resp.headers,
                body: resp.body,
                request: request.clone(),
            })
        })
    }
}

/// Publisher that keeps every successful publish and can be told to fail.
#[derive(Default)]
pub struct RecordingPublisher {
    published: Mutex<Vec<(String, Vec<u8>)>>,
    failures_left: Mutex<u32>,
}

impl RecordingPublisher {
    /// Fail the next `n` publishes.
    pub fn fail_next(&self, n: u32) {
        *lock(&self.failures_left) = n;
    }

    pub fn published(&self) -> Vec<(String, Vec<u8>)> {
        lock(&self.published).clone()
    }

    pub fn count(&self) -> usize {
        lock(&self.published).len()
    }
}

impl Publisher for RecordingPublisher {
    fn publish<'a>(&'a self, topic: &'a str, payload: Vec<u8>, _qos: QoS) -> BoxFuture<'a, Result<()>> {
        Box::pin(async move {
            {
                let mut failures = lock(&self.failures_left);
                if *failures > 0 {
                    *failures -= 1;
                    return Err(Error::Publish {
                        topic: topic.to_string(),
                        message: "broker unavailable".to_string(),
                    });
                }
            }
            lock(&self.published).push((topic.to_string(), payload));
            Ok(())
        })
    }
}

fn lock<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    match mutex.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}
