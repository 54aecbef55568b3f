//! Request/response primitives and the HTTP executor seam.
//!
//! Requests are recorded as plain data ([`RecordedRequest`]) so the classifier
//! can replay them on retry without holding on to a consumed
//! `reqwest::RequestBuilder`.

use std::sync::Arc;

use reqwest::{
    cookie::Jar,
    header::{HeaderMap, HeaderName, HeaderValue, LOCATION, USER_AGENT},
    multipart, Method, Url,
};

use crate::{
    client::Config,
    errors::{Error, Result, TransportError, TransportErrorKind},
    BoxFuture, DEFAULT_CONNECT_TIMEOUT, DEFAULT_REQUEST_TIMEOUT, DEFAULT_USER_AGENT,
};

/// A file attached to a form.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct FilePart {
    pub file_name: String,
    pub content_type: Option<String>,
    pub bytes: Vec<u8>,
}

/// One form field value.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum FormValue {
    Text(String),
    File(FilePart),
}

impl From<&str> for FormValue {
    fn from(value: &str) -> Self {
        FormValue::Text(value.to_string())
    }
}

impl From<String> for FormValue {
    fn from(value: String) -> Self {
        FormValue::Text(value)
    }
}

impl From<FilePart> for FormValue {
    fn from(value: FilePart) -> Self {
        FormValue::File(value)
    }
}

/// Request body, kept replayable.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub enum RequestBody {
    #[default]
    Empty,
    Form(Vec<(String, String)>),
    Multipart(Vec<(String, FormValue)>),
}

impl RequestBody {
    /// Pick the encoding from the fields: any file part forces multipart,
    /// otherwise the form is url-encoded.
    pub fn from_fields(fields: Vec<(String, FormValue)>) -> Self {
        let has_file = fields
            .iter()
            .any(|(_, value)| matches!(value, FormValue::File(_)));
        if has_file {
            return RequestBody::Multipart(fields);
        }
        RequestBody::Form(
            fields
                .into_iter()
                .filter_map(|(key, value)| match value {
                    FormValue::Text(text) => Some((key, text)),
                    FormValue::File(_) => None,
                })
                .collect(),
        )
    }

    pub fn is_multipart(&self) -> bool {
        matches!(self, RequestBody::Multipart(_))
    }
}

/// Everything needed to (re)issue a request.
#[derive(Clone, Debug)]
pub struct RecordedRequest {
    pub method: Method,
    pub url: Url,
    pub headers: HeaderMap,
    pub body: RequestBody,
}

impl RecordedRequest {
    pub fn new(method: Method, url: Url) -> Self {
        Self {
            method,
            url,
            headers: HeaderMap::new(),
            body: RequestBody::Empty,
        }
    }

    pub fn get(url: Url) -> Self {
        Self::new(Method::GET, url)
    }

    /// POST with the body encoding chosen by [`RequestBody::from_fields`].
    pub fn post(url: Url, fields: Vec<(String, FormValue)>) -> Self {
        let mut req = Self::new(Method::POST, url);
        req.body = RequestBody::from_fields(fields);
        req
    }

    pub fn with_query(mut self, params: &[(&str, &str)]) -> Self {
        if !params.is_empty() {
            self.url.query_pairs_mut().extend_pairs(params);
        }
        self
    }

    pub fn with_header(mut self, name: HeaderName, value: HeaderValue) -> Self {
        self.headers.insert(name, value);
        self
    }

    pub fn is_get(&self) -> bool {
        self.method == Method::GET
    }
}

/// Raw result of executing a [`RecordedRequest`].
#[derive(Clone, Debug)]
pub struct RawResponse {
    pub status: u16,
    pub headers: HeaderMap,
    pub body: String,
    pub request: RecordedRequest,
}

impl RawResponse {
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers.get(name).and_then(|v| v.to_str().ok())
    }

    pub fn location(&self) -> Option<&str> {
        self.headers
            .get(LOCATION)
            .and_then(|v| v.to_str().ok())
            .filter(|v| !v.trim().is_empty())
    }
}

/// Executes recorded requests. Implementations must not follow redirects:
/// the classifier decides which redirects are safe to follow.
pub trait HttpExecutor: Send + Sync {
    fn execute<'a>(&'a self, request: &'a RecordedRequest) -> BoxFuture<'a, Result<RawResponse>>;
}

/// [`HttpExecutor`] backed by `reqwest`, sharing the session cookie jar.
#[derive(Clone, Debug)]
pub struct ReqwestExecutor {
    http: reqwest::Client,
}

impl ReqwestExecutor {
    pub fn new(cfg: &Config, jar: Arc<Jar>) -> Result<Self> {
        if let Some(http) = cfg.http_client.clone() {
            return Ok(Self { http });
        }

        let mut headers = match &cfg.default_headers {
            Some(list) => list.to_header_map()?,
            None => HeaderMap::new(),
        };
        let user_agent = cfg
            .user_agent
            .clone()
            .filter(|s| !s.trim().is_empty())
            .unwrap_or_else(|| DEFAULT_USER_AGENT.to_string());
        let user_agent = HeaderValue::from_str(&user_agent)
            .map_err(|err| Error::Config(format!("invalid user agent: {err}")))?;
        headers.insert(USER_AGENT, user_agent);

        let mut builder = reqwest::Client::builder()
            .cookie_provider(jar)
            .redirect(reqwest::redirect::Policy::none())
            .default_headers(headers)
            .connect_timeout(cfg.connect_timeout.unwrap_or(DEFAULT_CONNECT_TIMEOUT))
            .timeout(cfg.timeout.unwrap_or(DEFAULT_REQUEST_TIMEOUT));

        if let Some(proxy) = cfg.proxy.as_deref().filter(|p| !p.trim().is_empty()) {
            let proxy = reqwest::Proxy::all(proxy)
                .map_err(|err| Error::Config(format!("invalid proxy: {err}")))?;
            builder = builder.proxy(proxy);
        }

        let http = builder.build().map_err(|err| TransportError {
            kind: TransportErrorKind::Connect,
            message: "failed to build http client".to_string(),
            source: Some(err),
            retries: None,
        })?;
        Ok(Self { http })
    }

    /// Wrap a caller-built client. It should share the session jar and have
    /// redirects disabled.
    pub fn from_client(http: reqwest::Client) -> Self {
        Self { http }
    }

    async fn send(&self, request: &RecordedRequest) -> Result<RawResponse> {
        let mut builder = self
            .http
            .request(request.method.clone(), request.url.clone())
            .headers(request.headers.clone());

        builder = match &request.body {
            RequestBody::Empty => builder,
            RequestBody::Form(fields) => builder.form(fields),
            RequestBody::Multipart(fields) => builder.multipart(multipart_form(fields)?),
        };

        let resp = builder.send().await.map_err(TransportError::from_reqwest)?;
        let status = resp.status().as_u16();
        let headers = resp.headers().clone();
        let body = resp.text().await.map_err(TransportError::from_reqwest)?;

        Ok(RawResponse {
            status,
            headers,
            body,
            request: request.clone(),
        })
    }
}

impl HttpExecutor for ReqwestExecutor {
    fn execute<'a>(&'a self, request: &'a RecordedRequest) -> BoxFuture<'a, Result<RawResponse>> {
        Box::pin(self.send(request))
    }
}

fn multipart_form(fields: &[(String, FormValue)]) -> Result<multipart::Form> {
    let mut form = multipart::Form::new();
    for (key, value) in fields {
        form = match value {
            FormValue::Text(text) => form.text(key.clone(), text.clone()),
            FormValue::File(file) => {
                let mut part =
                    multipart::Part::bytes(file.bytes.clone()).file_name(file.file_name.clone());
                if let Some(content_type) = &file.content_type {
                    part = part
                        .mime_str(content_type)
                        .map_err(|err| Error::Config(format!("invalid content type: {err}")))?;
                }
                form.part(key.clone(), part)
            }
        };
    }
    Ok(form)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn url() -> Url {
        Url::parse("https://www.facebook.com/ajax/mercury/send.php").unwrap()
    }

    #[test]
    fn text_only_fields_are_url_encoded() {
        let req = RecordedRequest::post(
            url(),
            vec![("a".into(), "1".into()), ("b".into(), "2".into())],
        );
        assert_eq!(
            req.body,
            RequestBody::Form(vec![("a".into(), "1".into()), ("b".into(), "2".into())])
        );
    }

    #[test]
    fn any_file_part_switches_to_multipart() {
        let file = FilePart {
            file_name: "cat.png".into(),
            content_type: Some("image/png".into()),
            bytes: vec![1, 2, 3],
        };
        let req = RecordedRequest::post(
            url(),
            vec![("caption".into(), "hi".into()), ("upload".into(), file.into())],
        );
        assert!(req.body.is_multipart());
        assert!(multipart_form(match &req.body {
            RequestBody::Multipart(fields) => fields,
            _ => unreachable!(),
        })
        .is_ok());
    }

    #[test]
    fn query_params_are_appended() {
        let req = RecordedRequest::get(url()).with_query(&[("x", "1"), ("y", "a b")]);
        assert_eq!(req.url.query(), Some("x=1&y=a+b"));
        assert!(req.is_get());
    }

    #[test]
    fn executor_builds_with_proxy_and_headers() {
        let cfg = Config {
            proxy: Some("http://127.0.0.1:8080".into()),
            user_agent: Some("chatlink-test".into()),
            ..Default::default()
        };
        assert!(ReqwestExecutor::new(&cfg, Arc::new(Jar::default())).is_ok());
    }

    #[test]
    fn executor_rejects_bad_proxy() {
        let cfg = Config {
            proxy: Some("not a url".into()),
            ..Default::default()
        };
        let err = ReqwestExecutor::new(&cfg, Arc::new(Jar::default())).unwrap_err();
        assert!(matches!(err, Error::Config(_)));
    }
}
