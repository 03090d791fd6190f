use std::collections::BTreeMap;
use std::fmt::{Display, Formatter};
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use futures::{Stream, StreamExt};

use crate::error::ApiError;

/// HTTP methods used by the margin analysis endpoints.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum HttpMethod {
    Get,
    Post,
    Put,
    Delete,
}

impl HttpMethod {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Get => "GET",
            Self::Post => "POST",
            Self::Put => "PUT",
            Self::Delete => "DELETE",
        }
    }
}

impl Display for HttpMethod {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Authentication applied to outgoing requests.
#[derive(Clone, PartialEq, Eq, Default)]
pub enum HttpAuth {
    /// Demo mode; no authorization header.
    #[default]
    None,
    BearerToken(String),
}

impl std::fmt::Debug for HttpAuth {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::None => f.write_str("None"),
            Self::BearerToken(_) => f.write_str("BearerToken(***)"),
        }
    }
}

impl HttpAuth {
    pub fn from_token(token: Option<&str>) -> Self {
        token
            .filter(|token| !token.is_empty())
            .map_or(Self::None, |token| Self::BearerToken(token.to_owned()))
    }

    pub fn apply(&self, headers: &mut BTreeMap<String, String>) {
        match self {
            Self::None => {}
            Self::BearerToken(token) => {
                headers.insert(String::from("authorization"), format!("Bearer {token}"));
            }
        }
    }
}

/// Content-type plus authorization, sent with every API request.
pub fn default_headers(auth: &HttpAuth) -> BTreeMap<String, String> {
    let mut headers = BTreeMap::new();
    headers.insert(String::from("content-type"), String::from("application/json"));
    headers.insert(String::from("accept"), String::from("application/json"));
    auth.apply(&mut headers);
    headers
}

/// HTTP request envelope.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HttpRequest {
    pub method: HttpMethod,
    pub url: String,
    pub headers: BTreeMap<String, String>,
    pub body: Option<String>,
    /// `None` leaves the transport default in place (used for streams).
    pub timeout: Option<Duration>,
}

impl HttpRequest {
    pub fn new(method: HttpMethod, url: impl Into<String>) -> Self {
        Self {
            method,
            url: url.into(),
            headers: BTreeMap::new(),
            body: None,
            timeout: Some(Duration::from_secs(30)),
        }
    }

    pub fn get(url: impl Into<String>) -> Self {
        Self::new(HttpMethod::Get, url)
    }

    pub fn post(url: impl Into<String>) -> Self {
        Self::new(HttpMethod::Post, url)
    }

    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers
            .insert(name.into().to_ascii_lowercase(), value.into());
        self
    }

    pub fn with_headers(mut self, headers: BTreeMap<String, String>) -> Self {
        self.headers.extend(headers);
        self
    }

    pub fn with_body(mut self, body: impl Into<String>) -> Self {
        self.body = Some(body.into());
        self
    }

    pub fn with_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.timeout = timeout;
        self
    }
}

/// HTTP response envelope.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HttpResponse {
    pub status: u16,
    pub status_text: String,
    pub retry_after: Option<Duration>,
    pub body: String,
}

impl HttpResponse {
    pub fn ok_json(body: impl Into<String>) -> Self {
        Self::with_status(200, body)
    }

    pub fn with_status(status: u16, body: impl Into<String>) -> Self {
        Self {
            status,
            status_text: String::new(),
            retry_after: None,
            body: body.into(),
        }
    }

    pub const fn is_success(&self) -> bool {
        self.status >= 200 && self.status < 300
    }

    /// Typed error for a non-2xx response.
    pub fn to_error(&self) -> ApiError {
        let error = ApiError::from_status(self.status, &self.status_text);
        match self.retry_after {
            Some(retry_after) => error.with_retry_after(retry_after),
            None => error,
        }
    }
}

/// Where a transport call failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HttpErrorKind {
    Timeout,
    Connect,
    Body,
    Other,
}

/// Transport-level HTTP error.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HttpError {
    kind: HttpErrorKind,
    message: String,
}

impl HttpError {
    pub fn new(kind: HttpErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }

    pub fn timeout(message: impl Into<String>) -> Self {
        Self::new(HttpErrorKind::Timeout, message)
    }

    pub fn connect(message: impl Into<String>) -> Self {
        Self::new(HttpErrorKind::Connect, message)
    }

    pub fn kind(&self) -> HttpErrorKind {
        self.kind
    }

    pub fn message(&self) -> &str {
        &self.message
    }
}

impl Display for HttpError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.message)
    }
}

impl std::error::Error for HttpError {}

impl From<HttpError> for ApiError {
    fn from(error: HttpError) -> Self {
        match error.kind {
            HttpErrorKind::Timeout => ApiError::timeout(error.message),
            HttpErrorKind::Connect | HttpErrorKind::Body => ApiError::transient(error.message),
            HttpErrorKind::Other => ApiError::unknown(error.message),
        }
    }
}

/// Raw body chunks of a streamed response.
pub type ChunkStream = Pin<Box<dyn Stream<Item = Result<Vec<u8>, HttpError>> + Send>>;

/// Streamed response: status line plus a body that arrives incrementally.
pub struct StreamingResponse {
    pub status: u16,
    pub status_text: String,
    pub chunks: ChunkStream,
}

/// Transport contract so the client can run against reqwest or a test double.
pub trait HttpClient: Send + Sync {
    fn execute<'a>(
        &'a self,
        request: HttpRequest,
    ) -> Pin<Box<dyn Future<Output = Result<HttpResponse, HttpError>> + Send + 'a>>;

    /// Streamed variant. The default buffers via [`Self::execute`] and yields
    /// the body as a single chunk.
    fn execute_stream<'a>(
        &'a self,
        request: HttpRequest,
    ) -> Pin<Box<dyn Future<Output = Result<StreamingResponse, HttpError>> + Send + 'a>> {
        Box::pin(async move {
            let response = self.execute(request).await?;
            let body = response.body.into_bytes();
            Ok(StreamingResponse {
                status: response.status,
                status_text: response.status_text,
                chunks: Box::pin(futures::stream::iter([Ok(body)])),
            })
        })
    }
}

/// Production HTTP client backed by reqwest.
#[derive(Debug, Clone)]
pub struct ReqwestHttpClient {
    client: Arc<reqwest::Client>,
}

impl ReqwestHttpClient {
    pub fn new() -> Self {
        Self {
            client: Arc::new(
                reqwest::Client::builder()
                    .user_agent(concat!("margin-core/", env!("CARGO_PKG_VERSION")))
                    .build()
                    .unwrap_or_else(|_| reqwest::Client::new()),
            ),
        }
    }

    pub fn with_client(client: reqwest::Client) -> Self {
        Self {
            client: Arc::new(client),
        }
    }

    async fn send(&self, request: HttpRequest) -> Result<reqwest::Response, HttpError> {
        let mut builder = match request.method {
            HttpMethod::Get => self.client.get(&request.url),
            HttpMethod::Post => self.client.post(&request.url),
            HttpMethod::Put => self.client.put(&request.url),
            HttpMethod::Delete => self.client.delete(&request.url),
        };

        for (name, value) in &request.headers {
            builder = builder.header(name, value);
        }

        if let Some(timeout) = request.timeout {
            builder = builder.timeout(timeout);
        }

        if let Some(body) = request.body {
            builder = builder.body(body);
        }

        builder.send().await.map_err(map_reqwest_error)
    }
}

impl Default for ReqwestHttpClient {
    fn default() -> Self {
        Self::new()
    }
}

fn map_reqwest_error(error: reqwest::Error) -> HttpError {
    if error.is_timeout() {
        HttpError::timeout(format!("request timeout: {error}"))
    } else if error.is_connect() {
        HttpError::connect(format!("connection failed: {error}"))
    } else if error.is_body() || error.is_decode() {
        HttpError::new(HttpErrorKind::Body, format!("failed to read response body: {error}"))
    } else {
        HttpError::new(HttpErrorKind::Other, format!("request failed: {error}"))
    }
}

fn parse_retry_after(response: &reqwest::Response) -> Option<Duration> {
    response
        .headers()
        .get(reqwest::header::RETRY_AFTER)?
        .to_str()
        .ok()?
        .trim()
        .parse::<u64>()
        .ok()
        .map(Duration::from_secs)
}

impl HttpClient for ReqwestHttpClient {
    fn execute<'a>(
        &'a self,
        request: HttpRequest,
    ) -> Pin<Box<dyn Future<Output = Result<HttpResponse, HttpError>> + Send + 'a>> {
        Box::pin(async move {
            let response = self.send(request).await?;

            let status = response.status();
            let retry_after = parse_retry_after(&response);
            let body = response.text().await.map_err(map_reqwest_error)?;

            Ok(HttpResponse {
                status: status.as_u16(),
                status_text: status.canonical_reason().unwrap_or_default().to_owned(),
                retry_after,
                body,
            })
        })
    }

    fn execute_stream<'a>(
        &'a self,
        request: HttpRequest,
    ) -> Pin<Box<dyn Future<Output = Result<StreamingResponse, HttpError>> + Send + 'a>> {
        Box::pin(async move {
            let response = self.send(request).await?;
            let status = response.status();
            let chunks = response
                .bytes_stream()
                .map(|chunk| chunk.map(|bytes| bytes.to_vec()).map_err(map_reqwest_error));

            Ok(StreamingResponse {
                status: status.as_u16(),
                status_text: status.canonical_reason().unwrap_or_default().to_owned(),
                chunks: Box::pin(chunks),
            })
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ErrorKind;

    #[test]
    fn default_headers_carry_content_type_and_bearer() {
        let headers = default_headers(&HttpAuth::BearerToken(String::from("token-123")));

        assert_eq!(
            headers.get("authorization").map(String::as_str),
            Some("Bearer token-123")
        );
        assert_eq!(
            headers.get("content-type").map(String::as_str),
            Some("application/json")
        );
    }

    #[test]
    fn demo_mode_sends_no_authorization() {
        let headers = default_headers(&HttpAuth::from_token(Some("")));

        assert!(!headers.contains_key("authorization"));
        assert_eq!(HttpAuth::from_token(None), HttpAuth::None);
    }

    #[test]
    fn debug_output_hides_token() {
        let auth = HttpAuth::BearerToken(String::from("super-secret"));
        assert!(!format!("{auth:?}").contains("super-secret"));
    }

    #[test]
    fn transport_errors_map_to_taxonomy() {
        assert_eq!(
            ApiError::from(HttpError::timeout("deadline")).kind(),
            ErrorKind::Timeout
        );
        assert_eq!(
            ApiError::from(HttpError::connect("refused")).kind(),
            ErrorKind::Transient
        );
        assert_eq!(
            ApiError::from(HttpError::new(HttpErrorKind::Other, "weird")).kind(),
            ErrorKind::Unknown
        );
    }

    #[test]
    fn non_success_response_keeps_retry_after() {
        let response = HttpResponse {
            retry_after: Some(Duration::from_secs(3)),
            ..HttpResponse::with_status(429, "")
        };

        let error = response.to_error();
        assert_eq!(error.kind(), ErrorKind::RateLimited);
        assert_eq!(error.retry_after(), Some(Duration::from_secs(3)));
    }
}
