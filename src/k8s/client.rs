// Request execution against the Kubernetes API server
use crate::error::{Error, Result as NwResult};
use async_trait::async_trait;
use bytes::{Bytes, BytesMut};
use futures::stream::{self, BoxStream};
use futures::{StreamExt, TryStreamExt};
use reqwest::header::{AUTHORIZATION, CONTENT_TYPE, HeaderMap, HeaderValue, USER_AGENT};
use reqwest::{Method, Url};
use serde::de::DeserializeOwned;
use std::path::Path;
use tracing::{debug, warn};

use super::USER_AGENT as DEFAULT_USER_AGENT;

const SERVICE_ACCOUNT_TOKEN: &str = "/var/run/secrets/kubernetes.io/serviceaccount/token";
const SERVICE_ACCOUNT_CA: &str = "/var/run/secrets/kubernetes.io/serviceaccount/ca.crt";

/// Response body, delivered chunk by chunk
pub type ResponseBody = BoxStream<'static, NwResult<Bytes>>;

/// A single request handed to a [`RequestExecutor`]
#[derive(Debug, Clone)]
pub struct ApiRequest {
    pub method: Method,
    pub url: Url,
    pub headers: Vec<(String, String)>,
}

impl ApiRequest {
    #[must_use]
    pub const fn get(url: Url) -> Self {
        Self {
            method: Method::GET,
            url,
            headers: Vec::new(),
        }
    }

    #[must_use]
    pub fn header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.push((name.into(), value.into()));
        self
    }
}

/// Uniform result of one request. Transport failures are reported with
/// `ok == false` and `status == 0` instead of an error.
pub struct ApiResponse {
    pub ok: bool,
    pub status: u16,
    pub status_text: String,
    pub body: ResponseBody,
}

impl ApiResponse {
    #[must_use]
    pub fn new(status: u16, status_text: impl Into<String>, body: ResponseBody) -> Self {
        Self {
            ok: (200..300).contains(&status),
            status,
            status_text: status_text.into(),
            body,
        }
    }

    /// Fully buffered response, mostly useful for list calls and tests
    #[must_use]
    pub fn buffered(status: u16, status_text: impl Into<String>, body: impl Into<Bytes>) -> Self {
        let body: Bytes = body.into();
        Self::new(status, status_text, stream::once(async move { Ok::<_, Error>(body) }).boxed())
    }

    /// Response standing in for a request that never reached the server
    #[must_use]
    pub fn network_error(error: &Error) -> Self {
        Self {
            ok: false,
            status: 0,
            status_text: error.to_string(),
            body: stream::empty().boxed(),
        }
    }

    /// The error describing a failed response
    #[must_use]
    pub fn error(&self) -> Error {
        Error::status(self.status, self.status_text.clone())
    }

    /// Collect the whole body
    ///
    /// # Errors
    ///
    /// Returns the first error raised while reading the body
    pub async fn bytes(self) -> NwResult<Bytes> {
        let buffer = self
            .body
            .try_fold(BytesMut::new(), |mut acc, chunk| async move {
                acc.extend_from_slice(&chunk);
                Ok::<_, Error>(acc)
            })
            .await?;
        Ok(buffer.freeze())
    }

    /// Collect and decode the body as JSON
    ///
    /// # Errors
    ///
    /// Returns an error if the body can not be read or decoded
    pub async fn json<T: DeserializeOwned>(self) -> NwResult<T> {
        let bytes = self.bytes().await?;
        Ok(k8s_openapi::serde_json::from_slice(&bytes)?)
    }
}

impl core::fmt::Debug for ApiResponse {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("ApiResponse")
            .field("ok", &self.ok)
            .field("status", &self.status)
            .field("status_text", &self.status_text)
            .finish_non_exhaustive()
    }
}

/// Performs HTTP calls for watch sessions. Authentication, TLS and request
/// signing live behind this seam.
#[async_trait]
pub trait RequestExecutor: Send + Sync {
    /// Base URL of the API server
    fn server_url(&self) -> &Url;

    /// Execute one request. Must not fail for ordinary HTTP errors.
    async fn execute(&self, request: ApiRequest) -> ApiResponse;
}

/// `reqwest` backed executor
#[derive(Debug, Clone)]
pub struct HttpExecutor {
    client: reqwest::Client,
    server_url: Url,
    token: Option<String>,
}

impl HttpExecutor {
    /// Create an executor talking to `server_url`
    ///
    /// # Errors
    ///
    /// Returns an error if the url is invalid or the http client can not be built
    pub fn new(server_url: &str) -> NwResult<Self> {
        Self::builder(server_url, None)
    }

    /// Create an executor trusting an additional PEM encoded root certificate
    ///
    /// # Errors
    ///
    /// Returns an error if the url or certificate is invalid
    pub fn with_root_certificate(server_url: &str, pem: &[u8]) -> NwResult<Self> {
        Self::builder(server_url, Some(pem))
    }

    /// Build an executor from the pod's service account
    ///
    /// # Errors
    ///
    /// Returns an error when not running inside a cluster
    pub fn in_cluster() -> NwResult<Self> {
        let host = std::env::var("KUBERNETES_SERVICE_HOST")
            .map_err(|_| Error::Custom("KUBERNETES_SERVICE_HOST is not set".to_string()))?;
        let port = std::env::var("KUBERNETES_SERVICE_PORT").unwrap_or_else(|_| "443".to_string());
        let server_url = if host.contains(':') {
            format!("https://[{host}]:{port}")
        } else {
            format!("https://{host}:{port}")
        };

        let ca = std::fs::read(SERVICE_ACCOUNT_CA)?;
        let executor = Self::with_root_certificate(&server_url, &ca)?;
        Ok(match read_token(Path::new(SERVICE_ACCOUNT_TOKEN)) {
            Some(token) => executor.bearer_token(token),
            None => executor,
        })
    }

    fn builder(server_url: &str, pem: Option<&[u8]>) -> NwResult<Self> {
        let server_url =
            Url::parse(server_url).map_err(|e| Error::InvalidUrl(format!("{server_url}: {e}")))?;

        let mut headers = HeaderMap::new();
        headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
        // Fall back to reqwest's own agent if the configured one is not a valid header
        match HeaderValue::from_str(&user_agent()) {
            Ok(value) => {
                headers.insert(USER_AGENT, value);
            }
            Err(e) => warn!("Ignoring invalid user agent: {}", e),
        }

        let mut builder = reqwest::Client::builder().default_headers(headers);
        if let Some(pem) = pem {
            builder = builder.add_root_certificate(reqwest::Certificate::from_pem(pem)?);
        }

        Ok(Self {
            client: builder.build()?,
            server_url,
            token: None,
        })
    }

    /// Authenticate every request with a bearer token
    #[must_use]
    pub fn bearer_token(mut self, token: impl Into<String>) -> Self {
        self.token = Some(token.into());
        self
    }
}

#[async_trait]
impl RequestExecutor for HttpExecutor {
    fn server_url(&self) -> &Url {
        &self.server_url
    }

    async fn execute(&self, request: ApiRequest) -> ApiResponse {
        debug!("➡️ {} {}", request.method, request.url);

        let mut builder = self.client.request(request.method, request.url);
        if let Some(token) = &self.token {
            builder = builder.header(AUTHORIZATION, format!("Bearer {token}"));
        }
        for (name, value) in request.headers {
            builder = builder.header(name, value);
        }

        match builder.send().await {
            Ok(response) => {
                let status = response.status();
                let status_text = status.canonical_reason().unwrap_or("Unknown").to_string();
                let body = response.bytes_stream().map_err(Error::from).boxed();
                ApiResponse::new(status.as_u16(), status_text, body)
            }
            Err(e) => {
                let error = Error::from(e);
                warn!("Request failed before a response arrived: {}", error);
                ApiResponse::network_error(&error)
            }
        }
    }
}

/// User agent, overridable via `NAVIWATCH_USER_AGENT`
fn user_agent() -> String {
    std::env::var("NAVIWATCH_USER_AGENT").unwrap_or_else(|_| DEFAULT_USER_AGENT.to_string())
}

fn read_token(path: &Path) -> Option<String> {
    std::fs::read_to_string(path)
        .ok()
        .map(|token| token.trim().to_string())
        .filter(|token| !token.is_empty())
}
