// HTTP transport layer.
//
// `HttpTransport` is the seam between the request coordinator and the
// wire. It returns every HTTP response as `Ok` (status classification
// happens above it) and reserves `Err` for failures where no response
// arrived at all. `ReqwestTransport` is the production implementation.

use std::future::Future;
use std::path::PathBuf;
use std::time::Duration;

use bytes::Bytes;
use reqwest::header::HeaderMap;
use reqwest::{Method, StatusCode};
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::trace;
use url::Url;

use crate::error::Error;

const USER_AGENT: &str = concat!("carelink/", env!("CARGO_PKG_VERSION"));

// ── Request / response shapes ────────────────────────────────────────

/// Payload of an outbound request.
#[derive(Debug, Clone, Default)]
pub enum RequestBody {
    #[default]
    Empty,
    /// Serialized as `application/json`.
    Json(serde_json::Value),
    /// `multipart/form-data`. The transport generates the boundary.
    Multipart(Vec<FormPart>),
    /// Opaque bytes (file contents, blobs).
    Binary {
        bytes: Bytes,
        content_type: Option<String>,
    },
}

impl RequestBody {
    /// Multipart and binary payloads are opaque: they are never
    /// fingerprinted and never carry a caller-set `Content-Type`.
    pub fn is_opaque(&self) -> bool {
        matches!(self, Self::Multipart(_) | Self::Binary { .. })
    }
}

/// One field of a multipart form.
#[derive(Debug, Clone)]
pub struct FormPart {
    pub name: String,
    pub content: FormContent,
}

#[derive(Debug, Clone)]
pub enum FormContent {
    Text(String),
    File {
        file_name: String,
        mime: Option<String>,
        bytes: Bytes,
    },
}

impl FormPart {
    pub fn text(name: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            content: FormContent::Text(value.into()),
        }
    }

    pub fn file(
        name: impl Into<String>,
        file_name: impl Into<String>,
        mime: Option<String>,
        bytes: impl Into<Bytes>,
    ) -> Self {
        Self {
            name: name.into(),
            content: FormContent::File {
                file_name: file_name.into(),
                mime,
                bytes: bytes.into(),
            },
        }
    }
}

/// A fully prepared request, handed to [`HttpTransport::execute`].
#[derive(Debug, Clone)]
pub struct TransportRequest {
    pub method: Method,
    /// Path relative to the transport's base URL, e.g. `/widgets`.
    pub path: String,
    pub params: Vec<(String, String)>,
    pub headers: HeaderMap,
    pub body: RequestBody,
    /// Fires when the transfer should be aborted.
    pub cancel: CancellationToken,
}

/// Raw response: any status, including 4xx/5xx.
#[derive(Debug, Clone)]
pub struct TransportResponse {
    pub status: StatusCode,
    pub headers: HeaderMap,
    pub body: Bytes,
}

/// Network-layer failure: no HTTP response was received.
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("connection failed: {0}")]
    Connect(String),

    #[error("request timed out")]
    Timeout,

    #[error("transfer aborted")]
    Aborted,

    #[error("invalid request: {0}")]
    InvalidRequest(String),

    #[error("I/O failure: {0}")]
    Io(String),
}

impl From<reqwest::Error> for TransportError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            Self::Timeout
        } else if err.is_connect() {
            Self::Connect(err.to_string())
        } else if err.is_builder() {
            Self::InvalidRequest(err.to_string())
        } else {
            Self::Io(err.to_string())
        }
    }
}

// ── Transport trait ──────────────────────────────────────────────────

/// Executes prepared requests against the server.
pub trait HttpTransport: Send + Sync + 'static {
    fn execute(
        &self,
        request: TransportRequest,
    ) -> impl Future<Output = Result<TransportResponse, TransportError>> + Send;
}

// ── Transport configuration ──────────────────────────────────────────

/// TLS verification mode.
#[derive(Debug, Clone, Default)]
pub enum TlsMode {
    /// Use the system certificate store.
    #[default]
    System,
    /// Use a custom CA certificate from the given PEM file.
    CustomCa(PathBuf),
    /// Accept any certificate (local development only).
    DangerAcceptInvalid,
}

/// Shared settings for building the underlying `reqwest::Client`.
#[derive(Debug, Clone)]
pub struct TransportConfig {
    pub tls: TlsMode,
    pub timeout: Duration,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            tls: TlsMode::System,
            timeout: Duration::from_secs(60),
        }
    }
}

impl TransportConfig {
    /// Build a `reqwest::Client` from this config.
    pub fn build_client(&self) -> Result<reqwest::Client, Error> {
        let mut builder = reqwest::Client::builder()
            .timeout(self.timeout)
            .user_agent(USER_AGENT);

        match &self.tls {
            TlsMode::System => {}
            TlsMode::CustomCa(path) => {
                let cert_pem = std::fs::read(path)
                    .map_err(|e| Error::Tls(format!("failed to read CA cert: {e}")))?;
                let cert = reqwest::Certificate::from_pem(&cert_pem)
                    .map_err(|e| Error::Tls(format!("invalid CA cert: {e}")))?;
                builder = builder.add_root_certificate(cert);
            }
            TlsMode::DangerAcceptInvalid => {
                builder = builder.danger_accept_invalid_certs(true);
            }
        }

        builder
            .build()
            .map_err(|e| Error::Tls(format!("failed to build HTTP client: {e}")))
    }
}

// ── reqwest implementation ───────────────────────────────────────────

/// [`HttpTransport`] backed by `reqwest`.
#[derive(Debug, Clone)]
pub struct ReqwestTransport {
    http: reqwest::Client,
    base_url: Url,
}

impl ReqwestTransport {
    /// Build a transport rooted at `base_url` (e.g. `https://api.example.org/v1`).
    pub fn new(base_url: Url, config: &TransportConfig) -> Result<Self, Error> {
        let http = config.build_client()?;
        Ok(Self { http, base_url })
    }

    /// Wrap a pre-built `reqwest::Client`.
    pub fn with_client(http: reqwest::Client, base_url: Url) -> Self {
        Self { http, base_url }
    }

    pub fn base_url(&self) -> &Url {
        &self.base_url
    }

    /// Resolve a request path against the base URL, keeping any base path prefix.
    fn url(&self, path: &str) -> Result<Url, TransportError> {
        if let Ok(absolute) = Url::parse(path) {
            return Ok(absolute);
        }
        let base = self.base_url.as_str().trim_end_matches('/');
        let path = path.trim_start_matches('/');
        Url::parse(&format!("{base}/{path}"))
            .map_err(|e| TransportError::InvalidRequest(format!("{path}: {e}")))
    }

    fn build_form(parts: Vec<FormPart>) -> Result<reqwest::multipart::Form, TransportError> {
        let mut form = reqwest::multipart::Form::new();
        for part in parts {
            form = match part.content {
                FormContent::Text(value) => form.text(part.name, value),
                FormContent::File {
                    file_name,
                    mime,
                    bytes,
                } => {
                    let mut file =
                        reqwest::multipart::Part::bytes(bytes.to_vec()).file_name(file_name);
                    if let Some(mime) = mime {
                        file = file.mime_str(&mime).map_err(TransportError::from)?;
                    }
                    form.part(part.name, file)
                }
            };
        }
        Ok(form)
    }

    async fn dispatch(
        &self,
        request: TransportRequest,
    ) -> Result<TransportResponse, TransportError> {
        let url = self.url(&request.path)?;
        trace!(method = %request.method, %url, "dispatching");

        let mut builder = self
            .http
            .request(request.method, url)
            .headers(request.headers);
        if !request.params.is_empty() {
            builder = builder.query(&request.params);
        }
        builder = match request.body {
            RequestBody::Empty => builder,
            RequestBody::Json(value) => builder.json(&value),
            RequestBody::Multipart(parts) => builder.multipart(Self::build_form(parts)?),
            RequestBody::Binary {
                bytes,
                content_type,
            } => {
                let builder = builder.body(bytes);
                match content_type {
                    Some(ct) => builder.header(reqwest::header::CONTENT_TYPE, ct),
                    None => builder,
                }
            }
        };

        let resp = builder.send().await?;
        let status = resp.status();
        let headers = resp.headers().clone();
        let body = resp.bytes().await?;

        Ok(TransportResponse {
            status,
            headers,
            body,
        })
    }
}

impl HttpTransport for ReqwestTransport {
    async fn execute(
        &self,
        request: TransportRequest,
    ) -> Result<TransportResponse, TransportError> {
        let cancel = request.cancel.clone();
        // Dropping the in-flight future aborts the underlying transfer.
        tokio::select! {
            biased;
            () = cancel.cancelled() => Err(TransportError::Aborted),
            result = self.dispatch(request) => result,
        }
    }
}
