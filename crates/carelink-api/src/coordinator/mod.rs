//! Request coordinator: the single choke point for outbound HTTP.
//!
//! Every request passes through [`RequestCoordinator::send`], which
//!
//! 1. attaches the current session token as `Authorization: Bearer …`,
//! 2. strips a caller-set `Content-Type` from multipart/binary payloads so
//!    the transport can set its own boundary,
//! 3. deduplicates identical in-flight requests (newest wins: a duplicate
//!    inside the dedup window cancels its predecessor),
//! 4. classifies every failure into the [`Error`] taxonomy.
//!
//! Nothing is retried here. Retry policy belongs to callers.
//!
//! # Example
//!
//! ```rust,ignore
//! use std::sync::Arc;
//! use carelink_api::{CoordinatorConfig, MemoryCredentialStore, RequestCoordinator, RequestSpec};
//!
//! let credentials = Arc::new(MemoryCredentialStore::with_session("token", None));
//! let coordinator = RequestCoordinator::with_reqwest(
//!     base_url,
//!     &transport,
//!     credentials,
//!     CoordinatorConfig::default(),
//! )?;
//!
//! match coordinator.send(RequestSpec::get("/incidents?page=1")).await {
//!     Ok(resp) => render(resp.json::<Vec<Incident>>()?),
//!     Err(e) if e.is_cancelled() => {} // superseded by a newer click
//!     Err(e) => toast(e.to_string()),
//! }
//! ```

mod classify;
mod fingerprint;
mod registry;

use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use reqwest::header::{AUTHORIZATION, CONTENT_TYPE, HeaderMap, HeaderName, HeaderValue};
use reqwest::{Method, StatusCode};
use secrecy::ExposeSecret;
use serde::de::DeserializeOwned;
use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};
use url::Url;

pub use classify::{GENERIC_FAILURE_MESSAGE, classify, is_rate_limit_message};
pub use fingerprint::{ExemptionRules, Fingerprint};

use self::registry::{PendingRegistry, SettleOnDrop};
use crate::credentials::CredentialStore;
use crate::error::Error;
use crate::transport::{
    FormPart, HttpTransport, ReqwestTransport, RequestBody, TransportConfig, TransportError,
    TransportRequest, TransportResponse,
};

const SESSION_CHANNEL_CAPACITY: usize = 16;

// ── Configuration ────────────────────────────────────────────────────

/// Tuning knobs for dedup and timeouts.
#[derive(Debug, Clone)]
pub struct CoordinatorConfig {
    /// An identical request issued within this window cancels its predecessor. Default: 300ms.
    pub dedup_window: Duration,
    /// Tracked requests older than this are cancelled and swept. Default: 5s.
    pub stale_after: Duration,
    /// Hard per-request timeout; expiry is reported as "no response". Default: 60s.
    pub timeout: Duration,
    pub exemptions: ExemptionRules,
}

impl Default for CoordinatorConfig {
    fn default() -> Self {
        Self {
            dedup_window: Duration::from_millis(300),
            stale_after: Duration::from_millis(5_000),
            timeout: Duration::from_secs(60),
            exemptions: ExemptionRules::default(),
        }
    }
}

/// Global session notifications published by the coordinator.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionEvent {
    /// A request came back 401. Credentials have been cleared; the host
    /// should navigate to re-authentication.
    Expired,
}

// ── RequestSpec ──────────────────────────────────────────────────────

/// Description of one outbound request.
#[derive(Debug, Clone)]
pub struct RequestSpec {
    method: Method,
    path: String,
    params: Vec<(String, String)>,
    headers: HeaderMap,
    body: RequestBody,
    cancel: Option<CancellationToken>,
}

impl RequestSpec {
    /// A query string embedded in `path` is split off into parameters.
    pub fn new(method: Method, path: impl Into<String>) -> Self {
        let raw: String = path.into();
        let (path, params) = match raw.split_once('?') {
            Some((path, query)) => (
                path.to_owned(),
                url::form_urlencoded::parse(query.as_bytes())
                    .into_owned()
                    .collect(),
            ),
            None => (raw, Vec::new()),
        };
        Self {
            method,
            path,
            params,
            headers: HeaderMap::new(),
            body: RequestBody::Empty,
            cancel: None,
        }
    }

    pub fn get(path: impl Into<String>) -> Self {
        Self::new(Method::GET, path)
    }

    pub fn post(path: impl Into<String>) -> Self {
        Self::new(Method::POST, path)
    }

    pub fn put(path: impl Into<String>) -> Self {
        Self::new(Method::PUT, path)
    }

    pub fn patch(path: impl Into<String>) -> Self {
        Self::new(Method::PATCH, path)
    }

    pub fn delete(path: impl Into<String>) -> Self {
        Self::new(Method::DELETE, path)
    }

    pub fn param(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.params.push((key.into(), value.into()));
        self
    }

    pub fn json(mut self, value: serde_json::Value) -> Self {
        self.body = RequestBody::Json(value);
        self
    }

    pub fn multipart(mut self, parts: Vec<FormPart>) -> Self {
        self.body = RequestBody::Multipart(parts);
        self
    }

    pub fn binary(mut self, bytes: impl Into<Bytes>, content_type: Option<String>) -> Self {
        self.body = RequestBody::Binary {
            bytes: bytes.into(),
            content_type,
        };
        self
    }

    pub fn header(mut self, name: HeaderName, value: HeaderValue) -> Self {
        self.headers.insert(name, value);
        self
    }

    /// Let the caller abort this request. Composes with dedup cancellation.
    pub fn cancel_with(mut self, token: CancellationToken) -> Self {
        self.cancel = Some(token);
        self
    }

    pub fn method(&self) -> &Method {
        &self.method
    }

    pub fn path(&self) -> &str {
        &self.path
    }

    pub fn params(&self) -> &[(String, String)] {
        &self.params
    }

    pub fn fingerprint(&self) -> Fingerprint {
        Fingerprint::of(&self.method, &self.path, &self.params, &self.body)
    }
}

// ── Response ─────────────────────────────────────────────────────────

/// A successful (2xx) response.
#[derive(Debug, Clone)]
pub struct Response {
    pub status: StatusCode,
    pub headers: HeaderMap,
    pub body: Bytes,
}

impl Response {
    pub fn json<T: DeserializeOwned>(&self) -> Result<T, Error> {
        serde_json::from_slice(&self.body).map_err(|e| {
            let body = String::from_utf8_lossy(&self.body).into_owned();
            let preview: String = body.chars().take(200).collect();
            Error::Deserialization {
                message: format!("{e} (body preview: {preview:?})"),
                body,
            }
        })
    }

    pub fn text(&self) -> String {
        String::from_utf8_lossy(&self.body).into_owned()
    }
}

impl From<TransportResponse> for Response {
    fn from(resp: TransportResponse) -> Self {
        Self {
            status: resp.status,
            headers: resp.headers,
            body: resp.body,
        }
    }
}

// ── Coordinator ──────────────────────────────────────────────────────

/// Wraps every outbound request. Owns its pending-request registry, so
/// independent instances never share dedup state.
pub struct RequestCoordinator<T: HttpTransport = ReqwestTransport> {
    transport: T,
    credentials: Arc<dyn CredentialStore>,
    config: CoordinatorConfig,
    registry: PendingRegistry,
    session_tx: broadcast::Sender<SessionEvent>,
}

impl RequestCoordinator<ReqwestTransport> {
    /// Build a coordinator over a `reqwest` transport rooted at `base_url`.
    pub fn with_reqwest(
        base_url: Url,
        transport: &TransportConfig,
        credentials: Arc<dyn CredentialStore>,
        config: CoordinatorConfig,
    ) -> Result<Self, Error> {
        let transport = ReqwestTransport::new(base_url, transport)?;
        Ok(Self::new(transport, credentials, config))
    }
}

impl<T: HttpTransport> RequestCoordinator<T> {
    pub fn new(
        transport: T,
        credentials: Arc<dyn CredentialStore>,
        config: CoordinatorConfig,
    ) -> Self {
        let (session_tx, _) = broadcast::channel(SESSION_CHANNEL_CAPACITY);
        Self {
            transport,
            credentials,
            config,
            registry: PendingRegistry::new(),
            session_tx,
        }
    }

    pub fn config(&self) -> &CoordinatorConfig {
        &self.config
    }

    pub fn transport(&self) -> &T {
        &self.transport
    }

    /// Subscribe to session-level notifications (e.g. forced sign-out).
    pub fn session_events(&self) -> broadcast::Receiver<SessionEvent> {
        self.session_tx.subscribe()
    }

    /// Number of tracked in-flight requests.
    pub fn pending_len(&self) -> usize {
        self.registry.len()
    }

    /// Cancel every tracked in-flight request (e.g. on sign-out).
    pub fn cancel_all(&self) {
        let cancelled = self.registry.cancel_all();
        if cancelled > 0 {
            debug!(cancelled, "cancelled all pending requests");
        }
    }

    /// Dispatch a request.
    pub async fn send(&self, spec: RequestSpec) -> Result<Response, Error> {
        let RequestSpec {
            method,
            path,
            params,
            mut headers,
            body,
            cancel,
        } = spec;

        self.attach_token(&mut headers);
        if body.is_opaque() {
            headers.remove(CONTENT_TYPE);
        }

        // Child of the caller's token: caller cancellation propagates down,
        // dedup cancellation stays local to this request.
        let token = cancel
            .as_ref()
            .map_or_else(CancellationToken::new, CancellationToken::child_token);

        let _settle = if self.config.exemptions.is_exempt(&path, &body) {
            debug!(%method, %path, "exempt from dedup");
            None
        } else {
            let fingerprint = Fingerprint::of(&method, &path, &params, &body);
            let admission = self.registry.admit(
                fingerprint.clone(),
                &method,
                &path,
                token.clone(),
                self.config.dedup_window,
                self.config.stale_after,
            );
            if admission.superseded || admission.swept > 0 {
                debug!(
                    %method,
                    %path,
                    superseded = admission.superseded,
                    swept = admission.swept,
                    "registry updated"
                );
            }
            Some(SettleOnDrop {
                registry: &self.registry,
                fingerprint,
                id: admission.id,
            })
        };

        let request = TransportRequest {
            method: method.clone(),
            path: path.clone(),
            params,
            headers,
            body,
            cancel: token.clone(),
        };

        let resp = self.execute(request, &token).await?;
        if resp.status.is_success() {
            return Ok(resp.into());
        }

        let err = classify(resp.status, &resp.headers, &resp.body);
        match &err {
            Error::SessionExpired => self.expire_session(),
            Error::RateLimited { retry_after } => {
                warn!(%method, %path, ?retry_after, "rate limited");
            }
            other => debug!(
                %method,
                %path,
                status = resp.status.as_u16(),
                error = %other,
                "request failed"
            ),
        }
        Err(err)
    }

    /// Run the transfer, racing it against cancellation and the hard timeout.
    async fn execute(
        &self,
        request: TransportRequest,
        token: &CancellationToken,
    ) -> Result<TransportResponse, Error> {
        let timeout = self.config.timeout;
        let call = tokio::time::timeout(timeout, self.transport.execute(request));
        tokio::select! {
            biased;
            () = token.cancelled() => Err(Error::Cancelled),
            result = call => match result {
                Err(_elapsed) => Err(Error::NetworkUnavailable {
                    reason: format!("no response within {}s", timeout.as_secs()),
                }),
                Ok(Err(TransportError::Aborted)) => Err(Error::Cancelled),
                Ok(Err(e)) => {
                    debug!(error = %e, "transport failure");
                    Err(Error::NetworkUnavailable { reason: e.to_string() })
                }
                Ok(Ok(resp)) => Ok(resp),
            },
        }
    }

    fn attach_token(&self, headers: &mut HeaderMap) {
        let Some(token) = self.credentials.token() else {
            return;
        };
        match HeaderValue::from_str(&format!("Bearer {}", token.expose_secret())) {
            Ok(mut value) => {
                value.set_sensitive(true);
                headers.insert(AUTHORIZATION, value);
            }
            Err(e) => warn!(error = %e, "session token is not a valid header value"),
        }
    }

    fn expire_session(&self) {
        warn!("session expired, clearing credentials");
        self.credentials.clear();
        // No subscribers is fine: nobody is listening for navigation yet.
        let _ = self.session_tx.send(SessionEvent::Expired);
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use std::sync::Mutex;
    use std::sync::atomic::{AtomicUsize, Ordering};

    use secrecy::SecretString;
    use serde_json::json;

    use super::*;
    use crate::credentials::MemoryCredentialStore;

    /// Answers every request after `delay` with `status` and `body`.
    struct FakeTransport {
        delay: Duration,
        status: StatusCode,
        body: serde_json::Value,
        started: AtomicUsize,
        completed: AtomicUsize,
        seen: Mutex<Vec<TransportRequest>>,
    }

    impl FakeTransport {
        fn new(delay: Duration, status: StatusCode, body: serde_json::Value) -> Self {
            Self {
                delay,
                status,
                body,
                started: AtomicUsize::new(0),
                completed: AtomicUsize::new(0),
                seen: Mutex::new(Vec::new()),
            }
        }

        fn ok(delay: Duration) -> Self {
            Self::new(delay, StatusCode::OK, json!({"ok": true}))
        }
    }

    impl HttpTransport for FakeTransport {
        async fn execute(
            &self,
            request: TransportRequest,
        ) -> Result<TransportResponse, TransportError> {
            self.started.fetch_add(1, Ordering::SeqCst);
            self.seen.lock().unwrap().push(request);
            tokio::time::sleep(self.delay).await;
            self.completed.fetch_add(1, Ordering::SeqCst);
            Ok(TransportResponse {
                status: self.status,
                headers: HeaderMap::new(),
                body: Bytes::from(self.body.to_string()),
            })
        }
    }

    /// Counts `clear()` calls.
    #[derive(Default)]
    struct CountingStore {
        inner: MemoryCredentialStore,
        clears: AtomicUsize,
    }

    impl CredentialStore for CountingStore {
        fn token(&self) -> Option<SecretString> {
            self.inner.token()
        }
        fn user_id(&self) -> Option<String> {
            self.inner.user_id()
        }
        fn clear(&self) {
            self.clears.fetch_add(1, Ordering::SeqCst);
            self.inner.clear();
        }
    }

    fn coordinator(transport: FakeTransport) -> Arc<RequestCoordinator<FakeTransport>> {
        let store = Arc::new(MemoryCredentialStore::with_session("tok-1", Some("u-1".into())));
        Arc::new(RequestCoordinator::new(transport, store, CoordinatorConfig::default()))
    }

    #[tokio::test(start_paused = true)]
    async fn duplicate_within_window_cancels_the_older_request() {
        let c = coordinator(FakeTransport::ok(Duration::from_secs(1)));

        let first = tokio::spawn({
            let c = Arc::clone(&c);
            async move { c.send(RequestSpec::get("/widgets?page=1")).await }
        });
        tokio::time::sleep(Duration::from_millis(50)).await;
        let second = c.send(RequestSpec::get("/widgets?page=1")).await;

        let first = first.await.unwrap();
        assert!(first.unwrap_err().is_cancelled());
        assert!(second.is_ok());
        assert_eq!(c.transport().completed.load(Ordering::SeqCst), 1);
        assert_eq!(c.pending_len(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn duplicate_outside_window_runs_independently() {
        let c = coordinator(FakeTransport::ok(Duration::from_secs(1)));

        let first = tokio::spawn({
            let c = Arc::clone(&c);
            async move { c.send(RequestSpec::get("/widgets?page=1")).await }
        });
        tokio::time::sleep(Duration::from_millis(400)).await;
        let third = c.send(RequestSpec::get("/widgets?page=1")).await;

        assert!(first.await.unwrap().is_ok());
        assert!(third.is_ok());
        assert_eq!(c.transport().completed.load(Ordering::SeqCst), 2);
        assert_eq!(c.pending_len(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn different_requests_do_not_interfere() {
        let c = coordinator(FakeTransport::ok(Duration::from_millis(100)));

        let (a, b) = tokio::join!(
            c.send(RequestSpec::get("/widgets?page=1")),
            c.send(RequestSpec::get("/widgets?page=2")),
        );
        assert!(a.is_ok() && b.is_ok());
        assert_eq!(c.pending_len(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn exempt_requests_are_never_deduplicated() {
        let c = coordinator(FakeTransport::ok(Duration::from_millis(500)));
        let upload = || {
            RequestSpec::post("/documents/upload").multipart(vec![FormPart::file(
                "file",
                "policy.pdf",
                Some("application/pdf".into()),
                Bytes::from_static(b"%PDF"),
            )])
        };

        let (a, b) = tokio::join!(c.send(upload()), c.send(upload()));
        assert!(a.is_ok() && b.is_ok());
        assert_eq!(c.transport().completed.load(Ordering::SeqCst), 2);
        assert_eq!(c.pending_len(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn caller_cancellation_yields_cancelled() {
        let c = coordinator(FakeTransport::ok(Duration::from_secs(5)));
        let token = CancellationToken::new();

        let pending = tokio::spawn({
            let c = Arc::clone(&c);
            let token = token.clone();
            async move { c.send(RequestSpec::get("/reports").cancel_with(token)).await }
        });
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert_eq!(c.pending_len(), 1);
        token.cancel();

        assert!(pending.await.unwrap().unwrap_err().is_cancelled());
        assert_eq!(c.pending_len(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn caller_and_dedup_cancellation_compose() {
        let c = coordinator(FakeTransport::ok(Duration::from_secs(1)));
        let token = CancellationToken::new();

        let first = tokio::spawn({
            let c = Arc::clone(&c);
            let token = token.clone();
            async move { c.send(RequestSpec::get("/rota").cancel_with(token)).await }
        });
        tokio::time::sleep(Duration::from_millis(20)).await;
        let second = tokio::spawn({
            let c = Arc::clone(&c);
            async move { c.send(RequestSpec::get("/rota")).await }
        });
        tokio::time::sleep(Duration::from_millis(20)).await;
        // Already superseded; caller cancelling too must be harmless.
        token.cancel();

        assert!(first.await.unwrap().unwrap_err().is_cancelled());
        assert!(second.await.unwrap().is_ok());
        assert_eq!(c.pending_len(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn stale_requests_are_swept_by_later_dispatch() {
        let c = coordinator(FakeTransport::ok(Duration::from_secs(30)));

        let abandoned = tokio::spawn({
            let c = Arc::clone(&c);
            async move { c.send(RequestSpec::get("/exports/large")).await }
        });
        tokio::time::sleep(Duration::from_secs(6)).await;
        let _fresh = tokio::spawn({
            let c = Arc::clone(&c);
            async move { c.send(RequestSpec::get("/widgets")).await }
        });

        assert!(abandoned.await.unwrap().unwrap_err().is_cancelled());
    }

    #[tokio::test(start_paused = true)]
    async fn hard_timeout_is_no_response() {
        let c = coordinator(FakeTransport::ok(Duration::from_secs(120)));

        let err = c.send(RequestSpec::get("/widgets")).await.unwrap_err();
        assert!(matches!(err, Error::NetworkUnavailable { .. }), "got {err:?}");
        assert_eq!(c.pending_len(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn abandoned_send_future_does_not_leak() {
        let c = coordinator(FakeTransport::ok(Duration::from_secs(2)));

        let task = tokio::spawn({
            let c = Arc::clone(&c);
            async move { c.send(RequestSpec::get("/widgets")).await }
        });
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert_eq!(c.pending_len(), 1);

        task.abort();
        let _ = task.await;
        assert_eq!(c.pending_len(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn unauthorized_clears_credentials_once_and_notifies() {
        let store = Arc::new(CountingStore::default());
        store.inner.set("tok-1", None);
        let c = RequestCoordinator::new(
            FakeTransport::new(Duration::from_millis(5), StatusCode::UNAUTHORIZED, json!({})),
            store.clone(),
            CoordinatorConfig::default(),
        );
        let mut events = c.session_events();

        let err = c.send(RequestSpec::get("/invoices")).await.unwrap_err();

        assert!(err.is_auth_expired());
        assert_eq!(store.clears.load(Ordering::SeqCst), 1);
        assert!(store.token().is_none());
        assert_eq!(events.try_recv().unwrap(), SessionEvent::Expired);
        assert_eq!(c.pending_len(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn bearer_token_is_attached() {
        let c = coordinator(FakeTransport::ok(Duration::ZERO));
        c.send(RequestSpec::get("/me")).await.unwrap();

        let seen = c.transport().seen.lock().unwrap();
        let auth = seen[0].headers.get(AUTHORIZATION).unwrap();
        assert_eq!(auth.to_str().unwrap(), "Bearer tok-1");
        assert!(auth.is_sensitive());
    }

    #[tokio::test(start_paused = true)]
    async fn no_token_means_no_authorization_header() {
        let c = RequestCoordinator::new(
            FakeTransport::ok(Duration::ZERO),
            Arc::new(MemoryCredentialStore::new()),
            CoordinatorConfig::default(),
        );
        c.send(RequestSpec::get("/public/status")).await.unwrap();

        let seen = c.transport().seen.lock().unwrap();
        assert!(seen[0].headers.get(AUTHORIZATION).is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn content_type_stripped_for_opaque_bodies() {
        let c = coordinator(FakeTransport::ok(Duration::ZERO));
        let spec = RequestSpec::post("/attachments")
            .header(CONTENT_TYPE, HeaderValue::from_static("application/json"))
            .binary(Bytes::from_static(b"\x89PNG"), Some("image/png".into()));
        c.send(spec).await.unwrap();

        let json_spec = RequestSpec::post("/notes")
            .header(CONTENT_TYPE, HeaderValue::from_static("application/json"))
            .json(json!({"text": "hi"}));
        c.send(json_spec).await.unwrap();

        let seen = c.transport().seen.lock().unwrap();
        assert!(seen[0].headers.get(CONTENT_TYPE).is_none());
        assert!(seen[1].headers.get(CONTENT_TYPE).is_some());
    }

    #[test]
    fn query_string_in_path_becomes_params() {
        let spec = RequestSpec::get("/widgets?page=1&sort=name");
        assert_eq!(spec.path(), "/widgets");
        assert_eq!(
            spec.params(),
            &[
                ("page".to_owned(), "1".to_owned()),
                ("sort".to_owned(), "name".to_owned())
            ]
        );
        let reordered = RequestSpec::get("/widgets")
            .param("sort", "name")
            .param("page", "1");
        assert_eq!(spec.fingerprint(), reordered.fingerprint());
    }

    #[test]
    fn response_json_reports_body_on_failure() {
        let resp = Response {
            status: StatusCode::OK,
            headers: HeaderMap::new(),
            body: Bytes::from_static(b"not json"),
        };
        let err = resp.json::<serde_json::Value>().unwrap_err();
        assert!(matches!(err, Error::Deserialization { ref body, .. } if body == "not json"));
    }
}
