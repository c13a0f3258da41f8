//! Backend identification header.
//!
//! Stamps responses with the proxying host's own IPv4 address so operators
//! can tell which proxy node served a request. Two middleware types are
//! exposed, both producing the same [`BackendHeader`] config:
//!
//! - `backendheader`: `--addHeader`, `--headerName` (default `X-Backend-Server`)
//! - `backend`: `--add-backend-header`, header name fixed to `X-Backend-Server`
//!
//! The stage never rejects or delays a request. When the address cannot be
//! resolved the header is still set, with an empty value.

use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{ready, Context, Poll};

use axum::http::{HeaderMap, HeaderName, HeaderValue, Request, Response};
use clap::ArgMatches;
use pin_project_lite::pin_project;
use serde::{Deserialize, Serialize};
use tower::{Layer, Service};

use crate::http::middleware::spec::{
    BoxHandler, FlagKind, FlagSpec, Middleware, MiddlewareError, MiddlewareSpec,
};
use crate::net::{AddressResolver, InterfaceResolver};

/// Type tag of the configurable middleware.
pub const TYPE: &str = "backendheader";

/// Type tag of the fixed-name variant.
pub const LEGACY_TYPE: &str = "backend";

/// Header used when no name is configured.
pub const DEFAULT_HEADER_NAME: &str = "X-Backend-Server";

const FLAG_ADD_HEADER: &str = "addHeader";
const FLAG_HEADER_NAME: &str = "headerName";
const FLAG_LEGACY_ADD_HEADER: &str = "add-backend-header";

/// Backend header configuration.
///
/// Immutable once built. The serialized form is also the stored record:
/// `{"addHeader": bool, "headerName": string}`, both fields optional.
/// Records written with exported field names (`AddHeader`, `HeaderName`)
/// are read too; any other key is rejected.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "camelCase", default, deny_unknown_fields)]
pub struct BackendHeader {
    #[serde(alias = "AddHeader")]
    add_header: bool,
    #[serde(alias = "HeaderName")]
    header_name: String,
}

impl BackendHeader {
    /// Build a config. Never fails and does not validate `header_name`.
    pub fn new(add_header: bool, header_name: impl Into<String>) -> Self {
        Self {
            add_header,
            header_name: header_name.into(),
        }
    }

    pub fn add_header(&self) -> bool {
        self.add_header
    }

    pub fn header_name(&self) -> &str {
        &self.header_name
    }

    /// Build from a stored record. A `null` record means all defaults.
    pub fn from_record(record: &serde_json::Value) -> Result<Self, MiddlewareError> {
        if record.is_null() {
            return Ok(Self::default());
        }
        let stored = BackendHeader::deserialize(record)?;
        Ok(Self::new(stored.add_header, stored.header_name))
    }

    /// Build from flags parsed against [`spec`]'s command.
    pub fn from_flags(matches: &ArgMatches) -> Result<Self, MiddlewareError> {
        let add_header = matches
            .try_get_one::<bool>(FLAG_ADD_HEADER)?
            .copied()
            .unwrap_or(false);
        let header_name = matches
            .try_get_one::<String>(FLAG_HEADER_NAME)?
            .cloned()
            .unwrap_or_else(|| DEFAULT_HEADER_NAME.to_string());
        Ok(Self::new(add_header, header_name))
    }

    /// Build from a record of the fixed-name `backend` type.
    pub fn from_legacy_record(record: &serde_json::Value) -> Result<Self, MiddlewareError> {
        if record.is_null() {
            return Ok(Self::default());
        }
        let stored = LegacyRecord::deserialize(record)?;
        Ok(Self::new(stored.add_header, DEFAULT_HEADER_NAME))
    }

    /// Build from flags parsed against [`legacy_spec`]'s command.
    pub fn from_legacy_flags(matches: &ArgMatches) -> Result<Self, MiddlewareError> {
        let add_header = matches
            .try_get_one::<bool>(FLAG_LEGACY_ADD_HEADER)?
            .copied()
            .unwrap_or(false);
        Ok(Self::new(add_header, DEFAULT_HEADER_NAME))
    }

    /// Layer that applies this config, resolving addresses from the host's
    /// interfaces.
    pub fn layer(&self) -> BackendHeaderLayer {
        BackendHeaderLayer::new(self.clone())
    }
}

impl Default for BackendHeader {
    fn default() -> Self {
        Self::new(false, DEFAULT_HEADER_NAME)
    }
}

impl fmt::Display for BackendHeader {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}, addHeader={}", self.header_name, self.add_header)
    }
}

impl Middleware for BackendHeader {
    fn new_handler(&self, next: BoxHandler) -> BoxHandler {
        BoxHandler::new(self.layer().layer(next))
    }
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase", default, deny_unknown_fields)]
struct LegacyRecord {
    #[serde(alias = "AddHeader")]
    add_header: bool,
}

/// Registration entry for the `backendheader` type.
pub fn spec() -> MiddlewareSpec {
    MiddlewareSpec {
        type_tag: TYPE,
        flags: vec![
            FlagSpec {
                name: FLAG_ADD_HEADER,
                kind: FlagKind::Bool,
                default: "false",
                description: "if provided, add the backend header to the response",
            },
            FlagSpec {
                name: FLAG_HEADER_NAME,
                kind: FlagKind::String,
                default: DEFAULT_HEADER_NAME,
                description: "defaults to X-Backend-Server",
            },
        ],
        from_record: build_from_record,
        from_flags: build_from_flags,
    }
}

/// Registration entry for the fixed-name `backend` type.
pub fn legacy_spec() -> MiddlewareSpec {
    MiddlewareSpec {
        type_tag: LEGACY_TYPE,
        flags: vec![FlagSpec {
            name: FLAG_LEGACY_ADD_HEADER,
            kind: FlagKind::Bool,
            default: "false",
            description: "if provided, add X-Backend-Server to the response",
        }],
        from_record: build_from_legacy_record,
        from_flags: build_from_legacy_flags,
    }
}

fn build_from_record(record: &serde_json::Value) -> Result<Arc<dyn Middleware>, MiddlewareError> {
    Ok(Arc::new(BackendHeader::from_record(record)?))
}

fn build_from_flags(matches: &ArgMatches) -> Result<Arc<dyn Middleware>, MiddlewareError> {
    Ok(Arc::new(BackendHeader::from_flags(matches)?))
}

fn build_from_legacy_record(
    record: &serde_json::Value,
) -> Result<Arc<dyn Middleware>, MiddlewareError> {
    Ok(Arc::new(BackendHeader::from_legacy_record(record)?))
}

fn build_from_legacy_flags(matches: &ArgMatches) -> Result<Arc<dyn Middleware>, MiddlewareError> {
    Ok(Arc::new(BackendHeader::from_legacy_flags(matches)?))
}

/// Tower layer producing [`BackendHeaderService`].
#[derive(Debug, Clone)]
pub struct BackendHeaderLayer {
    config: Arc<BackendHeader>,
    header: Option<HeaderName>,
    resolver: Arc<dyn AddressResolver>,
}

impl BackendHeaderLayer {
    pub fn new(config: BackendHeader) -> Self {
        Self::with_resolver(config, Arc::new(InterfaceResolver))
    }

    /// Use `resolver` instead of the host's interface table.
    pub fn with_resolver(config: BackendHeader, resolver: Arc<dyn AddressResolver>) -> Self {
        let header = if config.add_header {
            match HeaderName::from_bytes(config.header_name.as_bytes()) {
                Ok(name) => Some(name),
                Err(_) => {
                    tracing::warn!(
                        header_name = %config.header_name,
                        "Unusable backend header name, responses will not be stamped"
                    );
                    None
                }
            }
        } else {
            None
        };

        Self {
            config: Arc::new(config),
            header,
            resolver,
        }
    }
}

impl<S> Layer<S> for BackendHeaderLayer {
    type Service = BackendHeaderService<S>;

    fn layer(&self, inner: S) -> Self::Service {
        BackendHeaderService {
            inner,
            config: self.config.clone(),
            header: self.header.clone(),
            resolver: self.resolver.clone(),
        }
    }
}

/// Service that stamps the host address onto responses of `inner`.
#[derive(Debug, Clone)]
pub struct BackendHeaderService<S> {
    inner: S,
    config: Arc<BackendHeader>,
    header: Option<HeaderName>,
    resolver: Arc<dyn AddressResolver>,
}

impl<S> BackendHeaderService<S> {
    fn stamp(&self) -> Option<(HeaderName, HeaderValue)> {
        if !self.config.add_header {
            return None;
        }
        let name = self.header.clone()?;
        let ip = self.resolver.local_ip();
        tracing::trace!(header = %name, ip = %ip, "Stamping backend header");
        let value = HeaderValue::from_str(&ip).unwrap_or_else(|_| HeaderValue::from_static(""));
        Some((name, value))
    }
}

impl<S, ReqBody, ResBody> Service<Request<ReqBody>> for BackendHeaderService<S>
where
    S: Service<Request<ReqBody>, Response = Response<ResBody>>,
{
    type Response = S::Response;
    type Error = S::Error;
    type Future = ResponseFuture<S::Future>;

    fn poll_ready(&mut self, cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        self.inner.poll_ready(cx)
    }

    fn call(&mut self, req: Request<ReqBody>) -> Self::Future {
        // Resolve before the downstream runs, as if set ahead of the body.
        let stamp = self.stamp();
        ResponseFuture {
            inner: self.inner.call(req),
            stamp,
        }
    }
}

pin_project! {
    /// Response future of [`BackendHeaderService`].
    pub struct ResponseFuture<F> {
        #[pin]
        inner: F,
        stamp: Option<(HeaderName, HeaderValue)>,
    }
}

impl<F, ResBody, E> Future for ResponseFuture<F>
where
    F: Future<Output = Result<Response<ResBody>, E>>,
{
    type Output = F::Output;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let this = self.project();
        let mut response = ready!(this.inner.poll(cx))?;
        if let Some((name, value)) = this.stamp.take() {
            stamp_header(response.headers_mut(), name, value);
        }
        Poll::Ready(Ok(response))
    }
}

/// Our value goes first; values the downstream set under the same name are
/// kept after it.
fn stamp_header(headers: &mut HeaderMap, name: HeaderName, value: HeaderValue) {
    let downstream: Vec<HeaderValue> = headers.get_all(&name).iter().cloned().collect();
    headers.insert(name.clone(), value);
    for existing in downstream {
        headers.append(name.clone(), existing);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::net::StaticResolver;
    use axum::body::Body;
    use serde_json::json;
    use std::convert::Infallible;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tower::{service_fn, ServiceExt};

    fn downstream(calls: Arc<AtomicUsize>) -> BoxHandler {
        BoxHandler::new(service_fn(move |_req: Request<Body>| {
            let calls = calls.clone();
            async move {
                calls.fetch_add(1, Ordering::SeqCst);
                Ok::<_, Infallible>(
                    Response::builder()
                        .header("content-type", "text/plain")
                        .body(Body::from("hello"))
                        .unwrap(),
                )
            }
        }))
    }

    fn layer(config: BackendHeader, ip: &str) -> BackendHeaderLayer {
        BackendHeaderLayer::with_resolver(config, Arc::new(StaticResolver::new(ip)))
    }

    fn request() -> Request<Body> {
        Request::builder().uri("/").body(Body::empty()).unwrap()
    }

    #[tokio::test]
    async fn test_disabled_leaves_headers_untouched() {
        let calls = Arc::new(AtomicUsize::new(0));
        let bare = downstream(calls.clone()).oneshot(request()).await.unwrap();

        let svc = layer(BackendHeader::new(false, "X-Node-IP"), "10.0.0.5")
            .layer(downstream(calls.clone()));
        let res = svc.oneshot(request()).await.unwrap();

        assert_eq!(res.headers(), bare.headers());
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_enabled_stamps_address() {
        let calls = Arc::new(AtomicUsize::new(0));
        let svc = layer(BackendHeader::new(true, "X-Node-IP"), "10.0.0.5")
            .layer(downstream(calls.clone()));

        let res = svc.oneshot(request()).await.unwrap();

        assert_eq!(res.headers().get("x-node-ip").unwrap(), "10.0.0.5");
        assert_eq!(res.headers().get("content-type").unwrap(), "text/plain");
        assert_eq!(calls.load(Ordering::SeqCst), 1);

        let body = axum::body::to_bytes(res.into_body(), usize::MAX).await.unwrap();
        assert_eq!(&body[..], b"hello");
    }

    #[tokio::test]
    async fn test_unresolved_address_sets_empty_value() {
        let svc = layer(BackendHeader::new(true, DEFAULT_HEADER_NAME), "")
            .layer(downstream(Arc::new(AtomicUsize::new(0))));

        let res = svc.oneshot(request()).await.unwrap();
        assert_eq!(res.headers().get(DEFAULT_HEADER_NAME).unwrap(), "");
    }

    #[tokio::test]
    async fn test_unusable_header_name_passes_through() {
        let calls = Arc::new(AtomicUsize::new(0));
        let svc = layer(BackendHeader::new(true, ""), "10.0.0.5").layer(downstream(calls.clone()));

        let res = svc.oneshot(request()).await.unwrap();
        assert_eq!(res.headers().len(), 1);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_downstream_values_kept_after_stamp() {
        let inner = service_fn(|_req: Request<Body>| async {
            Ok::<_, Infallible>(
                Response::builder()
                    .header("x-node-ip", "upstream")
                    .body(Body::empty())
                    .unwrap(),
            )
        });
        let svc = layer(BackendHeader::new(true, "X-Node-IP"), "10.0.0.5").layer(inner);

        let res = svc.oneshot(request()).await.unwrap();
        let values: Vec<_> = res.headers().get_all("x-node-ip").iter().collect();
        assert_eq!(values, vec!["10.0.0.5", "upstream"]);
    }

    #[test]
    fn test_record_and_flags_agree() {
        let from_record =
            BackendHeader::from_record(&json!({"addHeader": true, "headerName": "H"})).unwrap();
        let matches = spec()
            .command()
            .try_get_matches_from(["backendheader", "--addHeader", "--headerName", "H"])
            .unwrap();
        let from_flags = BackendHeader::from_flags(&matches).unwrap();

        assert_eq!(from_record, from_flags);
        assert_eq!(from_record, BackendHeader::new(true, "H"));
    }

    #[test]
    fn test_defaults_from_both_origins() {
        let from_record = BackendHeader::from_record(&json!({})).unwrap();
        let from_null = BackendHeader::from_record(&serde_json::Value::Null).unwrap();
        let matches = spec().command().try_get_matches_from(["backendheader"]).unwrap();
        let from_flags = BackendHeader::from_flags(&matches).unwrap();

        assert_eq!(from_record, BackendHeader::default());
        assert_eq!(from_null, BackendHeader::default());
        assert_eq!(from_flags, BackendHeader::default());
        assert_eq!(from_flags.header_name(), "X-Backend-Server");
        assert!(!from_flags.add_header());
    }

    #[test]
    fn test_malformed_record_is_rejected() {
        let err = BackendHeader::from_record(&json!({"addHeader": "yes"})).unwrap_err();
        assert!(matches!(err, MiddlewareError::InvalidRecord(_)));
    }

    #[test]
    fn test_legacy_type_uses_fixed_name() {
        let from_record = BackendHeader::from_legacy_record(&json!({"addHeader": true})).unwrap();
        let matches = legacy_spec()
            .command()
            .try_get_matches_from(["backend", "--add-backend-header"])
            .unwrap();
        let from_flags = BackendHeader::from_legacy_flags(&matches).unwrap();

        assert_eq!(from_record, BackendHeader::new(true, DEFAULT_HEADER_NAME));
        assert_eq!(from_flags, from_record);

        let exported = BackendHeader::from_legacy_record(&json!({"AddHeader": true})).unwrap();
        assert_eq!(exported, from_record);

        // The fixed-name type has no header name to configure.
        let err = BackendHeader::from_legacy_record(&json!({"addHeader": true, "headerName": "Other"}))
            .unwrap_err();
        assert!(matches!(err, MiddlewareError::InvalidRecord(_)));
    }

    #[test]
    fn test_spaced_bool_flag_value() {
        let on = spec().parse_flags(["--addHeader", "true"]).unwrap();
        let off = spec().parse_flags(["--addHeader", "false"]).unwrap();

        assert_eq!(on.to_string(), "X-Backend-Server, addHeader=true");
        assert_eq!(off.to_string(), "X-Backend-Server, addHeader=false");
    }

    #[test]
    fn test_exported_field_names_are_read() {
        let exported =
            BackendHeader::from_record(&json!({"AddHeader": true, "HeaderName": "X-Node-IP"}))
                .unwrap();
        let camel =
            BackendHeader::from_record(&json!({"addHeader": true, "headerName": "X-Node-IP"}))
                .unwrap();

        assert_eq!(exported, BackendHeader::new(true, "X-Node-IP"));
        assert_eq!(exported, camel);
    }

    #[test]
    fn test_unknown_record_keys_are_rejected() {
        for record in [
            json!({"addheader": true}),
            json!({"addHeader": true, "header": "X-Node-IP"}),
        ] {
            let err = BackendHeader::from_record(&record).unwrap_err();
            assert!(matches!(err, MiddlewareError::InvalidRecord(_)), "{record}");
        }
    }

    #[test]
    fn test_display() {
        assert_eq!(
            BackendHeader::new(true, "X-Node-IP").to_string(),
            "X-Node-IP, addHeader=true"
        );
        assert_eq!(
            BackendHeader::default().to_string(),
            "X-Backend-Server, addHeader=false"
        );
    }

    #[test]
    fn test_record_roundtrip_shape() {
        let value = serde_json::to_value(BackendHeader::new(true, "X-Node-IP")).unwrap();
        assert_eq!(value, json!({"addHeader": true, "headerName": "X-Node-IP"}));
    }

    #[tokio::test]
    async fn test_equivalent_configs_behave_identically() {
        let record = BackendHeader::from_record(&json!({"addHeader": true, "headerName": "H"}))
            .unwrap();
        let matches = spec()
            .command()
            .try_get_matches_from(["backendheader", "--addHeader", "true", "--headerName", "H"])
            .unwrap();
        let flags = BackendHeader::from_flags(&matches).unwrap();

        let terminal = || downstream(Arc::new(AtomicUsize::new(0)));
        let a = BoxHandler::new(layer(record, "10.0.0.5").layer(terminal()));
        let b = BoxHandler::new(layer(flags, "10.0.0.5").layer(terminal()));

        for path in ["/", "/api", "/static/app.js"] {
            let req = || Request::builder().uri(path).body(Body::empty()).unwrap();
            let ra = a.clone().oneshot(req()).await.unwrap();
            let rb = b.clone().oneshot(req()).await.unwrap();
            assert_eq!(ra.headers().get("h").unwrap(), "10.0.0.5");
            assert_eq!(ra.headers(), rb.headers());
        }
    }

    #[tokio::test]
    async fn test_concurrent_requests_share_one_handler() {
        let calls = Arc::new(AtomicUsize::new(0));
        let on = BoxHandler::new(
            layer(BackendHeader::new(true, "X-Node-IP"), "10.0.0.5")
                .layer(downstream(calls.clone())),
        );
        let off = BoxHandler::new(
            layer(BackendHeader::new(false, "X-Node-IP"), "10.0.0.5")
                .layer(downstream(calls.clone())),
        );

        let mut tasks = Vec::new();
        for i in 0..64 {
            let svc = if i % 2 == 0 { on.clone() } else { off.clone() };
            tasks.push(tokio::spawn(async move {
                let res = svc.oneshot(request()).await.unwrap();
                (i, res.headers().get("x-node-ip").cloned())
            }));
        }

        for task in tasks {
            let (i, header) = task.await.unwrap();
            if i % 2 == 0 {
                assert_eq!(header.unwrap(), "10.0.0.5");
            } else {
                assert!(header.is_none());
            }
        }
        assert_eq!(calls.load(Ordering::SeqCst), 64);
    }
}
