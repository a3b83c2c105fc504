//! HTTP transport for the dispatcher.
//!
//! `GET|POST /<prefix>/{module}/{message}`: GET binds the query string, POST
//! binds a JSON body (an empty body is `{}`). Every call gets an
//! `x-request-id`, a metadata map, the module-context injectors and an
//! `event_module_call` notification carrying its elapsed time.

use std::any::Any;
use std::collections::HashMap;
use std::future::IntoFuture;
use std::net::SocketAddr;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::Context;
use axum::body::{to_bytes, Body};
use axum::extract::{ConnectInfo, MatchedPath, Path, Query, Request, State};
use axum::http::request::Parts;
use axum::http::{HeaderName, StatusCode};
use axum::middleware::{self, Next};
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::{Json, Router};
use http::Extensions;
use serde_json::Value;
use prometheus::{HistogramOpts, HistogramVec, IntCounterVec, Opts};
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tower::ServiceBuilder;
use tower_http::catch_panic::CatchPanicLayer;
use tower_http::request_id::{MakeRequestUuid, PropagateRequestIdLayer, SetRequestIdLayer};
use tower_http::trace::TraceLayer;

use crate::bus::EventBus;
use crate::context::{apply_injectors, CallContext, ContextInjector};
use crate::dispatcher::{DispatchError, Dispatcher};
use crate::events;
use crate::protocol::{self, BaseResponse};
use crate::supervise::panic_message;

const MAX_BODY_BYTES: usize = 4 * 1024 * 1024;

pub fn request_id_header() -> HeaderName {
    HeaderName::from_static("x-request-id")
}

#[derive(Clone)]
struct NetworkState {
    dispatcher: Arc<Dispatcher>,
    bus: Arc<EventBus>,
    injectors: Arc<[ContextInjector]>,
}

/// Everything the message router needs.
pub struct NetworkOptions {
    pub dispatcher: Arc<Dispatcher>,
    pub bus: Arc<EventBus>,
    pub injectors: Vec<ContextInjector>,
    pub route_prefix: String,
    /// Exposes `GET /metric` in Prometheus text format when set.
    pub metrics: Option<prometheus::Registry>,
}

pub fn build_router(opts: NetworkOptions) -> Router {
    let state = NetworkState {
        dispatcher: opts.dispatcher,
        bus: opts.bus,
        injectors: opts.injectors.into(),
    };

    let prefix = opts.route_prefix.trim_matches('/');
    let path = format!("/{prefix}/{{module}}/{{message}}");
    let mut router = Router::new().route(&path, get(handle_message).post(handle_message));
    if let Some(registry) = &opts.metrics {
        match HttpMetrics::register(registry) {
            Ok(metrics) => {
                router = router.route_layer(middleware::from_fn_with_state(metrics, track_http));
            }
            Err(e) => tracing::warn!(error = %e, "http request metrics disabled"),
        }
    }
    let mut router = router.with_state(state);

    if let Some(registry) = opts.metrics {
        router = router.merge(
            Router::new()
                .route("/metric", get(metric_handler))
                .with_state(registry),
        );
    }

    let x_request_id = request_id_header();
    router.layer(
        ServiceBuilder::new()
            .layer(CatchPanicLayer::custom(panic_response))
            .layer(SetRequestIdLayer::new(x_request_id.clone(), MakeRequestUuid))
            .layer(
                TraceLayer::new_for_http().make_span_with(|req: &Request<Body>| {
                    let rid = req
                        .headers()
                        .get(request_id_header())
                        .and_then(|v| v.to_str().ok())
                        .unwrap_or("n/a");
                    tracing::info_span!(
                        "http_request",
                        method = %req.method(),
                        uri = %req.uri().path(),
                        request_id = %rid,
                    )
                }),
            )
            .layer(PropagateRequestIdLayer::new(x_request_id)),
    )
}

async fn handle_message(
    State(st): State<NetworkState>,
    Path((module, message)): Path<(String, String)>,
    request: Request,
) -> Response {
    let started = Instant::now();
    let (parts, body) = request.into_parts();
    let request_id = parts
        .headers
        .get(request_id_header())
        .and_then(|v| v.to_str().ok())
        .unwrap_or_default()
        .to_string();

    let response = match decode_payload(&parts, body).await {
        Ok(payload) => {
            let call = call_context(&st, &parts, &module, &message, &request_id);
            match st.dispatcher.dispatch(&module, &message, call, payload).await {
                Ok(value) => (StatusCode::OK, Json(value)).into_response(),
                Err(err) => error_response(&st, &module, &message, &request_id, err),
            }
        }
        Err(err) => error_response(&st, &module, &message, &request_id, err),
    };

    // Subscribers run inline; one that panics must not take the response with it.
    let published = std::panic::catch_unwind(AssertUnwindSafe(|| {
        events::publish_module_call(&st.bus, &module, &message, started, &request_id)
    }));
    match published {
        Ok(()) => response,
        Err(panic) => {
            let reason = panic_message(&*panic);
            tracing::error!(
                module = %module,
                message = %message,
                request_id = %request_id,
                reason = %reason,
                "module call subscriber panicked"
            );
            let _ = std::panic::catch_unwind(AssertUnwindSafe(|| {
                events::publish_module_call_panic(&st.bus, &module, &message, reason, &request_id)
            }));
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(BaseResponse::internal_error(request_id)),
            )
                .into_response()
        }
    }
}

/// Last-resort answer for a panic anywhere in the router stack.
fn panic_response(panic: Box<dyn Any + Send + 'static>) -> Response {
    tracing::error!(reason = %panic_message(&*panic), "request panicked");
    (
        StatusCode::INTERNAL_SERVER_ERROR,
        Json(BaseResponse::internal_error("")),
    )
        .into_response()
}

/// Per-route request counter and latency histogram.
#[derive(Clone)]
struct HttpMetrics {
    requests: IntCounterVec,
    latency: HistogramVec,
}

impl HttpMetrics {
    fn register(registry: &prometheus::Registry) -> prometheus::Result<Self> {
        let requests = IntCounterVec::new(
            Opts::new("requests_total", "HTTP requests handled")
                .namespace("espresso")
                .subsystem("http"),
            &["method", "path", "status"],
        )?;
        let latency = HistogramVec::new(
            HistogramOpts::new("request_duration_seconds", "HTTP request latency")
                .namespace("espresso")
                .subsystem("http"),
            &["method", "path"],
        )?;
        registry.register(Box::new(requests.clone()))?;
        registry.register(Box::new(latency.clone()))?;
        Ok(Self { requests, latency })
    }
}

async fn track_http(State(metrics): State<HttpMetrics>, req: Request, next: Next) -> Response {
    let started = Instant::now();
    let method = req.method().to_string();
    let path = req
        .extensions()
        .get::<MatchedPath>()
        .map(|p| p.as_str().to_string())
        .unwrap_or_else(|| req.uri().path().to_string());

    let response = next.run(req).await;
    metrics
        .requests
        .with_label_values(&[method.as_str(), path.as_str(), response.status().as_str()])
        .inc();
    metrics
        .latency
        .with_label_values(&[method.as_str(), path.as_str()])
        .observe(started.elapsed().as_secs_f64());
    response
}

fn error_response(
    st: &NetworkState,
    module: &str,
    message: &str,
    request_id: &str,
    err: DispatchError,
) -> Response {
    match &err {
        DispatchError::Panicked(reason) => {
            tracing::error!(module, message, request_id, reason = %reason, "module call panicked");
            events::publish_module_call_panic(&st.bus, module, message, reason.clone(), request_id);
        }
        DispatchError::NotFound(_) => {
            tracing::debug!(module, message, "no route");
        }
        other => {
            tracing::debug!(module, message, error = %other, "module call rejected");
        }
    }
    let (status, body) = protocol::from_dispatch_error(&err, request_id);
    (status, Json(body)).into_response()
}

async fn decode_payload(parts: &Parts, body: Body) -> Result<Value, DispatchError> {
    if parts.method == http::Method::GET {
        let Query(query) = Query::<HashMap<String, String>>::try_from_uri(&parts.uri)
            .map_err(|e| DispatchError::InvalidRequest(e.body_text()))?;
        let object = query
            .into_iter()
            .map(|(k, v)| (k, Value::String(v)))
            .collect::<serde_json::Map<_, _>>();
        return Ok(Value::Object(object));
    }

    let bytes = to_bytes(body, MAX_BODY_BYTES)
        .await
        .map_err(|e| DispatchError::InvalidRequest(e.to_string()))?;
    if bytes.iter().all(u8::is_ascii_whitespace) {
        return Ok(Value::Object(Default::default()));
    }
    serde_json::from_slice(&bytes).map_err(|e| DispatchError::InvalidJson(e.to_string()))
}

fn call_context(
    st: &NetworkState,
    parts: &Parts,
    module: &str,
    message: &str,
    request_id: &str,
) -> CallContext {
    let mut metadata: HashMap<String, Vec<String>> = HashMap::new();
    for (name, value) in &parts.headers {
        if let Ok(v) = value.to_str() {
            metadata
                .entry(name.as_str().to_string())
                .or_default()
                .push(v.to_string());
        }
    }

    let full_path = parts
        .extensions
        .get::<MatchedPath>()
        .map(|p| p.as_str().to_string())
        .unwrap_or_default();
    metadata.insert("FullPath".into(), vec![full_path]);
    metadata.insert("Uri".into(), vec![parts.uri.to_string()]);
    metadata.insert(
        "Url".into(),
        vec![parts
            .uri
            .path_and_query()
            .map(|pq| pq.as_str().to_string())
            .unwrap_or_default()],
    );
    metadata.insert("Module".into(), vec![module.to_string()]);
    metadata.insert("Message".into(), vec![message.to_string()]);

    let client_ip = parts
        .extensions
        .get::<ConnectInfo<SocketAddr>>()
        .map(|ConnectInfo(addr)| addr.ip().to_string());

    let mut extensions = Extensions::new();
    apply_injectors(&mut extensions, &st.injectors);

    CallContext {
        module: module.to_string(),
        message: message.to_string(),
        request_id: request_id.to_string(),
        client_ip,
        metadata,
        extensions,
    }
}

async fn metric_handler(State(registry): State<prometheus::Registry>) -> Response {
    use prometheus::Encoder;

    let encoder = prometheus::TextEncoder::new();
    let mut buf = Vec::new();
    match encoder.encode(&registry.gather(), &mut buf) {
        Ok(()) => (
            [(http::header::CONTENT_TYPE, encoder.format_type().to_string())],
            buf,
        )
            .into_response(),
        Err(e) => {
            tracing::error!(error = %e, "metric encode failed");
            StatusCode::INTERNAL_SERVER_ERROR.into_response()
        }
    }
}

/// Bind `addr` and serve `router` until `cancel` fires.
pub async fn serve(
    service: &'static str,
    addr: &str,
    router: Router,
    cancel: CancellationToken,
    shutdown_timeout: Duration,
) -> anyhow::Result<()> {
    let listener = TcpListener::bind(addr)
        .await
        .with_context(|| format!("{service}: bind {addr}"))?;
    serve_listener(service, listener, router, cancel, shutdown_timeout).await
}

/// Serve on an already bound listener.
///
/// After `cancel` fires no new connections are accepted; in-flight requests
/// get `shutdown_timeout` to finish and are abandoned afterwards.
pub async fn serve_listener(
    service: &'static str,
    listener: TcpListener,
    router: Router,
    cancel: CancellationToken,
    shutdown_timeout: Duration,
) -> anyhow::Result<()> {
    let local = listener.local_addr()?;
    tracing::info!(service, listen_address = %local, result = true, "service run");

    let signal = {
        let cancel = cancel.clone();
        async move { cancel.cancelled().await }
    };
    let server = axum::serve(
        listener,
        router.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(signal)
    .into_future();
    let mut server = std::pin::pin!(server);

    tokio::select! {
        res = &mut server => {
            res.with_context(|| format!("{service}: serve"))?;
            tracing::info!(service, result = true, "service exit");
            return Ok(());
        }
        _ = cancel.cancelled() => {
            tracing::warn!(service, "service shutdown");
        }
    }

    match tokio::time::timeout(shutdown_timeout, server).await {
        Ok(Ok(())) => tracing::info!(service, result = true, "service shutdown"),
        Ok(Err(e)) => tracing::error!(service, error = %e, result = false, "service shutdown"),
        Err(_) => tracing::warn!(
            service,
            timeout_ms = shutdown_timeout.as_millis() as u64,
            "shutdown deadline reached, in-flight requests abandoned"
        ),
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::{ModuleCall, ModuleCallPanic, MODULE_CALL, MODULE_CALL_PANIC};
    use parking_lot::Mutex;
    use serde::{Deserialize, Serialize};
    use axum::http::Request as HttpRequest;
    use tower::ServiceExt;

    #[derive(Deserialize)]
    struct Hello {
        #[serde(default)]
        content: String,
    }

    #[derive(Serialize)]
    struct Echo {
        content: String,
        tag: Option<&'static str>,
        client_ip: Option<String>,
    }

    #[derive(Clone)]
    struct Tag(&'static str);

    async fn hello(ctx: CallContext, req: Hello) -> Result<Echo, DispatchError> {
        if req.content.is_empty() {
            return Err(DispatchError::InvalidRequest("content is required".into()));
        }
        assert_eq!(ctx.metadata_value("Module"), Some("say"));
        assert_eq!(
            ctx.metadata_value("FullPath"),
            Some("/daydream/{module}/{message}")
        );
        Ok(Echo {
            content: req.content,
            tag: ctx.extension::<Tag>().map(|t| t.0),
            client_ip: ctx.client_ip,
        })
    }

    async fn try_panic(_ctx: CallContext, _req: Value) -> Result<Value, DispatchError> {
        panic!("try panic");
    }

    struct Fixture {
        router: Router,
        bus: Arc<EventBus>,
    }

    fn fixture(metrics: Option<prometheus::Registry>) -> Fixture {
        let dispatcher = Arc::new(Dispatcher::new());
        dispatcher.register_typed("say", "hello", hello);
        dispatcher.register_typed("say", "tryPanic", try_panic);
        let bus = Arc::new(EventBus::new());
        let inject: ContextInjector = Arc::new(|ext| {
            ext.insert(Tag("injected"));
        });
        let router = build_router(NetworkOptions {
            dispatcher,
            bus: bus.clone(),
            injectors: vec![inject],
            route_prefix: "daydream".into(),
            metrics,
        });
        Fixture { router, bus }
    }

    async fn body_json(resp: Response) -> Value {
        let bytes = to_bytes(resp.into_body(), usize::MAX).await.unwrap();
        serde_json::from_slice(&bytes).unwrap()
    }

    #[tokio::test]
    async fn get_binds_query_and_applies_injectors() {
        let fx = fixture(None);
        let resp = fx
            .router
            .oneshot(
                HttpRequest::get("/daydream/say/hello?content=hi")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        assert!(resp.headers().contains_key("x-request-id"));
        let body = body_json(resp).await;
        assert_eq!(body["content"], "hi");
        assert_eq!(body["tag"], "injected");
        assert!(body["client_ip"].is_null());
    }

    #[tokio::test]
    async fn post_binds_json_and_publishes_call_event() {
        let fx = fixture(None);
        let calls = Arc::new(Mutex::new(Vec::new()));
        {
            let calls = calls.clone();
            fx.bus.subscribe_typed(MODULE_CALL, move |e: &ModuleCall| {
                calls.lock().push(e.clone());
            });
        }

        let resp = fx
            .router
            .oneshot(
                HttpRequest::post("/daydream/say/hello")
                    .header("content-type", "application/json")
                    .header("x-request-id", "req-1")
                    .body(Body::from(r#"{"content":"yo"}"#))
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        assert_eq!(resp.headers()["x-request-id"], "req-1");
        assert_eq!(body_json(resp).await["content"], "yo");

        let calls = calls.lock();
        assert_eq!(calls.len(), 1);
        assert_eq!(calls[0].module, "say");
        assert_eq!(calls[0].function, "hello");
        assert_eq!(calls[0].request_id, "req-1");
    }

    #[tokio::test]
    async fn empty_post_body_is_empty_object() {
        let fx = fixture(None);
        let resp = fx
            .router
            .oneshot(HttpRequest::post("/daydream/say/hello").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        let body = body_json(resp).await;
        assert_eq!(body["code"], protocol::CODE_INVALID_REQUEST);
        assert_eq!(body["msg"], "content is required");
    }

    #[tokio::test]
    async fn malformed_json_is_invalid_json_param() {
        let fx = fixture(None);
        let resp = fx
            .router
            .oneshot(
                HttpRequest::post("/daydream/say/hello")
                    .body(Body::from("{not json"))
                    .unwrap(),
            )
            .await
            .unwrap();
        let body = body_json(resp).await;
        assert_eq!(body["code"], protocol::CODE_INVALID_JSON_PARAM);
    }

    #[tokio::test]
    async fn unknown_route_is_404() {
        let fx = fixture(None);
        let resp = fx
            .router
            .oneshot(HttpRequest::get("/daydream/say/nope").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::NOT_FOUND);
        let body = body_json(resp).await;
        assert_eq!(body["code"], protocol::CODE_INVALID_REQUEST);
        assert!(!body["requestId"].as_str().unwrap().is_empty());
    }

    #[tokio::test]
    async fn panic_is_500_and_published() {
        let fx = fixture(None);
        let panics = Arc::new(Mutex::new(Vec::new()));
        {
            let panics = panics.clone();
            fx.bus
                .subscribe_typed(MODULE_CALL_PANIC, move |e: &ModuleCallPanic| {
                    panics.lock().push(e.clone());
                });
        }
        let resp = fx
            .router
            .oneshot(
                HttpRequest::get("/daydream/say/tryPanic")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::INTERNAL_SERVER_ERROR);
        assert_eq!(body_json(resp).await["code"], protocol::CODE_INTERNAL_ERROR);
        let panics = panics.lock();
        assert_eq!(panics.len(), 1);
        assert_eq!(panics[0].error, "try panic");
    }

    #[tokio::test]
    async fn panicking_call_subscriber_still_answers() {
        let fx = fixture(None);
        fx.bus
            .subscribe_typed(MODULE_CALL, |_: &ModuleCall| panic!("subscriber boom"));
        let panics = Arc::new(Mutex::new(Vec::new()));
        {
            let panics = panics.clone();
            fx.bus
                .subscribe_typed(MODULE_CALL_PANIC, move |e: &ModuleCallPanic| {
                    panics.lock().push(e.clone());
                });
        }

        let resp = fx
            .router
            .oneshot(
                HttpRequest::get("/daydream/say/hello?content=hi")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::INTERNAL_SERVER_ERROR);
        let body = body_json(resp).await;
        assert_eq!(body["code"], protocol::CODE_INTERNAL_ERROR);
        assert!(!body["requestId"].as_str().unwrap().is_empty());

        let panics = panics.lock();
        assert_eq!(panics.len(), 1);
        assert_eq!(panics[0].function, "hello");
        assert_eq!(panics[0].error, "subscriber boom");
    }

    #[tokio::test]
    async fn message_route_requests_are_measured() {
        let registry = prometheus::Registry::new();
        let fx = fixture(Some(registry.clone()));
        let resp = fx
            .router
            .clone()
            .oneshot(
                HttpRequest::get("/daydream/say/hello?content=hi")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);

        let resp = fx
            .router
            .oneshot(HttpRequest::get("/metric").body(Body::empty()).unwrap())
            .await
            .unwrap();
        let bytes = to_bytes(resp.into_body(), usize::MAX).await.unwrap();
        let text = String::from_utf8_lossy(&bytes);
        let line = text
            .lines()
            .find(|l| l.starts_with("espresso_http_requests_total{"))
            .expect("request counter exported");
        assert!(line.contains(r#"path="/daydream/{module}/{message}""#), "{line}");
        assert!(line.contains(r#"status="200""#), "{line}");
        assert!(line.ends_with(" 1"), "{line}");
        assert!(text.contains("espresso_http_request_duration_seconds_count"));
    }

    #[tokio::test]
    async fn metric_endpoint_only_with_registry() {
        let fx = fixture(None);
        let resp = fx
            .router
            .oneshot(HttpRequest::get("/metric").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::NOT_FOUND);

        let registry = prometheus::Registry::new();
        let counter = prometheus::IntCounter::new("probe_total", "probe").unwrap();
        registry.register(Box::new(counter.clone())).unwrap();
        counter.inc();

        let fx = fixture(Some(registry));
        let resp = fx
            .router
            .oneshot(HttpRequest::get("/metric").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        let bytes = to_bytes(resp.into_body(), usize::MAX).await.unwrap();
        assert!(String::from_utf8_lossy(&bytes).contains("probe_total 1"));
    }

    #[tokio::test]
    async fn serve_stops_on_cancel() {
        let fx = fixture(None);
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let cancel = CancellationToken::new();
        let task = tokio::spawn(serve_listener(
            "network",
            listener,
            fx.router,
            cancel.clone(),
            Duration::from_secs(1),
        ));
        cancel.cancel();
        let res = tokio::time::timeout(Duration::from_secs(3), task)
            .await
            .unwrap()
            .unwrap();
        assert!(res.is_ok());
    }
}
