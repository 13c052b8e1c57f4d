//! Request dispatch.
//!
//! Every request lands on one catch-all handler which picks a route:
//!
//! | Request | Route |
//! |---------|-------|
//! | WebSocket upgrade headers | [`Route::WebSocket`] |
//! | `/.ws` | [`Route::TestPage`] |
//! | `/.sse` | [`Route::EventStream`] |
//! | anything else | [`Route::Echo`] |
//!
//! Session settings are read from the [`EnvSource`] on every request.

use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::Arc;

use axum::body::{Body, Bytes};
use axum::extract::ws::WebSocketUpgrade;
use axum::extract::{ConnectInfo, FromRequestParts, Request, State};
use axum::http::header::{
    ACCESS_CONTROL_ALLOW_ORIGIN, CACHE_CONTROL, CONNECTION, CONTENT_TYPE, UPGRADE,
};
use axum::http::request::Parts;
use axum::http::{HeaderMap, HeaderName, HeaderValue, StatusCode, Version};
use axum::response::{IntoResponse, Response};
use axum::Router;
use tokio_stream::wrappers::ReceiverStream;
use tokio_stream::StreamExt;
use tracing::{debug, info, warn};

use crate::announce::{self, HostnameLookup};
use crate::echo;
use crate::env::{self, EnvSource, LOG_HTTP_BODY, LOG_HTTP_HEADERS};
use crate::session::sse::{EventWriter, SseSession};
use crate::session::websocket::WebSocketSession;
use crate::session::Peer;
use crate::timeout::ConnectionTimeout;

/// Largest request body that will be buffered and echoed.
pub const MAX_BODY_SIZE: usize = 16 * 1024 * 1024;

/// Path of the interactive WebSocket test page.
pub const TEST_PAGE_PATH: &str = "/.ws";

/// Path of the SSE stream.
pub const EVENT_STREAM_PATH: &str = "/.sse";

const TEST_PAGE: &str = include_str!("test_page.html");

/// Shared, read-only handler state.
pub struct AppState {
    env: Arc<dyn EnvSource>,
    hostname: HostnameLookup,
}

impl AppState {
    /// State reading settings from `env` and the system hostname.
    pub fn new(env: Arc<dyn EnvSource>) -> Self {
        Self {
            env,
            hostname: announce::system_hostname,
        }
    }

    /// Replace the hostname lookup.
    #[cfg(test)]
    pub fn with_hostname_lookup(mut self, lookup: HostnameLookup) -> Self {
        self.hostname = lookup;
        self
    }
}

/// Where a request is sent.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Route {
    WebSocket,
    TestPage,
    EventStream,
    Echo,
}

/// Pick the route for a request.
pub fn route(headers: &HeaderMap, path: &str) -> Route {
    if is_websocket_upgrade(headers) {
        Route::WebSocket
    } else if path == TEST_PAGE_PATH {
        Route::TestPage
    } else if path == EVENT_STREAM_PATH {
        Route::EventStream
    } else {
        Route::Echo
    }
}

/// True if the request carries the WebSocket handshake headers
/// (`Connection: upgrade` and `Upgrade: websocket`, as token lists).
pub fn is_websocket_upgrade(headers: &HeaderMap) -> bool {
    has_token(headers, CONNECTION, "upgrade") && has_token(headers, UPGRADE, "websocket")
}

fn has_token(headers: &HeaderMap, name: HeaderName, token: &str) -> bool {
    headers
        .get_all(name)
        .iter()
        .filter_map(|v| v.to_str().ok())
        .flat_map(|v| v.split(','))
        .any(|t| t.trim().eq_ignore_ascii_case(token))
}

/// Build the application router.
pub fn router(state: Arc<AppState>) -> Router {
    Router::new().fallback(dispatch).with_state(state)
}

async fn dispatch(State(state): State<Arc<AppState>>, request: Request) -> Response {
    let peer = Peer(
        request
            .extensions()
            .get::<ConnectInfo<SocketAddr>>()
            .map(|info| info.0),
    );
    let env = state.env.as_ref();

    info!(peer = %peer, method = %request.method(), uri = %request.uri(), "Request");
    if env::flag_set(env, LOG_HTTP_HEADERS) {
        info!(peer = %peer, "Headers\n{}", echo::format_headers(request.headers()));
    }

    let announce = env::hostname_enabled(env, request.headers());
    let route = route(request.headers(), request.uri().path());
    if route == Route::WebSocket {
        return upgrade_websocket(&state, request, peer, announce).await;
    }

    let (parts, body) = request.into_parts();
    let body = match axum::body::to_bytes(body, MAX_BODY_SIZE).await {
        Ok(body) => body,
        Err(e) => {
            warn!(peer = %peer, error = %e, "Failed to read request body");
            return (StatusCode::BAD_REQUEST, "Failed to read request body\n").into_response();
        }
    };
    if env::flag_set(env, LOG_HTTP_BODY) && !body.is_empty() {
        info!(peer = %peer, "Body\n{}", echo::hex_dump(&body));
    }

    let mut response = match route {
        Route::TestPage => ([(CONTENT_TYPE, "text/html")], TEST_PAGE).into_response(),
        Route::EventStream => event_stream(&state, &parts, &body, peer, announce),
        Route::Echo | Route::WebSocket => echo_response(&state, &parts, &body, announce),
    };

    // Headers set by the route itself take precedence.
    let headers = response.headers_mut();
    for (name, value) in env::extra_headers(env) {
        headers.entry(name).or_insert(value);
    }
    response
}

async fn upgrade_websocket(
    state: &AppState,
    request: Request,
    peer: Peer,
    announce: bool,
) -> Response {
    let (mut parts, _body) = request.into_parts();
    let upgrade: WebSocketUpgrade = match WebSocketUpgrade::from_request_parts(&mut parts, &()).await
    {
        Ok(upgrade) => upgrade,
        Err(rejection) => {
            warn!(peer = %peer, error = %rejection.body_text(), "WebSocket upgrade rejected");
            return rejection.into_response();
        }
    };

    let timeout = ConnectionTimeout::from_env(state.env.as_ref());
    let announcement = announce.then(|| announce::served_by(state.hostname));

    upgrade
        .on_failed_upgrade(move |e| debug!(peer = %peer, error = %e, "WebSocket upgrade failed"))
        .on_upgrade(move |socket| async move {
            WebSocketSession::new(peer, timeout, announcement)
                .run(socket)
                .await;
        })
}

fn echo_response(state: &AppState, parts: &Parts, body: &Bytes, announce: bool) -> Response {
    let mut text = Vec::with_capacity(body.len() + 1024);
    if announce {
        text.extend_from_slice(announce::served_by(state.hostname).as_bytes());
        text.extend_from_slice(b"\n\n");
    }
    text.extend_from_slice(&echo::format_request(parts, body));
    text.extend_from_slice(echo::footer(parts).as_bytes());

    ([(CONTENT_TYPE, "text/plain; charset=utf-8")], text).into_response()
}

fn event_stream(
    state: &AppState,
    parts: &Parts,
    body: &Bytes,
    peer: Peer,
    announce: bool,
) -> Response {
    let timeout = ConnectionTimeout::from_env(state.env.as_ref());
    let hostname = if announce {
        announce::event_hostname(state.hostname)
    } else {
        None
    };
    let request = String::from_utf8_lossy(&echo::format_request(parts, body)).into_owned();

    let (writer, events) = EventWriter::channel(peer);
    tokio::spawn(SseSession::new(writer, timeout).run(hostname, request));

    let stream = ReceiverStream::new(events).map(Ok::<_, Infallible>);
    let mut response = Body::from_stream(stream).into_response();
    let headers = response.headers_mut();
    headers.insert(CONTENT_TYPE, HeaderValue::from_static("text/event-stream"));
    headers.insert(CACHE_CONTROL, HeaderValue::from_static("no-cache"));
    headers.insert(ACCESS_CONTROL_ALLOW_ORIGIN, HeaderValue::from_static("*"));
    // Connection-specific headers are not allowed in HTTP/2.
    if matches!(
        parts.version,
        Version::HTTP_09 | Version::HTTP_10 | Version::HTTP_11
    ) {
        headers.insert(CONNECTION, HeaderValue::from_static("keep-alive"));
    }
    response
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::announce::{failing_hostname, fixed_hostname};
    use crate::env::MapEnv;
    use http_body_util::BodyExt;
    use tower::ServiceExt;

    fn app_with(env: MapEnv, lookup: HostnameLookup) -> Router {
        router(Arc::new(
            AppState::new(Arc::new(env)).with_hostname_lookup(lookup),
        ))
    }

    fn app(env: MapEnv) -> Router {
        app_with(env, fixed_hostname)
    }

    async fn send(app: Router, request: axum::http::Request<Body>) -> (StatusCode, HeaderMap, String) {
        let response = app.oneshot(request).await.unwrap();
        let status = response.status();
        let headers = response.headers().clone();
        let body = response.into_body().collect().await.unwrap().to_bytes();
        (status, headers, String::from_utf8_lossy(&body).into_owned())
    }

    fn get(uri: &str) -> axum::http::Request<Body> {
        axum::http::Request::get(uri)
            .header("host", "echo.test")
            .body(Body::empty())
            .unwrap()
    }

    #[test]
    fn test_route_selection() {
        let mut upgrade = HeaderMap::new();
        upgrade.insert(CONNECTION, HeaderValue::from_static("keep-alive, Upgrade"));
        upgrade.insert(UPGRADE, HeaderValue::from_static("WebSocket"));

        assert_eq!(route(&upgrade, "/.sse"), Route::WebSocket);
        assert_eq!(route(&upgrade, "/anything"), Route::WebSocket);
        assert_eq!(route(&HeaderMap::new(), "/.ws"), Route::TestPage);
        assert_eq!(route(&HeaderMap::new(), "/.sse"), Route::EventStream);
        assert_eq!(route(&HeaderMap::new(), "/"), Route::Echo);
        assert_eq!(route(&HeaderMap::new(), "/.sse/extra"), Route::Echo);

        let mut upgrade_only = HeaderMap::new();
        upgrade_only.insert(UPGRADE, HeaderValue::from_static("websocket"));
        assert_eq!(route(&upgrade_only, "/"), Route::Echo);
    }

    #[tokio::test]
    async fn test_http_echo() {
        let (status, headers, body) = send(app(MapEnv::default()), get("/path?q=1")).await;

        assert_eq!(status, StatusCode::OK);
        assert_eq!(headers[CONTENT_TYPE], "text/plain; charset=utf-8");
        assert!(body.starts_with("Request served by echo-test-host\n\n"));
        assert!(body.contains("GET /path?q=1 HTTP/1.1\n\nHost: echo.test\n"));
        assert!(body.contains("WebSocket UI: http://echo.test/.ws"));
    }

    #[tokio::test]
    async fn test_http_echo_includes_body() {
        let env = MapEnv::from_pairs([(LOG_HTTP_BODY, "1"), (LOG_HTTP_HEADERS, "1")]);
        let request = axum::http::Request::post("/submit")
            .header("host", "echo.test")
            .body(Body::from("hello body"))
            .unwrap();

        let (_, _, body) = send(app(env), request).await;
        assert!(body.contains("POST /submit HTTP/1.1"));
        assert!(body.contains("\n\nhello body"));
    }

    #[tokio::test]
    async fn test_hostname_option() {
        let cases = [
            ("default", None, None, true),
            ("env false", Some("false"), None, false),
            ("header true", Some("false"), Some("true"), true),
            ("header false", Some("true"), Some("false"), false),
        ];

        for (name, env_value, header, expected) in cases {
            let env = match env_value {
                Some(v) => MapEnv::from_pairs([(env::SEND_SERVER_HOSTNAME, v)]),
                None => MapEnv::default(),
            };
            let mut request = get("/");
            if let Some(v) = header {
                request
                    .headers_mut()
                    .insert("x-send-server-hostname", HeaderValue::from_str(v).unwrap());
            }

            let (_, _, body) = send(app(env), request).await;
            assert_eq!(body.contains("Request served by"), expected, "case {name}");
        }
    }

    #[tokio::test]
    async fn test_http_echo_unknown_hostname() {
        let (_, _, body) = send(app_with(MapEnv::default(), failing_hostname), get("/")).await;
        assert!(body.starts_with("Server hostname unknown: no hostname\n\n"));
    }

    #[tokio::test]
    async fn test_page_has_timeout_handling() {
        let (status, headers, html) = send(app(MapEnv::default()), get("/.ws")).await;

        assert_eq!(status, StatusCode::OK);
        assert_eq!(headers[CONTENT_TYPE], "text/html");
        for marker in [
            "Connection timeout",
            "autoReconnect = false",
            "lastMessageWasTimeout",
            "SERVER TIMEOUT",
            "no auto-reconnect",
            "isTimeoutClose || lastMessageWasTimeout",
        ] {
            assert!(html.contains(marker), "missing {marker:?}");
        }
    }

    #[tokio::test]
    async fn test_send_header_variables() {
        let env = MapEnv::from_pairs([
            ("SEND_HEADER_X_ECHO_TEST", "yes"),
            ("SEND_HEADER_CONTENT_TYPE", "application/json"),
        ]);

        let (_, headers, _) = send(app(env), get("/")).await;
        assert_eq!(headers["x-echo-test"], "yes");
        assert_eq!(headers[CONTENT_TYPE], "text/plain; charset=utf-8");
    }

    #[tokio::test]
    async fn test_websocket_headers_without_upgradable_connection() {
        let request = axum::http::Request::get("/")
            .header("host", "echo.test")
            .header("connection", "Upgrade")
            .header("upgrade", "websocket")
            .header("sec-websocket-version", "13")
            .header("sec-websocket-key", "dGhlIHNhbXBsZSBub25jZQ==")
            .body(Body::empty())
            .unwrap();

        let (status, _, _) = send(app(MapEnv::default()), request).await;
        assert_eq!(status, StatusCode::UPGRADE_REQUIRED);
    }

    #[tokio::test]
    async fn test_event_stream_until_timeout() {
        // 0.005 minutes = 300ms, shorter than one heartbeat.
        let env = MapEnv::from_pairs([("CONNECTION_TIMEOUT_MINUTES", "0.005")]);
        let (status, headers, body) = send(app(env), get("/.sse")).await;

        assert_eq!(status, StatusCode::OK);
        assert_eq!(headers[CONTENT_TYPE], "text/event-stream");
        assert_eq!(headers[CACHE_CONTROL], "no-cache");
        assert_eq!(headers[ACCESS_CONTROL_ALLOW_ORIGIN], "*");
        assert_eq!(headers[CONNECTION], "keep-alive");

        let events: Vec<&str> = body.split("\n\n").filter(|e| !e.is_empty()).collect();
        assert_eq!(events.len(), 3, "{body}");
        assert_eq!(events[0], "event: server\ndata: echo-test-host\nid: 1");
        assert!(events[1].starts_with("event: request\ndata: GET /.sse HTTP/1.1\ndata: \n"));
        assert!(events[1].ends_with("id: 2"));
        assert!(events[2].starts_with("event: error\ndata: Connection timeout: "));
        assert!(events[2].contains("after 0.005 minutes."));
        assert!(events[2].ends_with("id: 3"));
    }

    #[tokio::test]
    async fn test_event_stream_skips_unresolved_hostname() {
        let env = MapEnv::from_pairs([("CONNECTION_TIMEOUT_MINUTES", "0.005")]);
        let (_, _, body) = send(app_with(env, failing_hostname), get("/.sse")).await;

        assert!(body.starts_with("event: request\n"));
        assert!(!body.contains("event: server"));
        assert!(body.contains("event: error\n"));
    }

    #[tokio::test]
    async fn test_event_stream_hostname_disabled() {
        let env = MapEnv::from_pairs([
            ("CONNECTION_TIMEOUT_MINUTES", "0.005"),
            (env::SEND_SERVER_HOSTNAME, "false"),
        ]);
        let (_, _, body) = send(app(env), get("/.sse")).await;

        assert!(body.starts_with("event: request\n"));
        assert!(!body.contains("echo-test-host"));
    }
}
