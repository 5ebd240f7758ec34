//! End-to-end tests: a real proxy listener in front of an in-process upstream

use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use bytes::Bytes;
use http_body_util::{BodyExt, Full};
use hyper::body::Incoming;
use hyper::header::{HeaderValue, CONTENT_TYPE, HOST};
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::{Method, Request, Response, StatusCode};
use hyper_util::client::legacy::connect::HttpConnector;
use hyper_util::client::legacy::Client;
use hyper_util::rt::{TokioExecutor, TokioIo};
use serde_json::{json, Value};
use tempfile::TempDir;
use tokio::net::TcpListener;
use tokio::sync::broadcast;
use tokio::task::{JoinHandle, JoinSet};

use betamax::config::ServerConfig;
use betamax::network::NetworkHandler;
use betamax::pipeline::{CONFIG_PATH, DENIED_STATUS};

const PNG: &[u8] = &[0x89, b'P', b'N', b'G', 0x0d, 0x0a, 0x1a, 0x0a, 0x00, 0xff];

/// Test upstream; stopping it closes the listener and every open connection
struct Upstream {
    addr: SocketAddr,
    join: JoinHandle<()>,
}

impl Upstream {
    async fn start() -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let count = Arc::new(AtomicUsize::new(0));

        let join = tokio::spawn(async move {
            let mut connections = JoinSet::new();
            loop {
                let Ok((stream, _peer)) = listener.accept().await else {
                    continue;
                };
                let count = Arc::clone(&count);
                connections.spawn(async move {
                    let service = service_fn(move |request: Request<Incoming>| {
                        let count = Arc::clone(&count);
                        async move { Ok::<_, Infallible>(upstream_answer(request, &count)) }
                    });
                    let _ = http1::Builder::new()
                        .serve_connection(TokioIo::new(stream), service)
                        .await;
                });
            }
        });

        Self { addr, join }
    }

    async fn stop(self) {
        self.join.abort();
        let _ = self.join.await;
    }
}

fn upstream_answer(request: Request<Incoming>, count: &AtomicUsize) -> Response<Full<Bytes>> {
    let (body, content_type) = match request.uri().path() {
        "/request-count" => {
            let n = count.fetch_add(1, Ordering::SeqCst) + 1;
            (Bytes::from(format!("{n} requests so far")), "text/plain")
        }
        "/host" => {
            let host = request
                .headers()
                .get(HOST)
                .and_then(|v| v.to_str().ok())
                .unwrap_or_default()
                .to_string();
            (Bytes::from(host), "text/plain")
        }
        "/logo.png" => (Bytes::from_static(PNG), "image/png"),
        "/" => (Bytes::from_static(b"hello, world"), "text/plain"),
        _ => (Bytes::from_static(b"hello"), "text/plain"),
    };

    let mut response = Response::new(Full::new(body));
    response
        .headers_mut()
        .insert(CONTENT_TYPE, HeaderValue::from_static(content_type));
    response
}

/// Proxy listening on an ephemeral port
struct Proxy {
    addr: SocketAddr,
    client: Client<HttpConnector, Full<Bytes>>,
    shutdown: broadcast::Sender<()>,
    join: JoinHandle<betamax::Result<()>>,
}

impl Proxy {
    async fn start(target: SocketAddr, cassette_dir: &TempDir) -> Self {
        let mut config = ServerConfig::new(format!("http://{target}"));
        config.cassette_dir = cassette_dir.path().to_path_buf();
        config.timeouts.upstream_ms = 2_000;

        let handler = NetworkHandler::new(config).unwrap();
        let shutdown = handler.shutdown_signal();
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let join = tokio::spawn(handler.serve(listener));

        Self {
            addr,
            client: Client::builder(TokioExecutor::new()).build_http(),
            shutdown,
            join,
        }
    }

    async fn stop(self) {
        // idle keep-alive connections would hold up the drain
        drop(self.client);
        self.shutdown.send(()).ok();
        let _ = self.join.await;
    }

    async fn send(
        &self,
        method: Method,
        path: &str,
        headers: &[(&str, &str)],
        body: Bytes,
    ) -> (StatusCode, Bytes) {
        let mut builder = Request::builder()
            .method(method)
            .uri(format!("http://{}{}", self.addr, path));
        for (name, value) in headers {
            builder = builder.header(*name, *value);
        }
        let response = self
            .client
            .request(builder.body(Full::new(body)).unwrap())
            .await
            .unwrap();
        let status = response.status();
        let body = response.into_body().collect().await.unwrap().to_bytes();
        (status, body)
    }

    async fn get(&self, path: &str) -> (StatusCode, String) {
        self.get_with_headers(path, &[]).await
    }

    async fn get_with_headers(&self, path: &str, headers: &[(&str, &str)]) -> (StatusCode, String) {
        let (status, body) = self.send(Method::GET, path, headers, Bytes::new()).await;
        (status, String::from_utf8(body.to_vec()).unwrap())
    }

    async fn post_form(&self, path: &str, fields: &[(&str, &str)]) -> String {
        let body = fields
            .iter()
            .map(|(k, v)| format!("{}={}", urlencoding::encode(k), urlencoding::encode(v)))
            .collect::<Vec<_>>()
            .join("&");
        let (_, body) = self
            .send(
                Method::POST,
                path,
                &[("content-type", "application/x-www-form-urlencoded")],
                Bytes::from(body),
            )
            .await;
        String::from_utf8(body.to_vec()).unwrap()
    }

    async fn configure(&self, settings: Value) -> (StatusCode, Value) {
        let (status, body) = self
            .send(
                Method::POST,
                CONFIG_PATH,
                &[("content-type", "application/json")],
                Bytes::from(settings.to_string()),
            )
            .await;
        (status, serde_json::from_slice(&body).unwrap_or(Value::Null))
    }

    async fn insert(&self, cassette: &str) {
        let (status, _) = self.configure(json!({ "cassette": cassette })).await;
        assert_eq!(status, StatusCode::OK);
    }

    async fn settings(&self) -> Value {
        let (status, body) = self
            .send(Method::GET, CONFIG_PATH, &[], Bytes::new())
            .await;
        assert_eq!(status, StatusCode::OK);
        serde_json::from_slice(&body).unwrap()
    }
}

async fn setup() -> (TempDir, Upstream, Proxy) {
    let temp_dir = TempDir::new().unwrap();
    let upstream = Upstream::start().await;
    let proxy = Proxy::start(upstream.addr, &temp_dir).await;
    (temp_dir, upstream, proxy)
}

#[tokio::test]
async fn passthrough_without_cassette_matches_upstream() {
    let (_dir, upstream, proxy) = setup().await;

    assert_eq!(proxy.get("/").await, (StatusCode::OK, "hello, world".to_string()));
    assert_eq!(proxy.get("/request-count").await.1, "1 requests so far");
    assert_eq!(proxy.get("/request-count").await.1, "2 requests so far");
    assert_eq!(proxy.settings().await["episode_count"], 0);

    proxy.stop().await;
    upstream.stop().await;
}

#[tokio::test]
async fn records_nothing_without_cassette() {
    let (_dir, upstream, proxy) = setup().await;

    assert_eq!(proxy.get("/").await.0, StatusCode::OK);
    upstream.stop().await;

    let (status, _) = proxy.get("/").await;
    assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);

    proxy.stop().await;
}

#[tokio::test]
async fn replays_after_upstream_shutdown_and_denies_unrecorded() {
    let (dir, upstream, proxy) = setup().await;
    proxy.insert("a").await;

    assert_eq!(proxy.get("/x?q=1").await, (StatusCode::OK, "hello".to_string()));
    upstream.stop().await;

    assert_eq!(proxy.get("/x?q=1").await, (StatusCode::OK, "hello".to_string()));

    let (status, _) = proxy
        .configure(json!({ "deny_unrecorded_requests": true }))
        .await;
    assert_eq!(status, StatusCode::OK);

    let (status, body) = proxy.get("/x?q=2").await;
    assert_eq!(status.as_u16(), DENIED_STATUS);
    assert!(body.starts_with("Betamax:"));
    assert_eq!(proxy.settings().await["episode_count"], 1);
    assert!(dir.path().join("a.json").exists());

    proxy.stop().await;
}

#[tokio::test]
async fn differentiates_form_field_sets() {
    let (_dir, upstream, proxy) = setup().await;
    proxy.insert("forms").await;

    let one = [("Foo", "Bar")];
    let two = [("Foo", "Bar"), ("Baz", "Quux")];

    assert_eq!(proxy.post_form("/request-count", &one).await, "1 requests so far");
    assert_eq!(proxy.post_form("/request-count", &two).await, "2 requests so far");
    assert_eq!(proxy.post_form("/request-count", &one).await, "1 requests so far");

    proxy.stop().await;
    upstream.stop().await;
}

#[tokio::test]
async fn differentiates_methods() {
    let (_dir, upstream, proxy) = setup().await;
    proxy.insert("methods").await;

    assert_eq!(proxy.post_form("/request-count", &[]).await, "1 requests so far");
    assert_eq!(proxy.get("/request-count").await.1, "2 requests so far");
    assert_eq!(proxy.post_form("/request-count", &[]).await, "1 requests so far");

    proxy.stop().await;
    upstream.stop().await;
}

#[tokio::test]
async fn differentiates_query_strings() {
    let (_dir, upstream, proxy) = setup().await;
    proxy.insert("queries").await;

    assert_eq!(proxy.get("/request-count?foo=bar").await.1, "1 requests so far");
    assert_eq!(proxy.get("/request-count?foo=quux").await.1, "2 requests so far");
    assert_eq!(proxy.get("/request-count?foo=bar").await.1, "1 requests so far");

    proxy.stop().await;
    upstream.stop().await;
}

#[tokio::test]
async fn matches_only_listed_headers() {
    let (_dir, upstream, proxy) = setup().await;
    proxy.insert("headers").await;

    let json_type = [("content-type", "text/json")];
    let html_type = [("content-type", "text/html")];

    // not listed: both requests share one episode
    assert_eq!(
        proxy.get_with_headers("/request-count", &json_type).await.1,
        "1 requests so far"
    );
    assert_eq!(
        proxy.get_with_headers("/request-count", &html_type).await.1,
        "1 requests so far"
    );

    proxy.insert("listed-headers").await;
    proxy
        .configure(json!({ "match_headers": ["Content-Type"] }))
        .await;

    assert_eq!(
        proxy.get_with_headers("/request-count", &json_type).await.1,
        "2 requests so far"
    );
    assert_eq!(
        proxy.get_with_headers("/request-count", &html_type).await.1,
        "3 requests so far"
    );
    assert_eq!(
        proxy.get_with_headers("/request-count", &json_type).await.1,
        "2 requests so far"
    );

    proxy.stop().await;
    upstream.stop().await;
}

#[tokio::test]
async fn switching_cassettes_back_restores_episodes() {
    let (_dir, upstream, proxy) = setup().await;

    proxy.insert("first").await;
    assert_eq!(proxy.get("/request-count").await.1, "1 requests so far");

    proxy.insert("second").await;
    assert_eq!(proxy.settings().await["episode_count"], 0);
    assert_eq!(proxy.get("/request-count").await.1, "2 requests so far");

    proxy.insert("first").await;
    assert_eq!(proxy.settings().await["episode_count"], 1);
    assert_eq!(proxy.get("/request-count").await.1, "1 requests so far");

    proxy.stop().await;
    upstream.stop().await;
}

#[tokio::test]
async fn cassette_file_holds_text_and_binary_bodies() {
    let (dir, upstream, proxy) = setup().await;
    proxy.insert("bodies").await;

    proxy.get("/").await;
    let (status, png) = proxy
        .send(Method::GET, "/logo.png", &[], Bytes::new())
        .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(&png[..], PNG);

    let file = std::fs::read(dir.path().join("bodies.json")).unwrap();
    let episodes: Value = serde_json::from_slice(&file).unwrap();
    assert_eq!(episodes.as_array().unwrap().len(), 2);
    assert_eq!(episodes[0]["Request"]["Method"], "GET");
    assert_eq!(episodes[0]["Request"]["URL"], "/");
    assert_eq!(episodes[0]["Response"]["StatusCode"], 200);
    assert_eq!(episodes[0]["Response"]["Body"], "hello, world");
    assert_eq!(episodes[0]["Response"]["BodyEncoding"], "text");
    assert_eq!(episodes[1]["Response"]["BodyEncoding"], "base64");

    upstream.stop().await;
    let (status, replayed) = proxy
        .send(Method::GET, "/logo.png", &[], Bytes::new())
        .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(&replayed[..], PNG);

    proxy.stop().await;
}

#[tokio::test]
async fn rewrites_host_header_unless_disabled() {
    let (_dir, upstream, proxy) = setup().await;

    assert_eq!(proxy.get("/host").await.1, upstream.addr.to_string());

    proxy
        .configure(json!({ "cassette": "hosts", "rewrite_host_header": false }))
        .await;
    assert_eq!(proxy.get("/host").await.1, proxy.addr.to_string());

    proxy.stop().await;
    upstream.stop().await;
}

#[tokio::test]
async fn control_endpoint_over_the_wire() {
    let (_dir, upstream, proxy) = setup().await;

    let settings = proxy.settings().await;
    assert_eq!(settings["cassette"], "");
    assert_eq!(settings["record_new_episodes"], true);
    assert_eq!(settings["rewrite_host_header"], true);
    assert_eq!(settings["deny_unrecorded_requests"], false);
    assert_eq!(settings["match_headers"], json!([]));

    let (status, _) = proxy
        .send(Method::DELETE, CONFIG_PATH, &[], Bytes::new())
        .await;
    assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);

    let (status, body) = proxy.send(Method::PUT, CONFIG_PATH, &[], Bytes::new()).await;
    assert_eq!(status, StatusCode::METHOD_NOT_ALLOWED);
    assert!(!body.is_empty());

    let (status, _) = proxy.configure(json!({ "cassette": "../escape" })).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(proxy.settings().await["cassette"], "");

    proxy.stop().await;
    upstream.stop().await;
}

#[tokio::test]
async fn delete_erases_cassette() {
    let (dir, upstream, proxy) = setup().await;
    proxy.insert("wipe").await;

    assert_eq!(proxy.get("/request-count").await.1, "1 requests so far");
    assert!(dir.path().join("wipe.json").exists());

    let (status, _) = proxy
        .send(Method::DELETE, CONFIG_PATH, &[], Bytes::new())
        .await;
    assert_eq!(status, StatusCode::OK);
    assert!(!dir.path().join("wipe.json").exists());
    assert_eq!(proxy.get("/request-count").await.1, "2 requests so far");

    proxy.stop().await;
    upstream.stop().await;
}
