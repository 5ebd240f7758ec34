//! HTTP client forwarding requests to the upstream

use std::time::Duration;

use async_trait::async_trait;
use http_body_util::Full;
use hyper::body::Bytes;
use hyper::header::{HeaderName, CONNECTION};
use hyper::{HeaderMap, Request, Uri};
use hyper_rustls::{HttpsConnector, HttpsConnectorBuilder};
use hyper_util::client::legacy::connect::HttpConnector;
use hyper_util::client::legacy::Client;
use hyper_util::rt::TokioExecutor;
use tracing::{debug, warn};

use super::HttpHandler;
use crate::config::ServerConfig;
use crate::pipeline::{ProxyRequest, ResponseWriter, Stage};
use crate::{BetamaxError, Result};

/// Headers that only make sense for one transport hop
const HOP_BY_HOP: &[&str] = &[
    "connection",
    "keep-alive",
    "proxy-authenticate",
    "proxy-authorization",
    "proxy-connection",
    "te",
    "trailer",
    "transfer-encoding",
    "upgrade",
];

type UpstreamClient = Client<HttpsConnector<HttpConnector>, Full<Bytes>>;

/// Forwards requests to the configured upstream and writes back its answer
///
/// Both `http` and `https` upstreams are supported.
pub struct HttpForwarder {
    client: UpstreamClient,
    target: Uri,
    timeout: Duration,
    max_response_size: usize,
}

impl HttpForwarder {
    /// Create a forwarder for `config.target_url`
    ///
    /// # Errors
    ///
    /// Returns error if the target URL is invalid
    pub fn new(config: &ServerConfig) -> Result<Self> {
        let target = config.target_uri()?;

        let client = Client::builder(TokioExecutor::new())
            .pool_idle_timeout(Duration::from_secs(90))
            .pool_max_idle_per_host(10)
            .build(https_connector()?);

        Ok(Self {
            client,
            target,
            timeout: Duration::from_millis(config.timeouts.upstream_ms),
            max_response_size: config.limits.max_response_size,
        })
    }

    async fn round_trip(&self, request: Request<Full<Bytes>>) -> Result<hyper::Response<Bytes>> {
        let response = self.client.request(request).await.map_err(|e| {
            warn!("Upstream request failed: {e}");
            BetamaxError::Upstream(e.to_string())
        })?;

        let (parts, body) = response.into_parts();
        let body = HttpHandler::read_body(body, self.max_response_size)
            .await
            .map_err(|e| match e {
                BetamaxError::DataTooLarge { .. } => e,
                other => BetamaxError::Upstream(other.to_string()),
            })?;

        Ok(hyper::Response::from_parts(parts, body))
    }
}

#[async_trait]
impl Stage for HttpForwarder {
    async fn serve(&self, request: ProxyRequest, out: &mut dyn ResponseWriter) -> Result<()> {
        let (mut parts, body) = request.into_parts();
        let uri = build_uri(&self.target, &parts.uri)?;

        debug!("Forwarding {} to {}", parts.method, uri);

        strip_hop_by_hop_headers(&mut parts.headers);

        let mut upstream = Request::new(Full::new(body));
        *upstream.method_mut() = parts.method;
        *upstream.uri_mut() = uri;
        *upstream.headers_mut() = parts.headers;

        let mut response = tokio::time::timeout(self.timeout, self.round_trip(upstream))
            .await
            .map_err(|_| {
                BetamaxError::Upstream(format!("no answer within {}ms", self.timeout.as_millis()))
            })??;

        strip_hop_by_hop_headers(response.headers_mut());

        out.write_head(response.status(), response.headers());
        out.write_body(response.body());
        Ok(())
    }
}

/// Install the ring provider unless the process already chose one
fn ensure_crypto_provider() -> Result<()> {
    if rustls::crypto::CryptoProvider::get_default().is_some() {
        return Ok(());
    }

    if rustls::crypto::ring::default_provider()
        .install_default()
        .is_err()
        && rustls::crypto::CryptoProvider::get_default().is_none()
    {
        return Err(BetamaxError::ConfigError(
            "failed to install the rustls crypto provider".to_string(),
        ));
    }
    Ok(())
}

/// Connector speaking plain HTTP or TLS depending on the URI scheme
///
/// Trusts the platform's root certificates, or the bundled Mozilla roots
/// when the platform has none.
fn https_connector() -> Result<HttpsConnector<HttpConnector>> {
    ensure_crypto_provider()?;

    let builder = match HttpsConnectorBuilder::new().with_native_roots() {
        Ok(builder) => builder,
        Err(e) => {
            debug!("No native root certificates ({e}), using bundled roots");
            HttpsConnectorBuilder::new().with_webpki_roots()
        }
    };

    Ok(builder.https_or_http().enable_http1().build())
}

/// Upstream URI for an inbound request target
///
/// The target's base path is prepended to the request path; the request's
/// query is kept verbatim and appended after any query of the target.
fn build_uri(target: &Uri, request_uri: &Uri) -> Result<Uri> {
    let scheme = target.scheme_str().unwrap_or("http");
    let authority = target
        .authority()
        .ok_or_else(|| BetamaxError::ConfigError("target_url has no host".to_string()))?;

    let base = target.path().trim_end_matches('/');
    let path = request_uri.path();
    let mut uri = format!("{scheme}://{authority}{base}{path}");

    let query: Vec<&str> = [target.query(), request_uri.query()]
        .into_iter()
        .flatten()
        .filter(|q| !q.is_empty())
        .collect();
    if !query.is_empty() {
        uri.push('?');
        uri.push_str(&query.join("&"));
    }

    uri.parse::<Uri>()
        .map_err(|e| BetamaxError::InvalidRequest(format!("Invalid upstream URI '{uri}': {e}")))
}

/// Remove hop-by-hop headers, including those named by `Connection`
fn strip_hop_by_hop_headers(headers: &mut HeaderMap) {
    let named: Vec<HeaderName> = headers
        .get_all(CONNECTION)
        .iter()
        .filter_map(|value| value.to_str().ok())
        .flat_map(|value| value.split(','))
        .map(str::trim)
        .filter(|name| !name.is_empty())
        .filter_map(|name| HeaderName::from_bytes(name.as_bytes()).ok())
        .collect();

    for name in named {
        headers.remove(name);
    }
    for name in HOP_BY_HOP {
        headers.remove(*name);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use hyper::header::HeaderValue;

    fn uri(s: &str) -> Uri {
        s.parse().unwrap()
    }

    #[test]
    fn test_build_uri_simple() {
        let built = build_uri(&uri("http://example.com:8000"), &uri("/api/test")).unwrap();
        assert_eq!(built.to_string(), "http://example.com:8000/api/test");
    }

    #[test]
    fn test_build_uri_keeps_raw_query() {
        let built = build_uri(&uri("http://example.com"), &uri("/x?q=a%20b&q=2")).unwrap();
        assert_eq!(built.to_string(), "http://example.com/x?q=a%20b&q=2");
    }

    #[test]
    fn test_build_uri_joins_base_path() {
        let built = build_uri(&uri("http://example.com/v1/"), &uri("/users?id=3")).unwrap();
        assert_eq!(built.to_string(), "http://example.com/v1/users?id=3");

        let built = build_uri(&uri("http://example.com/v1?key=k"), &uri("/users?id=3")).unwrap();
        assert_eq!(built.to_string(), "http://example.com/v1/users?key=k&id=3");
    }

    #[test]
    fn test_build_uri_keeps_https_scheme() {
        let built = build_uri(&uri("https://api.example.com/v2"), &uri("/items")).unwrap();
        assert_eq!(built.to_string(), "https://api.example.com/v2/items");
    }

    #[test]
    fn test_forwarder_accepts_https_target() {
        let forwarder = HttpForwarder::new(&ServerConfig::new("https://api.example.com")).unwrap();
        assert_eq!(forwarder.target.scheme_str(), Some("https"));
    }

    #[test]
    fn test_strip_hop_by_hop_headers() {
        let mut headers = HeaderMap::new();
        headers.insert(CONNECTION, HeaderValue::from_static("close, x-hop"));
        headers.insert("x-hop", HeaderValue::from_static("1"));
        headers.insert("keep-alive", HeaderValue::from_static("timeout=5"));
        headers.insert("transfer-encoding", HeaderValue::from_static("chunked"));
        headers.insert("x-end", HeaderValue::from_static("ok"));

        strip_hop_by_hop_headers(&mut headers);

        assert_eq!(headers.len(), 1);
        assert_eq!(headers.get("x-end").unwrap(), "ok");
    }

    #[tokio::test]
    async fn test_unreachable_upstream_is_upstream_error() {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        let forwarder = HttpForwarder::new(&ServerConfig::new(format!("http://{addr}"))).unwrap();
        let request = Request::builder().uri("/").body(Bytes::new()).unwrap();
        let mut out = crate::pipeline::ResponseBuffer::new();

        let err = forwarder.serve(request, &mut out).await.unwrap_err();
        assert!(matches!(err, BetamaxError::Upstream(_)));
    }
}
