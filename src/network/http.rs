//! HTTP handler for request/response proxying

use std::convert::Infallible;
use std::sync::Arc;

use http_body_util::{BodyExt, Full};
use hyper::body::{Bytes, Incoming};
use hyper::header::{HeaderValue, CONTENT_TYPE};
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::{Request, Response, StatusCode};
use hyper_util::rt::TokioIo;
use tokio::net::TcpStream;
use tracing::debug;

use crate::config::LimitsConfig;
use crate::proxy::HttpProxy;
use crate::{BetamaxError, Result};

/// HTTP handler for processing connections
pub struct HttpHandler;

impl HttpHandler {
    /// Serve every request arriving on `stream` through `proxy`
    ///
    /// # Errors
    ///
    /// Returns error if the connection breaks at the HTTP level
    pub async fn handle_connection(stream: TcpStream, proxy: Arc<HttpProxy>) -> Result<()> {
        let peer = stream.peer_addr().ok();
        debug!("Handling HTTP connection from {:?}", peer);

        let io = TokioIo::new(stream);
        let service = service_fn(move |request: Request<Incoming>| {
            let proxy = Arc::clone(&proxy);
            async move { Ok::<_, Infallible>(proxy.handle_request(request).await) }
        });

        http1::Builder::new()
            .keep_alive(true)
            .serve_connection(io, service)
            .await
            .map_err(|e| BetamaxError::Other(format!("Connection error: {e}")))
    }

    /// Create a plain-text HTTP response
    #[must_use]
    pub fn create_response(status: StatusCode, body: &str) -> Response<Full<Bytes>> {
        let mut response = Response::new(Full::new(Bytes::from(body.to_string())));
        *response.status_mut() = status;
        response.headers_mut().insert(
            CONTENT_TYPE,
            HeaderValue::from_static("text/plain; charset=utf-8"),
        );
        response
    }

    /// Status reported for an error that escaped the pipeline
    #[must_use]
    pub fn error_status(error: &BetamaxError) -> StatusCode {
        match error {
            BetamaxError::DataTooLarge { .. } => StatusCode::PAYLOAD_TOO_LARGE,
            BetamaxError::InvalidRequest(_) | BetamaxError::InvalidCassetteName(_) => {
                StatusCode::BAD_REQUEST
            }
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// Create an error response carrying the error message
    #[must_use]
    pub fn error_response(error: &BetamaxError) -> Response<Full<Bytes>> {
        Self::create_response(Self::error_status(error), &error.to_string())
    }

    /// Check an incoming request against the configured limits
    ///
    /// # Errors
    ///
    /// Returns error if the declared body or the header count is too large
    pub fn validate_request<B>(request: &Request<B>, limits: &LimitsConfig) -> Result<()> {
        let declared = request
            .headers()
            .get(hyper::header::CONTENT_LENGTH)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.parse::<usize>().ok());
        if let Some(length) = declared {
            if length > limits.max_request_size {
                return Err(BetamaxError::DataTooLarge {
                    size: length,
                    limit: limits.max_request_size,
                });
            }
        }

        let header_count = request.headers().len();
        if header_count > limits.max_headers {
            return Err(BetamaxError::InvalidRequest(format!(
                "Too many headers: {header_count}"
            )));
        }

        Ok(())
    }

    /// Read a body with size limit
    ///
    /// # Errors
    ///
    /// Returns error if body is too large or read fails
    pub async fn read_body<B>(body: B, max_size: usize) -> Result<Bytes>
    where
        B: hyper::body::Body,
        B::Error: Into<Box<dyn std::error::Error + Send + Sync>>,
    {
        let limited = http_body_util::Limited::new(body, max_size);
        let collected = limited.collect().await.map_err(|e| {
            if e.is::<http_body_util::LengthLimitError>() {
                BetamaxError::DataTooLarge {
                    size: max_size.saturating_add(1),
                    limit: max_size,
                }
            } else {
                BetamaxError::Other(format!("Failed to read body: {e}"))
            }
        })?;

        Ok(collected.to_bytes())
    }
}
