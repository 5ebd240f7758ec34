//! HTTP proxy fronting the pipeline

use std::sync::Arc;

use http_body_util::Full;
use hyper::body::{Body, Bytes};
use hyper::{Request, Response};
use tracing::warn;

use crate::cassette::CassetteStore;
use crate::config::ServerConfig;
use crate::network::{HttpForwarder, HttpHandler};
use crate::pipeline::{self, ResponseBuffer, Stage};
use crate::tray::Tray;
use crate::Result;

/// HTTP proxy that records and replays through the inserted cassette
pub struct HttpProxy {
    config: Arc<ServerConfig>,
    tray: Arc<Tray>,
    root: Box<dyn Stage>,
}

impl HttpProxy {
    /// Create a proxy forwarding to `config.target_url`
    ///
    /// # Errors
    ///
    /// Returns error if the configuration is invalid
    pub fn new(config: Arc<ServerConfig>) -> Result<Self> {
        let forwarder = HttpForwarder::new(&config)?;
        Self::with_forwarder(config, forwarder)
    }

    /// Create a proxy around a custom forwarding stage
    ///
    /// # Errors
    ///
    /// Returns error if the configuration is invalid
    pub fn with_forwarder(config: Arc<ServerConfig>, forwarder: impl Stage + 'static) -> Result<Self> {
        config.validate()?;

        let store = CassetteStore::new(config.cassette_dir.clone());
        let tray = Arc::new(Tray::new(store, config.target_host()?));
        let root: Box<dyn Stage> = Box::new(pipeline::build(Arc::clone(&tray), forwarder));

        Ok(Self { config, tray, root })
    }

    /// Shared cassette state
    #[must_use]
    pub fn tray(&self) -> &Arc<Tray> {
        &self.tray
    }

    /// Startup configuration
    #[must_use]
    pub fn config(&self) -> &ServerConfig {
        &self.config
    }

    /// Answer one inbound request
    ///
    /// The body is buffered in full before the pipeline runs; oversized or
    /// unreadable requests are answered directly.
    pub async fn handle_request<B>(&self, request: Request<B>) -> Response<Full<Bytes>>
    where
        B: Body + Send,
        B::Error: Into<Box<dyn std::error::Error + Send + Sync>>,
    {
        if let Err(e) = HttpHandler::validate_request(&request, &self.config.limits) {
            warn!("Rejecting {} {}: {}", request.method(), request.uri(), e);
            return HttpHandler::error_response(&e);
        }

        let (parts, body) = request.into_parts();
        let body = match HttpHandler::read_body(body, self.config.limits.max_request_size).await {
            Ok(body) => body,
            Err(e) => {
                warn!("Rejecting {} {}: {}", parts.method, parts.uri, e);
                return HttpHandler::error_response(&e);
            }
        };

        let mut out = ResponseBuffer::new();
        if let Err(e) = self
            .root
            .serve(Request::from_parts(parts, body), &mut out)
            .await
        {
            return HttpHandler::error_response(&e);
        }
        out.into_response()
    }
}
