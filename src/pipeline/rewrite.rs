//! Host header rewriting

use std::sync::Arc;

use async_trait::async_trait;
use hyper::header::{HeaderValue, HOST};

use super::{pinned_snapshot, ProxyRequest, ResponseWriter, Stage};
use crate::tray::Tray;
use crate::{BetamaxError, Result};

/// Points the Host header at the upstream when the toggle is on
pub struct RewriteHost<S> {
    tray: Arc<Tray>,
    inner: S,
}

impl<S> RewriteHost<S> {
    /// Wrap `inner`
    pub fn new(tray: Arc<Tray>, inner: S) -> Self {
        Self { tray, inner }
    }
}

#[async_trait]
impl<S: Stage> Stage for RewriteHost<S> {
    async fn serve(&self, mut request: ProxyRequest, out: &mut dyn ResponseWriter) -> Result<()> {
        let snapshot = pinned_snapshot(&mut request, &self.tray).await;

        if snapshot.settings().rewrite_host_header {
            let host = HeaderValue::from_str(self.tray.target_host())
                .map_err(|e| BetamaxError::Other(format!("Invalid target host: {e}")))?;
            request.headers_mut().insert(HOST, host);
        }

        self.inner.serve(request, out).await
    }
}
