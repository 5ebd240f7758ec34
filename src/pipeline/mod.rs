//! Request pipeline
//!
//! Each inbound request flows through a fixed chain of stages:
//!
//! ```text
//! Recovery -> Control -> RewriteHost -> Decision -> forwarder
//! ```
//!
//! Stages write their answer through a [`ResponseWriter`] rather than
//! returning it, which lets the decision stage interpose a [`Capture`] on
//! the forwarder's output while it is relayed to the caller.

mod control;
mod decision;
mod recovery;
mod rewrite;
mod writer;

use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use hyper::header::{HeaderValue, CONTENT_TYPE};
use hyper::{HeaderMap, Request, StatusCode};

pub use control::{Control, CONFIG_PATH};
pub use decision::{Decision, DENIED_STATUS};
pub use recovery::Recovery;
pub use rewrite::RewriteHost;
pub use writer::{Capture, ResponseBuffer};

use crate::tray::{Snapshot, Tray};
use crate::Result;

/// Inbound request with its body fully buffered
pub type ProxyRequest = Request<Bytes>;

/// Destination for a response: head first, then body chunks
pub trait ResponseWriter: Send {
    /// Write status and headers; only the first call has an effect
    fn write_head(&mut self, status: StatusCode, headers: &HeaderMap);

    /// Append body bytes, writing a `200 OK` head first if none was written
    fn write_body(&mut self, chunk: &[u8]);
}

/// One link of the pipeline
#[async_trait]
pub trait Stage: Send + Sync {
    /// Handle `request`, writing the answer into `out`
    async fn serve(&self, request: ProxyRequest, out: &mut dyn ResponseWriter) -> Result<()>;
}

#[async_trait]
impl<S: Stage + ?Sized> Stage for Box<S> {
    async fn serve(&self, request: ProxyRequest, out: &mut dyn ResponseWriter) -> Result<()> {
        (**self).serve(request, out).await
    }
}

/// Full chain around `forwarder`
pub fn build<F: Stage + 'static>(
    tray: Arc<Tray>,
    forwarder: F,
) -> Recovery<Control<RewriteHost<Decision<F>>>> {
    Recovery::new(Control::new(
        Arc::clone(&tray),
        RewriteHost::new(Arc::clone(&tray), Decision::new(tray, forwarder)),
    ))
}

/// Tray snapshot pinned to this request
///
/// The first stage asking takes a snapshot and stores it in the request's
/// extensions, so later stages decide on the same settings.
pub(crate) async fn pinned_snapshot(request: &mut ProxyRequest, tray: &Tray) -> Arc<Snapshot> {
    if let Some(snapshot) = request.extensions().get::<Arc<Snapshot>>() {
        return Arc::clone(snapshot);
    }
    let snapshot = tray.snapshot().await;
    request.extensions_mut().insert(Arc::clone(&snapshot));
    snapshot
}

/// Write a complete plain-text response
pub fn write_text(out: &mut dyn ResponseWriter, status: StatusCode, body: &str) {
    let mut headers = HeaderMap::new();
    headers.insert(
        CONTENT_TYPE,
        HeaderValue::from_static("text/plain; charset=utf-8"),
    );
    out.write_head(status, &headers);
    out.write_body(body.as_bytes());
}

/// Write a complete JSON response
///
/// # Errors
///
/// Returns error if `value` cannot be serialized
pub fn write_json<T: serde::Serialize>(
    out: &mut dyn ResponseWriter,
    status: StatusCode,
    value: &T,
) -> Result<()> {
    let mut body = serde_json::to_vec(value)
        .map_err(|e| crate::BetamaxError::Other(format!("Failed to encode JSON: {e}")))?;
    body.push(b'\n');

    let mut headers = HeaderMap::new();
    headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
    out.write_head(status, &headers);
    out.write_body(&body);
    Ok(())
}
