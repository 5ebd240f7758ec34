//! Outermost stage: failures become a 500 instead of a dropped connection

use std::any::Any;
use std::panic::AssertUnwindSafe;

use async_trait::async_trait;
use futures_util::FutureExt;
use tracing::error;

use super::{write_text, ProxyRequest, ResponseBuffer, ResponseWriter, Stage};
use crate::network::HttpHandler;
use crate::Result;

/// Catches errors and panics from the inner stages
///
/// The inner stages write into a private buffer; on failure that partial
/// output is discarded and replaced by the error message.
pub struct Recovery<S> {
    inner: S,
}

impl<S> Recovery<S> {
    /// Wrap `inner`
    pub fn new(inner: S) -> Self {
        Self { inner }
    }
}

#[async_trait]
impl<S: Stage> Stage for Recovery<S> {
    async fn serve(&self, request: ProxyRequest, out: &mut dyn ResponseWriter) -> Result<()> {
        let method = request.method().clone();
        let uri = request.uri().clone();

        let mut buffer = ResponseBuffer::new();
        let outcome = AssertUnwindSafe(self.inner.serve(request, &mut buffer))
            .catch_unwind()
            .await;

        match outcome {
            Ok(Ok(())) => buffer.replay(out),
            Ok(Err(e)) => {
                error!("Error: {} for {} {}", e, method, uri);
                write_text(out, HttpHandler::error_status(&e), &e.to_string());
            }
            Err(panic) => {
                let message = panic_message(panic.as_ref());
                error!("Panic: {} for {} {}", message, method, uri);
                write_text(out, hyper::StatusCode::INTERNAL_SERVER_ERROR, &message);
            }
        }

        Ok(())
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(message) = panic.downcast_ref::<&str>() {
        (*message).to_string()
    } else if let Some(message) = panic.downcast_ref::<String>() {
        message.clone()
    } else {
        "internal error".to_string()
    }
}
