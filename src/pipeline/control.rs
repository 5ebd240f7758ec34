//! Control endpoint stage

use std::sync::Arc;

use async_trait::async_trait;
use hyper::{Method, StatusCode};
use tracing::debug;

use super::{write_json, write_text, ProxyRequest, ResponseWriter, Stage};
use crate::tray::{SettingsUpdate, Tray};
use crate::Result;

/// Path of the configuration channel on the proxy's own listener
pub const CONFIG_PATH: &str = "/__betamax__/config";

/// Serves [`CONFIG_PATH`], passes everything else on
///
/// - `GET` reports the settings and episode count
/// - `POST` applies a partial settings object and reloads the cassette
/// - `DELETE` erases the inserted cassette
pub struct Control<S> {
    tray: Arc<Tray>,
    inner: S,
}

impl<S> Control<S> {
    /// Wrap `inner`
    pub fn new(tray: Arc<Tray>, inner: S) -> Self {
        Self { tray, inner }
    }
}

#[async_trait]
impl<S: Stage> Stage for Control<S> {
    async fn serve(&self, request: ProxyRequest, out: &mut dyn ResponseWriter) -> Result<()> {
        if request.uri().path() != CONFIG_PATH {
            return self.inner.serve(request, out).await;
        }

        debug!("Control request: {}", request.method());

        match *request.method() {
            Method::GET => write_json(out, StatusCode::OK, &self.tray.view().await),
            Method::POST => {
                let update = match parse_update(request.body()) {
                    Ok(update) => update,
                    Err(e) => {
                        write_text(
                            out,
                            StatusCode::BAD_REQUEST,
                            &format!("Betamax: invalid configuration: {e}\n"),
                        );
                        return Ok(());
                    }
                };
                let view = self.tray.update(&update).await?;
                write_json(out, StatusCode::OK, &view)
            }
            Method::DELETE => {
                let view = self.tray.reset().await?;
                write_json(out, StatusCode::OK, &view)
            }
            ref method => {
                write_text(
                    out,
                    StatusCode::METHOD_NOT_ALLOWED,
                    &format!("Betamax: method {method} is not allowed.\n"),
                );
                Ok(())
            }
        }
    }
}

fn parse_update(body: &[u8]) -> serde_json::Result<SettingsUpdate> {
    if body.iter().all(u8::is_ascii_whitespace) {
        return Ok(SettingsUpdate::default());
    }
    serde_json::from_slice(body)
}
