//! Record/replay decision stage

use std::fmt;
use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;
use hyper::header::{HeaderName, HeaderValue};
use hyper::{HeaderMap, StatusCode};
use tracing::{info, warn};

use super::{pinned_snapshot, write_text, Capture, ProxyRequest, ResponseWriter, Stage};
use crate::cassette::{Episode, RecordedRequest, RecordedResponse};
use crate::tray::{Snapshot, Tray};
use crate::{BetamaxError, Result};

/// Status answered for unmatched requests under the deny policy
pub const DENIED_STATUS: u16 = 499;

/// What happened to a request
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Outcome {
    Passthrough,
    Replaying,
    Recording,
    Missed,
}

impl fmt::Display for Outcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Passthrough => "passthrough",
            Self::Replaying => "replaying",
            Self::Recording => "recording",
            Self::Missed => "missed",
        })
    }
}

/// Replays, records, denies or forwards, depending on the tray
///
/// With no cassette inserted everything is forwarded untouched. Otherwise
/// the first matching episode is replayed; an unmatched request is denied,
/// recorded or forwarded, in that order of preference.
pub struct Decision<F> {
    tray: Arc<Tray>,
    forwarder: F,
}

impl<F> Decision<F> {
    /// Wrap the forwarding primitive
    pub fn new(tray: Arc<Tray>, forwarder: F) -> Self {
        Self { tray, forwarder }
    }
}

impl<F: Stage> Decision<F> {
    async fn decide(
        &self,
        request: ProxyRequest,
        snapshot: &Snapshot,
        out: &mut dyn ResponseWriter,
    ) -> Result<Outcome> {
        let settings = snapshot.settings();
        let cassette = settings.cassette.as_str();

        if cassette.is_empty() {
            self.forwarder.serve(request, out).await?;
            return Ok(Outcome::Passthrough);
        }

        let live = RecordedRequest::from_request(&request);

        if let Some(episode) = snapshot.find(&live) {
            serve_episode(&episode.response, out)?;
            return Ok(Outcome::Replaying);
        }

        if settings.deny_unrecorded_requests {
            let status = StatusCode::from_u16(DENIED_STATUS)
                .map_err(|e| BetamaxError::Other(e.to_string()))?;
            write_text(
                out,
                status,
                "Betamax: request not recorded, neither requested.\n",
            );
            return Ok(Outcome::Missed);
        }

        if settings.record_new_episodes {
            let mut capture = Capture::new(out);
            self.forwarder.serve(request, &mut capture).await?;
            let response = capture.finish();
            self.tray
                .record(cassette, Episode { request: live, response })
                .await?;
            return Ok(Outcome::Recording);
        }

        self.forwarder.serve(request, out).await?;
        Ok(Outcome::Passthrough)
    }
}

#[async_trait]
impl<F: Stage> Stage for Decision<F> {
    async fn serve(&self, mut request: ProxyRequest, out: &mut dyn ResponseWriter) -> Result<()> {
        let started = Instant::now();
        let snapshot = pinned_snapshot(&mut request, &self.tray).await;
        let cassette = snapshot.settings().cassette.as_str();
        let method = request.method().clone();
        let uri = request.uri().clone();

        let outcome = self.decide(request, &snapshot, out).await;

        match &outcome {
            Ok(outcome) if cassette.is_empty() => {
                info!("{}: {} {} [{:?}]", outcome, method, uri, started.elapsed());
            }
            Ok(outcome) => {
                info!(
                    "{} > {}: {} {} [{:?}]",
                    cassette,
                    outcome,
                    method,
                    uri,
                    started.elapsed()
                );
            }
            Err(e) => {
                warn!("{} {} failed after {:?}: {}", method, uri, started.elapsed(), e);
            }
        }

        outcome.map(|_| ())
    }
}

/// Write a recorded response: every header value, the status, the body
fn serve_episode(response: &RecordedResponse, out: &mut dyn ResponseWriter) -> Result<()> {
    let mut headers = HeaderMap::with_capacity(response.headers.len());
    for (name, value) in response.headers.iter() {
        match (
            HeaderName::from_bytes(name.as_bytes()),
            HeaderValue::from_str(value),
        ) {
            (Ok(name), Ok(value)) => {
                headers.append(name, value);
            }
            _ => warn!("Skipping unreplayable header {}", name),
        }
    }

    let status = StatusCode::from_u16(response.status)
        .map_err(|e| BetamaxError::Other(format!("Recorded status {}: {e}", response.status)))?;

    out.write_head(status, &headers);
    out.write_body(response.body.bytes());
    Ok(())
}
