//! Cassette file encoding
//!
//! A cassette is a pretty-printed JSON array of episodes. Bodies are strings:
//! verbatim text or standard base64, named by the `BodyEncoding` field. Files
//! written without that field fall back to the sibling Content-Type header.

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use bytes::Bytes;
use serde::{Deserialize, Serialize};

use super::episode::{Body, BodyEncoding, Episode, Form, Headers, RecordedRequest, RecordedResponse, Target};

#[derive(Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct WireEpisode {
    request: WireRequest,
    response: WireResponse,
}

#[derive(Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct WireRequest {
    method: String,
    #[serde(rename = "URL")]
    url: WireUrl,
    #[serde(default)]
    header: Headers,
    #[serde(default)]
    body: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    body_encoding: Option<BodyEncoding>,
    #[serde(default)]
    form: Option<Form>,
}

#[derive(Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct WireResponse {
    status_code: u16,
    #[serde(default)]
    header: Headers,
    #[serde(default)]
    body: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    body_encoding: Option<BodyEncoding>,
}

/// Request target on disk: a plain string, or the broken-out URL object
/// older cassettes carry.
#[derive(Serialize, Deserialize)]
#[serde(untagged)]
enum WireUrl {
    Text(String),
    Parts {
        #[serde(rename = "Path", default)]
        path: String,
        #[serde(rename = "RawQuery", default)]
        raw_query: String,
        #[serde(rename = "Fragment", default)]
        fragment: String,
    },
}

impl From<WireUrl> for Target {
    fn from(url: WireUrl) -> Self {
        match url {
            WireUrl::Text(raw) => Target::parse(&raw),
            WireUrl::Parts {
                path,
                raw_query,
                fragment,
            } => Target {
                path,
                query: raw_query,
                fragment,
            },
        }
    }
}

/// Serialize episodes into cassette JSON
///
/// # Errors
///
/// Returns error if serialization fails
pub fn encode(episodes: &[Episode]) -> serde_json::Result<Vec<u8>> {
    let wire: Vec<WireEpisode> = episodes.iter().map(to_wire).collect();
    serde_json::to_vec_pretty(&wire)
}

/// Parse cassette JSON into episodes
///
/// # Errors
///
/// Returns a description of the first problem found
pub fn decode(data: &[u8]) -> std::result::Result<Vec<Episode>, String> {
    let wire: Vec<WireEpisode> = serde_json::from_slice(data).map_err(|e| e.to_string())?;
    wire.into_iter()
        .enumerate()
        .map(|(i, episode)| from_wire(episode).map_err(|e| format!("episode {i}: {e}")))
        .collect()
}

fn to_wire(episode: &Episode) -> WireEpisode {
    let request = &episode.request;
    let response = &episode.response;

    WireEpisode {
        request: WireRequest {
            method: request.method.clone(),
            url: WireUrl::Text(request.target.to_string()),
            header: request.headers.clone(),
            body: encode_body(&request.body),
            body_encoding: Some(request.body.encoding()),
            form: Some(request.form.clone()),
        },
        response: WireResponse {
            status_code: response.status,
            header: response.headers.clone(),
            body: encode_body(&response.body),
            body_encoding: Some(response.body.encoding()),
        },
    }
}

fn from_wire(episode: WireEpisode) -> std::result::Result<Episode, String> {
    let WireEpisode { request, response } = episode;

    let request_body = decode_body(request.body, request.body_encoding, &request.header)
        .map_err(|e| format!("request body: {e}"))?;
    let response_body = decode_body(response.body, response.body_encoding, &response.header)
        .map_err(|e| format!("response body: {e}"))?;

    Ok(Episode {
        request: RecordedRequest {
            method: request.method,
            target: request.url.into(),
            headers: request.header,
            form: request.form.unwrap_or_default(),
            body: request_body,
        },
        response: RecordedResponse {
            status: response.status_code,
            headers: response.header,
            body: response_body,
        },
    })
}

fn encode_body(body: &Body) -> String {
    match body.encoding() {
        BodyEncoding::Text => String::from_utf8_lossy(body.bytes()).into_owned(),
        BodyEncoding::Base64 => BASE64.encode(body.bytes()),
    }
}

fn decode_body(
    raw: String,
    tag: Option<BodyEncoding>,
    headers: &Headers,
) -> std::result::Result<Body, base64::DecodeError> {
    let encoding = tag.unwrap_or_else(|| BodyEncoding::for_content_type(headers.content_type()));

    let bytes = match encoding {
        BodyEncoding::Text => Bytes::from(raw),
        BodyEncoding::Base64 => Bytes::from(BASE64.decode(raw)?),
    };

    Ok(Body::with_encoding(bytes, encoding))
}
