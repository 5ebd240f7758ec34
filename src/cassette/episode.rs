//! Episode data model

use std::collections::BTreeMap;
use std::fmt;

use bytes::Bytes;
use hyper::header::CONTENT_TYPE;
use hyper::{HeaderMap, Request, Uri};
use serde::de::{MapAccess, Visitor};
use serde::ser::SerializeMap;
use serde::{Deserialize, Deserializer, Serialize, Serializer};

use crate::form;

/// Parsed form fields, keyed by field name
pub type Form = BTreeMap<String, Vec<String>>;

/// One recorded request/response pair
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Episode {
    /// Request as it reached the proxy
    pub request: RecordedRequest,
    /// Response as it was relayed to the caller
    pub response: RecordedResponse,
}

/// Recorded request, everything the matcher looks at
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecordedRequest {
    /// HTTP method, compared case-sensitively
    pub method: String,
    /// Path, query and fragment; scheme and host are not part of it
    pub target: Target,
    /// Request headers
    pub headers: Headers,
    /// Form fields parsed from a form-encoded body
    pub form: Form,
    /// Raw body
    pub body: Body,
}

impl RecordedRequest {
    /// Capture a buffered inbound request
    #[must_use]
    pub fn from_request(request: &Request<Bytes>) -> Self {
        let headers = Headers::from_header_map(request.headers());
        let content_type = request
            .headers()
            .get(CONTENT_TYPE)
            .and_then(|v| v.to_str().ok());
        let form = form::parse_form(content_type, request.body());
        let body = Body::new(request.body().clone(), &headers);

        Self {
            method: request.method().as_str().to_string(),
            target: Target::from_uri(request.uri()),
            headers,
            form,
            body,
        }
    }
}

/// Recorded response, replayed verbatim on a match
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecordedResponse {
    /// HTTP status code
    pub status: u16,
    /// Response headers, in write order
    pub headers: Headers,
    /// Response body
    pub body: Body,
}

/// Request target without scheme and host
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash)]
pub struct Target {
    /// Path component
    pub path: String,
    /// Raw query string, without the leading `?`
    pub query: String,
    /// Fragment, without the leading `#`
    pub fragment: String,
}

impl Target {
    /// Build a target from a request URI
    #[must_use]
    pub fn from_uri(uri: &Uri) -> Self {
        Self {
            path: uri.path().to_string(),
            query: uri.query().unwrap_or_default().to_string(),
            fragment: String::new(),
        }
    }

    /// Parse `path?query#fragment`
    #[must_use]
    pub fn parse(raw: &str) -> Self {
        let (rest, fragment) = raw.split_once('#').unwrap_or((raw, ""));
        let (path, query) = rest.split_once('?').unwrap_or((rest, ""));

        Self {
            path: path.to_string(),
            query: query.to_string(),
            fragment: fragment.to_string(),
        }
    }
}

impl fmt::Display for Target {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.path)?;
        if !self.query.is_empty() {
            write!(f, "?{}", self.query)?;
        }
        if !self.fragment.is_empty() {
            write!(f, "#{}", self.fragment)?;
        }
        Ok(())
    }
}

/// How a body is written into a cassette file
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BodyEncoding {
    /// Verbatim UTF-8 string
    Text,
    /// Standard base64
    Base64,
}

impl BodyEncoding {
    /// Encoding implied by a Content-Type alone
    ///
    /// Textual means `text/...` or anything mentioning `json`.
    #[must_use]
    pub fn for_content_type(content_type: Option<&str>) -> Self {
        match content_type {
            Some(ct) if ct.starts_with("text/") || ct.contains("json") => Self::Text,
            _ => Self::Base64,
        }
    }
}

/// Body bytes tagged with their on-disk encoding
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Body {
    bytes: Bytes,
    encoding: BodyEncoding,
}

impl Body {
    /// Tag a captured body using the headers it travelled with
    ///
    /// A textual Content-Type only yields [`BodyEncoding::Text`] when the
    /// bytes are valid UTF-8.
    #[must_use]
    pub fn new(bytes: Bytes, headers: &Headers) -> Self {
        let encoding = match BodyEncoding::for_content_type(headers.content_type()) {
            BodyEncoding::Text if std::str::from_utf8(&bytes).is_ok() => BodyEncoding::Text,
            _ => BodyEncoding::Base64,
        };
        Self { bytes, encoding }
    }

    /// Body with an explicit encoding
    #[must_use]
    pub fn with_encoding(bytes: Bytes, encoding: BodyEncoding) -> Self {
        Self { bytes, encoding }
    }

    /// Raw bytes
    #[must_use]
    pub fn bytes(&self) -> &Bytes {
        &self.bytes
    }

    /// On-disk encoding
    #[must_use]
    pub fn encoding(&self) -> BodyEncoding {
        self.encoding
    }
}

/// Ordered header multimap
///
/// Names compare case-insensitively; repeated names keep every value in
/// the order they were written. Two header lists are equal when every name
/// carries the same values in the same order, however the names are
/// spelled or interleaved.
#[derive(Debug, Clone, Default)]
pub struct Headers(Vec<(String, String)>);

impl Headers {
    /// Empty header list
    #[must_use]
    pub fn new() -> Self {
        Self(Vec::new())
    }

    /// Copy every name/value pair out of a `HeaderMap`
    ///
    /// Values are kept as strings; bytes that are not UTF-8 (obs-text) are
    /// replaced with U+FFFD.
    #[must_use]
    pub fn from_header_map(map: &HeaderMap) -> Self {
        Self(
            map.iter()
                .map(|(name, value)| {
                    (
                        name.as_str().to_string(),
                        String::from_utf8_lossy(value.as_bytes()).into_owned(),
                    )
                })
                .collect(),
        )
    }

    /// Append a value
    pub fn push(&mut self, name: impl Into<String>, value: impl Into<String>) {
        self.0.push((name.into(), value.into()));
    }

    /// All values for `name`, in order
    #[must_use]
    pub fn get_all(&self, name: &str) -> Vec<&str> {
        self.0
            .iter()
            .filter(|(n, _)| n.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
            .collect()
    }

    /// First Content-Type value
    #[must_use]
    pub fn content_type(&self) -> Option<&str> {
        self.get_all("content-type").into_iter().next()
    }

    /// Iterate name/value pairs in order
    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.0.iter().map(|(n, v)| (n.as_str(), v.as_str()))
    }

    /// Number of name/value pairs
    #[must_use]
    pub fn len(&self) -> usize {
        self.0.len()
    }

    /// Whether there are no headers
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    fn by_name(&self) -> BTreeMap<String, Vec<&str>> {
        let mut grouped: BTreeMap<String, Vec<&str>> = BTreeMap::new();
        for (name, value) in &self.0 {
            grouped
                .entry(name.to_ascii_lowercase())
                .or_default()
                .push(value);
        }
        grouped
    }
}

impl PartialEq for Headers {
    fn eq(&self, other: &Self) -> bool {
        self.by_name() == other.by_name()
    }
}

impl Eq for Headers {}

impl FromIterator<(String, String)> for Headers {
    fn from_iter<I: IntoIterator<Item = (String, String)>>(iter: I) -> Self {
        Self(iter.into_iter().collect())
    }
}

// Serialized as `{"name": ["v1", "v2"]}`, names in first-seen order.
impl Serialize for Headers {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let mut names: Vec<&str> = Vec::new();
        for (name, _) in &self.0 {
            if !names.iter().any(|n| n.eq_ignore_ascii_case(name)) {
                names.push(name);
            }
        }

        let mut map = serializer.serialize_map(Some(names.len()))?;
        for name in names {
            map.serialize_entry(name, &self.get_all(name))?;
        }
        map.end()
    }
}

impl<'de> Deserialize<'de> for Headers {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        struct HeadersVisitor;

        impl<'de> Visitor<'de> for HeadersVisitor {
            type Value = Headers;

            fn expecting(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str("a map of header names to value lists")
            }

            fn visit_unit<E: serde::de::Error>(self) -> Result<Headers, E> {
                Ok(Headers::new())
            }

            fn visit_map<A: MapAccess<'de>>(self, mut access: A) -> Result<Headers, A::Error> {
                let mut headers = Headers::new();
                while let Some((name, values)) = access.next_entry::<String, Vec<String>>()? {
                    for value in values {
                        headers.push(name.clone(), value);
                    }
                }
                Ok(headers)
            }
        }

        deserializer.deserialize_any(HeadersVisitor)
    }
}
