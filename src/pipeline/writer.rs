//! Response writers

use bytes::{Bytes, BytesMut};
use http_body_util::Full;
use hyper::{HeaderMap, Response, StatusCode};

use super::ResponseWriter;
use crate::cassette::{Body, Headers, RecordedResponse};

/// Buffers a whole response in memory
#[derive(Debug, Default)]
pub struct ResponseBuffer {
    head: Option<(StatusCode, HeaderMap)>,
    body: BytesMut,
}

impl ResponseBuffer {
    /// Empty buffer
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Status written so far, if any
    #[must_use]
    pub fn status(&self) -> Option<StatusCode> {
        self.head.as_ref().map(|(status, _)| *status)
    }

    /// Write the buffered response into another writer
    pub fn replay(self, out: &mut dyn ResponseWriter) {
        let (status, headers) = self
            .head
            .unwrap_or_else(|| (StatusCode::OK, HeaderMap::new()));
        out.write_head(status, &headers);
        if !self.body.is_empty() {
            out.write_body(&self.body);
        }
    }

    /// Turn the buffer into a hyper response
    #[must_use]
    pub fn into_response(self) -> Response<Full<Bytes>> {
        let (status, headers) = self
            .head
            .unwrap_or_else(|| (StatusCode::OK, HeaderMap::new()));

        let mut response = Response::new(Full::new(self.body.freeze()));
        *response.status_mut() = status;
        *response.headers_mut() = headers;
        response
    }
}

impl ResponseWriter for ResponseBuffer {
    fn write_head(&mut self, status: StatusCode, headers: &HeaderMap) {
        if self.head.is_none() {
            self.head = Some((status, headers.clone()));
        }
    }

    fn write_body(&mut self, chunk: &[u8]) {
        if self.head.is_none() {
            self.head = Some((StatusCode::OK, HeaderMap::new()));
        }
        self.body.extend_from_slice(chunk);
    }
}

/// Relays writes to an inner writer while keeping a copy for recording
pub struct Capture<'a> {
    inner: &'a mut dyn ResponseWriter,
    status: Option<StatusCode>,
    headers: Headers,
    body: BytesMut,
}

impl<'a> Capture<'a> {
    /// Wrap `inner`
    pub fn new(inner: &'a mut dyn ResponseWriter) -> Self {
        Self {
            inner,
            status: None,
            headers: Headers::new(),
            body: BytesMut::new(),
        }
    }

    /// Everything written so far, as a recorded response
    #[must_use]
    pub fn finish(self) -> RecordedResponse {
        let body = Body::new(self.body.freeze(), &self.headers);
        RecordedResponse {
            status: self.status.unwrap_or(StatusCode::OK).as_u16(),
            headers: self.headers,
            body,
        }
    }
}

impl ResponseWriter for Capture<'_> {
    fn write_head(&mut self, status: StatusCode, headers: &HeaderMap) {
        if self.status.is_none() {
            self.status = Some(status);
            self.headers = Headers::from_header_map(headers);
        }
        self.inner.write_head(status, headers);
    }

    fn write_body(&mut self, chunk: &[u8]) {
        if self.status.is_none() {
            self.status = Some(StatusCode::OK);
        }
        self.body.extend_from_slice(chunk);
        self.inner.write_body(chunk);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cassette::BodyEncoding;
    use hyper::header::{HeaderValue, CONTENT_TYPE, SET_COOKIE};

    #[test]
    fn test_buffer_defaults_to_ok() {
        let mut buffer = ResponseBuffer::new();
        buffer.write_body(b"hi");

        let response = buffer.into_response();
        assert_eq!(response.status(), StatusCode::OK);
    }

    #[test]
    fn test_buffer_ignores_second_head() {
        let mut buffer = ResponseBuffer::new();
        buffer.write_head(StatusCode::CREATED, &HeaderMap::new());
        buffer.write_head(StatusCode::INTERNAL_SERVER_ERROR, &HeaderMap::new());
        assert_eq!(buffer.status(), Some(StatusCode::CREATED));
    }

    #[test]
    fn test_capture_relays_and_records() {
        let mut headers = HeaderMap::new();
        headers.insert(CONTENT_TYPE, HeaderValue::from_static("text/plain"));
        headers.append(SET_COOKIE, HeaderValue::from_static("a=1"));
        headers.append(SET_COOKIE, HeaderValue::from_static("b=2"));

        let mut buffer = ResponseBuffer::new();
        let mut capture = Capture::new(&mut buffer);
        capture.write_head(StatusCode::ACCEPTED, &headers);
        capture.write_body(b"hel");
        capture.write_body(b"lo");
        let recorded = capture.finish();

        assert_eq!(recorded.status, 202);
        assert_eq!(recorded.headers.get_all("set-cookie"), vec!["a=1", "b=2"]);
        assert_eq!(recorded.body.bytes().as_ref(), b"hello");
        assert_eq!(recorded.body.encoding(), BodyEncoding::Text);

        let response = buffer.into_response();
        assert_eq!(response.status(), StatusCode::ACCEPTED);
        assert_eq!(response.headers().get_all(SET_COOKIE).iter().count(), 2);
    }
}
