//! Form body parsing
//!
//! Turns `application/x-www-form-urlencoded` and `multipart/form-data`
//! bodies into a field multimap. File parts of multipart bodies are skipped.

use tracing::debug;

use crate::cassette::Form;

const URLENCODED: &str = "application/x-www-form-urlencoded";
const MULTIPART: &str = "multipart/form-data";
const MAX_PART_HEADERS: usize = 16;

/// Parse a request body according to its Content-Type
///
/// Anything that is not a form, or fails to parse, yields an empty form.
#[must_use]
pub fn parse_form(content_type: Option<&str>, body: &[u8]) -> Form {
    let Some(content_type) = content_type else {
        return Form::new();
    };

    let mut params = content_type.split(';');
    let mime = params.next().unwrap_or_default().trim().to_ascii_lowercase();

    match mime.as_str() {
        URLENCODED => parse_urlencoded(body),
        MULTIPART => {
            let boundary = params.find_map(|param| {
                let (key, value) = param.trim().split_once('=')?;
                key.eq_ignore_ascii_case("boundary")
                    .then(|| value.trim_matches('"').to_string())
            });
            match boundary {
                Some(boundary) if !boundary.is_empty() => parse_multipart(body, &boundary),
                _ => {
                    debug!("multipart body without boundary");
                    Form::new()
                }
            }
        }
        _ => Form::new(),
    }
}

fn parse_urlencoded(body: &[u8]) -> Form {
    let mut form = Form::new();
    let Ok(text) = std::str::from_utf8(body) else {
        return form;
    };

    for pair in text.split('&').filter(|p| !p.is_empty()) {
        let (raw_key, raw_value) = pair.split_once('=').unwrap_or((pair, ""));
        match (decode_component(raw_key), decode_component(raw_value)) {
            (Some(key), Some(value)) => form.entry(key).or_default().push(value),
            _ => debug!("skipping undecodable form pair"),
        }
    }

    form
}

fn decode_component(raw: &str) -> Option<String> {
    let spaced = raw.replace('+', " ");
    urlencoding::decode(&spaced).ok().map(|s| s.into_owned())
}

fn parse_multipart(body: &[u8], boundary: &str) -> Form {
    let mut form = Form::new();
    let delimiter = format!("--{boundary}");
    let delimiter = delimiter.as_bytes();

    let Some(mut start) = find(body, delimiter, 0) else {
        return form;
    };

    loop {
        let after = start + delimiter.len();
        if body[after..].starts_with(b"--") {
            break;
        }

        let Some(next) = find(body, delimiter, after) else {
            break;
        };

        let part = strip_crlf(&body[after..next]);
        if let Some((name, value)) = parse_part(part) {
            form.entry(name).or_default().push(value);
        }

        start = next;
    }

    form
}

fn parse_part(part: &[u8]) -> Option<(String, String)> {
    let part = part.strip_prefix(b"\r\n").unwrap_or(part);

    let mut headers = [httparse::EMPTY_HEADER; MAX_PART_HEADERS];
    let (consumed, headers) = match httparse::parse_headers(part, &mut headers) {
        Ok(httparse::Status::Complete(parsed)) => parsed,
        _ => return None,
    };

    let disposition = headers
        .iter()
        .find(|h| h.name.eq_ignore_ascii_case("content-disposition"))
        .and_then(|h| std::str::from_utf8(h.value).ok())?;

    let mut name = None;
    for param in disposition.split(';').skip(1) {
        let Some((key, value)) = param.trim().split_once('=') else {
            continue;
        };
        let value = value.trim_matches('"');
        match key.trim().to_ascii_lowercase().as_str() {
            "name" => name = Some(value.to_string()),
            "filename" => return None,
            _ => {}
        }
    }

    let value = String::from_utf8_lossy(&part[consumed..]).into_owned();
    Some((name?, value))
}

fn strip_crlf(part: &[u8]) -> &[u8] {
    part.strip_suffix(b"\r\n").unwrap_or(part)
}

fn find(haystack: &[u8], needle: &[u8], from: usize) -> Option<usize> {
    if from > haystack.len() {
        return None;
    }
    haystack[from..]
        .windows(needle.len())
        .position(|w| w == needle)
        .map(|i| i + from)
}
