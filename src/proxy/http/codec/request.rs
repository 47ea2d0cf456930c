use http::{Method, Version};

use super::ParseError;
use super::headers::Http1HeaderLine;

#[derive(Debug)]
pub struct Http1RequestHead {
    pub method: Method,
    pub target: String,
    pub version: Version,
    pub headers: Vec<Http1HeaderLine>,
    /// Bytes consumed by the head, terminator included.
    pub head_len: usize,
}

impl Http1RequestHead {
    pub fn header(&self, lower_name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|header| header.lower_name() == lower_name)
            .map(|header| header.value.as_str())
    }
}

/// True once the buffer holds a request line, headers and the blank line.
pub fn is_request_head_complete(buf: &[u8]) -> bool {
    find_head_end(buf).is_some()
}

/// Offset just past the blank line that ends the head, accepting bare LF.
pub(crate) fn find_head_end(buf: &[u8]) -> Option<usize> {
    let mut line_start = 0usize;
    for (idx, byte) in buf.iter().enumerate() {
        if *byte != b'\n' {
            continue;
        }
        let line = &buf[line_start..idx];
        let line = line.strip_suffix(b"\r").unwrap_or(line);
        if line.is_empty() && line_start > 0 {
            return Some(idx + 1);
        }
        line_start = idx + 1;
    }
    None
}

pub fn parse_request(buf: &[u8], max_header_bytes: usize) -> Result<Http1RequestHead, ParseError> {
    let head_len = match find_head_end(buf) {
        Some(len) => len,
        None if buf.len() > max_header_bytes => {
            return Err(ParseError::TooLarge {
                limit: max_header_bytes,
            });
        }
        None => return Err(ParseError::malformed("incomplete request head")),
    };
    if head_len > max_header_bytes {
        return Err(ParseError::TooLarge {
            limit: max_header_bytes,
        });
    }

    let head = std::str::from_utf8(&buf[..head_len])
        .map_err(|_| ParseError::malformed("request head contained invalid bytes"))?;
    let mut lines = head
        .split('\n')
        .map(|line| line.strip_suffix('\r').unwrap_or(line));

    let request_line = lines
        .next()
        .filter(|line| !line.is_empty())
        .ok_or_else(|| ParseError::malformed("empty request line"))?;

    let mut parts = request_line.split_whitespace();
    let method_str = parts
        .next()
        .ok_or_else(|| ParseError::malformed("missing method"))?;
    let target = parts
        .next()
        .ok_or_else(|| ParseError::malformed("missing target"))?;
    let version = parts
        .next()
        .ok_or_else(|| ParseError::malformed("missing version"))?;
    if parts.next().is_some() {
        return Err(ParseError::malformed("unexpected data in request line"));
    }
    let version = match version {
        "HTTP/1.1" => Version::HTTP_11,
        "HTTP/1.0" => Version::HTTP_10,
        other => return Err(ParseError::unsupported(format!("HTTP version '{other}'"))),
    };
    let method = Method::from_bytes(method_str.as_bytes())
        .map_err(|_| ParseError::malformed(format!("invalid method '{method_str}'")))?;

    let mut headers = Vec::new();
    for line in lines {
        if line.is_empty() {
            break;
        }
        if line.starts_with([' ', '\t']) {
            return Err(ParseError::malformed("obsolete header line folding"));
        }
        headers.push(Http1HeaderLine::parse(line)?);
    }

    Ok(Http1RequestHead {
        method,
        target: target.to_string(),
        version,
        headers,
        head_len,
    })
}
