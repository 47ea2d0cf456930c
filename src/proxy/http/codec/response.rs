use http::StatusCode;

/// True once the first line of the response has been buffered.
pub fn is_status_line_received(buf: &[u8]) -> bool {
    buf.contains(&b'\n')
}

/// Extract the status code from a buffered response prefix.
///
/// Returns `None` while the status line is incomplete and when it cannot be
/// interpreted; callers treat both as "not known yet".
pub fn parse_status_code(buf: &[u8]) -> Option<StatusCode> {
    let end = buf.iter().position(|byte| *byte == b'\n')?;
    let line = &buf[..end];
    let line = line.strip_suffix(b"\r").unwrap_or(line);
    let line = std::str::from_utf8(line).ok()?;

    let mut parts = line.splitn(3, ' ');
    let version = parts.next()?;
    if !version.starts_with("HTTP/1.") {
        return None;
    }
    let code = parts.next()?;
    if code.len() != 3 {
        return None;
    }
    StatusCode::from_bytes(code.as_bytes()).ok()
}

/// A complete, self-contained response for conditions the proxy answers itself.
pub fn canned_response(status: StatusCode) -> Vec<u8> {
    let reason = status.canonical_reason().unwrap_or("Unknown");
    let body = format!("{} {}\n", status.as_u16(), reason);
    let header = format!(
        "HTTP/1.1 {} {}\r\nContent-Type: text/plain\r\nContent-Length: {}\r\nConnection: close\r\n\r\n",
        status.as_u16(),
        reason,
        body.len()
    );
    let mut response = header.into_bytes();
    response.extend_from_slice(body.as_bytes());
    response
}
