use std::collections::HashSet;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HeaderDisposition {
    Connection,
    Host,
    Body,
    Skip,
    Forward,
}

/// Returns true when the header conveys forwarding metadata that should be stripped.
pub fn is_forwarding_header(name: &str) -> bool {
    if name.starts_with("x-forwarded-") {
        return true;
    }
    matches!(
        name,
        "forwarded"
            | "via"
            | "x-real-ip"
            | "x-client-ip"
            | "true-client-ip"
            | "cf-connecting-ip"
    ) || name.ends_with("-client-ip")
}

/// Classify a lower-cased request header name for the upstream request.
pub fn classify_request_header(name: &str) -> HeaderDisposition {
    match name {
        "connection" => HeaderDisposition::Connection,
        "host" => HeaderDisposition::Host,
        "content-length" | "transfer-encoding" => HeaderDisposition::Body,
        _ if name.starts_with("proxy-")
            || matches!(name, "keep-alive" | "upgrade" | "te" | "trailer")
            || is_forwarding_header(name) =>
        {
            HeaderDisposition::Skip
        }
        _ => HeaderDisposition::Forward,
    }
}

/// Lower-cased header names listed in a `Connection` header value.
pub fn connection_tokens<'a>(values: impl IntoIterator<Item = &'a str>) -> HashSet<String> {
    values
        .into_iter()
        .flat_map(|value| value.split(','))
        .map(|token| token.trim().to_ascii_lowercase())
        .filter(|token| !token.is_empty())
        .collect()
}
