use std::net::SocketAddr;

use http::{Method, Uri};

use crate::logging::AccessLogBuilder;
use crate::proxy::cache::ResourceKey;
use crate::proxy::headers::{HeaderDisposition, classify_request_header, connection_tokens};
use crate::proxy::http::{Http1HeaderLine, Http1RequestHead, ParseError};

const HTTP_DEFAULT_PORT: u16 = 80;

/// A client request that passed validation and can be forwarded to its origin.
#[derive(Debug, Clone)]
pub struct ProxyRequest {
    pub method: Method,
    /// Lower-cased host without IPv6 brackets.
    pub host: String,
    pub port: u16,
    /// Origin-form path and query, never empty.
    pub path: String,
    /// End-to-end headers to pass through, in arrival order.
    pub headers: Vec<Http1HeaderLine>,
}

impl ProxyRequest {
    /// Validate a parsed head and extract what the upstream needs.
    ///
    /// Only absolute-form `http://` targets are proxied. Requests carrying a
    /// body are refused because they cannot share a cached response.
    pub fn from_head(head: &Http1RequestHead) -> Result<Self, ParseError> {
        if head.method == Method::CONNECT {
            return Err(ParseError::unsupported("CONNECT tunnels are not supported"));
        }

        let uri: Uri = head
            .target
            .parse()
            .map_err(|_| ParseError::malformed(format!("invalid request target '{}'", head.target)))?;
        let scheme = uri
            .scheme_str()
            .ok_or_else(|| ParseError::malformed("request target must be absolute-form"))?;
        if !scheme.eq_ignore_ascii_case("http") {
            return Err(ParseError::unsupported(format!("scheme '{scheme}'")));
        }
        let authority = uri
            .authority()
            .map(|auth| auth.as_str())
            .ok_or_else(|| ParseError::malformed("request target missing authority"))?;
        let (host, port) = parse_authority(authority)?;

        let path = match uri.path_and_query().map(|pq| pq.as_str()) {
            None | Some("") => "/".to_string(),
            Some(pq) if pq.starts_with('?') => format!("/{pq}"),
            Some(pq) => pq.to_string(),
        };

        let nominated = connection_tokens(
            head.headers
                .iter()
                .filter(|header| header.lower_name() == "connection")
                .map(|header| header.value.as_str()),
        );

        let mut headers = Vec::with_capacity(head.headers.len());
        for header in &head.headers {
            match classify_request_header(header.lower_name()) {
                HeaderDisposition::Body => {
                    if header.lower_name() == "content-length" && header.value.trim() == "0" {
                        continue;
                    }
                    return Err(ParseError::unsupported("request bodies are not proxied"));
                }
                HeaderDisposition::Forward if !nominated.contains(header.lower_name()) => {
                    headers.push(header.clone());
                }
                _ => {}
            }
        }

        Ok(Self {
            method: head.method.clone(),
            host,
            port: port.unwrap_or(HTTP_DEFAULT_PORT),
            path,
            headers,
        })
    }

    /// `host[:port]` as it appears in the `Host` header, default port elided.
    pub fn authority_host(&self) -> String {
        let mut host = if self.host.contains(':') {
            format!("[{}]", self.host)
        } else {
            self.host.clone()
        };
        if self.port != HTTP_DEFAULT_PORT {
            host.push(':');
            host.push_str(&self.port.to_string());
        }
        host
    }

    /// Normalized absolute URI: lower-cased scheme and host, default port elided.
    pub fn cache_uri(&self) -> String {
        format!("http://{}{}", self.authority_host(), self.path)
    }

    pub fn resource_key(&self) -> ResourceKey {
        ResourceKey::new(&self.method, &self.cache_uri())
    }

    /// Serialize the request forwarded to the origin.
    ///
    /// The upstream is asked to close after the response so that end of
    /// response and end of stream coincide.
    pub fn encode_upstream(&self) -> Vec<u8> {
        let mut buffer = Vec::with_capacity(256);
        buffer.extend_from_slice(self.method.as_str().as_bytes());
        buffer.extend_from_slice(b" ");
        buffer.extend_from_slice(self.path.as_bytes());
        buffer.extend_from_slice(b" HTTP/1.1\r\n");

        buffer.extend_from_slice(b"Host: ");
        buffer.extend_from_slice(self.authority_host().as_bytes());
        buffer.extend_from_slice(b"\r\n");

        for header in &self.headers {
            buffer.extend_from_slice(header.name.as_bytes());
            buffer.extend_from_slice(b": ");
            buffer.extend_from_slice(header.value.as_bytes());
            buffer.extend_from_slice(b"\r\n");
        }

        buffer.extend_from_slice(b"Connection: close\r\n\r\n");
        buffer
    }

    pub fn access_log_builder(&self, peer: SocketAddr) -> AccessLogBuilder {
        AccessLogBuilder::new(peer)
            .method(self.method.as_str())
            .host(self.authority_host())
            .path(redacted_path(&self.path))
    }
}

/// Return a path with query parameters removed for logging purposes.
pub fn redacted_path(path: &str) -> String {
    path.split('?').next().unwrap_or("/").to_string()
}

fn parse_authority(value: &str) -> Result<(String, Option<u16>), ParseError> {
    if value.is_empty() {
        return Err(ParseError::malformed("empty authority"));
    }
    if value.contains('@') {
        return Err(ParseError::malformed("authority must not contain userinfo"));
    }
    let uri: Uri = format!("http://{value}")
        .parse()
        .map_err(|_| ParseError::malformed(format!("invalid authority '{value}'")))?;
    let host = uri
        .host()
        .filter(|host| !host.is_empty())
        .ok_or_else(|| ParseError::malformed("authority missing hostname"))?
        .trim_start_matches('[')
        .trim_end_matches(']')
        .to_ascii_lowercase();
    Ok((host, uri.port_u16()))
}
