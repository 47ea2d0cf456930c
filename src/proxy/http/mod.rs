//! HTTP/1.x framing helpers used by the workers: request head detection and
//! parsing on the client side, status capture on the upstream side.

pub mod codec;

pub use codec::{
    Http1HeaderLine, Http1RequestHead, ParseError, canned_response, is_request_head_complete,
    is_status_line_received, parse_request, parse_status_code,
};
