//! Canned responses and wire formatting.

use bytes::Bytes;

use crate::http::response::{Response, ResponseBuilder, StatusCode};

const HTTP_VERSION: &str = "HTTP/1.1";

/// Builds a canned response for the given status, with a minimal HTML body.
pub fn reply(status: StatusCode) -> Response {
    let body = match status {
        StatusCode::Ok | StatusCode::Created | StatusCode::NoContent => Vec::new(),
        _ => format!(
            "<html><head><title>{code} {reason}</title></head>\
             <body><h1>{code} {reason}</h1></body></html>",
            code = status.as_u16(),
            reason = status.reason_phrase(),
        )
        .into_bytes(),
    };

    let mut builder = ResponseBuilder::new(status);
    if !body.is_empty() {
        builder = builder.header("Content-Type", "text/html");
    }
    builder.body(body).build()
}

/// Formats the status line and headers of `response` into one owned buffer
/// and returns it together with `body` as the ordered byte ranges of a
/// single outbound unit.
///
/// The returned buffers own their storage, so the response object itself is
/// free to go away before the write completes.
pub fn to_buffers(response: &Response, body: Bytes) -> Vec<Bytes> {
    let mut head = Vec::with_capacity(256);

    head.extend_from_slice(HTTP_VERSION.as_bytes());
    head.push(b' ');
    head.extend_from_slice(response.status.as_u16().to_string().as_bytes());
    head.push(b' ');
    head.extend_from_slice(response.status.reason_phrase().as_bytes());
    head.extend_from_slice(b"\r\n");

    for (key, value) in &response.headers {
        head.extend_from_slice(key.as_bytes());
        head.extend_from_slice(b": ");
        head.extend_from_slice(value.as_bytes());
        head.extend_from_slice(b"\r\n");
    }

    head.extend_from_slice(b"\r\n");

    let mut buffers = vec![Bytes::from(head)];
    if !body.is_empty() {
        buffers.push(body);
    }
    buffers
}
