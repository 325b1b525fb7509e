use crate::http::request::{Method, Request};

/// Errors that can occur while parsing a request head.
#[derive(Debug)]
pub enum ParseError {
    /// The request line is malformed
    InvalidRequest,
    /// The HTTP method is not recognized
    InvalidMethod,
    /// A header line is malformed
    InvalidHeader,
    /// Content-Length header value is not a valid number
    InvalidContentLength,
    /// The headers exceed the accepted size
    TooLarge,
}

/// Result of feeding bytes to the parser.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ParseOutcome {
    /// The request head is complete and the request has been populated.
    Complete,
    /// The input is not valid HTTP.
    Invalid,
    /// More bytes are needed.
    Partial,
}

/// Maximum accepted size of a request head (request line + headers).
const MAX_HEADER_BYTES: usize = 64 * 1024;

/// Incremental HTTP/1.1 request-head parser.
///
/// Bytes are fed across successive reads; input that does not yet contain
/// the blank-line terminator is held internally and the parser reports
/// [`ParseOutcome::Partial`]. Once the terminator arrives the head is parsed
/// in one pass into the caller's [`Request`]. Body bytes are never consumed
/// here; `parse` reports how far into the input it went and the caller keeps
/// the rest.
pub struct RequestParser {
    held: Vec<u8>,
}

impl RequestParser {
    pub fn new() -> Self {
        Self { held: Vec::new() }
    }

    /// Forgets any partial head, ready for the next request on a reused
    /// connection.
    pub fn reset(&mut self) {
        self.held.clear();
    }

    /// Feeds `input` to the parser.
    ///
    /// Returns the outcome and the number of bytes of `input` consumed. On
    /// [`ParseOutcome::Complete`] the consumed count stops right after the
    /// head terminator; any body bytes remain with the caller.
    pub fn parse(&mut self, request: &mut Request, input: &[u8]) -> (ParseOutcome, usize) {
        // The terminator may straddle the previous read, so the search
        // restarts a few bytes before the old tail.
        let search_from = self.held.len().saturating_sub(3);
        self.held.extend_from_slice(input);

        match find_terminator(&self.held, search_from) {
            Some(end) => {
                let consumed = input.len() - (self.held.len() - end);
                let outcome = match parse_head(&self.held[..end], request) {
                    Ok(()) => ParseOutcome::Complete,
                    Err(err) => {
                        tracing::debug!(error = ?err, "rejecting request head");
                        ParseOutcome::Invalid
                    }
                };
                self.held.clear();
                (outcome, consumed)
            }
            None if self.held.len() > MAX_HEADER_BYTES => {
                tracing::debug!(error = ?ParseError::TooLarge, "rejecting request head");
                self.held.clear();
                (ParseOutcome::Invalid, input.len())
            }
            None => (ParseOutcome::Partial, input.len()),
        }
    }
}

impl Default for RequestParser {
    fn default() -> Self {
        Self::new()
    }
}

/// Returns the index just past the `\r\n\r\n` head terminator.
fn find_terminator(buf: &[u8], from: usize) -> Option<usize> {
    buf[from..]
        .windows(4)
        .position(|w| w == b"\r\n\r\n")
        .map(|pos| from + pos + 4)
}

/// Parses a complete request head (everything before the blank line).
fn parse_head(head: &[u8], request: &mut Request) -> Result<(), ParseError> {
    let head = std::str::from_utf8(head).map_err(|_| ParseError::InvalidRequest)?;

    let mut lines = head.split("\r\n");

    let request_line = lines.next().ok_or(ParseError::InvalidRequest)?;
    let mut parts = request_line.split_whitespace();

    let method = parts.next().ok_or(ParseError::InvalidRequest)?;
    let path = parts.next().ok_or(ParseError::InvalidRequest)?;
    let version = parts.next().ok_or(ParseError::InvalidRequest)?;

    if parts.next().is_some() || !version.starts_with("HTTP/") {
        return Err(ParseError::InvalidRequest);
    }

    request.method = Method::from_str(method).ok_or(ParseError::InvalidMethod)?;
    request.path = path.to_string();
    request.version = version.to_string();
    request.headers.clear();

    for line in lines {
        if line.is_empty() {
            continue;
        }

        let (key, value) = line.split_once(':').ok_or(ParseError::InvalidHeader)?;

        request
            .headers
            .insert(key.trim().to_string(), value.trim().to_string());
    }

    if let Some(value) = request.headers.get("Content-Length") {
        value
            .parse::<u64>()
            .map_err(|_| ParseError::InvalidContentLength)?;
    }

    Ok(())
}
