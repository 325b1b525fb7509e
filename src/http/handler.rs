//! The application-facing request handler contract.

use std::io;

use crate::http::connection::Reply;
use crate::http::request::Request;

/// Callback invoked once an outbound buffer has been fully accepted by the
/// socket, or failed. Callbacks fire in the order their buffers were queued.
pub type WriteCompletion = Box<dyn FnOnce(io::Result<()>) + Send + 'static>;

/// A request processor supplied by the application.
///
/// For each request the connection calls, in order and never concurrently:
///
/// 1. [`initialize`](Handler::initialize) - exactly once, before anything else
/// 2. [`on_headers`](Handler::on_headers) - exactly once
/// 3. [`on_data`](Handler::on_data) - zero or more times with body bytes
/// 4. [`on_close`](Handler::on_close) - exactly once; no calls follow it
///
/// The handler drives the response through the [`Reply`] handle it received
/// in `initialize`, and signals completion with [`Reply::close`].
pub trait Handler: Send {
    /// Hands the handler its reply handle. Called before any other method.
    fn initialize(&mut self, reply: Reply);

    /// Delivers the parsed request head.
    fn on_headers(&mut self, request: Request);

    /// Delivers a slice of body bytes; returns how many were consumed.
    ///
    /// Returning less than `data.len()` declares backpressure: the
    /// connection parks the rest and stops reading until the handler calls
    /// [`Reply::want_more`].
    fn on_data(&mut self, data: &[u8]) -> usize;

    /// Final callback: the body is fully delivered (`err` is `None`) or the
    /// exchange failed (`err` describes why).
    fn on_close(&mut self, err: Option<&io::Error>);
}

/// Produces a fresh [`Handler`] for each dispatched request.
pub trait HandlerFactory: Send + Sync {
    fn create(&self) -> Box<dyn Handler>;
}

impl<F> HandlerFactory for F
where
    F: Fn() -> Box<dyn Handler> + Send + Sync,
{
    fn create(&self) -> Box<dyn Handler> {
        self()
    }
}
