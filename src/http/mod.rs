//! HTTP protocol implementation.
//!
//! This module implements the per-connection HTTP/1.1 server core with
//! support for keep-alive connections, streamed request bodies, and
//! backpressure from slow handlers.
//!
//! # Architecture
//!
//! The HTTP layer is organized into several submodules:
//!
//! - **`connection`**: The connection driver: read orchestration, request
//!   dispatch, keep-alive reuse, access logging, and the `Reply` handle
//!   handlers answer through
//! - **`outbound`**: The ordered outbound write queue with gather-writes
//! - **`parser`**: Incremental parsing of request heads from byte buffers
//! - **`handler`**: The contract between the connection and application
//!   handlers
//! - **`request`** / **`response`**: HTTP message representations
//! - **`stock`**: Canned error replies and wire formatting
//!
//! # Connection state machine
//!
//! Each connection carries a small set of orthogonal state bits:
//!
//! ```text
//!   READ_HEADERS ──(head complete)──▶ READ_DATA ──(body delivered)──▶ (processing)
//!        ▲                                                               │
//!        │                         handler closes, body already drained  │
//!        └───────────────(keep-alive: reset to READ_HEADERS)─────────────┘
//! ```
//!
//! A handler that replies before the body has fully arrived flips the
//! connection into a drain mode: the remaining body bytes are read off the
//! socket and discarded before the next request starts or the socket
//! closes.
//!
//! # Example
//!
//! ```ignore
//! use palisade::http::{Handler, Reply};
//! use palisade::http::request::Request;
//! use palisade::http::response::{ResponseBuilder, StatusCode};
//! use palisade::server::ServerContext;
//!
//! #[derive(Default)]
//! struct Pong {
//!     reply: Option<Reply>,
//! }
//!
//! impl Handler for Pong {
//!     fn initialize(&mut self, reply: Reply) {
//!         self.reply = Some(reply);
//!     }
//!
//!     fn on_headers(&mut self, _request: Request) {
//!         let reply = self.reply.as_ref().unwrap();
//!         let mut response = ResponseBuilder::new(StatusCode::Ok)
//!             .body(b"pong".to_vec())
//!             .build();
//!         let body = response.take_body();
//!         reply.send_headers(response, body, None);
//!         reply.close(None);
//!     }
//!
//!     fn on_data(&mut self, data: &[u8]) -> usize {
//!         data.len()
//!     }
//!
//!     fn on_close(&mut self, _err: Option<&std::io::Error>) {}
//! }
//!
//! let ctx = ServerContext::builder()
//!     .route("/ping", || Box::new(Pong::default()) as Box<dyn Handler>)
//!     .build();
//! ```

pub mod connection;
pub mod handler;
pub mod parser;
pub mod request;
pub mod response;
pub mod stock;

pub(crate) mod outbound;

pub use connection::{Connection, Reply};
pub use handler::{Handler, HandlerFactory, WriteCompletion};
