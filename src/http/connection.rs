use std::io;
use std::mem;
use std::ops::Range;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicU16, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;

use bytes::Bytes;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, ReadHalf};
use tokio::sync::mpsc::{self, UnboundedReceiver, UnboundedSender};
use tokio::task::JoinHandle;

use crate::http::handler::{Handler, WriteCompletion};
use crate::http::outbound::{self, CloseMode, OutboundQueue, SendItem};
use crate::http::parser::{ParseOutcome, RequestParser};
use crate::http::request::Request;
use crate::http::response::{Response, StatusCode};
use crate::http::stock;
use crate::server::context::ServerContext;

/// Composable connection state. The individual bits are orthogonal:
/// draining a body after the handler already replied and waiting for the
/// first byte of a fresh request are independent concerns, so they must not
/// be collapsed into one enum.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct ConnState(u8);

impl ConnState {
    /// Feeding bytes to the header parser.
    const READ_HEADERS: u8 = 0x01;
    /// Headers complete, streaming body bytes to the handler.
    const READ_DATA: u8 = 0x02;
    /// The handler replied while body bytes were still outstanding; the
    /// body must be drained before the socket is reused.
    const REQUEST_PROCESSED: u8 = 0x04;
    /// No byte of the current request has arrived yet. Gates access-log
    /// timing and suppresses the log line for idle connections.
    const WAITING_FOR_FIRST_DATA: u8 = 0x08;

    fn fresh() -> Self {
        ConnState(Self::READ_HEADERS | Self::WAITING_FOR_FIRST_DATA)
    }

    /// Headers and body are both done; only the handler's reply is pending.
    fn processing_request() -> Self {
        ConnState(0)
    }

    fn is_processing_request(&self) -> bool {
        self.0 == 0
    }

    fn contains(&self, bit: u8) -> bool {
        self.0 & bit != 0
    }

    fn insert(&mut self, bit: u8) {
        self.0 |= bit;
    }

    fn remove(&mut self, bit: u8) {
        self.0 &= !bit;
    }
}

/// Control events posted onto the connection driver. Handler-originated
/// calls (`want_more`, `close`) travel this way instead of acting directly,
/// which serializes them with read and write completions.
pub(crate) enum Event {
    WantMore,
    Close(Option<io::Error>),
    WriteFailed(io::Error),
}

/// State shared between the driver task, the writer task, and every `Reply`
/// handle the handler holds.
pub(crate) struct ReplyShared {
    pub(crate) queue: OutboundQueue,
    pub(crate) events: UnboundedSender<Event>,
    pub(crate) status: AtomicU16,
    pub(crate) keep_alive: AtomicBool,
    pub(crate) sent: AtomicU64,
}

/// The reply surface the connection presents to its handler.
///
/// Cloneable and sendable, so a handler may drive its response from spawned
/// tasks. `close` and `want_more` are deferred onto the connection's event
/// loop and are therefore safe to call from inside handler callbacks.
#[derive(Clone)]
pub struct Reply {
    shared: Arc<ReplyShared>,
}

impl Reply {
    /// Queues the response status line and headers, optionally followed by
    /// initial body bytes. On a keep-alive exchange a `Connection:
    /// Keep-Alive` header is injected.
    pub fn send_headers(
        &self,
        mut response: Response,
        body: Bytes,
        done: Option<WriteCompletion>,
    ) {
        self.shared
            .status
            .store(response.status.as_u16(), Ordering::Relaxed);
        if self.shared.keep_alive.load(Ordering::Relaxed) {
            response
                .headers
                .insert("Connection".to_string(), "Keep-Alive".to_string());
        }
        self.shared
            .queue
            .push(SendItem::new(stock::to_buffers(&response, body), done));
    }

    /// Queues more body bytes.
    pub fn send_data(&self, body: Bytes, done: Option<WriteCompletion>) {
        self.shared.queue.push(SendItem::new(vec![body], done));
    }

    /// Signals that the handler is finished with this request. A `Some`
    /// error marks a handler-side failure that terminates the connection.
    pub fn close(&self, err: Option<io::Error>) {
        let _ = self.shared.events.send(Event::Close(err));
    }

    /// Resumes body delivery after an `on_data` call that consumed less
    /// than it was offered.
    pub fn want_more(&self) {
        let _ = self.shared.events.send(Event::WantMore);
    }
}

/// Per-request accounting for the access log.
struct AccessLog {
    start: Option<Instant>,
    method: &'static str,
    url: String,
    local: String,
    remote: String,
    received: u64,
}

enum Flow {
    Continue,
    Terminate,
}

/// A single accepted socket: reader, parser, dispatcher, and lifetime
/// anchor for one HTTP/1.1 exchange after another.
///
/// The driver task owns the read half and all request state; a companion
/// writer task drains the outbound queue. Handler callbacks only ever run
/// on the driver task, so they are never invoked concurrently.
pub struct Connection<S> {
    read: ReadHalf<S>,
    shared: Arc<ReplyShared>,
    events_tx: UnboundedSender<Event>,
    events: UnboundedReceiver<Event>,
    ctx: Arc<ServerContext>,
    buffer: Vec<u8>,
    unprocessed: Range<usize>,
    read_armed: bool,
    state: ConnState,
    parser: RequestParser,
    request: Request,
    handler: Option<Box<dyn Handler>>,
    content_length: u64,
    keep_alive: bool,
    access: AccessLog,
}

impl<S> Connection<S>
where
    S: AsyncRead + AsyncWrite + Send + 'static,
{
    /// Splits the socket, starts the writer task, and spawns the connection
    /// driver. The returned handle resolves once the connection is over.
    ///
    /// `local` and `remote` are the endpoint names used in the access log.
    pub fn spawn(
        socket: S,
        local: String,
        remote: String,
        ctx: Arc<ServerContext>,
        buffer_size: usize,
    ) -> JoinHandle<()> {
        let (read, write) = tokio::io::split(socket);
        let (events_tx, events) = mpsc::unbounded_channel();
        let shared = Arc::new(ReplyShared {
            queue: OutboundQueue::new(),
            events: events_tx.clone(),
            status: AtomicU16::new(0),
            keep_alive: AtomicBool::new(false),
            sent: AtomicU64::new(0),
        });
        tokio::spawn(outbound::write_loop(write, shared.clone()));

        ctx.note_opened();
        let conn = Connection {
            read,
            shared,
            events_tx,
            events,
            ctx,
            buffer: vec![0u8; buffer_size],
            unprocessed: 0..0,
            read_armed: true,
            state: ConnState::fresh(),
            parser: RequestParser::new(),
            request: Request::default(),
            handler: None,
            content_length: 0,
            keep_alive: false,
            access: AccessLog {
                start: None,
                method: "",
                url: String::new(),
                local,
                remote,
                received: 0,
            },
        };
        tokio::spawn(conn.run())
    }

    /// Drives the connection until the exchange is over. At most one read
    /// is ever in flight; it races only against control events.
    async fn run(mut self) {
        tracing::debug!(remote = %self.access.remote, "connection opened");

        loop {
            let flow = if self.read_armed {
                tokio::select! {
                    result = self.read.read(&mut self.buffer) => {
                        self.read_armed = false;
                        self.handle_read(result)
                    }
                    event = self.events.recv() => self.handle_event(event).await,
                }
            } else {
                let event = self.events.recv().await;
                self.handle_event(event).await
            };

            if matches!(flow, Flow::Terminate) {
                break;
            }
        }
    }

    async fn handle_event(&mut self, event: Option<Event>) -> Flow {
        match event {
            Some(Event::WantMore) => self.want_more_impl(),
            Some(Event::Close(err)) => self.close_impl(err).await,
            Some(Event::WriteFailed(err)) => self.write_failed(err).await,
            // Every sender is gone; nothing can reach this connection.
            None => Flow::Terminate,
        }
    }

    /// The socket failed while a response was being written. The writer has
    /// already failed every queued completion and marked the status.
    async fn write_failed(&mut self, err: io::Error) -> Flow {
        if let Some(mut handler) = self.handler.take() {
            if guarded(self.ctx.safe_mode(), "connection::write_failed -> on_close", || {
                handler.on_close(Some(&err))
            })
            .is_err()
            {
                self.contain_fault();
            }
            self.ctx.note_request_done();
        }
        self.close_impl(Some(err)).await
    }

    /// Deferred completion of the current request: from the handler's
    /// `close`, from a stock reply finishing its write, or from a write
    /// failure.
    async fn close_impl(&mut self, err: Option<io::Error>) -> Flow {
        tracing::debug!(
            error = ?err,
            state = ?self.state,
            keep_alive = self.keep_alive,
            "request closing"
        );

        if self.handler.take().is_some() {
            self.ctx.note_request_done();
        }

        if let Some(err) = err {
            // 499 means the peer died on us mid-write; anything else is a
            // local failure while replying.
            if self.shared.status.load(Ordering::Relaxed) != 499 {
                self.shared.status.store(599, Ordering::Relaxed);
            }
            tracing::debug!(error = %err, "connection broken, shutting down");
            self.print_access_log();
            self.shared.queue.close(CloseMode::Abort);
            return Flow::Terminate;
        }

        // Let the response reach the socket before it is accounted.
        self.shared.queue.flush().await;

        if !self.state.is_processing_request() {
            // The reply finished before the request body did; keep reading
            // until the body has been drained off the socket.
            self.state.insert(ConnState::REQUEST_PROCESSED);
            tracing::debug!(
                remaining = self.content_length,
                "reply sent, draining the rest of the request body"
            );
            if !self.unprocessed.is_empty() {
                let range = mem::replace(&mut self.unprocessed, 0..0);
                return self.process_data(range);
            }
            self.arm_read();
            return Flow::Continue;
        }

        if !self.keep_alive {
            tracing::debug!("connection is not keep-alive, closing socket");
            self.print_access_log();
            self.shared.queue.close(CloseMode::Drain);
            return Flow::Terminate;
        }

        self.process_next()
    }
}

impl<S> Connection<S> {
    fn handle_read(&mut self, result: io::Result<usize>) -> Flow {
        match result {
            Ok(0) => self.read_failed(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                "peer closed the connection",
            )),
            Ok(n) => {
                tracing::trace!(bytes = n, state = ?self.state, "read completed");
                self.process_data(0..n)
            }
            Err(err) => self.read_failed(err),
        }
    }

    /// Peer-side read failure or EOF: account it, tell the handler, stop.
    fn read_failed(&mut self, err: io::Error) -> Flow {
        tracing::debug!(error = %err, state = ?self.state, "read failed");
        self.shared.status.store(499, Ordering::Relaxed);
        self.print_access_log();

        if let Some(mut handler) = self.handler.take() {
            if guarded(self.ctx.safe_mode(), "connection::read_failed -> on_close", || {
                handler.on_close(Some(&err))
            })
            .is_err()
            {
                self.contain_fault();
            }
            self.ctx.note_request_done();
        }

        self.shared.queue.close(CloseMode::Drain);
        Flow::Terminate
    }

    fn want_more_impl(&mut self) -> Flow {
        tracing::trace!(state = ?self.state, "handler ready for more data");
        if !self.unprocessed.is_empty() {
            let range = mem::replace(&mut self.unprocessed, 0..0);
            self.process_data(range)
        } else {
            self.arm_read();
            Flow::Continue
        }
    }

    /// The data pump. Decides, from the current state, whether bytes go to
    /// the parser or the handler, and whether another read gets armed.
    /// Header completion falls through to body processing iteratively, as
    /// does starting the next pipelined request from a buffered tail.
    fn process_data(&mut self, mut range: Range<usize>) -> Flow {
        loop {
            tracing::trace!(bytes = range.len(), state = ?self.state, "processing data");

            if self.state.contains(ConnState::READ_HEADERS) {
                if self.state.contains(ConnState::WAITING_FOR_FIRST_DATA) {
                    self.state.remove(ConnState::WAITING_FOR_FIRST_DATA);
                    self.access.start = Some(Instant::now());
                }

                let (outcome, consumed) = self
                    .parser
                    .parse(&mut self.request, &self.buffer[range.clone()]);
                self.access.received += consumed as u64;
                range.start += consumed;

                match outcome {
                    ParseOutcome::Invalid => {
                        self.keep_alive = false;
                        self.shared.keep_alive.store(false, Ordering::Relaxed);
                        self.unprocessed = 0..0;
                        self.state = ConnState::processing_request();
                        self.send_error(StatusCode::BadRequest);
                        return Flow::Continue;
                    }
                    ParseOutcome::Partial => {
                        self.arm_read();
                        return Flow::Continue;
                    }
                    ParseOutcome::Complete => {
                        self.access.method = self.request.method.as_str();
                        self.access.url = self.request.path.clone();
                        self.content_length = self.request.content_length();
                        self.keep_alive = self.request.keep_alive();
                        self.shared
                            .keep_alive
                            .store(self.keep_alive, Ordering::Relaxed);

                        match self.ctx.factory(&self.request) {
                            Some(factory) => {
                                self.ctx.note_request_started();
                                let mut handler = factory.create();
                                handler.initialize(self.reply());
                                let request = mem::take(&mut self.request);
                                match guarded(
                                    self.ctx.safe_mode(),
                                    "connection::process_data -> on_headers",
                                    || handler.on_headers(request),
                                ) {
                                    Ok(()) => self.handler = Some(handler),
                                    Err(()) => return self.handler_fault(),
                                }
                                self.state.remove(ConnState::READ_HEADERS);
                                self.state.insert(ConnState::READ_DATA);
                                // Loop on: remaining bytes belong to the body.
                            }
                            None => {
                                // No route. Reply 404 and give the socket up
                                // once the reply is out.
                                self.keep_alive = false;
                                self.shared.keep_alive.store(false, Ordering::Relaxed);
                                self.unprocessed = 0..0;
                                self.state = ConnState::processing_request();
                                self.send_error(StatusCode::NotFound);
                                return Flow::Continue;
                            }
                        }
                    }
                }
            } else if self.state.contains(ConnState::READ_DATA) {
                let available = range.len() as u64;
                let offered = self.content_length.min(available) as usize;
                let mut consumed = offered;

                if offered > 0 {
                    // During a post-reply drain the handler is gone and the
                    // bytes fall into a silent sink.
                    if let Some(mut handler) = self.handler.take() {
                        let data = &self.buffer[range.start..range.start + offered];
                        match guarded(
                            self.ctx.safe_mode(),
                            "connection::process_data -> on_data",
                            || handler.on_data(data),
                        ) {
                            Ok(n) => {
                                consumed = n.min(offered);
                                self.handler = Some(handler);
                            }
                            Err(()) => return self.handler_fault(),
                        }
                    }
                }

                self.content_length -= consumed as u64;
                self.access.received += consumed as u64;

                if consumed < offered {
                    tracing::debug!(consumed, offered, "handler parked, awaiting want_more");
                    self.unprocessed = range.start + consumed..range.end;
                    return Flow::Continue;
                }

                if self.content_length > 0 {
                    self.arm_read();
                    return Flow::Continue;
                }

                self.state.remove(ConnState::READ_DATA);
                self.unprocessed = range.start + consumed..range.end;

                if let Some(mut handler) = self.handler.take() {
                    match guarded(
                        self.ctx.safe_mode(),
                        "connection::process_data -> on_close",
                        || handler.on_close(None),
                    ) {
                        Ok(()) => self.handler = Some(handler),
                        Err(()) => return self.handler_fault(),
                    }
                }

                if self.state.contains(ConnState::REQUEST_PROCESSED) {
                    // The handler had already replied; move straight on to
                    // the next request with whatever is buffered.
                    self.start_next_request();
                    if !self.unprocessed.is_empty() {
                        range = mem::replace(&mut self.unprocessed, 0..0);
                        continue;
                    }
                    self.arm_read();
                }
                return Flow::Continue;
            } else {
                return Flow::Continue;
            }
        }
    }

    /// Finishes the current request's accounting and resets the state for
    /// the next request on the same socket.
    fn start_next_request(&mut self) {
        self.print_access_log();

        self.state = ConnState::fresh();
        self.access.method = "";
        self.access.url.clear();
        self.access.start = None;
        self.access.received = 0;
        self.shared.status.store(0, Ordering::Relaxed);
        self.shared.sent.store(0, Ordering::Relaxed);
        self.content_length = 0;
        self.parser.reset();
        self.request = Request::default();
    }

    fn process_next(&mut self) -> Flow {
        self.start_next_request();
        tracing::debug!(buffered = self.unprocessed.len(), "awaiting next request");
        if !self.unprocessed.is_empty() {
            let range = mem::replace(&mut self.unprocessed, 0..0);
            self.process_data(range)
        } else {
            self.arm_read();
            Flow::Continue
        }
    }

    /// Accounts a contained handler panic: status 598 and an access line.
    fn contain_fault(&mut self) {
        self.shared.status.store(598, Ordering::Relaxed);
        self.print_access_log();
    }

    /// A handler callback panicked under safe mode at a point where the
    /// connection cannot carry on: account it, drop whatever is queued and
    /// give the socket up. The handler itself is already gone.
    fn handler_fault(&mut self) -> Flow {
        self.contain_fault();
        self.ctx.note_request_done();
        self.shared.queue.close(CloseMode::Abort);
        Flow::Terminate
    }

    /// Arms the next socket read. The read buffer is recycled from the
    /// start, so this must only happen once everything in it is handed off.
    fn arm_read(&mut self) {
        self.unprocessed = 0..0;
        self.read_armed = true;
    }

    fn reply(&self) -> Reply {
        Reply {
            shared: self.shared.clone(),
        }
    }

    /// Queues a stock reply and schedules request completion for when it
    /// has been fully written.
    fn send_error(&mut self, status: StatusCode) {
        tracing::debug!(status = status.as_u16(), state = ?self.state, "sending stock reply");
        let mut response = stock::reply(status);
        let body = response.take_body();
        let events = self.events_tx.clone();
        let done: WriteCompletion = Box::new(move |result| {
            // A failed write surfaces through the writer's own error path.
            if result.is_ok() {
                let _ = events.send(Event::Close(None));
            }
        });
        self.reply().send_headers(response, body, Some(done));
    }

    /// Emits the access-log line for the current request. A connection that
    /// never received a byte of the request stays silent.
    fn print_access_log(&self) {
        if self.state.contains(ConnState::WAITING_FOR_FIRST_DATA) {
            return;
        }

        let method = if self.access.method.is_empty() {
            "-"
        } else {
            self.access.method
        };
        let url = if self.access.url.is_empty() {
            "-"
        } else {
            self.access.url.as_str()
        };
        let time_us = self
            .access
            .start
            .map(|start| start.elapsed().as_micros() as u64)
            .unwrap_or(0);

        tracing::info!(
            target: "access",
            method,
            url,
            local = %self.access.local,
            remote = %self.access.remote,
            status = self.shared.status.load(Ordering::Relaxed),
            received = self.access.received,
            sent = self.shared.sent.load(Ordering::Relaxed),
            time_us,
            "access"
        );
    }
}

impl<S> Drop for Connection<S> {
    fn drop(&mut self) {
        tracing::debug!(remote = %self.access.remote, "connection closed");
        self.shared.queue.close(CloseMode::Drain);

        if let Some(mut handler) = self.handler.take() {
            // Torn down with a live handler, e.g. the server went away
            // mid-request. The handler still gets its on_close.
            self.shared.status.store(597, Ordering::Relaxed);
            self.print_access_log();
            let _ = guarded(self.ctx.safe_mode(), "connection::drop -> on_close", || {
                handler.on_close(None)
            });
            self.ctx.note_request_done();
        }

        self.ctx.note_closed();
    }
}

/// Runs a handler callback, containing a panic when safe mode is on: the
/// caller applies the site-specific recovery on `Err`. With safe mode off a
/// handler panic takes the whole process down, not just this connection's
/// task (which tokio would otherwise swallow at the task boundary).
fn guarded<R>(safe_mode: bool, site: &'static str, f: impl FnOnce() -> R) -> Result<R, ()> {
    match panic::catch_unwind(AssertUnwindSafe(f)) {
        Ok(value) => Ok(value),
        Err(payload) => {
            tracing::error!(
                site,
                panic = %panic_message(payload.as_ref()),
                "handler panicked"
            );
            if safe_mode {
                Err(())
            } else {
                std::process::abort()
            }
        }
    }
}

fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    payload
        .downcast_ref::<&str>()
        .map(ToString::to_string)
        .or_else(|| payload.downcast_ref::<String>().cloned())
        .unwrap_or_else(|| "unknown panic".to_string())
}
