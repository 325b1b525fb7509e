use std::io;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use bytes::Bytes;
use tokio::io::{AsyncReadExt, AsyncWriteExt, DuplexStream};
use tokio::time::timeout;

use palisade::http::connection::Connection;
use palisade::http::request::Request;
use palisade::http::response::{ResponseBuilder, StatusCode};
use palisade::http::{Handler, Reply};
use palisade::server::ServerContext;

/// What a test handler observed, shared with the test body.
#[derive(Default)]
struct Record {
    headers_path: Option<String>,
    /// (offered, consumed) per on_data call.
    data: Vec<(usize, usize)>,
    /// `Some(None)` = clean close, `Some(Some(msg))` = close with error.
    closed: Option<Option<String>>,
    /// (label, result) per write completion, in firing order.
    write_results: Vec<(&'static str, Result<(), String>)>,
}

type Shared = Arc<Mutex<Record>>;

fn serve(ctx: &Arc<ServerContext>, capacity: usize) -> (DuplexStream, tokio::task::JoinHandle<()>) {
    let (client, server) = tokio::io::duplex(capacity);
    let handle = Connection::spawn(
        server,
        "local".to_string(),
        "remote".to_string(),
        ctx.clone(),
        1024,
    );
    (client, handle)
}

async fn read_until(client: &mut DuplexStream, needle: &[u8]) -> Vec<u8> {
    let mut out = Vec::new();
    let mut buf = [0u8; 1024];
    loop {
        let n = timeout(Duration::from_secs(5), client.read(&mut buf))
            .await
            .expect("timed out waiting for response")
            .expect("read failed");
        assert!(n > 0, "eof before expected bytes; got {:?}", String::from_utf8_lossy(&out));
        out.extend_from_slice(&buf[..n]);
        if out.windows(needle.len()).any(|w| w == needle) {
            return out;
        }
    }
}

async fn read_to_eof(client: &mut DuplexStream) -> Vec<u8> {
    let mut out = Vec::new();
    let mut buf = [0u8; 1024];
    loop {
        let n = timeout(Duration::from_secs(5), client.read(&mut buf))
            .await
            .expect("timed out waiting for eof")
            .expect("read failed");
        if n == 0 {
            return out;
        }
        out.extend_from_slice(&buf[..n]);
    }
}

async fn wait_for(what: &str, cond: impl Fn() -> bool) {
    for _ in 0..500 {
        if cond() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("condition not reached: {}", what);
}

/// Replies with a fixed body as soon as the headers arrive, then closes.
struct OkHandler {
    reply: Option<Reply>,
    record: Shared,
    body: &'static str,
}

impl Handler for OkHandler {
    fn initialize(&mut self, reply: Reply) {
        self.reply = Some(reply);
    }

    fn on_headers(&mut self, request: Request) {
        self.record.lock().unwrap().headers_path = Some(request.path.clone());
        let reply = self.reply.as_ref().unwrap();
        let mut response = ResponseBuilder::new(StatusCode::Ok)
            .header("Content-Type", "text/plain")
            .body(self.body.as_bytes().to_vec())
            .build();
        let body = response.take_body();
        reply.send_headers(response, body, None);
        reply.close(None);
    }

    fn on_data(&mut self, data: &[u8]) -> usize {
        self.record.lock().unwrap().data.push((data.len(), data.len()));
        data.len()
    }

    fn on_close(&mut self, err: Option<&io::Error>) {
        self.record.lock().unwrap().closed = Some(err.map(|e| e.to_string()));
    }
}

fn ok_factory(
    record: Shared,
    body: &'static str,
    calls: Arc<AtomicUsize>,
) -> impl palisade::http::HandlerFactory {
    move || {
        calls.fetch_add(1, Ordering::Relaxed);
        Box::new(OkHandler {
            reply: None,
            record: record.clone(),
            body,
        }) as Box<dyn Handler>
    }
}

#[tokio::test]
async fn test_happy_get_keep_alive() {
    let record: Shared = Default::default();
    let calls = Arc::new(AtomicUsize::new(0));
    let ctx = ServerContext::builder()
        .route("/x", ok_factory(record.clone(), "ok", calls.clone()))
        .build();
    let (mut client, _handle) = serve(&ctx, 4096);

    let request = b"GET /x HTTP/1.1\r\nHost: h\r\n\r\n";
    client.write_all(request).await.unwrap();

    let text = String::from_utf8(read_until(&mut client, b"ok").await).unwrap();
    assert!(text.starts_with("HTTP/1.1 200"), "got {:?}", text);
    assert!(text.contains("Connection: Keep-Alive"));
    assert!(text.ends_with("ok"));

    assert_eq!(record.lock().unwrap().headers_path.as_deref(), Some("/x"));
    assert_eq!(record.lock().unwrap().closed, Some(None));

    // The state machine is back at the start: the same socket takes
    // another request.
    client.write_all(request).await.unwrap();
    let text = String::from_utf8(read_until(&mut client, b"ok").await).unwrap();
    assert!(text.starts_with("HTTP/1.1 200"));
    assert_eq!(calls.load(Ordering::Relaxed), 2);

    wait_for("request accounting drained", || ctx.active_requests() == 0).await;
}

/// Consumes 4 bytes of the first on_data, parks, resumes via want_more.
struct SlowConsumer {
    reply: Option<Reply>,
    record: Shared,
    parked: bool,
}

impl Handler for SlowConsumer {
    fn initialize(&mut self, reply: Reply) {
        self.reply = Some(reply);
    }

    fn on_headers(&mut self, _request: Request) {}

    fn on_data(&mut self, data: &[u8]) -> usize {
        let consumed = if !self.parked {
            self.parked = true;
            let reply = self.reply.clone().unwrap();
            tokio::spawn(async move {
                tokio::time::sleep(Duration::from_millis(20)).await;
                reply.want_more();
            });
            4.min(data.len())
        } else {
            data.len()
        };
        self.record.lock().unwrap().data.push((data.len(), consumed));
        consumed
    }

    fn on_close(&mut self, err: Option<&io::Error>) {
        self.record.lock().unwrap().closed = Some(err.map(|e| e.to_string()));
        if err.is_none() {
            let reply = self.reply.as_ref().unwrap();
            let mut response = ResponseBuilder::new(StatusCode::Ok)
                .body(b"done".to_vec())
                .build();
            let body = response.take_body();
            reply.send_headers(response, body, None);
            reply.close(None);
        }
    }
}

#[tokio::test]
async fn test_post_with_backpressure() {
    let record: Shared = Default::default();
    let ctx = ServerContext::builder()
        .route("/p", {
            let record = record.clone();
            move || {
                Box::new(SlowConsumer {
                    reply: None,
                    record: record.clone(),
                    parked: false,
                }) as Box<dyn Handler>
            }
        })
        .build();
    let (mut client, _handle) = serve(&ctx, 4096);

    client
        .write_all(b"POST /p HTTP/1.1\r\nHost: h\r\nContent-Length: 10\r\n\r\n0123456789")
        .await
        .unwrap();

    let text = String::from_utf8(read_until(&mut client, b"done").await).unwrap();
    assert!(text.starts_with("HTTP/1.1 200"));

    let rec = record.lock().unwrap();
    // The parked remainder was delivered without another socket read: the
    // second offer is exactly the six parked bytes.
    assert_eq!(rec.data, vec![(10, 4), (6, 6)]);
    assert_eq!(rec.closed, Some(None));
}

#[tokio::test]
async fn test_malformed_request_line() {
    let record: Shared = Default::default();
    let calls = Arc::new(AtomicUsize::new(0));
    let ctx = ServerContext::builder()
        .route("/x", ok_factory(record.clone(), "ok", calls.clone()))
        .build();
    let (mut client, _handle) = serve(&ctx, 4096);

    client.write_all(b"NOT-HTTP\r\n\r\n").await.unwrap();

    let text = String::from_utf8(read_to_eof(&mut client).await).unwrap();
    assert!(text.starts_with("HTTP/1.1 400"), "got {:?}", text);
    assert!(!text.contains("Keep-Alive"));
    // No handler was ever created.
    assert_eq!(calls.load(Ordering::Relaxed), 0);

    wait_for("connection accounting drained", || ctx.connections() == 0).await;
}

#[tokio::test]
async fn test_no_route_gets_404() {
    let ctx = ServerContext::builder().build();
    let (mut client, _handle) = serve(&ctx, 4096);

    client
        .write_all(b"GET /missing HTTP/1.1\r\nHost: h\r\n\r\n")
        .await
        .unwrap();

    let text = String::from_utf8(read_to_eof(&mut client).await).unwrap();
    assert!(text.starts_with("HTTP/1.1 404"), "got {:?}", text);

    wait_for("connection accounting drained", || ctx.connections() == 0).await;
}

/// Streams a large response and records every completion; never closes on
/// its own, so a write failure must reach it through on_close.
struct Streamer {
    reply: Option<Reply>,
    record: Shared,
}

impl Handler for Streamer {
    fn initialize(&mut self, reply: Reply) {
        self.reply = Some(reply);
    }

    fn on_headers(&mut self, _request: Request) {
        let reply = self.reply.as_ref().unwrap();
        let response = ResponseBuilder::new(StatusCode::Ok)
            .content_length(32 * 1024)
            .build();
        let record = self.record.clone();
        reply.send_headers(
            response,
            Bytes::new(),
            Some(Box::new(move |result| {
                record
                    .lock()
                    .unwrap()
                    .write_results
                    .push(("headers", result.map_err(|e| e.to_string())));
            })),
        );
        for label in ["chunk-1", "chunk-2"] {
            let record = self.record.clone();
            reply.send_data(
                Bytes::from(vec![b'z'; 16 * 1024]),
                Some(Box::new(move |result| {
                    record
                        .lock()
                        .unwrap()
                        .write_results
                        .push((label, result.map_err(|e| e.to_string())));
                })),
            );
        }
    }

    fn on_data(&mut self, data: &[u8]) -> usize {
        data.len()
    }

    fn on_close(&mut self, err: Option<&io::Error>) {
        self.record.lock().unwrap().closed = Some(err.map(|e| e.to_string()));
    }
}

#[tokio::test]
async fn test_write_error_mid_response() {
    let record: Shared = Default::default();
    let ctx = ServerContext::builder()
        .route("/big", {
            let record = record.clone();
            move || {
                Box::new(Streamer {
                    reply: None,
                    record: record.clone(),
                }) as Box<dyn Handler>
            }
        })
        .build();
    // A tiny pipe: the response cannot fit, so the writer blocks on us.
    let (mut client, _handle) = serve(&ctx, 64);

    client
        .write_all(b"GET /big HTTP/1.1\r\nHost: h\r\n\r\n")
        .await
        .unwrap();

    // Let the handler queue its response and the writer block on the full
    // pipe, then kill the peer.
    wait_for("handler dispatched", || ctx.active_requests() == 1).await;
    tokio::time::sleep(Duration::from_millis(50)).await;
    drop(client);

    wait_for("handler notified of failure", || {
        matches!(record.lock().unwrap().closed, Some(Some(_)))
    })
    .await;

    let rec = record.lock().unwrap();
    // Completions fired in enqueue order and everything still queued when
    // the socket died failed.
    let labels: Vec<&str> = rec.write_results.iter().map(|(l, _)| *l).collect();
    assert_eq!(labels, vec!["headers", "chunk-1", "chunk-2"]);
    assert!(rec.write_results.iter().any(|(_, r)| r.is_err()));
    assert!(rec.write_results.last().unwrap().1.is_err());
    drop(rec);

    wait_for("request accounting drained", || ctx.active_requests() == 0).await;
    wait_for("connection accounting drained", || ctx.connections() == 0).await;
}

/// Panics as soon as it sees headers.
struct Panicker;

impl Handler for Panicker {
    fn initialize(&mut self, _reply: Reply) {}

    fn on_headers(&mut self, _request: Request) {
        panic!("handler bug");
    }

    fn on_data(&mut self, data: &[u8]) -> usize {
        data.len()
    }

    fn on_close(&mut self, _err: Option<&io::Error>) {}
}

#[tokio::test]
async fn test_handler_panic_under_safe_mode() {
    let ctx = ServerContext::builder()
        .safe_mode(true)
        .route("/boom", || Box::new(Panicker) as Box<dyn Handler>)
        .build();
    let (mut client, _handle) = serve(&ctx, 4096);

    client
        .write_all(b"GET /boom HTTP/1.1\r\nHost: h\r\n\r\n")
        .await
        .unwrap();

    // No reply bytes: the socket just closes.
    let leftover = read_to_eof(&mut client).await;
    assert!(leftover.is_empty(), "got {:?}", String::from_utf8_lossy(&leftover));

    wait_for("request accounting drained", || ctx.active_requests() == 0).await;
    wait_for("connection accounting drained", || ctx.connections() == 0).await;

    // The process survived; a fresh connection still works.
    let record: Shared = Default::default();
    let calls = Arc::new(AtomicUsize::new(0));
    let ctx = ServerContext::builder()
        .safe_mode(true)
        .route("/x", ok_factory(record, "ok", calls))
        .build();
    let (mut client, _handle) = serve(&ctx, 4096);
    client
        .write_all(b"GET /x HTTP/1.1\r\nHost: h\r\n\r\n")
        .await
        .unwrap();
    let text = String::from_utf8(read_until(&mut client, b"ok").await).unwrap();
    assert!(text.starts_with("HTTP/1.1 200"));
}

#[test]
fn test_handler_panic_without_safe_mode_aborts_process() {
    // The abort can only be observed from outside. Re-run this very test
    // in a child process: the child drives the panic and dies, the parent
    // checks how it died.
    if std::env::var("PALISADE_PANIC_CHILD").is_ok() {
        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
            .unwrap();
        runtime.block_on(async {
            let ctx = ServerContext::builder()
                .route("/boom", || Box::new(Panicker) as Box<dyn Handler>)
                .build();
            let (mut client, _handle) = serve(&ctx, 4096);
            client
                .write_all(b"GET /boom HTTP/1.1\r\nHost: h\r\n\r\n")
                .await
                .unwrap();
            tokio::time::sleep(Duration::from_secs(5)).await;
        });
        unreachable!("the handler panic should have aborted the process");
    }

    let exe = std::env::current_exe().unwrap();
    let output = std::process::Command::new(exe)
        .arg("test_handler_panic_without_safe_mode_aborts_process")
        .arg("--exact")
        .arg("--nocapture")
        .env("PALISADE_PANIC_CHILD", "1")
        .output()
        .unwrap();

    assert!(
        !output.status.success(),
        "child exited cleanly: {:?}",
        output.status
    );
    #[cfg(unix)]
    {
        use std::os::unix::process::ExitStatusExt;
        // SIGABRT, not an ordinary failed test run inside the child.
        assert_eq!(
            output.status.signal(),
            Some(6),
            "child did not abort: {:?}",
            output.status
        );
    }
}

/// Replies before reading any of the body, forcing a drain.
struct EarlyCloser {
    reply: Option<Reply>,
    record: Shared,
}

impl Handler for EarlyCloser {
    fn initialize(&mut self, reply: Reply) {
        self.reply = Some(reply);
    }

    fn on_headers(&mut self, _request: Request) {
        let reply = self.reply.as_ref().unwrap();
        let mut response = ResponseBuilder::new(StatusCode::Ok)
            .body(b"early".to_vec())
            .build();
        let body = response.take_body();
        reply.send_headers(response, body, None);
        reply.close(None);
    }

    fn on_data(&mut self, data: &[u8]) -> usize {
        self.record.lock().unwrap().data.push((data.len(), data.len()));
        data.len()
    }

    fn on_close(&mut self, err: Option<&io::Error>) {
        self.record.lock().unwrap().closed = Some(err.map(|e| e.to_string()));
    }
}

#[tokio::test]
async fn test_body_drained_before_reuse() {
    let early: Shared = Default::default();
    let record: Shared = Default::default();
    let calls = Arc::new(AtomicUsize::new(0));
    let ctx = ServerContext::builder()
        .route("/early", {
            let early = early.clone();
            move || {
                Box::new(EarlyCloser {
                    reply: None,
                    record: early.clone(),
                }) as Box<dyn Handler>
            }
        })
        .route("/x", ok_factory(record.clone(), "second", calls.clone()))
        .build();
    let (mut client, _handle) = serve(&ctx, 4096);

    // Headers only; the handler replies before the body exists.
    client
        .write_all(b"POST /early HTTP/1.1\r\nHost: h\r\nContent-Length: 6\r\n\r\n")
        .await
        .unwrap();
    let text = String::from_utf8(read_until(&mut client, b"early").await).unwrap();
    assert!(text.starts_with("HTTP/1.1 200"));

    // Now the late body plus a pipelined second request. The six body
    // bytes must fall into the drain, not into the next request's parse.
    client
        .write_all(b"abcdefGET /x HTTP/1.1\r\nHost: h\r\n\r\n")
        .await
        .unwrap();
    let text = String::from_utf8(read_until(&mut client, b"second").await).unwrap();
    assert!(text.starts_with("HTTP/1.1 200"));

    assert_eq!(calls.load(Ordering::Relaxed), 1);
    assert_eq!(record.lock().unwrap().headers_path.as_deref(), Some("/x"));
}

/// Accepts its request and then never answers.
struct NeverCloses {
    record: Shared,
}

impl Handler for NeverCloses {
    fn initialize(&mut self, _reply: Reply) {}

    fn on_headers(&mut self, request: Request) {
        self.record.lock().unwrap().headers_path = Some(request.path);
    }

    fn on_data(&mut self, data: &[u8]) -> usize {
        data.len()
    }

    fn on_close(&mut self, err: Option<&io::Error>) {
        self.record.lock().unwrap().closed = Some(err.map(|e| e.to_string()));
    }
}

#[tokio::test]
async fn test_teardown_with_live_handler_synthesizes_close() {
    let record: Shared = Default::default();
    let ctx = ServerContext::builder()
        .route("/stuck", {
            let record = record.clone();
            move || {
                Box::new(NeverCloses {
                    record: record.clone(),
                }) as Box<dyn Handler>
            }
        })
        .build();
    let (mut client, handle) = serve(&ctx, 4096);

    // Declare a body that never arrives, so the handler's on_close can only
    // come from the teardown path.
    client
        .write_all(b"POST /stuck HTTP/1.1\r\nHost: h\r\nContent-Length: 5\r\n\r\n")
        .await
        .unwrap();
    wait_for("handler saw headers", || {
        record.lock().unwrap().headers_path.is_some()
    })
    .await;
    assert_eq!(record.lock().unwrap().closed, None);

    // Tear the connection down from outside, as a server shutdown would.
    handle.abort();
    let _ = handle.await;

    assert_eq!(record.lock().unwrap().closed, Some(None));
    assert_eq!(ctx.active_requests(), 0);
    assert_eq!(ctx.connections(), 0);
}

#[tokio::test]
async fn test_peer_close_on_idle_connection() {
    let record: Shared = Default::default();
    let calls = Arc::new(AtomicUsize::new(0));
    let ctx = ServerContext::builder()
        .route("/x", ok_factory(record, "ok", calls.clone()))
        .build();
    let (client, _handle) = serve(&ctx, 4096);

    // Never send anything; just go away.
    drop(client);

    wait_for("connection accounting drained", || ctx.connections() == 0).await;
    assert_eq!(calls.load(Ordering::Relaxed), 0);
}
