use std::io;

use palisade::config::Config;
use palisade::http::request::Request;
use palisade::http::response::{ResponseBuilder, StatusCode};
use palisade::http::{Handler, Reply};
use palisade::server::{self, ServerContext};

/// Replies `pong` to any request.
#[derive(Default)]
struct PingHandler {
    reply: Option<Reply>,
}

impl Handler for PingHandler {
    fn initialize(&mut self, reply: Reply) {
        self.reply = Some(reply);
    }

    fn on_headers(&mut self, _request: Request) {
        if let Some(reply) = &self.reply {
            let mut response = ResponseBuilder::new(StatusCode::Ok)
                .header("Content-Type", "text/plain")
                .body(b"pong".to_vec())
                .build();
            let body = response.take_body();
            reply.send_headers(response, body, None);
            reply.close(None);
        }
    }

    fn on_data(&mut self, data: &[u8]) -> usize {
        data.len()
    }

    fn on_close(&mut self, _err: Option<&io::Error>) {}
}

/// Collects the request body and sends it back verbatim.
#[derive(Default)]
struct EchoHandler {
    reply: Option<Reply>,
    body: Vec<u8>,
}

impl Handler for EchoHandler {
    fn initialize(&mut self, reply: Reply) {
        self.reply = Some(reply);
    }

    fn on_headers(&mut self, _request: Request) {}

    fn on_data(&mut self, data: &[u8]) -> usize {
        self.body.extend_from_slice(data);
        data.len()
    }

    fn on_close(&mut self, err: Option<&io::Error>) {
        if err.is_some() {
            return;
        }
        if let Some(reply) = &self.reply {
            let mut response = ResponseBuilder::new(StatusCode::Ok)
                .header("Content-Type", "application/octet-stream")
                .body(std::mem::take(&mut self.body))
                .build();
            let body = response.take_body();
            reply.send_headers(response, body, None);
            reply.close(None);
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_target(false)
        .with_level(true)
        .with_max_level(tracing::Level::DEBUG)
        .init();

    let cfg = Config::load();

    let ctx = ServerContext::builder()
        .safe_mode(cfg.server.safe_mode)
        .route("/ping", || Box::new(PingHandler::default()) as Box<dyn Handler>)
        .route_prefix("/echo", || {
            Box::new(EchoHandler::default()) as Box<dyn Handler>
        })
        .build();

    #[cfg(unix)]
    if let Some(path) = cfg.server.unix_listen.clone() {
        let ctx = ctx.clone();
        let buffer_size = cfg.server.buffer_size;
        tokio::spawn(async move {
            if let Err(err) = server::listener::run_unix(ctx, path, buffer_size).await {
                tracing::error!(error = %err, "unix listener failed");
            }
        });
    }

    tokio::select! {
        res = server::listener::run(ctx.clone(), &cfg.server) => {
            res?;
        }

        _ = tokio::signal::ctrl_c() => {
            tracing::info!("Shutdown signal received");
        }
    }

    Ok(())
}
