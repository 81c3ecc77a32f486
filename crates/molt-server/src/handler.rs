//! Demo request handler.
//!
//! Answers every request with a fixed plain-text body after an optional
//! delay. The `X-Molt-Pid` header shows which generation served it.

use std::borrow::Cow;
use std::time::Duration;

use async_trait::async_trait;
use molt_ecdysis::{Handler, Request, Response};
use tracing::info;

pub const BODY: &str = "this is test response";

pub struct DemoHandler {
    delay: Duration,
    pid: u32,
}

impl DemoHandler {
    pub fn new(delay: Duration) -> Self {
        Self {
            delay,
            pid: std::process::id(),
        }
    }
}

#[async_trait]
impl Handler for DemoHandler {
    async fn handle(&self, request: Request) -> Response {
        let line = request_line(&request.bytes);
        info!(peer = %request.peer, request = %line, pid = self.pid, "Request started");

        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }

        info!(peer = %request.peer, pid = self.pid, "Request done");
        Response::new(http_response(self.pid))
    }
}

/// First line of the request, for logging.
fn request_line(bytes: &[u8]) -> Cow<'_, str> {
    let end = bytes
        .iter()
        .position(|b| *b == b'\r' || *b == b'\n')
        .unwrap_or(bytes.len());
    String::from_utf8_lossy(&bytes[..end])
}

fn http_response(pid: u32) -> String {
    format!(
        "HTTP/1.1 200 OK\r\n\
         Content-Type: text/plain\r\n\
         Content-Length: {}\r\n\
         X-Molt-Pid: {}\r\n\
         Connection: close\r\n\
         \r\n\
         {}",
        BODY.len(),
        pid,
        BODY
    )
}
