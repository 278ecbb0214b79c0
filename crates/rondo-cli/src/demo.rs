//! Demonstration routes served by `rondo serve`.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use bytes::Bytes;
use rondo_core::{PeriodicCommand, Request, Response, Server, UploadSink};
use tracing::info;

const HEARTBEAT_PERIOD: Duration = Duration::from_secs(30);

pub fn register(server: &mut Server) {
    let started = Instant::now();
    let served = Arc::new(AtomicU64::new(0));

    let name = server.name().to_string();
    server.add_blocking_handler("/status", move |_req: &Request, res: &mut Response| {
        res.set_content_type("application/json");
        res.set_body(format!(
            r#"{{"name":"{}","status":"ok","uptime_secs":{}}}"#,
            name,
            started.elapsed().as_secs()
        ));
    });

    server.add_handler("/echo/", |req: Request, mut res: Response| async move {
        res.set_content_type(
            req.header("content-type")
                .unwrap_or("application/octet-stream")
                .to_string(),
        );
        res.set_header("X-Echo-Method", req.method().as_str());
        res.set_body(req.body().clone());
        res
    });

    server.add_upload_handler("/upload/", |_req: &Request| {
        Box::new(ByteCounter::default()) as Box<dyn UploadSink>
    });

    server.set_not_found_handler(|req: &Request, res: &mut Response| {
        res.set_status(404);
        res.set_content_type("application/json");
        res.set_body(format!(r#"{{"error":"no route for {}"}}"#, req.path()));
    });

    let counter = served.clone();
    server.set_response_filter(move |_uri: &str, _res: &mut Response| {
        counter.fetch_add(1, Ordering::Relaxed);
    });

    server.add_scheduled_command(Arc::new(PeriodicCommand::new(HEARTBEAT_PERIOD, move || {
        info!(
            served = served.load(Ordering::Relaxed),
            uptime_secs = started.elapsed().as_secs(),
            "heartbeat"
        );
        true
    })));
}

/// Counts upload bytes without keeping them.
#[derive(Default)]
struct ByteCounter {
    bytes: u64,
    chunks: u64,
}

#[async_trait]
impl UploadSink for ByteCounter {
    async fn chunk(&mut self, data: Bytes) -> Result<(), Response> {
        self.bytes += data.len() as u64;
        self.chunks += 1;
        Ok(())
    }

    async fn finish(&mut self, mut response: Response) -> Response {
        response.set_content_type("text/plain");
        response.set_body(format!(
            "received {} bytes in {} chunks",
            self.bytes, self.chunks
        ));
        response
    }
}
