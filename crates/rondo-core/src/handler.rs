//! Handler shapes accepted by the server.
//!
//! Every route ends up as a [`HandlerFunction`]: ordinary async handlers,
//! streaming upload handlers and proxy handlers are distinct variants so the
//! connection can pick its body delivery mode right after the headers are
//! parsed. Blocking handlers are adapted into async ones.

use std::future::Future;
use std::panic::{self, AssertUnwindSafe};
use std::pin::Pin;
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use tracing::error;

use crate::http::{Request, Response};

pub type BoxFuture<T> = Pin<Box<dyn Future<Output = T> + Send + 'static>>;

/// Handler that produces its response asynchronously.
///
/// It receives the connection's in-flight response (already carrying the
/// not-found fallback, see [`Response::set_not_found_error`]) and hands it
/// back once filled in.
pub trait AsyncHandler: Send + Sync + 'static {
    fn call(&self, request: Request, response: Response) -> BoxFuture<Response>;
}

impl<F, Fut> AsyncHandler for F
where
    F: Fn(Request, Response) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Response> + Send + 'static,
{
    fn call(&self, request: Request, response: Response) -> BoxFuture<Response> {
        Box::pin(self(request, response))
    }
}

/// Synchronous handler. It runs to completion on whichever worker thread
/// polls it and keeps that thread busy until it returns.
pub trait BlockingHandler: Send + Sync + 'static {
    fn handle(&self, request: &Request, response: &mut Response);
}

impl<F> BlockingHandler for F
where
    F: Fn(&Request, &mut Response) + Send + Sync + 'static,
{
    fn handle(&self, request: &Request, response: &mut Response) {
        self(request, response)
    }
}

pub(crate) fn blocking(handler: Arc<dyn BlockingHandler>) -> Arc<dyn AsyncHandler> {
    Arc::new(move |request: Request, mut response: Response| {
        let handler = handler.clone();
        async move {
            match catch_panic("blocking handler", request.uri(), || {
                handler.handle(&request, &mut response)
            }) {
                Some(()) => response,
                None => Response::internal_error(),
            }
        }
    })
}

/// Calls synchronous user code. `None` means it panicked; the panic is
/// already logged against `uri`.
pub(crate) fn catch_panic<T>(what: &str, uri: &str, f: impl FnOnce() -> T) -> Option<T> {
    match panic::catch_unwind(AssertUnwindSafe(f)) {
        Ok(out) => Some(out),
        Err(_) => {
            error!(uri = %uri, "{} panicked", what);
            None
        }
    }
}

/// Runs asynchronous user code as its own task so a panic only costs the
/// current request. `None` means the task panicked or was cancelled.
pub(crate) async fn isolate<T, F>(what: &str, uri: &str, work: F) -> Option<T>
where
    F: Future<Output = T> + Send + 'static,
    T: Send + 'static,
{
    match tokio::spawn(work).await {
        Ok(out) => Some(out),
        Err(e) if e.is_panic() => {
            error!(uri = %uri, "{} panicked", what);
            None
        }
        Err(e) => {
            error!(uri = %uri, "{} task failed: {}", what, e);
            None
        }
    }
}

/// Receives one request body chunk by chunk.
#[async_trait]
pub trait UploadSink: Send {
    /// Called for every body chunk as it comes off the socket. Returning
    /// `Err` stops the upload and sends that response instead.
    async fn chunk(&mut self, data: Bytes) -> Result<(), Response>;

    /// Called once the body is complete.
    async fn finish(&mut self, response: Response) -> Response;
}

/// Streaming upload route: creates a sink per request from its headers.
pub trait UploadHandler: Send + Sync + 'static {
    fn begin(&self, request: &Request) -> Box<dyn UploadSink>;
}

impl<F> UploadHandler for F
where
    F: Fn(&Request) -> Box<dyn UploadSink> + Send + Sync + 'static,
{
    fn begin(&self, request: &Request) -> Box<dyn UploadSink> {
        self(request)
    }
}

/// Single request interception slot. `Some` short-circuits routing.
#[async_trait]
pub trait RequestFilter: Send + Sync + 'static {
    async fn filter(&self, request: &Request) -> Option<Response>;
}

#[async_trait]
impl<F> RequestFilter for F
where
    F: Fn(&Request) -> Option<Response> + Send + Sync + 'static,
{
    async fn filter(&self, request: &Request) -> Option<Response> {
        self(request)
    }
}

/// Runs on every response before it is written, with the original URI.
pub type ResponseFilter = Arc<dyn Fn(&str, &mut Response) + Send + Sync>;

pub type NotFoundHandler = Arc<dyn Fn(&Request, &mut Response) + Send + Sync>;

#[derive(Clone)]
pub enum HandlerFunction {
    Simple(Arc<dyn AsyncHandler>),
    Upload(Arc<dyn UploadHandler>),
    /// Forwards any method untouched.
    Proxy(Arc<dyn AsyncHandler>),
}

impl HandlerFunction {
    pub fn is_proxy(&self) -> bool {
        matches!(self, HandlerFunction::Proxy(_))
    }

    pub fn is_upload(&self) -> bool {
        matches!(self, HandlerFunction::Upload(_))
    }
}

impl std::fmt::Debug for HandlerFunction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            HandlerFunction::Simple(_) => "Simple",
            HandlerFunction::Upload(_) => "Upload",
            HandlerFunction::Proxy(_) => "Proxy",
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::http::Method;

    #[tokio::test]
    async fn blocking_adapter_fills_response() {
        let handler = blocking(Arc::new(|req: &Request, res: &mut Response| {
            res.set_status(201);
            res.set_body(req.uri().to_string());
        }));

        let res = handler
            .call(Request::new(Method::Get, "/sync"), Response::new(200))
            .await;
        assert_eq!(res.status(), 201);
        assert_eq!(res.body().as_ref(), b"/sync");
    }

    #[tokio::test]
    async fn blocking_adapter_turns_panic_into_500() {
        fn explode(_: &Request, _: &mut Response) {
            panic!("handler bug");
        }
        let handler = blocking(Arc::new(explode));

        let res = handler
            .call(Request::new(Method::Get, "/sync"), Response::new(200))
            .await;
        assert_eq!(res.status(), 500);
    }

    #[test]
    fn catch_panic_passes_values_through() {
        assert_eq!(catch_panic("callback", "/", || 7), Some(7));
        assert_eq!(catch_panic("callback", "/", || -> u8 { panic!("callback bug") }), None);
    }

    #[tokio::test]
    async fn isolate_reports_panicking_task() {
        assert_eq!(isolate("sink", "/", async { 7 }).await, Some(7));
        let out = isolate("sink", "/", async {
            if true {
                panic!("sink bug");
            }
            7
        })
        .await;
        assert_eq!(out, None);
    }

    #[tokio::test]
    async fn closure_request_filter_short_circuits() {
        let filter = |req: &Request| {
            (req.header("authorization").is_none()).then(|| Response::error(401))
        };

        let denied = filter.filter(&Request::new(Method::Get, "/")).await;
        assert_eq!(denied.map(|r| r.status()), Some(401));

        let allowed = filter
            .filter(&Request::new(Method::Get, "/").with_header("Authorization", "x"))
            .await;
        assert!(allowed.is_none());
    }
}
