//! One accepted socket, one request, one response.
//!
//! The head is parsed first; the route it resolves to decides whether the
//! body is buffered into the request or streamed into an upload sink. The
//! response always closes the connection.

use std::io;
use std::net::SocketAddr;
use std::sync::Arc;

use bytes::BytesMut;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tracing::debug;

use crate::codec::{BodyDecoder, BodyEvent, BodyFraming, Limits, RequestDecoder, ResponseEncoder};
use crate::guard::ResourceGuard;
use crate::handler::{
    AsyncHandler, HandlerFunction, NotFoundHandler, RequestFilter, ResponseFilter, UploadHandler,
    catch_panic, isolate,
};
use crate::http::{Method, Request, Response};
use crate::router::HandlerRegistry;
#[cfg(feature = "tls")]
use crate::transport::TlsContext;
use crate::transport::BoxedTransport;

const READ_BUF_SIZE: usize = 8 * 1024;

/// Routing table and filters, frozen when the server starts.
pub(crate) struct Dispatcher {
    pub(crate) name: String,
    pub(crate) registry: HandlerRegistry,
    pub(crate) default_handler: Option<Arc<dyn AsyncHandler>>,
    pub(crate) not_found_handler: Option<NotFoundHandler>,
    pub(crate) request_filter: Option<Arc<dyn RequestFilter>>,
    pub(crate) response_filter: Option<ResponseFilter>,
    pub(crate) limits: Limits,
    #[cfg(feature = "tls")]
    pub(crate) tls: Option<TlsContext>,
}

/// Outcome of route resolution, decided right after the head is parsed.
pub(crate) enum Route {
    Handler(HandlerFunction),
    MethodNotAllowed,
    Fallback,
}

impl Dispatcher {
    pub(crate) fn resolve(&self, request: &Request) -> Route {
        match self.registry.handler_for(request.uri()) {
            Some(entry) if !entry.is_proxy_handler() && !request.method().is_supported() => {
                Route::MethodNotAllowed
            }
            Some(entry) => Route::Handler(entry.function().clone()),
            None => Route::Fallback,
        }
    }

    fn new_response(&self) -> Response {
        let mut response = Response::new(200);
        if let Some(handler) = &self.not_found_handler {
            response.set_not_found_handler(handler.clone());
        }
        response
    }

    /// A panicking filter answers 500 in place of the request.
    async fn filter_request(&self, request: &Request) -> Option<Response> {
        let filter = self.request_filter.clone()?;
        let request = request.clone();
        let uri = request.uri().to_string();
        isolate("request filter", &uri, async move { filter.filter(&request).await })
            .await
            .unwrap_or_else(|| Some(Response::internal_error()))
    }

    pub(crate) async fn dispatch(&self, handler: Arc<dyn AsyncHandler>, request: Request) -> Response {
        let uri = request.uri().to_string();
        isolate("handler", &uri, handler.call(request, self.new_response()))
            .await
            .unwrap_or_else(Response::internal_error)
    }

    async fn fallback(&self, request: Request) -> Response {
        match &self.default_handler {
            Some(handler) => self.dispatch(handler.clone(), request).await,
            None => {
                let mut response = self.new_response();
                response.set_not_found_error(&request);
                response
            }
        }
    }

    /// Filter, then either the routed handler or the fallback chain.
    async fn complete(&self, handler: Option<Arc<dyn AsyncHandler>>, request: Request) -> Response {
        if let Some(response) = self.filter_request(&request).await {
            return response;
        }
        match handler {
            Some(handler) => self.dispatch(handler, request).await,
            None => self.fallback(request).await,
        }
    }

    pub(crate) fn filter_response(&self, uri: &str, response: &mut Response) {
        response.set_header("Server", self.name.as_str());
        if let Some(filter) = &self.response_filter
            && catch_panic("response filter", uri, || filter(uri, response)).is_none()
        {
            *response = Response::internal_error();
            response.set_header("Server", self.name.as_str());
        }
    }
}

/// Entry point for an accepted socket. Errors end up in the guard.
pub(crate) async fn serve(
    dispatcher: Arc<Dispatcher>,
    guard: ResourceGuard,
    io: BoxedTransport,
    peer: Option<SocketAddr>,
) {
    #[cfg(feature = "tls")]
    let io = match &dispatcher.tls {
        Some(tls) => match tls.wrap(io).await {
            Ok(io) => io,
            Err(e) => {
                guard.check("tls handshake", &e);
                return;
            }
        },
        None => io,
    };

    let mut conn = Connection {
        io,
        buf: BytesMut::with_capacity(READ_BUF_SIZE),
        dispatcher,
    };
    if let Err(e) = conn.run(peer).await {
        match e.kind() {
            io::ErrorKind::UnexpectedEof
            | io::ErrorKind::ConnectionReset
            | io::ErrorKind::BrokenPipe => debug!("connection closed early: {}", e),
            _ => {
                guard.check("connection", &e);
            }
        }
    }
}

struct Connection {
    io: BoxedTransport,
    buf: BytesMut,
    dispatcher: Arc<Dispatcher>,
}

impl Connection {
    async fn run(&mut self, peer: Option<SocketAddr>) -> io::Result<()> {
        let decoder = RequestDecoder::new(self.dispatcher.limits);
        let (mut request, framing) = loop {
            match decoder.decode_head(&mut self.buf) {
                Ok(Some(head)) => break head,
                Ok(None) => {}
                Err(e) => {
                    debug!("rejecting request: {}", e);
                    return self.respond("", Response::error(e.status()), false).await;
                }
            }
            if self.io.read_buf(&mut self.buf).await? == 0 {
                if self.buf.is_empty() {
                    return Ok(());
                }
                return Err(io::ErrorKind::UnexpectedEof.into());
            }
        };
        if let Some(peer) = peer {
            request.set_peer_addr(peer);
        }

        let uri = request.uri().to_string();
        let head_only = *request.method() == Method::Head;

        let response = match self.dispatcher.resolve(&request) {
            Route::MethodNotAllowed => {
                debug!(method = %request.method(), uri = %uri, "method not allowed");
                Response::method_not_allowed()
            }
            Route::Handler(HandlerFunction::Upload(handler)) => {
                self.stream_upload(handler, request, framing).await?
            }
            Route::Handler(HandlerFunction::Simple(handler))
            | Route::Handler(HandlerFunction::Proxy(handler)) => {
                match self.buffer_body(&mut request, framing).await? {
                    Ok(()) => self.dispatcher.complete(Some(handler), request).await,
                    Err(response) => response,
                }
            }
            Route::Fallback => match self.buffer_body(&mut request, framing).await? {
                Ok(()) => self.dispatcher.complete(None, request).await,
                Err(response) => response,
            },
        };

        self.respond(&uri, response, head_only).await
    }

    /// Reads more bytes; the peer closing mid-request is an error.
    async fn fill(&mut self) -> io::Result<()> {
        if self.io.read_buf(&mut self.buf).await? == 0 {
            return Err(io::ErrorKind::UnexpectedEof.into());
        }
        Ok(())
    }

    async fn buffer_body(
        &mut self,
        request: &mut Request,
        framing: BodyFraming,
    ) -> io::Result<Result<(), Response>> {
        let limit = self.dispatcher.limits.max_body_bytes;
        if let BodyFraming::Length(n) = framing
            && n > limit as u64
        {
            return Ok(Err(Response::error(413)));
        }

        let mut decoder = BodyDecoder::new(framing);
        let mut body = BytesMut::new();
        loop {
            match decoder.decode(&mut self.buf) {
                Ok(Some(BodyEvent::Data(data))) => {
                    if body.len() + data.len() > limit {
                        return Ok(Err(Response::error(413)));
                    }
                    body.extend_from_slice(&data);
                }
                Ok(Some(BodyEvent::End)) => break,
                Ok(None) => self.fill().await?,
                Err(e) => return Ok(Err(Response::error(e.status()))),
            }
        }
        request.set_body(body.freeze());
        Ok(Ok(()))
    }

    async fn stream_upload(
        &mut self,
        handler: Arc<dyn UploadHandler>,
        request: Request,
        framing: BodyFraming,
    ) -> io::Result<Response> {
        if let Some(response) = self.dispatcher.filter_request(&request).await {
            return Ok(response);
        }

        let uri = request.uri();
        let Some(mut sink) = catch_panic("upload handler", uri, || handler.begin(&request)) else {
            return Ok(Response::internal_error());
        };
        let mut decoder = BodyDecoder::new(framing);
        loop {
            match decoder.decode(&mut self.buf) {
                Ok(Some(BodyEvent::Data(data))) => {
                    // The sink travels into its own task and back for every chunk.
                    let step = isolate("upload sink", uri, async move {
                        let outcome = sink.chunk(data).await;
                        (sink, outcome)
                    })
                    .await;
                    match step {
                        Some((returned, Ok(()))) => sink = returned,
                        Some((_, Err(response))) => return Ok(response),
                        None => return Ok(Response::internal_error()),
                    }
                }
                Ok(Some(BodyEvent::End)) => break,
                Ok(None) => self.fill().await?,
                Err(e) => return Ok(Response::error(e.status())),
            }
        }
        let response = self.dispatcher.new_response();
        Ok(isolate("upload sink", uri, async move { sink.finish(response).await })
            .await
            .unwrap_or_else(Response::internal_error))
    }

    async fn respond(&mut self, uri: &str, mut response: Response, head_only: bool) -> io::Result<()> {
        self.dispatcher.filter_response(uri, &mut response);

        let mut out = BytesMut::with_capacity(256 + response.body().len());
        ResponseEncoder::encode(&response, head_only, &mut out);
        self.io.write_all(&out).await?;
        self.io.flush().await?;
        let _ = self.io.shutdown().await;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use bytes::Bytes;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    use crate::handler::UploadSink;

    fn dispatcher(registry: HandlerRegistry) -> Dispatcher {
        Dispatcher {
            name: "test-server".into(),
            registry,
            default_handler: None,
            not_found_handler: None,
            request_filter: None,
            response_filter: None,
            limits: Limits::default(),
            #[cfg(feature = "tls")]
            tls: None,
        }
    }

    async fn exchange(dispatcher: Dispatcher, raw: &[u8]) -> String {
        let (client, server) = tokio::io::duplex(64 * 1024);
        let task = tokio::spawn(serve(
            Arc::new(dispatcher),
            ResourceGuard::new(false),
            Box::new(server),
            None,
        ));

        let (mut rd, mut wr) = tokio::io::split(client);
        wr.write_all(raw).await.unwrap();
        let mut out = Vec::new();
        rd.read_to_end(&mut out).await.unwrap();
        task.await.unwrap();
        String::from_utf8(out).unwrap()
    }

    fn echo() -> Arc<dyn AsyncHandler> {
        Arc::new(|req: Request, _res: Response| async move {
            Response::ok(format!("{} {} {}", req.method(), req.uri(), req.body().len()))
        })
    }

    #[tokio::test]
    async fn buffered_request_reaches_handler() {
        let mut registry = HandlerRegistry::new("");
        registry.add("/echo/", HandlerFunction::Simple(echo()));

        let out = exchange(
            dispatcher(registry),
            b"POST /echo/x HTTP/1.1\r\nContent-Length: 5\r\n\r\nhello",
        )
        .await;

        assert!(out.starts_with("HTTP/1.1 200 OK\r\n"));
        assert!(out.contains("Server: test-server\r\n"));
        assert!(out.contains("Connection: close\r\n"));
        assert!(out.ends_with("POST /echo/x 5"));
    }

    #[tokio::test]
    async fn unsupported_method_is_405_unless_proxied() {
        let mut registry = HandlerRegistry::new("");
        registry.add("/plain/", HandlerFunction::Simple(echo()));
        registry.add("/proxy/", HandlerFunction::Proxy(echo()));
        let dispatcher = Arc::new(dispatcher(registry));

        let req = Request::new(Method::Delete, "/plain/a");
        assert!(matches!(dispatcher.resolve(&req), Route::MethodNotAllowed));
        let req = Request::new(Method::Delete, "/proxy/a");
        assert!(matches!(dispatcher.resolve(&req), Route::Handler(_)));
        let req = Request::new(Method::Get, "/other");
        assert!(matches!(dispatcher.resolve(&req), Route::Fallback));
    }

    #[tokio::test]
    async fn malformed_head_gets_400_with_server_header() {
        let out = exchange(dispatcher(HandlerRegistry::new("")), b"NONSENSE\r\n\r\n").await;
        assert!(out.starts_with("HTTP/1.1 400 Bad Request\r\n"));
        assert!(out.contains("Server: test-server\r\n"));
    }

    #[tokio::test]
    async fn oversized_declared_body_is_413() {
        let mut registry = HandlerRegistry::new("");
        registry.add("/", HandlerFunction::Simple(echo()));
        let mut d = dispatcher(registry);
        d.limits.max_body_bytes = 4;

        let out = exchange(d, b"POST / HTTP/1.1\r\nContent-Length: 10\r\n\r\n").await;
        assert!(out.starts_with("HTTP/1.1 413 "));
    }

    #[tokio::test]
    async fn head_request_omits_body() {
        let mut registry = HandlerRegistry::new("");
        registry.add("/", HandlerFunction::Simple(echo()));

        let out = exchange(dispatcher(registry), b"HEAD / HTTP/1.1\r\n\r\n").await;
        assert!(out.starts_with("HTTP/1.1 200 OK\r\n"));
        assert!(out.ends_with("\r\n\r\n"));
    }

    #[tokio::test]
    async fn handler_panic_becomes_500() {
        let mut registry = HandlerRegistry::new("");
        let boom: Arc<dyn AsyncHandler> = Arc::new(|_req: Request, res: Response| async move {
            if res.status() == 200 {
                panic!("handler bug");
            }
            res
        });
        registry.add("/", HandlerFunction::Simple(boom));

        let out = exchange(dispatcher(registry), b"GET / HTTP/1.1\r\n\r\n").await;
        assert!(out.starts_with("HTTP/1.1 500 Internal Server Error\r\n"));
    }

    #[tokio::test]
    async fn request_filter_short_circuits() {
        let mut registry = HandlerRegistry::new("");
        registry.add("/", HandlerFunction::Simple(echo()));
        let mut d = dispatcher(registry);
        let filter = |req: &Request| req.header("x-deny").map(|_| Response::error(403));
        d.request_filter = Some(Arc::new(filter));

        let out = exchange(d, b"GET / HTTP/1.1\r\nX-Deny: 1\r\n\r\n").await;
        assert!(out.starts_with("HTTP/1.1 403 Forbidden\r\n"));
    }

    struct Counter {
        seen: usize,
    }

    #[async_trait]
    impl UploadSink for Counter {
        async fn chunk(&mut self, data: Bytes) -> Result<(), Response> {
            self.seen += data.len();
            Ok(())
        }

        async fn finish(&mut self, mut response: Response) -> Response {
            response.set_body(self.seen.to_string());
            response
        }
    }

    #[tokio::test]
    async fn chunked_upload_streams_into_sink() {
        let mut registry = HandlerRegistry::new("");
        let upload: Arc<dyn UploadHandler> =
            Arc::new(|_req: &Request| Box::new(Counter { seen: 0 }) as Box<dyn UploadSink>);
        registry.add("/upload/", HandlerFunction::Upload(upload));

        let out = exchange(
            dispatcher(registry),
            b"PUT /upload/f HTTP/1.1\r\nTransfer-Encoding: chunked\r\n\r\n\
              4\r\nabcd\r\n3;ext=1\r\nefg\r\n0\r\nX-Trailer: t\r\n\r\n",
        )
        .await;
        assert!(out.starts_with("HTTP/1.1 200 OK\r\n"));
        assert!(out.ends_with("\r\n\r\n7"));
    }

    #[tokio::test]
    async fn unmatched_uri_uses_not_found_handler() {
        let mut d = dispatcher(HandlerRegistry::new(""));
        let nf: NotFoundHandler = Arc::new(|req: &Request, res: &mut Response| {
            res.set_status(404);
            res.set_body(format!("nothing at {}", req.path()));
        });
        d.not_found_handler = Some(nf);

        let out = exchange(d, b"GET /missing?q=1 HTTP/1.0\r\n\r\n").await;
        assert!(out.starts_with("HTTP/1.1 404 Not Found\r\n"));
        assert!(out.ends_with("nothing at /missing"));
    }

    #[tokio::test]
    async fn panicking_request_filter_answers_500() {
        let mut registry = HandlerRegistry::new("");
        registry.add("/", HandlerFunction::Simple(echo()));
        let mut d = dispatcher(registry);
        let filter = |_: &Request| -> Option<Response> { panic!("filter bug") };
        d.request_filter = Some(Arc::new(filter));

        let out = exchange(d, b"GET / HTTP/1.1\r\n\r\n").await;
        assert!(out.starts_with("HTTP/1.1 500 Internal Server Error\r\n"));
        assert!(out.contains("Server: test-server\r\n"));
    }

    #[tokio::test]
    async fn panicking_not_found_handler_answers_500() {
        fn broken(_: &Request, _: &mut Response) {
            panic!("not-found bug");
        }
        let mut d = dispatcher(HandlerRegistry::new(""));
        d.not_found_handler = Some(Arc::new(broken));

        let out = exchange(d, b"GET /x HTTP/1.1\r\n\r\n").await;
        assert!(out.starts_with("HTTP/1.1 500 Internal Server Error\r\n"));
    }

    #[tokio::test]
    async fn panicking_response_filter_still_writes_stamped_500() {
        fn broken(_: &str, res: &mut Response) {
            res.set_body("half written");
            panic!("response filter bug");
        }
        let mut registry = HandlerRegistry::new("");
        registry.add("/", HandlerFunction::Simple(echo()));
        let mut d = dispatcher(registry);
        d.response_filter = Some(Arc::new(broken));

        let out = exchange(d, b"GET / HTTP/1.1\r\n\r\n").await;
        assert!(out.starts_with("HTTP/1.1 500 Internal Server Error\r\n"));
        assert!(out.contains("Server: test-server\r\n"));
        assert!(!out.contains("half written"));
    }

    #[tokio::test]
    async fn panicking_upload_handler_answers_500() {
        let mut registry = HandlerRegistry::new("");
        let upload: Arc<dyn UploadHandler> =
            Arc::new(|_req: &Request| -> Box<dyn UploadSink> { panic!("begin bug") });
        registry.add("/upload/", HandlerFunction::Upload(upload));

        let out = exchange(
            dispatcher(registry),
            b"PUT /upload/f HTTP/1.1\r\nContent-Length: 3\r\n\r\nabc",
        )
        .await;
        assert!(out.starts_with("HTTP/1.1 500 Internal Server Error\r\n"));
    }

    struct Faulty {
        in_finish: bool,
    }

    #[async_trait]
    impl UploadSink for Faulty {
        async fn chunk(&mut self, _data: Bytes) -> Result<(), Response> {
            if !self.in_finish {
                panic!("chunk bug");
            }
            Ok(())
        }

        async fn finish(&mut self, response: Response) -> Response {
            if self.in_finish {
                panic!("finish bug");
            }
            response
        }
    }

    #[tokio::test]
    async fn panicking_upload_sink_answers_500() {
        for in_finish in [false, true] {
            let mut registry = HandlerRegistry::new("");
            let upload: Arc<dyn UploadHandler> = Arc::new(move |_req: &Request| {
                Box::new(Faulty { in_finish }) as Box<dyn UploadSink>
            });
            registry.add("/upload/", HandlerFunction::Upload(upload));

            let out = exchange(
                dispatcher(registry),
                b"PUT /upload/f HTTP/1.1\r\nContent-Length: 3\r\n\r\nabc",
            )
            .await;
            assert!(
                out.starts_with("HTTP/1.1 500 Internal Server Error\r\n"),
                "in_finish={}: {}",
                in_finish,
                out
            );
        }
    }
}
