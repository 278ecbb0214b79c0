// src/lib.rs
pub mod codec;
pub mod config;
pub(crate) mod connection;
pub mod error;
pub mod guard;
pub mod handler;
pub mod http;
pub mod logging;
pub mod router;
pub mod scheduler;
pub mod server;
pub mod transport;

pub use codec::{Limits, ParseError};
pub use config::ServerConfig;
pub use error::{Error, Result};
pub use guard::ResourceGuard;
pub use handler::{AsyncHandler, BlockingHandler, RequestFilter, UploadHandler, UploadSink};
pub use http::{Headers, Method, Request, Response};
pub use scheduler::{DeferredCommand, PeriodicCommand, ScheduledCommand, ScheduledCommandRunner};
pub use server::Server;
#[cfg(feature = "tls")]
pub use transport::TlsContext;
pub use transport::{Acceptor, BoxedTransport, TcpAcceptor, Transport};
#[cfg(feature = "tls")]
pub use rustls;

pub use async_trait::async_trait;
pub use bytes::Bytes;
