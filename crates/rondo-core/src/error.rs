use std::io;
use std::time::Duration;

use thiserror::Error;

/// Central error type for the rondo server.
#[derive(Debug, Error)]
pub enum Error {
    /// Underlying I/O error from the OS or network.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// The OS refused to create the worker threads.
    #[error("failed to start worker threads: {0}")]
    ThreadPool(#[source] io::Error),

    /// Blocking or restoring the signal mask around worker creation failed.
    #[error("failed to change the signal mask: {0}")]
    SignalMask(#[source] io::Error),

    /// Scheduled command intervals must be strictly positive.
    #[error("invalid scheduled command interval: {0:?}")]
    InvalidInterval(Duration),

    /// The listening socket was handed to a previous run and closed by `stop()`.
    #[error("the listening socket has already been consumed by a previous run")]
    AcceptorConsumed,

    /// Invalid value in the environment configuration.
    #[error("configuration error: {0}")]
    Config(String),
}

pub type Result<T> = std::result::Result<T, Error>;
