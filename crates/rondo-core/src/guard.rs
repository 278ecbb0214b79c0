//! Classification of I/O errors raised at async completion boundaries.
//!
//! Once the process runs out of file descriptors or memory it cannot serve
//! requests correctly any more. In abort mode the guard terminates the
//! process so a supervisor can start a fresh instance; otherwise the server
//! keeps running degraded.

use std::io;

use tracing::{error, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClass {
    /// Operation aborted or bad descriptor: the ordinary result of closing
    /// the acceptor during `stop()`.
    Shutdown,
    /// Too many open files or out of memory.
    ResourceExhausted,
    /// Any other transport failure.
    Transport,
}

pub fn classify(err: &io::Error) -> ErrorClass {
    if let Some(code) = err.raw_os_error() {
        return match code {
            libc::ECANCELED | libc::EBADF => ErrorClass::Shutdown,
            libc::EMFILE | libc::ENFILE | libc::ENOMEM => ErrorClass::ResourceExhausted,
            _ => ErrorClass::Transport,
        };
    }
    match err.kind() {
        io::ErrorKind::OutOfMemory => ErrorClass::ResourceExhausted,
        _ => ErrorClass::Transport,
    }
}

/// What the guard decided for one error.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Escalation {
    Ignore,
    Log,
    Degrade,
    Abort,
}

#[derive(Debug, Clone, Copy, Default)]
pub struct ResourceGuard {
    abort_on_resource_error: bool,
}

impl ResourceGuard {
    pub fn new(abort_on_resource_error: bool) -> Self {
        Self {
            abort_on_resource_error,
        }
    }

    pub fn aborts_on_resource_error(&self) -> bool {
        self.abort_on_resource_error
    }

    pub fn assess(&self, err: &io::Error) -> Escalation {
        match classify(err) {
            ErrorClass::Shutdown => Escalation::Ignore,
            ErrorClass::Transport => Escalation::Log,
            ErrorClass::ResourceExhausted if self.abort_on_resource_error => Escalation::Abort,
            ErrorClass::ResourceExhausted => Escalation::Degrade,
        }
    }

    /// Logs `err` as seen at `context` and escalates it. Never returns when
    /// the error is resource exhaustion and abort mode is on.
    pub fn check(&self, context: &str, err: &io::Error) -> Escalation {
        let escalation = self.assess(err);
        match escalation {
            Escalation::Ignore => {}
            Escalation::Log => error!("{}: {}", context, err),
            Escalation::Degrade => {
                error!("{}: {}", context, err);
                warn!("resource exhaustion error occurred (continuing to run)");
            }
            Escalation::Abort => {
                error!("{}: {}", context, err);
                error!("(ABORTING SERVER): resource exhaustion");
                std::process::abort();
            }
        }
        escalation
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn shutdown_codes_are_ignored() {
        let guard = ResourceGuard::new(true);
        for code in [libc::ECANCELED, libc::EBADF] {
            let err = io::Error::from_raw_os_error(code);
            assert_eq!(classify(&err), ErrorClass::Shutdown);
            assert_eq!(guard.check("accept", &err), Escalation::Ignore);
        }
    }

    #[test]
    fn exhaustion_degrades_without_abort_mode() {
        let guard = ResourceGuard::new(false);
        for code in [libc::EMFILE, libc::ENFILE, libc::ENOMEM] {
            let err = io::Error::from_raw_os_error(code);
            assert_eq!(guard.check("accept", &err), Escalation::Degrade);
        }
        let oom = io::Error::from(io::ErrorKind::OutOfMemory);
        assert_eq!(guard.assess(&oom), Escalation::Degrade);
    }

    #[test]
    fn exhaustion_aborts_in_abort_mode() {
        let guard = ResourceGuard::new(true);
        let err = io::Error::from_raw_os_error(libc::EMFILE);
        assert_eq!(guard.assess(&err), Escalation::Abort);
    }

    #[test]
    fn other_errors_are_logged() {
        let guard = ResourceGuard::new(true);
        let err = io::Error::from_raw_os_error(libc::ECONNRESET);
        assert_eq!(classify(&err), ErrorClass::Transport);
        assert_eq!(guard.check("read", &err), Escalation::Log);
        assert_eq!(
            guard.assess(&io::Error::other("tls handshake failed")),
            Escalation::Log
        );
    }
}
