//! Server lifecycle: registration, worker pool, acceptance loop.
//!
//! A [`Server`] is configured through `&mut self` methods while stopped, then
//! shared (typically in an `Arc`) and driven through `&self` lifecycle calls.
//! `run` freezes the routing table and filters into a read-only snapshot, so
//! connections never take a lock on the request path.

use std::cell::RefCell;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError, mpsc};
use std::time::Duration;

use tokio::runtime::{Handle, Runtime};
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

use crate::codec::Limits;
use crate::config::ServerConfig;
use crate::connection::{self, Dispatcher};
use crate::error::{Error, Result};
use crate::guard::{Escalation, ResourceGuard};
use crate::handler::{
    self, AsyncHandler, BlockingHandler, HandlerFunction, NotFoundHandler, RequestFilter,
    UploadHandler,
};
use crate::http::{Request, Response};
use crate::router::HandlerRegistry;
use crate::scheduler::{self, ScheduledCommand, ScheduledCommandRunner};
#[cfg(feature = "tls")]
use crate::transport::TlsContext;
use crate::transport::{Acceptor, TcpAcceptor};

pub const DEFAULT_BACKLOG: i32 = 1024;

/// Pause before re-arming accept after running out of descriptors.
const RESOURCE_BACKOFF: Duration = Duration::from_millis(50);

/// How long `stop()` waits for the accept loop to drop the listener.
const ACCEPTOR_CLOSE_TIMEOUT: Duration = Duration::from_secs(1);

/// Counts live runtime threads so they can be joined without owning their
/// handles.
///
/// `reserve` holds slots for the workers a runtime is about to spawn, so a
/// thread counts as live before its start hook runs. It stops counting from
/// a thread-local destructor, the last code a runtime thread executes.
#[derive(Default)]
struct WorkerTracker {
    counts: Mutex<WorkerCounts>,
    idle: Condvar,
}

#[derive(Default)]
struct WorkerCounts {
    live: usize,
    reserved: usize,
}

struct WorkerExit(Arc<WorkerTracker>);

impl Drop for WorkerExit {
    fn drop(&mut self) {
        self.0.stopped();
    }
}

thread_local! {
    static WORKER_EXIT: RefCell<Option<WorkerExit>> = const { RefCell::new(None) };
}

impl WorkerTracker {
    fn lock(&self) -> MutexGuard<'_, WorkerCounts> {
        self.counts.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn reserve(&self, threads: usize) {
        let mut counts = self.lock();
        counts.live += threads;
        counts.reserved += threads;
    }

    /// Drops reservations no thread claimed, after a failed runtime build.
    fn release_unclaimed(&self) {
        let mut counts = self.lock();
        let unclaimed = counts.reserved;
        counts.live -= unclaimed;
        counts.reserved = 0;
        if counts.live == 0 {
            self.idle.notify_all();
        }
    }

    fn started(self: &Arc<Self>) {
        {
            let mut counts = self.lock();
            if counts.reserved > 0 {
                counts.reserved -= 1;
            } else {
                counts.live += 1;
            }
        }
        let exit = WorkerExit(self.clone());
        WORKER_EXIT.with(|slot| *slot.borrow_mut() = Some(exit));
    }

    fn stopped(&self) {
        let mut counts = self.lock();
        counts.live = counts.live.saturating_sub(1);
        if counts.live == 0 {
            self.idle.notify_all();
        }
    }

    fn notify(&self) {
        let _counts = self.lock();
        self.idle.notify_all();
    }

    #[cfg(test)]
    fn live(&self) -> usize {
        self.lock().live
    }

    fn wait(&self, running: &AtomicBool) {
        let mut counts = self.lock();
        while running.load(Ordering::Acquire) || counts.live > 0 {
            counts = self.idle.wait(counts).unwrap_or_else(PoisonError::into_inner);
        }
    }
}

/// Blocks every signal on the calling thread until dropped, so threads
/// spawned meanwhile inherit a fully blocked mask.
#[cfg(unix)]
struct SignalMask {
    previous: libc::sigset_t,
}

#[cfg(unix)]
impl SignalMask {
    fn block_all() -> Result<Self> {
        // SAFETY: both sets are initialised before use and only touched here.
        unsafe {
            let mut all: libc::sigset_t = std::mem::zeroed();
            let mut previous: libc::sigset_t = std::mem::zeroed();
            libc::sigfillset(&mut all);
            let rc = libc::pthread_sigmask(libc::SIG_BLOCK, &all, &mut previous);
            if rc != 0 {
                return Err(Error::SignalMask(std::io::Error::from_raw_os_error(rc)));
            }
            Ok(Self { previous })
        }
    }
}

#[cfg(unix)]
impl Drop for SignalMask {
    fn drop(&mut self) {
        // SAFETY: `previous` was filled in by pthread_sigmask.
        let rc = unsafe {
            libc::pthread_sigmask(libc::SIG_SETMASK, &self.previous, std::ptr::null_mut())
        };
        if rc != 0 {
            error!(
                "failed to restore the signal mask: {}",
                std::io::Error::from_raw_os_error(rc)
            );
        }
    }
}

#[derive(Default)]
struct RunState {
    runtime: Option<Runtime>,
    handle: Option<Handle>,
    shutdown: Option<watch::Sender<bool>>,
    acceptor_closed: Option<mpsc::Receiver<()>>,
}

pub struct Server {
    name: String,
    registry: HandlerRegistry,
    default_handler: Option<Arc<dyn AsyncHandler>>,
    not_found_handler: Option<NotFoundHandler>,
    request_filter: Option<Arc<dyn RequestFilter>>,
    response_filter: Option<handler::ResponseFilter>,
    limits: Limits,
    #[cfg(feature = "tls")]
    tls: Option<TlsContext>,
    scheduled_interval: Duration,
    scheduled_commands: Vec<Arc<dyn ScheduledCommand>>,
    guard: ResourceGuard,
    local_addr: Option<SocketAddr>,
    acceptor: Mutex<Option<Box<dyn Acceptor>>>,
    state: Mutex<RunState>,
    running: AtomicBool,
    workers: Arc<WorkerTracker>,
}

impl Server {
    /// Binds a TCP listener on `addr`. Every route is mounted below
    /// `base_uri`.
    pub fn bind(
        name: impl Into<String>,
        base_uri: impl Into<String>,
        addr: SocketAddr,
    ) -> Result<Self> {
        let acceptor = TcpAcceptor::bind(addr, DEFAULT_BACKLOG)?;
        Ok(Self::with_acceptor(name, base_uri, acceptor))
    }

    pub fn with_acceptor(
        name: impl Into<String>,
        base_uri: impl Into<String>,
        acceptor: impl Acceptor,
    ) -> Self {
        let local_addr = acceptor.local_addr();
        let acceptor: Box<dyn Acceptor> = Box::new(acceptor);
        Self {
            name: name.into(),
            registry: HandlerRegistry::new(base_uri),
            default_handler: None,
            not_found_handler: None,
            request_filter: None,
            response_filter: None,
            limits: Limits::default(),
            #[cfg(feature = "tls")]
            tls: None,
            scheduled_interval: scheduler::DEFAULT_INTERVAL,
            scheduled_commands: Vec::new(),
            guard: ResourceGuard::default(),
            local_addr,
            acceptor: Mutex::new(Some(acceptor)),
            state: Mutex::new(RunState::default()),
            running: AtomicBool::new(false),
            workers: Arc::new(WorkerTracker::default()),
        }
    }

    pub fn from_config(config: &ServerConfig) -> Result<Self> {
        let acceptor = TcpAcceptor::bind(config.socket_addr()?, config.backlog)?;
        let mut server = Self::with_acceptor(&config.name, &config.base_uri, acceptor);
        server.set_limits(config.limits());
        server.set_scheduled_command_interval(config.scheduled_interval())?;
        server.set_abort_on_resource_error(config.abort_on_resource_error);
        Ok(server)
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn base_uri(&self) -> &str {
        self.registry.base_uri()
    }

    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.local_addr
    }

    /// Event-loop handle, while running.
    pub fn handle(&self) -> Option<Handle> {
        self.lock_state().handle.clone()
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }

    pub fn scheduled_command_interval(&self) -> Duration {
        self.scheduled_interval
    }

    fn lock_state(&self) -> MutexGuard<'_, RunState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn assert_stopped(&self, what: &str) {
        assert!(!self.is_running(), "{} called while the server is running", what);
    }

    // Registration

    pub fn add_handler<H: AsyncHandler>(&mut self, prefix: &str, handler: H) {
        self.assert_stopped("add_handler");
        self.registry.add(prefix, HandlerFunction::Simple(Arc::new(handler)));
    }

    pub fn add_blocking_handler<H: BlockingHandler>(&mut self, prefix: &str, handler: H) {
        self.assert_stopped("add_blocking_handler");
        self.registry
            .add(prefix, HandlerFunction::Simple(handler::blocking(Arc::new(handler))));
    }

    pub fn add_upload_handler<H: UploadHandler>(&mut self, prefix: &str, handler: H) {
        self.assert_stopped("add_upload_handler");
        self.registry.add(prefix, HandlerFunction::Upload(Arc::new(handler)));
    }

    /// Proxy routes accept any method, extension methods included.
    pub fn add_proxy_handler<H: AsyncHandler>(&mut self, prefix: &str, handler: H) {
        self.assert_stopped("add_proxy_handler");
        self.registry.add(prefix, HandlerFunction::Proxy(Arc::new(handler)));
    }

    pub fn set_default_handler<H: AsyncHandler>(&mut self, handler: H) {
        self.assert_stopped("set_default_handler");
        self.default_handler = Some(Arc::new(handler));
    }

    pub fn set_blocking_default_handler<H: BlockingHandler>(&mut self, handler: H) {
        self.assert_stopped("set_blocking_default_handler");
        self.default_handler = Some(handler::blocking(Arc::new(handler)));
    }

    pub fn set_not_found_handler<F>(&mut self, handler: F)
    where
        F: Fn(&Request, &mut Response) + Send + Sync + 'static,
    {
        self.assert_stopped("set_not_found_handler");
        self.not_found_handler = Some(Arc::new(handler));
    }

    pub fn set_request_filter<F: RequestFilter>(&mut self, filter: F) {
        self.assert_stopped("set_request_filter");
        self.request_filter = Some(Arc::new(filter));
    }

    /// Runs after the `Server` header has been stamped.
    pub fn set_response_filter<F>(&mut self, filter: F)
    where
        F: Fn(&str, &mut Response) + Send + Sync + 'static,
    {
        self.assert_stopped("set_response_filter");
        self.response_filter = Some(Arc::new(filter));
    }

    pub fn set_scheduled_command_interval(&mut self, interval: Duration) -> Result<()> {
        self.assert_stopped("set_scheduled_command_interval");
        if interval.is_zero() {
            return Err(Error::InvalidInterval(interval));
        }
        self.scheduled_interval = interval;
        Ok(())
    }

    pub fn add_scheduled_command(&mut self, command: Arc<dyn ScheduledCommand>) {
        self.assert_stopped("add_scheduled_command");
        self.scheduled_commands.push(command);
    }

    pub fn set_abort_on_resource_error(&mut self, abort: bool) {
        self.assert_stopped("set_abort_on_resource_error");
        self.guard = ResourceGuard::new(abort);
    }

    #[cfg(feature = "tls")]
    pub fn set_tls_context(&mut self, context: TlsContext) {
        self.assert_stopped("set_tls_context");
        self.tls = Some(context);
    }

    pub fn set_limits(&mut self, limits: Limits) {
        self.assert_stopped("set_limits");
        self.limits = limits;
    }

    // Lifecycle

    /// Starts `thread_pool_size` workers on one shared event loop and
    /// returns. Calling it again while running does nothing.
    pub fn run(&self, thread_pool_size: usize) -> Result<()> {
        let mut state = self.lock_state();
        if self.is_running() {
            return Ok(());
        }
        let acceptor = self.take_acceptor()?;

        let runtime = match self.build_runtime(thread_pool_size) {
            Ok(runtime) => runtime,
            Err(e) => {
                error!("failed to start worker threads: {}", e);
                self.restore_acceptor(acceptor);
                return Err(e);
            }
        };
        self.start(runtime.handle(), &mut state, acceptor);
        state.runtime = Some(runtime);

        info!(
            server = %self.name,
            addr = ?self.local_addr,
            threads = thread_pool_size.max(1),
            "server running"
        );
        Ok(())
    }

    /// Runs the event loop on the calling thread until `stop()`.
    pub fn run_single_threaded(&self) -> Result<()> {
        let (runtime, mut shutdown) = {
            let mut state = self.lock_state();
            if self.is_running() {
                return Ok(());
            }
            let acceptor = self.take_acceptor()?;
            let runtime = match tokio::runtime::Builder::new_current_thread()
                .enable_all()
                .build()
            {
                Ok(runtime) => runtime,
                Err(e) => {
                    self.restore_acceptor(acceptor);
                    return Err(Error::ThreadPool(e));
                }
            };
            let shutdown = self.start(runtime.handle(), &mut state, acceptor);
            (runtime, shutdown)
        };

        info!(server = %self.name, addr = ?self.local_addr, "server running on the calling thread");
        runtime.block_on(async {
            let _ = shutdown.wait_for(|stop| *stop).await;
        });
        runtime.shutdown_background();
        self.running.store(false, Ordering::Release);
        self.workers.notify();
        Ok(())
    }

    /// Closes the listener, stops the event loop and marks the server
    /// stopped. In-flight work is abandoned; workers are not joined.
    pub fn stop(&self) {
        let (shutdown, acceptor_closed, runtime) = {
            let mut state = self.lock_state();
            state.handle = None;
            (
                state.shutdown.take(),
                state.acceptor_closed.take(),
                state.runtime.take(),
            )
        };
        let Some(shutdown) = shutdown else {
            return;
        };

        let _ = shutdown.send(true);
        // From inside the event loop the accept task cannot run while we wait.
        if let Some(closed) = acceptor_closed
            && Handle::try_current().is_err()
            && let Err(mpsc::RecvTimeoutError::Timeout) = closed.recv_timeout(ACCEPTOR_CLOSE_TIMEOUT)
        {
            warn!("accept loop did not acknowledge shutdown in time");
        }
        if let Some(runtime) = runtime {
            runtime.shutdown_background();
        }

        self.running.store(false, Ordering::Release);
        self.workers.notify();
        info!(server = %self.name, "server stopped");
    }

    /// Blocks until the server is stopped and every worker thread has
    /// exited.
    pub fn wait_until_stopped(&self) {
        self.workers.wait(&self.running);
        debug!(server = %self.name, "all workers exited");
    }

    fn take_acceptor(&self) -> Result<Box<dyn Acceptor>> {
        self.acceptor
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
            .ok_or(Error::AcceptorConsumed)
    }

    fn restore_acceptor(&self, acceptor: Box<dyn Acceptor>) {
        *self.acceptor.lock().unwrap_or_else(PoisonError::into_inner) = Some(acceptor);
    }

    fn build_runtime(&self, workers: usize) -> Result<Runtime> {
        let workers = workers.max(1);
        let tracker = self.workers.clone();

        #[cfg(unix)]
        let _mask = SignalMask::block_all()?;

        self.workers.reserve(workers);
        let runtime = tokio::runtime::Builder::new_multi_thread()
            .worker_threads(workers)
            .thread_name("rondo-worker")
            .on_thread_start(move || tracker.started())
            .enable_all()
            .build();
        if runtime.is_err() {
            self.workers.release_unclaimed();
        }
        runtime.map_err(Error::ThreadPool)
    }

    fn dispatcher(&self) -> Dispatcher {
        Dispatcher {
            name: self.name.clone(),
            registry: self.registry.clone(),
            default_handler: self.default_handler.clone(),
            not_found_handler: self.not_found_handler.clone(),
            request_filter: self.request_filter.clone(),
            response_filter: self.response_filter.clone(),
            limits: self.limits,
            #[cfg(feature = "tls")]
            tls: self.tls.clone(),
        }
    }

    /// Arms the accept loop and the scheduled command timer on `handle`.
    fn start(
        &self,
        handle: &Handle,
        state: &mut RunState,
        acceptor: Box<dyn Acceptor>,
    ) -> watch::Receiver<bool> {
        self.running.store(true, Ordering::Release);

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let (closed_tx, closed_rx) = mpsc::channel();
        let dispatcher = Arc::new(self.dispatcher());
        let runner = Arc::new(ScheduledCommandRunner::new(
            self.scheduled_interval,
            self.scheduled_commands.clone(),
        ));

        handle.spawn(accept_loop(
            acceptor,
            dispatcher,
            self.guard,
            shutdown_rx.clone(),
            closed_tx,
        ));
        handle.spawn(runner.run(shutdown_rx.clone()));

        state.handle = Some(handle.clone());
        state.shutdown = Some(shutdown_tx);
        state.acceptor_closed = Some(closed_rx);
        shutdown_rx
    }
}

impl Drop for Server {
    fn drop(&mut self) {
        if self.is_running() {
            self.stop();
        }
    }
}

/// Accepts until shutdown, re-arming after every completion.
async fn accept_loop(
    mut acceptor: Box<dyn Acceptor>,
    dispatcher: Arc<Dispatcher>,
    guard: ResourceGuard,
    mut shutdown: watch::Receiver<bool>,
    closed: mpsc::Sender<()>,
) {
    loop {
        tokio::select! {
            biased;
            _ = shutdown.changed() => break,
            result = acceptor.accept() => match result {
                Ok((io, peer)) => {
                    tokio::spawn(connection::serve(dispatcher.clone(), guard, io, peer));
                }
                Err(e) => {
                    if guard.check("accept", &e) == Escalation::Degrade {
                        tokio::time::sleep(RESOURCE_BACKOFF).await;
                    }
                }
            },
        }
    }

    drop(acceptor);
    let _ = closed.send(());
    debug!("listener closed");
}

#[cfg(test)]
mod tests {
    use super::*;

    fn server() -> Server {
        Server::bind("unit", "", "127.0.0.1:0".parse().unwrap()).unwrap()
    }

    #[test]
    fn zero_interval_is_rejected() {
        let mut server = server();
        let err = server
            .set_scheduled_command_interval(Duration::ZERO)
            .unwrap_err();
        assert!(matches!(err, Error::InvalidInterval(_)));
        assert_eq!(server.scheduled_command_interval(), scheduler::DEFAULT_INTERVAL);
    }

    #[test]
    fn run_is_idempotent_and_stop_resets() {
        let server = server();
        server.run(2).unwrap();
        assert!(server.is_running());
        assert!(server.handle().is_some());
        server.run(2).unwrap();

        server.stop();
        server.wait_until_stopped();
        assert!(!server.is_running());
        assert!(server.handle().is_none());
    }

    #[test]
    fn tracker_counts_reserved_threads_until_they_exit() {
        let tracker = Arc::new(WorkerTracker::default());
        tracker.reserve(2);
        assert_eq!(tracker.live(), 2);

        let threads: Vec<_> = (0..2)
            .map(|_| {
                let tracker = tracker.clone();
                std::thread::spawn(move || {
                    std::thread::sleep(Duration::from_millis(50));
                    tracker.started();
                })
            })
            .collect();

        let running = AtomicBool::new(false);
        tracker.wait(&running);
        assert_eq!(tracker.live(), 0);
        for thread in threads {
            thread.join().unwrap();
        }

        // Threads beyond the reservation, such as blocking-pool threads,
        // count themselves.
        let extra = {
            let tracker = tracker.clone();
            std::thread::spawn(move || tracker.started())
        };
        extra.join().unwrap();
        assert_eq!(tracker.live(), 0);
    }

    #[test]
    fn failed_build_releases_unclaimed_reservations() {
        let tracker = Arc::new(WorkerTracker::default());
        tracker.reserve(3);
        tracker.started();
        tracker.release_unclaimed();
        assert_eq!(tracker.live(), 1);
        WORKER_EXIT.with(|slot| slot.borrow_mut().take());
        assert_eq!(tracker.live(), 0);
    }

    #[test]
    fn acceptor_cannot_be_reused_after_stop() {
        let server = server();
        server.run(1).unwrap();
        server.stop();
        server.wait_until_stopped();
        assert!(matches!(server.run(1), Err(Error::AcceptorConsumed)));
    }

    #[test]
    fn stop_without_run_is_a_no_op() {
        let server = server();
        server.stop();
        assert!(!server.is_running());
    }

    #[test]
    fn single_threaded_run_returns_after_stop() {
        let server = Arc::new(server());
        let stopper = server.clone();
        let waiter = std::thread::spawn(move || {
            while !stopper.is_running() {
                std::thread::sleep(Duration::from_millis(5));
            }
            stopper.stop();
        });

        server.run_single_threaded().unwrap();
        waiter.join().unwrap();
        assert!(!server.is_running());
    }
}
