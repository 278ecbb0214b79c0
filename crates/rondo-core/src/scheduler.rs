//! Background commands ticked on a fixed cadence, independent of any
//! connection.

use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::{Duration, Instant};

use tokio::sync::watch;
use tracing::{debug, error};

pub const DEFAULT_INTERVAL: Duration = Duration::from_secs(3);

/// A recurring unit of work. The runner calls `execute` once per tick and
/// drops its reference once `finished` reports `true`.
pub trait ScheduledCommand: Send + Sync {
    fn execute(&self);
    fn finished(&self) -> bool;
}

/// Runs `command` whenever at least `period` has elapsed since its last
/// run. Finished once `command` returns `false`.
pub struct PeriodicCommand {
    period: Duration,
    command: Box<dyn Fn() -> bool + Send + Sync>,
    last_run: Mutex<Option<Instant>>,
    finished: AtomicBool,
}

impl PeriodicCommand {
    pub fn new<F>(period: Duration, command: F) -> Self
    where
        F: Fn() -> bool + Send + Sync + 'static,
    {
        Self {
            period,
            command: Box::new(command),
            last_run: Mutex::new(None),
            finished: AtomicBool::new(false),
        }
    }
}

impl ScheduledCommand for PeriodicCommand {
    fn execute(&self) {
        if self.finished() {
            return;
        }
        let now = Instant::now();
        {
            let mut last_run = self.last_run.lock().unwrap_or_else(PoisonError::into_inner);
            if let Some(last) = *last_run
                && now.duration_since(last) < self.period
            {
                return;
            }
            *last_run = Some(now);
        }
        if !(self.command)() {
            self.finished.store(true, Ordering::Release);
        }
    }

    fn finished(&self) -> bool {
        self.finished.load(Ordering::Acquire)
    }
}

/// Runs `command` once, on the first tick after `delay` has elapsed.
pub struct DeferredCommand {
    due: Instant,
    command: Mutex<Option<Box<dyn FnOnce() + Send>>>,
}

impl DeferredCommand {
    pub fn new<F>(delay: Duration, command: F) -> Self
    where
        F: FnOnce() + Send + 'static,
    {
        Self {
            due: Instant::now() + delay,
            command: Mutex::new(Some(Box::new(command))),
        }
    }
}

impl ScheduledCommand for DeferredCommand {
    fn execute(&self) {
        if Instant::now() < self.due {
            return;
        }
        let command = self
            .command
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(command) = command {
            command();
        }
    }

    fn finished(&self) -> bool {
        self.command
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .is_none()
    }
}

/// Timer-driven runner: wait, execute every live command in registration
/// order, prune the finished ones, rearm.
pub struct ScheduledCommandRunner {
    interval: Duration,
    // Ticks can land on any worker thread.
    commands: Mutex<Vec<Arc<dyn ScheduledCommand>>>,
}

impl ScheduledCommandRunner {
    pub fn new(interval: Duration, commands: Vec<Arc<dyn ScheduledCommand>>) -> Self {
        Self {
            interval,
            commands: Mutex::new(commands),
        }
    }

    pub fn interval(&self) -> Duration {
        self.interval
    }

    pub fn add(&self, command: Arc<dyn ScheduledCommand>) {
        self.lock().push(command);
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Vec<Arc<dyn ScheduledCommand>>> {
        self.commands.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// One timer expiry. A command that panics is logged and dropped.
    ///
    /// Commands run without the list locked, so they may call [`add`](Self::add);
    /// anything added during a tick first runs on the next one.
    pub fn tick(&self) {
        let snapshot: Vec<Arc<dyn ScheduledCommand>> = self.lock().clone();
        let mut panicked: Vec<Arc<dyn ScheduledCommand>> = Vec::new();
        for command in &snapshot {
            if panic::catch_unwind(AssertUnwindSafe(|| command.execute())).is_err() {
                error!("scheduled command panicked; removing it");
                panicked.push(command.clone());
            }
        }

        self.lock().retain(|command| {
            !panicked.iter().any(|p| Arc::ptr_eq(p, command)) && !command.finished()
        });
    }

    /// Ticks until `shutdown` flips (or its sender goes away).
    pub async fn run(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) {
        let start = tokio::time::Instant::now() + self.interval;
        let mut timer = tokio::time::interval_at(start, self.interval);
        timer.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                biased;
                _ = shutdown.changed() => {
                    debug!("scheduled command timer canceled");
                    break;
                }
                _ = timer.tick() => self.tick(),
            }
        }
    }
}
