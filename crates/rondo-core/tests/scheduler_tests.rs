use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use rondo_core::{DeferredCommand, Error, PeriodicCommand, ScheduledCommand, Server};

struct Limited {
    runs: AtomicUsize,
    limit: usize,
}

impl ScheduledCommand for Limited {
    fn execute(&self) {
        self.runs.fetch_add(1, Ordering::SeqCst);
    }

    fn finished(&self) -> bool {
        self.runs.load(Ordering::SeqCst) >= self.limit
    }
}

fn server() -> Server {
    Server::bind("sched", "", "127.0.0.1:0".parse().unwrap()).unwrap()
}

#[test]
fn test_finished_command_is_never_executed_again() {
    let limited = Arc::new(Limited {
        runs: AtomicUsize::new(0),
        limit: 3,
    });
    let ticks = Arc::new(AtomicUsize::new(0));

    let mut server = server();
    server
        .set_scheduled_command_interval(Duration::from_millis(20))
        .unwrap();
    server.add_scheduled_command(limited.clone());
    let counter = ticks.clone();
    server.add_scheduled_command(Arc::new(PeriodicCommand::new(Duration::ZERO, move || {
        counter.fetch_add(1, Ordering::SeqCst);
        true
    })));
    server.run(1).unwrap();

    std::thread::sleep(Duration::from_millis(400));
    server.stop();
    server.wait_until_stopped();

    assert_eq!(limited.runs.load(Ordering::SeqCst), 3);
    assert!(ticks.load(Ordering::SeqCst) > 3);
}

#[test]
fn test_deferred_command_runs_once_on_the_event_loop() {
    let fired = Arc::new(AtomicUsize::new(0));
    let mut server = server();
    server
        .set_scheduled_command_interval(Duration::from_millis(10))
        .unwrap();
    let counter = fired.clone();
    server.add_scheduled_command(Arc::new(DeferredCommand::new(
        Duration::from_millis(30),
        move || {
            counter.fetch_add(1, Ordering::SeqCst);
        },
    )));
    server.run(1).unwrap();

    std::thread::sleep(Duration::from_millis(300));
    server.stop();

    assert_eq!(fired.load(Ordering::SeqCst), 1);
}

#[test]
fn test_zero_interval_is_a_configuration_error() {
    let mut server = server();
    assert!(matches!(
        server.set_scheduled_command_interval(Duration::ZERO),
        Err(Error::InvalidInterval(_))
    ));
}

#[test]
fn test_stop_cancels_the_timer() {
    let runs = Arc::new(AtomicUsize::new(0));
    let mut server = server();
    server
        .set_scheduled_command_interval(Duration::from_millis(10))
        .unwrap();
    let counter = runs.clone();
    server.add_scheduled_command(Arc::new(PeriodicCommand::new(Duration::ZERO, move || {
        counter.fetch_add(1, Ordering::SeqCst);
        true
    })));
    server.run(1).unwrap();
    std::thread::sleep(Duration::from_millis(100));
    server.stop();
    server.wait_until_stopped();

    let after_stop = runs.load(Ordering::SeqCst);
    std::thread::sleep(Duration::from_millis(100));
    assert_eq!(runs.load(Ordering::SeqCst), after_stop);
}
